//! Forward reconciliation followed by the push-back of the resulting change
//! events, end to end against the in-memory store.

use std::sync::Arc;

use crs_adapters::{RecordingSink, StaticSheetSource};
use crs_core::SheetRow;
use crs_storage::MemoryStore;
use crs_sync::{PushbackService, ReconcilePipeline};

fn row(client: &str, programme: &str, module: &str, class: &str, version: &str) -> SheetRow {
    SheetRow {
        client_name: Some(client.to_string()),
        programme: Some(programme.to_string()),
        module_no: Some("Module 1".to_string()),
        module_name: Some(module.to_string()),
        class_no: Some("Class 1".to_string()),
        class_name: Some(class.to_string()),
        version: Some(version.to_string()),
        ..SheetRow::default()
    }
}

#[tokio::test]
async fn reconcile_then_push_back_round_trips_every_created_version() {
    let store = Arc::new(MemoryStore::new());
    let feed = store.subscribe().await;

    let rows = vec![
        row("Acme", "Leadership", "M1", "Intro", "v1.0"),
        row("Acme", "Leadership", "M1", "Intro", "v2.0"),
        row("Globex", "Sales Excellence", "Negotiation", "Closing", "v1.0"),
    ];
    let summary = ReconcilePipeline::new(Arc::new(StaticSheetSource::new(rows)), store.clone())
        .run_once()
        .await
        .unwrap();
    assert_eq!(summary.versions_created, 3);
    store.close_feeds().await;

    let sink = Arc::new(RecordingSink::new());
    let service = PushbackService::new(store.clone(), sink.clone()).with_workers(4);
    service.run(feed).await.unwrap();

    let upserts = sink.upserts().await;
    assert_eq!(upserts.len(), 3);

    let mut codes: Vec<String> = upserts.iter().map(|e| e.version_code.clone()).collect();
    codes.sort();
    assert_eq!(
        codes,
        vec![
            "ACM-M1-INT-v1.0".to_string(),
            "ACM-M1-INT-v2.0".to_string(),
            "GLO-NEG-CLO-v1.0".to_string(),
        ]
    );

    // Every pushed row is fully populated in the sheet's shape.
    for export in &upserts {
        assert!(!export.client_name.is_empty());
        assert!(!export.programme.is_empty());
        assert_eq!(export.material_type, "Slide Deck");
        assert_eq!(export.delivery_method, "Virtual");
    }
}
