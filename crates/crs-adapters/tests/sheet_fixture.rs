use crs_adapters::{JsonFileSource, SheetSource};

fn fixture_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/sheet_rows.json")
}

#[tokio::test]
async fn fixture_file_rows_parse_with_coercion_and_defaults() {
    let source = JsonFileSource::new(fixture_path());
    let rows = source.fetch_rows().await.unwrap();
    assert_eq!(rows.len(), 3);

    assert_eq!(rows[0].client_name.as_deref(), Some("Acme"));
    assert_eq!(rows[0].version.as_deref(), Some("v1.0"));
    assert!(rows[0].cohort.is_none());
    assert_eq!(rows[0].cohort_or_default(), "Default");

    // Numeric cell coerced to text, empty version falls back to the default.
    assert_eq!(rows[2].module_no.as_deref(), Some("2"));
    assert!(rows[2].version.is_none());
    assert_eq!(rows[2].version_label(), "v1.0");
    assert_eq!(rows[2].cohort.as_deref(), Some("Spring 2025"));
}
