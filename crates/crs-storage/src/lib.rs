//! Store boundary for CRS: the entity store contract, an in-memory reference
//! store, the Postgres implementation, and the content-version change feed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;
use uuid::Uuid;

use crs_core::{Class, Client, ContentVersion, ContentVersionDetail, Module, Pathway, Programme};

pub const CRATE_NAME: &str = "crs-storage";

/// Notification channel the migrations wire the content_versions trigger to.
pub const CHANGE_CHANNEL: &str = "content_versions_changed";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return StoreError::Conflict(db.message().to_string());
            }
        }
        StoreError::Backend(err.to_string())
    }
}

/// Find/insert per entity type, keyed by natural identity. Lookup-then-insert
/// is not atomic; concurrent runs rely on the schema's unique constraints
/// surfacing `Conflict` instead of duplicating rows.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_client(&self, client_name: &str) -> Result<Option<Client>, StoreError>;
    async fn insert_client(&self, client: &Client) -> Result<(), StoreError>;

    async fn find_programme(&self, programme_name: &str) -> Result<Option<Programme>, StoreError>;
    async fn insert_programme(&self, programme: &Programme) -> Result<(), StoreError>;

    async fn find_module(
        &self,
        programme_id: Uuid,
        module_name: &str,
    ) -> Result<Option<Module>, StoreError>;
    async fn insert_module(&self, module: &Module) -> Result<(), StoreError>;

    async fn find_class(
        &self,
        module_id: Uuid,
        class_name: &str,
    ) -> Result<Option<Class>, StoreError>;
    async fn insert_class(&self, class: &Class) -> Result<(), StoreError>;

    async fn find_pathway(
        &self,
        client_id: Uuid,
        programme_id: Uuid,
        cohort_name: &str,
    ) -> Result<Option<Pathway>, StoreError>;
    async fn insert_pathway(&self, pathway: &Pathway) -> Result<(), StoreError>;

    async fn find_version(
        &self,
        class_id: Uuid,
        pathway_id: Uuid,
        version_number: &str,
    ) -> Result<Option<ContentVersion>, StoreError>;
    async fn insert_version(&self, version: &ContentVersion) -> Result<(), StoreError>;

    /// The terminal record joined with its ancestor chain in one read.
    async fn fetch_version_detail(
        &self,
        version_id: Uuid,
    ) -> Result<Option<ContentVersionDetail>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

/// One change on the content_versions table. For deletions the code is the
/// one the row carried immediately before it was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub version_id: Uuid,
    pub version_code: String,
}

#[async_trait]
pub trait ChangeFeed: Send {
    /// Next event in receipt order, or None once the feed is closed.
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store

#[derive(Default)]
struct MemoryTables {
    clients: Vec<Client>,
    programmes: Vec<Programme>,
    modules: Vec<Module>,
    classes: Vec<Class>,
    pathways: Vec<Pathway>,
    versions: Vec<ContentVersion>,
    subscribers: Vec<mpsc::UnboundedSender<ChangeEvent>>,
}

impl MemoryTables {
    fn emit(&mut self, event: ChangeEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Reference implementation of the store contract, also the test double.
/// Emits the same change events the Postgres trigger publishes.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self) -> MemoryChangeFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tables.lock().await.subscribers.push(tx);
        MemoryChangeFeed { rx }
    }

    pub async fn client_count(&self) -> usize {
        self.tables.lock().await.clients.len()
    }

    pub async fn programme_count(&self) -> usize {
        self.tables.lock().await.programmes.len()
    }

    pub async fn module_count(&self) -> usize {
        self.tables.lock().await.modules.len()
    }

    pub async fn class_count(&self) -> usize {
        self.tables.lock().await.classes.len()
    }

    pub async fn pathway_count(&self) -> usize {
        self.tables.lock().await.pathways.len()
    }

    pub async fn version_count(&self) -> usize {
        self.tables.lock().await.versions.len()
    }

    pub async fn versions(&self) -> Vec<ContentVersion> {
        self.tables.lock().await.versions.clone()
    }

    pub async fn modules(&self) -> Vec<Module> {
        self.tables.lock().await.modules.clone()
    }

    pub async fn classes(&self) -> Vec<Class> {
        self.tables.lock().await.classes.clone()
    }

    pub async fn pathways(&self) -> Vec<Pathway> {
        self.tables.lock().await.pathways.clone()
    }

    /// Models an external writer touching a version; the reconciliation
    /// engine itself never updates records.
    pub async fn update_version_status(
        &self,
        version_id: Uuid,
        status: &str,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let version = tables
            .versions
            .iter_mut()
            .find(|v| v.version_id == version_id)
            .ok_or_else(|| StoreError::Backend(format!("no version {version_id}")))?;
        version.status = status.to_string();
        let event = ChangeEvent {
            kind: ChangeKind::Updated,
            version_id,
            version_code: version.version_code.clone(),
        };
        tables.emit(event);
        Ok(())
    }

    /// Models an external deletion; the emitted event carries the code the
    /// row held before removal.
    pub async fn delete_version(&self, version_id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let idx = tables
            .versions
            .iter()
            .position(|v| v.version_id == version_id)
            .ok_or_else(|| StoreError::Backend(format!("no version {version_id}")))?;
        let removed = tables.versions.remove(idx);
        tables.emit(ChangeEvent {
            kind: ChangeKind::Deleted,
            version_id,
            version_code: removed.version_code,
        });
        Ok(())
    }

    /// Drops all feed senders so subscribed feeds drain their buffered
    /// events and then report closed.
    pub async fn close_feeds(&self) {
        self.tables.lock().await.subscribers.clear();
    }

    /// Clears every non-terminal table, leaving versions orphaned. Used to
    /// exercise deletion handling when the ancestor chain no longer resolves.
    pub async fn drop_ancestors(&self) {
        let mut tables = self.tables.lock().await;
        tables.clients.clear();
        tables.programmes.clear();
        tables.modules.clear();
        tables.classes.clear();
        tables.pathways.clear();
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn find_client(&self, client_name: &str) -> Result<Option<Client>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .clients
            .iter()
            .find(|c| c.client_name == client_name)
            .cloned())
    }

    async fn insert_client(&self, client: &Client) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables
            .clients
            .iter()
            .any(|c| c.client_name == client.client_name)
        {
            return Err(StoreError::Conflict(format!(
                "clients.client_name = {}",
                client.client_name
            )));
        }
        tables.clients.push(client.clone());
        Ok(())
    }

    async fn find_programme(&self, programme_name: &str) -> Result<Option<Programme>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .programmes
            .iter()
            .find(|p| p.programme_name == programme_name)
            .cloned())
    }

    async fn insert_programme(&self, programme: &Programme) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables
            .programmes
            .iter()
            .any(|p| p.programme_name == programme.programme_name)
        {
            return Err(StoreError::Conflict(format!(
                "programmes.programme_name = {}",
                programme.programme_name
            )));
        }
        tables.programmes.push(programme.clone());
        Ok(())
    }

    async fn find_module(
        &self,
        programme_id: Uuid,
        module_name: &str,
    ) -> Result<Option<Module>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .modules
            .iter()
            .find(|m| m.programme_id == programme_id && m.module_name == module_name)
            .cloned())
    }

    async fn insert_module(&self, module: &Module) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables
            .modules
            .iter()
            .any(|m| m.programme_id == module.programme_id && m.module_name == module.module_name)
        {
            return Err(StoreError::Conflict(format!(
                "modules ({}, {})",
                module.programme_id, module.module_name
            )));
        }
        tables.modules.push(module.clone());
        Ok(())
    }

    async fn find_class(
        &self,
        module_id: Uuid,
        class_name: &str,
    ) -> Result<Option<Class>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .classes
            .iter()
            .find(|c| c.module_id == module_id && c.class_name == class_name)
            .cloned())
    }

    async fn insert_class(&self, class: &Class) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables
            .classes
            .iter()
            .any(|c| c.module_id == class.module_id && c.class_name == class.class_name)
        {
            return Err(StoreError::Conflict(format!(
                "classes ({}, {})",
                class.module_id, class.class_name
            )));
        }
        tables.classes.push(class.clone());
        Ok(())
    }

    async fn find_pathway(
        &self,
        client_id: Uuid,
        programme_id: Uuid,
        cohort_name: &str,
    ) -> Result<Option<Pathway>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .pathways
            .iter()
            .find(|p| {
                p.client_id == client_id
                    && p.programme_id == programme_id
                    && p.cohort_name == cohort_name
            })
            .cloned())
    }

    async fn insert_pathway(&self, pathway: &Pathway) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.pathways.iter().any(|p| {
            p.client_id == pathway.client_id
                && p.programme_id == pathway.programme_id
                && p.cohort_name == pathway.cohort_name
        }) {
            return Err(StoreError::Conflict(format!(
                "client_pathways ({}, {}, {})",
                pathway.client_id, pathway.programme_id, pathway.cohort_name
            )));
        }
        tables.pathways.push(pathway.clone());
        Ok(())
    }

    async fn find_version(
        &self,
        class_id: Uuid,
        pathway_id: Uuid,
        version_number: &str,
    ) -> Result<Option<ContentVersion>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .versions
            .iter()
            .find(|v| {
                v.class_id == class_id
                    && v.pathway_id == pathway_id
                    && v.version_number == version_number
            })
            .cloned())
    }

    async fn insert_version(&self, version: &ContentVersion) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.versions.iter().any(|v| {
            v.class_id == version.class_id
                && v.pathway_id == version.pathway_id
                && v.version_number == version.version_number
        }) {
            return Err(StoreError::Conflict(format!(
                "content_versions ({}, {}, {})",
                version.class_id, version.pathway_id, version.version_number
            )));
        }
        tables.versions.push(version.clone());
        let event = ChangeEvent {
            kind: ChangeKind::Inserted,
            version_id: version.version_id,
            version_code: version.version_code.clone(),
        };
        tables.emit(event);
        Ok(())
    }

    async fn fetch_version_detail(
        &self,
        version_id: Uuid,
    ) -> Result<Option<ContentVersionDetail>, StoreError> {
        let tables = self.tables.lock().await;
        let Some(version) = tables
            .versions
            .iter()
            .find(|v| v.version_id == version_id)
            .cloned()
        else {
            return Ok(None);
        };
        let class = tables
            .classes
            .iter()
            .find(|c| c.class_id == version.class_id)
            .ok_or_else(|| StoreError::Backend(format!("dangling class for {version_id}")))?;
        let module = tables
            .modules
            .iter()
            .find(|m| m.module_id == class.module_id)
            .ok_or_else(|| StoreError::Backend(format!("dangling module for {version_id}")))?;
        let programme = tables
            .programmes
            .iter()
            .find(|p| p.programme_id == module.programme_id)
            .ok_or_else(|| StoreError::Backend(format!("dangling programme for {version_id}")))?;
        let pathway = tables
            .pathways
            .iter()
            .find(|p| p.pathway_id == version.pathway_id)
            .ok_or_else(|| StoreError::Backend(format!("dangling pathway for {version_id}")))?;
        let client = tables
            .clients
            .iter()
            .find(|c| c.client_id == pathway.client_id)
            .ok_or_else(|| StoreError::Backend(format!("dangling client for {version_id}")))?;

        Ok(Some(ContentVersionDetail {
            class_name: class.class_name.clone(),
            class_number: class.class_number,
            module_name: module.module_name.clone(),
            module_number: module.module_number,
            programme_name: programme.programme_name.clone(),
            cohort_name: pathway.cohort_name.clone(),
            client_name: client.client_name.clone(),
            version,
        }))
    }
}

pub struct MemoryChangeFeed {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, StoreError> {
        Ok(self.rx.recv().await)
    }
}

// ---------------------------------------------------------------------------
// Postgres store

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    /// Connectivity probe helpers for the CLI check command.
    pub async fn count_clients(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT count(*) AS total FROM clients")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    pub async fn list_programmes(&self, limit: i64) -> Result<Vec<Programme>, StoreError> {
        let rows = sqlx::query(
            "SELECT programme_id, programme_name, programme_type FROM programmes \
             ORDER BY programme_name LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(programme_from_row).collect()
    }
}

fn client_from_row(row: &PgRow) -> Result<Client, StoreError> {
    Ok(Client {
        client_id: row.try_get("client_id")?,
        client_name: row.try_get("client_name")?,
    })
}

fn programme_from_row(row: &PgRow) -> Result<Programme, StoreError> {
    Ok(Programme {
        programme_id: row.try_get("programme_id")?,
        programme_name: row.try_get("programme_name")?,
        programme_type: row.try_get("programme_type")?,
    })
}

fn module_from_row(row: &PgRow) -> Result<Module, StoreError> {
    Ok(Module {
        module_id: row.try_get("module_id")?,
        programme_id: row.try_get("programme_id")?,
        module_number: row.try_get("module_number")?,
        module_name: row.try_get("module_name")?,
    })
}

fn class_from_row(row: &PgRow) -> Result<Class, StoreError> {
    Ok(Class {
        class_id: row.try_get("class_id")?,
        module_id: row.try_get("module_id")?,
        class_number: row.try_get("class_number")?,
        class_name: row.try_get("class_name")?,
        material_type: row.try_get("material_type")?,
    })
}

fn pathway_from_row(row: &PgRow) -> Result<Pathway, StoreError> {
    Ok(Pathway {
        pathway_id: row.try_get("pathway_id")?,
        client_id: row.try_get("client_id")?,
        programme_id: row.try_get("programme_id")?,
        cohort_name: row.try_get("cohort_name")?,
        status: row.try_get("status")?,
    })
}

fn version_from_row(row: &PgRow) -> Result<ContentVersion, StoreError> {
    Ok(ContentVersion {
        version_id: row.try_get("version_id")?,
        class_id: row.try_get("class_id")?,
        pathway_id: row.try_get("pathway_id")?,
        version_code: row.try_get("version_code")?,
        version_number: row.try_get("version_number")?,
        status: row.try_get("status")?,
        drive_link: row.try_get("drive_link")?,
        delivery_method: row.try_get("delivery_method")?,
        notes: row.try_get("notes")?,
    })
}

#[async_trait]
impl EntityStore for PgStore {
    async fn find_client(&self, client_name: &str) -> Result<Option<Client>, StoreError> {
        let row = sqlx::query("SELECT client_id, client_name FROM clients WHERE client_name = $1")
            .bind(client_name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(client_from_row).transpose()
    }

    async fn insert_client(&self, client: &Client) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO clients (client_id, client_name) VALUES ($1, $2)")
            .bind(client.client_id)
            .bind(&client.client_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_programme(&self, programme_name: &str) -> Result<Option<Programme>, StoreError> {
        let row = sqlx::query(
            "SELECT programme_id, programme_name, programme_type FROM programmes \
             WHERE programme_name = $1",
        )
        .bind(programme_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(programme_from_row).transpose()
    }

    async fn insert_programme(&self, programme: &Programme) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO programmes (programme_id, programme_name, programme_type) \
             VALUES ($1, $2, $3)",
        )
        .bind(programme.programme_id)
        .bind(&programme.programme_name)
        .bind(&programme.programme_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_module(
        &self,
        programme_id: Uuid,
        module_name: &str,
    ) -> Result<Option<Module>, StoreError> {
        let row = sqlx::query(
            "SELECT module_id, programme_id, module_number, module_name FROM modules \
             WHERE programme_id = $1 AND module_name = $2",
        )
        .bind(programme_id)
        .bind(module_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(module_from_row).transpose()
    }

    async fn insert_module(&self, module: &Module) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO modules (module_id, programme_id, module_number, module_name) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(module.module_id)
        .bind(module.programme_id)
        .bind(module.module_number)
        .bind(&module.module_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_class(
        &self,
        module_id: Uuid,
        class_name: &str,
    ) -> Result<Option<Class>, StoreError> {
        let row = sqlx::query(
            "SELECT class_id, module_id, class_number, class_name, material_type FROM classes \
             WHERE module_id = $1 AND class_name = $2",
        )
        .bind(module_id)
        .bind(class_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(class_from_row).transpose()
    }

    async fn insert_class(&self, class: &Class) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO classes (class_id, module_id, class_number, class_name, material_type) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(class.class_id)
        .bind(class.module_id)
        .bind(class.class_number)
        .bind(&class.class_name)
        .bind(&class.material_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_pathway(
        &self,
        client_id: Uuid,
        programme_id: Uuid,
        cohort_name: &str,
    ) -> Result<Option<Pathway>, StoreError> {
        let row = sqlx::query(
            "SELECT pathway_id, client_id, programme_id, cohort_name, status \
             FROM client_pathways \
             WHERE client_id = $1 AND programme_id = $2 AND cohort_name = $3",
        )
        .bind(client_id)
        .bind(programme_id)
        .bind(cohort_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pathway_from_row).transpose()
    }

    async fn insert_pathway(&self, pathway: &Pathway) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO client_pathways (pathway_id, client_id, programme_id, cohort_name, status) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(pathway.pathway_id)
        .bind(pathway.client_id)
        .bind(pathway.programme_id)
        .bind(&pathway.cohort_name)
        .bind(&pathway.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_version(
        &self,
        class_id: Uuid,
        pathway_id: Uuid,
        version_number: &str,
    ) -> Result<Option<ContentVersion>, StoreError> {
        let row = sqlx::query(
            "SELECT version_id, class_id, pathway_id, version_code, version_number, status, \
                    drive_link, delivery_method, notes \
             FROM content_versions \
             WHERE class_id = $1 AND pathway_id = $2 AND version_number = $3",
        )
        .bind(class_id)
        .bind(pathway_id)
        .bind(version_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(version_from_row).transpose()
    }

    async fn insert_version(&self, version: &ContentVersion) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO content_versions \
             (version_id, class_id, pathway_id, version_code, version_number, status, \
              drive_link, delivery_method, notes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(version.version_id)
        .bind(version.class_id)
        .bind(version.pathway_id)
        .bind(&version.version_code)
        .bind(&version.version_number)
        .bind(&version.status)
        .bind(&version.drive_link)
        .bind(&version.delivery_method)
        .bind(&version.notes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_version_detail(
        &self,
        version_id: Uuid,
    ) -> Result<Option<ContentVersionDetail>, StoreError> {
        let row = sqlx::query(
            "SELECT v.version_id, v.class_id, v.pathway_id, v.version_code, v.version_number, \
                    v.status, v.drive_link, v.delivery_method, v.notes, \
                    c.class_name, c.class_number, \
                    m.module_name, m.module_number, \
                    p.programme_name, \
                    cp.cohort_name, \
                    cl.client_name \
             FROM content_versions v \
             JOIN classes c ON c.class_id = v.class_id \
             JOIN modules m ON m.module_id = c.module_id \
             JOIN programmes p ON p.programme_id = m.programme_id \
             JOIN client_pathways cp ON cp.pathway_id = v.pathway_id \
             JOIN clients cl ON cl.client_id = cp.client_id \
             WHERE v.version_id = $1",
        )
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ContentVersionDetail {
            version: version_from_row(&row)?,
            class_name: row.try_get("class_name")?,
            class_number: row.try_get("class_number")?,
            module_name: row.try_get("module_name")?,
            module_number: row.try_get("module_number")?,
            programme_name: row.try_get("programme_name")?,
            cohort_name: row.try_get("cohort_name")?,
            client_name: row.try_get("client_name")?,
        }))
    }
}

/// Change feed over Postgres LISTEN/NOTIFY. The trigger installed by the
/// migrations publishes one JSON payload per content_versions row change.
pub struct PgChangeFeed {
    listener: PgListener,
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    op: String,
    version_id: Uuid,
    version_code: String,
}

impl PgChangeFeed {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let mut listener = PgListener::connect(database_url).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, StoreError> {
        loop {
            let notification = self.listener.recv().await?;
            let payload: ChangePayload = match serde_json::from_str(notification.payload()) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "dropping malformed change payload");
                    continue;
                }
            };
            let kind = match payload.op.as_str() {
                "inserted" => ChangeKind::Inserted,
                "updated" => ChangeKind::Updated,
                "deleted" => ChangeKind::Deleted,
                other => {
                    warn!(op = other, "dropping change payload with unknown op");
                    continue;
                }
            };
            return Ok(Some(ChangeEvent {
                kind,
                version_id: payload.version_id,
                version_code: payload.version_code,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str) -> Client {
        Client {
            client_id: Uuid::new_v4(),
            client_name: name.to_string(),
        }
    }

    async fn seed_chain(store: &MemoryStore) -> ContentVersion {
        let acme = client("Acme");
        store.insert_client(&acme).await.unwrap();
        let programme = Programme {
            programme_id: Uuid::new_v4(),
            programme_name: "Leadership".to_string(),
            programme_type: "Standard".to_string(),
        };
        store.insert_programme(&programme).await.unwrap();
        let module = Module {
            module_id: Uuid::new_v4(),
            programme_id: programme.programme_id,
            module_number: Some(1),
            module_name: "M1".to_string(),
        };
        store.insert_module(&module).await.unwrap();
        let class = Class {
            class_id: Uuid::new_v4(),
            module_id: module.module_id,
            class_number: Some(1),
            class_name: "Intro".to_string(),
            material_type: "Slide Deck".to_string(),
        };
        store.insert_class(&class).await.unwrap();
        let pathway = Pathway {
            pathway_id: Uuid::new_v4(),
            client_id: acme.client_id,
            programme_id: programme.programme_id,
            cohort_name: "Default".to_string(),
            status: "Active".to_string(),
        };
        store.insert_pathway(&pathway).await.unwrap();
        let version = ContentVersion {
            version_id: Uuid::new_v4(),
            class_id: class.class_id,
            pathway_id: pathway.pathway_id,
            version_code: "ACM-M1-INT-v1.0".to_string(),
            version_number: "v1.0".to_string(),
            status: "Open".to_string(),
            drive_link: None,
            delivery_method: "Virtual".to_string(),
            notes: None,
        };
        store.insert_version(&version).await.unwrap();
        version
    }

    #[tokio::test]
    async fn duplicate_identity_insert_is_a_conflict() {
        let store = MemoryStore::new();
        store.insert_client(&client("Acme")).await.unwrap();
        let err = store.insert_client(&client("Acme")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.client_count().await, 1);
    }

    #[tokio::test]
    async fn find_returns_previously_inserted_record() {
        let store = MemoryStore::new();
        let acme = client("Acme");
        store.insert_client(&acme).await.unwrap();
        let found = store.find_client("Acme").await.unwrap().unwrap();
        assert_eq!(found.client_id, acme.client_id);
        assert!(store.find_client("Globex").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn version_detail_joins_the_full_ancestor_chain() {
        let store = MemoryStore::new();
        let version = seed_chain(&store).await;
        let detail = store
            .fetch_version_detail(version.version_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail.client_name, "Acme");
        assert_eq!(detail.programme_name, "Leadership");
        assert_eq!(detail.module_name, "M1");
        assert_eq!(detail.module_number, Some(1));
        assert_eq!(detail.class_name, "Intro");
        assert_eq!(detail.cohort_name, "Default");
        assert_eq!(detail.version.version_code, "ACM-M1-INT-v1.0");
    }

    #[tokio::test]
    async fn change_feed_sees_insert_update_delete_in_order() {
        let store = MemoryStore::new();
        let mut feed = store.subscribe().await;
        let version = seed_chain(&store).await;
        store
            .update_version_status(version.version_id, "Review")
            .await
            .unwrap();
        store.delete_version(version.version_id).await.unwrap();

        let first = feed.next_event().await.unwrap().unwrap();
        assert_eq!(first.kind, ChangeKind::Inserted);
        let second = feed.next_event().await.unwrap().unwrap();
        assert_eq!(second.kind, ChangeKind::Updated);
        let third = feed.next_event().await.unwrap().unwrap();
        assert_eq!(third.kind, ChangeKind::Deleted);
        assert_eq!(third.version_code, "ACM-M1-INT-v1.0");
    }

    #[test]
    fn unknown_change_ops_do_not_deserialize_to_a_kind() {
        let payload: ChangePayload = serde_json::from_str(
            r#"{"op":"truncated","version_id":"00000000-0000-0000-0000-000000000000","version_code":"X"}"#,
        )
        .unwrap();
        assert_eq!(payload.op, "truncated");
    }
}
