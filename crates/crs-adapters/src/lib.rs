//! Sheet source/sink contracts + the HTTP and fixture-first adapters.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crs_core::{SheetExport, SheetRow};

pub const CRATE_NAME: &str = "crs-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("sheet source unavailable: {0}")]
    Unavailable(String),
    #[error("sheet source request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed sheet payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sheet sink request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sheet sink rejected the push: {0}")]
    Rejected(String),
}

/// Fetch side of the external sheet.
#[async_trait]
pub trait SheetSource: Send + Sync {
    /// All rows, in sheet order. A failure here aborts the whole run.
    async fn fetch_rows(&self) -> Result<Vec<SheetRow>, SourceError>;
}

/// Push side of the external sheet, keyed by the version display code.
#[async_trait]
pub trait SheetSink: Send + Sync {
    async fn upsert_row(&self, export: &SheetExport) -> Result<(), SinkError>;
    async fn delete_row(&self, version_code: &str) -> Result<(), SinkError>;
}

/// Response envelope the Apps-Script-style sheet API wraps everything in.
#[derive(Debug, Deserialize)]
struct SheetEnvelope {
    success: bool,
    #[serde(default)]
    data: Vec<JsonValue>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SheetAck {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Parses either the getAllData envelope or a bare row array.
pub fn parse_rows(text: &str) -> Result<Vec<SheetRow>, SourceError> {
    let value: JsonValue =
        serde_json::from_str(text).map_err(|err| SourceError::Malformed(err.to_string()))?;
    if let JsonValue::Array(rows) = &value {
        return Ok(rows.iter().map(row_from_value).collect());
    }
    let envelope: SheetEnvelope =
        serde_json::from_value(value).map_err(|err| SourceError::Malformed(err.to_string()))?;
    if !envelope.success {
        return Err(SourceError::Unavailable(
            envelope
                .message
                .unwrap_or_else(|| "sheet API reported failure".to_string()),
        ));
    }
    Ok(envelope.data.iter().map(row_from_value).collect())
}

pub fn row_from_value(value: &JsonValue) -> SheetRow {
    SheetRow {
        client_name: cell_text(value, "Client Name"),
        programme: cell_text(value, "Programme"),
        cohort: cell_text(value, "Cohort"),
        module_no: cell_text(value, "Module No."),
        module_name: cell_text(value, "Module Name"),
        class_no: cell_text(value, "Class No."),
        class_name: cell_text(value, "Class Name"),
        material_type: cell_text(value, "Type"),
        version: cell_text(value, "Version"),
        status: cell_text(value, "Status"),
        delivery_method: cell_text(value, "Delivery Method"),
        notes: cell_text(value, "Notes"),
        link: cell_text(value, "Link"),
    }
}

/// Sheet cells arrive as strings, numbers or booleans; coerce to a trimmed
/// string and map empty cells to None.
fn cell_text(row: &JsonValue, column: &str) -> Option<String> {
    let text = match row.get(column)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SheetApiConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

/// HTTP adapter for both directions of the sheet API. Fetches retry with
/// exponential backoff; pushes are single-shot (delivery is at-most-once).
pub struct HttpSheetApi {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl HttpSheetApi {
    pub fn new(config: SheetApiConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
            backoff: config.backoff,
        })
    }

    fn action_url(&self, action: &str) -> String {
        format!("{}?action={}", self.base_url, action)
    }

    async fn get_with_retries(&self, url: &str) -> Result<String, SourceError> {
        let mut last_error: Option<SourceError> = None;
        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying sheet fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Unavailable(format!(
                        "http status {status} from sheet API"
                    )));
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying sheet fetch");
                        last_error = Some(err.into());
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| SourceError::Unavailable("sheet fetch retries exhausted".into())))
    }

    async fn post_checked<T: Serialize + Sync>(
        &self,
        action: &str,
        body: &T,
    ) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(self.action_url(action))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SinkError::Rejected(format!(
                "http status {status} from sheet API"
            )));
        }
        let ack: SheetAck = resp.json().await?;
        if !ack.success {
            return Err(SinkError::Rejected(
                ack.message
                    .unwrap_or_else(|| "sheet API reported failure".to_string()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SheetSource for HttpSheetApi {
    async fn fetch_rows(&self) -> Result<Vec<SheetRow>, SourceError> {
        let body = self.get_with_retries(&self.action_url("getAllData")).await?;
        parse_rows(&body)
    }
}

#[async_trait]
impl SheetSink for HttpSheetApi {
    async fn upsert_row(&self, export: &SheetExport) -> Result<(), SinkError> {
        self.post_checked("updateData", export).await
    }

    async fn delete_row(&self, version_code: &str) -> Result<(), SinkError> {
        self.post_checked("deleteData", &serde_json::json!({ "version_code": version_code }))
            .await
    }
}

/// Reads a JSON file shaped like the getAllData response (or a bare row
/// array) — manual-ingestion parity for offline runs and tests.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SheetSource for JsonFileSource {
    async fn fetch_rows(&self) -> Result<Vec<SheetRow>, SourceError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            SourceError::Unavailable(format!("reading {}: {err}", self.path.display()))
        })?;
        parse_rows(&text)
    }
}

/// Fixed in-memory rows, for tests.
pub struct StaticSheetSource {
    rows: Vec<SheetRow>,
}

impl StaticSheetSource {
    pub fn new(rows: Vec<SheetRow>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl SheetSource for StaticSheetSource {
    async fn fetch_rows(&self) -> Result<Vec<SheetRow>, SourceError> {
        Ok(self.rows.clone())
    }
}

/// Captures pushes instead of sending them, for tests.
#[derive(Default)]
pub struct RecordingSink {
    upserts: Mutex<Vec<SheetExport>>,
    deletes: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upserts(&self) -> Vec<SheetExport> {
        self.upserts.lock().await.clone()
    }

    pub async fn deletes(&self) -> Vec<String> {
        self.deletes.lock().await.clone()
    }
}

#[async_trait]
impl SheetSink for RecordingSink {
    async fn upsert_row(&self, export: &SheetExport) -> Result<(), SinkError> {
        self.upserts.lock().await.push(export.clone());
        Ok(())
    }

    async fn delete_row(&self, version_code: &str) -> Result<(), SinkError> {
        self.deletes.lock().await.push(version_code.to_string());
        Ok(())
    }
}

/// Rejects every push, for failure-path tests.
#[derive(Default)]
pub struct RejectingSink;

#[async_trait]
impl SheetSink for RejectingSink {
    async fn upsert_row(&self, _export: &SheetExport) -> Result<(), SinkError> {
        Err(SinkError::Rejected("rejecting sink".to_string()))
    }

    async fn delete_row(&self, _version_code: &str) -> Result<(), SinkError> {
        Err(SinkError::Rejected("rejecting sink".to_string()))
    }
}
