pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Full, complete upload payload. The repository only ever journals a
/// fully-populated document, so this shape has no optional fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDoc {
    pub id: String,
    pub user_id: String,
    pub lesson_id: String,
    pub progress_percent: i32,
    pub updated_at: DateTime<Utc>,
}

/// Document as downloaded from the remote store. Fields are optional
/// because the wire contract tolerates partial/malformed documents; the
/// resolver's validity gate decides what to do about that, not this type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteProgressDoc {
    pub id: Option<String>,
    pub user_id: Option<String>,
    pub lesson_id: Option<String>,
    pub progress_percent: Option<i32>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The document store the core reconciles against. The core does not
/// prescribe the transport; this trait is the seam a host wires a real
/// implementation into (see [`mock::MockGateway`] for the demo/test one).
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn upload_progress(&self, doc: ProgressDoc) -> Result<(), GatewayError>;

    async fn fetch_all_progress(&self) -> Result<Vec<serde_json::Value>, GatewayError>;

    /// Write a synthetic conflict document: `progressPercent = 100`,
    /// `updatedAt = now + 1h`, merged into the existing keyed document.
    async fn simulate_remote_conflict(&self, progress_id: &str) -> Result<(), GatewayError>;

    async fn fetch_users(&self) -> Result<Vec<serde_json::Value>, GatewayError>;

    async fn fetch_lessons(&self) -> Result<Vec<serde_json::Value>, GatewayError>;
}
