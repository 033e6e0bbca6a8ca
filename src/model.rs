use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sync-status tag shared by all three domain relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Pending,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "synced" => SyncStatus::Synced,
            "failed" => SyncStatus::Failed,
            _ => SyncStatus::Pending,
        }
    }
}

/// Read-only-after-seeding user row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub contact: String,
    pub updated_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
}

/// Read-only-after-seeding lesson row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    pub title: String,
    pub description: String,
    pub duration_minutes: i64,
    pub updated_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
}

/// Per-user, per-lesson progress. At most one row per (user_id, lesson_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub id: String,
    pub user_id: String,
    pub lesson_id: String,
    pub progress_percent: i32,
    pub updated_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
}

impl Progress {
    /// Clamp to `[0, 100]`; overflow saturates rather than wraps.
    pub fn clamp_percent(value: i64) -> i32 {
        value.clamp(0, 100) as i32
    }
}

/// Operation tag recorded on a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JournalOp {
    CreateProgress,
    UpdateProgress,
}

impl JournalOp {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalOp::CreateProgress => "createProgress",
            JournalOp::UpdateProgress => "updateProgress",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "createProgress" => JournalOp::CreateProgress,
            _ => JournalOp::UpdateProgress,
        }
    }
}

/// A durable, queued local mutation awaiting upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: i64,
    pub op: JournalOp,
    pub entity_id: String,
    pub payload: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}
