use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::gateway::{ProgressDoc, RemoteGateway, RemoteProgressDoc};
use crate::model::{Lesson, SyncStatus, User};
use crate::repository::Repository;

/// Engine lifecycle status, published on every completed cycle: `syncing`
/// then exactly one of `idle`/`error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    Syncing,
    Error,
}

/// Connectivity-gated, serialized three-phase sync cycle. At most one
/// cycle runs at a time, guarded by `in_progress`; a concurrent call
/// while one is running is dropped, not queued.
pub struct SyncEngine {
    repository: Arc<Repository>,
    gateway: Arc<dyn RemoteGateway>,
    config: SyncConfig,
    status_tx: watch::Sender<EngineStatus>,
    connectivity_tx: watch::Sender<bool>,
    in_progress: AtomicBool,
    shut_down: AtomicBool,
    conflict_queue: Mutex<Vec<String>>,
}

impl SyncEngine {
    /// Initial state: status=idle, connectivity=offline (overwritten on
    /// the first `set_connectivity` call).
    pub fn new(repository: Arc<Repository>, gateway: Arc<dyn RemoteGateway>, config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            repository,
            gateway,
            config,
            status_tx: watch::channel(EngineStatus::Idle).0,
            connectivity_tx: watch::channel(false).0,
            in_progress: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            conflict_queue: Mutex::new(Vec::new()),
        })
    }

    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity_tx.subscribe()
    }

    /// An offline→online transition schedules exactly one cycle.
    /// Online→offline does not interrupt an in-flight cycle.
    pub fn set_connectivity(self: &Arc<Self>, online: bool) {
        let was_offline = !*self.connectivity_tx.borrow();
        let _ = self.connectivity_tx.send(online);
        if was_offline && online {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.perform_full_sync().await;
            });
        }
    }

    pub async fn trigger_sync(self: &Arc<Self>) {
        self.perform_full_sync().await;
    }

    /// Appends to the private, engine-owned queue. Drained FIFO, only
    /// inside phase C of the next cycle to run.
    pub fn queue_conflict_simulation(&self, progress_id: String) {
        self.conflict_queue
            .lock()
            .expect("conflict queue mutex poisoned")
            .push(progress_id);
    }

    /// Rejects new cycles from here on; an in-flight cycle is allowed to
    /// finish.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    /// One invocation of the Upload → Conflict Injection → Download cycle.
    pub async fn perform_full_sync(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if !*self.connectivity_tx.borrow() {
            return;
        }
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let _ = self.status_tx.send(EngineStatus::Syncing);
        let outcome = self.run_cycle().await;
        let _ = self
            .status_tx
            .send(if outcome.is_ok() { EngineStatus::Idle } else { EngineStatus::Error });
        self.in_progress.store(false, Ordering::SeqCst);
    }

    async fn run_cycle(self: &Arc<Self>) -> Result<(), ()> {
        self.phase_upload().await?;
        self.phase_conflict_simulation().await;
        self.phase_download().await;
        Ok(())
    }

    /// Phase U: drain the pending journal in insertion order. A single
    /// upload failure never aborts the phase.
    async fn phase_upload(&self) -> Result<(), ()> {
        let pending = self
            .repository
            .pending_journal_entries(self.config.max_retry)
            .await
            .map_err(|err| {
                tracing::error!(%err, "phase U: failed to read pending journal");
            })?;

        for entry in pending {
            if entry.retry_count >= self.config.max_retry {
                continue;
            }
            let doc: ProgressDoc = match serde_json::from_str(&entry.payload) {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(%err, entry_id = entry.id, "phase U: malformed journal payload, skipping");
                    continue;
                }
            };
            match self.gateway.upload_progress(doc).await {
                Ok(()) => {
                    if let Err(err) = self.repository.mark_progress_synced(&entry.entity_id).await {
                        tracing::error!(%err, "phase U: failed to mark progress synced");
                    }
                    if let Err(err) = self.repository.delete_journal_entry(entry.id).await {
                        tracing::error!(%err, "phase U: failed to delete journal entry");
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, entry_id = entry.id, "phase U: upload failed, incrementing retry count");
                    if let Err(err) = self
                        .repository
                        .increment_retry_count(entry.id, entry.retry_count)
                        .await
                    {
                        tracing::error!(%err, "phase U: failed to increment retry count");
                    }
                }
            }
        }
        Ok(())
    }

    /// Phase C: FIFO drain of the synthetic-conflict queue. Failures are
    /// logged and swallowed; no retries.
    async fn phase_conflict_simulation(&self) {
        let queued = {
            let mut queue = self.conflict_queue.lock().expect("conflict queue mutex poisoned");
            std::mem::take(&mut *queue)
        };
        for progress_id in queued {
            if let Err(err) = self.gateway.simulate_remote_conflict(&progress_id).await {
                tracing::warn!(%err, progress_id, "phase C: conflict simulation failed");
            }
        }
    }

    /// Phase D: unconditional upsert of users/lessons, LWW routing for
    /// progress. Each of the three fetches fails independently so one
    /// outage doesn't block the other two.
    async fn phase_download(&self) {
        match self.gateway.fetch_users().await {
            Ok(docs) => {
                for doc in docs {
                    match parse_user(doc) {
                        Ok(user) => {
                            if let Err(err) = self.repository.upsert_user(user).await {
                                tracing::error!(%err, "phase D: failed to upsert user");
                            }
                        }
                        Err(reason) => tracing::warn!(reason, "phase D: skipping malformed user document"),
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "phase D: fetch_users failed"),
        }

        match self.gateway.fetch_lessons().await {
            Ok(docs) => {
                for doc in docs {
                    match parse_lesson(doc) {
                        Ok(lesson) => {
                            if let Err(err) = self.repository.upsert_lesson(lesson).await {
                                tracing::error!(%err, "phase D: failed to upsert lesson");
                            }
                        }
                        Err(reason) => tracing::warn!(reason, "phase D: skipping malformed lesson document"),
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "phase D: fetch_lessons failed"),
        }

        match self.gateway.fetch_all_progress().await {
            Ok(docs) => {
                let mut accepted = 0u32;
                for doc in docs {
                    let remote: RemoteProgressDoc = match serde_json::from_value(doc) {
                        Ok(r) => r,
                        Err(err) => {
                            tracing::warn!(%err, "phase D: failed to parse remote progress document");
                            continue;
                        }
                    };
                    match self.repository.upsert_progress_if_newer(remote).await {
                        Ok(true) => accepted += 1,
                        Ok(false) => {}
                        Err(err) => tracing::error!(%err, "phase D: LWW write failed"),
                    }
                }
                tracing::info!(accepted, "phase D: progress download complete");
            }
            Err(err) => tracing::warn!(%err, "phase D: fetch_all_progress failed"),
        }
    }
}

fn parse_user(doc: serde_json::Value) -> Result<User, &'static str> {
    let id = doc.get("id").and_then(|v| v.as_str()).ok_or("missing id")?;
    let display_name = doc
        .get("displayName")
        .and_then(|v| v.as_str())
        .ok_or("missing displayName")?;
    let contact = doc.get("contact").and_then(|v| v.as_str()).unwrap_or_default();
    let updated_at = doc
        .get("updatedAt")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);
    Ok(User {
        id: id.to_string(),
        display_name: display_name.to_string(),
        contact: contact.to_string(),
        updated_at,
        sync_status: SyncStatus::Synced,
    })
}

fn parse_lesson(doc: serde_json::Value) -> Result<Lesson, &'static str> {
    let id = doc.get("id").and_then(|v| v.as_str()).ok_or("missing id")?;
    let title = doc.get("title").and_then(|v| v.as_str()).ok_or("missing title")?;
    let description = doc
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let duration_minutes = doc.get("durationMinutes").and_then(|v| v.as_i64()).unwrap_or(0);
    let updated_at = doc
        .get("updatedAt")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);
    Ok(Lesson {
        id: id.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        duration_minutes,
        updated_at,
        sync_status: SyncStatus::Synced,
    })
}
