use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::error::{RepositoryError, StorageError};
use crate::gateway::RemoteProgressDoc;
use crate::model::{JournalEntry, Lesson, Progress, SyncStatus, User};
use crate::resolver::{self, Resolution};
use crate::store::Store;

/// Sole write entry point for application logic. Thin facade over
/// [`Store`] that encapsulates the atomic update rule and the LWW write
/// path; every `Store` call is offloaded to the blocking pool so the async
/// caller never blocks its executor thread on SQLite I/O.
pub struct Repository {
    store: Arc<Store>,
}

impl Repository {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&Store) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(StorageError::from)?
            .map_err(RepositoryError::from)
    }

    fn require_non_empty(id: &str, field: &'static str) -> Result<(), RepositoryError> {
        if id.is_empty() {
            return Err(RepositoryError::InvalidArgument(field));
        }
        Ok(())
    }

    /// Compute newId/newPercent/opTag, upsert Progress as `pending`, and
    /// journal exactly one entry, all inside one transaction.
    pub async fn update_progress(
        &self,
        user_id: &str,
        lesson_id: &str,
        increment_by: i32,
    ) -> Result<Progress, RepositoryError> {
        Self::require_non_empty(user_id, "user_id")?;
        Self::require_non_empty(lesson_id, "lesson_id")?;
        let user_id = user_id.to_string();
        let lesson_id = lesson_id.to_string();
        self.blocking(move |store| store.update_progress_tx(&user_id, &lesson_id, increment_by))
            .await
    }

    pub async fn mark_progress_synced(&self, progress_id: &str) -> Result<(), RepositoryError> {
        let id = progress_id.to_string();
        let matched = self.blocking(move |store| store.mark_progress_synced(&id)).await?;
        if !matched {
            tracing::warn!(progress_id, "mark_progress_synced: no matching row");
        }
        Ok(())
    }

    pub async fn delete_journal_entry(&self, id: i64) -> Result<(), RepositoryError> {
        self.blocking(move |store| store.delete_journal_entry(id)).await
    }

    /// Idempotent under spurious retries: caller passes the retry count it
    /// observed, and the store writes `current_count + 1` unconditionally.
    pub async fn increment_retry_count(&self, id: i64, current_count: u32) -> Result<(), RepositoryError> {
        self.blocking(move |store| store.increment_retry_count(id, current_count))
            .await
    }

    /// The LWW write path: look up the local row, hand it to the pure
    /// resolver, and apply whatever it decided, all in one transaction so
    /// the decision is made against a consistent snapshot.
    pub async fn upsert_progress_if_newer(
        &self,
        remote: RemoteProgressDoc,
    ) -> Result<bool, RepositoryError> {
        let (user_id, lesson_id) = match (&remote.user_id, &remote.lesson_id) {
            (Some(u), Some(l)) => (u.clone(), l.clone()),
            _ => {
                tracing::warn!("upsert_progress_if_newer: malformed document, missing userId/lessonId");
                return Ok(false);
            }
        };
        self.blocking(move |store| {
            store.upsert_progress_if_newer_tx(&user_id, &lesson_id, |local| {
                match resolver::resolve(local, &remote) {
                    Resolution::Skip => None,
                    Resolution::Insert { id } => build_row(&remote, id),
                    Resolution::Overwrite { preserve_id } => build_row(&remote, preserve_id),
                }
            })
        })
        .await
    }

    pub async fn upsert_user(&self, user: User) -> Result<(), RepositoryError> {
        self.blocking(move |store| store.upsert_user(user)).await
    }

    pub async fn upsert_lesson(&self, lesson: Lesson) -> Result<(), RepositoryError> {
        self.blocking(move |store| store.upsert_lesson(lesson)).await
    }

    pub async fn pending_journal_entries(&self, max_retry: u32) -> Result<Vec<JournalEntry>, RepositoryError> {
        self.blocking(move |store| store.pending_journal_entries(max_retry)).await
    }

    pub fn watch_users(&self) -> watch::Receiver<Vec<User>> {
        self.store.watch_users()
    }

    pub fn watch_lessons(&self) -> watch::Receiver<Vec<Lesson>> {
        self.store.watch_lessons()
    }

    pub fn watch_progress(&self) -> watch::Receiver<Vec<Progress>> {
        self.store.watch_progress()
    }

    pub fn watch_pending_journal(&self) -> watch::Receiver<Vec<JournalEntry>> {
        self.store.watch_pending_journal()
    }

    pub async fn progress_percent_for(&self, user_id: &str, lesson_id: &str) -> Result<Option<i32>, RepositoryError> {
        let user_id = user_id.to_string();
        let lesson_id = lesson_id.to_string();
        self.blocking(move |store| store.get_progress_by_user_lesson(&user_id, &lesson_id))
            .await
            .map(|p| p.map(|p| p.progress_percent))
    }

    pub async fn sync_status_for(&self, user_id: &str, lesson_id: &str) -> Result<Option<SyncStatus>, RepositoryError> {
        let user_id = user_id.to_string();
        let lesson_id = lesson_id.to_string();
        self.blocking(move |store| store.get_progress_by_user_lesson(&user_id, &lesson_id))
            .await
            .map(|p| p.map(|p| p.sync_status))
    }
}

/// Build the row a resolver decision of Insert/Overwrite writes, preserving
/// `preserve_id` as the row's identity.
fn build_row(remote: &RemoteProgressDoc, preserve_id: String) -> Option<Progress> {
    Some(Progress {
        id: preserve_id,
        user_id: remote.user_id.clone()?,
        lesson_id: remote.lesson_id.clone()?,
        progress_percent: remote.progress_percent?,
        updated_at: remote.updated_at.unwrap_or_else(Utc::now),
        sync_status: SyncStatus::Synced,
    })
}
