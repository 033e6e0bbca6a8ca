use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::StorageError;
use crate::gateway::ProgressDoc;
use crate::model::{JournalEntry, JournalOp, Lesson, Progress, SyncStatus, User};

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let updated_at: String = row.get(3)?;
    let sync_status: String = row.get(4)?;
    Ok(User {
        id: row.get(0)?,
        display_name: row.get(1)?,
        contact: row.get(2)?,
        updated_at: parse_ts(&updated_at),
        sync_status: SyncStatus::from_str(&sync_status),
    })
}

fn row_to_lesson(row: &Row<'_>) -> rusqlite::Result<Lesson> {
    let updated_at: String = row.get(4)?;
    let sync_status: String = row.get(5)?;
    Ok(Lesson {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        duration_minutes: row.get(3)?,
        updated_at: parse_ts(&updated_at),
        sync_status: SyncStatus::from_str(&sync_status),
    })
}

fn row_to_progress(row: &Row<'_>) -> rusqlite::Result<Progress> {
    let updated_at: String = row.get(4)?;
    let sync_status: String = row.get(5)?;
    Ok(Progress {
        id: row.get(0)?,
        user_id: row.get(1)?,
        lesson_id: row.get(2)?,
        progress_percent: row.get(3)?,
        updated_at: parse_ts(&updated_at),
        sync_status: SyncStatus::from_str(&sync_status),
    })
}

fn row_to_journal_entry(row: &Row<'_>) -> rusqlite::Result<JournalEntry> {
    let op: String = row.get(1)?;
    let retry_count: i64 = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(JournalEntry {
        id: row.get(0)?,
        op: JournalOp::from_str(&op),
        entity_id: row.get(2)?,
        payload: row.get(3)?,
        retry_count: retry_count.max(0) as u32,
        created_at: parse_ts(&created_at),
    })
}

/// Durable local store: the single source of truth for users, lessons,
/// progress, and the outbound sync journal.
///
/// Every write commits transactionally and republishes the affected
/// table's full contents on its `watch` channel before returning, so
/// subscribers always observe commits in commit order with no
/// intermediate state.
pub struct Store {
    conn: Mutex<Connection>,
    users_tx: watch::Sender<Vec<User>>,
    lessons_tx: watch::Sender<Vec<Lesson>>,
    progress_tx: watch::Sender<Vec<Progress>>,
    journal_tx: watch::Sender<Vec<JournalEntry>>,
}

impl Store {
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn open(path: &std::path::Path) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(conn),
            users_tx: watch::channel(Vec::new()).0,
            lessons_tx: watch::channel(Vec::new()).0,
            progress_tx: watch::channel(Vec::new()).0,
            journal_tx: watch::channel(Vec::new()).0,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch(
            r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    contact TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    sync_status TEXT NOT NULL DEFAULT 'pending' CHECK(sync_status IN ('synced','pending','failed'))
);

CREATE TABLE IF NOT EXISTS lessons (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    duration_minutes INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    sync_status TEXT NOT NULL DEFAULT 'pending' CHECK(sync_status IN ('synced','pending','failed'))
);

CREATE TABLE IF NOT EXISTS progress (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    lesson_id TEXT NOT NULL,
    progress_percent INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    sync_status TEXT NOT NULL DEFAULT 'pending' CHECK(sync_status IN ('synced','pending','failed')),
    UNIQUE(user_id, lesson_id)
);

CREATE TABLE IF NOT EXISTS journal_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    op TEXT NOT NULL CHECK(op IN ('createProgress','updateProgress')),
    entity_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_journal_retry ON journal_entries(retry_count, id);
"#,
        )?;
        Ok(())
    }

    // --- internal query helpers, reusable inside and outside a transaction ---

    fn query_all_users(conn: &Connection) -> rusqlite::Result<Vec<User>> {
        let mut stmt = conn.prepare(
            "SELECT id, display_name, contact, updated_at, sync_status FROM users ORDER BY id",
        )?;
        stmt.query_map([], row_to_user)?.collect()
    }

    fn query_all_lessons(conn: &Connection) -> rusqlite::Result<Vec<Lesson>> {
        let mut stmt = conn.prepare(
            "SELECT id, title, description, duration_minutes, updated_at, sync_status FROM lessons ORDER BY id",
        )?;
        stmt.query_map([], row_to_lesson)?.collect()
    }

    fn query_all_progress(conn: &Connection) -> rusqlite::Result<Vec<Progress>> {
        let mut stmt = conn.prepare(
            "SELECT id, user_id, lesson_id, progress_percent, updated_at, sync_status FROM progress ORDER BY id",
        )?;
        stmt.query_map([], row_to_progress)?.collect()
    }

    fn query_all_journal(conn: &Connection) -> rusqlite::Result<Vec<JournalEntry>> {
        let mut stmt = conn.prepare(
            "SELECT id, op, entity_id, payload, retry_count, created_at FROM journal_entries ORDER BY id ASC",
        )?;
        stmt.query_map([], row_to_journal_entry)?.collect()
    }

    fn query_progress_by_user_lesson(
        conn: &Connection,
        user_id: &str,
        lesson_id: &str,
    ) -> rusqlite::Result<Option<Progress>> {
        conn.query_row(
            "SELECT id, user_id, lesson_id, progress_percent, updated_at, sync_status
             FROM progress WHERE user_id=?1 AND lesson_id=?2",
            params![user_id, lesson_id],
            row_to_progress,
        )
        .optional()
    }

    fn query_progress_by_id(conn: &Connection, id: &str) -> rusqlite::Result<Option<Progress>> {
        conn.query_row(
            "SELECT id, user_id, lesson_id, progress_percent, updated_at, sync_status
             FROM progress WHERE id=?1",
            params![id],
            row_to_progress,
        )
        .optional()
    }

    fn upsert_user_stmt(tx: &Transaction<'_>, user: &User) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO users (id, display_name, contact, updated_at, sync_status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                display_name=excluded.display_name,
                contact=excluded.contact,
                updated_at=excluded.updated_at,
                sync_status=excluded.sync_status",
            params![
                user.id,
                user.display_name,
                user.contact,
                user.updated_at.to_rfc3339(),
                user.sync_status.as_str()
            ],
        )?;
        Ok(())
    }

    fn upsert_lesson_stmt(tx: &Transaction<'_>, lesson: &Lesson) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO lessons (id, title, description, duration_minutes, updated_at, sync_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                title=excluded.title,
                description=excluded.description,
                duration_minutes=excluded.duration_minutes,
                updated_at=excluded.updated_at,
                sync_status=excluded.sync_status",
            params![
                lesson.id,
                lesson.title,
                lesson.description,
                lesson.duration_minutes,
                lesson.updated_at.to_rfc3339(),
                lesson.sync_status.as_str()
            ],
        )?;
        Ok(())
    }

    fn upsert_progress_stmt(tx: &Transaction<'_>, progress: &Progress) -> rusqlite::Result<()> {
        tx.execute(
            "INSERT INTO progress (id, user_id, lesson_id, progress_percent, updated_at, sync_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                user_id=excluded.user_id,
                lesson_id=excluded.lesson_id,
                progress_percent=excluded.progress_percent,
                updated_at=excluded.updated_at,
                sync_status=excluded.sync_status",
            params![
                progress.id,
                progress.user_id,
                progress.lesson_id,
                progress.progress_percent,
                progress.updated_at.to_rfc3339(),
                progress.sync_status.as_str()
            ],
        )?;
        Ok(())
    }

    /// `send_replace`, not `send`: `send` drops the value when
    /// receiver_count is 0, which it is until a consumer calls a `watch_*`
    /// method, so a subscriber attaching afterward would see a stale
    /// initial snapshot instead of current table contents.
    fn publish_all(&self, conn: &Connection) -> rusqlite::Result<()> {
        self.users_tx.send_replace(Self::query_all_users(conn)?);
        self.lessons_tx.send_replace(Self::query_all_lessons(conn)?);
        self.progress_tx.send_replace(Self::query_all_progress(conn)?);
        self.journal_tx.send_replace(Self::query_all_journal(conn)?);
        Ok(())
    }

    // --- public capabilities ---

    pub fn upsert_user(&self, user: User) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        Self::upsert_user_stmt(&tx, &user)?;
        tx.commit()?;
        self.publish_all(&conn)?;
        Ok(())
    }

    pub fn upsert_lesson(&self, lesson: Lesson) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        Self::upsert_lesson_stmt(&tx, &lesson)?;
        tx.commit()?;
        self.publish_all(&conn)?;
        Ok(())
    }

    pub fn get_progress_by_user_lesson(
        &self,
        user_id: &str,
        lesson_id: &str,
    ) -> Result<Option<Progress>, StorageError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(Self::query_progress_by_user_lesson(&conn, user_id, lesson_id)?)
    }

    pub fn get_progress_by_id(&self, id: &str) -> Result<Option<Progress>, StorageError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(Self::query_progress_by_id(&conn, id)?)
    }

    /// JournalEntries whose `retry_count < max_retry`, ordered by `id ASC`.
    pub fn pending_journal_entries(&self, max_retry: u32) -> Result<Vec<JournalEntry>, StorageError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, op, entity_id, payload, retry_count, created_at
             FROM journal_entries WHERE retry_count < ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![max_retry], row_to_journal_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Unfiltered journal contents, backing `watch_pending_journal` per the
    /// source's `watchPendingSyncItems` behavior (emits on any change).
    pub fn all_journal_entries(&self) -> Result<Vec<JournalEntry>, StorageError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(Self::query_all_journal(&conn)?)
    }

    pub fn all_users(&self) -> Result<Vec<User>, StorageError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(Self::query_all_users(&conn)?)
    }

    pub fn all_lessons(&self) -> Result<Vec<Lesson>, StorageError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(Self::query_all_lessons(&conn)?)
    }

    pub fn all_progress(&self) -> Result<Vec<Progress>, StorageError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(Self::query_all_progress(&conn)?)
    }

    pub fn delete_journal_entry(&self, id: i64) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM journal_entries WHERE id=?1", params![id])?;
        tx.commit()?;
        self.publish_all(&conn)?;
        Ok(())
    }

    /// Write `current_count + 1`. Callers pass the count they observed so
    /// the write is idempotent under spurious retries.
    pub fn increment_retry_count(&self, id: i64, current_count: u32) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE journal_entries SET retry_count=?1 WHERE id=?2",
            params![current_count as i64 + 1, id],
        )?;
        tx.commit()?;
        self.publish_all(&conn)?;
        Ok(())
    }

    /// A no-match is not an error; caller (the repository) logs a warning.
    pub fn mark_progress_synced(&self, id: &str) -> Result<bool, StorageError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE progress SET sync_status='synced' WHERE id=?1",
            params![id],
        )?;
        tx.commit()?;
        self.publish_all(&conn)?;
        Ok(changed > 0)
    }

    /// The atomic pairing of a Progress upsert with a JournalEntry insert,
    /// committed as one transaction. Never split into two independently
    /// callable operations, or a crash between them would leave a dangling
    /// progress row with no journal entry to push it.
    pub fn update_progress_tx(
        &self,
        user_id: &str,
        lesson_id: &str,
        increment_by: i32,
    ) -> Result<Progress, StorageError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let now = Utc::now();
        let tx = conn.transaction()?;

        let existing = Self::query_progress_by_user_lesson(&tx, user_id, lesson_id)?;
        let (id, op) = match &existing {
            Some(p) => (p.id.clone(), JournalOp::UpdateProgress),
            None => (Uuid::new_v4().to_string(), JournalOp::CreateProgress),
        };
        let base = existing.as_ref().map(|p| p.progress_percent as i64).unwrap_or(0);
        let new_percent = Progress::clamp_percent(base + increment_by as i64);

        let row = Progress {
            id: id.clone(),
            user_id: user_id.to_string(),
            lesson_id: lesson_id.to_string(),
            progress_percent: new_percent,
            updated_at: now,
            sync_status: SyncStatus::Pending,
        };
        Self::upsert_progress_stmt(&tx, &row)?;

        let payload = serde_json::to_string(&ProgressDoc {
            id: row.id.clone(),
            user_id: row.user_id.clone(),
            lesson_id: row.lesson_id.clone(),
            progress_percent: row.progress_percent,
            updated_at: row.updated_at,
        })?;
        tx.execute(
            "INSERT INTO journal_entries (op, entity_id, payload, retry_count, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![op.as_str(), row.id, payload, now.to_rfc3339()],
        )?;

        tx.commit()?;
        self.publish_all(&conn)?;
        Ok(row)
    }

    /// The LWW write path's single transactional primitive. `writer`
    /// decides, from the local row looked up inside this same transaction,
    /// whether and how to write; returns whether an update happened.
    pub fn upsert_progress_if_newer_tx(
        &self,
        user_id: &str,
        lesson_id: &str,
        writer: impl FnOnce(Option<&Progress>) -> Option<Progress>,
    ) -> Result<bool, StorageError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let existing = Self::query_progress_by_user_lesson(&tx, user_id, lesson_id)?;
        let decision = writer(existing.as_ref());
        let updated = match decision {
            Some(row) => {
                Self::upsert_progress_stmt(&tx, &row)?;
                true
            }
            None => false,
        };
        tx.commit()?;
        if updated {
            self.publish_all(&conn)?;
        }
        Ok(updated)
    }

    pub fn watch_users(&self) -> watch::Receiver<Vec<User>> {
        self.users_tx.subscribe()
    }

    pub fn watch_lessons(&self) -> watch::Receiver<Vec<Lesson>> {
        self.lessons_tx.subscribe()
    }

    pub fn watch_progress(&self) -> watch::Receiver<Vec<Progress>> {
        self.progress_tx.subscribe()
    }

    pub fn watch_pending_journal(&self) -> watch::Receiver<Vec<JournalEntry>> {
        self.journal_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_progress_tx_clamps_and_assigns_stable_id() {
        let store = Store::open_in_memory().unwrap();
        let p1 = store.update_progress_tx("u1", "l1", 95).unwrap();
        assert_eq!(p1.progress_percent, 95);
        let p2 = store.update_progress_tx("u1", "l1", 50).unwrap();
        assert_eq!(p2.progress_percent, 100);
        assert_eq!(p2.id, p1.id);
        let p3 = store.update_progress_tx("u1", "l1", -1000).unwrap();
        assert_eq!(p3.progress_percent, 0);
        assert_eq!(p3.id, p1.id);
    }

    #[test]
    fn update_progress_tx_journals_exactly_one_entry_per_call() {
        let store = Store::open_in_memory().unwrap();
        store.update_progress_tx("u1", "l1", 10).unwrap();
        let pending = store.pending_journal_entries(5).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, JournalOp::CreateProgress);
    }

    #[test]
    fn pending_journal_entries_excludes_shelved_entries() {
        let store = Store::open_in_memory().unwrap();
        store.update_progress_tx("u1", "l1", 10).unwrap();
        let entries = store.pending_journal_entries(5).unwrap();
        let id = entries[0].id;
        for n in 0..5 {
            store.increment_retry_count(id, n).unwrap();
        }
        assert!(store.pending_journal_entries(5).unwrap().is_empty());
        assert_eq!(store.all_journal_entries().unwrap().len(), 1);
    }
}
