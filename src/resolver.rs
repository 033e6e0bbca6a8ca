use crate::gateway::RemoteProgressDoc;
use crate::model::Progress;

/// Decision made by [`resolve`]. Carries no I/O; the caller
/// ([`crate::repository::Repository::upsert_progress_if_newer`]) executes
/// whatever write the decision implies.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Malformed document, or remote is not newer than local (tie goes to local).
    Skip,
    /// No local row exists; insert under the remote document's own id.
    Insert { id: String },
    /// Remote is strictly newer; overwrite local values but keep the
    /// local row's id.
    Overwrite { preserve_id: String },
}

/// Pure LWW decision function over `(local, remote)`. `local` is
/// `None` when no row exists yet for the remote document's
/// `(userId, lessonId)` pair.
pub fn resolve(local: Option<&Progress>, remote: &RemoteProgressDoc) -> Resolution {
    let (Some(id), Some(_), Some(_), Some(_), Some(remote_updated_at)) = (
        remote.id.clone(),
        remote.user_id.as_ref(),
        remote.lesson_id.as_ref(),
        remote.progress_percent,
        remote.updated_at,
    ) else {
        tracing::warn!("resolve: skipping malformed remote document (missing field)");
        return Resolution::Skip;
    };

    match local {
        None => Resolution::Insert { id },
        Some(local_row) => {
            if remote_updated_at > local_row.updated_at {
                Resolution::Overwrite {
                    preserve_id: local_row.id.clone(),
                }
            } else {
                // Equality or remote older: tie-break goes to local.
                Resolution::Skip
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncStatus;
    use chrono::{Duration, Utc};

    fn local_row(percent: i32, updated_at: chrono::DateTime<Utc>) -> Progress {
        Progress {
            id: "local-id".into(),
            user_id: "u1".into(),
            lesson_id: "l1".into(),
            progress_percent: percent,
            updated_at,
            sync_status: SyncStatus::Pending,
        }
    }

    fn remote_doc(percent: i32, updated_at: chrono::DateTime<Utc>) -> RemoteProgressDoc {
        RemoteProgressDoc {
            id: Some("remote-id".into()),
            user_id: Some("u1".into()),
            lesson_id: Some("l1".into()),
            progress_percent: Some(percent),
            updated_at: Some(updated_at),
        }
    }

    #[test]
    fn no_local_row_inserts_unconditionally() {
        let now = Utc::now();
        assert_eq!(
            resolve(None, &remote_doc(80, now)),
            Resolution::Insert { id: "remote-id".into() }
        );
    }

    #[test]
    fn strictly_newer_remote_overwrites_preserving_local_id() {
        let t0 = Utc::now();
        let local = local_row(30, t0);
        let remote = remote_doc(80, t0 + Duration::hours(1));
        assert_eq!(
            resolve(Some(&local), &remote),
            Resolution::Overwrite {
                preserve_id: "local-id".into()
            }
        );
    }

    #[test]
    fn older_remote_is_skipped() {
        let t0 = Utc::now();
        let local = local_row(60, t0);
        let remote = remote_doc(40, t0 - Duration::hours(2));
        assert_eq!(resolve(Some(&local), &remote), Resolution::Skip);
    }

    #[test]
    fn equal_timestamp_ties_to_local() {
        let t0 = Utc::now();
        let local = local_row(45, t0);
        let remote = remote_doc(90, t0);
        assert_eq!(resolve(Some(&local), &remote), Resolution::Skip);
    }

    #[test]
    fn missing_field_is_skipped() {
        let mut remote = remote_doc(50, Utc::now());
        remote.lesson_id = None;
        assert_eq!(resolve(None, &remote), Resolution::Skip);
    }
}
