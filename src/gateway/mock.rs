use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::{Map, Value};

use super::{ProgressDoc, RemoteGateway};
use crate::error::GatewayError;

/// In-memory document store used for demos and tests. Honors
/// `simulated_network_delay_ms` and `simulated_failure_percent` from
/// [`crate::config::SyncConfig`] so a cycle against this gateway exercises
/// the same suspension points and retry machinery a real transport would.
pub struct MockGateway {
    progress: Mutex<HashMap<String, Value>>,
    users: Mutex<Vec<Value>>,
    lessons: Mutex<Vec<Value>>,
    delay: Duration,
    failure_source: Mutex<Box<dyn FnMut() -> bool + Send>>,
    upload_count: AtomicUsize,
}

impl MockGateway {
    /// Coin-flip failures at `failure_percent`, the production default.
    pub fn new(delay_ms: u64, failure_percent: u8) -> Self {
        Self::with_failure_source(delay_ms, failure_percent, |pct| {
            Box::new(move || rand::thread_rng().gen_range(0..100) < pct)
        })
    }

    /// Construct from the process-wide tunables directly.
    pub fn from_config(config: &crate::config::SyncConfig) -> Self {
        Self::new(config.simulated_network_delay_ms, config.simulated_failure_percent)
    }

    /// Inject a deterministic failure source (e.g. a fixed schedule) so
    /// scenario tests aren't flaky. `build` receives `failure_percent` in
    /// case the caller's schedule wants to reference it.
    pub fn with_failure_source(
        delay_ms: u64,
        failure_percent: u8,
        build: impl FnOnce(u8) -> Box<dyn FnMut() -> bool + Send>,
    ) -> Self {
        Self {
            progress: Mutex::new(HashMap::new()),
            users: Mutex::new(Vec::new()),
            lessons: Mutex::new(Vec::new()),
            delay: Duration::from_millis(delay_ms),
            failure_source: Mutex::new(build(failure_percent)),
            upload_count: AtomicUsize::new(0),
        }
    }

    /// Number of `upload_progress` calls observed so far, regardless of
    /// whether they succeeded. Test-only observability hook.
    pub fn upload_count(&self) -> usize {
        self.upload_count.load(Ordering::SeqCst)
    }

    /// Always-fail gateway, for retry-cap scenario tests (S5).
    pub fn always_failing(delay_ms: u64) -> Self {
        Self::with_failure_source(delay_ms, 100, |_| Box::new(|| true))
    }

    /// Always-succeed gateway, the common case for scenario setup.
    pub fn always_succeeding(delay_ms: u64) -> Self {
        Self::with_failure_source(delay_ms, 0, |_| Box::new(|| false))
    }

    pub fn seed_users(&self, docs: Vec<Value>) {
        *self.users.lock().expect("mock gateway mutex poisoned") = docs;
    }

    pub fn seed_lessons(&self, docs: Vec<Value>) {
        *self.lessons.lock().expect("mock gateway mutex poisoned") = docs;
    }

    /// Seed or overwrite a remote progress document directly, bypassing
    /// `upload_progress`'s merge semantics. Used to set up scenarios.
    pub fn seed_progress(&self, doc: Value) {
        if let Some(id) = doc.get("id").and_then(Value::as_str) {
            self.progress
                .lock()
                .expect("mock gateway mutex poisoned")
                .insert(id.to_string(), doc);
        }
    }

    fn should_fail(&self) -> bool {
        (self.failure_source.lock().expect("mock gateway mutex poisoned"))()
    }

    fn merge_into(existing: Option<Value>, patch: Map<String, Value>) -> Value {
        let mut out = match existing {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (k, v) in patch {
            out.insert(k, v);
        }
        Value::Object(out)
    }
}

#[async_trait]
impl RemoteGateway for MockGateway {
    async fn upload_progress(&self, doc: ProgressDoc) -> Result<(), GatewayError> {
        self.upload_count.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.should_fail() {
            return Err(GatewayError::new("simulated upload failure"));
        }
        let patch = serde_json::to_value(&doc)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        let mut progress = self.progress.lock().expect("mock gateway mutex poisoned");
        let existing = progress.get(&doc.id).cloned();
        progress.insert(doc.id.clone(), Self::merge_into(existing, patch));
        Ok(())
    }

    async fn fetch_all_progress(&self) -> Result<Vec<Value>, GatewayError> {
        tokio::time::sleep(self.delay).await;
        if self.should_fail() {
            return Err(GatewayError::new("simulated fetch failure"));
        }
        Ok(self
            .progress
            .lock()
            .expect("mock gateway mutex poisoned")
            .values()
            .cloned()
            .collect())
    }

    async fn simulate_remote_conflict(&self, progress_id: &str) -> Result<(), GatewayError> {
        tokio::time::sleep(self.delay).await;
        if self.should_fail() {
            return Err(GatewayError::new("simulated conflict-write failure"));
        }
        let now_plus_hour = Utc::now() + ChronoDuration::hours(1);
        let mut patch = Map::new();
        patch.insert("progressPercent".to_string(), Value::from(100));
        patch.insert(
            "updatedAt".to_string(),
            Value::from(now_plus_hour.to_rfc3339()),
        );
        let mut progress = self.progress.lock().expect("mock gateway mutex poisoned");
        let existing = progress.get(progress_id).cloned();
        progress.insert(progress_id.to_string(), Self::merge_into(existing, patch));
        Ok(())
    }

    async fn fetch_users(&self) -> Result<Vec<Value>, GatewayError> {
        tokio::time::sleep(self.delay).await;
        if self.should_fail() {
            return Err(GatewayError::new("simulated fetch failure"));
        }
        Ok(self.users.lock().expect("mock gateway mutex poisoned").clone())
    }

    async fn fetch_lessons(&self) -> Result<Vec<Value>, GatewayError> {
        tokio::time::sleep(self.delay).await;
        if self.should_fail() {
            return Err(GatewayError::new("simulated fetch failure"));
        }
        Ok(self.lessons.lock().expect("mock gateway mutex poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_merges_leaving_untouched_fields_alone() {
        let gw = MockGateway::always_succeeding(0);
        gw.seed_progress(serde_json::json!({
            "id": "p1",
            "userId": "u1",
            "lessonId": "l1",
            "progressPercent": 10,
            "updatedAt": "2026-01-01T00:00:00Z",
            "extra": "kept"
        }));
        gw.upload_progress(ProgressDoc {
            id: "p1".into(),
            user_id: "u1".into(),
            lesson_id: "l1".into(),
            progress_percent: 50,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
        let all = gw.fetch_all_progress().await.unwrap();
        let doc = all.iter().find(|d| d["id"] == "p1").unwrap();
        assert_eq!(doc["progressPercent"], 50);
        assert_eq!(doc["extra"], "kept");
    }

    #[tokio::test]
    async fn simulate_conflict_only_overwrites_percent_and_timestamp() {
        let gw = MockGateway::always_succeeding(0);
        gw.seed_progress(serde_json::json!({
            "id": "p1",
            "userId": "u1",
            "lessonId": "l1",
            "progressPercent": 10,
            "updatedAt": "2026-01-01T00:00:00Z"
        }));
        gw.simulate_remote_conflict("p1").await.unwrap();
        let all = gw.fetch_all_progress().await.unwrap();
        let doc = all.iter().find(|d| d["id"] == "p1").unwrap();
        assert_eq!(doc["progressPercent"], 100);
        assert_eq!(doc["userId"], "u1");
    }
}
