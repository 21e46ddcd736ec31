use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use weaver_core::config::HandleConfig;
use weaver_core::error::{Result, WeaverError};
use weaver_core::event::{EngineEvent, EventBus};
use weaver_core::types::{HandleStatus, WaitHandle};

pub(super) struct Entry {
    pub(super) handle: WaitHandle,
    deadline: Option<Instant>,
    resolved: Option<Instant>,
    /// Position in the global resolution order; lower resolved earlier.
    pub(super) resolved_seq: Option<u64>,
    token: CancellationToken,
}

pub(super) struct Entries {
    pub(super) map: HashMap<String, Entry>,
    next_seq: u64,
}

/// Filter for [`WaitHandleRegistry::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct HandleFilter {
    pub status: Option<HandleStatus>,
    pub kind: Option<String>,
}

impl HandleFilter {
    pub fn status(status: HandleStatus) -> Self {
        Self {
            status: Some(status),
            kind: None,
        }
    }

    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            status: None,
            kind: Some(kind.into()),
        }
    }

    fn matches(&self, handle: &WaitHandle) -> bool {
        self.status.map_or(true, |s| handle.status == s)
            && self.kind.as_deref().map_or(true, |k| handle.kind == k)
    }
}

/// Counts from a single sweeper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub purged: usize,
}

/// Tracks outstanding asynchronous operations.
///
/// Every handle moves from `pending` to exactly one terminal status. Whichever
/// of completion, failure, timeout or cancellation lands first wins; later
/// attempts are silent no-ops. All transitions happen under one lock, so the
/// race between a late callback and the timeout sweep has a single winner.
pub struct WaitHandleRegistry {
    pub(super) entries: Mutex<Entries>,
    pub(super) config: HandleConfig,
    event_bus: Arc<EventBus>,
}

impl WaitHandleRegistry {
    pub fn new(config: HandleConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                next_seq: 0,
            }),
            config,
            event_bus,
        }
    }

    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    /// Create a pending handle under a caller-chosen id.
    ///
    /// `timeout` of `None` applies the configured default; a default of zero
    /// means the handle never times out on its own.
    pub async fn create(
        &self,
        id: impl Into<String>,
        kind: impl Into<String>,
        timeout: Option<Duration>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<WaitHandle> {
        let id = id.into();
        let kind = kind.into();
        let timeout = timeout.or_else(|| {
            (self.config.default_timeout_ms > 0)
                .then(|| Duration::from_millis(self.config.default_timeout_ms))
        });

        let now = Utc::now();
        let handle = WaitHandle {
            id: id.clone(),
            kind: kind.clone(),
            status: HandleStatus::Pending,
            created_at: now,
            timeout_at: timeout
                .and_then(|t| chrono::Duration::from_std(t).ok())
                .map(|t| now + t),
            resolved_at: None,
            result: None,
            error: None,
            metadata,
        };

        {
            let mut entries = self.entries.lock().await;
            if entries.map.contains_key(&id) {
                return Err(WeaverError::HandleExists(id));
            }
            entries.map.insert(
                id.clone(),
                Entry {
                    handle: handle.clone(),
                    deadline: timeout.map(|t| Instant::now() + t),
                    resolved: None,
                    resolved_seq: None,
                    token: CancellationToken::new(),
                },
            );
        }

        debug!(handle_id = %id, kind = %kind, ?timeout, "Wait handle created");
        self.event_bus
            .publish(EngineEvent::HandleCreated { handle_id: id, kind });
        Ok(handle)
    }

    /// Create a pending handle with a generated id.
    pub async fn register(
        &self,
        kind: impl Into<String>,
        timeout: Option<Duration>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<WaitHandle> {
        self.create(Uuid::new_v4().to_string(), kind, timeout, metadata)
            .await
    }

    /// Mark a pending handle completed. Returns false if it was already terminal.
    pub async fn complete(&self, id: &str, result: serde_json::Value) -> Result<bool> {
        self.transition(id, HandleStatus::Completed, Some(result), None)
            .await
    }

    /// Mark a pending handle failed. Returns false if it was already terminal.
    pub async fn fail(&self, id: &str, error: impl Into<String>) -> Result<bool> {
        self.transition(id, HandleStatus::Failed, None, Some(error.into()))
            .await
    }

    /// Cancel a pending handle. Terminal handles are unaffected.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        self.transition(id, HandleStatus::Cancelled, None, None)
            .await
    }

    pub async fn get(&self, id: &str) -> Result<WaitHandle> {
        let mut entries = self.entries.lock().await;
        let expired = entries.expire_if_due(id, Instant::now());
        let handle = entries
            .map
            .get(id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| WeaverError::HandleNotFound(id.to_string()))?;
        drop(entries);

        if expired {
            self.announce(&handle);
        }
        Ok(handle)
    }

    /// Read a handle as its owner. Terminal handles are removed on read.
    pub async fn take(&self, id: &str) -> Result<WaitHandle> {
        let handle = self.get(id).await?;
        if handle.status.is_terminal() {
            self.entries.lock().await.map.remove(id);
        }
        Ok(handle)
    }

    /// Token cancelled when the handle reaches any terminal status. Work bound
    /// to the handle should stop once it fires.
    pub async fn token(&self, id: &str) -> Result<CancellationToken> {
        self.entries
            .lock()
            .await
            .map
            .get(id)
            .map(|e| e.token.clone())
            .ok_or_else(|| WeaverError::HandleNotFound(id.to_string()))
    }

    /// Snapshot of all handles matching `filter`, oldest first.
    pub async fn list(&self, filter: &HandleFilter) -> Vec<WaitHandle> {
        let mut handles: Vec<WaitHandle> = self
            .entries
            .lock()
            .await
            .map
            .values()
            .map(|e| e.handle.clone())
            .filter(|h| filter.matches(h))
            .collect();
        handles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        handles
    }

    /// One sweeper pass: time out expired pending handles and purge terminal
    /// handles older than the retention window.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let retention = Duration::from_millis(self.config.retention_ms);
        let mut timed_out = Vec::new();

        let purged = {
            let mut entries = self.entries.lock().await;
            let ids: Vec<String> = entries.map.keys().cloned().collect();
            for id in entries.expire_due(&ids, now) {
                if let Some(e) = entries.map.get(&id) {
                    timed_out.push(e.handle.clone());
                }
            }

            let before = entries.map.len();
            entries.map.retain(|_, e| match e.resolved {
                Some(at) => now.duration_since(at) < retention,
                None => true,
            });
            before - entries.map.len()
        };

        for handle in &timed_out {
            info!(handle_id = %handle.id, kind = %handle.kind, "Wait handle timed out");
            self.announce(handle);
        }

        SweepReport {
            timed_out: timed_out.len(),
            purged,
        }
    }

    async fn transition(
        &self,
        id: &str,
        status: HandleStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expired = entries.expire_if_due(id, now);

        let entry = entries
            .map
            .get(id)
            .ok_or_else(|| WeaverError::HandleNotFound(id.to_string()))?;

        if entry.handle.status.is_terminal() {
            let current = entry.handle.clone();
            drop(entries);
            debug!(
                handle_id = %id,
                current = %current.status,
                attempted = %status,
                "Ignoring transition on terminal wait handle"
            );
            if expired {
                self.announce(&current);
            }
            return Ok(false);
        }

        entries.resolve(id, status, now, result, error);
        let handle = entries.map.get(id).map(|e| e.handle.clone());
        drop(entries);

        if let Some(handle) = handle {
            self.announce(&handle);
        }
        Ok(true)
    }

    pub(super) fn announce(&self, handle: &WaitHandle) {
        self.event_bus.publish(EngineEvent::HandleResolved {
            handle_id: handle.id.clone(),
            status: handle.status,
        });
    }
}

impl Entries {
    /// Move a pending handle to `timeout` if its deadline has passed.
    pub(super) fn expire_if_due(&mut self, id: &str, now: Instant) -> bool {
        let due = self.map.get(id).is_some_and(|e| {
            e.handle.status == HandleStatus::Pending && e.deadline.is_some_and(|d| d <= now)
        });
        if due {
            self.resolve(id, HandleStatus::Timeout, now, None, None);
        }
        due
    }

    /// Time out every due handle among `ids`, earliest deadline first, so the
    /// resolution order matches the order the deadlines passed. Returns the
    /// ids that expired.
    pub(super) fn expire_due(&mut self, ids: &[String], now: Instant) -> Vec<String> {
        let mut due: Vec<(Instant, &String)> = ids
            .iter()
            .filter_map(|id| {
                let entry = self.map.get(id)?;
                let deadline = entry.deadline?;
                (entry.handle.status == HandleStatus::Pending && deadline <= now)
                    .then_some((deadline, id))
            })
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);

        let mut expired = Vec::with_capacity(due.len());
        for (_, id) in due {
            if self.expire_if_due(id, now) {
                expired.push(id.clone());
            }
        }
        expired
    }

    fn resolve(
        &mut self,
        id: &str,
        status: HandleStatus,
        now: Instant,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let seq = self.next_seq;
        if let Some(entry) = self.map.get_mut(id) {
            self.next_seq += 1;
            entry.handle.status = status;
            entry.handle.resolved_at = Some(Utc::now());
            entry.handle.result = result;
            entry.handle.error = error;
            entry.resolved = Some(now);
            entry.resolved_seq = Some(seq);
            entry.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> WaitHandleRegistry {
        WaitHandleRegistry::new(HandleConfig::default(), Arc::new(EventBus::default()))
    }

    #[tokio::test]
    async fn create_and_complete() {
        let reg = registry();
        let h = reg.create("h1", "agent", None, HashMap::new()).await.unwrap();
        assert_eq!(h.status, HandleStatus::Pending);
        assert!(h.timeout_at.is_some());

        assert!(reg.complete("h1", json!({"text": "done"})).await.unwrap());
        let h = reg.get("h1").await.unwrap();
        assert_eq!(h.status, HandleStatus::Completed);
        assert_eq!(h.result, Some(json!({"text": "done"})));
        assert!(h.resolved_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let reg = registry();
        reg.create("h1", "agent", None, HashMap::new()).await.unwrap();
        let err = reg.create("h1", "agent", None, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, WeaverError::HandleExists(ref id) if id == "h1"));
    }

    #[tokio::test]
    async fn terminal_handles_are_monotonic() {
        let reg = registry();
        reg.create("h", "external_call", None, HashMap::new()).await.unwrap();
        assert!(reg.fail("h", "boom").await.unwrap());

        assert!(!reg.complete("h", json!(1)).await.unwrap());
        assert!(!reg.cancel("h").await.unwrap());
        assert!(!reg.fail("h", "again").await.unwrap());

        let h = reg.get("h").await.unwrap();
        assert_eq!(h.status, HandleStatus::Failed);
        assert_eq!(h.error.as_deref(), Some("boom"));
        assert_eq!(h.result, None);
    }

    #[tokio::test]
    async fn cancel_fires_token() {
        let reg = registry();
        reg.create("h", "agent", None, HashMap::new()).await.unwrap();
        let token = reg.token("h").await.unwrap();
        assert!(!token.is_cancelled());
        assert!(reg.cancel("h").await.unwrap());
        assert!(token.is_cancelled());
        assert_eq!(reg.get("h").await.unwrap().status, HandleStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_handle() {
        let reg = registry();
        assert!(matches!(
            reg.get("ghost").await,
            Err(WeaverError::HandleNotFound(_))
        ));
        assert!(matches!(
            reg.complete("ghost", json!(null)).await,
            Err(WeaverError::HandleNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_times_out_without_any_waiter() {
        let reg = registry();
        reg.create("slow", "agent", Some(Duration::from_millis(50)), HashMap::new())
            .await
            .unwrap();
        reg.create("patient", "agent", Some(Duration::from_secs(60)), HashMap::new())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(51)).await;
        let report = reg.sweep().await;
        assert_eq!(report.timed_out, 1);

        let slow = reg.list(&HandleFilter::status(HandleStatus::Timeout)).await;
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].id, "slow");
        assert_eq!(
            reg.get("patient").await.unwrap().status,
            HandleStatus::Pending
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_completion_after_timeout_is_ignored() {
        let reg = registry();
        reg.create("h", "agent", Some(Duration::from_millis(10)), HashMap::new())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(20)).await;
        reg.sweep().await;

        assert!(!reg.complete("h", json!("late")).await.unwrap());
        let h = reg.get("h").await.unwrap();
        assert_eq!(h.status, HandleStatus::Timeout);
        assert_eq!(h.result, None);
    }

    #[tokio::test(start_paused = true)]
    async fn retention_purges_old_terminal_handles() {
        let config = HandleConfig {
            retention_ms: 100,
            ..HandleConfig::default()
        };
        let reg = WaitHandleRegistry::new(config, Arc::new(EventBus::default()));
        reg.create("done", "agent", None, HashMap::new()).await.unwrap();
        reg.create("open", "agent", None, HashMap::new()).await.unwrap();
        reg.complete("done", json!(true)).await.unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        let report = reg.sweep().await;
        assert_eq!(report.purged, 1);
        assert!(reg.get("done").await.is_err());
        assert!(reg.get("open").await.is_ok());
    }

    #[tokio::test]
    async fn take_removes_terminal_handles_only() {
        let reg = registry();
        reg.create("a", "agent", None, HashMap::new()).await.unwrap();
        assert_eq!(reg.take("a").await.unwrap().status, HandleStatus::Pending);
        assert!(reg.get("a").await.is_ok());

        reg.complete("a", json!(1)).await.unwrap();
        assert_eq!(reg.take("a").await.unwrap().status, HandleStatus::Completed);
        assert!(matches!(
            reg.get("a").await,
            Err(WeaverError::HandleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_status() {
        let reg = registry();
        reg.create("a1", "agent", None, HashMap::new()).await.unwrap();
        reg.create("a2", "agent", None, HashMap::new()).await.unwrap();
        reg.create("x1", "external_call", None, HashMap::new()).await.unwrap();
        reg.complete("a2", json!(null)).await.unwrap();

        assert_eq!(reg.list(&HandleFilter::default()).await.len(), 3);
        assert_eq!(reg.list(&HandleFilter::kind("agent")).await.len(), 2);
        let filter = HandleFilter {
            status: Some(HandleStatus::Pending),
            kind: Some("agent".into()),
        };
        let pending_agents = reg.list(&filter).await;
        assert_eq!(pending_agents.len(), 1);
        assert_eq!(pending_agents[0].id, "a1");
    }

    #[tokio::test]
    async fn resolution_publishes_events() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let reg = WaitHandleRegistry::new(HandleConfig::default(), bus);
        reg.create("h", "agent", None, HashMap::new()).await.unwrap();
        reg.complete("h", json!(1)).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), EngineEvent::HandleCreated { .. }));
        match rx.recv().await.unwrap() {
            EngineEvent::HandleResolved { handle_id, status } => {
                assert_eq!(handle_id, "h");
                assert_eq!(status, HandleStatus::Completed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
