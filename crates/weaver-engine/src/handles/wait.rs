use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use weaver_core::error::{Result, WeaverError};
use weaver_core::types::{HandleStatus, WaitHandle, WaitMode};

use super::registry::{Entries, WaitHandleRegistry};

/// Result of waiting on several handles.
///
/// A timed-out wait is not an error: `resolved` is false and `handles` holds
/// whatever state each handle had reached.
#[derive(Debug, Clone, Serialize)]
pub struct MultiWaitOutcome {
    pub mode: WaitMode,
    /// The mode's condition was met before the caller's timeout.
    pub resolved: bool,
    /// `all`: every handle completed. `any`: some handle completed.
    /// `race`: the first handle to finish completed.
    pub success: bool,
    /// The deciding handle for `any` and `race`.
    pub winner: Option<String>,
    /// Handle snapshots in the order the ids were given.
    pub handles: Vec<WaitHandle>,
}

impl MultiWaitOutcome {
    pub fn statuses(&self) -> HashMap<&str, HandleStatus> {
        self.handles
            .iter()
            .map(|h| (h.id.as_str(), h.status))
            .collect()
    }

    /// Ids still pending when the wait returned. Under `any` and `race` these
    /// keep running; cancel them explicitly if their work is no longer needed.
    pub fn pending(&self) -> Vec<&str> {
        self.handles
            .iter()
            .filter(|h| !h.status.is_terminal())
            .map(|h| h.id.as_str())
            .collect()
    }
}

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How long to sleep before the next poll, or `None` once the caller's
/// deadline has passed. A deadline too far out to represent never passes.
fn next_pause(deadline: Option<Instant>, poll_interval: Duration) -> Option<Duration> {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            (now < deadline).then(|| poll_interval.min(deadline - now))
        }
        None => Some(poll_interval),
    }
}

struct Verdict {
    success: bool,
    winner: Option<String>,
}

impl WaitHandleRegistry {
    /// Poll a handle until it is terminal or `timeout` elapses on the caller's
    /// side. Either way the current snapshot is returned; a caller timeout
    /// leaves the handle itself untouched. `Duration::MAX` waits without a
    /// caller deadline.
    pub async fn wait_for(
        &self,
        id: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<WaitHandle> {
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let handle = self.get(id).await?;
            if handle.status.is_terminal() {
                return Ok(handle);
            }
            let Some(pause) = next_pause(deadline, poll_interval) else {
                debug!(handle_id = %id, "Caller wait elapsed with handle still pending");
                return Ok(handle);
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Wait on several handles under one resolution policy, polling at the
    /// configured interval.
    pub async fn wait_for_multiple(
        &self,
        ids: &[String],
        mode: WaitMode,
        timeout: Duration,
    ) -> Result<MultiWaitOutcome> {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        self.wait_for_multiple_every(ids, mode, poll_interval, timeout)
            .await
    }

    pub async fn wait_for_multiple_every(
        &self,
        ids: &[String],
        mode: WaitMode,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<MultiWaitOutcome> {
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let (verdict, handles) = self.check(ids, mode).await?;
            if let Some(verdict) = verdict {
                debug!(
                    ?mode,
                    success = verdict.success,
                    winner = ?verdict.winner,
                    "Multi-wait resolved"
                );
                return Ok(MultiWaitOutcome {
                    mode,
                    resolved: true,
                    success: verdict.success,
                    winner: verdict.winner,
                    handles,
                });
            }

            let Some(pause) = next_pause(deadline, poll_interval) else {
                return Ok(MultiWaitOutcome {
                    mode,
                    resolved: false,
                    success: false,
                    winner: None,
                    handles,
                });
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Take a consistent snapshot of `ids` and decide whether `mode` is met.
    async fn check(
        &self,
        ids: &[String],
        mode: WaitMode,
    ) -> Result<(Option<Verdict>, Vec<WaitHandle>)> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expired = entries.expire_due(ids, now);

        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            let entry = entries
                .map
                .get(id)
                .ok_or_else(|| WeaverError::HandleNotFound(id.clone()))?;
            handles.push(entry.handle.clone());
        }

        let verdict = decide(&entries, ids, &handles, mode);
        drop(entries);

        for handle in handles.iter().filter(|h| expired.contains(&h.id)) {
            self.announce(handle);
        }
        Ok((verdict, handles))
    }
}

fn decide(
    entries: &Entries,
    ids: &[String],
    handles: &[WaitHandle],
    mode: WaitMode,
) -> Option<Verdict> {
    let all_terminal = handles.iter().all(|h| h.status.is_terminal());
    let earliest = |pred: &dyn Fn(&WaitHandle) -> bool| -> Option<String> {
        ids.iter()
            .zip(handles)
            .filter(|(_, h)| pred(h))
            .filter_map(|(id, _)| entries.map.get(id).and_then(|e| e.resolved_seq).map(|s| (s, id)))
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, id)| id.clone())
    };

    match mode {
        WaitMode::All => all_terminal.then(|| Verdict {
            success: handles.iter().all(|h| h.status == HandleStatus::Completed),
            winner: None,
        }),
        WaitMode::Any => match earliest(&|h| h.status == HandleStatus::Completed) {
            Some(id) => Some(Verdict {
                success: true,
                winner: Some(id),
            }),
            // Nothing left that could still succeed.
            None if all_terminal => Some(Verdict {
                success: false,
                winner: None,
            }),
            None => None,
        },
        WaitMode::Race => {
            if handles.is_empty() {
                return Some(Verdict {
                    success: false,
                    winner: None,
                });
            }
            earliest(&|h| h.status.is_terminal()).map(|id| {
                let success = handles
                    .iter()
                    .any(|h| h.id == id && h.status == HandleStatus::Completed);
                Verdict {
                    success,
                    winner: Some(id),
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use weaver_core::config::HandleConfig;
    use weaver_core::event::EventBus;

    use super::*;

    fn registry() -> Arc<WaitHandleRegistry> {
        let config = HandleConfig {
            poll_interval_ms: 1,
            ..HandleConfig::default()
        };
        Arc::new(WaitHandleRegistry::new(config, Arc::new(EventBus::default())))
    }

    /// H1 completes at t=10, H2 completes at t=20, H3 fails at t=5.
    async fn staggered(reg: &Arc<WaitHandleRegistry>) -> Vec<String> {
        for id in ["h1", "h2", "h3"] {
            reg.create(id, "agent", None, Default::default()).await.unwrap();
        }
        let plan = [("h1", 10, true), ("h2", 20, true), ("h3", 5, false)];
        for (id, at, ok) in plan {
            let reg = reg.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(at)).await;
                if ok {
                    reg.complete(id, json!(id)).await.unwrap();
                } else {
                    reg.fail(id, "exploded").await.unwrap();
                }
            });
        }
        vec!["h1".into(), "h2".into(), "h3".into()]
    }

    fn elapsed_ms(start: Instant) -> u128 {
        start.elapsed().as_millis()
    }

    #[tokio::test(start_paused = true)]
    async fn all_waits_for_last_and_reports_failure() {
        let reg = registry();
        let ids = staggered(&reg).await;
        let start = Instant::now();

        let out = reg
            .wait_for_multiple(&ids, WaitMode::All, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(out.resolved);
        assert!(!out.success, "h3 failed, so `all` must not succeed");
        assert!((20..22).contains(&elapsed_ms(start)));
        assert!(out.pending().is_empty());
        assert_eq!(out.statuses()["h3"], HandleStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn any_resolves_on_first_success() {
        let reg = registry();
        let ids = staggered(&reg).await;
        let start = Instant::now();

        let out = reg
            .wait_for_multiple(&ids, WaitMode::Any, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(out.resolved);
        assert!(out.success);
        assert_eq!(out.winner.as_deref(), Some("h1"));
        assert!((10..12).contains(&elapsed_ms(start)));
        // The slower handle is left alone.
        assert_eq!(out.pending(), vec!["h2"]);
        assert_eq!(reg.get("h2").await.unwrap().status, HandleStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn race_resolves_on_first_terminal_state() {
        let reg = registry();
        let ids = staggered(&reg).await;
        let start = Instant::now();

        let out = reg
            .wait_for_multiple(&ids, WaitMode::Race, Duration::from_secs(1))
            .await
            .unwrap();

        assert!(out.resolved);
        assert!(!out.success);
        assert_eq!(out.winner.as_deref(), Some("h3"));
        assert!((5..7).contains(&elapsed_ms(start)));
    }

    #[tokio::test(start_paused = true)]
    async fn any_with_only_failures_resolves_unsuccessfully() {
        let reg = registry();
        reg.create("a", "agent", None, Default::default()).await.unwrap();
        reg.create("b", "agent", None, Default::default()).await.unwrap();
        reg.fail("a", "x").await.unwrap();
        reg.cancel("b").await.unwrap();

        let out = reg
            .wait_for_multiple(&["a".into(), "b".into()], WaitMode::Any, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(out.resolved);
        assert!(!out.success);
        assert_eq!(out.winner, None);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_wait_timeout_is_not_an_error() {
        let reg = registry();
        reg.create("slow", "agent", None, Default::default()).await.unwrap();

        let out = reg
            .wait_for_multiple(&["slow".into()], WaitMode::All, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(!out.resolved);
        assert!(!out.success);
        assert_eq!(out.pending(), vec!["slow"]);
    }

    #[tokio::test(start_paused = true)]
    async fn race_between_expired_handles_goes_to_earliest_deadline() {
        let reg = registry();
        reg.create("late", "agent", Some(Duration::from_millis(30)), Default::default())
            .await
            .unwrap();
        reg.create("early", "agent", Some(Duration::from_millis(10)), Default::default())
            .await
            .unwrap();

        // Both deadlines pass before the second poll.
        let out = reg
            .wait_for_multiple_every(
                &["late".into(), "early".into()],
                WaitMode::Race,
                Duration::from_millis(100),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert!(out.resolved);
        assert!(!out.success);
        assert_eq!(out.winner.as_deref(), Some("early"));
        assert_eq!(out.statuses()["late"], HandleStatus::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_wait_without_caller_deadline() {
        let reg = registry();
        reg.create("h", "agent", None, Default::default()).await.unwrap();
        let r = reg.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            r.complete("h", json!(1)).await.unwrap();
        });

        let out = reg
            .wait_for_multiple(&["h".into()], WaitMode::All, Duration::MAX)
            .await
            .unwrap();
        assert!(out.resolved);
        assert!(out.success);
    }

    #[tokio::test]
    async fn multi_wait_unknown_id() {
        let reg = registry();
        let err = reg
            .wait_for_multiple(&["ghost".into()], WaitMode::Race, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, WeaverError::HandleNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_returns_pending_on_caller_timeout() {
        let reg = registry();
        reg.create("h", "agent", Some(Duration::from_secs(60)), Default::default())
            .await
            .unwrap();
        let start = Instant::now();

        let h = reg
            .wait_for("h", Duration::from_millis(5), Duration::from_millis(40))
            .await
            .unwrap();
        assert_eq!(h.status, HandleStatus::Pending);
        assert_eq!(elapsed_ms(start), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_observes_handle_deadline() {
        let reg = registry();
        reg.create("h", "agent", Some(Duration::from_millis(25)), Default::default())
            .await
            .unwrap();

        let h = reg
            .wait_for("h", Duration::from_millis(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(h.status, HandleStatus::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_zero_poll_interval_still_advances() {
        let reg = registry();
        reg.create("h", "agent", Some(Duration::from_millis(20)), Default::default())
            .await
            .unwrap();
        let start = Instant::now();

        let h = reg
            .wait_for("h", Duration::ZERO, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(h.status, HandleStatus::Timeout);
        assert!((20..22).contains(&elapsed_ms(start)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_sees_completion() {
        let reg = registry();
        reg.create("h", "agent", None, Default::default()).await.unwrap();
        let r = reg.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            r.complete("h", json!({"ok": true})).await.unwrap();
        });

        let h = reg
            .wait_for("h", Duration::from_millis(5), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(h.status, HandleStatus::Completed);
        assert_eq!(h.result, Some(json!({"ok": true})));
    }
}
