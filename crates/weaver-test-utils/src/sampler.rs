use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::{SamplingProvider, SamplingRequest, SamplingResponse};

enum Reply {
    Text(String),
    Error(String),
}

struct Rule {
    needle: String,
    reply: Reply,
    delay: Option<Duration>,
}

/// A sampler answering from a script.
///
/// The first rule whose needle appears in the system prompt or the prompt
/// wins; with no match the prompt is echoed back. Every request is recorded.
#[derive(Default)]
pub struct ScriptedSampler {
    rules: Vec<Rule>,
    requests: Mutex<Vec<SamplingRequest>>,
}

impl ScriptedSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, needle: impl Into<String>, text: impl Into<String>) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            reply: Reply::Text(text.into()),
            delay: None,
        });
        self
    }

    pub fn reply_after(
        mut self,
        needle: impl Into<String>,
        text: impl Into<String>,
        delay: Duration,
    ) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            reply: Reply::Text(text.into()),
            delay: Some(delay),
        });
        self
    }

    pub fn fail(mut self, needle: impl Into<String>, message: impl Into<String>) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            reply: Reply::Error(message.into()),
            delay: None,
        });
        self
    }

    pub fn requests(&self) -> Vec<SamplingRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.prompt).collect()
    }
}

impl SamplingProvider for ScriptedSampler {
    fn sample(&self, request: SamplingRequest) -> BoxFuture<'_, Result<SamplingResponse>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());
            let system = request.system.as_deref().unwrap_or("");
            let haystack = format!("{}\n{}", system, request.prompt);

            let Some(rule) = self.rules.iter().find(|r| haystack.contains(&r.needle)) else {
                return Ok(SamplingResponse::text(request.prompt));
            };
            if let Some(delay) = rule.delay {
                tokio::time::sleep(delay).await;
            }
            match &rule.reply {
                Reply::Text(text) => Ok(SamplingResponse::text(text.clone())),
                Reply::Error(message) => Err(WeaverError::Provider(message.clone())),
            }
        })
    }
}

/// Fails with a retryable provider error a fixed number of times, then
/// answers `"ok"`.
pub struct FlakySampler {
    remaining_failures: AtomicU32,
    error: String,
    calls: AtomicU32,
}

impl FlakySampler {
    pub fn new(failures: u32, error: impl Into<String>) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            error: error.into(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SamplingProvider for FlakySampler {
    fn sample(&self, _request: SamplingRequest) -> BoxFuture<'_, Result<SamplingResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                Err(WeaverError::Provider(self.error.clone()))
            } else {
                Ok(SamplingResponse::text("ok"))
            }
        })
    }
}
