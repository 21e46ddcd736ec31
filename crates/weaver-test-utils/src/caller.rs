use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::{ExternalCaller, ExternalRequest};

enum Response {
    Value(Value, Option<Duration>),
    Error(String),
}

/// An external caller with canned responses per endpoint.
///
/// Unknown endpoints echo `{ endpoint, method, payload }`. Every request is
/// recorded, including ones that fail.
#[derive(Default)]
pub struct RecordingCaller {
    responses: HashMap<String, Response>,
    requests: Mutex<Vec<ExternalRequest>>,
}

impl RecordingCaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, endpoint: impl Into<String>, value: Value) -> Self {
        self.responses.insert(endpoint.into(), Response::Value(value, None));
        self
    }

    pub fn respond_after(
        mut self,
        endpoint: impl Into<String>,
        value: Value,
        delay: Duration,
    ) -> Self {
        self.responses
            .insert(endpoint.into(), Response::Value(value, Some(delay)));
        self
    }

    pub fn fail(mut self, endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        self.responses
            .insert(endpoint.into(), Response::Error(message.into()));
        self
    }

    pub fn requests(&self) -> Vec<ExternalRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.endpoint).collect()
    }
}

impl ExternalCaller for RecordingCaller {
    fn invoke(&self, request: ExternalRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request.clone());
            match self.responses.get(&request.endpoint) {
                Some(Response::Value(value, delay)) => {
                    if let Some(delay) = delay {
                        tokio::time::sleep(*delay).await;
                    }
                    Ok(value.clone())
                }
                Some(Response::Error(message)) => Err(WeaverError::ExternalCall {
                    endpoint: request.endpoint,
                    message: message.clone(),
                }),
                None => Ok(json!({
                    "endpoint": request.endpoint,
                    "method": request.method,
                    "payload": request.payload,
                })),
            }
        })
    }
}
