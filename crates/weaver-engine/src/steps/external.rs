use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use weaver_core::error::Result;
use weaver_core::step::ExternalCallStep;
use weaver_core::traits::{ExternalCaller, ExternalRequest};

use crate::context::ExecutionContext;

pub(super) fn request(cfg: &ExternalCallStep, ctx: &ExecutionContext) -> ExternalRequest {
    ExternalRequest {
        endpoint: ctx.render(&cfg.endpoint),
        method: cfg.method.to_uppercase(),
        payload: ctx.render_value(&cfg.payload),
        timeout_ms: cfg.timeout_ms,
    }
}

/// Invoke once. Retrying is the caller implementation's business.
pub(super) fn invoke(
    caller: Arc<dyn ExternalCaller>,
    request: ExternalRequest,
) -> BoxFuture<'static, Result<Value>> {
    Box::pin(async move {
        debug!(endpoint = %request.endpoint, method = %request.method, "External call");
        caller.invoke(request).await
    })
}
