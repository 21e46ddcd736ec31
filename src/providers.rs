use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::{
    ExternalCaller, ExternalRequest, SamplingProvider, SamplingRequest, SamplingResponse, Usage,
};

const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// External calls over HTTP. The payload is sent as a JSON body, except for
/// GET and DELETE where object payloads become query parameters.
pub struct HttpCaller {
    http: Client,
}

impl HttpCaller {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for HttpCaller {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalCaller for HttpCaller {
    fn invoke(&self, request: ExternalRequest) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let call_error = |message: String| WeaverError::ExternalCall {
                endpoint: request.endpoint.clone(),
                message,
            };

            let method = Method::from_bytes(request.method.as_bytes())
                .map_err(|_| call_error(format!("invalid method '{}'", request.method)))?;
            let mut req = self.http.request(method.clone(), &request.endpoint);

            req = match (&method, &request.payload) {
                (_, Value::Null) => req,
                (m, Value::Object(params)) if *m == Method::GET || *m == Method::DELETE => {
                    let query: Vec<(String, String)> = params
                        .iter()
                        .map(|(k, v)| {
                            let v = match v {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            (k.clone(), v)
                        })
                        .collect();
                    req.query(&query)
                }
                (_, payload) => req.json(payload),
            };
            if let Some(ms) = request.timeout_ms {
                req = req.timeout(Duration::from_millis(ms));
            }

            debug!(endpoint = %request.endpoint, method = %method, "External call");
            let response = req.send().await.map_err(|e| call_error(e.to_string()))?;

            let status = response.status();
            let body = response.text().await.map_err(|e| call_error(e.to_string()))?;
            if !status.is_success() {
                return Err(call_error(format!("HTTP {}: {}", status, body)));
            }

            Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
        })
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

// Response types
#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Sampler for OpenAI-compatible chat completion endpoints (OpenAI, Ollama,
/// vLLM, Groq, OpenRouter, ...).
pub struct ChatCompletionSampler {
    http: Client,
    url: String,
    api_key: Option<String>,
}

impl ChatCompletionSampler {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
            api_key,
        }
    }
}

impl SamplingProvider for ChatCompletionSampler {
    fn sample(&self, request: SamplingRequest) -> BoxFuture<'_, Result<SamplingResponse>> {
        Box::pin(async move {
            let mut messages = Vec::new();
            if let Some(system) = request.system {
                messages.push(ChatMessage {
                    role: "system",
                    content: system,
                });
            }
            messages.push(ChatMessage {
                role: "user",
                content: request.prompt,
            });

            let config = request.config;
            let body = ChatRequest {
                model: config.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                messages,
                max_tokens: config.max_tokens,
                temperature: (config.temperature > 0.0).then_some(config.temperature),
            };

            let mut req = self.http.post(&self.url).json(&body);
            if let Some(api_key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
                .send()
                .await
                .map_err(|e| WeaverError::Provider(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(WeaverError::Provider(format!("HTTP {}: {}", status, body)));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| WeaverError::Provider(e.to_string()))?;
            let text = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| WeaverError::Provider("response contained no choices".into()))?;

            Ok(SamplingResponse {
                text,
                model: parsed.model,
                usage: parsed.usage.map(|u| Usage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                }),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_omits_zero_temperature() {
        let body = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage {
                role: "user",
                content: "hi".into(),
            }],
            max_tokens: 16,
            temperature: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn test_chat_response_parses_usage() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"model":"m","choices":[{"message":{"content":"hello"}}],
                "usage":{"prompt_tokens":3,"completion_tokens":1}}"#,
        )
        .unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("hello"));
        assert_eq!(parsed.usage.unwrap().prompt_tokens, 3);
    }

    #[tokio::test]
    async fn test_invalid_method_is_a_call_error() {
        let caller = HttpCaller::new();
        let err = caller
            .invoke(ExternalRequest {
                endpoint: "http://127.0.0.1:9/".into(),
                method: "NOT A METHOD".into(),
                payload: Value::Null,
                timeout_ms: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid method"));
    }
}
