//! Remote chat-completion backend adapter
//!
//! Speaks an OpenAI-style chat-completions wire protocol over HTTPS with
//! SSE streaming. One instance serves any remote tier (fast, reasoning,
//! advanced); the differences live entirely in the descriptor.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sse::response_to_sse_stream;
use super::{
    cost_micro, estimate_confidence, ErrorKind, FinishReason, GenerationLimits, GenerationOutcome,
    GenerationRequest, GenerationStream, Provider, ProviderDescriptor, ProviderError, StreamDelta,
    TokenCounts,
};
use crate::classify::estimate_tokens;

/// Adapter for one remote backend.
pub struct RemoteProvider {
    client: Client,
    descriptor: ProviderDescriptor,
    api_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_budget_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    /// Some backends self-report an answer-quality score.
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

impl RemoteProvider {
    /// Build from a descriptor, resolving the credential from the
    /// environment variable the descriptor names. Missing credentials are
    /// tolerated at construction so a misconfigured provider degrades to
    /// auth failures instead of failing the whole bootstrap.
    pub fn from_env(descriptor: ProviderDescriptor) -> Result<Self, ProviderError> {
        let api_key = match &descriptor.api_key_env {
            Some(var) => {
                let key = std::env::var(var).ok();
                if key.is_none() {
                    warn!(provider = %descriptor.name, env = %var, "credential not set");
                }
                key
            }
            None => None,
        };
        Ok(Self {
            client: Client::new(),
            descriptor,
            api_key,
        })
    }

    #[cfg(test)]
    pub fn with_key(descriptor: ProviderDescriptor, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            descriptor,
            api_key,
        }
    }

    fn build_headers(&self) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| ProviderError::new(ErrorKind::Auth, format!("bad credential: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    fn request_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.descriptor.endpoint.trim_end_matches('/')
        )
    }

    fn wire_request<'a>(
        &'a self,
        request: &'a GenerationRequest,
        limits: &GenerationLimits,
        stream: bool,
    ) -> WireRequest<'a> {
        WireRequest {
            model: &self.descriptor.model,
            messages: vec![WireMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: limits.max_output_tokens.min(self.descriptor.max_output_tokens),
            stream,
            reasoning_budget_tokens: request.cot_budget_tokens,
        }
    }

    fn map_send_error(&self, error: reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::new(ErrorKind::Timeout, error.to_string())
        } else if error.is_connect() {
            ProviderError::new(ErrorKind::Unavailable, error.to_string())
        } else {
            ProviderError::new(ErrorKind::Unknown, error.to_string())
        }
    }

    fn map_status_error(&self, status: u16, body: &str) -> ProviderError {
        let message = format!("backend returned {}: {}", status, truncate(body, 200));
        match status {
            401 | 403 => ProviderError::new(ErrorKind::Auth, message),
            408 => ProviderError::new(ErrorKind::Timeout, message),
            429 => ProviderError::new(ErrorKind::RateLimited, message),
            500..=599 => ProviderError::new(ErrorKind::Unavailable, message),
            _ => ProviderError::new(ErrorKind::Unknown, message),
        }
    }

    fn map_finish_reason(raw: Option<&str>) -> FinishReason {
        match raw {
            Some("length") | Some("max_tokens") => FinishReason::Length,
            Some("content_filter") => FinishReason::Filtered,
            _ => FinishReason::Stop,
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        text
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    }
}

#[async_trait]
impl Provider for RemoteProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        limits: &GenerationLimits,
    ) -> Result<GenerationOutcome, ProviderError> {
        let headers = self.build_headers()?;
        let body = self.wire_request(request, limits, false);
        let started = Instant::now();

        debug!(provider = %self.descriptor.name, url = %self.request_url(), "dispatching generation");

        let response = self
            .client
            .post(self.request_url())
            .headers(headers)
            .json(&body)
            .timeout(Duration::from_millis(limits.deadline_ms))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(self.map_status_error(status, &text));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::new(ErrorKind::InvalidResponse, e.to_string()))?;

        let latency_ms = started.elapsed().as_millis() as u64;
        let choice = wire.choices.into_iter().next().ok_or_else(|| {
            ProviderError::new(ErrorKind::InvalidResponse, "response carried no choices")
        })?;

        let finish_reason = Self::map_finish_reason(choice.finish_reason.as_deref());
        let text = choice.message.content;
        let tokens = match wire.usage {
            Some(usage) => TokenCounts {
                prompt: usage.prompt_tokens,
                output: usage.completion_tokens,
            },
            None => TokenCounts {
                prompt: estimate_tokens(&request.prompt),
                output: estimate_tokens(&text),
            },
        };
        let confidence = wire
            .confidence
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or_else(|| estimate_confidence(&self.descriptor, &text, finish_reason));

        Ok(GenerationOutcome {
            cost_micro: cost_micro(&self.descriptor, tokens),
            text,
            finish_reason,
            tokens,
            latency_ms,
            provider: self.descriptor.name.clone(),
            confidence,
            error: None,
        })
    }

    async fn generate_stream(
        &self,
        request: GenerationRequest,
        limits: GenerationLimits,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, ProviderError> {
        if !self.descriptor.supports_streaming {
            // Degenerate single-frame stream for non-streaming backends.
            let outcome = self.generate(&request, &limits).await?;
            let deltas = vec![
                Ok(StreamDelta::text(outcome.text.clone(), outcome.tokens.output)),
                Ok(StreamDelta::finished(outcome)),
            ];
            return Ok(Box::pin(futures::stream::iter(deltas)));
        }

        let headers = self.build_headers()?;
        let body = self.wire_request(&request, &limits, true);
        let started = Instant::now();

        let response = self
            .client
            .post(self.request_url())
            .headers(headers)
            .json(&body)
            .timeout(Duration::from_millis(limits.deadline_ms))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(self.map_status_error(status, &text));
        }

        let descriptor = self.descriptor.clone();
        let prompt_tokens = estimate_tokens(&request.prompt);
        let (tx, rx) = mpsc::channel::<Result<StreamDelta, ProviderError>>(32);

        tokio::spawn(async move {
            let mut sse = Box::pin(response_to_sse_stream(response));
            let mut accumulated = String::new();
            let mut finish_reason = FinishReason::Stop;
            let mut usage: Option<WireUsage> = None;
            let mut self_confidence: Option<f64> = None;

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => {
                        // Drop the SSE stream to release the connection.
                        let _ = tx
                            .send(Ok(StreamDelta::finished(GenerationOutcome::cancelled(
                                &descriptor.name,
                            ))))
                            .await;
                        return;
                    }
                    event = sse.next() => event,
                };

                match event {
                    Some(Ok(sse_event)) => {
                        if sse_event.data.trim() == "[DONE]" {
                            break;
                        }
                        let chunk: WireStreamChunk = match serde_json::from_str(&sse_event.data) {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                let _ = tx
                                    .send(Err(ProviderError::new(
                                        ErrorKind::InvalidResponse,
                                        format!("bad stream chunk: {}", e),
                                    )))
                                    .await;
                                return;
                            }
                        };
                        if let Some(u) = chunk.usage {
                            usage = Some(u);
                        }
                        if let Some(c) = chunk.confidence {
                            self_confidence = Some(c);
                        }
                        for choice in chunk.choices {
                            if let Some(reason) = choice.finish_reason.as_deref() {
                                finish_reason = RemoteProvider::map_finish_reason(Some(reason));
                            }
                            if let Some(content) = choice.delta.content {
                                if !content.is_empty() {
                                    accumulated.push_str(&content);
                                    let delta = StreamDelta::text(
                                        content,
                                        estimate_tokens(&accumulated),
                                    );
                                    if tx.send(Ok(delta)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    None => break,
                }
            }

            let tokens = match usage {
                Some(u) => TokenCounts {
                    prompt: u.prompt_tokens,
                    output: u.completion_tokens,
                },
                None => TokenCounts {
                    prompt: prompt_tokens,
                    output: estimate_tokens(&accumulated),
                },
            };
            let confidence = self_confidence
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or_else(|| estimate_confidence(&descriptor, &accumulated, finish_reason));
            let outcome = GenerationOutcome {
                cost_micro: cost_micro(&descriptor, tokens),
                text: accumulated,
                finish_reason,
                tokens,
                latency_ms: started.elapsed().as_millis() as u64,
                provider: descriptor.name.clone(),
                confidence,
                error: None,
            };
            let _ = tx.send(Ok(StreamDelta::finished(outcome))).await;
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ProviderDescriptor {
        ProviderDescriptor {
            name: "fast-remote".to_string(),
            tier: super::super::Tier::Fast,
            cost_per_1k_prompt_micro: 150,
            cost_per_1k_output_micro: 600,
            max_output_tokens: 2048,
            supports_streaming: true,
            confidence_prior: 0.75,
            endpoint: "https://backend.example".to_string(),
            model: "fast-chat-1".to_string(),
            api_key_env: None,
        }
    }

    #[test]
    fn request_url_normalizes_trailing_slash() {
        let mut desc = descriptor();
        desc.endpoint = "https://backend.example/".to_string();
        let provider = RemoteProvider::with_key(desc, None);
        assert_eq!(
            provider.request_url(),
            "https://backend.example/v1/chat/completions"
        );
    }

    #[test]
    fn wire_request_caps_output_tokens_at_descriptor_max() {
        let provider = RemoteProvider::with_key(descriptor(), None);
        let request = GenerationRequest {
            id: uuid::Uuid::new_v4(),
            prompt: "hello".to_string(),
            cot_budget_tokens: None,
        };
        let limits = GenerationLimits {
            max_output_tokens: 9999,
            deadline_ms: 1000,
        };
        let wire = provider.wire_request(&request, &limits, false);
        assert_eq!(wire.max_tokens, 2048);
        assert!(!wire.stream);
    }

    #[test]
    fn status_errors_map_to_kinds() {
        let provider = RemoteProvider::with_key(descriptor(), None);
        assert_eq!(provider.map_status_error(401, "").kind, ErrorKind::Auth);
        assert_eq!(
            provider.map_status_error(429, "").kind,
            ErrorKind::RateLimited
        );
        assert_eq!(
            provider.map_status_error(503, "").kind,
            ErrorKind::Unavailable
        );
        assert!(provider.map_status_error(429, "").retry_safe);
        assert!(!provider.map_status_error(401, "").retry_safe);
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(
            RemoteProvider::map_finish_reason(Some("length")),
            FinishReason::Length
        );
        assert_eq!(
            RemoteProvider::map_finish_reason(Some("content_filter")),
            FinishReason::Filtered
        );
        assert_eq!(
            RemoteProvider::map_finish_reason(Some("stop")),
            FinishReason::Stop
        );
        assert_eq!(RemoteProvider::map_finish_reason(None), FinishReason::Stop);
    }

    #[test]
    fn parses_stream_chunk_shape() {
        let chunk: WireStreamChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"hel"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hel"));
    }
}
