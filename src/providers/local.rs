//! Local CPU fallback provider
//!
//! The terminal rung of the fallback chain: always present, costs
//! nothing, and produces a short deterministic completion on the local
//! machine. Kept intentionally modest so a degraded day still answers.

use async_trait::async_trait;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    FinishReason, GenerationLimits, GenerationOutcome, GenerationRequest, GenerationStream,
    Provider, ProviderDescriptor, ProviderError, StreamDelta, TokenCounts,
};
use crate::classify::estimate_tokens;

/// CPU-bound fallback generator.
pub struct LocalProvider {
    descriptor: ProviderDescriptor,
}

impl LocalProvider {
    pub fn new(descriptor: ProviderDescriptor) -> Self {
        Self { descriptor }
    }

    /// Deterministic template completion over the (sanitized) prompt.
    fn compose(&self, request: &GenerationRequest, limits: &GenerationLimits) -> String {
        let topic: String = request
            .prompt
            .split_whitespace()
            .take(12)
            .collect::<Vec<_>>()
            .join(" ");
        let text = format!(
            "Here is a concise answer produced by the on-host fallback model. \
             Regarding \"{}\": the full-capability backends are unavailable right \
             now, so this response covers the essentials only. Please retry later \
             for a more detailed answer.",
            topic
        );
        let max_chars = (limits
            .max_output_tokens
            .min(self.descriptor.max_output_tokens) as usize)
            .saturating_mul(4);
        if text.len() > max_chars {
            let mut end = max_chars;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text[..end].to_string()
        } else {
            text
        }
    }

    fn outcome(&self, request: &GenerationRequest, limits: &GenerationLimits, latency_ms: u64) -> GenerationOutcome {
        let text = self.compose(request, limits);
        let tokens = TokenCounts {
            prompt: estimate_tokens(&request.prompt),
            output: estimate_tokens(&text),
        };
        GenerationOutcome {
            text,
            finish_reason: FinishReason::Stop,
            tokens,
            latency_ms,
            provider: self.descriptor.name.clone(),
            confidence: self.descriptor.confidence_prior,
            cost_micro: 0,
            error: None,
        }
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        limits: &GenerationLimits,
    ) -> Result<GenerationOutcome, ProviderError> {
        let started = Instant::now();
        // Small jitter keeps latency histograms realistic in dev runs.
        let pause = rand::thread_rng().gen_range(5..25);
        tokio::time::sleep(Duration::from_millis(pause)).await;
        Ok(self.outcome(request, limits, started.elapsed().as_millis() as u64))
    }

    async fn generate_stream(
        &self,
        request: GenerationRequest,
        limits: GenerationLimits,
        cancel: CancellationToken,
    ) -> Result<GenerationStream, ProviderError> {
        let started = Instant::now();
        let outcome = self.outcome(&request, &limits, 0);
        let (tx, rx) = mpsc::channel::<Result<StreamDelta, ProviderError>>(16);
        let provider_name = self.descriptor.name.clone();

        tokio::spawn(async move {
            let words: Vec<String> = outcome
                .text
                .split_inclusive(' ')
                .map(|w| w.to_string())
                .collect();
            let mut emitted = String::new();
            for word in words {
                if cancel.is_cancelled() {
                    let _ = tx
                        .send(Ok(StreamDelta::finished(GenerationOutcome::cancelled(
                            &provider_name,
                        ))))
                        .await;
                    return;
                }
                emitted.push_str(&word);
                let delta = StreamDelta::text(word, estimate_tokens(&emitted));
                if tx.send(Ok(delta)).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            let mut final_outcome = outcome;
            final_outcome.latency_ms = started.elapsed().as_millis() as u64;
            let _ = tx.send(Ok(StreamDelta::finished(final_outcome))).await;
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}
