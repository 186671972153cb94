//! ReferenceEngine - deterministic built-in engine
//!
//! Produces a pseudo-random but reproducible word sequence seeded from the
//! model and prompt. It binds to any backend and needs no native library,
//! which makes it the engine of choice for smoke tests and CI machines.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use kiln_kernel::engine::{
    EngineModel, EngineOutput, FinishReason, GenerationConfig, InferenceEngine, TokenChunk, TokenStream,
};
use kiln_kernel::loader::LoadedModel;
use kiln_kernel::model::ModelFormat;
use kiln_kernel::{ComputeBackend, RuntimeResult};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const VOCABULARY: &[&str] = &[
    "the", "model", "runs", "on", "local", "hardware", "and", "answers", "with", "a", "short", "reply",
    "kiln", "keeps", "cool", "under", "load", "tokens", "flow", "steadily", "through", "each", "backend",
    "quietly", ".",
];

struct ReferenceModel {
    id: String,
    seed: u64,
}

/// Deterministic engine usable on every backend.
#[derive(Debug, Clone)]
pub struct ReferenceEngine {
    name: String,
    backend: ComputeBackend,
    formats: Vec<ModelFormat>,
    token_latency: Option<Duration>,
}

impl ReferenceEngine {
    pub fn new(backend: ComputeBackend) -> Self {
        Self {
            name: format!("reference-{backend}"),
            backend,
            formats: ModelFormat::ALL.to_vec(),
            token_latency: None,
        }
    }

    /// Restrict the formats this engine accepts.
    pub fn with_formats(mut self, formats: &[ModelFormat]) -> Self {
        self.formats = formats.to_vec();
        self
    }

    /// Sleep this long before each token.
    pub fn with_token_latency(mut self, latency: Duration) -> Self {
        self.token_latency = Some(latency);
        self
    }
}

/// xorshift64*
fn next_word(state: &mut u64) -> &'static str {
    *state ^= *state >> 12;
    *state ^= *state << 25;
    *state ^= *state >> 27;
    let r = state.wrapping_mul(0x2545_F491_4F6C_DD1D);
    VOCABULARY[(r >> 33) as usize % VOCABULARY.len()]
}

fn seed_for(model_seed: u64, prompt: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    model_seed.hash(&mut hasher);
    prompt.hash(&mut hasher);
    hasher.finish() | 1
}

fn token_text(index: u32, word: &str) -> String {
    if index == 0 { word.to_string() } else { format!(" {word}") }
}

#[async_trait]
impl InferenceEngine for ReferenceEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> ComputeBackend {
        self.backend
    }

    fn supports(&self, format: ModelFormat) -> bool {
        self.formats.contains(&format)
    }

    async fn load_into(&self, model: &LoadedModel) -> RuntimeResult<EngineModel> {
        let mut hasher = DefaultHasher::new();
        model.descriptor.id.hash(&mut hasher);
        model.descriptor.size_bytes.hash(&mut hasher);
        debug!(engine = %self.name, model_id = %model.descriptor.id, "reference engine bound model");
        Ok(EngineModel::new(
            self.name.clone(),
            ReferenceModel {
                id: model.descriptor.id.clone(),
                seed: hasher.finish(),
            },
        ))
    }

    async fn generate(
        &self,
        model: &EngineModel,
        prompt: &str,
        config: &GenerationConfig,
    ) -> RuntimeResult<EngineOutput> {
        let state = model
            .downcast_ref::<ReferenceModel>()
            .ok_or_else(|| kiln_kernel::RuntimeError::engine(&self.name, "model was bound by another engine"))?;

        let mut rng = seed_for(state.seed, prompt);
        let mut text = String::new();
        let mut tokens = 0u32;
        let max_tokens = config.effective_max_tokens();
        let mut finish = FinishReason::Length;

        while tokens < max_tokens {
            if let Some(latency) = self.token_latency {
                tokio::time::sleep(latency).await;
            }
            text.push_str(&token_text(tokens, next_word(&mut rng)));
            tokens += 1;
            if config.stop.iter().any(|s| !s.is_empty() && text.ends_with(s.as_str())) {
                finish = FinishReason::Stop;
                break;
            }
        }

        debug!(model_id = %state.id, tokens, "reference generation complete");
        Ok(EngineOutput {
            text,
            tokens_generated: tokens,
            finish_reason: finish,
        })
    }

    async fn generate_stream(
        &self,
        model: &EngineModel,
        prompt: &str,
        config: &GenerationConfig,
        cancel: CancellationToken,
    ) -> RuntimeResult<TokenStream> {
        let state = model
            .downcast_arc::<ReferenceModel>()
            .ok_or_else(|| kiln_kernel::RuntimeError::engine(&self.name, "model was bound by another engine"))?;

        struct Cursor {
            rng: u64,
            index: u32,
            max_tokens: u32,
            text: String,
            stop: Vec<String>,
            latency: Option<Duration>,
            cancel: CancellationToken,
            finish: Option<FinishReason>,
            done: bool,
        }

        let cursor = Cursor {
            rng: seed_for(state.seed, prompt),
            index: 0,
            max_tokens: config.effective_max_tokens(),
            text: String::new(),
            stop: config.stop.clone(),
            latency: self.token_latency,
            cancel,
            finish: None,
            done: false,
        };

        let stream = stream::unfold(cursor, |mut c| async move {
            if c.done {
                return None;
            }
            if let Some(reason) = c.finish.take() {
                c.done = true;
                return Some((Ok(TokenChunk::done(c.index, reason)), c));
            }
            if let Some(latency) = c.latency {
                tokio::select! {
                    biased;
                    _ = c.cancel.cancelled() => {}
                    _ = tokio::time::sleep(latency) => {}
                }
            }
            if c.cancel.is_cancelled() {
                c.done = true;
                return Some((Ok(TokenChunk::done(c.index, FinishReason::Cancelled)), c));
            }
            if c.index >= c.max_tokens {
                c.done = true;
                return Some((Ok(TokenChunk::done(c.index, FinishReason::Length)), c));
            }

            let text = token_text(c.index, next_word(&mut c.rng));
            c.text.push_str(&text);
            let chunk = TokenChunk::token(c.index, text);
            c.index += 1;
            if c.stop.iter().any(|s| !s.is_empty() && c.text.ends_with(s.as_str())) {
                // Emit this token; the next poll reports the stop.
                c.finish = Some(FinishReason::Stop);
            }
            Some((Ok(chunk), c))
        });

        Ok(Box::pin(stream))
    }
}
