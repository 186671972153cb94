//! InferenceRouter - request entry point for loaded models
//!
//! The router resolves a model id to its handle, takes the handle's
//! generation lock and hands the request to whichever engine owns the model.
//! It never inspects engines beyond the [`InferenceEngine`] contract.
//!
//! [`InferenceEngine`]: kiln_kernel::engine::InferenceEngine

mod stream;

pub use stream::{ChatStream, GenerationStream};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use kiln_kernel::chat::{ChatCompletion, ChatMessage, Usage, count_words, flatten_messages};
use kiln_kernel::engine::{GenerationConfig, GenerationResult};
use kiln_kernel::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::{GenerationPermit, ModelHandle, ModelRegistry};

/// Configuration for [`InferenceRouter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// `max_tokens` applied to requests that leave it unset while the
    /// power-saving advisory is active
    pub power_saving_max_tokens: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            power_saving_max_tokens: 64,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.power_saving_max_tokens == 0 {
            return Err("power_saving_max_tokens must be > 0");
        }
        Ok(())
    }
}

/// Shared flag asking the router to shorten unbounded generations.
#[derive(Debug, Clone, Default)]
pub struct PowerSavingAdvisory(Arc<AtomicBool>);

impl PowerSavingAdvisory {
    pub fn set(&self, active: bool) {
        if self.0.swap(active, Ordering::AcqRel) != active {
            info!(active, "power-saving advisory changed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Result of [`InferenceRouter::chat_completion`].
pub enum ChatResponse {
    Complete(ChatCompletion),
    Stream(ChatStream),
}

impl ChatResponse {
    pub fn into_completion(self) -> Option<ChatCompletion> {
        match self {
            Self::Complete(c) => Some(c),
            Self::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<ChatStream> {
        match self {
            Self::Stream(s) => Some(s),
            Self::Complete(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct InferenceRouter {
    registry: ModelRegistry,
    config: RouterConfig,
    advisory: PowerSavingAdvisory,
}

impl InferenceRouter {
    pub fn new(registry: ModelRegistry, config: RouterConfig) -> Self {
        Self {
            registry,
            config,
            advisory: PowerSavingAdvisory::default(),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The flag the adaptive controller drives.
    pub fn advisory(&self) -> &PowerSavingAdvisory {
        &self.advisory
    }

    fn effective(&self, mut config: GenerationConfig) -> GenerationConfig {
        if config.max_tokens.is_none() && self.advisory.is_active() {
            config.max_tokens = Some(self.config.power_saving_max_tokens);
        }
        config
    }

    async fn acquire(&self, model_id: &str, config: &GenerationConfig) -> RuntimeResult<(ModelHandle, GenerationPermit)> {
        let mut handle = self
            .registry
            .get(model_id)
            .ok_or_else(|| RuntimeError::ModelNotFound(model_id.to_string()))?;
        loop {
            let permit = handle.acquire(config.acquire).await?;
            // The model may have been unloaded or reloaded while we waited.
            match self.registry.get(model_id) {
                Some(current) if current.same_as(&handle) => {
                    self.registry.record_access(&handle);
                    return Ok((handle, permit));
                }
                Some(current) => {
                    debug!(model_id, "model reloaded while waiting, retrying");
                    drop(permit);
                    handle = current;
                }
                None => return Err(RuntimeError::ModelNotFound(model_id.to_string())),
            }
        }
    }

    pub async fn generate(
        &self,
        model_id: &str,
        prompt: &str,
        config: GenerationConfig,
    ) -> RuntimeResult<GenerationResult> {
        let config = self.effective(config);
        let (handle, permit) = self.acquire(model_id, &config).await?;

        let start = Instant::now();
        let output = handle
            .engine()
            .generate(handle.engine_model(), prompt, &config)
            .await?;
        drop(permit);
        let time_taken_ms = start.elapsed().as_millis() as u64;

        debug!(
            model_id,
            backend = %handle.backend(),
            tokens = output.tokens_generated,
            time_taken_ms,
            "generation complete"
        );
        Ok(GenerationResult {
            model_id: model_id.to_string(),
            text: output.text,
            tokens_generated: output.tokens_generated,
            time_taken_ms,
            backend: handle.backend(),
            finish_reason: output.finish_reason,
        })
    }

    /// Start a streaming generation. The model stays locked until the stream
    /// finishes, is cancelled, or is dropped.
    pub async fn generate_stream(
        &self,
        model_id: &str,
        prompt: &str,
        config: GenerationConfig,
    ) -> RuntimeResult<GenerationStream> {
        let config = self.effective(config);
        let (handle, permit) = self.acquire(model_id, &config).await?;
        let cancel = CancellationToken::new();
        let tokens = handle
            .engine()
            .generate_stream(handle.engine_model(), prompt, &config, cancel.child_token())
            .await?;
        debug!(model_id, backend = %handle.backend(), "generation stream started");
        Ok(GenerationStream::spawn(permit, tokens, cancel))
    }

    /// Chat over a flattened transcript. With `stream` the response is a
    /// [`ChatStream`] whose final delta carries usage.
    pub async fn chat_completion(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        config: GenerationConfig,
        stream: bool,
    ) -> RuntimeResult<ChatResponse> {
        let prompt = flatten_messages(messages);
        let prompt_tokens = count_words(&prompt);
        let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());

        if stream {
            let inner = self.generate_stream(model_id, &prompt, config).await?;
            return Ok(ChatResponse::Stream(ChatStream::new(id, prompt_tokens, inner)));
        }

        let result = self.generate(model_id, &prompt, config).await?;
        Ok(ChatResponse::Complete(ChatCompletion {
            id,
            model: result.model_id,
            created: Utc::now(),
            message: ChatMessage::assistant(result.text.trim()),
            finish_reason: result.finish_reason,
            usage: Usage::new(prompt_tokens, result.tokens_generated),
        }))
    }
}
