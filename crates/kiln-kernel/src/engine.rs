//! Inference engine contract.
//!
//! An engine wraps one external compute library bound to one backend. The
//! router only ever talks to this trait, so adding a backend never touches
//! routing code.

use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backend::ComputeBackend;
use crate::error::RuntimeResult;
use crate::loader::LoadedModel;
use crate::model::ModelFormat;

/// `max_tokens` applied when a request leaves it unset.
pub const DEFAULT_MAX_TOKENS: u32 = 256;

/// How a request waits for a model's generation lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// Fail with `InferenceBusy` if the lock is held.
    #[default]
    FailFast,
    /// Wait up to the given duration, then fail with `InferenceBusy`.
    Wait(Duration),
}

/// Sampling parameters for one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
    #[serde(skip)]
    pub acquire: AcquireMode,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: 0.7,
            top_p: 0.9,
            stop: Vec::new(),
            acquire: AcquireMode::FailFast,
        }
    }
}

impl GenerationConfig {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }

    pub fn waiting(mut self, timeout: Duration) -> Self {
        self.acquire = AcquireMode::Wait(timeout);
        self
    }

    pub fn effective_max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }
}

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// End of sequence or a stop string.
    Stop,
    /// `max_tokens` reached.
    Length,
    Cancelled,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Engine-private state for one loaded model.
#[derive(Clone)]
pub struct EngineModel {
    engine: String,
    state: Arc<dyn Any + Send + Sync>,
}

impl EngineModel {
    pub fn new<T: Any + Send + Sync>(engine: impl Into<String>, state: T) -> Self {
        Self { engine: engine.into(), state: Arc::new(state) }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.state.downcast_ref::<T>()
    }

    /// The state as a shared pointer, for streams that outlive the borrow.
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.state).downcast::<T>().ok()
    }
}

impl fmt::Debug for EngineModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineModel").field("engine", &self.engine).finish_non_exhaustive()
    }
}

/// Full result of a non-streaming generation, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub text: String,
    pub tokens_generated: u32,
    pub finish_reason: FinishReason,
}

/// One streamed increment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenChunk {
    pub text: String,
    pub index: u32,
    pub finish_reason: Option<FinishReason>,
}

impl TokenChunk {
    pub fn token(index: u32, text: impl Into<String>) -> Self {
        Self { text: text.into(), index, finish_reason: None }
    }

    pub fn done(index: u32, finish_reason: FinishReason) -> Self {
        Self { text: String::new(), index, finish_reason: Some(finish_reason) }
    }

    pub fn is_done(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// Type-erased, finite stream of tokens.
pub type TokenStream = Pin<Box<dyn Stream<Item = RuntimeResult<TokenChunk>> + Send>>;

/// Router-level result of [`InferenceEngine::generate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub model_id: String,
    pub text: String,
    pub tokens_generated: u32,
    pub time_taken_ms: u64,
    pub backend: ComputeBackend,
    pub finish_reason: FinishReason,
}

/// A model execution engine bound to one backend.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &str;

    fn backend(&self) -> ComputeBackend;

    fn supports(&self, format: ModelFormat) -> bool;

    /// Bind a loaded model to this engine.
    async fn load_into(&self, model: &LoadedModel) -> RuntimeResult<EngineModel>;

    async fn generate(
        &self,
        model: &EngineModel,
        prompt: &str,
        config: &GenerationConfig,
    ) -> RuntimeResult<EngineOutput>;

    /// Stream tokens. Implementations poll `cancel` between tokens and end
    /// the stream with [`FinishReason::Cancelled`] once it fires.
    async fn generate_stream(
        &self,
        model: &EngineModel,
        prompt: &str,
        config: &GenerationConfig,
        cancel: CancellationToken,
    ) -> RuntimeResult<TokenStream>;

    /// Drop engine-side resources for a model being unloaded.
    async fn release(&self, _model: &EngineModel) {}
}
