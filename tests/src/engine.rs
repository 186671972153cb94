//! Controllable inference engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream;
use kiln_kernel::engine::{
    EngineModel, EngineOutput, FinishReason, GenerationConfig, InferenceEngine, TokenChunk, TokenStream,
};
use kiln_kernel::loader::LoadedModel;
use kiln_kernel::model::ModelFormat;
use kiln_kernel::{ComputeBackend, RuntimeError, RuntimeResult};
use tokio::sync::{Barrier, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

/// Call counts shared between a [`GatedEngine`] and the test.
#[derive(Debug, Default)]
pub struct EngineCounters {
    loads: AtomicUsize,
    releases: AtomicUsize,
    started: AtomicUsize,
    finished: AtomicUsize,
    started_notify: Notify,
}

impl EngineCounters {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` generations have started.
    pub async fn wait_started(&self, n: usize) {
        loop {
            let notified = self.started_notify.notified();
            if self.started() >= n {
                return;
            }
            notified.await;
        }
    }
}

/// Engine that answers with a fixed response and, when gated, holds every
/// generation until the test opens the gate.
///
/// Streams emit one chunk per whitespace-separated word of the response.
/// A gated stream waits for the gate before each chunk, the final one
/// included.
#[derive(Clone)]
pub struct GatedEngine {
    name: String,
    backend: ComputeBackend,
    response: String,
    gate: Option<Arc<Semaphore>>,
    load_barrier: Option<Arc<Barrier>>,
    counters: Arc<EngineCounters>,
}

impl GatedEngine {
    pub fn new(backend: ComputeBackend) -> Self {
        Self {
            name: format!("gated-{backend}"),
            backend,
            response: "ok".to_string(),
            gate: None,
            load_barrier: None,
            counters: Arc::new(EngineCounters::default()),
        }
    }

    /// Hold generations until [`GatedEngine::open`] is called.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Hold each `load_into` until `n` loads are inside it together.
    pub fn rendezvous_loads(mut self, n: usize) -> Self {
        self.load_barrier = Some(Arc::new(Barrier::new(n)));
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = response.into();
        self
    }

    /// Let `n` more gate waits through.
    pub fn open(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn counters(&self) -> Arc<EngineCounters> {
        Arc::clone(&self.counters)
    }

    fn started(&self) {
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        self.counters.started_notify.notify_waiters();
    }
}

type StreamState = (std::vec::IntoIter<String>, u32, bool);

fn finished(
    counters: &EngineCounters,
    index: u32,
    reason: FinishReason,
) -> Option<(RuntimeResult<TokenChunk>, StreamState)> {
    counters.finished.fetch_add(1, Ordering::SeqCst);
    Some((Ok(TokenChunk::done(index, reason)), (Vec::new().into_iter(), index, true)))
}

async fn pass(gate: Option<&Arc<Semaphore>>) -> RuntimeResult<()> {
    if let Some(gate) = gate {
        gate.acquire()
            .await
            .map_err(|_| RuntimeError::engine("gated", "gate closed"))?
            .forget();
    }
    Ok(())
}

#[async_trait]
impl InferenceEngine for GatedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> ComputeBackend {
        self.backend
    }

    fn supports(&self, _format: ModelFormat) -> bool {
        true
    }

    async fn load_into(&self, model: &LoadedModel) -> RuntimeResult<EngineModel> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(barrier) = &self.load_barrier {
            barrier.wait().await;
        }
        Ok(EngineModel::new(self.name.clone(), model.descriptor.id.clone()))
    }

    async fn generate(
        &self,
        _model: &EngineModel,
        _prompt: &str,
        config: &GenerationConfig,
    ) -> RuntimeResult<EngineOutput> {
        self.started();
        pass(self.gate.as_ref()).await?;
        let words: Vec<&str> = self
            .response
            .split_whitespace()
            .take(config.effective_max_tokens() as usize)
            .collect();
        self.counters.finished.fetch_add(1, Ordering::SeqCst);
        Ok(EngineOutput {
            text: words.join(" "),
            tokens_generated: words.len() as u32,
            finish_reason: FinishReason::Stop,
        })
    }

    async fn generate_stream(
        &self,
        _model: &EngineModel,
        _prompt: &str,
        config: &GenerationConfig,
        cancel: CancellationToken,
    ) -> RuntimeResult<TokenStream> {
        self.started();
        let words: Vec<String> = self
            .response
            .split_whitespace()
            .take(config.effective_max_tokens() as usize)
            .map(str::to_owned)
            .collect();
        let gate = self.gate.clone();
        let counters = Arc::clone(&self.counters);

        let stream = stream::unfold((words.into_iter(), 0u32, false), move |(mut words, index, done)| {
            let gate = gate.clone();
            let cancel = cancel.clone();
            let counters = Arc::clone(&counters);
            async move {
                if done {
                    return None;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return finished(&counters, index, FinishReason::Cancelled),
                    passed = pass(gate.as_ref()) => {
                        if let Err(e) = passed {
                            return Some((Err(e), (words, index, true)));
                        }
                    }
                }
                match words.next() {
                    Some(word) => {
                        let text = if index == 0 { word } else { format!(" {word}") };
                        Some((Ok(TokenChunk::token(index, text)), (words, index + 1, false)))
                    }
                    None => finished(&counters, index, FinishReason::Stop),
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn release(&self, _model: &EngineModel) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}
