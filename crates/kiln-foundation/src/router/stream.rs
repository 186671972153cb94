//! Streams returned by the router.
//!
//! A forwarder task owns the model's generation permit and pumps the engine's
//! token stream into a bounded channel. Dropping the consumer side closes the
//! channel and cancels the engine; the forwarder then exits and the permit is
//! released with it.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use kiln_kernel::chat::{ChatDelta, Usage};
use kiln_kernel::engine::{EngineOutput, FinishReason, TokenChunk, TokenStream};
use kiln_kernel::{ComputeBackend, RuntimeError, RuntimeResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::GenerationPermit;

const CHANNEL_CAPACITY: usize = 32;

/// Single-consumer, finite token stream for one generation.
///
/// Always ends with a chunk carrying a finish reason, unless the engine
/// reported an error.
pub struct GenerationStream {
    model_id: String,
    backend: ComputeBackend,
    rx: ReceiverStream<RuntimeResult<TokenChunk>>,
    cancel: CancellationToken,
    forwarder: JoinHandle<()>,
}

impl GenerationStream {
    pub(crate) fn spawn(permit: GenerationPermit, mut tokens: TokenStream, cancel: CancellationToken) -> Self {
        let model_id = permit.handle().id().to_string();
        let backend = permit.handle().backend();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let token = cancel.clone();

        let forwarder = tokio::spawn(async move {
            let _permit = permit;
            let mut next_index = 0u32;
            let mut finished = false;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = tx.closed() => break,
                    next = tokens.next() => next,
                };
                let Some(item) = next else { break };
                let last = match &item {
                    Ok(chunk) => {
                        next_index = chunk.index + 1;
                        chunk.is_done()
                    }
                    Err(_) => true,
                };
                if tx.send(item).await.is_err() {
                    break;
                }
                if last {
                    finished = true;
                    break;
                }
            }
            if !finished && !tx.is_closed() {
                let reason = if token.is_cancelled() {
                    FinishReason::Cancelled
                } else {
                    FinishReason::Stop
                };
                let _ = tx.send(Ok(TokenChunk::done(next_index, reason))).await;
            }
            debug!(next_index, "generation stream forwarder exited");
        });

        Self {
            model_id,
            backend,
            rx: ReceiverStream::new(rx),
            cancel,
            forwarder,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn backend(&self) -> ComputeBackend {
        self.backend
    }

    /// Ask the engine to stop. The stream still yields a final
    /// `Cancelled` chunk.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the forwarder has exited and released the model.
    pub fn is_released(&self) -> bool {
        self.forwarder.is_finished()
    }

    /// Drain the stream into one output. A cancelled generation is
    /// `InferenceCancelled`.
    pub async fn collect_output(mut self) -> RuntimeResult<EngineOutput> {
        let mut text = String::new();
        let mut tokens_generated = 0u32;
        while let Some(item) = self.next().await {
            let chunk = item?;
            match chunk.finish_reason {
                Some(FinishReason::Cancelled) => {
                    return Err(RuntimeError::InferenceCancelled {
                        model_id: self.model_id.clone(),
                    });
                }
                Some(finish_reason) => {
                    return Ok(EngineOutput {
                        text,
                        tokens_generated,
                        finish_reason,
                    });
                }
                None => {
                    text.push_str(&chunk.text);
                    tokens_generated += 1;
                }
            }
        }
        Err(RuntimeError::InferenceCancelled {
            model_id: self.model_id.clone(),
        })
    }
}

impl Stream for GenerationStream {
    type Item = RuntimeResult<TokenChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Chat view over a [`GenerationStream`]; the final delta carries usage.
pub struct ChatStream {
    id: String,
    prompt_tokens: u32,
    completion_tokens: u32,
    inner: GenerationStream,
}

impl ChatStream {
    pub(crate) fn new(id: String, prompt_tokens: u32, inner: GenerationStream) -> Self {
        Self {
            id,
            prompt_tokens,
            completion_tokens: 0,
            inner,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl Stream for ChatStream {
    type Item = RuntimeResult<ChatDelta>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let usage = if chunk.is_done() {
                    Some(Usage::new(this.prompt_tokens, this.completion_tokens))
                } else {
                    this.completion_tokens += 1;
                    None
                };
                Poll::Ready(Some(Ok(ChatDelta {
                    id: this.id.clone(),
                    model: this.inner.model_id.clone(),
                    content: chunk.text,
                    finish_reason: chunk.finish_reason,
                    usage,
                })))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
