use facerelay_core::{CapabilityError, Embedding, FaceCrop, FaceDetector, FaceEmbedder};
use image::RgbImage;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Pending calls buffered in front of the engine thread.
const QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("capability call exceeded {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl EngineError {
    /// Whether the same input may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Capability(err) => err.is_transient(),
            EngineError::Timeout(_) | EngineError::ChannelClosed => true,
            EngineError::Spawn(_) => false,
        }
    }
}

/// One call shipped to the engine thread.
struct Job<I, O> {
    input: I,
    reply: oneshot::Sender<Result<O, CapabilityError>>,
}

/// Clone-safe handle to a capability running on its own OS thread.
///
/// Model sessions are loaded once at startup and reused for every call;
/// each call is bounded by the handle's timeout.
pub struct EngineHandle<I, O> {
    tx: mpsc::Sender<Job<I, O>>,
    timeout: Duration,
}

impl<I, O> Clone for EngineHandle<I, O> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            timeout: self.timeout,
        }
    }
}

impl<I: Send + 'static, O: Send + 'static> EngineHandle<I, O> {
    /// Run one call on the engine thread.
    ///
    /// On timeout the caller gives up; the thread may still finish the
    /// work, and its answer is discarded.
    pub async fn call(&self, input: I) -> Result<O, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let exchange = async {
            self.tx
                .send(Job {
                    input,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| EngineError::ChannelClosed)?;
            let out = reply_rx.await.map_err(|_| EngineError::ChannelClosed)?;
            Ok::<O, EngineError>(out?)
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.timeout)),
        }
    }
}

/// Spawn `capability` on a dedicated OS thread and return a handle to it.
///
/// `run` is invoked once per call with exclusive access to the capability.
/// A panic inside `run` is reported to that caller as a fatal capability
/// failure and the thread keeps serving.
pub fn spawn_engine<C, I, O, F>(
    name: &str,
    mut capability: C,
    timeout: Duration,
    mut run: F,
) -> Result<EngineHandle<I, O>, EngineError>
where
    C: Send + 'static,
    I: Send + 'static,
    O: Send + 'static,
    F: FnMut(&mut C, I) -> Result<O, CapabilityError> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Job<I, O>>(QUEUE_DEPTH);
    let thread_name = name.to_string();

    std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            tracing::info!(thread = %thread_name, "engine thread started");
            while let Some(job) = rx.blocking_recv() {
                // Caller already timed out while this job was queued.
                if job.reply.is_closed() {
                    tracing::debug!(thread = %thread_name, "skipping abandoned call");
                    continue;
                }
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    run(&mut capability, job.input)
                }))
                .unwrap_or_else(|_| {
                    tracing::error!(thread = %thread_name, "capability panicked");
                    Err(CapabilityError::Fatal("capability panicked".into()))
                });
                let _ = job.reply.send(result);
            }
            tracing::info!(thread = %thread_name, "engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout })
}

/// Detection capability behind an engine thread.
pub type DetectorEngine = EngineHandle<RgbImage, Option<FaceCrop>>;

pub fn spawn_detector<D>(detector: D, timeout: Duration) -> Result<DetectorEngine, EngineError>
where
    D: FaceDetector + 'static,
{
    spawn_engine("facerelay-detect", detector, timeout, |detector: &mut D, image: RgbImage| {
        detector.detect(&image)
    })
}

/// Embedding capability behind an engine thread.
#[derive(Clone)]
pub struct EmbedderEngine {
    handle: EngineHandle<RgbImage, Option<Embedding>>,
    dimension: Option<usize>,
}

impl EmbedderEngine {
    pub async fn embed(&self, crop: RgbImage) -> Result<Option<Embedding>, EngineError> {
        self.handle.call(crop).await
    }

    /// Embedding width reported by the model before it was moved to its thread.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }
}

pub fn spawn_embedder<E>(embedder: E, timeout: Duration) -> Result<EmbedderEngine, EngineError>
where
    E: FaceEmbedder + 'static,
{
    let dimension = embedder.dimension();
    let handle = spawn_engine("facerelay-embed", embedder, timeout, |embedder: &mut E, crop: RgbImage| {
        embedder.embed(&crop)
    })?;
    Ok(EmbedderEngine { handle, dimension })
}
