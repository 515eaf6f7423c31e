use crate::engine::EngineError;
use facerelay_queue::{MessageError, QueueError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("capability: {0}")]
    Engine(#[from] EngineError),
    #[error("publish to {channel} channel failed: {source}")]
    Publish {
        channel: &'static str,
        #[source]
        source: QueueError,
    },
    #[error("message encoding: {0}")]
    Message(#[from] MessageError),
    #[error("embedder produces {embedder}-d vectors, reference database holds {database}-d")]
    DimensionMismatch { embedder: usize, database: usize },
}

impl StageError {
    /// A retryable failure leaves the input unconsumed so the channel
    /// redelivers it; anything else is terminal for that input.
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Engine(err) => err.is_transient(),
            StageError::Publish { .. } => true,
            StageError::Message(_) | StageError::DimensionMismatch { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facerelay_core::CapabilityError;
    use std::time::Duration;

    #[test]
    fn test_retry_classification() {
        assert!(StageError::from(EngineError::Timeout(Duration::from_secs(1))).is_retryable());
        assert!(StageError::from(EngineError::Capability(CapabilityError::Transient("oom".into()))).is_retryable());
        assert!(!StageError::from(EngineError::Capability(CapabilityError::Fatal("bad".into()))).is_retryable());
        let publish = StageError::Publish {
            channel: "work",
            source: QueueError::Rejected {
                queue: "face-requests".into(),
                reason: "full".into(),
            },
        };
        assert!(publish.is_retryable());
        assert!(!StageError::DimensionMismatch { embedder: 512, database: 128 }.is_retryable());
    }
}
