//! Fault taxonomy for a single processing attempt.

use crate::message::Disposition;
use crate::serializer::SerializerError;
use crate::transport::TransportError;

/// Errors raised while a message travels through the pipeline.
///
/// Every variant is recovered by the outermost error-handling stage, which
/// abandons the message so the transport can redeliver it.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("failed to decode message payload: {0}")]
    Deserialize(#[from] SerializerError),
    #[error("no processor registered for message type {message_type}")]
    ProcessorNotFound { message_type: &'static str },
    #[error("processing cancelled before completion")]
    Cancelled,
    #[error("concurrency gate closed")]
    GateClosed,
    #[error("processor panicked: {0}")]
    Panicked(String),
    #[error("pipeline finished without settling the message")]
    Unsettled,
    #[error("settlement failed: {0}")]
    Settlement(#[from] SettlementError),
    #[error("processor failed: {0:#}")]
    Processor(#[source] anyhow::Error),
}

impl ProcessingError {
    /// Wraps an arbitrary processor failure.
    #[must_use]
    pub fn processor(err: impl Into<anyhow::Error>) -> Self {
        Self::Processor(err.into())
    }
}

/// Errors from the terminal operations of a message state handler.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    /// A terminal operation was invoked after the attempt was already settled.
    /// Exactly one terminal operation is permitted per attempt.
    #[error("message already settled as {previous}, cannot mark it {attempted}")]
    AlreadySettled {
        previous: Disposition,
        attempted: Disposition,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processor_error_keeps_source_chain() {
        let root = anyhow::anyhow!("database unreachable").context("loading order");
        let err = ProcessingError::processor(root);
        let rendered = err.to_string();
        assert!(rendered.contains("loading order"));
        assert!(rendered.contains("database unreachable"));
    }

    #[test]
    fn already_settled_names_both_dispositions() {
        let err = SettlementError::AlreadySettled {
            previous: Disposition::Completed,
            attempted: Disposition::Abandoned,
        };
        assert_eq!(
            err.to_string(),
            "message already settled as completed, cannot mark it abandoned"
        );
    }
}
