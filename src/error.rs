//! Error types surfaced by the conversation engine and its capabilities

use crate::transport::TransportError;

/// Fatal conditions that end a voice session.
///
/// Each one is surfaced exactly once as an alert notice; the engine is
/// already `Idle` by the time the caller sees it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("Speech recognition unavailable after {attempts} consecutive errors")]
    RecognitionUnavailable { attempts: u32 },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ConversationError {
    /// Category label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ConversationError::RecognitionUnavailable { .. } => "recognition",
            ConversationError::Transport(e) => e.kind(),
        }
    }
}

/// Failures reported by a speech source or speech sink.
///
/// Stop calls that fail with these are "already stopped" races and are
/// swallowed by the effect runner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("Capability is not currently active")]
    NotActive,
    #[error("Capability unavailable: {0}")]
    Unavailable(String),
    #[error("Capability failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognition_unavailable_display() {
        let err = ConversationError::RecognitionUnavailable { attempts: 5 };
        assert!(err.to_string().contains("5"));
        assert_eq!(err.kind(), "recognition");
    }

    #[test]
    fn test_transport_error_is_transparent() {
        let err: ConversationError = TransportError::RateLimited("slow down".to_string()).into();
        assert!(err.to_string().contains("slow down"));
        assert_eq!(err.kind(), "rate_limited");
    }
}
