//! Chat transport
//!
//! Sends one user utterance (plus an optional mode tag) to the chat backend
//! and returns the assistant's reply. Transports may retry internally; the
//! conversation engine never retries a turn itself.

mod http;

pub use http::{api_key_from_env, HttpChatTransport};

use async_trait::async_trait;

/// Classified failures of a chat request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No connectivity, DNS failure, timeout
    #[error("Network error: {0}")]
    Network(String),
    /// Backend asked us to slow down (HTTP 429)
    #[error("Rate limited: {0}")]
    RateLimited(String),
    /// Free message allowance used up (HTTP 402)
    #[error("Message quota exceeded: {0}")]
    QuotaExceeded(String),
    /// Anything else the backend or decoding reported
    #[error("Chat backend error{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Generic { status: Option<u16>, message: String },
}

impl TransportError {
    /// Category label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Network(_) => "network",
            TransportError::RateLimited(_) => "rate_limited",
            TransportError::QuotaExceeded(_) => "quota_exceeded",
            TransportError::Generic { .. } => "generic",
        }
    }

    /// Whether a transport may try the same request again
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Generic {
                status: Some(status),
                ..
            } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the user's just-sent message should be removed from history.
    /// Network failures keep it so the user can see what did not go out.
    pub fn should_roll_back(&self) -> bool {
        !matches!(self, TransportError::Network(_))
    }
}

/// Map a non-success HTTP status to a transport error
pub fn classify_status(status: u16, message: String) -> TransportError {
    match status {
        429 => TransportError::RateLimited(message),
        402 => TransportError::QuotaExceeded(message),
        _ => TransportError::Generic {
            status: Some(status),
            message,
        },
    }
}

/// Capability that turns one utterance into one assistant reply.
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    async fn send(&self, text: &str, mode_tag: Option<&str>) -> Result<String, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        let err = classify_status(429, "too many".to_string());
        assert_eq!(err, TransportError::RateLimited("too many".to_string()));
        assert!(!err.is_retryable());
        assert!(err.should_roll_back());
    }

    #[test]
    fn test_classify_quota() {
        let err = classify_status(402, "limit reached".to_string());
        assert!(matches!(err, TransportError::QuotaExceeded(_)));
        assert_eq!(err.kind(), "quota_exceeded");
    }

    #[test]
    fn test_server_errors_are_retryable() {
        assert!(classify_status(503, "busy".to_string()).is_retryable());
        assert!(!classify_status(400, "bad".to_string()).is_retryable());
    }

    #[test]
    fn test_network_error_keeps_history() {
        let err = TransportError::Network("offline".to_string());
        assert!(err.is_retryable());
        assert!(!err.should_roll_back());
    }

    #[test]
    fn test_generic_display_includes_status() {
        let err = classify_status(500, "boom".to_string());
        assert_eq!(err.to_string(), "Chat backend error (500): boom");

        let err = TransportError::Generic {
            status: None,
            message: "bad json".to_string(),
        };
        assert_eq!(err.to_string(), "Chat backend error: bad json");
    }
}
