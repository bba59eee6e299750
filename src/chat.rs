//! Typed chat session sharing the transport with the voice engine
//!
//! Typed input and voice turns go through the same `ChatTransport`. Only one
//! request may be in flight at a time across both; the [`SendLatch`] enforces
//! that. The session keeps the visible message history and rolls back the
//! user's message when the backend refuses it.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::ConversationError;
use crate::mode::ChatMode;
use crate::state_machine::ConversationNotice;
use crate::transport::{ChatTransport, TransportError};

/// Process-wide "a message is being sent" flag.
#[derive(Debug, Clone, Default)]
pub struct SendLatch {
    sending: Arc<AtomicBool>,
}

impl SendLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the latch. Returns `None` when another send is in flight.
    pub fn try_acquire(&self) -> Option<SendPermit> {
        match self
            .sending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Some(SendPermit {
                sending: self.sending.clone(),
            }),
            Err(_) => {
                log::trace!("Send latch busy");
                None
            }
        }
    }

    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::SeqCst)
    }
}

/// Held while a request is in flight; releases the latch on drop.
#[derive(Debug)]
pub struct SendPermit {
    sending: Arc<AtomicBool>,
}

impl Drop for SendPermit {
    fn drop(&mut self) {
        self.sending.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

impl ChatMessage {
    fn user(text: &str) -> Self {
        Self {
            role: Role::User,
            text: text.to_string(),
        }
    }

    fn assistant(text: &str) -> Self {
        Self {
            role: Role::Assistant,
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("Message is empty")]
    Empty,
    #[error("Another message is already being sent")]
    Busy,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Visible conversation plus the typed-input path.
pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    latch: SendLatch,
    history: Vec<ChatMessage>,
    mode: ChatMode,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn ChatTransport>, latch: SendLatch, mode: ChatMode) -> Self {
        Self {
            transport,
            latch,
            history: Vec::new(),
            mode,
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn mode(&self) -> ChatMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ChatMode) {
        self.mode = mode;
    }

    pub fn is_sending(&self) -> bool {
        self.latch.is_sending()
    }

    /// Send a typed message and append the reply.
    pub async fn send_typed(&mut self, text: &str) -> Result<String, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::Empty);
        }
        let _permit = self.latch.try_acquire().ok_or(ChatError::Busy)?;

        self.history.push(ChatMessage::user(text));
        match self.transport.send(text, self.mode.tag()).await {
            Ok(reply) => {
                self.history.push(ChatMessage::assistant(&reply));
                Ok(reply)
            }
            Err(e) => {
                log::warn!("Typed message failed: {}", e);
                if e.should_roll_back() {
                    self.roll_back_last_user_message();
                }
                Err(e.into())
            }
        }
    }

    /// Mirror a voice-engine notice into the visible history.
    pub fn apply_notice(&mut self, notice: &ConversationNotice) {
        match notice {
            ConversationNotice::UserTurn { text, .. } => {
                self.history.push(ChatMessage::user(text));
            }
            ConversationNotice::AssistantReply { text, .. } => {
                self.history.push(ChatMessage::assistant(text));
            }
            ConversationNotice::Alert(ConversationError::Transport(e)) => {
                if e.should_roll_back() {
                    self.roll_back_last_user_message();
                }
            }
            ConversationNotice::Alert(_) => {}
        }
    }

    fn roll_back_last_user_message(&mut self) {
        if matches!(self.history.last(), Some(m) if m.role == Role::User) {
            self.history.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedTransport {
        replies: Mutex<Vec<Result<String, TransportError>>>,
        seen: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<String, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn send(&self, text: &str, mode_tag: Option<&str>) -> Result<String, TransportError> {
            self.seen
                .lock()
                .push((text.to_string(), mode_tag.map(str::to_string)));
            self.replies.lock().remove(0)
        }
    }

    #[test]
    fn test_latch_is_exclusive() {
        let latch = SendLatch::new();
        let permit = latch.try_acquire();
        assert!(permit.is_some());
        assert!(latch.is_sending());
        assert!(latch.clone().try_acquire().is_none());

        drop(permit);
        assert!(!latch.is_sending());
        assert!(latch.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_typed_send_appends_both_messages() {
        let transport = ScriptedTransport::new(vec![Ok("Bonjour !".to_string())]);
        let mut session = ChatSession::new(transport.clone(), SendLatch::new(), ChatMode::Correction);

        let reply = session.send_typed("  salut  ").await.unwrap();
        assert_eq!(reply, "Bonjour !");
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[0], ChatMessage::user("salut"));
        assert_eq!(
            transport.seen.lock()[0],
            ("salut".to_string(), Some("correction".to_string()))
        );
        assert!(!session.is_sending());
    }

    #[tokio::test]
    async fn test_rate_limit_rolls_back_user_message() {
        let transport =
            ScriptedTransport::new(vec![Err(TransportError::RateLimited("slow down".to_string()))]);
        let mut session = ChatSession::new(transport, SendLatch::new(), ChatMode::Free);

        let err = session.send_typed("hello").await.unwrap_err();
        assert!(matches!(err, ChatError::Transport(TransportError::RateLimited(_))));
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn test_network_failure_keeps_user_message() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Network("down".to_string()))]);
        let mut session = ChatSession::new(transport, SendLatch::new(), ChatMode::Free);

        assert!(session.send_typed("hello").await.is_err());
        assert_eq!(session.history(), &[ChatMessage::user("hello")]);
    }

    #[tokio::test]
    async fn test_busy_latch_rejects_typed_send() {
        let latch = SendLatch::new();
        let _voice = latch.try_acquire().unwrap();
        let transport = ScriptedTransport::new(vec![]);
        let mut session = ChatSession::new(transport.clone(), latch, ChatMode::Free);

        assert_eq!(session.send_typed("hi").await, Err(ChatError::Busy));
        assert_eq!(session.send_typed("   ").await, Err(ChatError::Empty));
        assert!(transport.seen.lock().is_empty());
    }

    #[test]
    fn test_voice_notices_mirror_into_history() {
        let transport = ScriptedTransport::new(vec![]);
        let mut session = ChatSession::new(transport, SendLatch::new(), ChatMode::Free);

        session.apply_notice(&ConversationNotice::UserTurn {
            turn: 1,
            text: "one coffee please".to_string(),
        });
        session.apply_notice(&ConversationNotice::AssistantReply {
            turn: 1,
            text: "Coming right up".to_string(),
        });
        session.apply_notice(&ConversationNotice::UserTurn {
            turn: 2,
            text: "and a croissant".to_string(),
        });
        session.apply_notice(&ConversationNotice::Alert(ConversationError::Transport(
            TransportError::QuotaExceeded("limit".to_string()),
        )));

        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[1].role, Role::Assistant);
    }
}
