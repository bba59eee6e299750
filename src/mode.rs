//! Conversation modes attached to chat requests.
//!
//! The mode travels to the backend as an optional tag and biases the
//! assistant's reply style. Free conversation sends no tag at all.

use serde::{Deserialize, Serialize};

/// Conversation mode for chat turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// Open-ended practice conversation, no tag sent.
    #[default]
    Free,

    /// The assistant plays a character in a scenario (ordering food, job interview, ...).
    Roleplay,

    /// The assistant answers and then corrects mistakes in the user's sentence.
    Correction,
}

impl ChatMode {
    /// Tag sent to the backend, if any.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            ChatMode::Free => None,
            ChatMode::Roleplay => Some("roleplay"),
            ChatMode::Correction => Some("correction"),
        }
    }

    /// Get the display label for this mode.
    pub fn label(&self) -> &'static str {
        match self {
            ChatMode::Free => "Free",
            ChatMode::Roleplay => "Roleplay",
            ChatMode::Correction => "Correction",
        }
    }

    /// Get all available modes in order.
    pub fn all() -> &'static [ChatMode] {
        &[ChatMode::Free, ChatMode::Roleplay, ChatMode::Correction]
    }
}

impl std::fmt::Display for ChatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode_sends_no_tag() {
        assert_eq!(ChatMode::default(), ChatMode::Free);
        assert_eq!(ChatMode::default().tag(), None);
    }

    #[test]
    fn test_roleplay_tag() {
        assert_eq!(ChatMode::Roleplay.tag(), Some("roleplay"));
    }

    #[test]
    fn test_mode_serialization() {
        let json = serde_json::to_string(&ChatMode::Correction).unwrap();
        assert_eq!(json, "\"correction\"");
        let mode: ChatMode = serde_json::from_str("\"roleplay\"").unwrap();
        assert_eq!(mode, ChatMode::Roleplay);
    }

    #[test]
    fn test_all_modes() {
        let modes = ChatMode::all();
        assert_eq!(modes.len(), 3);
        assert_eq!(modes[0], ChatMode::Free);
    }
}
