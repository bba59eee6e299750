//! Transcript buffer for the current listening turn
//!
//! The platform recognizer re-delivers the full cumulative transcript on
//! every update, so the buffer is overwritten rather than appended to.
//!
//! # Buffer Strategy
//!
//! - **Fragments**: Replace the held text (trimmed)
//! - **Take**: Hands the text to the dispatcher and leaves the buffer empty

/// Latest recognized text for one listening turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptBuffer {
    /// Trimmed cumulative transcript
    text: String,
    /// Count of recognizer updates seen since the last clear
    update_count: u64,
}

impl TranscriptBuffer {
    /// Create a new empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held transcript with a new recognizer fragment.
    ///
    /// Returns the trimmed text now held.
    pub fn replace(&mut self, fragment: &str) -> &str {
        self.text.clear();
        self.text.push_str(fragment.trim());
        self.update_count += 1;

        if self.update_count % 10 == 0 {
            log::debug!(
                "TranscriptBuffer: {} updates, {} chars held",
                self.update_count,
                self.text.len()
            );
        }
        &self.text
    }

    /// Current trimmed transcript
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Number of whitespace-separated words in the held transcript
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    /// True when the buffer holds at least one word worth sending
    pub fn has_words(&self) -> bool {
        self.word_count() >= 1
    }

    /// Get count of recognizer updates since the last clear
    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// Take the transcript out, leaving the buffer empty
    pub fn take(&mut self) -> String {
        self.update_count = 0;
        std::mem::take(&mut self.text)
    }

    /// Reset the buffer for a new listening turn
    pub fn clear(&mut self) {
        self.text.clear();
        self.update_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_empty() {
        let buf = TranscriptBuffer::new();
        assert!(buf.is_empty());
        assert!(!buf.has_words());
        assert_eq!(buf.text(), "");
        assert_eq!(buf.update_count(), 0);
    }

    #[test]
    fn test_fragments_overwrite_instead_of_append() {
        let mut buf = TranscriptBuffer::new();
        buf.replace("hello");
        buf.replace("hello there");
        assert_eq!(buf.text(), "hello there");
        assert_eq!(buf.word_count(), 2);
        assert_eq!(buf.update_count(), 2);
    }

    #[test]
    fn test_fragment_is_trimmed() {
        let mut buf = TranscriptBuffer::new();
        assert_eq!(buf.replace("  bonjour  \n"), "bonjour");
    }

    #[test]
    fn test_whitespace_only_fragment_is_empty() {
        let mut buf = TranscriptBuffer::new();
        buf.replace("   ");
        assert!(buf.is_empty());
        assert_eq!(buf.word_count(), 0);
    }

    #[test]
    fn test_later_empty_fragment_clears_text() {
        let mut buf = TranscriptBuffer::new();
        buf.replace("hola");
        buf.replace("");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_leaves_buffer_empty() {
        let mut buf = TranscriptBuffer::new();
        buf.replace("guten tag");
        assert_eq!(buf.take(), "guten tag");
        assert!(buf.is_empty());
        assert_eq!(buf.update_count(), 0);
    }

    #[test]
    fn test_clear() {
        let mut buf = TranscriptBuffer::new();
        buf.replace("ciao");
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.update_count(), 0);
    }
}
