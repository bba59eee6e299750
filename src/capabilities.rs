//! Platform speech capabilities consumed by the conversation engine
//!
//! The platform recognizer and synthesizer are callback-driven and report
//! events at their own pace. Both are wrapped so that every callback lands
//! on the engine's event channel:
//!
//! - `SpeechSource::start` receives a [`RecognitionListener`] bound to one
//!   listening turn. The engine holds the matching [`RecognitionSubscription`];
//!   once it is unsubscribed, late callbacks through that listener are dropped.
//! - `SpeechSink::subscribe` receives one [`PlaybackListener`] for the whole
//!   lifetime of the conversation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::CapabilityError;
use crate::state_machine::Event;

/// Speech-to-text capability (microphone + platform recognizer)
pub trait SpeechSource: Send + Sync + 'static {
    /// Begin recognition. Cumulative transcripts, errors and the natural end
    /// of the session are reported through `listener`.
    fn start(&self, listener: RecognitionListener) -> Result<(), CapabilityError>;

    /// Stop recognition. Must be safe to call when already stopped.
    fn stop(&self) -> Result<(), CapabilityError>;
}

/// Text-to-speech capability
pub trait SpeechSink: Send + Sync + 'static {
    /// Start speaking `text`. Completion is reported through the subscribed
    /// [`PlaybackListener`], not through the return value.
    fn speak(&self, text: &str) -> Result<(), CapabilityError>;

    /// Stop any playback in progress.
    fn stop(&self) -> Result<(), CapabilityError>;

    /// Register the lifecycle listener. Called once per conversation.
    fn subscribe(&self, listener: PlaybackListener);
}

/// Callback surface handed to a [`SpeechSource`] for one listening turn.
#[derive(Clone)]
pub struct RecognitionListener {
    turn: u64,
    active: Arc<AtomicBool>,
    tx: mpsc::Sender<Event>,
}

impl RecognitionListener {
    /// Full cumulative transcript so far (not a delta)
    pub fn text(&self, transcript: &str) {
        self.forward(Event::RecognizedText {
            turn: self.turn,
            text: transcript.to_string(),
        });
    }

    /// Recognition failed
    pub fn error(&self, message: &str) {
        self.forward(Event::RecognitionError {
            turn: self.turn,
            message: message.to_string(),
        });
    }

    /// The platform ended the recognition session on its own
    pub fn natural_end(&self) {
        self.forward(Event::RecognitionEnded { turn: self.turn });
    }

    /// False once the engine has unsubscribed this turn
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    fn forward(&self, event: Event) {
        if !self.is_active() {
            log::debug!(
                "Dropping recognizer callback for unsubscribed turn {}",
                self.turn
            );
            return;
        }
        if let Err(e) = self.tx.try_send(event) {
            log::warn!("Failed to forward recognizer event: {}", e);
        }
    }
}

/// Live recognition session for one listening turn.
///
/// Dropping the subscription unsubscribes it.
pub struct RecognitionSubscription {
    turn: u64,
    active: Arc<AtomicBool>,
    source: Arc<dyn SpeechSource>,
}

impl RecognitionSubscription {
    /// Start `source` for `turn`, forwarding its callbacks to `tx`.
    pub fn start(
        source: Arc<dyn SpeechSource>,
        turn: u64,
        tx: mpsc::Sender<Event>,
    ) -> Result<Self, CapabilityError> {
        let active = Arc::new(AtomicBool::new(true));
        let listener = RecognitionListener {
            turn,
            active: active.clone(),
            tx,
        };

        if let Err(e) = source.start(listener) {
            active.store(false, Ordering::Release);
            return Err(e);
        }

        Ok(Self {
            turn,
            active,
            source,
        })
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Silence the listener and stop the source. Idempotent; stop failures
    /// are "already stopped" races and are only logged.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.source.stop() {
                log::debug!("Speech source stop ignored (turn {}): {}", self.turn, e);
            }
        }
    }
}

impl Drop for RecognitionSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Lifecycle callbacks of a [`SpeechSink`].
#[derive(Clone)]
pub struct PlaybackListener {
    tx: mpsc::Sender<Event>,
}

impl PlaybackListener {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    pub fn started(&self) {
        self.forward(Event::SpeakStarted);
    }

    pub fn finished(&self) {
        self.forward(Event::SpeakFinished);
    }

    pub fn cancelled(&self) {
        self.forward(Event::SpeakCancelled);
    }

    fn forward(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            log::warn!("Failed to forward playback event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSource {
        listener: Mutex<Option<RecognitionListener>>,
        stops: Mutex<usize>,
        fail_start: bool,
    }

    impl SpeechSource for RecordingSource {
        fn start(&self, listener: RecognitionListener) -> Result<(), CapabilityError> {
            if self.fail_start {
                return Err(CapabilityError::Unavailable("no microphone".to_string()));
            }
            *self.listener.lock() = Some(listener);
            Ok(())
        }

        fn stop(&self) -> Result<(), CapabilityError> {
            *self.stops.lock() += 1;
            Err(CapabilityError::NotActive)
        }
    }

    #[test]
    fn test_listener_forwards_tagged_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let source = Arc::new(RecordingSource::default());
        let _sub = RecognitionSubscription::start(source.clone(), 7, tx).unwrap();

        let listener = source.listener.lock().clone().unwrap();
        listener.text("hello");
        listener.natural_end();

        assert!(matches!(
            rx.try_recv(),
            Ok(Event::RecognizedText { turn: 7, ref text }) if text == "hello"
        ));
        assert!(matches!(rx.try_recv(), Ok(Event::RecognitionEnded { turn: 7 })));
    }

    #[test]
    fn test_unsubscribe_is_idempotent_and_silences_listener() {
        let (tx, mut rx) = mpsc::channel(8);
        let source = Arc::new(RecordingSource::default());
        let sub = RecognitionSubscription::start(source.clone(), 1, tx).unwrap();
        let listener = source.listener.lock().clone().unwrap();

        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);

        // stop errors are swallowed and only issued once
        assert_eq!(*source.stops.lock(), 1);

        listener.error("late");
        assert!(!listener.is_active());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_start_returns_error() {
        let (tx, _rx) = mpsc::channel(8);
        let source = Arc::new(RecordingSource {
            fail_start: true,
            ..RecordingSource::default()
        });
        let result = RecognitionSubscription::start(source.clone(), 1, tx);
        assert!(matches!(result, Err(CapabilityError::Unavailable(_))));
        assert_eq!(*source.stops.lock(), 0);
    }
}
