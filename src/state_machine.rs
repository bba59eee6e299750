//! State machine for the voice conversation engine
//!
//! This module implements the turn-taking loop using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! the next engine value and a list of effects to execute.
//!
//! Every listening phase gets a new, monotonically increasing turn number.
//! Recognizer callbacks, deferred timers and transport completions carry the
//! turn they belong to, so a late event for a turn that is already over is
//! dropped no matter which path delivers it.

use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ConversationError;
use crate::mode::ChatMode;
use crate::settings::Timings;
use crate::transcript::TranscriptBuffer;
use crate::transport::TransportError;

/// Conversation state observed by the UI. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConversationState {
    /// No microphone activity
    #[default]
    Idle,
    /// Speech source active, accumulating text
    Listening,
    /// Utterance sent to the chat backend, speech source stopped
    Processing,
    /// Speech sink vocalizing the reply
    Speaking,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::Listening => "listening",
            ConversationState::Processing => "processing",
            ConversationState::Speaking => "speaking",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, ConversationState::Idle)
    }
}

/// Notifications for the chat layer and UI
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationNotice {
    /// A voice utterance was sent to the backend
    UserTurn { turn: u64, text: String },
    /// The backend replied to a voice utterance
    AssistantReply { turn: u64, text: String },
    /// The session ended on a fatal condition. Emitted once per condition.
    Alert(ConversationError),
}

/// Events that can trigger state transitions.
#[derive(Debug, Clone)]
pub enum Event {
    /// User pressed the microphone button (toggle start/stop)
    MicToggle,
    /// Mode tag for subsequent turns changed
    ModeChanged(ChatMode),
    /// Conversation is being torn down
    Exit,

    // Speech source events
    RecognizedText { turn: u64, text: String },
    RecognitionError { turn: u64, message: String },
    /// Recognizer ended the session on its own
    RecognitionEnded { turn: u64 },

    // Timer events (ids prevent stale timers)
    SilenceElapsed { timer: u64 },
    RetryElapsed { turn: u64 },
    RestartElapsed { turn: u64 },
    DispatchCooldownElapsed { turn: u64 },
    SpeakDelayElapsed { turn: u64, reply: String },
    ResumeElapsed { turn: u64 },

    // Chat transport events
    ReplyReceived { turn: u64, reply: String },
    ReplyFailed { turn: u64, error: TransportError },
    /// The send latch was claimed and the request is going out
    DispatchAccepted { turn: u64, text: String },
    /// Another turn (typed or voice) already holds the send latch
    DispatchRejected { turn: u64 },

    // Speech sink events
    SpeakStarted,
    SpeakFinished,
    SpeakCancelled,
    SpeakFailed { turn: u64, message: String },
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Start the speech source for a new listening turn
    StartRecognition { turn: u64 },
    /// Unsubscribe and stop the speech source (best-effort)
    StopRecognition,
    /// Arm the silence timer, replacing any pending one
    ArmSilenceTimer { timer: u64, duration: Duration },
    CancelSilenceTimer,
    /// Feed `event` back into the state machine after `delay`
    Defer { delay: Duration, event: Event },
    /// Send the utterance to the chat transport
    DispatchTurn {
        turn: u64,
        text: String,
        mode_tag: Option<&'static str>,
    },
    Speak { turn: u64, text: String },
    /// Stop the speech sink (best-effort)
    StopPlayback,
    /// Publish a notice to subscribers
    Notify(ConversationNotice),
    /// Publish the current state to the UI
    EmitUi,
}

/// Authoritative engine state. Owned by the state loop; only `reduce` changes it.
#[derive(Debug, Clone)]
pub struct Engine {
    state: ConversationState,
    /// Correlates log lines for one user-started conversation
    session_id: Option<Uuid>,
    /// Current listening turn
    turn: u64,
    transcript: TranscriptBuffer,
    /// Sequence number of the armed silence timer, if any
    silence_timer: Option<u64>,
    timer_seq: u64,
    /// Consecutive recognizer errors since the last fresh start
    retry_count: u32,
    user_stopped: bool,
    /// Turn whose utterance was already dispatched; latched until the cool-down elapses
    dispatch_guard: Option<u64>,
    mode: ChatMode,
    timings: Timings,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Timings::default(), ChatMode::default())
    }
}

impl Engine {
    pub fn new(timings: Timings, mode: ChatMode) -> Self {
        Self {
            state: ConversationState::Idle,
            session_id: None,
            turn: 0,
            transcript: TranscriptBuffer::new(),
            silence_timer: None,
            timer_seq: 0,
            retry_count: 0,
            user_stopped: true,
            dispatch_guard: None,
            mode,
            timings,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn transcript(&self) -> &str {
        self.transcript.text()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn user_stopped(&self) -> bool {
        self.user_stopped
    }

    pub fn silence_timer_armed(&self) -> bool {
        self.silence_timer.is_some()
    }

    pub fn dispatch_guard(&self) -> Option<u64> {
        self.dispatch_guard
    }

    pub fn mode(&self) -> ChatMode {
        self.mode
    }

    fn apply(&mut self, event: Event, fx: &mut Vec<Effect>) {
        use ConversationState::*;

        match event {
            Event::MicToggle => {
                if self.state == Idle {
                    self.session_id = Some(Uuid::new_v4());
                    log::info!(
                        "Conversation {:?} started",
                        self.session_id.unwrap_or_default()
                    );
                    self.start(false, fx);
                } else {
                    self.stop(fx);
                }
            }
            Event::ModeChanged(mode) => {
                log::info!("Mode changed: {} -> {}", self.mode, mode);
                self.mode = mode;
                fx.push(Effect::EmitUi);
            }
            Event::Exit => {}

            // -----------------
            // Speech source
            // -----------------
            Event::RecognizedText { turn, text } => {
                if self.ignores_recognition(turn) {
                    return;
                }
                self.transcript.replace(&text);
                if !self.transcript.is_empty() && self.state == Listening {
                    self.arm_silence_timer(fx);
                }
            }
            Event::RecognitionError { turn, message } => {
                if self.ignores_recognition(turn) {
                    return;
                }
                self.cancel_silence_timer(fx);
                self.retry_count += 1;
                log::warn!(
                    "Recognition error on turn {} ({}/{}): {}",
                    turn,
                    self.retry_count,
                    self.timings.max_recognition_retries,
                    message
                );

                if self.retry_count >= self.timings.max_recognition_retries {
                    let attempts = self.retry_count;
                    self.stop(fx);
                    fx.push(Effect::Notify(ConversationNotice::Alert(
                        ConversationError::RecognitionUnavailable { attempts },
                    )));
                } else {
                    fx.push(Effect::Defer {
                        delay: self.timings.retry_backoff,
                        event: Event::RetryElapsed { turn },
                    });
                }
            }
            Event::RecognitionEnded { turn } => {
                if self.ignores_recognition(turn) {
                    return;
                }
                self.cancel_silence_timer(fx);

                if self.transcript.has_words()
                    && self.state == Listening
                    && self.dispatch_guard != Some(turn)
                {
                    log::debug!("Recognizer ended turn {} with speech, dispatching", turn);
                    self.dispatch(fx);
                } else {
                    self.transcript.clear();
                    if !self.user_stopped && self.state == Listening {
                        fx.push(Effect::Defer {
                            delay: self.timings.restart_delay,
                            event: Event::RestartElapsed { turn },
                        });
                    }
                }
            }

            // -----------------
            // Timers
            // -----------------
            Event::SilenceElapsed { timer } => {
                if self.silence_timer != Some(timer) {
                    log::debug!("Ignoring stale silence timer {}", timer);
                    return;
                }
                self.silence_timer = None;

                if self.dispatch_guard == Some(self.turn) {
                    log::debug!("Turn {} already dispatched, suppressing duplicate", self.turn);
                    return;
                }
                if self.transcript.has_words() && self.state == Listening && !self.user_stopped {
                    self.dispatch(fx);
                }
            }
            Event::RetryElapsed { turn } | Event::RestartElapsed { turn } => {
                if self.state == Listening && !self.user_stopped && turn == self.turn {
                    self.start(true, fx);
                } else {
                    log::debug!("Restart for turn {} superseded", turn);
                }
            }
            Event::DispatchCooldownElapsed { turn } => {
                if self.dispatch_guard == Some(turn) {
                    self.dispatch_guard = None;
                }
            }
            Event::SpeakDelayElapsed { turn, reply } => {
                if self.state == Speaking && !self.user_stopped && turn == self.turn {
                    fx.push(Effect::Speak { turn, text: reply });
                }
            }
            Event::ResumeElapsed { turn } => {
                if self.state == Speaking && !self.user_stopped && turn == self.turn {
                    self.start(false, fx);
                }
            }

            // -----------------
            // Chat transport
            // -----------------
            Event::ReplyReceived { turn, reply } => {
                if self.state != Processing || turn != self.turn {
                    log::debug!("Dropping reply for turn {} (state {:?})", turn, self.state);
                    return;
                }
                self.state = Speaking;
                fx.push(Effect::Notify(ConversationNotice::AssistantReply {
                    turn,
                    text: reply.clone(),
                }));
                fx.push(Effect::Defer {
                    delay: self.timings.speak_delay,
                    event: Event::SpeakDelayElapsed { turn, reply },
                });
                fx.push(Effect::EmitUi);
            }
            Event::ReplyFailed { turn, error } => {
                if self.state != Processing || turn != self.turn {
                    log::debug!("Dropping failure for turn {}: {}", turn, error);
                    return;
                }
                log::error!("Turn {} failed: {}", turn, error);
                self.stop(fx);
                fx.push(Effect::Notify(ConversationNotice::Alert(error.into())));
            }
            Event::DispatchAccepted { turn, text } => {
                // history only shows utterances that actually went out
                if self.state == Processing && turn == self.turn {
                    fx.push(Effect::Notify(ConversationNotice::UserTurn { turn, text }));
                }
            }
            Event::DispatchRejected { turn } => {
                if self.state == Processing && turn == self.turn {
                    log::warn!("Turn {} not sent, another message is in flight", turn);
                    self.start(true, fx);
                }
            }

            // -----------------
            // Speech sink
            // -----------------
            // Only from Processing and never after a stop, so a late start
            // cannot resurrect a stopped conversation.
            Event::SpeakStarted => {
                if !self.user_stopped && self.state == Processing {
                    self.state = Speaking;
                    fx.push(Effect::EmitUi);
                }
            }
            Event::SpeakFinished => {
                if self.state == Speaking && !self.user_stopped {
                    fx.push(Effect::Defer {
                        delay: self.timings.resume_delay,
                        event: Event::ResumeElapsed { turn: self.turn },
                    });
                }
            }
            Event::SpeakFailed { turn, message } => {
                if self.state == Speaking && !self.user_stopped && turn == self.turn {
                    log::warn!("Speech sink failed on turn {}: {}", turn, message);
                    fx.push(Effect::Defer {
                        delay: self.timings.resume_delay,
                        event: Event::ResumeElapsed { turn },
                    });
                }
            }
            Event::SpeakCancelled => {
                log::debug!("Playback cancelled");
            }
        }
    }

    /// Recognizer events for another turn, or any while idle, are stale.
    fn ignores_recognition(&self, turn: u64) -> bool {
        if turn != self.turn || self.state == ConversationState::Idle {
            log::debug!(
                "Ignoring recognizer event for turn {} (current {}, {:?})",
                turn,
                self.turn,
                self.state
            );
            true
        } else {
            false
        }
    }

    fn start(&mut self, is_retry: bool, fx: &mut Vec<Effect>) {
        self.state = ConversationState::Listening;
        if !is_retry {
            self.user_stopped = false;
            self.retry_count = 0;
        }
        self.transcript.clear();
        self.cancel_silence_timer(fx);
        self.turn += 1;

        fx.push(Effect::StartRecognition { turn: self.turn });
        fx.push(Effect::EmitUi);
    }

    /// Tear everything down; the state becomes Idle last.
    fn stop(&mut self, fx: &mut Vec<Effect>) {
        self.user_stopped = true;
        self.silence_timer = None;
        fx.push(Effect::CancelSilenceTimer);
        fx.push(Effect::StopRecognition);
        fx.push(Effect::StopPlayback);
        self.transcript.clear();
        self.state = ConversationState::Idle;
        fx.push(Effect::EmitUi);
    }

    fn dispatch(&mut self, fx: &mut Vec<Effect>) {
        let turn = self.turn;
        self.dispatch_guard = Some(turn);
        self.state = ConversationState::Processing;
        self.cancel_silence_timer(fx);
        let text = self.transcript.take();

        fx.push(Effect::StopRecognition);
        fx.push(Effect::DispatchTurn {
            turn,
            text,
            mode_tag: self.mode.tag(),
        });
        fx.push(Effect::Defer {
            delay: self.timings.dispatch_cooldown,
            event: Event::DispatchCooldownElapsed { turn },
        });
        fx.push(Effect::EmitUi);
    }

    fn arm_silence_timer(&mut self, fx: &mut Vec<Effect>) {
        self.timer_seq += 1;
        self.silence_timer = Some(self.timer_seq);
        fx.push(Effect::ArmSilenceTimer {
            timer: self.timer_seq,
            duration: self.timings.silence_timeout,
        });
    }

    fn cancel_silence_timer(&mut self, fx: &mut Vec<Effect>) {
        if self.silence_timer.take().is_some() {
            fx.push(Effect::CancelSilenceTimer);
        }
    }
}

/// Reducer function: (engine, event) -> (next_engine, effects)
///
/// Key rules:
/// - Never mutate the engine in place
/// - Ignore events with stale turn or timer ids
/// - Emit EmitUi after state changes
pub fn reduce(engine: &Engine, event: Event) -> (Engine, Vec<Effect>) {
    let mut next = engine.clone();
    let mut effects = Vec::new();
    next.apply(event, &mut effects);
    (next, effects)
}
