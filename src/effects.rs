//! Effect runner for the voice conversation engine
//!
//! Executes effects produced by the state machine against the speech
//! capabilities and the chat transport. Every asynchronous outcome is fed
//! back into the state loop as an event tagged with the turn it belongs to.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::capabilities::{RecognitionSubscription, SpeechSink, SpeechSource};
use crate::chat::SendLatch;
use crate::state_machine::{Effect, Event};
use crate::transport::ChatTransport;

/// Trait for executing effects.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Effect runner backed by real speech capabilities and a chat transport.
pub struct CapabilityEffectRunner {
    source: Arc<dyn SpeechSource>,
    sink: Arc<dyn SpeechSink>,
    transport: Arc<dyn ChatTransport>,
    latch: SendLatch,
    /// Recognition session of the current listening turn
    recognition: Mutex<Option<RecognitionSubscription>>,
    /// Cancels the pending silence timer task
    silence_cancel: Mutex<Option<CancellationToken>>,
}

impl CapabilityEffectRunner {
    pub fn new(
        source: Arc<dyn SpeechSource>,
        sink: Arc<dyn SpeechSink>,
        transport: Arc<dyn ChatTransport>,
        latch: SendLatch,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            sink,
            transport,
            latch,
            recognition: Mutex::new(None),
            silence_cancel: Mutex::new(None),
        })
    }

    fn stop_recognition(&self) {
        // unsubscribe happens on drop
        if let Some(sub) = self.recognition.lock().take() {
            log::debug!("Stopping recognition for turn {}", sub.turn());
            drop(sub);
        }
    }

    fn cancel_silence_timer(&self) {
        if let Some(token) = self.silence_cancel.lock().take() {
            token.cancel();
        }
    }
}

impl EffectRunner for CapabilityEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartRecognition { turn } => {
                // the previous turn must be silenced before the new one starts
                self.stop_recognition();

                match RecognitionSubscription::start(self.source.clone(), turn, tx.clone()) {
                    Ok(sub) => {
                        log::info!("Recognition started for turn {}", turn);
                        *self.recognition.lock() = Some(sub);
                    }
                    Err(e) => {
                        log::error!("Failed to start recognition for turn {}: {}", turn, e);
                        let message = e.to_string();
                        tokio::spawn(async move {
                            let _ = tx.send(Event::RecognitionError { turn, message }).await;
                        });
                    }
                }
            }

            Effect::StopRecognition => {
                self.stop_recognition();
            }

            Effect::ArmSilenceTimer { timer, duration } => {
                let token = CancellationToken::new();
                if let Some(old) = self.silence_cancel.lock().replace(token.clone()) {
                    old.cancel();
                }

                tokio::spawn(async move {
                    tokio::select! {
                        biased;

                        _ = token.cancelled() => {
                            log::trace!("Silence timer {} cancelled", timer);
                        }

                        _ = tokio::time::sleep(duration) => {
                            log::debug!("Silence timer {} elapsed", timer);
                            let _ = tx.send(Event::SilenceElapsed { timer }).await;
                        }
                    }
                });
            }

            Effect::CancelSilenceTimer => {
                self.cancel_silence_timer();
            }

            Effect::Defer { delay, event } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(event).await;
                });
            }

            Effect::DispatchTurn {
                turn,
                text,
                mode_tag,
            } => {
                if text.trim().is_empty() {
                    log::warn!("Refusing to dispatch empty utterance for turn {}", turn);
                    return;
                }

                let Some(permit) = self.latch.try_acquire() else {
                    tokio::spawn(async move {
                        let _ = tx.send(Event::DispatchRejected { turn }).await;
                    });
                    return;
                };

                let transport = self.transport.clone();
                tokio::spawn(async move {
                    log::info!("Dispatching turn {} ({} chars)", turn, text.chars().count());
                    let _ = tx
                        .send(Event::DispatchAccepted {
                            turn,
                            text: text.clone(),
                        })
                        .await;
                    let result = transport.send(&text, mode_tag).await;
                    drop(permit);

                    let event = match result {
                        Ok(reply) => Event::ReplyReceived { turn, reply },
                        Err(error) => Event::ReplyFailed { turn, error },
                    };
                    let _ = tx.send(event).await;
                });
            }

            Effect::Speak { turn, text } => {
                if let Err(e) = self.sink.speak(&text) {
                    log::error!("Speech sink refused turn {}: {}", turn, e);
                    let message = e.to_string();
                    tokio::spawn(async move {
                        let _ = tx.send(Event::SpeakFailed { turn, message }).await;
                    });
                }
            }

            Effect::StopPlayback => {
                if let Err(e) = self.sink.stop() {
                    log::debug!("Speech sink stop ignored: {}", e);
                }
            }

            Effect::Notify(_) | Effect::EmitUi => {
                // Handled by the state loop
                log::warn!("Notify/EmitUi reached effect runner - should be handled in state loop");
            }
        }
    }
}
