pub mod capabilities;
pub mod chat;
pub mod console;
pub mod effects;
pub mod error;
pub mod metrics;
pub mod mode;
pub mod settings;
pub mod state_machine;
pub mod transcript;
pub mod transport;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use capabilities::{PlaybackListener, SpeechSink, SpeechSource};
use chat::SendLatch;
use effects::{CapabilityEffectRunner, EffectRunner};
use error::ConversationError;
use metrics::{ConversationMetrics, MetricsSummary};
use mode::ChatMode;
use settings::VoiceSettings;
use state_machine::{reduce, ConversationNotice, ConversationState, Effect, Engine, Event};
use transport::ChatTransport;

pub use console::run;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const NOTICE_CHANNEL_CAPACITY: usize = 32;

/// UI snapshot of the conversation.
/// Serialized as `{ "state": "listening", "mode": "roleplay" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub state: ConversationState,
    pub mode: ChatMode,
}

impl From<&Engine> for UiState {
    fn from(engine: &Engine) -> Self {
        Self {
            state: engine.state(),
            mode: engine.mode(),
        }
    }
}

/// Outputs of the state loop, shared with the handle
struct LoopOutputs {
    ui: watch::Sender<UiState>,
    notices: broadcast::Sender<ConversationNotice>,
    metrics: Arc<Mutex<ConversationMetrics>>,
}

impl LoopOutputs {
    fn emit_ui(&self, engine: &Engine) {
        let ui = UiState::from(engine);
        log::debug!("Emitting UI state: {:?}", serde_json::to_string(&ui));
        self.ui.send_replace(ui);
    }

    fn notify(&self, notice: ConversationNotice) {
        {
            let mut m = self.metrics.lock();
            match &notice {
                ConversationNotice::UserTurn { turn, text } => {
                    m.turn_dispatched(*turn, text.chars().count());
                }
                ConversationNotice::AssistantReply { turn, text } => {
                    m.turn_completed(*turn, text.chars().count());
                }
                ConversationNotice::Alert(e @ ConversationError::Transport(_)) => m.turn_failed(e),
                ConversationNotice::Alert(e) => m.record_error(e.kind(), e.to_string(), None),
            }
        }

        if let ConversationNotice::Alert(e) = &notice {
            log::error!("Conversation alert: {}", e);
        }
        // no subscribers is fine
        let _ = self.notices.send(notice);
    }
}

/// Handle to a running voice conversation.
///
/// The engine itself lives in a single tokio task; this handle only sends
/// events to it and observes its outputs. Call [`VoiceConversation::shutdown`]
/// to release the capabilities; dropping the handle asks the loop to exit
/// without waiting for it.
pub struct VoiceConversation {
    tx: mpsc::Sender<Event>,
    ui: watch::Receiver<UiState>,
    notices: broadcast::Sender<ConversationNotice>,
    metrics: Arc<Mutex<ConversationMetrics>>,
    task: Option<JoinHandle<()>>,
}

impl VoiceConversation {
    /// Spawn the state loop on the current tokio runtime.
    pub fn spawn(
        settings: &VoiceSettings,
        source: Arc<dyn SpeechSource>,
        sink: Arc<dyn SpeechSink>,
        transport: Arc<dyn ChatTransport>,
        latch: SendLatch,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);

        // Playback lifecycle is wired once for the whole conversation
        sink.subscribe(PlaybackListener::new(tx.clone()));

        let engine = Engine::new(settings.timings(), settings.mode);
        let (ui_tx, ui_rx) = watch::channel(UiState::from(&engine));
        let (notice_tx, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let metrics = Arc::new(Mutex::new(ConversationMetrics::new()));

        let outputs = LoopOutputs {
            ui: ui_tx,
            notices: notice_tx.clone(),
            metrics: metrics.clone(),
        };
        let effect_runner: Arc<dyn EffectRunner> =
            CapabilityEffectRunner::new(source, sink, transport, latch);

        let tx_for_loop = tx.clone();
        let task = tokio::spawn(async move {
            run_state_loop(engine, rx, tx_for_loop, effect_runner, outputs).await;
        });

        Self {
            tx,
            ui: ui_rx,
            notices: notice_tx,
            metrics,
            task: Some(task),
        }
    }

    /// The single user control: start listening when idle, stop otherwise.
    pub async fn on_mic_button_pressed(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(Event::MicToggle).await
    }

    /// Change the mode tag used for subsequent turns.
    pub async fn set_mode(&self, mode: ChatMode) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(Event::ModeChanged(mode)).await
    }

    pub fn state(&self) -> ConversationState {
        self.ui.borrow().state
    }

    /// Observe UI snapshots as they change
    pub fn watch_state(&self) -> watch::Receiver<UiState> {
        self.ui.clone()
    }

    /// Subscribe to user turns, replies and alerts
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationNotice> {
        self.notices.subscribe()
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.lock().get_summary()
    }

    /// Tear the conversation down and wait for the loop to finish.
    pub async fn shutdown(mut self) {
        if self.tx.send(Event::Exit).await.is_err() {
            log::debug!("State loop already gone");
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("State loop task failed: {}", e);
            }
        }
    }
}

impl Drop for VoiceConversation {
    fn drop(&mut self) {
        // The loop and the playback listener hold senders of their own, so
        // closing ours is not enough to end it.
        let Some(task) = self.task.take() else {
            return;
        };
        if task.is_finished() {
            return;
        }
        if self.tx.try_send(Event::Exit).is_err() {
            log::warn!("Event channel unavailable on drop, aborting state loop");
            task.abort();
        }
    }
}

/// Run the main state loop
async fn run_state_loop(
    mut engine: Engine,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    outputs: LoopOutputs,
) {
    log::info!("State loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        // Handle Exit at the edge
        if matches!(event, Event::Exit) {
            log::info!("Exit requested, shutting down state loop");
            for eff in [
                Effect::CancelSilenceTimer,
                Effect::StopRecognition,
                Effect::StopPlayback,
            ] {
                effect_runner.spawn(eff, tx.clone());
            }
            break;
        }

        let recognition_message = match &event {
            Event::RecognitionError { message, .. } => Some(message.clone()),
            _ => None,
        };

        let (next, effects) = reduce(&engine, event);

        // Log state transitions
        if engine.state() != next.state() {
            log::info!(
                "State transition: {} -> {} (turn {})",
                engine.state().as_str(),
                next.state().as_str(),
                next.turn()
            );
        }

        if next.retry_count() > engine.retry_count() {
            if let Some(message) = recognition_message {
                outputs.metrics.lock().recognition_error(&message);
            }
        }

        let left_processing = engine.state() == ConversationState::Processing
            && !matches!(
                next.state(),
                ConversationState::Processing | ConversationState::Speaking
            );

        engine = next;

        // Execute effects
        for eff in effects {
            match eff {
                Effect::EmitUi => outputs.emit_ui(&engine),
                Effect::Notify(notice) => outputs.notify(notice),
                other => effect_runner.spawn(other, tx.clone()),
            }
        }

        // Stopped or rejected while a request was out; a failure was already recorded
        if left_processing {
            outputs.metrics.lock().turn_abandoned();
        }
    }

    log::info!("State loop ended");
}
