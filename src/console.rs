//! Terminal front end for the voice engine
//!
//! Stands in for the platform speech bridges: every stdin line is treated as
//! more recognized speech for the current turn, and replies are "spoken" by
//! printing them. Commands:
//!
//! - `/mic` toggles the conversation
//! - `/end` makes the recognizer end the session on its own
//! - `/fail` reports a recognizer error
//! - `/mode <free|roleplay|correction>` switches the mode tag
//! - `/type <text>` sends a typed message through the shared chat session
//! - `/quit` exits

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use crate::capabilities::{PlaybackListener, RecognitionListener, SpeechSink, SpeechSource};
use crate::chat::{ChatSession, SendLatch};
use crate::error::CapabilityError;
use crate::mode::ChatMode;
use crate::settings::{default_settings_path, load_settings, VoiceSettings};
use crate::state_machine::ConversationNotice;
use crate::transport::{api_key_from_env, HttpChatTransport};
use crate::VoiceConversation;

/// Recognizer fed from stdin. Lines accumulate into one cumulative transcript per turn.
#[derive(Default)]
pub struct ConsoleSource {
    current: Mutex<Option<(RecognitionListener, String)>>,
}

impl ConsoleSource {
    /// Append a heard line and report the whole transcript so far.
    /// Returns false when no recognition session is running.
    pub fn hear(&self, line: &str) -> bool {
        let mut current = self.current.lock();
        match current.as_mut() {
            Some((listener, transcript)) if listener.is_active() => {
                if !transcript.is_empty() {
                    transcript.push(' ');
                }
                transcript.push_str(line.trim());
                listener.text(transcript);
                true
            }
            _ => false,
        }
    }

    pub fn end_session(&self) {
        if let Some((listener, _)) = self.current.lock().take() {
            listener.natural_end();
        }
    }

    pub fn fail(&self, message: &str) {
        if let Some((listener, _)) = self.current.lock().take() {
            listener.error(message);
        }
    }
}

impl SpeechSource for ConsoleSource {
    fn start(&self, listener: RecognitionListener) -> Result<(), CapabilityError> {
        *self.current.lock() = Some((listener, String::new()));
        Ok(())
    }

    fn stop(&self) -> Result<(), CapabilityError> {
        self.current
            .lock()
            .take()
            .map(|_| ())
            .ok_or(CapabilityError::NotActive)
    }
}

/// Speech sink that prints replies instead of vocalizing them
#[derive(Default)]
pub struct ConsoleSink {
    listener: Mutex<Option<PlaybackListener>>,
}

impl SpeechSink for ConsoleSink {
    fn speak(&self, text: &str) -> Result<(), CapabilityError> {
        let listener = self.listener.lock().clone();
        let Some(listener) = listener else {
            return Err(CapabilityError::Unavailable("no playback listener".to_string()));
        };

        listener.started();
        println!("assistant> {}", text);
        listener.finished();
        Ok(())
    }

    fn stop(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    fn subscribe(&self, listener: PlaybackListener) {
        *self.listener.lock() = Some(listener);
    }
}

fn load_console_settings() -> VoiceSettings {
    match default_settings_path() {
        Ok(path) => {
            log::info!("Loading settings from {:?}", path);
            load_settings(&path)
        }
        Err(e) => {
            log::warn!("{}; using default settings", e);
            VoiceSettings::default()
        }
    }
}

fn parse_mode(name: &str) -> Option<ChatMode> {
    ChatMode::all()
        .iter()
        .copied()
        .find(|m| m.label().eq_ignore_ascii_case(name.trim()))
}

fn print_notice(notice: &ConversationNotice) {
    match notice {
        ConversationNotice::UserTurn { text, .. } => println!("you> {}", text),
        // printed by the sink when spoken
        ConversationNotice::AssistantReply { .. } => {}
        ConversationNotice::Alert(e) => eprintln!("!! {}", e),
    }
}

/// Run the console conversation until `/quit` or end of input.
pub async fn run() -> std::io::Result<()> {
    let settings = load_console_settings();

    let transport = HttpChatTransport::new(&settings.transport).with_api_key(api_key_from_env());
    log::info!("Chat endpoint: {}", transport.endpoint());
    let transport = Arc::new(transport);

    let source = Arc::new(ConsoleSource::default());
    let sink = Arc::new(ConsoleSink::default());
    let latch = SendLatch::new();

    let conversation = VoiceConversation::spawn(
        &settings,
        source.clone(),
        sink,
        transport.clone(),
        latch.clone(),
    );
    let mut session = ChatSession::new(transport, latch, settings.mode);
    let mut notices = conversation.subscribe();

    println!("/mic to start talking, /quit to exit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();

                match line.split_once(' ').unwrap_or((line, "")) {
                    ("/quit", _) => break,
                    ("/mic", _) => {
                        if conversation.on_mic_button_pressed().await.is_err() {
                            break;
                        }
                    }
                    ("/end", _) => source.end_session(),
                    ("/fail", _) => source.fail("simulated recognizer error"),
                    ("/mode", name) => match parse_mode(name) {
                        Some(mode) => {
                            session.set_mode(mode);
                            if conversation.set_mode(mode).await.is_err() {
                                break;
                            }
                            println!("mode: {}", mode);
                        }
                        None => eprintln!("unknown mode {:?}", name),
                    },
                    ("/type", text) => match session.send_typed(text).await {
                        Ok(reply) => println!("assistant> {}", reply),
                        Err(e) => eprintln!("!! {}", e),
                    },
                    ("", _) => {}
                    _ => {
                        if !source.hear(line) {
                            println!("(not listening, /mic to start)");
                        }
                    }
                }
            }

            notice = notices.recv() => match notice {
                Ok(notice) => {
                    print_notice(&notice);
                    session.apply_notice(&notice);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Missed {} conversation notices", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let summary = conversation.metrics();
    log::info!(
        "Session summary: {} turns, {} answered, {} failed, avg latency {}ms",
        summary.total_turns,
        summary.successful_turns,
        summary.failed_turns,
        summary.avg_reply_latency_ms
    );
    conversation.shutdown().await;
    Ok(())
}
