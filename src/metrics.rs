//! Metrics collection for voice conversations
//!
//! Tracks reply latency, utterance sizes, and error history for dispatched
//! turns. Used for diagnostics and performance monitoring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

use crate::error::ConversationError;

/// Maximum number of finished turns to retain in history
const MAX_TURN_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for one dispatched turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetrics {
    /// Turn number within the engine
    pub turn: u64,
    /// When the utterance was sent
    pub dispatched_at: DateTime<Utc>,
    /// Length of the sent utterance in characters
    pub utterance_chars: u64,
    /// Time from dispatch to reply (or failure) in milliseconds
    pub reply_latency_ms: u64,
    /// Length of the reply in characters
    pub reply_chars: u64,
    /// Whether a reply came back
    pub success: bool,
    /// Error message if the turn failed
    pub error_message: Option<String>,
}

/// Summary statistics across all recorded turns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_turns: u64,
    pub successful_turns: u64,
    pub failed_turns: u64,
    /// Recognizer errors seen over the engine's lifetime
    pub recognition_errors: u64,
    /// Average reply latency (ms) across successful turns
    pub avg_reply_latency_ms: u64,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    /// Category of error (e.g., "recognition", "network", "rate_limited")
    pub error_type: String,
    pub message: String,
    /// Associated turn, if applicable
    pub turn: Option<u64>,
}

struct TurnInProgress {
    turn: u64,
    dispatched_at: DateTime<Utc>,
    started: Instant,
    utterance_chars: usize,
}

impl TurnInProgress {
    fn to_metrics(&self, reply_chars: usize, error_message: Option<String>) -> TurnMetrics {
        TurnMetrics {
            turn: self.turn,
            dispatched_at: self.dispatched_at,
            utterance_chars: self.utterance_chars as u64,
            reply_latency_ms: self.started.elapsed().as_millis() as u64,
            reply_chars: reply_chars as u64,
            success: error_message.is_none(),
            error_message,
        }
    }
}

/// Collects and stores metrics for dispatched turns
pub struct ConversationMetrics {
    /// History of finished turns (newest first)
    history: VecDeque<TurnMetrics>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current_turn: Option<TurnInProgress>,
    total_turns: u64,
    successful_turns: u64,
    recognition_errors: u64,
}

impl ConversationMetrics {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_TURN_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current_turn: None,
            total_turns: 0,
            successful_turns: 0,
            recognition_errors: 0,
        }
    }

    /// Start tracking a dispatched turn.
    ///
    /// A turn still in flight is recorded as failed; only one turn can be
    /// outstanding at a time.
    pub fn turn_dispatched(&mut self, turn: u64, utterance_chars: usize) {
        if let Some(old) = self.current_turn.take() {
            log::warn!(
                "Metrics: discarding in-flight turn {} to track turn {}",
                old.turn,
                turn
            );
            let metrics = old.to_metrics(0, Some("Discarded: new turn dispatched".to_string()));
            self.add_to_history(metrics);
        }

        log::debug!("Metrics: turn {} dispatched ({} chars)", turn, utterance_chars);
        self.current_turn = Some(TurnInProgress {
            turn,
            dispatched_at: Utc::now(),
            started: Instant::now(),
            utterance_chars,
        });
        self.total_turns += 1;
    }

    /// Mark the in-flight turn as answered
    pub fn turn_completed(&mut self, turn: u64, reply_chars: usize) {
        match self.current_turn.take() {
            Some(current) if current.turn == turn => {
                let metrics = current.to_metrics(reply_chars, None);
                log::info!(
                    "Metrics: turn {} answered in {}ms ({} chars)",
                    turn,
                    metrics.reply_latency_ms,
                    reply_chars
                );
                self.add_to_history(metrics);
                self.successful_turns += 1;
            }
            other => self.current_turn = other,
        }
    }

    /// Mark the in-flight turn as failed
    pub fn turn_failed(&mut self, error: &ConversationError) {
        let turn = self.current_turn.as_ref().map(|c| c.turn);
        if let Some(current) = self.current_turn.take() {
            let metrics = current.to_metrics(0, Some(error.to_string()));
            log::warn!(
                "Metrics: turn {} failed after {}ms - {}",
                metrics.turn,
                metrics.reply_latency_ms,
                error
            );
            self.add_to_history(metrics);
        }
        self.record_error(error.kind(), error.to_string(), turn);
    }

    /// Drop the in-flight turn without counting it (user stopped, send rejected)
    pub fn turn_abandoned(&mut self) {
        if let Some(current) = self.current_turn.take() {
            log::debug!("Metrics: turn {} abandoned", current.turn);
            self.total_turns = self.total_turns.saturating_sub(1);
        }
    }

    pub fn recognition_error(&mut self, message: &str) {
        self.recognition_errors += 1;
        self.record_error("recognition_attempt", message.to_string(), None);
    }

    /// Record an error (not necessarily tied to a turn)
    pub fn record_error(&mut self, error_type: &str, message: String, turn: Option<u64>) {
        let error = ErrorRecord {
            timestamp: Utc::now(),
            error_type: error_type.to_string(),
            message,
            turn,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let successful: Vec<_> = self.history.iter().filter(|t| t.success).collect();
        let count = successful.len() as u64;

        let avg_latency = if count > 0 {
            successful.iter().map(|t| t.reply_latency_ms).sum::<u64>() / count
        } else {
            0
        };

        MetricsSummary {
            total_turns: self.total_turns,
            successful_turns: self.successful_turns,
            failed_turns: self
                .total_turns
                .saturating_sub(self.successful_turns)
                .saturating_sub(self.current_turn.is_some() as u64),
            recognition_errors: self.recognition_errors,
            avg_reply_latency_ms: avg_latency,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Get the turn history (newest first)
    pub fn get_history(&self) -> Vec<TurnMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Get the error history (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    fn add_to_history(&mut self, metrics: TurnMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_TURN_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for ConversationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
