use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mode::ChatMode;

const SETTINGS_DIR_NAME: &str = "lingo-voice";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Errors reading or writing the settings file
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Settings I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Could not determine config directory")]
    NoConfigDir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Quiet period after the last recognized fragment before the turn is sent.
    pub silence_timeout_ms: u64,

    /// Consecutive recognizer errors tolerated before the session is abandoned.
    pub max_recognition_retries: u32,

    /// Backoff before restarting the recognizer after an error.
    pub retry_backoff_ms: u64,

    /// Delay before restarting the recognizer after it ended with nothing usable.
    pub restart_delay_ms: u64,

    /// How long the dispatch guard stays latched after a turn is sent. Absorbs a late
    /// duplicate end-of-speech event from the recognizer.
    pub dispatch_cooldown_ms: u64,

    /// Delay between entering Speaking and handing the reply to the speech sink.
    pub speak_delay_ms: u64,

    /// Delay between the speech sink finishing and listening again.
    pub resume_delay_ms: u64,

    /// Mode tag sent with every turn.
    pub mode: ChatMode,

    pub transport: TransportSettings,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 3000,
            max_recognition_retries: 5,
            retry_backoff_ms: 800,
            restart_delay_ms: 300,
            dispatch_cooldown_ms: 1000,
            speak_delay_ms: 300,
            resume_delay_ms: 300,
            mode: ChatMode::default(),
            transport: TransportSettings::default(),
        }
    }
}

impl VoiceSettings {
    pub fn timings(&self) -> Timings {
        Timings {
            silence_timeout: Duration::from_millis(self.silence_timeout_ms),
            max_recognition_retries: self.max_recognition_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            dispatch_cooldown: Duration::from_millis(self.dispatch_cooldown_ms),
            speak_delay: Duration::from_millis(self.speak_delay_ms),
            resume_delay: Duration::from_millis(self.resume_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Chat endpoint receiving `{"message", "mode"}` posts.
    pub endpoint: String,

    /// Per-request timeout.
    pub request_timeout_secs: u64,

    /// Total attempts for retryable failures (network, 5xx).
    pub max_attempts: u32,

    /// First retry delay; doubles on each further attempt.
    pub retry_base_delay_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8787/api/chat".to_string(),
            request_timeout_secs: 30,
            max_attempts: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

/// Delays and limits used by the state machine.
///
/// These encode empirically tuned platform behavior of the speech bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub silence_timeout: Duration,
    pub max_recognition_retries: u32,
    pub retry_backoff: Duration,
    pub restart_delay: Duration,
    pub dispatch_cooldown: Duration,
    pub speak_delay: Duration,
    pub resume_delay: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        VoiceSettings::default().timings()
    }
}

/// `<config dir>/lingo-voice/settings.json`
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> VoiceSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<VoiceSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                VoiceSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => VoiceSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            VoiceSettings::default()
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SettingsError {
    let path = path.to_path_buf();
    move |source| SettingsError::Io { path, source }
}

pub fn save_settings(path: &Path, settings: &VoiceSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(io_err(&tmp_path))?;

    // Windows rename fails if the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(io_err(path)(e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(io_err(path))?;
    Ok(())
}
