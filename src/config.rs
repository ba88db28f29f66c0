//! Configuration types for the voice-chat core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Main chat channel settings.
    pub transport: TransportConfig,
    /// Which speech backend drives recognition and synthesis.
    pub speech: SpeechConfig,
    /// Transport-relayed speech backend settings.
    pub relay: RelayConfig,
    /// Managed cloud speech backend settings.
    pub managed: ManagedConfig,
    /// Audio device selection.
    pub audio: AudioConfig,
    /// Spectrum analyser settings used for lip-sync.
    pub analyser: AnalyserConfig,
    /// Lip-sync loop settings.
    pub lipsync: LipSyncConfig,
}

/// Main chat channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket endpoint, e.g. `wss://chat.example.com/ws/room/1`.
    pub url: String,
    /// Interval between system `ping` messages.
    pub keepalive_interval_ms: u64,
    /// Compress outbound envelopes into binary frames.
    pub compress: bool,
    /// Brotli quality level (0-11).
    pub compression_quality: u32,
    /// Envelope field the access id is stamped into.
    pub access_id_field: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws/chat/".to_owned(),
            keepalive_interval_ms: 5_000,
            compress: true,
            compression_quality: 4,
            access_id_field: "requestAccessId".to_owned(),
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }
}

/// Speech backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechBackendKind {
    /// Cloud speech SDK called directly.
    #[default]
    Managed,
    /// Raw audio relayed over a dedicated WebSocket.
    Relayed,
}

/// Speech backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub backend: SpeechBackendKind,
}

/// Transport-relayed speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket endpoint of the speech relay.
    pub url: String,
    /// PCM sample rate sent to the relay, in Hz.
    pub sample_rate: u32,
    /// Duration of each microphone chunk in milliseconds.
    pub chunk_ms: u32,
    /// Binary payload that marks the end of an utterance.
    pub end_sentinel: String,
    /// Interval between relay `ping` messages.
    pub keepalive_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws/speech/".to_owned(),
            sample_rate: 16_000,
            chunk_ms: 25,
            end_sentinel: "sttend".to_owned(),
            keepalive_interval_ms: 5_000,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }

    /// Number of mono samples in one capture chunk.
    #[must_use]
    pub fn chunk_samples(&self) -> usize {
        (self.sample_rate as usize * self.chunk_ms as usize / 1000).max(1)
    }
}

/// Managed cloud speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagedConfig {
    /// Authenticated endpoint issuing short-lived speech credentials.
    pub token_endpoint: String,
    /// Bearer token presented to the credential endpoint, if any.
    pub api_token: Option<String>,
    /// Recognition language (BCP-47).
    pub language: String,
    /// Synthesis voice name.
    pub voice: String,
    /// Delay between SDK stop and flushing the utterance.
    pub settle_delay_ms: u64,
    /// Lifetime of a cached credential.
    pub token_ttl_secs: u64,
}

impl Default for ManagedConfig {
    fn default() -> Self {
        Self {
            token_endpoint: "http://127.0.0.1:8000/api/speech/token/".to_owned(),
            api_token: None,
            language: "ja-JP".to_owned(),
            voice: "ja-JP-AoiNeural".to_owned(),
            settle_delay_ms: 400,
            token_ttl_secs: 540,
        }
    }
}

impl ManagedConfig {
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

/// Spectrum analyser configuration.
///
/// Mirrors the knobs of a browser `AnalyserNode` so that lip-sync curves
/// tuned against one behave the same against the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyserConfig {
    /// FFT window length; must be a power of two.
    pub fft_size: usize,
    /// Time smoothing constant in `[0, 1)`.
    pub smoothing: f32,
    /// Decibel value mapped to byte 0.
    pub min_decibels: f32,
    /// Decibel value mapped to byte 255.
    pub max_decibels: f32,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            smoothing: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

/// Lip-sync loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LipSyncConfig {
    /// Animation frame interval in milliseconds.
    pub frame_interval_ms: u64,
    /// Consecutive silent frames before the loop stops itself.
    pub silence_frames: u32,
    /// Mean spectrum amplitude below which the mouth is closed.
    pub amplitude_threshold: u32,
    /// Relaxed expression weight restored when the loop exits.
    pub relaxed_weight: f32,
}

impl Default for LipSyncConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 16,
            silence_frames: 300,
            amplitude_threshold: 10,
            relaxed_weight: 0.2,
        }
    }
}

impl LipSyncConfig {
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }
}

impl ChatConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::ChatError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::ChatError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/vrmchat/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("vrmchat").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("vrmchat")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/vrmchat-config/config.toml")
        }
    }
}
