//! Speech recognition and synthesis backends.
//!
//! [`SpeechBackend`] is the strategy both backends implement:
//!
//! - [`managed::ManagedSpeech`] drives a cloud speech service directly,
//!   fetching short-lived credentials from the chat server.
//! - [`relayed::RelayedSpeech`] streams raw microphone PCM over its own
//!   WebSocket side-channel and receives transcripts and synthesized audio
//!   back over the same socket.
//!
//! Both expose the same sequencing: `is_recognizing` while capturing, then
//! `is_stopping` once the utterance is complete, announced with
//! [`SpeechEvent::UtteranceReady`]. The consumer reads the utterance and
//! calls [`SpeechBackend::clear_recognition`] before the next turn.

pub mod azure;
pub mod credentials;
pub mod managed;
pub mod relayed;
pub mod session;

pub use credentials::{CredentialPurpose, CredentialSource, SpeechCredential, TokenClient};
pub use azure::{AzureRestSynthesizer, AzureStreamingRecognizer};
pub use managed::{CloudRecognizer, CloudSynthesizer, ManagedSpeech, RecognizerEvent};
pub use relayed::{RelayWorker, RelayedSpeech, relayed_speech};
pub use session::{RecognitionSession, RecognitionSnapshot};

use crate::audio::PlaybackEvent;
use crate::error::Result;
use crate::transport::Visibility;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Progress of the current recognition turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    Interim(String),
    Finalized(String),
    /// Capture stopped and every segment has arrived.
    UtteranceReady(String),
}

/// Interchangeable speech recognition and synthesis.
#[async_trait]
pub trait SpeechBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Claim the microphone and start a new turn. No-op while capturing.
    ///
    /// # Errors
    ///
    /// Device and credential failures are shown to the user and returned;
    /// the backend is left not recognizing.
    async fn start_capture(&self) -> Result<()>;

    /// Stop capturing. The utterance follows as
    /// [`SpeechEvent::UtteranceReady`] once the last segment arrived.
    /// No-op when not capturing.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the recognizer.
    async fn stop_capture(&self) -> Result<()>;

    fn is_active(&self) -> bool;

    /// Speak `text`, replacing any playback in progress. Empty text is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Synthesis, decode and device failures are shown to the user and
    /// returned.
    async fn synthesize(&self, text: &str) -> Result<()>;

    /// Stop playback and release the output device. Idempotent.
    fn stop_playback(&self);

    fn recognition(&self) -> RecognitionSnapshot;

    /// Forget the consumed utterance.
    fn clear_recognition(&self);

    fn subscribe(&self) -> broadcast::Receiver<SpeechEvent>;

    fn subscribe_playback(&self) -> broadcast::Receiver<PlaybackEvent>;

    /// Host visibility changed. Backends owning a socket tear it down on
    /// hide and restore it on show.
    fn set_visibility(&self, _visibility: Visibility) {}
}
