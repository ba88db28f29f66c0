//! Error types for the voice-chat core.

/// Top-level error type for transport, speech and playback.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Failed connect or abrupt close of a socket.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed or undecodable frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Microphone or audio output unavailable, or permission denied.
    #[error("device error: {0}")]
    Device(String),

    /// Missing or invalid synthesis payload, or audio decode failure.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Speech-service credential fetch failure.
    #[error("credential error: {0}")]
    Credential(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Internal channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Text shown to the user for this error.
    ///
    /// Protocol failures never leak their internals.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Connection(_) => "Connection error".to_owned(),
            Self::Protocol(_) => "communication error".to_owned(),
            Self::Device(detail) => format!("Audio device unavailable: {detail}"),
            Self::Synthesis(_) => "No speech?".to_owned(),
            Self::Credential(_) => "Could not authorize the speech service".to_owned(),
            Self::Config(detail) => format!("Invalid configuration: {detail}"),
            Self::Channel(_) | Self::Io(_) => "Internal error".to_owned(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ChatError>;
