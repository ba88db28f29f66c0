//! vrmchat: realtime voice chat with a 3D avatar.
//!
//! This crate is the client core of a voice chat room:
//! Microphone → speech recognition → chat server → reply → speech synthesis → Speaker,
//! with the avatar's mouth driven by the reply audio.
//!
//! # Architecture
//!
//! Independent actors connected by async channels:
//! - **Transport**: one WebSocket to the chat server with brotli framing,
//!   keepalive pings, reconnects and access id stamping
//! - **Router**: dispatches inbound envelopes to command handlers
//! - **Speech**: interchangeable backends, either a managed cloud speech
//!   service or audio relayed over a second socket
//! - **Audio**: microphone capture, clip decoding and playback via `cpal`
//! - **Lip-sync**: maps the playback spectrum onto avatar mouth expressions
//! - **Session**: glues finished utterances, replies and playback together

pub mod audio;
pub mod config;
pub mod error;
pub mod lipsync;
pub mod notify;
pub mod router;
pub mod sanitize;
pub mod session;
pub mod speech;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::ChatConfig;
pub use error::{ChatError, Result};
pub use notify::{Notifier, Toast, ToastLevel};
pub use router::{CommandHandler, MessageRouter};
pub use session::VoiceChat;
pub use speech::{SpeechBackend, SpeechEvent};
pub use transport::{ChannelHandle, ConnectionState, chat_channel};
