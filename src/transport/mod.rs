//! Chat transport: socket lifecycle, keepalive and brotli framing.

pub mod channel;
pub mod codec;
pub mod envelope;
pub mod keepalive;
pub mod link;
pub mod socket;

pub use channel::{
    ChannelHandle, ChannelManager, ChannelSnapshot, SendOptions, Visibility, chat_channel,
};
pub use envelope::{InboundEnvelope, OutboundEnvelope, SystemCommand};
pub use link::ConnectionState;
pub use socket::{Connector, Frame, WsConnector};
