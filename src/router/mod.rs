//! Inbound envelope dispatch.
//!
//! The channel manager forwards every non-transport envelope here. The
//! router handles the shared `Reconnect` and `Error` commands itself and
//! passes application commands to the [`CommandHandler`] registered under
//! their name. Whatever the outcome, the channel's pending-send flag is
//! cleared once the envelope has been handled.

pub mod handlers;

pub use handlers::{
    ChangeRoomNameHandler, ConversationSnapshot, ConversationView, SendUserMessageHandler,
    SharedConversation,
};

use crate::error::Result;
use crate::notify::{Notifier, Toast};
use crate::sanitize::sanitize_text;
use crate::transport::{ChannelHandle, InboundEnvelope, SystemCommand};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Handles one application command.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Wire name of the command.
    fn command(&self) -> &'static str;

    /// # Errors
    ///
    /// Any error is shown to the user as a generic receive error.
    async fn handle(&self, envelope: InboundEnvelope) -> Result<()>;
}

/// Dispatches inbound envelopes by command name.
pub struct MessageRouter {
    channel: ChannelHandle,
    notifier: Arc<dyn Notifier>,
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
}

impl MessageRouter {
    pub fn new(channel: ChannelHandle, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            channel,
            notifier,
            handlers: HashMap::new(),
        }
    }

    /// Register `handler`, replacing any handler for the same command.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        if self.handlers.insert(handler.command(), handler).is_some() {
            debug!("command handler replaced");
        }
        self
    }

    /// Route envelopes until the channel manager stops.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<InboundEnvelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.dispatch(envelope).await;
        }
        debug!("message router stopped");
    }

    pub async fn dispatch(&self, envelope: InboundEnvelope) {
        match envelope.system_command() {
            Some(SystemCommand::Reconnect) => trace!("reconnect acknowledged"),
            Some(SystemCommand::Error) => {
                let message = envelope.message.as_deref().map(sanitize_text);
                warn!(status = envelope.status, ?message, "server reported an error");
                if let Some(message) = message.filter(|m| !m.is_empty()) {
                    self.notifier.notify(Toast::error(message));
                }
            }
            Some(command) => debug!(?command, "transport command reached the router"),
            None => match self.handlers.get(envelope.cmd.as_str()) {
                Some(handler) => {
                    let cmd = envelope.cmd.clone();
                    if let Err(e) = handler.handle(envelope).await {
                        warn!(%cmd, "handler failed: {e}");
                        self.notifier.notify(Toast::error("receive error"));
                    }
                }
                None => debug!(cmd = %envelope.cmd, "no handler registered"),
            },
        }

        if let Err(e) = self.channel.clear_pending() {
            debug!("pending flag not cleared: {e}");
        }
    }
}
