//! Application command handlers for the voice chat room.

use super::CommandHandler;
use crate::error::{ChatError, Result};
use crate::sanitize::sanitize_text;
use crate::speech::SpeechBackend;
use crate::transport::InboundEnvelope;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Reply to a submitted utterance.
pub const SEND_USER_MESSAGE: &str = "SendUserMessage";
/// Room title change.
pub const CHANGE_ROOM_NAME: &str = "ChangeRoomName";

/// What the host UI shows of the conversation.
pub trait ConversationView: Send + Sync + 'static {
    fn show_reply(&self, text: &str);
    fn clear_reply(&self);
    fn set_room_title(&self, title: &str);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub reply: String,
    pub room_title: String,
}

/// [`ConversationView`] published through a `watch` channel.
#[derive(Debug)]
pub struct SharedConversation {
    tx: watch::Sender<ConversationSnapshot>,
}

impl Default for SharedConversation {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedConversation {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConversationSnapshot::default());
        Self { tx }
    }

    #[must_use]
    pub fn snapshot(&self) -> ConversationSnapshot {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConversationSnapshot> {
        self.tx.subscribe()
    }
}

impl ConversationView for SharedConversation {
    fn show_reply(&self, text: &str) {
        self.tx.send_modify(|s| s.reply = text.to_owned());
    }

    fn clear_reply(&self) {
        self.tx.send_modify(|s| s.reply.clear());
    }

    fn set_room_title(&self, title: &str) {
        self.tx.send_modify(|s| s.room_title = title.to_owned());
    }
}

/// Shows the model's reply and speaks it.
pub struct SendUserMessageHandler {
    view: Arc<dyn ConversationView>,
    speech: Arc<dyn SpeechBackend>,
}

impl SendUserMessageHandler {
    pub fn new(view: Arc<dyn ConversationView>, speech: Arc<dyn SpeechBackend>) -> Self {
        Self { view, speech }
    }
}

#[async_trait]
impl CommandHandler for SendUserMessageHandler {
    fn command(&self) -> &'static str {
        SEND_USER_MESSAGE
    }

    async fn handle(&self, envelope: InboundEnvelope) -> Result<()> {
        if !envelope.ok {
            return Err(ChatError::Protocol(format!(
                "{SEND_USER_MESSAGE} rejected with status {}",
                envelope.status
            )));
        }

        let reply = sanitize_text(envelope.data_str("llmResponse").unwrap_or_default());
        info!(chars = reply.chars().count(), "reply received");
        self.speech.clear_recognition();
        self.view.show_reply(&reply);

        // Synthesis reports its own failures; the router must not wait on it.
        let speech = Arc::clone(&self.speech);
        tokio::spawn(async move {
            if let Err(e) = speech.synthesize(&reply).await {
                debug!("reply not spoken: {e}");
            }
        });
        Ok(())
    }
}

/// Updates the room title.
pub struct ChangeRoomNameHandler {
    view: Arc<dyn ConversationView>,
}

impl ChangeRoomNameHandler {
    pub fn new(view: Arc<dyn ConversationView>) -> Self {
        Self { view }
    }
}

#[async_trait]
impl CommandHandler for ChangeRoomNameHandler {
    fn command(&self) -> &'static str {
        CHANGE_ROOM_NAME
    }

    async fn handle(&self, envelope: InboundEnvelope) -> Result<()> {
        if envelope.ok {
            let title = sanitize_text(envelope.data_str("roomName").unwrap_or_default());
            self.view.set_room_title(&title);
        }
        Ok(())
    }
}
