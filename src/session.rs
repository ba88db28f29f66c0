//! Turn glue between speech, the chat channel and the avatar.
//!
//! [`VoiceChat`] owns no state machine of its own. It submits each
//! completed utterance to the chat channel, feeds playback to the lip-sync
//! bridge and maps user input (toggle, push-to-talk, visibility) onto the
//! speech backend and the channel.

use crate::audio::PlaybackEvent;
use crate::error::Result;
use crate::lipsync::LipSyncBridge;
use crate::router::ConversationView;
use crate::router::handlers::SEND_USER_MESSAGE;
use crate::speech::{SpeechBackend, SpeechEvent};
use crate::transport::{ChannelHandle, Visibility};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct VoiceChat {
    channel: ChannelHandle,
    speech: Arc<dyn SpeechBackend>,
    view: Arc<dyn ConversationView>,
    lipsync: Arc<LipSyncBridge>,
    talk_held: AtomicBool,
}

impl VoiceChat {
    pub fn new(
        channel: ChannelHandle,
        speech: Arc<dyn SpeechBackend>,
        view: Arc<dyn ConversationView>,
        lipsync: Arc<LipSyncBridge>,
    ) -> Self {
        Self {
            channel,
            speech,
            view,
            lipsync,
            talk_held: AtomicBool::new(false),
        }
    }

    /// Subscribe to speech and playback events and process them on a new
    /// task until the backend goes away.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let speech_events = self.speech.subscribe();
        let playback_events = self.speech.subscribe_playback();
        let chat = Arc::clone(self);
        tokio::spawn(async move { chat.run(speech_events, playback_events).await })
    }

    async fn run(
        &self,
        mut speech_events: broadcast::Receiver<SpeechEvent>,
        mut playback_events: broadcast::Receiver<PlaybackEvent>,
    ) {
        loop {
            tokio::select! {
                event = speech_events.recv() => match event {
                    Ok(SpeechEvent::UtteranceReady(utterance)) => self.submit_utterance(&utterance),
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => warn!(missed, "speech events lagged"),
                    Err(RecvError::Closed) => break,
                },
                event = playback_events.recv() => match event {
                    Ok(event) => self.lipsync.on_playback(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "playback events lagged, resting the avatar");
                        self.lipsync.stop();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("voice chat glue stopped");
    }

    fn submit_utterance(&self, utterance: &str) {
        if utterance.trim().is_empty() {
            debug!("empty utterance, nothing to send");
            self.speech.clear_recognition();
            return;
        }
        info!(chars = utterance.chars().count(), "submitting utterance");
        if let Err(e) = self.send_message(utterance) {
            warn!("utterance not submitted: {e}");
        }
    }

    /// Send `message` as the user's turn.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`](crate::error::ChatError::Channel) if
    /// the channel manager has stopped.
    pub fn send_message(&self, message: &str) -> Result<()> {
        self.view.clear_reply();
        let mut data = Map::new();
        data.insert("message".into(), Value::String(message.to_owned()));
        self.channel.send_command(SEND_USER_MESSAGE, data)
    }

    /// Start capturing if idle, otherwise stop.
    ///
    /// # Errors
    ///
    /// Returns the backend's start or stop error.
    pub async fn toggle_recognition(&self) -> Result<()> {
        if self.speech.is_active() {
            self.speech.stop_capture().await
        } else {
            self.speech.start_capture().await
        }
    }

    /// Push-to-talk key went down. Repeats while held are ignored.
    ///
    /// # Errors
    ///
    /// Returns the backend's start error.
    pub async fn press_to_talk(&self) -> Result<()> {
        if self.talk_held.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.speech.start_capture().await
    }

    /// Push-to-talk key came up.
    ///
    /// # Errors
    ///
    /// Returns the backend's stop error.
    pub async fn release_to_talk(&self) -> Result<()> {
        if !self.talk_held.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.speech.stop_capture().await
    }

    /// Forward a host visibility change to the channel and the speech
    /// backend.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`](crate::error::ChatError::Channel) if
    /// the channel manager has stopped.
    pub fn set_visibility(&self, visibility: Visibility) -> Result<()> {
        if visibility == Visibility::Hidden {
            self.lipsync.stop();
        }
        self.speech.set_visibility(visibility);
        self.channel.set_visibility(visibility)
    }
}
