//! Speech backend driving a cloud speech service directly.
//!
//! Recognition runs continuously between `start_capture` and
//! `stop_capture`. After the recognizer is stopped the turn is held open
//! for a short settle delay so that a trailing finalized segment still
//! lands in the utterance. Restarting capture inside that window cancels
//! the pending flush and begins a fresh turn.

use super::credentials::{CredentialPurpose, CredentialSource, SpeechCredential};
use super::session::{RecognitionSession, RecognitionSnapshot};
use super::{SpeechBackend, SpeechEvent};
use crate::audio::{PlaybackEvent, Player, decode_audio};
use crate::config::ManagedConfig;
use crate::error::{ChatError, Result};
use crate::notify::{Notifier, Toast};
use crate::sanitize::sanitize_text;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result stream of a continuous recognition session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// Partial hypothesis for the phrase in progress.
    Recognizing(String),
    /// Final text of a phrase.
    Recognized(String),
    /// A phrase ended without recognizable speech.
    NoMatch,
    Canceled(String),
}

/// Continuous cloud speech recognition.
#[async_trait]
pub trait CloudRecognizer: Send + Sync + 'static {
    /// Start recognizing from the microphone, reporting into `events`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Device`] if the microphone cannot be claimed
    /// and [`ChatError::Connection`] if the service is unreachable.
    async fn start_continuous(
        &self,
        credential: &SpeechCredential,
        language: &str,
        events: mpsc::UnboundedSender<RecognizerEvent>,
    ) -> Result<()>;

    /// Stop recognizing and release the microphone.
    ///
    /// # Errors
    ///
    /// Returns an error if the service rejected the stop.
    async fn stop_continuous(&self) -> Result<()>;
}

/// Cloud text-to-speech.
#[async_trait]
pub trait CloudSynthesizer: Send + Sync + 'static {
    /// Synthesize `text` into an encoded audio payload.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Synthesis`] if the service produced no audio.
    async fn synthesize(
        &self,
        credential: &SpeechCredential,
        voice: &str,
        language: &str,
        text: &str,
    ) -> Result<Vec<u8>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(p) => p.into_inner(),
    }
}

/// [`SpeechBackend`] backed by a cloud speech service.
pub struct ManagedSpeech {
    language: String,
    voice: String,
    settle_delay: Duration,
    credentials: Arc<dyn CredentialSource>,
    recognizer: Arc<dyn CloudRecognizer>,
    synthesizer: Arc<dyn CloudSynthesizer>,
    player: Arc<Player>,
    notifier: Arc<dyn Notifier>,
    session: Arc<Mutex<RecognitionSession>>,
    events: broadcast::Sender<SpeechEvent>,
    /// Pending utterance flush of the last stopped turn.
    settle: Mutex<Option<CancellationToken>>,
    /// Serializes start and stop.
    control: tokio::sync::Mutex<()>,
}

impl ManagedSpeech {
    pub fn new(
        config: &ManagedConfig,
        credentials: Arc<dyn CredentialSource>,
        recognizer: Arc<dyn CloudRecognizer>,
        synthesizer: Arc<dyn CloudSynthesizer>,
        player: Arc<Player>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            language: config.language.clone(),
            voice: config.voice.clone(),
            settle_delay: config.settle_delay(),
            credentials,
            recognizer,
            synthesizer,
            player,
            notifier,
            session: Arc::new(Mutex::new(RecognitionSession::new())),
            events,
            settle: Mutex::new(None),
            control: tokio::sync::Mutex::new(()),
        }
    }

    fn cancel_settle(&self) {
        if let Some(pending) = lock(&self.settle).take() {
            pending.cancel();
        }
    }

    async fn open_recognizer(&self) -> Result<mpsc::UnboundedReceiver<RecognizerEvent>> {
        let credential = self
            .credentials
            .credential(CredentialPurpose::Recognition)
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.recognizer
            .start_continuous(&credential, &self.language, tx)
            .await?;
        Ok(rx)
    }

    async fn speak(&self, text: &str) -> Result<()> {
        let credential = self
            .credentials
            .credential(CredentialPurpose::Synthesis)
            .await?;
        let payload = self
            .synthesizer
            .synthesize(&credential, &self.voice, &self.language, text)
            .await?;
        let audio = decode_audio(payload)?;
        self.player.play(audio)?;
        Ok(())
    }
}

#[async_trait]
impl SpeechBackend for ManagedSpeech {
    fn name(&self) -> &'static str {
        "managed"
    }

    async fn start_capture(&self) -> Result<()> {
        let _turn = self.control.lock().await;
        if lock(&self.session).is_recognizing() {
            debug!("already recognizing");
            return Ok(());
        }

        self.player.stop();
        self.cancel_settle();
        let epoch = lock(&self.session).begin();

        match self.open_recognizer().await {
            Ok(results) => {
                info!(epoch, language = %self.language, "recognition started");
                tokio::spawn(pump_results(
                    results,
                    Arc::clone(&self.session),
                    self.events.clone(),
                    Arc::clone(&self.notifier),
                    epoch,
                ));
                Ok(())
            }
            Err(e) => {
                lock(&self.session).end_capture();
                warn!("recognition did not start: {e}");
                let toast = match &e {
                    ChatError::Credential(_) | ChatError::Device(_) => Toast::from_error(&e),
                    _ => Toast::error("Failed to start recognition"),
                };
                self.notifier.notify(toast);
                Err(e)
            }
        }
    }

    async fn stop_capture(&self) -> Result<()> {
        let _turn = self.control.lock().await;
        let epoch = {
            let mut session = lock(&self.session);
            if !session.is_recognizing() {
                return Ok(());
            }
            session.end_capture();
            session.epoch()
        };

        if let Err(e) = self.recognizer.stop_continuous().await {
            warn!("recognizer stop failed: {e}");
            self.notifier.notify(Toast::error("Failed to stop recognition"));
            return Err(e);
        }

        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.settle).replace(cancel.clone()) {
            previous.cancel();
        }
        tokio::spawn(settle_turn(
            Arc::clone(&self.session),
            self.events.clone(),
            cancel,
            self.settle_delay,
            epoch,
        ));
        Ok(())
    }

    fn is_active(&self) -> bool {
        lock(&self.session).is_recognizing()
    }

    async fn synthesize(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.player.stop();
        let result = self.speak(text).await;
        if let Err(e) = &result {
            self.notifier.report(e);
        }
        result
    }

    fn stop_playback(&self) {
        self.player.stop();
    }

    fn recognition(&self) -> RecognitionSnapshot {
        lock(&self.session).snapshot()
    }

    fn clear_recognition(&self) {
        lock(&self.session).clear();
    }

    fn subscribe(&self) -> broadcast::Receiver<SpeechEvent> {
        self.events.subscribe()
    }

    fn subscribe_playback(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.player.subscribe()
    }
}

impl Drop for ManagedSpeech {
    fn drop(&mut self) {
        self.cancel_settle();
    }
}

async fn pump_results(
    mut results: mpsc::UnboundedReceiver<RecognizerEvent>,
    session: Arc<Mutex<RecognitionSession>>,
    events: broadcast::Sender<SpeechEvent>,
    notifier: Arc<dyn Notifier>,
    epoch: u64,
) {
    while let Some(result) = results.recv().await {
        let mut turn = lock(&session);
        if turn.epoch() != epoch {
            debug!(epoch, "dropping results of a superseded turn");
            break;
        }
        match result {
            RecognizerEvent::Recognizing(text) => {
                let text = sanitize_text(&text);
                turn.set_interim(text.clone());
                let _ = events.send(SpeechEvent::Interim(text));
            }
            RecognizerEvent::Recognized(text) => {
                let text = sanitize_text(&text);
                turn.push_final(text.clone());
                let _ = events.send(SpeechEvent::Finalized(text));
            }
            RecognizerEvent::NoMatch => notifier.notify(Toast::warning("No speech?")),
            RecognizerEvent::Canceled(reason) => {
                warn!(%reason, "recognition canceled");
                notifier.notify(Toast::error("canceled"));
            }
        }
    }
}

async fn settle_turn(
    session: Arc<Mutex<RecognitionSession>>,
    events: broadcast::Sender<SpeechEvent>,
    cancel: CancellationToken,
    delay: Duration,
    epoch: u64,
) {
    tokio::select! {
        () = cancel.cancelled() => {
            debug!(epoch, "utterance flush cancelled");
            return;
        }
        () = tokio::time::sleep(delay) => {}
    }
    let utterance = lock(&session).finish(epoch, false);
    if let Some(utterance) = utterance {
        debug!(epoch, chars = utterance.chars().count(), "utterance ready");
        let _ = events.send(SpeechEvent::UtteranceReady(utterance));
    }
}
