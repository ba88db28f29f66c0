//! Speech backend relaying raw microphone audio over its own WebSocket.
//!
//! The relay socket is separate from the chat channel: it carries a
//! continuous stream of binary PCM chunks while the user speaks, followed
//! by an end-of-utterance sentinel. Transcripts come back as JSON text
//! frames without a `cmd` field. Synthesis requests and their base64 audio
//! replies travel as `tts` commands on the same socket.
//!
//! [`RelayWorker`] owns the socket and must be driven with
//! [`RelayWorker::run`]. [`RelayedSpeech`] is the [`SpeechBackend`] facing
//! the rest of the application.

use super::session::{RecognitionSession, RecognitionSnapshot};
use super::{SpeechBackend, SpeechEvent};
use crate::audio::{
    CaptureFormat, MicrophoneSource, MicrophoneStream, PlaybackEvent, Player, decode_audio,
};
use crate::config::RelayConfig;
use crate::error::{ChatError, Result};
use crate::notify::{Notifier, Toast, ToastLevel};
use crate::sanitize::sanitize_text;
use crate::transport::keepalive::Keepalive;
use crate::transport::link::{ConnectionState, Link, LinkEvent};
use crate::transport::{Connector, Frame, Visibility};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(p) => p.into_inner(),
    }
}

enum RelayCommand {
    Visibility(Visibility),
    Audio(Vec<u8>),
    EndOfUtterance { epoch: u64 },
    Synthesize(String),
    Close,
}

/// Reply to a `tts` request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesisReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    audio_content: Option<String>,
    #[serde(default)]
    toast_type: Option<String>,
    #[serde(default)]
    toast_message: Option<String>,
}

impl SynthesisReply {
    fn toast(&self) -> Toast {
        let level = match self.toast_type.as_deref() {
            Some("success") => ToastLevel::Success,
            Some("warning") => ToastLevel::Warning,
            Some("error") => ToastLevel::Error,
            _ => ToastLevel::Info,
        };
        Toast {
            level,
            message: self
                .toast_message
                .as_deref()
                .map_or_else(|| "No speech?".to_owned(), sanitize_text),
        }
    }
}

/// Recognition result pushed by the relay.
#[derive(Debug, Deserialize)]
struct TranscriptFrame {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    is_final: bool,
    /// Last frame of a turn whose sentinel was received.
    #[serde(default)]
    is_end: bool,
}

/// Actor owning the relay socket.
pub struct RelayWorker {
    link: Link,
    keepalive: Keepalive,
    end_sentinel: Vec<u8>,
    command_rx: mpsc::UnboundedReceiver<RelayCommand>,
    state_tx: watch::Sender<ConnectionState>,
    session: Arc<Mutex<RecognitionSession>>,
    events: broadcast::Sender<SpeechEvent>,
    player: Arc<Player>,
    notifier: Arc<dyn Notifier>,
    /// Turns whose sentinel went out and whose end frame has not arrived.
    pending_ends: VecDeque<u64>,
    /// Ping as soon as the socket opens.
    ping_on_open: bool,
}

/// [`SpeechBackend`] streaming audio to a recognition relay.
pub struct RelayedSpeech {
    command_tx: mpsc::UnboundedSender<RelayCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    microphone: Arc<dyn MicrophoneSource>,
    format: CaptureFormat,
    player: Arc<Player>,
    notifier: Arc<dyn Notifier>,
    session: Arc<Mutex<RecognitionSession>>,
    events: broadcast::Sender<SpeechEvent>,
    capture: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// Create the relayed backend and the worker owning its socket.
///
/// The worker connects as soon as it runs.
#[must_use]
pub fn relayed_speech(
    config: &RelayConfig,
    connector: Arc<dyn Connector>,
    microphone: Arc<dyn MicrophoneSource>,
    player: Arc<Player>,
    notifier: Arc<dyn Notifier>,
) -> (RelayedSpeech, RelayWorker) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
    let (events, _) = broadcast::channel(64);
    let session = Arc::new(Mutex::new(RecognitionSession::new()));

    let worker = RelayWorker {
        link: Link::new(connector, config.url.clone()),
        keepalive: Keepalive::new(config.keepalive_interval()),
        end_sentinel: config.end_sentinel.as_bytes().to_vec(),
        command_rx,
        state_tx,
        session: Arc::clone(&session),
        events: events.clone(),
        player: Arc::clone(&player),
        notifier: Arc::clone(&notifier),
        pending_ends: VecDeque::new(),
        ping_on_open: false,
    };
    let speech = RelayedSpeech {
        command_tx,
        state_rx,
        microphone,
        format: CaptureFormat {
            sample_rate: config.sample_rate,
            chunk_samples: config.chunk_samples(),
        },
        player,
        notifier,
        session,
        events,
        capture: Mutex::new(None),
    };
    (speech, worker)
}

impl RelayWorker {
    /// Drive the relay socket until the backend is dropped.
    pub async fn run(mut self) {
        self.link.connect(false);
        self.publish();
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(RelayCommand::Close) | None => break,
                    Some(command) => self.handle_command(command),
                },
                event = self.link.next_event() => self.handle_link_event(event),
                () = self.keepalive.tick() => self.send_ping(),
            }
        }
        self.link.close();
        self.keepalive.stop();
        self.publish();
        debug!("speech relay worker stopped");
    }

    fn handle_command(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Visibility(Visibility::Hidden) => {
                info!("speech relay hidden, closing");
                self.ping_on_open = false;
                self.link.close();
                self.keepalive.stop();
                self.publish();
            }
            RelayCommand::Visibility(Visibility::Visible) => {
                info!("speech relay visible, reconnecting");
                self.link.reconnect(true);
                self.publish();
                self.ping_on_open = true;
            }
            RelayCommand::Audio(chunk) => {
                self.transmit(Frame::Binary(chunk));
            }
            RelayCommand::EndOfUtterance { epoch } => {
                if self.transmit(Frame::Binary(self.end_sentinel.clone())) {
                    self.pending_ends.push_back(epoch);
                } else {
                    warn!(epoch, "end of utterance not delivered, finishing locally");
                    self.finish_turn(epoch);
                }
            }
            RelayCommand::Synthesize(text) => {
                let request = json!({"cmd": "tts", "data": {"text": sanitize_text(&text)}});
                if !self.transmit(Frame::Text(request.to_string())) {
                    self.notifier
                        .report(&ChatError::Connection("speech relay unavailable".into()));
                }
            }
            RelayCommand::Close => {}
        }
    }

    /// Send `frame` if the socket is open. Otherwise the frame is dropped
    /// and a reconnect started unless one is already under way.
    fn transmit(&mut self, frame: Frame) -> bool {
        match self.link.state() {
            ConnectionState::Open => match self.link.send(frame) {
                Ok(()) => true,
                Err(e) => {
                    warn!("relay send failed ({e}), reconnecting");
                    self.link.reconnect(true);
                    self.publish();
                    false
                }
            },
            ConnectionState::Connecting => {
                trace!("relay still connecting, dropping frame");
                false
            }
            ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Closed => {
                self.link.reconnect(false);
                self.publish();
                false
            }
        }
    }

    fn send_ping(&mut self) {
        self.transmit(Frame::Text(json!({"cmd": "ping"}).to_string()));
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened { reconnect } => {
                info!(reconnect, "speech relay open");
                if reconnect {
                    let notice = Frame::Text(json!({"cmd": "Reconnect"}).to_string());
                    if let Err(e) = self.link.send(notice) {
                        warn!("relay reconnect notice not sent: {e}");
                    }
                }
                if std::mem::take(&mut self.ping_on_open) {
                    self.send_ping();
                }
                self.keepalive.start();
            }
            LinkEvent::Frame(Frame::Text(text)) => self.handle_text(&text),
            LinkEvent::Frame(Frame::Binary(bytes)) => {
                trace!(len = bytes.len(), "ignoring binary relay frame");
            }
            LinkEvent::Closed { reason, requested } => {
                info!(?reason, requested, "speech relay closed");
                self.ping_on_open = false;
                self.keepalive.stop();
                self.abandon_pending_ends();
            }
            LinkEvent::Failed(reason) => {
                self.ping_on_open = false;
                self.keepalive.stop();
                self.abandon_pending_ends();
                self.notifier.report(&ChatError::Connection(reason));
            }
        }
        self.publish();
    }

    /// The relay forgets its sessions with the socket; finish what it owed.
    fn abandon_pending_ends(&mut self) {
        for epoch in std::mem::take(&mut self.pending_ends) {
            self.finish_turn(epoch);
        }
    }

    fn handle_text(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!("unparseable relay frame: {e}");
                return;
            }
        };

        let cmd = value.get("cmd").and_then(Value::as_str).map(str::to_owned);
        match cmd.as_deref() {
            Some("ping" | "pong" | "receiverMessage") => trace!("ignoring relay keepalive"),
            Some("tts") => match serde_json::from_value::<SynthesisReply>(value) {
                Ok(reply) => self.play_reply(reply),
                Err(e) => self
                    .notifier
                    .report(&ChatError::Synthesis(format!("malformed tts reply: {e}"))),
            },
            Some("error") => {
                warn!(message = ?value.get("message"), "speech relay reported an error");
                if let Ok(reply) = serde_json::from_value::<SynthesisReply>(value)
                    && reply.toast_message.is_some()
                {
                    self.notifier.notify(reply.toast());
                }
            }
            Some(cmd) => debug!(cmd, "ignoring relay command"),
            None => match serde_json::from_value::<TranscriptFrame>(value) {
                Ok(frame) => self.handle_transcript(frame),
                Err(e) => debug!("malformed transcript frame: {e}"),
            },
        }
    }

    fn play_reply(&self, reply: SynthesisReply) {
        let payload = match reply.audio_content.as_deref() {
            Some(content) if reply.ok && !content.is_empty() => content,
            _ => {
                self.notifier.notify(reply.toast());
                return;
            }
        };
        let played = BASE64
            .decode(payload)
            .map_err(|e| ChatError::Synthesis(format!("invalid audio payload: {e}")))
            .and_then(decode_audio)
            .and_then(|audio| self.player.play(audio));
        if let Err(e) = played {
            self.notifier.report(&e);
        }
    }

    fn handle_transcript(&mut self, frame: TranscriptFrame) {
        let text = sanitize_text(&frame.transcript);

        if frame.is_end {
            let Some(epoch) = self.pending_ends.pop_front() else {
                debug!("end frame without a pending turn");
                return;
            };
            let pushed = {
                let mut session = lock(&self.session);
                let current = session.epoch() == epoch && !text.is_empty();
                if current {
                    session.push_final(text.clone());
                }
                current
            };
            if pushed {
                let _ = self.events.send(SpeechEvent::Finalized(text));
            }
            self.finish_turn(epoch);
            return;
        }

        let mut session = lock(&self.session);
        let current = session.epoch();
        let awaiting_current = self.pending_ends.back() == Some(&current);
        let older_turn_open = self.pending_ends.front().is_some_and(|&e| e != current);
        if older_turn_open || !(session.is_recognizing() || awaiting_current) {
            debug!(current, "dropping transcript outside the current turn");
            return;
        }

        if frame.is_final {
            session.push_final(text.clone());
            drop(session);
            let _ = self.events.send(SpeechEvent::Finalized(text));
        } else if session.offer_interim(text.clone()) {
            drop(session);
            let _ = self.events.send(SpeechEvent::Interim(text));
        }
    }

    fn finish_turn(&self, epoch: u64) {
        let utterance = lock(&self.session).finish(epoch, true);
        match utterance {
            Some(utterance) => {
                debug!(epoch, chars = utterance.chars().count(), "utterance ready");
                let _ = self.events.send(SpeechEvent::UtteranceReady(utterance));
            }
            None => debug!(epoch, "end of a superseded turn"),
        }
    }

    fn publish(&self) {
        let state = self.link.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

impl RelayedSpeech {
    fn submit(&self, command: RelayCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| ChatError::Channel("speech relay worker has stopped".into()))
    }

    /// State of the relay socket.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Close the relay socket and stop the worker.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Channel`] if the worker has already stopped.
    pub fn close(&self) -> Result<()> {
        self.submit(RelayCommand::Close)
    }

    fn stop_forwarding(&self) -> Option<JoinHandle<()>> {
        lock(&self.capture).take().map(|(cancel, task)| {
            cancel.cancel();
            task
        })
    }
}

async fn forward_chunks(
    mut microphone: MicrophoneStream,
    commands: mpsc::UnboundedSender<RelayCommand>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            chunk = microphone.chunks.recv() => match chunk {
                Some(chunk) => {
                    if commands.send(RelayCommand::Audio(chunk)).is_err() {
                        break;
                    }
                }
                None => {
                    debug!("microphone stream ended");
                    break;
                }
            },
        }
    }
}

#[async_trait]
impl SpeechBackend for RelayedSpeech {
    fn name(&self) -> &'static str {
        "relayed"
    }

    async fn start_capture(&self) -> Result<()> {
        if lock(&self.session).is_recognizing() {
            debug!("already recognizing");
            return Ok(());
        }

        self.player.stop();
        if let Some(previous) = self.stop_forwarding() {
            previous.abort();
        }
        let epoch = lock(&self.session).begin();

        let microphone = match self.microphone.open(self.format) {
            Ok(microphone) => microphone,
            Err(e) => {
                lock(&self.session).end_capture();
                self.notifier.report(&e);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward_chunks(
            microphone,
            self.command_tx.clone(),
            cancel.clone(),
        ));
        *lock(&self.capture) = Some((cancel, task));
        info!(epoch, "relayed capture started");
        Ok(())
    }

    async fn stop_capture(&self) -> Result<()> {
        let epoch = {
            let mut session = lock(&self.session);
            if !session.is_recognizing() {
                return Ok(());
            }
            session.end_capture();
            session.epoch()
        };

        if let Some(task) = self.stop_forwarding() {
            // Chunks already forwarded must precede the sentinel.
            if let Err(e) = task.await {
                debug!("capture forwarder ended abnormally: {e}");
            }
        }
        self.submit(RelayCommand::EndOfUtterance { epoch })
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
        self.submit(RelayCommand::Synthesize(text.to_owned()))
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

    fn set_visibility(&self, visibility: Visibility) {
        if self.submit(RelayCommand::Visibility(visibility)).is_err() {
            debug!("speech relay worker has stopped");
        }
    }
}

impl Drop for RelayedSpeech {
    fn drop(&mut self) {
        if let Some(task) = self.stop_forwarding() {
            task.abort();
        }
    }
}
