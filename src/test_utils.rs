//! Shared test utilities used across multiple test modules.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::audio::{
    AudioOutput, CaptureFormat, DecodedAudio, MicrophoneSource, MicrophoneStream, PlaybackEvent,
    PlaybackStream, SpectrumAnalyser,
};
use crate::error::{ChatError, Result};
use crate::lipsync::ExpressionSink;
use crate::notify::{Notifier, Toast};
use crate::speech::{RecognitionSnapshot, SpeechBackend, SpeechEvent};
use crate::transport::codec::FrameCodec;
use crate::transport::Visibility;
use crate::transport::socket::{Connector, Frame, SocketEvent, SocketLink};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// How long tests wait for an actor to produce something observable.
pub const WAIT: Duration = Duration::from_secs(2);

/// [`Connector`] whose sockets are driven by the test.
///
/// Every `open` hands the server side of the new socket to the receiver
/// returned from [`ScriptedConnector::new`].
pub struct ScriptedConnector {
    peers: mpsc::UnboundedSender<ScriptedPeer>,
}

impl ScriptedConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ScriptedPeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { peers }), peers_rx)
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, url: &str) -> SocketLink {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = self.peers.send(ScriptedPeer {
            url: url.to_owned(),
            sent: outbound_rx,
            events: events_tx,
        });
        SocketLink::new(outbound_tx, events_rx)
    }
}

/// Server side of a scripted socket.
pub struct ScriptedPeer {
    pub url: String,
    sent: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl ScriptedPeer {
    pub fn open(&self) {
        let _ = self.events.send(SocketEvent::Opened);
    }

    pub fn frame(&self, frame: Frame) {
        let _ = self.events.send(SocketEvent::Frame(frame));
    }

    /// Deliver `value` as an uncompressed text frame.
    pub fn json(&self, value: Value) {
        self.frame(Frame::Text(value.to_string()));
    }

    pub fn close(&self, reason: Option<&str>) {
        let _ = self.events.send(SocketEvent::Closed {
            reason: reason.map(str::to_owned),
        });
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.events.send(SocketEvent::Failed(reason.to_owned()));
    }

    /// Whether the client still holds this socket.
    pub fn is_attached(&self) -> bool {
        !self.events.is_closed()
    }

    /// Next frame the client transmitted, `None` once the client shut the
    /// socket down. Panics if nothing arrives in time.
    pub async fn next_sent(&mut self) -> Option<Frame> {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("timed out waiting for an outbound frame")
    }

    /// Next transmitted frame decoded to JSON.
    pub async fn next_json(&mut self) -> Value {
        let frame = self.next_sent().await.expect("socket was shut down");
        FrameCodec::default()
            .decode(&frame)
            .expect("outbound frame is valid JSON")
    }

    /// Stop accepting outbound frames while the socket still looks open,
    /// as when the socket task dies without reporting it.
    pub fn stop_receiving(&mut self) {
        self.sent.close();
    }

    pub fn try_sent(&mut self) -> Option<Frame> {
        self.sent.try_recv().ok()
    }
}

/// Notifier that records every toast.
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    toasts: Arc<Mutex<Vec<Toast>>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn toasts(&self) -> Vec<Toast> {
        match self.toasts.lock() {
            Ok(t) => t.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.toasts().into_iter().map(|t| t.message).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, toast: Toast) {
        match self.toasts.lock() {
            Ok(mut t) => t.push(toast),
            Err(p) => p.into_inner().push(toast),
        }
    }
}

/// Poll `check` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(p) => p.into_inner(),
    }
}

/// One recorded [`ScriptedOutput`] playback.
pub struct ScriptedPlay {
    pub audio: DecodedAudio,
    pub analyser: Arc<SpectrumAnalyser>,
    stop_rx: crossbeam_channel::Receiver<()>,
    finished_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ScriptedPlay {
    /// Whether the player released this stream.
    pub fn is_stopped(&self) -> bool {
        matches!(
            self.stop_rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        )
    }

    /// Pretend the buffer drained.
    pub fn finish(&self) {
        if let Some(tx) = locked(&self.finished_tx).take() {
            let _ = tx.send(());
        }
    }
}

/// [`AudioOutput`] that records what it was asked to play.
#[derive(Default)]
pub struct ScriptedOutput {
    plays: Mutex<Vec<Arc<ScriptedPlay>>>,
    failing: bool,
}

impl ScriptedOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// An output whose device can never be opened.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            plays: Mutex::default(),
            failing: true,
        })
    }

    pub fn plays(&self) -> Vec<Arc<ScriptedPlay>> {
        locked(&self.plays).clone()
    }
}

impl AudioOutput for ScriptedOutput {
    fn start(&self, audio: DecodedAudio, analyser: Arc<SpectrumAnalyser>) -> Result<PlaybackStream> {
        if self.failing {
            return Err(ChatError::Device("scripted output unavailable".into()));
        }
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let (finished_tx, finished_rx) = oneshot::channel();
        locked(&self.plays).push(Arc::new(ScriptedPlay {
            audio,
            analyser,
            stop_rx,
            finished_tx: Mutex::new(Some(finished_tx)),
        }));
        Ok(PlaybackStream::new(stop_tx, finished_rx))
    }
}

/// [`MicrophoneSource`] fed by the test.
#[derive(Default)]
pub struct ScriptedMicrophone {
    current: Mutex<Option<(mpsc::Sender<Vec<u8>>, crossbeam_channel::Receiver<()>)>>,
    formats: Mutex<Vec<CaptureFormat>>,
    failing: bool,
}

impl ScriptedMicrophone {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A microphone that always refuses access.
    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Self::default()
        })
    }

    /// Emit one chunk from the open stream. Returns false when closed.
    pub fn push(&self, chunk: &[u8]) -> bool {
        match locked(&self.current).as_ref() {
            Some((tx, _)) => tx.try_send(chunk.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Whether a stream is open and still held by the client.
    pub fn is_open(&self) -> bool {
        locked(&self.current).as_ref().is_some_and(|(_, stop)| {
            !matches!(
                stop.try_recv(),
                Err(crossbeam_channel::TryRecvError::Disconnected)
            )
        })
    }

    pub fn opened(&self) -> Vec<CaptureFormat> {
        locked(&self.formats).clone()
    }
}

impl MicrophoneSource for ScriptedMicrophone {
    fn open(&self, format: CaptureFormat) -> Result<MicrophoneStream> {
        if self.failing {
            return Err(ChatError::Device("permission denied".into()));
        }
        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        locked(&self.formats).push(format);
        *locked(&self.current) = Some((chunk_tx, stop_rx));
        Ok(MicrophoneStream::new(chunk_rx, stop_tx))
    }
}

/// [`ExpressionSink`] that remembers the latest weights.
#[derive(Default)]
pub struct RecordingExpressions {
    weights: Mutex<HashMap<String, f32>>,
    updates: Mutex<usize>,
}

impl RecordingExpressions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn weight(&self, name: &str) -> Option<f32> {
        locked(&self.weights).get(name).copied()
    }

    pub fn updates(&self) -> usize {
        *locked(&self.updates)
    }
}

impl ExpressionSink for RecordingExpressions {
    fn set_value(&self, name: &str, weight: f32) {
        locked(&self.weights).insert(name.to_owned(), weight);
    }

    fn update(&self) {
        *locked(&self.updates) += 1;
    }
}

/// Mono 16-bit WAV payload.
pub fn wav_bytes(sample_rate: u32, samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav header");
        for &s in samples {
            writer.write_sample(s).expect("wav sample");
        }
        writer.finalize().expect("wav finalize");
    }
    cursor.into_inner()
}

/// [`SpeechBackend`] that records calls and lets the test emit events.
pub struct RecordingSpeech {
    active: Mutex<bool>,
    starts: Mutex<usize>,
    stops: Mutex<usize>,
    cleared: Mutex<usize>,
    synthesized: Mutex<Vec<String>>,
    visibility: Mutex<Vec<Visibility>>,
    snapshot: Mutex<RecognitionSnapshot>,
    events: broadcast::Sender<SpeechEvent>,
    playback: broadcast::Sender<PlaybackEvent>,
}

impl RecordingSpeech {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(false),
            starts: Mutex::new(0),
            stops: Mutex::new(0),
            cleared: Mutex::new(0),
            synthesized: Mutex::default(),
            visibility: Mutex::default(),
            snapshot: Mutex::default(),
            events: broadcast::channel(16).0,
            playback: broadcast::channel(16).0,
        })
    }

    pub fn emit(&self, event: SpeechEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_playback(&self, event: PlaybackEvent) {
        let _ = self.playback.send(event);
    }

    pub fn starts(&self) -> usize {
        *locked(&self.starts)
    }

    pub fn stops(&self) -> usize {
        *locked(&self.stops)
    }

    pub fn cleared(&self) -> usize {
        *locked(&self.cleared)
    }

    pub fn synthesized(&self) -> Vec<String> {
        locked(&self.synthesized).clone()
    }

    pub fn visibility(&self) -> Vec<Visibility> {
        locked(&self.visibility).clone()
    }
}

#[async_trait]
impl SpeechBackend for RecordingSpeech {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn start_capture(&self) -> Result<()> {
        let mut active = locked(&self.active);
        if !*active {
            *active = true;
            *locked(&self.starts) += 1;
        }
        Ok(())
    }

    async fn stop_capture(&self) -> Result<()> {
        let mut active = locked(&self.active);
        if *active {
            *active = false;
            *locked(&self.stops) += 1;
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        *locked(&self.active)
    }

    async fn synthesize(&self, text: &str) -> Result<()> {
        locked(&self.synthesized).push(text.to_owned());
        Ok(())
    }

    fn stop_playback(&self) {}

    fn recognition(&self) -> RecognitionSnapshot {
        locked(&self.snapshot).clone()
    }

    fn clear_recognition(&self) {
        *locked(&self.cleared) += 1;
        *locked(&self.snapshot) = RecognitionSnapshot::default();
    }

    fn subscribe(&self) -> broadcast::Receiver<SpeechEvent> {
        self.events.subscribe()
    }

    fn subscribe_playback(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.playback.subscribe()
    }

    fn set_visibility(&self, visibility: Visibility) {
        locked(&self.visibility).push(visibility);
    }
}
