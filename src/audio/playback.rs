//! Playback of synthesized speech.
//!
//! [`Player`] owns at most one active playback session. Starting a new
//! one tears the previous down first, so only one output stream ever holds
//! the device. Every block rendered to the speakers is also fed to the
//! session's [`SpectrumAnalyser`], which lip-sync reads through a
//! [`SpectrumTap`].

use crate::audio::analyser::SpectrumAnalyser;
use crate::audio::decode::DecodedAudio;
use crate::config::{AnalyserConfig, AudioConfig};
use crate::error::{ChatError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info};

/// A running output stream.
///
/// Stopping (or dropping) it releases the output device.
pub struct PlaybackStream {
    stop_tx: Option<crossbeam_channel::Sender<()>>,
    finished_rx: Option<oneshot::Receiver<()>>,
}

impl PlaybackStream {
    /// `stop` is dropped to stop the stream; `finished` fires once the
    /// buffer has fully drained.
    pub fn new(stop: crossbeam_channel::Sender<()>, finished: oneshot::Receiver<()>) -> Self {
        Self {
            stop_tx: Some(stop),
            finished_rx: Some(finished),
        }
    }

    /// Stop the stream. Idempotent.
    pub fn stop(&mut self) {
        self.stop_tx = None;
    }

    fn take_finished(&mut self) -> Option<oneshot::Receiver<()>> {
        self.finished_rx.take()
    }
}

/// Plays decoded audio on an output device.
pub trait AudioOutput: Send + Sync + 'static {
    /// Start playing `audio`, feeding each rendered block to `analyser`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Device`] if no output stream can be opened.
    fn start(&self, audio: DecodedAudio, analyser: Arc<SpectrumAnalyser>)
    -> Result<PlaybackStream>;
}

/// [`AudioOutput`] backed by the system output device.
#[derive(Debug, Clone, Default)]
pub struct CpalOutput {
    device_name: Option<String>,
}

impl CpalOutput {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.output_device.clone(),
        }
    }
}

impl AudioOutput for CpalOutput {
    fn start(
        &self,
        audio: DecodedAudio,
        analyser: Arc<SpectrumAnalyser>,
    ) -> Result<PlaybackStream> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let (finished_tx, finished_rx) = oneshot::channel();
        let device_name = self.device_name.clone();

        std::thread::Builder::new()
            .name("vrmchat-playback".into())
            .spawn(move || {
                let drained = Arc::new(AtomicBool::new(false));
                let stream =
                    match build_output_stream(device_name.as_deref(), audio, analyser, &drained) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                let _ = ready_tx.send(Ok(()));

                let mut finished_tx = Some(finished_tx);
                loop {
                    match stop_rx.recv_timeout(Duration::from_millis(10)) {
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            if drained.load(Ordering::Acquire)
                                && let Some(tx) = finished_tx.take()
                            {
                                let _ = tx.send(());
                                break;
                            }
                        }
                        _ => break,
                    }
                }
                drop(stream);
                debug!("output stream released");
            })?;

        super::await_device_setup(&ready_rx, "playback")?;
        Ok(PlaybackStream::new(stop_tx, finished_rx))
    }
}

fn build_output_stream(
    device_name: Option<&str>,
    audio: DecodedAudio,
    analyser: Arc<SpectrumAnalyser>,
    drained: &Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let device = super::find_device(device_name, false)?;
    let default_config = device
        .default_output_config()
        .map_err(|e| ChatError::Device(format!("no default output config: {e}")))?;

    let device_rate = default_config.sample_rate();
    let channels = usize::from(default_config.channels().max(1));
    let stream_config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: device_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let samples = super::resample(&audio.samples, audio.sample_rate, device_rate);
    info!(
        "playing {:.2}s of audio at {}Hz ({} channels)",
        audio.duration_secs(),
        device_rate,
        channels
    );

    let mut position = 0usize;
    let mut block = Vec::new();
    let drained = Arc::clone(drained);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                block.clear();
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(position).copied().unwrap_or(0.0);
                    if position < samples.len() {
                        position += 1;
                    }
                    frame.fill(sample);
                    block.push(sample);
                }
                analyser.push_samples(&block);
                if position >= samples.len() {
                    drained.store(true, Ordering::Release);
                }
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| ChatError::Device(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| ChatError::Device(format!("failed to start output stream: {e}")))?;
    Ok(stream)
}

// ---------------------------------------------------------------------------
// Playback sessions
// ---------------------------------------------------------------------------

/// Read access to the spectrum of one playback session.
#[derive(Clone)]
pub struct SpectrumTap {
    pub generation: u64,
    pub analyser: Arc<SpectrumAnalyser>,
}

impl std::fmt::Debug for SpectrumTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumTap")
            .field("generation", &self.generation)
            .field("bins", &self.analyser.frequency_bin_count())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// Audio is streaming; the tap is live until a matching
    /// `Finished`/`Stopped`.
    Started(SpectrumTap),
    Finished { generation: u64 },
    Stopped { generation: u64 },
}

struct PlaybackSession {
    generation: u64,
    stream: PlaybackStream,
    streaming: Arc<AtomicBool>,
}

/// Owns the single active playback session.
pub struct Player {
    output: Arc<dyn AudioOutput>,
    analyser_config: AnalyserConfig,
    session: Mutex<Option<PlaybackSession>>,
    generation: AtomicU64,
    events: broadcast::Sender<PlaybackEvent>,
}

impl Player {
    pub fn new(output: Arc<dyn AudioOutput>, analyser_config: AnalyserConfig) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            output,
            analyser_config,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            events,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    /// Whether audio is currently streaming.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        let session = match self.session.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        session
            .as_ref()
            .is_some_and(|s| s.streaming.load(Ordering::Acquire))
    }

    /// Tear down the current session, then play `audio` in a new one.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Device`] if the output cannot be opened; no
    /// session is active afterwards.
    pub fn play(&self, audio: DecodedAudio) -> Result<SpectrumTap> {
        self.stop();

        let analyser = Arc::new(SpectrumAnalyser::new(&self.analyser_config));
        let mut stream = self.output.start(audio, Arc::clone(&analyser))?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let streaming = Arc::new(AtomicBool::new(true));

        if let Some(finished) = stream.take_finished() {
            let events = self.events.clone();
            let streaming = Arc::clone(&streaming);
            tokio::spawn(async move {
                if finished.await.is_ok() {
                    streaming.store(false, Ordering::Release);
                    let _ = events.send(PlaybackEvent::Finished { generation });
                }
            });
        }

        let mut session = match self.session.lock() {
            Ok(s) => s,
            Err(p) => p.into_inner(),
        };
        *session = Some(PlaybackSession {
            generation,
            stream,
            streaming,
        });
        drop(session);

        let tap = SpectrumTap {
            generation,
            analyser,
        };
        let _ = self.events.send(PlaybackEvent::Started(tap.clone()));
        Ok(tap)
    }

    /// Stop the active session and release the output device. Idempotent.
    pub fn stop(&self) {
        let previous = match self.session.lock() {
            Ok(mut s) => s.take(),
            Err(p) => p.into_inner().take(),
        };
        if let Some(mut session) = previous {
            session.stream.stop();
            session.streaming.store(false, Ordering::Release);
            debug!(generation = session.generation, "playback stopped");
            let _ = self.events.send(PlaybackEvent::Stopped {
                generation: session.generation,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::test_utils::ScriptedOutput;

    fn tone() -> DecodedAudio {
        DecodedAudio {
            samples: vec![0.25; 2400],
            sample_rate: 24_000,
        }
    }

    #[tokio::test]
    async fn new_playback_tears_down_the_previous_one() {
        let output = ScriptedOutput::new();
        let player = Player::new(output.clone(), AnalyserConfig::default());
        let mut events = player.subscribe();

        let first = player.play(tone()).unwrap();
        let second = player.play(tone()).unwrap();
        assert!(second.generation > first.generation);

        let plays = output.plays();
        assert_eq!(plays.len(), 2);
        assert!(plays[0].is_stopped());
        assert!(!plays[1].is_stopped());

        assert!(matches!(events.recv().await.unwrap(), PlaybackEvent::Started(t) if t.generation == first.generation));
        assert!(matches!(events.recv().await.unwrap(), PlaybackEvent::Stopped { generation } if generation == first.generation));
        assert!(matches!(events.recv().await.unwrap(), PlaybackEvent::Started(t) if t.generation == second.generation));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let output = ScriptedOutput::new();
        let player = Player::new(output.clone(), AnalyserConfig::default());
        player.play(tone()).unwrap();
        assert!(player.is_streaming());

        player.stop();
        player.stop();
        assert!(!player.is_streaming());
        assert!(output.plays()[0].is_stopped());
    }

    #[tokio::test]
    async fn drained_buffer_reports_finished() {
        let output = ScriptedOutput::new();
        let player = Player::new(output.clone(), AnalyserConfig::default());
        let mut events = player.subscribe();
        let tap = player.play(tone()).unwrap();
        events.recv().await.unwrap();

        output.plays()[0].finish();
        let event = tokio::time::timeout(crate::test_utils::WAIT, events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, PlaybackEvent::Finished { generation } if generation == tap.generation));
        assert!(!player.is_streaming());
    }

    #[tokio::test]
    async fn device_failure_leaves_no_session() {
        let output = ScriptedOutput::failing();
        let player = Player::new(output, AnalyserConfig::default());
        assert!(matches!(player.play(tone()), Err(ChatError::Device(_))));
        assert!(!player.is_streaming());
    }
}
