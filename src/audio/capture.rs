//! Microphone capture using cpal.
//!
//! Captures at the device's native rate, downmixes to mono, resamples to
//! the relay rate and emits fixed-length chunks of 16-bit little-endian
//! PCM. The cpal stream lives on a dedicated thread for as long as the
//! returned [`MicrophoneStream`] is held.

use crate::config::AudioConfig;
use crate::error::{ChatError, Result};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, StreamTrait};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Buffered chunks before the audio thread starts dropping.
const CHUNK_QUEUE: usize = 64;

/// Shape of the PCM chunks a microphone emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    /// Mono samples per chunk.
    pub chunk_samples: usize,
}

/// An open microphone. Dropping it releases the device.
pub struct MicrophoneStream {
    pub chunks: mpsc::Receiver<Vec<u8>>,
    _stop: crossbeam_channel::Sender<()>,
}

impl MicrophoneStream {
    pub fn new(chunks: mpsc::Receiver<Vec<u8>>, stop: crossbeam_channel::Sender<()>) -> Self {
        Self {
            chunks,
            _stop: stop,
        }
    }
}

/// Claims a microphone and streams PCM chunks from it.
pub trait MicrophoneSource: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns [`ChatError::Device`] if the device is missing or access is
    /// denied.
    fn open(&self, format: CaptureFormat) -> Result<MicrophoneStream>;
}

/// [`MicrophoneSource`] backed by the system input device.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
        }
    }
}

impl MicrophoneSource for CpalMicrophone {
    fn open(&self, format: CaptureFormat) -> Result<MicrophoneStream> {
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let device_name = self.device_name.clone();

        std::thread::Builder::new()
            .name("vrmchat-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(device_name.as_deref(), format, chunk_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Hold the stream alive until the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                info!("audio capture stopped");
            })?;

        super::await_device_setup(&ready_rx, "capture")?;
        Ok(MicrophoneStream::new(chunk_rx, stop_tx))
    }
}

fn build_input_stream(
    device_name: Option<&str>,
    format: CaptureFormat,
    tx: mpsc::Sender<Vec<u8>>,
) -> Result<cpal::Stream> {
    let device = super::find_device(device_name, true)?;
    let default_config = device
        .default_input_config()
        .map_err(|e| ChatError::Device(format!("no default input config: {e}")))?;

    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };
    info!(
        "native input config: {}Hz, {} channels -> {}Hz mono",
        native_rate, native_channels, format.sample_rate
    );

    let mut chunker = PcmChunker::new(format.chunk_samples);
    let target_rate = format.sample_rate;

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = super::to_mono(data, native_channels);
                let samples = super::resample(&mono, native_rate, target_rate);
                for chunk in chunker.push(&samples) {
                    // Never block the audio thread.
                    if tx.try_send(chunk).is_err() {
                        debug!("capture channel full, dropping chunk");
                    }
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| ChatError::Device(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| ChatError::Device(format!("failed to start input stream: {e}")))?;
    Ok(stream)
}

/// Accumulates samples and splits them into fixed-size PCM16 chunks.
#[derive(Debug)]
pub(crate) struct PcmChunker {
    chunk_samples: usize,
    pending: Vec<i16>,
}

impl PcmChunker {
    pub(crate) fn new(chunk_samples: usize) -> Self {
        let chunk_samples = chunk_samples.max(1);
        Self {
            chunk_samples,
            pending: Vec::with_capacity(chunk_samples * 2),
        }
    }

    /// Append samples and return every completed chunk.
    pub(crate) fn push(&mut self, samples: &[f32]) -> Vec<Vec<u8>> {
        self.pending.extend(
            samples
                .iter()
                .map(|s| (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16),
        );

        let mut chunks = Vec::new();
        while self.pending.len() >= self.chunk_samples {
            let chunk: Vec<u8> = self
                .pending
                .drain(..self.chunk_samples)
                .flat_map(i16::to_le_bytes)
                .collect();
            chunks.push(chunk);
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn chunker_emits_fixed_size_pcm16() {
        let mut chunker = PcmChunker::new(400);
        assert!(chunker.push(&[0.0; 399]).is_empty());

        let chunks = chunker.push(&[0.5; 401]);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 800));

        let second = &chunks[1];
        let first_sample = i16::from_le_bytes([second[0], second[1]]);
        assert_eq!(first_sample, (0.5 * 32767.0) as i16);
    }

    #[test]
    fn chunker_clamps_out_of_range_samples() {
        let mut chunker = PcmChunker::new(2);
        let chunk = chunker.push(&[2.0, -2.0]).remove(0);
        assert_eq!(i16::from_le_bytes([chunk[0], chunk[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([chunk[2], chunk[3]]), -i16::MAX);
    }
}
