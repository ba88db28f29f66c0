//! Audio capture, decoding, playback and spectrum analysis.

pub mod analyser;
pub mod capture;
pub mod decode;
pub mod playback;

pub use analyser::SpectrumAnalyser;
pub use capture::{CaptureFormat, CpalMicrophone, MicrophoneSource, MicrophoneStream};
pub use decode::{DecodedAudio, decode_audio};
pub use playback::{AudioOutput, CpalOutput, PlaybackEvent, PlaybackStream, Player, SpectrumTap};

use crate::error::{ChatError, Result};
use cpal::traits::{DeviceTrait, HostTrait};
use tokio::runtime::{Handle, RuntimeFlavor};

/// Find a device by name, or the host default when `name` is `None`.
fn find_device(name: Option<&str>, input: bool) -> Result<cpal::Device> {
    let host = cpal::default_host();
    let kind = if input { "input" } else { "output" };

    let device = match name {
        Some(name) => {
            let matches = |d: &cpal::Device| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            };
            if input {
                host.input_devices().map(|mut devices| devices.find(matches))
            } else {
                host.output_devices().map(|mut devices| devices.find(matches))
            }
            .map_err(|e| ChatError::Device(format!("cannot enumerate devices: {e}")))?
            .ok_or_else(|| ChatError::Device(format!("{kind} device '{name}' not found")))?
        }
        None if input => host
            .default_input_device()
            .ok_or_else(|| ChatError::Device("no default input device".into()))?,
        None => host
            .default_output_device()
            .ok_or_else(|| ChatError::Device("no default output device".into()))?,
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    tracing::info!("using {kind} device: {device_name}");
    Ok(device)
}

/// Wait for a device thread to report whether its stream started.
///
/// Device setup can take a while, so on a multi-threaded runtime the
/// worker is handed off for the duration of the wait.
fn await_device_setup(
    ready: &crossbeam_channel::Receiver<Result<()>>,
    kind: &str,
) -> Result<()> {
    let wait = || {
        ready
            .recv()
            .map_err(|_| ChatError::Device(format!("{kind} thread exited during setup")))
            .and_then(std::convert::identity)
    };
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    }
}

/// Convert interleaved multi-channel audio to mono by averaging channels.
pub(crate) fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = usize::from(channels.max(1));
    if ch == 1 {
        return data.to_vec();
    }
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Simple linear-interpolation resampler.
///
/// Adequate for speech in both directions (48kHz capture down to 16kHz,
/// 24kHz synthesis up to the device rate).
pub(crate) fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            samples[idx] as f64 * (1.0 - frac) + samples[idx + 1] as f64 * frac
        } else {
            samples[idx.min(samples.len() - 1)] as f64
        };

        output.push(sample as f32);
    }

    output
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::test_utils::WAIT;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn device_setup_wait_leaves_the_runtime_free() {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let waiter = tokio::spawn(async move { await_device_setup(&ready_rx, "playback") });
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            ready_tx.send(Ok(())).unwrap();
        });
        let result = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn device_setup_reports_thread_failure() {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        ready_tx
            .send(Err(ChatError::Device("no default output device".into())))
            .unwrap();
        let err = await_device_setup(&ready_rx, "playback").unwrap_err();
        assert!(err.to_string().contains("no default output device"));

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        drop(ready_tx);
        let err = await_device_setup(&ready_rx, "capture").unwrap_err();
        assert!(matches!(err, ChatError::Device(m) if m.contains("capture thread exited")));
    }

    #[tokio::test]
    async fn device_setup_waits_inline_on_current_thread_runtime() {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        ready_tx.send(Ok(())).unwrap();
        assert!(await_device_setup(&ready_rx, "playback").is_ok());
    }

    #[test]
    fn to_mono_averages_frames() {
        assert_eq!(to_mono(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(to_mono(&[0.25, 0.75], 1), vec![0.25, 0.75]);
    }

    #[test]
    fn resample_changes_length_by_ratio() {
        let input = vec![0.0; 4800];
        assert_eq!(resample(&input, 48_000, 16_000).len(), 1600);
        assert_eq!(resample(&input, 24_000, 48_000).len(), 9600);
        assert_eq!(resample(&input, 16_000, 16_000).len(), 4800);
    }

    #[test]
    fn resample_interpolates_between_samples() {
        let out = resample(&[0.0, 1.0], 1, 2);
        assert_eq!(out.len(), 4);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }
}
