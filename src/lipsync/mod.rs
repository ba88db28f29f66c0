//! Volume-driven lip-sync for the avatar.
//!
//! Each animation frame reads the playback spectrum, reduces it to one
//! volume value and maps that onto the `aa`, `oh`, `ih` and `happy`
//! expression weights. A long run of silent frames ends the loop and
//! restores the resting face.

pub mod bridge;

pub use bridge::{LipSyncBridge, LipSyncState};

use crate::config::LipSyncConfig;
use tracing::trace;

pub const EXPRESSION_AA: &str = "aa";
pub const EXPRESSION_OH: &str = "oh";
pub const EXPRESSION_IH: &str = "ih";
pub const EXPRESSION_HAPPY: &str = "happy";
pub const EXPRESSION_RELAXED: &str = "relaxed";

/// Avatar expression state (a VRM expression manager or equivalent).
pub trait ExpressionSink: Send + Sync + 'static {
    fn set_value(&self, name: &str, weight: f32);

    /// Apply the values set since the last update.
    fn update(&self);
}

/// Expression sink that only logs, for running without an avatar.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExpressions;

impl ExpressionSink for LoggingExpressions {
    fn set_value(&self, name: &str, weight: f32) {
        trace!(expression = name, weight, "expression");
    }

    fn update(&self) {}
}

/// Mouth weights for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MouthShape {
    pub aa: f32,
    pub oh: f32,
    pub ih: f32,
    pub happy: f32,
}

impl MouthShape {
    /// Map a 0..=255 volume onto mouth weights.
    ///
    /// Volumes below `threshold` close the mouth entirely.
    #[must_use]
    pub fn from_volume(volume: u32, threshold: u32) -> Self {
        if volume < threshold {
            return Self::default();
        }
        let v = volume as f32;
        let aa = v.min(80.0).powi(2) / 3200.0;
        let oh = (40.0 - (v - 40.0).abs()).max(0.0).powi(2) / 1600.0;
        let ih = (20.0 - (v - 20.0).abs()).max(0.0).powi(2) / 400.0;
        let happy = (aa + oh + ih) / 6.0;
        let scale = 2.0 / 3.0;
        Self {
            aa: aa * scale,
            oh: oh * scale,
            ih: ih * scale,
            happy,
        }
    }

    pub fn apply(&self, sink: &dyn ExpressionSink) {
        sink.set_value(EXPRESSION_AA, self.aa);
        sink.set_value(EXPRESSION_OH, self.oh);
        sink.set_value(EXPRESSION_IH, self.ih);
        sink.set_value(EXPRESSION_HAPPY, self.happy);
    }
}

/// Floor of the mean bin value.
#[must_use]
pub fn volume(spectrum: &[u8]) -> u32 {
    if spectrum.is_empty() {
        return 0;
    }
    let sum: u64 = spectrum.iter().map(|&b| u64::from(b)).sum();
    (sum / spectrum.len() as u64) as u32
}

/// Close the mouth and return to the resting expression.
pub fn rest(sink: &dyn ExpressionSink, relaxed_weight: f32) {
    MouthShape::default().apply(sink);
    sink.set_value(EXPRESSION_RELAXED, relaxed_weight);
    sink.update();
}

/// Outcome of one animation frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LipSyncStep {
    Speak(MouthShape),
    /// Silence lasted long enough that the loop should end.
    Silent,
}

/// Per-frame lip-sync state.
#[derive(Debug, Clone)]
pub struct LipSyncLoop {
    threshold: u32,
    silence_frames: u32,
    zero_streak: u32,
}

impl LipSyncLoop {
    #[must_use]
    pub fn new(config: &LipSyncConfig) -> Self {
        Self {
            threshold: config.amplitude_threshold,
            silence_frames: config.silence_frames.max(1),
            zero_streak: 0,
        }
    }

    pub fn step(&mut self, spectrum: &[u8]) -> LipSyncStep {
        let volume = volume(spectrum);
        if volume == 0 {
            self.zero_streak = self.zero_streak.saturating_add(1);
        } else {
            self.zero_streak = 0;
        }
        if self.zero_streak >= self.silence_frames {
            return LipSyncStep::Silent;
        }
        LipSyncStep::Speak(MouthShape::from_volume(volume, self.threshold))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::test_utils::RecordingExpressions;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn quiet_frames_close_the_mouth() {
        assert_eq!(MouthShape::from_volume(9, 10), MouthShape::default());
        assert_eq!(MouthShape::from_volume(0, 10), MouthShape::default());
    }

    #[test]
    fn shape_follows_volume_curves() {
        let shape = MouthShape::from_volume(20, 10);
        // aa = 400/3200, oh = 400/1600, ih = 400/400
        assert!(close(shape.aa, 0.125 * 2.0 / 3.0));
        assert!(close(shape.oh, 0.25 * 2.0 / 3.0));
        assert!(close(shape.ih, 2.0 / 3.0));
        assert!(close(shape.happy, (0.125 + 0.25 + 1.0) / 6.0));

        let loud = MouthShape::from_volume(120, 10);
        assert!(close(loud.aa, 2.0 * 2.0 / 3.0));
        assert!(close(loud.oh, 0.0));
        assert!(close(loud.ih, 0.0));
    }

    #[test]
    fn volume_is_floor_of_mean() {
        assert_eq!(volume(&[]), 0);
        assert_eq!(volume(&[1, 2]), 1);
        assert_eq!(volume(&[10, 20, 31]), 20);
    }

    #[test]
    fn sustained_silence_ends_the_loop() {
        let mut lip = LipSyncLoop::new(&LipSyncConfig::default());
        let silent = [0u8; 8];
        for _ in 0..299 {
            assert!(matches!(lip.step(&silent), LipSyncStep::Speak(_)));
        }
        assert_eq!(lip.step(&silent), LipSyncStep::Silent);
    }

    #[test]
    fn sound_resets_the_silence_streak() {
        let mut lip = LipSyncLoop::new(&LipSyncConfig::default());
        for _ in 0..299 {
            lip.step(&[0u8; 8]);
        }
        assert!(matches!(lip.step(&[50u8; 8]), LipSyncStep::Speak(s) if s.aa > 0.0));
        assert!(matches!(lip.step(&[0u8; 8]), LipSyncStep::Speak(_)));
    }

    #[test]
    fn rest_restores_relaxed_face() {
        let sink = RecordingExpressions::new();
        MouthShape::from_volume(40, 10).apply(sink.as_ref());
        rest(sink.as_ref(), 0.2);
        for name in [EXPRESSION_AA, EXPRESSION_OH, EXPRESSION_IH, EXPRESSION_HAPPY] {
            assert_eq!(sink.weight(name), Some(0.0));
        }
        assert_eq!(sink.weight(EXPRESSION_RELAXED), Some(0.2));
        assert_eq!(sink.updates(), 1);
    }
}
