//! Runs the lip-sync loop for the active playback session.

use super::{ExpressionSink, LipSyncLoop, LipSyncStep, rest};
use crate::audio::{PlaybackEvent, SpectrumTap};
use crate::config::LipSyncConfig;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LipSyncState {
    #[default]
    Idle,
    /// Animating from the playback session with this generation.
    Active { generation: u64 },
}

struct ActiveLoop {
    generation: u64,
    cancel: CancellationToken,
}

type ActiveSlot = Arc<Mutex<Option<ActiveLoop>>>;

fn lock_active(slot: &Mutex<Option<ActiveLoop>>) -> MutexGuard<'_, Option<ActiveLoop>> {
    match slot.lock() {
        Ok(a) => a,
        Err(p) => p.into_inner(),
    }
}

/// Owns at most one lip-sync loop.
///
/// The loop ends when its session stops, when a newer session starts, or
/// on its own after sustained silence. Every exit restores the resting
/// expression.
pub struct LipSyncBridge {
    sink: Arc<dyn ExpressionSink>,
    config: LipSyncConfig,
    active: ActiveSlot,
    state_tx: watch::Sender<LipSyncState>,
}

impl LipSyncBridge {
    pub fn new(sink: Arc<dyn ExpressionSink>, config: LipSyncConfig) -> Self {
        let (state_tx, _) = watch::channel(LipSyncState::Idle);
        Self {
            sink,
            config,
            active: Arc::new(Mutex::new(None)),
            state_tx,
        }
    }

    #[must_use]
    pub fn state(&self) -> LipSyncState {
        *self.state_tx.borrow()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<LipSyncState> {
        self.state_tx.subscribe()
    }

    /// React to a playback lifecycle event.
    pub fn on_playback(&self, event: &PlaybackEvent) {
        match event {
            PlaybackEvent::Started(tap) => self.start(tap.clone()),
            PlaybackEvent::Finished { generation } | PlaybackEvent::Stopped { generation } => {
                self.stop_generation(*generation);
            }
        }
    }

    /// Start animating from `tap`, replacing any running loop.
    pub fn start(&self, tap: SpectrumTap) {
        let cancel = CancellationToken::new();
        let generation = tap.generation;
        {
            let mut active = lock_active(&self.active);
            if let Some(previous) = active.replace(ActiveLoop {
                generation,
                cancel: cancel.clone(),
            }) {
                previous.cancel.cancel();
            }
        }
        self.state_tx.send_replace(LipSyncState::Active { generation });
        debug!(generation, "lip-sync started");

        tokio::spawn(drive(
            tap,
            Arc::clone(&self.sink),
            self.config.clone(),
            cancel,
            Arc::clone(&self.active),
            self.state_tx.clone(),
        ));
    }

    /// Stop the loop if it belongs to `generation`.
    pub fn stop_generation(&self, generation: u64) {
        let mut active = lock_active(&self.active);
        if active.as_ref().is_some_and(|a| a.generation == generation)
            && let Some(current) = active.take()
        {
            current.cancel.cancel();
        }
    }

    /// Stop whatever loop is running. Idempotent.
    pub fn stop(&self) {
        if let Some(current) = lock_active(&self.active).take() {
            current.cancel.cancel();
        }
    }
}

impl Drop for LipSyncBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn drive(
    tap: SpectrumTap,
    sink: Arc<dyn ExpressionSink>,
    config: LipSyncConfig,
    cancel: CancellationToken,
    active: ActiveSlot,
    state_tx: watch::Sender<LipSyncState>,
) {
    let mut lip = LipSyncLoop::new(&config);
    let mut spectrum = vec![0u8; tap.analyser.frequency_bin_count()];
    let mut frames = tokio::time::interval(config.frame_interval());
    frames.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = frames.tick() => {
                tap.analyser.byte_frequency_data(&mut spectrum);
                match lip.step(&spectrum) {
                    LipSyncStep::Speak(shape) => {
                        shape.apply(sink.as_ref());
                        sink.update();
                    }
                    LipSyncStep::Silent => {
                        info!(generation = tap.generation, "sustained silence, stopping lip-sync");
                        break;
                    }
                }
            }
        }
    }

    {
        // A replaced or stopped loop is cancelled under this lock, so an
        // uncancelled token means the slot still holds this loop.
        let mut slot = lock_active(&active);
        if !cancel.is_cancelled() {
            *slot = None;
        }
    }
    rest(sink.as_ref(), config.relaxed_weight);
    let generation = tap.generation;
    state_tx.send_if_modified(|state| {
        if *state == (LipSyncState::Active { generation }) {
            *state = LipSyncState::Idle;
            true
        } else {
            false
        }
    });
    debug!(generation, "lip-sync stopped");
}
