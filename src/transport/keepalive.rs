//! Fixed-interval keepalive timer.

use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

/// Restartable interval used inside an actor's `select!` loop.
///
/// [`tick`](Self::tick) pends forever while stopped, so a stopped keepalive
/// never wins a `select!`.
#[derive(Debug)]
pub struct Keepalive {
    period: Duration,
    interval: Option<Interval>,
}

impl Keepalive {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
        }
    }

    /// (Re)start the timer. The first tick fires one period from now.
    pub fn start(&mut self) {
        let mut interval = interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    pub fn stop(&mut self) {
        self.interval = None;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_one_period() {
        let mut keepalive = Keepalive::new(Duration::from_secs(5));
        keepalive.start();
        let started = Instant::now();
        keepalive.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        keepalive.tick().await;
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_keepalive_never_ticks() {
        let mut keepalive = Keepalive::new(Duration::from_millis(10));
        keepalive.start();
        keepalive.stop();
        assert!(!keepalive.is_running());
        let result = tokio::time::timeout(Duration::from_secs(60), keepalive.tick()).await;
        assert!(result.is_err());
    }
}
