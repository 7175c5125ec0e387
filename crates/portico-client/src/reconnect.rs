//! Reconnection back-off
//!
//! The default policy is a fixed 5 second delay between attempts; the knobs
//! allow an exponential policy without changing the default behavior.

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay for the first retry
    pub initial_backoff: Duration,
    /// Ceiling for the delay
    pub max_backoff: Duration,
    /// Growth factor from one attempt to the next
    pub multiplier: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(5),
            multiplier: 1.0,
            max_attempts: None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,
}

/// Counts reconnection attempts.
///
/// The delay is a pure function of the attempt number, so the manager
/// carries no decaying duration state and `reset` only zeroes the counter.
pub struct ReconnectManager {
    config: ReconnectConfig,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay for the n-th attempt (1-based): initial * multiplier^(n-1),
    /// clamped to the ceiling.
    fn delay_for(&self, attempt: usize) -> Duration {
        let growth = self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = self.config.initial_backoff.as_secs_f64() * growth;
        Duration::from_secs_f64(secs.min(self.config.max_backoff.as_secs_f64()))
    }

    /// Sleep out the delay for the next attempt.
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt >= max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }
        self.attempt += 1;

        let delay = self.delay_for(self.attempt);
        debug!("Reconnection attempt {} in {:?}", self.attempt, delay);
        sleep(delay).await;

        Ok(())
    }

    /// Forget the attempt history (call after a successful connection).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay the next `wait` would sleep.
    pub fn next_delay(&self) -> Duration {
        self.delay_for(self.attempt + 1)
    }
}
