//! Reconnection policy for the service connection.
//!
//! The delay grows exponentially from `initial_delay` up to `max_delay`; a
//! factor of 1.0 gives a fixed retry interval.

use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: None, // Unlimited
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Reconnection state for the service connection.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Number of reconnection attempts since the last successful subscription
    pub attempts: u32,
    /// When to attempt the next reconnection
    pub next_attempt_at: Option<Instant>,
    /// Current backoff delay
    pub current_delay: Duration,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule the next reconnection attempt and return when it is due.
    pub fn schedule_reconnect(&mut self, now: Instant, config: &ReconnectConfig) -> Instant {
        self.attempts += 1;
        self.current_delay = calculate_backoff(self.attempts, config);
        let at = now + self.current_delay;
        self.next_attempt_at = Some(at);
        info!(
            "Reconnecting in {:?} (attempt {})",
            self.current_delay, self.attempts
        );
        at
    }

    /// The scheduled attempt is being made now.
    pub fn clear_schedule(&mut self) {
        self.next_attempt_at = None;
    }

    /// Reset state after a successful subscription.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_attempt_at = None;
        self.current_delay = Duration::ZERO;
    }

    /// Check if it's time to reconnect.
    pub fn should_reconnect(&self, now: Instant) -> bool {
        self.next_attempt_at.is_some_and(|t| now >= t)
    }

    /// Check if max attempts exceeded.
    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
    }
}
