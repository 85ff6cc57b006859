use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_JITTER: f64 = 0.1;

/// Shape of the delays between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffSchedule {
    /// Wait before the first reconnect attempt.
    pub initial: Duration,
    /// Upper bound for any single wait.
    pub max: Duration,
    /// Growth factor applied after every attempt.
    pub multiplier: f64,
    /// Fraction of each delay that is randomised (0.0 disables jitter).
    pub jitter: f64,
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_DELAY,
            max: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffSchedule {
    /// A schedule without jitter.
    pub fn fixed(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            jitter: 0.0,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            ));
        }
        if self.initial > self.max {
            return Err(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.initial, self.max
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("backoff jitter must be within 0.0..=1.0, got {}", self.jitter));
        }
        Ok(())
    }
}

/// Counts consecutive reconnect attempts and hands out the wait before each one.
#[derive(Debug, Clone)]
pub struct BackoffState {
    schedule: BackoffSchedule,
    max_attempts: u32,
    attempts: u32,
    delay: Duration,
}

impl BackoffState {
    pub fn new(schedule: BackoffSchedule, max_attempts: u32) -> Self {
        Self {
            schedule,
            max_attempts,
            attempts: 0,
            delay: schedule.initial,
        }
    }

    /// Back to the initial delay; called once a connection is up again.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = self.schedule.initial;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Advance to the next attempt, updating the delay for the subsequent attempt.
    ///
    /// Returns the delay to wait *before* performing this attempt, or `None` once
    /// every attempt has been used up.
    pub fn next_delay_and_advance(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let current = self.delay;
        self.attempts += 1;
        self.delay = scale(current, self.schedule.multiplier).min(self.schedule.max);

        Some(self.apply_jitter(current))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.schedule.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = self.schedule.jitter;
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        scale(delay, factor).min(self.schedule.max)
    }
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::from_nanos((delay.as_nanos() as f64 * factor) as u64)
}
