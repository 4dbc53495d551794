//! Bounded polling for asynchronous side effects.
//!
//! Every wait in the engine goes through [`poll_until`]: sleep, observe,
//! repeat up to a fixed number of attempts, optionally capped by a
//! deadline. Running out of attempts and hitting the deadline are reported
//! as distinct [`PollTimeout`] variants.

use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How the interval grows between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same interval before every attempt
    Fixed,
    /// Interval multiplied by `factor` per attempt, capped at `max_interval`.
    /// A factor that is not a finite positive number behaves like [`Backoff::Fixed`].
    Exponential { factor: f64, max_interval: Duration },
}

/// Polling configuration
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Maximum number of observations
    pub max_attempts: u32,
    /// Sleep before the first observation (and base for backoff)
    pub interval: Duration,
    pub backoff: Backoff,
    /// Hard stop, independent of remaining attempts
    pub deadline: Option<Instant>,
}

impl PollConfig {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff: Backoff::Fixed,
            deadline: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the deadline relative to now, if given
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    /// Sleep before the given attempt (0-indexed)
    pub fn interval_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential {
                factor,
                max_interval,
            } => {
                if !(factor.is_finite() && factor > 0.0) {
                    return self.interval;
                }
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let delay = self.interval.as_secs_f64() * factor.powi(exponent);
                Duration::try_from_secs_f64(delay.min(max_interval.as_secs_f64()))
                    .unwrap_or(max_interval)
            }
        }
    }
}

/// Why polling stopped without the condition becoming true
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PollTimeout {
    /// Every attempt was used and the condition never held
    #[error("condition not met after {attempts} attempts{}", last_error_suffix(.last_error))]
    Exhausted {
        attempts: u32,
        last_error: Option<String>,
    },

    /// The deadline would pass before the next attempt
    #[error("deadline exceeded after {attempts} attempts ({elapsed:?})")]
    DeadlineExceeded { attempts: u32, elapsed: Duration },
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(" (last error: {e})"))
        .unwrap_or_default()
}

impl PollTimeout {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::DeadlineExceeded { attempts, .. } => *attempts,
        }
    }
}

/// Callback for attempt notifications
pub trait PollCallback {
    /// Called after each unsuccessful observation
    ///
    /// # Arguments
    /// * `attempt` - Attempt number (1-indexed)
    /// * `max_attempts` - Maximum number of attempts
    /// * `error` - Observation error, if the predicate failed rather than returned false
    fn on_attempt(&self, attempt: u32, max_attempts: u32, error: Option<&anyhow::Error>);
}

/// No-op callback
pub struct NoCallback;

impl PollCallback for NoCallback {
    fn on_attempt(&self, _attempt: u32, _max_attempts: u32, _error: Option<&anyhow::Error>) {}
}

/// Logs each failed attempt at debug level
pub struct LogCallback<'a> {
    pub what: &'a str,
}

impl PollCallback for LogCallback<'_> {
    fn on_attempt(&self, attempt: u32, max_attempts: u32, error: Option<&anyhow::Error>) {
        match error {
            Some(e) => log::debug!(
                "{}: attempt {}/{} failed: {:#}",
                self.what,
                attempt,
                max_attempts,
                e
            ),
            None => log::debug!(
                "{}: attempt {}/{} not ready",
                self.what,
                attempt,
                max_attempts
            ),
        }
    }
}

/// Poll `predicate` until it returns `Ok(true)`.
///
/// Each attempt sleeps first, then observes. A predicate error counts as
/// "not yet" and is kept for the timeout report. Returns the number of
/// attempts used on success.
pub fn poll_until<F>(
    config: &PollConfig,
    callback: Option<&dyn PollCallback>,
    mut predicate: F,
) -> Result<u32, PollTimeout>
where
    F: FnMut() -> anyhow::Result<bool>,
{
    let started = Instant::now();
    let mut last_error: Option<String> = None;

    for attempt in 0..config.max_attempts {
        let delay = config.interval_for_attempt(attempt);

        if let Some(deadline) = config.deadline
            && Instant::now() + delay > deadline
        {
            return Err(PollTimeout::DeadlineExceeded {
                attempts: attempt,
                elapsed: started.elapsed(),
            });
        }

        thread::sleep(delay);

        match predicate() {
            Ok(true) => return Ok(attempt + 1),
            Ok(false) => {
                last_error = None;
                if let Some(cb) = callback {
                    cb.on_attempt(attempt + 1, config.max_attempts, None);
                }
            }
            Err(e) => {
                if let Some(cb) = callback {
                    cb.on_attempt(attempt + 1, config.max_attempts, Some(&e));
                }
                last_error = Some(format!("{e:#}"));
            }
        }
    }

    Err(PollTimeout::Exhausted {
        attempts: config.max_attempts,
        last_error,
    })
}
