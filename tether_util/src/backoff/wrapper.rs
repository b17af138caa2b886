use crate::BackoffConfig;
use backoff::backoff::Backoff as InnerBackoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex as SyncMutex;
use std::time::Duration;

/// Thin wrapper around [`ExponentialBackoff`] that provides light-weight
/// synchronization for interior mutability, an attempt counter with an
/// optional limit, and opinionated defaults.
pub struct Backoff {
    inner: SyncMutex<State>,
    max_attempts: Option<usize>,
}

struct State {
    backoff: ExponentialBackoff,
    attempts: usize,
}

impl Backoff {
    /// Builds a new [`Backoff`] based on the given [`BackoffConfig`].
    pub fn new(config: impl AsRef<BackoffConfig>) -> Self {
        let config = config.as_ref();
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(config.initial_interval())
            .with_max_interval(config.max_interval())
            .with_randomization_factor(config.randomization_factor())
            .with_multiplier(config.multiplier())
            .with_max_elapsed_time(config.max_elapsed_time())
            .build();

        Self {
            inner: SyncMutex::new(State {
                backoff,
                attempts: 0,
            }),
            max_attempts: config.max_attempts(),
        }
    }

    /// Returns a new [`Backoff`] builder.
    pub fn builder() -> BackoffBuilder {
        BackoffBuilder::new()
    }

    /// Returns the next backoff interval and counts an attempt, or returns
    /// [`None`] if this backoff is exhausted.
    pub fn next(&self) -> Option<Duration> {
        let mut state = self.inner.lock();

        if let Some(max_attempts) = self.max_attempts {
            if state.attempts >= max_attempts {
                return None;
            }
        }

        let duration = state.backoff.next_backoff()?;
        state.attempts += 1;

        Some(duration)
    }

    /// Sleeps for the next backoff interval. Returns `false` without sleeping
    /// if this backoff is exhausted.
    pub async fn sleep_next(&self) -> bool {
        let next_duration = self.next();

        match next_duration {
            Some(duration) => {
                tokio::time::sleep(duration).await;
                true
            }
            None => {
                tokio::task::yield_now().await;
                false
            }
        }
    }

    /// Reports the number of attempts counted since the last
    /// [reset](Backoff::reset).
    pub fn attempts(&self) -> usize {
        self.inner.lock().attempts
    }

    /// Resets this backoff to the initial interval and zero attempts.
    pub fn reset(&self) {
        let mut state = self.inner.lock();
        state.backoff.reset();
        state.attempts = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

/// Allows to build the [`Backoff`] incrementally.
pub struct BackoffBuilder {
    config: BackoffConfig,
}

impl Default for BackoffBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffBuilder {
    /// Returns a new [`Backoff`] builder.
    pub fn new() -> Self {
        Self {
            config: BackoffConfig::default(),
        }
    }

    /// Sets the
    /// [initial interval](ExponentialBackoffBuilder::with_initial_interval) to
    /// the given value.
    pub fn with_initial_interval(self, initial_interval: Duration) -> Self {
        Self {
            config: BackoffConfig {
                initial_interval,
                ..self.config
            },
        }
    }

    /// Sets the
    /// [max interval](ExponentialBackoffBuilder::with_max_interval) to the
    /// given value.
    pub fn with_max_interval(self, max_interval: Duration) -> Self {
        Self {
            config: BackoffConfig {
                max_interval,
                ..self.config
            },
        }
    }

    /// Sets the
    /// [randomization factor](ExponentialBackoffBuilder::with_randomization_factor)
    /// to the given value.
    pub fn with_randomization_factor(self, randomization_factor: f64) -> Self {
        Self {
            config: self.config.with_jitter(randomization_factor),
        }
    }

    /// Sets the
    /// [multiplier](ExponentialBackoffBuilder::with_multiplier) to the given
    /// value.
    pub fn with_multiplier(self, multiplier: f64) -> Self {
        Self {
            config: BackoffConfig {
                multiplier,
                ..self.config
            },
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(self, max_attempts: Option<usize>) -> Self {
        Self {
            config: self.config.with_max_attempts(max_attempts),
        }
    }

    /// Builds and returns the [`Backoff`].
    pub fn build(self) -> Backoff {
        Backoff::new(self.config)
    }
}
