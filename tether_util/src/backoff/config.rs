use crate::duration;
use serde::de::{Error, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt::Formatter;
use std::time::Duration;

/// Defines a collection of fine-tune parameters for an
/// [exponential backoff](backoff::ExponentialBackoff) mechanism, plus an
/// optional limit on the number of attempts.
///
/// The [default](BackoffConfig::default) is a fixed five-second interval
/// without jitter and without any limit. A fixed interval is simply an
/// exponential backoff with a [multiplier](BackoffConfig::multiplier) of `1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub(crate) initial_interval: Duration,
    pub(crate) max_interval: Duration,
    pub(crate) randomization_factor: f64,
    pub(crate) multiplier: f64,
    pub(crate) max_elapsed_time: Option<Duration>,
    pub(crate) max_attempts: Option<usize>,
}

impl BackoffConfig {
    /// Creates a fixed-interval definition: every attempt waits exactly the
    /// given interval.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            ..Self::default()
        }
    }

    /// Sets the relative jitter applied to every interval (e.g., `0.1` means
    /// ±10%). Values are clamped into `0.0..=1.0`.
    pub fn with_jitter(self, randomization_factor: f64) -> Self {
        Self {
            randomization_factor: clamp_factor(randomization_factor),
            ..self
        }
    }

    /// Limits the number of attempts after which the backoff reports
    /// exhaustion.
    pub fn with_max_attempts(self, max_attempts: Option<usize>) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Exposes the
    /// [initial interval](backoff::ExponentialBackoffBuilder::with_initial_interval)
    /// of this backoff definition.
    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    /// Exposes the
    /// [max interval](backoff::ExponentialBackoffBuilder::with_max_interval)
    /// of this backoff definition. Never less than the initial interval.
    pub fn max_interval(&self) -> Duration {
        self.max_interval.max(self.initial_interval)
    }

    /// Exposes the
    /// [randomization factor](backoff::ExponentialBackoffBuilder::with_randomization_factor)
    /// of this backoff definition.
    pub fn randomization_factor(&self) -> f64 {
        self.randomization_factor
    }

    /// Exposes the
    /// [multiplier](backoff::ExponentialBackoffBuilder::with_multiplier)
    /// of this backoff definition.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Exposes the
    /// [max elapsed time](backoff::ExponentialBackoffBuilder::with_max_elapsed_time)
    /// of this backoff definition.
    pub fn max_elapsed_time(&self) -> Option<Duration> {
        self.max_elapsed_time
    }

    /// Exposes the maximum number of attempts, if limited.
    pub fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }
}

impl BackoffConfig {
    fn default_initial_interval() -> Duration {
        Duration::from_secs(5)
    }

    fn default_max_interval() -> Duration {
        Duration::from_secs(60)
    }

    fn default_randomization_factor() -> f64 {
        0.0
    }

    fn default_multiplier() -> f64 {
        1.0
    }

    fn default_max_elapsed_time() -> Option<Duration> {
        None
    }

    fn default_max_attempts() -> Option<usize> {
        None
    }
}

fn clamp_factor(factor: f64) -> f64 {
    if factor.is_finite() {
        factor.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Self::default_initial_interval(),
            max_interval: Self::default_max_interval(),
            randomization_factor: Self::default_randomization_factor(),
            multiplier: Self::default_multiplier(),
            max_elapsed_time: Self::default_max_elapsed_time(),
            max_attempts: Self::default_max_attempts(),
        }
    }
}

impl AsRef<BackoffConfig> for BackoffConfig {
    fn as_ref(&self) -> &BackoffConfig {
        self
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for BackoffConfig {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(BackoffConfigVisitor)
        }
    }

    struct BackoffConfigVisitor;

    #[derive(Deserialize)]
    #[serde(field_identifier, rename_all = "snake_case")]
    enum BackoffConfigField {
        #[serde(alias = "interval")]
        InitialInterval,
        MaxInterval,
        #[serde(alias = "jitter")]
        RandomizationFactor,
        Multiplier,
        MaxElapsedTime,
        MaxAttempts,
        #[serde(other)]
        Ignore,
    }

    struct SerdeDuration(Duration);

    impl<'de> Deserialize<'de> for SerdeDuration {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            duration::deserialize(deserializer).map(SerdeDuration)
        }
    }

    impl<'de> Visitor<'de> for BackoffConfigVisitor {
        type Value = BackoffConfig;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of backoff configuration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut initial_interval = None;
            let mut max_interval = None;
            let mut randomization_factor = None;
            let mut multiplier = None;
            let mut max_elapsed_time = None;
            let mut max_attempts = None;

            while let Some(key) = map.next_key::<BackoffConfigField>()? {
                match key {
                    BackoffConfigField::InitialInterval => {
                        initial_interval = Some(map.next_value::<SerdeDuration>()?.0);
                    }
                    BackoffConfigField::MaxInterval => {
                        max_interval = Some(map.next_value::<SerdeDuration>()?.0);
                    }
                    BackoffConfigField::RandomizationFactor => {
                        let factor = map.next_value::<f64>()?;
                        if !(0.0..=1.0).contains(&factor) {
                            return Err(Error::custom(format!(
                                "randomization factor must be within 0.0..=1.0, got {}",
                                factor,
                            )));
                        }
                        randomization_factor = Some(factor);
                    }
                    BackoffConfigField::Multiplier => {
                        multiplier = Some(map.next_value::<f64>()?);
                    }
                    BackoffConfigField::MaxElapsedTime => {
                        max_elapsed_time = Some(
                            map.next_value::<Option<SerdeDuration>>()?
                                .map(|duration| duration.0),
                        );
                    }
                    BackoffConfigField::MaxAttempts => {
                        max_attempts = Some(map.next_value::<Option<usize>>()?);
                    }
                    BackoffConfigField::Ignore => {
                        map.next_value::<IgnoredAny>()?;
                    }
                };
            }

            Ok(BackoffConfig {
                initial_interval: initial_interval
                    .unwrap_or_else(BackoffConfig::default_initial_interval),
                max_interval: max_interval.unwrap_or_else(BackoffConfig::default_max_interval),
                randomization_factor: randomization_factor
                    .unwrap_or_else(BackoffConfig::default_randomization_factor),
                multiplier: multiplier.unwrap_or_else(BackoffConfig::default_multiplier),
                max_elapsed_time: max_elapsed_time
                    .unwrap_or_else(BackoffConfig::default_max_elapsed_time),
                max_attempts: max_attempts.unwrap_or_else(BackoffConfig::default_max_attempts),
            })
        }
    }
};
