use serde::Deserializer;
use serde::de::{Error, Visitor};
use std::fmt::Formatter;
use std::time::Duration;

/// Parses the given input as either a (possibly fractional) number of seconds
/// (`"2.5"`), or a [`humantime`] duration (`"2s 500ms"`).
pub fn parse(input: &str) -> Result<Duration, String> {
    let input = input.trim();

    if let Ok(seconds) = input.parse::<f64>() {
        return from_secs(seconds)
            .ok_or_else(|| format!("'{}' is not a valid number of seconds", input));
    }

    humantime::parse_duration(input).map_err(|error| error.to_string())
}

/// Converts the given number of seconds into a [`Duration`], rejecting
/// negative, non-finite and overflowing values.
pub fn from_secs(seconds: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(seconds).ok()
}

/// Deserializes a [`Duration`] from a number of seconds or a textual
/// representation accepted by [`parse`]. Intended for
/// `#[serde(deserialize_with = "...")]`.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(DurationVisitor)
}

/// Same as [`deserialize`], but accepts an explicit `null` as [`None`].
pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_option(OptionalDurationVisitor)
}

struct DurationVisitor;

impl<'de> Visitor<'de> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a number of seconds or a duration string like '1s 500ms'")
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(Duration::from_secs(value))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: Error,
    {
        u64::try_from(value)
            .map(Duration::from_secs)
            .map_err(|_| E::custom(format!("negative duration: {}", value)))
    }

    fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
    where
        E: Error,
    {
        from_secs(value).ok_or_else(|| E::custom(format!("invalid duration: {}", value)))
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        parse(value).map_err(E::custom)
    }
}

struct OptionalDurationVisitor;

impl<'de> Visitor<'de> for OptionalDurationVisitor {
    type Value = Option<Duration>;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("an optional duration")
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(None)
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(None)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserialize(deserializer).map(Some)
    }
}
