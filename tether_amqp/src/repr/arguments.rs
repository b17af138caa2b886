use serde::de::{Error, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::Formatter;

/// Represents a value in an AMQP argument table: declaration arguments
/// (`x-message-ttl`, `x-max-length`, …), binding arguments (`x-match`, …),
/// or message headers.
///
/// ## Important: integer size
///
/// When matching headers for routing, brokers such as RabbitMQ only consider
/// integer values up to **32-bit size**. Larger values are still delivered as
/// message headers, but silently ignored by headers exchanges.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    /// A boolean value.
    Boolean(bool),
    /// A signed integer value.
    Int(i64),
    /// A string value.
    String(String),
}

/// An ordered table of named [`Value`]s.
///
/// Two tables with the same entries are equal regardless of insertion order,
/// which makes them usable as part of a binding identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Arguments {
    entries: BTreeMap<String, Value>,
}

impl Arguments {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns this table with the given entry added.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Adds or replaces the given entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    /// Retrieves the entry under the given key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Reports whether this table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reports the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over the entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }
}

impl Value {
    /// Exposes the string content, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    /// Exposes the integer content, if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }
}

const _: () = {
    impl From<bool> for Value {
        fn from(value: bool) -> Self {
            Value::Boolean(value)
        }
    }

    impl From<i32> for Value {
        fn from(value: i32) -> Self {
            Value::Int(i64::from(value))
        }
    }

    impl From<u32> for Value {
        fn from(value: u32) -> Self {
            Value::Int(i64::from(value))
        }
    }

    impl From<i64> for Value {
        fn from(value: i64) -> Self {
            Value::Int(value)
        }
    }

    impl From<&str> for Value {
        fn from(value: &str) -> Self {
            Value::String(value.to_string())
        }
    }

    impl From<String> for Value {
        fn from(value: String) -> Self {
            Value::String(value)
        }
    }

    impl<K, V> FromIterator<(K, V)> for Arguments
    where
        K: Into<String>,
        V: Into<Value>,
    {
        fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
            let entries = iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect();

            Self { entries }
        }
    }

    impl<const N: usize, K, V> From<[(K, V); N]> for Arguments
    where
        K: Into<String>,
        V: Into<Value>,
    {
        fn from(value: [(K, V); N]) -> Self {
            value.into_iter().collect()
        }
    }
};

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Boolean(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::String(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("an argument value: a boolean, an integer, or a string")
    }

    fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(Value::Boolean(value))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(Value::Int(value))
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(Value::Int(value.try_into().map_err(E::custom)?))
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(Value::String(value.to_string()))
    }

    fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Ok(Value::String(value))
    }
}

impl Serialize for Arguments {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.entries.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Arguments {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries = BTreeMap::<String, Value>::deserialize(deserializer)?;

        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserialize_table() {
        // Given
        let input = "x-message-ttl: 60000\nx-match: all\nx-single-active-consumer: true\n";
        let expected = Arguments::new()
            .with("x-message-ttl", 60000)
            .with("x-match", "all")
            .with("x-single-active-consumer", true);

        // When
        let actual = serde_yml::from_str::<Arguments>(input).unwrap();

        // Then
        assert_eq!(expected, actual);
    }

    #[test]
    fn equality_ignores_insertion_order() {
        // Given
        let left = Arguments::from([("a", 1), ("b", 2)]);
        let right = Arguments::from([("b", 2), ("a", 1)]);

        // Then
        assert_eq!(left, right);
    }

    #[test]
    fn serialize_round_trip_through_json() {
        // Given
        let arguments = Arguments::new().with("x-max-length", 10).with("mode", "lazy");

        // When
        let json = serde_json::to_string(&arguments).unwrap();

        // Then
        assert_eq!(json, r#"{"mode":"lazy","x-max-length":10}"#);
    }
}
