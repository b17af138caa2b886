use serde::de::{Error, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt::{Display, Formatter};

/// Name of the built-in default exchange
pub const EXCHANGE_DEFAULT: &str = "";

/// Name of the built-in `amq.direct` exchange
pub const EXCHANGE_AMQ_DIRECT: &str = "amq.direct";

/// Name of the built-in `amq.fanout` exchange
pub const EXCHANGE_AMQ_FANOUT: &str = "amq.fanout";

/// Name of the built-in `amq.headers` exchange
pub const EXCHANGE_AMQ_HEADERS: &str = "amq.headers";

/// Name of the built-in `amq.match` exchange
pub const EXCHANGE_AMQ_MATCH: &str = "amq.match";

/// Name of the built-in `amq.topic` exchange
pub const EXCHANGE_AMQ_TOPIC: &str = "amq.topic";

/// Represents the kinds of AMQP exchanges.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExchangeKind {
    /// A **direct** exchange delivers messages to queues based on the message
    /// routing key.
    #[default]
    Direct,

    /// A **fanout** exchange routes messages to all the queues that are bound
    /// to it, and the routing key is ignored.
    Fanout,

    /// A **headers** exchange is designed for routing on multiple attributes
    /// that are more easily expressed as message headers than a routing key.
    Headers,

    /// **Topic** exchanges route messages to one or many queues based on matching
    /// between a message routing key and the pattern that was used to bind a
    /// queue to an exchange.
    Topic,

    /// A plugin-provided exchange type, such as `x-consistent-hash`.
    Custom(String),
}

impl ExchangeKind {
    /// Returns the wire name of this exchange kind.
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Custom(name) => name,
        }
    }

    /// Parses the given wire name. Unknown names become
    /// [custom](ExchangeKind::Custom) kinds.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "direct" => ExchangeKind::Direct,
            "fanout" | "fan" => ExchangeKind::Fanout,
            "headers" | "header" | "match" => ExchangeKind::Headers,
            "topic" => ExchangeKind::Topic,
            _ => ExchangeKind::Custom(name.trim().to_string()),
        }
    }
}

impl Display for ExchangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ExchangeKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(ExchangeKindVisitor)
    }
}

struct ExchangeKindVisitor;

impl<'de> Visitor<'de> for ExchangeKindVisitor {
    type Value = ExchangeKind;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("an exchange kind, e.g. 'direct' or 'topic'")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: Error,
    {
        if value.trim().is_empty() {
            return Err(E::custom("exchange kind must not be empty"));
        }

        Ok(ExchangeKind::from_name(value))
    }
}
