use serde::Deserialize;

/// Defines whether the broker persists the messages to disk, which affects
/// whether such messages are able to survive a broker restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Delivery mode `1`: non-persistent (transient): messages sent with this
    /// mode will **not** survive a broker restart.
    #[default]
    #[serde(alias = "non_persistent")]
    Transient,
    /// Delivery mode `2`: persistent (durable): messages sent with this mode
    /// will be written to disk and, if they are **also** routed to a **durable
    /// queue**, they **will** survive a broker restart.
    #[serde(alias = "persistent")]
    Durable,
}

impl DeliveryMode {
    /// Returns the appropriate `u8` value recognized by the broker.
    pub const fn amqp_value(&self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Durable => 2,
        }
    }
}

impl From<u8> for DeliveryMode {
    fn from(value: u8) -> Self {
        match value {
            2 => DeliveryMode::Durable,
            _ => DeliveryMode::Transient,
        }
    }
}
