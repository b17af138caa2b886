use crate::{Arguments, DeliveryMode, Value};

/// The basic properties attached to a message.
///
/// Every property is optional; [`Properties::default`] describes a message
/// without any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    /// MIME content type, e.g. `application/json`.
    pub content_type: Option<String>,
    /// MIME content encoding, e.g. `gzip`.
    pub content_encoding: Option<String>,
    /// Application headers.
    pub headers: Arguments,
    /// Whether the broker should persist the message.
    pub delivery_mode: Option<DeliveryMode>,
    /// Message priority, `0` to `9`.
    pub priority: Option<u8>,
    /// Application correlation identifier, used to match replies to requests.
    pub correlation_id: Option<String>,
    /// The queue to which replies should be sent.
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, as a string.
    pub expiration: Option<String>,
    /// Application message identifier.
    pub message_id: Option<String>,
    /// Message timestamp, in seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    /// Message type name (the AMQP `type` property).
    pub kind: Option<String>,
    /// Creating user id, validated by the broker.
    pub user_id: Option<String>,
    /// Creating application id.
    pub app_id: Option<String>,
}

impl Properties {
    /// Retrieves a header by key.
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }
}
