use crate::{Arguments, DeliveryMode, Properties, Value};
use std::time::Duration;

/// Represents an **outgoing** message: the encoded body plus its
/// [`Properties`].
///
/// This message owns only the encoded bytes of the payload. It provides no
/// facilities for encoding the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    body: Vec<u8>,
    properties: Properties,
}

impl Message {
    /// Creates a new [`MessageBuilder`].
    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    /// Shorthand for creating a [`Message`] with the body set to the given
    /// bytes.
    ///
    /// This method takes an owned `Vec<u8>`, to make sure no copying occurs
    /// and the bytes are simply moved into this message. When copying is
    /// acceptable, use [`from_byte_ref`](Message::from_byte_ref).
    pub fn from_bytes(body: Vec<u8>) -> Self {
        Self::builder().with_bytes(body).build()
    }

    /// Shorthand for creating a [`Message`] by copying the given bytes to the
    /// body.
    pub fn from_byte_ref(body: impl AsRef<[u8]>) -> Self {
        Self::builder().with_byte_ref(body).build()
    }

    /// Exposes the encoded body of this message.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Exposes the properties of this message.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Decomposes this message into its body and properties.
    pub fn into_parts(self) -> (Vec<u8>, Properties) {
        (self.body, self.properties)
    }

    /// Returns a builder pre-filled with a copy of this message.
    pub fn to_builder(&self) -> MessageBuilder {
        MessageBuilder {
            body: self.body.clone(),
            properties: self.properties.clone(),
        }
    }
}

/// Builds a [`Message`] incrementally.
#[derive(Debug, Default)]
pub struct MessageBuilder {
    body: Vec<u8>,
    properties: Properties,
}

impl MessageBuilder {
    /// Creates a builder for an empty message without properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the given bytes into the body.
    pub fn with_bytes(self, body: Vec<u8>) -> Self {
        Self { body, ..self }
    }

    /// Copies the given bytes into the body.
    pub fn with_byte_ref(self, body: impl AsRef<[u8]>) -> Self {
        self.with_bytes(body.as_ref().to_vec())
    }

    /// Sets the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    /// Sets the content encoding.
    pub fn with_content_encoding(mut self, content_encoding: impl Into<String>) -> Self {
        self.properties.content_encoding = Some(content_encoding.into());
        self
    }

    /// Adds a single header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.headers.insert(key, value);
        self
    }

    /// Replaces all headers.
    pub fn with_headers(mut self, headers: Arguments) -> Self {
        self.properties.headers = headers;
        self
    }

    /// Sets the delivery mode.
    pub fn with_delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.properties.delivery_mode = Some(delivery_mode);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.properties.priority = Some(priority);
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the reply-to queue name.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    /// Sets the per-message TTL. The broker expects whole milliseconds.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.properties.expiration = Some(expiration.as_millis().to_string());
        self
    }

    /// Sets the message id.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.properties.message_id = Some(message_id.into());
        self
    }

    /// Sets the timestamp, in seconds since the Unix epoch.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.properties.timestamp = Some(timestamp);
        self
    }

    /// Sets the message type name.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.properties.kind = Some(kind.into());
        self
    }

    /// Sets the user id.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.properties.user_id = Some(user_id.into());
        self
    }

    /// Sets the application id.
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.properties.app_id = Some(app_id.into());
        self
    }

    /// Replaces all properties.
    pub fn with_properties(self, properties: Properties) -> Self {
        Self { properties, ..self }
    }

    /// Builds the [`Message`].
    pub fn build(self) -> Message {
        Message {
            body: self.body,
            properties: self.properties,
        }
    }
}

/// Convenience implementations of [`From`] for [`Message`].
const _: () = {
    impl From<Vec<u8>> for Message {
        fn from(value: Vec<u8>) -> Self {
            Message::from_bytes(value)
        }
    }

    impl From<&[u8]> for Message {
        fn from(value: &[u8]) -> Self {
            Message::from_byte_ref(value)
        }
    }

    impl From<String> for Message {
        fn from(value: String) -> Self {
            Message::from_bytes(value.into_bytes())
        }
    }

    impl From<&str> for Message {
        fn from(value: &str) -> Self {
            Message::from_byte_ref(value)
        }
    }

    impl From<MessageBuilder> for Message {
        fn from(value: MessageBuilder) -> Self {
            value.build()
        }
    }
};

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_sets_properties() {
        // Given
        let message = Message::builder()
            .with_byte_ref("hello")
            .with_content_type("text/plain")
            .with_delivery_mode(DeliveryMode::Durable)
            .with_header("attempt", 2)
            .with_expiration(Duration::from_secs(3))
            .build();

        // Then
        assert_eq!(message.body(), b"hello");
        assert_eq!(message.properties().content_type.as_deref(), Some("text/plain"));
        assert_eq!(message.properties().delivery_mode, Some(DeliveryMode::Durable));
        assert_eq!(message.properties().header("attempt"), Some(&Value::Int(2)));
        assert_eq!(message.properties().expiration.as_deref(), Some("3000"));
    }
}
