use crate::Properties;

/// A message that the broker handed back to the publisher because it could
/// not be routed (for `mandatory` publishing) or delivered (for `immediate`
/// publishing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedMessage {
    reply_code: u16,
    reply_text: String,
    exchange: String,
    routing_key: String,
    properties: Properties,
    body: Vec<u8>,
}

impl ReturnedMessage {
    /// Creates a returned message. Intended for engine implementations.
    pub fn new(
        reply_code: u16,
        reply_text: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        properties: Properties,
        body: Vec<u8>,
    ) -> Self {
        Self {
            reply_code,
            reply_text: reply_text.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            properties,
            body,
        }
    }

    /// The AMQP reply code, e.g. `312 NO_ROUTE`.
    pub fn reply_code(&self) -> u16 {
        self.reply_code
    }

    /// The reply text.
    pub fn reply_text(&self) -> &str {
        &self.reply_text
    }

    /// The exchange to which the message was published.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// The routing key with which the message was published.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// The properties of the returned message.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// The body of the returned message.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}
