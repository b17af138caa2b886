use crate::engine::{RawChannel, RawDelivery};
use crate::{Decoder, Error, Properties, Result};
use parking_lot::Mutex as SyncMutex;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tracing::warn;

/// Represents an **incoming** message, delivered to a consumer or fetched
/// with a basic get.
///
/// Unless it was received in `no_ack` mode, the message must be finalized
/// exactly once: [acknowledged](IncomingMessage::ack),
/// [rejected](IncomingMessage::reject) or
/// [negatively acknowledged](IncomingMessage::nack). Finalization goes to the
/// very channel that delivered the message; if that channel has been replaced
/// by a reconnect in the meantime, the broker has already requeued the
/// message and finalization fails.
pub struct IncomingMessage {
    delivery_tag: u64,
    consumer_tag: Option<Arc<str>>,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    message_count: Option<u32>,
    properties: Properties,
    body: Vec<u8>,
    no_ack: bool,
    acker: SyncMutex<Option<Arc<dyn RawChannel>>>,
}

impl IncomingMessage {
    /// Attaches the given raw delivery to the channel that delivered it.
    pub(crate) fn new(
        delivery: RawDelivery,
        consumer_tag: Option<Arc<str>>,
        channel: Arc<dyn RawChannel>,
        no_ack: bool,
    ) -> Self {
        let acker = if no_ack { None } else { Some(channel) };

        Self {
            delivery_tag: delivery.delivery_tag,
            consumer_tag,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            message_count: delivery.message_count,
            properties: delivery.properties,
            body: delivery.body,
            no_ack,
            acker: SyncMutex::new(acker),
        }
    }
}

impl IncomingMessage {
    /// Exposes the channel-scoped delivery tag.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Exposes the consumer tag, if this message was delivered to a consumer.
    pub fn consumer_tag(&self) -> Option<&str> {
        self.consumer_tag.as_deref()
    }

    /// Exposes the exchange through which this message was published.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Exposes the routing key with which this message was published.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Reports whether this message has been delivered before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Exposes the number of messages left in the queue, as reported by a
    /// basic get.
    pub fn message_count(&self) -> Option<u32> {
        self.message_count
    }

    /// Exposes the properties of this message.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Exposes the raw body of this message.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Consumes this message, returning its body.
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Reports whether this message was received in `no_ack` mode.
    pub fn is_no_ack(&self) -> bool {
        self.no_ack
    }

    /// Reports whether this message still awaits finalization.
    pub fn is_pending(&self) -> bool {
        self.acker.lock().is_some()
    }

    /// Decodes the body with the given [`Decoder`].
    pub fn decode<D>(&self, decoder: &D) -> Result<D::Output>
    where
        D: Decoder,
    {
        decoder
            .decode(&self.body)
            .map_err(|error| Error::Deserialization(error.to_string()))
    }
}

impl IncomingMessage {
    /// Positively acknowledges this message.
    pub async fn ack(&self) -> Result<()> {
        let channel = self.take_acker()?;

        channel
            .basic_ack(self.delivery_tag, false)
            .await
            .map_err(|error| self.report("acknowledge", error.into()))
    }

    /// Rejects this message, optionally returning it to the queue.
    pub async fn reject(&self, requeue: bool) -> Result<()> {
        let channel = self.take_acker()?;

        channel
            .basic_reject(self.delivery_tag, requeue)
            .await
            .map_err(|error| self.report("reject", error.into()))
    }

    /// Negatively acknowledges this message, optionally returning it to the
    /// queue.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        let channel = self.take_acker()?;

        channel
            .basic_nack(self.delivery_tag, false, requeue)
            .await
            .map_err(|error| self.report("negatively acknowledge", error.into()))
    }

    fn take_acker(&self) -> Result<Arc<dyn RawChannel>> {
        if self.no_ack {
            return Err(Error::Policy(
                "a message received in no_ack mode cannot be finalized".to_string(),
            ));
        }

        self.acker
            .lock()
            .take()
            .ok_or_else(|| Error::Policy("the message has already been processed".to_string()))
    }

    fn report(&self, action: &str, error: Error) -> Error {
        warn!(
            delivery_tag = self.delivery_tag,
            routing_key = self.routing_key.as_str(),
            ?error,
            error_message = %error,
            "Failed to {} an incoming message",
            action,
        );

        error
    }
}

impl Debug for IncomingMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("delivery_tag", &self.delivery_tag)
            .field("consumer_tag", &self.consumer_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}
