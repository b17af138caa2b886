use crate::{
    Arguments, CloseReason, ConsumeOptions, Endpoint, Error, ExchangeSpec, Message, Properties,
    Qos, QueueSpec, ReturnedMessage,
};
use async_trait::async_trait;
use std::sync::Arc;
use tether_sync::Gate;
use tokio::sync::mpsc;

/// The `lapin`-backed engine.
pub mod lapin;

/// Failures reported by an [`Engine`] and the sessions and channels it
/// creates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// A connection attempt failed.
    #[error("failed to connect: {0}")]
    Connect(String),
    /// The link to the broker is gone: the session and all its channels are
    /// dead.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// The broker closed this channel. The session itself is still alive.
    #[error("channel closed by the broker: {0}")]
    ChannelClosed(CloseReason),
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Connect(message) => Error::Connection(message),
            TransportError::ConnectionLost(message) => Error::Connection(message),
            TransportError::ChannelClosed(reason) => Error::ChannelClosed(Some(reason)),
        }
    }
}

/// The receiving end of a consumer subscription. An engine pushes every
/// delivery for the subscription into this sink, and drops it once the
/// subscription ends for any reason.
pub type DeliverySink = mpsc::UnboundedSender<RawDelivery>;

/// Creates [`Session`]s: single, non-robust connections to a broker.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    /// Makes a single attempt to connect to the given endpoint.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Session>, TransportError>;
}

/// A single physical connection to a broker.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Returns a gate that opens with the causing error once this session is
    /// closed for any reason.
    fn closed(&self) -> Gate<TransportError>;

    /// Opens a new channel on this session.
    async fn open_channel(&self) -> Result<Arc<dyn RawChannel>, TransportError>;

    /// Closes this session along with all its channels.
    async fn close(&self) -> Result<(), TransportError>;
}

/// The outcome of a publish, as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker accepted the message.
    Ack,
    /// The broker refused the message.
    Nack,
    /// The broker handed the message back.
    Returned(Box<ReturnedMessage>),
    /// Publisher confirms are not enabled on this channel.
    NotRequested,
}

/// The broker's answer to a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclared {
    /// The queue name, as assigned by the broker for anonymous queues.
    pub name: String,
    /// The number of ready messages in the queue.
    pub message_count: u32,
    /// The number of active consumers of the queue.
    pub consumer_count: u32,
}

/// A message as delivered by an engine, before it is attached to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    /// The channel-scoped delivery tag.
    pub delivery_tag: u64,
    /// The exchange through which the message was published.
    pub exchange: String,
    /// The routing key with which the message was published.
    pub routing_key: String,
    /// Whether this message has been delivered before.
    pub redelivered: bool,
    /// The number of messages remaining in the queue, reported by basic get.
    pub message_count: Option<u32>,
    /// The message properties.
    pub properties: Properties,
    /// The message body.
    pub body: Vec<u8>,
}

/// A single channel on a [`Session`], exposing the raw AMQP methods.
///
/// Every method fails with [`TransportError::ChannelClosed`] once the broker
/// closes this channel, and with [`TransportError::ConnectionLost`] once the
/// session is gone.
#[async_trait]
pub trait RawChannel: Send + Sync + 'static {
    /// The channel number assigned by the session.
    fn id(&self) -> u16;

    /// Returns a gate that opens with the causing error once this channel is
    /// closed for any reason.
    fn closed(&self) -> Gate<TransportError>;

    /// `exchange.declare`
    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), TransportError>;

    /// `exchange.delete`
    async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), TransportError>;

    /// `exchange.bind`: routes messages from `source` into `destination`.
    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError>;

    /// `exchange.unbind`
    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError>;

    /// `queue.declare`. An empty name asks the broker to assign one.
    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueDeclared, TransportError>;

    /// `queue.bind`
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError>;

    /// `queue.unbind`
    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError>;

    /// `queue.purge`: returns the number of purged messages.
    async fn queue_purge(&self, queue: &str) -> Result<u32, TransportError>;

    /// `queue.delete`: returns the number of deleted messages.
    async fn queue_delete(
        &self,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, TransportError>;

    /// `basic.qos`
    async fn basic_qos(&self, qos: &Qos) -> Result<(), TransportError>;

    /// `basic.publish`, awaiting the publisher confirm if enabled.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        mandatory: bool,
        immediate: bool,
    ) -> Result<Confirmation, TransportError>;

    /// `basic.consume`: starts pushing deliveries into the given sink. An
    /// empty consumer tag asks the broker to assign one. Returns the
    /// effective consumer tag.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
        sink: DeliverySink,
    ) -> Result<String, TransportError>;

    /// `basic.cancel`
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    /// `basic.get`: returns [`None`] if the queue is empty.
    async fn basic_get(
        &self,
        queue: &str,
        no_ack: bool,
    ) -> Result<Option<RawDelivery>, TransportError>;

    /// `basic.ack`
    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError>;

    /// `basic.reject`
    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// `basic.nack`
    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError>;

    /// `channel.close`
    async fn close(&self) -> Result<(), TransportError>;
}
