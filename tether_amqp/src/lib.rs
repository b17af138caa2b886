#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the error types of this crate.
mod error;
pub use self::error::{CloseReason, Error, Result};

/// Exposes the broker address and its parsing.
mod endpoint;
pub use self::endpoint::{DsnChunks, Endpoint, EndpointError, Scheme};

/// Exposes the connection configuration section.
mod config;
pub use self::config::ConnectionConfig;

/// Exposes the transport abstraction that connections and channels run on.
pub mod engine;
pub use self::engine::lapin::LapinEngine;
pub use self::engine::QueueDeclared;

/// Exposes plain representations of AMQP concepts.
mod repr {
    pub mod arguments;
    pub mod delivery;
    pub mod exchange;
}
pub use self::repr::arguments::{Arguments, Value};
pub use self::repr::delivery::DeliveryMode;
pub use self::repr::exchange::{
    EXCHANGE_AMQ_DIRECT, EXCHANGE_AMQ_FANOUT, EXCHANGE_AMQ_HEADERS, EXCHANGE_AMQ_MATCH,
    EXCHANGE_AMQ_TOPIC, EXCHANGE_DEFAULT, ExchangeKind,
};

/// Exposes outgoing, incoming and returned messages.
mod message {
    pub mod decoder;
    pub mod incoming;
    pub mod outgoing;
    pub mod properties;
    pub mod returned;
}
#[cfg(feature = "json")]
pub use self::message::decoder::JsonDecoder;
pub use self::message::decoder::{Decoder, NoopDecoder, StringDecoder};
pub use self::message::incoming::IncomingMessage;
pub use self::message::outgoing::{Message, MessageBuilder};
pub use self::message::properties::Properties;
pub use self::message::returned::ReturnedMessage;

/// Exposes channels and their events.
mod channel;
pub use self::channel::{Channel, ChannelOptions, ChannelState, CloseEvent, Qos, ReturnEvent};

/// Exposes exchanges and queues.
mod topology {
    pub mod exchange;
    pub mod queue;
}
pub use self::topology::exchange::{Exchange, ExchangeRef, ExchangeSpec, PublishOptions};
pub use self::topology::queue::{
    ConsumeOptions, ConsumerTag, DeleteOptions, GetOptions, MessageHandler, Queue, QueueSpec,
};

/// Exposes the pull-based consumption of a queue.
mod iterator;
pub use self::iterator::{IteratorOptions, QueueIterator};

/// Exposes the plain, non-recovering connection.
mod connection;
pub use self::connection::Connection;

/// Exposes connections and channels that survive losing the link to the broker.
mod robust {
    pub mod channel;
    pub mod connection;
    pub mod ledger;
}
pub use self::robust::channel::{DeclareOptions, RobustChannel};
pub use self::robust::connection::{ConnectionState, ReconnectEvent, RobustConnection};

// Re-export [`NonEmpty`] as it is part of this crate's API.
pub use nonempty::NonEmpty;

use std::sync::Arc;

/// Connects a plain [`Connection`] to a real broker.
pub async fn connect(config: impl Into<ConnectionConfig>) -> Result<Connection> {
    Connection::connect(Arc::new(LapinEngine::new()), config).await
}

/// Connects a [`RobustConnection`] to a real broker.
pub async fn connect_robust(config: impl Into<ConnectionConfig>) -> Result<RobustConnection> {
    RobustConnection::connect(Arc::new(LapinEngine::new()), config).await
}
