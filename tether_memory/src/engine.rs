use crate::broker::BrokerInner;
use crate::state::{ChannelKey, Destination, State};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use tether_amqp::engine::{
    Confirmation, DeliverySink, Engine, QueueDeclared, RawChannel, RawDelivery, Session,
    TransportError,
};
use tether_amqp::{
    Arguments, CloseReason, ConsumeOptions, Endpoint, ExchangeSpec, Message, Qos, QueueSpec,
};
use tether_sync::{Gate, Latch};
use tracing::debug;

/// Connects sessions to a [`MemoryBroker`](crate::MemoryBroker), regardless
/// of the endpoint.
pub(crate) struct MemoryEngine {
    broker: Arc<BrokerInner>,
}

impl MemoryEngine {
    pub(crate) fn new(broker: Arc<BrokerInner>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Session>, TransportError> {
        self.broker.admit().await?;

        let closed = Latch::new();
        let id = self.broker.state.lock().open_session(closed.clone());

        debug!(
            identifier = endpoint.identifier(),
            session = id,
            "Accepted an in-memory connection",
        );

        Ok(Arc::new(MemorySession {
            id,
            broker: Arc::clone(&self.broker),
            closed,
            channel_numbers: AtomicU16::new(1),
        }))
    }
}

struct MemorySession {
    id: u64,
    broker: Arc<BrokerInner>,
    closed: Latch<TransportError>,
    channel_numbers: AtomicU16,
}

#[async_trait]
impl Session for MemorySession {
    fn closed(&self) -> Gate<TransportError> {
        self.closed.gate()
    }

    async fn open_channel(&self) -> Result<Arc<dyn RawChannel>, TransportError> {
        self.broker.enter("channel.open").await;

        let mut state = self.broker.state.lock();
        if !state.has_session(self.id) {
            return Err(self.closed.gate().value().unwrap_or_else(|| {
                TransportError::ConnectionLost("the connection is closed".to_string())
            }));
        }

        let key = (self.id, self.channel_numbers.fetch_add(1, Ordering::Relaxed));
        let closed = Latch::new();
        state.open_channel(key, closed.clone());

        Ok(Arc::new(MemoryChannel {
            key,
            broker: Arc::clone(&self.broker),
            closed,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.enter("connection.close").await;

        let error = TransportError::ConnectionLost("closed by the client".to_string());
        if self.broker.state.lock().close_session(self.id, error) {
            Ok(())
        } else {
            Err(TransportError::ConnectionLost(
                "the connection is already closed".to_string(),
            ))
        }
    }
}

struct MemoryChannel {
    key: ChannelKey,
    broker: Arc<BrokerInner>,
    closed: Latch<TransportError>,
}

impl MemoryChannel {
    /// Runs the given operation against the broker state. An operation that
    /// fails closes this channel with the failure as the reason.
    async fn call<T, F>(&self, method: &'static str, operation: F) -> Result<T, TransportError>
    where
        F: FnOnce(&mut State, ChannelKey) -> Result<T, CloseReason> + Send,
    {
        self.broker.enter(method).await;

        let mut state = self.broker.state.lock();
        if !state.has_channel(self.key) {
            return Err(self.closed.gate().value().unwrap_or_else(|| {
                TransportError::ConnectionLost("the channel is gone".to_string())
            }));
        }

        operation(&mut *state, self.key).map_err(|reason| {
            let error = TransportError::ChannelClosed(reason);
            state.close_channel(self.key, error.clone());

            error
        })
    }
}

#[async_trait]
impl RawChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.key.1
    }

    fn closed(&self) -> Gate<TransportError> {
        self.closed.gate()
    }

    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        self.call("exchange.declare", |state, _| state.declare_exchange(spec))
            .await
    }

    async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), TransportError> {
        self.call("exchange.delete", |state, _| {
            state.delete_exchange(name, if_unused)
        })
        .await
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError> {
        self.call("exchange.bind", |state, key| {
            let destination = Destination::Exchange(destination.to_string());
            state.bind(key.0, source, destination, routing_key, arguments)
        })
        .await
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError> {
        self.call("exchange.unbind", |state, key| {
            let destination = Destination::Exchange(destination.to_string());
            state.unbind(key.0, source, destination, routing_key, arguments)
        })
        .await
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueDeclared, TransportError> {
        self.call("queue.declare", |state, key| state.declare_queue(key.0, spec))
            .await
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError> {
        self.call("queue.bind", |state, key| {
            let destination = Destination::Queue(queue.to_string());
            state.bind(key.0, exchange, destination, routing_key, arguments)
        })
        .await
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError> {
        self.call("queue.unbind", |state, key| {
            let destination = Destination::Queue(queue.to_string());
            state.unbind(key.0, exchange, destination, routing_key, arguments)
        })
        .await
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, TransportError> {
        self.call("queue.purge", |state, key| state.purge_queue(key.0, queue))
            .await
    }

    async fn queue_delete(
        &self,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, TransportError> {
        self.call("queue.delete", |state, key| {
            state.delete_queue(key.0, queue, if_unused, if_empty)
        })
        .await
    }

    async fn basic_qos(&self, qos: &Qos) -> Result<(), TransportError> {
        self.call("basic.qos", |state, key| {
            state.set_qos(key, qos);
            Ok(())
        })
        .await
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        mandatory: bool,
        _immediate: bool,
    ) -> Result<Confirmation, TransportError> {
        self.call("basic.publish", |state, _| {
            state.publish(exchange, routing_key, message, mandatory)
        })
        .await
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
        sink: DeliverySink,
    ) -> Result<String, TransportError> {
        self.call("basic.consume", |state, key| {
            state.consume(key, queue, consumer_tag, options, sink)
        })
        .await
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.call("basic.cancel", |state, key| {
            state.cancel(key, consumer_tag);
            Ok(())
        })
        .await
    }

    async fn basic_get(
        &self,
        queue: &str,
        no_ack: bool,
    ) -> Result<Option<RawDelivery>, TransportError> {
        self.call("basic.get", |state, key| state.get(key, queue, no_ack))
            .await
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError> {
        self.call("basic.ack", |state, key| {
            state.ack(key, delivery_tag, multiple)
        })
        .await
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.call("basic.reject", |state, key| {
            state.reject(key, delivery_tag, false, requeue)
        })
        .await
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.call("basic.nack", |state, key| {
            state.reject(key, delivery_tag, multiple, requeue)
        })
        .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.enter("channel.close").await;

        self.broker.state.lock().close_channel(
            self.key,
            TransportError::ChannelClosed(CloseReason::new(200, "closed by the client")),
        );

        Ok(())
    }
}
