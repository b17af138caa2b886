use crate::engine::{
    Confirmation, DeliverySink, Engine, QueueDeclared, RawChannel, RawDelivery, Session,
    TransportError,
};
use crate::{
    Arguments, CloseReason, ConsumeOptions, DeliveryMode, Endpoint, ExchangeKind, ExchangeSpec,
    Message, Properties, Qos, QueueSpec, ReturnedMessage, Value,
};
use ::lapin::message::{BasicReturnMessage, Delivery};
use ::lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
    ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use ::lapin::protocol::basic::AMQPProperties;
use ::lapin::protocol::AMQPErrorKind;
use ::lapin::publisher_confirm::Confirmation as LapinConfirm;
use ::lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use ::lapin::{
    Channel as LapinChannel, Connection as LapinConnection, ConnectionProperties,
    Error as LapinError, ExchangeKind as LapinExchangeKind,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use tether_sync::{Gate, Latch};
use tokio::select;
use tracing::{debug, warn};

/// An [`Engine`] that talks to a real broker through the `lapin` crate, on
/// the current Tokio runtime.
///
/// Every channel opened by this engine has publisher confirms enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinEngine;

impl LapinEngine {
    /// Creates the engine.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Engine for LapinEngine {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Session>, TransportError> {
        // Set up the connection properties to use the current Tokio context
        let mut properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        if let Some(name) = endpoint.connection_name() {
            properties = properties.with_connection_name(LongString::from(name.to_string()));
        }

        let dsn = endpoint.dsn();
        let connection = LapinConnection::connect(dsn.unsecure(), properties)
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;

        let session = LapinSession {
            identifier: Arc::from(endpoint.identifier()),
            connection,
            closed: Latch::new(),
        };

        let closed = session.closed.clone();
        let identifier = Arc::clone(&session.identifier);
        session.connection.on_error(move |error| {
            warn!(
                identifier = identifier.as_ref(),
                ?error,
                error_message = %error,
                "The AMQP connection reported an error",
            );
            closed.release(TransportError::ConnectionLost(error.to_string()));
        });

        Ok(Arc::new(session))
    }
}

struct LapinSession {
    identifier: Arc<str>,
    connection: LapinConnection,
    closed: Latch<TransportError>,
}

#[async_trait]
impl Session for LapinSession {
    fn closed(&self) -> Gate<TransportError> {
        self.closed.gate()
    }

    async fn open_channel(&self) -> Result<Arc<dyn RawChannel>, TransportError> {
        let session = self.closed.gate();

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|error| map_error(error, &session))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|error| map_error(error, &session))?;

        let raw = LapinRawChannel {
            channel,
            session,
            closed: Latch::new(),
        };
        raw.spawn_watcher();

        Ok(Arc::new(raw))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self.connection.close(0, "Closed by the client").await;
        self.closed.release(TransportError::ConnectionLost(
            "closed by the client".to_string(),
        ));

        match result {
            Ok(()) => Ok(()),
            Err(LapinError::InvalidConnectionState(_)) => Err(TransportError::ConnectionLost(
                "the connection is already closed".to_string(),
            )),
            Err(error) => Err(TransportError::ConnectionLost(error.to_string())),
        }
    }
}

struct LapinRawChannel {
    channel: LapinChannel,
    session: Gate<TransportError>,
    closed: Latch<TransportError>,
}

impl LapinRawChannel {
    /// Closes this channel once the owning session is gone.
    fn spawn_watcher(&self) {
        let session = self.session.clone();
        let closed = self.closed.clone();
        let channel_closed = self.closed.gate();

        tokio::spawn(async move {
            select! {
                biased;
                _ = channel_closed.opened() => {}
                error = session.opened() => {
                    closed.release(error);
                }
            }
        });
    }

    /// Maps the given error, closing this channel if the error means so.
    fn fail(&self, error: LapinError) -> TransportError {
        let error = map_error(error, &self.session);
        self.closed.release(error.clone());

        error
    }

    fn check<T>(&self, result: Result<T, LapinError>) -> Result<T, TransportError> {
        result.map_err(|error| self.fail(error))
    }
}

#[async_trait]
impl RawChannel for LapinRawChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn closed(&self) -> Gate<TransportError> {
        self.closed.gate()
    }

    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        let result = self
            .channel
            .exchange_declare(
                spec.name(),
                lapin_kind(spec.kind()),
                ExchangeDeclareOptions {
                    passive: spec.passive(),
                    durable: spec.durable(),
                    auto_delete: spec.auto_delete(),
                    internal: spec.internal(),
                    nowait: false,
                },
                to_field_table(spec.arguments()),
            )
            .await;

        self.check(result)
    }

    async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), TransportError> {
        let result = self
            .channel
            .exchange_delete(
                name,
                ExchangeDeleteOptions {
                    if_unused,
                    nowait: false,
                },
            )
            .await;

        self.check(result)
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError> {
        let result = self
            .channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions { nowait: false },
                to_field_table(arguments),
            )
            .await;

        self.check(result)
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError> {
        let result = self
            .channel
            .exchange_unbind(
                destination,
                source,
                routing_key,
                ExchangeUnbindOptions { nowait: false },
                to_field_table(arguments),
            )
            .await;

        self.check(result)
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueDeclared, TransportError> {
        let result = self
            .channel
            .queue_declare(
                spec.name(),
                QueueDeclareOptions {
                    passive: spec.passive(),
                    durable: spec.durable(),
                    exclusive: spec.exclusive(),
                    auto_delete: spec.auto_delete(),
                    nowait: false,
                },
                to_field_table(spec.arguments()),
            )
            .await;
        let queue = self.check(result)?;

        Ok(QueueDeclared {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError> {
        let result = self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                to_field_table(arguments),
            )
            .await;

        self.check(result)
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError> {
        let result = self
            .channel
            .queue_unbind(queue, exchange, routing_key, to_field_table(arguments))
            .await;

        self.check(result)
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, TransportError> {
        let result = self
            .channel
            .queue_purge(queue, QueuePurgeOptions { nowait: false })
            .await;

        self.check(result)
    }

    async fn queue_delete(
        &self,
        queue: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, TransportError> {
        let result = self
            .channel
            .queue_delete(
                queue,
                QueueDeleteOptions {
                    if_unused,
                    if_empty,
                    nowait: false,
                },
            )
            .await;

        self.check(result)
    }

    async fn basic_qos(&self, qos: &Qos) -> Result<(), TransportError> {
        // Prefetch size is not supported by lapin, nor by RabbitMQ
        if qos.prefetch_size != 0 {
            debug!(
                prefetch_size = qos.prefetch_size,
                "Ignoring the unsupported prefetch size",
            );
        }

        let result = self
            .channel
            .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
            .await;

        self.check(result)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        mandatory: bool,
        immediate: bool,
    ) -> Result<Confirmation, TransportError> {
        let result = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate,
                },
                message.body(),
                to_amqp_properties(message.properties()),
            )
            .await;
        let future_confirm = self.check(result)?;

        let confirmation = self.check(future_confirm.await)?;

        Ok(match confirmation {
            LapinConfirm::NotRequested => Confirmation::NotRequested,
            LapinConfirm::Ack(None) => Confirmation::Ack,
            LapinConfirm::Ack(Some(returned)) => {
                Confirmation::Returned(Box::new(to_returned(*returned)))
            }
            LapinConfirm::Nack(_) => Confirmation::Nack,
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
        sink: DeliverySink,
    ) -> Result<String, TransportError> {
        let result = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                to_field_table(&options.arguments),
            )
            .await;
        let mut consumer = self.check(result)?;
        let tag = consumer.tag().as_str().to_string();

        let closed = self.closed.gate();
        tokio::spawn(async move {
            loop {
                let next = select! {
                    biased;
                    _ = closed.opened() => break,
                    next = consumer.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        // Subscriber is gone: unacked deliveries are requeued
                        // by the broker once the channel closes
                        if sink.send(to_raw_delivery(delivery, None)).is_err() {
                            break;
                        }
                    }
                    Some(Err(error)) => {
                        debug!(
                            ?error,
                            error_message = %error,
                            "Stopped forwarding deliveries of a failed consumer",
                        );
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let result = self
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await;

        self.check(result)
    }

    async fn basic_get(
        &self,
        queue: &str,
        no_ack: bool,
    ) -> Result<Option<RawDelivery>, TransportError> {
        let result = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack })
            .await;
        let message = self.check(result)?;

        Ok(message.map(|message| {
            let message_count = message.message_count;
            to_raw_delivery(message.delivery, Some(message_count))
        }))
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError> {
        let result = self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await;

        self.check(result)
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let result = self
            .channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await;

        self.check(result)
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        let result = self
            .channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await;

        self.check(result)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self.channel.close(200, "Closed by the client").await;
        self.closed.release(TransportError::ChannelClosed(CloseReason::new(
            200,
            "closed by the client",
        )));

        match result {
            Ok(()) => Ok(()),
            // Already closed
            Err(LapinError::InvalidChannelState(_)) => Ok(()),
            Err(error) => Err(map_error(error, &self.session)),
        }
    }
}

impl Debug for LapinRawChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LapinRawChannel")
            .field("id", &self.channel.id())
            .field("closed", &self.closed.is_released())
            .finish()
    }
}

/// Soft protocol errors close only the channel; everything else means the
/// whole connection is gone.
fn map_error(error: LapinError, session: &Gate<TransportError>) -> TransportError {
    if let Some(error) = session.value() {
        return error;
    }

    match error {
        LapinError::ProtocolError(error) => match error.kind() {
            AMQPErrorKind::Soft(_) => TransportError::ChannelClosed(CloseReason::new(
                error.get_id(),
                error.get_message().as_str(),
            )),
            AMQPErrorKind::Hard(_) => TransportError::ConnectionLost(error.to_string()),
        },
        LapinError::InvalidChannelState(state) => TransportError::ChannelClosed(
            CloseReason::new(504, format!("channel is not usable: {:?}", state)),
        ),
        error => TransportError::ConnectionLost(error.to_string()),
    }
}

fn lapin_kind(kind: &ExchangeKind) -> LapinExchangeKind {
    match kind {
        ExchangeKind::Direct => LapinExchangeKind::Direct,
        ExchangeKind::Fanout => LapinExchangeKind::Fanout,
        ExchangeKind::Headers => LapinExchangeKind::Headers,
        ExchangeKind::Topic => LapinExchangeKind::Topic,
        ExchangeKind::Custom(name) => LapinExchangeKind::Custom(name.clone()),
    }
}

fn to_field_table(arguments: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();

    for (key, value) in arguments.iter() {
        table.insert(ShortString::from(key.to_string()), to_amqp_value(value));
    }

    table
}

/// Integers are sent in the narrowest of the two sizes that brokers match on.
fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Boolean(value) => AMQPValue::Boolean(*value),
        Value::Int(value) => match i32::try_from(*value) {
            Ok(value) => AMQPValue::LongInt(value),
            Err(_) => AMQPValue::LongLongInt(*value),
        },
        Value::String(value) => AMQPValue::LongString(LongString::from(value.clone())),
    }
}

fn from_field_table(table: &FieldTable) -> Arguments {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| Some((key.as_str().to_string(), from_amqp_value(value)?)))
        .collect()
}

/// Values without a counterpart (arrays, nested tables, floats) are skipped.
fn from_amqp_value(value: &AMQPValue) -> Option<Value> {
    Some(match value {
        AMQPValue::Boolean(value) => Value::Boolean(*value),
        AMQPValue::ShortShortInt(value) => Value::Int(i64::from(*value)),
        AMQPValue::ShortShortUInt(value) => Value::Int(i64::from(*value)),
        AMQPValue::ShortInt(value) => Value::Int(i64::from(*value)),
        AMQPValue::ShortUInt(value) => Value::Int(i64::from(*value)),
        AMQPValue::LongInt(value) => Value::Int(i64::from(*value)),
        AMQPValue::LongUInt(value) => Value::Int(i64::from(*value)),
        AMQPValue::LongLongInt(value) => Value::Int(*value),
        AMQPValue::Timestamp(value) => Value::Int(i64::try_from(*value).ok()?),
        AMQPValue::ShortString(value) => Value::String(value.as_str().to_string()),
        AMQPValue::LongString(value) => {
            Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        _ => return None,
    })
}

fn short(value: &Option<String>) -> Option<ShortString> {
    value.as_ref().map(|value| ShortString::from(value.clone()))
}

fn to_amqp_properties(properties: &Properties) -> AMQPProperties {
    let mut amqp = AMQPProperties::default();

    if let Some(value) = short(&properties.content_type) {
        amqp = amqp.with_content_type(value);
    }
    if let Some(value) = short(&properties.content_encoding) {
        amqp = amqp.with_content_encoding(value);
    }
    if !properties.headers.is_empty() {
        amqp = amqp.with_headers(to_field_table(&properties.headers));
    }
    if let Some(value) = properties.delivery_mode {
        amqp = amqp.with_delivery_mode(value.amqp_value());
    }
    if let Some(value) = properties.priority {
        amqp = amqp.with_priority(value);
    }
    if let Some(value) = short(&properties.correlation_id) {
        amqp = amqp.with_correlation_id(value);
    }
    if let Some(value) = short(&properties.reply_to) {
        amqp = amqp.with_reply_to(value);
    }
    if let Some(value) = short(&properties.expiration) {
        amqp = amqp.with_expiration(value);
    }
    if let Some(value) = short(&properties.message_id) {
        amqp = amqp.with_message_id(value);
    }
    if let Some(value) = properties.timestamp {
        amqp = amqp.with_timestamp(value);
    }
    #[allow(deprecated)]
    if let Some(value) = short(&properties.kind) {
        amqp = amqp.with_kind(value);
    }
    if let Some(value) = short(&properties.user_id) {
        amqp = amqp.with_user_id(value);
    }
    if let Some(value) = short(&properties.app_id) {
        amqp = amqp.with_app_id(value);
    }

    amqp
}

fn from_amqp_properties(amqp: &AMQPProperties) -> Properties {
    let string = |value: &Option<ShortString>| value.as_ref().map(|value| value.as_str().to_string());

    Properties {
        content_type: string(amqp.content_type()),
        content_encoding: string(amqp.content_encoding()),
        headers: amqp
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
        delivery_mode: amqp.delivery_mode().map(DeliveryMode::from),
        priority: *amqp.priority(),
        correlation_id: string(amqp.correlation_id()),
        reply_to: string(amqp.reply_to()),
        expiration: string(amqp.expiration()),
        message_id: string(amqp.message_id()),
        timestamp: *amqp.timestamp(),
        kind: string(amqp.kind()),
        user_id: string(amqp.user_id()),
        app_id: string(amqp.app_id()),
    }
}

fn to_raw_delivery(delivery: Delivery, message_count: Option<u32>) -> RawDelivery {
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        message_count,
        properties: from_amqp_properties(&delivery.properties),
        body: delivery.data,
    }
}

fn to_returned(returned: BasicReturnMessage) -> ReturnedMessage {
    ReturnedMessage::new(
        returned.reply_code,
        returned.reply_text.as_str().to_string(),
        returned.delivery.exchange.as_str().to_string(),
        returned.delivery.routing_key.as_str().to_string(),
        from_amqp_properties(&returned.delivery.properties),
        returned.delivery.data,
    )
}
