use crate::channel::with_timeout;
use crate::engine::{QueueDeclared, RawChannel, RawDelivery};
use crate::robust::ledger::{Binding, Destination, Ledger};
use crate::{
    Arguments, Channel, Error, ExchangeRef, IncomingMessage, IteratorOptions, QueueIterator,
    Result, Value,
};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde::de::{IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Describes a queue: everything needed to declare it, and to declare it
/// again after a reconnect.
///
/// A queue with an empty name is **anonymous**: the broker assigns it a name
/// on every declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    name: String,
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    passive: bool,
    arguments: Arguments,
}

impl QueueSpec {
    /// Describes a non-durable queue with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Describes an exclusive, auto-deleted queue named by the broker.
    pub fn anonymous() -> Self {
        Self::new("").with_exclusive(true).with_auto_delete(true)
    }

    /// Re-creates this spec with the given durability.
    pub fn with_durable(self, durable: bool) -> Self {
        Self { durable, ..self }
    }

    /// Re-creates this spec with the given exclusivity. Exclusive queues are
    /// only accessible through the declaring connection.
    pub fn with_exclusive(self, exclusive: bool) -> Self {
        Self { exclusive, ..self }
    }

    /// Re-creates this spec with the given auto-deletion flag.
    pub fn with_auto_delete(self, auto_delete: bool) -> Self {
        Self {
            auto_delete,
            ..self
        }
    }

    /// Re-creates this spec with the given passive flag. A passive declaration
    /// only checks that the queue exists.
    pub fn with_passive(self, passive: bool) -> Self {
        Self { passive, ..self }
    }

    /// Re-creates this spec with the given declaration arguments.
    pub fn with_arguments(self, arguments: Arguments) -> Self {
        Self { arguments, ..self }
    }

    /// Re-creates this spec with the given declaration argument added.
    pub fn with_argument(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            arguments: self.arguments.with(key, value),
            ..self
        }
    }
}

impl QueueSpec {
    /// Reports the declared name; empty for anonymous queues.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports whether the queue is named by the broker.
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    /// Reports whether the queue survives a broker restart.
    pub fn durable(&self) -> bool {
        self.durable
    }

    /// Reports whether the queue is bound to the declaring connection.
    pub fn exclusive(&self) -> bool {
        self.exclusive
    }

    /// Reports whether the queue is deleted once its last consumer is gone.
    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    /// Reports whether declaring only checks for existence.
    pub fn passive(&self) -> bool {
        self.passive
    }

    /// Exposes the declaration arguments.
    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for QueueSpec {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(QueueSpecVisitor)
        }
    }

    struct QueueSpecVisitor;

    #[derive(Deserialize)]
    #[serde(field_identifier, rename_all = "snake_case")]
    enum QueueSpecField {
        Name,
        Durable,
        Exclusive,
        AutoDelete,
        Passive,
        #[serde(alias = "args")]
        Arguments,
        #[serde(other)]
        Ignore,
    }

    impl<'de> Visitor<'de> for QueueSpecVisitor {
        type Value = QueueSpec;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of queue declaration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut spec = QueueSpec::default();

            while let Some(key) = map.next_key::<QueueSpecField>()? {
                match key {
                    QueueSpecField::Name => spec.name = map.next_value()?,
                    QueueSpecField::Durable => spec.durable = map.next_value()?,
                    QueueSpecField::Exclusive => spec.exclusive = map.next_value()?,
                    QueueSpecField::AutoDelete => spec.auto_delete = map.next_value()?,
                    QueueSpecField::Passive => spec.passive = map.next_value()?,
                    QueueSpecField::Arguments => spec.arguments = map.next_value()?,
                    QueueSpecField::Ignore => {
                        map.next_value::<IgnoredAny>()?;
                    }
                }
            }

            Ok(spec)
        }
    }
};

/// Options of a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries are considered acknowledged as soon as they are sent.
    pub no_ack: bool,
    /// Asks for exclusive consumer access to the queue.
    pub exclusive: bool,
    /// Consumer arguments, e.g. `x-priority`.
    pub arguments: Arguments,
    /// The consumer tag to use. When absent, a robust channel generates one,
    /// and a plain channel lets the broker assign one.
    pub consumer_tag: Option<String>,
    /// Bounds starting the consumer, including any wait for a reconnect.
    pub timeout: Option<Duration>,
}

impl ConsumeOptions {
    /// Re-creates these options with the given `no_ack` mode.
    pub fn with_no_ack(self, no_ack: bool) -> Self {
        Self { no_ack, ..self }
    }

    /// Re-creates these options with the given exclusivity.
    pub fn with_exclusive(self, exclusive: bool) -> Self {
        Self { exclusive, ..self }
    }

    /// Re-creates these options with the given consumer arguments.
    pub fn with_arguments(self, arguments: Arguments) -> Self {
        Self { arguments, ..self }
    }

    /// Re-creates these options with the given consumer tag.
    pub fn with_consumer_tag(self, consumer_tag: impl Into<String>) -> Self {
        Self {
            consumer_tag: Some(consumer_tag.into()),
            ..self
        }
    }

    /// Re-creates these options with the given timeout.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }
}

/// Options of a single basic get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    /// The fetched message is considered acknowledged right away.
    pub no_ack: bool,
    /// Fail with [`Error::QueueEmpty`] instead of returning [`None`] when the
    /// queue is empty.
    pub fail_if_empty: bool,
    /// Bounds the fetch, including any wait for a reconnect.
    pub timeout: Option<Duration>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            no_ack: false,
            fail_if_empty: true,
            timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl GetOptions {
    /// Re-creates these options with the given `no_ack` mode.
    pub fn with_no_ack(self, no_ack: bool) -> Self {
        Self { no_ack, ..self }
    }

    /// Re-creates these options with the given `fail_if_empty` flag.
    pub fn with_fail_if_empty(self, fail_if_empty: bool) -> Self {
        Self {
            fail_if_empty,
            ..self
        }
    }

    /// Re-creates these options with the given timeout.
    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        Self { timeout, ..self }
    }
}

/// Options of a queue deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Only delete the queue if it has no consumers.
    pub if_unused: bool,
    /// Only delete the queue if it has no messages.
    pub if_empty: bool,
    /// Bounds the deletion, including any wait for a reconnect.
    pub timeout: Option<Duration>,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            if_unused: true,
            if_empty: true,
            timeout: None,
        }
    }
}

impl DeleteOptions {
    /// Deletes the queue regardless of its consumers and messages.
    pub fn unconditional() -> Self {
        Self {
            if_unused: false,
            if_empty: false,
            timeout: None,
        }
    }
}

/// Identifies a consumer on its channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag(Arc<str>);

impl ConsumerTag {
    /// Exposes the tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ConsumerTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConsumerTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Handles the messages delivered to a consumer. Deliveries of a consumer are
/// handled one at a time, in delivery order.
///
/// Any `Fn(IncomingMessage) -> impl Future<Output = ()>` closure is a handler.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles a single delivery. Unless consuming in `no_ack` mode, the
    /// handler is responsible for finalizing the message.
    async fn handle(&self, message: IncomingMessage);
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(IncomingMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: IncomingMessage) {
        self(message).await
    }
}

/// The shared state of a queue: its declaration and its current name, which
/// changes whenever an anonymous queue is redeclared.
pub(crate) struct QueueState {
    spec: QueueSpec,
    name: SyncMutex<String>,
    get_lock: AsyncMutex<()>,
}

impl QueueState {
    pub(crate) fn new(spec: QueueSpec) -> Self {
        let name = SyncMutex::new(spec.name.clone());

        Self {
            spec,
            name,
            get_lock: AsyncMutex::new(()),
        }
    }

    pub(crate) fn spec(&self) -> &QueueSpec {
        &self.spec
    }

    pub(crate) fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn rename(&self, name: &str) {
        let mut current = self.name.lock();
        if *current != name {
            *current = name.to_string();
        }
    }
}

impl Debug for QueueState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueState")
            .field("name", &*self.name.lock())
            .field("spec", &self.spec)
            .finish()
    }
}

/// A handle to a declared queue, bound to the channel that declared it.
///
/// Through a robust channel, the declaration, bindings and consumers made via
/// this handle are replayed after every reconnect, until the queue is
/// [deleted](Queue::delete).
#[derive(Clone)]
pub struct Queue {
    channel: Channel,
    state: Arc<QueueState>,
    ledger: Option<Arc<Ledger>>,
}

impl Queue {
    pub(crate) fn new(channel: Channel, spec: QueueSpec, robust: bool) -> Self {
        let ledger = match robust {
            true => channel.core.ledger().cloned(),
            false => None,
        };

        Self {
            channel,
            state: Arc::new(QueueState::new(spec)),
            ledger,
        }
    }

    /// Reports the current queue name. For anonymous queues, this is the name
    /// assigned by the broker on the latest declaration.
    pub fn name(&self) -> String {
        self.state.name()
    }

    /// Exposes the declaration of this queue.
    pub fn spec(&self) -> &QueueSpec {
        &self.state.spec
    }

    /// Exposes the channel that owns this handle.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Reports whether this queue is restored after reconnects.
    pub fn is_robust(&self) -> bool {
        self.ledger.is_some()
    }

    /// Creates a pull-style iterator over the messages of this queue.
    pub fn iterator(&self, options: IteratorOptions) -> QueueIterator {
        QueueIterator::new(self.clone(), options)
    }

    fn compose_consumer_tag(&self) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        format!(
            "{}.ctag-{}",
            self.channel.name(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
        )
    }

    fn binding_to(
        &self,
        exchange: &str,
        routing_key: Option<&str>,
        arguments: &Arguments,
    ) -> Binding {
        Binding {
            source: exchange.to_string(),
            destination: Destination::Queue(Arc::clone(&self.state)),
            routing_key: routing_key.map(str::to_string),
            arguments: arguments.clone(),
        }
    }
}

impl Queue {
    /// Declares this queue (again), returning the broker's answer.
    pub async fn declare(&self, timeout: Option<Duration>) -> Result<QueueDeclared> {
        let spec = &self.state.spec;

        self.channel
            .core
            .call_recorded(
                timeout,
                |raw| async move { raw.queue_declare(spec).await },
                |declared: &QueueDeclared| {
                    self.state.rename(&declared.name);
                    if let Some(ledger) = &self.ledger {
                        ledger.record_queue(Arc::clone(&self.state));
                    }
                },
            )
            .await
    }

    /// Binds this queue to the given exchange. The routing key defaults to the
    /// queue name.
    pub async fn bind(
        &self,
        exchange: impl Into<ExchangeRef>,
        routing_key: Option<&str>,
        arguments: Arguments,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let exchange = exchange.into();
        let (exchange, arguments) = (exchange.name(), &arguments);
        let state = self.state.as_ref();

        self.channel
            .core
            .call_recorded(
                timeout,
                |raw| async move {
                    let name = state.name();
                    let effective = routing_key.unwrap_or(name.as_str());
                    raw.queue_bind(&name, exchange, effective, arguments).await
                },
                |_| {
                    if let Some(ledger) = &self.ledger {
                        ledger.record_binding(self.binding_to(exchange, routing_key, arguments));
                    }
                },
            )
            .await
    }

    /// Unbinds this queue from the given exchange. The routing key defaults to
    /// the queue name.
    pub async fn unbind(
        &self,
        exchange: impl Into<ExchangeRef>,
        routing_key: Option<&str>,
        arguments: Arguments,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let exchange = exchange.into();
        let (exchange, arguments) = (exchange.name(), &arguments);
        let state = self.state.as_ref();

        self.channel
            .core
            .call(timeout, |raw| async move {
                let name = state.name();
                let effective = routing_key.unwrap_or(name.as_str());
                raw.queue_unbind(&name, exchange, effective, arguments).await
            })
            .await?;

        if let Some(ledger) = &self.ledger {
            ledger.forget_binding(&self.binding_to(exchange, routing_key, arguments));
        }

        Ok(())
    }

    /// Starts a consumer on this queue, handing every delivery to the given
    /// handler. Through a robust channel, the consumer is restarted with the
    /// same tag after every reconnect.
    pub async fn consume<H>(&self, handler: H, options: ConsumeOptions) -> Result<ConsumerTag>
    where
        H: MessageHandler,
    {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);
        let tag = match (&options.consumer_tag, &self.ledger) {
            (Some(tag), _) => tag.clone(),
            (None, Some(_)) => self.compose_consumer_tag(),
            (None, None) => String::new(),
        };

        let effective = self
            .channel
            .core
            .consume(&self.state, &tag, &options, &handler, |effective| {
                if let Some(ledger) = &self.ledger {
                    ledger.record_consumer(
                        Arc::clone(effective),
                        Arc::clone(&self.state),
                        options.clone(),
                        Arc::clone(&handler),
                    );
                }
            })
            .await?;

        Ok(ConsumerTag(effective))
    }

    /// Cancels the consumer with the given tag, which is no longer restarted
    /// after reconnects.
    pub async fn cancel(
        &self,
        consumer_tag: &ConsumerTag,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.channel
            .core
            .cancel(consumer_tag.as_str(), timeout)
            .await?;

        if let Some(ledger) = &self.ledger {
            ledger.forget_consumer(consumer_tag.as_str());
        }

        Ok(())
    }

    /// Fetches a single message from this queue. Concurrent fetches through
    /// the same handle are serialized.
    pub async fn get(&self, options: GetOptions) -> Result<Option<IncomingMessage>> {
        let state = self.state.as_ref();
        let no_ack = options.no_ack;

        let fetched = with_timeout(options.timeout, async {
            let _guard = state.get_lock.lock().await;

            self.channel
                .core
                .call(None, |raw| async move {
                    let fetched = raw.basic_get(&state.name(), no_ack).await;
                    fetched.map(|delivery| delivery.map(|delivery| (delivery, raw)))
                })
                .await
        })
        .await?;

        match fetched {
            Some((delivery, raw)) => Ok(Some(Self::attach(delivery, raw, no_ack))),
            None if options.fail_if_empty => Err(Error::QueueEmpty(state.name())),
            None => Ok(None),
        }
    }

    fn attach(delivery: RawDelivery, raw: Arc<dyn RawChannel>, no_ack: bool) -> IncomingMessage {
        IncomingMessage::new(delivery, None, raw, no_ack)
    }

    /// Removes all ready messages from this queue, returning their number.
    pub async fn purge(&self, timeout: Option<Duration>) -> Result<u32> {
        let state = self.state.as_ref();

        self.channel
            .core
            .call(timeout, |raw| async move {
                raw.queue_purge(&state.name()).await
            })
            .await
    }

    /// Deletes this queue, forgetting it along with its bindings and
    /// consumers. Returns the number of deleted messages.
    pub async fn delete(&self, options: DeleteOptions) -> Result<u32> {
        let state = self.state.as_ref();

        let deleted = self
            .channel
            .core
            .call(options.timeout, |raw| async move {
                raw.queue_delete(&state.name(), options.if_unused, options.if_empty)
                    .await
            })
            .await?;

        if let Some(ledger) = &self.ledger {
            ledger.forget_queue(&self.state);
        }

        Ok(deleted)
    }
}

impl Debug for Queue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name())
            .field("spec", &self.state.spec)
            .field("channel", &self.channel.name())
            .field("robust", &self.is_robust())
            .finish()
    }
}
