use crate::engine::{Confirmation, RawChannel, RawDelivery, TransportError};
use crate::robust::ledger::Ledger;
use crate::topology::queue::QueueState;
use crate::{
    CloseReason, ConsumeOptions, Error, Exchange, ExchangeSpec, IncomingMessage, Message,
    MessageHandler, PublishOptions, Queue, QueueSpec, Result, ReturnedMessage,
};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_sync::{Gate, Latch, Observer, ObserverHandle, Observers, PendingCalls};
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Quality-of-service settings of a channel: how many unacknowledged
/// deliveries the broker may push to its consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Qos {
    /// Maximum number of unacknowledged deliveries; `0` means unlimited.
    pub prefetch_count: u16,
    /// Maximum total size of unacknowledged deliveries in bytes; `0` means
    /// unlimited.
    pub prefetch_size: u32,
    /// Whether the limits apply to the whole connection instead of to each
    /// consumer.
    pub global: bool,
}

impl Qos {
    /// Limits the number of unacknowledged deliveries per consumer.
    pub fn prefetch(prefetch_count: u16) -> Self {
        Self {
            prefetch_count,
            ..Self::default()
        }
    }
}

/// Options of a newly opened channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Whether publishing a mandatory message that the broker returns as
    /// unroutable fails with [`Error::MessageReturned`]. Return observers are
    /// notified either way.
    pub on_return_raises: bool,
}

/// The lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Waiting for an underlying channel: operations wait.
    Opening,
    /// Operations go through.
    Open,
    /// Operations fail with [`Error::ChannelClosed`].
    Closed,
}

/// Emitted to the close observers of a channel.
#[derive(Debug, Clone)]
pub struct CloseEvent {
    channel: Channel,
    error: Option<Error>,
}

impl CloseEvent {
    /// The channel that has been closed.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The cause of the closure; [`None`] if it was closed explicitly.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
}

/// Emitted to the return observers of a channel.
#[derive(Debug, Clone)]
pub struct ReturnEvent {
    channel: Channel,
    message: ReturnedMessage,
}

impl ReturnEvent {
    /// The channel through which the message was published.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The returned message.
    pub fn message(&self) -> &ReturnedMessage {
        &self.message
    }
}

/// The owner of a channel, from which it obtains underlying channels.
#[async_trait]
pub(crate) trait ChannelSource: Send + Sync + 'static {
    /// The name of the owner, for logging.
    fn name(&self) -> &str;

    /// The generation of the current session.
    fn generation(&self) -> u64;

    /// Opens an underlying channel on the current session, reporting the
    /// session's generation.
    async fn open_raw(&self) -> Result<(Arc<dyn RawChannel>, u64)>;

    /// Reports that the session of the given generation appears dead.
    fn link_lost(&self, generation: u64, reason: &str);

    /// Forgets a channel that is closed for good.
    fn forget(&self, channel: &str);
}

/// A logical channel: the context in which exchanges and queues are declared,
/// messages published and consumers registered.
///
/// A channel obtained from a plain [`Connection`](crate::Connection) is closed
/// for good as soon as its underlying channel goes away. A channel owned by a
/// [`RobustChannel`](crate::RobustChannel) survives such losses: operations
/// wait until the channel is reopened.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    pub(crate) core: Arc<ChannelCore>,
}

pub(crate) struct ChannelCore {
    /// The globally unique name of this channel, for logging/debugging
    /// purposes.
    name: Arc<str>,
    /// The owner, from which underlying channels are obtained.
    source: Weak<dyn ChannelSource>,
    /// Records the topology for replay; present on robust channels only,
    /// which survive losing the underlying channel.
    ledger: Option<Arc<Ledger>>,
    robust: bool,
    options: ChannelOptions,
    link: SyncMutex<Link>,
    state: watch::Sender<ChannelState>,
    /// Released exactly once, when this channel is closed for good.
    terminated: Latch<Error>,
    close_observers: Observers<CloseEvent>,
    return_observers: Observers<ReturnEvent>,
    pending: PendingCalls<IncomingMessage, Error>,
    /// Delivery dispatchers by consumer tag.
    consumers: SyncMutex<HashMap<Arc<str>, Dispatcher>>,
}

/// The current underlying channel.
struct Link {
    raw: Option<Arc<dyn RawChannel>>,
    /// Incremented whenever a new underlying channel is installed.
    epoch: u64,
    /// The session generation of the current underlying channel.
    generation: u64,
    /// Why the broker closed the underlying channel, if it did.
    reason: Option<CloseReason>,
}

struct Dispatcher {
    epoch: u64,
    handle: JoinHandle<()>,
}

impl ChannelCore {
    pub(crate) fn new(
        source: Weak<dyn ChannelSource>,
        ledger: Option<Arc<Ledger>>,
        options: ChannelOptions,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ChannelState::Opening);
        let robust = ledger.is_some();

        Arc::new(Self {
            name: Self::compose_name(robust),
            source,
            ledger,
            robust,
            options,
            link: SyncMutex::new(Link {
                raw: None,
                epoch: 0,
                generation: 0,
                reason: None,
            }),
            state,
            terminated: Latch::new(),
            close_observers: Observers::new(),
            return_observers: Observers::new(),
            pending: PendingCalls::new(),
            consumers: SyncMutex::new(HashMap::new()),
        })
    }

    /// Composes a human-readable name for a channel.
    fn compose_name(robust: bool) -> Arc<str> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        Arc::from(format!(
            "amqp:{}:{}",
            if robust { "robust-channel" } else { "channel" },
            COUNTER.fetch_add(1, Ordering::Relaxed),
        ))
    }

    pub(crate) fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub(crate) fn ledger(&self) -> Option<&Arc<Ledger>> {
        self.ledger.as_ref()
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.link.lock().epoch
    }

    pub(crate) fn terminal_error(&self) -> Option<Error> {
        self.terminated.gate().value()
    }

    /// Waits until operations fail with a closed channel, whether for good or
    /// until the next reopen, and reports why.
    pub(crate) async fn until_closed(&self) -> Error {
        let mut state = self.state.subscribe();
        // The sender lives as long as this core
        let _ = state
            .wait_for(|state| *state == ChannelState::Closed)
            .await;

        match self.terminal_error() {
            Some(error) => error,
            None => Error::ChannelClosed(self.link.lock().reason.clone()),
        }
    }

    pub(crate) fn source(&self) -> Result<Arc<dyn ChannelSource>> {
        self.source.upgrade().ok_or(Error::ConnectionClosed)
    }

    /// Reports whether this channel is open on the session of the given
    /// generation.
    pub(crate) fn is_open_at(&self, generation: u64) -> bool {
        let link = self.link.lock();

        link.raw.is_some() && link.generation == generation && self.state() == ChannelState::Open
    }

    fn raw_id(&self) -> Option<u16> {
        self.link.lock().raw.as_ref().map(|raw| raw.id())
    }
}

impl ChannelCore {
    /// Installs a fresh underlying channel, keeping this channel in the
    /// [opening](ChannelState::Opening) state until [marked
    /// open](ChannelCore::mark_open). Returns the new epoch, or [`None`] if
    /// this channel is already closed for good.
    pub(crate) fn install(
        self: &Arc<Self>,
        raw: Arc<dyn RawChannel>,
        generation: u64,
    ) -> Option<u64> {
        let mut link = self.link.lock();

        if self.terminated.is_released() {
            drop(link);
            Self::discard_raw(self.name.clone(), raw);
            return None;
        }

        let previous = link.raw.replace(Arc::clone(&raw));
        link.epoch += 1;
        link.generation = generation;
        link.reason = None;
        let epoch = link.epoch;
        self.state.send_replace(ChannelState::Opening);
        drop(link);

        if let Some(previous) = previous {
            Self::discard_raw(self.name.clone(), previous);
        }

        self.spawn_monitor(&raw, epoch);

        Some(epoch)
    }

    /// Lets operations through the underlying channel of the given epoch.
    pub(crate) fn mark_open(&self, epoch: u64) -> bool {
        let link = self.link.lock();

        if link.epoch != epoch || link.raw.is_none() || self.terminated.is_released() {
            return false;
        }
        self.state.send_replace(ChannelState::Open);

        true
    }

    /// Drops the underlying channel because the session is gone. Operations
    /// wait for a reopen.
    pub(crate) fn detach(&self, reason: &str) {
        let mut link = self.link.lock();

        if self.terminated.is_released() || link.raw.is_none() {
            return;
        }
        link.raw = None;
        self.state.send_replace(ChannelState::Opening);
        drop(link);

        self.pending.fail_all(&Error::Connection(reason.to_string()));
    }

    /// Handles the loss of the underlying channel of the given epoch.
    pub(crate) fn raw_failed(self: &Arc<Self>, epoch: u64, error: TransportError) {
        let mut link = self.link.lock();

        // Stale or already handled
        if link.epoch != epoch || link.raw.is_none() || self.terminated.is_released() {
            return;
        }

        match error {
            TransportError::Connect(reason) | TransportError::ConnectionLost(reason) => {
                if !self.robust {
                    drop(link);
                    self.terminate(Error::Connection(reason));
                    return;
                }

                link.raw = None;
                let generation = link.generation;
                self.state.send_replace(ChannelState::Opening);
                drop(link);

                debug!(
                    channel = self.name.as_ref(),
                    reason = reason.as_str(),
                    "Lost the underlying channel along with the connection",
                );

                self.pending.fail_all(&Error::Connection(reason.clone()));

                if let Some(source) = self.source.upgrade() {
                    source.link_lost(generation, &reason);
                }
            }
            TransportError::ChannelClosed(reason) => {
                if !self.robust {
                    drop(link);
                    self.terminate(Error::ChannelClosed(Some(reason)));
                    return;
                }

                link.raw = None;
                link.reason = Some(reason.clone());
                self.state.send_replace(ChannelState::Closed);
                drop(link);

                let error = Error::ChannelClosed(Some(reason));
                warn!(
                    channel = self.name.as_ref(),
                    ?error,
                    error_message = %error,
                    "The broker closed the channel",
                );

                self.pending.fail_all(&error);
                self.close_observers.notify(&CloseEvent {
                    channel: Channel::from_core(Arc::clone(self)),
                    error: Some(error),
                });
            }
        }
    }

    /// Closes this channel for good because of the given error.
    pub(crate) fn terminate(self: &Arc<Self>, error: Error) -> bool {
        let Some(raw) = self.shut_down(error.clone()) else {
            return false;
        };

        warn!(
            channel = self.name.as_ref(),
            ?error,
            error_message = %error,
            "Channel closed for good",
        );

        if let Some(raw) = raw {
            Self::discard_raw(self.name.clone(), raw);
        }

        self.close_observers.notify(&CloseEvent {
            channel: Channel::from_core(Arc::clone(self)),
            error: Some(error),
        });
        self.forget();

        true
    }

    /// Closes this channel explicitly. Repeated closing is a no-op.
    pub(crate) async fn close(self: &Arc<Self>) {
        let Some(raw) = self.shut_down(Error::ChannelClosed(None)) else {
            return;
        };

        if let Some(raw) = raw {
            Self::close_raw(&self.name, raw).await;
        }

        info!(channel = self.name.as_ref(), "Closed the channel");

        self.close_observers.notify(&CloseEvent {
            channel: Channel::from_core(Arc::clone(self)),
            error: None,
        });
        self.forget();
    }

    /// Releases the terminal latch. Returns [`None`] if this channel was
    /// already closed for good, otherwise the underlying channel, if any.
    fn shut_down(&self, error: Error) -> Option<Option<Arc<dyn RawChannel>>> {
        let mut link = self.link.lock();

        if !self.terminated.release(error.clone()) {
            return None;
        }
        let raw = link.raw.take();
        self.state.send_replace(ChannelState::Closed);
        drop(link);

        self.pending.fail_all(&error);
        for (_, dispatcher) in self.consumers.lock().drain() {
            dispatcher.handle.abort();
        }

        Some(raw)
    }

    fn forget(&self) {
        if let Some(source) = self.source.upgrade() {
            source.forget(&self.name);
        }
    }

    /// Watches the given underlying channel until it closes.
    fn spawn_monitor(self: &Arc<Self>, raw: &Arc<dyn RawChannel>, epoch: u64) {
        let core = Arc::downgrade(self);
        let closed = raw.closed();
        let terminated = self.terminated.gate();

        tokio::spawn(async move {
            let error = select! {
                biased;
                _ = terminated.opened() => return,
                error = closed.opened() => error,
            };

            if let Some(core) = core.upgrade() {
                core.raw_failed(epoch, error);
            }
        });
    }

    fn discard_raw(name: Arc<str>, raw: Arc<dyn RawChannel>) {
        tokio::spawn(async move { Self::close_raw(&name, raw).await });
    }

    async fn close_raw(name: &str, raw: Arc<dyn RawChannel>) {
        match raw.close().await {
            Ok(()) => debug!(channel = name, "Closed an underlying channel"),
            // Already gone
            Err(TransportError::ChannelClosed(_) | TransportError::ConnectionLost(_)) => {}
            Err(error) => warn!(
                channel = name,
                ?error,
                error_message = %error,
                "Failed to cleanly close an underlying channel",
            ),
        }
    }
}

/// A consumer started by an operation, unless it was already running.
type Started = Option<(String, Arc<dyn RawChannel>, mpsc::UnboundedReceiver<RawDelivery>)>;

impl ChannelCore {
    /// Waits until this channel is open, then returns the underlying channel
    /// and its epoch.
    async fn acquire(&self) -> Result<(Arc<dyn RawChannel>, u64)> {
        let mut state = self.state.subscribe();
        let terminated = self.terminated.gate();

        loop {
            if let Some(error) = terminated.value() {
                return Err(error);
            }

            {
                let link = self.link.lock();
                match *state.borrow_and_update() {
                    ChannelState::Open => {
                        if let Some(raw) = &link.raw {
                            return Ok((Arc::clone(raw), link.epoch));
                        }
                    }
                    ChannelState::Closed => return Err(Error::ChannelClosed(link.reason.clone())),
                    ChannelState::Opening => {}
                }
            }

            select! {
                biased;
                _ = terminated.opened() => {}
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(Error::ChannelClosed(None));
                    }
                }
            }
        }
    }

    /// Runs the given operation against the underlying channel once this
    /// channel is open.
    ///
    /// On a robust channel, an operation that fails because the link died is
    /// retried once the channel is reopened. The timeout covers the waiting
    /// and all attempts.
    pub(crate) async fn call<T, F, Fut>(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        op: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn RawChannel>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.call_with_epoch(timeout, op)
            .await
            .map(|(value, _)| value)
    }

    /// Same as [`call`](ChannelCore::call), but also reports the epoch of the
    /// underlying channel on which the operation succeeded.
    pub(crate) async fn call_with_epoch<T, F, Fut>(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        op: F,
    ) -> Result<(T, u64)>
    where
        F: Fn(Arc<dyn RawChannel>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let attempts = async {
            loop {
                let (raw, epoch) = self.acquire().await?;

                match op(raw).await {
                    Ok(value) => return Ok((value, epoch)),
                    Err(error) => {
                        let retry =
                            self.robust && matches!(error, TransportError::ConnectionLost(_));
                        self.raw_failed(epoch, error.clone());
                        if !retry {
                            return Err(Error::from(error));
                        }
                    }
                }
            }
        };

        with_timeout(timeout, attempts).await
    }

    /// Runs an operation whose success must be remembered for replay, via the
    /// given `record` function.
    ///
    /// If the channel was reopened while the operation was in flight, the
    /// replay may have missed the record, so the operation is issued again on
    /// the fresh underlying channel.
    pub(crate) async fn call_recorded<T, F, Fut, R>(
        self: &Arc<Self>,
        timeout: Option<Duration>,
        op: F,
        record: R,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn RawChannel>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
        R: Fn(&T),
    {
        loop {
            let (value, epoch) = self.call_with_epoch(timeout, &op).await?;
            record(&value);

            if !self.robust || self.epoch() == epoch {
                return Ok(value);
            }

            debug!(
                channel = self.name.as_ref(),
                "Re-issuing an operation that raced with a reopen",
            );
        }
    }
}

impl ChannelCore {
    /// Publishes a message, mapping the broker's confirmation.
    pub(crate) async fn publish(
        self: &Arc<Self>,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        options: &PublishOptions,
    ) -> Result<()> {
        let confirmation = self
            .call(options.timeout, |raw| async move {
                raw.basic_publish(
                    exchange,
                    routing_key,
                    message,
                    options.mandatory,
                    options.immediate,
                )
                .await
            })
            .await?;

        match confirmation {
            Confirmation::Ack | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack => Err(Error::Nacked),
            Confirmation::Returned(message) => self.returned(*message),
        }
    }

    fn returned(self: &Arc<Self>, message: ReturnedMessage) -> Result<()> {
        debug!(
            channel = self.name.as_ref(),
            exchange = message.exchange(),
            routing_key = message.routing_key(),
            reply_code = message.reply_code(),
            "The broker returned a published message",
        );

        // A pending call awaiting a reply to this message will never get one
        if let Some(id) = message
            .properties()
            .correlation_id
            .as_deref()
            .and_then(|id| id.parse::<u64>().ok())
        {
            self.pending
                .fail(id, Error::MessageReturned(Box::new(message.clone())));
        }

        let error = self
            .options
            .on_return_raises
            .then(|| Error::MessageReturned(Box::new(message.clone())));

        self.return_observers.notify(&ReturnEvent {
            channel: Channel::from_core(Arc::clone(self)),
            message,
        });

        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Starts a consumer on the given queue, dispatching its deliveries to the
    /// given handler. The `record` function remembers a started consumer for
    /// replay.
    pub(crate) async fn consume<R>(
        self: &Arc<Self>,
        queue: &QueueState,
        tag: &str,
        options: &ConsumeOptions,
        handler: &Arc<dyn MessageHandler>,
        record: R,
    ) -> Result<Arc<str>>
    where
        R: Fn(&Arc<str>),
    {
        loop {
            let (started, epoch) = self
                .call_with_epoch(options.timeout, |raw| async move {
                    // Already started by a replay on this very channel
                    if !tag.is_empty() && self.consumer_epoch(tag) == Some(self.epoch()) {
                        return Ok::<Started, TransportError>(None);
                    }

                    let (sink, receiver) = mpsc::unbounded_channel();
                    let effective = raw
                        .basic_consume(&queue.name(), tag, options, sink)
                        .await?;

                    Ok(Some((effective, raw, receiver)))
                })
                .await?;

            let Some((effective, raw, receiver)) = started else {
                return Ok(Arc::from(tag));
            };

            let effective = Arc::<str>::from(effective);
            self.spawn_dispatcher(
                Arc::clone(&effective),
                epoch,
                raw,
                receiver,
                Arc::clone(handler),
                options.no_ack,
            );
            record(&effective);

            let current = self.epoch();
            if !self.robust || current == epoch || self.consumer_epoch(&effective) == Some(current)
            {
                return Ok(effective);
            }

            debug!(
                channel = self.name.as_ref(),
                consumer_tag = effective.as_ref(),
                "Re-issuing a consumer that raced with a reopen",
            );
        }
    }

    /// Restarts a remembered consumer on a freshly installed underlying
    /// channel, keeping its consumer tag.
    pub(crate) async fn resume_consumer(
        &self,
        raw: &Arc<dyn RawChannel>,
        epoch: u64,
        queue: &str,
        tag: &str,
        options: &ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), TransportError> {
        let (sink, receiver) = mpsc::unbounded_channel();
        let effective = raw.basic_consume(queue, tag, options, sink).await?;

        self.spawn_dispatcher(
            Arc::from(effective),
            epoch,
            Arc::clone(raw),
            receiver,
            handler,
            options.no_ack,
        );

        Ok(())
    }

    /// Cancels a consumer. Deliveries already received are still dispatched.
    pub(crate) async fn cancel(
        self: &Arc<Self>,
        tag: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.call(timeout, |raw| async move { raw.basic_cancel(tag).await })
            .await?;
        self.consumers.lock().remove(tag);

        Ok(())
    }

    /// The epoch at which the consumer with the given tag was started.
    pub(crate) fn consumer_epoch(&self, tag: &str) -> Option<u64> {
        self.consumers
            .lock()
            .get(tag)
            .map(|dispatcher| dispatcher.epoch)
    }

    /// Dispatches deliveries of a consumer to its handler, one at a time.
    fn spawn_dispatcher(
        &self,
        tag: Arc<str>,
        epoch: u64,
        raw: Arc<dyn RawChannel>,
        mut receiver: mpsc::UnboundedReceiver<RawDelivery>,
        handler: Arc<dyn MessageHandler>,
        no_ack: bool,
    ) {
        let channel = self.name.clone();
        let consumer_tag = Arc::clone(&tag);

        let handle = tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                let message = IncomingMessage::new(
                    delivery,
                    Some(Arc::clone(&consumer_tag)),
                    Arc::clone(&raw),
                    no_ack,
                );
                handler.handle(message).await;
            }

            debug!(
                channel = channel.as_ref(),
                consumer_tag = consumer_tag.as_ref(),
                "Consumer stopped receiving deliveries",
            );
        });

        let mut consumers = self.consumers.lock();
        if self.terminated.is_released() {
            handle.abort();
            return;
        }

        // A dispatcher of a previous epoch drains on its own: its sink is gone
        consumers.insert(tag, Dispatcher { epoch, handle });
    }
}

/// Bounds the given future by the optional timeout.
pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| Error::Timeout(timeout))?,
        None => future.await,
    }
}

impl Channel {
    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    /// Reports the globally unique name of this channel.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Reports the number of the current underlying channel, if any.
    pub fn number(&self) -> Option<u16> {
        self.core.raw_id()
    }

    /// Reports the current state of this channel.
    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    /// Subscribes to the state changes of this channel.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.core.state.subscribe()
    }

    /// Reports whether operations currently fail with
    /// [`Error::ChannelClosed`].
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Reports whether this channel survives losing its underlying channel.
    pub fn is_robust(&self) -> bool {
        self.core.robust
    }

    /// Returns a gate that opens with the cause once this channel is closed
    /// for good.
    pub fn closed(&self) -> Gate<Error> {
        self.core.terminated.gate()
    }

    /// Exposes the registry of pending calls bound to this channel. All of
    /// them fail once the channel closes, and a call whose id is carried as
    /// the correlation id of a returned message fails with
    /// [`Error::MessageReturned`].
    pub fn pending_calls(&self) -> &PendingCalls<IncomingMessage, Error> {
        &self.core.pending
    }

    /// Declares an exchange on this channel. On a robust channel, the
    /// exchange is restored after every reopen.
    pub async fn declare_exchange(
        &self,
        spec: ExchangeSpec,
        timeout: Option<Duration>,
    ) -> Result<Exchange> {
        let exchange = Exchange::new(self.clone(), spec, self.is_robust());
        exchange.declare(timeout).await?;

        Ok(exchange)
    }

    /// Declares a queue on this channel. On a robust channel, the queue is
    /// restored after every reopen.
    pub async fn declare_queue(&self, spec: QueueSpec, timeout: Option<Duration>) -> Result<Queue> {
        let queue = Queue::new(self.clone(), spec, self.is_robust());
        queue.declare(timeout).await?;

        Ok(queue)
    }

    /// Returns the nameless, pre-declared direct exchange, which routes
    /// messages to the queue named by the routing key.
    pub fn default_exchange(&self) -> Exchange {
        Exchange::new(self.clone(), ExchangeSpec::default_exchange(), false)
    }

    /// Sets the quality-of-service settings of this channel. On a robust
    /// channel, the settings are restored after every reopen.
    pub async fn set_qos(&self, qos: Qos, timeout: Option<Duration>) -> Result<()> {
        let qos = &qos;
        self.core
            .call_recorded(
                timeout,
                |raw| async move { raw.basic_qos(qos).await },
                |_| {
                    if let Some(ledger) = self.core.ledger() {
                        ledger.record_qos(*qos);
                    }
                },
            )
            .await
    }

    /// Deletes the named exchange, forgetting it and its bindings.
    pub async fn delete_exchange(
        &self,
        name: &str,
        if_unused: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.core
            .call(timeout, |raw| async move {
                raw.exchange_delete(name, if_unused).await
            })
            .await?;

        if let Some(ledger) = self.core.ledger() {
            ledger.forget_exchange(name);
        }

        Ok(())
    }

    /// Deletes the named queue, forgetting it along with its bindings and
    /// consumers. Returns the number of deleted messages.
    pub async fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
        timeout: Option<Duration>,
    ) -> Result<u32> {
        let deleted = self
            .core
            .call(timeout, |raw| async move {
                raw.queue_delete(name, if_unused, if_empty).await
            })
            .await?;

        if let Some(ledger) = self.core.ledger() {
            ledger.forget_queue_named(name);
        }

        Ok(deleted)
    }

    /// Closes this channel for good. Closing a closed channel is a no-op.
    pub async fn close(&self) {
        self.core.close().await;
    }

    /// Registers a closure notified whenever this channel closes.
    pub fn add_close_observer<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&CloseEvent) + Send + Sync + 'static,
    {
        self.core.close_observers.add(observer)
    }

    /// Registers a close observer without extending its lifetime.
    pub fn add_weak_close_observer(&self, observer: &Observer<CloseEvent>) -> ObserverHandle {
        self.core.close_observers.add_weak(observer)
    }

    /// Unregisters a close observer.
    pub fn remove_close_observer(&self, handle: ObserverHandle) -> bool {
        self.core.close_observers.remove(handle)
    }

    /// Registers a closure notified whenever the broker returns a message
    /// published through this channel.
    pub fn add_return_observer<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&ReturnEvent) + Send + Sync + 'static,
    {
        self.core.return_observers.add(observer)
    }

    /// Registers a return observer without extending its lifetime.
    pub fn add_weak_return_observer(&self, observer: &Observer<ReturnEvent>) -> ObserverHandle {
        self.core.return_observers.add_weak(observer)
    }

    /// Unregisters a return observer.
    pub fn remove_return_observer(&self, handle: ObserverHandle) -> bool {
        self.core.return_observers.remove(handle)
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Channel {}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.core.name)
            .field("state", &self.state())
            .field("robust", &self.core.robust)
            .finish()
    }
}
