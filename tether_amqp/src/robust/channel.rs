use crate::channel::{ChannelCore, ChannelSource};
use crate::engine::{RawChannel, TransportError};
use crate::robust::ledger::{Destination, Entry, Ledger};
use crate::{
    Channel, ChannelOptions, ChannelState, CloseEvent, Error, Exchange, ExchangeSpec,
    IncomingMessage, Qos, Queue, QueueSpec, Result, ReturnEvent,
};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_sync::{Gate, Observer, ObserverHandle, PendingCalls};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, error, info, warn};

/// Options of a declaration made through a [`RobustChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclareOptions {
    /// Whether the declared entity is restored after reconnects.
    pub robust: bool,
    /// Bounds the declaration, including any wait for a reconnect.
    pub timeout: Option<Duration>,
}

impl Default for DeclareOptions {
    fn default() -> Self {
        Self {
            robust: true,
            timeout: None,
        }
    }
}

impl DeclareOptions {
    /// Declares without restoring after reconnects.
    pub fn transient() -> Self {
        Self {
            robust: false,
            ..Self::default()
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

/// A channel that outlives its underlying channels.
///
/// Everything declared through a robust channel (exchanges, queues, bindings,
/// quality-of-service settings and consumers) is remembered and replayed, in
/// order, every time the channel is reopened: after a reconnect of the owning
/// [`RobustConnection`](crate::RobustConnection), or on an explicit
/// [`reopen`](RobustChannel::reopen).
///
/// While the channel is being reopened, operations wait instead of failing.
/// If the broker closes the channel, operations fail with
/// [`Error::ChannelClosed`] until the next reopen.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct RobustChannel {
    inner: Arc<Inner>,
}

struct Inner {
    channel: Channel,
    ledger: Arc<Ledger>,
    /// Serializes reopens.
    reopen_lock: AsyncMutex<()>,
}

impl RobustChannel {
    pub(crate) fn new(source: Weak<dyn ChannelSource>, options: ChannelOptions) -> Self {
        let ledger = Arc::new(Ledger::new());
        let core = ChannelCore::new(source, Some(Arc::clone(&ledger)), options);

        Self {
            inner: Arc::new(Inner {
                channel: Channel::from_core(core),
                ledger,
                reopen_lock: AsyncMutex::new(()),
            }),
        }
    }

    fn core(&self) -> &Arc<ChannelCore> {
        &self.inner.channel.core
    }

    /// Exposes the underlying [`Channel`] handle.
    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Reports the globally unique name of this channel.
    pub fn name(&self) -> &str {
        self.inner.channel.name()
    }

    /// Reports the current state of this channel.
    pub fn state(&self) -> ChannelState {
        self.inner.channel.state()
    }

    /// Subscribes to the state changes of this channel.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.inner.channel.subscribe()
    }

    /// Reports whether operations currently fail with
    /// [`Error::ChannelClosed`].
    pub fn is_closed(&self) -> bool {
        self.inner.channel.is_closed()
    }

    /// Returns a gate that opens with the cause once this channel is closed
    /// for good.
    pub fn closed(&self) -> Gate<Error> {
        self.inner.channel.closed()
    }

    /// Exposes the registry of pending calls bound to this channel.
    pub fn pending_calls(&self) -> &PendingCalls<IncomingMessage, Error> {
        self.inner.channel.pending_calls()
    }

    /// Returns the nameless, pre-declared direct exchange.
    pub fn default_exchange(&self) -> Exchange {
        self.inner.channel.default_exchange()
    }
}

impl RobustChannel {
    /// Declares an exchange, restoring it after reconnects unless declared
    /// [transient](DeclareOptions::transient).
    pub async fn declare_exchange(
        &self,
        spec: ExchangeSpec,
        options: DeclareOptions,
    ) -> Result<Exchange> {
        let exchange = Exchange::new(self.inner.channel.clone(), spec, options.robust);
        exchange.declare(options.timeout).await?;

        Ok(exchange)
    }

    /// Declares a queue, restoring it after reconnects unless declared
    /// [transient](DeclareOptions::transient).
    pub async fn declare_queue(&self, spec: QueueSpec, options: DeclareOptions) -> Result<Queue> {
        let queue = Queue::new(self.inner.channel.clone(), spec, options.robust);
        queue.declare(options.timeout).await?;

        Ok(queue)
    }

    /// Sets the quality-of-service settings, restoring them after reconnects.
    pub async fn set_qos(&self, qos: Qos, timeout: Option<Duration>) -> Result<()> {
        self.inner.channel.set_qos(qos, timeout).await
    }

    /// Deletes the named exchange, forgetting it and its bindings.
    pub async fn delete_exchange(
        &self,
        name: &str,
        if_unused: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.inner
            .channel
            .delete_exchange(name, if_unused, timeout)
            .await
    }

    /// Deletes the named queue, forgetting it along with its bindings and
    /// consumers.
    pub async fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
        timeout: Option<Duration>,
    ) -> Result<u32> {
        self.inner
            .channel
            .delete_queue(name, if_unused, if_empty, timeout)
            .await
    }

    /// Closes this channel for good. Closing a closed channel is a no-op.
    pub async fn close(&self) {
        self.inner.channel.close().await;
    }

    /// Registers a closure notified whenever this channel closes, whether for
    /// good or until the next reopen.
    pub fn add_close_observer<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&CloseEvent) + Send + Sync + 'static,
    {
        self.inner.channel.add_close_observer(observer)
    }

    /// Registers a close observer without extending its lifetime.
    pub fn add_weak_close_observer(&self, observer: &Observer<CloseEvent>) -> ObserverHandle {
        self.inner.channel.add_weak_close_observer(observer)
    }

    /// Unregisters a close observer.
    pub fn remove_close_observer(&self, handle: ObserverHandle) -> bool {
        self.inner.channel.remove_close_observer(handle)
    }

    /// Registers a closure notified whenever the broker returns a message
    /// published through this channel.
    pub fn add_return_observer<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&ReturnEvent) + Send + Sync + 'static,
    {
        self.inner.channel.add_return_observer(observer)
    }

    /// Registers a return observer without extending its lifetime.
    pub fn add_weak_return_observer(&self, observer: &Observer<ReturnEvent>) -> ObserverHandle {
        self.inner.channel.add_weak_return_observer(observer)
    }

    /// Unregisters a return observer.
    pub fn remove_return_observer(&self, handle: ObserverHandle) -> bool {
        self.inner.channel.remove_return_observer(handle)
    }
}

impl RobustChannel {
    /// Replaces the underlying channel with a fresh one and replays the
    /// remembered topology onto it.
    ///
    /// If the replay fails because the link died, the channel waits for the
    /// next reconnect. Any other replay failure closes the channel for good.
    pub async fn reopen(&self) -> Result<()> {
        let _guard = self.inner.reopen_lock.lock().await;

        self.reopen_locked().await
    }

    /// Reopens this channel unless it is already open on the session of the
    /// owner's current generation.
    pub(crate) async fn reopen_if_stale(&self) -> Result<()> {
        let _guard = self.inner.reopen_lock.lock().await;

        let generation = self.core().source()?.generation();
        if self.core().is_open_at(generation) {
            return Ok(());
        }

        self.reopen_locked().await
    }

    async fn reopen_locked(&self) -> Result<()> {
        let core = self.core();

        if let Some(error) = core.terminal_error() {
            return Err(error);
        }

        let source = core.source()?;
        let (raw, generation) = source.open_raw().await?;
        let Some(epoch) = core.install(Arc::clone(&raw), generation) else {
            return Err(core.terminal_error().unwrap_or(Error::ChannelClosed(None)));
        };

        match self.replay(&raw, epoch).await {
            Ok(()) => {
                core.mark_open(epoch);
                info!(
                    channel = self.name(),
                    connection = source.name(),
                    number = raw.id(),
                    generation,
                    "Opened the channel and restored its topology",
                );

                Ok(())
            }
            Err(TransportError::ChannelClosed(reason)) => {
                let error = Error::ChannelClosed(Some(reason));
                error!(
                    channel = self.name(),
                    ?error,
                    error_message = %error,
                    "Failed to restore the channel topology; closing the channel",
                );
                core.terminate(error.clone());

                Err(error)
            }
            Err(error) => {
                warn!(
                    channel = self.name(),
                    ?error,
                    error_message = %error,
                    "Lost the connection while restoring the channel topology",
                );
                core.raw_failed(epoch, error.clone());

                Err(Error::from(error))
            }
        }
    }

    /// Replays the remembered topology onto the given underlying channel.
    async fn replay(&self, raw: &Arc<dyn RawChannel>, epoch: u64) -> Result<(), TransportError> {
        let snapshot = self.inner.ledger.snapshot();

        for entry in &snapshot.topology {
            match entry {
                Entry::Exchange(spec) => raw.exchange_declare(spec).await?,
                Entry::Queue(queue) => {
                    let declared = raw.queue_declare(queue.spec()).await?;
                    if queue.name() != declared.name {
                        debug!(
                            channel = self.name(),
                            previous = %queue.name(),
                            current = declared.name.as_str(),
                            "The broker assigned a new name to a restored queue",
                        );
                    }
                    queue.rename(&declared.name);
                }
                Entry::Binding(binding) => match &binding.destination {
                    Destination::Exchange(destination) => {
                        raw.exchange_bind(
                            destination,
                            &binding.source,
                            &binding.routing_key(),
                            &binding.arguments,
                        )
                        .await?
                    }
                    Destination::Queue(queue) => {
                        raw.queue_bind(
                            &queue.name(),
                            &binding.source,
                            &binding.routing_key(),
                            &binding.arguments,
                        )
                        .await?
                    }
                },
                // Split off by the snapshot
                Entry::Consumer(_) => {}
            }
        }

        if let Some(qos) = &snapshot.qos {
            raw.basic_qos(qos).await?;
        }

        for record in snapshot.consumers {
            self.core()
                .resume_consumer(
                    raw,
                    epoch,
                    &record.queue.name(),
                    &record.tag,
                    &record.options,
                    record.handler,
                )
                .await?;
        }

        Ok(())
    }
}

impl PartialEq for RobustChannel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RobustChannel {}

impl Debug for RobustChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobustChannel")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("ledger", &self.inner.ledger)
            .finish()
    }
}
