use crate::channel::ChannelSource;
use crate::connection::{DiscardedSessions, close_session, compose_name, endpoint_at, establish};
use crate::engine::{Engine, RawChannel, Session, TransportError};
use crate::{ChannelOptions, ConnectionConfig, Error, Result, RobustChannel};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tether_sync::{Gate, Latch, Observer, ObserverHandle, Observers};
use tether_util::Backoff;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// The lifecycle state of a [`RobustConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Establishing the initial session.
    Connecting,
    /// A session is established.
    Connected,
    /// The session was lost; establishing a new one.
    Reconnecting,
    /// Closed for good.
    Closed,
}

/// Emitted to the reconnect observers of a [`RobustConnection`] once a lost
/// session is replaced and its channels are reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectEvent {
    generation: u64,
    attempts: usize,
}

impl ReconnectEvent {
    /// The generation of the new session. The initial session is generation
    /// `1`.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The number of attempts it took to reconnect.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

/// A connection that re-establishes itself whenever its session is lost, and
/// then reopens every [`RobustChannel`] opened on it, replaying their
/// topology.
///
/// Reconnect attempts are paced according to the
/// [configuration](ConnectionConfig::reconnect) and rotate through the
/// configured endpoints. Once the configured maximum number of attempts is
/// exhausted, the connection closes for good.
///
/// However many operations notice the loss at the same time, only one
/// reconnect runs.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct RobustConnection {
    inner: Arc<Inner>,
}

struct Inner {
    /// The globally unique name of this connection, for logging/debugging
    /// purposes.
    name: Arc<str>,
    engine: Arc<dyn Engine>,
    config: ConnectionConfig,
    current: SyncMutex<Option<Current>>,
    /// Incremented whenever a new session is installed.
    generation: AtomicU64,
    state: watch::Sender<ConnectionState>,
    /// Guards against concurrent reconnects.
    reconnecting: AtomicBool,
    channels: SyncMutex<Vec<RobustChannel>>,
    reconnect_observers: Observers<ReconnectEvent>,
    close_observers: Observers<Error>,
    /// Released exactly once, when this connection is closed for good.
    closed: Latch<Error>,
    backoff: Backoff,
    /// The endpoint of the next reconnect attempt.
    cursor: AtomicUsize,
    discarded: DiscardedSessions,
    weak: Weak<Inner>,
}

/// The current session.
struct Current {
    session: Arc<dyn Session>,
    identifier: Arc<str>,
    generation: u64,
}

impl RobustConnection {
    /// Connects to the first reachable endpoint of the given configuration,
    /// trying each of them once, in order. Fails right away if none is
    /// reachable: reconnecting only kicks in once connected.
    pub async fn connect(
        engine: Arc<dyn Engine>,
        config: impl Into<ConnectionConfig>,
    ) -> Result<Self> {
        let config = config.into();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let backoff = Backoff::new(config.reconnect());

        let inner = Arc::new_cyclic(|weak| Inner {
            name: compose_name("robust-connection"),
            engine,
            config,
            current: SyncMutex::new(None),
            generation: AtomicU64::new(0),
            state,
            reconnecting: AtomicBool::new(false),
            channels: SyncMutex::new(Vec::new()),
            reconnect_observers: Observers::new(),
            close_observers: Observers::new(),
            closed: Latch::new(),
            backoff,
            cursor: AtomicUsize::new(0),
            discarded: DiscardedSessions::default(),
            weak: weak.clone(),
        });

        let attempts = inner.config.endpoints().len();
        let (session, index) =
            establish(&inner.name, inner.engine.as_ref(), &inner.config, 0, attempts).await?;

        let Some(generation) = inner.install(session, index) else {
            return Err(Error::ConnectionClosed);
        };
        inner.state.send_replace(ConnectionState::Connected);
        inner.spawn_watcher(generation);

        Ok(Self { inner })
    }

    /// Reports the globally unique name of this connection.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Exposes the configuration of this connection.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Reports the current state of this connection.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribes to the state changes of this connection.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Reports the generation of the current session.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Reports whether this connection is closed for good.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_released()
    }

    /// Returns a gate that opens with the cause once this connection is
    /// closed for good.
    pub fn closed(&self) -> Gate<Error> {
        self.inner.closed.gate()
    }

    /// Waits until this connection is connected. Fails once it is closed for
    /// good.
    pub async fn ready(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let closed = self.inner.closed.gate();

        let connected = select! {
            biased;
            error = closed.opened() => return Err(error),
            result = state.wait_for(|state| {
                matches!(state, ConnectionState::Connected | ConnectionState::Closed)
            }) => matches!(result.as_deref(), Ok(ConnectionState::Connected)),
        };

        match connected {
            true => Ok(()),
            false => Err(closed.value().unwrap_or(Error::ConnectionClosed)),
        }
    }

    /// Opens a new robust channel, waiting for the connection if it is
    /// currently being re-established.
    pub async fn channel(&self, options: ChannelOptions) -> Result<RobustChannel> {
        self.ready().await?;

        let source: Weak<dyn ChannelSource> = self.inner.weak.clone();
        let channel = RobustChannel::new(source, options);
        self.inner.channels.lock().push(channel.clone());

        // Lost the race against a closure
        if let Some(error) = self.inner.closed.gate().value() {
            self.inner.forget_channel(channel.name());
            return Err(error);
        }

        match channel.reopen_if_stale().await {
            Ok(()) => {}
            Err(error) if error.is_link_loss() => {
                debug!(
                    name = self.name(),
                    channel = channel.name(),
                    "The channel will open once reconnected",
                );
            }
            Err(error) => {
                channel.close().await;
                return Err(error);
            }
        }

        Ok(channel)
    }

    /// Closes this connection along with all its channels, and stops
    /// reconnecting. Closing a closed connection is a no-op.
    pub async fn close(&self) {
        if !self.inner.closed.release(Error::ConnectionClosed) {
            return;
        }
        self.inner.state.send_replace(ConnectionState::Closed);

        let channels = std::mem::take(&mut *self.inner.channels.lock());
        for channel in channels {
            channel.close().await;
        }

        let current = self.inner.current.lock().take();
        if let Some(current) = current {
            close_session(&self.inner.name, &current.identifier, &current.session).await;
        }
        self.inner.discarded.drain().await;

        info!(name = self.name(), "Closed the robust connection");
        self.inner.close_observers.notify(&Error::ConnectionClosed);
    }

    /// Registers a closure notified whenever this connection reconnects.
    pub fn add_reconnect_observer<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&ReconnectEvent) + Send + Sync + 'static,
    {
        self.inner.reconnect_observers.add(observer)
    }

    /// Registers a reconnect observer without extending its lifetime. Once
    /// the last strong reference to it is dropped, it is no longer notified.
    pub fn add_weak_reconnect_observer(
        &self,
        observer: &Observer<ReconnectEvent>,
    ) -> ObserverHandle {
        self.inner.reconnect_observers.add_weak(observer)
    }

    /// Unregisters a reconnect observer.
    pub fn remove_reconnect_observer(&self, handle: ObserverHandle) -> bool {
        self.inner.reconnect_observers.remove(handle)
    }

    /// Registers a closure notified once this connection closes for good.
    pub fn add_close_observer<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.close_observers.add(observer)
    }

    /// Registers a close observer without extending its lifetime.
    pub fn add_weak_close_observer(&self, observer: &Observer<Error>) -> ObserverHandle {
        self.inner.close_observers.add_weak(observer)
    }

    /// Unregisters a close observer.
    pub fn remove_close_observer(&self, handle: ObserverHandle) -> bool {
        self.inner.close_observers.remove(handle)
    }
}

impl Inner {
    /// Makes the given session current. Returns its generation, or [`None`]
    /// if this connection has been closed in the meantime.
    fn install(&self, session: Arc<dyn Session>, index: usize) -> Option<u64> {
        let identifier: Arc<str> = Arc::from(endpoint_at(&self.config, index).identifier());
        let mut current = self.current.lock();

        if self.closed.is_released() {
            drop(current);
            self.discard_in_background(session, identifier);
            return None;
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.cursor.store(index, Ordering::Release);
        *current = Some(Current {
            session,
            identifier: Arc::clone(&identifier),
            generation,
        });

        info!(
            name = self.name.as_ref(),
            identifier = identifier.as_ref(),
            generation,
            "Connected to the AMQP broker",
        );

        Some(generation)
    }

    /// Reports a lost session once it closes.
    fn spawn_watcher(&self, generation: u64) {
        let Some(session) = self.current_session(generation) else {
            return;
        };
        let inner = self.weak.clone();
        let lost = session.closed();
        let closed = self.closed.gate();

        tokio::spawn(async move {
            let error = select! {
                biased;
                _ = closed.opened() => return,
                error = lost.opened() => error,
            };

            if let Some(inner) = inner.upgrade() {
                inner.lose(generation, &error.to_string());
            }
        });
    }

    fn current_session(&self, generation: u64) -> Option<Arc<dyn Session>> {
        self.current
            .lock()
            .as_ref()
            .filter(|current| current.generation == generation)
            .map(|current| Arc::clone(&current.session))
    }

    /// Handles losing the session of the given generation: detaches every
    /// channel and starts reconnecting, unless the loss is stale or a
    /// reconnect is already running.
    fn lose(&self, generation: u64, reason: &str) {
        if self.closed.is_released() || self.generation.load(Ordering::Acquire) != generation {
            return;
        }

        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        // Lost the race against a completed reconnect
        if self.generation.load(Ordering::Acquire) != generation {
            self.reconnecting.store(false, Ordering::Release);
            return;
        }

        let Some(inner) = self.weak.upgrade() else {
            self.reconnecting.store(false, Ordering::Release);
            return;
        };

        warn!(
            name = self.name.as_ref(),
            generation,
            reason,
            "Lost the connection to the AMQP broker; reconnecting",
        );

        self.state.send_replace(ConnectionState::Reconnecting);
        let lost = self
            .current
            .lock()
            .take_if(|current| current.generation == generation);
        for channel in self.channels() {
            channel.channel().core.detach(reason);
        }

        tokio::spawn(async move {
            if let Some(lost) = lost {
                inner
                    .discarded
                    .discard(Arc::clone(&inner.name), lost.identifier, lost.session)
                    .await;
            }

            inner.reconnect().await;
        });
    }

    async fn reconnect(self: Arc<Self>) {
        let reconnecting = scopeguard::guard(&self.reconnecting, |flag| {
            flag.store(false, Ordering::Release);
        });

        let closed = self.closed.gate();
        let outcome = select! {
            biased;
            _ = closed.opened() => None,
            outcome = self.reconnect_loop() => outcome,
        };
        let attempts = self.backoff.attempts();

        // Release the guard before watching the new session, so that losing
        // it right away triggers another reconnect
        drop(reconnecting);

        match outcome {
            Some(Ok(generation)) => {
                self.backoff.reset();
                self.state.send_replace(ConnectionState::Connected);
                self.reconnect_observers.notify(&ReconnectEvent {
                    generation,
                    attempts,
                });
                self.spawn_watcher(generation);
            }
            Some(Err(error)) => self.give_up(error),
            None => {}
        }
    }

    /// Repeatedly attempts to establish a new session, pacing attempts with
    /// the backoff. Once established, reopens every channel.
    async fn reconnect_loop(&self) -> Option<Result<u64>> {
        loop {
            if !self.backoff.sleep_next().await {
                return Some(Err(Error::Connection(format!(
                    "gave up reconnecting after {} attempts",
                    self.backoff.attempts(),
                ))));
            }

            let start = self.cursor.load(Ordering::Acquire) + 1;
            let established =
                establish(&self.name, self.engine.as_ref(), &self.config, start, 1).await;

            match established {
                Ok((session, index)) => {
                    let generation = self.install(session, index)?;
                    self.reopen_channels().await;

                    return Some(Ok(generation));
                }
                Err(_) => continue,
            }
        }
    }

    /// Reopens every channel, one by one. A failure of one channel does not
    /// affect the others.
    async fn reopen_channels(&self) {
        for channel in self.channels() {
            if let Err(error) = channel.reopen_if_stale().await {
                warn!(
                    name = self.name.as_ref(),
                    channel = channel.name(),
                    ?error,
                    error_message = %error,
                    "Failed to reopen a channel after reconnecting",
                );
            }
        }
    }

    /// Closes for good after exhausting the reconnect attempts.
    fn give_up(&self, error: Error) {
        if !self.closed.release(error.clone()) {
            return;
        }
        self.state.send_replace(ConnectionState::Closed);

        error!(
            name = self.name.as_ref(),
            ?error,
            error_message = %error,
            "Closing the robust connection for good",
        );

        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            channel.channel().core.terminate(error.clone());
        }

        self.close_observers.notify(&error);
    }

    fn channels(&self) -> Vec<RobustChannel> {
        self.channels.lock().clone()
    }

    fn forget_channel(&self, name: &str) {
        self.channels.lock().retain(|channel| channel.name() != name);
    }

    fn discard_in_background(&self, session: Arc<dyn Session>, identifier: Arc<str>) {
        let name = Arc::clone(&self.name);

        tokio::spawn(async move { close_session(&name, &identifier, &session).await });
    }
}

#[async_trait]
impl ChannelSource for Inner {
    fn name(&self) -> &str {
        &self.name
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    async fn open_raw(&self) -> Result<(Arc<dyn RawChannel>, u64)> {
        if let Some(error) = self.closed.gate().value() {
            return Err(error);
        }

        let current = self
            .current
            .lock()
            .as_ref()
            .map(|current| (Arc::clone(&current.session), current.generation));
        let Some((session, generation)) = current else {
            return Err(Error::Connection("not connected".to_string()));
        };

        match session.open_channel().await {
            Ok(raw) => Ok((raw, generation)),
            Err(error) => {
                if let TransportError::ConnectionLost(reason) = &error {
                    self.lose(generation, reason);
                }

                Err(Error::from(error))
            }
        }
    }

    fn link_lost(&self, generation: u64, reason: &str) {
        self.lose(generation, reason);
    }

    fn forget(&self, channel: &str) {
        self.forget_channel(channel);
    }
}

impl Debug for RobustConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobustConnection")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}
