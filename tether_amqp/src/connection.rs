use crate::channel::{ChannelCore, ChannelSource};
use crate::engine::{Engine, RawChannel, Session, TransportError};
use crate::{Channel, ChannelOptions, ConnectionConfig, Endpoint, Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex as SyncMutex;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tether_sync::{Gate, Latch, ObserverHandle, Observers};
use tokio::select;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A plain connection to a broker: a single session, not recovered once
/// lost.
///
/// Losing the session closes the connection and every channel opened on it
/// for good.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    /// The globally unique name of this connection, for logging/debugging
    /// purposes.
    name: Arc<str>,
    /// The identifier of the endpoint this connection is established to.
    identifier: Arc<str>,
    session: Arc<dyn Session>,
    channels: SyncMutex<Vec<Weak<ChannelCore>>>,
    /// Released exactly once, when this connection is closed for any reason.
    closed: Latch<Error>,
    close_observers: Observers<Error>,
    weak: Weak<Inner>,
}

impl Connection {
    /// Connects to the first reachable endpoint of the given configuration,
    /// trying each of them once, in order.
    pub async fn connect(
        engine: Arc<dyn Engine>,
        config: impl Into<ConnectionConfig>,
    ) -> Result<Self> {
        let config = config.into();
        let name = compose_name("connection");
        let attempts = config.endpoints().len();
        let (session, index) = establish(&name, engine.as_ref(), &config, 0, attempts).await?;
        let identifier = Arc::from(endpoint_at(&config, index).identifier());

        let inner = Arc::new_cyclic(|weak| Inner {
            name,
            identifier,
            session,
            channels: SyncMutex::new(Vec::new()),
            closed: Latch::new(),
            close_observers: Observers::new(),
            weak: weak.clone(),
        });
        inner.spawn_watcher();

        info!(
            name = inner.name.as_ref(),
            identifier = inner.identifier.as_ref(),
            "Connected to the AMQP broker",
        );

        Ok(Self { inner })
    }

    /// Reports the globally unique name of this connection.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Reports whether this connection is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_released()
    }

    /// Returns a gate that opens with the cause once this connection is
    /// closed.
    pub fn closed(&self) -> Gate<Error> {
        self.inner.closed.gate()
    }

    /// Opens a new channel.
    pub async fn channel(&self, options: ChannelOptions) -> Result<Channel> {
        if let Some(error) = self.inner.closed.gate().value() {
            return Err(error);
        }

        let source: Weak<dyn ChannelSource> = self.inner.weak.clone();
        let core = ChannelCore::new(source, None, options);
        let (raw, generation) = self.inner.open_raw().await?;

        self.inner.channels.lock().push(Arc::downgrade(&core));
        if let Some(epoch) = core.install(raw, generation) {
            core.mark_open(epoch);
        }

        // Lost the race against a closure
        if let Some(error) = self.inner.closed.gate().value() {
            core.terminate(error.clone());
            return Err(error);
        }

        Ok(Channel::from_core(core))
    }

    /// Closes this connection along with all its channels. Closing a closed
    /// connection is a no-op.
    pub async fn close(&self) {
        if !self.inner.closed.release(Error::ConnectionClosed) {
            return;
        }

        for core in self.inner.take_channels() {
            core.close().await;
        }

        close_session(&self.inner.name, &self.inner.identifier, &self.inner.session).await;
        self.inner.close_observers.notify(&Error::ConnectionClosed);
    }

    /// Registers a closure notified once this connection closes.
    pub fn add_close_observer<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.close_observers.add(observer)
    }

    /// Unregisters a close observer.
    pub fn remove_close_observer(&self, handle: ObserverHandle) -> bool {
        self.inner.close_observers.remove(handle)
    }
}

impl Inner {
    /// Closes everything once the session is lost.
    fn spawn_watcher(&self) {
        let inner = self.weak.clone();
        let lost = self.session.closed();
        let closed = self.closed.gate();

        tokio::spawn(async move {
            let error = select! {
                biased;
                _ = closed.opened() => return,
                error = lost.opened() => error,
            };

            if let Some(inner) = inner.upgrade() {
                inner.lose(&error.to_string());
            }
        });
    }

    fn lose(&self, reason: &str) {
        let error = Error::Connection(reason.to_string());
        if !self.closed.release(error.clone()) {
            return;
        }

        warn!(
            name = self.name.as_ref(),
            identifier = self.identifier.as_ref(),
            ?error,
            error_message = %error,
            "Lost the connection to the AMQP broker",
        );

        for core in self.take_channels() {
            core.terminate(error.clone());
        }

        self.close_observers.notify(&error);
    }

    fn take_channels(&self) -> Vec<Arc<ChannelCore>> {
        std::mem::take(&mut *self.channels.lock())
            .into_iter()
            .filter_map(|core| core.upgrade())
            .collect()
    }
}

#[async_trait]
impl ChannelSource for Inner {
    fn name(&self) -> &str {
        &self.name
    }

    fn generation(&self) -> u64 {
        0
    }

    async fn open_raw(&self) -> Result<(Arc<dyn RawChannel>, u64)> {
        match self.session.open_channel().await {
            Ok(raw) => Ok((raw, 0)),
            Err(error) => {
                if let TransportError::ConnectionLost(reason) = &error {
                    self.lose(reason);
                }

                Err(Error::from(error))
            }
        }
    }

    fn link_lost(&self, _generation: u64, reason: &str) {
        self.lose(reason);
    }

    fn forget(&self, channel: &str) {
        self.channels.lock().retain(|core| match core.upgrade() {
            Some(core) => core.name().as_ref() != channel,
            None => false,
        });
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("identifier", &self.inner.identifier)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Composes a human-readable name for a connection.
pub(crate) fn compose_name(kind: &str) -> Arc<str> {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    Arc::from(format!(
        "amqp:{}:{}",
        kind,
        COUNTER.fetch_add(1, Ordering::Relaxed),
    ))
}

pub(crate) fn endpoint_at(config: &ConnectionConfig, index: usize) -> &Endpoint {
    let endpoints = config.endpoints();

    endpoints
        .get(index % endpoints.len())
        .unwrap_or(&endpoints.head)
}

/// Makes up to `attempts` connection attempts, rotating through the endpoints
/// starting at the given index. Returns the session along with the index of
/// the endpoint it is established to.
pub(crate) async fn establish(
    name: &str,
    engine: &dyn Engine,
    config: &ConnectionConfig,
    start: usize,
    attempts: usize,
) -> Result<(Arc<dyn Session>, usize)> {
    let timeout = config.connection_timeout();
    let mut last_error = Error::Connection("no endpoint to connect to".to_string());

    for index in start..start + attempts {
        let endpoint = endpoint_at(config, index);

        let error = match tokio::time::timeout(timeout, engine.connect(endpoint)).await {
            Ok(Ok(session)) => return Ok((session, index % config.endpoints().len())),
            Ok(Err(error)) => Error::from(error),
            Err(_) => Error::Connection(format!("timed out after {:?}", timeout)),
        };

        warn!(
            name,
            identifier = endpoint.identifier(),
            ?error,
            error_message = %error,
            "Failed to establish an AMQP connection",
        );

        last_error = error;
    }

    Err(last_error)
}

/// Closes the given session, using the given name and identifier for logging
/// the outcome.
pub(crate) async fn close_session(name: &str, identifier: &str, session: &Arc<dyn Session>) {
    match session.close().await {
        Ok(()) => info!(name, identifier, "Closed an AMQP connection"),
        Err(TransportError::ConnectionLost(_)) => info!(
            name,
            identifier,
            "Discarded a previously lost AMQP connection",
        ),
        Err(error) => warn!(
            name,
            identifier,
            ?error,
            error_message = %error,
            "Failed to cleanly close an AMQP connection",
        ),
    }
}

/// Sessions being closed in the background.
#[derive(Default)]
pub(crate) struct DiscardedSessions {
    handles: AsyncMutex<FuturesUnordered<JoinHandle<()>>>,
    count: AtomicUsize,
}

impl DiscardedSessions {
    /// Sends the given session into the background to be closed. Every once in
    /// a while, this also drains the sessions discarded earlier, so they don't
    /// accumulate indefinitely.
    pub(crate) async fn discard(
        &self,
        name: Arc<str>,
        identifier: Arc<str>,
        session: Arc<dyn Session>,
    ) {
        let handle = tokio::spawn(async move {
            close_session(&name, &identifier, &session).await;
        });
        self.handles.lock().await.push(handle);

        const DISCARDED_COUNT_BETWEEN_CLEANUPS: usize = 10;
        let count = self.count.fetch_add(1, Ordering::Relaxed);
        if count % DISCARDED_COUNT_BETWEEN_CLEANUPS == 0 {
            self.drain().await;
        }
    }

    /// Waits for all discarded sessions to be closed.
    pub(crate) async fn drain(&self) {
        let mut handles = self.handles.lock().await;

        while handles.next().await.is_some() {}
    }
}
