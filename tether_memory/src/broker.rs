use crate::engine::MemoryEngine;
use crate::state::State;
use parking_lot::Mutex as SyncMutex;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tether_amqp::engine::{Engine, TransportError};
use tether_amqp::{CloseReason, Message, Qos, QueueSpec};
use tracing::debug;

/// An AMQP broker living entirely in the current process.
///
/// The broker keeps exchanges, queues, bindings and consumers the way a real
/// broker does, and sessions connect to it through its
/// [`engine`](MemoryBroker::engine). On top of that, it lets a test break
/// things on purpose: drop every connection, restart, refuse connections,
/// close channels from the broker side, or slow every call down.
///
/// Every call made by a client is counted by its AMQP method name, e.g.
/// `queue.declare` or `basic.publish`.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

pub(crate) struct BrokerInner {
    pub(crate) state: SyncMutex<State>,
    reachable: AtomicBool,
    refusals: AtomicUsize,
    connect_attempts: AtomicUsize,
    latency: SyncMutex<Option<Duration>>,
    calls: SyncMutex<BTreeMap<&'static str, usize>>,
}

impl Default for BrokerInner {
    fn default() -> Self {
        Self {
            state: SyncMutex::new(State::new()),
            reachable: AtomicBool::new(true),
            refusals: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
            latency: SyncMutex::new(None),
            calls: SyncMutex::new(BTreeMap::new()),
        }
    }
}

impl BrokerInner {
    /// Counts a connection attempt and decides whether it goes through.
    pub(crate) async fn admit(&self) -> Result<(), TransportError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(
                "the broker is unreachable".to_string(),
            ));
        }

        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .is_ok();
        if refused {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        Ok(())
    }

    /// Counts a call under the given method name and waits out the latency.
    pub(crate) async fn enter(&self, method: &'static str) {
        *self.calls.lock().entry(method).or_default() += 1;
        self.delay().await;
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl MemoryBroker {
    /// Creates an empty broker, with only the built-in exchanges declared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an engine that connects to this broker.
    pub fn engine(&self) -> Arc<dyn Engine> {
        Arc::new(MemoryEngine::new(Arc::clone(&self.inner)))
    }

    /// Drops every connection, as if the network failed. Unacknowledged
    /// messages return to their queues and exclusive queues are deleted.
    pub fn disconnect_all(&self) {
        let count = self.close_sessions("connection reset by the broker");

        debug!(count, "Dropped every in-memory connection");
    }

    /// Drops every connection and forgets everything transient: exchanges
    /// and queues not declared durable, and messages not published as
    /// durable.
    pub fn restart(&self) {
        self.close_sessions("broker restarted");
        self.inner.state.lock().restart();

        debug!("Restarted the in-memory broker");
    }

    fn close_sessions(&self, reason: &str) -> usize {
        let mut state = self.inner.state.lock();
        let error = TransportError::ConnectionLost(reason.to_string());

        state
            .session_ids()
            .into_iter()
            .filter(|session| state.close_session(*session, error.clone()))
            .count()
    }

    /// Closes every open channel from the broker side with the given reason,
    /// leaving the connections alive.
    pub fn close_channels(&self, code: u16, text: &str) {
        let mut state = self.inner.state.lock();
        let error = TransportError::ChannelClosed(CloseReason::new(code, text));

        for key in state.channel_keys() {
            state.close_channel(key, error.clone());
        }
    }

    /// Makes connection attempts fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_next(&self, count: usize) {
        self.inner.refusals.store(count, Ordering::SeqCst);
    }

    /// Delays every connection attempt and every call by the given duration.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock() = latency;
    }

    /// Declares a queue directly, as if by another client.
    pub fn declare_queue(&self, spec: &QueueSpec) -> Result<String, CloseReason> {
        let mut state = self.inner.state.lock();

        state.declare_queue(0, spec).map(|declared| declared.name)
    }

    /// Deletes a queue directly, as if by an operator.
    pub fn delete_queue(&self, name: &str) -> Result<u32, CloseReason> {
        self.inner.state.lock().delete_queue(0, name, false, false)
    }

    /// Publishes a message directly, as if by another client.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), CloseReason> {
        self.inner
            .state
            .lock()
            .publish(exchange, routing_key, message, false)
            .map(|_| ())
    }
}

impl MemoryBroker {
    /// Reports how many calls of the given AMQP method clients have made.
    pub fn calls(&self, method: &str) -> usize {
        self.inner
            .calls
            .lock()
            .get(method)
            .copied()
            .unwrap_or_default()
    }

    /// Reports how many calls clients have made in total.
    pub fn total_calls(&self) -> usize {
        self.inner.calls.lock().values().sum()
    }

    /// Forgets the counted calls.
    pub fn reset_calls(&self) {
        self.inner.calls.lock().clear();
    }

    /// Reports how many connection attempts clients have made, including the
    /// failed ones.
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Reports the number of open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().session_count()
    }

    /// Reports the number of open channels.
    pub fn channel_count(&self) -> usize {
        self.inner.state.lock().channel_count()
    }

    /// Reports whether the named queue exists.
    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.state.lock().has_queue(name)
    }

    /// Reports whether the named exchange exists.
    pub fn has_exchange(&self, name: &str) -> bool {
        self.inner.state.lock().has_exchange(name)
    }

    /// Reports the number of ready messages in the named queue.
    pub fn queue_len(&self, name: &str) -> Option<usize> {
        self.inner.state.lock().queue_len(name)
    }

    /// Reports the number of consumers of the named queue.
    pub fn consumer_count(&self, name: &str) -> Option<usize> {
        self.inner.state.lock().consumer_count(name)
    }

    /// Reports the number of delivered but not yet acknowledged messages,
    /// across all channels.
    pub fn unacked_count(&self) -> usize {
        self.inner.state.lock().unacked_count()
    }

    /// Reports the bindings into the named queue as sorted
    /// `(exchange, routing key)` pairs.
    pub fn queue_bindings(&self, name: &str) -> Vec<(String, String)> {
        self.inner.state.lock().queue_bindings(name)
    }

    /// Reports the quality-of-service settings of every open channel, in the
    /// order the channels were opened.
    pub fn channel_qos(&self) -> Vec<Option<Qos>> {
        self.inner.state.lock().qos_of_channels()
    }
}

impl Debug for MemoryBroker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("connections", &self.connection_count())
            .field("channels", &self.channel_count())
            .field("total_calls", &self.total_calls())
            .finish()
    }
}
