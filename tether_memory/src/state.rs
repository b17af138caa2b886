use crate::routing::{headers_match, topic_matches};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tether_amqp::engine::{Confirmation, DeliverySink, QueueDeclared, RawDelivery, TransportError};
use tether_amqp::{
    Arguments, CloseReason, ConsumeOptions, DeliveryMode, EXCHANGE_AMQ_DIRECT,
    EXCHANGE_AMQ_FANOUT, EXCHANGE_AMQ_HEADERS, EXCHANGE_AMQ_MATCH, EXCHANGE_AMQ_TOPIC,
    EXCHANGE_DEFAULT, ExchangeKind, ExchangeSpec, Message, Properties, Qos, QueueSpec,
    ReturnedMessage,
};
use tether_sync::Latch;

/// Identifies a channel by its session and channel number.
pub(crate) type ChannelKey = (u64, u16);

/// Every entity known to the broker.
pub(crate) struct State {
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    sessions: HashMap<u64, Latch<TransportError>>,
    channels: HashMap<ChannelKey, ChannelEntry>,
    counter: u64,
}

struct ExchangeEntry {
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
    internal: bool,
    arguments: Arguments,
    bindings: Vec<BindingEntry>,
    was_bound: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingEntry {
    destination: Destination,
    routing_key: String,
    arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Destination {
    Exchange(String),
    Queue(String),
}

struct QueueEntry {
    durable: bool,
    owner: Option<u64>,
    auto_delete: bool,
    arguments: Arguments,
    messages: VecDeque<Stored>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
    was_consumed: bool,
}

#[derive(Debug, Clone)]
struct Stored {
    /// Publish order, by which requeued messages regain their position.
    sequence: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: Properties,
    body: Vec<u8>,
}

struct ConsumerEntry {
    channel: ChannelKey,
    tag: String,
    no_ack: bool,
    sink: DeliverySink,
}

struct ChannelEntry {
    closed: Latch<TransportError>,
    qos: Option<Qos>,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    consumers: BTreeMap<String, String>,
}

struct Unacked {
    queue: String,
    message: Stored,
}

fn reason(code: u16, text: impl Into<String>) -> CloseReason {
    CloseReason::new(code, text)
}

fn not_found(kind: &str, name: &str) -> CloseReason {
    reason(CloseReason::NOT_FOUND, format!("NOT_FOUND - no {} '{}'", kind, name))
}

fn inequivalent(kind: &str, name: &str) -> CloseReason {
    reason(
        CloseReason::PRECONDITION_FAILED,
        format!("PRECONDITION_FAILED - inequivalent arg for {} '{}'", kind, name),
    )
}

impl State {
    pub(crate) fn new() -> Self {
        let mut exchanges = HashMap::new();

        for (name, kind) in [
            (EXCHANGE_AMQ_DIRECT, ExchangeKind::Direct),
            (EXCHANGE_AMQ_FANOUT, ExchangeKind::Fanout),
            (EXCHANGE_AMQ_TOPIC, ExchangeKind::Topic),
            (EXCHANGE_AMQ_HEADERS, ExchangeKind::Headers),
            (EXCHANGE_AMQ_MATCH, ExchangeKind::Headers),
        ] {
            exchanges.insert(
                name.to_string(),
                ExchangeEntry {
                    kind,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    arguments: Arguments::new(),
                    bindings: Vec::new(),
                    was_bound: false,
                },
            );
        }

        Self {
            exchanges,
            queues: HashMap::new(),
            sessions: HashMap::new(),
            channels: HashMap::new(),
            counter: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }
}

impl State {
    pub(crate) fn open_session(&mut self, closed: Latch<TransportError>) -> u64 {
        let id = self.next_id();
        self.sessions.insert(id, closed);

        id
    }

    pub(crate) fn has_session(&self, session: u64) -> bool {
        self.sessions.contains_key(&session)
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn open_channel(&mut self, key: ChannelKey, closed: Latch<TransportError>) {
        self.channels.insert(
            key,
            ChannelEntry {
                closed,
                qos: None,
                next_delivery_tag: 1,
                unacked: BTreeMap::new(),
                consumers: BTreeMap::new(),
            },
        );
    }

    pub(crate) fn has_channel(&self, key: ChannelKey) -> bool {
        self.channels.contains_key(&key)
    }

    pub(crate) fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Closes the given channel: its unacknowledged messages go back to their
    /// queues, and its consumers are dropped.
    pub(crate) fn close_channel(&mut self, key: ChannelKey, error: TransportError) {
        let Some(channel) = self.channels.remove(&key) else {
            return;
        };
        channel.closed.release(error);

        let mut touched = BTreeSet::new();

        for (_, unacked) in channel.unacked {
            if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                queue.requeue(unacked.message);
                touched.insert(unacked.queue);
            }
        }

        for queue in channel.consumers.into_values() {
            touched.insert(queue);
        }
        for name in &touched {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.consumers.retain(|consumer| consumer.channel != key);
            }
        }

        for name in touched {
            if !self.delete_if_unused(&name) {
                self.dispatch(&name);
            }
        }
    }

    /// Closes the given session along with its channels and exclusive queues.
    /// Returns `false` if the session was already closed.
    pub(crate) fn close_session(&mut self, session: u64, error: TransportError) -> bool {
        let Some(closed) = self.sessions.remove(&session) else {
            return false;
        };

        let keys: Vec<ChannelKey> = self
            .channels
            .keys()
            .filter(|key| key.0 == session)
            .copied()
            .collect();
        for key in keys {
            self.close_channel(key, error.clone());
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(session))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.remove_queue(&name);
        }

        closed.release(error);

        true
    }

    pub(crate) fn session_ids(&self) -> Vec<u64> {
        self.sessions.keys().copied().collect()
    }

    /// Forgets everything that does not survive a restart: transient
    /// entities and transient messages.
    pub(crate) fn restart(&mut self) {
        self.exchanges.retain(|_, exchange| exchange.durable);

        let transient: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| !queue.durable)
            .map(|(name, _)| name.clone())
            .collect();
        for name in transient {
            self.remove_queue(&name);
        }

        let exchanges: BTreeSet<String> = self.exchanges.keys().cloned().collect();
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|binding| match &binding.destination {
                Destination::Exchange(name) => exchanges.contains(name),
                Destination::Queue(_) => true,
            });
        }

        for queue in self.queues.values_mut() {
            queue.messages.retain(|message| {
                message.properties.delivery_mode == Some(DeliveryMode::Durable)
            });
        }
    }
}

impl State {
    pub(crate) fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<(), CloseReason> {
        let name = spec.name();

        if let Some(existing) = self.exchanges.get(name) {
            if spec.passive() {
                return Ok(());
            }
            let equivalent = &existing.kind == spec.kind()
                && existing.durable == spec.durable()
                && existing.auto_delete == spec.auto_delete()
                && existing.internal == spec.internal()
                && &existing.arguments == spec.arguments();

            return if equivalent {
                Ok(())
            } else {
                Err(inequivalent("exchange", name))
            };
        }

        if spec.passive() {
            return Err(not_found("exchange", name));
        }
        if name == EXCHANGE_DEFAULT || name.starts_with("amq.") {
            return Err(reason(
                CloseReason::ACCESS_REFUSED,
                format!("ACCESS_REFUSED - exchange name '{}' is reserved", name),
            ));
        }

        self.exchanges.insert(
            name.to_string(),
            ExchangeEntry {
                kind: spec.kind().clone(),
                durable: spec.durable(),
                auto_delete: spec.auto_delete(),
                internal: spec.internal(),
                arguments: spec.arguments().clone(),
                bindings: Vec::new(),
                was_bound: false,
            },
        );

        Ok(())
    }

    pub(crate) fn delete_exchange(&mut self, name: &str, if_unused: bool) -> Result<(), CloseReason> {
        let Some(exchange) = self.exchanges.get(name) else {
            return Err(not_found("exchange", name));
        };
        if if_unused && !exchange.bindings.is_empty() {
            return Err(reason(
                CloseReason::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - exchange '{}' in use", name),
            ));
        }

        self.remove_exchange(name);

        Ok(())
    }

    fn remove_exchange(&mut self, name: &str) {
        self.exchanges.remove(name);

        let destination = Destination::Exchange(name.to_string());
        for exchange in self.exchanges.values_mut() {
            exchange
                .bindings
                .retain(|binding| binding.destination != destination);
        }
    }

    pub(crate) fn bind(
        &mut self,
        session: u64,
        source: &str,
        destination: Destination,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), CloseReason> {
        match &destination {
            Destination::Exchange(name) if !self.exchanges.contains_key(name) => {
                return Err(not_found("exchange", name));
            }
            Destination::Queue(name) => {
                self.accessible_queue(session, name)?;
            }
            _ => {}
        }
        let Some(exchange) = self.exchanges.get_mut(source) else {
            return Err(not_found("exchange", source));
        };

        let binding = BindingEntry {
            destination,
            routing_key: routing_key.to_string(),
            arguments: arguments.clone(),
        };
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
            exchange.was_bound = true;
        }

        Ok(())
    }

    pub(crate) fn unbind(
        &mut self,
        session: u64,
        source: &str,
        destination: Destination,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), CloseReason> {
        if let Destination::Queue(name) = &destination {
            self.accessible_queue(session, name)?;
        }
        let Some(exchange) = self.exchanges.get_mut(source) else {
            return Err(not_found("exchange", source));
        };

        let binding = BindingEntry {
            destination,
            routing_key: routing_key.to_string(),
            arguments: arguments.clone(),
        };
        exchange.bindings.retain(|existing| existing != &binding);

        if exchange.auto_delete && exchange.was_bound && exchange.bindings.is_empty() {
            self.remove_exchange(source);
        }

        Ok(())
    }
}

impl State {
    fn accessible_queue(&mut self, session: u64, name: &str) -> Result<&mut QueueEntry, CloseReason> {
        let Some(queue) = self.queues.get_mut(name) else {
            return Err(not_found("queue", name));
        };
        if queue.owner.is_some_and(|owner| owner != session) {
            return Err(reason(
                CloseReason::RESOURCE_LOCKED,
                format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    name,
                ),
            ));
        }

        Ok(queue)
    }

    pub(crate) fn declare_queue(
        &mut self,
        session: u64,
        spec: &QueueSpec,
    ) -> Result<QueueDeclared, CloseReason> {
        let name = if spec.name().is_empty() {
            format!("amq.gen-{}", self.next_id())
        } else {
            spec.name().to_string()
        };

        if self.queues.contains_key(&name) {
            let queue = self.accessible_queue(session, &name)?;
            let equivalent = spec.passive()
                || (queue.durable == spec.durable()
                    && queue.owner.is_some() == spec.exclusive()
                    && queue.auto_delete == spec.auto_delete()
                    && &queue.arguments == spec.arguments());
            if !equivalent {
                return Err(inequivalent("queue", &name));
            }

            return Ok(QueueDeclared {
                name,
                message_count: queue.messages.len() as u32,
                consumer_count: queue.consumers.len() as u32,
            });
        }

        if spec.passive() {
            return Err(not_found("queue", &name));
        }
        if !spec.name().is_empty() && name.starts_with("amq.") {
            return Err(reason(
                CloseReason::ACCESS_REFUSED,
                format!("ACCESS_REFUSED - queue name '{}' is reserved", name),
            ));
        }

        self.queues.insert(
            name.clone(),
            QueueEntry {
                durable: spec.durable(),
                owner: spec.exclusive().then_some(session),
                auto_delete: spec.auto_delete(),
                arguments: spec.arguments().clone(),
                messages: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
                was_consumed: false,
            },
        );

        Ok(QueueDeclared {
            name,
            message_count: 0,
            consumer_count: 0,
        })
    }

    pub(crate) fn purge_queue(&mut self, session: u64, name: &str) -> Result<u32, CloseReason> {
        let queue = self.accessible_queue(session, name)?;
        let purged = queue.messages.len() as u32;
        queue.messages.clear();

        Ok(purged)
    }

    pub(crate) fn delete_queue(
        &mut self,
        session: u64,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, CloseReason> {
        let queue = self.accessible_queue(session, name)?;
        if if_unused && !queue.consumers.is_empty() {
            return Err(reason(
                CloseReason::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - queue '{}' in use", name),
            ));
        }
        if if_empty && !queue.messages.is_empty() {
            return Err(reason(
                CloseReason::PRECONDITION_FAILED,
                format!("PRECONDITION_FAILED - queue '{}' not empty", name),
            ));
        }

        Ok(self.remove_queue(name))
    }

    /// Removes the given queue along with its bindings. Its consumers are
    /// dropped, which ends their subscriptions.
    fn remove_queue(&mut self, name: &str) -> u32 {
        let Some(queue) = self.queues.remove(name) else {
            return 0;
        };

        let destination = Destination::Queue(name.to_string());
        for exchange in self.exchanges.values_mut() {
            exchange
                .bindings
                .retain(|binding| binding.destination != destination);
        }
        for consumer in &queue.consumers {
            if let Some(channel) = self.channels.get_mut(&consumer.channel) {
                channel.consumers.remove(&consumer.tag);
            }
        }

        queue.messages.len() as u32
    }

    /// Deletes an auto-delete queue that lost its last consumer. Returns
    /// whether the queue was deleted.
    fn delete_if_unused(&mut self, name: &str) -> bool {
        let unused = self.queues.get(name).is_some_and(|queue| {
            queue.auto_delete && queue.was_consumed && queue.consumers.is_empty()
        });
        if unused {
            self.remove_queue(name);
        }

        unused
    }
}

impl State {
    pub(crate) fn set_qos(&mut self, key: ChannelKey, qos: &Qos) {
        let Some(channel) = self.channels.get_mut(&key) else {
            return;
        };
        channel.qos = Some(*qos);

        let queues: BTreeSet<String> = channel.consumers.values().cloned().collect();
        for queue in queues {
            self.dispatch(&queue);
        }
    }

    pub(crate) fn qos_of_channels(&self) -> Vec<Option<Qos>> {
        let mut keys: Vec<&ChannelKey> = self.channels.keys().collect();
        keys.sort();

        keys.into_iter()
            .filter_map(|key| self.channels.get(key))
            .map(|channel| channel.qos)
            .collect()
    }

    pub(crate) fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        mandatory: bool,
    ) -> Result<Confirmation, CloseReason> {
        if exchange != EXCHANGE_DEFAULT {
            let Some(entry) = self.exchanges.get(exchange) else {
                return Err(not_found("exchange", exchange));
            };
            if entry.internal {
                return Err(reason(
                    CloseReason::ACCESS_REFUSED,
                    format!(
                        "ACCESS_REFUSED - cannot publish to internal exchange '{}'",
                        exchange,
                    ),
                ));
            }
        }

        let queues = self.route(exchange, routing_key, &message.properties().headers);

        if queues.is_empty() {
            if mandatory {
                return Ok(Confirmation::Returned(Box::new(ReturnedMessage::new(
                    CloseReason::NO_ROUTE,
                    "NO_ROUTE",
                    exchange,
                    routing_key,
                    message.properties().clone(),
                    message.body().to_vec(),
                ))));
            }

            return Ok(Confirmation::Ack);
        }

        let sequence = self.next_id();
        for name in queues {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.messages.push_back(Stored {
                    sequence,
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                    properties: message.properties().clone(),
                    body: message.body().to_vec(),
                });
            }
            self.dispatch(&name);
        }

        Ok(Confirmation::Ack)
    }

    /// Collects the names of the queues that a message reaches, following
    /// exchange-to-exchange bindings.
    fn route(&self, exchange: &str, routing_key: &str, headers: &Arguments) -> BTreeSet<String> {
        let mut queues = BTreeSet::new();

        if exchange == EXCHANGE_DEFAULT {
            if self.queues.contains_key(routing_key) {
                queues.insert(routing_key.to_string());
            }

            return queues;
        }

        let mut visited = BTreeSet::new();
        let mut pending = vec![exchange.to_string()];

        while let Some(name) = pending.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(entry) = self.exchanges.get(&name) else {
                continue;
            };

            for binding in &entry.bindings {
                let matches = match &entry.kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                    ExchangeKind::Headers => headers_match(&binding.arguments, headers),
                    ExchangeKind::Direct | ExchangeKind::Custom(_) => {
                        binding.routing_key == routing_key
                    }
                };
                if !matches {
                    continue;
                }

                match &binding.destination {
                    Destination::Queue(queue) => {
                        queues.insert(queue.clone());
                    }
                    Destination::Exchange(next) => pending.push(next.clone()),
                }
            }
        }

        queues
    }

    pub(crate) fn consume(
        &mut self,
        key: ChannelKey,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
        sink: DeliverySink,
    ) -> Result<String, CloseReason> {
        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", self.next_id())
        } else {
            consumer_tag.to_string()
        };

        let in_use = self
            .channels
            .get(&key)
            .is_some_and(|channel| channel.consumers.contains_key(&tag));
        if in_use {
            return Err(reason(
                CloseReason::NOT_ALLOWED,
                format!("NOT_ALLOWED - attempt to reuse consumer tag '{}'", tag),
            ));
        }

        let entry = self.accessible_queue(key.0, queue)?;
        if options.exclusive && !entry.consumers.is_empty() {
            return Err(reason(
                CloseReason::ACCESS_REFUSED,
                format!("ACCESS_REFUSED - queue '{}' in exclusive use", queue),
            ));
        }
        entry.consumers.push(ConsumerEntry {
            channel: key,
            tag: tag.clone(),
            no_ack: options.no_ack,
            sink,
        });
        entry.was_consumed = true;

        if let Some(channel) = self.channels.get_mut(&key) {
            channel.consumers.insert(tag.clone(), queue.to_string());
        }
        self.dispatch(queue);

        Ok(tag)
    }

    /// Cancelling an unknown consumer tag is a no-op.
    pub(crate) fn cancel(&mut self, key: ChannelKey, consumer_tag: &str) {
        let Some(queue) = self
            .channels
            .get_mut(&key)
            .and_then(|channel| channel.consumers.remove(consumer_tag))
        else {
            return;
        };

        if let Some(entry) = self.queues.get_mut(&queue) {
            entry
                .consumers
                .retain(|consumer| !(consumer.channel == key && consumer.tag == consumer_tag));
        }
        self.delete_if_unused(&queue);
    }

    pub(crate) fn get(
        &mut self,
        key: ChannelKey,
        queue: &str,
        no_ack: bool,
    ) -> Result<Option<RawDelivery>, CloseReason> {
        let entry = self.accessible_queue(key.0, queue)?;
        let Some(message) = entry.messages.pop_front() else {
            return Ok(None);
        };
        let remaining = entry.messages.len() as u32;

        let Some(channel) = self.channels.get_mut(&key) else {
            return Ok(None);
        };
        let delivery_tag = channel.next_delivery_tag();
        let delivery = message.to_delivery(delivery_tag, Some(remaining));
        if !no_ack {
            channel.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue.to_string(),
                    message,
                },
            );
        }

        Ok(Some(delivery))
    }

    pub(crate) fn ack(
        &mut self,
        key: ChannelKey,
        delivery_tag: u64,
        multiple: bool,
    ) -> Result<(), CloseReason> {
        let settled = self.settle(key, delivery_tag, multiple)?;

        let queues: BTreeSet<String> = settled.into_iter().map(|unacked| unacked.queue).collect();
        for queue in queues {
            self.dispatch(&queue);
        }

        Ok(())
    }

    /// Rejects one message, or with `multiple`, every unacknowledged message
    /// up to the given tag.
    pub(crate) fn reject(
        &mut self,
        key: ChannelKey,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), CloseReason> {
        let settled = self.settle(key, delivery_tag, multiple)?;

        let mut touched = BTreeSet::new();
        for unacked in settled {
            if requeue {
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.requeue(unacked.message);
                }
            }
            touched.insert(unacked.queue);
        }
        for queue in touched {
            self.dispatch(&queue);
        }

        Ok(())
    }

    /// Removes the settled messages from the unacknowledged set of the given
    /// channel, in delivery order.
    fn settle(
        &mut self,
        key: ChannelKey,
        delivery_tag: u64,
        multiple: bool,
    ) -> Result<Vec<Unacked>, CloseReason> {
        let Some(channel) = self.channels.get_mut(&key) else {
            return Ok(Vec::new());
        };

        if !multiple {
            return match channel.unacked.remove(&delivery_tag) {
                Some(unacked) => Ok(vec![unacked]),
                None => Err(reason(
                    CloseReason::PRECONDITION_FAILED,
                    format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
                )),
            };
        }

        let remaining = channel.unacked.split_off(&(delivery_tag + 1));
        let settled = std::mem::replace(&mut channel.unacked, remaining);

        Ok(settled.into_values().collect())
    }

    /// Pushes ready messages to the consumers of the given queue, round-robin,
    /// respecting the prefetch limits of their channels.
    fn dispatch(&mut self, name: &str) {
        let Self {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        while !queue.messages.is_empty() && !queue.consumers.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&index| {
                    let consumer = &queue.consumers[index];
                    consumer.no_ack
                        || channels
                            .get(&consumer.channel)
                            .is_some_and(ChannelEntry::has_capacity)
                });
            let Some(index) = chosen else {
                return;
            };
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            let consumer = &queue.consumers[index];
            let Some(channel) = channels.get_mut(&consumer.channel) else {
                queue.messages.push_front(message);
                queue.consumers.remove(index);
                continue;
            };

            let delivery_tag = channel.next_delivery_tag();
            if consumer
                .sink
                .send(message.to_delivery(delivery_tag, None))
                .is_err()
            {
                // Subscriber is gone
                channel.consumers.remove(&consumer.tag);
                queue.messages.push_front(message);
                queue.consumers.remove(index);
                continue;
            }

            if !consumer.no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: name.to_string(),
                        message,
                    },
                );
            }
            queue.cursor = index + 1;
        }
    }
}

impl State {
    pub(crate) fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub(crate) fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    pub(crate) fn queue_len(&self, name: &str) -> Option<usize> {
        self.queues.get(name).map(|queue| queue.messages.len())
    }

    pub(crate) fn consumer_count(&self, name: &str) -> Option<usize> {
        self.queues.get(name).map(|queue| queue.consumers.len())
    }

    pub(crate) fn unacked_count(&self) -> usize {
        self.channels
            .values()
            .map(|channel| channel.unacked.len())
            .sum()
    }

    /// Reports the bindings into the given queue as `(exchange, routing key)`
    /// pairs, sorted.
    pub(crate) fn queue_bindings(&self, name: &str) -> Vec<(String, String)> {
        let destination = Destination::Queue(name.to_string());
        let mut bindings: Vec<(String, String)> = self
            .exchanges
            .iter()
            .flat_map(|(exchange, entry)| {
                entry
                    .bindings
                    .iter()
                    .filter(|binding| binding.destination == destination)
                    .map(move |binding| (exchange.clone(), binding.routing_key.clone()))
            })
            .collect();
        bindings.sort();

        bindings
    }

    pub(crate) fn channel_keys(&self) -> Vec<ChannelKey> {
        self.channels.keys().copied().collect()
    }
}

impl QueueEntry {
    /// Returns a message to its original position among the ready ones.
    fn requeue(&mut self, message: Stored) {
        let index = self
            .messages
            .iter()
            .position(|ready| ready.sequence > message.sequence)
            .unwrap_or(self.messages.len());

        self.messages.insert(
            index,
            Stored {
                redelivered: true,
                ..message
            },
        );
    }
}

impl ChannelEntry {
    fn has_capacity(&self) -> bool {
        match self.qos {
            Some(qos) if qos.prefetch_count > 0 => {
                self.unacked.len() < usize::from(qos.prefetch_count)
            }
            _ => true,
        }
    }

    fn next_delivery_tag(&mut self) -> u64 {
        let tag = self.next_delivery_tag;
        self.next_delivery_tag += 1;

        tag
    }
}

impl Stored {
    fn to_delivery(&self, delivery_tag: u64, message_count: Option<u32>) -> RawDelivery {
        RawDelivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            message_count,
            properties: self.properties.clone(),
            body: self.body.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    const SESSION: u64 = 1;
    const CHANNEL: ChannelKey = (1, 1);

    fn state() -> State {
        let mut state = State::new();
        let session = state.open_session(Latch::new());
        state.open_channel((session, 1), Latch::new());

        state
    }

    fn message(body: &str) -> Message {
        Message::from_byte_ref(body)
    }

    #[test]
    fn anonymous_queues_get_generated_names() {
        // Given
        let mut state = state();

        // When
        let first = state.declare_queue(SESSION, &QueueSpec::anonymous()).unwrap();
        let second = state.declare_queue(SESSION, &QueueSpec::anonymous()).unwrap();

        // Then
        assert!(first.name.starts_with("amq.gen-"));
        assert_ne!(first.name, second.name);
    }

    #[test]
    fn passive_declaration_of_missing_queue() {
        // Given
        let mut state = state();

        // When
        let result = state.declare_queue(SESSION, &QueueSpec::new("missing").with_passive(true));

        // Then
        assert_eq!(result.unwrap_err().code, CloseReason::NOT_FOUND);
    }

    #[test]
    fn inequivalent_redeclaration() {
        // Given
        let mut state = state();
        state
            .declare_queue(SESSION, &QueueSpec::new("jobs").with_durable(true))
            .unwrap();

        // When
        let result = state.declare_queue(SESSION, &QueueSpec::new("jobs"));

        // Then
        assert_eq!(result.unwrap_err().code, CloseReason::PRECONDITION_FAILED);
    }

    #[test]
    fn exclusive_queue_is_locked_to_its_session() {
        // Given
        let mut state = state();
        let other = state.open_session(Latch::new());
        state
            .declare_queue(SESSION, &QueueSpec::new("private").with_exclusive(true))
            .unwrap();

        // When
        let result = state.declare_queue(other, &QueueSpec::new("private").with_passive(true));

        // Then
        assert_eq!(result.unwrap_err().code, CloseReason::RESOURCE_LOCKED);
    }

    #[test]
    fn mandatory_unroutable_publish_is_returned() {
        // Given
        let mut state = state();

        // When
        let confirmation = state
            .publish(EXCHANGE_AMQ_DIRECT, "nowhere", &message("lost"), true)
            .unwrap();

        // Then
        match confirmation {
            Confirmation::Returned(returned) => assert_eq!(returned.reply_code(), CloseReason::NO_ROUTE),
            other => panic!("unexpected confirmation: {:?}", other),
        }
    }

    #[test]
    fn topic_routing_through_exchange_binding() {
        // Given
        let mut state = state();
        state
            .declare_exchange(&ExchangeSpec::new("events", ExchangeKind::Topic))
            .unwrap();
        state
            .declare_exchange(&ExchangeSpec::new("audit", ExchangeKind::Fanout))
            .unwrap();
        state.declare_queue(SESSION, &QueueSpec::new("log")).unwrap();
        state
            .bind(
                SESSION,
                "events",
                Destination::Exchange("audit".to_string()),
                "user.#",
                &Arguments::new(),
            )
            .unwrap();
        state
            .bind(
                SESSION,
                "audit",
                Destination::Queue("log".to_string()),
                "",
                &Arguments::new(),
            )
            .unwrap();

        // When
        state
            .publish("events", "user.created", &message("a"), false)
            .unwrap();
        state
            .publish("events", "order.created", &message("b"), false)
            .unwrap();

        // Then
        assert_eq!(state.queue_len("log"), Some(1));
    }

    #[test]
    fn prefetch_limits_dispatch() {
        // Given
        let mut state = state();
        let (sink, mut receiver) = mpsc::unbounded_channel();
        state.declare_queue(SESSION, &QueueSpec::new("work")).unwrap();
        state.set_qos(CHANNEL, &Qos::prefetch(1));
        for body in ["a", "b", "c"] {
            state.publish("", "work", &message(body), false).unwrap();
        }

        // When
        state
            .consume(CHANNEL, "work", "", &ConsumeOptions::default(), sink)
            .unwrap();

        // Then
        let first = receiver.try_recv().unwrap();
        assert!(receiver.try_recv().is_err());
        assert_eq!(first.body, b"a".to_vec());

        // When
        state.ack(CHANNEL, first.delivery_tag, false).unwrap();

        // Then
        assert_eq!(receiver.try_recv().unwrap().body, b"b".to_vec());
        assert_eq!(state.queue_len("work"), Some(1));
    }

    #[test]
    fn closing_channel_requeues_in_order() {
        // Given
        let mut state = state();
        state.declare_queue(SESSION, &QueueSpec::new("work")).unwrap();
        for body in ["a", "b"] {
            state.publish("", "work", &message(body), false).unwrap();
        }
        state.get(CHANNEL, "work", false).unwrap();
        state.get(CHANNEL, "work", false).unwrap();

        // When
        state.close_channel(
            CHANNEL,
            TransportError::ConnectionLost("gone".to_string()),
        );
        state.open_channel((SESSION, 2), Latch::new());
        let first = state.get((SESSION, 2), "work", true).unwrap().unwrap();

        // Then
        assert_eq!(first.body, b"a".to_vec());
        assert!(first.redelivered);
        assert_eq!(state.queue_len("work"), Some(1));
    }

    #[test]
    fn unknown_delivery_tag() {
        // Given
        let mut state = state();

        // When
        let result = state.ack(CHANNEL, 42, false);

        // Then
        assert_eq!(result.unwrap_err().code, CloseReason::PRECONDITION_FAILED);
    }

    #[test]
    fn rejected_messages_regain_their_position() {
        // Given
        let mut state = state();
        state.declare_queue(SESSION, &QueueSpec::new("work")).unwrap();
        for body in ["a", "b", "c"] {
            state.publish("", "work", &message(body), false).unwrap();
        }
        let a = state.get(CHANNEL, "work", false).unwrap().unwrap();
        let b = state.get(CHANNEL, "work", false).unwrap().unwrap();

        // When
        state.reject(CHANNEL, a.delivery_tag, false, true).unwrap();
        state.reject(CHANNEL, b.delivery_tag, false, true).unwrap();

        // Then
        let bodies: Vec<Vec<u8>> = (0..3)
            .filter_map(|_| state.get(CHANNEL, "work", true).unwrap())
            .map(|delivery| delivery.body)
            .collect();
        assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn closing_session_deletes_exclusive_queues() {
        // Given
        let mut state = state();
        state
            .declare_queue(SESSION, &QueueSpec::new("private").with_exclusive(true))
            .unwrap();

        // When
        state.close_session(SESSION, TransportError::ConnectionLost("gone".to_string()));

        // Then
        assert!(!state.has_queue("private"));
        assert!(!state.has_channel(CHANNEL));
    }

    #[test]
    fn restart_keeps_durable_messages_only() {
        // Given
        let mut state = state();
        state
            .declare_queue(SESSION, &QueueSpec::new("durable").with_durable(true))
            .unwrap();
        state.declare_queue(SESSION, &QueueSpec::new("transient")).unwrap();
        let persistent = Message::builder()
            .with_byte_ref("kept")
            .with_delivery_mode(DeliveryMode::Durable)
            .build();
        state.publish("", "durable", &persistent, false).unwrap();
        state.publish("", "durable", &message("dropped"), false).unwrap();

        // When
        state.restart();

        // Then
        assert_eq!(state.queue_len("durable"), Some(1));
        assert!(!state.has_queue("transient"));
    }
}
