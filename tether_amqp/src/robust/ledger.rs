use crate::topology::queue::QueueState;
use crate::{Arguments, ConsumeOptions, ExchangeSpec, MessageHandler, Qos};
use parking_lot::Mutex as SyncMutex;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Remembers everything declared through a robust channel, in declaration
/// order, so that it can be replayed onto a fresh underlying channel.
///
/// Exchanges, queues and bindings are replayed in the order they were first
/// recorded, followed by the quality-of-service settings, followed by the
/// consumers.
#[derive(Default)]
pub(crate) struct Ledger {
    entries: SyncMutex<Vec<Entry>>,
    qos: SyncMutex<Option<Qos>>,
}

#[derive(Clone)]
pub(crate) enum Entry {
    Exchange(Arc<ExchangeSpec>),
    Queue(Arc<QueueState>),
    Binding(Binding),
    Consumer(ConsumerRecord),
}

/// The target of a binding.
#[derive(Clone)]
pub(crate) enum Destination {
    Exchange(String),
    /// Followed by handle, since an anonymous queue is renamed on every
    /// declaration.
    Queue(Arc<QueueState>),
}

impl Destination {
    fn same_as(&self, other: &Destination) -> bool {
        match (self, other) {
            (Destination::Exchange(left), Destination::Exchange(right)) => left == right,
            (Destination::Queue(left), Destination::Queue(right)) => same_queue(left, right),
            _ => false,
        }
    }
}

#[derive(Clone)]
pub(crate) struct Binding {
    pub(crate) source: String,
    pub(crate) destination: Destination,
    /// Left out to follow the name of the destination queue, which changes
    /// whenever an anonymous queue is declared again.
    pub(crate) routing_key: Option<String>,
    pub(crate) arguments: Arguments,
}

impl Binding {
    /// The routing key as of now.
    pub(crate) fn routing_key(&self) -> String {
        match (&self.routing_key, &self.destination) {
            (Some(routing_key), _) => routing_key.clone(),
            (None, Destination::Queue(queue)) => queue.name(),
            (None, Destination::Exchange(_)) => String::new(),
        }
    }

    fn same_as(&self, other: &Binding) -> bool {
        self.source == other.source
            && self.routing_key() == other.routing_key()
            && self.arguments == other.arguments
            && self.destination.same_as(&other.destination)
    }
}

#[derive(Clone)]
pub(crate) struct ConsumerRecord {
    pub(crate) tag: Arc<str>,
    pub(crate) queue: Arc<QueueState>,
    pub(crate) options: ConsumeOptions,
    pub(crate) handler: Arc<dyn MessageHandler>,
}

/// Named queues are identified by name, anonymous ones by handle.
fn same_queue(left: &Arc<QueueState>, right: &Arc<QueueState>) -> bool {
    if Arc::ptr_eq(left, right) {
        return true;
    }

    !left.spec().is_anonymous()
        && !right.spec().is_anonymous()
        && left.spec().name() == right.spec().name()
}

impl Ledger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records an exchange declaration, replacing an earlier declaration of
    /// the same name in place.
    pub(crate) fn record_exchange(&self, spec: Arc<ExchangeSpec>) {
        let mut entries = self.entries.lock();

        let existing = entries.iter_mut().find(|entry| {
            matches!(entry, Entry::Exchange(recorded) if recorded.name() == spec.name())
        });

        match existing {
            Some(entry) => *entry = Entry::Exchange(spec),
            None => entries.push(Entry::Exchange(spec)),
        }
    }

    /// Records a queue declaration, replacing an earlier declaration of the
    /// same queue in place.
    pub(crate) fn record_queue(&self, queue: Arc<QueueState>) {
        let mut entries = self.entries.lock();

        let existing = entries
            .iter_mut()
            .find(|entry| matches!(entry, Entry::Queue(recorded) if same_queue(recorded, &queue)));

        match existing {
            Some(entry) => *entry = Entry::Queue(queue),
            None => entries.push(Entry::Queue(queue)),
        }
    }

    /// Records a binding, unless an identical one is already recorded.
    pub(crate) fn record_binding(&self, binding: Binding) {
        let mut entries = self.entries.lock();

        let exists = entries
            .iter()
            .any(|entry| matches!(entry, Entry::Binding(recorded) if recorded.same_as(&binding)));

        if !exists {
            entries.push(Entry::Binding(binding));
        }
    }

    /// Records a consumer, replacing an earlier consumer with the same tag.
    pub(crate) fn record_consumer(
        &self,
        tag: Arc<str>,
        queue: Arc<QueueState>,
        options: ConsumeOptions,
        handler: Arc<dyn MessageHandler>,
    ) {
        let record = ConsumerRecord {
            tag,
            queue,
            options,
            handler,
        };
        let mut entries = self.entries.lock();

        let existing = entries.iter_mut().find(
            |entry| matches!(entry, Entry::Consumer(recorded) if recorded.tag == record.tag),
        );

        match existing {
            Some(entry) => *entry = Entry::Consumer(record),
            None => entries.push(Entry::Consumer(record)),
        }
    }

    /// Records the latest quality-of-service settings.
    pub(crate) fn record_qos(&self, qos: Qos) {
        *self.qos.lock() = Some(qos);
    }

    /// Forgets an exchange along with every binding it takes part in.
    pub(crate) fn forget_exchange(&self, name: &str) {
        self.entries.lock().retain(|entry| match entry {
            Entry::Exchange(spec) => spec.name() != name,
            Entry::Binding(binding) => {
                binding.source != name
                    && !matches!(&binding.destination, Destination::Exchange(destination) if destination == name)
            }
            _ => true,
        });
    }

    /// Forgets a queue along with its bindings and consumers.
    pub(crate) fn forget_queue(&self, queue: &Arc<QueueState>) {
        self.entries.lock().retain(|entry| match entry {
            Entry::Queue(recorded) => !same_queue(recorded, queue),
            Entry::Binding(Binding {
                destination: Destination::Queue(recorded),
                ..
            }) => !same_queue(recorded, queue),
            Entry::Consumer(record) => !same_queue(&record.queue, queue),
            _ => true,
        });
    }

    /// Forgets every queue currently going by the given name, along with its
    /// bindings and consumers.
    pub(crate) fn forget_queue_named(&self, name: &str) {
        let queues = self
            .entries
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                Entry::Queue(queue) if queue.name() == name => Some(Arc::clone(queue)),
                _ => None,
            })
            .collect::<Vec<_>>();

        for queue in queues {
            self.forget_queue(&queue);
        }
    }

    /// Forgets a single binding.
    pub(crate) fn forget_binding(&self, binding: &Binding) {
        self.entries.lock().retain(
            |entry| !matches!(entry, Entry::Binding(recorded) if recorded.same_as(binding)),
        );
    }

    /// Forgets a consumer.
    pub(crate) fn forget_consumer(&self, tag: &str) {
        self.entries
            .lock()
            .retain(|entry| !matches!(entry, Entry::Consumer(record) if record.tag.as_ref() == tag));
    }

    /// Takes a consistent snapshot for replay: the topology entries in
    /// recording order, the quality-of-service settings, and the consumers.
    pub(crate) fn snapshot(&self) -> Snapshot {
        let entries = self.entries.lock();
        let qos = *self.qos.lock();

        let mut topology = Vec::with_capacity(entries.len());
        let mut consumers = Vec::new();
        for entry in entries.iter() {
            match entry {
                Entry::Consumer(record) => consumers.push(record.clone()),
                other => topology.push(other.clone()),
            }
        }

        Snapshot {
            topology,
            qos,
            consumers,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// The replay plan of a [`Ledger`].
pub(crate) struct Snapshot {
    pub(crate) topology: Vec<Entry>,
    pub(crate) qos: Option<Qos>,
    pub(crate) consumers: Vec<ConsumerRecord>,
}

impl Debug for Ledger {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("entries", &self.len())
            .field("qos", &*self.qos.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExchangeKind, IncomingMessage, QueueSpec};
    use pretty_assertions::assert_eq;

    fn exchange(name: &str) -> Arc<ExchangeSpec> {
        Arc::new(ExchangeSpec::new(name, ExchangeKind::Topic))
    }

    fn queue(name: &str) -> Arc<QueueState> {
        Arc::new(QueueState::new(QueueSpec::new(name)))
    }

    fn binding(source: &str, queue: &Arc<QueueState>, routing_key: &str) -> Binding {
        Binding {
            source: source.to_string(),
            destination: Destination::Queue(Arc::clone(queue)),
            routing_key: Some(routing_key.to_string()),
            arguments: Arguments::new(),
        }
    }

    fn handler() -> Arc<dyn MessageHandler> {
        Arc::new(|_message: IncomingMessage| async {})
    }

    fn describe(snapshot: &Snapshot) -> Vec<String> {
        let mut described = snapshot
            .topology
            .iter()
            .map(|entry| match entry {
                Entry::Exchange(spec) => format!("exchange {}", spec.name()),
                Entry::Queue(queue) => format!("queue {}", queue.name()),
                Entry::Binding(binding) => match &binding.destination {
                    Destination::Exchange(name) => {
                        format!("bind {} -> exchange {}", binding.source, name)
                    }
                    Destination::Queue(queue) => {
                        format!("bind {} -> queue {}", binding.source, queue.name())
                    }
                },
                Entry::Consumer(record) => format!("consumer {}", record.tag),
            })
            .collect::<Vec<_>>();

        if let Some(qos) = snapshot.qos {
            described.push(format!("qos {}", qos.prefetch_count));
        }
        for record in &snapshot.consumers {
            described.push(format!("consumer {} on {}", record.tag, record.queue.name()));
        }

        described
    }

    #[test]
    fn snapshot_orders_topology_then_qos_then_consumers() {
        // Given
        let ledger = Ledger::new();
        let tasks = queue("tasks");
        ledger.record_qos(Qos::prefetch(1));
        ledger.record_consumer(
            Arc::from("ctag-1"),
            Arc::clone(&tasks),
            ConsumeOptions::default(),
            handler(),
        );
        ledger.record_exchange(exchange("events"));
        ledger.record_queue(Arc::clone(&tasks));
        ledger.record_binding(binding("events", &tasks, "task.*"));

        // When
        let snapshot = ledger.snapshot();

        // Then
        assert_eq!(
            describe(&snapshot),
            vec![
                "exchange events",
                "queue tasks",
                "bind events -> queue tasks",
                "qos 1",
                "consumer ctag-1 on tasks",
            ],
        );
    }

    #[test]
    fn records_are_deduplicated() {
        // Given
        let ledger = Ledger::new();
        let tasks = queue("tasks");

        // When
        ledger.record_exchange(exchange("events"));
        ledger.record_exchange(Arc::new(
            ExchangeSpec::new("events", ExchangeKind::Topic).with_durable(true),
        ));
        ledger.record_queue(Arc::clone(&tasks));
        ledger.record_queue(queue("tasks"));
        ledger.record_binding(binding("events", &tasks, "a"));
        ledger.record_binding(binding("events", &tasks, "a"));
        ledger.record_binding(binding("events", &tasks, "b"));

        // Then
        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.topology.len(), 4);
        assert!(matches!(&snapshot.topology[0], Entry::Exchange(spec) if spec.durable()));
    }

    #[test]
    fn anonymous_queues_are_tracked_by_handle() {
        // Given
        let ledger = Ledger::new();
        let first = Arc::new(QueueState::new(QueueSpec::anonymous()));
        let second = Arc::new(QueueState::new(QueueSpec::anonymous()));

        // When
        ledger.record_queue(Arc::clone(&first));
        ledger.record_queue(Arc::clone(&second));
        ledger.record_queue(Arc::clone(&first));

        // Then
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn default_routing_key_follows_queue_name() {
        // Given
        let ledger = Ledger::new();
        let replies = Arc::new(QueueState::new(QueueSpec::anonymous()));
        replies.rename("amq.gen-1");
        ledger.record_queue(Arc::clone(&replies));
        ledger.record_binding(Binding {
            source: "amq.direct".to_string(),
            destination: Destination::Queue(Arc::clone(&replies)),
            routing_key: None,
            arguments: Arguments::new(),
        });

        // When
        replies.rename("amq.gen-2");

        // Then
        let snapshot = ledger.snapshot();
        let Entry::Binding(recorded) = &snapshot.topology[1] else {
            panic!("expected a binding");
        };
        assert_eq!(recorded.routing_key(), "amq.gen-2");

        // When
        ledger.forget_binding(&binding("amq.direct", &replies, "amq.gen-2"));

        // Then
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn forgetting_a_queue_cascades() {
        // Given
        let ledger = Ledger::new();
        let tasks = queue("tasks");
        let other = queue("other");
        ledger.record_exchange(exchange("events"));
        ledger.record_queue(Arc::clone(&tasks));
        ledger.record_queue(Arc::clone(&other));
        ledger.record_binding(binding("events", &tasks, "a"));
        ledger.record_binding(binding("events", &other, "a"));
        ledger.record_consumer(
            Arc::from("ctag-1"),
            Arc::clone(&tasks),
            ConsumeOptions::default(),
            handler(),
        );

        // When
        ledger.forget_queue(&tasks);

        // Then
        assert_eq!(
            describe(&ledger.snapshot()),
            vec!["exchange events", "queue other", "bind events -> queue other"],
        );
    }

    #[test]
    fn forgetting_an_exchange_cascades() {
        // Given
        let ledger = Ledger::new();
        let tasks = queue("tasks");
        ledger.record_exchange(exchange("events"));
        ledger.record_exchange(exchange("audit"));
        ledger.record_queue(Arc::clone(&tasks));
        ledger.record_binding(binding("events", &tasks, "a"));
        ledger.record_binding(Binding {
            source: "audit".to_string(),
            destination: Destination::Exchange("events".to_string()),
            routing_key: Some("#".to_string()),
            arguments: Arguments::new(),
        });

        // When
        ledger.forget_exchange("events");

        // Then
        assert_eq!(
            describe(&ledger.snapshot()),
            vec!["exchange audit", "queue tasks"],
        );
    }

    #[test]
    fn forgetting_a_consumer() {
        // Given
        let ledger = Ledger::new();
        let tasks = queue("tasks");
        for tag in ["ctag-1", "ctag-2"] {
            ledger.record_consumer(
                Arc::from(tag),
                Arc::clone(&tasks),
                ConsumeOptions::default(),
                handler(),
            );
        }

        // When
        ledger.forget_consumer("ctag-1");

        // Then
        assert_eq!(
            describe(&ledger.snapshot()),
            vec!["consumer ctag-2 on tasks"],
        );
    }
}
