use crate::robust::ledger::{Binding, Destination, Ledger};
use crate::{Arguments, Channel, EXCHANGE_DEFAULT, Error, ExchangeKind, Message, Result, Value};
use serde::de::{IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Describes an exchange: everything needed to declare it, and to declare it
/// again after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSpec {
    name: String,
    kind: ExchangeKind,
    durable: bool,
    auto_delete: bool,
    internal: bool,
    passive: bool,
    arguments: Arguments,
}

impl ExchangeSpec {
    /// Describes a non-durable exchange of the given kind.
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
            internal: false,
            passive: false,
            arguments: Arguments::new(),
        }
    }

    /// Describes the nameless default exchange.
    pub(crate) fn default_exchange() -> Self {
        Self::new(EXCHANGE_DEFAULT, ExchangeKind::Direct).with_durable(true)
    }

    /// Re-creates this spec with the given durability.
    pub fn with_durable(self, durable: bool) -> Self {
        Self { durable, ..self }
    }

    /// Re-creates this spec with the given auto-deletion flag.
    pub fn with_auto_delete(self, auto_delete: bool) -> Self {
        Self {
            auto_delete,
            ..self
        }
    }

    /// Re-creates this spec with the given internal flag. Internal exchanges
    /// only receive messages from other exchanges.
    pub fn with_internal(self, internal: bool) -> Self {
        Self { internal, ..self }
    }

    /// Re-creates this spec with the given passive flag. A passive declaration
    /// only checks that the exchange exists.
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

impl ExchangeSpec {
    /// Reports the exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports the exchange kind.
    pub fn kind(&self) -> &ExchangeKind {
        &self.kind
    }

    /// Reports whether the exchange survives a broker restart.
    pub fn durable(&self) -> bool {
        self.durable
    }

    /// Reports whether the exchange is deleted once unused.
    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    /// Reports whether the exchange rejects messages published directly.
    pub fn internal(&self) -> bool {
        self.internal
    }

    /// Reports whether declaring only checks for existence.
    pub fn passive(&self) -> bool {
        self.passive
    }

    /// Exposes the declaration arguments.
    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    /// Reports whether this is the nameless default exchange.
    pub fn is_default(&self) -> bool {
        self.name == EXCHANGE_DEFAULT
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for ExchangeSpec {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_map(ExchangeSpecVisitor)
        }
    }

    struct ExchangeSpecVisitor;

    #[derive(Deserialize)]
    #[serde(field_identifier, rename_all = "snake_case")]
    enum ExchangeSpecField {
        Name,
        #[serde(alias = "type")]
        Kind,
        Durable,
        AutoDelete,
        Internal,
        Passive,
        #[serde(alias = "args")]
        Arguments,
        #[serde(other)]
        Ignore,
    }

    impl<'de> Visitor<'de> for ExchangeSpecVisitor {
        type Value = ExchangeSpec;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("a map of exchange declaration")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut name = None;
            let mut spec = ExchangeSpec::new(EXCHANGE_DEFAULT, ExchangeKind::Direct);

            while let Some(key) = map.next_key::<ExchangeSpecField>()? {
                match key {
                    ExchangeSpecField::Name => name = Some(map.next_value::<String>()?),
                    ExchangeSpecField::Kind => spec.kind = map.next_value()?,
                    ExchangeSpecField::Durable => spec.durable = map.next_value()?,
                    ExchangeSpecField::AutoDelete => spec.auto_delete = map.next_value()?,
                    ExchangeSpecField::Internal => spec.internal = map.next_value()?,
                    ExchangeSpecField::Passive => spec.passive = map.next_value()?,
                    ExchangeSpecField::Arguments => spec.arguments = map.next_value()?,
                    ExchangeSpecField::Ignore => {
                        map.next_value::<IgnoredAny>()?;
                    }
                }
            }

            spec.name = name.ok_or_else(|| serde::de::Error::missing_field("name"))?;

            Ok(spec)
        }
    }
};

/// Options of a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Asks the broker to return the message if no queue receives it.
    pub mandatory: bool,
    /// Asks the broker to return the message if no consumer can take it
    /// right away.
    pub immediate: bool,
    /// Bounds the publish, including any wait for a reconnect.
    pub timeout: Option<Duration>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            mandatory: true,
            immediate: false,
            timeout: None,
        }
    }
}

impl PublishOptions {
    /// Re-creates these options with the given mandatory flag.
    pub fn with_mandatory(self, mandatory: bool) -> Self {
        Self { mandatory, ..self }
    }

    /// Re-creates these options with the given timeout.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }
}

/// Refers to an exchange either by name or by handle, e.g. as a binding
/// source.
#[derive(Debug, Clone)]
pub enum ExchangeRef {
    /// An exchange referred to by name.
    Named(String),
    /// An exchange handle.
    Handle(Exchange),
}

impl ExchangeRef {
    /// Reports the name of the referred exchange.
    pub fn name(&self) -> &str {
        match self {
            ExchangeRef::Named(name) => name,
            ExchangeRef::Handle(exchange) => exchange.name(),
        }
    }
}

const _: () = {
    impl From<&str> for ExchangeRef {
        fn from(value: &str) -> Self {
            ExchangeRef::Named(value.to_string())
        }
    }

    impl From<String> for ExchangeRef {
        fn from(value: String) -> Self {
            ExchangeRef::Named(value)
        }
    }

    impl From<Exchange> for ExchangeRef {
        fn from(value: Exchange) -> Self {
            ExchangeRef::Handle(value)
        }
    }

    impl From<&Exchange> for ExchangeRef {
        fn from(value: &Exchange) -> Self {
            ExchangeRef::Handle(value.clone())
        }
    }
};

/// A handle to a declared exchange, bound to the channel that declared it.
///
/// Through a robust channel, the declaration and bindings made via this
/// handle are replayed after every reconnect, until the exchange is
/// [deleted](Exchange::delete).
#[derive(Clone)]
pub struct Exchange {
    channel: Channel,
    spec: Arc<ExchangeSpec>,
    ledger: Option<Arc<Ledger>>,
}

impl Exchange {
    pub(crate) fn new(channel: Channel, spec: ExchangeSpec, robust: bool) -> Self {
        let ledger = match robust {
            true => channel.core.ledger().cloned(),
            false => None,
        };

        Self {
            channel,
            spec: Arc::new(spec),
            ledger,
        }
    }

    /// Reports the exchange name.
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    /// Exposes the declaration of this exchange.
    pub fn spec(&self) -> &ExchangeSpec {
        &self.spec
    }

    /// Exposes the channel that owns this handle.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Reports whether this exchange is restored after reconnects.
    pub fn is_robust(&self) -> bool {
        self.ledger.is_some()
    }

    fn reject_default(&self, action: &str) -> Result<()> {
        match self.spec.is_default() {
            true => Err(Error::Policy(format!("the default exchange cannot be {}", action))),
            false => Ok(()),
        }
    }
}

impl Exchange {
    /// Declares this exchange (again).
    pub async fn declare(&self, timeout: Option<Duration>) -> Result<()> {
        self.reject_default("declared")?;

        let spec = self.spec.as_ref();
        self.channel
            .core
            .call_recorded(
                timeout,
                |raw| async move { raw.exchange_declare(spec).await },
                |_| {
                    if let Some(ledger) = &self.ledger {
                        ledger.record_exchange(Arc::clone(&self.spec));
                    }
                },
            )
            .await
    }

    /// Routes messages from the given source exchange into this exchange.
    pub async fn bind(
        &self,
        source: impl Into<ExchangeRef>,
        routing_key: &str,
        arguments: Arguments,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.reject_default("bound")?;

        let source = source.into();
        let (destination, source, arguments) = (self.name(), source.name(), &arguments);
        self.channel
            .core
            .call_recorded(
                timeout,
                |raw| async move {
                    raw.exchange_bind(destination, source, routing_key, arguments)
                        .await
                },
                |_| {
                    if let Some(ledger) = &self.ledger {
                        ledger.record_binding(self.binding_from(source, routing_key, arguments));
                    }
                },
            )
            .await
    }

    /// Stops routing messages from the given source exchange into this
    /// exchange.
    pub async fn unbind(
        &self,
        source: impl Into<ExchangeRef>,
        routing_key: &str,
        arguments: Arguments,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.reject_default("unbound")?;

        let source = source.into();
        let (destination, source, arguments) = (self.name(), source.name(), &arguments);
        self.channel
            .core
            .call(timeout, |raw| async move {
                raw.exchange_unbind(destination, source, routing_key, arguments)
                    .await
            })
            .await?;

        if let Some(ledger) = &self.ledger {
            ledger.forget_binding(&self.binding_from(source, routing_key, arguments));
        }

        Ok(())
    }

    /// Publishes the given message with the given routing key.
    ///
    /// Publishing to an internal exchange fails with [`Error::Policy`] without
    /// contacting the broker.
    pub async fn publish(
        &self,
        message: &Message,
        routing_key: &str,
        options: PublishOptions,
    ) -> Result<()> {
        if self.spec.internal() {
            return Err(Error::Policy(format!(
                "cannot publish to the internal exchange '{}'",
                self.name(),
            )));
        }

        self.channel
            .core
            .publish(self.name(), routing_key, message, &options)
            .await
    }

    /// Deletes this exchange, forgetting it along with its bindings.
    pub async fn delete(&self, if_unused: bool, timeout: Option<Duration>) -> Result<()> {
        self.reject_default("deleted")?;

        let name = self.name();
        self.channel
            .core
            .call(timeout, |raw| async move {
                raw.exchange_delete(name, if_unused).await
            })
            .await?;

        if let Some(ledger) = &self.ledger {
            ledger.forget_exchange(name);
        }

        Ok(())
    }

    fn binding_from(&self, source: &str, routing_key: &str, arguments: &Arguments) -> Binding {
        Binding {
            source: source.to_string(),
            destination: Destination::Exchange(self.name().to_string()),
            routing_key: Some(routing_key.to_string()),
            arguments: arguments.clone(),
        }
    }
}

impl Debug for Exchange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("spec", &self.spec)
            .field("channel", &self.channel.name())
            .field("robust", &self.is_robust())
            .finish()
    }
}
