use crate::{Endpoint, EndpointError};
use nonempty::NonEmpty;
use serde::de::{Error, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt::Formatter;
use std::time::Duration;
use tether_util::{BackoffConfig, duration};

/// Describes how a connection reaches the broker and how it recovers from
/// losing it.
///
/// The initial connection tries every endpoint once, in order. Reconnect
/// attempts rotate through the endpoints, pacing themselves according to the
/// [`reconnect`](ConnectionConfig::reconnect) configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    endpoints: NonEmpty<Endpoint>,
    reconnect: BackoffConfig,
    connection_timeout: Duration,
}

impl ConnectionConfig {
    /// Creates a configuration for the given endpoints. Reconnect pacing and
    /// the connection timeout are taken from the first endpoint, where set.
    pub fn new(endpoints: NonEmpty<Endpoint>) -> Self {
        let reconnect = endpoints
            .head
            .reconnect()
            .cloned()
            .unwrap_or_default();
        let connection_timeout = endpoints
            .head
            .connection_timeout()
            .unwrap_or_else(Self::default_connection_timeout);

        Self {
            endpoints,
            reconnect,
            connection_timeout,
        }
    }

    /// Parses the given URL into a single-endpoint configuration.
    pub fn parse(url: &str) -> Result<Self, EndpointError> {
        Endpoint::parse(url).map(Self::from)
    }

    /// Re-creates this configuration with the given reconnect pacing.
    pub fn with_reconnect(self, reconnect: BackoffConfig) -> Self {
        Self { reconnect, ..self }
    }

    /// Re-creates this configuration with the given timeout for a single
    /// connection attempt.
    pub fn with_connection_timeout(self, connection_timeout: Duration) -> Self {
        Self {
            connection_timeout,
            ..self
        }
    }

    /// Exposes the endpoints.
    pub fn endpoints(&self) -> &NonEmpty<Endpoint> {
        &self.endpoints
    }

    /// Exposes the reconnect pacing.
    pub fn reconnect(&self) -> &BackoffConfig {
        &self.reconnect
    }

    /// Exposes the timeout of a single connection attempt.
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    fn default_connection_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl From<Endpoint> for ConnectionConfig {
    fn from(value: Endpoint) -> Self {
        Self::new(NonEmpty::new(value))
    }
}

impl AsRef<ConnectionConfig> for ConnectionConfig {
    fn as_ref(&self) -> &ConnectionConfig {
        self
    }
}

const _: () = {
    impl<'de> Deserialize<'de> for ConnectionConfig {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_any(ConnectionConfigVisitor)
        }
    }

    struct ConnectionConfigVisitor;

    #[derive(Deserialize)]
    #[serde(field_identifier, rename_all = "snake_case")]
    enum ConnectionConfigField {
        #[serde(alias = "endpoint", alias = "url", alias = "urls")]
        Endpoints,
        Reconnect,
        ConnectionTimeout,
        #[serde(other)]
        Ignore,
    }

    /// Accepts either a single endpoint or a sequence of them.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<Endpoint>),
        One(Endpoint),
    }

    struct SerdeDuration(Duration);

    impl<'de> Deserialize<'de> for SerdeDuration {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            duration::deserialize(deserializer).map(SerdeDuration)
        }
    }

    fn non_empty<E: Error>(endpoints: Vec<Endpoint>) -> Result<NonEmpty<Endpoint>, E> {
        NonEmpty::from_vec(endpoints).ok_or_else(|| E::custom("at least one endpoint is required"))
    }

    impl<'de> Visitor<'de> for ConnectionConfigVisitor {
        type Value = ConnectionConfig;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            formatter.write_str("an AMQP URL, a sequence of them, or a map of connection configuration")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: Error,
        {
            ConnectionConfig::parse(value).map_err(E::custom)
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut endpoints = Vec::new();
            while let Some(endpoint) = seq.next_element::<Endpoint>()? {
                endpoints.push(endpoint);
            }

            Ok(ConnectionConfig::new(non_empty(endpoints)?))
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut endpoints = None;
            let mut reconnect = None;
            let mut connection_timeout = None;

            while let Some(key) = map.next_key::<ConnectionConfigField>()? {
                match key {
                    ConnectionConfigField::Endpoints => {
                        endpoints = Some(match map.next_value::<OneOrMany>()? {
                            OneOrMany::Many(endpoints) => endpoints,
                            OneOrMany::One(endpoint) => vec![endpoint],
                        });
                    }
                    ConnectionConfigField::Reconnect => {
                        reconnect = Some(map.next_value::<BackoffConfig>()?);
                    }
                    ConnectionConfigField::ConnectionTimeout => {
                        connection_timeout = Some(map.next_value::<SerdeDuration>()?.0);
                    }
                    ConnectionConfigField::Ignore => {
                        map.next_value::<IgnoredAny>()?;
                    }
                }
            }

            let endpoints = match endpoints {
                Some(endpoints) => non_empty(endpoints)?,
                None => NonEmpty::new(Endpoint::default()),
            };
            let mut config = ConnectionConfig::new(endpoints);

            if let Some(reconnect) = reconnect {
                config.reconnect = reconnect;
            }
            if let Some(connection_timeout) = connection_timeout {
                config.connection_timeout = connection_timeout;
            }

            Ok(config)
        }
    }
};

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserialize_from_url() {
        // Given
        let input = "\"amqp://localhost/?reconnect_interval=0.5\"";

        // When
        let config = serde_yml::from_str::<ConnectionConfig>(input).unwrap();

        // Then
        assert_eq!(config.endpoints().len(), 1);
        assert_eq!(config.reconnect().initial_interval(), Duration::from_millis(500));
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn deserialize_from_map() {
        // Given
        let input = r#"
endpoints:
  - amqp://primary
  - host: secondary
    port: 5673
reconnect:
  interval: 2s
  max_attempts: 5
connection_timeout: 1.5
"#;

        // When
        let config = serde_yml::from_str::<ConnectionConfig>(input).unwrap();

        // Then
        let hosts = config
            .endpoints()
            .iter()
            .map(|endpoint| endpoint.host())
            .collect::<Vec<_>>();
        assert_eq!(hosts, vec!["primary", "secondary"]);
        assert_eq!(config.reconnect().initial_interval(), Duration::from_secs(2));
        assert_eq!(config.reconnect().max_attempts(), Some(5));
        assert_eq!(config.connection_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn deserialize_rejects_empty_endpoints() {
        // Given
        let input = "endpoints: []\n";

        // When
        let result = serde_yml::from_str::<ConnectionConfig>(input);

        // Then
        assert!(result.is_err());
    }
}
