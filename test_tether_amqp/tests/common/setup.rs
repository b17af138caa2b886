use std::time::Duration;
use tether_amqp::{
    ChannelOptions, Connection, ConnectionConfig, Endpoint, RobustChannel, RobustConnection,
};
use tether_memory::MemoryBroker;
use tether_util::BackoffConfig;

/// Interval between reconnect attempts in tests.
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(10);

/// Makes a connection configuration that reconnects quickly and without
/// jitter.
pub fn fast_config() -> ConnectionConfig {
    ConnectionConfig::from(Endpoint::default())
        .with_reconnect(BackoffConfig::fixed(RECONNECT_INTERVAL).with_jitter(0.0))
        .with_connection_timeout(Duration::from_secs(1))
}

/// Same as [`fast_config`], but gives up after the given number of reconnect
/// attempts.
pub fn limited_config(max_attempts: usize) -> ConnectionConfig {
    ConnectionConfig::from(Endpoint::default())
        .with_reconnect(
            BackoffConfig::fixed(RECONNECT_INTERVAL)
                .with_jitter(0.0)
                .with_max_attempts(Some(max_attempts)),
        )
        .with_connection_timeout(Duration::from_secs(1))
}

pub async fn connect_robust(broker: &MemoryBroker) -> RobustConnection {
    RobustConnection::connect(broker.engine(), fast_config())
        .await
        .unwrap()
}

pub async fn connect_plain(broker: &MemoryBroker) -> Connection {
    Connection::connect(broker.engine(), fast_config())
        .await
        .unwrap()
}

/// Connects a robust connection and opens a single robust channel on it.
pub async fn robust_channel(broker: &MemoryBroker) -> (RobustConnection, RobustChannel) {
    let connection = connect_robust(broker).await;
    let channel = connection
        .channel(ChannelOptions::default())
        .await
        .unwrap();

    (connection, channel)
}
