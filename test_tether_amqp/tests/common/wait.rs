use std::future::Future;
use std::time::Duration;
use tether_amqp::{ConnectionState, RobustConnection};

/// How long a test waits for something to happen in the background.
pub const PATIENCE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls the given condition until it holds. Panics once out of patience.
pub async fn until<F>(description: &str, condition: F)
where
    F: Fn() -> bool,
{
    let polling = async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    if tokio::time::timeout(PATIENCE, polling).await.is_err() {
        panic!("gave up waiting until {}", description);
    }
}

/// Awaits the given future. Panics once out of patience.
pub async fn patiently<F>(future: F) -> F::Output
where
    F: Future,
{
    tokio::time::timeout(PATIENCE, future)
        .await
        .expect("should complete in time")
}

/// Waits until the given connection has reconnected past the given
/// generation, with every channel reopened.
pub async fn reconnected(connection: &RobustConnection, previous: u64) {
    until("reconnected", || {
        connection.generation() > previous && connection.state() == ConnectionState::Connected
    })
    .await;
}
