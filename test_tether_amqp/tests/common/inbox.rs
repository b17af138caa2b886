use parking_lot::Mutex as SyncMutex;
use std::future::Future;
use std::sync::Arc;
use tether_amqp::IncomingMessage;

/// Collects the bodies of consumed messages, in the order they were handled.
#[derive(Clone, Default)]
pub struct Inbox {
    bodies: Arc<SyncMutex<Vec<String>>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a consumer handler that acknowledges every message first and
    /// records it second, so that a recorded message is never redelivered.
    pub fn acking_handler(
        &self,
    ) -> impl Fn(IncomingMessage) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
    + Send
    + Sync
    + 'static {
        let bodies = Arc::clone(&self.bodies);

        move |message: IncomingMessage| {
            let bodies = Arc::clone(&bodies);

            Box::pin(async move {
                if message.ack().await.is_ok() {
                    bodies
                        .lock()
                        .push(String::from_utf8_lossy(message.body()).into_owned());
                }
            })
        }
    }

    /// Makes a consumer handler that records every message without ever
    /// finalizing it.
    pub fn hoarding_handler(
        &self,
    ) -> impl Fn(IncomingMessage) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>
    + Send
    + Sync
    + 'static {
        let bodies = Arc::clone(&self.bodies);

        move |message: IncomingMessage| {
            let bodies = Arc::clone(&bodies);

            Box::pin(async move {
                bodies
                    .lock()
                    .push(String::from_utf8_lossy(message.body()).into_owned());
            })
        }
    }

    pub fn len(&self) -> usize {
        self.bodies.lock().len()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.bodies.lock().clone()
    }
}
