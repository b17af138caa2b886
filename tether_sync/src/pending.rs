use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// The ways a [`PendingCall`] can end without a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError<E> {
    /// The call was cancelled before it was completed.
    Cancelled,
    /// The call was failed with the given error.
    Failed(E),
}

impl<E: Display> Display for CallError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Cancelled => f.write_str("call cancelled"),
            CallError::Failed(error) => Display::fmt(error, f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Cancelled => None,
            CallError::Failed(error) => Some(error),
        }
    }
}

type Outcome<T, E> = Result<T, CallError<E>>;

/// A registry of in-flight calls keyed by numeric correlation id.
///
/// Every call is resolved at most once. [Completion](PendingCalls::complete),
/// [failure](PendingCalls::fail) and [cancellation](PendingCalls::cancel) all
/// start by removing the entry from the registry, so when they race, the one
/// that removes the entry decides the outcome and the others report `false`.
///
/// Cloning the registry yields another handle to the same set of calls.
pub struct PendingCalls<T, E> {
    registry: Arc<Registry<T, E>>,
}

struct Registry<T, E> {
    next_id: AtomicU64,
    calls: SyncMutex<HashMap<u64, oneshot::Sender<Outcome<T, E>>>>,
}

/// A [`Future`] resolving with the outcome of a call registered in
/// [`PendingCalls`]. Dropping it forgets the call.
#[must_use = "a pending call does nothing unless awaited"]
pub struct PendingCall<T, E> {
    id: u64,
    receiver: oneshot::Receiver<Outcome<T, E>>,
    registry: Weak<Registry<T, E>>,
}

impl<T, E> PendingCalls<T, E> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                calls: SyncMutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a new call under a fresh correlation id.
    pub fn create(&self) -> PendingCall<T, E> {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.registry.calls.lock().insert(id, sender);

        PendingCall {
            id,
            receiver,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Resolves the call with the given id successfully. Returns `false` if
    /// the call is unknown or already resolved.
    pub fn complete(&self, id: u64, value: T) -> bool {
        self.resolve(id, Ok(value))
    }

    /// Fails the call with the given id. Returns `false` if the call is
    /// unknown or already resolved.
    pub fn fail(&self, id: u64, error: E) -> bool {
        self.resolve(id, Err(CallError::Failed(error)))
    }

    /// Cancels the call with the given id. Returns `false` if the call is
    /// unknown or already resolved.
    pub fn cancel(&self, id: u64) -> bool {
        self.resolve(id, Err(CallError::Cancelled))
    }

    fn resolve(&self, id: u64, outcome: Outcome<T, E>) -> bool {
        let sender = self.registry.calls.lock().remove(&id);

        match sender {
            // The waiting side may be gone already; the call still counts as
            // resolved by us.
            Some(sender) => {
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Cancels every outstanding call. Returns the number of calls affected.
    pub fn cancel_all(&self) -> usize {
        let drained = self.drain();
        let count = drained.len();

        for sender in drained {
            let _ = sender.send(Err(CallError::Cancelled));
        }

        count
    }

    /// Reports whether a call with the given id is outstanding.
    pub fn contains(&self, id: u64) -> bool {
        self.registry.calls.lock().contains_key(&id)
    }

    /// Reports the number of outstanding calls.
    pub fn len(&self) -> usize {
        self.registry.calls.lock().len()
    }

    /// Reports whether there are no outstanding calls.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&self) -> Vec<oneshot::Sender<Outcome<T, E>>> {
        self.registry
            .calls
            .lock()
            .drain()
            .map(|(_, sender)| sender)
            .collect()
    }
}

impl<T, E: Clone> PendingCalls<T, E> {
    /// Fails every outstanding call with a clone of the given error. Returns
    /// the number of calls affected.
    pub fn fail_all(&self, error: &E) -> usize {
        let drained = self.drain();
        let count = drained.len();

        for sender in drained {
            let _ = sender.send(Err(CallError::Failed(error.clone())));
        }

        count
    }
}

impl<T, E> PendingCall<T, E> {
    /// Exposes the correlation id of this call.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T, E> Future for PendingCall<T, E> {
    type Output = Outcome<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The registry itself is gone.
            Poll::Ready(Err(_)) => Poll::Ready(Err(CallError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> Drop for PendingCall<T, E> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.calls.lock().remove(&self.id);
        }
    }
}

impl<T, E> Default for PendingCalls<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for PendingCalls<T, E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T, E> Debug for PendingCalls<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("outstanding", &self.len())
            .finish()
    }
}

impl<T, E> Debug for PendingCall<T, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn complete_resolves() {
        // Given
        let calls = PendingCalls::<&str, String>::new();
        let call = calls.create();

        // When
        let completed = calls.complete(call.id(), "pong");

        // Then
        assert!(completed);
        assert_eq!(call.await, Ok("pong"));
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn cancel_after_complete_is_noop() {
        // Given
        let calls = PendingCalls::<u8, String>::new();
        let call = calls.create();
        let id = call.id();

        // When
        let completed = calls.complete(id, 1);
        let cancelled = calls.cancel(id);

        // Then
        assert!(completed);
        assert!(!cancelled);
        assert_eq!(call.await, Ok(1));
    }

    #[tokio::test]
    async fn complete_after_cancel_is_noop() {
        // Given
        let calls = PendingCalls::<u8, String>::new();
        let call = calls.create();
        let id = call.id();

        // When
        let cancelled = calls.cancel(id);
        let completed = calls.complete(id, 1);
        let failed = calls.fail(id, "late".to_string());

        // Then
        assert!(cancelled);
        assert!(!completed);
        assert!(!failed);
        assert_eq!(call.await, Err(CallError::Cancelled));
    }

    #[tokio::test]
    async fn fail_all_reaches_everyone() {
        // Given
        let calls = PendingCalls::<u8, String>::new();
        let first = calls.create();
        let second = calls.create();

        // When
        let failed = calls.fail_all(&"closed".to_string());

        // Then
        assert_eq!(failed, 2);
        assert_eq!(first.await, Err(CallError::Failed("closed".to_string())));
        assert_eq!(second.await, Err(CallError::Failed("closed".to_string())));
    }

    #[test]
    fn drop_forgets_call() {
        // Given
        let calls = PendingCalls::<u8, String>::new();
        let call = calls.create();
        let id = call.id();

        // When
        drop(call);

        // Then
        assert!(!calls.contains(id));
        assert!(!calls.complete(id, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_resolutions_resolve_once() {
        for _ in 0..100 {
            // Given
            let calls = PendingCalls::<u8, String>::new();
            let call = calls.create();
            let id = call.id();

            // When
            let handles = (0..3u8)
                .map(|which| {
                    let calls = calls.clone();
                    tokio::spawn(async move {
                        match which {
                            0 => calls.complete(id, 1),
                            1 => calls.cancel(id),
                            _ => calls.fail(id, "boom".to_string()),
                        }
                    })
                })
                .collect::<Vec<_>>();
            let results = futures::future::join_all(handles).await;
            let winners = results
                .into_iter()
                .filter(|result| matches!(result, Ok(true)))
                .count();

            // Then
            assert_eq!(winners, 1);
            let _ = call.await;
        }
    }
}
