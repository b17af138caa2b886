use std::fmt::{Debug, Formatter};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// A synchronization primitive that can be released exactly once with a
/// value, notifying all associated [`Gate`]s. Only the first release counts:
/// later releases are ignored and report `false`.
///
/// ## Example
///
/// ```
/// use tether_sync::{Gate, Latch};
/// use pretty_assertions::assert_eq;
///
/// # tokio_test::block_on(async {
///
/// // Make a latch and derive a gate from it
/// let latch = Latch::<&'static str>::new();
/// let gate = latch.gate();
///
/// // Only the first release is observed
/// tokio::spawn(async move {
///     assert!(latch.release("first"));
///     assert!(!latch.release("second"));
/// });
///
/// assert_eq!(gate.opened().await, "first");
/// # })
/// ```
pub struct Latch<T = ()> {
    inner: Arc<Inner<T>>,
}

/// A single-release barrier that is [opened](Gate::opened) when the associated
/// [`Latch`] is [released](Latch::release), yielding the released value.
///
/// This gate can be cheaply cloned and awaited on by any number of asynchronous
/// tasks at any time.
pub struct Gate<T = ()> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    token: CancellationToken,
    value: OnceLock<T>,
}

impl<T> Latch<T> {
    /// Returns a brand new, unreleased [`Latch`].
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                value: OnceLock::new(),
            }),
        }
    }

    /// Returns a new [`Gate`] handle associated with this [`Latch`].
    pub fn gate(&self) -> Gate<T> {
        Gate {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Releases this [`Latch`] with the given value, notifying all associated
    /// [`Gate`]s. Returns `false` if the latch was already released, in which
    /// case the given value is discarded.
    pub fn release(&self, value: T) -> bool {
        // The value is stored before the token fires, so an open gate always
        // finds it.
        if self.inner.value.set(value).is_err() {
            return false;
        }
        self.inner.token.cancel();

        true
    }

    /// Reports whether this [`Latch`] has been released.
    pub fn is_released(&self) -> bool {
        self.inner.token.is_cancelled()
    }
}

impl<T> Gate<T> {
    /// Reports whether the associated [`Latch`] has been released.
    pub fn is_open(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Exposes the released value, if any.
    pub fn peek(&self) -> Option<&T> {
        self.inner.value.get()
    }
}

impl<T: Clone> Gate<T> {
    /// Waits asynchronously until the associated [`Latch`] is
    /// [released](Latch::release), and returns a clone of the released value.
    /// Resolves immediately if the latch has already been released.
    pub async fn opened(&self) -> T {
        self.inner.token.cancelled().await;

        match self.inner.value.get() {
            Some(value) => value.clone(),
            None => std::future::pending().await,
        }
    }

    /// Returns a clone of the released value, if any.
    pub fn value(&self) -> Option<T> {
        self.peek().cloned()
    }
}

impl<T> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Latch<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Clone for Gate<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Latch<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch")
            .field("released", &self.is_released())
            .finish()
    }
}

impl<T> Debug for Gate<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("open", &self.is_open())
            .finish()
    }
}
