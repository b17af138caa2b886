use crate::channel::with_timeout;
use crate::{ConsumeOptions, ConsumerTag, Error, IncomingMessage, Queue, Result};
use futures::Stream;
use std::fmt::{Debug, Formatter};
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Options of a [`QueueIterator`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IteratorOptions {
    /// Bounds every single pull. Without a timeout, a pull waits for as long
    /// as it takes.
    pub timeout: Option<Duration>,
    /// Options of the underlying consumer.
    pub consume: ConsumeOptions,
}

impl IteratorOptions {
    /// Re-creates these options with the given pull timeout.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..self
        }
    }

    /// Re-creates these options with the given consumer options.
    pub fn with_consume(self, consume: ConsumeOptions) -> Self {
        Self { consume, ..self }
    }
}

/// Pulls messages from a queue one at a time.
///
/// The underlying consumer is started lazily, by the first
/// [`next`](QueueIterator::next). Messages delivered by the broker are
/// buffered until pulled. [Closing](QueueIterator::close) the iterator cancels
/// the consumer and returns every buffered message to the queue; dropping an
/// unclosed iterator closes it in the background.
pub struct QueueIterator {
    queue: Queue,
    options: IteratorOptions,
    receiver: Option<mpsc::UnboundedReceiver<IncomingMessage>>,
    consumer_tag: Option<ConsumerTag>,
    closed: bool,
}

impl QueueIterator {
    pub(crate) fn new(queue: Queue, options: IteratorOptions) -> Self {
        Self {
            queue,
            options,
            receiver: None,
            consumer_tag: None,
            closed: false,
        }
    }

    /// Exposes the iterated queue.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Exposes the tag of the underlying consumer, once started.
    pub fn consumer_tag(&self) -> Option<&ConsumerTag> {
        self.consumer_tag.as_ref()
    }

    /// Reports whether this iterator has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Pulls the next message.
    ///
    /// Fails with [`Error::Cancelled`] once this iterator is closed or while
    /// its channel is closed, and with [`Error::Timeout`] if no message
    /// arrives within the configured timeout. A robust channel closed by the
    /// broker feeds this iterator again once
    /// [reopened](crate::RobustChannel::reopen).
    pub async fn next(&mut self) -> Result<IncomingMessage> {
        if self.closed {
            return Err(Error::Cancelled);
        }
        if self.receiver.is_none() {
            self.start().await?;
        }

        let core = &self.queue.channel().core;
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(Error::Cancelled);
        };

        let pull = async {
            select! {
                biased;
                message = receiver.recv() => message.ok_or(Error::Cancelled),
                error = core.until_closed() => {
                    debug!(
                        channel = core.name().as_ref(),
                        ?error,
                        error_message = %error,
                        "Abandoned a pull on a closed channel",
                    );
                    Err(Error::Cancelled)
                }
            }
        };

        with_timeout(self.options.timeout, pull).await
    }

    /// Starts the underlying consumer, feeding the buffer.
    async fn start(&mut self) -> Result<()> {
        let (sender, receiver) = mpsc::unbounded_channel::<IncomingMessage>();

        let handler = move |message: IncomingMessage| {
            let sender = sender.clone();

            async move {
                // Closed iterator: hand the message back to the broker
                if let Err(mpsc::error::SendError(message)) = sender.send(message) {
                    if !message.is_no_ack() {
                        let _ = message.reject(true).await;
                    }
                }
            }
        };

        let tag = self
            .queue
            .consume(handler, self.options.consume.clone())
            .await?;

        debug!(
            queue = %self.queue.name(),
            consumer_tag = tag.as_str(),
            "Started iterating over a queue",
        );

        self.consumer_tag = Some(tag);
        self.receiver = Some(receiver);

        Ok(())
    }

    /// Cancels the underlying consumer and returns every buffered message to
    /// the queue. Closing a closed iterator is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        Self::shut_down(
            self.queue.clone(),
            self.consumer_tag.take(),
            self.receiver.take(),
        )
        .await
    }

    async fn shut_down(
        queue: Queue,
        consumer_tag: Option<ConsumerTag>,
        receiver: Option<mpsc::UnboundedReceiver<IncomingMessage>>,
    ) -> Result<()> {
        let mut outcome = Ok(());

        if let Some(tag) = consumer_tag {
            match queue.cancel(&tag, None).await {
                Ok(()) => {}
                // Nothing to cancel on a closed channel
                Err(Error::ChannelClosed(_) | Error::ConnectionClosed | Error::Connection(_)) => {}
                Err(error) => {
                    warn!(
                        queue = %queue.name(),
                        consumer_tag = tag.as_str(),
                        ?error,
                        error_message = %error,
                        "Failed to cancel the consumer of a queue iterator",
                    );
                    outcome = Err(error);
                }
            }
        }

        if let Some(mut receiver) = receiver {
            receiver.close();

            let mut requeued = 0usize;
            while let Ok(message) = receiver.try_recv() {
                if message.is_no_ack() {
                    continue;
                }
                if message.reject(true).await.is_ok() {
                    requeued += 1;
                }
            }

            debug!(
                queue = %queue.name(),
                requeued, "Stopped iterating over a queue",
            );
        }

        outcome
    }

    /// Turns this iterator into a [`Stream`] of pulls, which ends once the
    /// iterator is cancelled. Timeouts are yielded as errors without ending
    /// the stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<IncomingMessage>> {
        futures::stream::unfold(self, |mut iterator| async move {
            match iterator.next().await {
                Err(Error::Cancelled) => {
                    let _ = iterator.close().await;
                    None
                }
                pulled => Some((pulled, iterator)),
            }
        })
    }
}

impl Drop for QueueIterator {
    fn drop(&mut self) {
        if self.closed || (self.consumer_tag.is_none() && self.receiver.is_none()) {
            return;
        }
        self.closed = true;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        runtime.spawn(Self::shut_down(
            self.queue.clone(),
            self.consumer_tag.take(),
            self.receiver.take(),
        ));
    }
}

impl Debug for QueueIterator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueIterator")
            .field("queue", &self.queue.name())
            .field("consumer_tag", &self.consumer_tag)
            .field("closed", &self.closed)
            .finish()
    }
}
