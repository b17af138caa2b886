mod common;

#[cfg(test)]
mod tests {
    use crate::common::names::mangle;
    use crate::common::setup::robust_channel;
    use crate::common::wait::{patiently, reconnected, until};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tether_amqp::{
        CloseReason, DeclareOptions, Error, GetOptions, IteratorOptions, Message, Queue,
        QueueSpec, RobustChannel,
    };
    use tether_memory::MemoryBroker;

    async fn filled_queue(broker: &MemoryBroker, channel: &RobustChannel, count: usize) -> Queue {
        let queue_name = mangle("iterated");
        let queue = channel
            .declare_queue(QueueSpec::new(&queue_name), DeclareOptions::default())
            .await
            .unwrap();

        for index in 0..count {
            broker
                .publish("", &queue_name, &Message::from_byte_ref(index.to_string()))
                .unwrap();
        }

        queue
    }

    #[tokio::test]
    async fn pulls_in_order() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let queue = filled_queue(&broker, &channel, 3).await;
        let mut iterator = queue.iterator(IteratorOptions::default());

        // When
        let mut bodies = Vec::new();
        for _ in 0..3 {
            let message = patiently(iterator.next()).await.unwrap();
            message.ack().await.unwrap();
            bodies.push(String::from_utf8(message.into_body()).unwrap());
        }
        iterator.close().await.unwrap();

        // Then
        assert_eq!(bodies, vec!["0", "1", "2"]);
        assert_eq!(broker.queue_len(&queue.name()), Some(0));
        assert_eq!(broker.consumer_count(&queue.name()), Some(0));
    }

    #[tokio::test]
    async fn closing_requeues_buffered_messages() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let queue = filled_queue(&broker, &channel, 5).await;
        let mut iterator = queue.iterator(IteratorOptions::default());

        let first = patiently(iterator.next()).await.unwrap();
        first.ack().await.unwrap();
        until("the rest is buffered", || broker.unacked_count() == 4).await;

        // When
        iterator.close().await.unwrap();
        until("the rest is requeued", || {
            broker.queue_len(&queue.name()) == Some(4) && broker.unacked_count() == 0
        })
        .await;

        // Then
        assert!(matches!(iterator.next().await, Err(Error::Cancelled)));

        let next = queue.get(GetOptions::default()).await.unwrap().unwrap();
        assert_eq!(next.body(), b"1");
        assert!(next.redelivered());
    }

    #[tokio::test]
    async fn pull_times_out() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let queue = filled_queue(&broker, &channel, 0).await;
        let mut iterator =
            queue.iterator(IteratorOptions::default().with_timeout(Duration::from_millis(50)));

        // When
        let result = iterator.next().await;

        // Then
        assert!(matches!(result, Err(Error::Timeout(_))), "{:?}", result);
        assert!(!iterator.is_closed());
        assert!(iterator.consumer_tag().is_some());
    }

    #[tokio::test]
    async fn keeps_pulling_after_reconnect() {
        // Given
        let broker = MemoryBroker::new();
        let (connection, channel) = robust_channel(&broker).await;
        let queue = filled_queue(&broker, &channel, 0).await;
        let mut iterator =
            queue.iterator(IteratorOptions::default().with_timeout(Duration::from_millis(50)));
        assert!(matches!(iterator.next().await, Err(Error::Timeout(_))));

        // When
        broker.disconnect_all();
        reconnected(&connection, 1).await;
        broker
            .publish("", &queue.name(), &Message::from_byte_ref("after"))
            .unwrap();
        let message = patiently(iterator.next()).await.unwrap();

        // Then
        assert_eq!(message.body(), b"after");
        message.ack().await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn waiting_pull_ends_when_broker_closes_the_channel() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let queue = filled_queue(&broker, &channel, 0).await;
        let mut iterator = queue.iterator(IteratorOptions::default());

        // When
        let (result, ()) = patiently(async {
            tokio::join!(iterator.next(), async {
                until("the iterator consumes", || {
                    broker.consumer_count(&queue.name()) == Some(1)
                })
                .await;
                broker.close_channels(CloseReason::PRECONDITION_FAILED, "closed by a test");
            })
        })
        .await;

        // Then
        assert!(matches!(result, Err(Error::Cancelled)), "{:?}", result);
        assert!(channel.is_closed());
        assert!(!iterator.is_closed());

        // When
        channel.reopen().await.unwrap();
        broker
            .publish("", &queue.name(), &Message::from_byte_ref("reopened"))
            .unwrap();
        let message = patiently(iterator.next()).await.unwrap();

        // Then
        assert_eq!(message.body(), b"reopened");
        message.ack().await.unwrap();
    }

    #[tokio::test]
    async fn streams_until_the_channel_closes() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let queue = filled_queue(&broker, &channel, 2).await;
        let stream = queue.iterator(IteratorOptions::default()).into_stream();

        // When
        let pulled = patiently(async {
            let mut stream = Box::pin(stream);
            let mut bodies = Vec::new();

            while let Some(message) = stream.next().await {
                let message = message.unwrap();
                message.ack().await.unwrap();
                bodies.push(String::from_utf8_lossy(message.body()).into_owned());

                if bodies.len() == 2 {
                    channel.close().await;
                }
            }

            bodies
        })
        .await;

        // Then
        assert_eq!(pulled, vec!["0", "1"]);
    }
}
