mod common;

#[cfg(test)]
mod tests {
    use crate::common::names::mangle;
    use crate::common::setup::robust_channel;
    use pretty_assertions::assert_eq;
    use tether_amqp::{
        DeclareOptions, Error, ExchangeKind, ExchangeSpec, GetOptions, Message, PublishOptions,
        QueueSpec, StringDecoder,
    };
    use tether_memory::MemoryBroker;

    #[tokio::test]
    async fn publishing_to_internal_exchange_is_refused_locally() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let exchange = channel
            .declare_exchange(
                ExchangeSpec::new(mangle("internal"), ExchangeKind::Fanout).with_internal(true),
                DeclareOptions::default(),
            )
            .await
            .unwrap();
        broker.reset_calls();

        // When
        let result = exchange
            .publish(
                &Message::from_byte_ref("forbidden"),
                "",
                PublishOptions::default(),
            )
            .await;

        // Then
        assert!(matches!(result, Err(Error::Policy(_))), "{:?}", result);
        assert_eq!(broker.total_calls(), 0);
    }

    #[tokio::test]
    async fn default_exchange_cannot_be_declared() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        broker.reset_calls();

        // When
        let result = channel.default_exchange().declare(None).await;

        // Then
        assert!(matches!(result, Err(Error::Policy(_))), "{:?}", result);
        assert_eq!(broker.calls("exchange.declare"), 0);
    }

    #[tokio::test]
    async fn get_from_empty_queue() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let queue_name = mangle("empty");
        let queue = channel
            .declare_queue(QueueSpec::new(&queue_name), DeclareOptions::default())
            .await
            .unwrap();

        // When
        let failing = queue.get(GetOptions::default()).await;
        let lenient = queue
            .get(GetOptions::default().with_fail_if_empty(false))
            .await;

        // Then
        assert!(
            matches!(&failing, Err(Error::QueueEmpty(name)) if *name == queue_name),
            "{:?}",
            failing,
        );
        assert!(matches!(lenient, Ok(None)), "{:?}", lenient);
    }

    #[tokio::test]
    async fn get_and_finalize() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let queue_name = mangle("full");
        let queue = channel
            .declare_queue(QueueSpec::new(&queue_name), DeclareOptions::default())
            .await
            .unwrap();
        for body in ["first", "second"] {
            broker
                .publish("", &queue_name, &Message::from_byte_ref(body))
                .unwrap();
        }

        // When
        let first = queue.get(GetOptions::default()).await.unwrap().unwrap();

        // Then
        assert_eq!(first.decode(&StringDecoder).unwrap(), "first");
        assert_eq!(first.message_count(), Some(1));
        assert_eq!(broker.unacked_count(), 1);

        // When
        first.ack().await.unwrap();
        let repeated = first.ack().await;

        // Then
        assert!(matches!(repeated, Err(Error::Policy(_))), "{:?}", repeated);
        assert_eq!(broker.unacked_count(), 0);

        // When
        let second = queue
            .get(GetOptions::default().with_no_ack(true))
            .await
            .unwrap()
            .unwrap();

        // Then
        assert_eq!(second.body(), b"second");
        assert!(second.is_no_ack());
        assert!(matches!(second.ack().await, Err(Error::Policy(_))));
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_len(&queue_name), Some(0));
    }

    #[tokio::test]
    async fn rejected_message_returns_to_the_queue() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let queue_name = mangle("bounced");
        let queue = channel
            .declare_queue(QueueSpec::new(&queue_name), DeclareOptions::default())
            .await
            .unwrap();
        broker
            .publish("", &queue_name, &Message::from_byte_ref("bounce"))
            .unwrap();

        // When
        let fetched = queue.get(GetOptions::default()).await.unwrap().unwrap();
        fetched.nack(true).await.unwrap();
        let refetched = queue.get(GetOptions::default()).await.unwrap().unwrap();

        // Then
        assert!(!fetched.redelivered());
        assert!(refetched.redelivered());
        assert_eq!(refetched.body(), b"bounce");

        // When
        refetched.reject(false).await.unwrap();

        // Then
        assert_eq!(broker.queue_len(&queue_name), Some(0));
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn purge_removes_ready_messages() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let queue_name = mangle("purged");
        let queue = channel
            .declare_queue(QueueSpec::new(&queue_name), DeclareOptions::default())
            .await
            .unwrap();
        for _ in 0..3 {
            broker
                .publish("", &queue_name, &Message::from_byte_ref("stale"))
                .unwrap();
        }

        // When
        let purged = queue.purge(None).await.unwrap();

        // Then
        assert_eq!(purged, 3);
        assert_eq!(broker.queue_len(&queue_name), Some(0));
    }
}
