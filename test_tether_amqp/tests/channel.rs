mod common;

#[cfg(test)]
mod tests {
    use crate::common::inbox::Inbox;
    use crate::common::names::mangle;
    use crate::common::setup::{connect_plain, connect_robust, robust_channel};
    use crate::common::wait::{patiently, reconnected, until};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tether_amqp::{
        ChannelOptions, ChannelState, CloseReason, ConsumeOptions, DeclareOptions, Error,
        Message, PublishOptions, Qos, QueueSpec,
    };
    use tether_memory::MemoryBroker;
    use tether_sync::CallError;

    fn close_code(error: &Error) -> Option<u16> {
        error.close_reason().map(|reason| reason.code)
    }

    #[tokio::test]
    async fn broker_closed_channel_stays_closed_until_reopened() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let closures = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&closures);
        channel.add_close_observer(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        // When
        broker.close_channels(CloseReason::PRECONDITION_FAILED, "closed by a test");
        until("the channel is closed", || channel.is_closed()).await;
        let error = channel
            .declare_queue(QueueSpec::new(mangle("rejected")), DeclareOptions::default())
            .await
            .unwrap_err();

        // Then
        assert_eq!(close_code(&error), Some(CloseReason::PRECONDITION_FAILED));
        assert_eq!(closures.load(Ordering::SeqCst), 1);
        assert!(!channel.closed().is_open());

        // When
        channel.reopen().await.unwrap();
        let queue_name = mangle("accepted");
        channel
            .declare_queue(QueueSpec::new(&queue_name), DeclareOptions::default())
            .await
            .unwrap();

        // Then
        assert_eq!(channel.state(), ChannelState::Open);
        assert!(broker.has_queue(&queue_name));
    }

    #[tokio::test]
    async fn failed_replay_closes_the_channel_for_good() {
        // Given
        let broker = MemoryBroker::new();
        let (connection, channel) = robust_channel(&broker).await;
        let queue_name = mangle("foreign");
        broker.declare_queue(&QueueSpec::new(&queue_name)).unwrap();
        channel
            .declare_queue(
                QueueSpec::new(&queue_name).with_passive(true),
                DeclareOptions::default(),
            )
            .await
            .unwrap();

        // When
        broker.restart();
        let error = patiently(channel.closed().opened()).await;

        // Then
        assert_eq!(close_code(&error), Some(CloseReason::NOT_FOUND));
        assert!(channel.is_closed());
        assert!(matches!(channel.reopen().await, Err(Error::ChannelClosed(_))));

        reconnected(&connection, 1).await;
        let survivor = connection
            .channel(ChannelOptions::default())
            .await
            .unwrap();
        assert_eq!(survivor.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn qos_survives_reopen_and_reconnect() {
        // Given
        let broker = MemoryBroker::new();
        let (connection, channel) = robust_channel(&broker).await;
        channel.set_qos(Qos::prefetch(1), None).await.unwrap();

        // When
        channel.reopen().await.unwrap();
        until("the previous channel is closed", || {
            broker.channel_count() == 1
        })
        .await;

        // Then
        assert_eq!(broker.channel_qos(), vec![Some(Qos::prefetch(1))]);

        // When
        broker.disconnect_all();
        reconnected(&connection, 1).await;

        // Then
        assert_eq!(broker.channel_qos(), vec![Some(Qos::prefetch(1))]);
    }

    #[tokio::test]
    async fn prefetch_limits_deliveries_after_reconnect() {
        // Given
        let broker = MemoryBroker::new();
        let (connection, channel) = robust_channel(&broker).await;
        let queue_name = mangle("prefetched");
        let inbox = Inbox::new();

        channel.set_qos(Qos::prefetch(1), None).await.unwrap();
        let queue = channel
            .declare_queue(QueueSpec::new(&queue_name), DeclareOptions::default())
            .await
            .unwrap();
        queue
            .consume(inbox.hoarding_handler(), ConsumeOptions::default())
            .await
            .unwrap();

        // When
        broker.disconnect_all();
        reconnected(&connection, 1).await;
        for index in 0..3 {
            broker
                .publish("", &queue_name, &Message::from_byte_ref(index.to_string()))
                .unwrap();
        }
        until("the first message is delivered", || inbox.len() == 1).await;

        // Then
        assert_eq!(broker.unacked_count(), 1);
        assert_eq!(broker.queue_len(&queue_name), Some(2));
        assert_eq!(inbox.bodies(), vec!["0".to_string()]);
    }

    #[tokio::test]
    async fn unacknowledged_qos_is_not_restored() {
        // Given
        let broker = MemoryBroker::new();
        let (connection, channel) = robust_channel(&broker).await;

        // When
        broker.set_latency(Some(Duration::from_millis(200)));
        let result = channel
            .set_qos(Qos::prefetch(5), Some(Duration::from_millis(20)))
            .await;
        broker.set_latency(None);
        broker.disconnect_all();
        reconnected(&connection, 1).await;

        // Then
        assert!(matches!(result, Err(Error::Timeout(_))), "{:?}", result);
        assert_eq!(broker.channel_qos(), vec![None]);
    }

    #[tokio::test]
    async fn unconfirmed_cancel_keeps_the_consumer() {
        // Given
        let broker = MemoryBroker::new();
        let (connection, channel) = robust_channel(&broker).await;
        let queue_name = mangle("cancelled");
        let inbox = Inbox::new();
        let queue = channel
            .declare_queue(QueueSpec::new(&queue_name), DeclareOptions::default())
            .await
            .unwrap();
        let tag = queue
            .consume(inbox.acking_handler(), ConsumeOptions::default())
            .await
            .unwrap();

        // When
        broker.set_latency(Some(Duration::from_millis(200)));
        let result = queue.cancel(&tag, Some(Duration::from_millis(20))).await;
        broker.set_latency(None);
        broker.disconnect_all();
        reconnected(&connection, 1).await;

        // Then
        assert!(matches!(result, Err(Error::Timeout(_))), "{:?}", result);
        assert_eq!(broker.consumer_count(&queue_name), Some(1));

        // When
        queue.cancel(&tag, None).await.unwrap();
        broker.disconnect_all();
        reconnected(&connection, 2).await;

        // Then
        assert_eq!(broker.consumer_count(&queue_name), Some(0));
    }

    #[tokio::test]
    async fn pending_calls_resolve_once() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let calls = channel.pending_calls();

        // When
        let failed = calls.create();
        let failed_id = failed.id();
        let cancelled = calls.create();
        let cancelled_id = cancelled.id();

        // Then
        assert!(calls.fail(failed_id, Error::Cancelled));
        assert!(!calls.cancel(failed_id));
        assert!(matches!(
            failed.await,
            Err(CallError::Failed(Error::Cancelled)),
        ));

        assert!(calls.cancel(cancelled_id));
        assert!(!calls.fail(cancelled_id, Error::Cancelled));
        assert!(matches!(cancelled.await, Err(CallError::Cancelled)));
        assert!(calls.is_empty());
    }

    #[tokio::test]
    async fn pending_calls_fail_on_link_loss() {
        // Given
        let broker = MemoryBroker::new();
        let (_connection, channel) = robust_channel(&broker).await;
        let call = channel.pending_calls().create();

        // When
        broker.disconnect_all();
        let outcome = patiently(call).await;

        // Then
        assert!(
            matches!(outcome, Err(CallError::Failed(Error::Connection(_)))),
            "{:?}",
            outcome,
        );
    }

    #[tokio::test]
    async fn returned_message_is_observed() {
        // Given
        let broker = MemoryBroker::new();
        let connection = connect_robust(&broker).await;
        let channel = connection
            .channel(ChannelOptions {
                on_return_raises: true,
            })
            .await
            .unwrap();
        let returns = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&returns);
        channel.add_return_observer(move |event| {
            assert_eq!(event.message().reply_code(), CloseReason::NO_ROUTE);
            counted.fetch_add(1, Ordering::SeqCst);
        });

        // When
        let result = channel
            .default_exchange()
            .publish(
                &Message::from_byte_ref("lost"),
                &mangle("nowhere"),
                PublishOptions::default(),
            )
            .await;

        // Then
        assert!(matches!(result, Err(Error::MessageReturned(_))), "{:?}", result);
        assert_eq!(returns.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn plain_channel_closes_for_good_on_broker_error() {
        // Given
        let broker = MemoryBroker::new();
        let connection = connect_plain(&broker).await;
        let channel = connection
            .channel(ChannelOptions::default())
            .await
            .unwrap();

        // When
        let error = channel
            .declare_queue(QueueSpec::new(mangle("missing")).with_passive(true), None)
            .await
            .unwrap_err();

        // Then
        assert_eq!(close_code(&error), Some(CloseReason::NOT_FOUND));
        until("the channel is closed", || channel.is_closed()).await;
        assert!(!connection.is_closed());
        assert!(
            connection
                .channel(ChannelOptions::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn plain_connection_closes_on_link_loss() {
        // Given
        let broker = MemoryBroker::new();
        let connection = connect_plain(&broker).await;
        let channel = connection
            .channel(ChannelOptions::default())
            .await
            .unwrap();

        // When
        broker.disconnect_all();
        let error = patiently(connection.closed().opened()).await;

        // Then
        assert!(matches!(error, Error::Connection(_)), "{:?}", error);
        assert!(channel.is_closed());
        assert!(matches!(
            channel
                .declare_queue(QueueSpec::new(mangle("late")), None)
                .await,
            Err(Error::Connection(_)),
        ));
        assert_eq!(broker.connect_attempts(), 1);
    }
}
