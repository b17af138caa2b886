mod common;

#[cfg(test)]
mod tests {
    use crate::common::names::mangle;
    use crate::common::setup::{fast_config, limited_config, robust_channel};
    use crate::common::wait::{patiently, reconnected, until};
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tether_amqp::{
        ChannelOptions, ConnectionState, DeclareOptions, Error, Message, PublishOptions,
        QueueSpec, ReconnectEvent, RobustConnection,
    };
    use tether_memory::MemoryBroker;
    use tether_sync::Observer;

    #[tokio::test]
    async fn fails_fast_when_initially_unreachable() {
        // Given
        let broker = MemoryBroker::new();
        broker.set_reachable(false);

        // When
        let result = RobustConnection::connect(broker.engine(), fast_config()).await;

        // Then
        assert!(matches!(result, Err(Error::Connection(_))));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn reconnects_once_for_many_failing_operations() {
        // Given
        let broker = MemoryBroker::new();
        let (connection, channel) = robust_channel(&broker).await;
        let queue_name = mangle("busy");
        channel
            .declare_queue(QueueSpec::new(&queue_name), DeclareOptions::default())
            .await
            .unwrap();

        let events = Arc::new(SyncMutex::new(Vec::<ReconnectEvent>::new()));
        let recorded = Arc::clone(&events);
        connection.add_reconnect_observer(move |event| recorded.lock().push(*event));

        // When
        broker.refuse_next(2);
        broker.disconnect_all();

        let exchange = channel.default_exchange();
        let message = Message::from_byte_ref("payload");
        let results = patiently(futures::future::join_all((0..10).map(|_| {
            exchange.publish(&message, &queue_name, PublishOptions::default())
        })))
        .await;

        // Then
        assert!(results.iter().all(Result::is_ok), "{:?}", results);
        assert_eq!(broker.queue_len(&queue_name), Some(10));

        until("the reconnect is reported", || events.lock().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].generation(), 2);
        assert_eq!(events[0].attempts(), 3);
        assert_eq!(connection.generation(), 2);
        assert_eq!(broker.connect_attempts(), 4);
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn operations_wait_for_the_reconnect() {
        // Given
        let broker = MemoryBroker::new();
        let (connection, channel) = robust_channel(&broker).await;
        let queue_name = mangle("patient");
        channel
            .declare_queue(QueueSpec::new(&queue_name), DeclareOptions::default())
            .await
            .unwrap();

        // When
        broker.set_reachable(false);
        broker.disconnect_all();

        let publishing = tokio::spawn({
            let exchange = channel.default_exchange();
            let queue_name = queue_name.clone();

            async move {
                exchange
                    .publish(
                        &Message::from_byte_ref("late"),
                        &queue_name,
                        PublishOptions::default(),
                    )
                    .await
            }
        });

        until("reconnecting", || {
            connection.state() == ConnectionState::Reconnecting
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publishing.is_finished());

        broker.set_reachable(true);
        let result = patiently(publishing).await.unwrap();

        // Then
        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(broker.queue_len(&queue_name), Some(1));
    }

    #[tokio::test]
    async fn waiting_is_bounded_by_the_timeout() {
        // Given
        let broker = MemoryBroker::new();
        let (connection, channel) = robust_channel(&broker).await;
        let queue_name = mangle("impatient");

        // When
        broker.set_reachable(false);
        broker.disconnect_all();
        let result = channel
            .declare_queue(
                QueueSpec::new(&queue_name),
                DeclareOptions::default().with_timeout(Duration::from_millis(50)),
            )
            .await;

        // Then
        assert!(matches!(result, Err(Error::Timeout(_))), "{:?}", result);

        // When
        broker.set_reachable(true);
        reconnected(&connection, 1).await;

        // Then
        assert!(!broker.has_queue(&queue_name));
    }

    #[tokio::test]
    async fn gives_up_after_the_last_attempt() {
        // Given
        let broker = MemoryBroker::new();
        let connection = RobustConnection::connect(broker.engine(), limited_config(3))
            .await
            .unwrap();
        let channel = connection
            .channel(ChannelOptions::default())
            .await
            .unwrap();

        let closures = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&closures);
        connection.add_close_observer(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        // When
        broker.set_reachable(false);
        broker.disconnect_all();
        let error = patiently(connection.closed().opened()).await;

        // Then
        assert!(matches!(error, Error::Connection(_)), "{:?}", error);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(closures.load(Ordering::SeqCst), 1);
        assert_eq!(broker.connect_attempts(), 4);
        assert!(channel.is_closed());
        assert!(matches!(
            channel
                .declare_queue(QueueSpec::new("late"), DeclareOptions::default())
                .await,
            Err(Error::Connection(_)),
        ));
        assert!(matches!(
            connection.channel(ChannelOptions::default()).await,
            Err(Error::Connection(_)),
        ));
    }

    #[tokio::test]
    async fn closing_stops_everything() {
        // Given
        let broker = MemoryBroker::new();
        let (connection, channel) = robust_channel(&broker).await;

        // When
        connection.close().await;
        connection.close().await;

        // Then
        assert!(connection.is_closed());
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(channel.is_closed());
        assert_eq!(broker.connection_count(), 0);
        assert!(matches!(
            channel
                .declare_queue(QueueSpec::new("late"), DeclareOptions::default())
                .await,
            Err(Error::ChannelClosed(None)),
        ));
        assert!(matches!(
            connection.ready().await,
            Err(Error::ConnectionClosed),
        ));
    }

    #[tokio::test]
    async fn weak_observers_do_not_outlive_their_owner() {
        // Given
        let broker = MemoryBroker::new();
        let (connection, _channel) = robust_channel(&broker).await;

        let strong_calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&strong_calls);
        connection.add_reconnect_observer(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let dropped_calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&dropped_calls);
        let dropped: Observer<ReconnectEvent> = Arc::new(move |_: &ReconnectEvent| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        connection.add_weak_reconnect_observer(&dropped);

        let weak_calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&weak_calls);
        let kept: Observer<ReconnectEvent> = Arc::new(move |_: &ReconnectEvent| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        connection.add_weak_reconnect_observer(&kept);

        let closures = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&closures);
        let on_close: Observer<Error> = Arc::new(move |_: &Error| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        connection.add_weak_close_observer(&on_close);

        // When
        drop(dropped);
        broker.disconnect_all();
        reconnected(&connection, 1).await;
        until("the reconnect is reported", || {
            weak_calls.load(Ordering::SeqCst) == 1
        })
        .await;

        // Then
        assert_eq!(strong_calls.load(Ordering::SeqCst), 1);
        assert_eq!(dropped_calls.load(Ordering::SeqCst), 0);

        // When
        drop(on_close);
        connection.close().await;

        // Then
        assert_eq!(closures.load(Ordering::SeqCst), 0);
        drop(kept);
    }
}
