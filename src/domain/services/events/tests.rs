#[cfg(test)]
pub mod tests {
    use crate::domain::models::types::{EventId, OperationKind, OrderEvent, RestaurantId};
    use crate::domain::services::events::{EventBus, EventError};
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    // Helper to create a test event
    fn create_test_event(event_id: EventId, order_id: &str, restaurant: &str) -> OrderEvent {
        OrderEvent {
            event_id,
            order_id: order_id.to_string(),
            operation_kind: OperationKind::Created,
            restaurant_id: RestaurantId::new(restaurant),
            payload_snapshot: json!({ "status": "pending", "total": 1800 }),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::default();
        let mut receiver = event_bus.subscribe();

        let event = create_test_event(1, "order-a", "r-1");
        event_bus.publish(event.clone()).unwrap();

        let received = receiver.recv().await.unwrap();
        assert_eq!(*received, event);
        assert_eq!(event_bus.last_event_id(), 1);
    }

    #[tokio::test]
    async fn test_publish_preserves_order_for_every_receiver() {
        let event_bus = EventBus::new(64, 64, 0);
        let mut first = event_bus.subscribe();
        let mut second = event_bus.clone().subscribe();

        for id in 1..=10 {
            event_bus.publish(create_test_event(id, "order-a", "r-1")).unwrap();
        }

        for receiver in [&mut first, &mut second] {
            let mut seen = Vec::new();
            while let Ok(event) = receiver.try_recv() {
                seen.push(event.event_id);
            }
            assert_eq!(seen, (1..=10).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_out_of_order_event_is_rejected() {
        let event_bus = EventBus::default();
        event_bus.publish(create_test_event(5, "order-a", "r-1")).unwrap();

        let duplicate = event_bus.publish(create_test_event(5, "order-b", "r-1"));
        assert_eq!(
            duplicate.unwrap_err(),
            EventError::OutOfOrder { event_id: 5, last_event_id: 5 }
        );

        let older = event_bus.publish(create_test_event(3, "order-c", "r-1"));
        assert!(matches!(older, Err(EventError::OutOfOrder { .. })));

        // nothing but the first event made it into the buffer
        assert_eq!(event_bus.buffered_len(), 1);
    }

    #[test]
    fn test_seeded_bus_requires_newer_ids() {
        let event_bus = EventBus::new(16, 16, 41);

        assert!(event_bus.publish(create_test_event(41, "order-a", "r-1")).is_err());
        assert!(event_bus.publish(create_test_event(42, "order-a", "r-1")).is_ok());
        assert_eq!(event_bus.last_event_id(), 42);
    }

    #[test]
    fn test_publish_without_receivers_still_buffers() {
        let event_bus = EventBus::new(16, 16, 0);
        assert_eq!(event_bus.subscriber_count(), 0);

        event_bus.publish(create_test_event(1, "order-a", "r-1")).unwrap();
        event_bus.publish(create_test_event(2, "order-b", "r-1")).unwrap();

        let replay = event_bus.replay_after(0).unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(event_bus.oldest_buffered_id(), Some(1));
    }

    #[test]
    fn test_replay_gap_when_window_exceeded() {
        let event_bus = EventBus::new(16, 5, 0);
        for id in 1..=7 {
            event_bus.publish(create_test_event(id, "order-a", "r-1")).unwrap();
        }

        let gap = event_bus.replay_after(0).unwrap_err();
        assert_eq!(gap.requested, 0);
        assert_eq!(gap.last_event_id, 7);

        let replay = event_bus.replay_after(4).unwrap();
        let ids: Vec<_> = replay.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_receiver_sees_only_events_after_subscribing() {
        let event_bus = EventBus::default();
        event_bus.publish(create_test_event(1, "order-a", "r-1")).unwrap();

        let mut receiver = event_bus.subscribe();
        assert_eq!(receiver.try_recv().unwrap_err(), TryRecvError::Empty);

        event_bus.publish(create_test_event(2, "order-a", "r-1")).unwrap();
        assert_eq!(receiver.recv().await.unwrap().event_id, 2);
    }

    #[tokio::test]
    async fn test_subscribe_after_reports_seed_and_later_events() {
        let event_bus = EventBus::new(16, 16, 100);

        let (last, mut receiver) = event_bus.subscribe_after();
        assert_eq!(last, 100);

        event_bus.publish(create_test_event(101, "order-a", "r-1")).unwrap();
        assert_eq!(receiver.recv().await.unwrap().event_id, 101);
        // everything after the reported id is still replayable
        assert_eq!(event_bus.replay_after(last).unwrap().len(), 1);
    }
}
