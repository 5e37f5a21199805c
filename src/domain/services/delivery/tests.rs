use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::domain::models::types::{EventId, OperationKind, OrderEvent, RestaurantId};
use crate::domain::services::delivery::{
    DeliveryConfig, DeliveryError, DeliveryManager, EventSink, ResumeFrom, SinkError,
};
use crate::domain::services::events::EventBus;
use crate::domain::services::registry::{CloseReason, SubscriberRegistry};

#[derive(Debug, Clone, PartialEq)]
enum Frame {
    Event(EventId),
    Heartbeat,
    Close(u16),
}

/// Sink that reports every frame on a channel
struct RecordingSink {
    frames: mpsc::UnboundedSender<Frame>,
    delay: Duration,
    fail_after: Option<usize>,
    stall_after: Option<usize>,
    written: usize,
}

impl RecordingSink {
    fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (frames, rx) = mpsc::unbounded_channel();
        let sink = Self {
            frames,
            delay: Duration::ZERO,
            fail_after: None,
            stall_after: None,
            written: 0,
        };
        (sink, rx)
    }

    fn slow(delay: Duration) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (mut sink, rx) = Self::new();
        sink.delay = delay;
        (sink, rx)
    }

    fn failing_after(writes: usize) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (mut sink, rx) = Self::new();
        sink.fail_after = Some(writes);
        (sink, rx)
    }

    /// Writes hang forever after `writes` events, like a dead peer.
    fn stalling_after(writes: usize) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (mut sink, rx) = Self::new();
        sink.stall_after = Some(writes);
        (sink, rx)
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn send_event(&mut self, event: &OrderEvent) -> Result<(), SinkError> {
        if self.fail_after == Some(self.written) {
            return Err(SinkError::Closed);
        }
        if self.stall_after == Some(self.written) {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.written += 1;
        self.frames
            .send(Frame::Event(event.event_id))
            .map_err(|_| SinkError::Closed)
    }

    async fn heartbeat(&mut self) -> Result<(), SinkError> {
        self.frames.send(Frame::Heartbeat).map_err(|_| SinkError::Closed)
    }

    async fn close(&mut self, reason: &CloseReason) -> Result<(), SinkError> {
        self.frames
            .send(Frame::Close(reason.code()))
            .map_err(|_| SinkError::Closed)
    }
}

fn order_event(event_id: EventId, restaurant: &str) -> OrderEvent {
    OrderEvent {
        event_id,
        order_id: format!("order-{}", event_id),
        operation_kind: OperationKind::Created,
        restaurant_id: RestaurantId::new(restaurant),
        payload_snapshot: json!({ "restaurantId": restaurant, "status": "pending" }),
        occurred_at: Utc::now(),
    }
}

fn setup(replay_capacity: usize, config: DeliveryConfig) -> (EventBus, Arc<DeliveryManager>, CancellationToken) {
    let bus = EventBus::new(1024, replay_capacity, 0);
    let registry = Arc::new(SubscriberRegistry::default());
    let manager = Arc::new(DeliveryManager::new(bus.clone(), registry, config));
    let shutdown = CancellationToken::new();
    manager.start(shutdown.clone());
    (bus, manager, shutdown)
}

/// Collects event ids until `count` arrived, ignoring heartbeats.
async fn next_events(rx: &mut mpsc::UnboundedReceiver<Frame>, count: usize) -> Vec<EventId> {
    let mut ids = Vec::new();
    while ids.len() < count {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Frame::Event(id))) => ids.push(id),
            Ok(Some(Frame::Heartbeat)) => {}
            Ok(Some(Frame::Close(code))) => panic!("closed with {} after {:?}", code, ids),
            Ok(None) | Err(_) => panic!("only received {:?}", ids),
        }
    }
    ids
}

/// Waits for the close frame, returning events seen before it.
async fn until_close(rx: &mut mpsc::UnboundedReceiver<Frame>) -> (Vec<EventId>, u16) {
    let mut ids = Vec::new();
    loop {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Frame::Event(id))) => ids.push(id),
            Ok(Some(Frame::Heartbeat)) => {}
            Ok(Some(Frame::Close(code))) => return (ids, code),
            Ok(None) | Err(_) => panic!("no close frame after {:?}", ids),
        }
    }
}

#[tokio::test]
async fn test_events_arrive_in_publish_order() {
    let (bus, manager, _shutdown) = setup(64, DeliveryConfig::default());
    let (sink, mut rx) = RecordingSink::new();
    let subscription = manager.attach(sink, None, ResumeFrom::Live).await.unwrap();

    for id in 1..=20 {
        bus.publish(order_event(id, "r-1")).unwrap();
    }

    assert_eq!(next_events(&mut rx, 20).await, (1..=20).collect::<Vec<_>>());
    assert_eq!(subscription.cursor(), 20);
}

#[tokio::test]
async fn test_scoped_subscribers_only_see_their_restaurant() {
    let (bus, manager, _shutdown) = setup(64, DeliveryConfig::default());

    let (t1_sink, mut t1) = RecordingSink::new();
    let (t2_sink, mut t2) = RecordingSink::new();
    let (admin_sink, mut admin) = RecordingSink::new();
    manager.attach(t1_sink, Some(RestaurantId::new("T1")), ResumeFrom::Live).await.unwrap();
    manager.attach(t2_sink, Some(RestaurantId::new("T2")), ResumeFrom::Live).await.unwrap();
    manager.attach(admin_sink, None, ResumeFrom::Live).await.unwrap();

    bus.publish(order_event(1, "T1")).unwrap();
    bus.publish(order_event(2, "T2")).unwrap();
    bus.publish(order_event(3, "T1")).unwrap();

    assert_eq!(next_events(&mut t1, 2).await, vec![1, 3]);
    assert_eq!(next_events(&mut t2, 1).await, vec![2]);
    assert_eq!(next_events(&mut admin, 3).await, vec![1, 2, 3]);

    // nothing further for the scoped subscribers
    assert!(timeout(Duration::from_millis(100), t2.recv()).await.is_err());
}

#[tokio::test]
async fn test_resume_after_cursor_replays_missed_events_once() {
    let (bus, manager, _shutdown) = setup(64, DeliveryConfig::default());

    for id in 1..=6 {
        bus.publish(order_event(id, "r-1")).unwrap();
    }

    let (sink, mut rx) = RecordingSink::new();
    manager.attach(sink, None, ResumeFrom::AfterEvent(3)).await.unwrap();
    bus.publish(order_event(7, "r-1")).unwrap();

    assert_eq!(next_events(&mut rx, 4).await, vec![4, 5, 6, 7]);
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_resume_by_connection_id_uses_final_cursor() {
    let (bus, manager, _shutdown) = setup(64, DeliveryConfig::default());

    let (sink, mut rx) = RecordingSink::new();
    let first = manager.attach(sink, None, ResumeFrom::Live).await.unwrap();
    let first_id = first.connection_id();

    for id in 1..=3 {
        bus.publish(order_event(id, "r-1")).unwrap();
    }
    assert_eq!(next_events(&mut rx, 3).await, vec![1, 2, 3]);

    manager.detach(first_id);
    first.finished().await;
    assert!(manager.registry().get(first_id).is_none());
    assert_eq!(manager.registry().retired_cursor(first_id), Some(3));

    bus.publish(order_event(4, "r-1")).unwrap();
    bus.publish(order_event(5, "r-1")).unwrap();

    let (sink, mut rx) = RecordingSink::new();
    manager
        .attach(sink, None, ResumeFrom::Connection(first_id))
        .await
        .unwrap();
    assert_eq!(next_events(&mut rx, 2).await, vec![4, 5]);
}

#[tokio::test]
async fn test_resume_by_live_connection_id_takes_over_its_cursor() {
    let (bus, manager, _shutdown) = setup(64, DeliveryConfig::default());

    // the peer vanished after event 3 but the server has not noticed yet
    let (stale_sink, mut stale_rx) = RecordingSink::stalling_after(3);
    let stale = manager.attach(stale_sink, None, ResumeFrom::Live).await.unwrap();
    let stale_id = stale.connection_id();

    for id in 1..=3 {
        bus.publish(order_event(id, "r-1")).unwrap();
    }
    assert_eq!(next_events(&mut stale_rx, 3).await, vec![1, 2, 3]);
    timeout(Duration::from_secs(2), async {
        while stale.cursor() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cursor never reached 3");

    bus.publish(order_event(4, "r-1")).unwrap();
    assert!(manager.registry().get(stale_id).is_some());

    let (sink, mut rx) = RecordingSink::new();
    let replacement = manager
        .attach(sink, None, ResumeFrom::Connection(stale_id))
        .await
        .unwrap();
    assert_ne!(replacement.connection_id(), stale_id);
    assert_eq!(next_events(&mut rx, 1).await, vec![4]);

    let (_, code) = until_close(&mut stale_rx).await;
    assert_eq!(code, 1000);
    stale.finished().await;
    assert!(manager.registry().get(stale_id).is_none());

    bus.publish(order_event(5, "r-1")).unwrap();
    assert_eq!(next_events(&mut rx, 1).await, vec![5]);
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_dispatcher_on_seeded_bus_recovers_burst_from_replay_buffer() {
    // restarted at event 100 with a tiny broadcast channel
    let bus = EventBus::new(2, 64, 100);
    let registry = Arc::new(SubscriberRegistry::default());
    let manager = Arc::new(DeliveryManager::new(bus.clone(), registry, DeliveryConfig::default()));
    let _dispatcher = manager.start(CancellationToken::new());

    let (sink, mut rx) = RecordingSink::new();
    manager.attach(sink, None, ResumeFrom::Live).await.unwrap();

    // published without yielding, so the dispatcher lags the channel
    for id in 101..=105 {
        bus.publish(order_event(id, "r-1")).unwrap();
    }

    assert_eq!(next_events(&mut rx, 5).await, vec![101, 102, 103, 104, 105]);
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_resume_beyond_replay_window_requires_resync() {
    let (bus, manager, _shutdown) = setup(5, DeliveryConfig::default());

    for id in 1..=7 {
        bus.publish(order_event(id, "r-1")).unwrap();
    }

    let (sink, mut rx) = RecordingSink::new();
    let result = manager.attach(sink, None, ResumeFrom::AfterEvent(0)).await;

    match result {
        Err(DeliveryError::ReplayGap(gap)) => {
            assert_eq!(gap.requested, 0);
            assert_eq!(gap.evicted_through, 2);
        }
        other => panic!("expected a replay gap, got {:?}", other.map(|s| s.connection_id())),
    }
    assert_eq!(rx.recv().await, Some(Frame::Close(4409)));
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn test_unknown_connection_requires_resync() {
    let (_bus, manager, _shutdown) = setup(64, DeliveryConfig::default());
    let unknown = crate::domain::models::types::ConnectionId::new();

    let (sink, mut rx) = RecordingSink::new();
    let result = manager.attach(sink, None, ResumeFrom::Connection(unknown)).await;

    assert!(matches!(result, Err(DeliveryError::UnknownConnection(id)) if id == unknown));
    assert_eq!(rx.recv().await, Some(Frame::Close(4409)));
}

#[tokio::test]
async fn test_slow_subscriber_does_not_hold_up_others() {
    let (bus, manager, _shutdown) = setup(64, DeliveryConfig::default());

    let (slow_sink, _slow_rx) = RecordingSink::slow(Duration::from_secs(5));
    let (fast_sink, mut fast_rx) = RecordingSink::new();
    manager.attach(slow_sink, None, ResumeFrom::Live).await.unwrap();
    manager.attach(fast_sink, None, ResumeFrom::Live).await.unwrap();

    for id in 1..=5 {
        bus.publish(order_event(id, "r-1")).unwrap();
    }

    let received = timeout(Duration::from_millis(500), next_events(&mut fast_rx, 5))
        .await
        .expect("fast subscriber was held up");
    assert_eq!(received, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_write_failure_removes_only_that_subscriber() {
    let (bus, manager, _shutdown) = setup(64, DeliveryConfig::default());

    let (broken_sink, mut broken_rx) = RecordingSink::failing_after(1);
    let (healthy_sink, mut healthy_rx) = RecordingSink::new();
    let broken = manager.attach(broken_sink, None, ResumeFrom::Live).await.unwrap();
    manager.attach(healthy_sink, None, ResumeFrom::Live).await.unwrap();
    let broken_id = broken.connection_id();

    for id in 1..=4 {
        bus.publish(order_event(id, "r-1")).unwrap();
    }

    let (delivered, code) = until_close(&mut broken_rx).await;
    assert_eq!(delivered, vec![1]);
    assert_eq!(code, 1011);

    broken.finished().await;
    assert!(manager.registry().get(broken_id).is_none());
    assert_eq!(manager.registry().retired_cursor(broken_id), Some(1));

    assert_eq!(next_events(&mut healthy_rx, 4).await, vec![1, 2, 3, 4]);
    assert_eq!(manager.registry().len(), 1);
}

#[tokio::test]
async fn test_full_queue_closes_subscriber_as_lagged() {
    let config = DeliveryConfig {
        queue_capacity: 2,
        ..DeliveryConfig::default()
    };
    let (bus, manager, _shutdown) = setup(64, config);

    let (stuck_sink, mut stuck_rx) = RecordingSink::slow(Duration::from_secs(5));
    let (healthy_sink, mut healthy_rx) = RecordingSink::new();
    let stuck = manager.attach(stuck_sink, None, ResumeFrom::Live).await.unwrap();
    manager.attach(healthy_sink, None, ResumeFrom::Live).await.unwrap();

    for id in 1..=10 {
        bus.publish(order_event(id, "r-1")).unwrap();
    }

    let (_, code) = until_close(&mut stuck_rx).await;
    assert_eq!(code, 4408);
    stuck.finished().await;

    assert_eq!(next_events(&mut healthy_rx, 10).await, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_detach_drains_then_removes_subscriber() {
    let (bus, manager, _shutdown) = setup(64, DeliveryConfig::default());

    let (sink, mut rx) = RecordingSink::new();
    let subscription = manager.attach(sink, None, ResumeFrom::Live).await.unwrap();
    let connection_id = subscription.connection_id();

    bus.publish(order_event(1, "r-1")).unwrap();
    assert_eq!(next_events(&mut rx, 1).await, vec![1]);

    manager.detach(connection_id);
    assert!(subscription.is_closed());

    let (_, code) = until_close(&mut rx).await;
    assert_eq!(code, 1000);
    subscription.finished().await;

    assert!(manager.registry().get(connection_id).is_none());
    bus.publish(order_event(2, "r-1")).unwrap();
    assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_idle_subscribers_are_closed() {
    let config = DeliveryConfig {
        heartbeat_interval: Duration::from_millis(20),
        idle_timeout: Some(Duration::from_millis(60)),
        ..DeliveryConfig::default()
    };
    let (_bus, manager, _shutdown) = setup(64, config);

    let (sink, mut rx) = RecordingSink::new();
    let subscription = manager.attach(sink, None, ResumeFrom::Live).await.unwrap();

    let (_, code) = until_close(&mut rx).await;
    assert_eq!(code, 4000);
    subscription.finished().await;
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn test_heartbeats_are_sent_while_quiet() {
    let config = DeliveryConfig {
        heartbeat_interval: Duration::from_millis(20),
        idle_timeout: None,
        ..DeliveryConfig::default()
    };
    let (_bus, manager, _shutdown) = setup(64, config);

    let (sink, mut rx) = RecordingSink::new();
    manager.attach(sink, None, ResumeFrom::Live).await.unwrap();

    let frame = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(frame, Some(Frame::Heartbeat));
}

#[tokio::test]
async fn test_shutdown_closes_every_subscriber() {
    let (_bus, manager, shutdown) = setup(64, DeliveryConfig::default());

    let (first_sink, mut first_rx) = RecordingSink::new();
    let (second_sink, mut second_rx) = RecordingSink::new();
    let first = manager.attach(first_sink, None, ResumeFrom::Live).await.unwrap();
    let second = manager.attach(second_sink, Some(RestaurantId::new("r-2")), ResumeFrom::Live).await.unwrap();

    shutdown.cancel();

    assert_eq!(until_close(&mut first_rx).await.1, 1001);
    assert_eq!(until_close(&mut second_rx).await.1, 1001);
    first.finished().await;
    second.finished().await;
    assert!(manager.registry().is_empty());
}
