//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name             | Description                                         | Key Methods              |
// |------------------|-----------------------------------------------------|--------------------------|
// | DeliveryConfig   | Queue, timeout and heartbeat settings               | default                  |
// | ResumeFrom       | Where a new connection starts reading               |                          |
// | DeliveryError    | Per-subscriber delivery failures                    |                          |
// | Subscription     | Handle to an attached subscriber                    | closed, finished         |
// | DeliveryManager  | Routes bus events to per-subscriber writer tasks    | start, attach, detach    |
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, timeout};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, warn};

use super::sink::{EventSink, SinkError};
use crate::domain::models::types::{ConnectionId, ConnectionState, EventId, OrderEvent, RestaurantId};
use crate::domain::services::events::{EventBus, ReplayGapError};
use crate::domain::services::registry::{
    CloseReason, RegistryError, SubscriberLink, SubscriberRegistry,
};

/// Settings for per-subscriber delivery
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Events queued per subscriber before it is considered lagging
    pub queue_capacity: usize,
    /// Upper bound for a single write to a subscriber
    pub write_timeout: Duration,
    /// Interval between heartbeats and idle checks
    pub heartbeat_interval: Duration,
    /// Close subscribers without client activity for this long
    pub idle_timeout: Option<Duration>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            write_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

/// Starting point of a new subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeFrom {
    /// Only events published after the connection is attached
    Live,
    /// Every event after the given id, replayed from the buffer first
    AfterEvent(EventId),
    /// Continue from the cursor of a previous connection, replacing it if it
    /// is still registered
    Connection(ConnectionId),
}

/// Errors on a single subscriber's delivery path. They never affect other
/// subscribers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("Delivery to {connection_id} failed: {source}")]
    Write {
        connection_id: ConnectionId,
        #[source]
        source: SinkError,
    },

    #[error("Delivery to {connection_id} timed out after {timeout:?}")]
    Timeout {
        connection_id: ConnectionId,
        timeout: Duration,
    },

    #[error(transparent)]
    ReplayGap(#[from] ReplayGapError),

    #[error("No cursor is known for connection {0}")]
    UnknownConnection(ConnectionId),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Type alias for Result with DeliveryError
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Handle to an attached subscriber.
#[derive(Debug)]
pub struct Subscription {
    connection_id: ConnectionId,
    link: SubscriberLink,
    writer: JoinHandle<()>,
}

impl Subscription {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Resolves once the subscriber has been asked to close, by either side.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.link.closed()
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    /// Id of the last event written to this subscriber.
    pub fn cursor(&self) -> EventId {
        self.link.cursor()
    }

    /// Waits for the writer task to finish its cleanup.
    pub async fn finished(self) {
        if let Err(e) = self.writer.await {
            error!("Writer task for {} failed: {}", self.connection_id, e);
        }
    }
}

/// Routes events from the bus to subscribers.
///
/// A single dispatcher task reads the bus in id order and queues each event
/// for every subscriber whose scope matches. Each subscriber has its own
/// bounded queue and writer task, so a slow or broken connection only ever
/// holds up itself.
pub struct DeliveryManager {
    event_bus: EventBus,
    registry: Arc<SubscriberRegistry>,
    config: DeliveryConfig,
}

impl DeliveryManager {
    pub fn new(event_bus: EventBus, registry: Arc<SubscriberRegistry>, config: DeliveryConfig) -> Self {
        Self {
            event_bus,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Starts the dispatcher task.
    ///
    /// The bus receiver is created before this returns, so every event
    /// published afterwards reaches the dispatcher. When `shutdown` fires,
    /// every subscriber is closed with `CloseReason::Shutdown`.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        // a seeded bus has evicted everything up to its seed; recovery starts there
        let (last_dispatched, receiver) = manager.event_bus.subscribe_after();

        tokio::spawn(async move {
            manager.dispatch_loop(receiver, last_dispatched, shutdown).await;
        })
    }

    async fn dispatch_loop(
        &self,
        mut receiver: broadcast::Receiver<Arc<OrderEvent>>,
        mut last_dispatched: EventId,
        shutdown: CancellationToken,
    ) {
        info!("Delivery dispatcher started after event {}", last_dispatched);

        let period = self.config.heartbeat_interval.max(Duration::from_millis(10));
        let mut idle_check = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = receiver.recv() => match received {
                    Ok(event) => {
                        // skip anything already recovered from the replay buffer
                        if event.event_id > last_dispatched {
                            self.dispatch(&event);
                            last_dispatched = event.event_id;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Dispatcher lagged behind the event bus by {} events", missed);
                        last_dispatched = self.recover(last_dispatched);
                    }
                    Err(RecvError::Closed) => {
                        info!("Event bus closed");
                        break;
                    }
                },
                _ = idle_check.tick(), if self.config.idle_timeout.is_some() => self.close_idle(),
            }
        }

        self.close_all(CloseReason::Shutdown);
        info!("Delivery dispatcher stopped");
    }

    /// Queues one event for every matching subscriber without waiting.
    fn dispatch(&self, event: &Arc<OrderEvent>) {
        let targets = self.registry.targets_for(event);
        debug!("Dispatching event {} to {} subscribers", event.event_id, targets.len());

        for (connection_id, link) in targets {
            match link.enqueue(Arc::clone(event)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Subscriber {} is lagging at event {}, closing it",
                        connection_id,
                        link.cursor()
                    );
                    link.close(CloseReason::Lagged);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Subscriber {} writer is gone", connection_id);
                    self.registry.unregister(connection_id);
                }
            }
        }
    }

    /// Re-reads events missed by a lagging dispatcher from the replay buffer.
    fn recover(&self, last_dispatched: EventId) -> EventId {
        match self.event_bus.replay_after(last_dispatched) {
            Ok(events) => {
                let mut last = last_dispatched;
                for event in events {
                    self.dispatch(&event);
                    last = event.event_id;
                }
                last
            }
            Err(gap) => {
                error!("Dispatcher lost events beyond the replay window: {}", gap);
                // every subscriber may have missed something; make them resume
                self.close_all(CloseReason::Lagged);
                gap.last_event_id
            }
        }
    }

    fn close_idle(&self) {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return;
        };
        for connection_id in self.registry.idle_since(idle_timeout) {
            info!("Subscriber {} idle for more than {:?}", connection_id, idle_timeout);
            self.close(connection_id, CloseReason::Idle);
        }
    }

    fn close_all(&self, reason: CloseReason) {
        for (_, link) in self.registry.links() {
            link.close(reason.clone());
        }
    }

    /// Attaches a new subscriber connection.
    pub async fn attach<S: EventSink>(
        &self,
        sink: S,
        scope_filter: Option<RestaurantId>,
        resume: ResumeFrom,
    ) -> DeliveryResult<Subscription> {
        self.attach_as(ConnectionId::new(), sink, scope_filter, resume).await
    }

    /// Attaches a new subscriber connection under a caller-chosen id.
    ///
    /// The subscriber is registered before the replay snapshot is taken, so
    /// no event can fall between replayed and live delivery; overlaps are
    /// dropped by the writer's cursor. When the replay window no longer
    /// covers the requested resume point, the client is told to resync and
    /// the connection is refused.
    pub async fn attach_as<S: EventSink>(
        &self,
        connection_id: ConnectionId,
        mut sink: S,
        scope_filter: Option<RestaurantId>,
        resume: ResumeFrom,
    ) -> DeliveryResult<Subscription> {
        let requested = match resume {
            ResumeFrom::Live => None,
            ResumeFrom::AfterEvent(event_id) => Some(event_id),
            ResumeFrom::Connection(previous) => match self.registry.retired_cursor(previous) {
                Some(cursor) => Some(cursor),
                // the old socket died without us noticing; take over its cursor
                None => match self.registry.link(previous) {
                    Some(stale) => {
                        let cursor = stale.cursor();
                        self.detach(previous);
                        info!(
                            "Connection {} replaces live connection {} at event {}",
                            connection_id, previous, cursor
                        );
                        Some(cursor)
                    }
                    None => {
                        warn!("Connection {} asked to resume unknown connection {}", connection_id, previous);
                        let reason = CloseReason::ResyncRequired(format!("unknown connection {}", previous));
                        self.close_sink(&mut sink, &reason).await;
                        return Err(DeliveryError::UnknownConnection(previous));
                    }
                },
            },
        };

        // read before registering so nothing published in between is lost
        let live_from = self.event_bus.last_event_id();

        let (queue, receiver) = mpsc::channel(self.config.queue_capacity.max(1));
        let link = SubscriberLink::new(queue);
        self.registry.register_as(connection_id, link.clone(), scope_filter.clone())?;

        let start = requested.unwrap_or(live_from);
        let (cursor, replay) = match self.event_bus.replay_after(start) {
            Ok(events) => (start, events),
            Err(gap) if requested.is_none() => {
                // the window moved past us while attaching; start from now
                debug!("Live attach for {} raced the replay window: {}", connection_id, gap);
                (gap.last_event_id, Vec::new())
            }
            Err(gap) => {
                warn!("Subscriber {} cannot resume: {}", connection_id, gap);
                let _ = self.registry.transition(connection_id, ConnectionState::Closed);
                self.registry.unregister(connection_id);
                let reason = CloseReason::ResyncRequired(gap.to_string());
                self.close_sink(&mut sink, &reason).await;
                return Err(gap.into());
            }
        };

        let replay: Vec<_> = replay
            .into_iter()
            .filter(|event| event.matches_scope(scope_filter.as_ref()))
            .collect();

        link.set_cursor(cursor);
        self.registry.transition(connection_id, ConnectionState::Open)?;

        info!(
            "Subscriber {} attached with scope {:?}, replaying {} events after {}",
            connection_id,
            scope_filter,
            replay.len(),
            cursor
        );

        let writer = Writer {
            connection_id,
            link: link.clone(),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
        };
        let writer = tokio::spawn(writer.run(sink, replay, receiver));

        Ok(Subscription {
            connection_id,
            link,
            writer,
        })
    }

    /// Handles a client-side disconnect.
    ///
    /// An open subscriber moves to `Draining`; its writer abandons or
    /// finishes the in-flight write, then the subscriber is closed and
    /// removed.
    pub fn detach(&self, connection_id: ConnectionId) {
        let Some(link) = self.registry.link(connection_id) else {
            return;
        };

        match self.registry.transition(connection_id, ConnectionState::Draining) {
            Ok(_) => debug!("Subscriber {} draining", connection_id),
            Err(e) => debug!("Subscriber {} not draining: {}", connection_id, e),
        }
        link.close(CloseReason::ClientClosed);
    }

    /// Asks a subscriber to close. Returns false for unknown connections.
    pub fn close(&self, connection_id: ConnectionId, reason: CloseReason) -> bool {
        match self.registry.link(connection_id) {
            Some(link) => {
                link.close(reason);
                true
            }
            None => false,
        }
    }

    async fn close_sink<S: EventSink>(&self, sink: &mut S, reason: &CloseReason) {
        match timeout(self.config.write_timeout, sink.close(reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Failed to send close frame: {}", e),
            Err(_) => debug!("Timed out sending close frame"),
        }
    }
}

/// Per-subscriber delivery task.
struct Writer {
    connection_id: ConnectionId,
    link: SubscriberLink,
    registry: Arc<SubscriberRegistry>,
    config: DeliveryConfig,
}

impl Writer {
    async fn run<S: EventSink>(
        self,
        mut sink: S,
        replay: Vec<Arc<OrderEvent>>,
        mut queue: mpsc::Receiver<Arc<OrderEvent>>,
    ) {
        let outcome = self.pump(&mut sink, replay, &mut queue).await;

        let reason = match &outcome {
            Ok(()) => {
                // closing on request: let the connection drain first
                let _ = self.registry.transition(self.connection_id, ConnectionState::Draining);
                self.link.close_reason().unwrap_or(CloseReason::ClientClosed)
            }
            Err(e) => {
                warn!("{}", e);
                self.link.close(CloseReason::DeliveryFailed(e.to_string()));
                self.link
                    .close_reason()
                    .unwrap_or_else(|| CloseReason::DeliveryFailed(e.to_string()))
            }
        };

        // queued events are dropped here; the client resumes from its cursor
        queue.close();

        match timeout(self.config.write_timeout, sink.close(&reason)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Close frame for {} not sent: {}", self.connection_id, e),
            Err(_) => debug!("Close frame for {} timed out", self.connection_id),
        }

        let _ = self.registry.transition(self.connection_id, ConnectionState::Closed);
        self.registry.unregister(self.connection_id);

        info!(
            "Subscriber {} closed ({}) at event {}",
            self.connection_id,
            reason.description(),
            self.link.cursor()
        );
    }

    /// Writes the replayed events, then live events, until closed.
    async fn pump<S: EventSink>(
        &self,
        sink: &mut S,
        replay: Vec<Arc<OrderEvent>>,
        queue: &mut mpsc::Receiver<Arc<OrderEvent>>,
    ) -> DeliveryResult<()> {
        for event in replay {
            if !self.deliver(sink, &event).await? {
                return Ok(());
            }
        }

        let period = self.config.heartbeat_interval.max(Duration::from_millis(10));
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;
                _ = self.link.closed() => return Ok(()),
                next = queue.recv() => match next {
                    Some(event) => {
                        if !self.deliver(sink, &event).await? {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
                _ = heartbeat.tick() => {
                    match timeout(self.config.write_timeout, sink.heartbeat()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(source)) => {
                            return Err(DeliveryError::Write { connection_id: self.connection_id, source });
                        }
                        Err(_) => {
                            return Err(DeliveryError::Timeout {
                                connection_id: self.connection_id,
                                timeout: self.config.write_timeout,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Writes one event unless it was already delivered.
    ///
    /// Returns `Ok(false)` when the subscriber was closed mid-write and the
    /// write was abandoned.
    async fn deliver<S: EventSink>(&self, sink: &mut S, event: &OrderEvent) -> DeliveryResult<bool> {
        if event.event_id <= self.link.cursor() {
            return Ok(true);
        }

        tokio::select! {
            _ = self.link.closed() => Ok(false),
            written = timeout(self.config.write_timeout, sink.send_event(event)) => match written {
                Ok(Ok(())) => {
                    self.link.set_cursor(event.event_id);
                    Ok(true)
                }
                Ok(Err(source)) => Err(DeliveryError::Write {
                    connection_id: self.connection_id,
                    source,
                }),
                Err(_) => Err(DeliveryError::Timeout {
                    connection_id: self.connection_id,
                    timeout: self.config.write_timeout,
                }),
            },
        }
    }
}
