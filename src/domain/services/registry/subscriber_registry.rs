//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name                | Description                                        | Key Methods               |
// |---------------------|----------------------------------------------------|---------------------------|
// | CloseReason         | Why a subscriber connection is being closed        | code, description         |
// | SubscriberLink      | Shared handle to one subscriber's delivery context | enqueue, close, cursor    |
// | Subscriber          | Snapshot of a registered subscriber                |                           |
// | SubscriberRegistry  | Concurrent table of live subscribers               | register, unregister      |
// | RegistryError       | Registry failures                                  |                           |
//--------------------------------------------------------------------------------------------------

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

use crate::domain::models::types::{ConnectionId, ConnectionState, EventId, OrderEvent, RestaurantId};

/// Errors raised by the subscriber registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Subscriber {0} is not registered")]
    NotFound(ConnectionId),

    #[error("Subscriber {0} is already registered")]
    Duplicate(ConnectionId),

    #[error("Subscriber {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Type alias for Result with RegistryError
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Why a subscriber connection is closed. Carried to the client in the
/// WebSocket close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away
    ClientClosed,
    /// The server is shutting down
    Shutdown,
    /// The subscriber's queue overflowed; resume from the last cursor
    Lagged,
    /// No client activity within the idle timeout
    Idle,
    /// A write to the connection failed or timed out
    DeliveryFailed(String),
    /// The requested resume point is gone; re-read state through the CRUD API
    ResyncRequired(String),
}

impl CloseReason {
    /// WebSocket close code for this reason.
    pub fn code(&self) -> u16 {
        match self {
            Self::ClientClosed => 1000,
            Self::Shutdown => 1001,
            Self::DeliveryFailed(_) => 1011,
            Self::Idle => 4000,
            Self::Lagged => 4408,
            Self::ResyncRequired(_) => 4409,
        }
    }

    /// Short machine-readable reason sent with the close frame.
    pub fn description(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Shutdown => "shutdown",
            Self::DeliveryFailed(_) => "delivery_failed",
            Self::Idle => "idle_timeout",
            Self::Lagged => "lagged",
            Self::ResyncRequired(_) => "resync_required",
        }
    }
}

/// Shared handle to one subscriber's delivery context.
///
/// The dispatcher enqueues through it, the writer task drains the queue and
/// advances the cursor, and anyone may close it. Closing is idempotent and
/// the first reason wins.
#[derive(Debug, Clone)]
pub struct SubscriberLink {
    queue: mpsc::Sender<Arc<OrderEvent>>,
    cancel: CancellationToken,
    close_reason: Arc<Mutex<Option<CloseReason>>>,
    cursor: Arc<AtomicU64>,
}

impl SubscriberLink {
    pub fn new(queue: mpsc::Sender<Arc<OrderEvent>>) -> Self {
        Self {
            queue,
            cancel: CancellationToken::new(),
            close_reason: Arc::new(Mutex::new(None)),
            cursor: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queues an event without waiting. A full or closed queue is reported
    /// back to the caller.
    pub fn enqueue(
        &self,
        event: Arc<OrderEvent>,
    ) -> Result<(), mpsc::error::TrySendError<Arc<OrderEvent>>> {
        self.queue.try_send(event)
    }

    /// Requests the subscriber to close.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut current = self.close_reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the subscriber has been asked to close.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Id of the last event delivered to this subscriber.
    pub fn cursor(&self) -> EventId {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn set_cursor(&self, event_id: EventId) {
        self.cursor.store(event_id, Ordering::Release);
    }
}

/// Point-in-time view of a registered subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscriber {
    pub connection_id: ConnectionId,
    pub scope_filter: Option<RestaurantId>,
    pub last_delivered_event_id: EventId,
    pub connection_state: ConnectionState,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    link: SubscriberLink,
    scope: Option<RestaurantId>,
    state: ConnectionState,
    connected_at: DateTime<Utc>,
    last_activity: Instant,
}

impl Entry {
    fn snapshot(&self, connection_id: ConnectionId) -> Subscriber {
        Subscriber {
            connection_id,
            scope_filter: self.scope.clone(),
            last_delivered_event_id: self.link.cursor(),
            connection_state: self.state,
            connected_at: self.connected_at,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    subscribers: HashMap<ConnectionId, Entry>,
    /// Final cursors of recently closed connections, oldest first
    retired: HashMap<ConnectionId, EventId>,
    retired_order: VecDeque<ConnectionId>,
}

/// Table of live subscriber connections.
///
/// All reads and writes are serialized by one `RwLock`; no lock is held
/// across an await point.
#[derive(Debug)]
pub struct SubscriberRegistry {
    inner: RwLock<RegistryInner>,
    retired_capacity: usize,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    ///
    /// # Arguments
    /// * `retired_capacity` - How many closed connections keep their final
    ///   cursor for resumption by connection id
    pub fn new(retired_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            retired_capacity,
        }
    }

    /// Registers a new connection in the `Connecting` state.
    ///
    /// The scope filter is fixed for the life of the connection.
    pub fn register(&self, link: SubscriberLink, scope_filter: Option<RestaurantId>) -> ConnectionId {
        let mut inner = self.inner.write();
        let mut connection_id = ConnectionId::new();
        while inner.subscribers.contains_key(&connection_id) {
            connection_id = ConnectionId::new();
        }
        Self::insert(&mut inner, connection_id, link, scope_filter);
        connection_id
    }

    /// Registers a connection under an id chosen by the caller.
    pub fn register_as(
        &self,
        connection_id: ConnectionId,
        link: SubscriberLink,
        scope_filter: Option<RestaurantId>,
    ) -> RegistryResult<ConnectionId> {
        let mut inner = self.inner.write();
        if inner.subscribers.contains_key(&connection_id) {
            return Err(RegistryError::Duplicate(connection_id));
        }
        Self::insert(&mut inner, connection_id, link, scope_filter);
        Ok(connection_id)
    }

    fn insert(
        inner: &mut RegistryInner,
        connection_id: ConnectionId,
        link: SubscriberLink,
        scope_filter: Option<RestaurantId>,
    ) {
        debug!("Registering subscriber {} with scope {:?}", connection_id, scope_filter);
        inner.subscribers.insert(
            connection_id,
            Entry {
                link,
                scope: scope_filter,
                state: ConnectionState::Connecting,
                connected_at: Utc::now(),
                last_activity: Instant::now(),
            },
        );
    }

    /// Removes a connection and remembers its final cursor.
    ///
    /// The subscriber's link is closed so its delivery task winds down even
    /// if nobody else asked it to.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<Subscriber> {
        let mut inner = self.inner.write();
        let entry = inner.subscribers.remove(&connection_id)?;
        entry.link.close(CloseReason::ClientClosed);

        let mut subscriber = entry.snapshot(connection_id);
        subscriber.connection_state = ConnectionState::Closed;

        if self.retired_capacity > 0 {
            if inner.retired.insert(connection_id, subscriber.last_delivered_event_id).is_none() {
                inner.retired_order.push_back(connection_id);
            }
            while inner.retired_order.len() > self.retired_capacity {
                if let Some(oldest) = inner.retired_order.pop_front() {
                    inner.retired.remove(&oldest);
                }
            }
        }

        info!(
            "Subscriber {} unregistered at event {} ({} active)",
            connection_id,
            subscriber.last_delivered_event_id,
            inner.subscribers.len()
        );
        Some(subscriber)
    }

    /// Moves a subscriber to `next`, returning its previous state.
    pub fn transition(
        &self,
        connection_id: ConnectionId,
        next: ConnectionState,
    ) -> RegistryResult<ConnectionState> {
        let mut inner = self.inner.write();
        let entry = inner
            .subscribers
            .get_mut(&connection_id)
            .ok_or(RegistryError::NotFound(connection_id))?;

        let previous = entry.state;
        if !previous.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition {
                id: connection_id,
                from: previous,
                to: next,
            });
        }

        entry.state = next;
        debug!("Subscriber {} {:?} -> {:?}", connection_id, previous, next);
        Ok(previous)
    }

    /// Connections that receive events for `scope`.
    ///
    /// With `Some(restaurant)` these are the subscribers scoped to that
    /// restaurant plus all-tenant subscribers; with `None`, every subscriber
    /// still accepting events.
    pub fn list_active(&self, scope: Option<&RestaurantId>) -> HashSet<ConnectionId> {
        let inner = self.inner.read();
        inner
            .subscribers
            .iter()
            .filter(|(_, entry)| entry.state.accepts_events())
            .filter(|(_, entry)| match (scope, &entry.scope) {
                (Some(wanted), Some(filter)) => wanted == filter,
                _ => true,
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Links of every subscriber that should receive `event`.
    pub fn targets_for(&self, event: &OrderEvent) -> Vec<(ConnectionId, SubscriberLink)> {
        let inner = self.inner.read();
        inner
            .subscribers
            .iter()
            .filter(|(_, entry)| entry.state.accepts_events() && event.matches_scope(entry.scope.as_ref()))
            .map(|(id, entry)| (*id, entry.link.clone()))
            .collect()
    }

    /// Every registered link, whatever its state.
    pub fn links(&self) -> Vec<(ConnectionId, SubscriberLink)> {
        let inner = self.inner.read();
        inner
            .subscribers
            .iter()
            .map(|(id, entry)| (*id, entry.link.clone()))
            .collect()
    }

    pub fn link(&self, connection_id: ConnectionId) -> Option<SubscriberLink> {
        self.inner.read().subscribers.get(&connection_id).map(|entry| entry.link.clone())
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Subscriber> {
        self.inner
            .read()
            .subscribers
            .get(&connection_id)
            .map(|entry| entry.snapshot(connection_id))
    }

    /// Records client activity. Returns false for unknown connections.
    pub fn touch(&self, connection_id: ConnectionId) -> bool {
        match self.inner.write().subscribers.get_mut(&connection_id) {
            Some(entry) => {
                entry.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Open connections with no client activity for longer than `max_idle`.
    pub fn idle_since(&self, max_idle: Duration) -> Vec<ConnectionId> {
        let inner = self.inner.read();
        inner
            .subscribers
            .iter()
            .filter(|(_, entry)| entry.state == ConnectionState::Open)
            .filter(|(_, entry)| entry.last_activity.elapsed() > max_idle)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Final cursor of a recently closed connection.
    pub fn retired_cursor(&self, connection_id: ConnectionId) -> Option<EventId> {
        self.inner.read().retired.get(&connection_id).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
