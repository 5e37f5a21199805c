//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the single ingestion point for order events using tokio's broadcast
// channel, backed by a bounded replay buffer for clients resuming after a reconnect.
//
// | Component     | Description                                                 |
// |---------------|-------------------------------------------------------------|
// | EventBus      | Central event bus for publishing and subscribing to events  |
//
//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name          | Description                                   | Key Methods                   |
// |---------------|-----------------------------------------------|-------------------------------|
// | EventBus      | Ordered event publishing component            | publish, subscribe, replay    |
//
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use super::event_types::{EventError, EventResult, ReplayGapError};
use super::replay_buffer::ReplayBuffer;
use crate::domain::models::types::{EventId, OrderEvent};

/// Central event bus for order events.
///
/// The `EventBus` accepts events from a single producer (the change source
/// adapter), enforces that event ids strictly increase, records each event
/// in a bounded replay buffer and broadcasts it to live receivers.
///
/// Recording and broadcasting happen under the buffer's write lock, so a
/// reader that takes a replay snapshot after subscribing never misses an
/// event that sits between the two.
///
/// # Examples
///
/// ```
/// use order_relay::domain::services::events::EventBus;
///
/// // Channel of 1024, keep the last 256 events for replay, nothing emitted yet
/// let event_bus = EventBus::new(1024, 256, 0);
/// let mut receiver = event_bus.subscribe();
/// assert_eq!(event_bus.subscriber_count(), 1);
/// assert!(receiver.try_recv().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct EventBus {
    /// Channel for broadcasting events to live receivers
    sender: broadcast::Sender<Arc<OrderEvent>>,
    /// Recently published events, shared by every clone of the bus
    buffer: Arc<RwLock<ReplayBuffer>>,
    /// Capacity of the broadcast channel
    capacity: usize,
}

impl EventBus {
    /// Creates a new event bus.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Broadcast channel capacity; a receiver falling further
    ///   behind than this observes a lag.
    /// * `replay_capacity` - Number of events kept for replay.
    /// * `last_event_id` - Id of the last event emitted by a previous run.
    ///   The first event published must have a greater id.
    pub fn new(capacity: usize, replay_capacity: usize, last_event_id: EventId) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        info!(
            "Created new EventBus with capacity: {}, replay capacity: {}, last event id: {}",
            capacity, replay_capacity, last_event_id
        );
        Self {
            sender,
            buffer: Arc::new(RwLock::new(ReplayBuffer::new(replay_capacity, last_event_id))),
            capacity,
        }
    }

    /// Publishes an event to all live receivers and records it for replay.
    ///
    /// Publishing with no receivers is not an error; the event is still
    /// buffered.
    ///
    /// # Returns
    ///
    /// * `Ok(Arc<OrderEvent>)` - The shared, now immutable event.
    /// * `Err(EventError::OutOfOrder)` - If the id does not advance past the
    ///   last published id.
    pub fn publish(&self, event: OrderEvent) -> EventResult<Arc<OrderEvent>> {
        let mut buffer = self.buffer.write();

        if event.event_id <= buffer.last_event_id() {
            return Err(EventError::OutOfOrder {
                event_id: event.event_id,
                last_event_id: buffer.last_event_id(),
            });
        }

        let event = Arc::new(event);
        if let Some(evicted) = buffer.push(Arc::clone(&event)) {
            trace!("Evicted event {} from replay buffer", evicted.event_id);
        }

        // A send error only means nobody is listening right now
        if self.sender.send(Arc::clone(&event)).is_err() {
            debug!("No receivers for event {}", event.event_id);
        } else {
            debug!("Published event {} for order {}", event.event_id, event.order_id);
        }

        Ok(event)
    }

    /// Creates a new receiver for events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<OrderEvent>> {
        debug!("New receiver added to EventBus (total: {})", self.sender.receiver_count() + 1);
        self.sender.subscribe()
    }

    /// Creates a receiver together with the id of the last event it will
    /// not see.
    ///
    /// Both are taken under the buffer lock, so the receiver yields exactly
    /// the events after the returned id.
    pub fn subscribe_after(&self) -> (EventId, broadcast::Receiver<Arc<OrderEvent>>) {
        let buffer = self.buffer.read();
        (buffer.last_event_id(), self.subscribe())
    }

    /// Returns the buffered events with an id greater than `cursor`.
    ///
    /// # Returns
    ///
    /// * `Ok(events)` - Every event after the cursor, in id order.
    /// * `Err(ReplayGapError)` - If part of the requested range was evicted.
    pub fn replay_after(&self, cursor: EventId) -> Result<Vec<Arc<OrderEvent>>, ReplayGapError> {
        self.buffer.read().events_after(cursor)
    }

    /// Id of the most recently published event.
    pub fn last_event_id(&self) -> EventId {
        self.buffer.read().last_event_id()
    }

    /// Id of the oldest event still available for replay.
    pub fn oldest_buffered_id(&self) -> Option<EventId> {
        self.buffer.read().oldest_event_id()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.read().len()
    }

    pub fn replay_capacity(&self) -> usize {
        self.buffer.read().capacity()
    }

    /// Returns the current number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Returns the capacity of the broadcast channel.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    /// Creates a bus with a channel of 1024 events and a replay window of 1024.
    fn default() -> Self {
        Self::new(1024, 1024, 0)
    }
}
