//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name          | Description                                   | Key Methods                   |
// |---------------|-----------------------------------------------|-------------------------------|
// | ReplayBuffer  | Bounded ring of the most recent order events  | push, events_after            |
//--------------------------------------------------------------------------------------------------

use std::collections::VecDeque;
use std::sync::Arc;

use crate::domain::models::types::{EventId, OrderEvent};

use super::event_types::ReplayGapError;

/// Bounded ring buffer holding the last `capacity` published events.
///
/// Eviction is oldest-first. The buffer remembers the highest id it has ever
/// evicted (or the id it was seeded with), which is what decides whether a
/// resume cursor can still be served without a gap.
#[derive(Debug)]
pub struct ReplayBuffer {
    events: VecDeque<Arc<OrderEvent>>,
    capacity: usize,
    /// Every event with an id at or below this one is unavailable.
    evicted_through: EventId,
    last_event_id: EventId,
}

impl ReplayBuffer {
    /// Creates an empty buffer.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of events retained (at least 1)
    /// * `last_event_id` - Id of the last event emitted before this buffer
    ///   existed, typically restored from a checkpoint
    pub fn new(capacity: usize, last_event_id: EventId) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            evicted_through: last_event_id,
            last_event_id,
        }
    }

    /// Appends an event, evicting the oldest one when full.
    ///
    /// The caller guarantees ids are strictly increasing.
    pub fn push(&mut self, event: Arc<OrderEvent>) -> Option<Arc<OrderEvent>> {
        self.last_event_id = event.event_id;
        self.events.push_back(event);

        if self.events.len() > self.capacity {
            let evicted = self.events.pop_front();
            if let Some(evicted) = &evicted {
                self.evicted_through = evicted.event_id;
            }
            evicted
        } else {
            None
        }
    }

    /// Returns every buffered event with an id greater than `cursor`, in order.
    ///
    /// Fails when some event after `cursor` has already been evicted, or when
    /// the cursor is ahead of anything ever published.
    pub fn events_after(&self, cursor: EventId) -> Result<Vec<Arc<OrderEvent>>, ReplayGapError> {
        if cursor < self.evicted_through || cursor > self.last_event_id {
            return Err(ReplayGapError {
                requested: cursor,
                evicted_through: self.evicted_through,
                last_event_id: self.last_event_id,
            });
        }

        // ids are sorted, so everything past the partition point is newer
        let start = self.events.partition_point(|event| event.event_id <= cursor);
        Ok(self.events.iter().skip(start).cloned().collect())
    }

    pub fn last_event_id(&self) -> EventId {
        self.last_event_id
    }

    pub fn oldest_event_id(&self) -> Option<EventId> {
        self.events.front().map(|event| event.event_id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::types::{OperationKind, RestaurantId};
    use chrono::Utc;
    use serde_json::json;

    fn event(id: EventId) -> Arc<OrderEvent> {
        Arc::new(OrderEvent {
            event_id: id,
            order_id: format!("order-{id}"),
            operation_kind: OperationKind::Created,
            restaurant_id: RestaurantId::new("r-1"),
            payload_snapshot: json!({}),
            occurred_at: Utc::now(),
        })
    }

    fn ids(events: &[Arc<OrderEvent>]) -> Vec<EventId> {
        events.iter().map(|e| e.event_id).collect()
    }

    #[test]
    fn test_evicts_oldest_first() {
        let mut buffer = ReplayBuffer::new(3, 0);
        for id in 1..=3 {
            assert!(buffer.push(event(id)).is_none());
        }

        let evicted = buffer.push(event(4)).unwrap();
        assert_eq!(evicted.event_id, 1);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.oldest_event_id(), Some(2));
        assert_eq!(buffer.last_event_id(), 4);
    }

    #[test]
    fn test_events_after_cursor() {
        let mut buffer = ReplayBuffer::new(5, 0);
        for id in 1..=5 {
            buffer.push(event(id));
        }

        assert_eq!(ids(&buffer.events_after(0).unwrap()), vec![1, 2, 3, 4, 5]);
        assert_eq!(ids(&buffer.events_after(3).unwrap()), vec![4, 5]);
        assert!(buffer.events_after(5).unwrap().is_empty());
    }

    #[test]
    fn test_gap_after_eviction() {
        let mut buffer = ReplayBuffer::new(5, 0);
        for id in 1..=7 {
            buffer.push(event(id));
        }

        let err = buffer.events_after(0).unwrap_err();
        assert_eq!(err.requested, 0);
        assert_eq!(err.evicted_through, 2);

        // cursor 2 needs 3..=7, all still buffered
        assert_eq!(ids(&buffer.events_after(2).unwrap()), vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_seeded_buffer() {
        let buffer = ReplayBuffer::new(4, 10);

        assert!(buffer.is_empty());
        assert!(buffer.events_after(10).unwrap().is_empty());
        assert!(buffer.events_after(9).is_err());
        assert!(buffer.events_after(11).is_err());
    }
}
