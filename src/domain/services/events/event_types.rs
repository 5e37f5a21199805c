//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|------------------|
// | EventError              | Error types for event publication                 | error, from       |
// | ReplayGapError          | Resume point older than the replay window         | error             |
//--------------------------------------------------------------------------------------------------

use thiserror::Error;

use crate::domain::models::types::EventId;

/// Returned when a client asks to resume from a point the replay buffer no
/// longer covers. The client must fall back to a full resynchronization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "cannot replay after event {requested}: events up to {evicted_through} are no longer buffered (last event {last_event_id})"
)]
pub struct ReplayGapError {
    /// Cursor the client asked to resume after
    pub requested: EventId,
    /// Highest event id that has left the buffer
    pub evicted_through: EventId,
    /// Highest event id published so far
    pub last_event_id: EventId,
}

/// Errors that can occur in the event system
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// An event id did not advance past the last published id
    #[error("Event {event_id} is out of order (last published event is {last_event_id})")]
    OutOfOrder {
        event_id: EventId,
        last_event_id: EventId,
    },

    /// Requested resume point is outside the replay window
    #[error(transparent)]
    ReplayGap(#[from] ReplayGapError),
}

/// Type alias for Result with EventError
pub type EventResult<T> = Result<T, EventError>;
