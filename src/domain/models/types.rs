//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module defines the core data types that flow through the order relay,
// from the raw change-feed records up to the normalized events pushed to clients.
//
// | Section            | Description                                                      |
// |--------------------|------------------------------------------------------------------|
// | ENUMS              | Operation kinds and subscriber connection states.                |
// | STRUCTS            | OrderEvent, ChangeRecord, Checkpoint and identifier newtypes.    |
// | TESTS              | Contains unit tests for the defined types.                       |
//--------------------------------------------------------------------------------------------------

//--------------------------------------------------------------------------------------------------
//  ENUMS
//--------------------------------------------------------------------------------------------------
// | Name             | Description                                          |
// |------------------|------------------------------------------------------|
// | OperationKind    | Kind of order change carried by an OrderEvent.       |
// | ChangeOperation  | Raw operation reported by the change feed.           |
// | ConnectionState  | Lifecycle state of a subscriber connection.          |
//--------------------------------------------------------------------------------------------------
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally ordered identifier of an emitted order event.
pub type EventId = u64;

/// Kind of change an `OrderEvent` describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// A new order document was inserted.
    Created,
    /// An existing order document was modified or replaced.
    Updated,
}

/// Raw operation type as reported by the order store's change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Replace,
    Delete,
}

/// Lifecycle of a subscriber connection.
///
/// Valid transitions are `Connecting -> Open`, `Open -> Draining`,
/// `Open -> Closed`, `Draining -> Closed` and `Connecting -> Closed`
/// (a connection refused during replay never opens).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Open,
    Draining,
    Closed,
}

impl ConnectionState {
    /// Returns true when the state machine allows moving to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open)
                | (Self::Connecting, Self::Closed)
                | (Self::Open, Self::Draining)
                | (Self::Open, Self::Closed)
                | (Self::Draining, Self::Closed)
        )
    }

    /// Whether events should still be queued for a subscriber in this state.
    pub fn accepts_events(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

//--------------------------------------------------------------------------------------------------
//  STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name           | Description                                                  |
// |----------------|--------------------------------------------------------------|
// | RestaurantId   | Tenant identifier used as a subscriber scope filter.         |
// | ConnectionId   | Unique identifier of one live subscriber connection.         |
// | ResumeToken    | Opaque change-feed cursor.                                   |
// | ChangeRecord   | A committed write as delivered by the change feed.           |
// | OrderEvent     | Normalized, immutable order change.                          |
// | Checkpoint     | Persisted resume point of the change source.                 |
//--------------------------------------------------------------------------------------------------

/// Restaurant (tenant) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RestaurantId(pub String);

impl RestaurantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RestaurantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque cursor handed out by the change feed. Only the feed interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(pub String);

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A committed write on the order collection, as reported by the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Token identifying this change; resuming after it skips the change.
    pub resume_token: ResumeToken,
    /// Raw operation type
    pub operation: ChangeOperation,
    /// The `_id` of the affected document
    pub document_key: serde_json::Value,
    /// Post-image of the document. Absent for deletes.
    pub full_document: Option<serde_json::Value>,
    /// Commit time reported by the store
    pub committed_at: DateTime<Utc>,
}

/// A normalized order change. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    /// Strictly increasing, unique per event
    pub event_id: EventId,
    /// Identifier of the order document
    pub order_id: String,
    /// Whether the order was created or updated
    pub operation_kind: OperationKind,
    /// Tenant the order belongs to; used for scope filtering only
    pub restaurant_id: RestaurantId,
    /// Order fields needed by subscribers
    pub payload_snapshot: serde_json::Value,
    /// Commit time of the underlying change
    pub occurred_at: DateTime<Utc>,
}

impl OrderEvent {
    /// Returns true when a subscriber with the given scope should receive this event.
    ///
    /// A `None` scope is an all-tenant subscriber.
    pub fn matches_scope(&self, scope: Option<&RestaurantId>) -> bool {
        match scope {
            Some(restaurant_id) => *restaurant_id == self.restaurant_id,
            None => true,
        }
    }
}

/// Resume point of the change source, persisted after every emitted event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last acknowledged change-feed token
    pub resume_token: Option<ResumeToken>,
    /// Id of the last event emitted; the next event gets `last_event_id + 1`
    pub last_event_id: EventId,
}
