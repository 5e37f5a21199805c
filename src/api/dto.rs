//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name                 | Description                               | Key Methods         |
// |----------------------|-------------------------------------------|---------------------|
// | EventMessage         | Wire shape of one order event             | from                |
// | StreamParams         | Query parameters of the stream endpoint   | resume_from         |
// | StatsResponse        | Relay statistics                          |                     |
//--------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ApiError;
use crate::domain::models::types::{ConnectionId, EventId, OperationKind, OrderEvent};
use crate::domain::services::delivery::ResumeFrom;

/// Event message pushed to subscribers as a JSON text frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    /// Strictly increasing event id; clients resume after it
    pub event_id: EventId,
    /// Identifier of the changed order
    pub order_id: String,
    /// Created or updated
    pub operation_kind: OperationKind,
    /// Order document after the change
    pub payload_snapshot: serde_json::Value,
    /// Commit time of the change
    pub occurred_at: DateTime<Utc>,
}

impl From<&OrderEvent> for EventMessage {
    fn from(event: &OrderEvent) -> Self {
        Self {
            event_id: event.event_id,
            order_id: event.order_id.clone(),
            operation_kind: event.operation_kind,
            payload_snapshot: event.payload_snapshot.clone(),
            occurred_at: event.occurred_at,
        }
    }
}

/// Query parameters accepted by `GET /orders/stream`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamParams {
    /// Credential, for clients that cannot set an Authorization header
    pub token: Option<String>,
    /// Resume after this event id
    pub last_event_id: Option<EventId>,
    /// Resume where this earlier connection stopped
    pub connection_id: Option<Uuid>,
}

impl StreamParams {
    /// Resolves the resume point. Both resume parameters at once is an error.
    pub fn resume_from(&self) -> Result<ResumeFrom, ApiError> {
        match (self.last_event_id, self.connection_id) {
            (Some(_), Some(_)) => Err(ApiError::BadRequest(
                "last_event_id and connection_id cannot be combined".to_string(),
            )),
            (Some(event_id), None) => Ok(ResumeFrom::AfterEvent(event_id)),
            (None, Some(connection_id)) => Ok(ResumeFrom::Connection(ConnectionId(connection_id))),
            (None, None) => Ok(ResumeFrom::Live),
        }
    }
}

/// Response for `GET /stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    /// Registered subscriber connections
    pub active_subscribers: usize,
    /// Id of the most recent event
    pub last_event_id: EventId,
    /// Events currently held for replay
    pub buffered_events: usize,
    /// Oldest event id still replayable
    pub oldest_buffered_id: Option<EventId>,
    /// Maximum number of replayable events
    pub replay_capacity: usize,
    /// Seconds since the server started
    pub uptime_seconds: i64,
}
