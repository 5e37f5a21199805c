use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::types::OrderEvent;
use crate::domain::services::registry::CloseReason;

/// Errors reported by a subscriber's connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The peer is gone
    #[error("connection closed")]
    Closed,

    #[error("write failed: {0}")]
    Write(String),
}

/// Write half of one subscriber connection.
///
/// Each sink is driven by exactly one delivery task, so methods take
/// `&mut self` and calls never overlap.
#[async_trait]
pub trait EventSink: Send + 'static {
    /// Writes one event to the client.
    async fn send_event(&mut self, event: &OrderEvent) -> Result<(), SinkError>;

    /// Sends a keep-alive ping. Sinks without one do nothing.
    async fn heartbeat(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Tells the client why the connection ends and closes it.
    async fn close(&mut self, reason: &CloseReason) -> Result<(), SinkError>;
}
