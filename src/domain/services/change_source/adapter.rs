//! Watch loop that turns committed order changes into `OrderEvent`s.
//!
//! The adapter owns the event id sequence. Every emitted event is followed by
//! a checkpoint save, so after a restart the watch resumes after the last
//! acknowledged token and ids keep increasing from where they stopped.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::{BackoffConfig, ExponentialBackoff};
use super::{ChangeCursor, ChangeFeed, ChangeSourceError, CheckpointStore, SourceResult};
use crate::domain::models::types::{
    ChangeOperation, ChangeRecord, Checkpoint, EventId, OperationKind, OrderEvent, RestaurantId,
};
use crate::domain::services::events::EventBus;

/// Document fields holding the owning restaurant, in lookup order.
const RESTAURANT_FIELDS: [&str; 2] = ["restaurantId", "restaurant"];

/// Single long-lived watch over the order collection.
pub struct ChangeSourceAdapter {
    feed: Arc<dyn ChangeFeed>,
    checkpoints: Arc<dyn CheckpointStore>,
    event_bus: EventBus,
    checkpoint: Checkpoint,
    backoff: BackoffConfig,
}

impl ChangeSourceAdapter {
    /// Creates an adapter resuming from `checkpoint`.
    ///
    /// # Arguments
    /// * `feed` - The order store's change feed
    /// * `checkpoints` - Where the resume point is persisted
    /// * `event_bus` - Bus seeded with `checkpoint.last_event_id`
    /// * `checkpoint` - Resume point loaded at startup (default for a fresh start)
    /// * `backoff` - Retry policy for transient feed failures
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        checkpoints: Arc<dyn CheckpointStore>,
        event_bus: EventBus,
        checkpoint: Checkpoint,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            feed,
            checkpoints,
            event_bus,
            checkpoint,
            backoff,
        }
    }

    /// The resume point reached so far.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Runs the watch loop until the feed ends, `shutdown` fires, or a fatal
    /// error occurs.
    ///
    /// Transient errors reopen the watch after a backoff delay, resuming
    /// after the last acknowledged token. Running out of retries, schema
    /// failures and ordering violations are fatal and returned to the caller,
    /// which is expected to stop the process.
    pub async fn run(mut self, shutdown: CancellationToken) -> SourceResult<Checkpoint> {
        let mut backoff = ExponentialBackoff::new(self.backoff.clone());

        loop {
            let opened = tokio::select! {
                _ = shutdown.cancelled() => return Ok(self.checkpoint),
                opened = self.feed.open(self.checkpoint.resume_token.clone()) => opened,
            };

            let mut cursor: Box<dyn ChangeCursor> = match opened {
                Ok(cursor) => cursor,
                Err(e) if e.is_transient() => {
                    if !wait_before_retry(&mut backoff, &e, &shutdown).await? {
                        return Ok(self.checkpoint);
                    }
                    continue;
                }
                Err(e) => {
                    error!("Failed to open order change feed: {}", e);
                    return Err(e);
                }
            };

            info!(
                "Watching order changes after token {:?} (last event id {})",
                self.checkpoint.resume_token, self.checkpoint.last_event_id
            );

            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Change source stopping at event {}", self.checkpoint.last_event_id);
                        return Ok(self.checkpoint);
                    }
                    next = cursor.next_change() => next,
                };

                match next {
                    Ok(Some(record)) => {
                        backoff.reset();
                        self.handle_record(record).await?;
                    }
                    Ok(None) => {
                        info!("Order change feed closed");
                        return Ok(self.checkpoint);
                    }
                    Err(e) if e.is_transient() => {
                        if !wait_before_retry(&mut backoff, &e, &shutdown).await? {
                            return Ok(self.checkpoint);
                        }
                        break;
                    }
                    Err(e) => {
                        error!("Order change feed failed: {}", e);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Emits the event for one record and acknowledges its token.
    async fn handle_record(&mut self, record: ChangeRecord) -> SourceResult<()> {
        let resume_token = record.resume_token.clone();
        let next_id = self.checkpoint.last_event_id + 1;

        match normalize_change(record, next_id)? {
            Some(event) => {
                let event = self.event_bus.publish(event).map_err(|e| {
                    error!("Event bus rejected event {}: {}", next_id, e);
                    ChangeSourceError::Fatal(e.to_string())
                })?;
                self.checkpoint.last_event_id = event.event_id;
            }
            None => debug!("Skipping non-order change {}", resume_token),
        }

        self.checkpoint.resume_token = Some(resume_token);

        // The event is already out; a lost save means a redelivery after restart
        if let Err(e) = self.checkpoints.save(&self.checkpoint).await {
            warn!("Failed to persist checkpoint at event {}: {}", self.checkpoint.last_event_id, e);
        }

        Ok(())
    }
}

/// Waits out the next backoff delay.
///
/// Returns `Ok(false)` when shutdown fired during the wait and a fatal error
/// once the retry budget is exhausted.
async fn wait_before_retry(
    backoff: &mut ExponentialBackoff,
    cause: &ChangeSourceError,
    shutdown: &CancellationToken,
) -> SourceResult<bool> {
    let Some(delay) = backoff.next_delay() else {
        error!("Giving up on order change feed after {} retries: {}", backoff.attempts(), cause);
        return Err(ChangeSourceError::Fatal(format!(
            "retries exhausted after {} attempts: {}",
            backoff.attempts(),
            cause
        )));
    };

    warn!(
        "Order change feed interrupted ({}), reopening in {:?} (attempt {})",
        cause,
        delay,
        backoff.attempts()
    );

    tokio::select! {
        _ = shutdown.cancelled() => Ok(false),
        _ = tokio::time::sleep(delay) => Ok(true),
    }
}

/// Converts a raw change record into an order event with the given id.
///
/// Inserts become `Created`, updates and replacements become `Updated`.
/// Deletes are not order events and yield `Ok(None)`. A record that lacks
/// the order document, a usable order id or the owning restaurant is a
/// schema failure; no partial event is ever produced.
pub fn normalize_change(record: ChangeRecord, event_id: EventId) -> SourceResult<Option<OrderEvent>> {
    let operation_kind = match record.operation {
        ChangeOperation::Insert => OperationKind::Created,
        ChangeOperation::Update | ChangeOperation::Replace => OperationKind::Updated,
        ChangeOperation::Delete => return Ok(None),
    };

    let order_id = document_id(&record.document_key).ok_or_else(|| {
        ChangeSourceError::Schema(format!(
            "change {} has unusable document key {}",
            record.resume_token, record.document_key
        ))
    })?;

    let document = record.full_document.ok_or_else(|| {
        ChangeSourceError::Schema(format!("change {} for order {} has no document", record.resume_token, order_id))
    })?;

    if !document.is_object() {
        return Err(ChangeSourceError::Schema(format!(
            "order {} document is not an object",
            order_id
        )));
    }

    let restaurant_id = RESTAURANT_FIELDS
        .iter()
        .find_map(|field| document.get(*field).and_then(document_id))
        .ok_or_else(|| {
            ChangeSourceError::Schema(format!("order {} has no restaurant", order_id))
        })?;

    Ok(Some(OrderEvent {
        event_id,
        order_id,
        operation_kind,
        restaurant_id: RestaurantId(restaurant_id),
        payload_snapshot: document,
        occurred_at: record.committed_at,
    }))
}

/// Reads an identifier stored as a string, a number or an extended-JSON
/// object id (`{"$oid": "..."}`).
fn document_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map
            .get("$oid")
            .or_else(|| map.get("_id"))
            .and_then(document_id),
        _ => None,
    }
}
