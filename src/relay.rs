//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Wires the pipeline together: checkpoint -> change source -> event bus -> delivery manager.
// The Relay owns every long-lived task; dropping out of `wait` means the pipeline has stopped.
//--------------------------------------------------------------------------------------------------

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::domain::models::types::Checkpoint;
use crate::domain::services::change_source::{
    ChangeFeed, ChangeSourceAdapter, ChangeSourceError, CheckpointStore, SourceResult,
};
use crate::domain::services::delivery::DeliveryManager;
use crate::domain::services::events::EventBus;
use crate::domain::services::registry::SubscriberRegistry;

/// Running relay pipeline
pub struct Relay {
    delivery: Arc<DeliveryManager>,
    dispatcher: JoinHandle<()>,
    source: JoinHandle<SourceResult<Checkpoint>>,
    shutdown: CancellationToken,
}

impl Relay {
    /// Loads the checkpoint and starts the dispatcher and the change source.
    ///
    /// The event bus is seeded with the checkpoint's last event id, so ids
    /// continue across restarts.
    pub async fn start(
        config: &Config,
        feed: Arc<dyn ChangeFeed>,
        checkpoints: Arc<dyn CheckpointStore>,
        shutdown: CancellationToken,
    ) -> SourceResult<Self> {
        let checkpoint = checkpoints.load().await?.unwrap_or_default();
        info!(
            "Starting relay from event {} (resume token {:?})",
            checkpoint.last_event_id, checkpoint.resume_token
        );

        let event_bus = EventBus::new(
            config.bus_capacity,
            config.replay_capacity,
            checkpoint.last_event_id,
        );
        let registry = Arc::new(SubscriberRegistry::new(config.retired_connections));
        let delivery = Arc::new(DeliveryManager::new(event_bus.clone(), registry, config.delivery()));
        let dispatcher = delivery.start(shutdown.clone());

        let adapter = ChangeSourceAdapter::new(feed, checkpoints, event_bus, checkpoint, config.backoff());
        let source = tokio::spawn(adapter.run(shutdown.clone()));

        Ok(Self {
            delivery,
            dispatcher,
            source,
            shutdown,
        })
    }

    pub fn delivery(&self) -> &Arc<DeliveryManager> {
        &self.delivery
    }

    /// Waits for the change source to stop, then shuts the rest down.
    ///
    /// Returns the final checkpoint, or the fatal error that stopped the
    /// source.
    pub async fn wait(self) -> SourceResult<Checkpoint> {
        let result = match self.source.await {
            Ok(result) => result,
            Err(e) => Err(ChangeSourceError::Fatal(format!("change source task failed: {}", e))),
        };

        if let Err(e) = &result {
            error!("Change source stopped: {}", e);
        }

        // a stopped source means no more events; close every subscriber
        self.shutdown.cancel();
        if let Err(e) = self.dispatcher.await {
            error!("Dispatcher task failed: {}", e);
        }

        result
    }
}
