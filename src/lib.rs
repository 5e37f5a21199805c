// Expose the modules
pub mod api;
pub mod config;
pub mod domain;
pub mod relay;

// Re-export key types for easier usage
pub use api::{Api, AppState, StaticTokenAuthenticator};
pub use config::{Config, ConfigError};
pub use domain::models::types::{
    ChangeOperation, ChangeRecord, Checkpoint, ConnectionId, ConnectionState, EventId, OperationKind,
    OrderEvent, RestaurantId, ResumeToken,
};
pub use domain::services::change_source::{
    ChangeSourceAdapter, ChangeSourceError, FileCheckpointStore, MemoryChangeFeed,
    MemoryCheckpointStore, SourceResult,
};
pub use domain::services::delivery::{DeliveryConfig, DeliveryError, DeliveryManager, ResumeFrom};
pub use domain::services::events::{EventBus, EventError, EventResult, ReplayGapError};
pub use domain::services::registry::{CloseReason, SubscriberRegistry};
pub use relay::Relay;
