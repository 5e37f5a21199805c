//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module turns the order store's change feed into normalized order events. The store itself
// is an external collaborator and is reached only through the ports defined here.
//
// Ports:
// - ChangeFeed / ChangeCursor: resumable stream of committed writes on the order collection
// - CheckpointStore: durable storage for the resume token and the last emitted event id
//
// Adapters:
// - ChangeSourceAdapter: watch loop with backoff, normalization and checkpointing
// - MemoryChangeFeed: in-process order log implementing the feed port
// - FileCheckpointStore / MemoryCheckpointStore: checkpoint port implementations
//--------------------------------------------------------------------------------------------------

pub mod adapter;
pub mod backoff;
pub mod checkpoint;
pub mod memory_feed;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::types::{Checkpoint, ChangeRecord, ResumeToken};

pub use adapter::{ChangeSourceAdapter, normalize_change};
pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use checkpoint::{FileCheckpointStore, MemoryCheckpointStore};
pub use memory_feed::MemoryChangeFeed;

/// Errors raised while reading the change feed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangeSourceError {
    /// Network or cursor hiccup. The watch is reopened from the last token.
    #[error("Transient change source error: {0}")]
    Transient(String),

    /// Unrecoverable connection or configuration failure
    #[error("Fatal change source error: {0}")]
    Fatal(String),

    /// A change record does not have the shape of an order document
    #[error("Invalid order change: {0}")]
    Schema(String),

    /// Reading or writing the checkpoint failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
}

impl ChangeSourceError {
    /// Whether the watch loop may retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Type alias for Result with ChangeSourceError
pub type SourceResult<T> = Result<T, ChangeSourceError>;

/// A resumable stream of committed writes on the order collection.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a cursor positioned just after `resume_after`, or at the current
    /// end of the feed when no token is given.
    async fn open(&self, resume_after: Option<ResumeToken>) -> SourceResult<Box<dyn ChangeCursor>>;
}

/// An open watch on the change feed.
#[async_trait]
pub trait ChangeCursor: Send {
    /// Waits for the next committed change.
    ///
    /// Returns `Ok(None)` once the feed has been closed for good.
    async fn next_change(&mut self) -> SourceResult<Option<ChangeRecord>>;
}

/// Durable storage for the change source's resume point.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the last saved checkpoint, if any.
    async fn load(&self) -> SourceResult<Option<Checkpoint>>;

    /// Persists a checkpoint, replacing the previous one.
    async fn save(&self, checkpoint: &Checkpoint) -> SourceResult<()>;
}
