//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the in-process fan-out stage of the relay. Order events enter through
// the bus exactly once, in id order, and are retained in a bounded window for replay.
//
// | Component                | Description                                                |
// |--------------------------|-----------------------------------------------------------|
// | EventBus                 | Single ingestion point, broadcast + replay window          |
// | ReplayBuffer             | Bounded oldest-first ring of recent events                 |
// | EventError               | Ordering and replay errors                                 |
//--------------------------------------------------------------------------------------------------

mod event_types;
mod event_bus;
mod replay_buffer;

#[cfg(test)]
mod tests;

// Re-exports
pub use event_types::{EventError, EventResult, ReplayGapError};
pub use event_bus::EventBus;
pub use replay_buffer::ReplayBuffer;
