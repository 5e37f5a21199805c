//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Fan-out of normalized order events to subscriber connections.
//
// | Component         | Description                                                       |
// |-------------------|-------------------------------------------------------------------|
// | DeliveryManager   | Dispatcher task plus one writer task per subscriber               |
// | EventSink         | Write half of a subscriber connection                             |
// | Subscription      | Handle returned by attach                                         |
// | DeliveryConfig    | Queue capacity, write timeout, heartbeat and idle settings        |
//--------------------------------------------------------------------------------------------------

mod delivery_manager;
mod sink;

#[cfg(test)]
mod tests;

pub use delivery_manager::{
    DeliveryConfig, DeliveryError, DeliveryManager, DeliveryResult, ResumeFrom, Subscription,
};
pub use sink::{EventSink, SinkError};
