//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module tracks the subscriber connections attached to the relay. It is the only structure
// mutated concurrently by connection handlers and delivery tasks, so every operation goes
// through a single lock.
//
// | Component            | Description                                                   |
// |----------------------|---------------------------------------------------------------|
// | SubscriberRegistry   | Connection table keyed by ConnectionId                        |
// | SubscriberLink       | Delivery queue, cancellation and cursor of one subscriber     |
// | Subscriber           | Point-in-time view of a registered subscriber                 |
// | RegistryError        | Registration and state transition errors                      |
//--------------------------------------------------------------------------------------------------

mod subscriber_registry;

pub use subscriber_registry::{
    CloseReason, RegistryError, RegistryResult, Subscriber, SubscriberLink, SubscriberRegistry,
};
