pub mod change_source;
pub mod delivery;
pub mod events;
pub mod registry;
