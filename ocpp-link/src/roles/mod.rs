//! Runnable roles: charging station, central system and relay

pub mod central;
pub mod proxy;
pub mod station;

pub use central::CentralSystem;
pub use proxy::Relay;
pub use station::{ChargingStation, StationEvent};
