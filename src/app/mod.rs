//! Application boundary: port traits and the structured events that flow
//! from leaf components up to the uplink orchestrator.

pub mod events;
pub mod ports;
