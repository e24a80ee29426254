//! GridPulse firmware library.
//!
//! Edge telemetry-and-control agent for a solar inverter: samples device
//! registers over a Modbus-RTU-over-HTTP tunnel, batches them through a
//! columnar delta+RLE codec, and uploads them inside an authenticated
//! envelope. The cloud reply can carry configuration updates, an
//! export-power command, and a resumable firmware update stream.
//!
//! The domain core is hardware-agnostic; all ESP-IDF-specific code lives
//! in `adapters` behind `#[cfg(target_os = "espidf")]`, with host
//! simulation backends so the whole crate tests on x86_64.

#![deny(unused_must_use)]

pub mod acquisition;
pub mod codec;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod fota;
pub mod modbus;
pub mod ring;
pub mod sample;
pub mod security;
pub mod transport;
pub mod uplink;

pub mod app;
pub mod adapters;

mod error;
pub use error::{
    CodecError, Error, FotaError, FrameError, Result, SecurityError, TransportError,
};
