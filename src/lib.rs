//! xdna-pipeline library
//!
//! Lock/DMA handshake model for a shim -> memory tile -> compute tile
//! pipeline, with a step-based emulator standing in for the device.

pub mod error;
pub mod device;
pub mod topology;
pub mod npu;
pub mod emu;
pub mod host;
pub mod design;
pub mod config;

pub use error::{ConfigError, DecodeError, Error, Result, RunError};
