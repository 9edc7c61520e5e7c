//! Core types and configuration for the gPTP core
//!
//! This module contains the data model shared by every state machine.

pub mod config;
pub mod error;
pub mod serde;
pub mod types;

pub use self::config::{Config, FaultConfig, MilanConfig, PathDelayConfig, ServoConfig};
pub use self::error::{Error, Result};
pub use self::types::{
    clock_accuracy, ClockIdentity, ClockQuality, Dataset, PortIdentity, PortState, TimeInterval,
    Timestamp,
};

/// Default gPTP domain
pub const DEFAULT_DOMAIN: u8 = 0;
