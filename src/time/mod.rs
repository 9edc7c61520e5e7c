//! Hardware time abstraction
//!
//! The core never touches a clock directly. Every timestamp capture and
//! clock correction goes through a [`HardwareTimestampInterface`] injected
//! at construction, so the same state machines run against a PTP hardware
//! clock, a software clock, or the simulated clock used in tests.

mod hardware;
#[cfg(test)]
pub(crate) mod mock;

pub use self::hardware::{
    self_test, HardwareError, HardwareHealth, HardwareResult, HardwareTimestampInterface,
};
