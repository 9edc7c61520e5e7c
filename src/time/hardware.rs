use thiserror::Error;

use crate::core::Timestamp;

/// Failure of a hardware timestamping or clock-adjust call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    /// The call did not complete within its bounded wait
    #[error("operation timed out")]
    Timeout,

    #[error("operation not supported")]
    Unsupported,

    #[error("operation failed: {0}")]
    Failed(String),
}

pub type HardwareResult<T> = std::result::Result<T, HardwareError>;

/// Timestamp capture and clock adjustment primitives of a PTP-capable NIC
///
/// Every call must return within a bounded time. A transmit timestamp that
/// is not yet available is reported as [`HardwareError::Timeout`] so callers
/// can poll it again on the next tick instead of blocking.
pub trait HardwareTimestampInterface: Send + Sync {
    /// Transmit timestamp of the event message with the given sequence id
    fn capture_tx_timestamp(&self, sequence_id: u16) -> HardwareResult<Timestamp>;

    /// Receive timestamp of the event message with the given sequence id
    ///
    /// The driver calls this when the network layer hands over an event
    /// message without a captured timestamp.
    fn capture_rx_timestamp(&self, sequence_id: u16) -> HardwareResult<Timestamp>;

    /// Applies a frequency correction in parts per billion
    fn adjust_clock_frequency(&self, ppb: f64) -> bool;

    /// Steps the clock phase by `offset_ns`
    fn adjust_clock_phase(&self, offset_ns: i64) -> bool;

    fn set_clock_time(&self, time: Timestamp) -> bool;

    fn get_clock_time(&self) -> HardwareResult<Timestamp>;

    fn supports_one_step(&self) -> bool;

    fn supports_two_step(&self) -> bool;

    /// Worst-case timestamp error in nanoseconds
    fn timestamp_accuracy_ns(&self) -> u32;
}

/// Consecutive-failure bookkeeping for hardware calls made by one state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardwareHealth {
    consecutive_failures: u32,
    total_failures: u64,
}

impl HardwareHealth {
    /// Records the outcome of a fallible call
    pub fn record<T>(&mut self, result: &HardwareResult<T>) {
        self.record_ok(result.is_ok());
    }

    /// Records the outcome of a boolean call
    pub fn record_ok(&mut self, ok: bool) {
        if ok {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.total_failures += 1;
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    /// Clears the consecutive count after a recovery
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// Power-up self test: the clock must be readable and timestamping usable
pub fn self_test(hardware: &dyn HardwareTimestampInterface) -> bool {
    (hardware.supports_two_step() || hardware.supports_one_step())
        && hardware.get_clock_time().is_ok()
}
