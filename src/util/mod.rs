//! Utility module
//!
//! Conversions between the log2 message intervals carried in headers and
//! durations, and receipt timeout windows.

use std::time::Duration;

/// logMessageInterval value meaning "not specified"
pub const LOG_INTERVAL_UNSPECIFIED: i8 = 0x7F;

/// Converts a logMessageInterval (log2 seconds) to a duration
///
/// Returns `None` for [`LOG_INTERVAL_UNSPECIFIED`] and for intervals too
/// large to represent.
pub fn log_interval_to_duration(log_interval: i8) -> Option<Duration> {
    if log_interval == LOG_INTERVAL_UNSPECIFIED {
        return None;
    }
    Duration::try_from_secs_f64(2f64.powi(log_interval as i32)).ok()
}

/// Converts a duration to the nearest logMessageInterval
pub fn duration_to_log_interval(duration: Duration) -> i8 {
    let secs = duration.as_secs_f64();
    if secs <= 0.0 {
        return i8::MIN;
    }
    secs.log2().round().clamp(i8::MIN as f64, i8::MAX as f64) as i8
}

/// `multiplier × interval`, the receipt timeout window
pub fn receipt_window(interval: Duration, multiplier: u8) -> Duration {
    interval * multiplier as u32
}
