use std::fmt;
use std::ops::{Add, Neg, Sub};

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// Largest value representable in the 48-bit seconds field
pub const MAX_TIMESTAMP_SECONDS: u64 = (1 << 48) - 1;

const NANOS_PER_SECOND: u32 = 1_000_000_000;

/// Number of fractional bits in a scaled-nanosecond value
const SCALE_BITS: u32 = 16;
const SCALE: f64 = (1u64 << SCALE_BITS) as f64;

/// 8-byte clock identifier, ordered byte-wise
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ClockIdentity(pub [u8; 8]);

impl ClockIdentity {
    /// Creates a clock identity from raw bytes
    pub const fn new(bytes: [u8; 8]) -> Self {
        ClockIdentity(bytes)
    }

    /// Derives an EUI-64 identity from an EUI-48 MAC address
    pub fn from_mac(mac: [u8; 6]) -> Self {
        ClockIdentity([mac[0], mac[1], mac[2], 0xFF, 0xFE, mac[3], mac[4], mac[5]])
    }

    /// Generates a new random, non-zero clock identity
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; 8];
        while bytes == [0u8; 8] {
            rng.fill(&mut bytes);
        }
        ClockIdentity(bytes)
    }

    /// All-zero identities are never valid on the wire
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

/// Network-wide unique key of a port
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PortIdentity {
    /// Identity of the clock owning the port
    pub clock_identity: ClockIdentity,
    /// 1-based port number on that clock
    pub port_number: u16,
}

impl PortIdentity {
    pub const fn new(clock_identity: ClockIdentity, port_number: u16) -> Self {
        PortIdentity {
            clock_identity,
            port_number,
        }
    }
}

impl fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.clock_identity, self.port_number)
    }
}

/// Well-known clockAccuracy values
pub mod clock_accuracy {
    pub const WITHIN_25_NS: u8 = 0x20;
    pub const WITHIN_100_NS: u8 = 0x21;
    pub const WITHIN_250_NS: u8 = 0x22;
    pub const WITHIN_1_US: u8 = 0x23;
    pub const WITHIN_2_5_US: u8 = 0x24;
    pub const WITHIN_10_US: u8 = 0x25;
    pub const WITHIN_25_US: u8 = 0x26;
    pub const WITHIN_100_US: u8 = 0x27;
    pub const WITHIN_250_US: u8 = 0x28;
    pub const WITHIN_1_MS: u8 = 0x29;
    pub const UNKNOWN: u8 = 0xFE;
}

/// Quality attributes of a clock, compared field by field during BMCA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClockQuality {
    /// Traceability class (lower is better)
    pub clock_class: u8,
    /// Accuracy enumeration (lower is better)
    pub clock_accuracy: u8,
    /// Stability estimate (lower is better)
    pub offset_scaled_log_variance: u16,
}

impl Default for ClockQuality {
    fn default() -> Self {
        ClockQuality {
            clock_class: 248,
            clock_accuracy: clock_accuracy::UNKNOWN,
            offset_scaled_log_variance: 0x4E5D,
        }
    }
}

/// PTP timestamp: 48-bit seconds and nanoseconds below one second
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp {
    seconds: u64,
    nanoseconds: u32,
}

impl Timestamp {
    /// Creates a timestamp, rejecting out-of-range fields
    pub fn new(seconds: u64, nanoseconds: u32) -> Result<Self> {
        if nanoseconds >= NANOS_PER_SECOND {
            return Err(Error::timestamp(format!(
                "nanoseconds field {} is not below one second",
                nanoseconds
            )));
        }
        if seconds > MAX_TIMESTAMP_SECONDS {
            return Err(Error::timestamp(format!(
                "seconds field {} exceeds 48 bits",
                seconds
            )));
        }
        Ok(Timestamp {
            seconds,
            nanoseconds,
        })
    }

    /// Builds a timestamp from a total nanosecond count
    pub fn from_nanos(total: i128) -> Result<Self> {
        if total < 0 {
            return Err(Error::timestamp("timestamps cannot be negative"));
        }
        let seconds = total / NANOS_PER_SECOND as i128;
        let nanoseconds = (total % NANOS_PER_SECOND as i128) as u32;
        let seconds = u64::try_from(seconds)
            .map_err(|_| Error::timestamp("timestamp out of range"))?;
        Timestamp::new(seconds, nanoseconds)
    }

    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    pub fn nanoseconds(&self) -> u32 {
        self.nanoseconds
    }

    /// Total nanoseconds since the epoch
    pub fn to_nanos(&self) -> i128 {
        self.seconds as i128 * NANOS_PER_SECOND as i128 + self.nanoseconds as i128
    }

    /// Total seconds as floating point
    pub fn as_secs_f64(&self) -> f64 {
        self.seconds as f64 + self.nanoseconds as f64 / NANOS_PER_SECOND as f64
    }

    /// Exact signed difference `self - earlier` in nanoseconds
    pub fn nanos_since(&self, earlier: &Timestamp) -> i128 {
        self.to_nanos() - earlier.to_nanos()
    }

    /// Signed difference `self - earlier`, saturating at the interval range
    pub fn diff(&self, earlier: &Timestamp) -> TimeInterval {
        let scaled = self.nanos_since(earlier) << SCALE_BITS;
        TimeInterval(scaled.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    /// Adds a (possibly negative) interval, truncating sub-nanosecond parts
    pub fn checked_add_interval(&self, interval: TimeInterval) -> Option<Timestamp> {
        let total = self.to_nanos() + (interval.0 as i128 >> SCALE_BITS);
        Timestamp::from_nanos(total).ok()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanoseconds)
    }
}

/// Signed interval in units of 2^-16 ns
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TimeInterval(pub i64);

impl TimeInterval {
    pub const ZERO: TimeInterval = TimeInterval(0);

    /// Largest whole-nanosecond magnitude that converts without saturating
    pub const MAX_NANOSECONDS: i64 = i64::MAX >> SCALE_BITS;

    pub const fn from_scaled(scaled: i64) -> Self {
        TimeInterval(scaled)
    }

    pub const fn scaled(&self) -> i64 {
        self.0
    }

    /// Converts whole nanoseconds, saturating outside the representable range
    pub fn from_nanoseconds(ns: i64) -> Self {
        TimeInterval(ns.saturating_mul(1 << SCALE_BITS))
    }

    /// Whole nanoseconds, rounded toward negative infinity
    pub fn to_nanoseconds(&self) -> i64 {
        self.0 >> SCALE_BITS
    }

    /// Converts fractional nanoseconds, rounding to the nearest scaled unit
    pub fn from_nanoseconds_f64(ns: f64) -> Self {
        let scaled = (ns * SCALE).round();
        if scaled >= i64::MAX as f64 {
            TimeInterval(i64::MAX)
        } else if scaled <= i64::MIN as f64 {
            TimeInterval(i64::MIN)
        } else {
            TimeInterval(scaled as i64)
        }
    }

    pub fn to_nanoseconds_f64(&self) -> f64 {
        self.0 as f64 / SCALE
    }

    pub fn abs(&self) -> Self {
        TimeInterval(self.0.saturating_abs())
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(TimeInterval)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(TimeInterval)
    }
}

impl Add for TimeInterval {
    type Output = TimeInterval;

    fn add(self, rhs: Self) -> Self::Output {
        TimeInterval(self.0.saturating_add(rhs.0))
    }
}

impl Sub for TimeInterval {
    type Output = TimeInterval;

    fn sub(self, rhs: Self) -> Self::Output {
        TimeInterval(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for TimeInterval {
    type Output = TimeInterval;

    fn neg(self) -> Self::Output {
        TimeInterval(self.0.saturating_neg())
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ns", self.to_nanoseconds_f64())
    }
}

/// Priority vector used for best-master comparison
///
/// Datasets are replaced wholesale, never edited in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dataset {
    /// Identity of the advertised grandmaster
    pub grandmaster_identity: ClockIdentity,
    /// Quality of the advertised grandmaster
    pub grandmaster_quality: ClockQuality,
    /// First administrative priority (lower is better)
    pub priority1: u8,
    /// Second administrative priority (lower is better)
    pub priority2: u8,
    /// Hops between the sender and the grandmaster
    pub steps_removed: u16,
    /// Port that transmitted the Announce
    pub sender: PortIdentity,
    /// Local port number the Announce arrived on
    pub receiver_port: u16,
}

impl Dataset {
    /// Dataset describing the local clock as grandmaster of its own port
    pub fn local(
        port: PortIdentity,
        quality: ClockQuality,
        priority1: u8,
        priority2: u8,
    ) -> Self {
        Dataset {
            grandmaster_identity: port.clock_identity,
            grandmaster_quality: quality,
            priority1,
            priority2,
            steps_removed: 0,
            sender: port,
            receiver_port: port.port_number,
        }
    }
}

/// Port states of the 802.1AS port state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortState {
    Initializing,
    Faulty,
    Disabled,
    Listening,
    PreMaster,
    Master,
    Passive,
    Uncalibrated,
    Slave,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortState::Initializing => "INITIALIZING",
            PortState::Faulty => "FAULTY",
            PortState::Disabled => "DISABLED",
            PortState::Listening => "LISTENING",
            PortState::PreMaster => "PRE_MASTER",
            PortState::Master => "MASTER",
            PortState::Passive => "PASSIVE",
            PortState::Uncalibrated => "UNCALIBRATED",
            PortState::Slave => "SLAVE",
        };
        f.write_str(name)
    }
}
