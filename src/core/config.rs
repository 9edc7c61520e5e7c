use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{ClockIdentity, ClockQuality, PortIdentity};
use super::{Error, Result};

/// Clock servo configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServoConfig {
    /// Proportional gain
    pub kp: f64,
    /// Integral gain
    pub ki: f64,
    /// Lower bound of the frequency adjustment in ppb
    pub min_frequency_adjustment_ppb: f64,
    /// Upper bound of the frequency adjustment in ppb
    pub max_frequency_adjustment_ppb: f64,
    /// EMA window for the offset filter, in samples
    pub offset_filter_size: usize,
    /// Offsets below this magnitude count toward lock
    pub min_offset_threshold_ns: f64,
    /// Offsets above this magnitude keep the port uncalibrated
    pub max_offset_threshold_ns: f64,
    /// Consecutive in-threshold cycles needed to lock
    pub lock_cycles: u32,
    /// Filter samples needed before lock can be declared
    pub min_samples: usize,
    /// Instantaneous offsets at or above this magnitude trigger a phase step
    pub clock_jump_threshold_ns: f64,
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            kp: 0.7,
            ki: 0.3,
            min_frequency_adjustment_ppb: -500.0,
            max_frequency_adjustment_ppb: 500.0,
            offset_filter_size: 8,
            min_offset_threshold_ns: 100.0,
            max_offset_threshold_ns: 100_000.0,
            lock_cycles: 4,
            min_samples: 4,
            clock_jump_threshold_ns: 1_000_000.0,
        }
    }
}

/// Peer-to-peer path delay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathDelayConfig {
    /// Interval between PDelay requests
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub pdelay_interval: Duration,
    /// Time allowed for a response and its follow-up to arrive
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub pdelay_resp_receipt_timeout: Duration,
    /// Consecutive lost responses tolerated before asCapable is cleared
    pub allowed_lost_responses: u32,
    /// Moving average window for the mean link delay
    pub filter_size: usize,
    /// Link delays at or above this value disqualify the link
    pub neighbor_prop_delay_thresh_ns: f64,
    /// Lowest acceptable neighbor rate ratio
    pub rate_ratio_min: f64,
    /// Highest acceptable neighbor rate ratio
    pub rate_ratio_max: f64,
    /// Consecutive good measurements before asCapable is set
    pub as_capable_threshold: u32,
    /// Bounded wait for the responder's transmit timestamp
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub tx_timestamp_timeout: Duration,
}

impl Default for PathDelayConfig {
    fn default() -> Self {
        PathDelayConfig {
            pdelay_interval: Duration::from_secs(1),
            pdelay_resp_receipt_timeout: Duration::from_secs(1),
            allowed_lost_responses: 3,
            filter_size: 8,
            neighbor_prop_delay_thresh_ns: 800_000.0,
            rate_ratio_min: 0.998,
            rate_ratio_max: 1.002,
            as_capable_threshold: 3,
            tx_timestamp_timeout: Duration::from_millis(10),
        }
    }
}

/// Milan multiple-PDelay-response handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilanConfig {
    /// Enables detection and cessation
    pub enabled: bool,
    /// Consecutive multiple-response windows before cessation
    pub multiple_resp_threshold: u32,
    /// How long PDelay transmission stays ceased
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub cessation_duration: Duration,
}

impl Default for MilanConfig {
    fn default() -> Self {
        MilanConfig {
            enabled: false,
            multiple_resp_threshold: 3,
            cessation_duration: Duration::from_secs(300),
        }
    }
}

/// Fault escalation and recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Consecutive receipt timeouts that escalate to recovery
    pub max_consecutive_timeouts: u32,
    /// Consecutive failing hardware calls that escalate to recovery
    pub max_hardware_failures: u32,
    /// Delay before an automatic recovery attempt
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub fault_recovery_timeout: Duration,
    /// Recover without a manual trigger
    pub automatic_recovery: bool,
    /// Measure and compensate path asymmetry when reported
    pub path_asymmetry_measurement: bool,
}

impl Default for FaultConfig {
    fn default() -> Self {
        FaultConfig {
            max_consecutive_timeouts: 5,
            max_hardware_failures: 3,
            fault_recovery_timeout: Duration::from_secs(10),
            automatic_recovery: true,
            path_asymmetry_measurement: false,
        }
    }
}

/// Configuration for a gPTP port and its coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identity of the local clock
    pub clock_identity: ClockIdentity,
    /// Local port number (1-based)
    pub port_number: u16,
    /// gPTP domain
    pub domain_number: u8,
    /// First administrative priority
    pub priority1: u8,
    /// Second administrative priority
    pub priority2: u8,
    /// Local clock quality
    pub clock_quality: ClockQuality,
    /// Announce transmission interval
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub announce_interval: Duration,
    /// Announce intervals without a valid Announce before timeout
    pub announce_receipt_timeout: u8,
    /// Sync transmission interval
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub sync_interval: Duration,
    /// Sync intervals without a Sync before timeout
    pub sync_receipt_timeout: u8,
    /// Time spent in PRE_MASTER before becoming MASTER
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub qualification_timeout: Duration,
    /// Periodic BMCA re-evaluation interval
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub reselect_interval: Duration,
    /// Announces needed before a foreign master is qualified
    pub foreign_master_threshold: u32,
    /// Capacity of the foreign master table
    pub max_foreign_masters: usize,
    /// Announces with more steps removed are rejected
    pub max_steps_removed: u16,
    /// Use two-step Sync (Sync + Follow-Up)
    pub two_step: bool,
    /// Bounded wait for the Sync transmit timestamp
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub tx_timestamp_timeout: Duration,
    /// Recommended tick period for the driver
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub tick_interval: Duration,
    pub servo: ServoConfig,
    pub path_delay: PathDelayConfig,
    pub milan: MilanConfig,
    pub faults: FaultConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            clock_identity: ClockIdentity::random(),
            port_number: 1,
            domain_number: 0,
            priority1: 248,
            priority2: 248,
            clock_quality: ClockQuality::default(),
            announce_interval: Duration::from_secs(1),
            announce_receipt_timeout: 3,
            sync_interval: Duration::from_millis(125),
            sync_receipt_timeout: 3,
            qualification_timeout: Duration::from_secs(1),
            reselect_interval: Duration::from_secs(1),
            foreign_master_threshold: 1,
            max_foreign_masters: 16,
            max_steps_removed: 255,
            two_step: true,
            tx_timestamp_timeout: Duration::from_millis(10),
            tick_interval: Duration::from_millis(10),
            servo: ServoConfig::default(),
            path_delay: PathDelayConfig::default(),
            milan: MilanConfig::default(),
            faults: FaultConfig::default(),
        }
    }
}

impl Config {
    /// Milan profile: multiple-response cessation enabled
    pub fn milan(clock_identity: ClockIdentity) -> Self {
        Config {
            clock_identity,
            milan: MilanConfig {
                enabled: true,
                ..MilanConfig::default()
            },
            ..Config::default()
        }
    }

    /// Automotive profile: fast sync, no automatic role churn
    pub fn automotive(clock_identity: ClockIdentity) -> Self {
        Config {
            clock_identity,
            sync_interval: Duration::from_micros(31_250),
            qualification_timeout: Duration::from_millis(250),
            servo: ServoConfig {
                min_offset_threshold_ns: 50.0,
                ..ServoConfig::default()
            },
            faults: FaultConfig {
                fault_recovery_timeout: Duration::from_secs(2),
                ..FaultConfig::default()
            },
            ..Config::default()
        }
    }

    /// Professional audio/video profile: tighter lock with Milan enabled
    pub fn professional_av(clock_identity: ClockIdentity) -> Self {
        Config {
            servo: ServoConfig {
                min_offset_threshold_ns: 50.0,
                lock_cycles: 8,
                ..ServoConfig::default()
            },
            ..Config::milan(clock_identity)
        }
    }

    /// Identity of the configured port
    pub fn port_identity(&self) -> PortIdentity {
        PortIdentity::new(self.clock_identity, self.port_number)
    }

    /// `announceReceiptTimeout × announceInterval`
    pub fn announce_receipt_window(&self) -> Duration {
        crate::util::receipt_window(self.announce_interval, self.announce_receipt_timeout)
    }

    /// `syncReceiptTimeout × syncInterval`
    pub fn sync_receipt_window(&self) -> Duration {
        crate::util::receipt_window(self.sync_interval, self.sync_receipt_timeout)
    }

    /// Checks that the configuration is valid and consistent
    ///
    /// Nothing is clamped: the first inconsistency is returned as a
    /// descriptive configuration error.
    pub fn validate(&self) -> Result<()> {
        if self.clock_identity.is_zero() {
            return Err(Error::config("clock identity must not be all zero"));
        }
        if self.port_number == 0 || self.port_number == u16::MAX {
            return Err(Error::config(format!(
                "port number {} is reserved",
                self.port_number
            )));
        }

        let intervals = [
            ("announce interval", self.announce_interval),
            ("sync interval", self.sync_interval),
            ("qualification timeout", self.qualification_timeout),
            ("reselect interval", self.reselect_interval),
            ("tx timestamp timeout", self.tx_timestamp_timeout),
            ("tick interval", self.tick_interval),
            ("pdelay interval", self.path_delay.pdelay_interval),
            (
                "pdelay response receipt timeout",
                self.path_delay.pdelay_resp_receipt_timeout,
            ),
            (
                "pdelay tx timestamp timeout",
                self.path_delay.tx_timestamp_timeout,
            ),
            (
                "fault recovery timeout",
                self.faults.fault_recovery_timeout,
            ),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(Error::config(format!("{} must be non-zero", name)));
            }
        }

        if self.announce_receipt_timeout == 0 {
            return Err(Error::config("announce receipt timeout must be at least 1"));
        }
        if self.sync_receipt_timeout == 0 {
            return Err(Error::config("sync receipt timeout must be at least 1"));
        }
        if self.tx_timestamp_timeout >= self.sync_interval {
            return Err(Error::config(
                "tx timestamp timeout must be shorter than the sync interval",
            ));
        }
        if self.foreign_master_threshold == 0 {
            return Err(Error::config("foreign master threshold must be at least 1"));
        }
        if self.max_foreign_masters == 0 {
            return Err(Error::config("foreign master table capacity must be non-zero"));
        }

        self.validate_servo()?;
        self.validate_path_delay()?;

        if self.milan.enabled {
            if self.milan.multiple_resp_threshold == 0 {
                return Err(Error::config(
                    "multiple response threshold must be at least 1",
                ));
            }
            if self.milan.cessation_duration.is_zero() {
                return Err(Error::config("cessation duration must be non-zero"));
            }
        }

        if self.faults.max_consecutive_timeouts == 0 {
            return Err(Error::config("max consecutive timeouts must be at least 1"));
        }
        if self.faults.max_hardware_failures == 0 {
            return Err(Error::config("max hardware failures must be at least 1"));
        }

        Ok(())
    }

    fn validate_servo(&self) -> Result<()> {
        let servo = &self.servo;
        if !(servo.kp.is_finite() && servo.kp > 0.0) {
            return Err(Error::config(format!("kp {} must be positive", servo.kp)));
        }
        if !(servo.ki.is_finite() && servo.ki > 0.0) {
            return Err(Error::config(format!("ki {} must be positive", servo.ki)));
        }
        if !(servo.min_frequency_adjustment_ppb < servo.max_frequency_adjustment_ppb) {
            return Err(Error::config(format!(
                "frequency adjustment range [{}, {}] is empty",
                servo.min_frequency_adjustment_ppb, servo.max_frequency_adjustment_ppb
            )));
        }
        if servo.min_frequency_adjustment_ppb > 0.0 || servo.max_frequency_adjustment_ppb < 0.0 {
            return Err(Error::config(
                "frequency adjustment range must contain zero",
            ));
        }
        if servo.offset_filter_size == 0 {
            return Err(Error::config("offset filter size must be non-zero"));
        }
        if !(servo.min_offset_threshold_ns > 0.0
            && servo.min_offset_threshold_ns < servo.max_offset_threshold_ns)
        {
            return Err(Error::config(format!(
                "offset thresholds must satisfy 0 < min ({}) < max ({})",
                servo.min_offset_threshold_ns, servo.max_offset_threshold_ns
            )));
        }
        if !(servo.clock_jump_threshold_ns > servo.max_offset_threshold_ns) {
            return Err(Error::config(
                "clock jump threshold must exceed the max offset threshold",
            ));
        }
        if servo.lock_cycles == 0 {
            return Err(Error::config("lock cycles must be at least 1"));
        }
        Ok(())
    }

    fn validate_path_delay(&self) -> Result<()> {
        let pd = &self.path_delay;
        if pd.filter_size == 0 {
            return Err(Error::config("path delay filter size must be non-zero"));
        }
        if !(pd.neighbor_prop_delay_thresh_ns > 0.0) {
            return Err(Error::config(
                "neighbor propagation delay threshold must be positive",
            ));
        }
        if !(pd.rate_ratio_min > 0.0 && pd.rate_ratio_min < 1.0 && pd.rate_ratio_max > 1.0) {
            return Err(Error::config(format!(
                "rate ratio range [{}, {}] must bracket 1.0",
                pd.rate_ratio_min, pd.rate_ratio_max
            )));
        }
        if pd.as_capable_threshold == 0 {
            return Err(Error::config("asCapable threshold must be at least 1"));
        }
        if pd.pdelay_resp_receipt_timeout > pd.pdelay_interval {
            return Err(Error::config(
                "pdelay response receipt timeout must not exceed the pdelay interval",
            ));
        }
        Ok(())
    }
}
