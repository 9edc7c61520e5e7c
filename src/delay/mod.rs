//! Peer-to-peer path delay
//!
//! The initiator measures the propagation delay and neighbor rate ratio of
//! the attached link; the responder answers the neighbor's requests. Both run
//! on every port regardless of its PTP state.

pub mod initiator;
pub mod link;
pub mod responder;

use std::time::Instant;

use serde::Serialize;

use crate::core::TimeInterval;

pub use self::initiator::{InitiatorStatistics, InitiatorTick, MilanStatus, PathDelayInitiator};
pub use self::link::{LinkDelay, LinkDelayStatistics};
pub use self::responder::{InvalidRequest, PathDelayResponder, ResponderStatistics};

/// Read-only view of the current link delay estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PathDelayMeasurement {
    pub mean_link_delay: TimeInterval,
    /// Standard deviation over the filter window
    pub link_delay_variation: TimeInterval,
    pub neighbor_rate_ratio: f64,
    /// At least one measurement is in the filter
    pub valid: bool,
    /// The link is asCapable
    pub calibrated: bool,
    pub measurement_count: u64,
    #[serde(skip)]
    pub last_measurement: Option<Instant>,
}
