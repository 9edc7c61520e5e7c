//! Link delay filtering and asCapable qualification

use std::collections::VecDeque;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::PathDelayMeasurement;
use crate::core::{PathDelayConfig, TimeInterval};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkDelayStatistics {
    pub measurements: u64,
    pub accepted: u64,
    pub threshold_violations: u64,
    pub rate_ratio_violations: u64,
    pub as_capable_changes: u64,
    pub min_delay_ns: Option<f64>,
    pub max_delay_ns: Option<f64>,
}

/// Moving average of the measured propagation delay plus the asCapable
/// qualification built on top of it
#[derive(Debug, Clone)]
pub struct LinkDelay {
    filter_size: usize,
    thresh_ns: f64,
    rate_ratio_min: f64,
    rate_ratio_max: f64,
    as_capable_threshold: u32,
    window: VecDeque<f64>,
    mean_ns: f64,
    variation_ns: f64,
    rate_ratio: f64,
    consecutive_good: u32,
    as_capable: bool,
    measurement_count: u64,
    last_measurement: Option<Instant>,
    stats: LinkDelayStatistics,
}

impl LinkDelay {
    pub fn new(config: &PathDelayConfig) -> Self {
        let filter_size = config.filter_size.max(1);
        LinkDelay {
            filter_size,
            thresh_ns: config.neighbor_prop_delay_thresh_ns,
            rate_ratio_min: config.rate_ratio_min,
            rate_ratio_max: config.rate_ratio_max,
            as_capable_threshold: config.as_capable_threshold,
            window: VecDeque::with_capacity(filter_size),
            mean_ns: 0.0,
            variation_ns: 0.0,
            rate_ratio: 1.0,
            consecutive_good: 0,
            as_capable: false,
            measurement_count: 0,
            last_measurement: None,
            stats: LinkDelayStatistics::default(),
        }
    }

    /// Records one computed delay and rate ratio
    ///
    /// Only measurements inside the threshold and rate range enter the
    /// average. Returns true when asCapable changed.
    pub fn record(&mut self, delay_ns: f64, rate_ratio: f64, now: Instant) -> bool {
        self.stats.measurements += 1;
        self.measurement_count += 1;
        self.last_measurement = Some(now);
        self.rate_ratio = rate_ratio;

        self.stats.min_delay_ns = Some(self.stats.min_delay_ns.map_or(delay_ns, |m| m.min(delay_ns)));
        self.stats.max_delay_ns = Some(self.stats.max_delay_ns.map_or(delay_ns, |m| m.max(delay_ns)));

        let rate_ok = (self.rate_ratio_min..=self.rate_ratio_max).contains(&rate_ratio);
        let delay_ok = delay_ns < self.thresh_ns;
        if !rate_ok {
            self.stats.rate_ratio_violations += 1;
        }
        if !delay_ok {
            self.stats.threshold_violations += 1;
        }

        if !(rate_ok && delay_ok) {
            debug!(delay_ns, rate_ratio, "Link delay measurement out of range");
            self.consecutive_good = 0;
            return self.set_as_capable(false);
        }

        self.stats.accepted += 1;
        if self.window.len() == self.filter_size {
            self.window.pop_front();
        }
        self.window.push_back(delay_ns);
        self.update_average();

        self.consecutive_good = self.consecutive_good.saturating_add(1);
        if self.consecutive_good >= self.as_capable_threshold {
            self.set_as_capable(true)
        } else {
            false
        }
    }

    fn update_average(&mut self) {
        let n = self.window.len() as f64;
        self.mean_ns = self.window.iter().sum::<f64>() / n;
        let variance = self
            .window
            .iter()
            .map(|&d| (d - self.mean_ns).powi(2))
            .sum::<f64>()
            / n;
        self.variation_ns = variance.sqrt();
    }

    /// Drops asCapable without a measurement (lost responses, cessation)
    pub fn disqualify(&mut self) -> bool {
        self.consecutive_good = 0;
        self.set_as_capable(false)
    }

    fn set_as_capable(&mut self, as_capable: bool) -> bool {
        if self.as_capable == as_capable {
            return false;
        }
        self.as_capable = as_capable;
        self.stats.as_capable_changes += 1;
        if as_capable {
            info!(mean_delay_ns = self.mean_ns, rate_ratio = self.rate_ratio, "Link is asCapable");
        } else {
            warn!(mean_delay_ns = self.mean_ns, rate_ratio = self.rate_ratio, "Link lost asCapable");
        }
        true
    }

    pub fn as_capable(&self) -> bool {
        self.as_capable
    }

    pub fn mean_link_delay(&self) -> TimeInterval {
        TimeInterval::from_nanoseconds_f64(self.mean_ns)
    }

    pub fn neighbor_rate_ratio(&self) -> f64 {
        self.rate_ratio
    }

    pub fn measurement(&self) -> PathDelayMeasurement {
        PathDelayMeasurement {
            mean_link_delay: self.mean_link_delay(),
            link_delay_variation: TimeInterval::from_nanoseconds_f64(self.variation_ns),
            neighbor_rate_ratio: self.rate_ratio,
            valid: !self.window.is_empty(),
            calibrated: self.as_capable,
            measurement_count: self.measurement_count,
            last_measurement: self.last_measurement,
        }
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.mean_ns = 0.0;
        self.variation_ns = 0.0;
        self.rate_ratio = 1.0;
        self.consecutive_good = 0;
        self.as_capable = false;
        self.measurement_count = 0;
        self.last_measurement = None;
    }

    pub fn statistics(&self) -> LinkDelayStatistics {
        self.stats
    }

    pub fn clear_statistics(&mut self) {
        self.stats = LinkDelayStatistics::default();
    }
}
