//! Offset filter and PI clock servo

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::ServoConfig;

/// Exponentially weighted moving average over the last `window` offsets
///
/// Weights decay by `1 - alpha` per sample with `alpha = 2 / (window + 1)`.
/// The average is computed relative to the newest sample, so a window full
/// of identical offsets yields exactly that offset.
#[derive(Debug, Clone)]
pub struct OffsetFilter {
    window: usize,
    decay: f64,
    samples: VecDeque<f64>,
}

impl OffsetFilter {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        let alpha = 2.0 / (window as f64 + 1.0);
        OffsetFilter {
            window,
            decay: 1.0 - alpha,
            samples: VecDeque::with_capacity(window),
        }
    }

    /// Adds a sample and returns the filtered value
    pub fn push(&mut self, offset: f64) -> f64 {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(offset);
        self.value().unwrap_or(offset)
    }

    pub fn value(&self) -> Option<f64> {
        let newest = *self.samples.back()?;
        let mut weight = 1.0;
        let mut weight_sum = 0.0;
        let mut deviation = 0.0;
        for sample in self.samples.iter().rev() {
            deviation += weight * (sample - newest);
            weight_sum += weight;
            weight *= self.decay;
        }
        Some(newest + deviation / weight_sum)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// PI controller with integral anti-windup
#[derive(Debug, Clone)]
pub struct PiController {
    kp: f64,
    ki: f64,
    min_output: f64,
    max_output: f64,
    integral: f64,
}

impl PiController {
    pub fn new(kp: f64, ki: f64, min_output: f64, max_output: f64) -> Self {
        PiController {
            kp,
            ki,
            min_output,
            max_output,
            integral: 0.0,
        }
    }

    /// `Kp·error + Ki·∫error`, with both the integral term and the output
    /// clamped to the output range
    pub fn update(&mut self, error: f64) -> f64 {
        self.integral += error;
        let integral_term = (self.ki * self.integral).clamp(self.min_output, self.max_output);
        self.integral = integral_term / self.ki;
        (self.kp * error + integral_term).clamp(self.min_output, self.max_output)
    }

    pub fn integral_term(&self) -> f64 {
        self.ki * self.integral
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
    }
}

/// Lock state reported by the servo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServoState {
    Unlocked,
    Locked,
}

/// Correction the caller must apply to the clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServoAction {
    /// One-shot phase step by `offset_ns`
    PhaseStep { offset_ns: i64 },
    /// Frequency adjustment in ppb
    Frequency { ppb: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoOutput {
    pub action: ServoAction,
    pub filtered_offset_ns: f64,
    /// Set when this sample changed the lock state
    pub state_change: Option<ServoState>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ServoStatistics {
    pub samples: u64,
    pub clock_jumps: u64,
    pub frequency_adjustments: u64,
    pub phase_adjustments: u64,
    pub lock_acquired: u64,
    pub lock_lost: u64,
    pub last_offset_ns: f64,
    pub filtered_offset_ns: f64,
    pub max_abs_offset_ns: f64,
    pub last_frequency_ppb: f64,
}

/// Converts raw master offsets into clock corrections
#[derive(Debug, Clone)]
pub struct Servo {
    config: ServoConfig,
    filter: OffsetFilter,
    pi: PiController,
    state: ServoState,
    in_range_cycles: u32,
    stats: ServoStatistics,
}

impl Servo {
    pub fn new(config: &ServoConfig) -> Self {
        Servo {
            config: config.clone(),
            filter: OffsetFilter::new(config.offset_filter_size),
            pi: PiController::new(
                config.kp,
                config.ki,
                config.min_frequency_adjustment_ppb,
                config.max_frequency_adjustment_ppb,
            ),
            state: ServoState::Unlocked,
            in_range_cycles: 0,
            stats: ServoStatistics::default(),
        }
    }

    /// Feeds one raw offset (slave minus master, in ns)
    pub fn sample(&mut self, raw_offset_ns: f64) -> ServoOutput {
        self.stats.samples += 1;
        self.stats.last_offset_ns = raw_offset_ns;
        self.stats.max_abs_offset_ns = self.stats.max_abs_offset_ns.max(raw_offset_ns.abs());

        if raw_offset_ns.abs() >= self.config.clock_jump_threshold_ns {
            return self.step(raw_offset_ns);
        }

        let filtered = self.filter.push(raw_offset_ns);
        self.stats.filtered_offset_ns = filtered;

        let ppb = self.pi.update(-filtered);
        self.stats.frequency_adjustments += 1;
        self.stats.last_frequency_ppb = ppb;

        let magnitude = filtered.abs();
        let previous = self.state;
        if self.filter.len() < self.config.min_samples
            || magnitude > self.config.max_offset_threshold_ns
        {
            self.in_range_cycles = 0;
            self.state = ServoState::Unlocked;
        } else if magnitude < self.config.min_offset_threshold_ns {
            self.in_range_cycles = self.in_range_cycles.saturating_add(1);
            if self.in_range_cycles >= self.config.lock_cycles {
                self.state = ServoState::Locked;
            }
        } else {
            self.in_range_cycles = 0;
        }

        let state_change = (self.state != previous).then_some(self.state);
        match state_change {
            Some(ServoState::Locked) => {
                self.stats.lock_acquired += 1;
                info!(offset_ns = filtered, ppb, "Servo locked");
            }
            Some(ServoState::Unlocked) => {
                self.stats.lock_lost += 1;
                warn!(offset_ns = filtered, "Servo lost lock");
            }
            None => debug!(raw_ns = raw_offset_ns, filtered_ns = filtered, ppb, "Servo sample"),
        }

        ServoOutput {
            action: ServoAction::Frequency { ppb },
            filtered_offset_ns: filtered,
            state_change,
        }
    }

    /// Treats `offset_ns` as a clock jump and requests a one-shot phase step
    pub fn step(&mut self, offset_ns: f64) -> ServoOutput {
        self.stats.clock_jumps += 1;
        self.stats.phase_adjustments += 1;
        warn!(offset_ns, "Clock jump detected, stepping phase");

        let previous = self.state;
        self.filter.reset();
        self.pi.reset();
        self.in_range_cycles = 0;
        self.state = ServoState::Unlocked;
        self.stats.filtered_offset_ns = 0.0;

        let state_change = (previous == ServoState::Locked).then_some(ServoState::Unlocked);
        if state_change.is_some() {
            self.stats.lock_lost += 1;
        }

        ServoOutput {
            action: ServoAction::PhaseStep {
                offset_ns: -(offset_ns.round() as i64),
            },
            filtered_offset_ns: 0.0,
            state_change,
        }
    }

    pub fn state(&self) -> ServoState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state == ServoState::Locked
    }

    pub fn filtered_offset_ns(&self) -> f64 {
        self.stats.filtered_offset_ns
    }

    pub fn frequency_adjustment_ppb(&self) -> f64 {
        self.stats.last_frequency_ppb
    }

    /// Clears filter, integrator and lock state
    pub fn reset(&mut self) {
        self.filter.reset();
        self.pi.reset();
        self.in_range_cycles = 0;
        self.state = ServoState::Unlocked;
        self.stats.filtered_offset_ns = 0.0;
        self.stats.last_frequency_ppb = 0.0;
    }

    pub fn statistics(&self) -> ServoStatistics {
        self.stats
    }

    pub fn clear_statistics(&mut self) {
        self.stats = ServoStatistics::default();
    }
}
