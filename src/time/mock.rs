//! Simulated hardware clock used by the test suite

use std::collections::HashMap;
use std::sync::Mutex;

use super::hardware::{HardwareError, HardwareResult, HardwareTimestampInterface};
use crate::core::Timestamp;

/// How the simulated NIC answers transmit timestamp queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Return the current clock time
    Clock,
    /// Return only timestamps registered with `set_tx_timestamp`
    Explicit,
    /// Never produce a timestamp
    Unavailable,
    /// Fail hard
    Failing,
}

#[derive(Debug)]
struct State {
    clock: Timestamp,
    tx_mode: TxMode,
    tx_timestamps: HashMap<u16, Timestamp>,
    clock_failing: bool,
    adjust_failing: bool,
    one_step: bool,
    two_step: bool,
    frequency_adjustments: Vec<f64>,
    phase_adjustments: Vec<i64>,
}

#[derive(Debug)]
pub struct MockHardware {
    state: Mutex<State>,
}

impl MockHardware {
    pub fn new() -> Self {
        MockHardware {
            state: Mutex::new(State {
                clock: Timestamp::new(1_000, 0).unwrap(),
                tx_mode: TxMode::Clock,
                tx_timestamps: HashMap::new(),
                clock_failing: false,
                adjust_failing: false,
                one_step: false,
                two_step: true,
                frequency_adjustments: Vec::new(),
                phase_adjustments: Vec::new(),
            }),
        }
    }

    pub fn set_time(&self, time: Timestamp) {
        self.state.lock().unwrap().clock = time;
    }

    pub fn advance_nanos(&self, nanos: i128) {
        let mut state = self.state.lock().unwrap();
        state.clock = Timestamp::from_nanos(state.clock.to_nanos() + nanos).unwrap();
    }

    pub fn set_tx_mode(&self, mode: TxMode) {
        self.state.lock().unwrap().tx_mode = mode;
    }

    pub fn set_tx_timestamp(&self, sequence_id: u16, time: Timestamp) {
        self.state
            .lock()
            .unwrap()
            .tx_timestamps
            .insert(sequence_id, time);
    }

    pub fn set_clock_failing(&self, failing: bool) {
        self.state.lock().unwrap().clock_failing = failing;
    }

    pub fn set_adjust_failing(&self, failing: bool) {
        self.state.lock().unwrap().adjust_failing = failing;
    }

    pub fn set_capabilities(&self, one_step: bool, two_step: bool) {
        let mut state = self.state.lock().unwrap();
        state.one_step = one_step;
        state.two_step = two_step;
    }

    pub fn frequency_adjustments(&self) -> Vec<f64> {
        self.state.lock().unwrap().frequency_adjustments.clone()
    }

    pub fn phase_adjustments(&self) -> Vec<i64> {
        self.state.lock().unwrap().phase_adjustments.clone()
    }
}

impl HardwareTimestampInterface for MockHardware {
    fn capture_tx_timestamp(&self, sequence_id: u16) -> HardwareResult<Timestamp> {
        let state = self.state.lock().unwrap();
        match state.tx_mode {
            TxMode::Clock => Ok(state.clock),
            TxMode::Explicit => state
                .tx_timestamps
                .get(&sequence_id)
                .copied()
                .ok_or(HardwareError::Timeout),
            TxMode::Unavailable => Err(HardwareError::Timeout),
            TxMode::Failing => Err(HardwareError::Failed("tx timestamp queue broken".into())),
        }
    }

    fn capture_rx_timestamp(&self, _sequence_id: u16) -> HardwareResult<Timestamp> {
        let state = self.state.lock().unwrap();
        if state.clock_failing {
            return Err(HardwareError::Failed("clock unreadable".into()));
        }
        Ok(state.clock)
    }

    fn adjust_clock_frequency(&self, ppb: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.adjust_failing {
            return false;
        }
        state.frequency_adjustments.push(ppb);
        true
    }

    fn adjust_clock_phase(&self, offset_ns: i64) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.adjust_failing {
            return false;
        }
        state.phase_adjustments.push(offset_ns);
        let adjusted = state.clock.to_nanos() + offset_ns as i128;
        if let Ok(clock) = Timestamp::from_nanos(adjusted) {
            state.clock = clock;
        }
        true
    }

    fn set_clock_time(&self, time: Timestamp) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.clock_failing {
            return false;
        }
        state.clock = time;
        true
    }

    fn get_clock_time(&self) -> HardwareResult<Timestamp> {
        let state = self.state.lock().unwrap();
        if state.clock_failing {
            return Err(HardwareError::Failed("clock unreadable".into()));
        }
        Ok(state.clock)
    }

    fn supports_one_step(&self) -> bool {
        self.state.lock().unwrap().one_step
    }

    fn supports_two_step(&self) -> bool {
        self.state.lock().unwrap().two_step
    }

    fn timestamp_accuracy_ns(&self) -> u32 {
        8
    }
}
