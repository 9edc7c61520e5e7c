use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::bmca::PortRole;
use crate::core::{Config, PortIdentity, PortState};
use crate::time::{self_test, HardwareTimestampInterface};

/// Events consumed by the port state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortEvent {
    Powerup,
    Initialize,
    FaultDetected,
    FaultCleared,
    DesignatedEnabled,
    DesignatedDisabled,
    AnnounceReceiptTimeout,
    SyncReceiptTimeout,
    QualificationTimeout,
    /// State decision selected a master reachable through this port
    BetterMasterDetected,
    /// The selected master is now worse than the local clock
    WorseMasterDetected,
    /// State decision selected the local clock
    RecommendedMaster,
    /// State decision selected a master on another port
    RecommendedPassive,
    /// The servo locked onto the selected master
    MasterClockSelected,
    /// The servo lost lock
    SynchronizationFault,
}

impl fmt::Display for PortEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A state change performed by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortTransition {
    pub from: PortState,
    pub to: PortState,
    pub event: PortEvent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatistics {
    pub state_transitions: u64,
    pub ignored_events: u64,
    pub announce_receipt_timeouts: u64,
    pub sync_receipt_timeouts: u64,
    pub qualification_timeouts: u64,
    pub faults: u64,
    pub self_test_failures: u64,
}

/// Snapshot of the port state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub port_identity: PortIdentity,
    pub state: PortState,
    pub recommended_role: Option<PortRole>,
    pub time_in_state: Duration,
}

pub type PortStateCallback = Box<dyn FnMut(PortState, PortState, PortEvent) + Send>;

/// Per-port state holder
///
/// Every (state, event) pair outside the transition table is a no-op.
pub struct PortStateMachine {
    port_identity: PortIdentity,
    state: PortState,
    entered_at: Option<Instant>,
    qualification_timeout: Duration,
    recommended_role: Option<PortRole>,
    hardware: Arc<dyn HardwareTimestampInterface>,
    callback: Option<PortStateCallback>,
    stats: PortStatistics,
}

impl PortStateMachine {
    pub fn new(config: &Config, hardware: Arc<dyn HardwareTimestampInterface>) -> Self {
        PortStateMachine {
            port_identity: config.port_identity(),
            state: PortState::Initializing,
            entered_at: None,
            qualification_timeout: config.qualification_timeout,
            recommended_role: None,
            hardware,
            callback: None,
            stats: PortStatistics::default(),
        }
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    /// Registers the observer invoked on every transition
    pub fn set_state_change_callback(&mut self, callback: PortStateCallback) {
        self.callback = Some(callback);
    }

    /// Records the latest state decision; consulted on announce receipt timeout
    pub fn set_recommended_role(&mut self, role: Option<PortRole>) {
        self.recommended_role = role;
    }

    pub fn recommended_role(&self) -> Option<PortRole> {
        self.recommended_role
    }

    /// Applies an event, returning the transition if the state changed
    pub fn process_event(&mut self, event: PortEvent, now: Instant) -> Option<PortTransition> {
        match event {
            PortEvent::AnnounceReceiptTimeout => self.stats.announce_receipt_timeouts += 1,
            PortEvent::SyncReceiptTimeout => self.stats.sync_receipt_timeouts += 1,
            PortEvent::QualificationTimeout => self.stats.qualification_timeouts += 1,
            PortEvent::FaultDetected => self.stats.faults += 1,
            _ => {}
        }

        let next = match self.next_state(event) {
            Some(next) if next != self.state => next,
            _ => {
                self.stats.ignored_events += 1;
                debug!(port = %self.port_identity, state = %self.state, %event, "Event ignored");
                return None;
            }
        };

        let transition = PortTransition {
            from: self.state,
            to: next,
            event,
        };
        self.state = next;
        self.entered_at = Some(now);
        self.stats.state_transitions += 1;

        if next == PortState::Faulty {
            warn!(port = %self.port_identity, from = %transition.from, %event, "Port faulty");
        } else {
            info!(
                port = %self.port_identity,
                from = %transition.from,
                to = %next,
                %event,
                "Port state changed"
            );
        }
        if let Some(callback) = self.callback.as_mut() {
            callback(transition.from, transition.to, event);
        }
        Some(transition)
    }

    fn next_state(&mut self, event: PortEvent) -> Option<PortState> {
        use PortEvent as E;
        use PortState as S;

        match (self.state, event) {
            (S::Initializing, E::Powerup | E::Initialize) => {
                if self_test(self.hardware.as_ref()) {
                    Some(S::Listening)
                } else {
                    self.stats.self_test_failures += 1;
                    Some(S::Faulty)
                }
            }

            (S::Faulty, E::FaultCleared) => Some(S::Initializing),
            (_, E::FaultDetected) => Some(S::Faulty),

            (S::Disabled, E::DesignatedEnabled) => Some(S::Initializing),
            (S::Faulty, E::DesignatedDisabled) => None,
            (_, E::DesignatedDisabled) => Some(S::Disabled),

            (
                S::Listening | S::Uncalibrated | S::Slave | S::Passive,
                E::AnnounceReceiptTimeout,
            ) => {
                let local_is_best =
                    matches!(self.recommended_role, None | Some(PortRole::Master));
                if local_is_best {
                    Some(S::PreMaster)
                } else {
                    Some(S::Listening)
                }
            }

            (S::Uncalibrated | S::Slave, E::SyncReceiptTimeout) => Some(S::Listening),

            (S::PreMaster, E::QualificationTimeout) => Some(S::Master),

            (
                S::Listening | S::PreMaster | S::Master | S::Passive | S::Slave,
                E::BetterMasterDetected,
            ) => Some(S::Uncalibrated),

            (S::Master | S::Slave | S::Uncalibrated, E::WorseMasterDetected) => {
                Some(S::Listening)
            }

            (
                S::Listening | S::Uncalibrated | S::Slave | S::Passive,
                E::RecommendedMaster,
            ) => Some(S::PreMaster),

            (
                S::Listening | S::PreMaster | S::Master | S::Uncalibrated | S::Slave,
                E::RecommendedPassive,
            ) => Some(S::Passive),

            (S::Uncalibrated, E::MasterClockSelected) => Some(S::Slave),
            (S::Slave, E::SynchronizationFault) => Some(S::Uncalibrated),

            _ => None,
        }
    }

    /// Fires the qualification timeout once PRE_MASTER has lasted long enough
    pub fn tick(&mut self, now: Instant) -> Option<PortTransition> {
        if self.state != PortState::PreMaster {
            return None;
        }
        let entered = self.entered_at?;
        if now.duration_since(entered) >= self.qualification_timeout {
            self.process_event(PortEvent::QualificationTimeout, now)
        } else {
            None
        }
    }

    /// Returns to INITIALIZING without notifying observers
    pub fn reset(&mut self) {
        self.state = PortState::Initializing;
        self.entered_at = None;
        self.recommended_role = None;
    }

    pub fn info(&self, now: Instant) -> PortInfo {
        PortInfo {
            port_identity: self.port_identity,
            state: self.state,
            recommended_role: self.recommended_role,
            time_in_state: self
                .entered_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default(),
        }
    }

    pub fn statistics(&self) -> PortStatistics {
        self.stats
    }

    pub fn clear_statistics(&mut self) {
        self.stats = PortStatistics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ClockIdentity;
    use crate::time::mock::MockHardware;
    use std::sync::Mutex;

    const ALL_STATES: [PortState; 9] = [
        PortState::Initializing,
        PortState::Faulty,
        PortState::Disabled,
        PortState::Listening,
        PortState::PreMaster,
        PortState::Master,
        PortState::Passive,
        PortState::Uncalibrated,
        PortState::Slave,
    ];

    const ALL_EVENTS: [PortEvent; 15] = [
        PortEvent::Powerup,
        PortEvent::Initialize,
        PortEvent::FaultDetected,
        PortEvent::FaultCleared,
        PortEvent::DesignatedEnabled,
        PortEvent::DesignatedDisabled,
        PortEvent::AnnounceReceiptTimeout,
        PortEvent::SyncReceiptTimeout,
        PortEvent::QualificationTimeout,
        PortEvent::BetterMasterDetected,
        PortEvent::WorseMasterDetected,
        PortEvent::RecommendedMaster,
        PortEvent::RecommendedPassive,
        PortEvent::MasterClockSelected,
        PortEvent::SynchronizationFault,
    ];

    fn machine() -> (PortStateMachine, Arc<MockHardware>) {
        let hardware = Arc::new(MockHardware::new());
        let config = Config {
            clock_identity: ClockIdentity([0x10; 8]),
            ..Config::default()
        };
        (PortStateMachine::new(&config, hardware.clone()), hardware)
    }

    /// The documented transition table, independent of the implementation
    fn expected(state: PortState, event: PortEvent) -> Option<PortState> {
        use PortEvent as E;
        use PortState as S;
        let next = match (state, event) {
            (S::Initializing, E::Powerup | E::Initialize) => S::Listening,
            (S::Faulty, E::FaultCleared) => S::Initializing,
            (S::Faulty, _) => return None,
            (_, E::FaultDetected) => S::Faulty,
            (S::Disabled, E::DesignatedEnabled) => S::Initializing,
            (S::Disabled, _) => return None,
            (_, E::DesignatedDisabled) => S::Disabled,
            (S::Listening, E::AnnounceReceiptTimeout) => S::PreMaster,
            (S::Uncalibrated | S::Slave | S::Passive, E::AnnounceReceiptTimeout) => S::PreMaster,
            (S::Uncalibrated | S::Slave, E::SyncReceiptTimeout) => S::Listening,
            (S::PreMaster, E::QualificationTimeout) => S::Master,
            (S::Listening | S::PreMaster | S::Master | S::Passive | S::Slave, E::BetterMasterDetected) => {
                S::Uncalibrated
            }
            (S::Master | S::Slave | S::Uncalibrated, E::WorseMasterDetected) => S::Listening,
            (S::Listening | S::Uncalibrated | S::Slave | S::Passive, E::RecommendedMaster) => {
                S::PreMaster
            }
            (S::Listening | S::PreMaster | S::Master | S::Uncalibrated | S::Slave, E::RecommendedPassive) => {
                S::Passive
            }
            (S::Uncalibrated, E::MasterClockSelected) => S::Slave,
            (S::Slave, E::SynchronizationFault) => S::Uncalibrated,
            _ => return None,
        };
        Some(next)
    }

    #[test]
    fn test_powerup_to_listening() {
        let (mut sm, _hw) = machine();
        let now = Instant::now();
        let t = sm.process_event(PortEvent::Powerup, now).unwrap();
        assert_eq!(t.from, PortState::Initializing);
        assert_eq!(t.to, PortState::Listening);
    }

    #[test]
    fn test_powerup_self_test_failure() {
        let (mut sm, hw) = machine();
        hw.set_clock_failing(true);
        sm.process_event(PortEvent::Powerup, Instant::now());
        assert_eq!(sm.state(), PortState::Faulty);
        assert_eq!(sm.statistics().self_test_failures, 1);

        hw.set_clock_failing(false);
        sm.process_event(PortEvent::FaultCleared, Instant::now());
        assert_eq!(sm.state(), PortState::Initializing);
        sm.process_event(PortEvent::Initialize, Instant::now());
        assert_eq!(sm.state(), PortState::Listening);
    }

    #[test]
    fn test_full_transition_table() {
        let now = Instant::now();
        for state in ALL_STATES {
            for event in ALL_EVENTS {
                let (mut sm, _hw) = machine();
                sm.state = state;
                let result = sm.process_event(event, now);
                let expected = expected(state, event).filter(|next| *next != state);
                match expected {
                    Some(next) => {
                        assert_eq!(sm.state(), next, "{} + {}", state, event);
                        assert_eq!(result.map(|t| t.to), Some(next));
                    }
                    None => {
                        assert_eq!(sm.state(), state, "{} + {} must be a no-op", state, event);
                        assert!(result.is_none());
                    }
                }
            }
        }
    }

    #[test]
    fn test_announce_timeout_respects_recommendation() {
        let (mut sm, _hw) = machine();
        let now = Instant::now();
        sm.process_event(PortEvent::Powerup, now);
        sm.set_recommended_role(Some(PortRole::Slave));
        assert!(sm.process_event(PortEvent::AnnounceReceiptTimeout, now).is_none());
        assert_eq!(sm.state(), PortState::Listening);

        sm.set_recommended_role(Some(PortRole::Master));
        sm.process_event(PortEvent::AnnounceReceiptTimeout, now);
        assert_eq!(sm.state(), PortState::PreMaster);
    }

    #[test]
    fn test_qualification_timeout() {
        let (mut sm, _hw) = machine();
        let t0 = Instant::now();
        sm.process_event(PortEvent::Powerup, t0);
        sm.process_event(PortEvent::AnnounceReceiptTimeout, t0);
        assert_eq!(sm.state(), PortState::PreMaster);

        assert!(sm.tick(t0 + Duration::from_millis(990)).is_none());
        let t = sm.tick(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(t.event, PortEvent::QualificationTimeout);
        assert_eq!(sm.state(), PortState::Master);
        assert_eq!(sm.statistics().qualification_timeouts, 1);
    }

    #[test]
    fn test_callback_receives_transitions() {
        let (mut sm, _hw) = machine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        sm.set_state_change_callback(Box::new(move |from, to, event| {
            sink.lock().unwrap().push((from, to, event));
        }));

        let now = Instant::now();
        sm.process_event(PortEvent::Powerup, now);
        sm.process_event(PortEvent::MasterClockSelected, now);
        sm.process_event(PortEvent::BetterMasterDetected, now);
        sm.process_event(PortEvent::MasterClockSelected, now);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (PortState::Initializing, PortState::Listening, PortEvent::Powerup),
                (
                    PortState::Listening,
                    PortState::Uncalibrated,
                    PortEvent::BetterMasterDetected
                ),
                (
                    PortState::Uncalibrated,
                    PortState::Slave,
                    PortEvent::MasterClockSelected
                ),
            ]
        );
        assert_eq!(sm.statistics().ignored_events, 1);
    }
}
