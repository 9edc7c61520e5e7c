//! Port coordinator
//!
//! The coordinator owns every state machine of one port and drives them from
//! a single `tick`. Each tick visits the machines in a fixed order:
//!
//! 1. path delay (initiator and responder)
//! 2. Announce transmission and reception
//! 3. Sync transmission and reception
//! 4. BMCA, when the foreign master table changed or reselection is due
//! 5. port state machine
//!
//! Timeouts are detected only inside `tick`, so the embedding application
//! must call it at least every `Config::tick_interval` (10 ms by default).
//! Late ticks delay detection by the same amount.
//!
//! Repeated timeouts, hardware failures and explicit fault reports move the
//! coordinator to RECOVERY_MODE. Recovery happens automatically after the
//! configured timeout or on a manual trigger.

pub mod driver;
#[cfg(test)]
mod scenarios;
pub mod status;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::core::{Config, Dataset, PortIdentity, PortState, Result, TimeInterval, Timestamp};
use crate::delay::{PathDelayInitiator, PathDelayMeasurement, PathDelayResponder};
use crate::protocol::announce::{AnnounceReceiver, AnnounceTransmitter, MasterInfo};
use crate::protocol::bmca::{BmcaDecision, BmcaEngine, PortRole};
use crate::protocol::message::{
    AnnounceMessage, FollowUpMessage, PdelayReqMessage, PdelayRespFollowUpMessage,
    PdelayRespMessage, SyncMessage,
};
use crate::protocol::state::{PortEvent, PortStateCallback, PortStateMachine};
use crate::protocol::transport::MessageTransmitter;
use crate::sync::{SlaveEvent, SyncInfo, SyncReceiver, SyncTransmitter};
use crate::time::{self_test, HardwareTimestampInterface};

pub use self::driver::{ChannelTransmitter, Driver, Inbound};
pub use self::status::{
    EdgeCaseStatus, ManagerEvent, ManagerState, ManagerStatistics, Statistics, SystemStatus,
};

/// Observer of coordinator state changes: (old, new)
pub type ManagerStateCallback = Box<dyn FnMut(ManagerState, ManagerState) + Send>;
/// Fault observer: (description, critical)
pub type FaultCallback = Box<dyn FnMut(&str, bool) + Send>;
/// Recovery observer: (successful, details)
pub type RecoveryCallback = Box<dyn FnMut(bool, &str) + Send>;

/// Congestion level at or above which receipt timeouts are not escalated
pub const CONGESTION_THRESHOLD: f64 = 0.5;

const MAX_ACTIVE_FAULTS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Recovery {
    started: Instant,
}

/// Superstate machine for one gPTP port
pub struct Coordinator {
    config: Config,
    hardware: Arc<dyn HardwareTimestampInterface>,
    port: PortStateMachine,
    bmca: BmcaEngine,
    announce_tx: AnnounceTransmitter,
    announce_rx: AnnounceReceiver,
    sync_tx: SyncTransmitter,
    sync_rx: SyncReceiver,
    pdelay: PathDelayInitiator,
    responder: PathDelayResponder,
    state: ManagerState,
    state_entered: Option<Instant>,
    started_at: Option<Instant>,
    port_enabled: bool,
    link_up: bool,
    reselect_due: Option<Instant>,
    force_reselect: bool,
    foreign: Vec<Dataset>,
    selected_master: Option<PortIdentity>,
    consecutive_timeouts: u32,
    asymmetry_pending: bool,
    recovery: Option<Recovery>,
    active_faults: Vec<String>,
    edge: EdgeCaseStatus,
    state_callback: Option<ManagerStateCallback>,
    fault_callback: Option<FaultCallback>,
    recovery_callback: Option<RecoveryCallback>,
    stats: ManagerStatistics,
}

impl Coordinator {
    /// Builds the coordinator and every sub-machine from a validated
    /// configuration
    pub fn new(
        config: Config,
        hardware: Arc<dyn HardwareTimestampInterface>,
        transmitter: Arc<dyn MessageTransmitter>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Coordinator {
            port: PortStateMachine::new(&config, hardware.clone()),
            bmca: BmcaEngine::new(config.port_number),
            announce_tx: AnnounceTransmitter::new(&config, transmitter.clone()),
            announce_rx: AnnounceReceiver::new(&config),
            sync_tx: SyncTransmitter::new(&config, hardware.clone(), transmitter.clone()),
            sync_rx: SyncReceiver::new(&config, hardware.clone()),
            pdelay: PathDelayInitiator::new(&config, hardware.clone(), transmitter.clone()),
            responder: PathDelayResponder::new(&config, hardware.clone(), transmitter),
            foreign: Vec::with_capacity(config.max_foreign_masters),
            hardware,
            state: ManagerState::Uninitialized,
            state_entered: None,
            started_at: None,
            port_enabled: true,
            link_up: true,
            reselect_due: None,
            force_reselect: false,
            selected_master: None,
            consecutive_timeouts: 0,
            asymmetry_pending: false,
            recovery: None,
            active_faults: Vec::new(),
            edge: EdgeCaseStatus::default(),
            state_callback: None,
            fault_callback: None,
            recovery_callback: None,
            stats: ManagerStatistics::default(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hardware(&self) -> &Arc<dyn HardwareTimestampInterface> {
        &self.hardware
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn port_state(&self) -> PortState {
        self.port.state()
    }

    // Lifecycle

    pub fn start(&mut self) -> Result<()> {
        self.start_at(Instant::now())
    }

    /// Powers up the port; a no-op when already running
    pub fn start_at(&mut self, now: Instant) -> Result<()> {
        if self.state != ManagerState::Uninitialized {
            debug!(port = self.config.port_number, state = %self.state, "Already started");
            return Ok(());
        }
        info!(
            port = self.config.port_number,
            clock = %self.config.clock_identity,
            "Starting gPTP port"
        );
        self.started_at = Some(now);
        self.set_state(ManagerState::Initializing, now);

        self.port.process_event(PortEvent::Powerup, now);
        if self.port.state() == PortState::Faulty {
            self.set_state(ManagerState::FaultDetection, now);
            self.enter_recovery(now, "hardware self test failed at power-up", true);
            return Ok(());
        }

        self.start_machines(now);
        if !self.operational() {
            self.port.process_event(PortEvent::DesignatedDisabled, now);
        }
        self.sync_state(now);
        Ok(())
    }

    /// Stops every machine and returns to UNINITIALIZED
    ///
    /// Idempotent. `reset` followed by `start` is always safe afterwards.
    pub fn stop(&mut self) {
        if self.state == ManagerState::Uninitialized {
            return;
        }
        info!(port = self.config.port_number, "Stopping gPTP port");
        self.stop_machines();
        self.port.reset();
        self.recovery = None;
        self.asymmetry_pending = false;
        self.started_at = None;
        self.set_state(ManagerState::Uninitialized, Instant::now());
    }

    /// Stops and clears all protocol state; statistics are kept
    pub fn reset(&mut self) {
        self.stop();
        self.announce_rx.reset();
        self.bmca.reset();
        self.sync_rx.reset();
        self.pdelay.reset();
        self.responder.reset();
        self.sync_tx.reset_health();
        self.selected_master = None;
        self.consecutive_timeouts = 0;
        self.active_faults.clear();
        self.edge = EdgeCaseStatus::default();
    }

    fn operational(&self) -> bool {
        self.port_enabled && self.link_up
    }

    fn start_machines(&mut self, now: Instant) {
        if !self.operational() {
            return;
        }
        self.responder.enable();
        self.pdelay.enable(now);
        self.announce_rx.start(now);
        self.reselect_due = Some(now);
    }

    fn stop_machines(&mut self) {
        self.announce_tx.disable();
        self.announce_rx.stop();
        self.sync_tx.disable();
        self.sync_rx.disable();
        self.pdelay.disable();
        self.responder.disable();
        self.reselect_due = None;
    }

    // Message entry points

    pub fn process_announce(&mut self, msg: &AnnounceMessage) {
        self.process_announce_at(msg, Instant::now())
    }

    pub fn process_announce_at(&mut self, msg: &AnnounceMessage, now: Instant) {
        if !self.running() {
            return;
        }
        // Rejections are counted by the receiver
        let _ = self.announce_rx.process_announce(msg, now);
    }

    pub fn process_sync(&mut self, msg: &SyncMessage, rx_timestamp: Timestamp) {
        self.process_sync_at(msg, rx_timestamp, Instant::now())
    }

    pub fn process_sync_at(&mut self, msg: &SyncMessage, rx_timestamp: Timestamp, now: Instant) {
        if !self.running() {
            return;
        }
        let before = self.sync_rx.statistics().offsets_computed;
        let event = self.sync_rx.process_sync(msg, rx_timestamp, now);
        let measured = self.sync_rx.statistics().offsets_computed > before;
        self.after_sync(measured, event, now);
    }

    pub fn process_follow_up(&mut self, msg: &FollowUpMessage) {
        self.process_follow_up_at(msg, Instant::now())
    }

    pub fn process_follow_up_at(&mut self, msg: &FollowUpMessage, now: Instant) {
        if !self.running() {
            return;
        }
        let before = self.sync_rx.statistics().offsets_computed;
        let event = self.sync_rx.process_follow_up(msg, now);
        let measured = self.sync_rx.statistics().offsets_computed > before;
        self.after_sync(measured, event, now);
    }

    pub fn process_pdelay_request(&mut self, msg: &PdelayReqMessage, rx_timestamp: Timestamp) {
        self.process_pdelay_request_at(msg, rx_timestamp, Instant::now())
    }

    pub fn process_pdelay_request_at(
        &mut self,
        msg: &PdelayReqMessage,
        rx_timestamp: Timestamp,
        now: Instant,
    ) {
        if !self.running() {
            return;
        }
        let _ = self.responder.process_request(msg, rx_timestamp, now);
        self.check_hardware(now);
    }

    pub fn process_pdelay_response(&mut self, msg: &PdelayRespMessage, rx_timestamp: Timestamp) {
        if self.running() {
            self.pdelay.process_response(msg, rx_timestamp);
        }
    }

    pub fn process_pdelay_response_follow_up(&mut self, msg: &PdelayRespFollowUpMessage) {
        if self.running() {
            self.pdelay.process_response_follow_up(msg);
        }
    }

    fn running(&self) -> bool {
        !matches!(
            self.state,
            ManagerState::Uninitialized | ManagerState::RecoveryMode
        )
    }

    fn after_sync(&mut self, measured: bool, event: Option<SlaveEvent>, now: Instant) {
        if measured {
            self.consecutive_timeouts = 0;
        }
        match event {
            Some(SlaveEvent::Locked) => {
                self.port.process_event(PortEvent::MasterClockSelected, now);
            }
            Some(SlaveEvent::LockLost) => {
                self.port.process_event(PortEvent::SynchronizationFault, now);
            }
            Some(SlaveEvent::ClockJump) => {
                self.edge.clock_jump_detected = true;
                self.port.process_event(PortEvent::SynchronizationFault, now);
            }
            None => {}
        }
        self.check_hardware(now);
        self.sync_state(now);
    }

    // Tick

    pub fn tick(&mut self) {
        self.tick_at(Instant::now())
    }

    /// Advances every machine to `now`
    pub fn tick_at(&mut self, now: Instant) {
        match self.state {
            ManagerState::Uninitialized => return,
            ManagerState::RecoveryMode => {
                self.tick_recovery(now);
                return;
            }
            _ => {}
        }
        self.asymmetry_pending = false;

        // 1. Path delay
        let link_measured = self.pdelay.measurement().valid;
        self.responder.tick(now);
        let pdelay = self.pdelay.tick(now);
        if pdelay.measured {
            self.sync_rx
                .set_mean_path_delay(self.pdelay.measurement().mean_link_delay);
            self.consecutive_timeouts = 0;
        }
        if pdelay.response_timeout && link_measured {
            self.count_timeout("PDelay response");
        }
        if pdelay.cessation_started {
            self.edge.milan_cessation_active = true;
            self.report_fault("multiple PDelay responders, PDelay transmission ceased", false);
        }
        if pdelay.cessation_ended {
            self.edge.milan_cessation_active = false;
        }

        // 2. Announce
        self.announce_tx.tick(now);
        let announce = self.announce_rx.tick(now);
        if announce.receipt_timeout {
            if matches!(
                self.port.state(),
                PortState::Uncalibrated | PortState::Slave | PortState::Passive
            ) {
                self.count_timeout("Announce receipt");
            }
            // The table is empty, so a role from the last BMCA run is stale
            self.selected_master = None;
            self.port.set_recommended_role(None);
            self.port.process_event(PortEvent::AnnounceReceiptTimeout, now);
        }

        // 3. Sync
        self.sync_tx.tick(now);
        if self.sync_rx.tick(now) {
            self.count_timeout("Sync receipt");
            self.port.process_event(PortEvent::SyncReceiptTimeout, now);
        }

        // 4. BMCA
        let reselect = matches!(self.reselect_due, Some(due) if now >= due);
        if self.operational() && (announce.reevaluate || self.force_reselect || reselect) {
            self.run_bmca(now);
        }

        // 5. Port state machine
        self.port.tick(now);

        self.apply_port_state(now);
        self.check_hardware(now);
        if self.consecutive_timeouts >= self.config.faults.max_consecutive_timeouts {
            let reason = format!("{} consecutive receipt timeouts", self.consecutive_timeouts);
            self.enter_recovery(now, &reason, false);
            return;
        }
        self.sync_state(now);
    }

    fn count_timeout(&mut self, kind: &str) {
        self.stats.timeout_events += 1;
        if self.edge.network_congestion_detected {
            debug!(port = self.config.port_number, kind, "Timeout during congestion, not escalated");
            return;
        }
        self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1);
        warn!(
            port = self.config.port_number,
            kind,
            consecutive = self.consecutive_timeouts,
            "Receipt timeout"
        );
    }

    fn local_dataset(&self) -> Dataset {
        Dataset::local(
            self.config.port_identity(),
            self.config.clock_quality,
            self.config.priority1,
            self.config.priority2,
        )
    }

    fn run_bmca(&mut self, now: Instant) {
        self.force_reselect = false;
        self.reselect_due = Some(now + self.config.reselect_interval);

        let local = self.local_dataset();
        self.announce_rx.snapshot_into(&mut self.foreign);
        match self.bmca.select(&local, &self.foreign) {
            Ok(decision) => self.apply_decision(decision, now),
            Err(e) => {
                self.edge.bmca_conflict_detected = true;
                self.report_fault(&e.to_string(), true);
                self.port.set_recommended_role(Some(PortRole::Passive));
                self.port.process_event(PortEvent::RecommendedPassive, now);
                self.selected_master = None;
            }
        }
    }

    fn apply_decision(&mut self, decision: BmcaDecision, now: Instant) {
        self.port.set_recommended_role(Some(decision.role));
        self.announce_tx
            .update_master_info(MasterInfo::from_dataset(&decision.best, decision.local_is_best));

        let state = self.port.state();
        match decision.role {
            PortRole::Master => {
                self.selected_master = None;
                match state {
                    PortState::Slave | PortState::Uncalibrated => {
                        self.port.process_event(PortEvent::WorseMasterDetected, now);
                        self.port.process_event(PortEvent::RecommendedMaster, now);
                    }
                    PortState::Passive => {
                        self.port.process_event(PortEvent::RecommendedMaster, now);
                    }
                    // Without any foreign master the announce receipt timeout decides
                    PortState::Listening if self.announce_rx.active_foreign_masters() > 0 => {
                        self.port.process_event(PortEvent::RecommendedMaster, now);
                    }
                    _ => {}
                }
            }
            PortRole::Slave => {
                let parent = decision.best.sender;
                let tracking = matches!(state, PortState::Slave | PortState::Uncalibrated);
                if !tracking || self.selected_master != Some(parent) {
                    info!(
                        port = self.config.port_number,
                        master = %parent,
                        grandmaster = %decision.best.grandmaster_identity,
                        "Selected new master"
                    );
                    self.selected_master = Some(parent);
                    self.sync_rx.reset();
                    self.sync_rx
                        .set_mean_path_delay(self.pdelay.measurement().mean_link_delay);
                    self.port.process_event(PortEvent::BetterMasterDetected, now);
                }
            }
            PortRole::Passive => {
                self.selected_master = None;
                self.port.process_event(PortEvent::RecommendedPassive, now);
            }
            PortRole::Disabled => {}
        }
    }

    /// Enables exactly the machines the current port state calls for
    fn apply_port_state(&mut self, now: Instant) {
        let state = self.port.state();
        let as_capable = self.pdelay.as_capable();

        if state == PortState::Master {
            self.announce_tx.enable(now);
        } else {
            self.announce_tx.disable();
        }

        if state == PortState::Master && as_capable {
            self.sync_tx.enable(now);
        } else {
            self.sync_tx.disable();
        }

        match (state, self.selected_master) {
            (PortState::Uncalibrated | PortState::Slave, Some(master)) if as_capable => {
                self.sync_rx.enable(master, now)
            }
            _ => self.sync_rx.disable(),
        }
    }

    fn check_hardware(&mut self, now: Instant) {
        let worst = [
            self.sync_tx.health(),
            self.sync_rx.health(),
            self.pdelay.health(),
            self.responder.health(),
        ]
        .iter()
        .map(|h| h.consecutive_failures())
        .max()
        .unwrap_or(0);

        if worst >= self.config.faults.max_hardware_failures {
            self.edge.hardware_timestamp_fault = true;
            let reason = format!("{} consecutive hardware failures", worst);
            self.enter_recovery(now, &reason, true);
        }
    }

    fn sync_state(&mut self, now: Instant) {
        let next = if self.recovery.is_some() {
            ManagerState::RecoveryMode
        } else if self.asymmetry_pending {
            ManagerState::AsymmetryMeasurement
        } else {
            ManagerState::from_port_state(self.port.state())
        };
        self.set_state(next, now);
    }

    fn set_state(&mut self, next: ManagerState, now: Instant) {
        if next == self.state {
            return;
        }
        let previous = self.state;
        self.state = next;
        self.state_entered = Some(now);
        self.stats.state_transitions += 1;
        info!(port = self.config.port_number, from = %previous, to = %next, "Coordinator state changed");
        if let Some(callback) = self.state_callback.as_mut() {
            callback(previous, next);
        }
    }

    // Faults and recovery

    fn report_fault(&mut self, description: &str, critical: bool) {
        self.stats.fault_events += 1;
        if self.active_faults.len() == MAX_ACTIVE_FAULTS {
            self.active_faults.remove(0);
        }
        self.active_faults.push(description.to_string());
        if critical {
            error!(port = self.config.port_number, fault = description, "Critical fault");
        } else {
            warn!(port = self.config.port_number, fault = description, "Fault");
        }
        if let Some(callback) = self.fault_callback.as_mut() {
            callback(description, critical);
        }
    }

    fn enter_recovery(&mut self, now: Instant, reason: &str, critical: bool) {
        if self.recovery.is_some() {
            return;
        }
        self.report_fault(reason, critical);
        self.port.process_event(PortEvent::FaultDetected, now);

        self.stop_machines();
        self.announce_rx.reset();
        self.bmca.reset();
        self.sync_rx.reset();
        self.pdelay.reset();
        self.responder.reset();
        self.selected_master = None;

        self.recovery = Some(Recovery { started: now });
        self.edge.recovery_in_progress = true;
        warn!(
            port = self.config.port_number,
            automatic = self.config.faults.automatic_recovery,
            "Entering recovery mode"
        );
        self.sync_state(now);
    }

    fn tick_recovery(&mut self, now: Instant) {
        let started = match self.recovery {
            Some(recovery) => recovery.started,
            None => return,
        };
        if self.config.faults.automatic_recovery
            && now.duration_since(started) >= self.config.faults.fault_recovery_timeout
        {
            self.attempt_recovery(now, "automatic");
        }
    }

    fn attempt_recovery(&mut self, now: Instant, trigger: &str) -> bool {
        if self.recovery.is_none() {
            return false;
        }
        self.edge.recovery_attempts = self.edge.recovery_attempts.saturating_add(1);

        if !self_test(self.hardware.as_ref()) {
            self.stats.recovery_failures += 1;
            // Wait another full recovery timeout before retrying
            self.recovery = Some(Recovery { started: now });
            warn!(port = self.config.port_number, trigger, "Recovery failed: self test");
            if let Some(callback) = self.recovery_callback.as_mut() {
                callback(false, "hardware self test failed");
            }
            return false;
        }

        self.port.process_event(PortEvent::FaultCleared, now);
        self.port.process_event(PortEvent::Initialize, now);

        self.sync_tx.reset_health();
        self.consecutive_timeouts = 0;
        self.active_faults.clear();
        self.edge.hardware_timestamp_fault = false;
        self.edge.recovery_in_progress = false;
        self.recovery = None;
        self.stats.recovery_events += 1;

        self.start_machines(now);
        if !self.operational() {
            self.port.process_event(PortEvent::DesignatedDisabled, now);
        }
        self.sync_state(now);

        let details = format!("{} recovery complete, port {}", trigger, self.port.state());
        info!(port = self.config.port_number, trigger, "Recovered from fault");
        if let Some(callback) = self.recovery_callback.as_mut() {
            callback(true, &details);
        }
        true
    }

    /// Recovers now instead of waiting for the automatic retry
    pub fn trigger_manual_recovery(&mut self) -> bool {
        self.trigger_manual_recovery_at(Instant::now())
    }

    pub fn trigger_manual_recovery_at(&mut self, now: Instant) -> bool {
        self.attempt_recovery(now, "manual")
    }

    pub fn process_event(&mut self, event: ManagerEvent) {
        self.process_event_at(event, Instant::now())
    }

    pub fn process_event_at(&mut self, event: ManagerEvent, now: Instant) {
        debug!(port = self.config.port_number, ?event, "Coordinator event");
        match event {
            ManagerEvent::LinkUp => self.handle_link_state_at(true, now),
            ManagerEvent::LinkDown => self.handle_link_state_at(false, now),
            ManagerEvent::HardwareFaultDetected => {
                if self.state != ManagerState::Uninitialized {
                    self.edge.hardware_timestamp_fault = true;
                    self.enter_recovery(now, "hardware fault reported", true);
                }
            }
            ManagerEvent::TimestampFault => {
                self.stats.timestamp_faults += 1;
                self.edge.hardware_timestamp_fault = true;
                self.report_fault("timestamp fault reported", false);
            }
            ManagerEvent::FaultCleared | ManagerEvent::AutomaticRecoveryTriggered => {
                self.attempt_recovery(now, "automatic");
            }
            ManagerEvent::ManualRecoveryTriggered => {
                self.attempt_recovery(now, "manual");
            }
            ManagerEvent::ForcedReselection => self.force_bmca_reselection(),
            ManagerEvent::PortEnabled => self.set_port_enabled_at(true, now),
            ManagerEvent::PortDisabled => self.set_port_enabled_at(false, now),
        }
    }

    // Administrative control and edge cases

    /// Runs BMCA on the next tick regardless of the reselect timer
    pub fn force_bmca_reselection(&mut self) {
        self.force_reselect = true;
    }

    pub fn set_port_enabled(&mut self, enabled: bool) {
        self.set_port_enabled_at(enabled, Instant::now())
    }

    pub fn set_port_enabled_at(&mut self, enabled: bool, now: Instant) {
        if self.port_enabled == enabled {
            return;
        }
        self.port_enabled = enabled;
        self.apply_operational(now);
    }

    pub fn handle_link_state(&mut self, up: bool) {
        self.handle_link_state_at(up, Instant::now())
    }

    /// Link down disables the port; link up restarts it and requalifies
    /// the link delay
    pub fn handle_link_state_at(&mut self, up: bool, now: Instant) {
        if self.link_up == up {
            return;
        }
        self.link_up = up;
        info!(port = self.config.port_number, up, "Link state changed");
        if up {
            self.pdelay.reset();
        }
        self.apply_operational(now);
    }

    fn apply_operational(&mut self, now: Instant) {
        if !self.running() {
            return;
        }
        if self.operational() {
            self.port.process_event(PortEvent::DesignatedEnabled, now);
            self.port.process_event(PortEvent::Initialize, now);
            self.start_machines(now);
        } else {
            self.stop_machines();
            self.selected_master = None;
            self.port.process_event(PortEvent::DesignatedDisabled, now);
        }
        self.sync_state(now);
    }

    /// Applies an externally detected clock jump as a phase step
    pub fn handle_clock_jump(&mut self, jump: TimeInterval) {
        self.handle_clock_jump_at(jump, Instant::now())
    }

    pub fn handle_clock_jump_at(&mut self, jump: TimeInterval, now: Instant) {
        self.stats.clock_jumps_reported += 1;
        self.edge.clock_jump_detected = true;
        warn!(port = self.config.port_number, jump = %jump, "Clock jump reported");
        if self.sync_rx.is_enabled() {
            let event = self.sync_rx.apply_clock_jump(jump.to_nanoseconds());
            self.after_sync(false, event, now);
        }
    }

    /// Records the congestion level (0.0 to 1.0)
    ///
    /// While at or above [`CONGESTION_THRESHOLD`], receipt timeouts are
    /// counted but do not escalate to recovery.
    pub fn handle_network_congestion(&mut self, level: f64) {
        let congested = level >= CONGESTION_THRESHOLD;
        if congested != self.edge.network_congestion_detected {
            if congested {
                warn!(port = self.config.port_number, level, "Network congestion detected");
            } else {
                info!(port = self.config.port_number, level, "Network congestion cleared");
            }
        }
        self.edge.congestion_level = level;
        self.edge.network_congestion_detected = congested;
    }

    /// Records measured one-way delays and compensates the asymmetry when
    /// asymmetry measurement is enabled
    pub fn handle_asymmetric_path(&mut self, master_to_slave: TimeInterval, slave_to_master: TimeInterval) {
        self.handle_asymmetric_path_at(master_to_slave, slave_to_master, Instant::now())
    }

    pub fn handle_asymmetric_path_at(
        &mut self,
        master_to_slave: TimeInterval,
        slave_to_master: TimeInterval,
        now: Instant,
    ) {
        let asymmetry = TimeInterval((master_to_slave - slave_to_master).0 / 2);
        self.edge.asymmetric_path_detected = asymmetry != TimeInterval::ZERO;
        self.edge.path_asymmetry = asymmetry;

        if !self.config.faults.path_asymmetry_measurement {
            warn!(port = self.config.port_number, %asymmetry, "Path asymmetry reported, compensation disabled");
            return;
        }
        info!(port = self.config.port_number, %asymmetry, "Compensating path asymmetry");
        self.sync_rx.set_asymmetry(asymmetry);
        if self.running() {
            self.asymmetry_pending = true;
            self.sync_state(now);
        }
    }

    /// Records a Milan profile violation; with Milan enabled the PDelay
    /// initiator ceases transmission
    pub fn handle_milan_violation(&mut self, violation: &str) {
        self.handle_milan_violation_at(violation, Instant::now())
    }

    pub fn handle_milan_violation_at(&mut self, violation: &str, now: Instant) {
        self.edge.milan_profile_violation = true;
        self.report_fault(&format!("Milan violation: {}", violation), false);
        if self.config.milan.enabled && !self.pdelay.is_ceased() && self.running() {
            self.pdelay.start_cessation(now);
            self.edge.milan_cessation_active = true;
        }
    }

    // Callbacks

    pub fn set_state_change_callback(&mut self, callback: ManagerStateCallback) {
        self.state_callback = Some(callback);
    }

    pub fn set_port_state_callback(&mut self, callback: PortStateCallback) {
        self.port.set_state_change_callback(callback);
    }

    pub fn set_fault_callback(&mut self, callback: FaultCallback) {
        self.fault_callback = Some(callback);
    }

    pub fn set_recovery_callback(&mut self, callback: RecoveryCallback) {
        self.recovery_callback = Some(callback);
    }

    // Observation

    pub fn is_synchronized(&self) -> bool {
        self.state == ManagerState::SlaveSynchronized && self.sync_rx.is_synchronized()
    }

    pub fn is_master(&self) -> bool {
        self.state == ManagerState::MasterActive
    }

    pub fn is_slave(&self) -> bool {
        matches!(
            self.state,
            ManagerState::SlaveSynchronizing | ManagerState::SlaveSynchronized
        )
    }

    pub fn path_delay(&self) -> PathDelayMeasurement {
        self.pdelay.measurement()
    }

    pub fn sync_info(&self) -> SyncInfo {
        self.sync_rx.info()
    }

    pub fn get_system_status(&self) -> SystemStatus {
        self.system_status_at(Instant::now())
    }

    pub fn system_status_at(&self, now: Instant) -> SystemStatus {
        let sync = self.sync_rx.info();
        let path = self.pdelay.measurement();
        let milan = self.pdelay.milan_status(now);
        let decision = self.bmca.last_decision();

        SystemStatus {
            manager_state: self.state,
            port_state: self.port.state(),
            port_role: self.port.recommended_role(),
            is_synchronized: self.is_synchronized(),
            offset_from_master_ns: sync.offset_from_master_ns,
            frequency_adjustment_ppb: sync.frequency_adjustment_ppb,
            path_delay: path.mean_link_delay,
            neighbor_rate_ratio: path.neighbor_rate_ratio,
            as_capable: path.calibrated,
            grandmaster_identity: decision.map(|d| d.best.grandmaster_identity),
            master_port_identity: self.selected_master,
            steps_removed: decision.map_or(0, |d| d.best.steps_removed),
            active_foreign_masters: self.announce_rx.active_foreign_masters(),
            milan_enabled: milan.enabled,
            multiple_pdelay_resp_detected: milan.multiple_pdelay_resp_detected,
            pdelay_cessation_active: milan.cessation_active,
            consecutive_timeouts: self.consecutive_timeouts,
            in_recovery_mode: self.recovery.is_some(),
            active_faults: self.active_faults.clone(),
            uptime: self
                .started_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default(),
            time_in_state: self
                .state_entered
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(Duration::ZERO),
        }
    }

    pub fn get_edge_case_status(&self) -> EdgeCaseStatus {
        EdgeCaseStatus {
            multiple_response_count: self.pdelay.statistics().multiple_resp_events,
            milan_cessation_active: self.pdelay.is_ceased(),
            ..self.edge
        }
    }

    pub fn get_statistics(&self) -> Statistics {
        let hardware_failures = [
            self.sync_tx.health(),
            self.sync_rx.health(),
            self.pdelay.health(),
            self.responder.health(),
        ]
        .iter()
        .map(|h| h.total_failures())
        .sum();

        Statistics {
            manager: self.stats,
            port: self.port.statistics(),
            bmca: self.bmca.statistics(),
            announce_tx: self.announce_tx.statistics(),
            announce_rx: self.announce_rx.statistics(),
            sync_tx: self.sync_tx.statistics(),
            sync_rx: self.sync_rx.statistics(),
            servo: self.sync_rx.servo_statistics(),
            pdelay_initiator: self.pdelay.statistics(),
            link_delay: self.pdelay.link_statistics(),
            pdelay_responder: self.responder.statistics(),
            hardware_failures,
        }
    }

    pub fn clear_statistics(&mut self) {
        self.stats = ManagerStatistics::default();
        self.port.clear_statistics();
        self.bmca.clear_statistics();
        self.announce_tx.clear_statistics();
        self.announce_rx.clear_statistics();
        self.sync_tx.clear_statistics();
        self.sync_rx.clear_statistics();
        self.pdelay.clear_statistics();
        self.responder.clear_statistics();
    }
}
