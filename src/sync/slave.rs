//! Slave synchronization
//!
//! A Sync is remembered with its receive timestamp until the Follow-Up with
//! the same sequence id arrives. The offset
//! `(rx − (precise_origin + correction)) − mean_path_delay − asymmetry`
//! is fed to the servo and the resulting correction is applied through the
//! hardware interface.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::servo::{Servo, ServoAction, ServoState, ServoStatistics};
use crate::core::{Config, PortIdentity, TimeInterval, Timestamp};
use crate::protocol::message::{FollowUpMessage, SyncMessage};
use crate::time::{HardwareHealth, HardwareTimestampInterface};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRxStatistics {
    pub syncs_received: u64,
    pub follow_ups_received: u64,
    pub syncs_ignored: u64,
    pub follow_up_mismatches: u64,
    pub follow_up_timeouts: u64,
    pub sync_receipt_timeouts: u64,
    pub offsets_computed: u64,
    pub adjustment_failures: u64,
}

/// Snapshot of the slave synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncInfo {
    pub master: Option<PortIdentity>,
    pub offset_from_master_ns: f64,
    pub frequency_adjustment_ppb: f64,
    pub mean_path_delay: TimeInterval,
    pub synchronized: bool,
    pub min_offset_ns: Option<f64>,
    pub max_offset_ns: Option<f64>,
}

/// What a Follow-Up (or one-step Sync) produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveEvent {
    /// Servo reached lock
    Locked,
    /// Servo lost lock
    LockLost,
    /// A clock jump was corrected with a phase step
    ClockJump,
}

#[derive(Debug, Clone, Copy)]
struct PendingSync {
    sequence_id: u16,
    receive_timestamp: Timestamp,
    /// Correction accumulated on the Sync itself
    correction: TimeInterval,
    received_at: Instant,
}

pub struct SyncReceiver {
    port_number: u16,
    domain_number: u8,
    receipt_window: Duration,
    follow_up_timeout: Duration,
    hardware: Arc<dyn HardwareTimestampInterface>,
    servo: Servo,
    master: Option<PortIdentity>,
    enabled: bool,
    pending: Option<PendingSync>,
    receipt_deadline: Option<Instant>,
    mean_path_delay: TimeInterval,
    asymmetry: TimeInterval,
    last_offset_ns: f64,
    min_offset_ns: Option<f64>,
    max_offset_ns: Option<f64>,
    health: HardwareHealth,
    stats: SyncRxStatistics,
}

impl SyncReceiver {
    pub fn new(config: &Config, hardware: Arc<dyn HardwareTimestampInterface>) -> Self {
        SyncReceiver {
            port_number: config.port_number,
            domain_number: config.domain_number,
            receipt_window: config.sync_receipt_window(),
            follow_up_timeout: config.sync_interval,
            hardware,
            servo: Servo::new(&config.servo),
            master: None,
            enabled: false,
            pending: None,
            receipt_deadline: None,
            mean_path_delay: TimeInterval::ZERO,
            asymmetry: TimeInterval::ZERO,
            last_offset_ns: 0.0,
            min_offset_ns: None,
            max_offset_ns: None,
            health: HardwareHealth::default(),
            stats: SyncRxStatistics::default(),
        }
    }

    /// Starts tracking `master`; the servo restarts when the master changes
    pub fn enable(&mut self, master: PortIdentity, now: Instant) {
        if self.master != Some(master) {
            if self.master.is_some() {
                info!(port = self.port_number, %master, "Sync master changed, restarting servo");
            }
            self.servo.reset();
            self.pending = None;
            self.master = Some(master);
        }
        if !self.enabled {
            self.enabled = true;
            self.receipt_deadline = Some(now + self.receipt_window);
        }
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.pending = None;
        self.receipt_deadline = None;
    }

    /// Forgets the master and resets the servo
    pub fn reset(&mut self) {
        self.disable();
        self.master = None;
        self.servo.reset();
        self.last_offset_ns = 0.0;
        self.health.reset();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_mean_path_delay(&mut self, delay: TimeInterval) {
        self.mean_path_delay = delay;
    }

    /// Path asymmetry added to the master-to-slave delay
    pub fn set_asymmetry(&mut self, asymmetry: TimeInterval) {
        self.asymmetry = asymmetry;
    }

    pub fn asymmetry(&self) -> TimeInterval {
        self.asymmetry
    }

    fn accepts(&self, source: &PortIdentity, domain: u8) -> bool {
        self.enabled && domain == self.domain_number && self.master == Some(*source)
    }

    pub fn process_sync(
        &mut self,
        msg: &SyncMessage,
        receive_timestamp: Timestamp,
        now: Instant,
    ) -> Option<SlaveEvent> {
        if !self.accepts(&msg.header.source_port_identity, msg.header.domain_number) {
            self.stats.syncs_ignored += 1;
            debug!(
                port = self.port_number,
                source = %msg.header.source_port_identity,
                "Sync ignored"
            );
            return None;
        }
        self.stats.syncs_received += 1;
        self.receipt_deadline = Some(now + self.receipt_window);

        if !msg.header.two_step {
            self.pending = None;
            return self.compute_offset(
                receive_timestamp,
                msg.origin_timestamp,
                msg.header.correction_field,
            );
        }

        if let Some(stale) = self.pending.replace(PendingSync {
            sequence_id: msg.header.sequence_id,
            receive_timestamp,
            correction: msg.header.correction_field,
            received_at: now,
        }) {
            self.stats.follow_up_timeouts += 1;
            debug!(port = self.port_number, seq = stale.sequence_id, "Sync superseded before its Follow-Up");
        }
        None
    }

    pub fn process_follow_up(&mut self, msg: &FollowUpMessage, _now: Instant) -> Option<SlaveEvent> {
        if !self.accepts(&msg.header.source_port_identity, msg.header.domain_number) {
            self.stats.syncs_ignored += 1;
            return None;
        }
        self.stats.follow_ups_received += 1;

        let pending = match self.pending {
            Some(pending) if pending.sequence_id == msg.header.sequence_id => pending,
            _ => {
                self.stats.follow_up_mismatches += 1;
                debug!(
                    port = self.port_number,
                    seq = msg.header.sequence_id,
                    pending = ?self.pending.map(|p| p.sequence_id),
                    "Follow-Up does not match pending Sync"
                );
                return None;
            }
        };
        self.pending = None;

        self.compute_offset(
            pending.receive_timestamp,
            msg.precise_origin_timestamp,
            pending.correction + msg.header.correction_field,
        )
    }

    fn compute_offset(
        &mut self,
        receive_timestamp: Timestamp,
        origin_timestamp: Timestamp,
        correction: TimeInterval,
    ) -> Option<SlaveEvent> {
        let elapsed_ns = receive_timestamp.nanos_since(&origin_timestamp) as f64;
        let raw_offset_ns = elapsed_ns
            - correction.to_nanoseconds_f64()
            - self.mean_path_delay.to_nanoseconds_f64()
            - self.asymmetry.to_nanoseconds_f64();

        self.stats.offsets_computed += 1;
        self.last_offset_ns = raw_offset_ns;
        self.min_offset_ns = Some(self.min_offset_ns.map_or(raw_offset_ns, |m| m.min(raw_offset_ns)));
        self.max_offset_ns = Some(self.max_offset_ns.map_or(raw_offset_ns, |m| m.max(raw_offset_ns)));

        let output = self.servo.sample(raw_offset_ns);
        let applied = match output.action {
            ServoAction::PhaseStep { offset_ns } => self.hardware.adjust_clock_phase(offset_ns),
            ServoAction::Frequency { ppb } => self.hardware.adjust_clock_frequency(ppb),
        };
        self.health.record_ok(applied);
        if !applied {
            self.stats.adjustment_failures += 1;
            warn!(port = self.port_number, action = ?output.action, "Clock adjustment rejected by hardware");
        }

        match (output.action, output.state_change) {
            (ServoAction::PhaseStep { .. }, _) => Some(SlaveEvent::ClockJump),
            (_, Some(ServoState::Locked)) => Some(SlaveEvent::Locked),
            (_, Some(ServoState::Unlocked)) => Some(SlaveEvent::LockLost),
            _ => None,
        }
    }

    /// Applies an externally detected clock jump as a phase step
    pub fn apply_clock_jump(&mut self, offset_ns: i64) -> Option<SlaveEvent> {
        let output = self.servo.step(offset_ns as f64);
        if let ServoAction::PhaseStep { offset_ns } = output.action {
            let applied = self.hardware.adjust_clock_phase(offset_ns);
            self.health.record_ok(applied);
            if !applied {
                self.stats.adjustment_failures += 1;
            }
        }
        self.pending = None;
        Some(SlaveEvent::ClockJump)
    }

    /// Detects sync receipt timeout and stale pending Syncs
    ///
    /// Returns true when the sync receipt timeout fired.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.enabled {
            return false;
        }

        if let Some(pending) = self.pending {
            if now.duration_since(pending.received_at) >= self.follow_up_timeout {
                self.pending = None;
                self.stats.follow_up_timeouts += 1;
                debug!(port = self.port_number, seq = pending.sequence_id, "Follow-Up never arrived");
            }
        }

        match self.receipt_deadline {
            Some(deadline) if now >= deadline => {
                self.stats.sync_receipt_timeouts += 1;
                self.receipt_deadline = Some(now + self.receipt_window);
                warn!(port = self.port_number, master = ?self.master, "Sync receipt timeout");
                true
            }
            _ => false,
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.enabled && self.servo.is_locked()
    }

    pub fn info(&self) -> SyncInfo {
        SyncInfo {
            master: self.master,
            offset_from_master_ns: self.servo.filtered_offset_ns(),
            frequency_adjustment_ppb: self.servo.frequency_adjustment_ppb(),
            mean_path_delay: self.mean_path_delay,
            synchronized: self.is_synchronized(),
            min_offset_ns: self.min_offset_ns,
            max_offset_ns: self.max_offset_ns,
        }
    }

    pub fn last_offset_ns(&self) -> f64 {
        self.last_offset_ns
    }

    pub fn health(&self) -> HardwareHealth {
        self.health
    }

    pub fn statistics(&self) -> SyncRxStatistics {
        self.stats
    }

    pub fn servo_statistics(&self) -> ServoStatistics {
        self.servo.statistics()
    }

    pub fn clear_statistics(&mut self) {
        self.stats = SyncRxStatistics::default();
        self.servo.clear_statistics();
        self.min_offset_ns = None;
        self.max_offset_ns = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ClockIdentity;
    use crate::protocol::message::{Header, FOLLOW_UP_LENGTH, SYNC_LENGTH};
    use crate::time::mock::MockHardware;

    fn master() -> PortIdentity {
        PortIdentity::new(ClockIdentity([0x20; 8]), 1)
    }

    fn setup() -> (SyncReceiver, Arc<MockHardware>) {
        let hardware = Arc::new(MockHardware::new());
        let config = Config {
            clock_identity: ClockIdentity([0x10; 8]),
            ..Config::default()
        };
        (SyncReceiver::new(&config, hardware.clone()), hardware)
    }

    fn sync(seq: u16) -> SyncMessage {
        let mut header = Header::new(master(), seq, SYNC_LENGTH);
        header.two_step = true;
        SyncMessage {
            header,
            origin_timestamp: Timestamp::default(),
        }
    }

    fn follow_up(seq: u16, origin: Timestamp) -> FollowUpMessage {
        FollowUpMessage {
            header: Header::new(master(), seq, FOLLOW_UP_LENGTH),
            precise_origin_timestamp: origin,
        }
    }

    fn ts(nanos: i128) -> Timestamp {
        Timestamp::from_nanos(nanos).unwrap()
    }

    #[test]
    fn test_offset_formula() {
        let (mut rx, hw) = setup();
        let t0 = Instant::now();
        rx.enable(master(), t0);
        rx.set_mean_path_delay(TimeInterval::from_nanoseconds(500));

        let origin = 10_000_000_000i128;
        rx.process_sync(&sync(1), ts(origin + 520), t0);
        rx.process_follow_up(&follow_up(1, ts(origin)), t0);

        assert_eq!(rx.last_offset_ns(), 20.0);
        assert_eq!(rx.statistics().offsets_computed, 1);
        assert_eq!(hw.frequency_adjustments().len(), 1);
        assert!(hw.frequency_adjustments()[0] < 0.0);
    }

    #[test]
    fn test_mismatched_follow_up_discarded() {
        let (mut rx, hw) = setup();
        let t0 = Instant::now();
        rx.enable(master(), t0);
        rx.process_sync(&sync(5), ts(1_000), t0);
        assert!(rx.process_follow_up(&follow_up(6, ts(900)), t0).is_none());
        assert_eq!(rx.statistics().follow_up_mismatches, 1);
        assert_eq!(rx.statistics().offsets_computed, 0);
        assert!(hw.frequency_adjustments().is_empty());

        // The pending Sync still matches its own Follow-Up
        rx.process_follow_up(&follow_up(5, ts(900)), t0);
        assert_eq!(rx.statistics().offsets_computed, 1);
    }

    #[test]
    fn test_sync_from_other_port_ignored() {
        let (mut rx, _hw) = setup();
        let t0 = Instant::now();
        rx.enable(master(), t0);
        let mut other = sync(1);
        other.header.source_port_identity = PortIdentity::new(ClockIdentity([0x30; 8]), 1);
        rx.process_sync(&other, ts(1_000), t0);
        assert_eq!(rx.statistics().syncs_ignored, 1);
        assert_eq!(rx.statistics().syncs_received, 0);
    }

    #[test]
    fn test_stable_offset_synchronizes() {
        let (mut rx, _hw) = setup();
        let t0 = Instant::now();
        rx.enable(master(), t0);

        let mut events = Vec::new();
        for seq in 1..=10u16 {
            let origin = 1_000_000_000_000i128 + seq as i128 * 125_000_000;
            let now = t0 + Duration::from_millis(125) * seq as u32;
            rx.process_sync(&sync(seq), ts(origin + 20), now);
            if let Some(event) = rx.process_follow_up(&follow_up(seq, ts(origin)), now) {
                events.push(event);
            }
        }
        assert_eq!(events, vec![SlaveEvent::Locked]);
        assert!(rx.is_synchronized());
        assert_eq!(rx.info().offset_from_master_ns, 20.0);
    }

    #[test]
    fn test_clock_jump_single_phase_step() {
        let (mut rx, hw) = setup();
        let t0 = Instant::now();
        rx.enable(master(), t0);

        let origin = 2_000_000_000_000i128;
        rx.process_sync(&sync(1), ts(origin + 5_000_000), t0);
        let event = rx.process_follow_up(&follow_up(1, ts(origin)), t0);

        assert_eq!(event, Some(SlaveEvent::ClockJump));
        assert_eq!(hw.phase_adjustments(), vec![-5_000_000]);
        assert!(hw.frequency_adjustments().is_empty());
        assert_eq!(rx.servo_statistics().clock_jumps, 1);
    }

    #[test]
    fn test_sync_receipt_timeout() {
        let (mut rx, _hw) = setup();
        let t0 = Instant::now();
        rx.enable(master(), t0);
        let window = Duration::from_millis(375);
        assert!(!rx.tick(t0 + window - Duration::from_millis(10)));
        assert!(rx.tick(t0 + window));
        assert_eq!(rx.statistics().sync_receipt_timeouts, 1);
    }

    #[test]
    fn test_stale_pending_sync_dropped() {
        let (mut rx, _hw) = setup();
        let t0 = Instant::now();
        rx.enable(master(), t0);
        rx.process_sync(&sync(1), ts(1_000), t0);
        rx.tick(t0 + Duration::from_millis(125));
        assert!(rx.process_follow_up(&follow_up(1, ts(900)), t0).is_none());
        assert_eq!(rx.statistics().follow_up_timeouts, 1);
    }
}
