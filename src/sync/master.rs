//! Sync transmission on master ports
//!
//! Two-step cycle: send Sync with an approximate origin, poll the hardware
//! for the transmit timestamp, then send a Follow-Up with the same sequence
//! id. The wait is bounded by the tx timestamp timeout; a cycle that
//! exceeds it is dropped and counted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::core::{Config, PortIdentity, TimeInterval, Timestamp};
use crate::protocol::message::{
    FollowUpMessage, Header, SyncMessage, FOLLOW_UP_LENGTH, SYNC_LENGTH,
};
use crate::protocol::transport::MessageTransmitter;
use crate::time::{HardwareError, HardwareHealth, HardwareTimestampInterface};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTxStatistics {
    pub syncs_sent: u64,
    pub follow_ups_sent: u64,
    pub missed_follow_ups: u64,
    pub tx_timestamp_timeouts: u64,
    pub transmit_failures: u64,
    pub hardware_errors: u64,
}

/// Snapshot of the transmitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmissionInfo {
    pub enabled: bool,
    pub two_step: bool,
    pub last_sequence_id: u16,
    pub awaiting_tx_timestamp: bool,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy)]
struct PendingFollowUp {
    sequence_id: u16,
    deadline: Instant,
}

pub struct SyncTransmitter {
    port_identity: PortIdentity,
    domain_number: u8,
    interval: Duration,
    two_step: bool,
    tx_timestamp_timeout: Duration,
    hardware: Arc<dyn HardwareTimestampInterface>,
    transmitter: Arc<dyn MessageTransmitter>,
    enabled: bool,
    next_due: Option<Instant>,
    sequence_id: u16,
    pending: Option<PendingFollowUp>,
    health: HardwareHealth,
    stats: SyncTxStatistics,
}

impl SyncTransmitter {
    pub fn new(
        config: &Config,
        hardware: Arc<dyn HardwareTimestampInterface>,
        transmitter: Arc<dyn MessageTransmitter>,
    ) -> Self {
        // One-step only when requested and the hardware can insert the origin
        let two_step = config.two_step || !hardware.supports_one_step();
        SyncTransmitter {
            port_identity: config.port_identity(),
            domain_number: config.domain_number,
            interval: config.sync_interval,
            two_step,
            tx_timestamp_timeout: config.tx_timestamp_timeout,
            hardware,
            transmitter,
            enabled: false,
            next_due: None,
            sequence_id: 0,
            pending: None,
            health: HardwareHealth::default(),
            stats: SyncTxStatistics::default(),
        }
    }

    pub fn enable(&mut self, now: Instant) {
        if !self.enabled {
            debug!(port = %self.port_identity, two_step = self.two_step, "Sync transmission enabled");
            self.enabled = true;
            self.next_due = Some(now);
        }
    }

    /// Stops transmission; an outstanding Follow-Up is abandoned
    pub fn disable(&mut self) {
        if self.enabled {
            debug!(port = %self.port_identity, "Sync transmission disabled");
        }
        self.enabled = false;
        self.next_due = None;
        self.pending = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn tick(&mut self, now: Instant) {
        if self.pending.is_some() {
            self.poll_tx_timestamp(now);
        }

        let due = matches!(self.next_due, Some(due) if self.enabled && now >= due);
        if !due {
            return;
        }
        if let Some(pending) = self.pending.take() {
            // Never let a late timestamp hold back the next Sync
            self.drop_cycle(pending.sequence_id, "next Sync due");
        }
        self.send_sync(now);
        self.next_due = Some(now + self.interval);
    }

    fn send_sync(&mut self, now: Instant) {
        self.sequence_id = self.sequence_id.wrapping_add(1);
        let sequence_id = self.sequence_id;

        let clock = self.hardware.get_clock_time();
        self.health.record(&clock);
        let origin_timestamp = match clock {
            Ok(ts) => ts,
            Err(e) => {
                // No origin, no Sync
                self.stats.hardware_errors += 1;
                warn!(port = %self.port_identity, seq = sequence_id, error = %e, "Cannot read clock, Sync skipped");
                return;
            }
        };

        let mut header = Header::new(self.port_identity, sequence_id, SYNC_LENGTH);
        header.domain_number = self.domain_number;
        header.two_step = self.two_step;
        header.log_message_interval = crate::util::duration_to_log_interval(self.interval);

        let msg = SyncMessage {
            header,
            origin_timestamp,
        };
        if !self.transmitter.send_sync(&msg) {
            self.stats.transmit_failures += 1;
            warn!(port = %self.port_identity, seq = sequence_id, "Sync transmit failed");
            return;
        }
        self.stats.syncs_sent += 1;
        trace!(port = %self.port_identity, seq = sequence_id, "Sync sent");

        if self.two_step {
            self.pending = Some(PendingFollowUp {
                sequence_id,
                deadline: now + self.tx_timestamp_timeout,
            });
            self.poll_tx_timestamp(now);
        }
    }

    fn poll_tx_timestamp(&mut self, now: Instant) {
        let pending = match self.pending {
            Some(pending) => pending,
            None => return,
        };

        match self.hardware.capture_tx_timestamp(pending.sequence_id) {
            Ok(precise) => {
                self.health.record_ok(true);
                self.pending = None;
                self.send_follow_up(pending.sequence_id, precise);
            }
            Err(HardwareError::Timeout) if now < pending.deadline => {
                trace!(port = %self.port_identity, seq = pending.sequence_id, "Tx timestamp not ready");
            }
            Err(HardwareError::Timeout) => {
                self.pending = None;
                self.stats.tx_timestamp_timeouts += 1;
                self.health.record_ok(false);
                self.drop_cycle(pending.sequence_id, "tx timestamp timeout");
            }
            Err(e) => {
                self.pending = None;
                self.stats.hardware_errors += 1;
                self.health.record_ok(false);
                warn!(port = %self.port_identity, error = %e, "Tx timestamp capture failed");
                self.drop_cycle(pending.sequence_id, "tx timestamp capture failed");
            }
        }
    }

    fn drop_cycle(&mut self, sequence_id: u16, reason: &str) {
        self.stats.missed_follow_ups += 1;
        warn!(port = %self.port_identity, seq = sequence_id, reason, "Follow-Up dropped");
    }

    fn send_follow_up(&mut self, sequence_id: u16, precise_origin_timestamp: Timestamp) {
        let mut header = Header::new(self.port_identity, sequence_id, FOLLOW_UP_LENGTH);
        header.domain_number = self.domain_number;
        header.correction_field = TimeInterval::ZERO;
        header.log_message_interval = crate::util::duration_to_log_interval(self.interval);

        let msg = FollowUpMessage {
            header,
            precise_origin_timestamp,
        };
        if self.transmitter.send_follow_up(&msg) {
            self.stats.follow_ups_sent += 1;
        } else {
            self.stats.transmit_failures += 1;
            warn!(port = %self.port_identity, seq = sequence_id, "Follow-Up transmit failed");
        }
    }

    pub fn info(&self) -> TransmissionInfo {
        TransmissionInfo {
            enabled: self.enabled,
            two_step: self.two_step,
            last_sequence_id: self.sequence_id,
            awaiting_tx_timestamp: self.pending.is_some(),
            interval: self.interval,
        }
    }

    pub fn health(&self) -> HardwareHealth {
        self.health
    }

    /// Clears the consecutive hardware failure count
    pub fn reset_health(&mut self) {
        self.health.reset();
    }

    pub fn statistics(&self) -> SyncTxStatistics {
        self.stats
    }

    pub fn clear_statistics(&mut self) {
        self.stats = SyncTxStatistics::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ClockIdentity;
    use crate::protocol::transport::recording::RecordingTransmitter;
    use crate::protocol::transport::Outbound;
    use crate::time::mock::{MockHardware, TxMode};

    fn setup() -> (SyncTransmitter, Arc<MockHardware>, Arc<RecordingTransmitter>) {
        let hardware = Arc::new(MockHardware::new());
        let sink = Arc::new(RecordingTransmitter::new());
        let config = Config {
            clock_identity: ClockIdentity([0x10; 8]),
            ..Config::default()
        };
        let tx = SyncTransmitter::new(&config, hardware.clone(), sink.clone());
        (tx, hardware, sink)
    }

    #[test]
    fn test_two_step_cycle() {
        let (mut tx, hw, sink) = setup();
        let t0 = Instant::now();
        hw.set_tx_mode(TxMode::Explicit);
        tx.enable(t0);
        tx.tick(t0);

        // Sync sent, Follow-Up withheld until the timestamp exists
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        let seq = sent[0].sequence_id();
        assert!(matches!(&sent[0], Outbound::Sync(m) if m.header.two_step));
        assert!(tx.info().awaiting_tx_timestamp);

        let precise = Timestamp::new(1_000, 42).unwrap();
        hw.set_tx_timestamp(seq, precise);
        tx.tick(t0 + Duration::from_millis(2));

        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Outbound::FollowUp(msg) => {
                assert_eq!(msg.header.sequence_id, seq);
                assert_eq!(msg.precise_origin_timestamp, precise);
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(tx.statistics().follow_ups_sent, 1);
    }

    #[test]
    fn test_tx_timestamp_timeout_drops_cycle() {
        let (mut tx, hw, sink) = setup();
        let t0 = Instant::now();
        hw.set_tx_mode(TxMode::Unavailable);
        tx.enable(t0);
        tx.tick(t0);
        tx.tick(t0 + Duration::from_millis(5));
        assert!(tx.info().awaiting_tx_timestamp);

        tx.tick(t0 + Duration::from_millis(10));
        assert!(!tx.info().awaiting_tx_timestamp);
        let stats = tx.statistics();
        assert_eq!(stats.missed_follow_ups, 1);
        assert_eq!(stats.tx_timestamp_timeouts, 1);
        assert_eq!(tx.health().consecutive_failures(), 1);

        // The next Sync still goes out on schedule
        tx.tick(t0 + Duration::from_millis(125));
        assert_eq!(sink.count(|m| matches!(m, Outbound::Sync(_))), 2);
        assert_eq!(sink.count(|m| matches!(m, Outbound::FollowUp(_))), 0);
    }

    #[test]
    fn test_immediate_timestamp_and_sequence() {
        let (mut tx, _hw, sink) = setup();
        let t0 = Instant::now();
        tx.enable(t0);
        for i in 0..4u32 {
            tx.tick(t0 + Duration::from_millis(125) * i);
        }
        let sent = sink.sent();
        assert_eq!(sent.len(), 8);
        for pair in sent.chunks(2) {
            assert!(matches!(pair[0], Outbound::Sync(_)));
            assert!(matches!(pair[1], Outbound::FollowUp(_)));
            assert_eq!(pair[0].sequence_id(), pair[1].sequence_id());
        }
        assert_eq!(tx.statistics().syncs_sent, 4);
    }

    #[test]
    fn test_one_step_sends_no_follow_up() {
        let hardware = Arc::new(MockHardware::new());
        hardware.set_capabilities(true, true);
        let sink = Arc::new(RecordingTransmitter::new());
        let config = Config {
            clock_identity: ClockIdentity([0x10; 8]),
            two_step: false,
            ..Config::default()
        };
        let mut tx = SyncTransmitter::new(&config, hardware, sink.clone());
        let t0 = Instant::now();
        tx.enable(t0);
        tx.tick(t0);
        assert_eq!(sink.sent().len(), 1);
        assert!(matches!(&sink.sent()[0], Outbound::Sync(m) if !m.header.two_step));
        assert!(!tx.info().two_step);
    }

    #[test]
    fn test_clock_read_failure_skips_sync() {
        let hardware = Arc::new(MockHardware::new());
        hardware.set_capabilities(true, true);
        let sink = Arc::new(RecordingTransmitter::new());
        let config = Config {
            clock_identity: ClockIdentity([0x10; 8]),
            two_step: false,
            ..Config::default()
        };
        let mut tx = SyncTransmitter::new(&config, hardware.clone(), sink.clone());
        let t0 = Instant::now();
        tx.enable(t0);

        hardware.set_clock_failing(true);
        tx.tick(t0);
        assert!(sink.sent().is_empty());
        let stats = tx.statistics();
        assert_eq!(stats.syncs_sent, 0);
        assert_eq!(stats.hardware_errors, 1);
        assert_eq!(tx.health().consecutive_failures(), 1);

        // Next interval goes out normally once the clock reads again
        hardware.set_clock_failing(false);
        tx.tick(t0 + Duration::from_millis(125));
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Outbound::Sync(msg) => {
                assert_eq!(msg.origin_timestamp, hardware.get_clock_time().unwrap());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_disabled_sends_nothing() {
        let (mut tx, _hw, sink) = setup();
        tx.tick(Instant::now());
        assert!(sink.sent().is_empty());
    }
}
