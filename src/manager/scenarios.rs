//! End-to-end runs of a coordinator against a simulated neighbor

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{Coordinator, ManagerState};
use crate::core::{ClockIdentity, ClockQuality, Config, PortIdentity, PortState, Timestamp};
use crate::protocol::message::{
    time_source, AnnounceMessage, FollowUpMessage, Header, PdelayRespFollowUpMessage,
    PdelayRespMessage, SyncMessage, ANNOUNCE_LENGTH, FOLLOW_UP_LENGTH, PDELAY_LENGTH, SYNC_LENGTH,
};
use crate::protocol::transport::recording::RecordingTransmitter;
use crate::protocol::transport::Outbound;
use crate::time::mock::MockHardware;
use crate::time::HardwareTimestampInterface;

const LOCAL: ClockIdentity = ClockIdentity([0x10; 8]);
const TICK: Duration = Duration::from_millis(10);
const LINK_DELAY_NS: i128 = 500;
const TURNAROUND_NS: i128 = 10_000;

fn peer(byte: u8) -> PortIdentity {
    PortIdentity::new(ClockIdentity([byte; 8]), 1)
}

/// A coordinator wired to a neighbor that answers PDelay requests and,
/// when asked to, acts as a better grandmaster
struct Harness {
    coord: Coordinator,
    hw: Arc<MockHardware>,
    sink: Arc<RecordingTransmitter>,
    t0: Instant,
    now: Instant,
    master: PortIdentity,
    responders: Vec<PortIdentity>,
    announcing: bool,
    syncing: bool,
    offset_ns: i128,
    next_announce: Instant,
    next_sync: Instant,
    announce_seq: u16,
    sync_seq: u16,
    requests_seen: Vec<Duration>,
}

impl Harness {
    fn new(config: Config) -> Self {
        let hw = Arc::new(MockHardware::new());
        let sink = Arc::new(RecordingTransmitter::new());
        let coord = Coordinator::new(config, hw.clone(), sink.clone()).unwrap();
        let t0 = Instant::now();
        Harness {
            coord,
            hw,
            sink,
            t0,
            now: t0,
            master: peer(0x20),
            responders: vec![peer(0x20)],
            announcing: false,
            syncing: false,
            offset_ns: 20,
            next_announce: t0,
            next_sync: t0,
            announce_seq: 0,
            sync_seq: 0,
            requests_seen: Vec::new(),
        }
    }

    fn with_defaults() -> Self {
        Harness::new(Config {
            clock_identity: LOCAL,
            priority1: 128,
            ..Config::default()
        })
    }

    fn start(&mut self) {
        self.coord.start_at(self.now).unwrap();
    }

    fn elapsed(&self) -> Duration {
        self.now.duration_since(self.t0)
    }

    fn clock(&self) -> i128 {
        self.hw.get_clock_time().unwrap().to_nanos()
    }

    fn step(&mut self) {
        self.coord.tick_at(self.now);

        for msg in self.sink.take() {
            if let Outbound::PdelayReq(req) = msg {
                self.requests_seen.push(self.elapsed());
                self.answer(req.header.sequence_id);
            }
        }
        if self.announcing && self.now >= self.next_announce {
            self.announce();
            self.next_announce += Duration::from_secs(1);
        }
        if self.syncing && self.now >= self.next_sync {
            self.sync();
            self.next_sync += Duration::from_millis(125);
        }

        self.now += TICK;
        self.hw.advance_nanos(TICK.as_nanos() as i128);
    }

    fn run_for(&mut self, duration: Duration) {
        let end = self.now + duration;
        while self.now < end {
            self.step();
        }
    }

    /// Every configured responder answers with the same link delay; `t1` is
    /// the mock clock, which is what the initiator captured on send
    fn answer(&mut self, sequence_id: u16) {
        let t1 = self.clock();
        let t2 = t1 + LINK_DELAY_NS;
        let t3 = t2 + TURNAROUND_NS;
        let t4 = t3 + LINK_DELAY_NS;
        let requester = PortIdentity::new(LOCAL, 1);

        for responder in self.responders.clone() {
            let resp = PdelayRespMessage {
                header: Header::new(responder, sequence_id, PDELAY_LENGTH),
                request_receipt_timestamp: Timestamp::from_nanos(t2).unwrap(),
                requesting_port_identity: requester,
            };
            self.coord
                .process_pdelay_response(&resp, Timestamp::from_nanos(t4).unwrap());
            let follow_up = PdelayRespFollowUpMessage {
                header: Header::new(responder, sequence_id, PDELAY_LENGTH),
                response_origin_timestamp: Timestamp::from_nanos(t3).unwrap(),
                requesting_port_identity: requester,
            };
            self.coord.process_pdelay_response_follow_up(&follow_up);
        }
    }

    fn announce(&mut self) {
        self.announce_seq = self.announce_seq.wrapping_add(1);
        let msg = AnnounceMessage {
            header: Header::new(self.master, self.announce_seq, ANNOUNCE_LENGTH),
            current_utc_offset: 37,
            priority1: 100,
            grandmaster_clock_quality: ClockQuality::default(),
            priority2: 248,
            grandmaster_identity: self.master.clock_identity,
            steps_removed: 0,
            time_source: time_source::GPS,
        };
        self.coord.process_announce_at(&msg, self.now);
    }

    /// Two-step Sync whose receive time is `offset_ns` after what the link
    /// delay accounts for
    fn sync(&mut self) {
        self.sync_seq = self.sync_seq.wrapping_add(1);
        let origin = self.clock();
        let rx = Timestamp::from_nanos(origin + LINK_DELAY_NS + self.offset_ns).unwrap();

        let mut header = Header::new(self.master, self.sync_seq, SYNC_LENGTH);
        header.two_step = true;
        let sync = SyncMessage {
            header,
            origin_timestamp: Timestamp::from_nanos(origin).unwrap(),
        };
        self.coord.process_sync_at(&sync, rx, self.now);

        let follow_up = FollowUpMessage {
            header: Header::new(self.master, self.sync_seq, FOLLOW_UP_LENGTH),
            precise_origin_timestamp: Timestamp::from_nanos(origin).unwrap(),
        };
        self.coord.process_follow_up_at(&follow_up, self.now);
    }
}

#[test]
fn test_better_master_selected_and_synchronized() {
    let mut h = Harness::with_defaults();
    h.announcing = true;
    h.syncing = true;
    h.start();

    h.run_for(Duration::from_millis(20));
    assert_eq!(h.coord.port_state(), PortState::Uncalibrated);
    assert_eq!(h.coord.state(), ManagerState::SlaveSynchronizing);
    assert!(h.coord.is_slave());

    // asCapable after three committed windows, lock seven samples later
    h.run_for(Duration::from_secs(2));
    assert!(!h.coord.path_delay().calibrated);
    h.run_for(Duration::from_secs(3));

    let path = h.coord.path_delay();
    assert!(path.calibrated);
    assert_eq!(path.mean_link_delay.to_nanoseconds(), 500);
    assert_eq!(path.neighbor_rate_ratio, 1.0);

    assert_eq!(h.coord.port_state(), PortState::Slave);
    assert_eq!(h.coord.state(), ManagerState::SlaveSynchronized);
    assert!(h.coord.is_synchronized());

    let info = h.coord.sync_info();
    assert_eq!(info.master, Some(peer(0x20)));
    assert_eq!(info.offset_from_master_ns, 20.0);

    let status = h.coord.system_status_at(h.now);
    assert_eq!(status.grandmaster_identity, Some(ClockIdentity([0x20; 8])));
    assert_eq!(status.master_port_identity, Some(peer(0x20)));
    assert_eq!(status.steps_removed, 0);
    assert_eq!(status.consecutive_timeouts, 0);
}

#[test]
fn test_silent_grandmaster_hands_over_to_local_clock() {
    let mut h = Harness::with_defaults();
    h.announcing = true;
    h.syncing = true;
    h.start();
    h.run_for(Duration::from_secs(5));
    assert_eq!(h.coord.port_state(), PortState::Slave);

    // Stop right after an Announce so the receipt window is exact
    let last_announce = h.next_announce;
    while h.now <= last_announce {
        h.step();
    }
    h.announcing = false;

    while h.now < last_announce + Duration::from_secs(3) {
        h.step();
    }
    assert_eq!(h.coord.port_state(), PortState::Slave);
    h.step();
    assert_eq!(h.coord.port_state(), PortState::PreMaster);
    assert!(!h.coord.is_slave());

    h.run_for(Duration::from_secs(1));
    assert_eq!(h.coord.port_state(), PortState::Master);
    assert_eq!(h.coord.system_status_at(h.now).grandmaster_identity, Some(LOCAL));
}

#[test]
fn test_clock_jump_steps_once_and_relocks() {
    let mut h = Harness::with_defaults();
    h.announcing = true;
    h.syncing = true;
    h.start();
    h.run_for(Duration::from_secs(5));
    assert_eq!(h.coord.state(), ManagerState::SlaveSynchronized);

    // Align to the next Sync so exactly one carries the jump
    while h.now < h.next_sync {
        h.step();
    }
    h.offset_ns = 5_000_000;
    h.step();
    h.offset_ns = 20;

    assert_eq!(h.hw.phase_adjustments(), vec![-5_000_000]);
    assert_eq!(h.coord.get_statistics().servo.clock_jumps, 1);
    assert!(h.coord.get_edge_case_status().clock_jump_detected);
    assert_eq!(h.coord.port_state(), PortState::Uncalibrated);

    h.run_for(Duration::from_secs(2));
    assert_eq!(h.coord.state(), ManagerState::SlaveSynchronized);
    assert_eq!(h.hw.phase_adjustments().len(), 1);
}

#[test]
fn test_external_clock_jump_report() {
    let mut h = Harness::with_defaults();
    h.announcing = true;
    h.syncing = true;
    h.start();
    h.run_for(Duration::from_secs(5));

    h.coord
        .handle_clock_jump_at(crate::core::TimeInterval::from_nanoseconds(2_000_000), h.now);
    assert_eq!(h.hw.phase_adjustments(), vec![-2_000_000]);
    assert_eq!(h.coord.get_statistics().manager.clock_jumps_reported, 1);
    assert_eq!(h.coord.port_state(), PortState::Uncalibrated);
}

#[test]
fn test_milan_cessation_and_resume() {
    let mut h = Harness::new(Config::milan(LOCAL));
    h.responders = vec![peer(0x20), peer(0x30)];
    h.start();

    h.run_for(Duration::from_millis(3_010));
    let edge = h.coord.get_edge_case_status();
    assert!(edge.milan_cessation_active);
    assert_eq!(edge.multiple_response_count, 3);
    let status = h.coord.system_status_at(h.now);
    assert!(status.milan_enabled);
    assert!(status.pdelay_cessation_active);
    assert!(!status.as_capable);

    // Quiet for the whole cessation period
    let requests_before = h.requests_seen.len();
    h.responders = vec![peer(0x20)];
    h.run_for(Duration::from_secs(299));
    assert_eq!(h.requests_seen.len(), requests_before);
    assert_ne!(h.coord.state(), ManagerState::RecoveryMode);

    h.run_for(Duration::from_secs(2));
    assert!(h.requests_seen.len() > requests_before);
    assert!(!h.coord.get_edge_case_status().milan_cessation_active);
    assert_eq!(h.coord.get_statistics().pdelay_initiator.cessation_periods, 1);
}

#[test]
fn test_multiple_responders_without_milan_do_not_cease() {
    let mut h = Harness::with_defaults();
    h.responders = vec![peer(0x20), peer(0x30)];
    h.start();
    h.run_for(Duration::from_secs(6));

    let edge = h.coord.get_edge_case_status();
    assert!(!edge.milan_cessation_active);
    assert!(edge.multiple_response_count >= 5);
    assert!(!h.coord.path_delay().calibrated);
    assert!(h.requests_seen.len() >= 6);
}

#[test]
fn test_milan_violation_report_ceases_pdelay() {
    let mut h = Harness::new(Config::milan(LOCAL));
    h.start();
    h.run_for(Duration::from_millis(100));

    h.coord.handle_milan_violation_at("duplicate grandmaster", h.now);
    let edge = h.coord.get_edge_case_status();
    assert!(edge.milan_profile_violation);
    assert!(edge.milan_cessation_active);

    let seen = h.requests_seen.len();
    h.run_for(Duration::from_secs(5));
    assert_eq!(h.requests_seen.len(), seen);
}

#[test]
fn test_hardware_fault_recovers_automatically() {
    let mut h = Harness::with_defaults();
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    h.coord.set_recovery_callback(Box::new(move |ok, details| {
        sink.lock().unwrap().push((ok, details.to_string()));
    }));
    h.start();
    h.run_for(Duration::from_secs(1));

    h.coord
        .process_event_at(super::ManagerEvent::HardwareFaultDetected, h.now);
    assert_eq!(h.coord.state(), ManagerState::RecoveryMode);
    assert_eq!(h.coord.port_state(), PortState::Faulty);
    assert!(h.coord.get_edge_case_status().recovery_in_progress);

    // Nothing is sent while recovering
    h.run_for(Duration::from_millis(9_900));
    assert_eq!(h.coord.state(), ManagerState::RecoveryMode);
    let requests = h.requests_seen.len();

    h.run_for(Duration::from_millis(200));
    assert_eq!(h.coord.state(), ManagerState::Listening);
    assert_eq!(requests, h.requests_seen.len() - 1);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].0);
    assert!(results[0].1.contains("automatic"));

    let stats = h.coord.get_statistics().manager;
    assert_eq!(stats.recovery_events, 1);
    assert!(!h.coord.get_edge_case_status().recovery_in_progress);
}

#[test]
fn test_manual_recovery() {
    let mut h = Harness::with_defaults();
    h.start();
    h.coord
        .process_event_at(super::ManagerEvent::HardwareFaultDetected, h.now);
    assert_eq!(h.coord.state(), ManagerState::RecoveryMode);

    assert!(h.coord.trigger_manual_recovery_at(h.now));
    assert_eq!(h.coord.state(), ManagerState::Listening);
    assert!(!h.coord.trigger_manual_recovery_at(h.now));
}

#[test]
fn test_adjustment_failures_enter_recovery() {
    let mut h = Harness::with_defaults();
    h.announcing = true;
    h.syncing = true;
    h.start();
    h.run_for(Duration::from_secs(5));
    assert_eq!(h.coord.state(), ManagerState::SlaveSynchronized);

    h.hw.set_adjust_failing(true);
    h.run_for(Duration::from_millis(500));
    assert_eq!(h.coord.state(), ManagerState::RecoveryMode);
    let edge = h.coord.get_edge_case_status();
    assert!(edge.hardware_timestamp_fault);
    assert_eq!(h.coord.get_statistics().sync_rx.adjustment_failures, 3);
}

#[test]
fn test_lost_pdelay_responses_escalate() {
    let mut h = Harness::with_defaults();
    h.start();
    h.run_for(Duration::from_millis(3_500));
    assert!(h.coord.path_delay().calibrated);

    h.responders.clear();
    h.run_for(Duration::from_secs(5));
    assert_eq!(h.coord.state(), ManagerState::MasterActive);
    h.run_for(Duration::from_secs(1));

    assert_eq!(h.coord.state(), ManagerState::RecoveryMode);
    assert!(h.coord.get_statistics().manager.timeout_events >= 5);
    let status = h.coord.system_status_at(h.now);
    assert!(status.in_recovery_mode);
    assert!(status.active_faults.iter().any(|f| f.contains("consecutive receipt timeouts")));
}

#[test]
fn test_congestion_suppresses_escalation() {
    let mut h = Harness::with_defaults();
    h.start();
    h.run_for(Duration::from_millis(3_500));
    h.coord.handle_network_congestion(0.8);

    h.responders.clear();
    h.run_for(Duration::from_secs(8));
    assert_ne!(h.coord.state(), ManagerState::RecoveryMode);
    assert!(h.coord.get_statistics().manager.timeout_events >= 5);
    assert_eq!(h.coord.system_status_at(h.now).consecutive_timeouts, 0);
}

#[test]
fn test_status_exports_as_json() {
    let mut h = Harness::with_defaults();
    h.announcing = true;
    h.syncing = true;
    h.start();
    h.run_for(Duration::from_secs(5));

    let status = serde_json::to_value(h.coord.system_status_at(h.now)).unwrap();
    assert_eq!(status["manager_state"], "SLAVE_SYNCHRONIZED");
    assert_eq!(status["is_synchronized"], true);
    assert_eq!(status["as_capable"], true);

    let stats = serde_json::to_value(h.coord.get_statistics()).unwrap();
    // Windows committed at 1, 2, 3 and 4 s
    assert_eq!(stats["pdelay_initiator"]["measurements"], 4);
    assert!(stats["servo"]["lock_acquired"].as_u64().unwrap() >= 1);

    let edge = serde_json::to_value(h.coord.get_edge_case_status()).unwrap();
    assert_eq!(edge["recovery_in_progress"], false);
}

#[test]
fn test_stop_silences_port() {
    let mut h = Harness::with_defaults();
    h.announcing = true;
    h.start();
    h.run_for(Duration::from_secs(1));
    h.coord.stop();
    h.coord.stop();

    let seen = h.requests_seen.len();
    h.run_for(Duration::from_secs(3));
    assert_eq!(h.requests_seen.len(), seen);
    assert_eq!(h.coord.state(), ManagerState::Uninitialized);
    assert_eq!(h.coord.get_statistics().announce_rx.announces_received, 1);
}
