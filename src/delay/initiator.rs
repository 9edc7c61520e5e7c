//! Peer delay initiator
//!
//! Each request opens a measurement window that closes at the response
//! receipt timeout or when the next request is due. Inside the window the
//! four timestamps are collected:
//!
//! ```text
//!   t1  request leaves this port        (local clock)
//!   t2  request reaches the responder   (PdelayResp)
//!   t3  response leaves the responder   (PdelayRespFollowUp)
//!   t4  response reaches this port      (local clock)
//!
//!   delay = (r·(t4 − t1) − (t3 − t2)) / 2
//! ```
//!
//! `r` is the neighbor rate ratio measured from consecutive `t3`/`t4`
//! pairs. A window is committed to the link delay filter when it closes, so
//! a second responder seen in the same window voids it.
//!
//! More than one responder in consecutive windows means the link is not a
//! point-to-point gPTP link. With Milan enabled the initiator then ceases
//! requests for the configured period and resumes on its own afterwards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::link::{LinkDelay, LinkDelayStatistics};
use super::PathDelayMeasurement;
use crate::core::{ClockIdentity, Config, PortIdentity, Timestamp};
use crate::protocol::message::{
    Header, PdelayReqMessage, PdelayRespFollowUpMessage, PdelayRespMessage, PDELAY_LENGTH,
};
use crate::protocol::transport::MessageTransmitter;
use crate::time::{HardwareError, HardwareHealth, HardwareTimestampInterface};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatorStatistics {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub follow_ups_received: u64,
    pub invalid_responses: u64,
    pub response_timeouts: u64,
    pub measurements: u64,
    pub discarded_measurements: u64,
    pub multiple_resp_events: u64,
    pub cessation_periods: u64,
    pub transmit_failures: u64,
    pub tx_timestamp_timeouts: u64,
    pub hardware_errors: u64,
}

/// Milan multiple-response state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilanStatus {
    pub enabled: bool,
    pub multiple_pdelay_resp_detected: bool,
    pub consecutive_multiple_windows: u32,
    pub cessation_active: bool,
    pub cessation_remaining: Option<Duration>,
}

/// What happened during one initiator tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitiatorTick {
    /// A measurement was committed to the link delay filter
    pub measured: bool,
    pub as_capable_changed: bool,
    /// A request window closed without any response
    pub response_timeout: bool,
    pub cessation_started: bool,
    pub cessation_ended: bool,
}

#[derive(Debug, Clone, Copy)]
struct Response {
    responder: PortIdentity,
    t2: Timestamp,
    t4: Timestamp,
}

#[derive(Debug, Clone, Copy)]
struct Computed {
    delay_ns: f64,
    rate_ratio: f64,
    t3: Timestamp,
    t4: Timestamp,
    responder: ClockIdentity,
}

#[derive(Debug, Clone)]
struct Window {
    sequence_id: u16,
    deadline: Instant,
    t1: Option<Timestamp>,
    response: Option<Response>,
    responders: Vec<ClockIdentity>,
    multiple: bool,
    computed: Option<Computed>,
}

pub struct PathDelayInitiator {
    port_identity: PortIdentity,
    domain_number: u8,
    interval: Duration,
    receipt_timeout: Duration,
    allowed_lost_responses: u32,
    milan_enabled: bool,
    multiple_resp_threshold: u32,
    cessation_duration: Duration,
    hardware: Arc<dyn HardwareTimestampInterface>,
    transmitter: Arc<dyn MessageTransmitter>,
    enabled: bool,
    next_due: Option<Instant>,
    sequence_id: u16,
    window: Option<Window>,
    previous: Option<(ClockIdentity, Timestamp, Timestamp)>,
    lost_responses: u32,
    multiple_detected: bool,
    consecutive_multiple: u32,
    ceased_until: Option<Instant>,
    link: LinkDelay,
    health: HardwareHealth,
    stats: InitiatorStatistics,
}

impl PathDelayInitiator {
    pub fn new(
        config: &Config,
        hardware: Arc<dyn HardwareTimestampInterface>,
        transmitter: Arc<dyn MessageTransmitter>,
    ) -> Self {
        PathDelayInitiator {
            port_identity: config.port_identity(),
            domain_number: config.domain_number,
            interval: config.path_delay.pdelay_interval,
            receipt_timeout: config.path_delay.pdelay_resp_receipt_timeout,
            allowed_lost_responses: config.path_delay.allowed_lost_responses,
            milan_enabled: config.milan.enabled,
            multiple_resp_threshold: config.milan.multiple_resp_threshold,
            cessation_duration: config.milan.cessation_duration,
            hardware,
            transmitter,
            enabled: false,
            next_due: None,
            sequence_id: 0,
            window: None,
            previous: None,
            lost_responses: 0,
            multiple_detected: false,
            consecutive_multiple: 0,
            ceased_until: None,
            link: LinkDelay::new(&config.path_delay),
            health: HardwareHealth::default(),
            stats: InitiatorStatistics::default(),
        }
    }

    pub fn enable(&mut self, now: Instant) {
        if !self.enabled {
            debug!(port = %self.port_identity, "PDelay initiator enabled");
            self.enabled = true;
            self.next_due = Some(now);
        }
    }

    /// Stops requests; the link keeps its last measurement
    pub fn disable(&mut self) {
        self.enabled = false;
        self.next_due = None;
        self.window = None;
    }

    /// Drops every measurement and the Milan state
    pub fn reset(&mut self) {
        self.disable();
        self.previous = None;
        self.lost_responses = 0;
        self.multiple_detected = false;
        self.consecutive_multiple = 0;
        self.ceased_until = None;
        self.link.reset();
        self.health.reset();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn tick(&mut self, now: Instant) -> InitiatorTick {
        let mut out = InitiatorTick::default();
        if !self.enabled {
            return out;
        }

        if let Some(until) = self.ceased_until {
            if now < until {
                return out;
            }
            self.ceased_until = None;
            self.consecutive_multiple = 0;
            self.multiple_detected = false;
            self.next_due = Some(now);
            out.cessation_ended = true;
            info!(port = %self.port_identity, "PDelay cessation over, resuming requests");
        }

        if self.window.as_ref().map_or(false, |w| w.t1.is_none()) {
            self.poll_t1();
        }

        let due = matches!(self.next_due, Some(due) if now >= due);
        let expired = self.window.as_ref().map_or(false, |w| now >= w.deadline);
        if due || expired {
            if let Some(window) = self.window.take() {
                self.close_window(window, now, &mut out);
            }
        }

        if self.ceased_until.is_none() && matches!(self.next_due, Some(due) if now >= due) {
            self.send_request(now);
            self.next_due = Some(now + self.interval);
        }
        out
    }

    fn close_window(&mut self, window: Window, now: Instant, out: &mut InitiatorTick) {
        if window.multiple {
            self.stats.discarded_measurements += u64::from(window.computed.is_some());
            self.stats.multiple_resp_events += 1;
            self.consecutive_multiple = self.consecutive_multiple.saturating_add(1);
            out.as_capable_changed |= self.link.disqualify();
            warn!(
                port = %self.port_identity,
                responders = window.responders.len(),
                consecutive = self.consecutive_multiple,
                "Multiple PDelay responders in one window"
            );
            if self.milan_enabled && self.consecutive_multiple >= self.multiple_resp_threshold {
                self.start_cessation(now);
                out.cessation_started = true;
            }
            return;
        }

        self.consecutive_multiple = 0;
        self.multiple_detected = false;

        match window.computed {
            Some(computed) => {
                self.lost_responses = 0;
                self.stats.measurements += 1;
                self.previous = Some((computed.responder, computed.t3, computed.t4));
                out.measured = true;
                out.as_capable_changed |=
                    self.link.record(computed.delay_ns, computed.rate_ratio, now);
                debug!(
                    port = %self.port_identity,
                    delay_ns = computed.delay_ns,
                    rate_ratio = computed.rate_ratio,
                    mean_ns = self.link.mean_link_delay().to_nanoseconds_f64(),
                    "PDelay measurement"
                );
            }
            None if window.response.is_none() => {
                self.lost_responses = self.lost_responses.saturating_add(1);
                self.stats.response_timeouts += 1;
                out.response_timeout = true;
                debug!(
                    port = %self.port_identity,
                    seq = window.sequence_id,
                    lost = self.lost_responses,
                    "PDelay response timeout"
                );
                if self.lost_responses > self.allowed_lost_responses {
                    out.as_capable_changed |= self.link.disqualify();
                }
            }
            None => {
                trace!(port = %self.port_identity, seq = window.sequence_id, "PDelay window incomplete");
            }
        }
    }

    /// Stops requests for the cessation period
    pub fn start_cessation(&mut self, now: Instant) {
        let until = now + self.cessation_duration;
        self.ceased_until = Some(until);
        self.window = None;
        self.consecutive_multiple = 0;
        self.stats.cessation_periods += 1;
        self.link.disqualify();
        warn!(
            port = %self.port_identity,
            duration_s = self.cessation_duration.as_secs_f64(),
            "Ceasing PDelay transmission"
        );
    }

    fn send_request(&mut self, now: Instant) {
        self.sequence_id = self.sequence_id.wrapping_add(1);
        let mut header = Header::new(self.port_identity, self.sequence_id, PDELAY_LENGTH);
        header.domain_number = self.domain_number;
        header.log_message_interval = crate::util::duration_to_log_interval(self.interval);

        if !self.transmitter.send_pdelay_req(&PdelayReqMessage { header }) {
            self.stats.transmit_failures += 1;
            warn!(port = %self.port_identity, seq = self.sequence_id, "PDelay request transmit failed");
            return;
        }
        self.stats.requests_sent += 1;
        self.window = Some(Window {
            sequence_id: self.sequence_id,
            deadline: now + self.receipt_timeout,
            t1: None,
            response: None,
            responders: Vec::new(),
            multiple: false,
            computed: None,
        });
        self.poll_t1();
    }

    fn poll_t1(&mut self) {
        let window = match self.window.as_mut() {
            Some(window) => window,
            None => return,
        };
        match self.hardware.capture_tx_timestamp(window.sequence_id) {
            Ok(t1) => {
                self.health.record_ok(true);
                window.t1 = Some(t1);
            }
            Err(HardwareError::Timeout) => {}
            Err(e) => {
                self.health.record_ok(false);
                self.stats.hardware_errors += 1;
                warn!(port = %self.port_identity, error = %e, "PDelay request tx timestamp failed");
            }
        }
    }

    fn matches_window(&self, header: &Header, requesting: &PortIdentity) -> bool {
        header.domain_number == self.domain_number
            && *requesting == self.port_identity
            && self
                .window
                .as_ref()
                .map_or(false, |w| w.sequence_id == header.sequence_id)
    }

    /// Handles a PDelay response received at `t4`
    pub fn process_response(&mut self, msg: &PdelayRespMessage, t4: Timestamp) {
        if !self.enabled || self.ceased_until.is_some() {
            return;
        }
        if !self.matches_window(&msg.header, &msg.requesting_port_identity) {
            self.stats.invalid_responses += 1;
            debug!(
                port = %self.port_identity,
                seq = msg.header.sequence_id,
                requester = %msg.requesting_port_identity,
                "PDelay response does not match outstanding request"
            );
            return;
        }
        self.stats.responses_received += 1;

        let responder = msg.header.source_port_identity;
        let port = self.port_identity;
        let window = match self.window.as_mut() {
            Some(window) => window,
            None => return,
        };
        if !window.responders.contains(&responder.clock_identity) {
            window.responders.push(responder.clock_identity);
        }
        if window.responders.len() > 1 {
            if !window.multiple {
                warn!(port = %port, responder = %responder, "Second PDelay responder detected");
            }
            window.multiple = true;
            self.multiple_detected = true;
            return;
        }
        if window.response.is_none() {
            window.response = Some(Response {
                responder,
                t2: msg.request_receipt_timestamp,
                t4,
            });
        }
    }

    pub fn process_response_follow_up(&mut self, msg: &PdelayRespFollowUpMessage) {
        if !self.enabled || self.ceased_until.is_some() {
            return;
        }
        if !self.matches_window(&msg.header, &msg.requesting_port_identity) {
            self.stats.invalid_responses += 1;
            return;
        }
        self.stats.follow_ups_received += 1;

        if self.window.as_ref().map_or(false, |w| w.t1.is_none()) {
            self.poll_t1();
        }

        let previous = self.previous;
        let port = self.port_identity;
        let window = match self.window.as_mut() {
            Some(window) => window,
            None => return,
        };
        if window.multiple || window.computed.is_some() {
            return;
        }
        let response = match window.response {
            Some(response) if response.responder == msg.header.source_port_identity => response,
            _ => {
                self.stats.invalid_responses += 1;
                return;
            }
        };
        let t1 = match window.t1 {
            Some(t1) => t1,
            None => {
                self.stats.tx_timestamp_timeouts += 1;
                warn!(port = %port, seq = window.sequence_id, "No tx timestamp for PDelay request");
                return;
            }
        };
        let t3 = msg.response_origin_timestamp;
        let t4 = response.t4;

        let rate_ratio = match previous {
            Some((clock, t3_prev, t4_prev)) if clock == response.responder.clock_identity => {
                let local = t4.nanos_since(&t4_prev);
                if local > 0 {
                    t3.nanos_since(&t3_prev) as f64 / local as f64
                } else {
                    1.0
                }
            }
            _ => 1.0,
        };
        let turnaround = t3.nanos_since(&response.t2) as f64;
        let round_trip = t4.nanos_since(&t1) as f64;
        let delay_ns = (rate_ratio * round_trip - turnaround) / 2.0;

        window.computed = Some(Computed {
            delay_ns,
            rate_ratio,
            t3,
            t4,
            responder: response.responder.clock_identity,
        });
    }

    pub fn as_capable(&self) -> bool {
        self.link.as_capable()
    }

    pub fn measurement(&self) -> PathDelayMeasurement {
        self.link.measurement()
    }

    pub fn is_ceased(&self) -> bool {
        self.ceased_until.is_some()
    }

    pub fn milan_status(&self, now: Instant) -> MilanStatus {
        MilanStatus {
            enabled: self.milan_enabled,
            multiple_pdelay_resp_detected: self.multiple_detected,
            consecutive_multiple_windows: self.consecutive_multiple,
            cessation_active: self.ceased_until.is_some(),
            cessation_remaining: self.ceased_until.map(|until| until.saturating_duration_since(now)),
        }
    }

    pub fn health(&self) -> HardwareHealth {
        self.health
    }

    pub fn reset_health(&mut self) {
        self.health.reset();
    }

    pub fn statistics(&self) -> InitiatorStatistics {
        self.stats
    }

    pub fn link_statistics(&self) -> LinkDelayStatistics {
        self.link.statistics()
    }

    pub fn clear_statistics(&mut self) {
        self.stats = InitiatorStatistics::default();
        self.link.clear_statistics();
    }
}
