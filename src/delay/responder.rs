//! Peer delay responder
//!
//! Answers each valid request with a PdelayResp carrying the request receipt
//! time (t2), then a PdelayRespFollowUp carrying the response transmit time
//! (t3) once the hardware reports it. Malformed requests are counted and
//! dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::core::{Config, PortIdentity, Timestamp};
use crate::protocol::message::{
    Header, PdelayReqMessage, PdelayRespFollowUpMessage, PdelayRespMessage, PDELAY_LENGTH,
};
use crate::protocol::transport::MessageTransmitter;
use crate::time::{HardwareError, HardwareHealth, HardwareTimestampInterface};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponderStatistics {
    pub requests_received: u64,
    pub invalid_requests: u64,
    pub responses_sent: u64,
    pub follow_ups_sent: u64,
    pub tx_timestamp_timeouts: u64,
    pub transmit_failures: u64,
    pub hardware_errors: u64,
    /// Follow-ups abandoned because too many were awaiting a timestamp
    pub follow_ups_dropped: u64,
    pub requesters_evicted: u64,
}

/// Why a request was not answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRequest {
    Disabled,
    WrongLength(u16),
    WrongDomain(u8),
    ZeroRequester,
    DuplicateSequence(u16),
}

/// Requesters remembered for duplicate detection; oldest evicted first
const MAX_REQUESTERS: usize = 8;
/// Follow-ups awaiting a transmit timestamp; oldest dropped first
const MAX_PENDING: usize = 4;

#[derive(Debug, Clone, Copy)]
struct PendingFollowUp {
    sequence_id: u16,
    requester: PortIdentity,
    deadline: Instant,
}

pub struct PathDelayResponder {
    port_identity: PortIdentity,
    domain_number: u8,
    tx_timestamp_timeout: Duration,
    hardware: Arc<dyn HardwareTimestampInterface>,
    transmitter: Arc<dyn MessageTransmitter>,
    enabled: bool,
    last_sequence: VecDeque<(PortIdentity, u16)>,
    pending: VecDeque<PendingFollowUp>,
    health: HardwareHealth,
    stats: ResponderStatistics,
}

impl PathDelayResponder {
    pub fn new(
        config: &Config,
        hardware: Arc<dyn HardwareTimestampInterface>,
        transmitter: Arc<dyn MessageTransmitter>,
    ) -> Self {
        PathDelayResponder {
            port_identity: config.port_identity(),
            domain_number: config.domain_number,
            tx_timestamp_timeout: config.path_delay.tx_timestamp_timeout,
            hardware,
            transmitter,
            enabled: false,
            last_sequence: VecDeque::with_capacity(MAX_REQUESTERS),
            pending: VecDeque::with_capacity(MAX_PENDING),
            health: HardwareHealth::default(),
            stats: ResponderStatistics::default(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.pending.clear();
    }

    pub fn reset(&mut self) {
        self.disable();
        self.last_sequence.clear();
        self.health.reset();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn validate(&self, msg: &PdelayReqMessage) -> Result<(), InvalidRequest> {
        let header = &msg.header;
        if !self.enabled {
            return Err(InvalidRequest::Disabled);
        }
        if header.message_length != PDELAY_LENGTH {
            return Err(InvalidRequest::WrongLength(header.message_length));
        }
        if header.domain_number != self.domain_number {
            return Err(InvalidRequest::WrongDomain(header.domain_number));
        }
        if header.source_port_identity.clock_identity.is_zero() {
            return Err(InvalidRequest::ZeroRequester);
        }
        let requester = header.source_port_identity;
        if self
            .last_sequence
            .iter()
            .any(|&(port, seq)| port == requester && seq == header.sequence_id)
        {
            return Err(InvalidRequest::DuplicateSequence(header.sequence_id));
        }
        Ok(())
    }

    /// Handles a request received at `t2`
    pub fn process_request(
        &mut self,
        msg: &PdelayReqMessage,
        t2: Timestamp,
        now: Instant,
    ) -> Result<(), InvalidRequest> {
        if let Err(reason) = self.validate(msg) {
            if reason != InvalidRequest::Disabled {
                self.stats.invalid_requests += 1;
                debug!(port = %self.port_identity, ?reason, "PDelay request rejected");
            }
            return Err(reason);
        }
        self.stats.requests_received += 1;

        let requester = msg.header.source_port_identity;
        let sequence_id = msg.header.sequence_id;
        self.remember(requester, sequence_id);

        let mut header = Header::new(self.port_identity, sequence_id, PDELAY_LENGTH);
        header.domain_number = self.domain_number;
        header.two_step = true;
        let resp = PdelayRespMessage {
            header,
            request_receipt_timestamp: t2,
            requesting_port_identity: requester,
        };
        if !self.transmitter.send_pdelay_resp(&resp) {
            self.stats.transmit_failures += 1;
            warn!(port = %self.port_identity, seq = sequence_id, "PDelay response transmit failed");
            return Ok(());
        }
        self.stats.responses_sent += 1;

        if self.pending.len() == MAX_PENDING {
            if let Some(dropped) = self.pending.pop_front() {
                self.stats.follow_ups_dropped += 1;
                warn!(port = %self.port_identity, seq = dropped.sequence_id, "Too many pending follow-ups, dropped oldest");
            }
        }
        self.pending.push_back(PendingFollowUp {
            sequence_id,
            requester,
            deadline: now + self.tx_timestamp_timeout,
        });
        self.poll(now);
        Ok(())
    }

    fn remember(&mut self, requester: PortIdentity, sequence_id: u16) {
        if let Some(index) = self.last_sequence.iter().position(|&(port, _)| port == requester) {
            self.last_sequence.remove(index);
        } else if self.last_sequence.len() == MAX_REQUESTERS {
            if let Some((evicted, _)) = self.last_sequence.pop_front() {
                self.stats.requesters_evicted += 1;
                debug!(port = %self.port_identity, requester = %evicted, "Requester table full, evicted oldest");
            }
        }
        self.last_sequence.push_back((requester, sequence_id));
    }

    /// Sends follow-ups whose transmit timestamps became available
    pub fn tick(&mut self, now: Instant) {
        if !self.pending.is_empty() {
            self.poll(now);
        }
    }

    fn poll(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.pending.len() {
            let entry = self.pending[index];
            let result = self.hardware.capture_tx_timestamp(entry.sequence_id);
            if matches!(result, Err(HardwareError::Timeout)) && now < entry.deadline {
                trace!(port = %self.port_identity, seq = entry.sequence_id, "Response tx timestamp not ready");
                index += 1;
                continue;
            }
            self.pending.remove(index);
            match result {
                Ok(t3) => {
                    self.health.record_ok(true);
                    self.send_follow_up(entry, t3);
                }
                Err(HardwareError::Timeout) => {
                    self.stats.tx_timestamp_timeouts += 1;
                    self.health.record_ok(false);
                    warn!(port = %self.port_identity, seq = entry.sequence_id, "Response tx timestamp timeout");
                }
                Err(e) => {
                    self.stats.hardware_errors += 1;
                    self.health.record_ok(false);
                    warn!(port = %self.port_identity, error = %e, "Response tx timestamp capture failed");
                }
            }
        }
    }

    fn send_follow_up(&mut self, entry: PendingFollowUp, t3: Timestamp) {
        let mut header = Header::new(self.port_identity, entry.sequence_id, PDELAY_LENGTH);
        header.domain_number = self.domain_number;
        let msg = PdelayRespFollowUpMessage {
            header,
            response_origin_timestamp: t3,
            requesting_port_identity: entry.requester,
        };
        if self.transmitter.send_pdelay_resp_follow_up(&msg) {
            self.stats.follow_ups_sent += 1;
        } else {
            self.stats.transmit_failures += 1;
        }
    }

    pub fn health(&self) -> HardwareHealth {
        self.health
    }

    pub fn reset_health(&mut self) {
        self.health.reset();
    }

    pub fn statistics(&self) -> ResponderStatistics {
        self.stats
    }

    pub fn clear_statistics(&mut self) {
        self.stats = ResponderStatistics::default();
    }
}
