//! Parsed gPTP message records
//!
//! The network layer decodes frames into these records (checked, endian
//! correct) before handing them to the state machines. Byte layouts are not
//! modelled here; only the fields the state machines consume.

use serde::{Deserialize, Serialize};

use crate::core::{ClockIdentity, ClockQuality, Dataset, PortIdentity, TimeInterval, Timestamp};

/// Announce message length including the path trace TLV for one hop
pub const ANNOUNCE_LENGTH: u16 = 76;
/// Sync message length
pub const SYNC_LENGTH: u16 = 44;
/// Follow-Up message length including the follow-up information TLV
pub const FOLLOW_UP_LENGTH: u16 = 76;
/// PDelay request, response and response follow-up length
pub const PDELAY_LENGTH: u16 = 54;

/// Time source advertised in Announce messages
pub mod time_source {
    pub const ATOMIC_CLOCK: u8 = 0x10;
    pub const GPS: u8 = 0x20;
    pub const PTP: u8 = 0x40;
    pub const NTP: u8 = 0x50;
    pub const INTERNAL_OSCILLATOR: u8 = 0xA0;
}

/// Common message header fields
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub domain_number: u8,
    pub sequence_id: u16,
    pub source_port_identity: PortIdentity,
    /// log2 of the sender's message interval
    pub log_message_interval: i8,
    pub correction_field: TimeInterval,
    pub message_length: u16,
    /// Set on Sync when a Follow-Up will carry the precise origin
    pub two_step: bool,
}

impl Header {
    pub fn new(
        source_port_identity: PortIdentity,
        sequence_id: u16,
        message_length: u16,
    ) -> Self {
        Header {
            domain_number: crate::core::DEFAULT_DOMAIN,
            sequence_id,
            source_port_identity,
            log_message_interval: 0,
            correction_field: TimeInterval::ZERO,
            message_length,
            two_step: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnounceMessage {
    pub header: Header,
    pub current_utc_offset: i16,
    pub priority1: u8,
    pub grandmaster_clock_quality: ClockQuality,
    pub priority2: u8,
    pub grandmaster_identity: ClockIdentity,
    pub steps_removed: u16,
    pub time_source: u8,
}

impl AnnounceMessage {
    /// Priority vector carried by this Announce as seen on `receiver_port`
    pub fn dataset(&self, receiver_port: u16) -> Dataset {
        Dataset {
            grandmaster_identity: self.grandmaster_identity,
            grandmaster_quality: self.grandmaster_clock_quality,
            priority1: self.priority1,
            priority2: self.priority2,
            steps_removed: self.steps_removed,
            sender: self.header.source_port_identity,
            receiver_port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub header: Header,
    /// Approximate origin on two-step clocks, precise on one-step clocks
    pub origin_timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FollowUpMessage {
    pub header: Header,
    pub precise_origin_timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdelayReqMessage {
    pub header: Header,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdelayRespMessage {
    pub header: Header,
    /// t2: when the responder received the request
    pub request_receipt_timestamp: Timestamp,
    pub requesting_port_identity: PortIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PdelayRespFollowUpMessage {
    pub header: Header,
    /// t3: when the responder transmitted the response
    pub response_origin_timestamp: Timestamp,
    pub requesting_port_identity: PortIdentity,
}
