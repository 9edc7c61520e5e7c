//! gPTP protocol state machines
//!
//! This module implements the port state machine, the best master clock
//! algorithm and the Announce machines, plus the parsed message records and
//! transmit callbacks they exchange with the network layer.

pub mod announce;
pub mod bmca;
pub mod message;
pub mod state;
pub mod transport;

pub use self::announce::{
    AnnounceReceiver, AnnounceTransmitter, ForeignMasterInfo, MasterInfo, RejectReason,
};
pub use self::bmca::{compare_datasets, BmcaDecision, BmcaEngine, ComparisonResult, PortRole};
pub use self::message::{
    AnnounceMessage, FollowUpMessage, Header, PdelayReqMessage, PdelayRespFollowUpMessage,
    PdelayRespMessage, SyncMessage,
};
pub use self::state::{PortEvent, PortStateMachine, PortTransition};
pub use self::transport::{MessageTransmitter, Outbound, OutboundSink};
