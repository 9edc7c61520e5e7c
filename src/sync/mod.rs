//! Synchronization module
//!
//! This module handles time transfer from master to slave: Sync/Follow-Up
//! transmission on master ports, offset computation on slave ports and the
//! servo that turns offsets into clock corrections.

pub mod master;
pub mod servo;
pub mod slave;

pub use self::master::{SyncTransmitter, SyncTxStatistics, TransmissionInfo};
pub use self::servo::{
    OffsetFilter, PiController, Servo, ServoAction, ServoOutput, ServoState, ServoStatistics,
};
pub use self::slave::{SlaveEvent, SyncInfo, SyncReceiver, SyncRxStatistics};
