//! Coordinator states, events and observation snapshots

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{ClockIdentity, PortIdentity, PortState, TimeInterval};
use crate::delay::{InitiatorStatistics, LinkDelayStatistics, ResponderStatistics};
use crate::protocol::announce::{AnnounceRxStatistics, AnnounceTxStatistics};
use crate::protocol::bmca::{BmcaStatistics, PortRole};
use crate::protocol::state::PortStatistics;
use crate::sync::{ServoStatistics, SyncRxStatistics, SyncTxStatistics};

/// Superstate of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    FaultDetection,
    Listening,
    PreMaster,
    MasterActive,
    SlaveSynchronizing,
    SlaveSynchronized,
    PassiveMonitoring,
    AsymmetryMeasurement,
    RecoveryMode,
}

impl ManagerState {
    /// Superstate implied by a port state
    pub fn from_port_state(state: PortState) -> Self {
        match state {
            PortState::Initializing => ManagerState::Initializing,
            PortState::Faulty => ManagerState::FaultDetection,
            PortState::Listening => ManagerState::Listening,
            PortState::PreMaster => ManagerState::PreMaster,
            PortState::Master => ManagerState::MasterActive,
            PortState::Uncalibrated => ManagerState::SlaveSynchronizing,
            PortState::Slave => ManagerState::SlaveSynchronized,
            PortState::Passive | PortState::Disabled => ManagerState::PassiveMonitoring,
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagerState::Uninitialized => "UNINITIALIZED",
            ManagerState::Initializing => "INITIALIZING",
            ManagerState::FaultDetection => "FAULT_DETECTION",
            ManagerState::Listening => "LISTENING",
            ManagerState::PreMaster => "PRE_MASTER",
            ManagerState::MasterActive => "MASTER_ACTIVE",
            ManagerState::SlaveSynchronizing => "SLAVE_SYNCHRONIZING",
            ManagerState::SlaveSynchronized => "SLAVE_SYNCHRONIZED",
            ManagerState::PassiveMonitoring => "PASSIVE_MONITORING",
            ManagerState::AsymmetryMeasurement => "ASYMMETRY_MEASUREMENT",
            ManagerState::RecoveryMode => "RECOVERY_MODE",
        };
        f.write_str(name)
    }
}

/// Administrative and fault events accepted by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagerEvent {
    LinkUp,
    LinkDown,
    HardwareFaultDetected,
    TimestampFault,
    FaultCleared,
    ManualRecoveryTriggered,
    AutomaticRecoveryTriggered,
    ForcedReselection,
    PortEnabled,
    PortDisabled,
}

/// Snapshot returned by `Coordinator::get_system_status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub manager_state: ManagerState,
    pub port_state: PortState,
    pub port_role: Option<PortRole>,
    pub is_synchronized: bool,
    pub offset_from_master_ns: f64,
    pub frequency_adjustment_ppb: f64,
    pub path_delay: TimeInterval,
    pub neighbor_rate_ratio: f64,
    pub as_capable: bool,
    pub grandmaster_identity: Option<ClockIdentity>,
    pub master_port_identity: Option<PortIdentity>,
    pub steps_removed: u16,
    pub active_foreign_masters: usize,
    pub milan_enabled: bool,
    pub multiple_pdelay_resp_detected: bool,
    pub pdelay_cessation_active: bool,
    pub consecutive_timeouts: u32,
    pub in_recovery_mode: bool,
    pub active_faults: Vec<String>,
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    pub uptime: Duration,
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    pub time_in_state: Duration,
}

/// Edge conditions seen since the last recovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EdgeCaseStatus {
    pub clock_jump_detected: bool,
    pub asymmetric_path_detected: bool,
    pub path_asymmetry: TimeInterval,
    pub network_congestion_detected: bool,
    pub congestion_level: f64,
    pub hardware_timestamp_fault: bool,
    pub bmca_conflict_detected: bool,
    pub milan_profile_violation: bool,
    pub milan_cessation_active: bool,
    pub multiple_response_count: u64,
    pub recovery_in_progress: bool,
    pub recovery_attempts: u32,
}

/// Counters kept by the coordinator itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStatistics {
    pub state_transitions: u64,
    pub timeout_events: u64,
    pub fault_events: u64,
    pub recovery_events: u64,
    pub recovery_failures: u64,
    pub clock_jumps_reported: u64,
    pub timestamp_faults: u64,
}

/// Every statistic in one exportable record
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Statistics {
    pub manager: ManagerStatistics,
    pub port: PortStatistics,
    pub bmca: BmcaStatistics,
    pub announce_tx: AnnounceTxStatistics,
    pub announce_rx: AnnounceRxStatistics,
    pub sync_tx: SyncTxStatistics,
    pub sync_rx: SyncRxStatistics,
    pub servo: ServoStatistics,
    pub pdelay_initiator: InitiatorStatistics,
    pub link_delay: LinkDelayStatistics,
    pub pdelay_responder: ResponderStatistics,
    pub hardware_failures: u64,
}
