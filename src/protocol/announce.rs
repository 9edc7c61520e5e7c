//! Announce transmission and reception
//!
//! The receiver owns the foreign master table. BMCA only ever reads a
//! snapshot of it, taken once per tick after a batch of Announces.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::message::{AnnounceMessage, Header, ANNOUNCE_LENGTH};
use super::transport::MessageTransmitter;
use crate::core::{ClockIdentity, ClockQuality, Config, Dataset, PortIdentity};

/// Grandmaster information advertised by a master port
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MasterInfo {
    pub grandmaster_identity: ClockIdentity,
    pub grandmaster_quality: ClockQuality,
    pub priority1: u8,
    pub priority2: u8,
    pub steps_removed: u16,
    pub current_utc_offset: i16,
    pub time_source: u8,
}

impl MasterInfo {
    /// Advertisement for a port whose best dataset is `best`
    pub fn from_dataset(best: &Dataset, local_is_best: bool) -> Self {
        MasterInfo {
            grandmaster_identity: best.grandmaster_identity,
            grandmaster_quality: best.grandmaster_quality,
            priority1: best.priority1,
            priority2: best.priority2,
            steps_removed: if local_is_best {
                0
            } else {
                best.steps_removed.saturating_add(1)
            },
            current_utc_offset: 37,
            time_source: super::message::time_source::INTERNAL_OSCILLATOR,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceTxStatistics {
    pub announces_sent: u64,
    pub transmit_failures: u64,
}

/// Periodic Announce transmission for master ports
pub struct AnnounceTransmitter {
    port_identity: PortIdentity,
    domain_number: u8,
    interval: Duration,
    pending_interval: Option<Duration>,
    master_info: MasterInfo,
    transmitter: Arc<dyn MessageTransmitter>,
    enabled: bool,
    next_due: Option<Instant>,
    sequence_id: u16,
    stats: AnnounceTxStatistics,
}

impl AnnounceTransmitter {
    pub fn new(config: &Config, transmitter: Arc<dyn MessageTransmitter>) -> Self {
        let port_identity = config.port_identity();
        let local = Dataset::local(
            port_identity,
            config.clock_quality,
            config.priority1,
            config.priority2,
        );
        AnnounceTransmitter {
            port_identity,
            domain_number: config.domain_number,
            interval: config.announce_interval,
            pending_interval: None,
            master_info: MasterInfo::from_dataset(&local, true),
            transmitter,
            enabled: false,
            next_due: None,
            sequence_id: 0,
            stats: AnnounceTxStatistics::default(),
        }
    }

    /// Starts transmitting; the first Announce goes out on the next tick
    pub fn enable(&mut self, now: Instant) {
        if !self.enabled {
            debug!(port = %self.port_identity, "Announce transmission enabled");
            self.enabled = true;
            self.next_due = Some(now);
        }
    }

    pub fn disable(&mut self) {
        if self.enabled {
            debug!(port = %self.port_identity, "Announce transmission disabled");
        }
        self.enabled = false;
        self.next_due = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Changes the interval starting with the next cycle
    pub fn set_interval(&mut self, interval: Duration) {
        self.pending_interval = Some(interval);
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn update_master_info(&mut self, info: MasterInfo) {
        self.master_info = info;
    }

    pub fn master_info(&self) -> MasterInfo {
        self.master_info
    }

    pub fn tick(&mut self, now: Instant) {
        let due = match self.next_due {
            Some(due) if self.enabled && now >= due => due,
            _ => return,
        };
        trace!(port = %self.port_identity, lateness = ?now.duration_since(due), "Announce due");

        self.sequence_id = self.sequence_id.wrapping_add(1);
        let mut header = Header::new(self.port_identity, self.sequence_id, ANNOUNCE_LENGTH);
        header.domain_number = self.domain_number;
        header.log_message_interval = crate::util::duration_to_log_interval(self.interval);

        let msg = AnnounceMessage {
            header,
            current_utc_offset: self.master_info.current_utc_offset,
            priority1: self.master_info.priority1,
            grandmaster_clock_quality: self.master_info.grandmaster_quality,
            priority2: self.master_info.priority2,
            grandmaster_identity: self.master_info.grandmaster_identity,
            steps_removed: self.master_info.steps_removed,
            time_source: self.master_info.time_source,
        };

        if self.transmitter.send_announce(&msg) {
            self.stats.announces_sent += 1;
        } else {
            self.stats.transmit_failures += 1;
            warn!(port = %self.port_identity, seq = self.sequence_id, "Announce transmit failed");
        }

        if let Some(interval) = self.pending_interval.take() {
            self.interval = interval;
        }
        self.next_due = Some(now + self.interval);
    }

    pub fn statistics(&self) -> AnnounceTxStatistics {
        self.stats
    }

    pub fn clear_statistics(&mut self) {
        self.stats = AnnounceTxStatistics::default();
    }
}

/// A candidate master learned from Announce messages
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForeignMasterInfo {
    pub dataset: Dataset,
    /// Announces received since the entry was created
    pub announce_count: u32,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub qualified: bool,
}

/// Why an Announce was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Disabled,
    WrongDomain,
    StepsRemovedExceeded,
    ZeroGrandmaster,
    ZeroSender,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceRxStatistics {
    pub announces_received: u64,
    pub announces_validated: u64,
    pub announces_rejected: u64,
    pub foreign_masters_discovered: u64,
    pub foreign_masters_qualified: u64,
    pub foreign_masters_expired: u64,
    pub foreign_masters_evicted: u64,
    pub receipt_timeouts: u64,
}

/// What happened during one receiver tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceTick {
    /// The table changed since the last tick; BMCA should run
    pub reevaluate: bool,
    /// No valid Announce from anyone within the receipt window
    pub receipt_timeout: bool,
    pub expired: usize,
}

/// Announce reception and foreign master tracking
pub struct AnnounceReceiver {
    port_number: u16,
    domain_number: u8,
    max_steps_removed: u16,
    qualification_threshold: u32,
    capacity: usize,
    receipt_window: Duration,
    table: Vec<ForeignMasterInfo>,
    enabled: bool,
    receipt_deadline: Option<Instant>,
    dirty: bool,
    stats: AnnounceRxStatistics,
}

impl AnnounceReceiver {
    pub fn new(config: &Config) -> Self {
        AnnounceReceiver {
            port_number: config.port_number,
            domain_number: config.domain_number,
            max_steps_removed: config.max_steps_removed,
            qualification_threshold: config.foreign_master_threshold,
            capacity: config.max_foreign_masters,
            receipt_window: config.announce_receipt_window(),
            table: Vec::with_capacity(config.max_foreign_masters),
            enabled: false,
            receipt_deadline: None,
            dirty: false,
            stats: AnnounceRxStatistics::default(),
        }
    }

    /// Starts reception; the receipt window opens now
    pub fn start(&mut self, now: Instant) {
        self.enabled = true;
        self.receipt_deadline = Some(now + self.receipt_window);
    }

    pub fn stop(&mut self) {
        self.enabled = false;
        self.receipt_deadline = None;
    }

    /// Drops every foreign master without touching statistics
    pub fn reset(&mut self) {
        self.stop();
        self.table.clear();
        self.dirty = false;
    }

    /// Validates an Announce and records its sender
    pub fn process_announce(
        &mut self,
        msg: &AnnounceMessage,
        now: Instant,
    ) -> std::result::Result<(), RejectReason> {
        self.stats.announces_received += 1;
        if let Err(reason) = self.validate(msg) {
            self.stats.announces_rejected += 1;
            debug!(
                port = self.port_number,
                sender = %msg.header.source_port_identity,
                ?reason,
                "Announce rejected"
            );
            return Err(reason);
        }
        self.stats.announces_validated += 1;

        let dataset = msg.dataset(self.port_number);
        let sender = dataset.sender;
        match self.table.iter_mut().find(|e| e.dataset.sender == sender) {
            Some(entry) => {
                entry.dataset = dataset;
                entry.announce_count = entry.announce_count.saturating_add(1);
                entry.last_seen = now;
                if !entry.qualified && entry.announce_count >= self.qualification_threshold {
                    entry.qualified = true;
                    self.stats.foreign_masters_qualified += 1;
                    debug!(port = self.port_number, %sender, "Foreign master qualified");
                }
            }
            None => {
                if self.table.len() >= self.capacity {
                    self.evict_oldest();
                }
                let qualified = self.qualification_threshold <= 1;
                self.table.push(ForeignMasterInfo {
                    dataset,
                    announce_count: 1,
                    first_seen: now,
                    last_seen: now,
                    qualified,
                });
                self.stats.foreign_masters_discovered += 1;
                if qualified {
                    self.stats.foreign_masters_qualified += 1;
                }
                info!(
                    port = self.port_number,
                    %sender,
                    grandmaster = %dataset.grandmaster_identity,
                    "New foreign master"
                );
            }
        }

        self.receipt_deadline = Some(now + self.receipt_window);
        self.dirty = true;
        Ok(())
    }

    fn validate(&self, msg: &AnnounceMessage) -> std::result::Result<(), RejectReason> {
        if !self.enabled {
            return Err(RejectReason::Disabled);
        }
        if msg.header.domain_number != self.domain_number {
            return Err(RejectReason::WrongDomain);
        }
        if msg.steps_removed > self.max_steps_removed {
            return Err(RejectReason::StepsRemovedExceeded);
        }
        if msg.grandmaster_identity.is_zero() {
            return Err(RejectReason::ZeroGrandmaster);
        }
        if msg.header.source_port_identity.clock_identity.is_zero() {
            return Err(RejectReason::ZeroSender);
        }
        Ok(())
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .table
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(i, _)| i);
        if let Some(index) = oldest {
            let evicted = self.table.swap_remove(index);
            self.stats.foreign_masters_evicted += 1;
            warn!(
                port = self.port_number,
                sender = %evicted.dataset.sender,
                "Foreign master table full, evicted oldest entry"
            );
        }
    }

    /// Ages out silent foreign masters and reports batch and timeout events
    ///
    /// An entry expires once `now - last_seen` reaches the receipt window.
    /// The receipt timeout fires only when the table is empty.
    pub fn tick(&mut self, now: Instant) -> AnnounceTick {
        let mut outcome = AnnounceTick::default();
        if !self.enabled {
            return outcome;
        }

        let window = self.receipt_window;
        let before = self.table.len();
        let port_number = self.port_number;
        self.table.retain(|entry| {
            let alive = now.duration_since(entry.last_seen) < window;
            if !alive {
                info!(port = port_number, sender = %entry.dataset.sender, "Foreign master expired");
            }
            alive
        });
        outcome.expired = before - self.table.len();
        self.stats.foreign_masters_expired += outcome.expired as u64;

        outcome.reevaluate = self.dirty || outcome.expired > 0;
        self.dirty = false;

        if self.table.is_empty() {
            if let Some(deadline) = self.receipt_deadline {
                if now >= deadline {
                    self.stats.receipt_timeouts += 1;
                    outcome.receipt_timeout = true;
                    self.receipt_deadline = Some(now + window);
                    warn!(port = self.port_number, "Announce receipt timeout");
                }
            }
        }

        outcome
    }

    /// Copies the qualified datasets into `out`, replacing its contents
    pub fn snapshot_into(&self, out: &mut Vec<Dataset>) {
        out.clear();
        out.extend(self.table.iter().filter(|e| e.qualified).map(|e| e.dataset));
    }

    pub fn foreign_masters(&self) -> &[ForeignMasterInfo] {
        &self.table
    }

    pub fn active_foreign_masters(&self) -> usize {
        self.table.len()
    }

    pub fn statistics(&self) -> AnnounceRxStatistics {
        self.stats
    }

    pub fn clear_statistics(&mut self) {
        self.stats = AnnounceRxStatistics::default();
    }
}
