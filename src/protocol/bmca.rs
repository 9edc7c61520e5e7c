//! Best Master Clock Algorithm
//!
//! Datasets from different grandmasters are ordered by
//! (priority1, clockClass, clockAccuracy, offsetScaledLogVariance,
//! priority2, grandmasterIdentity). Datasets describing the same grandmaster
//! are ordered by topology: fewer steps removed wins, then the lower sender
//! port identity.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{Dataset, Error, Result};

/// Outcome of comparing dataset A against dataset B
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonResult {
    ABetter,
    BBetter,
    ABetterByTopology,
    BBetterByTopology,
    /// Both datasets describe the same master through the same port
    SameMaster,
    /// Conflicting claims about the same grandmaster through the same sender
    Error,
}

impl ComparisonResult {
    pub fn a_wins(&self) -> bool {
        matches!(self, ComparisonResult::ABetter | ComparisonResult::ABetterByTopology)
    }

    pub fn b_wins(&self) -> bool {
        matches!(self, ComparisonResult::BBetter | ComparisonResult::BBetterByTopology)
    }
}

/// Port role recommended by the state decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortRole {
    Master,
    Slave,
    Passive,
    Disabled,
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortRole::Master => "MASTER",
            PortRole::Slave => "SLAVE",
            PortRole::Passive => "PASSIVE",
            PortRole::Disabled => "DISABLED",
        };
        f.write_str(name)
    }
}

/// Compares two datasets
pub fn compare_datasets(a: &Dataset, b: &Dataset) -> ComparisonResult {
    if a.grandmaster_identity == b.grandmaster_identity {
        return compare_topology(a, b);
    }

    let key = |d: &Dataset| {
        (
            d.priority1,
            d.grandmaster_quality.clock_class,
            d.grandmaster_quality.clock_accuracy,
            d.grandmaster_quality.offset_scaled_log_variance,
            d.priority2,
            d.grandmaster_identity,
        )
    };
    match key(a).cmp(&key(b)) {
        Ordering::Less => ComparisonResult::ABetter,
        Ordering::Greater => ComparisonResult::BBetter,
        // Identities differ, so the keys cannot be equal
        Ordering::Equal => ComparisonResult::Error,
    }
}

fn compare_topology(a: &Dataset, b: &Dataset) -> ComparisonResult {
    match a.steps_removed.cmp(&b.steps_removed) {
        Ordering::Less => return ComparisonResult::ABetterByTopology,
        Ordering::Greater => return ComparisonResult::BBetterByTopology,
        Ordering::Equal => {}
    }
    match a.sender.cmp(&b.sender) {
        Ordering::Less => ComparisonResult::ABetterByTopology,
        Ordering::Greater => ComparisonResult::BBetterByTopology,
        Ordering::Equal if a == b => ComparisonResult::SameMaster,
        Ordering::Equal => ComparisonResult::Error,
    }
}

/// Result of one state decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmcaDecision {
    /// Role recommended for the evaluating port
    pub role: PortRole,
    /// The winning dataset
    pub best: Dataset,
    /// True when the local clock won
    pub local_is_best: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmcaStatistics {
    pub evaluations: u64,
    pub role_changes: u64,
    pub conflicts: u64,
}

/// Per-port BMCA state decision engine
#[derive(Debug)]
pub struct BmcaEngine {
    port_number: u16,
    last_decision: Option<BmcaDecision>,
    stats: BmcaStatistics,
}

impl BmcaEngine {
    pub fn new(port_number: u16) -> Self {
        BmcaEngine {
            port_number,
            last_decision: None,
            stats: BmcaStatistics::default(),
        }
    }

    /// Runs the state decision over the local dataset and the qualified
    /// foreign datasets
    ///
    /// Foreign datasets received on another port of this clock produce
    /// PASSIVE when they win. The result does not depend on the order of
    /// `foreign`. Conflicting datasets are reported as
    /// [`Error::BmcaConflict`] and leave the previous decision in place.
    pub fn select(&mut self, local: &Dataset, foreign: &[Dataset]) -> Result<BmcaDecision> {
        self.stats.evaluations += 1;

        if let Some((a, b)) = find_conflict(local, foreign) {
            self.stats.conflicts += 1;
            warn!(
                port = self.port_number,
                grandmaster = %a.grandmaster_identity,
                sender = %a.sender,
                "BMCA: conflicting datasets for the same grandmaster"
            );
            return Err(Error::bmca_conflict(format!(
                "grandmaster {} advertised inconsistently via {} (steps removed {} vs {})",
                a.grandmaster_identity, a.sender, a.steps_removed, b.steps_removed
            )));
        }

        let mut best = local;
        for candidate in foreign {
            if compare_datasets(candidate, best).a_wins() {
                best = candidate;
            }
        }

        let local_is_best = best == local
            || compare_datasets(local, best) == ComparisonResult::SameMaster;
        let role = if local_is_best {
            PortRole::Master
        } else if best.receiver_port == self.port_number {
            PortRole::Slave
        } else {
            PortRole::Passive
        };

        let decision = BmcaDecision {
            role,
            best: *best,
            local_is_best,
        };

        let changed = self
            .last_decision
            .map_or(true, |prev| prev.role != role || prev.best.sender != best.sender);
        if changed {
            self.stats.role_changes += 1;
            info!(
                port = self.port_number,
                role = %role,
                grandmaster = %best.grandmaster_identity,
                steps_removed = best.steps_removed,
                "BMCA: recommended role changed"
            );
        } else {
            debug!(port = self.port_number, role = %role, "BMCA: decision unchanged");
        }

        self.last_decision = Some(decision);
        Ok(decision)
    }

    pub fn last_decision(&self) -> Option<BmcaDecision> {
        self.last_decision
    }

    pub fn statistics(&self) -> BmcaStatistics {
        self.stats
    }

    pub fn clear_statistics(&mut self) {
        self.stats = BmcaStatistics::default();
    }

    /// Forgets the previous decision
    pub fn reset(&mut self) {
        self.last_decision = None;
    }
}

/// Finds any pair of candidates that compare as [`ComparisonResult::Error`]
fn find_conflict<'a>(
    local: &'a Dataset,
    foreign: &'a [Dataset],
) -> Option<(&'a Dataset, &'a Dataset)> {
    let candidates = std::iter::once(local).chain(foreign.iter());
    for (i, a) in candidates.clone().enumerate() {
        for b in candidates.clone().skip(i + 1) {
            if compare_datasets(a, b) == ComparisonResult::Error {
                return Some((a, b));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ClockIdentity, ClockQuality, PortIdentity};
    use rand::seq::SliceRandom;

    fn local() -> Dataset {
        Dataset::local(
            PortIdentity::new(ClockIdentity([0x10; 8]), 1),
            ClockQuality::default(),
            128,
            248,
        )
    }

    fn foreign(gm: u8, priority1: u8, steps_removed: u16, sender: u8) -> Dataset {
        Dataset {
            grandmaster_identity: ClockIdentity([gm; 8]),
            grandmaster_quality: ClockQuality::default(),
            priority1,
            priority2: 248,
            steps_removed,
            sender: PortIdentity::new(ClockIdentity([sender; 8]), 1),
            receiver_port: 1,
        }
    }

    #[test]
    fn test_priority_order() {
        let a = foreign(0x20, 100, 0, 0x20);
        let b = foreign(0x05, 128, 0, 0x05);
        assert_eq!(compare_datasets(&a, &b), ComparisonResult::ABetter);
        assert_eq!(compare_datasets(&b, &a), ComparisonResult::BBetter);

        // Equal priority1: clock class decides before identity
        let mut c = foreign(0x30, 128, 0, 0x30);
        c.grandmaster_quality.clock_class = 6;
        assert_eq!(compare_datasets(&c, &b), ComparisonResult::ABetter);

        // Everything equal except identity
        let d = foreign(0x04, 128, 0, 0x04);
        assert_eq!(compare_datasets(&d, &b), ComparisonResult::ABetter);
    }

    #[test]
    fn test_topology_order() {
        let near = foreign(0x20, 100, 1, 0x30);
        let far = foreign(0x20, 100, 2, 0x01);
        assert_eq!(compare_datasets(&near, &far), ComparisonResult::ABetterByTopology);
        assert_eq!(compare_datasets(&far, &near), ComparisonResult::BBetterByTopology);

        let via_low = foreign(0x20, 100, 1, 0x01);
        assert_eq!(
            compare_datasets(&via_low, &near),
            ComparisonResult::ABetterByTopology
        );
        assert_eq!(compare_datasets(&near, &near), ComparisonResult::SameMaster);
    }

    #[test]
    fn test_conflict_detected() {
        let a = foreign(0x20, 100, 1, 0x30);
        let mut b = a;
        b.priority1 = 50;
        assert_eq!(compare_datasets(&a, &b), ComparisonResult::Error);

        let mut engine = BmcaEngine::new(1);
        let result = engine.select(&local(), &[a, b]);
        assert!(matches!(result, Err(Error::BmcaConflict(_))));
        assert_eq!(engine.statistics().conflicts, 1);
        assert!(engine.last_decision().is_none());
    }

    #[test]
    fn test_local_master_when_alone() {
        let mut engine = BmcaEngine::new(1);
        let decision = engine.select(&local(), &[]).unwrap();
        assert_eq!(decision.role, PortRole::Master);
        assert!(decision.local_is_best);
    }

    #[test]
    fn test_better_foreign_gives_slave() {
        let mut engine = BmcaEngine::new(1);
        let better = foreign(0x20, 100, 0, 0x20);
        let decision = engine.select(&local(), &[better]).unwrap();
        assert_eq!(decision.role, PortRole::Slave);
        assert_eq!(decision.best, better);
        assert!(!decision.local_is_best);

        let worse = foreign(0x21, 200, 0, 0x21);
        let decision = engine.select(&local(), &[worse]).unwrap();
        assert_eq!(decision.role, PortRole::Master);
    }

    #[test]
    fn test_better_on_other_port_gives_passive() {
        let mut engine = BmcaEngine::new(1);
        let mut other_port = foreign(0x20, 100, 0, 0x20);
        other_port.receiver_port = 2;
        let decision = engine.select(&local(), &[other_port]).unwrap();
        assert_eq!(decision.role, PortRole::Passive);
    }

    #[test]
    fn test_selection_is_order_independent() {
        let mut candidates = Vec::new();
        for i in 0..12u8 {
            // A grandmaster advertises the same priority through every path
            let gm = i % 4;
            candidates.push(foreign(0x40 + gm, 90 + (gm * 7) % 5, (i % 3) as u16, 0x80 + i));
        }

        let mut engine = BmcaEngine::new(1);
        let expected = engine.select(&local(), &candidates).unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            candidates.shuffle(&mut rng);
            let decision = engine.select(&local(), &candidates).unwrap();
            assert_eq!(decision.best, expected.best);
            assert_eq!(decision.role, expected.role);
        }
    }
}
