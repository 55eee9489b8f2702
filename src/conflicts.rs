//! Capacity and single-track conflict detection over one train snapshot.

use crate::network::Network;
use crate::trains::{TrainBundle, active_trains};
use indexmap::IndexMap;
use std::fmt;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Conflict {
    /// More trains occupy the section than it has room for.
    CapacityExceeded {
        section: String,
        capacity: usize,
        current_trains: Vec<String>,
        severity: Severity,
    },
    /// A single-track section is occupied while trains on a predecessor section head into it.
    SingleTrackConflict {
        section: String,
        occupied_by: Vec<String>,
        approaching: Vec<String>,
        severity: Severity,
    },
}

impl Conflict {
    pub fn section(&self) -> &str {
        match self {
            Conflict::CapacityExceeded { section, .. } => section,
            Conflict::SingleTrackConflict { section, .. } => section,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Conflict::CapacityExceeded { severity, .. } => *severity,
            Conflict::SingleTrackConflict { severity, .. } => *severity,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Conflict::CapacityExceeded { .. } => "capacity_exceeded",
            Conflict::SingleTrackConflict { .. } => "single_track_conflict",
        }
    }

    /// True if the train occupies or approaches the conflicted section.
    pub fn involves(&self, train_id: &str) -> bool {
        match self {
            Conflict::CapacityExceeded { current_trains, .. } => {
                current_trains.iter().any(|t| t == train_id)
            }
            Conflict::SingleTrackConflict {
                occupied_by,
                approaching,
                ..
            } => occupied_by
                .iter()
                .chain(approaching.iter())
                .any(|t| t == train_id),
        }
    }
}

/// Occupancy of each section by active trains, in the order sections first appear in the snapshot.
pub fn section_occupancy(trains: &[TrainBundle]) -> IndexMap<&str, Vec<&str>> {
    let mut occupancy: IndexMap<&str, Vec<&str>> = IndexMap::new();

    for bundle in active_trains(trains) {
        if let Some(section_id) = bundle.train.section_id() {
            occupancy.entry(section_id).or_default().push(bundle.id());
        }
    }

    occupancy
}

pub fn analyze(trains: &[TrainBundle], network: &Network) -> Vec<Conflict> {
    let occupancy: Vec<(&str, Vec<&str>, usize)> = section_occupancy(trains)
        .into_iter()
        .map(|(section_id, occupants)| (section_id, occupants, network.capacity(section_id)))
        .collect();
    let mut conflicts = Vec::new();

    for (section_id, occupants, capacity) in &occupancy {
        if occupants.len() > *capacity {
            conflicts.push(Conflict::CapacityExceeded {
                section: section_id.to_string(),
                capacity: *capacity,
                current_trains: occupants.iter().map(|t| t.to_string()).collect(),
                severity: Severity::High,
            });
        }
    }

    for (section_id, occupants, capacity) in &occupancy {
        if *capacity != 1 || occupants.is_empty() {
            continue;
        }

        let approaching: Vec<String> = active_trains(trains)
            .filter(|bundle| !occupants.contains(&bundle.id()))
            .filter(|bundle| {
                bundle
                    .train
                    .section_id()
                    .is_some_and(|current| network.is_successor(current, section_id))
            })
            .map(|bundle| bundle.id().to_string())
            .collect();

        if !approaching.is_empty() {
            conflicts.push(Conflict::SingleTrackConflict {
                section: section_id.to_string(),
                occupied_by: occupants.iter().map(|t| t.to_string()).collect(),
                approaching,
                severity: Severity::Medium,
            });
        }
    }

    conflicts
}
