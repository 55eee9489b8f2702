use super::{HORIZON_S, Schedule, ScheduleAction, ScheduleEntry, ScheduleStrategy};
use crate::conflicts::Conflict;
use crate::network::Network;
use crate::trains::{TrainBundle, active_trains};
use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use tracing::{debug, info};

/// Spacing between consecutive departures in the simple plan.
const SIMPLE_SPACING_S: i64 = 30;
const BASE_HOLD_S: i64 = 60;
const PRIORITY_PENALTY_S: i64 = 30;
const SEQUENCE_PENALTY_S: i64 = 15;
/// Time a section stays booked after a train enters it.
const SECTION_DWELL_S: i64 = 30;
/// Priority at or above which a conflicted train pays no priority penalty.
const TOP_PRIORITY: i64 = 5;
/// Largest snapshot still handled by the simple plan when there are no conflicts.
const SIMPLE_MAX_TRAINS: usize = 3;

pub fn schedule(
    trains: &[TrainBundle],
    conflicts: &[Conflict],
    network: &Network,
    now: DateTime<Utc>,
) -> Schedule {
    let active = active_trains(trains).count();

    if conflicts.is_empty() && active <= SIMPLE_MAX_TRAINS {
        info!("Using simple schedule for {} trains", active);
        simple_schedule(trains, network, now)
    } else {
        info!(
            "Using conflict-aware schedule for {} trains, {} conflicts",
            active,
            conflicts.len()
        );
        conflict_aware_schedule(trains, conflicts, network, now)
    }
}

fn target_section<'a>(bundle: &'a TrainBundle, network: &'a Network) -> &'a str {
    bundle
        .train
        .section_id()
        .unwrap_or_else(|| network.entry_section())
}

/// Highest priority first, each train `30 * rank` seconds after the previous.
pub fn simple_schedule(trains: &[TrainBundle], network: &Network, now: DateTime<Utc>) -> Schedule {
    let now_epoch_s = now.timestamp();

    let mut sorted: Vec<&TrainBundle> = active_trains(trains).collect();
    sorted.sort_by_key(|b| std::cmp::Reverse(b.train.effective_priority()));

    let schedule: IndexMap<String, ScheduleEntry> = sorted
        .iter()
        .enumerate()
        .map(|(rank, bundle)| {
            let offset = rank as i64 * SIMPLE_SPACING_S;
            (
                bundle.id().to_string(),
                ScheduleEntry {
                    target_section: target_section(bundle, network).to_string(),
                    entry_offset_s: offset,
                    entry_epoch_s: now_epoch_s + offset,
                    action: ScheduleAction::Proceed,
                    priority: bundle.train.effective_priority(),
                    status: bundle.train.status.to_string(),
                },
            )
        })
        .collect();

    Schedule {
        now_epoch_s,
        horizon_s: HORIZON_S,
        snapshot_trains_considered: sorted.len(),
        schedule,
        strategy: Some(ScheduleStrategy::Simple),
    }
}

/// `60 + max(0, 5 - priority) * 30 + rank * 15` seconds.
pub fn hold_delay_s(priority: u8, rank: usize) -> i64 {
    let priority_gap = (TOP_PRIORITY - i64::from(priority)).max(0);
    BASE_HOLD_S + priority_gap * PRIORITY_PENALTY_S + rank as i64 * SEQUENCE_PENALTY_S
}

/// Ranks trains by priority then status and holds every train named in a conflict.
pub fn conflict_aware_schedule(
    trains: &[TrainBundle],
    conflicts: &[Conflict],
    network: &Network,
    now: DateTime<Utc>,
) -> Schedule {
    let now_epoch_s = now.timestamp();

    let mut sorted: Vec<&TrainBundle> = active_trains(trains).collect();
    sorted.sort_by(|a, b| {
        b.train
            .effective_priority()
            .cmp(&a.train.effective_priority())
            .then_with(|| {
                a.train
                    .status
                    .sequencing_rank()
                    .cmp(&b.train.status.sequencing_rank())
            })
    });

    let mut section_occupancy: AHashMap<&str, Vec<&str>> = AHashMap::new();
    let mut section_free_at: AHashMap<&str, i64> = AHashMap::new();
    let mut schedule: IndexMap<String, ScheduleEntry> = IndexMap::with_capacity(sorted.len());

    for (rank, bundle) in sorted.iter().enumerate() {
        let train = &bundle.train;
        let section = target_section(bundle, network);
        let priority = train.effective_priority();

        let conflict = conflicts.iter().find(|c| c.involves(&train.train_id));

        let (action, entry_epoch_s) = match conflict {
            Some(conflict) => {
                let delay = hold_delay_s(priority, rank);
                let entry_epoch_s = now_epoch_s + delay;
                info!(
                    "Train {} held {}s due to {} at {}",
                    train.train_id,
                    delay,
                    conflict.kind(),
                    conflict.section()
                );
                (
                    ScheduleAction::HoldUntil(now + Duration::seconds(delay)),
                    entry_epoch_s,
                )
            }
            None => (ScheduleAction::Proceed, now_epoch_s),
        };

        section_occupancy.entry(section).or_default().push(bundle.id());
        let free_at = section_free_at.entry(section).or_insert(now_epoch_s);
        *free_at = (*free_at).max(entry_epoch_s + SECTION_DWELL_S);

        schedule.insert(
            train.train_id.clone(),
            ScheduleEntry {
                target_section: section.to_string(),
                entry_offset_s: entry_epoch_s - now_epoch_s,
                entry_epoch_s,
                action,
                priority,
                status: if conflict.is_some() {
                    "Conflict resolved".to_string()
                } else {
                    "Optimized".to_string()
                },
            },
        );
    }

    for (section, occupants) in &section_occupancy {
        debug!(
            "Section {} booked by {:?}, free at epoch {}",
            section,
            occupants,
            section_free_at.get(section).copied().unwrap_or(now_epoch_s)
        );
    }

    Schedule {
        now_epoch_s,
        horizon_s: HORIZON_S,
        snapshot_trains_considered: sorted.len(),
        schedule,
        strategy: Some(ScheduleStrategy::ConflictAware),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflicts::{Severity, analyze};
    use crate::trains::TrainStatus;
    use crate::trains::fixtures::{running, train};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap()
    }

    #[test]
    fn simple_plan_spaces_by_priority() {
        let network = Network::corridor();
        let trains = vec![
            running("P5", "SEC_1", 5),
            running("P2", "SEC_3", 2),
            running("P3", "SEC_5", 3),
        ];

        let schedule = schedule(&trains, &[], &network, now());

        assert_eq!(schedule.strategy, Some(ScheduleStrategy::Simple));
        assert_eq!(schedule.entry("P5").unwrap().entry_offset_s, 0);
        assert_eq!(schedule.entry("P3").unwrap().entry_offset_s, 30);
        assert_eq!(schedule.entry("P2").unwrap().entry_offset_s, 60);
        assert_eq!(
            schedule.entry("P2").unwrap().entry_epoch_s,
            now().timestamp() + 60
        );
        assert_eq!(schedule.entry("P3").unwrap().target_section, "SEC_5");
        assert_eq!(schedule.entry("P3").unwrap().status, "Running");
        assert!(
            schedule
                .schedule
                .values()
                .all(|e| e.action == ScheduleAction::Proceed)
        );
        assert_eq!(schedule.horizon_s, 3600);
        assert_eq!(schedule.now_epoch_s, now().timestamp());
    }

    #[test]
    fn conflicted_train_delay_formula() {
        let network = Network::corridor();
        let trains = vec![
            running("HIGH", "SEC_5", 5),
            running("MID", "SEC_3", 3),
            running("LOW", "SEC_1", 1),
        ];
        let conflicts = vec![Conflict::CapacityExceeded {
            section: "SEC_1".to_string(),
            capacity: 2,
            current_trains: vec!["LOW".to_string()],
            severity: Severity::High,
        }];

        let schedule = schedule(&trains, &conflicts, &network, now());

        assert_eq!(schedule.strategy, Some(ScheduleStrategy::ConflictAware));
        let low = schedule.entry("LOW").unwrap();
        assert_eq!(low.entry_offset_s, 210);
        assert_eq!(low.entry_epoch_s, now().timestamp() + 210);
        assert_eq!(low.action.to_string(), "hold_until_2025-03-14T09:03:30.000Z");
        assert_eq!(low.status, "Conflict resolved");

        let high = schedule.entry("HIGH").unwrap();
        assert_eq!(high.action, ScheduleAction::Proceed);
        assert_eq!(high.entry_offset_s, 0);
        assert_eq!(high.status, "Optimized");
    }

    #[test]
    fn hold_delay_matches_rules() {
        assert_eq!(hold_delay_s(1, 2), 210);
        assert_eq!(hold_delay_s(5, 0), 60);
        assert_eq!(hold_delay_s(9, 1), 75);
        assert_eq!(hold_delay_s(3, 4), 180);
    }

    #[test]
    fn status_breaks_priority_ties() {
        let network = Network::corridor();
        let trains = vec![
            train("BOARD", "SEC_1", 3, TrainStatus::Boarding),
            train("STOP", "SEC_3", 3, TrainStatus::Stopped),
            train("LATE", "SEC_5", 3, TrainStatus::Delayed),
            train("RUN", "SEC_5", 3, TrainStatus::Running),
        ];

        let schedule = conflict_aware_schedule(&trains, &[], &network, now());

        assert_eq!(
            schedule.schedule.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["RUN", "LATE", "STOP", "BOARD"]
        );
    }

    #[test]
    fn every_active_train_gets_exactly_one_entry() {
        let network = Network::corridor();
        let trains = vec![
            running("T1", "SEC_2", 3),
            running("T2", "SEC_2", 5),
            running("T3", "SEC_1", 2),
            train("T4", "SEC_4", 3, TrainStatus::Arrived),
            train("T5", "SEC_4", 3, TrainStatus::Cancelled),
            running("T6", "SEC_5", 1),
        ];
        let conflicts = analyze(&trains, &network);
        assert!(!conflicts.is_empty());

        let schedule = schedule(&trains, &conflicts, &network, now());

        assert_eq!(schedule.len(), 4);
        assert_eq!(schedule.snapshot_trains_considered, 4);
        assert!(schedule.entry("T4").is_none());
        assert!(schedule.entry("T5").is_none());
        assert!(schedule.entry("T1").unwrap().action.is_hold());
        assert!(schedule.entry("T3").unwrap().action.is_hold());
        assert_eq!(schedule.entry("T6").unwrap().action, ScheduleAction::Proceed);
    }

    #[test]
    fn many_trains_without_conflicts_use_conflict_aware_plan() {
        let network = Network::corridor();
        let trains = vec![
            running("T1", "SEC_1", 3),
            running("T2", "SEC_3", 3),
            running("T3", "SEC_5", 3),
            running("T4", "SEC_5", 3),
        ];

        let schedule = schedule(&trains, &[], &network, now());

        assert_eq!(schedule.strategy, Some(ScheduleStrategy::ConflictAware));
        assert!(
            schedule
                .schedule
                .values()
                .all(|e| e.action == ScheduleAction::Proceed && e.entry_offset_s == 0)
        );
    }

    #[test]
    fn train_without_location_targets_entry_section() {
        let network = Network::corridor();
        let mut lost = running("LOST", "SEC_3", 3);
        lost.train.current_location = None;

        let schedule = simple_schedule(&[lost], &network, now());

        assert_eq!(schedule.entry("LOST").unwrap().target_section, "SEC_1");
    }
}
