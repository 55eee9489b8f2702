//! Per-train action plans: the advisor strategy with the deterministic fallbacks behind it.

pub mod ai;
pub mod deterministic;

use crate::cancel::CancelSignal;
use crate::conflicts::Conflict;
use crate::error::AdvisorError;
use crate::network::Network;
use crate::trains::{TrainBundle, active_trains};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

pub use ai::{AdviceRequest, HttpScheduleAdvisor, ScheduleAdvisor};

/// Planning window advertised on every schedule.
pub const HORIZON_S: u32 = 3600;

const HOLD_PREFIX: &str = "hold_until_";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleAction {
    Proceed,
    HoldUntil(DateTime<Utc>),
    Reroute,
}

impl ScheduleAction {
    pub fn is_hold(&self) -> bool {
        matches!(self, ScheduleAction::HoldUntil(_))
    }
}

/// Formats like `2025-01-01T10:00:00.000Z`.
pub fn iso_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl fmt::Display for ScheduleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleAction::Proceed => f.write_str("proceed"),
            ScheduleAction::Reroute => f.write_str("reroute"),
            ScheduleAction::HoldUntil(t) => write!(f, "{}{}", HOLD_PREFIX, iso_timestamp(*t)),
        }
    }
}

fn parse_hold_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }

    // Timestamps without an offset are taken as UTC.
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

impl FromStr for ScheduleAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proceed" => Ok(ScheduleAction::Proceed),
            "reroute" => Ok(ScheduleAction::Reroute),
            _ => match s.strip_prefix(HOLD_PREFIX) {
                Some(raw) => parse_hold_timestamp(raw)
                    .map(ScheduleAction::HoldUntil)
                    .ok_or_else(|| format!("invalid hold timestamp '{}'", raw)),
                None => Err(format!("unknown action '{}'", s)),
            },
        }
    }
}

impl Serialize for ScheduleAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ScheduleAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStrategy {
    Ai,
    Simple,
    ConflictAware,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub target_section: String,
    pub entry_offset_s: i64,
    pub entry_epoch_s: i64,
    pub action: ScheduleAction,
    pub priority: u8,
    pub status: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub now_epoch_s: i64,
    pub horizon_s: u32,
    pub snapshot_trains_considered: usize,
    pub schedule: IndexMap<String, ScheduleEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ScheduleStrategy>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ActionCounts {
    pub proceed: usize,
    pub hold: usize,
    pub reroute: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl ScheduleDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl Schedule {
    pub fn entry(&self, train_id: &str) -> Option<&ScheduleEntry> {
        self.schedule.get(train_id)
    }

    pub fn len(&self) -> usize {
        self.schedule.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedule.is_empty()
    }

    pub fn action_counts(&self) -> ActionCounts {
        self.schedule
            .values()
            .fold(ActionCounts::default(), |mut counts, entry| {
                match entry.action {
                    ScheduleAction::Proceed => counts.proceed += 1,
                    ScheduleAction::HoldUntil(_) => counts.hold += 1,
                    ScheduleAction::Reroute => counts.reroute += 1,
                }
                counts
            })
    }

    /// Trains whose action or target section differs from `previous`.
    pub fn diff(&self, previous: &Schedule) -> ScheduleDiff {
        let mut diff = ScheduleDiff::default();

        for (train_id, entry) in &self.schedule {
            match previous.schedule.get(train_id) {
                None => diff.added.push(train_id.clone()),
                Some(old)
                    if old.action != entry.action || old.target_section != entry.target_section =>
                {
                    diff.changed.push(train_id.clone())
                }
                Some(_) => {}
            }
        }

        diff.removed = previous
            .schedule
            .keys()
            .filter(|train_id| !self.schedule.contains_key(*train_id))
            .cloned()
            .collect();

        diff
    }
}

pub struct Scheduler {
    advisor: Option<Arc<dyn ScheduleAdvisor>>,
    use_ai: AtomicBool,
    model: String,
    advisor_timeout: Duration,
}

impl Scheduler {
    pub fn new(
        advisor: Option<Arc<dyn ScheduleAdvisor>>,
        model: String,
        advisor_timeout: Duration,
    ) -> Self {
        let use_ai = AtomicBool::new(advisor.is_some());
        Self {
            advisor,
            use_ai,
            model,
            advisor_timeout,
        }
    }

    pub fn deterministic_only() -> Self {
        Self::new(None, String::new(), Duration::ZERO)
    }

    pub fn has_advisor(&self) -> bool {
        self.advisor.is_some()
    }

    pub fn ai_enabled(&self) -> bool {
        self.use_ai.load(Ordering::Acquire)
    }

    /// Returns the effective setting; AI stays off without an advisor.
    pub fn set_ai_enabled(&self, enabled: bool) -> bool {
        let effective = enabled && self.advisor.is_some();
        self.use_ai.store(effective, Ordering::Release);
        info!(
            "AI schedule optimization {}",
            if effective { "enabled" } else { "disabled" }
        );
        effective
    }

    /// Always yields a schedule: advisor failures and cancellation fall through to the deterministic strategies.
    pub async fn schedule(
        &self,
        trains: &[TrainBundle],
        conflicts: &[Conflict],
        network: &Network,
        now: DateTime<Utc>,
        cancel: &CancelSignal,
    ) -> Schedule {
        if self.ai_enabled() {
            match self.advise(trains, conflicts, network, now, cancel).await {
                Ok(schedule) => {
                    info!("Generated AI schedule for {} trains", schedule.len());
                    return schedule;
                }
                Err(e) => {
                    warn!("AI schedule optimization failed, falling back: {}", e);
                }
            }
        }

        deterministic::schedule(trains, conflicts, network, now)
    }

    async fn advise(
        &self,
        trains: &[TrainBundle],
        conflicts: &[Conflict],
        network: &Network,
        now: DateTime<Utc>,
        cancel: &CancelSignal,
    ) -> Result<Schedule, AdvisorError> {
        let advisor = self.advisor.as_ref().ok_or(AdvisorError::Unavailable)?;

        let request = AdviceRequest::new(
            ai::build_prompt(trains, conflicts, network, now)?,
            self.model.clone(),
        );

        let call = tokio::time::timeout(self.advisor_timeout, advisor.advise(&request));

        let content = match cancel.run(call).await {
            None => return Err(AdvisorError::Cancelled),
            Some(Err(_elapsed)) => return Err(AdvisorError::Timeout),
            Some(Ok(result)) => result?,
        };

        info!("Advisor response length: {} characters", content.len());

        ai::extract_schedule(&content, now, active_trains(trains).count())
    }
}
