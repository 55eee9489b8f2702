use super::{HORIZON_S, Schedule, ScheduleAction, ScheduleEntry, ScheduleStrategy, iso_timestamp};
use crate::conflicts::Conflict;
use crate::error::AdvisorError;
use crate::network::Network;
use crate::trains::{TrainBundle, active_trains};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";

/// Body of `POST /api/groq-optimization`.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AdviceRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl AdviceRequest {
    pub fn new(prompt: String, model: String) -> Self {
        Self {
            prompt,
            model,
            temperature: 0.1,
            max_tokens: 2048,
            top_p: 0.9,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AdviceResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Text-generation backend asked for a schedule. Returns the raw generated text.
pub trait ScheduleAdvisor: Send + Sync {
    fn advise<'a>(&'a self, request: &'a AdviceRequest) -> BoxFuture<'a, Result<String, AdvisorError>>;
}

pub struct HttpScheduleAdvisor {
    client: reqwest::Client,
    endpoint: String,
    credential: String,
    timeout: Duration,
}

impl HttpScheduleAdvisor {
    pub fn new(client: reqwest::Client, base_url: &str, credential: String, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: format!("{}/api/groq-optimization", base_url.trim_end_matches('/')),
            credential,
            timeout,
        }
    }
}

impl ScheduleAdvisor for HttpScheduleAdvisor {
    fn advise<'a>(&'a self, request: &'a AdviceRequest) -> BoxFuture<'a, Result<String, AdvisorError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.credential)
                .timeout(self.timeout)
                .json(request)
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(AdvisorError::Status(response.status()));
            }

            let bytes = response.bytes().await?;
            let body: AdviceResponse =
                serde_json::from_slice(&bytes).map_err(AdvisorError::InvalidSchedule)?;

            Ok(body.content.unwrap_or_default().trim().to_string())
        })
    }
}

pub fn build_prompt(
    trains: &[TrainBundle],
    conflicts: &[Conflict],
    network: &Network,
    now: DateTime<Utc>,
) -> Result<String, AdvisorError> {
    let mut prompt = String::new();
    write_prompt(&mut prompt, trains, conflicts, network, now)?;
    Ok(prompt)
}

fn write_prompt(
    out: &mut impl Write,
    trains: &[TrainBundle],
    conflicts: &[Conflict],
    network: &Network,
    now: DateTime<Utc>,
) -> fmt::Result {
    let now_epoch_s = now.timestamp();
    let active: Vec<&TrainBundle> = active_trains(trains).collect();

    writeln!(
        out,
        "You are an expert railway traffic controller. Your task is to optimize train scheduling to minimize delays and conflicts."
    )?;
    writeln!(out)?;
    writeln!(out, "CURRENT SITUATION:")?;
    writeln!(out, "- Current time: {}", iso_timestamp(now))?;
    writeln!(out, "- Current epoch: {}", now_epoch_s)?;
    writeln!(out, "- Total active trains: {}", active.len())?;
    writeln!(out)?;
    writeln!(out, "RAILWAY NETWORK:")?;
    for section in network.sections() {
        writeln!(out, "- {}", section.describe())?;
    }
    writeln!(out)?;
    writeln!(out, "CURRENT TRAINS:")?;
    for bundle in &active {
        let train = &bundle.train;
        write!(
            out,
            "- {}: {} (Priority: {}) at {} position {}m, Status: {}, Destination: {}, Max Speed: {}km/h",
            train.train_id,
            train.category.as_str(),
            train.effective_priority(),
            train.section_id().unwrap_or("Unknown"),
            train.position_m(),
            train.status,
            train.destination_station.as_deref().unwrap_or("Unknown"),
            train.max_speed_kmh,
        )?;
        if train.restricted_speed {
            write!(out, ", Speed restricted")?;
        }
        if let Some(until) = &train.breakdown_until {
            write!(out, ", Broken down until {}", until)?;
        }
        writeln!(out)?;
    }

    if !conflicts.is_empty() {
        writeln!(out)?;
        writeln!(out, "IDENTIFIED CONFLICTS:")?;
        for conflict in conflicts {
            let detail = serde_json::to_string(conflict).unwrap_or_default();
            writeln!(out, "- {} at {}: {}", conflict.kind(), conflict.section(), detail)?;
        }
    }

    let single_track = network
        .single_track_sections()
        .map(|s| s.section_id.as_str())
        .join(", ");
    let bypass = network
        .sections()
        .filter(|s| s.bypass)
        .map(|s| s.section_id.as_str())
        .join(", ");

    writeln!(out)?;
    writeln!(out, "OPTIMIZATION OBJECTIVES:")?;
    writeln!(out, "1. Prioritize high-priority trains (Express=5, Local=3, Freight=2)")?;
    writeln!(out, "2. Minimize total delay time")?;
    writeln!(out, "3. Avoid conflicts in single-track sections ({})", single_track)?;
    writeln!(out, "4. Optimize capacity utilization")?;
    writeln!(out, "5. Consider train speeds and journey times")?;
    writeln!(out)?;
    writeln!(out, "CONSTRAINTS:")?;
    writeln!(out, "- Single-track sections can only handle one train at a time")?;
    writeln!(out, "- Trains cannot reverse direction")?;
    writeln!(out, "- Higher priority trains should be scheduled first")?;
    writeln!(out, "- Safety margins must be maintained")?;
    writeln!(out)?;
    writeln!(out, "Please generate an optimized schedule in the following JSON format:")?;
    writeln!(
        out,
        r#"{{
  "now_epoch_s": {now_epoch_s},
  "horizon_s": {HORIZON_S},
  "snapshot_trains_considered": {count},
  "schedule": {{
    "TRAIN_ID": {{
      "target_section": "SEC_X",
      "entry_offset_s": 0,
      "entry_epoch_s": {now_epoch_s},
      "action": "proceed|hold_until_YYYY-MM-DDTHH:MM:SS|reroute",
      "priority": 1-5,
      "status": "On time|Delayed|Waiting"
    }}
  }}
}}"#,
        count = active.len(),
    )?;
    writeln!(out)?;
    writeln!(out, "Consider these actions:")?;
    writeln!(out, "- \"proceed\": Allow immediate movement")?;
    writeln!(out, "- \"hold_until_TIMESTAMP\": Hold train until specified time")?;
    if bypass.is_empty() {
        writeln!(out, "- \"reroute\": Use an alternative path")?;
    } else {
        writeln!(out, "- \"reroute\": Use alternative path ({} as bypass)", bypass)?;
    }
    writeln!(out)?;
    writeln!(
        out,
        "Focus on the most critical trains first. Provide only the JSON response without additional explanation."
    )
}

#[derive(Debug, Deserialize)]
struct AdvisedEntry {
    target_section: String,
    #[serde(default)]
    entry_offset_s: Option<i64>,
    #[serde(default)]
    entry_epoch_s: Option<i64>,
    action: ScheduleAction,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdvisedSchedule {
    #[serde(default)]
    now_epoch_s: Option<i64>,
    #[serde(default)]
    horizon_s: Option<u32>,
    #[serde(default)]
    snapshot_trains_considered: Option<usize>,
    schedule: IndexMap<String, AdvisedEntry>,
}

/// The text between the first `{` and the last `}`.
pub fn brace_span(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

/// Parses the whole reply as JSON first, then the brace span inside any surrounding prose.
/// Prose containing stray braces can still fail here, which sends the cycle to the deterministic plan.
pub fn extract_schedule(
    content: &str,
    now: DateTime<Utc>,
    active_count: usize,
) -> Result<Schedule, AdvisorError> {
    let advised = match serde_json::from_str::<AdvisedSchedule>(content.trim()) {
        Ok(advised) => advised,
        Err(strict_error) => {
            debug!("strict parse of advisor reply failed: {}", strict_error);
            let span = brace_span(content).ok_or(AdvisorError::NoJsonObject)?;
            serde_json::from_str::<AdvisedSchedule>(span).map_err(AdvisorError::InvalidSchedule)?
        }
    };

    let now_epoch_s = advised.now_epoch_s.unwrap_or_else(|| now.timestamp());

    let schedule = advised
        .schedule
        .into_iter()
        .map(|(train_id, entry)| {
            let entry_offset_s = entry
                .entry_offset_s
                .or_else(|| entry.entry_epoch_s.map(|epoch| epoch - now_epoch_s))
                .unwrap_or(0);
            let entry_epoch_s = entry.entry_epoch_s.unwrap_or(now_epoch_s + entry_offset_s);

            (
                train_id,
                ScheduleEntry {
                    target_section: entry.target_section,
                    entry_offset_s,
                    entry_epoch_s,
                    action: entry.action,
                    priority: entry.priority.unwrap_or(1),
                    status: entry.status.unwrap_or_else(|| "Scheduled".to_string()),
                },
            )
        })
        .collect();

    Ok(Schedule {
        now_epoch_s,
        horizon_s: advised.horizon_s.unwrap_or(HORIZON_S),
        snapshot_trains_considered: advised.snapshot_trains_considered.unwrap_or(active_count),
        schedule,
        strategy: Some(ScheduleStrategy::Ai),
    })
}
