//! Train snapshot records as served by the train data endpoint.

use std::fmt;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TrainStatus {
    Running,
    Delayed,
    Stopped,
    Boarding,
    #[serde(rename = "On time")]
    OnTime,
    Waiting,
    Arrived,
    Cancelled,
    #[serde(untagged)]
    Other(String),
}

impl Default for TrainStatus {
    fn default() -> Self {
        TrainStatus::OnTime
    }
}

impl TrainStatus {
    /// Arrived and cancelled trains no longer occupy track and are never scheduled.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrainStatus::Arrived | TrainStatus::Cancelled)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TrainStatus::Running => "Running",
            TrainStatus::Delayed => "Delayed",
            TrainStatus::Stopped => "Stopped",
            TrainStatus::Boarding => "Boarding",
            TrainStatus::OnTime => "On time",
            TrainStatus::Waiting => "Waiting",
            TrainStatus::Arrived => "Arrived",
            TrainStatus::Cancelled => "Cancelled",
            TrainStatus::Other(s) => s.as_str(),
        }
    }

    /// Tiebreak among equal priorities when sequencing: moving trains first.
    pub fn sequencing_rank(&self) -> u8 {
        match self {
            TrainStatus::Running => 0,
            TrainStatus::Delayed => 1,
            TrainStatus::Stopped => 2,
            TrainStatus::Boarding => 3,
            _ => 4,
        }
    }
}

impl fmt::Display for TrainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TrainCategory {
    Express,
    Freight,
    Local,
    #[serde(rename = "High-Speed")]
    HighSpeed,
    #[serde(untagged)]
    Other(String),
}

impl Default for TrainCategory {
    fn default() -> Self {
        TrainCategory::Other("Unknown".to_string())
    }
}

impl TrainCategory {
    pub fn as_str(&self) -> &str {
        match self {
            TrainCategory::Express => "Express",
            TrainCategory::Freight => "Freight",
            TrainCategory::Local => "Local",
            TrainCategory::HighSpeed => "High-Speed",
            TrainCategory::Other(s) => s.as_str(),
        }
    }

    /// Priority the dispatching rules assign to the category.
    pub fn nominal_priority(&self) -> u8 {
        match self {
            TrainCategory::Express | TrainCategory::HighSpeed => 5,
            TrainCategory::Local => 3,
            TrainCategory::Freight => 2,
            TrainCategory::Other(_) => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrainLocation {
    pub section_id: String,
    #[serde(default)]
    pub position_m: f64,
}

fn default_max_speed() -> f64 {
    100.0
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Train {
    pub train_id: String,
    #[serde(rename = "type", default)]
    pub category: TrainCategory,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub status: TrainStatus,
    #[serde(default = "default_max_speed")]
    pub max_speed_kmh: f64,
    #[serde(default)]
    pub destination_station: Option<String>,
    #[serde(default)]
    pub current_location: Option<TrainLocation>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub restricted_speed: bool,
    #[serde(default)]
    pub breakdown_until: Option<String>,
}

impl Train {
    /// A missing or zero priority counts as 1.
    pub fn effective_priority(&self) -> u8 {
        self.priority.max(1)
    }

    pub fn section_id(&self) -> Option<&str> {
        self.current_location
            .as_ref()
            .map(|l| l.section_id.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn position_m(&self) -> f64 {
        self.current_location
            .as_ref()
            .map(|l| l.position_m)
            .unwrap_or(0.0)
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_broken_down(&self) -> bool {
        self.breakdown_until.is_some()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SectionState {
    pub section_id: String,
    #[serde(default)]
    pub is_disrupted: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrainEvent {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub delay_duration_min: Option<f64>,
}

/// One element of the `payload` array: the train plus the section and event context it was reported with.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrainBundle {
    pub train: Train,
    #[serde(default)]
    pub section: Option<SectionState>,
    #[serde(default)]
    pub event: Option<TrainEvent>,
}

impl TrainBundle {
    pub fn id(&self) -> &str {
        &self.train.train_id
    }

    pub fn is_active(&self) -> bool {
        self.train.is_active()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrainDataResponse {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub payload: Vec<TrainBundle>,
}

pub fn active_trains(trains: &[TrainBundle]) -> impl Iterator<Item = &TrainBundle> {
    trains.iter().filter(|t| t.is_active())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn train(id: &str, section: &str, priority: u8, status: TrainStatus) -> TrainBundle {
        TrainBundle {
            train: Train {
                train_id: id.to_string(),
                category: TrainCategory::Local,
                priority,
                status,
                max_speed_kmh: 120.0,
                destination_station: Some("STN_F".to_string()),
                current_location: Some(TrainLocation {
                    section_id: section.to_string(),
                    position_m: 0.0,
                }),
                direction: Direction::Forward,
                restricted_speed: false,
                breakdown_until: None,
            },
            section: None,
            event: None,
        }
    }

    pub fn running(id: &str, section: &str, priority: u8) -> TrainBundle {
        train(id, section, priority, TrainStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bundle_with_partial_fields() {
        let json = r#"{
            "type": "train_snapshot",
            "timestamp": "2025-01-01T00:00:00",
            "payload": [
                {
                    "train": {
                        "train_id": "EXP_01",
                        "type": "High-Speed",
                        "priority": 5,
                        "status": "On time",
                        "max_speed_kmh": 170,
                        "length_m": 400,
                        "direction": "backward",
                        "destination_station": "STN_A",
                        "current_location": { "section_id": "SEC_3", "position_m": 1200.5 }
                    },
                    "section": { "section_id": "SEC_3", "is_disrupted": true, "capacity": 2 },
                    "event": { "event_type": "delay", "delay_duration_min": 4 }
                },
                { "train": { "train_id": "FRT_02", "status": "Shunting" } }
            ]
        }"#;

        let response: TrainDataResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.payload.len(), 2);

        let express = &response.payload[0].train;
        assert_eq!(express.category, TrainCategory::HighSpeed);
        assert_eq!(express.status, TrainStatus::OnTime);
        assert_eq!(express.direction, Direction::Backward);
        assert_eq!(express.section_id(), Some("SEC_3"));
        assert_eq!(express.position_m(), 1200.5);
        assert!(response.payload[0].section.as_ref().unwrap().is_disrupted);

        let freight = &response.payload[1].train;
        assert_eq!(freight.status, TrainStatus::Other("Shunting".to_string()));
        assert_eq!(freight.effective_priority(), 1);
        assert_eq!(freight.max_speed_kmh, 100.0);
        assert_eq!(freight.section_id(), None);
        assert!(freight.is_active());
    }

    #[test]
    fn missing_payload_is_empty_snapshot() {
        let response: TrainDataResponse = serde_json::from_str("{}").unwrap();
        assert!(response.payload.is_empty());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TrainStatus::Arrived.is_terminal());
        assert!(TrainStatus::Cancelled.is_terminal());
        assert!(!TrainStatus::Delayed.is_terminal());
        assert!(!TrainStatus::Other("Arriving".to_string()).is_terminal());
    }

    #[test]
    fn status_round_trips_through_label() {
        let status: TrainStatus = serde_json::from_str("\"Boarding\"").unwrap();
        assert_eq!(status.as_str(), "Boarding");
        assert_eq!(
            serde_json::to_string(&TrainStatus::Other("Held".to_string())).unwrap(),
            "\"Held\""
        );
        assert_eq!(serde_json::to_string(&TrainStatus::OnTime).unwrap(), "\"On time\"");
    }
}
