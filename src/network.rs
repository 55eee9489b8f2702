//! Static track topology of the corridor the engine schedules.

use crate::error::NetworkError;
use indexmap::IndexMap;
use tracing::warn;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    Single,
    Double,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub section_id: String,
    pub start_station: String,
    pub end_station: String,
    pub length_km: f64,
    pub capacity: usize,
    pub max_speed_kmh: u32,
    pub track_type: TrackType,
    pub successors: Vec<String>,
    #[serde(default)]
    pub bypass: bool,
}

impl Section {
    fn new(
        section_id: &str,
        (start_station, end_station): (&str, &str),
        length_km: f64,
        capacity: usize,
        max_speed_kmh: u32,
        successors: &[&str],
    ) -> Self {
        Self {
            section_id: section_id.to_string(),
            start_station: start_station.to_string(),
            end_station: end_station.to_string(),
            length_km,
            capacity,
            max_speed_kmh,
            track_type: if capacity > 1 {
                TrackType::Double
            } else {
                TrackType::Single
            },
            successors: successors.iter().map(|s| s.to_string()).collect(),
            bypass: false,
        }
    }

    /// One line for the advisor prompt, e.g. `SEC_2: STN_B->STN_C (6.2km, capacity: 1, single track)`.
    pub fn describe(&self) -> String {
        let track = match self.track_type {
            TrackType::Single => "single track",
            TrackType::Double => "double track",
        };

        let mut line = format!(
            "{}: {}->{} ({}km, capacity: {}, {}",
            self.section_id,
            self.start_station,
            self.end_station,
            self.length_km,
            self.capacity,
            track
        );

        if self.bypass {
            line.push_str(", bypass route");
        }

        line.push(')');
        line
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Network {
    sections: IndexMap<String, Section>,
}

impl Default for Network {
    fn default() -> Self {
        Self::corridor()
    }
}

impl Network {
    /// The six-section A-F corridor with the SEC_6 bypass between STN_B and STN_E.
    pub fn corridor() -> Self {
        let mut bypass = Section::new("SEC_6", ("STN_B", "STN_E"), 12.0, 1, 90, &[]);
        bypass.bypass = true;

        let sections = [
            Section::new("SEC_1", ("STN_A", "STN_B"), 8.5, 2, 120, &["SEC_2"]),
            Section::new("SEC_2", ("STN_B", "STN_C"), 6.2, 1, 100, &["SEC_3"]),
            Section::new("SEC_3", ("STN_C", "STN_D"), 7.8, 2, 140, &["SEC_4"]),
            Section::new("SEC_4", ("STN_D", "STN_E"), 5.3, 1, 110, &["SEC_5"]),
            Section::new("SEC_5", ("STN_E", "STN_F"), 9.1, 3, 160, &["SEC_6"]),
            bypass,
        ];

        Self {
            sections: sections
                .into_iter()
                .map(|s| (s.section_id.clone(), s))
                .collect(),
        }
    }

    pub fn from_sections(sections: Vec<Section>) -> Result<Self, NetworkError> {
        let mut map: IndexMap<String, Section> = IndexMap::with_capacity(sections.len());

        for section in sections {
            if section.capacity == 0 {
                return Err(NetworkError::ZeroCapacity(section.section_id));
            }
            if map.contains_key(&section.section_id) {
                return Err(NetworkError::DuplicateSection(section.section_id));
            }
            map.insert(section.section_id.clone(), section);
        }

        for section in map.values() {
            if let Some(missing) = section
                .successors
                .iter()
                .find(|successor| !map.contains_key(*successor))
            {
                return Err(NetworkError::UnknownSuccessor {
                    section: section.section_id.clone(),
                    successor: missing.clone(),
                });
            }
        }

        Ok(Self { sections: map })
    }

    pub fn section(&self, section_id: &str) -> Option<&Section> {
        self.sections.get(section_id)
    }

    /// Sections missing from the model are treated as single track.
    pub fn capacity(&self, section_id: &str) -> usize {
        match self.sections.get(section_id) {
            Some(section) => section.capacity,
            None => {
                warn!("section {} is not in the network model, assuming capacity 1", section_id);
                1
            }
        }
    }

    pub fn successors(&self, section_id: &str) -> &[String] {
        self.sections
            .get(section_id)
            .map(|s| s.successors.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_successor(&self, from: &str, to: &str) -> bool {
        self.successors(from).iter().any(|s| s == to)
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.values()
    }

    pub fn single_track_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.values().filter(|s| s.capacity == 1)
    }

    /// Fallback target for trains reported without a location.
    pub fn entry_section(&self) -> &str {
        self.sections
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or("SEC_1")
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corridor_matches_published_topology() {
        let network = Network::corridor();

        assert_eq!(network.len(), 6);
        assert_eq!(network.capacity("SEC_1"), 2);
        assert_eq!(network.capacity("SEC_5"), 3);
        assert!(network.is_successor("SEC_1", "SEC_2"));
        assert!(!network.is_successor("SEC_2", "SEC_1"));
        assert!(network.successors("SEC_6").is_empty());
        assert_eq!(
            network
                .single_track_sections()
                .map(|s| s.section_id.as_str())
                .collect::<Vec<_>>(),
            vec!["SEC_2", "SEC_4", "SEC_6"]
        );
        assert_eq!(network.entry_section(), "SEC_1");
    }

    #[test]
    fn unknown_section_is_single_track() {
        let network = Network::corridor();
        assert_eq!(network.capacity("SEC_99"), 1);
        assert!(network.successors("SEC_99").is_empty());
    }

    #[test]
    fn describe_marks_bypass() {
        let network = Network::corridor();
        assert_eq!(
            network.section("SEC_6").map(Section::describe).as_deref(),
            Some("SEC_6: STN_B->STN_E (12km, capacity: 1, single track, bypass route)")
        );
        assert_eq!(
            network.section("SEC_1").map(Section::describe).as_deref(),
            Some("SEC_1: STN_A->STN_B (8.5km, capacity: 2, double track)")
        );
    }

    #[test]
    fn from_sections_rejects_dangling_successor() {
        let sections = vec![Section::new("A", ("X", "Y"), 1.0, 1, 80, &["B"])];

        assert_eq!(
            Network::from_sections(sections),
            Err(NetworkError::UnknownSuccessor {
                section: "A".to_string(),
                successor: "B".to_string(),
            })
        );
    }

    #[test]
    fn from_sections_rejects_duplicates_and_zero_capacity() {
        let duplicate = vec![
            Section::new("A", ("X", "Y"), 1.0, 1, 80, &[]),
            Section::new("A", ("Y", "Z"), 1.0, 2, 80, &[]),
        ];
        assert_eq!(
            Network::from_sections(duplicate),
            Err(NetworkError::DuplicateSection("A".to_string()))
        );

        let zero = vec![Section::new("A", ("X", "Y"), 1.0, 0, 80, &[])];
        assert_eq!(
            Network::from_sections(zero),
            Err(NetworkError::ZeroCapacity("A".to_string()))
        );
    }
}
