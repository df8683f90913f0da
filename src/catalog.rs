//! Read-only frequency reference data: the catalog of playable presets and
//! the solfeggio note table. Records keep the field names of the upstream
//! JSON, so existing catalog files load unchanged.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{EngineError, Result};
use crate::patterns::{PatternKind, DEFAULT_BASE_HZ};
use crate::voice::ToneRequest;

/// Default carrier for binaural presets that do not name one.
pub const DEFAULT_CARRIER_HZ: f64 = 200.0;

pub const SOLFEGGIO_NOTES: [(&str, f64); 7] = [
    ("ut", 396.0),
    ("re", 417.0),
    ("mi", 528.0),
    ("fa", 639.0),
    ("sol", 741.0),
    ("la", 852.0),
    ("si", 963.0),
];

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CatalogKind {
    Binaural,
    Solfeggio,
    Pure,
    Special,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FrequencySpec {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Beat frequency for binaural presets, tone frequency otherwise.
    /// `None` marks a non-tonal pattern preset.
    #[serde(default, alias = "frequency")]
    pub frequency_hz: Option<f64>,
    #[serde(rename = "type")]
    pub kind: CatalogKind,
    #[serde(default)]
    pub category: String,
    #[serde(default, alias = "carrierFrequency")]
    pub carrier_hz: Option<f64>,
    #[serde(default)]
    pub warning: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl FrequencySpec {
    /// Map a catalog record to the voice request it plays.
    pub fn request(&self) -> Result<ToneRequest> {
        match self.kind {
            CatalogKind::Binaural => {
                let beat = self.tonal_frequency()?;
                Ok(ToneRequest::Binaural {
                    beat_hz: beat as f32,
                    carrier_hz: self.carrier_hz.unwrap_or(DEFAULT_CARRIER_HZ) as f32,
                })
            }
            CatalogKind::Solfeggio | CatalogKind::Pure => Ok(ToneRequest::Tone {
                frequency_hz: self.tonal_frequency()? as f32,
            }),
            CatalogKind::Special => Ok(ToneRequest::Pattern {
                kind: PatternKind::from_tag(&self.id),
                base_hz: self.carrier_hz.map(|c| c as f32).unwrap_or(DEFAULT_BASE_HZ),
                complexity: 1.0,
            }),
        }
    }

    fn tonal_frequency(&self) -> Result<f64> {
        self.frequency_hz.ok_or_else(|| EngineError::Generation {
            kind: self.id.clone(),
            reason: "catalog record has no frequency".to_string(),
        })
    }
}

/// The preset catalog, grouped the way the source data groups it
/// (focus, meditation, ...).
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Catalog {
    #[serde(flatten)]
    pub groups: BTreeMap<String, Vec<FrequencySpec>>,
}

impl Catalog {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let txt = std::fs::read_to_string(path)?;
        Self::from_json(&txt)
    }

    pub fn from_json(txt: &str) -> Result<Self> {
        Ok(serde_json::from_str(txt)?)
    }

    pub fn find(&self, id: &str) -> Option<&FrequencySpec> {
        self.iter().find(|spec| spec.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrequencySpec> {
        self.groups.values().flatten()
    }
}

pub fn solfeggio_frequency(note: &str) -> Option<f64> {
    SOLFEGGIO_NOTES
        .iter()
        .find(|(name, _)| *name == note)
        .map(|(_, freq)| *freq)
}

/// Name of the solfeggio note closest to the given frequency.
pub fn nearest_solfeggio(frequency: f64) -> &'static str {
    let mut closest = SOLFEGGIO_NOTES[0].0;
    let mut closest_diff = (SOLFEGGIO_NOTES[0].1 - frequency).abs();
    for (note, freq) in SOLFEGGIO_NOTES {
        let diff = (freq - frequency).abs();
        if diff < closest_diff {
            closest_diff = diff;
            closest = note;
        }
    }
    closest
}

pub fn is_audible(frequency: f64) -> bool {
    (20.0..=20000.0).contains(&frequency)
}

/// Display form of an optional frequency, as the source UI printed it.
pub fn format_frequency(frequency: Option<f64>) -> String {
    match frequency {
        Some(f) => format!("{f:.2} Hz"),
        None => "N/A".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "focus": [
            {
                "id": "deep-focus-40hz",
                "title": "Deep Focus",
                "frequency": 40,
                "type": "binaural",
                "category": "gamma",
                "carrierFrequency": 200,
                "description": "Gamma-band focus support."
            },
            {
                "id": "aleph-focus",
                "title": "Aleph Clarity",
                "frequency": null,
                "type": "special",
                "category": "transcendental",
                "description": "Pattern preset.",
                "warning": "Start with short sessions."
            }
        ],
        "healing": [
            {
                "id": "dna-repair-528hz",
                "title": "Transformation",
                "frequency": 528,
                "type": "solfeggio",
                "category": "healing",
                "description": "Solfeggio mi."
            }
        ]
    }"#;

    #[test]
    fn loads_grouped_records_with_source_field_names() {
        let catalog = Catalog::from_json(SAMPLE).unwrap();
        assert_eq!(catalog.iter().count(), 3);
        let spec = catalog.find("deep-focus-40hz").unwrap();
        assert_eq!(spec.kind, CatalogKind::Binaural);
        assert_eq!(spec.carrier_hz, Some(200.0));
        assert!(catalog.find("missing").is_none());
    }

    #[test]
    fn binaural_request_uses_carrier_and_beat() {
        let catalog = Catalog::from_json(SAMPLE).unwrap();
        let req = catalog.find("deep-focus-40hz").unwrap().request().unwrap();
        assert_eq!(
            req,
            ToneRequest::Binaural {
                beat_hz: 40.0,
                carrier_hz: 200.0
            }
        );
    }

    #[test]
    fn special_record_without_frequency_becomes_pattern() {
        let catalog = Catalog::from_json(SAMPLE).unwrap();
        let spec = catalog.find("aleph-focus").unwrap();
        assert_eq!(spec.frequency_hz, None);
        let req = spec.request().unwrap();
        assert_eq!(
            req,
            ToneRequest::Pattern {
                kind: PatternKind::AmFallback,
                base_hz: DEFAULT_BASE_HZ,
                complexity: 1.0
            }
        );
    }

    #[test]
    fn solfeggio_record_is_plain_tone() {
        let catalog = Catalog::from_json(SAMPLE).unwrap();
        let req = catalog.find("dna-repair-528hz").unwrap().request().unwrap();
        assert_eq!(req, ToneRequest::Tone { frequency_hz: 528.0 });
    }

    #[test]
    fn tonal_record_missing_frequency_is_an_error() {
        let spec = FrequencySpec {
            id: "broken".to_string(),
            title: String::new(),
            frequency_hz: None,
            kind: CatalogKind::Pure,
            category: String::new(),
            carrier_hz: None,
            warning: None,
            description: String::new(),
        };
        assert!(spec.request().is_err());
    }

    #[test]
    fn nearest_note_prefers_smallest_distance() {
        assert_eq!(nearest_solfeggio(432.0), "re");
        assert_eq!(nearest_solfeggio(396.0), "ut");
        assert_eq!(nearest_solfeggio(10_000.0), "si");
        assert_eq!(solfeggio_frequency("mi"), Some(528.0));
        assert_eq!(solfeggio_frequency("xx"), None);
    }

    #[test]
    fn audible_range_bounds() {
        assert!(is_audible(20.0));
        assert!(is_audible(20000.0));
        assert!(!is_audible(19.9));
        assert!(!is_audible(20000.1));
    }

    #[test]
    fn frequency_formatting_matches_the_source_ui() {
        assert_eq!(format_frequency(Some(528.0)), "528.00 Hz");
        assert_eq!(format_frequency(Some(7.83)), "7.83 Hz");
        assert_eq!(format_frequency(None), "N/A");
    }
}
