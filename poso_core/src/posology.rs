//! Weight-keyed posology tables.
//!
//! A posology table holds precomputed doses per whole-kilogram bucket,
//! grouped by clinical section ("isr", "choc", ...). The data has grown
//! organically, so a section can live in three places on an entry; see
//! [`section_entries`].

use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Weight bucket keys such as `"9kg"`, `"12 kg"`, `"2.5KG"`
static WEIGHT_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(\d+(?:[.,]\d+)?)\s*kg\s*$").expect("weight key pattern is valid")
});

/// Keys of an entry object that are not hoisted sections
const RESERVED_KEYS: [&str; 3] = ["kg", "sections", "data"];

/// Preparation / dilution of a drug
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PrepInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_conc_mg_per_ml: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_conc_mg_per_ml: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drug_mg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diluent_ml: Option<f64>,
}

/// One tabulated dose description
///
/// Well-known numeric fields are typed; anything else in the source object
/// is kept in `extra` so consumers can still display it.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DoseCommon {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose_mg_per_kg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose_mg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose_ug_per_kg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose_ug: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose_mg_per_kg_per_h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose_ug_per_kg_per_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose_mg_per_h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dose_ug_per_min: Option<f64>,
    /// Administration time of a slow bolus, in minutes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_over_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_ml: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_ml_per_h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prep: Option<PrepInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DoseCommon {
    /// Present numeric fields with their display unit, in a fixed order
    pub fn numeric_fields(&self) -> Vec<(&'static str, &'static str, f64)> {
        let fields = [
            ("dose_mg_per_kg", "mg/kg", self.dose_mg_per_kg),
            ("dose_mg", "mg", self.dose_mg),
            ("dose_ug_per_kg", "µg/kg", self.dose_ug_per_kg),
            ("dose_ug", "µg", self.dose_ug),
            ("dose_mg_per_kg_per_h", "mg/kg/h", self.dose_mg_per_kg_per_h),
            ("dose_ug_per_kg_per_min", "µg/kg/min", self.dose_ug_per_kg_per_min),
            ("dose_mg_per_h", "mg/h", self.dose_mg_per_h),
            ("dose_ug_per_min", "µg/min", self.dose_ug_per_min),
            ("admin_over_min", "min", self.admin_over_min),
            ("volume_ml", "mL", self.volume_ml),
            ("rate_ml_per_h", "mL/h", self.rate_ml_per_h),
        ];
        fields
            .into_iter()
            .filter_map(|(name, unit, value)| value.map(|v| (name, unit, v)))
            .collect()
    }

    /// Names of present numeric fields that are negative or not finite
    pub fn invalid_fields(&self) -> Vec<&'static str> {
        let mut invalid: Vec<&'static str> = self
            .numeric_fields()
            .into_iter()
            .filter(|(_, _, v)| !v.is_finite() || *v < 0.0)
            .map(|(name, _, _)| name)
            .collect();

        if let Some(prep) = &self.prep {
            let prep_fields = [
                ("prep.stock_conc_mg_per_ml", prep.stock_conc_mg_per_ml),
                ("prep.final_conc_mg_per_ml", prep.final_conc_mg_per_ml),
                ("prep.drug_mg", prep.drug_mg),
                ("prep.diluent_ml", prep.diluent_ml),
            ];
            invalid.extend(
                prep_fields
                    .into_iter()
                    .filter(|(_, v)| v.is_some_and(|v| !v.is_finite() || v < 0.0))
                    .map(|(name, _)| name),
            );
        }
        invalid
    }
}

/// Drug name and dose pairs of one section, in document order
///
/// The order of a section is the clinical sequence (induction before
/// paralysis), so it is never re-sorted.
pub type SectionDoses = Vec<(String, DoseCommon)>;

/// Precomputed posology for one weight bucket
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct PosologyWeightEntry {
    pub kg: f64,
    /// Top-level fields other than `kg`, `sections` and `data`
    pub hoisted: Map<String, Value>,
    /// Nested `sections` object, in document order
    pub sections: Vec<(String, SectionDoses)>,
    /// Raw payload kept for keys never migrated into `sections`
    pub data: Value,
}

impl PosologyWeightEntry {
    /// Build an entry from its JSON object. Returns `None` for non-objects.
    pub fn from_value(kg: f64, value: &Value) -> Option<Self> {
        let object = value.as_object()?;

        let hoisted = object
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let sections = match object.get("sections") {
            Some(Value::Object(sections)) => sections
                .iter()
                .filter_map(|(name, section)| {
                    let doses = dose_objects(section);
                    (!doses.is_empty()).then(|| (name.clone(), doses))
                })
                .collect(),
            _ => Vec::new(),
        };

        Some(Self {
            kg,
            hoisted,
            sections,
            data: object.get("data").cloned().unwrap_or(Value::Null),
        })
    }
}

/// A parsed posology document
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct PosologyTable {
    pub meta: Option<Value>,
    pub weights: Vec<PosologyWeightEntry>,
}

/// Object-valued members of `value` that read as a [`DoseCommon`]
///
/// Scalars and arrays are skipped silently; objects that fail to
/// deserialize are skipped with a warning.
fn dose_objects(value: &Value) -> Vec<(String, DoseCommon)> {
    let Some(object) = value.as_object() else {
        return Vec::new();
    };

    object
        .iter()
        .filter(|(_, v)| v.is_object())
        .filter_map(|(name, v)| match serde_json::from_value::<DoseCommon>(v.clone()) {
            Ok(dose) => Some((name.clone(), dose)),
            Err(e) => {
                tracing::warn!("Skipping malformed dose entry '{}': {}", name, e);
                None
            }
        })
        .collect()
}

type SectionAccessor = fn(&PosologyWeightEntry, &str) -> Vec<(String, DoseCommon)>;

fn hoisted_section(entry: &PosologyWeightEntry, key: &str) -> Vec<(String, DoseCommon)> {
    entry.hoisted.get(key).map(dose_objects).unwrap_or_default()
}

fn nested_section(entry: &PosologyWeightEntry, key: &str) -> Vec<(String, DoseCommon)> {
    entry
        .sections
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, doses)| doses.clone())
        .unwrap_or_default()
}

fn raw_data_section(entry: &PosologyWeightEntry, key: &str) -> Vec<(String, DoseCommon)> {
    entry.data.get(key).map(dose_objects).unwrap_or_default()
}

/// Where a section is looked up, highest priority first
const SECTION_ACCESSORS: [(&str, SectionAccessor); 3] = [
    ("hoisted", hoisted_section),
    ("sections", nested_section),
    ("data", raw_data_section),
];

/// Drug doses of a named section, in document order
///
/// The first non-empty source wins: a hoisted top-level field, then
/// `sections[key]`, then `data[key]`.
pub fn section_entries(entry: &PosologyWeightEntry, section_key: &str) -> Vec<(String, DoseCommon)> {
    for (source, accessor) in SECTION_ACCESSORS {
        let found = accessor(entry, section_key);
        if !found.is_empty() {
            tracing::debug!(
                "Section '{}' at {} kg resolved from {}",
                section_key,
                entry.kg,
                source
            );
            return found;
        }
    }
    Vec::new()
}

/// Every section name that resolves to at least one dose on this entry
pub fn section_names(entry: &PosologyWeightEntry) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = entry.sections.iter().map(|(name, _)| name.clone()).collect();
    let candidates = entry
        .hoisted
        .keys()
        .chain(entry.data.as_object().into_iter().flat_map(|o| o.keys()));
    for key in candidates {
        if !section_entries(entry, key).is_empty() {
            names.insert(key.clone());
        }
    }
    names
}

/// Entry for a weight: exact bucket for the rounded weight, else the nearest
///
/// Ties on distance keep the lighter bucket (first in ascending order).
/// A non-finite weight matches nothing.
pub fn find_entry_by_weight(table: &[PosologyWeightEntry], weight_kg: f64) -> Option<&PosologyWeightEntry> {
    if !weight_kg.is_finite() {
        tracing::warn!("Invalid weight {} kg for posology lookup", weight_kg);
        return None;
    }

    let mut sorted: Vec<&PosologyWeightEntry> = table.iter().collect();
    sorted.sort_by(|a, b| a.kg.total_cmp(&b.kg));

    let target = weight_kg.round();
    if let Some(exact) = sorted.iter().find(|e| e.kg == target).copied() {
        return Some(exact);
    }

    let mut best: Option<(&PosologyWeightEntry, f64)> = None;
    for entry in sorted {
        let distance = (entry.kg - weight_kg).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((entry, distance)),
        }
    }

    if let Some((entry, _)) = best {
        tracing::debug!("No {} kg bucket, using nearest {} kg", target, entry.kg);
    }
    best.map(|(entry, _)| entry)
}

/// Sorted weights available in a table
pub fn available_weights(table: &[PosologyWeightEntry]) -> Vec<f64> {
    let mut weights: Vec<f64> = table.iter().map(|e| e.kg).collect();
    weights.sort_by(f64::total_cmp);
    weights
}

/// Parse a bucket key such as `"9kg"` into kilograms
pub fn parse_weight_key(key: &str) -> Option<f64> {
    let captures = WEIGHT_KEY.captures(key)?;
    captures[1].replace(',', ".").parse().ok()
}

/// Parse a posology document
///
/// Two layouts are accepted:
/// - `{"__meta": {...}, "weights": [{"kg": 9, ...}, ...]}`
/// - `{"9kg": {...}, "10kg": {...}}`
///
/// Malformed keys and entries are skipped with a warning. Only a document
/// that is not a JSON object is an error.
pub fn parse_posology_document(document: &Value) -> Result<PosologyTable> {
    let object = document
        .as_object()
        .ok_or_else(|| Error::Posology("posology document must be a JSON object".into()))?;

    let meta = object.get("__meta").cloned();

    let weights = match object.get("weights") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| {
                let kg = item.get("kg").and_then(Value::as_f64);
                match kg {
                    Some(kg) if kg.is_finite() && kg > 0.0 => PosologyWeightEntry::from_value(kg, item),
                    _ => {
                        tracing::warn!("Skipping weights[{}]: missing or invalid kg", idx);
                        None
                    }
                }
            })
            .collect(),
        _ => object
            .iter()
            .filter(|(key, _)| key.as_str() != "__meta")
            .filter_map(|(key, value)| {
                let Some(kg) = parse_weight_key(key) else {
                    tracing::warn!("Skipping posology key '{}': not a weight bucket", key);
                    return None;
                };
                let entry = PosologyWeightEntry::from_value(kg, value);
                if entry.is_none() {
                    tracing::warn!("Skipping posology bucket '{}': not an object", key);
                }
                entry
            })
            .collect(),
    };

    Ok(PosologyTable { meta, weights })
}

/// Load and parse a posology JSON file
pub fn load_posology(path: &Path) -> Result<PosologyTable> {
    let contents = std::fs::read_to_string(path)?;
    let document: Value = serde_json::from_str(&contents)?;
    let table = parse_posology_document(&document)?;
    tracing::info!(
        "Loaded {} posology buckets from {:?}",
        table.weights.len(),
        path
    );
    Ok(table)
}
