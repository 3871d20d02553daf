//! Unit label normalization.
//!
//! Tabulated doses come with free-text unit labels ("mcg/kg/min", "meq/kg",
//! "UI/kg"). Everything downstream compares and displays the canonical
//! spelling produced here.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Lowercased synonym -> canonical spelling
static UNIT_SYNONYMS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("mg", "mg"),
        ("g", "g"),
        ("kg", "kg"),
        ("ml", "mL"),
        ("l", "L"),
        ("ui", "UI"),
        ("iu", "UI"),
        ("meq", "mEq"),
        ("mmol", "mmol"),
        ("min", "min"),
        ("h", "h"),
        // micro sign (U+00B5), greek mu (U+03BC) and ASCII spellings
        ("µg", "µg"),
        ("μg", "µg"),
        ("ug", "µg"),
        ("mcg", "µg"),
    ])
});

/// Coarse family of amount units that cannot be divided into one another
/// without an explicit conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitFamily {
    MilliEquivalent,
    Millimole,
}

/// Canonical spelling of a single unit token. Unknown tokens pass through.
fn canonical_token(token: &str) -> String {
    match UNIT_SYNONYMS.get(token.to_lowercase().as_str()) {
        Some(canonical) => (*canonical).to_string(),
        None => token.to_string(),
    }
}

/// Normalize one `/`-separated segment: the leading word is canonicalized,
/// anything after it ("(MAX)", "IV lent") is kept verbatim.
fn normalize_segment(segment: &str) -> String {
    let segment = segment.trim();
    match segment.find(char::is_whitespace) {
        Some(idx) => {
            let (head, tail) = segment.split_at(idx);
            format!("{}{}", canonical_token(head), tail)
        }
        None => canonical_token(segment),
    }
}

/// Normalize a unit label to its canonical spelling
///
/// Compound labels are handled segment by segment:
/// `"MCG/KG/MIN"` becomes `"µg/kg/min"`, `"meq/kg/h (MAX)"` becomes
/// `"mEq/kg/h (MAX)"`. Never fails; unknown labels come back unchanged
/// (modulo surrounding whitespace).
pub fn normalize_unit(token: &str) -> String {
    token
        .split('/')
        .map(normalize_segment)
        .collect::<Vec<_>>()
        .join("/")
}

/// Per-kilogram form of a unit label, unless it is already per kilogram.
///
/// `/kg` goes right after the amount: `"mg"` -> `"mg/kg"`,
/// `"UI/h"` -> `"UI/kg/h"`.
pub fn format_per_kg_unit(unit: &str) -> String {
    if unit.contains("/kg") {
        return unit.to_string();
    }
    match unit.split_once('/') {
        Some((amount, rate)) => format!("{}/kg/{}", amount, rate),
        None => format!("{}/kg", unit),
    }
}

/// Drop the first `/kg` segment: `"mEq/kg"` -> `"mEq"`, `"µg/kg/min"` -> `"µg/min"`.
///
/// Used once a per-kilogram dose has been multiplied by the patient weight.
pub fn strip_per_kg(unit: &str) -> String {
    let normalized = normalize_unit(unit);
    let mut segments: Vec<&str> = normalized.split('/').collect();
    if let Some(pos) = segments.iter().skip(1).position(|s| *s == "kg") {
        segments.remove(pos + 1);
    }
    segments.join("/")
}

/// Family of a unit label, taken from its leading amount unit.
pub fn unit_family(unit: &str) -> Option<UnitFamily> {
    let normalized = normalize_unit(unit);
    let head = normalized
        .split('/')
        .next()
        .and_then(|s| s.split_whitespace().next())
        .unwrap_or("");
    match head {
        "mEq" => Some(UnitFamily::MilliEquivalent),
        "mmol" => Some(UnitFamily::Millimole),
        _ => None,
    }
}
