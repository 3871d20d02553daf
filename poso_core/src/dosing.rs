//! Dosing rule evaluation.
//!
//! Turns a tabulated rule (mg/kg, fixed, ranged) plus a patient weight into
//! a clamped, step-rounded dose. Weight-band overrides are checked first and
//! always win over the generic rule.
//!
//! Evaluation never fails: a rule that cannot produce a number yields
//! [`DoseValue::Unavailable`] with a human-readable reason.

use serde::{Deserialize, Serialize};

const RANGED_RULE_NOTE: &str = "See protocol for the dose range";
const UNDEFINED_RULE_NOTE: &str = "Dosing rule not defined";

/// How a rule derives its dose
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DosingBasis {
    /// `weight * mg_per_kg`
    #[serde(rename = "mg_per_kg")]
    PerKilogram,
    /// Fixed dose, stored in `min_dose_mg`
    #[serde(rename = "fixed")]
    Fixed,
    /// Informational range only, never resolves to a number
    #[serde(rename = "range")]
    Ranged,
    /// Any basis this engine does not know about
    #[serde(other)]
    Unknown,
}

/// Dose computation rule for one drug/indication
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DosingRule {
    pub basis: DosingBasis,
    #[serde(default)]
    pub mg_per_kg: Option<f64>,
    /// Single administration (true) or a rate (false)
    #[serde(default = "default_per_dose")]
    pub per_dose: bool,
    #[serde(default)]
    pub min_dose_mg: Option<f64>,
    #[serde(default)]
    pub max_dose_mg: Option<f64>,
    #[serde(default)]
    pub max_daily_mg_per_kg: Option<f64>,
    #[serde(default)]
    pub rounding_step_mg: Option<f64>,
    #[serde(default)]
    pub frequency_text: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_per_dose() -> bool {
    true
}

impl DosingRule {
    /// Per-kilogram rule with no clamps or rounding
    pub fn per_kg(mg_per_kg: f64) -> Self {
        Self {
            basis: DosingBasis::PerKilogram,
            mg_per_kg: Some(mg_per_kg),
            ..Self::empty(DosingBasis::PerKilogram)
        }
    }

    /// Fixed-dose rule
    pub fn fixed(dose_mg: f64) -> Self {
        Self {
            min_dose_mg: Some(dose_mg),
            ..Self::empty(DosingBasis::Fixed)
        }
    }

    /// Ranged (informational) rule
    pub fn ranged(notes: impl Into<String>) -> Self {
        Self {
            notes: Some(notes.into()),
            ..Self::empty(DosingBasis::Ranged)
        }
    }

    fn empty(basis: DosingBasis) -> Self {
        Self {
            basis,
            mg_per_kg: None,
            per_dose: true,
            min_dose_mg: None,
            max_dose_mg: None,
            max_daily_mg_per_kg: None,
            rounding_step_mg: None,
            frequency_text: None,
            route: None,
            notes: None,
        }
    }
}

/// Discrete dose for a weight band, bypassing the per-kg formula
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WeightOverride {
    /// Inclusive lower bound
    pub min_kg: f64,
    /// Inclusive upper bound
    pub max_kg: f64,
    pub dose_mg: f64,
    #[serde(default)]
    pub note: Option<String>,
}

impl WeightOverride {
    pub fn contains(&self, weight_kg: f64) -> bool {
        weight_kg >= self.min_kg && weight_kg <= self.max_kg
    }

    pub fn overlaps(&self, other: &WeightOverride) -> bool {
        self.min_kg <= other.max_kg && other.min_kg <= self.max_kg
    }
}

/// Outcome of a dose computation
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum DoseValue {
    Computed(f64),
    /// No numeric answer; the string explains why
    Unavailable(String),
}

impl DoseValue {
    pub fn value(&self) -> Option<f64> {
        match self {
            DoseValue::Computed(v) => Some(*v),
            DoseValue::Unavailable(_) => None,
        }
    }

    /// Numeric view for NaN-based consumers
    pub fn as_f64(&self) -> f64 {
        self.value().unwrap_or(f64::NAN)
    }

    pub fn is_available(&self) -> bool {
        matches!(self, DoseValue::Computed(_))
    }
}

/// Where a dose came from
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DoseSource {
    Override,
    Rule,
}

/// A computed dose together with the rule's descriptive fields
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct DoseResult {
    pub dose: DoseValue,
    pub source: DoseSource,
    /// Informational daily ceiling, not applied to `dose`
    pub max_daily_mg: Option<f64>,
    pub route: Option<String>,
    pub frequency: Option<String>,
    pub note: Option<String>,
}

impl DoseResult {
    fn from_rule(rule: &DosingRule, dose: DoseValue, note: Option<String>) -> Self {
        Self {
            dose,
            source: DoseSource::Rule,
            max_daily_mg: None,
            route: rule.route.clone(),
            frequency: rule.frequency_text.clone(),
            note,
        }
    }

    fn unavailable(rule: &DosingRule, fallback: &str) -> Self {
        let reason = rule.notes.clone().unwrap_or_else(|| fallback.to_string());
        Self::from_rule(rule, DoseValue::Unavailable(reason.clone()), Some(reason))
    }
}

/// Positive, finite value of an optional rule field
fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

/// First band containing the weight, in iteration order
///
/// Overlapping bands are resolved by position: the earliest listed band wins.
pub fn find_override(weight_kg: f64, overrides: &[WeightOverride]) -> Option<&WeightOverride> {
    overrides.iter().find(|o| o.contains(weight_kg))
}

/// Index pairs `(i, j)` with `i < j` of bands that overlap
pub fn overlapping_overrides(overrides: &[WeightOverride]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (i, a) in overrides.iter().enumerate() {
        for (j, b) in overrides.iter().enumerate().skip(i + 1) {
            if a.overlaps(b) {
                pairs.push((i, j));
            }
        }
    }
    pairs
}

/// Round to the nearest multiple of `step`
///
/// A non-positive step leaves the value untouched. A strictly positive value
/// that would round to zero becomes one step instead.
pub fn round_to_step(value: f64, step: f64) -> f64 {
    if !step.is_finite() || step <= 0.0 {
        return value;
    }
    let rounded = (value / step).round() * step;
    if value > 0.0 && rounded == 0.0 {
        return step;
    }
    rounded
}

/// Compute the dose for a patient weight
///
/// 1. The first override band containing the weight wins.
/// 2. Otherwise the rule basis gives a raw dose (ranged and incomplete
///    rules stop here as unavailable).
/// 3. `min_dose_mg` / `max_dose_mg` clamp the raw dose.
/// 4. `rounding_step_mg` rounds it, never down to zero.
/// 5. `max_daily_mg_per_kg` is reported alongside, not enforced.
pub fn compute_dose(weight_kg: f64, rule: &DosingRule, overrides: &[WeightOverride]) -> DoseResult {
    if !weight_kg.is_finite() || weight_kg <= 0.0 {
        tracing::warn!("Refusing to compute a dose for weight {}", weight_kg);
        let reason = format!("Invalid patient weight: {}", weight_kg);
        return DoseResult::from_rule(rule, DoseValue::Unavailable(reason), rule.notes.clone());
    }

    if let Some(band) = find_override(weight_kg, overrides) {
        tracing::debug!(
            "Weight {} kg matches override band [{}, {}] -> {} mg",
            weight_kg,
            band.min_kg,
            band.max_kg,
            band.dose_mg
        );
        return DoseResult {
            dose: DoseValue::Computed(band.dose_mg),
            source: DoseSource::Override,
            max_daily_mg: None,
            route: rule.route.clone(),
            frequency: rule.frequency_text.clone(),
            note: band.note.clone().or_else(|| rule.notes.clone()),
        };
    }

    let mut raw = match (rule.basis, positive(rule.mg_per_kg), positive(rule.min_dose_mg)) {
        (DosingBasis::PerKilogram, Some(mg_per_kg), _) => weight_kg * mg_per_kg,
        (DosingBasis::Fixed, _, Some(fixed)) => fixed,
        (DosingBasis::Ranged, _, _) => {
            tracing::debug!("Ranged rule, no numeric dose");
            return DoseResult::unavailable(rule, RANGED_RULE_NOTE);
        }
        (basis, _, _) => {
            tracing::debug!("Incomplete rule for basis {:?}", basis);
            return DoseResult::unavailable(rule, UNDEFINED_RULE_NOTE);
        }
    };

    if let Some(min) = positive(rule.min_dose_mg) {
        raw = raw.max(min);
    }
    if let Some(max) = positive(rule.max_dose_mg) {
        raw = raw.min(max);
    }

    let dose_mg = round_to_step(raw, rule.rounding_step_mg.unwrap_or(0.0));
    let max_daily_mg = positive(rule.max_daily_mg_per_kg).map(|per_kg| per_kg * weight_kg);

    tracing::debug!(
        "Computed {} mg for {} kg ({:?} basis)",
        dose_mg,
        weight_kg,
        rule.basis
    );

    DoseResult {
        max_daily_mg,
        ..DoseResult::from_rule(rule, DoseValue::Computed(dose_mg), rule.notes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clamped_rule() -> DosingRule {
        DosingRule {
            min_dose_mg: Some(5.0),
            max_dose_mg: Some(50.0),
            ..DosingRule::per_kg(2.0)
        }
    }

    fn dose_of(result: &DoseResult) -> f64 {
        result.dose.value().expect("dose should be computed")
    }

    #[test]
    fn test_clamps_to_min_and_max() {
        crate::logging::init_test();
        let rule = clamped_rule();

        assert_eq!(dose_of(&compute_dose(1.0, &rule, &[])), 5.0);
        assert_eq!(dose_of(&compute_dose(100.0, &rule, &[])), 50.0);
        assert_eq!(dose_of(&compute_dose(10.0, &rule, &[])), 20.0);
    }

    #[test]
    fn test_rounding_never_zeroes_positive_dose() {
        let rule = DosingRule {
            rounding_step_mg: Some(5.0),
            ..DosingRule::per_kg(0.01)
        };
        assert_eq!(dose_of(&compute_dose(1.0, &rule, &[])), 5.0);
    }

    #[test]
    fn test_rounds_to_nearest_step() {
        let rule = DosingRule {
            rounding_step_mg: Some(2.5),
            ..DosingRule::per_kg(15.0)
        };
        // 13.3 kg * 15 = 199.5 -> 200
        assert_eq!(dose_of(&compute_dose(13.3, &rule, &[])), 200.0);
        assert_eq!(round_to_step(7.0, 0.0), 7.0);
        assert_eq!(round_to_step(7.0, -1.0), 7.0);
        assert_eq!(round_to_step(0.0, 5.0), 0.0);
    }

    #[test]
    fn test_override_wins_over_rule() {
        let rule = clamped_rule();
        let overrides = vec![WeightOverride {
            min_kg: 3.0,
            max_kg: 6.0,
            dose_mg: 12.5,
            note: Some("neonatal band".into()),
        }];

        for weight in [3.0, 4.5, 6.0] {
            let result = compute_dose(weight, &rule, &overrides);
            assert_eq!(result.source, DoseSource::Override);
            assert_eq!(dose_of(&result), 12.5);
            assert_eq!(result.note.as_deref(), Some("neonatal band"));
        }

        let outside = compute_dose(6.1, &rule, &overrides);
        assert_eq!(outside.source, DoseSource::Rule);
    }

    #[test]
    fn test_override_applies_to_ranged_rule() {
        let rule = DosingRule::ranged("2.5 to 5 mg depending on age");
        let overrides = vec![WeightOverride {
            min_kg: 10.0,
            max_kg: 20.0,
            dose_mg: 2.5,
            note: None,
        }];
        let result = compute_dose(15.0, &rule, &overrides);
        assert_eq!(result.source, DoseSource::Override);
        assert_eq!(dose_of(&result), 2.5);
        assert_eq!(result.note.as_deref(), Some("2.5 to 5 mg depending on age"));
    }

    #[test]
    fn test_overlapping_overrides_first_match_wins() {
        let overrides = vec![
            WeightOverride { min_kg: 5.0, max_kg: 10.0, dose_mg: 1.0, note: None },
            WeightOverride { min_kg: 8.0, max_kg: 12.0, dose_mg: 2.0, note: None },
        ];
        let result = compute_dose(9.0, &DosingRule::per_kg(1.0), &overrides);
        assert_eq!(dose_of(&result), 1.0);
        assert_eq!(overlapping_overrides(&overrides), vec![(0, 1)]);
    }

    #[test]
    fn test_adjacent_bands_do_not_overlap() {
        let overrides = vec![
            WeightOverride { min_kg: 5.0, max_kg: 9.9, dose_mg: 1.0, note: None },
            WeightOverride { min_kg: 10.0, max_kg: 12.0, dose_mg: 2.0, note: None },
        ];
        assert!(overlapping_overrides(&overrides).is_empty());
    }

    #[test]
    fn test_ranged_rule_never_resolves() {
        let rule = DosingRule::ranged("Salbutamol: see age table");
        for weight in [0.5, 3.0, 10.0, 49.0, 120.0] {
            let result = compute_dose(weight, &rule, &[]);
            assert!(!result.dose.is_available());
            assert!(result.dose.as_f64().is_nan());
            assert_eq!(result.source, DoseSource::Rule);
            assert_eq!(result.note.as_deref(), Some("Salbutamol: see age table"));
        }
    }

    #[test]
    fn test_ranged_rule_default_note() {
        let rule = DosingRule {
            notes: None,
            ..DosingRule::ranged("")
        };
        let result = compute_dose(10.0, &rule, &[]);
        assert_eq!(
            result.dose,
            DoseValue::Unavailable(RANGED_RULE_NOTE.to_string())
        );
    }

    #[test]
    fn test_fixed_rule_uses_min_dose_slot() {
        let rule = DosingRule {
            max_dose_mg: Some(1000.0),
            ..DosingRule::fixed(500.0)
        };
        assert_eq!(dose_of(&compute_dose(3.0, &rule, &[])), 500.0);
        assert_eq!(dose_of(&compute_dose(80.0, &rule, &[])), 500.0);
    }

    #[test]
    fn test_incomplete_rules_are_unavailable() {
        let missing_mg_per_kg = DosingRule {
            mg_per_kg: None,
            ..DosingRule::per_kg(1.0)
        };
        let result = compute_dose(10.0, &missing_mg_per_kg, &[]);
        assert_eq!(
            result.dose,
            DoseValue::Unavailable(UNDEFINED_RULE_NOTE.to_string())
        );

        let fixed_without_value = DosingRule {
            min_dose_mg: None,
            notes: Some("ask pharmacy".into()),
            ..DosingRule::fixed(1.0)
        };
        let result = compute_dose(10.0, &fixed_without_value, &[]);
        assert_eq!(result.dose, DoseValue::Unavailable("ask pharmacy".into()));
    }

    #[test]
    fn test_unknown_basis_deserializes_and_is_unavailable() {
        let rule: DosingRule =
            serde_json::from_str(r#"{"basis": "mg_per_m2", "per_dose": true}"#).unwrap();
        assert_eq!(rule.basis, DosingBasis::Unknown);
        assert!(!compute_dose(10.0, &rule, &[]).dose.is_available());
    }

    #[test]
    fn test_max_daily_is_informational() {
        let rule = DosingRule {
            max_daily_mg_per_kg: Some(60.0),
            ..DosingRule::per_kg(15.0)
        };
        let result = compute_dose(10.0, &rule, &[]);
        assert_eq!(dose_of(&result), 150.0);
        assert_eq!(result.max_daily_mg, Some(600.0));
    }

    #[test]
    fn test_descriptive_fields_pass_through() {
        let rule = DosingRule {
            route: Some("IV".into()),
            frequency_text: Some("every 6 h".into()),
            notes: Some("slow push".into()),
            ..DosingRule::per_kg(1.0)
        };
        let result = compute_dose(4.0, &rule, &[]);
        assert_eq!(result.route.as_deref(), Some("IV"));
        assert_eq!(result.frequency.as_deref(), Some("every 6 h"));
        assert_eq!(result.note.as_deref(), Some("slow push"));
    }

    #[test]
    fn test_invalid_weight_is_unavailable() {
        let rule = DosingRule::per_kg(1.0);
        for weight in [0.0, -3.0, f64::NAN, f64::INFINITY] {
            assert!(!compute_dose(weight, &rule, &[]).dose.is_available());
        }
    }

    #[test]
    fn test_rule_deserializes_from_json() {
        let json = r#"{
            "basis": "mg_per_kg",
            "mg_per_kg": 15,
            "per_dose": true,
            "max_dose_mg": 1000,
            "max_daily_mg_per_kg": 60,
            "frequency_text": "q6h",
            "route": "PO"
        }"#;
        let rule: DosingRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.basis, DosingBasis::PerKilogram);
        assert_eq!(rule.mg_per_kg, Some(15.0));
        assert_eq!(dose_of(&compute_dose(80.0, &rule, &[])), 1000.0);
    }
}
