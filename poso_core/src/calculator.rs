//! Drug dose calculation for a patient.
//!
//! Combines the pieces a dose card needs: species rule selection, rule
//! evaluation, unit normalization, the unit family check and the volume
//! conversion, plus the safety warnings shown next to the result.

use crate::catalog::DrugEntry;
use crate::config::SafetyConfig;
use crate::dosing::{compute_dose, DoseResult};
use crate::patient::Species;
use crate::units::{format_per_kg_unit, normalize_unit, strip_per_kg};
use crate::volume::{check_unit_compatibility, volume_from_dose};
use std::fmt;

/// Why a drug could not be calculated at all
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalcError {
    #[error("No dosing rule for '{drug_id}' (species: {species})")]
    NoRule { drug_id: String, species: String },

    #[error("{0}")]
    UnitMismatch(String),
}

/// Warning attached to a computed dose
#[derive(Debug, Clone, PartialEq)]
pub enum DoseWarning {
    /// Volume too small to draw up accurately
    LowVolume { volume_ml: f64, threshold_ml: f64 },
    /// The rule's ceiling was reached
    AtMaximumDose { max_dose: f64 },
    /// Drug flagged as high alert
    HighAlert,
    /// Stock concentration must be confirmed before a volume is shown
    ConcentrationUnconfirmed,
    /// Drug-specific warning text
    Drug(String),
}

impl fmt::Display for DoseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoseWarning::LowVolume {
                volume_ml,
                threshold_ml,
            } => write!(
                f,
                "Volume {:.3} mL is below {} mL: dilute before administration",
                volume_ml, threshold_ml
            ),
            DoseWarning::AtMaximumDose { max_dose } => {
                write!(f, "Dose capped at the maximum of {}", max_dose)
            }
            DoseWarning::HighAlert => write!(f, "High-alert drug: double-check before administration"),
            DoseWarning::ConcentrationUnconfirmed => {
                write!(f, "Concentration varies: confirm it to compute a volume")
            }
            DoseWarning::Drug(text) => write!(f, "{}", text),
        }
    }
}

/// Everything needed to display one drug's dose
#[derive(Debug, Clone, PartialEq)]
pub struct DoseCalculation {
    pub drug_id: String,
    pub drug_name: String,
    pub weight_kg: f64,
    pub species: Option<Species>,
    pub result: DoseResult,
    /// Per-kilogram factor of the rule, with its unit ("2 mg/kg")
    pub per_kg: Option<(f64, String)>,
    /// Canonical unit of `result.dose`
    pub dose_unit: String,
    /// Volume (mL), or infusion rate (mL/h) for rate rules
    pub volume: Option<f64>,
    pub volume_unit: &'static str,
    pub warnings: Vec<DoseWarning>,
}

/// Compute the dose of `drug` for a patient
///
/// `concentration_confirmed` unlocks the volume for drugs whose stock
/// concentration varies.
pub fn calculate(
    drug: &DrugEntry,
    weight_kg: f64,
    species: Option<Species>,
    concentration_confirmed: bool,
    safety: &SafetyConfig,
) -> Result<DoseCalculation, CalcError> {
    let drug_rule = drug
        .dosage
        .rule_for(species)
        .ok_or_else(|| CalcError::NoRule {
            drug_id: drug.id.clone(),
            species: species.map(|s| s.to_string()).unwrap_or_else(|| "any".into()),
        })?;

    let dose_unit = strip_per_kg(&drug_rule.dose_unit);
    let concentration_unit = normalize_unit(&drug.concentration_unit);
    if let Some(message) = check_unit_compatibility(&dose_unit, &concentration_unit) {
        return Err(CalcError::UnitMismatch(message));
    }

    let result = compute_dose(weight_kg, &drug_rule.rule, &drug_rule.overrides);
    tracing::debug!("{} for {} kg: {:?}", drug.id, weight_kg, result.dose);

    let mut warnings = Vec::new();

    let needs_confirmation = drug.requires_concentration_confirmation() && !concentration_confirmed;
    let volume = if needs_confirmation {
        warnings.push(DoseWarning::ConcentrationUnconfirmed);
        None
    } else {
        volume_from_dose(result.dose.value(), drug.concentration_per_ml)
    };

    let threshold_ml = drug.guardrails.min_volume_ml.unwrap_or(safety.min_volume_ml);
    if let Some(v) = volume {
        if drug_rule.rule.per_dose && v > 0.0 && v < threshold_ml {
            warnings.push(DoseWarning::LowVolume {
                volume_ml: v,
                threshold_ml,
            });
        }
    }

    if let (Some(dose), Some(max)) = (result.dose.value(), drug_rule.rule.max_dose_mg) {
        if dose >= max {
            warnings.push(DoseWarning::AtMaximumDose { max_dose: max });
        }
    }

    if drug.is_high_alert {
        warnings.push(DoseWarning::HighAlert);
    }
    if let Some(text) = &drug.guardrails.warning {
        warnings.push(DoseWarning::Drug(text.clone()));
    }

    let per_kg = drug_rule
        .rule
        .mg_per_kg
        .map(|factor| (factor, format_per_kg_unit(&dose_unit)));

    Ok(DoseCalculation {
        drug_id: drug.id.clone(),
        drug_name: drug.name.clone(),
        weight_kg,
        species,
        result,
        per_kg,
        dose_unit,
        volume,
        volume_unit: if drug_rule.rule.per_dose { "mL" } else { "mL/h" },
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{build_default_catalog, DrugRule};
    use crate::dosing::{DoseSource, DosingRule};

    fn safety() -> SafetyConfig {
        SafetyConfig::default()
    }

    #[test]
    fn test_ketamine_dose_and_volume() {
        let catalog = build_default_catalog();
        let ketamine = catalog.get("ketamine").unwrap();

        let calc = calculate(ketamine, 10.0, Some(Species::Dog), false, &safety()).unwrap();
        assert_eq!(calc.result.dose.value(), Some(20.0));
        assert_eq!(calc.volume, Some(0.4));
        assert_eq!(calc.dose_unit, "mg");
        assert_eq!(calc.per_kg, Some((2.0, "mg/kg".to_string())));
        assert!(calc.warnings.contains(&DoseWarning::HighAlert));
    }

    #[test]
    fn test_override_band_used() {
        let catalog = build_default_catalog();
        let diazepam = catalog.get("diazepam").unwrap();

        let calc = calculate(diazepam, 3.0, None, false, &safety()).unwrap();
        assert_eq!(calc.result.source, DoseSource::Override);
        assert_eq!(calc.result.dose.value(), Some(2.0));
        assert_eq!(calc.volume, Some(0.4));
    }

    #[test]
    fn test_max_dose_warning() {
        let catalog = build_default_catalog();
        let cefazolin = catalog.get("cefazolin").unwrap();

        let calc = calculate(cefazolin, 60.0, None, false, &safety()).unwrap();
        assert_eq!(calc.result.dose.value(), Some(1000.0));
        assert_eq!(calc.result.max_daily_mg, Some(3960.0));
        assert!(calc
            .warnings
            .contains(&DoseWarning::AtMaximumDose { max_dose: 1000.0 }));
    }

    #[test]
    fn test_low_volume_warning_uses_drug_threshold() {
        let catalog = build_default_catalog();
        let adrenaline = catalog.get("adrenaline").unwrap();

        // 3 kg -> 0.03 mg -> 0.03 mL, below the drug's 0.05 mL threshold
        let calc = calculate(adrenaline, 3.0, None, false, &safety()).unwrap();
        let low = calc
            .warnings
            .iter()
            .any(|w| matches!(w, DoseWarning::LowVolume { threshold_ml, .. } if *threshold_ml == 0.05));
        assert!(low, "warnings: {:?}", calc.warnings);

        // 10 kg -> 0.1 mL, fine
        let calc = calculate(adrenaline, 10.0, None, false, &safety()).unwrap();
        assert!(!calc
            .warnings
            .iter()
            .any(|w| matches!(w, DoseWarning::LowVolume { .. })));
    }

    #[test]
    fn test_ranged_rule_has_no_volume() {
        let catalog = build_default_catalog();
        let salbutamol = catalog.get("salbutamol").unwrap();

        let calc = calculate(salbutamol, 15.0, None, false, &safety()).unwrap();
        assert!(!calc.result.dose.is_available());
        assert_eq!(calc.volume, None);
        assert_eq!(calc.per_kg, None);
    }

    #[test]
    fn test_concentration_confirmation_gates_volume() {
        let catalog = build_default_catalog();
        let insulin = catalog.get("insulin_regular").unwrap();

        let unconfirmed = calculate(insulin, 20.0, None, false, &safety()).unwrap();
        assert_eq!(unconfirmed.volume, None);
        assert!(unconfirmed
            .warnings
            .contains(&DoseWarning::ConcentrationUnconfirmed));
        assert_eq!(unconfirmed.dose_unit, "UI/h");
        assert_eq!(unconfirmed.per_kg, Some((0.1, "UI/kg/h".to_string())));

        let confirmed = calculate(insulin, 20.0, None, true, &safety()).unwrap();
        assert_eq!(confirmed.volume, Some(2.0));
        assert_eq!(confirmed.volume_unit, "mL/h");
    }

    #[test]
    fn test_mequivalent_dose_against_mmol_concentration_fails() {
        let mut drug = build_default_catalog().get("potassium_phosphate").unwrap().clone();
        drug.dosage.common = Some(DrugRule {
            dose_unit: "mEq/kg".into(),
            ..DrugRule::new(DosingRule::per_kg(0.5))
        });

        let result = calculate(&drug, 10.0, None, false, &safety());
        assert!(matches!(result, Err(CalcError::UnitMismatch(_))));
    }

    #[test]
    fn test_bicarbonate_in_mequivalents() {
        let catalog = build_default_catalog();
        let bicarbonate = catalog.get("sodium_bicarbonate").unwrap();

        let calc = calculate(bicarbonate, 8.0, Some(Species::Cat), false, &safety()).unwrap();
        assert_eq!(calc.dose_unit, "mEq");
        assert_eq!(calc.volume, Some(8.0));
        assert_eq!(calc.per_kg, Some((1.0, "mEq/kg".to_string())));
        assert!(calc
            .warnings
            .iter()
            .any(|w| matches!(w, DoseWarning::Drug(text) if text.contains("calcium"))));
    }

    #[test]
    fn test_missing_species_rule() {
        let mut drug = build_default_catalog().get("meloxicam").unwrap().clone();
        drug.dosage.cat = None;

        let result = calculate(&drug, 4.0, Some(Species::Cat), false, &safety());
        assert_eq!(
            result.unwrap_err(),
            CalcError::NoRule {
                drug_id: "meloxicam".into(),
                species: "cat".into()
            }
        );
    }
}
