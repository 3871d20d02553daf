//! Concentration / volume conversion.
//!
//! Converts a mass dose into an administration volume given the drug
//! concentration, and refuses to divide across incompatible amount units.

use crate::units::{normalize_unit, unit_family, UnitFamily};

/// Administration volume (mL) for a dose at a given concentration (per mL)
///
/// Returns `None` unless both values are present and finite and the
/// concentration is strictly positive. No rounding is applied.
pub fn volume_from_dose(dose_mg: Option<f64>, concentration_mg_per_ml: Option<f64>) -> Option<f64> {
    let dose = dose_mg.filter(|d| d.is_finite())?;
    let concentration = concentration_mg_per_ml.filter(|c| c.is_finite() && *c > 0.0)?;
    Some(dose / concentration)
}

/// Infusion rate (mL/h) for an hourly dose at a given concentration
pub fn rate_ml_per_h(dose_per_h: Option<f64>, concentration_per_ml: Option<f64>) -> Option<f64> {
    volume_from_dose(dose_per_h, concentration_per_ml)
}

fn family_label(family: UnitFamily) -> &'static str {
    match family {
        UnitFamily::MilliEquivalent => "mEq",
        UnitFamily::Millimole => "mmol",
    }
}

/// Check that a dose unit can be divided by a concentration unit
///
/// Returns a message when both units belong to a recognized amount family
/// (mEq, mmol) and the families differ. Units without a family are not
/// checked.
pub fn check_unit_compatibility(dose_unit: &str, concentration_unit: &str) -> Option<String> {
    let dose_family = unit_family(dose_unit)?;
    let concentration_family = unit_family(concentration_unit)?;
    if dose_family == concentration_family {
        return None;
    }

    tracing::warn!(
        "Unit mismatch: dose in {} but concentration in {}",
        dose_unit,
        concentration_unit
    );
    Some(format!(
        "Incompatible units: dose is expressed in {} ({}) but the concentration is in {} ({}); convert explicitly before computing a volume",
        family_label(dose_family),
        normalize_unit(dose_unit),
        family_label(concentration_family),
        normalize_unit(concentration_unit),
    ))
}
