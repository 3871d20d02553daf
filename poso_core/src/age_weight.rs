//! Age <-> weight estimation for pre-filling patient data.
//!
//! These estimates only ever supply a default weight or age when the user
//! has not entered one. They are never used as a dosing input on their own.

use crate::Error;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reference growth points (months, kg)
const TABLE_POINTS: [(f64, f64); 19] = [
    (0.0, 3.0),
    (3.0, 6.0),
    (6.0, 7.5),
    (9.0, 9.0),
    (12.0, 10.0),
    (24.0, 12.0),
    (36.0, 14.0),
    (48.0, 16.0),
    (60.0, 18.0),
    (72.0, 20.0),
    (84.0, 22.0),
    (96.0, 24.0),
    (108.0, 26.0),
    (120.0, 30.0),
    (132.0, 34.0),
    (144.0, 38.0),
    (156.0, 42.0),
    (168.0, 46.0),
    (180.0, 50.0),
];

const MAX_MONTHS: f64 = 180.0;
const MIN_WEIGHT_KG: f64 = 1.0;
const MAX_WEIGHT_KG: f64 = 50.0;

static MONTHS_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s*(?:mois|months?)\b").expect("months pattern is valid")
});
static YEARS_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s*(?:ans?|years?)\b").expect("years pattern is valid")
});

/// Which estimation function to use
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgeWeightModel {
    /// Piecewise-linear interpolation over reference points
    #[default]
    Table,
    /// APLS closed-form approximation
    Apls,
}

impl FromStr for AgeWeightModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "table" => Ok(AgeWeightModel::Table),
            "apls" => Ok(AgeWeightModel::Apls),
            other => Err(Error::Other(format!(
                "Unknown age/weight model '{}' (expected 'table' or 'apls')",
                other
            ))),
        }
    }
}

impl fmt::Display for AgeWeightModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgeWeightModel::Table => write!(f, "table"),
            AgeWeightModel::Apls => write!(f, "apls"),
        }
    }
}

fn round_to_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn clamp_months(months: f64) -> f64 {
    if months.is_nan() {
        0.0
    } else {
        months.clamp(0.0, MAX_MONTHS)
    }
}

fn clamp_weight(kg: f64) -> f64 {
    if kg.is_nan() {
        MIN_WEIGHT_KG
    } else {
        kg.clamp(MIN_WEIGHT_KG, MAX_WEIGHT_KG)
    }
}

fn table_weight(months: f64) -> f64 {
    let m = clamp_months(months);
    for pair in TABLE_POINTS.windows(2) {
        let ((m1, w1), (m2, w2)) = (pair[0], pair[1]);
        if m >= m1 && m <= m2 {
            let t = (m - m1) / (m2 - m1);
            return round_to_tenth(w1 + t * (w2 - w1));
        }
    }
    TABLE_POINTS[TABLE_POINTS.len() - 1].1
}

fn apls_weight(months: f64) -> f64 {
    let years = clamp_months(months) / 12.0;
    if years < 1.0 {
        round_to_tenth(3.0 + 7.0 * years)
    } else if years <= 6.0 {
        (2.0 * years + 8.0).round()
    } else {
        (3.0 * years + 7.0).round()
    }
}

/// Expected weight (kg) for an age in months, clamped to [1, 50] kg
pub fn estimate_weight_from_age(months: f64, model: AgeWeightModel) -> f64 {
    let weight = match model {
        AgeWeightModel::Table => table_weight(months),
        AgeWeightModel::Apls => apls_weight(months),
    };
    clamp_weight(weight)
}

fn table_age(kg: f64) -> f64 {
    let first = TABLE_POINTS[0];
    if kg < first.1 {
        return first.0;
    }
    for pair in TABLE_POINTS.windows(2) {
        let ((m1, w1), (m2, w2)) = (pair[0], pair[1]);
        let bracketed = (kg >= w1 && kg <= w2) || (kg >= w2 && kg <= w1);
        if bracketed && w1 != w2 {
            let t = (kg - w1) / (w2 - w1);
            return m1 + t * (m2 - m1);
        }
    }
    MAX_MONTHS
}

fn apls_age(kg: f64) -> f64 {
    if kg < 10.0 {
        (kg - 3.0) / 7.0 * 12.0
    } else if kg <= 20.0 {
        (kg - 8.0) / 2.0 * 12.0
    } else {
        (kg - 7.0) / 3.0 * 12.0
    }
}

/// Expected age (whole months) for a weight, inverse of [`estimate_weight_from_age`]
pub fn estimate_age_from_weight(kg: f64, model: AgeWeightModel) -> u32 {
    let w = clamp_weight(kg);
    let months = match model {
        AgeWeightModel::Table => table_age(w),
        AgeWeightModel::Apls => apls_age(w),
    };
    months.round().max(0.0) as u32
}

/// Parse an age label ("nouveau-né", "10 mois", "2 ans", "18 months") into months
///
/// Returns `None` when nothing is recognised or the total does not fit in `u32`.
pub fn parse_age_label(label: &str) -> Option<u32> {
    let lower = label.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    if lower.contains("nouveau") || lower.contains("newborn") {
        return Some(0);
    }

    let capture = |re: &Regex| -> Option<u32> {
        re.captures(&lower).and_then(|c| c[1].parse::<u32>().ok())
    };
    let months = capture(&MONTHS_LABEL);
    let years = capture(&YEARS_LABEL);

    match (years, months) {
        (None, None) => None,
        (y, m) => y
            .unwrap_or(0)
            .checked_mul(12)
            .and_then(|months_from_years| months_from_years.checked_add(m.unwrap_or(0))),
    }
}

/// Indicative age band for a weight, for display next to a weight input
pub fn age_band_for_weight(kg: f64) -> &'static str {
    if kg.is_nan() {
        return "Unknown age";
    }
    let w = kg.max(0.0);
    match w {
        w if w < 4.0 => "Newborn",
        w if w < 6.0 => "1-2 months",
        w if w < 8.0 => "3-5 months",
        w if w < 10.0 => "6-8 months",
        w if w < 12.0 => "9-12 months",
        w if w < 14.0 => "12-18 months",
        w if w < 18.0 => "2-3 years",
        w if w < 22.0 => "4-5 years",
        w if w < 30.0 => "6-8 years",
        w if w < 40.0 => "9-11 years",
        w if w < 50.0 => "12-13 years",
        _ => "14 years and over",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_reference_points() {
        assert_eq!(estimate_weight_from_age(0.0, AgeWeightModel::Table), 3.0);
        assert_eq!(estimate_weight_from_age(12.0, AgeWeightModel::Table), 10.0);
        assert_eq!(estimate_weight_from_age(180.0, AgeWeightModel::Table), 50.0);
    }

    #[test]
    fn test_table_interpolates() {
        // halfway between 24 (12 kg) and 36 (14 kg)
        assert_eq!(estimate_weight_from_age(30.0, AgeWeightModel::Table), 13.0);
        // 1/3 of the way from 0 (3 kg) to 3 (6 kg)
        assert_eq!(estimate_weight_from_age(1.0, AgeWeightModel::Table), 4.0);
    }

    #[test]
    fn test_table_clamps_months() {
        assert_eq!(
            estimate_weight_from_age(-50.0, AgeWeightModel::Table),
            estimate_weight_from_age(0.0, AgeWeightModel::Table)
        );
        assert_eq!(
            estimate_weight_from_age(9999.0, AgeWeightModel::Table),
            estimate_weight_from_age(180.0, AgeWeightModel::Table)
        );
    }

    #[test]
    fn test_apls_bands() {
        assert_eq!(estimate_weight_from_age(6.0, AgeWeightModel::Apls), 6.5);
        assert_eq!(estimate_weight_from_age(24.0, AgeWeightModel::Apls), 12.0);
        assert_eq!(estimate_weight_from_age(120.0, AgeWeightModel::Apls), 37.0);
        // 15 years -> 52 kg, clamped
        assert_eq!(estimate_weight_from_age(180.0, AgeWeightModel::Apls), 50.0);
    }

    #[test]
    fn test_apls_round_trip() {
        for months in [6.0, 24.0, 60.0, 120.0] {
            let weight = estimate_weight_from_age(months, AgeWeightModel::Apls);
            let back = estimate_age_from_weight(weight, AgeWeightModel::Apls) as f64;
            assert!(
                (back - months).abs() <= 1.0,
                "{} months -> {} kg -> {} months",
                months,
                weight,
                back
            );
        }
    }

    #[test]
    fn test_table_inverse() {
        assert_eq!(estimate_age_from_weight(13.0, AgeWeightModel::Table), 30);
        assert_eq!(estimate_age_from_weight(10.0, AgeWeightModel::Table), 12);
        assert_eq!(estimate_age_from_weight(50.0, AgeWeightModel::Table), 180);
        assert_eq!(estimate_age_from_weight(500.0, AgeWeightModel::Table), 180);
    }

    #[test]
    fn test_table_inverse_below_first_point() {
        assert_eq!(estimate_age_from_weight(1.5, AgeWeightModel::Table), 0);
        assert_eq!(estimate_age_from_weight(-4.0, AgeWeightModel::Table), 0);
    }

    #[test]
    fn test_apls_inverse_never_negative() {
        assert_eq!(estimate_age_from_weight(1.0, AgeWeightModel::Apls), 0);
    }

    #[test]
    fn test_model_from_str() {
        assert_eq!("APLS".parse::<AgeWeightModel>().unwrap(), AgeWeightModel::Apls);
        assert_eq!(" table ".parse::<AgeWeightModel>().unwrap(), AgeWeightModel::Table);
        assert!("broselow".parse::<AgeWeightModel>().is_err());
    }

    #[test]
    fn test_parse_age_label() {
        assert_eq!(parse_age_label("Nouveau-né"), Some(0));
        assert_eq!(parse_age_label("10 mois"), Some(10));
        assert_eq!(parse_age_label("1 an"), Some(12));
        assert_eq!(parse_age_label("2 ans"), Some(24));
        assert_eq!(parse_age_label("18 months"), Some(18));
        assert_eq!(parse_age_label("3 years"), Some(36));
        assert_eq!(parse_age_label("1 an 6 mois"), Some(18));
        assert_eq!(parse_age_label("adult"), None);
        assert_eq!(parse_age_label(""), None);
    }

    #[test]
    fn test_parse_age_label_out_of_range() {
        assert_eq!(parse_age_label("400000000 ans"), None);
        assert_eq!(parse_age_label("357913942 ans"), None);
        assert_eq!(parse_age_label("357913941 ans"), Some(4_294_967_292));
        assert_eq!(parse_age_label("357913941 ans 4 mois"), None);
        assert_eq!(parse_age_label("99999999999 mois"), None);
        assert_eq!(parse_age_label("100 ans"), Some(1200));
    }

    #[test]
    fn test_age_band_for_weight() {
        assert_eq!(age_band_for_weight(3.2), "Newborn");
        assert_eq!(age_band_for_weight(15.0), "2-3 years");
        assert_eq!(age_band_for_weight(70.0), "14 years and over");
        assert_eq!(age_band_for_weight(f64::NAN), "Unknown age");
    }
}
