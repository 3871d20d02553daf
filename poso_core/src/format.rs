//! Display helpers.
//!
//! Unavailable or missing numbers always render as a neutral placeholder,
//! never as `NaN` or `0`.

use crate::dosing::DoseValue;

/// Placeholder for values that cannot be shown
pub const PLACEHOLDER: &str = "—";

/// Format with at most `digits` decimals, trimming trailing zeros
pub fn format_number(value: Option<f64>, digits: usize) -> String {
    format_number_or(value, digits, PLACEHOLDER)
}

/// [`format_number`] with a custom placeholder
pub fn format_number_or(value: Option<f64>, digits: usize, placeholder: &str) -> String {
    match value {
        Some(v) if v.is_finite() => {
            let s = format!("{:.*}", digits, v);
            if s.contains('.') {
                s.trim_end_matches('0').trim_end_matches('.').to_string()
            } else {
                s
            }
        }
        _ => placeholder.to_string(),
    }
}

/// `"12.5 mg"`, or the placeholder alone when there is no value
pub fn unit_line(value: Option<f64>, unit: &str, digits: usize) -> String {
    match value {
        Some(v) if v.is_finite() => {
            let number = format_number(Some(v), digits);
            if unit.is_empty() {
                number
            } else {
                format!("{} {}", number, unit)
            }
        }
        _ => PLACEHOLDER.to_string(),
    }
}

/// Mass in the most readable unit: µg below 1 mg, mg otherwise
pub fn format_mg(mg: f64) -> String {
    if !mg.is_finite() {
        return PLACEHOLDER.to_string();
    }
    if mg < 1.0 {
        return format!("{} µg", (mg * 1000.0).round());
    }
    let digits = if mg < 10.0 { 2 } else { 1 };
    format!("{} mg", format_number(Some(mg), digits))
}

/// A dose value with its unit, or the placeholder
pub fn format_dose(dose: &DoseValue, unit: &str, digits: usize) -> String {
    unit_line(dose.value(), unit, digits)
}
