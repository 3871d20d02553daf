#![forbid(unsafe_code)]

//! Dose-computation engine for the poso clinical dosage reference.
//!
//! This crate provides:
//! - Unit label normalization
//! - Dosing rule evaluation with weight-band overrides
//! - Concentration/volume conversion with unit family checks
//! - Weight-keyed posology table lookup
//! - Age/weight estimation models
//! - Drug catalog, patient context and configuration

pub mod error;
pub mod config;
pub mod logging;
pub mod units;
pub mod dosing;
pub mod volume;
pub mod posology;
pub mod age_weight;
pub mod patient;
pub mod catalog;
pub mod calculator;
pub mod format;

// Re-export commonly used types
pub use error::{Error, Result};
pub use config::Config;
pub use units::{format_per_kg_unit, normalize_unit};
pub use dosing::{
    compute_dose, DoseResult, DoseSource, DoseValue, DosingBasis, DosingRule, WeightOverride,
};
pub use volume::{check_unit_compatibility, volume_from_dose};
pub use posology::{
    find_entry_by_weight, load_posology, section_entries, DoseCommon, PosologyTable,
    PosologyWeightEntry,
};
pub use age_weight::{estimate_age_from_weight, estimate_weight_from_age, AgeWeightModel};
pub use patient::{JsonFileStore, MemoryStore, PatientContext, PatientStore, Species};
pub use catalog::{default_catalog, DrugCatalog, DrugEntry};
pub use calculator::{calculate, CalcError, DoseCalculation, DoseWarning};
