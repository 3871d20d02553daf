//! Drug catalog: dosing rules and override bands per drug and species.
//!
//! Catalogs come from a JSON document, optionally refreshed from CSV
//! exports of the rule and override tables. A small built-in catalog is
//! available for demonstrations and tests.

use crate::dosing::{overlapping_overrides, DosingBasis, DosingRule, WeightOverride};
use crate::patient::Species;
use crate::{Error, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Cached built-in catalog
static DEFAULT_CATALOG: Lazy<DrugCatalog> = Lazy::new(build_default_catalog);

/// Get a reference to the cached built-in catalog
pub fn default_catalog() -> &'static DrugCatalog {
    &DEFAULT_CATALOG
}

fn default_unit() -> String {
    "mg".to_string()
}

/// A dosing rule for one species, with its dose unit and exception bands
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DrugRule {
    #[serde(flatten)]
    pub rule: DosingRule,

    /// Amount unit of the computed dose ("mg", "mEq", "UI")
    #[serde(default = "default_unit")]
    pub dose_unit: String,

    #[serde(default)]
    pub overrides: Vec<WeightOverride>,
}

impl DrugRule {
    pub fn new(rule: DosingRule) -> Self {
        Self {
            rule,
            dose_unit: default_unit(),
            overrides: Vec::new(),
        }
    }
}

/// Rules by species, `common` applying to any species without its own
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DrugDosage {
    #[serde(default)]
    pub common: Option<DrugRule>,
    #[serde(default, alias = "canine")]
    pub dog: Option<DrugRule>,
    #[serde(default, alias = "feline")]
    pub cat: Option<DrugRule>,
}

impl DrugDosage {
    /// Rule for a species, falling back to `common`
    ///
    /// Without a species, `common` is used first and then the dog rule.
    pub fn rule_for(&self, species: Option<Species>) -> Option<&DrugRule> {
        let specific = match species {
            Some(Species::Dog) => self.dog.as_ref(),
            Some(Species::Cat) => self.cat.as_ref(),
            None => None,
        };
        specific
            .or(self.common.as_ref())
            .or_else(|| if species.is_none() { self.dog.as_ref() } else { None })
    }

    fn slot_mut(&mut self, species: Option<Species>) -> &mut Option<DrugRule> {
        match species {
            Some(Species::Dog) => &mut self.dog,
            Some(Species::Cat) => &mut self.cat,
            None => &mut self.common,
        }
    }

    fn labelled(&self) -> Vec<(&'static str, &DrugRule)> {
        [
            ("common", self.common.as_ref()),
            ("dog", self.dog.as_ref()),
            ("cat", self.cat.as_ref()),
        ]
        .into_iter()
        .filter_map(|(label, rule)| rule.map(|r| (label, r)))
        .collect()
    }
}

/// Safety annotations shown next to a computed dose
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SafetyGuardrails {
    #[serde(default)]
    pub warning: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub contraindications: Vec<String>,
    /// Per-drug override of the minimum drawable volume
    #[serde(default)]
    pub min_volume_ml: Option<f64>,
    #[serde(default)]
    pub requires_concentration_confirmation: Option<bool>,
}

/// One drug of the catalog
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DrugEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub concentration_label: String,
    /// Amount of `concentration_unit` per mL
    #[serde(default)]
    pub concentration_per_ml: Option<f64>,
    #[serde(default = "default_unit")]
    pub concentration_unit: String,
    #[serde(default)]
    pub is_high_alert: bool,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub dosage: DrugDosage,
    #[serde(default)]
    pub guardrails: SafetyGuardrails,
}

impl DrugEntry {
    /// Whether the stock concentration must be confirmed before a volume is shown
    ///
    /// Explicit flag first; otherwise any label mentioning a variable
    /// concentration requires confirmation.
    pub fn requires_concentration_confirmation(&self) -> bool {
        self.guardrails
            .requires_concentration_confirmation
            .unwrap_or_else(|| self.concentration_label.to_lowercase().contains("variable"))
    }
}

/// On-disk catalog layout
#[derive(Debug, Deserialize)]
struct CatalogFile {
    drugs: Vec<DrugEntry>,
}

/// A row of the rules table export
#[derive(Debug, Deserialize)]
struct RuleRow {
    drug_id: String,
    #[serde(default)]
    species: String,
    basis: DosingBasis,
    mg_per_kg: Option<f64>,
    per_dose: Option<bool>,
    min_dose_mg: Option<f64>,
    max_dose_mg: Option<f64>,
    max_daily_mg_per_kg: Option<f64>,
    rounding_step_mg: Option<f64>,
    frequency_text: Option<String>,
    route: Option<String>,
    notes: Option<String>,
    dose_unit: Option<String>,
}

/// A row of the override bands table export
#[derive(Debug, Deserialize)]
struct OverrideRow {
    drug_id: String,
    #[serde(default)]
    species: String,
    min_kg: f64,
    max_kg: f64,
    dose_mg: f64,
    note: Option<String>,
}

/// Empty or "common" means no specific species
fn parse_species_column(value: &str) -> Result<Option<Species>> {
    match value.trim().to_lowercase().as_str() {
        "" | "common" | "all" => Ok(None),
        other => other.parse::<Species>().map(Some),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// The drug catalog, keyed by drug id
#[derive(Clone, Debug, Default)]
pub struct DrugCatalog {
    pub drugs: BTreeMap<String, DrugEntry>,
}

impl DrugCatalog {
    /// Build a catalog from entries, rejecting duplicate ids
    pub fn from_entries(entries: Vec<DrugEntry>) -> Result<Self> {
        let mut drugs = BTreeMap::new();
        for entry in entries {
            let id = entry.id.clone();
            if drugs.insert(id.clone(), entry).is_some() {
                return Err(Error::CatalogValidation(format!("Duplicate drug id '{}'", id)));
            }
        }
        Ok(Self { drugs })
    }

    /// Load a catalog from a JSON document `{"drugs": [...]}`
    pub fn load_json(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let file: CatalogFile = serde_json::from_str(&contents)?;
        let catalog = Self::from_entries(file.drugs)?;
        tracing::info!("Loaded {} drugs from {:?}", catalog.drugs.len(), path);
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<&DrugEntry> {
        self.drugs.get(id)
    }

    /// Replace dosing rules from a rules-table CSV export
    ///
    /// Rows for unknown drugs are skipped with a warning. Returns the number
    /// of rules applied. When an overrides CSV is given, its bands are
    /// attached to the matching (drug, species) rule afterwards.
    pub fn apply_rules_csv(&mut self, rules_path: &Path, overrides_path: Option<&Path>) -> Result<usize> {
        let mut reader = csv::Reader::from_path(rules_path)?;
        let mut applied = 0;

        for row in reader.deserialize::<RuleRow>() {
            let row = row?;
            let species = parse_species_column(&row.species)?;
            let Some(drug) = self.drugs.get_mut(&row.drug_id) else {
                tracing::warn!("Rule for unknown drug '{}' skipped", row.drug_id);
                continue;
            };

            let rule = DosingRule {
                basis: row.basis,
                mg_per_kg: row.mg_per_kg,
                per_dose: row.per_dose.unwrap_or(true),
                min_dose_mg: row.min_dose_mg,
                max_dose_mg: row.max_dose_mg,
                max_daily_mg_per_kg: row.max_daily_mg_per_kg,
                rounding_step_mg: row.rounding_step_mg,
                frequency_text: non_empty(row.frequency_text),
                route: non_empty(row.route),
                notes: non_empty(row.notes),
            };
            *drug.dosage.slot_mut(species) = Some(DrugRule {
                rule,
                dose_unit: non_empty(row.dose_unit).unwrap_or_else(default_unit),
                overrides: Vec::new(),
            });
            applied += 1;
        }

        if let Some(path) = overrides_path {
            let mut reader = csv::Reader::from_path(path)?;
            for row in reader.deserialize::<OverrideRow>() {
                let row = row?;
                let species = parse_species_column(&row.species)?;
                let slot = self
                    .drugs
                    .get_mut(&row.drug_id)
                    .and_then(|drug| drug.dosage.slot_mut(species).as_mut());
                match slot {
                    Some(rule) => rule.overrides.push(WeightOverride {
                        min_kg: row.min_kg,
                        max_kg: row.max_kg,
                        dose_mg: row.dose_mg,
                        note: non_empty(row.note),
                    }),
                    None => tracing::warn!(
                        "Override band for '{}' ({}) has no rule to attach to",
                        row.drug_id,
                        row.species
                    ),
                }
            }
        }

        tracing::info!("Applied {} dosing rules from {:?}", applied, rules_path);
        Ok(applied)
    }

    /// Validate the catalog for consistency
    ///
    /// Returns a list of validation errors, or an empty Vec if valid.
    /// Overlapping override bands are resolved first-match-wins at dose
    /// time; they are reported as errors only in `strict` mode and logged
    /// as warnings otherwise.
    pub fn validate(&self, strict: bool) -> Vec<String> {
        let mut errors = Vec::new();

        for (id, drug) in &self.drugs {
            if id.is_empty() || drug.id.is_empty() {
                errors.push("Drug has empty ID".to_string());
            }
            if id != &drug.id {
                errors.push(format!("Drug key '{}' doesn't match drug.id '{}'", id, drug.id));
            }
            if drug.name.is_empty() {
                errors.push(format!("Drug '{}' has empty name", id));
            }
            if let Some(c) = drug.concentration_per_ml {
                if !c.is_finite() || c <= 0.0 {
                    errors.push(format!("Drug '{}': concentration {} is not positive", id, c));
                }
            }

            let rules = drug.dosage.labelled();
            if rules.is_empty() {
                errors.push(format!("Drug '{}' has no dosing rule", id));
            }

            for (label, drug_rule) in rules {
                errors.extend(
                    validate_rule(&drug_rule.rule)
                        .into_iter()
                        .map(|e| format!("Drug '{}' ({}): {}", id, label, e)),
                );

                for band in &drug_rule.overrides {
                    if band.min_kg > band.max_kg {
                        errors.push(format!(
                            "Drug '{}' ({}): override band [{}, {}] is inverted",
                            id, label, band.min_kg, band.max_kg
                        ));
                    }
                    if !band.dose_mg.is_finite() || band.dose_mg < 0.0 {
                        errors.push(format!(
                            "Drug '{}' ({}): override dose {} is invalid",
                            id, label, band.dose_mg
                        ));
                    }
                }

                for (i, j) in overlapping_overrides(&drug_rule.overrides) {
                    let message = format!(
                        "Drug '{}' ({}): override bands #{} and #{} overlap",
                        id, label, i, j
                    );
                    if strict {
                        errors.push(message);
                    } else {
                        tracing::warn!("{} (first match wins)", message);
                    }
                }
            }
        }

        errors
    }
}

/// Basis/field consistency of a single rule
fn validate_rule(rule: &DosingRule) -> Vec<String> {
    let mut errors = Vec::new();
    let positive = |v: Option<f64>| v.is_some_and(|v| v.is_finite() && v > 0.0);

    match rule.basis {
        DosingBasis::PerKilogram if !positive(rule.mg_per_kg) => {
            errors.push("mg_per_kg basis without a positive mg_per_kg".to_string());
        }
        DosingBasis::Fixed if !positive(rule.min_dose_mg) => {
            errors.push("fixed basis without a positive min_dose_mg".to_string());
        }
        DosingBasis::Unknown => errors.push("unknown dosing basis".to_string()),
        _ => {}
    }

    if let (Some(min), Some(max)) = (rule.min_dose_mg, rule.max_dose_mg) {
        if min > max {
            errors.push(format!("min_dose_mg {} > max_dose_mg {}", min, max));
        }
    }
    if let Some(step) = rule.rounding_step_mg {
        if !step.is_finite() || step < 0.0 {
            errors.push(format!("rounding_step_mg {} is invalid", step));
        }
    }
    errors
}

fn drug(id: &str, name: &str, concentration_label: &str, concentration: f64, unit: &str) -> DrugEntry {
    DrugEntry {
        id: id.into(),
        name: name.into(),
        category: None,
        concentration_label: concentration_label.into(),
        concentration_per_ml: Some(concentration),
        concentration_unit: unit.into(),
        is_high_alert: false,
        routes: Vec::new(),
        dosage: DrugDosage::default(),
        guardrails: SafetyGuardrails::default(),
    }
}

/// Built-in demonstration catalog
///
/// Exercises every rule shape (per-kg, fixed, ranged, override bands,
/// species-specific rules, non-mass units). Not a clinical reference.
pub fn build_default_catalog() -> DrugCatalog {
    let mut entries = Vec::new();

    // ========================================================================
    // Emergency
    // ========================================================================

    entries.push(DrugEntry {
        category: Some("Emergency".into()),
        is_high_alert: true,
        routes: vec!["IV".into(), "IO".into()],
        dosage: DrugDosage {
            common: Some(DrugRule::new(DosingRule {
                max_dose_mg: Some(1.0),
                frequency_text: Some("every 3-5 min during CPR".into()),
                route: Some("IV/IO".into()),
                ..DosingRule::per_kg(0.01)
            })),
            ..DrugDosage::default()
        },
        guardrails: SafetyGuardrails {
            min_volume_ml: Some(0.05),
            ..SafetyGuardrails::default()
        },
        ..drug("adrenaline", "Adrenaline 1 mg/mL", "1 mg/mL", 1.0, "mg")
    });

    entries.push(DrugEntry {
        category: Some("Emergency".into()),
        is_high_alert: true,
        routes: vec!["IV".into()],
        dosage: DrugDosage {
            common: Some(DrugRule {
                dose_unit: "mEq".into(),
                ..DrugRule::new(DosingRule {
                    route: Some("slow IV".into()),
                    notes: Some("Severe metabolic acidosis only".into()),
                    ..DosingRule::per_kg(1.0)
                })
            }),
            ..DrugDosage::default()
        },
        guardrails: SafetyGuardrails {
            warning: Some("Do not mix with calcium (precipitates)".into()),
            ..SafetyGuardrails::default()
        },
        ..drug("sodium_bicarbonate", "Sodium bicarbonate 8.4%", "1 mEq/mL (8.4%)", 1.0, "mEq")
    });

    entries.push(DrugEntry {
        category: Some("Emergency".into()),
        routes: vec!["IV".into(), "nebulized".into()],
        dosage: DrugDosage {
            common: Some(DrugRule::new(DosingRule::ranged(
                "Nebulized 2.5 mg below 20 kg, 5 mg above; see protocol",
            ))),
            ..DrugDosage::default()
        },
        ..drug("salbutamol", "Salbutamol", "5 mg/mL", 5.0, "mg")
    });

    // ========================================================================
    // Sedation / analgesia
    // ========================================================================

    entries.push(DrugEntry {
        category: Some("Sedation".into()),
        is_high_alert: true,
        routes: vec!["IV".into(), "IM".into()],
        dosage: DrugDosage {
            common: Some(DrugRule::new(DosingRule {
                rounding_step_mg: Some(0.5),
                route: Some("IV".into()),
                frequency_text: Some("induction".into()),
                ..DosingRule::per_kg(2.0)
            })),
            ..DrugDosage::default()
        },
        ..drug("ketamine", "Ketamine 50 mg/mL", "50 mg/mL", 50.0, "mg")
    });

    entries.push(DrugEntry {
        category: Some("Sedation".into()),
        routes: vec!["IV".into(), "intrarectal".into()],
        dosage: DrugDosage {
            common: Some(DrugRule {
                overrides: vec![WeightOverride {
                    min_kg: 0.5,
                    max_kg: 4.9,
                    dose_mg: 2.0,
                    note: Some("Small patient: fixed 2 mg".into()),
                }],
                ..DrugRule::new(DosingRule {
                    max_dose_mg: Some(10.0),
                    rounding_step_mg: Some(0.5),
                    frequency_text: Some("may repeat once after 5 min".into()),
                    ..DosingRule::per_kg(0.5)
                })
            }),
            ..DrugDosage::default()
        },
        ..drug("diazepam", "Diazepam 5 mg/mL", "5 mg/mL", 5.0, "mg")
    });

    entries.push(DrugEntry {
        category: Some("Analgesia".into()),
        routes: vec!["SC".into(), "PO".into()],
        dosage: DrugDosage {
            dog: Some(DrugRule::new(DosingRule {
                rounding_step_mg: Some(0.1),
                frequency_text: Some("once daily".into()),
                ..DosingRule::per_kg(0.2)
            })),
            cat: Some(DrugRule::new(DosingRule {
                rounding_step_mg: Some(0.05),
                notes: Some("Single dose only in cats".into()),
                ..DosingRule::per_kg(0.1)
            })),
            ..DrugDosage::default()
        },
        guardrails: SafetyGuardrails {
            contraindications: vec!["dehydration".into(), "renal failure".into()],
            ..SafetyGuardrails::default()
        },
        ..drug("meloxicam", "Meloxicam 5 mg/mL", "5 mg/mL", 5.0, "mg")
    });

    // ========================================================================
    // Anti-infectives / other
    // ========================================================================

    entries.push(DrugEntry {
        category: Some("Antibiotics".into()),
        routes: vec!["IV".into()],
        dosage: DrugDosage {
            common: Some(DrugRule::new(DosingRule {
                max_dose_mg: Some(1000.0),
                max_daily_mg_per_kg: Some(66.0),
                rounding_step_mg: Some(5.0),
                frequency_text: Some("every 8 h".into()),
                ..DosingRule::per_kg(22.0)
            })),
            ..DrugDosage::default()
        },
        ..drug("cefazolin", "Cefazolin 100 mg/mL", "100 mg/mL", 100.0, "mg")
    });

    entries.push(DrugEntry {
        category: Some("Antiemetics".into()),
        routes: vec!["SC".into(), "IV".into()],
        dosage: DrugDosage {
            common: Some(DrugRule::new(DosingRule {
                frequency_text: Some("once daily".into()),
                ..DosingRule::per_kg(1.0)
            })),
            ..DrugDosage::default()
        },
        ..drug("maropitant", "Maropitant 10 mg/mL", "10 mg/mL", 10.0, "mg")
    });

    entries.push(DrugEntry {
        category: Some("Endocrine".into()),
        is_high_alert: true,
        routes: vec!["IV CRI".into()],
        dosage: DrugDosage {
            common: Some(DrugRule {
                dose_unit: "UI/h".into(),
                ..DrugRule::new(DosingRule {
                    per_dose: false,
                    notes: Some("Continuous infusion, adjust to glycemia".into()),
                    ..DosingRule::per_kg(0.1)
                })
            }),
            ..DrugDosage::default()
        },
        ..drug("insulin_regular", "Regular insulin (diluted)", "variable (diluted in NaCl 0.9%)", 1.0, "UI")
    });

    entries.push(DrugEntry {
        category: Some("Electrolytes".into()),
        is_high_alert: true,
        routes: vec!["IV CRI".into()],
        dosage: DrugDosage {
            common: Some(DrugRule {
                dose_unit: "mmol/h".into(),
                ..DrugRule::new(DosingRule {
                    per_dose: false,
                    max_dose_mg: Some(10.0),
                    notes: Some("Hypophosphatemia; max 0.5 mmol/kg/h".into()),
                    ..DosingRule::per_kg(0.03)
                })
            }),
            ..DrugDosage::default()
        },
        ..drug("potassium_phosphate", "Potassium phosphate", "3 mmol/mL phosphate", 3.0, "mmol")
    });

    DrugCatalog {
        drugs: entries.into_iter().map(|d| (d.id.clone(), d)).collect(),
    }
}
