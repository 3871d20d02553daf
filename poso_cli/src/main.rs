use poso_core::age_weight::{age_band_for_weight, parse_age_label};
use poso_core::format::{format_number_or, PLACEHOLDER};
use poso_core::posology::{available_weights, section_names};
use poso_core::*;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "poso")]
#[command(about = "Clinical dose calculator and posology lookup", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override data directory (patient context)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to $XDG_CONFIG_HOME/poso/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Drug catalog JSON (defaults to the built-in catalog)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Rules table CSV applied on top of the catalog
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    /// Override bands CSV, used together with --rules
    #[arg(long, global = true, requires = "rules")]
    overrides: Option<PathBuf>,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the dose and volume of a drug
    Dose {
        /// Drug id (see `poso drugs`)
        #[arg(long)]
        drug: String,

        /// Patient weight in kg (defaults to the stored patient)
        #[arg(long)]
        weight: Option<f64>,

        /// Species: dog or cat (defaults to the stored patient)
        #[arg(long)]
        species: Option<Species>,

        /// Confirm the stock concentration of drugs whose concentration varies
        #[arg(long)]
        confirm_concentration: bool,
    },

    /// List the drugs of the catalog
    Drugs,

    /// Validate the drug catalog
    Validate {
        /// Treat overlapping override bands as errors
        #[arg(long)]
        strict: bool,
    },

    /// Look up a precomputed posology table by weight
    Lookup {
        /// Posology JSON document
        #[arg(long)]
        table: PathBuf,

        /// Section to show (lists sections when omitted)
        #[arg(long)]
        section: Option<String>,

        /// Patient weight in kg (defaults to the stored patient)
        #[arg(long)]
        weight: Option<f64>,
    },

    /// Estimate weight from age or age from weight
    Estimate {
        #[command(subcommand)]
        target: EstimateTarget,
    },

    /// Show or edit the current patient
    Patient {
        #[command(subcommand)]
        action: Option<PatientAction>,
    },
}

#[derive(Subcommand)]
enum EstimateTarget {
    /// Expected weight for an age
    Weight {
        #[arg(long)]
        months: f64,

        /// Estimation model: table or apls
        #[arg(long)]
        model: Option<AgeWeightModel>,
    },
    /// Expected age for a weight
    Age {
        #[arg(long)]
        kg: f64,

        /// Estimation model: table or apls
        #[arg(long)]
        model: Option<AgeWeightModel>,
    },
}

#[derive(Subcommand)]
enum PatientAction {
    /// Show the current patient
    Show,
    /// Update the current patient
    Set {
        #[arg(long)]
        weight: Option<f64>,

        #[arg(long)]
        species: Option<Species>,

        /// Age label, e.g. "10 mois", "2 ans", "18 months"
        #[arg(long, conflicts_with = "months")]
        age: Option<String>,

        /// Age in months
        #[arg(long)]
        months: Option<u32>,
    },
    /// Forget the current patient
    Clear,
}

fn main() -> Result<()> {
    let mut cli = Cli::parse();

    if cli.verbose {
        poso_core::logging::init_with_level("debug");
    } else {
        poso_core::logging::init();
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data.data_dir = data_dir.clone();
    }
    let store = JsonFileStore::new(config.patient_path());

    match cli.command.take() {
        Some(Commands::Dose {
            drug,
            weight,
            species,
            confirm_concentration,
        }) => {
            let catalog = load_catalog(&cli, &config)?;
            cmd_dose(&catalog, &store, &config, &drug, weight, species, confirm_concentration)
        }
        Some(Commands::Drugs) => {
            let catalog = load_catalog(&cli, &config)?;
            cmd_drugs(&catalog);
            Ok(())
        }
        Some(Commands::Validate { strict }) => cmd_validate(&cli, &config, strict),
        Some(Commands::Lookup {
            table,
            section,
            weight,
        }) => cmd_lookup(&store, &config, &table, section.as_deref(), weight),
        Some(Commands::Estimate { target }) => {
            cmd_estimate(target, &config);
            Ok(())
        }
        Some(Commands::Patient { action }) => cmd_patient(&store, &config, action),
        None => cmd_patient(&store, &config, None),
    }
}

/// Catalog from --catalog, the config file, or the built-in one, plus --rules
fn read_catalog(cli: &Cli, config: &Config) -> Result<DrugCatalog> {
    let path = cli.catalog.as_ref().or(config.data.catalog.as_ref());
    let mut catalog = match path {
        Some(path) => DrugCatalog::load_json(path)?,
        None => default_catalog().clone(),
    };

    if let Some(rules) = &cli.rules {
        let applied = catalog.apply_rules_csv(rules, cli.overrides.as_deref())?;
        tracing::info!("{} rules applied from {:?}", applied, rules);
    }
    Ok(catalog)
}

/// [`read_catalog`], refusing catalogs that fail validation
fn load_catalog(cli: &Cli, config: &Config) -> Result<DrugCatalog> {
    let catalog = read_catalog(cli, config)?;
    let errors = catalog.validate(config.safety.strict_overrides);
    if !errors.is_empty() {
        eprintln!("Catalog validation errors:");
        for error in errors {
            eprintln!("  - {}", error);
        }
        return Err(Error::CatalogValidation("Invalid catalog".into()));
    }
    Ok(catalog)
}

/// Explicit weight, else the stored patient's entered or estimated weight
fn resolve_weight(
    weight: Option<f64>,
    patient: &PatientContext,
    config: &Config,
) -> Result<(f64, bool)> {
    if let Some(w) = weight {
        if !w.is_finite() || w <= 0.0 {
            return Err(Error::Patient(format!("Invalid weight: {} kg", w)));
        }
        return Ok((w, false));
    }
    match patient.effective_weight(config.estimation.model) {
        Some(w) => Ok((w, patient.weight_is_estimated())),
        None => Err(Error::Patient(
            "No weight given: pass --weight or run `poso patient set --weight <kg>`".into(),
        )),
    }
}

fn num(value: Option<f64>, config: &Config) -> String {
    format_number_or(value, config.display.digits, &config.display.placeholder)
}

fn with_unit(value: Option<f64>, unit: &str, config: &Config) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{} {}", num(Some(v), config), unit),
        _ => config.display.placeholder.clone(),
    }
}

fn cmd_dose(
    catalog: &DrugCatalog,
    store: &JsonFileStore,
    config: &Config,
    drug_id: &str,
    weight: Option<f64>,
    species: Option<Species>,
    confirm_concentration: bool,
) -> Result<()> {
    let drug = catalog.get(drug_id).ok_or_else(|| {
        Error::Other(format!("Unknown drug '{}'. Run `poso drugs` for the list.", drug_id))
    })?;

    let patient = store.load()?;
    let (weight_kg, estimated) = resolve_weight(weight, &patient, config)?;
    let species = species.or(patient.species);

    let calc = calculate(drug, weight_kg, species, confirm_concentration, &config.safety)
        .map_err(|e| Error::Other(e.to_string()))?;

    display_calculation(drug, &calc, estimated, config);
    Ok(())
}

fn display_calculation(drug: &DrugEntry, calc: &DoseCalculation, estimated: bool, config: &Config) {
    println!("\n╭─────────────────────────────────────────╮");
    println!("│  {}", calc.drug_name);
    println!("╰─────────────────────────────────────────╯");
    println!();

    let species = calc
        .species
        .map(|s| format!(" ({})", s))
        .unwrap_or_default();
    let origin = if estimated { " [estimated from age]" } else { "" };
    println!(
        "  Patient:    {}{}{}",
        with_unit(Some(calc.weight_kg), "kg", config),
        species,
        origin
    );

    let dose = with_unit(calc.result.dose.value(), &calc.dose_unit, config);
    match &calc.per_kg {
        Some((factor, unit)) => println!("  Dose:       {} {} → {}", num(Some(*factor), config), unit, dose),
        None => println!("  Dose:       {}", dose),
    }

    let concentration = if drug.concentration_label.is_empty() {
        String::new()
    } else {
        format!("  ({})", drug.concentration_label)
    };
    println!(
        "  Volume:     {}{}",
        with_unit(calc.volume, calc.volume_unit, config),
        concentration
    );

    let source = match calc.result.source {
        DoseSource::Override => "weight band override",
        DoseSource::Rule => "rule",
    };
    println!("  Source:     {}", source);

    if let Some(max_daily) = calc.result.max_daily_mg {
        println!("  Max daily:  {}", with_unit(Some(max_daily), &calc.dose_unit, config));
    }
    if let Some(route) = &calc.result.route {
        println!("  Route:      {}", route);
    }
    if let Some(frequency) = &calc.result.frequency {
        println!("  Frequency:  {}", frequency);
    }
    if let Some(note) = &calc.result.note {
        println!("  Note:       {}", note);
    }
    if !drug.guardrails.contraindications.is_empty() {
        println!(
            "  Contraindications: {}",
            drug.guardrails.contraindications.join(", ")
        );
    }

    if !calc.warnings.is_empty() {
        println!();
        for warning in &calc.warnings {
            println!("  ⚠ {}", warning);
        }
    }
    println!();
}

fn cmd_drugs(catalog: &DrugCatalog) {
    for drug in catalog.drugs.values() {
        let category = drug.category.as_deref().unwrap_or("-");
        let alert = if drug.is_high_alert { " [high alert]" } else { "" };
        println!("{:<22} {:<34} {}{}", drug.id, drug.name, category, alert);
    }
}

fn cmd_validate(cli: &Cli, config: &Config, strict: bool) -> Result<()> {
    let catalog = read_catalog(cli, config)?;
    let errors = catalog.validate(strict || config.safety.strict_overrides);

    if errors.is_empty() {
        println!("✓ Catalog valid ({} drugs)", catalog.drugs.len());
        return Ok(());
    }

    eprintln!("Catalog validation errors:");
    for error in &errors {
        eprintln!("  - {}", error);
    }
    Err(Error::CatalogValidation(format!("{} error(s)", errors.len())))
}

fn cmd_lookup(
    store: &JsonFileStore,
    config: &Config,
    table_path: &Path,
    section: Option<&str>,
    weight: Option<f64>,
) -> Result<()> {
    let table = load_posology(table_path)?;
    let patient = store.load()?;
    let (weight_kg, _) = resolve_weight(weight, &patient, config)?;

    let entry = find_entry_by_weight(&table.weights, weight_kg)
        .ok_or_else(|| Error::Posology(format!("No weight buckets in {:?}", table_path)))?;

    if entry.kg == weight_kg {
        println!("Posology for {} kg", num(Some(entry.kg), config));
    } else {
        println!(
            "Posology for {} kg (nearest bucket to {} kg)",
            num(Some(entry.kg), config),
            num(Some(weight_kg), config)
        );
    }

    let Some(section) = section else {
        let names = section_names(entry);
        println!("Sections: {}", names.into_iter().collect::<Vec<_>>().join(", "));
        return Ok(());
    };

    let doses = section_entries(entry, section);
    if doses.is_empty() {
        let names: Vec<String> = section_names(entry).into_iter().collect();
        println!(
            "Section '{}' not found at {} kg. Available: {}",
            section,
            num(Some(entry.kg), config),
            if names.is_empty() { PLACEHOLDER.to_string() } else { names.join(", ") }
        );
        return Ok(());
    }

    println!("[{}]", section);
    for (name, dose) in doses {
        println!("  {}", name);
        for (_, unit, value) in dose.numeric_fields() {
            println!("    {}", with_unit(Some(value), unit, config));
        }
        if let Some(prep) = &dose.prep {
            if let Some(c) = prep.final_conc_mg_per_ml.or(prep.stock_conc_mg_per_ml) {
                println!("    at {}", with_unit(Some(c), "mg/mL", config));
            }
        }
        if let Some(note) = &dose.note {
            println!("    {}", note);
        }
        let invalid = dose.invalid_fields();
        if !invalid.is_empty() {
            println!("    ⚠ invalid values: {}", invalid.join(", "));
        }
    }

    tracing::debug!(
        "Available buckets: {:?}",
        available_weights(&table.weights)
    );
    Ok(())
}

fn cmd_estimate(target: EstimateTarget, config: &Config) {
    match target {
        EstimateTarget::Weight { months, model } => {
            let model = model.unwrap_or(config.estimation.model);
            let kg = estimate_weight_from_age(months, model);
            println!("{} kg ({} model)", num(Some(kg), config), model);
        }
        EstimateTarget::Age { kg, model } => {
            let model = model.unwrap_or(config.estimation.model);
            let months = estimate_age_from_weight(kg, model);
            println!(
                "{} months ({} model, {})",
                months,
                model,
                age_band_for_weight(kg)
            );
        }
    }
}

fn cmd_patient(store: &JsonFileStore, config: &Config, action: Option<PatientAction>) -> Result<()> {
    match action {
        None | Some(PatientAction::Show) => {
            let patient = store.load()?;
            display_patient(&patient, config);
        }
        Some(PatientAction::Set {
            weight,
            species,
            age,
            months,
        }) => {
            let age_months = match age {
                Some(label) => Some(parse_age_label(&label).ok_or_else(|| {
                    Error::Patient(format!("Cannot read age label '{}'", label))
                })?),
                None => months,
            };

            let patient = store.update(|patient| {
                if weight.is_some() {
                    patient.set_weight(weight)?;
                }
                if species.is_some() {
                    patient.set_species(species);
                }
                if age_months.is_some() {
                    patient.set_age_months(age_months);
                }
                Ok(())
            })?;
            println!("✓ Patient updated");
            display_patient(&patient, config);
        }
        Some(PatientAction::Clear) => {
            store.clear()?;
            println!("✓ Patient cleared");
        }
    }
    Ok(())
}

fn display_patient(patient: &PatientContext, config: &Config) {
    if patient.is_empty() {
        println!("No current patient. Use `poso patient set --weight <kg>`.");
        return;
    }

    let weight = match patient.effective_weight(config.estimation.model) {
        Some(w) if patient.weight_is_estimated() => format!(
            "{} (estimated, {} model)",
            with_unit(Some(w), "kg", config),
            config.estimation.model
        ),
        Some(w) => with_unit(Some(w), "kg", config),
        None => config.display.placeholder.clone(),
    };
    println!("  Weight:   {}", weight);
    println!(
        "  Species:  {}",
        patient
            .species
            .map(|s| s.to_string())
            .unwrap_or_else(|| config.display.placeholder.clone())
    );
    if let Some(months) = patient.age_months {
        println!("  Age:      {} months", months);
    }
    if let Some(updated) = patient.updated_at {
        println!(
            "  Updated:  {}",
            updated.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")
        );
    }
}
