//! Current patient context with pluggable persistence.
//!
//! The context (weight, species, age) is an explicit value handed to
//! whoever needs it. Persistence goes through [`PatientStore`], so the CLI
//! can keep it in a locked JSON file and tests can keep it in memory.

use crate::age_weight::{estimate_weight_from_age, AgeWeightModel};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// Patient species
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Species {
    Dog,
    Cat,
}

impl FromStr for Species {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dog" | "canine" | "chien" => Ok(Species::Dog),
            "cat" | "feline" | "chat" => Ok(Species::Cat),
            other => Err(Error::Patient(format!("Unknown species '{}'", other))),
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Species::Dog => write!(f, "dog"),
            Species::Cat => write!(f, "cat"),
        }
    }
}

/// The patient currently being dosed
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PatientContext {
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub species: Option<Species>,
    #[serde(default)]
    pub age_months: Option<u32>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PatientContext {
    /// Set or clear the entered weight
    ///
    /// Rejects non-finite and non-positive weights.
    pub fn set_weight(&mut self, weight_kg: Option<f64>) -> Result<()> {
        if let Some(w) = weight_kg {
            if !w.is_finite() || w <= 0.0 {
                return Err(Error::Patient(format!("Invalid weight: {} kg", w)));
            }
        }
        self.weight_kg = weight_kg;
        self.touch();
        Ok(())
    }

    pub fn set_species(&mut self, species: Option<Species>) {
        self.species = species;
        self.touch();
    }

    pub fn set_age_months(&mut self, age_months: Option<u32>) {
        self.age_months = age_months;
        self.touch();
    }

    /// Weight to dose with: the entered weight, else an estimate from age
    pub fn effective_weight(&self, model: AgeWeightModel) -> Option<f64> {
        self.weight_kg
            .or_else(|| self.age_months.map(|m| estimate_weight_from_age(m as f64, model)))
    }

    /// True when the weight comes from an age estimate
    pub fn weight_is_estimated(&self) -> bool {
        self.weight_kg.is_none() && self.age_months.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.weight_kg.is_none() && self.species.is_none() && self.age_months.is_none()
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

/// Storage backend for the patient context
pub trait PatientStore {
    /// Load the stored context, or a default one when nothing is stored
    fn load(&self) -> Result<PatientContext>;

    /// Persist the context
    fn save(&self, context: &PatientContext) -> Result<()>;

    /// Load, modify and save back
    fn update<F>(&self, f: F) -> Result<PatientContext>
    where
        F: FnOnce(&mut PatientContext) -> Result<()>,
        Self: Sized,
    {
        let mut context = self.load()?;
        f(&mut context)?;
        self.save(&context)?;
        Ok(context)
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    context: Mutex<PatientContext>,
}

impl PatientStore for MemoryStore {
    fn load(&self) -> Result<PatientContext> {
        let guard = self
            .context
            .lock()
            .map_err(|_| Error::Other("patient store lock poisoned".into()))?;
        Ok(guard.clone())
    }

    fn save(&self, context: &PatientContext) -> Result<()> {
        let mut guard = self
            .context
            .lock()
            .map_err(|_| Error::Other("patient store lock poisoned".into()))?;
        *guard = context.clone();
        Ok(())
    }
}

/// JSON file store with file locking
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the stored context
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
            tracing::debug!("Removed patient context {:?}", self.path);
        }
        Ok(())
    }
}

impl PatientStore for JsonFileStore {
    /// Shared-lock read
    ///
    /// A missing file gives the default context. An unreadable or corrupted
    /// file is logged and also gives the default context.
    fn load(&self) -> Result<PatientContext> {
        let path = &self.path;
        if !path.exists() {
            tracing::debug!("No patient context at {:?}, starting empty", path);
            return Ok(PatientContext::default());
        }

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    "Unable to open patient context {:?}: {}. Using defaults.",
                    path,
                    e
                );
                return Ok(PatientContext::default());
            }
        };

        if let Err(e) = file.lock_shared() {
            tracing::warn!(
                "Unable to lock patient context {:?}: {}. Using defaults.",
                path,
                e
            );
            return Ok(PatientContext::default());
        }

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        if let Err(e) = reader.read_to_string(&mut contents) {
            let _ = file.unlock();
            tracing::warn!(
                "Failed to read patient context {:?}: {}. Using defaults.",
                path,
                e
            );
            return Ok(PatientContext::default());
        }

        file.unlock()?;

        match serde_json::from_str::<PatientContext>(&contents) {
            Ok(context) => {
                tracing::debug!("Loaded patient context from {:?}", path);
                Ok(context)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to parse patient context {:?}: {}. Using defaults.",
                    path,
                    e
                );
                Ok(PatientContext::default())
            }
        }
    }

    /// Exclusive-locked temp file, fsync, then atomic rename
    fn save(&self, context: &PatientContext) -> Result<()> {
        let parent = self.path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "patient context path missing parent")
        })?;
        std::fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        temp.as_file().lock_exclusive()?;

        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            let contents = serde_json::to_string_pretty(context)?;
            writer.write_all(contents.as_bytes())?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved patient context to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_weight_validates() {
        let mut ctx = PatientContext::default();
        assert!(ctx.set_weight(Some(12.5)).is_ok());
        assert_eq!(ctx.weight_kg, Some(12.5));
        assert!(ctx.updated_at.is_some());

        assert!(ctx.set_weight(Some(0.0)).is_err());
        assert!(ctx.set_weight(Some(-2.0)).is_err());
        assert!(ctx.set_weight(Some(f64::NAN)).is_err());
        assert_eq!(ctx.weight_kg, Some(12.5));

        ctx.set_weight(None).unwrap();
        assert_eq!(ctx.weight_kg, None);
    }

    #[test]
    fn test_effective_weight_prefers_entered_weight() {
        let mut ctx = PatientContext::default();
        assert_eq!(ctx.effective_weight(AgeWeightModel::Table), None);

        ctx.set_age_months(Some(12));
        assert_eq!(ctx.effective_weight(AgeWeightModel::Table), Some(10.0));
        assert!(ctx.weight_is_estimated());

        ctx.set_weight(Some(8.2)).unwrap();
        assert_eq!(ctx.effective_weight(AgeWeightModel::Table), Some(8.2));
        assert!(!ctx.weight_is_estimated());
    }

    #[test]
    fn test_species_from_str() {
        assert_eq!("chien".parse::<Species>().unwrap(), Species::Dog);
        assert_eq!("Feline".parse::<Species>().unwrap(), Species::Cat);
        assert!("horse".parse::<Species>().is_err());
    }

    #[test]
    fn test_memory_store_update() {
        let store = MemoryStore::default();
        store
            .update(|ctx| {
                ctx.set_species(Some(Species::Cat));
                ctx.set_weight(Some(4.0))
            })
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.species, Some(Species::Cat));
        assert_eq!(loaded.weight_kg, Some(4.0));
    }

    #[test]
    fn test_failed_update_is_not_saved() {
        let store = MemoryStore::default();
        let result = store.update(|ctx| ctx.set_weight(Some(-1.0)));
        assert!(result.is_err());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("patient.json"));

        let mut ctx = PatientContext::default();
        ctx.set_weight(Some(22.0)).unwrap();
        ctx.set_species(Some(Species::Dog));
        ctx.set_age_months(Some(48));
        store.save(&ctx).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, ctx);
    }

    #[test]
    fn test_file_store_missing_file_is_default() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("nope.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_corrupted_file_is_default() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("patient.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_clear() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("patient.json"));
        store.save(&PatientContext::default()).unwrap();
        assert!(store.path().exists());

        store.clear().unwrap();
        assert!(!store.path().exists());
        store.clear().unwrap();
    }

    #[test]
    fn test_atomic_save_leaves_no_temp_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(temp_dir.path().join("patient.json"));
        store.save(&PatientContext::default()).unwrap();

        let extras: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "patient.json")
            .collect();
        assert!(extras.is_empty(), "unexpected files: {:?}", extras);
    }
}
