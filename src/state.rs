//! Persisted install state.
//!
//! The durable source of truth is a versioned JSON file in the game package
//! directory mapping archive filenames to install records. An older release
//! kept an unversioned file in the downloads directory with package-relative
//! paths and an implied RDB backend; that file is read once to backfill the
//! versioned store, and is still written as a derived export whenever RDB
//! records exist so older tooling keeps working.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ModError, Result};

/// Versioned state file, kept in the game package directory.
pub const STATE_FILENAME: &str = ".nioh3_modmanager_state.json";

/// Unversioned legacy state file, kept in the mods directory.
pub const LEGACY_STATE_FILENAME: &str = ".nioh3_modmanager_manifest.json";

/// The only state file version this build reads or writes.
pub const STATE_VERSION: u32 = 2;

/// Which delivery mechanism owns an install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Files under package/, applied by the RDB patch tool.
    Rdb,
    /// Files under mods/<dir>/, picked up by the loose-file loader.
    Loose,
}

/// How the install's selection was described.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallKind {
    /// package/ convention or bare container files.
    Legacy,
    /// nioh3modmanifest.json feature selection.
    Manifest,
}

/// One currently-installed mod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub archive_filename: String,
    pub backend: Backend,
    pub install_kind: InstallKind,
    /// Human-readable summary of what was selected.
    pub display_option_summary: String,
    #[serde(default)]
    pub legacy_option_name: Option<String>,
    /// Feature name -> chosen option; `None` means the feature was skipped.
    #[serde(default)]
    pub feature_selections: Option<BTreeMap<String, Option<String>>>,
    /// Installed file paths relative to the game root, slash-separated.
    #[serde(default)]
    pub installed_paths: Vec<String>,
    /// Loose installs only: the mod subdirectory this install owns.
    #[serde(default)]
    pub loose_mod_dir: Option<String>,
}

/// Record shape of the legacy state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyRecord {
    pub archive_filename: String,
    pub option_name: String,
    /// Paths relative to the game package directory.
    #[serde(default)]
    pub installed_files: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    records: BTreeMap<String, InstalledRecord>,
}

impl InstalledRecord {
    /// Installed files relative to the package directory, the shape the
    /// legacy export expects.
    pub fn package_relative_files(&self) -> Vec<String> {
        self.installed_paths
            .iter()
            .map(|p| p.strip_prefix("package/").unwrap_or(p).to_string())
            .collect()
    }
}

/// Reads and writes the durable record stores.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    legacy_path: PathBuf,
}

impl StateStore {
    pub fn new(package_dir: &Path, mods_dir: &Path) -> Self {
        Self {
            state_path: package_dir.join(STATE_FILENAME),
            legacy_path: mods_dir.join(LEGACY_STATE_FILENAME),
        }
    }

    pub fn state_file_exists(&self) -> bool {
        self.state_path.exists()
    }

    /// Load the versioned store. An unreadable or wrong-version file is
    /// state drift, not a crash: warn and start empty.
    pub fn load(&self) -> BTreeMap<String, InstalledRecord> {
        if !self.state_path.exists() {
            return BTreeMap::new();
        }
        match self.parse_state_file() {
            Ok(records) => {
                info!("Loaded installed state: {} mod(s) recorded", records.len());
                records
            }
            Err(e) => {
                warn!("Could not load install state: {e}");
                BTreeMap::new()
            }
        }
    }

    fn parse_state_file(&self) -> Result<BTreeMap<String, InstalledRecord>> {
        let data = std::fs::read(&self.state_path)?;
        let parsed: StateFile = serde_json::from_slice(&data)
            .map_err(|e| ModError::StateCorrupt(e.to_string()))?;
        if parsed.version != STATE_VERSION {
            return Err(ModError::StateCorrupt(format!(
                "unsupported state version: {}",
                parsed.version
            )));
        }
        Ok(parsed.records)
    }

    /// Load the legacy store for one-time backfill. Unreadable means empty.
    pub fn load_legacy(&self) -> BTreeMap<String, LegacyRecord> {
        if !self.legacy_path.exists() {
            return BTreeMap::new();
        }
        match std::fs::read(&self.legacy_path)
            .map_err(ModError::from)
            .and_then(|data| Ok(serde_json::from_slice(&data)?))
        {
            Ok(records) => records,
            Err(e) => {
                warn!("Could not load legacy installed mods record: {e}");
                BTreeMap::new()
            }
        }
    }

    /// Persist the versioned store and the derived legacy export together.
    pub fn save(&self, records: &BTreeMap<String, InstalledRecord>) -> Result<()> {
        let state = StateFile {
            version: STATE_VERSION,
            records: records.clone(),
        };
        std::fs::write(&self.state_path, serde_json::to_string_pretty(&state)?)?;
        self.export_legacy(records)?;
        Ok(())
    }

    /// Write the legacy file for older tooling while any RDB record exists;
    /// remove it once none remain.
    fn export_legacy(&self, records: &BTreeMap<String, InstalledRecord>) -> Result<()> {
        let legacy: BTreeMap<&String, LegacyRecord> = records
            .iter()
            .filter(|(_, rec)| rec.backend == Backend::Rdb)
            .map(|(key, rec)| {
                (
                    key,
                    LegacyRecord {
                        archive_filename: rec.archive_filename.clone(),
                        option_name: rec.display_option_summary.clone(),
                        installed_files: rec.package_relative_files(),
                    },
                )
            })
            .collect();

        if legacy.is_empty() {
            if self.legacy_path.exists() {
                std::fs::remove_file(&self.legacy_path)?;
            }
        } else {
            std::fs::write(&self.legacy_path, serde_json::to_string_pretty(&legacy)?)?;
        }
        Ok(())
    }
}
