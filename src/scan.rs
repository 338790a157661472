//! Archive scanning and classification.
//!
//! Decides what kind of mod an archive is and which installable options it
//! exposes:
//!
//! - a `nioh3modmanifest.json` at the root makes it a manifest mod with one
//!   option list per feature
//! - `package/` directories (optionally nested under option folders) make it
//!   a legacy RDB mod; bare `.fdata`/`.yumiamod.json` members are treated as
//!   one default option
//! - otherwise, members whose basenames look like loose assets
//!   (`0xAABBCCDD.ext`) make it a direct loose-file mod, with top-level
//!   folders as independently toggleable options

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::archive;
use crate::error::{ModError, Result};
use crate::manifest::{self, ModManifest};
use crate::paths;

static LOOSE_ASSET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:0x)?[0-9A-Fa-f]{8}\.[^.]+$").unwrap());

/// Option name used when an archive exposes exactly one unnamed choice.
pub const DEFAULT_OPTION: &str = "(default)";

/// How an archive's contents are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// `package/` layout consumed by the RDB patch tool.
    LegacyRdb,
    /// Described by a nioh3modmanifest.json.
    Manifest,
    /// Bare loose asset files for the loose-file loader.
    DirectLoose,
}

/// A single installable option within a mod archive.
#[derive(Debug, Clone)]
pub struct ModOption {
    /// Display name (parent directory name, or `(default)`).
    pub name: String,
    /// Path prefix inside the archive (e.g. `OptionA/package/`).
    pub prefix: String,
    /// Member paths relative to the prefix.
    pub files: Vec<String>,
}

/// A scanned mod archive and everything selectable inside it.
#[derive(Debug, Clone)]
pub struct ModArchive {
    pub path: PathBuf,
    /// Display name: manifest `mod_name` if present, else the file stem.
    pub name: String,
    pub kind: ArchiveKind,
    pub options: Vec<ModOption>,
    pub manifest: Option<ModManifest>,
    /// Discovered option names per feature, sorted case-insensitively.
    pub feature_options: HashMap<String, Vec<String>>,
    /// Every member name in the archive, slash-normalized.
    pub members: Vec<String>,
    /// Direct-loose only: root-level files always included.
    pub common_files: Vec<String>,
    /// Direct-loose only: options toggle independently instead of being
    /// mutually exclusive.
    pub multi_select: bool,
}

impl ModArchive {
    /// Archive filename, the natural key for install records.
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Whether scanning found anything installable.
    pub fn is_installable(&self) -> bool {
        !self.options.is_empty() || self.manifest.is_some()
    }
}

/// Whether a member's basename matches the loose asset naming scheme.
pub fn is_loose_asset_member(member: &str) -> bool {
    LOOSE_ASSET_RE.is_match(paths::member_file_name(member))
}

/// Scan a downloads directory for installable mod archives.
///
/// Unreadable archives are logged and skipped; the scan itself never fails.
pub fn scan_mods_dir(mods_dir: &Path) -> Vec<ModArchive> {
    let mut archives = Vec::new();
    let entries = match std::fs::read_dir(mods_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Mods directory not readable: {}: {e}", mods_dir.display());
            return archives;
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && archive::ArchiveFormat::is_supported(p))
        .collect();
    files.sort();

    for path in files {
        match analyze_archive(&path) {
            Ok(archive) if archive.is_installable() => {
                let names: Vec<&str> = archive.options.iter().map(|o| o.name.as_str()).collect();
                if archive.manifest.is_some() {
                    info!(
                        "  {}: manifest mod - {} feature(s)",
                        archive.filename(),
                        archive.manifest.as_ref().map_or(0, |m| m.features.len())
                    );
                } else {
                    info!("  {}: {} option(s) - {:?}", archive.filename(), names.len(), names);
                }
                archives.push(archive);
            }
            Ok(archive) => {
                info!("  {}: no mod files found, skipping", archive.filename());
            }
            Err(e) => {
                warn!("  Error scanning {}: {e}", path.display());
            }
        }
    }

    info!("Scan complete: {} valid mod archive(s)", archives.len());
    archives
}

/// Classify one archive and enumerate its options.
pub fn analyze_archive(path: &Path) -> Result<ModArchive> {
    let members = archive::list_members(path)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut scanned = ModArchive {
        path: path.to_path_buf(),
        name: stem,
        kind: ArchiveKind::LegacyRdb,
        options: Vec::new(),
        manifest: None,
        feature_options: HashMap::new(),
        members,
        common_files: Vec::new(),
        multi_select: false,
    };
    if scanned.members.is_empty() {
        return Ok(scanned);
    }

    if scanned.members.iter().any(|m| m == manifest::MANIFEST_FILENAME) {
        match archive::read_member(path, manifest::MANIFEST_FILENAME)
            .and_then(|data| manifest::parse_manifest(&data))
        {
            Ok(parsed) => {
                scanned.kind = ArchiveKind::Manifest;
                if let Some(mod_name) = &parsed.mod_name {
                    scanned.name = mod_name.clone();
                }
                scanned.feature_options = discover_feature_options(&scanned.members, &parsed);
                scanned.manifest = Some(parsed);
                return Ok(scanned);
            }
            Err(e) => {
                warn!(
                    "  Manifest parse failed in {}: {e} - falling back to package/ scan",
                    scanned.filename()
                );
            }
        }
    }

    classify_without_manifest(&mut scanned);
    Ok(scanned)
}

fn classify_without_manifest(scanned: &mut ModArchive) {
    // package/ prefixes, keyed by the directory above them
    let mut prefixes: Vec<(String, String)> = Vec::new();
    for name in &scanned.members {
        let parts: Vec<&str> = name.split('/').collect();
        for (i, part) in parts.iter().enumerate() {
            if part.eq_ignore_ascii_case("package") && i < parts.len() - 1 {
                let prefix = format!("{}/", parts[..=i].join("/"));
                if !prefixes.iter().any(|(p, _)| *p == prefix) {
                    let option_name = if i == 0 {
                        DEFAULT_OPTION.to_string()
                    } else {
                        parts[i - 1].to_string()
                    };
                    prefixes.push((prefix, option_name));
                }
                break;
            }
        }
    }

    for (prefix, option_name) in prefixes {
        let files: Vec<String> = scanned
            .members
            .iter()
            .filter(|name| name.starts_with(&prefix) && !name.ends_with('/'))
            .map(|name| name[prefix.len()..].to_string())
            .filter(|rel| !rel.is_empty())
            .collect();
        if !files.is_empty() {
            scanned.options.push(ModOption {
                name: option_name,
                prefix,
                files,
            });
        }
    }
    if !scanned.options.is_empty() {
        scanned.kind = ArchiveKind::LegacyRdb;
        return;
    }

    // No package/ layout: raw container members anywhere count as one option
    let rdb_members: Vec<String> = scanned
        .members
        .iter()
        .filter(|name| {
            !name.ends_with('/')
                && (name.ends_with(".fdata") || name.ends_with(".yumiamod.json"))
        })
        .cloned()
        .collect();
    if !rdb_members.is_empty() {
        scanned.kind = ArchiveKind::LegacyRdb;
        scanned.options.push(ModOption {
            name: DEFAULT_OPTION.to_string(),
            prefix: String::new(),
            files: rdb_members,
        });
        return;
    }

    // Loose asset detection
    let mut loose_members: Vec<String> = scanned
        .members
        .iter()
        .filter(|name| !name.ends_with('/') && is_loose_asset_member(name))
        .cloned()
        .collect();
    if loose_members.is_empty() {
        return;
    }
    loose_members.sort();

    scanned.kind = ArchiveKind::DirectLoose;
    let mut root_files: Vec<String> = Vec::new();
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for member in loose_members {
        match member.split_once('/') {
            None => root_files.push(member),
            Some((top, _)) => match groups.iter_mut().find(|(name, _)| name == top) {
                Some((_, files)) => files.push(member),
                None => groups.push((top.to_string(), vec![member])),
            },
        }
    }

    if !groups.is_empty() && (groups.len() > 1 || !root_files.is_empty()) {
        scanned.common_files = root_files;
        scanned.multi_select = true;
        groups.sort_by_key(|(name, _)| name.to_lowercase());
        for (name, files) in groups {
            scanned.options.push(ModOption {
                name,
                prefix: String::new(),
                files,
            });
        }
    } else if groups.len() == 1 && root_files.is_empty() {
        // A single wrapper folder collapses to one default option
        let (_, files) = groups.into_iter().next().unwrap();
        scanned.options.push(ModOption {
            name: DEFAULT_OPTION.to_string(),
            prefix: String::new(),
            files,
        });
    } else {
        scanned.options.push(ModOption {
            name: DEFAULT_OPTION.to_string(),
            prefix: String::new(),
            files: root_files,
        });
    }
}

/// Enumerate option folders under each feature directory.
///
/// An option is the first path segment under `directory/` that has at least
/// one file beneath it. Derived from archive contents, never persisted.
pub fn discover_feature_options(
    members: &[String],
    manifest: &ModManifest,
) -> HashMap<String, Vec<String>> {
    let mut by_feature = HashMap::new();
    for feature in &manifest.features {
        let prefix = format!("{}/", feature.directory);
        let mut found: Vec<String> = Vec::new();
        for name in members {
            if !name.starts_with(&prefix) || name.ends_with('/') {
                continue;
            }
            let rest = &name[prefix.len()..];
            if let Some((option, remainder)) = rest.split_once('/') {
                if !remainder.is_empty() && !found.iter().any(|o| o == option) {
                    found.push(option.to_string());
                }
            }
        }
        found.sort_by_key(|o| o.to_lowercase());
        by_feature.insert(feature.name.clone(), found);
    }
    by_feature
}

/// Check a proposed selection map against a manifest archive.
///
/// Every non-optional feature needs a selection among its discovered options;
/// optional features may be explicitly skipped with `None`.
pub fn validate_selections(
    scanned: &ModArchive,
    selections: &std::collections::BTreeMap<String, Option<String>>,
) -> Result<()> {
    let manifest = scanned
        .manifest
        .as_ref()
        .ok_or_else(|| ModError::SelectionInvalid("archive has no manifest".into()))?;

    for feature in &manifest.features {
        let available = scanned
            .feature_options
            .get(&feature.name)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        match selections.get(&feature.name).and_then(|s| s.as_ref()) {
            None => {
                if !feature.optional {
                    return Err(ModError::SelectionInvalid(format!(
                        "required feature '{}' has no option selected",
                        feature.name
                    )));
                }
            }
            Some(chosen) => {
                if !available.iter().any(|o| o == chosen) {
                    return Err(ModError::SelectionInvalid(format!(
                        "invalid option '{}' for feature '{}' (available: {:?})",
                        chosen, feature.name, available
                    )));
                }
            }
        }
    }
    Ok(())
}
