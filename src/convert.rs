//! Conversion of selected archive members into loose files.
//!
//! Takes the flat member list an install resolved (container + sidecar
//! pairs, or already-loose asset files) and produces named in-memory files
//! ready to be written into a loose mod folder. Sidecars are consumed as
//! metadata only. The whole conversion fails atomically on a filename
//! collision; nothing is ever written to disk here.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;

use crate::archive;
use crate::error::{ModError, Result};
use crate::fdata;
use crate::manifest::ModManifest;
use crate::paths;
use crate::scan;

/// One converted file, still in memory.
#[derive(Debug)]
pub struct LooseFile {
    pub filename: String,
    /// Archive member this file came from, for diagnostics.
    pub source_member: String,
    pub data: Vec<u8>,
}

/// Result of converting one selection.
#[derive(Debug)]
pub struct ConversionResult {
    pub mod_name: String,
    pub files: Vec<LooseFile>,
}

/// Expand a manifest selection into the flat member list to install.
///
/// Includes everything under the common directory plus everything under each
/// selected feature option. Without a manifest, every file member is taken.
pub fn select_manifest_members(
    archive_label: &str,
    members: &[String],
    manifest: Option<&ModManifest>,
    selections: &BTreeMap<String, Option<String>>,
) -> Result<Vec<String>> {
    let manifest = match manifest {
        Some(m) => m,
        None => {
            return Ok(members
                .iter()
                .filter(|name| !name.ends_with('/'))
                .cloned()
                .collect());
        }
    };

    let mut selected: Vec<String> = Vec::new();
    let mut push = |name: &String| {
        if !selected.contains(name) {
            selected.push(name.clone());
        }
    };

    if let Some(common) = &manifest.common_files_dir {
        let prefix = format!("{common}/");
        for name in members {
            if name.starts_with(&prefix) && !name.ends_with('/') {
                push(name);
            }
        }
    }
    for feature in &manifest.features {
        let chosen = match selections.get(&feature.name).and_then(|s| s.as_ref()) {
            Some(chosen) => chosen,
            None => continue,
        };
        let prefix = format!("{}/{}/", feature.directory, chosen);
        for name in members {
            if name.starts_with(&prefix) && !name.ends_with('/') {
                push(name);
            }
        }
    }

    if selected.is_empty() {
        return Err(ModError::EmptySelection(archive_label.to_string()));
    }
    selected.sort();
    Ok(selected)
}

/// Map destination filenames (relative to the game package dir) to archive
/// members for a manifest selection. Later features override earlier common
/// files with the same destination.
pub fn manifest_dest_map(
    members: &[String],
    manifest: &ModManifest,
    selections: &BTreeMap<String, Option<String>>,
) -> BTreeMap<String, String> {
    let mut dest_to_member = BTreeMap::new();

    if let Some(common) = &manifest.common_files_dir {
        let prefix = format!("{common}/");
        for name in members {
            if name.starts_with(&prefix) && !name.ends_with('/') {
                let dest = &name[prefix.len()..];
                if !dest.is_empty() {
                    dest_to_member.insert(dest.to_string(), name.clone());
                }
            }
        }
    }
    for feature in &manifest.features {
        let chosen = match selections.get(&feature.name).and_then(|s| s.as_ref()) {
            Some(chosen) => chosen,
            None => continue,
        };
        let prefix = format!("{}/{}/", feature.directory, chosen);
        for name in members {
            if name.starts_with(&prefix) && !name.ends_with('/') {
                let dest = &name[prefix.len()..];
                if !dest.is_empty() {
                    dest_to_member.insert(dest.to_string(), name.clone());
                }
            }
        }
    }
    dest_to_member
}

/// Convert the selected members of an archive into loose files.
pub fn convert_selected_members(
    archive_path: &Path,
    selected_members: &[String],
    mod_name: &str,
) -> Result<ConversionResult> {
    let archive_label = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut files: Vec<LooseFile> = Vec::new();
    // lowercased filename -> source member that claimed it
    let mut seen_names: HashMap<String, String> = HashMap::new();
    let mut installable_found = false;

    let claim = |filename: &str, member: &str, seen: &mut HashMap<String, String>| {
        let lowered = filename.to_lowercase();
        if let Some(previous) = seen.get(&lowered) {
            return Err(ModError::NamingCollision {
                archive: archive_label.clone(),
                filename: filename.to_string(),
                member: member.to_string(),
                previous: previous.clone(),
            });
        }
        seen.insert(lowered, member.to_string());
        Ok(())
    };

    for member in selected_members {
        if member.ends_with(".yumiamod.json") {
            continue;
        }

        if member.ends_with(".fdata") {
            installable_found = true;
            let container = archive::read_member(archive_path, member)?;

            let stem = &member[..member.len() - ".fdata".len()];
            let sidecar_member = format!("{stem}.yumiamod.json");
            let overrides = if selected_members.contains(&sidecar_member) {
                let sidecar_data = archive::read_member(archive_path, &sidecar_member)?;
                fdata::parse_sidecar(&sidecar_data)?.filename_overrides()
            } else {
                HashMap::new()
            };

            for entry in fdata::decode_container(&container)? {
                let filename = overrides
                    .get(&(entry.name_hash, entry.tkid_hash))
                    .cloned()
                    .unwrap_or(entry.fallback_name);
                claim(&filename, member, &mut seen_names)?;
                files.push(LooseFile {
                    filename,
                    source_member: member.clone(),
                    data: entry.data,
                });
            }
            continue;
        }

        if scan::is_loose_asset_member(member) {
            installable_found = true;
            let filename = paths::member_file_name(member).to_string();
            claim(&filename, member, &mut seen_names)?;
            files.push(LooseFile {
                filename,
                source_member: member.clone(),
                data: archive::read_member(archive_path, member)?,
            });
        }
    }

    if !installable_found || files.is_empty() {
        return Err(ModError::NoPayload(archive_label));
    }

    Ok(ConversionResult {
        mod_name: mod_name.to_string(),
        files,
    })
}
