//! Asset conflict detection for the RDB backend.
//!
//! Two mods conflict when they both replace the same game asset, identified
//! by the `name_hash` values in their sidecar metadata. The RDB ends up with
//! competing entries for the asset and whichever the tool wrote last wins,
//! so conflicting installs are refused up front. Loose-backend conflicts are
//! a separate filename/ownership check in `manager`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::warn;

use crate::archive;
use crate::fdata;
use crate::paths;
use crate::state::{Backend, InstalledRecord};

/// One installed mod whose assets overlap the candidate's.
#[derive(Debug)]
pub struct Conflict {
    pub archive_filename: String,
    pub overlapping: BTreeSet<u32>,
}

/// Check whether installing `candidate_members` from `archive_path` would
/// collide with any installed RDB mod.
///
/// A candidate selection without sidecars has nothing to compare and never
/// conflicts. Unreadable sidecars (in the archive or on disk) are logged and
/// skipped rather than failing the check.
pub fn find_conflicts(
    archive_path: &Path,
    candidate_members: &[String],
    installed: &BTreeMap<String, InstalledRecord>,
    game_root: &Path,
) -> Vec<Conflict> {
    let incoming = hashes_from_archive(archive_path, candidate_members);
    if incoming.is_empty() {
        return Vec::new();
    }

    let mut conflicts = Vec::new();
    for (filename, record) in installed {
        if record.backend != Backend::Rdb {
            continue;
        }
        let installed_hashes = hashes_from_disk(game_root, &record.installed_paths);
        let overlapping: BTreeSet<u32> =
            incoming.intersection(&installed_hashes).copied().collect();
        if !overlapping.is_empty() {
            conflicts.push(Conflict {
                archive_filename: filename.clone(),
                overlapping,
            });
        }
    }
    conflicts
}

/// Render conflicts the way install errors present them.
pub fn format_conflicts(conflicts: &[Conflict]) -> String {
    let mut lines = Vec::with_capacity(conflicts.len());
    for conflict in conflicts {
        let samples: Vec<String> = conflict
            .overlapping
            .iter()
            .take(5)
            .map(|h| format!("0x{h:08x}"))
            .collect();
        let suffix = if conflict.overlapping.len() > 5 {
            format!(" (+{} more)", conflict.overlapping.len() - 5)
        } else {
            String::new()
        };
        let stem = conflict
            .archive_filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&conflict.archive_filename);
        lines.push(format!(
            "  - {}  ({} asset(s): {}{})",
            stem,
            conflict.overlapping.len(),
            samples.join(", "),
            suffix
        ));
    }
    lines.push(String::new());
    lines.push("Uninstall the conflicting mod(s) before proceeding.".to_string());
    lines.join("\n")
}

fn hashes_from_archive(archive_path: &Path, members: &[String]) -> BTreeSet<u32> {
    let mut hashes = BTreeSet::new();
    for member in members {
        if !member.ends_with(".yumiamod.json") {
            continue;
        }
        let parsed = archive::read_member(archive_path, member)
            .map_err(anyhow::Error::from)
            .and_then(|data| fdata::parse_sidecar(&data));
        match parsed {
            Ok(sidecar) => hashes.extend(sidecar.name_hashes()),
            Err(e) => warn!("Could not read {member} for conflict check: {e}"),
        }
    }
    hashes
}

fn hashes_from_disk(game_root: &Path, installed_paths: &[String]) -> BTreeSet<u32> {
    let mut hashes = BTreeSet::new();
    for relpath in installed_paths {
        if !relpath.ends_with(".yumiamod.json") {
            continue;
        }
        let path = paths::join_relpath(game_root, relpath);
        if !path.exists() {
            continue;
        }
        let parsed = std::fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|data| fdata::parse_sidecar(&data));
        match parsed {
            Ok(sidecar) => hashes.extend(sidecar.name_hashes()),
            Err(e) => warn!("Could not read {} for conflict check: {e}", path.display()),
        }
    }
    hashes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InstallKind;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn build_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn sidecar_json(hashes: &[u32]) -> Vec<u8> {
        let files: Vec<String> = hashes
            .iter()
            .map(|h| format!(r#"{{"filename": "f{h}.g1t", "name_hash": {h}, "tkid_hash": 1}}"#))
            .collect();
        format!(r#"{{"files": [{}]}}"#, files.join(",")).into_bytes()
    }

    fn installed_record(paths: Vec<String>) -> InstalledRecord {
        InstalledRecord {
            archive_filename: "other.zip".to_string(),
            backend: Backend::Rdb,
            install_kind: InstallKind::Legacy,
            display_option_summary: "(default)".to_string(),
            legacy_option_name: None,
            feature_selections: None,
            installed_paths: paths,
            loose_mod_dir: None,
        }
    }

    #[test]
    fn test_overlapping_hashes_conflict() {
        let dir = tempdir().unwrap();
        let game_root = dir.path().join("game");
        let package = game_root.join("package");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(package.join("other.yumiamod.json"), sidecar_json(&[1001, 1002])).unwrap();

        let zip_path = dir.path().join("new.zip");
        build_zip(
            &zip_path,
            &[("package/new.yumiamod.json", &sidecar_json(&[1002, 1003]))],
        );

        let mut installed = BTreeMap::new();
        installed.insert(
            "other.zip".to_string(),
            installed_record(vec!["package/other.yumiamod.json".to_string()]),
        );

        let members = vec!["package/new.yumiamod.json".to_string()];
        let conflicts = find_conflicts(&zip_path, &members, &installed, &game_root);
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].overlapping.contains(&1002));
        assert!(!conflicts[0].overlapping.contains(&1001));
    }

    #[test]
    fn test_disjoint_hashes_do_not_conflict() {
        let dir = tempdir().unwrap();
        let game_root = dir.path().join("game");
        let package = game_root.join("package");
        std::fs::create_dir_all(&package).unwrap();
        std::fs::write(package.join("other.yumiamod.json"), sidecar_json(&[1001])).unwrap();

        let zip_path = dir.path().join("new.zip");
        build_zip(
            &zip_path,
            &[("package/new.yumiamod.json", &sidecar_json(&[2001]))],
        );

        let mut installed = BTreeMap::new();
        installed.insert(
            "other.zip".to_string(),
            installed_record(vec!["package/other.yumiamod.json".to_string()]),
        );

        let members = vec!["package/new.yumiamod.json".to_string()];
        assert!(find_conflicts(&zip_path, &members, &installed, &game_root).is_empty());
    }

    #[test]
    fn test_no_sidecar_means_no_conflict() {
        let dir = tempdir().unwrap();
        let game_root = dir.path().join("game");
        std::fs::create_dir_all(game_root.join("package")).unwrap();

        let zip_path = dir.path().join("new.zip");
        build_zip(&zip_path, &[("package/new.fdata", b"data")]);

        let mut installed = BTreeMap::new();
        installed.insert(
            "other.zip".to_string(),
            installed_record(vec!["package/other.yumiamod.json".to_string()]),
        );

        let members = vec!["package/new.fdata".to_string()];
        assert!(find_conflicts(&zip_path, &members, &installed, &game_root).is_empty());
    }

    #[test]
    fn test_loose_records_ignored() {
        let dir = tempdir().unwrap();
        let game_root = dir.path().join("game");
        let mods = game_root.join("mods").join("Other");
        std::fs::create_dir_all(&mods).unwrap();
        std::fs::write(mods.join("other.yumiamod.json"), sidecar_json(&[1001])).unwrap();

        let zip_path = dir.path().join("new.zip");
        build_zip(
            &zip_path,
            &[("package/new.yumiamod.json", &sidecar_json(&[1001]))],
        );

        let mut rec = installed_record(vec!["mods/Other/other.yumiamod.json".to_string()]);
        rec.backend = Backend::Loose;
        let mut installed = BTreeMap::new();
        installed.insert("other.zip".to_string(), rec);

        let members = vec!["package/new.yumiamod.json".to_string()];
        assert!(find_conflicts(&zip_path, &members, &installed, &game_root).is_empty());
    }
}
