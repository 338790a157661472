//! Backend-aware mod management engine.
//!
//! `ModManager` owns the scanned archive list, the installed-record map and
//! the paths everything hangs off of. Every mutating operation is
//! all-or-nothing over the filesystem/state-file pair: validation happens
//! before the first write, and anything that fails after a write walks an
//! explicit journal backwards to undo itself. The caller is expected to
//! serialize operations; nothing here spawns concurrent work.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::archive::{self, ArchiveFormat};
use crate::conflict;
use crate::convert::{self, ConversionResult, LooseFile};
use crate::error::{ModError, Result};
use crate::paths;
use crate::scan::{self, ArchiveKind, ModArchive, ModOption};
use crate::state::{Backend, InstallKind, InstalledRecord, StateStore};
use crate::tool::{PatchTool, CORE_RDB_BACKUPS, CORE_RDB_FILES, PATCH_TOOL_EXE};

/// DLL loader the loose backend hooks through, expected at the game root.
pub const DLL_LOADER_NAME: &str = "DINPUT8.dll";

/// Loose-file loader plugin files, expected under plugins/.
pub const LOOSE_PLUGIN_DLL: &str = "LooseFileLoader.dll";
pub const LOOSE_PLUGIN_INI: &str = "LooseFileLoader.ini";

type Selections = BTreeMap<String, Option<String>>;

/// Structural readiness of the game installation, recomputed on demand.
#[derive(Debug, Clone)]
pub struct EnvironmentStatus {
    pub package_dir_exists: bool,
    pub game_root_exists: bool,
    pub mods_dir_exists: bool,
    pub patch_tool_available: bool,
    pub dll_loader_available: bool,
    pub loose_plugin_dll_available: bool,
    pub loose_plugin_ini_available: bool,
    pub loose_ready: bool,
    pub has_active_rdb_mods: bool,
    pub has_active_loose_mods: bool,
    pub active_backend: Option<Backend>,
    pub can_install: bool,
    pub can_migrate: bool,
}

/// Successful install summary.
#[derive(Debug)]
pub struct InstallReport {
    pub backend: Backend,
    pub files_installed: usize,
}

/// Uninstall result. The requested mod is always gone in both variants.
#[derive(Debug)]
pub enum UninstallOutcome {
    Clean {
        removed: usize,
    },
    /// The mod was removed but re-applying the remaining RDB mods failed;
    /// they may not work until the tool is run again.
    Degraded {
        removed: usize,
        tool_error: String,
    },
}

/// Successful bulk migration summary.
#[derive(Debug)]
pub struct MigrationReport {
    pub migrated: usize,
}

/// Everything needed to move one install to the loose backend, computed and
/// validated before any disk mutation.
struct MigrationPlanItem {
    archive_filename: String,
    install_kind: InstallKind,
    display_option_summary: String,
    legacy_option_name: Option<String>,
    feature_selections: Option<Selections>,
    loose_mod_dir: String,
    new_installed_paths: Vec<String>,
    old_installed_paths: Vec<String>,
    files: Vec<LooseFile>,
}

pub struct ModManager {
    mods_dir: PathBuf,
    package_dir: PathBuf,
    game_root: PathBuf,
    loose_mods_dir: PathBuf,
    plugins_dir: PathBuf,
    store: StateStore,
    tool: Box<dyn PatchTool>,
    pub archives: Vec<ModArchive>,
    pub installed: BTreeMap<String, InstalledRecord>,
}

impl ModManager {
    pub fn new(mods_dir: &Path, package_dir: &Path, tool: Box<dyn PatchTool>) -> Self {
        let game_root = package_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| package_dir.to_path_buf());
        Self {
            mods_dir: mods_dir.to_path_buf(),
            package_dir: package_dir.to_path_buf(),
            loose_mods_dir: game_root.join("mods"),
            plugins_dir: game_root.join("plugins"),
            game_root,
            store: StateStore::new(package_dir, mods_dir),
            tool,
            archives: Vec::new(),
            installed: BTreeMap::new(),
        }
    }

    /// Swap the patch tool strategy (e.g. for sandbox environments).
    pub fn set_patch_tool(&mut self, tool: Box<dyn PatchTool>) {
        self.tool = tool;
    }

    pub fn game_root(&self) -> &Path {
        &self.game_root
    }

    // ── state ────────────────────────────────────────────────────────

    /// Load installed records, upgrading from the legacy store on first run.
    pub fn load_state(&mut self) {
        if self.store.state_file_exists() {
            self.installed = self.store.load();
            return;
        }
        self.backfill_from_legacy();
    }

    /// Persist the in-memory record map (versioned store + legacy export).
    pub fn save_state(&self) -> Result<()> {
        self.store.save(&self.installed)
    }

    /// Reconstruct v2 records from the unversioned legacy file.
    fn backfill_from_legacy(&mut self) {
        let legacy = self.store.load_legacy();
        self.installed = BTreeMap::new();

        for (key, old) in legacy {
            let scanned = self.find_or_load_archive(&old.archive_filename);
            let installed_paths: Vec<String> = old
                .installed_files
                .iter()
                .map(|p| {
                    if p.starts_with("package/") {
                        p.clone()
                    } else {
                        format!("package/{p}")
                    }
                })
                .collect();

            let mut install_kind = InstallKind::Legacy;
            let mut legacy_option_name = Some(old.option_name.clone());
            let mut feature_selections = None;
            if let Some(scanned) = scanned.as_ref().filter(|a| a.manifest.is_some()) {
                install_kind = InstallKind::Manifest;
                legacy_option_name = None;
                feature_selections = self.resolve_selections_for_summary(
                    scanned,
                    &old.option_name,
                    &installed_paths,
                );
            }

            self.installed.insert(
                key,
                InstalledRecord {
                    archive_filename: old.archive_filename,
                    backend: Backend::Rdb,
                    install_kind,
                    display_option_summary: old.option_name,
                    legacy_option_name,
                    feature_selections,
                    installed_paths,
                    loose_mod_dir: None,
                },
            );
        }

        if let Err(e) = self.save_state() {
            warn!("Could not persist backfilled install state: {e}");
        }
        info!(
            "Backfilled install state from legacy records: {} mod(s)",
            self.installed.len()
        );
    }

    /// Drop records whose files have gone missing on disk (state drift).
    pub fn check_installed_status(&mut self) {
        self.load_state();

        let stale: Vec<String> = self
            .installed
            .iter()
            .filter(|(_, rec)| {
                !rec.installed_paths
                    .iter()
                    .all(|p| paths::join_relpath(&self.game_root, p).exists())
            })
            .map(|(key, rec)| {
                info!(
                    "  Mod '{}' from {}: files missing, marking as not installed",
                    rec.display_option_summary, rec.archive_filename
                );
                key.clone()
            })
            .collect();

        for key in &stale {
            self.installed.remove(key);
        }
        if !stale.is_empty() {
            if let Err(e) = self.save_state() {
                warn!("Could not persist install state: {e}");
            }
        }
        info!("Verified {} mod(s) currently installed", self.installed.len());
    }

    // ── scanning ─────────────────────────────────────────────────────

    pub fn scan_archives(&mut self) -> &[ModArchive] {
        self.archives = scan::scan_mods_dir(&self.mods_dir);
        &self.archives
    }

    pub fn find_archive(&self, archive_filename: &str) -> Option<&ModArchive> {
        self.archives
            .iter()
            .find(|a| a.filename() == archive_filename)
    }

    fn find_or_load_archive(&self, archive_filename: &str) -> Option<ModArchive> {
        if let Some(found) = self.find_archive(archive_filename) {
            return Some(found.clone());
        }
        let candidate = self.mods_dir.join(archive_filename);
        if !candidate.exists() || !ArchiveFormat::is_supported(&candidate) {
            return None;
        }
        match scan::analyze_archive(&candidate) {
            Ok(scanned) => Some(scanned),
            Err(e) => {
                warn!("Could not analyze {archive_filename}: {e}");
                None
            }
        }
    }

    pub fn is_installed(&self, archive_filename: &str) -> bool {
        self.installed.contains_key(archive_filename)
    }

    // ── environment / backend resolution ─────────────────────────────

    /// Pure decision snapshot; safe to call repeatedly, never cached.
    pub fn environment_status(&self) -> EnvironmentStatus {
        let patch_tool_available = self.package_dir.join(PATCH_TOOL_EXE).exists();
        let dll_loader_available = self.game_root.join(DLL_LOADER_NAME).exists();
        let loose_plugin_dll_available = self.plugins_dir.join(LOOSE_PLUGIN_DLL).exists();
        let loose_plugin_ini_available = self.plugins_dir.join(LOOSE_PLUGIN_INI).exists();
        let loose_ready =
            dll_loader_available && loose_plugin_dll_available && loose_plugin_ini_available;

        let has_active_rdb_mods = self
            .installed
            .values()
            .any(|rec| rec.backend == Backend::Rdb);
        let has_active_loose_mods = self
            .installed
            .values()
            .any(|rec| rec.backend == Backend::Loose);
        let active_backend = if has_active_rdb_mods {
            Some(Backend::Rdb)
        } else if has_active_loose_mods {
            Some(Backend::Loose)
        } else {
            None
        };

        let can_install = if has_active_rdb_mods {
            patch_tool_available
        } else if has_active_loose_mods {
            loose_ready
        } else {
            loose_ready || patch_tool_available
        };
        let can_migrate = has_active_rdb_mods && loose_ready && self.backups_exist();

        EnvironmentStatus {
            package_dir_exists: self.package_dir.exists(),
            game_root_exists: self.game_root.exists(),
            mods_dir_exists: self.mods_dir.exists(),
            patch_tool_available,
            dll_loader_available,
            loose_plugin_dll_available,
            loose_plugin_ini_available,
            loose_ready,
            has_active_rdb_mods,
            has_active_loose_mods,
            active_backend,
            can_install,
            can_migrate,
        }
    }

    /// Pick the backend the next install must use, if any is legal.
    pub fn resolve_backend(&self) -> Option<Backend> {
        let status = self.environment_status();
        if status.has_active_rdb_mods {
            return status.patch_tool_available.then_some(Backend::Rdb);
        }
        if status.has_active_loose_mods {
            return status.loose_ready.then_some(Backend::Loose);
        }
        if status.loose_ready {
            Some(Backend::Loose)
        } else if status.patch_tool_available {
            Some(Backend::Rdb)
        } else {
            None
        }
    }

    pub fn validate_paths(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.mods_dir.exists() {
            issues.push(format!("Mods directory does not exist: {}", self.mods_dir.display()));
        }
        if !self.package_dir.exists() {
            issues.push(format!(
                "Game package directory does not exist: {}",
                self.package_dir.display()
            ));
        }
        issues
    }

    // ── install ──────────────────────────────────────────────────────

    /// Install one option of a legacy (package/ or bare-container) archive.
    pub fn install_legacy_mod(
        &mut self,
        scanned: &ModArchive,
        option: &ModOption,
        backend: Option<Backend>,
    ) -> Result<InstallReport> {
        info!("Installing '{}' from {}...", option.name, scanned.filename());
        if self.is_installed(&scanned.filename()) {
            return Err(ModError::AlreadyInstalled(scanned.filename()));
        }
        let backend = backend.or_else(|| self.resolve_backend()).ok_or(ModError::NoBackend)?;
        match backend {
            Backend::Rdb => self.install_rdb_legacy(scanned, option),
            Backend::Loose => self.install_loose_legacy(scanned, option),
        }
    }

    /// Install a manifest archive with an explicit feature selection.
    pub fn install_manifest_mod(
        &mut self,
        scanned: &ModArchive,
        selections: &Selections,
        backend: Option<Backend>,
    ) -> Result<InstallReport> {
        if scanned.manifest.is_none() {
            return Err(ModError::SelectionInvalid(format!(
                "{} is not a manifest mod",
                scanned.filename()
            )));
        }
        info!("Installing manifest mod {}...", scanned.filename());
        if self.is_installed(&scanned.filename()) {
            return Err(ModError::AlreadyInstalled(scanned.filename()));
        }
        let backend = backend.or_else(|| self.resolve_backend()).ok_or(ModError::NoBackend)?;
        match backend {
            Backend::Rdb => self.install_rdb_manifest(scanned, selections),
            Backend::Loose => self.install_loose_manifest(scanned, selections),
        }
    }

    /// Install a direct loose-file archive with independently toggled options.
    pub fn install_direct_loose_mod(
        &mut self,
        scanned: &ModArchive,
        options: &[ModOption],
        backend: Option<Backend>,
    ) -> Result<InstallReport> {
        info!("Installing loose-file mod from {}...", scanned.filename());
        if self.is_installed(&scanned.filename()) {
            return Err(ModError::AlreadyInstalled(scanned.filename()));
        }
        if scanned.kind != ArchiveKind::DirectLoose {
            return Err(ModError::SelectionInvalid(format!(
                "{} is not a direct loose-file mod",
                scanned.filename()
            )));
        }
        let backend = backend.or_else(|| self.resolve_backend()).ok_or(ModError::NoBackend)?;
        if backend != Backend::Loose {
            return Err(ModError::BackendMismatch(
                self.loose_backend_action_message(false),
            ));
        }

        let members = selected_direct_loose_members(scanned, options);
        if members.is_empty() {
            return Err(ModError::SelectionInvalid(
                "select at least one loose-file option to install".into(),
            ));
        }
        let result = convert::convert_selected_members(&scanned.path, &members, &scanned.name)?;
        let summary = build_direct_loose_summary(scanned, options);
        self.install_loose_files(scanned, InstallKind::Legacy, summary, None, None, result)
    }

    fn install_rdb_legacy(
        &mut self,
        scanned: &ModArchive,
        option: &ModOption,
    ) -> Result<InstallReport> {
        if scanned.kind == ArchiveKind::DirectLoose {
            return Err(ModError::BackendMismatch(
                self.loose_backend_action_message(false),
            ));
        }

        let members = selected_option_members(scanned, option);
        self.check_rdb_conflicts(scanned, &members)?;

        let staging = tempfile::tempdir()?;
        info!("  Extracting {} file(s)...", members.len());
        archive::extract_members(&scanned.path, &members, staging.path())?;

        let mut installed_paths = Vec::new();
        for file in &option.files {
            let src = paths::join_relpath(staging.path(), &format!("{}{}", option.prefix, file));
            let dst = paths::join_relpath(&self.package_dir, file);
            if !src.exists() {
                warn!("  Expected file not found after extraction: {}", src.display());
                continue;
            }
            paths::ensure_parent_dirs(&dst)?;
            fs::copy(&src, &dst)?;
            installed_paths.push(format!("package/{file}"));
            info!("  Copied: package/{file}");
        }
        drop(staging);

        if installed_paths.is_empty() {
            return Err(ModError::EmptySelection(scanned.filename()));
        }

        self.run_tool_or_rollback(&installed_paths)?;

        let count = installed_paths.len();
        self.installed.insert(
            scanned.filename(),
            InstalledRecord {
                archive_filename: scanned.filename(),
                backend: Backend::Rdb,
                install_kind: InstallKind::Legacy,
                display_option_summary: option.name.clone(),
                legacy_option_name: Some(option.name.clone()),
                feature_selections: None,
                installed_paths,
                loose_mod_dir: None,
            },
        );
        self.save_state()?;
        info!("  Successfully installed '{}' ({count} files)", option.name);
        Ok(InstallReport {
            backend: Backend::Rdb,
            files_installed: count,
        })
    }

    fn install_rdb_manifest(
        &mut self,
        scanned: &ModArchive,
        selections: &Selections,
    ) -> Result<InstallReport> {
        scan::validate_selections(scanned, selections)?;
        let manifest = scanned.manifest.as_ref().expect("manifest checked by caller");

        let dest_to_member = convert::manifest_dest_map(&scanned.members, manifest, selections);
        if dest_to_member.is_empty() {
            return Err(ModError::EmptySelection(scanned.filename()));
        }

        // A selection resolving to loose assets can't go through the tool
        let has_loose_assets = dest_to_member.values().any(|member| {
            scan::is_loose_asset_member(member)
                && !member.ends_with(".fdata")
                && !member.ends_with(".yumiamod.json")
        });
        if has_loose_assets {
            return Err(ModError::BackendMismatch(
                self.loose_backend_action_message(true),
            ));
        }

        let rdb_map: BTreeMap<&String, &String> = dest_to_member
            .iter()
            .filter(|(_, member)| {
                member.ends_with(".fdata") || member.ends_with(".yumiamod.json")
            })
            .collect();
        if rdb_map.is_empty() {
            return Err(ModError::SelectionInvalid(
                "the selected options contain no RDB-compatible files".into(),
            ));
        }

        let members: Vec<String> = rdb_map.values().map(|m| (*m).clone()).collect();
        self.check_rdb_conflicts(scanned, &members)?;

        let staging = tempfile::tempdir()?;
        archive::extract_members(&scanned.path, &members, staging.path())?;

        let mut installed_paths = Vec::new();
        for (dest_file, member) in &rdb_map {
            let src = paths::join_relpath(staging.path(), member);
            let dst = paths::join_relpath(&self.package_dir, dest_file);
            if !src.exists() {
                warn!("  Expected file not found after extraction: {}", src.display());
                continue;
            }
            paths::ensure_parent_dirs(&dst)?;
            fs::copy(&src, &dst)?;
            installed_paths.push(format!("package/{dest_file}"));
            info!("  Copied: package/{dest_file}");
        }
        drop(staging);

        if installed_paths.is_empty() {
            return Err(ModError::EmptySelection(scanned.filename()));
        }

        self.run_tool_or_rollback(&installed_paths)?;

        let summary = build_feature_summary(manifest, selections);
        let count = installed_paths.len();
        self.installed.insert(
            scanned.filename(),
            InstalledRecord {
                archive_filename: scanned.filename(),
                backend: Backend::Rdb,
                install_kind: InstallKind::Manifest,
                display_option_summary: summary,
                legacy_option_name: None,
                feature_selections: Some(selections.clone()),
                installed_paths,
                loose_mod_dir: None,
            },
        );
        self.save_state()?;
        info!("  Successfully installed manifest mod ({count} files)");
        Ok(InstallReport {
            backend: Backend::Rdb,
            files_installed: count,
        })
    }

    fn install_loose_legacy(
        &mut self,
        scanned: &ModArchive,
        option: &ModOption,
    ) -> Result<InstallReport> {
        let members = selected_option_members(scanned, option);
        let result = convert::convert_selected_members(&scanned.path, &members, &scanned.name)?;
        self.install_loose_files(
            scanned,
            InstallKind::Legacy,
            option.name.clone(),
            Some(option.name.clone()),
            None,
            result,
        )
    }

    fn install_loose_manifest(
        &mut self,
        scanned: &ModArchive,
        selections: &Selections,
    ) -> Result<InstallReport> {
        scan::validate_selections(scanned, selections)?;
        let manifest = scanned.manifest.as_ref().expect("manifest checked by caller");

        let members = convert::select_manifest_members(
            &scanned.filename(),
            &scanned.members,
            Some(manifest),
            selections,
        )?;
        let result = convert::convert_selected_members(&scanned.path, &members, &scanned.name)?;
        let summary = build_feature_summary(manifest, selections);
        self.install_loose_files(
            scanned,
            InstallKind::Manifest,
            summary,
            None,
            Some(selections.clone()),
            result,
        )
    }

    /// Shared tail of every loose install: conflict checks, journaled write,
    /// record + persist.
    fn install_loose_files(
        &mut self,
        scanned: &ModArchive,
        install_kind: InstallKind,
        display_summary: String,
        legacy_option_name: Option<String>,
        feature_selections: Option<Selections>,
        result: ConversionResult,
    ) -> Result<InstallReport> {
        let loose_mod_dir = format!("mods/{}", paths::sanitize_mod_dir_name(&result.mod_name));
        let filenames: Vec<String> = result.files.iter().map(|f| f.filename.clone()).collect();
        self.check_loose_conflicts(&loose_mod_dir, &filenames)?;

        let count = self.write_loose_files(&loose_mod_dir, &result.files)?;

        let installed_paths: Vec<String> = result
            .files
            .iter()
            .map(|f| format!("{loose_mod_dir}/{}", f.filename))
            .collect();
        self.installed.insert(
            scanned.filename(),
            InstalledRecord {
                archive_filename: scanned.filename(),
                backend: Backend::Loose,
                install_kind,
                display_option_summary: display_summary.clone(),
                legacy_option_name,
                feature_selections,
                installed_paths,
                loose_mod_dir: Some(loose_mod_dir),
            },
        );
        self.save_state()?;
        info!("  Successfully installed '{display_summary}' ({count} files)");
        Ok(InstallReport {
            backend: Backend::Loose,
            files_installed: count,
        })
    }

    fn check_rdb_conflicts(&self, scanned: &ModArchive, members: &[String]) -> Result<()> {
        let conflicts =
            conflict::find_conflicts(&scanned.path, members, &self.installed, &self.game_root);
        if conflicts.is_empty() {
            Ok(())
        } else {
            Err(ModError::AssetConflict(conflict::format_conflicts(&conflicts)))
        }
    }

    /// Run the patch tool; on failure remove the files just copied.
    fn run_tool_or_rollback(&self, installed_paths: &[String]) -> Result<()> {
        info!("  Running patch tool to update RDB files...");
        match self.tool.apply(&self.package_dir) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("  Patch tool failed, rolling back...");
                for relpath in installed_paths {
                    let fp = paths::join_relpath(&self.game_root, relpath);
                    if fp.exists() {
                        let _ = fs::remove_file(&fp);
                    }
                }
                Err(e)
            }
        }
    }

    // ── loose backend plumbing ───────────────────────────────────────

    /// Loose files on disk, relative to the game root (mods/<dir>/<file> or
    /// mods/<file> only; deeper nesting belongs to the mods themselves).
    fn loose_disk_files(&self) -> Vec<String> {
        let mut relpaths = Vec::new();
        if !self.loose_mods_dir.exists() {
            return relpaths;
        }
        for entry in WalkDir::new(&self.loose_mods_dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel_to_mods = entry
                .path()
                .strip_prefix(&self.loose_mods_dir)
                .unwrap_or(entry.path());
            if rel_to_mods.components().count() > 2 {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.game_root) {
                relpaths.push(paths::to_slash(&rel.to_string_lossy()));
            }
        }
        relpaths
    }

    /// Reject a loose install whose target folder or filenames are already
    /// claimed, by a tracked mod or by untracked files on disk.
    fn check_loose_conflicts(&self, loose_mod_dir: &str, filenames: &[String]) -> Result<()> {
        let mut issues: Vec<String> = Vec::new();
        let planned: BTreeMap<String, &String> = filenames
            .iter()
            .map(|name| (name.to_lowercase(), name))
            .collect();
        let target_dir_lower = loose_mod_dir.to_lowercase();
        let mut tracked_paths: HashSet<String> = HashSet::new();

        for (archive_filename, rec) in &self.installed {
            if rec.backend != Backend::Loose {
                continue;
            }
            if let Some(dir) = &rec.loose_mod_dir {
                if dir.to_lowercase() == target_dir_lower {
                    issues.push(format!(
                        "Target loose mod folder '{loose_mod_dir}' is already owned by '{archive_filename}'."
                    ));
                }
            }
            for relpath in &rec.installed_paths {
                tracked_paths.insert(relpath.to_lowercase());
                let basename = paths::member_file_name(relpath).to_lowercase();
                if let Some(original) = planned.get(&basename) {
                    issues.push(format!(
                        "Loose file '{original}' conflicts with installed mod '{archive_filename}'."
                    ));
                }
            }
        }

        for relpath in self.loose_disk_files() {
            if tracked_paths.contains(&relpath.to_lowercase()) {
                continue;
            }
            let basename = paths::member_file_name(&relpath).to_lowercase();
            if let Some(original) = planned.get(&basename) {
                issues.push(format!(
                    "Loose file '{original}' conflicts with existing file '{relpath}'."
                ));
            }
        }

        let target_dir = paths::join_relpath(&self.game_root, loose_mod_dir);
        if target_dir.is_dir() {
            for entry in WalkDir::new(&target_dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let relpath = entry
                    .path()
                    .strip_prefix(&self.game_root)
                    .map(|p| paths::to_slash(&p.to_string_lossy()))
                    .unwrap_or_default();
                if !tracked_paths.contains(&relpath.to_lowercase()) {
                    issues.push(format!(
                        "Target loose mod folder '{loose_mod_dir}' already contains untracked files."
                    ));
                    break;
                }
            }
        }

        if issues.is_empty() {
            return Ok(());
        }
        let mut deduped: Vec<String> = Vec::new();
        for issue in issues {
            if !deduped.contains(&issue) {
                deduped.push(issue);
            }
        }
        Err(ModError::LooseOwnershipConflict(deduped.join("\n")))
    }

    /// Write converted files under the mod folder; on any failure delete what
    /// was written and prune the emptied directories.
    fn write_loose_files(&self, loose_mod_dir: &str, files: &[LooseFile]) -> Result<usize> {
        let target_dir = paths::join_relpath(&self.game_root, loose_mod_dir);
        let mut written: Vec<PathBuf> = Vec::new();

        let outcome = (|| -> Result<()> {
            fs::create_dir_all(&target_dir)?;
            for file in files {
                let dst = paths::join_relpath(&target_dir, &file.filename);
                paths::ensure_parent_dirs(&dst)?;
                fs::write(&dst, &file.data)?;
                written.push(dst);
                info!("  Wrote: {loose_mod_dir}/{}", file.filename);
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => Ok(files.len()),
            Err(e) => {
                warn!("  Loose install failed, rolling back...");
                for path in written.iter().rev() {
                    if path.exists() {
                        let _ = fs::remove_file(path);
                    }
                }
                paths::cleanup_empty_dirs(&target_dir, &self.loose_mods_dir);
                Err(e)
            }
        }
    }

    fn loose_backend_action_message(&self, selection_specific: bool) -> String {
        let status = self.environment_status();
        let subject = if selection_specific {
            "The selected option uses LooseFileLoader assets"
        } else {
            "This mod is packaged for LooseFileLoader"
        };
        if !status.loose_ready {
            format!(
                "{subject} and cannot be installed with the RDB patch tool.\n\n\
                 Install the DLL loader and the LooseFileLoader plugin, then try again."
            )
        } else if status.has_active_rdb_mods {
            format!(
                "{subject} and cannot be installed with the RDB patch tool.\n\n\
                 LooseFileLoader is ready, but installs still route through the RDB backend \
                 while RDB-managed mods are active. Migrate the existing installs to the \
                 loose backend, or uninstall them first."
            )
        } else {
            format!(
                "{subject} and cannot be installed with the RDB patch tool.\n\n\
                 LooseFileLoader is ready. Switch to the loose-file workflow and try again."
            )
        }
    }

    // ── uninstall ────────────────────────────────────────────────────

    pub fn uninstall_mod(&mut self, archive_filename: &str) -> Result<UninstallOutcome> {
        let rec = self
            .installed
            .get(archive_filename)
            .cloned()
            .ok_or_else(|| ModError::NotInstalled(archive_filename.to_string()))?;

        info!(
            "Uninstalling '{}' from {archive_filename}...",
            rec.display_option_summary
        );
        match rec.backend {
            Backend::Loose => self.uninstall_loose(archive_filename, &rec),
            Backend::Rdb => self.uninstall_rdb(archive_filename, &rec),
        }
    }

    fn remove_recorded_files(&self, rec: &InstalledRecord, stop_at: &Path) -> usize {
        let mut removed = 0;
        for relpath in &rec.installed_paths {
            let fp = paths::join_relpath(&self.game_root, relpath);
            if fp.exists() {
                if let Err(e) = fs::remove_file(&fp) {
                    warn!("  Could not remove {relpath}: {e}");
                } else {
                    removed += 1;
                    info!("  Removed: {relpath}");
                }
            } else {
                info!("  Already missing: {relpath}");
            }
            if let Some(parent) = fp.parent() {
                paths::cleanup_empty_dirs(parent, stop_at);
            }
        }
        removed
    }

    fn uninstall_loose(
        &mut self,
        archive_filename: &str,
        rec: &InstalledRecord,
    ) -> Result<UninstallOutcome> {
        let removed = self.remove_recorded_files(rec, &self.loose_mods_dir);
        self.installed.remove(archive_filename);
        self.save_state()?;
        info!("  Successfully uninstalled '{}'", rec.display_option_summary);
        Ok(UninstallOutcome::Clean { removed })
    }

    fn uninstall_rdb(
        &mut self,
        archive_filename: &str,
        rec: &InstalledRecord,
    ) -> Result<UninstallOutcome> {
        let removed = self.remove_recorded_files(rec, &self.package_dir);

        if self.backups_exist() {
            info!("  Restoring RDB backups...");
            self.restore_rdb_backups();
        } else {
            warn!("  RDB backups not found; verify game file integrity to restore core files");
        }

        // Drop the record before re-running the tool: a failed re-application
        // must still leave this mod uninstalled in state.
        self.installed.remove(archive_filename);
        self.save_state()?;

        let remaining_rdb = self
            .installed
            .values()
            .filter(|r| r.backend == Backend::Rdb)
            .count();
        if remaining_rdb > 0 {
            info!("  Re-applying {remaining_rdb} remaining mod(s) via the patch tool...");
            if let Err(e) = self.tool.apply(&self.package_dir) {
                warn!("  Patch tool failed during re-application: {e}");
                return Ok(UninstallOutcome::Degraded {
                    removed,
                    tool_error: e.to_string(),
                });
            }
        } else {
            info!("  No other RDB mods to re-apply.");
        }

        info!("  Successfully uninstalled '{}'", rec.display_option_summary);
        Ok(UninstallOutcome::Clean { removed })
    }

    fn backups_exist(&self) -> bool {
        CORE_RDB_BACKUPS
            .iter()
            .all(|b| self.package_dir.join(b).exists())
    }

    fn restore_rdb_backups(&self) {
        for (core, backup) in CORE_RDB_FILES.iter().zip(CORE_RDB_BACKUPS) {
            let src = self.package_dir.join(backup);
            let dst = self.package_dir.join(core);
            if src.exists() {
                if let Err(e) = fs::copy(&src, &dst) {
                    warn!("  Could not restore {backup} -> {core}: {e}");
                } else {
                    info!("  Restored {backup} -> {core}");
                }
            } else {
                warn!("  Backup {backup} not found!");
            }
        }
    }

    // ── migration ────────────────────────────────────────────────────

    /// Move every RDB-managed install to the loose backend in one
    /// transaction. The caller sees either complete success or the exact
    /// pre-migration state.
    pub fn migrate_all_to_loose(&mut self) -> Result<MigrationReport> {
        info!("Starting migration from RDB installs to LooseFileLoader...");
        let plans = self.build_migration_plan()?;

        // Snapshot everything the transaction may touch
        let mut staged_core: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for core in CORE_RDB_FILES {
            let path = self.package_dir.join(core);
            if path.exists() {
                staged_core.insert(core.to_string(), fs::read(&path)?);
            }
        }
        let mut staged_package: Vec<(PathBuf, Vec<u8>)> = Vec::new();
        for plan in &plans {
            for relpath in &plan.old_installed_paths {
                let fp = paths::join_relpath(&self.game_root, relpath);
                if fp.exists() {
                    staged_package.push((fp.clone(), fs::read(&fp)?));
                }
            }
        }
        let old_records = self.installed.clone();

        let mut written: Vec<PathBuf> = Vec::new();
        match self.execute_migration(&plans, &mut written) {
            Ok(()) => {
                info!(
                    "Migration complete: {} mod(s) moved to LooseFileLoader",
                    plans.len()
                );
                Ok(MigrationReport {
                    migrated: plans.len(),
                })
            }
            Err(e) => {
                warn!("  Migration failed, rolling back: {e}");
                for (core, data) in &staged_core {
                    if let Err(re) = fs::write(self.package_dir.join(core), data) {
                        warn!("  Could not restore {core}: {re}");
                    }
                }
                for (path, data) in &staged_package {
                    let restore = paths::ensure_parent_dirs(path)
                        .and_then(|_| fs::write(path, data));
                    if let Err(re) = restore {
                        warn!("  Could not restore {}: {re}", path.display());
                    }
                }
                for path in written.iter().rev() {
                    if path.exists() {
                        let _ = fs::remove_file(path);
                    }
                }
                for plan in &plans {
                    let target_dir = paths::join_relpath(&self.game_root, &plan.loose_mod_dir);
                    if target_dir.exists() {
                        paths::cleanup_empty_dirs(&target_dir, &self.loose_mods_dir);
                    }
                }
                self.installed = old_records;
                if let Err(re) = self.save_state() {
                    warn!("  Could not persist rolled-back state: {re}");
                }
                Err(e)
            }
        }
    }

    fn execute_migration(
        &mut self,
        plans: &[MigrationPlanItem],
        written: &mut Vec<PathBuf>,
    ) -> Result<()> {
        for plan in plans {
            let target_dir = paths::join_relpath(&self.game_root, &plan.loose_mod_dir);
            fs::create_dir_all(&target_dir)?;
            for file in &plan.files {
                let dst = paths::join_relpath(&target_dir, &file.filename);
                paths::ensure_parent_dirs(&dst)?;
                fs::write(&dst, &file.data)?;
                written.push(dst);
                info!("  Wrote: {}/{}", plan.loose_mod_dir, file.filename);
            }
        }

        for plan in plans {
            for relpath in &plan.old_installed_paths {
                let fp = paths::join_relpath(&self.game_root, relpath);
                if fp.exists() {
                    fs::remove_file(&fp)?;
                    info!("  Removed: {relpath}");
                }
            }
        }

        info!("  Restoring vanilla RDB files...");
        self.restore_rdb_backups();

        for plan in plans {
            self.installed.insert(
                plan.archive_filename.clone(),
                InstalledRecord {
                    archive_filename: plan.archive_filename.clone(),
                    backend: Backend::Loose,
                    install_kind: plan.install_kind,
                    display_option_summary: plan.display_option_summary.clone(),
                    legacy_option_name: plan.legacy_option_name.clone(),
                    feature_selections: plan.feature_selections.clone(),
                    installed_paths: plan.new_installed_paths.clone(),
                    loose_mod_dir: Some(plan.loose_mod_dir.clone()),
                },
            );
        }
        self.save_state()?;
        Ok(())
    }

    /// Recompute each RDB install's selection and validate the entire plan
    /// before touching disk.
    fn build_migration_plan(&self) -> Result<Vec<MigrationPlanItem>> {
        let status = self.environment_status();
        if !status.has_active_rdb_mods {
            return Err(ModError::MigrationBlocked(
                "no RDB-managed mods are installed".into(),
            ));
        }
        if !status.loose_ready {
            return Err(ModError::MigrationBlocked(
                "LooseFileLoader prerequisites are missing".into(),
            ));
        }
        if !self.backups_exist() {
            return Err(ModError::MigrationBlocked(
                "RDB backups are required before migration".into(),
            ));
        }

        let mut items: Vec<MigrationPlanItem> = Vec::new();
        let mut planned_names: BTreeMap<String, String> = BTreeMap::new();
        let mut planned_dirs: HashSet<String> = HashSet::new();

        for rec in self.installed.values() {
            if rec.backend != Backend::Rdb {
                continue;
            }
            let scanned = self.find_or_load_archive(&rec.archive_filename).ok_or_else(|| {
                ModError::MigrationBlocked(format!(
                    "installed archive not found in mods folder: {}",
                    rec.archive_filename
                ))
            })?;

            let (result, display, legacy_option_name, feature_selections) =
                match rec.install_kind {
                    InstallKind::Manifest => {
                        let manifest = scanned.manifest.as_ref().ok_or_else(|| {
                            ModError::MigrationBlocked(format!(
                                "archive no longer exposes a manifest: {}",
                                rec.archive_filename
                            ))
                        })?;
                        let selections =
                            self.resolve_record_selections(rec, &scanned).ok_or_else(|| {
                                ModError::MigrationBlocked(format!(
                                    "could not reconstruct manifest selections for {}",
                                    rec.archive_filename
                                ))
                            })?;
                        let members = convert::select_manifest_members(
                            &rec.archive_filename,
                            &scanned.members,
                            Some(manifest),
                            &selections,
                        )
                        .map_err(|e| migration_convert_error(&rec.archive_filename, e))?;
                        let result =
                            convert::convert_selected_members(&scanned.path, &members, &scanned.name)
                                .map_err(|e| migration_convert_error(&rec.archive_filename, e))?;
                        let display = build_feature_summary(manifest, &selections);
                        (result, display, None, Some(selections))
                    }
                    InstallKind::Legacy => {
                        let option = resolve_legacy_option(rec, &scanned).ok_or_else(|| {
                            ModError::MigrationBlocked(format!(
                                "could not reconstruct the installed option for {}",
                                rec.archive_filename
                            ))
                        })?;
                        let members = selected_option_members(&scanned, &option);
                        let result =
                            convert::convert_selected_members(&scanned.path, &members, &scanned.name)
                                .map_err(|e| migration_convert_error(&rec.archive_filename, e))?;
                        (result, option.name.clone(), Some(option.name.clone()), None)
                    }
                };

            let loose_mod_dir =
                format!("mods/{}", paths::sanitize_mod_dir_name(&result.mod_name));
            if !planned_dirs.insert(loose_mod_dir.to_lowercase()) {
                return Err(ModError::MigrationBlocked(format!(
                    "migration would reuse loose mod folder '{loose_mod_dir}' more than once"
                )));
            }
            for file in &result.files {
                let lowered = file.filename.to_lowercase();
                if planned_names.contains_key(&lowered) {
                    return Err(ModError::MigrationBlocked(format!(
                        "migration would create conflicting loose file '{}'",
                        file.filename
                    )));
                }
                planned_names.insert(lowered, rec.archive_filename.clone());
            }

            let new_installed_paths: Vec<String> = result
                .files
                .iter()
                .map(|f| format!("{loose_mod_dir}/{}", f.filename))
                .collect();
            items.push(MigrationPlanItem {
                archive_filename: rec.archive_filename.clone(),
                install_kind: rec.install_kind,
                display_option_summary: display,
                legacy_option_name,
                feature_selections,
                loose_mod_dir,
                new_installed_paths,
                old_installed_paths: rec.installed_paths.clone(),
                files: result.files,
            });
        }

        for item in &items {
            let filenames: Vec<String> =
                item.files.iter().map(|f| f.filename.clone()).collect();
            self.check_loose_conflicts(&item.loose_mod_dir, &filenames)?;
        }

        Ok(items)
    }

    // ── selection reconstruction ─────────────────────────────────────

    /// Best selection map for a stored manifest record: the stored map if
    /// still valid, else a summary re-parse, else file-set inference.
    fn resolve_record_selections(
        &self,
        rec: &InstalledRecord,
        scanned: &ModArchive,
    ) -> Option<Selections> {
        if let Some(stored) = &rec.feature_selections {
            if !stored.is_empty() && scan::validate_selections(scanned, stored).is_ok() {
                return Some(stored.clone());
            }
        }
        self.resolve_selections_for_summary(
            scanned,
            &rec.display_option_summary,
            &rec.installed_paths,
        )
    }

    fn resolve_selections_for_summary(
        &self,
        scanned: &ModArchive,
        summary: &str,
        installed_paths: &[String],
    ) -> Option<Selections> {
        let manifest = scanned.manifest.as_ref()?;
        let parsed = parse_feature_summary(summary);
        if !parsed.is_empty() {
            let candidate: Selections = manifest
                .features
                .iter()
                .map(|f| (f.name.clone(), parsed.get(&f.name).cloned()))
                .collect();
            if scan::validate_selections(scanned, &candidate).is_ok() {
                return Some(candidate);
            }
        }
        infer_selections_from_installed_files(scanned, installed_paths)
    }
}

// ── free helpers ─────────────────────────────────────────────────────

fn migration_convert_error(archive_filename: &str, e: ModError) -> ModError {
    ModError::MigrationBlocked(format!("could not convert {archive_filename}: {e}"))
}

/// Members an option install resolves to. Direct-loose options add the
/// archive's common files; legacy options prepend their prefix.
fn selected_option_members(scanned: &ModArchive, option: &ModOption) -> Vec<String> {
    if scanned.kind == ArchiveKind::DirectLoose {
        let mut members = scanned.common_files.clone();
        for file in &option.files {
            if !members.contains(file) {
                members.push(file.clone());
            }
        }
        return members;
    }
    option
        .files
        .iter()
        .map(|f| format!("{}{f}", option.prefix))
        .collect()
}

fn selected_direct_loose_members(scanned: &ModArchive, options: &[ModOption]) -> Vec<String> {
    let mut members = scanned.common_files.clone();
    for option in options {
        for file in &option.files {
            if !members.contains(file) {
                members.push(file.clone());
            }
        }
    }
    members
}

fn build_direct_loose_summary(scanned: &ModArchive, options: &[ModOption]) -> String {
    let names: Vec<&str> = options.iter().map(|o| o.name.as_str()).collect();
    if !names.is_empty() {
        let joined = names.join("; ");
        if !scanned.common_files.is_empty() {
            return format!("Common + {joined}");
        }
        return joined;
    }
    if !scanned.common_files.is_empty() {
        return "(common files only)".to_string();
    }
    scan::DEFAULT_OPTION.to_string()
}

fn build_feature_summary(
    manifest: &crate::manifest::ModManifest,
    selections: &Selections,
) -> String {
    let parts: Vec<String> = manifest
        .features
        .iter()
        .filter_map(|f| {
            selections
                .get(&f.name)
                .and_then(|s| s.as_ref())
                .map(|chosen| format!("{}: {chosen}", f.name))
        })
        .collect();
    if parts.is_empty() {
        "(common files only)".to_string()
    } else {
        parts.join("; ")
    }
}

fn parse_feature_summary(summary: &str) -> BTreeMap<String, String> {
    let mut selections = BTreeMap::new();
    for chunk in summary.split(';') {
        let part = chunk.trim();
        if let Some((feature, option)) = part.split_once(':') {
            selections.insert(feature.trim().to_string(), option.trim().to_string());
        }
    }
    selections
}

/// Files an option would install, relative to the package dir.
fn feature_option_dest_files(
    scanned: &ModArchive,
    feature_name: &str,
    option_name: &str,
) -> HashSet<String> {
    let manifest = match &scanned.manifest {
        Some(m) => m,
        None => return HashSet::new(),
    };
    let feature = match manifest.features.iter().find(|f| f.name == feature_name) {
        Some(f) => f,
        None => return HashSet::new(),
    };
    let prefix = format!("{}/{option_name}/", feature.directory);
    scanned
        .members
        .iter()
        .filter(|name| name.starts_with(&prefix) && !name.ends_with('/'))
        .map(|name| name[prefix.len()..].to_string())
        .filter(|dest| !dest.is_empty())
        .collect()
}

/// Infer which option each feature had from the installed file set.
///
/// A feature whose installed files match more than one option is ambiguous;
/// guessing could corrupt a live install, so inference fails instead.
fn infer_selections_from_installed_files(
    scanned: &ModArchive,
    installed_paths: &[String],
) -> Option<Selections> {
    let manifest = scanned.manifest.as_ref()?;
    let package_files: HashSet<String> = installed_paths
        .iter()
        .map(|p| p.strip_prefix("package/").unwrap_or(p).to_string())
        .collect();

    let mut selections = Selections::new();
    for feature in &manifest.features {
        let empty = Vec::new();
        let options = scanned.feature_options.get(&feature.name).unwrap_or(&empty);
        let matches: Vec<&String> = options
            .iter()
            .filter(|option| {
                let files = feature_option_dest_files(scanned, &feature.name, option);
                !files.is_empty() && files.iter().all(|f| package_files.contains(f))
            })
            .collect();
        match matches.len() {
            1 => {
                selections.insert(feature.name.clone(), Some(matches[0].clone()));
            }
            0 if feature.optional => {
                selections.insert(feature.name.clone(), None);
            }
            _ => return None,
        }
    }

    scan::validate_selections(scanned, &selections)
        .ok()
        .map(|_| selections)
}

/// Find the option a legacy record installed, by stored name first, falling
/// back to the only option when the archive has exactly one.
fn resolve_legacy_option(rec: &InstalledRecord, scanned: &ModArchive) -> Option<ModOption> {
    let target = rec
        .legacy_option_name
        .as_deref()
        .unwrap_or(&rec.display_option_summary);
    if let Some(option) = scanned.options.iter().find(|o| o.name == target) {
        return Some(option.clone());
    }
    if scanned.options.len() == 1 {
        return Some(scanned.options[0].clone());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdata;
    use crate::state::{LEGACY_STATE_FILENAME, STATE_FILENAME};
    use crate::tool::{FailingPatchTool, MockPatchTool};
    use std::fs::File;
    use std::io::Write;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _root: TempDir,
        mods_dir: PathBuf,
        game_root: PathBuf,
        package_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempdir().unwrap();
            let mods_dir = root.path().join("downloads");
            let game_root = root.path().join("game");
            let package_dir = game_root.join("package");
            fs::create_dir_all(&mods_dir).unwrap();
            fs::create_dir_all(&package_dir).unwrap();
            Self {
                _root: root,
                mods_dir,
                game_root,
                package_dir,
            }
        }

        fn manager(&self) -> ModManager {
            let mut manager =
                ModManager::new(&self.mods_dir, &self.package_dir, Box::new(MockPatchTool));
            manager.load_state();
            manager
        }

        fn enable_rdb_backend(&self) {
            fs::write(self.package_dir.join(PATCH_TOOL_EXE), b"exe").unwrap();
        }

        fn enable_loose_backend(&self) {
            fs::write(self.game_root.join(DLL_LOADER_NAME), b"dll").unwrap();
            let plugins = self.game_root.join("plugins");
            fs::create_dir_all(&plugins).unwrap();
            fs::write(plugins.join(LOOSE_PLUGIN_DLL), b"dll").unwrap();
            fs::write(plugins.join(LOOSE_PLUGIN_INI), b"ini").unwrap();
        }

        /// Overwrite the core files and their backups with known bytes.
        fn stamp_core_files(&self, core: &[u8], backup: &[u8]) {
            for (core_name, backup_name) in CORE_RDB_FILES.iter().zip(CORE_RDB_BACKUPS) {
                fs::write(self.package_dir.join(core_name), core).unwrap();
                fs::write(self.package_dir.join(backup_name), backup).unwrap();
            }
        }

        fn build_zip(&self, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
            let path = self.mods_dir.join(name);
            let file = File::create(&path).unwrap();
            let mut zip = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            for (entry_name, data) in entries {
                zip.start_file(*entry_name, options).unwrap();
                zip.write_all(data).unwrap();
            }
            zip.finish().unwrap();
            path
        }

        fn scanned(&self, path: &Path) -> ModArchive {
            scan::analyze_archive(path).unwrap()
        }

        fn package_file(&self, name: &str) -> PathBuf {
            self.package_dir.join(name)
        }

        fn loose_file(&self, relpath: &str) -> PathBuf {
            paths::join_relpath(&self.game_root, relpath)
        }
    }

    /// Container with one raw entry.
    fn container(name_hash: u32, tkid_hash: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(fdata::ENTRY_MAGIC);
        out.extend_from_slice(&(0x30u64 + payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&name_hash.to_le_bytes());
        out.extend_from_slice(&tkid_hash.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(payload);
        while out.len() % 0x10 != 0 {
            out.push(0);
        }
        out
    }

    fn sidecar(entries: &[(u32, u32, &str)]) -> Vec<u8> {
        let files: Vec<String> = entries
            .iter()
            .map(|(name_hash, tkid_hash, filename)| {
                format!(
                    r#"{{"filename": "{filename}", "name_hash": {name_hash}, "tkid_hash": {tkid_hash}}}"#
                )
            })
            .collect();
        format!(r#"{{"files": [{}]}}"#, files.join(",")).into_bytes()
    }

    fn install_legacy(manager: &mut ModManager, path: &Path) -> InstallReport {
        let scanned = scan::analyze_archive(path).unwrap();
        let option = scanned.options[0].clone();
        manager.install_legacy_mod(&scanned, &option, None).unwrap()
    }

    // ── install ──────────────────────────────────────────────────────

    #[test]
    fn test_install_legacy_rdb_mod() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let path = fx.build_zip("A.zip", &[("package/foo.bin", b"X")]);

        let mut manager = fx.manager();
        let report = install_legacy(&mut manager, &path);

        assert_eq!(report.backend, Backend::Rdb);
        assert_eq!(report.files_installed, 1);
        assert_eq!(fs::read(fx.package_file("foo.bin")).unwrap(), b"X");
        let rec = &manager.installed["A.zip"];
        assert_eq!(rec.installed_paths, vec!["package/foo.bin"]);
        assert_eq!(rec.legacy_option_name.as_deref(), Some(scan::DEFAULT_OPTION));
        // the mock tool fabricated core files and backups on first run
        assert!(fx.package_file("root.rdb.original").exists());
        assert!(fx.package_dir.join(STATE_FILENAME).exists());
        assert!(fx.mods_dir.join(LEGACY_STATE_FILENAME).exists());
    }

    #[test]
    fn test_install_picks_only_selected_option() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let path = fx.build_zip(
            "B.zip",
            &[
                ("OptionA/package/foo.bin", b"A"),
                ("OptionB/package/foo.bin", b"B"),
            ],
        );

        let mut manager = fx.manager();
        let scanned = fx.scanned(&path);
        assert_eq!(scanned.options.len(), 2);
        let option_b = scanned.options.iter().find(|o| o.name == "OptionB").unwrap();
        manager
            .install_legacy_mod(&scanned, option_b, None)
            .unwrap();

        assert_eq!(fs::read(fx.package_file("foo.bin")).unwrap(), b"B");
        assert_eq!(
            manager.installed["B.zip"].legacy_option_name.as_deref(),
            Some("OptionB")
        );
    }

    #[test]
    fn test_second_install_of_same_archive_rejected() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let path = fx.build_zip("A.zip", &[("package/foo.bin", b"X")]);

        let mut manager = fx.manager();
        install_legacy(&mut manager, &path);

        let scanned = fx.scanned(&path);
        let option = scanned.options[0].clone();
        let err = manager.install_legacy_mod(&scanned, &option, None).unwrap_err();
        assert!(matches!(err, ModError::AlreadyInstalled(_)));
    }

    #[test]
    fn test_overlapping_sidecar_hashes_block_install() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let first = fx.build_zip(
            "first.zip",
            &[
                ("package/one.fdata", &container(0x10, 0xAFBEC60C, b"one")),
                ("package/one.yumiamod.json", &sidecar(&[(0x10, 0xAFBEC60C, "one.g1t"), (0x11, 0xAFBEC60C, "two.g1t")])),
            ],
        );
        let second = fx.build_zip(
            "second.zip",
            &[
                ("package/two.fdata", &container(0x11, 0xAFBEC60C, b"two")),
                ("package/two.yumiamod.json", &sidecar(&[(0x11, 0xAFBEC60C, "two.g1t")])),
            ],
        );
        let third = fx.build_zip(
            "third.zip",
            &[
                ("package/three.fdata", &container(0x20, 0xAFBEC60C, b"three")),
                ("package/three.yumiamod.json", &sidecar(&[(0x20, 0xAFBEC60C, "three.g1t")])),
            ],
        );

        let mut manager = fx.manager();
        install_legacy(&mut manager, &first);

        let scanned = fx.scanned(&second);
        let option = scanned.options[0].clone();
        let err = manager.install_legacy_mod(&scanned, &option, None).unwrap_err();
        assert!(matches!(err, ModError::AssetConflict(_)));
        assert!(!manager.is_installed("second.zip"));

        // disjoint hash sets install cleanly
        install_legacy(&mut manager, &third);
        assert!(manager.is_installed("third.zip"));
    }

    #[test]
    fn test_tool_failure_rolls_back_copied_files() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let path = fx.build_zip("A.zip", &[("package/foo.bin", b"X")]);

        let mut manager = fx.manager();
        manager.set_patch_tool(Box::new(FailingPatchTool));
        let scanned = fx.scanned(&path);
        let option = scanned.options[0].clone();

        let err = manager.install_legacy_mod(&scanned, &option, None).unwrap_err();
        assert!(matches!(err, ModError::ExternalToolFailure(_)));
        assert!(!fx.package_file("foo.bin").exists());
        assert!(manager.installed.is_empty());

        let reloaded = fx.manager();
        assert!(reloaded.installed.is_empty());
    }

    #[test]
    fn test_manifest_rdb_install_unions_common_and_feature() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let manifest_json = br#"{
            "mod_manager_version": "1.0",
            "mod_name": "Armor Pack",
            "common_files_dir": "common",
            "features": [{"name": "Armor Style", "directory": "armor_style"}]
        }"#;
        let path = fx.build_zip(
            "pack.zip",
            &[
                ("nioh3modmanifest.json", manifest_json),
                ("common/base.fdata", &container(1, 0xAFBEC60C, b"base")),
                ("armor_style/Light/light.fdata", &container(2, 0xAFBEC60C, b"light")),
                ("armor_style/Heavy/heavy.fdata", &container(3, 0xAFBEC60C, b"heavy")),
            ],
        );

        let mut manager = fx.manager();
        let scanned = fx.scanned(&path);

        // a required feature with no selection is rejected before any write
        let err = manager
            .install_manifest_mod(&scanned, &Selections::new(), None)
            .unwrap_err();
        assert!(matches!(err, ModError::SelectionInvalid(_)));
        assert!(!fx.package_file("base.fdata").exists());

        let mut selections = Selections::new();
        selections.insert("Armor Style".to_string(), Some("Heavy".to_string()));
        let report = manager
            .install_manifest_mod(&scanned, &selections, None)
            .unwrap();

        assert_eq!(report.files_installed, 2);
        assert!(fx.package_file("base.fdata").exists());
        assert!(fx.package_file("heavy.fdata").exists());
        assert!(!fx.package_file("light.fdata").exists());
        let rec = &manager.installed["pack.zip"];
        assert_eq!(rec.install_kind, InstallKind::Manifest);
        assert_eq!(rec.display_option_summary, "Armor Style: Heavy");
        assert_eq!(
            rec.feature_selections.as_ref().unwrap()["Armor Style"],
            Some("Heavy".to_string())
        );
    }

    // ── loose installs ───────────────────────────────────────────────

    #[test]
    fn test_loose_install_writes_under_mod_dir() {
        let fx = Fixture::new();
        fx.enable_loose_backend();
        let path = fx.build_zip("Cool.zip", &[("CoolMod/0x11111111.g1t", b"tex")]);

        let mut manager = fx.manager();
        let report = install_legacy(&mut manager, &path);

        assert_eq!(report.backend, Backend::Loose);
        assert_eq!(
            fs::read(fx.loose_file("mods/Cool/0x11111111.g1t")).unwrap(),
            b"tex"
        );
        let rec = &manager.installed["Cool.zip"];
        assert_eq!(rec.loose_mod_dir.as_deref(), Some("mods/Cool"));
        assert_eq!(rec.installed_paths, vec!["mods/Cool/0x11111111.g1t"]);
    }

    #[test]
    fn test_loose_filename_conflict_blocks_install() {
        let fx = Fixture::new();
        fx.enable_loose_backend();
        let first = fx.build_zip("First.zip", &[("A/0x11111111.g1t", b"a")]);
        let second = fx.build_zip("Second.zip", &[("B/0x11111111.g1t", b"b")]);

        let mut manager = fx.manager();
        install_legacy(&mut manager, &first);

        let scanned = fx.scanned(&second);
        let option = scanned.options[0].clone();
        let err = manager.install_legacy_mod(&scanned, &option, None).unwrap_err();
        assert!(matches!(err, ModError::LooseOwnershipConflict(_)));
        assert!(!fx.loose_file("mods/Second").exists());
    }

    #[test]
    fn test_loose_untracked_target_dir_blocks_install() {
        let fx = Fixture::new();
        fx.enable_loose_backend();
        let path = fx.build_zip("M.zip", &[("0x11111111.g1t", b"a")]);
        let stray_dir = fx.loose_file("mods/M");
        fs::create_dir_all(&stray_dir).unwrap();
        fs::write(stray_dir.join("stray.txt"), b"not ours").unwrap();

        let mut manager = fx.manager();
        let scanned = fx.scanned(&path);
        let option = scanned.options[0].clone();
        let err = manager.install_legacy_mod(&scanned, &option, None).unwrap_err();
        assert!(matches!(err, ModError::LooseOwnershipConflict(_)));
    }

    #[test]
    fn test_direct_loose_multi_select_installs_common_plus_toggles() {
        let fx = Fixture::new();
        fx.enable_loose_backend();
        let path = fx.build_zip(
            "multi.zip",
            &[
                ("0x00000001.g1t", b"root"),
                ("VariantA/0x11111111.g1t", b"a"),
                ("VariantB/0x22222222.g1t", b"b"),
            ],
        );

        let mut manager = fx.manager();
        let scanned = fx.scanned(&path);
        assert!(scanned.multi_select);
        let variant_a = vec![scanned
            .options
            .iter()
            .find(|o| o.name == "VariantA")
            .unwrap()
            .clone()];

        let report = manager
            .install_direct_loose_mod(&scanned, &variant_a, None)
            .unwrap();
        assert_eq!(report.files_installed, 2);
        assert!(fx.loose_file("mods/multi/0x00000001.g1t").exists());
        assert!(fx.loose_file("mods/multi/0x11111111.g1t").exists());
        assert!(!fx.loose_file("mods/multi/0x22222222.g1t").exists());
        assert_eq!(
            manager.installed["multi.zip"].display_option_summary,
            "Common + VariantA"
        );
    }

    #[test]
    fn test_direct_loose_mod_refuses_rdb_backend() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let path = fx.build_zip("Cool.zip", &[("CoolMod/0x11111111.g1t", b"tex")]);

        let mut manager = fx.manager();
        let scanned = fx.scanned(&path);
        let option = scanned.options[0].clone();
        let err = manager.install_legacy_mod(&scanned, &option, None).unwrap_err();
        assert!(matches!(err, ModError::BackendMismatch(_)));
    }

    // ── uninstall ────────────────────────────────────────────────────

    #[test]
    fn test_uninstall_rdb_restores_backups_and_state() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let path = fx.build_zip("A.zip", &[("package/foo.bin", b"X")]);

        let mut manager = fx.manager();
        install_legacy(&mut manager, &path);
        fx.stamp_core_files(b"patched", b"vanilla");

        let outcome = manager.uninstall_mod("A.zip").unwrap();
        assert!(matches!(outcome, UninstallOutcome::Clean { removed: 1 }));
        assert!(!fx.package_file("foo.bin").exists());
        for core in CORE_RDB_FILES {
            assert_eq!(fs::read(fx.package_file(core)).unwrap(), b"vanilla");
        }
        assert!(manager.installed.is_empty());
        // the legacy export disappears with the last rdb record
        assert!(!fx.mods_dir.join(LEGACY_STATE_FILENAME).exists());

        let reloaded = fx.manager();
        assert!(reloaded.installed.is_empty());
    }

    #[test]
    fn test_uninstall_tolerates_already_missing_files() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let path = fx.build_zip("A.zip", &[("package/foo.bin", b"X")]);

        let mut manager = fx.manager();
        install_legacy(&mut manager, &path);
        fs::remove_file(fx.package_file("foo.bin")).unwrap();

        let outcome = manager.uninstall_mod("A.zip").unwrap();
        assert!(matches!(outcome, UninstallOutcome::Clean { removed: 0 }));
        assert!(manager.installed.is_empty());
    }

    #[test]
    fn test_uninstall_reapply_failure_is_degraded_success() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let first = fx.build_zip(
            "first.zip",
            &[
                ("package/one.fdata", &container(0x10, 0xAFBEC60C, b"one")),
                ("package/one.yumiamod.json", &sidecar(&[(0x10, 0xAFBEC60C, "one.g1t")])),
            ],
        );
        let second = fx.build_zip(
            "second.zip",
            &[
                ("package/two.fdata", &container(0x20, 0xAFBEC60C, b"two")),
                ("package/two.yumiamod.json", &sidecar(&[(0x20, 0xAFBEC60C, "two.g1t")])),
            ],
        );

        let mut manager = fx.manager();
        install_legacy(&mut manager, &first);
        install_legacy(&mut manager, &second);

        manager.set_patch_tool(Box::new(FailingPatchTool));
        let outcome = manager.uninstall_mod("first.zip").unwrap();
        assert!(matches!(outcome, UninstallOutcome::Degraded { .. }));
        // the requested mod is gone from state even though re-application failed
        assert!(!manager.is_installed("first.zip"));
        assert!(manager.is_installed("second.zip"));
    }

    #[test]
    fn test_uninstall_unknown_archive() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        assert!(matches!(
            manager.uninstall_mod("phantom.zip"),
            Err(ModError::NotInstalled(_))
        ));
    }

    // ── environment / backend resolution ─────────────────────────────

    #[test]
    fn test_backend_resolution_order() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        assert_eq!(manager.resolve_backend(), None);

        // loose preferred when both are ready and nothing is installed
        fx.enable_rdb_backend();
        fx.enable_loose_backend();
        assert_eq!(manager.resolve_backend(), Some(Backend::Loose));

        // an active rdb install pins the rdb backend
        manager.installed.insert(
            "a.zip".to_string(),
            InstalledRecord {
                archive_filename: "a.zip".to_string(),
                backend: Backend::Rdb,
                install_kind: InstallKind::Legacy,
                display_option_summary: scan::DEFAULT_OPTION.to_string(),
                legacy_option_name: Some(scan::DEFAULT_OPTION.to_string()),
                feature_selections: None,
                installed_paths: vec!["package/foo.bin".to_string()],
                loose_mod_dir: None,
            },
        );
        assert_eq!(manager.resolve_backend(), Some(Backend::Rdb));

        // and without the tool there is no legal backend at all
        fs::remove_file(fx.package_dir.join(PATCH_TOOL_EXE)).unwrap();
        assert_eq!(manager.resolve_backend(), None);
    }

    #[test]
    fn test_can_migrate_needs_active_rdb_loose_ready_and_backups() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let path = fx.build_zip("A.zip", &[("package/foo.bin", b"X")]);

        let mut manager = fx.manager();
        assert!(!manager.environment_status().can_migrate);

        install_legacy(&mut manager, &path);
        // mock tool created backups, but loose prerequisites are missing
        assert!(!manager.environment_status().can_migrate);

        fx.enable_loose_backend();
        assert!(manager.environment_status().can_migrate);
    }

    // ── migration ────────────────────────────────────────────────────

    fn migration_fixture() -> (Fixture, ModManager) {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let path = fx.build_zip(
            "mig.zip",
            &[
                ("package/mod.fdata", &container(0x77, 0xAFBEC60C, b"TEX")),
                ("package/mod.yumiamod.json", &sidecar(&[(0x77, 0xAFBEC60C, "armor.g1t")])),
            ],
        );

        let mut manager = fx.manager();
        install_legacy(&mut manager, &path);
        fx.enable_loose_backend();
        fx.stamp_core_files(b"patched", b"vanilla");
        (fx, manager)
    }

    #[test]
    fn test_migration_moves_install_to_loose_backend() {
        let (fx, mut manager) = migration_fixture();

        let report = manager.migrate_all_to_loose().unwrap();
        assert_eq!(report.migrated, 1);

        assert!(!fx.package_file("mod.fdata").exists());
        assert!(!fx.package_file("mod.yumiamod.json").exists());
        assert_eq!(fs::read(fx.loose_file("mods/mig/armor.g1t")).unwrap(), b"TEX");
        for core in CORE_RDB_FILES {
            assert_eq!(fs::read(fx.package_file(core)).unwrap(), b"vanilla");
        }

        let rec = &manager.installed["mig.zip"];
        assert_eq!(rec.backend, Backend::Loose);
        assert_eq!(rec.legacy_option_name.as_deref(), Some(scan::DEFAULT_OPTION));
        assert_eq!(rec.loose_mod_dir.as_deref(), Some("mods/mig"));
        assert_eq!(rec.installed_paths, vec!["mods/mig/armor.g1t"]);

        // the durable store agrees with memory
        let reloaded = fx.manager();
        assert_eq!(reloaded.installed["mig.zip"].backend, Backend::Loose);
        assert!(!fx.mods_dir.join(LEGACY_STATE_FILENAME).exists());
    }

    #[test]
    fn test_failed_migration_restores_pre_migration_state() {
        let (fx, mut manager) = migration_fixture();
        // a directory squatting on the destination filename makes the write fail
        fs::create_dir_all(fx.loose_file("mods/mig/armor.g1t")).unwrap();

        assert!(manager.migrate_all_to_loose().is_err());

        // filesystem and state both match the pre-migration snapshot
        assert!(fx.package_file("mod.fdata").exists());
        assert!(fx.package_file("mod.yumiamod.json").exists());
        for core in CORE_RDB_FILES {
            assert_eq!(fs::read(fx.package_file(core)).unwrap(), b"patched");
        }
        let rec = &manager.installed["mig.zip"];
        assert_eq!(rec.backend, Backend::Rdb);

        let reloaded = fx.manager();
        assert_eq!(reloaded.installed["mig.zip"].backend, Backend::Rdb);
    }

    #[test]
    fn test_migration_blocked_without_prerequisites() {
        let fx = Fixture::new();
        let mut manager = fx.manager();
        assert!(matches!(
            manager.migrate_all_to_loose(),
            Err(ModError::MigrationBlocked(_))
        ));
    }

    #[test]
    fn test_migration_blocked_on_ambiguous_selection() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        // both options resolve to the same destination filename, so the
        // installed file set cannot tell them apart
        let manifest_json = br#"{
            "mod_manager_version": "1.0",
            "features": [{"name": "Armor Style", "directory": "armor_style"}]
        }"#;
        let path = fx.build_zip(
            "ambi.zip",
            &[
                ("nioh3modmanifest.json", manifest_json),
                ("armor_style/Light/armor.fdata", &container(1, 0xAFBEC60C, b"light")),
                ("armor_style/Heavy/armor.fdata", &container(2, 0xAFBEC60C, b"heavy")),
            ],
        );

        let mut manager = fx.manager();
        let scanned = fx.scanned(&path);
        let mut selections = Selections::new();
        selections.insert("Armor Style".to_string(), Some("Heavy".to_string()));
        manager
            .install_manifest_mod(&scanned, &selections, None)
            .unwrap();
        fx.enable_loose_backend();

        // lose the stored selection and make the summary unparsable
        let rec = manager.installed.get_mut("ambi.zip").unwrap();
        rec.feature_selections = None;
        rec.display_option_summary = "hand-edited".to_string();
        manager.save_state().unwrap();

        let err = manager.migrate_all_to_loose().unwrap_err();
        assert!(matches!(err, ModError::MigrationBlocked(_)));
        assert_eq!(manager.installed["ambi.zip"].backend, Backend::Rdb);
    }

    // ── state maintenance ────────────────────────────────────────────

    #[test]
    fn test_check_installed_status_drops_drifted_records() {
        let fx = Fixture::new();
        fx.enable_rdb_backend();
        let path = fx.build_zip("A.zip", &[("package/foo.bin", b"X")]);

        let mut manager = fx.manager();
        install_legacy(&mut manager, &path);
        fs::remove_file(fx.package_file("foo.bin")).unwrap();

        manager.check_installed_status();
        assert!(manager.installed.is_empty());

        let reloaded = fx.manager();
        assert!(reloaded.installed.is_empty());
    }

    #[test]
    fn test_legacy_state_backfill() {
        let fx = Fixture::new();
        fs::write(fx.package_file("foo.bin"), b"X").unwrap();
        fs::write(
            fx.mods_dir.join(LEGACY_STATE_FILENAME),
            br#"{"A.zip": {"archive_filename": "A.zip", "option_name": "OptionA", "installed_files": ["foo.bin"]}}"#,
        )
        .unwrap();

        let manager = fx.manager();

        let rec = &manager.installed["A.zip"];
        assert_eq!(rec.backend, Backend::Rdb);
        assert_eq!(rec.install_kind, InstallKind::Legacy);
        assert_eq!(rec.installed_paths, vec!["package/foo.bin"]);
        assert_eq!(rec.legacy_option_name.as_deref(), Some("OptionA"));
        // the upgrade is persisted under the versioned format
        assert!(fx.package_dir.join(STATE_FILENAME).exists());
    }
}
