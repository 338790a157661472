//! NiOH3 - Nioh 3 mod manager
//!
//! Installs mod archives through the RDB patch tool or the LooseFileLoader
//! plugin, tracks what went where, and migrates installs between the two.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use nioh3mm::manager::{ModManager, UninstallOutcome};
use nioh3mm::scan::{self, ArchiveKind, ModArchive, ModOption};
use nioh3mm::state::Backend;
use nioh3mm::tool::{MockPatchTool, PatchTool, RdbPatchTool};
use nioh3mm::{convert, paths};

#[derive(Parser)]
#[command(name = "nioh3mm")]
#[command(version)]
#[command(about = "Nioh 3 mod manager - RDB patching and LooseFileLoader backends")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List installable mod archives in the mods directory
    Scan {
        /// Directory containing downloaded mod archives
        #[arg(short, long, env = "NIOH3MM_MODS_DIR")]
        mods: PathBuf,
    },

    /// Show environment readiness and installed mods
    Status {
        /// Directory containing downloaded mod archives
        #[arg(short, long, env = "NIOH3MM_MODS_DIR")]
        mods: PathBuf,

        /// Game installation root (the directory containing package/)
        #[arg(short, long, env = "NIOH3MM_GAME_DIR")]
        game: PathBuf,
    },

    /// Install a mod archive
    Install {
        /// Archive filename inside the mods directory
        archive: String,

        /// Directory containing downloaded mod archives
        #[arg(short, long, env = "NIOH3MM_MODS_DIR")]
        mods: PathBuf,

        /// Game installation root (the directory containing package/)
        #[arg(short, long, env = "NIOH3MM_GAME_DIR")]
        game: PathBuf,

        /// Option to install (legacy mods), or toggles to enable
        /// (loose-file multi-select mods; repeatable)
        #[arg(short, long)]
        option: Vec<String>,

        /// Feature selection as 'Feature=Option' (manifest mods; repeatable;
        /// 'Feature=' skips an optional feature)
        #[arg(short, long)]
        feature: Vec<String>,

        /// Force a backend instead of auto-detecting ('rdb' or 'loose')
        #[arg(short, long)]
        backend: Option<String>,
    },

    /// Uninstall an installed mod
    Uninstall {
        /// Archive filename the mod was installed from
        archive: String,

        /// Directory containing downloaded mod archives
        #[arg(short, long, env = "NIOH3MM_MODS_DIR")]
        mods: PathBuf,

        /// Game installation root (the directory containing package/)
        #[arg(short, long, env = "NIOH3MM_GAME_DIR")]
        game: PathBuf,
    },

    /// Migrate every RDB-managed install to the LooseFileLoader backend
    Migrate {
        /// Directory containing downloaded mod archives
        #[arg(short, long, env = "NIOH3MM_MODS_DIR")]
        mods: PathBuf,

        /// Game installation root (the directory containing package/)
        #[arg(short, long, env = "NIOH3MM_GAME_DIR")]
        game: PathBuf,
    },

    /// Convert a mod archive to loose files without installing it
    Convert {
        /// Path to the mod archive
        archive: PathBuf,

        /// Feature selection as 'Feature=Option' (manifest mods; repeatable;
        /// unspecified features default to their first option)
        #[arg(short, long)]
        feature: Vec<String>,

        /// Output directory (defaults to the mod name next to the archive)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(
                if cli.verbose { "nioh3mm=debug".parse()? } else { "nioh3mm=info".parse()? },
            ))
            .init();
    }

    match cli.command {
        Commands::Scan { mods } => {
            for scanned in &scan::scan_mods_dir(&mods) {
                print_archive(scanned);
            }
        }

        Commands::Status { mods, game } => {
            let mut manager = build_manager(&mods, &game);
            manager.check_installed_status();

            let status = manager.environment_status();
            println!("=== Environment ===");
            println!("Mods directory:     {}", check(status.mods_dir_exists));
            println!("Game root:          {}", check(status.game_root_exists));
            println!("Game package dir:   {}", check(status.package_dir_exists));
            println!("RDB patch tool:     {}", check(status.patch_tool_available));
            println!("DLL loader:         {}", check(status.dll_loader_available));
            println!(
                "LooseFileLoader:    {}",
                check(status.loose_plugin_dll_available && status.loose_plugin_ini_available)
            );
            println!();
            println!(
                "Active backend:     {}",
                match status.active_backend {
                    Some(Backend::Rdb) => "RDB patch tool",
                    Some(Backend::Loose) => "LooseFileLoader",
                    None => "none (nothing installed)",
                }
            );
            println!("Can install:        {}", if status.can_install { "yes" } else { "no" });
            println!("Can migrate:        {}", if status.can_migrate { "yes" } else { "no" });

            println!("\n=== Installed mods ===");
            if manager.installed.is_empty() {
                println!("(none)");
            }
            for (filename, rec) in &manager.installed {
                let backend = match rec.backend {
                    Backend::Rdb => "rdb",
                    Backend::Loose => "loose",
                };
                println!(
                    "{:>7}  {}  [{}] - {} file(s)",
                    backend,
                    filename,
                    rec.display_option_summary,
                    rec.installed_paths.len()
                );
            }
        }

        Commands::Install {
            archive,
            mods,
            game,
            option,
            feature,
            backend,
        } => {
            let mut manager = build_manager(&mods, &game);
            manager.check_installed_status();
            manager.scan_archives();
            let scanned = manager
                .find_archive(&archive)
                .cloned()
                .ok_or_else(|| anyhow!("no installable archive named '{archive}' in {}", mods.display()))?;
            let backend = parse_backend(backend.as_deref())?;

            let report = if scanned.manifest.is_some() {
                let selections = parse_feature_args(&feature)?;
                manager.install_manifest_mod(&scanned, &selections, backend)?
            } else if scanned.multi_select {
                let chosen = resolve_toggles(&scanned, &option)?;
                manager.install_direct_loose_mod(&scanned, &chosen, backend)?
            } else {
                let chosen = resolve_single_option(&scanned, option.first().map(String::as_str))?;
                manager.install_legacy_mod(&scanned, &chosen, backend)?
            };

            let backend_name = match report.backend {
                Backend::Rdb => "RDB patch tool",
                Backend::Loose => "LooseFileLoader",
            };
            println!(
                "Installed '{}' via {} ({} files)",
                scanned.name, backend_name, report.files_installed
            );
        }

        Commands::Uninstall { archive, mods, game } => {
            let mut manager = build_manager(&mods, &game);
            manager.check_installed_status();

            match manager.uninstall_mod(&archive)? {
                UninstallOutcome::Clean { removed } => {
                    println!("Uninstalled '{archive}' ({removed} files removed)");
                }
                UninstallOutcome::Degraded { removed, tool_error } => {
                    println!("Uninstalled '{archive}' ({removed} files removed)");
                    println!(
                        "WARNING: re-applying the remaining RDB mods failed; they may not \
                         work until the patch tool is run again.\n  {tool_error}"
                    );
                }
            }
        }

        Commands::Migrate { mods, game } => {
            let mut manager = build_manager(&mods, &game);
            manager.check_installed_status();
            manager.scan_archives();

            let report = manager.migrate_all_to_loose()?;
            println!("Migrated {} mod(s) to LooseFileLoader", report.migrated);
        }

        Commands::Convert {
            archive,
            feature,
            output,
        } => {
            let scanned = scan::analyze_archive(&archive)?;
            let members = members_for_conversion(&scanned, &feature)?;
            let result = convert::convert_selected_members(&scanned.path, &members, &scanned.name)?;

            let out_dir = output.unwrap_or_else(|| {
                let dir = paths::sanitize_mod_dir_name(&scanned.name);
                archive.parent().unwrap_or(Path::new(".")).join(dir)
            });
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("Failed to create {}", out_dir.display()))?;
            for file in &result.files {
                let dst = out_dir.join(&file.filename);
                std::fs::write(&dst, &file.data)
                    .with_context(|| format!("Failed to write {}", dst.display()))?;
                println!("  {} <- {}", file.filename, file.source_member);
            }
            println!(
                "Converted {} file(s) into {}",
                result.files.len(),
                out_dir.display()
            );
        }
    }

    Ok(())
}

/// Build a manager against `<game>/package`, honoring the mock-tool toggle.
fn build_manager(mods: &Path, game: &Path) -> ModManager {
    let package_dir = game.join("package");
    let tool: Box<dyn PatchTool> = if mock_patcher_enabled() {
        Box::new(MockPatchTool)
    } else {
        Box::new(RdbPatchTool)
    };
    ModManager::new(mods, &package_dir, tool)
}

fn mock_patcher_enabled() -> bool {
    std::env::var("NIOH3MM_MOCK_PATCHER")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn check(ok: bool) -> &'static str {
    if ok { "found" } else { "MISSING" }
}

fn print_archive(scanned: &ModArchive) {
    let kind = match scanned.kind {
        ArchiveKind::LegacyRdb => "legacy",
        ArchiveKind::Manifest => "manifest",
        ArchiveKind::DirectLoose => "loose",
    };
    println!("{}  [{}] {}", scanned.filename(), kind, scanned.name);
    if let Some(manifest) = &scanned.manifest {
        if let Some(author) = &manifest.author {
            println!("    by {author}");
        }
        for f in &manifest.features {
            let options = scanned
                .feature_options
                .get(&f.name)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let flag = if f.optional { " (optional)" } else { "" };
            println!("    {}{}: {}", f.name, flag, options.join(", "));
        }
    } else {
        for option in &scanned.options {
            println!("    {} - {} file(s)", option.name, option.files.len());
        }
    }
}

fn parse_backend(arg: Option<&str>) -> Result<Option<Backend>> {
    match arg {
        None => Ok(None),
        Some("rdb") => Ok(Some(Backend::Rdb)),
        Some("loose") => Ok(Some(Backend::Loose)),
        Some(other) => bail!("unknown backend '{other}' (expected 'rdb' or 'loose')"),
    }
}

/// Parse repeated `Feature=Option` arguments. `Feature=` explicitly skips an
/// optional feature.
fn parse_feature_args(args: &[String]) -> Result<BTreeMap<String, Option<String>>> {
    let mut selections = BTreeMap::new();
    for arg in args {
        let (name, option) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("expected 'Feature=Option', got '{arg}'"))?;
        let option = (!option.is_empty()).then(|| option.to_string());
        selections.insert(name.to_string(), option);
    }
    Ok(selections)
}

/// Pick the toggles to enable for a multi-select loose mod; all of them when
/// none are named.
fn resolve_toggles(scanned: &ModArchive, names: &[String]) -> Result<Vec<ModOption>> {
    if names.is_empty() {
        return Ok(scanned.options.clone());
    }
    names
        .iter()
        .map(|name| {
            scanned
                .options
                .iter()
                .find(|o| o.name == *name)
                .cloned()
                .ok_or_else(|| anyhow!("no option named '{name}' in {}", scanned.filename()))
        })
        .collect()
}

fn resolve_single_option(scanned: &ModArchive, name: Option<&str>) -> Result<ModOption> {
    match name {
        Some(name) => scanned
            .options
            .iter()
            .find(|o| o.name == name)
            .cloned()
            .ok_or_else(|| anyhow!("no option named '{name}' in {}", scanned.filename())),
        None if scanned.options.len() == 1 => Ok(scanned.options[0].clone()),
        None => {
            let names: Vec<&str> = scanned.options.iter().map(|o| o.name.as_str()).collect();
            bail!(
                "{} has multiple options; pick one with --option ({})",
                scanned.filename(),
                names.join(", ")
            )
        }
    }
}

/// Resolve the member list the `convert` subcommand should decode.
///
/// Manifest mods take explicit selections, defaulting each unspecified
/// feature to its first discovered option. Multi-select loose mods take every
/// toggle; everything else takes its single option.
fn members_for_conversion(scanned: &ModArchive, feature_args: &[String]) -> Result<Vec<String>> {
    if let Some(manifest) = &scanned.manifest {
        let explicit = parse_feature_args(feature_args)?;
        let mut selections = BTreeMap::new();
        for f in &manifest.features {
            let chosen = match explicit.get(&f.name) {
                Some(choice) => choice.clone(),
                None => {
                    let first = scanned
                        .feature_options
                        .get(&f.name)
                        .and_then(|opts| opts.first())
                        .cloned();
                    if first.is_none() && !f.optional {
                        bail!("required feature '{}' has no options in the archive", f.name);
                    }
                    first
                }
            };
            selections.insert(f.name.clone(), chosen);
        }
        scan::validate_selections(scanned, &selections)?;
        return Ok(convert::select_manifest_members(
            &scanned.filename(),
            &scanned.members,
            Some(manifest),
            &selections,
        )?);
    }

    let mut members: Vec<String> = scanned.common_files.clone();
    let options: &[ModOption] = if scanned.multi_select {
        &scanned.options
    } else {
        &scanned.options[..scanned.options.len().min(1)]
    };
    for option in options {
        for file in &option.files {
            let member = format!("{}{file}", option.prefix);
            if !members.contains(&member) {
                members.push(member);
            }
        }
    }
    if members.is_empty() {
        bail!("{} has nothing to convert", scanned.filename());
    }
    Ok(members)
}
