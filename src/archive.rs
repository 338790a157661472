//! Format-agnostic mod archive access.
//!
//! Mod packages ship as .zip, .7z or .rar. This module gives the rest of the
//! manager one interface over all three: list member names, read a single
//! member into memory, or materialize selected members under a destination
//! directory. Member names are always normalized to forward slashes so
//! prefix matching works the same for every format.
//!
//! 7z has no cheap random access (solid blocks), so 7z operations decompress
//! the whole archive into a scoped temp directory and pick files out of it.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result as AnyResult};
use walkdir::WalkDir;

use crate::error::{ModError, Result};
use crate::paths;

/// Container formats the manager understands, selected by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    SevenZ,
    Rar,
}

impl ArchiveFormat {
    /// Classify by extension; anything else is `UnsupportedFormat`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "7z" => Ok(ArchiveFormat::SevenZ),
            "rar" => Ok(ArchiveFormat::Rar),
            other => Err(ModError::UnsupportedFormat(format!(".{other}"))),
        }
    }

    /// Whether the path carries a supported archive extension.
    pub fn is_supported(path: &Path) -> bool {
        Self::from_path(path).is_ok()
    }
}

/// List member names (files only), slash-normalized.
pub fn list_members(path: &Path) -> Result<Vec<String>> {
    let names = match ArchiveFormat::from_path(path)? {
        ArchiveFormat::Zip => list_zip(path),
        ArchiveFormat::SevenZ => list_7z(path),
        ArchiveFormat::Rar => list_rar(path),
    }?;
    Ok(names)
}

/// Read a single member into memory.
pub fn read_member(path: &Path, member: &str) -> Result<Vec<u8>> {
    let data = match ArchiveFormat::from_path(path)? {
        ArchiveFormat::Zip => read_zip_member(path, member),
        ArchiveFormat::SevenZ => read_7z_member(path, member),
        ArchiveFormat::Rar => read_rar_member(path, member),
    }?;
    Ok(data)
}

/// Extract the given members under `dest`, preserving their archive-relative
/// paths. Returns the paths written. `dest` is expected to be a scoped temp
/// directory owned by the caller.
pub fn extract_members(path: &Path, members: &[String], dest: &Path) -> Result<Vec<PathBuf>> {
    let extracted = match ArchiveFormat::from_path(path)? {
        ArchiveFormat::Zip => extract_zip_members(path, members, dest),
        ArchiveFormat::SevenZ => extract_7z_members(path, members, dest),
        ArchiveFormat::Rar => extract_rar_members(path, members, dest),
    }?;
    Ok(extracted)
}

// ── ZIP ──────────────────────────────────────────────────────────────

fn open_zip(path: &Path) -> AnyResult<zip::ZipArchive<BufReader<File>>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open archive: {}", path.display()))?;
    zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("Failed to read ZIP: {}", path.display()))
}

fn list_zip(path: &Path) -> AnyResult<Vec<String>> {
    let mut archive = open_zip(path)?;
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        names.push(paths::to_slash(entry.name()));
    }
    Ok(names)
}

fn read_zip_member(path: &Path, member: &str) -> AnyResult<Vec<u8>> {
    let mut archive = open_zip(path)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if paths::to_slash(entry.name()) == member {
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            return Ok(data);
        }
    }
    bail!("member '{}' not found in {}", member, path.display())
}

fn extract_zip_members(path: &Path, members: &[String], dest: &Path) -> AnyResult<Vec<PathBuf>> {
    let mut archive = open_zip(path)?;
    let wanted: BTreeMap<String, usize> = members
        .iter()
        .enumerate()
        .map(|(i, m)| (m.clone(), i))
        .collect();

    let mut extracted = Vec::with_capacity(members.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = paths::to_slash(entry.name());
        if !wanted.contains_key(&name) || entry.is_dir() {
            continue;
        }
        let out = paths::join_relpath(dest, &name);
        paths::ensure_parent_dirs(&out)?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        fs::write(&out, &data)
            .with_context(|| format!("Failed to write {}", out.display()))?;
        extracted.push(out);
    }
    ensure_all_extracted(path, members, &extracted, dest)?;
    Ok(extracted)
}

// ── 7z ───────────────────────────────────────────────────────────────

fn decompress_7z(path: &Path) -> AnyResult<tempfile::TempDir> {
    let staging = tempfile::tempdir().context("Failed to create temp directory")?;
    sevenz_rust::decompress_file(path, staging.path())
        .with_context(|| format!("Failed to decompress 7z archive: {}", path.display()))?;
    Ok(staging)
}

fn list_7z(path: &Path) -> AnyResult<Vec<String>> {
    let staging = decompress_7z(path)?;
    let mut names = Vec::new();
    for entry in WalkDir::new(staging.path())
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(staging.path())
            .unwrap_or(entry.path());
        names.push(paths::to_slash(&rel.to_string_lossy()));
    }
    Ok(names)
}

fn read_7z_member(path: &Path, member: &str) -> AnyResult<Vec<u8>> {
    let staging = decompress_7z(path)?;
    let candidate = paths::join_relpath(staging.path(), member);
    if !candidate.is_file() {
        bail!("member '{}' not found in {}", member, path.display());
    }
    fs::read(&candidate).with_context(|| format!("Failed to read {}", candidate.display()))
}

fn extract_7z_members(path: &Path, members: &[String], dest: &Path) -> AnyResult<Vec<PathBuf>> {
    let staging = decompress_7z(path)?;
    let mut extracted = Vec::with_capacity(members.len());
    for member in members {
        let src = paths::join_relpath(staging.path(), member);
        if !src.is_file() {
            continue;
        }
        let out = paths::join_relpath(dest, member);
        paths::ensure_parent_dirs(&out)?;
        fs::copy(&src, &out)
            .with_context(|| format!("Failed to stage {}", out.display()))?;
        extracted.push(out);
    }
    ensure_all_extracted(path, members, &extracted, dest)?;
    Ok(extracted)
}

// ── RAR ──────────────────────────────────────────────────────────────

fn list_rar(path: &Path) -> AnyResult<Vec<String>> {
    let archive = unrar::Archive::new(path)
        .open_for_processing()
        .with_context(|| format!("Failed to open RAR: {}", path.display()))?;

    let mut names = Vec::new();
    let mut cursor = Some(archive);
    while let Some(archive) = cursor.take() {
        match archive.read_header() {
            Ok(Some(entry)) => {
                let header = entry.entry();
                if header.is_file() {
                    names.push(paths::to_slash(&header.filename.to_string_lossy()));
                }
                cursor = Some(entry.skip().context("Failed to skip RAR entry")?);
            }
            Ok(None) => break,
            Err(e) => return Err(e).context("Failed to read RAR header"),
        }
    }
    Ok(names)
}

fn read_rar_member(path: &Path, member: &str) -> AnyResult<Vec<u8>> {
    let archive = unrar::Archive::new(path)
        .open_for_processing()
        .with_context(|| format!("Failed to open RAR: {}", path.display()))?;
    let staging = tempfile::tempdir().context("Failed to create temp directory")?;

    let mut cursor = Some(archive);
    while let Some(archive) = cursor.take() {
        match archive.read_header() {
            Ok(Some(entry)) => {
                let header = entry.entry();
                let name = paths::to_slash(&header.filename.to_string_lossy());
                if header.is_file() && name == member {
                    let out = staging.path().join("extracted");
                    entry
                        .extract_to(&out)
                        .with_context(|| format!("Failed to extract RAR entry: {name}"))?;
                    return fs::read(&out)
                        .with_context(|| format!("Failed to read {}", out.display()));
                }
                cursor = Some(entry.skip().context("Failed to skip RAR entry")?);
            }
            Ok(None) => break,
            Err(e) => return Err(e).context("Failed to read RAR header"),
        }
    }
    bail!("member '{}' not found in {}", member, path.display())
}

fn extract_rar_members(path: &Path, members: &[String], dest: &Path) -> AnyResult<Vec<PathBuf>> {
    let archive = unrar::Archive::new(path)
        .open_for_processing()
        .with_context(|| format!("Failed to open RAR: {}", path.display()))?;

    let mut extracted = Vec::with_capacity(members.len());
    let mut cursor = Some(archive);
    while let Some(archive) = cursor.take() {
        match archive.read_header() {
            Ok(Some(entry)) => {
                let header = entry.entry();
                let name = paths::to_slash(&header.filename.to_string_lossy());
                if header.is_file() && members.contains(&name) {
                    let out = paths::join_relpath(dest, &name);
                    paths::ensure_parent_dirs(&out)?;
                    cursor = Some(
                        entry
                            .extract_to(&out)
                            .with_context(|| format!("Failed to extract RAR entry: {name}"))?,
                    );
                    extracted.push(out);
                } else {
                    cursor = Some(entry.skip().context("Failed to skip RAR entry")?);
                }
            }
            Ok(None) => break,
            Err(e) => return Err(e).context("Failed to read RAR header"),
        }
    }
    ensure_all_extracted(path, members, &extracted, dest)?;
    Ok(extracted)
}

// ── shared ───────────────────────────────────────────────────────────

fn ensure_all_extracted(
    path: &Path,
    members: &[String],
    extracted: &[PathBuf],
    dest: &Path,
) -> AnyResult<()> {
    if extracted.len() == members.len() {
        return Ok(());
    }
    let missing: Vec<&str> = members
        .iter()
        .filter(|m| !paths::join_relpath(dest, m).exists())
        .map(|m| m.as_str())
        .collect();
    Err(anyhow!(
        "{} member(s) missing from {}: {}",
        missing.len(),
        path.display(),
        missing.join(", ")
    ))
}
