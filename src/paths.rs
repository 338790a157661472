//! Path normalization and filesystem helpers shared across the manager.
//!
//! Archive members and install records always use forward slashes; these
//! helpers keep comparisons separator- and case-insensitive where the game
//! expects it.

use std::io;
use std::path::{Path, PathBuf};

/// Convert archive-style separators to forward slashes.
pub fn to_slash(path: &str) -> String {
    path.replace('\\', "/")
}

/// Normalize a path for lookups and comparisons (lowercase, forward slashes,
/// no leading/trailing slashes).
pub fn normalize_for_lookup(path: &str) -> String {
    to_slash(path).trim_matches('/').to_lowercase()
}

/// Get the filename component of a slash-separated member path.
pub fn member_file_name(member: &str) -> &str {
    member
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(member)
}

/// Join a game-root-relative record path onto a base directory.
pub fn join_relpath(base: &Path, relpath: &str) -> PathBuf {
    let mut out = base.to_path_buf();
    for part in relpath.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}

/// Sanitize a mod name into a directory name the filesystem will accept.
///
/// Mirrors what the loose-file loader tolerates: no reserved characters,
/// no trailing dots or whitespace, never empty.
pub fn sanitize_mod_dir_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').to_string();
    if cleaned.is_empty() {
        "ConvertedMod".to_string()
    } else {
        cleaned
    }
}

/// Create parent directories for a path if they don't exist.
pub fn ensure_parent_dirs(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Remove now-empty directories walking up from `start`, stopping before
/// `stop_at`. Errors are swallowed; pruning is best-effort cleanup.
pub fn cleanup_empty_dirs(start: &Path, stop_at: &Path) {
    let mut current = start.to_path_buf();
    loop {
        if !current.exists() || current == stop_at {
            break;
        }
        let is_empty = match std::fs::read_dir(&current) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => break,
        };
        if !is_empty {
            break;
        }
        if std::fs::remove_dir(&current).is_err() {
            break;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_normalize_for_lookup() {
        assert_eq!(normalize_for_lookup("Mods\\Armor\\a.g1t"), "mods/armor/a.g1t");
        assert_eq!(normalize_for_lookup("/foo/bar/"), "foo/bar");
    }

    #[test]
    fn test_sanitize_mod_dir_name() {
        assert_eq!(sanitize_mod_dir_name("My Mod: v2?"), "My Mod_ v2_");
        assert_eq!(sanitize_mod_dir_name("  dots... "), "dots");
        assert_eq!(sanitize_mod_dir_name("///"), "___");
        assert_eq!(sanitize_mod_dir_name(""), "ConvertedMod");
    }

    #[test]
    fn test_cleanup_empty_dirs_stops_at_root() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        let deep = mods.join("a").join("b");
        std::fs::create_dir_all(&deep).unwrap();

        cleanup_empty_dirs(&deep, &mods);
        assert!(!mods.join("a").exists());
        assert!(mods.exists());
    }

    #[test]
    fn test_cleanup_keeps_nonempty() {
        let dir = tempdir().unwrap();
        let mods = dir.path().join("mods");
        let deep = mods.join("a").join("b");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(mods.join("a").join("keep.txt"), b"x").unwrap();

        cleanup_empty_dirs(&deep, &mods);
        assert!(!deep.exists());
        assert!(mods.join("a").exists());
    }
}
