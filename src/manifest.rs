//! Mod manifest schema.
//!
//! Authors can ship a `nioh3modmanifest.json` at the archive root to describe
//! multi-feature mods. Each feature maps to an archive subdirectory holding
//! one subdirectory per selectable option; an optional common directory is
//! always installed. Archives without a manifest fall back to `package/`
//! directory scanning, so existing mods need no changes.
//!
//! ```json
//! {
//!     "mod_manager_version": "1.0",
//!     "common_files_dir": "common",
//!     "features": [
//!         {"name": "Armor Style", "directory": "armor_style", "optional": false},
//!         {"name": "Skin", "directory": "skin", "optional": true}
//!     ]
//! }
//! ```

use std::collections::HashSet;

use serde::Deserialize;
use tracing::warn;

use crate::error::{ModError, Result};

/// Manifest filename looked up at the archive root.
pub const MANIFEST_FILENAME: &str = "nioh3modmanifest.json";

/// Highest (major, minor) manifest version this build understands.
pub const SUPPORTED_VERSION: (u32, u32) = (1, 1);

/// One independently selectable feature within a manifest-driven mod.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFeature {
    /// Human-readable label, also the selection key.
    pub name: String,
    /// Archive subdirectory containing one subdirectory per option.
    pub directory: String,
    #[serde(default)]
    pub optional: bool,
}

/// Parsed contents of a nioh3modmanifest.json file.
#[derive(Debug, Clone, Deserialize)]
pub struct ModManifest {
    pub mod_manager_version: String,
    #[serde(default)]
    pub mod_name: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub common_files_dir: Option<String>,
    #[serde(default)]
    pub features: Vec<ManifestFeature>,
}

/// Parse and validate raw manifest JSON.
pub fn parse_manifest(data: &[u8]) -> Result<ModManifest> {
    let data = data.strip_prefix(b"\xef\xbb\xbf").unwrap_or(data);
    let mut manifest: ModManifest = serde_json::from_slice(data)
        .map_err(|e| ModError::ManifestInvalid(e.to_string()))?;

    check_version(&manifest.mod_manager_version)?;

    if let Some(common) = manifest.common_files_dir.take() {
        manifest.common_files_dir = Some(normalize_dir(&common));
    }
    for feature in &mut manifest.features {
        feature.directory = normalize_dir(&feature.directory);
    }

    let mut seen_names = HashSet::new();
    let mut seen_dirs = HashSet::new();
    for feature in &manifest.features {
        if !seen_names.insert(feature.name.clone()) {
            return Err(ModError::ManifestInvalid(format!(
                "duplicate feature name: '{}'",
                feature.name
            )));
        }
        if !seen_dirs.insert(feature.directory.clone()) {
            return Err(ModError::ManifestInvalid(format!(
                "duplicate feature directory: '{}'",
                feature.directory
            )));
        }
    }

    Ok(manifest)
}

fn normalize_dir(dir: &str) -> String {
    dir.replace('\\', "/").trim_matches('/').to_string()
}

/// Gate on `mod_manager_version`: reject a newer major, warn on a newer minor.
fn check_version(version: &str) -> Result<()> {
    let parsed: Option<(u32, u32)> = version.split_once('.').and_then(|(major, minor)| {
        Some((major.parse().ok()?, minor.parse().ok()?))
    });
    let (major, minor) = parsed.ok_or_else(|| {
        ModError::ManifestInvalid(format!(
            "invalid mod_manager_version '{version}' (expected 'major.minor', e.g. '1.0')"
        ))
    })?;

    let (cur_major, cur_minor) = SUPPORTED_VERSION;
    if major > cur_major {
        return Err(ModError::ManifestInvalid(format!(
            "mod_manager_version '{version}' requires a newer mod manager \
             (this build supports up to {cur_major}.x)"
        )));
    }
    if major == cur_major && minor > cur_minor {
        warn!(
            "Manifest version {} is newer than this build supports ({}.{}) - \
             some features may be ignored",
            version, cur_major, cur_minor
        );
    }
    Ok(())
}
