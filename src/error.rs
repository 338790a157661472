//! Error taxonomy for the mod manager core.
//!
//! Expected failure modes are typed so callers (CLI, GUI) can branch on them.
//! Everything that happens before the first disk mutation is pure validation;
//! failures after a mutation are paired with a rollback path in `manager`.

use thiserror::Error;

pub type Result<T, E = ModError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ModError {
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    #[error("invalid selection: {0}")]
    SelectionInvalid(String),

    #[error("loose filename collision in {archive}: {filename} from {member} duplicates {previous}")]
    NamingCollision {
        archive: String,
        filename: String,
        member: String,
        previous: String,
    },

    #[error("no installable loose payloads found in {0}")]
    NoPayload(String),

    #[error("no files found for the selected options in {0}")]
    EmptySelection(String),

    #[error("cannot install: conflicts with installed mod(s):\n{0}")]
    AssetConflict(String),

    #[error("cannot install via LooseFileLoader:\n{0}")]
    LooseOwnershipConflict(String),

    #[error("{0}")]
    BackendMismatch(String),

    #[error("a mod from {0} is already installed; uninstall it first")]
    AlreadyInstalled(String),

    #[error("no installed mod found for {0}")]
    NotInstalled(String),

    #[error("no supported install backend is currently available")]
    NoBackend,

    #[error("patch tool failed: {0}")]
    ExternalToolFailure(String),

    #[error("migration blocked: {0}")]
    MigrationBlocked(String),

    #[error("unreadable install state: {0}")]
    StateCorrupt(String),

    #[error(transparent)]
    Archive(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
