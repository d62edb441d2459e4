use std::path::PathBuf;

use thiserror::Error;

/// Typed failures surfaced by the cache core. Everything else travels as
/// `anyhow::Error` with context attached at the call site.
#[derive(Debug, Error)]
pub enum HoloError {
    #[error("timed out after {waited_ms} ms waiting for lock {name}")]
    LockTimeout { name: String, waited_ms: u64 },
    #[error("environment solver failed with exit code {code}")]
    SolverFailed { code: i32 },
    #[error(
        "solver reported a corrupted package cache; environment is unstable, \
         try removing {pkgs_dir}"
    )]
    SolverUnsafe { pkgs_dir: PathBuf },
    #[error("library object {hash} failed integrity check and was reclaimed")]
    Integrity { hash: String },
    #[error("space {space} at {path} is dirty")]
    Dirty { space: String, path: PathBuf },
    #[error("no catalog for blueprint {blueprint} and builds are disabled")]
    NoBuild { blueprint: String },
    #[error("no catalog for blueprint {blueprint} on this platform")]
    CatalogMiss { blueprint: String },
}

impl HoloError {
    /// Retry policy marker for the builder envelope: only the three-signal
    /// corruption detector is beyond retrying.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SolverUnsafe { .. })
    }
}
