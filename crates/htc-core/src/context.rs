use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use htc_domain::user_home_identity;

use crate::fsops;

pub const HOME_VARIABLE: &str = "HTC_HOME";
const DEFAULT_HOME_DIR: &str = ".htc";
#[cfg(unix)]
const SHARED_ROOT: &str = "/opt/htc";
#[cfg(not(unix))]
const SHARED_ROOT: &str = "C:\\ProgramData\\htc";

/// Names skipped by every tree walk (digesting, cloning, promotion).
pub const DEFAULT_IGNORED_NAMES: &[&str] = &[
    "__pycache__",
    ".vscode",
    ".ipynb_checkpoints",
    ".virtual_documents",
    "__MACOSX",
];

/// Behavior toggles recognized by the core.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flags {
    /// Materialize must not invoke the builder; a miss is an error.
    pub no_build: bool,
    /// Replace real locks with no-ops (single-user test scenarios only).
    pub lockless: bool,
    /// Skip the template copy after a successful build.
    pub live_only: bool,
    /// Skip the `.meta` write; used while constructing templates.
    pub stage_only: bool,
    /// Use the OS-wide shared root instead of the per-user one.
    pub shared_holotree: bool,
}

/// Settings passed through to the solver and installer subprocesses.
#[derive(Debug, Clone)]
pub struct Settings {
    pub verify_ssl: bool,
    pub conda_url: Option<String>,
    pub pypi_url: Option<String>,
    pub pypi_trusted_host: Option<String>,
    pub channel_alias: Option<String>,
    /// Explicit solver binary; when unset the solver is resolved from PATH.
    pub solver_bin: Option<PathBuf>,
    /// Command that prints the environment's exported variable map as JSON.
    pub activator: Option<Vec<String>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            verify_ssl: true,
            conda_url: None,
            pypi_url: None,
            pypi_trusted_host: None,
            channel_alias: None,
            solver_bin: None,
            activator: None,
        }
    }
}

/// Explicit context value injected into every component constructor; there
/// are no process-wide singletons. Tests build one over a temporary root.
#[derive(Debug, Clone)]
pub struct Context {
    home: PathBuf,
    pub controller: String,
    pub space: String,
    pub flags: Flags,
    pub settings: Settings,
    pub ignored_names: Vec<String>,
}

impl Context {
    pub fn new(home: impl Into<PathBuf>, controller: &str, space: &str) -> Self {
        Self {
            home: home.into(),
            controller: unslash(controller),
            space: unslash(space),
            flags: Flags::default(),
            settings: Settings::default(),
            ignored_names: DEFAULT_IGNORED_NAMES.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Resolve the cache home from `HTC_HOME` or the user's home directory.
    ///
    /// # Errors
    ///
    /// Returns an error when no home directory can be determined.
    pub fn detect(controller: &str, space: &str) -> Result<Self> {
        let home = match env::var_os(HOME_VARIABLE) {
            Some(value) => PathBuf::from(value),
            None => dirs_next::home_dir()
                .ok_or_else(|| anyhow!("unable to determine home directory"))?
                .join(DEFAULT_HOME_DIR),
        };
        Ok(Self::new(home, controller, space))
    }

    #[must_use]
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }

    #[must_use]
    pub fn holotree_dir(&self) -> PathBuf {
        if self.flags.shared_holotree {
            PathBuf::from(SHARED_ROOT).join("holotree")
        } else {
            self.home.join("holotree")
        }
    }

    #[must_use]
    pub fn hololib_dir(&self) -> PathBuf {
        if self.flags.shared_holotree {
            PathBuf::from(SHARED_ROOT).join("lib")
        } else {
            self.home.join("hololib")
        }
    }

    #[must_use]
    pub fn catalog_dir(&self) -> PathBuf {
        self.hololib_dir().join("catalog")
    }

    #[must_use]
    pub fn library_dir(&self) -> PathBuf {
        self.hololib_dir().join("library")
    }

    #[must_use]
    pub fn used_dir(&self) -> PathBuf {
        self.hololib_dir().join("used")
    }

    #[must_use]
    pub fn pids_dir(&self) -> PathBuf {
        self.hololib_dir().join("pids")
    }

    #[must_use]
    pub fn journal_file(&self) -> PathBuf {
        self.home.join("journals").join("stats.log")
    }

    #[must_use]
    pub fn template_dir(&self) -> PathBuf {
        self.home.join("templates")
    }

    #[must_use]
    pub fn template_for(&self, blueprint: &str) -> PathBuf {
        self.template_dir().join(blueprint)
    }

    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.home.join("temp")
    }

    #[must_use]
    pub fn pkgs_dir(&self) -> PathBuf {
        self.home.join("pkgs")
    }

    #[must_use]
    pub fn pip_cache(&self) -> PathBuf {
        self.home.join("pipcache")
    }

    #[must_use]
    pub fn wheel_cache(&self) -> PathBuf {
        self.home.join("wheels")
    }

    #[must_use]
    pub fn build_lock(&self) -> PathBuf {
        self.holotree_dir().join("global.lck")
    }

    #[must_use]
    pub fn space_lock(&self) -> PathBuf {
        self.holotree_dir().join(format!("{}.lck", self.space_id()))
    }

    /// Identity of this `(user, controller, space)` triple; doubles as the
    /// suffix of the space directory and the back-reference marker name.
    #[must_use]
    pub fn space_id(&self) -> String {
        format!("{}_{}_{}", user_home_identity(), self.controller, self.space)
    }

    #[must_use]
    pub fn space_dir(&self, blueprint: &str) -> PathBuf {
        self.holotree_dir()
            .join(format!("{}_{}", blueprint, self.space_id()))
    }

    #[must_use]
    pub fn platform(&self) -> &'static str {
        env::consts::OS
    }

    #[must_use]
    pub fn arch(&self) -> &'static str {
        env::consts::ARCH
    }

    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.holotree_dir(),
            self.catalog_dir(),
            self.library_dir(),
            self.used_dir(),
            self.pids_dir(),
            self.template_dir(),
            self.temp_dir(),
            self.pkgs_dir(),
            self.pip_cache(),
            self.wheel_cache(),
        ] {
            fsops::ensure_dir(&dir)?;
        }
        if let Some(parent) = self.journal_file().parent() {
            fsops::ensure_dir(parent)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_ignored(&self, name: &OsStr) -> bool {
        self.ignored_names.iter().any(|held| OsStr::new(held) == name)
    }
}

/// Collapse path separators so user-supplied identifiers are safe as file
/// name components.
#[must_use]
pub fn unslash(text: &str) -> String {
    text.split(['/', '\\'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unslash_collapses_separator_runs() {
        assert_eq!(unslash("DOMAIN\\user"), "DOMAIN_user");
        assert_eq!(unslash("a//b/c"), "a_b_c");
        assert_eq!(unslash("plain"), "plain");
    }

    #[test]
    fn space_dir_embeds_identity_controller_and_space() {
        let ctx = Context::new("/tmp/htc-home", "ide", "user");
        let dir = ctx.space_dir("0123456789abcdef");
        let name = dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("0123456789abcdef_"));
        assert!(name.ends_with("_ide_user"));
    }

    #[test]
    fn ignored_names_default_to_the_walk_deny_list() {
        let ctx = Context::new("/tmp/htc-home", "test", "test");
        assert!(ctx.is_ignored(OsStr::new("__pycache__")));
        assert!(ctx.is_ignored(OsStr::new(".vscode")));
        assert!(!ctx.is_ignored(OsStr::new("site-packages")));
    }
}
