use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Instant, SystemTime};

use anyhow::{Context as _, Result};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::catalog::{Catalog, CatalogStore};
use crate::context::Context;
use crate::error::HoloError;
use crate::fsops;
use crate::hasher::{self, EntryKind};
use crate::journal::{Journal, JournalEvent, Outcome, KIND_SPACE_USED};
use crate::library::Library;
use crate::locker::{self, DEFAULT_LOCK_WAIT};

/// How library objects are placed into a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Bytewise copy; safest across filesystems.
    Copy,
    /// Zero-copy when library and space share a filesystem; EXDEV falls
    /// back to copy.
    Hardlink,
    /// For read-only or shared library mounts.
    Symlink,
}

#[derive(Debug)]
pub struct RestoreOutcome {
    pub path: PathBuf,
    pub outcome: Outcome,
}

/// Restores spaces from catalogs and templates, records usage, and
/// verifies pristineness. One instance per `(controller, space)` identity.
pub struct Materializer<'a> {
    ctx: &'a Context,
    library: &'a Library,
    catalogs: &'a CatalogStore,
    journal: &'a Journal,
}

impl<'a> Materializer<'a> {
    pub fn new(
        ctx: &'a Context,
        library: &'a Library,
        catalogs: &'a CatalogStore,
        journal: &'a Journal,
    ) -> Self {
        Self {
            ctx,
            library,
            catalogs,
            journal,
        }
    }

    /// Restore the space for a blueprint. `freshly_built` marks the call
    /// that immediately follows a build, so its outcome is accounted as a
    /// miss rather than a warm template hit.
    ///
    /// # Errors
    ///
    /// Returns `HoloError::CatalogMiss` when neither a usable template nor
    /// a catalog exists, or an error when locking, materialization, or
    /// journaling fails.
    pub fn restore(
        &self,
        blueprint: &str,
        mode: LinkMode,
        freshly_built: bool,
    ) -> Result<RestoreOutcome> {
        let started = Instant::now();
        let _lock = locker::acquire(self.ctx, &self.ctx.space_lock(), Some(DEFAULT_LOCK_WAIT))?;
        let space = self.ctx.space_dir(blueprint);

        if hasher::is_pristine(self.ctx, &space) {
            hasher::meta_touch(&space)?;
            self.catalogs.bump_used(blueprint)?;
            let outcome = if freshly_built { Outcome::Miss } else { Outcome::Hit };
            self.record(blueprint, outcome, started)?;
            return Ok(RestoreOutcome {
                path: space,
                outcome,
            });
        }
        fsops::rename_and_remove(&space)?;

        let template = self.ctx.template_for(blueprint);
        if hasher::is_pristine(self.ctx, &template) {
            if self.clone_template(&template, &space)? {
                self.library.add_user(blueprint, &self.ctx.space_id())?;
                self.catalogs.bump_used(blueprint)?;
                let outcome = if freshly_built { Outcome::Miss } else { Outcome::Dirty };
                self.record(blueprint, outcome, started)?;
                return Ok(RestoreOutcome {
                    path: space,
                    outcome,
                });
            }
        } else if template.is_dir() {
            warn!(template = %template.display(), "template is not pristine");
            if !self.ctx.flags.live_only {
                fsops::rename_and_remove(&template)?;
            }
        }

        let catalog = self
            .catalogs
            .lookup(blueprint)?
            .ok_or_else(|| HoloError::CatalogMiss {
                blueprint: blueprint.to_string(),
            })?;
        self.restore_from_catalog(&catalog, &space, mode)?;
        if !self.ctx.flags.stage_only {
            hasher::meta_save(&space, &catalog.digest())?;
        }
        self.library.add_user(blueprint, &self.ctx.space_id())?;
        self.catalogs.bump_used(blueprint)?;
        self.record(blueprint, Outcome::Miss, started)?;
        Ok(RestoreOutcome {
            path: space,
            outcome: Outcome::Miss,
        })
    }

    /// Clone a pristine template into the space. Returns false when the
    /// clone could not be used (missing metafile, worker failure, digest
    /// mismatch); the target is cleaned up in that case.
    fn clone_template(&self, template: &Path, space: &Path) -> Result<bool> {
        let expected = match hasher::meta_load(template) {
            Ok(expected) => expected,
            Err(err) => {
                debug!(template = %template.display(), %err, "template metafile unavailable");
                return Ok(false);
            }
        };
        if let Err(err) = clone_tree(self.ctx, template, space) {
            warn!(template = %template.display(), %err, "template clone failed");
            fsops::rename_and_remove(space)?;
            return Ok(false);
        }
        let actual = hasher::tree_digest(self.ctx, space)?;
        if actual != expected {
            warn!(
                template = %template.display(),
                %expected,
                %actual,
                "template clone digest mismatch; discarding"
            );
            fsops::rename_and_remove(space)?;
            return Ok(false);
        }
        if !self.ctx.flags.stage_only {
            hasher::meta_save(space, &expected)?;
        }
        hasher::meta_touch(template)?;
        Ok(true)
    }

    fn restore_from_catalog(
        &self,
        catalog: &Catalog,
        space: &Path,
        mode: LinkMode,
    ) -> Result<()> {
        fsops::ensure_dir(space)?;
        for entry in &catalog.entries {
            let dest = space.join(&entry.rel_path);
            match &entry.kind {
                EntryKind::Dir => {
                    fsops::ensure_dir(&dest)?;
                    fsops::set_unix_mode(&dest, entry.mode)?;
                }
                EntryKind::Symlink(target) => {
                    if let Some(parent) = dest.parent() {
                        fsops::ensure_dir(parent)?;
                    }
                    fsops::make_symlink(Path::new(target), &dest)?;
                }
                EntryKind::File => {
                    if let Some(parent) = dest.parent() {
                        fsops::ensure_dir(parent)?;
                    }
                    self.place_object(&entry.digest, entry.mode, &dest, mode)?;
                }
            }
        }
        Ok(())
    }

    fn place_object(
        &self,
        hash: &str,
        entry_mode: u32,
        dest: &Path,
        mode: LinkMode,
    ) -> Result<()> {
        let object = self.library.object_path(hash);
        match mode {
            LinkMode::Hardlink => {
                if fs::hard_link(&object, dest).is_ok() {
                    return Ok(());
                }
                // Different filesystem (or an unsupported link); fall back.
                self.copy_object(&object, hash, entry_mode, dest)
            }
            LinkMode::Copy => self.copy_object(&object, hash, entry_mode, dest),
            LinkMode::Symlink => fsops::make_symlink(&object, dest),
        }
    }

    fn copy_object(&self, object: &Path, hash: &str, entry_mode: u32, dest: &Path) -> Result<()> {
        fs::copy(object, dest)
            .with_context(|| format!("failed to materialize object {hash}"))?;
        fsops::set_unix_mode(dest, entry_mode)
    }

    fn record(&self, blueprint: &str, outcome: Outcome, started: Instant) -> Result<()> {
        self.journal.append(&JournalEvent {
            timestamp: crate::timestamp_secs(),
            kind: KIND_SPACE_USED.to_string(),
            blueprint: blueprint.to_string(),
            space: self.ctx.space.clone(),
            controller: self.ctx.controller.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            outcome,
        })
    }
}

fn worker_count() -> usize {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    cpus.saturating_sub(1).max(2)
}

/// File-level fan-out clone: directories are created in walk order, file
/// and symlink copies are drained by a bounded worker pool.
///
/// # Errors
///
/// Returns the first walk or copy failure; the target is left for the
/// caller to clean up.
pub fn clone_tree(ctx: &Context, source: &Path, target: &Path) -> Result<()> {
    fsops::ensure_dir(target)?;
    let mut files: Vec<(PathBuf, PathBuf)> = Vec::new();
    let walker = WalkDir::new(source)
        .min_depth(1)
        .sort_by(|a, b| a.path().cmp(b.path()))
        .into_iter()
        .filter_entry(|entry| !ctx.is_ignored(entry.file_name()));
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", source.display()))?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .context("failed to relativize clone path")?;
        let dest = target.join(rel);
        if entry.file_type().is_dir() {
            fsops::ensure_dir(&dest)?;
            let meta = entry.metadata()?;
            fsops::set_unix_mode(&dest, fsops::unix_mode(&meta))?;
        } else {
            files.push((entry.path().to_path_buf(), dest));
        }
    }

    let next = AtomicUsize::new(0);
    let failure: Mutex<Option<anyhow::Error>> = Mutex::new(None);
    thread::scope(|scope| {
        for _ in 0..worker_count() {
            scope.spawn(|| loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                let Some((src, dst)) = files.get(index) else {
                    break;
                };
                if let Err(err) = fsops::copy_any(src, dst) {
                    *failure.lock().expect("clone failure slot poisoned") = Some(err);
                    break;
                }
            });
        }
    });
    match failure.into_inner().expect("clone failure slot poisoned") {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Row reported by `env list`.
#[derive(Debug, Clone)]
pub struct SpaceInfo {
    pub blueprint: String,
    pub space_id: String,
    pub path: PathBuf,
    pub last_used: Option<SystemTime>,
}

/// Enumerate live spaces under the holotree root.
pub fn list_spaces(ctx: &Context) -> Result<Vec<SpaceInfo>> {
    let root = ctx.holotree_dir();
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut spaces = Vec::new();
    for entry in fs::read_dir(&root)
        .with_context(|| format!("failed to read holotree {}", root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let Some((blueprint, space_id)) = split_space_name(&name) else {
            continue;
        };
        let last_used = fs::metadata(fsops::meta_path(&entry.path()))
            .and_then(|meta| meta.modified())
            .ok();
        spaces.push(SpaceInfo {
            blueprint: blueprint.to_string(),
            space_id: space_id.to_string(),
            path: entry.path(),
            last_used,
        });
    }
    spaces.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(spaces)
}

fn split_space_name(name: &str) -> Option<(&str, &str)> {
    let (blueprint, space_id) = name.split_once('_')?;
    if blueprint.len() == 16 && blueprint.chars().all(|c| c.is_ascii_hexdigit()) {
        Some((blueprint, space_id))
    } else {
        None
    }
}

/// Tear down every space and template whose blueprint starts with the
/// prefix; back-reference markers go with them.
pub fn remove_spaces(ctx: &Context, library: &Library, prefix: &str) -> Result<usize> {
    let prefix = prefix.to_lowercase();
    let mut removed = 0usize;
    for space in list_spaces(ctx)? {
        if space.blueprint.starts_with(&prefix) {
            fsops::rename_and_remove(&space.path)?;
            library.remove_user(&space.blueprint, &space.space_id)?;
            removed += 1;
        }
    }
    let templates = ctx.template_dir();
    if templates.is_dir() {
        for entry in fs::read_dir(&templates)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && name.starts_with(&prefix) {
                fsops::rename_and_remove(&entry.path())?;
            }
        }
    }
    Ok(removed)
}
