use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{bail, Context as _, Result};
use tracing::{debug, warn};

use crate::catalog::CatalogStore;
use crate::context::Context;
use crate::error::HoloError;
use crate::fsops;
use crate::hasher::digest_file;
use crate::locker::{self, Releaser, DEFAULT_LOCK_WAIT};

const LIBRARY_LOCK: &str = "library.lck";

/// Counters returned by a garbage-collect sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub kept: usize,
    pub removed: usize,
}

/// Result of a full integrity check.
#[derive(Debug, Clone, Default)]
pub struct CheckSummary {
    pub checked: usize,
    pub corrupted: Vec<String>,
    /// Blueprints whose catalogs referenced a corrupted object and were
    /// invalidated; their next restore is a miss.
    pub invalidated: Vec<String>,
}

/// Content-addressed pool of file objects shared across all catalogs.
/// Objects are keyed by the SHA-256 of their content, sharded by the first
/// two hex digits, and never mutated after ingestion.
pub struct Library {
    ctx: Context,
    dir: PathBuf,
    used: PathBuf,
    shards: Mutex<HashMap<String, HashSet<String>>>,
}

impl Library {
    pub fn new(ctx: &Context) -> Result<Self> {
        let dir = ctx.library_dir();
        let used = ctx.used_dir();
        fsops::ensure_dir(&dir)?;
        fsops::ensure_dir(&used)?;
        Ok(Self {
            ctx: ctx.clone(),
            dir,
            used,
            shards: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> Result<Releaser> {
        locker::acquire(
            &self.ctx,
            &self.ctx.hololib_dir().join(LIBRARY_LOCK),
            Some(DEFAULT_LOCK_WAIT),
        )
    }

    #[must_use]
    pub fn object_path(&self, hash: &str) -> PathBuf {
        let shard = hash.get(0..2).unwrap_or("xx");
        self.dir.join(shard).join(hash.get(2..).unwrap_or(hash))
    }

    /// Cached existence test, keyed by two-hex shard.
    pub fn has(&self, hash: &str) -> bool {
        let Some(shard) = hash.get(0..2) else {
            return false;
        };
        let Some(rest) = hash.get(2..) else {
            return false;
        };
        let mut shards = self.shards.lock().expect("shard cache poisoned");
        let listing = shards.entry(shard.to_string()).or_insert_with(|| {
            let mut names = HashSet::new();
            if let Ok(entries) = fs::read_dir(self.dir.join(shard)) {
                for entry in entries.flatten() {
                    names.insert(entry.file_name().to_string_lossy().to_string());
                }
            }
            names
        });
        listing.contains(rest)
    }

    /// Ingest a file under its content hash. The source is left in place;
    /// the library copy is made read-only. Idempotent when the object
    /// already exists.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed hash, or when the object cannot be
    /// linked, copied, or protected under the library lock.
    pub fn store(&self, source: &std::path::Path, hash: &str) -> Result<()> {
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("invalid object hash {hash:?}");
        }
        if self.has(hash) {
            return Ok(());
        }
        let _lock = self.lock()?;
        let dest = self.object_path(hash);
        if let Some(parent) = dest.parent() {
            fsops::ensure_dir(parent)?;
        }
        if !dest.exists() {
            let executable = fs::metadata(source)
                .map(|meta| fsops::is_executable(&meta))
                .unwrap_or(false);
            if fs::hard_link(source, &dest).is_err() {
                let mut tmp = dest.as_os_str().to_os_string();
                tmp.push(format!(".tmp{}", std::process::id()));
                let tmp = PathBuf::from(tmp);
                fs::copy(source, &tmp).with_context(|| {
                    format!("failed to stage object {} from {}", hash, source.display())
                })?;
                fs::rename(&tmp, &dest)
                    .with_context(|| format!("failed to publish object {hash}"))?;
            }
            fsops::set_readonly(&dest, executable)?;
            debug!(%hash, "library store");
        }
        let mut shards = self.shards.lock().expect("shard cache poisoned");
        if let Some(listing) = shards.get_mut(&hash[0..2]) {
            listing.insert(hash[2..].to_string());
        }
        Ok(())
    }

    /// Open an object for reading.
    ///
    /// # Errors
    ///
    /// Returns an error when no object with that hash is on disk.
    pub fn open(&self, hash: &str) -> Result<File> {
        let path = self.object_path(hash);
        File::open(&path).with_context(|| format!("library object {hash} unavailable"))
    }

    /// Re-digest an object's bytes. A mismatch deletes the object and
    /// surfaces `HoloError::Integrity`; callers treat that as a cache miss
    /// for every catalog referencing the hash.
    ///
    /// # Errors
    ///
    /// Returns `HoloError::Integrity` on a digest mismatch, or an I/O
    /// error when the object cannot be read.
    pub fn verify(&self, hash: &str) -> Result<()> {
        let path = self.object_path(hash);
        let actual = digest_file(&path)?;
        if actual == hash {
            return Ok(());
        }
        warn!(%hash, %actual, "library object corrupted; reclaiming");
        let _lock = self.lock()?;
        let _ = fs::remove_file(&path);
        self.forget(hash);
        Err(HoloError::Integrity {
            hash: hash.to_string(),
        }
        .into())
    }

    fn forget(&self, hash: &str) {
        let mut shards = self.shards.lock().expect("shard cache poisoned");
        if let (Some(shard), Some(rest)) = (hash.get(0..2), hash.get(2..)) {
            if let Some(listing) = shards.get_mut(shard) {
                listing.remove(rest);
            }
        }
    }

    /// Record that a space uses a blueprint's catalog.
    pub fn add_user(&self, blueprint: &str, space_id: &str) -> Result<()> {
        fsops::touch(&self.used.join(blueprint).join(space_id), SystemTime::now())
    }

    pub fn remove_user(&self, blueprint: &str, space_id: &str) -> Result<()> {
        let marker = self.used.join(blueprint).join(space_id);
        match fs::remove_file(&marker) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", marker.display()))
            }
        }
    }

    pub fn users_of(&self, blueprint: &str) -> Result<Vec<String>> {
        let dir = self.used.join(blueprint);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut users: Vec<String> = fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        users.sort();
        Ok(users)
    }

    /// Drop the whole back-reference index of a blueprint (catalog removal).
    ///
    /// # Errors
    ///
    /// Returns an error when the marker directory exists but cannot be
    /// removed.
    pub fn remove_users_of(&self, blueprint: &str) -> Result<()> {
        let dir = self.used.join(blueprint);
        if dir.is_dir() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove {}", dir.display()))?;
        }
        Ok(())
    }

    fn all_objects(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut objects = Vec::new();
        if !self.dir.is_dir() {
            return Ok(objects);
        }
        let mut shards: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        shards.sort();
        for shard_dir in shards {
            let shard = shard_dir
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let mut names: Vec<_> = fs::read_dir(&shard_dir)?
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().is_file())
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .collect();
            names.sort();
            for name in names {
                objects.push((format!("{shard}{name}"), shard_dir.join(&name)));
            }
        }
        Ok(objects)
    }

    /// Mark-and-sweep: objects referenced by no catalog are unlinked.
    ///
    /// # Errors
    ///
    /// Returns an error when the lock cannot be taken, catalogs cannot be
    /// enumerated, or an unreachable object cannot be unlinked.
    pub fn sweep(&self, catalogs: &CatalogStore) -> Result<SweepSummary> {
        let _lock = self.lock()?;
        let mut reachable: HashSet<String> = HashSet::new();
        for catalog in catalogs.all()? {
            for hash in catalog.object_hashes() {
                reachable.insert(hash.to_string());
            }
        }
        let mut summary = SweepSummary::default();
        for (hash, path) in self.all_objects()? {
            if reachable.contains(&hash) {
                summary.kept += 1;
            } else {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to unlink {}", path.display()))?;
                summary.removed += 1;
            }
        }
        // Best-effort cleanup of emptied shards; drop the cache wholesale.
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let _ = fs::remove_dir(entry.path());
            }
        }
        self.shards.lock().expect("shard cache poisoned").clear();
        debug!(kept = summary.kept, removed = summary.removed, "library sweep");
        Ok(summary)
    }

    /// Verify every object; reclaim corrupted ones and invalidate every
    /// catalog that referenced them.
    ///
    /// # Errors
    ///
    /// Corruption itself is reported in the summary, not as an error;
    /// returns an error only for I/O failures while walking or removing.
    pub fn check(&self, catalogs: &CatalogStore) -> Result<CheckSummary> {
        let mut summary = CheckSummary::default();
        for (hash, _) in self.all_objects()? {
            summary.checked += 1;
            match self.verify(&hash) {
                Ok(()) => {}
                Err(err) => match err.downcast_ref::<HoloError>() {
                    Some(HoloError::Integrity { .. }) => summary.corrupted.push(hash),
                    _ => return Err(err),
                },
            }
        }
        if summary.corrupted.is_empty() {
            return Ok(summary);
        }
        let corrupted: HashSet<&str> = summary.corrupted.iter().map(String::as_str).collect();
        for catalog in catalogs.all()? {
            if catalog
                .object_hashes()
                .any(|hash| corrupted.contains(hash))
            {
                warn!(blueprint = %catalog.blueprint, "catalog references corrupted object; invalidating");
                catalogs.remove(&catalog.blueprint)?;
                self.remove_users_of(&catalog.blueprint)?;
                summary.invalidated.push(catalog.blueprint);
            }
        }
        Ok(summary)
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library").field("dir", &self.dir).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::hasher::{EntryKind, TreeEntry};
    use sha2::{Digest, Sha256};

    fn test_context(root: &std::path::Path) -> Context {
        let ctx = Context::new(root, "test", "test");
        ctx.ensure_layout().expect("layout");
        ctx
    }

    fn seed_object(root: &std::path::Path, library: &Library, content: &[u8]) -> String {
        let hash = hex::encode(Sha256::digest(content));
        let source = root.join(format!("seed-{}", &hash[..8]));
        fs::write(&source, content).expect("seed file");
        library.store(&source, &hash).expect("store");
        hash
    }

    #[test]
    fn store_has_open_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(temp.path());
        let library = Library::new(&ctx).expect("library");

        let hash = seed_object(temp.path(), &library, b"object payload");
        assert!(library.has(&hash));
        assert!(library.object_path(&hash).is_file());

        let mut content = String::new();
        use std::io::Read as _;
        library
            .open(&hash)
            .expect("open")
            .read_to_string(&mut content)
            .expect("read");
        assert_eq!(content, "object payload");

        // Storing again is a no-op.
        library.store(&temp.path().join("missing"), &hash).expect("idempotent store");
        assert!(!library.has(&"0".repeat(64)));
    }

    #[cfg(unix)]
    #[test]
    fn stored_objects_are_read_only() {
        use std::os::unix::fs::PermissionsExt;
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(temp.path());
        let library = Library::new(&ctx).expect("library");

        let hash = seed_object(temp.path(), &library, b"protected");
        let mode = fs::metadata(library.object_path(&hash))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o222, 0, "object must not be writable");
    }

    #[test]
    fn sweep_keeps_reachable_objects() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(temp.path());
        let library = Library::new(&ctx).expect("library");
        let catalogs = CatalogStore::new(&ctx).expect("catalogs");

        let kept = seed_object(temp.path(), &library, b"kept");
        let orphan = seed_object(temp.path(), &library, b"orphan");

        let catalog = Catalog::new(
            &ctx,
            "fedcba9876543210",
            vec![TreeEntry {
                rel_path: "kept.txt".to_string(),
                mode: 0o644,
                kind: EntryKind::File,
                digest: kept.clone(),
            }],
        );
        catalogs.write(&catalog, &library).expect("publish");

        let summary = library.sweep(&catalogs).expect("sweep");
        assert_eq!(summary, SweepSummary { kept: 1, removed: 1 });
        assert!(library.has(&kept));
        assert!(!library.has(&orphan));
    }

    #[test]
    fn verify_reclaims_corrupted_objects() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(temp.path());
        let library = Library::new(&ctx).expect("library");

        let hash = seed_object(temp.path(), &library, b"healthy bytes");
        let path = library.object_path(&hash);
        fsops::set_unix_mode(&path, 0o644).expect("unprotect");
        fs::write(&path, b"garbage").expect("tamper");

        let err = library.verify(&hash).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HoloError>(),
            Some(HoloError::Integrity { .. })
        ));
        assert!(!library.object_path(&hash).exists());
        assert!(!library.has(&hash));
    }

    #[test]
    fn check_invalidates_catalogs_referencing_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(temp.path());
        let library = Library::new(&ctx).expect("library");
        let catalogs = CatalogStore::new(&ctx).expect("catalogs");

        let hash = seed_object(temp.path(), &library, b"catalog payload");
        let catalog = Catalog::new(
            &ctx,
            "00112233445566aa",
            vec![TreeEntry {
                rel_path: "data.bin".to_string(),
                mode: 0o644,
                kind: EntryKind::File,
                digest: hash.clone(),
            }],
        );
        catalogs.write(&catalog, &library).expect("publish");
        library
            .add_user(&catalog.blueprint, "abc1234_test_test")
            .expect("add user");

        let path = library.object_path(&hash);
        fsops::set_unix_mode(&path, 0o644).expect("unprotect");
        fs::write(&path, b"garbage").expect("tamper");

        let summary = library.check(&catalogs).expect("check");
        assert_eq!(summary.corrupted, vec![hash]);
        assert_eq!(summary.invalidated, vec!["00112233445566aa".to_string()]);
        assert!(catalogs.lookup("00112233445566aa").expect("lookup").is_none());
        assert!(library.users_of("00112233445566aa").expect("users").is_empty());
    }

    #[test]
    fn user_markers_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(temp.path());
        let library = Library::new(&ctx).expect("library");

        library.add_user("aabb", "space-one").expect("add one");
        library.add_user("aabb", "space-two").expect("add two");
        assert_eq!(
            library.users_of("aabb").expect("users"),
            vec!["space-one".to_string(), "space-two".to_string()]
        );
        library.remove_user("aabb", "space-one").expect("remove");
        library.remove_user("aabb", "space-one").expect("remove again");
        assert_eq!(library.users_of("aabb").expect("users"), vec!["space-two".to_string()]);
    }
}
