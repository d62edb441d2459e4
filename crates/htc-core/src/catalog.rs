use std::fs;
use std::io::{Cursor, Read};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context as _, Result};
use tracing::debug;

use crate::context::Context;
use crate::fsops;
use crate::hasher::{digest_entries, EntryKind, TreeEntry};
use crate::library::Library;

const CATALOG_MAGIC: &[u8; 5] = b"htcat";
const CATALOG_VERSION: u8 = 1;
const KIND_FILE: u8 = 0;
const KIND_DIR: u8 = 1;
const KIND_SYMLINK: u8 = 2;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Persisted manifest of one blueprint: the ordered file listing plus
/// creation metadata. Stored as `catalog/<blueprint>.<platform>.<arch>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub blueprint: String,
    pub platform: String,
    pub arch: String,
    pub creator: String,
    pub created_at: u64,
    pub last_used_at: u64,
    pub entries: Vec<TreeEntry>,
}

impl Catalog {
    pub fn new(ctx: &Context, blueprint: &str, mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        let now = crate::timestamp_secs();
        Self {
            blueprint: blueprint.to_string(),
            platform: ctx.platform().to_string(),
            arch: ctx.arch().to_string(),
            creator: env!("CARGO_PKG_VERSION").to_string(),
            created_at: now,
            last_used_at: now,
            entries,
        }
    }

    /// Expected pristine digest of a space restored from this catalog.
    #[must_use]
    pub fn digest(&self) -> String {
        digest_entries(&self.entries)
    }

    /// Hashes of the library objects this catalog references.
    pub fn object_hashes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|entry| match entry.kind {
            EntryKind::File => Some(entry.digest.as_str()),
            _ => None,
        })
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.entries.len() * 96);
        out.extend_from_slice(CATALOG_MAGIC);
        out.push(CATALOG_VERSION);
        put_string(&mut out, &self.blueprint);
        put_string(&mut out, &self.platform);
        put_string(&mut out, &self.arch);
        put_string(&mut out, &self.creator);
        out.extend_from_slice(&self.created_at.to_le_bytes());
        out.extend_from_slice(&self.last_used_at.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            put_string(&mut out, &entry.rel_path);
            let mut digest = [0u8; 32];
            if !entry.digest.is_empty() {
                if let Ok(raw) = hex::decode(&entry.digest) {
                    digest.copy_from_slice(&raw);
                }
            }
            out.extend_from_slice(&digest);
            out.extend_from_slice(&entry.mode.to_le_bytes());
            match &entry.kind {
                EntryKind::File => out.push(KIND_FILE),
                EntryKind::Dir => out.push(KIND_DIR),
                EntryKind::Symlink(target) => {
                    out.push(KIND_SYMLINK);
                    put_string(&mut out, target);
                }
            }
        }
        out
    }

    /// Decode a catalog record.
    ///
    /// # Errors
    ///
    /// Returns an error for a bad magic, an unsupported version, or a
    /// truncated or malformed entry list.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut magic = [0u8; 5];
        cursor.read_exact(&mut magic).context("catalog truncated")?;
        if &magic != CATALOG_MAGIC {
            bail!("not a catalog file (bad magic)");
        }
        let version = get_u8(&mut cursor)?;
        if version != CATALOG_VERSION {
            bail!("unsupported catalog version {version}");
        }
        let blueprint = get_string(&mut cursor)?;
        let platform = get_string(&mut cursor)?;
        let arch = get_string(&mut cursor)?;
        let creator = get_string(&mut cursor)?;
        let created_at = get_u64(&mut cursor)?;
        let last_used_at = get_u64(&mut cursor)?;
        let count = get_u32(&mut cursor)? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let rel_path = get_string(&mut cursor)?;
            let mut digest = [0u8; 32];
            cursor.read_exact(&mut digest).context("catalog truncated")?;
            let mode = get_u32(&mut cursor)?;
            let kind = get_u8(&mut cursor)?;
            let (kind, digest) = match kind {
                KIND_FILE => (EntryKind::File, hex::encode(digest)),
                KIND_DIR => (EntryKind::Dir, String::new()),
                KIND_SYMLINK => (EntryKind::Symlink(get_string(&mut cursor)?), hex::encode(digest)),
                other => bail!("unknown catalog entry kind {other}"),
            };
            entries.push(TreeEntry {
                rel_path,
                mode,
                kind,
                digest,
            });
        }
        Ok(Self {
            blueprint,
            platform,
            arch,
            creator,
            created_at,
            last_used_at,
            entries,
        })
    }
}

fn put_string(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(&(text.len() as u32).to_le_bytes());
    out.extend_from_slice(text.as_bytes());
}

fn get_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf).context("catalog truncated")?;
    Ok(buf[0])
}

fn get_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).context("catalog truncated")?;
    Ok(u32::from_le_bytes(buf))
}

fn get_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf).context("catalog truncated")?;
    Ok(u64::from_le_bytes(buf))
}

fn get_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = get_u32(cursor)? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).context("catalog truncated")?;
    String::from_utf8(buf).context("catalog string is not utf-8")
}

/// Row reported by `list`: a catalog plus its ages in days.
#[derive(Debug, Clone)]
pub struct CatalogSummary {
    pub blueprint: String,
    pub platform: String,
    pub arch: String,
    pub files: usize,
    pub age_days: u64,
    pub idle_days: u64,
}

/// Accessor for the on-disk catalog directory.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    dir: PathBuf,
    platform: String,
    arch: String,
}

impl CatalogStore {
    pub fn new(ctx: &Context) -> Result<Self> {
        let dir = ctx.catalog_dir();
        fsops::ensure_dir(&dir)?;
        Ok(Self {
            dir,
            platform: ctx.platform().to_string(),
            arch: ctx.arch().to_string(),
        })
    }

    #[must_use]
    pub fn file_for(&self, blueprint: &str) -> PathBuf {
        self.dir
            .join(format!("{blueprint}.{}.{}", self.platform, self.arch))
    }

    /// Location of the promoted installation-plan artifact for a blueprint.
    #[must_use]
    pub fn plan_for(&self, blueprint: &str) -> PathBuf {
        self.dir.join(format!("{blueprint}.plan"))
    }

    /// Find the catalog for a blueprint on the current platform.
    ///
    /// # Errors
    ///
    /// A missing catalog is `Ok(None)`; returns an error when the file
    /// exists but cannot be read or decoded.
    pub fn lookup(&self, blueprint: &str) -> Result<Option<Catalog>> {
        let path = self.file_for(blueprint);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        let catalog = Catalog::decode(&bytes)
            .with_context(|| format!("failed to decode catalog {}", path.display()))?;
        Ok(Some(catalog))
    }

    /// Publish a catalog. Every referenced object must already be present
    /// in the library; a catalog must never dangle.
    ///
    /// # Errors
    ///
    /// Refuses with an error when any referenced object is missing, or
    /// when the atomic write fails.
    pub fn write(&self, catalog: &Catalog, library: &Library) -> Result<()> {
        for hash in catalog.object_hashes() {
            if !library.has(hash) {
                return Err(anyhow!(
                    "refusing to publish catalog {}: object {hash} missing from library",
                    catalog.blueprint
                ));
            }
        }
        let path = self.file_for(&catalog.blueprint);
        fsops::atomic_write(&path, &catalog.encode())?;
        debug!(blueprint = %catalog.blueprint, files = catalog.entries.len(), "catalog published");
        Ok(())
    }

    /// Refresh `last_used_at`; reporting only, never used for eviction.
    pub fn bump_used(&self, blueprint: &str) -> Result<()> {
        let Some(mut catalog) = self.lookup(blueprint)? else {
            return Ok(());
        };
        catalog.last_used_at = crate::timestamp_secs();
        fsops::atomic_write(&self.file_for(blueprint), &catalog.encode())
    }

    pub fn remove(&self, blueprint: &str) -> Result<bool> {
        let path = self.file_for(blueprint);
        let _ = fs::remove_file(self.plan_for(blueprint));
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove catalog {}", path.display()))
            }
        }
    }

    /// All decodable catalogs in the store, current platform or not.
    pub fn all(&self) -> Result<Vec<Catalog>> {
        let mut catalogs = Vec::new();
        if !self.dir.is_dir() {
            return Ok(catalogs);
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read catalog dir {}", self.dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        paths.sort();
        for path in paths {
            if !path.is_file() || path.extension().is_some_and(|ext| ext == "plan") {
                continue;
            }
            let Ok(bytes) = fs::read(&path) else { continue };
            match Catalog::decode(&bytes) {
                Ok(catalog) => catalogs.push(catalog),
                Err(err) => debug!(path = %path.display(), %err, "skipping undecodable catalog"),
            }
        }
        Ok(catalogs)
    }

    pub fn list(&self) -> Result<Vec<CatalogSummary>> {
        let now = crate::timestamp_secs();
        Ok(self
            .all()?
            .into_iter()
            .map(|catalog| CatalogSummary {
                files: catalog
                    .entries
                    .iter()
                    .filter(|entry| entry.kind == EntryKind::File)
                    .count(),
                age_days: now.saturating_sub(catalog.created_at) / SECONDS_PER_DAY,
                idle_days: now.saturating_sub(catalog.last_used_at) / SECONDS_PER_DAY,
                blueprint: catalog.blueprint,
                platform: catalog.platform,
                arch: catalog.arch,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<TreeEntry> {
        vec![
            TreeEntry {
                rel_path: "bin".to_string(),
                mode: 0o755,
                kind: EntryKind::Dir,
                digest: String::new(),
            },
            TreeEntry {
                rel_path: "bin/python".to_string(),
                mode: 0o755,
                kind: EntryKind::File,
                digest: "aa".repeat(32),
            },
            TreeEntry {
                rel_path: "bin/python3".to_string(),
                mode: 0o777,
                kind: EntryKind::Symlink("python".to_string()),
                digest: "bb".repeat(32),
            },
        ]
    }

    #[test]
    fn encode_decode_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = Context::new(temp.path(), "test", "test");
        let catalog = Catalog::new(&ctx, "0123456789abcdef", sample_entries());
        let decoded = Catalog::decode(&catalog.encode()).expect("decode");
        assert_eq!(decoded, catalog);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Catalog::decode(b"nonsense").is_err());
        assert!(Catalog::decode(b"htcat").is_err());
    }

    #[test]
    fn entries_are_sorted_by_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = Context::new(temp.path(), "test", "test");
        let mut entries = sample_entries();
        entries.reverse();
        let catalog = Catalog::new(&ctx, "0123456789abcdef", entries);
        let paths: Vec<&str> = catalog
            .entries
            .iter()
            .map(|entry| entry.rel_path.as_str())
            .collect();
        assert_eq!(paths, vec!["bin", "bin/python", "bin/python3"]);
    }

    #[test]
    fn write_refuses_dangling_objects() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = Context::new(temp.path(), "test", "test");
        ctx.ensure_layout().expect("layout");
        let store = CatalogStore::new(&ctx).expect("store");
        let library = Library::new(&ctx).expect("library");

        let catalog = Catalog::new(&ctx, "0123456789abcdef", sample_entries());
        let err = store.write(&catalog, &library).unwrap_err();
        assert!(err.to_string().contains("missing from library"));
        assert!(store.lookup("0123456789abcdef").expect("lookup").is_none());
    }
}
