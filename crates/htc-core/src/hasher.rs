use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{anyhow, Context as _, Result};
use sha2::{Digest, Sha256};
use tracing::trace;
use walkdir::WalkDir;

use crate::context::Context;
use crate::fsops;

/// Link kind of one tree entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink(String),
}

/// One entry of a canonical tree walk: relative path, unix mode, kind, and
/// the content digest (empty for directories).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub rel_path: String,
    pub mode: u32,
    pub kind: EntryKind,
    pub digest: String,
}

/// Streamed SHA-256 of a file's bytes, rendered as 64 lowercase hex digits.
///
/// # Errors
///
/// Returns an error when the file cannot be opened or read.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn digest_text(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Walk a tree in canonical order: pre-order, children sorted by byte
/// value, deny-listed names skipped. Regular files are content-digested,
/// symlink targets are recorded and digested as text, directories
/// contribute path and mode only.
///
/// # Errors
///
/// Returns an error when the walk fails or an entry cannot be digested.
pub fn collect_tree_entries(ctx: &Context, root: &Path) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by(|a, b| a.path().cmp(b.path()))
        .into_iter()
        .filter_entry(|entry| !ctx.is_ignored(entry.file_name()));
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let path = entry.path();
        let rel_path = path
            .strip_prefix(root)
            .context("failed to relativize path")?
            .to_string_lossy()
            .replace('\\', "/");
        let meta = fs::symlink_metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let file_type = meta.file_type();
        let tree_entry = if file_type.is_symlink() {
            let target = fs::read_link(path)
                .with_context(|| format!("failed to read symlink {}", path.display()))?
                .to_string_lossy()
                .replace('\\', "/");
            TreeEntry {
                rel_path,
                mode: 0o777,
                kind: EntryKind::Symlink(target.clone()),
                digest: digest_text(&target),
            }
        } else if file_type.is_dir() {
            TreeEntry {
                rel_path,
                mode: fsops::unix_mode(&meta),
                kind: EntryKind::Dir,
                digest: String::new(),
            }
        } else if file_type.is_file() {
            TreeEntry {
                rel_path,
                mode: fsops::unix_mode(&meta),
                kind: EntryKind::File,
                digest: digest_file(path)?,
            }
        } else {
            continue;
        };
        entries.push(tree_entry);
    }
    // Canonical order is byte order of the relative paths, matching how
    // catalog entries are kept.
    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(entries)
}

/// SHA-256 over the sorted `(path || mode || content digest)` stream. Both
/// a live tree walk and a catalog's entry list feed the same computation,
/// so restores can stamp `.meta` without re-reading what they just wrote.
#[must_use]
pub fn digest_entries(entries: &[TreeEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.rel_path.as_bytes());
        hasher.update(b"\n");
        hasher.update(format!("{:o}", entry.mode).as_bytes());
        hasher.update(b"\n");
        if !entry.digest.is_empty() {
            hasher.update(entry.digest.as_bytes());
            hasher.update(b"\n");
        }
    }
    hex::encode(hasher.finalize())
}

pub fn tree_digest(ctx: &Context, root: &Path) -> Result<String> {
    Ok(digest_entries(&collect_tree_entries(ctx, root)?))
}

pub fn meta_save(target: &Path, digest: &str) -> Result<()> {
    fsops::atomic_write(&fsops::meta_path(target), digest.as_bytes())
}

pub fn meta_load(target: &Path) -> Result<String> {
    let path = fsops::meta_path(target);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read metafile {}", path.display()))?;
    let digest = raw.trim().to_string();
    if digest.is_empty() {
        return Err(anyhow!("metafile {} is empty", path.display()));
    }
    Ok(digest)
}

pub fn meta_touch(target: &Path) -> Result<()> {
    fsops::touch(&fsops::meta_path(target), SystemTime::now())
}

/// A tree is pristine iff re-walking it reproduces the digest stored in
/// its `.meta` sidecar.
#[must_use]
pub fn is_pristine(ctx: &Context, root: &Path) -> bool {
    if !root.is_dir() {
        return false;
    }
    let expected = match meta_load(root) {
        Ok(expected) => expected,
        Err(err) => {
            trace!(root = %root.display(), %err, "metafile unavailable");
            return false;
        }
    };
    match tree_digest(ctx, root) {
        Ok(actual) => actual == expected,
        Err(err) => {
            trace!(root = %root.display(), %err, "tree digest failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context(root: &Path) -> Context {
        Context::new(root, "test", "test")
    }

    fn seed_tree(root: &Path) {
        fs::create_dir_all(root.join("bin")).expect("bin");
        fs::write(root.join("bin/tool"), b"#!/bin/sh\n").expect("tool");
        fs::write(root.join("readme.txt"), b"hello").expect("readme");
        fs::create_dir_all(root.join("__pycache__")).expect("pycache");
        fs::write(root.join("__pycache__/junk.pyc"), b"junk").expect("junk");
    }

    #[test]
    fn tree_digest_is_deterministic_and_skips_deny_list() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(temp.path());
        let root = temp.path().join("tree");
        seed_tree(&root);

        let first = tree_digest(&ctx, &root).expect("digest");
        let second = tree_digest(&ctx, &root).expect("digest again");
        assert_eq!(first, second);

        // Deny-listed content does not participate.
        fs::write(root.join("__pycache__/more.pyc"), b"more").expect("more junk");
        assert_eq!(tree_digest(&ctx, &root).expect("digest"), first);

        // Real content does.
        fs::write(root.join("readme.txt"), b"changed").expect("tamper");
        assert_ne!(tree_digest(&ctx, &root).expect("digest"), first);
    }

    #[test]
    fn pristine_tracks_meta_sidecar() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(temp.path());
        let root = temp.path().join("tree");
        seed_tree(&root);

        assert!(!is_pristine(&ctx, &root));
        let digest = tree_digest(&ctx, &root).expect("digest");
        meta_save(&root, &digest).expect("meta");
        assert!(is_pristine(&ctx, &root));

        // Touching the metafile changes nothing about pristineness.
        meta_touch(&root).expect("touch");
        assert!(is_pristine(&ctx, &root));

        fs::write(root.join("readme.txt"), b"tampered").expect("tamper");
        assert!(!is_pristine(&ctx, &root));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_hash_their_target_not_their_referent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(temp.path());
        let root = temp.path().join("tree");
        fs::create_dir_all(&root).expect("root");
        fs::write(root.join("real.txt"), b"payload").expect("real");
        crate::fsops::make_symlink(Path::new("real.txt"), &root.join("alias")).expect("link");

        let entries = collect_tree_entries(&ctx, &root).expect("entries");
        let alias = entries
            .iter()
            .find(|entry| entry.rel_path == "alias")
            .expect("alias entry");
        assert_eq!(alias.kind, EntryKind::Symlink("real.txt".to_string()));
        assert_eq!(alias.digest, digest_text("real.txt"));
    }

    #[test]
    fn entry_digest_matches_walk_digest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(temp.path());
        let root = temp.path().join("tree");
        seed_tree(&root);

        let entries = collect_tree_entries(&ctx, &root).expect("entries");
        assert_eq!(digest_entries(&entries), tree_digest(&ctx, &root).expect("digest"));
    }
}
