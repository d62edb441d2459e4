use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context as _, Result};
use tracing::debug;

/// Create a directory and all parents; idempotent.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

/// Create a directory whose mode bits include world-rwx, so other users of
/// a shared cache can traverse it.
pub fn ensure_shared_dir(path: &Path) -> Result<()> {
    ensure_dir(path)?;
    make_shared(path)
}

#[cfg(unix)]
pub fn is_shared_dir(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match fs::metadata(path) {
        Ok(meta) => meta.is_dir() && meta.permissions().mode() & 0o777 == 0o777,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_shared_dir(path: &Path) -> bool {
    path.is_dir()
}

#[cfg(unix)]
pub fn make_shared(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let mode = if meta.is_dir() { 0o777 } else { 0o666 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to share {}", path.display()))
}

#[cfg(not(unix))]
pub fn make_shared(_path: &Path) -> Result<()> {
    Ok(())
}

/// Write bytes to `<path>.tmp`, fsync, then rename over the destination.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} into place", tmp.display()))
}

/// Create the file if needed and stamp its modification time.
pub fn touch(path: &Path, when: SystemTime) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to touch {}", path.display()))?;
    file.set_times(FileTimes::new().set_modified(when))
        .with_context(|| format!("failed to stamp {}", path.display()))?;
    Ok(())
}

/// Sidecar path for a tree's expected digest: `<target>.meta`, next to the
/// tree rather than inside it.
#[must_use]
pub fn meta_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_os_string();
    os.push(".meta");
    PathBuf::from(os)
}

/// Rename to `<path>.<rand8hex>` and recursively delete; sidesteps
/// "file busy" deletion failures for trees with open files. Also drops the
/// `.meta` sidecar when one exists.
pub fn rename_and_remove(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()))
        }
    };

    if meta.is_dir() {
        let mut doomed = path.as_os_str().to_os_string();
        doomed.push(format!(".{:08x}", rand::random::<u32>()));
        let doomed = PathBuf::from(doomed);
        debug!(path = %path.display(), doomed = %doomed.display(), "rename and remove");
        fs::rename(path, &doomed)
            .with_context(|| format!("failed to rename {} for removal", path.display()))?;
        fs::remove_dir_all(&doomed)
            .with_context(|| format!("failed to remove {}", doomed.display()))?;
    } else {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }

    let sidecar = meta_path(path);
    if sidecar.is_file() {
        let _ = fs::remove_file(&sidecar);
    }
    Ok(())
}

/// Copy a single entry, recreating symlinks instead of following them.
pub fn copy_any(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        ensure_dir(parent)?;
    }
    let meta = fs::symlink_metadata(source)
        .with_context(|| format!("failed to stat {}", source.display()))?;
    if meta.file_type().is_symlink() {
        let link = fs::read_link(source)
            .with_context(|| format!("failed to read symlink {}", source.display()))?;
        if fs::symlink_metadata(target).is_ok() {
            let _ = fs::remove_file(target);
        }
        return make_symlink(&link, target);
    }
    fs::copy(source, target).with_context(|| {
        format!(
            "failed to copy {} -> {}",
            source.display(),
            target.display()
        )
    })?;
    Ok(())
}

#[cfg(unix)]
pub fn make_symlink(link_target: &Path, at: &Path) -> Result<()> {
    use std::os::unix::fs::symlink;
    symlink(link_target, at).with_context(|| {
        format!(
            "failed to create symlink {} -> {}",
            at.display(),
            link_target.display()
        )
    })
}

#[cfg(not(unix))]
pub fn make_symlink(link_target: &Path, at: &Path) -> Result<()> {
    use std::os::windows::fs::symlink_file;
    symlink_file(link_target, at).with_context(|| {
        format!(
            "failed to create symlink {} -> {}",
            at.display(),
            link_target.display()
        )
    })
}

#[cfg(unix)]
pub fn set_readonly(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o555 } else { 0o444 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to protect {}", path.display()))
}

#[cfg(not(unix))]
pub fn set_readonly(path: &Path, _executable: bool) -> Result<()> {
    let mut perms = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
        .with_context(|| format!("failed to protect {}", path.display()))
}

#[cfg(unix)]
pub fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
pub fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
pub fn unix_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub fn unix_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else {
        0o644
    }
}

#[cfg(unix)]
pub fn set_unix_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
pub fn set_unix_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("nested").join("value.bin");
        atomic_write(&target, b"one").expect("first write");
        atomic_write(&target, b"two").expect("second write");
        assert_eq!(fs::read(&target).expect("read"), b"two");
        assert!(!target.with_extension("bin.tmp").exists());
    }

    #[test]
    fn rename_and_remove_takes_sidecar_along() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = temp.path().join("space");
        fs::create_dir_all(tree.join("inner")).expect("tree");
        fs::write(tree.join("inner/file.txt"), b"data").expect("file");
        fs::write(meta_path(&tree), b"digest").expect("meta");

        rename_and_remove(&tree).expect("remove");
        assert!(!tree.exists());
        assert!(!meta_path(&tree).exists());
        // Idempotent on a missing path.
        rename_and_remove(&tree).expect("second remove");
    }

    #[cfg(unix)]
    #[test]
    fn copy_any_recreates_symlinks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let file = temp.path().join("real.txt");
        fs::write(&file, b"payload").expect("file");
        let link = temp.path().join("link");
        make_symlink(Path::new("real.txt"), &link).expect("symlink");

        let copied = temp.path().join("copy");
        copy_any(&link, &copied).expect("copy");
        let target = fs::read_link(&copied).expect("readlink");
        assert_eq!(target, Path::new("real.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn shared_dir_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("shared");
        ensure_shared_dir(&dir).expect("shared dir");
        assert!(is_shared_dir(&dir));
        assert!(!is_shared_dir(&dir.join("missing")));
    }
}
