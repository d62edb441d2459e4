use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context as _, Result};
use fs4::FileExt;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, trace, warn};

use crate::context::{unslash, Context};
use crate::error::HoloError;
use crate::fsops;

pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const FIRST_NOTICE: Duration = Duration::from_secs(5);
const STALE_AFTER: Duration = Duration::from_secs(12 * 60 * 60);

/// Handle for a held named lock. Real locks unlock the file and remove the
/// PID marker on release; the lockless variant does nothing. Double release
/// is a no-op, and dropping releases.
#[derive(Debug)]
pub struct Releaser {
    held: Option<Held>,
}

#[derive(Debug)]
struct Held {
    file: File,
    marker: PathBuf,
    name: String,
}

impl Releaser {
    fn lockless() -> Self {
        trace!("locker: lockless mode");
        Self { held: None }
    }

    /// # Errors
    ///
    /// Returns an error when the underlying file lock cannot be released.
    pub fn release(&mut self) -> Result<()> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };
        held.file
            .unlock()
            .with_context(|| format!("failed to unlock {}", held.name))?;
        if let Err(err) = fs::remove_file(&held.marker) {
            if err.kind() != ErrorKind::NotFound {
                debug!(marker = %held.marker.display(), %err, "failed to remove pid marker");
            }
        }
        trace!(lock = %held.name, "locker: released");
        Ok(())
    }
}

impl Drop for Releaser {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Acquire a named exclusive cross-process lock. `max_wait` of `None`
/// blocks indefinitely (the build lock); bounded waits surface
/// `HoloError::LockTimeout`. While held, a PID marker file exists under
/// `hololib/pids/`. A background notifier reports "still waiting" on a
/// growing backoff until the lock is obtained.
///
/// # Errors
///
/// Returns `HoloError::LockTimeout` when the wait budget runs out, or an
/// I/O error when the lock file cannot be created or locked.
pub fn acquire(ctx: &Context, path: &Path, max_wait: Option<Duration>) -> Result<Releaser> {
    if ctx.flags.lockless {
        return Ok(Releaser::lockless());
    }
    let name = path.display().to_string();
    if let Some(parent) = path.parent() {
        fsops::ensure_shared_dir(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open lock file {name}"))?;
    let _ = fsops::make_shared(path);

    let _notifier = WaitNotifier::start(name.clone());
    let deadline = max_wait.map(|wait| Instant::now() + wait);
    let started = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => break,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return Err(HoloError::LockTimeout {
                            name,
                            waited_ms: started.elapsed().as_millis() as u64,
                        }
                        .into());
                    }
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to lock {name}"));
            }
        }
    }

    let marker = ctx.pids_dir().join(marker_name(ctx, path));
    let _ = file.set_len(0);
    let _ = file.write_all(marker.display().to_string().as_bytes());
    fsops::touch(&marker, SystemTime::now())?;
    debug!(lock = %name, marker = %marker.display(), "locker: acquired");
    Ok(Releaser {
        held: Some(Held { file, marker, name }),
    })
}

/// Background "still waiting on <lock>" reporter with 5s/15s/45s backoff.
/// Stops when dropped.
struct WaitNotifier {
    stop: Option<mpsc::Sender<()>>,
}

impl WaitNotifier {
    fn start(name: String) -> Self {
        let (stop, waited) = mpsc::channel::<()>();
        thread::spawn(move || {
            let mut delay = FIRST_NOTICE;
            let mut counter = 0u32;
            loop {
                match waited.recv_timeout(delay) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        counter += 1;
                        warn!(lock = %name, attempt = counter, "still waiting on lock");
                        delay *= 3;
                    }
                    _ => break,
                }
            }
        });
        Self { stop: Some(stop) }
    }
}

impl Drop for WaitNotifier {
    fn drop(&mut self) {
        self.stop.take();
    }
}

fn marker_name(ctx: &Context, lock_path: &Path) -> String {
    let format = format_description!("[year][month][day][hour][minute][second]");
    let stamp = OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "00000000000000".to_string());
    let user = env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .map(|user| unslash(&user))
        .unwrap_or_else(|_| "unspecified".to_string());
    let base = lock_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown.lck".to_string());
    format!(
        "{stamp}_{user}_{}_{}_{}_{base}",
        ctx.controller,
        ctx.space,
        std::process::id()
    )
}

/// Classification of a PID marker for diagnostics: markers older than 12
/// hours are stale leftovers, younger ones mean someone is (or recently
/// was) holding the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStatus {
    Pending,
    Stale,
}

#[derive(Debug)]
pub struct LockMarker {
    pub path: PathBuf,
    pub status: MarkerStatus,
    pub age: Duration,
}

/// # Errors
///
/// Returns an error when the pids directory cannot be read.
pub fn list_markers(ctx: &Context) -> Result<Vec<LockMarker>> {
    let pids = ctx.pids_dir();
    if !pids.is_dir() {
        return Ok(Vec::new());
    }
    let mut markers = Vec::new();
    for entry in fs::read_dir(&pids)
        .with_context(|| format!("failed to read pids directory {}", pids.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let age = entry
            .metadata()?
            .modified()
            .ok()
            .and_then(|when| SystemTime::now().duration_since(when).ok())
            .unwrap_or_default();
        let status = if age > STALE_AFTER {
            MarkerStatus::Stale
        } else {
            MarkerStatus::Pending
        };
        markers.push(LockMarker {
            path: entry.path(),
            status,
            age,
        });
    }
    markers.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(markers)
}
