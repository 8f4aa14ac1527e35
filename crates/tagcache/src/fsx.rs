//! Filesystem primitives behind a small trait.
//!
//! The reference-counting-via-hardlinks scheme depends on `link(2)` and
//! accurate `nlink` reporting. Isolating those operations (plus atomic
//! rename, mtime writes, and advisory locking) behind [`FsPrimitives`] lets
//! platforms without hardlink semantics substitute e.g. a sidecar
//! reference-count file without touching the entry state machine.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Expiry sentinel for entries that never expire: 9999-12-31T23:59:59Z.
pub const FAR_FUTURE_UNIX_SECS: u64 = 253_402_300_799;

/// The operations the engine needs from the filesystem.
pub trait FsPrimitives: fmt::Debug + Send + Sync {
    /// Create a hardlink at `link` pointing at `original`'s inode.
    fn hardlink(&self, original: &Path, link: &Path) -> io::Result<()>;

    /// Atomically move `from` onto `to`, replacing any previous target.
    fn rename_atomic(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Live hardlink count of the inode described by `meta`.
    fn stat_nlink(&self, meta: &fs::Metadata) -> io::Result<u64>;

    /// Inode number of the file described by `meta`.
    fn stat_inode(&self, meta: &fs::Metadata) -> io::Result<u64>;

    /// Attempt a non-blocking exclusive advisory lock on `file`.
    ///
    /// Returns `Ok(false)` when another holder already has the lock; the
    /// lock is released when `file` is closed.
    fn lock_exclusive_nonblocking(&self, file: &File) -> io::Result<bool>;

    /// Set the mtime of `path` to `unix_secs` (whole seconds).
    fn set_mtime(&self, path: &Path, unix_secs: u64) -> io::Result<()>;
}

/// Default [`FsPrimitives`] backed by the host filesystem.
///
/// Link counts and inode numbers are Unix-only; elsewhere they report
/// `Unsupported` and the engine degrades to expiry-only staleness checks.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFs;

impl FsPrimitives for StdFs {
    fn hardlink(&self, original: &Path, link: &Path) -> io::Result<()> {
        fs::hard_link(original, link)
    }

    fn rename_atomic(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    #[cfg(unix)]
    fn stat_nlink(&self, meta: &fs::Metadata) -> io::Result<u64> {
        use std::os::unix::fs::MetadataExt as _;
        Ok(meta.nlink())
    }

    #[cfg(not(unix))]
    fn stat_nlink(&self, _meta: &fs::Metadata) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "hardlink counts are unavailable on this platform",
        ))
    }

    #[cfg(unix)]
    fn stat_inode(&self, meta: &fs::Metadata) -> io::Result<u64> {
        use std::os::unix::fs::MetadataExt as _;
        Ok(meta.ino())
    }

    #[cfg(not(unix))]
    fn stat_inode(&self, _meta: &fs::Metadata) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "inode numbers are unavailable on this platform",
        ))
    }

    fn lock_exclusive_nonblocking(&self, file: &File) -> io::Result<bool> {
        use fs2::FileExt as _;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn set_mtime(&self, path: &Path, unix_secs: u64) -> io::Result<()> {
        filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(unix_secs as i64, 0))
    }
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs(),
        Err(err) => {
            // Clock set before 1970; log at most once rather than spamming
            // hot read paths.
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "tagcache",
                    error = %err,
                    "system time is before the unix epoch; using 0 for now_secs"
                );
            }
            0
        }
    }
}

/// mtime of `meta` in whole seconds since the Unix epoch (0 when unknown,
/// which callers treat as long expired).
pub(crate) fn mtime_secs(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Idempotent, concurrency-safe directory creation.
pub(crate) fn ensure_dir(path: &Path) -> io::Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a uniquely named staging file under `tmp_dir`.
///
/// Uniqueness is enforced by `create_new`; collisions (pid reuse after a
/// crash) just advance the counter and retry.
pub(crate) fn open_unique_tmp_file(tmp_dir: &Path) -> io::Result<(PathBuf, File)> {
    let pid = std::process::id();
    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = tmp_dir.join(format!("{pid}.{counter}.tmp"));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::debug!(
                target = "tagcache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove file"
            );
        }
    }
}

/// Publish `tmp_path` at `dest`, replacing any previous version in one
/// rename.
///
/// On Windows `rename` does not overwrite; under concurrent writers multiple
/// remove+rename sequences can race, so retry until one wins.
pub(crate) fn publish(fs_prim: &dyn FsPrimitives, tmp_path: &Path, dest: &Path) -> io::Result<()> {
    const MAX_RENAME_ATTEMPTS: usize = 1024;

    let mut attempts = 0_usize;
    loop {
        match fs_prim.rename_atomic(tmp_path, dest) {
            Ok(()) => break,
            Err(err)
                if cfg!(windows)
                    && (err.kind() == io::ErrorKind::AlreadyExists || dest.exists()) =>
            {
                match fs::remove_file(dest) {
                    Ok(()) => {}
                    Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                    Err(remove_err) => return Err(remove_err),
                }

                attempts += 1;
                if attempts >= MAX_RENAME_ATTEMPTS {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }

    if let Some(parent) = dest.parent() {
        sync_dir_best_effort(parent);
    }
    Ok(())
}

fn sync_dir_best_effort(dir: &Path) {
    // After publishing via rename, fsync the directory entry so the rename
    // survives a crash.
    #[cfg(unix)]
    {
        match File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                static REPORTED: OnceLock<()> = OnceLock::new();
                if REPORTED.set(()).is_ok() {
                    tracing::debug!(
                        target = "tagcache",
                        dir = %dir.display(),
                        error = %err,
                        "failed to sync directory (best effort)"
                    );
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}
