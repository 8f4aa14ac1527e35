//! Store: owns the cache root layout, invalidation, and the reclamation
//! sweep.

use crate::addr::{self, DigestFn, Namespace};
use crate::entry::EntryBuilder;
use crate::error::{CacheError, Result};
use crate::fsx::{self, FsPrimitives, StdFs};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Counts of artifacts physically reclaimed by one [`Store::cleanup`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Entry files removed because their expiry (mtime) had passed.
    pub keys_reclaimed: u64,
    /// Tag links removed because of link-count drift or expiry.
    pub tag_links_reclaimed: u64,
}

/// Construction options for [`Store::open_with`].
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Digest used to shard names under `data/`.
    pub digest: DigestFn,
    /// Filesystem primitives; substitute these on platforms without
    /// hardlink semantics.
    pub fs: Arc<dyn FsPrimitives>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            digest: addr::sha256_128,
            fs: Arc::new(StdFs),
        }
    }
}

/// Handle to one cache root.
///
/// The root contains `data/` (sharded entry files and tag indexes) and
/// `tmp/` (staging files, never read by consumers). Cloning is cheap; clones
/// share the same root and primitives.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
    data_dir: PathBuf,
    tmp_dir: PathBuf,
    digest: DigestFn,
    fs: Arc<dyn FsPrimitives>,
}

impl Store {
    /// Open (creating if necessary) the cache rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(root, StoreOptions::default())
    }

    pub fn open_with(root: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        match fs::symlink_metadata(&root) {
            Ok(meta) if !meta.is_dir() => {
                return Err(CacheError::RootNotADirectory { path: root });
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let data_dir = root.join("data");
        let tmp_dir = root.join("tmp");
        fsx::ensure_dir(&data_dir)?;
        fsx::ensure_dir(&tmp_dir)?;

        Ok(Self {
            root,
            data_dir,
            tmp_dir,
            digest: options.digest,
            fs: options.fs,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub(crate) fn fs(&self) -> &dyn FsPrimitives {
        self.fs.as_ref()
    }

    pub(crate) fn entry_path(&self, key: &str) -> PathBuf {
        self.data_dir
            .join(addr::rel_path(self.digest, Namespace::Key, key))
    }

    pub(crate) fn tag_dir(&self, tag: &str) -> PathBuf {
        self.data_dir
            .join(addr::rel_path(self.digest, Namespace::Tag, tag))
    }

    /// Bind `key` for get-or-generate access.
    ///
    /// Expiry, tags, and the producer are supplied on the returned builder.
    pub fn define(&self, key: impl Into<String>) -> EntryBuilder<'_> {
        EntryBuilder::new(self, key.into())
    }

    /// Expire `key` immediately by touching its mtime into the past.
    ///
    /// Cheap: nothing is deleted. The next read regenerates the value and
    /// [`Store::cleanup`] reclaims the old file. Missing entries are a no-op.
    pub fn invalidate_key(&self, key: &str) -> Result<()> {
        addr::validate_name("key", key)?;
        let path = self.entry_path(key);
        match self.fs.set_mtime(&path, 0) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Invalidate every entry carrying `tag` in one operation.
    ///
    /// Removes the tag's index directory. Entry files themselves are not
    /// touched and keep serving until each is next read (link-count drift)
    /// or swept. The directory is renamed aside into `tmp/` first so the
    /// invalidation takes effect in a single filesystem operation, then the
    /// renamed tree is deleted without following symlinks.
    pub fn invalidate_tag(&self, tag: &str) -> Result<()> {
        addr::validate_name("tag", tag)?;
        let dir = self.tag_dir(tag);
        match fs::symlink_metadata(&dir) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let trash = unique_trash_path(&self.tmp_dir);
        match fs::rename(&dir, &trash) {
            Ok(()) => match remove_dir_all_nofollow(&trash) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(_) => {
                // Fall back to removing in place (e.g. Windows file locks).
                match remove_dir_all_nofollow(&dir) {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    /// Reconcile on-disk state with logical validity, reclaiming space.
    ///
    /// One pass over the two-level shard tree: entry files are unlinked once
    /// their expiry (mtime) has passed; tag links are unlinked when their
    /// recorded link count no longer matches the live count of their inode
    /// (drift: a sibling tag link was already removed) or their own expiry
    /// has passed. Removing a tag link is itself what decrements the live
    /// count seen by surviving entry files, so the sweep converges.
    ///
    /// Safe to run concurrently with readers, writers, and other sweeps:
    /// every destructive step is a single unlink, and anything that vanishes
    /// mid-walk counts as already reclaimed.
    pub fn cleanup(&self) -> Result<CleanupStats> {
        let now = fsx::now_secs();
        let mut stats = CleanupStats::default();

        for shard in read_dir_tolerant(&self.data_dir) {
            for sub in read_dir_tolerant(&shard.path()) {
                for item in read_dir_tolerant(&sub.path()) {
                    let name_os = item.file_name();
                    let Some(name) = name_os.to_str() else {
                        continue;
                    };
                    if name.starts_with("k:") {
                        self.sweep_entry_file(&item.path(), now, &mut stats);
                    } else if name.starts_with("t:") {
                        self.sweep_tag_dir(&item.path(), now, &mut stats);
                    }
                }
            }
        }

        tracing::debug!(
            target = "tagcache",
            keys_reclaimed = stats.keys_reclaimed,
            tag_links_reclaimed = stats.tag_links_reclaimed,
            "cleanup pass finished"
        );
        Ok(stats)
    }

    fn sweep_entry_file(&self, path: &Path, now: u64, stats: &mut CleanupStats) {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            // Raced with deletion: already reclaimed.
            Err(_) => return,
        };
        if !meta.is_file() || fsx::mtime_secs(&meta) >= now {
            return;
        }
        if remove_if_present(path) {
            stats.keys_reclaimed += 1;
        }
    }

    fn sweep_tag_dir(&self, tag_dir: &Path, now: u64, stats: &mut CleanupStats) {
        for sub in read_dir_tolerant(tag_dir) {
            for link in read_dir_tolerant(&sub.path()) {
                let link_path = link.path();
                let name_os = link.file_name();
                let Some(name) = name_os.to_str() else {
                    continue;
                };
                let Some((expected, _inode)) = addr::parse_link_name(name) else {
                    // Not a link we wrote; clear it out but don't count it.
                    remove_if_present(&link_path);
                    continue;
                };

                let meta = match fs::symlink_metadata(&link_path) {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                let drifted = self
                    .fs
                    .stat_nlink(&meta)
                    .map_or(false, |live| live != expected);
                let expired = fsx::mtime_secs(&meta) < now;
                if (drifted || expired) && remove_if_present(&link_path) {
                    stats.tag_links_reclaimed += 1;
                }
            }
        }
    }
}

static SHARED: OnceLock<Store> = OnceLock::new();

/// Configure the process-wide store exactly once.
///
/// A second call fails with [`CacheError::AlreadyConfigured`], even for the
/// same root; callers needing several roots should hold [`Store`] values
/// directly.
pub fn configure(root: impl AsRef<Path>) -> Result<&'static Store> {
    if SHARED.get().is_some() {
        return Err(CacheError::AlreadyConfigured);
    }
    let store = Store::open(root)?;
    match SHARED.set(store) {
        Ok(()) => Ok(SHARED.get().expect("store was just configured")),
        Err(_) => Err(CacheError::AlreadyConfigured),
    }
}

/// The process-wide store configured by [`configure`], if any.
pub fn shared() -> Option<&'static Store> {
    SHARED.get()
}

fn read_dir_tolerant(dir: &Path) -> Vec<fs::DirEntry> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            // Directories can race with invalidation; only log surprises.
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "tagcache",
                    dir = %dir.display(),
                    error = %err,
                    "failed to read directory during cleanup"
                );
            }
            return Vec::new();
        }
    };
    entries.filter_map(|entry| entry.ok()).collect()
}

fn remove_if_present(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => {
            tracing::debug!(
                target = "tagcache",
                path = %path.display(),
                error = %err,
                "failed to reclaim file during cleanup"
            );
            false
        }
    }
}

fn unique_trash_path(tmp_dir: &Path) -> PathBuf {
    let pid = std::process::id();
    let ts = fsx::now_secs();
    for attempt in 0..1000_u32 {
        let candidate = tmp_dir.join(format!("inv-{pid}-{ts}-{attempt}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    tmp_dir.join(format!("inv-{pid}-{ts}"))
}

fn remove_dir_all_nofollow(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() || !meta.is_dir() {
        return match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::IsADirectory => fs::remove_dir(path),
            Err(err) => Err(err),
        };
    }

    for entry in walkdir::WalkDir::new(path)
        .follow_links(false)
        .contents_first(true)
    {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
