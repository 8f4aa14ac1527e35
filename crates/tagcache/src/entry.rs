//! The get-or-generate unit: freshness inspection, single-flight
//! regeneration, atomic publication, and tag index linking.

use crate::addr;
use crate::error::Result;
use crate::fsx;
use crate::serialize::{BincodeSerializer, Serializer, PAYLOAD_LIMIT_BYTES};
use crate::store::Store;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io::{self, Read as _, Write as _};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Entry files may carry a tag line on top of the payload; cap reads at the
/// payload limit plus a generous tag-line allowance.
const MAX_ENTRY_FILE_BYTES: u64 = (PAYLOAD_LIMIT_BYTES + 64 * 1024) as u64;

/// Mutable parameters handed to the producer callback.
///
/// The producer can veto caching or adjust expiry/tags based on what it
/// discovers while computing; the engine reads the struct back after the
/// callback returns.
#[derive(Clone, Debug)]
pub struct ProducerContext {
    /// Seconds until the produced value expires; `None` never expires.
    pub expire: Option<u64>,
    /// Tags to index the produced value under.
    pub tags: BTreeSet<String>,
    disabled: bool,
}

impl ProducerContext {
    /// Suppress persistence of this call's result.
    pub fn disable(&mut self) {
        self.disabled = true;
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

/// Builder returned by [`Store::define`].
#[derive(Debug)]
pub struct EntryBuilder<'s> {
    store: &'s Store,
    key: String,
    expire: Option<u64>,
    tags: BTreeSet<String>,
}

impl<'s> EntryBuilder<'s> {
    pub(crate) fn new(store: &'s Store, key: String) -> Self {
        Self {
            store,
            key,
            expire: None,
            tags: BTreeSet::new(),
        }
    }

    /// Expire the cached value `secs` seconds after it is produced.
    pub fn expire(mut self, secs: u64) -> Self {
        self.expire = Some(secs);
        self
    }

    /// Index the cached value under `tag`.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Index the cached value under every tag in `tags`.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Bind `producer`, using the default bincode serializer.
    ///
    /// Key and tag formats are validated here, before any I/O happens.
    pub fn build<T, P>(self, producer: P) -> Result<Entry<'s, T, P, BincodeSerializer>>
    where
        T: Serialize + DeserializeOwned,
        P: Fn(&mut ProducerContext) -> Result<T>,
    {
        self.build_with_serializer(BincodeSerializer, producer)
    }

    pub fn build_with_serializer<T, P, S>(
        self,
        serializer: S,
        producer: P,
    ) -> Result<Entry<'s, T, P, S>>
    where
        P: Fn(&mut ProducerContext) -> Result<T>,
        S: Serializer<T>,
    {
        addr::validate_name("key", &self.key)?;
        for tag in &self.tags {
            addr::validate_name("tag", tag)?;
        }

        let path = self.store.entry_path(&self.key);
        Ok(Entry {
            store: self.store,
            path,
            expire: self.expire,
            tags: self.tags,
            producer,
            serializer,
            _value: PhantomData,
        })
    }
}

/// One key bound to an expiry, a tag set, a serializer, and a producer.
pub struct Entry<'s, T, P, S = BincodeSerializer> {
    store: &'s Store,
    path: PathBuf,
    expire: Option<u64>,
    tags: BTreeSet<String>,
    producer: P,
    serializer: S,
    _value: PhantomData<fn() -> T>,
}

// Manual impl: the producer closure has no useful Debug form.
impl<T, P, S> fmt::Debug for Entry<'_, T, P, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("path", &self.path)
            .field("expire", &self.expire)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// What was read back from an entry file before deciding on freshness.
struct StoredEntry {
    listed_tags: u64,
    expires_at: u64,
    nlink: Option<u64>,
    payload: Vec<u8>,
}

impl<'s, T, P, S> Entry<'s, T, P, S>
where
    P: Fn(&mut ProducerContext) -> Result<T>,
    S: Serializer<T>,
{
    /// Return the cached value, or produce, persist, and index a new one.
    ///
    /// Never blocks on other regenerators: when the entry is stale and the
    /// per-entry lock is contended, the pre-existing (possibly stale) value
    /// is returned instead.
    pub fn invoke(&self) -> Result<T> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target = "tagcache",
                        path = %self.path.display(),
                        error = %err,
                        "failed to open entry; treating as a miss"
                    );
                }
                return self.generate(None);
            }
        };

        let Some(stored) = self.read_stored(&file) else {
            // Unreadable or corrupt on-disk state is a miss, exactly like a
            // missing file.
            drop(file);
            return self.generate(None);
        };

        let now = fsx::now_secs();
        let expired = stored.expires_at < now;
        let tags_invalid = match stored.nlink {
            Some(live) => stored.listed_tags + 1 != live,
            // Platforms without link counts degrade to expiry-only checks.
            None => false,
        };

        if !expired && !tags_invalid {
            match self.serializer.deserialize(&stored.payload) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::debug!(
                        target = "tagcache",
                        path = %self.path.display(),
                        error = %err,
                        "failed to deserialize fresh entry; regenerating"
                    );
                    drop(file);
                    return self.generate(None);
                }
            }
        }

        match self.store.fs().lock_exclusive_nonblocking(&file) {
            // We are the sole regenerator; the lock rides on `file` until
            // the new value is published.
            Ok(true) => self.generate(Some(file)),
            Ok(false) => {
                // Another process is regenerating; serve the stale value
                // rather than block.
                match self.serializer.deserialize(&stored.payload) {
                    Ok(value) => Ok(value),
                    Err(err) => {
                        tracing::debug!(
                            target = "tagcache",
                            path = %self.path.display(),
                            error = %err,
                            "stale fallback is undecodable; regenerating"
                        );
                        drop(file);
                        self.generate(None)
                    }
                }
            }
            Err(err) => {
                tracing::debug!(
                    target = "tagcache",
                    path = %self.path.display(),
                    error = %err,
                    "lock attempt failed; regenerating without single-flight"
                );
                drop(file);
                self.generate(None)
            }
        }
    }

    fn read_stored(&self, file: &File) -> Option<StoredEntry> {
        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                tracing::debug!(
                    target = "tagcache",
                    path = %self.path.display(),
                    error = %err,
                    "failed to stat entry file"
                );
                return None;
            }
        };
        if meta.len() > MAX_ENTRY_FILE_BYTES {
            return None;
        }

        let mut bytes = Vec::with_capacity(meta.len() as usize);
        let mut reader = file;
        if let Err(err) = reader.read_to_end(&mut bytes) {
            tracing::debug!(
                target = "tagcache",
                path = %self.path.display(),
                error = %err,
                "failed to read entry file"
            );
            return None;
        }

        let Some(newline) = bytes.iter().position(|&b| b == b'\n') else {
            tracing::debug!(
                target = "tagcache",
                path = %self.path.display(),
                "entry file has no tag line; treating as corrupt"
            );
            return None;
        };

        let tag_count = {
            let tag_line = &bytes[..newline];
            if tag_line.is_empty() {
                0
            } else {
                tag_line.split(|&b| b == b':').count() as u64
            }
        };
        let payload = bytes.split_off(newline + 1);

        Some(StoredEntry {
            listed_tags: tag_count,
            expires_at: fsx::mtime_secs(&meta),
            nlink: self.store.fs().stat_nlink(&meta).ok(),
            payload,
        })
    }

    /// Produce a fresh value and (unless the producer disabled it) publish
    /// it. `_lock` keeps the advisory lock alive, when one was acquired,
    /// until the write completes.
    fn generate(&self, _lock: Option<File>) -> Result<T> {
        let mut ctx = ProducerContext {
            expire: self.expire,
            tags: self.tags.clone(),
            disabled: false,
        };
        let value = (self.producer)(&mut ctx)?;
        if ctx.disabled {
            return Ok(value);
        }

        let payload = self.serializer.serialize(&value)?;
        self.persist(&ctx, &payload)?;
        Ok(value)
    }

    fn persist(&self, ctx: &ProducerContext, payload: &[u8]) -> Result<()> {
        let fs_prim = self.store.fs();
        let (tmp_path, mut file) = fsx::open_unique_tmp_file(self.store.tmp_dir())?;

        let write_result = (|| -> Result<()> {
            file.write_all(tag_line(&ctx.tags).as_bytes())?;
            file.write_all(b"\n")?;
            file.write_all(payload)?;
            file.sync_all()?;

            if !ctx.tags.is_empty() {
                self.link_tags(ctx, &file, &tmp_path);
            }

            // The mtime carries the expiry; it is shared by every tag link
            // since they alias the same inode.
            let expires_at = match ctx.expire {
                Some(secs) => fsx::now_secs().saturating_add(secs),
                None => fsx::FAR_FUTURE_UNIX_SECS,
            };
            fs_prim.set_mtime(&tmp_path, expires_at)?;
            Ok(())
        })();
        drop(file);

        if let Err(err) = write_result {
            fsx::remove_file_best_effort(&tmp_path, "persist.write_failed");
            return Err(err);
        }

        if let Some(parent) = self.path.parent() {
            fsx::ensure_dir(parent)?;
        }
        match fsx::publish(fs_prim, &tmp_path, &self.path) {
            Ok(()) => Ok(()),
            Err(err) => {
                fsx::remove_file_best_effort(&tmp_path, "persist.rename_failed");
                Err(err.into())
            }
        }
    }

    /// Hardlink the staged file into each tag's index directory.
    ///
    /// Best effort: a missing tag link only weakens future invalidation
    /// precision for that one tag, so failures never abort the publish.
    fn link_tags(&self, ctx: &ProducerContext, file: &File, tmp_path: &Path) {
        let fs_prim = self.store.fs();
        let meta = match file.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                tracing::debug!(
                    target = "tagcache",
                    error = %err,
                    "failed to stat staged entry; skipping tag links"
                );
                return;
            }
        };
        let inode = match fs_prim.stat_inode(&meta) {
            Ok(inode) => inode,
            Err(err) => {
                tracing::debug!(
                    target = "tagcache",
                    error = %err,
                    "inode unavailable; skipping tag links"
                );
                return;
            }
        };

        let expected = ctx.tags.len() as u64 + 1;
        let name = addr::link_name(expected, inode);
        let subshard = addr::link_subshard(&name);

        for tag in &ctx.tags {
            let dir = self.store.tag_dir(tag).join(&subshard);
            if let Err(err) = fsx::ensure_dir(&dir) {
                tracing::debug!(
                    target = "tagcache",
                    tag = %tag,
                    error = %err,
                    "failed to create tag index directory; skipping link"
                );
                continue;
            }
            match fs_prim.hardlink(tmp_path, &dir.join(&name)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    tracing::debug!(
                        target = "tagcache",
                        tag = %tag,
                        error = %err,
                        "failed to link entry into tag index"
                    );
                }
            }
        }
    }
}

fn tag_line(tags: &BTreeSet<String>) -> String {
    tags.iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(":")
}
