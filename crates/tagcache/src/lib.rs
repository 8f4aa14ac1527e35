//! Filesystem-backed, tag-indexed cache with lazy hardlink-based
//! invalidation.
//!
//! Maps opaque keys to serialized artifacts stored one-per-file, with:
//! - zero or more tags per entry; invalidating a tag is one recursive
//!   directory removal, whatever the number of member entries;
//! - staleness detection from directory entries alone (no index database):
//!   the file mtime doubles as the expiry instant and the hardlink count
//!   doubles as a tag-liveness signal;
//! - at-most-one regenerator per key via a non-blocking advisory lock, with
//!   contending readers falling back to the stale value instead of blocking;
//! - atomic publication (staging file + rename): readers see either the old
//!   complete file or the new one, never a mix.
//!
//! ## On-disk layout (inventory)
//!
//! - `<root>/data/<d0..2>/<d2..4>/k:<hex(key)>` — entry files. Line 1 is the
//!   `:`-joined tag list (possibly empty), the rest is serializer output.
//!   mtime = expiry instant (far-future sentinel when the entry never
//!   expires). A fresh entry carries `1 + |tags|` hardlinks.
//! - `<root>/data/<d0..2>/<d2..4>/t:<hex(tag)>/<sub>/<links>:<inode>` — tag
//!   links, hardlinked to the entry file's inode. The filename records the
//!   link count the inode had at publish time; drift from the live count
//!   means some sibling tag was invalidated since.
//! - `<root>/tmp/` — staging files and invalidated tag trees awaiting
//!   deletion; never read by any consumer.
//!
//! Tags deliberately have no reverse index: that is what makes
//! [`Store::invalidate_tag`] O(1)-ish. The price is that [`Store::cleanup`]
//! walks the whole shard tree, O(total files) rather than O(dirty files) — a
//! known scalability ceiling for very large caches.

mod addr;
mod entry;
mod error;
mod fsx;
mod serialize;
mod store;

pub use addr::{sha256_128, DigestFn};
pub use entry::{Entry, EntryBuilder, ProducerContext};
pub use error::{CacheError, Result};
pub use fsx::{now_secs, FsPrimitives, StdFs, FAR_FUTURE_UNIX_SECS};
pub use serialize::{BincodeSerializer, JsonSerializer, Serializer, PAYLOAD_LIMIT_BYTES};
pub use store::{configure, shared, CleanupStats, Store, StoreOptions};
