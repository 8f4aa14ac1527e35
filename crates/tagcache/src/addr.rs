//! Deterministic mapping from logical names to sharded paths under `data/`.
//!
//! Names are hex-encoded (so raw keys can never smuggle path-hostile bytes
//! into a file name) and prefixed with their namespace, then sharded two
//! levels deep by a digest of the prefixed name. Lookup is O(1): no directory
//! scans, ever.

use crate::error::{CacheError, Result};
use sha2::{Digest as _, Sha256};
use std::path::PathBuf;

/// Digest used to shard names across `data/`.
///
/// Needs good distribution, not cryptographic strength; 128 bits keeps
/// accidental collisions out of reach. Pluggable so existing cache trees
/// built with a different digest stay readable.
pub type DigestFn = fn(&[u8]) -> [u8; 16];

/// Default digest: SHA-256 truncated to its first 16 bytes.
pub fn sha256_128(bytes: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(bytes);
    let mut out = [0_u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Reserved path namespaces under `data/`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Namespace {
    /// Entry files (`k:<hex(key)>`).
    Key,
    /// Tag index directories (`t:<hex(tag)>`).
    Tag,
}

impl Namespace {
    fn prefix(self) -> &'static str {
        match self {
            Namespace::Key => "k",
            Namespace::Tag => "t",
        }
    }
}

/// Compute the `data/`-relative path for `name` in `namespace`.
///
/// Pure and side-effect free; callers create parent directories lazily
/// before the first write.
pub(crate) fn rel_path(digest: DigestFn, namespace: Namespace, name: &str) -> PathBuf {
    let prefixed = format!("{}:{}", namespace.prefix(), hex::encode(name.as_bytes()));
    let shard = hex::encode(digest(prefixed.as_bytes()));
    PathBuf::from(&shard[0..2]).join(&shard[2..4]).join(prefixed)
}

/// Reject malformed keys/tags before any filesystem interaction.
pub(crate) fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'@'));
    if ok {
        Ok(())
    } else {
        Err(CacheError::InvalidName {
            kind,
            name: name.to_owned(),
        })
    }
}

/// File name for a tag link: the link count the target inode is expected to
/// have while the entry and all its tag links are alive.
pub(crate) fn link_name(expected_links: u64, inode: u64) -> String {
    format!("{expected_links}:{inode}")
}

pub(crate) fn parse_link_name(name: &str) -> Option<(u64, u64)> {
    let (links, inode) = name.split_once(':')?;
    Some((links.parse().ok()?, inode.parse().ok()?))
}

/// Subshard directory for a tag link: the last two hex chars of the encoded
/// link name, spreading links over at most 256 directories per tag.
pub(crate) fn link_subshard(name: &str) -> String {
    let encoded = hex::encode(name.as_bytes());
    encoded[encoded.len() - 2..].to_string()
}
