//! The content-addressed blob table and per-extraction reference tracking.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::archive::Compression;
use crate::tree::DentryIndex;

/// SHA-1 message digest identifying a blob's content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sha1Digest([u8; 20]);

impl Sha1Digest {
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Sha1Digest(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Digest of an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Sha1Digest(hasher.finalize().into())
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Index of a blob in the [`BlobTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobIndex(pub(crate) usize);

/// Where a blob's bytes live.
#[derive(Debug, Clone)]
pub enum BlobLocation {
    /// Inside the archive at the given offset. `compressed_size` covers the
    /// on-wire bytes including chunk framing when `compression` is not
    /// [`Compression::None`].
    InArchive {
        offset: u64,
        compressed_size: u64,
        compression: Compression,
    },
    /// In a file on disk (used for temporary spill files during pipe
    /// extraction, and for not-yet-written blobs during capture).
    InFile(PathBuf),
    /// Fully buffered in memory.
    InMemory(Vec<u8>),
    /// The content is not available. Pipe extraction starts every referenced
    /// blob here until its record arrives.
    Nonexistent,
}

/// One content-addressed blob plus its per-extraction scratch state.
#[derive(Debug, Clone)]
pub struct BlobDescriptor {
    pub digest: Sha1Digest,
    /// Uncompressed size in bytes.
    pub size: u64,
    pub location: BlobLocation,
    /// The blob is stored inside a multi-blob solid pack.
    pub solid: bool,

    // Scratch fields, zeroed at the start of every extraction.
    pub(crate) out_refcnt: u32,
    pub(crate) refs: DentryRefs,
    /// Path of the first materialization, for linked extraction.
    pub(crate) extracted_file: Option<PathBuf>,
}

impl BlobDescriptor {
    pub fn new(digest: Sha1Digest, size: u64, location: BlobLocation) -> Self {
        BlobDescriptor {
            digest,
            size,
            location,
            solid: false,
            out_refcnt: 0,
            refs: DentryRefs::new(),
            extracted_file: None,
        }
    }

    pub(crate) fn reset_scratch(&mut self) {
        self.out_refcnt = 0;
        self.refs.clear();
    }
}

/// How many back-references fit before spilling to the heap.
pub(crate) const INLINE_DENTRY_REFS: usize = 4;

/// Per-blob list of referencing dentries. The common case is a handful of
/// references, kept in an inline buffer; pathological dedup ratios spill to
/// a doubling heap allocation.
#[derive(Debug, Clone)]
pub(crate) enum DentryRefs {
    Inline {
        buf: [DentryIndex; INLINE_DENTRY_REFS],
        len: usize,
    },
    Spilled(Vec<DentryIndex>),
}

impl DentryRefs {
    pub(crate) fn new() -> Self {
        DentryRefs::Inline {
            buf: [DentryIndex(0); INLINE_DENTRY_REFS],
            len: 0,
        }
    }

    pub(crate) fn push(&mut self, dentry: DentryIndex) {
        match self {
            DentryRefs::Inline { buf, len } => {
                if *len < INLINE_DENTRY_REFS {
                    buf[*len] = dentry;
                    *len += 1;
                } else {
                    let mut spilled = Vec::with_capacity(INLINE_DENTRY_REFS * 2);
                    spilled.extend_from_slice(&buf[..]);
                    spilled.push(dentry);
                    *self = DentryRefs::Spilled(spilled);
                }
            }
            DentryRefs::Spilled(vec) => {
                if vec.len() == vec.capacity() {
                    vec.reserve_exact(vec.capacity());
                }
                vec.push(dentry);
            }
        }
    }

    pub(crate) fn as_slice(&self) -> &[DentryIndex] {
        match self {
            DentryRefs::Inline { buf, len } => &buf[..*len],
            DentryRefs::Spilled(vec) => vec.as_slice(),
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = DentryRefs::new();
    }

    pub(crate) fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// Content-addressed table of all blobs known to an archive.
#[derive(Debug, Default)]
pub struct BlobTable {
    blobs: Vec<BlobDescriptor>,
    by_digest: HashMap<Sha1Digest, BlobIndex>,
}

impl BlobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a blob, returning its index. An existing entry with the same
    /// digest is replaced in place (merged split-archive tables do this).
    pub fn insert(&mut self, blob: BlobDescriptor) -> BlobIndex {
        if let Some(&index) = self.by_digest.get(&blob.digest) {
            self.blobs[index.0] = blob;
            return index;
        }
        let index = BlobIndex(self.blobs.len());
        self.by_digest.insert(blob.digest, index);
        self.blobs.push(blob);
        index
    }

    pub fn lookup(&self, digest: &Sha1Digest) -> Option<BlobIndex> {
        self.by_digest.get(digest).copied()
    }

    /// Look up a digest, creating a [`BlobLocation::Nonexistent`] entry when
    /// missing. Pipe extraction resolves streams this way before any content
    /// has arrived.
    pub(crate) fn lookup_or_insert(&mut self, digest: Sha1Digest) -> BlobIndex {
        if let Some(index) = self.lookup(&digest) {
            return index;
        }
        self.insert(BlobDescriptor::new(digest, 0, BlobLocation::Nonexistent))
    }

    pub fn get(&self, index: BlobIndex) -> &BlobDescriptor {
        &self.blobs[index.0]
    }

    pub(crate) fn get_mut(&mut self, index: BlobIndex) -> &mut BlobDescriptor {
        &mut self.blobs[index.0]
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlobDescriptor> {
        self.blobs.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut BlobDescriptor> {
        self.blobs.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_formats_as_hex() {
        let digest = Sha1Digest::of(b"hello");
        assert_eq!(
            digest.to_string(),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
    }

    #[test]
    fn dentry_refs_spill_past_inline_capacity() {
        let mut refs = DentryRefs::new();
        for i in 0..INLINE_DENTRY_REFS {
            refs.push(DentryIndex(i));
            assert!(matches!(refs, DentryRefs::Inline { .. }));
        }
        refs.push(DentryIndex(99));
        assert!(matches!(refs, DentryRefs::Spilled(_)));
        assert_eq!(refs.len(), INLINE_DENTRY_REFS + 1);
        assert_eq!(refs.as_slice()[INLINE_DENTRY_REFS], DentryIndex(99));

        refs.clear();
        assert_eq!(refs.len(), 0);
        assert!(matches!(refs, DentryRefs::Inline { .. }));
    }

    #[test]
    fn table_replaces_on_duplicate_digest() {
        let mut table = BlobTable::new();
        let digest = Sha1Digest::of(b"data");
        let a = table.insert(BlobDescriptor::new(
            digest,
            4,
            BlobLocation::Nonexistent,
        ));
        let b = table.insert(BlobDescriptor::new(
            digest,
            4,
            BlobLocation::InMemory(b"data".to_vec()),
        ));
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        assert!(matches!(table.get(a).location, BlobLocation::InMemory(_)));
    }

    #[test]
    fn lookup_or_insert_creates_nonexistent_entries() {
        let mut table = BlobTable::new();
        let digest = Sha1Digest::of(b"missing");
        let index = table.lookup_or_insert(digest);
        assert!(matches!(
            table.get(index).location,
            BlobLocation::Nonexistent
        ));
        assert_eq!(table.lookup_or_insert(digest), index);
        assert_eq!(table.len(), 1);
    }
}
