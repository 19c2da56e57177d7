//! Engine for applying (extracting) images from WIM archives.
//!
//! A WIM archive stores one or more named filesystem trees ("images") over
//! a single content-addressed blob store. This crate implements the part
//! that turns a selected image back into files: use an [`Archive`] handle
//! with [`Archive::extract_image`] (or the `_with` variants to supply a
//! specific [`Backend`] and a progress callback), and
//! [`Archive::extract_image_from_pipe`] for forward-only sources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

pub mod archive;
pub mod backend;
pub mod blob;
mod error;
mod extract;
pub mod features;
mod flags;
mod names;
pub mod pipe;
pub mod progress;
pub mod reparse;
pub mod security;
mod time;
pub mod tree;

pub use archive::{
    Archive, Compression, Decompressor, DecompressorFactory, Source, ALL_IMAGES,
    DEFAULT_CHUNK_SIZE,
};
#[cfg(unix)]
pub use backend::UnixBackend;
pub use backend::{Backend, BackendCaps};
pub use blob::{BlobDescriptor, BlobIndex, BlobLocation, BlobTable, Sha1Digest};
pub use error::{ExtractError, Result};
pub use features::{FeatureCounts, FeatureFlags};
pub use flags::ExtractFlags;
pub use progress::{ExtractProgress, ProgressAction, ProgressEvent, ProgressHandler};
pub use security::SecurityTable;
pub use time::WimTimestamp;
pub use tree::{
    Dentry, DentryIndex, FileAttributes, Image, Inode, InodeIndex, NamedStream, UnixData,
};

static INIT: Once = Once::new();
static DEFAULT_IGNORE_CASE: AtomicBool = AtomicBool::new(false);

/// Process-wide one-shot initialization.
///
/// Installs the platform default for case sensitivity of in-image path
/// lookups. Safe to call any number of times; only the first does work.
/// The extraction entry points call this lazily.
pub fn init() {
    INIT.call_once(|| {
        DEFAULT_IGNORE_CASE.store(cfg!(windows), Ordering::Relaxed);
    });
}

/// Override the case sensitivity used by [`Image::lookup_path`].
pub fn set_default_ignore_case(ignore_case: bool) {
    init();
    DEFAULT_IGNORE_CASE.store(ignore_case, Ordering::Relaxed);
}

pub(crate) fn default_ignore_case() -> bool {
    DEFAULT_IGNORE_CASE.load(Ordering::Relaxed)
}
