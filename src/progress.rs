//! Progress reporting for extraction.

use std::path::PathBuf;

/// Snapshot of extraction progress handed to the callback.
#[derive(Debug, Clone, Default)]
pub struct ExtractProgress {
    /// 1-based index of the image being extracted.
    pub image: u32,
    pub image_name: String,
    /// Path inside the image being extracted; empty for a full image.
    pub source_path: String,
    pub target: PathBuf,
    /// Total uncompressed bytes expected across all stream instances.
    pub total_bytes: u64,
    pub completed_bytes: u64,
    /// Number of stream instances to be written.
    pub num_streams: u64,
    /// Path of the entry currently being created, for `Dentry` events.
    pub current_path: Option<PathBuf>,
}

/// Returned from the progress callback; `Abort` unwinds the extraction with
/// [`ExtractError::Aborted`](crate::ExtractError::Aborted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressAction {
    Continue,
    Abort,
}

/// The points in an extraction at which the callback fires.
#[derive(Debug)]
pub enum ProgressEvent<'a> {
    /// A subtree extraction is starting.
    TreeBegin(&'a ExtractProgress),
    /// A full-image extraction is starting.
    ImageBegin(&'a ExtractProgress),
    DirStructureBegin(&'a ExtractProgress),
    /// One directory entry was created.
    Dentry(&'a ExtractProgress),
    DirStructureEnd(&'a ExtractProgress),
    /// Fired as `completed_bytes` crosses each 1/128th of `total_bytes`.
    Streams(&'a ExtractProgress),
    /// Metadata finalization (timestamps last) is starting.
    ApplyTimestamps(&'a ExtractProgress),
    TreeEnd(&'a ExtractProgress),
    ImageEnd(&'a ExtractProgress),
}

impl ProgressEvent<'_> {
    pub fn info(&self) -> &ExtractProgress {
        match self {
            ProgressEvent::TreeBegin(info)
            | ProgressEvent::ImageBegin(info)
            | ProgressEvent::DirStructureBegin(info)
            | ProgressEvent::Dentry(info)
            | ProgressEvent::DirStructureEnd(info)
            | ProgressEvent::Streams(info)
            | ProgressEvent::ApplyTimestamps(info)
            | ProgressEvent::TreeEnd(info)
            | ProgressEvent::ImageEnd(info) => info,
        }
    }
}

/// Callback type accepted by the extraction entry points.
pub type ProgressHandler<'a> = dyn FnMut(ProgressEvent<'_>) -> ProgressAction + 'a;
