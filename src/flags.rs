use std::path::Path;

use tracing::warn;

use crate::error::{ExtractError, Result};

bitflags::bitflags! {
    /// Extraction behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExtractFlags: u32 {
        /// The target is an NTFS volume written through an NTFS-library
        /// backend rather than a mounted directory tree.
        const NTFS = 1 << 0;
        /// Materialize links to already-extracted identical content as
        /// hardlinks. Mutually exclusive with `SYMLINK`.
        const HARDLINK = 1 << 1;
        /// Materialize links to already-extracted identical content as
        /// relative symlinks. Mutually exclusive with `HARDLINK`.
        const SYMLINK = 1 << 2;
        /// Extract POSIX owner/group/mode data instead of Windows security
        /// descriptors.
        const UNIX_DATA = 1 << 5;
        /// Do not restore security descriptors at all.
        const NO_ACLS = 1 << 6;
        /// Fail instead of warning when a security descriptor cannot be
        /// restored exactly.
        const STRICT_ACLS = 1 << 7;
        /// Two-pass extraction with blobs sorted by their archive offset.
        const SEQUENTIAL = 1 << 8;
        /// Rewrite absolute symlink targets to point into the extraction
        /// target. Mutually exclusive with `NORPFIX`.
        const RPFIX = 1 << 9;
        /// Never rewrite absolute symlink targets.
        const NORPFIX = 1 << 10;
        /// Write the selected file's unnamed stream to standard output.
        const TO_STDOUT = 1 << 11;
        /// Substitute invalid filename characters instead of skipping the
        /// affected subtree.
        const REPLACE_INVALID_FILENAMES = 1 << 12;
        /// Extract dummy names for all case-insensitive filename collisions
        /// instead of skipping the colliding entries.
        const ALL_CASE_CONFLICTS = 1 << 13;
        /// Fail instead of warning when a short (DOS) name cannot be set.
        const STRICT_SHORT_NAMES = 1 << 14;
        /// Fail instead of warning when timestamps cannot be applied.
        const STRICT_TIMESTAMPS = 1 << 15;
        /// Fail instead of warning when a symlink or its reparse fixup
        /// cannot be applied.
        const STRICT_SYMLINKS = 1 << 16;

        #[doc(hidden)]
        const FROM_PIPE = 1 << 30;
        #[doc(hidden)]
        const MULTI_IMAGE = 1 << 31;
    }
}

/// Bits callers are allowed to pass in; the internal bits are masked off.
pub(crate) const PUBLIC_MASK: u32 = 0x3fff_ffff;

impl ExtractFlags {
    pub(crate) fn is_linked(self) -> bool {
        self.intersects(ExtractFlags::HARDLINK | ExtractFlags::SYMLINK)
    }

    /// Validate a flag combination for one extraction command and fill in
    /// defaults. `header_rpfix` is the archive header's fixup bit and
    /// `full_image` is whether a whole image (not a subtree) is extracted.
    pub(crate) fn validate(
        mut self,
        target: &Path,
        header_rpfix: bool,
        full_image: bool,
    ) -> Result<Self> {
        if target.as_os_str().is_empty() {
            return Err(ExtractError::InvalidParam("empty extraction target"));
        }

        if self.contains(ExtractFlags::HARDLINK | ExtractFlags::SYMLINK) {
            return Err(ExtractError::InvalidParam(
                "HARDLINK and SYMLINK are mutually exclusive",
            ));
        }
        if self.contains(ExtractFlags::NO_ACLS | ExtractFlags::STRICT_ACLS) {
            return Err(ExtractError::InvalidParam(
                "NO_ACLS and STRICT_ACLS are mutually exclusive",
            ));
        }
        if self.contains(ExtractFlags::RPFIX | ExtractFlags::NORPFIX) {
            return Err(ExtractError::InvalidParam(
                "RPFIX and NORPFIX are mutually exclusive",
            ));
        }

        // Fixups default to on when the archive was captured with them and a
        // full image is being applied.
        if !self.intersects(ExtractFlags::RPFIX | ExtractFlags::NORPFIX)
            && header_rpfix
            && full_image
        {
            self |= ExtractFlags::RPFIX;
        }

        // UNIX data entries are stored in file resources, so in a strictly
        // sequential read they may precede the symlink they describe.
        if self.contains(ExtractFlags::UNIX_DATA | ExtractFlags::SEQUENTIAL) {
            if self.contains(ExtractFlags::FROM_PIPE) {
                warn!(
                    "setting UNIX owner/group may be impossible on some \
                     symbolic links when applying from a pipe"
                );
            } else {
                self.remove(ExtractFlags::SEQUENTIAL);
                warn!("disabling sequential extraction for UNIX data mode");
            }
        }

        Ok(self)
    }
}
