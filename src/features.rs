//! Tallying the features an image needs against what a backend provides.

use tracing::warn;

use crate::backend::BackendCaps;
use crate::error::{ExtractError, Result};
use crate::flags::ExtractFlags;
use crate::tree::{DentryIndex, FileAttributes, Image};

bitflags::bitflags! {
    /// Feature categories a backend can advertise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FeatureFlags: u32 {
        const ARCHIVE_FILES = 1 << 0;
        const HIDDEN_FILES = 1 << 1;
        const SYSTEM_FILES = 1 << 2;
        const COMPRESSED_FILES = 1 << 3;
        const ENCRYPTED_FILES = 1 << 4;
        const NOT_CONTENT_INDEXED = 1 << 5;
        const SPARSE_FILES = 1 << 6;
        const NAMED_DATA_STREAMS = 1 << 7;
        const HARD_LINKS = 1 << 8;
        const REPARSE_POINTS = 1 << 9;
        const SYMLINK_REPARSE_POINTS = 1 << 10;
        const SECURITY_DESCRIPTORS = 1 << 11;
        const SHORT_NAMES = 1 << 12;
        const UNIX_DATA = 1 << 13;
    }
}

/// Per-category counts of what one image tree actually uses.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeatureCounts {
    pub archive_files: u64,
    pub hidden_files: u64,
    pub system_files: u64,
    pub compressed_files: u64,
    pub encrypted_files: u64,
    pub not_content_indexed_files: u64,
    pub sparse_files: u64,
    pub named_data_streams: u64,
    pub hard_links: u64,
    pub reparse_points: u64,
    pub symlink_reparse_points: u64,
    pub other_reparse_points: u64,
    pub security_descriptors: u64,
    pub short_names: u64,
    pub unix_data: u64,
}

/// Walk the tree under `root` and count required features. Inodes are
/// counted once; additional dentries for the same inode count as hardlinks.
pub(crate) fn tally(image: &mut Image, root: DentryIndex) -> FeatureCounts {
    let mut counts = FeatureCounts::default();
    let order: Vec<DentryIndex> = image.preorder(root).collect();

    for &dentry in &order {
        let short_name_present = !image.dentry(dentry).short_name.is_empty();
        let inode = image.inode_of_mut(dentry);

        if inode.attributes.contains(FileAttributes::ARCHIVE) {
            counts.archive_files += 1;
        }
        if inode.attributes.contains(FileAttributes::HIDDEN) {
            counts.hidden_files += 1;
        }
        if inode.attributes.contains(FileAttributes::SYSTEM) {
            counts.system_files += 1;
        }
        if inode.attributes.contains(FileAttributes::COMPRESSED) {
            counts.compressed_files += 1;
        }
        if inode.attributes.contains(FileAttributes::ENCRYPTED) {
            counts.encrypted_files += 1;
        }
        if inode
            .attributes
            .contains(FileAttributes::NOT_CONTENT_INDEXED)
        {
            counts.not_content_indexed_files += 1;
        }
        if inode.attributes.contains(FileAttributes::SPARSE_FILE) {
            counts.sparse_files += 1;
        }
        if inode.has_named_stream() {
            counts.named_data_streams += 1;
        }
        if inode.visited {
            counts.hard_links += 1;
        }
        if inode.is_reparse_point() {
            counts.reparse_points += 1;
            if inode.is_symlink() {
                counts.symlink_reparse_points += 1;
            } else {
                counts.other_reparse_points += 1;
            }
        }
        if inode.security_id.is_some() {
            counts.security_descriptors += 1;
        }
        if short_name_present {
            counts.short_names += 1;
        }
        if inode.unix_data.is_some() {
            counts.unix_data += 1;
        }
        inode.visited = true;
    }

    for &dentry in &order {
        image.inode_of_mut(dentry).visited = false;
    }
    counts
}

/// Compare required features against the backend. Most mismatches demote to
/// warnings and the unsupported data is stripped; the strict combinations
/// from the flag set are hard [`ExtractError::Unsupported`] errors.
pub(crate) fn check(
    required: &FeatureCounts,
    caps: &BackendCaps,
    flags: ExtractFlags,
) -> Result<()> {
    let supported = caps.supported;

    if required.archive_files > 0 && !supported.contains(FeatureFlags::ARCHIVE_FILES) {
        warn!(
            count = required.archive_files,
            "files are marked as archived, but this attribute is not supported \
             in this extraction mode or volume"
        );
    }
    if required.hidden_files > 0 && !supported.contains(FeatureFlags::HIDDEN_FILES) {
        warn!(
            count = required.hidden_files,
            "files are marked as hidden, but this attribute is not supported \
             in this extraction mode or volume"
        );
    }
    if required.system_files > 0 && !supported.contains(FeatureFlags::SYSTEM_FILES) {
        warn!(
            count = required.system_files,
            "files are marked as system files, but this attribute is not \
             supported in this extraction mode or volume"
        );
    }
    if required.compressed_files > 0 && !supported.contains(FeatureFlags::COMPRESSED_FILES) {
        warn!(
            count = required.compressed_files,
            "files are marked as transparently compressed, but transparent \
             compression is not supported in this extraction mode or volume; \
             extracting as uncompressed"
        );
    }
    if required.encrypted_files > 0 && !supported.contains(FeatureFlags::ENCRYPTED_FILES) {
        warn!(
            count = required.encrypted_files,
            "files are marked as encrypted, but encryption is not supported \
             in this extraction mode or volume; extracting raw data instead"
        );
    }
    if required.not_content_indexed_files > 0
        && !supported.contains(FeatureFlags::NOT_CONTENT_INDEXED)
    {
        warn!(
            count = required.not_content_indexed_files,
            "files are marked as not content indexed, but this attribute is \
             not supported in this extraction mode or volume"
        );
    }
    if required.sparse_files > 0 && !supported.contains(FeatureFlags::SPARSE_FILES) {
        warn!(
            count = required.sparse_files,
            "files are marked as sparse, but creating sparse files is not \
             supported in this extraction mode or volume; extracting as \
             non-sparse"
        );
    }
    if required.named_data_streams > 0 {
        if !supported.contains(FeatureFlags::NAMED_DATA_STREAMS) {
            warn!(
                count = required.named_data_streams,
                "files contain alternate (named) data streams, which are not \
                 supported in this extraction mode or volume and will not be \
                 extracted"
            );
        } else if flags.is_linked() {
            warn!(
                count = required.named_data_streams,
                "files contain alternate (named) data streams, which are not \
                 supported in linked extraction mode and will not be extracted"
            );
        }
    }
    if required.hard_links > 0 && !supported.contains(FeatureFlags::HARD_LINKS) {
        warn!(
            count = required.hard_links,
            "files are hard links, which are not supported in this extraction \
             mode or volume; extracting as duplicate copies"
        );
    }
    if required.reparse_points > 0 && !supported.contains(FeatureFlags::REPARSE_POINTS) {
        if supported.contains(FeatureFlags::SYMLINK_REPARSE_POINTS) {
            if required.other_reparse_points > 0 {
                warn!(
                    count = required.other_reparse_points,
                    "files are reparse points that are neither symbolic links \
                     nor junctions and are not supported in this extraction \
                     mode or volume; they will not be extracted"
                );
            }
        } else {
            warn!(
                count = required.reparse_points,
                "files are reparse points, which are not supported in this \
                 extraction mode or volume and will not be extracted"
            );
        }
    }
    if required.security_descriptors > 0
        && !supported.contains(FeatureFlags::SECURITY_DESCRIPTORS)
    {
        warn!(
            count = required.security_descriptors,
            "files have Windows NT security descriptors, which are not \
             supported in this extraction mode or volume and will not be \
             extracted"
        );
    }
    if required.short_names > 0 && !supported.contains(FeatureFlags::SHORT_NAMES) {
        warn!(
            count = required.short_names,
            "files have short (DOS) names, which are not supported in this \
             extraction mode or volume and will not be extracted"
        );
    }

    if flags.contains(ExtractFlags::UNIX_DATA)
        && required.unix_data > 0
        && !supported.contains(FeatureFlags::UNIX_DATA)
    {
        return Err(ExtractError::Unsupported(format!(
            "UNIX data is not supported in the {} extraction mode",
            caps.name
        )));
    }
    if flags.contains(ExtractFlags::STRICT_SHORT_NAMES)
        && required.short_names > 0
        && !supported.contains(FeatureFlags::SHORT_NAMES)
    {
        return Err(ExtractError::Unsupported(format!(
            "short names are not supported in the {} extraction mode",
            caps.name
        )));
    }
    if flags.contains(ExtractFlags::STRICT_TIMESTAMPS) && !caps.has_set_timestamps {
        return Err(ExtractError::Unsupported(format!(
            "timestamps are not supported in the {} extraction mode",
            caps.name
        )));
    }
    if flags.contains(ExtractFlags::STRICT_ACLS)
        && !flags.contains(ExtractFlags::UNIX_DATA)
        && required.security_descriptors > 0
        && !supported.contains(FeatureFlags::SECURITY_DESCRIPTORS)
    {
        return Err(ExtractError::Unsupported(format!(
            "security descriptors are not supported in the {} extraction mode",
            caps.name
        )));
    }
    if flags.contains(ExtractFlags::HARDLINK) && !supported.contains(FeatureFlags::HARD_LINKS) {
        return Err(ExtractError::Unsupported(format!(
            "hard link extraction mode requested, but the {} extraction mode \
             does not support hard links",
            caps.name
        )));
    }
    if flags.contains(ExtractFlags::SYMLINK)
        && !supported.contains(FeatureFlags::SYMLINK_REPARSE_POINTS)
    {
        return Err(ExtractError::Unsupported(format!(
            "symbolic link extraction mode requested, but the {} extraction \
             mode does not support symbolic links",
            caps.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendCaps;
    use crate::tree::{Inode, NamedStream};

    fn caps_with(supported: FeatureFlags) -> BackendCaps {
        BackendCaps {
            supported,
            ..BackendCaps::posix_defaults("test")
        }
    }

    #[test]
    fn tally_counts_hardlinks_once_per_extra_dentry() {
        let mut image = Image::new(1, "test");
        let root = image.root();
        let inode = image.add_inode(Inode::file(None));
        image.add_dentry(root, "x", inode);
        let sub = image.add_child(root, "y", Inode::directory());
        image.add_dentry(sub, "x", inode);

        let counts = tally(&mut image, root);
        assert_eq!(counts.hard_links, 1);
        // The visited marker must be cleared again afterwards.
        assert!(!image.inode(inode).visited);
    }

    #[test]
    fn tally_separates_symlink_and_other_reparse_points() {
        let mut image = Image::new(1, "test");
        let root = image.root();
        image.add_child(root, "link", Inode::symlink());
        let mut junction = Inode::symlink();
        junction.reparse_tag = 0xa000_0123;
        image.add_child(root, "other", junction);

        let counts = tally(&mut image, root);
        assert_eq!(counts.reparse_points, 2);
        assert_eq!(counts.symlink_reparse_points, 1);
        assert_eq!(counts.other_reparse_points, 1);
    }

    #[test]
    fn tally_counts_named_streams_per_inode() {
        let mut image = Image::new(1, "test");
        let root = image.root();
        let mut inode = Inode::file(None);
        inode.named_streams.push(NamedStream::new("ads", None));
        inode.named_streams.push(NamedStream::new("more", None));
        image.add_child(root, "f", inode);

        let counts = tally(&mut image, root);
        assert_eq!(counts.named_data_streams, 1);
    }

    #[test]
    fn strict_acls_without_descriptor_support_is_fatal() {
        let required = FeatureCounts {
            security_descriptors: 1,
            ..Default::default()
        };
        let err = check(
            &required,
            &caps_with(FeatureFlags::empty()),
            ExtractFlags::STRICT_ACLS,
        )
        .unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));

        // UNIX_DATA takes the descriptor path out of the equation.
        assert!(check(
            &required,
            &caps_with(FeatureFlags::UNIX_DATA),
            ExtractFlags::STRICT_ACLS | ExtractFlags::UNIX_DATA,
        )
        .is_ok());
    }

    #[test]
    fn link_modes_require_backend_support() {
        let required = FeatureCounts::default();
        assert!(check(
            &required,
            &caps_with(FeatureFlags::empty()),
            ExtractFlags::HARDLINK
        )
        .is_err());
        assert!(check(
            &required,
            &caps_with(FeatureFlags::empty()),
            ExtractFlags::SYMLINK
        )
        .is_err());
        assert!(check(
            &required,
            &caps_with(FeatureFlags::HARD_LINKS | FeatureFlags::SYMLINK_REPARSE_POINTS),
            ExtractFlags::HARDLINK
        )
        .is_ok());
    }

    #[test]
    fn unsupported_attribute_bits_only_warn() {
        let required = FeatureCounts {
            archive_files: 3,
            sparse_files: 2,
            short_names: 1,
            ..Default::default()
        };
        assert!(check(
            &required,
            &caps_with(FeatureFlags::empty()),
            ExtractFlags::empty()
        )
        .is_ok());
    }
}
