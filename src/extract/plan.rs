//! Blob reference planning: resolving streams to blob descriptors and
//! building the list of blobs this extraction will read.

use tracing::trace;

use crate::blob::BlobIndex;
use crate::features::FeatureFlags;
use crate::flags::ExtractFlags;
use crate::tree::DentryIndex;

use super::ExtractContext;

/// Resolve every stream of every non-skipped dentry to a blob index and
/// zero the per-extraction reference counts.
///
/// When extracting from a pipe the blob table is initially empty; streams
/// are still tracked by digest, so missing entries are force-created as
/// `Nonexistent` and filled in when their records arrive. On seekable
/// archives an unknown digest leaves the stream unresolved and it is
/// silently skipped.
pub(crate) fn resolve_streams(ctx: &mut ExtractContext<'_, '_>) {
    let from_pipe = ctx.flags.contains(ExtractFlags::FROM_PIPE);
    let order: Vec<DentryIndex> = ctx.image.preorder(ctx.root).collect();

    for dentry in order {
        if ctx.image.dentry(dentry).skipped {
            continue;
        }
        let inode_index = ctx.image.dentry(dentry).inode;

        let unnamed_digest = ctx.image.inode(inode_index).unnamed_stream;
        let resolved = unnamed_digest.and_then(|digest| {
            if from_pipe {
                Some(ctx.archive.blobs.lookup_or_insert(digest))
            } else {
                ctx.archive.blobs.lookup(&digest)
            }
        });
        if let Some(blob) = resolved {
            ctx.archive.blobs.get_mut(blob).reset_scratch();
        }
        ctx.image.inode_mut(inode_index).unnamed_blob = resolved;

        for i in 0..ctx.image.inode(inode_index).named_streams.len() {
            let digest = ctx.image.inode(inode_index).named_streams[i].digest;
            let resolved = digest.and_then(|digest| {
                if from_pipe {
                    Some(ctx.archive.blobs.lookup_or_insert(digest))
                } else {
                    ctx.archive.blobs.lookup(&digest)
                }
            });
            if let Some(blob) = resolved {
                ctx.archive.blobs.get_mut(blob).reset_scratch();
            }
            ctx.image.inode_mut(inode_index).named_streams[i].blob = resolved;
        }
    }
}

/// Walk the tree and build reference counts, the extraction list, and (for
/// sequential strategies) the per-blob dentry back-references.
pub(crate) fn plan_streams(ctx: &mut ExtractContext<'_, '_>) {
    let sequential = ctx
        .flags
        .intersects(ExtractFlags::SEQUENTIAL | ExtractFlags::FROM_PIPE);
    let hardlinks_supported = ctx.caps.supported.contains(FeatureFlags::HARD_LINKS);
    let order: Vec<DentryIndex> = ctx.image.preorder(ctx.root).collect();

    for dentry in order {
        if ctx.image.dentry(dentry).skipped {
            continue;
        }
        let inode_index = ctx.image.dentry(dentry).inode;
        let inode = ctx.image.inode(inode_index);

        // Additional hardlinks contribute no new stream instances when the
        // backend can link them to the first copy.
        if inode.visited && hardlinks_supported {
            continue;
        }

        let mut blobs: Vec<BlobIndex> = Vec::new();
        // The unnamed stream is always extracted, except for encrypted
        // directories whose "content" is key material we cannot restore.
        if !inode.is_encrypted_directory() {
            if let Some(blob) = inode.unnamed_blob {
                blobs.push(blob);
            }
        }
        if ctx.can_extract_named_streams() {
            blobs.extend(
                inode
                    .named_streams
                    .iter()
                    .filter_map(|stream| stream.blob),
            );
        }

        for blob in blobs {
            ref_stream(ctx, blob, dentry, sequential);
        }
        ctx.image.inode_mut(inode_index).visited = true;
    }

    trace!(
        streams = ctx.num_streams_remaining,
        total_bytes = ctx.progress.total_bytes,
        "extraction planned"
    );
}

fn ref_stream(
    ctx: &mut ExtractContext<'_, '_>,
    blob_index: BlobIndex,
    dentry: DentryIndex,
    sequential: bool,
) {
    let linked = ctx.flags.is_linked();
    let blob = ctx.archive.blobs.get_mut(blob_index);

    // In linked mode each blob materializes once across the whole
    // multi-image run; otherwise every instance is written out.
    if !linked || (blob.out_refcnt == 0 && blob.extracted_file.is_none()) {
        ctx.progress.total_bytes += blob.size;
        ctx.progress.num_streams += 1;
    }

    if blob.out_refcnt == 0 {
        ctx.extraction_list.push(blob_index);
        ctx.num_streams_remaining += 1;
    }

    if sequential {
        blob.refs.push(dentry);
    }
    blob.out_refcnt += 1;
}
