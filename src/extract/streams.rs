//! Second pass (or the combined pass): streaming blob content to every
//! referencing path.

use std::io::{self, Write};
use std::path::Path;

use tracing::{debug, trace, warn};

use crate::archive::BlobReadSpec;
use crate::blob::BlobIndex;
use crate::error::{ExtractError, Result};
use crate::features::FeatureFlags;
use crate::pipe;
use crate::reparse::{self, REPARSE_POINT_MAX_SIZE};
use crate::tree::{DentryIndex, FileAttributes};

use super::ExtractContext;

/// Extract streams to one path.
///
/// With `filter == None`, the unnamed stream and (when supported) all named
/// streams are written. With `filter == Some(blob)`, only instances of that
/// blob are written, reading from `override_spec` when given; sequential and
/// pipe extraction use this to fan one read out to many paths.
pub(crate) fn extract_streams(
    ctx: &mut ExtractContext<'_, '_>,
    dentry: DentryIndex,
    path: &Path,
    filter: Option<BlobIndex>,
    override_spec: Option<&BlobReadSpec>,
) -> Result<()> {
    if ctx.image.dentry(dentry).was_hardlinked {
        return Ok(());
    }
    let inode_index = ctx.image.dentry(dentry).inode;
    let attributes = ctx.image.inode(inode_index).attributes;

    // Unnamed data stream.
    if let Some(blob_index) = ctx.image.inode(inode_index).unnamed_blob {
        if filter.is_none() || filter == Some(blob_index) {
            let spec = match override_spec {
                Some(spec) => Some(spec.clone()),
                None => BlobReadSpec::for_blob(ctx.archive.blobs.get(blob_index)),
            };
            match spec {
                None => warn!(
                    path = %path.display(),
                    digest = %ctx.archive.blobs.get(blob_index).digest,
                    "blob content is not available; stream not extracted"
                ),
                Some(spec) => {
                    let size = ctx.archive.blobs.get(blob_index).size;
                    if !attributes
                        .intersects(FileAttributes::DIRECTORY | FileAttributes::REPARSE_POINT)
                    {
                        write_content_stream(ctx, path, &spec, size, attributes)?;
                        ctx.update_stream_progress(size)?;
                    } else if attributes.contains(FileAttributes::REPARSE_POINT) {
                        capture_reparse_data(ctx, dentry, &spec, size)?;
                        ctx.update_stream_progress(size)?;
                    }
                }
            }
        }
    }

    // Named data streams.
    if ctx.can_extract_named_streams() {
        for i in 0..ctx.image.inode(inode_index).named_streams.len() {
            let stream = &ctx.image.inode(inode_index).named_streams[i];
            let Some(blob_index) = stream.blob else {
                continue;
            };
            if let Some(filter) = filter {
                if filter != blob_index {
                    continue;
                }
            }
            let name = stream.name.clone();
            let spec = match override_spec {
                Some(spec) => Some(spec.clone()),
                None => BlobReadSpec::for_blob(ctx.archive.blobs.get(blob_index)),
            };
            let Some(spec) = spec else {
                warn!(
                    path = %path.display(),
                    stream = %name,
                    "blob content is not available; named stream not extracted"
                );
                continue;
            };
            let size = ctx.archive.blobs.get(blob_index).size;
            let mut reader = ctx.archive.open_blob(&spec, size)?;
            let result = ctx
                .backend
                .write_named_stream(path, &name, Some((&mut reader, size)));
            drop(reader);
            result.map_err(|err| ExtractError::Write(err, path.to_path_buf()))?;
            ctx.update_stream_progress(size)?;
        }
    }
    Ok(())
}

fn write_content_stream(
    ctx: &mut ExtractContext<'_, '_>,
    path: &Path,
    spec: &BlobReadSpec,
    size: u64,
    attributes: FileAttributes,
) -> Result<()> {
    trace!(path = %path.display(), size, "extracting stream");
    let encrypted = attributes.contains(FileAttributes::ENCRYPTED)
        && ctx.caps.supported.contains(FeatureFlags::ENCRYPTED_FILES);
    let mut reader = ctx.archive.open_blob(spec, size)?;
    let result = if encrypted {
        ctx.backend.write_encrypted_stream(path, &mut reader, size)
    } else {
        ctx.backend.write_unnamed_stream(path, &mut reader, size)
    };
    drop(reader);
    result.map_err(|err| ExtractError::Write(err, path.to_path_buf()))
}

/// Buffer a reparse point's data on the inode so the finalizer can apply it
/// after the source (possibly a pipe) has moved past the blob.
fn capture_reparse_data(
    ctx: &mut ExtractContext<'_, '_>,
    dentry: DentryIndex,
    spec: &BlobReadSpec,
    size: u64,
) -> Result<()> {
    let inode_index = ctx.image.dentry(dentry).inode;
    if ctx.image.inode(inode_index).reparse_buf.is_some() {
        return Ok(());
    }
    if size as usize + 8 > REPARSE_POINT_MAX_SIZE {
        return Err(ExtractError::Read(io::Error::new(
            io::ErrorKind::InvalidData,
            "reparse data exceeds the maximum reparse point size",
        )));
    }
    let mut data = Vec::with_capacity(size as usize);
    ctx.archive.read_blob_to(spec, size, &mut data)?;
    let tag = ctx.image.inode(inode_index).reparse_tag;
    ctx.image.inode_mut(inode_index).reparse_buf =
        Some(reparse::assemble_buffer(tag, &data));
    Ok(())
}

/// Sequential strategy: extract each blob on the list once, fanning out to
/// all paths referencing it.
pub(crate) fn extract_stream_list(ctx: &mut ExtractContext<'_, '_>) -> Result<()> {
    let can_seek = ctx.archive.is_seekable();
    let list = ctx.extraction_list.clone();
    for blob_index in list {
        extract_stream_instances(ctx, blob_index, can_seek, None)?;
    }
    Ok(())
}

/// Extract all instances of one blob. When the source cannot be re-read
/// (non-seekable) and the blob has several instances, it is spilled to a
/// temporary file first and the copies are made from there.
fn extract_stream_instances(
    ctx: &mut ExtractContext<'_, '_>,
    blob_index: BlobIndex,
    can_seek: bool,
    current_spec: Option<BlobReadSpec>,
) -> Result<()> {
    let refs: Vec<DentryIndex> = ctx.archive.blobs.get(blob_index).refs.as_slice().to_vec();
    let out_refcnt = ctx.archive.blobs.get(blob_index).out_refcnt;
    let size = ctx.archive.blobs.get(blob_index).size;

    let mut tmp_file = None;
    let override_spec: Option<BlobReadSpec> = if can_seek || out_refcnt < 2 {
        current_spec.clone()
    } else {
        // One read from the source, many reads from the temp file.
        let source_spec = match current_spec.clone() {
            Some(spec) => spec,
            None => match BlobReadSpec::for_blob(ctx.archive.blobs.get(blob_index)) {
                Some(spec) => spec,
                None => {
                    warn!(
                        digest = %ctx.archive.blobs.get(blob_index).digest,
                        "blob content is not available; instances not extracted"
                    );
                    return Ok(());
                }
            },
        };
        let mut file = tempfile::NamedTempFile::new()
            .map_err(|err| ExtractError::Open(err, std::env::temp_dir()))?;
        let tmp_path = file.path().to_path_buf();
        {
            let mut writer = io::BufWriter::new(file.as_file_mut());
            ctx.archive.read_blob_to(&source_spec, size, &mut writer)?;
            writer
                .flush()
                .map_err(|err| ExtractError::Write(err, tmp_path.clone()))?;
        }
        debug!(
            digest = %ctx.archive.blobs.get(blob_index).digest,
            instances = out_refcnt,
            "spilled non-seekable blob to a temporary file"
        );
        tmp_file = Some(file);
        Some(BlobReadSpec::File(tmp_path))
    };

    let mut attempted = false;
    let result = (|| {
        // `tmp_flag` guards each dentry against re-processing however many
        // of its streams reference this blob.
        for &dentry in &refs {
            if ctx.image.dentry(dentry).tmp_flag {
                continue;
            }
            let Some(path) = ctx.build_extraction_path(dentry) else {
                continue;
            };
            attempted = true;
            extract_streams(ctx, dentry, &path, Some(blob_index), override_spec.as_ref())?;
            ctx.image.dentry_mut(dentry).tmp_flag = true;
        }
        Ok(())
    })();
    for &dentry in &refs {
        ctx.image.dentry_mut(dentry).tmp_flag = false;
    }

    // Every path was skipped but the record sits unread on the pipe; keep
    // the stream position in sync.
    if result.is_ok() && !attempted {
        if let Some(BlobReadSpec::Current { compressed }) = override_spec {
            ctx.archive.skip_blob_at_current(size, compressed)?;
        }
    }

    drop(tmp_file);
    result
}

/// Pipe strategy: consume records in archive order, extracting the ones the
/// image references and discarding the rest.
pub(crate) fn extract_from_pipe(ctx: &mut ExtractContext<'_, '_>) -> Result<()> {
    while ctx.num_streams_remaining > 0 {
        let Some(header) = pipe::read_stream_header(ctx.archive.source_reader(), true)? else {
            // A repeated archive prelude; nothing to do.
            continue;
        };

        if header.is_metadata() {
            ctx.archive
                .skip_blob_at_current(header.size, header.is_compressed())?;
            continue;
        }

        let needed = ctx
            .archive
            .blobs
            .lookup(&header.digest)
            .filter(|&blob| ctx.archive.blobs.get(blob).out_refcnt > 0);

        match needed {
            Some(blob_index) => {
                // The record supplies what planning could not know.
                ctx.archive.blobs.get_mut(blob_index).size = header.size;
                extract_stream_instances(
                    ctx,
                    blob_index,
                    false,
                    Some(BlobReadSpec::Current {
                        compressed: header.is_compressed(),
                    }),
                )?;
                ctx.num_streams_remaining -= 1;
            }
            None => {
                trace!(digest = %header.digest, "skipping unreferenced stream");
                ctx.archive
                    .skip_blob_at_current(header.size, header.is_compressed())?;
            }
        }
    }
    Ok(())
}

/// `TO_STDOUT`: the selected entry must be a regular file; its unnamed
/// stream goes to standard output and nothing touches the filesystem.
pub(crate) fn extract_to_stdout(ctx: &mut ExtractContext<'_, '_>) -> Result<()> {
    let inode = ctx.image.inode_of(ctx.root);
    if inode
        .attributes
        .intersects(FileAttributes::DIRECTORY | FileAttributes::REPARSE_POINT)
    {
        return Err(ExtractError::NotARegularFile(
            ctx.image.full_path(ctx.root),
        ));
    }
    if let Some(blob_index) = inode.unnamed_blob {
        let blob = ctx.archive.blobs.get(blob_index);
        let size = blob.size;
        if let Some(spec) = BlobReadSpec::for_blob(blob) {
            let stdout = io::stdout();
            let mut lock = stdout.lock();
            ctx.archive.read_blob_to(&spec, size, &mut lock)?;
        }
    }
    Ok(())
}
