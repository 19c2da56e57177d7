//! First pass: create the directory structure, empty files and streams,
//! attributes, short names, and hardlinks. No data is read from the archive
//! here.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ExtractError, Result};
use crate::features::FeatureFlags;
use crate::flags::ExtractFlags;
use crate::tree::DentryIndex;

use super::ExtractContext;

/// Create the file or directory behind `dentry`.
pub(crate) fn create_inode(
    ctx: &mut ExtractContext<'_, '_>,
    dentry: DentryIndex,
    path: &Path,
) -> Result<()> {
    let inode = ctx.image.inode_of(dentry);
    if inode.is_directory() {
        ctx.backend
            .create_directory(path)
            .map_err(|err| ExtractError::Mkdir(err, path.to_path_buf()))
    } else {
        ctx.backend
            .create_file(path)
            .map_err(|err| ExtractError::Open(err, path.to_path_buf()))
    }
}

fn create_hardlink(
    ctx: &mut ExtractContext<'_, '_>,
    oldpath: &Path,
    newpath: &Path,
) -> Result<()> {
    debug!(new = %newpath.display(), old = %oldpath.display(), "creating hardlink");
    ctx.backend
        .create_hardlink(oldpath, newpath)
        .map_err(|err| ExtractError::Write(err, newpath.to_path_buf()))
}

/// Create a relative symlink from `newpath` to the first extraction of the
/// same content (`oldpath`), used when extracting multiple images in
/// symlink mode. The target climbs from the link's directory to the common
/// ancestor (the overall target directory) and descends along the stored
/// first-extraction path.
fn create_multiimage_symlink(
    ctx: &mut ExtractContext<'_, '_>,
    oldpath: &Path,
    newpath: &Path,
    dentry: DentryIndex,
) -> Result<()> {
    let multi_image = ctx.flags.contains(ExtractFlags::MULTI_IMAGE);
    let base: PathBuf = if multi_image {
        ctx.target
            .parent()
            .unwrap_or(&ctx.target)
            .to_path_buf()
    } else {
        ctx.target.clone()
    };
    let relative_old = oldpath.strip_prefix(&base).unwrap_or(oldpath);

    let mut depth = 0usize;
    let mut current = dentry;
    while current != ctx.root {
        depth += 1;
        current = ctx.image.dentry(current).parent;
    }
    // Steps from the link's parent directory up to `base`: the components
    // below the extraction root minus the final name, plus the per-image
    // directory itself in multi-image mode.
    let ups = depth - 1 + usize::from(multi_image);

    let mut target = String::new();
    for _ in 0..ups {
        target.push_str("..");
        target.push(ctx.caps.path_separator);
    }
    target.push_str(&relative_old.display().to_string());

    debug!(link = %newpath.display(), target = %target, "creating image-link symlink");
    ctx.backend
        .create_symlink(&target, newpath)
        .map_err(|err| ExtractError::Write(err, newpath.to_path_buf()))
}

/// Create the "skeleton" of one extracted entry: everything that requires
/// no archive data and is not deferred to the finalizer.
pub(crate) fn extract_skeleton(
    ctx: &mut ExtractContext<'_, '_>,
    dentry: DentryIndex,
    path: &Path,
) -> Result<()> {
    let inode_index = ctx.image.dentry(dentry).inode;

    // Linked extraction: any content already materialized anywhere (first
    // image, earlier file) becomes a link instead of a copy.
    if ctx.flags.is_linked() {
        if let Some(unnamed) = ctx.image.inode(inode_index).unnamed_blob {
            if let Some(oldpath) = ctx.archive.blobs.get(unnamed).extracted_file.clone() {
                if ctx.flags.contains(ExtractFlags::HARDLINK) {
                    create_hardlink(ctx, &oldpath, path)?;
                } else {
                    create_multiimage_symlink(ctx, &oldpath, path, dentry)?;
                }
                ctx.image.dentry_mut(dentry).was_hardlinked = true;
                return Ok(());
            }
        }
    }

    // A second dentry for an already-created inode is a hardlink.
    if let Some(oldpath) = ctx.image.inode(inode_index).extracted_file.clone() {
        create_hardlink(ctx, &oldpath, path)?;
        ctx.image.dentry_mut(dentry).was_hardlinked = true;
        return Ok(());
    }

    // Symlinks a backend cannot express as reparse points are created whole
    // by the finalizer once their target is known.
    if ctx.image.inode(inode_index).is_symlink()
        && !ctx.caps.supported.contains(FeatureFlags::REPARSE_POINTS)
    {
        return Ok(());
    }

    // The extraction root was already created by the driver.
    if dentry != ctx.root {
        create_inode(ctx, dentry, path)?;
    }

    // Zero-length named streams have no blob and must be created here.
    if ctx.can_extract_named_streams() {
        let empty_streams: Vec<String> = ctx
            .image
            .inode(inode_index)
            .named_streams
            .iter()
            .filter(|stream| stream.digest.is_none())
            .map(|stream| stream.name.clone())
            .collect();
        for name in empty_streams {
            ctx.backend
                .write_named_stream(path, &name, None)
                .map_err(|err| ExtractError::Write(err, path.to_path_buf()))?;
        }
    }

    if ctx.caps.has_set_file_attributes && !(dentry == ctx.root && ctx.root_is_special) {
        let attributes = ctx.image.inode(inode_index).attributes;
        ctx.backend
            .set_file_attributes(path, attributes)
            .map_err(|err| ExtractError::Write(err, path.to_path_buf()))?;
    }

    // Short names are unimportant and easy to fail on; only strict mode
    // turns a failure into an error. The root keeps its target name.
    if dentry != ctx.root && ctx.caps.supported.contains(FeatureFlags::SHORT_NAMES) {
        let short_name = String::from_utf16_lossy(&ctx.image.dentry(dentry).short_name);
        if let Err(err) = ctx.backend.set_short_name(path, &short_name) {
            if ctx.flags.contains(ExtractFlags::STRICT_SHORT_NAMES) {
                return Err(ExtractError::Write(err, path.to_path_buf()));
            }
            warn!(path = %path.display(), error = %err, "failed to set short name");
        }
    }

    // Remember where this content lives for later links.
    if ctx.flags.is_linked() {
        if let Some(unnamed) = ctx.image.inode(inode_index).unnamed_blob {
            ctx.archive.blobs.get_mut(unnamed).extracted_file = Some(path.to_path_buf());
        }
    } else if ctx.image.inode(inode_index).link_count > 1
        && ctx.caps.supported.contains(FeatureFlags::HARD_LINKS)
    {
        ctx.image.inode_mut(inode_index).extracted_file = Some(path.to_path_buf());
    }
    Ok(())
}
