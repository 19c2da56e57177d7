//! Final pass, in post-order: reparse data, security, then timestamps.

use std::io;
use std::path::Path;

use tracing::warn;

use crate::error::{ExtractError, Result};
use crate::features::FeatureFlags;
use crate::flags::ExtractFlags;
use crate::reparse;
use crate::tree::DentryIndex;

use super::ExtractContext;

pub(crate) fn finalize_dentry(
    ctx: &mut ExtractContext<'_, '_>,
    dentry: DentryIndex,
    path: &Path,
) -> Result<()> {
    let inode_index = ctx.image.dentry(dentry).inode;

    if ctx.image.inode(inode_index).is_reparse_point()
        && !ctx.image.dentry(dentry).was_hardlinked
    {
        apply_reparse(ctx, dentry, path)?;
    }

    apply_security(ctx, dentry, path)?;

    // Timestamps go last so nothing clobbers them afterwards.
    apply_timestamps(ctx, dentry, path)
}

fn apply_reparse(
    ctx: &mut ExtractContext<'_, '_>,
    dentry: DentryIndex,
    path: &Path,
) -> Result<()> {
    let inode_index = ctx.image.dentry(dentry).inode;
    let Some(buffer) = ctx.image.inode(inode_index).reparse_buf.clone() else {
        // The stream pass found no reparse data; nothing to apply.
        return Ok(());
    };
    let is_symlink = ctx.image.inode(inode_index).is_symlink();
    let strict = ctx.flags.contains(ExtractFlags::STRICT_SYMLINKS);

    if ctx.caps.supported.contains(FeatureFlags::REPARSE_POINTS) {
        let mut buffer = buffer;
        if ctx.flags.contains(ExtractFlags::RPFIX)
            && is_symlink
            && !ctx.image.inode(inode_index).not_rpfixed
        {
            let root = ctx
                .realtarget
                .as_ref()
                .unwrap_or(&ctx.target)
                .to_string_lossy()
                .into_owned();
            match reparse::fixup_buffer(&buffer, &root) {
                Some(fixed) => buffer = fixed,
                None => {
                    if strict {
                        return Err(ExtractError::ReparsePointFixupFailed(path.to_path_buf()));
                    }
                    warn!(path = %path.display(), "reparse point fixup failed");
                }
            }
        }
        if let Err(err) = ctx.backend.set_reparse_data(path, &buffer) {
            // Unprivileged accounts commonly cannot create symlinks on
            // Windows-family targets; warn rather than fail the extraction.
            if is_symlink && err.kind() == io::ErrorKind::PermissionDenied && !strict {
                warn!(
                    path = %path.display(),
                    "cannot set reparse data: access denied (creating \
                     symbolic links may require extra privileges)"
                );
            } else {
                return Err(ExtractError::Write(err, path.to_path_buf()));
            }
        }
    } else if is_symlink
        && ctx
            .caps
            .supported
            .contains(FeatureFlags::SYMLINK_REPARSE_POINTS)
    {
        // Express the reparse point as a real symlink.
        let full_path = ctx.image.full_path(dentry);
        let (tag, data) =
            reparse::parse_buffer(&buffer).map_err(|_| ExtractError::Readlink(full_path.clone()))?;
        let payload =
            reparse::parse_payload(tag, data).ok_or(ExtractError::Readlink(full_path))?;
        let mut target = reparse::link_target(&payload);
        if ctx.flags.contains(ExtractFlags::RPFIX)
            && target.starts_with('/')
            && !ctx.image.inode(inode_index).not_rpfixed
        {
            // Re-root the absolute target inside the extraction target.
            let root = ctx
                .realtarget
                .as_ref()
                .unwrap_or(&ctx.target)
                .to_string_lossy()
                .into_owned();
            target.insert_str(0, &root);
        }
        ctx.backend
            .create_symlink(&target, path)
            .map_err(|err| ExtractError::Write(err, path.to_path_buf()))?;
    }
    Ok(())
}

fn apply_security(
    ctx: &mut ExtractContext<'_, '_>,
    dentry: DentryIndex,
    path: &Path,
) -> Result<()> {
    if ctx.flags.contains(ExtractFlags::NO_ACLS) {
        return Ok(());
    }
    if dentry == ctx.root && ctx.root_is_special {
        return Ok(());
    }
    let inode_index = ctx.image.dentry(dentry).inode;
    let strict = ctx.flags.contains(ExtractFlags::STRICT_ACLS);

    if ctx.flags.contains(ExtractFlags::UNIX_DATA) {
        if let Some(data) = ctx.image.inode(inode_index).unix_data {
            if let Err(err) = ctx.backend.set_unix_data(path, &data) {
                if strict {
                    return Err(ExtractError::Write(err, path.to_path_buf()));
                }
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to set UNIX owner, group, and/or mode"
                );
            }
        }
        return Ok(());
    }

    if ctx
        .caps
        .supported
        .contains(FeatureFlags::SECURITY_DESCRIPTORS)
    {
        if let Some(security_id) = ctx.image.inode(inode_index).security_id {
            let Some(descriptor) = ctx.image.security.get(security_id) else {
                return Ok(());
            };
            if let Err(err) = ctx
                .backend
                .set_security_descriptor(path, descriptor, strict)
            {
                if strict {
                    return Err(ExtractError::Write(err, path.to_path_buf()));
                }
                if err.kind() != io::ErrorKind::PermissionDenied {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to set security descriptor"
                    );
                }
            }
        }
    }
    Ok(())
}

fn apply_timestamps(
    ctx: &mut ExtractContext<'_, '_>,
    dentry: DentryIndex,
    path: &Path,
) -> Result<()> {
    if dentry == ctx.root && ctx.root_is_special {
        return Ok(());
    }
    if !ctx.caps.has_set_timestamps {
        return Ok(());
    }
    let inode = ctx.image.inode_of(dentry);
    let (creation, last_write, last_access) = (
        inode.creation_time,
        inode.last_write_time,
        inode.last_access_time,
    );
    if let Err(err) = ctx
        .backend
        .set_timestamps(path, creation, last_write, last_access)
    {
        if ctx.flags.contains(ExtractFlags::STRICT_TIMESTAMPS) {
            return Err(ExtractError::Write(err, path.to_path_buf()));
        }
        warn!(path = %path.display(), error = %err, "failed to set timestamps");
    }
    Ok(())
}
