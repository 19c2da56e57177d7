//! Extraction onto a POSIX directory tree.

use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs as unix_fs;
use std::path::Path;

use filetime::FileTime;
use tracing::trace;

use crate::features::FeatureFlags;
use crate::time::WimTimestamp;
use crate::tree::UnixData;

use super::{Backend, BackendCaps};

/// Writes extracted files into an ordinary directory tree using standard
/// POSIX filesystem operations. DOS attributes, named streams, short names,
/// and security descriptors have no representation here and are stripped
/// (with warnings) by the engine.
#[derive(Debug)]
pub struct UnixBackend {
    caps: BackendCaps,
}

impl UnixBackend {
    pub fn new() -> Self {
        UnixBackend {
            caps: BackendCaps {
                supported: FeatureFlags::HARD_LINKS
                    | FeatureFlags::SYMLINK_REPARSE_POINTS
                    | FeatureFlags::UNIX_DATA,
                ..BackendCaps::posix_defaults("unix")
            },
        }
    }
}

impl Default for UnixBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for UnixBackend {
    fn caps(&self) -> &BackendCaps {
        &self.caps
    }

    fn start_extract(&mut self, target: &Path) -> io::Result<()> {
        trace!(target = %target.display(), "starting unix extraction");
        Ok(())
    }

    fn create_directory(&mut self, path: &Path) -> io::Result<()> {
        match fs::create_dir(path) {
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if path.is_dir() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
            other => other,
        }
    }

    fn create_file(&mut self, path: &Path) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map(drop)
    }

    fn create_hardlink(&mut self, oldpath: &Path, newpath: &Path) -> io::Result<()> {
        fs::hard_link(oldpath, newpath)
    }

    fn create_symlink(&mut self, target: &str, link: &Path) -> io::Result<()> {
        unix_fs::symlink(target, link)
    }

    fn write_unnamed_stream(
        &mut self,
        path: &Path,
        reader: &mut dyn Read,
        size: u64,
    ) -> io::Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = io::BufWriter::new(file);
        let copied = io::copy(reader, &mut writer)?;
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {size} bytes, wrote {copied}"),
            ));
        }
        io::Write::flush(&mut writer)
    }

    fn set_unix_data(&mut self, path: &Path, data: &UnixData) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        unix_fs::lchown(path, Some(data.uid), Some(data.gid))?;
        if !path.is_symlink() {
            fs::set_permissions(path, fs::Permissions::from_mode(data.mode & 0o7777))?;
        }
        Ok(())
    }

    fn set_timestamps(
        &mut self,
        path: &Path,
        _creation: WimTimestamp,
        last_write: WimTimestamp,
        last_access: WimTimestamp,
    ) -> io::Result<()> {
        // Creation time has no POSIX representation.
        let mtime: FileTime = last_write.to_filetime();
        let atime: FileTime = last_access.to_filetime();
        filetime::set_symlink_file_times(path, atime, mtime)
    }
}
