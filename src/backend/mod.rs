//! Pluggable filesystem writers.
//!
//! A backend is a capability bundle: the operations the engine may invoke
//! plus a [`BackendCaps`] record describing path conventions and the feature
//! set the target volume actually supports. Backends are interchangeable
//! values, selected at extraction start.

use std::io::{self, Read};
use std::path::Path;

use crate::features::FeatureFlags;
use crate::time::WimTimestamp;
use crate::tree::{FileAttributes, UnixData};

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::UnixBackend;

/// Static description of a backend's path handling and feature support.
#[derive(Debug, Clone)]
pub struct BackendCaps {
    pub name: &'static str,
    /// Maximum path length, in characters including the terminator.
    pub path_max: usize,
    /// Prefix prepended to every path handed to the operations (e.g. the
    /// `\\?\` namespace prefix on raw Win32 targets).
    pub path_prefix: &'static str,
    pub path_separator: char,
    /// Paths handed to operations include the extraction target.
    pub requires_target_in_paths: bool,
    /// Paths handed to operations include the canonicalized target.
    pub requires_realtarget_in_paths: bool,
    /// The target can be canonicalized before it exists.
    pub realpath_works_on_nonexisting_files: bool,
    pub supports_case_sensitive_filenames: bool,
    /// Apply Windows filename legality rules (reserved characters, trailing
    /// dot/space, U+FFFD replacement).
    pub windows_rules: bool,
    /// An extraction target that is the volume root must not itself be
    /// created or have metadata applied.
    pub root_directory_is_special: bool,
    pub has_set_file_attributes: bool,
    pub has_set_timestamps: bool,
    pub supported: FeatureFlags,
}

impl BackendCaps {
    /// Baseline capabilities for a POSIX-style directory-tree target.
    pub fn posix_defaults(name: &'static str) -> Self {
        BackendCaps {
            name,
            path_max: 4096,
            path_prefix: "",
            path_separator: '/',
            requires_target_in_paths: true,
            requires_realtarget_in_paths: false,
            realpath_works_on_nonexisting_files: false,
            supports_case_sensitive_filenames: true,
            windows_rules: false,
            root_directory_is_special: false,
            has_set_file_attributes: false,
            has_set_timestamps: true,
            supported: FeatureFlags::empty(),
        }
    }
}

fn unsupported(op: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("operation not supported by this backend: {op}"),
    )
}

/// Operations the extraction engine drives.
///
/// Optional operations have defaults that fail with `Unsupported`; the
/// engine consults [`BackendCaps`] before invoking them, so a backend that
/// advertises a feature must override the matching methods.
pub trait Backend {
    fn caps(&self) -> &BackendCaps;

    /// Called once before any other operation. Backends that need to probe
    /// the target volume (and refine their advertised features) do it here.
    fn start_extract(&mut self, target: &Path) -> io::Result<()>;

    /// Called once after a fully successful extraction.
    fn finish_extract(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Called when extraction fails; best-effort, errors are ignored.
    fn abort_extract(&mut self) {}

    /// Whether `target` is the root of the volume being written.
    fn target_is_root(&self, _target: &Path) -> bool {
        false
    }

    fn create_directory(&mut self, path: &Path) -> io::Result<()>;

    fn create_file(&mut self, path: &Path) -> io::Result<()>;

    fn create_hardlink(&mut self, oldpath: &Path, newpath: &Path) -> io::Result<()> {
        let _ = (oldpath, newpath);
        Err(unsupported("create_hardlink"))
    }

    fn create_symlink(&mut self, target: &str, link: &Path) -> io::Result<()> {
        let _ = (target, link);
        Err(unsupported("create_symlink"))
    }

    /// Write the unnamed data stream. `reader` yields exactly `size` bytes.
    fn write_unnamed_stream(
        &mut self,
        path: &Path,
        reader: &mut dyn Read,
        size: u64,
    ) -> io::Result<()>;

    /// Create or fill a named data stream. `reader` is `None` for a
    /// zero-length stream that must still exist.
    fn write_named_stream(
        &mut self,
        path: &Path,
        name: &str,
        reader: Option<(&mut dyn Read, u64)>,
    ) -> io::Result<()> {
        let _ = (path, name, reader);
        Err(unsupported("write_named_stream"))
    }

    /// Restore raw encrypted data for an ENCRYPTED-flagged file.
    fn write_encrypted_stream(
        &mut self,
        path: &Path,
        reader: &mut dyn Read,
        size: u64,
    ) -> io::Result<()> {
        let _ = (path, reader, size);
        Err(unsupported("write_encrypted_stream"))
    }

    fn set_file_attributes(&mut self, path: &Path, attributes: FileAttributes) -> io::Result<()> {
        let _ = (path, attributes);
        Err(unsupported("set_file_attributes"))
    }

    fn set_short_name(&mut self, path: &Path, name: &str) -> io::Result<()> {
        let _ = (path, name);
        Err(unsupported("set_short_name"))
    }

    fn set_reparse_data(&mut self, path: &Path, buffer: &[u8]) -> io::Result<()> {
        let _ = (path, buffer);
        Err(unsupported("set_reparse_data"))
    }

    /// `strict` requests full fidelity; a non-strict backend may apply as
    /// much of the descriptor as the caller's privileges allow.
    fn set_security_descriptor(
        &mut self,
        path: &Path,
        descriptor: &[u8],
        strict: bool,
    ) -> io::Result<()> {
        let _ = (path, descriptor, strict);
        Err(unsupported("set_security_descriptor"))
    }

    fn set_unix_data(&mut self, path: &Path, data: &UnixData) -> io::Result<()> {
        let _ = (path, data);
        Err(unsupported("set_unix_data"))
    }

    fn set_timestamps(
        &mut self,
        path: &Path,
        creation: WimTimestamp,
        last_write: WimTimestamp,
        last_access: WimTimestamp,
    ) -> io::Result<()> {
        let _ = (path, creation, last_write, last_access);
        Err(unsupported("set_timestamps"))
    }
}
