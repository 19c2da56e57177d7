//! Shared test fixtures: a recording in-memory backend with configurable
//! capabilities, and builders for seekable and pipable test archives.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use wimapply::pipe::{
    encode_pipe_header, encode_stream_header, PipeHeader, StreamHeader, RESHDR_FLAG_METADATA,
};
use wimapply::{
    Archive, Backend, BackendCaps, BlobDescriptor, BlobLocation, Compression, FeatureFlags,
    Sha1Digest, Source, WimTimestamp,
};

/// In-memory filesystem recorder used as an extraction target.
#[derive(Debug)]
pub struct MockBackend {
    pub caps: BackendCaps,
    pub dirs: BTreeSet<PathBuf>,
    /// File contents; hardlinks share one cell, as they share one inode on
    /// a real filesystem.
    pub files: BTreeMap<PathBuf, Rc<RefCell<Vec<u8>>>>,
    pub named_streams: BTreeMap<(PathBuf, String), Vec<u8>>,
    pub hardlinks: Vec<(PathBuf, PathBuf)>,
    pub symlinks: BTreeMap<PathBuf, String>,
    pub reparse_data: BTreeMap<PathBuf, Vec<u8>>,
    pub attributes: BTreeMap<PathBuf, u32>,
    pub short_names: BTreeMap<PathBuf, String>,
    pub security: BTreeMap<PathBuf, Vec<u8>>,
    pub timestamps: BTreeMap<PathBuf, u64>,
    pub started: u32,
    pub finished: u32,
    pub aborted: u32,
}

impl MockBackend {
    fn with_caps(caps: BackendCaps) -> Self {
        MockBackend {
            caps,
            dirs: BTreeSet::new(),
            files: BTreeMap::new(),
            named_streams: BTreeMap::new(),
            hardlinks: Vec::new(),
            symlinks: BTreeMap::new(),
            reparse_data: BTreeMap::new(),
            attributes: BTreeMap::new(),
            short_names: BTreeMap::new(),
            security: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            started: 0,
            finished: 0,
            aborted: 0,
        }
    }

    /// POSIX-flavored target: hardlinks, symlinks, UNIX data, plus named
    /// streams so ADS behavior is testable off-NTFS.
    pub fn posix_like() -> Self {
        Self::with_caps(BackendCaps {
            supported: FeatureFlags::HARD_LINKS
                | FeatureFlags::SYMLINK_REPARSE_POINTS
                | FeatureFlags::NAMED_DATA_STREAMS
                | FeatureFlags::UNIX_DATA,
            ..BackendCaps::posix_defaults("mock-posix")
        })
    }

    /// Windows-flavored target: case-insensitive, reparse points, security
    /// descriptors, short names, DOS attributes.
    pub fn windows_like() -> Self {
        Self::with_caps(BackendCaps {
            windows_rules: true,
            supports_case_sensitive_filenames: false,
            has_set_file_attributes: true,
            supported: FeatureFlags::ARCHIVE_FILES
                | FeatureFlags::HIDDEN_FILES
                | FeatureFlags::SYSTEM_FILES
                | FeatureFlags::NOT_CONTENT_INDEXED
                | FeatureFlags::NAMED_DATA_STREAMS
                | FeatureFlags::HARD_LINKS
                | FeatureFlags::REPARSE_POINTS
                | FeatureFlags::SYMLINK_REPARSE_POINTS
                | FeatureFlags::SECURITY_DESCRIPTORS
                | FeatureFlags::SHORT_NAMES,
            ..BackendCaps::posix_defaults("mock-windows")
        })
    }

    /// A target with no optional features at all.
    pub fn bare() -> Self {
        Self::with_caps(BackendCaps {
            has_set_timestamps: false,
            supported: FeatureFlags::empty(),
            ..BackendCaps::posix_defaults("mock-bare")
        })
    }

    pub fn entry_count(&self) -> usize {
        self.dirs.len() + self.files.len() + self.symlinks.len()
    }

    /// Current content of a written file.
    pub fn file(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.get(path).map(|cell| cell.borrow().clone())
    }
}

impl Backend for MockBackend {
    fn caps(&self) -> &BackendCaps {
        &self.caps
    }

    fn start_extract(&mut self, _target: &Path) -> io::Result<()> {
        self.started += 1;
        Ok(())
    }

    fn finish_extract(&mut self) -> io::Result<()> {
        self.finished += 1;
        Ok(())
    }

    fn abort_extract(&mut self) {
        self.aborted += 1;
    }

    fn create_directory(&mut self, path: &Path) -> io::Result<()> {
        self.dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn create_file(&mut self, path: &Path) -> io::Result<()> {
        self.files
            .insert(path.to_path_buf(), Rc::new(RefCell::new(Vec::new())));
        Ok(())
    }

    fn create_hardlink(&mut self, oldpath: &Path, newpath: &Path) -> io::Result<()> {
        let inode = self.files.get(oldpath).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "hardlink target missing")
        })?;
        self.files.insert(newpath.to_path_buf(), inode);
        self.hardlinks
            .push((oldpath.to_path_buf(), newpath.to_path_buf()));
        Ok(())
    }

    fn create_symlink(&mut self, target: &str, link: &Path) -> io::Result<()> {
        self.symlinks.insert(link.to_path_buf(), target.to_string());
        Ok(())
    }

    fn write_unnamed_stream(
        &mut self,
        path: &Path,
        reader: &mut dyn Read,
        size: u64,
    ) -> io::Result<()> {
        let mut content = Vec::new();
        reader.read_to_end(&mut content)?;
        if content.len() as u64 != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short stream read",
            ));
        }
        match self.files.get(path) {
            Some(cell) => *cell.borrow_mut() = content,
            None => {
                self.files
                    .insert(path.to_path_buf(), Rc::new(RefCell::new(content)));
            }
        }
        Ok(())
    }

    fn write_named_stream(
        &mut self,
        path: &Path,
        name: &str,
        reader: Option<(&mut dyn Read, u64)>,
    ) -> io::Result<()> {
        let mut content = Vec::new();
        if let Some((reader, _size)) = reader {
            reader.read_to_end(&mut content)?;
        }
        self.named_streams
            .insert((path.to_path_buf(), name.to_string()), content);
        Ok(())
    }

    fn set_file_attributes(
        &mut self,
        path: &Path,
        attributes: wimapply::FileAttributes,
    ) -> io::Result<()> {
        self.attributes.insert(path.to_path_buf(), attributes.bits());
        Ok(())
    }

    fn set_short_name(&mut self, path: &Path, name: &str) -> io::Result<()> {
        self.short_names.insert(path.to_path_buf(), name.to_string());
        Ok(())
    }

    fn set_reparse_data(&mut self, path: &Path, buffer: &[u8]) -> io::Result<()> {
        self.reparse_data.insert(path.to_path_buf(), buffer.to_vec());
        Ok(())
    }

    fn set_security_descriptor(
        &mut self,
        path: &Path,
        descriptor: &[u8],
        _strict: bool,
    ) -> io::Result<()> {
        self.security.insert(path.to_path_buf(), descriptor.to_vec());
        Ok(())
    }

    fn set_unix_data(&mut self, _path: &Path, _data: &wimapply::UnixData) -> io::Result<()> {
        Ok(())
    }

    fn set_timestamps(
        &mut self,
        path: &Path,
        _creation: WimTimestamp,
        last_write: WimTimestamp,
        _last_access: WimTimestamp,
    ) -> io::Result<()> {
        self.timestamps
            .insert(path.to_path_buf(), last_write.ticks());
        Ok(())
    }
}

/// Builds a seekable archive whose blobs live at real offsets in an
/// in-memory "file".
pub struct SeekableArchiveBuilder {
    data: Vec<u8>,
    blobs: Vec<(Sha1Digest, u64, u64)>,
}

impl SeekableArchiveBuilder {
    pub fn new() -> Self {
        SeekableArchiveBuilder {
            // Leave room for a pretend header so offset 0 is never a blob.
            data: vec![0u8; 64],
            blobs: Vec::new(),
        }
    }

    pub fn add_blob(&mut self, content: &[u8]) -> Sha1Digest {
        let digest = Sha1Digest::of(content);
        if !self.blobs.iter().any(|(d, _, _)| *d == digest) {
            let offset = self.data.len() as u64;
            self.data.extend_from_slice(content);
            self.blobs.push((digest, offset, content.len() as u64));
        }
        digest
    }

    pub fn build(self) -> Archive {
        let mut archive = Archive::new(Source::Seekable(Box::new(Cursor::new(self.data))));
        for (digest, offset, size) in self.blobs {
            archive.blobs_mut().insert(BlobDescriptor::new(
                digest,
                size,
                BlobLocation::InArchive {
                    offset,
                    compressed_size: size,
                    compression: Compression::None,
                },
            ));
        }
        archive
    }
}

/// Serializes a pipable archive: prelude, XML record, one metadata record
/// per image, then blob records in insertion order.
pub struct PipableBuilder {
    image_count: u16,
    part_number: u16,
    rpfix: bool,
    blob_records: Vec<u8>,
}

impl PipableBuilder {
    pub fn new(image_count: u16) -> Self {
        PipableBuilder {
            image_count,
            part_number: 1,
            rpfix: false,
            blob_records: Vec::new(),
        }
    }

    pub fn part_number(mut self, part: u16) -> Self {
        self.part_number = part;
        self
    }

    pub fn rpfix(mut self, rpfix: bool) -> Self {
        self.rpfix = rpfix;
        self
    }

    pub fn push_blob(&mut self, content: &[u8]) -> Sha1Digest {
        let digest = Sha1Digest::of(content);
        let header = StreamHeader {
            size: content.len() as u64,
            digest,
            flags: 0,
        };
        self.blob_records.extend_from_slice(&encode_stream_header(&header));
        self.blob_records.extend_from_slice(content);
        digest
    }

    pub fn build(self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encode_pipe_header(&PipeHeader {
            image_count: self.image_count,
            part_number: self.part_number,
            total_parts: 1,
            compression: Compression::None,
            rpfix: self.rpfix,
        }));

        let mut push_metadata = |payload: &[u8]| {
            let header = StreamHeader {
                size: payload.len() as u64,
                digest: Sha1Digest::of(payload),
                flags: RESHDR_FLAG_METADATA,
            };
            bytes.extend_from_slice(&encode_stream_header(&header));
            bytes.extend_from_slice(payload);
        };
        push_metadata(b"<WIM/>");
        for _ in 0..self.image_count {
            push_metadata(b"metadata resource");
        }

        bytes.extend_from_slice(&self.blob_records);
        bytes
    }
}

/// A `Read`-only view over shared bytes that reports how far it has been
/// consumed, for asserting that pipe extraction drains every record.
pub struct TrackingReader {
    data: std::sync::Arc<Vec<u8>>,
    pos: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl TrackingReader {
    pub fn new(data: Vec<u8>) -> (Self, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        let pos = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        (
            TrackingReader {
                data: std::sync::Arc::new(data),
                pos: pos.clone(),
            },
            pos,
        )
    }
}

impl Read for TrackingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::sync::atomic::Ordering;
        let pos = self.pos.load(Ordering::Relaxed);
        let remaining = &self.data[pos.min(self.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos.store(pos + n, Ordering::Relaxed);
        Ok(n)
    }
}
