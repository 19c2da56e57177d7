//! The archive handle the extraction engine operates on.
//!
//! Opening and parsing an on-disk archive (header, metadata resources, XML
//! data) is a collaborator's job; an [`Archive`] is the already-digested
//! result: a blob table, per-image trees, a few header-derived flags, and
//! the input source the blobs are read from.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::blob::{BlobDescriptor, BlobLocation, BlobTable};
use crate::error::{ExtractError, Result};
use crate::tree::Image;

/// Pseudo image index selecting every image in the archive.
pub const ALL_IMAGES: u32 = u32::MAX;

/// Chunk granularity of compressed resources.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Compression codec of an archive's resources. The codecs themselves are
/// external; see [`Decompressor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Xpress,
    Lzx,
    Lzms,
}

/// One-chunk-at-a-time decompression, implemented by external codecs.
pub trait Decompressor {
    /// Decompress a chunk. `uncompressed_size` is the exact expected output
    /// length; anything else is a format error.
    fn decompress(&mut self, input: &[u8], uncompressed_size: usize) -> io::Result<Vec<u8>>;
}

/// Creates a decompressor for the given codec and chunk size, or `None` when
/// the codec is unavailable.
pub type DecompressorFactory = dyn Fn(Compression, usize) -> Option<Box<dyn Decompressor>>;

pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Where archive bytes come from.
pub enum Source {
    Seekable(Box<dyn ReadSeek>),
    Pipe(Box<dyn Read>),
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Seekable(_) => f.write_str("Source::Seekable"),
            Source::Pipe(_) => f.write_str("Source::Pipe"),
        }
    }
}

/// Resolved instructions for reading one blob's bytes.
#[derive(Debug, Clone)]
pub(crate) enum BlobReadSpec {
    /// Seek to `offset` in the archive and read.
    InArchive { offset: u64, compressed: bool },
    /// Read from the source's current position (pipe extraction).
    Current { compressed: bool },
    File(PathBuf),
    Memory(Vec<u8>),
}

impl BlobReadSpec {
    /// Derive the read spec from a blob's recorded location. `None` for
    /// blobs whose content is not available.
    pub(crate) fn for_blob(blob: &BlobDescriptor) -> Option<BlobReadSpec> {
        match &blob.location {
            BlobLocation::InArchive {
                offset,
                compression,
                ..
            } => Some(BlobReadSpec::InArchive {
                offset: *offset,
                compressed: *compression != Compression::None,
            }),
            BlobLocation::InFile(path) => Some(BlobReadSpec::File(path.clone())),
            BlobLocation::InMemory(data) => Some(BlobReadSpec::Memory(data.clone())),
            BlobLocation::Nonexistent => None,
        }
    }
}

pub struct Archive {
    pub(crate) source: Source,
    compression: Compression,
    chunk_size: usize,
    rpfix: bool,
    pipable: bool,
    part_number: u16,
    pub(crate) images: Vec<Image>,
    pub(crate) blobs: BlobTable,
    decompressor_factory: Option<Box<DecompressorFactory>>,
}

impl fmt::Debug for Archive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("source", &self.source)
            .field("compression", &self.compression)
            .field("rpfix", &self.rpfix)
            .field("pipable", &self.pipable)
            .field("images", &self.images.len())
            .field("blobs", &self.blobs.len())
            .finish_non_exhaustive()
    }
}

impl Archive {
    pub fn new(source: Source) -> Self {
        Archive {
            source,
            compression: Compression::None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            rpfix: false,
            pipable: false,
            part_number: 1,
            images: Vec::new(),
            blobs: BlobTable::new(),
            decompressor_factory: None,
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the header's reparse-fixup bit (images were captured with
    /// absolute symlink targets made volume-relative).
    pub fn with_rpfix(mut self, rpfix: bool) -> Self {
        self.rpfix = rpfix;
        self
    }

    pub fn with_decompressor_factory(mut self, factory: Box<DecompressorFactory>) -> Self {
        self.decompressor_factory = Some(factory);
        self
    }

    pub(crate) fn set_pipable(&mut self, part_number: u16) {
        self.pipable = true;
        self.part_number = part_number;
    }

    pub fn add_image(&mut self, image: Image) {
        self.images.push(image);
    }

    pub fn blobs(&self) -> &BlobTable {
        &self.blobs
    }

    pub fn blobs_mut(&mut self) -> &mut BlobTable {
        &mut self.blobs
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn header_rpfix(&self) -> bool {
        self.rpfix
    }

    pub fn is_pipable(&self) -> bool {
        self.pipable
    }

    pub fn part_number(&self) -> u16 {
        self.part_number
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Borrow an image by its 1-based index.
    pub fn image(&self, index: u32) -> Option<&Image> {
        self.images.get(index.checked_sub(1)? as usize)
    }

    /// Resolve an image number or name to a 1-based index.
    pub fn resolve_image(&self, num_or_name: &str) -> Option<u32> {
        if num_or_name == "all" || num_or_name == "*" {
            return Some(ALL_IMAGES);
        }
        if let Ok(number) = num_or_name.parse::<u32>() {
            return (number >= 1 && number <= self.image_count()).then_some(number);
        }
        self.images
            .iter()
            .position(|image| image.name == num_or_name)
            .map(|position| position as u32 + 1)
    }

    /// Temporarily move an image out of the archive so the extraction
    /// context can borrow it and the archive independently.
    pub(crate) fn take_image(&mut self, index: u32) -> Option<Image> {
        let slot = self.images.get_mut(index.checked_sub(1)? as usize)?;
        Some(std::mem::take(slot))
    }

    pub(crate) fn put_image(&mut self, index: u32, image: Image) {
        self.images[(index - 1) as usize] = image;
    }

    /// Direct access to the underlying source, for record-by-record pipe
    /// reads.
    pub(crate) fn source_reader(&mut self) -> &mut dyn Read {
        match &mut self.source {
            Source::Seekable(reader) => reader,
            Source::Pipe(reader) => reader,
        }
    }

    /// Whether the source supports random access, probed with a relative
    /// seek as pipes and sockets reject it.
    pub(crate) fn is_seekable(&mut self) -> bool {
        match &mut self.source {
            Source::Seekable(reader) => reader.seek(SeekFrom::Current(0)).is_ok(),
            Source::Pipe(_) => false,
        }
    }

    fn make_decompressor(&self, compression: Compression) -> Result<Box<dyn Decompressor>> {
        if compression == Compression::None {
            // Stored chunks never reach the decompressor.
            return Ok(Box::new(StoredChunks));
        }
        self.decompressor_factory
            .as_ref()
            .and_then(|factory| factory(compression, self.chunk_size))
            .ok_or_else(|| {
                ExtractError::Unsupported(format!(
                    "no decompressor available for {compression:?} resources"
                ))
            })
    }

    /// Open a blob for streaming. The returned reader yields exactly `size`
    /// uncompressed bytes.
    pub(crate) fn open_blob(&mut self, spec: &BlobReadSpec, size: u64) -> Result<BlobStream<'_>> {
        match spec {
            BlobReadSpec::InArchive { offset, compressed } => {
                let decompressor = compressed
                    .then(|| self.make_decompressor(self.compression))
                    .transpose()?;
                let chunk_size = self.chunk_size;
                let Source::Seekable(reader) = &mut self.source else {
                    return Err(ExtractError::Read(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "archive-resident blob read from a non-seekable source",
                    )));
                };
                reader
                    .seek(SeekFrom::Start(*offset))
                    .map_err(ExtractError::Read)?;
                Ok(BlobStream::Chunked(ChunkedReader::new(
                    reader,
                    size,
                    chunk_size,
                    decompressor,
                )))
            }
            BlobReadSpec::Current { compressed } => {
                let decompressor = compressed
                    .then(|| self.make_decompressor(self.compression))
                    .transpose()?;
                let chunk_size = self.chunk_size;
                let reader: &mut dyn Read = match &mut self.source {
                    Source::Seekable(reader) => reader,
                    Source::Pipe(reader) => reader,
                };
                Ok(BlobStream::Chunked(ChunkedReader::new(
                    reader,
                    size,
                    chunk_size,
                    decompressor,
                )))
            }
            BlobReadSpec::File(path) => {
                let file = std::fs::File::open(path)
                    .map_err(|err| ExtractError::Open(err, path.clone()))?;
                Ok(BlobStream::File(file.take(size)))
            }
            BlobReadSpec::Memory(data) => Ok(BlobStream::Memory(io::Cursor::new(data.clone()))),
        }
    }

    /// Stream a blob into `out`.
    pub(crate) fn read_blob_to(
        &mut self,
        spec: &BlobReadSpec,
        size: u64,
        out: &mut dyn Write,
    ) -> Result<u64> {
        let mut stream = self.open_blob(spec, size)?;
        io::copy(&mut stream, out).map_err(ExtractError::Read)
    }

    /// Read and discard a blob at the source's current position without
    /// decompressing it. Used to skip unneeded records on a pipe.
    pub(crate) fn skip_blob_at_current(&mut self, size: u64, compressed: bool) -> Result<()> {
        let chunk_size = self.chunk_size as u64;
        let reader: &mut dyn Read = match &mut self.source {
            Source::Seekable(reader) => reader,
            Source::Pipe(reader) => reader,
        };
        let mut remaining = size;
        while remaining > 0 {
            let chunk = remaining.min(chunk_size);
            let on_wire = if compressed {
                let mut len = [0u8; 4];
                reader.read_exact(&mut len).map_err(ExtractError::Read)?;
                u32::from_le_bytes(len) as u64
            } else {
                chunk
            };
            let copied = io::copy(&mut reader.take(on_wire), &mut io::sink())
                .map_err(ExtractError::Read)?;
            if copied != on_wire {
                return Err(ExtractError::Read(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "archive ended inside a skipped resource",
                )));
            }
            remaining -= chunk;
        }
        Ok(())
    }
}

/// Placeholder decompressor for stored (uncompressed) chunks; never invoked.
struct StoredChunks;

impl Decompressor for StoredChunks {
    fn decompress(&mut self, _input: &[u8], _uncompressed_size: usize) -> io::Result<Vec<u8>> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "stored resource contained a compressed chunk",
        ))
    }
}

/// Streaming reader over one blob.
pub(crate) enum BlobStream<'a> {
    Chunked(ChunkedReader<'a>),
    File(io::Take<std::fs::File>),
    Memory(io::Cursor<Vec<u8>>),
}

impl Read for BlobStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BlobStream::Chunked(reader) => reader.read(buf),
            BlobStream::File(reader) => reader.read(buf),
            BlobStream::Memory(reader) => reader.read(buf),
        }
    }
}

/// Reads a resource stored as a series of fixed-granularity chunks. With a
/// decompressor, each chunk is framed by a little-endian `u32` on-wire
/// length; a chunk whose on-wire length equals its uncompressed length is
/// stored raw.
pub(crate) struct ChunkedReader<'a> {
    src: &'a mut dyn Read,
    decompressor: Option<Box<dyn Decompressor>>,
    chunk_size: usize,
    remaining: u64,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> ChunkedReader<'a> {
    pub(crate) fn new(
        src: &'a mut dyn Read,
        size: u64,
        chunk_size: usize,
        decompressor: Option<Box<dyn Decompressor>>,
    ) -> Self {
        ChunkedReader {
            src,
            decompressor,
            chunk_size,
            remaining: size,
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        let chunk = self.remaining.min(self.chunk_size as u64) as usize;
        match &mut self.decompressor {
            None => {
                self.buf.resize(chunk, 0);
                self.src.read_exact(&mut self.buf)?;
            }
            Some(decompressor) => {
                let mut len = [0u8; 4];
                self.src.read_exact(&mut len)?;
                let on_wire = u32::from_le_bytes(len) as usize;
                let mut compressed = vec![0u8; on_wire];
                self.src.read_exact(&mut compressed)?;
                if on_wire == chunk {
                    self.buf = compressed;
                } else {
                    self.buf = decompressor.decompress(&compressed, chunk)?;
                    if self.buf.len() != chunk {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "decompressed chunk has the wrong length",
                        ));
                    }
                }
            }
        }
        self.remaining -= chunk as u64;
        self.pos = 0;
        Ok(())
    }
}

impl Read for ChunkedReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.buf.len() {
            if self.remaining == 0 {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
