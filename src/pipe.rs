//! Pipable archive records.
//!
//! A pipable archive interleaves everything a forward-only reader needs: a
//! small prelude header, the XML data, each image's metadata resource, and
//! then every blob, each preceded by a locatable stream header carrying the
//! blob's digest and size. The parsers here are sans-IO: they work on byte
//! slices, with thin `Read`-driven wrappers on top.

use std::io::{self, Read};

use crate::archive::Compression;
use crate::blob::Sha1Digest;
use crate::error::{ExtractError, Result};

pub const PIPE_ARCHIVE_MAGIC: [u8; 4] = *b"PWIM";
pub const PIPE_STREAM_MAGIC: [u8; 4] = *b"PWMS";

pub const PIPE_HEADER_SIZE: usize = 12;
pub const STREAM_HEADER_SIZE: usize = 36;

/// Stream header flag: the record is a metadata resource, not file content.
pub const RESHDR_FLAG_METADATA: u32 = 0x0000_0002;
/// Stream header flag: the payload uses the archive's chunked encoding.
pub const RESHDR_FLAG_COMPRESSED: u32 = 0x0000_0004;

/// The prelude at the very start of a pipable archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeHeader {
    pub image_count: u16,
    pub part_number: u16,
    pub total_parts: u16,
    pub compression: Compression,
    pub rpfix: bool,
}

/// The header preceding each stream's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Uncompressed payload size.
    pub size: u64,
    pub digest: Sha1Digest,
    pub flags: u32,
}

impl StreamHeader {
    pub fn is_metadata(&self) -> bool {
        self.flags & RESHDR_FLAG_METADATA != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & RESHDR_FLAG_COMPRESSED != 0
    }
}

fn compression_code(compression: Compression) -> u8 {
    match compression {
        Compression::None => 0,
        Compression::Xpress => 1,
        Compression::Lzx => 2,
        Compression::Lzms => 3,
    }
}

fn compression_from_code(code: u8) -> Option<Compression> {
    match code {
        0 => Some(Compression::None),
        1 => Some(Compression::Xpress),
        2 => Some(Compression::Lzx),
        3 => Some(Compression::Lzms),
        _ => None,
    }
}

pub fn parse_pipe_header(buf: &[u8; PIPE_HEADER_SIZE]) -> Result<PipeHeader> {
    if buf[0..4] != PIPE_ARCHIVE_MAGIC {
        return Err(ExtractError::NotPipable);
    }
    Ok(PipeHeader {
        image_count: u16::from_le_bytes(buf[4..6].try_into().unwrap()),
        part_number: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
        total_parts: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
        compression: compression_from_code(buf[10])
            .ok_or(ExtractError::InvalidPipableWim("unknown compression code"))?,
        rpfix: buf[11] & 0x1 != 0,
    })
}

pub fn encode_pipe_header(header: &PipeHeader) -> [u8; PIPE_HEADER_SIZE] {
    let mut buf = [0u8; PIPE_HEADER_SIZE];
    buf[0..4].copy_from_slice(&PIPE_ARCHIVE_MAGIC);
    buf[4..6].copy_from_slice(&header.image_count.to_le_bytes());
    buf[6..8].copy_from_slice(&header.part_number.to_le_bytes());
    buf[8..10].copy_from_slice(&header.total_parts.to_le_bytes());
    buf[10] = compression_code(header.compression);
    buf[11] = if header.rpfix { 0x1 } else { 0x0 };
    buf
}

pub fn parse_stream_header(buf: &[u8; STREAM_HEADER_SIZE]) -> Result<StreamHeader> {
    if buf[0..4] != PIPE_STREAM_MAGIC {
        return Err(ExtractError::InvalidPipableWim(
            "expected a stream header on the pipe",
        ));
    }
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&buf[12..32]);
    Ok(StreamHeader {
        size: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
        digest: Sha1Digest::from_bytes(digest),
        flags: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
    })
}

pub fn encode_stream_header(header: &StreamHeader) -> [u8; STREAM_HEADER_SIZE] {
    let mut buf = [0u8; STREAM_HEADER_SIZE];
    buf[0..4].copy_from_slice(&PIPE_STREAM_MAGIC);
    buf[4..12].copy_from_slice(&header.size.to_le_bytes());
    buf[12..32].copy_from_slice(header.digest.as_bytes());
    buf[32..36].copy_from_slice(&header.flags.to_le_bytes());
    buf
}

fn read_error(err: io::Error) -> ExtractError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ExtractError::InvalidPipableWim("pipe ended inside a record header")
    } else {
        ExtractError::Read(err)
    }
}

/// Read the prelude header from the start of a pipable archive.
pub fn read_pipe_header(reader: &mut dyn Read) -> Result<PipeHeader> {
    let mut buf = [0u8; PIPE_HEADER_SIZE];
    reader.read_exact(&mut buf).map_err(read_error)?;
    parse_pipe_header(&buf)
}

/// Read the next record header.
///
/// With `allow_pipe_header`, a repeated archive prelude (written before each
/// image part so concatenated parts stay parseable) is consumed and reported
/// as `None`.
pub fn read_stream_header(
    reader: &mut dyn Read,
    allow_pipe_header: bool,
) -> Result<Option<StreamHeader>> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).map_err(read_error)?;

    if allow_pipe_header && magic == PIPE_ARCHIVE_MAGIC {
        let mut rest = [0u8; PIPE_HEADER_SIZE - 4];
        reader.read_exact(&mut rest).map_err(read_error)?;
        return Ok(None);
    }

    let mut buf = [0u8; STREAM_HEADER_SIZE];
    buf[0..4].copy_from_slice(&magic);
    reader
        .read_exact(&mut buf[4..])
        .map_err(read_error)?;
    parse_stream_header(&buf).map(Some)
}
