//! Reparse point buffers: parsing, assembly, and absolute-target fixup.
//!
//! A full reparse buffer is the 8-byte header (tag, data length, reserved)
//! followed by tag-specific data. Symbolic links and junction points carry a
//! path buffer with a substitute name (what the filesystem follows) and a
//! print name (what tools display).

use crate::error::{ExtractError, Result};

pub const IO_REPARSE_TAG_MOUNT_POINT: u32 = 0xa000_0003;
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xa000_000c;

/// Upper bound on a full reparse buffer, per the NT limit.
pub const REPARSE_POINT_MAX_SIZE: usize = 16 * 1024;

/// Symlink-only flag: the substitute name is relative to the link's parent.
pub const SYMLINK_FLAG_RELATIVE: u32 = 0x0000_0001;

const HEADER_SIZE: usize = 8;

/// Decoded path data of a symlink or junction reparse point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReparsePayload {
    pub tag: u32,
    pub substitute_name: Vec<u16>,
    pub print_name: Vec<u16>,
    /// Only meaningful for `IO_REPARSE_TAG_SYMLINK`.
    pub flags: u32,
}

impl ReparsePayload {
    /// Build a symlink payload from a host-style target path.
    pub fn symlink(target: &str) -> Self {
        let relative = !target.starts_with('/') && !target.starts_with('\\');
        let units: Vec<u16> = target.encode_utf16().collect();
        ReparsePayload {
            tag: IO_REPARSE_TAG_SYMLINK,
            substitute_name: units.clone(),
            print_name: units,
            flags: if relative { SYMLINK_FLAG_RELATIVE } else { 0 },
        }
    }
}

/// Split a full reparse buffer into its tag and data portion.
pub fn parse_buffer(buf: &[u8]) -> Result<(u32, &[u8])> {
    if buf.len() < HEADER_SIZE {
        return Err(ExtractError::Read(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "reparse buffer shorter than its header",
        )));
    }
    let tag = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let data_len = u16::from_le_bytes(buf[4..6].try_into().unwrap()) as usize;
    if buf.len() < HEADER_SIZE + data_len {
        return Err(ExtractError::Read(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "reparse buffer truncated",
        )));
    }
    Ok((tag, &buf[HEADER_SIZE..HEADER_SIZE + data_len]))
}

/// Prepend the reparse header to tag-specific data.
pub fn assemble_buffer(tag: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + data.len());
    buf.extend_from_slice(&tag.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Decode the path data of a symlink or junction. Other tags return `None`.
pub fn parse_payload(tag: u32, data: &[u8]) -> Option<ReparsePayload> {
    if tag != IO_REPARSE_TAG_SYMLINK && tag != IO_REPARSE_TAG_MOUNT_POINT {
        return None;
    }
    let fixed = if tag == IO_REPARSE_TAG_SYMLINK { 12 } else { 8 };
    if data.len() < fixed {
        return None;
    }
    let sub_off = u16::from_le_bytes(data[0..2].try_into().unwrap()) as usize;
    let sub_len = u16::from_le_bytes(data[2..4].try_into().unwrap()) as usize;
    let print_off = u16::from_le_bytes(data[4..6].try_into().unwrap()) as usize;
    let print_len = u16::from_le_bytes(data[6..8].try_into().unwrap()) as usize;
    let flags = if tag == IO_REPARSE_TAG_SYMLINK {
        u32::from_le_bytes(data[8..12].try_into().unwrap())
    } else {
        0
    };

    let path_buf = &data[fixed..];
    let take = |off: usize, len: usize| -> Option<Vec<u16>> {
        let end = off.checked_add(len)?;
        if end > path_buf.len() || off % 2 != 0 || len % 2 != 0 {
            return None;
        }
        Some(
            path_buf[off..end]
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        )
    };

    Some(ReparsePayload {
        tag,
        substitute_name: take(sub_off, sub_len)?,
        print_name: take(print_off, print_len)?,
        flags,
    })
}

/// Encode the path data of a symlink or junction payload.
pub fn build_payload(payload: &ReparsePayload) -> Vec<u8> {
    let sub_bytes = payload.substitute_name.len() * 2;
    let print_bytes = payload.print_name.len() * 2;
    let fixed = if payload.tag == IO_REPARSE_TAG_SYMLINK {
        12
    } else {
        8
    };

    let mut data = Vec::with_capacity(fixed + sub_bytes + print_bytes);
    data.extend_from_slice(&0u16.to_le_bytes());
    data.extend_from_slice(&(sub_bytes as u16).to_le_bytes());
    data.extend_from_slice(&(sub_bytes as u16).to_le_bytes());
    data.extend_from_slice(&(print_bytes as u16).to_le_bytes());
    if payload.tag == IO_REPARSE_TAG_SYMLINK {
        data.extend_from_slice(&payload.flags.to_le_bytes());
    }
    for unit in payload
        .substitute_name
        .iter()
        .chain(payload.print_name.iter())
    {
        data.extend_from_slice(&unit.to_le_bytes());
    }
    data
}

/// Build the full on-disk reparse buffer for a payload.
pub fn build_buffer(payload: &ReparsePayload) -> Vec<u8> {
    assemble_buffer(payload.tag, &build_payload(payload))
}

/// Translate a link payload into a host-style target path: the `\??\`
/// namespace prefix is dropped and separators become `/`.
pub fn link_target(payload: &ReparsePayload) -> String {
    let mut target = String::from_utf16_lossy(&payload.substitute_name);
    if let Some(stripped) = target.strip_prefix("\\??\\") {
        target = stripped.to_string();
    }
    target.replace('\\', "/")
}

/// Rewrite an absolute link target so it points into the extraction root.
/// Relative targets are returned unchanged. Returns `None` when the payload
/// cannot be parsed as a link.
pub fn fixup_buffer(buf: &[u8], root: &str) -> Option<Vec<u8>> {
    let (tag, data) = parse_buffer(buf).ok()?;
    let mut payload = parse_payload(tag, data)?;

    if payload.tag == IO_REPARSE_TAG_SYMLINK && payload.flags & SYMLINK_FLAG_RELATIVE != 0 {
        return Some(buf.to_vec());
    }

    let target = link_target(&payload);
    // Targets with no recognizable volume prefix are left untouched.
    let Some(stripped) = strip_volume_prefix(&target) else {
        return Some(buf.to_vec());
    };

    let mut fixed = String::with_capacity(root.len() + stripped.len() + 1);
    fixed.push_str(root);
    if !stripped.starts_with('/') {
        fixed.push('/');
    }
    fixed.push_str(stripped);

    if fixed.len() * 2 >= REPARSE_POINT_MAX_SIZE {
        return None;
    }

    payload.substitute_name = fixed.encode_utf16().collect();
    payload.print_name = payload.substitute_name.clone();
    Some(build_buffer(&payload))
}

/// Drop the volume part of an absolute target (`C:`-style drive or a single
/// leading separator). Relative targets return `None`.
fn strip_volume_prefix(target: &str) -> Option<&str> {
    let bytes = target.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Some(&target[2..]);
    }
    if target.starts_with('/') {
        return Some(target);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_through_buffer() {
        let payload = ReparsePayload::symlink("../shared/lib.so");
        assert_eq!(payload.flags, SYMLINK_FLAG_RELATIVE);

        let buf = build_buffer(&payload);
        let (tag, data) = parse_buffer(&buf).unwrap();
        assert_eq!(tag, IO_REPARSE_TAG_SYMLINK);
        assert_eq!(parse_payload(tag, data).unwrap(), payload);
    }

    #[test]
    fn junction_payload_has_no_flags_field() {
        let mut payload = ReparsePayload::symlink("/mnt/vol");
        payload.tag = IO_REPARSE_TAG_MOUNT_POINT;
        payload.flags = 0;

        let buf = build_buffer(&payload);
        let (tag, data) = parse_buffer(&buf).unwrap();
        assert_eq!(parse_payload(tag, data).unwrap(), payload);
    }

    #[test]
    fn link_target_strips_nt_namespace() {
        let mut payload = ReparsePayload::symlink("x");
        payload.substitute_name = "\\??\\C:\\Windows".encode_utf16().collect();
        assert_eq!(link_target(&payload), "C:/Windows");
    }

    #[test]
    fn fixup_rewrites_absolute_targets() {
        let payload = ReparsePayload::symlink("/usr/lib/libfoo.so");
        let buf = build_buffer(&payload);

        let fixed = fixup_buffer(&buf, "/tmp/out").unwrap();
        let (tag, data) = parse_buffer(&fixed).unwrap();
        let fixed_payload = parse_payload(tag, data).unwrap();
        assert_eq!(link_target(&fixed_payload), "/tmp/out/usr/lib/libfoo.so");
    }

    #[test]
    fn fixup_leaves_relative_targets_alone() {
        let payload = ReparsePayload::symlink("../sibling");
        let buf = build_buffer(&payload);
        assert_eq!(fixup_buffer(&buf, "/tmp/out").unwrap(), buf);
    }

    #[test]
    fn truncated_buffers_are_rejected() {
        assert!(parse_buffer(&[0u8; 4]).is_err());
        let buf = assemble_buffer(IO_REPARSE_TAG_SYMLINK, &[0u8; 4]);
        let (tag, data) = parse_buffer(&buf).unwrap();
        assert!(parse_payload(tag, data).is_none());
    }
}
