//! Pipe extraction: forward-only sources, record skipping, and the
//! temp-file fan-out.

mod common;

use common::{MockBackend, PipableBuilder, TrackingReader};
use tempfile::TempDir;
use wimapply::{Archive, ExtractError, ExtractFlags, Image, Inode, Sha1Digest};

#[test]
fn round_trip_through_a_pipe() {
    let mut builder = PipableBuilder::new(1);
    let hello = builder.push_blob(b"hello");
    let world = builder.push_blob(b"world");
    let linked = builder.push_blob(b"hardlinked bytes");
    let bytes = builder.build();

    let mut image = Image::new(1, "pipe-test");
    let root = image.root();
    let a = image.add_child(root, "a", Inode::directory());
    image.add_child(a, "b.txt", Inode::file(Some(hello)));
    image.add_child(a, "c.txt", Inode::file(Some(world)));
    let pair = image.add_inode(Inode::file(Some(linked)));
    image.add_dentry(root, "x", pair);
    image.add_dentry(root, "y", pair);
    image.total_bytes = 26;

    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("out");
    let mut backend = MockBackend::posix_like();
    Archive::extract_image_from_pipe(
        Box::new(std::io::Cursor::new(bytes)),
        vec![image],
        None,
        &target,
        ExtractFlags::empty(),
        &mut backend,
        None,
    )
    .unwrap();

    for (path, content) in [
        ("a/b.txt", &b"hello"[..]),
        ("a/c.txt", &b"world"[..]),
        ("x", &b"hardlinked bytes"[..]),
        ("y", &b"hardlinked bytes"[..]),
    ] {
        let extracted = backend.file(&target.join(path)).unwrap();
        assert_eq!(extracted, content, "{path}");
        assert_eq!(Sha1Digest::of(&extracted), Sha1Digest::of(content));
    }
    // The second link was made by linking, not by re-extracting.
    assert_eq!(backend.hardlinks.len(), 1);
}

#[test]
fn unreferenced_records_are_skipped_and_drained() {
    let mut builder = PipableBuilder::new(1);
    let _unused1 = builder.push_blob(b"nobody wants this");
    let needed1 = builder.push_blob(b"first needed");
    let _unused2 = builder.push_blob(b"nor this");
    let needed2 = builder.push_blob(b"second needed");
    let bytes = builder.build();
    let total_len = bytes.len();

    let mut image = Image::new(1, "partial");
    let root = image.root();
    image.add_child(root, "one", Inode::file(Some(needed1)));
    image.add_child(root, "two", Inode::file(Some(needed2)));
    image.total_bytes = 25;

    let (reader, pos) = TrackingReader::new(bytes);
    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("out");
    let mut backend = MockBackend::posix_like();
    Archive::extract_image_from_pipe(
        Box::new(reader),
        vec![image],
        Some("1"),
        &target,
        ExtractFlags::empty(),
        &mut backend,
        None,
    )
    .unwrap();

    assert_eq!(
        backend.file(&target.join("one")),
        Some(b"first needed".to_vec())
    );
    assert_eq!(
        backend.file(&target.join("two")),
        Some(b"second needed".to_vec())
    );
    // Every record was consumed, including the two discarded ones.
    assert_eq!(pos.load(std::sync::atomic::Ordering::Relaxed), total_len);
}

#[test]
fn shared_blob_spills_to_a_temp_file_once() {
    let mut builder = PipableBuilder::new(1);
    let shared = builder.push_blob(b"fan out three ways");
    let bytes = builder.build();

    let mut image = Image::new(1, "fanout");
    let root = image.root();
    for name in ["first", "second", "third"] {
        image.add_child(root, name, Inode::file(Some(shared)));
    }
    image.total_bytes = 3 * 18;

    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("out");
    let mut backend = MockBackend::posix_like();
    Archive::extract_image_from_pipe(
        Box::new(std::io::Cursor::new(bytes)),
        vec![image],
        None,
        &target,
        ExtractFlags::empty(),
        &mut backend,
        None,
    )
    .unwrap();

    for name in ["first", "second", "third"] {
        assert_eq!(
            backend.file(&target.join(name)),
            Some(b"fan out three ways".to_vec()),
            "{name}"
        );
    }
}

#[test]
fn symlink_round_trips_through_a_pipe() {
    let payload = wimapply::reparse::build_payload(
        &wimapply::reparse::ReparsePayload::symlink("/abs/elsewhere"),
    );
    let mut builder = PipableBuilder::new(1);
    let reparse_blob = builder.push_blob(&payload);
    let bytes = builder.build();

    let mut image = Image::new(1, "links");
    let root = image.root();
    let mut link = Inode::symlink();
    link.unnamed_stream = Some(reparse_blob);
    image.add_child(root, "link", link);
    image.total_bytes = payload.len() as u64;

    let tmp = TempDir::new().unwrap();
    let target = tmp.path().join("out");
    let mut backend = MockBackend::posix_like();
    Archive::extract_image_from_pipe(
        Box::new(std::io::Cursor::new(bytes)),
        vec![image],
        None,
        &target,
        ExtractFlags::NORPFIX,
        &mut backend,
        None,
    )
    .unwrap();

    assert_eq!(
        backend.symlinks.get(&target.join("link")),
        Some(&"/abs/elsewhere".to_string())
    );
}

#[test]
fn non_pipable_input_is_rejected() {
    let err = Archive::extract_image_from_pipe(
        Box::new(std::io::Cursor::new(vec![0u8; 64])),
        vec![Image::new(1, "x")],
        None,
        std::path::Path::new("/tmp/nowhere"),
        ExtractFlags::empty(),
        &mut MockBackend::posix_like(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, ExtractError::NotPipable));
}

#[test]
fn later_split_parts_are_rejected() {
    let bytes = PipableBuilder::new(1).part_number(2).build();
    let err = Archive::extract_image_from_pipe(
        Box::new(std::io::Cursor::new(bytes)),
        vec![Image::new(1, "x")],
        None,
        std::path::Path::new("/tmp/nowhere"),
        ExtractFlags::empty(),
        &mut MockBackend::posix_like(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, ExtractError::InvalidPipableWim(_)));
}

#[test]
fn image_count_mismatch_is_rejected() {
    let bytes = PipableBuilder::new(2).build();
    let err = Archive::extract_image_from_pipe(
        Box::new(std::io::Cursor::new(bytes)),
        vec![Image::new(1, "only-one")],
        None,
        std::path::Path::new("/tmp/nowhere"),
        ExtractFlags::empty(),
        &mut MockBackend::posix_like(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, ExtractError::ImageCount));
}

#[test]
fn unknown_image_name_is_rejected() {
    let mut builder = PipableBuilder::new(1);
    builder.push_blob(b"payload");
    let bytes = builder.build();

    let err = Archive::extract_image_from_pipe(
        Box::new(std::io::Cursor::new(bytes)),
        vec![Image::new(1, "real-name")],
        Some("wrong-name"),
        std::path::Path::new("/tmp/nowhere"),
        ExtractFlags::empty(),
        &mut MockBackend::posix_like(),
        None,
    )
    .unwrap_err();
    assert!(matches!(err, ExtractError::InvalidImage(_)));
}
