//! The in-memory model of one image: an arena of dentries and inodes.
//!
//! Dentries and inodes live in flat vectors owned by the [`Image`]; all
//! edges (parent, children, the dentry→inode link) are indices into those
//! vectors. Hardlinks are simply multiple dentries holding the same
//! [`InodeIndex`].

use std::path::PathBuf;

use crate::blob::{BlobIndex, Sha1Digest};
use crate::reparse::{IO_REPARSE_TAG_MOUNT_POINT, IO_REPARSE_TAG_SYMLINK};
use crate::security::SecurityTable;
use crate::time::WimTimestamp;

bitflags::bitflags! {
    /// Windows file attribute bits as stored in image metadata.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0000_0001;
        const HIDDEN = 0x0000_0002;
        const SYSTEM = 0x0000_0004;
        const DIRECTORY = 0x0000_0010;
        const ARCHIVE = 0x0000_0020;
        const NORMAL = 0x0000_0080;
        const SPARSE_FILE = 0x0000_0200;
        const REPARSE_POINT = 0x0000_0400;
        const COMPRESSED = 0x0000_0800;
        const NOT_CONTENT_INDEXED = 0x0000_2000;
        const ENCRYPTED = 0x0000_4000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DentryIndex(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeIndex(pub(crate) usize);

/// POSIX sidecar data captured with `UNIX_DATA`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixData {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// An alternate (named) data stream attached to an inode.
#[derive(Debug, Clone)]
pub struct NamedStream {
    pub name: String,
    /// `None` means the stream exists but is zero-length.
    pub digest: Option<Sha1Digest>,
    /// Resolved blob, filled in during planning.
    pub(crate) blob: Option<BlobIndex>,
}

impl NamedStream {
    pub fn new(name: impl Into<String>, digest: Option<Sha1Digest>) -> Self {
        NamedStream {
            name: name.into(),
            digest,
            blob: None,
        }
    }
}

/// A shared file object. All dentries that hardlink the same file point at
/// one inode.
#[derive(Debug, Clone, Default)]
pub struct Inode {
    pub attributes: FileAttributes,
    pub reparse_tag: u32,
    /// Set when the capture marked this reparse point as exempt from
    /// absolute-target fixups.
    pub not_rpfixed: bool,
    pub security_id: Option<u32>,
    pub creation_time: WimTimestamp,
    pub last_write_time: WimTimestamp,
    pub last_access_time: WimTimestamp,
    pub link_count: u32,
    pub unix_data: Option<UnixData>,
    /// Digest of the unnamed (default) data stream; `None` when empty.
    pub unnamed_stream: Option<Sha1Digest>,
    pub named_streams: Vec<NamedStream>,

    // Scratch fields, reset after every extraction.
    pub(crate) visited: bool,
    pub(crate) extracted_file: Option<PathBuf>,
    pub(crate) unnamed_blob: Option<BlobIndex>,
    /// Full reparse buffer captured during the stream pass so the finalizer
    /// can apply it after the source (possibly a pipe) has moved on.
    pub(crate) reparse_buf: Option<Vec<u8>>,
}

impl Inode {
    pub fn directory() -> Self {
        Inode {
            attributes: FileAttributes::DIRECTORY,
            ..Default::default()
        }
    }

    pub fn file(digest: Option<Sha1Digest>) -> Self {
        Inode {
            attributes: FileAttributes::NORMAL,
            unnamed_stream: digest,
            ..Default::default()
        }
    }

    pub fn symlink() -> Self {
        Inode {
            attributes: FileAttributes::REPARSE_POINT,
            reparse_tag: IO_REPARSE_TAG_SYMLINK,
            ..Default::default()
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }

    pub fn is_reparse_point(&self) -> bool {
        self.attributes.contains(FileAttributes::REPARSE_POINT)
    }

    /// Symbolic links and junction (mount) points both express as symlinks
    /// on hosts without reparse point support.
    pub fn is_symlink(&self) -> bool {
        self.is_reparse_point()
            && (self.reparse_tag == IO_REPARSE_TAG_SYMLINK
                || self.reparse_tag == IO_REPARSE_TAG_MOUNT_POINT)
    }

    pub fn is_encrypted_directory(&self) -> bool {
        self.attributes
            .contains(FileAttributes::DIRECTORY | FileAttributes::ENCRYPTED)
    }

    pub fn has_named_stream(&self) -> bool {
        !self.named_streams.is_empty()
    }

    pub(crate) fn reset_scratch(&mut self) {
        self.visited = false;
        self.extracted_file = None;
        self.unnamed_blob = None;
        self.reparse_buf = None;
        for stream in &mut self.named_streams {
            stream.blob = None;
        }
    }
}

/// One name binding in the tree.
#[derive(Debug, Clone, Default)]
pub struct Dentry {
    /// UTF-16LE code units; empty for the root.
    pub file_name: Vec<u16>,
    /// Short (DOS) name, if any.
    pub short_name: Vec<u16>,
    pub parent: DentryIndex,
    pub children: Vec<DentryIndex>,
    pub inode: InodeIndex,

    // Scratch fields, reset after every extraction.
    pub(crate) skipped: bool,
    pub(crate) was_hardlinked: bool,
    pub(crate) tmp_flag: bool,
    /// Host-encoded filename component this dentry extracts to.
    pub(crate) extraction_name: Option<String>,
}

impl Default for DentryIndex {
    fn default() -> Self {
        DentryIndex(0)
    }
}

impl Default for InodeIndex {
    fn default() -> Self {
        InodeIndex(0)
    }
}

impl Dentry {
    pub(crate) fn reset_scratch(&mut self) {
        self.skipped = false;
        self.was_hardlinked = false;
        self.tmp_flag = false;
        self.extraction_name = None;
    }
}

/// One named filesystem tree inside the archive.
#[derive(Debug, Default)]
pub struct Image {
    /// 1-based image index.
    pub index: u32,
    pub name: String,
    /// Total uncompressed bytes, as recorded in the archive's XML data.
    pub total_bytes: u64,
    pub boot: bool,
    pub security: SecurityTable,

    dentries: Vec<Dentry>,
    inodes: Vec<Inode>,
    root: DentryIndex,
}

impl Image {
    /// Create an image containing only a root directory.
    pub fn new(index: u32, name: impl Into<String>) -> Self {
        let mut image = Image {
            index,
            name: name.into(),
            ..Default::default()
        };
        let mut root_inode = Inode::directory();
        root_inode.link_count = 1;
        image.inodes.push(root_inode);
        image.dentries.push(Dentry {
            inode: InodeIndex(0),
            ..Default::default()
        });
        image.root = DentryIndex(0);
        image
    }

    pub fn root(&self) -> DentryIndex {
        self.root
    }

    pub fn dentry(&self, index: DentryIndex) -> &Dentry {
        &self.dentries[index.0]
    }

    pub(crate) fn dentry_mut(&mut self, index: DentryIndex) -> &mut Dentry {
        &mut self.dentries[index.0]
    }

    pub fn inode(&self, index: InodeIndex) -> &Inode {
        &self.inodes[index.0]
    }

    pub(crate) fn inode_mut(&mut self, index: InodeIndex) -> &mut Inode {
        &mut self.inodes[index.0]
    }

    pub fn inode_of(&self, dentry: DentryIndex) -> &Inode {
        self.inode(self.dentry(dentry).inode)
    }

    pub(crate) fn inode_of_mut(&mut self, dentry: DentryIndex) -> &mut Inode {
        let inode = self.dentry(dentry).inode;
        self.inode_mut(inode)
    }

    /// Add an inode to the arena. Its link count starts at zero and is
    /// incremented by [`Image::add_dentry`].
    pub fn add_inode(&mut self, inode: Inode) -> InodeIndex {
        let index = InodeIndex(self.inodes.len());
        self.inodes.push(inode);
        index
    }

    /// Bind `name` under `parent` to `inode`. Adding a second dentry for an
    /// existing inode creates a hardlink.
    pub fn add_dentry(
        &mut self,
        parent: DentryIndex,
        name: &str,
        inode: InodeIndex,
    ) -> DentryIndex {
        let index = DentryIndex(self.dentries.len());
        self.dentries.push(Dentry {
            file_name: name.encode_utf16().collect(),
            parent,
            inode,
            ..Default::default()
        });
        self.dentries[parent.0].children.push(index);
        self.inodes[inode.0].link_count += 1;
        index
    }

    /// Convenience for building test and capture trees.
    pub fn add_child(&mut self, parent: DentryIndex, name: &str, inode: Inode) -> DentryIndex {
        let inode = self.add_inode(inode);
        self.add_dentry(parent, name, inode)
    }

    pub fn dentry_count(&self) -> usize {
        self.dentries.len()
    }

    /// Look up a canonical image path (`/`-separated, no leading slash
    /// required). Comparison is case-sensitive unless the library was
    /// initialized to ignore case.
    pub fn lookup_path(&self, path: &str) -> Option<DentryIndex> {
        let ignore_case = crate::default_ignore_case();
        let mut current = self.root;
        for component in path.split(['/', '\\']).filter(|c| !c.is_empty()) {
            let component_utf16: Vec<u16> = component.encode_utf16().collect();
            current = *self.dentries[current.0].children.iter().find(|&&child| {
                let name = &self.dentries[child.0].file_name;
                if ignore_case {
                    crate::names::eq_ignore_case(name, &component_utf16)
                } else {
                    *name == component_utf16
                }
            })?;
        }
        Some(current)
    }

    /// The full archive path of a dentry, for diagnostics.
    pub fn full_path(&self, dentry: DentryIndex) -> String {
        let mut components = Vec::new();
        let mut current = dentry;
        while current != self.root {
            let d = &self.dentries[current.0];
            components.push(String::from_utf16_lossy(&d.file_name));
            current = d.parent;
        }
        if components.is_empty() {
            return "/".to_string();
        }
        components.reverse();
        let mut path = String::new();
        for component in components {
            path.push('/');
            path.push_str(&component);
        }
        path
    }

    /// Preorder traversal from `from`: every dentry before its children.
    pub fn preorder(&self, from: DentryIndex) -> Preorder<'_> {
        Preorder {
            image: self,
            stack: vec![from],
        }
    }

    /// Postorder traversal from `from`: every dentry after its children.
    pub fn postorder(&self, from: DentryIndex) -> std::vec::IntoIter<DentryIndex> {
        let mut order: Vec<DentryIndex> = self.preorder(from).collect();
        order.reverse();
        order.into_iter()
    }

    pub(crate) fn reset_scratch(&mut self) {
        for dentry in &mut self.dentries {
            dentry.reset_scratch();
        }
        for inode in &mut self.inodes {
            inode.reset_scratch();
        }
    }
}

pub struct Preorder<'a> {
    image: &'a Image,
    stack: Vec<DentryIndex>,
}

impl Iterator for Preorder<'_> {
    type Item = DentryIndex;

    fn next(&mut self) -> Option<DentryIndex> {
        let next = self.stack.pop()?;
        let children = &self.image.dentry(next).children;
        self.stack.extend(children.iter().rev().copied());
        Some(next)
    }
}
