//! The extraction driver.
//!
//! Orchestrates the passes over one image tree: name computation, feature
//! checking, blob reference planning, skeleton creation, stream extraction
//! (single-pass, sequential, or pipe), and finalization. All filesystem
//! effects go through the [`Backend`].

mod finalize;
mod plan;
mod skeleton;
mod streams;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::archive::{Archive, Source, ALL_IMAGES};
use crate::backend::{Backend, BackendCaps};
use crate::blob::BlobIndex;
use crate::error::{ExtractError, Result};
use crate::features;
use crate::flags::{ExtractFlags, PUBLIC_MASK};
use crate::names;
use crate::pipe;
use crate::progress::{ExtractProgress, ProgressAction, ProgressEvent, ProgressHandler};
use crate::tree::{DentryIndex, Image};

/// Everything one `extract_tree` invocation operates on.
pub(crate) struct ExtractContext<'a, 'h> {
    pub(crate) archive: &'a mut Archive,
    pub(crate) image: &'a mut Image,
    pub(crate) backend: &'a mut dyn Backend,
    pub(crate) caps: BackendCaps,
    pub(crate) flags: ExtractFlags,
    pub(crate) target: PathBuf,
    pub(crate) realtarget: Option<PathBuf>,
    pub(crate) root: DentryIndex,
    pub(crate) root_is_special: bool,
    pub(crate) invalid_sequence: u64,
    pub(crate) progress: ExtractProgress,
    pub(crate) handler: Option<&'a mut ProgressHandler<'h>>,
    pub(crate) next_progress: u64,
    pub(crate) num_streams_remaining: u64,
    pub(crate) extraction_list: Vec<BlobIndex>,
}

impl ExtractContext<'_, '_> {
    /// Invoke the progress callback, if any.
    pub(crate) fn fire(
        &mut self,
        event: for<'e> fn(&'e ExtractProgress) -> ProgressEvent<'e>,
    ) -> Result<()> {
        if let Some(handler) = self.handler.as_mut() {
            if handler(event(&self.progress)) == ProgressAction::Abort {
                return Err(ExtractError::Aborted);
            }
        }
        Ok(())
    }

    /// Account for one extracted stream instance and fire the byte-progress
    /// event each time another 1/128th of the total completes.
    pub(crate) fn update_stream_progress(&mut self, size: u64) -> Result<()> {
        self.progress.completed_bytes += size;
        if self.handler.is_some() && self.progress.completed_bytes >= self.next_progress {
            self.fire(|e| ProgressEvent::Streams(e))?;
            let total = self.progress.total_bytes;
            if self.progress.completed_bytes >= total {
                self.next_progress = u64::MAX;
            } else {
                self.next_progress += total / 128;
                if self.next_progress > total {
                    self.next_progress = total;
                }
            }
        }
        Ok(())
    }

    /// Build the host path a dentry extracts to, or `None` when the dentry
    /// is skipped or the path would exceed the backend's limit.
    pub(crate) fn build_extraction_path(&self, dentry: DentryIndex) -> Option<PathBuf> {
        if self.image.dentry(dentry).skipped {
            return None;
        }

        let mut components: Vec<&str> = Vec::new();
        let mut current = dentry;
        while current != self.root {
            let entry = self.image.dentry(current);
            components.push(entry.extraction_name.as_deref()?);
            current = entry.parent;
        }

        let prefix: &Path = if self.caps.requires_realtarget_in_paths {
            self.realtarget.as_deref()?
        } else if self.caps.requires_target_in_paths {
            &self.target
        } else {
            Path::new("")
        };

        let length: usize = self.caps.path_prefix.len()
            + prefix.as_os_str().len()
            + components.iter().map(|c| c.len() + 1).sum::<usize>()
            + 1;
        if length > self.caps.path_max {
            warn!(
                path = %self.image.full_path(dentry),
                "path too long to extract"
            );
            return None;
        }

        let mut path = PathBuf::from(format!("{}{}", self.caps.path_prefix, prefix.display()));
        for component in components.iter().rev() {
            path.push(component);
        }
        Some(path)
    }

    pub(crate) fn can_extract_named_streams(&self) -> bool {
        self.caps
            .supported
            .contains(crate::features::FeatureFlags::NAMED_DATA_STREAMS)
            && !self.flags.is_linked()
    }

    fn run(&mut self) -> Result<()> {
        let required = features::tally(self.image, self.root);
        features::check(&required, &self.caps, self.flags)?;

        if self.caps.root_directory_is_special && self.backend.target_is_root(&self.target) {
            self.root_is_special = true;
        }

        names::compute_extraction_names(
            self.image,
            self.root,
            &self.caps,
            self.flags,
            &mut self.invalid_sequence,
        );

        plan::resolve_streams(self);
        plan::plan_streams(self);

        if self.flags.contains(ExtractFlags::FROM_PIPE) {
            // The pipe's blob table has no sizes before the records arrive;
            // fall back on the per-image total recorded in the XML data.
            self.progress.total_bytes = self.image.total_bytes;
        }

        if self.flags.contains(ExtractFlags::TO_STDOUT) {
            return streams::extract_to_stdout(self);
        }

        if self.flags.contains(ExtractFlags::SEQUENTIAL)
            && !self.flags.contains(ExtractFlags::FROM_PIPE)
        {
            let blobs = &self.archive.blobs;
            self.extraction_list.sort_by_key(|&index| {
                let blob = blobs.get(index);
                let offset = match blob.location {
                    crate::blob::BlobLocation::InArchive { offset, .. } => offset,
                    _ => 0,
                };
                // Blobs inside one solid pack stay grouped behind it.
                (blob.solid, offset)
            });
        }

        if self.caps.realpath_works_on_nonexisting_files
            && (self.flags.contains(ExtractFlags::RPFIX)
                || self.caps.requires_realtarget_in_paths)
        {
            self.realtarget = Some(
                fs::canonicalize(&self.target)
                    .map_err(|err| ExtractError::Stat(err, self.target.clone()))?,
            );
        }

        if self.progress.source_path.is_empty() {
            self.fire(|e| ProgressEvent::ImageBegin(e))?;
        } else {
            self.fire(|e| ProgressEvent::TreeBegin(e))?;
        }

        // Create the extraction root itself before any pass needs it.
        let root = self.root;
        if !self.root_is_special {
            if let Some(path) = self.build_extraction_path(root) {
                skeleton::create_inode(self, root, &path)?;
            }
        }

        // Canonicalizing the target requires it to exist unless the backend
        // said otherwise; now it does.
        if self.realtarget.is_none()
            && ((self.flags.contains(ExtractFlags::RPFIX)
                && required.symlink_reparse_points > 0)
                || self.caps.requires_realtarget_in_paths)
        {
            self.realtarget = Some(
                fs::canonicalize(&self.target)
                    .map_err(|err| ExtractError::Stat(err, self.target.clone()))?,
            );
        }

        if self
            .flags
            .intersects(ExtractFlags::SEQUENTIAL | ExtractFlags::FROM_PIPE)
        {
            // Two passes: directory structure first, then the streams in
            // archive order.
            self.fire(|e| ProgressEvent::DirStructureBegin(e))?;
            let order: Vec<DentryIndex> = self.image.preorder(self.root).collect();
            for dentry in order {
                if let Some(path) = self.build_extraction_path(dentry) {
                    skeleton::extract_skeleton(self, dentry, &path)?;
                    self.progress.current_path = Some(path);
                    self.fire(|e| ProgressEvent::Dentry(e))?;
                }
            }
            self.progress.current_path = None;
            self.fire(|e| ProgressEvent::DirStructureEnd(e))?;

            if self.flags.contains(ExtractFlags::FROM_PIPE) {
                streams::extract_from_pipe(self)?;
            } else {
                streams::extract_stream_list(self)?;
            }
        } else {
            // Single pass: create each file and immediately stream its data.
            self.fire(|e| ProgressEvent::DirStructureBegin(e))?;
            let order: Vec<DentryIndex> = self.image.preorder(self.root).collect();
            for dentry in order {
                if let Some(path) = self.build_extraction_path(dentry) {
                    skeleton::extract_skeleton(self, dentry, &path)?;
                    self.progress.current_path = Some(path.clone());
                    self.fire(|e| ProgressEvent::Dentry(e))?;
                    streams::extract_streams(self, dentry, &path, None, None)?;
                }
            }
            self.progress.current_path = None;
            self.fire(|e| ProgressEvent::DirStructureEnd(e))?;
        }

        if self.progress.completed_bytes != self.progress.total_bytes {
            debug!(
                calculated = self.progress.total_bytes,
                extracted = self.progress.completed_bytes,
                "extracted byte count differs from the estimate"
            );
        }
        if self.handler.is_some() && self.progress.completed_bytes < self.progress.total_bytes {
            self.progress.completed_bytes = self.progress.total_bytes;
            self.fire(|e| ProgressEvent::Streams(e))?;
        }

        // Metadata that later operations would clobber is applied last, in
        // post-order so directory timestamps land after their children.
        self.fire(|e| ProgressEvent::ApplyTimestamps(e))?;
        let order: Vec<DentryIndex> = self.image.postorder(self.root).collect();
        for dentry in order {
            if let Some(path) = self.build_extraction_path(dentry) {
                finalize::finalize_dentry(self, dentry, &path)?;
            }
        }

        if self.progress.source_path.is_empty() {
            self.fire(|e| ProgressEvent::ImageEnd(e))?;
        } else {
            self.fire(|e| ProgressEvent::TreeEnd(e))?;
        }
        Ok(())
    }
}

/// Extract one tree from the selected image. `flags` must already be
/// validated. Scratch state is reset on every exit path so the archive
/// stays reusable.
fn extract_tree(
    archive: &mut Archive,
    image_index: u32,
    source_path: &str,
    target: &Path,
    flags: ExtractFlags,
    backend: &mut dyn Backend,
    handler: Option<&mut ProgressHandler<'_>>,
) -> Result<()> {
    let mut image = archive
        .take_image(image_index)
        .ok_or_else(|| ExtractError::InvalidImage(image_index.to_string()))?;

    let result = run_tree(
        archive, &mut image, source_path, target, flags, backend, handler,
    );

    // Scratch fields must not leak into the next extraction.
    image.reset_scratch();
    for blob in archive.blobs.iter_mut() {
        blob.reset_scratch();
    }
    archive.put_image(image_index, image);

    match result {
        Ok(()) => backend
            .finish_extract()
            .map_err(|err| ExtractError::Write(err, target.to_path_buf())),
        Err(err) => {
            backend.abort_extract();
            Err(err)
        }
    }
}

fn run_tree(
    archive: &mut Archive,
    image: &mut Image,
    source_path: &str,
    target: &Path,
    flags: ExtractFlags,
    backend: &mut dyn Backend,
    handler: Option<&mut ProgressHandler<'_>>,
) -> Result<()> {
    let root = image.lookup_path(source_path).ok_or_else(|| {
        ExtractError::PathDoesNotExist(format!("{} (image {})", source_path, image.index))
    })?;

    backend
        .start_extract(target)
        .map_err(|err| ExtractError::Open(err, target.to_path_buf()))?;
    let caps = backend.caps().clone();

    let progress = ExtractProgress {
        image: image.index,
        image_name: image.name.clone(),
        source_path: source_path.to_string(),
        target: target.to_path_buf(),
        ..Default::default()
    };

    let mut ctx = ExtractContext {
        archive,
        image,
        backend,
        caps,
        flags,
        target: target.to_path_buf(),
        realtarget: None,
        root,
        root_is_special: false,
        invalid_sequence: 0,
        progress,
        handler,
        next_progress: 0,
        num_streams_remaining: 0,
        extraction_list: Vec::new(),
    };
    ctx.run()
}

/// Whether an image name can be used directly as a directory name when
/// extracting all images.
fn image_name_ok_as_dir(name: &str, windows_rules: bool) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    let forbidden: &[char] = if windows_rules {
        &['<', '>', ':', '"', '/', '\\', '|', '?', '*']
    } else {
        &['/']
    };
    !name.contains(forbidden)
}

fn normalize_source_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|component| !component.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

impl Archive {
    /// Extract an image (or, with [`ALL_IMAGES`], every image into
    /// name-keyed subdirectories) through `backend`.
    pub fn extract_image_with(
        &mut self,
        image: u32,
        target: &Path,
        flags: ExtractFlags,
        backend: &mut dyn Backend,
        mut handler: Option<&mut ProgressHandler<'_>>,
    ) -> Result<()> {
        crate::init();
        let flags = ExtractFlags::from_bits_retain(flags.bits() & PUBLIC_MASK);

        let result = if image == ALL_IMAGES {
            self.extract_all_images(target, flags, backend, handler.as_mut())
        } else {
            self.extract_one(image, target, flags, backend, handler.take())
        };

        if flags.is_linked() {
            for blob in self.blobs.iter_mut() {
                blob.extracted_file = None;
            }
        }
        result
    }

    /// Extract one image with the platform-default backend.
    #[cfg(unix)]
    pub fn extract_image(
        &mut self,
        image: u32,
        target: &Path,
        flags: ExtractFlags,
    ) -> Result<()> {
        let mut backend = crate::backend::UnixBackend::new();
        self.extract_image_with(image, target, flags, &mut backend, None)
    }

    /// Extract one or more subtrees of an image.
    pub fn extract_paths_with(
        &mut self,
        image: u32,
        sources: &[&str],
        target: &Path,
        flags: ExtractFlags,
        backend: &mut dyn Backend,
        mut handler: Option<&mut ProgressHandler<'_>>,
    ) -> Result<()> {
        crate::init();
        let flags = ExtractFlags::from_bits_retain(flags.bits() & PUBLIC_MASK);
        if image == ALL_IMAGES {
            return Err(ExtractError::InvalidParam(
                "subtree extraction requires a single image",
            ));
        }

        let result = (|| {
            for source in sources {
                let source = normalize_source_path(source);
                let flags = flags.validate(target, self.header_rpfix(), false)?;
                extract_tree(
                    self,
                    image,
                    &source,
                    target,
                    flags,
                    backend,
                    handler.as_mut().map(|h| &mut **h),
                )?;
            }
            Ok(())
        })();

        if flags.is_linked() {
            for blob in self.blobs.iter_mut() {
                blob.extracted_file = None;
            }
        }
        result
    }

    fn extract_one(
        &mut self,
        image: u32,
        target: &Path,
        flags: ExtractFlags,
        backend: &mut dyn Backend,
        handler: Option<&mut ProgressHandler<'_>>,
    ) -> Result<()> {
        if image == 0 || image > self.image_count() {
            return Err(ExtractError::InvalidImage(image.to_string()));
        }
        let flags = flags.validate(target, self.header_rpfix(), true)?;
        extract_tree(self, image, "", target, flags, backend, handler)
    }

    fn extract_all_images(
        &mut self,
        target: &Path,
        flags: ExtractFlags,
        backend: &mut dyn Backend,
        mut handler: Option<&mut &mut ProgressHandler<'_>>,
    ) -> Result<()> {
        let flags = flags | ExtractFlags::MULTI_IMAGE;
        if flags.contains(ExtractFlags::NTFS) {
            return Err(ExtractError::InvalidParam(
                "cannot extract multiple images in NTFS mode",
            ));
        }

        match fs::metadata(target) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir(target)
                    .map_err(|err| ExtractError::Mkdir(err, target.to_path_buf()))?;
            }
            Err(err) => return Err(ExtractError::Stat(err, target.to_path_buf())),
            Ok(meta) if !meta.is_dir() => {
                return Err(ExtractError::NotDir(target.to_path_buf()));
            }
            Ok(_) => {}
        }

        let windows_rules = backend.caps().windows_rules;
        for index in 1..=self.image_count() {
            let name = self.image(index).map(|i| i.name.clone()).unwrap_or_default();
            let dir_name = if image_name_ok_as_dir(&name, windows_rules) {
                name
            } else {
                // Fall back on the image number when the name is unusable.
                index.to_string()
            };
            let subtarget = target.join(dir_name);
            self.extract_one(
                index,
                &subtarget,
                flags,
                backend,
                handler.as_mut().map(|h| &mut ***h),
            )?;
        }
        Ok(())
    }

    /// Extract an image from a pipable archive streamed over a non-seekable
    /// reader.
    ///
    /// The image trees come pre-parsed (via `images`; the blob table starts
    /// empty and fills in as stream records arrive). `image_num_or_name`
    /// selects the image; `None` requires the archive to hold exactly one.
    pub fn extract_image_from_pipe(
        reader: Box<dyn Read>,
        images: Vec<Image>,
        image_num_or_name: Option<&str>,
        target: &Path,
        flags: ExtractFlags,
        backend: &mut dyn Backend,
        handler: Option<&mut ProgressHandler<'_>>,
    ) -> Result<()> {
        crate::init();
        let flags = ExtractFlags::from_bits_retain(flags.bits() & PUBLIC_MASK);
        if flags.contains(ExtractFlags::TO_STDOUT) {
            return Err(ExtractError::InvalidParam(
                "cannot extract to stdout from a pipe",
            ));
        }

        let mut reader = reader;
        let header = pipe::read_pipe_header(&mut reader)?;
        if header.part_number != 1 {
            return Err(ExtractError::InvalidPipableWim(
                "the first part of a split archive must be sent first",
            ));
        }
        if header.image_count as usize != images.len() {
            return Err(ExtractError::ImageCount);
        }

        let mut archive = Archive::new(Source::Pipe(reader))
            .with_compression(header.compression)
            .with_rpfix(header.rpfix);
        archive.set_pipable(header.part_number);
        for image in images {
            archive.add_image(image);
        }

        // The XML data directly follows the header in pipable archives.
        let xml = pipe::read_stream_header(archive.source_reader(), false)?
            .ok_or(ExtractError::InvalidPipableWim("missing XML data record"))?;
        if !xml.is_metadata() {
            return Err(ExtractError::InvalidPipableWim(
                "expected XML data, found a non-metadata stream",
            ));
        }
        archive.skip_blob_at_current(xml.size, xml.is_compressed())?;

        let image = match image_num_or_name {
            Some(spec) => {
                let resolved = archive
                    .resolve_image(spec)
                    .ok_or_else(|| ExtractError::InvalidImage(spec.to_string()))?;
                if resolved == ALL_IMAGES {
                    return Err(ExtractError::InvalidImage(
                        "applying all images from a pipe is not supported".to_string(),
                    ));
                }
                resolved
            }
            None => {
                if archive.image_count() != 1 {
                    return Err(ExtractError::InvalidImage(
                        "no image specified and the archive does not contain \
                         exactly one"
                            .to_string(),
                    ));
                }
                1
            }
        };

        // Every image's metadata resource is streamed before the blobs. The
        // trees are already in hand, so all of them are read and discarded.
        for _ in 1..=archive.image_count() {
            let metadata = pipe::read_stream_header(archive.source_reader(), false)?
                .ok_or(ExtractError::InvalidPipableWim("missing metadata resource"))?;
            if !metadata.is_metadata() {
                return Err(ExtractError::InvalidPipableWim(
                    "expected a metadata resource, found a non-metadata stream",
                ));
            }
            archive.skip_blob_at_current(metadata.size, metadata.is_compressed())?;
        }

        let flags = (flags | ExtractFlags::FROM_PIPE | ExtractFlags::SEQUENTIAL)
            .validate(target, archive.header_rpfix(), true)?;
        extract_tree(&mut archive, image, "", target, flags, backend, handler)
    }
}
