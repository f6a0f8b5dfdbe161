use crate::btree::{BTreeFile, HeaderRecord, NodeCache, TreeId};
use crate::cancel::{self, CancellationToken, Completion};
use crate::catalog::{CatalogFile, CatalogLeafRecord, CatalogRecord, CATALOG_FILE_ID, EXTENTS_FILE_ID};
use crate::error::HFSPError;
use crate::extents::{self, ExtentsFile, ForkType};
use crate::file_slice::FileSlice;
use crate::fork::{HFSFile, SharedStream};
use crate::fs;
use crate::volume::{self, ExtentDescriptor, FileSystemType, VolumeHeader, VolumeLocation};
use log::{info, warn};
use std::collections::HashSet;
use std::io::{Read, Seek, Write};
use std::sync::Arc;

const EXTRACT_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub node_cache: bool,
    pub node_cache_capacity: usize,
    /// Mount this partition rather than the first one holding a volume.
    pub partition_index: Option<usize>,
}

impl Default for MountOptions {
    fn default() -> MountOptions {
        MountOptions {
            node_cache: false,
            node_cache_capacity: 256,
            partition_index: None,
        }
    }
}

/// An entry found while walking a folder tree, with its path relative to
/// the folder the walk started from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub path: Vec<String>,
    pub record: CatalogLeafRecord,
}

#[derive(Debug)]
pub struct FileSystem<F> {
    stream: SharedStream<FileSlice<F>>,
    location: VolumeLocation,
    header: VolumeHeader,
    extents_header: HeaderRecord,
    catalog_header: HeaderRecord,
    catalog_extents: Vec<ExtentDescriptor>,
    cache: Option<Arc<NodeCache>>,
}

impl<F> FileSystem<F>
where
    F: Read + Seek,
{
    pub fn mount(file: F) -> fs::Result<FileSystem<F>> {
        Self::mount_with_options(file, &MountOptions::default())
    }

    pub fn mount_with_options(mut file: F, options: &MountOptions) -> fs::Result<FileSystem<F>> {
        let location = volume::find_volume(&mut file, options.partition_index).ok_or(HFSPError::NoFileSystem)?;
        if !location.fs_type.is_mountable() {
            return Err(HFSPError::UnsupportedFileSystem(location.fs_type));
        }
        info!(
            "Mounting {} volume at offset {} ({} bytes)",
            location.fs_type, location.offset, location.length
        );
        let slice = FileSlice::new(file, location.offset, Some(location.length))?;
        let stream = SharedStream::new(slice);

        let mut raw_header = [0u8; volume::SIZE_VOLUME_HEADER];
        stream
            .read_exact_at(volume::OFFSET_VOLUME_HEADER, &mut raw_header)
            .map_err(|e| HFSPError::io_context("reading volume header", e))?;
        let header = VolumeHeader::parse(&raw_header)?;
        let volume_bytes = header.block_size as u64 * header.total_blocks as u64;
        let available = stream.length()?;
        if volume_bytes > available {
            warn!("Volume claims {} bytes but only {} are available", volume_bytes, available);
        }

        let cache = if options.node_cache {
            Some(Arc::new(NodeCache::new(options.node_cache_capacity)))
        } else {
            None
        };

        let extents_fork = HFSFile::new(
            &stream,
            header.extents_file.used_extents(),
            header.block_size,
            header.extents_file.logical_size,
        )?;
        let extents_header = *BTreeFile::open(extents_fork, TreeId::Extents)?.header();

        let catalog_extents = {
            let extents_fork = HFSFile::new(
                &stream,
                header.extents_file.used_extents(),
                header.block_size,
                header.extents_file.logical_size,
            )?;
            let mut overflow =
                ExtentsFile::new(BTreeFile::with_header(extents_fork, TreeId::Extents, extents_header));
            extents::get_all_extent_descriptors(&mut overflow, CATALOG_FILE_ID, &header.catalog_file, ForkType::Data)?
        };
        let catalog_header = {
            let mut catalog_fork = HFSFile::new(
                &stream,
                catalog_extents.clone(),
                header.block_size,
                header.catalog_file.logical_size,
            )?;
            BTreeFile::read_header(&mut catalog_fork)?
        };

        Ok(FileSystem {
            stream,
            location,
            header,
            extents_header,
            catalog_header,
            catalog_extents,
            cache,
        })
    }

    pub fn into_inner(self) -> fs::Result<F> {
        Ok(self.stream.into_inner()?.into_inner())
    }

    pub fn volume_header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn location(&self) -> &VolumeLocation {
        &self.location
    }

    pub fn fs_type(&self) -> FileSystemType {
        self.location.fs_type
    }

    pub fn catalog_header(&self) -> &HeaderRecord {
        &self.catalog_header
    }

    pub fn extents_header(&self) -> &HeaderRecord {
        &self.extents_header
    }

    pub fn catalog(&self) -> fs::Result<CatalogFile<HFSFile<'_, FileSlice<F>>>> {
        let fork = HFSFile::new(
            &self.stream,
            self.catalog_extents.clone(),
            self.header.block_size,
            self.header.catalog_file.logical_size,
        )?;
        let tree = BTreeFile::with_header(fork, TreeId::Catalog, self.catalog_header).with_cache(self.cache.clone());
        Ok(CatalogFile::new(tree, self.header.is_hfsx()))
    }

    pub fn extents(&self) -> fs::Result<ExtentsFile<HFSFile<'_, FileSlice<F>>>> {
        let fork = HFSFile::new(
            &self.stream,
            self.header.extents_file.used_extents(),
            self.header.block_size,
            self.header.extents_file.logical_size,
        )?;
        let tree = BTreeFile::with_header(fork, TreeId::Extents, self.extents_header).with_cache(self.cache.clone());
        Ok(ExtentsFile::new(tree))
    }

    pub fn root(&self) -> fs::Result<CatalogLeafRecord> {
        self.catalog()?.get_root()
    }

    pub fn list_children(
        &self,
        folder_id: u32,
        cancel: Option<&CancellationToken>,
    ) -> fs::Result<Completion<Vec<CatalogLeafRecord>>> {
        self.catalog()?.list_children(folder_id, cancel)
    }

    /// Follows `segments` from the root folder. An empty path is the root.
    /// When cancelled, the deepest record reached so far is returned.
    pub fn resolve_path<S: AsRef<str>>(
        &self,
        segments: &[S],
        cancel: Option<&CancellationToken>,
    ) -> fs::Result<Completion<CatalogLeafRecord>> {
        let mut catalog = self.catalog()?;
        let mut current = catalog.get_root()?;
        for segment in segments {
            if cancel::is_cancelled(cancel) {
                return Ok(Completion::Cancelled(current));
            }
            let segment = segment.as_ref();
            let folder_id = match &current.record {
                CatalogRecord::Folder(folder) => folder.folder_id,
                _ => return Err(HFSPError::NotAFolder(current.name().to_string_lossy())),
            };
            current = catalog.get_record(folder_id, segment).map_err(|e| match e {
                HFSPError::NotFound(_) => HFSPError::NotFound(format!("\"{}\" in \"{}\"", segment, current.name())),
                other => other,
            })?;
        }
        Ok(Completion::Complete(current))
    }

    pub fn path_to_root(&self, record: &CatalogLeafRecord) -> fs::Result<Vec<CatalogLeafRecord>> {
        self.catalog()?.resolve_path_to_root(record)
    }

    /// Walks the tree below `folder` depth first, parents before children.
    pub fn list_recursive(
        &self,
        folder: &CatalogLeafRecord,
        cancel: Option<&CancellationToken>,
    ) -> fs::Result<Completion<Vec<WalkEntry>>> {
        if !folder.is_folder() {
            return Err(HFSPError::NotAFolder(folder.name().to_string_lossy()));
        }
        let mut catalog = self.catalog()?;
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut pending = vec![(folder.cnid(), Vec::<String>::new())];
        visited.insert(folder.cnid());
        while let Some((folder_id, path)) = pending.pop() {
            let children = match catalog.list_children(folder_id, cancel)? {
                Completion::Complete(children) => children,
                Completion::Cancelled(_) => return Ok(Completion::Cancelled(result)),
            };
            let mut subfolders = Vec::new();
            for child in children {
                let mut child_path = path.clone();
                child_path.push(child.name().to_string_lossy());
                if child.is_folder() {
                    if !visited.insert(child.cnid()) {
                        return Err(HFSPError::corrupt(format!("folder {} appears twice in the tree", child.cnid())));
                    }
                    subfolders.push((child.cnid(), child_path.clone()));
                }
                result.push(WalkEntry {
                    path: child_path,
                    record: child,
                });
            }
            pending.extend(subfolders.into_iter().rev());
        }
        Ok(Completion::Complete(result))
    }

    pub fn open_fork_reader(
        &self,
        record: &CatalogLeafRecord,
        fork_type: ForkType,
    ) -> fs::Result<HFSFile<'_, FileSlice<F>>> {
        let file = match &record.record {
            CatalogRecord::File(file) => file,
            _ => return Err(HFSPError::NotAFile(record.name().to_string_lossy())),
        };
        let fork = match fork_type {
            ForkType::Data => &file.data_fork,
            ForkType::Resource => &file.resource_fork,
        };
        let extents = if file.file_id == EXTENTS_FILE_ID {
            fork.used_extents()
        } else {
            extents::get_all_extent_descriptors(&mut self.extents()?, file.file_id, fork, fork_type)?
        };
        HFSFile::new(&self.stream, extents, self.header.block_size, fork.logical_size)
    }

    pub fn extract_fork<W: Write>(
        &self,
        record: &CatalogLeafRecord,
        fork_type: ForkType,
        writer: &mut W,
        cancel: Option<&CancellationToken>,
    ) -> fs::Result<Completion<u64>> {
        let mut reader = self.open_fork_reader(record, fork_type)?;
        let mut buffer = [0u8; EXTRACT_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            if cancel::is_cancelled(cancel) {
                return Ok(Completion::Cancelled(written));
            }
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read])?;
            written += read as u64;
        }
        if written < reader.len() {
            return Err(HFSPError::inconsistent(format!(
                "fork of \"{}\" ended after {} of {} bytes",
                record.name(),
                written,
                reader.len()
            )));
        }
        Ok(Completion::Complete(written))
    }
}
