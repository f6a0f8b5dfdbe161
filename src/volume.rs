//! Volume header and wrapper decoding, and location of the volume to mount.

use crate::error::HFSPError;
use crate::fs;
use crate::partition::{self, PartitionSystemType};
use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::fmt::{self, Display, Formatter};
use std::io::{Read, Seek, SeekFrom};

pub const OFFSET_VOLUME_HEADER: u64 = 1024;
pub const SIZE_VOLUME_HEADER: usize = 512;
const OFFSET_VOLUME_HEADER_FORKS: usize = 112;
const OFFSET_FORK_DATA_EXTENT_RECORD: usize = 16;
const SIZE_EXTENT_DESCRIPTOR: usize = 8;
pub const EXTENTS_PER_RECORD: usize = 8;
pub const SIZE_EXTENT_RECORD: usize = SIZE_EXTENT_DESCRIPTOR * EXTENTS_PER_RECORD;
pub const SIZE_FORK_DATA: usize = OFFSET_FORK_DATA_EXTENT_RECORD + SIZE_EXTENT_RECORD;

const SIGNATURE_HFS_PLUS: u16 = 0x482B; // "H+"
const SIGNATURE_HFSX: u16 = 0x4858; // "HX"
const SIGNATURE_HFS: u16 = 0x4244; // "BD"
const SIGNATURE_MFS: u16 = 0xD2D7;

const MDB_SECTOR_SIZE: u64 = 512;
const MIN_BLOCK_SIZE: u32 = 512;
const MAX_BLOCK_SIZE: u32 = 1 << 20;

/// Seconds between 1904-01-01 and 1970-01-01.
const MAC_EPOCH_OFFSET: i64 = 2_082_844_800;

pub const ATTRIBUTE_UNMOUNTED: u32 = 1 << 8;
pub const ATTRIBUTE_SOFTWARE_LOCK: u32 = 1 << 15;
pub const ATTRIBUTE_JOURNALED: u32 = 1 << 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct HFSDate(pub u32);

impl HFSDate {
    pub fn to_utc(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.0 as i64 - MAC_EPOCH_OFFSET, 0)
    }
}

impl Display for HFSDate {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self.to_utc() {
            Some(date) => write!(fmt, "{}", date.format("%Y-%m-%d %H:%M:%S")),
            None => write!(fmt, "<invalid date {}>", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl ExtentDescriptor {
    pub fn parse(data: &[u8]) -> ExtentDescriptor {
        ExtentDescriptor {
            start_block: BigEndian::read_u32(&data[0..4]),
            block_count: BigEndian::read_u32(&data[4..8]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start_block == 0 && self.block_count == 0
    }
}

pub fn parse_extent_record(data: &[u8]) -> [ExtentDescriptor; EXTENTS_PER_RECORD] {
    let mut record = [ExtentDescriptor::default(); EXTENTS_PER_RECORD];
    for (index, descriptor) in record.iter_mut().enumerate() {
        *descriptor = ExtentDescriptor::parse(&data[index * SIZE_EXTENT_DESCRIPTOR..]);
    }
    record
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [ExtentDescriptor; EXTENTS_PER_RECORD],
}

impl ForkData {
    pub fn parse(data: &[u8]) -> ForkData {
        ForkData {
            logical_size: BigEndian::read_u64(&data[0..8]),
            clump_size: BigEndian::read_u32(&data[8..12]),
            total_blocks: BigEndian::read_u32(&data[12..16]),
            extents: parse_extent_record(&data[OFFSET_FORK_DATA_EXTENT_RECORD..SIZE_FORK_DATA]),
        }
    }

    pub fn used_extents(&self) -> Vec<ExtentDescriptor> {
        self.extents.iter().take_while(|e| !e.is_empty()).cloned().collect()
    }
}

impl Display for ForkData {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        writeln!(fmt, "Logical size: {}", self.logical_size)?;
        writeln!(fmt, "Clump size: {}", self.clump_size)?;
        writeln!(fmt, "Total blocks: {}", self.total_blocks)?;
        for extent in self.used_extents() {
            writeln!(fmt, "  Extent: start {} count {}", extent.start_block, extent.block_count)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,
    pub create_date: HFSDate,
    pub modify_date: HFSDate,
    pub backup_date: HFSDate,
    pub checked_date: HFSDate,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_catalog_id: u32,
    pub write_count: u32,
    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

impl VolumeHeader {
    pub fn parse(data: &[u8]) -> fs::Result<VolumeHeader> {
        if data.len() < SIZE_VOLUME_HEADER {
            return Err(HFSPError::corrupt("volume header truncated"));
        }
        let signature = BigEndian::read_u16(&data[0..2]);
        if signature != SIGNATURE_HFS_PLUS && signature != SIGNATURE_HFSX {
            return Err(HFSPError::corrupt(format!("bad volume header signature 0x{:04X}", signature)));
        }
        let block_size = BigEndian::read_u32(&data[40..44]);
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) || !block_size.is_power_of_two() {
            return Err(HFSPError::corrupt(format!("invalid allocation block size {}", block_size)));
        }
        let fork = |index: usize| {
            let offset = OFFSET_VOLUME_HEADER_FORKS + index * SIZE_FORK_DATA;
            ForkData::parse(&data[offset..offset + SIZE_FORK_DATA])
        };
        Ok(VolumeHeader {
            signature,
            version: BigEndian::read_u16(&data[2..4]),
            attributes: BigEndian::read_u32(&data[4..8]),
            last_mounted_version: BigEndian::read_u32(&data[8..12]),
            journal_info_block: BigEndian::read_u32(&data[12..16]),
            create_date: HFSDate(BigEndian::read_u32(&data[16..20])),
            modify_date: HFSDate(BigEndian::read_u32(&data[20..24])),
            backup_date: HFSDate(BigEndian::read_u32(&data[24..28])),
            checked_date: HFSDate(BigEndian::read_u32(&data[28..32])),
            file_count: BigEndian::read_u32(&data[32..36]),
            folder_count: BigEndian::read_u32(&data[36..40]),
            block_size,
            total_blocks: BigEndian::read_u32(&data[44..48]),
            free_blocks: BigEndian::read_u32(&data[48..52]),
            next_catalog_id: BigEndian::read_u32(&data[64..68]),
            write_count: BigEndian::read_u32(&data[68..72]),
            allocation_file: fork(0),
            extents_file: fork(1),
            catalog_file: fork(2),
            attributes_file: fork(3),
            startup_file: fork(4),
        })
    }

    pub fn is_hfsx(&self) -> bool {
        self.signature == SIGNATURE_HFSX
    }

    pub fn is_journaled(&self) -> bool {
        self.attributes & ATTRIBUTE_JOURNALED != 0
    }

    pub fn was_cleanly_unmounted(&self) -> bool {
        self.attributes & ATTRIBUTE_UNMOUNTED != 0
    }

    pub fn is_software_locked(&self) -> bool {
        self.attributes & ATTRIBUTE_SOFTWARE_LOCK != 0
    }
}

impl Display for VolumeHeader {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        writeln!(fmt, "Signature: {}", if self.is_hfsx() { "HFSX" } else { "HFS+" })?;
        writeln!(fmt, "Version: {}", self.version)?;
        writeln!(fmt, "Journaled: {}", self.is_journaled())?;
        writeln!(fmt, "Cleanly unmounted: {}", self.was_cleanly_unmounted())?;
        writeln!(fmt, "Create date: {}", self.create_date)?;
        writeln!(fmt, "Modify date: {}", self.modify_date)?;
        writeln!(fmt, "Backup date: {}", self.backup_date)?;
        writeln!(fmt, "Checked date: {}", self.checked_date)?;
        writeln!(fmt, "File count: {}", self.file_count)?;
        writeln!(fmt, "Folder count: {}", self.folder_count)?;
        writeln!(fmt, "Block size: {}", self.block_size)?;
        writeln!(fmt, "Total blocks: {}", self.total_blocks)?;
        writeln!(fmt, "Free blocks: {}", self.free_blocks)?;
        writeln!(fmt, "Next catalog ID: {}", self.next_catalog_id)?;
        Ok(())
    }
}

/// Classic HFS master directory block, read only as far as needed to find
/// an embedded HFS+ volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterDirectoryBlock {
    pub volume_name: String,
    pub allocation_block_size: u32,
    /// First allocation block, in 512-byte sectors from the volume start.
    pub first_allocation_block: u16,
    pub embedded_signature: u16,
    pub embedded_start_block: u16,
    pub embedded_block_count: u16,
}

impl MasterDirectoryBlock {
    pub fn parse(data: &[u8]) -> Option<MasterDirectoryBlock> {
        if data.len() < 130 || BigEndian::read_u16(&data[0..2]) != SIGNATURE_HFS {
            return None;
        }
        let name_length = (data[36] as usize).min(27);
        Some(MasterDirectoryBlock {
            volume_name: String::from_utf8_lossy(&data[37..37 + name_length]).into_owned(),
            allocation_block_size: BigEndian::read_u32(&data[20..24]),
            first_allocation_block: BigEndian::read_u16(&data[28..30]),
            embedded_signature: BigEndian::read_u16(&data[124..126]),
            embedded_start_block: BigEndian::read_u16(&data[126..128]),
            embedded_block_count: BigEndian::read_u16(&data[128..130]),
        })
    }

    pub fn has_embedded_volume(&self) -> bool {
        self.embedded_signature == SIGNATURE_HFS_PLUS
    }

    pub fn embedded_volume_range(&self) -> (u64, u64) {
        let block_size = self.allocation_block_size as u64;
        let offset = self.first_allocation_block as u64 * MDB_SECTOR_SIZE
            + self.embedded_start_block as u64 * block_size;
        (offset, self.embedded_block_count as u64 * block_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemType {
    HfsPlus,
    Hfsx,
    Hfs,
    HfsWrappedHfsPlus,
    Mfs,
    Unknown,
}

impl FileSystemType {
    pub fn is_mountable(self) -> bool {
        matches!(self, FileSystemType::HfsPlus | FileSystemType::Hfsx)
    }
}

impl Display for FileSystemType {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        let name = match self {
            FileSystemType::HfsPlus => "HFS+",
            FileSystemType::Hfsx => "HFSX",
            FileSystemType::Hfs => "HFS",
            FileSystemType::HfsWrappedHfsPlus => "HFS+ in HFS wrapper",
            FileSystemType::Mfs => "MFS",
            FileSystemType::Unknown => "unknown",
        };
        write!(fmt, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeLocation {
    pub offset: u64,
    pub length: u64,
    pub fs_type: FileSystemType,
}

fn read_at<R>(stream: &mut R, offset: u64, buffer: &mut [u8]) -> fs::Result<()>
where
    R: Read + Seek,
{
    stream.seek(SeekFrom::Start(offset))?;
    stream.read_exact(buffer)?;
    Ok(())
}

/// Classifies the volume starting at `offset`. Never fails; unreadable data
/// is `Unknown`.
pub fn detect_file_system<R>(stream: &mut R, offset: u64) -> FileSystemType
where
    R: Read + Seek,
{
    let mut block = [0u8; SIZE_VOLUME_HEADER];
    if read_at(stream, offset + OFFSET_VOLUME_HEADER, &mut block).is_err() {
        return FileSystemType::Unknown;
    }
    match BigEndian::read_u16(&block[0..2]) {
        SIGNATURE_HFS_PLUS => FileSystemType::HfsPlus,
        SIGNATURE_HFSX => FileSystemType::Hfsx,
        SIGNATURE_MFS => FileSystemType::Mfs,
        SIGNATURE_HFS => match MasterDirectoryBlock::parse(&block) {
            Some(mdb) if mdb.has_embedded_volume() => FileSystemType::HfsWrappedHfsPlus,
            _ => FileSystemType::Hfs,
        },
        _ => FileSystemType::Unknown,
    }
}

pub fn locate_volume<R>(stream: &mut R, offset: u64, length: u64) -> Option<VolumeLocation>
where
    R: Read + Seek,
{
    let fs_type = detect_file_system(stream, offset);
    debug!("File system at offset {}: {}", offset, fs_type);
    match fs_type {
        FileSystemType::Unknown => None,
        FileSystemType::HfsWrappedHfsPlus => {
            let mut block = [0u8; SIZE_VOLUME_HEADER];
            read_at(stream, offset + OFFSET_VOLUME_HEADER, &mut block).ok()?;
            let mdb = MasterDirectoryBlock::parse(&block)?;
            let (inner_offset, inner_length) = mdb.embedded_volume_range();
            if inner_offset.checked_add(inner_length).map_or(true, |end| end > length) {
                warn!(
                    "Embedded volume ({} + {}) lies outside its wrapper of {} bytes",
                    inner_offset, inner_length, length
                );
                return None;
            }
            let inner_type = detect_file_system(stream, offset + inner_offset);
            if inner_type != FileSystemType::HfsPlus && inner_type != FileSystemType::Hfsx {
                warn!("HFS wrapper at {} embeds {} instead of HFS+", offset, inner_type);
                return None;
            }
            info!("Unwrapped {} volume at offset {}", inner_type, offset + inner_offset);
            Some(VolumeLocation {
                offset: offset + inner_offset,
                length: inner_length,
                fs_type: inner_type,
            })
        }
        fs_type => Some(VolumeLocation { offset, length, fs_type }),
    }
}

/// Finds the volume to mount on a whole device: directly, or inside the
/// selected partition, or inside the first partition holding an HFS+ or
/// HFSX volume. A classic HFS or MFS partition is returned only when no
/// partition holds a mountable one.
pub fn find_volume<R>(stream: &mut R, partition_index: Option<usize>) -> Option<VolumeLocation>
where
    R: Read + Seek,
{
    let device_length = stream.seek(SeekFrom::End(0)).ok()?;
    let system = partition::detect(stream);
    if system == PartitionSystemType::None {
        return locate_volume(stream, 0, device_length);
    }

    let entries = match partition::get_partition_system(stream, system) {
        Ok(entries) => entries,
        Err(error) => {
            warn!("Could not read {} entries: {}", system, error);
            return locate_volume(stream, 0, device_length);
        }
    };
    let within_device = |start: u64, length: u64| start.checked_add(length).map_or(false, |end| end <= device_length);

    if let Some(index) = partition_index {
        let entry = match entries.get(index) {
            Some(entry) => entry,
            None => {
                warn!("Partition {} requested but only {} present", index, entries.len());
                return None;
            }
        };
        if !within_device(entry.start, entry.length) {
            warn!("Partition {} extends past the end of the device", index);
            return None;
        }
        return locate_volume(stream, entry.start, entry.length);
    }

    // An unmountable volume is only reported when no HFS+ volume follows it.
    let mut unsupported = None;
    for entry in entries
        .iter()
        .filter(|entry| entry.is_hfs_container() && within_device(entry.start, entry.length))
    {
        match locate_volume(stream, entry.start, entry.length) {
            Some(location) if location.fs_type.is_mountable() => return Some(location),
            Some(location) => {
                info!("Skipping {} volume in partition \"{}\"", location.fs_type, entry.name);
                unsupported.get_or_insert(location);
            }
            None => {}
        }
    }
    unsupported
}
