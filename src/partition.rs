//! Partition system detection for Apple Partition Map, MBR and GPT disks.
//!
//! Detection never fails: unreadable or unrecognised data simply yields
//! `PartitionSystemType::None`. Materialising the entries of a detected
//! system can fail on I/O or on a corrupt GPT entry array.

use crate::error::HFSPError;
use crate::fs;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{debug, info, warn};
use std::fmt::{self, Display, Formatter};
use std::io::{Read, Seek, SeekFrom};

const SECTOR_SIZE: u64 = 512;

const DDR_SIGNATURE: u16 = 0x4552; // "ER"
const PM_SIGNATURE: u16 = 0x504D; // "PM"
const MAX_APM_ENTRIES: u64 = 256;

const MBR_SIGNATURE: u16 = 0x55AA;
const MBR_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_MIN_HEADER_SIZE: usize = 92;
const GPT_MAX_ENTRIES: u32 = 1024;
const GPT_MIN_ENTRY_SIZE: u32 = 128;

const GUID_APPLE_HFS: [u8; 16] = [
    0x00, 0x53, 0x46, 0x48, 0x00, 0x00, 0xAA, 0x11, 0xAA, 0x11, 0x00, 0x30, 0x65, 0x43, 0xEC, 0xAC,
];
const GUID_EFI_SYSTEM: [u8; 16] = [
    0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionSystemType {
    ApplePartitionMap,
    MasterBootRecord,
    GuidPartitionTable,
    None,
}

impl Display for PartitionSystemType {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        let name = match self {
            PartitionSystemType::ApplePartitionMap => "Apple Partition Map",
            PartitionSystemType::MasterBootRecord => "Master Boot Record",
            PartitionSystemType::GuidPartitionTable => "GUID Partition Table",
            PartitionSystemType::None => "none",
        };
        write!(fmt, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    /// Holds an HFS, HFS+ or HFSX volume.
    AppleHfs,
    ApplePartitionMap,
    AppleDriver,
    AppleFree,
    EfiSystem,
    GptProtective,
    Empty,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub partition_type: PartitionType,
    /// The type as recorded on disk: APM type string, MBR type byte or GPT
    /// type GUID.
    pub type_tag: String,
    pub start: u64,
    pub length: u64,
    pub name: String,
}

impl PartitionEntry {
    pub fn is_hfs_container(&self) -> bool {
        self.partition_type == PartitionType::AppleHfs
    }
}

impl Display for PartitionEntry {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(
            fmt,
            "{:<24} {:<40} start {:>14} length {:>14}",
            self.name, self.type_tag, self.start, self.length
        )
    }
}

/// Sniffs the partition system of a raw device. APM is checked first, then
/// GPT, then MBR, so a GPT disk's protective MBR never masks the GPT.
pub fn detect<R>(stream: &mut R) -> PartitionSystemType
where
    R: Read + Seek,
{
    let mut first = [0u8; SECTOR_SIZE as usize];
    let mut second = [0u8; SECTOR_SIZE as usize];
    if read_block(stream, 0, &mut first).is_err() || read_block(stream, SECTOR_SIZE, &mut second).is_err() {
        debug!("Stream too short for partition detection");
        return PartitionSystemType::None;
    }

    let result = if is_apm(stream, &first, &second) {
        PartitionSystemType::ApplePartitionMap
    } else if gpt_header_valid(&second) {
        PartitionSystemType::GuidPartitionTable
    } else if mbr_valid(&first) {
        PartitionSystemType::MasterBootRecord
    } else {
        PartitionSystemType::None
    };
    info!("Detected partition system: {}", result);
    result
}

pub fn get_partition_system<R>(stream: &mut R, system: PartitionSystemType) -> fs::Result<Vec<PartitionEntry>>
where
    R: Read + Seek,
{
    match system {
        PartitionSystemType::ApplePartitionMap => read_apm(stream),
        PartitionSystemType::MasterBootRecord => read_mbr(stream),
        PartitionSystemType::GuidPartitionTable => read_gpt(stream),
        PartitionSystemType::None => Ok(Vec::new()),
    }
}

fn read_block<R>(stream: &mut R, offset: u64, buffer: &mut [u8]) -> fs::Result<()>
where
    R: Read + Seek,
{
    stream.seek(SeekFrom::Start(offset))?;
    stream.read_exact(buffer)?;
    Ok(())
}

fn ascii_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

// Apple Partition Map

fn apm_block_size(ddr: &[u8]) -> Option<u64> {
    if BigEndian::read_u16(&ddr[0..2]) != DDR_SIGNATURE {
        return None;
    }
    let block_size = BigEndian::read_u16(&ddr[2..4]) as u64;
    if block_size == 0 || block_size % SECTOR_SIZE != 0 {
        return None;
    }
    Some(block_size)
}

fn is_apm<R>(stream: &mut R, first: &[u8], second: &[u8]) -> bool
where
    R: Read + Seek,
{
    let block_size = match apm_block_size(first) {
        Some(block_size) => block_size,
        None => return false,
    };
    if block_size == SECTOR_SIZE {
        return BigEndian::read_u16(&second[0..2]) == PM_SIGNATURE;
    }
    let mut signature = [0u8; 2];
    read_block(stream, block_size, &mut signature).is_ok() && BigEndian::read_u16(&signature) == PM_SIGNATURE
}

#[derive(Debug, Clone)]
struct ApmEntry {
    map_entries: u32,
    physical_start: u32,
    name: String,
    type_name: String,
    logical_start: u32,
    data_count: u32,
}

impl ApmEntry {
    fn parse(block: &[u8]) -> Option<ApmEntry> {
        if BigEndian::read_u16(&block[0..2]) != PM_SIGNATURE {
            return None;
        }
        Some(ApmEntry {
            map_entries: BigEndian::read_u32(&block[4..8]),
            physical_start: BigEndian::read_u32(&block[8..12]),
            name: ascii_field(&block[16..48]),
            type_name: ascii_field(&block[48..80]),
            logical_start: BigEndian::read_u32(&block[80..84]),
            data_count: BigEndian::read_u32(&block[84..88]),
        })
    }

    fn partition_type(&self) -> PartitionType {
        match self.type_name.as_str() {
            "Apple_HFS" | "Apple_HFSX" => PartitionType::AppleHfs,
            "Apple_partition_map" => PartitionType::ApplePartitionMap,
            "Apple_Free" => PartitionType::AppleFree,
            "" => PartitionType::Empty,
            other if other.starts_with("Apple_Driver") => PartitionType::AppleDriver,
            _ => PartitionType::Other,
        }
    }
}

fn read_apm<R>(stream: &mut R) -> fs::Result<Vec<PartitionEntry>>
where
    R: Read + Seek,
{
    let mut ddr = [0u8; SECTOR_SIZE as usize];
    read_block(stream, 0, &mut ddr)?;
    let block_size = apm_block_size(&ddr)
        .ok_or_else(|| HFSPError::corrupt("missing Apple Partition Map driver descriptor"))?;

    let mut block = vec![0u8; block_size as usize];
    let mut result = Vec::new();
    let mut limit = MAX_APM_ENTRIES;
    let mut index = 1;
    while index <= limit {
        if read_block(stream, index * block_size, &mut block).is_err() {
            break;
        }
        let entry = match ApmEntry::parse(&block) {
            Some(entry) => entry,
            None => break,
        };
        if index == 1 {
            limit = (entry.map_entries as u64).clamp(1, MAX_APM_ENTRIES);
        } else if entry.map_entries as u64 != limit {
            warn!("APM entry {} claims {} map entries, expected {}", index, entry.map_entries, limit);
        }
        let partition_type = entry.partition_type();
        if partition_type != PartitionType::Empty {
            let start = (entry.physical_start as u64 + entry.logical_start as u64) * block_size;
            result.push(PartitionEntry {
                partition_type,
                type_tag: entry.type_name.clone(),
                start,
                length: entry.data_count as u64 * block_size,
                name: entry.name.clone(),
            });
        }
        index += 1;
    }
    debug!("Read {} APM entries", result.len());
    Ok(result)
}

// Master Boot Record

fn mbr_valid(block: &[u8]) -> bool {
    if BigEndian::read_u16(&block[510..512]) != MBR_SIGNATURE {
        return false;
    }
    (0..4).all(|index| {
        let status = block[MBR_TABLE_OFFSET + index * MBR_ENTRY_SIZE];
        status == 0x00 || status == 0x80
    })
}

fn mbr_partition_type(type_byte: u8) -> PartitionType {
    match type_byte {
        0x00 => PartitionType::Empty,
        0xAF => PartitionType::AppleHfs,
        0xEE => PartitionType::GptProtective,
        0xEF => PartitionType::EfiSystem,
        _ => PartitionType::Other,
    }
}

fn read_mbr<R>(stream: &mut R) -> fs::Result<Vec<PartitionEntry>>
where
    R: Read + Seek,
{
    let mut block = [0u8; SECTOR_SIZE as usize];
    read_block(stream, 0, &mut block)?;
    if !mbr_valid(&block) {
        return Err(HFSPError::corrupt("invalid master boot record"));
    }

    let mut result = Vec::new();
    for index in 0..4 {
        let entry = &block[MBR_TABLE_OFFSET + index * MBR_ENTRY_SIZE..][..MBR_ENTRY_SIZE];
        let type_byte = entry[4];
        let lba_start = LittleEndian::read_u32(&entry[8..12]) as u64;
        let lba_count = LittleEndian::read_u32(&entry[12..16]) as u64;
        let partition_type = mbr_partition_type(type_byte);
        if partition_type == PartitionType::Empty || lba_count == 0 {
            continue;
        }
        result.push(PartitionEntry {
            partition_type,
            type_tag: format!("0x{:02X}", type_byte),
            start: lba_start * SECTOR_SIZE,
            length: lba_count * SECTOR_SIZE,
            name: format!("Partition {}", index + 1),
        });
    }
    Ok(result)
}

// GUID Partition Table

#[derive(Debug, Clone)]
struct GptHeader {
    entries_lba: u64,
    entry_count: u32,
    entry_size: u32,
    entries_crc: u32,
}

fn gpt_header(block: &[u8]) -> Option<GptHeader> {
    if &block[0..8] != GPT_SIGNATURE {
        return None;
    }
    let header_size = LittleEndian::read_u32(&block[12..16]) as usize;
    if header_size < GPT_MIN_HEADER_SIZE || header_size > block.len() {
        return None;
    }
    let stored_crc = LittleEndian::read_u32(&block[16..20]);
    let mut header = block[..header_size].to_vec();
    header[16..20].copy_from_slice(&[0, 0, 0, 0]);
    let computed_crc = crc32fast::hash(&header);
    if computed_crc != stored_crc {
        warn!("GPT header CRC mismatch: stored {:08X}, computed {:08X}", stored_crc, computed_crc);
        return None;
    }
    Some(GptHeader {
        entries_lba: LittleEndian::read_u64(&block[72..80]),
        entry_count: LittleEndian::read_u32(&block[80..84]),
        entry_size: LittleEndian::read_u32(&block[84..88]),
        entries_crc: LittleEndian::read_u32(&block[88..92]),
    })
}

fn gpt_header_valid(block: &[u8]) -> bool {
    gpt_header(block).is_some()
}

/// Formats an on-disk GUID in its textual form. The first three groups are
/// stored little-endian.
pub fn format_guid(bytes: &[u8]) -> String {
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        LittleEndian::read_u32(&bytes[0..4]),
        LittleEndian::read_u16(&bytes[4..6]),
        LittleEndian::read_u16(&bytes[6..8]),
        bytes[8],
        bytes[9],
        bytes[10],
        bytes[11],
        bytes[12],
        bytes[13],
        bytes[14],
        bytes[15]
    )
}

fn gpt_partition_type(guid: &[u8]) -> PartitionType {
    if guid.iter().all(|&b| b == 0) {
        PartitionType::Empty
    } else if guid == GUID_APPLE_HFS {
        PartitionType::AppleHfs
    } else if guid == GUID_EFI_SYSTEM {
        PartitionType::EfiSystem
    } else {
        PartitionType::Other
    }
}

fn read_gpt<R>(stream: &mut R) -> fs::Result<Vec<PartitionEntry>>
where
    R: Read + Seek,
{
    let mut block = [0u8; SECTOR_SIZE as usize];
    read_block(stream, SECTOR_SIZE, &mut block)?;
    let header = gpt_header(&block).ok_or_else(|| HFSPError::corrupt("invalid GPT header"))?;
    if header.entry_count > GPT_MAX_ENTRIES || header.entry_size < GPT_MIN_ENTRY_SIZE || header.entry_size > 4096 {
        return Err(HFSPError::corrupt(format!(
            "unreasonable GPT entry array: {} entries of {} bytes",
            header.entry_count, header.entry_size
        )));
    }

    let entry_size = header.entry_size as usize;
    let mut table = vec![0u8; header.entry_count as usize * entry_size];
    let table_offset = header
        .entries_lba
        .checked_mul(SECTOR_SIZE)
        .ok_or_else(|| HFSPError::corrupt("GPT entry array offset overflows"))?;
    read_block(stream, table_offset, &mut table)?;
    if crc32fast::hash(&table) != header.entries_crc {
        return Err(HFSPError::corrupt("GPT partition entry array CRC mismatch"));
    }

    let mut result = Vec::new();
    for entry in table.chunks_exact(entry_size) {
        let type_guid = &entry[0..16];
        let partition_type = gpt_partition_type(type_guid);
        if partition_type == PartitionType::Empty {
            continue;
        }
        let first_lba = LittleEndian::read_u64(&entry[32..40]);
        let last_lba = LittleEndian::read_u64(&entry[40..48]);
        let start = first_lba.checked_mul(SECTOR_SIZE);
        let length = last_lba
            .checked_sub(first_lba)
            .and_then(|sectors| sectors.checked_add(1))
            .and_then(|sectors| sectors.checked_mul(SECTOR_SIZE));
        let (start, length) = match (start, length) {
            (Some(start), Some(length)) if start.checked_add(length).is_some() => (start, length),
            _ => {
                return Err(HFSPError::corrupt(format!(
                    "GPT entry spans LBA {} to {}",
                    first_lba, last_lba
                )))
            }
        };
        let name_units: Vec<u16> = entry[56..128]
            .chunks_exact(2)
            .map(LittleEndian::read_u16)
            .take_while(|&unit| unit != 0)
            .collect();
        result.push(PartitionEntry {
            partition_type,
            type_tag: format_guid(type_guid),
            start,
            length,
            name: String::from_utf16_lossy(&name_units),
        });
    }
    Ok(result)
}
