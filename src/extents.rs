//! Extents overflow file lookups and reconciliation of a fork's full extent
//! list.

use crate::btree::{BTreeFile, BTreeKey};
use crate::error::HFSPError;
use crate::fs;
use crate::volume::{parse_extent_record, ExtentDescriptor, ForkData, EXTENTS_PER_RECORD, SIZE_EXTENT_RECORD};
use byteorder::{BigEndian, ByteOrder};
use log::debug;
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::io::{Read, Seek};

const EXTENT_KEY_LENGTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ForkType {
    Data,
    Resource,
}

impl ForkType {
    pub fn from_raw(raw: u8) -> Option<ForkType> {
        match raw {
            0x00 => Some(ForkType::Data),
            0xFF => Some(ForkType::Resource),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            ForkType::Data => 0x00,
            ForkType::Resource => 0xFF,
        }
    }
}

impl Display for ForkType {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            ForkType::Data => write!(fmt, "data"),
            ForkType::Resource => write!(fmt, "resource"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtentKey {
    pub fork_type: ForkType,
    pub file_id: u32,
    pub start_block: u32,
}

impl ExtentKey {
    pub fn new(file_id: u32, fork_type: ForkType, start_block: u32) -> ExtentKey {
        ExtentKey {
            fork_type,
            file_id,
            start_block,
        }
    }
}

impl Ord for ExtentKey {
    fn cmp(&self, other: &ExtentKey) -> Ordering {
        self.file_id
            .cmp(&other.file_id)
            .then(self.fork_type.cmp(&other.fork_type))
            .then(self.start_block.cmp(&other.start_block))
    }
}

impl PartialOrd for ExtentKey {
    fn partial_cmp(&self, other: &ExtentKey) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl BTreeKey for ExtentKey {
    fn decode(data: &[u8]) -> fs::Result<ExtentKey> {
        if data.len() < EXTENT_KEY_LENGTH {
            return Err(HFSPError::corrupt(format!("extent key of {} bytes", data.len())));
        }
        let fork_type = ForkType::from_raw(data[0])
            .ok_or_else(|| HFSPError::corrupt(format!("unknown fork type 0x{:02X}", data[0])))?;
        Ok(ExtentKey {
            fork_type,
            file_id: BigEndian::read_u32(&data[2..6]),
            start_block: BigEndian::read_u32(&data[6..10]),
        })
    }
}

pub trait ExtentsOverflow {
    /// The overflow record starting at fork-relative block `start_block`.
    /// `NotFound` means the fork has no such record.
    fn get_overflow_extent(
        &mut self,
        file_id: u32,
        fork_type: ForkType,
        start_block: u32,
    ) -> fs::Result<[ExtentDescriptor; EXTENTS_PER_RECORD]>;
}

#[derive(Debug)]
pub struct ExtentsFile<R> {
    tree: BTreeFile<R>,
}

impl<R> ExtentsFile<R>
where
    R: Read + Seek,
{
    pub fn new(tree: BTreeFile<R>) -> ExtentsFile<R> {
        ExtentsFile { tree }
    }
}

impl<R> ExtentsOverflow for ExtentsFile<R>
where
    R: Read + Seek,
{
    fn get_overflow_extent(
        &mut self,
        file_id: u32,
        fork_type: ForkType,
        start_block: u32,
    ) -> fs::Result<[ExtentDescriptor; EXTENTS_PER_RECORD]> {
        let key = ExtentKey::new(file_id, fork_type, start_block);
        debug!("Looking up overflow extents for {:?}", key);
        let not_found = || {
            HFSPError::NotFound(format!(
                "no overflow extents for file {} {} fork at block {}",
                file_id, fork_type, start_block
            ))
        };
        let leaf = self.tree.descend(&key, ExtentKey::cmp)?.ok_or_else(not_found)?;
        let record = leaf.records.into_iter().find(|record| record.key == key).ok_or_else(not_found)?;
        if record.data.len() < SIZE_EXTENT_RECORD {
            return Err(HFSPError::corrupt(format!(
                "extent record of {} bytes in node {}",
                record.data.len(),
                leaf.number
            )));
        }
        Ok(parse_extent_record(&record.data))
    }
}

fn block_total(extents: &[ExtentDescriptor]) -> u64 {
    extents.iter().map(|extent| extent.block_count as u64).sum()
}

/// Every extent of a fork in order: the inline descriptors followed by as
/// many overflow records as it takes to cover the fork's declared block
/// count.
pub fn get_all_extent_descriptors<O>(
    overflow: &mut O,
    file_id: u32,
    fork: &ForkData,
    fork_type: ForkType,
) -> fs::Result<Vec<ExtentDescriptor>>
where
    O: ExtentsOverflow + ?Sized,
{
    let mut extents = fork.used_extents();
    let mut covered = block_total(&extents);
    let total = fork.total_blocks as u64;
    while covered < total {
        let record = match overflow.get_overflow_extent(file_id, fork_type, covered as u32) {
            Ok(record) => record,
            Err(HFSPError::NotFound(_)) => {
                return Err(HFSPError::inconsistent(format!(
                    "{} fork of file {} declares {} blocks but its extents end after {}",
                    fork_type, file_id, total, covered
                )))
            }
            Err(error) => return Err(error),
        };
        let added: Vec<ExtentDescriptor> = record.iter().take_while(|e| !e.is_empty()).cloned().collect();
        let added_blocks = block_total(&added);
        if added_blocks == 0 {
            return Err(HFSPError::inconsistent(format!(
                "empty overflow record for file {} at block {}",
                file_id, covered
            )));
        }
        covered += added_blocks;
        extents.extend(added);
    }
    Ok(extents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct CountingOverflow {
        records: HashMap<(u32, ForkType, u32), [ExtentDescriptor; EXTENTS_PER_RECORD]>,
        lookups: usize,
    }

    impl ExtentsOverflow for CountingOverflow {
        fn get_overflow_extent(
            &mut self,
            file_id: u32,
            fork_type: ForkType,
            start_block: u32,
        ) -> fs::Result<[ExtentDescriptor; EXTENTS_PER_RECORD]> {
            self.lookups += 1;
            self.records
                .get(&(file_id, fork_type, start_block))
                .copied()
                .ok_or_else(|| HFSPError::NotFound(format!("{}", start_block)))
        }
    }

    fn extent(start_block: u32, block_count: u32) -> ExtentDescriptor {
        ExtentDescriptor { start_block, block_count }
    }

    fn record(extents: &[ExtentDescriptor]) -> [ExtentDescriptor; EXTENTS_PER_RECORD] {
        let mut record = [ExtentDescriptor::default(); EXTENTS_PER_RECORD];
        record[..extents.len()].copy_from_slice(extents);
        record
    }

    fn fragmented_fork(total_blocks: u32) -> ForkData {
        let inline: Vec<ExtentDescriptor> = (0..8).map(|i| extent(100 + 2 * i, 1)).collect();
        ForkData {
            logical_size: total_blocks as u64 * 512,
            clump_size: 0,
            total_blocks,
            extents: record(&inline),
        }
    }

    fn overflow() -> CountingOverflow {
        let mut overflow = CountingOverflow::default();
        let second: Vec<ExtentDescriptor> = (0..8).map(|i| extent(200 + 2 * i, 1)).collect();
        overflow.records.insert((30, ForkType::Data, 8), record(&second));
        overflow.records.insert((30, ForkType::Data, 16), record(&[extent(300, 4)]));
        overflow
    }

    #[test]
    fn test_inline_extents_need_no_lookup() {
        let mut overflow = overflow();
        let extents = get_all_extent_descriptors(&mut overflow, 30, &fragmented_fork(8), ForkType::Data).unwrap();
        assert_eq!(extents.len(), 8);
        assert_eq!(overflow.lookups, 0);
    }

    #[test]
    fn test_overflow_lookups_reach_declared_total() {
        let mut overflow = overflow();
        let extents = get_all_extent_descriptors(&mut overflow, 30, &fragmented_fork(20), ForkType::Data).unwrap();
        assert_eq!(overflow.lookups, 2);
        assert_eq!(extents.len(), 17);
        assert_eq!(block_total(&extents), 20);
        assert_eq!(extents[8], extent(200, 1));
        assert_eq!(extents[16], extent(300, 4));
    }

    #[test]
    fn test_truncated_overflow_chain_is_inconsistent() {
        let mut overflow = overflow();
        overflow.records.remove(&(30, ForkType::Data, 16));
        let result = get_all_extent_descriptors(&mut overflow, 30, &fragmented_fork(20), ForkType::Data);
        assert!(matches!(result, Err(HFSPError::Inconsistent(_))));
    }

    #[test]
    fn test_overflow_is_per_fork() {
        let mut overflow = overflow();
        let result = get_all_extent_descriptors(&mut overflow, 30, &fragmented_fork(20), ForkType::Resource);
        assert!(matches!(result, Err(HFSPError::Inconsistent(_))));
        assert_eq!(overflow.lookups, 1);
    }

    #[test]
    fn test_key_order() {
        let a = ExtentKey::new(5, ForkType::Resource, 0);
        let b = ExtentKey::new(6, ForkType::Data, 0);
        let c = ExtentKey::new(5, ForkType::Data, 100);
        assert!(a < b);
        assert!(c < a);
        assert_eq!(
            ExtentKey::decode(&[0xFF, 0, 0, 0, 0, 5, 0, 0, 0, 9]).unwrap(),
            ExtentKey::new(5, ForkType::Resource, 9)
        );
        assert!(ExtentKey::decode(&[0x12, 0, 0, 0, 0, 5, 0, 0, 0, 9]).is_err());
    }
}
