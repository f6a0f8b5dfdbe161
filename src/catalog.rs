//! Catalog file keys, records and lookups.

use crate::btree::{BTreeFile, BTreeKey, LeafRecord, KEY_COMPARE_BINARY};
use crate::cancel::{CancellationToken, Completion};
use crate::error::HFSPError;
use crate::fs;
use crate::unicode;
use crate::volume::{ForkData, HFSDate, SIZE_FORK_DATA};
use byteorder::{BigEndian, ByteOrder};
use log::debug;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt::{self, Debug, Display, Formatter};
use std::io::{Read, Seek};

pub const ROOT_PARENT_ID: u32 = 1;
pub const ROOT_FOLDER_ID: u32 = 2;
pub const EXTENTS_FILE_ID: u32 = 3;
pub const CATALOG_FILE_ID: u32 = 4;
pub const FIRST_USER_CATALOG_ID: u32 = 16;

const RECORD_FOLDER: i16 = 1;
const RECORD_FILE: i16 = 2;
const RECORD_FOLDER_THREAD: i16 = 3;
const RECORD_FILE_THREAD: i16 = 4;

const SIZE_FOLDER_RECORD: usize = 88;
const SIZE_FILE_RECORD: usize = 248;
const OFFSET_DATA_FORK: usize = 88;
const OFFSET_RESOURCE_FORK: usize = OFFSET_DATA_FORK + SIZE_FORK_DATA;
const MAX_NAME_LENGTH: usize = 255;

const HARD_LINK_FILE_TYPE: &[u8; 4] = b"hlnk";
const HARD_LINK_CREATOR: &[u8; 4] = b"hfs+";

/// A catalog node name as stored on disk: UTF-16 code units in decomposed
/// form.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct HFSString(Vec<u16>);

impl HFSString {
    pub fn from_units(units: Vec<u16>) -> HFSString {
        HFSString(units)
    }

    pub fn from_name(name: &str) -> HFSString {
        HFSString(unicode::decompose_str(name))
    }

    pub fn units(&self) -> &[u16] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }

    fn parse(data: &[u8]) -> fs::Result<(HFSString, usize)> {
        if data.len() < 2 {
            return Err(HFSPError::corrupt("catalog name truncated"));
        }
        let length = BigEndian::read_u16(&data[0..2]) as usize;
        if length > MAX_NAME_LENGTH || 2 + length * 2 > data.len() {
            return Err(HFSPError::corrupt(format!("catalog name of {} units does not fit", length)));
        }
        let units = data[2..2 + length * 2].chunks_exact(2).map(BigEndian::read_u16).collect();
        Ok((HFSString(units), 2 + length * 2))
    }
}

impl Display for HFSString {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "{}", self.to_string_lossy())
    }
}

impl Debug for HFSString {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "{:?}", self.to_string_lossy())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CatalogKey {
    pub parent_id: u32,
    pub name: HFSString,
}

impl CatalogKey {
    pub fn new(parent_id: u32, name: HFSString) -> CatalogKey {
        CatalogKey { parent_id, name }
    }

    pub fn thread(cnid: u32) -> CatalogKey {
        CatalogKey::new(cnid, HFSString::default())
    }
}

impl BTreeKey for CatalogKey {
    fn decode(data: &[u8]) -> fs::Result<CatalogKey> {
        if data.len() < 6 {
            return Err(HFSPError::corrupt(format!("catalog key of {} bytes", data.len())));
        }
        let (name, _) = HFSString::parse(&data[4..])?;
        Ok(CatalogKey {
            parent_id: BigEndian::read_u32(&data[0..4]),
            name,
        })
    }
}

/// How catalog names are ordered. HFS+ always folds case; HFSX records its
/// choice in the catalog header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCompare {
    /// Approximates the on-disk case-insensitive order. Lowering outside
    /// ASCII uses the standard library's Unicode data, not the HFS+ fold
    /// table; see [`unicode::fold_case`] for where the two differ.
    CaseFolding,
    Binary,
}

impl KeyCompare {
    pub fn for_volume(hfsx: bool, key_compare_type: u8) -> KeyCompare {
        if hfsx && key_compare_type == KEY_COMPARE_BINARY {
            KeyCompare::Binary
        } else {
            KeyCompare::CaseFolding
        }
    }

    pub fn compare_names(self, a: &HFSString, b: &HFSString) -> Ordering {
        match self {
            KeyCompare::Binary => a.units().cmp(b.units()),
            KeyCompare::CaseFolding => unicode::compare_case_folded(a.units(), b.units()),
        }
    }

    pub fn compare(self, a: &CatalogKey, b: &CatalogKey) -> Ordering {
        a.parent_id
            .cmp(&b.parent_id)
            .then_with(|| self.compare_names(&a.name, &b.name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    /// Link count, device number or hard link inode depending on the mode.
    pub special: u32,
}

impl BsdInfo {
    fn parse(data: &[u8]) -> BsdInfo {
        BsdInfo {
            owner_id: BigEndian::read_u32(&data[0..4]),
            group_id: BigEndian::read_u32(&data[4..8]),
            admin_flags: data[8],
            owner_flags: data[9],
            file_mode: BigEndian::read_u16(&data[10..12]),
            special: BigEndian::read_u32(&data[12..16]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRecord {
    pub flags: u16,
    pub valence: u32,
    pub folder_id: u32,
    pub create_date: HFSDate,
    pub content_mod_date: HFSDate,
    pub attribute_mod_date: HFSDate,
    pub access_date: HFSDate,
    pub backup_date: HFSDate,
    pub permissions: BsdInfo,
    pub text_encoding: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub flags: u16,
    pub file_id: u32,
    pub create_date: HFSDate,
    pub content_mod_date: HFSDate,
    pub attribute_mod_date: HFSDate,
    pub access_date: HFSDate,
    pub backup_date: HFSDate,
    pub permissions: BsdInfo,
    pub file_type: [u8; 4],
    pub creator: [u8; 4],
    pub finder_flags: u16,
    pub text_encoding: u32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
}

impl FileRecord {
    pub fn is_hard_link(&self) -> bool {
        &self.file_type == HARD_LINK_FILE_TYPE && &self.creator == HARD_LINK_CREATOR
    }

    pub fn hard_link_target(&self) -> Option<u32> {
        if self.is_hard_link() {
            Some(self.permissions.special)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub parent_id: u32,
    pub name: HFSString,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRecord {
    Folder(FolderRecord),
    File(FileRecord),
    FolderThread(ThreadRecord),
    FileThread(ThreadRecord),
}

fn dates(data: &[u8]) -> [HFSDate; 5] {
    let mut dates = [HFSDate::default(); 5];
    for (index, date) in dates.iter_mut().enumerate() {
        *date = HFSDate(BigEndian::read_u32(&data[index * 4..index * 4 + 4]));
    }
    dates
}

fn four_char_code(data: &[u8]) -> [u8; 4] {
    [data[0], data[1], data[2], data[3]]
}

impl CatalogRecord {
    pub fn parse(data: &[u8]) -> fs::Result<CatalogRecord> {
        if data.len() < 2 {
            return Err(HFSPError::corrupt("catalog record truncated"));
        }
        let record_type = BigEndian::read_i16(&data[0..2]);
        let require = |size: usize| {
            if data.len() < size {
                Err(HFSPError::corrupt(format!(
                    "catalog record type {} needs {} bytes, has {}",
                    record_type,
                    size,
                    data.len()
                )))
            } else {
                Ok(())
            }
        };
        match record_type {
            RECORD_FOLDER => {
                require(SIZE_FOLDER_RECORD)?;
                let [create, content, attribute, access, backup] = dates(&data[12..32]);
                Ok(CatalogRecord::Folder(FolderRecord {
                    flags: BigEndian::read_u16(&data[2..4]),
                    valence: BigEndian::read_u32(&data[4..8]),
                    folder_id: BigEndian::read_u32(&data[8..12]),
                    create_date: create,
                    content_mod_date: content,
                    attribute_mod_date: attribute,
                    access_date: access,
                    backup_date: backup,
                    permissions: BsdInfo::parse(&data[32..48]),
                    text_encoding: BigEndian::read_u32(&data[80..84]),
                }))
            }
            RECORD_FILE => {
                require(SIZE_FILE_RECORD)?;
                let [create, content, attribute, access, backup] = dates(&data[12..32]);
                Ok(CatalogRecord::File(FileRecord {
                    flags: BigEndian::read_u16(&data[2..4]),
                    file_id: BigEndian::read_u32(&data[8..12]),
                    create_date: create,
                    content_mod_date: content,
                    attribute_mod_date: attribute,
                    access_date: access,
                    backup_date: backup,
                    permissions: BsdInfo::parse(&data[32..48]),
                    file_type: four_char_code(&data[48..52]),
                    creator: four_char_code(&data[52..56]),
                    finder_flags: BigEndian::read_u16(&data[56..58]),
                    text_encoding: BigEndian::read_u32(&data[80..84]),
                    data_fork: ForkData::parse(&data[OFFSET_DATA_FORK..OFFSET_RESOURCE_FORK]),
                    resource_fork: ForkData::parse(&data[OFFSET_RESOURCE_FORK..SIZE_FILE_RECORD]),
                }))
            }
            RECORD_FOLDER_THREAD | RECORD_FILE_THREAD => {
                require(10)?;
                let (name, _) = HFSString::parse(&data[8..])?;
                let thread = ThreadRecord {
                    parent_id: BigEndian::read_u32(&data[4..8]),
                    name,
                };
                Ok(if record_type == RECORD_FOLDER_THREAD {
                    CatalogRecord::FolderThread(thread)
                } else {
                    CatalogRecord::FileThread(thread)
                })
            }
            other => Err(HFSPError::corrupt(format!("unknown catalog record type {}", other))),
        }
    }

    pub fn is_thread(&self) -> bool {
        matches!(self, CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogLeafRecord {
    pub key: CatalogKey,
    pub record: CatalogRecord,
}

impl CatalogLeafRecord {
    fn from_leaf(leaf: LeafRecord<CatalogKey>) -> fs::Result<CatalogLeafRecord> {
        let record = CatalogRecord::parse(&leaf.data)?;
        Ok(CatalogLeafRecord { key: leaf.key, record })
    }

    pub fn name(&self) -> &HFSString {
        &self.key.name
    }

    pub fn parent_id(&self) -> u32 {
        self.key.parent_id
    }

    pub fn cnid(&self) -> u32 {
        match &self.record {
            CatalogRecord::Folder(folder) => folder.folder_id,
            CatalogRecord::File(file) => file.file_id,
            CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_) => self.key.parent_id,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.record, CatalogRecord::Folder(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.record, CatalogRecord::File(_))
    }
}

#[derive(Debug)]
pub struct CatalogFile<R> {
    tree: BTreeFile<R>,
    compare: KeyCompare,
}

impl<R> CatalogFile<R>
where
    R: Read + Seek,
{
    pub fn new(tree: BTreeFile<R>, hfsx: bool) -> CatalogFile<R> {
        let compare = KeyCompare::for_volume(hfsx, tree.header().key_compare_type);
        CatalogFile { tree, compare }
    }

    pub fn key_compare(&self) -> KeyCompare {
        self.compare
    }

    fn find(&mut self, key: &CatalogKey) -> fs::Result<Option<CatalogLeafRecord>> {
        let compare = self.compare;
        let leaf = match self.tree.descend(key, |a, b| compare.compare(a, b))? {
            Some(leaf) => leaf,
            None => return Ok(None),
        };
        match leaf
            .records
            .into_iter()
            .find(|record| compare.compare(&record.key, key) == Ordering::Equal)
        {
            Some(record) => CatalogLeafRecord::from_leaf(record).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_root(&mut self) -> fs::Result<CatalogLeafRecord> {
        let compare = self.compare;
        let search = CatalogKey::thread(ROOT_PARENT_ID);
        if let Some(leaf) = self.tree.descend(&search, |a, b| compare.compare(a, b))? {
            for record in leaf.records.into_iter().filter(|r| r.key.parent_id == ROOT_PARENT_ID) {
                let record = CatalogLeafRecord::from_leaf(record)?;
                if record.is_folder() && record.cnid() == ROOT_FOLDER_ID {
                    return Ok(record);
                }
            }
        }
        debug!("Root folder not in first leaf, following its thread");
        let root = self
            .get_by_id(ROOT_FOLDER_ID)
            .map_err(|e| match e {
                HFSPError::NotFound(message) => HFSPError::inconsistent(format!("volume has no root folder: {}", message)),
                other => other,
            })?;
        if !root.is_folder() {
            return Err(HFSPError::inconsistent("root CNID is not a folder"));
        }
        Ok(root)
    }

    pub fn get_record(&mut self, parent_id: u32, name: &str) -> fs::Result<CatalogLeafRecord> {
        self.get_record_by_name(parent_id, &HFSString::from_name(name))
    }

    pub fn get_record_by_name(&mut self, parent_id: u32, name: &HFSString) -> fs::Result<CatalogLeafRecord> {
        let key = CatalogKey::new(parent_id, HFSString::from_units(unicode::decompose_units(name.units())));
        self.find(&key)?
            .ok_or_else(|| HFSPError::NotFound(format!("\"{}\" in folder {}", name, parent_id)))
    }

    pub fn get_thread(&mut self, cnid: u32) -> fs::Result<ThreadRecord> {
        let record = self
            .find(&CatalogKey::thread(cnid))?
            .ok_or_else(|| HFSPError::NotFound(format!("thread record for CNID {}", cnid)))?;
        match record.record {
            CatalogRecord::FolderThread(thread) | CatalogRecord::FileThread(thread) => Ok(thread),
            _ => Err(HFSPError::corrupt(format!("record keyed as thread of {} is not a thread", cnid))),
        }
    }

    pub fn get_by_id(&mut self, cnid: u32) -> fs::Result<CatalogLeafRecord> {
        let thread = self.get_thread(cnid)?;
        self.get_record_by_name(thread.parent_id, &thread.name)
    }

    pub fn list_children(
        &mut self,
        folder_id: u32,
        cancel: Option<&CancellationToken>,
    ) -> fs::Result<Completion<Vec<CatalogLeafRecord>>> {
        let records = self
            .tree
            .collect_children(|key: &CatalogKey| key.parent_id.cmp(&folder_id), cancel)?;
        let cancelled = records.is_cancelled();
        let mut children = Vec::new();
        for leaf in records.into_inner() {
            let record = CatalogLeafRecord::from_leaf(leaf)?;
            if !record.record.is_thread() {
                children.push(record);
            }
        }
        Ok(if cancelled {
            Completion::Cancelled(children)
        } else {
            Completion::Complete(children)
        })
    }

    /// The chain of records from the root folder down to `record`,
    /// inclusive. Every ancestor must have a thread record.
    pub fn resolve_path_to_root(&mut self, record: &CatalogLeafRecord) -> fs::Result<Vec<CatalogLeafRecord>> {
        let mut path = vec![record.clone()];
        let mut visited = HashSet::new();
        let mut parent_id = record.parent_id();
        while parent_id != ROOT_PARENT_ID {
            if !visited.insert(parent_id) {
                return Err(HFSPError::corrupt(format!("parent chain of CNID {} loops", record.cnid())));
            }
            let thread = self.get_thread(parent_id).map_err(|e| match e {
                HFSPError::NotFound(_) => {
                    HFSPError::inconsistent(format!("missing thread record for ancestor CNID {}", parent_id))
                }
                other => other,
            })?;
            let parent = self.get_record_by_name(thread.parent_id, &thread.name).map_err(|e| match e {
                HFSPError::NotFound(_) => HFSPError::inconsistent(format!(
                    "thread of CNID {} names \"{}\" in folder {}, which does not exist",
                    parent_id, thread.name, thread.parent_id
                )),
                other => other,
            })?;
            parent_id = parent.parent_id();
            path.insert(0, parent);
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(text: &str) -> HFSString {
        HFSString::from_name(text)
    }

    fn thread_bytes(record_type: i16, parent_id: u32, text: &str) -> Vec<u8> {
        let units: Vec<u16> = text.encode_utf16().collect();
        let mut data = vec![0u8; 10 + units.len() * 2];
        BigEndian::write_i16(&mut data[0..], record_type);
        BigEndian::write_u32(&mut data[4..], parent_id);
        BigEndian::write_u16(&mut data[8..], units.len() as u16);
        for (index, unit) in units.iter().enumerate() {
            BigEndian::write_u16(&mut data[10 + index * 2..], *unit);
        }
        data
    }

    #[test]
    fn test_decode_key() {
        let data = [0, 0, 0, 20, 0, 2, 0, 0x61, 0, 0x62];
        let key = CatalogKey::decode(&data).unwrap();
        assert_eq!(key.parent_id, 20);
        assert_eq!(key.name.to_string_lossy(), "ab");
        assert!(CatalogKey::decode(&[0, 0, 0, 20, 0, 9, 0, 0x61]).is_err());
    }

    #[test]
    fn test_parent_id_orders_first() {
        let compare = KeyCompare::CaseFolding;
        let a = CatalogKey::new(2, name("zebra"));
        let b = CatalogKey::new(3, name("apple"));
        assert_eq!(compare.compare(&a, &b), Ordering::Less);
        assert_eq!(compare.compare(&CatalogKey::thread(3), &b), Ordering::Less);
    }

    #[test]
    fn test_case_sensitivity_follows_volume() {
        let upper = CatalogKey::new(2, name("Readme"));
        let lower = CatalogKey::new(2, name("readme"));
        assert_eq!(KeyCompare::for_volume(false, KEY_COMPARE_BINARY), KeyCompare::CaseFolding);
        assert_eq!(KeyCompare::CaseFolding.compare(&upper, &lower), Ordering::Equal);
        let binary = KeyCompare::for_volume(true, KEY_COMPARE_BINARY);
        assert_eq!(binary, KeyCompare::Binary);
        assert_eq!(binary.compare(&upper, &lower), Ordering::Less);
    }

    #[test]
    fn test_names_are_decomposed() {
        assert_eq!(name("é").units(), &[0x0065, 0x0301]);
        assert_eq!(name("é"), name("e\u{301}"));
    }

    #[test]
    fn test_parse_threads() {
        let record = CatalogRecord::parse(&thread_bytes(RECORD_FOLDER_THREAD, 1, "Macintosh HD")).unwrap();
        assert_eq!(
            record,
            CatalogRecord::FolderThread(ThreadRecord {
                parent_id: 1,
                name: name("Macintosh HD"),
            })
        );
        assert!(record.is_thread());
        let record = CatalogRecord::parse(&thread_bytes(RECORD_FILE_THREAD, 20, "a")).unwrap();
        assert!(matches!(record, CatalogRecord::FileThread(ThreadRecord { parent_id: 20, .. })));
    }

    #[test]
    fn test_parse_file_record() {
        let mut data = vec![0u8; SIZE_FILE_RECORD];
        BigEndian::write_i16(&mut data[0..], RECORD_FILE);
        BigEndian::write_u32(&mut data[8..], 21);
        BigEndian::write_u16(&mut data[42..], 0o100644);
        data[48..52].copy_from_slice(b"TEXT");
        data[52..56].copy_from_slice(b"ttxt");
        BigEndian::write_u64(&mut data[OFFSET_DATA_FORK..], 1234);
        BigEndian::write_u32(&mut data[OFFSET_DATA_FORK + 12..], 1);
        BigEndian::write_u32(&mut data[OFFSET_DATA_FORK + 16..], 50);
        BigEndian::write_u32(&mut data[OFFSET_DATA_FORK + 20..], 1);
        match CatalogRecord::parse(&data).unwrap() {
            CatalogRecord::File(file) => {
                assert_eq!(file.file_id, 21);
                assert_eq!(&file.file_type, b"TEXT");
                assert_eq!(file.permissions.file_mode, 0o100644);
                assert_eq!(file.data_fork.logical_size, 1234);
                assert_eq!(file.data_fork.used_extents().len(), 1);
                assert_eq!(file.resource_fork.logical_size, 0);
                assert!(!file.is_hard_link());
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_hard_link_detection() {
        let mut data = vec![0u8; SIZE_FILE_RECORD];
        BigEndian::write_i16(&mut data[0..], RECORD_FILE);
        BigEndian::write_u32(&mut data[44..], 77);
        data[48..52].copy_from_slice(HARD_LINK_FILE_TYPE);
        data[52..56].copy_from_slice(HARD_LINK_CREATOR);
        match CatalogRecord::parse(&data).unwrap() {
            CatalogRecord::File(file) => assert_eq!(file.hard_link_target(), Some(77)),
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_rejects_short_and_unknown_records() {
        let mut data = vec![0u8; 40];
        BigEndian::write_i16(&mut data[0..], RECORD_FOLDER);
        assert!(matches!(CatalogRecord::parse(&data), Err(HFSPError::CorruptStructure(_))));
        BigEndian::write_i16(&mut data[0..], 9);
        assert!(matches!(CatalogRecord::parse(&data), Err(HFSPError::CorruptStructure(_))));
    }
}
