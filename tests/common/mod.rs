//! Builds small synthetic HFS+ volumes and partitioned disk images.

#![allow(dead_code)]

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use hfsplus_explorer::catalog::{CatalogKey, HFSString, KeyCompare};
use std::cmp::Ordering;

const NODE_DESCRIPTOR_SIZE: usize = 14;
const HEADER_RECORD_SIZE: usize = 106;
const USER_DATA_RECORD_SIZE: usize = 128;

const BIG_KEYS: u32 = 0x2;
const VARIABLE_INDEX_KEYS: u32 = 0x4;

pub const SIGNATURE_HFS_PLUS: u16 = 0x482B;
pub const SIGNATURE_HFSX: u16 = 0x4858;

pub fn pattern(length: usize, seed: u8) -> Vec<u8> {
    (0..length).map(|i| ((i * 7 + seed as usize) % 253) as u8).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent {
    pub start_block: u32,
    pub block_count: u32,
}

struct TreeLayout {
    node_size: usize,
    max_key_length: u16,
    attributes: u32,
    key_compare_type: u8,
}

fn node(node_size: usize, kind: i8, height: u8, forward: u32, backward: u32, records: &[Vec<u8>]) -> Vec<u8> {
    let mut data = vec![0u8; node_size];
    BigEndian::write_u32(&mut data[0..], forward);
    BigEndian::write_u32(&mut data[4..], backward);
    data[8] = kind as u8;
    data[9] = height;
    BigEndian::write_u16(&mut data[10..], records.len() as u16);
    let mut offset = NODE_DESCRIPTOR_SIZE;
    for (index, record) in records.iter().enumerate() {
        data[offset..offset + record.len()].copy_from_slice(record);
        BigEndian::write_u16(&mut data[node_size - 2 * (index + 1)..], offset as u16);
        offset += record.len();
    }
    BigEndian::write_u16(&mut data[node_size - 2 * (records.len() + 1)..], offset as u16);
    data
}

fn fits(node_size: usize, records: &[Vec<u8>], extra: &[u8]) -> bool {
    let used: usize = records.iter().map(|r| r.len()).sum::<usize>() + extra.len();
    NODE_DESCRIPTOR_SIZE + used + 2 * (records.len() + 2) <= node_size
}

/// Splits records into node-sized groups.
fn pack(node_size: usize, records: Vec<Vec<u8>>) -> Vec<Vec<Vec<u8>>> {
    let mut groups: Vec<Vec<Vec<u8>>> = Vec::new();
    let mut current: Vec<Vec<u8>> = Vec::new();
    for record in records {
        if !current.is_empty() && !fits(node_size, &current, &record) {
            groups.push(std::mem::take(&mut current));
        }
        current.push(record);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Lays out a B-tree file from `(key, data)` records already in key order.
/// Keys include their length field.
fn build_tree(layout: &TreeLayout, records: Vec<(Vec<u8>, Vec<u8>)>) -> Vec<u8> {
    let node_size = layout.node_size;
    let leaf_count = records.len() as u32;
    let mut nodes: Vec<Vec<u8>> = vec![Vec::new()];
    let mut depth = 0u16;
    let mut root = 0u32;
    let mut first_leaf = 0u32;
    let mut last_leaf = 0u32;

    if !records.is_empty() {
        let keys: Vec<Vec<u8>> = records.iter().map(|(key, _)| key.clone()).collect();
        let leaf_records: Vec<Vec<u8>> = records.into_iter().map(|(key, data)| [key, data].concat()).collect();

        // Each level is a list of (first key, node records) groups.
        let mut level: Vec<(Vec<u8>, Vec<Vec<u8>>)> = Vec::new();
        let mut key_index = 0;
        for group in pack(node_size, leaf_records) {
            let first_key = keys[key_index].clone();
            key_index += group.len();
            level.push((first_key, group));
        }

        let mut height = 1u8;
        loop {
            let first_number = nodes.len() as u32;
            let count = level.len() as u32;
            let kind = if height == 1 { -1 } else { 0 };
            let mut parents = Vec::new();
            for (index, (first_key, group)) in level.iter().enumerate() {
                let number = first_number + index as u32;
                let forward = if index as u32 + 1 < count { number + 1 } else { 0 };
                let backward = if index > 0 { number - 1 } else { 0 };
                nodes.push(node(node_size, kind, height, forward, backward, group));
                let mut pointer = first_key.clone();
                pointer.extend_from_slice(&number.to_be_bytes());
                parents.push((first_key.clone(), pointer));
            }
            if height == 1 {
                first_leaf = first_number;
                last_leaf = first_number + count - 1;
            }
            depth = height as u16;
            if count == 1 {
                root = first_number;
                break;
            }
            let pointer_keys: Vec<Vec<u8>> = parents.iter().map(|(key, _)| key.clone()).collect();
            let pointers: Vec<Vec<u8>> = parents.into_iter().map(|(_, pointer)| pointer).collect();
            level = Vec::new();
            let mut key_index = 0;
            for group in pack(node_size, pointers) {
                let first_key = pointer_keys[key_index].clone();
                key_index += group.len();
                level.push((first_key, group));
            }
            height += 1;
        }
    }

    let mut header = vec![0u8; HEADER_RECORD_SIZE];
    BigEndian::write_u16(&mut header[0..], depth);
    BigEndian::write_u32(&mut header[2..], root);
    BigEndian::write_u32(&mut header[6..], leaf_count);
    BigEndian::write_u32(&mut header[10..], first_leaf);
    BigEndian::write_u32(&mut header[14..], last_leaf);
    BigEndian::write_u16(&mut header[18..], node_size as u16);
    BigEndian::write_u16(&mut header[20..], layout.max_key_length);
    BigEndian::write_u32(&mut header[22..], nodes.len() as u32);
    header[37] = layout.key_compare_type;
    BigEndian::write_u32(&mut header[38..], layout.attributes);
    let map_size = node_size - NODE_DESCRIPTOR_SIZE - HEADER_RECORD_SIZE - USER_DATA_RECORD_SIZE - 8;
    nodes[0] = node(
        node_size,
        1,
        0,
        0,
        0,
        &[header, vec![0u8; USER_DATA_RECORD_SIZE], vec![0u8; map_size]],
    );
    nodes.concat()
}

fn catalog_key_bytes(key: &CatalogKey) -> Vec<u8> {
    let units = key.name.units();
    let mut bytes = vec![0u8; 8 + units.len() * 2];
    BigEndian::write_u16(&mut bytes[0..], (6 + units.len() * 2) as u16);
    BigEndian::write_u32(&mut bytes[2..], key.parent_id);
    BigEndian::write_u16(&mut bytes[6..], units.len() as u16);
    for (index, unit) in units.iter().enumerate() {
        BigEndian::write_u16(&mut bytes[8 + index * 2..], *unit);
    }
    bytes
}

fn extent_key_bytes(file_id: u32, fork_type: u8, start_block: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; 12];
    BigEndian::write_u16(&mut bytes[0..], 10);
    bytes[2] = fork_type;
    BigEndian::write_u32(&mut bytes[4..], file_id);
    BigEndian::write_u32(&mut bytes[8..], start_block);
    bytes
}

fn extent_record_bytes(extents: &[Extent]) -> Vec<u8> {
    let mut bytes = vec![0u8; 64];
    for (index, extent) in extents.iter().take(8).enumerate() {
        BigEndian::write_u32(&mut bytes[index * 8..], extent.start_block);
        BigEndian::write_u32(&mut bytes[index * 8 + 4..], extent.block_count);
    }
    bytes
}

fn fork_data_bytes(logical_size: u64, extents: &[Extent]) -> Vec<u8> {
    let total: u32 = extents.iter().map(|e| e.block_count).sum();
    let mut bytes = vec![0u8; 16];
    BigEndian::write_u64(&mut bytes[0..], logical_size);
    BigEndian::write_u32(&mut bytes[12..], total);
    bytes.extend(extent_record_bytes(extents));
    bytes
}

fn thread_bytes(record_type: i16, parent_id: u32, name: &HFSString) -> Vec<u8> {
    let units = name.units();
    let mut bytes = vec![0u8; 10 + units.len() * 2];
    BigEndian::write_i16(&mut bytes[0..], record_type);
    BigEndian::write_u32(&mut bytes[4..], parent_id);
    BigEndian::write_u16(&mut bytes[8..], units.len() as u16);
    for (index, unit) in units.iter().enumerate() {
        BigEndian::write_u16(&mut bytes[10 + index * 2..], *unit);
    }
    bytes
}

fn folder_bytes(folder_id: u32, valence: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; 88];
    BigEndian::write_i16(&mut bytes[0..], 1);
    BigEndian::write_u32(&mut bytes[4..], valence);
    BigEndian::write_u32(&mut bytes[8..], folder_id);
    BigEndian::write_u32(&mut bytes[12..], 3_600_000_000);
    BigEndian::write_u16(&mut bytes[42..], 0o040755);
    bytes
}

fn file_bytes(file_id: u32, data_fork: &[u8], resource_fork: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; 88];
    BigEndian::write_i16(&mut bytes[0..], 2);
    BigEndian::write_u32(&mut bytes[8..], file_id);
    BigEndian::write_u32(&mut bytes[12..], 3_600_000_000);
    BigEndian::write_u16(&mut bytes[42..], 0o100644);
    bytes[48..52].copy_from_slice(b"TEXT");
    bytes[52..56].copy_from_slice(b"ttxt");
    bytes.extend_from_slice(data_fork);
    bytes.extend_from_slice(resource_fork);
    bytes
}

#[derive(Debug, Clone)]
pub enum Entry {
    Folder {
        id: u32,
        name: String,
        children: Vec<Entry>,
    },
    File {
        id: u32,
        name: String,
        data: Vec<u8>,
        resource: Vec<u8>,
        fragmented: bool,
    },
}

pub fn folder(id: u32, name: &str, children: Vec<Entry>) -> Entry {
    Entry::Folder {
        id,
        name: name.to_string(),
        children,
    }
}

pub fn file(id: u32, name: &str, data: Vec<u8>) -> Entry {
    Entry::File {
        id,
        name: name.to_string(),
        data,
        resource: Vec::new(),
        fragmented: false,
    }
}

/// A file whose data fork is scattered one block at a time, so that forks
/// longer than eight blocks spill into the extents overflow file.
pub fn fragmented_file(id: u32, name: &str, data: Vec<u8>) -> Entry {
    Entry::File {
        id,
        name: name.to_string(),
        data,
        resource: Vec::new(),
        fragmented: true,
    }
}

pub fn file_with_resource(id: u32, name: &str, data: Vec<u8>, resource: Vec<u8>) -> Entry {
    Entry::File {
        id,
        name: name.to_string(),
        data,
        resource,
        fragmented: false,
    }
}

pub struct VolumeBuilder {
    pub block_size: u32,
    pub hfsx: bool,
    pub binary_compare: bool,
    pub catalog_node_size: usize,
    pub volume_name: String,
    pub root: Vec<Entry>,
    pub omit_threads: Vec<u32>,
    /// Overflow records left out of the extents file, as (file id, start block).
    pub omit_overflow: Vec<(u32, u32)>,
}

impl VolumeBuilder {
    pub fn new(root: Vec<Entry>) -> VolumeBuilder {
        VolumeBuilder {
            block_size: 512,
            hfsx: false,
            binary_compare: false,
            catalog_node_size: 4096,
            volume_name: "Test Volume".to_string(),
            root,
            omit_threads: Vec::new(),
            omit_overflow: Vec::new(),
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut state = BuildState {
            block_size: self.block_size as usize,
            image: vec![0u8; 4096],
            next_block: (4096 / self.block_size) as u32,
            catalog: Vec::new(),
            overflow: Vec::new(),
            files: 0,
            folders: 0,
            max_id: 16,
        };

        let root_name = HFSString::from_name(&self.volume_name);
        state.add_catalog(CatalogKey::new(1, root_name.clone()), folder_bytes(2, self.root.len() as u32));
        if !self.omit_threads.contains(&2) {
            state.add_catalog(CatalogKey::new(2, HFSString::default()), thread_bytes(3, 1, &root_name));
        }
        for entry in &self.root {
            state.add_entry(entry, 2, &self.omit_threads);
        }

        let mut overflow = std::mem::take(&mut state.overflow);
        overflow.retain(|(file_id, fork, start, _)| *fork != 0 || !self.omit_overflow.contains(&(*file_id, *start)));
        overflow.sort_by_key(|(file_id, fork, start, _)| (*file_id, *fork, *start));
        let extents_records = overflow
            .into_iter()
            .map(|(file_id, fork, start, extents)| (extent_key_bytes(file_id, fork, start), extent_record_bytes(&extents)))
            .collect();
        let extents_tree = build_tree(
            &TreeLayout {
                node_size: 512,
                max_key_length: 10,
                attributes: BIG_KEYS,
                key_compare_type: 0,
            },
            extents_records,
        );

        let compare = KeyCompare::for_volume(self.hfsx, if self.binary_compare { 0xBC } else { 0xCF });
        let mut catalog = std::mem::take(&mut state.catalog);
        catalog.sort_by(|(a, _), (b, _)| compare.compare(a, b));
        for pair in catalog.windows(2) {
            assert_ne!(compare.compare(&pair[0].0, &pair[1].0), Ordering::Equal, "duplicate catalog key");
        }
        let catalog_records = catalog
            .into_iter()
            .map(|(key, data)| (catalog_key_bytes(&key), data))
            .collect();
        let catalog_tree = build_tree(
            &TreeLayout {
                node_size: self.catalog_node_size,
                max_key_length: 516,
                attributes: BIG_KEYS | VARIABLE_INDEX_KEYS,
                key_compare_type: if self.binary_compare { 0xBC } else { 0xCF },
            },
            catalog_records,
        );

        let extents_extents = state.allocate(&extents_tree, false);
        let catalog_extents = state.allocate(&catalog_tree, false);
        let total_blocks = state.next_block + 1;
        state.image.resize(total_blocks as usize * state.block_size, 0);

        let header = &mut state.image[1024..1536];
        BigEndian::write_u16(&mut header[0..], if self.hfsx { SIGNATURE_HFSX } else { SIGNATURE_HFS_PLUS });
        BigEndian::write_u16(&mut header[2..], if self.hfsx { 5 } else { 4 });
        BigEndian::write_u32(&mut header[4..], 1 << 8);
        BigEndian::write_u32(&mut header[16..], 3_600_000_000);
        BigEndian::write_u32(&mut header[32..], state.files);
        BigEndian::write_u32(&mut header[36..], state.folders);
        BigEndian::write_u32(&mut header[40..], self.block_size);
        BigEndian::write_u32(&mut header[44..], total_blocks);
        BigEndian::write_u32(&mut header[64..], state.max_id + 1);
        header[192..272].copy_from_slice(&fork_data_bytes(extents_tree.len() as u64, &extents_extents));
        header[272..352].copy_from_slice(&fork_data_bytes(catalog_tree.len() as u64, &catalog_extents));
        state.image
    }
}

struct BuildState {
    block_size: usize,
    image: Vec<u8>,
    next_block: u32,
    catalog: Vec<(CatalogKey, Vec<u8>)>,
    /// (file id, fork type, start block, extents)
    overflow: Vec<(u32, u8, u32, Vec<Extent>)>,
    files: u32,
    folders: u32,
    max_id: u32,
}

impl BuildState {
    fn add_catalog(&mut self, key: CatalogKey, data: Vec<u8>) {
        self.catalog.push((key, data));
    }

    fn allocate(&mut self, data: &[u8], fragmented: bool) -> Vec<Extent> {
        let blocks = (data.len() + self.block_size - 1) / self.block_size;
        let mut extents = Vec::new();
        if blocks == 0 {
            return extents;
        }
        if fragmented {
            for chunk in data.chunks(self.block_size) {
                let block = self.next_block;
                self.write_block(block, chunk);
                extents.push(Extent {
                    start_block: block,
                    block_count: 1,
                });
                // leave a hole so neighbouring blocks never merge
                self.next_block += 2;
            }
        } else {
            let block = self.next_block;
            for (index, chunk) in data.chunks(self.block_size).enumerate() {
                self.write_block(block + index as u32, chunk);
            }
            extents.push(Extent {
                start_block: block,
                block_count: blocks as u32,
            });
            self.next_block += blocks as u32;
        }
        extents
    }

    fn write_block(&mut self, block: u32, chunk: &[u8]) {
        let start = block as usize * self.block_size;
        if self.image.len() < start + self.block_size {
            self.image.resize(start + self.block_size, 0);
        }
        self.image[start..start + chunk.len()].copy_from_slice(chunk);
    }

    /// Inline fork data plus overflow records for extents past the eighth.
    fn fork(&mut self, file_id: u32, fork_type: u8, data: &[u8], fragmented: bool) -> Vec<u8> {
        let extents = self.allocate(data, fragmented);
        let mut start = extents.iter().take(8).map(|e| e.block_count).sum::<u32>();
        for chunk in extents[extents.len().min(8)..].chunks(8) {
            self.overflow.push((file_id, fork_type, start, chunk.to_vec()));
            start += chunk.iter().map(|e| e.block_count).sum::<u32>();
        }
        fork_data_bytes(data.len() as u64, &extents)
    }

    fn add_entry(&mut self, entry: &Entry, parent_id: u32, omit_threads: &[u32]) {
        match entry {
            Entry::Folder { id, name, children } => {
                let name = HFSString::from_name(name);
                self.folders += 1;
                self.max_id = self.max_id.max(*id);
                self.add_catalog(CatalogKey::new(parent_id, name.clone()), folder_bytes(*id, children.len() as u32));
                if !omit_threads.contains(id) {
                    self.add_catalog(CatalogKey::new(*id, HFSString::default()), thread_bytes(3, parent_id, &name));
                }
                for child in children {
                    self.add_entry(child, *id, omit_threads);
                }
            }
            Entry::File {
                id,
                name,
                data,
                resource,
                fragmented,
            } => {
                let name = HFSString::from_name(name);
                self.files += 1;
                self.max_id = self.max_id.max(*id);
                let data_fork = self.fork(*id, 0x00, data, *fragmented);
                let resource_fork = self.fork(*id, 0xFF, resource, false);
                self.add_catalog(
                    CatalogKey::new(parent_id, name.clone()),
                    file_bytes(*id, &data_fork, &resource_fork),
                );
                if !omit_threads.contains(id) {
                    self.add_catalog(CatalogKey::new(*id, HFSString::default()), thread_bytes(4, parent_id, &name));
                }
            }
        }
    }
}

/// The volume used by most tests: two entries in the root, one nested file.
pub fn sample_volume() -> VolumeBuilder {
    VolumeBuilder::new(vec![
        folder(20, "Documents", vec![file(22, "notes.txt", pattern(700, 3))]),
        file(21, "readme.txt", b"Read me first.\n".to_vec()),
    ])
}

const SECTOR: usize = 512;

fn put_mbr_entry(disk: &mut [u8], index: usize, status: u8, kind: u8, start: u32, count: u32) {
    let offset = 446 + index * 16;
    disk[offset] = status;
    disk[offset + 4] = kind;
    LittleEndian::write_u32(&mut disk[offset + 8..], start);
    LittleEndian::write_u32(&mut disk[offset + 12..], count);
    disk[510] = 0x55;
    disk[511] = 0xAA;
}

pub fn wrap_mbr(volume: &[u8]) -> Vec<u8> {
    let start = 63;
    let mut disk = vec![0u8; start * SECTOR];
    put_mbr_entry(&mut disk, 0, 0x80, 0xAF, start as u32, (volume.len() / SECTOR) as u32);
    disk.extend_from_slice(volume);
    disk
}

pub fn wrap_apm(volume: &[u8]) -> Vec<u8> {
    wrap_apm_volumes(&[("Macintosh HD", volume)])
}

/// An Apple Partition Map disk holding each volume in its own `Apple_HFS`
/// partition, in order, followed by a free partition.
pub fn wrap_apm_volumes(volumes: &[(&str, &[u8])]) -> Vec<u8> {
    let start = 64;
    let mut disk = vec![0u8; start * SECTOR];
    BigEndian::write_u16(&mut disk[0..], 0x4552);
    BigEndian::write_u16(&mut disk[2..], SECTOR as u16);
    let mut entries: Vec<(u32, u32, &str, &str)> = vec![(1, 63, "Apple", "Apple_partition_map")];
    let mut next = start;
    for &(name, volume) in volumes {
        entries.push((next as u32, (volume.len() / SECTOR) as u32, name, "Apple_HFS"));
        next += volume.len() / SECTOR;
    }
    entries.push((next as u32, 16, "Extra", "Apple_Free"));
    for (index, (first, count, name, kind)) in entries.iter().enumerate() {
        let block = &mut disk[(index + 1) * SECTOR..(index + 2) * SECTOR];
        BigEndian::write_u16(&mut block[0..], 0x504D);
        BigEndian::write_u32(&mut block[4..], entries.len() as u32);
        BigEndian::write_u32(&mut block[8..], *first);
        BigEndian::write_u32(&mut block[12..], *count);
        block[16..16 + name.len()].copy_from_slice(name.as_bytes());
        block[48..48 + kind.len()].copy_from_slice(kind.as_bytes());
        BigEndian::write_u32(&mut block[84..], *count);
    }
    for &(_, volume) in volumes {
        disk.extend_from_slice(volume);
    }
    disk.extend(vec![0u8; 16 * SECTOR]);
    disk
}

/// A classic HFS volume with no embedded HFS+ volume.
pub fn classic_hfs_volume() -> Vec<u8> {
    let mut volume = vec![0u8; 8192];
    BigEndian::write_u16(&mut volume[1024..], 0x4244);
    BigEndian::write_u32(&mut volume[1024 + 20..], 512);
    volume
}

/// Rewrites GPT entry `index` of an image from `wrap_gpt` and refreshes
/// both checksums.
pub fn patch_gpt_entry(disk: &mut [u8], index: usize, first_lba: u64, last_lba: u64) {
    let entries = 2 * SECTOR..2 * SECTOR + 128 * 128;
    let entry = 2 * SECTOR + index * 128;
    LittleEndian::write_u64(&mut disk[entry + 32..], first_lba);
    LittleEndian::write_u64(&mut disk[entry + 40..], last_lba);
    let entries_crc = crc32fast::hash(&disk[entries]);
    let header = &mut disk[SECTOR..2 * SECTOR];
    LittleEndian::write_u32(&mut header[88..], entries_crc);
    LittleEndian::write_u32(&mut header[16..], 0);
    let crc = crc32fast::hash(&header[..92]);
    LittleEndian::write_u32(&mut header[16..], crc);
}

const APPLE_HFS_GUID: [u8; 16] = [
    0x00, 0x53, 0x46, 0x48, 0x00, 0x00, 0xAA, 0x11, 0xAA, 0x11, 0x00, 0x30, 0x65, 0x43, 0xEC, 0xAC,
];
const EFI_SYSTEM_GUID: [u8; 16] = [
    0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B,
];

/// A GPT disk with a protective MBR, an EFI system partition and the volume.
pub fn wrap_gpt(volume: &[u8]) -> Vec<u8> {
    let efi_start = 40u64;
    let efi_sectors = 8u64;
    let hfs_start = efi_start + efi_sectors;
    let hfs_sectors = (volume.len() / SECTOR) as u64;
    let total_sectors = hfs_start + hfs_sectors + 34;
    let mut disk = vec![0u8; total_sectors as usize * SECTOR];

    put_mbr_entry(&mut disk, 0, 0x00, 0xEE, 1, (total_sectors - 1) as u32);

    let mut entries = vec![0u8; 128 * 128];
    let mut write_entry = |index: usize, guid: &[u8; 16], first: u64, last: u64, name: &str| {
        let entry = &mut entries[index * 128..(index + 1) * 128];
        entry[0..16].copy_from_slice(guid);
        entry[16] = index as u8 + 1;
        LittleEndian::write_u64(&mut entry[32..], first);
        LittleEndian::write_u64(&mut entry[40..], last);
        for (unit_index, unit) in name.encode_utf16().enumerate() {
            LittleEndian::write_u16(&mut entry[56 + unit_index * 2..], unit);
        }
    };
    write_entry(0, &EFI_SYSTEM_GUID, efi_start, efi_start + efi_sectors - 1, "EFI System Partition");
    write_entry(1, &APPLE_HFS_GUID, hfs_start, hfs_start + hfs_sectors - 1, "Customer");
    disk[2 * SECTOR..2 * SECTOR + entries.len()].copy_from_slice(&entries);

    let header = &mut disk[SECTOR..2 * SECTOR];
    header[0..8].copy_from_slice(b"EFI PART");
    LittleEndian::write_u32(&mut header[8..], 0x0001_0000);
    LittleEndian::write_u32(&mut header[12..], 92);
    LittleEndian::write_u64(&mut header[24..], 1);
    LittleEndian::write_u64(&mut header[32..], total_sectors - 1);
    LittleEndian::write_u64(&mut header[40..], 34);
    LittleEndian::write_u64(&mut header[48..], total_sectors - 34);
    LittleEndian::write_u64(&mut header[72..], 2);
    LittleEndian::write_u32(&mut header[80..], 128);
    LittleEndian::write_u32(&mut header[84..], 128);
    LittleEndian::write_u32(&mut header[88..], crc32fast::hash(&entries));
    let crc = crc32fast::hash(&header[..92]);
    LittleEndian::write_u32(&mut header[16..], crc);

    let start = hfs_start as usize * SECTOR;
    disk[start..start + volume.len()].copy_from_slice(volume);
    disk
}

/// Byte offset of the embedded volume inside images from `wrap_hfs`.
pub const WRAPPED_VOLUME_OFFSET: usize = 16 * 512 + 4 * 512;

/// Embeds the volume in a classic HFS wrapper.
pub fn wrap_hfs(volume: &[u8]) -> Vec<u8> {
    let mut disk = vec![0u8; WRAPPED_VOLUME_OFFSET];
    let mdb = &mut disk[1024..1536];
    BigEndian::write_u16(&mut mdb[0..], 0x4244);
    mdb[36] = 7;
    mdb[37..44].copy_from_slice(b"Wrapper");
    BigEndian::write_u32(&mut mdb[20..], 512);
    BigEndian::write_u16(&mut mdb[28..], 16);
    BigEndian::write_u16(&mut mdb[124..], SIGNATURE_HFS_PLUS);
    BigEndian::write_u16(&mut mdb[126..], 4);
    BigEndian::write_u16(&mut mdb[128..], (volume.len() / 512) as u16);
    disk.extend_from_slice(volume);
    disk.extend(vec![0u8; 1024]);
    disk
}
