//! Generic B-tree node decoding and key-guided traversal shared by the
//! catalog and extents overflow files.

use crate::cancel::{self, CancellationToken, Completion};
use crate::error::HFSPError;
use crate::fs;
use byteorder::{BigEndian, ByteOrder};
use log::debug;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Debug;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

pub const NODE_DESCRIPTOR_SIZE: usize = 14;
const HEADER_RECORD_SIZE: usize = 106;

pub const MAX_DESCENT_DEPTH: usize = 64;

pub const ATTRIBUTE_BAD_CLOSE: u32 = 0x0000_0001;
pub const ATTRIBUTE_BIG_KEYS: u32 = 0x0000_0002;
pub const ATTRIBUTE_VARIABLE_INDEX_KEYS: u32 = 0x0000_0004;

pub const KEY_COMPARE_CASE_FOLDING: u8 = 0xCF;
pub const KEY_COMPARE_BINARY: u8 = 0xBC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Index,
    Header,
    Map,
}

impl NodeKind {
    fn from_raw(raw: i8) -> Option<NodeKind> {
        match raw {
            -1 => Some(NodeKind::Leaf),
            0 => Some(NodeKind::Index),
            1 => Some(NodeKind::Header),
            2 => Some(NodeKind::Map),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub forward_link: u32,
    pub backward_link: u32,
    pub kind: NodeKind,
    pub height: u8,
    pub num_records: u16,
}

impl NodeDescriptor {
    pub fn parse(data: &[u8]) -> fs::Result<NodeDescriptor> {
        if data.len() < NODE_DESCRIPTOR_SIZE {
            return Err(HFSPError::corrupt("node descriptor truncated"));
        }
        let raw_kind = data[8] as i8;
        let kind = NodeKind::from_raw(raw_kind)
            .ok_or_else(|| HFSPError::corrupt(format!("unknown node kind {}", raw_kind)))?;
        Ok(NodeDescriptor {
            forward_link: BigEndian::read_u32(&data[0..4]),
            backward_link: BigEndian::read_u32(&data[4..8]),
            kind,
            height: data[9],
            num_records: BigEndian::read_u16(&data[10..12]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRecord {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf: u32,
    pub last_leaf: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub clump_size: u32,
    pub btree_type: u8,
    pub key_compare_type: u8,
    pub attributes: u32,
}

impl HeaderRecord {
    pub fn parse(data: &[u8]) -> fs::Result<HeaderRecord> {
        if data.len() < HEADER_RECORD_SIZE {
            return Err(HFSPError::corrupt("B-tree header record truncated"));
        }
        let header = HeaderRecord {
            tree_depth: BigEndian::read_u16(&data[0..2]),
            root_node: BigEndian::read_u32(&data[2..6]),
            leaf_records: BigEndian::read_u32(&data[6..10]),
            first_leaf: BigEndian::read_u32(&data[10..14]),
            last_leaf: BigEndian::read_u32(&data[14..18]),
            node_size: BigEndian::read_u16(&data[18..20]),
            max_key_length: BigEndian::read_u16(&data[20..22]),
            total_nodes: BigEndian::read_u32(&data[22..26]),
            free_nodes: BigEndian::read_u32(&data[26..30]),
            clump_size: BigEndian::read_u32(&data[32..36]),
            btree_type: data[36],
            key_compare_type: data[37],
            attributes: BigEndian::read_u32(&data[38..42]),
        };
        if header.node_size < 512 || !header.node_size.is_power_of_two() {
            return Err(HFSPError::corrupt(format!("invalid node size {}", header.node_size)));
        }
        if header.root_node >= header.total_nodes && header.root_node != 0 {
            return Err(HFSPError::corrupt(format!(
                "root node {} beyond {} nodes",
                header.root_node, header.total_nodes
            )));
        }
        Ok(header)
    }

    pub fn has_big_keys(&self) -> bool {
        self.attributes & ATTRIBUTE_BIG_KEYS != 0
    }

    pub fn has_variable_index_keys(&self) -> bool {
        self.attributes & ATTRIBUTE_VARIABLE_INDEX_KEYS != 0
    }

    pub fn was_closed_badly(&self) -> bool {
        self.attributes & ATTRIBUTE_BAD_CLOSE != 0
    }
}

/// A key type stored in a B-tree. `decode` receives the key bytes without
/// the leading key length field.
pub trait BTreeKey: Sized + Clone + Debug {
    fn decode(data: &[u8]) -> fs::Result<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord<K> {
    pub key: K,
    pub child: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRecord<K> {
    pub key: K,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeContent<K> {
    Header(HeaderRecord),
    Map,
    Index(Vec<IndexRecord<K>>),
    Leaf(Vec<LeafRecord<K>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTreeNode<K> {
    pub number: u32,
    pub descriptor: NodeDescriptor,
    pub content: NodeContent<K>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode<K> {
    pub number: u32,
    pub records: Vec<LeafRecord<K>>,
}

fn record_ranges(node: &[u8], num_records: u16) -> fs::Result<Vec<(usize, usize)>> {
    let count = num_records as usize;
    let table_size = (count + 1) * 2;
    if NODE_DESCRIPTOR_SIZE + table_size > node.len() {
        return Err(HFSPError::corrupt(format!("{} records do not fit in a node", count)));
    }
    let table_start = node.len() - table_size;
    let offset = |index: usize| {
        let position = node.len() - 2 * (index + 1);
        BigEndian::read_u16(&node[position..position + 2]) as usize
    };
    let mut ranges = Vec::with_capacity(count);
    for index in 0..count {
        let start = offset(index);
        let end = offset(index + 1);
        if start < NODE_DESCRIPTOR_SIZE || end > table_start || start > end {
            return Err(HFSPError::corrupt(format!(
                "record {} spans {}..{} outside node bounds {}..{}",
                index, start, end, NODE_DESCRIPTOR_SIZE, table_start
            )));
        }
        ranges.push((start, end));
    }
    Ok(ranges)
}

/// Splits a record into its key bytes and the remainder. `key_area` forces
/// the key to occupy a fixed size, as index keys do in trees without
/// variable-length index keys.
fn split_key<'a>(record: &'a [u8], header: &HeaderRecord, key_area: Option<usize>) -> fs::Result<(&'a [u8], &'a [u8])> {
    let (field_size, key_length) = if header.has_big_keys() {
        if record.len() < 2 {
            return Err(HFSPError::corrupt("record too short for key length"));
        }
        (2, BigEndian::read_u16(&record[0..2]) as usize)
    } else {
        if record.is_empty() {
            return Err(HFSPError::corrupt("empty record"));
        }
        (1, record[0] as usize)
    };
    if key_length > header.max_key_length as usize {
        return Err(HFSPError::corrupt(format!(
            "key length {} exceeds maximum {}",
            key_length, header.max_key_length
        )));
    }
    let occupied = key_area.unwrap_or(key_length).max(key_length);
    if field_size + occupied > record.len() {
        return Err(HFSPError::corrupt(format!(
            "key of {} bytes overruns record of {} bytes",
            occupied,
            record.len()
        )));
    }
    Ok((
        &record[field_size..field_size + key_length],
        &record[field_size + occupied..],
    ))
}

pub fn decode_node<K: BTreeKey>(number: u32, node: &[u8], header: &HeaderRecord) -> fs::Result<BTreeNode<K>> {
    let descriptor = NodeDescriptor::parse(node)?;
    let ranges = record_ranges(node, descriptor.num_records)?;
    let content = match descriptor.kind {
        NodeKind::Header => {
            let (start, end) = ranges
                .first()
                .copied()
                .ok_or_else(|| HFSPError::corrupt("header node without records"))?;
            NodeContent::Header(HeaderRecord::parse(&node[start..end])?)
        }
        NodeKind::Map => NodeContent::Map,
        NodeKind::Index => {
            let key_area = if header.has_variable_index_keys() {
                None
            } else {
                Some(header.max_key_length as usize)
            };
            let mut records = Vec::with_capacity(ranges.len());
            for (start, end) in ranges {
                let (key, rest) = split_key(&node[start..end], header, key_area)?;
                if rest.len() < 4 {
                    return Err(HFSPError::corrupt(format!("index record in node {} lacks child pointer", number)));
                }
                records.push(IndexRecord {
                    key: K::decode(key)?,
                    child: BigEndian::read_u32(&rest[0..4]),
                });
            }
            NodeContent::Index(records)
        }
        NodeKind::Leaf => {
            let mut records = Vec::with_capacity(ranges.len());
            for (start, end) in ranges {
                let (key, rest) = split_key(&node[start..end], header, None)?;
                records.push(LeafRecord {
                    key: K::decode(key)?,
                    data: rest.to_vec(),
                });
            }
            NodeContent::Leaf(records)
        }
    };
    Ok(BTreeNode {
        number,
        descriptor,
        content,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeId {
    Catalog,
    Extents,
}

#[derive(Debug)]
pub struct NodeCache {
    capacity: usize,
    entries: Mutex<HashMap<(TreeId, u32), Arc<Vec<u8>>>>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> NodeCache {
        NodeCache {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, tree: TreeId, number: u32) -> Option<Arc<Vec<u8>>> {
        self.entries.lock().ok()?.get(&(tree, number)).cloned()
    }

    fn insert(&self, tree: TreeId, number: u32, node: Arc<Vec<u8>>) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() >= self.capacity {
                entries.clear();
            }
            entries.insert((tree, number), node);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A B-tree stored in a fork. Node `n` lives at byte `n * node_size` of the
/// stream.
#[derive(Debug)]
pub struct BTreeFile<R> {
    stream: R,
    tree: TreeId,
    header: HeaderRecord,
    cache: Option<Arc<NodeCache>>,
}

impl<R> BTreeFile<R>
where
    R: Read + Seek,
{
    pub fn read_header(stream: &mut R) -> fs::Result<HeaderRecord> {
        let mut buffer = [0u8; NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE];
        stream.seek(SeekFrom::Start(0))?;
        stream
            .read_exact(&mut buffer)
            .map_err(|e| HFSPError::io_context("reading B-tree header node", e))?;
        let descriptor = NodeDescriptor::parse(&buffer)?;
        if descriptor.kind != NodeKind::Header {
            return Err(HFSPError::corrupt(format!("node 0 is a {:?} node, not a header", descriptor.kind)));
        }
        HeaderRecord::parse(&buffer[NODE_DESCRIPTOR_SIZE..])
    }

    pub fn open(mut stream: R, tree: TreeId) -> fs::Result<BTreeFile<R>> {
        let header = Self::read_header(&mut stream)?;
        Ok(Self::with_header(stream, tree, header))
    }

    pub fn with_header(stream: R, tree: TreeId, header: HeaderRecord) -> BTreeFile<R> {
        BTreeFile {
            stream,
            tree,
            header,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<Arc<NodeCache>>) -> BTreeFile<R> {
        self.cache = cache;
        self
    }

    pub fn header(&self) -> &HeaderRecord {
        &self.header
    }

    fn node_bytes(&mut self, number: u32) -> fs::Result<Arc<Vec<u8>>> {
        if number >= self.header.total_nodes {
            return Err(HFSPError::corrupt(format!(
                "node {} beyond {} nodes in {:?} tree",
                number, self.header.total_nodes, self.tree
            )));
        }
        if let Some(node) = self.cache.as_ref().and_then(|cache| cache.get(self.tree, number)) {
            return Ok(node);
        }
        debug!("Fetching {:?} node {}", self.tree, number);
        let node_size = self.header.node_size as u64;
        let mut node = vec![0u8; node_size as usize];
        self.stream.seek(SeekFrom::Start(number as u64 * node_size))?;
        self.stream
            .read_exact(&mut node)
            .map_err(|e| HFSPError::io_context(&format!("reading {:?} node {}", self.tree, number), e))?;
        let node = Arc::new(node);
        if let Some(cache) = self.cache.as_ref() {
            cache.insert(self.tree, number, node.clone());
        }
        Ok(node)
    }

    pub fn fetch_node<K: BTreeKey>(&mut self, number: u32) -> fs::Result<BTreeNode<K>> {
        let bytes = self.node_bytes(number)?;
        decode_node(number, &bytes, &self.header)
    }

    fn check_height(&self, node: &BTreeNode<impl BTreeKey>, parent_height: Option<u8>) -> fs::Result<()> {
        if let Some(parent_height) = parent_height {
            if node.descriptor.height >= parent_height {
                return Err(HFSPError::corrupt(format!(
                    "{:?} node {} has height {} under a parent of height {}",
                    self.tree, node.number, node.descriptor.height, parent_height
                )));
            }
        }
        Ok(())
    }

    fn check_key_order<'a, K, C>(&self, number: u32, keys: impl Iterator<Item = &'a K>, compare: C) -> fs::Result<()>
    where
        K: BTreeKey + 'a,
        C: Fn(&K, &K) -> Ordering,
    {
        let keys: Vec<&K> = keys.collect();
        match keys.windows(2).position(|pair| compare(pair[0], pair[1]) == Ordering::Greater) {
            Some(index) => Err(HFSPError::corrupt(format!(
                "{:?} node {} has keys out of order at record {}",
                self.tree,
                number,
                index + 1
            ))),
            None => Ok(()),
        }
    }

    /// Follows index records down to the leaf that holds `search`, or the
    /// leaf it would be inserted into. `compare` orders a stored key against
    /// the search key. Returns `None` for an empty tree.
    pub fn descend<K, C>(&mut self, search: &K, compare: C) -> fs::Result<Option<LeafNode<K>>>
    where
        K: BTreeKey,
        C: Fn(&K, &K) -> Ordering,
    {
        let mut number = self.header.root_node;
        if number == 0 {
            return Ok(None);
        }
        let mut parent_height = None;
        for _ in 0..MAX_DESCENT_DEPTH {
            let node = self.fetch_node::<K>(number)?;
            self.check_height(&node, parent_height)?;
            match node.content {
                NodeContent::Index(records) => {
                    self.check_key_order(number, records.iter().map(|record| &record.key), &compare)?;
                    let chosen = records
                        .iter()
                        .take_while(|record| compare(&record.key, search) != Ordering::Greater)
                        .last()
                        .or_else(|| records.first())
                        .ok_or_else(|| HFSPError::corrupt(format!("index node {} has no records", number)))?;
                    parent_height = Some(node.descriptor.height);
                    number = chosen.child;
                }
                NodeContent::Leaf(records) => {
                    self.check_key_order(number, records.iter().map(|record| &record.key), &compare)?;
                    return Ok(Some(LeafNode {
                        number: node.number,
                        records,
                    }));
                }
                NodeContent::Header(_) | NodeContent::Map => {
                    return Err(HFSPError::corrupt(format!(
                        "expected index or leaf node, found {:?} node {}",
                        node.descriptor.kind, number
                    )));
                }
            }
        }
        Err(HFSPError::corrupt(format!(
            "{:?} tree descent exceeded {} levels",
            self.tree, MAX_DESCENT_DEPTH
        )))
    }

    /// Collects every leaf record whose key falls in the group selected by
    /// `group`, which orders a key's group relative to the wanted one. At
    /// each index node the children keyed inside the group are followed,
    /// along with the last child keyed before it, since that subtree may
    /// hold the group's first records.
    pub fn collect_children<K, G>(
        &mut self,
        group: G,
        cancel: Option<&CancellationToken>,
    ) -> fs::Result<Completion<Vec<LeafRecord<K>>>>
    where
        K: BTreeKey,
        G: Fn(&K) -> Ordering,
    {
        let mut result = Vec::new();
        let root = self.header.root_node;
        if root == 0 {
            return Ok(Completion::Complete(result));
        }
        let finished = self.collect_from(root, None, 0, &group, cancel, &mut result)?;
        Ok(if finished {
            Completion::Complete(result)
        } else {
            Completion::Cancelled(result)
        })
    }

    fn collect_from<K, G>(
        &mut self,
        number: u32,
        parent_height: Option<u8>,
        depth: usize,
        group: &G,
        cancel: Option<&CancellationToken>,
        result: &mut Vec<LeafRecord<K>>,
    ) -> fs::Result<bool>
    where
        K: BTreeKey,
        G: Fn(&K) -> Ordering,
    {
        if depth >= MAX_DESCENT_DEPTH {
            return Err(HFSPError::corrupt(format!(
                "{:?} tree descent exceeded {} levels",
                self.tree, MAX_DESCENT_DEPTH
            )));
        }
        if cancel::is_cancelled(cancel) {
            return Ok(false);
        }
        let node = self.fetch_node::<K>(number)?;
        self.check_height(&node, parent_height)?;
        match node.content {
            NodeContent::Index(records) => {
                self.check_key_order(number, records.iter().map(|record| &record.key), by_group(group))?;
                let mut children = Vec::new();
                let mut before = None;
                for record in &records {
                    match group(&record.key) {
                        Ordering::Less => before = Some(record.child),
                        Ordering::Equal => children.push(record.child),
                        Ordering::Greater => break,
                    }
                }
                if let Some(child) = before {
                    children.insert(0, child);
                }
                for child in children {
                    let height = Some(node.descriptor.height);
                    if !self.collect_from(child, height, depth + 1, group, cancel, result)? {
                        return Ok(false);
                    }
                }
            }
            NodeContent::Leaf(records) => {
                self.check_key_order(number, records.iter().map(|record| &record.key), by_group(group))?;
                result.extend(records.into_iter().filter(|record| group(&record.key) == Ordering::Equal));
            }
            NodeContent::Header(_) | NodeContent::Map => {
                return Err(HFSPError::corrupt(format!(
                    "expected index or leaf node, found {:?} node {}",
                    node.descriptor.kind, number
                )));
            }
        }
        Ok(true)
    }

    pub fn into_inner(self) -> R {
        self.stream
    }
}

fn by_group<K, G: Fn(&K) -> Ordering>(group: &G) -> impl Fn(&K, &K) -> Ordering + '_ {
    move |a, b| group(a).cmp(&group(b))
}
