//! Canonical decomposition and composition of UTF-16 filename characters.
//!
//! HFS+ stores catalog names in a fixed decomposed form. Lookups therefore
//! decompose the caller's name before building a key, and `compose` turns a
//! stored name back into its precomposed spelling.

use crate::unicode_table::DECOMPOSITIONS;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::OnceLock;

const S_BASE: u16 = 0xAC00;
const L_BASE: u16 = 0x1100;
const V_BASE: u16 = 0x1161;
const T_BASE: u16 = 0x11A7;
const L_COUNT: u16 = 19;
const V_COUNT: u16 = 21;
const T_COUNT: u16 = 28;
const N_COUNT: u16 = V_COUNT * T_COUNT;
const S_COUNT: u16 = L_COUNT * N_COUNT;

pub fn is_hangul_syllable(unit: u16) -> bool {
    unit.wrapping_sub(S_BASE) < S_COUNT
}

pub fn decompose(unit: u16) -> Vec<u16> {
    if is_hangul_syllable(unit) {
        let s_index = unit - S_BASE;
        let l = L_BASE + s_index / N_COUNT;
        let v = V_BASE + (s_index % N_COUNT) / T_COUNT;
        let t = T_BASE + s_index % T_COUNT;
        return if t == T_BASE { vec![l, v] } else { vec![l, v, t] };
    }
    match lookup(unit) {
        Some(sequence) => sequence.to_vec(),
        None => vec![unit],
    }
}

fn lookup(unit: u16) -> Option<&'static [u16]> {
    DECOMPOSITIONS
        .binary_search_by_key(&unit, |&(key, _)| key)
        .ok()
        .map(|index| DECOMPOSITIONS[index].1)
}

pub fn decompose_units(units: &[u16]) -> Vec<u16> {
    let mut result = Vec::with_capacity(units.len());
    for &unit in units {
        result.extend(decompose(unit));
    }
    result
}

pub fn decompose_str(name: &str) -> Vec<u16> {
    let units: Vec<u16> = name.encode_utf16().collect();
    decompose_units(&units)
}

#[derive(Debug, Default)]
struct TrieNode {
    children: BTreeMap<u16, usize>,
    composed: Option<u16>,
}

#[derive(Debug)]
struct CompositionTrie {
    nodes: Vec<TrieNode>,
}

impl CompositionTrie {
    fn build() -> CompositionTrie {
        let mut nodes = vec![TrieNode::default()];
        for &(key, sequence) in DECOMPOSITIONS {
            let mut current = 0;
            for &unit in sequence {
                current = match nodes[current].children.get(&unit) {
                    Some(&next) => next,
                    None => {
                        nodes.push(TrieNode::default());
                        let next = nodes.len() - 1;
                        nodes[current].children.insert(unit, next);
                        next
                    }
                };
            }
            nodes[current].composed = Some(key);
        }
        CompositionTrie { nodes }
    }

    /// Longest prefix of `units` that spells a table entry, as (length, key).
    fn longest_match(&self, units: &[u16]) -> Option<(usize, u16)> {
        let mut current = 0;
        let mut best = None;
        for (index, unit) in units.iter().enumerate() {
            match self.nodes[current].children.get(unit) {
                Some(&next) => current = next,
                None => break,
            }
            if let Some(key) = self.nodes[current].composed {
                best = Some((index + 1, key));
            }
        }
        best
    }
}

fn trie() -> &'static CompositionTrie {
    static TRIE: OnceLock<CompositionTrie> = OnceLock::new();
    TRIE.get_or_init(CompositionTrie::build)
}

pub fn compose(units: &[u16]) -> Vec<u16> {
    let trie = trie();
    let mut composed = Vec::with_capacity(units.len());
    let mut index = 0;
    while index < units.len() {
        match trie.longest_match(&units[index..]) {
            Some((length, key)) => {
                composed.push(key);
                index += length;
            }
            None => {
                composed.push(units[index]);
                index += 1;
            }
        }
    }
    compose_hangul(&composed)
}

fn compose_hangul(units: &[u16]) -> Vec<u16> {
    let mut result: Vec<u16> = Vec::with_capacity(units.len());
    for &unit in units {
        if let Some(last) = result.last_mut() {
            let l_index = last.wrapping_sub(L_BASE);
            let v_index = unit.wrapping_sub(V_BASE);
            if l_index < L_COUNT && v_index < V_COUNT {
                *last = S_BASE + (l_index * V_COUNT + v_index) * T_COUNT;
                continue;
            }
            let s_index = last.wrapping_sub(S_BASE);
            let t_index = unit.wrapping_sub(T_BASE);
            if s_index < S_COUNT && s_index % T_COUNT == 0 && t_index > 0 && t_index < T_COUNT {
                *last += t_index;
                continue;
            }
        }
        result.push(unit);
    }
    result
}

pub fn compose_to_string(units: &[u16]) -> String {
    String::from_utf16_lossy(&compose(units))
}

/// Case-folded form of a code unit for case-insensitive key ordering, or
/// `None` for units that are ignored when comparing.
///
/// Outside ASCII this lowers with `char::to_lowercase`, which follows the
/// Unicode version of the standard library rather than the fixed table the
/// HFS+ catalog was sorted with. The two agree on ASCII, Latin-1 and the
/// basic Greek and Cyrillic letters. They differ in ranges the on-disk table
/// leaves unfolded, such as Latin Extended Additional (U+1E00..) and Greek
/// Extended (U+1F00..), and for case pairs added to Unicode later, such as
/// Glagolitic. Names using those letters may sort differently here than on
/// disk, so a lookup can descend into the wrong leaf and miss them.
pub fn fold_case(unit: u16) -> Option<u16> {
    match unit {
        0x0000 => Some(0xFFFF),
        0x200C..=0x200F | 0x202A..=0x202E | 0x206A..=0x206F | 0xFEFF => None,
        0x0001..=0x007F => Some((unit as u8).to_ascii_lowercase() as u16),
        _ => {
            let folded = char::from_u32(unit as u32).and_then(|c| {
                let mut lower = c.to_lowercase();
                match (lower.next(), lower.next()) {
                    (Some(single), None) if (single as u32) <= 0xFFFF => Some(single as u16),
                    _ => None,
                }
            });
            Some(folded.unwrap_or(unit))
        }
    }
}

pub fn compare_case_folded(a: &[u16], b: &[u16]) -> Ordering {
    let mut left = a.iter().filter_map(|&unit| fold_case(unit));
    let mut right = b.iter().filter_map(|&unit| fold_case(unit));
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x != y => return x.cmp(&y),
            _ => {}
        }
    }
}
