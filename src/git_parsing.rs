use std::collections::HashSet;

use regex::bytes::Regex;
use thiserror::Error;

lazy_static::lazy_static! {
    static ref REGEX_HASH: Regex = Regex::new(r"(?-u)\b[0-9a-fA-F]{40}\b").unwrap();
    static ref REGEX_REF_PATH: Regex = Regex::new(r"(?-u)refs(?:/[A-Za-z0-9_.*\-]+)+").unwrap();
    static ref REGEX_OBJECT_PATH: regex::Regex =
        regex::Regex::new(r"(?:^|/)objects/[\da-f]{2}/[\da-f]{38}$").unwrap();
}

const EMPTY_HASH: &str = "0000000000000000000000000000000000000000";
const TREE_HEADER: &[u8] = b"tree ";
const TREE_MODE_LEN: usize = 6;
const RAW_HASH_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("object does not start with \"tree \"")]
    BadHeader,
    #[error("invalid tree size {0:?}")]
    BadSize(String),
    #[error("tree object truncated at offset {0}")]
    Truncated(usize),
}

#[derive(Debug, Clone)]
pub struct Tree {
    /// Payload size announced in the header.
    pub size: usize,
    pub entries: Vec<TreeEntry>,
}

#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub mode: [u8; TREE_MODE_LEN],
    pub name: String,
    pub hash: [u8; RAW_HASH_LEN],
}

impl TreeEntry {
    pub fn hex_hash(&self) -> String {
        hex::encode(self.hash)
    }
}

pub fn is_tree(data: &[u8]) -> bool {
    data.starts_with(TREE_HEADER)
}

/// Parses a decompressed tree object.
///
/// Entries are read until at least the announced payload size is consumed.
/// The mode field is always taken as 6 bytes wide, so the 5-byte `40000`
/// mode of sub-trees eats the first byte of the name. Hashes stay aligned.
pub fn parse_tree(data: &[u8]) -> Result<Tree, TreeError> {
    let rest = data.strip_prefix(TREE_HEADER).ok_or(TreeError::BadHeader)?;
    let (size, mut pos) = match rest.iter().position(|&b| b == 0) {
        Some(nul) => {
            let text = String::from_utf8_lossy(&rest[..nul]);
            let size = text
                .parse::<usize>()
                .map_err(|_| TreeError::BadSize(text.clone().into_owned()))?;
            (size, TREE_HEADER.len() + nul + 1)
        }
        None => return Err(TreeError::Truncated(data.len())),
    };

    let payload_start = pos;
    let mut entries = vec![];
    while pos - payload_start < size {
        let mut mode = [0u8; TREE_MODE_LEN];
        mode.copy_from_slice(take(data, &mut pos, TREE_MODE_LEN)?);
        // delimiter
        take(data, &mut pos, 1)?;

        let nul = data[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(TreeError::Truncated(data.len()))?;
        let name = String::from_utf8_lossy(&data[pos..pos + nul]).into_owned();
        pos += nul + 1;

        let mut hash = [0u8; RAW_HASH_LEN];
        hash.copy_from_slice(take(data, &mut pos, RAW_HASH_LEN)?);

        entries.push(TreeEntry { mode, name, hash });
    }

    Ok(Tree { size, entries })
}

fn take<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8], TreeError> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or(TreeError::Truncated(*pos))?;
    let slice = &data[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Inflates zlib data, returning `None` if it isn't valid zlib.
pub fn inflate(data: &[u8]) -> Option<Vec<u8>> {
    miniz_oxide::inflate::decompress_to_vec_zlib(data).ok()
}

/// Every distinct 40 character hex token in `data`, lower-cased, in order of
/// first appearance. The all-zero hash is skipped.
pub fn find_hashes(data: &[u8]) -> Vec<String> {
    let mut seen = HashSet::new();
    REGEX_HASH
        .find_iter(data)
        .map(|m| String::from_utf8_lossy(m.as_bytes()).to_ascii_lowercase())
        .filter(|hash| hash != EMPTY_HASH)
        .filter(|hash| seen.insert(hash.clone()))
        .collect()
}

/// Every distinct `refs/...` path in `data`. Globs like `refs/tags/*` are not
/// real refs and are dropped.
pub fn find_refs(data: &[u8]) -> Vec<String> {
    let mut seen = HashSet::new();
    REGEX_REF_PATH
        .find_iter(data)
        .map(|m| m.as_bytes())
        .filter(|path| !path.ends_with(b"*"))
        // a normal git setup never has `.` or `..` segments in a ref name
        .filter(|path| {
            !path
                .split(|&b| b == b'/')
                .any(|segment| segment == b"." || segment == b"..")
        })
        .map(|path| String::from_utf8_lossy(path).into_owned())
        .filter(|path| seen.insert(path.clone()))
        .collect()
}

pub fn hash_to_path(hash: &str) -> String {
    let (hash_start, hash_end) = hash.split_at(2);
    format!("objects/{hash_start}/{hash_end}")
}

/// The pack index and pack file that might exist for `hash`.
pub fn pack_paths(hash: &str) -> [String; 2] {
    [
        format!("objects/pack/pack-{hash}.idx"),
        format!("objects/pack/pack-{hash}.pack"),
    ]
}

pub fn is_loose_object_path(path: &str) -> bool {
    REGEX_OBJECT_PATH.is_match(path)
}
