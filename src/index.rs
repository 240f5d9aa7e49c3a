//! Parser for the git index (`.git/index`), versions 2 and 3.
//!
//! Only the entry table is decoded. Extensions after the last entry and the
//! trailing checksum are ignored.

use thiserror::Error;

const SIGNATURE: &[u8; 4] = b"DIRC";
const HASH_LEN: usize = 20;

const FLAG_EXTENDED: u16 = 0x4000;
const FLAG_STAGE_MASK: u16 = 0x3000;
const FLAG_NAME_MASK: u16 = 0x0fff;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("bad index format: {0}")]
    BadFormat(String),
    #[error("non-zero padding byte in entry {entry} at offset {offset}")]
    BadPadding { entry: u32, offset: usize },
    #[error("index truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

#[derive(Debug, Clone)]
pub struct IndexFile {
    pub version: u32,
    pub entry_count: u32,
    pub entries: Vec<IndexEntry>,
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub ctime_seconds: u32,
    pub ctime_nanoseconds: u32,
    pub mtime_seconds: u32,
    pub mtime_nanoseconds: u32,
    pub dev: u32,
    pub ino: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    /// Hex encoded object hash.
    pub hash: String,
    pub flags: u16,
    pub extended_flags: Option<u16>,
    pub name: String,
}

impl IndexEntry {
    pub fn stage(&self) -> u8 {
        ((self.flags & FLAG_STAGE_MASK) >> 12) as u8
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], IndexError> {
        let available = self.data.len().saturating_sub(self.pos);
        if n > available {
            return Err(IndexError::Truncated {
                offset: self.pos,
                needed: n,
                available,
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, IndexError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, IndexError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

pub fn parse_index(data: &[u8]) -> Result<IndexFile, IndexError> {
    let mut reader = Reader { data, pos: 0 };

    let signature = reader.take(4)?;
    if signature != SIGNATURE {
        return Err(IndexError::BadFormat(format!(
            "signature is {:?}, expected \"DIRC\"",
            String::from_utf8_lossy(signature)
        )));
    }

    let version = reader.u32()?;
    if version != 2 && version != 3 {
        return Err(IndexError::BadFormat(format!(
            "unsupported version {version}"
        )));
    }

    let entry_count = reader.u32()?;
    // every entry takes at least 64 bytes, so don't trust the count for the allocation
    let mut entries = Vec::with_capacity((entry_count as usize).min(data.len() / 64));
    for number in 0..entry_count {
        entries.push(parse_entry(&mut reader, version, number)?);
    }

    Ok(IndexFile {
        version,
        entry_count,
        entries,
    })
}

fn parse_entry(reader: &mut Reader, version: u32, number: u32) -> Result<IndexEntry, IndexError> {
    let start = reader.pos;

    let ctime_seconds = reader.u32()?;
    let ctime_nanoseconds = reader.u32()?;
    let mtime_seconds = reader.u32()?;
    let mtime_nanoseconds = reader.u32()?;
    let dev = reader.u32()?;
    let ino = reader.u32()?;
    let mode = reader.u32()?;
    let uid = reader.u32()?;
    let gid = reader.u32()?;
    let size = reader.u32()?;
    let hash = hex::encode(reader.take(HASH_LEN)?);
    let flags = reader.u16()?;

    let extended_flags = if flags & FLAG_EXTENDED != 0 && version == 3 {
        Some(reader.u16()?)
    } else {
        None
    };

    // 0xfff is read as a length of exactly 0xfff
    let name_len = (flags & FLAG_NAME_MASK) as usize;
    let name = String::from_utf8_lossy(reader.take(name_len)?).into_owned();

    // 1 to 8 NUL bytes, so the entry ends on an 8-byte boundary
    let consumed = reader.pos - start;
    let padding = 8 - consumed % 8;
    for byte in reader.take(padding)? {
        if *byte != 0 {
            return Err(IndexError::BadPadding {
                entry: number,
                offset: reader.pos - padding,
            });
        }
    }

    Ok(IndexEntry {
        ctime_seconds,
        ctime_nanoseconds,
        mtime_seconds,
        mtime_nanoseconds,
        dev,
        ino,
        mode,
        uid,
        gid,
        size,
        hash,
        flags,
        extended_flags,
        name,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds an index with one entry per `(name, hash)` pair.
    pub(crate) fn build_index(version: u32, entries: &[(&str, [u8; 20])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"DIRC");
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_be_bytes());

        for (name, hash) in entries {
            let start = out.len();
            for field in 0..10u32 {
                out.extend_from_slice(&(field + 1).to_be_bytes());
            }
            out.extend_from_slice(hash);
            out.extend_from_slice(&(name.len() as u16 & 0x0fff).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            let padding = 8 - (out.len() - start) % 8;
            out.extend(std::iter::repeat(0).take(padding));
        }

        // trailing checksum, ignored by the parser
        out.extend_from_slice(&[0xaa; 20]);
        out
    }

    fn hash(seed: u8) -> [u8; 20] {
        let mut hash = [0u8; 20];
        for (i, b) in hash.iter_mut().enumerate() {
            *b = seed.wrapping_mul(31).wrapping_add(i as u8);
        }
        hash
    }

    #[test]
    fn parses_version_2_entries() {
        let names = ["README.md", "src/main.rs", "a", "Cargo.toml"];
        let input: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (*name, hash(i as u8)))
            .collect();
        let bytes = build_index(2, &input);

        let index = parse_index(&bytes).unwrap();
        assert_eq!(index.version, 2);
        assert_eq!(index.entry_count, 4);
        assert_eq!(index.entries.len(), 4);
        for ((name, hash), entry) in input.iter().zip(&index.entries) {
            assert_eq!(entry.name, *name);
            assert_eq!(entry.hash, hex::encode(hash));
            assert_eq!((entry.flags & FLAG_NAME_MASK) as usize, name.len());
            assert_eq!(entry.mode, 7);
            assert_eq!(entry.size, 10);
        }
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = build_index(2, &[("a", hash(1))]);
        bytes[..4].copy_from_slice(b"XXXX");
        assert!(matches!(
            parse_index(&bytes),
            Err(IndexError::BadFormat(_))
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let bytes = build_index(4, &[("a", hash(1))]);
        assert!(matches!(
            parse_index(&bytes),
            Err(IndexError::BadFormat(_))
        ));
    }

    #[test]
    fn rejects_non_zero_padding() {
        // header (12) + fixed fields (62) + name "a" (1) -> one padding byte at 75
        let mut bytes = build_index(2, &[("a", hash(1))]);
        bytes[75] = 1;
        assert_eq!(
            parse_index(&bytes).unwrap_err(),
            IndexError::BadPadding {
                entry: 0,
                offset: 75
            }
        );
    }

    #[test]
    fn full_padding_when_entry_is_already_aligned() {
        // 62 fixed bytes + 2 byte name = 64, so 8 bytes of padding follow
        let bytes = build_index(2, &[("ab", hash(2)), ("c", hash(3))]);
        assert_eq!(bytes.len(), 12 + 72 + 64 + 20);

        let index = parse_index(&bytes).unwrap();
        assert_eq!(index.entries[1].name, "c");
    }

    #[test]
    fn reports_truncation() {
        let bytes = build_index(2, &[("a", hash(1)), ("b", hash(2))]);
        let err = parse_index(&bytes[..100]).unwrap_err();
        assert!(matches!(err, IndexError::Truncated { .. }));
    }

    #[test]
    fn extended_flags_only_read_in_version_3() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"DIRC");
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 40]);
        bytes.extend_from_slice(&hash(9));
        bytes.extend_from_slice(&(0x4000u16 | 3).to_be_bytes());
        bytes.extend_from_slice(&0x2000u16.to_be_bytes());
        bytes.extend_from_slice(b"abc");
        // 62 + 2 + 3 = 67 -> 5 bytes of padding
        bytes.extend_from_slice(&[0u8; 5]);

        let index = parse_index(&bytes).unwrap();
        let entry = &index.entries[0];
        assert_ne!(entry.flags & FLAG_EXTENDED, 0);
        assert_eq!(entry.extended_flags, Some(0x2000));
        assert_eq!(entry.name, "abc");

        // the same bytes as version 2 read the extended word as the name
        bytes[4..8].copy_from_slice(&2u32.to_be_bytes());
        let err = parse_index(&bytes).unwrap_err();
        assert!(matches!(
            err,
            IndexError::BadPadding { .. } | IndexError::Truncated { .. }
        ));
    }

    #[test]
    fn stage_bits_are_decoded() {
        let mut bytes = build_index(2, &[("a", hash(1))]);
        // flags word sits right after the hash
        bytes[12 + 40 + 20] |= 0x30;
        let index = parse_index(&bytes).unwrap();
        assert_eq!(index.entries[0].stage(), 3);
        assert_eq!(index.entries[0].flags & 0x8000, 0);
    }
}
