//! Catalog key parsing and ordering. Every catalog record's key begins
//! with the 8-byte `object_id_and_type`: the high 4 bits hold the record
//! type, the low 60 bits the cnid. Grounded on `key.c`'s `keycmp`.

use std::cmp::Ordering;

use unicode_normalization::UnicodeNormalization;

pub const RECORD_TYPE_SHIFT: u32 = 60;
pub const CNID_MASK: u64 = (1u64 << RECORD_TYPE_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RecordType {
    SnapMetadata = 1,
    Extent = 2,
    Inode = 3,
    Xattr = 4,
    SiblingLink = 5,
    DstreamId = 6,
    CryptoState = 7,
    FileExtent = 8,
    DirRecord = 9,
    DirStats = 10,
    SnapName = 11,
    SiblingMap = 12,
    FileInfo = 13,
}

impl RecordType {
    pub fn from_code(code: u8) -> Option<RecordType> {
        use RecordType::*;
        Some(match code {
            1 => SnapMetadata,
            2 => Extent,
            3 => Inode,
            4 => Xattr,
            5 => SiblingLink,
            6 => DstreamId,
            7 => CryptoState,
            8 => FileExtent,
            9 => DirRecord,
            10 => DirStats,
            11 => SnapName,
            12 => SiblingMap,
            13 => FileInfo,
            _ => return None,
        })
    }
}

/// Decoded `object_id_and_type` prefix shared by every catalog key.
#[derive(Debug, Clone, Copy)]
pub struct KeyHeader {
    pub cnid: u64,
    pub rtype_code: u8,
}

impl KeyHeader {
    pub fn parse(raw: u64) -> KeyHeader {
        KeyHeader { cnid: raw & CNID_MASK, rtype_code: (raw >> RECORD_TYPE_SHIFT) as u8 }
    }

    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_code(self.rtype_code)
    }
}

pub fn read_key_header(bytes: &[u8]) -> Option<KeyHeader> {
    if bytes.len() < 8 {
        return None;
    }
    let raw = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    Some(KeyHeader::parse(raw))
}

/// Normalizes and case-folds a UTF-8 name into UTF-32 code points, the
/// representation the directory-entry name hash and the non-hashed
/// Unicode key comparisons both operate on.
pub fn normalize_next(name: &str) -> Vec<u32> {
    name.nfd().flat_map(|c| c.to_lowercase()).map(|c| c as u32).collect()
}

/// The hashed-directory-record name hash: `((crc32c(normalised) &
/// 0x3FFFFF) << 10) | (name_len & 0x3FF)`.
pub fn dentry_name_hash(name: &str) -> u32 {
    let normalized = normalize_next(name);
    let mut bytes = Vec::with_capacity(normalized.len() * 4);
    for cp in &normalized {
        bytes.extend_from_slice(&cp.to_le_bytes());
    }
    let crc = crc32c::crc32c(&bytes);
    ((crc & 0x003F_FFFF) << 10) | (name.len() as u32 & 0x3FF)
}

/// Full catalog key ordering: cnid, then record type, then a per-type
/// discriminator. `tail` is whatever key bytes follow the 8-byte prefix.
pub fn catalog_keycmp(a: &[u8], b: &[u8]) -> Ordering {
    let (Some(ha), Some(hb)) = (read_key_header(a), read_key_header(b)) else {
        return a.cmp(b);
    };
    match (ha.cnid.cmp(&hb.cnid), ha.rtype_code.cmp(&hb.rtype_code)) {
        (Ordering::Equal, Ordering::Equal) => compare_tail(ha.rtype_code, &a[8..], &b[8..]),
        (Ordering::Equal, other) => other,
        (other, _) => other,
    }
}

fn compare_tail(rtype_code: u8, a: &[u8], b: &[u8]) -> Ordering {
    match RecordType::from_code(rtype_code) {
        Some(RecordType::FileExtent) => {
            // Secondary key: logical byte offset, 8 bytes, numeric order.
            let oa = a.get(0..8).map(|s| u64::from_le_bytes(s.try_into().unwrap())).unwrap_or(0);
            let ob = b.get(0..8).map(|s| u64::from_le_bytes(s.try_into().unwrap())).unwrap_or(0);
            oa.cmp(&ob)
        }
        Some(RecordType::Xattr) => a.cmp(b), // byte-wise strcmp, no normalization
        Some(RecordType::DirRecord) | Some(RecordType::SnapName) => compare_names_normalized(a, b),
        _ => a.cmp(b),
    }
}

fn compare_names_normalized(a: &[u8], b: &[u8]) -> Ordering {
    let name_a = std::str::from_utf8(a).unwrap_or("");
    let name_b = std::str::from_utf8(b).unwrap_or("");
    normalize_next(name_a).cmp(&normalize_next(name_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_header_splits_cnid_and_type() {
        let raw = (RecordType::Inode as u64) << RECORD_TYPE_SHIFT | 42;
        let header = KeyHeader::parse(raw);
        assert_eq!(header.cnid, 42);
        assert_eq!(header.record_type(), Some(RecordType::Inode));
    }

    #[test]
    fn name_hash_encodes_length_in_low_bits() {
        let hash = dentry_name_hash("hello");
        assert_eq!(hash & 0x3FF, 5);
    }

    #[test]
    fn cnid_orders_before_type() {
        let mut a = vec![0u8; 16];
        a[0..8].copy_from_slice(&((3u64 << RECORD_TYPE_SHIFT) | 1).to_le_bytes());
        let mut b = vec![0u8; 16];
        b[0..8].copy_from_slice(&((1u64 << RECORD_TYPE_SHIFT) | 2).to_le_bytes());
        assert_eq!(catalog_keycmp(&a, &b), Ordering::Greater);
    }
}
