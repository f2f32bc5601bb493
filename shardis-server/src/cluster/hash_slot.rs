//! Hash Slot Algorithm - CRC16 mod 16384
//!
//! Redis-compatible hash slot calculation using CRC16 (XMODEM).

use crate::cluster::types::TOTAL_SLOTS;

/// CRC16 lookup table (polynomial 0x1021), built at compile time
const CRC16_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Calculate CRC16 checksum (Redis-compatible)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let idx = ((crc >> 8) ^ u16::from(byte)) as usize;
        crc = (crc << 8) ^ CRC16_TABLE[idx];
    }
    crc
}

/// Extract hash tag from key (Redis-compatible)
///
/// Only the part between the first `{` and the next `}` is hashed, when it
/// is non-empty.
fn extract_hash_tag(key: &[u8]) -> Option<&[u8]> {
    let start = key.iter().position(|&b| b == b'{')?;
    let len = key[start + 1..].iter().position(|&b| b == b'}')?;
    if len == 0 {
        return None;
    }
    Some(&key[start + 1..start + 1 + len])
}

/// Calculate hash slot for a key (CRC16 mod 16384)
///
/// # Example
/// ```
/// use shardis_server::cluster::hash_slot::hash_slot;
///
/// let slot = hash_slot("user:1001");
/// assert!(slot < 16384);
///
/// // Hash tags ensure same slot
/// assert_eq!(hash_slot("user:{1001}:profile"), hash_slot("user:{1001}:settings"));
/// ```
pub fn hash_slot(key: impl AsRef<[u8]>) -> u16 {
    let key = key.as_ref();
    let hash_key = extract_hash_tag(key).unwrap_or(key);
    crc16(hash_key) % TOTAL_SLOTS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_reference_vector() {
        assert_eq!(crc16(b"123456789"), 0x31c3);
    }

    #[test]
    fn test_known_slots() {
        assert_eq!(hash_slot("foo"), 12182);
        assert_eq!(hash_slot("bar"), 5061);
        assert_eq!(hash_slot("1"), 9842);
        assert_eq!(hash_slot("2"), 5649);
    }

    #[test]
    fn test_hash_tag() {
        let slot1 = hash_slot("user:{1001}:profile");
        let slot2 = hash_slot("user:{1001}:settings");
        let slot3 = hash_slot("{1001}");

        assert_eq!(slot1, slot2);
        assert_eq!(slot1, slot3);
        assert_ne!(slot1, hash_slot("user:{1002}:profile"));
    }

    #[test]
    fn test_empty_or_unclosed_tag_hashes_whole_key() {
        assert_eq!(hash_slot("{}foo"), crc16(b"{}foo") % TOTAL_SLOTS);
        assert_eq!(hash_slot("foo{bar"), crc16(b"foo{bar") % TOTAL_SLOTS);
        assert_eq!(hash_slot("foo{}{bar}"), crc16(b"foo{}{bar}") % TOTAL_SLOTS);
    }

    #[test]
    fn test_hash_slot_distribution() {
        let mut slots = std::collections::HashSet::new();
        for i in 0..1000 {
            slots.insert(hash_slot(format!("key:{}", i)));
        }
        assert!(slots.len() > 100);
    }
}
