//! Fixed-width, variable-size byte hash used as the universal lookup key.

use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Read, Write};

use rand::RngCore;
use thiserror::Error;

/// Hashes never carry more than this many bytes.
pub const MAX_HASH_SIZE: usize = 255;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("hash size {0} exceeds max hash size {MAX_HASH_SIZE}")]
    TooLarge(usize),
    #[error("invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A fixed-size byte value with big-endian ordering semantics.
///
/// An empty hash (size 0) is distinct from a zero-filled hash of known
/// size: `Hash::empty().is_empty()` is true, `Hash::zeroed(32).is_empty()`
/// is false.
#[derive(Clone, Eq, Default)]
pub struct Hash {
    bytes: Vec<u8>,
}

impl Hash {
    pub fn empty() -> Self {
        Hash { bytes: Vec::new() }
    }

    /// A hash of the given size with every byte set to zero.
    pub fn zeroed(size: u8) -> Self {
        Hash {
            bytes: vec![0u8; size as usize],
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, HashError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_HASH_SIZE {
            return Err(HashError::TooLarge(bytes.len()));
        }
        Ok(Hash { bytes })
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn is_zero(&self) -> bool {
        !self.is_empty() && self.bytes.iter().all(|b| *b == 0)
    }

    pub fn zeroize(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }

    /// Set all bytes to 0xff.
    pub fn set_max(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0xff);
    }

    pub fn randomize(&mut self) {
        rand::thread_rng().fill_bytes(&mut self.bytes);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Big endian (most significant byte first) hex text.
    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Little endian (least significant byte first) hex text.
    pub fn little_hex(&self) -> String {
        let mut reversed: Vec<u8> = self.bytes.clone();
        reversed.reverse();
        hex::encode(reversed)
    }

    pub fn set_hex(&mut self, text: &str) -> Result<(), HashError> {
        let bytes = hex::decode(text)?;
        if bytes.len() > MAX_HASH_SIZE {
            return Err(HashError::TooLarge(bytes.len()));
        }
        self.bytes = bytes;
        Ok(())
    }

    pub fn set_little_hex(&mut self, text: &str) -> Result<(), HashError> {
        let mut bytes = hex::decode(text)?;
        if bytes.len() > MAX_HASH_SIZE {
            return Err(HashError::TooLarge(bytes.len()));
        }
        bytes.reverse();
        self.bytes = bytes;
        Ok(())
    }

    /// First byte, used to pick a 256-way partition. Zero for an empty hash.
    pub fn lookup8(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(0)
    }

    /// First two bytes (big endian), used to pick a <=65536-way partition.
    /// Zero if the hash has fewer than two bytes.
    pub fn lookup16(&self) -> u16 {
        if self.bytes.len() < 2 {
            0
        } else {
            u16::from_be_bytes([self.bytes[0], self.bytes[1]])
        }
    }

    pub fn write_to(&self, writer: &mut dyn Write) -> io::Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        writer.write_all(&self.bytes)
    }

    /// Read exactly `size` bytes into a new hash. `size` of zero yields
    /// `Hash::empty()` without touching the reader.
    pub fn read_from(reader: &mut dyn Read, size: usize) -> io::Result<Self> {
        if size == 0 {
            return Ok(Hash::empty());
        }
        let mut bytes = vec![0u8; size];
        reader.read_exact(&mut bytes)?;
        Ok(Hash { bytes })
    }
}

impl Ord for Hash {
    /// Hashes of different sizes compare by size first, then big-endian
    /// lexicographic over the declared size.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.bytes.len().cmp(&other.bytes.len()) {
            Ordering::Equal => self.bytes.cmp(&other.bytes),
            other_order => other_order,
        }
    }
}

impl PartialOrd for Hash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Hash {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl std::hash::Hash for Hash {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_distinct_from_zeroed() {
        assert!(Hash::empty().is_empty());
        assert!(!Hash::zeroed(32).is_empty());
        assert!(Hash::zeroed(32).is_zero());
    }

    #[test]
    fn ordering_is_size_first_then_big_endian() {
        let shorter = Hash::from_bytes(vec![0xff]).unwrap();
        let longer = Hash::from_bytes(vec![0x00, 0x00]).unwrap();
        assert!(shorter < longer);

        let a = Hash::from_bytes(vec![0x01, 0x02]).unwrap();
        let b = Hash::from_bytes(vec![0x01, 0x03]).unwrap();
        assert!(a < b);
    }

    #[test]
    fn hex_round_trips() {
        let mut h = Hash::zeroed(4);
        h.set_hex("deadbeef").unwrap();
        assert_eq!(h.hex(), "deadbeef");
        assert_eq!(h.little_hex(), "efbeadde");
    }

    #[test]
    fn lookup8_and_lookup16() {
        let h = Hash::from_bytes(vec![0x12, 0x34, 0x56]).unwrap();
        assert_eq!(h.lookup8(), 0x12);
        assert_eq!(h.lookup16(), 0x1234);
        assert_eq!(Hash::empty().lookup8(), 0);
        assert_eq!(Hash::from_bytes(vec![0x01]).unwrap().lookup16(), 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let h = Hash::from_bytes(vec![1, 2, 3, 4]).unwrap();
        let mut buf = Vec::new();
        h.write_to(&mut buf).unwrap();
        let mut cursor = io::Cursor::new(buf);
        let read_back = Hash::read_from(&mut cursor, 4).unwrap();
        assert_eq!(h, read_back);
    }
}
