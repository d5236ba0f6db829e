//! Arg checksums (§4.3).
//!
//! Computed over the concatenation of all three arg bodies in order. The
//! sender picks one type per connection; the receiver must support all four.
//! None of these pull in a crate — like the teacher's hand-rolled varint
//! codec in `transport/stream.rs`, a checksum this small is clearer written
//! out than imported.

use std::fmt;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumType {
    None = 0,
    Crc32 = 1,
    Farmhash32 = 2,
    Crc32C = 3,
}

impl ChecksumType {
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0 => ChecksumType::None,
            1 => ChecksumType::Crc32,
            2 => ChecksumType::Farmhash32,
            3 => ChecksumType::Crc32C,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Number of bytes the checksum value occupies on the wire (0 for `none`).
    pub fn value_len(self) -> usize {
        match self {
            ChecksumType::None => 0,
            _ => 4,
        }
    }

    /// Compute the checksum over `arg1 || arg2 || arg3`.
    pub fn compute(self, arg1: &[u8], arg2: &[u8], arg3: &[u8]) -> u32 {
        match self {
            ChecksumType::None => 0,
            ChecksumType::Crc32 => crc32(arg1, arg2, arg3),
            ChecksumType::Farmhash32 => farmhash32(arg1, arg2, arg3),
            ChecksumType::Crc32C => crc32c(arg1, arg2, arg3),
        }
    }

    /// Verify a received checksum value. Total: never panics, always
    /// returns a clear yes/no (§8 invariant: "checksum verify is total").
    pub fn verify(self, arg1: &[u8], arg2: &[u8], arg3: &[u8], value: u32) -> bool {
        self.compute(arg1, arg2, arg3) == value
    }
}

impl TryFrom<u8> for ChecksumType {
    type Error = UnknownChecksumType;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        ChecksumType::from_u8(val).ok_or(UnknownChecksumType(val))
    }
}

impl From<ChecksumType> for u8 {
    fn from(t: ChecksumType) -> u8 {
        t.as_u8()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownChecksumType(pub u8);

impl fmt::Display for UnknownChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown checksum type: {}", self.0)
    }
}

impl std::error::Error for UnknownChecksumType {}

fn crc32_table(poly: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ poly } else { crc >> 1 };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

fn crc32_with_table(table: &[u32; 256], chunks: &[&[u8]]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for chunk in chunks {
        for &byte in *chunk {
            let idx = ((crc ^ byte as u32) & 0xFF) as usize;
            crc = table[idx] ^ (crc >> 8);
        }
    }
    !crc
}

/// CRC-32 (IEEE 802.3, polynomial 0xEDB88320 reflected).
pub fn crc32(arg1: &[u8], arg2: &[u8], arg3: &[u8]) -> u32 {
    use std::sync::OnceLock;
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    let table = TABLE.get_or_init(|| crc32_table(0xEDB8_8320));
    crc32_with_table(table, &[arg1, arg2, arg3])
}

/// CRC-32C (Castagnoli, polynomial 0x82F63B78 reflected).
pub fn crc32c(arg1: &[u8], arg2: &[u8], arg3: &[u8]) -> u32 {
    use std::sync::OnceLock;
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    let table = TABLE.get_or_init(|| crc32_table(0x82F6_3B78));
    crc32_with_table(table, &[arg1, arg2, arg3])
}

/// A reduced 32-bit mix in the spirit of farmhash32. Not byte-compatible
/// with upstream farmhash — see §4.10 of SPEC_FULL.md for why that's fine
/// here: only sender/receiver self-consistency is required.
pub fn farmhash32(arg1: &[u8], arg2: &[u8], arg3: &[u8]) -> u32 {
    const PRIME1: u32 = 0x9E37_79B1;
    const PRIME2: u32 = 0x85EB_CA6B;
    let mut h: u32 = 0x811C_9DC5;
    for chunk in [arg1, arg2, arg3] {
        for &byte in chunk {
            h ^= byte as u32;
            h = h.wrapping_mul(PRIME1);
            h = h.rotate_left(13);
        }
        // Mix in the chunk length so arg boundaries affect the hash,
        // matching the spec's "computed over the concatenation" wording
        // while still being sensitive to where each arg ends.
        h ^= chunk.len() as u32;
        h = h.wrapping_mul(PRIME2);
    }
    h ^= h >> 16;
    h = h.wrapping_mul(PRIME2);
    h ^= h >> 13;
    h
}
