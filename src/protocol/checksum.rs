//! Per-fragment checksums over call argument bytes.
//!
//! All fragments of one call carry the same checksum type. Each fragment's
//! digest covers the arg bytes emitted in that fragment (length prefixes
//! excluded), seeded with the previous fragment's digest; the first fragment
//! uses seed 0. For CRC-based types this makes the final digest equal to a
//! single pass over the whole concatenated arg stream.

use crate::error::{Result, TChannelError};

/// Checksum algorithm byte carried by call frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChecksumType {
    /// No checksum; the checksum field is absent from the frame.
    #[default]
    None = 0x00,
    /// CRC-32 (IEEE).
    Crc32 = 0x01,
    /// FarmHash Fingerprint32.
    Farmhash = 0x02,
    /// CRC-32C (Castagnoli).
    Crc32C = 0x03,
}

impl ChecksumType {
    /// Decode a checksum type byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Crc32),
            0x02 => Ok(Self::Farmhash),
            0x03 => Ok(Self::Crc32C),
            _ => Err(TChannelError::Protocol(format!(
                "unknown checksum type 0x{value:02X}"
            ))),
        }
    }

    /// The wire byte for this type.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether frames of this type carry a 4-byte checksum field.
    #[inline]
    pub fn has_value(self) -> bool {
        self != Self::None
    }
}

/// Running digest chained across the fragments of one call.
#[derive(Debug, Clone)]
pub struct ChecksumChain {
    ty: ChecksumType,
    seed: u32,
}

impl ChecksumChain {
    /// Start a new chain with seed 0.
    pub fn new(ty: ChecksumType) -> Self {
        Self { ty, seed: 0 }
    }

    /// The algorithm this chain uses.
    #[inline]
    pub fn ty(&self) -> ChecksumType {
        self.ty
    }

    /// Digest one fragment's arg chunks and advance the chain.
    pub fn fragment(&mut self, chunks: &[&[u8]]) -> u32 {
        let digest = compute(self.ty, self.seed, chunks);
        self.seed = digest;
        digest
    }

    /// Verify a received fragment's digest; advances the chain only on match.
    pub fn verify(&mut self, chunks: &[&[u8]], declared: u32) -> bool {
        let digest = compute(self.ty, self.seed, chunks);
        if digest != declared {
            return false;
        }
        self.seed = digest;
        true
    }
}

fn compute(ty: ChecksumType, seed: u32, chunks: &[&[u8]]) -> u32 {
    match ty {
        ChecksumType::None => 0,
        ChecksumType::Crc32 => {
            let mut hasher = crc32fast::Hasher::new_with_initial(seed);
            for chunk in chunks {
                hasher.update(chunk);
            }
            hasher.finalize()
        }
        ChecksumType::Crc32C => {
            let mut digest = seed;
            for chunk in chunks {
                digest = crc32c::crc32c_append(digest, chunk);
            }
            digest
        }
        ChecksumType::Farmhash => {
            // farmhash has no streaming interface; hash the fragment's
            // contiguous arg bytes in one shot.
            if let [only] = chunks {
                farmhash::hash32_with_seed(only, seed)
            } else {
                let total: usize = chunks.iter().map(|c| c.len()).sum();
                let mut joined = Vec::with_capacity(total);
                for chunk in chunks {
                    joined.extend_from_slice(chunk);
                }
                farmhash::hash32_with_seed(&joined, seed)
            }
        }
    }
}
