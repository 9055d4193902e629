use bytes::Bytes;
use thiserror::Error;

/// Which pieces a peer (or the local client) possesses. Fixed size for
/// the life of the torrent; bits are set as pieces verify and, for the
/// local field, never cleared.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Bitfield {
    bits: Box<[u8]>,
    nbits: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitfieldError {
    #[error("invalid length: expected {expected_len} bytes, got {actual_len}")]
    InvalidLength {
        expected_len: usize,
        actual_len: usize,
    },
    #[error("non-zero spare bits")]
    NonZeroSpareBits,
    #[error("index {idx} out of bounds (len {len})")]
    OutOfBounds { idx: usize, len: usize },
}

impl Bitfield {
    pub fn new(nbits: usize) -> Self {
        Self {
            bits: vec![0; nbits.div_ceil(8)].into_boxed_slice(),
            nbits,
        }
    }

    /// Parse a wire bitfield payload. The payload must be exactly the
    /// expected number of bytes with all spare bits zero; anything else
    /// is a protocol violation and the sender gets dropped.
    pub fn from_payload(bytes: &Bytes, num_pieces: usize) -> Result<Self, BitfieldError> {
        let expected_bytes = num_pieces.div_ceil(8);

        if bytes.len() != expected_bytes {
            return Err(BitfieldError::InvalidLength {
                expected_len: expected_bytes,
                actual_len: bytes.len(),
            });
        }

        let spare = expected_bytes * 8 - num_pieces;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[expected_bytes - 1] & mask != 0 {
                return Err(BitfieldError::NonZeroSpareBits);
            }
        }

        Ok(Self {
            bits: Box::from(&bytes[..]),
            nbits: num_pieces,
        })
    }

    pub fn len(&self) -> usize {
        self.nbits
    }

    pub fn is_empty(&self) -> bool {
        self.count_set() == 0
    }

    pub fn as_bytes(&self) -> Bytes {
        Bytes::from(self.bits.clone())
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.nbits {
            return false;
        }
        self.bits[index / 8] >> (7 - index % 8) & 1 != 0
    }

    pub fn set(&mut self, index: usize) -> Result<(), BitfieldError> {
        if index >= self.nbits {
            return Err(BitfieldError::OutOfBounds {
                idx: index,
                len: self.nbits,
            });
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
        Ok(())
    }

    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn all_set(&self) -> bool {
        self.nbits != 0 && self.count_set() == self.nbits
    }

    /// Iterate the set piece indices in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nbits).filter(|&i| self.has(i))
    }
}
