//! Parameter Information Block (PIB) handling.
//!
//! The PIB is the device's ~12 KiB on-board configuration blob. It is
//! downloaded in fixed-size chunks during [`crate::device::DeviceState::ReadPib`],
//! patched in memory, and re-uploaded during
//! [`crate::device::DeviceState::WritePib`]. A `Pib` value is immutable by
//! append: every operation that grows or patches the buffer returns a new
//! `Pib` rather than mutating in place.
//!
//! # Layout
//!
//! ```text
//! offset   field
//! 0x00     (unused by this implementation)
//! 0x04     declared total size, u16 LE  (the "complete" size S)
//! 0x08     whole-PIB XOR checksum, u32 LE
//! 0x2c8a   master MAC, 6 bytes
//! ```

use thiserror::Error;

use crate::mac::Mac;

/// Byte offset of the declared-size field.
const SIZE_OFFSET: usize = 4;
/// Byte offset of the whole-PIB checksum field.
const CKSUM_OFFSET: usize = 8;
/// Byte offset of the master-MAC field.
const MASTER_OFFSET: usize = 0x2c8a;
/// Length of the master-MAC field.
const MASTER_LEN: usize = 6;

/// Errors constructing or manipulating a [`Pib`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PibError {
    /// The buffer is too short to contain a readable declared-size field.
    #[error("PIB buffer too short ({0} bytes, need > 8)")]
    ShortBuffer(usize),

    /// `master_get`/`master_replace` was called on an incomplete PIB.
    #[error("PIB is not complete (have {have} of {want} declared bytes)")]
    Incomplete { have: usize, want: usize },
}

/// An immutable view over a PIB byte buffer.
///
/// `len() <= declared_size()` always holds. Construction fails with
/// [`PibError::ShortBuffer`] if the buffer would be too short to even read
/// the declared-size field (`len <= 8`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pib {
    buf: Vec<u8>,
}

impl Pib {
    /// Wrap a byte buffer as a `Pib`. Fails if `buf.len() <= 8`.
    pub fn new(buf: Vec<u8>) -> Result<Self, PibError> {
        if buf.len() <= 8 {
            return Err(PibError::ShortBuffer(buf.len()));
        }
        Ok(Pib { buf })
    }

    /// The declared total size of the complete PIB (field at offset 4).
    pub fn declared_size(&self) -> u16 {
        u16::from_le_bytes([self.buf[SIZE_OFFSET], self.buf[SIZE_OFFSET + 1]])
    }

    /// The number of bytes currently held.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty. Never true for a validly constructed `Pib`.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether the buffer holds exactly `declared_size()` bytes.
    pub fn is_complete(&self) -> bool {
        self.len() == self.declared_size() as usize
    }

    /// Whether the whole-buffer XOR checksum validates to zero.
    ///
    /// Meaningful (and typically only checked) once the PIB [`Pib::is_complete`].
    pub fn is_valid(&self) -> bool {
        xor_checksum(&self.buf) == 0
    }

    /// Append a chunk of newly downloaded bytes, returning a fresh `Pib`.
    pub fn append(&self, bytes: &[u8]) -> Result<Self, PibError> {
        let mut buf = self.buf.clone();
        buf.extend_from_slice(bytes);
        Pib::new(buf)
    }

    /// The raw buffer contents.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// A chunk of the buffer, for re-upload in [`crate::device::DeviceState::WritePib`].
    pub fn chunk(&self, offset: usize, len: usize) -> &[u8] {
        &self.buf[offset..(offset + len).min(self.buf.len())]
    }

    /// Read the master-MAC field. Only meaningful on a complete PIB.
    pub fn master_get(&self) -> Result<Mac, PibError> {
        self.require_complete()?;
        let mut bytes = [0u8; MASTER_LEN];
        bytes.copy_from_slice(&self.buf[MASTER_OFFSET..MASTER_OFFSET + MASTER_LEN]);
        Ok(Mac::from_bytes(bytes))
    }

    /// Build a new PIB with the master-MAC field replaced and the whole-PIB
    /// checksum recomputed so that the result `is_valid()`.
    pub fn master_replace(&self, new_mac: Mac) -> Result<Self, PibError> {
        self.require_complete()?;

        let mut buf = self.buf.clone();
        buf[CKSUM_OFFSET..CKSUM_OFFSET + 4].fill(0);
        buf[MASTER_OFFSET..MASTER_OFFSET + MASTER_LEN].copy_from_slice(new_mac.as_bytes());

        let cksum = xor_checksum(&buf);
        buf[CKSUM_OFFSET..CKSUM_OFFSET + 4].copy_from_slice(&cksum.to_le_bytes());

        let pib = Pib { buf };
        debug_assert!(pib.is_valid());
        Ok(pib)
    }

    fn require_complete(&self) -> Result<(), PibError> {
        if !self.is_complete() {
            return Err(PibError::Incomplete {
                have: self.len(),
                want: self.declared_size() as usize,
            });
        }
        Ok(())
    }
}

/// Fold `data` as little-endian u32 words under XOR, then bitwise-negate.
///
/// A valid whole-PIB checksum makes this evaluate to 0 over the entire
/// buffer. The same function checks an individual PIB-write chunk's
/// checksum (appended after the chunk, `xor_checksum(chunk ++ cksum_le) == 0`).
///
/// `data.len()` is expected to be a multiple of 4; callers only ever feed it
/// whole PIB buffers or 1024-byte chunks, both of which satisfy this.
pub fn xor_checksum(data: &[u8]) -> u32 {
    let mut acc: u32 = 0;
    for word in data.chunks_exact(4) {
        acc ^= u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
    }
    !acc
}
