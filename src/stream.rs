//! AES counter-mode keystream with persistent position
//!
//! The counter block is a 64-bit big-endian nonce followed by a 64-bit
//! big-endian block index, so one key can drive independent streams by
//! varying the nonce. Encryption and decryption are the same operation.

use crate::error::{CryptError, ErrorCategory, ErrorKind, Result};
use crate::kdf::DerivedKey;
use aes::{Aes128, Aes256};
use ctr::Ctr128BE;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use std::fmt;
use zeroize::Zeroizing;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

pub const AES128_KEY_LEN: usize = 16;
pub const AES256_KEY_LEN: usize = 32;

/// A validated AES key. Wiped on drop.
pub struct KeySchedule {
    key: Zeroizing<Vec<u8>>,
}

impl KeySchedule {
    /// Accepts 16-byte (AES-128) or 32-byte (AES-256) keys.
    pub fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            AES128_KEY_LEN | AES256_KEY_LEN => Ok(Self {
                key: Zeroizing::new(key.to_vec()),
            }),
            other => Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidKeyLength,
                format!("AES key must be 16 or 32 bytes, got {}", other),
            )),
        }
    }

    /// AES-256 schedule over the first 32 bytes of derived key material.
    pub fn from_derived(key: &DerivedKey) -> Result<Self> {
        let bytes = key.as_bytes();
        if bytes.len() < AES256_KEY_LEN {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidKeyLength,
                format!(
                    "derived key must be at least {} bytes, got {}",
                    AES256_KEY_LEN,
                    bytes.len()
                ),
            ));
        }
        Self::new(&bytes[..AES256_KEY_LEN])
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySchedule")
            .field("bits", &(self.key.len() * 8))
            .field("key", &"[REDACTED]")
            .finish()
    }
}

enum Keystream {
    Aes128(Ctr128BE<Aes128>),
    Aes256(Ctr128BE<Aes256>),
}

/// Counter-mode cipher state. Owned by exactly one session.
pub struct CipherState {
    keystream: Keystream,
}

impl CipherState {
    /// Nonce 0, counter 0.
    pub fn new(key: &KeySchedule) -> Self {
        Self::with_nonce(key, 0)
    }

    pub fn with_nonce(key: &KeySchedule, nonce: u64) -> Self {
        let mut block = [0u8; BLOCK_SIZE];
        block[..8].copy_from_slice(&nonce.to_be_bytes());
        Self::with_counter_block(key, &block)
    }

    /// Start from an arbitrary 128-bit initial counter block.
    pub fn with_counter_block(key: &KeySchedule, block: &[u8; BLOCK_SIZE]) -> Self {
        let iv = GenericArray::from_slice(&block[..]);
        let keystream = if key.len() == AES128_KEY_LEN {
            Keystream::Aes128(Ctr128BE::<Aes128>::new(
                GenericArray::from_slice(&key.key[..]),
                iv,
            ))
        } else {
            Keystream::Aes256(Ctr128BE::<Aes256>::new(
                GenericArray::from_slice(&key.key[..]),
                iv,
            ))
        };
        Self { keystream }
    }

    /// XOR the keystream into `buf`, continuing from the current position.
    pub fn apply_in_place(&mut self, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        match &mut self.keystream {
            Keystream::Aes128(c) => c.apply_keystream(buf),
            Keystream::Aes256(c) => c.apply_keystream(buf),
        }
    }

    /// Bytes of keystream consumed so far.
    pub fn position(&self) -> u64 {
        match &self.keystream {
            Keystream::Aes128(c) => c.current_pos::<u64>(),
            Keystream::Aes256(c) => c.current_pos::<u64>(),
        }
    }

    /// Index of the block the next byte comes from.
    pub fn counter(&self) -> u64 {
        self.position() / BLOCK_SIZE as u64
    }

    /// Offset of the next byte within its block.
    pub fn block_offset(&self) -> usize {
        (self.position() % BLOCK_SIZE as u64) as usize
    }

    /// Skip the keystream forward to `position`. The counter never rewinds.
    pub fn advance_to(&mut self, position: u64) -> Result<()> {
        let current = self.position();
        if position < current {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::OffsetRegression,
                format!(
                    "keystream is at byte {}, cannot move back to {}",
                    current, position
                ),
            ));
        }
        if position == current {
            return Ok(());
        }
        let seeked = match &mut self.keystream {
            Keystream::Aes128(c) => c.try_seek(position),
            Keystream::Aes256(c) => c.try_seek(position),
        };
        seeked.map_err(|e| {
            CryptError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                format!("failed to seek keystream to {}: {}", position, e),
            )
        })
    }
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("counter", &self.counter())
            .field("block_offset", &self.block_offset())
            .finish_non_exhaustive()
    }
}

/// Set up a fresh keystream for `key`.
pub fn init_engine(key: &KeySchedule) -> CipherState {
    CipherState::new(key)
}

/// Encrypt or decrypt `input`, advancing `state`.
pub fn apply_stream(state: &mut CipherState, input: &[u8]) -> Vec<u8> {
    let mut output = input.to_vec();
    state.apply_in_place(&mut output);
    output
}
