//! Whole-buffer encryption in the scrypt container format
//!
//! The binary format is:
//! - magic: 6 bytes ("scrypt")
//! - version: 1 byte (0)
//! - KDF parameters: 41 bytes (9-byte cost block, 32-byte salt)
//! - checksum: 16 bytes (truncated SHA-256 of the preceding 48 bytes)
//! - header MAC: 32 bytes (HMAC-SHA256 of the preceding 64 bytes)
//! - body: AES-256-CTR ciphertext, same length as the plaintext
//! - trailer MAC: 32 bytes (HMAC-SHA256 of everything before it)
//!
//! A 64-byte key is derived per container: the first half keys AES, the
//! second half keys both MACs.

use crate::error::{CryptError, ErrorCategory, ErrorKind, Result};
use crate::kdf::{Budgets, CostParams, DerivedKey, Kdf, KdfParameters};
use crate::stream::{CipherState, KeySchedule};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const MAGIC: &[u8; 6] = b"scrypt";
const VERSION: u8 = 0;

/// Salt length fixed by the container layout.
pub const SALT_LEN: usize = 32;

/// Derived key material per container.
pub const KEY_MATERIAL_LEN: usize = 64;

const PARAMS_START: usize = MAGIC.len() + 1;
const CHECKSUM_START: usize = 48;
const HEADER_MAC_START: usize = 64;
const HEADER_LEN: usize = 96;
const MAC_LEN: usize = 32;

/// Bytes a sealed container adds to its plaintext.
pub const OVERHEAD: usize = HEADER_LEN + MAC_LEN;

/// A derived container key together with the parameters that produced it.
pub struct SealKey {
    key: DerivedKey,
    params: KdfParameters,
}

impl SealKey {
    /// Derive a key with freshly generated parameters.
    pub fn generate(kdf: &Kdf, password: &[u8], budgets: &Budgets) -> Result<Self> {
        let (key, params) = kdf.derive(password, KEY_MATERIAL_LEN, budgets, None, SALT_LEN)?;
        Self::from_derived(key, params)
    }

    /// Re-derive the key a container was sealed with.
    ///
    /// The stored parameters are checked against `budgets` before any
    /// expensive work happens.
    pub fn recover(kdf: &Kdf, password: &[u8], sealed: &[u8], budgets: &Budgets) -> Result<Self> {
        let blob = parse_header(kdf, sealed)?;
        let cost = CostParams::decode(blob)?;
        kdf.check_params(&cost, budgets)?;
        let (key, params) =
            kdf.derive(password, KEY_MATERIAL_LEN, budgets, Some(blob), SALT_LEN)?;
        Self::from_derived(key, params)
    }

    /// Wrap key material derived elsewhere, e.g. by [`Kdf::derive_detached`].
    pub fn from_derived(key: DerivedKey, params: KdfParameters) -> Result<Self> {
        if key.len() != KEY_MATERIAL_LEN {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidKeyLength,
                format!(
                    "container keys must be {} bytes, got {}",
                    KEY_MATERIAL_LEN,
                    key.len()
                ),
            ));
        }
        if params.salt().len() != SALT_LEN {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidParameterSize,
                format!(
                    "container salt must be {} bytes, got {}",
                    SALT_LEN,
                    params.salt().len()
                ),
            ));
        }
        Ok(Self { key, params })
    }

    pub fn parameters(&self) -> &KdfParameters {
        &self.params
    }

    fn mac_key(&self) -> &[u8] {
        &self.key.as_bytes()[32..]
    }
}

impl fmt::Debug for SealKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealKey")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Encrypt `plaintext` under a key derived from `password`.
pub fn seal(kdf: &Kdf, plaintext: &[u8], password: &[u8], budgets: &Budgets) -> Result<Vec<u8>> {
    let key = SealKey::generate(kdf, password, budgets)?;
    seal_with(key, plaintext)
}

/// Encrypt `plaintext` with an already derived key.
///
/// The key is consumed: the body always uses counter block zero, so a key
/// must never seal two different messages.
pub fn seal_with(key: SealKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(plaintext.len() + OVERHEAD);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(key.params.as_bytes());
    if out.len() != CHECKSUM_START {
        return Err(CryptError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            format!("container parameters occupy {} bytes", out.len() - PARAMS_START),
        ));
    }
    let checksum = Sha256::digest(&out);
    out.extend_from_slice(&checksum[..HEADER_MAC_START - CHECKSUM_START]);
    let header_mac = mac(key.mac_key(), &out)?;
    out.extend_from_slice(&header_mac);

    let body_start = out.len();
    out.extend_from_slice(plaintext);
    let schedule = KeySchedule::from_derived(&key.key)?;
    CipherState::new(&schedule).apply_in_place(&mut out[body_start..]);

    let trailer = mac(key.mac_key(), &out)?;
    out.extend_from_slice(&trailer);
    debug!(plaintext_len = plaintext.len(), "sealed container");
    Ok(out)
}

/// Decrypt a sealed container, deriving the key from `password`.
///
/// Fails with `ResourceExceeded` if the container's parameters do not fit
/// within `budgets`.
pub fn open(kdf: &Kdf, sealed: &[u8], password: &[u8], budgets: &Budgets) -> Result<Vec<u8>> {
    let key = SealKey::recover(kdf, password, sealed, budgets)?;
    open_with(&key, sealed)
}

/// Decrypt a sealed container with a key recovered earlier.
pub fn open_with(key: &SealKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < OVERHEAD {
        return Err(truncated());
    }
    if sealed[PARAMS_START..CHECKSUM_START] != *key.params.as_bytes() {
        return Err(CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::ContainerFormat,
            "container was sealed with different KDF parameters",
        ));
    }
    verify(
        key.mac_key(),
        &sealed[..HEADER_MAC_START],
        &sealed[HEADER_MAC_START..HEADER_LEN],
    )?;
    let trailer_start = sealed.len() - MAC_LEN;
    verify(
        key.mac_key(),
        &sealed[..trailer_start],
        &sealed[trailer_start..],
    )?;

    let mut plaintext = sealed[HEADER_LEN..trailer_start].to_vec();
    let schedule = KeySchedule::from_derived(&key.key)?;
    CipherState::new(&schedule).apply_in_place(&mut plaintext);
    Ok(plaintext)
}

/// Validate the fixed header fields and return the parameter blob.
fn parse_header<'a>(kdf: &Kdf, sealed: &'a [u8]) -> Result<&'a [u8]> {
    if kdf.param_size() + SALT_LEN != CHECKSUM_START - PARAMS_START {
        return Err(CryptError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            format!(
                "KDF parameter size {} does not fit the container header",
                kdf.param_size()
            ),
        ));
    }
    if sealed.len() < OVERHEAD {
        return Err(truncated());
    }
    if &sealed[..MAGIC.len()] != MAGIC {
        return Err(CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::ContainerFormat,
            "input unrecognized as a sealed container",
        ));
    }
    if sealed[MAGIC.len()] != VERSION {
        return Err(CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::ContainerFormat,
            format!("unsupported container version {}", sealed[MAGIC.len()]),
        ));
    }
    let checksum = Sha256::digest(&sealed[..CHECKSUM_START]);
    if checksum[..HEADER_MAC_START - CHECKSUM_START] != sealed[CHECKSUM_START..HEADER_MAC_START] {
        return Err(CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::ContainerFormat,
            "container header checksum mismatch",
        ));
    }
    Ok(&sealed[PARAMS_START..CHECKSUM_START])
}

fn new_mac(key: &[u8]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| {
        CryptError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "failed to key HMAC",
            e,
        )
    })
}

fn mac(key: &[u8], data: &[u8]) -> Result<[u8; MAC_LEN]> {
    let mut mac = new_mac(key)?;
    mac.update(data);
    let mut tag = [0u8; MAC_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

fn verify(key: &[u8], data: &[u8], tag: &[u8]) -> Result<()> {
    let mut mac = new_mac(key)?;
    mac.update(data);
    mac.verify_slice(tag).map_err(|_| {
        CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::AuthenticationFailed,
            "corrupt input, tampered-with data, or bad passphrase",
        )
    })
}

fn truncated() -> CryptError {
    CryptError::with_kind(
        ErrorCategory::User,
        ErrorKind::ContainerFormat,
        "input likely truncated; shorter than container overhead",
    )
}
