//! Named transform capabilities offered to a host
//!
//! The registry probes the primitives once at construction. If the probe
//! fails the registry is degraded: it lists no capabilities, which hosts
//! treat as "encryption unavailable" rather than as an error.

use crate::error::{CryptError, ErrorCategory, ErrorKind, Result};
use crate::kdf::{COST_BLOCK_LEN, DEFAULT_SALT_LEN, Kdf};
use crate::pipe::Transform;
use crate::stream::{AES256_KEY_LEN, BLOCK_SIZE, CipherState, KeySchedule};
use crate::transform::{AESCTR_NAME, AesCtrTransform, SCRYPT_NAME, ScryptTransform};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// A capability name plus its parsed `key:value` options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    name: String,
    options: Vec<(String, String)>,
}

impl PluginDescriptor {
    /// Parse a comma-separated `key:value` list.
    ///
    /// The value is everything after the first `:`. Tokens without one are skipped.
    pub fn parse(name: &str, config: &str) -> Self {
        let mut options = Vec::new();
        for token in config.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once(':') {
                Some((key, value)) => options.push((key.trim().to_string(), value.to_string())),
                None => warn!(plugin = name, token, "skipping option without a value"),
            }
        }
        Self {
            name: name.to_string(),
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options in the order given, duplicates included.
    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// The last value given for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse the value for `key`, or return `default` when it is absent.
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| {
                CryptError::with_kind(
                    ErrorCategory::User,
                    ErrorKind::InvalidConfig,
                    format!("{}: invalid value {:?} for {}: {}", self.name, raw, key, e),
                )
            }),
        }
    }

    pub(crate) fn warn_unknown(&self, known: &[&str]) {
        for (key, _) in &self.options {
            if !known.contains(&key.as_str()) {
                warn!(plugin = %self.name, key = %key, "ignoring unrecognized option");
            }
        }
    }
}

/// Buffer sizes the primitives were probed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimitiveContract {
    /// KDF cost block length.
    pub param_size: usize,
    pub salt_size: usize,
    pub key_size: usize,
    pub block_size: usize,
}

impl PrimitiveContract {
    /// Sizes for the scrypt and AES implementations linked into this build.
    pub fn current() -> Self {
        Self {
            param_size: COST_BLOCK_LEN,
            salt_size: DEFAULT_SALT_LEN,
            key_size: AES256_KEY_LEN,
            block_size: BLOCK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available(PrimitiveContract),
    Unavailable(String),
}

/// Decides at startup whether the primitives can be used.
pub trait CapabilityProbe {
    fn probe(&self) -> Availability;
}

/// Runs one scrypt and one AES-256-CTR known-answer test.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfTestProbe;

// RFC 7914 section 12, first vector: P="", S="", N=16, r=1, p=1.
#[rustfmt::skip]
const SCRYPT_VECTOR: [u8; 64] = [
    0x77, 0xd6, 0x57, 0x62, 0x38, 0x65, 0x7b, 0x20,
    0x3b, 0x19, 0xca, 0x42, 0xc1, 0x8a, 0x04, 0x97,
    0xf1, 0x6b, 0x48, 0x44, 0xe3, 0x07, 0x4a, 0xe8,
    0xdf, 0xdf, 0xfa, 0x3f, 0xed, 0xe2, 0x14, 0x42,
    0xfc, 0xd0, 0x06, 0x9d, 0xed, 0x09, 0x48, 0xf8,
    0x32, 0x6a, 0x75, 0x3a, 0x0f, 0xc8, 0x1f, 0x17,
    0xe8, 0xd3, 0xe0, 0xfb, 0x2e, 0x0d, 0x36, 0x28,
    0xcf, 0x35, 0xe2, 0x0c, 0x38, 0xd1, 0x89, 0x06,
];

// NIST SP 800-38A F.5.5, first block.
#[rustfmt::skip]
const CTR_KEY: [u8; 32] = [
    0x60, 0x3d, 0xeb, 0x10, 0x15, 0xca, 0x71, 0xbe,
    0x2b, 0x73, 0xae, 0xf0, 0x85, 0x7d, 0x77, 0x81,
    0x1f, 0x35, 0x2c, 0x07, 0x3b, 0x61, 0x08, 0xd7,
    0x2d, 0x98, 0x10, 0xa3, 0x09, 0x14, 0xdf, 0xf4,
];
#[rustfmt::skip]
const CTR_COUNTER: [u8; 16] = [
    0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7,
    0xf8, 0xf9, 0xfa, 0xfb, 0xfc, 0xfd, 0xfe, 0xff,
];
#[rustfmt::skip]
const CTR_PLAINTEXT: [u8; 16] = [
    0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96,
    0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17, 0x2a,
];
#[rustfmt::skip]
const CTR_CIPHERTEXT: [u8; 16] = [
    0x60, 0x1e, 0xc3, 0x13, 0x77, 0x57, 0x89, 0xa5,
    0xb7, 0xa7, 0xf5, 0x04, 0xbb, 0xf3, 0xd2, 0x28,
];

impl SelfTestProbe {
    fn check_scrypt() -> std::result::Result<(), String> {
        let params = scrypt::Params::new(4, 1, 1, SCRYPT_VECTOR.len())
            .map_err(|e| format!("scrypt rejected test parameters: {}", e))?;
        let mut out = [0u8; 64];
        scrypt::scrypt(b"", b"", &params, &mut out)
            .map_err(|e| format!("scrypt failed: {}", e))?;
        if out != SCRYPT_VECTOR {
            return Err("scrypt known-answer test mismatch".into());
        }
        Ok(())
    }

    fn check_aes_ctr() -> std::result::Result<(), String> {
        let key = KeySchedule::new(&CTR_KEY).map_err(|e| e.to_string())?;
        let mut block = CTR_PLAINTEXT;
        CipherState::with_counter_block(&key, &CTR_COUNTER).apply_in_place(&mut block);
        if block != CTR_CIPHERTEXT {
            return Err("AES-256-CTR known-answer test mismatch".into());
        }
        Ok(())
    }
}

impl CapabilityProbe for SelfTestProbe {
    fn probe(&self) -> Availability {
        match Self::check_scrypt().and_then(|()| Self::check_aes_ctr()) {
            Ok(()) => Availability::Available(PrimitiveContract::current()),
            Err(reason) => Availability::Unavailable(reason),
        }
    }
}

type Constructor = fn(&PluginDescriptor, &PrimitiveContract, &Kdf) -> Result<Box<dyn Transform>>;

fn build_scrypt(
    descriptor: &PluginDescriptor,
    contract: &PrimitiveContract,
    kdf: &Kdf,
) -> Result<Box<dyn Transform>> {
    Ok(Box::new(ScryptTransform::from_descriptor(
        descriptor,
        contract,
        kdf.clone(),
    )?))
}

fn build_aesctr(
    descriptor: &PluginDescriptor,
    contract: &PrimitiveContract,
    _kdf: &Kdf,
) -> Result<Box<dyn Transform>> {
    Ok(Box::new(AesCtrTransform::from_descriptor(descriptor, contract)?))
}

const CONSTRUCTORS: &[(&str, &str, Constructor)] = &[
    (SCRYPT_NAME, "scrypt-derived AES-256-CTR", build_scrypt),
    (AESCTR_NAME, "raw-key AES-256-CTR", build_aesctr),
];

/// One named, configurable transform.
#[derive(Clone)]
pub struct Capability {
    name: &'static str,
    summary: &'static str,
    contract: PrimitiveContract,
    kdf: Kdf,
    constructor: Constructor,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn summary(&self) -> &'static str {
        self.summary
    }

    pub fn contract(&self) -> &PrimitiveContract {
        &self.contract
    }

    /// Configure a transform from a `key:value,...` string.
    pub fn instantiate(&self, config: &str) -> Result<Box<dyn Transform>> {
        let descriptor = PluginDescriptor::parse(self.name, config);
        (self.constructor)(&descriptor, &self.contract, &self.kdf)
            .map_err(|e| e.with_context(format!("failed to configure {}", self.name)))
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("contract", &self.contract)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Registry {
    availability: Availability,
    kdf: Kdf,
}

impl Registry {
    /// Probe with [`SelfTestProbe`].
    pub fn probe() -> Self {
        Self::with_probe(&SelfTestProbe)
    }

    pub fn with_probe(probe: &dyn CapabilityProbe) -> Self {
        let availability = probe.probe();
        match &availability {
            Availability::Available(contract) => debug!(?contract, "crypto primitives available"),
            Availability::Unavailable(reason) => {
                warn!(%reason, "crypto primitives unavailable; no capabilities offered")
            }
        }
        Self {
            availability,
            kdf: Kdf::new(),
        }
    }

    /// Use `kdf` for KDF-backed capabilities.
    pub fn with_kdf(mut self, kdf: Kdf) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.availability, Availability::Unavailable(_))
    }

    /// Empty when the probe failed.
    pub fn list_capabilities(&self) -> Vec<Capability> {
        let Availability::Available(contract) = &self.availability else {
            return Vec::new();
        };
        CONSTRUCTORS
            .iter()
            .map(|&(name, summary, constructor)| Capability {
                name,
                summary,
                contract: *contract,
                kdf: self.kdf.clone(),
                constructor,
            })
            .collect()
    }

    pub fn capability(&self, name: &str) -> Option<Capability> {
        self.list_capabilities().into_iter().find(|c| c.name == name)
    }
}
