//! Transforms behind the registered capabilities
//!
//! `crypt.scrypt` derives an AES-256-CTR key per session from a password and
//! a persisted parameter file; `crypt.aesctr256` takes the raw key directly.
//!
//! Every `crypt.scrypt` sink starts with a stream header: the magic
//! `sctr\0\0\0\x01` followed by a random 64-bit big-endian nonce. The nonce
//! fills the upper half of the initial counter block, so files written under
//! the same parameters and password never share a keystream.

use crate::armor;
use crate::error::{CryptError, ErrorCategory, ErrorKind, Result};
use crate::kdf::{Budgets, COST_BLOCK_LEN, CostParams, DEFAULT_SALT_LEN, Kdf, KdfMode, KdfParameters};
use crate::pipe::{Session, Transform, staging_file};
use crate::registry::{PluginDescriptor, PrimitiveContract};
use crate::stream::{AES256_KEY_LEN, CipherState, KeySchedule};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, IsTerminal, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

pub const SCRYPT_NAME: &str = "crypt.scrypt";
pub const AESCTR_NAME: &str = "crypt.aesctr256";

/// Key material derived per scrypt session; the cipher uses the first 32 bytes.
pub const DERIVED_KEY_LEN: usize = 64;

const STREAM_MAGIC: &[u8; 8] = b"sctr\0\0\0\x01";

/// Bytes in front of the ciphertext of every `crypt.scrypt` sink.
pub const STREAM_HEADER_LEN: usize = 16;

const PROMPT: &[u8] = b"Passphrase (scryptctr): ";

const SCRYPT_KEYS: &[&str] = &[
    "file",
    "data",
    "params",
    "maxmem",
    "maxmemfrac",
    "maxtime",
    "saltsize",
    "staging",
];
const AESCTR_KEYS: &[&str] = &["file", "data", "nonce", "staging"];

/// Where a transform's secret comes from.
#[derive(Clone)]
pub enum Secret {
    /// Read from this path each time it is needed.
    File(PathBuf),
    Inline(Zeroizing<Vec<u8>>),
}

impl Secret {
    /// Take the whole of `reader` as the secret, verbatim (no newline stripping).
    pub fn read_from(reader: &mut dyn Read) -> Result<Self> {
        let mut data = Zeroizing::new(Vec::new());
        reader.read_to_end(&mut data).map_err(|e| {
            CryptError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::PassphraseUnavailable,
                "error reading passphrase",
                e,
            )
        })?;
        Ok(Secret::Inline(data))
    }

    /// Prompt for a passphrase on the terminal with echo disabled.
    ///
    /// rpassword only returns UTF-8; other passphrases must come through
    /// [`Secret::read_from`].
    pub fn prompt() -> Result<Self> {
        if !io::stdin().is_terminal() {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::PassphraseUnavailable,
                "cannot prompt for a passphrase: stdin is not a terminal",
            ));
        }

        let mut stderr = io::stderr();
        stderr
            .write_all(PROMPT)
            .and_then(|()| stderr.flush())
            .map_err(|e| CryptError::io("failed to write prompt", e))?;

        let entered = rpassword::read_password().map(Zeroizing::new).map_err(|e| {
            CryptError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::PassphraseUnavailable,
                "failed to read passphrase from terminal",
                e,
            )
        })?;
        Ok(Secret::Inline(Zeroizing::new(entered.as_bytes().to_vec())))
    }

    /// The secret as a password: file contents lose one trailing line ending.
    pub fn password(&self) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            Secret::File(_) => self.load().map(trim_line_ending),
            Secret::Inline(_) => self.load(),
        }
    }

    /// Pick the last `file:` or `data:` option.
    fn from_descriptor(descriptor: &PluginDescriptor) -> Result<Self> {
        let chosen = descriptor
            .options()
            .iter()
            .rev()
            .find(|(key, _)| key == "file" || key == "data");
        match chosen {
            Some((key, value)) if key == "file" => Ok(Secret::File(PathBuf::from(value))),
            Some((_, value)) => Ok(Secret::Inline(Zeroizing::new(value.as_bytes().to_vec()))),
            None => Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidConfig,
                format!("{} requires a file: or data: option", descriptor.name()),
            )),
        }
    }

    fn load(&self) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            Secret::File(path) => fs::read(path)
                .map(Zeroizing::new)
                .map_err(|e| CryptError::io(format!("failed to read secret {}", path.display()), e)),
            Secret::Inline(bytes) => Ok(bytes.clone()),
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::File(path) => f.debug_tuple("File").field(path).finish(),
            Secret::Inline(_) => f.write_str("Inline([REDACTED])"),
        }
    }
}

/// Strip one trailing line ending from a password file.
fn trim_line_ending(mut bytes: Zeroizing<Vec<u8>>) -> Zeroizing<Vec<u8>> {
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
    }
    bytes
}

/// Password-keyed AES-256-CTR.
#[derive(Debug)]
pub struct ScryptTransform {
    kdf: Kdf,
    secret: Secret,
    params_path: PathBuf,
    budgets: Budgets,
    salt_size: usize,
    staging: Option<PathBuf>,
}

impl ScryptTransform {
    pub fn new(kdf: Kdf, secret: Secret, params_path: impl Into<PathBuf>) -> Self {
        Self {
            kdf,
            secret,
            params_path: params_path.into(),
            budgets: Budgets::default(),
            salt_size: DEFAULT_SALT_LEN,
            staging: None,
        }
    }

    pub fn with_budgets(mut self, budgets: Budgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn with_salt_size(mut self, salt_size: usize) -> Self {
        self.salt_size = salt_size;
        self
    }

    pub fn with_staging(mut self, staging: Option<PathBuf>) -> Self {
        self.staging = staging;
        self
    }

    /// Build from `file|data`, `params` and the optional budget keys.
    pub fn from_descriptor(
        descriptor: &PluginDescriptor,
        contract: &PrimitiveContract,
        kdf: Kdf,
    ) -> Result<Self> {
        descriptor.warn_unknown(SCRYPT_KEYS);
        if kdf.param_size() != contract.param_size {
            return Err(CryptError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                format!(
                    "KDF cost block is {} bytes but the probed contract says {}",
                    kdf.param_size(),
                    contract.param_size
                ),
            ));
        }

        let secret = Secret::from_descriptor(descriptor)?;
        let params_path = descriptor.get("params").ok_or_else(|| {
            CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidConfig,
                format!("{} requires a params: option", descriptor.name()),
            )
        })?;

        let defaults = Budgets::default();
        let budgets = Budgets {
            max_mem: descriptor.parse_or("maxmem", defaults.max_mem)?,
            max_mem_frac: descriptor.parse_or("maxmemfrac", defaults.max_mem_frac)?,
            max_time: descriptor.parse_or("maxtime", defaults.max_time)?,
        };

        Ok(Self::new(kdf, secret, params_path)
            .with_budgets(budgets)
            .with_salt_size(descriptor.parse_or("saltsize", DEFAULT_SALT_LEN)?)
            .with_staging(descriptor.get("staging").map(PathBuf::from)))
    }

    pub fn params_path(&self) -> &Path {
        &self.params_path
    }

    fn stored_params(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.params_path) {
            Ok(bytes) => armor::unwrap_or_raw(&bytes).map(Some).map_err(|e| {
                e.with_context(format!(
                    "failed to decode parameters in {}",
                    self.params_path.display()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CryptError::io(
                format!("failed to read parameters {}", self.params_path.display()),
                e,
            )),
        }
    }

    /// Derive this session's key, returning generated parameters that still need persisting.
    ///
    /// Stored parameters are checked against the budgets before any work is done.
    fn session_key(&self) -> Result<(KeySchedule, Option<KdfParameters>)> {
        let password = self.secret.password()?;
        let stored = self.stored_params()?;
        if let Some(blob) = stored.as_deref().filter(|b| b.len() >= COST_BLOCK_LEN) {
            self.kdf
                .check_params(&CostParams::decode(&blob[..COST_BLOCK_LEN])?, &self.budgets)
                .map_err(|e| {
                    e.with_context(format!(
                        "refusing parameters in {}",
                        self.params_path.display()
                    ))
                })?;
        }
        let (key, params) = self.kdf.derive(
            &password,
            DERIVED_KEY_LEN,
            &self.budgets,
            stored.as_deref(),
            self.salt_size,
        )?;
        let schedule = KeySchedule::from_derived(&key)?;
        let fresh = (params.mode() == KdfMode::Generate).then_some(params);
        Ok((schedule, fresh))
    }

    fn finish_begin(&self, session: Session, fresh: Option<KdfParameters>) -> Result<Session> {
        if let Some(params) = fresh {
            // Dropping the session on failure discards its staging file.
            write_params(&self.params_path, &params)?;
            info!(params = %self.params_path.display(), "generated new KDF parameters");
        }
        Ok(session)
    }
}

impl Transform for ScryptTransform {
    fn name(&self) -> &str {
        SCRYPT_NAME
    }

    fn begin_read(&self, source: &Path) -> Result<Session> {
        let nonce = read_stream_header(source)?;
        let (schedule, fresh) = self.session_key()?;
        let session = Session::open_read_from(
            source,
            STREAM_HEADER_LEN as u64,
            CipherState::with_nonce(&schedule, nonce),
        )?;
        self.finish_begin(session, fresh)
    }

    fn begin_write(&self, sink: &Path) -> Result<Session> {
        let (schedule, fresh) = self.session_key()?;
        let nonce = OsRng.next_u64();
        let session = Session::open_write_with_header(
            sink,
            self.staging.as_deref(),
            &stream_header(nonce),
            CipherState::with_nonce(&schedule, nonce),
        )?;
        self.finish_begin(session, fresh)
    }
}

fn stream_header(nonce: u64) -> [u8; STREAM_HEADER_LEN] {
    let mut header = [0u8; STREAM_HEADER_LEN];
    header[..8].copy_from_slice(STREAM_MAGIC);
    header[8..].copy_from_slice(&nonce.to_be_bytes());
    header
}

/// Read the nonce from the stream header at the start of `source`.
fn read_stream_header(source: &Path) -> Result<u64> {
    let mut file = File::open(source)
        .map_err(|e| CryptError::io(format!("failed to open {}", source.display()), e))?;
    let mut header = [0u8; STREAM_HEADER_LEN];
    file.read_exact(&mut header).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::ContainerFormat,
                format!("{} is too short to hold a stream header", source.display()),
            )
        } else {
            CryptError::io(format!("failed to read {}", source.display()), e)
        }
    })?;
    if &header[..8] != STREAM_MAGIC {
        return Err(CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::ContainerFormat,
            format!("{} does not start with a scryptctr stream header", source.display()),
        ));
    }
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&header[8..]);
    Ok(u64::from_be_bytes(nonce))
}

/// Persist armored parameters at `path`, refusing to replace an existing file.
pub fn write_params(path: &Path, params: &KdfParameters) -> Result<()> {
    let mut staged = staging_file(path, None)?;
    writeln!(staged, "{}", armor::wrap(params.as_bytes()))
        .map_err(|e| CryptError::io("failed to write parameters", e))?;
    staged
        .as_file()
        .sync_all()
        .map_err(|e| CryptError::io("failed to sync parameters", e))?;
    staged.persist_noclobber(path).map_err(|e| {
        CryptError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::Staging,
            format!("failed to persist parameters to {}", path.display()),
            e.error,
        )
    })?;
    debug!(path = %path.display(), "wrote KDF parameters");
    Ok(())
}

/// Raw-key AES-256-CTR.
///
/// Every session restarts the keystream at the configured nonce, so distinct
/// payloads under one key need distinct nonces.
#[derive(Debug)]
pub struct AesCtrTransform {
    key: KeySchedule,
    nonce: u64,
    staging: Option<PathBuf>,
}

impl AesCtrTransform {
    pub fn new(key: KeySchedule, nonce: u64) -> Self {
        Self {
            key,
            nonce,
            staging: None,
        }
    }

    pub fn with_staging(mut self, staging: Option<PathBuf>) -> Self {
        self.staging = staging;
        self
    }

    /// Build from `file` (32 raw key bytes) or `data` (base64url key), plus `nonce`.
    pub fn from_descriptor(descriptor: &PluginDescriptor, contract: &PrimitiveContract) -> Result<Self> {
        descriptor.warn_unknown(AESCTR_KEYS);
        let raw = match Secret::from_descriptor(descriptor)? {
            secret @ Secret::File(_) => secret.load()?,
            Secret::Inline(text) => {
                let text = std::str::from_utf8(&text).map_err(|e| {
                    CryptError::with_kind_and_source(
                        ErrorCategory::User,
                        ErrorKind::InvalidConfig,
                        "inline key is not valid UTF-8",
                        e,
                    )
                })?;
                let decoded = URL_SAFE_NO_PAD
                    .decode(text.trim().trim_end_matches('='))
                    .map_err(|e| {
                        CryptError::with_kind_and_source(
                            ErrorCategory::User,
                            ErrorKind::InvalidConfig,
                            "inline key is not valid base64url",
                            e,
                        )
                    })?;
                Zeroizing::new(decoded)
            }
        };
        if raw.len() != contract.key_size {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidKeyLength,
                format!(
                    "{} needs a {}-byte key, got {}",
                    descriptor.name(),
                    contract.key_size,
                    raw.len()
                ),
            ));
        }
        let key = KeySchedule::new(&raw)?;
        if key.len() != AES256_KEY_LEN {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidKeyLength,
                format!("{} requires an AES-256 key", descriptor.name()),
            ));
        }

        Ok(Self::new(key, descriptor.parse_or("nonce", 0u64)?)
            .with_staging(descriptor.get("staging").map(PathBuf::from)))
    }
}

impl Transform for AesCtrTransform {
    fn name(&self) -> &str {
        AESCTR_NAME
    }

    fn begin_read(&self, source: &Path) -> Result<Session> {
        Session::open_read(source, CipherState::with_nonce(&self.key, self.nonce))
    }

    fn begin_write(&self, sink: &Path) -> Result<Session> {
        Session::open_write(
            sink,
            self.staging.as_deref(),
            CipherState::with_nonce(&self.key, self.nonce),
        )
    }
}
