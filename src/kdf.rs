//! Password-based key derivation using scrypt
//!
//! This module manages the lifecycle of scrypt parameters:
//! - Generate mode picks cost parameters that fit memory/time budgets and a
//!   fresh random salt, returning them for the caller to persist
//! - Recover mode replays previously persisted parameters to reproduce the
//!   exact same key
//!
//! The persisted parameter blob is:
//! - cost block: `param_size` bytes (log_n: u8, r: u32 BE, p: u32 BE)
//! - salt: `salt_size` bytes

use crate::error::{CryptError, ErrorCategory, ErrorKind, Result};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use zeroize::Zeroizing;

/// Length of the encoded cost block.
pub const COST_BLOCK_LEN: usize = 9;

/// Salt length used when the caller has no opinion.
pub const DEFAULT_SALT_LEN: usize = 32;

/// scrypt r parameter (block size). Fixed; only N and p are searched.
const SCRYPT_R: u32 = 8;

/// Smallest memory limit we are willing to pick parameters for (1 MiB).
const MIN_MEMORY_LIMIT: u64 = 1 << 20;

/// Floor on the operation budget, so tiny time budgets still yield usable costs.
const MIN_OPS_LIMIT: f64 = 32768.0;

/// scrypt requires r * p < 2^30.
const MAX_RP: u64 = 0x3fff_ffff;

/// Assumed physical memory when the platform does not tell us.
const FALLBACK_PHYSICAL_MEMORY: u64 = 1 << 30;

/// Output length handed to `scrypt::Params`. Only the PHC string API reads it.
const PARAMS_LEN: usize = 32;

const CALIBRATION_LOG_N: u8 = 7;
const CALIBRATION_WINDOW: Duration = Duration::from_millis(20);

/// Whether a set of parameters was freshly chosen or supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfMode {
    Generate,
    Recover,
}

/// scrypt cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl CostParams {
    pub fn encode(&self) -> [u8; COST_BLOCK_LEN] {
        let mut block = [0u8; COST_BLOCK_LEN];
        block[0] = self.log_n;
        block[1..5].copy_from_slice(&self.r.to_be_bytes());
        block[5..9].copy_from_slice(&self.p.to_be_bytes());
        block
    }

    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < COST_BLOCK_LEN {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidParameterSize,
                format!(
                    "cost block must be {} bytes, got {}",
                    COST_BLOCK_LEN,
                    block.len()
                ),
            ));
        }
        let mut r = [0u8; 4];
        let mut p = [0u8; 4];
        r.copy_from_slice(&block[1..5]);
        p.copy_from_slice(&block[5..9]);
        Ok(Self {
            log_n: block[0],
            r: u32::from_be_bytes(r),
            p: u32::from_be_bytes(p),
        })
    }

    /// Bytes of memory a derivation with these parameters touches.
    pub fn memory_bytes(&self) -> u128 {
        128 * self.r as u128 * (1u128 << self.log_n.min(127))
    }

    fn to_scrypt(self, kind: ErrorKind) -> Result<scrypt::Params> {
        if self.log_n == 0 {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                kind,
                "scrypt log_n must be at least 1",
            ));
        }
        scrypt::Params::new(self.log_n, self.r, self.p, PARAMS_LEN).map_err(|e| {
            CryptError::with_kind_and_source(
                ErrorCategory::User,
                kind,
                format!(
                    "scrypt rejected cost parameters (log_n={}, r={}, p={})",
                    self.log_n, self.r, self.p
                ),
                e,
            )
        })
    }
}

/// Advisory upper bounds on the Generate-mode parameter search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budgets {
    /// Maximum memory in bytes; 0 means "no explicit cap".
    pub max_mem: u64,
    /// Maximum fraction of physical memory. Values of 0 or above 0.5 are
    /// treated as 0.5.
    pub max_mem_frac: f64,
    /// Maximum wall-clock seconds for one derivation.
    pub max_time: f64,
}

impl Budgets {
    /// Defaults when producing new parameters.
    pub const ENCRYPT: Budgets = Budgets {
        max_mem: 0,
        max_mem_frac: 0.125,
        max_time: 5.0,
    };

    /// Defaults when checking stored parameters before decrypting.
    pub const DECRYPT: Budgets = Budgets {
        max_mem: 0,
        max_mem_frac: 0.5,
        max_time: 300.0,
    };
}

impl Default for Budgets {
    fn default() -> Self {
        Self::ENCRYPT
    }
}

/// Source of machine facts the parameter search depends on.
pub trait ResourceProbe: Send + Sync {
    /// Physical memory in bytes, if known.
    fn physical_memory(&self) -> Option<u64>;

    /// Rough count of scrypt "operations" (4·N·r·p units) per second.
    fn ops_per_second(&self) -> Result<f64>;
}

/// Measures the running machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ResourceProbe for SystemProbe {
    fn physical_memory(&self) -> Option<u64> {
        physical_memory()
    }

    fn ops_per_second(&self) -> Result<f64> {
        let params = CostParams {
            log_n: CALIBRATION_LOG_N,
            r: 1,
            p: 1,
        }
        .to_scrypt(ErrorKind::ScryptFailure)?;
        let ops_per_call = 4u64 << CALIBRATION_LOG_N;
        let mut out = [0u8; 16];
        let mut calls: u64 = 0;
        let start = Instant::now();
        loop {
            scrypt::scrypt(b"", b"", &params, &mut out).map_err(|e| {
                CryptError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::ScryptFailure,
                    "scrypt calibration failed",
                    e,
                )
            })?;
            calls += 1;
            let elapsed = start.elapsed();
            if elapsed >= CALIBRATION_WINDOW {
                let opps = (calls * ops_per_call) as f64 / elapsed.as_secs_f64();
                debug!(calls, opps, "calibrated scrypt throughput");
                return Ok(opps);
            }
        }
    }
}

/// Returns fixed figures. Useful when the host already knows its machine.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe {
    pub physical_memory: u64,
    pub ops_per_second: f64,
}

impl ResourceProbe for FixedProbe {
    fn physical_memory(&self) -> Option<u64> {
        Some(self.physical_memory)
    }

    fn ops_per_second(&self) -> Result<f64> {
        Ok(self.ops_per_second)
    }
}

#[cfg(target_os = "linux")]
fn physical_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kib| kib.parse::<u64>().ok())
        .map(|kib| kib * 1024)
}

#[cfg(not(target_os = "linux"))]
fn physical_memory() -> Option<u64> {
    None
}

/// Key material produced by [`Kdf::derive`]. Wiped on drop.
#[derive(Clone)]
pub struct DerivedKey(Zeroizing<Vec<u8>>);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("len", &self.0.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Persistable cost parameters and salt. Immutable once produced.
#[derive(Clone)]
pub struct KdfParameters {
    blob: Vec<u8>,
    param_size: usize,
    mode: KdfMode,
}

impl KdfParameters {
    /// The persisted byte layout: cost block followed by salt.
    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }

    pub fn cost_block(&self) -> &[u8] {
        &self.blob[..self.param_size]
    }

    pub fn salt(&self) -> &[u8] {
        &self.blob[self.param_size..]
    }

    pub fn mode(&self) -> KdfMode {
        self.mode
    }

    pub fn cost(&self) -> Result<CostParams> {
        CostParams::decode(self.cost_block())
    }
}

impl fmt::Debug for KdfParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KdfParameters")
            .field("cost", &self.cost().ok())
            .field("salt_len", &self.salt().len())
            .field("mode", &self.mode)
            .finish()
    }
}

/// The scrypt parameter manager.
#[derive(Clone)]
pub struct Kdf {
    probe: Arc<dyn ResourceProbe>,
}

impl fmt::Debug for Kdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kdf")
            .field("param_size", &self.param_size())
            .finish_non_exhaustive()
    }
}

impl Default for Kdf {
    fn default() -> Self {
        Self::new()
    }
}

impl Kdf {
    pub fn new() -> Self {
        Self::with_probe(SystemProbe)
    }

    pub fn with_probe(probe: impl ResourceProbe + 'static) -> Self {
        Self {
            probe: Arc::new(probe),
        }
    }

    /// Size of the cost block this build of the primitive produces and expects.
    pub fn param_size(&self) -> usize {
        COST_BLOCK_LEN
    }

    /// Derive `output_len` bytes of key material from `password`.
    ///
    /// With `params == None` new parameters are generated within `budgets`.
    /// Otherwise the stored parameters are replayed and `budgets` is ignored;
    /// the stored buffer must hold at least `param_size() + salt_size` bytes.
    ///
    /// This is intentionally expensive. Use [`Kdf::derive_detached`] to keep
    /// it off a latency-sensitive path.
    pub fn derive(
        &self,
        password: &[u8],
        output_len: usize,
        budgets: &Budgets,
        params: Option<&[u8]>,
        salt_size: usize,
    ) -> Result<(DerivedKey, KdfParameters)> {
        if output_len == 0 {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidKeyLength,
                "derived key length must be non-zero",
            ));
        }

        let param_size = self.param_size();
        let expected = param_size.checked_add(salt_size).ok_or_else(|| {
            CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidParameterSize,
                "salt size overflows parameter layout",
            )
        })?;

        let (parameters, scrypt_params) = match params {
            Some(stored) => {
                if stored.len() < expected {
                    return Err(CryptError::with_kind(
                        ErrorCategory::User,
                        ErrorKind::InvalidParameterSize,
                        format!(
                            "parameters must be at least {} bytes ({} cost + {} salt), got {}",
                            expected,
                            param_size,
                            salt_size,
                            stored.len()
                        ),
                    ));
                }
                let parameters = KdfParameters {
                    blob: stored[..expected].to_vec(),
                    param_size,
                    mode: KdfMode::Recover,
                };
                let scrypt_params = parameters
                    .cost()?
                    .to_scrypt(ErrorKind::InvalidParameterSize)?;
                (parameters, scrypt_params)
            }
            None => {
                let parameters = self.generate_parameters(budgets, salt_size)?;
                let scrypt_params = parameters
                    .cost()?
                    .to_scrypt(ErrorKind::ResourceExceeded)?;
                (parameters, scrypt_params)
            }
        };

        debug!(
            mode = ?parameters.mode,
            cost = ?parameters.cost().ok(),
            output_len,
            "deriving key"
        );

        let mut key = Zeroizing::new(vec![0u8; output_len]);
        scrypt::scrypt(password, parameters.salt(), &scrypt_params, &mut key).map_err(|e| {
            CryptError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::ScryptFailure,
                "scrypt key derivation failed",
                e,
            )
        })?;

        Ok((DerivedKey(key), parameters))
    }

    /// Pick cost parameters within `budgets` and draw a fresh salt.
    ///
    /// No key is derived; the result can be persisted ahead of the first
    /// encryption and replayed through [`Kdf::derive`].
    pub fn generate_parameters(&self, budgets: &Budgets, salt_size: usize) -> Result<KdfParameters> {
        let param_size = self.param_size();
        let len = param_size.checked_add(salt_size).ok_or_else(|| {
            CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidParameterSize,
                "salt size overflows parameter layout",
            )
        })?;
        let cost = self.pick_params(budgets)?;
        let mut blob = vec![0u8; len];
        blob[..param_size].copy_from_slice(&cost.encode());
        OsRng.fill_bytes(&mut blob[param_size..]);
        Ok(KdfParameters {
            blob,
            param_size,
            mode: KdfMode::Generate,
        })
    }

    /// Run [`Kdf::derive`] on a dedicated thread.
    ///
    /// scrypt has no cancellation point; dropping the returned handle
    /// abandons the result while the thread runs to completion.
    pub fn derive_detached(
        &self,
        password: Zeroizing<Vec<u8>>,
        output_len: usize,
        budgets: Budgets,
        params: Option<Vec<u8>>,
        salt_size: usize,
    ) -> Result<PendingDerivation> {
        let kdf = self.clone();
        let handle = thread::Builder::new()
            .name("scrypt-kdf".into())
            .spawn(move || {
                kdf.derive(&password, output_len, &budgets, params.as_deref(), salt_size)
            })
            .map_err(|e| CryptError::io("failed to spawn key derivation thread", e))?;
        Ok(PendingDerivation { handle })
    }

    /// Choose scrypt cost parameters that fit within `budgets`.
    pub fn pick_params(&self, budgets: &Budgets) -> Result<CostParams> {
        let memlimit = self.memory_limit(budgets)?;
        let opslimit = self.ops_limit(budgets)?;
        let r = SCRYPT_R as f64;

        let (log_n, p) = if opslimit < memlimit as f64 / 32.0 {
            // CPU bound: one lane, N sized to the operation budget.
            let max_n = opslimit / (r * 4.0);
            (first_log_n_above(max_n / 2.0), 1)
        } else {
            // Memory bound: N sized to memory, spare time spent on p.
            let max_n = memlimit as f64 / (r * 128.0);
            let log_n = first_log_n_above(max_n / 2.0);
            let max_rp = ((opslimit / 4.0) / (1u64 << log_n) as f64).min(MAX_RP as f64) as u64;
            (log_n, (max_rp / SCRYPT_R as u64).max(1) as u32)
        };

        let cost = CostParams {
            log_n,
            r: SCRYPT_R,
            p,
        };
        debug!(memlimit, opslimit, ?cost, "picked scrypt parameters");
        Ok(cost)
    }

    /// Verify stored parameters fit within `budgets` before spending on them.
    pub fn check_params(&self, cost: &CostParams, budgets: &Budgets) -> Result<()> {
        let memlimit = self.memory_limit(budgets)? as u128;
        let opslimit = self.ops_limit(budgets)?;
        let n = 1u128 << cost.log_n.min(127);
        let r = cost.r.max(1) as u128;

        if memlimit / n / r < 128 {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::ResourceExceeded,
                format!(
                    "parameters need {} bytes of memory, budget allows {}",
                    cost.memory_bytes(),
                    memlimit
                ),
            ));
        }
        if opslimit / n as f64 / (r as f64 * cost.p as f64) < 4.0 {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::ResourceExceeded,
                "parameters need more time than the budget allows",
            ));
        }
        Ok(())
    }

    fn memory_limit(&self, budgets: &Budgets) -> Result<u64> {
        let frac = if budgets.max_mem_frac > 0.0 && budgets.max_mem_frac <= 0.5 {
            budgets.max_mem_frac
        } else {
            0.5
        };
        let physical = self
            .probe
            .physical_memory()
            .unwrap_or(FALLBACK_PHYSICAL_MEMORY);
        let mut limit = (physical as f64 * frac) as u64;
        if budgets.max_mem != 0 && limit > budgets.max_mem {
            limit = budgets.max_mem;
        }
        if limit < MIN_MEMORY_LIMIT {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::ResourceExceeded,
                format!(
                    "memory budget of {} bytes is below the {} byte minimum",
                    limit, MIN_MEMORY_LIMIT
                ),
            ));
        }
        Ok(limit)
    }

    fn ops_limit(&self, budgets: &Budgets) -> Result<f64> {
        if !budgets.max_time.is_finite() || budgets.max_time < 0.0 {
            return Err(CryptError::with_kind(
                ErrorCategory::User,
                ErrorKind::ResourceExceeded,
                format!("time budget {} is not usable", budgets.max_time),
            ));
        }
        let ops = self.probe.ops_per_second()? * budgets.max_time;
        Ok(ops.max(MIN_OPS_LIMIT))
    }
}

fn first_log_n_above(limit: f64) -> u8 {
    let mut log_n = 1u8;
    while log_n < 63 && (1u64 << log_n) as f64 <= limit {
        log_n += 1;
    }
    log_n
}

/// A derivation running on its own thread.
pub struct PendingDerivation {
    handle: thread::JoinHandle<Result<(DerivedKey, KdfParameters)>>,
}

impl PendingDerivation {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the derivation completes.
    pub fn wait(self) -> Result<(DerivedKey, KdfParameters)> {
        self.handle.join().map_err(|_| {
            CryptError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "key derivation thread panicked",
            )
        })?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Budgets that resolve to log_n=10, r=8, p=1 under `test_kdf()`.
    pub(crate) const FAST: Budgets = Budgets {
        max_mem: 1 << 20,
        max_mem_frac: 0.5,
        max_time: 0.01,
    };

    pub(crate) fn test_kdf() -> Kdf {
        Kdf::with_probe(FixedProbe {
            physical_memory: 8 << 30,
            ops_per_second: 1000.0,
        })
    }

    #[test]
    fn test_generate_then_recover() {
        let kdf = test_kdf();
        let (key, params) = kdf
            .derive(b"correct horse", 64, &FAST, None, DEFAULT_SALT_LEN)
            .unwrap();
        assert_eq!(key.len(), 64);
        assert_eq!(params.mode(), KdfMode::Generate);
        assert_eq!(params.as_bytes().len(), kdf.param_size() + DEFAULT_SALT_LEN);

        let (recovered, replayed) = kdf
            .derive(
                b"correct horse",
                64,
                &FAST,
                Some(params.as_bytes()),
                DEFAULT_SALT_LEN,
            )
            .unwrap();
        assert_eq!(replayed.mode(), KdfMode::Recover);
        assert_eq!(key.as_bytes(), recovered.as_bytes());
        assert_eq!(params.as_bytes(), replayed.as_bytes());
    }

    #[test]
    fn test_recover_is_deterministic() {
        let kdf = test_kdf();
        let mut blob = CostParams {
            log_n: 10,
            r: 8,
            p: 1,
        }
        .encode()
        .to_vec();
        blob.extend_from_slice(&[7u8; 16]);

        let (k1, _) = kdf.derive(b"pw", 32, &FAST, Some(&blob), 16).unwrap();
        let (k2, _) = kdf.derive(b"pw", 32, &FAST, Some(&blob), 16).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());

        let (other, _) = kdf.derive(b"other", 32, &FAST, Some(&blob), 16).unwrap();
        assert_ne!(k1.as_bytes(), other.as_bytes());
    }

    #[test]
    fn test_recover_matches_raw_scrypt() {
        let kdf = test_kdf();
        let mut blob = CostParams { log_n: 4, r: 1, p: 1 }.encode().to_vec();
        blob.extend_from_slice(b"NaCl");

        let (key, _) = kdf.derive(b"password", 24, &FAST, Some(&blob), 4).unwrap();

        let mut expected = [0u8; 24];
        let params = scrypt::Params::new(4, 1, 1, PARAMS_LEN).unwrap();
        scrypt::scrypt(b"password", b"NaCl", &params, &mut expected).unwrap();
        assert_eq!(key.as_bytes(), &expected);
    }

    #[test]
    fn test_generate_uses_fresh_salt() {
        let kdf = test_kdf();
        let (k1, p1) = kdf.derive(b"pw", 32, &FAST, None, 16).unwrap();
        let (k2, p2) = kdf.derive(b"pw", 32, &FAST, None, 16).unwrap();
        assert_ne!(p1.salt(), p2.salt());
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_short_recovery_buffer_rejected() {
        let kdf = test_kdf();
        let short = vec![0u8; kdf.param_size() + DEFAULT_SALT_LEN - 1];
        let err = kdf
            .derive(b"pw", 32, &FAST, Some(&short), DEFAULT_SALT_LEN)
            .expect_err("expected short buffer to be rejected");
        assert_eq!(err.kind, Some(ErrorKind::InvalidParameterSize));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let kdf = test_kdf();
        let (key, params) = kdf.derive(b"pw", 32, &FAST, None, 8).unwrap();
        let mut padded = params.as_bytes().to_vec();
        padded.extend_from_slice(b"trailing");
        let (again, replayed) = kdf.derive(b"pw", 32, &FAST, Some(&padded), 8).unwrap();
        assert_eq!(key.as_bytes(), again.as_bytes());
        assert_eq!(replayed.as_bytes(), params.as_bytes());
    }

    #[test]
    fn test_invalid_cost_block_rejected() {
        let kdf = test_kdf();
        let mut blob = CostParams { log_n: 0, r: 8, p: 1 }.encode().to_vec();
        blob.extend_from_slice(&[0u8; 8]);
        let err = kdf
            .derive(b"pw", 32, &FAST, Some(&blob), 8)
            .expect_err("expected log_n=0 to be rejected");
        assert_eq!(err.kind, Some(ErrorKind::InvalidParameterSize));

        let mut blob = CostParams { log_n: 10, r: 0, p: 1 }.encode().to_vec();
        blob.extend_from_slice(&[0u8; 8]);
        let err = kdf
            .derive(b"pw", 32, &FAST, Some(&blob), 8)
            .expect_err("expected r=0 to be rejected");
        assert_eq!(err.kind, Some(ErrorKind::InvalidParameterSize));
    }

    #[test]
    fn test_zero_output_length_rejected() {
        let err = test_kdf()
            .derive(b"pw", 0, &FAST, None, 8)
            .expect_err("expected zero-length key to be rejected");
        assert_eq!(err.kind, Some(ErrorKind::InvalidKeyLength));
    }

    #[test]
    fn test_pick_params_memory_bound() {
        let kdf = Kdf::with_probe(FixedProbe {
            physical_memory: 8 << 30,
            ops_per_second: 1_000_000.0,
        });
        let budgets = Budgets {
            max_mem: 1 << 20,
            max_mem_frac: 0.5,
            max_time: 1.0,
        };
        let cost = kdf.pick_params(&budgets).unwrap();
        assert_eq!(cost, CostParams { log_n: 10, r: 8, p: 30 });
        assert!(cost.memory_bytes() <= 1 << 20);
    }

    #[test]
    fn test_pick_params_cpu_bound() {
        let kdf = Kdf::with_probe(FixedProbe {
            physical_memory: 8 << 30,
            ops_per_second: 1_000_000.0,
        });
        let budgets = Budgets {
            max_mem: 64 << 20,
            max_mem_frac: 0.5,
            max_time: 0.1,
        };
        let cost = kdf.pick_params(&budgets).unwrap();
        assert_eq!(cost, CostParams { log_n: 11, r: 8, p: 1 });
    }

    #[test]
    fn test_pick_params_fraction_of_physical_memory() {
        let kdf = Kdf::with_probe(FixedProbe {
            physical_memory: 16 << 20,
            ops_per_second: 1e12,
        });
        // 0.9 is clamped to 0.5, so the limit is 8 MiB.
        let budgets = Budgets {
            max_mem: 0,
            max_mem_frac: 0.9,
            max_time: 1.0,
        };
        let cost = kdf.pick_params(&budgets).unwrap();
        assert_eq!(cost.log_n, 13);
        assert_eq!(cost.memory_bytes(), 8 << 20);
    }

    #[test]
    fn test_tight_memory_budget_exceeded() {
        let budgets = Budgets {
            max_mem: 512 * 1024,
            ..FAST
        };
        let err = test_kdf()
            .derive(b"pw", 32, &budgets, None, 8)
            .expect_err("expected memory budget to be too small");
        assert_eq!(err.kind, Some(ErrorKind::ResourceExceeded));
    }

    #[test]
    fn test_unusable_time_budget_exceeded() {
        let budgets = Budgets {
            max_time: f64::NAN,
            ..FAST
        };
        let err = test_kdf()
            .pick_params(&budgets)
            .expect_err("expected NaN time budget to be rejected");
        assert_eq!(err.kind, Some(ErrorKind::ResourceExceeded));
    }

    #[test]
    fn test_recover_ignores_budgets() {
        let kdf = test_kdf();
        let (key, params) = kdf.derive(b"pw", 32, &FAST, None, 8).unwrap();
        let impossible = Budgets {
            max_mem: 1,
            max_mem_frac: 0.5,
            max_time: f64::NAN,
        };
        let (again, _) = kdf
            .derive(b"pw", 32, &impossible, Some(params.as_bytes()), 8)
            .unwrap();
        assert_eq!(key.as_bytes(), again.as_bytes());
    }

    #[test]
    fn test_check_params() {
        let kdf = test_kdf();
        let cheap = CostParams { log_n: 10, r: 8, p: 1 };
        kdf.check_params(&cheap, &FAST).unwrap();

        let hungry = CostParams { log_n: 20, r: 8, p: 1 };
        let err = kdf
            .check_params(&hungry, &FAST)
            .expect_err("expected 1 GiB parameters to exceed a 1 MiB budget");
        assert_eq!(err.kind, Some(ErrorKind::ResourceExceeded));

        let slow = CostParams { log_n: 10, r: 8, p: 64 };
        let err = kdf
            .check_params(&slow, &FAST)
            .expect_err("expected p=64 to exceed the time budget");
        assert_eq!(err.kind, Some(ErrorKind::ResourceExceeded));
    }

    #[test]
    fn test_derive_detached() {
        let kdf = test_kdf();
        let pending = kdf
            .derive_detached(
                Zeroizing::new(b"correct horse".to_vec()),
                64,
                FAST,
                None,
                DEFAULT_SALT_LEN,
            )
            .unwrap();
        let (key, params) = pending.wait().unwrap();

        let (again, _) = kdf
            .derive(
                b"correct horse",
                64,
                &FAST,
                Some(params.as_bytes()),
                DEFAULT_SALT_LEN,
            )
            .unwrap();
        assert_eq!(key.as_bytes(), again.as_bytes());
    }

    #[test]
    fn test_generate_parameters_then_derive() {
        let kdf = test_kdf();
        let params = kdf.generate_parameters(&FAST, 16).unwrap();
        assert_eq!(params.mode(), KdfMode::Generate);
        assert_eq!(params.as_bytes().len(), COST_BLOCK_LEN + 16);
        assert_eq!(
            params.cost().unwrap(),
            CostParams {
                log_n: 10,
                r: 8,
                p: 1
            }
        );

        let (a, _) = kdf
            .derive(b"pw", 32, &FAST, Some(params.as_bytes()), 16)
            .unwrap();
        let (b, _) = kdf
            .derive(b"pw", 32, &FAST, Some(params.as_bytes()), 16)
            .unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_debug_redacts_key() {
        let (key, _) = test_kdf().derive(b"pw", 32, &FAST, None, 8).unwrap();
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_cost_block_layout() {
        let block = CostParams {
            log_n: 14,
            r: 8,
            p: 0x0102_0304,
        }
        .encode();
        assert_eq!(block, [14, 0, 0, 0, 8, 1, 2, 3, 4]);
        assert_eq!(
            CostParams::decode(&block).unwrap(),
            CostParams {
                log_n: 14,
                r: 8,
                p: 0x0102_0304
            }
        );
    }
}
