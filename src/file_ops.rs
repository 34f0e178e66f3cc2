//! Whole-file operations behind the command-line tool
//!
//! `encrypt_file`/`decrypt_file` stream through `crypt.scrypt` sessions and a
//! separate parameter file. `seal_file`/`open_file` use the self-contained
//! authenticated container instead.

use crate::armor;
use crate::container;
use crate::error::{CryptError, ErrorCategory, ErrorKind, Result};
use crate::kdf::{Budgets, COST_BLOCK_LEN, CostParams, DEFAULT_SALT_LEN, Kdf};
use crate::pipe::{DEFAULT_CHUNK_SIZE, Transform, commit, staging_file};
use crate::transform::{ScryptTransform, Secret, write_params};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Generate KDF parameters within `budgets` and write them to `output`.
///
/// Fails if `output` already exists.
pub fn write_params_file(kdf: &Kdf, output: &Path, budgets: &Budgets) -> Result<()> {
    let params = kdf.generate_parameters(budgets, DEFAULT_SALT_LEN)?;
    write_params(output, &params)
}

/// Encrypt `input` to `output`, keyed by `passphrase` and the parameters in `params`.
///
/// `params` is generated within `budgets` if it does not exist yet.
pub fn encrypt_file(
    kdf: &Kdf,
    input: &Path,
    output: &Path,
    params: &Path,
    budgets: &Budgets,
    passphrase: &Secret,
) -> Result<u64> {
    let mut source = File::open(input).map_err(|e| read_error(input, e))?;
    let transform =
        ScryptTransform::new(kdf.clone(), passphrase.clone(), params).with_budgets(*budgets);

    let mut session = transform.begin_write(output)?;
    session
        .write_from(&mut source, DEFAULT_CHUNK_SIZE)
        .map_err(|e| e.with_context("encryption failed"))?;
    let written = session
        .finish()
        .map_err(|e| e.with_context(format!("failed to write to {}", output.display())))?;
    info!(bytes = written, output = %output.display(), "encrypted");
    Ok(written)
}

/// Decrypt `input` to `output` using existing parameters in `params`.
///
/// Parameters that would exceed `budgets` are rejected before any key is
/// derived. `output` only appears once the whole input has been decrypted.
pub fn decrypt_file(
    kdf: &Kdf,
    input: &Path,
    output: &Path,
    params: &Path,
    budgets: &Budgets,
    passphrase: &Secret,
) -> Result<u64> {
    let stored = fs::read(params).map_err(|e| read_error(params, e))?;
    let blob = armor::unwrap_or_raw(&stored)
        .map_err(|e| e.with_context(format!("failed to decode {}", params.display())))?;
    if blob.len() < COST_BLOCK_LEN {
        return Err(CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::InvalidParameterSize,
            format!("{} is too short to hold KDF parameters", params.display()),
        ));
    }
    kdf.check_params(&CostParams::decode(&blob[..COST_BLOCK_LEN])?, budgets)?;

    let transform =
        ScryptTransform::new(kdf.clone(), passphrase.clone(), params).with_budgets(*budgets);
    let mut session = transform.begin_read(input)?;

    let decrypted = write_atomically(output, |sink| {
        let mut offset = 0u64;
        loop {
            let chunk = session
                .read(offset, DEFAULT_CHUNK_SIZE)
                .map_err(|e| e.with_context("decryption failed"))?;
            if chunk.is_empty() {
                return Ok(offset);
            }
            sink.write_all(&chunk)
                .map_err(|e| CryptError::io(format!("failed to write {}", output.display()), e))?;
            offset += chunk.len() as u64;
        }
    })?;
    session.finish()?;
    info!(bytes = decrypted, output = %output.display(), "decrypted");
    Ok(decrypted)
}

/// Seal `input` into an authenticated container, optionally armored.
pub fn seal_file(
    kdf: &Kdf,
    input: &Path,
    output: &Path,
    budgets: &Budgets,
    armored: bool,
    passphrase: &Secret,
) -> Result<()> {
    let plaintext = fs::read(input).map_err(|e| read_error(input, e))?;
    let sealed = container::seal(kdf, &plaintext, &passphrase.password()?, budgets)
        .map_err(|e| e.with_context("sealing failed"))?;
    let contents = if armored {
        armor::wrap(&sealed).into_bytes()
    } else {
        sealed
    };
    write_file_secure(output, &contents)
        .map_err(|e| e.with_context(format!("failed to write to {}", output.display())))
}

/// Open a container written by [`seal_file`], armored or raw.
pub fn open_file(
    kdf: &Kdf,
    input: &Path,
    output: &Path,
    budgets: &Budgets,
    passphrase: &Secret,
) -> Result<()> {
    let data = fs::read(input).map_err(|e| read_error(input, e))?;
    let sealed = armor::unwrap_or_raw(&data).map_err(|e| e.with_context("failed to unarmor"))?;
    let plaintext = container::open(kdf, &sealed, &passphrase.password()?, budgets)
        .map_err(|e| e.with_context("failed to open container"))?;
    write_file_secure(output, &plaintext)
        .map_err(|e| e.with_context(format!("failed to write to {}", output.display())))
}

/// Produce `path` through a staging file next to it, committed only if `fill` succeeds.
///
/// On failure any existing `path` is left untouched and the staging file is removed.
fn write_atomically<T>(path: &Path, fill: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
    let mut staged = staging_file(path, None)?;
    let value = fill(staged.as_file_mut())?;
    commit(staged, path)?;
    Ok(value)
}

fn write_file_secure(path: &Path, contents: &[u8]) -> Result<()> {
    write_atomically(path, |file| {
        file.write_all(contents)
            .map_err(|e| CryptError::io(format!("failed to write {}", path.display()), e))
    })
}

fn read_error(path: &Path, err: std::io::Error) -> CryptError {
    CryptError::io(format!("failed to read from {}", path.display()), err)
}
