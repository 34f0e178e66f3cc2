//! Chunked read/write sessions
//!
//! A session binds a cipher state to one local file:
//! - Read sessions stream the transformed contents of a source file
//! - Write sessions transform incoming chunks into a staging file next to
//!   the sink and atomically move it into place on `finish`
//!
//! Offsets within a session must never decrease; the counter cannot rewind.
//! Gaps are allowed and skip the corresponding keystream.

use crate::error::{CryptError, ErrorCategory, ErrorKind, Result};
use crate::stream::CipherState;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Default chunk size for [`Session::write_from`] (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// A configured transform a host can open sessions on.
pub trait Transform: Send + Sync {
    /// The capability name this transform was created under.
    fn name(&self) -> &str;

    /// Open a session that reads transformed bytes from `source`.
    fn begin_read(&self, source: &Path) -> Result<Session>;

    /// Open a session that writes transformed bytes to `sink`.
    fn begin_write(&self, sink: &Path) -> Result<Session>;

    /// Whether [`Transform::transform_path`] does anything.
    fn supports_path_transform(&self) -> bool {
        false
    }

    /// Transform a whole file in one call. Unsupported unless overridden.
    fn transform_path(&self, input: &Path, output: &Path) -> Result<()> {
        Err(CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::NotImplemented,
            format!(
                "{} does not implement whole-path transforms ({} -> {})",
                self.name(),
                input.display(),
                output.display()
            ),
        ))
    }
}

enum Channel {
    Source { file: File, path: PathBuf },
    Sink { staged: NamedTempFile, target: PathBuf },
}

/// One open read or write session. Finalized exactly once by [`Session::finish`].
///
/// Dropping an unfinished write session deletes its staging file.
pub struct Session {
    direction: Direction,
    cipher: CipherState,
    channel: Option<Channel>,
    data_start: u64,
    transferred: u64,
}

impl Session {
    /// Open `source` for reading through `cipher`.
    pub fn open_read(source: &Path, cipher: CipherState) -> Result<Self> {
        Self::open_read_from(source, 0, cipher)
    }

    /// Like [`Session::open_read`], but offset 0 maps to byte `data_start` of the source.
    pub fn open_read_from(source: &Path, data_start: u64, cipher: CipherState) -> Result<Self> {
        let file = File::open(source)
            .map_err(|e| CryptError::io(format!("failed to open {}", source.display()), e))?;
        debug!(source = %source.display(), data_start, "opened read session");
        Ok(Self {
            direction: Direction::Read,
            cipher,
            channel: Some(Channel::Source {
                file,
                path: source.to_path_buf(),
            }),
            data_start,
            transferred: 0,
        })
    }

    /// Stage writes for `sink` in `staging_dir` (default: the sink's directory).
    ///
    /// The staging directory must be on the same filesystem as the sink.
    pub fn open_write(sink: &Path, staging_dir: Option<&Path>, cipher: CipherState) -> Result<Self> {
        Self::open_write_with_header(sink, staging_dir, &[], cipher)
    }

    /// Like [`Session::open_write`], but the sink starts with `header`, untransformed.
    ///
    /// Offsets passed to [`Session::write`] are relative to the end of the header.
    pub fn open_write_with_header(
        sink: &Path,
        staging_dir: Option<&Path>,
        header: &[u8],
        cipher: CipherState,
    ) -> Result<Self> {
        let mut staged = staging_file(sink, staging_dir)?;
        staged
            .write_all(header)
            .map_err(|e| staging_error("failed to write stream header", e))?;
        debug!(
            sink = %sink.display(),
            staged = %staged.path().display(),
            "opened write session"
        );
        Ok(Self {
            direction: Direction::Write,
            cipher,
            channel: Some(Channel::Sink {
                staged,
                target: sink.to_path_buf(),
            }),
            data_start: header.len() as u64,
            transferred: 0,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The lowest offset the next read/write may use.
    pub fn offset(&self) -> u64 {
        self.cipher.position()
    }

    pub fn is_finished(&self) -> bool {
        self.channel.is_none()
    }

    /// Return the transformed bytes of `[offset, offset + length)`.
    ///
    /// The result is shorter than `length` at end of file.
    pub fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let file = match self.channel.as_mut() {
            None => return Err(closed("read")),
            Some(Channel::Sink { .. }) => return Err(wrong_direction("read", self.direction)),
            Some(Channel::Source { file, .. }) => file,
        };
        self.cipher.advance_to(offset)?;

        let position = file_position(self.data_start, offset)?;
        file.seek(SeekFrom::Start(position))
            .map_err(|e| CryptError::io(format!("failed to seek to {}", offset), e))?;
        let mut buf = Vec::new();
        file.take(length as u64)
            .read_to_end(&mut buf)
            .map_err(|e| CryptError::io(format!("failed to read at {}", offset), e))?;

        self.cipher.apply_in_place(&mut buf);
        self.transferred += buf.len() as u64;
        Ok(buf)
    }

    /// Transform `data` and stage it at `offset`.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let staged = match self.channel.as_mut() {
            None => return Err(closed("write")),
            Some(Channel::Source { .. }) => return Err(wrong_direction("write", self.direction)),
            Some(Channel::Sink { staged, .. }) => staged,
        };
        self.cipher.advance_to(offset)?;

        let position = file_position(self.data_start, offset)?;
        let mut buf = data.to_vec();
        self.cipher.apply_in_place(&mut buf);
        let file = staged.as_file_mut();
        file.seek(SeekFrom::Start(position))
            .map_err(|e| CryptError::io(format!("failed to seek staging file to {}", offset), e))?;
        file.write_all(&buf)
            .map_err(|e| CryptError::io(format!("failed to write staging file at {}", offset), e))?;
        self.transferred += buf.len() as u64;
        Ok(())
    }

    /// Copy everything from `reader` into this write session, starting at the current offset.
    pub fn write_from(&mut self, reader: &mut dyn Read, chunk_size: usize) -> Result<u64> {
        let mut chunk = vec![0u8; chunk_size.max(1)];
        let mut copied = 0u64;
        loop {
            let n = reader
                .read(&mut chunk)
                .map_err(|e| CryptError::io("failed to read input", e))?;
            if n == 0 {
                return Ok(copied);
            }
            self.write(self.offset(), &chunk[..n])?;
            copied += n as u64;
        }
    }

    /// Flush, commit and release the session. Returns bytes transferred.
    pub fn finish(&mut self) -> Result<u64> {
        let channel = self.channel.take().ok_or_else(|| closed("finish"))?;
        match channel {
            Channel::Source { path, .. } => {
                debug!(source = %path.display(), bytes = self.transferred, "finished read session");
            }
            Channel::Sink { staged, target } => {
                commit(staged, &target)?;
                debug!(sink = %target.display(), bytes = self.transferred, "committed write session");
            }
        }
        Ok(self.transferred)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(Channel::Sink { target, .. }) = &self.channel {
            warn!(sink = %target.display(), "write session abandoned; discarding staged data");
        }
    }
}

/// Create an anonymous staging file for `target` in `staging_dir`, or next to `target`.
pub(crate) fn staging_file(target: &Path, staging_dir: Option<&Path>) -> Result<NamedTempFile> {
    let dir = match staging_dir {
        Some(dir) => dir,
        None => match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        },
    };
    tempfile::Builder::new()
        .prefix(".scryptctr-")
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(|e| staging_error(format!("failed to create staging file in {}", dir.display()), e))
}

/// Atomically move a staged file onto `target` (fsync + rename).
///
/// Either the old file or the new file exists afterwards, never a partial one.
pub(crate) fn commit(mut staged: NamedTempFile, target: &Path) -> Result<()> {
    // Flush and fsync() such that the rename later, if it succeeds, will
    // always point to a valid file.
    staged
        .flush()
        .map_err(|e| staging_error("failed to flush staging file", e))?;
    staged
        .as_file()
        .sync_all()
        .map_err(|e| staging_error("failed to sync staging file prior to rename", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = staged
            .as_file()
            .metadata()
            .map_err(|e| staging_error("failed to get staging file metadata", e))?
            .permissions();
        perms.set_mode(0o600);
        staged
            .as_file()
            .set_permissions(perms)
            .map_err(|e| staging_error("failed to set staging file permissions", e))?;
    }

    staged.persist(target).map_err(|e| {
        staging_error(
            format!("failed to rename to target file {}", target.display()),
            e.error,
        )
    })?;
    Ok(())
}

fn file_position(data_start: u64, offset: u64) -> Result<u64> {
    data_start.checked_add(offset).ok_or_else(|| {
        CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::Io,
            format!("offset {} is out of range", offset),
        )
    })
}

fn staging_error(msg: impl Into<String>, err: std::io::Error) -> CryptError {
    CryptError::with_kind_and_source(ErrorCategory::Internal, ErrorKind::Staging, msg, err)
}

fn closed(op: &str) -> CryptError {
    CryptError::with_kind(
        ErrorCategory::User,
        ErrorKind::SessionClosed,
        format!("cannot {} on a finished session", op),
    )
}

fn wrong_direction(op: &str, direction: Direction) -> CryptError {
    CryptError::with_kind(
        ErrorCategory::User,
        ErrorKind::WrongDirection,
        format!("cannot {} on a {:?} session", op, direction),
    )
}
