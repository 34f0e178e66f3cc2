//! Versioned armoring for parameter blobs and sealed containers
//!
//! The armored form is:
//! - Free of whitespace (including newlines)
//! - Safe to embed in URLs and plugin configuration strings
//! - Safe to pass unescaped in a POSIX shell

use crate::error::{CryptError, ErrorCategory, ErrorKind, Result};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

/// Magic prefix shared by all armor versions
const MAGIC_PREFIX: &str = "scryptctr";

/// Version 1 magic marker
const V1_MAGIC: &str = "scryptctr1:";

/// Wrap bytes in armor, returning the armored string
///
/// Format: scryptctr1:{base64url-no-padding}
pub fn wrap(body: &[u8]) -> String {
    format!("{}{}", V1_MAGIC, URL_SAFE_NO_PAD.encode(body))
}

/// Unwrap an armored string, returning the original bytes
///
/// Surrounding whitespace (e.g. a trailing newline from an editor) is ignored.
pub fn unwrap(armored: &str) -> Result<Vec<u8>> {
    let armored = armored.trim();
    if armored.len() < V1_MAGIC.len() {
        return Err(CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::ArmoringInvalid,
            "input size smaller than magic marker; likely truncated",
        ));
    }

    if let Some(encoded) = armored.strip_prefix(V1_MAGIC) {
        URL_SAFE_NO_PAD.decode(encoded).map_err(|e| {
            CryptError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::ArmoringDecode,
                format!("base64 decoding failed: {}", e),
                e,
            )
        })
    } else if armored.starts_with(MAGIC_PREFIX) {
        Err(CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::ArmoringFromFuture,
            "input claims to be armored, but not with a version we support",
        ))
    } else {
        Err(CryptError::with_kind(
            ErrorCategory::User,
            ErrorKind::ArmoringInvalid,
            "input unrecognized as armored data",
        ))
    }
}

/// Accept either armored text or raw bytes.
///
/// Persisted parameter files may be written in either form.
pub fn unwrap_or_raw(data: &[u8]) -> Result<Vec<u8>> {
    match std::str::from_utf8(data) {
        Ok(text) if text.trim_start().starts_with(MAGIC_PREFIX) => unwrap(text),
        _ => Ok(data.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_bytes() {
        let armored = wrap(b"");
        assert_eq!(armored, "scryptctr1:");
        assert!(unwrap(&armored).unwrap().is_empty());
    }

    #[test]
    fn test_parameter_blob() {
        let blob: Vec<u8> = (0..41).collect();
        let armored = wrap(&blob);
        assert_eq!(unwrap(&armored).unwrap(), blob);
        assert_eq!(unwrap(&format!("{}\n", armored)).unwrap(), blob);
    }

    #[test]
    fn test_known_encoding() {
        assert_eq!(wrap(&[0xfb, 0xff, 0xfe]), "scryptctr1:-__-");
    }

    #[test]
    fn test_truncated_input() {
        let err = unwrap("").expect_err("expected truncated input error");
        assert_eq!(err.kind, Some(ErrorKind::ArmoringInvalid));
    }

    #[test]
    fn test_wrong_version() {
        let err = unwrap("scryptctr999999:...").expect_err("expected unsupported version error");
        assert_eq!(err.kind, Some(ErrorKind::ArmoringFromFuture));
    }

    #[test]
    fn test_not_armored() {
        let err = unwrap("something not looking like armored data")
            .expect_err("expected non-armored error");
        assert_eq!(err.kind, Some(ErrorKind::ArmoringInvalid));
    }

    #[test]
    fn test_bad_base64() {
        let err = unwrap("scryptctr1:bad$$").expect_err("expected base64 decode error");
        assert_eq!(err.kind, Some(ErrorKind::ArmoringDecode));
    }

    #[test]
    fn test_unwrap_or_raw() {
        let raw = vec![0x0a, 0, 0, 0, 8, 0, 0, 0, 1, 0xff];
        assert_eq!(unwrap_or_raw(&raw).unwrap(), raw);
        assert_eq!(unwrap_or_raw(wrap(&raw).as_bytes()).unwrap(), raw);
    }

    #[test]
    fn test_url_and_shell_safe() {
        let armored = wrap(&[0xFFu8; 100]);
        for c in ['+', '/', '=', ' ', '\n', ','] {
            assert!(!armored.contains(c), "armored text contains {:?}", c);
        }
    }
}
