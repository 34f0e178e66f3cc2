//! Streaming scrypt + AES-CTR encryption transforms
//!
//! The library is organised bottom-up:
//! - [`kdf`] generates or recovers scrypt parameters and derives keys
//! - [`stream`] is a resumable AES counter-mode keystream
//! - [`pipe`] drives a keystream over chunked, offset-addressed file I/O
//! - [`registry`] exposes configured transforms by name to a host
//!
//! [`container`] and [`armor`] provide an authenticated single-buffer
//! format on top of the same primitives.

#![forbid(unsafe_code)]

pub mod armor;
pub mod container;
pub mod error;
pub mod file_ops;
pub mod kdf;
pub mod pipe;
pub mod registry;
pub mod stream;
pub mod transform;

pub use error::{CryptError, ErrorCategory, ErrorKind, Result};
pub use kdf::{Budgets, DerivedKey, Kdf, KdfMode, KdfParameters};
pub use pipe::{Direction, Session, Transform};
pub use registry::{Availability, Capability, PluginDescriptor, PrimitiveContract, Registry};
pub use stream::{CipherState, KeySchedule, apply_stream, init_engine};
