//! AENC - Password-Based File and Directory Encryption
//!
//! A streaming encryption engine that turns a file or directory plus a
//! passphrase into a single self-describing artifact, using:
//! - Argon2id for key derivation (one output split into AEAD and MAC keys)
//! - XChaCha20-Poly1305 for per-chunk authenticated encryption
//! - HMAC-SHA256 as a trailing whole-file authenticator
//!
//! # Security Features
//! - Memory-safe `Secret` wrappers with automatic zeroization
//! - Fresh random 24-byte nonce for the header and every chunk
//! - Chunk plaintext released only after its AEAD tag verifies
//! - Trailing MAC over every artifact byte closes reordering and
//!   truncation attacks across chunks
//! - Constant-time MAC comparison
//!
//! # Architecture
//! - `error`: error taxonomy and result alias
//! - `secret`: memory-safe secret wrappers and the derived key pair
//! - `crypto`: Argon2id derivation, AEAD and MAC primitives
//! - `format`: artifact byte layout (magic, framing, encrypted header)
//! - `stream`: bounded-memory chunked encrypt/decrypt engine
//! - `archive`: gzip/ZIP façade mapping files and directories to payloads
//! - `ops`: header-only read, artifact verification, small-buffer mode
//!
//! # Example
//! ```rust,ignore
//! use aenc::{archive, Secret};
//!
//! let passphrase = Secret::from_slice(b"correct horse battery staple");
//! let outcome = archive::encrypt(
//!     "notes.txt",
//!     "notes.aenc",
//!     &passphrase,
//!     Default::default(),
//! ).await?;
//! println!("wrote {} bytes as {}", outcome.bytes_written, outcome.uuid);
//! ```

pub mod archive;
pub mod crypto;
pub mod error;
pub mod format;
pub mod ops;
pub mod secret;
pub mod stream;

// Re-export commonly used types
pub use archive::{decrypt, encrypt, DecryptOptions, DecryptOutcome, EncryptOptions, EncryptOutcome};
pub use crypto::{derive, validate_params, KdfParams, ParamIssue, Severity};
pub use error::{AencError, Result};
pub use format::{Header, DEFAULT_CHUNK_SIZE, MAGIC, VERSION};
pub use ops::{decrypt_bytes, encrypt_bytes, read_header, verify, BytesOptions};
pub use secret::{DerivedKeys, Secret, SecretArray};
pub use stream::{decrypt_stream, encrypt_stream, ProgressFn};
