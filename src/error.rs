use thiserror::Error;

/// Error type for every operation in this crate.
///
/// Authentication failures are deliberately a single opaque kind: the caller
/// must not be able to tell a wrong passphrase from a tampered artifact.
#[derive(Debug, Error)]
pub enum AencError {
    /// Caller-supplied input was rejected before any work started
    /// (empty passphrase, missing input path, bad chunk size, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The artifact's structure is impossible: bad magic, unsupported
    /// version, out-of-range lengths, or a short read mid-container.
    #[error("corrupt container: {0}")]
    Corrupt(String),

    /// An AEAD tag or the trailing whole-file MAC did not verify.
    #[error("authentication failed: wrong passphrase or tampered data")]
    AuthFailure,

    /// Underlying filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A condition that indicates a bug rather than bad input.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AencError>;

impl AencError {
    /// Remap short reads to `Corrupt`: inside a container, hitting EOF where
    /// the framing promised more bytes means truncation, not an I/O fault.
    pub(crate) fn from_read(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            AencError::Corrupt("artifact truncated".to_string())
        } else {
            AencError::Io(err)
        }
    }
}
