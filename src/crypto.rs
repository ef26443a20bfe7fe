use crate::error::{AencError, Result};
use crate::format::{NONCE_LEN, SALT_LEN};
use crate::secret::{DerivedKeys, Secret, SecretArray};
use argon2::{Algorithm, Argon2, ParamsBuilder, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;

/// Streaming whole-file authenticator, keyed with the MAC half of the
/// derived key pair.
pub type HmacSha256 = Hmac<Sha256>;

// Argon2id defaults. Memory and iteration counts follow the OWASP
// password-storage cheat sheet configuration (19 MiB, t=2, p=1).
pub const DEFAULT_MEMORY_KIB: u32 = 19456;
pub const DEFAULT_ITERATIONS: u32 = 2;
pub const DEFAULT_PARALLELISM: u32 = 1;

// The KDF emits one 64-byte block that is split into the AEAD and MAC keys.
const KDF_OUTPUT_LEN: usize = 64;

/// Tunable Argon2id cost parameters.
///
/// The container format does not persist these, so an artifact produced with
/// overridden costs only decrypts with the same override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: DEFAULT_MEMORY_KIB,
            iterations: DEFAULT_ITERATIONS,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

/// Severity of a parameter-validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// One finding from [`validate_params`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamIssue {
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for ParamIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Error => write!(f, "error: {}", self.message),
            Severity::Warning => write!(f, "warning: {}", self.message),
        }
    }
}

/// Check Argon2id cost parameters without running the KDF.
///
/// Errors make [`derive`] unusable with these values; warnings flag
/// configurations weaker than current OWASP guidance but still accepted.
pub fn validate_params(memory_kib: u32, parallelism: u32, iterations: u32) -> Vec<ParamIssue> {
    let mut issues = Vec::new();

    if memory_kib < 8 {
        issues.push(ParamIssue {
            severity: Severity::Error,
            message: format!("Memory cost must be at least 8 KiB, got {}", memory_kib),
        });
    }
    if parallelism < 1 {
        issues.push(ParamIssue {
            severity: Severity::Error,
            message: "Parallelism must be at least 1".to_string(),
        });
    }
    if iterations < 1 {
        issues.push(ParamIssue {
            severity: Severity::Error,
            message: "Iterations must be at least 1".to_string(),
        });
    }
    if memory_kib < DEFAULT_MEMORY_KIB && iterations < 3 {
        issues.push(ParamIssue {
            severity: Severity::Warning,
            message: format!(
                "Memory cost {} KiB with {} iterations is weaker than OWASP guidance",
                memory_kib, iterations
            ),
        });
    }

    issues
}

/// Generate cryptographically secure random bytes.
pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Derive the AEAD/MAC key pair from a passphrase with Argon2id.
///
/// When `salt` is `None` a fresh 16-byte salt is generated; a supplied salt
/// must be exactly 16 bytes. The returned salt is the one actually used and
/// is what the container stores in cleartext.
///
/// This call is intentionally expensive (hundreds of milliseconds with the
/// default costs) and blocks the current thread; run it on a worker when an
/// interactive context must stay responsive.
pub fn derive(
    passphrase: &Secret,
    salt: Option<&[u8]>,
    params: &KdfParams,
) -> Result<(DerivedKeys, [u8; SALT_LEN])> {
    if passphrase.is_empty() {
        return Err(AencError::InvalidInput(
            "passphrase must not be empty".to_string(),
        ));
    }

    let salt: [u8; SALT_LEN] = match salt {
        None => random_bytes::<SALT_LEN>(),
        Some(bytes) if bytes.is_empty() => {
            return Err(AencError::InvalidInput(
                "salt must not be empty".to_string(),
            ));
        }
        Some(bytes) => bytes.try_into().map_err(|_| {
            AencError::InvalidInput(format!(
                "salt must be {} bytes, got {}",
                SALT_LEN,
                bytes.len()
            ))
        })?,
    };

    let argon_params = ParamsBuilder::new()
        .m_cost(params.memory_kib)
        .t_cost(params.iterations)
        .p_cost(params.parallelism)
        .output_len(KDF_OUTPUT_LEN)
        .build()
        .map_err(|e| AencError::InvalidInput(format!("invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut output = [0u8; KDF_OUTPUT_LEN];
    passphrase.expose(|pwd| {
        argon2
            .hash_password_into(pwd, &salt, &mut output)
            .map_err(|e| AencError::Internal(format!("Argon2 failed: {}", e)))
    })?;

    Ok((DerivedKeys::from_kdf_output(output), salt))
}

/// AEAD-encrypt `plaintext` under `key` and `nonce`.
///
/// Returns ciphertext followed by the 16-byte Poly1305 tag, which is exactly
/// the byte order the container stores.
pub(crate) fn aead_seal(
    key: &SecretArray<32>,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = key.expose(|k| {
        XChaCha20Poly1305::new_from_slice(k)
            .map_err(|e| AencError::Internal(format!("invalid AEAD key: {}", e)))
    })?;
    cipher
        .encrypt(&(*nonce).into(), plaintext)
        .map_err(|e| AencError::Internal(format!("AEAD encryption failed: {}", e)))
}

/// AEAD-decrypt `ciphertext_and_tag` (ciphertext with the trailing 16-byte
/// tag) under `key` and `nonce`. Tag mismatch is the single opaque
/// [`AencError::AuthFailure`].
pub(crate) fn aead_open(
    key: &SecretArray<32>,
    nonce: &[u8; NONCE_LEN],
    ciphertext_and_tag: &[u8],
) -> Result<Vec<u8>> {
    let cipher = key.expose(|k| {
        XChaCha20Poly1305::new_from_slice(k)
            .map_err(|e| AencError::Internal(format!("invalid AEAD key: {}", e)))
    })?;
    cipher
        .decrypt(&(*nonce).into(), ciphertext_and_tag)
        .map_err(|_| AencError::AuthFailure)
}

/// Initialize the streaming whole-file MAC with the derived MAC key.
pub(crate) fn init_mac(key: &SecretArray<32>) -> Result<HmacSha256> {
    key.expose(|k| {
        <HmacSha256 as Mac>::new_from_slice(k)
            .map_err(|e| AencError::Internal(format!("invalid MAC key: {}", e)))
    })
}

/// Constant-time MAC comparison.
pub(crate) fn macs_equal(computed: &[u8], stored: &[u8]) -> bool {
    computed.len() == stored.len() && bool::from(computed.ct_eq(stored))
}
