use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A wrapper around sensitive bytes (passphrases, intermediate key material)
/// that:
/// - Zeroes memory on drop
/// - Prevents cloning to reduce copies
/// - Prevents debug printing to avoid logs
/// - Provides controlled access via closures
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Secret {
    data: Vec<u8>,
}

impl Secret {
    /// Create a new Secret from a byte vector.
    ///
    /// The vector is consumed and zeroized when the Secret is dropped.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Create a new Secret from a byte slice (copies the data).
    pub fn from_slice(slice: &[u8]) -> Self {
        Self {
            data: slice.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Access the secret data through a closure.
    ///
    /// This is the only way to read the bytes; the data is exposed only
    /// within the closure scope.
    pub fn expose<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.data)
    }
}

// No Clone: accidental copies would leave stray plaintext key material.
// No derived Debug: secrets must never reach logs or panic messages.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("data", &"<redacted>")
            .finish()
    }
}

/// Fixed-size secret for keys of a known length.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretArray<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> SecretArray<N> {
    pub fn new(data: [u8; N]) -> Self {
        Self { data }
    }

    /// Access the secret data through a closure.
    pub fn expose<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; N]) -> R,
    {
        f(&self.data)
    }
}

impl<const N: usize> fmt::Debug for SecretArray<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretArray")
            .field("data", &"<redacted>")
            .finish()
    }
}

/// The two independent 256-bit keys one derivation produces: `enc` feeds the
/// per-chunk AEAD, `mac` keys the trailing whole-file HMAC. Both halves come
/// from a single KDF output and are only ever used together for one artifact.
pub struct DerivedKeys {
    pub enc: SecretArray<32>,
    pub mac: SecretArray<32>,
}

impl DerivedKeys {
    /// Split a 64-byte KDF output: first half becomes the AEAD key, second
    /// half the MAC key. The input is zeroized before this returns.
    pub fn from_kdf_output(mut output: [u8; 64]) -> Self {
        let mut enc = [0u8; 32];
        let mut mac = [0u8; 32];
        enc.copy_from_slice(&output[..32]);
        mac.copy_from_slice(&output[32..]);
        output.zeroize();
        Self {
            enc: SecretArray::new(enc),
            mac: SecretArray::new(mac),
        }
    }
}

impl fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKeys")
            .field("enc", &"<redacted>")
            .field("mac", &"<redacted>")
            .finish()
    }
}
