use crate::crypto::{self, KdfParams};
use crate::error::{AencError, Result};
use crate::format::{Header, MAC_LEN, MIN_ENVELOPE_LEN, NONCE_LEN, TAG_LEN};
use crate::secret::Secret;
use crate::stream::{self, OpenedEnvelope};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::Mac;
use std::io::{Read, Write};
use std::path::Path;
use uuid::Uuid;
use zeroize::Zeroize;

/// Options for [`encrypt_bytes`].
#[derive(Debug, Clone)]
pub struct BytesOptions {
    /// Identifier recorded in the header; a random v4 UUID when `None`
    pub custom_uuid: Option<String>,
    /// Gzip the data before encryption
    pub enable_gzip: bool,
}

impl Default for BytesOptions {
    fn default() -> Self {
        Self {
            custom_uuid: None,
            enable_gzip: true,
        }
    }
}

/// Decrypt and return only the header of an artifact.
///
/// Runs the envelope phase of decryption and stops before the chunk stream:
/// the passphrase is still required and the header's AEAD tag is still
/// verified, but no payload byte is read and the trailing MAC is not
/// checked.
pub async fn read_header<P: AsRef<Path>>(input_path: P, passphrase: &Secret) -> Result<Header> {
    let mut file = tokio::fs::File::open(input_path.as_ref())
        .await
        .map_err(open_as_invalid_input)?;
    let envelope = stream::open_envelope(&mut file, passphrase, &KdfParams::default()).await?;
    Ok(envelope.header)
}

/// Walk an entire chunked artifact, verifying every chunk tag and the
/// trailing MAC without writing plaintext anywhere.
///
/// Returns `false` on authentication failure (wrong passphrase or
/// tampering); structural corruption and I/O errors propagate.
pub async fn verify<P: AsRef<Path>>(input_path: P, passphrase: &Secret) -> Result<bool> {
    let mut file = tokio::fs::File::open(input_path.as_ref())
        .await
        .map_err(open_as_invalid_input)?;
    let mut sink = tokio::io::sink();
    match stream::decrypt_stream(&mut file, &mut sink, passphrase, &KdfParams::default(), None)
        .await
    {
        Ok(_) => Ok(true),
        Err(AencError::AuthFailure) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Encrypt an in-memory buffer into the small-buffer artifact variant.
///
/// The layout shares magic, version, salt and encrypted header with the
/// chunked format but carries the payload as one AEAD encryption
/// (`nonce || ciphertext || tag`) with no chunk framing, followed by the
/// same trailing whole-file MAC. The two variants must not be mixed:
/// a chunked decoder rejects these artifacts.
pub async fn encrypt_bytes(
    data: &[u8],
    passphrase: &Secret,
    options: BytesOptions,
) -> Result<Vec<u8>> {
    let mut payload = if options.enable_gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()?
    } else {
        data.to_vec()
    };

    let header = Header {
        uuid: options
            .custom_uuid
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        original_name: String::new(),
        original_extension: String::new(),
        was_directory: false,
        is_compressed: options.enable_gzip,
        original_size: data.len() as i64,
        compressed_size: payload.len() as i64,
    };

    let envelope = stream::seal_envelope(&header, passphrase, &KdfParams::default())?;
    let mut mac = crypto::init_mac(&envelope.keys.mac)?;

    let nonce = crypto::random_bytes::<NONCE_LEN>();
    let sealed = crypto::aead_seal(&envelope.keys.enc, &nonce, &payload)?;
    payload.zeroize();

    let mut artifact =
        Vec::with_capacity(envelope.bytes.len() + NONCE_LEN + sealed.len() + MAC_LEN);
    artifact.extend_from_slice(&envelope.bytes);
    artifact.extend_from_slice(&nonce);
    artifact.extend_from_slice(&sealed);
    mac.update(&envelope.bytes);
    mac.update(&nonce);
    mac.update(&sealed);
    artifact.extend_from_slice(&mac.finalize().into_bytes());

    Ok(artifact)
}

/// Decrypt a small-buffer artifact produced by [`encrypt_bytes`].
///
/// The whole-file MAC is verified before the payload AEAD is opened, so no
/// plaintext exists until the entire artifact has authenticated.
pub async fn decrypt_bytes(artifact: &[u8], passphrase: &Secret) -> Result<Vec<u8>> {
    if artifact.len() < MIN_ENVELOPE_LEN + NONCE_LEN {
        return Err(AencError::Corrupt("artifact too short".to_string()));
    }

    let mut cursor = artifact;
    let OpenedEnvelope {
        header,
        keys,
        mut mac,
    } = stream::open_envelope(&mut cursor, passphrase, &KdfParams::default()).await?;

    // `cursor` now holds nonce || ciphertext || tag || trailing MAC
    let rest = cursor;
    if rest.len() < NONCE_LEN + TAG_LEN + MAC_LEN {
        return Err(AencError::Corrupt("artifact truncated".to_string()));
    }
    let ct_len = rest.len() - NONCE_LEN - TAG_LEN - MAC_LEN;
    if header.compressed_size as u64 != ct_len as u64 {
        return Err(AencError::Corrupt(format!(
            "payload length {} does not match declared {}",
            ct_len, header.compressed_size
        )));
    }

    let nonce: [u8; NONCE_LEN] = rest[..NONCE_LEN].try_into().expect("nonce slice");
    let sealed = &rest[NONCE_LEN..rest.len() - MAC_LEN];
    let stored_mac = &rest[rest.len() - MAC_LEN..];

    mac.update(&nonce);
    mac.update(sealed);
    let computed = mac.finalize().into_bytes();
    if !crypto::macs_equal(&computed, stored_mac) {
        return Err(AencError::AuthFailure);
    }

    let mut payload = crypto::aead_open(&keys.enc, &nonce, sealed)?;

    let plain = if header.is_compressed {
        let mut decoder = GzDecoder::new(&payload[..]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|_| AencError::Corrupt("invalid gzip payload".to_string()))?;
        payload.zeroize();
        out
    } else {
        payload
    };

    if plain.len() as u64 != header.original_size as u64 {
        return Err(AencError::Corrupt(format!(
            "decoded size {} does not match declared {}",
            plain.len(),
            header.original_size
        )));
    }

    Ok(plain)
}

fn open_as_invalid_input(err: std::io::Error) -> AencError {
    if err.kind() == std::io::ErrorKind::NotFound {
        AencError::InvalidInput("input path does not exist".to_string())
    } else {
        AencError::Io(err)
    }
}
