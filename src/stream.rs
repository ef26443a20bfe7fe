use crate::crypto::{self, HmacSha256, KdfParams};
use crate::error::{AencError, Result};
use crate::format::{
    chunk_count_for, chunk_plain_len, write_envelope_prefix, Header, MAGIC, MAC_LEN,
    MAX_HEADER_LEN, MIN_HEADER_LEN, NONCE_LEN, SALT_LEN, TAG_LEN, VERSION,
};
use crate::secret::{DerivedKeys, Secret, SecretArray};
use hmac::Mac;
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroize;

/// Progress callback: `(bytes_processed, total_bytes)` after each chunk.
/// Calls are monotonic nondecreasing in the first component.
pub type ProgressFn = Box<dyn FnMut(u64, u64) + Send>;

// Flush the sink every few chunks so OS write buffers stay bounded.
const FLUSH_INTERVAL_CHUNKS: i64 = 8;

// Payload reads are buffered in slices this large before chunking.
const READ_BUF_LEN: usize = 64 * 1024;

/// The envelope (magic through header tag) serialized and sealed, together
/// with the keys derived for this artifact.
pub(crate) struct SealedEnvelope {
    pub bytes: Vec<u8>,
    pub keys: DerivedKeys,
}

/// Derive fresh keys and seal the header into envelope bytes.
///
/// Runs the KDF, so this blocks for as long as Argon2id takes.
pub(crate) fn seal_envelope(
    header: &Header,
    passphrase: &Secret,
    params: &KdfParams,
) -> Result<SealedEnvelope> {
    let (keys, salt) = crypto::derive(passphrase, None, params)?;
    let header_plain = header.to_bytes()?;
    let header_nonce = crypto::random_bytes::<NONCE_LEN>();
    let sealed = crypto::aead_seal(&keys.enc, &header_nonce, &header_plain)?;

    // aead_seal output is ciphertext || tag; the length field counts only
    // the ciphertext, which matches the plaintext length exactly.
    let ct_len = sealed.len() - TAG_LEN;
    let mut bytes = Vec::with_capacity(crate::format::ENVELOPE_PREFIX_LEN + sealed.len());
    write_envelope_prefix(&mut bytes, &salt, &header_nonce, ct_len)?;
    bytes.extend_from_slice(&sealed);

    Ok(SealedEnvelope { bytes, keys })
}

/// Everything known after decrypting the header: the parsed metadata, the
/// derived keys, and the streaming MAC already fed with every byte read.
pub(crate) struct OpenedEnvelope {
    pub header: Header,
    pub keys: DerivedKeys,
    pub mac: HmacSha256,
}

/// Read and authenticate the envelope (decrypt steps 1-6).
///
/// Magic and version are checked before the expensive KDF runs. A header
/// tag mismatch is indistinguishable from a wrong passphrase by design.
pub(crate) async fn open_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
    passphrase: &Secret,
    params: &KdfParams,
) -> Result<OpenedEnvelope> {
    let mut magic = [0u8; 4];
    read_exact(reader, &mut magic).await?;
    if magic != MAGIC {
        return Err(AencError::Corrupt("bad magic bytes".to_string()));
    }

    let mut version = [0u8; 1];
    read_exact(reader, &mut version).await?;
    if version[0] != VERSION {
        return Err(AencError::Corrupt(format!(
            "unsupported version: {}",
            version[0]
        )));
    }

    let mut salt = [0u8; SALT_LEN];
    read_exact(reader, &mut salt).await?;

    let (keys, _) = crypto::derive(passphrase, Some(&salt), params)?;
    let mut mac = crypto::init_mac(&keys.mac)?;
    mac.update(&magic);
    mac.update(&version);
    mac.update(&salt);

    let mut header_nonce = [0u8; NONCE_LEN];
    read_exact(reader, &mut header_nonce).await?;
    mac.update(&header_nonce);

    let mut len_bytes = [0u8; 4];
    read_exact(reader, &mut len_bytes).await?;
    mac.update(&len_bytes);
    let header_len = u32::from_be_bytes(len_bytes) as usize;
    if header_len > MAX_HEADER_LEN {
        return Err(AencError::Corrupt(format!(
            "header length {} exceeds maximum {}",
            header_len, MAX_HEADER_LEN
        )));
    }
    if header_len < MIN_HEADER_LEN {
        return Err(AencError::Corrupt(format!(
            "header length {} below minimum {}",
            header_len, MIN_HEADER_LEN
        )));
    }

    let mut sealed = vec![0u8; header_len + TAG_LEN];
    read_exact(reader, &mut sealed).await?;
    mac.update(&sealed);

    let header_plain = crypto::aead_open(&keys.enc, &header_nonce, &sealed)?;
    let header = Header::from_bytes(&header_plain)?;

    Ok(OpenedEnvelope { header, keys, mac })
}

/// Encrypt a finite payload stream into the chunked artifact layout.
///
/// `header.compressed_size` must equal the exact byte length of `payload`;
/// the chunk count is committed to the artifact before the first chunk is
/// read, so a shorter or longer stream aborts with an internal error.
///
/// Returns the total number of artifact bytes written. The caller owns sink
/// cleanup: on error, any partially written output must be deleted.
pub async fn encrypt_stream<R, W>(
    header: &Header,
    payload: &mut R,
    sink: &mut W,
    passphrase: &Secret,
    chunk_size: u32,
    params: &KdfParams,
    mut progress: Option<&mut ProgressFn>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if chunk_size == 0 {
        return Err(AencError::InvalidInput(
            "chunk size must be positive".to_string(),
        ));
    }

    let payload_len = header.compressed_size as u64;
    let envelope = seal_envelope(header, passphrase, params)?;
    let keys = envelope.keys;
    let mut mac = crypto::init_mac(&keys.mac)?;

    sink.write_all(&envelope.bytes).await?;
    mac.update(&envelope.bytes);
    let mut written = envelope.bytes.len() as u64;

    let chunk_count = chunk_count_for(payload_len, chunk_size);
    let mut framing = [0u8; 12];
    framing[..4].copy_from_slice(&chunk_size.to_be_bytes());
    framing[4..].copy_from_slice(&chunk_count.to_be_bytes());
    sink.write_all(&framing).await?;
    mac.update(&framing);
    written += framing.len() as u64;

    debug!(
        "encrypting {} payload bytes as {} chunk(s) of {}",
        payload_len, chunk_count, chunk_size
    );

    let mut pending: Vec<u8> = Vec::new();
    let mut read_buf = vec![0u8; READ_BUF_LEN];
    let mut emitted: i64 = 0;
    let mut fed: u64 = 0;

    loop {
        let n = payload.read(&mut read_buf).await?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&read_buf[..n]);

        while pending.len() >= chunk_size as usize {
            let mut chunk: Vec<u8> = pending.drain(..chunk_size as usize).collect();
            written += emit_chunk(sink, &mut mac, &keys.enc, &mut chunk).await?;
            emitted += 1;
            fed += chunk_size as u64;
            if let Some(cb) = progress.as_deref_mut() {
                cb(fed, payload_len);
            }
            if emitted % FLUSH_INTERVAL_CHUNKS == 0 {
                sink.flush().await?;
            }
        }
    }

    if !pending.is_empty() {
        let mut chunk = std::mem::take(&mut pending);
        let chunk_len = chunk.len() as u64;
        written += emit_chunk(sink, &mut mac, &keys.enc, &mut chunk).await?;
        emitted += 1;
        fed += chunk_len;
        if let Some(cb) = progress.as_deref_mut() {
            cb(fed, payload_len);
        }
    }
    read_buf.zeroize();

    if fed != payload_len || emitted != chunk_count {
        return Err(AencError::Internal(format!(
            "payload stream length mismatch: declared {} bytes, read {}",
            payload_len, fed
        )));
    }

    let tag = mac.finalize().into_bytes();
    sink.write_all(&tag).await?;
    written += MAC_LEN as u64;
    sink.flush().await?;

    Ok(written)
}

/// Seal one chunk and append `nonce || ciphertext || tag` to sink and MAC.
/// The plaintext buffer is zeroed before this returns.
async fn emit_chunk<W: AsyncWrite + Unpin>(
    sink: &mut W,
    mac: &mut HmacSha256,
    enc_key: &SecretArray<32>,
    chunk: &mut Vec<u8>,
) -> Result<u64> {
    let nonce = crypto::random_bytes::<NONCE_LEN>();
    let sealed = crypto::aead_seal(enc_key, &nonce, chunk)?;
    chunk.zeroize();

    sink.write_all(&nonce).await?;
    mac.update(&nonce);
    sink.write_all(&sealed).await?;
    mac.update(&sealed);

    Ok((NONCE_LEN + sealed.len()) as u64)
}

/// Decrypt a chunked artifact, writing plaintext to `sink`.
///
/// Each chunk's AEAD tag is verified before its plaintext is released; the
/// trailing whole-file MAC is checked in constant time after the last chunk.
/// Returns the parsed header and the number of plaintext bytes written.
///
/// The caller owns sink cleanup: on error, any partially written output
/// must be deleted.
pub async fn decrypt_stream<R, W>(
    reader: &mut R,
    sink: &mut W,
    passphrase: &Secret,
    params: &KdfParams,
    mut progress: Option<&mut ProgressFn>,
) -> Result<(Header, u64)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let OpenedEnvelope {
        header,
        keys,
        mut mac,
    } = open_envelope(reader, passphrase, params).await?;

    let mut framing = [0u8; 12];
    read_exact(reader, &mut framing).await?;
    mac.update(&framing);

    let chunk_size = u32::from_be_bytes(framing[..4].try_into().expect("4-byte slice"));
    let chunk_count = i64::from_be_bytes(framing[4..].try_into().expect("8-byte slice"));
    let payload_len = header.compressed_size as u64;

    if chunk_size == 0 {
        return Err(AencError::Corrupt("zero chunk size".to_string()));
    }
    if chunk_count != chunk_count_for(payload_len, chunk_size) {
        return Err(AencError::Corrupt(format!(
            "chunk count {} impossible for {} payload bytes at chunk size {}",
            chunk_count, payload_len, chunk_size
        )));
    }

    debug!(
        "decrypting {} chunk(s) of {} covering {} payload bytes",
        chunk_count, chunk_size, payload_len
    );

    let mut out_total: u64 = 0;
    for index in 0..chunk_count {
        let plain_len = chunk_plain_len(payload_len, chunk_size, index, chunk_count) as usize;

        let mut nonce = [0u8; NONCE_LEN];
        read_exact(reader, &mut nonce).await?;
        mac.update(&nonce);

        let mut sealed = vec![0u8; plain_len + TAG_LEN];
        read_exact(reader, &mut sealed).await?;
        mac.update(&sealed);

        let mut plain = crypto::aead_open(&keys.enc, &nonce, &sealed)?;
        sink.write_all(&plain).await?;
        plain.zeroize();

        out_total += plain_len as u64;
        if let Some(cb) = progress.as_deref_mut() {
            cb(out_total, payload_len);
        }
        if (index + 1) % FLUSH_INTERVAL_CHUNKS == 0 {
            sink.flush().await?;
        }
    }
    sink.flush().await?;

    // The stored MAC is the only region NOT fed to the streaming MAC.
    let mut stored = [0u8; MAC_LEN];
    read_exact(reader, &mut stored).await?;

    let mut probe = [0u8; 1];
    if reader.read(&mut probe).await? != 0 {
        return Err(AencError::Corrupt(
            "unexpected data after trailing MAC".to_string(),
        ));
    }

    let computed = mac.finalize().into_bytes();
    if !crypto::macs_equal(&computed, &stored) {
        return Err(AencError::AuthFailure);
    }

    Ok((header, out_total))
}

async fn read_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).await.map_err(AencError::from_read)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::DEFAULT_CHUNK_SIZE;
    use std::sync::{Arc, Mutex};

    fn test_header(payload_len: usize) -> Header {
        Header {
            uuid: "test-uuid".to_string(),
            original_name: "input.txt".to_string(),
            original_extension: "txt".to_string(),
            was_directory: false,
            is_compressed: false,
            original_size: payload_len as i64,
            compressed_size: payload_len as i64,
        }
    }

    fn passphrase() -> Secret {
        Secret::from_slice(b"stream-test-passphrase")
    }

    async fn encrypt_to_vec(payload: &[u8], chunk_size: u32) -> Vec<u8> {
        let header = test_header(payload.len());
        let mut artifact = Vec::new();
        let mut reader = payload;
        encrypt_stream(
            &header,
            &mut reader,
            &mut artifact,
            &passphrase(),
            chunk_size,
            &KdfParams::default(),
            None,
        )
        .await
        .unwrap();
        artifact
    }

    async fn decrypt_to_vec(artifact: &[u8], pass: &Secret) -> Result<(Header, Vec<u8>)> {
        let mut plain = Vec::new();
        let mut reader = artifact;
        let (header, _) =
            decrypt_stream(&mut reader, &mut plain, pass, &KdfParams::default(), None).await?;
        Ok((header, plain))
    }

    #[tokio::test]
    async fn test_roundtrip_multi_chunk() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let artifact = encrypt_to_vec(&payload, 1024).await;

        let (header, plain) = decrypt_to_vec(&artifact, &passphrase()).await.unwrap();
        assert_eq!(plain, payload);
        assert_eq!(header.original_name, "input.txt");
        assert_eq!(header.compressed_size, payload.len() as i64);
    }

    #[tokio::test]
    async fn test_one_mib_payload_is_a_single_chunk() {
        let payload = vec![0x61u8; 1_048_576];
        let artifact = encrypt_to_vec(&payload, DEFAULT_CHUNK_SIZE).await;

        // chunk_count lives right after chunk_size, whose offset depends on
        // the encrypted header length
        let header_len = test_header(payload.len()).to_bytes().unwrap().len();
        let count_offset = crate::format::ENVELOPE_PREFIX_LEN + header_len + TAG_LEN + 4;
        let count = i64::from_be_bytes(
            artifact[count_offset..count_offset + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(count, 1);

        let expected_len = crate::format::ENVELOPE_PREFIX_LEN
            + header_len
            + TAG_LEN
            + 12
            + NONCE_LEN
            + payload.len()
            + TAG_LEN
            + MAC_LEN;
        assert_eq!(artifact.len(), expected_len);

        let (_, plain) = decrypt_to_vec(&artifact, &passphrase()).await.unwrap();
        assert_eq!(plain, payload);
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let artifact = encrypt_to_vec(&[], 1024).await;
        let (header, plain) = decrypt_to_vec(&artifact, &passphrase()).await.unwrap();
        assert!(plain.is_empty());
        assert_eq!(header.compressed_size, 0);
    }

    #[tokio::test]
    async fn test_chunk_size_independence() {
        let payload: Vec<u8> = (0..5_000u32).map(|i| (i % 256) as u8).collect();
        for chunk_size in [7u32, 64, 4096, 5_000, 1_000_000] {
            let artifact = encrypt_to_vec(&payload, chunk_size).await;
            let (_, plain) = decrypt_to_vec(&artifact, &passphrase()).await.unwrap();
            assert_eq!(plain, payload, "chunk size {}", chunk_size);
        }
    }

    #[tokio::test]
    async fn test_wrong_passphrase() {
        let artifact = encrypt_to_vec(b"secret data", 1024).await;
        let wrong = Secret::from_slice(b"not-the-passphrase");
        let result = decrypt_to_vec(&artifact, &wrong).await;
        assert!(matches!(result.unwrap_err(), AencError::AuthFailure));
    }

    #[tokio::test]
    async fn test_single_byte_tampering_detected() {
        let artifact = encrypt_to_vec(b"tamper detection payload", 8).await;

        // magic, version, salt, header ciphertext, chunk framing, chunk
        // ciphertext, trailing MAC
        let offsets = [
            0usize,
            4,
            10,
            55,
            artifact.len() - MAC_LEN - 20,
            artifact.len() - 20,
            artifact.len() - 1,
        ];
        for &offset in &offsets {
            let mut mutated = artifact.clone();
            mutated[offset] ^= 0x01;
            let result = decrypt_to_vec(&mutated, &passphrase()).await;
            assert!(
                matches!(
                    result.as_ref().unwrap_err(),
                    AencError::AuthFailure | AencError::Corrupt(_)
                ),
                "mutation at offset {} was not detected",
                offset
            );
        }
    }

    #[tokio::test]
    async fn test_truncation_detected() {
        let artifact = encrypt_to_vec(b"truncation detection payload", 8).await;
        for cut in [1usize, MAC_LEN, MAC_LEN + 5, artifact.len() / 2] {
            let truncated = &artifact[..artifact.len() - cut];
            let result = decrypt_to_vec(truncated, &passphrase()).await;
            assert!(
                result.is_err(),
                "truncation by {} bytes was not detected",
                cut
            );
        }
    }

    #[tokio::test]
    async fn test_trailing_garbage_detected() {
        let mut artifact = encrypt_to_vec(b"payload", 8).await;
        artifact.push(0xFF);
        let result = decrypt_to_vec(&artifact, &passphrase()).await;
        assert!(matches!(result.unwrap_err(), AencError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_chunk_nonces_are_distinct() {
        let payload = vec![0u8; 64 * 40];
        let artifact = encrypt_to_vec(&payload, 64).await;

        let header_len = test_header(payload.len()).to_bytes().unwrap().len();
        let mut offset = crate::format::ENVELOPE_PREFIX_LEN + header_len + TAG_LEN + 12;
        let mut nonces = std::collections::HashSet::new();
        for _ in 0..40 {
            let nonce: [u8; NONCE_LEN] = artifact[offset..offset + NONCE_LEN].try_into().unwrap();
            assert!(nonces.insert(nonce), "duplicate chunk nonce");
            offset += NONCE_LEN + 64 + TAG_LEN;
        }
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_complete() {
        let payload = vec![1u8; 3000];
        let header = test_header(payload.len());
        let seen: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut progress: ProgressFn = Box::new(move |done, total| {
            sink.lock().unwrap().push((done, total));
        });

        let mut artifact = Vec::new();
        let mut reader = &payload[..];
        encrypt_stream(
            &header,
            &mut reader,
            &mut artifact,
            &passphrase(),
            1024,
            &KdfParams::default(),
            Some(&mut progress),
        )
        .await
        .unwrap();

        let calls = seen.lock().unwrap();
        assert!(!calls.is_empty());
        let mut last = 0;
        for &(done, total) in calls.iter() {
            assert_eq!(total, payload.len() as u64);
            assert!(done >= last);
            assert!(done <= total);
            last = done;
        }
        assert_eq!(calls.last().unwrap().0, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_declared_length_mismatch_is_internal_error() {
        let mut header = test_header(100);
        header.compressed_size = 100;
        let payload = vec![0u8; 60];
        let mut artifact = Vec::new();
        let mut reader = &payload[..];
        let result = encrypt_stream(
            &header,
            &mut reader,
            &mut artifact,
            &passphrase(),
            32,
            &KdfParams::default(),
            None,
        )
        .await;
        assert!(matches!(result.unwrap_err(), AencError::Internal(_)));
    }

    #[tokio::test]
    async fn test_zero_chunk_size_rejected() {
        let header = test_header(4);
        let mut artifact = Vec::new();
        let mut reader = &b"data"[..];
        let result = encrypt_stream(
            &header,
            &mut reader,
            &mut artifact,
            &passphrase(),
            0,
            &KdfParams::default(),
            None,
        )
        .await;
        assert!(matches!(result.unwrap_err(), AencError::InvalidInput(_)));
    }
}
