use crate::crypto::KdfParams;
use crate::error::{AencError, Result};
use crate::format::{Header, DEFAULT_CHUNK_SIZE};
use crate::secret::Secret;
use crate::stream::{self, ProgressFn};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use uuid::Uuid;
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Options for [`encrypt`].
pub struct EncryptOptions {
    /// Identifier recorded in the header; a random v4 UUID when `None`
    pub custom_uuid: Option<String>,
    /// Gzip the payload before encryption
    pub enable_gzip: bool,
    /// Plaintext bytes per chunk; persisted in the artifact
    pub chunk_size: u32,
    /// Called with `(bytes_encrypted, total)` after each chunk
    pub on_progress: Option<ProgressFn>,
}

impl Default for EncryptOptions {
    fn default() -> Self {
        Self {
            custom_uuid: None,
            enable_gzip: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            on_progress: None,
        }
    }
}

/// Options for [`decrypt`].
#[derive(Default)]
pub struct DecryptOptions {
    /// Called with `(bytes_decrypted, total)` after each chunk
    pub on_progress: Option<ProgressFn>,
}

/// What [`encrypt`] produced.
#[derive(Debug, Clone)]
pub struct EncryptOutcome {
    pub uuid: String,
    pub output_path: PathBuf,
    pub original_name: String,
    pub was_directory: bool,
    pub original_extension: String,
    /// Total artifact bytes written
    pub bytes_written: u64,
    /// Uncompressed bytes of the source file or directory tree
    pub original_size: u64,
}

/// What [`decrypt`] restored.
#[derive(Debug, Clone)]
pub struct DecryptOutcome {
    pub uuid: String,
    pub output_path: PathBuf,
    pub original_name: String,
    pub was_directory: bool,
    /// Plaintext bytes restored to disk
    pub bytes_written: u64,
}

/// Encrypt a file or directory at `input_path` into a single artifact at
/// `output_path`.
///
/// A directory is packed into a ZIP of its entries (no outer folder), a file
/// is taken as-is; either is then gzip-compressed when `enable_gzip` is set.
/// The staged payload lives in a temp file that is removed on every exit
/// path, and a partially written artifact is deleted on failure.
///
/// Compression and key derivation block the current thread; run the whole
/// operation on a worker when an interactive context must stay responsive.
pub async fn encrypt<P: AsRef<Path>, Q: AsRef<Path>>(
    input_path: P,
    output_path: Q,
    passphrase: &Secret,
    mut options: EncryptOptions,
) -> Result<EncryptOutcome> {
    let input_path = input_path.as_ref();
    let output_path = output_path.as_ref().to_path_buf();

    let input_meta = fs::metadata(input_path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            AencError::InvalidInput(format!(
                "input path does not exist: {}",
                input_path.display()
            ))
        } else {
            AencError::Io(e)
        }
    })?;
    let was_directory = input_meta.is_dir();

    let original_name = input_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            AencError::InvalidInput(format!(
                "input path has no usable name: {}",
                input_path.display()
            ))
        })?;
    let original_extension = if was_directory {
        String::new()
    } else {
        input_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string()
    };

    debug!(
        "staging payload for {} ({})",
        input_path.display(),
        if was_directory { "directory" } else { "file" }
    );
    let staged = stage_payload(input_path, was_directory, options.enable_gzip)?;

    let header = Header {
        uuid: options
            .custom_uuid
            .take()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        original_name: original_name.clone(),
        original_extension: original_extension.clone(),
        was_directory,
        is_compressed: options.enable_gzip,
        original_size: staged.original_size as i64,
        compressed_size: staged.payload_len as i64,
    };

    let mut payload = tokio::fs::File::open(&staged.path).await?;
    let mut sink = tokio::fs::File::create(&output_path).await?;

    let run = stream::encrypt_stream(
        &header,
        &mut payload,
        &mut sink,
        passphrase,
        options.chunk_size,
        &KdfParams::default(),
        options.on_progress.as_mut(),
    )
    .await;
    let run = match run {
        Ok(written) => sink.sync_all().await.map(|_| written).map_err(AencError::Io),
        Err(e) => Err(e),
    };
    drop(sink);

    let bytes_written = match run {
        Ok(written) => written,
        Err(e) => {
            if tokio::fs::remove_file(&output_path).await.is_err() {
                warn!("could not remove partial output {}", output_path.display());
            }
            return Err(e);
        }
    };

    Ok(EncryptOutcome {
        uuid: header.uuid,
        output_path,
        original_name,
        was_directory,
        original_extension,
        bytes_written,
        original_size: staged.original_size,
    })
}

/// Decrypt the artifact at `input_path`, restoring the original file or
/// directory inside the existing directory `output_dir`.
///
/// A directory artifact is restored as `output_dir/<original_name>/...`; a
/// file artifact becomes `output_dir/<original_name>[.<extension>]`. On any
/// failure the partially restored output is deleted and the error surfaces.
pub async fn decrypt<P: AsRef<Path>, Q: AsRef<Path>>(
    input_path: P,
    output_dir: Q,
    passphrase: &Secret,
    mut options: DecryptOptions,
) -> Result<DecryptOutcome> {
    let input_path = input_path.as_ref();
    let output_dir = output_dir.as_ref();

    match fs::metadata(output_dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(AencError::InvalidInput(format!(
                "output path is not a directory: {}",
                output_dir.display()
            )));
        }
        Err(_) => {
            return Err(AencError::InvalidInput(format!(
                "output directory does not exist: {}",
                output_dir.display()
            )));
        }
    }

    let mut source = tokio::fs::File::open(input_path).await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            AencError::InvalidInput(format!(
                "input path does not exist: {}",
                input_path.display()
            ))
        } else {
            AencError::Io(e)
        }
    })?;

    // Decrypt the payload into a temp file first; nothing appears under
    // output_dir until every chunk and the trailing MAC have verified.
    let payload_tmp = NamedTempFile::new()?;
    let mut payload_sink = tokio::fs::File::create(payload_tmp.path()).await?;
    let (header, _) = stream::decrypt_stream(
        &mut source,
        &mut payload_sink,
        passphrase,
        &KdfParams::default(),
        options.on_progress.as_mut(),
    )
    .await?;
    payload_sink.sync_all().await?;
    drop(payload_sink);

    let (output_path, bytes_written) = if header.was_directory {
        let target = output_dir.join(&header.original_name);
        match restore_directory(payload_tmp.path(), &target, header.is_compressed) {
            Ok(written) => (target, written),
            Err(e) => {
                if fs::remove_dir_all(&target).is_err() {
                    warn!("could not remove partial output {}", target.display());
                }
                return Err(e);
            }
        }
    } else {
        let file_name = restored_file_name(&header.original_name, &header.original_extension);
        let target = output_dir.join(file_name);
        match restore_file(payload_tmp.path(), &target, header.is_compressed) {
            Ok(written) => (target, written),
            Err(e) => {
                if fs::remove_file(&target).is_err() {
                    warn!("could not remove partial output {}", target.display());
                }
                return Err(e);
            }
        }
    };

    if bytes_written != header.original_size as u64 {
        if header.was_directory {
            let _ = fs::remove_dir_all(&output_path);
        } else {
            let _ = fs::remove_file(&output_path);
        }
        return Err(AencError::Corrupt(format!(
            "restored {} bytes but header declares {}",
            bytes_written, header.original_size
        )));
    }

    Ok(DecryptOutcome {
        uuid: header.uuid,
        output_path,
        original_name: header.original_name,
        was_directory: header.was_directory,
        bytes_written,
    })
}

struct StagedPayload {
    // Owns the temp file (if any) so it is deleted when the operation ends
    _temp: Option<NamedTempFile>,
    path: PathBuf,
    original_size: u64,
    payload_len: u64,
}

/// Turn the input into a single finite byte stream of known length.
fn stage_payload(input: &Path, was_directory: bool, gzip: bool) -> Result<StagedPayload> {
    if was_directory {
        let mut zip_tmp = NamedTempFile::new()?;
        let original_size = zip_directory(input, zip_tmp.as_file_mut())?;

        let temp = if gzip {
            let gz_tmp = NamedTempFile::new()?;
            zip_tmp.as_file_mut().seek(SeekFrom::Start(0))?;
            gzip_copy(zip_tmp.as_file_mut(), gz_tmp.as_file())?;
            gz_tmp
        } else {
            zip_tmp
        };

        let payload_len = temp.as_file().metadata()?.len();
        Ok(StagedPayload {
            path: temp.path().to_path_buf(),
            _temp: Some(temp),
            original_size,
            payload_len,
        })
    } else {
        let original_size = fs::metadata(input)?.len();
        if gzip {
            let tmp = NamedTempFile::new()?;
            let mut source = fs::File::open(input)?;
            gzip_copy(&mut source, tmp.as_file())?;
            let payload_len = tmp.as_file().metadata()?.len();
            Ok(StagedPayload {
                path: tmp.path().to_path_buf(),
                _temp: Some(tmp),
                original_size,
                payload_len,
            })
        } else {
            // Uncompressed files are fed to the engine directly
            Ok(StagedPayload {
                _temp: None,
                path: input.to_path_buf(),
                original_size,
                payload_len: original_size,
            })
        }
    }
}

/// Pack a directory tree into a ZIP with entry paths relative to `root`
/// (no outer folder). Entries are stored uncompressed; gzip over the whole
/// stream is the compression layer. Returns the uncompressed total bytes.
fn zip_directory(root: &Path, out: &mut fs::File) -> Result<u64> {
    let mut zip = ZipWriter::new(out);
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    let mut total: u64 = 0;

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(|e| AencError::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| AencError::Internal(format!("walked outside root: {}", e)))?;
        let name = zip_entry_name(relative);

        if entry.file_type().is_dir() {
            zip.add_directory(name, options).map_err(zip_err)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options).map_err(zip_err)?;
            let mut file = fs::File::open(entry.path())?;
            total += io::copy(&mut file, &mut zip)?;
        }
        // other entry kinds (symlinks, sockets) are not carried
    }

    zip.finish().map_err(zip_err)?;
    Ok(total)
}

/// Expand a ZIP payload into `target`, creating parents as needed.
/// Returns the number of file bytes written.
fn restore_directory(payload: &Path, target: &Path, compressed: bool) -> Result<u64> {
    let zip_tmp;
    let zip_path = if compressed {
        zip_tmp = NamedTempFile::new()?;
        let mut source = fs::File::open(payload)?;
        gunzip_copy(&mut source, zip_tmp.as_file())?;
        zip_tmp.path()
    } else {
        payload
    };

    let mut archive = ZipArchive::new(fs::File::open(zip_path)?).map_err(zip_err)?;
    fs::create_dir_all(target)?;

    let mut total: u64 = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(zip_err)?;
        let relative = entry
            .enclosed_name()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| {
                AencError::Corrupt("archive entry escapes the output directory".to_string())
            })?;
        let dest = target.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&dest)?;
            total += io::copy(&mut entry, &mut out)?;
        }
    }
    Ok(total)
}

/// Write the payload to `target`, gzip-decoding when needed.
fn restore_file(payload: &Path, target: &Path, compressed: bool) -> Result<u64> {
    let mut source = fs::File::open(payload)?;
    let mut out = fs::File::create(target)?;
    let written = if compressed {
        gunzip_copy(&mut source, &mut out)?
    } else {
        io::copy(&mut source, &mut out)?
    };
    out.sync_all()?;
    Ok(written)
}

/// `original_name[.extension]`, without doubling an extension the name
/// already carries.
fn restored_file_name(name: &str, extension: &str) -> String {
    if extension.is_empty() || name.ends_with(&format!(".{}", extension)) {
        name.to_string()
    } else {
        format!("{}.{}", name, extension)
    }
}

fn zip_entry_name(relative: &Path) -> String {
    let parts: Vec<&str> = relative
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    parts.join("/")
}

fn gzip_copy<R: Read, W: Write>(source: &mut R, dest: W) -> Result<u64> {
    let mut encoder = GzEncoder::new(dest, Compression::default());
    let n = io::copy(source, &mut encoder)?;
    encoder.finish()?;
    Ok(n)
}

fn gunzip_copy<R: Read, W: Write>(source: &mut R, mut dest: W) -> Result<u64> {
    let mut decoder = GzDecoder::new(source);
    let n = io::copy(&mut decoder, &mut dest)
        .map_err(|_| AencError::Corrupt("invalid gzip payload".to_string()))?;
    Ok(n)
}

fn zip_err(err: ZipError) -> AencError {
    match err {
        ZipError::Io(e) => AencError::Io(e),
        other => AencError::Corrupt(format!("archive error: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn passphrase() -> Secret {
        Secret::from_slice(b"archive-test-passphrase")
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("greeting.txt");
        fs::write(&input, "Hello, World! This is a test file.").unwrap();
        let artifact = dir.path().join("greeting.aenc");

        let outcome = encrypt(&input, &artifact, &passphrase(), EncryptOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.original_name, "greeting.txt");
        assert_eq!(outcome.original_extension, "txt");
        assert!(!outcome.was_directory);
        assert_eq!(outcome.original_size, 34);
        assert_eq!(
            outcome.bytes_written,
            fs::metadata(&artifact).unwrap().len()
        );

        let restore_dir = TempDir::new().unwrap();
        let restored = decrypt(
            &artifact,
            restore_dir.path(),
            &passphrase(),
            DecryptOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(restored.uuid, outcome.uuid);
        assert_eq!(restored.original_name, "greeting.txt");
        assert_eq!(
            fs::read_to_string(&restored.output_path).unwrap(),
            "Hello, World! This is a test file."
        );
    }

    #[tokio::test]
    async fn test_file_roundtrip_without_gzip() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("raw.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        fs::write(&input, &data).unwrap();
        let artifact = dir.path().join("raw.aenc");

        let options = EncryptOptions {
            enable_gzip: false,
            ..Default::default()
        };
        encrypt(&input, &artifact, &passphrase(), options)
            .await
            .unwrap();

        let restore_dir = TempDir::new().unwrap();
        let restored = decrypt(
            &artifact,
            restore_dir.path(),
            &passphrase(),
            DecryptOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(fs::read(&restored.output_path).unwrap(), data);
        assert_eq!(restored.bytes_written, data.len() as u64);
    }

    #[tokio::test]
    async fn test_directory_roundtrip() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("project");
        fs::create_dir(&input).unwrap();
        fs::write(input.join("file1.txt"), "File 1 content").unwrap();
        fs::write(input.join("file2.txt"), "File 2 content").unwrap();
        fs::create_dir(input.join("subdir")).unwrap();
        fs::write(input.join("subdir/file3.txt"), "File 3 content").unwrap();

        let artifact = dir.path().join("project.aenc");
        let outcome = encrypt(&input, &artifact, &passphrase(), EncryptOptions::default())
            .await
            .unwrap();
        assert!(outcome.was_directory);
        assert_eq!(outcome.original_extension, "");
        assert_eq!(outcome.original_size, 42);

        let restore_dir = TempDir::new().unwrap();
        let restored = decrypt(
            &artifact,
            restore_dir.path(),
            &passphrase(),
            DecryptOptions::default(),
        )
        .await
        .unwrap();

        assert!(restored.was_directory);
        assert_eq!(restored.output_path, restore_dir.path().join("project"));
        assert_eq!(
            fs::read_to_string(restored.output_path.join("file1.txt")).unwrap(),
            "File 1 content"
        );
        assert_eq!(
            fs::read_to_string(restored.output_path.join("file2.txt")).unwrap(),
            "File 2 content"
        );
        assert_eq!(
            fs::read_to_string(restored.output_path.join("subdir/file3.txt")).unwrap(),
            "File 3 content"
        );
    }

    #[tokio::test]
    async fn test_wrong_passphrase_leaves_no_output() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("secret.txt");
        fs::write(&input, "classified").unwrap();
        let artifact = dir.path().join("secret.aenc");

        encrypt(&input, &artifact, &passphrase(), EncryptOptions::default())
            .await
            .unwrap();

        let restore_dir = TempDir::new().unwrap();
        let wrong = Secret::from_slice(b"wrong_password");
        let result = decrypt(
            &artifact,
            restore_dir.path(),
            &wrong,
            DecryptOptions::default(),
        )
        .await;

        assert!(matches!(result.unwrap_err(), AencError::AuthFailure));
        assert_eq!(fs::read_dir(restore_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_input_is_invalid() {
        let dir = TempDir::new().unwrap();
        let result = encrypt(
            dir.path().join("absent.txt"),
            dir.path().join("out.aenc"),
            &passphrase(),
            EncryptOptions::default(),
        )
        .await;
        assert!(matches!(result.unwrap_err(), AencError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_missing_output_dir_is_invalid() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, "x").unwrap();
        let artifact = dir.path().join("a.aenc");
        encrypt(&input, &artifact, &passphrase(), EncryptOptions::default())
            .await
            .unwrap();

        let result = decrypt(
            &artifact,
            dir.path().join("no-such-dir"),
            &passphrase(),
            DecryptOptions::default(),
        )
        .await;
        assert!(matches!(result.unwrap_err(), AencError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_empty_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("empty.txt");
        fs::write(&input, "").unwrap();
        let artifact = dir.path().join("empty.aenc");

        let outcome = encrypt(&input, &artifact, &passphrase(), EncryptOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.original_size, 0);

        let restore_dir = TempDir::new().unwrap();
        let restored = decrypt(
            &artifact,
            restore_dir.path(),
            &passphrase(),
            DecryptOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(fs::read(&restored.output_path).unwrap(), b"");
    }

    #[test]
    fn test_restored_file_name() {
        assert_eq!(restored_file_name("notes.txt", "txt"), "notes.txt");
        assert_eq!(restored_file_name("notes", "txt"), "notes.txt");
        assert_eq!(restored_file_name("archive", ""), "archive");
        assert_eq!(restored_file_name("a.tar.gz", "gz"), "a.tar.gz");
    }

    #[test]
    fn test_zip_entry_name_uses_forward_slashes() {
        let path = Path::new("subdir").join("file3.txt");
        assert_eq!(zip_entry_name(&path), "subdir/file3.txt");
    }
}
