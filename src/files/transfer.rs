//! Bridged single-stream transfers between the agent filesystem and the
//! controller.
//!
//! Downloads pull `GET /api/bridge/pull?bridge=<id>` into a temp-then-rename
//! file. Uploads build an [`UploadBody`] (headers plus a streaming reader) and
//! `PUT` it to `/api/bridge/push?bridge=<id>`. Nothing here buffers a whole
//! payload in memory except the text upload, which is capped at 2 MiB.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use futures::TryStreamExt;
use reqwest::header::{HeaderValue, CONTENT_LENGTH};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

use super::archive::{archive_paths, ArchiveOptions, ArchiveReport};
use super::TransferError;

/// Read size for downloads.
pub const FETCH_CHUNK: usize = 1024;
/// Read size for uploads.
pub const UPLOAD_CHUNK: usize = 32 * 1024;
/// Largest file accepted by [`upload_text`].
pub const TEXT_LIMIT: u64 = 2 * 1024 * 1024;

/// Headers and body of a pending `PUT /api/bridge/push`.
pub struct UploadBody {
    /// `FileName` header.
    pub file_name: String,
    /// `FileSize` header. Absent for archives, whose size is unknown upfront.
    pub file_size: Option<u64>,
    /// Exact body length when known.
    pub content_length: Option<u64>,
    /// `FileEncoding` header (`UTF-8` or `GBK`), text uploads only.
    pub encoding: Option<&'static str>,
    pub reader: Pin<Box<dyn AsyncRead + Send + Sync>>,
}

/// Heuristic GBK check.
///
/// Bytes up to 0x7F stand alone. Anything else must open a two-byte pair with
/// the lead in `0x81..=0xFE` and the trail in `0x40..=0xFE`, excluding 0xF7.
/// A lead byte with no trail is rejected.
pub fn gbk_validate(buf: &[u8]) -> bool {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] <= 0x7F {
            i += 1;
            continue;
        }
        match buf.get(i + 1) {
            Some(&trail)
                if (0x81..=0xFE).contains(&buf[i]) && (0x40..=0xFE).contains(&trail) && trail != 0xF7 =>
            {
                i += 2;
            }
            _ => return false,
        }
    }
    true
}

/// Name the encoding of `buf`, preferring UTF-8.
pub fn detect_encoding(buf: &[u8]) -> Option<&'static str> {
    if std::str::from_utf8(buf).is_ok() {
        Some("UTF-8")
    } else if gbk_validate(buf) {
        Some("GBK")
    } else {
        None
    }
}

/// First unused `<file>.tmp.<n>` sibling in `dir`.
pub async fn temp_file_name(dir: &Path, file: &str) -> PathBuf {
    let mut n = 0u32;
    loop {
        let candidate = dir.join(format!("{file}.tmp.{n}"));
        if !exists(&candidate).await {
            return candidate;
        }
        n += 1;
    }
}

/// Anything but a definite "not found" counts as present.
async fn exists(path: &Path) -> bool {
    !matches!(
        tokio::fs::symlink_metadata(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound
    )
}

/// Persist `reader` as `dir/file`.
///
/// An existing destination is left untouched until the whole stream has been
/// written to a temp sibling; it is then removed and the temp file renamed
/// over it. On failure the partial file is truncated and removed.
pub async fn write_stream_to<R>(dir: &Path, file: &str, mut reader: R) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    let dest = dir.join(file);
    let dest_exists = exists(&dest).await;
    let target = if dest_exists {
        temp_file_name(dir, file).await
    } else {
        dest.clone()
    };

    let mut out = File::create(&target).await?;
    let mut buf = vec![0u8; FETCH_CHUNK];
    let mut written = 0u64;
    let copied: std::io::Result<()> = async {
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            out.write_all(&buf[..n]).await?;
            out.flush().await?;
            written += n as u64;
        }
    }
    .await;

    if let Err(e) = copied {
        let _ = out.set_len(0).await;
        drop(out);
        if let Err(rm) = tokio::fs::remove_file(&target).await {
            warn!(path = %target.display(), "failed to remove partial download: {rm}");
        }
        return Err(e.into());
    }
    drop(out);

    if dest_exists {
        tokio::fs::remove_file(&dest).await?;
        tokio::fs::rename(&target, &dest).await?;
    }
    Ok(written)
}

/// Download the bridged stream `bridge` into `dir/file`.
pub async fn fetch_file(
    client: &reqwest::Client,
    base_url: &str,
    dir: &Path,
    file: &str,
    bridge: &str,
) -> Result<u64, TransferError> {
    let resp = client
        .get(bridge_url(base_url, "pull"))
        .query(&[("bridge", bridge)])
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(TransferError::Status(resp.status().as_u16()));
    }
    let stream = Box::pin(resp.bytes_stream().map_err(std::io::Error::other));
    let written = write_stream_to(dir, file, StreamReader::new(stream)).await?;
    debug!(bridge, bytes = written, path = %dir.join(file).display(), "download complete");
    Ok(written)
}

/// Prepare a single-file upload of bytes `[start, end)`, or `[start, size)`
/// when `end` is 0.
///
/// The file is pumped through an in-process pipe in [`UPLOAD_CHUNK`] reads by
/// a background task that stops after the computed length, on EOF, or on the
/// first error, and then closes both ends.
pub async fn upload_single(path: &Path, start: u64, end: u64) -> Result<UploadBody, TransferError> {
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();
    let limit = if end == 0 { size } else { end };
    if end > size || start > limit {
        return Err(TransferError::InvalidRange { start, end, size });
    }
    let length = limit - start;
    file.seek(SeekFrom::Start(start)).await?;

    let (reader, mut writer) = tokio::io::duplex(UPLOAD_CHUNK);
    let shown = path.display().to_string();
    tokio::spawn(async move {
        let mut remaining = length;
        let mut buf = vec![0u8; UPLOAD_CHUNK];
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(UPLOAD_CHUNK, |r| r.min(UPLOAD_CHUNK));
            let n = match file.read(&mut buf[..want]).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(path = %shown, "upload read failed: {e}");
                    break;
                }
            };
            if writer.write_all(&buf[..n]).await.is_err() {
                debug!(path = %shown, "upload body dropped by receiver");
                break;
            }
            remaining -= n as u64;
        }
        let _ = writer.shutdown().await;
    });

    Ok(UploadBody {
        file_name: base_name(path),
        file_size: Some(size),
        content_length: Some(length),
        encoding: None,
        reader: Box::pin(reader),
    })
}

/// Prepare a text-file upload tagged with its detected encoding.
pub async fn upload_text(path: &Path) -> Result<UploadBody, TransferError> {
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();
    if size > TEXT_LIMIT {
        return Err(TransferError::FileTooLarge {
            size,
            max: TEXT_LIMIT,
        });
    }
    let mut buf = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
    file.read_to_end(&mut buf).await?;
    let encoding = detect_encoding(&buf).ok_or(TransferError::UnsupportedEncoding)?;
    file.seek(SeekFrom::Start(0)).await?;

    Ok(UploadBody {
        file_name: base_name(path),
        file_size: Some(size),
        content_length: Some(size),
        encoding: Some(encoding),
        reader: Box::pin(file),
    })
}

/// Send `body` to the controller's push endpoint for `bridge`.
pub async fn push_body(
    client: &reqwest::Client,
    base_url: &str,
    bridge: &str,
    body: UploadBody,
) -> Result<(), TransferError> {
    let file_name = HeaderValue::from_bytes(body.file_name.as_bytes())
        .map_err(|_| TransferError::InvalidPath(body.file_name.clone()))?;
    let mut req = client
        .put(bridge_url(base_url, "push"))
        .query(&[("bridge", bridge)])
        .header("FileName", file_name);
    if let Some(size) = body.file_size {
        req = req.header("FileSize", size);
    }
    if let Some(encoding) = body.encoding {
        req = req.header("FileEncoding", encoding);
    }
    if let Some(len) = body.content_length {
        req = req.header(CONTENT_LENGTH, len);
    }
    let stream = ReaderStream::with_capacity(body.reader, UPLOAD_CHUNK);
    let resp = req.body(reqwest::Body::wrap_stream(stream)).send().await?;
    if !resp.status().is_success() {
        return Err(TransferError::Status(resp.status().as_u16()));
    }
    Ok(())
}

/// Upload `files` to `bridge`: a lone regular file goes up as-is (honoring
/// the range), anything else is streamed as one ZIP archive.
///
/// Returns the archive report when the archive path was taken.
pub async fn upload_files(
    client: &reqwest::Client,
    base_url: &str,
    files: &[String],
    bridge: &str,
    start: u64,
    end: u64,
    options: &ArchiveOptions,
) -> Result<Option<ArchiveReport>, TransferError> {
    if let [only] = files {
        let path = Path::new(only);
        if !tokio::fs::metadata(path).await?.is_dir() {
            let body = upload_single(path, start, end).await?;
            push_body(client, base_url, bridge, body).await?;
            return Ok(None);
        }
    }

    let (reader, writer) = tokio::io::duplex(options.chunk_size.max(1));
    let paths: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();
    let opts = options.clone();
    let archiver = tokio::spawn(async move { archive_paths(paths, writer, &opts).await });

    let body = UploadBody {
        file_name: archive_name(files),
        file_size: None,
        content_length: None,
        encoding: None,
        reader: Box::pin(reader),
    };
    let pushed = push_body(client, base_url, bridge, body).await;
    let report = archiver.await.map_err(std::io::Error::other)?;
    pushed?;
    Ok(Some(report))
}

/// Remove every path in `files`, directories recursively.
///
/// Empty and root paths are refused. Missing paths are not an error.
pub async fn remove_files(files: &[String]) -> Result<(), TransferError> {
    for file in files {
        if file.is_empty() || file == "/" || file == "\\" {
            return Err(TransferError::InvalidPath(file.clone()));
        }
        let path = Path::new(file);
        let result = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(path = %file, "removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// `FileName` for an archive upload: `<dir>.zip` for one input, else
/// `Archive.zip`.
pub fn archive_name(files: &[String]) -> String {
    if let [only] = files {
        let normalized = only.replace('\\', "/");
        if let Some(base) = normalized.trim_end_matches('/').rsplit('/').next() {
            if !base.is_empty() {
                return format!("{base}.zip");
            }
        }
    }
    "Archive.zip".to_string()
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

fn bridge_url(base_url: &str, direction: &str) -> String {
    format!("{}/api/bridge/{direction}", base_url.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample(len: u8) -> Vec<u8> {
        (0..len).collect()
    }

    async fn drain(body: UploadBody) -> Vec<u8> {
        let mut out = Vec::new();
        let mut reader = body.reader;
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn test_gbk_validate() {
        assert!(gbk_validate(b"plain ascii\n"));
        assert!(gbk_validate(&[0xB0, 0xA1]));
        assert!(gbk_validate(&[b'a', 0xB0, 0xA1, b'z']));
        assert!(!gbk_validate(&[0xB0]));
        assert!(!gbk_validate(&[b'a', 0xB0]));
        assert!(!gbk_validate(&[0xB0, 0xF7]));
        assert!(!gbk_validate(&[0x80, 0x40]));
        assert!(!gbk_validate(&[0xB0, 0x3F]));
        assert!(gbk_validate(&[]));
    }

    #[test]
    fn test_detect_encoding() {
        assert_eq!(detect_encoding("héllo".as_bytes()), Some("UTF-8"));
        assert_eq!(detect_encoding(&[0xC4, 0xE3, 0xBA, 0xC3]), Some("GBK"));
        assert_eq!(detect_encoding(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn test_archive_name() {
        assert_eq!(archive_name(&["/var/log/".into()]), "log.zip");
        assert_eq!(archive_name(&["C:\\Users\\me".into()]), "me.zip");
        assert_eq!(archive_name(&["/a".into(), "/b".into()]), "Archive.zip");
        assert_eq!(archive_name(&["/".into()]), "Archive.zip");
    }

    #[tokio::test]
    async fn test_temp_file_name_probes() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(temp_file_name(dir.path(), "f").await, dir.path().join("f.tmp.0"));
        std::fs::write(dir.path().join("f.tmp.0"), b"").unwrap();
        std::fs::write(dir.path().join("f.tmp.1"), b"").unwrap();
        assert_eq!(temp_file_name(dir.path(), "f").await, dir.path().join("f.tmp.2"));
    }

    #[tokio::test]
    async fn test_write_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let n = write_stream_to(dir.path(), "new.bin", &b"payload"[..]).await.unwrap();
        assert_eq!(n, 7);
        assert_eq!(std::fs::read(dir.path().join("new.bin")).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_write_replaces_existing_after_success() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"old").unwrap();
        let data = vec![7u8; FETCH_CHUNK * 3 + 5];
        write_stream_to(dir.path(), "f", &data[..]).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), data);
        assert!(!dir.path().join("f.tmp.0").exists());
    }

    #[tokio::test]
    async fn test_failed_download_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"original").unwrap();
        let chunks: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("connection reset")),
        ];
        let reader = StreamReader::new(futures::stream::iter(chunks));

        let err = write_stream_to(dir.path(), "f", reader).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"original");
        let names: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_fresh_download_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let chunks: Vec<std::io::Result<Bytes>> = vec![Err(std::io::Error::other("boom"))];
        let reader = StreamReader::new(futures::stream::iter(chunks));
        assert!(write_stream_to(dir.path(), "f", reader).await.is_err());
        assert!(!dir.path().join("f").exists());
    }

    #[tokio::test]
    async fn test_upload_single_open_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, sample(100)).unwrap();

        let body = upload_single(&path, 10, 0).await.unwrap();
        assert_eq!(body.content_length, Some(90));
        assert_eq!(body.file_size, Some(100));
        assert_eq!(body.file_name, "data.bin");
        assert_eq!(drain(body).await, sample(100)[10..].to_vec());
    }

    #[tokio::test]
    async fn test_upload_single_closed_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, sample(100)).unwrap();

        let body = upload_single(&path, 10, 50).await.unwrap();
        assert_eq!(body.content_length, Some(40));
        assert_eq!(drain(body).await, sample(100)[10..50].to_vec());
    }

    #[tokio::test]
    async fn test_upload_single_spans_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..UPLOAD_CHUNK * 2 + 17).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let body = upload_single(&path, 0, 0).await.unwrap();
        assert_eq!(drain(body).await, data);
    }

    #[tokio::test]
    async fn test_upload_single_invalid_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, sample(100)).unwrap();

        assert!(matches!(
            upload_single(&path, 0, 101).await,
            Err(TransferError::InvalidRange { size: 100, .. })
        ));
        assert!(matches!(
            upload_single(&path, 60, 50).await,
            Err(TransferError::InvalidRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_upload_text_encodings() {
        let dir = tempfile::tempdir().unwrap();
        let utf8 = dir.path().join("u.txt");
        let gbk = dir.path().join("g.txt");
        let bin = dir.path().join("b.bin");
        std::fs::write(&utf8, "你好").unwrap();
        std::fs::write(&gbk, [0xC4, 0xE3, 0xBA, 0xC3]).unwrap();
        std::fs::write(&bin, [0xFF, 0x00, 0xFF]).unwrap();

        let body = upload_text(&utf8).await.unwrap();
        assert_eq!(body.encoding, Some("UTF-8"));
        assert_eq!(drain(body).await, "你好".as_bytes());

        let body = upload_text(&gbk).await.unwrap();
        assert_eq!(body.encoding, Some("GBK"));
        assert_eq!(body.content_length, Some(4));

        assert!(matches!(
            upload_text(&bin).await,
            Err(TransferError::UnsupportedEncoding)
        ));
    }

    #[tokio::test]
    async fn test_upload_text_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.txt");
        let f = std::fs::File::create(&path).unwrap();
        f.set_len(TEXT_LIMIT + 1).unwrap();

        let err = upload_text(&path).await.err().unwrap();
        assert_eq!(err.code(), "FILE_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_remove_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("f"), b"x").unwrap();
        let single = dir.path().join("single");
        std::fs::write(&single, b"y").unwrap();

        remove_files(&[
            dir.path().join("a").display().to_string(),
            single.display().to_string(),
            dir.path().join("missing").display().to_string(),
        ])
        .await
        .unwrap();
        assert!(!dir.path().join("a").exists());
        assert!(!single.exists());
    }

    #[tokio::test]
    async fn test_remove_files_rejects_roots() {
        for bad in ["", "/", "\\"] {
            let err = remove_files(&[bad.to_string()]).await.unwrap_err();
            assert!(matches!(err, TransferError::InvalidPath(_)), "{bad:?}");
        }
    }
}
