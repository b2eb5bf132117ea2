//! Input resolution: turn a path or URL into a local PDF file.
//!
//! pdfium opens files by path, so URLs are streamed into a temporary
//! directory that lives as long as the [`ResolvedInput`]. Every input is
//! checked for the `%PDF` signature before pdfium sees it.

use crate::error::Pdf2MdError;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";
const FALLBACK_NAME: &str = "document.pdf";

/// A PDF ready to open, plus the name it was given by the user or server.
#[derive(Debug)]
pub enum ResolvedInput {
    Local(PathBuf),
    /// Downloaded into `dir`, which is deleted on drop.
    Downloaded {
        path: PathBuf,
        url: String,
        dir: TempDir,
    },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }

    /// File stem the document id is derived from.
    pub fn stem(&self) -> String {
        self.path()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "document".to_string())
    }

    /// Where the PDF came from, for log messages.
    pub fn origin(&self) -> String {
        match self {
            ResolvedInput::Local(p) => p.display().to_string(),
            ResolvedInput::Downloaded { url, dir, .. } => {
                format!("{url} (via {})", dir.path().display())
            }
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// First four bytes, or `None` when they are the PDF signature.
fn bad_magic(head: &[u8]) -> Option<[u8; 4]> {
    if head.len() < 4 {
        let mut magic = [0u8; 4];
        magic[..head.len()].copy_from_slice(head);
        return Some(magic);
    }
    let magic: [u8; 4] = [head[0], head[1], head[2], head[3]];
    (&magic != PDF_MAGIC).then_some(magic)
}

/// Resolve `input` to a local PDF, downloading it first when it is a URL.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, Pdf2MdError> {
    let resolved = if is_url(input) {
        download(input, timeout_secs).await?
    } else {
        open_local(input).await?
    };
    debug!("Resolved input: {}", resolved.origin());
    Ok(resolved)
}

async fn open_local(path_str: &str) -> Result<ResolvedInput, Pdf2MdError> {
    let path = PathBuf::from(path_str);
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(Pdf2MdError::PermissionDenied { path });
        }
        Err(_) => return Err(Pdf2MdError::FileNotFound { path }),
    };
    if file.metadata().await.is_ok_and(|m| m.is_dir()) {
        return Err(Pdf2MdError::FileNotFound { path });
    }

    let mut head = [0u8; 4];
    let mut read = 0;
    while read < head.len() {
        match file.read(&mut head[read..]).await {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(_) => break,
        }
    }
    if let Some(magic) = bad_magic(&head[..read]) {
        return Err(Pdf2MdError::NotAPdf { path, magic });
    }
    Ok(ResolvedInput::Local(path))
}

fn download_failed(url: &str, reason: impl ToString) -> Pdf2MdError {
    Pdf2MdError::DownloadFailed {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

/// Stream `url` into a temp directory, checking the signature on the
/// first bytes so an HTML error page is rejected without reading it all.
async fn download(url: &str, timeout_secs: u64) -> Result<ResolvedInput, Pdf2MdError> {
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| download_failed(url, e))?;
    let timed_out = |e: reqwest::Error| {
        if e.is_timeout() {
            Pdf2MdError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            download_failed(url, e)
        }
    };

    let response = client.get(url).send().await.map_err(timed_out)?;
    if !response.status().is_success() {
        return Err(download_failed(url, format!("HTTP {}", response.status())));
    }

    let name = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(disposition_filename)
        .or_else(|| url_filename(url))
        .unwrap_or_else(|| FALLBACK_NAME.to_string());

    let dir = TempDir::new().map_err(|e| Pdf2MdError::Internal(e.to_string()))?;
    let path = dir.path().join(&name);
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| Pdf2MdError::Internal(format!("Failed to create temp file: {e}")))?;

    let mut head: Vec<u8> = Vec::with_capacity(4);
    let mut total = 0usize;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(timed_out)?;
        if head.len() < 4 {
            let take = (4 - head.len()).min(chunk.len());
            head.extend_from_slice(&chunk[..take]);
            if head.len() == 4 {
                if let Some(magic) = bad_magic(&head) {
                    return Err(Pdf2MdError::NotAPdf { path, magic });
                }
            }
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| Pdf2MdError::Internal(format!("Failed to write temp file: {e}")))?;
        total += chunk.len();
    }
    file.flush()
        .await
        .map_err(|e| Pdf2MdError::Internal(format!("Failed to write temp file: {e}")))?;
    if let Some(magic) = bad_magic(&head) {
        return Err(Pdf2MdError::NotAPdf { path, magic });
    }

    info!("Downloaded {} bytes to {}", total, path.display());
    Ok(ResolvedInput::Downloaded {
        path,
        url: url.to_string(),
        dir,
    })
}

/// Keep a server-supplied name to its last path component.
fn safe_name(raw: &str) -> Option<String> {
    let name = raw
        .trim()
        .trim_matches('"')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .to_string();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}

/// `filename=` parameter of a `Content-Disposition` header.
fn disposition_filename(header: &str) -> Option<String> {
    header
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("filename"))
        .and_then(|(_, value)| safe_name(value))
}

fn url_filename(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.contains('.') {
        safe_name(last)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url(""));
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = open_local("/definitely/not/here.pdf").await.unwrap_err();
        assert!(matches!(err, Pdf2MdError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn wrong_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.pdf");
        std::fs::write(&path, b"PK\x03\x04 zip, not pdf").unwrap();
        let err = open_local(path.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, Pdf2MdError::NotAPdf { magic, .. } if &magic == b"PK\x03\x04"));
    }

    #[tokio::test]
    async fn truncated_file_is_not_a_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.pdf");
        std::fs::write(&path, b"%P").unwrap();
        let err = open_local(path.to_str().unwrap()).await.unwrap_err();
        assert!(matches!(err, Pdf2MdError::NotAPdf { .. }));
    }

    #[tokio::test]
    async fn stem_names_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("annual report.pdf");
        std::fs::write(&path, b"%PDF-1.7\n").unwrap();
        let resolved = open_local(path.to_str().unwrap()).await.unwrap();
        assert_eq!(resolved.stem(), "annual report");
    }

    #[test]
    fn download_names() {
        assert_eq!(
            disposition_filename("attachment; filename=\"q3-report.pdf\"").as_deref(),
            Some("q3-report.pdf")
        );
        assert_eq!(
            disposition_filename("attachment; filename=../../etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(disposition_filename("inline"), None);
        assert_eq!(
            url_filename("https://arxiv.org/pdf/1706.03762v7.pdf?x=1").as_deref(),
            Some("1706.03762v7.pdf")
        );
        assert_eq!(url_filename("https://example.com/download"), None);
    }
}
