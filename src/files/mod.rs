//! Agent-side file operations.
//!
//! - [`list`]: one-level directory listing
//! - [`transfer`]: bridged single-file download/upload and text upload
//! - [`archive`]: concurrent directory walk streamed into one ZIP body

pub mod archive;
pub mod list;
pub mod transfer;

pub use archive::{archive_paths, ArchiveOptions, ArchiveReport};
pub use list::{list_files, FileEntry, FileKind};
pub use transfer::{
    fetch_file, gbk_validate, push_body, remove_files, upload_files, upload_single, upload_text, UploadBody,
};

/// Errors surfaced by file operations.
///
/// Validation variants fail before any I/O is attempted; they are returned to
/// the controller verbatim and never retried.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("invalid range {start}..{end} for file of {size} bytes")]
    InvalidRange { start: u64, end: u64, size: u64 },
    #[error("file too large ({size} bytes, max {max})")]
    FileTooLarge { size: u64, max: u64 },
    #[error("unsupported text encoding")]
    UnsupportedEncoding,
    #[error("bridge request failed with status {0}")]
    Status(u16),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Stable machine-readable code, mirrored in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPath(_) => "INVALID_PATH",
            Self::InvalidRange { .. } => "INVALID_RANGE",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::UnsupportedEncoding => "UNSUPPORTED_ENCODING",
            Self::Status(_) | Self::Http(_) => "BRIDGE_FAILED",
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => "FILE_NOT_FOUND",
            Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            Self::Io(_) => "IO_ERROR",
        }
    }
}
