//! One-level directory listing.

use std::path::Path;
use std::time::SystemTime;

use serde::{Serialize, Serializer};

/// Kind of a listed entry. Serialized as its integer tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File = 0,
    Directory = 1,
    /// Part of the wire vocabulary for volume roots. Unix listings never
    /// report it.
    Volume = 2,
}

impl Serialize for FileKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// Modification time, unix seconds.
    pub time: i64,
    #[serde(rename = "type")]
    pub kind: FileKind,
}

/// List the immediate children of `path`, sorted by name.
///
/// Entries are not followed through symlinks; a link to a directory is
/// reported as a file of the link's own size.
pub async fn list_files(path: &Path) -> std::io::Result<Vec<FileEntry>> {
    let mut read_dir = tokio::fs::read_dir(path).await?;
    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        entries.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: metadata.len(),
            time,
            kind: if metadata.is_dir() {
                FileKind::Directory
            } else {
                FileKind::File
            },
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();

        let entries = list_files(dir.path()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a");
        assert_eq!(entries[0].kind, FileKind::Directory);
        assert_eq!(entries[1].name, "b.txt");
        assert_eq!(entries[1].size, 5);
        assert_eq!(entries[1].kind, FileKind::File);
        assert!(entries[1].time > 0);
    }

    #[tokio::test]
    async fn test_list_missing_dir() {
        let err = list_files(Path::new("/nonexistent/tether-test")).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_kind_serializes_as_integer() {
        let entry = FileEntry {
            name: "x".into(),
            size: 1,
            time: 2,
            kind: FileKind::Directory,
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["type"], 1);
        assert_eq!(v["time"], 2);
        assert_eq!(serde_json::to_value(FileKind::Volume).unwrap(), 2);
    }
}
