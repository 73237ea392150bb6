//! Byte sources the scheduler reads chunk ranges from.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt},
};

#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// File name reported to the server.
    fn name(&self) -> &str;

    fn size(&self) -> u64;

    /// Media type recorded alongside the resume state, when known.
    fn content_type(&self) -> Option<&str> {
        None
    }

    /// Read exactly `range` from the source.
    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes>;
}

/// A file on local disk. Every read opens its own handle so concurrent
/// workers never share a cursor.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: String,
    size: u64,
    content_type: Option<&'static str>,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let content_type = guess_content_type(&path);
        Ok(Self {
            path,
            name,
            size: meta.len(),
            content_type,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type
    }

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        let mut file = fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

fn guess_content_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "pdf" => "application/pdf",
        "json" => "application/json",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "mp4" => "video/mp4",
        "bin" => "application/octet-stream",
        _ => return None,
    };
    Some(mime)
}

/// An in-memory payload.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Bytes,
    content_type: Option<String>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[async_trait]
impl ChunkSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    async fn read_range(&self, range: Range<u64>) -> io::Result<Bytes> {
        if range.end > self.size() || range.start > range.end {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {:?} outside {} bytes", range, self.size()),
            ));
        }
        Ok(self.data.slice(range.start as usize..range.end as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_source_reads_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("letters.txt");
        std::fs::write(&path, b"ABCDEFGHIJ").unwrap();

        let source = FileSource::open(&path).await.unwrap();
        assert_eq!(source.name(), "letters.txt");
        assert_eq!(source.size(), 10);
        assert_eq!(source.content_type(), Some("text/plain"));
        assert_eq!(&source.read_range(4..8).await.unwrap()[..], b"EFGH");
        assert_eq!(&source.read_range(8..10).await.unwrap()[..], b"IJ");
        assert!(source.read_range(8..12).await.is_err());
    }

    #[tokio::test]
    async fn unknown_extensions_have_no_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.xyz");
        std::fs::write(&path, b"x").unwrap();
        let source = FileSource::open(&path).await.unwrap();
        assert_eq!(source.content_type(), None);
    }

    #[tokio::test]
    async fn directories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSource::open(dir.path()).await.is_err());
    }
}
