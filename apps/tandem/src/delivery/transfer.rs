//! Chunked file transfer over a dedicated data channel.
//!
//! The sender writes the metadata as one text frame and then the payload in
//! `CHUNK_SIZE` binary frames. The receiver reports completion only when the
//! accumulated byte count equals the declared size.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tandem_proto::{BinaryType, FileMetadata};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use super::queue::{FileSource, OutgoingFile};
use crate::transport::{DataChannel, TransportError};

pub const CHUNK_SIZE: usize = 16 * 1024;
/// Binary frames accepted before the metadata frame arrives.
const MAX_EARLY_BYTES: usize = 64 * CHUNK_SIZE;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed file metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("received {received} bytes for a {expected}-byte file")]
    Overflow { expected: u64, received: u64 },
    #[error("file source holds {actual} bytes but metadata declares {declared}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("too much data before file metadata")]
    MissingMetadata,
    #[error("transfer timed out")]
    TimedOut,
}

/// Binary representation used on a file channel. Streamed blocks only when
/// both sides advertise the same representation; raw buffers otherwise.
pub fn negotiate_binary_type(local: Option<BinaryType>, remote: Option<BinaryType>) -> BinaryType {
    match (local, remote) {
        (Some(local), Some(remote)) if local == remote => local,
        _ => BinaryType::ArrayBuffer,
    }
}

/// How long an incomplete transfer may linger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferPolicy {
    pub timeout: Option<Duration>,
}

impl TransferPolicy {
    pub fn expired(&self, started_at: Instant, now: Instant) -> bool {
        self.timeout
            .is_some_and(|timeout| now.saturating_duration_since(started_at) >= timeout)
    }
}

pub struct FileSender {
    file: OutgoingFile,
    binary_type: BinaryType,
}

impl FileSender {
    pub fn new(file: OutgoingFile, binary_type: BinaryType) -> Self {
        Self { file, binary_type }
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.file.metadata
    }

    /// Sends metadata then every chunk. Returns the number of chunks sent.
    pub async fn send_over(&self, channel: &dyn DataChannel) -> Result<usize, TransferError> {
        channel.set_binary_type(self.binary_type);
        let metadata = serde_json::to_string(&self.file.metadata)?;
        channel.send_text(&metadata).await?;

        let (chunks, sent) = match (&self.file.source, self.binary_type) {
            (FileSource::Bytes(data), _) => send_slices(channel, data.clone()).await?,
            (FileSource::Path(path), BinaryType::ArrayBuffer) => {
                let data = Bytes::from(tokio::fs::read(path).await?);
                send_slices(channel, data).await?
            }
            (FileSource::Path(path), BinaryType::Blob) => stream_file(channel, path).await?,
        };

        if sent != self.file.metadata.size {
            return Err(TransferError::SizeMismatch {
                declared: self.file.metadata.size,
                actual: sent,
            });
        }
        debug!(
            target: "tandem::delivery",
            label = %channel.label(),
            chunks,
            bytes = sent,
            binary_type = ?self.binary_type,
            "file sent"
        );
        Ok(chunks)
    }
}

async fn send_slices(
    channel: &dyn DataChannel,
    data: Bytes,
) -> Result<(usize, u64), TransferError> {
    let mut chunks = 0;
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + CHUNK_SIZE).min(data.len());
        channel.send_binary(data.slice(offset..end)).await?;
        offset = end;
        chunks += 1;
    }
    Ok((chunks, data.len() as u64))
}

async fn stream_file(
    channel: &dyn DataChannel,
    path: &Path,
) -> Result<(usize, u64), TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut chunks = 0;
    let mut sent = 0u64;
    loop {
        let mut block = BytesMut::with_capacity(CHUNK_SIZE);
        while block.len() < CHUNK_SIZE {
            if file.read_buf(&mut block).await? == 0 {
                break;
            }
        }
        if block.is_empty() {
            break;
        }
        let full = block.len() == CHUNK_SIZE;
        sent += block.len() as u64;
        channel.send_binary(block.freeze()).await?;
        chunks += 1;
        if !full {
            break;
        }
    }
    Ok((chunks, sent))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Bytes,
}

impl ReceivedFile {
    /// Writes the file into `dir` under `<timestamp>-<name>`, keeping only the
    /// final path component of the advertised name.
    pub async fn save_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let name = Path::new(&self.metadata.name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "download".to_string());
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}-{}", self.metadata.timestamp, name));
        tokio::fs::write(&path, &self.data).await?;
        Ok(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveProgress {
    Pending,
    Complete(ReceivedFile),
}

/// Receiving end of one file channel.
#[derive(Debug)]
pub struct FileReceiver {
    label: String,
    started_at: Instant,
    metadata: Option<FileMetadata>,
    chunks: Vec<Bytes>,
    received: u64,
    done: bool,
}

impl FileReceiver {
    pub fn new(label: impl Into<String>, started_at: Instant) -> Self {
        Self {
            label: label.into(),
            started_at,
            metadata: None,
            chunks: Vec::new(),
            received: 0,
            done: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn metadata(&self) -> Option<&FileMetadata> {
        self.metadata.as_ref()
    }

    pub fn on_text(&mut self, text: &str) -> Result<ReceiveProgress, TransferError> {
        let metadata: FileMetadata = serde_json::from_str(text)?;
        trace!(target: "tandem::delivery", label = %self.label, size = metadata.size, "file metadata");
        self.metadata = Some(metadata);
        self.check()
    }

    pub fn on_binary(&mut self, data: Bytes) -> Result<ReceiveProgress, TransferError> {
        self.received += data.len() as u64;
        self.chunks.push(data);
        if self.metadata.is_none() && self.received > MAX_EARLY_BYTES as u64 {
            return Err(TransferError::MissingMetadata);
        }
        self.check()
    }

    fn check(&mut self) -> Result<ReceiveProgress, TransferError> {
        let Some(metadata) = &self.metadata else {
            return Ok(ReceiveProgress::Pending);
        };
        if self.done {
            return Ok(ReceiveProgress::Pending);
        }
        if self.received > metadata.size {
            return Err(TransferError::Overflow {
                expected: metadata.size,
                received: self.received,
            });
        }
        if self.received < metadata.size {
            return Ok(ReceiveProgress::Pending);
        }

        self.done = true;
        let mut data = BytesMut::with_capacity(self.received as usize);
        for chunk in self.chunks.drain(..) {
            data.extend_from_slice(&chunk);
        }
        Ok(ReceiveProgress::Complete(ReceivedFile {
            metadata: metadata.clone(),
            data: data.freeze(),
        }))
    }
}
