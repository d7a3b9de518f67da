//! Line-preserving chunk source
//!
//! A [`ChunkSource`] yields the input as an ordered, gapless, 1-indexed
//! stream of [`Chunk`]s whose concatenation is byte-for-byte the input.
//! [`LineChunkSource`] cuts only after a newline, so no record is ever split
//! across two chunks; a line longer than the chunk size travels whole.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{LoadError, LoadResult};

/// One ordered unit of the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based sequence number
    pub number: usize,
    /// Raw bytes
    pub content: Vec<u8>,
}

impl Chunk {
    /// Payload size
    pub fn size_bytes(&self) -> usize {
        self.content.len()
    }
}

/// Stream of chunks produced by [`ChunkSource::open`]
pub type ChunkStream = Pin<Box<dyn Stream<Item = LoadResult<Chunk>> + Send>>;

/// Restartable producer of chunks
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Human readable origin, for logs
    fn describe(&self) -> String;

    /// Start a fresh pass over the input
    async fn open(&self) -> LoadResult<ChunkStream>;
}

/// Totals of one pass over a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SourceSummary {
    /// Number of chunks
    pub total_chunks: usize,
    /// Bytes across all chunks
    pub total_bytes: u64,
    /// Lines after the header line
    pub data_rows: u64,
}

/// Stream the source once and count chunks, bytes and data rows
pub async fn summarize(source: &dyn ChunkSource) -> LoadResult<SourceSummary> {
    let mut stream = source.open().await?;
    let mut summary = SourceSummary::default();
    let mut lines: u64 = 0;
    let mut ends_with_newline = true;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        summary.total_chunks += 1;
        summary.total_bytes += chunk.size_bytes() as u64;
        lines += chunk.content.iter().filter(|b| **b == b'\n').count() as u64;
        if let Some(last) = chunk.content.last() {
            ends_with_newline = *last == b'\n';
        }
    }
    if !ends_with_newline {
        lines += 1;
    }
    summary.data_rows = lines.saturating_sub(1);

    tracing::debug!(
        source = %source.describe(),
        chunks = summary.total_chunks,
        bytes = summary.total_bytes,
        rows = summary.data_rows,
        "Input summarized"
    );
    Ok(summary)
}

#[derive(Debug, Clone)]
enum Origin {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

/// Chunk source over a file or an in-memory buffer
#[derive(Debug, Clone)]
pub struct LineChunkSource {
    origin: Origin,
    chunk_size: usize,
}

impl LineChunkSource {
    /// Source over a file on disk
    pub fn from_path(path: impl Into<PathBuf>, chunk_size: usize) -> LoadResult<Self> {
        Self::new(Origin::File(path.into()), chunk_size)
    }

    /// Source over bytes already in memory
    pub fn from_bytes(bytes: impl Into<Vec<u8>>, chunk_size: usize) -> LoadResult<Self> {
        Self::new(Origin::Memory(Arc::from(bytes.into())), chunk_size)
    }

    fn new(origin: Origin, chunk_size: usize) -> LoadResult<Self> {
        if chunk_size == 0 {
            return Err(LoadError::config("chunk_size must be positive"));
        }
        Ok(Self { origin, chunk_size })
    }

    /// Target chunk size in bytes
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

#[async_trait]
impl ChunkSource for LineChunkSource {
    fn describe(&self) -> String {
        match &self.origin {
            Origin::File(path) => path.display().to_string(),
            Origin::Memory(bytes) => format!("<memory: {} bytes>", bytes.len()),
        }
    }

    async fn open(&self) -> LoadResult<ChunkStream> {
        let reader: Box<dyn AsyncRead + Send + Unpin> = match &self.origin {
            Origin::File(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    LoadError::input(format!("cannot open {}: {e}", path.display()))
                })?;
                Box::new(file)
            }
            Origin::Memory(bytes) => Box::new(std::io::Cursor::new(Arc::clone(bytes))),
        };
        Ok(split_lines(reader, self.chunk_size))
    }
}

struct Splitter {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    chunk_size: usize,
    carry: Vec<u8>,
    next_number: usize,
    eof: bool,
}

impl Splitter {
    async fn next_chunk(&mut self) -> LoadResult<Option<Chunk>> {
        loop {
            if self.eof {
                if self.carry.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.carry);
                return Ok(Some(self.emit(rest)));
            }

            let mut block = Vec::with_capacity(self.chunk_size);
            let read = (&mut self.reader)
                .take(self.chunk_size as u64)
                .read_to_end(&mut block)
                .await?;
            if read == 0 {
                self.eof = true;
                continue;
            }

            self.carry.extend_from_slice(&block);
            if let Some(pos) = self.carry.iter().rposition(|b| *b == b'\n') {
                let tail = self.carry.split_off(pos + 1);
                let complete = std::mem::replace(&mut self.carry, tail);
                return Ok(Some(self.emit(complete)));
            }
        }
    }

    fn emit(&mut self, content: Vec<u8>) -> Chunk {
        let chunk = Chunk {
            number: self.next_number,
            content,
        };
        self.next_number += 1;
        chunk
    }
}

fn split_lines(reader: Box<dyn AsyncRead + Send + Unpin>, chunk_size: usize) -> ChunkStream {
    let splitter = Splitter {
        reader,
        chunk_size,
        carry: Vec::new(),
        next_number: 1,
        eof: false,
    };
    Box::pin(futures::stream::try_unfold(splitter, |mut splitter| async move {
        let next = splitter.next_chunk().await?;
        Ok::<_, LoadError>(next.map(|chunk| (chunk, splitter)))
    }))
}
