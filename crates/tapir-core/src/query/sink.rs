//! Output sinks for serialized results

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use crate::query::QueryError;

/// Destination of a serialized result body
#[async_trait]
pub trait ResultSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), QueryError>;

    async fn finish(&mut self) -> Result<(), QueryError>;
}

/// Persisted result file for async jobs
pub struct FileSink {
    path: PathBuf,
    writer: BufWriter<tokio::fs::File>,
    bytes: u64,
}

impl FileSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, QueryError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| QueryError::Write(format!("Cannot create result dir: {}", e)))?;
        }
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| QueryError::Write(format!("Cannot create {}: {}", path.display(), e)))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            bytes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

#[async_trait]
impl ResultSink for FileSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), QueryError> {
        self.writer
            .write_all(chunk)
            .await
            .map_err(|e| QueryError::Write(e.to_string()))?;
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), QueryError> {
        self.writer
            .flush()
            .await
            .map_err(|e| QueryError::Write(e.to_string()))
    }
}

/// Streams chunks into an HTTP response body for the sync path
///
/// The receiver side is turned into a body stream; the client dropping
/// the response shows up here as a closed channel and is classified as
/// a client abort, not a service fault.
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<u8>>,
    bytes: u64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, bytes: 0 }, rx)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

#[async_trait]
impl ResultSink for ChannelSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), QueryError> {
        self.tx
            .send(chunk.to_vec())
            .await
            .map_err(|_| QueryError::WriteAborted("response stream closed".to_string()))?;
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), QueryError> {
        Ok(())
    }
}

/// Minimum bytes buffered before a flush to the sink
pub const MIN_CHUNK: usize = 4 * 1024;

/// Maximum bytes handed to the sink in one write
pub const MAX_CHUNK: usize = 64 * 1024;

/// Buffers formatter output into the 4-64 KiB flush window
pub struct ChunkedWriter {
    sink: Box<dyn ResultSink>,
    buf: Vec<u8>,
    bytes: u64,
}

impl ChunkedWriter {
    pub fn new(sink: Box<dyn ResultSink>) -> Self {
        Self {
            sink,
            buf: Vec::with_capacity(MAX_CHUNK),
            bytes: 0,
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), QueryError> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= MIN_CHUNK {
            let take = self.buf.len().min(MAX_CHUNK);
            let chunk: Vec<u8> = self.buf.drain(..take).collect();
            self.sink.write(&chunk).await?;
            self.bytes += chunk.len() as u64;
        }
        Ok(())
    }

    pub async fn write_str(&mut self, data: &str) -> Result<(), QueryError> {
        self.write(data.as_bytes()).await
    }

    /// Flush the remainder and close the sink
    pub async fn finish(mut self) -> Result<u64, QueryError> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.sink.write(&rest).await?;
            self.bytes += rest.len() as u64;
        }
        self.sink.finish().await?;
        Ok(self.bytes)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes + self.buf.len() as u64
    }
}

#[cfg(test)]
pub mod tests_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink collecting everything in memory
    pub struct BufferSink {
        pub data: Arc<Mutex<Vec<u8>>>,
        pub writes: Arc<Mutex<Vec<usize>>>,
    }

    impl BufferSink {
        pub fn new() -> (Self, Arc<Mutex<Vec<u8>>>, Arc<Mutex<Vec<usize>>>) {
            let data = Arc::new(Mutex::new(Vec::new()));
            let writes = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    data: data.clone(),
                    writes: writes.clone(),
                },
                data,
                writes,
            )
        }
    }

    #[async_trait]
    impl ResultSink for BufferSink {
        async fn write(&mut self, chunk: &[u8]) -> Result<(), QueryError> {
            self.data.lock().unwrap().extend_from_slice(chunk);
            self.writes.lock().unwrap().push(chunk.len());
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), QueryError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::BufferSink;
    use super::*;

    #[tokio::test]
    async fn test_chunked_writer_respects_bounds() {
        let (sink, data, writes) = BufferSink::new();
        let mut writer = ChunkedWriter::new(Box::new(sink));

        // 150 KiB in odd-sized pieces
        let piece = vec![b'x'; 1000];
        for _ in 0..150 {
            writer.write(&piece).await.unwrap();
        }
        let total = writer.finish().await.unwrap();

        assert_eq!(total, 150_000);
        assert_eq!(data.lock().unwrap().len(), 150_000);

        let sizes = writes.lock().unwrap().clone();
        let (last, body) = sizes.split_last().unwrap();
        for size in body {
            assert!(*size >= MIN_CHUNK, "chunk below minimum: {}", size);
            assert!(*size <= MAX_CHUNK, "chunk above maximum: {}", size);
        }
        assert!(*last <= MAX_CHUNK);
    }

    #[tokio::test]
    async fn test_small_payload_flushed_at_finish() {
        let (sink, data, writes) = BufferSink::new();
        let mut writer = ChunkedWriter::new(Box::new(sink));
        writer.write_str("tiny").await.unwrap();
        assert!(writes.lock().unwrap().is_empty());
        let total = writer.finish().await.unwrap();
        assert_eq!(total, 4);
        assert_eq!(data.lock().unwrap().as_slice(), b"tiny");
    }

    #[tokio::test]
    async fn test_file_sink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs/j1/result.csv");
        let mut sink = FileSink::create(&path).await.unwrap();
        sink.write(b"a,b\n1,2\n").await.unwrap();
        sink.finish().await.unwrap();

        let body = tokio::fs::read(&path).await.unwrap();
        assert_eq!(body, b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_channel_sink_reports_client_abort() {
        let (mut sink, rx) = ChannelSink::new(4);
        drop(rx);
        let err = sink.write(b"data").await.unwrap_err();
        assert!(err.is_client_abort());
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_chunks() {
        let (mut sink, mut rx) = ChannelSink::new(4);
        sink.write(b"hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello");
    }
}
