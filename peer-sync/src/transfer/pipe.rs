//! Bounded handoff between a blocking producer and an async consumer.
//!
//! The producer runs on the blocking pool and writes into a [`ChannelWriter`];
//! the consumer (an HTTP request body) reads the resulting [`BodyStream`]. If
//! the producer fails, its error is pushed into the stream so the request
//! aborts instead of completing with a truncated body. The producer's own
//! result is returned through [`Pipe::producer`], which callers must await.

use crate::{Result, SyncError};
use bytes::Bytes;
use futures_util::Stream;
use std::io::{self, Write};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bytes buffered by the writer before a message is sent.
pub const PIPE_BUFFER_SIZE: usize = 64 * 1024;
/// Messages in flight between producer and consumer.
pub const PIPE_DEPTH: usize = 8;

pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// `Write` end of a pipe. Must only be used from a blocking context.
pub struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(PIPE_BUFFER_SIZE),
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(&mut self.buf, Vec::with_capacity(PIPE_BUFFER_SIZE)));
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "upload stream closed by consumer"))
    }

    fn fail(&self, message: String) {
        // The consumer may already be gone; nothing left to notify then.
        let _ = self.tx.blocking_send(Err(io::Error::new(io::ErrorKind::Other, message)));
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() >= PIPE_BUFFER_SIZE {
            self.send_buffered()?;
        }
        let take = (PIPE_BUFFER_SIZE - self.buf.len()).min(data.len());
        self.buf.extend_from_slice(&data[..take]);
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

pub struct Pipe<T> {
    pub stream: BodyStream,
    pub producer: JoinHandle<Result<T>>,
}

impl<T> Pipe<T> {
    /// Wait for the producer and return its result.
    pub async fn join(producer: JoinHandle<Result<T>>) -> Result<T> {
        producer
            .await
            .map_err(|e| SyncError::Io(io::Error::new(io::ErrorKind::Other, format!("producer task failed: {e}"))))?
    }
}

/// Run `produce` on the blocking pool, streaming what it writes.
///
/// Everything `produce` wrote is flushed before the stream ends.
pub fn spawn_producer<T, F>(produce: F) -> Pipe<T>
where
    T: Send + 'static,
    F: FnOnce(&mut ChannelWriter) -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(PIPE_DEPTH);

    let producer = tokio::task::spawn_blocking(move || {
        let mut writer = ChannelWriter::new(tx);
        let result = produce(&mut writer).and_then(|out| {
            writer.flush()?;
            Ok(out)
        });
        if let Err(e) = &result {
            writer.fail(e.to_string());
        }
        result
    });

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });

    Pipe {
        stream: Box::pin(stream),
        producer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    async fn collect(mut stream: BodyStream) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_stream_carries_everything_written() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 256) as u8).collect();
        let expected = data.clone();

        let pipe = spawn_producer(move |w| {
            w.write_all(&data)?;
            Ok(data.len() as u64)
        });

        let received = collect(pipe.stream).await.unwrap();
        assert_eq!(received, expected);
        assert_eq!(Pipe::join(pipe.producer).await.unwrap(), 300_000);
    }

    #[tokio::test]
    async fn test_producer_failure_reaches_consumer() {
        let pipe = spawn_producer(|w| -> Result<u64> {
            w.write_all(b"partial")?;
            Err(SyncError::Crypto("boom".to_string()))
        });

        let err = collect(pipe.stream).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(Pipe::join(pipe.producer).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_consumer_stops_producer() {
        let pipe = spawn_producer(|w| -> Result<u64> {
            let block = vec![0u8; PIPE_BUFFER_SIZE];
            loop {
                w.write_all(&block)?;
            }
        });
        drop(pipe.stream);

        let err = Pipe::join(pipe.producer).await.unwrap_err();
        assert!(matches!(err, SyncError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    }
}
