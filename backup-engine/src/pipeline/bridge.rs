//! Adapters between bounded chunk channels and `std::io` / tokio I/O.
//!
//! The tar stages run on blocking threads and speak `Read`/`Write`; the
//! transforms and sinks are async. Every stage boundary is a bounded
//! `mpsc::channel<Bytes>`, so a slow consumer blocks its producer.

use bytes::{Buf, Bytes, BytesMut};
use futures_util::Stream;
use std::io::{self, Read, Write};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// Message carried by the errors a closed or cancelled channel produces
const CANCELLED: &str = "pipeline cancelled";

/// `Write` half of a stage boundary, for use on a blocking thread.
pub struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
    buf: BytesMut,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<Bytes>, chunk_size: usize, cancel: CancellationToken) -> Self {
        Self {
            tx,
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
            cancel,
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(io::Error::other(CANCELLED));
        }
        let chunk = self.buf.split().freeze();
        self.buf.reserve(self.chunk_size);
        self.tx
            .blocking_send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "downstream stage closed"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other(CANCELLED));
        }
        self.buf.extend_from_slice(data);
        if self.buf.len() >= self.chunk_size {
            self.send_buffered()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

/// `Read` half of a stage boundary, for use on a blocking thread.
///
/// End of stream is reported when the upstream stage drops its sender.
pub struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChannelReader {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = out.len().min(self.current.len());
        out[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Async buffered reader over a chunk receiver.
pub type ReceiverReader = StreamReader<ChunkStream, Bytes>;

pub fn receiver_reader(rx: mpsc::Receiver<Bytes>) -> ReceiverReader {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, io::Error>(chunk), rx))
    });
    StreamReader::new(Box::pin(stream) as ChunkStream)
}
