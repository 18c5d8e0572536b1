//! Per-event reader over the kernel-shared sample buffer
//!
//! Producers (one task per CPU for the perf backend) push raw samples into a
//! bounded channel; the single consumer pulls them one at a time with
//! [`EventSource::read`]. Closing is signalled out of band through a
//! [`CloseHandle`] so a read blocked in another task can be interrupted.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default number of samples buffered between producers and the consumer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The reader was closed. This is the graceful end of the stream.
    #[error("reader closed")]
    Closed,

    #[error("all event producers stopped without the reader being closed")]
    Disconnected,

    #[error("perf buffer error: {0}")]
    Buffer(String),
}

impl ReadError {
    pub fn is_closed(&self) -> bool {
        matches!(self, ReadError::Closed)
    }
}

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("map {name} is not a perf event array: {reason}")]
    WrongMapType { name: String, reason: String },

    #[error("failed to list online CPUs: {0}")]
    OnlineCpus(String),

    #[error("failed to open perf buffer for CPU {cpu}: {reason}")]
    PerfBuffer { cpu: u32, reason: String },

    #[error("invalid buffer size {0}")]
    InvalidBufferSize(usize),
}

/// Cloneable handle that closes a reader from anywhere
#[derive(Clone, Debug, Default)]
pub struct CloseHandle {
    token: CancellationToken,
}

impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the reader. Calling this more than once has no further effect.
    pub fn close(&self) {
        if !self.token.is_cancelled() {
            debug!("Closing event reader");
        }
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// A source of raw event samples, one sample per read
#[async_trait]
pub trait EventSource: Send {
    /// Wait for the next sample.
    ///
    /// Returns [`ReadError::Closed`] once the source has been closed,
    /// including for reads that were already waiting when the close happened.
    async fn read(&mut self) -> Result<Bytes, ReadError>;

    fn close_handle(&self) -> CloseHandle;

    fn close(&mut self) {
        self.close_handle().close();
    }
}

/// Producer half of a [`RingReader`]
#[derive(Clone)]
pub struct RingSender {
    tx: mpsc::Sender<Result<Bytes, ReadError>>,
    closer: CloseHandle,
}

impl RingSender {
    /// Queue a sample. Returns `false` once the reader is closed or gone.
    pub async fn send(&self, sample: Bytes) -> bool {
        self.push(Ok(sample)).await
    }

    /// Queue a producer failure; the consumer sees it on its next read.
    pub async fn fail(&self, err: ReadError) -> bool {
        self.push(Err(err)).await
    }

    async fn push(&self, item: Result<Bytes, ReadError>) -> bool {
        tokio::select! {
            biased;
            _ = self.closer.closed() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.closer.clone()
    }
}

/// Consumer half: the reader handed to the ingestion loop
pub struct RingReader {
    rx: mpsc::Receiver<Result<Bytes, ReadError>>,
    closer: CloseHandle,
    producers: Vec<JoinHandle<()>>,
}

/// Create a connected sender/reader pair.
pub fn channel(capacity: usize) -> (RingSender, RingReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closer = CloseHandle::new();
    (
        RingSender {
            tx,
            closer: closer.clone(),
        },
        RingReader {
            rx,
            closer,
            producers: Vec::new(),
        },
    )
}

impl RingReader {
    /// Tie a producer task's lifetime to this reader; it is aborted on drop.
    pub fn adopt(&mut self, producer: JoinHandle<()>) {
        self.producers.push(producer);
    }
}

#[async_trait]
impl EventSource for RingReader {
    async fn read(&mut self) -> Result<Bytes, ReadError> {
        if self.closer.is_closed() {
            return Err(ReadError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.closer.closed() => Err(ReadError::Closed),
            item = self.rx.recv() => match item {
                Some(item) => item,
                None if self.closer.is_closed() => Err(ReadError::Closed),
                None => Err(ReadError::Disconnected),
            },
        }
    }

    fn close_handle(&self) -> CloseHandle {
        self.closer.clone()
    }
}

impl Drop for RingReader {
    fn drop(&mut self) {
        self.closer.close();
        for producer in self.producers.drain(..) {
            producer.abort();
        }
    }
}
