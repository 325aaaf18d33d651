//! Ring buffer event consumer
//!
//! Raw records come from a [`RecordSource`]; the consumer decodes them into
//! [`FcntlEvent`]s. There is no natural end to a ring buffer: the stream ends
//! only when the paired [`CloseHandle`] is closed, which also unblocks a read
//! that is currently pending.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use hooktail_common::FcntlEvent;
use serde::Deserialize;
use std::io::{self, Write};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{decode_event, table_header, DecodeError, EventRow};

/// Producer of raw ring buffer records
#[async_trait]
pub trait RecordSource: Send {
    /// Wait for the next record. Must be cancel-safe: dropping the future
    /// before it completes must not lose a record.
    async fn recv(&mut self) -> io::Result<Bytes>;
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("reading from ring buffer: {0}")]
    Read(#[source] io::Error),

    #[error("parsing ring buffer event: {0}")]
    Decode(#[from] DecodeError),

    #[error("ring buffer reader is closed")]
    Closed,
}

/// Outcome of one successful [`EventConsumer::next_event`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Event(FcntlEvent),
    EndOfStream,
}

/// Closes the reader from another task
#[derive(Debug, Clone)]
pub struct CloseHandle {
    token: CancellationToken,
}

impl CloseHandle {
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct EventConsumer<S> {
    source: S,
    closed: CancellationToken,
    finished: bool,
}

impl<S: RecordSource> EventConsumer<S> {
    pub fn new(source: S) -> (Self, CloseHandle) {
        let closed = CancellationToken::new();
        let handle = CloseHandle {
            token: closed.clone(),
        };
        let consumer = Self {
            source,
            closed,
            finished: false,
        };
        (consumer, handle)
    }

    /// Block until a record arrives or the reader is closed
    ///
    /// `EndOfStream` is returned exactly once; every call after that fails
    /// with [`ConsumerError::Closed`].
    pub async fn next_event(&mut self) -> Result<Next, ConsumerError> {
        if self.finished {
            return Err(ConsumerError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                self.finished = true;
                Ok(Next::EndOfStream)
            }
            record = self.source.recv() => {
                let record = record.map_err(ConsumerError::Read)?;
                Ok(Next::Event(decode_event(&record)?))
            }
        }
    }

    /// Decoded events as a stream that ends at `EndOfStream`
    ///
    /// The stream borrows the consumer, so the underlying source stays alive
    /// (and owned by the caller) after the stream is done.
    pub fn events(&mut self) -> impl Stream<Item = Result<FcntlEvent, ConsumerError>> + '_ {
        futures::stream::unfold(self, |consumer| async move {
            match consumer.next_event().await {
                Ok(Next::Event(event)) => Some((Ok(event), consumer)),
                Ok(Next::EndOfStream) | Err(ConsumerError::Closed) => None,
                Err(e) => Some((Err(e), consumer)),
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub printed: u64,
    pub decode_errors: u64,
    pub read_errors: u64,
}

/// Print every event until the reader is closed
///
/// Malformed records and read errors are logged and skipped; only a failure
/// to write the output is returned. The consumer is only borrowed: its
/// source is released by the caller, after the attachment.
pub async fn consume<S, W>(
    consumer: &mut EventConsumer<S>,
    format: OutputFormat,
    out: &mut W,
) -> io::Result<ConsumeSummary>
where
    S: RecordSource,
    W: Write,
{
    let mut summary = ConsumeSummary::default();

    if format == OutputFormat::Table {
        writeln!(out, "{}", table_header())?;
    }

    let stream = consumer.events();
    futures::pin_mut!(stream);

    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                let row = EventRow::from(&event);
                match format {
                    OutputFormat::Table => writeln!(out, "{}", row)?,
                    OutputFormat::Json => {
                        serde_json::to_writer(&mut *out, &row)?;
                        writeln!(out)?;
                    }
                }
                out.flush()?;
                summary.printed += 1;
            }
            Err(e @ ConsumerError::Decode(_)) => {
                warn!("{}", e);
                summary.decode_errors += 1;
            }
            Err(e) => {
                warn!("{}", e);
                summary.read_errors += 1;
            }
        }
    }

    info!("Received signal, exiting..");
    debug!(
        printed = summary.printed,
        decode_errors = summary.decode_errors,
        read_errors = summary.read_errors,
        "Consumer finished"
    );
    Ok(summary)
}

/// Records fed through a channel; used where no kernel is available
pub struct ChannelSource {
    rx: tokio::sync::mpsc::Receiver<io::Result<Bytes>>,
}

impl ChannelSource {
    pub fn new(rx: tokio::sync::mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl RecordSource for ChannelSource {
    async fn recv(&mut self) -> io::Result<Bytes> {
        match self.rx.recv().await {
            Some(record) => record,
            // Senders gone: nothing more will ever arrive, wait for close.
            None => futures::future::pending().await,
        }
    }
}

#[cfg(target_os = "linux")]
pub use kernel::RingBufSource;

#[cfg(target_os = "linux")]
mod kernel {
    use super::RecordSource;
    use async_trait::async_trait;
    use aya::maps::{Map, MapData, RingBuf};
    use bytes::Bytes;
    use std::io;
    use tokio::io::unix::AsyncFd;

    use crate::{HooktailError, Result};

    /// Kernel ring buffer polled through epoll readiness
    pub struct RingBufSource {
        fd: AsyncFd<RingBuf<MapData>>,
    }

    impl RingBufSource {
        pub fn new(map: Map) -> Result<Self> {
            let ring_buf = RingBuf::try_from(map).map_err(|e| {
                HooktailError::MapError(format!("EVENTS is not a ring buffer: {}", e))
            })?;
            Ok(Self {
                fd: AsyncFd::new(ring_buf)?,
            })
        }
    }

    #[async_trait]
    impl RecordSource for RingBufSource {
        async fn recv(&mut self) -> io::Result<Bytes> {
            loop {
                let mut guard = self.fd.readable_mut().await?;
                if let Some(item) = guard.get_inner_mut().next() {
                    let record = Bytes::copy_from_slice(&item);
                    drop(item);
                    return Ok(record);
                }
                guard.clear_ready();
            }
        }
    }
}
