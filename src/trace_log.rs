//! Kernel trace log tail
//!
//! `bpf_printk` output lands in the tracefs ring. The agent dumps the whole
//! `trace` file once, then copies `trace_pipe` to its output until closed.

use crate::{HooktailError, Result};
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const TRACE_PATH: &str = "/sys/kernel/debug/tracing/trace";
pub const TRACE_PIPE_PATH: &str = "/sys/kernel/debug/tracing/trace_pipe";

#[derive(Debug, Clone)]
pub struct TraceLog {
    trace: PathBuf,
    pipe: PathBuf,
}

impl TraceLog {
    pub fn new(trace: impl Into<PathBuf>, pipe: impl Into<PathBuf>) -> Self {
        Self {
            trace: trace.into(),
            pipe: pipe.into(),
        }
    }

    /// Copy the entire current trace buffer to `out`
    pub async fn dump_current<W>(&self, out: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let contents = tokio::fs::read(&self.trace)
            .await
            .map_err(|source| HooktailError::TraceLog {
                path: self.trace.clone(),
                source,
            })?;
        out.write_all(&contents).await?;
        out.flush().await?;
        debug!(
            "Dumped {} bytes from {}",
            contents.len(),
            self.trace.display()
        );
        Ok(contents.len() as u64)
    }

    /// Open the trace pipe and copy it to `out` in the background
    ///
    /// Failing to open the pipe is fatal and reported here, not from the task.
    /// The pipe fd is released as soon as the returned handle is closed.
    #[cfg(target_os = "linux")]
    pub fn spawn_tail<W>(&self, out: W) -> Result<TailHandle>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pipe = PipeReader::open(&self.pipe).map_err(|source| HooktailError::TraceLog {
            path: self.pipe.clone(),
            source,
        })?;
        Ok(TailHandle::spawn(pipe, out))
    }
}

#[cfg(target_os = "linux")]
pub use pipe::PipeReader;

#[cfg(target_os = "linux")]
mod pipe {
    use std::io::{self, Read};
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::Path;
    use std::pin::Pin;
    use std::task::{ready, Context, Poll};
    use tokio::io::unix::AsyncFd;
    use tokio::io::{AsyncRead, ReadBuf};

    /// Non-blocking pipe reader driven by epoll readiness
    ///
    /// Reads never occupy a blocking-pool thread, so dropping the reader
    /// closes the fd immediately even when no data is pending.
    pub struct PipeReader {
        fd: AsyncFd<std::fs::File>,
    }

    impl PipeReader {
        pub fn open(path: &Path) -> io::Result<Self> {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
                .open(path)?;
            Ok(Self {
                fd: AsyncFd::new(file)?,
            })
        }
    }

    impl AsyncRead for PipeReader {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            loop {
                let mut guard = ready!(self.fd.poll_read_ready(cx))?;
                let unfilled = buf.initialize_unfilled();
                match guard.try_io(|fd| fd.get_ref().read(unfilled)) {
                    Ok(Ok(n)) => {
                        buf.advance(n);
                        return Poll::Ready(Ok(()));
                    }
                    Ok(Err(e)) => return Poll::Ready(Err(e)),
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

impl Default for TraceLog {
    fn default() -> Self {
        Self::new(TRACE_PATH, TRACE_PIPE_PATH)
    }
}

/// Running copy task; closing it ends the copy
pub struct TailHandle {
    closed: CancellationToken,
    task: JoinHandle<io::Result<u64>>,
}

impl TailHandle {
    pub fn spawn<R, W>(reader: R, out: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let closed = CancellationToken::new();
        let task = tokio::spawn(copy_until_closed(reader, out, closed.clone()));
        Self { closed, task }
    }

    /// Stop the copy and return the number of bytes copied
    ///
    /// Read errors caused by the close are swallowed; errors hit while the
    /// stream was still open are returned.
    pub async fn close(mut self) -> Result<u64> {
        self.closed.cancel();
        let copied = (&mut self.task).await.map_err(io::Error::other)??;
        debug!("Trace tail closed after {} bytes", copied);
        Ok(copied)
    }
}

impl Drop for TailHandle {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn copy_until_closed<R, W>(
    mut reader: R,
    mut out: W,
    closed: CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 8 * 1024];
    let mut copied = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if closed.is_cancelled() => {
                    debug!("Ignoring read error after close: {}", e);
                    break;
                }
                Err(e) => {
                    warn!("Trace pipe read failed: {}", e);
                    return Err(e);
                }
            },
        };

        out.write_all(&buf[..n]).await?;
        out.flush().await?;
        copied += n as u64;
    }

    Ok(copied)
}
