//! Line-oriented forwarding of captured worker output to a remote sink.
//!
//! One forwarder exists per captured stream (stdout, stderr). The write end
//! is a cloneable [`StreamWriter`] handed to the worker pool, which pumps
//! every worker's pipe into it; the forwarding task buffers the bytes and
//! pushes each completed line, prefixed with the stream's tag, to a
//! [`LogSink`]. A trailing unterminated fragment is flushed when the last
//! write end is dropped, then the sink is closed and the task exits.
//!
//! ```text
//!   worker 0 stdout ──┐
//!   worker 1 stdout ──┼──▶ StreamWriter (mpsc) ──▶ forward task ──▶ LogSink
//!   worker 2 stdout ──┘
//! ```

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Push-style destination for forwarded output chunks.
///
/// Implementations deliver each chunk as-is; delivery assurance beyond the
/// transport itself is not this layer's concern.
#[async_trait]
pub trait LogSink: Send {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Remote sink: one TCP connection pushing opaque text chunks. The
/// connection lives until the owning forwarder drains and exits.
pub struct TcpSink {
    stream: TcpStream,
}

impl TcpSink {
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl LogSink for TcpSink {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.stream.write_all(chunk).await?;
        self.stream.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

/// Local passthrough used when no remote sink address is configured.
pub struct ConsoleSink {
    to_stderr: bool,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self { to_stderr: false }
    }

    pub fn stderr() -> Self {
        Self { to_stderr: true }
    }
}

#[async_trait]
impl LogSink for ConsoleSink {
    async fn send(&mut self, chunk: &[u8]) -> io::Result<()> {
        if self.to_stderr {
            let mut out = tokio::io::stderr();
            out.write_all(chunk).await?;
            out.flush().await
        } else {
            let mut out = tokio::io::stdout();
            out.write_all(chunk).await?;
            out.flush().await
        }
    }
}

/// Cloneable write end of a captured stream.
///
/// Writing never blocks; once the forwarder is gone, writes are silently
/// discarded, same as writing to a closed pipe.
#[derive(Clone, Debug)]
pub struct StreamWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl StreamWriter {
    pub fn write(&self, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        if !bytes.is_empty() {
            let _ = self.tx.send(bytes);
        }
    }
}

/// Handle joining a running forwarding task.
pub struct StreamForwarder {
    handle: JoinHandle<()>,
}

impl StreamForwarder {
    /// Start a forwarder for one stream. Returns the write end to expose to
    /// the task-execution environment and the handle to join at shutdown.
    pub fn start(tag: impl Into<String>, sink: Box<dyn LogSink>) -> (StreamWriter, StreamForwarder) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(forward_loop(tag.into(), rx, sink));
        (StreamWriter { tx }, StreamForwarder { handle })
    }

    /// Wait for the forwarding task to drain and exit. Returns once every
    /// write end has been dropped and the trailing fragment is flushed.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

async fn forward_loop(
    tag: String,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut sink: Box<dyn LogSink>,
) {
    let mut line: Vec<u8> = Vec::new();
    while let Some(chunk) = rx.recv().await {
        for byte in chunk {
            line.push(byte);
            if byte == b'\n' {
                if let Err(e) = deliver(&tag, &mut line, sink.as_mut()).await {
                    // sink gone; stop forwarding, no task impact
                    tracing::debug!(tag = %tag, error = %e, "log sink rejected chunk, forwarder exiting");
                    let _ = sink.close().await;
                    return;
                }
            }
        }
    }
    if !line.is_empty() {
        let _ = deliver(&tag, &mut line, sink.as_mut()).await;
    }
    let _ = sink.close().await;
}

async fn deliver(tag: &str, line: &mut Vec<u8>, sink: &mut dyn LogSink) -> io::Result<()> {
    let mut chunk = Vec::with_capacity(tag.len() + line.len());
    chunk.extend_from_slice(tag.as_bytes());
    chunk.append(line);
    sink.send(&chunk).await
}

/// Copy a worker's piped output into a stream write end until EOF.
pub fn pump<R>(mut reader: R, writer: StreamWriter) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => writer.write(&buf[..n]),
                Err(e) => {
                    tracing::debug!(error = %e, "output pipe read failed");
                    break;
                }
            }
        }
    })
}
