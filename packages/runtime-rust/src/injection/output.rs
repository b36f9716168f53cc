//! Console output sink.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::InjectionProvider;
use crate::container::{Injected, WorkerInfo};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle to the process's console output, or any other writer.
///
/// Clones share the same writer; each `write` is atomic with respect to
/// other writes through the same sink.
#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<Writer>>,
}

impl OutputSink {
    /// Sink over the process's standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Sink over an arbitrary writer.
    pub fn new<W: AsyncWrite + Send + Unpin + 'static>(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Writes `text` as-is. Buffering is the writer's business; call `flush`
    /// when the text must be visible.
    ///
    /// # Errors
    ///
    /// Propagates the writer's I/O error.
    pub async fn write(&self, text: &str) -> io::Result<()> {
        self.writer.lock().await.write_all(text.as_bytes()).await
    }

    /// Flushes the writer.
    ///
    /// # Errors
    ///
    /// Propagates the writer's I/O error.
    pub async fn flush(&self) -> io::Result<()> {
        self.writer.lock().await.flush().await
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

/// Hands the container's output sink to every worker.
///
/// On container stop it writes a final newline and flushes, once.
pub struct OutputProvider {
    name: &'static str,
    sink: OutputSink,
}

impl OutputProvider {
    /// Provider over the process's standard output.
    #[must_use]
    pub fn stdout(name: &'static str) -> Self {
        Self::new(name, OutputSink::stdout())
    }

    /// Provider over a given sink.
    #[must_use]
    pub fn new(name: &'static str, sink: OutputSink) -> Self {
        Self { name, sink }
    }
}

#[async_trait]
impl InjectionProvider for OutputProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn acquire(&self, _worker: &WorkerInfo) -> anyhow::Result<Injected> {
        Ok(Arc::new(self.sink.clone()) as Injected)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.sink.write("\n").await?;
        self.sink.flush().await?;
        Ok(())
    }
}

/// In-memory writer whose contents can be read back, e.g. to capture what a
/// service printed.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    buffer: Arc<parking_lot::Mutex<Vec<u8>>>,
}

impl MemoryOutput {
    /// An empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded as UTF-8.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}

impl AsyncWrite for MemoryOutput {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.buffer.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::broker::MemoryBroker;

    fn worker() -> WorkerInfo {
        WorkerInfo {
            worker_id: Uuid::new_v4(),
            service: Arc::from("chat"),
            method: "login",
            broker: Arc::new(MemoryBroker::new()),
        }
    }

    #[tokio::test]
    async fn acquired_sinks_share_the_writer() {
        let captured = MemoryOutput::new();
        let provider = OutputProvider::new("stdout", OutputSink::new(captured.clone()));

        let first = provider.acquire(&worker()).await.unwrap();
        let second = provider.acquire(&worker()).await.unwrap();
        let first = first.downcast::<OutputSink>().unwrap();
        let second = second.downcast::<OutputSink>().unwrap();

        first.write("hello ").await.unwrap();
        second.write("world").await.unwrap();
        second.flush().await.unwrap();

        assert_eq!(captured.contents(), "hello world");
    }

    #[tokio::test]
    async fn stop_writes_trailing_newline() {
        let captured = MemoryOutput::new();
        let provider = OutputProvider::new("stdout", OutputSink::new(captured.clone()));

        let sink = provider.acquire(&worker()).await.unwrap();
        sink.downcast::<OutputSink>().unwrap().write(">>> ").await.unwrap();
        provider.stop().await.unwrap();

        assert_eq!(captured.contents(), ">>> \n");
    }
}
