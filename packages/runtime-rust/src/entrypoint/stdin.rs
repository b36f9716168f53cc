//! Entrypoint driven by console input lines.

use std::io::{self, BufRead};

use async_trait::async_trait;
use ember_core::WorkerArgs;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{EntrypointContext, EntrypointProvider};
use crate::container::{ManagedTaskHandle, WorkerHandle};

type LineReader = Box<dyn AsyncBufRead + Send + Unpin>;
type BlockingReader = Box<dyn BufRead + Send>;

/// Lines read ahead of the worker loop by a blocking reader thread.
const READ_AHEAD_LINES: usize = 16;

/// Where console lines come from.
enum LineSource {
    /// An async reader. Bytes of a partially read line survive a cancelled
    /// read in `pending`.
    Async {
        reader: LineReader,
        pending: Vec<u8>,
    },
    /// A blocking reader, moved onto its own thread when the entrypoint starts.
    Blocking(BlockingReader),
    /// Lines arriving from the reader thread.
    Thread(mpsc::Receiver<io::Result<Vec<u8>>>),
}

impl LineSource {
    /// Moves a blocking reader onto a plain OS thread, outside the runtime's
    /// blocking pool, so a pending read never holds up runtime shutdown.
    fn into_async(self, name: &str) -> io::Result<Self> {
        let Self::Blocking(mut reader) = self else {
            return Ok(self);
        };
        let (tx, rx) = mpsc::channel(READ_AHEAD_LINES);
        std::thread::Builder::new()
            .name(format!("{name}-reader"))
            .spawn(move || loop {
                let mut line = Vec::new();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.blocking_send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.blocking_send(Err(err));
                        break;
                    }
                }
            })?;
        Ok(Self::Thread(rx))
    }

    /// Next raw line including its terminator, `None` at end of input.
    ///
    /// Cancel-safe: dropping the future loses no input.
    async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self {
            Self::Async { reader, pending } => {
                let read = reader.read_until(b'\n', pending).await?;
                if read == 0 && pending.is_empty() {
                    return Ok(None);
                }
                Ok(Some(std::mem::take(pending)))
            }
            Self::Thread(rx) => rx.recv().await.transpose(),
            Self::Blocking(_) => Err(io::Error::other("console reader thread not started")),
        }
    }
}

/// Reads lines from a console-like source and spawns one worker per line,
/// with the line (trailing whitespace stripped) as the only argument.
///
/// Lines are dispatched in arrival order: a line's worker is spawned only
/// after the previous line's worker has finished, while the read of the
/// next line overlaps the running worker. Bytes that are not UTF-8 are
/// replaced with U+FFFD. End of input or a read error ends the loop.
pub struct StdinEntrypoint {
    source: Mutex<Option<LineSource>>,
    task: Mutex<Option<ManagedTaskHandle>>,
}

impl StdinEntrypoint {
    /// Reads from the process's standard input on a dedicated thread.
    #[must_use]
    pub fn new() -> Self {
        Self::from_blocking_reader(io::BufReader::new(io::stdin()))
    }

    /// Reads from any buffered async reader.
    pub fn from_reader<R: AsyncBufRead + Send + Unpin + 'static>(reader: R) -> Self {
        Self::with_source(LineSource::Async {
            reader: Box::new(reader),
            pending: Vec::new(),
        })
    }

    /// Reads from a blocking reader on a dedicated thread started by `start`.
    pub fn from_blocking_reader<R: BufRead + Send + 'static>(reader: R) -> Self {
        Self::with_source(LineSource::Blocking(Box::new(reader)))
    }

    fn with_source(source: LineSource) -> Self {
        Self {
            source: Mutex::new(Some(source)),
            task: Mutex::new(None),
        }
    }
}

impl Default for StdinEntrypoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntrypointProvider for StdinEntrypoint {
    fn kind(&self) -> &'static str {
        "stdin"
    }

    async fn start(&self, ctx: EntrypointContext) -> anyhow::Result<()> {
        let source = self
            .source
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdin entrypoint already started"))?;
        let mut lines = source.into_async(ctx.service_name())?;

        let name = format!("{}.{}:stdin", ctx.service_name(), ctx.method());
        let loop_ctx = ctx.clone();
        let handle = ctx.spawn_managed_background_task(name, true, move |cancel| async move {
            let mut previous: Option<WorkerHandle> = None;

            loop {
                let line = tokio::select! {
                    () = cancel.cancelled() => break,
                    line = lines.next_line() => line?,
                };
                let Some(line) = line else {
                    debug!(method = loop_ctx.method(), "console input closed");
                    break;
                };

                if let Some(worker) = previous.take() {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = worker.join() => {}
                    }
                }

                let line = String::from_utf8_lossy(&line);
                let args = WorkerArgs::positional([line.trim_end()]);
                match loop_ctx.spawn_worker(args) {
                    Ok(worker) => previous = Some(worker),
                    Err(err) if err.is_unavailable() => {
                        trace!(method = loop_ctx.method(), "container unavailable, line dropped");
                    }
                    Err(err) => warn!(error = %err, "failed to spawn worker for console line"),
                }
            }
            anyhow::Ok(())
        })?;

        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(task) = self.task.lock().as_ref() {
            task.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex as SyncMutex;
    use tokio::io::{AsyncWriteExt, BufReader};

    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::ContainerConfig;
    use crate::container::{Container, ServiceDefinition, WorkerContext};

    #[derive(Default)]
    struct Recorder {
        lines: SyncMutex<Vec<String>>,
    }

    async fn record(svc: Arc<Recorder>, ctx: WorkerContext) -> anyhow::Result<()> {
        let line = ctx.args().arg_str(0).unwrap_or_default().to_string();
        svc.lines.lock().push(line);
        Ok(())
    }

    fn container(entrypoint: StdinEntrypoint) -> Container {
        let def = ServiceDefinition::new("recorder", Recorder::default()).method(
            "record",
            entrypoint,
            &[],
            record,
        );
        Container::new(def, ContainerConfig::default(), Arc::new(MemoryBroker::new())).unwrap()
    }

    async fn wait_for_lines(container: &Container, count: usize) -> Vec<String> {
        let svc = container.service::<Recorder>().unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if svc.lines.lock().len() >= count {
                    return svc.lines.lock().clone();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("lines should be recorded")
    }

    #[tokio::test]
    async fn lines_dispatched_in_order_with_trailing_whitespace_stripped() {
        let input = std::io::Cursor::new(b"alice\nhello  \r\n  world\t\n".to_vec());
        let container = container(StdinEntrypoint::from_reader(input));
        container.start().await.unwrap();

        let lines = wait_for_lines(&container, 3).await;
        assert_eq!(lines, vec!["alice", "hello", "  world"]);

        container.stop().await;
    }

    #[tokio::test]
    async fn undecodable_line_does_not_end_the_loop() {
        let input = std::io::Cursor::new(b"caf\xe9\nalice\nhello\n".to_vec());
        let container = container(StdinEntrypoint::from_reader(input));
        container.start().await.unwrap();

        let lines = wait_for_lines(&container, 3).await;
        assert_eq!(lines, vec!["caf\u{fffd}", "alice", "hello"]);

        container.stop().await;
    }

    /// Blocking reader fed from a channel; it stays open until the sender drops.
    struct HeldOpen(std::sync::mpsc::Receiver<Vec<u8>>);

    impl std::io::Read for HeldOpen {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.0.recv() {
                Ok(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Err(_) => Ok(0),
            }
        }
    }

    #[test]
    fn runtime_shuts_down_while_console_input_stays_open() {
        let (input, rx) = std::sync::mpsc::channel();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let entrypoint =
                StdinEntrypoint::from_blocking_reader(std::io::BufReader::new(HeldOpen(rx)));
            let container = container(entrypoint);
            container.start().await.unwrap();

            input.send(b"alice\r\n".to_vec()).unwrap();
            assert_eq!(wait_for_lines(&container, 1).await, vec!["alice"]);

            tokio::time::timeout(Duration::from_secs(2), container.stop())
                .await
                .expect("stop must not hang on a blocked read");
        });

        // The reader thread is still blocked; dropping the runtime must not wait for it.
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            drop(runtime);
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("runtime shutdown must not wait for the console reader");
        drop(input);
    }

    #[tokio::test]
    async fn stop_interrupts_a_pending_read() {
        let (mut client, server) = tokio::io::duplex(64);
        let container = container(StdinEntrypoint::from_reader(BufReader::new(server)));
        container.start().await.unwrap();

        client.write_all(b"first\n").await.unwrap();
        wait_for_lines(&container, 1).await;

        // The reader now blocks on a line that never comes.
        tokio::time::timeout(Duration::from_secs(2), container.stop())
            .await
            .expect("stop must not hang on a blocked read");
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_before_start() {
        let entrypoint = StdinEntrypoint::from_reader(std::io::Cursor::new(Vec::new()));
        entrypoint.stop().await.unwrap();
        entrypoint.stop().await.unwrap();
    }
}
