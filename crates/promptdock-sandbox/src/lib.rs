//! Sandboxed interpreter host for generated programs.
//!
//! The orchestrator never talks to an interpreter directly; it goes through
//! [`Evaluator`], which runs one program under a cancellation token and writes
//! everything the program prints into a shared [`LogBuffer`]. A fresh
//! evaluator/buffer pair is produced per runtime by an [`EvaluatorFactory`];
//! pairs are never shared between runtimes.

pub mod testing;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio_util::sync::CancellationToken;

/// Default cap for a runtime's captured output. Oldest bytes are dropped
/// once the cap is reached; the scanner drains the buffer frequently enough
/// that this only matters for pathologically chatty programs.
pub const DEFAULT_LOG_CAP_BYTES: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The evaluation's cancellation token fired. Not a failure.
    #[error("context canceled")]
    Cancelled,
    #[error("runtime panicked: {0}")]
    Panicked(String),
    #[error("evaluation failed: {0}")]
    Eval(String),
    #[error("failed to start interpreter: {0}")]
    Spawn(String),
    #[error("sandbox I/O error: {0}")]
    Io(String),
}

/// Bounded append-and-drain capture of a child program's stdout/stderr.
///
/// Clones share the same underlying buffer; the interpreter appends and the
/// log scanner drains.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<String>>,
    cap: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAP_BYTES)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(String::new())),
            cap,
        }
    }

    pub fn append(&self, text: &str) {
        let mut buf = self.inner.lock();
        buf.push_str(text);
        if buf.len() > self.cap {
            let mut cut = buf.len() - self.cap;
            while cut < buf.len() && !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }

    /// Current contents without consuming them.
    pub fn snapshot(&self) -> String {
        self.inner.lock().clone()
    }

    /// Take the contents, leaving the buffer empty.
    pub fn drain(&self) -> String {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// One sandboxed evaluation of a generated program.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Run `source` until the program returns, fails, or `cancel` fires.
    ///
    /// Cancellation yields [`SandboxError::Cancelled`] and must release the
    /// program's port binding.
    async fn evaluate(&self, cancel: CancellationToken, source: &str) -> Result<(), SandboxError>;

    /// Ask the running program to call the named exported function (the
    /// generated-program contract requires `Shutdown`). Safe to call any time
    /// after evaluation begins; a no-op once the evaluation is gone.
    async fn invoke(&self, symbol: &str) -> Result<(), SandboxError>;
}

/// Produces a fresh evaluator and its private log buffer.
pub trait EvaluatorFactory: Send + Sync {
    fn create(&self) -> (Arc<dyn Evaluator>, LogBuffer);
}

/// Evaluator backed by an external interpreter process.
///
/// The program text is written to a scratch file and handed to the configured
/// interpreter command; the child's stdout and stderr stream into the
/// [`LogBuffer`]. `invoke` writes `<symbol>()` to the child's stdin, which the
/// interpreter is expected to treat as a control channel. Cancellation kills
/// the child, which releases any port it bound.
pub struct ProcessEvaluator {
    command: Vec<String>,
    buffer: LogBuffer,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    scratch_dir: PathBuf,
}

impl ProcessEvaluator {
    pub fn new(command: Vec<String>, buffer: LogBuffer) -> Self {
        Self {
            command,
            buffer,
            stdin: Arc::new(tokio::sync::Mutex::new(None)),
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    async fn spawn_child(&self, source: &str) -> Result<(Child, PathBuf), SandboxError> {
        let program = self
            .command
            .first()
            .ok_or_else(|| SandboxError::Spawn("empty interpreter command".into()))?;

        let source_path = self.scratch_dir.join(format!(
            "promptdock-{}-{}.go",
            std::process::id(),
            next_scratch_nonce()
        ));
        tokio::fs::write(&source_path, source)
            .await
            .map_err(|e| SandboxError::Io(e.to_string()))?;

        let mut command = tokio::process::Command::new(program);
        command.args(&self.command[1..]);
        command.arg(&source_path);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);
        match command.spawn() {
            Ok(child) => Ok((child, source_path)),
            Err(e) => {
                let _ = tokio::fs::remove_file(&source_path).await;
                Err(SandboxError::Spawn(e.to_string()))
            }
        }
    }
}

// Monotonic per-process nonce for scratch file names.
fn next_scratch_nonce() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NONCE: AtomicU64 = AtomicU64::new(0);
    NONCE.fetch_add(1, Ordering::Relaxed)
}

#[async_trait]
impl Evaluator for ProcessEvaluator {
    async fn evaluate(&self, cancel: CancellationToken, source: &str) -> Result<(), SandboxError> {
        let (mut child, source_path) = self.spawn_child(source).await?;

        *self.stdin.lock().await = child.stdin.take();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Io("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Io("child stderr unavailable".into()))?;

        let out_task = tokio::spawn(pump_lines(stdout, self.buffer.clone()));
        let err_task = tokio::spawn(pump_lines(stderr, self.buffer.clone()));

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let result = match waited {
            None => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                out_task.abort();
                err_task.abort();
                Err(SandboxError::Cancelled)
            }
            Some(status) => {
                let _ = out_task.await;
                let _ = err_task.await;
                match status {
                    Err(e) => Err(SandboxError::Io(e.to_string())),
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(SandboxError::Eval(format!(
                        "interpreter exited with {status}"
                    ))),
                }
            }
        };

        self.stdin.lock().await.take();
        let _ = tokio::fs::remove_file(&source_path).await;
        result
    }

    async fn invoke(&self, symbol: &str) -> Result<(), SandboxError> {
        let mut guard = self.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            let line = format!("{symbol}()\n");
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                tracing::debug!("invoke({symbol}) write failed, child likely gone: {e}");
                guard.take();
            } else {
                let _ = stdin.flush().await;
            }
        }
        Ok(())
    }
}

async fn pump_lines<R>(reader: R, buffer: LogBuffer)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        buffer.append(&format!("{line}\n"));
    }
}

/// Factory for [`ProcessEvaluator`] pairs sharing one interpreter command.
pub struct ProcessEvaluatorFactory {
    command: Vec<String>,
}

impl ProcessEvaluatorFactory {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl EvaluatorFactory for ProcessEvaluatorFactory {
    fn create(&self) -> (Arc<dyn Evaluator>, LogBuffer) {
        let buffer = LogBuffer::new();
        let evaluator = ProcessEvaluator::new(self.command.clone(), buffer.clone());
        (Arc::new(evaluator), buffer)
    }
}
