use std::future::Future;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::ProcessFailure;

/// How long to keep draining pipes after the child is gone before taking
/// whatever has been read so far.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured result of a process that exited with status zero
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Executes one external command with a bounded lifetime.
///
/// `argv[0]` names the binary; the rest are passed as literal arguments.
/// Implementations make exactly one attempt per call.
pub trait ProcessRunner: Send + Sync {
    fn run(
        &self,
        argv: &[String],
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> impl Future<Output = Result<ProcessOutput, ProcessFailure>> + Send;
}

/// Raises cancellation for every `CancelSignal` cloned from its pair
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Caller-supplied cancellation signal observed by the process runner
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

/// Create a connected cancellation handle and signal
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
}

impl CancelSignal {
    /// A signal that is never raised
    pub fn never() -> Self {
        CancelSignal { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once cancellation is raised; pends forever otherwise
    pub async fn cancelled(&mut self) {
        match self.rx.as_mut() {
            Some(rx) => {
                let closed = rx.wait_for(|c| *c).await.is_err();
                if closed {
                    // handle dropped without cancelling
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::never()
    }
}

/// Real runner backed by `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioRunner;

impl TokioRunner {
    pub fn new() -> Self {
        TokioRunner
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessRunner for TokioRunner {
    async fn run(
        &self,
        argv: &[String],
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<ProcessOutput, ProcessFailure> {
        let (program, args) = argv.split_first().ok_or(ProcessFailure::EmptyCommand)?;

        if cancel.is_cancelled() {
            return Err(ProcessFailure::Cancelled { stderr: String::new() });
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessFailure::Spawn {
            program: program.clone(),
            source,
        })?;

        // Drain both pipes concurrently so a chatty child never blocks on a full pipe
        let stdout_capture = child.stdout.take().map(drain);
        let stderr_capture = child.stderr.take().map(drain);

        let mut cancel = cancel.clone();
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Exited(status) => {
                let status = status?;
                let (stdout, stderr) = tokio::join!(collect(stdout_capture), collect(stderr_capture));
                if status.success() {
                    Ok(ProcessOutput { exit_code: status.code(), stdout, stderr })
                } else {
                    Err(ProcessFailure::NonZeroExit { code: status.code(), stderr })
                }
            }
            Outcome::TimedOut => {
                child.kill().await?;
                let (stdout, stderr) = tokio::join!(collect(stdout_capture), collect(stderr_capture));
                Err(ProcessFailure::Timeout { timeout, stdout, stderr })
            }
            Outcome::Cancelled => {
                child.kill().await?;
                if let Some(stdout) = stdout_capture {
                    stdout.task.abort();
                }
                let stderr = collect(stderr_capture).await;
                Err(ProcessFailure::Cancelled { stderr })
            }
        }
    }
}

/// Bytes read from one pipe so far, plus the task still reading it
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

fn drain<R>(mut pipe: R) -> Capture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buf);
    let task = tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    sink.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(&chunk[..n]);
                }
            }
        }
    });
    Capture { buf, task }
}

/// A descendant of a killed child can keep the pipe open indefinitely, so
/// stop waiting for EOF after the grace period and keep what was read.
async fn collect(capture: Option<Capture>) -> String {
    let Some(mut capture) = capture else {
        return String::new();
    };
    if tokio::time::timeout(DRAIN_GRACE, &mut capture.task).await.is_err() {
        capture.task.abort();
    }
    let buf = capture.buf.lock().unwrap_or_else(|e| e.into_inner());
    String::from_utf8_lossy(&buf).into_owned()
}
