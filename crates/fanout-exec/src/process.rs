//! Running processes as streams of output events
//!
//! Every transport hands back a [`Process`]; the driver consumes its events
//! chunk by chunk so output is never line-buffered and the sudo protocol can
//! react to prompts as they arrive.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ExecError;

const READ_CHUNK: usize = 8192;

/// How long output already in the pipes is collected after the process exits
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// One observation from a running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of stdout
    Stdout(Vec<u8>),
    /// A chunk of stderr
    Stderr(Vec<u8>),
    /// The process exit status
    Exit(i32),
}

/// A command started on a target
#[async_trait]
pub trait Process: Send {
    /// Next output chunk or exit status; `None` once the process is finished
    /// and all output has been delivered
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, ExecError>;

    /// Write bytes to the process stdin
    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError>;

    /// Close the process stdin
    async fn close_stdin(&mut self) -> Result<(), ExecError>;

    /// Stop the process; best effort
    async fn abort(&mut self);
}

/// A local child process, used by the local and container transports
///
/// The exit status is reported once the child exits, not when its pipes
/// close: a background process started by the command may hold them open.
pub struct LocalProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    events: mpsc::Receiver<ProcessEvent>,
    exited: Option<(i32, Instant)>,
    finished: bool,
}

impl LocalProcess {
    /// Spawn `program` with `args` and extra environment variables
    ///
    /// # Errors
    /// Returns `ExecError::Exec` if the process cannot be started
    pub fn spawn(
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Self, ExecError> {
        debug!(program = %program, args = ?args, "spawning local process");

        let mut child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Exec(format!("failed to spawn {program}: {e}")))?;

        let (tx, rx) = mpsc::channel(32);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone(), ProcessEvent::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx, ProcessEvent::Stderr));
        }

        Ok(Self {
            stdin: child.stdin.take(),
            child,
            events: rx,
            exited: None,
            finished: false,
        })
    }

    fn finish(&mut self, code: i32) -> ProcessEvent {
        debug!(code, "process exited");
        self.finished = true;
        self.stdin = None;
        ProcessEvent::Exit(code)
    }
}

async fn pump<R>(mut reader: R, tx: mpsc::Sender<ProcessEvent>, wrap: fn(Vec<u8>) -> ProcessEvent)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Process for LocalProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, ExecError> {
        if self.finished {
            return Ok(None);
        }

        let (code, deadline) = match self.exited {
            Some(exited) => exited,
            None => {
                let status = tokio::select! {
                    biased;
                    event = self.events.recv() => match event {
                        Some(event) => return Ok(Some(event)),
                        // both pipes are drained
                        None => None,
                    },
                    status = self.child.wait() => Some(status),
                };
                let status = match status {
                    Some(status) => status,
                    None => self.child.wait().await,
                };
                let code = status
                    .map_err(|e| ExecError::Exec(e.to_string()))?
                    .code()
                    .unwrap_or(-1);
                let exited = (code, Instant::now() + DRAIN_GRACE);
                self.exited = Some(exited);
                exited
            }
        };

        // only output already written before exit is collected
        match tokio::time::timeout_at(deadline, self.events.recv()).await {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) | Err(_) => Ok(Some(self.finish(code))),
        }
    }

    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        match stdin.write_all(data).await {
            Ok(()) => stdin.flush().await.or_else(ignore_broken_pipe),
            Err(e) => ignore_broken_pipe(e),
        }
    }

    async fn close_stdin(&mut self) -> Result<(), ExecError> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await.or_else(ignore_broken_pipe)?;
        }
        Ok(())
    }

    async fn abort(&mut self) {
        self.stdin = None;
        let _ = self.child.start_kill();
    }
}

// A process that exits without reading its input is not a failure.
fn ignore_broken_pipe(err: std::io::Error) -> Result<(), ExecError> {
    if err.kind() == std::io::ErrorKind::BrokenPipe {
        Ok(())
    } else {
        Err(ExecError::Exec(format!("failed to write stdin: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut process: LocalProcess) -> (Vec<u8>, Vec<u8>, Option<i32>) {
        let (mut out, mut err, mut code) = (Vec::new(), Vec::new(), None);
        while let Some(event) = process.next_event().await.unwrap() {
            match event {
                ProcessEvent::Stdout(b) => out.extend(b),
                ProcessEvent::Stderr(b) => err.extend(b),
                ProcessEvent::Exit(c) => code = Some(c),
            }
        }
        (out, err, code)
    }

    #[tokio::test]
    async fn test_streams_and_exit() {
        let args = vec!["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()];
        let process = LocalProcess::spawn("sh", &args, &BTreeMap::new()).unwrap();
        let (out, err, code) = collect(process).await;

        assert_eq!(out, b"out\n");
        assert_eq!(err, b"err\n");
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn test_stdin_and_env() {
        let args = vec!["-c".to_string(), "cat; echo \"$GREETING\"".to_string()];
        let env = BTreeMap::from([("GREETING".to_string(), "hi".to_string())]);
        let mut process = LocalProcess::spawn("sh", &args, &env).unwrap();
        process.write_stdin(b"piped\n").await.unwrap();
        process.close_stdin().await.unwrap();
        let (out, _, code) = collect(process).await;

        assert_eq!(out, b"piped\nhi\n");
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_exit() {
        let args = vec!["-c".to_string(), "sleep 5 & echo started".to_string()];
        let process = LocalProcess::spawn("sh", &args, &BTreeMap::new()).unwrap();
        let started = std::time::Instant::now();
        let (out, _, code) = collect(process).await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(out, b"started\n");
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let result = LocalProcess::spawn("/nonexistent/fanout-binary", &[], &BTreeMap::new());
        assert!(matches!(result, Err(ExecError::Exec(_))));
    }
}
