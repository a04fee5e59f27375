//! Drives a [`Process`] to completion and captures its output

use std::time::Instant;

use tracing::{debug, warn};

use crate::error::ExecError;
use crate::process::{Process, ProcessEvent};
use crate::result::CommandOutput;
use crate::sudo::{Stream, SudoEscalation};

/// Feed stdin, collect both streams and the exit status
///
/// Without escalation `stdin` is written up front and then closed. With
/// escalation the state machine decides when stdin is written, so `stdin`
/// must be handed to it instead.
///
/// # Errors
/// Returns the escalation error if sudo refuses, or `ExecError::Exec` if the
/// process ends without reporting an exit status
pub async fn drive(
    mut process: Box<dyn Process>,
    stdin: Option<&[u8]>,
    mut escalation: Option<&mut SudoEscalation>,
) -> Result<CommandOutput, ExecError> {
    let start = Instant::now();

    if escalation.is_none() {
        if let Some(data) = stdin {
            process.write_stdin(data).await?;
        }
        process.close_stdin().await?;
    } else if stdin.is_some() {
        warn!("stdin passed to an escalated command is ignored; hand it to the escalation");
    }

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;

    while let Some(event) = process.next_event().await? {
        let (stream, chunk) = match event {
            ProcessEvent::Stdout(chunk) => (Stream::Stdout, chunk),
            ProcessEvent::Stderr(chunk) => (Stream::Stderr, chunk),
            ProcessEvent::Exit(code) => {
                exit_code = Some(code);
                continue;
            }
        };

        let data = match escalation.as_deref_mut() {
            Some(sudo) => match sudo.on_chunk(stream, &chunk) {
                Ok(outcome) => {
                    if !outcome.write.is_empty() {
                        process.write_stdin(&outcome.write).await?;
                    }
                    if outcome.close_stdin {
                        process.close_stdin().await?;
                    }
                    outcome.output
                }
                Err(err) => {
                    process.abort().await;
                    return Err(err);
                }
            },
            None => chunk,
        };

        match stream {
            Stream::Stdout => stdout.extend_from_slice(&data),
            Stream::Stderr => stderr.extend_from_slice(&data),
        }
    }

    if let Some(sudo) = escalation {
        stdout.extend(sudo.finish(Stream::Stdout));
        stderr.extend(sudo.finish(Stream::Stderr));
    }

    let duration = start.elapsed();
    let exit_code = exit_code
        .ok_or_else(|| ExecError::Exec("command ended without reporting an exit status".to_string()))?;

    debug!(
        exit_code = exit_code,
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        duration = ?duration,
        "command completed"
    );

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::sudo::SUDO_PROMPT;

    /// Replays a scripted event stream and records stdin traffic
    struct ScriptedProcess {
        events: VecDeque<ProcessEvent>,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl ScriptedProcess {
        fn new(events: Vec<ProcessEvent>) -> (Self, Arc<Mutex<Vec<Vec<u8>>>>, Arc<Mutex<bool>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(Mutex::new(false));
            (
                Self {
                    events: events.into(),
                    written: Arc::clone(&written),
                    closed: Arc::clone(&closed),
                },
                written,
                closed,
            )
        }
    }

    #[async_trait]
    impl Process for ScriptedProcess {
        async fn next_event(&mut self) -> Result<Option<ProcessEvent>, ExecError> {
            Ok(self.events.pop_front())
        }

        async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError> {
            self.written.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn close_stdin(&mut self) -> Result<(), ExecError> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }

        async fn abort(&mut self) {}
    }

    #[tokio::test]
    async fn test_plain_run_writes_stdin_first() {
        let (process, written, closed) = ScriptedProcess::new(vec![
            ProcessEvent::Stdout(b"hel".to_vec()),
            ProcessEvent::Stdout(b"lo\n".to_vec()),
            ProcessEvent::Exit(0),
        ]);
        let output = drive(Box::new(process), Some(b"input"), None).await.unwrap();

        assert_eq!(output.stdout, b"hello\n");
        assert!(output.success());
        assert_eq!(*written.lock().unwrap(), vec![b"input".to_vec()]);
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_password_written_once() {
        let (process, written, _) = ScriptedProcess::new(vec![
            ProcessEvent::Stderr(SUDO_PROMPT.as_bytes().to_vec()),
            ProcessEvent::Stdout(b"root\n".to_vec()),
            ProcessEvent::Exit(0),
        ]);
        let mut sudo = SudoEscalation::new("id", "deploy", "web1", Some("pw".to_string()));
        let output = drive(Box::new(process), None, Some(&mut sudo)).await.unwrap();

        assert_eq!(output.stdout, b"root\n");
        assert!(output.stderr.is_empty());
        assert_eq!(*written.lock().unwrap(), vec![b"pw\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_sudoers_denial_writes_nothing() {
        let (process, written, _) = ScriptedProcess::new(vec![
            ProcessEvent::Stderr(b"deploy is not in the sudoers file.\n".to_vec()),
            ProcessEvent::Exit(1),
        ]);
        let mut sudo = SudoEscalation::new("id", "deploy", "web1", Some("pw".to_string()));
        let err = drive(Box::new(process), None, Some(&mut sudo)).await.unwrap_err();

        assert_eq!(err.issue_code(), "SUDO_DENIED");
        assert!(written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_exit_status() {
        let (process, _, _) = ScriptedProcess::new(vec![ProcessEvent::Stdout(b"x".to_vec())]);
        let err = drive(Box::new(process), None, None).await.unwrap_err();
        assert!(matches!(err, ExecError::Exec(_)));
    }

    #[tokio::test]
    async fn test_no_output() {
        let (process, _, _) = ScriptedProcess::new(vec![ProcessEvent::Exit(0)]);
        let output = drive(Box::new(process), None, None).await.unwrap();
        assert!(output.stdout.is_empty());
        assert!(output.stderr.is_empty());
    }
}
