//! Local process transport

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{copy_tree, remote_basename};
use crate::connection::{Connection, ConnectionState};
use crate::error::{ExecError, FileCode};
use crate::process::{LocalProcess, Process};
use crate::target::Target;

/// Runs commands on this machine with `sh -c`
#[derive(Debug)]
pub struct LocalConnection {
    target: Target,
    user: String,
    state: ConnectionState,
}

impl LocalConnection {
    /// Create a connection for `target`
    #[must_use]
    pub fn new(target: Target) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_default();
        Self {
            target,
            user,
            state: ConnectionState::Unconnected,
        }
    }

    fn ensure_connected(&self) -> Result<(), ExecError> {
        if self.state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ExecError::NotConnected)
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn reset_cwd(&self) -> bool {
        true
    }

    fn transport_name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self), fields(target_name = %self.target.name))]
    async fn connect(&mut self) -> Result<(), ExecError> {
        if self.user.is_empty() {
            let output = Command::new("id")
                .arg("-un")
                .output()
                .await
                .map_err(|e| ExecError::connect(format!("could not determine local user: {e}")))?;
            self.user = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        self.state = ConnectionState::Connected;
        debug!(user = %self.user, "local session ready");
        Ok(())
    }

    async fn spawn(&mut self, command: &str, tty: bool) -> Result<Box<dyn Process>, ExecError> {
        self.ensure_connected()?;
        if tty {
            debug!("tty is not supported by the local transport; ignoring");
        }
        let args = vec!["-c".to_string(), command.to_string()];
        Ok(Box::new(LocalProcess::spawn("sh", &args, &BTreeMap::new())?))
    }

    async fn upload(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        self.ensure_connected()?;
        debug!(source = %source.display(), destination = %destination, "uploading");

        let src = source.to_path_buf();
        let dst = PathBuf::from(destination);
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(|e| ExecError::Exec(e.to_string()))?
            .map_err(|e| {
                ExecError::file(
                    FileCode::Copy,
                    format!("Could not copy file to {destination}: {e}"),
                )
            })
    }

    async fn download(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
        self.ensure_connected()?;
        debug!(source = %source, destination = %destination.display(), "downloading");

        let src = PathBuf::from(source);
        let dst = destination.join(remote_basename(source));
        let dst_dir = destination.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dst_dir)?;
            copy_tree(&src, &dst)
        })
        .await
        .map_err(|e| ExecError::Exec(e.to_string()))?
        .map_err(|e| {
            ExecError::file(
                FileCode::Download,
                format!("Could not download '{source}': {e}"),
            )
        })
    }

    async fn disconnect(&mut self) -> Result<(), ExecError> {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TransportKind;

    async fn connected() -> LocalConnection {
        let mut conn = LocalConnection::new(Target::new("localhost", TransportKind::Local));
        conn.connect().await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_execute_success() {
        let mut conn = connected().await;
        let output = conn.execute("echo hello", None).await.unwrap();

        assert!(output.success());
        assert_eq!(output.stdout, b"hello\n");
    }

    #[tokio::test]
    async fn test_execute_failure_is_not_an_error() {
        let mut conn = connected().await;
        let output = conn.execute("echo error >&2; exit 42", None).await.unwrap();

        assert_eq!(output.exit_code, 42);
        assert_eq!(output.stderr_str().trim(), "error");
    }

    #[tokio::test]
    async fn test_large_output_is_streamed() {
        let mut conn = connected().await;
        let output = conn
            .execute("head -c 1000000 /dev/zero", None)
            .await
            .unwrap();
        assert_eq!(output.stdout.len(), 1_000_000);
    }

    #[tokio::test]
    async fn test_stdin() {
        let mut conn = connected().await;
        let output = conn.execute("cat", Some(b"from stdin")).await.unwrap();
        assert_eq!(output.stdout, b"from stdin");
    }

    #[tokio::test]
    async fn test_spawn_requires_connect() {
        let mut conn = LocalConnection::new(Target::new("localhost", TransportKind::Local));
        assert!(matches!(
            conn.spawn("true", false).await,
            Err(ExecError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_upload_and_download_directory() {
        let root = std::env::temp_dir().join(format!("fanout-local-{}", uuid::Uuid::new_v4()));
        let src = root.join("site");
        std::fs::create_dir_all(src.join("css")).unwrap();
        std::fs::write(src.join("css/main.css"), b"body{}").unwrap();

        let mut conn = connected().await;
        let remote = root.join("remote");
        conn.upload(&src, remote.to_str().unwrap()).await.unwrap();
        assert_eq!(std::fs::read(remote.join("css/main.css")).unwrap(), b"body{}");

        let local = root.join("downloads");
        conn.download(remote.to_str().unwrap(), &local).await.unwrap();
        assert_eq!(
            std::fs::read(local.join("remote/css/main.css")).unwrap(),
            b"body{}"
        );

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut conn = connected().await;
        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
