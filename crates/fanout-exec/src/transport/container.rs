//! Docker and Podman transports, driven through their CLIs

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{cli_error, remote_basename, run_cli};
use crate::connection::{Connection, ConnectionState};
use crate::error::{ExecError, FileCode};
use crate::process::{LocalProcess, Process};
use crate::shell::posix;
use crate::target::{Target, TransportKind};

/// Container engine CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    /// Runtime serving `transport`, if it is a container transport
    #[must_use]
    pub fn for_transport(transport: TransportKind) -> Option<Self> {
        match transport {
            TransportKind::Docker => Some(Self::Docker),
            TransportKind::Podman => Some(Self::Podman),
            _ => None,
        }
    }

    /// CLI binary name
    #[must_use]
    pub fn program(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }

    /// Variable selecting the engine endpoint
    #[must_use]
    pub fn host_variable(self) -> &'static str {
        match self {
            Self::Docker => "DOCKER_HOST",
            Self::Podman => "CONTAINER_HOST",
        }
    }
}

/// A running container reached with `<runtime> exec`
#[derive(Debug)]
pub struct ContainerConnection {
    target: Target,
    runtime: ContainerRuntime,
    env: BTreeMap<String, String>,
    container_id: Option<String>,
    user: String,
    state: ConnectionState,
}

impl ContainerConnection {
    /// Create a connection for `target` using `runtime`
    #[must_use]
    pub fn new(target: Target, runtime: ContainerRuntime) -> Self {
        let mut env = BTreeMap::new();
        if let Some(url) = &target.options.service_url {
            env.insert(runtime.host_variable().to_string(), url.clone());
        }
        Self {
            target,
            runtime,
            env,
            container_id: None,
            user: "root".to_string(),
            state: ConnectionState::Unconnected,
        }
    }

    fn container_id(&self) -> Result<&str, ExecError> {
        match (&self.state, &self.container_id) {
            (ConnectionState::Connected, Some(id)) => Ok(id),
            _ => Err(ExecError::NotConnected),
        }
    }

    async fn cli(&self, args: Vec<String>) -> Result<std::process::Output, ExecError> {
        run_cli(self.runtime.program(), &args, &self.env, None).await
    }

    /// `exec` argv running `command` in the container
    fn exec_args(&self, id: &str, command: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "-i".to_string(), id.to_string()];
        match &self.target.options.shell_command {
            Some(shell) => args.extend(shell.split_whitespace().map(str::to_string)),
            None => args.extend(["sh".to_string(), "-c".to_string()]),
        }
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl Connection for ContainerConnection {
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
        self.runtime.program()
    }

    #[instrument(skip(self), fields(target_name = %self.target.name))]
    async fn connect(&mut self) -> Result<(), ExecError> {
        self.state = ConnectionState::Connecting;
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}|{{.Config.User}}".to_string(),
            self.target.host().to_string(),
        ];
        let limit = self.target.options.connect_timeout();
        let output = match run_cli(self.runtime.program(), &args, &self.env, Some(limit)).await {
            Ok(output) => output,
            Err(e) => {
                self.state = ConnectionState::Unconnected;
                return Err(ExecError::connect(format!(
                    "Failed to connect to {}: {e}",
                    self.target.name
                )));
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some((id, user)) = stdout.trim().split_once('|').filter(|_| output.status.success()) else {
            self.state = ConnectionState::Unconnected;
            return Err(ExecError::connect(format!(
                "Failed to connect to {}: Could not find a container with name or ID matching '{}'",
                self.target.name,
                self.target.host()
            )));
        };

        self.container_id = Some(id.to_string());
        if !user.is_empty() {
            self.user = user.split(':').next().unwrap_or(user).to_string();
        }
        self.state = ConnectionState::Connected;
        info!(container = %id, "opened {} session", self.runtime.program());
        Ok(())
    }

    async fn spawn(&mut self, command: &str, tty: bool) -> Result<Box<dyn Process>, ExecError> {
        let id = self.container_id()?;
        if tty {
            debug!("tty is not supported by container transports; ignoring");
        }
        let args = self.exec_args(id, command);
        Ok(Box::new(LocalProcess::spawn(
            self.runtime.program(),
            &args,
            &self.env,
        )?))
    }

    async fn upload(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        let id = self.container_id()?.to_string();
        debug!(source = %source.display(), destination = %destination, "uploading");

        let write_error = |detail: String| {
            ExecError::file(
                FileCode::Write,
                format!("Could not write file to {destination}: {detail}"),
            )
        };

        let local = if source.is_dir() {
            let mkdir = format!("mkdir -p {}", posix::quote(destination));
            let output = self.cli(self.exec_args(&id, &mkdir)).await?;
            if !output.status.success() {
                return Err(write_error(cli_error(&output)));
            }
            // `src/.` copies the directory's contents
            format!("{}/.", source.display())
        } else {
            source.display().to_string()
        };

        let output = self
            .cli(vec!["cp".to_string(), local, format!("{id}:{destination}")])
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(write_error(cli_error(&output)))
        }
    }

    async fn download(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
        let id = self.container_id()?.to_string();
        debug!(source = %source, destination = %destination.display(), "downloading");

        let download_error = |detail: String| {
            ExecError::file(
                FileCode::Download,
                format!("Could not download '{source}': {detail}"),
            )
        };

        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| download_error(e.to_string()))?;
        let local = destination.join(remote_basename(source));
        let output = self
            .cli(vec![
                "cp".to_string(),
                format!("{id}:{source}"),
                local.display().to_string(),
            ])
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(download_error(cli_error(&output)))
        }
    }

    async fn disconnect(&mut self) -> Result<(), ExecError> {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
            debug!(target_name = %self.target.name, "closed {} session", self.runtime.program());
        }
        Ok(())
    }
}
