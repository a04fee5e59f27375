//! LXD transport, driven through the `lxc` CLI

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::{cli_error, remote_basename, run_cli};
use crate::connection::{Connection, ConnectionState};
use crate::error::{ExecError, FileCode};
use crate::process::{LocalProcess, Process};
use crate::shell::posix;
use crate::target::Target;

#[derive(Debug, Deserialize)]
struct Instance {
    name: String,
}

/// An LXD instance reached with `lxc exec`
#[derive(Debug)]
pub struct LxdConnection {
    target: Target,
    env: BTreeMap<String, String>,
    instance: Option<String>,
    state: ConnectionState,
}

impl LxdConnection {
    /// Create a connection for `target`
    #[must_use]
    pub fn new(target: Target) -> Self {
        let mut env = BTreeMap::new();
        if let Some(url) = &target.options.service_url {
            env.insert("LXD_HOST".to_string(), url.clone());
        }
        Self {
            target,
            env,
            instance: None,
            state: ConnectionState::Unconnected,
        }
    }

    fn instance(&self) -> Result<&str, ExecError> {
        match (&self.state, &self.instance) {
            (ConnectionState::Connected, Some(name)) => Ok(name),
            _ => Err(ExecError::NotConnected),
        }
    }

    async fn lxc(&self, args: Vec<String>) -> Result<std::process::Output, ExecError> {
        run_cli("lxc", &args, &self.env, None).await
    }

    async fn find_instance(&self) -> Result<String, String> {
        let args = vec!["list".to_string(), "--format".to_string(), "json".to_string()];
        let limit = self.target.options.connect_timeout();
        let output = run_cli("lxc", &args, &self.env, Some(limit))
            .await
            .map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(cli_error(&output));
        }
        let instances: Vec<Instance> =
            serde_json::from_slice(&output.stdout).map_err(|e| e.to_string())?;
        instances
            .into_iter()
            .find(|i| i.name == self.target.host())
            .map(|i| i.name)
            .ok_or_else(|| {
                format!(
                    "Could not find a container with name matching '{}'",
                    self.target.host()
                )
            })
    }

    fn exec_args(instance: &str, command: &str) -> Vec<String> {
        ["exec", instance, "--", "sh", "-c", command]
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

#[async_trait]
impl Connection for LxdConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn user(&self) -> &str {
        "root"
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn reset_cwd(&self) -> bool {
        true
    }

    fn transport_name(&self) -> &'static str {
        "lxd"
    }

    #[instrument(skip(self), fields(target_name = %self.target.name))]
    async fn connect(&mut self) -> Result<(), ExecError> {
        self.state = ConnectionState::Connecting;
        match self.find_instance().await {
            Ok(name) => {
                info!(instance = %name, "opened lxd session");
                self.instance = Some(name);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Unconnected;
                Err(ExecError::connect(format!(
                    "Failed to connect to {}: {e}",
                    self.target.safe_name()
                )))
            }
        }
    }

    async fn spawn(&mut self, command: &str, tty: bool) -> Result<Box<dyn Process>, ExecError> {
        let instance = self.instance()?;
        if tty {
            debug!("tty is not supported by the lxd transport; ignoring");
        }
        Ok(Box::new(LocalProcess::spawn(
            "lxc",
            &Self::exec_args(instance, command),
            &self.env,
        )?))
    }

    async fn upload(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        let instance = self.instance()?.to_string();
        debug!(source = %source.display(), destination = %destination, "uploading");

        let write_error = |detail: String| {
            ExecError::file(
                FileCode::Write,
                format!("Error writing file to container {instance}: {detail}"),
            )
        };

        if !source.is_dir() {
            let output = self
                .lxc(vec![
                    "file".to_string(),
                    "push".to_string(),
                    source.display().to_string(),
                    format!("{instance}{destination}"),
                ])
                .await?;
            return if output.status.success() {
                Ok(())
            } else {
                Err(write_error(cli_error(&output)))
            };
        }

        let mkdir = format!("mkdir -p {}", posix::quote(destination));
        let output = self.lxc(Self::exec_args(&instance, &mkdir)).await?;
        if !output.status.success() {
            return Err(write_error(cli_error(&output)));
        }

        // push each entry so the directory's contents land in `destination`
        let entries = std::fs::read_dir(source).map_err(|e| write_error(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| write_error(e.to_string()))?;
            let output = self
                .lxc(vec![
                    "file".to_string(),
                    "push".to_string(),
                    "-r".to_string(),
                    entry.path().display().to_string(),
                    format!("{instance}{}/", destination.trim_end_matches('/')),
                ])
                .await?;
            if !output.status.success() {
                return Err(write_error(cli_error(&output)));
            }
        }
        Ok(())
    }

    async fn download(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
        let instance = self.instance()?.to_string();
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
            .lxc(vec![
                "file".to_string(),
                "pull".to_string(),
                "-r".to_string(),
                format!("{instance}{source}"),
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
            debug!(target_name = %self.target.name, "closed lxd session");
        }
        Ok(())
    }
}
