//! SSH transport using the russh crate

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, check_known_hosts, load_secret_key, ssh_key};
use russh::{Channel, ChannelMsg, Disconnect, client};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::{psfile, remote_basename, walk_local};
use crate::connection::{Connection, ConnectionState};
use crate::error::{ExecError, FileCode};
use crate::process::{Process, ProcessEvent};
use crate::shell::posix::quote;
use crate::target::Target;

const DEFAULT_KEYS: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// SSH client handler verifying the server key
#[derive(Debug)]
struct SshClientHandler {
    host: String,
    port: u16,
    verify: bool,
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        if !self.verify {
            return Ok(true);
        }
        match check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(known) => Ok(known),
            Err(e) => {
                warn!(host = %self.host, error = %e, "host key check failed");
                Ok(false)
            }
        }
    }
}

/// Classify a russh failure raised while connecting
/// Split `find` output into directories and files at the `--` line
///
/// Every path line starts with `.`, so only the separator itself matches.
fn split_listing(listing: &str) -> (Vec<&str>, Vec<&str>) {
    let mut lines = listing.lines().filter(|l| !l.is_empty());
    let dirs = lines.by_ref().take_while(|l| *l != "--").collect();
    (dirs, lines.collect())
}

fn connect_error(err: russh::Error, host: &str) -> ExecError {
    match err {
        russh::Error::UnknownKey => ExecError::host_key(format!(
            "Host key verification failed for {host}: key is unknown or has changed"
        )),
        other => ExecError::connect(format!("Failed to connect to {host}: {other}")),
    }
}

/// A command running on an SSH channel
pub struct SshProcess {
    channel: Channel<client::Msg>,
    finished: bool,
}

#[async_trait]
impl Process for SshProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, ExecError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => return Ok(Some(ProcessEvent::Stdout(data.to_vec()))),
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                    return Ok(Some(ProcessEvent::Stderr(data.to_vec())));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    return Ok(Some(ProcessEvent::Exit(exit_status.cast_signed())));
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    debug!(signal = ?signal_name, "remote command killed by signal");
                    return Ok(Some(ProcessEvent::Exit(-1)));
                }
                // exit-status may still follow EOF
                Some(ChannelMsg::Close) | None => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(_) => {}
            }
        }
    }

    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| ExecError::Exec(format!("failed to write stdin: {e}")))
    }

    async fn close_stdin(&mut self) -> Result<(), ExecError> {
        self.channel
            .eof()
            .await
            .map_err(|e| ExecError::Exec(format!("failed to close stdin: {e}")))
    }

    async fn abort(&mut self) {
        let _ = self.channel.close().await;
    }
}

/// SSH session with one target
///
/// The session is opened by [`Connection::connect`]; every command gets its
/// own channel.
pub struct SshConnection {
    target: Target,
    user: String,
    session: Option<client::Handle<SshClientHandler>>,
    state: ConnectionState,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("target", &self.target.name)
            .field("user", &self.user)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SshConnection {
    /// Create a connection for `target`
    ///
    /// The login user defaults to the local user.
    #[must_use]
    pub fn new(target: Target) -> Self {
        let user = target
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());
        Self {
            target,
            user,
            session: None,
            state: ConnectionState::Unconnected,
        }
    }

    fn session(&self) -> Result<&client::Handle<SshClientHandler>, ExecError> {
        match (&self.state, &self.session) {
            (ConnectionState::Connected, Some(session)) => Ok(session),
            _ => Err(ExecError::NotConnected),
        }
    }

    /// Keys tried when the target configures neither a key nor a password
    fn default_keys() -> Vec<PrivateKey> {
        let Some(ssh_dir) = dirs::home_dir().map(|home| home.join(".ssh")) else {
            return Vec::new();
        };
        DEFAULT_KEYS
            .iter()
            .map(|name| ssh_dir.join(name))
            .filter(|path| path.exists())
            .filter_map(|path| match load_secret_key(&path, None) {
                Ok(key) => Some(key),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping default key");
                    None
                }
            })
            .collect()
    }

    async fn open_session(&self) -> Result<client::Handle<SshClientHandler>, ExecError> {
        let host = self.target.host().to_string();
        let port = self.target.port();

        info!(host = %host, port = port, user = %self.user, "connecting to SSH");

        let config = Arc::new(client::Config::default());
        let handler = SshClientHandler {
            host: host.clone(),
            port,
            verify: self.target.options.host_key_check,
        };

        let limit = self.target.options.connect_timeout();
        let mut session = timeout(limit, client::connect(config, (host.as_str(), port), handler))
            .await
            .map_err(|_| {
                ExecError::connect(format!(
                    "Failed to connect to {host}: timed out after {}s",
                    limit.as_secs()
                ))
            })?
            .map_err(|e| connect_error(e, &host))?;

        let authenticated = if let Some(password) = &self.target.password {
            session
                .authenticate_password(&self.user, password.expose())
                .await
                .map_err(|e| ExecError::auth(e.to_string()))?
                .success()
        } else {
            let keys = match &self.target.options.private_key {
                Some(source) => vec![source.load()?],
                None => Self::default_keys(),
            };
            if keys.is_empty() {
                return Err(ExecError::auth(format!(
                    "No authentication method available for {}@{host}",
                    self.user
                )));
            }

            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            let mut success = false;
            for key in keys {
                let result = session
                    .authenticate_publickey(
                        &self.user,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(|e| ExecError::auth(e.to_string()))?;
                if result.success() {
                    success = true;
                    break;
                }
            }
            success
        };

        if !authenticated {
            return Err(ExecError::auth(format!(
                "Authentication failed for user {} on {host}",
                self.user
            )));
        }

        info!(host = %host, "SSH connected and authenticated");
        Ok(session)
    }

    async fn upload_posix(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        let write_error = |detail: String| {
            ExecError::file(
                FileCode::Write,
                format!("Could not write file to {destination}: {detail}"),
            )
        };

        if !source.is_dir() {
            let content = tokio::fs::read(source)
                .await
                .map_err(|e| write_error(format!("{}: {e}", source.display())))?;
            let output = self
                .execute(&format!("cat > {}", quote(destination)), Some(&content))
                .await?;
            return if output.success() {
                Ok(())
            } else {
                Err(write_error(output.error_message()))
            };
        }

        let (dirs, files) = walk_local(source).map_err(|e| write_error(e.to_string()))?;
        let base = destination.trim_end_matches('/');
        let mut mkdir = vec!["mkdir".to_string(), "-p".to_string(), base.to_string()];
        mkdir.extend(dirs.iter().map(|d| format!("{base}/{d}")));
        let output = self.execute(&crate::shell::posix::join(&mkdir), None).await?;
        if !output.success() {
            return Err(write_error(output.error_message()));
        }

        for file in &files {
            let content = tokio::fs::read(source.join(file))
                .await
                .map_err(|e| write_error(format!("{file}: {e}")))?;
            let remote = format!("{base}/{file}");
            let output = self
                .execute(&format!("cat > {}", quote(&remote)), Some(&content))
                .await?;
            if !output.success() {
                return Err(write_error(output.error_message()));
            }
        }
        Ok(())
    }

    async fn download_posix(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
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
        let quoted = quote(source);

        let output = self.execute(&format!("test -d {quoted}"), None).await?;
        if !output.success() {
            let output = self.execute(&format!("cat {quoted}"), None).await?;
            if !output.success() {
                return Err(download_error(output.error_message()));
            }
            return tokio::fs::write(&local, &output.stdout)
                .await
                .map_err(|e| download_error(e.to_string()));
        }

        let output = self
            .execute(&format!("cd {quoted} && find . -type d && echo -- && find . -type f"), None)
            .await?;
        if !output.success() {
            return Err(download_error(output.error_message()));
        }
        let listing = output.stdout_str();
        let (dirs, files) = split_listing(&listing);

        for dir in dirs {
            tokio::fs::create_dir_all(local.join(dir.trim_start_matches("./")))
                .await
                .map_err(|e| download_error(e.to_string()))?;
        }
        for file in files {
            let rel = file.trim_start_matches("./");
            let remote = format!("{}/{rel}", source.trim_end_matches('/'));
            let output = self.execute(&format!("cat {}", quote(&remote)), None).await?;
            if !output.success() {
                return Err(download_error(output.error_message()));
            }
            tokio::fs::write(local.join(rel), &output.stdout)
                .await
                .map_err(|e| download_error(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn user(&self) -> &str {
        &self.user
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn transport_name(&self) -> &'static str {
        "ssh"
    }

    #[instrument(skip(self), fields(host = %self.target.host()))]
    async fn connect(&mut self) -> Result<(), ExecError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        match self.open_session().await {
            Ok(session) => {
                self.session = Some(session);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Unconnected;
                Err(e)
            }
        }
    }

    async fn spawn(&mut self, command: &str, tty: bool) -> Result<Box<dyn Process>, ExecError> {
        let session = self.session()?;
        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::Exec(format!("failed to open channel: {e}")))?;

        if tty {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(|e| ExecError::Exec(format!("failed to request pty: {e}")))?;
        }
        channel
            .exec(true, command)
            .await
            .map_err(|e| ExecError::Exec(format!("failed to start command: {e}")))?;

        Ok(Box::new(SshProcess {
            channel,
            finished: false,
        }))
    }

    async fn upload(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        self.session()?;
        debug!(source = %source.display(), destination = %destination, "uploading");
        if self.target.uses_powershell() {
            psfile::upload(self, source, destination).await
        } else {
            self.upload_posix(source, destination).await
        }
    }

    async fn download(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
        self.session()?;
        debug!(source = %source, destination = %destination.display(), "downloading");
        if self.target.uses_powershell() {
            psfile::download(self, source, destination).await
        } else {
            self.download_posix(source, destination).await
        }
    }

    async fn disconnect(&mut self) -> Result<(), ExecError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        self.state = ConnectionState::Disconnected;

        let limit = self.target.options.disconnect_timeout();
        match timeout(limit, session.disconnect(Disconnect::ByApplication, "", "English")).await {
            Ok(Ok(())) => {
                info!(host = %self.target.host(), "SSH disconnected");
                Ok(())
            }
            Ok(Err(e)) => Err(ExecError::Exec(format!("failed to disconnect: {e}"))),
            Err(_) => {
                warn!(host = %self.target.host(), "SSH disconnect timed out");
                Ok(())
            }
        }
    }
}
