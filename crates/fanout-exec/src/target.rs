//! Target descriptors
//!
//! A [`Target`] is an already-resolved endpoint: transport, address,
//! credentials and transport options. It is never mutated while a batch runs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Transport used to reach a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Ssh,
    Winrm,
    Local,
    Docker,
    Podman,
    Lxd,
}

impl TransportKind {
    /// Transport name as used in configuration
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Ssh => "ssh",
            TransportKind::Winrm => "winrm",
            TransportKind::Local => "local",
            TransportKind::Docker => "docker",
            TransportKind::Podman => "podman",
            TransportKind::Lxd => "lxd",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential that is never printed by `Debug`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The secret value
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Where an SSH private key comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrivateKeySource {
    /// Path to a key file
    Path(PathBuf),
    /// Key material inline
    Data {
        #[serde(rename = "key-data")]
        key_data: Secret,
    },
    /// Base64-encoded key read from an environment variable
    Env {
        #[serde(rename = "key-env")]
        key_env: String,
    },
}

/// Interpreter for a script extension, either a single path or an argv prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Interpreter {
    Path(String),
    Argv(Vec<String>),
}

impl Interpreter {
    /// Interpreter as argv words
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        match self {
            Interpreter::Path(path) => vec![path.clone()],
            Interpreter::Argv(argv) => argv.clone(),
        }
    }
}

/// Transport-specific options of a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TargetOptions {
    /// Base directory for remote temporary directories
    pub tmpdir: Option<String>,
    /// Fixed directory name under `tmpdir` instead of a random one
    pub script_dir: Option<String>,
    /// Delete temporary directories after use; unset means yes
    pub cleanup: Option<bool>,
    /// User to run actions as
    pub run_as: Option<String>,
    /// Escalation command used instead of sudo
    pub run_as_command: Option<Vec<String>>,
    /// sudo binary
    pub sudo_executable: Option<String>,
    /// Escalation password, falls back to the target password
    pub sudo_password: Option<Secret>,
    /// Interpreters keyed by file extension
    pub interpreters: BTreeMap<String, Interpreter>,
    /// Request a pseudo-terminal
    pub tty: bool,
    /// Connect timeout in seconds
    pub connect_timeout: u64,
    /// Disconnect timeout in seconds
    pub disconnect_timeout: u64,
    /// Verify the SSH host key against `known_hosts`
    pub host_key_check: bool,
    /// SSH private key
    pub private_key: Option<PrivateKeySource>,
    /// Remote login shell (`sh` or `powershell`)
    pub login_shell: Option<String>,
    /// Extra script extensions allowed on Windows
    pub extensions: Vec<String>,
    /// Use HTTPS for WinRM
    pub ssl: bool,
    /// Verify the WinRM server certificate
    pub ssl_verify: bool,
    /// CA certificate for WinRM over HTTPS
    pub cacert: Option<PathBuf>,
    /// Shell used by container transports instead of `sh -c`
    pub shell_command: Option<String>,
    /// Container service endpoint (`DOCKER_HOST`, `LXD_HOST`)
    pub service_url: Option<String>,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            tmpdir: None,
            script_dir: None,
            cleanup: None,
            run_as: None,
            run_as_command: None,
            sudo_executable: None,
            sudo_password: None,
            interpreters: BTreeMap::new(),
            tty: false,
            connect_timeout: 10,
            disconnect_timeout: 5,
            host_key_check: true,
            private_key: None,
            login_shell: None,
            extensions: Vec::new(),
            ssl: true,
            ssl_verify: true,
            cacert: None,
            shell_command: None,
            service_url: None,
        }
    }
}

impl TargetOptions {
    /// Interpreter configured for the extension of `path`
    ///
    /// Extension keys may be written with or without the leading dot.
    #[must_use]
    pub fn interpreter_for(&self, path: &str) -> Option<&Interpreter> {
        let ext = Path::new(path).extension()?.to_str()?;
        self.interpreters
            .iter()
            .find(|(key, _)| key.trim_start_matches('.') == ext)
            .map(|(_, interpreter)| interpreter)
    }

    /// Whether temporary directories are deleted after use
    #[must_use]
    pub fn cleanup(&self) -> bool {
        self.cleanup.unwrap_or(true)
    }

    /// Connect timeout as a `Duration`
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Disconnect timeout as a `Duration`
    #[must_use]
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout)
    }
}

/// A resolved endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Unique name of the target
    pub name: String,
    /// Transport used to reach it
    #[serde(default)]
    pub transport: TransportKind,
    /// Host, container name or address; defaults to `name`
    #[serde(default)]
    pub host: Option<String>,
    /// Login user
    #[serde(default)]
    pub user: Option<String>,
    /// Port, defaults per transport
    #[serde(default)]
    pub port: Option<u16>,
    /// Login password
    #[serde(default)]
    pub password: Option<Secret>,
    /// Transport options
    #[serde(default)]
    pub options: TargetOptions,
}

impl Target {
    /// Create a target with default options
    pub fn new(name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            name: name.into(),
            transport,
            host: None,
            user: None,
            port: None,
            password: None,
            options: TargetOptions::default(),
        }
    }

    /// Set host
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set login user
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set login password
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Secret::new(password));
        self
    }

    /// Replace the options
    #[must_use]
    pub fn with_options(mut self, options: TargetOptions) -> Self {
        self.options = options;
        self
    }

    /// Host to connect to
    #[must_use]
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(&self.name)
    }

    /// Port to connect to, with the transport's default
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.transport {
            TransportKind::Winrm if self.options.ssl => 5986,
            TransportKind::Winrm => 5985,
            _ => 22,
        })
    }

    /// Password used for sudo prompts
    #[must_use]
    pub fn sudo_password(&self) -> Option<&str> {
        self.options
            .sudo_password
            .as_ref()
            .or(self.password.as_ref())
            .map(Secret::expose)
    }

    /// Whether commands on this target go through PowerShell
    #[must_use]
    pub fn uses_powershell(&self) -> bool {
        self.transport == TransportKind::Winrm
            || self
                .options
                .login_shell
                .as_deref()
                .is_some_and(|shell| shell.eq_ignore_ascii_case("powershell"))
    }

    /// Name usable as a single path component
    #[must_use]
    pub fn safe_name(&self) -> String {
        self.name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Check that the credentials and options fit the transport
    ///
    /// # Errors
    /// Returns `ExecError::Validation` describing the first problem found
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.name.is_empty() {
            return Err(ExecError::Validation("target name is empty".to_string()));
        }
        match self.transport {
            TransportKind::Ssh => {
                if self.password.is_some() && self.options.private_key.is_some() {
                    return Err(ExecError::Validation(format!(
                        "target '{}' sets both password and private-key",
                        self.name
                    )));
                }
            }
            TransportKind::Winrm => {
                if self.options.private_key.is_some() {
                    return Err(ExecError::Validation(format!(
                        "private-key is not supported by the winrm transport (target '{}')",
                        self.name
                    )));
                }
                if self.user.is_none() || self.password.is_none() {
                    return Err(ExecError::Validation(format!(
                        "winrm target '{}' requires user and password",
                        self.name
                    )));
                }
            }
            TransportKind::Local
            | TransportKind::Docker
            | TransportKind::Podman
            | TransportKind::Lxd => {
                if self.options.private_key.is_some() {
                    return Err(ExecError::Validation(format!(
                        "private-key is not supported by the {} transport (target '{}')",
                        self.transport, self.name
                    )));
                }
            }
        }
        if self.options.tty && self.uses_powershell() {
            return Err(ExecError::Validation(format!(
                "tty is not supported with a PowerShell shell (target '{}')",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_toml() {
        let target: Target = toml::from_str(
            r#"
            name = "web1"
            transport = "ssh"
            user = "deploy"
            password = "hunter2"

            [options]
            run-as = "root"
            connect-timeout = 3
            interpreters = { py = "/usr/bin/python3", ".rb" = ["/usr/bin/env", "ruby"] }
            "#,
        )
        .unwrap();

        assert_eq!(target.host(), "web1");
        assert_eq!(target.port(), 22);
        assert_eq!(target.options.run_as.as_deref(), Some("root"));
        assert_eq!(target.options.connect_timeout(), Duration::from_secs(3));
        assert!(target.options.cleanup());
        assert_eq!(target.sudo_password(), Some("hunter2"));
        assert_eq!(
            target.options.interpreter_for("/tmp/x/script.py"),
            Some(&Interpreter::Path("/usr/bin/python3".to_string()))
        );
        assert_eq!(
            target.options.interpreter_for("task.rb").map(Interpreter::argv),
            Some(vec!["/usr/bin/env".to_string(), "ruby".to_string()])
        );
        assert!(target.options.interpreter_for("task.sh").is_none());
    }

    #[test]
    fn test_password_not_in_debug() {
        let target = Target::new("db", TransportKind::Ssh).with_password("hunter2");
        assert!(!format!("{target:?}").contains("hunter2"));
    }

    #[test]
    fn test_winrm_defaults() {
        let mut target = Target::new("win", TransportKind::Winrm)
            .with_user("Administrator")
            .with_password("pw");
        assert_eq!(target.port(), 5986);
        target.options.ssl = false;
        assert_eq!(target.port(), 5985);
        assert!(target.uses_powershell());
        assert!(target.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_conflicting_auth() {
        let mut target = Target::new("web", TransportKind::Ssh).with_password("pw");
        target.options.private_key = Some(PrivateKeySource::Path("/root/.ssh/id_ed25519".into()));
        assert!(matches!(target.validate(), Err(ExecError::Validation(_))));

        let mut local = Target::new("localhost", TransportKind::Local);
        local.options.private_key = Some(PrivateKeySource::Path("/k".into()));
        assert!(local.validate().is_err());
    }

    #[test]
    fn test_safe_name() {
        let target = Target::new("ssh://web1:2222/x", TransportKind::Ssh);
        assert_eq!(target.safe_name(), "ssh___web1_2222_x");
    }
}
