//! SSH private key resolution

use std::env;
use std::path::Path;

use russh::keys::{PrivateKey, decode_secret_key, load_secret_key};
use tracing::debug;

use crate::error::ExecError;
use crate::target::PrivateKeySource;

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("could not parse private key: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<KeyError> for ExecError {
    fn from(err: KeyError) -> Self {
        ExecError::auth(format!("failed to load private key: {err}"))
    }
}

impl PrivateKeySource {
    /// Load the private key
    ///
    /// # Errors
    /// Returns `KeyError` if the key cannot be found, read or parsed
    pub fn load(&self) -> Result<PrivateKey, KeyError> {
        match self {
            PrivateKeySource::Path(path) => {
                let path = expand_home(path);
                if !path.exists() {
                    return Err(KeyError::NotFound(path.display().to_string()));
                }
                validate_key_permissions(&path)?;
                debug!(path = %path.display(), "loading private key");
                load_secret_key(&path, None).map_err(|e| KeyError::Parse(e.to_string()))
            }
            PrivateKeySource::Data { key_data } => {
                decode_secret_key(key_data.expose(), None).map_err(|e| KeyError::Parse(e.to_string()))
            }
            PrivateKeySource::Env { key_env } => {
                let encoded = env::var(key_env).map_err(|_| KeyError::EnvNotSet(key_env.clone()))?;
                let raw = base64_decode(&encoded).map_err(|_| KeyError::InvalidBase64)?;
                let text = String::from_utf8(raw).map_err(|e| KeyError::Parse(e.to_string()))?;
                decode_secret_key(&text, None).map_err(|e| KeyError::Parse(e.to_string()))
            }
        }
    }
}

fn expand_home(path: &Path) -> std::path::PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(_path: &Path) -> Result<(), KeyError> {
    Ok(())
}
