//! Captured output of one command

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Output of a command that ran to completion
///
/// Streams are kept as raw bytes; a non-zero `exit_code` is a normal outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit status code (0 for success)
    pub exit_code: i32,
    /// stdout bytes
    pub stdout: Vec<u8>,
    /// stderr bytes
    pub stderr: Vec<u8>,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandOutput {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout decoded as UTF-8, replacing invalid sequences
    #[must_use]
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// stderr decoded as UTF-8, replacing invalid sequences
    #[must_use]
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Error message for a failed helper command: stderr, falling back to stdout
    #[must_use]
    pub fn error_message(&self) -> String {
        let stderr = self.stderr_str();
        if stderr.trim().is_empty() {
            self.stdout_str().trim().to_string()
        } else {
            stderr.trim().to_string()
        }
    }
}
