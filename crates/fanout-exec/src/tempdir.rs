//! Remote temporary directories on POSIX targets
//!
//! A [`RemoteTempDir`] is created with `mkdir -m 700`, filled with uploaded
//! executables, optionally re-owned to the run-as user, and removed with
//! `rm -rf` by whoever owns it. Removal never fails the caller: problems are
//! logged as warnings.

use std::path::Path;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{ExecError, FileCode};
use crate::shell::Cmd;
use crate::shell::posix::{ExecuteOptions, PosixShell};

const DEFAULT_TMPDIR: &str = "/tmp";

/// A scratch directory on the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTempDir {
    path: String,
    owner: String,
}

impl RemoteTempDir {
    /// Create `<tmpdir>/<script-dir or uuid>` with mode 700
    ///
    /// # Errors
    /// Returns `TEMPDIR_ERROR` if the directory cannot be created
    pub async fn create(shell: &PosixShell, conn: &mut dyn Connection) -> Result<Self, ExecError> {
        let options = &conn.target().options;
        let base = options.tmpdir.clone().unwrap_or_else(|| DEFAULT_TMPDIR.to_string());
        let name = options
            .script_dir
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let path = format!("{}/{name}", base.trim_end_matches('/'));

        let output = shell
            .execute(
                conn,
                Cmd::argv(["mkdir", "-m", "700", path.as_str()]),
                ExecuteOptions::default(),
            )
            .await?;
        if !output.success() {
            return Err(ExecError::file(
                FileCode::Tempdir,
                format!("Could not make tempdir: {}", output.error_message()),
            ));
        }

        debug!(path = %path, "created tempdir");
        Ok(Self {
            path,
            owner: conn.user().to_string(),
        })
    }

    /// Absolute path of the directory
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// User that currently owns the directory
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Path of `name` inside the directory
    #[must_use]
    pub fn join(&self, name: &str) -> String {
        format!("{}/{}", self.path, name.trim_start_matches('/'))
    }

    /// Create subdirectories with `mkdir -p`
    ///
    /// # Errors
    /// Returns `MKDIR_ERROR` on failure
    pub async fn mkdirs(
        &self,
        shell: &PosixShell,
        conn: &mut dyn Connection,
        subdirs: &[String],
    ) -> Result<(), ExecError> {
        let mut argv = vec!["mkdir".to_string(), "-p".to_string()];
        argv.extend(subdirs.iter().map(|d| self.join(d)));

        let output = shell.execute(conn, Cmd::Argv(argv), ExecuteOptions::default()).await?;
        if !output.success() {
            return Err(ExecError::file(
                FileCode::Mkdir,
                format!(
                    "Could not create subdirectories in '{}': {}",
                    self.path,
                    output.error_message()
                ),
            ));
        }
        Ok(())
    }

    /// Hand the directory and its contents to `owner`
    ///
    /// No-op when `owner` is `None` or already owns it. The `chown` itself
    /// always runs escalated to root.
    ///
    /// # Errors
    /// Returns `ID_ERROR` if the owner's group cannot be resolved, or
    /// `CHOWN_ERROR` if the ownership change fails
    pub async fn chown(
        &mut self,
        shell: &PosixShell,
        conn: &mut dyn Connection,
        owner: Option<&str>,
    ) -> Result<(), ExecError> {
        match owner.filter(|o| *o != self.owner) {
            Some(owner) => self.change_owner(shell, conn, owner).await,
            None => Ok(()),
        }
    }

    /// Hand the directory back to the connection user, even if it already
    /// owns the directory itself
    ///
    /// Files copied in by an escalated command belong to the run-as user.
    ///
    /// # Errors
    /// Returns `ID_ERROR` or `CHOWN_ERROR` as [`RemoteTempDir::chown`] does
    pub async fn reclaim(
        &mut self,
        shell: &PosixShell,
        conn: &mut dyn Connection,
    ) -> Result<(), ExecError> {
        let user = conn.user().to_string();
        self.change_owner(shell, conn, &user).await
    }

    async fn change_owner(
        &mut self,
        shell: &PosixShell,
        conn: &mut dyn Connection,
        owner: &str,
    ) -> Result<(), ExecError> {
        let output = shell
            .execute(conn, Cmd::argv(["id", "-g", owner]), ExecuteOptions::default())
            .await?;
        if !output.success() {
            return Err(ExecError::file(
                FileCode::Id,
                format!(
                    "Could not identify group of user {owner}: {}",
                    output.error_message()
                ),
            ));
        }
        let group = output.stdout_str().trim().to_string();

        let spec = format!("{owner}:{group}");
        let output = shell
            .execute(
                conn,
                Cmd::argv(["chown", "-R", spec.as_str(), self.path.as_str()]),
                ExecuteOptions {
                    sudoable: true,
                    run_as: Some("root"),
                    ..Default::default()
                },
            )
            .await?;
        if !output.success() {
            return Err(ExecError::file(
                FileCode::Chown,
                format!(
                    "Could not change owner of '{}' to {owner}: {}",
                    self.path,
                    output.error_message()
                ),
            ));
        }

        self.owner = owner.to_string();
        Ok(())
    }

    /// Remove the directory as its current owner; failures are logged
    pub async fn delete(&self, shell: &PosixShell, conn: &mut dyn Connection) {
        let options = ExecuteOptions {
            sudoable: true,
            run_as: Some(self.owner.as_str()),
            ..Default::default()
        };
        match shell
            .execute(conn, Cmd::argv(["rm", "-rf", self.path.as_str()]), options)
            .await
        {
            Ok(output) if output.success() => debug!(path = %self.path, "removed tempdir"),
            Ok(output) => warn!(
                path = %self.path,
                "Failed to clean up tmpdir '{}': {}",
                self.path,
                output.error_message()
            ),
            Err(e) => warn!(
                path = %self.path,
                error = %e,
                "Failed to clean up tmpdir '{}'",
                self.path
            ),
        }
    }

    /// Delete the directory unless the target disables cleanup
    pub async fn cleanup(self, shell: &PosixShell, conn: &mut dyn Connection) {
        if conn.target().options.cleanup() {
            self.delete(shell, conn).await;
        } else {
            warn!(path = %self.path, "Skipping cleanup of tmpdir {}", self.path);
        }
    }
}

/// Upload `source` into `dir` and make it executable
///
/// # Errors
/// Returns the upload error, or `CHMOD_ERROR` if `chmod u+x` fails
pub async fn write_executable(
    shell: &PosixShell,
    conn: &mut dyn Connection,
    dir: &str,
    source: &Path,
    filename: Option<&str>,
) -> Result<String, ExecError> {
    let filename = match filename {
        Some(name) => name.to_string(),
        None => source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ExecError::Validation(format!("invalid file name: {}", source.display())))?
            .to_string(),
    };
    let remote_path = format!("{}/{filename}", dir.trim_end_matches('/'));

    conn.upload(source, &remote_path).await?;

    let output = shell
        .execute(
            conn,
            Cmd::argv(["chmod", "u+x", remote_path.as_str()]),
            ExecuteOptions::default(),
        )
        .await?;
    if !output.success() {
        return Err(ExecError::file(
            FileCode::Chmod,
            format!(
                "Could not make file '{remote_path}' executable: {}",
                output.error_message()
            ),
        ));
    }
    Ok(remote_path)
}
