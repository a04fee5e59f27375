//! Connection implementations, one per transport

pub mod container;
pub mod local;
pub mod lxd;
pub mod psfile;
pub mod ssh;
pub mod winrm;

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::ExecError;

pub use container::{ContainerConnection, ContainerRuntime};
pub use local::LocalConnection;
pub use lxd::LxdConnection;
pub use ssh::SshConnection;
pub use winrm::WinrmConnection;

/// Run a local CLI (`docker`, `podman`, `lxc`) to completion
pub(crate) async fn run_cli(
    program: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    limit: Option<Duration>,
) -> Result<Output, ExecError> {
    debug!(program = %program, args = ?args, "running local CLI");

    let fut = Command::new(program)
        .args(args)
        .envs(env)
        .kill_on_drop(true)
        .output();
    let output = match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ExecError::connect(format!("{program} did not respond within {limit:?}")))?,
        None => fut.await,
    };
    output.map_err(|e| ExecError::Exec(format!("failed to run {program}: {e}")))
}

/// stderr of a CLI run, falling back to stdout
pub(crate) fn cli_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr.trim().to_string()
    }
}

/// Recursively copy `source` (file or directory) to `destination`
///
/// Directories copy their contents into `destination`; files replace it.
pub(crate) fn copy_tree(source: &Path, destination: &Path) -> std::io::Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(destination)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_tree(&entry.path(), &destination.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        if destination.is_dir() {
            std::fs::remove_dir_all(destination)?;
        } else if destination.exists() {
            std::fs::remove_file(destination)?;
        }
        std::fs::copy(source, destination).map(|_| ())
    }
}

/// Relative paths of every directory and file below `root`
pub(crate) fn walk_local(root: &Path) -> std::io::Result<(Vec<String>, Vec<String>)> {
    fn visit(
        root: &Path,
        dir: &Path,
        dirs: &mut Vec<String>,
        files: &mut Vec<String>,
    ) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let rel = path
                .strip_prefix(root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            if path.is_dir() {
                dirs.push(rel);
                visit(root, &path, dirs, files)?;
            } else {
                files.push(rel);
            }
        }
        Ok(())
    }

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    visit(root, root, &mut dirs, &mut files)?;
    dirs.sort();
    files.sort();
    Ok((dirs, files))
}

/// Last path component of a remote path using `/` or `\`
pub fn remote_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}
