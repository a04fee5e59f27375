//! Pipelines for POSIX targets
//!
//! Scripts, tasks and uploads are staged in a [`RemoteTempDir`] that is
//! removed on every exit path once the staged work is done.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::debug;

use fanout_exec::shell::posix::{ExecuteOptions, PosixShell, quote};
use fanout_exec::shell::{Cmd, posix};
use fanout_exec::target::Interpreter;
use fanout_exec::tempdir::{RemoteTempDir, write_executable};
use fanout_exec::{Connection, ExecError, FileCode, Target, remote_basename};

use super::{local_file_name, task_environment};
use crate::action::{Action, ActionKind, ActionOptions, InputMethod, TaskSpec};
use crate::result::TargetResult;

const WRAPPER_NAME: &str = "wrapper.sh";

pub(crate) async fn run(
    conn: &mut dyn Connection,
    target: &Arc<Target>,
    action: &Action,
    options: &ActionOptions,
) -> Result<TargetResult, ExecError> {
    let shell = PosixShell::new(target).with_run_as(options.run_as.clone());

    match action {
        Action::Command { command } => {
            let output = shell
                .execute(
                    conn,
                    command.as_str(),
                    ExecuteOptions {
                        sudoable: true,
                        environment: Some(&options.env),
                        ..Default::default()
                    },
                )
                .await?;
            Ok(TargetResult::for_command(
                Arc::clone(target),
                ActionKind::Command,
                command.clone(),
                &output,
            ))
        }
        Action::Script { path, arguments } => {
            let mut dir = RemoteTempDir::create(&shell, conn).await?;
            let outcome = run_script(conn, &shell, &mut dir, target, path, arguments, &options.env).await;
            dir.cleanup(&shell, conn).await;
            outcome
        }
        Action::Task { task, arguments } => {
            let mut dir = RemoteTempDir::create(&shell, conn).await?;
            let outcome = run_task(conn, &shell, &mut dir, target, task, arguments).await;
            dir.cleanup(&shell, conn).await;
            outcome
        }
        Action::Upload {
            source,
            destination,
        } => {
            let mut dir = RemoteTempDir::create(&shell, conn).await?;
            let outcome = upload(conn, &shell, &mut dir, source, destination).await;
            dir.cleanup(&shell, conn).await;
            outcome?;
            Ok(TargetResult::for_upload(Arc::clone(target), source, destination))
        }
        Action::Download {
            source,
            destination,
        } => {
            let local_dir = destination.join(target.safe_name());
            let escalate = shell.run_as().is_some_and(|u| u != conn.user());
            if escalate {
                let mut dir = RemoteTempDir::create(&shell, conn).await?;
                let outcome = download_as(conn, &shell, &mut dir, source, &local_dir).await;
                // files copied by the run-as user are never left behind
                dir.delete(&shell, conn).await;
                outcome?;
            } else {
                conn.download(source, &local_dir).await?;
            }
            let path = local_dir.join(remote_basename(source));
            Ok(TargetResult::for_download(
                Arc::clone(target),
                source,
                destination,
                &path,
            ))
        }
    }
}

async fn run_script(
    conn: &mut dyn Connection,
    shell: &PosixShell,
    dir: &mut RemoteTempDir,
    target: &Arc<Target>,
    script: &Path,
    arguments: &[String],
    env: &BTreeMap<String, String>,
) -> Result<TargetResult, ExecError> {
    let remote = write_executable(shell, conn, dir.path(), script, None).await?;
    dir.chown(shell, conn, shell.run_as()).await?;

    let interpreter = target.options.interpreter_for(&remote).map(Interpreter::argv);
    let mut argv = vec![remote];
    argv.extend(arguments.iter().cloned());

    let output = shell
        .execute(
            conn,
            Cmd::Argv(argv),
            ExecuteOptions {
                sudoable: true,
                interpreter,
                environment: Some(env),
                ..Default::default()
            },
        )
        .await?;
    Ok(TargetResult::for_command(
        Arc::clone(target),
        ActionKind::Script,
        script.display().to_string(),
        &output,
    ))
}

async fn run_task(
    conn: &mut dyn Connection,
    shell: &PosixShell,
    dir: &mut RemoteTempDir,
    target: &Arc<Target>,
    task: &TaskSpec,
    arguments: &Map<String, Value>,
) -> Result<TargetResult, ExecError> {
    let input = task.input_method.unwrap_or(InputMethod::Both);
    let mut arguments = arguments.clone();

    let task_dir = if task.files.is_empty() {
        dir.path().to_string()
    } else {
        arguments.insert("_installdir".to_string(), json!(dir.path()));
        let mut subdirs = vec![task.tasks_dir()];
        subdirs.extend(task.files.iter().filter_map(|f| {
            Path::new(&f.name)
                .parent()
                .and_then(Path::to_str)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
        }));
        dir.mkdirs(shell, conn, &subdirs).await?;
        for file in &task.files {
            conn.upload(&file.path, &dir.join(&file.name)).await?;
        }
        dir.join(&task.tasks_dir())
    };

    let mut remote = write_executable(shell, conn, &task_dir, &task.executable, None).await?;
    let mut interpreter = target.options.interpreter_for(&remote).map(Interpreter::argv);
    let mut stdin = input
        .uses_stdin()
        .then(|| Value::Object(arguments.clone()).to_string());
    let environment = input.uses_environment().then(|| task_environment(&arguments));

    if shell.tty()
        && let Some(payload) = stdin.take()
    {
        let script = wrapper_script(&remote, interpreter.take().as_deref(), &payload);
        remote = write_wrapper(conn, shell, dir, &script).await?;
    }

    dir.chown(shell, conn, shell.run_as()).await?;

    debug!(task = %task.name, input = ?input, "running task");
    let output = shell
        .execute(
            conn,
            Cmd::argv([remote]),
            ExecuteOptions {
                sudoable: true,
                interpreter,
                environment: environment.as_ref(),
                stdin: stdin.as_deref().map(str::as_bytes),
                ..Default::default()
            },
        )
        .await?;
    Ok(TargetResult::for_task(Arc::clone(target), task.name.clone(), &output))
}

/// Script feeding `stdin` to the task through a heredoc
///
/// Used when a tty is requested, since input piped into a terminal would be
/// echoed back into the task's output.
fn wrapper_script(task_path: &str, interpreter: Option<&[String]>, stdin: &str) -> String {
    let command = match interpreter {
        Some(interpreter) => format!("{} {}", posix::join(interpreter), quote(task_path)),
        None => quote(task_path),
    };
    format!("#!/bin/sh\n{command} <<'EOF'\n{stdin}\nEOF\n")
}

async fn write_wrapper(
    conn: &mut dyn Connection,
    shell: &PosixShell,
    dir: &RemoteTempDir,
    script: &str,
) -> Result<String, ExecError> {
    let path = dir.join(WRAPPER_NAME);
    let output = shell
        .execute(
            conn,
            format!("cat > {}", quote(&path)),
            ExecuteOptions {
                stdin: Some(script.as_bytes()),
                ..Default::default()
            },
        )
        .await?;
    if !output.success() {
        return Err(ExecError::file(
            FileCode::Write,
            format!("Could not write file to {path}: {}", output.error_message()),
        ));
    }

    let output = shell
        .execute(
            conn,
            Cmd::argv(["chmod", "u+x", path.as_str()]),
            ExecuteOptions::default(),
        )
        .await?;
    if !output.success() {
        return Err(ExecError::file(
            FileCode::Chmod,
            format!(
                "Could not make file '{path}' executable: {}",
                output.error_message()
            ),
        ));
    }
    Ok(path)
}

async fn upload(
    conn: &mut dyn Connection,
    shell: &PosixShell,
    dir: &mut RemoteTempDir,
    source: &Path,
    destination: &str,
) -> Result<(), ExecError> {
    let name = match remote_basename(destination) {
        "" => local_file_name(source)?,
        name => name,
    };
    let staged = dir.join(name);
    conn.upload(source, &staged).await?;
    dir.chown(shell, conn, shell.run_as()).await?;

    let output = shell
        .execute(
            conn,
            Cmd::argv(["mv", "-f", staged.as_str(), destination]),
            ExecuteOptions {
                sudoable: true,
                ..Default::default()
            },
        )
        .await?;
    if !output.success() {
        return Err(ExecError::file(
            FileCode::Mv,
            format!(
                "Could not move temporary file '{staged}' to {destination}: {}",
                output.error_message()
            ),
        ));
    }
    Ok(())
}

/// Copy `source` into the tempdir as the run-as user, hand the copy back
/// to the connection user and download it from there
async fn download_as(
    conn: &mut dyn Connection,
    shell: &PosixShell,
    dir: &mut RemoteTempDir,
    source: &str,
    local_dir: &Path,
) -> Result<(), ExecError> {
    dir.chown(shell, conn, shell.run_as()).await?;

    let output = shell
        .execute(
            conn,
            Cmd::argv(["cp", "-r", source, dir.path()]),
            ExecuteOptions {
                sudoable: true,
                ..Default::default()
            },
        )
        .await?;
    if !output.success() {
        return Err(ExecError::file(
            FileCode::Copy,
            format!(
                "Could not copy '{source}' to temporary directory '{}': {}",
                dir.path(),
                output.error_message()
            ),
        ));
    }

    dir.reclaim(shell, conn).await?;
    conn.download(&dir.join(remote_basename(source)), local_dir).await
}
