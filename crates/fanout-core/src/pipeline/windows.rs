//! Pipelines for PowerShell targets
//!
//! Each script runs in a fresh `powershell.exe`, so task helpers are
//! defined in the same script that calls them. Run-as does not apply.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::debug;

use fanout_exec::shell::PowerShell;
use fanout_exec::shell::powershell::{
    escape_arguments, execute_process, execute_process_snippet, is_powershell_file,
    process_from_extension, ps_task_snippet, run_script_snippet, set_env_snippet,
    shell_init_snippet, try_catch_snippet,
};
use fanout_exec::target::Interpreter;
use fanout_exec::{Connection, ExecError, Target, remote_basename};

use super::task_environment;
use crate::action::{Action, ActionKind, ActionOptions, InputMethod, TaskSpec};
use crate::result::TargetResult;

pub(crate) async fn run(
    conn: &mut dyn Connection,
    target: &Arc<Target>,
    action: &Action,
    options: &ActionOptions,
) -> Result<TargetResult, ExecError> {
    let shell = PowerShell::new(target);
    if let Some(user) = &options.run_as {
        debug!(target_name = %target.name, run_as = %user, "ignoring run-as for PowerShell target");
    }

    match action {
        Action::Command { command } => {
            let mut script = env_lines(&options.env);
            script.push_str(&execute_process_snippet(command));
            let output = shell.execute(conn, &script).await?;
            Ok(TargetResult::for_command(
                Arc::clone(target),
                ActionKind::Command,
                command.clone(),
                &output,
            ))
        }
        Action::Script { path, arguments } => {
            let dir = shell.make_tempdir(conn).await?;
            let outcome = run_script(conn, &shell, &dir, target, path, arguments, &options.env).await;
            shell.cleanup(conn, &dir).await;
            outcome
        }
        Action::Task { task, arguments } => {
            let dir = shell.make_tempdir(conn).await?;
            let outcome = run_task(conn, &shell, &dir, target, task, arguments).await;
            shell.cleanup(conn, &dir).await;
            outcome
        }
        Action::Upload {
            source,
            destination,
        } => {
            conn.upload(source, destination).await?;
            Ok(TargetResult::for_upload(Arc::clone(target), source, destination))
        }
        Action::Download {
            source,
            destination,
        } => {
            let local_dir = destination.join(target.safe_name());
            conn.download(source, &local_dir).await?;
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

fn env_lines(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(name, value)| set_env_snippet(name, value))
        .collect()
}

/// Program and leading arguments that run `remote`
fn program_for(target: &Target, remote: &str) -> (String, Vec<String>) {
    match target.options.interpreter_for(remote).map(Interpreter::argv) {
        Some(mut argv) if !argv.is_empty() => {
            let program = argv.remove(0);
            argv.push(remote.to_string());
            (program, argv)
        }
        _ => process_from_extension(remote),
    }
}

async fn run_script(
    conn: &mut dyn Connection,
    shell: &PowerShell,
    dir: &str,
    target: &Arc<Target>,
    script: &Path,
    arguments: &[String],
    env: &BTreeMap<String, String>,
) -> Result<TargetResult, ExecError> {
    let remote = shell.write_executable(conn, dir, script, None).await?;

    let mut body = env_lines(env);
    if is_powershell_file(&remote) && target.options.interpreter_for(&remote).is_none() {
        body.push_str(&run_script_snippet(arguments, &remote));
    } else {
        let (program, mut args) = program_for(target, &remote);
        args.extend(escape_arguments(arguments));
        body.push_str(&execute_process(&program, &args, None));
    }

    let output = shell.execute(conn, &body).await?;
    Ok(TargetResult::for_command(
        Arc::clone(target),
        ActionKind::Script,
        script.display().to_string(),
        &output,
    ))
}

async fn run_task(
    conn: &mut dyn Connection,
    shell: &PowerShell,
    dir: &str,
    target: &Arc<Target>,
    task: &TaskSpec,
    arguments: &Map<String, Value>,
) -> Result<TargetResult, ExecError> {
    let executable = task.executable_name().unwrap_or_default();
    let input = task.input_method.unwrap_or(if is_powershell_file(executable) {
        InputMethod::Powershell
    } else {
        InputMethod::Both
    });
    let mut arguments = arguments.clone();

    let task_dir = if task.files.is_empty() {
        dir.to_string()
    } else {
        arguments.insert("_installdir".to_string(), json!(dir));
        let task_dir = join(dir, &task.tasks_dir());
        let mut dirs = vec![task_dir.clone()];
        dirs.extend(task.files.iter().filter_map(|f| {
            Path::new(&f.name)
                .parent()
                .and_then(Path::to_str)
                .filter(|p| !p.is_empty())
                .map(|p| join(dir, p))
        }));
        shell.mkdirs(conn, &dirs).await?;
        for file in &task.files {
            conn.upload(&file.path, &join(dir, &file.name)).await?;
        }
        task_dir
    };

    let remote = shell.write_executable(conn, &task_dir, &task.executable, None).await?;
    shell.init(conn).await?;

    let stdin = input
        .uses_stdin()
        .then(|| Value::Object(arguments.clone()).to_string());

    let mut script = String::new();
    if input.uses_environment() {
        script.push_str(&env_lines(&task_environment(&arguments)));
    }

    if is_powershell_file(&remote) && stdin.is_none() {
        script.push_str(shell_init_snippet());
        script.push('\n');
        if input == InputMethod::Powershell {
            script.push_str(&ps_task_snippet(&remote, &Value::Object(arguments)));
        } else {
            script.push_str(&try_catch_snippet(&remote));
        }
    } else {
        let (program, args) = program_for(target, &remote);
        script.push_str(&execute_process(&program, &args, stdin.as_deref()));
    }

    debug!(task = %task.name, input = ?input, "running task");
    let output = shell.execute(conn, &script).await?;
    Ok(TargetResult::for_task(Arc::clone(target), task.name.clone(), &output))
}

/// Join a relative `/`-separated path onto a Windows directory
fn join(dir: &str, relative: &str) -> String {
    format!(
        "{}\\{}",
        dir.trim_end_matches('\\'),
        relative.trim_start_matches('/').replace('/', "\\")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_exec::TransportKind;
    use fanout_exec::target::TargetOptions;

    #[test]
    fn test_join() {
        assert_eq!(join(r"C:\Temp\abc", "mod/tasks"), r"C:\Temp\abc\mod\tasks");
        assert_eq!(join(r"C:\Temp\abc\", "mod/files/a.txt"), r"C:\Temp\abc\mod\files\a.txt");
    }

    #[test]
    fn test_program_for_prefers_interpreter() {
        let mut options = TargetOptions::default();
        options.interpreters.insert(
            ".py".to_string(),
            Interpreter::Argv(vec!["python.exe".to_string(), "-u".to_string()]),
        );
        let target = Target::new("w", TransportKind::Winrm).with_options(options);

        let (program, args) = program_for(&target, r"C:\t\run.py");
        assert_eq!(program, "python.exe");
        assert_eq!(args, vec!["-u".to_string(), r"C:\t\run.py".to_string()]);

        let (program, args) = program_for(&target, r"C:\t\run.rb");
        assert_eq!(program, "ruby.exe");
        assert_eq!(args, vec!["-S".to_string(), r#""C:\t\run.rb""#.to_string()]);
    }

    #[test]
    fn test_env_lines() {
        let mut env = BTreeMap::new();
        env.insert("PT_name".to_string(), "web".to_string());
        let lines = env_lines(&env);
        assert!(lines.starts_with("[Environment]::SetEnvironmentVariable('PT_name'"));
    }
}
