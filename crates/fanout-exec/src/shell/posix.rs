//! POSIX `sh` command construction and execution

use std::collections::BTreeMap;

use tracing::debug;
use uuid::Uuid;

use super::Cmd;
use crate::connection::Connection;
use crate::driver;
use crate::error::ExecError;
use crate::result::CommandOutput;
use crate::sudo::{SUDO_PROMPT, SudoEscalation};
use crate::target::Target;

/// Quote one word for `sh`
///
/// Words made only of safe characters are left alone; anything else is
/// single-quoted with embedded quotes spliced as `'\''`.
#[must_use]
pub fn quote(word: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_-./:=@,+%".contains(c);
    if !word.is_empty() && word.chars().all(safe) {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Quote and join argv words
#[must_use]
pub fn join<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Options for one command run through [`PosixShell::execute`]
#[derive(Debug, Default, Clone)]
pub struct ExecuteOptions<'a> {
    /// Allow escalation to the run-as user
    pub sudoable: bool,
    /// Run-as user overriding the shell's
    pub run_as: Option<&'a str>,
    /// Interpreter argv prepended to the command
    pub interpreter: Option<Vec<String>>,
    /// Environment variables prefixed to the command
    pub environment: Option<&'a BTreeMap<String, String>>,
    /// Bytes delivered on stdin
    pub stdin: Option<&'a [u8]>,
}

/// POSIX shell for one target
///
/// Holds the escalation settings of the target and a fresh `sudo-id`.
#[derive(Clone)]
pub struct PosixShell {
    target: String,
    run_as: Option<String>,
    sudo_id: String,
    sudo_password: Option<String>,
    sudo_executable: String,
    run_as_command: Option<Vec<String>>,
    tty: bool,
}

impl PosixShell {
    /// Create a shell for `target`
    #[must_use]
    pub fn new(target: &Target) -> Self {
        Self {
            target: target.name.clone(),
            run_as: target.options.run_as.clone(),
            sudo_id: Uuid::new_v4().to_string(),
            sudo_password: target.sudo_password().map(str::to_string),
            sudo_executable: target
                .options
                .sudo_executable
                .clone()
                .unwrap_or_else(|| "sudo".to_string()),
            run_as_command: target.options.run_as_command.clone(),
            tty: target.options.tty,
        }
    }

    /// Override the run-as user for this shell; `None` keeps the target's
    #[must_use]
    pub fn with_run_as(mut self, run_as: Option<String>) -> Self {
        if run_as.is_some() {
            self.run_as = run_as;
        }
        self
    }

    /// Effective run-as user
    #[must_use]
    pub fn run_as(&self) -> Option<&str> {
        self.run_as.as_deref()
    }

    /// Marker echoed once sudo lets the command run
    #[must_use]
    pub fn sudo_id(&self) -> &str {
        &self.sudo_id
    }

    /// Whether commands get a pseudo-terminal
    #[must_use]
    pub fn tty(&self) -> bool {
        self.tty
    }

    /// Build the literal command line
    ///
    /// # Arguments
    /// * `command` - The command to run
    /// * `options` - Interpreter, environment, stdin and escalation options
    /// * `user` - User the connection is logged in as
    /// * `reset_cwd` - Whether escalated commands start with `cd;`
    #[must_use]
    pub fn build(&self, command: &Cmd, options: &ExecuteOptions<'_>, user: &str, reset_cwd: bool) -> String {
        let mut command_str = match command {
            Cmd::Line(line) => line.clone(),
            Cmd::Argv(argv) => join(argv),
        };

        if let Some(interpreter) = &options.interpreter {
            command_str = format!("{} {}", join(interpreter), command_str);
        }

        let environment = options.environment.filter(|env| !env.is_empty());
        if let Some(env) = environment {
            let decls = env
                .iter()
                .map(|(k, v)| format!("{k}={}", quote(v)))
                .collect::<Vec<_>>()
                .join(" ");
            command_str = format!("{decls} {command_str}");
        }

        let run_as = options.run_as.or(self.run_as.as_deref());
        let Some(run_as) = run_as.filter(|u| options.sudoable && *u != user) else {
            return command_str;
        };

        let escalate_str = match &self.run_as_command {
            Some(custom) => {
                let mut argv = custom.clone();
                argv.push(run_as.to_string());
                join(&argv)
            }
            None => {
                let mut argv = vec![
                    self.sudo_executable.as_str(),
                    "-S",
                    "-H",
                    "-u",
                    run_as,
                    "-p",
                    SUDO_PROMPT,
                ];
                if environment.is_some() {
                    argv.push("-E");
                }
                join(&argv)
            }
        };

        let use_sudo = self.run_as_command.is_none();
        if use_sudo && options.stdin.is_some() {
            let cd = if reset_cwd { "cd; " } else { "" };
            let inner = format!("echo {} 1>&2; {cd}{command_str}", self.sudo_id);
            format!("{escalate_str} sh -c {}", quote(&inner))
        } else if reset_cwd {
            format!("{escalate_str} sh -c {}", quote(&format!("cd; {command_str}")))
        } else {
            format!("{escalate_str} {command_str}")
        }
    }

    /// Run a command on `conn`, escalating when required
    ///
    /// # Errors
    /// Returns the connection's error, or an escalation error if sudo refuses
    pub async fn execute(
        &self,
        conn: &mut dyn Connection,
        command: impl Into<Cmd>,
        options: ExecuteOptions<'_>,
    ) -> Result<CommandOutput, ExecError> {
        let command = command.into();
        let user = conn.user().to_string();
        let run_as = options.run_as.or(self.run_as.as_deref());
        let escalate = options.sudoable && run_as.is_some_and(|u| u != user);
        let use_sudo = escalate && self.run_as_command.is_none();

        let command_line = self.build(&command, &options, &user, conn.reset_cwd());

        // environment values may carry task parameters
        if options.environment.is_none_or(BTreeMap::is_empty) {
            debug!(target_name = %self.target, command = %command_line, "executing");
        } else {
            debug!(target_name = %self.target, run_as = ?run_as, "executing command with environment");
        }

        let process = conn.spawn(&command_line, self.tty).await?;
        if use_sudo {
            let mut sudo = SudoEscalation::new(
                self.sudo_id.clone(),
                user,
                self.target.clone(),
                self.sudo_password.clone(),
            );
            if let Some(stdin) = options.stdin {
                sudo = sudo.with_stdin(stdin.to_vec());
            }
            driver::drive(process, None, Some(&mut sudo)).await
        } else {
            driver::drive(process, options.stdin, None).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TransportKind;

    fn shell() -> PosixShell {
        let mut target = Target::new("web1", TransportKind::Ssh).with_user("deploy");
        target.options.run_as = Some("root".to_string());
        let mut shell = PosixShell::new(&target);
        shell.sudo_id = "SUDOID".to_string();
        shell
    }

    fn prompt() -> String {
        quote(SUDO_PROMPT)
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("/tmp/abc-1.sh"), "/tmp/abc-1.sh");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_not_sudoable_runs_plain() {
        let line = shell().build(&Cmd::argv(["chmod", "u+x", "/tmp/a b"]), &ExecuteOptions::default(), "deploy", false);
        assert_eq!(line, "chmod u+x '/tmp/a b'");
    }

    #[test]
    fn test_sudo_wrapping() {
        let options = ExecuteOptions {
            sudoable: true,
            ..Default::default()
        };
        let line = shell().build(&Cmd::from("whoami"), &options, "deploy", false);
        assert_eq!(line, format!("sudo -S -H -u root -p {} whoami", prompt()));
    }

    #[test]
    fn test_same_user_does_not_escalate() {
        let options = ExecuteOptions {
            sudoable: true,
            ..Default::default()
        };
        assert_eq!(shell().build(&Cmd::from("whoami"), &options, "root", false), "whoami");
    }

    #[test]
    fn test_sudo_with_stdin_echoes_marker() {
        let options = ExecuteOptions {
            sudoable: true,
            stdin: Some(b"{}"),
            ..Default::default()
        };
        let line = shell().build(&Cmd::from("/tmp/d/task.sh"), &options, "deploy", true);
        assert_eq!(
            line,
            format!(
                "sudo -S -H -u root -p {} sh -c 'echo SUDOID 1>&2; cd; /tmp/d/task.sh'",
                prompt()
            )
        );
    }

    #[test]
    fn test_reset_cwd_without_stdin() {
        let options = ExecuteOptions {
            sudoable: true,
            run_as: Some("app"),
            ..Default::default()
        };
        let line = shell().build(&Cmd::from("ls"), &options, "deploy", true);
        assert_eq!(line, format!("sudo -S -H -u app -p {} sh -c 'cd; ls'", prompt()));
    }

    #[test]
    fn test_environment_and_interpreter() {
        let env = BTreeMap::from([
            ("PT_message".to_string(), "it's here".to_string()),
            ("PT_count".to_string(), "3".to_string()),
        ]);
        let options = ExecuteOptions {
            sudoable: true,
            interpreter: Some(vec!["/usr/bin/python3".to_string()]),
            environment: Some(&env),
            ..Default::default()
        };
        let line = shell().build(&Cmd::from("/tmp/d/t.py"), &options, "deploy", false);
        assert_eq!(
            line,
            format!(
                r"sudo -S -H -u root -p {} -E PT_count=3 PT_message='it'\''s here' /usr/bin/python3 /tmp/d/t.py",
                prompt()
            )
        );
    }

    #[test]
    fn test_run_as_command() {
        let mut target = Target::new("web1", TransportKind::Ssh);
        target.options.run_as = Some("root".to_string());
        target.options.run_as_command = Some(vec!["doas".to_string(), "-u".to_string()]);
        let shell = PosixShell::new(&target);
        let options = ExecuteOptions {
            sudoable: true,
            stdin: Some(b"x"),
            ..Default::default()
        };
        assert_eq!(shell.build(&Cmd::from("id"), &options, "deploy", false), "doas -u root id");
    }

    #[test]
    fn test_fresh_sudo_id_per_shell() {
        let target = Target::new("web1", TransportKind::Ssh);
        assert_ne!(PosixShell::new(&target).sudo_id(), PosixShell::new(&target).sudo_id());
    }
}
