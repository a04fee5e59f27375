//! Action payloads accepted by the executor

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Kind of action, as recorded on every result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Command,
    Script,
    Task,
    Upload,
    Download,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Script => "script",
            Self::Task => "task",
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How task parameters reach the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMethod {
    /// JSON object on stdin
    Stdin,
    /// `PT_<name>` environment variables
    Environment,
    /// Both stdin and environment
    Both,
    /// Named parameters of a PowerShell script
    Powershell,
}

impl InputMethod {
    /// Whether parameters are written to stdin
    #[must_use]
    pub fn uses_stdin(self) -> bool {
        matches!(self, Self::Stdin | Self::Both)
    }

    /// Whether parameters are exported as environment variables
    #[must_use]
    pub fn uses_environment(self) -> bool {
        matches!(self, Self::Environment | Self::Both)
    }
}

/// An extra file shipped with a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFile {
    /// Path relative to the module root, e.g. `mymod/files/helper.sh`
    pub name: String,
    /// Local file
    pub path: PathBuf,
}

/// A packaged task: one executable plus optional support files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Qualified name, `module::task`
    pub name: String,
    /// Local path of the executable
    pub executable: PathBuf,
    /// Parameter delivery; defaults per shell
    #[serde(default)]
    pub input_method: Option<InputMethod>,
    /// Support files
    #[serde(default)]
    pub files: Vec<TaskFile>,
}

impl TaskSpec {
    /// Create a task with no support files
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            input_method: None,
            files: Vec::new(),
        }
    }

    /// Module the task belongs to
    #[must_use]
    pub fn module_name(&self) -> &str {
        self.name.split("::").next().unwrap_or(&self.name)
    }

    /// Remote-relative directory holding the module's tasks
    #[must_use]
    pub fn tasks_dir(&self) -> String {
        format!("{}/tasks", self.module_name())
    }

    /// File name of the executable
    #[must_use]
    pub fn executable_name(&self) -> Option<&str> {
        self.executable.file_name().and_then(|n| n.to_str())
    }
}

/// Options shared by every action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionOptions {
    /// Environment variables for commands and scripts
    pub env: BTreeMap<String, String>,
    /// Run-as user overriding the executor and target defaults
    pub run_as: Option<String>,
    /// Return failed results instead of a `RunFailure`
    pub catch_errors: bool,
}

/// One logical action run against every target of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Command {
        command: String,
    },
    Script {
        path: PathBuf,
        arguments: Vec<String>,
    },
    Task {
        task: TaskSpec,
        arguments: serde_json::Map<String, serde_json::Value>,
    },
    Upload {
        source: PathBuf,
        destination: String,
    },
    Download {
        source: String,
        destination: PathBuf,
    },
}

impl Action {
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Command { .. } => ActionKind::Command,
            Self::Script { .. } => ActionKind::Script,
            Self::Task { .. } => ActionKind::Task,
            Self::Upload { .. } => ActionKind::Upload,
            Self::Download { .. } => ActionKind::Download,
        }
    }

    /// What the action acts on: the command, script, task name or source
    #[must_use]
    pub fn object(&self) -> String {
        match self {
            Self::Command { command } => command.clone(),
            Self::Script { path, .. } => path.display().to_string(),
            Self::Task { task, .. } => task.name.clone(),
            Self::Upload { source, .. } => source.display().to_string(),
            Self::Download { source, .. } => source.clone(),
        }
    }

    /// Check the payload before dispatch
    ///
    /// # Errors
    /// Returns `CoreError::InvalidAction` naming the missing or bad field
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::Command { command } => {
                if command.trim().is_empty() {
                    return Err(CoreError::InvalidAction("command is empty".to_string()));
                }
            }
            Self::Script { path, .. } => require_file(path, "script")?,
            Self::Task { task, .. } => {
                if task.name.is_empty() {
                    return Err(CoreError::InvalidAction("task name is empty".to_string()));
                }
                require_file(&task.executable, "task executable")?;
                for file in &task.files {
                    if file.name.is_empty() || file.name.starts_with('/') || file.name.contains("..") {
                        return Err(CoreError::InvalidAction(format!(
                            "task file name '{}' must be a relative path",
                            file.name
                        )));
                    }
                    require_file(&file.path, "task file")?;
                }
            }
            Self::Upload {
                source,
                destination,
            } => {
                if !source.exists() {
                    return Err(CoreError::InvalidAction(format!(
                        "upload source {} does not exist",
                        source.display()
                    )));
                }
                if destination.is_empty() {
                    return Err(CoreError::InvalidAction(
                        "upload destination is empty".to_string(),
                    ));
                }
            }
            Self::Download {
                source,
                destination,
            } => {
                if source.is_empty() {
                    return Err(CoreError::InvalidAction("download source is empty".to_string()));
                }
                if destination.as_os_str().is_empty() {
                    return Err(CoreError::InvalidAction(
                        "download destination is empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn require_file(path: &Path, what: &str) -> Result<(), CoreError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(CoreError::InvalidAction(format!(
            "{what} {} is not a file",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tasks_dir() {
        let task = TaskSpec::new("mymod::init", "/tmp/init.sh");
        assert_eq!(task.module_name(), "mymod");
        assert_eq!(task.tasks_dir(), "mymod/tasks");
        assert_eq!(task.executable_name(), Some("init.sh"));

        assert_eq!(TaskSpec::new("solo", "x").tasks_dir(), "solo/tasks");
    }

    #[test]
    fn test_input_methods() {
        assert!(InputMethod::Both.uses_stdin() && InputMethod::Both.uses_environment());
        assert!(!InputMethod::Environment.uses_stdin());
        assert!(!InputMethod::Powershell.uses_stdin());
        assert!(!InputMethod::Powershell.uses_environment());
    }

    #[test]
    fn test_empty_command_is_invalid() {
        let action = Action::Command {
            command: "  ".to_string(),
        };
        assert!(matches!(action.validate(), Err(CoreError::InvalidAction(_))));
    }

    #[test]
    fn test_missing_script_is_invalid() {
        let action = Action::Script {
            path: PathBuf::from("/nonexistent/fanout/script.sh"),
            arguments: vec![],
        };
        assert!(action.validate().is_err());
    }

    #[test]
    fn test_task_file_must_be_relative() {
        let exe = std::env::temp_dir().join(format!("fanout-task-{}.sh", uuid::Uuid::new_v4()));
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();

        let mut task = TaskSpec::new("m::t", &exe);
        task.files.push(TaskFile {
            name: "../escape".to_string(),
            path: exe.clone(),
        });
        let action = Action::Task {
            task,
            arguments: serde_json::Map::new(),
        };
        assert!(action.validate().is_err());

        std::fs::remove_file(&exe).unwrap();
    }

    #[test]
    fn test_kind_and_object() {
        let action = Action::Download {
            source: "/etc/hosts".to_string(),
            destination: PathBuf::from("out"),
        };
        assert_eq!(action.kind(), ActionKind::Download);
        assert_eq!(action.object(), "/etc/hosts");
        assert_eq!(action.kind().to_string(), "download");
    }
}
