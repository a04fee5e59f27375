//! Per-target results and their aggregation

use std::ops::Index;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};

use fanout_exec::{CommandOutput, ExecError, Target};

use crate::action::ActionKind;
use crate::error::RunFailure;

/// Structured failure attached to a result as `_error`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultError {
    pub kind: String,
    pub issue_code: String,
    pub msg: String,
    pub details: Value,
}

impl ResultError {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let field = |key: &str| obj.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        Some(Self {
            kind: field("kind"),
            issue_code: field("issue_code"),
            msg: field("msg"),
            details: obj.get("details").cloned().unwrap_or_else(|| json!({})),
        })
    }

    fn to_value(&self) -> Value {
        json!({
            "kind": self.kind,
            "issue_code": self.issue_code,
            "msg": self.msg,
            "details": self.details,
        })
    }
}

/// Outcome of one action on one target
#[derive(Debug, Clone)]
pub struct TargetResult {
    target: Arc<Target>,
    action: ActionKind,
    object: String,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    value: Map<String, Value>,
    error: Option<ResultError>,
}

impl TargetResult {
    fn new(target: Arc<Target>, action: ActionKind, object: impl Into<String>) -> Self {
        Self {
            target,
            action,
            object: object.into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            value: Map::new(),
            error: None,
        }
    }

    fn with_error(mut self, error: ResultError) -> Self {
        self.value.insert("_error".to_string(), error.to_value());
        self.error = Some(error);
        self
    }

    fn capture(mut self, output: &CommandOutput) -> Self {
        self.stdout = output.stdout_str();
        self.stderr = output.stderr_str();
        self.exit_code = Some(output.exit_code);
        self
    }

    /// Result of a command or script run
    ///
    /// The value is `{stdout, stderr, exit_code}`; a non-zero exit adds a
    /// `COMMAND_ERROR`.
    #[must_use]
    pub fn for_command(
        target: Arc<Target>,
        action: ActionKind,
        object: impl Into<String>,
        output: &CommandOutput,
    ) -> Self {
        let mut result = Self::new(target, action, object).capture(output);
        result.value.insert("stdout".to_string(), json!(result.stdout));
        result.value.insert("stderr".to_string(), json!(result.stderr));
        result.value.insert("exit_code".to_string(), json!(output.exit_code));

        if output.success() {
            result
        } else {
            result.with_error(ResultError {
                kind: "fanout/command-error".to_string(),
                issue_code: "COMMAND_ERROR".to_string(),
                msg: format!("The command failed with exit code {}", output.exit_code),
                details: json!({ "exit_code": output.exit_code }),
            })
        }
    }

    /// Result of a task run
    ///
    /// Stdout that parses as a JSON object becomes the value; anything else
    /// is kept as `_output`. A reported `_error` fails the result whatever
    /// the exit code; otherwise a non-zero exit adds a `TASK_ERROR`.
    #[must_use]
    pub fn for_task(target: Arc<Target>, task_name: impl Into<String>, output: &CommandOutput) -> Self {
        let mut result = Self::new(target, ActionKind::Task, task_name).capture(output);
        result.value = match serde_json::from_str::<Value>(&result.stdout) {
            Ok(Value::Object(map)) => map,
            _ => {
                let mut map = Map::new();
                map.insert("_output".to_string(), json!(result.stdout));
                map
            }
        };

        if let Some(reported) = result.value.get("_error").and_then(ResultError::from_value) {
            result.error = Some(reported);
            return result;
        }
        if output.success() {
            return result;
        }

        let msg = if result.stdout.trim().is_empty() {
            format!(
                "The task failed with exit code {}:\n{}",
                output.exit_code, result.stderr
            )
        } else {
            format!("The task failed with exit code {}", output.exit_code)
        };
        result.with_error(ResultError {
            kind: "fanout/task-error".to_string(),
            issue_code: "TASK_ERROR".to_string(),
            msg,
            details: json!({ "exit_code": output.exit_code }),
        })
    }

    /// Result of a successful upload
    #[must_use]
    pub fn for_upload(target: Arc<Target>, source: &Path, destination: &str) -> Self {
        let message = format!(
            "Uploaded '{}' to '{}:{destination}'",
            source.display(),
            target.host()
        );
        let mut result = Self::new(target, ActionKind::Upload, source.display().to_string());
        result.value.insert("_output".to_string(), json!(message));
        result
    }

    /// Result of a successful download; `path` is the local copy
    #[must_use]
    pub fn for_download(target: Arc<Target>, source: &str, destination: &Path, path: &Path) -> Self {
        let message = format!(
            "Downloaded '{}:{source}' to '{}'",
            target.host(),
            destination.display()
        );
        let mut result = Self::new(target, ActionKind::Download, source);
        result.value.insert("_output".to_string(), json!(message));
        result
            .value
            .insert("path".to_string(), json!(path.display().to_string()));
        result
    }

    /// Failed result for a transport or pipeline error
    #[must_use]
    pub fn from_error(
        target: Arc<Target>,
        action: ActionKind,
        object: impl Into<String>,
        error: &ExecError,
    ) -> Self {
        Self::new(target, action, object).with_error(ResultError {
            kind: error.kind().to_string(),
            issue_code: error.issue_code().to_string(),
            msg: error.to_string(),
            details: json!({}),
        })
    }

    #[must_use]
    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    /// Name of the target
    #[must_use]
    pub fn name(&self) -> &str {
        &self.target.name
    }

    #[must_use]
    pub fn action(&self) -> ActionKind {
        self.action
    }

    #[must_use]
    pub fn object(&self) -> &str {
        &self.object
    }

    #[must_use]
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    #[must_use]
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Exit code, absent when the action never ran a command to completion
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    #[must_use]
    pub fn value(&self) -> &Map<String, Value> {
        &self.value
    }

    #[must_use]
    pub fn error(&self) -> Option<&ResultError> {
        self.error.as_ref()
    }

    /// Whether the action succeeded
    #[must_use]
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }

    #[must_use]
    pub fn status(&self) -> &'static str {
        if self.ok() { "success" } else { "failure" }
    }
}

impl Serialize for TargetResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(5))?;
        map.serialize_entry("target", &self.target.name)?;
        map.serialize_entry("action", &self.action)?;
        map.serialize_entry("object", &self.object)?;
        map.serialize_entry("status", self.status())?;
        map.serialize_entry("value", &self.value)?;
        map.end()
    }
}

/// Results of one batch, in input target order
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    results: Vec<TargetResult>,
    elapsed: Duration,
}

impl ResultSet {
    #[must_use]
    pub fn new(results: Vec<TargetResult>, elapsed: Duration) -> Self {
        Self { results, elapsed }
    }

    /// Whether every result succeeded
    #[must_use]
    pub fn ok(&self) -> bool {
        self.results.iter().all(TargetResult::ok)
    }

    #[must_use]
    pub fn ok_set(&self) -> ResultSet {
        self.filtered(TargetResult::ok)
    }

    #[must_use]
    pub fn error_set(&self) -> ResultSet {
        self.filtered(|r| !r.ok())
    }

    fn filtered(&self, keep: impl Fn(&TargetResult) -> bool) -> ResultSet {
        ResultSet {
            results: self.results.iter().filter(|r| keep(r)).cloned().collect(),
            elapsed: self.elapsed,
        }
    }

    /// First result for the target named `name`
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&TargetResult> {
        self.results.iter().find(|r| r.name() == name)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.results.iter().map(TargetResult::name).collect()
    }

    #[must_use]
    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.results.iter().map(|r| Arc::clone(r.target())).collect()
    }

    #[must_use]
    pub fn first(&self) -> Option<&TargetResult> {
        self.results.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TargetResult> {
        self.results.iter()
    }

    /// Wall time of the batch
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Return the set, or a `RunFailure` if a target failed and errors are
    /// not caught
    ///
    /// # Errors
    /// Returns `RunFailure` carrying the whole set when `catch_errors` is
    /// false and at least one result failed
    pub fn into_result(self, catch_errors: bool) -> Result<ResultSet, RunFailure> {
        if catch_errors || self.ok() {
            Ok(self)
        } else {
            Err(RunFailure { result_set: self })
        }
    }
}

impl Index<usize> for ResultSet {
    type Output = TargetResult;

    fn index(&self, index: usize) -> &Self::Output {
        &self.results[index]
    }
}

impl IntoIterator for ResultSet {
    type Item = TargetResult;
    type IntoIter = std::vec::IntoIter<TargetResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a TargetResult;
    type IntoIter = std::slice::Iter<'a, TargetResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

impl Serialize for ResultSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.results.len()))?;
        for result in &self.results {
            seq.serialize_element(result)?;
        }
        seq.end()
    }
}
