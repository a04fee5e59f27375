//! Per-target pipelines
//!
//! A pipeline takes one checked-out connection through connect, the action
//! itself and cleanup, and always ends in a [`TargetResult`]. Errors never
//! leave the pipeline.

pub mod posix;
pub mod windows;

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, instrument};

use fanout_exec::{Connection, ConnectionState, ExecError, ShellKind, Target};

use crate::action::{Action, ActionOptions};
use crate::result::TargetResult;

/// Run `action` on `conn`, connecting first if needed
#[instrument(skip_all, fields(target_name = %target.name, action = %action.kind()))]
pub async fn run(
    conn: &mut dyn Connection,
    target: &Arc<Target>,
    action: &Action,
    options: &ActionOptions,
) -> TargetResult {
    match execute(conn, target, action, options).await {
        Ok(result) => {
            debug!(ok = result.ok(), "pipeline finished");
            result
        }
        Err(e) => {
            error!(
                error = %e,
                issue_code = e.issue_code(),
                retryable = e.is_retryable(),
                "pipeline failed"
            );
            TargetResult::from_error(Arc::clone(target), action.kind(), action.object(), &e)
        }
    }
}

async fn execute(
    conn: &mut dyn Connection,
    target: &Arc<Target>,
    action: &Action,
    options: &ActionOptions,
) -> Result<TargetResult, ExecError> {
    if conn.state() != ConnectionState::Connected {
        conn.connect().await?;
    }
    match conn.shell_kind() {
        ShellKind::Posix => posix::run(conn, target, action, options).await,
        ShellKind::PowerShell => windows::run(conn, target, action, options).await,
    }
}

/// File name of a local path as UTF-8
pub(crate) fn local_file_name(path: &Path) -> Result<&str, ExecError> {
    path.file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ExecError::Validation(format!("invalid file name: {}", path.display())))
}

/// Task parameters as `PT_<name>` variables; non-string values are JSON
pub(crate) fn task_environment(
    arguments: &serde_json::Map<String, serde_json::Value>,
) -> std::collections::BTreeMap<String, String> {
    arguments
        .iter()
        .map(|(name, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (format!("PT_{name}"), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_environment() {
        let args = json!({"name": "web", "count": 3, "tags": ["a"]});
        let env = task_environment(args.as_object().unwrap());
        assert_eq!(env["PT_name"], "web");
        assert_eq!(env["PT_count"], "3");
        assert_eq!(env["PT_tags"], r#"["a"]"#);
    }
}
