//! Executor settings

use serde::{Deserialize, Serialize};

use fanout_exec::Target;

/// Settings shared by every batch an executor runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of target pipelines running at once; 0 is unbounded
    pub concurrency: usize,
    /// Default log filter for the binary
    pub log_level: String,
    /// Run-as user for calls that do not set one; overrides the target's
    pub run_as: Option<String>,
    /// Default tmpdir for targets that do not set one
    pub tmpdir: Option<String>,
    /// Default cleanup setting for targets that do not set one
    pub cleanup: Option<bool>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            log_level: "info".to_string(),
            run_as: None,
            tmpdir: None,
            cleanup: None,
        }
    }
}

impl ExecutorConfig {
    /// Copy of `target` with executor defaults filled in
    #[must_use]
    pub fn apply_defaults(&self, target: &Target) -> Target {
        let mut target = target.clone();
        if target.options.tmpdir.is_none() {
            target.options.tmpdir.clone_from(&self.tmpdir);
        }
        if target.options.cleanup.is_none() {
            target.options.cleanup = self.cleanup;
        }
        target
    }
}
