//! `Executor`: bounded-concurrency dispatch of one action to many targets
//!
//! Each target runs as its own tokio task holding a semaphore permit. The
//! batch waits for every task, so the returned [`ResultSet`] always holds
//! one result per target, in the order the targets were given.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use fanout_exec::{ExecError, Target};

use crate::action::{Action, ActionKind, ActionOptions, TaskSpec};
use crate::config::ExecutorConfig;
use crate::error::CoreError;
use crate::event::{Event, EventSink, NoopSink};
use crate::factory::{ConnectionFactory, DefaultConnectionFactory};
use crate::pipeline;
use crate::pool::{self, ConnectionPool};
use crate::result::{ResultSet, TargetResult};

/// Runs actions against many targets
pub struct Executor {
    config: ExecutorConfig,
    factory: Arc<dyn ConnectionFactory>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl Executor {
    /// Create an executor using the built-in transports and no event sink
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            factory: Arc::new(DefaultConnectionFactory),
            sink: Arc::new(NoopSink),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the connection factory
    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Publish events to `sink`
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Abandon queued targets and abort running pipelines
    ///
    /// Affected targets get a failed result of kind `fanout/cancelled`; results that
    /// were already produced are kept.
    pub fn shutdown(&self) {
        info!("executor shutting down");
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a shell command on every target
    ///
    /// # Errors
    /// Returns `CoreError` if `targets` is empty or the command is blank
    pub async fn run_command(
        &self,
        targets: &[Target],
        command: impl Into<String>,
        options: ActionOptions,
    ) -> Result<ResultSet, CoreError> {
        let action = Action::Command {
            command: command.into(),
        };
        self.run(targets, action, options).await
    }

    /// Upload and run a local script on every target
    ///
    /// # Errors
    /// Returns `CoreError` if `targets` is empty or the script is not a file
    pub async fn run_script(
        &self,
        targets: &[Target],
        path: impl Into<PathBuf>,
        arguments: Vec<String>,
        options: ActionOptions,
    ) -> Result<ResultSet, CoreError> {
        let action = Action::Script {
            path: path.into(),
            arguments,
        };
        self.run(targets, action, options).await
    }

    /// Run a task with JSON parameters on every target
    ///
    /// # Errors
    /// Returns `CoreError` if `targets` is empty or the task is incomplete
    pub async fn run_task(
        &self,
        targets: &[Target],
        task: TaskSpec,
        arguments: Map<String, Value>,
        options: ActionOptions,
    ) -> Result<ResultSet, CoreError> {
        self.run(targets, Action::Task { task, arguments }, options)
            .await
    }

    /// Copy a local file or directory to every target
    ///
    /// # Errors
    /// Returns `CoreError` if `targets` is empty or the source is missing
    pub async fn upload_file(
        &self,
        targets: &[Target],
        source: impl Into<PathBuf>,
        destination: impl Into<String>,
        options: ActionOptions,
    ) -> Result<ResultSet, CoreError> {
        let action = Action::Upload {
            source: source.into(),
            destination: destination.into(),
        };
        self.run(targets, action, options).await
    }

    /// Copy a remote file or directory from every target
    ///
    /// Each copy lands in `<destination>/<target name>/`.
    ///
    /// # Errors
    /// Returns `CoreError` if `targets` is empty or a path is blank
    pub async fn download_file(
        &self,
        targets: &[Target],
        source: impl Into<String>,
        destination: impl Into<PathBuf>,
        options: ActionOptions,
    ) -> Result<ResultSet, CoreError> {
        let action = Action::Download {
            source: source.into(),
            destination: destination.into(),
        };
        self.run(targets, action, options).await
    }

    /// Run `action` on every target
    ///
    /// Per-target failures become failed results; only contract violations
    /// are returned as errors, before anything is dispatched.
    ///
    /// # Errors
    /// Returns `CoreError::EmptyTargets` or `CoreError::InvalidAction`
    #[instrument(skip_all, fields(action = %action.kind(), targets = targets.len()))]
    pub async fn run(
        &self,
        targets: &[Target],
        action: Action,
        mut options: ActionOptions,
    ) -> Result<ResultSet, CoreError> {
        if targets.is_empty() {
            return Err(CoreError::EmptyTargets);
        }
        action.validate()?;
        if options.run_as.is_none() {
            options.run_as.clone_from(&self.config.run_as);
        }

        let kind = action.kind();
        let object = action.object();
        let targets: Vec<Arc<Target>> = targets
            .iter()
            .map(|t| Arc::new(self.config.apply_defaults(t)))
            .collect();

        self.sink.publish(Event::StepStart {
            action: kind,
            object: object.clone(),
            targets: targets.iter().map(|t| t.name.clone()).collect(),
            at: Utc::now(),
        });

        let started = Instant::now();
        let action = Arc::new(action);
        let options = Arc::new(options);
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&self.factory)));
        let semaphore =
            (self.config.concurrency > 0).then(|| Arc::new(Semaphore::new(self.config.concurrency)));

        let handles = targets.iter().map(|target| {
            let unit = Unit {
                target: Arc::clone(target),
                action: Arc::clone(&action),
                options: Arc::clone(&options),
                pool: Arc::clone(&pool),
                sink: Arc::clone(&self.sink),
                cancel: self.cancel.clone(),
            };
            let semaphore = semaphore.clone();
            tokio::spawn(async move { unit.dispatch(semaphore).await })
        });

        let results: Vec<TargetResult> = join_all(handles)
            .await
            .into_iter()
            .zip(&targets)
            .map(|(joined, target)| {
                joined.unwrap_or_else(|e| {
                    let err = ExecError::Exec(format!("pipeline task failed: {e}"));
                    TargetResult::from_error(Arc::clone(target), kind, object.clone(), &err)
                })
            })
            .collect();

        pool.drain().await;

        let result_set = ResultSet::new(results, started.elapsed());
        let failed = result_set.error_set().count();
        let duration_ms = u64::try_from(result_set.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            duration_ms,
            "Ran {} '{}' on {} target(s) with {} failure(s)",
            kind,
            object,
            result_set.count(),
            failed
        );
        self.sink.publish(Event::StepFinish {
            action: kind,
            object,
            succeeded: result_set.count() - failed,
            failed,
            duration_ms,
            at: Utc::now(),
        });

        Ok(result_set)
    }
}

/// One target's share of a batch
struct Unit {
    target: Arc<Target>,
    action: Arc<Action>,
    options: Arc<ActionOptions>,
    pool: Arc<ConnectionPool>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl Unit {
    async fn dispatch(self, semaphore: Option<Arc<Semaphore>>) -> TargetResult {
        let _permit = match semaphore {
            Some(semaphore) => tokio::select! {
                biased;
                () = self.cancel.cancelled() => return self.cancelled(),
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return self.cancelled(),
                },
            },
            None => None,
        };
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }

        let kind = self.action.kind();
        self.sink.publish(Event::NodeStart {
            target: self.target.name.clone(),
            action: kind,
            at: Utc::now(),
        });

        let result = self.execute().await;

        self.sink.publish(Event::NodeResult {
            target: self.target.name.clone(),
            action: kind,
            status: result.status().to_string(),
            result: serde_json::to_value(&result).unwrap_or_default(),
            at: Utc::now(),
        });
        result
    }

    async fn execute(&self) -> TargetResult {
        let mut conn = match self.pool.checkout(&self.target).await {
            Ok(conn) => conn,
            Err(e) => return self.failed(&e),
        };

        let finished = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            result = pipeline::run(conn.as_mut(), &self.target, &self.action, &self.options) => Some(result),
        };

        match finished {
            Some(result) => {
                self.pool.checkin(conn).await;
                result
            }
            None => {
                warn!(target_name = %self.target.name, "pipeline aborted");
                pool::close(conn.as_mut()).await;
                self.cancelled()
            }
        }
    }

    fn kind(&self) -> ActionKind {
        self.action.kind()
    }

    fn failed(&self, err: &ExecError) -> TargetResult {
        TargetResult::from_error(Arc::clone(&self.target), self.kind(), self.action.object(), err)
    }

    fn cancelled(&self) -> TargetResult {
        self.failed(&ExecError::Cancelled)
    }
}
