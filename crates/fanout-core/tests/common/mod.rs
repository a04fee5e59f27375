//! Scripted connections shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fanout_core::{ConnectionFactory, Executor, ExecutorConfig};
use fanout_exec::{
    Connection, ConnectionState, ExecError, Process, ProcessEvent, Target, TransportKind,
};

/// Everything the mock connections observed, shared across targets
#[derive(Default)]
pub struct Recorder {
    commands: Mutex<Vec<(String, String)>>,
    transfers: Mutex<Vec<(String, String)>>,
    stdin: Mutex<Vec<(String, Vec<u8>)>>,
    finished: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Commands spawned on `target`, in order
    pub fn commands(&self, target: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Number of commands on `target` containing `needle`
    pub fn count(&self, target: &str, needle: &str) -> usize {
        self.commands(target)
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    pub fn spawned(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    /// Uploads and downloads on `target`, as `"upload <src> <dst>"` lines
    pub fn transfers(&self, target: &str) -> Vec<String> {
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Bytes written to stdin on `target`, one entry per write
    pub fn stdin(&self, target: &str) -> Vec<Vec<u8>> {
        self.stdin
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Targets in the order their commands finished
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> ActiveGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        ActiveGuard(Arc::clone(self))
    }
}

struct ActiveGuard(Arc<Recorder>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How one target's mock connection behaves
#[derive(Clone, Default)]
pub struct Behavior {
    /// Error returned by `connect`
    pub connect_error: Option<ExecError>,
    /// Time every command takes
    pub delay: Duration,
    /// Exit codes for commands containing a substring
    pub exit_codes: Vec<(String, i32)>,
    /// Event streams for commands containing a substring
    pub streams: Vec<(String, Vec<ProcessEvent>)>,
}

impl Behavior {
    pub fn delayed(ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(ms),
            ..Self::default()
        }
    }

    pub fn failing_connect(error: ExecError) -> Self {
        Self {
            connect_error: Some(error),
            ..Self::default()
        }
    }

    pub fn exit(mut self, needle: &str, code: i32) -> Self {
        self.exit_codes.push((needle.to_string(), code));
        self
    }

    pub fn stream(mut self, needle: &str, events: Vec<ProcessEvent>) -> Self {
        self.streams.push((needle.to_string(), events));
        self
    }

    fn events_for(&self, command: &str) -> Vec<ProcessEvent> {
        if let Some((_, events)) = self.streams.iter().find(|(n, _)| command.contains(n.as_str())) {
            return events.clone();
        }

        let code = self
            .exit_codes
            .iter()
            .find(|(n, _)| command.contains(n.as_str()))
            .map_or(0, |(_, code)| *code);

        let mut events = Vec::new();
        if let Some(text) = command.strip_prefix("echo ") {
            events.push(ProcessEvent::Stdout(format!("{text}\n").into_bytes()));
        } else if command.starts_with("id -g") {
            events.push(ProcessEvent::Stdout(b"1000\n".to_vec()));
        }
        if code != 0 {
            events.push(ProcessEvent::Stderr(format!("mock failure of '{command}'\n").into_bytes()));
        }
        events.push(ProcessEvent::Exit(code));
        events
    }
}

pub struct MockProcess {
    target: String,
    events: VecDeque<ProcessEvent>,
    delay: Duration,
    started: bool,
    recorder: Arc<Recorder>,
    _guard: ActiveGuard,
}

#[async_trait]
impl Process for MockProcess {
    async fn next_event(&mut self) -> Result<Option<ProcessEvent>, ExecError> {
        if !self.started {
            self.started = true;
            tokio::time::sleep(self.delay).await;
        }
        let event = self.events.pop_front();
        if event.is_none() {
            self.recorder.finished.lock().unwrap().push(self.target.clone());
        }
        Ok(event)
    }

    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ExecError> {
        self.recorder
            .stdin
            .lock()
            .unwrap()
            .push((self.target.clone(), data.to_vec()));
        Ok(())
    }

    async fn close_stdin(&mut self) -> Result<(), ExecError> {
        Ok(())
    }

    async fn abort(&mut self) {
        self.events.clear();
    }
}

pub struct MockConnection {
    target: Target,
    behavior: Behavior,
    recorder: Arc<Recorder>,
    state: ConnectionState,
}

impl MockConnection {
    pub fn new(target: Target, behavior: Behavior, recorder: Arc<Recorder>) -> Self {
        Self {
            target,
            behavior,
            recorder,
            state: ConnectionState::Unconnected,
        }
    }

    fn record_transfer(&self, line: String) {
        self.recorder
            .transfers
            .lock()
            .unwrap()
            .push((self.target.name.clone(), line));
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn target(&self) -> &Target {
        &self.target
    }

    fn user(&self) -> &str {
        "deploy"
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn transport_name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&mut self) -> Result<(), ExecError> {
        self.recorder.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.behavior.connect_error.clone() {
            return Err(err);
        }
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn spawn(&mut self, command: &str, _tty: bool) -> Result<Box<dyn Process>, ExecError> {
        if self.state != ConnectionState::Connected {
            return Err(ExecError::NotConnected);
        }
        self.recorder
            .commands
            .lock()
            .unwrap()
            .push((self.target.name.clone(), command.to_string()));

        Ok(Box::new(MockProcess {
            target: self.target.name.clone(),
            events: self.behavior.events_for(command).into(),
            delay: self.behavior.delay,
            started: false,
            recorder: Arc::clone(&self.recorder),
            _guard: self.recorder.enter(),
        }))
    }

    async fn upload(&mut self, source: &Path, destination: &str) -> Result<(), ExecError> {
        self.record_transfer(format!("upload {} {destination}", source.display()));
        Ok(())
    }

    async fn download(&mut self, source: &str, destination: &Path) -> Result<(), ExecError> {
        self.record_transfer(format!("download {source} {}", destination.display()));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ExecError> {
        self.recorder.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state = ConnectionState::Disconnected;
        Ok(())
    }
}

/// Factory handing out mock connections, with per-target behavior
pub struct MockFactory {
    recorder: Arc<Recorder>,
    behaviors: HashMap<String, Behavior>,
    default: Behavior,
}

impl MockFactory {
    pub fn new(recorder: &Arc<Recorder>) -> Self {
        Self {
            recorder: Arc::clone(recorder),
            behaviors: HashMap::new(),
            default: Behavior::default(),
        }
    }

    pub fn with(mut self, target: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(target.to_string(), behavior);
        self
    }

    pub fn with_default(mut self, behavior: Behavior) -> Self {
        self.default = behavior;
        self
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn create(&self, target: &Target) -> Result<Box<dyn Connection>, ExecError> {
        let behavior = self
            .behaviors
            .get(&target.name)
            .cloned()
            .unwrap_or_else(|| self.default.clone());
        Ok(Box::new(MockConnection::new(
            target.clone(),
            behavior,
            Arc::clone(&self.recorder),
        )))
    }
}

pub fn targets(names: &[&str]) -> Vec<Target> {
    names
        .iter()
        .map(|name| Target::new(*name, TransportKind::Ssh))
        .collect()
}

pub fn executor(concurrency: usize, factory: MockFactory) -> Executor {
    let config = ExecutorConfig {
        concurrency,
        ..ExecutorConfig::default()
    };
    Executor::new(config).with_factory(Arc::new(factory))
}

/// Write `contents` to a fresh file under the system temp dir
pub fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("fanout-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}
