use crate::errors::MlgoError;
use crate::logging::append_run_log;
use serde_json::json;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessRequest {
    /// Splits a full command line into program and arguments.
    pub fn from_command_line(
        command_line: Vec<String>,
        cwd: Option<PathBuf>,
    ) -> Result<Self, MlgoError> {
        let mut parts = command_line.into_iter();
        let program = parts
            .next()
            .filter(|program| !program.trim().is_empty())
            .ok_or_else(|| MlgoError::Task("task produced an empty command line".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            cwd,
        })
    }

    pub fn command_line(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), MlgoError>;
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, MlgoError>;
    /// `None` while running, the exit code once exited (`-1` for signals).
    fn poll(&self, handle: u64) -> Result<Option<i32>, MlgoError>;
    /// Waits for exit and reaps the process. `Ok(None)` when `timeout`
    /// elapsed first; `None` timeout waits indefinitely.
    fn wait_timeout(
        &self,
        handle: u64,
        timeout: Option<Duration>,
    ) -> Result<Option<ProcessOutput>, MlgoError>;
    fn kill(&self, handle: u64) -> Result<(), MlgoError>;

    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, MlgoError> {
        let handle = self.spawn(request)?;
        self.wait_timeout(handle, None)?
            .ok_or_else(|| MlgoError::Process(format!("handle {handle} never exited")))
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, MlgoError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), MlgoError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), MlgoError> {
        if let Ok(duration) = deadline.duration_since(SystemTime::now()) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, MlgoError> {
        std::fs::read_to_string(path)
            .map_err(|e| MlgoError::Io(format!("read {}: {e}", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

struct ChildEntry {
    child: Child,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl ChildEntry {
    fn into_output(self, exit_code: i32) -> ProcessOutput {
        ProcessOutput {
            exit_code,
            stdout: join_drain(self.stdout),
            stderr: join_drain(self.stderr),
        }
    }
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, ChildEntry>,
}

/// Spawns real processes. Stdout and stderr are drained on background
/// threads so a child never blocks on a full pipe while we poll it.
pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }

    fn try_reap(&self, handle: u64) -> Result<Option<ProcessOutput>, MlgoError> {
        let mut state = self.state.lock().expect("process lock poisoned");
        let entry = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| MlgoError::Process(format!("unknown handle {handle}")))?;
        let status = entry
            .child
            .try_wait()
            .map_err(|e| MlgoError::Process(e.to_string()))?;
        let Some(status) = status else {
            return Ok(None);
        };
        let entry = state.children.remove(&handle);
        drop(state);
        Ok(entry.map(|entry| entry.into_output(status.code().unwrap_or(-1))))
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, MlgoError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| MlgoError::Process(format!("spawn {}: {e}", request.program)))?;
        let entry = ChildEntry {
            stdout: drain(child.stdout.take()),
            stderr: drain(child.stderr.take()),
            child,
        };
        let mut state = self.state.lock().expect("process lock poisoned");
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(handle, entry);
        Ok(handle)
    }

    fn poll(&self, handle: u64) -> Result<Option<i32>, MlgoError> {
        let mut state = self.state.lock().expect("process lock poisoned");
        let entry = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| MlgoError::Process(format!("unknown handle {handle}")))?;
        let status = entry
            .child
            .try_wait()
            .map_err(|e| MlgoError::Process(e.to_string()))?;
        Ok(status.map(|status| status.code().unwrap_or(-1)))
    }

    fn wait_timeout(
        &self,
        handle: u64,
        timeout: Option<Duration>,
    ) -> Result<Option<ProcessOutput>, MlgoError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if let Some(output) = self.try_reap(handle)? {
                return Ok(Some(output));
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(None);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn kill(&self, handle: u64) -> Result<(), MlgoError> {
        let mut state = self.state.lock().expect("process lock poisoned");
        let entry = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| MlgoError::Process(format!("unknown handle {handle}")))?;
        entry
            .child
            .kill()
            .map_err(|e| MlgoError::Process(e.to_string()))
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|pipe| std::thread::spawn(move || read_drained(pipe)))
}

/// Reads a captured pipe to EOF. A read error is appended as a marker line
/// so the capture is never silently cut short.
fn read_drained<R: Read>(mut pipe: R) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(err) = pipe.read_to_end(&mut buf) {
        append_run_log(
            "warn",
            "process.drain_failed",
            json!({"error": err.to_string(), "bytes_read": buf.len()}),
        );
        buf.extend_from_slice(format!("\n[mlgo-env: output capture failed: {err}]\n").as_bytes());
    }
    buf
}

fn join_drain(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), MlgoError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| MlgoError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), MlgoError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        *self.now.lock().expect("clock lock") = deadline;
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    fail_next: Arc<Mutex<Option<MlgoError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.insert(path, contents);
        fs
    }

    pub fn insert(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
    }

    pub fn set_fail_next(&self, error: MlgoError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, MlgoError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| MlgoError::Io(format!("missing file {}", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), MlgoError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }
}

/// Records every call; nothing is executed. Processes are "running" until
/// [`FakeProcessRunner::set_exited`] is called for their handle.
#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    outputs: Arc<Mutex<Vec<Result<ProcessOutput, MlgoError>>>>,
    exit_codes: Arc<Mutex<HashMap<u64, i32>>>,
    fail_next_spawn: Arc<Mutex<Option<MlgoError>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    waits: Arc<Mutex<Vec<u64>>>,
    kills: Arc<Mutex<Vec<u64>>>,
    next_handle: Arc<Mutex<u64>>,
}

impl FakeProcessRunner {
    pub fn push_output(&self, output: Result<ProcessOutput, MlgoError>) {
        self.outputs.lock().expect("outputs lock").push(output);
    }

    pub fn set_exited(&self, handle: u64, exit_code: i32) {
        self.exit_codes
            .lock()
            .expect("exit codes lock")
            .insert(handle, exit_code);
    }

    pub fn fail_next_spawn(&self, error: MlgoError) {
        *self.fail_next_spawn.lock().expect("spawn fail lock") = Some(error);
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn waits(&self) -> Vec<u64> {
        self.waits.lock().expect("waits lock").clone()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.kills.lock().expect("kills lock").clone()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, MlgoError> {
        if let Some(err) = self.fail_next_spawn.lock().expect("spawn fail lock").take() {
            return Err(err);
        }
        self.spawned.lock().expect("spawned lock").push(request);
        let mut next = self.next_handle.lock().expect("next lock");
        let handle = *next;
        *next += 1;
        Ok(handle)
    }

    fn poll(&self, handle: u64) -> Result<Option<i32>, MlgoError> {
        Ok(self
            .exit_codes
            .lock()
            .expect("exit codes lock")
            .get(&handle)
            .copied())
    }

    fn wait_timeout(
        &self,
        handle: u64,
        _timeout: Option<Duration>,
    ) -> Result<Option<ProcessOutput>, MlgoError> {
        self.waits.lock().expect("waits lock").push(handle);
        let mut outputs = self.outputs.lock().expect("outputs lock");
        if outputs.is_empty() {
            return Err(MlgoError::Process("no fake output queued".to_string()));
        }
        let output = outputs.remove(0)?;
        self.set_exited(handle, output.exit_code);
        Ok(Some(output))
    }

    fn kill(&self, handle: u64) -> Result<(), MlgoError> {
        self.kills.lock().expect("kills lock").push(handle);
        self.set_exited(handle, -1);
        Ok(())
    }
}
