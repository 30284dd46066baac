use crate::errors::MlgoError;
use crate::log_reader::{LogHeader, LogReader, Record};
use crate::logging::append_run_log;
use crate::replay::recorder::TraceRecorder;
use crate::runtime::{
    Clock, FileSystem, ProcessRequest, ProcessRunner, ProductionClock, ProductionFileSystem,
    ProductionRuntime,
};
use crate::task::{CompilationTask, ModuleScores};
use crate::tensor::TensorValue;
use crate::types::{Lifecycle, ModuleSpec, PipePaths, SessionId, SessionMode};
use indexmap::IndexMap;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const WORKING_DIR_PREFIX: &str = "mlgo-session-";
pub const PIPE_BASENAME: &str = "channel";
const PIPE_POLL_INTERVAL: Duration = Duration::from_millis(20);
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Root for persistent per-session directories; `None` means an
    /// ephemeral directory removed at teardown.
    pub explicit_temps_dir: Option<PathBuf>,
    pub pipe_open_timeout: Duration,
    pub teardown_grace: Duration,
    pub trace_dir: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            explicit_temps_dir: None,
            pipe_open_timeout: Duration::from_secs(30),
            teardown_grace: Duration::from_secs(1),
            trace_dir: None,
        }
    }
}

#[derive(Clone)]
pub struct SessionRuntime {
    pub runner: Arc<dyn ProcessRunner>,
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
}

impl SessionRuntime {
    pub fn production() -> Self {
        Self::from_runtime(&ProductionRuntime::new())
    }

    pub fn from_runtime(runtime: &ProductionRuntime) -> Self {
        Self {
            runner: runtime.process_runner.clone(),
            clock: runtime.clock.clone(),
            file_system: runtime.file_system.clone(),
        }
    }

    /// Real clock and filesystem around a caller-supplied runner.
    pub fn with_runner(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
        }
    }
}

/// One decoded record, keyed by feature name in header order.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub features: IndexMap<String, TensorValue>,
    pub reward: TensorValue,
    pub context: String,
    pub observation_id: i64,
    pub working_dir: PathBuf,
}

impl Observation {
    fn from_record(record: Record, working_dir: &Path) -> Self {
        let features = record
            .feature_values
            .into_iter()
            .map(|value| (value.name().to_string(), value))
            .collect();
        Self {
            features,
            reward: record.score,
            context: record.context,
            observation_id: record.observation_id,
            working_dir: working_dir.to_path_buf(),
        }
    }

    pub fn feature(&self, name: &str) -> Option<&TensorValue> {
        self.features.get(name)
    }
}

enum WorkingDir {
    Ephemeral(TempDir),
    Persistent(PathBuf),
}

impl WorkingDir {
    fn allocate(explicit_root: Option<&Path>) -> Result<Self, MlgoError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKING_DIR_PREFIX);
        match explicit_root {
            Some(root) => {
                std::fs::create_dir_all(root)
                    .map_err(|e| MlgoError::Io(format!("create {}: {e}", root.display())))?;
                let dir = builder
                    .tempdir_in(root)
                    .map_err(|e| MlgoError::Io(format!("tempdir in {}: {e}", root.display())))?;
                Ok(Self::Persistent(dir.keep()))
            }
            None => builder
                .tempdir()
                .map(Self::Ephemeral)
                .map_err(|e| MlgoError::Io(format!("tempdir: {e}"))),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Ephemeral(dir) => dir.path(),
            Self::Persistent(path) => path,
        }
    }

    fn release(self) {
        match self {
            Self::Ephemeral(dir) => {
                let path = dir.path().display().to_string();
                if let Err(err) = dir.close() {
                    append_run_log(
                        "warn",
                        "session.working_dir.remove_failed",
                        json!({"path": path, "error": err.to_string()}),
                    );
                }
            }
            Self::Persistent(path) => append_run_log(
                "debug",
                "session.working_dir.kept",
                json!({"path": path.display().to_string()}),
            ),
        }
    }
}

type PipeReader = BufReader<Box<dyn Read + Send>>;

enum Inbound {
    Closed,
    Raw(PipeReader),
    Framed(LogReader<PipeReader>),
    Exhausted,
}

impl Inbound {
    fn next_record(&mut self) -> Result<Option<Record>, MlgoError> {
        if matches!(self, Inbound::Raw(_)) {
            let Inbound::Raw(source) = std::mem::replace(self, Inbound::Exhausted) else {
                return Ok(None);
            };
            match LogReader::open(source)? {
                Some(reader) => *self = Inbound::Framed(reader),
                None => return Ok(None),
            }
        }
        let record = match self {
            Inbound::Framed(reader) => reader.next_record()?,
            _ => None,
        };
        if record.is_none() {
            *self = Inbound::Exhausted;
        }
        Ok(record)
    }
}

/// Everything a session must release. Teardown runs exactly once, from
/// [`ProcessSession::close`] or from `Drop`, including a half-built session
/// whose `open` failed.
struct SessionIo {
    id: Option<SessionId>,
    runtime: SessionRuntime,
    teardown_grace: Duration,
    working_dir: Option<WorkingDir>,
    handle: Option<u64>,
    inbound: Inbound,
    outbound: Option<File>,
    trace: Option<TraceRecorder>,
    lifecycle: Lifecycle,
    torn_down: bool,
}

impl SessionIo {
    fn label(&self) -> String {
        self.id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unspawned".to_string())
    }

    /// `Ok(true)` once the compiler exited cleanly.
    fn refresh_liveness(&mut self) -> Result<bool, MlgoError> {
        if let Lifecycle::Exited(code) = self.lifecycle {
            return exit_status(code).map(|()| true);
        }
        if self.lifecycle == Lifecycle::Killed {
            return Err(MlgoError::Process(format!("{} was killed", self.label())));
        }
        let Some(handle) = self.handle else {
            return Ok(true);
        };
        match self.runtime.runner.poll(handle)? {
            Some(code) => {
                self.lifecycle = Lifecycle::Exited(code);
                append_run_log(
                    "info",
                    "session.exited",
                    json!({"session": self.label(), "exit_code": code}),
                );
                exit_status(code).map(|()| true)
            }
            None => Ok(false),
        }
    }

    fn wait_for_pipes(&mut self, pipes: &PipePaths, timeout: Duration) -> Result<(), MlgoError> {
        let clock = self.runtime.clock.clone();
        let deadline = clock.now() + timeout;
        loop {
            let fs = &self.runtime.file_system;
            if fs.exists(&pipes.from_compiler) && fs.exists(&pipes.to_compiler) {
                return Ok(());
            }
            if let Some(handle) = self.handle {
                if let Some(code) = self.runtime.runner.poll(handle)? {
                    self.lifecycle = Lifecycle::Exited(code);
                    return Err(MlgoError::Process(format!(
                        "compiler exited with status {code} before creating {}",
                        pipes.from_compiler.display()
                    )));
                }
            }
            let now = clock.now();
            if now >= deadline {
                return Err(MlgoError::Process(format!(
                    "timed out after {}ms waiting for {}",
                    timeout.as_millis(),
                    pipes.from_compiler.display()
                )));
            }
            clock.sleep_until(std::cmp::min(now + PIPE_POLL_INTERVAL, deadline))?;
        }
    }

    /// `P.out` first, then `P.in`; the compiler opens them in the same order.
    fn open_pipes(&mut self, pipes: &PipePaths) -> Result<(), MlgoError> {
        let from_compiler = File::open(&pipes.from_compiler).map_err(|e| {
            MlgoError::Io(format!("open {}: {e}", pipes.from_compiler.display()))
        })?;
        let source: Box<dyn Read + Send> = match &self.trace {
            Some(trace) => Box::new(trace.tee(from_compiler)),
            None => Box::new(from_compiler),
        };
        self.inbound = Inbound::Raw(BufReader::new(source));
        let to_compiler = OpenOptions::new()
            .write(true)
            .open(&pipes.to_compiler)
            .map_err(|e| MlgoError::Io(format!("open {}: {e}", pipes.to_compiler.display())))?;
        self.outbound = Some(to_compiler);
        self.lifecycle = Lifecycle::Communicating;
        Ok(())
    }

    fn close_pipes(&mut self) {
        self.inbound = Inbound::Closed;
        self.outbound = None;
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(trace) = self.trace.take() {
            if let Err(err) = trace.finish() {
                append_run_log(
                    "warn",
                    "session.trace.finish_failed",
                    json!({"session": self.label(), "error": err.to_string()}),
                );
            }
        }
        self.close_pipes();
        if let Some(handle) = self.handle.take() {
            self.stop_process(handle);
        }
        if let Some(dir) = self.working_dir.take() {
            dir.release();
        }
        append_run_log(
            "debug",
            "session.teardown",
            json!({"session": self.label(), "lifecycle": format!("{:?}", self.lifecycle)}),
        );
    }

    fn stop_process(&mut self, handle: u64) {
        let runner = self.runtime.runner.clone();
        match runner.wait_timeout(handle, Some(self.teardown_grace)) {
            Ok(Some(output)) => {
                self.lifecycle = Lifecycle::Exited(output.exit_code);
                return;
            }
            Ok(None) => {}
            Err(err) => append_run_log(
                "warn",
                "session.teardown.wait_failed",
                json!({"session": self.label(), "error": err.to_string()}),
            ),
        }
        if let Err(err) = runner.kill(handle) {
            append_run_log(
                "warn",
                "session.teardown.kill_failed",
                json!({"session": self.label(), "error": err.to_string()}),
            );
            return;
        }
        self.lifecycle = Lifecycle::Killed;
        append_run_log("info", "session.killed", json!({"session": self.label()}));
        if let Err(err) = runner.wait_timeout(handle, Some(REAP_TIMEOUT)) {
            append_run_log(
                "warn",
                "session.teardown.reap_failed",
                json!({"session": self.label(), "error": err.to_string()}),
            );
        }
    }
}

impl Drop for SessionIo {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn exit_status(code: i32) -> Result<(), MlgoError> {
    if code == 0 {
        Ok(())
    } else {
        Err(MlgoError::Process(format!("compiler exited with status {code}")))
    }
}

/// A running compiler for one module: owns its process, working directory
/// and pipes for its whole lifetime.
pub struct ProcessSession {
    id: SessionId,
    mode: SessionMode,
    module_name: String,
    task: Arc<dyn CompilationTask>,
    working_dir: PathBuf,
    pipe_prefix: Option<PathBuf>,
    header: Option<LogHeader>,
    io: SessionIo,
}

impl ProcessSession {
    pub fn open(
        runtime: SessionRuntime,
        clang_path: &Path,
        module: &ModuleSpec,
        task: Arc<dyn CompilationTask>,
        interactive: bool,
        options: &SessionOptions,
    ) -> Result<Self, MlgoError> {
        let working_dir = WorkingDir::allocate(options.explicit_temps_dir.as_deref())?;
        let working_path = working_dir.path().to_path_buf();
        let mut io = SessionIo {
            id: None,
            runtime,
            teardown_grace: options.teardown_grace,
            working_dir: Some(working_dir),
            handle: None,
            inbound: Inbound::Closed,
            outbound: None,
            trace: None,
            lifecycle: Lifecycle::Spawned,
            torn_down: false,
        };

        let base_args = module.materialize(&working_path)?;
        let pipe_prefix = interactive.then(|| working_path.join(PIPE_BASENAME));
        let command_line = task.build_command_line(
            clang_path,
            &base_args,
            pipe_prefix.as_deref(),
            &working_path,
        );
        let request = ProcessRequest::from_command_line(command_line, Some(working_path.clone()))?;
        let rendered = request.command_line().join(" ");
        let handle = io.runtime.runner.spawn(request)?;
        let id = SessionId(handle);
        io.handle = Some(handle);
        io.id = Some(id);

        let mode = if interactive {
            SessionMode::Interactive
        } else {
            SessionMode::Batch
        };
        append_run_log(
            "info",
            "session.spawned",
            json!({
                "session": id.to_string(),
                "module": module.name,
                "mode": mode.as_str(),
                "working_dir": working_path.display().to_string(),
                "command_line": rendered,
            }),
        );

        if let Some(prefix) = &pipe_prefix {
            if let Some(trace_dir) = &options.trace_dir {
                io.trace = Some(TraceRecorder::for_session(trace_dir, &module.name, id)?);
            }
            let pipes = PipePaths::from_prefix(prefix);
            io.wait_for_pipes(&pipes, options.pipe_open_timeout)?;
            io.open_pipes(&pipes)?;
            append_run_log(
                "info",
                "session.pipes_open",
                json!({"session": id.to_string(), "prefix": prefix.display().to_string()}),
            );
        }

        Ok(Self {
            id,
            mode,
            module_name: module.name.clone(),
            task,
            working_dir: working_path,
            pipe_prefix,
            header: None,
            io,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn is_interactive(&self) -> bool {
        self.mode == SessionMode::Interactive
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.io.lifecycle
    }

    /// Available after the first [`ProcessSession::get_observation`].
    pub fn header(&self) -> Option<&LogHeader> {
        self.header.as_ref()
    }

    pub fn pipe_prefix(&self) -> Option<&Path> {
        self.pipe_prefix.as_deref()
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn trace_path(&self) -> Option<PathBuf> {
        self.io.trace.as_ref().map(TraceRecorder::path)
    }

    /// Next observation, or `None` once the compiler finished cleanly or
    /// closed its log.
    pub fn get_observation(&mut self) -> Result<Option<Observation>, MlgoError> {
        if !self.is_interactive() {
            return Err(MlgoError::Process(format!(
                "{} is not interactive and has no observation stream",
                self.id
            )));
        }
        if self.io.refresh_liveness()? {
            return Ok(None);
        }
        let record = match self.io.inbound.next_record() {
            Ok(record) => record,
            Err(err) => {
                if err.is_stream_corruption() {
                    append_run_log(
                        "error",
                        "session.stream_corrupt",
                        json!({"session": self.id.to_string(), "error": err.to_string()}),
                    );
                }
                return Err(err);
            }
        };
        if self.header.is_none() {
            if let Inbound::Framed(reader) = &self.io.inbound {
                let header = reader.header().clone();
                append_run_log(
                    "debug",
                    "session.header",
                    json!({
                        "session": self.id.to_string(),
                        "features": header.features.len(),
                        "score": header.score.name,
                    }),
                );
                self.header = Some(header);
            }
        }
        match record {
            Some(record) => Ok(Some(Observation::from_record(record, &self.working_dir))),
            None => {
                append_run_log(
                    "info",
                    "session.end_of_stream",
                    json!({"session": self.id.to_string()}),
                );
                Ok(None)
            }
        }
    }

    /// Writes the raw action bytes to `P.in` and flushes before returning.
    pub fn send_action(&mut self, action: &TensorValue) -> Result<(), MlgoError> {
        if !self.is_interactive() {
            return Err(MlgoError::InvalidAction(format!(
                "{} is not interactive",
                self.id
            )));
        }
        if self.io.lifecycle.is_terminal() {
            return Err(MlgoError::Process(format!(
                "{} already finished ({:?})",
                self.id, self.io.lifecycle
            )));
        }
        if let Some(advice) = self.header.as_ref().and_then(|header| header.advice.as_ref()) {
            let actual = action.as_bytes().len();
            if actual != advice.byte_size() {
                return Err(MlgoError::InvalidAction(format!(
                    "action `{}` is {actual} bytes but advice `{}` expects {}",
                    action.name(),
                    advice.name,
                    advice.byte_size()
                )));
            }
        }
        let pipe = self
            .io
            .outbound
            .as_mut()
            .ok_or_else(|| MlgoError::Process(format!("pipe to {} is closed", self.id)))?;
        pipe.write_all(action.as_bytes())
            .map_err(|e| MlgoError::Io(e.to_string()))?;
        pipe.flush().map_err(|e| MlgoError::Io(e.to_string()))
    }

    /// Closes the pipes, waits for the compile to finish and asks the task
    /// for its scores.
    pub fn module_scores(&mut self, timeout: Option<Duration>) -> Result<ModuleScores, MlgoError> {
        self.io.close_pipes();
        let handle = self
            .io
            .handle
            .ok_or_else(|| MlgoError::Process(format!("{} has no process to wait on", self.id)))?;
        let output = self
            .io
            .runtime
            .runner
            .wait_timeout(handle, timeout)?
            .ok_or_else(|| {
                MlgoError::Process(format!(
                    "compiling `{}` did not finish within {}s",
                    self.module_name,
                    timeout.map(|t| t.as_secs()).unwrap_or_default()
                ))
            })?;
        self.io.handle = None;
        self.io.lifecycle = Lifecycle::Exited(output.exit_code);
        if output.exit_code != 0 {
            return Err(MlgoError::Process(format!(
                "compiling `{}` exited with status {}: {}",
                self.module_name,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let scores = self.task.score_module(&self.working_dir)?;
        append_run_log(
            "info",
            "session.scored",
            json!({"session": self.id.to_string(), "scores": scores}),
        );
        Ok(scores)
    }

    pub fn close(mut self) {
        self.io.teardown();
    }
}
