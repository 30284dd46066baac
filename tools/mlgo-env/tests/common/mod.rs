#![allow(dead_code)]

use mlgo_env::errors::MlgoError;
use mlgo_env::log_reader::LogHeader;
use mlgo_env::log_writer::LogWriter;
use mlgo_env::runtime::{ProcessOutput, ProcessRequest, ProcessRunner};
use mlgo_env::task::{CompilationTask, ModuleScores};
use mlgo_env::tensor::{DType, Element, TensorSpec};
use mlgo_env::types::{ModuleSpec, PipePaths};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CLANG_PATH: &str = "/test/clang/path";
pub const NUM_STEPS: u64 = 10;

pub fn mock_module() -> ModuleSpec {
    ModuleSpec::new(
        "module",
        b"asdf".to_vec(),
        ["--opt_a", "a", "--opt_b", "b"]
            .iter()
            .map(|arg| arg.to_string())
            .collect(),
    )
}

/// Appends `--interactive=<prefix>` for interactive sessions and always
/// scores `{"default": 47}`.
pub struct MockTask;

impl CompilationTask for MockTask {
    fn build_command_line(
        &self,
        clang_path: &Path,
        base_args: &[String],
        interactive_prefix: Option<&Path>,
        _working_dir: &Path,
    ) -> Vec<String> {
        let mut args = vec![clang_path.display().to_string()];
        args.extend(base_args.iter().cloned());
        if let Some(prefix) = interactive_prefix {
            args.push(format!("--interactive={}", prefix.display()));
        }
        args
    }

    fn score_module(&self, _working_dir: &Path) -> Result<ModuleScores, MlgoError> {
        Ok(BTreeMap::from([("default".to_string(), 47.0)]))
    }
}

pub fn times_called_header() -> LogHeader {
    LogHeader {
        features: vec![TensorSpec::new("times_called", vec![1], DType::Int64)],
        score: TensorSpec::new("reward", vec![1], DType::Float32),
        advice: None,
    }
}

struct ScriptedProcess {
    out: Option<LogWriter<File>>,
    counter: u64,
    exited: Option<i32>,
}

/// Stands in for an interactive compiler. Spawning with `--interactive=P`
/// creates `P.out` (header already written) and `P.in`; every `poll` then
/// appends one `context_<n>` frame until `NUM_STEPS` frames were written,
/// after which `P.out` is closed.
#[derive(Clone)]
pub struct ScriptedCompiler {
    header: LogHeader,
    exit_code: i32,
    processes: Arc<Mutex<HashMap<u64, ScriptedProcess>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    kills: Arc<Mutex<Vec<u64>>>,
}

impl Default for ScriptedCompiler {
    fn default() -> Self {
        Self::with_header(times_called_header())
    }
}

impl ScriptedCompiler {
    pub fn with_header(header: LogHeader) -> Self {
        Self {
            header,
            exit_code: 0,
            processes: Arc::new(Mutex::new(HashMap::new())),
            spawned: Arc::new(Mutex::new(Vec::new())),
            kills: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn exiting_with(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.kills.lock().expect("kills lock").clone()
    }

    fn create_pipes(&self, prefix: &Path) -> Result<LogWriter<File>, MlgoError> {
        let pipes = PipePaths::from_prefix(prefix);
        File::create(&pipes.to_compiler).map_err(|e| MlgoError::Io(e.to_string()))?;
        let out = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&pipes.from_compiler)
            .map_err(|e| MlgoError::Io(e.to_string()))?;
        let mut writer = LogWriter::new(out);
        writer.write_header(&self.header)?;
        writer.flush()?;
        Ok(writer)
    }
}

impl ProcessRunner for ScriptedCompiler {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, MlgoError> {
        let prefix = request
            .args
            .iter()
            .find_map(|arg| arg.strip_prefix("--interactive="))
            .map(PathBuf::from);
        let out = match prefix {
            Some(prefix) => Some(self.create_pipes(&prefix)?),
            None => None,
        };
        let mut spawned = self.spawned.lock().expect("spawned lock");
        let handle = spawned.len() as u64;
        spawned.push(request);
        self.processes.lock().expect("processes lock").insert(
            handle,
            ScriptedProcess {
                out,
                counter: 0,
                exited: None,
            },
        );
        Ok(handle)
    }

    fn poll(&self, handle: u64) -> Result<Option<i32>, MlgoError> {
        let mut processes = self.processes.lock().expect("processes lock");
        let process = processes
            .get_mut(&handle)
            .ok_or_else(|| MlgoError::Process(format!("unknown handle {handle}")))?;
        if process.exited.is_some() {
            return Ok(process.exited);
        }
        if process.counter >= NUM_STEPS {
            process.out = None;
            return Ok(None);
        }
        if let Some(writer) = process.out.as_mut() {
            let counter = process.counter as i64;
            writer.write_context(&format!("context_{counter}"))?;
            writer.write_observation_marker(0)?;
            writer.write_values(&[counter])?;
            writer.write_newline()?;
            writer.write_outcome_marker(0)?;
            writer.write_values(&[3.14f32])?;
            writer.write_newline()?;
            writer.flush()?;
            process.counter += 1;
        }
        Ok(None)
    }

    fn wait_timeout(
        &self,
        handle: u64,
        _timeout: Option<Duration>,
    ) -> Result<Option<ProcessOutput>, MlgoError> {
        let mut processes = self.processes.lock().expect("processes lock");
        let process = processes
            .get_mut(&handle)
            .ok_or_else(|| MlgoError::Process(format!("unknown handle {handle}")))?;
        process.out = None;
        let exit_code = *process.exited.get_or_insert(self.exit_code);
        Ok(Some(ProcessOutput {
            exit_code,
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                "error: scripted failure".to_string()
            },
        }))
    }

    fn kill(&self, handle: u64) -> Result<(), MlgoError> {
        self.kills.lock().expect("kills lock").push(handle);
        if let Some(process) = self.processes.lock().expect("processes lock").get_mut(&handle) {
            process.out = None;
            process.exited = Some(-1);
        }
        Ok(())
    }
}

// ── Log fixtures ──────────────────────────────────────────────────────────────

/// Positions where [`create_example`] swaps a `\n` for garbage or halves a
/// tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMarker {
    None,
    AfterHeader,
    CtxMarkerPos,
    ObsMarkerPos,
    OutcomeMarkerPos,
    TensorBufPos,
    TensorsPos,
    OutcomePos,
}

impl ErrorMarker {
    pub const ALL_ERRORS: [ErrorMarker; 7] = [
        ErrorMarker::AfterHeader,
        ErrorMarker::CtxMarkerPos,
        ErrorMarker::ObsMarkerPos,
        ErrorMarker::OutcomeMarkerPos,
        ErrorMarker::TensorBufPos,
        ErrorMarker::TensorsPos,
        ErrorMarker::OutcomePos,
    ];
}

const ERROR_NEWLINE: &[u8] = b"hi there";

pub struct LogExampleBuilder<W: Write> {
    writer: LogWriter<W>,
    error: ErrorMarker,
}

impl<W: Write> LogExampleBuilder<W> {
    pub fn new(sink: W, error: ErrorMarker) -> Self {
        Self {
            writer: LogWriter::new(sink),
            error,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    pub fn write_header(&mut self, header: &LogHeader) {
        let bytes = serde_json::to_vec(&header.to_json()).expect("header json");
        self.writer.write_raw(&bytes).expect("header");
        self.write_newline(ErrorMarker::AfterHeader);
    }

    pub fn write_context_marker(&mut self, name: &str) {
        self.write_json(json!({ "context": name }), ErrorMarker::CtxMarkerPos);
    }

    pub fn write_observation_marker(&mut self, id: i64) {
        self.write_json(json!({ "observation": id }), ErrorMarker::ObsMarkerPos);
    }

    pub fn write_outcome_marker(&mut self, id: i64) {
        self.write_json(json!({ "outcome": id }), ErrorMarker::OutcomeMarkerPos);
    }

    pub fn write_buff<T: Element>(&mut self, values: &[T]) {
        let values = if self.error == ErrorMarker::TensorBufPos {
            &values[values.len() / 2..]
        } else {
            values
        };
        self.writer.write_values(values).expect("buffer");
    }

    pub fn write_newline(&mut self, position: ErrorMarker) {
        if position == self.error {
            self.writer.write_raw(ERROR_NEWLINE).expect("error newline");
        } else {
            self.writer.write_newline().expect("newline");
        }
    }

    fn write_json(&mut self, value: serde_json::Value, position: ErrorMarker) {
        let bytes = serde_json::to_vec(&value).expect("marker json");
        self.writer.write_raw(&bytes).expect("marker");
        self.write_newline(position);
    }
}

pub fn example_header() -> LogHeader {
    LogHeader {
        features: vec![
            TensorSpec::new("tensor_name2", vec![2, 3], DType::Float32),
            TensorSpec::new("tensor_name1", vec![3, 1], DType::Int64),
        ],
        score: TensorSpec::new("reward", vec![1], DType::Float32),
        advice: None,
    }
}

/// `nr_contexts` contexts named `context_nr_<i>`, two observations each.
/// Context `i` shifts every value by `10 * i`; the second observation adds
/// one to every feature and to the reward.
pub fn create_example(path: &Path, nr_contexts: usize, error: ErrorMarker) {
    let file = File::create(path).expect("create example");
    let mut builder = LogExampleBuilder::new(file, error);
    builder.write_header(&example_header());

    let mut t0: Vec<f32> = vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
    let mut t1: Vec<i64> = vec![1, 2, 3];
    let mut score = 1.2f32;
    for ctx_id in 0..nr_contexts {
        let shift = (ctx_id * 10) as i64;
        t0.iter_mut().for_each(|v| *v += shift as f32);
        t1.iter_mut().for_each(|v| *v += shift);
        builder.write_context_marker(&format!("context_nr_{ctx_id}"));

        for obs in 0..2 {
            if obs == 1 {
                t0.iter_mut().for_each(|v| *v += 1.0);
                t1.iter_mut().for_each(|v| *v += 1);
                score += 1.0;
            }
            builder.write_observation_marker(obs);
            builder.write_buff(&t0);
            builder.write_buff(&t1);
            builder.write_newline(ErrorMarker::TensorsPos);
            builder.write_outcome_marker(obs);
            builder.write_buff(&[score]);
            builder.write_newline(ErrorMarker::OutcomePos);
        }
    }
    builder.into_inner().flush().expect("flush");
}
