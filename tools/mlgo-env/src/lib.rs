pub mod config;
pub mod env;
pub mod errors;
pub mod log_reader;
pub mod log_writer;
pub mod logging;
pub mod replay;
pub mod runtime;
pub mod session;
pub mod task;
pub mod tensor;
pub mod types;

use clap::{error::ErrorKind, Parser, Subcommand};
use config::{load_config, AppConfig, CliOverrides, EnvMap};
use env::StepPayload;
use errors::MlgoError;
use log_reader::{read_log, read_log_as_sequence_examples, Feature, Record};
use logging::{append_run_log, init_run_logger};
use replay::replayer::TraceReplayer;
use runtime::{ProductionRuntime, Terminal};
use serde_json::{json, Value};
use std::path::PathBuf;
use types::StepType;

#[derive(Debug, Clone, Parser)]
#[command(name = "mlgo-env", version)]
#[command(about = "Inspect, group and replay compiler training logs")]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Override `compiler.clang_path`; only affects the `show-config` output.
    #[arg(long, global = true)]
    pub clang_path: Option<PathBuf>,
    /// Override `session.explicit_temps_dir`; only affects the `show-config` output.
    #[arg(long, global = true)]
    pub explicit_temps_dir: Option<PathBuf>,
    /// Override `environment.interactive_only`; only affects the `show-config` output.
    #[arg(long, global = true, default_value_t = false)]
    pub interactive_only: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print the header, then one JSON line per record.
    Inspect { log: PathBuf },
    /// Print records grouped into one sequence example per context.
    Group { log: PathBuf },
    /// Step through a recorded trace, one line per step.
    Replay {
        trace: PathBuf,
        #[arg(long, default_value_t = false)]
        verify_digest: bool,
    },
    /// Print the effective configuration as TOML.
    ShowConfig,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            config_path: self.config.clone(),
            clang_path: self.clang_path.clone(),
            explicit_temps_dir: self.explicit_temps_dir.clone(),
            interactive_only: self.interactive_only,
        }
    }
}

pub fn run() -> Result<i32, MlgoError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| MlgoError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &env, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    env: &[(std::ffi::OsString, std::ffi::OsString)],
    cwd: &std::path::Path,
    runtime: &ProductionRuntime,
) -> Result<i32, MlgoError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(MlgoError::Cli(error.to_string())),
        },
    };

    let cfg = load_config(
        &cli.overrides(),
        &env_to_map(env),
        cwd,
        runtime.file_system.as_ref(),
    )?;
    init_run_logger(cfg.run_logger());
    append_run_log(
        "info",
        "cli.command",
        json!({"command": format!("{:?}", cli.command)}),
    );

    let terminal = runtime.terminal.as_ref();
    match &cli.command {
        Command::Inspect { log } => inspect_log(terminal, log)?,
        Command::Group { log } => group_log(terminal, log)?,
        Command::Replay {
            trace,
            verify_digest,
        } => replay_trace(terminal, trace, *verify_digest)?,
        Command::ShowConfig => show_config(terminal, &cfg)?,
    }
    Ok(0)
}

fn inspect_log(terminal: &dyn Terminal, path: &std::path::Path) -> Result<(), MlgoError> {
    let records = read_log(path)?;
    let Some(header) = records.header() else {
        return Ok(());
    };
    terminal.write_line(&to_json_line(&header.to_json())?)?;
    for record in records {
        terminal.write_line(&to_json_line(&record_json(&record?))?)?;
    }
    Ok(())
}

fn group_log(terminal: &dyn Terminal, path: &std::path::Path) -> Result<(), MlgoError> {
    let grouped = read_log_as_sequence_examples(path)?;
    let text =
        serde_json::to_string_pretty(&grouped).map_err(|e| MlgoError::Io(e.to_string()))?;
    terminal.write_line(&text)
}

fn replay_trace(
    terminal: &dyn Terminal,
    path: &std::path::Path,
    verify_digest: bool,
) -> Result<(), MlgoError> {
    let mut replayer = TraceReplayer::open(path, verify_digest)?;
    let mut step = replayer.reset()?;
    loop {
        let line = match &step.payload {
            StepPayload::Observation(observation) => json!({
                "step_type": step.step_type,
                "context": observation.context,
                "observation": observation.observation_id,
                "reward": observation.reward.to_f64_vec(),
            }),
            StepPayload::Final(score) => json!({
                "step_type": step.step_type,
                "module_scores": score.module_scores,
            }),
        };
        terminal.write_line(&to_json_line(&line)?)?;
        if step.step_type == StepType::Last {
            return Ok(());
        }
        step = replayer.step()?;
    }
}

fn show_config(terminal: &dyn Terminal, cfg: &AppConfig) -> Result<(), MlgoError> {
    terminal.write_line(cfg.to_toml()?.trim_end())
}

fn record_json(record: &Record) -> Value {
    let features = record
        .feature_values
        .iter()
        .map(|value| (value.name().to_string(), json!(Feature::from_tensor(value))))
        .collect::<serde_json::Map<_, _>>();
    json!({
        "context": record.context,
        "observation": record.observation_id,
        "features": features,
        "score": { record.score.name(): Feature::from_tensor(&record.score) },
    })
}

fn to_json_line<T: serde::Serialize>(value: &T) -> Result<String, MlgoError> {
    serde_json::to_string(value).map_err(|e| MlgoError::Io(e.to_string()))
}

fn env_to_map(env: &[(std::ffi::OsString, std::ffi::OsString)]) -> EnvMap {
    let mut map = EnvMap::new();
    for (key, value) in env {
        if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}
