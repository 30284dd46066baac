use crate::errors::MlgoError;
use crate::logging::{JsonlLogger, DEFAULT_DISK_BUDGET_BYTES, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::runtime::FileSystem;
use crate::session::SessionOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const EXPLICIT_TEMPS_DIR_ENV: &str = "MLGO_EXPLICIT_TEMPS_DIR";

pub type EnvMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub clang_path: Option<PathBuf>,
    pub explicit_temps_dir: Option<PathBuf>,
    pub interactive_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub compiler: CompilerConfig,
    pub session: SessionConfig,
    pub environment: EnvironmentConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompilerConfig {
    pub clang_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explicit_temps_dir: Option<PathBuf>,
    pub pipe_open_timeout_ms: u64,
    pub teardown_grace_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub interactive_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub run_log_path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            compiler: CompilerConfig {
                clang_path: "clang".to_string(),
            },
            session: SessionConfig {
                explicit_temps_dir: None,
                pipe_open_timeout_ms: 30_000,
                teardown_grace_ms: 1_000,
                compile_timeout_seconds: None,
                trace_dir: None,
            },
            environment: EnvironmentConfig {
                interactive_only: false,
            },
            logging: LoggingConfig {
                run_log_path: PathBuf::from(".cache/mlgo/run.jsonl"),
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
        }
    }
}

impl AppConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            explicit_temps_dir: self.session.explicit_temps_dir.clone(),
            pipe_open_timeout: Duration::from_millis(self.session.pipe_open_timeout_ms),
            teardown_grace: Duration::from_millis(self.session.teardown_grace_ms),
            trace_dir: self.session.trace_dir.clone(),
        }
    }

    pub fn run_logger(&self) -> JsonlLogger {
        let mut logger = JsonlLogger::new(&self.logging.run_log_path);
        logger.max_payload_bytes = self.logging.max_payload_bytes;
        logger.budget_bytes = self.logging.budget_bytes;
        logger
    }

    pub fn to_toml(&self) -> Result<String, MlgoError> {
        toml::to_string_pretty(self).map_err(|e| MlgoError::ConfigParse(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    compiler: Option<PartialCompilerConfig>,
    session: Option<PartialSessionConfig>,
    environment: Option<PartialEnvironmentConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialCompilerConfig {
    clang_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialSessionConfig {
    explicit_temps_dir: Option<PathBuf>,
    pipe_open_timeout_ms: Option<u64>,
    teardown_grace_ms: Option<u64>,
    compile_timeout_seconds: Option<u64>,
    trace_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialEnvironmentConfig {
    interactive_only: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialLoggingConfig {
    run_log_path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

/// Defaults, then the TOML file, then the environment, then CLI flags.
/// Relative paths resolve against `process_cwd`.
pub fn load_config(
    overrides: &CliOverrides,
    env: &EnvMap,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<AppConfig, MlgoError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(&absolutize_path(process_cwd, path))?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| MlgoError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_env_overrides(&mut cfg, env);
    apply_cli_overrides(&mut cfg, overrides);
    resolve_paths(&mut cfg, process_cwd);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(compiler) = partial.compiler {
        if let Some(clang_path) = compiler.clang_path {
            cfg.compiler.clang_path = clang_path;
        }
    }

    if let Some(session) = partial.session {
        if let Some(dir) = session.explicit_temps_dir {
            cfg.session.explicit_temps_dir = Some(dir);
        }
        if let Some(value) = session.pipe_open_timeout_ms {
            cfg.session.pipe_open_timeout_ms = value;
        }
        if let Some(value) = session.teardown_grace_ms {
            cfg.session.teardown_grace_ms = value;
        }
        if let Some(value) = session.compile_timeout_seconds {
            cfg.session.compile_timeout_seconds = Some(value);
        }
        if let Some(dir) = session.trace_dir {
            cfg.session.trace_dir = Some(dir);
        }
    }

    if let Some(environment) = partial.environment {
        if let Some(value) = environment.interactive_only {
            cfg.environment.interactive_only = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(path) = logging.run_log_path {
            cfg.logging.run_log_path = path;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }
}

fn apply_env_overrides(cfg: &mut AppConfig, env: &EnvMap) {
    if let Some(dir) = env.get(EXPLICIT_TEMPS_DIR_ENV) {
        if !dir.trim().is_empty() {
            cfg.session.explicit_temps_dir = Some(PathBuf::from(dir));
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(clang_path) = &overrides.clang_path {
        cfg.compiler.clang_path = clang_path.display().to_string();
    }
    if let Some(dir) = &overrides.explicit_temps_dir {
        cfg.session.explicit_temps_dir = Some(dir.clone());
    }
    if overrides.interactive_only {
        cfg.environment.interactive_only = true;
    }
}

fn resolve_paths(cfg: &mut AppConfig, process_cwd: &Path) {
    if let Some(dir) = &cfg.session.explicit_temps_dir {
        cfg.session.explicit_temps_dir = Some(absolutize_path(process_cwd, dir));
    }
    if let Some(dir) = &cfg.session.trace_dir {
        cfg.session.trace_dir = Some(absolutize_path(process_cwd, dir));
    }
    cfg.logging.run_log_path = absolutize_path(process_cwd, &cfg.logging.run_log_path);
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), MlgoError> {
    if cfg.compiler.clang_path.trim().is_empty() {
        return Err(MlgoError::InvalidConfig(
            "compiler.clang_path must not be empty".to_string(),
        ));
    }
    if cfg.session.pipe_open_timeout_ms == 0 {
        return Err(MlgoError::InvalidConfig(
            "session.pipe_open_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if cfg.session.teardown_grace_ms == 0 {
        return Err(MlgoError::InvalidConfig(
            "session.teardown_grace_ms must be greater than zero".to_string(),
        ));
    }
    if cfg.session.compile_timeout_seconds == Some(0) {
        return Err(MlgoError::InvalidConfig(
            "session.compile_timeout_seconds must be greater than zero".to_string(),
        ));
    }
    if cfg.logging.max_payload_bytes == 0 {
        return Err(MlgoError::InvalidConfig(
            "logging.max_payload_bytes must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
