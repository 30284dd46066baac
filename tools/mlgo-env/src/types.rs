use crate::errors::MlgoError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Placeholder in module options replaced by the materialized IR path.
pub const INPUT_PLACEHOLDER: &str = "{input}";
pub const INPUT_FILE_NAME: &str = "input.bc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    First,
    Mid,
    Last,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Mid => "mid",
            Self::Last => "last",
        }
    }
}

/// Process-runner handle backing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub name: String,
    pub loaded_ir: Vec<u8>,
    pub orig_options: Vec<String>,
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>, loaded_ir: Vec<u8>, orig_options: Vec<String>) -> Self {
        Self {
            name: name.into(),
            loaded_ir,
            orig_options,
        }
    }

    /// Writes the IR into `working_dir` (when present) and returns the base
    /// compiler arguments with [`INPUT_PLACEHOLDER`] expanded.
    pub fn materialize(&self, working_dir: &Path) -> Result<Vec<String>, MlgoError> {
        if self.loaded_ir.is_empty() {
            return Ok(self.orig_options.clone());
        }
        let input = working_dir.join(INPUT_FILE_NAME);
        std::fs::write(&input, &self.loaded_ir)
            .map_err(|e| MlgoError::Io(format!("write {}: {e}", input.display())))?;
        let input = input.display().to_string();
        Ok(self
            .orig_options
            .iter()
            .map(|arg| arg.replace(INPUT_PLACEHOLDER, &input))
            .collect())
    }
}

/// How a session was spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Interactive,
    Batch,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Batch => "batch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Spawned,
    Communicating,
    Exited(i32),
    Killed,
}

impl Lifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePaths {
    pub to_compiler: PathBuf,
    pub from_compiler: PathBuf,
}

impl PipePaths {
    /// `P.in` carries actions to the compiler, `P.out` carries its log.
    pub fn from_prefix(prefix: &Path) -> Self {
        let base = prefix.as_os_str().to_owned();
        let mut to_compiler = base.clone();
        to_compiler.push(".in");
        let mut from_compiler = base;
        from_compiler.push(".out");
        Self {
            to_compiler: PathBuf::from(to_compiler),
            from_compiler: PathBuf::from(from_compiler),
        }
    }
}
