use crate::errors::MlgoError;
use std::collections::BTreeMap;
use std::path::Path;

/// Final per-module scores reported by a task, keyed by score name.
pub type ModuleScores = BTreeMap<String, f64>;

/// What a concrete optimization task (inlining, register allocation, ...)
/// contributes to a session. The core only ever talks to this trait.
pub trait CompilationTask: Send + Sync {
    /// Full command line, program first. `interactive_prefix` is the pipe
    /// prefix `P` (the compiler opens `P.out` / `P.in`) or `None` for a
    /// one-shot batch compile.
    fn build_command_line(
        &self,
        clang_path: &Path,
        base_args: &[String],
        interactive_prefix: Option<&Path>,
        working_dir: &Path,
    ) -> Vec<String>;

    /// Reads the outcome of a finished compile out of `working_dir`.
    fn score_module(&self, working_dir: &Path) -> Result<ModuleScores, MlgoError>;
}
