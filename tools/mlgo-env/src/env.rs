use crate::config::AppConfig;
use crate::errors::MlgoError;
use crate::logging::append_run_log;
use crate::session::{Observation, ProcessSession, SessionOptions, SessionRuntime};
use crate::task::{CompilationTask, ModuleScores};
use crate::tensor::TensorValue;
use crate::types::{ModuleSpec, SessionId, StepType};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentSettings {
    pub clang_path: PathBuf,
    /// Score the interactive session itself instead of a separate batch compile.
    pub interactive_only: bool,
    pub session: SessionOptions,
    pub compile_timeout: Option<Duration>,
}

impl EnvironmentSettings {
    pub fn new(clang_path: impl Into<PathBuf>) -> Self {
        Self {
            clang_path: clang_path.into(),
            interactive_only: false,
            session: SessionOptions::default(),
            compile_timeout: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            clang_path: PathBuf::from(&config.compiler.clang_path),
            interactive_only: config.environment.interactive_only,
            session: config.session_options(),
            compile_timeout: config.session.compile_timeout_seconds.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeScore {
    /// Session whose compile produced the scores; `None` for replayed traces.
    pub session_id: Option<SessionId>,
    pub module_scores: ModuleScores,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepPayload {
    Observation(Observation),
    Final(EpisodeScore),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeStep {
    pub step_type: StepType,
    pub payload: StepPayload,
}

impl TimeStep {
    pub fn observation(&self) -> Option<&Observation> {
        match &self.payload {
            StepPayload::Observation(observation) => Some(observation),
            StepPayload::Final(_) => None,
        }
    }

    pub fn score(&self) -> Option<&EpisodeScore> {
        match &self.payload {
            StepPayload::Final(score) => Some(score),
            StepPayload::Observation(_) => None,
        }
    }
}

/// `None` is the uninitialized state before the first reset or after an error.
pub fn validate_transition(from: Option<StepType>, to: StepType) -> Result<(), MlgoError> {
    use StepType as S;

    let allowed = match (from, to) {
        (_, S::First) => true,
        (Some(S::First | S::Mid), S::Mid | S::Last) => true,
        (None | Some(S::Last), _) => false,
    };
    if !allowed {
        return Err(MlgoError::Transition(format!("{from:?} -> {to:?}")));
    }
    Ok(())
}

/// Episodic driver: one module per episode, one action per step.
pub struct MlgoEnvironment {
    settings: EnvironmentSettings,
    task: Arc<dyn CompilationTask>,
    runtime: SessionRuntime,
    interactive: Option<ProcessSession>,
    scoring: Option<ProcessSession>,
    phase: Option<StepType>,
    module_name: Option<String>,
}

impl MlgoEnvironment {
    pub fn new(
        settings: EnvironmentSettings,
        task: Arc<dyn CompilationTask>,
        runtime: SessionRuntime,
    ) -> Self {
        Self {
            settings,
            task,
            runtime,
            interactive: None,
            scoring: None,
            phase: None,
            module_name: None,
        }
    }

    pub fn settings(&self) -> &EnvironmentSettings {
        &self.settings
    }

    pub fn phase(&self) -> Option<StepType> {
        self.phase
    }

    pub fn interactive_session_id(&self) -> Option<SessionId> {
        self.interactive.as_ref().map(ProcessSession::id)
    }

    /// Equal to [`Self::interactive_session_id`] iff `interactive_only`.
    pub fn scoring_session_id(&self) -> Option<SessionId> {
        self.scoring
            .as_ref()
            .map(ProcessSession::id)
            .or_else(|| self.interactive_session_id())
    }

    pub fn reset(&mut self, module: &ModuleSpec) -> Result<TimeStep, MlgoError> {
        validate_transition(self.phase, StepType::First)?;
        self.teardown_sessions();
        let result = self.start_episode(module);
        self.settle(result)
    }

    pub fn step(&mut self, action: &TensorValue) -> Result<TimeStep, MlgoError> {
        validate_transition(self.phase, StepType::Mid)?;
        let result = self.advance(action);
        self.settle(result)
    }

    pub fn close(&mut self) {
        self.teardown_sessions();
        self.phase = None;
    }

    fn start_episode(&mut self, module: &ModuleSpec) -> Result<TimeStep, MlgoError> {
        let mut interactive = ProcessSession::open(
            self.runtime.clone(),
            &self.settings.clang_path,
            module,
            self.task.clone(),
            true,
            &self.settings.session,
        )?;
        let scoring = if self.settings.interactive_only {
            None
        } else {
            Some(ProcessSession::open(
                self.runtime.clone(),
                &self.settings.clang_path,
                module,
                self.task.clone(),
                false,
                &self.settings.session,
            )?)
        };
        let observation = interactive.get_observation()?.ok_or_else(|| {
            MlgoError::Process(format!("`{}` produced no observation", module.name))
        })?;

        self.interactive = Some(interactive);
        self.scoring = scoring;
        self.module_name = Some(module.name.clone());
        self.enter(StepType::First)?;
        Ok(TimeStep {
            step_type: StepType::First,
            payload: StepPayload::Observation(observation),
        })
    }

    fn advance(&mut self, action: &TensorValue) -> Result<TimeStep, MlgoError> {
        let session = self
            .interactive
            .as_mut()
            .ok_or_else(|| MlgoError::Process("no interactive session".to_string()))?;
        session.send_action(action)?;
        match session.get_observation()? {
            Some(observation) => {
                self.enter(StepType::Mid)?;
                Ok(TimeStep {
                    step_type: StepType::Mid,
                    payload: StepPayload::Observation(observation),
                })
            }
            None => {
                let score = self.finalize()?;
                self.enter(StepType::Last)?;
                Ok(TimeStep {
                    step_type: StepType::Last,
                    payload: StepPayload::Final(score),
                })
            }
        }
    }

    fn finalize(&mut self) -> Result<EpisodeScore, MlgoError> {
        let timeout = self.settings.compile_timeout;
        let session = match self.scoring.as_mut() {
            Some(session) => session,
            None => self
                .interactive
                .as_mut()
                .ok_or_else(|| MlgoError::Process("no session to score".to_string()))?,
        };
        let module_scores = session.module_scores(timeout)?;
        Ok(EpisodeScore {
            session_id: Some(session.id()),
            module_scores,
        })
    }

    fn enter(&mut self, to: StepType) -> Result<(), MlgoError> {
        validate_transition(self.phase, to)?;
        append_run_log(
            "debug",
            "env.transition",
            json!({
                "module": self.module_name,
                "from": self.phase.map(StepType::as_str),
                "to": to.as_str(),
            }),
        );
        self.phase = Some(to);
        Ok(())
    }

    /// Any failure leaves the environment uninitialized with no live sessions.
    fn settle(&mut self, result: Result<TimeStep, MlgoError>) -> Result<TimeStep, MlgoError> {
        if let Err(err) = &result {
            append_run_log(
                "error",
                "env.episode_failed",
                json!({"module": self.module_name, "error": err.to_string()}),
            );
            self.close();
        }
        result
    }

    fn teardown_sessions(&mut self) {
        if let Some(session) = self.scoring.take() {
            session.close();
        }
        if let Some(session) = self.interactive.take() {
            session.close();
        }
    }
}
