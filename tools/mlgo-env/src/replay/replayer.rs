//! Offline playback of a recorded `P.out` stream.
//!
//! A trace is replayed with the same episode shape the live environment
//! produces: `reset` yields the first record as `First`, each `step` yields
//! the next record as `Mid`, and the step after the final record yields
//! `Last` with the final record's score.

use crate::env::{validate_transition, EpisodeScore, StepPayload, TimeStep};
use crate::errors::MlgoError;
use crate::log_reader::{read_log, Record, Records};
use crate::logging::append_run_log;
use crate::replay::recorder::{digest_path_for, sha256_hex};
use crate::session::Observation;
use crate::task::ModuleScores;
use crate::types::StepType;
use serde_json::json;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Checks `path` against its `.sha256` sidecar and returns the digest.
pub fn verify_trace_digest(path: &Path) -> Result<String, MlgoError> {
    let digest_path = digest_path_for(path);
    let expected = fs::read_to_string(&digest_path)
        .map_err(|e| MlgoError::Io(format!("read {}: {e}", digest_path.display())))?;
    let expected = expected.trim();
    let bytes =
        fs::read(path).map_err(|e| MlgoError::Io(format!("read {}: {e}", path.display())))?;
    let actual = sha256_hex(&bytes);
    if actual != expected {
        return Err(MlgoError::DigestMismatch(format!(
            "{}: sidecar says {expected}, content hashes to {actual}",
            path.display()
        )));
    }
    Ok(actual)
}

pub struct TraceReplayer {
    path: PathBuf,
    working_dir: PathBuf,
    records: Option<Records<BufReader<File>>>,
    last_record: Option<Record>,
    phase: Option<StepType>,
}

impl TraceReplayer {
    pub fn open(path: impl AsRef<Path>, verify_digest: bool) -> Result<Self, MlgoError> {
        let path = path.as_ref().to_path_buf();
        if verify_digest {
            verify_trace_digest(&path)?;
        }
        let working_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(Self {
            path,
            working_dir,
            records: None,
            last_record: None,
            phase: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn phase(&self) -> Option<StepType> {
        self.phase
    }

    /// Rewinds to the start of the trace.
    pub fn reset(&mut self) -> Result<TimeStep, MlgoError> {
        validate_transition(self.phase, StepType::First)?;
        self.phase = None;
        self.last_record = None;
        let mut records = read_log(&self.path)?;
        if records.header().is_none() {
            return Err(MlgoError::Framing(format!(
                "trace {} has no header",
                self.path.display()
            )));
        }
        let first = records.next().transpose()?.ok_or_else(|| {
            MlgoError::Framing(format!("trace {} has no records", self.path.display()))
        })?;
        self.records = Some(records);
        append_run_log(
            "debug",
            "replay.reset",
            json!({"trace": self.path.display().to_string()}),
        );
        self.emit(StepType::First, first)
    }

    pub fn step(&mut self) -> Result<TimeStep, MlgoError> {
        validate_transition(self.phase, StepType::Mid)?;
        let next = match self.records.as_mut() {
            Some(records) => records.next().transpose()?,
            None => None,
        };
        match next {
            Some(record) => self.emit(StepType::Mid, record),
            None => {
                validate_transition(self.phase, StepType::Last)?;
                self.phase = Some(StepType::Last);
                self.records = None;
                Ok(TimeStep {
                    step_type: StepType::Last,
                    payload: StepPayload::Final(EpisodeScore {
                        session_id: None,
                        module_scores: self.final_scores(),
                    }),
                })
            }
        }
    }

    fn emit(&mut self, step_type: StepType, record: Record) -> Result<TimeStep, MlgoError> {
        validate_transition(self.phase, step_type)?;
        self.phase = Some(step_type);
        let observation = Observation {
            features: record
                .feature_values
                .iter()
                .map(|value| (value.name().to_string(), value.clone()))
                .collect(),
            reward: record.score.clone(),
            context: record.context.clone(),
            observation_id: record.observation_id,
            working_dir: self.working_dir.clone(),
        };
        self.last_record = Some(record);
        Ok(TimeStep {
            step_type,
            payload: StepPayload::Observation(observation),
        })
    }

    fn final_scores(&self) -> ModuleScores {
        let mut scores = ModuleScores::new();
        if let Some(record) = &self.last_record {
            if let Some(first) = record.score.to_f64_vec().first() {
                scores.insert(record.score.name().to_string(), *first);
            }
        }
        scores
    }
}
