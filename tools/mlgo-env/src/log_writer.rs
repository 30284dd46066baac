//! Encoder for the training-log protocol, the mirror of [`crate::log_reader`].

use crate::errors::MlgoError;
use crate::log_reader::{ContextMarker, LogHeader, ObservationMarker, OutcomeMarker, DELIMITER};
use crate::tensor::{Element, TensorValue};
use serde::Serialize;
use std::io::Write;

pub struct LogWriter<W: Write> {
    sink: W,
    bytes_written: u64,
}

impl<W: Write> LogWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            bytes_written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    /// Header line, including its delimiter.
    pub fn write_header(&mut self, header: &LogHeader) -> Result<(), MlgoError> {
        self.write_json(&header.to_json())?;
        self.write_newline()
    }

    pub fn write_context(&mut self, name: &str) -> Result<(), MlgoError> {
        self.write_json(&ContextMarker {
            context: name.to_string(),
        })?;
        self.write_newline()
    }

    pub fn write_observation_marker(&mut self, observation_id: i64) -> Result<(), MlgoError> {
        self.write_json(&ObservationMarker {
            observation: observation_id,
        })?;
        self.write_newline()
    }

    pub fn write_outcome_marker(&mut self, observation_id: i64) -> Result<(), MlgoError> {
        self.write_json(&OutcomeMarker {
            outcome: observation_id,
        })?;
        self.write_newline()
    }

    pub fn write_tensor(&mut self, value: &TensorValue) -> Result<(), MlgoError> {
        self.write_raw(value.as_bytes())
    }

    /// Raw host-endian elements with no framing.
    pub fn write_values<T: Element>(&mut self, values: &[T]) -> Result<(), MlgoError> {
        let mut bytes = Vec::with_capacity(values.len() * T::DTYPE.element_size());
        for value in values {
            value.append_ne_bytes(&mut bytes);
        }
        self.write_raw(&bytes)
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), MlgoError> {
        self.sink
            .write_all(bytes)
            .map_err(|e| MlgoError::Io(e.to_string()))?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    pub fn write_newline(&mut self) -> Result<(), MlgoError> {
        self.write_raw(&[DELIMITER])
    }

    /// A complete observation frame followed by its outcome frame.
    pub fn write_observation(
        &mut self,
        observation_id: i64,
        features: &[TensorValue],
        score: &TensorValue,
    ) -> Result<(), MlgoError> {
        self.write_observation_marker(observation_id)?;
        for value in features {
            self.write_tensor(value)?;
        }
        self.write_newline()?;
        self.write_outcome_marker(observation_id)?;
        self.write_tensor(score)?;
        self.write_newline()
    }

    pub fn flush(&mut self) -> Result<(), MlgoError> {
        self.sink.flush().map_err(|e| MlgoError::Io(e.to_string()))
    }

    fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), MlgoError> {
        let text = serde_json::to_vec(value)
            .map_err(|e| MlgoError::Io(format!("marker encode failed: {e}")))?;
        self.write_raw(&text)
    }
}
