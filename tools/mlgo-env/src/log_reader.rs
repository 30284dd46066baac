//! Decoder for the compiler's binary training-log protocol.
//!
//! A stream is a JSON header line followed by context, observation and
//! outcome markers. Each marker is a single JSON line; observation and
//! outcome markers are followed by raw tensor bytes and a `\n` delimiter:
//!
//! ```text
//! {"features":[...],"score":{...}}\n
//! {"context":"foo"}\n
//! {"observation":0}\n<feature bytes...>\n
//! {"outcome":0}\n<score bytes>\n
//! ```
//!
//! [`LogReader`] is a forward-only cursor over any blocking [`BufRead`]
//! source. The first error poisons the reader; a corrupted stream cannot be
//! resynchronized.

use crate::errors::MlgoError;
use crate::tensor::{TensorDescriptor, TensorSpec, TensorValue};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

pub const DELIMITER: u8 = b'\n';
pub const MAX_MARKER_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogHeader {
    pub features: Vec<TensorSpec>,
    pub score: TensorSpec,
    pub advice: Option<TensorSpec>,
}

impl LogHeader {
    pub fn to_json(&self) -> HeaderJson {
        HeaderJson {
            features: self.features.iter().map(TensorSpec::to_descriptor).collect(),
            score: self.score.to_descriptor(),
            advice: self.advice.as_ref().map(TensorSpec::to_descriptor),
        }
    }

    fn from_json(json: HeaderJson) -> Result<Self, MlgoError> {
        let features = json
            .features
            .iter()
            .map(TensorSpec::from_descriptor)
            .collect::<Result<Vec<_>, _>>()?;
        let score = TensorSpec::from_descriptor(&json.score)?;
        let advice = json
            .advice
            .as_ref()
            .map(TensorSpec::from_descriptor)
            .transpose()?;
        Ok(Self {
            features,
            score,
            advice,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderJson {
    pub features: Vec<TensorDescriptor>,
    pub score: TensorDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<TensorDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextMarker {
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservationMarker {
    pub observation: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutcomeMarker {
    pub outcome: i64,
}

/// Every marker line that may follow the header.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Marker {
    Context(ContextMarker),
    Observation(ObservationMarker),
    Outcome(OutcomeMarker),
}

/// One observation and its outcome within a context.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub context: String,
    pub observation_id: i64,
    pub feature_values: Vec<TensorValue>,
    pub score: TensorValue,
}

/// Reads the header line. `Ok(None)` means the stream ended before any byte.
pub fn read_header<R: BufRead>(source: &mut R) -> Result<Option<LogHeader>, MlgoError> {
    let Some(line) = read_marker_line(source, "header")? else {
        return Ok(None);
    };
    let json: HeaderJson = serde_json::from_slice(&line)
        .map_err(|e| MlgoError::Framing(format!("malformed header: {e}; line={}", preview(&line))))?;
    LogHeader::from_json(json).map(Some)
}

pub struct LogReader<R> {
    source: R,
    header: LogHeader,
    feature_specs: Vec<Arc<TensorSpec>>,
    score_spec: Arc<TensorSpec>,
    context: Option<String>,
    records_read: u64,
    finished: bool,
}

impl<R: BufRead> LogReader<R> {
    /// Reads the header; `Ok(None)` for an empty stream.
    pub fn open(mut source: R) -> Result<Option<Self>, MlgoError> {
        let Some(header) = read_header(&mut source)? else {
            return Ok(None);
        };
        let feature_specs = header.features.iter().cloned().map(Arc::new).collect();
        let score_spec = Arc::new(header.score.clone());
        Ok(Some(Self {
            source,
            header,
            feature_specs,
            score_spec,
            context: None,
            records_read: 0,
            finished: false,
        }))
    }

    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Blocks for the next record. `Ok(None)` once the stream cleanly ended
    /// at a marker boundary; after an error no further records are produced.
    pub fn next_record(&mut self) -> Result<Option<Record>, MlgoError> {
        if self.finished {
            return Ok(None);
        }
        let result = self.read_record();
        match &result {
            Ok(Some(_)) => self.records_read += 1,
            Ok(None) | Err(_) => self.finished = true,
        }
        result
    }

    pub fn records(self) -> Records<R> {
        Records { reader: Some(self) }
    }

    fn read_record(&mut self) -> Result<Option<Record>, MlgoError> {
        loop {
            let Some(line) = read_marker_line(&mut self.source, "marker")? else {
                return Ok(None);
            };
            match parse_marker(&line)? {
                Marker::Context(marker) => {
                    self.context = Some(marker.context);
                }
                Marker::Observation(marker) => {
                    return self.read_observation(marker.observation).map(Some);
                }
                Marker::Outcome(marker) => {
                    return Err(MlgoError::Framing(format!(
                        "outcome {} without a preceding observation",
                        marker.outcome
                    )));
                }
            }
        }
    }

    fn read_observation(&mut self, observation_id: i64) -> Result<Record, MlgoError> {
        let context = self.context.clone().ok_or_else(|| {
            MlgoError::Framing(format!(
                "observation {observation_id} appears before any context marker"
            ))
        })?;

        let mut feature_values = Vec::with_capacity(self.feature_specs.len());
        for spec in &self.feature_specs {
            feature_values.push(read_tensor(&mut self.source, spec)?);
        }
        expect_delimiter(&mut self.source, "observation tensors")?;

        let line = read_marker_line(&mut self.source, "outcome marker")?.ok_or_else(|| {
            MlgoError::Framing(format!(
                "stream ended before the outcome of observation {observation_id}"
            ))
        })?;
        match parse_marker(&line)? {
            Marker::Outcome(marker) if marker.outcome == observation_id => {}
            Marker::Outcome(marker) => {
                return Err(MlgoError::Framing(format!(
                    "expected outcome {observation_id}, found outcome {}",
                    marker.outcome
                )));
            }
            other => {
                return Err(MlgoError::Framing(format!(
                    "expected outcome {observation_id}, found {other:?}"
                )));
            }
        }
        let score = read_tensor(&mut self.source, &self.score_spec)?;
        expect_delimiter(&mut self.source, "outcome tensor")?;

        Ok(Record {
            context,
            observation_id,
            feature_values,
            score,
        })
    }
}

/// Fused iterator over the records of a log.
pub struct Records<R> {
    reader: Option<LogReader<R>>,
}

impl<R: BufRead> Records<R> {
    fn empty() -> Self {
        Self { reader: None }
    }

    /// `None` for an empty stream or once the iterator is exhausted.
    pub fn header(&self) -> Option<&LogHeader> {
        self.reader.as_ref().map(LogReader::header)
    }
}

impl<R: BufRead> Iterator for Records<R> {
    type Item = Result<Record, MlgoError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        match reader.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.reader = None;
                None
            }
            Err(err) => {
                self.reader = None;
                Some(Err(err))
            }
        }
    }
}

/// Opens a log file. An empty file yields no records.
pub fn read_log(path: impl AsRef<Path>) -> Result<Records<BufReader<File>>, MlgoError> {
    let file = File::open(path.as_ref()).map_err(|e| {
        MlgoError::Io(format!("open {}: {e}", path.as_ref().display()))
    })?;
    Ok(match LogReader::open(BufReader::new(file))? {
        Some(reader) => reader.records(),
        None => Records::empty(),
    })
}

// ── Grouped view ──────────────────────────────────────────────────────────────

/// Per-observation value of one feature, laid out like `tf.train.Feature`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Int64List(Vec<i64>),
    FloatList(Vec<f32>),
}

impl Feature {
    pub fn from_tensor(value: &TensorValue) -> Self {
        match value.to_i64_vec() {
            Some(ints) => Self::Int64List(ints),
            None => Self::FloatList(value.to_f64_vec().into_iter().map(|v| v as f32).collect()),
        }
    }
}

/// All observations of one context, keyed by feature name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SequenceExample {
    pub feature_lists: BTreeMap<String, Vec<Feature>>,
}

impl SequenceExample {
    pub fn push(&mut self, value: &TensorValue) {
        self.feature_lists
            .entry(value.name().to_string())
            .or_default()
            .push(Feature::from_tensor(value));
    }

    /// Number of observations folded into this example.
    pub fn len(&self) -> usize {
        self.feature_lists.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Folds records into one sequence example per context, in first-seen order.
pub fn group_by_context<I>(records: I) -> Result<IndexMap<String, SequenceExample>, MlgoError>
where
    I: IntoIterator<Item = Result<Record, MlgoError>>,
{
    let mut grouped: IndexMap<String, SequenceExample> = IndexMap::new();
    for record in records {
        let record = record?;
        let example = grouped.entry(record.context.clone()).or_default();
        example.push(&record.score);
        for value in &record.feature_values {
            example.push(value);
        }
    }
    Ok(grouped)
}

pub fn read_log_as_sequence_examples(
    path: impl AsRef<Path>,
) -> Result<IndexMap<String, SequenceExample>, MlgoError> {
    group_by_context(read_log(path)?)
}

// ── Framing primitives ────────────────────────────────────────────────────────

/// Reads one `\n`-terminated line without the delimiter. `Ok(None)` only for
/// EOF before the first byte.
fn read_marker_line<R: BufRead>(source: &mut R, what: &str) -> Result<Option<Vec<u8>>, MlgoError> {
    let mut line = Vec::new();
    let read = source
        .by_ref()
        .take(MAX_MARKER_BYTES + 1)
        .read_until(DELIMITER, &mut line)
        .map_err(|e| MlgoError::Io(format!("reading {what}: {e}")))?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&DELIMITER) {
        if read as u64 > MAX_MARKER_BYTES {
            return Err(MlgoError::Framing(format!(
                "{what} exceeds {MAX_MARKER_BYTES} bytes without a delimiter"
            )));
        }
        return Err(MlgoError::Framing(format!(
            "stream ended inside {what}: {}",
            preview(&line)
        )));
    }
    line.pop();
    Ok(Some(line))
}

fn parse_marker(line: &[u8]) -> Result<Marker, MlgoError> {
    serde_json::from_slice(line)
        .map_err(|e| MlgoError::Framing(format!("malformed marker: {e}; line={}", preview(line))))
}

fn read_tensor<R: BufRead>(source: &mut R, spec: &Arc<TensorSpec>) -> Result<TensorValue, MlgoError> {
    let expected = spec.byte_size();
    let mut bytes = Vec::new();
    source
        .by_ref()
        .take(expected as u64)
        .read_to_end(&mut bytes)
        .map_err(|e| MlgoError::Io(format!("reading tensor `{}`: {e}", spec.name)))?;
    TensorValue::from_bytes(Arc::clone(spec), bytes)
}

fn expect_delimiter<R: BufRead>(source: &mut R, after: &str) -> Result<(), MlgoError> {
    let mut byte = [0u8; 1];
    let read = source
        .read(&mut byte)
        .map_err(|e| MlgoError::Io(format!("reading delimiter after {after}: {e}")))?;
    if read == 0 {
        return Err(MlgoError::Framing(format!(
            "stream ended before the delimiter after {after}"
        )));
    }
    if byte[0] != DELIMITER {
        return Err(MlgoError::Framing(format!(
            "expected newline after {after}, found byte {:#04x}",
            byte[0]
        )));
    }
    Ok(())
}

fn preview(bytes: &[u8]) -> String {
    String::from_utf8_lossy(&bytes[..bytes.len().min(256)]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_writer::LogWriter;
    use crate::tensor::DType;
    use std::io::Cursor;

    fn header() -> LogHeader {
        LogHeader {
            features: vec![TensorSpec::new("times_called", vec![1], DType::Int64)],
            score: TensorSpec::new("reward", vec![1], DType::Float32),
            advice: None,
        }
    }

    fn stream(observations: usize) -> Vec<u8> {
        let mut writer = LogWriter::new(Vec::new());
        writer.write_header(&header()).expect("header");
        writer.write_context("main").expect("context");
        for idx in 0..observations {
            writer.write_observation_marker(idx as i64).expect("obs");
            writer.write_values(&[idx as i64]).expect("values");
            writer.write_newline().expect("newline");
            writer.write_outcome_marker(idx as i64).expect("outcome");
            writer.write_values(&[0.5f32]).expect("score");
            writer.write_newline().expect("newline");
        }
        writer.into_inner()
    }

    #[test]
    fn header_with_overflowing_shape_is_rejected() {
        let line = br#"{"features":[{"name":"huge","port":0,"shape":[4611686018427387904,4],"type":"int64_t"}],"score":{"name":"reward","port":0,"shape":[1],"type":"float"}}"#;
        let mut bytes = line.to_vec();
        bytes.extend_from_slice(b"\n{\"context\":\"main\"}\n{\"observation\":0}\n");
        let err = read_header(&mut Cursor::new(bytes)).expect_err("overflow");
        assert!(matches!(err, MlgoError::Framing(_)));
    }

    #[test]
    fn large_declared_tensor_with_few_bytes_is_truncation() {
        let huge = LogHeader {
            features: vec![TensorSpec::new("huge", vec![1 << 40], DType::Int8)],
            ..header()
        };
        let mut writer = LogWriter::new(Vec::new());
        writer.write_header(&huge).expect("header");
        writer.write_context("main").expect("context");
        writer.write_observation_marker(0).expect("obs");
        writer.write_values(&[1i8, 2]).expect("values");

        let mut reader = LogReader::open(Cursor::new(writer.into_inner()))
            .expect("header")
            .expect("present");
        let err = reader.next_record().expect_err("short");
        assert!(matches!(err, MlgoError::TruncatedBuffer { actual: 2, .. }));
    }

    #[test]
    fn empty_stream_has_no_header() {
        let mut source = Cursor::new(Vec::<u8>::new());
        assert!(read_header(&mut source).expect("no error").is_none());
    }

    #[test]
    fn half_written_header_is_a_framing_error() {
        let mut source = Cursor::new(b"{\"features\": [".to_vec());
        let err = read_header(&mut source).expect_err("partial header");
        assert!(matches!(err, MlgoError::Framing(message) if message.contains("stream ended inside header")));
    }

    #[test]
    fn header_rejects_unknown_keys() {
        let mut source = Cursor::new(
            b"{\"features\": [], \"score\": {\"name\": \"r\", \"port\": 0, \"shape\": [1], \"type\": \"float\"}, \"extra\": 1}\n"
                .to_vec(),
        );
        let err = read_header(&mut source).expect_err("unknown key");
        assert!(format!("{err}").contains("malformed header"));
    }

    #[test]
    fn reads_records_in_order_and_then_stops() {
        let mut reader = LogReader::open(Cursor::new(stream(3)))
            .expect("open")
            .expect("header");
        for idx in 0..3 {
            let record = reader.next_record().expect("record").expect("some");
            assert_eq!(record.context, "main");
            assert_eq!(record.observation_id, idx);
            assert_eq!(record.feature_values[0].values::<i64>().expect("i64"), vec![idx]);
        }
        assert!(reader.next_record().expect("clean eof").is_none());
        assert!(reader.next_record().expect("still done").is_none());
        assert_eq!(reader.records_read(), 3);
    }

    #[test]
    fn observation_without_context_is_rejected() {
        let mut writer = LogWriter::new(Vec::new());
        writer.write_header(&header()).expect("header");
        writer.write_observation_marker(0).expect("obs");
        let reader = LogReader::open(Cursor::new(writer.into_inner()))
            .expect("open")
            .expect("header");
        let err = reader.records().next().expect("item").expect_err("framing");
        assert!(format!("{err}").contains("before any context marker"));
    }

    #[test]
    fn mismatched_outcome_id_is_rejected() {
        let mut writer = LogWriter::new(Vec::new());
        writer.write_header(&header()).expect("header");
        writer.write_context("main").expect("context");
        writer.write_observation_marker(4).expect("obs");
        writer.write_values(&[1i64]).expect("values");
        writer.write_newline().expect("newline");
        writer.write_outcome_marker(5).expect("outcome");
        writer.write_values(&[0.5f32]).expect("score");
        writer.write_newline().expect("newline");
        let err = read_all(writer.into_inner()).expect_err("mismatch");
        assert!(format!("{err}").contains("expected outcome 4, found outcome 5"));
    }

    #[test]
    fn eof_inside_a_frame_is_an_error() {
        let mut bytes = stream(1);
        let cut = bytes.len() - 18;
        bytes.truncate(cut);
        let err = read_all(bytes).expect_err("truncated");
        assert!(err.is_stream_corruption());
    }

    #[test]
    fn grouping_appends_repeated_contexts() {
        let mut bytes = stream(1);
        let mut writer = LogWriter::new(Vec::new());
        writer.write_context("other").expect("context");
        writer
            .write_observation(
                0,
                &[TensorValue::from_slice("times_called", vec![1], &[7i64]).expect("t")],
                &TensorValue::from_slice("reward", vec![1], &[1.0f32]).expect("s"),
            )
            .expect("obs");
        writer.write_context("main").expect("context");
        writer
            .write_observation(
                1,
                &[TensorValue::from_slice("times_called", vec![1], &[9i64]).expect("t")],
                &TensorValue::from_slice("reward", vec![1], &[2.0f32]).expect("s"),
            )
            .expect("obs");
        bytes.extend(writer.into_inner());

        let reader = LogReader::open(Cursor::new(bytes)).expect("open").expect("header");
        let grouped = group_by_context(reader.records()).expect("grouped");
        assert_eq!(grouped.keys().collect::<Vec<_>>(), vec!["main", "other"]);
        assert_eq!(grouped["main"].len(), 2);
        assert_eq!(
            grouped["main"].feature_lists["times_called"],
            vec![Feature::Int64List(vec![0]), Feature::Int64List(vec![9])]
        );
    }

    fn read_all(bytes: Vec<u8>) -> Result<Vec<Record>, MlgoError> {
        let reader = LogReader::open(Cursor::new(bytes))?.ok_or_else(|| {
            MlgoError::Framing("missing header".to_string())
        })?;
        reader.records().collect()
    }
}
