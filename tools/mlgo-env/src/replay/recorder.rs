//! Byte-exact capture of the compiler's log stream.
//!
//! A [`TraceRecorder`] sits between `P.out` and the protocol reader: every
//! byte the reader consumes is appended to the trace file and fed into a
//! running SHA-256. [`TraceRecorder::finish`] writes the hex digest next to
//! the trace as `<trace>.sha256`.

use crate::errors::MlgoError;
use crate::types::SessionId;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const DIGEST_SUFFIX: &str = "sha256";

struct TraceSink {
    writer: BufWriter<File>,
    hasher: Sha256,
    path: PathBuf,
    finished: bool,
}

/// Cloneable handle; clones share one trace file.
#[derive(Clone)]
pub struct TraceRecorder {
    sink: Arc<Mutex<TraceSink>>,
}

impl TraceRecorder {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, MlgoError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MlgoError::Io(e.to_string()))?;
        }
        let file = File::create(&path)
            .map_err(|e| MlgoError::Io(format!("create {}: {e}", path.display())))?;
        Ok(Self {
            sink: Arc::new(Mutex::new(TraceSink {
                writer: BufWriter::new(file),
                hasher: Sha256::new(),
                path,
                finished: false,
            })),
        })
    }

    /// `<trace_dir>/<module>-<session>.log`, with path separators in the
    /// module name flattened.
    pub fn for_session(
        trace_dir: &Path,
        module_name: &str,
        session_id: SessionId,
    ) -> Result<Self, MlgoError> {
        let module = module_name.replace(['/', '\\'], "_");
        Self::create(trace_dir.join(format!("{module}-{session_id}.log")))
    }

    pub fn path(&self) -> PathBuf {
        self.sink.lock().expect("trace lock poisoned").path.clone()
    }

    pub fn record(&self, bytes: &[u8]) -> Result<(), MlgoError> {
        let mut sink = self.sink.lock().expect("trace lock poisoned");
        if sink.finished {
            return Ok(());
        }
        sink.hasher.update(bytes);
        sink.writer
            .write_all(bytes)
            .map_err(|e| MlgoError::Io(e.to_string()))
    }

    pub fn tee<R: Read>(&self, inner: R) -> TeeReader<R> {
        TeeReader {
            inner,
            recorder: self.clone(),
        }
    }

    /// Flushes the trace and writes the digest sidecar. Later calls return
    /// the sidecar path without touching either file.
    pub fn finish(&self) -> Result<PathBuf, MlgoError> {
        let mut sink = self.sink.lock().expect("trace lock poisoned");
        let digest_path = digest_path_for(&sink.path);
        if sink.finished {
            return Ok(digest_path);
        }
        sink.finished = true;
        sink.writer
            .flush()
            .map_err(|e| MlgoError::Io(e.to_string()))?;
        let digest = to_hex(&std::mem::take(&mut sink.hasher).finalize());
        fs::write(&digest_path, format!("{digest}\n"))
            .map_err(|e| MlgoError::Io(format!("write {}: {e}", digest_path.display())))?;
        Ok(digest_path)
    }
}

/// Forwards reads to `inner`, copying everything read into the recorder.
pub struct TeeReader<R> {
    inner: R,
    recorder: TraceRecorder,
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.recorder
                .record(&buf[..n])
                .map_err(|e| std::io::Error::other(e.to_string()))?;
        }
        Ok(n)
    }
}

pub fn digest_path_for(trace: &Path) -> PathBuf {
    let mut name = trace.as_os_str().to_owned();
    name.push(".");
    name.push(DIGEST_SUFFIX);
    PathBuf::from(name)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    to_hex(&Sha256::digest(bytes))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
