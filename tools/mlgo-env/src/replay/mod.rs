//! Trace capture and offline replay of compiler log streams.
//!
//! # Overview
//!
//! When a session is opened with a trace directory, every byte read from
//! the compiler's `P.out` pipe is copied into `<module>-<session>.log` and
//! hashed; teardown writes the SHA-256 next to it. A trace is itself a valid
//! training log, so [`replayer::TraceReplayer`] can step through it with the
//! same `First` / `Mid` / `Last` shape as the live environment, without a
//! compiler.

pub mod recorder;
pub mod replayer;
