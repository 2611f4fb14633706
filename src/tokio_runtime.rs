//! Tokio runtime for the engine's scheduler context
//!
//! Playback timers, the position tick and the bounded waits all run here.
//! Two workers are plenty: the real-time audio threads and the file writer
//! live outside the runtime.

use tokio::runtime::Runtime;

use layerdeck::{EngineError, EngineResult};

/// Build the runtime the binary drives the engine on
pub fn build() -> EngineResult<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("layerdeck-sched")
        .enable_all()
        .build()
        .map_err(EngineError::Io)
}
