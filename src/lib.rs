//! Layerdeck - a pocket multi-track recorder engine
//!
//! Records takes from a low-latency input stream into 16-bit PCM container
//! files, plays existing tracks back against a single master clock, and
//! overdubs new takes aligned to the timeline with latency compensation.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod latency;
pub mod models;
pub mod settings;
pub mod state;
pub mod waveform;

pub use config::{AudioFormat, EngineConfig};
pub use engine::{Engine, EngineSnapshot};
pub use error::{EngineError, EngineResult};
pub use models::Track;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    static SERIAL: Mutex<()> = Mutex::new(());

    /// Tests that open the capture device hold this for their whole run
    pub(crate) fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
