//! Persistence collaborators: take storage and the track store

pub mod database;
pub mod storage;

pub use database::{JsonTrackStore, TrackStore};
pub use storage::{AudioStorage, RecordingsDir};
