//! JSON-based track store
//!
//! A project is one JSON file holding its track rows. The whole list is
//! rewritten on every change; projects hold a handful of tracks.

use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::Track;

use super::storage::AudioStorage;

/// Persistence for track rows
pub trait TrackStore: Send {
    /// All tracks, ordered by display order
    fn list(&self) -> Vec<Track>;

    fn get(&self, id: Uuid) -> Option<Track>;

    fn insert(&mut self, track: Track) -> EngineResult<()>;

    fn update(&mut self, track: &Track) -> EngineResult<()>;

    /// Remove a track and its audio file
    fn delete(&mut self, id: Uuid, storage: &dyn AudioStorage) -> EngineResult<Track>;

    /// Display order for a newly added track
    fn next_display_order(&self) -> u32;
}

/// Track store backed by a pretty-printed JSON file
pub struct JsonTrackStore {
    path: PathBuf,
    tracks: Vec<Track>,
}

impl JsonTrackStore {
    /// Open the store at `path`. A missing file is an empty project.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tracks = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let tracks: Vec<Track> = serde_json::from_str(&contents)?;
            for track in &tracks {
                track.validate()?;
            }
            tracks
        } else {
            Vec::new()
        };

        let mut store = Self { path, tracks };
        store.sort();
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sort(&mut self) {
        self.tracks
            .sort_by(|a, b| a.display_order.cmp(&b.display_order).then(a.created.cmp(&b.created)));
    }

    /// Ensure the store directory exists
    fn ensure_dir(&self) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn save(&self) -> EngineResult<()> {
        self.ensure_dir()?;
        let contents = serde_json::to_string_pretty(&self.tracks)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }
}

impl TrackStore for JsonTrackStore {
    fn list(&self) -> Vec<Track> {
        self.tracks.clone()
    }

    fn get(&self, id: Uuid) -> Option<Track> {
        self.tracks.iter().find(|t| t.id == id).cloned()
    }

    fn insert(&mut self, track: Track) -> EngineResult<()> {
        track.validate()?;
        if self.tracks.iter().any(|t| t.id == track.id) {
            return Err(EngineError::InvalidTrack(format!(
                "track {} already exists",
                track.id
            )));
        }
        self.tracks.push(track);
        self.sort();
        self.save()
    }

    fn update(&mut self, track: &Track) -> EngineResult<()> {
        track.validate()?;
        let existing = self
            .tracks
            .iter_mut()
            .find(|t| t.id == track.id)
            .ok_or_else(|| EngineError::TrackNotFound(track.id.to_string()))?;
        *existing = track.clone();
        self.sort();
        self.save()
    }

    fn delete(&mut self, id: Uuid, storage: &dyn AudioStorage) -> EngineResult<Track> {
        let index = self
            .tracks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| EngineError::TrackNotFound(id.to_string()))?;
        let track = self.tracks.remove(index);
        self.save()?;
        storage.delete(&track.audio_ref)?;
        Ok(track)
    }

    fn next_display_order(&self) -> u32 {
        self.tracks
            .iter()
            .map(|t| t.display_order + 1)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::storage::RecordingsDir;

    #[test]
    fn test_insert_update_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");

        let mut store = JsonTrackStore::open(&path).unwrap();
        assert!(store.list().is_empty());
        assert_eq!(store.next_display_order(), 0);

        let second = Track::new("b.wav", 1, 2000, 0, 0, 4000).unwrap();
        let first = Track::new("a.wav", 0, 0, 0, 0, 4000).unwrap();
        store.insert(second.clone()).unwrap();
        store.insert(first.clone()).unwrap();
        assert_eq!(store.next_display_order(), 2);

        let mut moved = second.clone();
        moved.set_offset(2500).unwrap();
        store.update(&moved).unwrap();

        let reloaded = JsonTrackStore::open(&path).unwrap();
        let tracks = reloaded.list();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].id, first.id);
        assert_eq!(tracks[1].offset_ms, 2500);
    }

    #[test]
    fn test_rejects_invalid_and_duplicate_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonTrackStore::open(dir.path().join("p.json")).unwrap();

        let track = Track::new("a.wav", 0, 0, 0, 0, 1000).unwrap();
        store.insert(track.clone()).unwrap();
        assert!(store.insert(track.clone()).is_err());

        let mut broken = track.clone();
        broken.trim_start_ms = 900;
        broken.trim_end_ms = 200;
        assert!(matches!(
            store.update(&broken),
            Err(EngineError::InvalidTrack(_))
        ));
    }

    #[test]
    fn test_delete_removes_audio() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordingsDir::new(dir.path());
        fs::write(dir.path().join("a.wav"), b"data").unwrap();

        let mut store = JsonTrackStore::open(dir.path().join("p.json")).unwrap();
        let track = Track::new("a.wav", 0, 0, 0, 0, 1000).unwrap();
        store.insert(track.clone()).unwrap();

        let removed = store.delete(track.id, &storage).unwrap();
        assert_eq!(removed.id, track.id);
        assert!(!dir.path().join("a.wav").exists());
        assert!(matches!(
            store.delete(track.id, &storage),
            Err(EngineError::TrackNotFound(_))
        ));
    }
}
