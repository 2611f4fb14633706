//! Recordings directory
//!
//! Takes live as flat files in one directory. Tracks refer to them by file
//! name, so the directory can move without rewriting the track store.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// Writable storage for take files
pub trait AudioStorage: Send + Sync {
    /// Directory new takes are written to
    fn root(&self) -> &Path;

    /// Create the storage directory if needed
    fn ensure_dir(&self) -> EngineResult<()>;

    /// Reserve a fresh, unique path for a new take
    fn allocate_take_path(&self) -> EngineResult<PathBuf>;

    /// Resolve a track's audio reference to a readable path
    fn resolve(&self, audio_ref: &str) -> EngineResult<PathBuf>;

    /// Audio reference for a path inside this storage
    fn audio_ref_for(&self, path: &Path) -> EngineResult<String>;

    /// Delete a stored take. Missing files are not an error.
    fn delete(&self, audio_ref: &str) -> EngineResult<()>;
}

/// Takes stored under a local directory
#[derive(Debug, Clone)]
pub struct RecordingsDir {
    dir: PathBuf,
}

impl RecordingsDir {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Generate a unique file name for a new take
    fn generate_filename() -> String {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let uuid = uuid::Uuid::new_v4().to_string()[..8].to_string();
        format!("take_{}_{}.wav", timestamp, uuid)
    }

    /// Take files in the directory, newest first
    pub fn list_recordings(&self) -> EngineResult<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "wav"))
            .filter_map(|path| {
                let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((modified, path))
            })
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }
}

impl AudioStorage for RecordingsDir {
    fn root(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> EngineResult<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn allocate_take_path(&self) -> EngineResult<PathBuf> {
        self.ensure_dir()?;
        Ok(self.dir.join(Self::generate_filename()))
    }

    fn resolve(&self, audio_ref: &str) -> EngineResult<PathBuf> {
        let name = Path::new(audio_ref);
        // References are bare file names; anything else could escape the directory
        if name.components().count() != 1 || name.file_name().is_none() {
            return Err(EngineError::InvalidTrack(format!(
                "audio reference '{}' is not a file name",
                audio_ref
            )));
        }
        Ok(self.dir.join(name))
    }

    fn audio_ref_for(&self, path: &Path) -> EngineResult<String> {
        match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) if parent == self.dir => {
                Ok(name.to_string_lossy().into_owned())
            }
            _ => Err(EngineError::InvalidTrack(format!(
                "{} is outside {}",
                path.display(),
                self.dir.display()
            ))),
        }
    }

    fn delete(&self, audio_ref: &str) -> EngineResult<()> {
        let path = self.resolve(audio_ref)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                log::info!("Deleted take {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_paths_are_unique_and_resolvable() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordingsDir::new(dir.path().join("takes"));

        let a = storage.allocate_take_path().unwrap();
        let b = storage.allocate_take_path().unwrap();
        assert_ne!(a, b);
        assert!(storage.root().is_dir());

        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("take_") && name.ends_with(".wav"));
        assert_eq!(storage.audio_ref_for(&a).unwrap(), name);
        assert_eq!(storage.resolve(&name).unwrap(), a);
    }

    #[test]
    fn test_resolve_rejects_paths() {
        let storage = RecordingsDir::new("/tmp/takes");
        assert!(storage.resolve("../etc/passwd").is_err());
        assert!(storage.resolve("a/b.wav").is_err());
        assert!(storage.audio_ref_for(Path::new("/elsewhere/x.wav")).is_err());
    }

    #[test]
    fn test_delete_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordingsDir::new(dir.path());
        fs::write(dir.path().join("one.wav"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(storage.list_recordings().unwrap().len(), 1);
        storage.delete("one.wav").unwrap();
        storage.delete("one.wav").unwrap();
        assert!(storage.list_recordings().unwrap().is_empty());
    }
}
