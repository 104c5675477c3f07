//! Directory-backed frame store.
//!
//! One file per identifier, named `code_<identifier>.jpg`. Writes go
//! to a hidden temp file in the same directory and are renamed into
//! place, so a reader never observes a partial frame.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::counter::FrameIdentifier;
use crate::error::StampError;

const FILE_PREFIX: &str = "code_";
const FILE_SUFFIX: &str = ".jpg";
const TEMP_SUFFIX: &str = ".tmp";

/// Keyed file store rooted at `<root>/<stream_id>/`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create (if needed) and open the directory for one stream.
    pub async fn open(root: impl AsRef<Path>, stream_id: &str) -> Result<Self, StampError> {
        if stream_id.is_empty() || stream_id.contains(['/', '\\']) || stream_id == ".." {
            return Err(StampError::InvalidConfig(format!(
                "stream id {stream_id:?} is not a plain directory name"
            )));
        }
        let dir = root.as_ref().join(stream_id);
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic location of the frame for `id`.
    pub fn path_for(&self, id: FrameIdentifier) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{id}{FILE_SUFFIX}"))
    }

    fn temp_path_for(&self, id: FrameIdentifier) -> PathBuf {
        self.dir
            .join(format!(".{FILE_PREFIX}{id}{FILE_SUFFIX}{TEMP_SUFFIX}"))
    }

    /// Atomically write the frame for `id`, returning its final path.
    pub async fn write(&self, id: FrameIdentifier, bytes: &[u8]) -> Result<PathBuf, StampError> {
        let temp = self.temp_path_for(id);
        let target = self.path_for(id);

        if let Err(e) = fs::write(&temp, bytes).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(target)
    }

    /// Read back the stored frame for `id`.
    pub async fn read(&self, id: FrameIdentifier) -> Result<Vec<u8>, StampError> {
        Ok(fs::read(self.path_for(id)).await?)
    }

    /// Delete the stored frame for `id`.
    pub async fn remove(&self, id: FrameIdentifier) -> Result<(), StampError> {
        Ok(fs::remove_file(self.path_for(id)).await?)
    }

    /// Identifiers of every frame currently on disk, ascending.
    pub async fn list(&self) -> Result<Vec<FrameIdentifier>, StampError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(parse_file_name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove every stored frame and any leftover temp file.
    /// Returns the number of files deleted.
    pub async fn clear(&self) -> Result<usize, StampError> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let ours = parse_file_name(name).is_some()
                || (name.starts_with('.') && name.ends_with(TEMP_SUFFIX));
            if !ours {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

fn parse_file_name(name: &str) -> Option<FrameIdentifier> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse::<u64>()
        .ok()
        .map(FrameIdentifier::new)
}

// ── Tests ────────────────────────────────────────────────────────
