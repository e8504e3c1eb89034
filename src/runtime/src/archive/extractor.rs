use std::fs::File;
use std::path::{Component, Path, PathBuf};

use a3s_mirror_core::error::{MirrorError, Result};

use super::{
    is_chunk_name, UnArchiver, ARCHIVE_EXTENSION, ARCHIVE_PREFIX, CACHE_ENTRY,
    IMAGESET_CONFIG_ENTRY, WORKING_DIR_ENTRY,
};

/// Restores `mirror_*.tar` chunks into the cache and working directory.
pub struct Extractor {
    from_dir: PathBuf,
    working_dir: PathBuf,
    cache_dir: PathBuf,
    current: Option<PathBuf>,
}

impl Extractor {
    pub fn new(from_dir: PathBuf, working_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            from_dir,
            working_dir,
            cache_dir,
            current: None,
        }
    }

    /// Archive chunks in `from_dir`, in name order.
    pub fn chunks(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.from_dir).map_err(|e| {
            MirrorError::Archive(format!(
                "Failed to read archive directory {}: {}",
                self.from_dir.display(),
                e
            ))
        })?;

        let mut chunks = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_chunk = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, is_chunk_name);
            if is_chunk && path.is_file() {
                chunks.push(path);
            }
        }
        chunks.sort();
        Ok(chunks)
    }

    /// Where an archive entry is restored, `None` for entries not restored.
    fn target_for(&self, entry: &Path) -> Result<Option<PathBuf>> {
        if entry
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(MirrorError::Archive(format!(
                "archive entry escapes its target: {}",
                entry.display()
            )));
        }

        let mut components = entry.components().filter(|c| *c != Component::CurDir);
        let Some(Component::Normal(first)) = components.next() else {
            return Ok(None);
        };
        let rest: PathBuf = components.collect();

        match first.to_str() {
            Some(CACHE_ENTRY) => Ok(Some(self.cache_dir.join(CACHE_ENTRY).join(rest))),
            Some(WORKING_DIR_ENTRY) => Ok(Some(self.working_dir.join(rest))),
            Some(IMAGESET_CONFIG_ENTRY) => Ok(None),
            _ => {
                tracing::warn!(entry = %entry.display(), "Skipping unexpected archive entry");
                Ok(None)
            }
        }
    }

    fn extract_chunk(&mut self, chunk: &Path) -> Result<usize> {
        let file = File::open(chunk).map_err(|e| {
            MirrorError::Archive(format!("Failed to open {}: {}", chunk.display(), e))
        })?;
        self.current = Some(chunk.to_path_buf());

        let archive_err =
            |e: std::io::Error| MirrorError::Archive(format!("Failed to read {}: {}", chunk.display(), e));

        let mut archive = tar::Archive::new(file);
        let mut restored = 0;
        for entry in archive.entries().map_err(archive_err)? {
            let mut entry = entry.map_err(archive_err)?;
            let name = entry.path().map_err(archive_err)?.into_owned();
            let Some(target) = self.target_for(&name)? else {
                continue;
            };
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry.unpack(&target).map_err(|e| {
                MirrorError::Archive(format!("Failed to extract {}: {}", name.display(), e))
            })?;
            restored += 1;
        }

        self.current = None;
        Ok(restored)
    }
}

impl UnArchiver for Extractor {
    fn unarchive(&mut self) -> Result<()> {
        let chunks = self.chunks()?;
        if chunks.is_empty() {
            return Err(MirrorError::Archive(format!(
                "no {}*{} archive found in {}",
                ARCHIVE_PREFIX,
                ARCHIVE_EXTENSION,
                self.from_dir.display()
            )));
        }

        for chunk in &chunks {
            let restored = self.extract_chunk(chunk)?;
            tracing::info!(chunk = %chunk.display(), entries = restored, "Extracted archive chunk");
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(chunk) = self.current.take() {
            tracing::debug!(chunk = %chunk.display(), "Released archive chunk");
        }
        Ok(())
    }
}
