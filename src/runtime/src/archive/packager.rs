use std::fs::File;
use std::path::{Path, PathBuf};

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::WorkItem;
use tokio_util::sync::CancellationToken;

use super::{
    chunk_name, is_chunk_name, Archiver, CACHE_ENTRY, IMAGESET_CONFIG_ENTRY, WORKING_DIR_ENTRY,
};

/// tar header and padding granularity.
const BLOCK: u64 = 512;

/// One path to pack and its name inside the archive.
#[derive(Debug)]
struct Entry {
    path: PathBuf,
    name: String,
    dir: bool,
    size: u64,
}

impl Entry {
    /// Bytes the entry occupies in the archive.
    fn archived_size(&self) -> u64 {
        BLOCK + self.size.div_ceil(BLOCK) * BLOCK
    }
}

struct Chunk {
    path: PathBuf,
    builder: tar::Builder<File>,
    size: u64,
}

/// Packs the cache and working directory into `mirror_NNNNNN.tar` chunks.
pub struct Packager {
    root_dir: PathBuf,
    working_dir: PathBuf,
    cache_dir: PathBuf,
    config_path: PathBuf,
    max_chunk_bytes: Option<u64>,
    current: Option<Chunk>,
    chunks: Vec<PathBuf>,
}

impl Packager {
    pub fn new(
        root_dir: PathBuf,
        working_dir: PathBuf,
        cache_dir: PathBuf,
        config_path: PathBuf,
        max_chunk_bytes: Option<u64>,
    ) -> Self {
        Self {
            root_dir,
            working_dir,
            cache_dir,
            config_path,
            max_chunk_bytes,
            current: None,
            chunks: Vec::new(),
        }
    }

    /// Chunks written so far.
    pub fn chunks(&self) -> &[PathBuf] {
        &self.chunks
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        let config_size = std::fs::metadata(&self.config_path)
            .map_err(|e| {
                MirrorError::Archive(format!(
                    "imageset configuration {} is not readable: {}",
                    self.config_path.display(),
                    e
                ))
            })?
            .len();

        let mut entries = vec![Entry {
            path: self.config_path.clone(),
            name: IMAGESET_CONFIG_ENTRY.to_string(),
            dir: false,
            size: config_size,
        }];
        walk(&self.working_dir, WORKING_DIR_ENTRY, &mut entries)?;
        walk(&self.cache_dir.join(CACHE_ENTRY), CACHE_ENTRY, &mut entries)?;
        Ok(entries)
    }

    /// Remove chunks left in `root_dir` by an earlier run. The extractor
    /// restores every chunk it finds, so a leftover one would overwrite
    /// fresh content.
    fn remove_stale_chunks(&self) -> Result<()> {
        let entries = match std::fs::read_dir(&self.root_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(MirrorError::Archive(format!(
                    "Failed to read {}: {}",
                    self.root_dir.display(),
                    e
                )))
            }
        };

        for entry in entries {
            let path = entry?.path();
            let stale = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, is_chunk_name);
            if stale && path.is_file() {
                std::fs::remove_file(&path).map_err(|e| {
                    MirrorError::Archive(format!("Failed to remove {}: {}", path.display(), e))
                })?;
                tracing::debug!(chunk = %path.display(), "Removed stale archive chunk");
            }
        }
        Ok(())
    }

    fn open_chunk(&mut self) -> Result<()> {
        let path = self.root_dir.join(chunk_name(self.chunks.len() + 1));
        let file = File::create(&path).map_err(|e| {
            MirrorError::Archive(format!("Failed to create {}: {}", path.display(), e))
        })?;
        tracing::debug!(chunk = %path.display(), "Opened archive chunk");
        self.chunks.push(path.clone());
        self.current = Some(Chunk {
            path,
            builder: tar::Builder::new(file),
            size: 0,
        });
        Ok(())
    }

    fn finish_chunk(&mut self) -> Result<()> {
        if let Some(chunk) = self.current.take() {
            chunk.builder.into_inner().map_err(|e| {
                MirrorError::Archive(format!(
                    "Failed to finalize {}: {}",
                    chunk.path.display(),
                    e
                ))
            })?;
            tracing::debug!(chunk = %chunk.path.display(), bytes = chunk.size, "Closed archive chunk");
        }
        Ok(())
    }

    fn append(&mut self, entry: &Entry) -> Result<()> {
        let needs_new_chunk = match (&self.current, self.max_chunk_bytes) {
            (None, _) => true,
            (Some(chunk), Some(max)) => chunk.size > 0 && chunk.size + entry.archived_size() > max,
            (Some(_), None) => false,
        };
        if needs_new_chunk {
            self.finish_chunk()?;
            self.open_chunk()?;
        }

        let chunk = self
            .current
            .as_mut()
            .ok_or_else(|| MirrorError::Archive("no open archive chunk".to_string()))?;
        let result = if entry.dir {
            chunk.builder.append_dir(&entry.name, &entry.path)
        } else {
            chunk.builder.append_path_with_name(&entry.path, &entry.name)
        };
        result.map_err(|e| {
            MirrorError::Archive(format!("Failed to archive {}: {}", entry.path.display(), e))
        })?;
        chunk.size += entry.archived_size();
        Ok(())
    }
}

impl Archiver for Packager {
    fn build_archive(&mut self, cancel: &CancellationToken, items: &[WorkItem]) -> Result<PathBuf> {
        let entries = self.entries()?;
        self.remove_stale_chunks()?;
        self.chunks.clear();
        tracing::info!(
            images = items.len(),
            entries = entries.len(),
            root = %self.root_dir.display(),
            "Building archive"
        );

        for entry in &entries {
            if cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            self.append(entry)?;
        }
        self.finish_chunk()?;

        let first = self
            .chunks
            .first()
            .cloned()
            .ok_or_else(|| MirrorError::Archive("no archive chunk written".to_string()))?;
        tracing::info!(chunks = self.chunks.len(), first = %first.display(), "Archive built");
        Ok(first)
    }

    fn close(&mut self) -> Result<()> {
        self.finish_chunk()
    }
}

/// Collect `dir` recursively below `prefix`, directories before their
/// contents, in name order. Unfinished uploads are skipped.
fn walk(dir: &Path, prefix: &str, entries: &mut Vec<Entry>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    entries.push(Entry {
        path: dir.to_path_buf(),
        name: prefix.to_string(),
        dir: true,
        size: 0,
    });

    let mut children: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let name = child.file_name().to_string_lossy().into_owned();
        if name == "_uploads" {
            continue;
        }
        let path = child.path();
        let archived = format!("{}/{}", prefix, name);
        let metadata = std::fs::metadata(&path)?;
        if metadata.is_dir() {
            walk(&path, &archived, entries)?;
        } else {
            entries.push(Entry {
                path,
                name: archived,
                dir: false,
                size: metadata.len(),
            });
        }
    }
    Ok(())
}
