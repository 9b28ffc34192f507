use std::{
    fs::File,
    io::{self, BufWriter, ErrorKind},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use tempfile::NamedTempFile;
use tokio::{fs, task};
use tracing::{info, warn};
use uuid::Uuid;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

/// Local filesystem layout for bulk exports: one scratch directory per job
/// holding one file per document, and one archive per job under
/// `archive_root`.
#[derive(Debug, Clone)]
pub struct ExportStorage {
    scratch_root: PathBuf,
    archive_root: PathBuf,
}

impl ExportStorage {
    pub fn new(scratch_root: impl Into<PathBuf>, archive_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            archive_root: archive_root.into(),
        }
    }

    pub fn scratch_dir(&self, job_id: Uuid) -> PathBuf {
        self.scratch_root.join(job_id.to_string())
    }

    pub fn archive_path(&self, job_id: Uuid) -> PathBuf {
        self.archive_root.join(format!("bulk-download-{job_id}.zip"))
    }

    pub async fn write_entry(&self, job_id: Uuid, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let name = entry_name(file_name)
            .ok_or_else(|| anyhow!("invalid export file name {file_name:?}"))?;
        let dir = self.scratch_dir(job_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create scratch dir {}", dir.display()))?;

        let path = dir.join(name);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Zips every file in the job's scratch directory into the job archive.
    /// The archive only appears at its final path once fully written.
    pub async fn compress(&self, job_id: Uuid) -> Result<(PathBuf, usize)> {
        let scratch = self.scratch_dir(job_id);
        let destination = self.archive_path(job_id);
        let archive_root = self.archive_root.clone();

        task::spawn_blocking(move || -> Result<(PathBuf, usize)> {
            std::fs::create_dir_all(&archive_root).with_context(|| {
                format!("failed to create archive dir {}", archive_root.display())
            })?;
            let staging = NamedTempFile::new_in(&archive_root)
                .context("failed to create staging archive")?;
            let entries = write_archive(&scratch, staging.as_file())?;
            staging
                .persist(&destination)
                .map_err(|err| anyhow!("failed to persist archive: {}", err.error))?;
            Ok((destination, entries))
        })
        .await
        .context("archive task panicked")?
    }

    pub async fn remove_scratch(&self, job_id: Uuid) -> Result<()> {
        let dir = self.scratch_dir(job_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(job_id = %job_id, path = %dir.display(), "removed export scratch dir");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", dir.display())),
        }
    }

    pub async fn remove_archive(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "archive already missing");
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

fn write_archive(scratch: &Path, target: &File) -> Result<usize> {
    let mut files: Vec<PathBuf> = match std::fs::read_dir(scratch) {
        Ok(read_dir) => read_dir
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect(),
        Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to list {}", scratch.display()))
        }
    };
    files.sort();

    let mut writer = ZipWriter::new(BufWriter::new(target));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in &files {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        writer
            .start_file(name, options)
            .with_context(|| format!("failed to add {name} to archive"))?;
        let mut source = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        io::copy(&mut source, &mut writer)
            .with_context(|| format!("failed to compress {}", path.display()))?;
    }

    writer.finish().context("failed to finalize archive")?;
    Ok(files.len())
}

/// Reduces a suggested file name to a bare name safe to place in the scratch
/// directory.
pub fn entry_name(raw: &str) -> Option<&str> {
    let name = raw.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name)
    }
}
