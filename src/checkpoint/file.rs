//! File-based checkpointer.
//!
//! Checkpoints are stored as JSON files under a per-run directory, named by
//! superstep, with optional zstd compression:
//!
//! ```text
//! checkpoints/
//! └── {run_id}/
//!     ├── checkpoint_00003.json[.zst]
//!     └── checkpoint_00007.json[.zst]
//! ```
//!
//! Writes go to a temporary file first and are renamed into place.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{Checkpointer, RunCheckpoint};
use crate::error::WorkflowError;

#[derive(Debug)]
pub struct FileCheckpointer {
    run_path: PathBuf,
    compression: bool,
}

impl FileCheckpointer {
    /// Create a checkpointer storing under `base_path/{run_id}/`.
    pub fn new(base_path: impl Into<PathBuf>, run_id: impl AsRef<str>, compression: bool) -> Self {
        Self {
            run_path: base_path.into().join(run_id.as_ref()),
            compression,
        }
    }

    fn checkpoint_path(&self, superstep: usize) -> PathBuf {
        let filename = if self.compression {
            format!("checkpoint_{:05}.json.zst", superstep)
        } else {
            format!("checkpoint_{:05}.json", superstep)
        };
        self.run_path.join(filename)
    }

    fn temp_path(&self, superstep: usize) -> PathBuf {
        self.run_path.join(format!("checkpoint_{:05}.tmp", superstep))
    }

    async fn ensure_dir(&self) -> Result<(), WorkflowError> {
        fs::create_dir_all(&self.run_path)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("create directory: {}", e)))
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>, WorkflowError> {
        let mut encoder = zstd::stream::Encoder::new(Vec::new(), 3)
            .map_err(|e| WorkflowError::checkpoint(format!("compression init: {}", e)))?;
        encoder
            .write_all(data)
            .map_err(|e| WorkflowError::checkpoint(format!("compression write: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| WorkflowError::checkpoint(format!("compression finish: {}", e)))
    }

    fn decompress(data: &[u8]) -> Result<Vec<u8>, WorkflowError> {
        zstd::stream::decode_all(data)
            .map_err(|e| WorkflowError::checkpoint(format!("decompression: {}", e)))
    }

    fn parse_superstep(path: &Path) -> Option<usize> {
        let filename = path.file_name()?.to_str()?;
        let digits = filename.strip_prefix("checkpoint_")?.split('.').next()?;
        if filename.ends_with(".tmp") {
            return None;
        }
        digits.parse().ok()
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn save(&self, checkpoint: &RunCheckpoint) -> Result<(), WorkflowError> {
        self.ensure_dir().await?;

        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| WorkflowError::checkpoint(format!("serialize: {}", e)))?;
        let data = if self.compression {
            Self::compress(&json)?
        } else {
            json
        };

        let temp_path = self.temp_path(checkpoint.superstep);
        let final_path = self.checkpoint_path(checkpoint.superstep);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("create temp file: {}", e)))?;
        file.write_all(&data)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("write: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("sync: {}", e)))?;

        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("rename: {}", e)))?;

        tracing::info!(
            superstep = checkpoint.superstep,
            path = %final_path.display(),
            "checkpoint saved"
        );
        Ok(())
    }

    async fn load(&self, superstep: usize) -> Result<Option<RunCheckpoint>, WorkflowError> {
        let path = self.checkpoint_path(superstep);
        if !path.exists() {
            return Ok(None);
        }

        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("open: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("read: {}", e)))?;

        let json = if self.compression {
            Self::decompress(&data)?
        } else {
            data
        };
        let checkpoint = serde_json::from_slice(&json)
            .map_err(|e| WorkflowError::checkpoint(format!("deserialize: {}", e)))?;
        Ok(Some(checkpoint))
    }

    async fn latest(&self) -> Result<Option<RunCheckpoint>, WorkflowError> {
        match self.list().await?.last() {
            Some(superstep) => self.load(*superstep).await,
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<usize>, WorkflowError> {
        if !self.run_path.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.run_path)
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("read directory: {}", e)))?;
        let mut supersteps = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkflowError::checkpoint(format!("read entry: {}", e)))?
        {
            if let Some(superstep) = Self::parse_superstep(&entry.path()) {
                supersteps.push(superstep);
            }
        }
        supersteps.sort_unstable();
        Ok(supersteps)
    }

    async fn delete(&self, superstep: usize) -> Result<(), WorkflowError> {
        let path = self.checkpoint_path(superstep);
        if path.exists() {
            fs::remove_file(&path)
                .await
                .map_err(|e| WorkflowError::checkpoint(format!("delete: {}", e)))?;
        }
        Ok(())
    }
}
