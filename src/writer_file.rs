//! Local-file output: one JSON document per key in an output directory.
//!
//! Writes go to a temporary file in the same directory which is then
//! renamed over the destination, so Prometheus never reads a partial file.

use async_trait::async_trait;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::WriteError;
use crate::writer::OutputWriter;

pub struct FileWriter {
    dir: PathBuf,
}

impl FileWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, WriteError> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key == "." || key == ".." {
            return Err(WriteError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid output file name '{}'", key),
            )));
        }
        Ok(self.dir.join(key))
    }
}

fn write_atomic(dir: &Path, path: &Path, payload: &[u8]) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(payload)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl OutputWriter for FileWriter {
    fn describe(&self) -> String {
        format!("file:{}", self.dir.display())
    }

    async fn write(&self, key: &str, payload: &str) -> Result<(), WriteError> {
        let path = self.path_for(key)?;
        let dir = self.dir.clone();
        let payload = payload.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &payload))
            .await
            .map_err(|e| WriteError::Io(io::Error::other(e)))??;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<String, WriteError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}
