use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

/// Completion percentage for one source file. 100 means the bundle passed
/// post-run verification; anything lower is a resumable partial state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub percent: u8,
}

/// Durable per-file progress, keyed by source file name. State here is
/// advisory: reads degrade to empty, writes merge over what is on disk so
/// independent callers never clobber each other's slice.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    pub fn new(output_root: &Path) -> Self {
        Self {
            path: output_root.join("progress.json"),
        }
    }

    pub fn load(&self) -> HashMap<String, ProgressRecord> {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return HashMap::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    /// Read-merge-write: new keys added, existing keys overwritten, then
    /// flushed to stable storage before returning.
    pub fn save(&self, partial: &HashMap<String, ProgressRecord>) -> Result<()> {
        let mut current = self.load();
        for (file, record) in partial {
            current.insert(file.clone(), record.clone());
        }
        self.write_all(&current)
    }

    pub fn set(&self, file: &str, percent: u8) -> Result<()> {
        let partial = HashMap::from([(file.to_string(), ProgressRecord { percent })]);
        self.save(&partial)
    }

    pub fn remove(&self, file: &str) -> Result<()> {
        let mut current = self.load();
        if current.remove(file).is_none() {
            return Ok(());
        }
        self.write_all(&current)
    }

    pub fn percent(&self, file: &str) -> Option<u8> {
        self.load().get(file).map(|record| record.percent)
    }

    fn write_all(&self, state: &HashMap<String, ProgressRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create progress dir")?;
        }
        let raw = serde_json::to_string_pretty(state).context("serialize progress")?;

        let mut temp_name = self
            .path
            .file_name()
            .map(std::ffi::OsString::from)
            .unwrap_or_default();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(temp_name);

        let mut file = File::create(&temp_path).context("create progress temp file")?;
        file.write_all(raw.as_bytes()).context("write progress temp file")?;
        file.sync_all().context("flush progress file")?;
        drop(file);
        fs::rename(&temp_path, &self.path).context("finalize progress file")?;
        Ok(())
    }
}
