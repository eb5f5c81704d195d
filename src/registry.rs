use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// One processed source file: which app id it resolved to, which output
/// folder it produced, and the cleanup decisions made for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub source_file: String,
    pub app_id: String,
    pub folder: String,
    pub processed_at: String,
    #[serde(default)]
    pub remove_multiplayer: Option<bool>,
    #[serde(default)]
    pub strip_hidden_prefix: Option<bool>,
}

/// Durable source-file ↔ app-id ↔ folder index. Backs the duplicate-appid
/// guard and lets reruns replay cleanup decisions instead of re-prompting.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(output_root: &Path) -> Self {
        Self {
            path: output_root.join("runs.json"),
        }
    }

    pub fn load(&self) -> Vec<RunRecord> {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    pub fn find(&self, source_file: &str) -> Option<RunRecord> {
        self.load()
            .into_iter()
            .find(|record| record.source_file == source_file)
    }

    /// A prior run of the same app id under a different source file name.
    pub fn find_duplicate(&self, app_id: &str, source_file: &str) -> Option<RunRecord> {
        self.load()
            .into_iter()
            .find(|record| record.app_id == app_id && record.source_file != source_file)
    }

    /// Insert or replace the record for `source_file`, preserving any
    /// previously stored cleanup decisions.
    pub fn upsert(&self, source_file: &str, app_id: &str, folder: &str) -> Result<RunRecord> {
        let mut records = self.load();
        let existing = records
            .iter()
            .position(|record| record.source_file == source_file);
        let record = RunRecord {
            source_file: source_file.to_string(),
            app_id: app_id.to_string(),
            folder: folder.to_string(),
            processed_at: now_stamp(),
            remove_multiplayer: existing
                .and_then(|index| records[index].remove_multiplayer),
            strip_hidden_prefix: existing
                .and_then(|index| records[index].strip_hidden_prefix),
        };
        match existing {
            Some(index) => records[index] = record.clone(),
            None => records.push(record.clone()),
        }
        self.write_all(&records)?;
        Ok(record)
    }

    pub fn set_decisions(
        &self,
        source_file: &str,
        remove_multiplayer: Option<bool>,
        strip_hidden_prefix: Option<bool>,
    ) -> Result<()> {
        let mut records = self.load();
        let Some(record) = records
            .iter_mut()
            .find(|record| record.source_file == source_file)
        else {
            return Ok(());
        };
        if remove_multiplayer.is_some() {
            record.remove_multiplayer = remove_multiplayer;
        }
        if strip_hidden_prefix.is_some() {
            record.strip_hidden_prefix = strip_hidden_prefix;
        }
        self.write_all(&records)
    }

    fn write_all(&self, records: &[RunRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create registry dir")?;
        }
        let raw = serde_json::to_string_pretty(records).context("serialize run registry")?;

        let mut temp_name = self
            .path
            .file_name()
            .map(std::ffi::OsString::from)
            .unwrap_or_default();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(temp_name);
        fs::write(&temp_path, raw).context("write run registry temp file")?;
        fs::rename(&temp_path, &self.path).context("finalize run registry")?;
        Ok(())
    }
}

fn now_stamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
