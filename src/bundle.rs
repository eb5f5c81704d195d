use crate::extract::AchievementRecord;
use crate::sanitize::safe_folder_name;
use anyhow::{Context, Result};
use log::warn;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

pub const SETTINGS_DIR: &str = "steam_settings";
pub const IMAGES_DIR: &str = "achievement_images";
pub const APPID_FILE: &str = "steam_appid.txt";
pub const ACHIEVEMENTS_FILE: &str = "achievements.json";
pub const DLC_FILE: &str = "DLC.txt";
pub const DLC_INI_FILE: &str = "configs.app.ini";

/// Resolved output locations for one game.
#[derive(Debug, Clone)]
pub struct BundlePaths {
    pub game_dir: PathBuf,
    pub settings_dir: PathBuf,
    pub images_dir: PathBuf,
}

impl BundlePaths {
    pub fn resolve(output_root: &Path, title: &str) -> Self {
        let game_dir = output_root.join(safe_folder_name(title));
        let settings_dir = game_dir.join(SETTINGS_DIR);
        let images_dir = settings_dir.join(IMAGES_DIR);
        Self {
            game_dir,
            settings_dir,
            images_dir,
        }
    }

    pub fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.images_dir).context("create bundle dirs")
    }
}

/// On-disk achievement object. The shim historically read both `icongray`
/// and `icon_gray`, so both spellings carry the same value.
#[derive(Serialize)]
struct AchievementOut<'a> {
    name: &'a str,
    defaultvalue: i64,
    #[serde(rename = "displayName")]
    display_name: &'a str,
    hidden: u8,
    description: &'a str,
    icon: &'a str,
    icongray: &'a str,
    icon_gray: &'a str,
}

pub fn write_app_id(settings_dir: &Path, app_id: &str) -> Result<()> {
    write_atomic_text(&settings_dir.join(APPID_FILE), app_id)
}

pub fn write_achievements(settings_dir: &Path, records: &[AchievementRecord]) -> Result<()> {
    let out: Vec<AchievementOut<'_>> = records
        .iter()
        .map(|record| AchievementOut {
            name: &record.api_name,
            defaultvalue: record.default_value,
            display_name: &record.display_name,
            hidden: u8::from(record.hidden),
            description: &record.description,
            icon: &record.icon,
            icongray: &record.icon_gray,
            icon_gray: &record.icon_gray,
        })
        .collect();
    let mut raw = serde_json::to_string_pretty(&out).context("serialize achievements")?;
    raw.push('\n');
    write_atomic_text(&settings_dir.join(ACHIEVEMENTS_FILE), &raw)
}

pub fn dlc_files_exist(settings_dir: &Path) -> bool {
    settings_dir.join(DLC_FILE).exists() && settings_dir.join(DLC_INI_FILE).exists()
}

pub fn write_dlc(settings_dir: &Path, dlc: &BTreeMap<u32, String>) -> Result<()> {
    let mut lines = String::new();
    for (id, title) in dlc {
        lines.push_str(&format!("{id}={title}\n"));
    }
    write_atomic_text(&settings_dir.join(DLC_FILE), &lines)?;

    let mut ini = String::from("[app::dlcs]\nunlock_all=1\n");
    ini.push_str(&lines);
    write_atomic_text(&settings_dir.join(DLC_INI_FILE), &ini)
}

/// Mirror the extra-files tree into the bundle, preserving relative paths.
/// Per-file copy failures are logged and skipped. Returns files copied.
pub fn copy_extra_files(extra_dir: &Path, settings_dir: &Path) -> Result<usize> {
    let mut copied = 0usize;
    for entry in WalkDir::new(extra_dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("extra files walk error: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(extra_dir) else {
            continue;
        };
        let dest = settings_dir.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context("create extra file dir")?;
        }
        match fs::copy(entry.path(), &dest) {
            Ok(_) => copied += 1,
            Err(err) => warn!("copy extra file {} failed: {err}", relative.display()),
        }
    }
    Ok(copied)
}

/// True when every file under `extra_dir` exists at its mirrored path.
pub fn extra_files_mirrored(extra_dir: &Path, settings_dir: &Path) -> bool {
    for entry in WalkDir::new(extra_dir) {
        let Ok(entry) = entry else {
            return false;
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(extra_dir) else {
            return false;
        };
        if !settings_dir.join(relative).is_file() {
            return false;
        }
    }
    true
}

pub fn write_atomic_text(path: &Path, contents: &str) -> Result<()> {
    let parent = path.parent().context("output file parent")?;
    fs::create_dir_all(parent).context("create output dir")?;
    let file_name = path.file_name().context("output file name")?;
    let mut temp_name = std::ffi::OsString::from(file_name);
    temp_name.push(".tmp");
    let temp_path = parent.join(temp_name);
    fs::write(&temp_path, contents).context("write output temp file")?;
    fs::rename(&temp_path, path).context("finalize output file")?;
    Ok(())
}
