use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::{
    collections::{BTreeSet, HashMap},
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use walkdir::WalkDir;

/// Minimum name-similarity ratio for a previously processed folder to be
/// reused as a copy source. Tunable; exactly the threshold still matches.
pub const SIBLING_MATCH_THRESHOLD: f64 = 0.6;

const USER_AGENT: &str = "statsmith";

/// Fill `dest` with every name in `required`, sourcing in order from what is
/// already on disk, from the closest-named sibling folder under
/// `sibling_root`, and finally from the CDN. Returns the number of freshly
/// downloaded files; sibling copies do not count.
///
/// Per-item failures are logged and skipped. Re-running recomputes the
/// missing set from disk, so interrupted batches heal on the next pass.
pub fn reconcile(
    cdn_base: &str,
    app_id: &str,
    source_stem: &str,
    required: &BTreeSet<String>,
    dest: &Path,
    sibling_root: &Path,
    report: impl Fn(usize, usize),
    should_pause: impl Fn() -> bool,
) -> Result<usize> {
    fs::create_dir_all(dest).context("create image dir")?;
    let existing = scan_existing(dest);

    let mut copied: BTreeSet<String> = BTreeSet::new();
    if let Some(sibling) = find_closest_sibling(sibling_root, source_stem) {
        debug!("closest sibling folder: {}", sibling.display());
        let available = index_jpgs(&sibling);
        for name in required {
            if existing.contains(name) {
                continue;
            }
            let Some(src) = available.get(name) else {
                continue;
            };
            match fs::copy(src, dest.join(name)) {
                Ok(_) => {
                    copied.insert(name.clone());
                }
                Err(err) => warn!("copy {} from sibling failed: {err}", name),
            }
        }
        if !copied.is_empty() {
            info!("reused {} image(s) from {}", copied.len(), sibling.display());
        }
    }

    let missing: Vec<&String> = required
        .iter()
        .filter(|name| !existing.contains(*name) && !copied.contains(*name))
        .collect();
    if missing.is_empty() {
        return Ok(0);
    }

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(15))
        .timeout_read(Duration::from_secs(15))
        .timeout_write(Duration::from_secs(15))
        .build();

    let total = missing.len();
    let mut downloaded = 0usize;
    for (index, name) in missing.iter().enumerate() {
        if should_pause() {
            info!("paused before item {}/{total}", index + 1);
            break;
        }
        let url = format!("{cdn_base}/community_assets/images/apps/{app_id}/{name}");
        match fetch_to(&agent, &url, &dest.join(name.as_str())) {
            Ok(()) => downloaded += 1,
            Err(err) => warn!("fetch {url} failed: {err}"),
        }
        report(index + 1, total);
    }

    Ok(downloaded)
}

/// `.jpg` file names already physically present in `dir`.
pub fn scan_existing(dir: &Path) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.to_ascii_lowercase().ends_with(".jpg") && entry.path().is_file() {
            out.insert(name);
        }
    }
    out
}

/// The direct subdirectory of `root` whose name best resembles `stem`,
/// if the best ratio clears the reuse threshold.
pub fn find_closest_sibling(root: &Path, stem: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    let mut best: Option<(f64, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let ratio = similarity_ratio(&name, stem);
        if best.as_ref().map(|(r, _)| ratio > *r).unwrap_or(true) {
            best = Some((ratio, path));
        }
    }
    match best {
        Some((ratio, path)) if ratio >= SIBLING_MATCH_THRESHOLD => Some(path),
        _ => None,
    }
}

/// Case-insensitive longest-matching-blocks ratio in 0..1, the classic
/// sequence-matcher formula: twice the matched character count over the
/// combined length.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let matched = match_len(&a, &b);
    (2.0 * matched as f64) / ((a.len() + b.len()) as f64)
}

fn match_len(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    // Longest common substring, then recurse on both unmatched sides.
    let mut best_len = 0usize;
    let mut best_a = 0usize;
    let mut best_b = 0usize;
    let mut prev = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        let mut cur = vec![0usize; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            if ca == cb {
                let len = prev[j] + 1;
                cur[j + 1] = len;
                if len > best_len {
                    best_len = len;
                    best_a = i + 1 - len;
                    best_b = j + 1 - len;
                }
            }
        }
        prev = cur;
    }
    if best_len == 0 {
        return 0;
    }
    best_len
        + match_len(&a[..best_a], &b[..best_b])
        + match_len(&a[best_a + best_len..], &b[best_b + best_len..])
}

fn index_jpgs(root: &Path) -> HashMap<String, PathBuf> {
    let mut out = HashMap::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.to_ascii_lowercase().ends_with(".jpg") {
            out.entry(name).or_insert_with(|| entry.path().to_path_buf());
        }
    }
    out
}

fn fetch_to(agent: &ureq::Agent, url: &str, dest: &Path) -> Result<()> {
    let response = agent
        .get(url)
        .set("User-Agent", USER_AGENT)
        .call()
        .context("fetch image")?;
    let mut reader = response.into_reader();

    // Stage next to the destination so the visible file is never truncated.
    let mut temp_name = dest.file_name().map(std::ffi::OsString::from).unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = dest.with_file_name(temp_name);
    let mut file = File::create(&temp_path).context("create image temp file")?;
    if let Err(err) = io::copy(&mut reader, &mut file) {
        drop(file);
        let _ = fs::remove_file(&temp_path);
        return Err(err).context("write image temp file");
    }
    drop(file);
    fs::rename(&temp_path, dest).context("finalize image file")?;
    Ok(())
}
