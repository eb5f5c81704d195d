use crate::{
    assets,
    bundle::{self, BundlePaths},
    config::AppConfig,
    extract::{self, AchievementRecord, HIDDEN_PREFIX},
    progress::ProgressStore,
    registry::Registry,
};
use anyhow::{Context, Result};
use log::{info, warn};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

pub type PromptFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Advisory queued/active pair for status display. Never used for
/// admission control.
#[derive(Debug, Default)]
pub struct JobCounter {
    counts: Mutex<(usize, usize)>,
}

impl JobCounter {
    pub fn enqueued(&self) {
        let mut counts = lock(&self.counts);
        counts.0 += 1;
    }

    pub fn started(&self) {
        let mut counts = lock(&self.counts);
        counts.0 = counts.0.saturating_sub(1);
        counts.1 += 1;
    }

    pub fn finished(&self) {
        let mut counts = lock(&self.counts);
        counts.1 = counts.1.saturating_sub(1);
    }

    /// (queued, active)
    pub fn snapshot(&self) -> (usize, usize) {
        *lock(&self.counts)
    }
}

#[derive(Debug, Default)]
struct DirLocks {
    json: Mutex<()>,
    dlc: Mutex<()>,
}

/// Everything a worker needs, passed explicitly: config, the durable
/// stores, the per-output-directory lock table, and the per-file prompt
/// and pause flags.
pub struct PipelineContext {
    pub config: AppConfig,
    progress: Mutex<ProgressStore>,
    registry: Mutex<Registry>,
    dir_locks: Mutex<HashMap<String, Arc<DirLocks>>>,
    prompted: Mutex<HashSet<String>>,
    paused: Mutex<HashSet<String>>,
    pub jobs: JobCounter,
    prompt: PromptFn,
}

impl PipelineContext {
    pub fn new(config: AppConfig, prompt: PromptFn) -> Self {
        let progress = ProgressStore::new(&config.output_root);
        let registry = Registry::new(&config.output_root);
        Self {
            config,
            progress: Mutex::new(progress),
            registry: Mutex::new(registry),
            dir_locks: Mutex::new(HashMap::new()),
            prompted: Mutex::new(HashSet::new()),
            paused: Mutex::new(HashSet::new()),
            jobs: JobCounter::default(),
            prompt,
        }
    }

    pub fn progress_percent(&self, file: &str) -> Option<u8> {
        lock(&self.progress).percent(file)
    }

    pub fn set_paused(&self, file: &str, pause: bool) {
        let mut paused = lock(&self.paused);
        if pause {
            paused.insert(file.to_string());
        } else {
            paused.remove(file);
        }
    }

    pub fn is_paused(&self, file: &str) -> bool {
        lock(&self.paused).contains(file)
    }

    fn set_progress(&self, file: &str, percent: u8) {
        if let Err(err) = lock(&self.progress).set(file, percent) {
            warn!("progress update for {file} failed: {err}");
        }
    }

    fn clear_progress(&self, file: &str) {
        if let Err(err) = lock(&self.progress).remove(file) {
            warn!("progress reset for {file} failed: {err}");
        }
    }

    /// One lock pair per resolved output directory, created on first use
    /// and retained for the process lifetime.
    fn locks_for(&self, dir: &Path) -> Arc<DirLocks> {
        let key = fs::canonicalize(dir)
            .unwrap_or_else(|_| dir.to_path_buf())
            .to_string_lossy()
            .to_string();
        let mut table = lock(&self.dir_locks);
        table
            .entry(key)
            .or_insert_with(|| Arc::new(DirLocks::default()))
            .clone()
    }

    fn mark_prompted(&self, file: &str) -> bool {
        lock(&self.prompted).insert(file.to_string())
    }

    /// Apply the two cleanup decisions, prompting at most once per source
    /// file. Decisions are replayed from the registry on reruns, and the
    /// prompts are skipped entirely once a prior run reached 100%.
    fn resolve_cleanup(
        &self,
        file_name: &str,
        records: &[AchievementRecord],
        completed_before: bool,
    ) -> Vec<AchievementRecord> {
        let mut records = records.to_vec();
        let prior = lock(&self.registry).find(file_name);

        let has_multiplayer = records.iter().any(|record| record.multiplayer);
        let has_hidden_prefix = records
            .iter()
            .any(|record| record.description.starts_with(HIDDEN_PREFIX));

        let mut remove_multiplayer = prior.as_ref().and_then(|p| p.remove_multiplayer);
        let mut strip_hidden_prefix = prior.as_ref().and_then(|p| p.strip_hidden_prefix);

        let needs_prompt = (has_multiplayer && remove_multiplayer.is_none())
            || (has_hidden_prefix && strip_hidden_prefix.is_none());
        if needs_prompt && !completed_before && self.mark_prompted(file_name) {
            if has_multiplayer && remove_multiplayer.is_none() {
                remove_multiplayer =
                    Some((self.prompt)("Multiplayer achievements found. Remove them?"));
            }
            if has_hidden_prefix && strip_hidden_prefix.is_none() {
                strip_hidden_prefix = Some((self.prompt)(
                    "Clean descriptions that start with \"Hidden achievement:\"?",
                ));
            }
            let registry = lock(&self.registry);
            if let Err(err) =
                registry.set_decisions(file_name, remove_multiplayer, strip_hidden_prefix)
            {
                warn!("recording cleanup decisions for {file_name} failed: {err}");
            }
        }

        if remove_multiplayer == Some(true) {
            records.retain(|record| !record.multiplayer);
        }
        if strip_hidden_prefix == Some(true) {
            for record in &mut records {
                if let Some(rest) = record.description.strip_prefix(HIDDEN_PREFIX) {
                    record.description = rest.trim_start().to_string();
                }
            }
        }
        records
    }
}

/// Process one snapshot end to end. Fatal extractor errors propagate to the
/// caller; everything downstream degrades, logs, and leaves the file
/// eligible for a retry.
pub fn run_file(ctx: &PipelineContext, html_path: &Path) -> Result<()> {
    let file_name = html_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .context("source file name")?;
    info!("processing {file_name}");
    let completed_before = ctx.progress_percent(&file_name) == Some(100);
    ctx.set_progress(&file_name, 0);

    let html = fs::read_to_string(html_path).context("read html snapshot")?;
    let page = extract::extract(&html)?;
    let identity = page.identity.clone();

    // The same game re-saved under a new file name must not grow a second
    // bundle; drop the newcomer.
    let duplicate = lock(&ctx.registry).find_duplicate(&identity.app_id, &file_name);
    if let Some(prior) = duplicate {
        warn!(
            "app {} already processed from {}; removing duplicate input {file_name}",
            identity.app_id, prior.source_file
        );
        remove_input_and_side_folder(html_path);
        ctx.clear_progress(&file_name);
        return Ok(());
    }

    let paths = BundlePaths::resolve(&ctx.config.output_root, &identity.title);
    paths.create_dirs()?;
    bundle::write_app_id(&paths.settings_dir, &identity.app_id)?;
    {
        let registry = lock(&ctx.registry);
        let folder = paths
            .game_dir
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        registry.upsert(&file_name, &identity.app_id, &folder)?;
    }
    ctx.set_progress(&file_name, 15);

    let records = ctx.resolve_cleanup(&file_name, &page.achievements, completed_before);

    let locks = ctx.locks_for(&paths.game_dir);
    {
        let _guard = lock(&locks.json);
        bundle::write_achievements(&paths.settings_dir, &records)?;
    }
    ctx.set_progress(&file_name, 35);

    if let Some(extra) = ctx.config.extra_dir.as_deref() {
        if extra.is_dir() {
            match bundle::copy_extra_files(extra, &paths.settings_dir) {
                Ok(count) => info!("copied {count} extra file(s) into {file_name} bundle"),
                Err(err) => warn!("extra files copy for {file_name} failed: {err}"),
            }
        }
    }

    // Images come from the full page record set; the interactive filter
    // only shapes the JSON output.
    let required = extract::required_images(&page.achievements);
    let source_stem = html_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();
    let downloaded = assets::reconcile(
        &ctx.config.cdn_base,
        &identity.app_id,
        &source_stem,
        &required,
        &paths.images_dir,
        ctx.config.sibling_root(),
        |done, total| {
            let percent = 40 + ((done * 50) / total.max(1)) as u8;
            ctx.set_progress(&file_name, percent);
        },
        || ctx.is_paused(&file_name),
    )?;
    if downloaded > 0 {
        info!("downloaded {downloaded} image(s) for app {}", identity.app_id);
    }

    if !page.dlc.is_empty() {
        let _json_guard = lock(&locks.json);
        let _dlc_guard = lock(&locks.dlc);
        if bundle::dlc_files_exist(&paths.settings_dir) {
            info!("DLC outputs already present for {file_name}, skipping");
        } else {
            bundle::write_dlc(&paths.settings_dir, &page.dlc)?;
        }
    }
    ctx.set_progress(&file_name, 95);

    if verify_bundle(
        &required,
        &paths,
        ctx.config.extra_dir.as_deref(),
        !page.dlc.is_empty(),
    ) {
        ctx.set_progress(&file_name, 100);
        info!("{file_name} complete");
    } else {
        ctx.clear_progress(&file_name);
        warn!("{file_name} failed verification; it will re-run from scratch next pass");
    }
    Ok(())
}

/// A run only counts as done when the bundle on disk proves it: every
/// required image present, the extra-files tree mirrored, and DLC outputs
/// written whenever the page had DLC.
pub fn verify_bundle(
    required: &BTreeSet<String>,
    paths: &BundlePaths,
    extra_dir: Option<&Path>,
    expect_dlc: bool,
) -> bool {
    let present = assets::scan_existing(&paths.images_dir);
    if !required.iter().all(|name| present.contains(name)) {
        return false;
    }
    if let Some(extra) = extra_dir {
        if extra.is_dir() && !bundle::extra_files_mirrored(extra, &paths.settings_dir) {
            return false;
        }
    }
    if expect_dlc && !bundle::dlc_files_exist(&paths.settings_dir) {
        return false;
    }
    true
}

fn remove_input_and_side_folder(html_path: &Path) {
    if let Err(err) = fs::remove_file(html_path) {
        warn!("removing duplicate input {} failed: {err}", html_path.display());
    }
    if let Some(stem) = html_path.file_stem() {
        let mut side_name = stem.to_os_string();
        side_name.push("_files");
        let side = html_path.with_file_name(side_name);
        if side.is_dir() {
            if let Err(err) = fs::remove_dir_all(&side) {
                warn!("removing side folder {} failed: {err}", side.display());
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bundle_with(present: &[&str]) -> (tempfile::TempDir, BundlePaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = BundlePaths::resolve(dir.path(), "Game");
        paths.create_dirs().unwrap();
        for name in present {
            fs::write(paths.images_dir.join(name), b"img").unwrap();
        }
        (dir, paths)
    }

    #[test]
    fn verification_fails_on_any_missing_image() {
        let required: BTreeSet<String> =
            ["a.jpg".into(), "b.jpg".into(), "c.jpg".into()].into();
        let (_dir, paths) = bundle_with(&["a.jpg", "b.jpg"]);
        assert!(!verify_bundle(&required, &paths, None, false));

        fs::write(paths.images_dir.join("c.jpg"), b"img").unwrap();
        assert!(verify_bundle(&required, &paths, None, false));
    }

    #[test]
    fn verification_fails_when_expected_dlc_is_absent() {
        let required = BTreeSet::new();
        let (_dir, paths) = bundle_with(&[]);
        assert!(!verify_bundle(&required, &paths, None, true));

        bundle::write_dlc(
            &paths.settings_dir,
            &std::collections::BTreeMap::from([(500u32, "Pack".to_string())]),
        )
        .unwrap();
        assert!(verify_bundle(&required, &paths, None, true));
    }

    #[test]
    fn verification_fails_when_extra_files_are_not_mirrored() {
        let required = BTreeSet::new();
        let (dir, paths) = bundle_with(&[]);
        let extra = dir.path().join("extra");
        fs::create_dir_all(&extra).unwrap();
        fs::write(extra.join("steam_interfaces.txt"), b"x").unwrap();

        assert!(!verify_bundle(&required, &paths, Some(&extra), false));
        bundle::copy_extra_files(&extra, &paths.settings_dir).unwrap();
        assert!(verify_bundle(&required, &paths, Some(&extra), false));
    }

    #[test]
    fn job_counter_tracks_queue_and_active() {
        let jobs = JobCounter::default();
        jobs.enqueued();
        jobs.enqueued();
        assert_eq!(jobs.snapshot(), (2, 0));
        jobs.started();
        assert_eq!(jobs.snapshot(), (1, 1));
        jobs.finished();
        jobs.finished();
        assert_eq!(jobs.snapshot(), (1, 0));
    }

    // A snapshot with sentinel-only icons: no CDN images required, so full
    // runs complete without touching the network.
    const FIXTURE: &str = r#"<html><head>
        <link rel="canonical" href="https://steamdb.info/app/440/stats/">
        </head><body>
        <h1 itemprop="name">Test Game</h1>
        <div id="achievement-ACH_1">
            <div class="achievement_api">ACH_1</div>
            <div class="achievement_name">Team Player</div>
            <div class="achievement_desc">Win together</div>
            <div class="achievement_group">Multiplayer</div>
        </div>
        <div id="achievement-ACH_2">
            <div class="achievement_api">ACH_2</div>
            <div class="achievement_name">Sneaky</div>
            <div class="achievement_desc">Hidden achievement: Finish quietly</div>
        </div>
        <span>DLC 500</span>
        <table>
            <tr data-appid="500"><td><a>500</a></td><td>Expansion Pack</td></tr>
        </table>
        </body></html>"#;

    fn counting_prompt(count: Arc<AtomicUsize>, answer: bool) -> PromptFn {
        Arc::new(move |_question: &str| {
            count.fetch_add(1, Ordering::SeqCst);
            answer
        })
    }

    fn ctx_for(output_root: &Path, prompt: PromptFn) -> PipelineContext {
        let config = AppConfig {
            output_root: output_root.to_path_buf(),
            ..AppConfig::default()
        };
        PipelineContext::new(config, prompt)
    }

    #[test]
    fn run_file_produces_a_verified_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Test Game.html");
        fs::write(&input, FIXTURE).unwrap();
        let out = dir.path().join("out");

        let prompts = Arc::new(AtomicUsize::new(0));
        let ctx = ctx_for(&out, counting_prompt(prompts.clone(), true));
        run_file(&ctx, &input).unwrap();

        let settings = out.join("Test Game").join("steam_settings");
        assert_eq!(fs::read_to_string(settings.join("steam_appid.txt")).unwrap(), "440");

        let raw = fs::read_to_string(settings.join("achievements.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entries = parsed.as_array().unwrap();
        // Multiplayer removal dropped ACH_1, prefix stripping cleaned ACH_2.
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["name"], "ACH_2");
        assert_eq!(entries[0]["description"], "Finish quietly");

        assert_eq!(
            fs::read_to_string(settings.join("DLC.txt")).unwrap(),
            "500=Expansion Pack\n"
        );
        assert_eq!(
            fs::read_to_string(settings.join("configs.app.ini")).unwrap(),
            "[app::dlcs]\nunlock_all=1\n500=Expansion Pack\n"
        );

        assert_eq!(prompts.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.progress_percent("Test Game.html"), Some(100));
    }

    #[test]
    fn second_run_replays_decisions_without_reprompting() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Test Game.html");
        fs::write(&input, FIXTURE).unwrap();
        let out = dir.path().join("out");

        let prompts = Arc::new(AtomicUsize::new(0));
        let ctx = ctx_for(&out, counting_prompt(prompts.clone(), true));
        run_file(&ctx, &input).unwrap();
        let settings = out.join("Test Game").join("steam_settings");
        let first = fs::read(settings.join("achievements.json")).unwrap();
        let first_dlc = fs::read(settings.join("DLC.txt")).unwrap();
        assert_eq!(prompts.load(Ordering::SeqCst), 2);

        // Fresh context simulates a new process; decisions replay from the
        // run registry instead of prompting again.
        let ctx = ctx_for(&out, counting_prompt(prompts.clone(), false));
        run_file(&ctx, &input).unwrap();
        assert_eq!(prompts.load(Ordering::SeqCst), 2);
        assert_eq!(fs::read(settings.join("achievements.json")).unwrap(), first);
        assert_eq!(fs::read(settings.join("DLC.txt")).unwrap(), first_dlc);
    }

    #[test]
    fn duplicate_app_id_input_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("Test Game.html");
        fs::write(&first, FIXTURE).unwrap();
        let out = dir.path().join("out");

        let ctx = ctx_for(&out, Arc::new(|_| false));
        run_file(&ctx, &first).unwrap();

        // The same page re-saved under a new name, side folder included.
        let resaved = dir.path().join("Test Game (1).html");
        fs::write(&resaved, FIXTURE).unwrap();
        let side = dir.path().join("Test Game (1)_files");
        fs::create_dir_all(&side).unwrap();

        run_file(&ctx, &resaved).unwrap();
        assert!(!resaved.exists());
        assert!(!side.exists());
        assert!(first.exists());
        assert_eq!(ctx.progress_percent("Test Game (1).html"), None);
    }

    #[test]
    fn declined_prompts_keep_all_records() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Test Game.html");
        fs::write(&input, FIXTURE).unwrap();
        let out = dir.path().join("out");

        let ctx = ctx_for(&out, Arc::new(|_| false));
        run_file(&ctx, &input).unwrap();

        let settings = out.join("Test Game").join("steam_settings");
        let raw = fs::read_to_string(settings.join("achievements.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entries = parsed.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["description"], "Hidden achievement: Finish quietly");
    }
}
