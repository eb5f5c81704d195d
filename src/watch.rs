use crate::pipeline::{self, PipelineContext};
use anyhow::{Context, Result};
use log::{debug, warn};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Duration,
};

/// Poll the watch folder and feed newly dropped snapshots to a fixed pool
/// of worker threads. Workers race freely across files; per-game ordering
/// is the pipeline's concern. Runs until the process is killed.
pub fn run(ctx: Arc<PipelineContext>) -> Result<()> {
    fs::create_dir_all(&ctx.config.watch_dir).context("create watch dir")?;

    let (tx, rx) = mpsc::channel::<PathBuf>();
    let rx = Arc::new(Mutex::new(rx));
    let workers = ctx.config.workers.max(1);
    for _ in 0..workers {
        let ctx = ctx.clone();
        let rx = rx.clone();
        thread::spawn(move || loop {
            let job = {
                let guard = match rx.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                guard.recv()
            };
            let Ok(path) = job else {
                break;
            };
            ctx.jobs.started();
            if let Err(err) = pipeline::run_file(&ctx, &path) {
                warn!("{} failed: {err:#}", path.display());
            }
            ctx.jobs.finished();
        });
    }

    let mut dispatched: HashSet<String> = HashSet::new();
    loop {
        for path in scan_new(&ctx.config.watch_dir, &mut dispatched, &ctx) {
            ctx.jobs.enqueued();
            if tx.send(path).is_err() {
                break;
            }
        }
        let (queued, active) = ctx.jobs.snapshot();
        if queued + active > 0 {
            debug!("{queued} queued, {active} active");
        }
        thread::sleep(Duration::from_secs(ctx.config.poll_secs.max(1)));
    }
}

/// Snapshot files in `dir` not yet dispatched this process and not already
/// verified complete in the progress store.
pub fn scan_new(
    dir: &Path,
    dispatched: &mut HashSet<String>,
    ctx: &PipelineContext,
) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_html = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("html"))
            .unwrap_or(false);
        if !is_html {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if dispatched.contains(&name) {
            continue;
        }
        dispatched.insert(name.clone());
        if ctx.progress_percent(&name) == Some(100) {
            debug!("{name} already verified complete, skipping");
            continue;
        }
        out.push(path);
    }
    out
}
