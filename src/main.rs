mod assets;
mod bundle;
mod config;
mod extract;
mod pipeline;
mod progress;
mod registry;
mod sanitize;
mod watch;

use anyhow::{bail, Result};
use config::AppConfig;
use pipeline::{PipelineContext, PromptFn};
use std::{
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let mut html_path: Option<PathBuf> = None;
    let mut watch_mode = false;
    let mut watch_dir: Option<PathBuf> = None;
    let mut output_root: Option<PathBuf> = None;
    let mut forced_answer: Option<bool> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--watch" | "-w" => watch_mode = true,
            "--dir" | "-d" => {
                let Some(path) = args.next() else {
                    bail!("--dir requires a path");
                };
                watch_dir = Some(PathBuf::from(path));
            }
            "--out" | "-o" => {
                let Some(path) = args.next() else {
                    bail!("--out requires a path");
                };
                output_root = Some(PathBuf::from(path));
            }
            "--yes" | "-y" => forced_answer = Some(true),
            "--no" | "-n" => forced_answer = Some(false),
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                if html_path.is_some() {
                    bail!("unexpected argument: {other}");
                }
                html_path = Some(PathBuf::from(other));
            }
        }
    }

    let mut config = AppConfig::load_or_create()?;
    if let Some(dir) = watch_dir {
        config.watch_dir = dir;
    }
    if let Some(out) = output_root {
        config.output_root = out;
    }

    let prompt: PromptFn = match forced_answer {
        Some(answer) => Arc::new(move |_: &str| answer),
        None => Arc::new(prompt_stdin),
    };
    let ctx = Arc::new(PipelineContext::new(config, prompt));

    if watch_mode {
        return watch::run(ctx);
    }

    let Some(path) = html_path else {
        print_help();
        bail!("a snapshot path or --watch is required");
    };
    if !path.is_file() {
        bail!("file not found: {}", path.display());
    }
    let is_html = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("html"))
        .unwrap_or(false);
    if !is_html {
        bail!("the supplied file must have a .html extension");
    }

    ctx.jobs.enqueued();
    ctx.jobs.started();
    let result = pipeline::run_file(&ctx, &path);
    ctx.jobs.finished();
    result
}

fn prompt_stdin(question: &str) -> bool {
    print!("{question} (Y/N): ");
    let _ = io::stdout().flush();
    let mut line = String::new();
    match io::stdin().read_line(&mut line) {
        Ok(read) if read > 0 => line.trim().eq_ignore_ascii_case("y"),
        // No usable prompt channel means no action.
        _ => false,
    }
}

fn print_help() {
    println!("statsmith");
    println!("  <file.html>        Process one saved stats-page snapshot");
    println!("  --watch, -w        Watch the inbox folder for new snapshots");
    println!("  --dir, -d <path>   Override the watch folder");
    println!("  --out, -o <path>   Override the output root");
    println!("  --yes, -y          Answer cleanup prompts with yes");
    println!("  --no, -n           Answer cleanup prompts with no");
    println!("  --help, -h         Show this help");
}
