#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

//! Demo executable for the discover-city moderation pipeline.
//!
//! Wires a [`ModerationPipeline`] with a stub classifier, filesystem storage
//! and an in-memory post repository, then reads commands from stdin so the
//! full flow can be tried by hand: validate → store → text gate → image
//! gate → commit → persist.
//!
//! Settings come from the environment (see `ModerationConfig::from_env`) or
//! from the YAML file named by `MODERATION_CONFIG`.

mod stub_model;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use discover_moderation::{
    ClipDraft, FsArtifactStorage, MemoryPostRepository, ModerationConfig, ModerationPipeline,
    OrphanSweeper, Outcome, PostDraft, PostKind, Upload,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::stub_model::StubLoader;

const HELP: &str = "\
commands:
  post <title> [| <description>]    text-only post
  image <path> <title>              post with an image
  check <path>                      advisory pre-check of an image
  clip <path> <seconds> <caption>   short video clip
  sweep                             purge stale provisional uploads now
  stats                             moderation counters
  help                              this text
  exit | quit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    let upload_dir =
        std::env::var("MODERATION_UPLOAD_DIR").unwrap_or_else(|_| "./uploads".to_owned());
    let storage = Arc::new(
        FsArtifactStorage::open(&upload_dir)
            .await
            .with_context(|| format!("cannot open upload directory {upload_dir}"))?,
    );
    let repository = Arc::new(MemoryPostRepository::new());

    let pipeline = ModerationPipeline::bootstrap(
        config,
        Arc::new(StubLoader::new(Duration::from_millis(800))),
        storage,
        repository,
    )
    .context("moderation pipeline failed to start")?;
    let sweeper = pipeline.spawn_sweeper(Duration::from_secs(60));

    println!("discover-city moderation demo (uploads in {upload_dir})");
    println!("{HELP}\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            println!("\nEOF, bye.");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            println!("bye.");
            break;
        }

        if let Err(err) = run_command(&pipeline, line).await {
            eprintln!("error: {err:#}");
        }
    }

    sweeper.abort();
    Ok(())
}

fn load_config() -> Result<ModerationConfig> {
    match std::env::var("MODERATION_CONFIG") {
        Ok(path) => ModerationConfig::from_yaml(Path::new(&path)),
        Err(_) => ModerationConfig::from_env().context("invalid moderation settings in environment"),
    }
}

async fn run_command(pipeline: &ModerationPipeline, line: &str) -> Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command.to_ascii_lowercase().as_str() {
        "help" => println!("{HELP}"),
        "post" => {
            let (title, description) = rest.split_once('|').unwrap_or((rest, ""));
            let draft = PostDraft::new(title.trim(), PostKind::Post)
                .with_description(description.trim())
                .with_hashtags(hashtags_in(description));
            report_post(pipeline, None, draft).await?;
        }
        "image" => {
            let (path, title) = rest.split_once(' ').unwrap_or((rest, ""));
            let upload = read_upload(path).await?;
            let draft = PostDraft::new(title.trim(), PostKind::Discovery);
            report_post(pipeline, Some(upload), draft).await?;
        }
        "check" => {
            let bytes = tokio::fs::read(rest)
                .await
                .with_context(|| format!("cannot read {rest}"))?;
            let outcome = pipeline.advisory_gate.assess(Bytes::from(bytes)).await;
            println!("advisory: {outcome:?}");
            if let Some(message) = outcome.user_message() {
                println!("message: {message}");
            }
        }
        "clip" => {
            let mut parts = rest.splitn(3, ' ');
            let path = parts.next().unwrap_or_default();
            let seconds: f64 = parts
                .next()
                .unwrap_or_default()
                .parse()
                .context("clip duration must be a number of seconds")?;
            let caption = parts.next().unwrap_or_default().to_owned();

            let upload = read_upload(path).await?;
            let draft = ClipDraft {
                caption,
                duration_seconds: seconds,
                location: String::new(),
                coordinates: None,
            };
            match pipeline.orchestrator.submit_clip(upload, draft).await? {
                Outcome::Accepted(clip) => println!("clip {} accepted → {}", clip.id, clip.video_url),
                Outcome::Rejected(r) => println!("rejected: {}", r.user_message()),
            }
        }
        "sweep" => {
            let sweeper = OrphanSweeper::new(
                Arc::clone(pipeline.storage()),
                pipeline.config.provisional_ttl(),
            );
            let purged = sweeper.sweep_once().await?;
            println!("purged {purged} orphaned upload(s)");
        }
        "stats" => {
            let snap = pipeline.stats.snapshot();
            println!("classifier ready: {}", pipeline.classifier.is_ready());
            println!("submissions: {:?}", snap.submissions);
            println!("verdicts:    {:?}", snap.verdicts);
            println!("classifier errors: {}", snap.classifier_errors);
            println!(
                "latency ms: last {:.1}, ema {:.1}, min {:.1}, max {:.1}",
                snap.latency.last_ms, snap.latency.avg_ms_ema, snap.latency.min_ms, snap.latency.max_ms
            );
        }
        other => println!("unknown command {other:?}, try `help`"),
    }
    Ok(())
}

async fn report_post(
    pipeline: &ModerationPipeline,
    upload: Option<Upload>,
    draft: PostDraft,
) -> Result<()> {
    match pipeline.orchestrator.submit(upload, draft).await? {
        Outcome::Accepted(post) => {
            info!(id = %post.id, "demo post stored");
            println!(
                "post {} accepted{}",
                post.id,
                post.image_url
                    .map(|url| format!(" → {url}"))
                    .unwrap_or_default()
            );
        }
        Outcome::Rejected(r) => println!("rejected: {}", r.user_message()),
    }
    Ok(())
}

async fn read_upload(path: &str) -> Result<Upload> {
    if path.starts_with("data:") {
        return Upload::from_data_url(path).map_err(|r| anyhow::anyhow!(r.user_message()));
    }
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read {path}"))?;
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_owned();
    Ok(Upload::new(bytes, content_type_for(path)).with_file_name(name))
}

fn content_type_for(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

fn hashtags_in(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|w| w.len() > 1 && w.starts_with('#'))
        .map(str::to_owned)
        .collect()
}
