use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use walkdir::WalkDir;

use pixcache::thumbnails::ThumbnailEvent;
use pixcache::{AppContext, CoreConfig, DocumentState, ResourceKey};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pixcache=info".parse().context("Bad log directive")?),
        )
        .init();

    let dir = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    if !dir.is_dir() {
        bail!("Not a directory: {:?}", dir);
    }

    let items = scan(&dir);
    info!(?dir, count = items.len(), "Found images");
    let Some(first) = items.first().cloned() else {
        return Ok(());
    };

    let ctx = AppContext::new(CoreConfig::from_env());

    let started = Instant::now();
    let mut document = ctx.open_document(&first);
    let job = ctx.thumbnail_job(items);

    match document.wait_loaded().await {
        DocumentState::Failed(reason) => warn!(key = %first, %reason, "Failed to open image"),
        state => info!(key = %first, ?state, elapsed = ?started.elapsed(), "Opened image"),
    }

    let mut thumbnails = 0usize;
    let mut broken = 0usize;
    while let Some(event) = job.next_event().await {
        match event {
            ThumbnailEvent::Loaded(result) => {
                thumbnails += 1;
                if result.broken {
                    broken += 1;
                    warn!(key = %result.key, "No thumbnail");
                }
            }
            ThumbnailEvent::Finished => break,
        }
    }

    let stats = ctx.cache().stats();
    info!(
        thumbnails,
        broken,
        cache_entries = stats.entries,
        cache_bytes = stats.total_size,
        elapsed = ?started.elapsed(),
        "Done"
    );
    Ok(())
}

/// Image files directly inside `dir`, sorted by name.
fn scan(dir: &Path) -> Vec<ResourceKey> {
    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        })
        .collect();
    paths.sort();
    paths
        .iter()
        .filter_map(|p| ResourceKey::from_path(p))
        .collect()
}
