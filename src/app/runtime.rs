use tracing::{info, warn};

use super::checkpoint::{CheckpointStore, ProcessedSet, keep_going, oldest_first, resume_offset};
use super::config::{Action, Config, Target};
use super::discovery::{DiscoveryTarget, collect_post_links};
use super::download::DownloadManager;
use super::error::Result;
use super::pipeline::Pipeline;
use super::reconcile::{RetryOutcome, cleanup_empty_dirs, retry_failed_posts};
use super::surface::RenderingSurface;
use super::types::PostUrl;

#[derive(Debug, Default)]
pub struct RunSummary {
    pub discovered: usize,
    pub already_processed: usize,
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    pub cleaned: usize,
    pub retry: Option<RetryOutcome>,
}

impl RunSummary {
    pub fn describe(&self) -> String {
        let mut line = format!(
            "discovered={} skipped={} attempted={} completed={} failed={}",
            self.discovered, self.already_processed, self.attempted, self.completed, self.failed
        );
        if self.cleaned > 0 {
            line.push_str(&format!(" cleaned={}", self.cleaned));
        }
        if let Some(retry) = &self.retry {
            line.push_str(&format!(
                " queued={} retried={} recovered={} still_failing={}",
                retry.queued,
                retry.fetch_attempts,
                retry.recovered.len(),
                retry.still_failed.len()
            ));
            if let Some(log) = &retry.remaining_log {
                line.push_str(&format!(" remaining_log={}", log.display()));
            }
        }
        line
    }
}

/// One whole session: crawl or single post, then the retry pass; or one of
/// the error-only modes.
pub async fn run_session<S>(
    surface: &mut S,
    config: &Config,
    downloads: &DownloadManager,
) -> Result<RunSummary>
where
    S: RenderingSurface + ?Sized,
{
    let store = CheckpointStore::open(config.paths.clone())?;
    let mut pipeline = Pipeline::new(surface, config, downloads);
    let mut summary = RunSummary::default();
    info!(
        session = %config.paths.session_dir.display(),
        action = ?config.action,
        "starting session"
    );

    match config.action {
        Action::Crawl => {
            match &config.target {
                Target::Profile { url, username } => {
                    run_profile(&mut pipeline, &store, url, username, &mut summary).await?
                }
                Target::Post { url } => {
                    run_single_post(&mut pipeline, &store, url, &mut summary).await?
                }
            }
            if config.retry_errors {
                summary.retry = Some(retry_failed_posts(&mut pipeline, &store).await?);
            }
        }
        Action::RetryErrorsOnly => {
            summary.retry = Some(retry_failed_posts(&mut pipeline, &store).await?);
        }
        Action::CleanupAndRetry => {
            cleanup_and_retry(&mut pipeline, &store, &mut summary).await?;
        }
    }

    info!(summary = %summary.describe(), "session finished");
    Ok(summary)
}

pub async fn run_profile<S>(
    pipeline: &mut Pipeline<'_, S>,
    store: &CheckpointStore,
    profile_url: &str,
    username: &str,
    summary: &mut RunSummary,
) -> Result<()>
where
    S: RenderingSurface + ?Sized,
{
    let config = pipeline.config();
    let target = DiscoveryTarget {
        profile_url,
        base_url: &config.base_url,
        username: Some(username),
        max_links: config.max_scraped,
    };
    let discovery = collect_post_links(pipeline.surface(), target, &config.scroll).await;
    if let Some(err) = &discovery.aborted {
        warn!("continuing with {} links found before: {err}", discovery.links.len());
    }
    keep_going("writing discovery log", store.write_discovery_log(&discovery.links));
    summary.discovered = discovery.links.len();
    if discovery.links.is_empty() {
        warn!(profile = profile_url, "no posts found");
        return Ok(());
    }

    let ordered = oldest_first(discovery.links);
    let start = if config.resume {
        let pointer = store.read_resume_pointer(&config.base_url, Some(username));
        let offset = resume_offset(&ordered, pointer.as_ref());
        if let Some(pointer) = &pointer {
            info!(%pointer, skipped = offset, "resuming after last downloaded post");
        }
        offset
    } else {
        0
    };

    let mut processed = store.load_processed();
    for url in &ordered[start..] {
        if config.max_grabbed.is_some_and(|max| summary.attempted >= max) {
            info!(max = ?config.max_grabbed, "reached grab limit");
            break;
        }
        if processed.contains(url) {
            summary.already_processed += 1;
            continue;
        }
        grab(pipeline, store, &mut processed, url, summary).await?;
    }
    Ok(())
}

pub async fn run_single_post<S>(
    pipeline: &mut Pipeline<'_, S>,
    store: &CheckpointStore,
    url: &PostUrl,
    summary: &mut RunSummary,
) -> Result<()>
where
    S: RenderingSurface + ?Sized,
{
    summary.discovered = 1;
    let mut processed = store.load_processed();
    if processed.contains(url) && !pipeline.config().download.overwrite {
        info!(%url, "already processed; pass --overwrite to fetch it again");
        summary.already_processed += 1;
        return Ok(());
    }
    grab(pipeline, store, &mut processed, url, summary).await
}

/// Extract, download and verify one post. Only a verified post is recorded
/// as processed and becomes the resume pointer; anything else is logged.
async fn grab<S>(
    pipeline: &mut Pipeline<'_, S>,
    store: &CheckpointStore,
    processed: &mut ProcessedSet,
    url: &PostUrl,
    summary: &mut RunSummary,
) -> Result<()>
where
    S: RenderingSurface + ?Sized,
{
    summary.attempted += 1;
    match pipeline.process(url).await {
        Ok(outcome) if outcome.complete => {
            processed.insert(url);
            keep_going("saving processed urls", store.save_processed(processed));
            keep_going("writing resume pointer", store.write_resume_pointer(url));
            summary.completed += 1;
        }
        Ok(outcome) => {
            warn!(%url, "post incomplete after download");
            let cause = outcome
                .failure_cause()
                .unwrap_or_else(|| "incomplete after download".to_string());
            keep_going("appending to error log", store.append_error(url.as_str(), &cause));
            summary.failed += 1;
        }
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            warn!(%url, "failed to process post: {err}");
            keep_going(
                "appending to error log",
                store.append_error(url.as_str(), &err.to_string()),
            );
            summary.failed += 1;
        }
    }
    Ok(())
}

/// Drops post folders that hold no media, then retries them through the
/// error logs.
pub async fn cleanup_and_retry<S>(
    pipeline: &mut Pipeline<'_, S>,
    store: &CheckpointStore,
    summary: &mut RunSummary,
) -> Result<()>
where
    S: RenderingSurface + ?Sized,
{
    summary.cleaned = cleanup_empty_dirs(store, &pipeline.config().base_url).len();
    summary.retry = Some(retry_failed_posts(pipeline, store).await?);
    Ok(())
}
