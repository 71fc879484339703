use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::checkpoint::{CheckpointStore, keep_going};
use super::error::Result;
use super::normalize::{normalize_post_url, post_url_for_shortcode};
use super::pipeline::Pipeline;
use super::surface::RenderingSurface;
use super::types::PostUrl;

const MEDIA_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "webp", "mp4", "webm", "mkv"];

#[derive(Debug, Default)]
pub struct RetryOutcome {
    pub queued: usize,
    pub recovered: Vec<PostUrl>,
    pub still_failed: Vec<(PostUrl, String)>,
    /// Posts that needed another download or extraction attempt.
    pub fetch_attempts: usize,
    pub remaining_log: Option<PathBuf>,
}

/// Re-runs every post named in the session's error logs, then replaces those
/// logs with a single file holding only what still fails.
pub async fn retry_failed_posts<S>(
    pipeline: &mut Pipeline<'_, S>,
    store: &CheckpointStore,
) -> Result<RetryOutcome>
where
    S: RenderingSurface + ?Sized,
{
    let mut outcome = RetryOutcome::default();
    let logs = store.error_logs();
    if logs.is_empty() {
        info!("no error logs to retry");
        return Ok(outcome);
    }

    let config = pipeline.config();
    let urls = store.read_error_urls(&logs, &config.base_url, config.target.username());
    outcome.queued = urls.len();
    info!(logs = logs.len(), posts = urls.len(), "retrying failed posts");

    let mut processed = store.load_processed();
    for url in urls {
        if processed.contains(&url) {
            info!(%url, "already processed; dropping from error log");
            continue;
        }
        match pipeline.process(&url).await {
            Ok(post) if post.complete => {
                if post.downloaded {
                    outcome.fetch_attempts += 1;
                }
                info!(%url, "recovered");
                processed.insert(&url);
                keep_going("saving processed urls", store.save_processed(&processed));
                outcome.recovered.push(url);
            }
            Ok(post) => {
                outcome.fetch_attempts += 1;
                let cause = post
                    .failure_cause()
                    .unwrap_or_else(|| "incomplete after download".to_string());
                warn!(%url, "still failing: {cause}");
                outcome.still_failed.push((url, cause));
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                outcome.fetch_attempts += 1;
                warn!(%url, "still failing: {err}");
                outcome.still_failed.push((url, err.to_string()));
            }
        }
    }

    // The consolidated log can reuse an input's name; inputs go only once it is written.
    match keep_going(
        "writing remaining error log",
        store.write_remaining_errors(&outcome.still_failed),
    ) {
        Some(remaining) => {
            let stale = logs
                .iter()
                .filter(|log| Some(*log) != remaining.as_ref())
                .cloned()
                .collect::<Vec<_>>();
            store.remove_error_logs(&stale);
            outcome.remaining_log = remaining;
        }
        None => warn!("keeping the old error logs for the next retry pass"),
    }
    info!(
        recovered = outcome.recovered.len(),
        remaining = outcome.still_failed.len(),
        "retry finished"
    );
    Ok(outcome)
}

/// Deletes `YYYYMMDD_<shortcode>` folders that hold no media file, forgets
/// them in the processed set and queues them in the error log.
pub fn cleanup_empty_dirs(store: &CheckpointStore, base_url: &str) -> Vec<PostUrl> {
    let session_dir = &store.paths().session_dir;
    let entries = match fs::read_dir(session_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!(dir = %session_dir.display(), "cannot list session folder: {err}");
            return Vec::new();
        }
    };

    let mut processed = store.load_processed();
    let mut queued = Vec::new();
    let mut dirs = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect::<Vec<_>>();
    dirs.sort();

    for dir in dirs {
        let Some(shortcode) = post_dir_shortcode(&dir) else {
            continue;
        };
        if holds_media(&dir) {
            continue;
        }
        info!(dir = %dir.display(), "removing post folder without media");
        if let Err(err) = fs::remove_dir_all(&dir) {
            warn!(dir = %dir.display(), "could not remove post folder: {err}");
            continue;
        }

        let known = processed.url_for_shortcode(&shortcode);
        if let Some(url) = &known {
            processed.remove(url);
        }
        let url = known
            .and_then(|url| normalize_post_url(&url, base_url, None))
            .or_else(|| post_url_for_shortcode(base_url, &shortcode));
        match url {
            Some(url) => {
                keep_going(
                    "appending to error log",
                    store.append_error(url.as_str(), "no media on disk; queued by cleanup"),
                );
                queued.push(url);
            }
            None => warn!(%shortcode, "cannot rebuild post url for cleaned folder"),
        }
    }

    keep_going("saving processed urls", store.save_processed(&processed));
    info!(cleaned = queued.len(), "cleanup finished");
    queued
}

fn post_dir_shortcode(dir: &Path) -> Option<String> {
    let name = dir.file_name()?.to_str()?;
    let (date, shortcode) = name.split_once('_')?;
    let dated = date.len() == 8 && date.chars().all(|c| c.is_ascii_digit());
    (dated && !shortcode.is_empty()).then(|| shortcode.to_string())
}

fn holds_media(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(|entry| entry.ok()).any(|entry| {
        entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::checkpoint::ProcessedSet;
    use crate::app::testing::{
        FakeFetcher, FakePost, FakeStreamer, FakeSurface, image, manager, post_url, profile_config,
    };

    #[test]
    fn post_dir_names_need_a_date_prefix() {
        assert_eq!(post_dir_shortcode(Path::new("/x/20240203_ABC")).as_deref(), Some("ABC"));
        assert_eq!(post_dir_shortcode(Path::new("/x/2024023_ABC")), None);
        assert_eq!(post_dir_shortcode(Path::new("/x/notes_ABC")), None);
        assert_eq!(post_dir_shortcode(Path::new("/x/20240203_")), None);
    }

    #[test]
    fn cleanup_removes_only_folders_without_media() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = profile_config(dir.path());
        let store = CheckpointStore::open(config.paths.clone()).expect("store");
        let session = &config.paths.session_dir;

        let empty = session.join("20240101_EMPTY");
        fs::create_dir_all(&empty).expect("mkdir");
        fs::write(empty.join("metadata.json"), "{}").expect("seed");
        let full = session.join("20240102_FULL");
        fs::create_dir_all(&full).expect("mkdir");
        fs::write(full.join("image_01_a.JPG"), b"x").expect("seed");
        fs::create_dir_all(session.join("scratch")).expect("mkdir");

        let mut processed = ProcessedSet::default();
        processed.insert(&post_url("EMPTY"));
        processed.insert(&post_url("FULL"));
        store.save_processed(&processed).expect("save");

        let queued = cleanup_empty_dirs(&store, &config.base_url);
        assert_eq!(queued, vec![post_url("EMPTY")]);
        assert!(!empty.exists());
        assert!(full.exists());
        assert!(session.join("scratch").exists());

        let processed = store.load_processed();
        assert!(!processed.contains(&post_url("EMPTY")));
        assert!(processed.contains(&post_url("FULL")));
        let urls = store.read_error_urls(&store.error_logs(), &config.base_url, None);
        assert_eq!(urls, vec![post_url("EMPTY")]);
    }

    #[tokio::test]
    async fn retry_is_idempotent_and_leaves_one_remaining_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = profile_config(dir.path());
        let store = CheckpointStore::open(config.paths.clone()).expect("store");
        let session = &config.paths.session_dir;
        fs::write(
            session.join("someuser-errors_20230101_000000.log"),
            "https://www.instagram.com/p/GOOD/ — timeout\nhttps://www.instagram.com/p/BROKEN/ — 500\n",
        )
        .expect("seed");
        fs::write(
            session.join("someuser-errors_20230202_000000.log"),
            "https://www.instagram.com/p/GOOD/ — timeout again\n",
        )
        .expect("seed");

        let mut surface = FakeSurface::default();
        surface.add_post(
            &post_url("GOOD"),
            FakePost::new(vec![vec![image("https://cdn.example/good.jpg")]]),
        );
        let fetcher = FakeFetcher::default();
        let calls = fetcher.calls.clone();
        let downloads = manager(&config, fetcher, FakeStreamer::default());

        let first = {
            let mut pipeline = Pipeline::new(&mut surface, &config, &downloads);
            retry_failed_posts(&mut pipeline, &store).await.expect("retry")
        };
        assert_eq!(first.queued, 2);
        assert_eq!(first.recovered, vec![post_url("GOOD")]);
        assert_eq!(first.still_failed.len(), 1);
        assert_eq!(first.still_failed[0].0, post_url("BROKEN"));
        let logs = store.error_logs();
        assert_eq!(logs, vec![config.paths.remaining_errors_log()]);
        assert!(store.load_processed().contains(&post_url("GOOD")));

        let second = {
            let mut pipeline = Pipeline::new(&mut surface, &config, &downloads);
            retry_failed_posts(&mut pipeline, &store).await.expect("retry")
        };
        assert_eq!(second.queued, 1);
        assert_eq!(second.fetch_attempts, 1);
        assert!(second.recovered.is_empty());
        assert_eq!(store.error_logs(), vec![config.paths.remaining_errors_log()]);
        assert_eq!(calls.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn posts_already_on_disk_are_recovered_without_fetching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = profile_config(dir.path());
        let store = CheckpointStore::open(config.paths.clone()).expect("store");
        let session = &config.paths.session_dir;
        let post_dir = session.join("20240301_DONE");
        fs::create_dir_all(&post_dir).expect("mkdir");
        fs::write(post_dir.join("image_01_done.jpg"), b"x").expect("seed");
        fs::write(
            session.join("someuser-errors_20230101_000000.log"),
            "https://www.instagram.com/p/DONE/ — timeout\nhttps://www.instagram.com/p/DONE/ — again\n",
        )
        .expect("seed");

        let mut surface = FakeSurface::default();
        surface.add_post(
            &post_url("DONE"),
            FakePost::new(vec![vec![image("https://cdn.example/done.jpg")]])
                .with_time("2024-03-01T12:00:00Z"),
        );
        let fetcher = FakeFetcher::default();
        let calls = fetcher.calls.clone();
        let downloads = manager(&config, fetcher, FakeStreamer::default());

        for _ in 0..2 {
            let mut pipeline = Pipeline::new(&mut surface, &config, &downloads);
            let outcome = retry_failed_posts(&mut pipeline, &store).await.expect("retry");
            assert_eq!(outcome.fetch_attempts, 0);
            assert!(outcome.still_failed.is_empty());
        }
        assert!(calls.lock().expect("lock").is_empty());
        assert!(store.error_logs().is_empty());
        assert!(store.load_processed().contains(&post_url("DONE")));
    }

    #[tokio::test]
    async fn retry_without_logs_does_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = profile_config(dir.path());
        let store = CheckpointStore::open(config.paths.clone()).expect("store");
        let mut surface = FakeSurface::default();
        let downloads = manager(&config, FakeFetcher::default(), FakeStreamer::default());
        let mut pipeline = Pipeline::new(&mut surface, &config, &downloads);
        let outcome = retry_failed_posts(&mut pipeline, &store).await.expect("retry");
        assert_eq!(outcome.queued, 0);
        assert!(outcome.remaining_log.is_none());
        assert!(surface.navigations.is_empty());
    }

    #[tokio::test]
    async fn retry_pass_survives_unwritable_processed_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = profile_config(dir.path());
        config.paths.processed = dir.path().join("processed_is_a_dir");
        fs::create_dir_all(&config.paths.processed).expect("mkdir");
        let store = CheckpointStore::open(config.paths.clone()).expect("store");
        fs::write(
            config.paths.session_dir.join("someuser-errors_20230101_000000.log"),
            "https://www.instagram.com/p/GOOD/ — timeout\nhttps://www.instagram.com/p/BROKEN/ — 500\n",
        )
        .expect("seed");

        let mut surface = FakeSurface::default();
        surface.add_post(
            &post_url("GOOD"),
            FakePost::new(vec![vec![image("https://cdn.example/good.jpg")]]),
        );
        let downloads = manager(&config, FakeFetcher::default(), FakeStreamer::default());
        let outcome = {
            let mut pipeline = Pipeline::new(&mut surface, &config, &downloads);
            retry_failed_posts(&mut pipeline, &store).await.expect("retry keeps going")
        };

        assert_eq!(outcome.recovered, vec![post_url("GOOD")]);
        assert_eq!(outcome.still_failed.len(), 1);
        assert_eq!(surface.navigations.len(), 2);
        assert_eq!(store.error_logs(), vec![config.paths.remaining_errors_log()]);
    }
}
