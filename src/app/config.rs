use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use clap::Parser;
use url::Url;

use super::error::{Result, ScrapeError};
use super::normalize::{post_url_for_shortcode, profile_url};
use super::types::{BoundingBox, PostUrl};

pub const DEFAULT_BASE_URL: &str = "https://www.instagram.com";

#[derive(Debug, Parser, Clone)]
#[command(
    name = "postgrab",
    version,
    about = "Resumable post and reel archiver driven by a logged-in WebDriver browser"
)]
pub struct Cli {
    /// Post shortcode to fetch on its own (e.g. C0EVTGHSQUF)
    #[arg(long, value_name = "SHORTCODE")]
    pub post_id: Option<String>,

    /// Profile whose feed is crawled
    #[arg(long, value_name = "NAME", required_unless_present = "post_id")]
    pub username: Option<String>,

    #[arg(long, value_name = "N")]
    pub max_scraped_posts: Option<usize>,

    #[arg(long, value_name = "N")]
    pub max_grabbed_posts: Option<usize>,

    /// Where this run's discovered links are written
    #[arg(long, value_name = "FILE")]
    pub resume_log: Option<PathBuf>,

    /// Holds the last fully downloaded post URL
    #[arg(long, value_name = "FILE")]
    pub resume_file: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub no_resume: bool,

    #[arg(long, value_name = "FILE")]
    pub processed_urls_file: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub headless: bool,

    #[arg(long, value_name = "DIR", default_value = "downloads")]
    pub download_path: PathBuf,

    /// Firefox profile that already holds a logged-in session
    #[arg(long, value_name = "DIR", default_value = "firefox_profile")]
    pub firefox_profile_dir: PathBuf,

    #[arg(long, default_value_t = false)]
    pub overwrite: bool,

    #[arg(long, default_value_t = false)]
    pub no_retry_errors: bool,

    #[arg(long, default_value_t = false, conflicts_with = "cleanup_and_retry")]
    pub retry_errors_only: bool,

    /// Delete post folders without media, forget them and fetch them again
    #[arg(long, default_value_t = false)]
    pub cleanup_and_retry: bool,

    #[arg(long, value_name = "URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    #[arg(long, value_name = "URL", default_value = "http://localhost:4444")]
    pub webdriver_url: String,

    #[arg(long, value_name = "PATH")]
    pub webdriver_binary: Option<String>,

    #[arg(long, default_value_t = false)]
    pub no_webdriver_autostart: bool,

    #[arg(long, value_name = "MS", default_value_t = 12000)]
    pub webdriver_start_timeout_ms: u64,

    #[arg(long, value_name = "PATH", default_value = "yt-dlp")]
    pub yt_dlp_binary: String,

    #[arg(long, value_name = "PX", default_value_t = 320.0)]
    pub min_media_width: f64,

    #[arg(long, value_name = "PX", default_value_t = 300.0)]
    pub min_media_height: f64,

    /// How many height polls a scroll gets before the feed counts as exhausted
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub scroll_polls: u32,

    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub scroll_poll_ms: u64,

    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Post { url: PostUrl },
    Profile { username: String, url: String },
}

impl Target {
    pub fn username(&self) -> Option<&str> {
        match self {
            Target::Post { .. } => None,
            Target::Profile { username, .. } => Some(username),
        }
    }

    pub fn session_name(&self) -> String {
        match self {
            Target::Post { url } => url.shortcode().to_string(),
            Target::Profile { username, .. } => username.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Crawl,
    RetryErrorsOnly,
    CleanupAndRetry,
}

/// On-disk layout of one session directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub session_name: String,
    pub session_dir: PathBuf,
    pub resume_pointer: PathBuf,
    pub discovery_log: PathBuf,
    pub error_log: PathBuf,
    pub processed: PathBuf,
    pub stamp: String,
}

impl SessionPaths {
    pub fn new(download_root: &Path, session_name: &str, stamp: &str) -> Self {
        let session_dir = download_root.join(session_name);
        let discovery_log = session_dir.join(format!("{session_name}-posts_{stamp}.log"));
        Self {
            session_name: session_name.to_string(),
            resume_pointer: session_dir.join("last-post-url.txt"),
            error_log: error_log_for(&discovery_log),
            discovery_log,
            processed: session_dir.join("processed-urls.json"),
            stamp: stamp.to_string(),
            session_dir,
        }
    }

    fn with_overrides(mut self, cli: &Cli) -> Self {
        if let Some(path) = &cli.resume_file {
            self.resume_pointer = path.clone();
        }
        if let Some(path) = &cli.resume_log {
            self.discovery_log = path.clone();
            self.error_log = error_log_for(path);
        }
        if let Some(path) = &cli.processed_urls_file {
            self.processed = absolute(path);
        }
        self
    }

    pub fn remaining_errors_log(&self) -> PathBuf {
        self.session_dir.join(format!(
            "{}-errors_remaining_{}.log",
            self.session_name, self.stamp
        ))
    }
}

fn error_log_for(discovery_log: &Path) -> PathBuf {
    let name = discovery_log
        .file_name()
        .map(|n| n.to_string_lossy().replace("posts_", "errors_"))
        .unwrap_or_else(|| "errors.log".to_string());
    discovery_log.with_file_name(name)
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub webdriver_url: String,
    pub webdriver_binary: Option<String>,
    pub autostart: bool,
    pub start_timeout: Duration,
    pub headless: bool,
    pub profile_dir: PathBuf,
}

/// Infinite-scroll termination window.
#[derive(Debug, Clone, Copy)]
pub struct ScrollPolicy {
    pub initial_settle: Duration,
    pub polls: u32,
    pub poll_interval: Duration,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self {
            initial_settle: Duration::from_secs(3),
            polls: 10,
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractTimings {
    pub main_media: Duration,
    pub timestamp: Duration,
    pub caption: Duration,
    pub next_button: Duration,
    pub slide_settle: Duration,
    pub poll_interval: Duration,
}

impl Default for ExtractTimings {
    fn default() -> Self {
        Self {
            main_media: Duration::from_secs(20),
            timestamp: Duration::from_secs(5),
            caption: Duration::from_secs(5),
            next_button: Duration::from_secs(2),
            slide_settle: Duration::from_millis(1500),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Size and position heuristics that separate post media from avatars,
/// icons and preloaded off-screen slides. Tuned to the current page layout.
#[derive(Debug, Clone, Copy)]
pub struct MediaFilter {
    pub min_width: f64,
    pub min_height: f64,
    pub min_top: f64,
    pub min_left: f64,
    /// Both sides must exceed this before the page counts as showing media.
    pub ready_side: f64,
}

impl Default for MediaFilter {
    fn default() -> Self {
        Self {
            min_width: 320.0,
            min_height: 300.0,
            min_top: 0.0,
            min_left: 0.0,
            ready_side: 300.0,
        }
    }
}

impl MediaFilter {
    pub fn accepts(&self, rect: &BoundingBox) -> bool {
        rect.width >= self.min_width
            && rect.height >= self.min_height
            && rect.top >= self.min_top
            && rect.left >= self.min_left
    }

    pub fn looks_ready(&self, rect: &BoundingBox) -> bool {
        rect.width > self.ready_side && rect.height > self.ready_side
    }
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub overwrite: bool,
    pub image_timeout: Duration,
    pub yt_dlp_binary: String,
    pub stream_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub target: Target,
    pub action: Action,
    pub paths: SessionPaths,
    pub browser: BrowserSettings,
    pub scroll: ScrollPolicy,
    pub timings: ExtractTimings,
    pub filter: MediaFilter,
    pub download: DownloadSettings,
    pub max_scraped: Option<usize>,
    pub max_grabbed: Option<usize>,
    pub resume: bool,
    pub retry_errors: bool,
}

impl Config {
    pub fn from_cli(cli: &Cli, now: DateTime<Local>) -> Result<Self> {
        let base_url = cli.base_url.trim_end_matches('/').to_string();
        Url::parse(&base_url)?;
        let target = match (&cli.post_id, &cli.username) {
            (Some(post_id), _) => Target::Post {
                url: post_url_for_shortcode(&base_url, post_id).ok_or_else(|| {
                    ScrapeError::Setup(format!("invalid post id '{post_id}'"))
                })?,
            },
            (None, Some(username)) if !username.trim().is_empty() => Target::Profile {
                username: username.trim().to_string(),
                url: profile_url(&base_url, username),
            },
            _ => {
                return Err(ScrapeError::Setup(
                    "either --username or --post-id is required".to_string(),
                ));
            }
        };

        let profile_dir = absolute(&cli.firefox_profile_dir);
        if !profile_dir.is_dir() {
            return Err(ScrapeError::Setup(format!(
                "Firefox profile directory '{}' does not exist; log in once with that profile first",
                profile_dir.display()
            )));
        }

        let action = if cli.cleanup_and_retry {
            Action::CleanupAndRetry
        } else if cli.retry_errors_only {
            Action::RetryErrorsOnly
        } else {
            Action::Crawl
        };

        let stamp = now.format("%Y%m%d_%H%M%S").to_string();
        let paths = SessionPaths::new(
            &absolute(&cli.download_path),
            &target.session_name(),
            &stamp,
        )
        .with_overrides(cli);

        Ok(Self {
            base_url,
            target,
            action,
            paths,
            browser: BrowserSettings {
                webdriver_url: cli.webdriver_url.clone(),
                webdriver_binary: cli.webdriver_binary.clone(),
                autostart: !cli.no_webdriver_autostart,
                start_timeout: Duration::from_millis(cli.webdriver_start_timeout_ms),
                headless: cli.headless,
                profile_dir,
            },
            scroll: ScrollPolicy {
                polls: cli.scroll_polls.max(1),
                poll_interval: Duration::from_millis(cli.scroll_poll_ms),
                ..ScrollPolicy::default()
            },
            timings: ExtractTimings::default(),
            filter: MediaFilter {
                min_width: cli.min_media_width,
                min_height: cli.min_media_height,
                ..MediaFilter::default()
            },
            download: DownloadSettings {
                overwrite: cli.overwrite,
                image_timeout: Duration::from_secs(20),
                yt_dlp_binary: cli.yt_dlp_binary.clone(),
                stream_timeout: Duration::from_secs(30 * 60),
            },
            max_scraped: cli.max_scraped_posts,
            max_grabbed: cli.max_grabbed_posts,
            resume: !cli.no_resume,
            retry_errors: !cli.no_retry_errors,
        })
    }
}
