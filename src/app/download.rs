use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use super::config::DownloadSettings;
use super::error::{Result, ScrapeError};
use super::types::{MediaItem, PostUrl};
use super::verify::{dir_listing, has_video_output};
use super::webdriver::truncate_for_log;

const FALLBACK_BASENAME: &str = "media.jpg";

/// Plain GET of one media URL into a file.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// External tool that pulls motion media for a whole post.
#[async_trait]
pub trait StreamDownloader: Send + Sync {
    async fn download(&self, request: &StreamRequest) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub post_url: String,
    pub output_template: PathBuf,
    pub profile_dir: PathBuf,
    pub user_agent: Option<String>,
    pub overwrite: bool,
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        let fail = |reason: String| ScrapeError::Fetch {
            url: url.to_string(),
            reason,
        };
        let mut res = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fail(e.to_string()))?;

        let part = part_path(dest);
        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| ScrapeError::persistence(&part, e))?;
        let mut written = 0u64;
        let streamed: Result<()> = async {
            while let Some(chunk) = res.chunk().await.map_err(|e| fail(e.to_string()))? {
                file.write_all(&chunk)
                    .await
                    .map_err(|e| ScrapeError::persistence(&part, e))?;
                written += chunk.len() as u64;
            }
            file.flush()
                .await
                .map_err(|e| ScrapeError::persistence(&part, e))
        }
        .await;
        drop(file);

        if let Err(err) = streamed {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(err);
        }
        tokio::fs::rename(&part, dest)
            .await
            .map_err(|e| ScrapeError::persistence(dest, e))?;
        Ok(written)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    dest.with_file_name(format!("{name}.part"))
}

pub struct YtDlp {
    binary: String,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn args(request: &StreamRequest) -> Vec<String> {
        let mut args = vec![
            "--cookies-from-browser".to_string(),
            format!("firefox:{}", request.profile_dir.to_string_lossy()),
            "--yes-playlist".to_string(),
            "--ignore-errors".to_string(),
            "--no-warnings".to_string(),
            "--no-progress".to_string(),
            "-f".to_string(),
            "bestvideo+bestaudio/best".to_string(),
            "--recode-video".to_string(),
            "mp4".to_string(),
            "-o".to_string(),
            request.output_template.to_string_lossy().to_string(),
        ];
        if let Some(ua) = request.user_agent.as_deref().filter(|ua| !ua.is_empty()) {
            args.push("--user-agent".to_string());
            args.push(ua.to_string());
        }
        if request.overwrite {
            args.push("--force-overwrites".to_string());
        }
        args.push(request.post_url.clone());
        args
    }
}

#[async_trait]
impl StreamDownloader for YtDlp {
    async fn download(&self, request: &StreamRequest) -> Result<()> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(Self::args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let failed = |code: Option<i32>, stderr: String| ScrapeError::StreamDownload {
            tool: self.binary.clone(),
            code,
            stderr,
        };
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(failed(
                    None,
                    format!("{} not found; install it with `pip install -U yt-dlp`", self.binary),
                ));
            }
            Ok(Err(e)) => return Err(failed(None, format!("could not start: {e}"))),
            Err(_) => {
                return Err(failed(
                    None,
                    format!("timed out after {}s", self.timeout.as_secs()),
                ));
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(failed(
                output.status.code(),
                if stderr.is_empty() {
                    "unknown error".to_string()
                } else {
                    truncate_for_log(&stderr, 400)
                },
            ));
        }
        Ok(())
    }
}

/// `<label>_<basename of the url path>`, restricted to a safe character set.
pub fn image_file_name(item: &MediaItem) -> String {
    let basename = Url::parse(&item.url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(|s| s.to_string()))
        })
        .map(|segment| {
            urlencoding::decode(&segment)
                .map(|s| s.into_owned())
                .unwrap_or(segment)
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_BASENAME.to_string());
    sanitize_file_name(&format!("{}_{basename}", item.label))
}

pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Default, Clone)]
pub struct ImageFetchReport {
    pub fetched: usize,
    pub skipped: usize,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFetch {
    AlreadyPresent,
    Downloaded,
}

pub struct DownloadManager {
    fetcher: Box<dyn MediaFetcher>,
    streamer: Box<dyn StreamDownloader>,
    overwrite: bool,
    profile_dir: PathBuf,
}

impl DownloadManager {
    pub fn new(
        fetcher: Box<dyn MediaFetcher>,
        streamer: Box<dyn StreamDownloader>,
        settings: &DownloadSettings,
        profile_dir: PathBuf,
    ) -> Self {
        Self {
            fetcher,
            streamer,
            overwrite: settings.overwrite,
            profile_dir,
        }
    }

    pub fn overwrites(&self) -> bool {
        self.overwrite
    }

    /// Fetches every image item in order; one failure never stops the rest.
    pub async fn fetch_images(&self, items: &[MediaItem], dir: &Path) -> ImageFetchReport {
        let mut report = ImageFetchReport::default();
        for item in items.iter().filter(|i| i.is_image()) {
            if item.url.starts_with("blob:") {
                debug!(url = %item.url, "skipping blob url");
                continue;
            }
            let dest = dir.join(image_file_name(item));
            if dest.exists() && !self.overwrite {
                debug!(file = %dest.display(), "already exists");
                report.skipped += 1;
                continue;
            }
            info!(url = %item.url, file = %dest.display(), "downloading");
            match self.fetcher.fetch_to_file(&item.url, &dest).await {
                Ok(bytes) => {
                    debug!(bytes, "saved");
                    report.fetched += 1;
                }
                Err(err) => {
                    warn!(url = %item.url, "failed to download: {err}");
                    report.failed.push((item.url.clone(), err.to_string()));
                }
            }
        }
        report
    }

    /// Hands the post URL itself to the stream downloader.
    pub async fn fetch_video(
        &self,
        post_url: &PostUrl,
        dir: &Path,
        user_agent: Option<String>,
    ) -> Result<VideoFetch> {
        if !self.overwrite && has_video_output(&dir_listing(dir)) {
            info!(url = %post_url, "video file already exists; skipping");
            return Ok(VideoFetch::AlreadyPresent);
        }
        info!(url = %post_url, "downloading video via stream downloader");
        let request = StreamRequest {
            post_url: post_url.to_string(),
            output_template: dir.join("video_%(id)s.%(ext)s"),
            profile_dir: self.profile_dir.clone(),
            user_agent,
            overwrite: self.overwrite,
        };
        self.streamer.download(&request).await?;
        Ok(VideoFetch::Downloaded)
    }
}
