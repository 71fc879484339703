//! In-memory stand-ins for the browser, the image fetcher and the stream
//! downloader, plus config builders rooted in a temp directory.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::config::{
    Action, BrowserSettings, Config, DEFAULT_BASE_URL, DownloadSettings, ExtractTimings,
    MediaFilter, ScrollPolicy, SessionPaths, Target,
};
use super::discovery::POST_ANCHOR_SELECTOR;
use super::download::{DownloadManager, MediaFetcher, StreamDownloader, StreamRequest};
use super::error::{Result, ScrapeError};
use super::extract::{
    CAPTION_SELECTOR, IMAGE_SELECTOR, NEXT_BUTTON_SELECTOR, TIME_SELECTOR, VIDEO_SELECTOR,
};
use super::normalize::{post_url_for_shortcode, profile_url};
use super::surface::{ElementHandle, RenderingSurface};
use super::types::{BoundingBox, PostUrl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Anchor,
    Image,
    Video,
    Time,
    Caption,
    Next,
}

#[derive(Debug, Clone)]
pub struct FakeElement {
    tag: Tag,
    pub attrs: HashMap<String, String>,
    pub text: String,
    pub rect: BoundingBox,
}

impl FakeElement {
    fn new(tag: Tag) -> Self {
        Self {
            tag,
            attrs: HashMap::new(),
            text: String::new(),
            rect: BoundingBox {
                width: 640.0,
                height: 640.0,
                top: 0.0,
                left: 0.0,
            },
        }
    }

    fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }
}

pub fn image(src: &str) -> FakeElement {
    FakeElement::new(Tag::Image).with_attr("src", src)
}

pub fn video(src: &str) -> FakeElement {
    FakeElement::new(Tag::Video).with_attr("src", src)
}

#[derive(Debug, Clone, Default)]
pub struct FakePost {
    slides: Vec<Vec<FakeElement>>,
    time: Option<String>,
    caption: Option<String>,
}

impl FakePost {
    pub fn new(slides: Vec<Vec<FakeElement>>) -> Self {
        Self {
            slides,
            ..Self::default()
        }
    }

    pub fn with_time(mut self, datetime: &str) -> Self {
        self.time = Some(datetime.to_string());
        self
    }

    pub fn with_caption(mut self, caption: &str) -> Self {
        self.caption = Some(caption.to_string());
        self
    }
}

/// A profile feed revealed one batch per scroll, and post pages keyed by
/// canonical URL. Any other navigation fails.
#[derive(Debug, Default)]
pub struct FakeSurface {
    posts: HashMap<String, FakePost>,
    feed: Vec<Vec<String>>,
    revealed: usize,
    current: Option<String>,
    slide: usize,
    elements: Vec<FakeElement>,
    scrolls: usize,
    pub fail_scroll_after: Option<usize>,
    pub clicks: usize,
    pub navigations: Vec<String>,
    pub closed: bool,
}

impl FakeSurface {
    pub fn with_feed(batches: Vec<Vec<&str>>) -> Self {
        Self {
            feed: batches
                .into_iter()
                .map(|batch| batch.into_iter().map(str::to_string).collect())
                .collect(),
            ..Self::default()
        }
    }

    pub fn add_post(&mut self, url: &PostUrl, post: FakePost) {
        self.posts.insert(url.to_string(), post);
    }

    fn register(&mut self, element: FakeElement) -> ElementHandle {
        self.elements.push(element);
        ElementHandle((self.elements.len() - 1).to_string())
    }

    fn element(&self, handle: &ElementHandle) -> Result<&FakeElement> {
        handle
            .0
            .parse::<usize>()
            .ok()
            .and_then(|idx| self.elements.get(idx))
            .ok_or_else(|| ScrapeError::Surface(format!("stale element {}", handle.0)))
    }

    fn current_post(&self) -> Option<&FakePost> {
        self.current.as_ref().and_then(|url| self.posts.get(url))
    }

    fn matching(&self, css: &str) -> Vec<FakeElement> {
        if css == POST_ANCHOR_SELECTOR {
            return self
                .feed
                .iter()
                .take(self.revealed + 1)
                .flatten()
                .map(|href| FakeElement::new(Tag::Anchor).with_attr("href", href))
                .collect();
        }
        let Some(post) = self.current_post() else {
            return Vec::new();
        };
        let slide = post.slides.get(self.slide);
        let of_tag = |tag: Tag| -> Vec<FakeElement> {
            slide
                .map(|els| els.iter().filter(|e| e.tag == tag).cloned().collect())
                .unwrap_or_default()
        };
        match css {
            IMAGE_SELECTOR => of_tag(Tag::Image),
            VIDEO_SELECTOR => of_tag(Tag::Video),
            TIME_SELECTOR => post
                .time
                .iter()
                .map(|t| FakeElement::new(Tag::Time).with_attr("datetime", t))
                .collect(),
            CAPTION_SELECTOR => post
                .caption
                .iter()
                .map(|c| FakeElement {
                    text: c.clone(),
                    ..FakeElement::new(Tag::Caption)
                })
                .collect(),
            NEXT_BUTTON_SELECTOR if self.slide + 1 < post.slides.len() => {
                vec![FakeElement::new(Tag::Next)]
            }
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl RenderingSurface for FakeSurface {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        self.navigations.push(url.to_string());
        self.slide = 0;
        if self.posts.contains_key(url) {
            self.current = Some(url.to_string());
            Ok(())
        } else if !self.feed.is_empty() && !url.contains("/p/") && !url.contains("/reel/") {
            self.current = None;
            Ok(())
        } else {
            self.current = None;
            Err(ScrapeError::Surface(format!("net::ERR_NAME_NOT_RESOLVED at {url}")))
        }
    }

    async fn find_elements(&mut self, css: &str) -> Result<Vec<ElementHandle>> {
        let found = self.matching(css);
        Ok(found.into_iter().map(|el| self.register(el)).collect())
    }

    async fn attribute(&mut self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
        Ok(self.element(element)?.attrs.get(name).cloned())
    }

    async fn text(&mut self, element: &ElementHandle) -> Result<String> {
        Ok(self.element(element)?.text.clone())
    }

    async fn bounding_box(&mut self, element: &ElementHandle) -> Result<BoundingBox> {
        Ok(self.element(element)?.rect)
    }

    async fn click(&mut self, element: &ElementHandle) -> Result<()> {
        if self.element(element)?.tag != Tag::Next {
            return Err(ScrapeError::Surface("element not interactable".into()));
        }
        self.slide += 1;
        self.clicks += 1;
        Ok(())
    }

    async fn scroll_height(&mut self) -> Result<i64> {
        Ok(1000 * (self.revealed as i64 + 1))
    }

    async fn scroll_to_bottom(&mut self) -> Result<()> {
        self.scrolls += 1;
        if self.fail_scroll_after.is_some_and(|n| self.scrolls > n) {
            return Err(ScrapeError::Surface("browsing context has been discarded".into()));
        }
        if self.revealed + 1 < self.feed.len() {
            self.revealed += 1;
        }
        Ok(())
    }

    async fn user_agent(&mut self) -> Result<String> {
        Ok("Mozilla/5.0 (FakeSurface)".to_string())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Writes a few bytes for every URL; URLs containing `fail` error out.
#[derive(Debug, Clone, Default)]
pub struct FakeFetcher {
    pub calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(url.to_string());
        }
        if url.contains("fail") {
            return Err(ScrapeError::Fetch {
                url: url.to_string(),
                reason: "HTTP status server error (500)".into(),
            });
        }
        let body = format!("bytes of {url}");
        std::fs::write(dest, &body).map_err(|e| ScrapeError::persistence(dest, e))?;
        Ok(body.len() as u64)
    }
}

/// Drops a `video_<shortcode>.mp4` next to the output template unless the
/// post URL is listed in `failing`.
#[derive(Debug, Clone, Default)]
pub struct FakeStreamer {
    pub requests: Arc<Mutex<Vec<StreamRequest>>>,
    pub failing: HashSet<String>,
}

#[async_trait]
impl StreamDownloader for FakeStreamer {
    async fn download(&self, request: &StreamRequest) -> Result<()> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if self.failing.contains(&request.post_url) {
            return Err(ScrapeError::StreamDownload {
                tool: "yt-dlp".into(),
                code: Some(1),
                stderr: "ERROR: Requested content is not available".into(),
            });
        }
        let shortcode = request
            .post_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("clip");
        let dir = request
            .output_template
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let dest = dir.join(format!("video_{shortcode}.mp4"));
        std::fs::write(&dest, b"mp4").map_err(|e| ScrapeError::persistence(&dest, e))
    }
}

pub fn post_url(shortcode: &str) -> PostUrl {
    post_url_for_shortcode(DEFAULT_BASE_URL, shortcode).expect("valid shortcode")
}

pub fn fast_timings() -> ExtractTimings {
    ExtractTimings {
        main_media: Duration::from_millis(5),
        timestamp: Duration::from_millis(5),
        caption: Duration::from_millis(5),
        next_button: Duration::from_millis(5),
        slide_settle: Duration::ZERO,
        poll_interval: Duration::from_millis(1),
    }
}

pub fn fast_scroll() -> ScrollPolicy {
    ScrollPolicy {
        initial_settle: Duration::ZERO,
        polls: 2,
        poll_interval: Duration::from_millis(1),
    }
}

pub fn download_settings() -> DownloadSettings {
    DownloadSettings {
        overwrite: false,
        image_timeout: Duration::from_secs(5),
        yt_dlp_binary: "yt-dlp".into(),
        stream_timeout: Duration::from_secs(5),
    }
}

fn config_for(root: &Path, target: Target) -> Config {
    let paths = SessionPaths::new(&root.join("downloads"), &target.session_name(), "20240101_000000");
    Config {
        base_url: DEFAULT_BASE_URL.to_string(),
        target,
        action: Action::Crawl,
        paths,
        browser: BrowserSettings {
            webdriver_url: "http://localhost:4444".into(),
            webdriver_binary: None,
            autostart: false,
            start_timeout: Duration::from_secs(1),
            headless: true,
            profile_dir: root.join("profile"),
        },
        scroll: fast_scroll(),
        timings: fast_timings(),
        filter: MediaFilter::default(),
        download: download_settings(),
        max_scraped: None,
        max_grabbed: None,
        resume: true,
        retry_errors: true,
    }
}

/// Profile mode for `someuser`.
pub fn profile_config(root: &Path) -> Config {
    config_for(
        root,
        Target::Profile {
            username: "someuser".into(),
            url: profile_url(DEFAULT_BASE_URL, "someuser"),
        },
    )
}

pub fn post_config(root: &Path, shortcode: &str) -> Config {
    config_for(
        root,
        Target::Post {
            url: post_url(shortcode),
        },
    )
}

pub fn manager(config: &Config, fetcher: FakeFetcher, streamer: FakeStreamer) -> DownloadManager {
    DownloadManager::new(
        Box::new(fetcher),
        Box::new(streamer),
        &config.download,
        config.browser.profile_dir.clone(),
    )
}
