use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, FixedOffset, Local};
use tracing::{debug, info, warn};

use super::config::{ExtractTimings, MediaFilter};
use super::error::{Result, ScrapeError};
use super::surface::{Deadline, ElementHandle, RenderingSurface};
use super::types::{ExtractedPost, MediaItem, MediaKind, Observed, PostRecord, PostUrl};

pub const IMAGE_SELECTOR: &str = "img";
pub const VIDEO_SELECTOR: &str = "video";
pub const TIME_SELECTOR: &str = "time";
pub const CAPTION_SELECTOR: &str = r#"article h1[class*="_ap3a"]"#;
pub const NEXT_BUTTON_SELECTOR: &str = r#"button[class*="_afxw"], button[aria-label="Next"]"#;

pub const METADATA_FILE: &str = "metadata.json";
pub const MEDIA_LISTING_FILE: &str = "media_urls.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractState {
    Loading,
    AwaitMainMedia,
    AwaitTimestamp,
    AwaitCaption,
    SlideLoop,
    Done,
}

/// Walks one post page from navigation to the written listing.
pub struct PostExtractor<'a, S: RenderingSurface + ?Sized> {
    surface: &'a mut S,
    timings: ExtractTimings,
    filter: MediaFilter,
    url: PostUrl,
    state: ExtractState,
    taken_at: Option<Observed<DateTime<FixedOffset>>>,
    caption: String,
    items: Vec<MediaItem>,
    seen: HashSet<String>,
    next_index: usize,
    video_detected: bool,
    slides: usize,
}

impl<'a, S: RenderingSurface + ?Sized> PostExtractor<'a, S> {
    pub fn new(surface: &'a mut S, timings: ExtractTimings, filter: MediaFilter, url: PostUrl) -> Self {
        Self {
            surface,
            timings,
            filter,
            url,
            state: ExtractState::Loading,
            taken_at: None,
            caption: String::new(),
            items: Vec::new(),
            seen: HashSet::new(),
            next_index: 1,
            video_detected: false,
            slides: 0,
        }
    }

    pub async fn run(mut self, session_dir: &Path) -> Result<ExtractedPost> {
        loop {
            debug!(url = %self.url, state = ?self.state, "extractor step");
            self.state = match self.state {
                ExtractState::Loading => {
                    info!(url = %self.url, "visiting post");
                    self.surface
                        .navigate(self.url.as_str())
                        .await
                        .map_err(|e| self.failure(format!("navigation failed: {e}")))?;
                    ExtractState::AwaitMainMedia
                }
                ExtractState::AwaitMainMedia => {
                    if !self.wait_for_main_media().await {
                        warn!(url = %self.url, "main media element did not appear; continuing");
                    }
                    ExtractState::AwaitTimestamp
                }
                ExtractState::AwaitTimestamp => {
                    let taken_at = self.read_timestamp().await;
                    if taken_at.is_fallback() {
                        warn!(url = %self.url, "no post timestamp found; using current time");
                    }
                    self.taken_at = Some(taken_at);
                    ExtractState::AwaitCaption
                }
                ExtractState::AwaitCaption => {
                    self.caption = self.read_caption().await;
                    ExtractState::SlideLoop
                }
                ExtractState::SlideLoop => {
                    self.walk_slides().await?;
                    ExtractState::Done
                }
                ExtractState::Done => return self.finish(session_dir),
            };
        }
    }

    fn failure(&self, reason: String) -> ScrapeError {
        ScrapeError::Extraction {
            url: self.url.to_string(),
            reason,
        }
    }

    async fn wait_for_main_media(&mut self) -> bool {
        let deadline = Deadline::after(self.timings.main_media, self.timings.poll_interval);
        loop {
            match self.any_media_ready().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => debug!("main media probe failed: {err}"),
            }
            if !deadline.tick().await {
                return false;
            }
        }
    }

    async fn any_media_ready(&mut self) -> Result<bool> {
        for selector in [IMAGE_SELECTOR, VIDEO_SELECTOR] {
            for element in self.surface.find_elements(selector).await? {
                let rect = self.surface.bounding_box(&element).await?;
                if self.filter.looks_ready(&rect) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn read_timestamp(&mut self) -> Observed<DateTime<FixedOffset>> {
        let deadline = Deadline::after(self.timings.timestamp, self.timings.poll_interval);
        loop {
            if let Some(element) = self.first_element(TIME_SELECTOR).await {
                let raw = self
                    .surface
                    .attribute(&element, "datetime")
                    .await
                    .ok()
                    .flatten();
                match raw.as_deref().map(DateTime::parse_from_rfc3339) {
                    Some(Ok(ts)) => return Observed::Found(ts),
                    Some(Err(err)) => {
                        warn!(raw = ?raw, "unparseable post timestamp: {err}");
                        break;
                    }
                    None => {}
                }
            }
            if !deadline.tick().await {
                break;
            }
        }
        Observed::Fallback(Local::now().fixed_offset())
    }

    async fn read_caption(&mut self) -> String {
        let deadline = Deadline::after(self.timings.caption, self.timings.poll_interval);
        loop {
            if let Some(element) = self.first_element(CAPTION_SELECTOR).await {
                match self.surface.text(&element).await {
                    Ok(text) => return text.trim().to_string(),
                    Err(err) => debug!("caption read failed: {err}"),
                }
            }
            if !deadline.tick().await {
                return String::new();
            }
        }
    }

    async fn first_element(&mut self, css: &str) -> Option<ElementHandle> {
        match self.surface.find_elements(css).await {
            Ok(found) => found.into_iter().next(),
            Err(err) => {
                debug!(css, "element lookup failed: {err}");
                None
            }
        }
    }

    async fn walk_slides(&mut self) -> Result<()> {
        loop {
            self.slides += 1;
            debug!(slide = self.slides, "processing slide");
            self.collect_visible_media().await?;
            if !self.advance_slide().await {
                debug!(slides = self.slides, "reached end of carousel");
                return Ok(());
            }
            tokio::time::sleep(self.timings.slide_settle).await;
        }
    }

    async fn collect_visible_media(&mut self) -> Result<()> {
        for element in self.surface.find_elements(IMAGE_SELECTOR).await? {
            let Some(src) = self.surface.attribute(&element, "src").await? else {
                continue;
            };
            if src.is_empty() || src.starts_with("blob:") || self.seen.contains(&src) {
                continue;
            }
            let rect = self.surface.bounding_box(&element).await?;
            if !self.filter.accepts(&rect) {
                continue;
            }
            self.push_item(MediaKind::Image, src);
        }

        let videos = self.surface.find_elements(VIDEO_SELECTOR).await?;
        if !videos.is_empty() {
            self.video_detected = true;
        }
        for element in videos {
            let Some(src) = self.surface.attribute(&element, "src").await? else {
                continue;
            };
            if !src.starts_with("http") || self.seen.contains(&src) {
                continue;
            }
            let rect = self.surface.bounding_box(&element).await?;
            if self.filter.accepts(&rect) {
                self.push_item(MediaKind::Video, src);
            }
        }
        Ok(())
    }

    fn push_item(&mut self, kind: MediaKind, src: String) {
        self.seen.insert(src.clone());
        self.items.push(MediaItem::new(kind, self.next_index, src));
        self.next_index += 1;
    }

    /// Clicks the carousel's next control if one shows up in time.
    async fn advance_slide(&mut self) -> bool {
        let deadline = Deadline::after(self.timings.next_button, self.timings.poll_interval);
        loop {
            if let Some(button) = self.first_element(NEXT_BUTTON_SELECTOR).await {
                return match self.surface.click(&button).await {
                    Ok(()) => true,
                    Err(err) => {
                        debug!("next button click failed: {err}");
                        false
                    }
                };
            }
            if !deadline.tick().await {
                return false;
            }
        }
    }

    fn finish(self, session_dir: &Path) -> Result<ExtractedPost> {
        let taken_at = self
            .taken_at
            .unwrap_or_else(|| Observed::Fallback(Local::now().fixed_offset()));
        let record = PostRecord::new(&self.url, self.caption, &taken_at);
        let output_dir = session_dir.join(record.output_dir_name());
        fs::create_dir_all(&output_dir)
            .map_err(|e| ScrapeError::persistence(&output_dir, e))?;

        let metadata_path = output_dir.join(METADATA_FILE);
        let metadata = serde_json::to_string_pretty(&record)?;
        fs::write(&metadata_path, metadata)
            .map_err(|e| ScrapeError::persistence(&metadata_path, e))?;

        let listing_path = output_dir.join(MEDIA_LISTING_FILE);
        let listing = self
            .items
            .iter()
            .map(|item| item.listing_line() + "\n")
            .collect::<String>();
        fs::write(&listing_path, listing).map_err(|e| ScrapeError::persistence(&listing_path, e))?;

        // Posts with no usable still image are assumed to be video-only.
        let needs_video_fetch = self.video_detected || !self.items.iter().any(|i| i.is_image());
        info!(
            url = %self.url,
            items = self.items.len(),
            slides = self.slides,
            needs_video_fetch,
            "extracted post"
        );
        Ok(ExtractedPost {
            record,
            items: self.items,
            output_dir,
            needs_video_fetch,
            slides_visited: self.slides,
        })
    }
}

pub async fn extract_post<S>(
    surface: &mut S,
    timings: ExtractTimings,
    filter: MediaFilter,
    url: &PostUrl,
    session_dir: &Path,
) -> Result<ExtractedPost>
where
    S: RenderingSurface + ?Sized,
{
    PostExtractor::new(surface, timings, filter, url.clone())
        .run(session_dir)
        .await
}
