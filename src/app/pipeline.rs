use tracing::{debug, info, warn};

use super::config::Config;
use super::download::{DownloadManager, ImageFetchReport, VideoFetch};
use super::error::Result;
use super::extract::extract_post;
use super::surface::RenderingSurface;
use super::types::PostUrl;
use super::verify::post_is_complete;

/// What one pass over a post left on disk.
#[derive(Debug)]
pub struct PostOutcome {
    pub images: ImageFetchReport,
    pub video_error: Option<String>,
    /// False when the media was already on disk and nothing was fetched.
    pub downloaded: bool,
    pub complete: bool,
}

impl PostOutcome {
    /// Short cause suitable for an error log line.
    pub fn failure_cause(&self) -> Option<String> {
        if self.complete {
            return None;
        }
        Some(match (&self.video_error, self.images.failed.first()) {
            (Some(err), _) => format!("yt-dlp error: {err}"),
            (None, Some((url, err))) => format!("image {url} failed: {err}"),
            (None, None) => "incomplete after download".to_string(),
        })
    }
}

/// Extract, download and verify, one post at a time.
pub struct Pipeline<'a, S: RenderingSurface + ?Sized> {
    surface: &'a mut S,
    config: &'a Config,
    downloads: &'a DownloadManager,
}

impl<'a, S: RenderingSurface + ?Sized> Pipeline<'a, S> {
    pub fn new(surface: &'a mut S, config: &'a Config, downloads: &'a DownloadManager) -> Self {
        Self {
            surface,
            config,
            downloads,
        }
    }

    pub fn surface(&mut self) -> &mut S {
        &mut *self.surface
    }

    pub fn config(&self) -> &'a Config {
        self.config
    }

    pub async fn process(&mut self, url: &PostUrl) -> Result<PostOutcome> {
        let post = extract_post(
            &mut *self.surface,
            self.config.timings,
            self.config.filter,
            url,
            &self.config.paths.session_dir,
        )
        .await?;

        if !self.downloads.overwrites() && post_is_complete(&post) {
            info!(%url, "all media already present");
            return Ok(PostOutcome {
                images: ImageFetchReport::default(),
                video_error: None,
                downloaded: false,
                complete: true,
            });
        }

        let images = self
            .downloads
            .fetch_images(&post.items, &post.output_dir)
            .await;

        let video_error = if post.needs_video_fetch {
            let user_agent = match self.surface.user_agent().await {
                Ok(ua) => Some(ua),
                Err(err) => {
                    warn!("could not read browser user agent: {err}");
                    None
                }
            };
            match self
                .downloads
                .fetch_video(url, &post.output_dir, user_agent)
                .await
            {
                Ok(VideoFetch::AlreadyPresent) => None,
                Ok(VideoFetch::Downloaded) => {
                    debug!(%url, "video download finished");
                    None
                }
                Err(err) => {
                    warn!(%url, "video download failed: {err}");
                    Some(err.to_string())
                }
            }
        } else {
            None
        };

        let complete = post_is_complete(&post);
        info!(
            %url,
            shortcode = %post.record.shortcode,
            slides = post.slides_visited,
            fetched = images.fetched,
            skipped = images.skipped,
            failed = images.failed.len(),
            complete,
            "post done"
        );
        Ok(PostOutcome {
            images,
            video_error,
            downloaded: true,
            complete,
        })
    }
}
