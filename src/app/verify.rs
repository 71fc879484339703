use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::debug;

use super::download::image_file_name;
use super::types::{ExtractedPost, MediaItem};

pub const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "webm", "mkv"];

/// File names directly inside `dir`; empty when it cannot be read.
pub fn dir_listing(dir: &Path) -> HashSet<String> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect(),
        Err(err) => {
            debug!(dir = %dir.display(), "cannot list directory: {err}");
            HashSet::new()
        }
    }
}

pub fn has_video_output(files: &HashSet<String>) -> bool {
    files.iter().any(|name| {
        name.starts_with("video")
            && Path::new(name)
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    })
}

/// Every expected image is on disk, and a video file exists when one was
/// expected. A post with nothing expected at all is never complete.
pub fn is_complete(items: &[MediaItem], needs_video: bool, files: &HashSet<String>) -> bool {
    let mut images = items.iter().filter(|i| i.is_image()).peekable();
    if images.peek().is_none() && !needs_video {
        return false;
    }
    let images_present = images.all(|item| files.contains(&image_file_name(item)));
    images_present && (!needs_video || has_video_output(files))
}

pub fn post_is_complete(post: &ExtractedPost) -> bool {
    is_complete(
        &post.items,
        post.needs_video_fetch,
        &dir_listing(&post.output_dir),
    )
}
