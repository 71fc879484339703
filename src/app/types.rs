use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};

/// Canonical `/p/<id>/` or `/reel/<id>/` URL on the target site.
///
/// Only [`crate::app::normalize`] builds these, so two values compare equal
/// exactly when they name the same post.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostUrl(String);

impl PostUrl {
    pub(crate) fn from_canonical(url: String) -> Self {
        Self(url)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing path segment, e.g. `C0EVTGHSQUF`.
    pub fn shortcode(&self) -> &str {
        self.0
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

impl fmt::Display for PostUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value read from the page, or a stand-in used because the page did not
/// provide one in time.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed<T> {
    Found(T),
    Fallback(T),
}

impl<T> Observed<T> {
    pub fn value(&self) -> &T {
        match self {
            Observed::Found(v) | Observed::Fallback(v) => v,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Observed::Fallback(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    fn label_prefix(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub url: String,
    pub label: String,
    pub kind: MediaKind,
}

impl MediaItem {
    pub fn new(kind: MediaKind, index: usize, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: format!("{}_{index:02}", kind.label_prefix()),
            kind,
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind == MediaKind::Image
    }

    pub fn listing_line(&self) -> String {
        format!("{}: {}", self.label, self.url)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingBox {
    pub width: f64,
    pub height: f64,
    pub top: f64,
    pub left: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub url: String,
    pub shortcode: String,
    pub caption: String,
    pub timestamp: String,
    #[serde(default)]
    pub timestamp_synthesized: bool,
}

impl PostRecord {
    pub fn new(url: &PostUrl, caption: String, taken_at: &Observed<DateTime<FixedOffset>>) -> Self {
        Self {
            url: url.to_string(),
            shortcode: url.shortcode().to_string(),
            caption,
            timestamp: taken_at.value().to_rfc3339(),
            timestamp_synthesized: taken_at.is_fallback(),
        }
    }

    /// `<YYYYMMDD>_<shortcode>`, dated in the timestamp's own offset.
    pub fn output_dir_name(&self) -> String {
        let day = DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.format("%Y%m%d").to_string())
            .unwrap_or_else(|_| Local::now().format("%Y%m%d").to_string());
        format!("{day}_{}", self.shortcode)
    }
}

/// Everything the extractor learned about one post.
#[derive(Debug, Clone)]
pub struct ExtractedPost {
    pub record: PostRecord,
    pub items: Vec<MediaItem>,
    pub output_dir: PathBuf,
    pub needs_video_fetch: bool,
    pub slides_visited: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_two_digit_and_kind_prefixed() {
        assert_eq!(MediaItem::new(MediaKind::Image, 1, "u").label, "image_01");
        assert_eq!(MediaItem::new(MediaKind::Video, 12, "u").label, "video_12");
        assert_eq!(
            MediaItem::new(MediaKind::Image, 3, "https://cdn/x.jpg").listing_line(),
            "image_03: https://cdn/x.jpg"
        );
    }

    #[test]
    fn output_dir_uses_timestamp_day_in_its_offset() {
        let url = PostUrl::from_canonical("https://www.instagram.com/p/ABC123/".into());
        let ts = DateTime::parse_from_rfc3339("2023-11-20T23:30:00.000Z").expect("ts");
        let record = PostRecord::new(&url, "hello".into(), &Observed::Found(ts));
        assert_eq!(record.shortcode, "ABC123");
        assert!(!record.timestamp_synthesized);
        assert_eq!(record.output_dir_name(), "20231120_ABC123");
    }

    #[test]
    fn fallback_timestamp_is_flagged_in_record() {
        let url = PostUrl::from_canonical("https://www.instagram.com/reel/XYZ/".into());
        let now = Local::now().fixed_offset();
        let record = PostRecord::new(&url, String::new(), &Observed::Fallback(now));
        assert!(record.timestamp_synthesized);
        assert_eq!(
            record.output_dir_name(),
            format!("{}_XYZ", now.format("%Y%m%d"))
        );
    }
}
