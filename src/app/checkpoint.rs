use std::collections::{BTreeSet, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::config::SessionPaths;
use super::error::{Result, ScrapeError};
use super::normalize::normalize_post_url;
use super::types::PostUrl;

/// URLs whose downloads were verified complete. Stored as a sorted JSON array.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessedSet(BTreeSet<String>);

impl ProcessedSet {
    pub fn contains(&self, url: &PostUrl) -> bool {
        self.0.contains(url.as_str())
    }

    pub fn insert(&mut self, url: &PostUrl) -> bool {
        self.0.insert(url.to_string())
    }

    pub fn remove(&mut self, url: &str) -> bool {
        self.0.remove(url)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn url_for_shortcode(&self, shortcode: &str) -> Option<String> {
        self.0
            .iter()
            .find(|url| url.trim_end_matches('/').rsplit('/').next() == Some(shortcode))
            .cloned()
    }
}

pub struct CheckpointStore {
    paths: SessionPaths,
}

impl CheckpointStore {
    pub fn open(paths: SessionPaths) -> Result<Self> {
        fs::create_dir_all(&paths.session_dir)
            .map_err(|e| ScrapeError::persistence(&paths.session_dir, e))?;
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Missing or unreadable state starts over with an empty set.
    pub fn load_processed(&self) -> ProcessedSet {
        let path = &self.paths.processed;
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return ProcessedSet::default(),
            Err(err) => {
                warn!(file = %path.display(), "cannot read processed urls: {err}");
                return ProcessedSet::default();
            }
        };
        match serde_json::from_str::<ProcessedSet>(&raw) {
            Ok(set) => {
                info!(count = set.len(), "loaded processed urls");
                set
            }
            Err(err) => {
                warn!(file = %path.display(), "processed urls file is corrupt; starting empty: {err}");
                ProcessedSet::default()
            }
        }
    }

    pub fn save_processed(&self, set: &ProcessedSet) -> Result<()> {
        let path = &self.paths.processed;
        ensure_parent(path)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(set)?)
            .map_err(|e| ScrapeError::persistence(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| ScrapeError::persistence(path, e))?;
        debug!(count = set.len(), "saved processed urls");
        Ok(())
    }

    pub fn write_discovery_log(&self, links: &[PostUrl]) -> Result<()> {
        let path = &self.paths.discovery_log;
        ensure_parent(path)?;
        fs::write(path, lines(links)).map_err(|e| ScrapeError::persistence(path, e))?;
        info!(file = %path.display(), links = links.len(), "wrote discovered links");
        Ok(())
    }

    pub fn read_resume_pointer(&self, base_url: &str, username: Option<&str>) -> Option<PostUrl> {
        let raw = fs::read_to_string(&self.paths.resume_pointer).ok()?;
        let pointer = normalize_post_url(raw.trim(), base_url, username);
        if pointer.is_none() && !raw.trim().is_empty() {
            warn!(raw = raw.trim(), "ignoring unusable resume pointer");
        }
        pointer
    }

    pub fn write_resume_pointer(&self, url: &PostUrl) -> Result<()> {
        let path = &self.paths.resume_pointer;
        ensure_parent(path)?;
        fs::write(path, url.as_str()).map_err(|e| ScrapeError::persistence(path, e))
    }

    pub fn append_error(&self, url: &str, cause: &str) -> Result<()> {
        append_line(&self.paths.error_log, &format!("{url} — {cause}"))
    }

    /// Every `<session>-errors_*.log` in the session directory, oldest name first.
    pub fn error_logs(&self) -> Vec<PathBuf> {
        let prefix = format!("{}-errors_", self.paths.session_name);
        let Ok(entries) = fs::read_dir(&self.paths.session_dir) else {
            return Vec::new();
        };
        let mut logs = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path.file_name().and_then(|n| n.to_str()).is_some_and(|name| {
                        name.starts_with(&prefix) && name.ends_with(".log")
                    })
            })
            .collect::<Vec<_>>();
        logs.sort();
        logs
    }

    /// First token of each line, normalized and deduplicated in file order.
    pub fn read_error_urls(
        &self,
        logs: &[PathBuf],
        base_url: &str,
        username: Option<&str>,
    ) -> Vec<PostUrl> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for log in logs {
            let raw = match fs::read_to_string(log) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(file = %log.display(), "cannot read error log: {err}");
                    continue;
                }
            };
            for token in raw.lines().filter_map(|line| line.split_whitespace().next()) {
                match normalize_post_url(token, base_url, username) {
                    Some(url) if seen.insert(url.clone()) => urls.push(url),
                    Some(_) => {}
                    None => debug!(token, "skipping non-post error entry"),
                }
            }
        }
        urls
    }

    pub fn remove_error_logs(&self, logs: &[PathBuf]) {
        for log in logs {
            if let Err(err) = fs::remove_file(log) {
                warn!(file = %log.display(), "could not delete error log: {err}");
            }
        }
    }

    /// Writes the consolidated leftovers, or nothing when none remain.
    pub fn write_remaining_errors(&self, failed: &[(PostUrl, String)]) -> Result<Option<PathBuf>> {
        if failed.is_empty() {
            return Ok(None);
        }
        let path = self.paths.remaining_errors_log();
        let body = failed
            .iter()
            .map(|(url, cause)| format!("{url} — {cause}\n"))
            .collect::<String>();
        fs::write(&path, body).map_err(|e| ScrapeError::persistence(&path, e))?;
        Ok(Some(path))
    }
}

/// Checkpoint writes never end a run. A failed write is logged and the caller
/// carries on without its value.
pub fn keep_going<T>(what: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            error!("{what} failed: {err}");
            None
        }
    }
}

/// Newest-first discovery order flipped so the backlog runs oldest first.
pub fn oldest_first(mut links: Vec<PostUrl>) -> Vec<PostUrl> {
    links.reverse();
    links
}

/// Index of the first post after the pointer, or 0 when it is absent.
pub fn resume_offset(ordered: &[PostUrl], pointer: Option<&PostUrl>) -> usize {
    pointer
        .and_then(|p| ordered.iter().position(|url| url == p))
        .map_or(0, |idx| idx + 1)
}

fn lines(links: &[PostUrl]) -> String {
    links.iter().map(|url| format!("{url}\n")).collect()
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    ensure_parent(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| ScrapeError::persistence(path, e))?;
    writeln!(file, "{line}").map_err(|e| ScrapeError::persistence(path, e))
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| ScrapeError::persistence(parent, e))
        }
        _ => Ok(()),
    }
}
