use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::config::ScrollPolicy;
use super::error::{Result, ScrapeError};
use super::normalize::normalize_post_url;
use super::surface::RenderingSurface;
use super::types::PostUrl;

pub const POST_ANCHOR_SELECTOR: &str = r#"a[href*="/p/"], a[href*="/reel/"]"#;

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryTarget<'a> {
    pub profile_url: &'a str,
    pub base_url: &'a str,
    pub username: Option<&'a str>,
    pub max_links: Option<usize>,
}

/// Links in first-seen (newest-first) order. When the surface failed part
/// way, `aborted` holds the cause and `links` what was collected before it.
#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    pub links: Vec<PostUrl>,
    pub scrolls: usize,
    pub aborted: Option<ScrapeError>,
}

pub async fn collect_post_links<S>(
    surface: &mut S,
    target: DiscoveryTarget<'_>,
    policy: &ScrollPolicy,
) -> DiscoveryOutcome
where
    S: RenderingSurface + ?Sized,
{
    info!(profile = target.profile_url, "scanning profile");
    let mut outcome = DiscoveryOutcome::default();
    if let Err(err) = crawl_feed(surface, target, policy, &mut outcome).await {
        warn!(
            collected = outcome.links.len(),
            "link discovery stopped by browser error: {err}"
        );
        outcome.aborted = Some(err);
    }
    info!(links = outcome.links.len(), "collected post and reel links");
    outcome
}

async fn crawl_feed<S>(
    surface: &mut S,
    target: DiscoveryTarget<'_>,
    policy: &ScrollPolicy,
    outcome: &mut DiscoveryOutcome,
) -> Result<()>
where
    S: RenderingSurface + ?Sized,
{
    surface.navigate(target.profile_url).await?;
    tokio::time::sleep(policy.initial_settle).await;

    let mut seen = HashSet::new();
    let mut last_height = surface.scroll_height().await?;
    loop {
        if scan_anchors(surface, target, &mut seen, &mut outcome.links).await? {
            info!(cap = ?target.max_links, "reached link cap");
            return Ok(());
        }

        surface.scroll_to_bottom().await?;
        outcome.scrolls += 1;
        match wait_for_growth(surface, last_height, policy).await? {
            Some(height) => {
                debug!(height, "scrolled and detected new content");
                last_height = height;
            }
            None => {
                info!("reached end of scrollable content");
                return Ok(());
            }
        }
    }
}

/// Appends newly seen post links; returns `true` once the cap is hit.
pub async fn scan_anchors<S>(
    surface: &mut S,
    target: DiscoveryTarget<'_>,
    seen: &mut HashSet<PostUrl>,
    links: &mut Vec<PostUrl>,
) -> Result<bool>
where
    S: RenderingSurface + ?Sized,
{
    let cap_hit = |links: &Vec<PostUrl>| target.max_links.is_some_and(|max| links.len() >= max);
    if cap_hit(links) {
        return Ok(true);
    }

    for anchor in surface.find_elements(POST_ANCHOR_SELECTOR).await? {
        let Some(href) = surface.attribute(&anchor, "href").await? else {
            continue;
        };
        let Some(url) = normalize_post_url(&href, target.base_url, target.username) else {
            continue;
        };
        if seen.insert(url.clone()) {
            debug!(%url, "discovered");
            links.push(url);
            if cap_hit(links) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

async fn wait_for_growth<S>(
    surface: &mut S,
    last_height: i64,
    policy: &ScrollPolicy,
) -> Result<Option<i64>>
where
    S: RenderingSurface + ?Sized,
{
    for waited in 1..=policy.polls {
        tokio::time::sleep(policy.poll_interval).await;
        let height = surface.scroll_height().await?;
        if height > last_height {
            return Ok(Some(height));
        }
        debug!(waited, polls = policy.polls, "no new content yet");
    }
    Ok(None)
}
