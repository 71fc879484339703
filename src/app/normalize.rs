use url::Url;

use super::types::PostUrl;

const POST_KINDS: [&str; 2] = ["p", "reel"];

/// Turns a raw href into a canonical post URL, or `None` when it does not
/// point at a post or reel on the base site.
///
/// Relative hrefs resolve against `base_url`. Query and fragment are dropped,
/// a leading `/<username>/` segment in front of `p/` or `reel/` is removed,
/// and anything past the id is cut so the result is always
/// `<origin>/p/<id>/` or `<origin>/reel/<id>/`.
pub fn normalize_post_url(href: &str, base_url: &str, username: Option<&str>) -> Option<PostUrl> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    let base = Url::parse(base_url).ok()?;
    let mut url = base.join(href).ok()?;
    if !is_same_site(&url, &base) {
        return None;
    }
    url.set_query(None);
    url.set_fragment(None);

    let mut segments = url
        .path_segments()?
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    if let Some(user) = username.map(str::trim).filter(|u| !u.is_empty()) {
        let scoped = segments.len() >= 3
            && segments[0].eq_ignore_ascii_case(user)
            && POST_KINDS.contains(&segments[1]);
        if scoped {
            segments.remove(0);
        }
    }

    let (kind, id) = match segments.as_slice() {
        [kind, id, ..] if POST_KINDS.contains(kind) && !id.is_empty() => (*kind, *id),
        _ => return None,
    };

    Some(PostUrl::from_canonical(format!(
        "{}/{kind}/{id}/",
        base.origin().ascii_serialization()
    )))
}

pub fn post_url_for_shortcode(base_url: &str, shortcode: &str) -> Option<PostUrl> {
    let shortcode = shortcode.trim().trim_matches('/');
    if shortcode.is_empty() || shortcode.contains('/') {
        return None;
    }
    normalize_post_url(&format!("/p/{shortcode}/"), base_url, None)
}

pub fn profile_url(base_url: &str, username: &str) -> String {
    format!("{}/{}/", base_url.trim_end_matches('/'), username.trim())
}

fn is_same_site(candidate: &Url, base: &Url) -> bool {
    if !matches!(candidate.scheme(), "http" | "https") || candidate.scheme() != base.scheme() {
        return false;
    }
    match (candidate.host_str(), base.host_str()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b) && candidate.port() == base.port(),
        _ => false,
    }
}
