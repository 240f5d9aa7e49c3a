//! Auto-generated directory listings, as served by Python's `http.server`.

use regex::Regex;

const LISTING_MARKER: &[u8] = b"<title>Directory listing for ";

lazy_static::lazy_static! {
    static ref REGEX_TITLE: Regex = Regex::new(r"Directory listing for ([^<]*)<").unwrap();
    static ref REGEX_HREF: Regex = Regex::new(r#"href=["']([^"']*)["']"#).unwrap();
}

pub fn is_directory_listing(page: &[u8]) -> bool {
    page.windows(LISTING_MARKER.len())
        .any(|window| window == LISTING_MARKER)
}

/// Every entry linked from a listing page, as a path relative to the crawl
/// root. `root_path` is the URL path of the crawl root, e.g. `/.git/`.
/// Sub-directories keep their trailing `/`.
pub fn parse_listing(page: &[u8], root_path: &str) -> Vec<String> {
    let page = String::from_utf8_lossy(page);
    let dir = REGEX_TITLE
        .captures(&page)
        .map(|captures| relative_dir(captures[1].trim(), root_path))
        .unwrap_or_default();

    REGEX_HREF
        .captures_iter(&page)
        .map(|captures| captures[1].to_owned())
        .filter(|href| is_child_link(href))
        .map(|href| format!("{dir}{href}"))
        .collect()
}

fn relative_dir(listed: &str, root_path: &str) -> String {
    if let Some(rest) = listed.strip_prefix(root_path) {
        return rest.to_owned();
    }
    match listed.find("/.git/") {
        Some(idx) => listed[idx + "/.git/".len()..].to_owned(),
        None => String::new(),
    }
}

fn is_child_link(href: &str) -> bool {
    !href.is_empty()
        && !href.starts_with('/')
        && !href.starts_with("..")
        && !href.starts_with('?')
        && !href.starts_with('#')
        && !href.contains("://")
}
