//! Heuristic extraction of sortable fields from one playlist item.
//!
//! Nothing here is guaranteed accurate: every field is read through a
//! cascade of sub-selectors and degrades to a literal fallback when the host
//! markup does not cooperate. Values are recomputed on every call because the
//! live text may have changed since the last read.

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    selector::{parse_cascade, query_all, query_first, Selector},
    tree::HostTree,
};

pub const UNKNOWN_TITLE: &str = "Unknown Title";

const TITLE_CASCADE: [&str; 11] = [
    "#video-title",
    ".ytd-playlist-video-renderer #video-title",
    "a[id=\"video-title\"]",
    "[id=\"video-title\"] span",
    ".ytd-playlist-panel-video-renderer #video-title",
    "ytd-playlist-panel-renderer #video-title",
    ".ytd-playlist-panel-video-renderer a[href*=\"watch\"]",
    "h3 a",
    ".video-title",
    "a[href*=\"watch\"] span",
    "[class*=\"title\"] a",
];

const WATCH_LINK: &str = "a[href*=\"watch\"]";

const DURATION_CASCADE: [&str; 6] = [
    ".ytd-thumbnail-overlay-time-status-renderer",
    ".ytd-playlist-video-renderer .ytd-thumbnail-overlay-time-status-renderer",
    ".ytd-playlist-panel-video-renderer .ytd-thumbnail-overlay-time-status-renderer",
    "[class*=\"duration\"]",
    "[class*=\"time-status\"]",
    ".video-duration",
];

const RECENCY_CASCADE: [&str; 11] = [
    ".ytd-video-meta-block .style-scope.ytd-video-meta-block:last-child",
    ".ytd-video-meta-block [id=\"metadata-line\"]:last-child",
    "#metadata-line span:last-child",
    ".metadata-line span:last-child",
    "[id=\"video-info\"] .style-scope:last-child",
    ".ytd-playlist-video-renderer #metadata-line span:last-child",
    ".ytd-playlist-panel-video-renderer #metadata-line span:last-child",
    ".ytd-playlist-panel-video-renderer .ytd-video-meta-block span:last-child",
    "ytd-playlist-panel-renderer #metadata-line span:last-child",
    ".ytd-playlist-panel-video-renderer [class*=\"metadata\"] span:last-child",
    "#secondary .ytd-playlist-video-renderer #metadata span:last-child",
];

/// Words that mark a piece of text as a relative upload date.
const DATE_LEXICON: [&str; 12] = [
    "ago",
    "second",
    "minute",
    "hour",
    "day",
    "week",
    "month",
    "year",
    "yesterday",
    "today",
    "streamed",
    "premiered",
];

static TITLE_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| parse_cascade(&TITLE_CASCADE));
static WATCH_LINK_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| parse_cascade(&[WATCH_LINK]));
static DURATION_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| parse_cascade(&DURATION_CASCADE));
static RECENCY_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| parse_cascade(&RECENCY_CASCADE));
static SPAN_SELECTORS: Lazy<Vec<Selector>> = Lazy::new(|| parse_cascade(&["span"]));

static BROADCAST_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(streamed|premiered)\s+(.+)").expect("broadcast prefix pattern is valid")
});
static RELATIVE_AGO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\s*(second|minute|hour|day|week|month|year)s?\s*ago")
        .expect("relative date pattern is valid")
});
static NOW_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bnow\b").expect("now pattern is valid"));

/// Sortable fields of one item at the time of extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFields {
    pub title: String,
    /// Zero when the duration could not be read.
    pub duration_seconds: u64,
    /// Unix epoch when the upload date could not be read.
    pub recency: DateTime<Utc>,
}

pub fn extract_fields<T: HostTree>(tree: &T, item: T::Node, now: DateTime<Utc>) -> ExtractedFields {
    ExtractedFields {
        title: title(tree, item),
        duration_seconds: duration_seconds(tree, item),
        recency: recency(tree, item, now),
    }
}

/// Title of `item`, preferring an explicit `title` attribute over the
/// visible text of the same element.
pub fn title<T: HostTree>(tree: &T, item: T::Node) -> String {
    for selector in TITLE_SELECTORS.iter() {
        if let Some(text) = query_first(tree, Some(item), selector).and_then(|node| label(tree, node)) {
            return text;
        }
    }

    for selector in WATCH_LINK_SELECTORS.iter() {
        for link in query_all(tree, Some(item), selector) {
            if let Some(text) = label(tree, link) {
                return text;
            }
        }
    }

    log::trace!("No title found for item {:?}", item);
    UNKNOWN_TITLE.to_string()
}

fn label<T: HostTree>(tree: &T, node: T::Node) -> Option<String> {
    tree.attribute(node, "title")
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .or_else(|| {
            let text = tree.text_content(node);
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        })
}

/// Duration of `item` in seconds; `0` when unknown.
pub fn duration_seconds<T: HostTree>(tree: &T, item: T::Node) -> u64 {
    for selector in DURATION_SELECTORS.iter() {
        if let Some(node) = query_first(tree, Some(item), selector) {
            let text = tree.text_content(node);
            if !text.is_empty() {
                return parse_duration(&text);
            }
        }
    }
    0
}

/// Parses `mm:ss` or `h:mm:ss`; anything else is `0`.
pub fn parse_duration(text: &str) -> u64 {
    let parts: Option<Vec<u64>> = text
        .trim()
        .split(':')
        .map(|part| {
            let part = part.trim();
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            part.parse::<u64>().ok()
        })
        .collect();

    match parts.as_deref() {
        Some(parts @ ([_, _] | [_, _, _])) => parts
            .iter()
            .fold(0u64, |total, part| total.saturating_mul(60).saturating_add(*part)),
        _ => 0,
    }
}

/// Raw upload date text of `item`, if any candidate looks like a date.
pub fn recency_text<T: HostTree>(tree: &T, item: T::Node) -> Option<String> {
    for selector in RECENCY_SELECTORS.iter() {
        if let Some(node) = query_first(tree, Some(item), selector) {
            let text = tree.text_content(node);
            let text = text.trim();
            if is_date_text(text) {
                return Some(text.to_string());
            }
        }
    }

    for selector in SPAN_SELECTORS.iter() {
        for span in query_all(tree, Some(item), selector) {
            let text = tree.text_content(span);
            let text = text.trim();
            if is_date_text(text) {
                return Some(text.to_string());
            }
        }
    }
    None
}

pub fn recency<T: HostTree>(tree: &T, item: T::Node, now: DateTime<Utc>) -> DateTime<Utc> {
    match recency_text(tree, item) {
        Some(text) => parse_recency(&text, now),
        None => DateTime::<Utc>::UNIX_EPOCH,
    }
}

pub fn is_date_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    DATE_LEXICON.iter().any(|word| lower.contains(word))
}

/// Converts a relative date such as `"Streamed 3 weeks ago"` into a
/// timestamp. Months are 30 days and years 365 days. Unparsable text is the
/// Unix epoch, which sorts as infinitely old.
pub fn parse_recency(text: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let text = text.trim().to_lowercase();
    if text.is_empty() {
        return DateTime::<Utc>::UNIX_EPOCH;
    }
    if text.contains("streamed") || text.contains("premiered") {
        if let Some(captures) = BROADCAST_PREFIX.captures(&text) {
            return parse_relative(&captures[2], now);
        }
    }
    parse_relative(&text, now)
}

fn parse_relative(text: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    if NOW_WORD.is_match(text) {
        return now;
    }

    let Some(captures) = RELATIVE_AGO.captures(text) else {
        if text.contains("yesterday") {
            return now - Duration::hours(24);
        }
        if text.contains("today") {
            return now;
        }
        return DateTime::<Utc>::UNIX_EPOCH;
    };

    let Ok(value) = captures[1].parse::<i64>() else {
        return DateTime::<Utc>::UNIX_EPOCH;
    };
    let unit_ms: i64 = match &captures[2] {
        "second" => 1_000,
        "minute" => 60 * 1_000,
        "hour" => 60 * 60 * 1_000,
        "day" => 24 * 60 * 60 * 1_000,
        "week" => 7 * 24 * 60 * 60 * 1_000,
        "month" => 30 * 24 * 60 * 60 * 1_000,
        "year" => 365 * 24 * 60 * 60 * 1_000,
        _ => 0,
    };
    value
        .checked_mul(unit_ms)
        .and_then(Duration::try_milliseconds)
        .and_then(|offset| now.checked_sub_signed(offset))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
