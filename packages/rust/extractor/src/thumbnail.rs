//! Thumbnail lookup on an item's own page.
//!
//! Video players usually live in an embedded frame and describe themselves
//! with a JSON-LD `VideoObject`. Every frame is scanned and the first
//! `thumbnailUrl` wins.

use std::time::Duration;

use coursewatch_browser::{AutomationDriver, WaitPolicy};
use serde_json::Value;
use tracing::{debug, instrument};

/// Returns the text of every JSON-LD block in the current frame.
pub const STRUCTURED_DATA_SCRIPT: &str = r#"return Array.from(document.querySelectorAll('script[type="application/ld+json"]')).map(function (s) { return s.textContent; });"#;

/// Outcome of a thumbnail lookup. Absence is expected, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Thumbnail {
    Found(String),
    Absent,
}

impl Thumbnail {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// The found URL, or `default` when absent.
    pub fn or_default(self, default: &str) -> String {
        match self {
            Self::Found(url) => url,
            Self::Absent => default.to_string(),
        }
    }
}

/// Visit `url`, let dynamic content settle, and scan every frame for a
/// structured-data thumbnail.
///
/// Navigation and evaluation failures degrade to [`Thumbnail::Absent`].
#[instrument(skip(driver, navigation_timeout, settle))]
pub async fn extract_thumbnail(
    driver: &dyn AutomationDriver,
    url: &str,
    navigation_timeout: Duration,
    settle: Duration,
) -> Thumbnail {
    if let Err(e) = driver.navigate(url, WaitPolicy::Load, navigation_timeout).await {
        debug!(error = %e, "item page did not load, no thumbnail");
        return Thumbnail::Absent;
    }

    if !settle.is_zero() {
        tokio::time::sleep(settle).await;
    }

    let frames = match driver.list_frames().await {
        Ok(frames) => frames,
        Err(e) => {
            debug!(error = %e, "could not list frames, no thumbnail");
            return Thumbnail::Absent;
        }
    };

    for frame in &frames {
        match driver.evaluate_in_frame(frame, STRUCTURED_DATA_SCRIPT).await {
            Ok(blocks) => {
                if let Some(found) = thumbnail_from_blocks(&blocks) {
                    debug!(%frame, thumbnail = %found, "thumbnail found");
                    return Thumbnail::Found(found);
                }
            }
            Err(e) => debug!(%frame, error = %e, "frame not readable"),
        }
    }

    debug!(frames = frames.len(), "no structured-data thumbnail on page");
    Thumbnail::Absent
}

/// First thumbnail in a list of raw JSON-LD block texts.
/// Blocks that are not valid JSON are skipped.
pub fn thumbnail_from_blocks(blocks: &Value) -> Option<String> {
    blocks
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|text| serde_json::from_str::<Value>(text).ok())
        .find_map(|doc| find_thumbnail(&doc))
}

/// Depth-first search for a thumbnail field.
fn find_thumbnail(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => items.iter().find_map(find_thumbnail),
        Value::Object(map) => {
            if let Some(url) = map.get("thumbnailUrl").and_then(first_url) {
                return Some(url);
            }
            if let Some(url) = map.get("thumbnail").and_then(|t| {
                first_url(t).or_else(|| t.get("url").and_then(first_url))
            }) {
                return Some(url);
            }
            if let Some(url) = map.get("@graph").and_then(find_thumbnail) {
                return Some(url);
            }
            map.iter()
                .filter(|(key, _)| !matches!(key.as_str(), "thumbnailUrl" | "thumbnail" | "@graph"))
                .find_map(|(_, v)| find_thumbnail(v))
        }
        _ => None,
    }
}

/// A non-empty string, or the first non-empty string of an array.
fn first_url(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Array(items) => items.iter().find_map(first_url),
        _ => None,
    }
}
