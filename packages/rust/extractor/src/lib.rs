//! Content listing extraction.
//!
//! Reads the course listing from an authenticated browser context and turns
//! each row into a [`ContentItem`]. Parsing is separated from the browser so
//! it can be driven from plain HTML in tests.

pub mod classify;
pub mod thumbnail;

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use tracing::{debug, info, instrument, warn};
use url::Url;

use coursewatch_browser::{AutomationDriver, WaitPolicy};
use coursewatch_shared::{
    ContentItem, CourseWatchError, MarkersConfig, MonitorConfig, Result, SelectorsConfig,
    UNTITLED_PLACEHOLDER,
};

pub use classify::{KindMarkers, RowMarkers};
pub use thumbnail::{Thumbnail, extract_thumbnail};

/// Compiled selectors and markers for parsing a listing.
#[derive(Debug, Clone)]
pub struct ListingRules {
    item: Selector,
    link: Selector,
    markers: KindMarkers,
}

impl ListingRules {
    pub fn new(selectors: &SelectorsConfig, markers: &MarkersConfig) -> Result<Self> {
        Ok(Self {
            item: parse_selector(&selectors.content_item, "selectors.content_item")?,
            link: parse_selector("a[href]", "link")?,
            markers: KindMarkers::new(markers),
        })
    }
}

fn parse_selector(raw: &str, name: &str) -> Result<Selector> {
    Selector::parse(raw)
        .map_err(|e| CourseWatchError::config(format!("{name}: invalid selector `{raw}`: {e}")))
}

/// Read the current content listing.
///
/// Navigates to the content URL unless the context is already there, waits
/// for the listing marker, and parses the rendered document. A marker that
/// never appears is an extraction error.
#[instrument(skip_all, fields(content_url = %config.content_url))]
pub async fn extract(
    driver: &dyn AutomationDriver,
    config: &MonitorConfig,
) -> Result<Vec<ContentItem>> {
    let rules = ListingRules::new(&config.selectors, &config.markers)?;

    let location = driver.current_location().await?;
    if !same_page(&location, &config.content_url) {
        debug!(%location, "navigating to content listing");
        driver
            .navigate(
                config.content_url.as_str(),
                WaitPolicy::DomContentLoaded,
                config.timeouts.navigation,
            )
            .await?;
    }

    driver
        .wait_for_selector(&config.selectors.content_list, config.timeouts.selector_wait)
        .await
        .map_err(|e| {
            if e.is_timeout() {
                CourseWatchError::extraction(format!(
                    "content listing `{}` did not appear within {}ms",
                    config.selectors.content_list,
                    config.timeouts.selector_wait.as_millis()
                ))
            } else {
                e
            }
        })?;

    let html = driver.rendered_document().await?;
    let items = parse_listing(&html, &rules, &config.base_url);

    if items.is_empty() {
        warn!("content listing rendered but no items matched");
    } else {
        info!(items = items.len(), "content listing extracted");
    }
    Ok(items)
}

/// Parse listing rows out of `html`.
///
/// Rows without a link or without a numeric id in the link are skipped.
/// Duplicate ids keep the first occurrence.
pub fn parse_listing(html: &str, rules: &ListingRules, base_url: &Url) -> Vec<ContentItem> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for node in document.select(&rules.item) {
        let Some(href) = link_target(&node, &rules.link) else {
            debug!("listing row without link, skipped");
            continue;
        };
        let Some(id) = numeric_id(href) else {
            debug!(href, "listing link without numeric id, skipped");
            continue;
        };
        if !seen.insert(id.clone()) {
            debug!(%id, "duplicate listing id, keeping first");
            continue;
        }

        let markers = RowMarkers::of_row(&node, href);
        let url = base_url
            .join(href)
            .map(String::from)
            .unwrap_or_else(|_| href.to_string());

        items.push(ContentItem {
            id,
            title: own_text(&node),
            content_kind: rules.markers.classify(&markers),
            url,
            thumbnail_url: None,
        });
    }

    items
}

/// The row's own `href`, else the first descendant link.
fn link_target<'a>(node: &ElementRef<'a>, link: &Selector) -> Option<&'a str> {
    let own = node.value();
    if own.name() == "a" {
        if let Some(href) = own.attr("href") {
            return Some(href);
        }
    }
    node.select(link).next().and_then(|a| a.value().attr("href"))
}

/// First run of ASCII digits in a link.
fn numeric_id(href: &str) -> Option<String> {
    static DIGITS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));
    DIGITS_RE.find(href).map(|m| m.as_str().to_string())
}

/// Text directly inside the row, ignoring nested elements such as badges
/// or durations. Whitespace is collapsed.
fn own_text(node: &ElementRef<'_>) -> String {
    let raw: String = node
        .children()
        .filter_map(|child| match child.value() {
            Node::Text(text) => Some(&**text),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ");

    let title = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        UNTITLED_PLACEHOLDER.to_string()
    } else {
        title
    }
}

/// Same scheme, host and path; query and fragment are ignored.
fn same_page(location: &str, target: &Url) -> bool {
    Url::parse(location).is_ok_and(|loc| {
        loc.scheme() == target.scheme()
            && loc.host_str() == target.host_str()
            && loc.port_or_known_default() == target.port_or_known_default()
            && loc.path().trim_end_matches('/') == target.path().trim_end_matches('/')
    })
}
