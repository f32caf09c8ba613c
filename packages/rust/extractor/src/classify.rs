//! Content kind classification from keyword and path markers.
//!
//! A marker that starts with `/` is a path marker: it matches a segment of the
//! row's link path (`/lesson` matches `/lesson/12` and `/lessons/12`). Any
//! other marker is a keyword: it matches a whole `class` token or
//! `data-type` value of the row, a link path segment, or the last dash or
//! underscore separated part of a token (`video` matches `icon-video`).
//! Keywords never match inside a word, so `play` leaves `display-name` alone.

use coursewatch_shared::{ContentKind, MarkersConfig};
use scraper::ElementRef;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    Segment(String),
    Keyword(String),
}

impl Marker {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_lowercase();
        if let Some(segment) = raw.strip_prefix('/') {
            let segment = segment.trim_matches('/');
            return (!segment.is_empty()).then(|| Self::Segment(segment.to_string()));
        }
        if raw.is_empty() {
            None
        } else {
            Some(Self::Keyword(raw))
        }
    }

    fn matches(&self, row: &RowMarkers) -> bool {
        match self {
            Self::Segment(name) => row.segments.iter().any(|s| segment_matches(s, name)),
            Self::Keyword(word) => {
                row.segments.iter().any(|s| s == word)
                    || row.tokens.iter().any(|t| token_matches(t, word))
            }
        }
    }
}

fn segment_matches(segment: &str, name: &str) -> bool {
    segment == name || segment.strip_suffix('s') == Some(name)
}

fn token_matches(token: &str, word: &str) -> bool {
    token == word
        || token
            .strip_suffix(word)
            .is_some_and(|head| head.ends_with(['-', '_']))
}

/// Compiled marker lists, checked in the fixed order video, text, quiz.
#[derive(Debug, Clone)]
pub struct KindMarkers {
    ordered: Vec<(ContentKind, Vec<Marker>)>,
}

impl KindMarkers {
    pub fn new(config: &MarkersConfig) -> Self {
        let compile = |list: &[String]| -> Vec<Marker> {
            list.iter().filter_map(|m| Marker::parse(m)).collect()
        };
        Self {
            ordered: vec![
                (ContentKind::Video, compile(&config.video)),
                (ContentKind::Text, compile(&config.text)),
                (ContentKind::Quiz, compile(&config.quiz)),
            ],
        }
    }

    /// First kind with a marker on `row`, else [`ContentKind::Other`].
    pub fn classify(&self, row: &RowMarkers) -> ContentKind {
        self.ordered
            .iter()
            .find(|(_, markers)| markers.iter().any(|m| m.matches(row)))
            .map(|(kind, _)| *kind)
            .unwrap_or(ContentKind::Other)
    }
}

impl Default for KindMarkers {
    fn default() -> Self {
        Self::new(&MarkersConfig::default())
    }
}

/// What a listing row says about its kind, lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowMarkers {
    segments: Vec<String>,
    tokens: Vec<String>,
}

impl RowMarkers {
    /// Markers from a link target and raw attribute values.
    pub fn new<'a>(href: &str, attributes: impl IntoIterator<Item = &'a str>) -> Self {
        let tokens = attributes
            .into_iter()
            .flat_map(str::split_whitespace)
            .map(str::to_lowercase)
            .collect();
        Self {
            segments: path_segments(href),
            tokens,
        }
    }

    /// Markers of a parsed row: the link target plus the `class`,
    /// `data-type` and `data-content-type` attributes of the row and its
    /// descendants.
    pub(crate) fn of_row(node: &ElementRef<'_>, href: &str) -> Self {
        let elements =
            std::iter::once(*node).chain(node.descendants().filter_map(ElementRef::wrap));
        let attributes = elements.flat_map(|el| {
            ["class", "data-type", "data-content-type"]
                .into_iter()
                .filter_map(move |name| el.value().attr(name))
        });
        Self::new(href, attributes)
    }
}

/// Path segments of a link, absolute or relative. Query and fragment are
/// dropped.
fn path_segments(href: &str) -> Vec<String> {
    let path = href.split(['?', '#']).next().unwrap_or_default();
    let path = match path.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |i| &rest[i..]),
        None => path,
    };
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect()
}
