//! Core domain types for course content monitoring.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Title assigned to a listing entry whose own text is empty.
pub const UNTITLED_PLACEHOLDER: &str = "Untitled content";

// ---------------------------------------------------------------------------
// ContentKind
// ---------------------------------------------------------------------------

/// Classification of a content item, persisted by its label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentKind {
    Video,
    Text,
    Quiz,
    Other,
}

impl ContentKind {
    /// Label used in the persisted catalog and in alert fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "Video",
            Self::Text => "Text",
            Self::Quiz => "Quiz",
            Self::Other => "Other",
        }
    }

    /// Parse a persisted label. Unknown labels fall back to [`ContentKind::Other`].
    pub fn from_label(label: &str) -> Self {
        match label {
            "Video" => Self::Video,
            "Text" => Self::Text,
            "Quiz" => Self::Quiz,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ContentItem
// ---------------------------------------------------------------------------

/// One addressable unit of course material as seen on the live listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Stable platform identifier (digits taken from the item link).
    pub id: String,
    /// Display title.
    pub title: String,
    /// Classified kind.
    pub content_kind: ContentKind,
    /// Absolute URL of the item page.
    pub url: String,
    /// Thumbnail, when known at extraction time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl ContentItem {
    /// Project this item into the record stored in the catalog.
    pub fn to_record(&self) -> CatalogRecord {
        CatalogRecord {
            title: self.title.clone(),
            content_kind: self.content_kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Persisted projection of a content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRecord {
    pub title: String,
    pub content_kind: ContentKind,
}

/// Durable snapshot of last-seen items keyed by item id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog(BTreeMap<String, CatalogRecord>);

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&CatalogRecord> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    /// Insert a record, replacing any previous record for `id`.
    pub fn insert(&mut self, id: impl Into<String>, record: CatalogRecord) {
        self.0.insert(id.into(), record);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CatalogRecord)> {
        self.0.iter()
    }
}

impl FromIterator<(String, CatalogRecord)> for Catalog {
    fn from_iter<I: IntoIterator<Item = (String, CatalogRecord)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// ChangeEvent
// ---------------------------------------------------------------------------

/// Why an item is newsworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The id was not in the catalog.
    New,
    /// The catalog recorded Text and the item is now Video.
    Upgraded,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Upgraded => "upgraded",
        }
    }
}

/// A detected change. Derived every cycle, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub item: ContentItem,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A browser cookie as exchanged with the automation driver and persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_only: Option<bool>,
    /// Expiry as seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            secure: None,
            http_only: None,
            expiry: None,
            same_site: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// The authenticated browser session. Only the cookies are persisted;
/// `authenticated` is re-established every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub cookies: Vec<Cookie>,
    pub authenticated: bool,
}
