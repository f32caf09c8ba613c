//! Shared types, error model, and configuration for CourseWatch.
//!
//! This crate is the foundation depended on by all other CourseWatch crates.
//! It provides:
//! - [`CourseWatchError`]: the unified error type
//! - Domain types ([`ContentItem`], [`Catalog`], [`ChangeEvent`], [`Cookie`])
//! - Configuration ([`AppConfig`], [`MonitorConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, Credentials, DEFAULT_CONFIG_TEMPLATE, MarkersConfig, MonitorConfig,
    SelectorsConfig, Timeouts, TimeoutsConfig, WebDriverConfig, config_dir, config_file_path,
    init_config, init_config_at, load_config, load_config_from,
};
pub use error::{CourseWatchError, Result};
pub use types::{
    Catalog, CatalogRecord, ChangeEvent, ChangeKind, ContentItem, ContentKind, Cookie,
    SessionState, UNTITLED_PLACEHOLDER,
};
