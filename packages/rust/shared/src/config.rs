//! Application configuration for CourseWatch.
//!
//! User config lives at `~/.coursewatch/coursewatch.toml` unless a path is
//! given on the command line. The raw file is deserialized into [`AppConfig`],
//! then validated once into the immutable [`MonitorConfig`] that every
//! component receives by reference.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CourseWatchError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "coursewatch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".coursewatch";

/// Default database file name inside the config directory.
const DB_FILE_NAME: &str = "coursewatch.db";

/// Starter file written by `coursewatch config init`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# CourseWatch configuration

[endpoints]
# Webhook that receives one alert per detected change.
webhook_url = ""
# Login form page of the course platform.
login_url = ""
# Page that renders the course content listing.
content_url = ""
# Base used to resolve relative item links.
base_url = ""
# Image used when a video item exposes no thumbnail.
default_thumbnail_url = ""

[schedule]
# Seconds-first cron expression, e.g. every 15 minutes:
cron = "0 */15 * * * *"
run_on_start = false

[credentials]
email = ""
# Name of the env var holding the password (never store the password itself).
password_env = "COURSEWATCH_PASSWORD"

[timeouts]
navigation_ms = 30000
selector_wait_ms = 15000
keystroke_delay_ms = 50
notification_delay_ms = 1500
image_settle_ms = 3000
webhook_ms = 10000
script_ms = 10000

[webdriver]
url = "http://localhost:9515"
browser = "chrome"
headless = true
"#;

// ---------------------------------------------------------------------------
// Config structs (matching coursewatch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub selectors: SelectorsConfig,

    #[serde(default)]
    pub markers: MarkersConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub webdriver: WebDriverConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,
}

/// `[endpoints]` section. Every field is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_thumbnail_url: Option<String>,
}

/// `[schedule]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds-first cron expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    /// Run one cycle immediately when the daemon starts.
    #[serde(default)]
    pub run_on_start: bool,
}

/// `[credentials]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Name of the env var holding the password.
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            email: None,
            password_env: default_password_env(),
        }
    }
}

fn default_password_env() -> String {
    "COURSEWATCH_PASSWORD".into()
}

/// `[selectors]` section: CSS selectors for the login form and the listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorsConfig {
    #[serde(default = "default_email_input")]
    pub email_input: String,
    #[serde(default = "default_password_input")]
    pub password_input: String,
    #[serde(default = "default_submit_button")]
    pub submit_button: String,
    /// Marker that signals the content listing has rendered.
    #[serde(default = "default_content_list")]
    pub content_list: String,
    /// One match per listing row.
    #[serde(default = "default_content_item")]
    pub content_item: String,
}

impl Default for SelectorsConfig {
    fn default() -> Self {
        Self {
            email_input: default_email_input(),
            password_input: default_password_input(),
            submit_button: default_submit_button(),
            content_list: default_content_list(),
            content_item: default_content_item(),
        }
    }
}

impl SelectorsConfig {
    /// Every selector with its config key.
    pub fn named(&self) -> [(&'static str, &str); 5] {
        [
            ("email_input", &self.email_input),
            ("password_input", &self.password_input),
            ("submit_button", &self.submit_button),
            ("content_list", &self.content_list),
            ("content_item", &self.content_item),
        ]
    }
}

fn default_email_input() -> String {
    r#"input[type="email"]"#.into()
}
fn default_password_input() -> String {
    r#"input[type="password"]"#.into()
}
fn default_submit_button() -> String {
    r#"button[type="submit"]"#.into()
}
fn default_content_list() -> String {
    ".content-list".into()
}
fn default_content_item() -> String {
    ".content-list a[href]".into()
}

/// `[markers]` section: keywords that classify a listing row, checked in
/// the fixed order video, text, quiz.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkersConfig {
    #[serde(default = "default_video_markers")]
    pub video: Vec<String>,
    #[serde(default = "default_text_markers")]
    pub text: Vec<String>,
    #[serde(default = "default_quiz_markers")]
    pub quiz: Vec<String>,
}

impl Default for MarkersConfig {
    fn default() -> Self {
        Self {
            video: default_video_markers(),
            text: default_text_markers(),
            quiz: default_quiz_markers(),
        }
    }
}

fn default_video_markers() -> Vec<String> {
    ["video", "play", "/lesson"].map(String::from).to_vec()
}
fn default_text_markers() -> Vec<String> {
    ["text", "article", "reading", "/page"].map(String::from).to_vec()
}
fn default_quiz_markers() -> Vec<String> {
    ["quiz", "exam", "assessment"].map(String::from).to_vec()
}

/// `[timeouts]` section, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_navigation_ms")]
    pub navigation_ms: u64,
    #[serde(default = "default_selector_wait_ms")]
    pub selector_wait_ms: u64,
    #[serde(default = "default_keystroke_delay_ms")]
    pub keystroke_delay_ms: u64,
    #[serde(default = "default_notification_delay_ms")]
    pub notification_delay_ms: u64,
    #[serde(default = "default_image_settle_ms")]
    pub image_settle_ms: u64,
    #[serde(default = "default_webhook_ms")]
    pub webhook_ms: u64,
    #[serde(default = "default_script_ms")]
    pub script_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            navigation_ms: default_navigation_ms(),
            selector_wait_ms: default_selector_wait_ms(),
            keystroke_delay_ms: default_keystroke_delay_ms(),
            notification_delay_ms: default_notification_delay_ms(),
            image_settle_ms: default_image_settle_ms(),
            webhook_ms: default_webhook_ms(),
            script_ms: default_script_ms(),
        }
    }
}

fn default_navigation_ms() -> u64 {
    30_000
}
fn default_selector_wait_ms() -> u64 {
    15_000
}
fn default_keystroke_delay_ms() -> u64 {
    50
}
fn default_notification_delay_ms() -> u64 {
    1_500
}
fn default_image_settle_ms() -> u64 {
    3_000
}
fn default_webhook_ms() -> u64 {
    10_000
}
fn default_script_ms() -> u64 {
    10_000
}

/// `[webdriver]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDriverConfig {
    /// WebDriver server endpoint (chromedriver, geckodriver, Selenium).
    #[serde(default = "default_webdriver_url")]
    pub url: String,
    #[serde(default = "default_browser")]
    pub browser: String,
    #[serde(default = "default_true")]
    pub headless: bool,
    /// Extra browser command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            url: default_webdriver_url(),
            browser: default_browser(),
            headless: true,
            args: Vec::new(),
        }
    }
}

fn default_webdriver_url() -> String {
    "http://localhost:9515".into()
}
fn default_browser() -> String {
    "chrome".into()
}
fn default_true() -> bool {
    true
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path; defaults to `~/.coursewatch/coursewatch.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl StorageConfig {
    /// The configured database path with `~/` expanded, or the default
    /// location in the config directory.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match non_empty(&self.db_path) {
            Some(p) => Ok(expand_home(p)),
            None => Ok(config_dir()?.join(DB_FILE_NAME)),
        }
    }
}

/// `[notifications]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Sender name shown on each alert.
    #[serde(default = "default_username")]
    pub username: String,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
        }
    }
}

fn default_username() -> String {
    "CourseWatch".into()
}

// ---------------------------------------------------------------------------
// Resolved runtime config
// ---------------------------------------------------------------------------

/// Login credentials. The password never appears in `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Timeout table converted to [`Duration`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub navigation: Duration,
    pub selector_wait: Duration,
    pub keystroke_delay: Duration,
    pub notification_delay: Duration,
    pub image_settle: Duration,
    pub webhook: Duration,
    pub script: Duration,
}

impl From<&TimeoutsConfig> for Timeouts {
    fn from(t: &TimeoutsConfig) -> Self {
        Self {
            navigation: Duration::from_millis(t.navigation_ms),
            selector_wait: Duration::from_millis(t.selector_wait_ms),
            keystroke_delay: Duration::from_millis(t.keystroke_delay_ms),
            notification_delay: Duration::from_millis(t.notification_delay_ms),
            image_settle: Duration::from_millis(t.image_settle_ms),
            webhook: Duration::from_millis(t.webhook_ms),
            script: Duration::from_millis(t.script_ms),
        }
    }
}

/// Validated, immutable configuration for one running monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub webhook_url: Url,
    pub login_url: Url,
    pub content_url: Url,
    pub base_url: Url,
    pub default_thumbnail_url: String,
    pub schedule: cron::Schedule,
    pub run_on_start: bool,
    pub credentials: Credentials,
    pub selectors: SelectorsConfig,
    pub markers: MarkersConfig,
    pub timeouts: Timeouts,
    pub webdriver: WebDriverConfig,
    pub db_path: PathBuf,
    pub notification_username: String,
}

impl MonitorConfig {
    /// Validate `config`, reading the password from the process environment.
    pub fn resolve(config: &AppConfig) -> Result<Self> {
        Self::resolve_with_env(config, |name| std::env::var(name).ok())
    }

    /// Validate `config` with an explicit env lookup.
    ///
    /// Every missing or invalid setting is collected so a single error names
    /// all of them.
    pub fn resolve_with_env(
        config: &AppConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut problems: Vec<String> = Vec::new();
        let ep = &config.endpoints;

        let webhook_url = required_url(&ep.webhook_url, "endpoints.webhook_url", &mut problems);
        let login_url = required_url(&ep.login_url, "endpoints.login_url", &mut problems);
        let content_url = required_url(&ep.content_url, "endpoints.content_url", &mut problems);
        let base_url = required_url(&ep.base_url, "endpoints.base_url", &mut problems);
        let default_thumbnail_url = required_url(
            &ep.default_thumbnail_url,
            "endpoints.default_thumbnail_url",
            &mut problems,
        )
        .map(String::from);

        let schedule = match non_empty(&config.schedule.cron) {
            None => {
                problems.push("schedule.cron (missing)".into());
                None
            }
            Some(expr) => match cron::Schedule::from_str(expr) {
                Ok(schedule) => Some(schedule),
                Err(e) => {
                    problems.push(format!("schedule.cron (invalid: {e})"));
                    None
                }
            },
        };

        let email = non_empty(&config.credentials.email).map(String::from);
        if email.is_none() {
            problems.push("credentials.email (missing)".into());
        }
        let password_env = &config.credentials.password_env;
        let password = env(password_env).filter(|v| !v.is_empty());
        if password.is_none() {
            problems.push(format!("{password_env} (environment variable not set)"));
        }

        let t = &config.timeouts;
        if t.navigation_ms == 0 {
            problems.push("timeouts.navigation_ms (must be greater than 0)".into());
        }
        if t.selector_wait_ms == 0 {
            problems.push("timeouts.selector_wait_ms (must be greater than 0)".into());
        }
        if t.webhook_ms == 0 {
            problems.push("timeouts.webhook_ms (must be greater than 0)".into());
        }

        for (name, raw) in config.selectors.named() {
            if let Err(e) = scraper::Selector::parse(raw) {
                problems.push(format!("selectors.{name} (invalid selector `{raw}`: {e})"));
            }
        }

        let db_path = match config.storage.resolved_path() {
            Ok(path) => Some(path),
            Err(_) => {
                problems.push("storage.db_path (no home directory to default to)".into());
                None
            }
        };

        match (
            webhook_url,
            login_url,
            content_url,
            base_url,
            default_thumbnail_url,
            schedule,
            email,
            password,
            db_path,
        ) {
            (
                Some(webhook_url),
                Some(login_url),
                Some(content_url),
                Some(base_url),
                Some(default_thumbnail_url),
                Some(schedule),
                Some(email),
                Some(password),
                Some(db_path),
            ) if problems.is_empty() => Ok(Self {
                webhook_url,
                login_url,
                content_url,
                base_url,
                default_thumbnail_url,
                schedule,
                run_on_start: config.schedule.run_on_start,
                credentials: Credentials { email, password },
                selectors: config.selectors.clone(),
                markers: config.markers.clone(),
                timeouts: Timeouts::from(&config.timeouts),
                webdriver: config.webdriver.clone(),
                db_path,
                notification_username: config.notifications.username.clone(),
            }),
            _ => Err(CourseWatchError::config(format!(
                "invalid configuration:\n  - {}",
                problems.join("\n  - ")
            ))),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn required_url(value: &Option<String>, name: &str, problems: &mut Vec<String>) -> Option<Url> {
    match non_empty(value) {
        None => {
            problems.push(format!("{name} (missing)"));
            None
        }
        Some(raw) => match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(e) => {
                problems.push(format!("{name} (invalid URL: {e})"));
                None
            }
        },
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.coursewatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CourseWatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.coursewatch/coursewatch.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CourseWatchError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        CourseWatchError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write the starter config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    init_config_at(&config_file_path()?)
}

/// Write the starter config file at `path`, creating parent directories.
/// An existing file is left untouched and reported as an error.
pub fn init_config_at(path: &Path) -> Result<PathBuf> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| CourseWatchError::io(dir, e))?;
    }

    if path.exists() {
        return Err(CourseWatchError::config(format!(
            "{} already exists",
            path.display()
        )));
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE).map_err(|e| CourseWatchError::io(path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path.to_path_buf())
}
