//! Fixtures shared by the core crate's tests.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use coursewatch_browser::{InMemoryDriver, LoginRule, PageFixture};
use coursewatch_shared::{AppConfig, Cookie, CourseWatchError, MonitorConfig, Result, SelectorsConfig};
use coursewatch_storage::Storage;

use crate::dispatch::{NotificationSink, WebhookPayload};

pub const LOGIN_URL: &str = "https://learn.example.com/login";
pub const CONTENT_URL: &str = "https://learn.example.com/course/1";
pub const EMAIL: &str = "student@example.com";
pub const PASSWORD: &str = "hunter2";

const LOGIN_FORM: &str = r#"<form>
  <input type="email" name="email">
  <input type="password" name="password">
  <button type="submit">Sign in</button>
</form>"#;

/// Resolved config with short timeouts and no delays.
pub fn monitor_config() -> MonitorConfig {
    let mut app = AppConfig::default();
    app.endpoints.webhook_url = Some("https://hooks.example.com/api/webhooks/1/abc".into());
    app.endpoints.login_url = Some(LOGIN_URL.into());
    app.endpoints.content_url = Some(CONTENT_URL.into());
    app.endpoints.base_url = Some("https://learn.example.com/".into());
    app.endpoints.default_thumbnail_url = Some("https://cdn.example.com/default.png".into());
    app.schedule.cron = Some("0 */30 * * * *".into());
    app.credentials.email = Some(EMAIL.into());
    app.storage.db_path = Some(temp_db_path().to_string_lossy().into_owned());
    app.timeouts.navigation_ms = 300;
    app.timeouts.selector_wait_ms = 200;
    app.timeouts.keystroke_delay_ms = 0;
    app.timeouts.notification_delay_ms = 0;
    app.timeouts.image_settle_ms = 0;
    app.timeouts.webhook_ms = 1_000;
    MonitorConfig::resolve_with_env(&app, |_| Some(PASSWORD.into())).expect("valid test config")
}

pub fn temp_db_path() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("cw_core_test_{}.db", Uuid::now_v7()))
}

pub async fn temp_storage() -> Storage {
    Storage::open(&temp_db_path()).await.expect("open test db")
}

/// Listing markup with one anchor per `(href, title)`.
pub fn listing_html(rows: &[(&str, &str)]) -> String {
    let anchors: String = rows
        .iter()
        .map(|(href, title)| format!(r#"<a href="{href}" class="item">{title}</a>"#))
        .collect();
    format!(r#"<html><body><div class="content-list">{anchors}</div></body></html>"#)
}

/// A site with a login form guarding the content page.
pub fn fixture_driver(config: &MonitorConfig, listing: &str) -> Arc<InMemoryDriver> {
    let selectors = SelectorsConfig::default();
    Arc::new(
        InMemoryDriver::new(LOGIN_URL)
            .with_page(LOGIN_URL, PageFixture::new(LOGIN_FORM))
            .with_page(
                config.content_url.as_str(),
                PageFixture::new(listing).requiring_cookie("sid"),
            )
            .with_login(LoginRule {
                submit_selector: selectors.submit_button.clone(),
                expected: vec![
                    (selectors.email_input.clone(), EMAIL.into()),
                    (selectors.password_input.clone(), PASSWORD.into()),
                ],
                grants: Cookie::new("sid", "session-token").with_domain("learn.example.com"),
                redirect_to: config.content_url.to_string(),
            }),
    )
}

/// An item page whose embedded player advertises `thumbnail`.
pub fn video_page(thumbnail: &str) -> PageFixture {
    let ld = json!({ "@type": "VideoObject", "thumbnailUrl": thumbnail }).to_string();
    PageFixture::new("<html><body><iframe src=\"player\"></iframe></body></html>")
        .with_frames(vec![json!([]), json!([ld])])
}

/// Records every payload; optionally fails the n-th attempt (1-based).
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<WebhookPayload>>,
    attempts: AtomicUsize,
    fail_on: Mutex<Option<usize>>,
}

impl RecordingSink {
    pub fn failing_on(attempt: usize) -> Self {
        Self {
            fail_on: Mutex::new(Some(attempt)),
            ..Self::default()
        }
    }

    /// Stop failing.
    pub fn heal(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    pub fn sent(&self) -> Vec<WebhookPayload> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent_ids(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|p| p.embeds[0].fields[1].value.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, payload: &WebhookPayload) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_on.lock().unwrap() == Some(attempt) {
            return Err(CourseWatchError::notification(Some(500), "internal error"));
        }
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }
}
