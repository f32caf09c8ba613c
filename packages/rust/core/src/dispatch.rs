//! Alert delivery.
//!
//! Each [`ChangeEvent`] becomes one Discord-compatible webhook message. Video
//! items get their thumbnail looked up on the item page first. Sends are
//! strictly sequential with a minimum gap between them, and the first failure
//! stops the batch.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;

use coursewatch_browser::AutomationDriver;
use coursewatch_extractor::extract_thumbnail;
use coursewatch_shared::{ChangeEvent, ChangeKind, ContentKind, CourseWatchError, MonitorConfig, Result};

pub const NEW_COLOR: u32 = 0x2ECC71;
pub const UPGRADED_COLOR: u32 = 0x3498DB;

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Webhook message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub username: String,
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub url: String,
    pub color: u32,
    pub image: EmbedImage,
    pub fields: Vec<EmbedField>,
    pub footer: EmbedFooter,
    /// RFC 3339, UTC.
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedImage {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedFooter {
    pub text: String,
}

/// Build the message for one event.
pub fn build_payload(
    event: &ChangeEvent,
    image_url: &str,
    username: &str,
    sent_at: DateTime<Utc>,
) -> WebhookPayload {
    let item = &event.item;
    let (title, description, color) = match event.kind {
        ChangeKind::New => (
            "New content available",
            format!("**{}** was just added to the course.", item.title),
            NEW_COLOR,
        ),
        ChangeKind::Upgraded => (
            "Video now available",
            format!("**{}** was upgraded from text to video.", item.title),
            UPGRADED_COLOR,
        ),
    };

    WebhookPayload {
        username: username.to_string(),
        embeds: vec![Embed {
            title: title.to_string(),
            description,
            url: item.url.clone(),
            color,
            image: EmbedImage {
                url: image_url.to_string(),
            },
            fields: vec![
                EmbedField {
                    name: "Type".into(),
                    value: item.content_kind.to_string(),
                    inline: true,
                },
                EmbedField {
                    name: "ID".into(),
                    value: item.id.clone(),
                    inline: true,
                },
            ],
            footer: EmbedFooter {
                text: username.to_string(),
            },
            timestamp: sent_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }],
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Where alerts go.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver one message. A non-2xx answer is a notification error.
    async fn send(&self, payload: &WebhookPayload) -> Result<()>;
}

/// Posts alerts to an HTTP webhook.
pub struct WebhookSink {
    client: Client,
    url: Url,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CourseWatchError::notification(None, format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url, timeout })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, payload: &WebhookPayload) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CourseWatchError::timeout("webhook delivery", self.timeout)
                } else {
                    CourseWatchError::notification(None, e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Err(CourseWatchError::notification(
            Some(status.as_u16()),
            if snippet.is_empty() {
                status.canonical_reason().unwrap_or("request rejected").to_string()
            } else {
                snippet
            },
        ))
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// What a fully successful batch delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub new: usize,
    pub upgraded: usize,
    /// Video alerts that fell back to the default image.
    pub default_images: usize,
}

/// Send one alert per event, in order.
///
/// Stops at the first failed send and returns its error; later events are
/// not attempted.
#[instrument(skip_all, fields(events = events.len()))]
pub async fn dispatch_all(
    events: &[ChangeEvent],
    driver: &dyn AutomationDriver,
    sink: &dyn NotificationSink,
    config: &MonitorConfig,
) -> Result<DispatchReport> {
    let mut report = DispatchReport::default();

    for (index, event) in events.iter().enumerate() {
        if index > 0 && !config.timeouts.notification_delay.is_zero() {
            tokio::time::sleep(config.timeouts.notification_delay).await;
        }

        let item = &event.item;
        let image_url = if item.content_kind == ContentKind::Video {
            let thumbnail = extract_thumbnail(
                driver,
                &item.url,
                config.timeouts.navigation,
                config.timeouts.image_settle,
            )
            .await;
            if !thumbnail.is_found() {
                report.default_images += 1;
            }
            thumbnail.or_default(&config.default_thumbnail_url)
        } else {
            config.default_thumbnail_url.clone()
        };

        let payload = build_payload(event, &image_url, &config.notification_username, Utc::now());
        sink.send(&payload).await?;

        info!(item_id = %item.id, kind = event.kind.as_str(), "alert sent");
        report.sent += 1;
        match event.kind {
            ChangeKind::New => report.new += 1,
            ChangeKind::Upgraded => report.upgraded += 1,
        }
    }

    debug!(?report, "dispatch finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingSink, fixture_driver, monitor_config, video_page};
    use chrono::TimeZone;
    use coursewatch_shared::ContentItem;
    use std::time::Instant;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(kind: ChangeKind, id: &str, content_kind: ContentKind) -> ChangeEvent {
        ChangeEvent {
            kind,
            item: ContentItem {
                id: id.into(),
                title: format!("Lesson {id}"),
                content_kind,
                url: format!("https://learn.example.com/lesson/{id}"),
                thumbnail_url: None,
            },
        }
    }

    #[test]
    fn new_payload_shape() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let payload = build_payload(
            &event(ChangeKind::New, "7", ContentKind::Quiz),
            "https://cdn/default.png",
            "CourseWatch",
            at,
        );
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["username"], "CourseWatch");
        let embed = &json["embeds"][0];
        assert_eq!(embed["title"], "New content available");
        assert_eq!(embed["description"], "**Lesson 7** was just added to the course.");
        assert_eq!(embed["color"], NEW_COLOR);
        assert_eq!(embed["image"]["url"], "https://cdn/default.png");
        assert_eq!(embed["fields"][0]["value"], "Quiz");
        assert_eq!(embed["fields"][1]["value"], "7");
        assert_eq!(embed["footer"]["text"], "CourseWatch");
        assert_eq!(embed["timestamp"], "2026-03-01T12:00:00Z");
    }

    #[test]
    fn upgraded_payload_uses_upgrade_wording() {
        let payload = build_payload(
            &event(ChangeKind::Upgraded, "8", ContentKind::Video),
            "https://cdn/t.jpg",
            "bot",
            Utc::now(),
        );
        let embed = &payload.embeds[0];
        assert_eq!(embed.title, "Video now available");
        assert_eq!(embed.description, "**Lesson 8** was upgraded from text to video.");
        assert_eq!(embed.color, UPGRADED_COLOR);
    }

    #[tokio::test]
    async fn video_alerts_use_found_thumbnail_else_default() {
        let config = monitor_config();
        let driver = fixture_driver(&config, "<ul class=\"content-list\"></ul>");
        driver
            .set_page("https://learn.example.com/lesson/1", video_page("https://cdn/one.jpg"))
            .await;

        let sink = RecordingSink::default();
        let events = vec![
            event(ChangeKind::New, "1", ContentKind::Video),
            event(ChangeKind::New, "2", ContentKind::Video),
            event(ChangeKind::New, "3", ContentKind::Text),
        ];
        let report = dispatch_all(&events, driver.as_ref(), &sink, &config).await.unwrap();

        assert_eq!(report.sent, 3);
        assert_eq!(report.default_images, 1);
        let images: Vec<_> = sink.sent().iter().map(|p| p.embeds[0].image.url.clone()).collect();
        assert_eq!(
            images,
            ["https://cdn/one.jpg", config.default_thumbnail_url.as_str(), config.default_thumbnail_url.as_str()]
        );
        // non-video items never visit their page
        let visited = driver.navigations().await;
        assert!(!visited.contains(&"https://learn.example.com/lesson/3".to_string()));
    }

    #[tokio::test]
    async fn first_failure_stops_the_batch() {
        let config = monitor_config();
        let driver = fixture_driver(&config, "<ul class=\"content-list\"></ul>");
        let sink = RecordingSink::failing_on(2);
        let events = vec![
            event(ChangeKind::New, "1", ContentKind::Quiz),
            event(ChangeKind::New, "2", ContentKind::Quiz),
            event(ChangeKind::New, "3", ContentKind::Quiz),
        ];

        let err = dispatch_all(&events, driver.as_ref(), &sink, &config).await.unwrap_err();
        assert_eq!(err.category(), "notification");
        assert_eq!(sink.attempts(), 2);
        assert_eq!(sink.sent().len(), 1);
    }

    #[tokio::test]
    async fn enforces_gap_between_sends() {
        let mut config = monitor_config();
        config.timeouts.notification_delay = Duration::from_millis(60);
        let driver = fixture_driver(&config, "<ul class=\"content-list\"></ul>");
        let sink = RecordingSink::default();
        let events = vec![
            event(ChangeKind::New, "1", ContentKind::Quiz),
            event(ChangeKind::New, "2", ContentKind::Quiz),
            event(ChangeKind::New, "3", ContentKind::Quiz),
        ];

        let started = Instant::now();
        dispatch_all(&events, driver.as_ref(), &sink, &config).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn webhook_sink_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({ "username": "bot" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/hook", server.uri())).unwrap();
        let sink = WebhookSink::new(url, Duration::from_secs(5)).unwrap();
        let payload = build_payload(
            &event(ChangeKind::New, "1", ContentKind::Text),
            "https://cdn/d.png",
            "bot",
            Utc::now(),
        );
        sink.send(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_sink_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let sink = WebhookSink::new(Url::parse(&server.uri()).unwrap(), Duration::from_secs(5)).unwrap();
        let payload = build_payload(
            &event(ChangeKind::New, "1", ContentKind::Text),
            "https://cdn/d.png",
            "bot",
            Utc::now(),
        );
        let err = sink.send(&payload).await.unwrap_err();
        match err {
            CourseWatchError::Notification { status, message } => {
                assert_eq!(status, Some(429));
                assert_eq!(message, "rate limited");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
