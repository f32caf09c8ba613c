//! W3C WebDriver client over HTTP.
//!
//! Talks to any WebDriver server (chromedriver, geckodriver, Selenium) with
//! plain JSON requests through `reqwest`. One [`WebDriverSession`] is one
//! browser session; [`WebDriverFactory`] starts a fresh one per cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use url::Url;

use coursewatch_shared::{Cookie, CourseWatchError, Result, Timeouts, WebDriverConfig};

use crate::driver::{AutomationDriver, DriverFactory, FrameId, WaitPolicy};

/// Key under which WebDriver returns element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Interval between readiness and selector polls.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Extra HTTP allowance on top of the browser-side timeout of a command.
const HTTP_SLACK: Duration = Duration::from_secs(5);

/// Upper bound on frames visited per page.
const MAX_FRAMES: usize = 32;

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Starts WebDriver sessions against one server.
pub struct WebDriverFactory {
    client: Client,
    config: WebDriverConfig,
    timeouts: Timeouts,
}

impl WebDriverFactory {
    pub fn new(config: &WebDriverConfig, timeouts: Timeouts) -> Result<Self> {
        Url::parse(&config.url).map_err(|e| {
            CourseWatchError::config(format!("invalid webdriver.url '{}': {e}", config.url))
        })?;

        let client = Client::builder()
            .build()
            .map_err(|e| CourseWatchError::Driver(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config: config.clone(),
            timeouts,
        })
    }
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    async fn open(&self) -> Result<Arc<dyn AutomationDriver>> {
        let session =
            WebDriverSession::start(self.client.clone(), &self.config, self.timeouts).await?;
        let driver: Arc<dyn AutomationDriver> = Arc::new(session);
        Ok(driver)
    }
}

/// Capabilities for a new session of `config.browser`.
fn capabilities(config: &WebDriverConfig) -> Value {
    let mut args = config.args.clone();
    match config.browser.as_str() {
        "firefox" => {
            if config.headless {
                args.push("-headless".into());
            }
            json!({
                "browserName": "firefox",
                "pageLoadStrategy": "normal",
                "moz:firefoxOptions": { "args": args },
            })
        }
        other => {
            if config.headless {
                args.push("--headless=new".into());
            }
            args.push("--disable-gpu".into());
            json!({
                "browserName": other,
                "pageLoadStrategy": "normal",
                "goog:chromeOptions": { "args": args },
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One live WebDriver browser session.
pub struct WebDriverSession {
    client: Client,
    base: String,
    session_id: String,
    timeouts: Timeouts,
    closed: AtomicBool,
}

impl WebDriverSession {
    /// Create a new browser session and apply the timeout table.
    #[instrument(skip_all, fields(server = %config.url, browser = %config.browser))]
    pub async fn start(client: Client, config: &WebDriverConfig, timeouts: Timeouts) -> Result<Self> {
        let base = config.url.trim_end_matches('/').to_string();
        let body = json!({ "capabilities": { "alwaysMatch": capabilities(config) } });

        let response = client
            .post(format!("{base}/session"))
            .timeout(timeouts.navigation + HTTP_SLACK)
            .json(&body)
            .send()
            .await
            .map_err(|e| CourseWatchError::Driver(format!("cannot reach WebDriver at {base}: {e}")))?;
        let value = read_value(response, "new session").await?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| CourseWatchError::Driver("new session response has no sessionId".into()))?
            .to_string();

        let session = Self {
            client,
            base,
            session_id,
            timeouts,
            closed: AtomicBool::new(false),
        };

        session
            .command(
                Method::POST,
                "/timeouts",
                Some(json!({
                    "pageLoad": timeouts.navigation.as_millis() as u64,
                    "script": timeouts.script.as_millis() as u64,
                    "implicit": 0,
                })),
                timeouts.script,
            )
            .await?;

        debug!(session_id = %session.session_id, "webdriver session started");
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send one command to this session and unwrap its `value`.
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CourseWatchError::Driver("session is closed".into()));
        }

        let url = format!("{}/session/{}{}", self.base, self.session_id, path);
        let mut request = self
            .client
            .request(method, &url)
            .timeout(timeout + HTTP_SLACK);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CourseWatchError::timeout(format!("WebDriver {path}"), timeout)
            } else {
                CourseWatchError::Driver(format!("{path}: {e}"))
            }
        })?;

        read_value(response, path).await.map_err(|e| match e {
            CourseWatchError::Timeout { .. } => CourseWatchError::timeout(format!("WebDriver {path}"), timeout),
            other => other,
        })
    }

    /// Run a synchronous script in the current browsing context.
    async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
            self.timeouts.script,
        )
        .await
    }

    async fn find_element(&self, selector: &str) -> Result<String> {
        let value = self
            .command(
                Method::POST,
                "/element",
                Some(json!({ "using": "css selector", "value": selector })),
                self.timeouts.script,
            )
            .await
            .map_err(|e| match e {
                CourseWatchError::Driver(msg) if msg.starts_with("no such element") => {
                    CourseWatchError::Driver(format!("no element matches `{selector}`"))
                }
                other => other,
            })?;

        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| CourseWatchError::Driver(format!("malformed element reference for `{selector}`")))
    }

    /// Make `frame` the current browsing context, starting from the top.
    async fn switch_to(&self, frame: &FrameId) -> Result<()> {
        self.command(Method::POST, "/frame", Some(json!({ "id": null })), self.timeouts.script)
            .await?;
        for index in &frame.0 {
            self.command(Method::POST, "/frame", Some(json!({ "id": index })), self.timeouts.script)
                .await?;
        }
        Ok(())
    }

    /// Number of frames directly inside `frame`; 0 when it can't be entered.
    async fn child_frame_count(&self, frame: &FrameId) -> u32 {
        if let Err(e) = self.switch_to(frame).await {
            debug!(%frame, error = %e, "frame not reachable");
            return 0;
        }
        self.execute("return window.frames.length;", Vec::new())
            .await
            .ok()
            .and_then(|v| v.as_u64())
            .map_or(0, |n| n.min(MAX_FRAMES as u64) as u32)
    }

    async fn ready_state(&self) -> Result<String> {
        let value = self.execute("return document.readyState;", Vec::new()).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn current_host(&self) -> Option<String> {
        let location = self.current_location().await.ok()?;
        Url::parse(&location).ok()?.host_str().map(String::from)
    }
}

/// Depth-first pre-order walk of the frame tree starting at the main
/// document, so nested frames come right after their parent. Stops after
/// [`MAX_FRAMES`] frames.
async fn walk_frames<F, Fut>(mut children: F) -> Vec<FrameId>
where
    F: FnMut(FrameId) -> Fut,
    Fut: Future<Output = u32>,
{
    let mut frames = Vec::new();
    let mut pending = vec![FrameId::main()];

    while let Some(frame) = pending.pop() {
        if frames.len() >= MAX_FRAMES {
            break;
        }
        let count = children(frame.clone()).await;
        pending.extend((0..count).rev().map(|index| frame.child(index)));
        frames.push(frame);
    }
    frames
}

/// Unwrap a WebDriver response body, mapping error payloads to typed errors.
async fn read_value(response: reqwest::Response, context: &str) -> Result<Value> {
    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .map_err(|e| CourseWatchError::Driver(format!("{context}: unreadable response: {e}")))?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }

    let error = value.get("error").and_then(Value::as_str).unwrap_or("unknown error");
    let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
    match error {
        "timeout" | "script timeout" => Err(CourseWatchError::timeout(context, Duration::ZERO)),
        _ => Err(CourseWatchError::Driver(format!("{error}: {message}"))),
    }
}

fn domain_matches(host: &str, cookie_domain: &str) -> bool {
    let domain = cookie_domain.trim_start_matches('.');
    host == domain || host.ends_with(&format!(".{domain}"))
}

#[async_trait]
impl AutomationDriver for WebDriverSession {
    #[instrument(skip(self, timeout), fields(session = %self.session_id))]
    async fn navigate(&self, url: &str, wait: WaitPolicy, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        self.command(Method::POST, "/url", Some(json!({ "url": url })), timeout)
            .await?;

        loop {
            let state = self.ready_state().await?;
            if wait.is_satisfied_by(&state) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CourseWatchError::timeout(format!("navigation to {url}"), timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn type_text(&self, selector: &str, text: &str, per_key_delay: Duration) -> Result<()> {
        let element = self.find_element(selector).await?;
        let path = format!("/element/{element}/value");
        for ch in text.chars() {
            self.command(
                Method::POST,
                &path,
                Some(json!({ "text": ch.to_string() })),
                self.timeouts.script,
            )
            .await?;
            if !per_key_delay.is_zero() {
                tokio::time::sleep(per_key_delay).await;
            }
        }
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let element = self.find_element(selector).await?;
        self.command(
            Method::POST,
            &format!("/element/{element}/click"),
            Some(json!({})),
            self.timeouts.navigation,
        )
        .await?;
        Ok(())
    }

    async fn current_location(&self) -> Result<String> {
        let value = self
            .command(Method::GET, "/url", None, self.timeouts.script)
            .await?;
        value
            .as_str()
            .map(String::from)
            .ok_or_else(|| CourseWatchError::Driver("current URL is not a string".into()))
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        let value = self
            .command(Method::GET, "/cookie", None, self.timeouts.script)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| CourseWatchError::Driver(format!("malformed cookie list: {e}")))
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        // WebDriver only accepts cookies for the domain of the current document.
        for cookie in cookies {
            if let Some(domain) = cookie.domain.as_deref() {
                let on_domain = self
                    .current_host()
                    .await
                    .is_some_and(|host| domain_matches(&host, domain));
                if !on_domain {
                    let origin = format!("https://{}/", domain.trim_start_matches('.'));
                    self.navigate(&origin, WaitPolicy::DomContentLoaded, self.timeouts.navigation)
                        .await?;
                }
            }

            let result = self
                .command(
                    Method::POST,
                    "/cookie",
                    Some(json!({ "cookie": cookie })),
                    self.timeouts.script,
                )
                .await;
            if let Err(e) = result {
                warn!(cookie = %cookie.name, error = %e, "cookie rejected by browser");
            }
        }
        Ok(())
    }

    async fn rendered_document(&self) -> Result<String> {
        let value = self
            .execute("return document.documentElement.outerHTML;", Vec::new())
            .await?;
        value
            .as_str()
            .map(String::from)
            .ok_or_else(|| CourseWatchError::Driver("document is not a string".into()))
    }

    async fn list_frames(&self) -> Result<Vec<FrameId>> {
        let frames = walk_frames(|frame| async move { self.child_frame_count(&frame).await }).await;
        self.switch_to(&FrameId::main()).await?;
        Ok(frames)
    }

    async fn evaluate_in_frame(&self, frame: &FrameId, script: &str) -> Result<Value> {
        self.switch_to(frame).await?;
        let result = self.execute(script, Vec::new()).await;
        if !frame.is_main() {
            let _ = self.switch_to(&FrameId::main()).await;
        }
        result
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let found = self
                .execute(
                    "return document.querySelector(arguments[0]) !== null;",
                    vec![Value::String(selector.to_string())],
                )
                .await?;
            if found.as_bool() == Some(true) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CourseWatchError::timeout(format!("selector `{selector}`"), timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let url = format!("{}/session/{}", self.base, self.session_id);
        self.client
            .delete(&url)
            .timeout(self.timeouts.script + HTTP_SLACK)
            .send()
            .await
            .map_err(|e| CourseWatchError::Driver(format!("failed to end session: {e}")))?;
        debug!(session_id = %self.session_id, "webdriver session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn timeouts() -> Timeouts {
        Timeouts::from(&coursewatch_shared::TimeoutsConfig::default())
    }

    fn config(url: &str) -> WebDriverConfig {
        WebDriverConfig {
            url: url.to_string(),
            ..WebDriverConfig::default()
        }
    }

    async fn started_session(server: &MockServer) -> WebDriverSession {
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "value": { "sessionId": "s1", "capabilities": {} } })),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/timeouts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .mount(server)
            .await;

        WebDriverSession::start(Client::new(), &config(&server.uri()), timeouts())
            .await
            .expect("start session")
    }

    #[test]
    fn chrome_capabilities_are_headless() {
        let caps = capabilities(&WebDriverConfig::default());
        assert_eq!(caps["browserName"], "chrome");
        let args = caps["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(args.iter().any(|a| a == "--headless=new"));
    }

    #[test]
    fn firefox_capabilities() {
        let caps = capabilities(&WebDriverConfig {
            browser: "firefox".into(),
            ..WebDriverConfig::default()
        });
        assert_eq!(caps["moz:firefoxOptions"]["args"][0], "-headless");
    }

    #[tokio::test]
    async fn frames_are_listed_in_document_order() {
        // main > [f0 > [f0/0], f1]
        let tree = std::collections::HashMap::from([
            (FrameId::main(), 2),
            (FrameId::main().child(0), 1),
        ]);
        let frames = walk_frames(|frame| {
            let count = tree.get(&frame).copied().unwrap_or(0);
            async move { count }
        })
        .await;

        let names: Vec<String> = frames.iter().map(ToString::to_string).collect();
        assert_eq!(names, ["main", "frame[0]", "frame[0/0]", "frame[1]"]);
    }

    #[tokio::test]
    async fn frame_walk_is_capped() {
        let frames = walk_frames(|_| async { 3 }).await;
        assert_eq!(frames.len(), MAX_FRAMES);
    }

    #[test]
    fn cookie_domain_matching() {
        assert!(domain_matches("learn.example.com", ".example.com"));
        assert!(domain_matches("example.com", "example.com"));
        assert!(!domain_matches("example.org", "example.com"));
        assert!(!domain_matches("badexample.com", "example.com"));
    }

    #[tokio::test]
    async fn starts_session_and_reads_location() {
        let server = MockServer::start().await;
        let session = started_session(&server).await;
        assert_eq!(session.session_id(), "s1");

        Mock::given(method("GET"))
            .and(path("/session/s1/url"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "value": "https://learn.example.com/login" })),
            )
            .mount(&server)
            .await;

        let location = session.current_location().await.unwrap();
        assert_eq!(location, "https://learn.example.com/login");
    }

    #[tokio::test]
    async fn parses_cookie_list() {
        let server = MockServer::start().await;
        let session = started_session(&server).await;

        Mock::given(method("GET"))
            .and(path("/session/s1/cookie"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    { "name": "sid", "value": "abc", "domain": ".example.com", "path": "/",
                      "secure": true, "httpOnly": true, "sameSite": "Lax" }
                ]
            })))
            .mount(&server)
            .await;

        let cookies = session.cookies().await.unwrap();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].http_only, Some(true));
        assert_eq!(cookies[0].same_site.as_deref(), Some("Lax"));
    }

    #[tokio::test]
    async fn missing_element_is_a_driver_error() {
        let server = MockServer::start().await;
        let session = started_session(&server).await;

        Mock::given(method("POST"))
            .and(path("/session/s1/element"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "value": { "error": "no such element", "message": "Unable to locate element" }
            })))
            .mount(&server)
            .await;

        let err = session.click("#submit").await.unwrap_err();
        assert!(err.to_string().contains("no element matches `#submit`"));
    }

    #[tokio::test]
    async fn selector_wait_times_out() {
        let server = MockServer::start().await;
        let session = started_session(&server).await;

        Mock::given(method("POST"))
            .and(path("/session/s1/execute/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": false })))
            .mount(&server)
            .await;

        let err = session
            .wait_for_selector(".content-list", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn evaluates_inside_nested_frame() {
        let server = MockServer::start().await;
        let session = started_session(&server).await;

        Mock::given(method("POST"))
            .and(path("/session/s1/frame"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/execute/sync"))
            .and(body_partial_json(json!({ "script": "return 1;" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": 1 })))
            .mount(&server)
            .await;

        // top, frame 0, then back to top
        let value = session
            .evaluate_in_frame(&FrameId::main().child(0), "return 1;")
            .await
            .unwrap();
        assert_eq!(value, json!(1));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let server = MockServer::start().await;
        let session = started_session(&server).await;

        Mock::given(method("DELETE"))
            .and(path("/session/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(session.current_location().await.is_err());
    }
}
