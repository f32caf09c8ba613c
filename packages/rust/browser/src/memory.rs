//! Scripted in-memory browser for tests and dry runs.
//!
//! [`InMemoryDriver`] serves fixture pages by URL, redirects to the login page
//! when a page needs a session cookie the browser doesn't hold, and grants a
//! cookie when the configured login form is submitted with the expected
//! values. Selector waits resolve immediately against the fixture HTML.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::Value;
use tokio::sync::Mutex;

use coursewatch_shared::{Cookie, CourseWatchError, Result};

use crate::driver::{AutomationDriver, DriverFactory, FrameId, WaitPolicy};

/// One page the in-memory browser can render.
#[derive(Debug, Clone, Default)]
pub struct PageFixture {
    pub html: String,
    /// Script results per frame in `list_frames` order; index 0 is the main frame.
    pub frame_values: Vec<Value>,
    /// Cookie that must be present, otherwise navigation lands on the login page.
    pub requires_cookie: Option<String>,
}

impl PageFixture {
    pub fn new(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            ..Self::default()
        }
    }

    pub fn with_frames(mut self, values: Vec<Value>) -> Self {
        self.frame_values = values;
        self
    }

    pub fn requiring_cookie(mut self, name: impl Into<String>) -> Self {
        self.requires_cookie = Some(name.into());
        self
    }
}

/// What submitting the login form does.
#[derive(Debug, Clone)]
pub struct LoginRule {
    pub submit_selector: String,
    /// `(selector, value)` pairs that must have been typed.
    pub expected: Vec<(String, String)>,
    /// Cookie granted on success.
    pub grants: Cookie,
    /// Location after a successful submit.
    pub redirect_to: String,
}

#[derive(Default)]
struct State {
    pages: HashMap<String, PageFixture>,
    location: String,
    cookies: Vec<Cookie>,
    typed: HashMap<String, String>,
    login: Option<LoginRule>,
    failing: HashSet<String>,
    navigations: Vec<String>,
    opens: usize,
    closed: bool,
}

/// Deterministic [`AutomationDriver`] backed by fixtures.
pub struct InMemoryDriver {
    login_url: String,
    state: Mutex<State>,
}

impl InMemoryDriver {
    pub fn new(login_url: impl Into<String>) -> Self {
        Self {
            login_url: login_url.into(),
            state: Mutex::new(State {
                location: "about:blank".into(),
                ..State::default()
            }),
        }
    }

    pub fn with_page(mut self, url: impl Into<String>, page: PageFixture) -> Self {
        self.state.get_mut().pages.insert(url.into(), page);
        self
    }

    pub fn with_login(mut self, rule: LoginRule) -> Self {
        self.state.get_mut().login = Some(rule);
        self
    }

    /// Make navigation to `url` fail with a driver error.
    pub fn with_failing_navigation(mut self, url: impl Into<String>) -> Self {
        self.state.get_mut().failing.insert(url.into());
        self
    }

    /// Replace or add a page while the driver is shared.
    pub async fn set_page(&self, url: impl Into<String>, page: PageFixture) {
        self.state.lock().await.pages.insert(url.into(), page);
    }

    /// Every URL passed to `navigate`, in order.
    pub async fn navigations(&self) -> Vec<String> {
        self.state.lock().await.navigations.clone()
    }

    /// How many times a factory handed this driver out.
    pub async fn opens(&self) -> usize {
        self.state.lock().await.opens
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Reset to a fresh browser: no cookies, blank page, open.
    pub async fn reopen(&self) {
        let mut state = self.state.lock().await;
        state.location = "about:blank".into();
        state.cookies.clear();
        state.typed.clear();
        state.opens += 1;
        state.closed = false;
    }

    fn ensure_open(state: &State) -> Result<()> {
        if state.closed {
            return Err(CourseWatchError::Driver("session is closed".into()));
        }
        Ok(())
    }

    fn current_page(state: &State) -> Option<&PageFixture> {
        state.pages.get(&state.location)
    }
}

#[async_trait]
impl AutomationDriver for InMemoryDriver {
    async fn navigate(&self, url: &str, _wait: WaitPolicy, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::ensure_open(&state)?;
        state.navigations.push(url.to_string());

        if state.failing.contains(url) {
            return Err(CourseWatchError::Driver(format!("net::ERR_FAILED at {url}")));
        }

        let needs_login = state
            .pages
            .get(url)
            .and_then(|p| p.requires_cookie.as_deref())
            .is_some_and(|name| !state.cookies.iter().any(|c| c.name == name));

        state.location = if needs_login {
            self.login_url.clone()
        } else {
            url.to_string()
        };
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str, _per_key_delay: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::ensure_open(&state)?;
        state.typed.insert(selector.to_string(), text.to_string());
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::ensure_open(&state)?;

        let Some(rule) = state.login.clone() else {
            return Ok(());
        };
        if rule.submit_selector != selector {
            return Ok(());
        }

        let accepted = rule
            .expected
            .iter()
            .all(|(sel, value)| state.typed.get(sel) == Some(value));
        if accepted {
            state.cookies.retain(|c| c.name != rule.grants.name);
            state.cookies.push(rule.grants.clone());
            state.location = rule.redirect_to.clone();
        } else {
            state.location = self.login_url.clone();
        }
        Ok(())
    }

    async fn current_location(&self) -> Result<String> {
        let state = self.state.lock().await;
        Self::ensure_open(&state)?;
        Ok(state.location.clone())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>> {
        let state = self.state.lock().await;
        Self::ensure_open(&state)?;
        Ok(state.cookies.clone())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::ensure_open(&state)?;
        for cookie in cookies {
            state.cookies.retain(|c| c.name != cookie.name);
            state.cookies.push(cookie.clone());
        }
        Ok(())
    }

    async fn rendered_document(&self) -> Result<String> {
        let state = self.state.lock().await;
        Self::ensure_open(&state)?;
        Ok(Self::current_page(&state)
            .map(|p| p.html.clone())
            .unwrap_or_else(|| "<html><body></body></html>".into()))
    }

    async fn list_frames(&self) -> Result<Vec<FrameId>> {
        let state = self.state.lock().await;
        Self::ensure_open(&state)?;
        let embedded = Self::current_page(&state)
            .map(|p| p.frame_values.len().saturating_sub(1))
            .unwrap_or(0);

        let mut frames = vec![FrameId::main()];
        frames.extend((0..embedded as u32).map(|i| FrameId::main().child(i)));
        Ok(frames)
    }

    async fn evaluate_in_frame(&self, frame: &FrameId, _script: &str) -> Result<Value> {
        let state = self.state.lock().await;
        Self::ensure_open(&state)?;
        let index = frame.0.first().map(|i| *i as usize + 1).unwrap_or(0);
        Self::current_page(&state)
            .and_then(|p| p.frame_values.get(index).cloned())
            .ok_or_else(|| CourseWatchError::Driver(format!("no such frame: {frame}")))
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        let state = self.state.lock().await;
        Self::ensure_open(&state)?;
        let sel = Selector::parse(selector)
            .map_err(|e| CourseWatchError::Driver(format!("invalid selector `{selector}`: {e}")))?;

        let found = Self::current_page(&state)
            .map(|p| Html::parse_document(&p.html).select(&sel).next().is_some())
            .unwrap_or(false);
        if found {
            Ok(())
        } else {
            Err(CourseWatchError::timeout(format!("selector `{selector}`"), timeout))
        }
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}

/// Hands out the same in-memory browser each cycle, reset to a fresh state.
#[async_trait]
impl DriverFactory for Arc<InMemoryDriver> {
    async fn open(&self) -> Result<Arc<dyn AutomationDriver>> {
        self.reopen().await;
        let driver: Arc<dyn AutomationDriver> = self.clone();
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN: &str = "https://learn.example.com/login";
    const COURSE: &str = "https://learn.example.com/course/1";

    fn driver() -> Arc<InMemoryDriver> {
        Arc::new(
            InMemoryDriver::new(LOGIN)
                .with_page(
                    COURSE,
                    PageFixture::new(r#"<ul class="content-list"><li>x</li></ul>"#)
                        .requiring_cookie("sid"),
                )
                .with_login(LoginRule {
                    submit_selector: "button".into(),
                    expected: vec![("#email".into(), "a@b.c".into())],
                    grants: Cookie::new("sid", "1"),
                    redirect_to: COURSE.into(),
                }),
        )
    }

    #[tokio::test]
    async fn redirects_to_login_without_cookie() {
        let d = driver();
        d.navigate(COURSE, WaitPolicy::Load, Duration::from_secs(1)).await.unwrap();
        assert_eq!(d.current_location().await.unwrap(), LOGIN);
    }

    #[tokio::test]
    async fn login_grants_cookie() {
        let d = driver();
        d.type_text("#email", "a@b.c", Duration::ZERO).await.unwrap();
        d.click("button").await.unwrap();
        assert_eq!(d.current_location().await.unwrap(), COURSE);
        assert_eq!(d.cookies().await.unwrap()[0].name, "sid");

        d.wait_for_selector(".content-list", Duration::from_secs(1)).await.unwrap();
        assert!(d.wait_for_selector(".missing", Duration::from_secs(1)).await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn factory_reopens_fresh_browser() {
        let d = driver();
        let ctx = d.open().await.unwrap();
        ctx.set_cookies(&[Cookie::new("sid", "1")]).await.unwrap();
        ctx.close().await.unwrap();
        assert!(ctx.current_location().await.is_err());

        let ctx = d.open().await.unwrap();
        assert!(ctx.cookies().await.unwrap().is_empty());
        assert_eq!(d.opens().await, 2);
    }
}
