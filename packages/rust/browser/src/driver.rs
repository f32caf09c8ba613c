//! The automation capability set the monitor needs from a browser.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coursewatch_shared::{Cookie, Result};

/// How long `navigate` waits after the URL change before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// `document.readyState` reached `interactive` or later.
    DomContentLoaded,
    /// `document.readyState` reached `complete`.
    #[default]
    Load,
}

impl WaitPolicy {
    /// Whether a reported `document.readyState` satisfies this policy.
    pub fn is_satisfied_by(&self, ready_state: &str) -> bool {
        match self {
            Self::DomContentLoaded => matches!(ready_state, "interactive" | "complete"),
            Self::Load => ready_state == "complete",
        }
    }
}

/// Addresses one browsing context on the current page.
///
/// The path lists child-frame indices from the top-level document; the empty
/// path is the main frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FrameId(pub Vec<u32>);

impl FrameId {
    pub fn main() -> Self {
        Self(Vec::new())
    }

    pub fn is_main(&self) -> bool {
        self.0.is_empty()
    }

    /// The frame at `index` inside this one.
    pub fn child(&self, index: u32) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_main() {
            return f.write_str("main");
        }
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "frame[{}]", parts.join("/"))
    }
}

/// A single, non-shareable browser automation context.
///
/// Every blocking operation is bounded: either by an explicit timeout
/// argument or by the timeouts the implementation was created with.
/// Implementations return [`coursewatch_shared::CourseWatchError::Timeout`]
/// when a bound is hit.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Load `url` and wait until `wait` is satisfied.
    async fn navigate(&self, url: &str, wait: WaitPolicy, timeout: Duration) -> Result<()>;

    /// Type `text` into the first element matching `selector`, one key at a time.
    async fn type_text(&self, selector: &str, text: &str, per_key_delay: Duration) -> Result<()>;

    /// Click the first element matching `selector`.
    async fn click(&self, selector: &str) -> Result<()>;

    /// URL of the top-level document after any redirects.
    async fn current_location(&self) -> Result<String>;

    async fn cookies(&self) -> Result<Vec<Cookie>>;

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()>;

    /// Serialized DOM of the top-level document as currently rendered.
    async fn rendered_document(&self) -> Result<String>;

    /// Every frame on the page, main frame first, then embedded frames in
    /// document order.
    async fn list_frames(&self) -> Result<Vec<FrameId>>;

    /// Run `script` (a function body using `return`) inside `frame`.
    async fn evaluate_in_frame(&self, frame: &FrameId, script: &str) -> Result<serde_json::Value>;

    /// Wait until an element matches `selector`.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()>;

    /// Release the context. Further calls fail.
    async fn close(&self) -> Result<()>;
}

/// Creates a fresh automation context for each cycle.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn AutomationDriver>>;
}
