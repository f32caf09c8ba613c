//! Session lifecycle: restore persisted cookies, probe, log in when needed.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use coursewatch_browser::{AutomationDriver, WaitPolicy};
use coursewatch_shared::{Cookie, CourseWatchError, MonitorConfig, Result, SessionState};
use coursewatch_storage::Storage;

const LOCATION_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Make sure `driver` holds an authenticated session.
///
/// Persisted cookies are tried first. If they are missing or the content
/// page bounces to the login page, the login form is submitted with the
/// configured credentials. The resulting cookie set is persisted either way.
#[instrument(skip_all)]
pub async fn ensure_session(
    driver: &dyn AutomationDriver,
    storage: &Storage,
    config: &MonitorConfig,
) -> Result<SessionState> {
    let saved = match storage.load_cookies().await {
        Ok(saved) => saved,
        Err(e) => {
            warn!(error = %e, "could not read saved session, logging in fresh");
            None
        }
    };

    if let Some(cookies) = saved.filter(|c| !c.is_empty()) {
        match probe_saved_session(driver, config, &cookies).await {
            Ok(true) => {
                info!(cookies = cookies.len(), "saved session still valid");
                return persist(driver, storage).await;
            }
            Ok(false) => info!("saved session expired, logging in"),
            Err(e) => warn!(error = %e, "saved session probe failed, logging in"),
        }
    } else {
        debug!("no saved session");
    }

    login(driver, config).await?;
    info!("logged in");
    persist(driver, storage).await
}

/// Apply `cookies` and load the content page. `true` when it did not
/// redirect to the login page.
async fn probe_saved_session(
    driver: &dyn AutomationDriver,
    config: &MonitorConfig,
    cookies: &[Cookie],
) -> Result<bool> {
    driver.set_cookies(cookies).await?;
    driver
        .navigate(
            config.content_url.as_str(),
            WaitPolicy::DomContentLoaded,
            config.timeouts.navigation,
        )
        .await?;
    let location = driver.current_location().await?;
    Ok(!is_login_location(&location, &config.login_url))
}

async fn login(driver: &dyn AutomationDriver, config: &MonitorConfig) -> Result<()> {
    let selectors = &config.selectors;
    let timeouts = &config.timeouts;

    driver
        .navigate(config.login_url.as_str(), WaitPolicy::Load, timeouts.navigation)
        .await?;
    driver
        .wait_for_selector(&selectors.email_input, timeouts.selector_wait)
        .await
        .map_err(|e| {
            if e.is_timeout() {
                CourseWatchError::authentication(format!(
                    "login form `{}` did not appear",
                    selectors.email_input
                ))
            } else {
                e
            }
        })?;

    driver
        .type_text(&selectors.email_input, &config.credentials.email, timeouts.keystroke_delay)
        .await?;
    driver
        .type_text(
            &selectors.password_input,
            &config.credentials.password,
            timeouts.keystroke_delay,
        )
        .await?;
    driver.click(&selectors.submit_button).await?;

    let location = wait_to_leave_login(driver, &config.login_url, timeouts.navigation).await?;
    if is_login_location(&location, &config.login_url) {
        return Err(CourseWatchError::authentication(
            "still on the login page after submitting credentials \
             (rejected credentials or an interactive challenge)",
        ));
    }
    debug!(%location, "left login page");
    Ok(())
}

/// Poll the location until it leaves the login page or `timeout` passes.
/// Returns the last observed location.
async fn wait_to_leave_login(
    driver: &dyn AutomationDriver,
    login_url: &Url,
    timeout: Duration,
) -> Result<String> {
    let deadline = Instant::now() + timeout;
    loop {
        let location = driver.current_location().await?;
        if !is_login_location(&location, login_url) || Instant::now() >= deadline {
            return Ok(location);
        }
        tokio::time::sleep(LOCATION_POLL_INTERVAL.min(timeout)).await;
    }
}

async fn persist(driver: &dyn AutomationDriver, storage: &Storage) -> Result<SessionState> {
    let cookies = driver.cookies().await?;
    if let Err(e) = storage.save_cookies(&cookies).await {
        // The session is usable for this cycle even if it can't be saved.
        warn!(error = %e, "could not persist session cookies");
    }
    Ok(SessionState {
        cookies,
        authenticated: true,
    })
}

/// Whether `location` is the login page: same scheme and host, and the login
/// path or a path below it, compared by whole segments. Query and fragment
/// are ignored.
pub fn is_login_location(location: &str, login_url: &Url) -> bool {
    let Ok(location) = Url::parse(location) else {
        return false;
    };
    location.scheme() == login_url.scheme()
        && location.host_str() == login_url.host_str()
        && location.port_or_known_default() == login_url.port_or_known_default()
        && under_path(location.path(), login_url.path())
}

fn under_path(path: &str, root: &str) -> bool {
    let path = path.trim_end_matches('/');
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        return path.is_empty();
    }
    path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}
