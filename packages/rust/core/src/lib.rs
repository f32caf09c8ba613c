//! Monitoring pipeline for CourseWatch.
//!
//! This crate ties the browser session, listing extraction, change
//! detection, and alert delivery into one cycle ([`Monitor::run_cycle`]) and
//! drives it from a cron schedule.

pub mod detector;
pub mod dispatch;
pub mod monitor;
pub mod scheduler;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use detector::{derive_snapshot, diff};
pub use dispatch::{DispatchReport, NotificationSink, WebhookPayload, WebhookSink, dispatch_all};
pub use monitor::{CatalogLoad, CycleOutcome, CycleReport, Monitor, Stage};
pub use scheduler::run_scheduled;
pub use session::{ensure_session, is_login_location};
