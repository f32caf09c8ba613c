//! Browser automation for CourseWatch.
//!
//! This crate provides:
//! - [`AutomationDriver`] / [`DriverFactory`]: the capability set the monitor uses
//! - [`webdriver`]: a W3C WebDriver client (chromedriver, geckodriver)
//! - [`memory`]: a scripted in-memory browser for tests

pub mod driver;
pub mod memory;
pub mod webdriver;

pub use driver::{AutomationDriver, DriverFactory, FrameId, WaitPolicy};
pub use memory::{InMemoryDriver, LoginRule, PageFixture};
pub use webdriver::{WebDriverFactory, WebDriverSession};
