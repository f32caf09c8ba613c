//! CourseWatch CLI: course content change monitor.
//!
//! Polls a course's content listing through a WebDriver-controlled browser
//! and posts a webhook alert for every new item or text-to-video upgrade.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
