//! Flarewrap CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use flarewrap::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments; the log file lives in the working directory
    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    // Initialize tracing
    let level = if cli.debug { "flarewrap=debug" } else { "flarewrap=info" };
    let (file_writer, _guard) = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix("flarewrap.log")
        .build(config.working_dir.join("logs"))
        .ok()
        .map(tracing_appender::non_blocking)
        .unzip();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(file_writer.map(|writer| fmt::layer().with_ansi(false).with_writer(writer)))
        .with(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    // Execute
    cli.execute(config).await
}
