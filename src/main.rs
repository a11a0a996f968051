use anyhow::Result;
use clap::Parser;

use galaxy_bridge::cli::Cli;
use galaxy_bridge::error::{categorize_error, format_cli_error};
use galaxy_bridge::runner::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive_config = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive_config));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}
