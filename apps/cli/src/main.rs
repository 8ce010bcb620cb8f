//! coursepipe CLI: crawl a Canvas course into filtered, chunked Markdown.
//!
//! Exits 0 when the run completes (or suspends after a subset of steps),
//! 2 when it ends partial, and 1 on startup errors.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    let code = commands::run(cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
