use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    safaribooks::logging::init().context("init logging")?;

    let cli = safaribooks::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        safaribooks::cli::Command::Fetch(args) => {
            safaribooks::crawl::run(args).await.context("fetch")?;
        }
        safaribooks::cli::Command::Pack(args) => {
            safaribooks::package::run(args).context("pack")?;
        }
    }

    Ok(())
}
