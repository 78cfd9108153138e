use std::fmt;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Log in, download a book and package it as EPUB.
    Fetch(FetchArgs),
    /// Package an existing staging tree as EPUB.
    Pack(PackArgs),
}

#[derive(Args)]
pub struct FetchArgs {
    /// Account email.
    #[arg(long)]
    pub user: String,

    /// Account password.
    #[arg(long, env = "SAFARIBOOKS_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Numeric id of the book to download.
    #[arg(long)]
    pub book_id: String,

    /// Directory the `.epub` is written to.
    #[arg(long, default_value = ".")]
    pub out: String,

    /// Host to log in to and download from (must be http/https).
    #[arg(long)]
    pub host: Option<String>,

    /// Maximum concurrent HTTP requests.
    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,

    /// Delay before each request (politeness).
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Per-request timeout.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,

    /// Directory copied into the staging tree instead of the built-in skeleton.
    #[arg(long)]
    pub skeleton: Option<String>,

    /// Keep the staging directory after the run and log its path.
    #[arg(long)]
    pub keep_staging: bool,
}

impl fmt::Debug for FetchArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchArgs")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("book_id", &self.book_id)
            .field("out", &self.out)
            .field("host", &self.host)
            .field("concurrency", &self.concurrency)
            .field("delay_ms", &self.delay_ms)
            .field("timeout_secs", &self.timeout_secs)
            .field("skeleton", &self.skeleton)
            .field("keep_staging", &self.keep_staging)
            .finish()
    }
}

#[derive(Debug, Args)]
pub struct PackArgs {
    /// Staging tree whose contents become the archive root.
    #[arg(long)]
    pub staging: String,

    /// Book title; sanitized for the file name.
    #[arg(long)]
    pub title: String,

    #[arg(long)]
    pub book_id: String,

    /// Directory the `.epub` is written to.
    #[arg(long, default_value = ".")]
    pub out: String,
}
