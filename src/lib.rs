#![forbid(unsafe_code)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod crawl;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod formats;
pub mod logging;
pub mod manifest;
pub mod package;
pub mod page;
pub mod staging;
pub mod toc;
pub mod xhtml;
