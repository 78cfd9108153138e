use std::time::Duration;

use anyhow::Context as _;
use url::Url;

pub const DEFAULT_HOST: &str = "https://www.safaribooksonline.com/";

/// Where and how to talk to the remote host.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub host: Url,
    /// Joined with the book id, relative to `host`.
    pub toc_path: String,
    /// Images live at `<image_prefix>/<title_safe>/<book_id>/<image>`.
    pub image_prefix: String,
    pub email_field: String,
    pub password_field: String,
    /// A post-login URL containing this marker means the login was rejected.
    pub login_failure_marker: String,
    pub user_agent: String,
    pub request_timeout: Duration,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            host: Url::parse(DEFAULT_HOST).expect("default host is a valid url"),
            toc_path: "nest/epub/toc/?book_id=".to_owned(),
            image_prefix: "library/view".to_owned(),
            email_field: "email".to_owned(),
            password_field: "password1".to_owned(),
            login_failure_marker: "/login".to_owned(),
            user_agent: format!("safaribooks/{}", env!("CARGO_PKG_VERSION")),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SiteConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("SAFARIBOOKS_HOST") {
            config = config
                .with_host(&host)
                .with_context(|| format!("invalid SAFARIBOOKS_HOST={host:?}"))?;
        }
        if let Ok(user_agent) = std::env::var("SAFARIBOOKS_USER_AGENT") {
            let user_agent = user_agent.trim();
            if !user_agent.is_empty() {
                config.user_agent = user_agent.to_owned();
            }
        }
        Ok(config)
    }

    /// Replaces the host. A missing trailing slash is added so relative paths
    /// join below it.
    pub fn with_host(mut self, raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim();
        let raw = if raw.ends_with('/') {
            raw.to_owned()
        } else {
            format!("{raw}/")
        };
        let host = Url::parse(&raw).context("parse host url")?;
        if host.scheme() != "http" && host.scheme() != "https" {
            anyhow::bail!("host must be http/https: {host}");
        }
        self.host = host;
        Ok(self)
    }

    /// Resolves a host-relative or absolute reference.
    pub fn resolve(&self, reference: &str) -> anyhow::Result<Url> {
        self.host
            .join(reference.trim())
            .with_context(|| format!("resolve url: {reference}"))
    }

    pub fn toc_url(&self, book_id: &str) -> anyhow::Result<Url> {
        self.resolve(&format!("{}{book_id}", self.toc_path))
    }

    pub fn image_url(&self, title_safe: &str, book_id: &str, image: &str) -> anyhow::Result<Url> {
        let prefix = self.image_prefix.trim_matches('/');
        self.resolve(&format!("{prefix}/{title_safe}/{book_id}/{image}"))
    }

    pub fn is_login_failure(&self, url: &Url) -> bool {
        url.as_str().contains(&self.login_failure_marker)
    }
}

/// Scheduling knobs for the fetch engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum fetches in flight at once.
    pub concurrency: usize,
    /// Politeness delay before every request.
    pub delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            delay: Duration::ZERO,
        }
    }
}
