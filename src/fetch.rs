use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use url::Url;

use crate::config::SiteConfig;
use crate::engine::{Fetcher, Method, Response};

/// `reqwest`-backed fetcher. Keeps the session cookie across requests and
/// follows redirects, so `Response::url` is where the host finally sent us.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(site: &SiteConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(site.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(site.user_agent.clone())
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, method: &Method) -> anyhow::Result<Response> {
        let (verb, request) = match method {
            Method::Get => ("GET", self.client.get(url.clone())),
            Method::PostForm(fields) => ("POST", self.client.post(url.clone()).form(fields)),
        };

        let response = request
            .header(ACCEPT, "*/*")
            .send()
            .await
            .with_context(|| format!("{verb} {url}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("{verb} {url}: unexpected status {status}");
        }

        let final_url = response.url().clone();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("read body: {verb} {url}"))?;

        Ok(Response {
            url: final_url,
            status: status.as_u16(),
            body: body.to_vec(),
        })
    }
}
