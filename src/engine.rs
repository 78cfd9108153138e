//! Request engine: runs fetches concurrently and feeds each response to a
//! synchronous callback that may schedule follow-up requests.
//!
//! The crawl is over when nothing is pending and nothing is in flight. Since a
//! task only finishes after its callback has returned the follow-ups, the
//! engine can never observe itself idle while work is still being discovered.
//!
//! A request is issued at most once per run: a method and URL already seen
//! is skipped, so resources shared by several pages are fetched and written
//! once.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use url::Url;

use crate::config::EngineSettings;

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    PostForm(Vec<(String, String)>),
}

impl fmt::Debug for Method {
    // Form bodies carry credentials.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::PostForm(fields) => write!(f, "POST form ({} fields)", fields.len()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request<S> {
    pub url: Url,
    pub method: Method,
    pub step: S,
}

impl<S> Request<S> {
    pub fn get(url: Url, step: S) -> Self {
        Self {
            url,
            method: Method::Get,
            step,
        }
    }

    pub fn post_form(url: Url, fields: Vec<(String, String)>, step: S) -> Self {
        Self {
            url,
            method: Method::PostForm(fields),
            step,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL after redirects.
    pub url: Url,
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Transport seam. Non-success statuses are reported as errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url, method: &Method) -> anyhow::Result<Response>;
}

pub trait Handler: Send + Sync {
    type Step: fmt::Debug + Send + 'static;

    /// Handles one response and returns the requests it discovered.
    fn on_response(
        &self,
        step: Self::Step,
        response: Response,
    ) -> anyhow::Result<Vec<Request<Self::Step>>>;

    /// Called when the fetch for `step` failed. The request is dropped either way.
    fn on_fetch_error(&self, _step: &Self::Step, _err: &anyhow::Error) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub handled: usize,
    pub fetch_failed: usize,
    pub handler_failed: usize,
    /// Requests skipped because the same method and URL was already issued.
    pub duplicates: usize,
}

impl EngineStats {
    pub fn dropped(&self) -> usize {
        self.fetch_failed + self.handler_failed
    }
}

enum TaskOutcome<S> {
    Handled(Vec<Request<S>>),
    FetchFailed,
    HandlerFailed,
}

pub struct Engine {
    fetcher: Arc<dyn Fetcher>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(fetcher: Arc<dyn Fetcher>, settings: EngineSettings) -> Self {
        Self { fetcher, settings }
    }

    /// Runs `seeds` and everything they lead to, returning once the engine is idle.
    pub async fn run<H>(
        &self,
        handler: Arc<H>,
        seeds: Vec<Request<H::Step>>,
    ) -> anyhow::Result<EngineStats>
    where
        H: Handler + 'static,
    {
        let concurrency = self.settings.concurrency.max(1);
        let mut pending: VecDeque<Request<H::Step>> = VecDeque::new();
        let mut seen: HashSet<(Method, Url)> = HashSet::new();
        let mut in_flight = tokio::task::JoinSet::new();
        let mut stats = EngineStats::default();
        enqueue(&mut pending, &mut seen, &mut stats, seeds);

        while !pending.is_empty() || !in_flight.is_empty() {
            while in_flight.len() < concurrency {
                let Some(request) = pending.pop_front() else {
                    break;
                };
                let fetcher = Arc::clone(&self.fetcher);
                let handler = Arc::clone(&handler);
                let delay = self.settings.delay;
                in_flight.spawn(async move {
                    process(fetcher.as_ref(), handler.as_ref(), request, delay).await
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            match joined.context("join fetch task")? {
                TaskOutcome::Handled(followups) => {
                    stats.handled += 1;
                    enqueue(&mut pending, &mut seen, &mut stats, followups);
                }
                TaskOutcome::FetchFailed => stats.fetch_failed += 1,
                TaskOutcome::HandlerFailed => stats.handler_failed += 1,
            }
        }

        tracing::debug!(?stats, "engine idle");
        Ok(stats)
    }
}

fn enqueue<S: fmt::Debug>(
    pending: &mut VecDeque<Request<S>>,
    seen: &mut HashSet<(Method, Url)>,
    stats: &mut EngineStats,
    requests: Vec<Request<S>>,
) {
    for request in requests {
        if !seen.insert((request.method.clone(), request.url.clone())) {
            tracing::debug!(
                url = %request.url,
                step = ?request.step,
                "already requested; skipping"
            );
            stats.duplicates += 1;
            continue;
        }
        pending.push_back(request);
    }
}

async fn process<H>(
    fetcher: &dyn Fetcher,
    handler: &H,
    request: Request<H::Step>,
    delay: Duration,
) -> TaskOutcome<H::Step>
where
    H: Handler,
{
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let Request { url, method, step } = request;
    tracing::debug!(%url, ?method, ?step, "fetch");
    let response = match fetcher.fetch(&url, &method).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(%url, ?step, error = %format!("{err:#}"), "fetch failed; dropping");
            handler.on_fetch_error(&step, &err);
            return TaskOutcome::FetchFailed;
        }
    };

    match handler.on_response(step, response) {
        Ok(followups) => TaskOutcome::Handled(followups),
        Err(err) => {
            tracing::warn!(%url, error = %format!("{err:#}"), "response handling failed; dropping");
            TaskOutcome::HandlerFailed
        }
    }
}
