use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use anyhow::Context as _;

use crate::auth::{Credentials, LoginForm};
use crate::cli::FetchArgs;
use crate::config::{EngineSettings, SiteConfig};
use crate::engine::{Engine, EngineStats, Fetcher, Handler, Request, Response};
use crate::error::RunFailure;
use crate::fetch::HttpFetcher;
use crate::formats::PageDescriptor;
use crate::staging::{
    Payload, StagingFs, StagingTree, oebps_path, sanitize_relative_path, to_slash_path,
};
use crate::toc::TableOfContents;

pub const COVER_IMAGE: &str = "cover-image.jpg";

/// What a run was asked to do.
#[derive(Debug, Clone)]
pub struct BookRequest {
    pub credentials: Credentials,
    pub book_id: String,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct RunSettings {
    pub site: SiteConfig,
    pub engine: EngineSettings,
    /// Copied instead of the built-in skeleton when set.
    pub skeleton_dir: Option<PathBuf>,
    /// Leave the staging tree on disk after the run.
    pub keep_staging: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub toc_acquired: bool,
    pub archive_path: Option<PathBuf>,
    pub failure: Option<RunFailure>,
    pub stats: EngineStats,
    pub kept_staging: Option<PathBuf>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.archive_path.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Start,
    Authenticating,
    FetchingToc,
    Crawling,
    Closed,
}

/// What a fetched response is for.
#[derive(Debug, Clone)]
pub enum Step {
    LoginPage,
    LoginSubmit,
    Toc,
    Cover,
    PageDescriptor,
    PageContent {
        dest: PathBuf,
        images: Vec<PathBuf>,
    },
    Image {
        dest: PathBuf,
    },
}

/// Crawl callbacks for one book. Writes every fetched resource into the
/// staging tree and records whether the TOC was acquired.
pub struct BookSpider<S> {
    book_id: String,
    credentials: Credentials,
    site: SiteConfig,
    staging: Arc<S>,
    toc: OnceLock<TableOfContents>,
    state: Mutex<RunState>,
    failure: Mutex<Option<RunFailure>>,
}

impl<S: StagingFs> BookSpider<S> {
    pub fn new(book_id: &str, credentials: Credentials, site: SiteConfig, staging: Arc<S>) -> Self {
        Self {
            book_id: book_id.to_owned(),
            credentials,
            site,
            staging,
            toc: OnceLock::new(),
            state: Mutex::new(RunState::Start),
            failure: Mutex::new(None),
        }
    }

    pub fn start_requests(&self) -> Vec<Request<Step>> {
        self.transition(RunState::Authenticating);
        vec![Request::get(self.site.host.clone(), Step::LoginPage)]
    }

    pub fn toc(&self) -> Option<&TableOfContents> {
        self.toc.get()
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the crawl closed once the engine went idle and reports the
    /// failure that stopped it, if any.
    pub fn close(&self) -> Option<RunFailure> {
        self.transition(RunState::Closed);
        if self.toc.get().is_some() {
            return None;
        }
        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Some(failure.unwrap_or_else(|| RunFailure::TocUnavailable {
            reason: "crawl ended before the toc was received".to_owned(),
        }))
    }

    fn transition(&self, next: RunState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            tracing::info!(from = ?*state, to = ?next, "crawl state");
            *state = next;
        }
    }

    fn fail(&self, failure: RunFailure) {
        tracing::error!(%failure, "aborting crawl");
        let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert(failure);
        drop(slot);
        self.transition(RunState::Closed);
    }

    fn parse_login_page(&self, response: Response) -> anyhow::Result<Vec<Request<Step>>> {
        let form = match LoginForm::from_html(
            &response.text(),
            &response.url,
            &self.site,
            &self.credentials,
        ) {
            Ok(form) => form,
            Err(err) => {
                self.fail(RunFailure::Authentication {
                    reason: format!("{err:#}"),
                });
                return Ok(Vec::new());
            }
        };
        Ok(vec![Request::post_form(
            form.action,
            form.fields,
            Step::LoginSubmit,
        )])
    }

    fn after_login(&self, response: Response) -> anyhow::Result<Vec<Request<Step>>> {
        // Loose check: a rejected login lands back on a login page.
        if self.site.is_login_failure(&response.url) {
            self.fail(RunFailure::Authentication {
                reason: format!("redirected to {}", response.url),
            });
            return Ok(Vec::new());
        }

        self.transition(RunState::FetchingToc);
        let url = self.site.toc_url(&self.book_id)?;
        Ok(vec![Request::get(url, Step::Toc)])
    }

    fn parse_toc(&self, response: Response) -> anyhow::Result<Vec<Request<Step>>> {
        let toc = match TableOfContents::parse(&response.body) {
            Ok(toc) => toc,
            Err(err) => {
                let body = response.text();
                let preview = body.chars().take(200).collect::<String>();
                tracing::error!(body = %preview, "failed evaluating toc body");
                self.fail(RunFailure::TocParse {
                    reason: format!("{err:#}"),
                });
                return Ok(Vec::new());
            }
        };

        if self.toc.get().is_some() {
            tracing::warn!("toc received twice; keeping the first");
            return Ok(Vec::new());
        }

        // Manifests are rendered before the TOC counts as acquired, so a run
        // never packages unrendered templates.
        if let Err(err) = crate::manifest::render_manifests(self.staging.as_ref(), &toc.document)
        {
            self.fail(RunFailure::ManifestRender {
                reason: format!("{err:#}"),
            });
            return Ok(Vec::new());
        }

        let toc = self.toc.get_or_init(|| toc);
        self.transition(RunState::Crawling);
        tracing::info!(
            title = toc.title(),
            book_id = toc.book_id(),
            items = toc.items().len(),
            "toc acquired"
        );

        let mut requests = Vec::with_capacity(toc.items().len() + 1);
        let cover = toc.cover_ref.as_deref().map(|cover| self.site.resolve(cover));
        match cover {
            Some(Ok(url)) => requests.push(Request::get(url, Step::Cover)),
            Some(Err(err)) => {
                tracing::warn!(error = %format!("{err:#}"), "skipping cover image")
            }
            None => tracing::warn!(
                thumbnail_tag = %toc.document.thumbnail_tag,
                "no cover image in thumbnail tag"
            ),
        }
        for item in toc.items() {
            match self.site.resolve(&item.url) {
                Ok(url) => requests.push(Request::get(url, Step::PageDescriptor)),
                Err(err) => tracing::warn!(
                    url = %item.url,
                    error = %format!("{err:#}"),
                    "skipping toc item"
                ),
            }
        }

        Ok(requests)
    }

    fn parse_page_descriptor(&self, response: Response) -> anyhow::Result<Vec<Request<Step>>> {
        let descriptor: PageDescriptor =
            serde_json::from_slice(&response.body).context("parse page descriptor json")?;

        let dest = sanitize_relative_path(&descriptor.full_path).ok_or_else(|| {
            anyhow::anyhow!("page has no usable path: {:?}", descriptor.full_path)
        })?;
        let images = descriptor
            .image_refs()
            .filter_map(sanitize_relative_path)
            .collect::<Vec<_>>();

        let content_url = self.site.resolve(&descriptor.content)?;
        Ok(vec![Request::get(
            content_url,
            Step::PageContent { dest, images },
        )])
    }

    fn parse_page(
        &self,
        dest: &Path,
        images: Vec<PathBuf>,
        response: Response,
    ) -> anyhow::Result<Vec<Request<Step>>> {
        crate::page::write_page(self.staging.as_ref(), dest, &response.text())?;

        let toc = self
            .toc
            .get()
            .ok_or_else(|| anyhow::anyhow!("page fetched before toc"))?;
        let mut requests = Vec::with_capacity(images.len());
        for image in images {
            let image_ref = to_slash_path(&image);
            let url = self
                .site
                .image_url(toc.title_safe(), toc.book_id(), &image_ref)?;
            requests.push(Request::get(url, Step::Image { dest: image }));
        }
        Ok(requests)
    }

    fn write_resource(&self, rel: &Path, response: &Response) -> anyhow::Result<()> {
        self.staging
            .write(&oebps_path(rel), Payload::Bytes(&response.body))
            .with_context(|| format!("write resource: {}", rel.display()))
    }
}

impl<S: StagingFs + 'static> Handler for BookSpider<S> {
    type Step = Step;

    fn on_response(&self, step: Step, response: Response) -> anyhow::Result<Vec<Request<Step>>> {
        match step {
            Step::LoginPage => self.parse_login_page(response),
            Step::LoginSubmit => self.after_login(response),
            Step::Toc => self.parse_toc(response),
            Step::Cover => {
                self.write_resource(Path::new(COVER_IMAGE), &response)?;
                Ok(Vec::new())
            }
            Step::PageDescriptor => self.parse_page_descriptor(response),
            Step::PageContent { dest, images } => self.parse_page(&dest, images, response),
            Step::Image { dest } => {
                self.write_resource(&dest, &response)?;
                Ok(Vec::new())
            }
        }
    }

    fn on_fetch_error(&self, step: &Step, err: &anyhow::Error) {
        match step {
            Step::LoginPage | Step::LoginSubmit => self.fail(RunFailure::Authentication {
                reason: format!("{err:#}"),
            }),
            Step::Toc => self.fail(RunFailure::TocUnavailable {
                reason: format!("{err:#}"),
            }),
            _ => {}
        }
    }
}

/// Downloads one book and packages it.
///
/// Missing pages and images do not fail the run; they are only missing from
/// the archive. Login and TOC failures end the run without an archive.
/// Packaging errors are returned.
pub async fn run_book(
    request: BookRequest,
    settings: RunSettings,
    fetcher: Arc<dyn Fetcher>,
) -> anyhow::Result<RunOutcome> {
    let staging = Arc::new(
        StagingTree::create(settings.skeleton_dir.as_deref()).context("create staging tree")?,
    );
    let spider = Arc::new(BookSpider::new(
        &request.book_id,
        request.credentials.clone(),
        settings.site.clone(),
        Arc::clone(&staging),
    ));

    let engine = Engine::new(fetcher, settings.engine.clone());
    let seeds = spider.start_requests();
    let stats = engine
        .run(Arc::clone(&spider), seeds)
        .await
        .context("run crawl")?;
    let failure = spider.close();
    tracing::info!(
        handled = stats.handled,
        dropped = stats.dropped(),
        "crawl closed"
    );

    let packaged = match (spider.toc(), &failure) {
        (Some(toc), None) => {
            if stats.dropped() > 0 {
                tracing::warn!(
                    dropped = stats.dropped(),
                    "some resources could not be fetched; archive will be incomplete"
                );
            }
            crate::package::package(
                staging.root(),
                &toc.sanitized_title,
                &request.book_id,
                &request.output_dir,
            )
            .context("package book")
            .map(Some)
        }
        _ => {
            tracing::info!("did not get the toc; skipping packaging");
            Ok(None)
        }
    };
    let toc_acquired = spider.toc().is_some();
    drop(spider);

    // Kept before a packaging error is returned, so the tree can be packed
    // again with `pack`.
    let kept_staging = if settings.keep_staging {
        let staging = Arc::try_unwrap(staging)
            .map_err(|_| anyhow::anyhow!("staging tree still in use after crawl"))?;
        let path = staging.keep();
        tracing::info!(path = %path.display(), "kept staging directory");
        Some(path)
    } else {
        None
    };
    let archive_path = match (packaged, &kept_staging) {
        (Ok(path), _) => path,
        (Err(err), Some(kept)) => {
            return Err(err.context(format!("staging tree kept at {}", kept.display())));
        }
        (Err(err), None) => return Err(err),
    };

    Ok(RunOutcome {
        toc_acquired,
        archive_path,
        failure,
        stats,
        kept_staging,
    })
}

pub async fn run(args: FetchArgs) -> anyhow::Result<()> {
    let mut site = SiteConfig::from_env().context("load site config")?;
    if let Some(host) = args.host.as_deref() {
        site = site.with_host(host).context("parse --host")?;
    }
    site.request_timeout = Duration::from_secs(args.timeout_secs.max(1));

    let settings = RunSettings {
        engine: EngineSettings {
            concurrency: args.concurrency.max(1),
            delay: Duration::from_millis(args.delay_ms),
        },
        skeleton_dir: args.skeleton.as_ref().map(PathBuf::from),
        keep_staging: args.keep_staging,
        site,
    };
    let fetcher = Arc::new(HttpFetcher::new(&settings.site).context("build fetcher")?);
    let request = BookRequest {
        credentials: Credentials {
            email: args.user,
            password: args.password,
        },
        book_id: args.book_id,
        output_dir: PathBuf::from(&args.out),
    };

    let outcome = run_book(request, settings, fetcher).await?;
    match (&outcome.archive_path, &outcome.failure) {
        (Some(path), _) => {
            println!("{}", path.display());
            Ok(())
        }
        (None, Some(failure)) => Err(anyhow::Error::new(failure.clone())),
        (None, None) => anyhow::bail!("no archive produced"),
    }
}
