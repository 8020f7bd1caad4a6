//! A small crawl host: fetch each page, pull out its `<title>`, and run it
//! through [`HandlerWrapper`] so known pages are skipped and new ones are
//! taught.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mneme_core::{
    AlwaysRun, AppError, BoxFuture, CrawlRequest, DataSink, HandlerOutcome, HandlerWrapper,
    KnowledgeClient, KnowledgeTransport, RequestContext,
};
use reqwest::Client;
use scraper::{Html, Selector};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

const USER_AGENT: &str = concat!("mneme/", env!("CARGO_PKG_VERSION"));

/// Downloads page HTML.
#[derive(Clone)]
pub struct PageFetcher {
    client: Client,
    timeout_ms: u64,
}

impl PageFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let parsed =
            Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::HttpError(format!(
                "Unsupported scheme '{}' in {url}",
                parsed.scheme()
            )));
        }

        let response = self.client.get(parsed).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_ms)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpError(format!("HTTP {status} for {url}")));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read body of {url}: {e}")))
    }
}

/// The trimmed text of the first `<title>`, if it has any.
pub fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    let title = document
        .select(&selector)
        .next()?
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    (!title.is_empty()).then_some(title)
}

/// Writes every pushed item as one line of JSON.
pub struct JsonLinesSink<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> DataSink for JsonLinesSink<W> {
    fn push(&self, item: serde_json::Value) -> BoxFuture<'_, Result<(), AppError>> {
        Box::pin(async move {
            let line = serde_json::to_string(&item)?;
            let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
            writeln!(out, "{line}")
                .and_then(|()| out.flush())
                .map_err(|e| AppError::SinkError(e.to_string()))
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrawlOptions {
    /// Pages processed at once.
    pub concurrency: usize,
    /// Label attached to every request.
    pub label: Option<String>,
    /// Overrides the client's configured policy.
    pub always_run: Option<AlwaysRun>,
}

/// Per-page tallies for one crawl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl CrawlReport {
    pub fn total(&self) -> usize {
        self.executed + self.skipped + self.failed + self.cancelled
    }
}

enum PageOutcome {
    Done(HandlerOutcome),
    Failed(AppError),
    Cancelled,
}

async fn scrape_page(fetcher: &PageFetcher, ctx: &RequestContext) -> Result<(), AppError> {
    if ctx.ai.known {
        tracing::debug!(url = %ctx.request.url, "Scraping known page again");
    }

    let html = fetcher.fetch(&ctx.request.url).await?;
    let title = extract_title(&html);
    ctx.push_data(serde_json::json!({
        "url": ctx.request.url,
        "label": ctx.request.label,
        "title": title,
        "scrapedAt": chrono::Utc::now(),
    }))
    .await
}

/// Crawls `urls` and writes scraped items to `sink`.
///
/// Stops starting new pages once `cancel` fires; pages in progress are
/// abandoned and counted as cancelled. Queued knowledge queries are released
/// before returning.
pub async fn run_crawl<T: KnowledgeTransport>(
    client: Arc<KnowledgeClient<T>>,
    fetcher: PageFetcher,
    sink: Arc<dyn DataSink>,
    urls: Vec<String>,
    options: CrawlOptions,
    cancel: CancellationToken,
) -> CrawlReport {
    let mut wrapper = HandlerWrapper::new(Arc::clone(&client), move |ctx: RequestContext| {
        let fetcher = fetcher.clone();
        async move { scrape_page(&fetcher, &ctx).await }
    });
    if let Some(policy) = options.always_run {
        wrapper = wrapper.with_always_run(policy);
    }
    let wrapper = Arc::new(wrapper);

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut report = CrawlReport::default();

    for url in urls {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            report.cancelled += 1;
            continue;
        };

        let mut request = CrawlRequest::new(url.clone());
        if let Some(label) = &options.label {
            request = request.with_label(label.clone());
        }
        let ctx = RequestContext::new(request).with_data_sink(Arc::clone(&sink));
        let wrapper = Arc::clone(&wrapper);
        let cancel = cancel.clone();

        tasks.spawn(async move {
            let _permit = permit;
            let outcome = tokio::select! {
                result = wrapper.handle(ctx) => match result {
                    Ok(outcome) => PageOutcome::Done(outcome),
                    Err(e) => PageOutcome::Failed(e),
                },
                () = cancel.cancelled() => PageOutcome::Cancelled,
            };
            (url, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, PageOutcome::Done(HandlerOutcome::Executed))) => report.executed += 1,
            Ok((_, PageOutcome::Done(HandlerOutcome::Skipped))) => report.skipped += 1,
            Ok((url, PageOutcome::Failed(e))) => {
                tracing::warn!(%url, error = %e, "Page failed");
                report.failed += 1;
            }
            Ok((_, PageOutcome::Cancelled)) => report.cancelled += 1,
            Err(e) => {
                tracing::error!(error = %e, "Crawl task panicked");
                report.failed += 1;
            }
        }
    }

    client.shutdown();
    report
}
