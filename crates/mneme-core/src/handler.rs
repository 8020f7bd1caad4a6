//! Wrapping a host's per-request handler with knowledge lookups.
//!
//! ```text
//! Start ──► Queried ──┬─► Skipped ───────────────────────────► Done
//!                     └─► Executing (RequestScope + LearningSink) ─► Done
//! ```
//!
//! The wrapper never mutates the host's objects in place. It hands the
//! handler a decorated [`RequestContext`]: the `ai` field is filled in and
//! the data sink is swapped for a [`LearningSink`] around the original.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use uuid::Uuid;

use crate::client::KnowledgeClient;
use crate::config::AlwaysRun;
use crate::error::AppError;
use crate::models::KnowledgeResult;
use crate::scope::RequestScope;
use crate::traits::{BoxFuture, DataSink, KnowledgeTransport, Learner};

/// One unit of crawl work as the host describes it.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlRequest {
    pub url: String,
    pub label: Option<String>,
    pub user_data: serde_json::Value,
}

impl CrawlRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            label: None,
            user_data: serde_json::Value::Null,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_user_data(mut self, user_data: serde_json::Value) -> Self {
        self.user_data = user_data;
        self
    }
}

/// What the knowledge service said about the current request.
#[derive(Debug, Clone, Default)]
pub struct AiContext {
    pub known: bool,
    pub data: Option<serde_json::Value>,
    pub confidence: Option<f64>,
    scope: Option<Arc<RequestScope>>,
}

impl AiContext {
    fn bound(result: &KnowledgeResult, scope: Arc<RequestScope>) -> Self {
        Self {
            known: result.known,
            data: result.data.clone(),
            confidence: result.confidence,
            scope: Some(scope),
        }
    }

    /// Adopts the service's data for this request and returns it.
    ///
    /// Marks the request so later pushes do not teach, even if they carry
    /// data of their own.
    pub fn use_ai_data(&self) -> Option<serde_json::Value> {
        if let Some(scope) = &self.scope {
            scope.mark_known_data_used();
        }
        self.data.clone()
    }
}

/// The object handed to a request handler.
#[derive(Clone)]
pub struct RequestContext {
    pub request: CrawlRequest,
    pub data_sink: Option<Arc<dyn DataSink>>,
    pub ai: AiContext,
}

impl RequestContext {
    pub fn new(request: CrawlRequest) -> Self {
        Self {
            request,
            data_sink: None,
            ai: AiContext::default(),
        }
    }

    pub fn with_data_sink(mut self, sink: Arc<dyn DataSink>) -> Self {
        self.data_sink = Some(sink);
        self
    }

    /// Pushes `item` through this request's data sink.
    pub async fn push_data(&self, item: serde_json::Value) -> Result<(), AppError> {
        match &self.data_sink {
            Some(sink) => sink.push(item).await,
            None => Err(AppError::SinkError(format!(
                "no data sink for {}",
                self.request.url
            ))),
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request", &self.request)
            .field("has_data_sink", &self.data_sink.is_some())
            .field("ai", &self.ai)
            .finish()
    }
}

/// A [`DataSink`] that teaches the knowledge service about new data.
///
/// Learning decisions come from the ambient [`RequestScope`], so the same
/// sink can wrap a host-wide dataset that handler code reaches directly.
/// Outside any request it only forwards.
pub struct LearningSink {
    inner: Arc<dyn DataSink>,
}

impl LearningSink {
    pub fn new(inner: Arc<dyn DataSink>) -> Self {
        Self { inner }
    }
}

impl DataSink for LearningSink {
    fn push(&self, item: serde_json::Value) -> BoxFuture<'_, Result<(), AppError>> {
        Box::pin(async move {
            // A learning inner sink teaches on its own.
            if self.inner.learns() {
                return self.inner.push(item).await;
            }
            let Some(scope) = RequestScope::current().filter(|s| s.should_teach()) else {
                return self.inner.push(item).await;
            };

            let (taught, pushed) = tokio::join!(scope.teach(item.clone()), self.inner.push(item));
            tracing::debug!(
                request_id = %scope.request_id(),
                url = %scope.url(),
                label = scope.label(),
                status = ?taught.status,
                "Taught pushed item"
            );
            pushed
        })
    }

    fn learns(&self) -> bool {
        true
    }
}

/// How a wrapped request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The service knew the URL; the handler did not run.
    Skipped,
    /// The handler ran to completion.
    Executed,
}

/// Lifecycle events emitted by the wrapper.
#[derive(Debug, Clone)]
pub enum HandlerEvent<'a> {
    Queried {
        url: &'a str,
        known: bool,
        fallback: bool,
    },
    Skipped {
        url: &'a str,
        label: Option<&'a str>,
    },
    Executing {
        request_id: Uuid,
        url: &'a str,
        already_known: bool,
    },
    Completed {
        request_id: Uuid,
        url: &'a str,
    },
    Failed {
        request_id: Uuid,
        url: &'a str,
        error: &'a str,
    },
}

/// Receives wrapper events (decoupled logging).
pub trait HandlerReporter: Send + Sync {
    fn report(&self, event: HandlerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHandlerReporter;

impl HandlerReporter for TracingHandlerReporter {
    fn report(&self, event: HandlerEvent<'_>) {
        match event {
            HandlerEvent::Queried {
                url,
                known,
                fallback,
            } => {
                tracing::debug!(%url, %known, %fallback, "Knowledge queried");
            }
            HandlerEvent::Skipped { url, label } => {
                tracing::info!(%url, ?label, "Known URL, handler skipped");
            }
            HandlerEvent::Executing {
                request_id,
                url,
                already_known,
            } => {
                tracing::debug!(%request_id, %url, %already_known, "Running handler");
            }
            HandlerEvent::Completed { request_id, url } => {
                tracing::debug!(%request_id, %url, "Handler completed");
            }
            HandlerEvent::Failed {
                request_id,
                url,
                error,
            } => {
                tracing::warn!(%request_id, %url, %error, "Handler failed");
            }
        }
    }
}

/// Wraps a per-request handler with the query → decide → scope → learn
/// lifecycle.
pub struct HandlerWrapper<T, H, R = TracingHandlerReporter>
where
    T: KnowledgeTransport,
{
    client: Arc<KnowledgeClient<T>>,
    handler: H,
    always_run: AlwaysRun,
    learning_enabled: bool,
    reporter: R,
}

impl<T, H> HandlerWrapper<T, H>
where
    T: KnowledgeTransport,
{
    /// Policy and learning switch are taken from the client's config.
    pub fn new(client: Arc<KnowledgeClient<T>>, handler: H) -> Self {
        let always_run = client.config().always_run.clone();
        let learning_enabled = client.config().learning_enabled;
        Self {
            client,
            handler,
            always_run,
            learning_enabled,
            reporter: TracingHandlerReporter,
        }
    }
}

impl<T, H, R> HandlerWrapper<T, H, R>
where
    T: KnowledgeTransport,
    R: HandlerReporter,
{
    pub fn with_always_run(mut self, always_run: AlwaysRun) -> Self {
        self.always_run = always_run;
        self
    }

    pub fn with_reporter<R2: HandlerReporter>(self, reporter: R2) -> HandlerWrapper<T, H, R2> {
        HandlerWrapper {
            client: self.client,
            handler: self.handler,
            always_run: self.always_run,
            learning_enabled: self.learning_enabled,
            reporter,
        }
    }

    pub fn client(&self) -> &Arc<KnowledgeClient<T>> {
        &self.client
    }

    /// Runs one request through the lifecycle.
    ///
    /// Errors from the handler come back unchanged. A failing data sink on
    /// the skip path is reported as `E::from(AppError)`.
    pub async fn handle<Fut, E>(&self, mut ctx: RequestContext) -> Result<HandlerOutcome, E>
    where
        H: Fn(RequestContext) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<AppError> + Display,
    {
        let url = ctx.request.url.clone();
        let result = self.client.query(&url).await;
        self.reporter.report(HandlerEvent::Queried {
            url: &url,
            known: result.known,
            fallback: result.fallback,
        });

        let already_known = result.known;
        if already_known && !self.always_run.should_run(ctx.request.label.as_deref()) {
            if let (Some(sink), Some(data)) = (&ctx.data_sink, result.data.clone()) {
                sink.push(data).await?;
            }
            self.reporter.report(HandlerEvent::Skipped {
                url: &url,
                label: ctx.request.label.as_deref(),
            });
            return Ok(HandlerOutcome::Skipped);
        }

        let learner: Arc<dyn Learner> = self.client.clone();
        let scope = RequestScope::new(
            url.clone(),
            ctx.request.label.clone(),
            learner,
            self.learning_enabled,
            already_known,
        );
        let request_id = scope.request_id();

        ctx.ai = AiContext::bound(&result, Arc::clone(&scope));
        if let Some(inner) = ctx.data_sink.take() {
            ctx.data_sink = Some(if inner.learns() {
                inner
            } else {
                Arc::new(LearningSink::new(inner))
            });
        }

        self.reporter.report(HandlerEvent::Executing {
            request_id,
            url: &url,
            already_known,
        });

        let handler = &self.handler;
        let outcome = RequestScope::run(scope, async move { handler(ctx).await }).await;

        match &outcome {
            Ok(()) => self.reporter.report(HandlerEvent::Completed {
                request_id,
                url: &url,
            }),
            Err(e) => self.reporter.report(HandlerEvent::Failed {
                request_id,
                url: &url,
                error: &e.to_string(),
            }),
        }

        outcome.map(|()| HandlerOutcome::Executed)
    }
}
