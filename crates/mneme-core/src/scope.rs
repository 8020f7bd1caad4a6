//! Ambient per-request state.
//!
//! A [`RequestScope`] answers "which URL is this, may we teach, and did the
//! service already know it?" for any code running inside one request,
//! without that code receiving the request as an argument.
//!
//! # Inheritance boundary
//!
//! The scope is a Tokio task-local installed for the polls of one future
//! ([`RequestScope::run`]). It is visible:
//!
//! - across every `.await` inside that future, however deeply nested;
//! - inside futures joined or selected within it (`tokio::join!`, `select!`),
//!   since they are polled by the same task.
//!
//! It is **not** visible in work scheduled onto another task: `tokio::spawn`,
//! `spawn_blocking`, timers or callbacks that run elsewhere. Use
//! [`spawn_in_scope`] to carry it across a spawn.
//!
//! Requests interleaved on one thread never observe each other's scope: the
//! task-local is swapped in and out around each poll of each scoped future.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::TeachResponse;
use crate::traits::Learner;

tokio::task_local! {
    static CURRENT_SCOPE: Arc<RequestScope>;
}

/// State for one inbound request, shared for its async extent.
pub struct RequestScope {
    request_id: Uuid,
    url: String,
    label: Option<String>,
    learner: Arc<dyn Learner>,
    learning_enabled: bool,
    already_known: bool,
    known_data_used: AtomicBool,
}

impl RequestScope {
    pub fn new(
        url: impl Into<String>,
        label: Option<String>,
        learner: Arc<dyn Learner>,
        learning_enabled: bool,
        already_known: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            request_id: Uuid::new_v4(),
            url: url.into(),
            label,
            learner,
            learning_enabled,
            already_known,
            known_data_used: AtomicBool::new(false),
        })
    }

    /// The scope of the request currently executing, if any.
    pub fn current() -> Option<Arc<RequestScope>> {
        CURRENT_SCOPE.try_with(Arc::clone).ok()
    }

    /// Runs `fut` with `scope` as the ambient request scope.
    ///
    /// The scope is released when `fut` finishes, returns early, errors, is
    /// dropped, or unwinds.
    pub async fn run<F: Future>(scope: Arc<RequestScope>, fut: F) -> F::Output {
        CURRENT_SCOPE.scope(scope, fut).await
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn learning_enabled(&self) -> bool {
        self.learning_enabled
    }

    pub fn already_known(&self) -> bool {
        self.already_known
    }

    /// Records that the handler adopted the service's data. From here on no
    /// push in this request teaches.
    pub fn mark_known_data_used(&self) {
        self.known_data_used.store(true, Ordering::Relaxed);
    }

    pub fn known_data_used(&self) -> bool {
        self.known_data_used.load(Ordering::Relaxed)
    }

    /// Whether data pushed now counts as new knowledge.
    pub fn should_teach(&self) -> bool {
        self.learning_enabled && !self.already_known && !self.known_data_used()
    }

    /// Teaches `data` for this request's URL.
    pub async fn teach(&self, data: serde_json::Value) -> TeachResponse {
        self.learner.learn(self.url.clone(), data).await
    }
}

impl std::fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScope")
            .field("request_id", &self.request_id)
            .field("url", &self.url)
            .field("label", &self.label)
            .field("learning_enabled", &self.learning_enabled)
            .field("already_known", &self.already_known)
            .field("known_data_used", &self.known_data_used())
            .finish_non_exhaustive()
    }
}

/// `tokio::spawn` that carries the current request scope into the new task.
pub fn spawn_in_scope<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match RequestScope::current() {
        Some(scope) => tokio::spawn(CURRENT_SCOPE.scope(scope, fut)),
        None => tokio::spawn(fut),
    }
}
