//! Test utilities: recording fakes for the core traits.
//!
//! All fakes are `Clone` and share their state through `Arc<Mutex<_>>`, so a
//! test can hand one copy to the code under test and assert on another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::batcher::BatchExecutor;
use crate::error::AppError;
use crate::memory::MemoryTransport;
use crate::models::{
    IntelligenceLevel, KnowledgeResult, QueryResponse, ServiceStats, TeachEntry, TeachResponse,
};
use crate::traits::{BoxFuture, DataSink, KnowledgeTransport, Learner};

// ---------------------------------------------------------------------------
// RecordingExecutor
// ---------------------------------------------------------------------------

/// Batch executor that records every batch it receives.
///
/// A gated executor records the batch, then blocks until [`release`] hands it
/// a permit.
///
/// [`release`]: RecordingExecutor::release
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    calls: Arc<Mutex<Vec<Vec<String>>>>,
    known: Arc<Mutex<HashMap<String, serde_json::Value>>>,
    error: Option<AppError>,
    gate: Option<Arc<Semaphore>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known(self, url: &str, data: serde_json::Value) -> Self {
        self.known.lock().unwrap().insert(url.to_string(), data);
        self
    }

    pub fn with_error(mut self, error: AppError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Lets `n` gated batches complete.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl BatchExecutor for RecordingExecutor {
    async fn execute(
        &self,
        urls: Vec<String>,
    ) -> Result<HashMap<String, KnowledgeResult>, AppError> {
        self.calls.lock().unwrap().push(urls.clone());

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| AppError::Generic(e.to_string()))?
                .forget();
        }

        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        let known = self.known.lock().unwrap();
        Ok(urls
            .into_iter()
            .filter_map(|url| {
                let data = known.get(&url)?.clone();
                Some((url, KnowledgeResult::known(data, 1.0)))
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ScriptedTransport
// ---------------------------------------------------------------------------

/// [`MemoryTransport`] with call logs, an on/off failure switch, and an
/// optional artificial latency.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: MemoryTransport,
    failing: Arc<AtomicBool>,
    delay: Option<Duration>,
    query_calls: Arc<Mutex<Vec<Vec<String>>>>,
    teach_calls: Arc<Mutex<Vec<TeachEntry>>>,
    stats_calls: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn seed(&self, url: &str, data: serde_json::Value) {
        self.inner.insert(url, data);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn query_calls(&self) -> Vec<Vec<String>> {
        self.query_calls.lock().unwrap().clone()
    }

    pub fn teach_calls(&self) -> Vec<TeachEntry> {
        self.teach_calls.lock().unwrap().clone()
    }

    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }

    async fn before_call(&self) -> Result<(), AppError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::NetworkError("connection refused".into()));
        }
        Ok(())
    }
}

impl KnowledgeTransport for ScriptedTransport {
    async fn query(
        &self,
        urls: &[String],
        intelligence: IntelligenceLevel,
    ) -> Result<QueryResponse, AppError> {
        self.query_calls.lock().unwrap().push(urls.to_vec());
        self.before_call().await?;
        self.inner.query(urls, intelligence).await
    }

    async fn teach(&self, entries: &[TeachEntry]) -> Result<TeachResponse, AppError> {
        self.teach_calls.lock().unwrap().extend_from_slice(entries);
        self.before_call().await?;
        self.inner.teach(entries).await
    }

    async fn stats(&self) -> Result<ServiceStats, AppError> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        self.inner.stats().await
    }
}

// ---------------------------------------------------------------------------
// RecordingLearner
// ---------------------------------------------------------------------------

/// Learner that accepts everything and remembers what it was taught.
#[derive(Clone, Default)]
pub struct RecordingLearner {
    taught: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
}

impl RecordingLearner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn taught(&self) -> Vec<(String, serde_json::Value)> {
        self.taught.lock().unwrap().clone()
    }
}

impl Learner for RecordingLearner {
    fn learn(&self, url: String, data: serde_json::Value) -> BoxFuture<'_, TeachResponse> {
        Box::pin(async move {
            self.taught.lock().unwrap().push((url, data));
            TeachResponse::accepted(1)
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// Data sink that stores pushed items, or refuses them with a fixed message.
#[derive(Clone, Default)]
pub struct RecordingSink {
    items: Arc<Mutex<Vec<serde_json::Value>>>,
    failure: Option<String>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            items: Arc::default(),
            failure: Some(message.to_string()),
        }
    }

    pub fn items(&self) -> Vec<serde_json::Value> {
        self.items.lock().unwrap().clone()
    }
}

impl DataSink for RecordingSink {
    fn push(&self, item: serde_json::Value) -> BoxFuture<'_, Result<(), AppError>> {
        Box::pin(async move {
            if let Some(message) = &self.failure {
                return Err(AppError::SinkError(message.clone()));
            }
            self.items.lock().unwrap().push(item);
            Ok(())
        })
    }
}
