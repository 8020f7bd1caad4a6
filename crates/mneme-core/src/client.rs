//! The knowledge client: batching and circuit breaking composed over a
//! [`KnowledgeTransport`].
//!
//! Nothing that goes wrong at the service boundary escapes this type.
//! Failures are recorded on the breaker and turned into fallback answers or
//! rejected teach outcomes, so a crawl can finish with the service down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::batcher::{BatchExecutor, Batcher};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitBreakerStats};
use crate::config::KnowledgeConfig;
use crate::error::AppError;
use crate::models::{
    IntelligenceLevel, KnowledgeResult, QueryResponse, ServiceStats, TeachEntry, TeachResponse,
    UsageStats,
};
use crate::traits::{BoxFuture, KnowledgeTransport, Learner};

const CIRCUIT_NAME: &str = "knowledge-service";

/// Runs `call` with an upper bound; expiry becomes [`AppError::Timeout`].
async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .unwrap_or_else(|_| Err(AppError::Timeout(timeout.as_millis() as u64)))
}

#[derive(Debug)]
struct UsageCounters {
    queries: AtomicU64,
    recognized: AtomicU64,
    learned: AtomicU64,
    since: Mutex<DateTime<Utc>>,
}

impl UsageCounters {
    fn new() -> Self {
        Self {
            queries: AtomicU64::new(0),
            recognized: AtomicU64::new(0),
            learned: AtomicU64::new(0),
            since: Mutex::new(Utc::now()),
        }
    }

    fn record_answers(&self, asked: usize, recognized: usize) {
        self.queries.fetch_add(asked as u64, Ordering::Relaxed);
        self.recognized
            .fetch_add(recognized as u64, Ordering::Relaxed);
    }

    fn record_learned(&self, learned: u32) {
        self.learned.fetch_add(u64::from(learned), Ordering::Relaxed);
    }

    fn since(&self) -> DateTime<Utc> {
        *self.since.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn snapshot(&self) -> UsageStats {
        UsageStats {
            queries: self.queries.load(Ordering::Relaxed),
            recognized: self.recognized.load(Ordering::Relaxed),
            learned: self.learned.load(Ordering::Relaxed),
            since: self.since(),
        }
    }

    fn reset(&self) {
        self.queries.store(0, Ordering::Relaxed);
        self.recognized.store(0, Ordering::Relaxed);
        self.learned.store(0, Ordering::Relaxed);
        *self.since.lock().unwrap_or_else(|p| p.into_inner()) = Utc::now();
    }
}

/// Flattens a service answer into one result per URL.
fn into_results(response: QueryResponse) -> HashMap<String, KnowledgeResult> {
    let mut results = HashMap::with_capacity(response.known.len() + response.unknown.len());
    for url in response.unknown {
        results.insert(url, KnowledgeResult::unknown());
    }
    for entry in response.known {
        results.insert(
            entry.url,
            KnowledgeResult::known(entry.data, entry.confidence),
        );
    }
    results
}

/// The executor behind the batcher: one service round trip per batch, one
/// breaker signal per round trip.
struct QueryExecutor<T> {
    transport: T,
    breaker: CircuitBreaker,
    intelligence: IntelligenceLevel,
    timeout: Duration,
    usage: Arc<UsageCounters>,
}

impl<T: KnowledgeTransport> BatchExecutor for QueryExecutor<T> {
    async fn execute(&self, urls: Vec<String>) -> Result<HashMap<String, KnowledgeResult>, AppError> {
        let response = self
            .breaker
            .call(|| bounded(self.timeout, self.transport.query(&urls, self.intelligence)))
            .await?;

        let results = into_results(response);
        let recognized = results.values().filter(|r| r.known).count();
        self.usage.record_answers(urls.len(), recognized);
        Ok(results)
    }
}

/// Batched, circuit-protected access to the knowledge service.
pub struct KnowledgeClient<T: KnowledgeTransport> {
    transport: T,
    config: KnowledgeConfig,
    breaker: CircuitBreaker,
    batcher: Batcher<QueryExecutor<T>>,
    usage: Arc<UsageCounters>,
}

impl<T: KnowledgeTransport> KnowledgeClient<T> {
    pub fn new(transport: T, config: KnowledgeConfig) -> Self {
        let breaker = CircuitBreaker::new(CIRCUIT_NAME, config.circuit_breaker_config());
        let usage = Arc::new(UsageCounters::new());
        let executor = QueryExecutor {
            transport: transport.clone(),
            breaker: breaker.clone(),
            intelligence: config.intelligence_level,
            timeout: config.timeout(),
            usage: Arc::clone(&usage),
        };
        let batcher = Batcher::new(executor, config.batch_config());

        Self {
            transport,
            config,
            breaker,
            batcher,
            usage,
        }
    }

    pub fn config(&self) -> &KnowledgeConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Asks whether the service knows `url`. Never fails: an open circuit or
    /// a failed batch yields [`KnowledgeResult::fallback`].
    pub async fn query(&self, url: &str) -> KnowledgeResult {
        if self.breaker.is_open() {
            tracing::debug!(%url, "Circuit open, answering query with fallback");
            return KnowledgeResult::fallback();
        }

        match self.batcher.query(url).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(%url, error = %e, "Knowledge query failed, using fallback");
                KnowledgeResult::fallback()
            }
        }
    }

    /// One bulk call for `urls`, bypassing the batcher. Every URL gets an
    /// entry; on failure all of them are fallbacks.
    pub async fn query_bulk(&self, urls: &[String]) -> HashMap<String, KnowledgeResult> {
        if urls.is_empty() {
            return HashMap::new();
        }

        let outcome = self
            .breaker
            .call(|| {
                bounded(
                    self.config.timeout(),
                    self.transport.query(urls, self.config.intelligence_level),
                )
            })
            .await;

        match outcome {
            Ok(response) => {
                let mut results = into_results(response);
                let recognized = results.values().filter(|r| r.known).count();
                self.usage.record_answers(urls.len(), recognized);
                for url in urls {
                    results
                        .entry(url.clone())
                        .or_insert_with(KnowledgeResult::unknown);
                }
                results
            }
            Err(e) => {
                log_contained("bulk query", &e);
                urls.iter()
                    .map(|url| (url.clone(), KnowledgeResult::fallback()))
                    .collect()
            }
        }
    }

    /// Submits `data` for `url`. Never fails: disabled learning, an open
    /// circuit, and service errors all come back as
    /// [`TeachResponse::rejected`].
    pub async fn teach(&self, url: &str, data: serde_json::Value) -> TeachResponse {
        if !self.config.learning_enabled {
            tracing::debug!(%url, "Learning disabled, not teaching");
            return TeachResponse::rejected();
        }

        let entries = [TeachEntry {
            url: url.to_string(),
            data,
        }];
        let outcome = self
            .breaker
            .call(|| bounded(self.config.timeout(), self.transport.teach(&entries)))
            .await;

        match outcome {
            Ok(response) => {
                if response.is_accepted() {
                    self.usage.record_learned(response.learned);
                }
                tracing::debug!(%url, status = ?response.status, learned = response.learned, "Teach completed");
                response
            }
            Err(e) => {
                log_contained("teach", &e);
                TeachResponse::rejected()
            }
        }
    }

    /// Service-side statistics; `None` when the circuit is open or the call
    /// fails.
    pub async fn stats(&self) -> Option<ServiceStats> {
        match self
            .breaker
            .call(|| bounded(self.config.timeout(), self.transport.stats()))
            .await
        {
            Ok(stats) => Some(stats),
            Err(e) => {
                log_contained("stats", &e);
                None
            }
        }
    }

    /// Local usage counters.
    pub fn usage(&self) -> UsageStats {
        self.usage.snapshot()
    }

    pub fn reset_usage(&self) {
        self.usage.reset();
    }

    pub fn circuit_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    /// Queries waiting for their batch to be sent.
    pub fn pending_queries(&self) -> usize {
        self.batcher.queue_size()
    }

    /// Answers every queued query with a fallback so no caller hangs.
    pub fn shutdown(&self) {
        self.batcher.clear();
    }
}

impl<T: KnowledgeTransport> Learner for KnowledgeClient<T> {
    fn learn(&self, url: String, data: serde_json::Value) -> BoxFuture<'_, TeachResponse> {
        Box::pin(async move { self.teach(&url, data).await })
    }
}

fn log_contained(operation: &str, error: &CircuitBreakerError) {
    match error {
        CircuitBreakerError::Open { retry_after, .. } => {
            tracing::debug!(
                operation,
                retry_after_ms = retry_after.as_millis() as u64,
                "Circuit open, skipping call"
            );
        }
        CircuitBreakerError::Inner(e) => {
            tracing::warn!(
                operation,
                error = %e,
                retryable = e.is_retryable(),
                "Knowledge service call failed"
            );
        }
    }
}
