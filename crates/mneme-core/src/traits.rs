use std::future::Future;
use std::pin::Pin;

use crate::error::AppError;
use crate::models::{IntelligenceLevel, QueryResponse, ServiceStats, TeachEntry, TeachResponse};

/// Boxed, sendable future used at the object-safe seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transport to the remote knowledge service.
pub trait KnowledgeTransport: Send + Sync + Clone + 'static {
    /// Asks which of `urls` the service already knows.
    fn query(
        &self,
        urls: &[String],
        intelligence: IntelligenceLevel,
    ) -> impl Future<Output = Result<QueryResponse, AppError>> + Send;

    /// Submits newly produced data.
    fn teach(
        &self,
        entries: &[TeachEntry],
    ) -> impl Future<Output = Result<TeachResponse, AppError>> + Send;

    fn stats(&self) -> impl Future<Output = Result<ServiceStats, AppError>> + Send;
}

/// Destination for items produced by a request handler.
///
/// Object safe so a request context can carry any host sink.
pub trait DataSink: Send + Sync {
    fn push(&self, item: serde_json::Value) -> BoxFuture<'_, Result<(), AppError>>;

    /// Whether pushes through this sink already teach the knowledge service.
    fn learns(&self) -> bool {
        false
    }
}

/// The part of a knowledge client that a request scope needs: submitting
/// data for a URL. Never fails; refusals come back as a non-accepted response.
pub trait Learner: Send + Sync {
    fn learn(&self, url: String, data: serde_json::Value) -> BoxFuture<'_, TeachResponse>;
}
