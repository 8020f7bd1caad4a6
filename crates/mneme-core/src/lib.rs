pub mod batcher;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod memory;
pub mod models;
pub mod scope;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use batcher::{BatchConfig, BatchExecutor, Batcher};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use client::KnowledgeClient;
pub use config::{AlwaysRun, KnowledgeConfig};
pub use error::AppError;
pub use handler::{
    AiContext, CrawlRequest, HandlerEvent, HandlerOutcome, HandlerReporter, HandlerWrapper,
    LearningSink, RequestContext, TracingHandlerReporter,
};
pub use memory::MemoryTransport;
pub use models::{
    IntelligenceLevel, KnowledgeResult, ServiceStats, TeachResponse, TeachStatus, UsageStats,
};
pub use scope::{RequestScope, spawn_in_scope};
pub use traits::{BoxFuture, DataSink, KnowledgeTransport, Learner};
