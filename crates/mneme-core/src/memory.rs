//! In-process knowledge service.
//!
//! Backs the CLI's `--offline` mode and the integration tests. Every URL it
//! has been taught is known with confidence 1.0.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::AppError;
use crate::models::{
    IntelligenceLevel, KnownEntry, QueryResponse, ServiceStats, TeachEntry, TeachResponse,
    TeachStatus,
};
use crate::traits::KnowledgeTransport;

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, serde_json::Value>,
    queries: u64,
    recognized: u64,
    learned: u64,
}

/// A [`KnowledgeTransport`] that keeps everything in a shared map.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stores `data` for `url` directly, without counting it as learned.
    pub fn insert(&self, url: impl Into<String>, data: serde_json::Value) {
        self.lock_state().entries.insert(url.into(), data);
    }

    pub fn get(&self, url: &str) -> Option<serde_json::Value> {
        self.lock_state().entries.get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn answer(&self, urls: &[String]) -> QueryResponse {
        let mut state = self.lock_state();
        let mut response = QueryResponse::default();
        for url in urls {
            match state.entries.get(url) {
                Some(data) => response.known.push(KnownEntry {
                    url: url.clone(),
                    data: data.clone(),
                    confidence: 1.0,
                }),
                None => response.unknown.push(url.clone()),
            }
        }
        state.queries += urls.len() as u64;
        state.recognized += response.known.len() as u64;
        response
    }

    fn store(&self, entries: &[TeachEntry]) -> TeachResponse {
        let mut state = self.lock_state();
        let mut learned = 0u32;
        for entry in entries {
            // Nothing to remember for an empty payload.
            if entry.data.is_null() {
                continue;
            }
            state.entries.insert(entry.url.clone(), entry.data.clone());
            learned += 1;
        }
        state.learned += u64::from(learned);

        if learned == 0 && !entries.is_empty() {
            TeachResponse {
                status: TeachStatus::Flagged,
                learned: 0,
            }
        } else {
            TeachResponse::accepted(learned)
        }
    }

    fn snapshot(&self) -> ServiceStats {
        let state = self.lock_state();
        let recognition_rate = if state.queries == 0 {
            0.0
        } else {
            state.recognized as f64 / state.queries as f64
        };
        ServiceStats {
            queries: state.queries,
            recognized: state.recognized,
            recognition_rate,
            learned: state.learned,
            period: "process".to_string(),
        }
    }
}

impl KnowledgeTransport for MemoryTransport {
    async fn query(
        &self,
        urls: &[String],
        _intelligence: IntelligenceLevel,
    ) -> Result<QueryResponse, AppError> {
        Ok(self.answer(urls))
    }

    async fn teach(&self, entries: &[TeachEntry]) -> Result<TeachResponse, AppError> {
        Ok(self.store(entries))
    }

    async fn stats(&self) -> Result<ServiceStats, AppError> {
        Ok(self.snapshot())
    }
}
