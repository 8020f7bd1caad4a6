use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How much effort the knowledge service should spend recognising a URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntelligenceLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl IntelligenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntelligenceLevel::Low => "low",
            IntelligenceLevel::Medium => "medium",
            IntelligenceLevel::High => "high",
        }
    }
}

impl fmt::Display for IntelligenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IntelligenceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(IntelligenceLevel::Low),
            "medium" => Ok(IntelligenceLevel::Medium),
            "high" => Ok(IntelligenceLevel::High),
            _ => Err(format!("Unknown intelligence level: {}", s)),
        }
    }
}

/// Answer to "does the knowledge service already know this URL?".
///
/// `fallback = true` marks a degraded default produced locally (open
/// circuit, timeout, failed batch). A fallback never claims `known`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeResult {
    pub known: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// In `[0, 1]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

impl KnowledgeResult {
    /// The service authoritatively does not know the URL.
    pub fn unknown() -> Self {
        Self {
            known: false,
            data: None,
            confidence: None,
            fallback: false,
        }
    }

    /// Degraded answer used when the real one cannot be obtained.
    pub fn fallback() -> Self {
        Self {
            fallback: true,
            ..Self::unknown()
        }
    }

    pub fn known(data: serde_json::Value, confidence: f64) -> Self {
        Self {
            known: true,
            data: Some(data),
            confidence: Some(confidence.clamp(0.0, 1.0)),
            fallback: false,
        }
    }
}

// ---- Knowledge service wire types ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub urls: Vec<String>,
    pub intelligence: IntelligenceLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownEntry {
    pub url: String,
    pub data: serde_json::Value,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub known: Vec<KnownEntry>,
    #[serde(default)]
    pub unknown: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeachEntry {
    pub url: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeachRequest {
    pub entries: Vec<TeachEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeachStatus {
    Accepted,
    Rejected,
    Flagged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeachResponse {
    pub status: TeachStatus,
    #[serde(default)]
    pub learned: u32,
}

impl TeachResponse {
    pub fn accepted(learned: u32) -> Self {
        Self {
            status: TeachStatus::Accepted,
            learned,
        }
    }

    /// Non-accepted outcome used for local refusals and contained failures.
    pub fn rejected() -> Self {
        Self {
            status: TeachStatus::Rejected,
            learned: 0,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == TeachStatus::Accepted
    }
}

/// Aggregate statistics reported by the knowledge service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub queries: u64,
    pub recognized: u64,
    pub recognition_rate: f64,
    pub learned: u64,
    pub period: String,
}

/// Process-local usage counters kept by a `KnowledgeClient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub queries: u64,
    pub recognized: u64,
    pub learned: u64,
    pub since: DateTime<Utc>,
}
