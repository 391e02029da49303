//! Classifier Gateway: assembles a prompt from a profile and a message's
//! extracted features, calls an inference adapter under a circuit breaker
//! and bounded retry policy, and parses the response through an ordered
//! fallback chain before schema-validating it.

pub mod adapter;
pub mod breaker;
pub mod gateway;
pub mod parse;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A classifier's structured verdict on one message, from one profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResponse {
    pub action: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Any additional fields the model returned, preserved so policy
    /// expressions can reference them without the schema needing to name
    /// every possible field up front.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ClassificationResponse {
    /// Render as a JSON value for policy-expression evaluation.
    pub fn as_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A single call to the underlying model, independent of retry/breaker
/// policy. Implementations are expected to be loopback-only; see
/// [`adapter::HttpInferenceAdapter`].
#[async_trait]
pub trait InferenceAdapter: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        temperature: f64,
        max_output_tokens: u32,
        timeout_ms: u64,
    ) -> Result<String>;
}
