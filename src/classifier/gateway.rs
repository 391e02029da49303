//! Ties prompt assembly, the circuit breaker, the retry policy, and
//! response parsing into the single call the orchestrator makes per
//! (message, profile) pair.

use std::sync::Arc;

use tracing::{info_span, Instrument};

use super::breaker::CircuitBreaker;
use super::retry::{with_retry, BackoffPolicy};
use super::{parse, ClassificationResponse, InferenceAdapter};
use crate::audit::AuditChain;
use crate::config::ClassifierConfig;
use crate::error::{Error, Result};
use crate::message::Payload;
use crate::profile::types::Profile;

pub struct ClassifierGateway {
    adapter: Arc<dyn InferenceAdapter>,
    breaker: CircuitBreaker,
    backoff: BackoffPolicy,
}

impl ClassifierGateway {
    pub fn new(adapter: Arc<dyn InferenceAdapter>, config: &ClassifierConfig) -> Self {
        Self {
            adapter,
            breaker: CircuitBreaker::new("classifier", config),
            backoff: BackoffPolicy::from_classifier_config(config),
        }
    }

    /// As [`Self::new`], but the circuit breaker records every open/
    /// half-open/close transition as a `config_changed` audit entry.
    pub fn with_audit(adapter: Arc<dyn InferenceAdapter>, config: &ClassifierConfig, audit: Arc<AuditChain>) -> Self {
        Self {
            adapter,
            breaker: CircuitBreaker::new("classifier", config).with_audit(audit),
            backoff: BackoffPolicy::from_classifier_config(config),
        }
    }

    pub async fn classify(&self, profile: &Profile, payload: &Payload) -> Result<ClassificationResponse> {
        let span = info_span!("classify", message_id = %payload.message_id, profile_id = %profile.id);
        async {
            let prompt = assemble_prompt(profile, payload);

            with_retry(
                &self.backoff,
                |e| matches!(e, Error::Transient { .. } | Error::SchemaError { .. }),
                || async {
                    self.breaker.admit()?;
                    let raw = match self
                        .adapter
                        .chat(
                            &profile.model,
                            &profile.system,
                            &prompt,
                            profile.temperature,
                            profile.max_output_tokens,
                            profile.per_call_timeout_ms,
                        )
                        .await
                    {
                        Ok(text) => {
                            self.breaker.record_success();
                            text
                        }
                        Err(e) => {
                            self.breaker.record_failure();
                            return Err(e);
                        }
                    };

                    parse::parse_response(&raw, profile)
                },
            )
            .await
        }
        .instrument(span)
        .await
    }
}

/// Render the features extracted from a message, the profile's few-shot
/// examples, and the response-schema contract into a single user turn. The
/// system prompt (already merged from any `inherits_from` chain) carries
/// the profile's persona and policy guidance; this carries the instance.
fn assemble_prompt(profile: &Profile, payload: &Payload) -> String {
    let mut sections = Vec::new();

    if !profile.few_shot.is_empty() {
        let mut examples = String::from("Examples:\n");
        for example in &profile.few_shot {
            examples.push_str(&format!(
                "input: {}\noutput: {}\n",
                example.input, example.output
            ));
        }
        sections.push(examples);
    }

    sections.push(format!(
        "Classify this message and respond with a single JSON object containing: {}.",
        profile.response_schema.required_fields.join(", ")
    ));

    if !profile.response_schema.allowed_actions.is_empty() {
        sections.push(format!(
            "The \"action\" field must be one of: {}.",
            profile.response_schema.allowed_actions.join(", ")
        ));
    }

    sections.push(format!(
        "Message:\n{}",
        serde_json::to_string_pretty(payload).unwrap_or_default()
    ));

    sections.join("\n\n")
}
