//! Inheritance merge: turn a chain of [`ProfileSource`] values (root first,
//! most-derived last) into one concrete [`Profile`].
//!
//! Rules: `system` prompts concatenate parent-then-child joined by a blank
//! line; model parameters override field-wise (child wins when set);
//! `few_shot` and `policy` lists concatenate parent-then-child, so a child's
//! policy entries are evaluated after, and so take priority ties over,
//! the parent's; `response_schema.required_fields` and `allowed_actions`
//! concatenate and dedup, `confidence_range`/`max_reasons` override when the
//! child sets them; `calibration` overrides field-wise.

use super::types::{LocalCalibration, ModelParams, Profile, ProfileSource, ResponseSchema};
use crate::config::ClassifierConfig;

/// Build the concrete [`Profile`] for a root source (no `inherits_from`),
/// filling any still-unset model parameters from classifier defaults.
pub fn merge_root(source: &ProfileSource, defaults: &ClassifierConfig) -> Profile {
    Profile {
        id: source.id.clone(),
        version: source.version.clone(),
        depends_on: source.depends_on.clone(),
        conditional_execution: source.conditional_execution.clone(),
        model: source
            .model_params
            .model
            .clone()
            .unwrap_or_else(|| defaults.default_model.clone()),
        temperature: source.model_params.temperature.unwrap_or(0.0),
        max_output_tokens: source.model_params.max_output_tokens.unwrap_or(512),
        per_call_timeout_ms: source
            .model_params
            .per_call_timeout_ms
            .unwrap_or(defaults.per_call_timeout_ms),
        system: source.system.clone().unwrap_or_default(),
        few_shot: source.few_shot.clone(),
        response_schema: source.response_schema.clone().unwrap_or_default(),
        policy: source.policy.clone(),
        default_action: source.default_action.clone().unwrap_or_else(|| "none".to_string()),
        calibration: source.calibration.clone(),
        tags: source.tags.clone(),
    }
}

/// Merge a child source onto an already-merged parent [`Profile`].
pub fn merge_child(parent: &Profile, child: &ProfileSource) -> Profile {
    let system = match &child.system {
        Some(child_system) if !parent.system.is_empty() => {
            format!("{}\n\n{}", parent.system, child_system)
        }
        Some(child_system) => child_system.clone(),
        None => parent.system.clone(),
    };

    Profile {
        id: child.id.clone(),
        version: child.version.clone(),
        depends_on: child.depends_on.clone(),
        conditional_execution: child
            .conditional_execution
            .clone()
            .or_else(|| parent.conditional_execution.clone()),
        model: merged_model_params(&parent.model, &child.model_params),
        temperature: child.model_params.temperature.unwrap_or(parent.temperature),
        max_output_tokens: child.model_params.max_output_tokens.unwrap_or(parent.max_output_tokens),
        per_call_timeout_ms: child
            .model_params
            .per_call_timeout_ms
            .unwrap_or(parent.per_call_timeout_ms),
        system,
        few_shot: {
            let mut combined = parent.few_shot.clone();
            combined.extend(child.few_shot.clone());
            combined
        },
        response_schema: merged_schema(&parent.response_schema, &child.response_schema),
        policy: {
            let mut combined = parent.policy.clone();
            combined.extend(child.policy.clone());
            combined
        },
        default_action: child.default_action.clone().unwrap_or_else(|| parent.default_action.clone()),
        calibration: merged_calibration(&parent.calibration, &child.calibration),
        tags: {
            let mut combined = parent.tags.clone();
            for tag in &child.tags {
                if !combined.contains(tag) {
                    combined.push(tag.clone());
                }
            }
            combined
        },
    }
}

fn merged_model_params(parent_model: &str, child: &ModelParams) -> String {
    child.model.clone().unwrap_or_else(|| parent_model.to_string())
}

fn merged_schema(parent: &ResponseSchema, child: &Option<ResponseSchema>) -> ResponseSchema {
    let Some(child) = child else { return parent.clone() };

    let mut required_fields = parent.required_fields.clone();
    for field in &child.required_fields {
        if !required_fields.contains(field) {
            required_fields.push(field.clone());
        }
    }

    let mut allowed_actions = parent.allowed_actions.clone();
    for action in &child.allowed_actions {
        if !allowed_actions.contains(action) {
            allowed_actions.push(action.clone());
        }
    }

    ResponseSchema {
        required_fields,
        allowed_actions,
        confidence_range: child.confidence_range.or(parent.confidence_range),
        max_reasons: child.max_reasons.or(parent.max_reasons),
    }
}

fn merged_calibration(parent: &LocalCalibration, child: &LocalCalibration) -> LocalCalibration {
    LocalCalibration {
        auth_failure_penalty: child.auth_failure_penalty.or(parent.auth_failure_penalty),
        trusted_sender_bonus: child.trusted_sender_bonus.or(parent.trusted_sender_bonus),
    }
}
