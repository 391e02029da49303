//! Profile data model: the declarative unit of classification behavior.

use serde::{Deserialize, Serialize};

/// A model-parameter set. Every field is optional in the on-disk
/// representation so a child profile can omit any of them and inherit the
/// parent's value field-wise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelParams {
    pub model: Option<String>,
    /// Temperature in [0, 2].
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u32>,
    pub per_call_timeout_ms: Option<u64>,
}

/// A single declared few-shot turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FewShotExample {
    pub input: serde_json::Value,
    pub output: serde_json::Value,
}

/// The schema a classifier response must satisfy for this profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseSchema {
    pub required_fields: Vec<String>,
    pub allowed_actions: Vec<String>,
    /// Inclusive confidence range, e.g. `[0.0, 1.0]`.
    pub confidence_range: Option<(f64, f64)>,
    pub max_reasons: Option<u32>,
}

/// One entry in a profile's ordered policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyCondition {
    pub expression: String,
    pub actions: Vec<String>,
    pub priority: i64,
    pub confidence_boost: Option<f64>,
}

/// Calibration coefficients local to a profile, applied after the
/// resolver's global coefficients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalCalibration {
    pub auth_failure_penalty: Option<f64>,
    pub trusted_sender_bonus: Option<f64>,
}

/// Gate on whether this profile runs at all, evaluated against already
/// completed sibling responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalExecution {
    pub when: String,
}

/// A profile as it exists on disk, before inheritance merge. All fields
/// that participate in inheritance are optional so "child omitted this" is
/// distinguishable from "child explicitly set this to a falsy value".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileSource {
    pub id: String,
    pub version: String,
    pub inherits_from: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub conditional_execution: Option<ConditionalExecution>,
    #[serde(default)]
    pub model_params: ModelParams,
    pub system: Option<String>,
    #[serde(default)]
    pub few_shot: Vec<FewShotExample>,
    pub response_schema: Option<ResponseSchema>,
    #[serde(default)]
    pub policy: Vec<PolicyCondition>,
    pub default_action: Option<String>,
    #[serde(default)]
    pub calibration: LocalCalibration,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A profile after inheritance merge, the form every other component
/// consumes. Every field that was optional pre-merge is now concrete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub version: String,
    pub depends_on: Vec<String>,
    pub conditional_execution: Option<ConditionalExecution>,
    pub model: String,
    pub temperature: f64,
    pub max_output_tokens: u32,
    pub per_call_timeout_ms: u64,
    pub system: String,
    pub few_shot: Vec<FewShotExample>,
    pub response_schema: ResponseSchema,
    pub policy: Vec<PolicyCondition>,
    pub default_action: String,
    pub calibration: LocalCalibration,
    pub tags: Vec<String>,
}

impl Profile {
    /// Parse the `MAJOR.MINOR[.PATCH]` version string into its components.
    pub fn parsed_version(&self) -> Option<(u64, u64, u64)> {
        let mut parts = self.version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some((major, minor, patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_and_three_part_versions() {
        let mut profile = bare_profile();
        profile.version = "1.2".to_string();
        assert_eq!(profile.parsed_version(), Some((1, 2, 0)));

        profile.version = "1.2.3".to_string();
        assert_eq!(profile.parsed_version(), Some((1, 2, 3)));
    }

    #[test]
    fn rejects_malformed_version() {
        let mut profile = bare_profile();
        profile.version = "not-a-version".to_string();
        assert_eq!(profile.parsed_version(), None);

        profile.version = "1.2.3.4".to_string();
        assert_eq!(profile.parsed_version(), None);
    }

    fn bare_profile() -> Profile {
        Profile {
            id: "test".to_string(),
            version: "1.0.0".to_string(),
            depends_on: Vec::new(),
            conditional_execution: None,
            model: "local-default".to_string(),
            temperature: 0.0,
            max_output_tokens: 256,
            per_call_timeout_ms: 5_000,
            system: String::new(),
            few_shot: Vec::new(),
            response_schema: ResponseSchema::default(),
            policy: Vec::new(),
            default_action: "none".to_string(),
            calibration: LocalCalibration::default(),
            tags: Vec::new(),
        }
    }
}
