//! Policy Evaluator: select a profile's candidate action(s) for one
//! calibrated response by walking its ordered policy in declared order.

use crate::classifier::ClassificationResponse;
use crate::error::{Error, Result};
use crate::message::Payload;
use crate::profile::types::Profile;

use super::expr::{self, EvalContext};

/// The result of evaluating one profile's policy against one response:
/// the action list the matching condition (or the default action)
/// contributed, the confidence after any boost, and the expression that
/// matched, if any.
pub struct PolicyOutcome {
    pub actions: Vec<String>,
    pub confidence: f64,
    pub matched_expression: Option<String>,
}

/// Build the JSON object policy/priority expressions evaluate field
/// access against: the response's own fields at the top level, the
/// payload nested under `payload`.
pub fn eval_subject(response: &ClassificationResponse, payload: &Payload) -> serde_json::Value {
    let mut value = response.as_json();
    if let serde_json::Value::Object(ref mut map) = value {
        map.insert(
            "payload".to_string(),
            serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        );
    }
    value
}

/// Evaluate `profile.policy` in declared order against `response`/`payload`
/// and return the first match's actions, or the profile's default action.
pub fn select_actions(profile: &Profile, response: &ClassificationResponse, payload: &Payload) -> Result<PolicyOutcome> {
    let subject = eval_subject(response, payload);
    let ctx = EvalContext::new(&subject);

    for condition in &profile.policy {
        let parsed = expr::parse(&condition.expression)
            .map_err(|e| Error::schema_error(profile.id.clone(), format!("policy expression became invalid: {e}")))?;
        let matched = expr::eval(&parsed, &ctx)
            .map_err(|e| Error::schema_error(profile.id.clone(), format!("policy expression failed to evaluate: {e}")))?;

        if matched.truthy() {
            let confidence = (response.confidence + condition.confidence_boost.unwrap_or(0.0)).clamp(0.0, 1.0);
            return Ok(PolicyOutcome {
                actions: condition.actions.clone(),
                confidence,
                matched_expression: Some(condition.expression.clone()),
            });
        }
    }

    Ok(PolicyOutcome {
        actions: vec![profile.default_action.clone()],
        confidence: response.confidence,
        matched_expression: None,
    })
}

/// Split a profile's or priority rule's action list into the primary
/// disposition (`star`/`archive`/`none`, the last one wins if more than
/// one is somehow present) and the `label:X` entries, stripped of prefix.
pub fn split_actions(actions: &[String]) -> (String, Vec<String>) {
    let mut primary = "none".to_string();
    let mut labels = Vec::new();
    for action in actions {
        match action.strip_prefix("label:") {
            Some(label) => labels.push(label.to_string()),
            None => primary = action.clone(),
        }
    }
    (primary, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierConfig;
    use crate::profile::merge::merge_root;
    use crate::profile::types::{PolicyCondition, ProfileSource};

    fn response(action: &str, confidence: f64) -> ClassificationResponse {
        ClassificationResponse {
            action: action.to_string(),
            confidence,
            reasons: Vec::new(),
            labels: Vec::new(),
            extra: Default::default(),
        }
    }

    fn payload() -> Payload {
        crate::message::extract_payload(
            &crate::message::Message {
                id: "m1".to_string(),
                thread_id: "t1".to_string(),
                headers: Default::default(),
                subject: String::new(),
                body: String::new(),
                link_hosts: Vec::new(),
                html_body: None,
                labels: Vec::new(),
                size_bytes: 0,
                attachments: Vec::new(),
                allowlist: Vec::new(),
                denylist: Vec::new(),
                sender_reputation: Default::default(),
            },
            &Default::default(),
        )
    }

    fn profile_with_policy(policy: Vec<PolicyCondition>) -> Profile {
        let source = ProfileSource {
            id: "spam".to_string(),
            version: "1.0.0".to_string(),
            inherits_from: None,
            depends_on: Vec::new(),
            conditional_execution: None,
            model_params: Default::default(),
            system: None,
            few_shot: Vec::new(),
            response_schema: None,
            policy,
            default_action: Some("none".to_string()),
            calibration: Default::default(),
            tags: Vec::new(),
        };
        merge_root(&source, &ClassifierConfig::default())
    }

    #[test]
    fn first_matching_condition_wins() {
        let profile = profile_with_policy(vec![
            PolicyCondition {
                expression: "confidence > 0.9".to_string(),
                actions: vec!["archive".to_string()],
                priority: 1,
                confidence_boost: None,
            },
            PolicyCondition {
                expression: "confidence > 0.1".to_string(),
                actions: vec!["star".to_string()],
                priority: 2,
                confidence_boost: None,
            },
        ]);
        let outcome = select_actions(&profile, &response("archive", 0.5), &payload()).unwrap();
        assert_eq!(outcome.actions, vec!["star".to_string()]);
    }

    #[test]
    fn falls_back_to_default_action_when_nothing_matches() {
        let profile = profile_with_policy(vec![PolicyCondition {
            expression: "confidence > 0.99".to_string(),
            actions: vec!["archive".to_string()],
            priority: 1,
            confidence_boost: None,
        }]);
        let outcome = select_actions(&profile, &response("archive", 0.2), &payload()).unwrap();
        assert_eq!(outcome.actions, vec!["none".to_string()]);
    }

    #[test]
    fn confidence_boost_is_applied_and_clamped() {
        let profile = profile_with_policy(vec![PolicyCondition {
            expression: "confidence > 0.5".to_string(),
            actions: vec!["archive".to_string()],
            priority: 1,
            confidence_boost: Some(0.5),
        }]);
        let outcome = select_actions(&profile, &response("archive", 0.8), &payload()).unwrap();
        assert_eq!(outcome.confidence, 1.0);
    }

    #[test]
    fn splits_primary_action_from_labels() {
        let (primary, labels) = split_actions(&[
            "archive".to_string(),
            "label:Phishing".to_string(),
            "label:Reviewed".to_string(),
        ]);
        assert_eq!(primary, "archive");
        assert_eq!(labels, vec!["Phishing".to_string(), "Reviewed".to_string()]);
    }
}
