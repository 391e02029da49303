//! Decision Resolver: combines every profile's calibrated, policy-selected
//! candidate into one final [`Decision`] under priority overrides,
//! consensus, star/archive reconciliation, and safety gates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::classifier::ClassificationResponse;
use crate::config::{CalibrationConfig, ConsensusMethod, ResolverConfig, ResolverPriorityRule, SafetyGateConfig};
use crate::error::Result;
use crate::message::Payload;
use crate::policy;
use crate::profile::types::Profile;

/// The system label archiving removes. Shared with the planner so the
/// decision and the mailbox operation it produces agree on the name.
pub const INBOX_LABEL: &str = "INBOX";

/// One profile's classifier response, paired with the profile that
/// produced it.
pub struct ProfileResult {
    pub profile: Profile,
    pub response: ClassificationResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub action: String,
    pub confidence: f64,
    pub labels_to_add: Vec<String>,
    pub labels_to_remove: Vec<String>,
    /// The profile whose policy/priority-rule produced the winning action,
    /// for the planner's provenance label. `None` only when no profile ran
    /// at all.
    pub winning_profile_id: Option<String>,
    pub resolution_path: Vec<String>,
    pub dry_run: bool,
    /// SHA-256 over the decision's own content, for idempotency checks and
    /// audit-entry fingerprinting independent of the message it was made for.
    pub content_hash: String,
}

fn content_hash(action: &str, confidence: f64, labels_to_add: &[String], labels_to_remove: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action.as_bytes());
    hasher.update(format!("{confidence:.6}").as_bytes());
    for label in labels_to_add {
        hasher.update(b"+");
        hasher.update(label.as_bytes());
    }
    for label in labels_to_remove {
        hasher.update(b"-");
        hasher.update(label.as_bytes());
    }
    hex::encode(hasher.finalize())
}

struct Candidate {
    profile_id: String,
    action: String,
    confidence: f64,
    labels: Vec<String>,
    weight: f64,
}

/// Run the full six-step pipeline: conditional gating is the caller's
/// responsibility (it decides which profiles even ran), so this starts
/// from already-completed results.
pub fn resolve(
    payload: &Payload,
    results: &[ProfileResult],
    resolver_config: &ResolverConfig,
    calibration_config: &CalibrationConfig,
    safety_gates: &SafetyGateConfig,
    dry_run: bool,
) -> Result<Decision> {
    let mut resolution_path = Vec::new();
    let mut candidates = Vec::new();
    let mut calibrated_jsons = Vec::new();

    for result in results {
        let (calibrated_confidence, deltas) =
            calibrate(result.response.confidence, payload, calibration_config, &result.profile.calibration);
        for delta in &deltas {
            resolution_path.push(format!("calibrated:{},{delta}", result.profile.id));
        }

        let mut calibrated_response = result.response.clone();
        calibrated_response.confidence = calibrated_confidence;

        let outcome = policy::select_actions(&result.profile, &calibrated_response, payload)?;
        let (primary, labels) = policy::split_actions(&outcome.actions);

        calibrated_jsons.push(policy::eval_subject(&calibrated_response, payload));
        candidates.push(Candidate {
            profile_id: result.profile.id.clone(),
            action: primary,
            confidence: outcome.confidence,
            labels,
            weight: resolver_config.weight_for(&result.profile.id),
        });
    }

    let mut winner = match fire_priority_rule(&resolver_config.priority_rules, payload, &calibrated_jsons)? {
        Some((rule, label)) => {
            resolution_path.push(format!("priority:{}", rule.expression));
            Winner {
                action: rule.action.clone(),
                confidence: (label.confidence_at_fire + rule.confidence_boost.unwrap_or(0.0)).clamp(0.0, 1.0),
                from_priority_rule: true,
                override_gates: rule.override_gates,
            }
        }
        None => {
            let (action, confidence, method_name) = consensus(&candidates, resolver_config);
            resolution_path.push(format!("consensus:{method_name}"));
            Winner {
                action,
                confidence,
                from_priority_rule: false,
                override_gates: false,
            }
        }
    };

    reconcile_star_archive(&mut winner, &candidates, resolver_config.star_archive_margin, &mut resolution_path);
    prefer_decisive_over_none(&mut winner, &candidates, &mut resolution_path);

    let gate = gate_for(&winner.action, safety_gates);
    if let Some(threshold) = gate {
        if winner.confidence < threshold && !(winner.from_priority_rule && winner.override_gates) {
            resolution_path.push(format!("gated:{}", gate_name(&winner.action)));
            winner.action = "none".to_string();
        }
    }

    let mut labels_to_add: Vec<String> = Vec::new();
    for candidate in &candidates {
        for label in &candidate.labels {
            let threshold = if label.starts_with("Security/") {
                safety_gates.security_label_threshold.unwrap_or(safety_gates.label_threshold)
            } else {
                safety_gates.label_threshold
            };
            if candidate.confidence < threshold {
                resolution_path.push(format!("label_gated:{label}"));
                continue;
            }
            if !labels_to_add.contains(label) {
                labels_to_add.push(label.clone());
            }
        }
    }

    let labels_to_remove = if winner.action == "archive" { vec![INBOX_LABEL.to_string()] } else { Vec::new() };
    let winning_profile_id = attribute_winner(&winner.action, &candidates).map(str::to_string);
    let hash = content_hash(&winner.action, winner.confidence, &labels_to_add, &labels_to_remove);

    Ok(Decision {
        action: winner.action,
        confidence: winner.confidence,
        labels_to_add,
        labels_to_remove,
        winning_profile_id,
        resolution_path,
        dry_run,
        content_hash: hash,
    })
}

/// The candidate whose own action matches the winning action, breaking ties
/// by confidence; falls back to the single most confident candidate when no
/// candidate's raw action matches (priority rules and star/archive
/// reconciliation can both pick an action no individual profile proposed).
/// `None` only when no profile ran at all.
fn attribute_winner<'a>(winner_action: &str, candidates: &'a [Candidate]) -> Option<&'a str> {
    let by_action = candidates
        .iter()
        .filter(|c| c.action == winner_action)
        .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal));

    by_action
        .or_else(|| candidates.iter().max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal)))
        .map(|c| c.profile_id.as_str())
}

struct Winner {
    action: String,
    confidence: f64,
    from_priority_rule: bool,
    override_gates: bool,
}

fn calibrate(confidence: f64, payload: &Payload, global: &CalibrationConfig, local: &crate::profile::types::LocalCalibration) -> (f64, Vec<String>) {
    let mut c = confidence;
    let mut applied = Vec::new();

    let auth_failed = payload.spf.is_fail() || payload.dkim.is_fail() || payload.dmarc.is_fail();
    if auth_failed {
        let delta = local.auth_failure_penalty.unwrap_or(global.auth_failure_penalty);
        c += delta;
        applied.push(format!("auth_failure:{delta:+.2}"));
    }

    if payload.sender_reputation.trust_score >= global.trust_threshold {
        let delta = local.trusted_sender_bonus.unwrap_or(global.trusted_sender_bonus);
        c += delta;
        applied.push(format!("trusted_sender:{delta:+.2}"));
    }

    (c.clamp(0.0, 1.0), applied)
}

struct FiredRuleContext {
    confidence_at_fire: f64,
}

/// Evaluate the resolver's cross-profile priority rules in
/// priority-descending order (ties broken by declaration order); the
/// first whose expression is true wins outright.
fn fire_priority_rule<'a>(
    rules: &'a [ResolverPriorityRule],
    payload: &Payload,
    sibling_responses: &[serde_json::Value],
) -> Result<Option<(&'a ResolverPriorityRule, FiredRuleContext)>> {
    let mut ordered: Vec<&ResolverPriorityRule> = rules.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let subject = serde_json::json!({ "payload": payload });

    for rule in ordered {
        let parsed = policy::parse(&rule.expression)
            .map_err(|e| crate::error::Error::validation("resolver.priority_rules", e.to_string()))?;
        let ctx = policy::EvalContext::with_siblings(&subject, sibling_responses);
        let matched = policy::eval(&parsed, &ctx)
            .map_err(|e| crate::error::Error::validation("resolver.priority_rules", e.to_string()))?;
        if matched.truthy() {
            let confidence_at_fire = sibling_responses
                .iter()
                .filter_map(|v| v.get("confidence").and_then(|c| c.as_f64()))
                .fold(0.0_f64, f64::max);
            return Ok(Some((rule, FiredRuleContext { confidence_at_fire })));
        }
    }
    Ok(None)
}

/// Aggregate per-action scores under the configured consensus method and
/// return the winner plus the method's display name for the trace.
fn consensus(candidates: &[Candidate], config: &ResolverConfig) -> (String, f64, &'static str) {
    let scores = action_scores(candidates, config.method);
    let (action, confidence) = pick_max(&scores);
    let method_name = match config.method {
        ConsensusMethod::HighestConfidence => "highest_confidence",
        ConsensusMethod::Consensus => "consensus",
        ConsensusMethod::WeightedAverage => "weighted_average",
    };
    (action, confidence, method_name)
}

/// Per action: a ranking score used only to pick the winner, and the
/// confidence actually reported on the `Decision`. The two differ for
/// `consensus` (tie-break score vs. mean agreeing confidence) and
/// `weighted_average` (sum vs. sum/Σw), so neither method's internal
/// ranking heuristic leaks into the audit trail as a confidence value.
fn action_scores(candidates: &[Candidate], method: ConsensusMethod) -> BTreeMap<String, (f64, f64)> {
    match method {
        ConsensusMethod::HighestConfidence => {
            let mut scores: BTreeMap<String, (f64, f64)> = BTreeMap::new();
            for candidate in candidates {
                let entry = scores.entry(candidate.action.clone()).or_insert((0.0, 0.0));
                if candidate.confidence > entry.0 {
                    *entry = (candidate.confidence, candidate.confidence);
                }
            }
            scores
        }
        ConsensusMethod::Consensus => {
            let mut counts: BTreeMap<String, (u32, f64)> = BTreeMap::new();
            for candidate in candidates {
                let entry = counts.entry(candidate.action.clone()).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += candidate.confidence;
            }
            counts
                .into_iter()
                .map(|(action, (count, total))| {
                    let tie_break_score = count as f64 + total / 1000.0;
                    let mean_confidence = total / count as f64;
                    (action, (tie_break_score, mean_confidence))
                })
                .collect()
        }
        ConsensusMethod::WeightedAverage => {
            let mut weighted: BTreeMap<String, (f64, f64)> = BTreeMap::new();
            for candidate in candidates {
                let entry = weighted.entry(candidate.action.clone()).or_insert((0.0, 0.0));
                entry.0 += candidate.weight * candidate.confidence;
                entry.1 += candidate.weight;
            }
            weighted
                .into_iter()
                .map(|(action, (sum, total_weight))| {
                    let avg = if total_weight > 0.0 { sum / total_weight } else { 0.0 };
                    (action, (sum, avg))
                })
                .collect()
        }
    }
}

fn pick_max(scores: &BTreeMap<String, (f64, f64)>) -> (String, f64) {
    scores
        .iter()
        .max_by(|a, b| (a.1).0.partial_cmp(&(b.1).0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(action, (_, confidence))| (action.clone(), *confidence))
        .unwrap_or_else(|| ("none".to_string(), 0.0))
}

/// Star wins over archive unless archive's aggregate confidence exceeds
/// star's by at least `margin`.
fn reconcile_star_archive(winner: &mut Winner, candidates: &[Candidate], margin: f64, resolution_path: &mut Vec<String>) {
    if winner.from_priority_rule {
        return;
    }

    let star_confidence = candidates.iter().filter(|c| c.action == "star").map(|c| c.confidence).fold(None, max_opt);
    let archive_confidence = candidates.iter().filter(|c| c.action == "archive").map(|c| c.confidence).fold(None, max_opt);

    if let (Some(star), Some(archive)) = (star_confidence, archive_confidence) {
        let should_be_star = archive - star < margin;
        if should_be_star && winner.action != "star" {
            resolution_path.push("reconcile:star_over_archive".to_string());
            winner.action = "star".to_string();
            winner.confidence = star;
        } else if !should_be_star && winner.action != "archive" {
            resolution_path.push("reconcile:archive_exceeds_margin".to_string());
            winner.action = "archive".to_string();
            winner.confidence = archive;
        }
    }
}

fn max_opt(acc: Option<f64>, value: f64) -> Option<f64> {
    Some(acc.map_or(value, |a| a.max(value)))
}

/// A winning `none` never overrides a candidate with real support from at
/// least one profile.
fn prefer_decisive_over_none(winner: &mut Winner, candidates: &[Candidate], resolution_path: &mut Vec<String>) {
    if winner.from_priority_rule || winner.action != "none" {
        return;
    }
    if let Some(best) = candidates
        .iter()
        .filter(|c| c.action != "none")
        .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
    {
        resolution_path.push(format!("reconcile:decisive_over_none:{}", best.profile_id));
        winner.action = best.action.clone();
        winner.confidence = best.confidence;
    }
}

fn gate_for(action: &str, gates: &SafetyGateConfig) -> Option<f64> {
    match action {
        "archive" => Some(gates.archive_threshold),
        "star" => Some(gates.star_threshold),
        "none" => None,
        _ => None,
    }
}

fn gate_name(action: &str) -> &str {
    action
}

/// Evaluate a profile's `conditional_execution.when` against already
/// completed sibling responses, keyed by profile id. No `conditional_execution`
/// means the profile always runs.
pub fn should_execute(profile: &Profile, completed: &BTreeMap<String, serde_json::Value>) -> Result<bool> {
    let Some(cond) = &profile.conditional_execution else {
        return Ok(true);
    };

    let subject = serde_json::Value::Object(completed.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    let parsed = policy::parse(&cond.when)
        .map_err(|e| crate::error::Error::validation("profile.conditional_execution", e.to_string()))?;
    let ctx = policy::EvalContext::new(&subject);
    let result = policy::eval(&parsed, &ctx)
        .map_err(|e| crate::error::Error::validation("profile.conditional_execution", e.to_string()))?;
    Ok(result.truthy())
}
