//! Action Planner: turns a [`Decision`] plus the current label set into a
//! minimal, idempotent set of mailbox operations.

use serde::{Deserialize, Serialize};

use crate::config::ActionPlannerConfig;
use crate::resolver::Decision;

pub const STARRED_LABEL: &str = "STARRED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxOperation {
    pub message_id: String,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

impl MailboxOperation {
    fn is_noop(&self) -> bool {
        self.add_labels.is_empty() && self.remove_labels.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub message_id: String,
    pub operations: Vec<MailboxOperation>,
    pub idempotent_noop: bool,
    pub dry_run: bool,
}

/// The decision carries its own `winning_profile_id` (set by the resolver,
/// which is the only component with enough context to attribute a final
/// action to a profile) for the provenance label. `None` only when no
/// profile ran at all.
pub fn plan(
    message_id: &str,
    decision: &Decision,
    current_labels: &[String],
    dry_run: bool,
    config: &ActionPlannerConfig,
) -> Plan {
    let mut add_labels = Vec::new();
    let mut remove_labels = Vec::new();

    if decision.action == "star" {
        ensure_present(&mut add_labels, current_labels, STARRED_LABEL);
    }

    for label in &decision.labels_to_remove {
        ensure_absent(&mut remove_labels, current_labels, label);
    }

    for label in &decision.labels_to_add {
        let full = format!("MailSentinel/{label}");
        ensure_present(&mut add_labels, current_labels, &full);
    }

    let label_none = decision.action != "none" || config.label_none_actions;
    if label_none {
        if let Some(profile_id) = &decision.winning_profile_id {
            let provenance = format!("MailSentinel/{profile_id}/{}", decision.action);
            ensure_present(&mut add_labels, current_labels, &provenance);
        }
    }

    let operation = MailboxOperation {
        message_id: message_id.to_string(),
        add_labels,
        remove_labels,
    };

    let idempotent_noop = operation.is_noop();
    let operations = if idempotent_noop { Vec::new() } else { vec![operation] };

    Plan {
        message_id: message_id.to_string(),
        operations,
        idempotent_noop,
        dry_run,
    }
}

fn ensure_present(add_labels: &mut Vec<String>, current_labels: &[String], label: &str) {
    if !current_labels.iter().any(|l| l == label) && !add_labels.iter().any(|l| l == label) {
        add_labels.push(label.to_string());
    }
}

fn ensure_absent(remove_labels: &mut Vec<String>, current_labels: &[String], label: &str) {
    if current_labels.iter().any(|l| l == label) && !remove_labels.iter().any(|l| l == label) {
        remove_labels.push(label.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(action: &str, labels_to_add: Vec<String>, winning_profile_id: Option<&str>) -> Decision {
        let labels_to_remove = if action == "archive" { vec!["INBOX".to_string()] } else { Vec::new() };
        Decision {
            action: action.to_string(),
            confidence: 0.9,
            labels_to_add,
            labels_to_remove,
            winning_profile_id: winning_profile_id.map(str::to_string),
            resolution_path: Vec::new(),
            dry_run: false,
            content_hash: String::new(),
        }
    }

    #[test]
    fn star_action_adds_starred_and_provenance_label() {
        let plan = plan("m1", &decision("star", Vec::new(), Some("invoices")), &[], false, &ActionPlannerConfig::default());
        assert_eq!(plan.operations.len(), 1);
        assert!(plan.operations[0].add_labels.contains(&"STARRED".to_string()));
        assert!(plan.operations[0].add_labels.contains(&"MailSentinel/invoices/star".to_string()));
        assert!(!plan.idempotent_noop);
    }

    #[test]
    fn archive_action_removes_inbox_only_if_present() {
        let current = vec!["INBOX".to_string()];
        let plan = plan("m1", &decision("archive", Vec::new(), Some("spam")), &current, false, &ActionPlannerConfig::default());
        assert_eq!(plan.operations[0].remove_labels, vec!["INBOX".to_string()]);

        let plan_already_archived = plan_with_no_inbox();
        assert!(plan_already_archived.operations.iter().all(|op| op.remove_labels.is_empty()));
    }

    fn plan_with_no_inbox() -> Plan {
        plan("m1", &decision("archive", Vec::new(), Some("spam")), &[], false, &ActionPlannerConfig::default())
    }

    #[test]
    fn already_applied_decision_yields_zero_operations() {
        let current = vec!["STARRED".to_string(), "MailSentinel/invoices/star".to_string()];
        let plan = plan("m1", &decision("star", Vec::new(), Some("invoices")), &current, false, &ActionPlannerConfig::default());
        assert!(plan.idempotent_noop);
        assert!(plan.operations.is_empty());
    }

    #[test]
    fn none_action_gets_no_provenance_label_by_default() {
        let plan = plan("m1", &decision("none", Vec::new(), Some("spam")), &[], false, &ActionPlannerConfig::default());
        assert!(plan.idempotent_noop);
    }

    #[test]
    fn none_action_gets_provenance_label_when_configured() {
        let config = ActionPlannerConfig { label_none_actions: true };
        let plan = plan("m1", &decision("none", Vec::new(), Some("spam")), &[], false, &config);
        assert!(plan.operations[0].add_labels.contains(&"MailSentinel/spam/none".to_string()));
    }

    #[test]
    fn dry_run_still_computes_operations_but_flags_itself() {
        let plan = plan("m1", &decision("star", Vec::new(), Some("invoices")), &[], true, &ActionPlannerConfig::default());
        assert!(plan.dry_run);
        assert!(!plan.operations.is_empty());
    }

    #[test]
    fn labels_to_add_from_decision_are_prefixed_and_ensured() {
        let plan = plan("m1", &decision("none", vec!["Phishing".to_string()], None), &[], false, &ActionPlannerConfig::default());
        assert!(plan.operations[0].add_labels.contains(&"MailSentinel/Phishing".to_string()));
    }
}
