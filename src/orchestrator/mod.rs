//! Batch Orchestrator: drives many messages through Feature Extractor →
//! Classifier Gateway → Policy Evaluator → Decision Resolver → Action
//! Planner → Audit Chain concurrently, under bounded parallelism, rate
//! limiting, checkpointing, and cooperative cancellation.

pub mod ratelimit;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::audit::{AuditChain, EventType};
use crate::classifier::gateway::ClassifierGateway;
use crate::config::{ActionPlannerConfig, CalibrationConfig, FeatureExtractorConfig, OrchestratorConfig, ResolverConfig, SafetyGateConfig};
use crate::error::{Error, Result};
use crate::mailbox::{ListQuery, MailboxAdapter};
use crate::message::{extract_payload, Message};
use crate::planner::{self, Plan};
use crate::policy;
use crate::profile::ProfileRegistry;
use crate::resolver::{self, Decision, ProfileResult};

use ratelimit::TokenBucket;

/// Cooperative cancellation signal threaded through every blocking
/// operation the orchestrator performs.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl Default for CancelToken {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Persists the mailbox adapter's opaque page cursor so a crashed batch can
/// resume after the last completed page. Out-of-scope storage; callers
/// supply an implementation (a file, a database row, …).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, cursor: &str) -> Result<()>;
    async fn load(&self) -> Result<Option<String>>;
}

/// Discards checkpoints. Useful for one-shot runs and tests where resuming
/// from a crash isn't a concern.
pub struct NullCheckpointStore;

#[async_trait]
impl CheckpointStore for NullCheckpointStore {
    async fn save(&self, _cursor: &str) -> Result<()> {
        Ok(())
    }

    async fn load(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Wraps the audit chain so workers can observe its queue depth and block
/// before issuing new classifier calls when writes fall behind. Appends run
/// on the blocking thread pool since each one fsyncs.
pub struct AuditWriter {
    chain: Arc<AuditChain>,
    in_flight: Arc<std::sync::atomic::AtomicUsize>,
}

impl AuditWriter {
    pub fn new(chain: AuditChain) -> Self {
        Self {
            chain: Arc::new(chain),
            in_flight: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    pub fn depth(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_for_capacity(&self, threshold: usize) {
        while self.depth() >= threshold {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn append(
        &self,
        event_type: EventType,
        message_id: &str,
        profile_id: &str,
        action: &str,
        confidence: f64,
        metadata: serde_json::Value,
    ) -> Result<()> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let chain = Arc::clone(&self.chain);
        let message_id = message_id.to_string();
        let profile_id = profile_id.to_string();
        let action = action.to_string();
        let result = tokio::task::spawn_blocking(move || {
            chain.append(event_type, &message_id, &profile_id, &action, confidence, metadata)
        })
        .await
        .map_err(|e| Error::fatal(format!("audit writer task panicked: {e}")))?;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result.map(|_| ())
    }
}

#[derive(Debug, Default, Clone)]
pub struct BatchSummary {
    pub processed: u64,
    pub archived: u64,
    pub starred: u64,
    pub none: u64,
    pub labeled: u64,
    pub errors: u64,
}

impl BatchSummary {
    fn record(&mut self, decision: &Decision) {
        self.processed += 1;
        match decision.action.as_str() {
            "archive" => self.archived += 1,
            "star" => self.starred += 1,
            "none" => self.none += 1,
            _ => {}
        }
        if !decision.labels_to_add.is_empty() {
            self.labeled += 1;
        }
    }
}

pub struct BatchOrchestrator {
    mailbox: Arc<dyn MailboxAdapter>,
    gateway: Arc<ClassifierGateway>,
    registry: Arc<ProfileRegistry>,
    audit: Arc<AuditWriter>,
    checkpoint: Arc<dyn CheckpointStore>,
    config: OrchestratorConfig,
    resolver_config: ResolverConfig,
    calibration_config: CalibrationConfig,
    safety_gates: SafetyGateConfig,
    action_planner_config: ActionPlannerConfig,
    feature_extractor_config: FeatureExtractorConfig,
    mailbox_bucket: TokenBucket,
    classifier_bucket: TokenBucket,
}

impl BatchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mailbox: Arc<dyn MailboxAdapter>,
        gateway: Arc<ClassifierGateway>,
        registry: Arc<ProfileRegistry>,
        audit: Arc<AuditWriter>,
        checkpoint: Arc<dyn CheckpointStore>,
        config: OrchestratorConfig,
        resolver_config: ResolverConfig,
        calibration_config: CalibrationConfig,
        safety_gates: SafetyGateConfig,
        action_planner_config: ActionPlannerConfig,
        feature_extractor_config: FeatureExtractorConfig,
        mailbox_rate: (u32, u32),
        classifier_rate: (u32, u32),
    ) -> Arc<Self> {
        Arc::new(Self {
            mailbox,
            gateway,
            registry,
            audit,
            checkpoint,
            config,
            resolver_config,
            calibration_config,
            safety_gates,
            action_planner_config,
            feature_extractor_config,
            mailbox_bucket: TokenBucket::new(mailbox_rate.1, mailbox_rate.0),
            classifier_bucket: TokenBucket::new(classifier_rate.1, classifier_rate.0),
        })
    }

    /// Drive every page the mailbox adapter yields through the pipeline.
    /// Checkpoints after each completed page; stops (without error) as soon
    /// as `cancel` is observed, leaving the audit chain consistent.
    pub async fn run_batch(self: &Arc<Self>, query: &ListQuery, dry_run: bool, cancel: &CancelToken) -> Result<BatchSummary> {
        let mut summary = BatchSummary::default();
        let mut cursor = self.checkpoint.load().await?;
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count.max(1) as usize));

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.mailbox_bucket.acquire().await;
            let page = self.mailbox.list_page(cursor.as_deref(), query, self.config.page_size).await?;

            if page.messages.is_empty() && page.next_cursor.is_none() {
                break;
            }

            let tasks = page.messages.into_iter().map(|message| {
                let this = Arc::clone(self);
                let permits = Arc::clone(&semaphore);
                let cancel = cancel.clone();
                let dry_run = dry_run;
                async move {
                    let _permit = permits.acquire().await.expect("semaphore never closes");
                    if cancel.is_cancelled() {
                        return None;
                    }
                    this.process_message(message, dry_run, &cancel).await
                }
            });

            for outcome in join_all(tasks).await.into_iter().flatten() {
                match outcome {
                    Ok(decision) => summary.record(&decision),
                    Err(_) => summary.errors += 1,
                }
            }

            match page.next_cursor {
                Some(next) => {
                    self.checkpoint.save(&next).await?;
                    cursor = Some(next);
                }
                None => break,
            }
        }

        Ok(summary)
    }

    /// Run one message through the full pipeline. Errors from the
    /// classifier gateway never abort the batch: they're synthesized into
    /// an `action = none` response and recorded, per the error taxonomy.
    async fn process_message(&self, message: Message, dry_run: bool, cancel: &CancelToken) -> Option<Result<Decision>> {
        if cancel.is_cancelled() {
            return None;
        }

        let payload = extract_payload(&message, &self.feature_extractor_config);
        let profile_ids = self.registry.profile_ids();

        let total_timeout_ms: u64 = profile_ids
            .iter()
            .filter_map(|id| self.registry.get_profile(id))
            .map(|p| p.per_call_timeout_ms)
            .sum();
        let deadline = Duration::from_millis((total_timeout_ms as f64 * self.config.timeout_safety_factor).round() as u64);

        let run = self.run_profiles(&message, &payload, &profile_ids, cancel);
        let (results, gated_path) = match tokio::time::timeout(deadline, run).await {
            Ok(outcome) => outcome,
            Err(_) => return Some(Err(Error::cancelled(format!("message {} exceeded its processing deadline", message.id)))),
        };

        let decision = match resolver::resolve(
            &payload,
            &results,
            &self.resolver_config,
            &self.calibration_config,
            &self.safety_gates,
            dry_run,
        ) {
            Ok(mut decision) => {
                let mut path = gated_path;
                path.extend(decision.resolution_path);
                decision.resolution_path = path;
                decision
            }
            Err(e) => return Some(Err(e)),
        };

        let plan = planner::plan(&message.id, &decision, &message.labels, dry_run, &self.action_planner_config);

        if let Err(e) = self.apply_plan(&message, &plan, dry_run).await {
            if !dry_run {
                return Some(Err(e));
            }
        }

        let _ = self
            .audit
            .append(
                EventType::ActionApplied,
                &message.id,
                decision.winning_profile_id.as_deref().unwrap_or(""),
                &decision.action,
                decision.confidence,
                serde_json::json!({ "resolution_path": decision.resolution_path, "dry_run": dry_run }),
            )
            .await;

        Some(Ok(decision))
    }

    async fn run_profiles(
        &self,
        message: &Message,
        payload: &crate::message::Payload,
        profile_ids: &[String],
        cancel: &CancelToken,
    ) -> (Vec<ProfileResult>, Vec<String>) {
        let mut results = Vec::new();
        let mut completed: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let mut gated_path = Vec::new();

        for id in profile_ids {
            if cancel.is_cancelled() {
                break;
            }
            let Some(profile) = self.registry.get_profile(id) else { continue };

            match resolver::should_execute(&profile, &completed) {
                Ok(true) => {}
                Ok(false) => {
                    gated_path.push(format!("gated:{id}"));
                    continue;
                }
                Err(_) => {
                    gated_path.push(format!("gated:{id}"));
                    continue;
                }
            }

            self.audit.wait_for_capacity(self.config.audit_backpressure_depth).await;
            self.classifier_bucket.acquire().await;

            let response = match self.gateway.classify(&profile, payload).await {
                Ok(response) => {
                    let _ = self
                        .audit
                        .append(EventType::Classified, &message.id, id, &response.action, response.confidence, serde_json::Value::Null)
                        .await;
                    response
                }
                Err(e) => {
                    let synthesized = crate::classifier::ClassificationResponse {
                        action: "none".to_string(),
                        confidence: 0.0,
                        reasons: vec![format!("classifier error: {e}")],
                        labels: Vec::new(),
                        extra: Default::default(),
                    };
                    let _ = self
                        .audit
                        .append(
                            EventType::Error,
                            &message.id,
                            id,
                            "none",
                            0.0,
                            serde_json::json!({ "error": e.to_string(), "error_kind": e.kind() }),
                        )
                        .await;
                    synthesized
                }
            };

            completed.insert(id.clone(), policy::eval_subject(&response, payload));
            results.push(ProfileResult { profile, response });
        }

        (results, gated_path)
    }

    async fn apply_plan(&self, message: &Message, plan: &Plan, dry_run: bool) -> Result<()> {
        if plan.idempotent_noop {
            let _ = self
                .audit
                .append(
                    EventType::ActionApplied,
                    &message.id,
                    "",
                    "none",
                    0.0,
                    serde_json::json!({ "idempotent_noop": true }),
                )
                .await;
            return Ok(());
        }

        if dry_run {
            return Ok(());
        }

        for op in &plan.operations {
            for label in &op.add_labels {
                self.mailbox.ensure_label(label).await?;
            }
            self.mailbox.modify_labels(&op.message_id, &op.add_labels, &op.remove_labels).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    fn decision(action: &str, labels_to_add: Vec<String>) -> Decision {
        Decision {
            action: action.to_string(),
            confidence: 0.9,
            labels_to_add,
            labels_to_remove: Vec::new(),
            winning_profile_id: None,
            resolution_path: Vec::new(),
            dry_run: false,
            content_hash: String::new(),
        }
    }

    #[test]
    fn batch_summary_tallies_by_action() {
        let mut summary = BatchSummary::default();
        summary.record(&decision("archive", Vec::new()));
        summary.record(&decision("star", vec!["Invoices".to_string()]));
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.archived, 1);
        assert_eq!(summary.starred, 1);
        assert_eq!(summary.labeled, 1);
    }

    #[tokio::test]
    async fn null_checkpoint_store_round_trips_nothing() {
        let store = NullCheckpointStore;
        assert_eq!(store.load().await.unwrap(), None);
        store.save("cursor-1").await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }
}
