//! Typed configuration shape and the deterministic merge algebra over it.
//!
//! Reading a config file, environment variables, or CLI flags is the
//! out-of-scope configuration-loading adapter's job. This module only
//! defines the subsystem shapes named in the external-interfaces contract
//! and a pure, field-wise, right-biased merge (`Config::merged`) that the
//! adapter calls once per layer to implement "last wins" over built-in
//! defaults, configuration file, environment overrides, and caller-supplied
//! overrides.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    pub page_size: u32,
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,
    pub request_timeout_ms: u64,
    pub retry_attempts: u32,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            rate_limit_per_sec: 10,
            rate_limit_burst: 20,
            request_timeout_ms: 10_000,
            retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub endpoint_url: String,
    pub default_model: String,
    pub per_call_timeout_ms: u64,
    pub max_retries: u32,
    /// Consecutive failures before the breaker opens.
    pub breaker_failure_threshold: u32,
    /// Seconds the breaker stays open before admitting a trial call.
    pub breaker_open_secs: u64,
    /// Trial calls admitted while half-open.
    pub breaker_half_open_trials: u32,
    pub retry_base_delay_ms: u64,
    pub retry_backoff_factor: f64,
    pub rate_limit_per_sec: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "http://127.0.0.1:11434".to_string(),
            default_model: "local-default".to_string(),
            per_call_timeout_ms: 30_000,
            max_retries: 1,
            breaker_failure_threshold: 5,
            breaker_open_secs: 60,
            breaker_half_open_trials: 1,
            retry_base_delay_ms: 1_000,
            retry_backoff_factor: 2.0,
            rate_limit_per_sec: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilesConfig {
    pub directory: String,
    pub strict_validation: bool,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            directory: "profiles".to_string(),
            strict_validation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub directory: String,
    pub max_file_bytes: u64,
    pub max_file_age_secs: u64,
    pub integrity_check_on_write: bool,
    /// Environment variable name holding the HMAC signing secret, if any.
    pub secret_env_var: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            directory: "audit".to_string(),
            max_file_bytes: 64 * 1024 * 1024,
            max_file_age_secs: 7 * 24 * 3600,
            integrity_check_on_write: true,
            secret_env_var: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyGateConfig {
    pub archive_threshold: f64,
    pub star_threshold: f64,
    pub label_threshold: f64,
    /// Higher gate for labels under `MailSentinel/Security/`. `None` means
    /// "use `label_threshold`"; see Open Question #2.
    pub security_label_threshold: Option<f64>,
}

impl Default for SafetyGateConfig {
    fn default() -> Self {
        Self {
            archive_threshold: 0.85,
            star_threshold: 0.70,
            label_threshold: 0.60,
            security_label_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub auth_failure_penalty: f64,
    pub trusted_sender_bonus: f64,
    pub trust_threshold: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            auth_failure_penalty: -0.2,
            trusted_sender_bonus: 0.1,
            trust_threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMethod {
    HighestConfidence,
    Consensus,
    WeightedAverage,
}

impl Default for ConsensusMethod {
    fn default() -> Self {
        Self::WeightedAverage
    }
}

/// A cross-profile rule evaluated before consensus. The first matching
/// rule in priority-descending order (ties broken by declaration order)
/// wins outright, skipping consensus entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverPriorityRule {
    pub expression: String,
    pub action: String,
    pub priority: i64,
    pub confidence_boost: Option<f64>,
    /// Exempts this rule's outcome from the safety-gate check when its
    /// confidence doesn't clear the gate for `action`.
    #[serde(default)]
    pub override_gates: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub method: ConsensusMethod,
    /// Declared order matters: ties in `consensus` weight/declaration
    /// order are broken by this list's order.
    pub profile_weights: Vec<(String, f64)>,
    pub star_archive_margin: f64,
    #[serde(default)]
    pub priority_rules: Vec<ResolverPriorityRule>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            method: ConsensusMethod::default(),
            profile_weights: Vec::new(),
            star_archive_margin: 0.2,
            priority_rules: Vec::new(),
        }
    }
}

impl ResolverConfig {
    pub fn weight_for(&self, profile_id: &str) -> f64 {
        self.profile_weights
            .iter()
            .find(|(id, _)| id == profile_id)
            .map(|(_, weight)| *weight)
            .unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeatureExtractorConfig {
    pub body_byte_ceiling: usize,
}

impl Default for FeatureExtractorConfig {
    fn default() -> Self {
        Self {
            body_byte_ceiling: 10 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ActionPlannerConfig {
    /// Whether `none` actions still get a provenance label. See Open
    /// Question #1; defaults to off.
    pub label_none_actions: bool,
}

impl Default for ActionPlannerConfig {
    fn default() -> Self {
        Self {
            label_none_actions: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub page_size: u32,
    pub worker_count: u32,
    pub timeout_safety_factor: f64,
    pub audit_backpressure_depth: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            worker_count: 5,
            timeout_safety_factor: 1.5,
            audit_backpressure_depth: 1_000,
        }
    }
}

/// The aggregate configuration surface, mirroring the subsystem table in
/// the external-interfaces contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub mailbox: MailboxConfig,
    pub classifier: ClassifierConfig,
    pub profiles: ProfilesConfig,
    pub audit: AuditConfig,
    pub safety_gates: SafetyGateConfig,
    pub calibration: CalibrationConfig,
    pub resolver: ResolverConfig,
    pub feature_extractor: FeatureExtractorConfig,
    pub action_planner: ActionPlannerConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    /// Field-wise right-biased merge over two partial JSON documents:
    /// keys present in `overlay` win, keys it omits fall through to
    /// `base`. Layers are expressed as `serde_json::Value` so a caller can
    /// merge a sparse configuration-file fragment or a sparse set of
    /// environment overrides without materializing a full `Config` for
    /// each layer.
    pub fn merged_value(base: serde_json::Value, overlay: serde_json::Value) -> serde_json::Value {
        match (base, overlay) {
            (serde_json::Value::Object(mut base_map), serde_json::Value::Object(overlay_map)) => {
                for (key, overlay_value) in overlay_map {
                    let merged = match base_map.remove(&key) {
                        Some(base_value) => Self::merged_value(base_value, overlay_value),
                        None => overlay_value,
                    };
                    base_map.insert(key, merged);
                }
                serde_json::Value::Object(base_map)
            }
            (_, overlay) => overlay,
        }
    }

    /// Apply `Self::merged_value` across the four configuration layers
    /// named in the external-interfaces contract (built-in defaults,
    /// configuration file, environment overrides, caller-supplied
    /// overrides) and deserialize the result back into a `Config`.
    pub fn merged(layers: Vec<serde_json::Value>) -> crate::error::Result<Config> {
        let merged = layers
            .into_iter()
            .fold(serde_json::to_value(Config::default())?, Self::merged_value);
        Ok(serde_json::from_value(merged)?)
    }
}
