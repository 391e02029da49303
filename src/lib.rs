//! # mailsentinel-core
//!
//! Local-inference email triage: per-message feature extraction, profile-
//! driven classification against a loopback model, policy evaluation,
//! cross-profile resolution, idempotent mailbox-label planning, and a
//! hash-chained audit trail, all run under a bounded-concurrency batch
//! orchestrator.
//!
//! ## Pipeline
//!
//! `Message` -> [`message::extract_payload`] -> per-profile
//! [`classifier::gateway::ClassifierGateway::classify`] -> [`policy::select_actions`]
//! -> [`resolver::resolve`] -> [`planner::plan`] -> [`mailbox::MailboxAdapter::modify_labels`],
//! with every step recorded through [`audit::AuditChain`].

pub mod audit;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod orchestrator;
pub mod planner;
pub mod policy;
pub mod profile;
pub mod resolver;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{extract_payload, Message, Payload};
pub use orchestrator::{BatchOrchestrator, BatchSummary, CancelToken};
pub use planner::{plan, MailboxOperation, Plan};
pub use profile::ProfileRegistry;
pub use resolver::{resolve, Decision, ProfileResult};
