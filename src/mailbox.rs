//! Mailbox adapter contract: the out-of-scope boundary the orchestrator
//! calls to list messages and apply label changes. No concrete
//! implementation ships here, only the trait and the shapes it exchanges.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListQuery {
    /// Adapter-specific query string. An empty query means "default query,
    /// excluding provider spam/trash".
    pub query: String,
}

/// The boundary the orchestrator drives every message through. Errors
/// returned here are already classified into the taxonomy the orchestrator
/// reacts to (`transient`, rate-limited as `transient`, `auth-expired` as
/// `fatal`, or `fatal`); see [`crate::error::Error::kind`].
#[async_trait]
pub trait MailboxAdapter: Send + Sync {
    async fn list_page(&self, cursor: Option<&str>, query: &ListQuery, max_results: u32) -> Result<Page>;

    async fn modify_labels(&self, message_id: &str, add_labels: &[String], remove_labels: &[String]) -> Result<()>;

    async fn ensure_label(&self, name: &str) -> Result<String>;

    async fn health_check(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingAdapter {
        modify_calls: Mutex<Vec<(String, Vec<String>, Vec<String>)>>,
        ensure_label_calls: AtomicUsize,
    }

    #[async_trait]
    impl MailboxAdapter for RecordingAdapter {
        async fn list_page(&self, _cursor: Option<&str>, _query: &ListQuery, _max_results: u32) -> Result<Page> {
            Ok(Page { messages: Vec::new(), next_cursor: None })
        }

        async fn modify_labels(&self, message_id: &str, add_labels: &[String], remove_labels: &[String]) -> Result<()> {
            self.modify_calls.lock().unwrap().push((message_id.to_string(), add_labels.to_vec(), remove_labels.to_vec()));
            Ok(())
        }

        async fn ensure_label(&self, name: &str) -> Result<String> {
            self.ensure_label_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("label-{name}"))
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn modify_labels_is_recorded_verbatim() {
        let adapter = RecordingAdapter {
            modify_calls: Mutex::new(Vec::new()),
            ensure_label_calls: AtomicUsize::new(0),
        };
        adapter
            .modify_labels("m1", &["STARRED".to_string()], &["INBOX".to_string()])
            .await
            .unwrap();
        let calls = adapter.modify_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, vec!["STARRED".to_string()]);
    }

    #[tokio::test]
    async fn ensure_label_allocates_deterministic_id() {
        let adapter = RecordingAdapter {
            modify_calls: Mutex::new(Vec::new()),
            ensure_label_calls: AtomicUsize::new(0),
        };
        let id = adapter.ensure_label("MailSentinel/spam/archive").await.unwrap();
        assert_eq!(id, "label-MailSentinel/spam/archive");
    }
}
