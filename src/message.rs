//! Feature Extractor: turns a raw [`Message`] into a normalized, bounded
//! [`Payload`], the only view of a message the classifier gateway ever sees.
//!
//! `extract_payload` is a pure function: no I/O, no clock reads beyond what
//! the caller threads in, deterministic for a given `Message` and `Config`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::FeatureExtractorConfig;

/// SPF/DKIM/DMARC verdict as parsed from `Authentication-Results`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthVerdict {
    Pass,
    Fail,
    Softfail,
    None,
}

impl AuthVerdict {
    fn parse(token: Option<&str>) -> Self {
        match token.map(|t| t.trim().to_ascii_lowercase()).as_deref() {
            Some("pass") => Self::Pass,
            Some("fail") => Self::Fail,
            Some("softfail") => Self::Softfail,
            _ => Self::None,
        }
    }

    pub fn is_fail(self) -> bool {
        matches!(self, Self::Fail | Self::Softfail)
    }
}

/// Canonical email headers this engine reasons about. Everything else in
/// the raw message is ignored; the classifier never sees headers outside
/// this set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Headers {
    pub from: Option<String>,
    pub reply_to: Option<String>,
    pub return_path: Option<String>,
    pub list_id: Option<String>,
    pub authentication_results: Option<String>,
    pub precedence: Option<String>,
    pub auto_submitted: Option<String>,
    pub date: Option<String>,
}

/// An attachment descriptor; only the shape the classifier reasons about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// A caller-supplied record of what's known about a sender, independent of
/// the message itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderReputation {
    /// Trust score in [0, 1].
    pub trust_score: f64,
    pub domain_age_days: u64,
    pub previous_interactions: u64,
}

impl Default for SenderReputation {
    fn default() -> Self {
        Self {
            trust_score: 0.5,
            domain_age_days: 0,
            previous_interactions: 0,
        }
    }
}

/// Raw input to the pipeline. Hydrated by the (out-of-scope) mailbox
/// adapter, immutable for the duration of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub headers: Headers,
    pub subject: String,
    pub body: String,
    /// Link hosts as naively surfaced by the mailbox adapter; the extractor
    /// re-derives the canonical set directly from `body`/`html_body`.
    pub link_hosts: Vec<String>,
    pub html_body: Option<String>,
    pub labels: Vec<String>,
    pub size_bytes: u64,
    pub attachments: Vec<AttachmentDescriptor>,
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
    pub sender_reputation: SenderReputation,
}

/// Records why a field fell back to its raw form instead of its parsed
/// representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldParseWarning {
    pub field: String,
    pub raw_value: String,
}

/// The bounded, serializable record handed to the classifier. Nothing about
/// the original `Message` reaches the model except through this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub message_id: String,
    pub spf: AuthVerdict,
    pub dkim: AuthVerdict,
    pub dmarc: AuthVerdict,
    pub sender_domain: String,
    pub list_id: Option<String>,
    pub bulk: bool,
    /// Canonicalized, first-seen-order-deduplicated link hosts.
    pub link_hosts: Vec<String>,
    pub size_bytes: u64,
    pub attachment_count: usize,
    pub thread_length: u32,
    pub current_labels: Vec<String>,
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
    pub sender_reputation: SenderReputation,
    pub subject: String,
    pub body: String,
    pub extraction_warnings: Vec<FieldParseWarning>,
}

impl Payload {
    pub fn is_allowlisted(&self) -> bool {
        self.allowlist.contains(&self.sender_domain)
    }

    pub fn is_denylisted(&self) -> bool {
        self.denylist.contains(&self.sender_domain)
    }
}

/// Parse `Authentication-Results` into spf/dkim/dmarc verdicts. Missing
/// tokens default to `none`; the raw header is preserved verbatim in a
/// parse warning when no recognized mechanism token is found at all.
fn parse_auth_results(header: Option<&str>) -> (AuthVerdict, AuthVerdict, AuthVerdict, Option<FieldParseWarning>) {
    let Some(raw) = header else {
        return (AuthVerdict::None, AuthVerdict::None, AuthVerdict::None, None);
    };

    let mut found: BTreeMap<&str, &str> = BTreeMap::new();
    for segment in raw.split(';') {
        let segment = segment.trim();
        let Some((mechanism, rest)) = segment.split_once('=') else {
            continue;
        };
        let mechanism = mechanism.trim();
        let verdict = rest.split_whitespace().next().unwrap_or("").trim();
        if matches!(mechanism, "spf" | "dkim" | "dmarc") {
            found.insert(mechanism, verdict);
        }
    }

    let spf = AuthVerdict::parse(found.get("spf").copied());
    let dkim = AuthVerdict::parse(found.get("dkim").copied());
    let dmarc = AuthVerdict::parse(found.get("dmarc").copied());

    let warning = if found.is_empty() {
        Some(FieldParseWarning {
            field: "authentication_results".to_string(),
            raw_value: raw.to_string(),
        })
    } else {
        None
    };

    (spf, dkim, dmarc, warning)
}

/// Normalize a `From` header into a bare lowercase domain, stripping the
/// display name and angle brackets. Display names are never retained.
fn extract_sender_domain(from: Option<&str>) -> (String, Option<FieldParseWarning>) {
    let Some(from) = from else {
        return (String::new(), None);
    };

    let addr = if let (Some(start), Some(end)) = (from.find('<'), from.find('>')) {
        if end > start {
            &from[start + 1..end]
        } else {
            from
        }
    } else {
        from
    };

    match addr.rsplit_once('@') {
        Some((_, domain)) => (domain.trim().to_ascii_lowercase(), None),
        None => (
            String::new(),
            Some(FieldParseWarning {
                field: "from".to_string(),
                raw_value: from.to_string(),
            }),
        ),
    }
}

/// Scan body text and (minimally decoded) HTML for URIs, canonicalizing
/// each to a lowercase host and deduplicating while preserving the order
/// hosts are first seen in. No script execution, no HTML parser: a plain
/// substring scan for `scheme://` tokens and `href="..."`/`src="..."`
/// attribute values is sufficient and keeps this function total.
fn extract_link_hosts(body: &str, html_body: Option<&str>) -> Vec<String> {
    let mut seen = Vec::new();
    let mut push_host = |url: &str| {
        if let Some(host) = host_of(url) {
            let host = host.to_ascii_lowercase();
            if !seen.contains(&host) {
                seen.push(host);
            }
        }
    };

    for url in scan_bare_urls(body) {
        push_host(url);
    }
    if let Some(html) = html_body {
        for url in scan_bare_urls(html) {
            push_host(url);
        }
        for url in scan_attribute_urls(html, "href") {
            push_host(url);
        }
        for url in scan_attribute_urls(html, "src") {
            push_host(url);
        }
    }

    seen
}

fn scan_bare_urls(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    for scheme in ["http://", "https://"] {
        let mut rest = text;
        while let Some(idx) = rest.find(scheme) {
            let tail = &rest[idx..];
            let end = tail
                .find(|c: char| c.is_whitespace() || c == '"' || c == '\'' || c == '<' || c == '>')
                .unwrap_or(tail.len());
            out.push(&tail[..end]);
            rest = &tail[end.max(scheme.len())..];
        }
    }
    out
}

fn scan_attribute_urls<'a>(html: &'a str, attr: &str) -> Vec<&'a str> {
    let mut out = Vec::new();
    let needle_dq = format!("{attr}=\"");
    let needle_sq = format!("{attr}='");
    for needle in [needle_dq.as_str(), needle_sq.as_str()] {
        let quote = needle.chars().last().unwrap();
        let mut rest = html;
        while let Some(idx) = rest.find(needle) {
            let tail = &rest[idx + needle.len()..];
            if let Some(end) = tail.find(quote) {
                out.push(&tail[..end]);
                rest = &tail[end + 1..];
            } else {
                break;
            }
        }
    }
    out
}

fn host_of(url: &str) -> Option<&str> {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme);
    let host = host.rsplit_once('@').map(|(_, h)| h).unwrap_or(host);
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Truncate `body` to `max_bytes`, landing on a UTF-8 char boundary.
fn truncate_body(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Extract a normalized [`Payload`] from a [`Message`]. Never fails:
/// unparseable fields fall back to their raw form plus a warning.
pub fn extract_payload(message: &Message, config: &FeatureExtractorConfig) -> Payload {
    let mut warnings = Vec::new();

    let (spf, dkim, dmarc, auth_warning) =
        parse_auth_results(message.headers.authentication_results.as_deref());
    if let Some(w) = auth_warning {
        warnings.push(w);
    }

    let (sender_domain, domain_warning) = extract_sender_domain(message.headers.from.as_deref());
    if let Some(w) = domain_warning {
        warnings.push(w);
    }

    let list_id = message.headers.list_id.clone();
    let bulk = matches!(
        message.headers.precedence.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("bulk") | Some("list")
    ) || !matches!(
        message.headers.auto_submitted.as_deref().map(str::to_ascii_lowercase).as_deref(),
        None | Some("no")
    );

    let link_hosts = extract_link_hosts(&message.body, message.html_body.as_deref());
    let body = truncate_body(&message.body, config.body_byte_ceiling);

    Payload {
        message_id: message.id.clone(),
        spf,
        dkim,
        dmarc,
        sender_domain,
        list_id,
        bulk,
        link_hosts,
        size_bytes: message.size_bytes,
        attachment_count: message.attachments.len(),
        thread_length: 1,
        current_labels: message.labels.clone(),
        allowlist: message.allowlist.clone(),
        denylist: message.denylist.clone(),
        sender_reputation: message.sender_reputation.clone(),
        subject: message.subject.clone(),
        body,
        extraction_warnings: warnings,
    }
}
