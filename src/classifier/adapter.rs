//! HTTP inference adapter. Local-only by construction: the engine never
//! ships message content to a remote endpoint, so the constructor rejects
//! any `endpoint_url` that doesn't resolve to a loopback host.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::InferenceAdapter;
use crate::error::{Error, Result};

pub struct HttpInferenceAdapter {
    endpoint_url: String,
    client: Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_output_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

impl HttpInferenceAdapter {
    pub fn new(endpoint_url: impl Into<String>) -> Result<Self> {
        let endpoint_url = endpoint_url.into();
        validate_loopback(&endpoint_url)?;
        Ok(Self {
            endpoint_url,
            client: Client::new(),
        })
    }
}

fn validate_loopback(endpoint_url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(endpoint_url)
        .map_err(|e| Error::validation("classifier.endpoint_url", format!("not a valid URL: {e}")))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| Error::validation("classifier.endpoint_url", "URL has no host"))?;

    let is_loopback = host == "localhost"
        || host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false);

    if !is_loopback {
        return Err(Error::validation(
            "classifier.endpoint_url",
            format!("'{host}' is not a loopback host; the classifier adapter is local-inference only"),
        ));
    }

    Ok(())
}

#[async_trait]
impl InferenceAdapter for HttpInferenceAdapter {
    async fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        temperature: f64,
        max_output_tokens: u32,
        timeout_ms: u64,
    ) -> Result<String> {
        let request = ChatRequest {
            model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
            temperature,
            max_output_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint_url)
            .json(&request)
            .timeout(Duration::from_millis(timeout_ms))
            .send()
            .await
            .map_err(|e| Error::transient("classifier", e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::transient(
                "classifier",
                format!("endpoint returned status {}", response.status()),
            ));
        }

        response
            .text()
            .await
            .map_err(|e| Error::transient("classifier", format!("failed reading response body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_loopback_ip() {
        assert!(HttpInferenceAdapter::new("http://127.0.0.1:11434/api/chat").is_ok());
    }

    #[test]
    fn accepts_localhost_hostname() {
        assert!(HttpInferenceAdapter::new("http://localhost:11434/api/chat").is_ok());
    }

    #[test]
    fn rejects_remote_host() {
        assert!(HttpInferenceAdapter::new("http://api.openai.com/v1/chat").is_err());
    }

    #[test]
    fn rejects_malformed_url() {
        assert!(HttpInferenceAdapter::new("not-a-url").is_err());
    }
}
