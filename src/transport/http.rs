//! HTTP client for the chat backend
//!
//! Posts `{"message", "mode"}` as JSON and expects `{"reply"}` back.
//! Network failures and 5xx responses are retried with exponential backoff.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{classify_status, ChatTransport, TransportError};
use crate::settings::TransportSettings;

const API_KEY_ENV: &str = "LINGO_API_KEY";

/// Chat request body
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    mode: Option<&'a str>,
}

/// Chat backend response
#[derive(Debug, Deserialize)]
struct ChatReply {
    reply: String,
}

/// Backend error response
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Get the chat backend API key from the environment
pub fn api_key_from_env() -> Option<String> {
    match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.is_empty() => Some(key),
        _ => None,
    }
}

/// Chat transport backed by the HTTP chat API
pub struct HttpChatTransport {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    max_attempts: u32,
    retry_base_delay: Duration,
}

impl HttpChatTransport {
    pub fn new(settings: &TransportSettings) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            endpoint: settings.endpoint.clone(),
            api_key: None,
            max_attempts: settings.max_attempts.max(1),
            retry_base_delay: Duration::from_millis(settings.retry_base_delay_ms),
        }
    }

    /// Attach a bearer token sent with every request
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send_once(&self, text: &str, mode_tag: Option<&str>) -> Result<String, TransportError> {
        let mut request = self.client.post(&self.endpoint).json(&ChatRequest {
            message: text,
            mode: mode_tag,
        });
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() || e.is_request() {
                TransportError::Network(e.to_string())
            } else {
                TransportError::Generic {
                    status: None,
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();

        if status.is_success() {
            let body: ChatReply = response.json().await.map_err(|e| TransportError::Generic {
                status: Some(status.as_u16()),
                message: format!("Failed to parse reply: {}", e),
            })?;

            if body.reply.trim().is_empty() {
                return Err(TransportError::Generic {
                    status: Some(status.as_u16()),
                    message: "Empty reply".to_string(),
                });
            }

            log::info!("Chat reply received: {} chars", body.reply.len());
            Ok(body.reply)
        } else {
            let error_text = response.text().await.unwrap_or_default();

            let message =
                if let Ok(error_response) = serde_json::from_str::<ApiErrorResponse>(&error_text) {
                    error_response.error.message
                } else {
                    error_text
                };

            log::error!("Chat backend error ({}): {}", status.as_u16(), message);
            Err(classify_status(status.as_u16(), message))
        }
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn send(&self, text: &str, mode_tag: Option<&str>) -> Result<String, TransportError> {
        let mut attempt = 1;
        loop {
            match self.send_once(text, mode_tag).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.retry_base_delay * 2u32.pow(attempt - 1);
                    log::warn!(
                        "Chat request attempt {}/{} failed ({}), retrying in {:?}",
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(ChatRequest {
            message: "hello",
            mode: Some("roleplay"),
        })
        .unwrap();
        assert_eq!(body["message"], "hello");
        assert_eq!(body["mode"], "roleplay");

        let body = serde_json::to_value(ChatRequest {
            message: "hello",
            mode: None,
        })
        .unwrap();
        assert!(body["mode"].is_null());
    }

    #[test]
    fn test_zero_attempts_still_sends_once() {
        let settings = TransportSettings {
            max_attempts: 0,
            ..TransportSettings::default()
        };
        let transport = HttpChatTransport::new(&settings);
        assert_eq!(transport.max_attempts, 1);
    }
}
