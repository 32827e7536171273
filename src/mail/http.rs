use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::{Mailer, OutboundMessage, TransportError};

const MAX_RETRIES: u32 = 2;

/// Sends mail through a JSON email API (`POST {api_url}/email`).
#[derive(Debug)]
pub struct HttpMailer {
    client: reqwest::Client,
    api_url: String,
    sender: String,
    api_token: Option<SecretString>,
    retry_delay: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html_body: &'a str,
}

impl HttpMailer {
    /// `api_token`, when set, is sent as the `X-Api-Token` header.
    ///
    /// # Errors
    ///
    /// [`TransportError::InsecureUrl`] when `api_url` is plain HTTP to
    /// anything but localhost, since the token travels with every request.
    pub fn new(
        client: reqwest::Client,
        api_url: &str,
        sender: impl Into<String>,
        api_token: Option<SecretString>,
    ) -> Result<Self, TransportError> {
        let api_url = api_url.trim_end_matches('/');
        if !api_url.starts_with("https://") {
            let is_localhost =
                api_url.starts_with("http://127.0.0.1") || api_url.starts_with("http://localhost");
            if !is_localhost {
                tracing::error!(api_url = %api_url, "Rejecting non-HTTPS mail API URL");
                return Err(TransportError::InsecureUrl);
            }
            tracing::warn!(api_url = %api_url, "Using non-HTTPS mail API URL (localhost only)");
        }

        Ok(Self {
            client,
            api_url: api_url.to_owned(),
            sender: sender.into(),
            api_token,
            retry_delay: Duration::from_secs(1),
        })
    }

    /// First backoff step between attempts; doubles on each retry.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn post(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let request = SendEmailRequest {
            from: &self.sender,
            to: &message.to_address,
            subject: &message.subject,
            html_body: &message.html_body,
        };

        let mut builder = self.client.post(format!("{}/email", self.api_url));
        if let Some(token) = &self.api_token {
            builder = builder.header("X-Api-Token", token.expose_secret());
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(e)
                }
            })?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    /// Delivers `message`, retrying transient failures with exponential
    /// backoff (1x, 2x the configured delay).
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut retry_count = 0;

        loop {
            match self.post(message).await {
                Ok(()) => {
                    tracing::info!(to = %message.to_address, subject = %message.subject, "Email sent");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && retry_count < MAX_RETRIES => {
                    let delay = self.retry_delay * (1u32 << retry_count);
                    tracing::debug!(
                        error = %e,
                        retry = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying mail API request after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mailer(uri: &str) -> HttpMailer {
        HttpMailer::new(
            reqwest::Client::new(),
            uri,
            "bot@example.com",
            Some(SecretString::from("token-123".to_string())),
        )
        .unwrap()
        .with_retry_delay(Duration::from_millis(10))
    }

    fn message() -> OutboundMessage {
        OutboundMessage {
            to_address: "a@example.com".into(),
            subject: "[rss-email] feed".into(),
            html_body: "<p>hi</p>".into(),
        }
    }

    #[tokio::test]
    async fn test_send_posts_json_with_token() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/email"))
            .and(header("X-Api-Token", "token-123"))
            .and(body_json(serde_json::json!({
                "From": "bot@example.com",
                "To": "a@example.com",
                "Subject": "[rss-email] feed",
                "HtmlBody": "<p>hi</p>",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        mailer(&mock_server.uri()).send(&message()).await.unwrap();
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = mailer(&mock_server.uri()).send(&message()).await.unwrap_err();
        assert!(matches!(err, TransportError::Status(422)));
    }

    #[tokio::test]
    async fn test_server_error_retried_then_reported() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(u64::from(MAX_RETRIES) + 1)
            .mount(&mock_server)
            .await;

        let err = mailer(&mock_server.uri()).send(&message()).await.unwrap_err();
        assert!(matches!(err, TransportError::Status(503)));
    }

    #[test]
    fn test_rejects_plain_http_remote() {
        let result = HttpMailer::new(
            reqwest::Client::new(),
            "http://mail.example.com",
            "bot@example.com",
            None,
        );
        assert!(matches!(result, Err(TransportError::InsecureUrl)));
    }

    #[test]
    fn test_debug_hides_token() {
        let rendered = format!("{:?}", mailer("http://127.0.0.1:9"));
        assert!(!rendered.contains("token-123"));
    }
}
