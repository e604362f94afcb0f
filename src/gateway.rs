use std::time::Duration;

use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::phone;

/// Events the service asks the gateway to deliver.
pub const WEBHOOK_EVENTS: [&str; 6] = [
    "MESSAGES_UPSERT",
    "MESSAGES_DELETE",
    "CONNECTION_UPDATE",
    "QRCODE_UPDATED",
    "SEND_MESSAGE",
    "LOGOUT_INSTANCE",
];

pub fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 425 || status == 429 || status >= 500
}

pub fn is_retryable_http_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1_u32 << attempt.min(6))
}

fn parse_body(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| json!({ "raw": raw }))
}

/// Gateway id of a message the gateway just accepted for sending.
pub fn sent_message_id(response: &Value) -> Option<&str> {
    response
        .get("key")
        .and_then(|key| key.get("id"))
        .and_then(Value::as_str)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMessage {
    /// `image`, `video`, `audio` or `document`.
    pub mediatype: String,
    /// URL or base64 payload.
    pub media: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// REST client for the Evolution WhatsApp gateway.
#[derive(Clone)]
pub struct EvolutionClient {
    http: reqwest::Client,
    base_url: Option<String>,
    api_key: Option<String>,
    max_attempts: u32,
    backoff: Duration,
}

impl EvolutionClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff,
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let base_url = self
            .base_url
            .as_deref()
            .ok_or(GatewayError::NotConfigured("EVOLUTION_API_URL"))?;
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(GatewayError::NotConfigured("EVOLUTION_API_KEY"))?;
        let url = format!("{base_url}{path}");

        let mut attempt = 0;
        loop {
            let retries_left = attempt + 1 < self.max_attempts;
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("apikey", api_key);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let raw = response.text().await?;
                    if (200..300).contains(&status) {
                        debug!(%method, path, status, "gateway call succeeded");
                        return Ok(parse_body(&raw));
                    }
                    if retries_left && should_retry_status(status) {
                        let delay = backoff_delay(self.backoff, attempt);
                        warn!(%method, path, status, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "gateway call failed, retrying");
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(GatewayError::from_status(status, path, raw));
                }
                Err(err) => {
                    if retries_left && is_retryable_http_error(&err) {
                        let delay = backoff_delay(self.backoff, attempt);
                        warn!(%method, path, error = %err, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "gateway call failed, retrying");
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(GatewayError::Transport(err));
                }
            }
        }
    }

    pub async fn create_instance(
        &self,
        instance: &str,
        number: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let mut body = json!({
            "instanceName": instance,
            "qrcode": true,
            "integration": "WHATSAPP-BAILEYS",
        });
        if let Some(number) = number {
            body["number"] = json!(phone::to_gateway_number(number));
        }
        self.request(Method::POST, "/instance/create", Some(&body)).await
    }

    /// Starts a session; the response carries the pairing QR code.
    pub async fn connect_instance(&self, instance: &str) -> Result<Value, GatewayError> {
        self.request(Method::GET, &format!("/instance/connect/{instance}"), None)
            .await
    }

    pub async fn connection_state(&self, instance: &str) -> Result<Value, GatewayError> {
        self.request(
            Method::GET,
            &format!("/instance/connectionState/{instance}"),
            None,
        )
        .await
    }

    pub async fn logout_instance(&self, instance: &str) -> Result<Value, GatewayError> {
        self.request(Method::DELETE, &format!("/instance/logout/{instance}"), None)
            .await
    }

    pub async fn delete_instance(&self, instance: &str) -> Result<Value, GatewayError> {
        self.request(Method::DELETE, &format!("/instance/delete/{instance}"), None)
            .await
    }

    pub async fn send_text(
        &self,
        instance: &str,
        to: &str,
        text: &str,
    ) -> Result<Value, GatewayError> {
        let body = json!({ "number": phone::to_gateway_number(to), "text": text });
        self.request(
            Method::POST,
            &format!("/message/sendText/{instance}"),
            Some(&body),
        )
        .await
    }

    pub async fn send_media(
        &self,
        instance: &str,
        to: &str,
        media: &MediaMessage,
    ) -> Result<Value, GatewayError> {
        let mut body = json!(media);
        body["number"] = json!(phone::to_gateway_number(to));
        self.request(
            Method::POST,
            &format!("/message/sendMedia/{instance}"),
            Some(&body),
        )
        .await
    }

    /// Points the instance webhook at `url` for the events this service routes.
    pub async fn set_webhook(&self, instance: &str, url: &str) -> Result<Value, GatewayError> {
        let body = json!({
            "webhook": {
                "enabled": true,
                "url": url,
                "webhookByEvents": false,
                "webhookBase64": false,
                "events": WEBHOOK_EVENTS,
            }
        });
        self.request(
            Method::POST,
            &format!("/webhook/set/{instance}"),
            Some(&body),
        )
        .await
    }

    pub async fn find_webhook(&self, instance: &str) -> Result<Value, GatewayError> {
        self.request(Method::GET, &format!("/webhook/find/{instance}"), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{DELETE, GET, POST};
    use httpmock::MockServer;

    fn client(server: &MockServer, max_attempts: u32) -> EvolutionClient {
        EvolutionClient::new(&GatewayConfig {
            base_url: Some(server.base_url()),
            api_key: Some("test-key".to_string()),
            timeout: Duration::from_secs(5),
            max_attempts,
            backoff: Duration::from_millis(1),
        })
        .expect("client")
    }

    #[test]
    fn retry_status_selection_is_correct() {
        assert!(should_retry_status(429));
        assert!(should_retry_status(503));
        assert!(should_retry_status(408));
        assert!(!should_retry_status(400));
        assert!(!should_retry_status(401));
        assert!(!should_retry_status(404));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 20), backoff_delay(base, 6));
    }

    #[tokio::test]
    async fn send_text_posts_number_with_country_code_and_api_key() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/message/sendText/support1")
                    .header("apikey", "test-key")
                    .json_body_includes(
                        json!({ "number": "5511988887766", "text": "On it" }).to_string(),
                    );
                then.status(201)
                    .json_body(json!({ "key": { "id": "BAE5F00D", "fromMe": true } }));
            })
            .await;

        let response = client(&server, 3)
            .send_text("support1", "11988887766", "On it")
            .await
            .expect("sent");

        assert_eq!(sent_message_id(&response), Some("BAE5F00D"));
        mock.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn server_errors_are_retried_up_to_max_attempts() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/instance/connectionState/support1");
                then.status(503).body("busy");
            })
            .await;

        let err = client(&server, 3)
            .connection_state("support1")
            .await
            .expect_err("should fail");

        assert!(matches!(err, GatewayError::Unavailable { status: 503 }));
        assert!(err.to_string().contains("try again later"));
        mock.assert_calls_async(3).await;
    }

    #[tokio::test]
    async fn not_found_fails_fast() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(DELETE).path("/instance/delete/ghost");
                then.status(404).json_body(json!({ "message": "instance not found" }));
            })
            .await;

        let err = client(&server, 3)
            .delete_instance("ghost")
            .await
            .expect_err("should fail");

        assert!(matches!(err, GatewayError::NotFound { .. }));
        assert!(err.to_string().contains("resource not found"));
        mock.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn unauthorized_reports_invalid_api_key() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/webhook/find/support1");
                then.status(401).body("Unauthorized");
            })
            .await;

        let err = client(&server, 3)
            .find_webhook("support1")
            .await
            .expect_err("should fail");

        assert_eq!(err.to_string(), "invalid API key");
        mock.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn set_webhook_registers_routed_events() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/webhook/set/support1")
                    .json_body_includes(
                        json!({ "webhook": { "url": "https://api.example.com/webhook/evolution" } })
                            .to_string(),
                    );
                then.status(200).json_body(json!({ "webhook": { "enabled": true } }));
            })
            .await;

        client(&server, 1)
            .set_webhook("support1", "https://api.example.com/webhook/evolution")
            .await
            .expect("set");
        mock.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn unconfigured_client_does_not_send() {
        let client = EvolutionClient::new(&GatewayConfig::default()).expect("client");
        let err = client
            .send_text("support1", "11988887766", "hi")
            .await
            .expect_err("should fail");
        assert!(matches!(err, GatewayError::NotConfigured("EVOLUTION_API_URL")));
    }
}
