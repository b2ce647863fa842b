use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::services::backend::{BackendClient, BackendError, GenerationOutput, GenerationRequest};

const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Image-to-image model used when neither the job nor the config picks one.
pub const DEFAULT_MODEL: &str = "@cf/runwayml/stable-diffusion-v1-5-img2img";

/// Client for Cloudflare Workers AI image-to-image models.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
    base_url: String,
    default_model: String,
}

/// Error envelope returned by the Cloudflare API on failure.
#[derive(Deserialize)]
struct CloudflareErrorEnvelope {
    #[serde(default)]
    errors: Vec<CloudflareError>,
}

#[derive(Deserialize)]
struct CloudflareError {
    #[serde(default)]
    message: String,
}

impl WorkersAiClient {
    pub fn new(account_id: &str, api_token: &str) -> Result<Self, BackendError> {
        let http = Client::builder()
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;
        Ok(Self {
            http,
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
            base_url: CLOUDFLARE_API_BASE.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        })
    }

    /// Point at a different API host (staging, local mock).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn run_url(&self, model: &str) -> String {
        format!(
            "{}/accounts/{}/ai/run/{}",
            self.base_url.trim_end_matches('/'),
            self.account_id,
            model
        )
    }
}

#[async_trait]
impl BackendClient for WorkersAiClient {
    fn name(&self) -> &str {
        "workers-ai"
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Send the prepared image and prompt to Workers AI and return the generated image.
    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<GenerationOutput, BackendError> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);

        let request_body = serde_json::json!({
            "prompt": request.prompt,
            "image_b64": base64::engine::general_purpose::STANDARD.encode(&request.image),
            "num_steps": request.quality.num_steps(),
            "strength": request.strength,
        });

        let response = self
            .http
            .post(self.run_url(model))
            .bearer_auth(&self.api_token)
            .timeout(timeout)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| classify_transport(&e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, timeout));
        }

        let image = response
            .bytes()
            .await
            .map_err(|e| classify_transport(&e, timeout))?;

        tracing::debug!(model = %model, bytes = image.len(), "Workers AI generation complete");

        Ok(GenerationOutput {
            image: image.to_vec(),
            model: model.to_string(),
        })
    }
}

/// Map a non-success HTTP status to a classified backend error.
fn classify_status(status: StatusCode, body: &str, timeout: Duration) -> BackendError {
    let message = serde_json::from_str::<CloudflareErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.errors.into_iter().next())
        .map(|e| e.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    match status {
        StatusCode::TOO_MANY_REQUESTS if message.to_lowercase().contains("quota") => {
            BackendError::QuotaExceeded(message)
        }
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited(message),
        StatusCode::PAYMENT_REQUIRED => BackendError::QuotaExceeded(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::AuthFailed(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendError::Timeout(timeout),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
            BackendError::Overloaded(message)
        }
        s if s.is_server_error() => BackendError::Overloaded(message),
        _ => BackendError::InvalidRequest(message),
    }
}

fn classify_transport(err: &reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(timeout)
    } else if err.is_decode() || err.is_body() {
        BackendError::InvalidResponse(err.to_string())
    } else {
        BackendError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const LIMIT: Duration = Duration::from_secs(120);

    #[test]
    fn test_status_classification() {
        let cases = [
            (StatusCode::TOO_MANY_REQUESTS, ErrorKind::RateLimited),
            (StatusCode::PAYMENT_REQUIRED, ErrorKind::QuotaExceeded),
            (StatusCode::UNAUTHORIZED, ErrorKind::Permanent),
            (StatusCode::GATEWAY_TIMEOUT, ErrorKind::Timeout),
            (StatusCode::SERVICE_UNAVAILABLE, ErrorKind::ServiceOverloaded),
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::ServiceOverloaded),
            (StatusCode::BAD_REQUEST, ErrorKind::Permanent),
        ];
        for (status, kind) in cases {
            assert_eq!(classify_status(status, "", LIMIT).kind(), kind, "{status}");
        }
    }

    #[test]
    fn test_quota_message_on_429() {
        let body = r#"{"success":false,"errors":[{"code":4006,"message":"daily free allocation quota exceeded"}]}"#;
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, body, LIMIT),
            BackendError::QuotaExceeded("daily free allocation quota exceeded".into())
        );
    }

    #[test]
    fn test_falls_back_to_status_text() {
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, "<html>oops</html>", LIMIT),
            BackendError::InvalidRequest("HTTP 400".into())
        );
    }

    #[test]
    fn test_run_url() {
        let client = WorkersAiClient::new("acct", "token")
            .unwrap()
            .with_base_url("http://localhost:8787/");
        assert_eq!(
            client.run_url("@cf/some/model"),
            "http://localhost:8787/accounts/acct/ai/run/@cf/some/model"
        );
        assert_eq!(client.default_model(), DEFAULT_MODEL);
    }
}
