//! Durable backend the outbox delivers to.
//!
//! The backend is a stored-procedure gateway: every call names a coin and a
//! method and passes one JSON document. An empty answer means the procedure
//! succeeded; anything else is the procedure's error text.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Per-request timeout for backend calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors reaching the backend.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
}

/// Executes audit records durably.
#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// Run `method` for `coin` with `input` as its JSON argument.
    ///
    /// Returns the procedure's output; non-empty output is an
    /// application-level failure the caller must handle.
    async fn execute(&self, coin: &str, method: &str, input: &str) -> Result<String, BackendError>;
}

/// Backend gateway over HTTP.
///
/// `execute` POSTs the input to `<base_url>/<coin>/<method>` and returns the
/// response body.
#[derive(Clone)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, coin: &str, method: &str) -> String {
        format!("{}/{}/{}", self.base_url, coin, method)
    }

    /// Check that the gateway is reachable and healthy.
    pub async fn health_check(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(BackendError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[async_trait]
impl DurableBackend for HttpBackend {
    async fn execute(&self, coin: &str, method: &str, input: &str) -> Result<String, BackendError> {
        let response = self
            .client
            .post(self.endpoint(coin, method))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(input.to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_layout() {
        let backend = HttpBackend::new("http://gateway:16116/").unwrap();
        assert_eq!(
            backend.endpoint("kaspa", "share"),
            "http://gateway:16116/kaspa/share"
        );
    }
}
