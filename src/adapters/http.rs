//! HTTP gateway adapter.
//!
//! Posts each attempt as JSON to `<base_url>/transactions` and reads a JSON
//! verdict back. The reference is sent zero-padded to the configured width.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Gateway, GatewayError, GatewayRequest, GatewayResponse, ResponseStatus};
use crate::domain::ReferenceMapper;

/// Gateway reached over HTTP
pub struct HttpGateway {
    client: Client,
    base_url: String,
    mapper: ReferenceMapper,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    operation: &'a str,
    merchant_id: &'a str,
    amount: i64,
    reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    original_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_token: Option<&'a str>,
}

#[derive(Deserialize)]
struct WireResponse {
    status: String,
    response_code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    settled_at: Option<DateTime<Utc>>,
}

impl HttpGateway {
    /// Create an adapter for the gateway at `base_url`
    pub fn new(base_url: impl Into<String>, mapper: ReferenceMapper) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            mapper,
        }
    }

    /// Create an adapter with a preconfigured client
    pub fn with_client(client: Client, base_url: impl Into<String>, mapper: ReferenceMapper) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            mapper,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn map_send_error(err: reqwest::Error, timeout: Duration) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout(timeout)
        } else if err.is_decode() {
            GatewayError::Internal {
                code: "decode".to_string(),
                message: err.to_string(),
            }
        } else {
            GatewayError::Transport(err.to_string())
        }
    }

    fn into_response(wire: WireResponse) -> Result<GatewayResponse, GatewayError> {
        let status = match wire.status.to_ascii_lowercase().as_str() {
            "approved" => ResponseStatus::Approved,
            "declined" => ResponseStatus::Declined,
            "error" => {
                return Err(GatewayError::Internal {
                    code: wire.response_code,
                    message: wire.message,
                })
            }
            other => {
                return Err(GatewayError::Internal {
                    code: wire.response_code,
                    message: format!("unknown response status '{}'", other),
                })
            }
        };

        Ok(GatewayResponse {
            status,
            response_code: wire.response_code,
            message: wire.message,
            external_token: wire.token,
            settled_at: wire.settled_at.unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(
        &self,
        request: &GatewayRequest,
        timeout: Duration,
    ) -> Result<GatewayResponse, GatewayError> {
        let body = WireRequest {
            operation: request.operation.as_str(),
            merchant_id: &request.merchant_id,
            amount: request.amount,
            reference: self.mapper.format(request.reference),
            original_token: request.original_token.as_deref(),
            payment_token: request.payment_token.as_deref(),
        };

        debug!(operation = %request.operation, reference = request.reference, "Posting to gateway");

        let response = self
            .client
            .post(self.endpoint("transactions"))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, timeout))?;

        let status = response.status();
        if status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Internal {
                code: status.as_u16().to_string(),
                message: text,
            });
        }
        if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::Transport(format!("gateway returned {}", status)));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(format!("{}: {}", status, text.trim())));
        }

        let wire = response
            .json::<WireResponse>()
            .await
            .map_err(|e| Self::map_send_error(e, timeout))?;

        Self::into_response(wire)
    }

    async fn health_check(&self) -> Result<(), GatewayError> {
        let response = self
            .client
            .get(self.endpoint("health"))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::Internal {
                code: response.status().as_u16().to_string(),
                message: "health check failed".to_string(),
            });
        }

        Ok(())
    }
}
