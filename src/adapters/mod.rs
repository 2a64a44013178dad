//! Adapter interfaces for the external processing gateway.
//!
//! The gateway is a swappable black box: the core hands it a request built
//! from ledger data and consumes an approval code, an optional reference
//! token and a settlement timestamp. Field naming and wire encoding belong to
//! the adapter.

pub mod http;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::TransactionType;

// Re-export the HTTP adapter
pub use http::HttpGateway;

/// Fields sent to the gateway for one attempt
#[derive(Clone, Serialize)]
pub struct GatewayRequest {
    pub operation: TransactionType,
    pub merchant_id: String,

    /// Amount in minor currency units
    pub amount: i64,

    /// Deterministic numeric reference of the ledger record
    pub reference: u64,

    /// Token of the record a dependent operation targets
    pub original_token: Option<String>,

    /// Opaque payment method token for root operations
    pub payment_token: Option<String>,
}

impl fmt::Debug for GatewayRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayRequest")
            .field("operation", &self.operation)
            .field("merchant_id", &self.merchant_id)
            .field("amount", &self.amount)
            .field("reference", &self.reference)
            .field("original_token", &self.original_token)
            .field("payment_token", &self.payment_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Business outcome of a well-formed gateway response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Approved,
    Declined,
}

/// Gateway response consumed by the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub status: ResponseStatus,
    pub response_code: String,
    pub message: String,

    /// Token to persist for dependent operations
    pub external_token: Option<String>,

    pub settled_at: DateTime<Utc>,
}

impl GatewayResponse {
    pub fn approved(code: impl Into<String>, token: Option<String>) -> Self {
        Self {
            status: ResponseStatus::Approved,
            response_code: code.into(),
            message: "Approved".to_string(),
            external_token: token,
            settled_at: Utc::now(),
        }
    }

    pub fn declined(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Declined,
            response_code: code.into(),
            message: message.into(),
            external_token: None,
            settled_at: Utc::now(),
        }
    }
}

/// Failures of a single gateway attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Gateway transport failure: {0}")]
    Transport(String),

    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Gateway internal error {code}: {message}")]
    Internal { code: String, message: String },

    /// The gateway refused the request itself (malformed, unauthorized)
    #[error("Gateway rejected request: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Whether another attempt may succeed
    pub fn is_retriable(&self) -> bool {
        !matches!(self, GatewayError::Rejected(_))
    }

    /// Whether the failure says something about gateway health
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_) | GatewayError::Timeout(_) | GatewayError::Internal { .. }
        )
    }
}

/// Trait for gateway collaborators
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Send one attempt.
    ///
    /// Approvals and business declines are `Ok`; a gateway-internal error
    /// response is `Err(GatewayError::Internal)`.
    async fn send(
        &self,
        request: &GatewayRequest,
        timeout: Duration,
    ) -> Result<GatewayResponse, GatewayError>;

    /// Health check
    async fn health_check(&self) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transport = GatewayError::Transport("connection reset".to_string());
        let timeout = GatewayError::Timeout(Duration::from_secs(5));
        let internal = GatewayError::Internal {
            code: "96".to_string(),
            message: "system malfunction".to_string(),
        };
        let rejected = GatewayError::Rejected("bad merchant".to_string());

        for err in [&transport, &timeout, &internal] {
            assert!(err.is_retriable());
            assert!(err.counts_toward_breaker());
        }
        assert!(!rejected.is_retriable());
        assert!(!rejected.counts_toward_breaker());
    }

    #[test]
    fn test_request_debug_redacts_payment_token() {
        let request = GatewayRequest {
            operation: TransactionType::Auth,
            merchant_id: "m-1".to_string(),
            amount: 100,
            reference: 42,
            original_token: None,
            payment_token: Some("4111111111111111".to_string()),
        };
        let debug = format!("{:?}", request);
        assert!(!debug.contains("4111"));
        assert!(debug.contains("<redacted>"));
    }
}
