//! Gateway client: one logical call through the circuit breaker and the
//! retry executor.
//!
//! Every attempt asks the breaker for a permit first, so an Open breaker
//! fails the call without touching the network. Only transport failures,
//! timeouts and gateway-internal errors count against the breaker; approvals
//! close a half-open breaker and declines leave it alone.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::adapters::{Gateway, GatewayError, GatewayRequest, GatewayResponse, ResponseStatus};
use crate::domain::ReferenceMapper;

use super::breaker::{BreakerError, CircuitBreaker};
use super::retry::{Retriable, RetryError, RetryExecutor};

/// Why a logical gateway call produced no response
#[derive(Debug, Error)]
pub enum CallError {
    #[error("Circuit breaker open for gateway '{gateway}'")]
    CircuitOpen { gateway: String },

    #[error("Gateway call failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: GatewayError,
    },

    #[error("Gateway call cancelled")]
    Cancelled,

    #[error("Gateway call deadline exceeded")]
    DeadlineExceeded,
}

/// Failure of one attempt
#[derive(Debug)]
enum AttemptError {
    Open(BreakerError),
    Gateway(GatewayError),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Open(e) => e.fmt(f),
            AttemptError::Gateway(e) => e.fmt(f),
        }
    }
}

impl Retriable for AttemptError {
    fn is_retriable(&self) -> bool {
        match self {
            AttemptError::Open(_) => false,
            AttemptError::Gateway(e) => e.is_retriable(),
        }
    }
}

impl From<RetryError<AttemptError>> for CallError {
    fn from(err: RetryError<AttemptError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } | RetryError::Aborted { attempts, error: last } => {
                match last {
                    AttemptError::Open(open) => CallError::CircuitOpen { gateway: open.name },
                    AttemptError::Gateway(source) => CallError::Failed { attempts, source },
                }
            }
            RetryError::Cancelled { .. } => CallError::Cancelled,
            RetryError::DeadlineExceeded { .. } => CallError::DeadlineExceeded,
        }
    }
}

/// Gateway collaborator wrapped in breaker and retry handling
pub struct GatewayClient {
    gateway: Arc<dyn Gateway>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,

    /// Per-attempt timeout handed to the gateway
    call_timeout: Duration,

    mapper: ReferenceMapper,
}

impl GatewayClient {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryExecutor,
        call_timeout: Duration,
        mapper: ReferenceMapper,
    ) -> Self {
        Self {
            gateway,
            breaker,
            retry,
            call_timeout,
            mapper,
        }
    }

    pub fn gateway_name(&self) -> &str {
        self.gateway.name()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Mapper used for the references this client sends
    pub fn mapper(&self) -> ReferenceMapper {
        self.mapper
    }

    /// Send one logical request, retrying transient failures.
    ///
    /// Approvals and declines are both `Ok`.
    #[instrument(
        skip(self, request, cancel, deadline),
        fields(
            gateway = %self.gateway.name(),
            operation = %request.operation,
            reference = %self.mapper.format(request.reference)
        )
    )]
    pub async fn send(
        &self,
        request: &GatewayRequest,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<GatewayResponse, CallError> {
        let result = self
            .retry
            .run(cancel, deadline, |attempt| self.attempt(request, attempt))
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(err) => {
                let err = CallError::from(err);
                warn!(error = %err, "Gateway call failed");
                Err(err)
            }
        }
    }

    async fn attempt(
        &self,
        request: &GatewayRequest,
        attempt: u32,
    ) -> Result<GatewayResponse, AttemptError> {
        let permit = self.breaker.try_acquire().map_err(AttemptError::Open)?;
        debug!(attempt, trial = permit.is_trial(), "Calling gateway");

        match self.gateway.send(request, self.call_timeout).await {
            Ok(response) => {
                match response.status {
                    ResponseStatus::Approved => permit.success(),
                    ResponseStatus::Declined => permit.neutral(),
                }
                Ok(response)
            }
            Err(err) => {
                if err.counts_toward_breaker() {
                    permit.failure();
                } else {
                    permit.neutral();
                }
                Err(AttemptError::Gateway(err))
            }
        }
    }

    pub async fn health_check(&self) -> Result<(), GatewayError> {
        self.gateway.health_check().await
    }
}
