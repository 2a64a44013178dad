//! Shared fixtures for integration tests: a scripted in-memory gateway and
//! orchestrators backed by on-disk ledgers in temp directories.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use payledger::core::{
    BreakerConfig, BusinessRules, CircuitBreaker, GatewayClient, IdempotencyConfig, LedgerStore,
    RetryExecutor, RetryPolicy, TransactionOrchestrator,
};
use payledger::domain::ReferenceMapper;
use payledger::{Gateway, GatewayError, GatewayRequest, GatewayResponse};
use tempfile::TempDir;

/// Gateway that replays a script of outcomes and approves once it runs out
pub struct FakeGateway {
    calls: AtomicU32,
    delay_ms: AtomicU64,
    script: Mutex<VecDeque<Result<GatewayResponse, GatewayError>>>,
    requests: Mutex<Vec<GatewayRequest>>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay_ms: AtomicU64::new(0),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Every call sleeps this long before answering
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn push(&self, outcome: Result<GatewayResponse, GatewayError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn push_transport_failures(&self, count: usize) {
        for _ in 0..count {
            self.push(Err(GatewayError::Transport("connection reset".to_string())));
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GatewayRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    fn name(&self) -> &str {
        "fake"
    }

    async fn send(
        &self,
        request: &GatewayRequest,
        _timeout: Duration,
    ) -> Result<GatewayResponse, GatewayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(GatewayResponse::approved(
                "00",
                Some(format!("tok-{}-{}", request.operation, call)),
            ))
        })
    }

    async fn health_check(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 5,
        max_delay_ms: 20,
        backoff_multiplier: 2.0,
    }
}

pub fn fast_idempotency() -> IdempotencyConfig {
    IdempotencyConfig {
        lease_ttl: Duration::from_secs(30),
        poll_interval: Duration::from_millis(10),
    }
}

/// Knobs for building an orchestrator in tests
#[derive(Clone)]
pub struct Setup {
    pub breaker: BreakerConfig,
    pub retry: RetryPolicy,
    pub rules: BusinessRules,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            retry: fast_retry(),
            rules: BusinessRules::default(),
        }
    }
}

pub async fn orchestrator_at(
    path: &Path,
    gateway: Arc<FakeGateway>,
    setup: Setup,
) -> TransactionOrchestrator {
    let mapper = ReferenceMapper::default();
    let store = LedgerStore::open(path)
        .await
        .unwrap()
        .with_references(mapper, Duration::from_secs(24 * 3600));
    let breaker = Arc::new(CircuitBreaker::new("fake", setup.breaker));
    let client = GatewayClient::new(
        gateway,
        breaker,
        RetryExecutor::new(setup.retry),
        Duration::from_secs(5),
        mapper,
    );
    TransactionOrchestrator::new(store, client, fast_idempotency(), setup.rules)
}

/// Orchestrator over a fresh ledger file; keep the TempDir alive
pub async fn harness(gateway: Arc<FakeGateway>, setup: Setup) -> (TempDir, TransactionOrchestrator) {
    let dir = TempDir::new().unwrap();
    let orchestrator = orchestrator_at(&dir.path().join("ledger.db"), gateway, setup).await;
    (dir, orchestrator)
}
