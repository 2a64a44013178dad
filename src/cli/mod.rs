//! Command-line interface for payledger.
//!
//! Provides commands for running payment operations against the configured
//! gateway, inspecting transaction groups, listing interrupted attempts and
//! showing the resolved configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::HttpGateway;
use crate::config::{self, ResolvedConfig};
use crate::core::{
    BreakerMonitor, CallContext, CircuitBreaker, FollowUpRequest, GatewayClient, LedgerStore,
    PaymentMethodRequest, PaymentRequest, RetryExecutor, TransactionOrchestrator,
    TransactionResponse, VoidRequest,
};
use crate::domain::GroupState;

/// payledger - Append-only payment ledger with an idempotent gateway client
#[derive(Parser, Debug)]
#[command(name = "payledger")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Give up on the operation after this many seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Place a hold on funds
    Authorize {
        #[command(flatten)]
        payment: PaymentArgs,
    },

    /// Authorize and capture in one step
    Sale {
        #[command(flatten)]
        payment: PaymentArgs,
    },

    /// Capture part or all of an authorization
    Capture {
        /// Group (root record) ID
        group_id: String,

        /// Amount in minor currency units
        amount: i64,

        /// Idempotency key (generated if omitted)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Refund captured or sold funds
    Refund {
        /// Group (root record) ID
        group_id: String,

        /// Amount in minor currency units
        amount: i64,

        /// Idempotency key (generated if omitted)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Void an authorization or a same-day capture or sale
    Void {
        /// Group (root record) ID
        group_id: String,

        /// Idempotency key (generated if omitted)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Store a payment method with the gateway
    Store {
        #[command(flatten)]
        method: PaymentMethodArgs,
    },

    /// Send a zero-amount ACH pre-notification
    PreNote {
        #[command(flatten)]
        method: PaymentMethodArgs,
    },

    /// Show the derived state and records of a group
    State {
        /// Group (root record) ID
        group_id: String,
    },

    /// List records still pending (interrupted attempts)
    Pending {
        /// Only show records older than this many seconds
        #[arg(long, default_value = "0")]
        older_than: u64,
    },

    /// Show the numeric gateway reference for a record ID
    Reference {
        /// Record ID (UUID)
        id: String,
    },

    /// Check gateway health and breaker state
    Health,

    /// Show resolved configuration
    Config,
}

#[derive(clap::Args)]
pub struct PaymentArgs {
    /// Merchant ID
    #[arg(short, long)]
    pub merchant: String,

    /// Amount in minor currency units
    pub amount: i64,

    /// Payment method token
    #[arg(short, long, env = "PAYLEDGER_PAYMENT_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Idempotency key (generated if omitted)
    #[arg(short, long)]
    pub key: Option<String>,
}

#[derive(clap::Args)]
pub struct PaymentMethodArgs {
    /// Merchant ID
    #[arg(short, long)]
    pub merchant: String,

    /// Payment method token
    #[arg(short, long, env = "PAYLEDGER_PAYMENT_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Idempotency key (generated if omitted)
    #[arg(short, long)]
    pub key: Option<String>,
}

impl fmt::Debug for PaymentArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentArgs")
            .field("merchant", &self.merchant)
            .field("amount", &self.amount)
            .field("token", &"<redacted>")
            .field("key", &self.key)
            .finish()
    }
}

impl fmt::Debug for PaymentMethodArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentMethodArgs")
            .field("merchant", &self.merchant)
            .field("token", &"<redacted>")
            .field("key", &self.key)
            .finish()
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let timeout = self.timeout.map(Duration::from_secs);

        match self.command {
            Commands::Authorize { payment } => {
                let request = payment.into_request();
                run_operation(timeout, |orchestrator, ctx| async move {
                    orchestrator.authorize(request, &ctx).await
                })
                .await
            }
            Commands::Sale { payment } => {
                let request = payment.into_request();
                run_operation(timeout, |orchestrator, ctx| async move {
                    orchestrator.sale(request, &ctx).await
                })
                .await
            }
            Commands::Capture {
                group_id,
                amount,
                key,
            } => {
                let request = FollowUpRequest {
                    group_id: parse_id(&group_id)?,
                    amount,
                    idempotency_key: key_or_new(key),
                };
                run_operation(timeout, |orchestrator, ctx| async move {
                    orchestrator.capture(request, &ctx).await
                })
                .await
            }
            Commands::Refund {
                group_id,
                amount,
                key,
            } => {
                let request = FollowUpRequest {
                    group_id: parse_id(&group_id)?,
                    amount,
                    idempotency_key: key_or_new(key),
                };
                run_operation(timeout, |orchestrator, ctx| async move {
                    orchestrator.refund(request, &ctx).await
                })
                .await
            }
            Commands::Void { group_id, key } => {
                let request = VoidRequest {
                    group_id: parse_id(&group_id)?,
                    idempotency_key: key_or_new(key),
                };
                run_operation(timeout, |orchestrator, ctx| async move {
                    orchestrator.void(request, &ctx).await
                })
                .await
            }
            Commands::Store { method } => {
                let request = method.into_request();
                run_operation(timeout, |orchestrator, ctx| async move {
                    orchestrator.store_payment_method(request, &ctx).await
                })
                .await
            }
            Commands::PreNote { method } => {
                let request = method.into_request();
                run_operation(timeout, |orchestrator, ctx| async move {
                    orchestrator.pre_note(request, &ctx).await
                })
                .await
            }
            Commands::State { group_id } => show_state(&group_id).await,
            Commands::Pending { older_than } => list_pending(older_than).await,
            Commands::Reference { id } => show_reference(&id),
            Commands::Health => check_health().await,
            Commands::Config => show_config(),
        }
    }
}

impl PaymentArgs {
    fn into_request(self) -> PaymentRequest {
        PaymentRequest {
            merchant_id: self.merchant,
            amount: self.amount,
            payment_token: self.token,
            idempotency_key: key_or_new(self.key),
        }
    }
}

impl PaymentMethodArgs {
    fn into_request(self) -> PaymentMethodRequest {
        PaymentMethodRequest {
            merchant_id: self.merchant,
            payment_token: self.token,
            idempotency_key: key_or_new(self.key),
        }
    }
}

fn parse_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid ID: {}", value))
}

fn key_or_new(key: Option<String>) -> String {
    key.unwrap_or_else(|| {
        let key = Uuid::new_v4().to_string();
        eprintln!("Idempotency key: {} (reuse it to retry safely)", key);
        key
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Open the configured ledger
async fn open_ledger(cfg: &ResolvedConfig) -> Result<LedgerStore> {
    let store = LedgerStore::open(&cfg.ledger)
        .await
        .with_context(|| format!("Failed to open ledger: {}", cfg.ledger.display()))?;
    Ok(store.with_references(cfg.reference_mapper(), cfg.reference_collision_window))
}

fn build_client(cfg: &ResolvedConfig) -> Result<GatewayClient> {
    let mapper = cfg.reference_mapper();
    let gateway = Arc::new(HttpGateway::new(cfg.gateway_url()?, mapper));
    let breaker = Arc::new(CircuitBreaker::new("http", cfg.breaker_config()));

    Ok(GatewayClient::new(
        gateway,
        breaker,
        RetryExecutor::new(cfg.retry.clone()),
        cfg.gateway.timeout,
        mapper,
    ))
}

/// Build the orchestrator, run one operation with Ctrl-C wired to
/// cancellation, and print the resulting record
async fn run_operation<F, Fut>(timeout: Option<Duration>, op: F) -> Result<()>
where
    F: FnOnce(Arc<TransactionOrchestrator>, CallContext) -> Fut,
    Fut: std::future::Future<Output = Result<TransactionResponse, crate::error::TransactionError>>,
{
    let cfg = config::config()?;
    let store = open_ledger(cfg).await?;
    let client = build_client(cfg)?;
    let monitor = BreakerMonitor::start(Arc::clone(client.breaker()), cfg.breaker.monitor_interval);
    let orchestrator = Arc::new(TransactionOrchestrator::new(
        store,
        client,
        cfg.idempotency,
        cfg.rules,
    ));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling operation");
            on_signal.cancel();
        }
    });

    let mut ctx = CallContext::new(cancel);
    if let Some(timeout) = timeout {
        ctx = ctx.with_timeout(timeout);
    }

    let result = op(orchestrator, ctx).await;

    signal.abort();
    monitor.stop().await;

    let response = result?;
    if response.replayed() {
        info!("Returned the original outcome for this idempotency key");
    }
    print_json(&response)
}

/// Show the derived state of a group
async fn show_state(group_id: &str) -> Result<()> {
    let group_id = parse_id(group_id)?;
    let cfg = config::config()?;
    let store = open_ledger(cfg).await?;

    let records = store.load_group(group_id).await?;
    if records.is_empty() {
        anyhow::bail!("No transaction group found for {}", group_id);
    }

    let state = GroupState::from_records(&records);
    println!("Group: {}", group_id);
    println!("Authorized: {}", state.authorized_amount);
    println!("Captured:   {}", state.captured_amount);
    println!("Refunded:   {}", state.refunded_amount);
    println!("Voided:     {}", state.voided);
    println!();
    println!(
        "{:<38} {:<9} {:>12} {:<9} {:<6}",
        "RECORD ID", "TYPE", "AMOUNT", "STATUS", "CODE"
    );
    println!("{}", "-".repeat(78));
    for record in &records {
        println!(
            "{:<38} {:<9} {:>12} {:<9} {:<6}",
            record.id,
            record.txn_type.as_str(),
            record.amount,
            record.status.as_str(),
            record.response_code.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

/// Cutoff for records created at least `older_than` seconds ago
fn pending_cutoff(
    now: chrono::DateTime<chrono::Utc>,
    older_than: u64,
) -> Result<chrono::DateTime<chrono::Utc>> {
    let cutoff = i64::try_from(older_than)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|age| now.checked_sub_signed(age));
    match cutoff {
        Some(cutoff) => Ok(cutoff),
        None => bail!("--older-than {} is out of range", older_than),
    }
}

/// List records still pending
async fn list_pending(older_than: u64) -> Result<()> {
    let cutoff = pending_cutoff(chrono::Utc::now(), older_than)?;
    let cfg = config::config()?;
    let store = open_ledger(cfg).await?;
    let pending = store.pending_records(cutoff).await?;

    if pending.is_empty() {
        println!("No pending records");
        return Ok(());
    }

    let mapper = store.mapper();
    println!(
        "{:<38} {:<9} {:>12} {:<20} {:<8}",
        "RECORD ID", "TYPE", "AMOUNT", "REFERENCE", "LEASE"
    );
    println!("{}", "-".repeat(90));
    let now = chrono::Utc::now();
    for stored in pending {
        let lease = match stored.lease {
            Some(lease) if !lease.is_expired(now) => "held",
            Some(_) => "expired",
            None => "free",
        };
        println!(
            "{:<38} {:<9} {:>12} {:<20} {:<8}",
            stored.record.id,
            stored.record.txn_type.as_str(),
            stored.record.amount,
            mapper.format(stored.record.gateway_reference),
            lease
        );
    }

    Ok(())
}

/// Show the plain numeric reference for an ID
fn show_reference(id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let mapper = config::config()?.reference_mapper();
    println!("{}", mapper.format(mapper.reference_for(&id)));
    Ok(())
}

async fn check_health() -> Result<()> {
    let cfg = config::config()?;
    let client = build_client(cfg)?;

    match client.health_check().await {
        Ok(()) => println!("Gateway '{}': healthy", client.gateway_name()),
        Err(e) => println!("Gateway '{}': unhealthy ({})", client.gateway_name(), e),
    }
    print_json(&client.breaker().snapshot())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("payledger configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:   {}", cfg.home.display());
    println!("  Ledger: {}", cfg.ledger.display());
    println!();
    println!("Gateway:");
    println!("  URL:              {}", cfg.gateway.url.as_deref().unwrap_or("(not set)"));
    println!("  Timeout:          {}s", cfg.gateway.timeout.as_secs());
    println!("  Reference digits: {}", cfg.gateway.reference_digits);
    println!();
    println!("Circuit breaker:");
    println!("  Failure threshold: {}", cfg.breaker.failure_threshold);
    println!("  Cool-down:         {}s", cfg.breaker.cooldown.as_secs());
    println!("  Monitor interval:  {}s", cfg.breaker.monitor_interval.as_secs());
    println!();
    println!("Retry:");
    println!("  Max attempts:  {}", cfg.retry.max_attempts);
    println!("  Initial delay: {}ms", cfg.retry.initial_delay_ms);
    println!("  Max delay:     {}ms", cfg.retry.max_delay_ms);
    println!("  Multiplier:    {}", cfg.retry.backoff_multiplier);
    println!();
    println!("Idempotency:");
    println!("  Lease:         {}s", cfg.idempotency.lease_ttl.as_secs());
    println!("  Poll interval: {}ms", cfg.idempotency.poll_interval.as_millis());
    println!();
    println!("Rules:");
    println!("  Multi-capture:           {}", cfg.rules.multi_capture);
    println!(
        "  Reference window:        {}h",
        cfg.reference_collision_window.as_secs() / 3600
    );

    Ok(())
}
