//! Batch analysis orchestration: fans a list of wallets out over a bounded
//! worker pool, runs the swap -> event -> match -> aggregate pipeline for
//! each, and records per-wallet outcomes so a failed wallet never sinks the
//! batch.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use config_manager::SystemConfig;
use pnl_core::{
    group_events_by_token, FifoMatcher, FilterConfig, PnLError, PortfolioAggregator,
    PortfolioPnLResult, ProcessedSwap, SwapNormalizer,
};
use persistence_layer::{BatchJobRecord, JobStatus, JobStore, PersistenceError};

/// Default native asset mint assumed when a chain has no specific mapping.
const SOLANA_NATIVE_MINT: &str = "So11111111111111111111111111111111111111112";

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("PnL calculation error: {0}")]
    Core(#[from] PnLError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Swap history provider error: {0}")]
    Provider(String),

    #[error("Wallet analysis timed out after {0} seconds")]
    WalletTimeout(u64),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {0} is {1} and cannot accept a run")]
    NotRunnable(Uuid, JobStatus),

    #[error("Invalid batch request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Source of raw swap history and spot prices.
#[async_trait]
pub trait SwapHistoryProvider: Send + Sync {
    /// Full swap history for a wallet, oldest first.
    async fn fetch_swaps(&self, wallet_address: &str, chain: &str) -> Result<Vec<ProcessedSwap>>;

    /// Spot USD prices for open positions. Best-effort; tokens absent from
    /// the returned map simply report no unrealized PnL.
    async fn current_prices(
        &self,
        _token_addresses: &[String],
        _chain: &str,
    ) -> Result<HashMap<String, Decimal>> {
        Ok(HashMap::new())
    }

    /// Mint of the chain's native asset.
    fn native_token(&self, _chain: &str) -> String {
        SOLANA_NATIVE_MINT.to_string()
    }
}

/// Drives batch jobs end to end against a provider and a job store.
pub struct BatchOrchestrator {
    provider: Arc<dyn SwapHistoryProvider>,
    store: Arc<dyn JobStore>,
    config: SystemConfig,
    filter: FilterConfig,
    cancel_flags: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl BatchOrchestrator {
    pub fn new(
        provider: Arc<dyn SwapHistoryProvider>,
        store: Arc<dyn JobStore>,
        config: SystemConfig,
    ) -> Self {
        let filter = FilterConfig {
            short_hold_seconds: config.filter.short_hold_seconds,
            near_zero_pnl_usd: Decimal::from_f64(config.filter.near_zero_pnl_usd)
                .unwrap_or_else(|| FilterConfig::default().near_zero_pnl_usd),
        };
        Self {
            provider,
            store,
            config,
            filter,
            cancel_flags: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new batch job in `Pending` state and return its id.
    /// Duplicate wallet addresses are collapsed, first occurrence wins. An
    /// empty wallet set is a batch-level fault: the job is stored `Failed`
    /// so the submission stays auditable.
    pub async fn submit_batch(
        &self,
        wallets: Vec<String>,
        chain: Option<String>,
    ) -> Result<Uuid> {
        let mut seen = std::collections::HashSet::new();
        let wallets: Vec<String> = wallets
            .into_iter()
            .filter(|w| !w.trim().is_empty())
            .filter(|w| seen.insert(w.clone()))
            .collect();

        let chain = chain.unwrap_or_else(|| self.config.default_chain.clone());
        let mut record = BatchJobRecord::new(wallets, chain);

        if record.wallet_addresses.is_empty() {
            warn!("Batch submitted with no wallet addresses, storing as failed");
            record.status = JobStatus::Failed;
            record.completed_at = Some(Utc::now());
            record.error_summary = Some("batch contains no wallet addresses".to_string());
            self.store.put_job(&record).await?;
            return Ok(record.id);
        }

        self.store.put_job(&record).await?;
        info!(
            "Submitted batch job {} for {} wallets on {}",
            record.id, record.wallet_count, record.chain
        );
        Ok(record.id)
    }

    /// Execute a job to completion. A `Failed` job (crashed or cancelled)
    /// may be run again to resume: wallets with a recorded outcome are left
    /// alone and only the unattempted remainder is analyzed. Running or
    /// `Completed` jobs reject the run.
    pub async fn run_job(&self, job_id: Uuid) -> Result<BatchJobRecord> {
        let mut record = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;

        match record.status {
            JobStatus::Pending | JobStatus::Failed => {}
            status @ (JobStatus::Running | JobStatus::Completed) => {
                return Err(OrchestratorError::NotRunnable(job_id, status));
            }
        }
        if record.wallet_addresses.is_empty() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "job {} has no wallet addresses",
                job_id
            )));
        }

        let cancel_flag = self.cancel_flag(job_id).await;
        cancel_flag.store(false, Ordering::SeqCst);

        let mut pending = Vec::new();
        for wallet in record.pending_wallets() {
            if self.store.has_wallet_result(job_id, &wallet).await? {
                debug!("Skipping wallet {} with stored result", wallet);
                record.successful_wallets.push(wallet);
            } else {
                pending.push(wallet);
            }
        }

        record.status = JobStatus::Running;
        record.started_at.get_or_insert_with(Utc::now);
        // Failure entries from earlier runs stay; only a stale cancellation
        // note is cleared now that the job is moving again.
        let mut failures = summary_entries(record.error_summary.as_deref());
        failures.retain(|entry| !entry.starts_with("cancelled"));
        record.error_summary = join_entries(&failures);
        self.store.put_job(&record).await?;

        info!(
            "Running job {}: {} wallets pending, {} already done",
            job_id,
            pending.len(),
            record.successful_wallets.len()
        );

        let timeout_seconds = self.config.system.wallet_timeout_seconds;
        let chain = record.chain.clone();
        let mut outcomes = stream::iter(pending.into_iter().map(|wallet| {
            let chain = chain.clone();
            async move {
                let analysis = tokio::time::timeout(
                    Duration::from_secs(timeout_seconds),
                    self.analyze_wallet(&wallet, &chain),
                )
                .await
                .unwrap_or(Err(OrchestratorError::WalletTimeout(timeout_seconds)));
                (wallet, analysis)
            }
        }))
        .buffer_unordered(self.config.system.max_concurrent_wallets.max(1));

        // Single aggregation point: workers only compute, this loop is the
        // sole writer of job state.
        while let Some((wallet, analysis)) = outcomes.next().await {
            match analysis {
                Ok(result) => {
                    self.store.put_wallet_result(job_id, &result).await?;
                    record.successful_wallets.push(wallet);
                }
                Err(e) => {
                    warn!("Wallet {} failed: {}", wallet, e);
                    failures.push(format!("{}: {}", wallet, e));
                    record.failed_wallets.push(wallet);
                    record.error_summary = join_entries(&failures);
                }
            }
            self.store.put_job(&record).await?;

            if cancel_flag.load(Ordering::SeqCst) {
                drop(outcomes);
                return self.finish_cancelled(record, failures).await;
            }
        }

        record.status = JobStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.error_summary = join_entries(&failures);
        self.store.put_job(&record).await?;

        info!(
            "Job {} completed: {} succeeded, {} failed",
            job_id,
            record.successful_wallets.len(),
            record.failed_wallets.len()
        );
        Ok(record)
    }

    /// Request cancellation of a running job. The job stops after the wallet
    /// currently in flight and is recorded as `Failed` with its progress
    /// kept, so a later `run_job` resumes where it left off.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<()> {
        let record = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;

        match record.status {
            JobStatus::Running => {
                self.cancel_flag(job_id).await.store(true, Ordering::SeqCst);
                info!("Cancellation requested for job {}", job_id);
            }
            JobStatus::Pending => {
                let mut record = record;
                record.status = JobStatus::Failed;
                record.completed_at = Some(Utc::now());
                record.error_summary = Some("cancelled before start".to_string());
                self.store.put_job(&record).await?;
            }
            JobStatus::Completed | JobStatus::Failed => {
                debug!("Ignoring cancel for finished job {}", job_id);
            }
        }
        Ok(())
    }

    /// Put a finished job's failed wallets back into the unattempted pool
    /// and return the job to `Pending` so a fresh `run_job` retries them.
    /// Failed wallets are never retried implicitly; this is the explicit
    /// requeue step.
    pub async fn requeue_failed_wallets(&self, job_id: Uuid) -> Result<BatchJobRecord> {
        let mut record = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;

        match record.status {
            JobStatus::Completed | JobStatus::Failed => {}
            status @ (JobStatus::Pending | JobStatus::Running) => {
                return Err(OrchestratorError::NotRunnable(job_id, status));
            }
        }

        let requeued = std::mem::take(&mut record.failed_wallets);
        let mut entries = summary_entries(record.error_summary.as_deref());
        entries.retain(|entry| {
            !requeued
                .iter()
                .any(|w| entry.starts_with(&format!("{}:", w)))
        });
        record.error_summary = join_entries(&entries);
        record.status = JobStatus::Pending;
        record.completed_at = None;

        self.store.put_job(&record).await?;
        info!(
            "Requeued {} failed wallets on job {}",
            requeued.len(),
            job_id
        );
        Ok(record)
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<BatchJobRecord> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    pub async fn wallet_results(&self, job_id: Uuid) -> Result<Vec<PortfolioPnLResult>> {
        Ok(self.store.wallet_results(job_id).await?)
    }

    /// Full pipeline for one wallet.
    async fn analyze_wallet(&self, wallet: &str, chain: &str) -> Result<PortfolioPnLResult> {
        let swaps = self.provider.fetch_swaps(wallet, chain).await?;
        debug!("Fetched {} swaps for wallet {}", swaps.len(), wallet);

        let normalizer =
            SwapNormalizer::new(wallet.to_string(), self.provider.native_token(chain));
        let events = normalizer.normalize_all(&swaps)?;

        let matcher = FifoMatcher::new();
        let outcomes: Vec<_> = group_events_by_token(events)
            .into_iter()
            .map(|(token, events)| matcher.match_token(&token, &events))
            .collect();

        let open_tokens: Vec<String> = outcomes
            .iter()
            .filter(|o| o.remaining_position.is_some())
            .map(|o| o.token_address.clone())
            .collect();
        let prices = if open_tokens.is_empty() {
            HashMap::new()
        } else {
            match self.provider.current_prices(&open_tokens, chain).await {
                Ok(prices) => prices,
                Err(e) => {
                    warn!("Spot price lookup failed for {}: {}", wallet, e);
                    HashMap::new()
                }
            }
        };

        let aggregator = PortfolioAggregator::new(self.filter.clone());
        Ok(aggregator.aggregate(wallet, outcomes, &prices))
    }

    /// Persist a cancelled job as `Failed`. Recorded outcomes stay in
    /// place and unattempted wallets remain derivable from the wallet set,
    /// so a later `run_job` picks up exactly where this one stopped.
    async fn finish_cancelled(
        &self,
        mut record: BatchJobRecord,
        mut failures: Vec<String>,
    ) -> Result<BatchJobRecord> {
        record.status = JobStatus::Failed;
        record.completed_at = Some(Utc::now());
        let unattempted = record.pending_wallets().len();
        failures.push(format!("cancelled with {} wallets unattempted", unattempted));
        record.error_summary = join_entries(&failures);
        self.store.put_job(&record).await?;

        error!(
            "Job {} cancelled: {} done, {} unattempted",
            record.id,
            record.successful_wallets.len() + record.failed_wallets.len(),
            unattempted
        );
        Ok(record)
    }

    async fn cancel_flag(&self, job_id: Uuid) -> Arc<AtomicBool> {
        self.cancel_flags
            .lock()
            .await
            .entry(job_id)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }
}

/// Split a stored error summary back into its `; `-joined entries.
fn summary_entries(summary: Option<&str>) -> Vec<String> {
    summary
        .map(|s| s.split("; ").map(str::to_string).collect())
        .unwrap_or_default()
}

fn join_entries(entries: &[String]) -> Option<String> {
    if entries.is_empty() {
        None
    } else {
        Some(entries.join("; "))
    }
}
