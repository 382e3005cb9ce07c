//! Storage for batch job records and per-wallet analysis results.
//!
//! Records are kept as JSON documents behind the [`JobStore`] trait, so a
//! database-backed store and the in-memory store used by tests and the CLI
//! share one contract. Older persisted records may predate the wallet outcome
//! columns; deserialization fills those with empty defaults.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pnl_core::PortfolioPnLResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Lifecycle of a batch job. A cancelled job is recorded as `Failed` with its
/// progress preserved; there is no separate cancelled state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted state of one batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJobRecord {
    pub id: Uuid,
    pub status: JobStatus,
    pub wallet_count: usize,
    pub chain: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Every wallet the batch owes an outcome for, in submission order.
    #[serde(default)]
    pub wallet_addresses: Vec<String>,
    /// Wallets whose analysis finished and was stored. Append-only while
    /// the job runs.
    #[serde(default)]
    pub successful_wallets: Vec<String>,
    /// Wallets attempted and failed, with no stored result. Append-only
    /// while the job runs; a wallet in neither list is unattempted.
    #[serde(default)]
    pub failed_wallets: Vec<String>,
    /// Human-readable digest of per-wallet failures, if any.
    #[serde(default)]
    pub error_summary: Option<String>,
}

impl BatchJobRecord {
    pub fn new(wallet_addresses: Vec<String>, chain: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            wallet_count: wallet_addresses.len(),
            chain,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            wallet_addresses,
            successful_wallets: Vec::new(),
            failed_wallets: Vec::new(),
            error_summary: None,
        }
    }

    /// Wallets with no recorded outcome yet.
    pub fn pending_wallets(&self) -> Vec<String> {
        self.wallet_addresses
            .iter()
            .filter(|w| {
                !self.successful_wallets.contains(w) && !self.failed_wallets.contains(w)
            })
            .cloned()
            .collect()
    }
}

/// Persistence contract shared by all job stores.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put_job(&self, record: &BatchJobRecord) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Option<BatchJobRecord>>;
    async fn list_jobs(&self) -> Result<Vec<BatchJobRecord>>;

    async fn put_wallet_result(&self, job_id: Uuid, result: &PortfolioPnLResult) -> Result<()>;
    async fn wallet_results(&self, job_id: Uuid) -> Result<Vec<PortfolioPnLResult>>;
    async fn has_wallet_result(&self, job_id: Uuid, wallet_address: &str) -> Result<bool>;
}

/// In-memory store keeping every record as its serialized JSON form, the same
/// shape a database row would hold.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, String>>,
    results: Mutex<HashMap<Uuid, Vec<String>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put_job(&self, record: &BatchJobRecord) -> Result<()> {
        let serialized = serde_json::to_string(record)?;
        self.jobs.lock().await.insert(record.id, serialized);
        debug!("Stored job {} with status {}", record.id, record.status);
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<BatchJobRecord>> {
        let jobs = self.jobs.lock().await;
        match jobs.get(&id) {
            Some(serialized) => Ok(Some(serde_json::from_str(serialized)?)),
            None => Ok(None),
        }
    }

    async fn list_jobs(&self) -> Result<Vec<BatchJobRecord>> {
        let jobs = self.jobs.lock().await;
        let mut records = Vec::with_capacity(jobs.len());
        for serialized in jobs.values() {
            records.push(serde_json::from_str(serialized)?);
        }
        Ok(records)
    }

    async fn put_wallet_result(&self, job_id: Uuid, result: &PortfolioPnLResult) -> Result<()> {
        let serialized = serde_json::to_string(result)?;
        self.results
            .lock()
            .await
            .entry(job_id)
            .or_default()
            .push(serialized);
        Ok(())
    }

    async fn wallet_results(&self, job_id: Uuid) -> Result<Vec<PortfolioPnLResult>> {
        let results = self.results.lock().await;
        let Some(serialized) = results.get(&job_id) else {
            return Ok(Vec::new());
        };
        serialized
            .iter()
            .map(|s| serde_json::from_str(s).map_err(PersistenceError::from))
            .collect()
    }

    async fn has_wallet_result(&self, job_id: Uuid, wallet_address: &str) -> Result<bool> {
        let results = self.wallet_results(job_id).await?;
        Ok(results.iter().any(|r| r.wallet_address == wallet_address))
    }
}
