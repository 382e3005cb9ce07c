//! Batch PnL analyzer CLI.
//!
//! Reads wallet swap histories from a JSON fixture file, runs the batch
//! pipeline over every wallet in it, prints a portfolio summary, and writes a
//! per-token CSV report.
//!
//! Usage: `pnl_analyzer <fixture.json> [report.csv]`

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config_manager::SystemConfig;
use job_orchestrator::{BatchOrchestrator, OrchestratorError, SwapHistoryProvider};
use persistence_layer::InMemoryJobStore;
use pnl_core::{PortfolioPnLResult, ProcessedSwap};

/// On-disk input: swap histories per wallet plus optional spot prices for
/// valuing open positions.
#[derive(Debug, Deserialize)]
struct Fixture {
    wallets: HashMap<String, Vec<ProcessedSwap>>,
    #[serde(default)]
    current_prices: HashMap<String, Decimal>,
}

struct FixtureProvider {
    fixture: Fixture,
}

#[async_trait]
impl SwapHistoryProvider for FixtureProvider {
    async fn fetch_swaps(
        &self,
        wallet_address: &str,
        _chain: &str,
    ) -> job_orchestrator::Result<Vec<ProcessedSwap>> {
        self.fixture
            .wallets
            .get(wallet_address)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::Provider(format!("no history for wallet {}", wallet_address))
            })
    }

    async fn current_prices(
        &self,
        token_addresses: &[String],
        _chain: &str,
    ) -> job_orchestrator::Result<HashMap<String, Decimal>> {
        Ok(token_addresses
            .iter()
            .filter_map(|t| {
                self.fixture
                    .current_prices
                    .get(t)
                    .map(|p| (t.clone(), *p))
            })
            .collect())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let fixture_path = args
        .get(1)
        .map(String::as_str)
        .unwrap_or("swaps.json");
    let report_path = args.get(2).map(String::as_str).unwrap_or("pnl_report.csv");

    let config = SystemConfig::load().context("loading configuration")?;
    let fixture = load_fixture(fixture_path)
        .with_context(|| format!("loading fixture {}", fixture_path))?;

    let mut wallets: Vec<String> = fixture.wallets.keys().cloned().collect();
    wallets.sort();
    info!(
        "Loaded {} wallets from {} on chain {}",
        wallets.len(),
        fixture_path,
        config.default_chain
    );

    let orchestrator = BatchOrchestrator::new(
        Arc::new(FixtureProvider { fixture }),
        Arc::new(InMemoryJobStore::new()),
        config,
    );

    let job_id = orchestrator.submit_batch(wallets, None).await?;
    let record = orchestrator.run_job(job_id).await?;

    println!(
        "Job {}: {} ({} wallets succeeded, {} failed)",
        record.id,
        record.status,
        record.successful_wallets.len(),
        record.failed_wallets.len()
    );
    if let Some(summary) = &record.error_summary {
        println!("Failures: {}", summary);
    }

    let mut results = orchestrator.wallet_results(job_id).await?;
    results.sort_by(|a, b| a.wallet_address.cmp(&b.wallet_address));

    for result in &results {
        print_summary(result);
    }

    write_report(Path::new(report_path), &results)
        .with_context(|| format!("writing report {}", report_path))?;
    println!("Per-token report written to {}", report_path);

    Ok(())
}

fn load_fixture(path: &str) -> Result<Fixture> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn print_summary(result: &PortfolioPnLResult) {
    println!(
        "{}: realized ${}, phantom ${}, {} trades, win rate {:.1}%, streaks {}W/{}L ({} intermediaries filtered)",
        result.wallet_address,
        result.total_realized_pnl_usd,
        result.total_phantom_pnl_usd,
        result.total_trades,
        result.overall_win_rate,
        result.longest_win_streak,
        result.longest_loss_streak,
        result.intermediary_token_count
    );
}

fn write_report(path: &Path, results: &[PortfolioPnLResult]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "wallet",
        "token",
        "realized_pnl_usd",
        "phantom_pnl_usd",
        "unrealized_pnl_usd",
        "trades",
        "avg_hold_seconds",
        "remaining_quantity",
        "is_intermediary",
    ])?;

    for result in results {
        for token in &result.token_results {
            writer.write_record([
                result.wallet_address.as_str(),
                token.token_address.as_str(),
                &token.realized_pnl_usd.to_string(),
                &token.phantom_pnl_usd.to_string(),
                &token
                    .unrealized_pnl_usd
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
                &token.trade_count.to_string(),
                &format!("{:.1}", token.avg_hold_time_seconds),
                &token
                    .remaining_quantity
                    .map(|q| q.to_string())
                    .unwrap_or_default(),
                if token.is_intermediary { "true" } else { "false" },
            ])?;
        }
    }

    writer.flush()?;
    Ok(())
}
