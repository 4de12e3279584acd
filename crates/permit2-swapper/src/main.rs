#![recursion_limit = "256"]
#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

use clap::{Parser, Subcommand};
use eyre::Context as _;
use std::{io::Write as _, path::PathBuf, str::FromStr as _};
use tracing::Instrument as _;
use tracing_subscriber::prelude::*;

mod amount;
mod approval;
mod chains;
mod cli_output;
mod config;
mod errors;
mod events;
mod executor;
mod inspector;
mod orchestrator;
mod paths;
mod permit;
mod quote;
mod retry;
mod store;
#[cfg(test)]
mod testing;
mod tokens;
mod universal_router;

use crate::{
    chains::evm::EvmLedger,
    config::ResolvedConfig,
    errors::SwapError,
    events::TracingSink,
    inspector::Inspector,
    orchestrator::{Orchestrator, RunSummary},
    quote::{QuoterRouteFinder, ReferenceGasPriceSource},
    store::ConfigStore,
};

#[derive(Parser, Debug)]
#[command(name = "permit2-swapper", version)]
struct Cli {
    /// Config file (default: `<config_dir>/config.toml`). Environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute the configured swap batch: approve, sign one permit per input token, then
    /// quote and execute each request in order.
    Run {
        /// Emit the run summary as JSON on stdout instead of a table on stderr.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show balance, Permit2 allowance and router allowance per configured token.
    Allowance {
        /// Limit the report to one token, by symbol or address.
        #[arg(long)]
        token: Option<String>,

        /// Emit JSON to stdout (machine-readable).
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print the resolved configuration (the wallet secret is never shown).
    Config,

    /// Print resolved paths (useful for debugging).
    Paths,
}

fn init_logging(paths: &paths::SwapperPaths) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let file_name = paths
        .log_file
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("permit2-swapper.log.jsonl");
    let file_appender = tracing_appender::rolling::never(&paths.data_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_filter(env_filter.clone());
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn resolve(store: &ConfigStore) -> Result<ResolvedConfig, SwapError> {
    store.load()?.resolve(ConfigStore::load_secret())
}

async fn run(store: &ConfigStore, paths: &paths::SwapperPaths, json: bool) -> eyre::Result<()> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!("run", run_id = %run_id);

    let summary = match resolve(store) {
        Ok(cfg) => {
            let _lock = paths.acquire_run_lock()?;
            let signer = cfg.signer()?;
            let ledger = EvmLedger::new(&cfg, signer.clone());
            let finder = QuoterRouteFinder::new(
                &cfg,
                ReferenceGasPriceSource::new(&cfg.routing.gas_price_rpc_url),
            );
            let sink = TracingSink;
            tracing::info!(
                parent: &span,
                chain_id = cfg.chain_id,
                wallet = %cfg.wallet_address,
                swaps = cfg.swaps.len(),
                started_at = %chrono::Utc::now().to_rfc3339(),
                "run starting"
            );
            let summary = Orchestrator::new(&cfg, &ledger, &finder, &signer, &sink)
                .run(&run_id)
                .instrument(span)
                .await;
            summary
        }
        Err(e) => {
            tracing::error!(parent: &span, code = e.code(), error = %e, "configuration rejected");
            RunSummary::not_started(&run_id, &e)
        }
    };

    if json {
        cli_output::print_json(&mut std::io::stdout().lock(), &summary)?;
    } else {
        cli_output::print_summary_human(&mut std::io::stderr().lock(), &summary)?;
    }

    if !summary.is_fatal() {
        return Ok(());
    }
    let reason = summary
        .fatal
        .as_ref()
        .map(|f| format!("{} ({}): {}", f.phase, f.code, f.message))
        .unwrap_or_default();
    Err(eyre::eyre!("run halted in {reason}"))
}

async fn allowance(store: &ConfigStore, token: Option<&str>, json: bool) -> eyre::Result<()> {
    let cfg = resolve(store)?;
    let signer = cfg.signer()?;
    let ledger = EvmLedger::new(&cfg, signer);
    let inspector = Inspector::new(&ledger);

    let selected: Vec<_> = match token {
        Some(key) => {
            let by_addr = || {
                alloy::primitives::Address::from_str(key.trim())
                    .ok()
                    .and_then(|a| cfg.tokens.by_address(a))
            };
            vec![cfg
                .tokens
                .get(key)
                .or_else(by_addr)
                .ok_or_else(|| eyre::eyre!("unknown or unconfigured token {key}"))?]
        }
        None => cfg.tokens.iter().collect(),
    };
    let mut reports = Vec::with_capacity(selected.len());
    for t in selected {
        reports.push(
            inspector
                .report(t, cfg.wallet_address, cfg.permit2, cfg.universal_router)
                .await?,
        );
    }

    if json {
        cli_output::print_json(&mut std::io::stdout().lock(), &reports)
    } else {
        cli_output::print_reports_human(&mut std::io::stderr().lock(), &reports)
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let paths = paths::SwapperPaths::discover()?;
    std::fs::create_dir_all(&paths.data_dir).context("create data dir")?;
    let _log_guard = init_logging(&paths);
    let store = ConfigStore::new(&paths, cli.config);

    match cli.cmd {
        Command::Run { json } => run(&store, &paths, json).await,
        Command::Allowance { token, json } => allowance(&store, token.as_deref(), json)
            .await
            .context("allowance report failed"),
        Command::Config => {
            let cfg = resolve(&store)?;
            cli_output::print_json(&mut std::io::stdout().lock(), &cfg.redacted_json())
        }
        Command::Paths => {
            let s = serde_json::to_string(&serde_json::json!({
              "config_dir": paths.config_dir,
              "data_dir": paths.data_dir,
              "log_file": paths.log_file,
              "config_file": store.path(),
            }))
            .context("serialize paths")?;
            writeln!(std::io::stdout().lock(), "{s}").context("write paths")?;
            Ok(())
        }
    }
}
