//! User-facing output. Machine-readable JSON goes to stdout; the human summary goes to
//! stderr next to the log stream.

use crate::{
    inspector::TokenReport,
    orchestrator::{RunSummary, SwapStatus},
};
use eyre::Context as _;
use std::io::Write;

pub fn print_json(out: &mut impl Write, value: &impl serde::Serialize) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(value).context("serialize json")?;
    writeln!(out, "{s}").context("write json")?;
    Ok(())
}

pub fn print_summary_human(out: &mut impl Write, s: &RunSummary) -> eyre::Result<()> {
    writeln!(out, "permit2-swapper run {}", s.run_id).context("write header")?;
    writeln!(out, "  wallet: {:#x} (chain {})", s.wallet, s.chain_id).context("write header")?;
    writeln!(out).context("write newline")?;

    if !s.approvals.is_empty() {
        writeln!(out, "Approvals:").context("write approvals header")?;
        for a in &s.approvals {
            let status = a
                .tx_hash
                .map_or_else(|| "already sufficient".to_owned(), |h| format!("approved in {h:#x}"));
            writeln!(out, "  {:<6} -> {:#x}: {status}", a.token, a.spender)
                .context("write approval")?;
        }
        writeln!(out).context("write newline")?;
    }

    writeln!(out, "Swaps:").context("write swaps header")?;
    for o in &s.swaps {
        let pair = format!("{} {} -> {}", o.amount, o.token_in, o.token_out);
        let line = match &o.status {
            SwapStatus::Succeeded {
                receipt,
                expected_out,
                fee_tier,
            } => format!(
                "ok       {:#x} block {} gas {}/{} (expected out {expected_out}, fee {fee_tier})",
                receipt.tx_hash, receipt.block_number, receipt.gas_used, receipt.gas_limit
            ),
            SwapStatus::Skipped { reason } => format!("skipped  {reason}"),
            SwapStatus::Failed { phase, code, error } => {
                format!("failed   [{phase}/{code}] {error}")
            }
        };
        writeln!(out, "  #{:<2} {pair:<28} {line}", o.index).context("write swap")?;
    }
    writeln!(out).context("write newline")?;

    writeln!(
        out,
        "Result: {} succeeded, {} skipped, {} failed (final phase: {})",
        s.succeeded(),
        s.skipped(),
        s.failed(),
        s.final_phase
    )
    .context("write result")?;
    if let Some(f) = &s.fatal {
        writeln!(out, "Fatal: [{}/{}] {}", f.phase, f.code, f.message).context("write fatal")?;
    }
    Ok(())
}

pub fn print_reports_human(out: &mut impl Write, reports: &[TokenReport]) -> eyre::Result<()> {
    writeln!(
        out,
        "{:<6} {:>24} {:>10} {:>12} {:>6}",
        "token", "balance", "permit2", "router exp", "nonce"
    )
    .context("write report header")?;
    for r in reports {
        let class = serde_json::to_value(r.permit2_allowance_class)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        writeln!(
            out,
            "{:<6} {:>24} {:>10} {:>12} {:>6}",
            r.symbol, r.balance, class, r.router_allowance_expiration, r.router_nonce
        )
        .context("write report")?;
    }
    Ok(())
}
