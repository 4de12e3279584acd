use crate::{
    chains::evm::Ledger,
    config::ExecutionPolicy,
    errors::SwapError,
    quote::SwapQuote,
    tokens::Token,
    universal_router::verify_swap_calldata,
};
use alloy::{
    network::TransactionBuilder as _,
    primitives::{Address, B256, U256},
    rpc::types::TransactionRequest,
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GasSource {
    Estimated,
    Default,
}

/// Terminal record of one submitted swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub confirmations: u64,
    pub success: bool,
    pub gas_limit: u64,
    pub gas_source: GasSource,
    pub gas_used: u64,
}

/// `ceil(base * headroom_bps / 10000)`, saturating at `u64::MAX`.
pub fn gas_limit_with_headroom(base: u64, headroom_bps: u64) -> u64 {
    let scaled = u128::from(base) * u128::from(headroom_bps);
    u64::try_from(scaled.div_ceil(10_000)).unwrap_or(u64::MAX)
}

pub struct SwapExecutor<'a, L> {
    ledger: &'a L,
    policy: &'a ExecutionPolicy,
    router: Address,
}

impl<'a, L: Ledger> SwapExecutor<'a, L> {
    pub const fn new(ledger: &'a L, policy: &'a ExecutionPolicy, router: Address) -> Self {
        Self {
            ledger,
            policy,
            router,
        }
    }

    /// Validate, submit and confirm one quoted swap. Nothing is sent unless the quote has
    /// call data, its swap parameters are sane, and the router has deployed code. A
    /// failed gas estimate falls back to the configured default limit. No retries.
    pub async fn execute(
        &self,
        quote: &SwapQuote,
        token_in: &Token,
        amount_in: U256,
    ) -> Result<SwapReceipt, SwapError> {
        let fail = |reason: String| SwapError::execution(&token_in.symbol, amount_in, reason);

        if quote.calldata().is_empty() {
            return Err(fail("quote carries no call data".to_owned()));
        }
        if quote.token_in().address != token_in.address || quote.amount_in() != amount_in {
            return Err(fail(format!(
                "quote is for {} {} but {} {} was requested",
                quote.amount_in(),
                quote.token_in().symbol,
                amount_in,
                token_in.symbol
            )));
        }
        if quote.to() != self.router {
            return Err(fail(format!(
                "quote targets {:#x}, configured router is {:#x}",
                quote.to(),
                self.router
            )));
        }
        let decoded = verify_swap_calldata(quote.calldata())
            .map_err(|e| fail(format!("swap parameters rejected: {e:#}")))?;
        if decoded.has_permit() != quote.carries_permit() {
            return Err(fail(format!(
                "calldata permit command present={} but quote says {}",
                decoded.has_permit(),
                quote.carries_permit()
            )));
        }

        let code = self
            .ledger
            .contract_code(self.router)
            .await
            .map_err(|e| fail(format!("read router code: {e:#}")))?;
        if code.is_empty() {
            return Err(fail(format!("no contract code at router {:#x}", self.router)));
        }

        let tx = TransactionRequest::default()
            .with_from(self.ledger.wallet_address())
            .with_to(self.router)
            .with_input(quote.calldata().clone())
            .with_value(quote.value());

        let (base_gas, gas_source) = match self.ledger.estimate_gas(&tx).await {
            Ok(g) => (g, GasSource::Estimated),
            Err(e) => {
                tracing::warn!(
                    token_in = %token_in.symbol,
                    error = %format!("{e:#}"),
                    default_gas_limit = self.policy.default_gas_limit,
                    "gas estimation failed; using default limit"
                );
                (self.policy.default_gas_limit, GasSource::Default)
            }
        };
        let gas_limit = gas_limit_with_headroom(base_gas, self.policy.gas_headroom_bps);
        let tx = tx.with_gas_limit(gas_limit);

        let hash = self
            .ledger
            .send_transaction(tx)
            .await
            .map_err(|e| fail(format!("submit: {e:#}")))?;
        tracing::info!(
            token_in = %token_in.symbol,
            tx_hash = %hash,
            gas_limit,
            gas_source = ?gas_source,
            quoted_gas = quote.estimated_gas(),
            amount_out_min = %quote.amount_out_min(),
            deadline = %decoded.deadline,
            "swap sent"
        );

        let outcome = self
            .ledger
            .wait_for_confirmations(
                hash,
                self.policy.confirmations,
                self.policy.receipt_timeout,
                self.policy.receipt_poll,
            )
            .await
            .map_err(|e| fail(format!("confirm {hash:#x}: {e:#}")))?;
        if !outcome.success {
            return Err(fail(format!("transaction {hash:#x} reverted")));
        }

        Ok(SwapReceipt {
            tx_hash: outcome.hash,
            block_number: outcome.block_number,
            confirmations: outcome.confirmations,
            success: outcome.success,
            gas_limit,
            gas_source,
            gas_used: outcome.gas_used,
        })
    }
}
