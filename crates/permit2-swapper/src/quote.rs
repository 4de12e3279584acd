use crate::{
    chains::evm::provider_for_url,
    config::{ResolvedConfig, RoutingPolicy},
    errors::SwapError,
    permit::{unix_now, PermitSignature},
    retry::{first_success, RetryPolicy},
    tokens::Token,
    universal_router::{encode_v3_path, RouterPlan, V3ExactIn},
};
use alloy::{
    primitives::{aliases::U24, Address, Bytes, U160, U256},
    providers::Provider as _,
    sol,
};
use eyre::Context as _;
use serde::Serialize;

sol! {
    #[sol(rpc)]
    contract IQuoterV2 {
        struct QuoteExactInputSingleParams {
            address tokenIn;
            address tokenOut;
            uint256 amountIn;
            uint24 fee;
            uint160 sqrtPriceLimitX96;
        }
        function quoteExactInputSingle(QuoteExactInputSingleParams params)
            external returns (uint256 amountOut, uint160 sqrtPriceX96After, uint32 initializedTicksCrossed, uint256 gasEstimate);
    }
}

/// Everything needed to submit one swap. Stale after a few blocks; use it promptly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapQuote {
    token_in: Token,
    token_out: Token,
    amount_in: U256,
    to: Address,
    calldata: Bytes,
    value: U256,
    estimated_gas: u64,
    expected_out: U256,
    amount_out_min: U256,
    fee_tier: u32,
    gas_price_wei: u128,
    carries_permit: bool,
}

/// Raw fields for [`SwapQuote::new`].
#[derive(Debug, Clone)]
pub struct QuoteParts {
    pub token_in: Token,
    pub token_out: Token,
    pub amount_in: U256,
    pub to: Address,
    pub calldata: Bytes,
    pub value: U256,
    pub estimated_gas: u64,
    pub expected_out: U256,
    pub amount_out_min: U256,
    pub fee_tier: u32,
    pub gas_price_wei: u128,
    pub carries_permit: bool,
}

impl SwapQuote {
    /// Call data is not checked here; the executor refuses empty call data itself.
    pub fn new(p: QuoteParts) -> eyre::Result<Self> {
        if p.token_in.address == p.token_out.address {
            eyre::bail!("quote input and output token are the same");
        }
        if p.amount_in.is_zero() {
            eyre::bail!("quote input amount is zero");
        }
        if p.amount_out_min > p.expected_out {
            eyre::bail!(
                "minimum output {} exceeds expected output {}",
                p.amount_out_min,
                p.expected_out
            );
        }
        Ok(Self {
            token_in: p.token_in,
            token_out: p.token_out,
            amount_in: p.amount_in,
            to: p.to,
            calldata: p.calldata,
            value: p.value,
            estimated_gas: p.estimated_gas,
            expected_out: p.expected_out,
            amount_out_min: p.amount_out_min,
            fee_tier: p.fee_tier,
            gas_price_wei: p.gas_price_wei,
            carries_permit: p.carries_permit,
        })
    }

    pub const fn token_in(&self) -> &Token {
        &self.token_in
    }
    pub const fn amount_in(&self) -> U256 {
        self.amount_in
    }
    pub const fn to(&self) -> Address {
        self.to
    }
    pub const fn calldata(&self) -> &Bytes {
        &self.calldata
    }
    pub const fn value(&self) -> U256 {
        self.value
    }
    pub const fn estimated_gas(&self) -> u64 {
        self.estimated_gas
    }
    pub const fn expected_out(&self) -> U256 {
        self.expected_out
    }
    pub const fn amount_out_min(&self) -> U256 {
        self.amount_out_min
    }
    pub const fn fee_tier(&self) -> u32 {
        self.fee_tier
    }
    pub const fn carries_permit(&self) -> bool {
        self.carries_permit
    }
}

/// Price of gas, in wei, as seen at a given block.
pub trait GasPriceSource {
    async fn gas_price(&self, block_number: u64) -> eyre::Result<u128>;
}

/// Gas price from one fixed reference endpoint, whatever network the swap runs on.
#[derive(Debug, Clone)]
pub struct ReferenceGasPriceSource {
    urls: Vec<String>,
    retry: RetryPolicy,
}

impl ReferenceGasPriceSource {
    pub fn new(url: &str) -> Self {
        Self {
            urls: vec![url.to_owned()],
            retry: RetryPolicy::default(),
        }
    }
}

impl GasPriceSource for ReferenceGasPriceSource {
    async fn gas_price(&self, block_number: u64) -> eyre::Result<u128> {
        let price = first_success(
            &self.urls,
            &self.retry,
            |u| {
                let p = provider_for_url(u);
                async move { p?.get_gas_price().await.context("reference gas price") }
            },
            "reference gas price",
        )
        .await?;
        tracing::debug!(block_number, gas_price_wei = price, "reference gas price");
        Ok(price)
    }
}

/// External path-finding service. `Ok(None)` means no viable route exists, which is a
/// normal answer; `Err` means the service itself could not be reached or misbehaved.
pub trait RouteFinder {
    async fn route(
        &self,
        amount_in: U256,
        token_in: &Token,
        token_out: &Token,
        permit: Option<&PermitSignature>,
    ) -> eyre::Result<Option<SwapQuote>>;
}

pub fn min_out_after_slippage(expected: U256, slippage_bps: u32) -> U256 {
    let keep = 10_000_u64.saturating_sub(u64::from(slippage_bps));
    expected.saturating_mul(U256::from(keep)) / U256::from(10_000_u64)
}

/// A quoter call that reverted means the pool for that tier does not exist or has no
/// liquidity. Anything else is an infrastructure problem.
fn is_no_pool(err: &eyre::Report) -> bool {
    let s = format!("{err:#}").to_lowercase();
    s.contains("execution reverted") || s.contains("revert")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierQuote {
    pub fee: u32,
    pub amount_out: U256,
    pub gas_estimate: u64,
}

/// Highest output across tiers. Reverting tiers are skipped; a transport failure on any
/// tier fails the whole lookup.
pub fn best_tier(
    results: impl IntoIterator<Item = (u32, eyre::Result<(U256, u64)>)>,
) -> eyre::Result<Option<TierQuote>> {
    let mut best: Option<TierQuote> = None;
    for (fee, res) in results {
        match res {
            Ok((amount_out, gas_estimate)) => {
                if amount_out.is_zero() {
                    continue;
                }
                if best.is_none_or(|b| amount_out > b.amount_out) {
                    best = Some(TierQuote {
                        fee,
                        amount_out,
                        gas_estimate,
                    });
                }
            }
            Err(e) if is_no_pool(&e) => {
                tracing::debug!(fee, error = %format!("{e:#}"), "no pool at fee tier");
            }
            Err(e) => return Err(e).with_context(|| format!("quote at fee tier {fee}")),
        }
    }
    Ok(best)
}

/// Single-hop router over Uniswap V3 pools via QuoterV2, encoding Universal Router
/// calldata for the winning tier.
#[derive(Debug, Clone)]
pub struct QuoterRouteFinder<G> {
    chain_id: u64,
    read_rpc_url: String,
    quoter: Address,
    router: Address,
    recipient: Address,
    policy: RoutingPolicy,
    gas: G,
}

impl<G: GasPriceSource> QuoterRouteFinder<G> {
    pub fn new(cfg: &ResolvedConfig, gas: G) -> Self {
        Self {
            chain_id: cfg.chain_id,
            read_rpc_url: cfg.routing.rpc_url.clone(),
            quoter: cfg.routing.quoter,
            router: cfg.universal_router,
            recipient: cfg.wallet_address,
            policy: cfg.routing.clone(),
            gas,
        }
    }

    async fn quote_tier(
        &self,
        provider: &crate::chains::evm::EvmProvider,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        fee: u32,
    ) -> eyre::Result<(U256, u64)> {
        let q = IQuoterV2::new(self.quoter, provider);
        let params = IQuoterV2::QuoteExactInputSingleParams {
            tokenIn: token_in,
            tokenOut: token_out,
            amountIn: amount_in,
            fee: U24::saturating_from(fee),
            sqrtPriceLimitX96: U160::ZERO,
        };
        let out = q
            .quoteExactInputSingle(params)
            .call()
            .await
            .context("quoter quoteExactInputSingle")?;
        Ok((out.amountOut, out.gasEstimate.saturating_to::<u64>()))
    }
}

impl<G: GasPriceSource> RouteFinder for QuoterRouteFinder<G> {
    async fn route(
        &self,
        amount_in: U256,
        token_in: &Token,
        token_out: &Token,
        permit: Option<&PermitSignature>,
    ) -> eyre::Result<Option<SwapQuote>> {
        let provider = provider_for_url(&self.read_rpc_url)?;

        let mut results = Vec::with_capacity(self.policy.fee_tiers.len());
        for &fee in &self.policy.fee_tiers {
            let r = self
                .quote_tier(&provider, token_in.address, token_out.address, amount_in, fee)
                .await;
            results.push((fee, r));
        }
        let Some(best) = best_tier(results)? else {
            return Ok(None);
        };

        let block = provider
            .get_block_number()
            .await
            .context("get block number")?;
        let gas_price_wei = self.gas.gas_price(block).await?;

        let amount_out_min = min_out_after_slippage(best.amount_out, self.policy.slippage_bps);
        let swap = V3ExactIn {
            recipient: self.recipient,
            amount_in,
            amount_out_min,
            path: encode_v3_path(token_in.address, best.fee, token_out.address),
            payer_is_user: true,
        };
        let mut plan = RouterPlan::new();
        if let Some(p) = permit {
            plan = plan.permit2_permit(p);
        }
        let deadline = unix_now()?.saturating_add(self.policy.deadline_seconds);
        let calldata = plan.v3_swap_exact_in(&swap).calldata(deadline);

        tracing::debug!(
            chain_id = self.chain_id,
            fee_tier = best.fee,
            amount_out = %best.amount_out,
            amount_out_min = %amount_out_min,
            gas_price_wei,
            "route found"
        );

        SwapQuote::new(QuoteParts {
            token_in: token_in.clone(),
            token_out: token_out.clone(),
            amount_in,
            to: self.router,
            calldata,
            value: U256::ZERO,
            estimated_gas: best.gas_estimate,
            expected_out: best.amount_out,
            amount_out_min,
            fee_tier: best.fee,
            gas_price_wei,
            carries_permit: permit.is_some(),
        })
        .map(Some)
    }
}

/// Quote step of a run: delegates to a [`RouteFinder`] and keeps "no route" and
/// "service failed" apart.
pub struct QuoteEngine<'a, R> {
    finder: &'a R,
}

impl<'a, R: RouteFinder> QuoteEngine<'a, R> {
    pub const fn new(finder: &'a R) -> Self {
        Self { finder }
    }

    pub async fn get_quote(
        &self,
        amount_in: U256,
        token_in: &Token,
        token_out: &Token,
        permit: Option<&PermitSignature>,
    ) -> Result<Option<SwapQuote>, SwapError> {
        let quote = self
            .finder
            .route(amount_in, token_in, token_out, permit)
            .await
            .map_err(|e| SwapError::Routing {
                symbol_in: token_in.symbol.clone(),
                symbol_out: token_out.symbol.clone(),
                amount: amount_in,
                reason: format!("{e:#}"),
            })?;
        match &quote {
            Some(q) => tracing::info!(
                token_in = %token_in.symbol,
                token_out = %token_out.symbol,
                amount_in = %amount_in,
                expected_out = %q.expected_out(),
                fee_tier = q.fee_tier(),
                "quote received"
            ),
            None => tracing::info!(
                token_in = %token_in.symbol,
                token_out = %token_out.symbol,
                amount_in = %amount_in,
                "no route found"
            ),
        }
        Ok(quote)
    }
}
