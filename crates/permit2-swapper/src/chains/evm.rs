use crate::{
    config::ResolvedConfig,
    retry::{first_success, RetryPolicy},
};
use alloy::{
    consensus::{SignableTransaction as _, TxEip1559, TxEnvelope, TxLegacy},
    network::TransactionBuilder as _,
    primitives::{Address, Bytes, TxKind, B256, U256},
    providers::{Provider as _, RootProvider},
    rpc::types::{BlockNumberOrTag, TransactionReceipt, TransactionRequest},
    signers::{local::PrivateKeySigner, SignerSync as _},
    sol,
    sol_types::SolCall as _,
};
use eyre::{Context as _, ContextCompat as _};
use reqwest::Client;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const RPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub type EvmProvider = RootProvider;

sol! {
    #[sol(rpc)]
    contract IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 value) returns (bool);
    }
}

sol! {
    #[sol(rpc)]
    contract IPermit2 {
        function allowance(address user, address token, address spender)
            external view returns (uint160 amount, uint48 expiration, uint48 nonce);
    }
}

/// Permit2's internal allowance record for (owner, token, spender).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Permit2Allowance {
    pub amount: U256,
    pub expiration: u64,
    pub nonce: u64,
}

/// Final state of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxOutcome {
    pub hash: B256,
    pub block_number: u64,
    pub confirmations: u64,
    pub success: bool,
    pub gas_used: u64,
}

/// Read/write access to the chain. Reads never cache; every call hits current state.
pub trait Ledger {
    /// Account that signs and pays for every submitted transaction.
    fn wallet_address(&self) -> Address;

    async fn erc20_balance(&self, token: Address, owner: Address) -> eyre::Result<U256>;

    async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> eyre::Result<U256>;

    async fn permit2_allowance(
        &self,
        permit2: Address,
        owner: Address,
        token: Address,
        spender: Address,
    ) -> eyre::Result<Permit2Allowance>;

    async fn contract_code(&self, addr: Address) -> eyre::Result<Bytes>;

    async fn estimate_gas(&self, tx: &TransactionRequest) -> eyre::Result<u64>;

    /// Sign and broadcast. Returns the transaction hash as soon as a node accepted it.
    async fn send_transaction(&self, tx: TransactionRequest) -> eyre::Result<B256>;

    /// Block until `hash` is mined and `confirmations` blocks deep (inclusion block counts
    /// as the first), or until `timeout` elapses.
    async fn wait_for_confirmations(
        &self,
        hash: B256,
        confirmations: u64,
        timeout: Duration,
        poll: Duration,
    ) -> eyre::Result<TxOutcome>;
}

/// Floor for the EIP-1559 tip, in wei.
const MIN_PRIORITY_FEE: u128 = 1_500_000_000;

/// Node errors that mean the signed transaction is already in the pool.
const DUPLICATE_BROADCAST_MARKERS: [&str; 4] = [
    "already known",
    "known transaction",
    "already imported",
    "already in mempool",
];

/// Fee fields for one swap or approval transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fees {
    Eip1559 { max_fee: u128, priority: u128 },
    Legacy { gas_price: u128 },
}

impl Fees {
    /// Tip is a tenth of the node's gas price, never below the floor; the cap leaves room
    /// for the base fee to double before inclusion. Chains without a base fee get legacy
    /// pricing.
    pub fn for_chain(base_fee: Option<u128>, gas_price: u128) -> Self {
        let Some(base_fee) = base_fee else {
            return Self::Legacy { gas_price };
        };
        let priority = (gas_price / 10).max(MIN_PRIORITY_FEE);
        Self::Eip1559 {
            max_fee: base_fee.saturating_mul(2).saturating_add(priority),
            priority,
        }
    }

    fn apply(self, tx: &mut TransactionRequest) {
        match self {
            Self::Eip1559 { max_fee, priority } => {
                tx.max_fee_per_gas = Some(max_fee);
                tx.max_priority_fee_per_gas = Some(priority);
            }
            Self::Legacy { gas_price } => tx.gas_price = Some(gas_price),
        }
    }
}

fn is_duplicate_broadcast(err: &eyre::Report) -> bool {
    let s = format!("{err:#}").to_lowercase();
    DUPLICATE_BROADCAST_MARKERS.iter().any(|m| s.contains(m))
}

/// Build and sign a consensus transaction from a fully-populated `TransactionRequest`.
fn build_and_sign_tx(
    signer: &PrivateKeySigner,
    tx: &TransactionRequest,
) -> eyre::Result<(TxEnvelope, B256)> {
    let to = tx.to.unwrap_or(TxKind::Create);
    let value = tx.value.unwrap_or(U256::ZERO);
    let input = tx.input.clone().into_input().unwrap_or_default();
    let nonce = tx.nonce.context("nonce not assigned")?;
    let gas_limit = tx.gas.context("gas limit not assigned")?;
    let chain_id = tx.chain_id.context("chain id not assigned")?;

    if tx.max_fee_per_gas.is_some() {
        let consensus_tx = TxEip1559 {
            chain_id,
            nonce,
            gas_limit,
            max_fee_per_gas: tx.max_fee_per_gas.unwrap_or(0),
            max_priority_fee_per_gas: tx.max_priority_fee_per_gas.unwrap_or(0),
            to,
            value,
            input,
            access_list: tx.access_list.clone().unwrap_or_default(),
        };
        let hash = consensus_tx.signature_hash();
        let sig = signer.sign_hash_sync(&hash).context("sign eip1559")?;
        let signed_tx = consensus_tx.into_signed(sig);
        let tx_hash = *signed_tx.hash();
        Ok((TxEnvelope::Eip1559(signed_tx), tx_hash))
    } else {
        let consensus_tx = TxLegacy {
            chain_id: Some(chain_id),
            nonce,
            gas_price: tx.gas_price.unwrap_or(0),
            gas_limit,
            to,
            value,
            input,
        };
        let hash = consensus_tx.signature_hash();
        let sig = signer.sign_hash_sync(&hash).context("sign legacy")?;
        let signed_tx = consensus_tx.into_signed(sig);
        let tx_hash = *signed_tx.hash();
        Ok((TxEnvelope::Legacy(signed_tx), tx_hash))
    }
}

/// HTTP provider for one endpoint. Requests that hang past the timeout fail so the
/// next endpoint gets a turn.
pub fn provider_for_url(url: &str) -> eyre::Result<EvmProvider> {
    let endpoint = reqwest::Url::parse(url).with_context(|| format!("invalid rpc url: {url}"))?;
    let http = Client::builder()
        .timeout(RPC_REQUEST_TIMEOUT)
        .connect_timeout(RPC_CONNECT_TIMEOUT)
        .build()
        .context("build rpc http client")?;
    Ok(RootProvider::new(alloy::rpc::client::RpcClient::new(
        alloy::transports::http::Http::with_client(http, endpoint),
        false,
    )))
}

pub fn build_erc20_approve(
    from: Address,
    token: Address,
    spender: Address,
    value: U256,
) -> TransactionRequest {
    let calldata = IERC20::approveCall { spender, value }.abi_encode();
    TransactionRequest::default()
        .with_from(from)
        .with_to(token)
        .with_input(Bytes::from(calldata))
}

/// Number of blocks a transaction mined in `mined_at` has, given chain head `head`.
pub const fn confirmation_depth(mined_at: u64, head: u64) -> u64 {
    if head < mined_at {
        0
    } else {
        head - mined_at + 1
    }
}

fn outcome_from_receipt(r: &TransactionReceipt, confirmations: u64) -> TxOutcome {
    TxOutcome {
        hash: r.transaction_hash,
        block_number: r.block_number.unwrap_or_default(),
        confirmations,
        success: r.status(),
        gas_used: r.gas_used,
    }
}

/// `Ledger` over JSON-RPC. Reads go to the primary endpoint first and fall back to the
/// others; the signed raw transaction is broadcast the same way.
#[derive(Debug, Clone)]
pub struct EvmLedger {
    chain_id: u64,
    rpc_urls: Vec<String>,
    signer: PrivateKeySigner,
    retry: RetryPolicy,
}

impl EvmLedger {
    pub fn new(cfg: &ResolvedConfig, signer: PrivateKeySigner) -> Self {
        let mut rpc_urls = Vec::with_capacity(1 + cfg.fallback_rpc_urls.len());
        rpc_urls.push(cfg.rpc_url.trim().to_owned());
        for u in &cfg.fallback_rpc_urls {
            let t = u.trim();
            if t.is_empty() || rpc_urls.iter().any(|x| x == t) {
                continue;
            }
            rpc_urls.push(t.to_owned());
        }
        Self {
            chain_id: cfg.chain_id,
            rpc_urls,
            signer,
            retry: RetryPolicy::default(),
        }
    }

    fn primary(&self) -> eyre::Result<EvmProvider> {
        let url = self.rpc_urls.first().context("no rpc url configured")?;
        provider_for_url(url)
    }

    async fn with_fallback<T, Fut>(
        &self,
        label: &'static str,
        f: impl Fn(EvmProvider) -> Fut,
    ) -> eyre::Result<T>
    where
        Fut: std::future::Future<Output = eyre::Result<T>>,
    {
        first_success(
            &self.rpc_urls,
            &self.retry,
            |u| {
                let p = provider_for_url(u);
                let f = &f;
                async move { f(p?).await }
            },
            label,
        )
        .await
    }

    async fn pick_healthy_provider(&self) -> eyre::Result<EvmProvider> {
        first_success(
            &self.rpc_urls,
            &self.retry,
            |u| {
                let u = u.clone();
                async move {
                    let p = provider_for_url(&u)?;
                    p.get_block_number().await.context("get block number")?;
                    Ok(p)
                }
            },
            "select rpc",
        )
        .await
    }

    pub async fn block_number(&self) -> eyre::Result<u64> {
        self.with_fallback("block number", |p| async move {
            p.get_block_number().await.context("get block number")
        })
        .await
    }

    async fn receipt(&self, hash: B256) -> eyre::Result<Option<TransactionReceipt>> {
        self.with_fallback("get tx receipt", |p| async move {
            p.get_transaction_receipt(hash)
                .await
                .context("get transaction receipt")
        })
        .await
    }
}

impl Ledger for EvmLedger {
    fn wallet_address(&self) -> Address {
        self.signer.address()
    }

    async fn erc20_balance(&self, token: Address, owner: Address) -> eyre::Result<U256> {
        self.with_fallback("erc20 balance", |p| async move {
            let c = IERC20::new(token, &p);
            c.balanceOf(owner).call().await.context("erc20 balanceOf")
        })
        .await
    }

    async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> eyre::Result<U256> {
        self.with_fallback("erc20 allowance", |p| async move {
            let c = IERC20::new(token, &p);
            c.allowance(owner, spender)
                .call()
                .await
                .context("erc20 allowance")
        })
        .await
    }

    async fn permit2_allowance(
        &self,
        permit2: Address,
        owner: Address,
        token: Address,
        spender: Address,
    ) -> eyre::Result<Permit2Allowance> {
        self.with_fallback("permit2 allowance", |p| async move {
            let c = IPermit2::new(permit2, &p);
            let r = c
                .allowance(owner, token, spender)
                .call()
                .await
                .context("permit2 allowance")?;
            Ok(Permit2Allowance {
                amount: U256::from(r.amount),
                expiration: r.expiration.to::<u64>(),
                nonce: r.nonce.to::<u64>(),
            })
        })
        .await
    }

    async fn contract_code(&self, addr: Address) -> eyre::Result<Bytes> {
        self.with_fallback("get code", |p| async move {
            p.get_code_at(addr).await.context("get code")
        })
        .await
    }

    // Primary only: a fallback node on another network must not mask a revert.
    async fn estimate_gas(&self, tx: &TransactionRequest) -> eyre::Result<u64> {
        let p = self.primary()?;
        p.estimate_gas(tx.clone()).await.context("estimate gas")
    }

    async fn send_transaction(&self, mut tx: TransactionRequest) -> eyre::Result<B256> {
        let provider = self.pick_healthy_provider().await?;
        let from = self.signer.address();

        tx.chain_id = Some(self.chain_id);
        if tx.from.is_none() {
            tx.from = Some(from);
        }

        if tx.gas_price.is_none() && tx.max_fee_per_gas.is_none() {
            let base_fee = provider
                .get_block_by_number(BlockNumberOrTag::Pending)
                .await
                .ok()
                .flatten()
                .and_then(|b| b.header.base_fee_per_gas.map(u128::from));

            let gas_price = provider.get_gas_price().await.context("get gas price")?;
            Fees::for_chain(base_fee, gas_price).apply(&mut tx);
        }

        if tx.nonce.is_none() {
            let n = provider
                .get_transaction_count(from)
                .pending()
                .await
                .context("get nonce")?;
            tx.nonce = Some(n);
        }

        if tx.gas.is_none() {
            let gas = provider
                .estimate_gas(tx.clone())
                .await
                .context("estimate gas")?;
            tx.gas = Some(gas.saturating_mul(120) / 100);
        }

        let (envelope, tx_hash) = build_and_sign_tx(&self.signer, &tx).context("sign tx")?;
        let raw_bytes = alloy::eips::eip2718::Encodable2718::encoded_2718(&envelope);

        // One pass over the endpoints: a signed transaction is broadcast, never re-sent.
        first_success(
            &self.rpc_urls,
            &RetryPolicy::single_pass(),
            |u| {
                let u = u.clone();
                let raw_bytes = raw_bytes.clone();
                async move {
                    let p = provider_for_url(&u)?;
                    match p.send_raw_transaction(&raw_bytes).await {
                        Ok(_pending) => Ok(()),
                        Err(e) => {
                            let ae: eyre::Report = e.into();
                            if is_duplicate_broadcast(&ae) {
                                Ok(())
                            } else {
                                Err(ae).context("broadcast raw tx")
                            }
                        }
                    }
                }
            },
            "send transaction",
        )
        .await?;

        tracing::debug!(tx_hash = %tx_hash, nonce = ?tx.nonce, gas = ?tx.gas, "broadcast transaction");
        Ok(tx_hash)
    }

    async fn wait_for_confirmations(
        &self,
        hash: B256,
        confirmations: u64,
        timeout: Duration,
        poll: Duration,
    ) -> eyre::Result<TxOutcome> {
        let start = Instant::now();
        let receipt = loop {
            if start.elapsed() > timeout {
                eyre::bail!("timed out waiting for receipt of {hash:#x}");
            }
            if let Some(r) = self.receipt(hash).await? {
                break r;
            }
            sleep(poll).await;
        };

        let mined_at = receipt
            .block_number
            .context("receipt has no block number")?;
        if !receipt.status() {
            return Ok(outcome_from_receipt(&receipt, 1));
        }

        loop {
            let head = self.block_number().await?;
            let depth = confirmation_depth(mined_at, head);
            if depth >= confirmations {
                return Ok(outcome_from_receipt(&receipt, depth));
            }
            if start.elapsed() > timeout {
                eyre::bail!(
                    "timed out waiting for {confirmations} confirmations of {hash:#x} (have {depth})"
                );
            }
            sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_fee_chains_get_a_doubled_cap_and_a_tenth_tip() {
        let fees = Fees::for_chain(Some(10_000_000_000), 20_000_000_000);
        assert_eq!(
            fees,
            Fees::Eip1559 {
                max_fee: 22_000_000_000,
                priority: 2_000_000_000
            }
        );
    }

    #[test]
    fn tip_never_drops_below_the_floor() {
        let fees = Fees::for_chain(Some(1_000_000_000), 5_000_000_000);
        assert!(
            matches!(fees, Fees::Eip1559 { priority, .. } if priority == MIN_PRIORITY_FEE),
            "got {fees:?}"
        );
    }

    #[test]
    fn chains_without_base_fee_price_legacy() {
        let mut tx = TransactionRequest::default().with_to(Address::ZERO);
        Fees::for_chain(None, 7).apply(&mut tx);
        assert_eq!(tx.gas_price, Some(7_u128));
        assert!(tx.max_fee_per_gas.is_none(), "no eip1559 fields on a legacy chain");
    }

    #[test]
    fn signing_refuses_an_unpopulated_request() -> eyre::Result<()> {
        let signer = PrivateKeySigner::random();
        let mut tx = TransactionRequest::default()
            .with_to(Address::repeat_byte(0x11))
            .with_gas_limit(21_000)
            .with_chain_id(42_161)
            .with_gas_price(1);
        let err = build_and_sign_tx(&signer, &tx).err();
        assert!(
            err.as_ref().is_some_and(|e| e.to_string().contains("nonce not assigned")),
            "got {err:?}"
        );

        tx.nonce = Some(0);
        let (envelope, hash) = build_and_sign_tx(&signer, &tx)?;
        assert!(matches!(envelope, TxEnvelope::Legacy(_)));
        assert_ne!(hash, B256::ZERO);
        Ok(())
    }

    #[test]
    fn duplicate_broadcasts_are_recognised() {
        assert!(is_duplicate_broadcast(&eyre::eyre!("server returned: ALREADY KNOWN")));
        assert!(!is_duplicate_broadcast(&eyre::eyre!("nonce too low")));
    }

    #[test]
    fn confirmation_depth_counts_inclusion_block() {
        assert_eq!(confirmation_depth(100, 99), 0);
        assert_eq!(confirmation_depth(100, 100), 1);
        assert_eq!(confirmation_depth(100, 101), 2);
    }

    #[test]
    fn approve_targets_token_with_spender_calldata() -> eyre::Result<()> {
        let token = Address::repeat_byte(0x11);
        let spender = Address::repeat_byte(0x22);
        let tx = build_erc20_approve(Address::repeat_byte(0x33), token, spender, U256::MAX);
        assert_eq!(tx.to, Some(TxKind::Call(token)));
        let input = tx.input.into_input().unwrap_or_default();
        let call = IERC20::approveCall::abi_decode(&input)?;
        assert_eq!(call.spender, spender);
        assert_eq!(call.value, U256::MAX);
        Ok(())
    }

    #[test]
    fn signs_only_fully_populated_requests() -> eyre::Result<()> {
        let signer = PrivateKeySigner::random();
        let tx = TransactionRequest::default()
            .with_to(Address::repeat_byte(0x44))
            .with_gas_limit(50_000)
            .with_nonce(3)
            .with_chain_id(42_161)
            .with_max_fee_per_gas(2)
            .with_max_priority_fee_per_gas(1);
        let (envelope, hash) = build_and_sign_tx(&signer, &tx)?;
        assert!(matches!(envelope, TxEnvelope::Eip1559(_)));
        assert_ne!(hash, B256::ZERO);

        let missing_nonce = TransactionRequest::default().with_gas_limit(21_000);
        assert!(build_and_sign_tx(&signer, &missing_nonce).is_err(), "signed without nonce");
        Ok(())
    }
}
