//! In-memory doubles for the ledger, the route finder and the signer.

use crate::{
    amount,
    chains::evm::{Ledger, Permit2Allowance, TxOutcome, IERC20},
    config::{
        tests::{complete_config, dev_secret, DEV_KEY},
        ExecutionPolicy, PermitPolicy, ResolvedConfig, SwapRequestConfig,
    },
    errors::Phase,
    events::{EventSink, RunEvent},
    permit::{PermitSignature, PermitSingle, TypedDataSigner},
    quote::{QuoteParts, RouteFinder, SwapQuote},
    tokens::Token,
    universal_router::{encode_v3_path, DecodedExecute, RouterPlan, V3ExactIn, PERMIT2_PERMIT},
};
use alloy::{
    primitives::{address, Address, Bytes, Signature, TxKind, B256, U256},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
    sol_types::{SolCall as _, SolValue as _},
};
use std::{
    collections::{HashMap, HashSet},
    str::FromStr as _,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

pub const ROUTER: Address = address!("0xA51afAFe0263b40EdaEf0Df8781eA9aa03E381a3");
pub const PERMIT2: Address = crate::config::CANONICAL_PERMIT2_ADDRESS;
pub const WALLET: Address = address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

const CHAIN_ID: u64 = 42_161;

fn token(symbol: &str, name: &str, byte: u8, decimals: u8) -> Token {
    Token {
        chain_id: CHAIN_ID,
        address: Address::repeat_byte(byte),
        decimals,
        symbol: symbol.to_owned(),
        name: name.to_owned(),
    }
}

pub fn weth() -> Token {
    token("WETH", "Wrapped Ether", 0x11, 18)
}

pub fn dai() -> Token {
    token("DAI", "Dai Stablecoin", 0x22, 18)
}

pub const fn execution_policy() -> ExecutionPolicy {
    ExecutionPolicy {
        confirmations: 2,
        default_gas_limit: 210_000,
        gas_headroom_bps: 12_000,
        receipt_timeout: Duration::from_secs(1),
        receipt_poll: Duration::from_millis(1),
    }
}

pub const fn permit_policy() -> PermitPolicy {
    PermitPolicy {
        expiration_seconds: 30 * 24 * 60 * 60,
        sig_deadline_seconds: 30 * 60,
    }
}

pub fn dev_signer() -> eyre::Result<PrivateKeySigner> {
    Ok(PrivateKeySigner::from_str(DEV_KEY)?)
}

/// Resolved config for the dev wallet on chain 42161 with WETH, DAI and USDC at fixed
/// addresses, running `swaps` as `(in, out, amount)`.
pub fn resolved_config(swaps: &[(&str, &str, &str)]) -> eyre::Result<ResolvedConfig> {
    let mut cfg = complete_config();
    if let Some(t) = cfg.tokens.get_mut("USDC") {
        t.address = Some(format!("{:#x}", Address::repeat_byte(0x33)));
    }
    cfg.swaps = swaps
        .iter()
        .map(|(i, o, a)| SwapRequestConfig {
            token_in: (*i).to_owned(),
            token_out: (*o).to_owned(),
            amount: (*a).to_owned(),
        })
        .collect();
    let mut resolved = cfg.resolve(Some(dev_secret()))?;
    resolved.execution = execution_policy();
    Ok(resolved)
}

fn router_quote(
    token_in: &Token,
    token_out: &Token,
    amount_in: U256,
    calldata: Option<Bytes>,
    permit: Option<&PermitSignature>,
) -> eyre::Result<SwapQuote> {
    let expected_out = amount_in.saturating_mul(U256::from(2_u64));
    let amount_out_min = expected_out / U256::from(2_u64);
    let calldata = calldata.unwrap_or_else(|| {
        let mut plan = RouterPlan::new();
        if let Some(p) = permit {
            plan = plan.permit2_permit(p);
        }
        plan.v3_swap_exact_in(&V3ExactIn {
            recipient: WALLET,
            amount_in,
            amount_out_min,
            path: encode_v3_path(token_in.address, 3_000, token_out.address),
            payer_is_user: true,
        })
        .calldata(1_900_000_000)
    });
    SwapQuote::new(QuoteParts {
        token_in: token_in.clone(),
        token_out: token_out.clone(),
        amount_in,
        to: ROUTER,
        calldata,
        value: U256::ZERO,
        estimated_gas: 150_000,
        expected_out,
        amount_out_min,
        fee_tier: 3_000,
        gas_price_wei: 10_000_000,
        carries_permit: permit.is_some(),
    })
}

/// Valid router quote selling `amount_in` of `token_in` for DAI (or WETH when selling DAI).
pub fn quote_for(token_in: &Token, amount_in: U256) -> eyre::Result<SwapQuote> {
    let out = if token_in.symbol == "DAI" { weth() } else { dai() };
    router_quote(token_in, &out, amount_in, None, None)
}

pub fn quote_with_calldata(token_in: &Token, amount_in: U256, calldata: Bytes) -> eyre::Result<SwapQuote> {
    let out = if token_in.symbol == "DAI" { weth() } else { dai() };
    router_quote(token_in, &out, amount_in, Some(calldata), None)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct LedgerState {
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
    permit2_nonces: HashMap<Address, u64>,
    code: HashSet<Address>,
    gas_estimate: Option<u64>,
    estimate_calls: usize,
    sent: Vec<TransactionRequest>,
    outcomes: HashMap<B256, bool>,
    revert_to: HashSet<Address>,
    revert_at: HashSet<usize>,
    fail_reads: Option<String>,
    fail_sends: Option<String>,
    time_out: bool,
    head: u64,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            balances: HashMap::new(),
            allowances: HashMap::new(),
            permit2_nonces: HashMap::new(),
            code: HashSet::new(),
            gas_estimate: Some(150_000),
            estimate_calls: 0,
            sent: Vec::new(),
            outcomes: HashMap::new(),
            revert_to: HashSet::new(),
            revert_at: HashSet::new(),
            fail_reads: None,
            fail_sends: None,
            time_out: false,
            head: 1_000,
        }
    }
}

/// Chain double for the dev wallet. Successful approvals raise the recorded allowance and
/// successful permit-carrying router calls bump the Permit2 nonce.
#[derive(Debug, Default)]
pub struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn owner(&self) -> Address {
        WALLET
    }

    pub fn set_balance(&self, token: Address, amount: U256) {
        lock(&self.state).balances.insert(token, amount);
    }

    pub fn set_allowance(&self, token: Address, spender: Address, amount: U256) {
        lock(&self.state).allowances.insert((token, spender), amount);
    }

    pub fn allowance_of(&self, token: Address, spender: Address) -> U256 {
        lock(&self.state)
            .allowances
            .get(&(token, spender))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_code(&self, addr: Address) {
        lock(&self.state).code.insert(addr);
    }

    /// `None` makes every estimate fail.
    pub fn set_gas_estimate(&self, gas: Option<u64>) {
        lock(&self.state).gas_estimate = gas;
    }

    pub fn estimate_calls(&self) -> usize {
        lock(&self.state).estimate_calls
    }

    pub fn fail_reads(&self, msg: &str) {
        lock(&self.state).fail_reads = Some(msg.to_owned());
    }

    pub fn fail_sends(&self, msg: &str) {
        lock(&self.state).fail_sends = Some(msg.to_owned());
    }

    pub fn revert_sends_to(&self, addr: Address) {
        lock(&self.state).revert_to.insert(addr);
    }

    /// Revert the `index`-th transaction sent (zero-based, counting every send).
    pub fn revert_send_at(&self, index: usize) {
        lock(&self.state).revert_at.insert(index);
    }

    pub fn time_out_confirmations(&self) {
        lock(&self.state).time_out = true;
    }

    pub fn sent(&self) -> Vec<TransactionRequest> {
        lock(&self.state).sent.clone()
    }

    fn check_reads(&self) -> eyre::Result<()> {
        match &lock(&self.state).fail_reads {
            Some(msg) => Err(eyre::eyre!("{msg}")),
            None => Ok(()),
        }
    }
}

fn apply_effects(state: &mut LedgerState, to: Address, input: &[u8]) {
    if let Ok(call) = IERC20::approveCall::abi_decode(input) {
        state.allowances.insert((to, call.spender), call.value);
        return;
    }
    let Ok(decoded) = DecodedExecute::decode(input) else {
        return;
    };
    for (cmd, data) in decoded.commands.iter().zip(&decoded.inputs) {
        if *cmd != PERMIT2_PERMIT {
            continue;
        }
        if let Ok((permit, _sig)) = <(PermitSingle, Bytes)>::abi_decode_params(data) {
            *state.permit2_nonces.entry(permit.details.token).or_default() += 1;
        }
    }
}

impl Ledger for MockLedger {
    fn wallet_address(&self) -> Address {
        WALLET
    }

    async fn erc20_balance(&self, token: Address, owner: Address) -> eyre::Result<U256> {
        self.check_reads()?;
        if owner != WALLET {
            return Ok(U256::ZERO);
        }
        Ok(lock(&self.state).balances.get(&token).copied().unwrap_or_default())
    }

    async fn erc20_allowance(&self, token: Address, owner: Address, spender: Address) -> eyre::Result<U256> {
        self.check_reads()?;
        if owner != WALLET {
            return Ok(U256::ZERO);
        }
        Ok(self.allowance_of(token, spender))
    }

    async fn permit2_allowance(
        &self,
        _permit2: Address,
        _owner: Address,
        token: Address,
        _spender: Address,
    ) -> eyre::Result<Permit2Allowance> {
        self.check_reads()?;
        let nonce = lock(&self.state).permit2_nonces.get(&token).copied().unwrap_or_default();
        Ok(Permit2Allowance {
            nonce,
            ..Permit2Allowance::default()
        })
    }

    async fn contract_code(&self, addr: Address) -> eyre::Result<Bytes> {
        self.check_reads()?;
        let deployed = lock(&self.state).code.contains(&addr);
        Ok(if deployed {
            Bytes::from_static(&[0x60, 0x80])
        } else {
            Bytes::new()
        })
    }

    async fn estimate_gas(&self, _tx: &TransactionRequest) -> eyre::Result<u64> {
        let mut state = lock(&self.state);
        state.estimate_calls += 1;
        state
            .gas_estimate
            .ok_or_else(|| eyre::eyre!("execution reverted: cannot estimate"))
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> eyre::Result<B256> {
        let mut state = lock(&self.state);
        if let Some(msg) = &state.fail_sends {
            return Err(eyre::eyre!("{msg}"));
        }
        let index = state.sent.len();
        let to = match tx.to {
            Some(TxKind::Call(a)) => a,
            _ => eyre::bail!("mock ledger only handles calls"),
        };
        let input = tx.input.input().cloned().unwrap_or_default();
        let success = !state.revert_to.contains(&to) && !state.revert_at.contains(&index);
        if success {
            apply_effects(&mut state, to, &input);
        }
        let hash = B256::left_padding_from(&u64::try_from(index + 1).unwrap_or(u64::MAX).to_be_bytes());
        state.outcomes.insert(hash, success);
        state.sent.push(tx);
        Ok(hash)
    }

    async fn wait_for_confirmations(
        &self,
        hash: B256,
        confirmations: u64,
        _timeout: Duration,
        _poll: Duration,
    ) -> eyre::Result<TxOutcome> {
        let mut state = lock(&self.state);
        if state.time_out {
            eyre::bail!("timed out waiting for {hash:#x}");
        }
        let Some(success) = state.outcomes.get(&hash).copied() else {
            eyre::bail!("unknown transaction {hash:#x}");
        };
        state.head += confirmations;
        Ok(TxOutcome {
            hash,
            block_number: state.head,
            confirmations: if success { confirmations } else { 1 },
            success,
            gas_used: 100_000,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCall {
    pub token_in: String,
    pub token_out: String,
    pub amount_in: U256,
    pub had_permit: bool,
}

#[derive(Debug, Default)]
struct FinderState {
    no_route: HashSet<String>,
    failing: HashMap<String, String>,
    calls: Vec<RouteCall>,
}

/// Route finder that answers every pair with a single-pool router quote, unless told
/// otherwise per output token symbol.
#[derive(Debug, Default)]
pub struct MockRouteFinder {
    state: Mutex<FinderState>,
}

impl MockRouteFinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_route_for(&self, token_out: &str) {
        lock(&self.state).no_route.insert(token_out.to_owned());
    }

    pub fn fail_for(&self, token_out: &str, msg: &str) {
        lock(&self.state)
            .failing
            .insert(token_out.to_owned(), msg.to_owned());
    }

    pub fn calls(&self) -> Vec<RouteCall> {
        lock(&self.state).calls.clone()
    }
}

impl RouteFinder for MockRouteFinder {
    async fn route(
        &self,
        amount_in: U256,
        token_in: &Token,
        token_out: &Token,
        permit: Option<&PermitSignature>,
    ) -> eyre::Result<Option<SwapQuote>> {
        {
            let mut state = lock(&self.state);
            state.calls.push(RouteCall {
                token_in: token_in.symbol.clone(),
                token_out: token_out.symbol.clone(),
                amount_in,
                had_permit: permit.is_some(),
            });
            if let Some(msg) = state.failing.get(&token_out.symbol) {
                return Err(eyre::eyre!("{msg}"));
            }
            if state.no_route.contains(&token_out.symbol) {
                return Ok(None);
            }
        }
        router_quote(token_in, token_out, amount_in, None, permit).map(Some)
    }
}

/// Signer whose key store always refuses.
#[derive(Debug, Clone, Copy)]
pub struct FailingSigner;

impl TypedDataSigner for FailingSigner {
    fn address(&self) -> Address {
        WALLET
    }

    async fn sign_digest(&self, _digest: B256) -> eyre::Result<Signature> {
        eyre::bail!("signer rejected the request")
    }
}

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<RunEvent> {
        lock(&self.events).clone()
    }

    /// Entered phases in order, consecutive repeats collapsed.
    pub fn entered_phases(&self) -> Vec<Phase> {
        let mut out: Vec<Phase> = Vec::new();
        for e in lock(&self.events).iter() {
            if let RunEvent::PhaseEntered { phase, .. } = e {
                if out.last() != Some(phase) {
                    out.push(*phase);
                }
            }
        }
        out
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &RunEvent) {
        lock(&self.events).push(event.clone());
    }
}

#[test]
fn fixtures_agree_with_resolved_config() -> eyre::Result<()> {
    let cfg = resolved_config(&[("WETH", "DAI", "1")])?;
    assert_eq!(cfg.universal_router, ROUTER);
    assert_eq!(cfg.wallet_address, WALLET);
    assert_eq!(cfg.tokens.get("WETH"), Some(&weth()));
    assert_eq!(cfg.tokens.get("DAI"), Some(&dai()));
    assert_eq!(
        cfg.swaps.first().map(|s| s.amount),
        Some(amount::parse_units("1", 18)?)
    );
    Ok(())
}
