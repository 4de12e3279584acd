use crate::{
    amount,
    errors::SwapError,
    orchestrator::SwapRequest,
    tokens::{Token, TokenRegistry, DEFAULT_TOKENS},
};
use alloy::{
    primitives::{address, Address},
    signers::local::PrivateKeySigner,
};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, str::FromStr as _, time::Duration};

/// Canonical Permit2 deployment (same address on every EVM chain).
pub const CANONICAL_PERMIT2_ADDRESS: Address = address!("0x000000000022D473030F116dDEE9F6B43aC78BA3");

/// Reference endpoint used for gas pricing regardless of the execution network.
pub const DEFAULT_GAS_REFERENCE_RPC_URL: &str = "https://arb1.arbitrum.io/rpc";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Blocks to wait after inclusion before treating a transaction as final.
    pub confirmations: u64,
    /// Gas limit used when the node cannot estimate the swap.
    pub default_gas_limit: u64,
    /// Headroom applied to every gas figure, in basis points (12000 = 120%).
    pub gas_headroom_bps: u64,
    pub receipt_timeout_seconds: u64,
    pub receipt_poll_millis: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            confirmations: 2,
            default_gas_limit: 210_000,
            gas_headroom_bps: 12_000,
            receipt_timeout_seconds: 600,
            receipt_poll_millis: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermitConfig {
    pub expiration_seconds: u64,
    pub sig_deadline_seconds: u64,
}

impl Default for PermitConfig {
    fn default() -> Self {
        Self {
            expiration_seconds: 30 * 24 * 60 * 60,
            sig_deadline_seconds: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Read transport for quotes. Defaults to the execution RPC.
    pub rpc_url: Option<String>,
    pub gas_price_rpc_url: String,
    /// Uniswap QuoterV2. Known chains have a default.
    pub quoter_address: Option<String>,
    pub slippage_bps: u32,
    pub deadline_seconds: u64,
    pub fee_tiers: Vec<u32>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            gas_price_rpc_url: DEFAULT_GAS_REFERENCE_RPC_URL.into(),
            quoter_address: None,
            slippage_bps: 500,
            deadline_seconds: 30 * 60,
            fee_tiers: vec![500, 3_000, 10_000],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub address: Option<String>,
    pub decimals: u8,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRequestConfig {
    pub token_in: String,
    pub token_out: String,
    /// UI decimal amount of `token_in`, e.g. `"0.1"`.
    pub amount: String,
}

/// Raw on-disk configuration. Everything is optional here; [`SwapperConfig::resolve`]
/// turns it into a validated [`ResolvedConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapperConfig {
    pub wallet_address: Option<String>,
    pub chain_id: Option<u64>,
    pub rpc_url: Option<String>,
    pub fallback_rpc_urls: Vec<String>,
    pub universal_router_address: Option<String>,
    pub permit2_address: String,
    pub execution: ExecutionConfig,
    pub permit: PermitConfig,
    pub routing: RoutingConfig,
    pub tokens: BTreeMap<String, TokenConfig>,
    pub swaps: Vec<SwapRequestConfig>,
}

impl Default for SwapperConfig {
    fn default() -> Self {
        Self {
            wallet_address: None,
            chain_id: None,
            rpc_url: None,
            fallback_rpc_urls: Vec::new(),
            universal_router_address: None,
            permit2_address: format!("{CANONICAL_PERMIT2_ADDRESS:#x}"),
            execution: ExecutionConfig::default(),
            permit: PermitConfig::default(),
            routing: RoutingConfig::default(),
            tokens: BTreeMap::new(),
            swaps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub confirmations: u64,
    pub default_gas_limit: u64,
    pub gas_headroom_bps: u64,
    pub receipt_timeout: Duration,
    pub receipt_poll: Duration,
}

#[derive(Debug, Clone)]
pub struct PermitPolicy {
    pub expiration_seconds: u64,
    pub sig_deadline_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    pub rpc_url: String,
    pub gas_price_rpc_url: String,
    pub quoter: Address,
    pub slippage_bps: u32,
    pub deadline_seconds: u64,
    pub fee_tiers: Vec<u32>,
}

/// Immutable, validated configuration handed to every component at startup.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub wallet_address: Address,
    wallet_secret: SecretString,
    pub chain_id: u64,
    pub rpc_url: String,
    pub fallback_rpc_urls: Vec<String>,
    pub universal_router: Address,
    pub permit2: Address,
    pub execution: ExecutionPolicy,
    pub permit: PermitPolicy,
    pub routing: RoutingPolicy,
    pub tokens: TokenRegistry,
    pub swaps: Vec<SwapRequest>,
}

fn required<'a>(v: Option<&'a String>, name: &str) -> Result<&'a str, SwapError> {
    v.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SwapError::config(format!("missing required value: {name}")))
}

fn parse_addr(s: &str, name: &str) -> Result<Address, SwapError> {
    let a = Address::from_str(s.trim())
        .map_err(|e| SwapError::config(format!("invalid address for {name} ({s}): {e}")))?;
    if a == Address::ZERO {
        return Err(SwapError::config(format!("{name} must not be the zero address")));
    }
    Ok(a)
}

fn parse_url(s: &str, name: &str) -> Result<String, SwapError> {
    let t = s.trim();
    reqwest::Url::parse(t)
        .map_err(|e| SwapError::config(format!("invalid url for {name} ({t}): {e}")))?;
    Ok(t.to_owned())
}

/// Uniswap QuoterV2 deployments for chains where it is well known.
pub fn default_quoter_for_chain(chain_id: u64) -> Option<Address> {
    match chain_id {
        1 | 10 | 137 | 42_161 => Some(address!("0x61fFE014bA17989E743c5F6cB21bF9697530B21e")),
        8_453 => Some(address!("0x3d4e44Eb1374240CE5F1B871ab261CD16335B76a")),
        11_155_111 => Some(address!("0xEd1f6473345F45b75F8179591dd5bA1888cf2FB3")),
        _ => None,
    }
}

impl SwapperConfig {
    /// Fill in the built-in token registry and the default swap batch when the
    /// file declares none.
    pub fn with_builtin_defaults(mut self) -> Self {
        if self.tokens.is_empty() {
            for def in DEFAULT_TOKENS {
                self.tokens.insert(
                    def.symbol.to_owned(),
                    TokenConfig {
                        address: None,
                        decimals: def.decimals,
                        name: Some(def.name.to_owned()),
                    },
                );
            }
        }
        if self.swaps.is_empty() {
            self.swaps.push(SwapRequestConfig {
                token_in: "WETH".into(),
                token_out: "DAI".into(),
                amount: "0.1".into(),
            });
        }
        self
    }

    fn resolve_tokens(&self, chain_id: u64) -> Result<TokenRegistry, SwapError> {
        let needed: Vec<String> = self
            .swaps
            .iter()
            .flat_map(|s| [s.token_in.trim().to_uppercase(), s.token_out.trim().to_uppercase()])
            .collect();

        let mut tokens = Vec::with_capacity(self.tokens.len());
        for (symbol, tc) in &self.tokens {
            let symbol = symbol.trim().to_uppercase();
            let Some(raw) = tc.address.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
                // Tokens no swap refers to may stay unconfigured.
                if needed.contains(&symbol) {
                    return Err(SwapError::config(format!(
                        "missing required value: {symbol}_ADDRESS"
                    )));
                }
                continue;
            };
            let address = parse_addr(raw, &format!("{symbol}_ADDRESS"))?;
            tokens.push(Token {
                chain_id,
                address,
                decimals: tc.decimals,
                name: tc.name.clone().unwrap_or_else(|| symbol.clone()),
                symbol,
            });
        }
        Ok(TokenRegistry::new(tokens))
    }

    fn resolve_swaps(&self, tokens: &TokenRegistry) -> Result<Vec<SwapRequest>, SwapError> {
        let lookup = |symbol: &str| {
            tokens
                .get(symbol)
                .cloned()
                .ok_or_else(|| SwapError::config(format!("swap refers to unknown token {symbol}")))
        };
        let mut out = Vec::with_capacity(self.swaps.len());
        for s in &self.swaps {
            let token_in = lookup(&s.token_in)?;
            let token_out = lookup(&s.token_out)?;
            if token_in.address == token_out.address {
                return Err(SwapError::config(format!(
                    "swap {} -> {} has identical input and output",
                    token_in.symbol, token_out.symbol
                )));
            }
            let amount = amount::parse_units(&s.amount, token_in.decimals).map_err(|e| {
                SwapError::config(format!("invalid swap amount {:?}: {e}", s.amount))
            })?;
            if amount.is_zero() {
                return Err(SwapError::config(format!(
                    "swap {} -> {} has a zero amount",
                    token_in.symbol, token_out.symbol
                )));
            }
            out.push(SwapRequest {
                token_in,
                token_out,
                amount,
            });
        }
        Ok(out)
    }

    fn resolve_policies(
        &self,
        chain_id: u64,
        rpc_url: &str,
    ) -> Result<(ExecutionPolicy, PermitPolicy, RoutingPolicy), SwapError> {
        let e = &self.execution;
        if e.confirmations == 0 {
            return Err(SwapError::config("execution.confirmations must be >= 1"));
        }
        if e.gas_headroom_bps < 10_000 {
            return Err(SwapError::config(
                "execution.gas_headroom_bps must be >= 10000 (100%)",
            ));
        }
        if e.default_gas_limit == 0 {
            return Err(SwapError::config("execution.default_gas_limit must be > 0"));
        }
        let execution = ExecutionPolicy {
            confirmations: e.confirmations,
            default_gas_limit: e.default_gas_limit,
            gas_headroom_bps: e.gas_headroom_bps,
            receipt_timeout: Duration::from_secs(e.receipt_timeout_seconds.max(1)),
            receipt_poll: Duration::from_millis(e.receipt_poll_millis.max(50)),
        };

        let p = &self.permit;
        if p.sig_deadline_seconds == 0 || p.sig_deadline_seconds > p.expiration_seconds {
            return Err(SwapError::config(
                "permit.sig_deadline_seconds must be in 1..=permit.expiration_seconds",
            ));
        }
        let permit = PermitPolicy {
            expiration_seconds: p.expiration_seconds,
            sig_deadline_seconds: p.sig_deadline_seconds,
        };

        let r = &self.routing;
        if r.slippage_bps >= 10_000 {
            return Err(SwapError::config("routing.slippage_bps must be < 10000"));
        }
        if r.fee_tiers.is_empty() || r.fee_tiers.iter().any(|f| *f == 0 || *f >= 1_000_000) {
            return Err(SwapError::config(
                "routing.fee_tiers must be non-empty and each in 1..1000000",
            ));
        }
        let quoter = match r.quoter_address.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => parse_addr(s, "routing.quoter_address")?,
            None => default_quoter_for_chain(chain_id).ok_or_else(|| {
                SwapError::config(format!(
                    "missing required value: routing.quoter_address (no default for chain {chain_id})"
                ))
            })?,
        };
        let routing = RoutingPolicy {
            rpc_url: match r.rpc_url.as_deref() {
                Some(u) if !u.trim().is_empty() => parse_url(u, "routing.rpc_url")?,
                _ => rpc_url.to_owned(),
            },
            gas_price_rpc_url: parse_url(&r.gas_price_rpc_url, "routing.gas_price_rpc_url")?,
            quoter,
            slippage_bps: r.slippage_bps,
            deadline_seconds: r.deadline_seconds.max(1),
            fee_tiers: r.fee_tiers.clone(),
        };
        Ok((execution, permit, routing))
    }

    /// Validate everything up front. Any missing or malformed value is a
    /// [`SwapError::Configuration`] and no network call has been made yet.
    pub fn resolve(&self, wallet_secret: Option<SecretString>) -> Result<ResolvedConfig, SwapError> {
        let wallet_address = parse_addr(
            required(self.wallet_address.as_ref(), "WALLET_ADDRESS")?,
            "WALLET_ADDRESS",
        )?;
        let wallet_secret = wallet_secret
            .filter(|s| !s.expose_secret().trim().is_empty())
            .ok_or_else(|| SwapError::config("missing required value: WALLET_SECRET"))?;
        let signer = signer_from_secret(&wallet_secret)?;
        if signer.address() != wallet_address {
            return Err(SwapError::config(format!(
                "WALLET_ADDRESS {wallet_address:#x} does not match WALLET_SECRET address {:#x}",
                signer.address()
            )));
        }

        let chain_id = self
            .chain_id
            .filter(|c| *c > 0)
            .ok_or_else(|| SwapError::config("missing required value: CHAIN_ID"))?;
        let rpc_url = parse_url(required(self.rpc_url.as_ref(), "RPC_URL")?, "RPC_URL")?;
        let fallback_rpc_urls = self
            .fallback_rpc_urls
            .iter()
            .filter(|u| !u.trim().is_empty())
            .map(|u| parse_url(u, "fallback_rpc_urls"))
            .collect::<Result<Vec<_>, _>>()?;
        let universal_router = parse_addr(
            required(
                self.universal_router_address.as_ref(),
                "UNIVERSAL_ROUTER_ADDRESS",
            )?,
            "UNIVERSAL_ROUTER_ADDRESS",
        )?;
        let permit2 = parse_addr(&self.permit2_address, "permit2_address")?;

        let tokens = self.resolve_tokens(chain_id)?;
        let swaps = self.resolve_swaps(&tokens)?;
        if swaps.is_empty() {
            return Err(SwapError::config("no swap requests configured"));
        }
        let (execution, permit, routing) = self.resolve_policies(chain_id, &rpc_url)?;

        Ok(ResolvedConfig {
            wallet_address,
            wallet_secret,
            chain_id,
            rpc_url,
            fallback_rpc_urls,
            universal_router,
            permit2,
            execution,
            permit,
            routing,
            tokens,
            swaps,
        })
    }
}

pub fn signer_from_secret(secret: &SecretString) -> Result<PrivateKeySigner, SwapError> {
    let raw = secret.expose_secret().trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    PrivateKeySigner::from_str(raw)
        .map_err(|e| SwapError::config(format!("invalid WALLET_SECRET: {e}")))
}

impl ResolvedConfig {
    pub fn signer(&self) -> Result<PrivateKeySigner, SwapError> {
        let mut signer = signer_from_secret(&self.wallet_secret)?;
        alloy::signers::Signer::set_chain_id(&mut signer, Some(self.chain_id));
        Ok(signer)
    }

    /// JSON view for the `config` command. The wallet credential is never included.
    pub fn redacted_json(&self) -> serde_json::Value {
        let swaps: Vec<_> = self
            .swaps
            .iter()
            .map(|s| {
                json!({
                    "token_in": s.token_in.symbol,
                    "token_out": s.token_out.symbol,
                    "amount_base": s.amount.to_string(),
                    "amount": amount::format_units(s.amount, s.token_in.decimals),
                })
            })
            .collect();
        json!({
            "wallet_address": format!("{:#x}", self.wallet_address),
            "wallet_secret": "<redacted>",
            "chain_id": self.chain_id,
            "rpc_url": self.rpc_url,
            "fallback_rpc_urls": self.fallback_rpc_urls,
            "universal_router": format!("{:#x}", self.universal_router),
            "permit2": format!("{:#x}", self.permit2),
            "execution": {
                "confirmations": self.execution.confirmations,
                "default_gas_limit": self.execution.default_gas_limit,
                "gas_headroom_bps": self.execution.gas_headroom_bps,
                "receipt_timeout_seconds": self.execution.receipt_timeout.as_secs(),
            },
            "permit": {
                "expiration_seconds": self.permit.expiration_seconds,
                "sig_deadline_seconds": self.permit.sig_deadline_seconds,
            },
            "routing": {
                "rpc_url": self.routing.rpc_url,
                "gas_price_rpc_url": self.routing.gas_price_rpc_url,
                "quoter": format!("{:#x}", self.routing.quoter),
                "slippage_bps": self.routing.slippage_bps,
                "deadline_seconds": self.routing.deadline_seconds,
                "fee_tiers": self.routing.fee_tiers,
            },
            "tokens": self.tokens.iter().collect::<Vec<_>>(),
            "swaps": swaps,
        })
    }
}
