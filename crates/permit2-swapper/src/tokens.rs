use alloy::primitives::Address;
use serde::Serialize;
use std::collections::BTreeMap;

/// A tradable ERC-20 asset. Built once from configuration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub chain_id: u64,
    pub address: Address,
    pub decimals: u8,
    pub symbol: String,
    pub name: String,
}

/// Built-in registry entry used when the config file declares no `[tokens]`.
pub struct TokenDef {
    pub symbol: &'static str,
    pub name: &'static str,
    pub decimals: u8,
}

pub const DEFAULT_TOKENS: &[TokenDef] = &[
    TokenDef {
        symbol: "WETH",
        name: "Wrapped Ether",
        decimals: 18,
    },
    TokenDef {
        symbol: "DAI",
        name: "Dai Stablecoin",
        decimals: 18,
    },
    TokenDef {
        symbol: "USDC",
        name: "USD Coin",
        decimals: 6,
    },
    TokenDef {
        symbol: "NEAR",
        name: "NEAR Protocol",
        decimals: 18,
    },
];

/// Symbol-keyed lookup over the configured tokens.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    by_symbol: BTreeMap<String, Token>,
}

impl TokenRegistry {
    pub fn new(tokens: impl IntoIterator<Item = Token>) -> Self {
        let by_symbol = tokens
            .into_iter()
            .map(|t| (t.symbol.to_uppercase(), t))
            .collect();
        Self { by_symbol }
    }

    pub fn get(&self, symbol: &str) -> Option<&Token> {
        self.by_symbol.get(&symbol.trim().to_uppercase())
    }

    pub fn by_address(&self, address: Address) -> Option<&Token> {
        self.by_symbol.values().find(|t| t.address == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.by_symbol.values()
    }
}
