use alloy::primitives::{Address, U256};
use serde::Serialize;
use thiserror::Error;

/// Run phase a failure was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    CheckBalance,
    EnsureApproval,
    SignPermit,
    Quote,
    Execute,
    Done,
}

impl Phase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::CheckBalance => "check_balance",
            Self::EnsureApproval => "ensure_approval",
            Self::SignPermit => "sign_permit",
            Self::Quote => "quote",
            Self::Execute => "execute",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("ledger query failed ({what} for token {token:#x}): {reason}")]
    LedgerQuery {
        what: &'static str,
        token: Address,
        reason: String,
    },

    #[error("approval of token {token:#x} for spender {spender:#x} failed: {reason}")]
    Approval {
        token: Address,
        spender: Address,
        reason: String,
    },

    #[error("permit signing for token {token:#x} failed: {reason}")]
    Signing { token: Address, reason: String },

    #[error("route finding for {symbol_in} -> {symbol_out} (amount {amount}) failed: {reason}")]
    Routing {
        symbol_in: String,
        symbol_out: String,
        amount: U256,
        reason: String,
    },

    #[error("swap execution of {symbol_in} (amount {amount}) failed: {reason}")]
    Execution {
        symbol_in: String,
        amount: U256,
        reason: String,
    },
}

impl SwapError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn ledger(what: &'static str, token: Address, err: &eyre::Report) -> Self {
        Self::LedgerQuery {
            what,
            token,
            reason: format!("{err:#}"),
        }
    }

    pub fn execution(symbol_in: &str, amount: U256, reason: impl Into<String>) -> Self {
        Self::Execution {
            symbol_in: symbol_in.to_owned(),
            amount,
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code, used in the run summary.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::LedgerQuery { .. } => "ledger_query_error",
            Self::Approval { .. } => "approval_error",
            Self::Signing { .. } => "signing_error",
            Self::Routing { .. } => "routing_error",
            Self::Execution { .. } => "execution_error",
        }
    }

    /// Fatal errors stop the whole run; the rest only fail one swap request.
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Execution { .. })
    }
}
