use crate::{
    amount,
    chains::evm::{Ledger, Permit2Allowance},
    errors::SwapError,
    tokens::Token,
};
use alloy::primitives::{Address, U256};
use serde::Serialize;

/// Who may move how much of `token` on behalf of `owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowanceQuery {
    pub token: Address,
    pub owner: Address,
    pub spender: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowanceClass {
    Zero,
    Limited,
    Max,
}

impl AllowanceClass {
    pub fn of(allowance: U256) -> Self {
        if allowance.is_zero() {
            Self::Zero
        } else if allowance == U256::MAX {
            Self::Max
        } else {
            Self::Limited
        }
    }
}

/// Uncached balance and allowance reads. Transport failures become
/// [`SwapError::LedgerQuery`]; retrying is left to the transport.
#[derive(Debug)]
pub struct Inspector<'a, L> {
    ledger: &'a L,
}

impl<'a, L: Ledger> Inspector<'a, L> {
    pub const fn new(ledger: &'a L) -> Self {
        Self { ledger }
    }

    pub async fn balance(&self, token: &Token, owner: Address) -> Result<U256, SwapError> {
        self.ledger
            .erc20_balance(token.address, owner)
            .await
            .map_err(|e| SwapError::ledger("balance", token.address, &e))
    }

    pub async fn allowance(&self, q: AllowanceQuery) -> Result<U256, SwapError> {
        self.ledger
            .erc20_allowance(q.token, q.owner, q.spender)
            .await
            .map_err(|e| SwapError::ledger("allowance", q.token, &e))
    }

    /// Permit2's own (amount, expiration, nonce) record for a router.
    pub async fn permit2_allowance(
        &self,
        permit2: Address,
        q: AllowanceQuery,
    ) -> Result<Permit2Allowance, SwapError> {
        self.ledger
            .permit2_allowance(permit2, q.owner, q.token, q.spender)
            .await
            .map_err(|e| SwapError::ledger("permit2 allowance", q.token, &e))
    }

    /// Balance plus both allowance hops (`owner -> permit2` and `permit2 -> router`).
    pub async fn report(
        &self,
        token: &Token,
        owner: Address,
        permit2: Address,
        router: Address,
    ) -> Result<TokenReport, SwapError> {
        let balance = self.balance(token, owner).await?;
        let erc20 = self
            .allowance(AllowanceQuery {
                token: token.address,
                owner,
                spender: permit2,
            })
            .await?;
        let inner = self
            .permit2_allowance(
                permit2,
                AllowanceQuery {
                    token: token.address,
                    owner,
                    spender: router,
                },
            )
            .await?;
        Ok(TokenReport {
            symbol: token.symbol.clone(),
            address: token.address,
            balance: amount::format_units(balance, token.decimals),
            permit2_allowance: erc20.to_string(),
            permit2_allowance_class: AllowanceClass::of(erc20),
            router_allowance: inner.amount.to_string(),
            router_allowance_expiration: inner.expiration,
            router_nonce: inner.nonce,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenReport {
    pub symbol: String,
    pub address: Address,
    pub balance: String,
    pub permit2_allowance: String,
    pub permit2_allowance_class: AllowanceClass,
    pub router_allowance: String,
    pub router_allowance_expiration: u64,
    pub router_nonce: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{weth, MockLedger};

    #[test]
    fn classifies_allowances() {
        assert_eq!(AllowanceClass::of(U256::ZERO), AllowanceClass::Zero);
        assert_eq!(AllowanceClass::of(U256::from(5_u64)), AllowanceClass::Limited);
        assert_eq!(AllowanceClass::of(U256::MAX), AllowanceClass::Max);
    }

    #[tokio::test]
    async fn reads_are_fresh_every_call() -> eyre::Result<()> {
        let ledger = MockLedger::new();
        let token = weth();
        let owner = ledger.owner();
        ledger.set_balance(token.address, U256::from(1_u64));
        let inspector = Inspector::new(&ledger);
        assert_eq!(inspector.balance(&token, owner).await?, U256::from(1_u64));

        ledger.set_balance(token.address, U256::from(7_u64));
        assert_eq!(inspector.balance(&token, owner).await?, U256::from(7_u64));
        Ok(())
    }

    #[tokio::test]
    async fn report_covers_both_allowance_hops() -> eyre::Result<()> {
        let ledger = MockLedger::new();
        let token = weth();
        let permit2 = Address::repeat_byte(0x77);
        ledger.set_balance(token.address, U256::from(15_u64) * U256::from(10_u64).pow(U256::from(17_u64)));
        ledger.set_allowance(token.address, permit2, U256::MAX);
        let r = Inspector::new(&ledger)
            .report(&token, ledger.owner(), permit2, Address::repeat_byte(0xAB))
            .await?;
        assert_eq!(r.balance, "1.5");
        assert_eq!(r.permit2_allowance_class, AllowanceClass::Max);
        assert_eq!(r.router_nonce, 0);
        Ok(())
    }

    #[tokio::test]
    async fn transport_failure_is_a_ledger_query_error() {
        let ledger = MockLedger::new();
        ledger.fail_reads("connection refused");
        let token = weth();
        let q = AllowanceQuery {
            token: token.address,
            owner: ledger.owner(),
            spender: Address::repeat_byte(0x99),
        };
        let err = Inspector::new(&ledger).allowance(q).await.err();
        assert!(
            matches!(&err, Some(SwapError::LedgerQuery { what: "allowance", .. })),
            "got {err:?}"
        );
    }
}
