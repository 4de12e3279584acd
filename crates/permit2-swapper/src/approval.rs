use crate::{
    chains::evm::{build_erc20_approve, Ledger, TxOutcome},
    config::ExecutionPolicy,
    errors::SwapError,
    inspector::{AllowanceQuery, Inspector},
    tokens::Token,
};
use alloy::primitives::{Address, U256};

/// Allowance granted whenever an approval is needed. Approving once to the cap avoids
/// an approval transaction per swap.
pub const APPROVAL_CAP: U256 = U256::MAX;

pub struct ApprovalManager<'a, L> {
    ledger: &'a L,
    policy: &'a ExecutionPolicy,
}

impl<'a, L: Ledger> ApprovalManager<'a, L> {
    pub const fn new(ledger: &'a L, policy: &'a ExecutionPolicy) -> Self {
        Self { ledger, policy }
    }

    /// Make sure `spender` may move at least `min_amount` of `token` for `owner`.
    ///
    /// Returns `Ok(None)` without touching the chain when the current allowance already
    /// covers `min_amount`. Otherwise submits one `approve(spender, APPROVAL_CAP)` and
    /// waits for the configured confirmation depth.
    pub async fn ensure_allowance(
        &self,
        token: &Token,
        owner: Address,
        spender: Address,
        min_amount: U256,
    ) -> Result<Option<TxOutcome>, SwapError> {
        let fail = |reason: String| SwapError::Approval {
            token: token.address,
            spender,
            reason,
        };

        let current = Inspector::new(self.ledger)
            .allowance(AllowanceQuery {
                token: token.address,
                owner,
                spender,
            })
            .await?;
        if current >= min_amount {
            tracing::info!(
                token = %token.symbol,
                spender = %spender,
                allowance = %current,
                required = %min_amount,
                "allowance sufficient; no approval needed"
            );
            return Ok(None);
        }

        let signer = self.ledger.wallet_address();
        if signer != owner {
            return Err(fail(format!(
                "owner {owner:#x} is not the signing wallet {signer:#x}"
            )));
        }

        tracing::info!(
            token = %token.symbol,
            spender = %spender,
            allowance = %current,
            required = %min_amount,
            "submitting approval"
        );
        let tx = build_erc20_approve(owner, token.address, spender, APPROVAL_CAP);
        let hash = self
            .ledger
            .send_transaction(tx)
            .await
            .map_err(|e| fail(format!("submit: {e:#}")))?;
        tracing::info!(token = %token.symbol, tx_hash = %hash, "approval sent");

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

        tracing::info!(
            token = %token.symbol,
            tx_hash = %hash,
            block = outcome.block_number,
            confirmations = outcome.confirmations,
            "approval confirmed"
        );
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{execution_policy, weth, MockLedger};

    const PERMIT2: Address = Address::repeat_byte(0x77);

    #[tokio::test]
    async fn second_call_is_a_no_op() -> eyre::Result<()> {
        let ledger = MockLedger::new();
        let policy = execution_policy();
        let token = weth();
        let owner = ledger.owner();
        let mgr = ApprovalManager::new(&ledger, &policy);
        let min = U256::from(10_u64).pow(U256::from(17_u64));

        let first = mgr.ensure_allowance(&token, owner, PERMIT2, min).await?;
        assert!(first.is_some(), "first call must approve");
        let second = mgr.ensure_allowance(&token, owner, PERMIT2, min).await?;
        assert!(second.is_none(), "second call must not approve again");

        assert_eq!(ledger.sent().len(), 1, "exactly one on-chain mutation");
        assert_eq!(
            ledger.allowance_of(token.address, PERMIT2),
            APPROVAL_CAP,
            "allowance raised to cap"
        );
        Ok(())
    }

    #[tokio::test]
    async fn existing_allowance_at_cap_needs_no_transaction() -> eyre::Result<()> {
        let ledger = MockLedger::new();
        let policy = execution_policy();
        let token = weth();
        ledger.set_allowance(token.address, PERMIT2, APPROVAL_CAP);
        let out = ApprovalManager::new(&ledger, &policy)
            .ensure_allowance(&token, ledger.owner(), PERMIT2, APPROVAL_CAP)
            .await?;
        assert!(out.is_none());
        assert!(ledger.sent().is_empty(), "no transaction expected");
        Ok(())
    }

    #[tokio::test]
    async fn reverted_approval_is_an_approval_error() {
        let ledger = MockLedger::new();
        let policy = execution_policy();
        let token = weth();
        ledger.revert_sends_to(token.address);
        let err = ApprovalManager::new(&ledger, &policy)
            .ensure_allowance(&token, ledger.owner(), PERMIT2, U256::from(1_u64))
            .await
            .err();
        assert!(
            matches!(&err, Some(SwapError::Approval { reason, .. }) if reason.contains("reverted")),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn submission_failure_is_an_approval_error() {
        let ledger = MockLedger::new();
        let policy = execution_policy();
        ledger.fail_sends("nonce too low");
        let err = ApprovalManager::new(&ledger, &policy)
            .ensure_allowance(&weth(), ledger.owner(), PERMIT2, U256::from(1_u64))
            .await
            .err();
        assert!(
            matches!(&err, Some(SwapError::Approval { reason, .. }) if reason.contains("nonce too low")),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn foreign_owner_is_refused_before_submission() {
        let ledger = MockLedger::new();
        let policy = execution_policy();
        let err = ApprovalManager::new(&ledger, &policy)
            .ensure_allowance(&weth(), Address::repeat_byte(0x55), PERMIT2, U256::from(1_u64))
            .await
            .err();
        assert!(matches!(err, Some(SwapError::Approval { .. })), "got {err:?}");
        assert!(ledger.sent().is_empty(), "nothing may be sent");
    }
}
