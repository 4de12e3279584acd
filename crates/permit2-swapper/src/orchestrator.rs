use crate::{
    amount,
    approval::ApprovalManager,
    chains::evm::Ledger,
    config::ResolvedConfig,
    errors::{Phase, SwapError},
    events::{EventSink, RunEvent},
    executor::{SwapExecutor, SwapReceipt},
    inspector::{AllowanceQuery, Inspector},
    permit::{unix_now, PermitSignature, PermitSigner, TypedDataSigner, MAX_UINT160},
    quote::{QuoteEngine, RouteFinder},
    tokens::Token,
};
use alloy::primitives::{Address, B256, U256};
use serde::Serialize;
use std::collections::BTreeMap;

/// One unit of work: sell `amount` (base units) of `token_in` for `token_out`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapRequest {
    pub token_in: Token,
    pub token_out: Token,
    pub amount: U256,
}

impl SwapRequest {
    fn label(&self, index: usize) -> String {
        format!(
            "#{index} {} {} -> {}",
            amount::format_units(self.amount, self.token_in.decimals),
            self.token_in.symbol,
            self.token_out.symbol
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SwapStatus {
    Succeeded {
        receipt: SwapReceipt,
        expected_out: String,
        fee_tier: u32,
    },
    Skipped {
        reason: String,
    },
    Failed {
        phase: Phase,
        code: &'static str,
        error: String,
    },
}

impl SwapStatus {
    fn failed(phase: Phase, err: &SwapError) -> Self {
        Self::Failed {
            phase,
            code: err.code(),
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapOutcome {
    pub index: usize,
    pub token_in: String,
    pub token_out: String,
    pub amount: String,
    pub amount_base: String,
    #[serde(flatten)]
    pub status: SwapStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRecord {
    pub token: String,
    pub spender: Address,
    /// `None` when the existing allowance already covered the run.
    pub tx_hash: Option<B256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatalFailure {
    pub phase: Phase,
    pub code: &'static str,
    pub message: String,
}

/// Aggregate result of a run. Always produced, fatal or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub chain_id: u64,
    pub wallet: Address,
    pub final_phase: Phase,
    pub approvals: Vec<ApprovalRecord>,
    pub swaps: Vec<SwapOutcome>,
    pub fatal: Option<FatalFailure>,
}

impl RunSummary {
    /// Summary for a run that failed before the state machine could start, e.g. on an
    /// unresolvable configuration.
    pub fn not_started(run_id: &str, err: &SwapError) -> Self {
        Self {
            run_id: run_id.to_owned(),
            chain_id: 0,
            wallet: Address::ZERO,
            final_phase: Phase::Init,
            approvals: Vec::new(),
            swaps: Vec::new(),
            fatal: Some(FatalFailure {
                phase: Phase::Init,
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }

    fn count(&self, pred: impl Fn(&SwapStatus) -> bool) -> usize {
        self.swaps.iter().filter(|s| pred(&s.status)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, SwapStatus::Succeeded { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, SwapStatus::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, SwapStatus::Failed { .. }))
    }

    pub const fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }
}

struct Halt {
    phase: Phase,
    error: SwapError,
}

fn at(phase: Phase) -> impl Fn(SwapError) -> Halt {
    move |error| Halt { phase, error }
}

pub type Clock<'a> = Box<dyn Fn() -> Result<u64, SwapError> + 'a>;

/// Drives one run through
/// `INIT -> CHECK_BALANCE -> ENSURE_APPROVAL -> SIGN_PERMIT -> (QUOTE -> EXECUTE)* -> DONE`.
///
/// Every step is awaited before the next starts. Configuration, ledger-query, approval,
/// signing and routing-service failures halt the run; a swap with no route is skipped and
/// a failed execution is recorded, and the batch carries on.
pub struct Orchestrator<'a, L, R, S, E> {
    cfg: &'a ResolvedConfig,
    ledger: &'a L,
    routes: &'a R,
    signer: &'a S,
    events: &'a E,
    clock: Clock<'a>,
}

impl<'a, L, R, S, E> Orchestrator<'a, L, R, S, E>
where
    L: Ledger,
    R: RouteFinder,
    S: TypedDataSigner,
    E: EventSink,
{
    pub fn new(
        cfg: &'a ResolvedConfig,
        ledger: &'a L,
        routes: &'a R,
        signer: &'a S,
        events: &'a E,
    ) -> Self {
        Self {
            cfg,
            ledger,
            routes,
            signer,
            events,
            clock: Box::new(unix_now),
        }
    }

    #[cfg(test)]
    #[must_use]
    pub fn with_clock(mut self, clock: Clock<'a>) -> Self {
        self.clock = clock;
        self
    }

    fn enter(&self, phase: Phase, subject: &str) {
        self.events.emit(&RunEvent::PhaseEntered {
            phase,
            subject: subject.to_owned(),
        });
    }

    fn complete(&self, phase: Phase, subject: &str, detail: String) {
        self.events.emit(&RunEvent::PhaseCompleted {
            phase,
            subject: subject.to_owned(),
            detail,
        });
    }

    fn fail(&self, phase: Phase, subject: &str, err: &SwapError) {
        self.events.emit(&RunEvent::PhaseFailed {
            phase,
            subject: subject.to_owned(),
            code: err.code(),
            message: err.to_string(),
        });
    }

    pub async fn run(&self, run_id: &str) -> RunSummary {
        let mut summary = RunSummary {
            run_id: run_id.to_owned(),
            chain_id: self.cfg.chain_id,
            wallet: self.cfg.wallet_address,
            final_phase: Phase::Init,
            approvals: Vec::new(),
            swaps: Vec::new(),
            fatal: None,
        };

        let halt = match self.prepare(&mut summary).await {
            Ok(mut permits) => self.swap_all(&mut summary, &mut permits).await.err(),
            Err(h) => {
                self.fail(h.phase, "run", &h.error);
                Some(h)
            }
        };

        if let Some(h) = halt {
            let reason = format!("run halted in {}: {}", h.phase, h.error.code());
            for (index, req) in self.cfg.swaps.iter().enumerate().skip(summary.swaps.len()) {
                summary.swaps.push(outcome(
                    index,
                    req,
                    SwapStatus::Skipped {
                        reason: reason.clone(),
                    },
                ));
            }
            summary.final_phase = h.phase;
            summary.fatal = Some(FatalFailure {
                phase: h.phase,
                code: h.error.code(),
                message: h.error.to_string(),
            });
            return summary;
        }

        summary.final_phase = Phase::Done;
        self.complete(
            Phase::Done,
            "run",
            format!(
                "{} succeeded, {} skipped, {} failed",
                summary.succeeded(),
                summary.skipped(),
                summary.failed()
            ),
        );
        summary
    }

    /// Input tokens in first-use order, with the total amount the batch sells of each.
    fn input_totals(&self) -> Vec<(&'a Token, U256)> {
        let cfg = self.cfg;
        let mut totals: Vec<(&'a Token, U256)> = Vec::new();
        for req in &cfg.swaps {
            if let Some((_, sum)) = totals
                .iter_mut()
                .find(|(t, _)| t.address == req.token_in.address)
            {
                *sum = sum.saturating_add(req.amount);
            } else {
                totals.push((&req.token_in, req.amount));
            }
        }
        totals
    }

    async fn prepare(
        &self,
        summary: &mut RunSummary,
    ) -> Result<BTreeMap<Address, PermitSignature>, Halt> {
        let cfg = self.cfg;

        self.enter(Phase::Init, "run");
        let wallet = self.ledger.wallet_address();
        if wallet != cfg.wallet_address || self.signer.address() != wallet {
            return Err(at(Phase::Init)(SwapError::config(format!(
                "ledger wallet {wallet:#x} / signer {:#x} do not match configured wallet {:#x}",
                self.signer.address(),
                cfg.wallet_address
            ))));
        }
        let totals = self.input_totals();
        self.complete(
            Phase::Init,
            "run",
            format!("{} swap request(s), {} input token(s)", cfg.swaps.len(), totals.len()),
        );

        let inspector = Inspector::new(self.ledger);
        for (token, required) in &totals {
            self.enter(Phase::CheckBalance, &token.symbol);
            let balance = inspector
                .balance(token, wallet)
                .await
                .map_err(at(Phase::CheckBalance))?;
            self.events.emit(&RunEvent::BalanceObserved {
                token: token.symbol.clone(),
                balance: amount::format_units(balance, token.decimals),
            });
            if balance < *required {
                self.events.emit(&RunEvent::Warning {
                    phase: Phase::CheckBalance,
                    message: format!(
                        "{} balance {} is below the {} this run sells",
                        token.symbol,
                        amount::format_units(balance, token.decimals),
                        amount::format_units(*required, token.decimals)
                    ),
                });
            }
            self.complete(Phase::CheckBalance, &token.symbol, balance.to_string());
        }

        let approvals = ApprovalManager::new(self.ledger, &cfg.execution);
        for (token, required) in &totals {
            self.enter(Phase::EnsureApproval, &token.symbol);
            let receipt = approvals
                .ensure_allowance(token, wallet, cfg.permit2, *required)
                .await
                .map_err(at(Phase::EnsureApproval))?;
            let detail = receipt.as_ref().map_or_else(
                || "allowance already sufficient".to_owned(),
                |r| format!("approved in {:#x}", r.hash),
            );
            summary.approvals.push(ApprovalRecord {
                token: token.symbol.clone(),
                spender: cfg.permit2,
                tx_hash: receipt.map(|r| r.hash),
            });
            self.complete(Phase::EnsureApproval, &token.symbol, detail);
        }

        let permit_signer = PermitSigner::new(
            self.signer,
            cfg.chain_id,
            cfg.permit2,
            cfg.universal_router,
            &cfg.permit,
        );
        let mut permits = BTreeMap::new();
        for (token, _) in &totals {
            self.enter(Phase::SignPermit, &token.symbol);
            let current = inspector
                .permit2_allowance(
                    cfg.permit2,
                    AllowanceQuery {
                        token: token.address,
                        owner: wallet,
                        spender: cfg.universal_router,
                    },
                )
                .await
                .map_err(at(Phase::SignPermit))?;
            let now = (self.clock)().map_err(at(Phase::SignPermit))?;
            let permit = permit_signer
                .build_permit_at(token, MAX_UINT160, current.nonce, now)
                .map_err(at(Phase::SignPermit))?;
            let signed = permit_signer
                .sign(&permit)
                .await
                .map_err(at(Phase::SignPermit))?;
            permits.insert(token.address, signed);
            self.complete(
                Phase::SignPermit,
                &token.symbol,
                format!("nonce {} valid until {}", permit.nonce(), permit.sig_deadline()),
            );
        }
        Ok(permits)
    }

    async fn swap_all(
        &self,
        summary: &mut RunSummary,
        permits: &mut BTreeMap<Address, PermitSignature>,
    ) -> Result<(), Halt> {
        for (index, req) in self.cfg.swaps.iter().enumerate() {
            let status = self.swap_one(index, req, permits).await?;
            summary.swaps.push(outcome(index, req, status));
            self.observe_balances(req).await;
        }
        Ok(())
    }

    /// `Err` only for failures that halt the run.
    async fn swap_one(
        &self,
        index: usize,
        req: &SwapRequest,
        permits: &mut BTreeMap<Address, PermitSignature>,
    ) -> Result<SwapStatus, Halt> {
        let subject = req.label(index);
        self.enter(Phase::Quote, &subject);

        let now = (self.clock)().map_err(at(Phase::Quote))?;
        let expired = permits
            .get(&req.token_in.address)
            .is_some_and(|p| !p.permit().is_usable_at(now));
        if expired {
            permits.remove(&req.token_in.address);
            let err = SwapError::execution(
                &req.token_in.symbol,
                req.amount,
                "permit signature deadline has passed",
            );
            self.fail(Phase::Quote, &subject, &err);
            return Ok(SwapStatus::failed(Phase::Quote, &err));
        }
        let permit = permits.get(&req.token_in.address).cloned();

        let quote = match QuoteEngine::new(self.routes)
            .get_quote(req.amount, &req.token_in, &req.token_out, permit.as_ref())
            .await
        {
            Ok(Some(q)) => q,
            Ok(None) => {
                self.complete(Phase::Quote, &subject, "no route found".to_owned());
                return Ok(SwapStatus::Skipped {
                    reason: "no route found".to_owned(),
                });
            }
            Err(e) => {
                self.fail(Phase::Quote, &subject, &e);
                return Err(at(Phase::Quote)(e));
            }
        };
        self.complete(
            Phase::Quote,
            &subject,
            format!(
                "expect {} {} (fee tier {})",
                amount::format_units(quote.expected_out(), req.token_out.decimals),
                req.token_out.symbol,
                quote.fee_tier()
            ),
        );

        self.enter(Phase::Execute, &subject);
        let executor = SwapExecutor::new(self.ledger, &self.cfg.execution, self.cfg.universal_router);
        match executor.execute(&quote, &req.token_in, req.amount).await {
            Ok(receipt) => {
                if quote.carries_permit() {
                    permits.remove(&req.token_in.address);
                }
                self.complete(
                    Phase::Execute,
                    &subject,
                    format!(
                        "{:#x} in block {} ({} confirmations)",
                        receipt.tx_hash, receipt.block_number, receipt.confirmations
                    ),
                );
                Ok(SwapStatus::Succeeded {
                    receipt,
                    expected_out: quote.expected_out().to_string(),
                    fee_tier: quote.fee_tier(),
                })
            }
            Err(e) if e.is_fatal() => {
                self.fail(Phase::Execute, &subject, &e);
                Err(at(Phase::Execute)(e))
            }
            Err(e) => {
                self.fail(Phase::Execute, &subject, &e);
                Ok(SwapStatus::failed(Phase::Execute, &e))
            }
        }
    }

    /// Post-swap balances, for the log only.
    async fn observe_balances(&self, req: &SwapRequest) {
        let inspector = Inspector::new(self.ledger);
        for token in [&req.token_in, &req.token_out] {
            match inspector.balance(token, self.cfg.wallet_address).await {
                Ok(b) => self.events.emit(&RunEvent::BalanceObserved {
                    token: token.symbol.clone(),
                    balance: amount::format_units(b, token.decimals),
                }),
                Err(e) => self.events.emit(&RunEvent::Warning {
                    phase: Phase::Execute,
                    message: format!("post-swap balance check failed: {e}"),
                }),
            }
        }
    }
}

fn outcome(index: usize, req: &SwapRequest, status: SwapStatus) -> SwapOutcome {
    SwapOutcome {
        index,
        token_in: req.token_in.symbol.clone(),
        token_out: req.token_out.symbol.clone(),
        amount: amount::format_units(req.amount, req.token_in.decimals),
        amount_base: req.amount.to_string(),
        status,
    }
}
