use crate::{config::PermitPolicy, errors::SwapError, tokens::Token};
use alloy::{
    primitives::{
        aliases::{U160, U48},
        Address, Signature, B256, U256,
    },
    signers::local::PrivateKeySigner,
    sol,
    sol_types::{eip712_domain, Eip712Domain, SolStruct as _},
};
use eyre::Context as _;
use serde::Serialize;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    struct PermitDetails {
        address token;
        uint160 amount;
        uint48 expiration;
        uint48 nonce;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct PermitSingle {
        PermitDetails details;
        address spender;
        uint256 sigDeadline;
    }
}

/// Largest allowance Permit2 can record (`type(uint160).max`).
pub const MAX_UINT160: U256 = U256::from_limbs([u64::MAX, u64::MAX, 0xFFFF_FFFF, 0]);
/// Largest Permit2 timestamp or nonce (`type(uint48).max`).
pub const MAX_UINT48: u64 = (1 << 48) - 1;

/// An allowance grant for Permit2, checked at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Permit {
    token: Address,
    amount: U256,
    expiration: u64,
    nonce: u64,
    spender: Address,
    sig_deadline: u64,
}

impl Permit {
    /// Rejects `sig_deadline > expiration`, a deadline that is not in the future,
    /// and any field wider than Permit2 stores.
    pub fn new(
        token: Address,
        amount: U256,
        expiration: u64,
        nonce: u64,
        spender: Address,
        sig_deadline: u64,
        now: u64,
    ) -> eyre::Result<Self> {
        if amount > MAX_UINT160 {
            eyre::bail!("permit amount {amount} exceeds uint160");
        }
        if expiration > MAX_UINT48 || nonce > MAX_UINT48 {
            eyre::bail!("permit expiration/nonce exceeds uint48");
        }
        if sig_deadline > expiration {
            eyre::bail!("sigDeadline {sig_deadline} is after expiration {expiration}");
        }
        if sig_deadline <= now {
            eyre::bail!("sigDeadline {sig_deadline} is not after now ({now})");
        }
        if spender == Address::ZERO {
            eyre::bail!("permit spender is the zero address");
        }
        Ok(Self {
            token,
            amount,
            expiration,
            nonce,
            spender,
            sig_deadline,
        })
    }

    pub const fn token(&self) -> Address {
        self.token
    }
    pub const fn amount(&self) -> U256 {
        self.amount
    }
    pub const fn expiration(&self) -> u64 {
        self.expiration
    }
    pub const fn nonce(&self) -> u64 {
        self.nonce
    }
    pub const fn spender(&self) -> Address {
        self.spender
    }
    pub const fn sig_deadline(&self) -> u64 {
        self.sig_deadline
    }

    /// Permit2 rejects a signature once `block.timestamp > sigDeadline`.
    pub const fn is_usable_at(&self, now: u64) -> bool {
        now <= self.sig_deadline
    }

    pub fn to_sol(&self) -> PermitSingle {
        PermitSingle {
            details: PermitDetails {
                token: self.token,
                amount: U160::saturating_from(self.amount),
                expiration: U48::saturating_from(self.expiration),
                nonce: U48::saturating_from(self.nonce),
            },
            spender: self.spender,
            sigDeadline: U256::from(self.sig_deadline),
        }
    }
}

/// A permit together with the signature produced over exactly that permit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermitSignature {
    permit: Permit,
    signature: Signature,
}

impl PermitSignature {
    pub const fn permit(&self) -> &Permit {
        &self.permit
    }

    /// 65-byte `r || s || v` encoding expected by Permit2.
    pub fn bytes(&self) -> Vec<u8> {
        self.signature.as_bytes().to_vec()
    }

    /// Address that signed `permit` under `domain`. A permit that differs from the one
    /// signed recovers to some other address.
    pub fn recover_signer(&self, permit: &Permit, domain: &Eip712Domain) -> eyre::Result<Address> {
        let hash = permit.to_sol().eip712_signing_hash(domain);
        self.signature
            .recover_address_from_prehash(&hash)
            .context("recover permit signer")
    }
}

/// Holder of the wallet credential able to sign EIP-712 digests.
pub trait TypedDataSigner {
    fn address(&self) -> Address;

    async fn sign_digest(&self, digest: B256) -> eyre::Result<Signature>;
}

impl TypedDataSigner for PrivateKeySigner {
    fn address(&self) -> Address {
        alloy::signers::Signer::address(self)
    }

    async fn sign_digest(&self, digest: B256) -> eyre::Result<Signature> {
        alloy::signers::Signer::sign_hash(self, &digest)
            .await
            .context("sign typed data")
    }
}

pub fn permit2_domain(chain_id: u64, permit2: Address) -> Eip712Domain {
    eip712_domain! {
        name: "Permit2",
        chain_id: chain_id,
        verifying_contract: permit2,
    }
}

pub fn unix_now() -> Result<u64, SwapError> {
    u64::try_from(chrono::Utc::now().timestamp())
        .map_err(|e| SwapError::config(format!("system clock before unix epoch: {e}")))
}

/// Builds and signs Permit2 `PermitSingle` messages for one spender (the router).
pub struct PermitSigner<'a, S> {
    signer: &'a S,
    domain: Eip712Domain,
    spender: Address,
    policy: &'a PermitPolicy,
}

impl<'a, S: TypedDataSigner> PermitSigner<'a, S> {
    pub fn new(
        signer: &'a S,
        chain_id: u64,
        permit2: Address,
        spender: Address,
        policy: &'a PermitPolicy,
    ) -> Self {
        Self {
            signer,
            domain: permit2_domain(chain_id, permit2),
            spender,
            policy,
        }
    }

    /// Expiration and signature deadline are fixed offsets from `now`.
    pub fn build_permit_at(
        &self,
        token: &Token,
        amount: U256,
        nonce: u64,
        now: u64,
    ) -> Result<Permit, SwapError> {
        let expiration = now.saturating_add(self.policy.expiration_seconds);
        let sig_deadline = now.saturating_add(self.policy.sig_deadline_seconds);
        Permit::new(
            token.address,
            amount,
            expiration,
            nonce,
            self.spender,
            sig_deadline,
            now,
        )
        .map_err(|e| SwapError::Signing {
            token: token.address,
            reason: format!("invalid permit: {e:#}"),
        })
    }

    pub async fn sign(&self, permit: &Permit) -> Result<PermitSignature, SwapError> {
        let digest = permit.to_sol().eip712_signing_hash(&self.domain);
        let signature =
            self.signer
                .sign_digest(digest)
                .await
                .map_err(|e| SwapError::Signing {
                    token: permit.token(),
                    reason: format!("{e:#}"),
                })?;
        let signed = PermitSignature {
            permit: permit.clone(),
            signature,
        };
        let recovered = signed
            .recover_signer(permit, &self.domain)
            .map_err(|e| SwapError::Signing {
                token: permit.token(),
                reason: format!("{e:#}"),
            })?;
        if recovered != self.signer.address() {
            return Err(SwapError::Signing {
                token: permit.token(),
                reason: format!(
                    "signature recovers to {recovered:#x}, expected {:#x}",
                    self.signer.address()
                ),
            });
        }
        tracing::debug!(
            token = %permit.token(),
            amount = %permit.amount(),
            spender = %permit.spender(),
            expiration = permit.expiration(),
            nonce = permit.nonce(),
            sig_deadline = permit.sig_deadline(),
            signer = %self.signer.address(),
            "permit signed"
        );
        Ok(signed)
    }
}
