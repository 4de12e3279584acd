//! Calldata for Uniswap's Universal Router `execute(commands, inputs, deadline)`.
//!
//! Each command byte selects an action; `inputs[i]` is the ABI-encoded parameter tuple for
//! `commands[i]`. Only the two actions a Permit2-backed exact-input swap needs are modelled.

use crate::permit::{PermitSignature, PermitSingle};
use alloy::{
    primitives::{Address, Bytes, U256},
    sol,
    sol_types::{SolCall as _, SolValue as _},
};

sol! {
    interface IUniversalRouter {
        function execute(bytes commands, bytes[] inputs, uint256 deadline) external payable;
    }
}

pub const V3_SWAP_EXACT_IN: u8 = 0x00;
pub const PERMIT2_PERMIT: u8 = 0x0a;

/// Path of a single-pool swap: `token_in ‖ fee (uint24) ‖ token_out`.
pub fn encode_v3_path(token_in: Address, fee: u32, token_out: Address) -> Bytes {
    let mut path = Vec::with_capacity(20 + 3 + 20);
    path.extend_from_slice(token_in.as_slice());
    let fee_be = fee.to_be_bytes();
    path.extend_from_slice(fee_be.get(1..).unwrap_or_default());
    path.extend_from_slice(token_out.as_slice());
    Bytes::from(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V3ExactIn {
    pub recipient: Address,
    pub amount_in: U256,
    pub amount_out_min: U256,
    pub path: Bytes,
    /// Pull input from the caller through Permit2 rather than the router's own balance.
    pub payer_is_user: bool,
}

impl V3ExactIn {
    fn encode(&self) -> Bytes {
        Bytes::from(
            (
                self.recipient,
                self.amount_in,
                self.amount_out_min,
                self.path.clone(),
                self.payer_is_user,
            )
                .abi_encode_params(),
        )
    }

    fn decode(input: &[u8]) -> eyre::Result<Self> {
        let (recipient, amount_in, amount_out_min, path, payer_is_user) =
            <(Address, U256, U256, Bytes, bool)>::abi_decode_params(input)?;
        Ok(Self {
            recipient,
            amount_in,
            amount_out_min,
            path,
            payer_is_user,
        })
    }

    /// Reject parameters that can never produce a sensible swap.
    pub fn verify(&self) -> eyre::Result<()> {
        if self.recipient == Address::ZERO {
            eyre::bail!("swap recipient is the zero address");
        }
        if self.amount_in.is_zero() {
            eyre::bail!("swap amountIn is zero");
        }
        if self.path.is_empty() {
            eyre::bail!("swap path is empty");
        }
        Ok(())
    }
}

/// Ordered list of router commands.
#[derive(Debug, Clone, Default)]
pub struct RouterPlan {
    commands: Vec<u8>,
    inputs: Vec<Bytes>,
}

impl RouterPlan {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn permit2_permit(mut self, signed: &PermitSignature) -> Self {
        let permit: PermitSingle = signed.permit().to_sol();
        let input = (permit, Bytes::from(signed.bytes())).abi_encode_params();
        self.commands.push(PERMIT2_PERMIT);
        self.inputs.push(Bytes::from(input));
        self
    }

    #[must_use]
    pub fn v3_swap_exact_in(mut self, swap: &V3ExactIn) -> Self {
        self.commands.push(V3_SWAP_EXACT_IN);
        self.inputs.push(swap.encode());
        self
    }

    pub fn calldata(self, deadline: u64) -> Bytes {
        Bytes::from(
            IUniversalRouter::executeCall {
                commands: Bytes::from(self.commands),
                inputs: self.inputs,
                deadline: U256::from(deadline),
            }
            .abi_encode(),
        )
    }
}

/// Decoded `execute` call.
#[derive(Debug, Clone)]
pub struct DecodedExecute {
    pub commands: Vec<u8>,
    pub inputs: Vec<Bytes>,
    pub deadline: U256,
}

impl DecodedExecute {
    pub fn decode(calldata: &[u8]) -> eyre::Result<Self> {
        let call = IUniversalRouter::executeCall::abi_decode(calldata)?;
        if call.commands.len() != call.inputs.len() {
            eyre::bail!(
                "{} commands but {} inputs",
                call.commands.len(),
                call.inputs.len()
            );
        }
        Ok(Self {
            commands: call.commands.to_vec(),
            inputs: call.inputs,
            deadline: call.deadline,
        })
    }

    pub fn has_permit(&self) -> bool {
        self.commands.contains(&PERMIT2_PERMIT)
    }

    pub fn v3_swaps(&self) -> eyre::Result<Vec<V3ExactIn>> {
        self.commands
            .iter()
            .zip(&self.inputs)
            .filter(|(c, _)| **c == V3_SWAP_EXACT_IN)
            .map(|(_, input)| V3ExactIn::decode(input))
            .collect()
    }
}

/// Check every exact-input swap in `calldata` before it is sent.
pub fn verify_swap_calldata(calldata: &[u8]) -> eyre::Result<DecodedExecute> {
    let decoded = DecodedExecute::decode(calldata)?;
    let swaps = decoded.v3_swaps()?;
    if swaps.is_empty() {
        eyre::bail!("router calldata contains no swap command");
    }
    for s in &swaps {
        s.verify()?;
    }
    Ok(decoded)
}
