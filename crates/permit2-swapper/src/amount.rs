use alloy::primitives::U256;
use eyre::Context as _;

/// Parse a decimal UI amount (e.g. `"0.1"`) into base units for a token with `decimals`.
pub fn parse_units(s: &str, decimals: u8) -> eyre::Result<U256> {
    let s = s.trim();
    if s.is_empty() {
        eyre::bail!("empty amount");
    }
    if s.starts_with('-') {
        eyre::bail!("amount must be non-negative");
    }

    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    if whole.is_empty() && frac.is_empty() {
        eyre::bail!("amount has no digits");
    }
    if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
        eyre::bail!("amount must be a plain decimal number: {s:?}");
    }
    if frac.len() > usize::from(decimals) {
        eyre::bail!("too many decimal places for token (decimals={decimals})");
    }

    let whole_v = if whole.is_empty() {
        U256::ZERO
    } else {
        whole.parse::<U256>().context("parse whole part")?
    };
    let frac_v = if frac.is_empty() {
        U256::ZERO
    } else {
        let padded = format!("{frac:0<width$}", width = usize::from(decimals));
        padded.parse::<U256>().context("parse fractional part")?
    };

    let scale = U256::from(10_u64)
        .checked_pow(U256::from(decimals))
        .ok_or_else(|| eyre::eyre!("decimals too large"))?;
    whole_v
        .checked_mul(scale)
        .and_then(|x| x.checked_add(frac_v))
        .ok_or_else(|| eyre::eyre!("amount overflow"))
}

/// Format base units as a UI decimal string without floats.
///
/// - `1500000` with 6 decimals => `"1.5"`
/// - `1` with 6 decimals => `"0.000001"`
pub fn format_units(base: U256, decimals: u8) -> String {
    if decimals == 0 {
        return base.to_string();
    }
    let scale = U256::from(10_u64).pow(U256::from(decimals));
    let whole = base / scale;
    let frac = base % scale;
    if frac.is_zero() {
        return whole.to_string();
    }
    let frac_s = format!("{frac:0>width$}", frac = frac.to_string(), width = usize::from(decimals));
    format!("{whole}.{}", frac_s.trim_end_matches('0'))
}
