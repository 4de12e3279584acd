use crate::{
    config::SwapperConfig,
    errors::SwapError,
    paths::SwapperPaths,
};
use secrecy::SecretString;
use std::{fs, path::PathBuf};

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

/// Apply process-environment overrides on top of the file. Variable names match the
/// `.env` layout the tool has always accepted.
pub fn apply_env_overrides(
    cfg: &mut SwapperConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(), SwapError> {
    let get = |var: &str| {
        env(var)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    };

    if let Some(v) = get("WALLET_ADDRESS") {
        cfg.wallet_address = Some(v);
    }
    if let Some(v) = get("CHAIN_ID") {
        let id = v
            .parse::<u64>()
            .map_err(|e| SwapError::config(format!("invalid CHAIN_ID {v:?}: {e}")))?;
        cfg.chain_id = Some(id);
    }
    if let Some(v) = get("RPC_URL") {
        cfg.rpc_url = Some(v);
    }
    if let Some(v) = get("UNIVERSAL_ROUTER_ADDRESS") {
        cfg.universal_router_address = Some(v);
    }
    if let Some(v) = get("PERMIT2_ADDRESS") {
        cfg.permit2_address = v;
    }
    for (symbol, token) in &mut cfg.tokens {
        if let Some(v) = get(&format!("{}_ADDRESS", symbol.trim().to_uppercase())) {
            token.address = Some(v);
        }
    }
    Ok(())
}

pub fn wallet_secret_from_env(env: impl Fn(&str) -> Option<String>) -> Option<SecretString> {
    env("WALLET_SECRET")
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .map(|v| SecretString::new(v.into()))
}

fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

impl ConfigStore {
    pub fn new(paths: &SwapperPaths, explicit: Option<PathBuf>) -> Self {
        Self {
            path: explicit.unwrap_or_else(|| paths.config_file()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read the file (absent file = empty config), add built-in defaults, then apply env.
    pub fn load(&self) -> Result<SwapperConfig, SwapError> {
        let cfg = if self.path.exists() {
            let s = fs::read_to_string(&self.path).map_err(|e| {
                SwapError::config(format!("read {}: {e}", self.path.display()))
            })?;
            toml::from_str::<SwapperConfig>(&s).map_err(|e| {
                SwapError::config(format!("parse {}: {e}", self.path.display()))
            })?
        } else {
            tracing::debug!(path = %self.path.display(), "no config file; using environment only");
            SwapperConfig::default()
        };
        let mut cfg = cfg.with_builtin_defaults();
        apply_env_overrides(&mut cfg, process_env)?;
        Ok(cfg)
    }

    pub fn load_secret() -> Option<SecretString> {
        wallet_secret_from_env(process_env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn env_overrides_fill_scalar_and_token_addresses() -> eyre::Result<()> {
        let mut cfg = SwapperConfig::default().with_builtin_defaults();
        apply_env_overrides(
            &mut cfg,
            env_of(&[
                ("WALLET_ADDRESS", " 0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266 "),
                ("CHAIN_ID", "42161"),
                ("RPC_URL", "http://127.0.0.1:8545"),
                ("WETH_ADDRESS", "0x82aF49447D8a07e3bd95BD0d56f35241523fBab1"),
                ("DAI_ADDRESS", ""),
            ]),
        )?;
        assert_eq!(
            cfg.wallet_address.as_deref(),
            Some("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );
        assert_eq!(cfg.chain_id, Some(42_161));
        assert_eq!(cfg.rpc_url.as_deref(), Some("http://127.0.0.1:8545"));
        assert_eq!(
            cfg.tokens.get("WETH").and_then(|t| t.address.as_deref()),
            Some("0x82aF49447D8a07e3bd95BD0d56f35241523fBab1")
        );
        // Empty values do not override.
        assert!(cfg.tokens.get("DAI").is_some_and(|t| t.address.is_none()));
        Ok(())
    }

    #[test]
    fn unparseable_chain_id_is_reported_not_dropped() {
        let mut cfg = SwapperConfig {
            chain_id: Some(10),
            ..SwapperConfig::default()
        };
        let err = apply_env_overrides(&mut cfg, env_of(&[("CHAIN_ID", "arbitrum")])).err();
        assert!(
            matches!(&err, Some(e @ SwapError::Configuration(_)) if e.to_string().contains("invalid CHAIN_ID \"arbitrum\"")),
            "got {err:?}"
        );
        assert_eq!(cfg.chain_id, Some(10), "file value must survive a bad override");
    }

    #[test]
    fn file_values_survive_when_env_is_silent() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
chain_id = 10
rpc_url = "https://mainnet.optimism.io"

[routing]
slippage_bps = 100

[tokens.WETH]
address = "0x4200000000000000000000000000000000000006"
decimals = 18

[[swaps]]
token_in = "WETH"
token_out = "USDC"
amount = "0.25"
"#,
        )?;
        let s = std::fs::read_to_string(&path)?;
        let mut cfg = toml::from_str::<SwapperConfig>(&s)?.with_builtin_defaults();
        apply_env_overrides(&mut cfg, env_of(&[]))?;
        assert_eq!(cfg.chain_id, Some(10));
        assert_eq!(cfg.routing.slippage_bps, 100);
        assert_eq!(cfg.routing.fee_tiers, vec![500, 3_000, 10_000]);
        assert_eq!(cfg.execution.confirmations, 2);
        // File declared tokens, so the built-in registry is not merged in.
        assert_eq!(cfg.tokens.len(), 1);
        assert_eq!(cfg.swaps.len(), 1);
        Ok(())
    }

    #[test]
    fn secret_comes_only_from_env() {
        assert!(wallet_secret_from_env(env_of(&[])).is_none());
        assert!(wallet_secret_from_env(env_of(&[("WALLET_SECRET", "  ")])).is_none());
        assert!(wallet_secret_from_env(env_of(&[("WALLET_SECRET", "0xabc")])).is_some());
    }
}
