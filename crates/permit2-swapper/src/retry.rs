use std::{future::Future, time::Duration};

/// Bounded retry across a list of RPC endpoints.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Full passes over the endpoint list.
    pub rounds: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random jitter (`0..=jitter_max_ms`) added to each sleep.
    pub jitter_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rounds: 3,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(4),
            jitter_max_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// One pass, no sleeping.
    pub const fn single_pass() -> Self {
        Self {
            rounds: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_max_ms: 0,
        }
    }

    fn delay_after_round(&self, round: usize) -> Duration {
        let shift = u32::try_from(round.min(16)).unwrap_or(16);
        let factor = 1_u32.checked_shl(shift).unwrap_or(u32::MAX);
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter = if cfg!(test) || self.jitter_max_ms == 0 {
            0
        } else {
            rand::random::<u64>() % self.jitter_max_ms.saturating_add(1)
        };
        backoff.saturating_add(Duration::from_millis(jitter))
    }
}

/// Run `op` against each endpoint in order until one succeeds. After every endpoint in a
/// round has failed, back off exponentially and start the next round.
pub async fn first_success<E, T, Fut>(
    endpoints: &[E],
    policy: &RetryPolicy,
    mut op: impl FnMut(&E) -> Fut,
    label: &'static str,
) -> eyre::Result<T>
where
    Fut: Future<Output = eyre::Result<T>>,
{
    if endpoints.is_empty() {
        eyre::bail!("{label}: no endpoints configured");
    }
    if policy.rounds == 0 {
        eyre::bail!("{label}: retry policy has zero rounds");
    }

    let mut last_err = None;
    for round in 0..policy.rounds {
        for ep in endpoints {
            match op(ep).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    tracing::debug!(label, round, error = %format!("{e:#}"), "endpoint attempt failed");
                    last_err = Some(e);
                }
            }
        }
        if round + 1 < policy.rounds {
            tokio::time::sleep(policy.delay_after_round(round)).await;
        }
    }

    Err(last_err
        .unwrap_or_else(|| eyre::eyre!("unknown error"))
        .wrap_err(label))
}
