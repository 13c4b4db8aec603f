//! Account acquisition shared by every dispatch engine: rate-limit waiting,
//! optimistic reset, and the single model-fallback hop.

use super::{
    fallback_model, format_reset_time, MAX_WAIT_BEFORE_ERROR_MS, POST_RATE_LIMIT_BUFFER_MS,
};
use crate::pool::AccountPool;
use multiclaude_types::{Account, Provider, ProxyError};

/// What the dispatch should do next.
pub enum AcquireOutcome {
    /// Proceed with this account.
    Account(Account),
    /// Retry the whole attempt with the fallback model.
    Fallback(String),
}

/// Pick an account, waiting out a universal rate limit when that is cheaper
/// than failing.
///
/// When every account is hard-limited for the model, sleep until the
/// earliest reset (bounded by the error budget), clear what expired, and if
/// selection still comes up dry, optimistically reset the provider's limits
/// for one more try. With the pool truly exhausted, a single fallback-model
/// hop is offered before giving up.
pub async fn acquire_account(
    pool: &AccountPool,
    provider: Provider,
    model: &str,
    fallback_enabled: bool,
    already_fallback: bool,
) -> Result<AcquireOutcome, ProxyError> {
    if let Some(account) = pool.pick_next(provider, model) {
        return Ok(AcquireOutcome::Account(account));
    }

    if pool.is_all_rate_limited(provider, model) {
        let wait = pool.get_min_wait_ms(provider, model) + POST_RATE_LIMIT_BUFFER_MS;
        if wait > MAX_WAIT_BEFORE_ERROR_MS {
            return Err(ProxyError::ResourceExhausted { reset_at: format_reset_time(wait) });
        }

        tracing::info!(
            "All {} accounts rate limited for {}; waiting {}ms",
            provider,
            model,
            wait
        );
        tokio::time::sleep(std::time::Duration::from_millis(wait as u64)).await;
        pool.clear_expired_limits();

        if let Some(account) = pool.pick_next(provider, model) {
            return Ok(AcquireOutcome::Account(account));
        }

        // The wait completed but nothing freed up (clock skew, missing
        // reset times). Give the provider one optimistic second chance.
        pool.reset_all_rate_limits(Some(provider));
        if let Some(account) = pool.pick_next(provider, model) {
            return Ok(AcquireOutcome::Account(account));
        }
    }

    if fallback_enabled && !already_fallback {
        if let Some(fallback) = fallback_model(model) {
            tracing::warn!("No {} accounts for {}; falling back to {}", provider, model, fallback);
            return Ok(AcquireOutcome::Fallback(fallback.to_string()));
        }
    }

    Err(ProxyError::NoAccounts { provider: provider.to_string() })
}
