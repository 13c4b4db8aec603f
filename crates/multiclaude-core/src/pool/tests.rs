use super::*;
use multiclaude_types::{Account, AccountSource, ConfigDocument, Provider};

fn test_pool(accounts: Vec<Account>) -> (tempfile::TempDir, AccountPool) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.json");
    let doc = ConfigDocument { accounts, ..Default::default() };
    let pool = AccountPool::from_document(doc, path, reqwest::Client::new());
    (dir, pool)
}

fn oauth_account(email: &str, provider: Provider) -> Account {
    Account::new(email, provider, AccountSource::Oauth)
}

#[test]
fn pick_next_returns_requested_provider() {
    let (_dir, pool) = test_pool(vec![
        oauth_account("anti@x.y", Provider::Antigravity),
        oauth_account("zai@x.y", Provider::Zai),
        oauth_account("cop@x.y", Provider::Copilot),
    ]);

    for provider in Provider::ALL {
        let account = pool.pick_next(provider, "some-model").unwrap();
        assert_eq!(account.provider, provider);
    }
}

#[test]
fn round_robin_alternates_between_accounts() {
    let (_dir, pool) = test_pool(vec![
        oauth_account("a@x.y", Provider::Antigravity),
        oauth_account("b@x.y", Provider::Antigravity),
    ]);

    let first = pool.pick_next(Provider::Antigravity, "m").unwrap();
    let second = pool.pick_next(Provider::Antigravity, "m").unwrap();
    let third = pool.pick_next(Provider::Antigravity, "m").unwrap();
    assert_ne!(first.email, second.email);
    assert_eq!(first.email, third.email);
}

#[test]
fn round_robin_liveness_every_account_selected() {
    let emails = ["a@x.y", "b@x.y", "c@x.y", "d@x.y"];
    let (_dir, pool) =
        test_pool(emails.iter().map(|e| oauth_account(e, Provider::Zai)).collect());

    let mut seen = std::collections::HashSet::new();
    for _ in 0..emails.len() {
        seen.insert(pool.pick_next(Provider::Zai, "glm-4.6").unwrap().email);
    }
    assert_eq!(seen.len(), emails.len());
}

#[test]
fn hard_limited_account_is_skipped_until_reset() {
    let (_dir, pool) = test_pool(vec![
        oauth_account("a@x.y", Provider::Antigravity),
        oauth_account("b@x.y", Provider::Antigravity),
    ]);

    let future = now_ms() + 60_000;
    pool.mark_rate_limited("a@x.y", future, "m");

    for _ in 0..4 {
        let picked = pool.pick_next(Provider::Antigravity, "m").unwrap();
        assert_eq!(picked.email, "b@x.y");
    }

    // Expired limit clears on the next pick and both become eligible again.
    pool.mark_rate_limited("a@x.y", now_ms() - 1, "m");
    let mut seen = std::collections::HashSet::new();
    for _ in 0..2 {
        seen.insert(pool.pick_next(Provider::Antigravity, "m").unwrap().email);
    }
    assert_eq!(seen.len(), 2);
}

#[test]
fn soft_limited_account_deprioritized_but_usable() {
    let (_dir, pool) = test_pool(vec![
        oauth_account("a@x.y", Provider::Antigravity),
        oauth_account("b@x.y", Provider::Antigravity),
    ]);

    pool.update_soft_limit("a@x.y", "m", 0.05, false);

    // Preferred pass avoids the soft-limited account.
    for _ in 0..3 {
        assert_eq!(pool.pick_next(Provider::Antigravity, "m").unwrap().email, "b@x.y");
    }

    // Once the other account is hard-limited, the fallback pass accepts it.
    pool.mark_rate_limited("b@x.y", now_ms() + 60_000, "m");
    assert_eq!(pool.pick_next(Provider::Antigravity, "m").unwrap().email, "a@x.y");
}

#[test]
fn invalid_account_never_selected() {
    let (_dir, pool) = test_pool(vec![
        oauth_account("a@x.y", Provider::Antigravity),
        oauth_account("b@x.y", Provider::Antigravity),
    ]);
    pool.mark_invalid("a@x.y", "revoked");

    for _ in 0..4 {
        assert_eq!(pool.pick_next(Provider::Antigravity, "m").unwrap().email, "b@x.y");
    }
}

#[test]
fn is_all_rate_limited_requires_model_and_full_coverage() {
    let (_dir, pool) = test_pool(vec![
        oauth_account("a@x.y", Provider::Antigravity),
        oauth_account("b@x.y", Provider::Antigravity),
    ]);

    assert!(!pool.is_all_rate_limited(Provider::Antigravity, "m"));
    pool.mark_rate_limited("a@x.y", now_ms() + 60_000, "m");
    assert!(!pool.is_all_rate_limited(Provider::Antigravity, "m"));
    pool.mark_rate_limited("b@x.y", now_ms() + 30_000, "m");
    assert!(pool.is_all_rate_limited(Provider::Antigravity, "m"));
    assert!(!pool.is_all_rate_limited(Provider::Antigravity, ""));
    assert!(!pool.is_all_rate_limited(Provider::Zai, "m"));
}

#[test]
fn min_wait_is_smallest_reset_clamped_to_zero() {
    let (_dir, pool) = test_pool(vec![
        oauth_account("a@x.y", Provider::Antigravity),
        oauth_account("b@x.y", Provider::Antigravity),
    ]);

    pool.mark_rate_limited("a@x.y", now_ms() + 90_000, "m");
    pool.mark_rate_limited("b@x.y", now_ms() + 30_000, "m");

    let wait = pool.get_min_wait_ms(Provider::Antigravity, "m");
    assert!(wait > 0 && wait <= 30_000, "wait was {}", wait);

    // No active limits: fall back to the configured cooldown.
    pool.reset_all_rate_limits(Some(Provider::Antigravity));
    assert_eq!(pool.get_min_wait_ms(Provider::Antigravity, "m"), 10_000);
}

#[test]
fn mark_rate_limited_zero_uses_default_cooldown() {
    let (_dir, pool) = test_pool(vec![oauth_account("a@x.y", Provider::Antigravity)]);
    let before = now_ms();
    pool.mark_rate_limited("a@x.y", 0, "m");
    let account = pool.get_account("a@x.y").unwrap();
    let limit = account.limit_for("m").unwrap();
    assert!(limit.reset_time >= before + 10_000);
}

#[test]
fn clear_expired_preserves_soft_limit_fields() {
    let (_dir, pool) = test_pool(vec![oauth_account("a@x.y", Provider::Antigravity)]);
    pool.update_soft_limit("a@x.y", "m", 0.1, false);
    pool.mark_rate_limited("a@x.y", now_ms() - 1, "m");

    assert_eq!(pool.clear_expired_limits(), 1);
    let account = pool.get_account("a@x.y").unwrap();
    let limit = account.limit_for("m").unwrap();
    assert!(!limit.is_rate_limited);
    assert_eq!(limit.reset_time, 0);
    assert!(limit.is_soft_limited);
    assert!((limit.quota_remaining - 0.1).abs() < f64::EPSILON);
}

#[test]
fn reset_all_preserves_soft_limit_fields() {
    let (_dir, pool) = test_pool(vec![oauth_account("a@x.y", Provider::Antigravity)]);
    pool.update_soft_limit("a@x.y", "m", 0.0, false);
    pool.mark_rate_limited("a@x.y", now_ms() + 60_000, "m");

    pool.reset_all_rate_limits(Some(Provider::Antigravity));
    let limit = pool.get_account("a@x.y").unwrap().limit_for("m").cloned().unwrap();
    assert!(!limit.is_rate_limited);
    assert!(limit.is_soft_limited);
    assert_eq!(limit.quota_remaining, 0.0);
}

#[test]
fn update_soft_limit_clamps_degenerate_inputs() {
    let (_dir, pool) = test_pool(vec![oauth_account("a@x.y", Provider::Antigravity)]);

    pool.update_soft_limit("a@x.y", "m", f64::NAN, false);
    let limit = pool.get_account("a@x.y").unwrap().limit_for("m").cloned().unwrap();
    assert_eq!(limit.quota_remaining, 0.0);
    assert!(limit.is_soft_limited);

    pool.update_soft_limit("a@x.y", "m", f64::INFINITY, false);
    let limit = pool.get_account("a@x.y").unwrap().limit_for("m").cloned().unwrap();
    assert_eq!(limit.quota_remaining, 1.0);
    assert!(!limit.is_soft_limited);

    pool.update_soft_limit("a@x.y", "m", -3.5, false);
    let limit = pool.get_account("a@x.y").unwrap().limit_for("m").cloned().unwrap();
    assert_eq!(limit.quota_remaining, 0.0);
    assert!(limit.is_soft_limited);
}

#[test]
fn deep_copied_reads_do_not_alias_internal_state() {
    let (_dir, pool) = test_pool(vec![oauth_account("a@x.y", Provider::Antigravity)]);
    pool.mark_rate_limited("a@x.y", now_ms() + 60_000, "m");

    let mut copy = pool.get_account("a@x.y").unwrap();
    copy.limit_mut("m").is_rate_limited = false;
    copy.model_rate_limits.clear();

    let fresh = pool.get_account("a@x.y").unwrap();
    assert!(fresh.limit_for("m").unwrap().is_rate_limited);
}

#[test]
fn add_rejects_duplicates_and_remove_shifts_cursors() {
    let (_dir, pool) = test_pool(vec![
        oauth_account("a@x.y", Provider::Antigravity),
        oauth_account("b@x.y", Provider::Antigravity),
        oauth_account("c@x.y", Provider::Antigravity),
    ]);

    let duplicate = oauth_account("A@X.Y", Provider::Antigravity);
    assert!(matches!(
        pool.add_account(duplicate),
        Err(multiclaude_types::AccountError::Duplicate { .. })
    ));

    // Advance the cursor to slot 2 ("c"), then remove slot 1.
    pool.pick_next(Provider::Antigravity, "m");
    pool.pick_next(Provider::Antigravity, "m");
    pool.remove_account("b@x.y").unwrap();

    // Cursor still resolves to a real antigravity account.
    let next = pool.pick_next(Provider::Antigravity, "m").unwrap();
    assert!(next.email == "a@x.y" || next.email == "c@x.y");
    assert!(matches!(
        pool.remove_account("missing@x.y"),
        Err(multiclaude_types::AccountError::NotFound { .. })
    ));
}

#[test]
fn pick_next_returns_none_when_everything_limited() {
    let (_dir, pool) = test_pool(vec![oauth_account("a@x.y", Provider::Antigravity)]);
    pool.mark_rate_limited("a@x.y", now_ms() + 60_000, "m");
    assert!(pool.pick_next(Provider::Antigravity, "m").is_none());
}
