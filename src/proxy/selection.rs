use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::models::Account;
use crate::modules::persistence::AccountStore;
use crate::proxy::concurrency::{account_slot_key, calculate_max_wait, ConcurrencyArbiter, SlotGuard};
use crate::proxy::cooldown::ChallengeCooldownRegistry;

#[derive(Debug, Clone)]
pub struct WaitPlan {
    pub max_concurrency: i32,
    pub max_waiting: i64,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct Selection {
    pub account: Account,
    pub acquired: bool,
    pub guard: Option<SlotGuard>,
    pub wait_plan: Option<WaitPlan>,
}

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no account available for the requested model")]
    AccountUnavailable,
    #[error(transparent)]
    Infra(#[from] crate::proxy::concurrency::SlotStoreError),
}

// Chooses the account that serves a request: model-capability filter,
// sticky preference, load-aware ranking with a round-robin tiebreak, and a
// fast slot grab when possible.
pub struct AccountSelector {
    store: Arc<AccountStore>,
    arbiter: Arc<ConcurrencyArbiter>,
    cooldowns: Arc<ChallengeCooldownRegistry>,
    // (group, session_hash) -> account_id
    sticky: DashMap<String, i64>,
    rr_cursor: AtomicUsize,
    wait_timeout: Duration,
}

fn sticky_key(group_id: Option<i64>, session_hash: &str) -> String {
    format!("{}:{}", group_id.unwrap_or(0), session_hash)
}

impl AccountSelector {
    pub fn new(
        store: Arc<AccountStore>,
        arbiter: Arc<ConcurrencyArbiter>,
        cooldowns: Arc<ChallengeCooldownRegistry>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            store,
            arbiter,
            cooldowns,
            sticky: DashMap::new(),
            rr_cursor: AtomicUsize::new(0),
            wait_timeout,
        }
    }

    // Idempotent: re-binding the same account is a no-op.
    pub fn bind_sticky_session(&self, group_id: Option<i64>, session_hash: &str, account_id: i64) {
        self.sticky
            .insert(sticky_key(group_id, session_hash), account_id);
    }

    pub fn sticky_binding(&self, group_id: Option<i64>, session_hash: &str) -> Option<i64> {
        self.sticky
            .get(&sticky_key(group_id, session_hash))
            .map(|v| *v)
    }

    pub fn select(
        &self,
        group_id: Option<i64>,
        session_hash: &str,
        requested_model: &str,
        excluded: &HashSet<i64>,
    ) -> Result<Selection, SelectError> {
        let pool: Vec<Account> = self
            .store
            .accounts_for_group(group_id)
            .into_iter()
            .filter(|a| a.supports_model(requested_model))
            .filter(|a| !excluded.contains(&a.id))
            .filter(|a| !self.cooldowns.is_active(a.id, a.proxy_url()))
            .collect();

        if pool.is_empty() {
            return Err(SelectError::AccountUnavailable);
        }

        // A sticky binding wins when its account is still eligible.
        if let Some(bound_id) = self.sticky_binding(group_id, session_hash) {
            if let Some(bound) = pool.iter().find(|a| a.id == bound_id) {
                debug!(
                    "sticky_session_hit session={} account_id={}",
                    session_hash, bound_id
                );
                return self.try_account(group_id, session_hash, bound.clone());
            }
            // Bound account fell out of the pool; drop the binding.
            self.sticky.remove(&sticky_key(group_id, session_hash));
        }

        // Rank by current slot load, break ties round-robin so equally idle
        // accounts share traffic.
        let pool_len = pool.len();
        let mut ranked: Vec<(i64, usize, Account)> = Vec::with_capacity(pool_len);
        let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
        for (idx, account) in pool.into_iter().enumerate() {
            let load = self.arbiter.current_load(&account_slot_key(account.id))?;
            let tiebreak = (idx + pool_len - cursor % pool_len) % pool_len;
            ranked.push((load, tiebreak, account));
        }
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        for (_, _, account) in &ranked {
            if let Some(guard) = self
                .arbiter
                .try_acquire_slot(&account_slot_key(account.id), account.effective_concurrency())?
            {
                self.bind_sticky_session(group_id, session_hash, account.id);
                return Ok(Selection {
                    account: account.clone(),
                    acquired: true,
                    guard: Some(guard),
                    wait_plan: None,
                });
            }
        }

        // Everything is saturated: hand back the best candidate with a wait
        // plan and let the orchestrator queue on it.
        let (_, _, account) = ranked.into_iter().next().expect("ranked pool is non-empty");
        Ok(self.unacquired(account))
    }

    fn try_account(
        &self,
        group_id: Option<i64>,
        session_hash: &str,
        account: Account,
    ) -> Result<Selection, SelectError> {
        if let Some(guard) = self
            .arbiter
            .try_acquire_slot(&account_slot_key(account.id), account.effective_concurrency())?
        {
            self.bind_sticky_session(group_id, session_hash, account.id);
            return Ok(Selection {
                account,
                acquired: true,
                guard: Some(guard),
                wait_plan: None,
            });
        }
        Ok(self.unacquired(account))
    }

    fn unacquired(&self, account: Account) -> Selection {
        let effective = account.effective_concurrency();
        let wait_plan = WaitPlan {
            max_concurrency: effective,
            max_waiting: calculate_max_wait(effective),
            timeout: self.wait_timeout,
        };
        Selection {
            account,
            acquired: false,
            guard: None,
            wait_plan: Some(wait_plan),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use crate::proxy::concurrency::InMemorySlotStore;
    use reqwest::header::HeaderMap;
    use serde_json::Map;

    fn account(id: i64, models: &[&str], concurrency: i32) -> Account {
        Account {
            id,
            uuid: format!("acct-{}", id),
            name: format!("acc{}", id),
            platform: Platform::Openai,
            group_id: None,
            proxy: None,
            credentials: Map::new(),
            models: models.iter().map(|m| m.to_string()).collect(),
            rate_multiplier: 1.0,
            concurrency,
            enabled: true,
            sora: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn selector_with(accounts: Vec<Account>) -> (tempfile::TempDir, AccountSelector) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(AccountStore::new(dir.path()).expect("store"));
        for acc in accounts {
            store.insert(acc).expect("insert");
        }
        let arbiter = Arc::new(ConcurrencyArbiter::new(
            Arc::new(InMemorySlotStore::new()),
            Duration::from_secs(15),
        ));
        let cooldowns = Arc::new(ChallengeCooldownRegistry::new());
        let selector = AccountSelector::new(store, arbiter, cooldowns, Duration::from_secs(30));
        (dir, selector)
    }

    #[test]
    fn filters_by_model_capability() {
        let (_dir, selector) = selector_with(vec![
            account(1, &["gpt-4o"], 2),
            account(2, &["gpt-5.2"], 2),
        ]);
        let selection = selector
            .select(None, "sid-a", "gpt-5.2", &HashSet::new())
            .expect("selection");
        assert_eq!(selection.account.id, 2);
        assert!(selection.acquired);
    }

    #[test]
    fn empty_pool_is_account_unavailable() {
        let (_dir, selector) = selector_with(vec![account(1, &["gpt-4o"], 2)]);
        let err = selector
            .select(None, "sid-a", "gpt-5.2", &HashSet::new())
            .expect_err("no capable account");
        assert!(matches!(err, SelectError::AccountUnavailable));
    }

    #[test]
    fn excluded_accounts_are_skipped() {
        let (_dir, selector) = selector_with(vec![account(1, &[], 2), account(2, &[], 2)]);
        let excluded: HashSet<i64> = [1].into_iter().collect();
        let selection = selector
            .select(None, "sid-a", "gpt-5.2", &excluded)
            .expect("selection");
        assert_eq!(selection.account.id, 2);
    }

    #[test]
    fn sticky_binding_is_preferred_when_eligible() {
        let (_dir, selector) = selector_with(vec![
            account(1, &[], 4),
            account(2, &[], 4),
            account(3, &[], 4),
        ]);
        selector.bind_sticky_session(None, "sid-s", 3);
        for _ in 0..3 {
            let selection = selector
                .select(None, "sid-s", "gpt-5.2", &HashSet::new())
                .expect("selection");
            assert_eq!(selection.account.id, 3);
        }
    }

    #[test]
    fn sticky_binding_to_excluded_account_is_overridden() {
        let (_dir, selector) = selector_with(vec![account(1, &[], 4), account(2, &[], 4)]);
        selector.bind_sticky_session(None, "sid-s", 1);
        let excluded: HashSet<i64> = [1].into_iter().collect();
        let selection = selector
            .select(None, "sid-s", "gpt-5.2", &excluded)
            .expect("selection");
        assert_eq!(selection.account.id, 2);
        // The dead binding was replaced by the new acquisition.
        assert_eq!(selector.sticky_binding(None, "sid-s"), Some(2));
    }

    #[test]
    fn lower_load_wins_the_ranking() {
        let (_dir, selector) = selector_with(vec![account(1, &[], 4), account(2, &[], 4)]);
        // Two held slots on account 1.
        let arb = &selector.arbiter;
        let _g1 = arb.try_acquire_slot(&account_slot_key(1), 4).unwrap().unwrap();
        let _g2 = arb.try_acquire_slot(&account_slot_key(1), 4).unwrap().unwrap();

        let selection = selector
            .select(None, "sid-x", "gpt-5.2", &HashSet::new())
            .expect("selection");
        assert_eq!(selection.account.id, 2);
    }

    #[test]
    fn saturated_pool_returns_wait_plan_for_top_candidate() {
        let (_dir, selector) = selector_with(vec![account(1, &[], 1)]);
        let arb = &selector.arbiter;
        let _held = arb.try_acquire_slot(&account_slot_key(1), 1).unwrap().unwrap();

        let selection = selector
            .select(None, "sid-w", "gpt-5.2", &HashSet::new())
            .expect("selection");
        assert!(!selection.acquired);
        assert!(selection.guard.is_none());
        let plan = selection.wait_plan.expect("wait plan");
        assert_eq!(plan.max_concurrency, 1);
        assert_eq!(plan.max_waiting, calculate_max_wait(1));
        assert_eq!(plan.timeout, Duration::from_secs(30));
    }

    #[test]
    fn rate_multiplier_shrinks_the_effective_cap() {
        let mut acc = account(1, &[], 4);
        acc.rate_multiplier = 0.25;
        let (_dir, selector) = selector_with(vec![acc]);

        let first = selector
            .select(None, "sid-m1", "gpt-5.2", &HashSet::new())
            .expect("selection");
        assert!(first.acquired);

        // The scaled cap of one is already saturated.
        let second = selector
            .select(None, "sid-m2", "gpt-5.2", &HashSet::new())
            .expect("selection");
        assert!(!second.acquired);
        assert_eq!(second.wait_plan.expect("plan").max_concurrency, 1);
    }

    #[test]
    fn cooldown_active_accounts_are_excluded() {
        let (_dir, selector) = selector_with(vec![account(1, &[], 2), account(2, &[], 2)]);
        let headers = HeaderMap::new();
        selector.cooldowns.record(1, "", 900, 403, &headers, b"");

        let selection = selector
            .select(None, "sid-c", "gpt-5.2", &HashSet::new())
            .expect("selection");
        assert_eq!(selection.account.id, 2);
    }

    #[test]
    fn successful_acquisition_creates_sticky_binding() {
        let (_dir, selector) = selector_with(vec![account(1, &[], 2)]);
        assert_eq!(selector.sticky_binding(None, "sid-n"), None);
        let selection = selector
            .select(None, "sid-n", "gpt-5.2", &HashSet::new())
            .expect("selection");
        assert!(selection.acquired);
        assert_eq!(selector.sticky_binding(None, "sid-n"), Some(1));
    }
}
