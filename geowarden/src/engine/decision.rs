// geowarden/src/engine/decision.rs
//
// Per-account country decision.
//
// Trust on first use per country, with two refinements:
//   - whitelisted countries are enrolled on sight (WarnAdded)
//   - any other new country opens a block window: the first attempt inside
//     the window is only flagged (WarnBlocking), every further attempt while
//     the window is live is rejected and pushes the window out again
//
//   account empty                 → Pass        (no store access)
//   country ∈ countries:{account} → Pass        (read only)
//   country ∈ whitelist           → WarnAdded   (SADD countries:{account}),
//                                   Pass if the SADD found it already there
//   justblock:{account} absent    → WarnBlocking (arm justblock:{account})
//   justblock:{account} live      → Reject      (refresh justblock:{account})
//
// New accounts get no special treatment; their first country goes through the
// same whitelist/block path as any other.
//
// Arming and refreshing the marker is one atomic store call, so two racing
// attempts for the same account cannot both come back WarnBlocking.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::error;

use crate::config::{FailurePolicy, PolicyConfig};
use crate::error::{PolicyError, Result};
use crate::events::{CountryCode, Verdict};
use crate::state::{AccountHistory, BlockArm, HistoryStore};

pub const STORE_FAILURE_MESSAGE: &str = "policy store unavailable";

pub struct DecisionEngine<S> {
    history:        AccountHistory<S>,
    whitelist:      HashSet<CountryCode>,
    block_time:     Duration,
    failure_policy: FailurePolicy,
    pub counters:   Counters,
}

impl<S: HistoryStore> DecisionEngine<S> {
    pub fn new(history: AccountHistory<S>, config: &PolicyConfig) -> Self {
        Self {
            history,
            whitelist:      config.whitelist_set(),
            block_time:     Duration::from_secs(config.block_time_secs),
            failure_policy: config.failure_policy,
            counters:       Counters::default(),
        }
    }

    pub fn history(&self) -> &AccountHistory<S> {
        &self.history
    }

    /// Decide, applying the failure policy when the store cannot be reached.
    pub async fn decide(&self, account: &str, ip: &str, country: CountryCode) -> Verdict {
        match self.try_decide(account, ip, country).await {
            Ok(verdict) => verdict,
            Err(err) => self.on_store_failure(account, &err),
        }
    }

    /// Decide, surfacing store failures to the caller.
    pub async fn try_decide(&self, account: &str, _ip: &str, country: CountryCode) -> Result<Verdict> {
        let verdict = self.evaluate(account, country).await?;
        self.counters.record(&verdict);
        Ok(verdict)
    }

    async fn evaluate(&self, account: &str, country: CountryCode) -> Result<Verdict> {
        if account.is_empty() {
            return Ok(Verdict::Pass);
        }

        if self.history.is_known(account, country).await? {
            return Ok(Verdict::Pass);
        }

        if self.whitelist.contains(&country) {
            // a whitelisted sentinel lets unresolvable addresses through,
            // but "--" is never written into an account's history
            if country.is_unknown() {
                return Ok(Verdict::Pass);
            }
            // a racing request enrolled it between our read and this write
            if !self.history.add_known(account, country).await? {
                return Ok(Verdict::Pass);
            }
            return Ok(Verdict::warn_added(account, country));
        }

        match self.history.arm_block(account, country, self.block_time).await? {
            BlockArm::Armed => Ok(Verdict::warn_blocking(account, country, self.block_time.as_secs())),
            BlockArm::Refreshed => Ok(Verdict::reject(account, country)),
        }
    }

    /// Verdict used in place of a decision the store could not back.
    pub fn on_store_failure(&self, account: &str, err: &PolicyError) -> Verdict {
        self.counters.store_failures.fetch_add(1, Ordering::Relaxed);
        error!(sasl_username = account, policy = ?self.failure_policy, "decision failed: {err}");
        let verdict = match self.failure_policy {
            FailurePolicy::Open => Verdict::Pass,
            FailurePolicy::Closed => Verdict::Reject { message: STORE_FAILURE_MESSAGE.to_string() },
        };
        self.counters.record(&verdict);
        verdict
    }
}

// ── Counters ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Counters {
    pub pass:           AtomicU64,
    pub warn_added:     AtomicU64,
    pub warn_blocking:  AtomicU64,
    pub reject:         AtomicU64,
    pub store_failures: AtomicU64,
    pub connections:    AtomicU64,
}

impl Counters {
    fn record(&self, verdict: &Verdict) {
        let counter = match verdict {
            Verdict::Pass => &self.pass,
            Verdict::WarnAdded { .. } => &self.warn_added,
            Verdict::WarnBlocking { .. } => &self.warn_blocking,
            Verdict::Reject { .. } => &self.reject,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            pass:           self.pass.load(Ordering::Relaxed),
            warn_added:     self.warn_added.load(Ordering::Relaxed),
            warn_blocking:  self.warn_blocking.load(Ordering::Relaxed),
            reject:         self.reject.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            connections:    self.connections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub pass:           u64,
    pub warn_added:     u64,
    pub warn_blocking:  u64,
    pub reject:         u64,
    pub store_failures: u64,
    pub connections:    u64,
}

impl CounterSnapshot {
    pub fn decisions(&self) -> u64 {
        self.pass + self.warn_added + self.warn_blocking + self.reject
    }
}
