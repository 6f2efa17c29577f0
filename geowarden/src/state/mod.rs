// geowarden/src/state/mod.rs
//
// Per-account geographic history held in a shared set/key store.
//
// Key layout (shared with operator tooling and the batch inspector, do not
// rename):
//   countries:{account}    — SET of country codes accepted for the account
//   justblock:{account}    — country code of the first blocked attempt, EX block_time
//   logged_from:{account}  — SET of countries seen in IMAP/POP3/webmail logins
//
// HistoryStore is the raw primitive surface a backend has to provide.
// AccountHistory layers key naming and per-call timeouts on top of it and is
// what the decision engine and the inspector talk to.

pub mod memory;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PolicyError, Result};
use crate::events::CountryCode;

pub const COUNTRIES_PREFIX:   &str = "countries:";
pub const BLOCK_PREFIX:       &str = "justblock:";
pub const LOGGED_FROM_PREFIX: &str = "logged_from:";

pub fn countries_key(account: &str) -> String {
    format!("{COUNTRIES_PREFIX}{account}")
}

pub fn block_key(account: &str) -> String {
    format!("{BLOCK_PREFIX}{account}")
}

pub fn logged_from_key(account: &str) -> String {
    format!("{LOGGED_FROM_PREFIX}{account}")
}

/// Outcome of arming a block marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockArm {
    /// No marker was live; a fresh one now runs for the full window.
    Armed,
    /// A marker was already live; its TTL was reset to the full window.
    Refreshed,
}

// ── Store primitives ──────────────────────────────────────────────────────────

pub trait HistoryStore: Send + Sync + 'static {
    /// SISMEMBER
    fn contains(&self, key: &str, member: &str) -> impl Future<Output = Result<bool>> + Send;

    /// SADD; true when the member was not present before.
    fn add(&self, key: &str, member: &str) -> impl Future<Output = Result<bool>> + Send;

    /// SMEMBERS
    fn members(&self, key: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Atomically set `key = value` with `ttl` if absent, otherwise reset the
    /// TTL of the live key. Must be a single step from the point of view of
    /// concurrent callers, or two racing attempts could both see `Armed`.
    fn arm(&self, key: &str, value: &str, ttl: Duration)
        -> impl Future<Output = Result<BlockArm>> + Send;

    /// All keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>>> + Send;
}

// ── Account-level view ────────────────────────────────────────────────────────

pub struct AccountHistory<S> {
    store:   Arc<S>,
    timeout: Duration,
}

impl<S> Clone for AccountHistory<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), timeout: self.timeout }
    }
}

impl<S: HistoryStore> AccountHistory<S> {
    pub fn new(store: Arc<S>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| PolicyError::StoreTimeout(self.timeout))?
    }

    /// Membership test for any code, the sentinel included: the engine never
    /// enrols "--" itself, but an operator may.
    pub async fn is_known(&self, account: &str, country: CountryCode) -> Result<bool> {
        self.bounded(self.store.contains(&countries_key(account), country.as_str())).await
    }

    pub async fn add_known(&self, account: &str, country: CountryCode) -> Result<bool> {
        if country.is_unknown() { return Ok(false); }
        self.bounded(self.store.add(&countries_key(account), country.as_str())).await
    }

    pub async fn known_countries(&self, account: &str) -> Result<BTreeSet<CountryCode>> {
        let raw = self.bounded(self.store.members(&countries_key(account))).await?;
        Ok(parse_members(raw))
    }

    pub async fn arm_block(&self, account: &str, country: CountryCode, ttl: Duration) -> Result<BlockArm> {
        self.bounded(self.store.arm(&block_key(account), country.as_str(), ttl)).await
    }

    pub async fn logged_from(&self, account: &str) -> Result<BTreeSet<CountryCode>> {
        let raw = self.bounded(self.store.members(&logged_from_key(account))).await?;
        Ok(parse_members(raw))
    }

    pub async fn is_logged_from(&self, account: &str, country: CountryCode) -> Result<bool> {
        self.bounded(self.store.contains(&logged_from_key(account), country.as_str())).await
    }

    pub async fn add_logged_from(&self, account: &str, country: CountryCode) -> Result<bool> {
        self.bounded(self.store.add(&logged_from_key(account), country.as_str())).await
    }

    /// Accounts that have a known-country set, sorted.
    pub async fn accounts(&self) -> Result<Vec<String>> {
        let mut accounts: Vec<String> = self
            .bounded(self.store.keys(COUNTRIES_PREFIX))
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(COUNTRIES_PREFIX).map(str::to_string))
            .collect();
        accounts.sort();
        Ok(accounts)
    }
}

fn parse_members(raw: Vec<String>) -> BTreeSet<CountryCode> {
    raw.iter().filter_map(|m| m.parse().ok()).collect()
}
