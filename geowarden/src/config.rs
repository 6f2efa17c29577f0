// geowarden/src/config.rs
//
// Runtime configuration. Every struct has an explicit Default so a bare
// `geowarden serve` behaves like the reference deployment; a JSON file given
// with --config replaces the defaults and CLI flags override single options.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, Result};
use crate::events::CountryCode;

// ── Failure policy ────────────────────────────────────────────────────────────

/// Verdict produced when the history store cannot be reached.
///
/// `Open` keeps mail flowing during a store outage at the cost of letting a
/// stolen credential through unchecked; `Closed` rejects every authenticated
/// submission until the store is back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Open,
    Closed,
}

// ── Store ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub url:        String,   // redis://127.0.0.1:6379
    pub timeout_ms: u64,      // bound on every store round trip
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url:        "redis://127.0.0.1:6379".to_string(),
            timeout_ms: 2_000,
        }
    }
}

// ── Notifications ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifyConfig {
    pub enabled:    bool,
    pub smtp_host:  String,
    pub smtp_port:  u16,
    pub postmaster: String,
    pub hostname:   String,
    pub queue_size: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled:    true,
            smtp_host:  "localhost".to_string(),
            smtp_port:  25,
            postmaster: "postmaster@localhost".to_string(),
            hostname:   "localhost".to_string(),
            queue_size: 1_024,
        }
    }
}

// ── Top level ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub whitelist:           Vec<CountryCode>,
    pub block_time_secs:     u64,
    pub failure_policy:      FailurePolicy,
    pub geoip_db:            PathBuf,
    pub mail_log:            PathBuf,
    pub imap_log:            PathBuf,
    pub webmail_log:         PathBuf,
    pub stats_interval_secs: u64,
    pub store:               StoreConfig,
    pub notify:              NotifyConfig,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            whitelist:           vec![CountryCode::Iso(*b"ES")],
            block_time_secs:     60,
            failure_policy:      FailurePolicy::Open,
            geoip_db:            PathBuf::from("/var/lib/GeoIP/GeoLite2-Country.mmdb"),
            mail_log:            PathBuf::from("/var/log/mail.log"),
            imap_log:            PathBuf::from("/var/log/mail.log.1"),
            webmail_log:         PathBuf::from("/var/log/roundcube/userlogins.log.1"),
            stats_interval_secs: 300,
            store:               StoreConfig::default(),
            notify:              NotifyConfig::default(),
        }
    }
}

impl PolicyConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| PolicyError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_time_secs == 0 {
            return Err(PolicyError::Config("block_time_secs must be at least 1".into()));
        }
        if self.store.timeout_ms == 0 {
            return Err(PolicyError::Config("store.timeout_ms must be at least 1".into()));
        }
        if self.notify.queue_size == 0 {
            return Err(PolicyError::Config("notify.queue_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn whitelist_set(&self) -> HashSet<CountryCode> {
        self.whitelist.iter().copied().collect()
    }
}

/// Parse a comma separated list such as `ES,pt,--`.
pub fn parse_country_list(raw: &str) -> Result<Vec<CountryCode>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_whitelist_contains_home_country() {
        let config = PolicyConfig::default();
        assert!(config.whitelist_set().contains(&"ES".parse().unwrap()));
        assert_eq!(config.block_time_secs, 60);
        assert_eq!(config.failure_policy, FailurePolicy::Open);
    }

    #[test]
    fn file_overrides_defaults_and_keeps_the_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"whitelist": ["au", "--"], "block_time_secs": 5, "failure_policy": "closed",
                "store": {{"url": "redis://10.0.0.1/"}}}}"#
        )
        .unwrap();

        let config = PolicyConfig::from_file(file.path()).unwrap();
        assert_eq!(config.whitelist, vec![CountryCode::Iso(*b"AU"), CountryCode::Unknown]);
        assert_eq!(config.block_time_secs, 5);
        assert_eq!(config.failure_policy, FailurePolicy::Closed);
        assert_eq!(config.store.url, "redis://10.0.0.1/");
        assert_eq!(config.store.timeout_ms, 2_000);
        assert!(config.notify.enabled);
    }

    #[test]
    fn unknown_fields_and_zero_window_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"blocktime": 5}}"#).unwrap();
        assert!(PolicyConfig::from_file(file.path()).is_err());

        let config = PolicyConfig { block_time_secs: 0, ..PolicyConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn country_list_parsing() {
        let list = parse_country_list("es, PT,,--").unwrap();
        assert_eq!(list.len(), 3);
        assert!(list.contains(&CountryCode::Unknown));
        assert!(parse_country_list("ES,Spain").is_err());
    }
}
