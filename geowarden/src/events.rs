// geowarden/src/events.rs
//
// Shared domain types flowing through geowarden.
//
//   PolicyRequest — attribute map assembled from one policy delegation exchange
//   CountryCode   — ISO 3166 alpha-2 code or the "--" unknown sentinel
//   Verdict       — Pass / WarnAdded / WarnBlocking / Reject
//   LoginEvent    — one mailbox or webmail login scraped from a log file
//
// Verdict messages are grepped for by operators; keep the wording stable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PolicyError;

pub const UNKNOWN_COUNTRY: &str = "--";

// ── Policy request ────────────────────────────────────────────────────────────

/// Attributes of one request, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyRequest {
    attributes: Vec<(String, String)>,
}

impl PolicyRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later occurrences of a key overwrite earlier ones in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn client_address(&self) -> &str {
        self.get("client_address").unwrap_or_default()
    }

    pub fn sasl_username(&self) -> &str {
        self.get("sasl_username").unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

// ── Country code ──────────────────────────────────────────────────────────────

/// 2-letter country code, or the unknown sentinel used whenever an address
/// cannot be resolved. The sentinel takes part in set membership like any
/// real code, so all unresolvable addresses share one pseudo-country.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CountryCode {
    Iso([u8; 2]),
    Unknown,
}

impl CountryCode {
    pub fn as_str(&self) -> &str {
        match self {
            // only ASCII uppercase letters are ever stored
            Self::Iso(bytes) => std::str::from_utf8(bytes).unwrap_or(UNKNOWN_COUNTRY),
            Self::Unknown => UNKNOWN_COUNTRY,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Parse, folding anything invalid into the sentinel.
    pub fn parse_lossy(s: &str) -> Self {
        s.parse().unwrap_or(Self::Unknown)
    }
}

impl FromStr for CountryCode {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == UNKNOWN_COUNTRY || s.eq_ignore_ascii_case("unknown") {
            return Ok(Self::Unknown);
        }

        let bytes = s.as_bytes();
        if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(PolicyError::InvalidCountryCode(s.to_string()));
        }

        Ok(Self::Iso([
            bytes[0].to_ascii_uppercase(),
            bytes[1].to_ascii_uppercase(),
        ]))
    }
}

impl fmt::Debug for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CountryCode").field(&self.as_str()).finish()
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CountryCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CountryCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error as _;
        let s = String::deserialize(deserializer)?;
        CountryCode::from_str(&s).map_err(|e| D::Error::custom(e.to_string()))
    }
}

// ── Verdict ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    WarnAdded { message: String },
    WarnBlocking { message: String },
    Reject { message: String },
}

impl Verdict {
    pub fn warn_added(account: &str, country: CountryCode) -> Self {
        Self::WarnAdded {
            message: format!("{account} has moved to {country}, a whitelisted country"),
        }
    }

    pub fn warn_blocking(account: &str, country: CountryCode, block_secs: u64) -> Self {
        Self::WarnBlocking {
            message: format!(
                "{account} sending from {country} is not allowed, further attempts blocked for {block_secs}s"
            ),
        }
    }

    pub fn reject(account: &str, country: CountryCode) -> Self {
        Self::Reject {
            message: format!("{account} sending from {country} is not allowed"),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Pass => None,
            Self::WarnAdded { message }
            | Self::WarnBlocking { message }
            | Self::Reject { message } => Some(message),
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Self::WarnAdded { .. } | Self::WarnBlocking { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::WarnAdded { .. } => "warn_added",
            Self::WarnBlocking { .. } => "warn_blocking",
            Self::Reject { .. } => "reject",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ── Login event ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginSource {
    Imap,
    Pop3,
    Webmail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginEvent {
    pub source: LoginSource,
    pub user:   String,
    pub ip:     String,
}
