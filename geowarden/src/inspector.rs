// geowarden/src/inspector.rs
//
// Batch login inspector.
//
// The policy daemon only sees SMTP submissions. Mailbox (Dovecot IMAP/POP3)
// and webmail (Roundcube) logins are scraped from their logs after rotation,
// resolved to countries, and recorded per user under logged_from:{user}. Any
// country a user had not logged in from before ends up in a digest mailed to
// the postmaster, together with the user's previous login countries and the
// countries the policy daemon has accepted mail from.
//
// Run it from cron after logrotate, e.g.
//   geowarden inspect --imap-log /var/log/mail.log.1 \
//                     --webmail-log /var/log/roundcube/userlogins.log.1

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{PolicyError, Result};
use crate::events::{CountryCode, LoginEvent, LoginSource};
use crate::geoip::{CachedResolver, CountryResolver};
use crate::mailer::Mailer;
use crate::notify::SUBJECT_TAG;
use crate::state::{AccountHistory, HistoryStore};

const DOVECOT_LOGIN: &str =
    r"(?P<proto>imap|pop3)-login: Login: user=<(?P<user>\S+)>, .*rip=(?P<ip>\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})";

// Roundcube writes these only with $config['log_logins'] = true
const ROUNDCUBE_LOGIN: &str =
    r"Successful login for (?P<user>\S+) .* from (?P<ip>\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}) in session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Dovecot,
    Roundcube,
}

// ── Line parsing ──────────────────────────────────────────────────────────────

pub struct LoginPatterns {
    dovecot:   Regex,
    roundcube: Regex,
}

impl LoginPatterns {
    pub fn new() -> Result<Self> {
        let compile = |p: &str| Regex::new(p).map_err(|e| PolicyError::Config(e.to_string()));
        Ok(Self { dovecot: compile(DOVECOT_LOGIN)?, roundcube: compile(ROUNDCUBE_LOGIN)? })
    }

    pub fn parse(&self, line: &str, format: LogFormat) -> Option<LoginEvent> {
        match format {
            LogFormat::Dovecot => {
                let caps = self.dovecot.captures(line)?;
                let source = if &caps["proto"] == "pop3" { LoginSource::Pop3 } else { LoginSource::Imap };
                Some(LoginEvent { source, user: caps["user"].to_string(), ip: caps["ip"].to_string() })
            }
            LogFormat::Roundcube => {
                let caps = self.roundcube.captures(line)?;
                Some(LoginEvent {
                    source: LoginSource::Webmail,
                    user:   caps["user"].to_string(),
                    ip:     caps["ip"].to_string(),
                })
            }
        }
    }
}

/// Log bytes as text: UTF-8 when valid, ISO-8859-1 otherwise. BOMs are dropped.
pub fn decode_log(bytes: Vec<u8>) -> String {
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        // every byte is a Latin-1 code point
        Err(err) => err.into_bytes().iter().map(|&b| b as char).collect(),
    };
    if text.contains('\u{feff}') { text.replace('\u{feff}', "") } else { text }
}

// ── Report ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NewLogins {
    pub new:       Vec<CountryCode>,
    pub previous:  BTreeSet<CountryCode>,
    pub sent_from: BTreeSet<CountryCode>,
}

#[derive(Debug, Default)]
pub struct Report {
    pub hostname: String,
    pub logins:   BTreeMap<String, NewLogins>,
    pub errors:   Vec<String>,
}

impl Report {
    pub fn should_send(&self) -> bool {
        !self.logins.is_empty() || !self.errors.is_empty()
    }

    pub fn subject(&self) -> String {
        format!("{SUBJECT_TAG} Users logged in from new countries on {}", self.hostname)
    }

    pub fn body(&self) -> String {
        let mut body = String::new();
        for error in &self.errors {
            body.push_str(&format!("ERROR: {error}\n\n"));
        }
        body.push_str(&format!(
            "{} users logged in from new countries on host {}:\n\n",
            self.logins.len(),
            self.hostname
        ));
        for (user, seen) in &self.logins {
            body.push_str(&format!(
                "{user} new login from: {} (previous logins: {}, sent from: {})\n",
                join(seen.new.iter()),
                join(seen.previous.iter()),
                join(seen.sent_from.iter()),
            ));
        }
        body
    }
}

fn join<'a>(codes: impl Iterator<Item = &'a CountryCode>) -> String {
    codes.map(CountryCode::as_str).collect::<Vec<_>>().join(", ")
}

// ── Inspector ─────────────────────────────────────────────────────────────────

pub struct Inspector<S, R> {
    history:   AccountHistory<S>,
    resolver:  CachedResolver<R>,
    whitelist: HashSet<CountryCode>,
    patterns:  LoginPatterns,
    report:    Report,
}

impl<S: HistoryStore, R: CountryResolver> Inspector<S, R> {
    pub fn new(
        history: AccountHistory<S>,
        resolver: R,
        whitelist: HashSet<CountryCode>,
        hostname: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            history,
            resolver: CachedResolver::new(resolver),
            whitelist,
            patterns: LoginPatterns::new()?,
            report: Report { hostname: hostname.into(), ..Report::default() },
        })
    }

    /// Scan both logs. Failures are collected into the report rather than
    /// returned, so one unreadable log does not hide the other.
    pub async fn run(mut self, imap_log: &Path, webmail_log: &Path) -> Report {
        for (path, format) in [(imap_log, LogFormat::Dovecot), (webmail_log, LogFormat::Roundcube)] {
            if let Err(err) = self.scan_file(path, format).await {
                warn!("inspect {}: {err}", path.display());
                self.report.errors.push(format!("{}: {err}", path.display()));
            }
        }
        info!(
            users = self.report.logins.len(),
            errors = self.report.errors.len(),
            addresses = self.resolver.cached(),
            "inspection finished"
        );
        self.report
    }

    pub async fn scan_file(&mut self, path: &Path, format: LogFormat) -> Result<usize> {
        let text = decode_log(tokio::fs::read(path).await?);
        let mut logins = 0;
        for line in text.lines() {
            let Some(event) = self.patterns.parse(line, format) else { continue };
            logins += 1;
            self.record(&event).await?;
        }
        debug!(logins, "scanned {}", path.display());
        Ok(logins)
    }

    pub async fn record(&mut self, event: &LoginEvent) -> Result<()> {
        if event.user.is_empty() { return Ok(()); }
        let country = self.resolver.resolve(&event.ip);
        if country.is_unknown() || self.whitelist.contains(&country) { return Ok(()); }

        if self.history.is_logged_from(&event.user, country).await? { return Ok(()); }

        debug!(client_address = %event.ip, sasl_username = %event.user, country = %country, source = ?event.source, "new login country");
        if !self.report.logins.contains_key(&event.user) {
            let seen = NewLogins {
                new:       Vec::new(),
                previous:  self.history.logged_from(&event.user).await?,
                sent_from: self.history.known_countries(&event.user).await?,
            };
            self.report.logins.insert(event.user.clone(), seen);
        }
        if let Some(seen) = self.report.logins.get_mut(&event.user) {
            if !seen.new.contains(&country) { seen.new.push(country); }
        }

        self.history.add_logged_from(&event.user, country).await?;
        Ok(())
    }
}

/// Mail the digest when there is something to say.
pub async fn deliver<M: Mailer>(report: &Report, mailer: &M) -> Result<bool> {
    if !report.should_send() { return Ok(false); }
    mailer.send(&report.subject(), &report.body()).await?;
    Ok(true)
}
