// geowarden/src/notify.rs
//
// Operator notification text.
//
// Only warnings produce mail from the decision path: WarnAdded tells the
// postmaster an account picked up a whitelisted country, WarnBlocking tells
// them an account is now inside a block window and how to lift it for good.
// Pass is silent, Reject is only logged. Store outages get their own subject
// so they cannot be mistaken for a normal warning.
//
// A warning body may end with the recent mail.log lines mentioning the client
// address. The log is read with a byte-level line splitter so rotated files
// with stray Latin-1 bytes do not abort the excerpt.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::events::{CountryCode, Verdict};
use crate::state::countries_key;

pub const SUBJECT_TAG: &str = "[geowarden]";
const EXCERPT_LINES: usize = 50;

pub struct Composer {
    hostname: String,
    mail_log: Option<PathBuf>,
}

impl Composer {
    pub fn new(hostname: impl Into<String>, mail_log: Option<PathBuf>) -> Self {
        Self { hostname: hostname.into(), mail_log }
    }

    /// Subject and body for a warning verdict; None for Pass and Reject.
    pub async fn compose(
        &self,
        verdict: &Verdict,
        account: &str,
        ip: &str,
        country: CountryCode,
    ) -> Option<(String, String)> {
        let host = &self.hostname;
        let (subject, mut body) = match verdict {
            Verdict::WarnAdded { message } => (
                format!("{SUBJECT_TAG} {account} added {country} on {host}"),
                format!("{message}\n\nclient_address: {ip}\n"),
            ),
            Verdict::WarnBlocking { message } => {
                let key = countries_key(account);
                (
                    format!("{SUBJECT_TAG} {account} blocking {country} on {host}"),
                    format!(
                        "{message}\n\n\
                         client_address: {ip}\n\n\
                         If this is a legitimate login, allow {country} permanently with:\n\n\
                         \x20   redis-cli SADD {key} {country}\n\n\
                         Countries currently allowed for {account}:\n\n\
                         \x20   redis-cli SMEMBERS {key}\n"
                    ),
                )
            }
            Verdict::Pass | Verdict::Reject { .. } => return None,
        };

        body.push_str(&format!("\nDate: {}\n", Local::now().to_rfc2822()));
        if let Some(excerpt) = self.mail_log_excerpt(ip).await {
            body.push('\n');
            body.push_str(&excerpt);
        }
        Some((subject, body))
    }

    pub fn compose_store_failure(&self, account: &str, ip: &str, error: &str) -> (String, String) {
        let subject = format!("{SUBJECT_TAG} STORE FAILURE on {}", self.hostname);
        let body = format!(
            "The history store could not be reached while deciding for {account} ({ip}):\n\n\
             \x20   {error}\n\n\
             Decisions fall back to the configured failure policy until it recovers.\n\n\
             Date: {}\n",
            Local::now().to_rfc2822()
        );
        (subject, body)
    }

    /// Recent lines of the mail log that mention `ip`.
    pub async fn mail_log_excerpt(&self, ip: &str) -> Option<String> {
        let ip = ip.trim();
        if ip.is_empty() { return None; }
        let path = self.mail_log.as_deref()?;

        let lines = match grep_lines(path, ip).await {
            Ok(lines) => lines,
            Err(err) => {
                debug!("mail log excerpt skipped for {}: {err}", path.display());
                return None;
            }
        };
        if lines.is_empty() { return None; }

        let mut excerpt = format!("Grep of {ip} in {}:\n\n", path.display());
        for line in lines {
            excerpt.push_str(&line);
            excerpt.push('\n');
        }
        Some(excerpt)
    }
}

async fn grep_lines(path: &Path, needle: &str) -> std::io::Result<VecDeque<String>> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    let mut matches = VecDeque::with_capacity(EXCERPT_LINES);

    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw).await? == 0 { break; }
        let line = String::from_utf8_lossy(&raw);
        if !line.contains(needle) { continue; }
        if matches.len() == EXCERPT_LINES { matches.pop_front(); }
        matches.push_back(line.trim_end().to_string());
    }
    Ok(matches)
}
