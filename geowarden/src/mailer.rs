// geowarden/src/mailer.rs
//
// Operator mail delivery.
//
// Everything geowarden has to say to a human (warnings, store outages, the
// inspector digest) goes to the postmaster address through the local relay.
// Delivery is fire-and-forget: one attempt, failures are returned to the
// caller for logging and never retried.

use std::future::Future;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

use crate::config::NotifyConfig;
use crate::error::{PolicyError, Result};

pub trait Mailer: Send + Sync + 'static {
    fn send(&self, subject: &str, body: &str) -> impl Future<Output = Result<()>> + Send;
}

// ── SMTP relay ────────────────────────────────────────────────────────────────

pub struct LettreMailer {
    transport:  AsyncSmtpTransport<Tokio1Executor>,
    postmaster: Mailbox,
}

impl LettreMailer {
    pub fn new(config: &NotifyConfig) -> Result<Self> {
        let postmaster: Mailbox = config
            .postmaster
            .parse()
            .map_err(|e| PolicyError::Config(format!("notify.postmaster {}: {e}", config.postmaster)))?;

        // plain SMTP to the local relay, the same path any cron mail takes
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.smtp_host.as_str())
            .port(config.smtp_port)
            .build();

        Ok(Self { transport, postmaster })
    }
}

impl Mailer for LettreMailer {
    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        let message = Message::builder()
            .from(self.postmaster.clone())
            .to(self.postmaster.clone())
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| PolicyError::Notification(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| PolicyError::Notification(e.to_string()))?;

        debug!(subject, "operator mail delivered");
        Ok(())
    }
}
