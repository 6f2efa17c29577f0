// geowarden/src/engine/dispatcher.rs
//
// Hands warnings and store outages to the operator mail path.
//
// The connection task enqueues a Notice after its reply is on the wire and
// moves on; a single background task composes and sends the mail. A full or
// closed queue drops the notice with a log line, so a slow relay can never
// hold up a policy reply.
//
// Store failures mail once per outage. The first failure opens the outage,
// later ones are only logged by the engine, and the next decision the store
// backs closes it again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{CountryCode, Verdict};
use crate::mailer::Mailer;
use crate::notify::Composer;

#[derive(Debug)]
pub enum Notice {
    Warning {
        verdict: Verdict,
        account: String,
        ip:      String,
        country: CountryCode,
    },
    StoreFailure {
        account: String,
        ip:      String,
        error:   String,
    },
}

pub struct Dispatcher {
    tx:          Option<mpsc::Sender<Notice>>,
    outage:      AtomicBool,
    pub sent:    Arc<AtomicU64>,
    pub dropped: AtomicU64,
}

impl Dispatcher {
    /// Start the delivery task. The task ends once every Dispatcher handle
    /// is dropped and the queue has drained.
    pub fn spawn<M: Mailer>(composer: Composer, mailer: Arc<M>, queue_size: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let sent = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(deliver_loop(rx, composer, mailer, Arc::clone(&sent)));
        (Self::with_sender(Some(tx), sent), handle)
    }

    /// A dispatcher that discards everything (`--no-notify`).
    pub fn disabled() -> Self {
        Self::with_sender(None, Arc::new(AtomicU64::new(0)))
    }

    fn with_sender(tx: Option<mpsc::Sender<Notice>>, sent: Arc<AtomicU64>) -> Self {
        Self { tx, outage: AtomicBool::new(false), sent, dropped: AtomicU64::new(0) }
    }

    /// A dispatcher feeding `tx` directly, with no delivery task.
    #[cfg(test)]
    pub(crate) fn queue(tx: mpsc::Sender<Notice>) -> Self {
        Self::with_sender(Some(tx), Arc::new(AtomicU64::new(0)))
    }

    pub fn warning(&self, verdict: &Verdict, account: &str, ip: &str, country: CountryCode) {
        if !verdict.is_warning() { return; }
        self.enqueue(Notice::Warning {
            verdict: verdict.clone(),
            account: account.to_string(),
            ip:      ip.to_string(),
            country,
        });
    }

    /// Queue an outage notice unless one already went out for this outage.
    pub fn store_failure(&self, account: &str, ip: &str, error: &str) {
        if self.outage.swap(true, Ordering::AcqRel) { return; }
        self.enqueue(Notice::StoreFailure {
            account: account.to_string(),
            ip:      ip.to_string(),
            error:   error.to_string(),
        });
    }

    /// The store answered again; the next failure opens a new outage.
    pub fn store_recovered(&self) {
        if self.outage.swap(false, Ordering::AcqRel) {
            info!("history store reachable again");
        }
    }

    fn enqueue(&self, notice: Notice) {
        let Some(tx) = &self.tx else { return };
        if let Err(err) = tx.try_send(notice) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("notification dropped: {err}");
        }
    }
}

async fn deliver_loop<M: Mailer>(
    mut rx: mpsc::Receiver<Notice>,
    composer: Composer,
    mailer: Arc<M>,
    sent: Arc<AtomicU64>,
) {
    while let Some(notice) = rx.recv().await {
        let message = match notice {
            Notice::Warning { verdict, account, ip, country } => {
                composer.compose(&verdict, &account, &ip, country).await
            }
            Notice::StoreFailure { account, ip, error } => {
                Some(composer.compose_store_failure(&account, &ip, &error))
            }
        };
        let Some((subject, body)) = message else { continue };

        match mailer.send(&subject, &body).await {
            Ok(()) => {
                sent.fetch_add(1, Ordering::Relaxed);
                debug!(subject, "notification sent");
            }
            Err(err) => error!(subject, "notification failed: {err}"),
        }
    }
}
