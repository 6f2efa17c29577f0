// geowarden/src/server.rs
//
// Policy delegation server.
//
// Three ways to be reached by Postfix:
//   stdio        — master.cf `spawn` service, one connection on stdin/stdout
//   unix:PATH    — check_policy_service unix:PATH, many connections
//   tcp:ADDR     — check_policy_service inet:ADDR, many connections
//
// Every connection owns its RequestAssembler; nothing but the engine, the
// resolver and the notification queue is shared. Per request:
//
//   assemble → resolve client_address → decide → write reply → queue mail
//
// The reply is flushed before any notification is queued. An I/O error ends
// only the connection it happened on, and so does a line or a request that
// outgrows the caps below.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, error, info, warn};

use crate::engine::{DecisionEngine, Dispatcher};
use crate::events::{CountryCode, PolicyRequest, Verdict};
use crate::geoip::CountryResolver;
use crate::protocol::{encode, RequestAssembler};
use crate::state::HistoryStore;

/// Longest policy line accepted, terminator included.
pub const MAX_LINE_BYTES: usize = 16 * 1024;
/// Most attribute lines buffered before the empty line must arrive.
pub const MAX_PENDING_LINES: usize = 256;

// ── Listen address ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listen {
    Stdio,
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Listen {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "stdio" || s == "-" {
            return Ok(Self::Stdio);
        }
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() { return Err("unix: needs a socket path".into()); }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp:").or_else(|| s.strip_prefix("inet:")) {
            if addr.is_empty() { return Err("tcp: needs host:port".into()); }
            return Ok(Self::Tcp(addr.to_string()));
        }
        Err(format!("unsupported listen address {s:?} (stdio, unix:PATH or tcp:ADDR)"))
    }
}

impl fmt::Display for Listen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct Pipeline<S> {
    pub engine:     Arc<DecisionEngine<S>>,
    pub resolver:   Arc<dyn CountryResolver>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Outcome of one request, kept until the reply is written.
#[derive(Debug)]
pub struct Decision {
    pub verdict: Verdict,
    pub account: String,
    pub ip:      String,
    pub country: CountryCode,
    /// Set when the store failed and the verdict is the fallback.
    pub store_error: Option<String>,
}

impl<S: HistoryStore> Pipeline<S> {
    pub fn new(
        engine: Arc<DecisionEngine<S>>,
        resolver: Arc<dyn CountryResolver>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self { engine, resolver, dispatcher }
    }

    pub async fn process(&self, request: &PolicyRequest) -> Decision {
        // a bare empty line: nothing to resolve or decide
        if request.is_empty() {
            debug!("empty policy request");
            return Decision {
                verdict:     Verdict::Pass,
                account:     String::new(),
                ip:          String::new(),
                country:     CountryCode::Unknown,
                store_error: None,
            };
        }

        let account = request.sasl_username();
        let ip = request.client_address();
        let country = self.resolver.resolve(ip);

        let (verdict, store_error) = match self.engine.try_decide(account, ip, country).await {
            Ok(verdict) => (verdict, None),
            Err(err) => (self.engine.on_store_failure(account, &err), Some(err.to_string())),
        };

        match &verdict {
            Verdict::Reject { message } => warn!(
                client_address = ip, sasl_username = account, country = %country,
                verdict = verdict.label(), "{message}"
            ),
            _ => info!(
                client_address = ip, sasl_username = account, country = %country,
                verdict = verdict.label()
            ),
        }

        Decision { verdict, account: account.to_string(), ip: ip.to_string(), country, store_error }
    }

    /// Serve one connection until EOF. Returns the number of requests answered.
    pub async fn handle_connection<R, W>(&self, mut reader: R, mut writer: W) -> Result<u64>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut assembler = RequestAssembler::new();
        let mut raw = Vec::new();
        let mut answered = 0;

        loop {
            raw.clear();
            let n = (&mut reader).take(MAX_LINE_BYTES as u64).read_until(b'\n', &mut raw).await?;
            if n == 0 { break; }
            if n == MAX_LINE_BYTES && raw.last() != Some(&b'\n') {
                bail!("policy line longer than {MAX_LINE_BYTES} bytes");
            }

            let line = String::from_utf8_lossy(&raw);
            let Some(request) = assembler.feed(&line) else {
                if assembler.pending() > MAX_PENDING_LINES {
                    bail!("policy request longer than {MAX_PENDING_LINES} lines");
                }
                continue;
            };

            let decision = self.process(&request).await;
            writer.write_all(encode(&decision.verdict).as_bytes()).await?;
            writer.flush().await?;
            answered += 1;

            match &decision.store_error {
                Some(error) => self.dispatcher.store_failure(&decision.account, &decision.ip, error),
                // empty usernames never reach the store, so they say nothing about it
                None if !decision.account.is_empty() => self.dispatcher.store_recovered(),
                None => {}
            }
            self.dispatcher.warning(&decision.verdict, &decision.account, &decision.ip, decision.country);
        }

        let dropped = assembler.discard();
        if dropped > 0 {
            debug!(lines = dropped, "connection closed mid-request, fragment discarded");
        }
        Ok(answered)
    }
}

// ── Serving ───────────────────────────────────────────────────────────────────

pub async fn serve<S: HistoryStore>(pipeline: Arc<Pipeline<S>>, listen: Listen) -> Result<()> {
    match listen {
        Listen::Stdio => serve_stdio(pipeline).await,
        Listen::Unix(path) => serve_unix(pipeline, path).await,
        Listen::Tcp(addr) => serve_tcp(pipeline, addr).await,
    }
}

async fn serve_stdio<S: HistoryStore>(pipeline: Arc<Pipeline<S>>) -> Result<()> {
    pipeline.engine.counters.connections.fetch_add(1, Ordering::Relaxed);
    let reader = BufReader::new(tokio::io::stdin());
    let writer = tokio::io::stdout();

    tokio::select! {
        res = pipeline.handle_connection(reader, writer) => {
            let answered = res?;
            info!(answered, "policy client closed stdin");
        }
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    Ok(())
}

async fn serve_unix<S: HistoryStore>(pipeline: Arc<Pipeline<S>>, path: PathBuf) -> Result<()> {
    // a socket left behind by a previous run would make bind fail
    if path.exists() {
        std::fs::remove_file(&path).with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(&path).with_context(|| format!("binding {}", path.display()))?;
    info!("listening on unix:{}", path.display());

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => spawn_connection(&pipeline, stream),
                Err(e) => error!("accept failed: {e}"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    std::fs::remove_file(&path).ok();
    Ok(())
}

async fn serve_tcp<S: HistoryStore>(pipeline: Arc<Pipeline<S>>, addr: String) -> Result<()> {
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    info!("listening on tcp:{}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection accepted");
                    spawn_connection(&pipeline, stream);
                }
                Err(e) => error!("accept failed: {e}"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    Ok(())
}

fn spawn_connection<S, T>(pipeline: &Arc<Pipeline<S>>, stream: T)
where
    S: HistoryStore,
    T: tokio::io::AsyncRead + AsyncWrite + Send + 'static,
{
    pipeline.engine.counters.connections.fetch_add(1, Ordering::Relaxed);
    let p = Arc::clone(pipeline);
    tokio::spawn(async move {
        let (read_half, write_half) = tokio::io::split(stream);
        match p.handle_connection(BufReader::new(read_half), write_half).await {
            Ok(answered) => debug!(answered, "connection closed"),
            Err(e) => error!("connection error: {e:#}"),
        }
    });
}

// ── Stats ─────────────────────────────────────────────────────────────────────

pub async fn stats_loop<S: HistoryStore>(engine: Arc<DecisionEngine<S>>, dispatcher: Arc<Dispatcher>, period: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        tokio::time::sleep(period).await;
        let s = engine.counters.snapshot();
        info!(
            uptime_secs    = start.elapsed().as_secs(),
            connections    = s.connections,
            decisions      = s.decisions(),
            pass           = s.pass,
            warn_added     = s.warn_added,
            warn_blocking  = s.warn_blocking,
            reject         = s.reject,
            store_failures = s.store_failures,
            mails_sent     = dispatcher.sent.load(Ordering::Relaxed),
            mails_dropped  = dispatcher.dropped.load(Ordering::Relaxed),
            "stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::AtomicBool;
    use std::task::{Context as TaskContext, Poll};

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::PolicyConfig;
    use crate::engine::dispatcher::Notice;
    use crate::error::PolicyError;
    use crate::geoip::fixtures::StaticResolver;
    use crate::mailer::fixtures::RecordingMailer;
    use crate::notify::Composer;
    use crate::state::memory::MemoryHistoryStore;
    use crate::state::{AccountHistory, BlockArm};

    fn resolver() -> Arc<StaticResolver> {
        Arc::new(StaticResolver::with(&[("1.2.3.4", "AU"), ("176.111.36.1", "UA")]))
    }

    fn pipeline_over<S: HistoryStore>(
        store: Arc<S>,
        resolver: Arc<StaticResolver>,
        whitelist: &[&str],
        dispatcher: Dispatcher,
    ) -> Pipeline<S> {
        let config = PolicyConfig {
            whitelist: whitelist.iter().map(|c| CountryCode::parse_lossy(c)).collect(),
            ..PolicyConfig::default()
        };
        let history = AccountHistory::new(store, Duration::from_secs(1));
        Pipeline::new(Arc::new(DecisionEngine::new(history, &config)), resolver, Arc::new(dispatcher))
    }

    fn pipeline(whitelist: &[&str], dispatcher: Dispatcher) -> Pipeline<MemoryHistoryStore> {
        pipeline_over(Arc::new(MemoryHistoryStore::new()), resolver(), whitelist, dispatcher)
    }

    async fn exchange<S: HistoryStore>(pipeline: &Pipeline<S>, input: &str) -> (u64, String) {
        let mut out = Vec::new();
        let answered = pipeline.handle_connection(input.as_bytes(), &mut out).await.unwrap();
        (answered, String::from_utf8(out).unwrap())
    }

    #[test]
    fn listen_addresses_parse() {
        assert_eq!("stdio".parse::<Listen>().unwrap(), Listen::Stdio);
        assert_eq!(
            "unix:/var/spool/postfix/private/geowarden".parse::<Listen>().unwrap(),
            Listen::Unix(PathBuf::from("/var/spool/postfix/private/geowarden"))
        );
        assert_eq!("tcp:127.0.0.1:10023".parse::<Listen>().unwrap(), Listen::Tcp("127.0.0.1:10023".into()));
        assert!("unix:".parse::<Listen>().is_err());
        assert!("udp:1.2.3.4:1".parse::<Listen>().is_err());
        assert_eq!(Listen::Tcp("[::1]:10023".into()).to_string(), "tcp:[::1]:10023");
    }

    #[tokio::test]
    async fn one_reply_per_exchange_on_a_single_connection() {
        let pipeline = pipeline(&["AU"], Dispatcher::disabled());
        let input = "request=smtpd_access_policy\nsasl_username=bob@example.tld\nclient_address=176.111.36.1\n\n\
                     request=smtpd_access_policy\nsasl_username=bob@example.tld\nclient_address=176.111.36.1\n\n\
                     request=smtpd_access_policy\nsasl_username=alice@example.tld\nclient_address=1.2.3.4\n\n";

        let (answered, out) = exchange(&pipeline, input).await;
        assert_eq!(answered, 3);
        let replies: Vec<&str> = out.split_terminator("\n\n").collect();
        assert!(replies[0].starts_with("action=WARN bob@example.tld sending from UA is not allowed"));
        assert_eq!(replies[1], "action=REJECT bob@example.tld sending from UA is not allowed");
        assert_eq!(replies[2], "action=WARN alice@example.tld has moved to AU, a whitelisted country");
    }

    #[tokio::test]
    async fn missing_username_is_dunno() {
        let pipeline = pipeline(&["AU"], Dispatcher::disabled());
        let (_, out) = exchange(&pipeline, "client_address=176.111.36.1\nsasl_username=\n\n").await;
        assert_eq!(out, "action=DUNNO\n\n");
        assert!(pipeline.engine.history().store().keys("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unterminated_fragment_gets_no_reply() {
        let pipeline = pipeline(&["AU"], Dispatcher::disabled());
        let (answered, out) = exchange(
            &pipeline,
            "sasl_username=a\nclient_address=1.2.3.4\n\nsasl_username=b\nclient_address=176.111.36.1\n",
        )
        .await;
        assert_eq!(answered, 1);
        assert_eq!(out.matches("action=").count(), 1);
        assert!(pipeline.engine.history().store().keys("justblock:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_address_blocks_like_any_foreign_country() {
        let pipeline = pipeline(&["AU"], Dispatcher::disabled());
        let (_, out) = exchange(&pipeline, "sasl_username=bob\nclient_address=not-an-ip\n\n").await;
        assert!(out.starts_with("action=WARN bob sending from -- is not allowed"));
    }

    #[tokio::test]
    async fn warnings_are_queued_for_mail() {
        let mailer = Arc::new(RecordingMailer::default());
        let (dispatcher, handle) = Dispatcher::spawn(Composer::new("mx1", None), Arc::clone(&mailer), 8);
        let pipeline = pipeline(&["AU"], dispatcher);

        exchange(
            &pipeline,
            "sasl_username=bob\nclient_address=176.111.36.1\n\nsasl_username=bob\nclient_address=176.111.36.1\n\n",
        )
        .await;
        drop(pipeline);
        handle.await.unwrap();

        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "[geowarden] bob blocking UA on mx1");
    }

    #[tokio::test]
    async fn concurrent_connections_keep_their_own_buffers() {
        let pipeline = Arc::new(pipeline(&["AU"], Dispatcher::disabled()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let p = Arc::clone(&pipeline);
            handles.push(tokio::spawn(async move {
                let input = format!("sasl_username=user{i}\nclient_address=1.2.3.4\n\n");
                let mut out = Vec::new();
                p.handle_connection(input.as_bytes(), &mut out).await.unwrap();
                String::from_utf8(out).unwrap()
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), format!("action=WARN user{i} has moved to AU, a whitelisted country\n\n"));
        }
    }

    #[tokio::test]
    async fn bare_empty_line_is_dunno_without_a_lookup() {
        let resolver = resolver();
        let store = Arc::new(MemoryHistoryStore::new());
        let pipeline = pipeline_over(store, Arc::clone(&resolver), &["AU"], Dispatcher::disabled());

        let (answered, out) = exchange(&pipeline, "\n").await;
        assert_eq!(answered, 1);
        assert_eq!(out, "action=DUNNO\n\n");
        assert_eq!(resolver.calls.load(Ordering::Relaxed), 0);
        assert_eq!(pipeline.engine.counters.snapshot().decisions(), 0);
    }

    #[tokio::test]
    async fn overlong_line_closes_the_connection() {
        let pipeline = pipeline(&["AU"], Dispatcher::disabled());
        let input = format!("sasl_username={}\nclient_address=1.2.3.4\n\n", "a".repeat(MAX_LINE_BYTES));

        let mut out = Vec::new();
        assert!(pipeline.handle_connection(input.as_bytes(), &mut out).await.is_err());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn request_without_end_closes_the_connection() {
        let pipeline = pipeline(&["AU"], Dispatcher::disabled());
        let input = "x=1\n".repeat(MAX_PENDING_LINES + 1) + "\n";

        let mut out = Vec::new();
        assert!(pipeline.handle_connection(input.as_bytes(), &mut out).await.is_err());
        assert!(out.is_empty());

        // a request right at the cap is still answered
        let input = "x=1\n".repeat(MAX_PENDING_LINES) + "\n";
        assert_eq!(exchange(&pipeline, &input).await, (1, "action=DUNNO\n\n".to_string()));
    }

    /// Memory store that can be switched off like a dropped Redis link.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryHistoryStore,
        down:  AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> crate::error::Result<()> {
            if self.down.load(Ordering::Relaxed) {
                return Err(PolicyError::StoreUnavailable("connection refused".into()));
            }
            Ok(())
        }
    }

    impl HistoryStore for FlakyStore {
        async fn contains(&self, key: &str, member: &str) -> crate::error::Result<bool> {
            self.check()?;
            self.inner.contains(key, member).await
        }
        async fn add(&self, key: &str, member: &str) -> crate::error::Result<bool> {
            self.check()?;
            self.inner.add(key, member).await
        }
        async fn members(&self, key: &str) -> crate::error::Result<Vec<String>> {
            self.check()?;
            self.inner.members(key).await
        }
        async fn arm(&self, key: &str, value: &str, ttl: Duration) -> crate::error::Result<BlockArm> {
            self.check()?;
            self.inner.arm(key, value, ttl).await
        }
        async fn keys(&self, prefix: &str) -> crate::error::Result<Vec<String>> {
            self.check()?;
            self.inner.keys(prefix).await
        }
    }

    /// Writer that notes how many notices were already queued each time a
    /// reply reaches it.
    struct QueueWatcher {
        rx:       mpsc::Receiver<Notice>,
        notices:  Vec<Notice>,
        at_write: Vec<usize>,
    }

    impl QueueWatcher {
        fn drain(&mut self) {
            while let Ok(notice) = self.rx.try_recv() {
                self.notices.push(notice);
            }
        }
    }

    impl AsyncWrite for QueueWatcher {
        fn poll_write(mut self: Pin<&mut Self>, _: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.drain();
            let queued = self.notices.len();
            self.at_write.push(queued);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn store_failure_is_queued_after_the_reply_once_per_outage() {
        let store = Arc::new(FlakyStore::default());
        store.down.store(true, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(8);
        let pipeline = pipeline_over(Arc::clone(&store), resolver(), &["AU"], Dispatcher::queue(tx));
        let mut writer = QueueWatcher { rx, notices: Vec::new(), at_write: Vec::new() };

        let request = "sasl_username=bob\nclient_address=176.111.36.1\n\n";
        let answered = pipeline.handle_connection(request.repeat(2).as_bytes(), &mut writer).await.unwrap();
        assert_eq!(answered, 2);

        // a quiet Pass while the store is back ends the outage
        store.down.store(false, Ordering::Relaxed);
        store.inner.add("countries:alice", "AU").await.unwrap();
        let known = "sasl_username=alice\nclient_address=1.2.3.4\n\n";
        pipeline.handle_connection(known.as_bytes(), &mut writer).await.unwrap();
        store.down.store(true, Ordering::Relaxed);
        pipeline.handle_connection(request.as_bytes(), &mut writer).await.unwrap();
        writer.drain();

        // nothing was queued ahead of the first reply
        assert_eq!(writer.at_write, vec![0, 1, 1, 1]);
        assert_eq!(writer.notices.len(), 2);
        assert!(writer
            .notices
            .iter()
            .all(|n| matches!(n, Notice::StoreFailure { error, .. } if error.contains("connection refused"))));
        assert_eq!(pipeline.engine.counters.snapshot().store_failures, 3);
    }
}
