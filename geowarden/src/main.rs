// geowarden/src/main.rs
//
// geowarden — Postfix policy daemon that blocks authenticated submissions
// from countries an account has never used.
//
// Subcommands:
//   serve    — the inline policy service (stdio spawn, unix socket or tcp)
//   inspect  — batch scan of IMAP/POP3 and webmail login logs, mails a digest
//   dump-db  — print every account's known countries as redis-cli commands
//
// Usage:
//   geowarden serve                                    # master.cf spawn mode
//   geowarden serve --listen unix:/var/spool/postfix/private/geowarden
//   geowarden --config /etc/geowarden.json inspect
//   geowarden dump-db > countries.redis

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod error;
mod events;
mod geoip;
mod inspector;
mod mailer;
mod notify;
mod protocol;
mod redis_state;
mod server;
mod state;

use config::{parse_country_list, FailurePolicy, PolicyConfig};
use engine::{DecisionEngine, Dispatcher};
use geoip::GeoipDB;
use inspector::Inspector;
use mailer::LettreMailer;
use notify::Composer;
use redis_state::RedisHistoryStore;
use server::{Listen, Pipeline};
use state::memory::MemoryHistoryStore;
use state::{AccountHistory, HistoryStore};

const MEMORY_STORE_URL: &str = "memory://";

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "geowarden",
    about   = "Postfix policy daemon that blocks logins from unexpected countries",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, global = true, help = "JSON configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer policy delegation requests
    Serve(ServeArgs),
    /// Scan login logs for new countries and mail a digest
    Inspect(InspectArgs),
    /// Print known countries as `SADD countries:<account> ...` lines
    DumpDb,
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "stdio", help = "stdio, unix:PATH or tcp:ADDR")]
    listen: Listen,

    #[arg(long, help = "Comma separated bypass countries, e.g. ES,PT")]
    whitelist: Option<String>,

    #[arg(long = "block-time", help = "Block window in seconds")]
    block_time: Option<u64>,

    #[arg(long, help = "Reject instead of pass while the store is unreachable")]
    fail_closed: bool,

    #[arg(long, help = "History store URL (redis://... or memory://)")]
    redis: Option<String>,

    #[arg(long, help = "MaxMind country database")]
    geoip: Option<PathBuf>,

    #[arg(long, help = "Mail log quoted in warning mails")]
    mail_log: Option<PathBuf>,

    #[arg(long, help = "Do not send operator mail")]
    no_notify: bool,
}

#[derive(Args)]
struct InspectArgs {
    #[arg(long, help = "Dovecot log (IMAP/POP3 logins)")]
    imap_log: Option<PathBuf>,

    #[arg(long, help = "Roundcube userlogins log")]
    webmail_log: Option<PathBuf>,

    #[arg(long, help = "History store URL (redis://... or memory://)")]
    redis: Option<String>,

    #[arg(long, help = "Print the digest instead of mailing it")]
    no_notify: bool,
}

// ── Configuration ─────────────────────────────────────────────────────────────

fn load_config(path: Option<&PathBuf>) -> Result<PolicyConfig> {
    let config = match path {
        Some(path) => PolicyConfig::from_file(path)?,
        None => PolicyConfig::default(),
    };
    Ok(config)
}

impl ServeArgs {
    fn apply(&self, config: &mut PolicyConfig) -> Result<()> {
        if let Some(list) = &self.whitelist { config.whitelist = parse_country_list(list)?; }
        if let Some(secs) = self.block_time { config.block_time_secs = secs; }
        if self.fail_closed { config.failure_policy = FailurePolicy::Closed; }
        if let Some(url) = &self.redis { config.store.url = url.clone(); }
        if let Some(path) = &self.geoip { config.geoip_db = path.clone(); }
        if let Some(path) = &self.mail_log { config.mail_log = path.clone(); }
        if self.no_notify { config.notify.enabled = false; }
        config.validate()?;
        Ok(())
    }
}

impl InspectArgs {
    fn apply(&self, config: &mut PolicyConfig) -> Result<()> {
        if let Some(path) = &self.imap_log { config.imap_log = path.clone(); }
        if let Some(path) = &self.webmail_log { config.webmail_log = path.clone(); }
        if let Some(url) = &self.redis { config.store.url = url.clone(); }
        if self.no_notify { config.notify.enabled = false; }
        config.validate()?;
        Ok(())
    }
}

fn history<S: HistoryStore>(store: Arc<S>, config: &PolicyConfig) -> AccountHistory<S> {
    AccountHistory::new(store, Duration::from_millis(config.store.timeout_ms))
}

// ── Subcommands ───────────────────────────────────────────────────────────────

async fn run_serve<S: HistoryStore>(store: Arc<S>, config: PolicyConfig, listen: Listen) -> Result<()> {
    let resolver = Arc::new(GeoipDB::open(&config.geoip_db)?);
    let engine = Arc::new(DecisionEngine::new(history(store, &config), &config));

    let dispatcher = if config.notify.enabled {
        let composer = Composer::new(config.notify.hostname.clone(), Some(config.mail_log.clone()));
        let mailer = Arc::new(LettreMailer::new(&config.notify)?);
        let (dispatcher, _delivery) = Dispatcher::spawn(composer, mailer, config.notify.queue_size);
        dispatcher
    } else {
        Dispatcher::disabled()
    };
    let dispatcher = Arc::new(dispatcher);

    info!(
        listen = %listen,
        whitelist = ?config.whitelist,
        block_time_secs = config.block_time_secs,
        failure_policy = ?config.failure_policy,
        notify = config.notify.enabled,
        "geowarden starting"
    );

    if config.stats_interval_secs > 0 {
        tokio::spawn(server::stats_loop(
            Arc::clone(&engine),
            Arc::clone(&dispatcher),
            Duration::from_secs(config.stats_interval_secs),
        ));
    }

    let pipeline = Arc::new(Pipeline::new(engine, resolver, dispatcher));
    server::serve(pipeline, listen).await
}

async fn run_inspect<S: HistoryStore>(store: Arc<S>, config: PolicyConfig) -> Result<()> {
    let resolver = GeoipDB::open(&config.geoip_db)?;
    let inspector = Inspector::new(
        history(store, &config),
        resolver,
        config.whitelist_set(),
        config.notify.hostname.clone(),
    )?;
    let report = inspector.run(&config.imap_log, &config.webmail_log).await;

    if !config.notify.enabled {
        if report.should_send() { print!("{}", report.body()); }
        return Ok(());
    }
    let mailer = LettreMailer::new(&config.notify)?;
    if inspector::deliver(&report, &mailer).await? {
        info!("digest sent to {}", config.notify.postmaster);
    }
    Ok(())
}

async fn run_dump_db<S: HistoryStore>(store: Arc<S>, config: PolicyConfig) -> Result<()> {
    let history = history(store, &config);
    for account in history.accounts().await? {
        let countries = history.known_countries(&account).await?;
        if countries.is_empty() { continue; }
        let list = countries.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(" ");
        println!("SADD {} {list}", state::countries_key(&account));
    }
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the policy protocol in stdio mode
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("geowarden=info".parse()?))
        .with_writer(std::io::stderr)
        .compact().init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Serve(args) => {
            args.apply(&mut config)?;
            if config.store.url.starts_with(MEMORY_STORE_URL) {
                let store = Arc::new(MemoryHistoryStore::new());
                tokio::spawn(Arc::clone(&store).housekeeping_loop(Duration::from_secs(60)));
                run_serve(store, config, args.listen).await
            } else {
                let store = Arc::new(RedisHistoryStore::connect(&config.store).await?);
                run_serve(store, config, args.listen).await
            }
        }

        Command::Inspect(args) => {
            args.apply(&mut config)?;
            if config.store.url.starts_with(MEMORY_STORE_URL) {
                run_inspect(Arc::new(MemoryHistoryStore::new()), config).await
            } else {
                let store = Arc::new(RedisHistoryStore::connect(&config.store).await?);
                run_inspect(store, config).await
            }
        }

        Command::DumpDb => {
            config.validate()?;
            let store = Arc::new(RedisHistoryStore::connect(&config.store).await?);
            run_dump_db(store, config).await
        }
    }
}
