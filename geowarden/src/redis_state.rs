// geowarden/src/redis_state.rs
//
// Redis-backed HistoryStore.
//
// Redis is the single source of truth for account history: several geowarden
// instances (one per MTA) and the batch inspector share it, and the process
// keeps no authoritative state of its own.
//
// Commands used:
//   SISMEMBER / SADD / SMEMBERS   countries:* and logged_from:* sets
//   EVALSHA (ARM_SCRIPT)          justblock:* arm-or-refresh, atomic server side
//   SCAN MATCH                    dump-db
//
// A ConnectionManager reconnects transparently; callers bound every round trip
// with a timeout (see state::AccountHistory) so an unreachable server turns
// into a StoreTimeout rather than a hung connection.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

use crate::config::StoreConfig;
use crate::error::{PolicyError, Result};
use crate::state::{BlockArm, HistoryStore};

// SET NX EX arms a fresh marker; on a live key only the TTL is reset, so the
// value keeps naming the first blocked country of the window.
const ARM_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[2]) then
    return 1
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
return 0
"#;

pub struct RedisHistoryStore {
    conn:       ConnectionManager,
    arm_script: Script,
}

impl RedisHistoryStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let timeout = Duration::from_millis(config.timeout_ms);
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| PolicyError::StoreTimeout(timeout))??;

        info!("Connected to history store {}", config.url);
        Ok(Self { conn, arm_script: Script::new(ARM_SCRIPT) })
    }
}

impl HistoryStore for RedisHistoryStore {
    async fn contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(key, member).await?)
    }

    async fn add(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: i64 = conn.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn arm(&self, key: &str, value: &str, ttl: Duration) -> Result<BlockArm> {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);
        let armed: i64 = self
            .arm_script
            .key(key)
            .arg(value)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(if armed == 1 { BlockArm::Armed } else { BlockArm::Refreshed })
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(format!("{prefix}*")).await?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}
