// geowarden/src/geoip.rs
//
// Country resolution for client addresses.
//
// The MaxMind country database is read into memory once at startup, so a
// lookup never touches the disk or the network. Every failure mode (empty
// string, malformed address, private range, address missing from the
// database) yields CountryCode::Unknown; the decision path never sees an
// error from here.

use std::net::IpAddr;
use std::path::Path;

use dashmap::DashMap;
use maxminddb::{geoip2, MaxMindDBError};
use tracing::{debug, info};

use crate::error::Result;
use crate::events::CountryCode;

pub trait CountryResolver: Send + Sync {
    fn resolve(&self, ip: &str) -> CountryCode;
}

// ── MaxMind database ──────────────────────────────────────────────────────────

pub struct GeoipDB {
    mmdb: maxminddb::Reader<Vec<u8>>,
}

impl GeoipDB {
    pub fn open(path: &Path) -> Result<Self> {
        let mmdb = maxminddb::Reader::open_readfile(path)?;
        info!(
            "geoip database loaded from {} ({})",
            path.display(),
            mmdb.metadata.database_type
        );
        Ok(Self { mmdb })
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<CountryCode> {
        if ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() {
            return None;
        }

        match self.mmdb.lookup::<geoip2::Country>(ip) {
            Ok(record) => record
                .country
                .and_then(|c| c.iso_code)
                // anycast and satellite ranges only carry the registration country
                .or_else(|| record.registered_country.and_then(|c| c.iso_code))
                .and_then(|code| code.parse().ok()),
            Err(MaxMindDBError::AddressNotFoundError(_)) => None,
            Err(err) => {
                debug!("geoip: error looking up {ip}: {err}");
                None
            }
        }
    }
}

impl CountryResolver for GeoipDB {
    fn resolve(&self, ip: &str) -> CountryCode {
        ip.trim()
            .parse::<IpAddr>()
            .ok()
            .and_then(|addr| self.lookup(addr))
            .unwrap_or(CountryCode::Unknown)
    }
}

// ── Per-run cache ─────────────────────────────────────────────────────────────

/// Memoises lookups for addresses that repeat within a batch of log lines.
/// Advisory only: dropping it changes nothing but lookup count.
pub struct CachedResolver<R> {
    inner: R,
    cache: DashMap<String, CountryCode>,
}

impl<R: CountryResolver> CachedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, cache: DashMap::new() }
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl<R: CountryResolver> CountryResolver for CachedResolver<R> {
    fn resolve(&self, ip: &str) -> CountryCode {
        if let Some(hit) = self.cache.get(ip) {
            return *hit;
        }
        let country = self.inner.resolve(ip);
        self.cache.insert(ip.to_string(), country);
        country
    }
}
