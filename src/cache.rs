//! Persisted device cache keyed by device identity. SQLite-backed so repeat
//! scans on the same LAN can skip rediscovery; entries expire by age on read.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::device::{Device, DeviceIdentity};
use crate::error::Error;

/// Default freshness horizon for [`DeviceCache::list`]
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// SQLite-backed device store. Synchronous; async callers wrap operations
/// in `spawn_blocking`.
pub struct DeviceCache {
    conn: Connection,
}

impl DeviceCache {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path)?;

        // Busy timeout first, it needs no locks; WAL may fail if another
        // connection holds a transaction, which is fine once set
        let _ = conn.execute("PRAGMA busy_timeout = 30000;", []);
        let _ = conn.execute("PRAGMA journal_mode = WAL;", []);
        let _ = conn.execute("PRAGMA synchronous = NORMAL;", []);

        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS devices (
                identity TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                last_seen INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn })
    }

    /// Insert or refresh a device under its identity key
    pub fn upsert(&self, device: &Device) -> Result<(), Error> {
        let identity = device.identity().to_string();
        let value = serde_json::to_string(device)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO devices (identity, value, last_seen) VALUES (?1, ?2, ?3)
             ON CONFLICT(identity) DO UPDATE SET value = ?2, last_seen = ?3",
            params![identity, value, device.last_seen.timestamp()],
        )?;
        debug!(identity, "cached device");
        Ok(())
    }

    pub fn get(&self, identity: &DeviceIdentity) -> Result<Option<Device>, Error> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM devices WHERE identity = ?1",
                params![identity.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(value) => Ok(serde_json::from_str(&value).ok()),
            None => Ok(None),
        }
    }

    /// Devices seen within `max_age`, ordered by identity. Stale entries
    /// stay on disk but are never returned.
    pub fn list(&self, max_age: Duration) -> Result<Vec<Device>, Error> {
        let cutoff = age_cutoff(max_age);
        let mut statement = self.conn.prepare(
            "SELECT value FROM devices WHERE last_seen >= ?1 ORDER BY identity",
        )?;
        let rows = statement.query_map(params![cutoff], |row| row.get::<_, String>(0))?;

        let mut devices = Vec::new();
        for value in rows {
            if let Ok(device) = serde_json::from_str::<Device>(&value?) {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    /// Drop entries older than `max_age`
    pub fn prune(&self, max_age: Duration) -> Result<usize, Error> {
        let cutoff = age_cutoff(max_age);
        let deleted = self
            .conn
            .execute("DELETE FROM devices WHERE last_seen < ?1", params![cutoff])?;
        Ok(deleted)
    }
}

fn age_cutoff(max_age: Duration) -> i64 {
    let age = max_age.as_secs().min(i64::MAX as u64) as i64;
    Utc::now().timestamp().saturating_sub(age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DiscoveryMethod;

    fn device(ip: &str, udn: &str) -> Device {
        let mut d = Device::new(ip.parse().unwrap(), 1400, DiscoveryMethod::Ssdp);
        d.udn = udn.to_string();
        d.friendly_name = "Living Room".into();
        d
    }

    #[test]
    fn test_upsert_and_get() {
        let cache = DeviceCache::open_in_memory().unwrap();
        let original = device("192.168.1.50", "uuid:RINCON_1");
        cache.upsert(&original).unwrap();

        let fetched = cache.get(&original.identity()).unwrap().unwrap();
        assert_eq!(fetched.friendly_name, "Living Room");
        assert_eq!(fetched.udn, "uuid:RINCON_1");
    }

    #[test]
    fn test_upsert_replaces_by_identity() {
        let cache = DeviceCache::open_in_memory().unwrap();
        let mut dev = device("192.168.1.50", "uuid:RINCON_1");
        cache.upsert(&dev).unwrap();

        dev.friendly_name = "Kitchen".into();
        cache.upsert(&dev).unwrap();

        assert_eq!(cache.list(DEFAULT_MAX_AGE).unwrap().len(), 1);
        let fetched = cache.get(&dev.identity()).unwrap().unwrap();
        assert_eq!(fetched.friendly_name, "Kitchen");
    }

    #[test]
    fn test_list_filters_stale_entries() {
        let cache = DeviceCache::open_in_memory().unwrap();
        let mut fresh = device("192.168.1.50", "uuid:fresh");
        fresh.last_seen = Utc::now();
        cache.upsert(&fresh).unwrap();

        let mut stale = device("192.168.1.60", "uuid:stale");
        stale.last_seen = Utc::now() - chrono::Duration::hours(48);
        cache.upsert(&stale).unwrap();

        let listed = cache.list(DEFAULT_MAX_AGE).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].udn, "uuid:fresh");

        // Both still present under a wider horizon
        let listed = cache.list(Duration::from_secs(72 * 3600)).unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn test_get_missing_is_none() {
        let cache = DeviceCache::open_in_memory().unwrap();
        let absent = DeviceIdentity::Udn("uuid:nobody".into());
        assert!(cache.get(&absent).unwrap().is_none());
    }

    #[test]
    fn test_prune_removes_stale() {
        let cache = DeviceCache::open_in_memory().unwrap();
        let mut stale = device("192.168.1.60", "uuid:stale");
        stale.last_seen = Utc::now() - chrono::Duration::hours(48);
        cache.upsert(&stale).unwrap();

        assert_eq!(cache.prune(DEFAULT_MAX_AGE).unwrap(), 1);
        assert!(
            cache
                .list(Duration::from_secs(10 * 365 * 24 * 3600))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.db");
        {
            let cache = DeviceCache::open(&path).unwrap();
            cache.upsert(&device("192.168.1.50", "uuid:RINCON_1")).unwrap();
        }
        let cache = DeviceCache::open(&path).unwrap();
        assert_eq!(cache.list(DEFAULT_MAX_AGE).unwrap().len(), 1);
    }
}
