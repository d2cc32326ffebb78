//! SQLite-backed [`LeaseStore`]. Uniqueness on both the MAC primary key
//! and the IP column is enforced by the schema, so a failed insert is
//! the conflict-detection mechanism, not a pre-check.
use std::{net::Ipv4Addr, str::FromStr, time::SystemTime};

use async_trait::async_trait;
use pnet::util::MacAddr;
use sqlx::{
    ConnectOptions, Row,
    sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow},
};
use tracing::trace;

use crate::{Error, Lease, LeaseStore};

#[derive(Debug)]
pub struct SqliteDb {
    inner: SqlitePool,
}

impl Clone for SqliteDb {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl SqliteDb {
    pub async fn new(uri: impl AsRef<str>) -> Result<Self, sqlx::Error> {
        let mut opts = SqliteConnectOptions::from_str(uri.as_ref())?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        // make sqlite log queries at trace level so we don't get a bloated log on `info`
        opts.log_statements(tracing::log::LevelFilter::Trace);

        let inner = SqlitePool::connect_with(opts).await?;
        sqlx::migrate!("../../migrations").run(&inner).await?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl LeaseStore for SqliteDb {
    async fn get_lease(&self, mac: MacAddr) -> Result<Lease, Error> {
        let mac = mac.to_string();
        sqlx::query("SELECT * FROM leases WHERE mac = ?1")
            .bind(&mac)
            .fetch_optional(&self.inner)
            .await?
            .map(util::row_to_lease)
            .transpose()?
            .ok_or(Error::NotFound)
    }

    async fn set_lease(
        &self,
        mac: MacAddr,
        ip: Ipv4Addr,
        dynamic: bool,
        persistent: bool,
        lease_end: SystemTime,
        grace_end: SystemTime,
    ) -> Result<(), Error> {
        let res = sqlx::query(
            r#"INSERT INTO leases
                (mac, ip, dynamic, persistent, lease_end, grace_end)
            VALUES
                (?1, ?2, ?3, ?4, ?5, ?6)"#,
        )
        .bind(mac.to_string())
        .bind(u32::from(ip) as i64)
        .bind(dynamic)
        .bind(persistent)
        .bind(util::systime_epoch(lease_end))
        .bind(util::systime_epoch(grace_end))
        .execute(&self.inner)
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(err) if util::is_unique_violation(&err) => {
                trace!(%mac, %ip, "insert hit a uniqueness constraint");
                Err(Error::Conflict)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn renew_lease(
        &self,
        mac: MacAddr,
        lease_end: SystemTime,
        grace_end: SystemTime,
    ) -> Result<Lease, Error> {
        let mac_str = mac.to_string();
        let end = util::systime_epoch(lease_end);
        let grace = util::systime_epoch(grace_end);

        // TRANSACTION START
        let mut tx = self.inner.begin().await?;
        let row = sqlx::query("SELECT * FROM leases WHERE mac = ?1")
            .bind(&mac_str)
            .fetch_optional(&mut tx)
            .await?;
        let mut lease = match row {
            Some(row) => util::row_to_lease(row)?,
            None => {
                tx.rollback().await?;
                return Err(Error::NotFound);
            }
        };
        sqlx::query("UPDATE leases SET lease_end = ?2, grace_end = ?3 WHERE mac = ?1")
            .bind(&mac_str)
            .bind(end)
            .bind(grace)
            .execute(&mut tx)
            .await?;
        tx.commit().await?;
        // TRANSACTION COMMIT

        lease.lease_end = lease_end;
        lease.grace_end = grace_end;
        Ok(lease)
    }

    async fn remove_lease(&self, mac: MacAddr) -> Result<(), Error> {
        let res = sqlx::query("DELETE FROM leases WHERE mac = ?1")
            .bind(mac.to_string())
            .execute(&self.inner)
            .await?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    async fn purge_expired(&self, ignore_grace: bool) -> Result<u64, Error> {
        let now = util::systime_epoch(SystemTime::now());
        let res = if ignore_grace {
            // we need ips
            sqlx::query("DELETE FROM leases WHERE lease_end < ?1 AND NOT persistent")
                .bind(now)
                .execute(&self.inner)
                .await?
        } else {
            sqlx::query(
                "DELETE FROM leases WHERE lease_end < ?1 AND grace_end < ?1 AND NOT persistent",
            )
            .bind(now)
            .execute(&self.inner)
            .await?
        };
        Ok(res.rows_affected())
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, Error> {
        sqlx::query("SELECT * FROM leases ORDER BY ip")
            .fetch_all(&self.inner)
            .await?
            .into_iter()
            .map(util::row_to_lease)
            .collect()
    }
}

mod util {
    use std::time::Duration;

    use super::*;

    /// get secs as i64 (for use in sqlite) from epoch to `time`
    pub fn systime_epoch(time: SystemTime) -> i64 {
        time.duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as i64
    }

    pub fn to_systime(time: i64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(time.max(0) as u64)
    }

    /// sqlite reports constraint violations in the error message; the
    /// driver has no typed variant for them
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(
            err,
            sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed")
        )
    }

    pub fn row_to_lease(row: SqliteRow) -> Result<Lease, Error> {
        let mac: String = row.try_get("mac")?;
        let mac = mac
            .parse::<MacAddr>()
            .map_err(|err| Error::Corrupt(format!("bad mac {mac:?}: {err:?}")))?;
        let ip: i64 = row.try_get("ip")?;
        Ok(Lease {
            mac,
            ip: Ipv4Addr::from(ip as u32),
            dynamic: row.try_get("dynamic")?,
            persistent: row.try_get("persistent")?,
            lease_end: to_systime(row.try_get("lease_end")?),
            grace_end: to_systime(row.try_get("grace_end")?),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const MAC_A: MacAddr = MacAddr(0x00, 0x11, 0x22, 0x33, 0x44, 0x55);
    const MAC_B: MacAddr = MacAddr(0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb);

    async fn mem_db() -> SqliteDb {
        SqliteDb::new("sqlite::memory:").await.expect("open db")
    }

    fn future() -> (SystemTime, SystemTime) {
        let end = SystemTime::now() + Duration::from_secs(60);
        (end, end + Duration::from_secs(30))
    }

    fn past() -> (SystemTime, SystemTime) {
        let end = SystemTime::now() - Duration::from_secs(60);
        (end, end - Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let db = mem_db().await;
        let (end, grace) = future();
        let ip = Ipv4Addr::new(10, 0, 20, 50);
        db.set_lease(MAC_A, ip, true, false, end, grace)
            .await
            .expect("set");

        let lease = db.get_lease(MAC_A).await.expect("get");
        assert_eq!(lease.mac, MAC_A);
        assert_eq!(lease.ip, ip);
        assert!(lease.dynamic);
        assert!(!lease.persistent);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let db = mem_db().await;
        assert!(matches!(db.get_lease(MAC_A).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_set_conflicts_leave_store_unchanged() {
        let db = mem_db().await;
        let (end, grace) = future();
        db.set_lease(MAC_A, Ipv4Addr::new(10, 0, 20, 50), true, false, end, grace)
            .await
            .expect("first set");
        let before = db.list_leases().await.expect("list");

        // same mac, different ip
        let res = db
            .set_lease(MAC_A, Ipv4Addr::new(10, 0, 20, 51), true, false, end, grace)
            .await;
        assert!(matches!(res, Err(Error::Conflict)));

        // different mac, same ip
        let res = db
            .set_lease(MAC_B, Ipv4Addr::new(10, 0, 20, 50), true, false, end, grace)
            .await;
        assert!(matches!(res, Err(Error::Conflict)));

        let after = db.list_leases().await.expect("list");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_renew_updates_in_place() {
        let db = mem_db().await;
        let (end, grace) = future();
        let ip = Ipv4Addr::new(10, 0, 20, 50);
        db.set_lease(MAC_A, ip, true, false, end, grace)
            .await
            .expect("set");

        let new_end = SystemTime::now() + Duration::from_secs(600);
        let new_grace = new_end + Duration::from_secs(60);
        let lease = db.renew_lease(MAC_A, new_end, new_grace).await.expect("renew");
        assert_eq!(lease.ip, ip);

        let stored = db.get_lease(MAC_A).await.expect("get");
        // second granularity in storage
        assert!(stored.lease_end > end);
    }

    #[tokio::test]
    async fn test_renew_unknown_mac() {
        let db = mem_db().await;
        let (end, grace) = future();
        let res = db.renew_lease(MAC_A, end, grace).await;
        assert!(matches!(res, Err(Error::NotFound)));
        assert!(db.list_leases().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_remove_twice() {
        let db = mem_db().await;
        let (end, grace) = future();
        db.set_lease(MAC_A, Ipv4Addr::new(10, 0, 20, 50), true, false, end, grace)
            .await
            .expect("set");

        db.remove_lease(MAC_A).await.expect("first remove");
        assert!(matches!(db.remove_lease(MAC_A).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_purge_respects_grace() {
        let db = mem_db().await;
        // expired lease but grace end in the future
        let end = SystemTime::now() - Duration::from_secs(60);
        let grace = SystemTime::now() + Duration::from_secs(60);
        db.set_lease(MAC_A, Ipv4Addr::new(10, 0, 20, 50), true, false, end, grace)
            .await
            .expect("set");

        assert_eq!(db.purge_expired(false).await.expect("purge"), 0);
        // under exhaustion pressure the grace window is ignored
        assert_eq!(db.purge_expired(true).await.expect("purge"), 1);
    }

    #[tokio::test]
    async fn test_purge_expired_lease() {
        let db = mem_db().await;
        let (end, grace) = past();
        db.set_lease(MAC_A, Ipv4Addr::new(10, 0, 20, 50), true, false, end, grace)
            .await
            .expect("set");

        assert_eq!(db.purge_expired(false).await.expect("purge"), 1);
        assert!(matches!(db.get_lease(MAC_A).await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_persistent_never_purged() {
        let db = mem_db().await;
        let (end, grace) = past();
        db.set_lease(MAC_A, Ipv4Addr::new(10, 0, 20, 50), false, true, end, grace)
            .await
            .expect("set");

        assert_eq!(db.purge_expired(false).await.expect("purge"), 0);
        assert_eq!(db.purge_expired(true).await.expect("purge"), 0);
        assert!(db.get_lease(MAC_A).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_ordered_by_ip() {
        let db = mem_db().await;
        let (end, grace) = future();
        db.set_lease(MAC_B, Ipv4Addr::new(10, 0, 20, 51), true, false, end, grace)
            .await
            .expect("set b");
        db.set_lease(MAC_A, Ipv4Addr::new(10, 0, 20, 50), true, false, end, grace)
            .await
            .expect("set a");

        let leases = db.list_leases().await.expect("list");
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].ip, Ipv4Addr::new(10, 0, 20, 50));
        assert_eq!(leases[1].ip, Ipv4Addr::new(10, 0, 20, 51));
    }
}
