//! In-memory [`LeaseStore`] used in tests and for ephemeral deployments
//! where losing leases on restart is acceptable.
use std::{collections::HashMap, net::Ipv4Addr, sync::Arc, time::SystemTime};

use async_trait::async_trait;
use pnet::util::MacAddr;
use tokio::sync::Mutex;

use crate::{Error, Lease, LeaseStore};

/// One mutex covers the whole map so the MAC and IP uniqueness checks in
/// `set_lease` happen atomically with the insert.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<MacAddr, Lease>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn get_lease(&self, mac: MacAddr) -> Result<Lease, Error> {
        self.inner
            .lock()
            .await
            .get(&mac)
            .copied()
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
        let mut leases = self.inner.lock().await;
        if leases.contains_key(&mac) || leases.values().any(|lease| lease.ip == ip) {
            return Err(Error::Conflict);
        }
        leases.insert(
            mac,
            Lease {
                mac,
                ip,
                dynamic,
                persistent,
                lease_end,
                grace_end,
            },
        );
        Ok(())
    }

    async fn renew_lease(
        &self,
        mac: MacAddr,
        lease_end: SystemTime,
        grace_end: SystemTime,
    ) -> Result<Lease, Error> {
        let mut leases = self.inner.lock().await;
        let lease = leases.get_mut(&mac).ok_or(Error::NotFound)?;
        lease.lease_end = lease_end;
        lease.grace_end = grace_end;
        Ok(*lease)
    }

    async fn remove_lease(&self, mac: MacAddr) -> Result<(), Error> {
        self.inner
            .lock()
            .await
            .remove(&mac)
            .map(|_| ())
            .ok_or(Error::NotFound)
    }

    async fn purge_expired(&self, ignore_grace: bool) -> Result<u64, Error> {
        let now = SystemTime::now();
        let mut leases = self.inner.lock().await;
        let before = leases.len();
        leases.retain(|_, lease| {
            lease.persistent || !lease.expired(now) || (!ignore_grace && !lease.grace_expired(now))
        });
        Ok((before - leases.len()) as u64)
    }

    async fn list_leases(&self) -> Result<Vec<Lease>, Error> {
        let leases = self.inner.lock().await;
        let mut all = leases.values().copied().collect::<Vec<_>>();
        all.sort_by_key(|lease| u32::from(lease.ip));
        Ok(all)
    }
}
