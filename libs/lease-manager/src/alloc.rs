//! Dynamic address allocation over a [`LeaseStore`].
//!
//! The allocator keeps almost no state of its own: a cursor pointing at
//! the last address handed out. Candidate addresses are offered to the
//! store with `set_lease`, and a [`Error::Conflict`] simply moves the
//! scan to the next address. Exhaustion is detected by wrapping the
//! range twice; between the two wraps expired leases are purged with the
//! grace window ignored, so a full range of dead leases recovers without
//! outside intervention.
use std::{net::Ipv4Addr, time::SystemTime};

use config::Range;
use pnet::util::MacAddr;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use crate::{Error, Lease, LeaseStore, lease_window, print_time};

/// Where the scan is relative to its two permitted wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// walking forward from the cursor
    Scanning,
    /// wrapped to the start of the range once
    WrappedOnce,
    /// wrapped a second time after purging expired leases; the next wrap
    /// means the range is genuinely full
    GraceCleared,
}

#[derive(Debug)]
pub struct Allocator<S> {
    store: S,
    range: Range,
    lease_duration: std::time::Duration,
    grace_period: std::time::Duration,
    /// last address offered, scans resume after it
    cursor: Mutex<Ipv4Addr>,
}

impl<S: LeaseStore> Allocator<S> {
    pub fn new(
        store: S,
        range: Range,
        lease_duration: std::time::Duration,
        grace_period: std::time::Duration,
    ) -> Self {
        // one before `from` so the first scan lands on `from`
        Self::starting_at(store, range, lease_duration, grace_period, prev_ip(range.from()))
    }

    /// Allocator whose scan resumes after `last` instead of at the
    /// start of the range. Scan order is deterministic given the cursor,
    /// so tests can pin it.
    pub fn starting_at(
        store: S,
        range: Range,
        lease_duration: std::time::Duration,
        grace_period: std::time::Duration,
        last: Ipv4Addr,
    ) -> Self {
        Self {
            store,
            range,
            lease_duration,
            grace_period,
            cursor: Mutex::new(last),
        }
    }

    pub fn range(&self) -> Range {
        self.range
    }

    /// Returns the address bound to `mac`, creating a lease if none
    /// exists. `renew` extends the timestamps of a lease whose
    /// `lease_end` or `grace_end` has passed (persistent leases renew
    /// unconditionally); a still-valid lease is returned as is.
    ///
    /// `requested` is the client's preferred address. Honoring it would
    /// let clients steer allocation, so it is noted and ignored.
    pub async fn allocate(
        &self,
        mac: MacAddr,
        renew: bool,
        requested: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, Error> {
        if let Some(ip) = requested {
            trace!(%mac, %ip, "ignoring requested address");
        }
        match self.store.get_lease(mac).await {
            Ok(lease) => self.refresh(lease, renew).await,
            Err(Error::NotFound) => self.scan(mac).await,
            Err(err) => Err(err),
        }
    }

    async fn refresh(&self, lease: Lease, renew: bool) -> Result<Ipv4Addr, Error> {
        let now = SystemTime::now();
        if renew && (lease.expired(now) || lease.grace_expired(now) || lease.persistent) {
            let (lease_end, grace_end) = lease_window(now, self.lease_duration, self.grace_period);
            let renewed = self.store.renew_lease(lease.mac, lease_end, grace_end).await?;
            debug!(mac = %renewed.mac, ip = %renewed.ip, until = %print_time(lease_end), "renewed lease");
            return Ok(renewed.ip);
        }
        Ok(lease.ip)
    }

    /// Walk the range from the cursor until the store accepts a binding.
    /// The cursor lock serializes scans; plain lookups and renewals do
    /// not take it.
    async fn scan(&self, mac: MacAddr) -> Result<Ipv4Addr, Error> {
        let mut cursor = self.cursor.lock().await;
        let (lease_end, grace_end) =
            lease_window(SystemTime::now(), self.lease_duration, self.grace_period);
        let mut state = ScanState::Scanning;
        let mut candidate = *cursor;
        loop {
            candidate = next_ip(candidate);
            if !self.range.contains(candidate) {
                state = match state {
                    ScanState::Scanning => ScanState::WrappedOnce,
                    ScanState::WrappedOnce => {
                        let purged = self.store.purge_expired(true).await?;
                        info!(purged, "range full, purged expired leases ignoring grace");
                        ScanState::GraceCleared
                    }
                    ScanState::GraceCleared => {
                        return Err(Error::RangeExhausted {
                            from: self.range.from(),
                            to: self.range.to(),
                        });
                    }
                };
                candidate = self.range.from();
            }
            *cursor = candidate;
            match self
                .store
                .set_lease(mac, candidate, true, false, lease_end, grace_end)
                .await
            {
                Ok(()) => {
                    debug!(%mac, ip = %candidate, until = %print_time(lease_end), "allocated lease");
                    return Ok(candidate);
                }
                Err(Error::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

fn next_ip(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_add(1))
}

fn prev_ip(ip: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip).wrapping_sub(1))
}
