#![allow(clippy::too_many_arguments)]

//! # lease-manager
//!
//! `lease-manager` defines a trait `LeaseStore` that provides atomic
//! CRUD over MAC -> IP lease bindings, plus the two implementations the
//! server ships: [`SqliteDb`] for durable storage and [`MemoryStore`]
//! for tests and ephemeral deployments.
//!
//! The [`Allocator`] sits on top of a `LeaseStore` and hands out unique
//! addresses from a bounded range. The store -- not the allocator -- is
//! the authority on conflicts: `set_lease` fails atomically at write
//! time when a MAC or IP is already bound, and the allocator's scan loop
//! simply advances to the next candidate on [`Error::Conflict`].
//!
//! [`SqliteDb`]: crate::sqlite::SqliteDb
//! [`MemoryStore`]: crate::memory::MemoryStore
//! [`Allocator`]: crate::alloc::Allocator
use std::{
    net::Ipv4Addr,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use pnet::util::MacAddr;
use thiserror::Error;

pub mod alloc;
pub mod memory;
pub mod sqlite;

pub use alloc::Allocator;

/// One lease row: a MAC bound to an IP with expiry metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    /// hardware address, at most one lease per MAC
    pub mac: MacAddr,
    /// leased address, at most one lease per IP
    pub ip: Ipv4Addr,
    /// true if created by the allocator's scan, false if set through the
    /// control plane
    pub dynamic: bool,
    /// persistent leases are exempt from every purge
    pub persistent: bool,
    /// past this instant the lease is no longer valid without renewal
    pub lease_end: SystemTime,
    /// hard deadline, reclamation may remove the lease after this
    pub grace_end: SystemTime,
}

impl Lease {
    /// `lease_end` has passed
    pub fn expired(&self, now: SystemTime) -> bool {
        self.lease_end < now
    }

    /// `grace_end` has passed
    pub fn grace_expired(&self, now: SystemTime) -> bool {
        self.grace_end < now
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("no lease found")]
    NotFound,
    #[error("lease conflict: mac or ip is already bound")]
    Conflict,
    #[error("IP range exhausted {from} -> {to}")]
    RangeExhausted { from: Ipv4Addr, to: Ipv4Addr },
    #[error("database error")]
    Db(#[from] sqlx::Error),
    #[error("invalid lease row: {0}")]
    Corrupt(String),
}

/// Atomic lease storage. Every method either fully succeeds or leaves
/// the store unchanged; no cross-operation isolation is promised, so
/// callers must treat "lease disappeared between calls" as a normal
/// outcome.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    async fn get_lease(&self, mac: MacAddr) -> Result<Lease, Error>;

    /// creates a lease; fails with [`Error::Conflict`] if the MAC or the
    /// IP is already present
    async fn set_lease(
        &self,
        mac: MacAddr,
        ip: Ipv4Addr,
        dynamic: bool,
        persistent: bool,
        lease_end: SystemTime,
        grace_end: SystemTime,
    ) -> Result<(), Error>;

    /// updates the timestamps of an existing lease in place, preserving
    /// its IP
    async fn renew_lease(
        &self,
        mac: MacAddr,
        lease_end: SystemTime,
        grace_end: SystemTime,
    ) -> Result<Lease, Error>;

    /// fails with [`Error::NotFound`] when zero rows are affected
    async fn remove_lease(&self, mac: MacAddr) -> Result<(), Error>;

    /// deletes all non-persistent leases whose `lease_end` (and, unless
    /// `ignore_grace`, `grace_end`) precede now; returns rows removed
    async fn purge_expired(&self, ignore_grace: bool) -> Result<u64, Error>;

    async fn list_leases(&self) -> Result<Vec<Lease>, Error>;
}

/// window of (lease_end, grace_end) starting at `now`
pub fn lease_window(
    now: SystemTime,
    lease_duration: Duration,
    grace_period: Duration,
) -> (SystemTime, SystemTime) {
    let lease_end = now + lease_duration;
    (lease_end, lease_end + grace_period)
}

pub(crate) fn print_time(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true)
}
