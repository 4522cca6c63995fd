//! Per-address lease records.
//!
//! One [`LeaseRecord`] exists for every address the pool has ever handed
//! out. Records are never removed; their state, owner, and timestamps are
//! reset as the address moves between clients.
//!
//! A record in [`LeaseState::Bound`] is either:
//!
//! - a *provisional hold* placed by an OFFER (no timestamps), or
//! - a *confirmed lease* placed by an ACK (`lease_start` / `lease_end` set).
//!
//! Expiry is evaluated lazily: a confirmed lease whose end has passed stays
//! `Bound` until the next sweep.

use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};

use crate::address::MacAddr;

/// Whether a client currently holds the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Free,
    Bound,
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "FREE"),
            Self::Bound => write!(f, "BOUND"),
        }
    }
}

/// The lease history of a single pool address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    address: Ipv4Addr,
    client_mac: Option<MacAddr>,
    state: LeaseState,
    lease_start: Option<DateTime<Utc>>,
    lease_end: Option<DateTime<Utc>>,
}

impl LeaseRecord {
    /// Creates a record provisionally held by `mac`.
    pub(crate) fn held(address: Ipv4Addr, mac: MacAddr) -> Self {
        Self {
            address,
            client_mac: Some(mac),
            state: LeaseState::Bound,
            lease_start: None,
            lease_end: None,
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn client_mac(&self) -> Option<MacAddr> {
        self.client_mac
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    pub fn lease_start(&self) -> Option<DateTime<Utc>> {
        self.lease_start
    }

    pub fn lease_end(&self) -> Option<DateTime<Utc>> {
        self.lease_end
    }

    pub fn is_bound(&self) -> bool {
        self.state == LeaseState::Bound
    }

    pub fn is_free(&self) -> bool {
        self.state == LeaseState::Free
    }

    /// Returns true if the record is bound by an offer that was never acknowledged.
    pub fn is_provisional(&self) -> bool {
        self.is_bound() && self.lease_end.is_none()
    }

    /// Returns true if `mac` is the record's current or most recent owner.
    pub fn belongs_to(&self, mac: MacAddr) -> bool {
        self.client_mac == Some(mac)
    }

    /// Returns true if this is a bound lease whose end lies strictly before `now`.
    ///
    /// Provisional holds never expire here; the coordinator times them out.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_bound() && self.lease_end.is_some_and(|end| end < now)
    }

    /// Seconds remaining until `lease_end`, or 0 if expired or unconfirmed.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.lease_end
            .map(|end| (end - now).num_seconds().max(0))
            .unwrap_or(0)
    }

    /// Places a provisional hold for `mac`, clearing any earlier lease times.
    pub(crate) fn hold(&mut self, mac: MacAddr) {
        self.client_mac = Some(mac);
        self.state = LeaseState::Bound;
        self.lease_start = None;
        self.lease_end = None;
    }

    /// Confirms the lease for `mac` from `now` for `duration_seconds`.
    pub(crate) fn bind(&mut self, mac: MacAddr, now: DateTime<Utc>, duration_seconds: u32) {
        self.client_mac = Some(mac);
        self.state = LeaseState::Bound;
        self.set_times(now, duration_seconds);
    }

    /// Restarts the lease clock without touching owner or state.
    pub(crate) fn renew(&mut self, now: DateTime<Utc>, duration_seconds: u32) {
        self.set_times(now, duration_seconds);
    }

    /// Marks the address free. Owner and timestamps are kept as history.
    pub(crate) fn free(&mut self) {
        self.state = LeaseState::Free;
    }

    fn set_times(&mut self, now: DateTime<Utc>, duration_seconds: u32) {
        self.lease_start = Some(now);
        self.lease_end = Some(now + TimeDelta::seconds(i64::from(duration_seconds)));
    }
}
