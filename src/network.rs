//! The address pool: allocation, lease commit/renew/release, and expiry.
//!
//! [`Network`] is a plain state machine with no locking and no clock of its
//! own; every time-dependent call takes `now`. The shared, lock-protected
//! handle used by the server is [`LeasePool`](crate::LeasePool).
//!
//! # Allocation order
//!
//! [`Network::offer_address`] tries, in order:
//!
//! 1. the record already tagged with the client's MAC (free or bound),
//! 2. the oldest free record,
//! 3. the next never-used address from the range cursor.
//!
//! Records are created lazily as addresses are first handed out and are
//! never removed, so a large range costs nothing until it is used.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};

use crate::address::{Address, MacAddr};
use crate::error::{Error, Result};
use crate::lease::LeaseRecord;

/// Static parameters handed to every client along with its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    pub subnet_mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_duration_seconds: u32,
}

/// A point-in-time summary of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of addresses in the configured range.
    pub capacity: u64,
    /// Number of addresses that have ever been handed out.
    pub records: usize,
    pub bound: usize,
    pub free: usize,
    pub exhausted: bool,
}

/// The allocation authority for one address range.
#[derive(Debug)]
pub struct Network {
    range_start: Address,
    range_end: Address,
    /// Records in creation order.
    records: Vec<LeaseRecord>,
    by_address: HashMap<Address, usize>,
    /// Most recent record tagged with each MAC.
    by_mac: HashMap<MacAddr, usize>,
    /// Indices of free records; iteration order is creation order.
    free: BTreeSet<usize>,
    cursor: Address,
    exhausted: bool,
    params: NetworkParams,
}

impl Network {
    /// Creates an empty pool over the inclusive range `range_start..=range_end`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRange`] if `range_start > range_end`.
    pub fn new(range_start: Ipv4Addr, range_end: Ipv4Addr, params: NetworkParams) -> Result<Self> {
        let start = Address::from(range_start);
        let end = Address::from(range_end);
        if start > end {
            return Err(Error::InvalidRange {
                start: range_start,
                end: range_end,
            });
        }

        Ok(Self {
            range_start: start,
            range_end: end,
            records: Vec::new(),
            by_address: HashMap::new(),
            by_mac: HashMap::new(),
            free: BTreeSet::new(),
            cursor: start,
            exhausted: false,
            params,
        })
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn range_start(&self) -> Ipv4Addr {
        self.range_start.into()
    }

    pub fn range_end(&self) -> Ipv4Addr {
        self.range_end.into()
    }

    /// Returns true once every address in the range has been handed out at least once.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Returns true if `address` lies inside the configured range.
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        let address = Address::from(address);
        address >= self.range_start && address <= self.range_end
    }

    /// Picks an address to offer to `mac` and provisionally holds it.
    ///
    /// Returns `None` when the client has no record, no record is free, and
    /// the range cursor has passed the end of the range.
    ///
    /// Reusing the client's own FREE record clears its old lease times.
    pub fn offer_address(&mut self, mac: MacAddr) -> Option<Ipv4Addr> {
        if let Some(&index) = self.by_mac.get(&mac) {
            if self.records[index].is_free() {
                self.free.remove(&index);
                self.records[index].hold(mac);
            }
            return Some(self.records[index].address());
        }

        if let Some(index) = self.free.pop_first() {
            self.retag(index, mac);
            self.records[index].hold(mac);
            return Some(self.records[index].address());
        }

        let candidate = self.next_fresh()?;
        Some(self.push_held(candidate, mac))
    }

    /// Brings a specific in-range address into the pool for `mac`.
    ///
    /// Used when a client asks for an address it was never offered by this
    /// pool (INIT-REBOOT, or a lease granted before a server restart).
    /// Succeeds only if the address is unclaimed, free, or already tagged
    /// with `mac`, and `mac` does not own a different record.
    pub fn claim_address(&mut self, address: Ipv4Addr, mac: MacAddr) -> Option<Ipv4Addr> {
        if !self.contains(address) {
            return None;
        }

        let candidate = Address::from(address);
        let owned = self.by_mac.get(&mac).copied();

        match self.by_address.get(&candidate).copied() {
            Some(index) if owned == Some(index) => {
                if self.records[index].is_free() {
                    self.free.remove(&index);
                    self.records[index].hold(mac);
                }
                Some(address)
            }
            Some(index) if owned.is_none() && self.records[index].is_free() => {
                self.free.remove(&index);
                self.retag(index, mac);
                self.records[index].hold(mac);
                Some(address)
            }
            None if owned.is_none() => Some(self.push_held(candidate, mac)),
            _ => None,
        }
    }

    /// Returns the record for `address`, if the pool ever handed it out.
    pub fn find_lease(&self, address: Ipv4Addr) -> Option<&LeaseRecord> {
        self.index_of(address).map(|index| &self.records[index])
    }

    /// Confirms a lease on `address` for `mac` starting at `now`.
    ///
    /// The caller is responsible for checking that `mac` is entitled to the
    /// address. If `mac` was bound to a different record, that record is
    /// freed so a client never holds two addresses.
    pub fn confirm_lease(
        &mut self,
        address: Ipv4Addr,
        mac: MacAddr,
        duration_seconds: u32,
        now: DateTime<Utc>,
    ) -> Option<&LeaseRecord> {
        let index = self.index_of(address)?;
        self.retag(index, mac);
        self.free.remove(&index);
        self.records[index].bind(mac, now, duration_seconds);
        Some(&self.records[index])
    }

    /// Restarts the lease on `address` at `now` for `duration_seconds`.
    ///
    /// The new end replaces the old one even if it is earlier. Owner and
    /// state are left alone. Returns false if the address is unknown.
    pub fn renew(&mut self, address: Ipv4Addr, duration_seconds: u32, now: DateTime<Utc>) -> bool {
        match self.index_of(address) {
            Some(index) => {
                self.records[index].renew(now, duration_seconds);
                true
            }
            None => false,
        }
    }

    /// Marks `address` free, keeping its last owner for identity reuse.
    ///
    /// Returns false if the address is unknown.
    pub fn release(&mut self, address: Ipv4Addr) -> bool {
        let Some(index) = self.index_of(address) else {
            return false;
        };
        if self.records[index].is_bound() {
            self.records[index].free();
            self.free.insert(index);
        }
        true
    }

    /// Frees every confirmed lease whose end lies before `now`.
    ///
    /// Returns the number of records freed.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        self.sweep_expired_batch(now, 0, self.records.len()).0
    }

    /// Sweeps at most `limit` records starting at index `start`.
    ///
    /// Returns the number of records freed and the index to resume from.
    /// The sweep is complete once the resume index reaches [`len`](Self::len).
    pub fn sweep_expired_batch(
        &mut self,
        now: DateTime<Utc>,
        start: usize,
        limit: usize,
    ) -> (usize, usize) {
        let start = start.min(self.records.len());
        let end = start.saturating_add(limit).min(self.records.len());
        let mut freed = 0;

        for (offset, record) in self.records[start..end].iter_mut().enumerate() {
            if record.is_expired_at(now) {
                record.free();
                self.free.insert(start + offset);
                freed += 1;
            }
        }

        (freed, end)
    }

    /// Number of records (addresses handed out at least once).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over all records in creation order.
    pub fn records(&self) -> impl Iterator<Item = &LeaseRecord> {
        self.records.iter()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: Address::span(self.range_start, self.range_end),
            records: self.records.len(),
            bound: self.records.len() - self.free.len(),
            free: self.free.len(),
            exhausted: self.exhausted,
        }
    }

    fn index_of(&self, address: Ipv4Addr) -> Option<usize> {
        self.by_address.get(&Address::from(address)).copied()
    }

    /// Advances the cursor and returns the next address without a record.
    fn next_fresh(&mut self) -> Option<Address> {
        while !self.exhausted {
            let candidate = self.cursor;
            match candidate.next().filter(|next| *next <= self.range_end) {
                Some(next) => self.cursor = next,
                None => self.exhausted = true,
            }

            if !self.by_address.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    fn push_held(&mut self, address: Address, mac: MacAddr) -> Ipv4Addr {
        let index = self.records.len();
        self.records.push(LeaseRecord::held(address.into(), mac));
        self.by_address.insert(address, index);
        self.by_mac.insert(mac, index);
        address.into()
    }

    /// Points the MAC index for `mac` at `index`.
    ///
    /// Drops the index entry of the record's previous owner, and frees any
    /// other record `mac` was bound to.
    fn retag(&mut self, index: usize, mac: MacAddr) {
        if let Some(previous) = self.records[index].client_mac()
            && previous != mac
            && self.by_mac.get(&previous) == Some(&index)
        {
            self.by_mac.remove(&previous);
        }

        if let Some(other) = self.by_mac.insert(mac, index)
            && other != index
            && self.records[other].is_bound()
        {
            self.records[other].free();
            self.free.insert(other);
        }
    }
}
