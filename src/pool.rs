//! Thread-safe handle around a [`Network`].
//!
//! Every operation takes the pool-wide mutex once, runs to completion, and
//! releases it; nothing is awaited while the lock is held. The expiry sweep
//! is the one exception to "one acquisition per call": it re-takes the lock
//! for each batch of [`SWEEP_BATCH_SIZE`] records so client transactions are
//! never stuck behind a sweep of a large pool.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::address::MacAddr;
use crate::clock::Clock;
use crate::lease::LeaseRecord;
use crate::network::{Network, NetworkParams, PoolStats};

/// Records examined per lock acquisition during an expiry sweep.
pub const SWEEP_BATCH_SIZE: usize = 256;

/// Shared lease pool.
///
/// Cloning is cheap; clones operate on the same pool.
///
/// # Example
///
/// ```no_run
/// use std::net::Ipv4Addr;
/// use std::sync::Arc;
/// use dhcpool::{LeasePool, MacAddr, Network, NetworkParams, SystemClock};
///
/// # async fn example() -> dhcpool::Result<()> {
/// let params = NetworkParams {
///     subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
///     gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
///     dns_servers: vec![Ipv4Addr::new(10, 0, 0, 1)],
///     lease_duration_seconds: 3600,
/// };
/// let network = Network::new(Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 99), params)?;
/// let pool = LeasePool::new(network, Arc::new(SystemClock));
///
/// let mac = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
/// if let Some(ip) = pool.offer_address(mac).await {
///     pool.confirm_lease(ip, mac, 3600).await;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LeasePool {
    network: Arc<Mutex<Network>>,
    params: Arc<NetworkParams>,
    clock: Arc<dyn Clock>,
}

impl LeasePool {
    pub fn new(network: Network, clock: Arc<dyn Clock>) -> Self {
        let params = Arc::new(network.params().clone());
        Self {
            network: Arc::new(Mutex::new(network)),
            params,
            clock,
        }
    }

    /// Static network parameters; readable without taking the pool lock.
    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// See [`Network::offer_address`].
    pub async fn offer_address(&self, mac: MacAddr) -> Option<Ipv4Addr> {
        self.network.lock().await.offer_address(mac)
    }

    /// See [`Network::claim_address`].
    pub async fn claim_address(&self, address: Ipv4Addr, mac: MacAddr) -> Option<Ipv4Addr> {
        self.network.lock().await.claim_address(address, mac)
    }

    /// Returns a copy of the record for `address`.
    pub async fn find_lease(&self, address: Ipv4Addr) -> Option<LeaseRecord> {
        self.network.lock().await.find_lease(address).cloned()
    }

    /// Confirms a lease starting now. Returns the updated record, or `None`
    /// if the address was never handed out.
    pub async fn confirm_lease(
        &self,
        address: Ipv4Addr,
        mac: MacAddr,
        duration_seconds: u32,
    ) -> Option<LeaseRecord> {
        let now = self.clock.now();
        self.network
            .lock()
            .await
            .confirm_lease(address, mac, duration_seconds, now)
            .cloned()
    }

    /// Restarts the lease on `address` from now. Returns false if unknown.
    pub async fn renew(&self, address: Ipv4Addr, duration_seconds: u32) -> bool {
        let now = self.clock.now();
        self.network.lock().await.renew(address, duration_seconds, now)
    }

    /// Marks `address` free. Returns false if unknown.
    pub async fn release(&self, address: Ipv4Addr) -> bool {
        self.network.lock().await.release(address)
    }

    /// Frees every confirmed lease that ended before now.
    ///
    /// Returns the number of records freed.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut next = 0;
        let mut freed = 0;

        loop {
            let done = {
                let mut network = self.network.lock().await;
                let (count, resume) = network.sweep_expired_batch(now, next, SWEEP_BATCH_SIZE);
                freed += count;
                next = resume;
                next >= network.len()
            };
            if done {
                break;
            }
            tokio::task::yield_now().await;
        }

        debug!("Expiry sweep freed {} lease(s)", freed);
        freed
    }

    pub async fn stats(&self) -> PoolStats {
        self.network.lock().await.stats()
    }

    /// Returns copies of all records in creation order.
    pub async fn records(&self) -> Vec<LeaseRecord> {
        self.network.lock().await.records().cloned().collect()
    }
}
