//! The DORA state machine.
//!
//! [`Coordinator`] turns decoded client messages into lease pool calls and
//! decides which reply, if any, goes back. It keeps a small amount of
//! per-client state (which address was offered, which one is bound) next to
//! the pool and holds that state's lock for the whole transaction, so two
//! messages from one client never interleave.
//!
//! Locks are always taken client state first, then pool. Maintenance in
//! [`Coordinator::tick`] takes the client state lock once per batch of
//! entries rather than for the whole pass.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::address::MacAddr;
use crate::config::Config;
use crate::options::MessageType;
use crate::packet::{ClientMessage, ReplyKind};
use crate::pool::LeasePool;

/// Shortest lease a client can negotiate.
pub const MIN_LEASE_SECONDS: u32 = 60;

/// Client entries examined per acquisition of the client state lock
/// during [`Coordinator::tick`].
pub const TICK_BATCH_SIZE: usize = 256;

/// Where a client is in the DORA exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// An OFFER went out and no REQUEST has arrived yet.
    Offered {
        address: Ipv4Addr,
        offered_at: DateTime<Utc>,
    },
    /// The client holds an acknowledged lease.
    Bound { address: Ipv4Addr },
}

/// The decision for one client message, before wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    /// `yiaddr`; unspecified for NAK and INFORM.
    pub address: Ipv4Addr,
    pub lease_seconds: Option<u32>,
    /// Option 56 text.
    pub message: Option<String>,
}

impl Reply {
    fn offer(address: Ipv4Addr, lease_seconds: u32) -> Self {
        Self {
            kind: ReplyKind::Offer,
            address,
            lease_seconds: Some(lease_seconds),
            message: None,
        }
    }

    fn ack(address: Ipv4Addr, lease_seconds: u32) -> Self {
        Self {
            kind: ReplyKind::Ack,
            address,
            lease_seconds: Some(lease_seconds),
            message: None,
        }
    }

    fn inform() -> Self {
        Self {
            kind: ReplyKind::Ack,
            address: Ipv4Addr::UNSPECIFIED,
            lease_seconds: None,
            message: None,
        }
    }

    fn nak(message: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Nak,
            address: Ipv4Addr::UNSPECIFIED,
            lease_seconds: None,
            message: Some(message.into()),
        }
    }
}

/// What one maintenance pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Maintenance {
    /// Confirmed leases freed by the expiry sweep.
    pub expired_leases: usize,
    /// Unanswered offers whose hold was dropped.
    pub expired_offers: usize,
    /// Bound entries forgotten because the pool reassigned the address.
    pub pruned_clients: usize,
}

pub struct Coordinator {
    config: Arc<Config>,
    pool: LeasePool,
    clients: Mutex<HashMap<MacAddr, ClientState>>,
}

type Clients = HashMap<MacAddr, ClientState>;

impl Coordinator {
    pub fn new(config: Arc<Config>, pool: LeasePool) -> Self {
        Self {
            config,
            pool,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &LeasePool {
        &self.pool
    }

    pub async fn client_state(&self, mac: MacAddr) -> Option<ClientState> {
        self.clients.lock().await.get(&mac).copied()
    }

    /// Processes one client message. `None` means send nothing.
    pub async fn handle(&self, message: &ClientMessage) -> Option<Reply> {
        let mut clients = self.clients.lock().await;

        match message.message_type {
            MessageType::Discover => self.handle_discover(&mut clients, message).await,
            MessageType::Request => self.handle_request(&mut clients, message).await,
            MessageType::Release => {
                self.handle_release(&mut clients, message).await;
                None
            }
            MessageType::Decline => {
                warn!(
                    "DECLINE from {} for {:?}",
                    message.mac, message.requested_address
                );
                None
            }
            MessageType::Inform => {
                info!("INFORM from {}", message.mac);
                Some(Reply::inform())
            }
            other => {
                debug!("Ignoring {} from {}", other, message.mac);
                None
            }
        }
    }

    /// Clamps a client-requested lease time to what this server grants.
    pub fn negotiate_lease_time(&self, requested: Option<u32>) -> u32 {
        let max = self.config.lease_duration_seconds;
        match requested {
            Some(seconds) => seconds.clamp(MIN_LEASE_SECONDS.min(max), max),
            None => max,
        }
    }

    async fn handle_discover(&self, clients: &mut Clients, message: &ClientMessage) -> Option<Reply> {
        let mac = message.mac;
        let lease = self.negotiate_lease_time(message.requested_lease_seconds);

        let Some(address) = self.pool.offer_address(mac).await else {
            warn!("Pool exhausted, cannot offer an address to {}", mac);
            return None;
        };

        clients.insert(
            mac,
            ClientState::Offered {
                address,
                offered_at: self.pool.clock().now(),
            },
        );
        match &message.hostname {
            Some(hostname) => info!("OFFER {} to {} ({})", address, mac, hostname),
            None => info!("OFFER {} to {}", address, mac),
        }
        Some(Reply::offer(address, lease))
    }

    async fn handle_request(&self, clients: &mut Clients, message: &ClientMessage) -> Option<Reply> {
        let mac = message.mac;
        let state = clients.get(&mac).copied();

        if let Some(server_id) = message.server_identifier
            && server_id != self.config.server_ip
        {
            info!("REQUEST from {} is for different server {}", mac, server_id);
            if let Some(ClientState::Offered { address, .. }) = state {
                self.drop_hold(address, mac).await;
                clients.remove(&mac);
            }
            return None;
        }

        let Some(requested) = message.requested_address.or(message.client_address) else {
            return Some(self.nak(clients, mac, "No requested address"));
        };
        let lease = self.negotiate_lease_time(message.requested_lease_seconds);

        match state {
            Some(ClientState::Offered { address, .. }) if address == requested => {
                self.commit(clients, mac, address, lease).await
            }
            Some(ClientState::Offered { address, .. }) => {
                self.drop_hold(address, mac).await;
                Some(self.nak(clients, mac, "Requested address was not offered"))
            }
            Some(ClientState::Bound { address }) if address == requested => {
                match self.pool.find_lease(address).await {
                    Some(record) if record.belongs_to(mac) && record.is_bound() => {
                        self.pool.renew(address, lease).await;
                        info!("ACK {} to {} (renewed)", address, mac);
                        Some(Reply::ack(address, lease))
                    }
                    Some(record) if record.belongs_to(mac) => {
                        self.commit(clients, mac, address, lease).await
                    }
                    _ => Some(self.nak(clients, mac, "Lease is no longer held")),
                }
            }
            Some(ClientState::Bound { .. }) => {
                Some(self.nak(clients, mac, "Requested address does not match lease"))
            }
            None => {
                let owned = self
                    .pool
                    .find_lease(requested)
                    .await
                    .is_some_and(|record| record.belongs_to(mac));
                if owned || self.pool.claim_address(requested, mac).await.is_some() {
                    self.commit(clients, mac, requested, lease).await
                } else {
                    Some(self.nak(clients, mac, "Requested address is not available"))
                }
            }
        }
    }

    async fn handle_release(&self, clients: &mut Clients, message: &ClientMessage) {
        let mac = message.mac;
        let Some(address) = message.client_address.or(message.requested_address) else {
            warn!("RELEASE from {} with no address", mac);
            return;
        };

        match self.pool.find_lease(address).await {
            Some(record) if record.belongs_to(mac) => {
                self.pool.release(address).await;
                clients.remove(&mac);
                info!("RELEASE from {} for {}", mac, address);
            }
            Some(_) => warn!("RELEASE from {} for {} which it does not hold", mac, address),
            None => warn!("RELEASE from {} for unknown address {}", mac, address),
        }
    }

    async fn commit(
        &self,
        clients: &mut Clients,
        mac: MacAddr,
        address: Ipv4Addr,
        lease: u32,
    ) -> Option<Reply> {
        if self.pool.confirm_lease(address, mac, lease).await.is_none() {
            return Some(self.nak(clients, mac, "Requested address is not available"));
        }
        clients.insert(mac, ClientState::Bound { address });
        info!("ACK {} to {} for {}s", address, mac, lease);
        Some(Reply::ack(address, lease))
    }

    fn nak(&self, clients: &mut Clients, mac: MacAddr, reason: &str) -> Reply {
        clients.remove(&mac);
        warn!("NAK to {}: {}", mac, reason);
        Reply::nak(reason)
    }

    /// Releases `address` if it is still provisionally held for `mac`.
    async fn drop_hold(&self, address: Ipv4Addr, mac: MacAddr) -> bool {
        let held = self
            .pool
            .find_lease(address)
            .await
            .is_some_and(|record| record.belongs_to(mac) && record.is_provisional());
        if held {
            self.pool.release(address).await;
        }
        held
    }

    /// Runs the expiry sweep, drops offers older than the offer timeout,
    /// and forgets bound clients whose address went to someone else.
    ///
    /// Client entries are visited from a snapshot, [`TICK_BATCH_SIZE`] at a
    /// time, with the client state lock released between batches. An entry
    /// that changed since the snapshot is left for the next tick.
    pub async fn tick(&self) -> Maintenance {
        let expired_leases = self.pool.sweep_expired().await;

        let now = self.pool.clock().now();
        let timeout = self.config.offer_timeout();
        let mut maintenance = Maintenance {
            expired_leases,
            ..Default::default()
        };

        let snapshot: Vec<(MacAddr, ClientState)> = {
            let clients = self.clients.lock().await;
            clients.iter().map(|(mac, state)| (*mac, *state)).collect()
        };

        for batch in snapshot.chunks(TICK_BATCH_SIZE) {
            {
                let mut clients = self.clients.lock().await;
                for &(mac, state) in batch {
                    if clients.get(&mac) != Some(&state) {
                        continue;
                    }
                    match state {
                        ClientState::Offered {
                            address,
                            offered_at,
                        } if now - offered_at > timeout => {
                            if self.drop_hold(address, mac).await {
                                debug!("Offer of {} to {} timed out", address, mac);
                            }
                            clients.remove(&mac);
                            maintenance.expired_offers += 1;
                        }
                        ClientState::Offered { .. } => {}
                        ClientState::Bound { address } => {
                            let still_owned = self
                                .pool
                                .find_lease(address)
                                .await
                                .is_some_and(|record| record.belongs_to(mac));
                            if !still_owned {
                                clients.remove(&mac);
                                maintenance.pruned_clients += 1;
                            }
                        }
                    }
                }
            }
            tokio::task::yield_now().await;
        }

        if maintenance != Maintenance::default() {
            info!(
                "Maintenance: {} lease(s) expired, {} offer(s) timed out, {} client(s) pruned",
                maintenance.expired_leases, maintenance.expired_offers, maintenance.pruned_clients
            );
        }
        maintenance
    }
}
