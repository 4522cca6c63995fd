//! # dhcpool
//!
//! A DHCPv4 server built around an address-leasing core (RFC 2131 / RFC 2132).
//!
//! ## Features
//!
//! - Sequential range allocation with lazy lease records and exhaustion detection
//! - Address reuse by client identity, then by availability
//! - Full DORA exchange: DISCOVER, OFFER, REQUEST, ACK, NAK, RELEASE, DECLINE, INFORM
//! - INIT-REBOOT recovery for clients whose lease predates a restart
//! - Time-based expiry with an injectable clock
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use dhcpool::{Config, DhcpServer};
//!
//! #[tokio::main]
//! async fn main() -> dhcpool::Result<()> {
//!     let config = Config::load_or_create("config.json").await?;
//!     let server = DhcpServer::new(config).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Network`] - The address pool: allocation, commit, renewal, release, expiry
//! - [`LeasePool`] - Shared, lock-protected handle around a [`Network`]
//! - [`Coordinator`] - Per-client DORA state machine on top of the pool
//! - [`DhcpPacket`] / [`ClientMessage`] - Wire codec and validated requests
//! - [`DhcpServer`] - UDP transport on port 67 and periodic maintenance
//! - [`Config`] - JSON configuration

pub mod address;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lease;
pub mod network;
pub mod options;
pub mod packet;
pub mod pool;
pub mod server;

pub use address::{Address, MacAddr};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use coordinator::{ClientState, Coordinator, Maintenance, Reply};
pub use error::{Error, Result};
pub use lease::{LeaseRecord, LeaseState};
pub use network::{Network, NetworkParams, PoolStats};
pub use options::{DhcpOption, MessageType};
pub use packet::{ClientMessage, DhcpPacket, ReplyKind, ResponseFields};
pub use pool::LeasePool;
pub use server::DhcpServer;
