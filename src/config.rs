use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::address::Address;
use crate::error::{Error, Result};
use crate::network::{Network, NetworkParams};

const DEFAULT_OFFER_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 30;

/// Upper bound for the timer settings, matching the 32-bit lease fields.
const MAX_TIMER_SECONDS: u64 = u32::MAX as u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub server_ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_duration_seconds: u32,
    /// T1; half the lease when unset.
    #[serde(default)]
    pub renewal_time_seconds: Option<u32>,
    /// T2; seven eighths of the lease when unset.
    #[serde(default)]
    pub rebinding_time_seconds: Option<u32>,
    /// How long an unanswered OFFER keeps its address held.
    #[serde(default = "default_offer_timeout")]
    pub offer_timeout_seconds: u64,
    /// Period of the expiry sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_offer_timeout() -> u64 {
    DEFAULT_OFFER_TIMEOUT_SECONDS
}

fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECONDS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 1, 1),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 200),
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            lease_duration_seconds: 86400,
            renewal_time_seconds: None,
            rebinding_time_seconds: None,
            offer_timeout_seconds: DEFAULT_OFFER_TIMEOUT_SECONDS,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
        }
    }
}

impl Config {
    /// Reads and validates the config at `path`, writing the defaults there
    /// first if the file does not exist.
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if tokio::fs::try_exists(path).await? {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if Address::from(self.range_start) > Address::from(self.range_end) {
            return Err(Error::InvalidRange {
                start: self.range_start,
                end: self.range_end,
            });
        }

        if self.contains(self.server_ip) {
            return Err(Error::InvalidConfig(
                "server_ip must not be within the address range".to_string(),
            ));
        }

        if let Some(gateway) = self.gateway
            && self.contains(gateway)
        {
            return Err(Error::InvalidConfig(
                "gateway must not be within the address range".to_string(),
            ));
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if let (Some(renewal), Some(rebinding)) =
            (self.renewal_time_seconds, self.rebinding_time_seconds)
            && renewal > rebinding
        {
            return Err(Error::InvalidConfig(
                "renewal_time_seconds must not exceed rebinding_time_seconds".to_string(),
            ));
        }

        if self.offer_timeout_seconds == 0 {
            return Err(Error::InvalidConfig(
                "offer_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "sweep_interval_seconds must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("offer_timeout_seconds", self.offer_timeout_seconds),
            ("sweep_interval_seconds", self.sweep_interval_seconds),
        ] {
            if value > MAX_TIMER_SECONDS {
                return Err(Error::InvalidConfig(format!(
                    "{} must not exceed {}",
                    name, MAX_TIMER_SECONDS
                )));
            }
        }

        Ok(())
    }

    /// Returns true if `ip` lies inside `range_start..=range_end`.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let address = Address::from(ip);
        address >= Address::from(self.range_start) && address <= Address::from(self.range_end)
    }

    pub fn pool_size(&self) -> u64 {
        Address::span(self.range_start.into(), self.range_end.into())
    }

    pub fn network_params(&self) -> NetworkParams {
        NetworkParams {
            subnet_mask: self.subnet_mask,
            gateway: self.gateway,
            dns_servers: self.dns_servers.clone(),
            lease_duration_seconds: self.lease_duration_seconds,
        }
    }

    /// Builds an empty pool over the configured range.
    pub fn build_network(&self) -> Result<Network> {
        Network::new(self.range_start, self.range_end, self.network_params())
    }

    /// How long an unanswered OFFER keeps its address.
    ///
    /// Values too large for a [`TimeDelta`] saturate to [`TimeDelta::MAX`]
    /// so an offer is never timed out early.
    pub fn offer_timeout(&self) -> TimeDelta {
        i64::try_from(self.offer_timeout_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    /// T1 for a lease of `lease_seconds`, never longer than the lease.
    pub fn renewal_time(&self, lease_seconds: u32) -> u32 {
        self.renewal_time_seconds
            .unwrap_or(lease_seconds / 2)
            .min(lease_seconds)
    }

    /// T2 for a lease of `lease_seconds`, never longer than the lease.
    pub fn rebinding_time(&self, lease_seconds: u32) -> u32 {
        let default = (u64::from(lease_seconds) * 7 / 8) as u32;
        self.rebinding_time_seconds
            .unwrap_or(default)
            .min(lease_seconds)
    }
}
