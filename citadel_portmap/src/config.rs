//! Tunables for discovery and mapping negotiation.
//!
//! Every field has a default suitable for residential routers, and the whole struct can be
//! embedded in the daemon's own configuration file. Durations are encoded as milliseconds.
//!
//! ```rust
//! use citadel_portmap::config::PortMapConfig;
//! use std::time::Duration;
//!
//! let config = PortMapConfig::default()
//!     .with_lease_duration(7200)
//!     .with_discovery_window(Duration::from_millis(500));
//! ```
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

pub const SSDP_MULTICAST_ADDR: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900);
pub const IGD_V1_SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";
pub const IGD_V2_SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:2";
pub const DEFAULT_LEASE_DURATION_SECS: u32 = 60 * 60;
pub const DEFAULT_MAPPING_DESCRIPTION: &str = "citadel";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortMapConfig {
    /// Destination of M-SEARCH datagrams
    pub ssdp_addr: SocketAddr,
    /// Tried in order; the next one is only sent when the previous yields nothing
    pub search_targets: Vec<String>,
    /// Value of the `MX` header, in seconds
    pub mx: u8,
    #[serde(with = "serde_millis")]
    pub discovery_window: Duration,
    /// Deadline applied when a mapping request has to probe first
    #[serde(with = "serde_millis")]
    pub probe_timeout: Duration,
    #[serde(with = "serde_millis")]
    pub description_timeout: Duration,
    #[serde(with = "serde_millis")]
    pub soap_timeout: Duration,
    /// Initial lease requested from the gateway, in seconds. Zero requests a permanent mapping
    pub lease_duration: u32,
    #[serde(with = "serde_millis")]
    pub renewal_retry_interval: Duration,
    pub mapping_description: String,
    /// Preferred gateway. Also receives a unicast M-SEARCH
    pub gateway_hint: Option<Ipv4Addr>,
    pub max_transport_retries: usize,
    #[serde(with = "serde_millis")]
    pub transport_retry_backoff: Duration,
    /// Logs SOAP request and response bodies through the diagnostics sink
    pub verbose_logs: bool,
    pub disable_upnp: bool,
}

impl Default for PortMapConfig {
    fn default() -> Self {
        Self {
            ssdp_addr: SocketAddr::V4(SSDP_MULTICAST_ADDR),
            search_targets: vec![
                IGD_V1_SEARCH_TARGET.to_string(),
                IGD_V2_SEARCH_TARGET.to_string(),
            ],
            mx: 1,
            discovery_window: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(3),
            description_timeout: Duration::from_secs(5),
            soap_timeout: Duration::from_secs(5),
            lease_duration: DEFAULT_LEASE_DURATION_SECS,
            renewal_retry_interval: Duration::from_secs(30),
            mapping_description: DEFAULT_MAPPING_DESCRIPTION.to_string(),
            gateway_hint: None,
            max_transport_retries: 2,
            transport_retry_backoff: Duration::from_millis(250),
            verbose_logs: false,
            disable_upnp: false,
        }
    }
}

impl PortMapConfig {
    pub fn with_ssdp_addr(mut self, addr: SocketAddr) -> Self {
        self.ssdp_addr = addr;
        self
    }

    pub fn with_discovery_window(mut self, window: Duration) -> Self {
        self.discovery_window = window;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_lease_duration(mut self, seconds: u32) -> Self {
        self.lease_duration = seconds;
        self
    }

    pub fn with_renewal_retry_interval(mut self, interval: Duration) -> Self {
        self.renewal_retry_interval = interval;
        self
    }

    pub fn with_gateway_hint(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway_hint = Some(gateway);
        self
    }

    pub fn with_mapping_description<T: Into<String>>(mut self, description: T) -> Self {
        self.mapping_description = description.into();
        self
    }

    pub fn with_max_transport_retries(mut self, retries: usize) -> Self {
        self.max_transport_retries = retries;
        self
    }

    pub fn with_verbose_logs(mut self, verbose: bool) -> Self {
        self.verbose_logs = verbose;
        self
    }

    pub fn with_disable_upnp(mut self, disable: bool) -> Self {
        self.disable_upnp = disable;
        self
    }

    /// Backoff before the `attempt`th orchestration retry (zero-based)
    pub(crate) fn backoff_for(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(8);
        self.transport_retry_backoff.saturating_mul(factor)
    }
}
