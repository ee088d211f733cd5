//! The lifecycle of the port mapping negotiated with the gateway.
//!
//! ```text
//! Unmapped -> Requesting -> Mapped(leased) -> Renewing -> Mapped(..)
//!                        -> Mapped(permanent)
//! Mapped(..) -> Deleting -> Unmapped
//! ```
pub mod manager;

pub use manager::MappingManager;

use crate::error::PortMapError;
use crate::standard::wan_client::WanService;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PortMappingProtocol {
    UDP,
    TCP,
}

impl Display for PortMappingProtocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PortMappingProtocol::UDP => write!(f, "UDP"),
            PortMappingProtocol::TCP => write!(f, "TCP"),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MappingState {
    Unmapped,
    Requesting,
    Mapped { permanent: bool },
    Renewing,
    Deleting,
}

/// An active mapping. Only the [`MappingManager`] creates or mutates these; everyone else
/// receives clones.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Mapping {
    pub internal_addr: SocketAddrV4,
    /// Unknown when the gateway would not report its public address
    pub external_ip: Option<Ipv4Addr>,
    pub external_port: u16,
    pub protocol: PortMappingProtocol,
    /// Zero for permanent mappings
    pub lease_seconds: u32,
    /// When the gateway last accepted this mapping
    pub refreshed_at: Instant,
    pub expires_at: Option<Instant>,
    pub permanent: bool,
    pub gateway: Ipv4Addr,
    pub service: WanService,
}

impl Mapping {
    pub fn external_addr(&self) -> Option<SocketAddrV4> {
        self.external_ip
            .map(|ip| SocketAddrV4::new(ip, self.external_port))
    }

    /// Renewal happens halfway through the lease. Permanent mappings are never renewed
    pub fn renew_at(&self) -> Option<Instant> {
        if self.permanent {
            return None;
        }

        Some(self.refreshed_at + Duration::from_secs(u64::from(self.lease_seconds)) / 2)
    }

    pub(crate) fn lease_granted(&mut self, lease_seconds: u32, now: Instant) {
        self.lease_seconds = lease_seconds;
        self.permanent = lease_seconds == 0;
        self.refreshed_at = now;
        self.expires_at = if self.permanent {
            None
        } else {
            Some(now + Duration::from_secs(u64::from(lease_seconds)))
        };
    }
}

#[derive(Debug, Clone)]
pub enum MappingEvent {
    Created(Mapping),
    Renewed(Mapping),
    /// The lease ran out before a renewal succeeded
    Lost {
        mapping: Mapping,
        error: PortMapError,
    },
    Deleted(Mapping),
}
