//! Selection of the WAN connection service to drive, and the client bound to it.
//!
//! The set of services we can drive is closed: WANIPConnection v2, WANIPConnection v1 and
//! WANPPPConnection v1. The choice is made once per device description, by priority and then
//! by depth-first position in the tree, and stored as a [`WanService`] tag on the client.
use crate::diagnostics::{DiagnosticKind, DiagnosticsSink};
use crate::error::PortMapError;
use crate::standard::device_description::{fetch_device_tree, RootDescription, Service};
use crate::standard::soap::{
    AddPortMapping, DeletePortMapping, GetExternalIPAddress, SoapTransport,
};
use crate::standard::ssdp::DiscoveryResponse;
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::net::Ipv4Addr;
use std::time::Duration;

const WAN_CONNECTION_DEVICE: &str = "WANConnectionDevice";

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum WanService {
    WanIpConnection2,
    WanIpConnection1,
    WanPppConnection1,
}

impl WanService {
    /// Most preferred first
    pub const PRIORITY: [WanService; 3] = [
        WanService::WanIpConnection2,
        WanService::WanIpConnection1,
        WanService::WanPppConnection1,
    ];

    pub fn urn(&self) -> &'static str {
        match self {
            WanService::WanIpConnection2 => "urn:schemas-upnp-org:service:WANIPConnection:2",
            WanService::WanIpConnection1 => "urn:schemas-upnp-org:service:WANIPConnection:1",
            WanService::WanPppConnection1 => "urn:schemas-upnp-org:service:WANPPPConnection:1",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WanService::WanIpConnection2 => "WANIPConnection2",
            WanService::WanIpConnection1 => "WANIPConnection1",
            WanService::WanPppConnection1 => "WANPPPConnection1",
        }
    }

    pub fn from_urn(urn: &str) -> Option<Self> {
        Self::PRIORITY
            .into_iter()
            .find(|service| service.urn() == urn.trim())
    }
}

impl Display for WanService {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The port mapping capabilities shared by every supported WAN connection service
#[async_trait]
pub trait PortMapper: Send + Sync {
    fn service(&self) -> WanService;
    fn gateway(&self) -> Ipv4Addr;
    async fn add_port_mapping(&self, request: &AddPortMapping) -> Result<(), PortMapError>;
    async fn delete_port_mapping(&self, request: &DeletePortMapping) -> Result<(), PortMapError>;
    async fn get_external_ip_address(&self) -> Result<Ipv4Addr, PortMapError>;
}

/// A WAN connection service bound to its resolved control URL
#[derive(Clone)]
pub struct WanClient {
    service: WanService,
    gateway: Ipv4Addr,
    control_url: Url,
    location: Url,
    friendly_name: String,
    manufacturer: String,
    transport: SoapTransport,
}

impl WanClient {
    pub fn control_url(&self) -> &Url {
        &self.control_url
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }
}

impl Debug for WanClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WanClient")
            .field("service", &self.service)
            .field("gateway", &self.gateway)
            .field("control_url", &self.control_url.as_str())
            .field("friendly_name", &self.friendly_name)
            .field("manufacturer", &self.manufacturer)
            .finish()
    }
}

impl Display for WanClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}; {} ({})",
            self.service, self.location, self.friendly_name, self.manufacturer
        )
    }
}

#[async_trait]
impl PortMapper for WanClient {
    fn service(&self) -> WanService {
        self.service
    }

    fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    async fn add_port_mapping(&self, request: &AddPortMapping) -> Result<(), PortMapError> {
        self.transport
            .call(&self.control_url, self.service.urn(), request)
            .await
    }

    async fn delete_port_mapping(&self, request: &DeletePortMapping) -> Result<(), PortMapError> {
        self.transport
            .call(&self.control_url, self.service.urn(), request)
            .await
    }

    async fn get_external_ip_address(&self) -> Result<Ipv4Addr, PortMapError> {
        self.transport
            .call(&self.control_url, self.service.urn(), &GetExternalIPAddress)
            .await
    }
}

/// Picks the highest-priority WAN connection service found inside a `WANConnectionDevice`
pub fn select_client(
    description: &RootDescription,
    location: &Url,
    gateway: Ipv4Addr,
    transport: SoapTransport,
) -> Result<WanClient, PortMapError> {
    let (service, entry) = find_service(description).ok_or_else(|| {
        PortMapError::UnsupportedDevice(format!(
            "no compatible WAN connection service at {location}"
        ))
    })?;

    let control_url = resolve_control_url(description, location, entry)?;

    Ok(WanClient {
        service,
        gateway,
        control_url,
        location: location.clone(),
        friendly_name: description.device.friendly_name.clone(),
        manufacturer: description.device.manufacturer.clone(),
        transport,
    })
}

fn find_service(description: &RootDescription) -> Option<(WanService, &Service)> {
    WanService::PRIORITY.into_iter().find_map(|service| {
        description
            .device
            .walk()
            .filter(|device| device.is_device_kind(WAN_CONNECTION_DEVICE))
            .flat_map(|device| device.services.iter())
            .find(|entry| entry.service_type.trim() == service.urn())
            .map(|entry| (service, entry))
    })
}

fn resolve_control_url(
    description: &RootDescription,
    location: &Url,
    service: &Service,
) -> Result<Url, PortMapError> {
    if service.control_url.is_empty() {
        return Err(PortMapError::malformed(format!(
            "{} has an empty controlURL",
            service.service_type
        )));
    }

    let base = description
        .url_base
        .as_deref()
        .and_then(|base| Url::parse(base).ok())
        .unwrap_or_else(|| location.clone());

    let control_url = base.join(&service.control_url).map_err(|err| {
        PortMapError::MalformedResponse(format!(
            "bad controlURL {:?}: {err}",
            service.control_url
        ))
    })?;

    if control_url.host() != location.host() {
        return Err(PortMapError::MalformedResponse(format!(
            "controlURL {control_url} points away from {location}"
        )));
    }

    Ok(control_url)
}

/// Fetches the description advertised in `response` and binds a client to its WAN service.
/// The advertised location must be served by `gateway` itself.
pub async fn fetch_client(
    http: &reqwest::Client,
    transport: SoapTransport,
    gateway: Ipv4Addr,
    response: &DiscoveryResponse,
    timeout: Duration,
    sink: &dyn DiagnosticsSink,
) -> Result<WanClient, PortMapError> {
    let location = response.location_url()?;
    let host = location
        .host_str()
        .and_then(|host| host.parse::<Ipv4Addr>().ok());
    if host != Some(gateway) {
        return Err(PortMapError::MalformedResponse(format!(
            "UPnP discovered root {} does not match gateway IP {gateway}",
            response.location
        )));
    }

    let description = fetch_device_tree(http, &location, timeout).await?;
    let client = select_client(&description, &location, gateway, transport)?;
    sink.record(
        DiagnosticKind::Selection,
        &format!(
            "saw UPnP type {} at {}; {} ({})",
            client.service, response.location, client.friendly_name, client.manufacturer
        ),
    );

    Ok(client)
}
