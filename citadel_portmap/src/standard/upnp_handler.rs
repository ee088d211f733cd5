use crate::config::PortMapConfig;
use crate::diagnostics::{DiagnosticKind, SharedSink};
use crate::error::PortMapError;
use crate::mapping::{Mapping, MappingEvent, MappingManager, MappingState, PortMappingProtocol};
use crate::standard::discovery::discover;
use crate::standard::soap::SoapTransport;
use crate::standard::socket_helpers;
use crate::standard::wan_client::{fetch_client, PortMapper, WanClient, WanService};
use parking_lot::RwLock;
use std::fmt::Formatter;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of [`UPnPHandler::probe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub supported: bool,
    pub gateway: Option<Ipv4Addr>,
    pub service: Option<WanService>,
    /// Why the gateway is unusable, when it is
    pub error: Option<PortMapError>,
}

impl ProbeResult {
    fn unsupported(error: PortMapError) -> Self {
        Self {
            supported: false,
            gateway: None,
            service: None,
            error: Some(error),
        }
    }
}

/// Discovers the local UPnP gateway and keeps one port mapping open on it.
///
/// Discovery runs at most once at a time and its result is cached per gateway until a transport
/// failure or a probe that finds a different gateway. Nothing here is fatal: every failure means
/// "UPnP unavailable" to the caller.
pub struct UPnPHandler {
    config: PortMapConfig,
    sink: SharedSink,
    http: reqwest::Client,
    transport: SoapTransport,
    discovery: tokio::sync::Mutex<()>,
    client: RwLock<Option<Arc<WanClient>>>,
    mappings: MappingManager,
    shutdown: CancellationToken,
}

impl UPnPHandler {
    pub fn new(config: PortMapConfig, sink: SharedSink) -> Result<Self, PortMapError> {
        // gateways live on the LAN, never behind a proxy
        let http = reqwest::Client::builder()
            .no_proxy()
            .tcp_nodelay(true)
            .build()
            .map_err(PortMapError::transport)?;

        let transport = SoapTransport::new(http.clone(), config.soap_timeout);
        let transport = if config.verbose_logs {
            transport.with_verbose_sink(sink.clone())
        } else {
            transport
        };

        let shutdown = CancellationToken::new();
        let mappings = MappingManager::new(&config, sink.clone(), shutdown.clone());

        Ok(Self {
            config,
            sink,
            http,
            transport,
            discovery: tokio::sync::Mutex::new(()),
            client: RwLock::new(None),
            mappings,
            shutdown,
        })
    }

    /// Reports whether a gateway with a usable WAN connection service answers before
    /// `deadline`. A successful probe leaves the client cached for [`Self::create_mapping`]
    pub async fn probe(&self, deadline: Instant) -> ProbeResult {
        if self.config.disable_upnp {
            self.sink
                .record(DiagnosticKind::Discovery, "UPnP disabled by configuration");
            return ProbeResult::unsupported(PortMapError::Disabled);
        }

        let Ok(_guard) = tokio::time::timeout_at(deadline, self.discovery.lock()).await else {
            log::trace!(target: "citadel", "UPnP probe gave up waiting for discovery in progress");
            return ProbeResult::unsupported(PortMapError::DiscoveryTimeout);
        };

        match self.discover_client(deadline).await {
            Ok(client) => ProbeResult {
                supported: true,
                gateway: Some(client.gateway()),
                service: Some(client.service()),
                error: None,
            },

            Err(err) => {
                log::trace!(target: "citadel", "UPnP probe failed: {err:?}");
                self.invalidate_client();
                ProbeResult::unsupported(err)
            }
        }
    }

    /// Maps `external_port_hint` (the internal port when zero) on the gateway to `internal`.
    /// An unspecified internal IP is replaced with the local address routing to the gateway.
    ///
    /// Probes first when no client is cached. Transport failures drop the cached client and
    /// are retried with exponential backoff, up to `max_transport_retries` times.
    #[cfg_attr(
        feature = "localhost-testing",
        tracing::instrument(level = "trace", target = "citadel", skip(self), err(Debug))
    )]
    pub async fn create_mapping(
        &self,
        internal: SocketAddr,
        external_port_hint: u16,
    ) -> Result<Mapping, PortMapError> {
        if self.config.disable_upnp {
            return Err(PortMapError::Disabled);
        }

        let SocketAddr::V4(internal) = internal else {
            return Err(PortMapError::UnsupportedDevice(format!(
                "cannot map {internal}: IGD port mapping is IPv4-only"
            )));
        };

        let mut attempt = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(PortMapError::transport("port mapper is shut down"));
            }

            match self.try_create_mapping(internal, external_port_hint).await {
                Err(err) if err.is_transport() => {
                    self.invalidate_client();
                    if attempt >= self.config.max_transport_retries {
                        return Err(err);
                    }

                    let backoff = self.config.backoff_for(attempt);
                    log::warn!(target: "citadel", "UPnP mapping attempt {} failed ({err}); retrying in {backoff:?}", attempt + 1);
                    attempt += 1;

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(err),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }

                res => return res,
            }
        }
    }

    async fn try_create_mapping(
        &self,
        internal: SocketAddrV4,
        external_port_hint: u16,
    ) -> Result<Mapping, PortMapError> {
        let client = match self.cached_client() {
            Some(client) => client,
            None => {
                let deadline = Instant::now() + self.config.probe_timeout;
                let _guard = tokio::time::timeout_at(deadline, self.discovery.lock())
                    .await
                    .map_err(|_| PortMapError::DiscoveryTimeout)?;
                self.discover_client(deadline).await?
            }
        };

        let internal = if internal.ip().is_unspecified() {
            let local =
                socket_helpers::local_ipv4_toward(SocketAddrV4::new(client.gateway(), 1900))
                    .await
                    .map_err(PortMapError::transport)?;
            SocketAddrV4::new(local, internal.port())
        } else {
            internal
        };

        self.mappings
            .create(client, internal, external_port_hint, PortMappingProtocol::UDP)
            .await
    }

    /// Runs discovery and client selection, reusing the cached client when the same gateway
    /// answers with the same location. Callers hold the discovery lock
    async fn discover_client(&self, deadline: Instant) -> Result<Arc<WanClient>, PortMapError> {
        let found = discover(&self.config, deadline, &self.shutdown, self.sink.as_ref()).await?;

        if let Some(cached) = self.cached_client() {
            if cached.gateway() == found.gateway
                && cached.location().as_str() == found.response.location
            {
                return Ok(cached);
            }
        }

        let fetch = fetch_client(
            &self.http,
            self.transport.clone(),
            found.gateway,
            &found.response,
            self.config.description_timeout,
            self.sink.as_ref(),
        );

        let client = tokio::time::timeout_at(deadline, fetch)
            .await
            .map_err(|_| {
                PortMapError::Transport(format!(
                    "probe deadline passed while reading {}",
                    found.response.location
                ))
            })?
            .map_err(|err| {
                self.sink.record(
                    DiagnosticKind::Fault,
                    &format!("gateway {} is unusable: {err}", found.gateway),
                );
                err
            })?;

        let client = Arc::new(client);
        let previous = self.client.write().replace(client.clone());
        if let Some(previous) = previous.filter(|p| p.gateway() != client.gateway()) {
            self.sink.record(
                DiagnosticKind::Selection,
                &format!(
                    "gateway changed from {} to {}",
                    previous.gateway(),
                    client.gateway()
                ),
            );
        }

        Ok(client)
    }

    /// Deletes the active mapping, if any
    pub async fn delete_mapping(&self) -> Result<(), PortMapError> {
        self.mappings.delete().await
    }

    pub fn current_mapping(&self) -> Option<Mapping> {
        self.mappings.current()
    }

    pub fn watch_mapping(&self) -> watch::Receiver<Option<Mapping>> {
        self.mappings.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MappingEvent> {
        self.mappings.subscribe()
    }

    pub fn state(&self) -> MappingState {
        self.mappings.state()
    }

    pub fn cached_client(&self) -> Option<Arc<WanClient>> {
        self.client.read().clone()
    }

    /// Forgets the cached client so that the next request rediscovers the gateway
    pub fn invalidate_client(&self) {
        if let Some(client) = self.client.write().take() {
            log::trace!(target: "citadel", "dropping cached UPnP client {client}");
        }
    }

    /// Stops discovery, renewal and any mapping request in flight, then makes a best-effort
    /// attempt at removing whatever the gateway may still forward
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Err(err) = self.mappings.delete().await {
            log::warn!(target: "citadel", "UPnP mapping left to expire on shutdown: {err}");
        }
    }
}

impl std::fmt::Display for UPnPHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.cached_client() {
            Some(client) => write!(f, "Gateway: {}\nService: {client}", client.gateway())?,
            None => write!(f, "Gateway: unknown")?,
        }

        match self.current_mapping() {
            Some(mapping) => write!(
                f,
                "\nMapping: {} -> {}",
                mapping
                    .external_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|| format!("?:{}", mapping.external_port)),
                mapping.internal_addr
            ),
            None => Ok(()),
        }
    }
}
