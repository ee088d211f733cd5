//! SSDP discovery of Internet Gateway Devices.
//!
//! One M-SEARCH per search target goes to the multicast group (and, when configured, as unicast
//! to the preferred gateway). Answers are collected for the discovery window; the next target is
//! only tried when the previous one yielded nothing. Every wait is bounded by the caller's
//! deadline and cancellation token.
use crate::config::PortMapConfig;
use crate::diagnostics::{DiagnosticKind, DiagnosticsSink};
use crate::error::PortMapError;
use crate::standard::socket_helpers;
use crate::standard::ssdp::{build_search_request, parse_discovery_response, DiscoveryResponse};
use itertools::Itertools;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SSDP_PORT: u16 = 1900;
const MAX_DATAGRAM: usize = 4096;

/// The gateway chosen for this session and the answer it gave
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DiscoveredGateway {
    pub gateway: Ipv4Addr,
    /// Source address of the chosen response
    pub responder: SocketAddrV4,
    pub response: DiscoveryResponse,
    pub search_target: String,
    /// Every distinct gateway that answered, in the order they first answered
    pub seen: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone)]
struct Sighting {
    from: SocketAddrV4,
    response: DiscoveryResponse,
    received_at: Instant,
}

/// Searches for a gateway until one answers or `deadline` passes
#[cfg_attr(
    feature = "localhost-testing",
    tracing::instrument(level = "trace", target = "citadel", skip_all, err(Debug))
)]
pub async fn discover(
    config: &PortMapConfig,
    deadline: Instant,
    cancel: &CancellationToken,
    sink: &dyn DiagnosticsSink,
) -> Result<DiscoveredGateway, PortMapError> {
    let socket = socket_helpers::get_discovery_socket().map_err(PortMapError::transport)?;

    for search_target in &config.search_targets {
        if Instant::now() >= deadline {
            break;
        }

        send_search(&socket, config, search_target).await?;

        let window_end = deadline.min(Instant::now() + config.discovery_window);
        let sightings = collect(&socket, window_end, cancel, sink).await?;

        if sightings.is_empty() {
            sink.record(
                DiagnosticKind::Discovery,
                &format!("no answer to M-SEARCH for {search_target}"),
            );
            continue;
        }

        return Ok(choose_gateway(config.gateway_hint, search_target, sightings, sink).await);
    }

    sink.record(DiagnosticKind::Discovery, "no UPnP gateway found");
    Err(PortMapError::DiscoveryTimeout)
}

async fn send_search(
    socket: &UdpSocket,
    config: &PortMapConfig,
    search_target: &str,
) -> Result<(), PortMapError> {
    let mut destinations = vec![config.ssdp_addr];
    if let Some(hint) = config.gateway_hint {
        let unicast = SocketAddr::V4(SocketAddrV4::new(hint, SSDP_PORT));
        if unicast != config.ssdp_addr {
            destinations.push(unicast);
        }
    }

    let mut sent = 0;
    let mut last_err = None;
    for destination in destinations {
        let request = build_search_request(destination, search_target, config.mx);
        match socket.send_to(request.as_bytes(), destination).await {
            Ok(_) => sent += 1,
            Err(err) => {
                log::warn!(target: "citadel", "M-SEARCH to {destination} failed: {err:?}");
                last_err = Some(err);
            }
        }
    }

    match (sent, last_err) {
        (0, Some(err)) => Err(err.into()),
        _ => Ok(()),
    }
}

async fn collect(
    socket: &UdpSocket,
    window_end: Instant,
    cancel: &CancellationToken,
    sink: &dyn DiagnosticsSink,
) -> Result<Vec<Sighting>, PortMapError> {
    let mut sightings = vec![];
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(PortMapError::Transport("discovery cancelled".to_string()))
            }
            res = tokio::time::timeout_at(window_end, socket.recv_from(&mut buf)) => res,
        };

        let (len, from) = match received {
            Err(_elapsed) => return Ok(sightings),
            Ok(Ok(ok)) => ok,
            // Windows reports ICMP port unreachable on the next recv; keep listening
            Ok(Err(err)) => {
                log::trace!(target: "citadel", "SSDP recv error: {err:?}");
                continue;
            }
        };

        let SocketAddr::V4(from) = from else {
            continue;
        };

        match parse_discovery_response(&buf[..len]) {
            Ok(response) => {
                log::trace!(target: "citadel", "SSDP answer from {from}: {:?}", response);
                sightings.push(Sighting {
                    from,
                    response,
                    received_at: Instant::now(),
                })
            }

            Err(err) => sink.record(
                DiagnosticKind::Discovery,
                &format!("ignoring SSDP answer from {from}: {err}"),
            ),
        }
    }
}

/// Prefers the configured gateway, then gateways reached through the default-route
/// interface. Ties go to the first responder, using its most recent answer
async fn choose_gateway(
    gateway_hint: Option<Ipv4Addr>,
    search_target: &str,
    sightings: Vec<Sighting>,
    sink: &dyn DiagnosticsSink,
) -> DiscoveredGateway {
    let seen = sightings.iter().map(|s| *s.from.ip()).unique().collect_vec();

    let hinted = gateway_hint
        .filter(|hint| seen.contains(hint))
        .map(|hint| vec![hint]);

    let candidates = match hinted {
        Some(hinted) => hinted,
        None => on_default_route(&seen).await,
    };

    let gateway = candidates
        .first()
        .or(seen.first())
        .copied()
        .unwrap_or(Ipv4Addr::UNSPECIFIED);

    for other in seen.iter().filter(|ip| **ip != gateway) {
        sink.record(
            DiagnosticKind::Discovery,
            &format!("ignoring additional gateway {other}; using {gateway}"),
        );
    }

    let latest = sightings
        .into_iter()
        .filter(|s| *s.from.ip() == gateway)
        .max_by_key(|s| s.received_at);

    let (responder, response) = latest
        .map(|s| (s.from, s.response))
        .unwrap_or_else(|| {
            (
                SocketAddrV4::new(gateway, SSDP_PORT),
                DiscoveryResponse::default(),
            )
        });

    sink.record(
        DiagnosticKind::Discovery,
        &format!("gateway {gateway} answered {search_target} with {}", response.location),
    );

    DiscoveredGateway {
        gateway,
        responder,
        response,
        search_target: search_target.to_string(),
        seen,
    }
}

/// The subset of `gateways` routed through the same local address as the default route
async fn on_default_route(gateways: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let Some(default_local) = socket_helpers::default_route_ipv4().await else {
        return vec![];
    };

    let mut matching = vec![];
    for gateway in gateways {
        let route =
            socket_helpers::local_ipv4_toward(SocketAddrV4::new(*gateway, SSDP_PORT)).await;
        if matches!(route, Ok(local) if local == default_local) {
            matching.push(*gateway);
        }
    }

    matching
}
