//! UDP sockets for SSDP and local route lookups.
//!
//! The route lookups use the connect trick: connecting a UDP socket sends nothing, but makes
//! the kernel pick the source address it would route through.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

/// SSDP datagrams must not leave the local network segment
const SSDP_MULTICAST_TTL: u32 = 2;
const DEFAULT_ROUTE_PROBE: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 80);

fn get_udp_socket_builder() -> Result<Socket, anyhow::Error> {
    Ok(Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?)
}

/// Binds an ephemeral IPv4 socket able to send M-SEARCH to the multicast group and receive
/// unicast answers on the same port
pub fn get_discovery_socket() -> Result<UdpSocket, anyhow::Error> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    log::trace!(target: "citadel", "[Socket helper] Getting SSDP socket @ {:?} ...", &addr);

    let socket = get_udp_socket_builder()?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_ttl_v4(SSDP_MULTICAST_TTL)?;
    socket.set_multicast_loop_v4(true)?;
    socket.bind(&SockAddr::from(addr))?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// The local IPv4 address the kernel would use to reach `destination`
pub async fn local_ipv4_toward(destination: SocketAddrV4) -> Result<Ipv4Addr, anyhow::Error> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(destination).await?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        ip => Err(anyhow::Error::msg(format!(
            "no IPv4 route toward {destination} (got {ip})"
        ))),
    }
}

/// The local IPv4 address of the default-route interface, if there is one
pub async fn default_route_ipv4() -> Option<Ipv4Addr> {
    local_ipv4_toward(DEFAULT_ROUTE_PROBE).await.ok()
}
