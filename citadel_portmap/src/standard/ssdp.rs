//! SSDP wire format: the M-SEARCH request we send and the HTTP-style header block routers answer with.
//!
//! Routers disagree on header casing (`LOCATION`, `Location`, `location`) and on which optional
//! headers they include, so matching is case-insensitive and unknown headers are skipped.
use crate::error::PortMapError;
use reqwest::Url;
use std::net::SocketAddr;

const MAN_DISCOVER: &str = "\"ssdp:discover\"";

/// The headers of one SSDP answer that matter for gateway selection
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DiscoveryResponse {
    /// Absolute URL of the root device description
    pub location: String,
    pub server: String,
    /// Unique service name of the advertising device and service
    pub usn: String,
}

impl DiscoveryResponse {
    /// The parsed form of [`Self::location`]
    pub fn location_url(&self) -> Result<Url, PortMapError> {
        Url::parse(&self.location).map_err(|err| {
            PortMapError::MalformedResponse(format!("bad LOCATION {:?}: {err}", self.location))
        })
    }
}

/// Parses the bytes of one SSDP response datagram
pub fn parse_discovery_response(raw: &[u8]) -> Result<DiscoveryResponse, PortMapError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| PortMapError::malformed("SSDP response is not valid UTF-8"))?;
    let mut lines = text.lines();

    let status_line = lines.next().unwrap_or_default();
    if !status_line.starts_with("HTTP/") {
        return Err(PortMapError::MalformedResponse(format!(
            "unexpected SSDP status line {status_line:?}"
        )));
    }

    let mut location = None;
    let mut server = None;
    let mut usn = None;

    for line in lines {
        if line.is_empty() {
            break;
        }

        let (name, value) = line.split_once(':').ok_or_else(|| {
            PortMapError::MalformedResponse(format!("SSDP header without a colon: {line:?}"))
        })?;
        let value = value.trim();

        // the first occurrence of a header wins
        let slot = match name.trim() {
            name if name.eq_ignore_ascii_case("location") => &mut location,
            name if name.eq_ignore_ascii_case("server") => &mut server,
            name if name.eq_ignore_ascii_case("usn") => &mut usn,
            _ => continue,
        };

        if slot.is_none() {
            *slot = Some(value.to_string());
        }
    }

    let location =
        location.ok_or_else(|| PortMapError::malformed("SSDP response lacks a LOCATION header"))?;

    let response = DiscoveryResponse {
        location,
        server: server.unwrap_or_default(),
        usn: usn.unwrap_or_default(),
    };

    let url = response.location_url()?;
    if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
        return Err(PortMapError::MalformedResponse(format!(
            "LOCATION is not an absolute HTTP URL: {:?}",
            response.location
        )));
    }

    Ok(response)
}

/// Builds an M-SEARCH datagram for `search_target`
pub fn build_search_request(destination: SocketAddr, search_target: &str, mx: u8) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {destination}\r\n\
         ST: {search_target}\r\n\
         MAN: {MAN_DISCOVER}\r\n\
         MX: {mx}\r\n\
         \r\n"
    )
}
