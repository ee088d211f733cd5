//! SOAP 1.1 control actions against a WAN connection service.
//!
//! Each action is a typed request implementing [`SoapAction`]. The transport posts the envelope
//! to the service's control URL and hands the decoded body back to the action, or surfaces a
//! `s:Fault` as [`PortMapError::ProtocolFault`] so that callers can branch on the UPnP error code.
//! No retries happen at this layer.
use crate::diagnostics::{DiagnosticKind, SharedSink};
use crate::error::{PortMapError, SoapFault};
use crate::mapping::PortMappingProtocol;
use crate::standard::device_description::XmlNode;
use quick_xml::escape::escape;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use std::fmt::Write;
use std::net::Ipv4Addr;
use std::time::Duration;

const ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const ENCODING_STYLE: &str = "http://schemas.xmlsoap.org/soap/encoding/";
const SOAP_CONTENT_TYPE: &str = "text/xml; charset=\"utf-8\"";

/// A control action with its typed arguments and response
pub trait SoapAction {
    const NAME: &'static str;
    type Response;

    /// Arguments in the order the service description declares them
    fn arguments(&self) -> Vec<(&'static str, String)>;
    fn decode(response: SoapResponse) -> Result<Self::Response, PortMapError>;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AddPortMapping {
    pub external_port: u16,
    pub protocol: PortMappingProtocol,
    pub internal_port: u16,
    pub internal_client: Ipv4Addr,
    pub description: String,
    /// Seconds. Zero asks for a permanent mapping
    pub lease_duration: u32,
}

impl SoapAction for AddPortMapping {
    const NAME: &'static str = "AddPortMapping";
    type Response = ();

    fn arguments(&self) -> Vec<(&'static str, String)> {
        vec![
            ("NewRemoteHost", String::new()),
            ("NewExternalPort", self.external_port.to_string()),
            ("NewProtocol", self.protocol.to_string()),
            ("NewInternalPort", self.internal_port.to_string()),
            ("NewInternalClient", self.internal_client.to_string()),
            ("NewEnabled", "1".to_string()),
            ("NewPortMappingDescription", self.description.clone()),
            ("NewLeaseDuration", self.lease_duration.to_string()),
        ]
    }

    fn decode(_response: SoapResponse) -> Result<Self::Response, PortMapError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeletePortMapping {
    pub external_port: u16,
    pub protocol: PortMappingProtocol,
}

impl SoapAction for DeletePortMapping {
    const NAME: &'static str = "DeletePortMapping";
    type Response = ();

    fn arguments(&self) -> Vec<(&'static str, String)> {
        vec![
            ("NewRemoteHost", String::new()),
            ("NewExternalPort", self.external_port.to_string()),
            ("NewProtocol", self.protocol.to_string()),
        ]
    }

    fn decode(_response: SoapResponse) -> Result<Self::Response, PortMapError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GetExternalIPAddress;

impl SoapAction for GetExternalIPAddress {
    const NAME: &'static str = "GetExternalIPAddress";
    type Response = Ipv4Addr;

    fn arguments(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn decode(response: SoapResponse) -> Result<Self::Response, PortMapError> {
        let raw = response
            .get("NewExternalIPAddress")
            .ok_or_else(|| PortMapError::malformed("response lacks NewExternalIPAddress"))?;
        raw.parse::<Ipv4Addr>().map_err(|_| {
            PortMapError::MalformedResponse(format!("bad NewExternalIPAddress {raw:?}"))
        })
    }
}

/// The out-arguments of a successful action
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SoapResponse {
    /// Local name of the response element, e.g. `GetExternalIPAddressResponse`
    pub action: String,
    pub values: Vec<(String, String)>,
}

impl SoapResponse {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

pub fn encode_envelope(service_urn: &str, action: &str, arguments: &[(&str, String)]) -> String {
    let mut body = String::with_capacity(512);
    let _ = write!(
        body,
        "<?xml version=\"1.0\"?>\r\n\
         <s:Envelope xmlns:s=\"{ENVELOPE_NS}\" s:encodingStyle=\"{ENCODING_STYLE}\">\
         <s:Body><u:{action} xmlns:u=\"{}\">",
        escape(service_urn)
    );

    for (name, value) in arguments {
        let _ = write!(body, "<{name}>{}</{name}>", escape(value.as_str()));
    }

    let _ = write!(body, "</u:{action}></s:Body></s:Envelope>\r\n");
    body
}

/// Decodes a response envelope. A `s:Fault` body becomes [`PortMapError::ProtocolFault`]
pub fn decode_envelope(body: &str) -> Result<SoapResponse, PortMapError> {
    let document = XmlNode::parse(body)?;
    let envelope = document
        .child("Envelope")
        .ok_or_else(|| PortMapError::malformed("SOAP response lacks an Envelope"))?;
    let body = envelope
        .child("Body")
        .ok_or_else(|| PortMapError::malformed("SOAP envelope lacks a Body"))?;

    let Some(payload) = body.children.first() else {
        return Ok(SoapResponse::default());
    };

    if payload.name == "Fault" {
        return Err(PortMapError::ProtocolFault(decode_fault(payload)));
    }

    Ok(SoapResponse {
        action: payload.name.clone(),
        values: payload
            .children
            .iter()
            .map(|arg| (arg.name.clone(), arg.text.trim().to_string()))
            .collect(),
    })
}

fn decode_fault(fault: &XmlNode) -> SoapFault {
    let fault_string = fault
        .children
        .iter()
        .find(|child| child.name.eq_ignore_ascii_case("faultstring"))
        .map(|child| child.text.trim().to_string())
        .unwrap_or_default();

    let upnp_error = find_descendant(fault, "UPnPError");
    let code = upnp_error
        .and_then(|err| err.child_text("errorCode"))
        .and_then(|code| code.parse::<u32>().ok());
    let description = upnp_error
        .and_then(|err| err.child_text("errorDescription"))
        .unwrap_or_default()
        .to_string();

    SoapFault {
        code,
        description,
        fault_string,
    }
}

fn find_descendant<'a>(node: &'a XmlNode, name: &str) -> Option<&'a XmlNode> {
    node.children.iter().find_map(|child| {
        if child.name == name {
            Some(child)
        } else {
            find_descendant(child, name)
        }
    })
}

/// Posts envelopes to control URLs
#[derive(Clone)]
pub struct SoapTransport {
    http: reqwest::Client,
    timeout: Duration,
    verbose: Option<SharedSink>,
}

impl SoapTransport {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self {
            http,
            timeout,
            verbose: None,
        }
    }

    /// Every request and response body is also recorded in `sink`
    pub fn with_verbose_sink(mut self, sink: SharedSink) -> Self {
        self.verbose = Some(sink);
        self
    }

    pub async fn call<A: SoapAction>(
        &self,
        control_url: &Url,
        service_urn: &str,
        action: &A,
    ) -> Result<A::Response, PortMapError> {
        let envelope = encode_envelope(service_urn, A::NAME, &action.arguments());
        let soap_action = HeaderValue::from_str(&format!("\"{service_urn}#{}\"", A::NAME))
            .map_err(PortMapError::transport)?;

        if let Some(sink) = self.verbose.as_ref() {
            sink.record(
                DiagnosticKind::Mapping,
                &format!("POST {control_url} {}: {envelope}", A::NAME),
            );
        }

        let request = async {
            let response = self
                .http
                .post(control_url.clone())
                .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
                .header("SOAPAction", soap_action)
                .body(envelope)
                .send()
                .await?;
            let status = response.status();
            Ok::<_, PortMapError>((status, response.text().await?))
        };

        let (status, body) = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| {
                PortMapError::Transport(format!("{} to {control_url} timed out", A::NAME))
            })??;

        if let Some(sink) = self.verbose.as_ref() {
            sink.record(
                DiagnosticKind::Mapping,
                &format!("{} response ({status}): {body}", A::NAME),
            );
        }

        let decoded = if body.trim().is_empty() {
            Ok(SoapResponse::default())
        } else {
            decode_envelope(&body)
        };

        match decoded {
            Err(PortMapError::ProtocolFault(fault)) => Err(PortMapError::ProtocolFault(fault)),
            _ if !status.is_success() => Err(PortMapError::Transport(format!(
                "{} to {control_url} returned {status}",
                A::NAME
            ))),
            Ok(response) => A::decode(response),
            Err(err) => Err(err),
        }
    }
}
