//! Retrieval and parsing of the UPnP root device description (`urn:schemas-upnp-org:device-1-0`).
//!
//! The document is parsed into a small element tree first and then projected onto
//! [`DeviceTree`]. Anything the projection does not ask for (vendor extensions, icon lists,
//! presentation URLs) is carried through the first step and dropped by the second.
use crate::error::PortMapError;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Url;
use std::time::Duration;

/// Vendor descriptions are a few KiB. Anything larger is not a gateway worth talking to
const MAX_DESCRIPTION_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RootDescription {
    /// `URLBase` from UPnP 1.0 documents, used to resolve relative control URLs
    pub url_base: Option<String>,
    pub device: DeviceTree,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DeviceTree {
    pub device_type: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub services: Vec<Service>,
    pub devices: Vec<DeviceTree>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Service {
    pub service_type: String,
    pub service_id: String,
    pub control_url: String,
    pub event_sub_url: String,
    pub scpd_url: String,
}

impl DeviceTree {
    /// Depth-first, pre-order traversal of this device and every embedded device
    pub fn walk(&self) -> impl Iterator<Item = &DeviceTree> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let next = stack.pop()?;
            stack.extend(next.devices.iter().rev());
            Some(next)
        })
    }

    /// Whether `deviceType` names a device of the given kind, e.g. `WANConnectionDevice`
    pub fn is_device_kind(&self, kind: &str) -> bool {
        self.device_type
            .strip_prefix("urn:schemas-upnp-org:device:")
            .and_then(|rest| rest.split(':').next())
            .map(|name| name == kind)
            .unwrap_or(false)
    }
}

/// Fetches `location` and parses the body. Unreachable or erroring hosts map to
/// [`PortMapError::Transport`], unparsable bodies to [`PortMapError::MalformedResponse`].
pub async fn fetch_device_tree(
    http: &reqwest::Client,
    location: &Url,
    timeout: Duration,
) -> Result<RootDescription, PortMapError> {
    let fetch = async {
        let response = http.get(location.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PortMapError::Transport(format!(
                "GET {location} returned {status}"
            )));
        }

        Ok(response.bytes().await?)
    };

    let body = tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| PortMapError::Transport(format!("timed out fetching {location}")))??;

    if body.len() > MAX_DESCRIPTION_BYTES {
        return Err(PortMapError::MalformedResponse(format!(
            "device description at {location} is {} bytes",
            body.len()
        )));
    }

    let body = std::str::from_utf8(&body)
        .map_err(|_| PortMapError::malformed("device description is not valid UTF-8"))?;
    parse_device_tree(body)
}

pub fn parse_device_tree(body: &str) -> Result<RootDescription, PortMapError> {
    let document = XmlNode::parse(body)?;
    let root = document
        .children
        .iter()
        .find(|node| node.name == "root")
        .ok_or_else(|| PortMapError::malformed("device description lacks a <root> element"))?;

    let device = root
        .child("device")
        .ok_or_else(|| PortMapError::malformed("device description lacks a root <device>"))?;

    Ok(RootDescription {
        url_base: root
            .child_text("URLBase")
            .filter(|base| !base.is_empty())
            .map(str::to_string),
        device: project_device(device),
    })
}

fn project_device(node: &XmlNode) -> DeviceTree {
    let text = |name| node.child_text(name).unwrap_or_default().to_string();
    DeviceTree {
        device_type: text("deviceType"),
        friendly_name: text("friendlyName"),
        manufacturer: text("manufacturer"),
        services: node
            .child("serviceList")
            .map(|list| list.children_named("service").map(project_service).collect())
            .unwrap_or_default(),
        devices: node
            .child("deviceList")
            .map(|list| list.children_named("device").map(project_device).collect())
            .unwrap_or_default(),
    }
}

fn project_service(node: &XmlNode) -> Service {
    let text = |name| node.child_text(name).unwrap_or_default().to_string();
    Service {
        service_type: text("serviceType"),
        service_id: text("serviceId"),
        control_url: text("controlURL"),
        event_sub_url: text("eventSubURL"),
        scpd_url: text("SCPDURL"),
    }
}

/// A namespace-stripped XML element
#[derive(Debug, Default)]
pub(crate) struct XmlNode {
    pub(crate) name: String,
    pub(crate) text: String,
    pub(crate) children: Vec<XmlNode>,
}

impl XmlNode {
    fn named(name: &[u8]) -> Self {
        Self {
            name: String::from_utf8_lossy(name).into_owned(),
            ..Default::default()
        }
    }

    /// Parses `body` into a synthetic document node whose children are the top-level elements
    pub(crate) fn parse(body: &str) -> Result<XmlNode, PortMapError> {
        let mut reader = Reader::from_str(body);
        reader.trim_text(true);
        let mut stack = vec![XmlNode::default()];

        loop {
            let event = reader.read_event().map_err(|err| {
                PortMapError::MalformedResponse(format!(
                    "XML error at byte {}: {err}",
                    reader.buffer_position()
                ))
            })?;

            match event {
                Event::Start(start) => stack.push(XmlNode::named(start.local_name().as_ref())),
                Event::Empty(start) => {
                    let node = XmlNode::named(start.local_name().as_ref());
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(node);
                    }
                }
                Event::End(_) => {
                    let node = stack
                        .pop()
                        .filter(|_| !stack.is_empty())
                        .ok_or_else(|| PortMapError::malformed("unbalanced XML end tag"))?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(node);
                    }
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(PortMapError::malformed)?;
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&text);
                    }
                }
                Event::CData(data) => {
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        match (stack.pop(), stack.is_empty()) {
            (Some(document), true) if !document.children.is_empty() => Ok(document),
            (Some(_), true) => Err(PortMapError::malformed("XML document has no elements")),
            _ => Err(PortMapError::malformed("XML document ended inside an element")),
        }
    }

    pub(crate) fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|child| child.name == name)
    }

    pub(crate) fn children_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    pub(crate) fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|child| child.text.trim())
    }
}
