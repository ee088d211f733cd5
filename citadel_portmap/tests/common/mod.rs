//! A loopback Internet Gateway Device: an SSDP responder plus a hyper server for the device
//! description and the WANIPConnection:1 control endpoint.
#![allow(dead_code)]

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;

pub const FRIENDLY_NAME: &str = "FakeGateway";
pub const MANUFACTURER: &str = "Citadel Labs";
pub const EXTERNAL_IP: &str = "123.123.123.123";
pub const WAN_IP_CONNECTION_1: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";

const ROOT_DESC: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <friendlyName>FakeGateway</friendlyName>
    <manufacturer>Citadel Labs</manufacturer>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:L3Forwarding1</serviceId>
        <controlURL>/ctl/L3F</controlURL>
        <eventSubURL>/evt/L3F</eventSubURL>
        <SCPDURL>/L3F.xml</SCPDURL>
      </service>
    </serviceList>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANDevice:1</deviceType>
        <friendlyName>WANDevice</friendlyName>
        <deviceList>
          <device>
            <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:1</deviceType>
            <friendlyName>WANConnectionDevice</friendlyName>
            <serviceList>
              <service>
                <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
                <serviceId>urn:upnp-org:serviceId:WANIPConn1</serviceId>
                <controlURL>/ctl/IPConn</controlURL>
                <eventSubURL>/evt/IPConn</eventSubURL>
                <SCPDURL>/WANIPCn.xml</SCPDURL>
              </service>
            </serviceList>
          </device>
        </deviceList>
      </device>
    </deviceList>
  </device>
</root>"#;

const PERMANENT_LEASE_FAULT: &str = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body><s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring><detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0"><errorCode>725</errorCode><errorDescription>OnlyPermanentLeasesSupported</errorDescription></UPnPError></detail></s:Fault></s:Body></s:Envelope>"#;

/// What the gateway does when asked for things
#[derive(Debug, Default, Clone, Copy)]
pub struct Behavior {
    /// Answer non-zero leases with fault 725
    pub permanent_only: bool,
    /// Serve a truncated device description
    pub malformed_description: bool,
    /// Answer this many AddPortMapping requests with a bare 500
    pub failing_adds: usize,
    /// Never answer GetExternalIPAddress
    pub stall_external_ip: bool,
}

#[derive(Debug, Clone)]
pub struct SoapCall {
    pub soap_action: String,
    pub body: String,
}

impl SoapCall {
    pub fn action(&self) -> &str {
        self.soap_action
            .trim_matches('"')
            .rsplit('#')
            .next()
            .unwrap_or_default()
    }

    pub fn arg(&self, name: &str) -> Option<String> {
        let open = format!("<{name}>");
        let close = format!("</{name}>");
        let start = self.body.find(&open)? + open.len();
        let end = self.body[start..].find(&close)? + start;
        Some(self.body[start..end].to_string())
    }
}

pub struct FakeIgd {
    behavior: Behavior,
    calls: Mutex<Vec<SoapCall>>,
    adds_failed: AtomicUsize,
    searches: AtomicUsize,
    pub http_addr: SocketAddr,
    pub ssdp_addr: SocketAddr,
}

impl FakeIgd {
    pub async fn start(behavior: Behavior) -> Arc<Self> {
        let ssdp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ssdp_addr = ssdp.local_addr().unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let http_addr = listener.local_addr().unwrap();

        let igd = Arc::new(Self {
            behavior,
            calls: Mutex::new(vec![]),
            adds_failed: AtomicUsize::new(0),
            searches: AtomicUsize::new(0),
            http_addr,
            ssdp_addr,
        });

        let http_igd = igd.clone();
        let make_service = make_service_fn(move |_| {
            let igd = http_igd.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let igd = igd.clone();
                    async move { Ok::<_, Infallible>(igd.handle(req).await) }
                }))
            }
        });

        let server = Server::from_tcp(listener).unwrap().serve(make_service);
        tokio::spawn(async move {
            if let Err(err) = server.await {
                log::error!(target: "citadel", "fake IGD http server failed: {err:?}");
            }
        });

        let ssdp_igd = igd.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, from)) = ssdp.recv_from(&mut buf).await {
                let request = String::from_utf8_lossy(&buf[..len]);
                if !request.starts_with("M-SEARCH") {
                    continue;
                }

                ssdp_igd.searches.fetch_add(1, Ordering::SeqCst);
                let _ = ssdp.send_to(ssdp_igd.discovery_response().as_bytes(), from).await;
            }
        });

        igd
    }

    pub fn location(&self) -> String {
        format!("http://{}/rootDesc.xml", self.http_addr)
    }

    pub fn calls(&self) -> Vec<SoapCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, action: &str) -> Vec<SoapCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.action() == action)
            .collect()
    }

    /// Polls until `action` has been called `count` times
    pub async fn wait_for_calls(&self, action: &str, count: usize) {
        for _ in 0..200 {
            if self.calls_to(action).len() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("{action} was not called {count} times");
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    fn discovery_response(&self) -> String {
        format!(
            "HTTP/1.1 200 OK\r\n\
             CACHE-CONTROL: max-age=120\r\n\
             ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\
             USN: uuid:fake-igd::urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n\
             EXT:\r\n\
             SERVER: Citadel/1.0 UPnP/1.1 FakeIGD/0.1\r\n\
             LOCATION: {}\r\n\
             \r\n",
            self.location()
        )
    }

    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/rootDesc.xml") => {
                let body = if self.behavior.malformed_description {
                    &ROOT_DESC[..ROOT_DESC.len() / 2]
                } else {
                    ROOT_DESC
                };
                xml(StatusCode::OK, body.to_string())
            }

            (&Method::POST, "/ctl/IPConn") => {
                let soap_action = req
                    .headers()
                    .get("SOAPAction")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let body = hyper::body::to_bytes(req.into_body())
                    .await
                    .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
                    .unwrap_or_default();

                let call = SoapCall { soap_action, body };
                self.calls.lock().push(call.clone());
                if self.behavior.stall_external_ip && call.action() == "GetExternalIPAddress" {
                    std::future::pending::<()>().await;
                }
                self.control(&call)
            }

            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::empty())
                .unwrap(),
        }
    }

    fn control(&self, call: &SoapCall) -> Response<Body> {
        match call.action() {
            "AddPortMapping" => {
                if self.adds_failed.load(Ordering::SeqCst) < self.behavior.failing_adds {
                    self.adds_failed.fetch_add(1, Ordering::SeqCst);
                    return Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Body::empty())
                        .unwrap();
                }

                if self.behavior.permanent_only && call.arg("NewLeaseDuration").as_deref() != Some("0")
                {
                    return xml(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        PERMANENT_LEASE_FAULT.to_string(),
                    );
                }

                xml(StatusCode::OK, envelope("AddPortMapping", ""))
            }

            "GetExternalIPAddress" => xml(
                StatusCode::OK,
                envelope(
                    "GetExternalIPAddress",
                    &format!("<NewExternalIPAddress>{EXTERNAL_IP}</NewExternalIPAddress>"),
                ),
            ),

            "DeletePortMapping" => xml(StatusCode::OK, envelope("DeletePortMapping", "")),

            _ => xml(StatusCode::INTERNAL_SERVER_ERROR, String::new()),
        }
    }
}

fn envelope(action: &str, payload: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body><u:{action}Response xmlns:u="{WAN_IP_CONNECTION_1}">{payload}</u:{action}Response></s:Body></s:Envelope>"#
    )
}

fn xml(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .body(Body::from(body))
        .unwrap()
}
