//! Probe, map and unmap against a loopback gateway.

mod common;

#[cfg(test)]
mod tests {
    use crate::common::{Behavior, FakeIgd, EXTERNAL_IP, FRIENDLY_NAME, MANUFACTURER};
    use citadel_portmap::config::PortMapConfig;
    use citadel_portmap::diagnostics::{DiagnosticKind, MemorySink};
    use citadel_portmap::error::PortMapError;
    use citadel_portmap::mapping::{MappingEvent, MappingState};
    use citadel_portmap::wan_client::{PortMapper, WanService};
    use citadel_portmap::UPnPHandler;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn config(igd: &FakeIgd) -> PortMapConfig {
        PortMapConfig::default()
            .with_ssdp_addr(igd.ssdp_addr)
            .with_discovery_window(Duration::from_millis(300))
            .with_probe_timeout(Duration::from_secs(3))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(3)
    }

    #[tokio::test]
    async fn permanent_only_gateway_gets_a_permanent_mapping() {
        citadel_logging::setup_log();
        let igd = FakeIgd::start(Behavior {
            permanent_only: true,
            ..Default::default()
        })
        .await;
        let sink = MemorySink::new();
        let handler = UPnPHandler::new(config(&igd), sink.clone()).unwrap();

        let probe = handler.probe(deadline()).await;
        assert!(probe.supported, "{probe:?}");
        assert_eq!(probe.gateway, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(probe.service, Some(WanService::WanIpConnection1));
        assert_eq!(
            sink.lines_of(DiagnosticKind::Selection),
            vec![format!(
                "saw UPnP type WANIPConnection1 at {}; {FRIENDLY_NAME} ({MANUFACTURER})",
                igd.location()
            )]
        );

        let mut events = handler.subscribe();
        let mapping = handler
            .create_mapping("127.0.0.1:41641".parse().unwrap(), 0)
            .await
            .unwrap();

        assert!(mapping.permanent);
        assert!(mapping.expires_at.is_none());
        assert_eq!(
            mapping.external_addr(),
            Some(SocketAddrV4::new(EXTERNAL_IP.parse().unwrap(), 41641))
        );
        assert_eq!(handler.state(), MappingState::Mapped { permanent: true });

        let adds = igd.calls_to("AddPortMapping");
        assert_eq!(adds.len(), 2);
        assert_eq!(adds[0].arg("NewLeaseDuration").as_deref(), Some("3600"));
        assert_eq!(adds[1].arg("NewLeaseDuration").as_deref(), Some("0"));
        assert_eq!(
            adds[0].soap_action,
            "\"urn:schemas-upnp-org:service:WANIPConnection:1#AddPortMapping\""
        );
        assert_eq!(adds[1].arg("NewProtocol").as_deref(), Some("UDP"));
        assert_eq!(adds[1].arg("NewInternalClient").as_deref(), Some("127.0.0.1"));
        assert_eq!(adds[1].arg("NewExternalPort").as_deref(), Some("41641"));
        assert!(matches!(events.try_recv(), Ok(MappingEvent::Created(_))));

        handler.delete_mapping().await.unwrap();
        assert_eq!(handler.state(), MappingState::Unmapped);
        assert!(handler.current_mapping().is_none());

        let deletes = igd.calls_to("DeletePortMapping");
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].arg("NewExternalPort").as_deref(), Some("41641"));
        assert!(matches!(events.try_recv(), Ok(MappingEvent::Deleted(_))));
    }

    #[tokio::test]
    async fn leased_mapping_is_released_on_shutdown() {
        citadel_logging::setup_log();
        let igd = FakeIgd::start(Behavior::default()).await;
        let handler = UPnPHandler::new(config(&igd), MemorySink::new()).unwrap();
        let watch = handler.watch_mapping();

        // no probe first: the mapping request discovers on its own
        let mapping = handler
            .create_mapping("0.0.0.0:5000".parse().unwrap(), 6000)
            .await
            .unwrap();

        assert!(!mapping.permanent);
        assert_eq!(mapping.lease_seconds, 3600);
        assert_eq!(mapping.external_port, 6000);
        assert!(mapping.internal_addr.ip().is_loopback());
        assert_eq!(watch.borrow().as_ref(), Some(&mapping));
        assert_eq!(igd.calls_to("AddPortMapping").len(), 1);

        let client = handler.cached_client().unwrap();
        assert_eq!(client.gateway(), Ipv4Addr::LOCALHOST);
        assert_eq!(
            client.control_url().as_str(),
            format!("http://{}/ctl/IPConn", igd.http_addr)
        );

        handler.shutdown().await;
        assert_eq!(handler.state(), MappingState::Unmapped);
        assert_eq!(igd.calls_to("DeletePortMapping").len(), 1);
        assert!(watch.borrow().is_none());

        let err = handler
            .create_mapping("127.0.0.1:5000".parse().unwrap(), 0)
            .await
            .unwrap_err();
        assert!(err.is_transport(), "{err:?}");
    }

    #[tokio::test]
    async fn malformed_description_means_unsupported() {
        citadel_logging::setup_log();
        let igd = FakeIgd::start(Behavior {
            malformed_description: true,
            ..Default::default()
        })
        .await;
        let sink = MemorySink::new();
        let handler = UPnPHandler::new(config(&igd), sink.clone()).unwrap();

        let probe = handler.probe(deadline()).await;
        assert!(!probe.supported);
        assert!(
            matches!(probe.error, Some(PortMapError::MalformedResponse(_))),
            "{probe:?}"
        );
        assert!(handler.cached_client().is_none());
        assert!(sink.lines_of(DiagnosticKind::Selection).is_empty());
        assert!(!sink.lines_of(DiagnosticKind::Fault).is_empty());
    }

    #[tokio::test]
    async fn transport_failures_rediscover_and_retry() {
        citadel_logging::setup_log();
        let igd = FakeIgd::start(Behavior {
            failing_adds: 1,
            ..Default::default()
        })
        .await;
        let mut config = config(&igd).with_max_transport_retries(2);
        config.transport_retry_backoff = Duration::from_millis(10);
        let handler = UPnPHandler::new(config, MemorySink::new()).unwrap();

        assert!(handler.probe(deadline()).await.supported);
        let searches_after_probe = igd.searches();

        let mapping = handler
            .create_mapping("127.0.0.1:41641".parse().unwrap(), 0)
            .await
            .unwrap();

        assert_eq!(mapping.external_port, 41641);
        assert_eq!(igd.calls_to("AddPortMapping").len(), 2);
        // the failed attempt dropped the cached client
        assert!(igd.searches() > searches_after_probe);
        assert!(handler.cached_client().is_some());
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        citadel_logging::setup_log();
        let igd = FakeIgd::start(Behavior {
            failing_adds: usize::MAX,
            ..Default::default()
        })
        .await;
        let mut config = config(&igd).with_max_transport_retries(1);
        config.transport_retry_backoff = Duration::from_millis(10);
        let handler = UPnPHandler::new(config, MemorySink::new()).unwrap();

        let err = handler
            .create_mapping("127.0.0.1:41641".parse().unwrap(), 0)
            .await
            .unwrap_err();

        assert!(err.is_transport(), "{err:?}");
        assert_eq!(igd.calls_to("AddPortMapping").len(), 2);
        assert_eq!(handler.state(), MappingState::Unmapped);
        assert!(handler.cached_client().is_none());
    }

    #[tokio::test]
    async fn silent_network_is_not_fatal() {
        citadel_logging::setup_log();
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = PortMapConfig::default()
            .with_ssdp_addr(silent.local_addr().unwrap())
            .with_discovery_window(Duration::from_millis(200));
        drop(silent);

        let handler = UPnPHandler::new(config, MemorySink::new()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        let probe = handler.probe(deadline).await;
        assert!(!probe.supported);
        assert_eq!(probe.error, Some(PortMapError::DiscoveryTimeout));
        assert!(Instant::now() <= deadline + Duration::from_millis(250));
    }

    #[tokio::test]
    async fn remapping_to_a_new_port_releases_the_old_one() {
        citadel_logging::setup_log();
        let igd = FakeIgd::start(Behavior::default()).await;
        let handler = UPnPHandler::new(config(&igd), MemorySink::new()).unwrap();

        handler
            .create_mapping("127.0.0.1:5000".parse().unwrap(), 6000)
            .await
            .unwrap();
        let mapping = handler
            .create_mapping("127.0.0.1:5000".parse().unwrap(), 7000)
            .await
            .unwrap();

        assert_eq!(mapping.external_port, 7000);
        let deletes = igd.calls_to("DeletePortMapping");
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].arg("NewExternalPort").as_deref(), Some("6000"));

        handler.shutdown().await;
        let deletes = igd.calls_to("DeletePortMapping");
        assert_eq!(deletes.len(), 2);
        assert_eq!(deletes[1].arg("NewExternalPort").as_deref(), Some("7000"));
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_stalled_mapping_request() {
        citadel_logging::setup_log();
        let igd = FakeIgd::start(Behavior {
            stall_external_ip: true,
            ..Default::default()
        })
        .await;
        let handler = Arc::new(UPnPHandler::new(config(&igd), MemorySink::new()).unwrap());

        let request = {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .create_mapping("127.0.0.1:5000".parse().unwrap(), 6000)
                    .await
            })
        };

        igd.wait_for_calls("GetExternalIPAddress", 1).await;
        tokio::time::timeout(Duration::from_secs(2), handler.shutdown())
            .await
            .unwrap();

        let err = request.await.unwrap().unwrap_err();
        assert!(err.is_transport(), "{err:?}");
        assert_eq!(handler.state(), MappingState::Unmapped);
        assert!(handler.current_mapping().is_none());

        // the forwarding created before the stall is removed
        let deletes = igd.calls_to("DeletePortMapping");
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].arg("NewExternalPort").as_deref(), Some("6000"));
    }
}
