use crate::config::PortMapConfig;
use crate::diagnostics::{DiagnosticKind, SharedSink};
use crate::error::PortMapError;
use crate::mapping::{Mapping, MappingEvent, MappingState, PortMappingProtocol};
use crate::standard::soap::{AddPortMapping, DeletePortMapping};
use crate::standard::wan_client::PortMapper;
use parking_lot::Mutex;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 16;

/// Owns the single active mapping and its renewal task.
///
/// Negotiations (create, renew, delete) are serialized; readers get clones through
/// [`Self::current`], [`Self::watch`] and [`Self::subscribe`]. Dropping the manager cancels
/// any pending renewal.
pub struct MappingManager {
    inner: Arc<Inner>,
}

struct Inner {
    lease_duration: u32,
    description: String,
    renewal_retry_interval: Duration,
    sink: SharedSink,
    negotiation: tokio::sync::Mutex<()>,
    shared: Mutex<Shared>,
    mapping_tx: watch::Sender<Option<Mapping>>,
    events: broadcast::Sender<MappingEvent>,
    shutdown: CancellationToken,
}

type Forwarding = (Mapping, Arc<dyn PortMapper>);

struct Shared {
    state: MappingState,
    mapping: Option<Mapping>,
    client: Option<Arc<dyn PortMapper>>,
    /// A forwarding the gateway may hold that is not (or no longer) the active mapping: a
    /// request that was interrupted, or a mapping being replaced or deleted. The next create
    /// or delete releases it. Never set while `mapping` is.
    unconfirmed: Option<Forwarding>,
    renewal: Option<RenewalTask>,
}

struct RenewalTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RenewalTask {
    fn stop(self) {
        self.token.cancel();
        self.handle.abort();
    }
}

/// Brings the state back to `Unmapped` when a negotiation ends without a mapping, including
/// when its future is dropped halfway. A mapping that was being replaced is reported lost.
struct NegotiationGuard<'a> {
    inner: &'a Inner,
    superseded: Option<Mapping>,
    settled: bool,
}

impl<'a> NegotiationGuard<'a> {
    fn new(inner: &'a Inner) -> Self {
        Self {
            inner,
            superseded: None,
            settled: false,
        }
    }

    fn finish(mut self) {
        self.settled = true;
    }

    fn fail(mut self, err: PortMapError) -> PortMapError {
        self.settle(err.clone());
        err
    }

    fn settle(&mut self, cause: PortMapError) {
        if std::mem::replace(&mut self.settled, true) {
            return;
        }

        self.inner.set_state(MappingState::Unmapped);
        if let Some(mapping) = self.superseded.take() {
            let _ = self.inner.events.send(MappingEvent::Lost {
                mapping,
                error: cause,
            });
        }
    }
}

impl Drop for NegotiationGuard<'_> {
    fn drop(&mut self) {
        self.settle(PortMapError::transport("port mapping negotiation abandoned"));
    }
}

fn shut_down() -> PortMapError {
    PortMapError::transport("port mapper is shut down")
}

impl MappingManager {
    /// `shutdown` is the subsystem-wide token. Renewal tasks run on child tokens of it, and
    /// cancelling it aborts any create in flight
    pub fn new(config: &PortMapConfig, sink: SharedSink, shutdown: CancellationToken) -> Self {
        let (mapping_tx, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                lease_duration: config.lease_duration,
                description: config.mapping_description.clone(),
                renewal_retry_interval: config.renewal_retry_interval,
                sink,
                negotiation: tokio::sync::Mutex::new(()),
                shared: Mutex::new(Shared {
                    state: MappingState::Unmapped,
                    mapping: None,
                    client: None,
                    unconfirmed: None,
                    renewal: None,
                }),
                mapping_tx,
                events,
                shutdown,
            }),
        }
    }

    pub fn state(&self) -> MappingState {
        self.inner.shared.lock().state
    }

    pub fn current(&self) -> Option<Mapping> {
        self.inner.shared.lock().mapping.clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<Mapping>> {
        self.inner.mapping_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MappingEvent> {
        self.inner.events.subscribe()
    }

    pub fn has_pending_renewal(&self) -> bool {
        self.inner.shared.lock().renewal.is_some()
    }

    /// Asks the gateway behind `client` to forward `external_port_hint` (or the internal port,
    /// when the hint is zero) to `internal`.
    ///
    /// A gateway refusing leased mappings with fault 725 gets exactly one more request with a
    /// zero lease, and the resulting mapping is permanent. Other faults are returned as-is.
    /// A previous mapping with the same internal endpoint, external port and gateway is
    /// superseded in place; any other previous mapping is deleted first.
    ///
    /// Dropping the returned future, or cancelling the shutdown token, leaves the state
    /// `Unmapped` and remembers the request so that the next create or delete releases it.
    #[cfg_attr(
        feature = "localhost-testing",
        tracing::instrument(level = "trace", target = "citadel", skip(self, client), err(Debug))
    )]
    pub async fn create(
        &self,
        client: Arc<dyn PortMapper>,
        internal: SocketAddrV4,
        external_port_hint: u16,
        protocol: PortMappingProtocol,
    ) -> Result<Mapping, PortMapError> {
        let inner = &self.inner;
        inner.stop_renewal();
        let _lock = inner.negotiation.lock().await;
        inner.stop_renewal();

        if inner.shutdown.is_cancelled() {
            return Err(shut_down());
        }

        let external_port = match external_port_hint {
            0 => internal.port(),
            port => port,
        };

        let forwards_same = |mapping: &Mapping| {
            mapping.internal_addr == internal
                && mapping.external_port == external_port
                && mapping.protocol == protocol
                && mapping.gateway == client.gateway()
        };

        let mut negotiation = NegotiationGuard::new(inner);
        let previous = inner.retire_active();
        let replaced = inner.shared.lock().unconfirmed.clone();

        negotiation.superseded = previous;
        let carried = match replaced {
            Some((old, _)) if forwards_same(&old) => Some(old),

            Some((old, old_client)) => {
                inner.set_state(MappingState::Deleting);
                if let Err(err) = inner.send_delete(&old, old_client.as_ref()).await {
                    inner.sink.record(
                        DiagnosticKind::Fault,
                        &format!(
                            "could not release superseded mapping {} {} -> {}: {err}",
                            old.protocol, old.external_port, old.internal_addr
                        ),
                    );
                }
                inner.shared.lock().unconfirmed = None;
                if let Some(previous) = negotiation.superseded.take() {
                    let _ = inner.events.send(MappingEvent::Deleted(previous));
                }
                None
            }

            None => None,
        };

        let request = AddPortMapping {
            external_port,
            protocol,
            internal_port: internal.port(),
            internal_client: *internal.ip(),
            description: inner.description.clone(),
            lease_duration: inner.lease_duration,
        };

        let now = Instant::now();
        let mut mapping = Mapping {
            internal_addr: internal,
            external_ip: None,
            external_port,
            protocol,
            lease_seconds: request.lease_duration,
            refreshed_at: now,
            expires_at: None,
            permanent: false,
            gateway: client.gateway(),
            service: client.service(),
        };

        {
            let mut shared = inner.shared.lock();
            shared.state = MappingState::Requesting;
            // the gateway may apply the request even if the answer never arrives
            shared.unconfirmed = Some((mapping.clone(), client.clone()));
        }

        let added = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => Err(shut_down()),
            res = inner.add_with_fallback(client.as_ref(), request) => res,
        };

        let lease = match added {
            Ok(lease) => lease,
            Err(err) => {
                if err.fault().is_some() {
                    // refused outright, so the gateway holds whatever it held before
                    let mut shared = inner.shared.lock();
                    shared.unconfirmed = carried.map(|old| (old, client.clone()));
                }
                inner.sink.record(
                    DiagnosticKind::Fault,
                    &format!(
                        "AddPortMapping {protocol} {external_port} -> {internal} failed: {err}"
                    ),
                );
                return Err(negotiation.fail(err));
            }
        };

        let lookup = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return Err(negotiation.fail(shut_down())),
            res = client.get_external_ip_address() => res,
        };

        let external_ip = match lookup {
            Ok(ip) if !ip.is_unspecified() => Some(ip),
            Ok(ip) => {
                inner.sink.record(
                    DiagnosticKind::Fault,
                    &format!("gateway reported unusable external address {ip}"),
                );
                None
            }
            Err(err) => {
                inner.sink.record(
                    DiagnosticKind::Fault,
                    &format!("GetExternalIPAddress failed: {err}"),
                );
                None
            }
        };

        mapping.external_ip = external_ip;
        mapping.lease_granted(lease, Instant::now());

        inner.sink.record(
            DiagnosticKind::Mapping,
            &format!(
                "mapped {protocol} {}:{external_port} -> {internal} via {} ({})",
                external_ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                mapping.service,
                if mapping.permanent {
                    "permanent".to_string()
                } else {
                    format!("lease {lease}s")
                }
            ),
        );

        {
            let mut shared = inner.shared.lock();
            shared.state = MappingState::Mapped {
                permanent: mapping.permanent,
            };
            shared.mapping = Some(mapping.clone());
            shared.client = Some(client);
            shared.unconfirmed = None;
            if !mapping.permanent {
                shared.renewal = Some(Inner::spawn_renewal(inner));
            }
        }
        negotiation.finish();

        inner.mapping_tx.send_replace(Some(mapping.clone()));
        let _ = inner.events.send(MappingEvent::Created(mapping.clone()));
        Ok(mapping)
    }

    /// Removes the active mapping from the gateway, along with any request that was
    /// interrupted before it was confirmed. The local state is `Unmapped` afterwards whether
    /// or not the gateway accepted the request; a refusal is returned for logging.
    #[cfg_attr(
        feature = "localhost-testing",
        tracing::instrument(level = "trace", target = "citadel", skip(self), err(Debug))
    )]
    pub async fn delete(&self) -> Result<(), PortMapError> {
        let inner = &self.inner;
        inner.stop_renewal();
        let _lock = inner.negotiation.lock().await;
        inner.stop_renewal();

        let negotiation = NegotiationGuard::new(inner);
        let retired = inner.retire_active();
        if let Some(mapping) = retired {
            let _ = inner.events.send(MappingEvent::Deleted(mapping));
        }

        let pending = inner.shared.lock().unconfirmed.clone();
        let Some((mapping, client)) = pending else {
            negotiation.finish();
            inner.set_state(MappingState::Unmapped);
            return Ok(());
        };

        inner.set_state(MappingState::Deleting);
        let result = inner.send_delete(&mapping, client.as_ref()).await;
        {
            let mut shared = inner.shared.lock();
            shared.unconfirmed = None;
            shared.state = MappingState::Unmapped;
        }
        negotiation.finish();

        match &result {
            Ok(()) => inner.sink.record(
                DiagnosticKind::Mapping,
                &format!(
                    "deleted {} {} -> {}",
                    mapping.protocol, mapping.external_port, mapping.internal_addr
                ),
            ),
            Err(err) => inner.sink.record(
                DiagnosticKind::Fault,
                &format!(
                    "DeletePortMapping {} {} failed, leaving it to expire: {err}",
                    mapping.protocol, mapping.external_port
                ),
            ),
        }

        result
    }
}

impl Drop for MappingManager {
    fn drop(&mut self) {
        self.inner.stop_renewal();
    }
}

impl Inner {
    fn set_state(&self, state: MappingState) {
        self.shared.lock().state = state;
    }

    fn stop_renewal(&self) {
        let task = self.shared.lock().renewal.take();
        if let Some(task) = task {
            task.stop();
        }
    }

    /// Moves the active mapping into the unconfirmed slot and clears the watch. Returns the
    /// mapping readers last saw. Callers hold the negotiation lock
    fn retire_active(&self) -> Option<Mapping> {
        let retired = {
            let mut shared = self.shared.lock();
            let active = shared.mapping.take().zip(shared.client.take());
            if let Some((mapping, client)) = active {
                shared.unconfirmed = Some((mapping.clone(), client));
                Some(mapping)
            } else {
                None
            }
        };

        if retired.is_some() {
            self.mapping_tx.send_replace(None);
        }
        retired
    }

    /// Returns the lease the gateway accepted
    async fn add_with_fallback(
        &self,
        client: &dyn PortMapper,
        request: AddPortMapping,
    ) -> Result<u32, PortMapError> {
        match client.add_port_mapping(&request).await {
            Ok(()) => Ok(request.lease_duration),
            Err(PortMapError::ProtocolFault(fault))
                if fault.only_permanent_leases_supported() && request.lease_duration != 0 =>
            {
                self.sink.record(
                    DiagnosticKind::Fault,
                    &format!(
                        "{} rejected a {}s lease ({fault}); requesting a permanent mapping",
                        client.service(),
                        request.lease_duration
                    ),
                );
                let request = AddPortMapping {
                    lease_duration: 0,
                    ..request
                };
                client.add_port_mapping(&request).await.map(|_| 0)
            }
            Err(err) => Err(err),
        }
    }

    async fn send_delete(
        &self,
        mapping: &Mapping,
        client: &dyn PortMapper,
    ) -> Result<(), PortMapError> {
        let request = DeletePortMapping {
            external_port: mapping.external_port,
            protocol: mapping.protocol,
        };

        match client.delete_port_mapping(&request).await {
            Err(PortMapError::ProtocolFault(fault)) if fault.no_such_entry() => {
                log::trace!(target: "citadel", "mapping {} already gone from the gateway", mapping.external_port);
                Ok(())
            }
            res => res,
        }
    }

    fn spawn_renewal(this: &Arc<Self>) -> RenewalTask {
        let token = this.shutdown.child_token();
        let handle = tokio::spawn(Self::renewal_loop(this.clone(), token.clone()));
        RenewalTask { token, handle }
    }

    async fn renewal_loop(this: Arc<Self>, token: CancellationToken) {
        loop {
            let Some(renew_at) = this.shared.lock().mapping.as_ref().and_then(Mapping::renew_at)
            else {
                return;
            };

            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(renew_at) => {}
            }

            if !this.renew_until_expiry(&token).await {
                return;
            }
        }
    }

    /// Returns true while the mapping still needs renewing
    async fn renew_until_expiry(&self, token: &CancellationToken) -> bool {
        loop {
            let guard = tokio::select! {
                biased;
                _ = token.cancelled() => return false,
                guard = self.negotiation.lock() => guard,
            };

            // the lock is held from here on, so nobody else replaces the mapping or this task
            if token.is_cancelled() {
                return false;
            }

            let (mapping, client) = {
                let mut shared = self.shared.lock();
                let Some(active) = shared.mapping.clone().zip(shared.client.clone()) else {
                    return false;
                };
                shared.state = MappingState::Renewing;
                active
            };

            let request = AddPortMapping {
                external_port: mapping.external_port,
                protocol: mapping.protocol,
                internal_port: mapping.internal_addr.port(),
                internal_client: *mapping.internal_addr.ip(),
                description: self.description.clone(),
                lease_duration: mapping.lease_seconds,
            };

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return false,
                res = self.add_with_fallback(client.as_ref(), request) => res,
            };

            match result {
                Ok(lease) => {
                    let mut renewed = mapping;
                    renewed.lease_granted(lease, Instant::now());
                    {
                        let mut shared = self.shared.lock();
                        shared.state = MappingState::Mapped {
                            permanent: renewed.permanent,
                        };
                        shared.mapping = Some(renewed.clone());
                        if renewed.permanent {
                            shared.renewal = None;
                        }
                    }
                    log::trace!(target: "citadel", "renewed mapping {:?}", renewed);
                    self.sink.record(
                        DiagnosticKind::Renewal,
                        &format!(
                            "renewed {} {} for {}s",
                            renewed.protocol, renewed.external_port, renewed.lease_seconds
                        ),
                    );
                    let permanent = renewed.permanent;
                    self.mapping_tx.send_replace(Some(renewed.clone()));
                    let _ = self.events.send(MappingEvent::Renewed(renewed));
                    return !permanent;
                }

                Err(err) => {
                    self.set_state(MappingState::Mapped { permanent: false });
                    drop(guard);

                    let expires_at = mapping.expires_at.unwrap_or_else(Instant::now);
                    let retry_at = Instant::now() + self.renewal_retry_interval;
                    self.sink.record(
                        DiagnosticKind::Renewal,
                        &format!(
                            "renewing {} {} failed: {err}",
                            mapping.protocol, mapping.external_port
                        ),
                    );

                    if retry_at < expires_at {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => return false,
                            _ = tokio::time::sleep_until(retry_at) => continue,
                        }
                    }

                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return false,
                        _ = tokio::time::sleep_until(expires_at) => {}
                    }

                    self.expire(token, mapping, err).await;
                    return false;
                }
            }
        }
    }

    async fn expire(&self, token: &CancellationToken, mapping: Mapping, cause: PortMapError) {
        let _guard = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            guard = self.negotiation.lock() => guard,
        };

        if token.is_cancelled() {
            return;
        }

        {
            let mut shared = self.shared.lock();
            shared.state = MappingState::Unmapped;
            shared.mapping = None;
            shared.client = None;
            shared.renewal = None;
        }

        self.sink.record(
            DiagnosticKind::Fault,
            &format!(
                "mapping {} {} expired without renewal",
                mapping.protocol, mapping.external_port
            ),
        );
        self.mapping_tx.send_replace(None);
        let _ = self.events.send(MappingEvent::Lost {
            mapping,
            error: PortMapError::RenewalFailure(cause.to_string()),
        });
    }
}
