//! Stream acquisition: turns a request into a usable stream by racing
//! connection jobs.
//!
//! A [`StreamFactory`] creates one job controller per request. The controller
//! resolves the proxy, starts a main job and, when the origin advertises one,
//! an alternative-service job and a DNS-discovered HTTP/3 job. The first job
//! to produce a stream is bound to the request; the others are orphaned and
//! left to finish so that failing alternatives can be marked broken.
mod controller;
mod job;
mod request;
mod selection;
#[cfg(test)]
mod tests;

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use http::{header::ALT_SVC, HeaderMap};
pub use job::{is_port_allowed, JobType};
pub use request::{
    BasicWebSocketHandshakeStreamCreateHelper, LoadFlags, LoadState, ReadyStream, RequestInfo,
    RequestOptions, StreamFailure, StreamRequest, StreamRequestDelegate, StreamType,
    WebSocketHandshakeStream, WebSocketHandshakeStreamCreateHelper,
};

use self::controller::JobController;
use crate::{
    alt_svc::{
        parse_alt_svc, AltSvcEntry, AltSvcHeader, AlternativeService, AlternativeServiceInfo,
        HttpServerProperties, NextProto, QuicVersion,
    },
    config::StreamFactoryConfig,
    host_mapping::HostMappingRules,
    key::{NetworkIsolationKey, SchemeHostPort},
    observer::{NoopObserver, StreamFactoryObserver},
    proxy::{FixedProxyResolutionService, ProxyResolutionService},
    transport::TransportPool,
    Result,
};

/// Everything the controllers of one factory share.
pub struct Session<P> {
    config: StreamFactoryConfig,
    host_mapping_rules: HostMappingRules,
    http_server_properties: Rc<HttpServerProperties>,
    proxy_resolution_service: Rc<dyn ProxyResolutionService>,
    pool: Rc<P>,
    observer: Rc<dyn StreamFactoryObserver>,
}

impl<P> std::fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("host_mapping_rules", &self.host_mapping_rules)
            .finish()
    }
}

impl<P> Session<P> {
    /// Creates a session connecting directly, with empty server properties.
    pub fn new(config: StreamFactoryConfig, pool: P) -> Result<Self> {
        let host_mapping_rules = config.host_mapping_rules.parse()?;
        Ok(Self {
            config,
            host_mapping_rules,
            http_server_properties: Rc::new(HttpServerProperties::default()),
            proxy_resolution_service: Rc::new(FixedProxyResolutionService::direct()),
            pool: Rc::new(pool),
            observer: Rc::new(NoopObserver),
        })
    }

    pub fn with_http_server_properties(mut self, properties: Rc<HttpServerProperties>) -> Self {
        self.http_server_properties = properties;
        self
    }

    pub fn with_proxy_resolution_service(
        mut self,
        service: Rc<dyn ProxyResolutionService>,
    ) -> Self {
        self.proxy_resolution_service = service;
        self
    }

    pub fn with_observer(mut self, observer: Rc<dyn StreamFactoryObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[inline]
    pub fn config(&self) -> &StreamFactoryConfig {
        &self.config
    }

    #[inline]
    pub fn host_mapping_rules(&self) -> &HostMappingRules {
        &self.host_mapping_rules
    }

    #[inline]
    pub fn http_server_properties(&self) -> &HttpServerProperties {
        &self.http_server_properties
    }

    #[inline]
    pub fn proxy_resolution_service(&self) -> &dyn ProxyResolutionService {
        self.proxy_resolution_service.as_ref()
    }

    #[inline]
    pub fn pool(&self) -> &P {
        &self.pool
    }

    #[inline]
    pub fn observer(&self) -> &dyn StreamFactoryObserver {
        self.observer.as_ref()
    }
}

/// The live controllers of a factory, keyed by controller id.
pub(crate) struct ControllerSet<P: TransportPool> {
    live: RefCell<HashMap<u64, Rc<JobController<P>>>>,
    next_id: Cell<u64>,
}

impl<P: TransportPool> ControllerSet<P> {
    fn new() -> Self {
        Self {
            live: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    pub(crate) fn on_job_controller_complete(&self, id: u64) {
        let removed = self.live.borrow_mut().remove(&id);
        if removed.is_none() {
            unreachable!("job controller {id} completed twice or never registered");
        }
        #[cfg(feature = "logging")]
        tracing::debug!("job controller {id} complete");
    }
}

/// Entry point for stream requests and preconnects.
pub struct StreamFactory<P: TransportPool> {
    session: Rc<Session<P>>,
    controllers: Rc<ControllerSet<P>>,
}

impl<P: TransportPool> std::fmt::Debug for StreamFactory<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFactory")
            .field("session", &self.session)
            .field("job_controllers", &self.num_job_controllers())
            .finish()
    }
}

impl<P: TransportPool> StreamFactory<P> {
    pub fn new(session: Session<P>) -> Self {
        Self {
            session: Rc::new(session),
            controllers: Rc::new(ControllerSet::new()),
        }
    }

    #[inline]
    pub fn session(&self) -> &Session<P> {
        &self.session
    }

    /// Number of controllers still racing, waiting on their request or
    /// finishing orphaned jobs.
    #[inline]
    pub fn num_job_controllers(&self) -> usize {
        self.controllers.live.borrow().len()
    }

    /// Requests an HTTP stream. The outcome arrives through `delegate`, never
    /// before this returns.
    pub fn request_stream(
        &self,
        request_info: RequestInfo,
        options: RequestOptions,
        delegate: Rc<dyn StreamRequestDelegate<P::Stream>>,
    ) -> StreamRequest<P> {
        self.request_stream_internal(request_info, options, delegate, None, StreamType::Http)
    }

    /// Requests a stream for a WebSocket opening handshake; `helper` wraps the
    /// winning connection.
    pub fn request_websocket_handshake_stream(
        &self,
        request_info: RequestInfo,
        options: RequestOptions,
        delegate: Rc<dyn StreamRequestDelegate<P::Stream>>,
        helper: Rc<dyn WebSocketHandshakeStreamCreateHelper<P::Stream>>,
    ) -> StreamRequest<P> {
        self.request_stream_internal(
            request_info,
            options,
            delegate,
            Some(helper),
            StreamType::WebSocket,
        )
    }

    /// # Panics
    ///
    /// Panics if the url is not `https`.
    pub fn request_bidirectional_stream_impl(
        &self,
        request_info: RequestInfo,
        options: RequestOptions,
        delegate: Rc<dyn StreamRequestDelegate<P::Stream>>,
    ) -> StreamRequest<P> {
        assert_eq!(
            request_info.url.scheme_str(),
            Some("https"),
            "bidirectional streams need a secure url"
        );
        self.request_stream_internal(
            request_info,
            options,
            delegate,
            None,
            StreamType::BidirectionalStream,
        )
    }

    fn request_stream_internal(
        &self,
        request_info: RequestInfo,
        options: RequestOptions,
        delegate: Rc<dyn StreamRequestDelegate<P::Stream>>,
        helper: Option<Rc<dyn WebSocketHandshakeStreamCreateHelper<P::Stream>>>,
        stream_type: StreamType,
    ) -> StreamRequest<P> {
        let controller = self.create_controller(request_info, options, false, helper.is_some());
        controller.start(delegate, helper, stream_type)
    }

    /// Warms up `num_streams` connections for the request's origin.
    pub fn preconnect_streams(&self, num_streams: usize, request_info: RequestInfo) {
        let options = RequestOptions {
            priority: crate::key::RequestPriority::Idle,
            ..Default::default()
        };
        let controller = self.create_controller(request_info, options, true, false);
        controller.preconnect(num_streams);
    }

    fn create_controller(
        &self,
        request_info: RequestInfo,
        options: RequestOptions,
        is_preconnect: bool,
        is_websocket: bool,
    ) -> Rc<JobController<P>> {
        let id = self.controllers.next_id();
        let controller = JobController::new(
            id,
            self.session.clone(),
            Rc::downgrade(&self.controllers),
            request_info,
            options,
            is_preconnect,
            is_websocket,
        );
        self.controllers
            .live
            .borrow_mut()
            .insert(id, controller.clone());
        controller
    }

    /// Records the `Alt-Svc` header of a response from `origin`. `clear` drops
    /// whatever was known; a malformed header is ignored.
    pub fn process_alternative_services(
        &self,
        network_isolation_key: &NetworkIsolationKey,
        headers: &HeaderMap,
        origin: &SchemeHostPort,
    ) {
        let Some(value) = headers.get(ALT_SVC).and_then(|v| v.to_str().ok()) else {
            return;
        };
        let Some(header) = parse_alt_svc(value) else {
            #[cfg(feature = "logging")]
            tracing::debug!("ignoring malformed Alt-Svc from {origin}: {value}");
            return;
        };
        let infos = match header {
            AltSvcHeader::Clear => Vec::new(),
            AltSvcHeader::Entries(entries) => self.alternative_service_infos(entries, origin),
        };
        let origin = self.session.host_mapping_rules.rewrite_origin(origin);
        self.session.http_server_properties.set_alternative_services(
            &origin,
            network_isolation_key,
            infos,
        );
    }

    fn alternative_service_infos(
        &self,
        entries: Vec<AltSvcEntry>,
        origin: &SchemeHostPort,
    ) -> Vec<AlternativeServiceInfo> {
        let config = &self.session.config;
        let now = self.session.http_server_properties.now();
        entries
            .into_iter()
            .filter_map(|entry| {
                if entry.port == 0 {
                    return None;
                }
                let host = if entry.host.is_empty() {
                    origin.host.clone()
                } else {
                    entry.host
                };
                let expiration = now.checked_add(entry.max_age)?;
                if entry.protocol_id == "h2" {
                    if !config.http2_alt_service_enabled {
                        return None;
                    }
                    let service = AlternativeService::new(NextProto::Http2, host, entry.port);
                    return Some(AlternativeServiceInfo::new_http2(service, expiration));
                }
                let version = QuicVersion::from_alpn(entry.protocol_id.as_bytes())?;
                if !config.is_quic_enabled() || !config.supported_quic_versions.contains(&version)
                {
                    return None;
                }
                let service = AlternativeService::new(NextProto::Quic, host, entry.port);
                Some(AlternativeServiceInfo::new_quic(
                    service,
                    expiration,
                    vec![version],
                ))
            })
            .collect()
    }
}

/// Alternative service a DNS-discovered HTTP/3 job stands for. Only the
/// origin port is supported.
#[inline]
pub(crate) fn alternative_service_for_dns_job(origin: &SchemeHostPort) -> AlternativeService {
    AlternativeService::new(NextProto::Quic, origin.host.clone(), origin.port)
}
