use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use http::{HeaderValue, Method, Uri};
use smol_str::SmolStr;

use super::controller::JobController;
use crate::{
    alt_svc::NextProto,
    key::{HostPortPair, NetworkIsolationKey, PrivacyMode, RequestPriority},
    proxy::ProxyInfo,
    transport::{
        ConnectionAttempt, Established, ProxyAuthChallenge, ResolveErrorInfo, SslConfig,
        TransportPool,
    },
    NetError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamType {
    #[default]
    Http,
    BidirectionalStream,
    WebSocket,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadFlags {
    /// Skip proxy resolution and connect directly.
    pub bypass_proxy: bool,
}

/// What the caller wants a stream for.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub url: Uri,
    pub method: Method,
    pub load_flags: LoadFlags,
    pub privacy_mode: PrivacyMode,
    pub network_isolation_key: NetworkIsolationKey,
}

impl RequestInfo {
    pub fn new(url: Uri) -> Self {
        Self {
            url,
            method: Method::GET,
            load_flags: LoadFlags::default(),
            privacy_mode: PrivacyMode::Disabled,
            network_isolation_key: NetworkIsolationKey::default(),
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn bypass_proxy(mut self) -> Self {
        self.load_flags.bypass_proxy = true;
        self
    }

    pub fn with_privacy_mode(mut self, privacy_mode: PrivacyMode) -> Self {
        self.privacy_mode = privacy_mode;
        self
    }

    pub fn with_network_isolation_key(mut self, nik: NetworkIsolationKey) -> Self {
        self.network_isolation_key = nik;
        self
    }
}

/// Per-request knobs that do not describe the request itself.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub priority: RequestPriority,
    pub server_ssl_config: SslConfig,
    pub proxy_ssl_config: SslConfig,
    pub enable_ip_based_pooling: bool,
    pub enable_alternative_services: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            priority: RequestPriority::default(),
            server_ssl_config: SslConfig::default(),
            proxy_ssl_config: SslConfig::default(),
            enable_ip_based_pooling: true,
            enable_alternative_services: true,
        }
    }
}

impl RequestOptions {
    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_server_ssl_config(mut self, config: SslConfig) -> Self {
        self.server_ssl_config = config;
        self
    }

    pub fn disable_alternative_services(mut self) -> Self {
        self.enable_alternative_services = false;
        self
    }

    pub fn disable_ip_based_pooling(mut self) -> Self {
        self.enable_ip_based_pooling = false;
        self
    }
}

/// Coarse progress of a request, as shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    ResolvingProxyForUrl,
    /// Waiting for the delegate to answer a prompt.
    WaitingForDelegate,
    EstablishingProxyTunnel,
    Connecting,
}

/// The stream a request receives once a job wins.
#[derive(Debug)]
pub enum ReadyStream<S> {
    Http(S),
    Bidirectional(S),
    WebSocket(WebSocketHandshakeStream<S>),
}

impl<S> ReadyStream<S> {
    pub fn into_inner(self) -> S {
        match self {
            ReadyStream::Http(s) | ReadyStream::Bidirectional(s) => s,
            ReadyStream::WebSocket(ws) => ws.stream,
        }
    }
}

/// A connection ready to carry a WebSocket opening handshake.
#[derive(Debug)]
pub struct WebSocketHandshakeStream<S> {
    pub stream: S,
    pub negotiated_protocol: NextProto,
    pub using_proxy: bool,
    pub requested_subprotocols: Vec<SmolStr>,
}

/// Wraps the connection of a winning job for the WebSocket layer.
pub trait WebSocketHandshakeStreamCreateHelper<S> {
    fn create_handshake_stream(
        &self,
        established: Established<S>,
        using_proxy: bool,
    ) -> WebSocketHandshakeStream<S>;
}

/// Hands the raw connection through together with the subprotocols to offer.
#[derive(Debug, Clone, Default)]
pub struct BasicWebSocketHandshakeStreamCreateHelper {
    pub requested_subprotocols: Vec<SmolStr>,
}

impl<S> WebSocketHandshakeStreamCreateHelper<S> for BasicWebSocketHandshakeStreamCreateHelper {
    fn create_handshake_stream(
        &self,
        established: Established<S>,
        using_proxy: bool,
    ) -> WebSocketHandshakeStream<S> {
        WebSocketHandshakeStream {
            stream: established.stream,
            negotiated_protocol: established.negotiated_protocol,
            using_proxy,
            requested_subprotocols: self.requested_subprotocols.clone(),
        }
    }
}

/// The terminal failure of a request.
#[derive(Debug, Clone)]
pub struct StreamFailure {
    pub error: NetError,
    pub used_ssl_config: SslConfig,
    /// Empty when the request failed before a proxy was chosen.
    pub used_proxy_info: ProxyInfo,
    pub resolve_error_info: ResolveErrorInfo,
}

/// Receives the outcome of a stream request.
///
/// Exactly one of `on_stream_ready` and `on_stream_failed` is called per
/// request, unless the request is dropped first. The prompts may come before
/// that; the request stays pending until the caller answers or drops it.
pub trait StreamRequestDelegate<S> {
    fn on_stream_ready(
        &self,
        stream: ReadyStream<S>,
        used_ssl_config: &SslConfig,
        used_proxy_info: &ProxyInfo,
    );

    fn on_stream_failed(&self, failure: StreamFailure);

    fn on_certificate_error(
        &self,
        _error: NetError,
        _used_ssl_config: &SslConfig,
        _server: &HostPortPair,
    ) {
    }

    fn on_needs_client_auth(&self, _used_ssl_config: &SslConfig, _server: &HostPortPair) {}

    /// Answer with [`StreamRequest::restart_tunnel_with_proxy_auth`].
    fn on_needs_proxy_auth(
        &self,
        _challenge: &ProxyAuthChallenge,
        _used_ssl_config: &SslConfig,
        _used_proxy_info: &ProxyInfo,
    ) {
    }

    /// Every QUIC alternative advertised for the origin is broken.
    fn on_quic_broken(&self) {}
}

#[derive(Debug, Default)]
pub(crate) struct RequestState {
    pub(crate) completed: bool,
    pub(crate) was_alpn_negotiated: bool,
    pub(crate) negotiated_protocol: NextProto,
    pub(crate) using_spdy: bool,
    pub(crate) connection_attempts: Vec<ConnectionAttempt>,
}

impl RequestState {
    pub(crate) fn complete(&mut self, was_alpn_negotiated: bool, negotiated_protocol: NextProto) {
        self.completed = true;
        self.was_alpn_negotiated = was_alpn_negotiated;
        self.negotiated_protocol = negotiated_protocol;
        self.using_spdy = matches!(negotiated_protocol, NextProto::Http2 | NextProto::Quic);
    }
}

/// Handle of a pending stream request. Dropping it cancels every job not yet
/// handed out.
pub struct StreamRequest<P: TransportPool> {
    controller: Weak<JobController<P>>,
    state: Rc<RefCell<RequestState>>,
    stream_type: StreamType,
}

impl<P: TransportPool> std::fmt::Debug for StreamRequest<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRequest")
            .field("stream_type", &self.stream_type)
            .field("state", &self.state.borrow())
            .finish()
    }
}

impl<P: TransportPool> StreamRequest<P> {
    pub(crate) fn new(
        controller: Weak<JobController<P>>,
        state: Rc<RefCell<RequestState>>,
        stream_type: StreamType,
    ) -> Self {
        Self {
            controller,
            state,
            stream_type,
        }
    }

    #[inline]
    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn load_state(&self) -> LoadState {
        self.controller
            .upgrade()
            .map(|c| c.load_state())
            .unwrap_or_default()
    }

    pub fn set_priority(&self, priority: RequestPriority) {
        if let Some(controller) = self.controller.upgrade() {
            controller.set_priority(priority);
        }
    }

    /// Retries the proxy tunnel of the bound job with `authorization` as the
    /// `Proxy-Authorization` header.
    pub fn restart_tunnel_with_proxy_auth(&self, authorization: HeaderValue) -> crate::Result<()> {
        let restarted = self
            .controller
            .upgrade()
            .map(|c| c.restart_tunnel_with_proxy_auth(authorization))
            .unwrap_or(false);
        if restarted {
            Ok(())
        } else {
            Err(NetError::Failed.into())
        }
    }

    #[inline]
    pub fn completed(&self) -> bool {
        self.state.borrow().completed
    }

    #[inline]
    pub fn was_alpn_negotiated(&self) -> bool {
        self.state.borrow().was_alpn_negotiated
    }

    #[inline]
    pub fn negotiated_protocol(&self) -> NextProto {
        self.state.borrow().negotiated_protocol
    }

    #[inline]
    pub fn using_spdy(&self) -> bool {
        self.state.borrow().using_spdy
    }

    pub fn connection_attempts(&self) -> Vec<ConnectionAttempt> {
        self.state.borrow().connection_attempts.clone()
    }
}

impl<P: TransportPool> Drop for StreamRequest<P> {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.upgrade() {
            controller.on_request_complete();
        }
    }
}
