//! The socket and session pool seen from the stream factory.
//!
//! Jobs never manage connections themselves. They describe what they want
//! with a [`JobTarget`] and ask a [`TransportPool`] to establish it, which
//! keeps connection reuse out of the racing logic.
mod default;
mod tunnel;

use std::{future::Future, time::Duration};

pub use default::{DefaultTransportPool, PoolKey, TransportStream};
use http::{HeaderMap, HeaderValue, StatusCode, Uri};
use smol_str::SmolStr;
use thiserror::Error as ThisError;

use crate::{
    alt_svc::{NextProto, QuicVersion},
    factory::JobType,
    key::{HostPortPair, NetworkIsolationKey, PrivacyMode, RequestPriority, SchemeHostPort},
    proxy::{ProxyScheme, ProxyServer},
    NetError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslConfig {
    pub alpn_protocols: Vec<SmolStr>,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            alpn_protocols: vec!["h2".into(), "http/1.1".into()],
        }
    }
}

impl SslConfig {
    #[inline]
    pub fn http11_only() -> Self {
        Self {
            alpn_protocols: vec!["http/1.1".into()],
        }
    }
}

/// Everything a pool needs to know to establish one job's connection.
#[derive(Debug, Clone)]
pub struct JobTarget {
    pub job_type: JobType,
    /// Where the connection goes, after host mapping. For alternative jobs this
    /// is the alternative endpoint.
    pub destination: SchemeHostPort,
    pub origin_url: Uri,
    pub proxy: ProxyServer,
    /// Expected protocol. `Quic` for QUIC jobs, `Http2` when only an HTTP/2
    /// connection is acceptable, `Unknown` otherwise.
    pub protocol: NextProto,
    pub quic_version: Option<QuicVersion>,
    pub priority: RequestPriority,
    pub privacy_mode: PrivacyMode,
    pub network_isolation_key: NetworkIsolationKey,
    pub server_ssl_config: SslConfig,
    pub proxy_ssl_config: SslConfig,
    pub is_websocket: bool,
    pub enable_ip_based_pooling: bool,
    /// Set when a tunnel is restarted with credentials.
    pub proxy_authorization: Option<HeaderValue>,
}

impl JobTarget {
    #[inline]
    pub fn using_quic(&self) -> bool {
        self.protocol == NextProto::Quic || self.proxy.scheme() == ProxyScheme::Quic
    }

    #[inline]
    pub fn expect_http2(&self) -> bool {
        self.protocol == NextProto::Http2
    }

    #[inline]
    pub fn require_dns_https_alpn(&self) -> bool {
        matches!(
            self.job_type,
            JobType::DnsAlpnH3 | JobType::PreconnectDnsAlpnH3
        )
    }

    /// Whether the connection to a non-QUIC proxy tunnels through CONNECT.
    #[inline]
    pub fn establishes_tunnel(&self) -> bool {
        matches!(self.proxy.scheme(), ProxyScheme::Http | ProxyScheme::Https)
            && (self.destination.scheme.is_secure() || self.is_websocket)
    }

    /// The key of a QUIC session this job could share.
    pub fn quic_session_key(&self) -> QuicSessionKey {
        let server = match SchemeHostPort::try_from(&self.origin_url) {
            Ok(origin) => origin.host_port_pair(),
            Err(_) => self.destination.host_port_pair(),
        };
        QuicSessionKey {
            server,
            privacy_mode: self.privacy_mode,
            network_isolation_key: self.network_isolation_key.clone(),
            require_dns_https_alpn: self.require_dns_https_alpn(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicSessionKey {
    pub server: HostPortPair,
    pub privacy_mode: PrivacyMode,
    pub network_isolation_key: NetworkIsolationKey,
    pub require_dns_https_alpn: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub endpoint: HostPortPair,
    pub error: NetError,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveErrorInfo {
    pub error: Option<NetError>,
    pub is_secure_network_error: bool,
}

/// A 407 answer of a proxy to CONNECT.
#[derive(Debug, Clone)]
pub struct ProxyAuthChallenge {
    pub proxy: ProxyServer,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// A connection handed back by the pool.
#[derive(Debug)]
pub struct Established<S> {
    pub stream: S,
    pub negotiated_protocol: NextProto,
    pub was_alpn_negotiated: bool,
    /// The pool reused a live session instead of connecting.
    pub using_existing_session: bool,
    /// A QUIC connection that had to leave the default network to succeed.
    pub failed_on_default_network: bool,
    pub connection_attempts: Vec<ConnectionAttempt>,
}

impl<S> Established<S> {
    #[inline]
    pub fn new(stream: S, negotiated_protocol: NextProto) -> Self {
        Self {
            stream,
            was_alpn_negotiated: negotiated_protocol != NextProto::Unknown,
            negotiated_protocol,
            using_existing_session: false,
            failed_on_default_network: false,
            connection_attempts: Vec::new(),
        }
    }
}

#[derive(ThisError, Debug, Clone)]
#[error("connect failed: {error}")]
pub struct ConnectError {
    pub error: NetError,
    pub failed_on_default_network: bool,
    pub resolve_error_info: ResolveErrorInfo,
    pub proxy_auth_challenge: Option<ProxyAuthChallenge>,
    pub connection_attempts: Vec<ConnectionAttempt>,
}

impl From<NetError> for ConnectError {
    #[inline]
    fn from(error: NetError) -> Self {
        Self {
            error,
            failed_on_default_network: false,
            resolve_error_info: ResolveErrorInfo::default(),
            proxy_auth_challenge: None,
            connection_attempts: Vec::new(),
        }
    }
}

impl From<std::io::Error> for ConnectError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        NetError::from(e).into()
    }
}

/// Socket, HTTP/2 and QUIC session pools behind one interface.
pub trait TransportPool: 'static {
    type Stream: 'static;

    fn connect(
        &self,
        target: &JobTarget,
    ) -> impl Future<Output = Result<Established<Self::Stream>, ConnectError>>;

    /// Warms up to `num_streams` connections for `target` without handing
    /// any of them out.
    fn preconnect(
        &self,
        target: &JobTarget,
        num_streams: usize,
    ) -> impl Future<Output = Result<(), ConnectError>>;

    fn has_available_http2_session(&self, _target: &JobTarget) -> bool {
        false
    }

    fn can_use_existing_quic_session(
        &self,
        _key: &QuicSessionKey,
        _destination: &SchemeHostPort,
    ) -> bool {
        false
    }

    fn has_active_socket(&self, _target: &JobTarget) -> bool {
        false
    }

    /// Reprioritises the pending connect or preconnect for `target`. Pools
    /// that never queue attempts can ignore it.
    fn set_priority(&self, _target: &JobTarget, _priority: RequestPriority) {}

    /// How long a blocked main job should wait for a pending QUIC job.
    fn main_job_delay_hint(&self, _target: &JobTarget) -> Duration {
        Duration::ZERO
    }
}
