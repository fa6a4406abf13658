use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    net::ToSocketAddrs,
    time::Duration,
};

use monoio::{
    io::{AsyncReadRent, AsyncWriteRent, Split},
    net::TcpStream,
};
use smol_str::SmolStr;

use super::{
    tunnel, ConnectError, ConnectionAttempt, Established, JobTarget, ResolveErrorInfo,
    TransportPool,
};
use crate::{
    alt_svc::NextProto,
    connectors::{
        bare_host, server_name, tls_error_to_net, ConnectorExt, TcpConnector, TlsAddr,
        TlsConnector, TlsStream, TransportConnMetadata,
    },
    key::{HostPortPair, NetworkIsolationKey, PrivacyMode, SchemeHostPort},
    pool::{ConnectionPool, Poolable, Pooled},
    proxy::{ProxyScheme, ProxyServer},
    NetError,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connections are only shared between jobs that agree on all of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub destination: SchemeHostPort,
    pub proxy: ProxyServer,
    pub privacy_mode: PrivacyMode,
    pub network_isolation_key: NetworkIsolationKey,
}

impl From<&JobTarget> for PoolKey {
    #[inline]
    fn from(target: &JobTarget) -> Self {
        Self {
            destination: target.destination.clone(),
            proxy: target.proxy.clone(),
            privacy_mode: target.privacy_mode,
            network_isolation_key: target.network_isolation_key.clone(),
        }
    }
}

#[derive(Debug)]
enum RawStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

/// A TCP or TLS connection that remembers whether it is still usable.
///
/// A stream that saw an error, end of file or `shutdown` is not returned to
/// the idle pool when dropped.
#[derive(Debug)]
pub struct TransportStream {
    io: RawStream,
    negotiated_protocol: NextProto,
    open: bool,
}

impl TransportStream {
    fn tcp(io: TcpStream) -> Self {
        Self {
            io: RawStream::Tcp(io),
            negotiated_protocol: NextProto::Unknown,
            open: true,
        }
    }

    fn tls(io: TlsStream<TcpStream>) -> Self {
        let negotiated_protocol = io.get_conn_metadata().negotiated_protocol();
        Self {
            io: RawStream::Tls(io),
            negotiated_protocol,
            open: true,
        }
    }

    #[inline]
    pub fn negotiated_protocol(&self) -> NextProto {
        self.negotiated_protocol
    }

    #[inline]
    pub fn is_tls(&self) -> bool {
        matches!(self.io, RawStream::Tls(_))
    }

    #[inline]
    fn observe<T>(&mut self, res: &std::io::Result<T>, eof: bool) {
        if res.is_err() || eof {
            self.open = false;
        }
    }
}

impl Poolable for TransportStream {
    #[inline]
    fn is_open(&self) -> bool {
        self.open
    }
}

impl AsyncReadRent for TransportStream {
    #[inline]
    async fn read<T: monoio::buf::IoBufMut>(&mut self, buf: T) -> monoio::BufResult<usize, T> {
        let (res, buf) = match &mut self.io {
            RawStream::Tcp(inner) => inner.read(buf).await,
            RawStream::Tls(inner) => inner.read(buf).await,
        };
        let eof = matches!(res, Ok(0));
        self.observe(&res, eof);
        (res, buf)
    }

    #[inline]
    async fn readv<T: monoio::buf::IoVecBufMut>(&mut self, buf: T) -> monoio::BufResult<usize, T> {
        let (res, buf) = match &mut self.io {
            RawStream::Tcp(inner) => inner.readv(buf).await,
            RawStream::Tls(inner) => inner.readv(buf).await,
        };
        let eof = matches!(res, Ok(0));
        self.observe(&res, eof);
        (res, buf)
    }
}

impl AsyncWriteRent for TransportStream {
    #[inline]
    async fn write<T: monoio::buf::IoBuf>(&mut self, buf: T) -> monoio::BufResult<usize, T> {
        let (res, buf) = match &mut self.io {
            RawStream::Tcp(inner) => inner.write(buf).await,
            RawStream::Tls(inner) => inner.write(buf).await,
        };
        self.observe(&res, false);
        (res, buf)
    }

    #[inline]
    async fn writev<T: monoio::buf::IoVecBuf>(
        &mut self,
        buf_vec: T,
    ) -> monoio::BufResult<usize, T> {
        let (res, buf_vec) = match &mut self.io {
            RawStream::Tcp(inner) => inner.writev(buf_vec).await,
            RawStream::Tls(inner) => inner.writev(buf_vec).await,
        };
        self.observe(&res, false);
        (res, buf_vec)
    }

    #[inline]
    async fn flush(&mut self) -> std::io::Result<()> {
        let res = match &mut self.io {
            RawStream::Tcp(inner) => inner.flush().await,
            RawStream::Tls(inner) => inner.flush().await,
        };
        self.observe(&res, false);
        res
    }

    #[inline]
    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.open = false;
        match &mut self.io {
            RawStream::Tcp(inner) => inner.shutdown().await,
            RawStream::Tls(inner) => inner.shutdown().await,
        }
    }
}

unsafe impl Split for TransportStream {}

/// TCP and TLS transport with idle connection reuse.
///
/// Plain HTTP proxies are supported, tunnelling with `CONNECT` for secure
/// and WebSocket destinations. QUIC, SOCKS and HTTPS proxies fail with
/// [`NetError::NotImplemented`].
pub struct DefaultTransportPool {
    tcp: TcpConnector,
    tls: RefCell<HashMap<Vec<SmolStr>, TlsConnector<TcpConnector>>>,
    idle: ConnectionPool<PoolKey, TransportStream>,
    h2_keys: RefCell<HashSet<PoolKey>>,
    connect_timeout: Duration,
}

impl Default for DefaultTransportPool {
    fn default() -> Self {
        Self::new(ConnectionPool::default())
    }
}

impl std::fmt::Debug for DefaultTransportPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultTransportPool")
            .field("idle", &self.idle.total_idle_count())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl DefaultTransportPool {
    pub fn new(idle: ConnectionPool<PoolKey, TransportStream>) -> Self {
        Self {
            tcp: TcpConnector { no_delay: true },
            tls: RefCell::new(HashMap::new()),
            idle,
            h2_keys: RefCell::new(HashSet::new()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[inline]
    pub fn idle_pool(&self) -> &ConnectionPool<PoolKey, TransportStream> {
        &self.idle
    }

    fn tls_connector(&self, alpn: &[SmolStr]) -> TlsConnector<TcpConnector> {
        self.tls
            .borrow_mut()
            .entry(alpn.to_vec())
            .or_insert_with(|| TlsConnector::new_with_alpn(self.tcp, alpn))
            .clone()
    }

    async fn tcp_connect(&self, endpoint: &HostPortPair) -> Result<TcpStream, ConnectError> {
        let addrs: Vec<_> = match (bare_host(&endpoint.host), endpoint.port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(_) => Vec::new(),
        };
        if addrs.is_empty() {
            return Err(name_not_resolved());
        }
        match self
            .tcp
            .connect_with_timeout(addrs.as_slice(), self.connect_timeout)
            .await
        {
            Ok(Ok(io)) => Ok(io),
            Ok(Err(e)) => Err(attempt_failed(endpoint, e.into())),
            Err(_) => Err(attempt_failed(endpoint, NetError::ConnectionTimedOut)),
        }
    }

    async fn connect_direct(&self, target: &JobTarget) -> Result<TransportStream, ConnectError> {
        let endpoint = target.destination.host_port_pair();
        if !target.destination.scheme.is_secure() {
            return self.tcp_connect(&endpoint).await.map(TransportStream::tcp);
        }

        let addr = TlsAddr::try_from(&endpoint).map_err(|_| NetError::NameNotResolved)?;
        if addr.to_socket_addrs().map(|mut a| a.next().is_none()).unwrap_or(true) {
            return Err(name_not_resolved());
        }
        let tls = self.tls_connector(&target.server_ssl_config.alpn_protocols);
        match tls.connect_with_timeout(addr, self.connect_timeout).await {
            Ok(Ok(io)) => Ok(TransportStream::tls(io)),
            Ok(Err(e)) => Err(attempt_failed(&endpoint, tls_error_to_net(e))),
            Err(_) => Err(attempt_failed(&endpoint, NetError::ConnectionTimedOut)),
        }
    }

    async fn connect_via_http_proxy(
        &self,
        target: &JobTarget,
        proxy_endpoint: &HostPortPair,
    ) -> Result<TransportStream, ConnectError> {
        let mut io = self.tcp_connect(proxy_endpoint).await.map_err(|e| ConnectError {
            error: NetError::ProxyConnectionFailed,
            ..e
        })?;
        if !target.establishes_tunnel() {
            // absolute-form requests go straight to the proxy
            return Ok(TransportStream::tcp(io));
        }

        let endpoint = target.destination.host_port_pair();
        tunnel::establish_tunnel(
            &mut io,
            &endpoint,
            &target.proxy,
            target.proxy_authorization.as_ref(),
        )
        .await?;
        if !target.destination.scheme.is_secure() {
            return Ok(TransportStream::tcp(io));
        }

        let sn = server_name(&endpoint.host).map_err(|_| NetError::NameNotResolved)?;
        let tls = self.tls_connector(&target.server_ssl_config.alpn_protocols);
        let io = tls.handshake(sn, io).await.map_err(tls_error_to_net)?;
        Ok(TransportStream::tls(io))
    }

    async fn establish(&self, target: &JobTarget) -> Result<TransportStream, ConnectError> {
        if target.require_dns_https_alpn() {
            // HTTPS records are never looked up, so no h3 ALPN can match
            return Err(NetError::DnsNoMatchingSupportedAlpn.into());
        }
        if target.using_quic() {
            return Err(NetError::NotImplemented.into());
        }
        let stream = match (target.proxy.scheme(), target.proxy.endpoint()) {
            (ProxyScheme::Direct, _) => self.connect_direct(target).await?,
            (ProxyScheme::Http, Some(proxy)) => self.connect_via_http_proxy(target, proxy).await?,
            _ => return Err(NetError::NotImplemented.into()),
        };

        #[cfg(feature = "logging")]
        tracing::debug!(
            "connected to {} via {} ({:?})",
            target.destination,
            target.proxy,
            stream.negotiated_protocol
        );
        if stream.negotiated_protocol == NextProto::Http2 {
            self.h2_keys.borrow_mut().insert(PoolKey::from(target));
        }
        Ok(stream)
    }
}

fn name_not_resolved() -> ConnectError {
    ConnectError {
        resolve_error_info: ResolveErrorInfo {
            error: Some(NetError::NameNotResolved),
            is_secure_network_error: false,
        },
        ..ConnectError::from(NetError::NameNotResolved)
    }
}

fn attempt_failed(endpoint: &HostPortPair, error: NetError) -> ConnectError {
    ConnectError {
        connection_attempts: vec![ConnectionAttempt {
            endpoint: endpoint.clone(),
            error,
        }],
        ..ConnectError::from(error)
    }
}

impl TransportPool for DefaultTransportPool {
    type Stream = Pooled<PoolKey, TransportStream>;

    async fn connect(&self, target: &JobTarget) -> Result<Established<Self::Stream>, ConnectError> {
        let key = PoolKey::from(target);
        // upgraded websocket connections never go back to the pool
        if target.is_websocket {
            let stream = self.establish(target).await?;
            let protocol = stream.negotiated_protocol;
            return Ok(Established::new(Pooled::unpooled(stream), protocol));
        }

        if let Some(conn) = self.idle.get(&key) {
            let protocol = conn.negotiated_protocol;
            let mut established = Established::new(conn, protocol);
            established.using_existing_session = true;
            return Ok(established);
        }
        let stream = self.establish(target).await?;
        let protocol = stream.negotiated_protocol;
        Ok(Established::new(self.idle.link(key, stream), protocol))
    }

    async fn preconnect(&self, target: &JobTarget, num_streams: usize) -> Result<(), ConnectError> {
        if target.is_websocket {
            return Ok(());
        }
        let key = PoolKey::from(target);
        while self.idle.idle_count(&key) < num_streams {
            let stream = self.establish(target).await?;
            let h2 = stream.negotiated_protocol == NextProto::Http2;
            self.idle.put(key.clone(), stream);
            if h2 {
                // one multiplexed connection serves every stream
                break;
            }
        }
        Ok(())
    }

    fn has_available_http2_session(&self, target: &JobTarget) -> bool {
        let key = PoolKey::from(target);
        self.h2_keys.borrow().contains(&key) && self.idle.idle_count(&key) > 0
    }

    fn has_active_socket(&self, target: &JobTarget) -> bool {
        self.idle.idle_count(&PoolKey::from(target)) > 0
    }
}
