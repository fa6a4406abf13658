use std::{fmt::Debug, net::ToSocketAddrs};

use monoio::io::{AsyncReadRent, AsyncWriteRent};
use service_async::Param;
use smol_str::SmolStr;

use super::{Connector, TransportConnMeta, TransportConnMetadata};
use crate::{key::HostPortPair, FromUriError, NetError};

pub type TlsStream<C> = monoio_rustls::ClientTlsStream<C>;
pub use monoio_rustls::{TlsConnector as MonoioTlsConnector, TlsError};
pub type ServerName<'a> = rustls::pki_types::ServerName<'a>;

impl<S> TransportConnMetadata for TlsStream<S> {
    type Metadata = TransportConnMeta;

    fn get_conn_metadata(&self) -> Self::Metadata {
        let mut meta = TransportConnMeta::default();
        meta.set_alpn(self.alpn_protocol());
        meta
    }
}

/// A connector for establishing TLS connections over an inner connector.
///
/// This connector wraps another connector (typically a TCP connector) and
/// adds TLS encryption to the connection, offering the ALPN protocols it was
/// built with.
#[derive(Clone)]
pub struct TlsConnector<C> {
    inner_connector: C,
    tls_connector: MonoioTlsConnector,
}

impl<C: Debug> std::fmt::Debug for TlsConnector<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlsConnector, inner: {:?}", self.inner_connector)
    }
}

impl<C> TlsConnector<C> {
    pub const fn new(inner_connector: C, tls_connector: MonoioTlsConnector) -> Self {
        Self {
            inner_connector,
            tls_connector,
        }
    }

    /// Create a new `TlsConnector` trusting the webpki roots and offering
    /// `alpn` in order.
    #[inline]
    pub fn new_with_alpn(inner_connector: C, alpn: &[SmolStr]) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut cfg = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        cfg.alpn_protocols = alpn.iter().map(|a| a.as_bytes().to_vec()).collect();

        TlsConnector::new(inner_connector, cfg.into())
    }

    #[inline]
    pub fn inner_connector(&self) -> &C {
        &self.inner_connector
    }

    #[inline]
    pub fn tls_connector(&self) -> &MonoioTlsConnector {
        &self.tls_connector
    }

    /// Runs the client handshake over an already connected stream, such as
    /// a proxy tunnel.
    #[inline]
    pub async fn handshake<IO>(
        &self,
        server_name: ServerName<'static>,
        io: IO,
    ) -> Result<TlsStream<IO>, TlsError>
    where
        IO: AsyncReadRent + AsyncWriteRent,
    {
        self.tls_connector.connect(server_name, io).await
    }
}

impl<C: Default> Default for TlsConnector<C> {
    /// The default ALPN protocols are `h2` and `http/1.1`.
    #[inline]
    fn default() -> Self {
        TlsConnector::new_with_alpn(Default::default(), &["h2".into(), "http/1.1".into()])
    }
}

impl<C, T, CN> Connector<T> for TlsConnector<C>
where
    T: Param<ServerName<'static>>,
    for<'a> C: Connector<&'a T, Error = std::io::Error, Connection = CN>,
    CN: AsyncReadRent + AsyncWriteRent,
{
    type Connection = TlsStream<CN>;
    type Error = TlsError;

    #[inline]
    async fn connect(&self, key: T) -> Result<Self::Connection, Self::Error> {
        let stream = self.inner_connector.connect(&key).await?;
        let tls_stream = self.tls_connector.connect(key.param(), stream).await?;
        Ok(tls_stream)
    }
}

/// A TCP endpoint together with the name its certificate must carry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TlsAddr {
    pub endpoint: HostPortPair,
    pub sn: ServerName<'static>,
}

impl Param<ServerName<'static>> for TlsAddr {
    #[inline]
    fn param(&self) -> ServerName<'static> {
        self.sn.clone()
    }
}

impl ToSocketAddrs for TlsAddr {
    type Iter = <(&'static str, u16) as ToSocketAddrs>::Iter;

    #[inline]
    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        (bare_host(&self.endpoint.host), self.endpoint.port).to_socket_addrs()
    }
}

impl TryFrom<&HostPortPair> for TlsAddr {
    type Error = FromUriError;

    #[inline]
    fn try_from(endpoint: &HostPortPair) -> Result<Self, Self::Error> {
        Ok(TlsAddr {
            sn: server_name(&endpoint.host)?,
            endpoint: endpoint.clone(),
        })
    }
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, FromUriError> {
    Ok(ServerName::try_from(bare_host(host).to_string())?)
}

/// Strips the brackets of an IPv6 literal.
#[inline]
pub(crate) fn bare_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Classifies a failed TLS handshake.
pub(crate) fn tls_error_to_net(e: TlsError) -> NetError {
    use rustls::{AlertDescription, CertificateError};

    match e {
        TlsError::Io(e) => e.into(),
        TlsError::Rustls(rustls::Error::InvalidCertificate(cert)) => match cert {
            CertificateError::Expired | CertificateError::NotValidYet => NetError::CertDateInvalid,
            CertificateError::NotValidForName => NetError::CertCommonNameInvalid,
            _ => NetError::CertAuthorityInvalid,
        },
        TlsError::Rustls(rustls::Error::AlertReceived(AlertDescription::CertificateRequired)) => {
            NetError::SslClientAuthCertNeeded
        }
        TlsError::Rustls(rustls::Error::NoApplicationProtocol) => NetError::AlpnNegotiationFailed,
        TlsError::Rustls(_) => NetError::SslProtocolError,
    }
}
