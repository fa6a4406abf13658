use std::io;

use thiserror::Error as ThisError;

use crate::proxy::{ProxyScheme, ProxyServer};

/// Network level failure reported by a job, the proxy resolver or a transport.
///
/// Errors are plain values so controllers can record them per job and compare
/// them when deciding brokenness or proxy fallback.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetError {
    #[error("generic failure")]
    Failed,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("connection timed out")]
    ConnectionTimedOut,
    #[error("address unreachable")]
    AddressUnreachable,
    #[error("name not resolved")]
    NameNotResolved,
    #[error("operation timed out")]
    TimedOut,
    #[error("ssl protocol error")]
    SslProtocolError,
    #[error("certificate common name invalid")]
    CertCommonNameInvalid,
    #[error("certificate date invalid")]
    CertDateInvalid,
    #[error("certificate authority invalid")]
    CertAuthorityInvalid,
    #[error("client certificate needed")]
    SslClientAuthCertNeeded,
    #[error("proxy authentication requested")]
    ProxyAuthRequested,
    #[error("proxy connection failed")]
    ProxyConnectionFailed,
    #[error("tunnel connection failed")]
    TunnelConnectionFailed,
    #[error("socks connection failed")]
    SocksConnectionFailed,
    #[error("proxy certificate invalid")]
    ProxyCertificateInvalid,
    #[error("quic protocol error")]
    QuicProtocolError,
    #[error("quic handshake failed")]
    QuicHandshakeFailed,
    #[error("message too big")]
    MsgTooBig,
    #[error("network changed")]
    NetworkChanged,
    #[error("internet disconnected")]
    InternetDisconnected,
    #[error("dns resolution returned no matching supported alpn")]
    DnsNoMatchingSupportedAlpn,
    #[error("no supported proxies")]
    NoSupportedProxies,
    #[error("proxy resolution failed")]
    ProxyResolutionFailed,
    #[error("unsafe port")]
    UnsafePort,
    #[error("not implemented")]
    NotImplemented,
    #[error("alpn negotiation failed")]
    AlpnNegotiationFailed,
}

impl NetError {
    /// Certificate errors are surfaced to the delegate as a prompt rather than
    /// as a plain failure.
    #[inline]
    pub fn is_certificate_error(&self) -> bool {
        matches!(
            self,
            NetError::CertCommonNameInvalid
                | NetError::CertDateInvalid
                | NetError::CertAuthorityInvalid
        )
    }

    /// Whether a request going through `proxy` that failed with `self` may be
    /// retried with the next proxy of the list.
    pub fn can_fallover_to_next_proxy(&self, proxy: &ProxyServer) -> bool {
        let scheme = proxy.scheme();
        if scheme == ProxyScheme::Direct {
            return false;
        }
        match self {
            NetError::NameNotResolved
            | NetError::AddressUnreachable
            | NetError::ConnectionReset
            | NetError::ConnectionRefused
            | NetError::ConnectionAborted
            | NetError::ConnectionTimedOut
            | NetError::TimedOut
            | NetError::ProxyConnectionFailed
            | NetError::TunnelConnectionFailed
            | NetError::SocksConnectionFailed
            | NetError::ProxyCertificateInvalid
            | NetError::SslProtocolError => true,
            NetError::ConnectionClosed => {
                matches!(scheme, ProxyScheme::Socks4 | ProxyScheme::Socks5 | ProxyScheme::Https)
            }
            NetError::QuicProtocolError | NetError::QuicHandshakeFailed | NetError::MsgTooBig => {
                scheme == ProxyScheme::Quic
            }
            _ => false,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::ConnectionReset => NetError::ConnectionReset,
            io::ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
            io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof => {
                NetError::ConnectionClosed
            }
            io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
            io::ErrorKind::AddrNotAvailable => NetError::AddressUnreachable,
            io::ErrorKind::Unsupported => NetError::NotImplemented,
            _ => NetError::Failed,
        }
    }
}

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("convert from uri error {0}")]
    FromUri(#[from] FromUriError),
    #[error("io error {0}")]
    Io(#[from] io::Error),
    #[error("rustls error {0}")]
    Rustls(#[from] monoio_rustls::TlsError),
    #[error("serde_json error {0}")]
    Json(#[from] serde_json::Error),
    #[error("network error {0}")]
    Net(#[from] NetError),
    #[error("invalid proxy list {0}")]
    InvalidProxyList(String),
    #[error("invalid host mapping rule {0}")]
    InvalidHostMappingRule(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum FromUriError {
    #[error("Invalid dns name {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),
    #[error("Scheme not supported")]
    UnsupportScheme,
    #[error("Missing authority in uri")]
    NoAuthority,
    #[error("Invalid uri {0}")]
    InvalidUri(#[from] http::Error),
}
