mod tcp_connector;
mod tls_connector;

use std::{future::Future, time::Duration};

pub use tcp_connector::TcpConnector;
pub use tls_connector::*;

use crate::alt_svc::NextProto;

pub trait Connector<K> {
    type Connection;
    type Error;

    fn connect(&self, key: K) -> impl Future<Output = Result<Self::Connection, Self::Error>>;
}

pub trait ConnectorExt<K>: Connector<K> {
    fn connect_with_timeout(
        &self,
        key: K,
        timeout: Duration,
    ) -> impl Future<Output = Result<Result<Self::Connection, Self::Error>, monoio::time::error::Elapsed>>;
}

impl<K, T: Connector<K>> ConnectorExt<K> for T {
    #[inline]
    fn connect_with_timeout(
        &self,
        key: K,
        timeout: Duration,
    ) -> impl Future<Output = Result<Result<Self::Connection, Self::Error>, monoio::time::error::Elapsed>>
    {
        monoio::time::timeout(timeout, self.connect(key))
    }
}

/// Additional information about an established transport connection.
pub trait TransportConnMetadata {
    type Metadata;

    fn get_conn_metadata(&self) -> Self::Metadata;
}

/// What the handshake of a transport connection settled on.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransportConnMeta {
    protocol: NextProto,
}

impl TransportConnMeta {
    pub fn set_alpn(&mut self, alpn: Option<Vec<u8>>) {
        self.protocol = match alpn {
            Some(p) => NextProto::from_alpn(&p),
            None => NextProto::Unknown,
        }
    }

    #[inline]
    pub fn negotiated_protocol(&self) -> NextProto {
        self.protocol
    }

    #[inline]
    pub fn is_alpn_h2(&self) -> bool {
        self.protocol == NextProto::Http2
    }
}
