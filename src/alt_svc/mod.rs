//! Alternative services: advertised alternate protocol endpoints for an
//! origin, the `Alt-Svc` header grammar and the brokenness bookkeeping used
//! to stop trying endpoints that recently failed.
mod broken;
mod parse;
mod properties;

use std::{fmt::Display, time::Instant};

pub use broken::{BrokenAlternativeServices, Clock, SystemClock};
pub use parse::{parse_alt_svc, AltSvcEntry, AltSvcHeader, DEFAULT_MAX_AGE};
pub use properties::HttpServerProperties;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::key::HostPortPair;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum NextProto {
    #[default]
    Unknown,
    Http11,
    Http2,
    Quic,
}

impl NextProto {
    /// Maps a negotiated ALPN identifier.
    pub fn from_alpn(alpn: &[u8]) -> Self {
        match alpn {
            b"http/1.1" => NextProto::Http11,
            b"h2" => NextProto::Http2,
            other if QuicVersion::from_alpn(other).is_some() => NextProto::Quic,
            _ => NextProto::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuicVersion {
    #[serde(rename = "h3")]
    RfcV1,
    #[serde(rename = "h3-29")]
    Draft29,
    #[serde(rename = "h3-Q050")]
    Q050,
    #[serde(rename = "h3-Q046")]
    Q046,
    #[serde(rename = "h3-Q043")]
    Q043,
}

impl QuicVersion {
    pub const ALL: [QuicVersion; 5] = [
        QuicVersion::RfcV1,
        QuicVersion::Draft29,
        QuicVersion::Q050,
        QuicVersion::Q046,
        QuicVersion::Q043,
    ];

    #[inline]
    pub const fn alpn(&self) -> &'static str {
        match self {
            QuicVersion::RfcV1 => "h3",
            QuicVersion::Draft29 => "h3-29",
            QuicVersion::Q050 => "h3-Q050",
            QuicVersion::Q046 => "h3-Q046",
            QuicVersion::Q043 => "h3-Q043",
        }
    }

    pub fn from_alpn(alpn: &[u8]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.alpn().as_bytes() == alpn)
    }
}

/// Picks the first advertised version that is also supported. An empty
/// advertisement means any version, so the preferred supported one is used.
pub fn select_quic_version(
    advertised: &[QuicVersion],
    supported: &[QuicVersion],
) -> Option<QuicVersion> {
    if advertised.is_empty() {
        return supported.first().copied();
    }
    advertised
        .iter()
        .find(|v| supported.contains(v))
        .copied()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlternativeService {
    pub protocol: NextProto,
    pub host: SmolStr,
    pub port: u16,
}

impl AlternativeService {
    #[inline]
    pub fn new(protocol: NextProto, host: impl Into<SmolStr>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
        }
    }

    #[inline]
    pub fn host_port_pair(&self) -> HostPortPair {
        HostPortPair::new(self.host.clone(), self.port)
    }
}

impl Display for AlternativeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let proto = match self.protocol {
            NextProto::Unknown => "unknown",
            NextProto::Http11 => "http/1.1",
            NextProto::Http2 => "h2",
            NextProto::Quic => "quic",
        };
        write!(f, "{} {}:{}", proto, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternativeServiceInfo {
    alternative_service: AlternativeService,
    expiration: Instant,
    advertised_versions: Vec<QuicVersion>,
}

impl AlternativeServiceInfo {
    #[inline]
    pub fn new_http2(alternative_service: AlternativeService, expiration: Instant) -> Self {
        Self {
            alternative_service,
            expiration,
            advertised_versions: Vec::new(),
        }
    }

    #[inline]
    pub fn new_quic(
        alternative_service: AlternativeService,
        expiration: Instant,
        advertised_versions: Vec<QuicVersion>,
    ) -> Self {
        Self {
            alternative_service,
            expiration,
            advertised_versions,
        }
    }

    #[inline]
    pub fn alternative_service(&self) -> &AlternativeService {
        &self.alternative_service
    }

    #[inline]
    pub fn protocol(&self) -> NextProto {
        self.alternative_service.protocol
    }

    #[inline]
    pub fn host_port_pair(&self) -> HostPortPair {
        self.alternative_service.host_port_pair()
    }

    #[inline]
    pub fn expiration(&self) -> Instant {
        self.expiration
    }

    #[inline]
    pub fn advertised_versions(&self) -> &[QuicVersion] {
        &self.advertised_versions
    }
}

/// Kind of alternative service chosen for a request, reported to the observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlternativeServiceType {
    NoService,
    QuicSameDestination,
    QuicDifferentDestination,
    Http2SameDestination,
    Http2DifferentDestination,
}
