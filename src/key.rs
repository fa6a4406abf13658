//! Endpoint and origin identities shared by proxies, alternative services and
//! jobs.

use std::fmt::Display;

use http::Uri;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::FromUriError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    #[inline]
    pub const fn default_port(&self) -> u16 {
        match self {
            Scheme::Http | Scheme::Ws => 80,
            Scheme::Https | Scheme::Wss => 443,
        }
    }

    #[inline]
    pub const fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https | Scheme::Wss)
    }

    #[inline]
    pub const fn is_websocket(&self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }

    /// WebSocket schemes are carried over their HTTP counterparts.
    #[inline]
    pub const fn to_http(self) -> Self {
        match self {
            Scheme::Ws => Scheme::Http,
            Scheme::Wss => Scheme::Https,
            s => s,
        }
    }

    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPortPair {
    pub host: SmolStr,
    pub port: u16,
}

impl HostPortPair {
    #[inline]
    pub fn new(host: impl Into<SmolStr>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, `[v6]:port` or a bare host with `default_port`.
    pub fn parse(s: &str, default_port: u16) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None if tail.is_empty() => default_port,
                None => return None,
            };
            return Some(Self::new(format!("[{host}]"), port));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                Some(Self::new(host.to_ascii_lowercase(), port.parse().ok()?))
            }
            _ => Some(Self::new(s.to_ascii_lowercase(), default_port)),
        }
    }
}

impl Display for HostPortPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The origin tuple an alternative service or a job destination refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemeHostPort {
    pub scheme: Scheme,
    pub host: SmolStr,
    pub port: u16,
}

impl SchemeHostPort {
    #[inline]
    pub fn new(scheme: Scheme, host: impl Into<SmolStr>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    #[inline]
    pub fn host_port_pair(&self) -> HostPortPair {
        HostPortPair::new(self.host.clone(), self.port)
    }

    #[inline]
    pub fn with_host_port(&self, hpp: &HostPortPair) -> Self {
        Self::new(self.scheme, hpp.host.clone(), hpp.port)
    }

    #[inline]
    pub fn to_http(&self) -> Self {
        Self::new(self.scheme.to_http(), self.host.clone(), self.port)
    }

    /// Rebuilds `uri` with this scheme, host and port, keeping path and query.
    pub fn replace_in(&self, uri: &Uri) -> Result<Uri, FromUriError> {
        let authority = if self.port == self.scheme.default_port() {
            self.host.to_string()
        } else {
            format!("{}:{}", self.host, self.port)
        };
        let pq = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        Ok(Uri::builder()
            .scheme(self.scheme.as_str())
            .authority(authority)
            .path_and_query(pq)
            .build()?)
    }
}

impl Display for SchemeHostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

impl TryFrom<&Uri> for SchemeHostPort {
    type Error = FromUriError;

    #[inline]
    fn try_from(uri: &Uri) -> Result<Self, Self::Error> {
        let host = match uri.host() {
            Some(a) => a.to_ascii_lowercase(),
            None => return Err(FromUriError::NoAuthority),
        };
        let scheme = uri
            .scheme_str()
            .and_then(Scheme::parse)
            .ok_or(FromUriError::UnsupportScheme)?;
        let port = uri.port_u16().unwrap_or(scheme.default_port());
        Ok(Self::new(scheme, host, port))
    }
}

impl TryFrom<Uri> for SchemeHostPort {
    type Error = FromUriError;

    #[inline]
    fn try_from(value: Uri) -> Result<Self, Self::Error> {
        Self::try_from(&value)
    }
}

/// Partitions cached alternative services and sessions by top frame site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkIsolationKey(Option<SmolStr>);

impl NetworkIsolationKey {
    #[inline]
    pub fn new(site: impl Into<SmolStr>) -> Self {
        Self(Some(site.into()))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    #[inline]
    pub fn site(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PrivacyMode {
    #[default]
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestPriority {
    Throttled,
    Idle,
    Lowest,
    #[default]
    Low,
    Medium,
    Highest,
}
