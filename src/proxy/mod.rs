//! Proxy servers, ordered proxy lists and the per-request proxy decision.
mod resolver;

use std::{
    collections::HashMap,
    fmt::Display,
    str::FromStr,
    time::{Duration, Instant},
};

pub use resolver::{FixedProxyResolutionService, LocalBoxFuture, ProxyResolutionService};
use smol_str::SmolStr;

use crate::{key::HostPortPair, Error, NetError};

/// How long a proxy that made a request fail over stays deprioritised.
pub const DEFAULT_PROXY_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    Direct,
    Http,
    Https,
    Socks4,
    Socks5,
    Quic,
}

impl ProxyScheme {
    #[inline]
    const fn default_port(&self) -> u16 {
        match self {
            ProxyScheme::Direct => 0,
            ProxyScheme::Http => 80,
            ProxyScheme::Https | ProxyScheme::Quic => 443,
            ProxyScheme::Socks4 | ProxyScheme::Socks5 => 1080,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyServer {
    scheme: ProxyScheme,
    endpoint: Option<HostPortPair>,
}

impl ProxyServer {
    #[inline]
    pub const fn direct() -> Self {
        Self {
            scheme: ProxyScheme::Direct,
            endpoint: None,
        }
    }

    #[inline]
    pub fn new(scheme: ProxyScheme, endpoint: HostPortPair) -> Self {
        if scheme == ProxyScheme::Direct {
            return Self::direct();
        }
        Self {
            scheme,
            endpoint: Some(endpoint),
        }
    }

    #[inline]
    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    #[inline]
    pub fn is_direct(&self) -> bool {
        self.scheme == ProxyScheme::Direct
    }

    /// `None` for DIRECT.
    #[inline]
    pub fn endpoint(&self) -> Option<&HostPortPair> {
        self.endpoint.as_ref()
    }

    /// Key used by the retry-info map, e.g. `badproxy:99` or `quic://bad:99`.
    pub fn to_uri(&self) -> String {
        let Some(ep) = &self.endpoint else {
            return "direct://".to_string();
        };
        match self.scheme {
            ProxyScheme::Http => ep.to_string(),
            ProxyScheme::Https => format!("https://{ep}"),
            ProxyScheme::Socks4 => format!("socks4://{ep}"),
            ProxyScheme::Socks5 => format!("socks5://{ep}"),
            ProxyScheme::Quic => format!("quic://{ep}"),
            ProxyScheme::Direct => unreachable!("direct proxy carries no endpoint"),
        }
    }

    /// Parses a single PAC result element such as `PROXY host:80` or `DIRECT`.
    pub fn from_pac_element(element: &str) -> Result<Self, Error> {
        let mut parts = element.split_whitespace();
        let verb = parts
            .next()
            .ok_or_else(|| Error::InvalidProxyList(element.to_string()))?;
        let scheme = match verb.to_ascii_uppercase().as_str() {
            "DIRECT" => return Ok(Self::direct()),
            "PROXY" | "HTTP" => ProxyScheme::Http,
            "HTTPS" => ProxyScheme::Https,
            "SOCKS" | "SOCKS4" => ProxyScheme::Socks4,
            "SOCKS5" => ProxyScheme::Socks5,
            "QUIC" => ProxyScheme::Quic,
            _ => return Err(Error::InvalidProxyList(element.to_string())),
        };
        let endpoint = parts
            .next()
            .and_then(|hp| HostPortPair::parse(hp, scheme.default_port()))
            .ok_or_else(|| Error::InvalidProxyList(element.to_string()))?;
        if parts.next().is_some() {
            return Err(Error::InvalidProxyList(element.to_string()));
        }
        Ok(Self::new(scheme, endpoint))
    }
}

impl Display for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match self.scheme {
            ProxyScheme::Direct => return write!(f, "DIRECT"),
            ProxyScheme::Http => "PROXY",
            ProxyScheme::Https => "HTTPS",
            ProxyScheme::Socks4 => "SOCKS",
            ProxyScheme::Socks5 => "SOCKS5",
            ProxyScheme::Quic => "QUIC",
        };
        match &self.endpoint {
            Some(ep) => write!(f, "{verb} {ep}"),
            None => write!(f, "{verb}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyRetryInfo {
    pub bad_until: Instant,
    pub current_delay: Duration,
    pub net_error: NetError,
}

pub type ProxyRetryInfoMap = HashMap<SmolStr, ProxyRetryInfo>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyList {
    proxies: Vec<ProxyServer>,
}

impl ProxyList {
    #[inline]
    pub fn new(proxies: Vec<ProxyServer>) -> Self {
        Self { proxies }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    #[inline]
    pub fn first(&self) -> Option<&ProxyServer> {
        self.proxies.first()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &ProxyServer> {
        self.proxies.iter()
    }

    #[inline]
    pub fn retain_schemes(&mut self, supported: &[ProxyScheme]) {
        self.proxies.retain(|p| supported.contains(&p.scheme()));
    }

    /// Moves proxies still marked bad in `retry_info` behind the good ones.
    pub fn deprioritize_bad_proxies(&mut self, retry_info: &ProxyRetryInfoMap, now: Instant) {
        let (good, bad): (Vec<_>, Vec<_>) = self.proxies.drain(..).partition(|p| {
            retry_info
                .get(p.to_uri().as_str())
                .map(|info| info.bad_until <= now)
                .unwrap_or(true)
        });
        self.proxies = good;
        self.proxies.extend(bad);
    }

    /// Marks the current proxy bad and drops it. Returns false once nothing is
    /// left to try.
    pub fn fallback(&mut self, retry_info: &mut ProxyRetryInfoMap, error: NetError) -> bool {
        if self.proxies.is_empty() {
            return false;
        }
        let bad = self.proxies.remove(0);
        if !bad.is_direct() {
            retry_info.insert(
                bad.to_uri().into(),
                ProxyRetryInfo {
                    bad_until: Instant::now() + DEFAULT_PROXY_RETRY_DELAY,
                    current_delay: DEFAULT_PROXY_RETRY_DELAY,
                    net_error: error,
                },
            );
        }
        !self.proxies.is_empty()
    }
}

impl FromStr for ProxyList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let proxies = s
            .split(';')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(ProxyServer::from_pac_element)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(proxies))
    }
}

/// The proxy decision for one request, consumed front to back on fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyInfo {
    proxy_list: ProxyList,
    retry_info: ProxyRetryInfoMap,
}

impl ProxyInfo {
    #[inline]
    pub fn direct() -> Self {
        Self::from_list(ProxyList::new(vec![ProxyServer::direct()]))
    }

    #[inline]
    pub fn from_list(proxy_list: ProxyList) -> Self {
        Self {
            proxy_list,
            retry_info: ProxyRetryInfoMap::new(),
        }
    }

    #[inline]
    pub fn use_direct(&mut self) {
        *self = Self::direct();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.proxy_list.is_empty()
    }

    /// The proxy currently in use, DIRECT when the list is empty.
    #[inline]
    pub fn proxy_server(&self) -> ProxyServer {
        self.proxy_list
            .first()
            .cloned()
            .unwrap_or_else(ProxyServer::direct)
    }

    #[inline]
    pub fn is_direct(&self) -> bool {
        matches!(self.proxy_list.first(), Some(p) if p.is_direct())
    }

    #[inline]
    pub fn is_quic(&self) -> bool {
        matches!(self.proxy_list.first(), Some(p) if p.scheme() == ProxyScheme::Quic)
    }

    #[inline]
    pub fn proxy_list(&self) -> &ProxyList {
        &self.proxy_list
    }

    /// Proxies this request gave up on, keyed by proxy uri.
    #[inline]
    pub fn proxy_retry_info(&self) -> &ProxyRetryInfoMap {
        &self.retry_info
    }

    #[inline]
    pub fn remove_proxies_without_scheme(&mut self, supported: &[ProxyScheme]) {
        self.proxy_list.retain_schemes(supported);
    }

    #[inline]
    pub fn fallback(&mut self, error: NetError) -> bool {
        self.proxy_list.fallback(&mut self.retry_info, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pac_string() {
        let list: ProxyList = "PROXY badproxy:99; HTTPS secure:443; SOCKS5 sock; QUIC q:99; DIRECT"
            .parse()
            .unwrap();
        let uris: Vec<String> = list.iter().map(ProxyServer::to_uri).collect();
        assert_eq!(
            uris,
            vec![
                "badproxy:99",
                "https://secure:443",
                "socks5://sock:1080",
                "quic://q:99",
                "direct://",
            ]
        );
        assert!("PROXY".parse::<ProxyList>().is_err());
        assert!("GOPHER a:1".parse::<ProxyList>().is_err());
    }

    #[test]
    fn fallback_records_bad_proxies() {
        let list: ProxyList = "PROXY bad:99; PROXY good:80; DIRECT".parse().unwrap();
        let mut info = ProxyInfo::from_list(list);
        assert_eq!(info.proxy_server().to_uri(), "bad:99");

        assert!(info.fallback(NetError::ConnectionRefused));
        assert_eq!(info.proxy_server().to_uri(), "good:80");
        assert_eq!(info.proxy_retry_info().len(), 1);
        assert!(info.proxy_retry_info().contains_key("bad:99"));

        assert!(info.fallback(NetError::ConnectionRefused));
        assert!(info.is_direct());
        // nothing behind DIRECT
        assert!(!info.fallback(NetError::ConnectionRefused));
        assert_eq!(info.proxy_retry_info().len(), 2);
    }

    #[test]
    fn remove_unsupported_schemes() {
        let list: ProxyList = "QUIC q:99; PROXY p:80".parse().unwrap();
        let mut info = ProxyInfo::from_list(list);
        info.remove_proxies_without_scheme(&[ProxyScheme::Direct, ProxyScheme::Http]);
        assert_eq!(info.proxy_list().len(), 1);
        assert_eq!(info.proxy_server().scheme(), ProxyScheme::Http);

        info.remove_proxies_without_scheme(&[ProxyScheme::Direct]);
        assert!(info.is_empty());
    }

    #[test]
    fn deprioritize() {
        let mut list: ProxyList = "PROXY bad:99; PROXY good:80".parse().unwrap();
        let now = Instant::now();
        let mut retry = ProxyRetryInfoMap::new();
        retry.insert(
            "bad:99".into(),
            ProxyRetryInfo {
                bad_until: now + Duration::from_secs(60),
                current_delay: Duration::from_secs(60),
                net_error: NetError::ConnectionReset,
            },
        );
        list.deprioritize_bad_proxies(&retry, now);
        assert_eq!(list.first().map(ProxyServer::to_uri).as_deref(), Some("good:80"));
    }

    #[test]
    fn fallover_errors_depend_on_scheme() {
        let http = ProxyServer::new(ProxyScheme::Http, HostPortPair::new("p", 80));
        let quic = ProxyServer::new(ProxyScheme::Quic, HostPortPair::new("q", 443));
        assert!(NetError::ConnectionReset.can_fallover_to_next_proxy(&http));
        assert!(!NetError::MsgTooBig.can_fallover_to_next_proxy(&http));
        assert!(NetError::MsgTooBig.can_fallover_to_next_proxy(&quic));
        assert!(!NetError::ConnectionReset.can_fallover_to_next_proxy(&ProxyServer::direct()));
    }
}
