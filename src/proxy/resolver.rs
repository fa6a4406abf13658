use std::{cell::RefCell, future::Future, pin::Pin, time::Instant};

use http::{Method, Uri};

use super::{ProxyInfo, ProxyList, ProxyRetryInfoMap};
use crate::{key::NetworkIsolationKey, Error, NetError};

pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Resolves the ordered proxy list for a url and keeps the service wide
/// bad-proxy bookkeeping.
pub trait ProxyResolutionService {
    fn resolve_proxy(
        &self,
        url: &Uri,
        method: &Method,
        network_isolation_key: &NetworkIsolationKey,
    ) -> LocalBoxFuture<'static, Result<ProxyInfo, NetError>>;

    /// Called once a request succeeded, so the proxies it fell back from are
    /// remembered as bad.
    fn report_success(&self, _proxy_info: &ProxyInfo) {}

    fn proxy_retry_info(&self) -> ProxyRetryInfoMap {
        ProxyRetryInfoMap::new()
    }
}

/// Resolves every url to the same PAC result.
#[derive(Debug, Default)]
pub struct FixedProxyResolutionService {
    proxies: ProxyList,
    retry_info: RefCell<ProxyRetryInfoMap>,
}

impl FixedProxyResolutionService {
    #[inline]
    pub fn new(proxies: ProxyList) -> Self {
        Self {
            proxies,
            retry_info: RefCell::new(ProxyRetryInfoMap::new()),
        }
    }

    #[inline]
    pub fn direct() -> Self {
        Self::new(ProxyInfo::direct().proxy_list().clone())
    }

    pub fn from_pac_result(pac: &str) -> Result<Self, Error> {
        Ok(Self::new(pac.parse()?))
    }
}

impl ProxyResolutionService for FixedProxyResolutionService {
    fn resolve_proxy(
        &self,
        _url: &Uri,
        _method: &Method,
        _network_isolation_key: &NetworkIsolationKey,
    ) -> LocalBoxFuture<'static, Result<ProxyInfo, NetError>> {
        let mut list = self.proxies.clone();
        list.deprioritize_bad_proxies(&self.retry_info.borrow(), Instant::now());
        Box::pin(async move { Ok(ProxyInfo::from_list(list)) })
    }

    fn report_success(&self, proxy_info: &ProxyInfo) {
        let mut retry_info = self.retry_info.borrow_mut();
        for (uri, info) in proxy_info.proxy_retry_info() {
            #[cfg(feature = "logging")]
            tracing::debug!("marking proxy {} bad: {}", uri, info.net_error);
            retry_info.insert(uri.clone(), *info);
        }
    }

    fn proxy_retry_info(&self) -> ProxyRetryInfoMap {
        self.retry_info.borrow().clone()
    }
}
