use std::{
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
    time::Instant,
};

use super::{AlternativeService, AlternativeServiceInfo, BrokenAlternativeServices, Clock, SystemClock};
use crate::key::{NetworkIsolationKey, SchemeHostPort};

type OriginKey = (SchemeHostPort, NetworkIsolationKey);

/// In-memory server properties shared by every controller of a session.
pub struct HttpServerProperties {
    clock: Rc<dyn Clock>,
    alternative_services: RefCell<HashMap<OriginKey, Vec<AlternativeServiceInfo>>>,
    broken: RefCell<BrokenAlternativeServices>,
}

impl Default for HttpServerProperties {
    fn default() -> Self {
        Self::new(Rc::new(SystemClock))
    }
}

impl std::fmt::Debug for HttpServerProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerProperties")
            .field("alternative_services", &self.alternative_services)
            .field("broken", &self.broken)
            .finish()
    }
}

impl HttpServerProperties {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            broken: RefCell::new(BrokenAlternativeServices::new(clock.clone())),
            clock,
            alternative_services: RefCell::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Unexpired alternative services for `origin`, in advertised order.
    pub fn get_alternative_service_infos(
        &self,
        origin: &SchemeHostPort,
        nik: &NetworkIsolationKey,
    ) -> Vec<AlternativeServiceInfo> {
        let now = self.clock.now();
        let key = (origin.clone(), nik.clone());
        let mut services = self.alternative_services.borrow_mut();
        let Some(infos) = services.get_mut(&key) else {
            return Vec::new();
        };
        infos.retain(|info| info.expiration() > now);
        if infos.is_empty() {
            services.remove(&key);
            return Vec::new();
        }
        infos.clone()
    }

    /// Replaces the alternative services of `origin`; an empty list clears them.
    pub fn set_alternative_services(
        &self,
        origin: &SchemeHostPort,
        nik: &NetworkIsolationKey,
        infos: Vec<AlternativeServiceInfo>,
    ) {
        let key = (origin.clone(), nik.clone());
        let mut services = self.alternative_services.borrow_mut();
        if infos.is_empty() {
            services.remove(&key);
        } else {
            services.insert(key, infos);
        }
    }

    #[inline]
    pub fn is_alternative_service_broken(
        &self,
        service: &AlternativeService,
        nik: &NetworkIsolationKey,
    ) -> bool {
        self.broken.borrow().is_broken(service, nik)
    }

    #[inline]
    pub fn was_alternative_service_recently_broken(
        &self,
        service: &AlternativeService,
        nik: &NetworkIsolationKey,
    ) -> bool {
        self.broken.borrow().was_recently_broken(service, nik)
    }

    #[inline]
    pub fn mark_alternative_service_broken(
        &self,
        service: &AlternativeService,
        nik: &NetworkIsolationKey,
    ) {
        self.broken.borrow_mut().mark_broken(service, nik);
    }

    #[inline]
    pub fn mark_alternative_service_broken_until_default_network_changes(
        &self,
        service: &AlternativeService,
        nik: &NetworkIsolationKey,
    ) {
        self.broken
            .borrow_mut()
            .mark_broken_until_default_network_changes(service, nik);
    }

    #[inline]
    pub fn mark_alternative_service_recently_broken(
        &self,
        service: &AlternativeService,
        nik: &NetworkIsolationKey,
    ) {
        self.broken.borrow_mut().mark_recently_broken(service, nik);
    }

    #[inline]
    pub fn confirm_alternative_service(
        &self,
        service: &AlternativeService,
        nik: &NetworkIsolationKey,
    ) {
        self.broken.borrow_mut().confirm(service, nik);
    }

    #[inline]
    pub fn on_default_network_changed(&self) -> bool {
        self.broken.borrow_mut().on_default_network_changed()
    }

    pub fn clear(&self) {
        self.alternative_services.borrow_mut().clear();
        self.broken.borrow_mut().clear();
    }
}
