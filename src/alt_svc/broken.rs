use std::{
    collections::{HashMap, HashSet},
    rc::Rc,
    time::{Duration, Instant},
};

use super::AlternativeService;
use crate::key::NetworkIsolationKey;

const INITIAL_BROKEN_DELAY: Duration = Duration::from_secs(5 * 60);
const MAX_BROKEN_DELAY: Duration = Duration::from_secs(2 * 24 * 60 * 60);

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

type BrokenKey = (AlternativeService, NetworkIsolationKey);

/// Tracks alternative services that failed recently.
///
/// A broken service stays excluded until its expiration, which doubles with
/// every break recorded since the last confirmation. Services marked broken
/// only on the default network are forgiven once that network changes.
pub struct BrokenAlternativeServices {
    clock: Rc<dyn Clock>,
    broken: HashMap<BrokenKey, Instant>,
    recently_broken: HashMap<BrokenKey, u32>,
    broken_on_default_network: HashSet<BrokenKey>,
}

impl std::fmt::Debug for BrokenAlternativeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokenAlternativeServices")
            .field("broken", &self.broken)
            .field("recently_broken", &self.recently_broken)
            .field("broken_on_default_network", &self.broken_on_default_network)
            .finish()
    }
}

impl BrokenAlternativeServices {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            broken: HashMap::new(),
            recently_broken: HashMap::new(),
            broken_on_default_network: HashSet::new(),
        }
    }

    pub fn mark_broken(&mut self, service: &AlternativeService, nik: &NetworkIsolationKey) {
        let key = (service.clone(), nik.clone());
        self.broken_on_default_network.remove(&key);
        self.mark_broken_impl(key);
    }

    pub fn mark_broken_until_default_network_changes(
        &mut self,
        service: &AlternativeService,
        nik: &NetworkIsolationKey,
    ) {
        let key = (service.clone(), nik.clone());
        self.broken_on_default_network.insert(key.clone());
        self.mark_broken_impl(key);
    }

    /// Marks the service recently broken without excluding it.
    pub fn mark_recently_broken(&mut self, service: &AlternativeService, nik: &NetworkIsolationKey) {
        self.recently_broken
            .entry((service.clone(), nik.clone()))
            .or_insert(1);
    }

    fn mark_broken_impl(&mut self, key: BrokenKey) {
        let now = self.clock.now();
        self.expire_broken(now);
        let count = self.recently_broken.entry(key.clone()).or_insert(0);
        let delay = INITIAL_BROKEN_DELAY
            .checked_mul(1u32.checked_shl(*count).unwrap_or(u32::MAX))
            .unwrap_or(MAX_BROKEN_DELAY)
            .min(MAX_BROKEN_DELAY);
        *count = count.saturating_add(1);

        #[cfg(feature = "logging")]
        tracing::debug!(
            "alternative service {} broken for {:?} (break #{})",
            key.0,
            delay,
            count
        );
        self.broken.insert(key, now + delay);
    }

    /// Drops breaks that have run out. Their recent-break counts stay.
    fn expire_broken(&mut self, now: Instant) {
        let on_default_network = &mut self.broken_on_default_network;
        self.broken.retain(|key, until| {
            let live = *until > now;
            if !live {
                on_default_network.remove(key);
            }
            live
        });
    }

    pub fn is_broken(&self, service: &AlternativeService, nik: &NetworkIsolationKey) -> bool {
        self.broken_until(service, nik).is_some()
    }

    /// Expiration of the brokenness, if the service is currently broken.
    pub fn broken_until(
        &self,
        service: &AlternativeService,
        nik: &NetworkIsolationKey,
    ) -> Option<Instant> {
        let now = self.clock.now();
        self.broken
            .get(&(service.clone(), nik.clone()))
            .copied()
            .filter(|until| *until > now)
    }

    pub fn was_recently_broken(
        &self,
        service: &AlternativeService,
        nik: &NetworkIsolationKey,
    ) -> bool {
        let key = (service.clone(), nik.clone());
        self.recently_broken.contains_key(&key) || self.broken.contains_key(&key)
    }

    /// Forgets every break of a service that has been seen working.
    pub fn confirm(&mut self, service: &AlternativeService, nik: &NetworkIsolationKey) {
        let key = (service.clone(), nik.clone());
        self.broken.remove(&key);
        self.recently_broken.remove(&key);
        self.broken_on_default_network.remove(&key);
    }

    /// Returns whether any service was released.
    pub fn on_default_network_changed(&mut self) -> bool {
        let released = !self.broken_on_default_network.is_empty();
        for key in self.broken_on_default_network.drain() {
            self.broken.remove(&key);
            self.recently_broken.remove(&key);
        }
        released
    }

    pub fn clear(&mut self) {
        self.broken.clear();
        self.recently_broken.clear();
        self.broken_on_default_network.clear();
    }
}
