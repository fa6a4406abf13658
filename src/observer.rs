//! Telemetry hooks of the stream factory.
use std::time::Duration;

use crate::{
    alt_svc::{AlternativeService, AlternativeServiceType},
    factory::JobType,
    proxy::ProxyScheme,
    NetError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlternateProtocolUsage {
    /// The alternative job lost against the main job.
    MainJobWonRace,
    /// The alternative job won without racing, reusing an existing session.
    NoRace,
    /// The alternative job won the race.
    WonRace,
    DnsAlpnH3JobWonWithoutRace,
    DnsAlpnH3JobWonRace,
    /// Every advertised alternative was broken.
    Broken,
}

/// Receives the signals a request leaves behind. Every method defaults to a
/// no-op so implementors only pick what they record.
pub trait StreamFactoryObserver {
    fn on_alternate_protocol_usage(&self, _usage: AlternateProtocolUsage) {}

    fn on_alternative_service_type(&self, _service_type: AlternativeServiceType) {}

    fn on_proxy_used(&self, _scheme: ProxyScheme, _success: bool) {}

    fn on_alternative_service_failure(
        &self,
        _job_type: JobType,
        _service: &AlternativeService,
        _error: NetError,
    ) {
    }

    fn on_main_job_wait_time(&self, _wait: Duration, _has_available_spdy_session: bool) {}

    fn on_preconnects_complete(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StreamFactoryObserver for NoopObserver {}

/// Forwards every signal to `tracing` at debug level.
#[cfg(feature = "logging")]
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

#[cfg(feature = "logging")]
impl StreamFactoryObserver for LoggingObserver {
    fn on_alternate_protocol_usage(&self, usage: AlternateProtocolUsage) {
        tracing::debug!(?usage, "alternate protocol usage");
    }

    fn on_alternative_service_type(&self, service_type: AlternativeServiceType) {
        tracing::debug!(?service_type, "alternative service type");
    }

    fn on_proxy_used(&self, scheme: ProxyScheme, success: bool) {
        tracing::debug!(?scheme, success, "proxy used");
    }

    fn on_alternative_service_failure(
        &self,
        job_type: JobType,
        service: &AlternativeService,
        error: NetError,
    ) {
        tracing::debug!(?job_type, %service, %error, "alternative service failed");
    }

    fn on_main_job_wait_time(&self, wait: Duration, has_available_spdy_session: bool) {
        tracing::debug!(?wait, has_available_spdy_session, "main job wait time");
    }

    fn on_preconnects_complete(&self) {
        tracing::debug!("preconnects complete");
    }
}
