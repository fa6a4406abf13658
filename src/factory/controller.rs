//! The per-request race.
//!
//! A controller first resolves the proxy, then creates and starts its jobs.
//! Jobs report back through the `on_*` handlers. Every handler mutates the
//! controller state under one borrow, collects what the delegate has to hear
//! and only calls the delegate once the borrow is released, so a delegate may
//! drop its request from inside any callback.
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    task::Poll,
    time::Duration,
};

use http::HeaderValue;
use local_sync::oneshot;

use super::{
    alternative_service_for_dns_job,
    job::{spawn_cancellable, Job, JobFailure, JobId, JobMode, JobPhase},
    request::{
        LoadState, ReadyStream, RequestInfo, RequestOptions, RequestState, StreamFailure,
        StreamRequest, StreamRequestDelegate, StreamType, WebSocketHandshakeStreamCreateHelper,
    },
    selection::get_alternative_service_info_for,
    ControllerSet, JobType, Session,
};
use crate::{
    alt_svc::{select_quic_version, AlternativeService, AlternativeServiceInfo, NextProto},
    key::{HostPortPair, RequestPriority, SchemeHostPort},
    observer::AlternateProtocolUsage,
    proxy::{ProxyInfo, ProxyScheme},
    transport::{
        ConnectError, ConnectionAttempt, Established, JobTarget, ProxyAuthChallenge, SslConfig,
        TransportPool,
    },
    NetError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ResolveProxy,
    ResolveProxyComplete,
    CreateJobs,
    None,
}

/// The slots a job can live in. At most one job per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Main,
    Alternative,
    DnsAlpnH3,
    PreconnectBackup,
}

enum Notification<S> {
    Ready(ReadyStream<S>, SslConfig, ProxyInfo),
    Failed(StreamFailure),
    CertificateError(NetError, SslConfig, HostPortPair),
    NeedsClientAuth(SslConfig, HostPortPair),
    NeedsProxyAuth(ProxyAuthChallenge, SslConfig, ProxyInfo),
    QuicBroken,
}

struct RequestLink<S> {
    state: Rc<RefCell<RequestState>>,
    delegate: Rc<dyn StreamRequestDelegate<S>>,
}

struct Inner<P: TransportPool> {
    request: Option<RequestLink<P::Stream>>,
    stream_type: StreamType,
    websocket_helper: Option<Rc<dyn WebSocketHandshakeStreamCreateHelper<P::Stream>>>,
    priority: RequestPriority,
    num_streams: usize,

    next_state: State,
    proxy_info: ProxyInfo,
    /// Alive while proxy resolution runs; dropping it cancels the resolve.
    proxy_resolve: Option<oneshot::Receiver<()>>,

    main_job: Option<Job>,
    alternative_job: Option<Job>,
    dns_alpn_h3_job: Option<Job>,
    preconnect_backup_job: Option<Job>,
    next_job_id: JobId,

    job_bound: bool,
    bound_job: Option<JobId>,
    alternative_service_info: Option<AlternativeServiceInfo>,

    main_job_net_error: Option<NetError>,
    alternative_job_net_error: Option<NetError>,
    alternative_job_failed_on_default_network: bool,
    dns_alpn_h3_job_net_error: Option<NetError>,
    dns_alpn_h3_job_failed_on_default_network: bool,

    main_job_is_blocked: bool,
    main_job_is_resumed: bool,
    main_job_wait_time: Duration,
    /// Pending `resume_main_job`; replacing or dropping it cancels the timer.
    resume_main_job_timer: Option<oneshot::Receiver<()>>,

    factory_notified: bool,
    completion_pending: bool,
}

impl<P: TransportPool> Inner<P> {
    fn new(priority: RequestPriority) -> Self {
        Self {
            request: None,
            stream_type: StreamType::Http,
            websocket_helper: None,
            priority,
            num_streams: 0,
            next_state: State::ResolveProxy,
            proxy_info: ProxyInfo::default(),
            proxy_resolve: None,
            main_job: None,
            alternative_job: None,
            dns_alpn_h3_job: None,
            preconnect_backup_job: None,
            next_job_id: 0,
            job_bound: false,
            bound_job: None,
            alternative_service_info: None,
            main_job_net_error: None,
            alternative_job_net_error: None,
            alternative_job_failed_on_default_network: false,
            dns_alpn_h3_job_net_error: None,
            dns_alpn_h3_job_failed_on_default_network: false,
            main_job_is_blocked: false,
            main_job_is_resumed: false,
            main_job_wait_time: Duration::ZERO,
            resume_main_job_timer: None,
            factory_notified: false,
            completion_pending: false,
        }
    }

    fn slot_of(&self, id: JobId) -> Option<Slot> {
        let is = |job: &Option<Job>| matches!(job, Some(j) if j.id == id);
        if is(&self.main_job) {
            Some(Slot::Main)
        } else if is(&self.alternative_job) {
            Some(Slot::Alternative)
        } else if is(&self.dns_alpn_h3_job) {
            Some(Slot::DnsAlpnH3)
        } else if is(&self.preconnect_backup_job) {
            Some(Slot::PreconnectBackup)
        } else {
            None
        }
    }

    fn slot(&mut self, slot: Slot) -> &mut Option<Job> {
        match slot {
            Slot::Main => &mut self.main_job,
            Slot::Alternative => &mut self.alternative_job,
            Slot::DnsAlpnH3 => &mut self.dns_alpn_h3_job,
            Slot::PreconnectBackup => &mut self.preconnect_backup_job,
        }
    }

    fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        let slot = self.slot_of(id)?;
        self.slot(slot).as_mut()
    }

    /// Jobs that take part in the race.
    fn live_job_count(&self) -> usize {
        [&self.main_job, &self.alternative_job, &self.dns_alpn_h3_job]
            .into_iter()
            .filter(|j| j.is_some())
            .count()
    }

    fn is_job_orphaned(&self, id: JobId) -> bool {
        self.request.is_none() || (self.job_bound && self.bound_job != Some(id))
    }

    fn next_job_id(&mut self) -> JobId {
        self.next_job_id += 1;
        self.next_job_id
    }

    fn reset_error_status_for_jobs(&mut self) {
        self.main_job_net_error = None;
        self.alternative_job_net_error = None;
        self.alternative_job_failed_on_default_network = false;
        self.dns_alpn_h3_job_net_error = None;
        self.dns_alpn_h3_job_failed_on_default_network = false;
    }
}

pub(crate) struct JobController<P: TransportPool> {
    id: u64,
    this: Weak<JobController<P>>,
    session: Rc<Session<P>>,
    factory: Weak<ControllerSet<P>>,
    request_info: RequestInfo,
    options: RequestOptions,
    is_preconnect: bool,
    is_websocket: bool,
    inner: RefCell<Inner<P>>,
}

impl<P: TransportPool> JobController<P> {
    pub(crate) fn new(
        id: u64,
        session: Rc<Session<P>>,
        factory: Weak<ControllerSet<P>>,
        request_info: RequestInfo,
        options: RequestOptions,
        is_preconnect: bool,
        is_websocket: bool,
    ) -> Rc<Self> {
        #[cfg(feature = "logging")]
        tracing::debug!(
            "job controller {id} for {} (preconnect: {is_preconnect})",
            request_info.url
        );
        Rc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            session,
            factory,
            inner: RefCell::new(Inner::new(options.priority)),
            request_info,
            options,
            is_preconnect,
            is_websocket,
        })
    }

    pub(crate) fn start(
        &self,
        delegate: Rc<dyn StreamRequestDelegate<P::Stream>>,
        websocket_helper: Option<Rc<dyn WebSocketHandshakeStreamCreateHelper<P::Stream>>>,
        stream_type: StreamType,
    ) -> StreamRequest<P> {
        let state = Rc::new(RefCell::new(RequestState::default()));
        let mut notes = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            debug_assert!(inner.request.is_none());
            inner.stream_type = stream_type;
            inner.websocket_helper = websocket_helper;
            inner.request = Some(RequestLink {
                state: state.clone(),
                delegate,
            });
            self.run_loop(&mut inner, Ok(()), &mut notes);
        }
        self.flush(notes);
        StreamRequest::new(self.this.clone(), state, stream_type)
    }

    pub(crate) fn preconnect(&self, num_streams: usize) {
        debug_assert!(self.is_preconnect);
        let mut notes = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            inner.stream_type = StreamType::Http;
            inner.num_streams = num_streams;
            self.run_loop(&mut inner, Ok(()), &mut notes);
        }
        self.flush(notes);
    }

    pub(crate) fn load_state(&self) -> LoadState {
        let inner = self.inner.borrow();
        if inner.next_state == State::ResolveProxyComplete && inner.proxy_resolve.is_some() {
            return LoadState::ResolvingProxyForUrl;
        }
        let bound = inner.bound_job.and_then(|id| {
            [&inner.main_job, &inner.alternative_job, &inner.dns_alpn_h3_job]
                .into_iter()
                .flatten()
                .find(|j| j.id == id)
        });
        bound
            .or(inner.main_job.as_ref())
            .or(inner.alternative_job.as_ref())
            .or(inner.dns_alpn_h3_job.as_ref())
            .map(Job::load_state)
            .unwrap_or_default()
    }

    pub(crate) fn set_priority(&self, priority: RequestPriority) {
        let mut inner = self.inner.borrow_mut();
        inner.priority = priority;
        for slot in [
            Slot::Main,
            Slot::Alternative,
            Slot::DnsAlpnH3,
            Slot::PreconnectBackup,
        ] {
            if let Some(job) = inner.slot(slot) {
                job.set_priority(priority, self.session.pool());
            }
        }
    }

    pub(crate) fn restart_tunnel_with_proxy_auth(&self, authorization: HeaderValue) -> bool {
        let mut inner = self.inner.borrow_mut();
        let Some(id) = inner.bound_job else {
            return false;
        };
        inner
            .job_mut(id)
            .map(|job| job.restart_tunnel_with_proxy_auth(authorization))
            .unwrap_or(false)
    }

    pub(crate) fn on_request_complete(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.request.take().is_none() {
                return;
            }
            if !inner.job_bound {
                inner.alternative_job = None;
                inner.main_job = None;
                inner.dns_alpn_h3_job = None;
            } else if let Some(id) = inner.bound_job.take() {
                if let Some(slot) = inner.slot_of(id) {
                    *inner.slot(slot) = None;
                }
            }
            self.maybe_notify_factory_of_completion(&mut inner);
        }
        self.flush(Vec::new());
    }

    // Job callbacks. Ids of jobs that were reset in the meantime are ignored.

    pub(crate) fn on_job_connecting(&self, id: JobId) {
        if let Some(job) = self.inner.borrow_mut().job_mut(id) {
            if job.phase == JobPhase::Start {
                job.phase = JobPhase::Connecting;
            }
        }
    }

    pub(crate) fn job_should_wait(&self, id: JobId) -> Option<oneshot::Receiver<()>> {
        let mut inner = self.inner.borrow_mut();
        if inner.slot_of(id) != Some(Slot::Main) {
            // alternative and DNS jobs never wait
            return None;
        }
        if !inner.main_job_is_blocked {
            if inner.main_job_wait_time.is_zero() {
                return None;
            }
            let delay = inner.main_job_wait_time;
            self.resume_main_job_later(&mut inner, delay);
        }
        #[cfg(feature = "logging")]
        tracing::debug!(
            "main job of controller {} waits (blocked: {})",
            self.id,
            inner.main_job_is_blocked
        );
        inner.main_job.as_mut().map(Job::wait)
    }

    pub(crate) fn on_using_existing_quic_session(&self, id: JobId) {
        if let Some(job) = self.inner.borrow_mut().job_mut(id) {
            job.using_existing_quic_session = true;
        }
    }

    pub(crate) fn maybe_set_wait_time_for_main_job(&self, delay: Duration) {
        let mut inner = self.inner.borrow_mut();
        if !inner.main_job_is_blocked {
            return;
        }
        let Some(main) = inner.main_job.as_ref() else {
            return;
        };
        let config = self.session.config();
        let has_available_spdy_session =
            self.session.pool().has_available_http2_session(&main.target);
        let wait = if !config.delay_main_job_with_spdy_session && has_available_spdy_session {
            Duration::ZERO
        } else {
            delay.min(config.max_main_job_delay)
        };
        inner.main_job_wait_time = wait;
        self.session
            .observer()
            .on_main_job_wait_time(wait, has_available_spdy_session);
    }

    pub(crate) fn on_connection_initialized(&self, id: JobId, rv: Result<(), NetError>) {
        if rv.is_ok() {
            return;
        }
        // a failed attempt cannot hold the main job back any longer
        let mut inner = self.inner.borrow_mut();
        let delay = inner.main_job_wait_time;
        self.maybe_resume_main_job(&mut inner, id, delay);
    }

    pub(crate) fn on_failed_on_default_network(&self, id: JobId) {
        let mut inner = self.inner.borrow_mut();
        match inner.slot_of(id) {
            Some(Slot::Alternative) => inner.alternative_job_failed_on_default_network = true,
            Some(Slot::DnsAlpnH3) => inner.dns_alpn_h3_job_failed_on_default_network = true,
            _ => {}
        }
    }

    pub(crate) fn add_connection_attempts_to_request(
        &self,
        id: JobId,
        attempts: &[ConnectionAttempt],
    ) {
        let inner = self.inner.borrow();
        if self.is_preconnect || inner.is_job_orphaned(id) {
            return;
        }
        if let Some(request) = &inner.request {
            request
                .state
                .borrow_mut()
                .connection_attempts
                .extend_from_slice(attempts);
        }
    }

    pub(crate) fn on_stream_ready(&self, id: JobId, established: Established<P::Stream>) {
        let mut notes = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.slot_of(id).is_none() {
                return;
            }
            if inner.is_job_orphaned(id) {
                self.on_orphaned_job_complete(&mut inner, id);
            } else {
                self.on_job_ready(&mut inner, id, established, &mut notes);
            }
        }
        self.flush(notes);
    }

    fn on_job_ready(
        &self,
        inner: &mut Inner<P>,
        id: JobId,
        established: Established<P::Stream>,
        notes: &mut Vec<Notification<P::Stream>>,
    ) {
        let Some(request) = &inner.request else {
            return;
        };
        request
            .state
            .borrow_mut()
            .complete(established.was_alpn_negotiated, established.negotiated_protocol);

        if inner.bound_job.is_none() {
            if (inner.main_job.is_some() && inner.alternative_job.is_some())
                || inner.dns_alpn_h3_job.is_some()
            {
                self.report_alternate_protocol_usage(inner, id);
            }
            self.bind_job(inner, id);
        }

        let Some(job) = inner.job_mut(id) else {
            return;
        };
        job.phase = JobPhase::Done;
        let proxy_info = job.proxy_info.clone();
        let ssl_config = job.target.server_ssl_config.clone();
        self.session
            .observer()
            .on_proxy_used(proxy_info.proxy_server().scheme(), true);
        self.session
            .proxy_resolution_service()
            .report_success(&proxy_info);

        let stream = match inner.stream_type {
            StreamType::Http => ReadyStream::Http(established.stream),
            StreamType::BidirectionalStream => ReadyStream::Bidirectional(established.stream),
            StreamType::WebSocket => match &inner.websocket_helper {
                Some(helper) => ReadyStream::WebSocket(
                    helper.create_handshake_stream(established, !proxy_info.is_direct()),
                ),
                None => unreachable!("websocket request without a handshake stream helper"),
            },
        };
        notes.push(Notification::Ready(stream, ssl_config, proxy_info));
    }

    pub(crate) fn on_job_failed(&self, id: JobId, failure: JobFailure) {
        let mut notes = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            let Some(slot) = inner.slot_of(id) else {
                return;
            };
            if slot == Slot::PreconnectBackup {
                return;
            }
            match failure {
                JobFailure::Stream(e) => {
                    self.on_stream_failed(&mut inner, slot, id, e, &mut notes)
                }
                JobFailure::Certificate(error) => {
                    if let Some(job) = self.prompt(&mut inner, id) {
                        job.wait_for_user_action();
                        notes.push(Notification::CertificateError(
                            error,
                            job.target.server_ssl_config.clone(),
                            job.target.destination.host_port_pair(),
                        ));
                    }
                }
                JobFailure::ClientAuth => {
                    if let Some(job) = self.prompt(&mut inner, id) {
                        job.wait_for_user_action();
                        notes.push(Notification::NeedsClientAuth(
                            job.target.server_ssl_config.clone(),
                            job.target.destination.host_port_pair(),
                        ));
                    }
                }
            }
        }
        self.flush(notes);
    }

    /// Returns the channel the credentials arrive on, or `None` when the job
    /// lost the race.
    pub(crate) fn on_needs_proxy_auth(
        &self,
        id: JobId,
        challenge: ProxyAuthChallenge,
    ) -> Option<oneshot::Receiver<HeaderValue>> {
        let mut notes = Vec::new();
        let restart = {
            let mut inner = self.inner.borrow_mut();
            inner.slot_of(id)?;
            let job = self.prompt(&mut inner, id)?;
            let restart = job.wait_for_proxy_credentials();
            notes.push(Notification::NeedsProxyAuth(
                challenge,
                job.target.proxy_ssl_config.clone(),
                job.proxy_info.clone(),
            ));
            restart
        };
        self.flush(notes);
        Some(restart)
    }

    /// Common part of the prompts: nothing should wait on a job that asks
    /// the delegate, and the asking job becomes the bound one.
    fn prompt<'a>(&self, inner: &'a mut Inner<P>, id: JobId) -> Option<&'a mut Job> {
        self.maybe_resume_main_job(inner, id, Duration::ZERO);
        if inner.is_job_orphaned(id) {
            self.on_orphaned_job_complete(inner, id);
            return None;
        }
        if inner.bound_job.is_none() {
            self.bind_job(inner, id);
        }
        inner.job_mut(id)
    }

    fn on_stream_failed(
        &self,
        inner: &mut Inner<P>,
        slot: Slot,
        id: JobId,
        e: ConnectError,
        notes: &mut Vec<Notification<P::Stream>>,
    ) {
        let status = e.error;
        match slot {
            Slot::Main => inner.main_job_net_error = Some(status),
            Slot::Alternative => inner.alternative_job_net_error = Some(status),
            Slot::DnsAlpnH3 => inner.dns_alpn_h3_job_net_error = Some(status),
            Slot::PreconnectBackup => return,
        }
        if let Some(job) = inner.slot(slot) {
            job.phase = JobPhase::Done;
            job.should_reconsider_proxy = status.can_fallover_to_next_proxy(&job.target.proxy);
        }
        #[cfg(feature = "logging")]
        tracing::debug!("{slot:?} job of controller {} failed: {status}", self.id);

        self.maybe_resume_main_job(inner, id, Duration::ZERO);

        if inner.is_job_orphaned(id) {
            self.on_orphaned_job_complete(inner, id);
            return;
        }

        if inner.bound_job.is_none() {
            if inner.live_job_count() >= 2 {
                // another job may still succeed
                *inner.slot(slot) = None;
                return;
            }
            self.bind_job(inner, id);
        }

        if self.reconsider_proxy_after_error(inner, slot, status) {
            self.run_loop(inner, Ok(()), notes);
            return;
        }

        let Some(job) = inner.slot(slot).as_ref() else {
            return;
        };
        self.session
            .observer()
            .on_proxy_used(job.proxy_info.proxy_server().scheme(), false);
        notes.push(Notification::Failed(StreamFailure {
            error: status,
            used_ssl_config: job.target.server_ssl_config.clone(),
            used_proxy_info: job.proxy_info.clone(),
            resolve_error_info: e.resolve_error_info,
        }));
    }

    pub(crate) fn on_preconnects_complete(&self, id: JobId, result: Result<(), NetError>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.slot_of(id) != Some(Slot::Main) {
                return;
            }
            if result == Err(NetError::DnsNoMatchingSupportedAlpn) {
                if let Some(mut backup) = inner.preconnect_backup_job.take() {
                    #[cfg(feature = "logging")]
                    tracing::debug!("controller {} falls back to a plain preconnect", self.id);
                    self.start_job(&mut backup, JobMode::Preconnect(inner.num_streams));
                    inner.main_job = Some(backup);
                    return;
                }
            }
            inner.main_job = None;
            inner.preconnect_backup_job = None;
            inner.reset_error_status_for_jobs();
            self.session.observer().on_preconnects_complete();
            self.maybe_notify_factory_of_completion(&mut inner);
        }
        self.flush(Vec::new());
    }

    fn on_orphaned_job_complete(&self, inner: &mut Inner<P>, id: JobId) {
        match inner.slot_of(id) {
            Some(slot @ (Slot::Main | Slot::Alternative | Slot::DnsAlpnH3)) => {
                #[cfg(feature = "logging")]
                tracing::debug!("orphaned {slot:?} job of controller {} done", self.id);
                *inner.slot(slot) = None;
            }
            _ => return,
        }
        self.maybe_notify_factory_of_completion(inner);
    }

    fn bind_job(&self, inner: &mut Inner<P>, id: JobId) {
        assert!(inner.request.is_some(), "binding a job without a request");
        assert!(!inner.job_bound, "a request is bound to one job only");
        inner.job_bound = true;
        inner.bound_job = Some(id);
        #[cfg(feature = "logging")]
        tracing::debug!(
            "controller {} bound to its {:?} job",
            self.id,
            inner.slot_of(id)
        );
        self.orphan_unbound_jobs(inner);
    }

    fn orphan_unbound_jobs(&self, inner: &mut Inner<P>) {
        let Some(bound) = inner.bound_job.and_then(|id| inner.slot_of(id)) else {
            return;
        };
        match bound {
            Slot::Main => {
                // left running to learn whether the alternatives are broken
                for job in [&mut inner.alternative_job, &mut inner.dns_alpn_h3_job]
                    .into_iter()
                    .flatten()
                {
                    job.orphan();
                }
            }
            Slot::Alternative => {
                // the main job must keep running to tell whether QUIC only
                // fails on the default network, or whether the DNS job is broken
                if !inner.alternative_job_failed_on_default_network && inner.dns_alpn_h3_job.is_none()
                {
                    inner.main_job = None;
                } else {
                    self.unblock_main_job(inner, Duration::ZERO);
                }
                if let Some(job) = inner.dns_alpn_h3_job.as_mut() {
                    job.orphan();
                }
            }
            Slot::DnsAlpnH3 => {
                if !inner.dns_alpn_h3_job_failed_on_default_network
                    && inner.alternative_job.is_none()
                {
                    inner.main_job = None;
                } else {
                    self.unblock_main_job(inner, Duration::ZERO);
                }
                if let Some(job) = inner.alternative_job.as_mut() {
                    job.orphan();
                }
            }
            Slot::PreconnectBackup => {}
        }
    }

    fn report_alternate_protocol_usage(&self, inner: &Inner<P>, id: JobId) {
        let usage = match inner.slot_of(id) {
            Some(Slot::Main) => AlternateProtocolUsage::MainJobWonRace,
            Some(Slot::Alternative) => match &inner.alternative_job {
                Some(job) if job.using_existing_quic_session => AlternateProtocolUsage::NoRace,
                _ => AlternateProtocolUsage::WonRace,
            },
            Some(Slot::DnsAlpnH3) => match &inner.dns_alpn_h3_job {
                Some(job) if job.using_existing_quic_session => {
                    AlternateProtocolUsage::DnsAlpnH3JobWonWithoutRace
                }
                _ => AlternateProtocolUsage::DnsAlpnH3JobWonRace,
            },
            _ => return,
        };
        self.session.observer().on_alternate_protocol_usage(usage);
    }

    // Main job blocking.

    fn resume_main_job_later(&self, inner: &mut Inner<P>, delay: Duration) {
        #[cfg(feature = "logging")]
        tracing::debug!("resuming main job of controller {} in {delay:?}", self.id);
        let this = self.this.clone();
        inner.resume_main_job_timer = Some(spawn_cancellable(async move {
            if !delay.is_zero() {
                monoio::time::sleep(delay).await;
            }
            if let Some(controller) = this.upgrade() {
                controller.resume_main_job();
            }
        }));
    }

    fn resume_main_job(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.main_job_is_resumed {
            return;
        }
        let Some(main) = inner.main_job.as_mut() else {
            return;
        };
        main.resume();
        inner.main_job_is_resumed = true;
        inner.main_job_wait_time = Duration::ZERO;
    }

    fn maybe_resume_main_job(&self, inner: &mut Inner<P>, id: JobId, delay: Duration) {
        match inner.slot_of(id) {
            None | Some(Slot::Main) | Some(Slot::PreconnectBackup) => return,
            Some(Slot::DnsAlpnH3) if inner.alternative_job.is_some() => return,
            _ => {}
        }
        self.unblock_main_job(inner, delay);
    }

    fn unblock_main_job(&self, inner: &mut Inner<P>, delay: Duration) {
        let Some(main) = inner.main_job.as_ref() else {
            return;
        };
        inner.main_job_is_blocked = false;
        if !main.is_waiting() {
            // it either has not reached the wait yet and will not block there,
            // or it is past it
            return;
        }
        inner.main_job_wait_time = delay;
        self.resume_main_job_later(inner, delay);
    }

    // Proxy resolution and job creation.

    fn run_loop(
        &self,
        inner: &mut Inner<P>,
        rv: Result<(), NetError>,
        notes: &mut Vec<Notification<P::Stream>>,
    ) {
        let Poll::Ready(Err(error)) = self.do_loop(inner, rv, notes) else {
            return;
        };
        // only proxy resolution fails here, before any job exists; the
        // request hears about it on a later turn
        debug_assert_eq!(inner.live_job_count(), 0);
        let this = self.this.clone();
        monoio::spawn(async move {
            if let Some(controller) = this.upgrade() {
                controller.notify_request_failed(error);
            }
        });
    }

    fn do_loop(
        &self,
        inner: &mut Inner<P>,
        mut rv: Result<(), NetError>,
        notes: &mut Vec<Notification<P::Stream>>,
    ) -> Poll<Result<(), NetError>> {
        debug_assert_ne!(inner.next_state, State::None);
        loop {
            let state = std::mem::replace(&mut inner.next_state, State::None);
            rv = match state {
                State::ResolveProxy => {
                    debug_assert!(rv.is_ok());
                    match self.do_resolve_proxy(inner) {
                        Poll::Ready(rv) => rv,
                        Poll::Pending => return Poll::Pending,
                    }
                }
                State::ResolveProxyComplete => self.do_resolve_proxy_complete(inner, rv),
                State::CreateJobs => {
                    debug_assert!(rv.is_ok());
                    self.do_create_jobs(inner, notes)
                }
                State::None => unreachable!("bad state"),
            };
            if rv.is_err() || inner.next_state == State::None {
                return Poll::Ready(rv);
            }
        }
    }

    fn do_resolve_proxy(&self, inner: &mut Inner<P>) -> Poll<Result<(), NetError>> {
        debug_assert!(inner.proxy_resolve.is_none());
        inner.next_state = State::ResolveProxyComplete;

        if self.request_info.load_flags.bypass_proxy {
            inner.proxy_info.use_direct();
            return Poll::Ready(Ok(()));
        }

        let url = self
            .session
            .host_mapping_rules()
            .rewrite_url(&self.request_info.url);
        let resolve = self.session.proxy_resolution_service().resolve_proxy(
            &url,
            &self.request_info.method,
            &self.request_info.network_isolation_key,
        );
        let this = self.this.clone();
        inner.proxy_resolve = Some(spawn_cancellable(async move {
            let result = resolve.await;
            if let Some(controller) = this.upgrade() {
                controller.on_proxy_resolved(result);
            }
        }));
        Poll::Pending
    }

    fn on_proxy_resolved(&self, result: Result<ProxyInfo, NetError>) {
        let mut notes = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            let rv = result.map(|proxy_info| inner.proxy_info = proxy_info);
            self.run_loop(&mut inner, rv, &mut notes);
        }
        self.flush(notes);
    }

    fn do_resolve_proxy_complete(
        &self,
        inner: &mut Inner<P>,
        rv: Result<(), NetError>,
    ) -> Result<(), NetError> {
        inner.proxy_resolve = None;
        #[cfg(feature = "logging")]
        tracing::debug!(
            "controller {} resolved proxy {}",
            self.id,
            inner.proxy_info.proxy_server()
        );
        rv?;

        let mut supported = vec![
            ProxyScheme::Direct,
            ProxyScheme::Http,
            ProxyScheme::Https,
            ProxyScheme::Socks4,
            ProxyScheme::Socks5,
        ];
        // no websockets over QUIC
        if self.session.config().is_quic_enabled() && !self.is_websocket {
            supported.push(ProxyScheme::Quic);
        }
        inner.proxy_info.remove_proxies_without_scheme(&supported);
        if inner.proxy_info.is_empty() {
            return Err(NetError::NoSupportedProxies);
        }
        inner.next_state = State::CreateJobs;
        Ok(())
    }

    fn do_create_jobs(
        &self,
        inner: &mut Inner<P>,
        notes: &mut Vec<Notification<P::Stream>>,
    ) -> Result<(), NetError> {
        debug_assert!(inner.main_job.is_none() && inner.alternative_job.is_none());
        let config = self.session.config();
        let rules = self.session.host_mapping_rules();
        let origin_url = rules.rewrite_url(&self.request_info.url);
        let destination = SchemeHostPort::try_from(&origin_url)
            .map_err(|_| NetError::Failed)?
            .to_http();

        // QUIC through proxies is not supported, so alternatives are only
        // looked up for direct connections
        let mut alternative = None;
        if inner.proxy_info.is_direct() {
            let selection = get_alternative_service_info_for(
                &self.session,
                &self.request_info,
                inner.stream_type,
                self.options.enable_alternative_services,
            );
            if selection.quic_broken {
                notes.push(Notification::QuicBroken);
            }
            alternative = selection.info;
        }
        let mut quic_version = None;
        if let Some(info) = alternative.as_ref().filter(|i| i.protocol() == NextProto::Quic) {
            quic_version =
                select_quic_version(info.advertised_versions(), &config.supported_quic_versions);
            if quic_version.is_none() {
                alternative = None;
            }
        }

        let dns_alt_service = alternative_service_for_dns_job(&destination);
        let dns_alpn_h3_job_enabled = config.dns_alpn_h3_enabled
            && origin_url.scheme_str() == Some("https")
            && config.is_quic_enabled()
            && inner.proxy_info.is_direct()
            && !self
                .session
                .http_server_properties()
                .is_alternative_service_broken(
                    &dns_alt_service,
                    &self.request_info.network_isolation_key,
                );
        let dns_quic_version = config.supported_quic_versions.first().copied();

        let alternative_destination = alternative.as_ref().map(|info| {
            let mut endpoint = info.host_port_pair();
            rules.rewrite_host(&mut endpoint);
            destination.with_host_port(&endpoint)
        });

        if self.is_preconnect {
            let mut main = match (&alternative, alternative_destination) {
                (Some(info), Some(alt_destination)) => self.create_job(
                    inner,
                    JobType::Preconnect,
                    alt_destination,
                    &origin_url,
                    info.protocol(),
                    quic_version,
                    Some(info.alternative_service().clone()),
                ),
                _ => {
                    if dns_alpn_h3_job_enabled {
                        let backup = self.create_job(
                            inner,
                            JobType::Preconnect,
                            destination.clone(),
                            &origin_url,
                            NextProto::Unknown,
                            None,
                            None,
                        );
                        inner.preconnect_backup_job = Some(backup);
                        self.create_job(
                            inner,
                            JobType::PreconnectDnsAlpnH3,
                            destination,
                            &origin_url,
                            NextProto::Quic,
                            dns_quic_version,
                            Some(dns_alt_service),
                        )
                    } else {
                        self.create_job(
                            inner,
                            JobType::Preconnect,
                            destination,
                            &origin_url,
                            NextProto::Unknown,
                            None,
                            None,
                        )
                    }
                }
            };
            self.start_job(&mut main, JobMode::Preconnect(inner.num_streams));
            inner.main_job = Some(main);
            inner.alternative_service_info = alternative;
            return Ok(());
        }

        let main = self.create_job(
            inner,
            JobType::Main,
            destination.clone(),
            &origin_url,
            NextProto::Unknown,
            None,
            None,
        );
        inner.main_job = Some(main);

        if let (Some(info), Some(alt_destination)) = (&alternative, alternative_destination) {
            debug_assert!(!self.is_websocket);
            #[cfg(feature = "logging")]
            tracing::debug!(
                "controller {} races alternative service {} ({:?})",
                self.id,
                info.alternative_service(),
                quic_version
            );
            let job = self.create_job(
                inner,
                JobType::Alternative,
                alt_destination,
                &origin_url,
                info.protocol(),
                quic_version,
                Some(info.alternative_service().clone()),
            );
            inner.alternative_job = Some(job);
        }
        inner.alternative_service_info = alternative;

        if dns_alpn_h3_job_enabled {
            debug_assert!(!self.is_websocket);
            let job = self.create_job(
                inner,
                JobType::DnsAlpnH3,
                destination,
                &origin_url,
                NextProto::Quic,
                dns_quic_version,
                Some(dns_alt_service),
            );
            inner.dns_alpn_h3_job = Some(job);
        }

        self.clear_inappropriate_jobs(inner);

        if let Some(main) = &inner.main_job {
            let pool = self.session.pool();
            if inner.alternative_job.is_some()
                || (inner.dns_alpn_h3_job.is_some()
                    && !pool.has_active_socket(&main.target)
                    && !pool.has_available_http2_session(&main.target))
            {
                #[cfg(feature = "logging")]
                tracing::debug!("main job of controller {} starts blocked", self.id);
                inner.main_job_is_blocked = true;
            }
        }

        // the main job starts last so that its blocking is settled
        let mode = JobMode::Stream(inner.stream_type);
        for slot in [Slot::Alternative, Slot::DnsAlpnH3, Slot::Main] {
            if let Some(job) = inner.slot(slot) {
                self.start_job(job, mode);
            }
        }
        Ok(())
    }

    /// Drops jobs that cannot win: everything but the DNS job when it can
    /// reuse a QUIC session, and the DNS job when the alternative job covers
    /// it.
    fn clear_inappropriate_jobs(&self, inner: &mut Inner<P>) {
        let pool = self.session.pool();
        let has_quic_session = |job: &Job| {
            pool.can_use_existing_quic_session(&job.target.quic_session_key(), &job.target.destination)
        };

        if inner.dns_alpn_h3_job.as_ref().is_some_and(has_quic_session) {
            inner.main_job = None;
            inner.alternative_job = None;
        }
        if let (Some(alternative), Some(dns)) = (&inner.alternative_job, &inner.dns_alpn_h3_job) {
            if has_quic_session(alternative)
                || alternative.alternative_service == dns.alternative_service
            {
                inner.dns_alpn_h3_job = None;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_job(
        &self,
        inner: &mut Inner<P>,
        job_type: JobType,
        destination: SchemeHostPort,
        origin_url: &http::Uri,
        protocol: NextProto,
        quic_version: Option<crate::alt_svc::QuicVersion>,
        alternative_service: Option<AlternativeService>,
    ) -> Job {
        let priority = if job_type == JobType::Preconnect && alternative_service.is_some() {
            RequestPriority::Idle
        } else {
            inner.priority
        };
        let target = JobTarget {
            job_type,
            destination,
            origin_url: origin_url.clone(),
            proxy: inner.proxy_info.proxy_server(),
            protocol,
            quic_version,
            priority,
            privacy_mode: self.request_info.privacy_mode,
            network_isolation_key: self.request_info.network_isolation_key.clone(),
            server_ssl_config: self.options.server_ssl_config.clone(),
            proxy_ssl_config: self.options.proxy_ssl_config.clone(),
            is_websocket: self.is_websocket,
            enable_ip_based_pooling: self.options.enable_ip_based_pooling,
            proxy_authorization: None,
        };
        let id = inner.next_job_id();
        Job::new(id, target, inner.proxy_info.clone(), alternative_service)
    }

    fn start_job(&self, job: &mut Job, mode: JobMode) {
        job.start(
            self.this.clone(),
            self.session.pool.clone(),
            mode,
            self.session.config().enable_quic_proxies_for_https_urls,
        );
    }

    /// Falls back to the next proxy after the last job failed. Returns true
    /// when the jobs were reset and have to be created again.
    fn reconsider_proxy_after_error(
        &self,
        inner: &mut Inner<P>,
        slot: Slot,
        error: NetError,
    ) -> bool {
        debug_assert!(inner.proxy_resolve.is_none());
        let should_reconsider = matches!(inner.slot(slot), Some(job) if job.should_reconsider_proxy);
        if !should_reconsider || self.request_info.load_flags.bypass_proxy {
            return false;
        }
        if !inner.proxy_info.fallback(error) {
            return false;
        }
        #[cfg(feature = "logging")]
        tracing::debug!(
            "controller {} falls back to proxy {} after {error}",
            self.id,
            inner.proxy_info.proxy_server()
        );

        inner.job_bound = false;
        inner.bound_job = None;
        inner.dns_alpn_h3_job = None;
        inner.alternative_job = None;
        inner.main_job = None;
        inner.reset_error_status_for_jobs();
        inner.resume_main_job_timer = None;
        inner.main_job_is_resumed = false;
        inner.main_job_is_blocked = false;
        inner.next_state = State::ResolveProxyComplete;
        true
    }

    // Completion.

    fn maybe_notify_factory_of_completion(&self, inner: &mut Inner<P>) {
        if inner.live_job_count() > 0 {
            return;
        }

        if let Some(info) = inner.alternative_service_info.clone() {
            self.maybe_report_broken_alternative_service(
                inner,
                info.alternative_service(),
                inner.alternative_job_net_error,
                inner.alternative_job_failed_on_default_network,
                JobType::Alternative,
            );
        }
        if let Ok(origin) = SchemeHostPort::try_from(
            &self
                .session
                .host_mapping_rules()
                .rewrite_url(&self.request_info.url),
        ) {
            self.maybe_report_broken_alternative_service(
                inner,
                &alternative_service_for_dns_job(&origin.to_http()),
                inner.dns_alpn_h3_job_net_error,
                inner.dns_alpn_h3_job_failed_on_default_network,
                JobType::DnsAlpnH3,
            );
        }
        // reported once
        inner.reset_error_status_for_jobs();

        if inner.request.is_some() || inner.factory_notified {
            return;
        }
        debug_assert!(inner.bound_job.is_none());
        inner.factory_notified = true;
        inner.completion_pending = true;
    }

    fn maybe_report_broken_alternative_service(
        &self,
        inner: &Inner<P>,
        service: &AlternativeService,
        error: Option<NetError>,
        failed_on_default_network: bool,
        job_type: JobType,
    ) {
        if error.is_none() && !failed_on_default_network {
            return;
        }
        // the alternative is not to blame when the main job failed too
        if inner.main_job_net_error.is_some() {
            return;
        }
        if error == Some(NetError::DnsNoMatchingSupportedAlpn) {
            return;
        }
        let properties = self.session.http_server_properties();
        let nik = &self.request_info.network_isolation_key;
        let Some(error) = error else {
            #[cfg(feature = "logging")]
            tracing::debug!("{service} is broken until the default network changes");
            properties.mark_alternative_service_broken_until_default_network_changes(service, nik);
            return;
        };
        if matches!(
            error,
            NetError::NetworkChanged | NetError::InternetDisconnected
        ) || (error == NetError::NameNotResolved
            && self.request_info.url.host() == Some(service.host.as_str()))
        {
            return;
        }
        #[cfg(feature = "logging")]
        tracing::debug!("marking {service} broken after {error}");
        self.session
            .observer()
            .on_alternative_service_failure(job_type, service, error);
        properties.mark_alternative_service_broken(service, nik);
    }

    fn notify_request_failed(&self, error: NetError) {
        let mut notes = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            if inner.request.is_some() {
                notes.push(Notification::Failed(StreamFailure {
                    error,
                    used_ssl_config: self.options.server_ssl_config.clone(),
                    used_proxy_info: ProxyInfo::default(),
                    resolve_error_info: Default::default(),
                }));
            } else if self.is_preconnect {
                #[cfg(feature = "logging")]
                tracing::debug!("preconnect of controller {} failed: {error}", self.id);
                self.maybe_notify_factory_of_completion(&mut inner);
            }
        }
        self.flush(notes);
    }

    /// Delivers `notes` in order, then tells the factory if the controller is
    /// done. Must not be called with the state borrowed.
    fn flush(&self, notes: Vec<Notification<P::Stream>>) {
        for note in notes {
            let delegate = match &self.inner.borrow().request {
                Some(request) => request.delegate.clone(),
                // the request went away in an earlier callback
                None => break,
            };
            match note {
                Notification::Ready(stream, ssl_config, proxy_info) => {
                    delegate.on_stream_ready(stream, &ssl_config, &proxy_info)
                }
                Notification::Failed(failure) => delegate.on_stream_failed(failure),
                Notification::CertificateError(error, ssl_config, server) => {
                    delegate.on_certificate_error(error, &ssl_config, &server)
                }
                Notification::NeedsClientAuth(ssl_config, server) => {
                    delegate.on_needs_client_auth(&ssl_config, &server)
                }
                Notification::NeedsProxyAuth(challenge, ssl_config, proxy_info) => {
                    delegate.on_needs_proxy_auth(&challenge, &ssl_config, &proxy_info)
                }
                Notification::QuicBroken => delegate.on_quic_broken(),
            }
        }

        let complete = std::mem::take(&mut self.inner.borrow_mut().completion_pending);
        if complete {
            if let Some(factory) = self.factory.upgrade() {
                factory.on_job_controller_complete(self.id);
            }
        }
    }
}

impl<P: TransportPool> Drop for JobController<P> {
    fn drop(&mut self) {
        // jobs go before the proxy resolve, in this order
        let inner = self.inner.get_mut();
        inner.main_job = None;
        inner.alternative_job = None;
        inner.dns_alpn_h3_job = None;
        inner.preconnect_backup_job = None;
        inner.bound_job = None;
        inner.proxy_resolve = None;
        inner.resume_main_job_timer = None;
    }
}
