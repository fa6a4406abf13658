//! One connection attempt of a controller.
//!
//! The controller keeps a [`Job`] record per slot; the attempt itself runs as
//! a spawned task that reports back through a weak controller handle. Dropping
//! the record ends the task and with it any in-flight connect.
use std::{
    cell::Cell,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll},
};

use http::HeaderValue;
use local_sync::oneshot;

use super::{
    controller::JobController,
    request::{LoadState, StreamType},
};
use crate::{
    alt_svc::{AlternativeService, NextProto},
    key::{RequestPriority, Scheme},
    proxy::{ProxyInfo, ProxyScheme},
    transport::{ConnectError, JobTarget, TransportPool},
    NetError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    /// Connects to the origin, through the resolved proxy.
    Main,
    /// Connects to an alternative service advertised for the origin.
    Alternative,
    /// Speaks HTTP/3 to the origin because DNS advertised it.
    DnsAlpnH3,
    Preconnect,
    PreconnectDnsAlpnH3,
}

impl JobType {
    #[inline]
    pub fn is_preconnect(&self) -> bool {
        matches!(self, JobType::Preconnect | JobType::PreconnectDnsAlpnH3)
    }
}

pub(crate) type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobPhase {
    Start,
    Waiting,
    Connecting,
    /// Paused after a prompt was surfaced to the delegate.
    WaitingUserAction,
    Done,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum JobMode {
    Stream(StreamType),
    Preconnect(usize),
}

// Ports browsers refuse to connect to.
const RESTRICTED_PORTS: &[u16] = &[
    1, 7, 9, 11, 13, 15, 17, 19, 20, 21, 22, 23, 25, 37, 42, 43, 53, 69, 77, 79, 87, 95, 101, 102,
    103, 104, 109, 110, 111, 113, 115, 117, 119, 123, 135, 137, 139, 143, 161, 179, 389, 427, 465,
    512, 513, 514, 515, 526, 530, 531, 532, 540, 548, 554, 556, 563, 587, 601, 636, 989, 990, 993,
    995, 1719, 1720, 1723, 2049, 3659, 4045, 5060, 5061, 6000, 6566, 6665, 6666, 6667, 6668, 6669,
    6697, 10080,
];

#[inline]
pub fn is_port_allowed(port: u16) -> bool {
    port != 0 && !RESTRICTED_PORTS.contains(&port)
}

/// Controller side view of a job.
pub(crate) struct Job {
    pub(crate) id: JobId,
    pub(crate) job_type: JobType,
    pub(crate) target: JobTarget,
    pub(crate) proxy_info: ProxyInfo,
    /// The alternative service an alternative job connects to.
    pub(crate) alternative_service: Option<AlternativeService>,
    pub(crate) phase: JobPhase,
    pub(crate) orphaned: bool,
    pub(crate) using_existing_quic_session: bool,
    pub(crate) should_reconsider_proxy: bool,
    /// Shared with the running attempt so it picks up priority changes.
    priority: Rc<Cell<RequestPriority>>,
    resume_tx: Option<oneshot::Sender<()>>,
    restart_tx: Option<oneshot::Sender<HeaderValue>>,
    alive: Option<oneshot::Receiver<()>>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .field("destination", &self.target.destination)
            .field("proxy", &self.target.proxy)
            .field("phase", &self.phase)
            .field("orphaned", &self.orphaned)
            .finish()
    }
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        target: JobTarget,
        proxy_info: ProxyInfo,
        alternative_service: Option<AlternativeService>,
    ) -> Self {
        Self {
            id,
            job_type: target.job_type,
            priority: Rc::new(Cell::new(target.priority)),
            target,
            proxy_info,
            alternative_service,
            phase: JobPhase::Start,
            orphaned: false,
            using_existing_quic_session: false,
            should_reconsider_proxy: false,
            resume_tx: None,
            restart_tx: None,
            alive: None,
        }
    }

    /// Spawns the attempt. The task stops as soon as this record is dropped.
    pub(crate) fn start<P: TransportPool>(
        &mut self,
        controller: Weak<JobController<P>>,
        pool: Rc<P>,
        mode: JobMode,
        enable_quic_proxies_for_https_urls: bool,
    ) {
        debug_assert!(self.alive.is_none(), "job started twice");
        let (tx, rx) = oneshot::channel();
        self.alive = Some(rx);

        #[cfg(feature = "logging")]
        tracing::debug!(
            "starting {:?} job to {} via {}",
            self.job_type,
            self.target.destination,
            self.target.proxy
        );
        let ctx = JobContext {
            controller,
            id: self.id,
            pool,
            target: self.target.clone(),
            priority: self.priority.clone(),
            mode,
            enable_quic_proxies_for_https_urls,
        };
        monoio::spawn(Cancellable {
            closed: tx,
            fut: Box::pin(ctx.run()),
        });
    }

    #[inline]
    pub(crate) fn is_waiting(&self) -> bool {
        self.phase == JobPhase::Waiting
    }

    pub(crate) fn wait(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.resume_tx = Some(tx);
        self.phase = JobPhase::Waiting;
        rx
    }

    /// Lets a waiting job go on connecting.
    pub(crate) fn resume(&mut self) {
        if let Some(tx) = self.resume_tx.take() {
            self.phase = JobPhase::Connecting;
            let _ = tx.send(());
        }
    }

    pub(crate) fn wait_for_user_action(&mut self) {
        self.phase = JobPhase::WaitingUserAction;
    }

    pub(crate) fn wait_for_proxy_credentials(&mut self) -> oneshot::Receiver<HeaderValue> {
        let (tx, rx) = oneshot::channel();
        self.restart_tx = Some(tx);
        self.phase = JobPhase::WaitingUserAction;
        rx
    }

    /// Retries the tunnel with credentials. Returns false when the job is not
    /// waiting for them.
    pub(crate) fn restart_tunnel_with_proxy_auth(&mut self, authorization: HeaderValue) -> bool {
        match self.restart_tx.take() {
            Some(tx) => {
                self.phase = JobPhase::Connecting;
                tx.send(authorization).is_ok()
            }
            None => false,
        }
    }

    pub(crate) fn load_state(&self) -> LoadState {
        match self.phase {
            JobPhase::Start | JobPhase::Waiting | JobPhase::Done => LoadState::Idle,
            JobPhase::Connecting if self.target.establishes_tunnel() => {
                LoadState::EstablishingProxyTunnel
            }
            JobPhase::Connecting => LoadState::Connecting,
            JobPhase::WaitingUserAction => LoadState::WaitingForDelegate,
        }
    }

    /// Marks the job as running on for a request bound to another job.
    pub(crate) fn orphan(&mut self) {
        #[cfg(feature = "logging")]
        tracing::debug!("{:?} job {} orphaned", self.job_type, self.id);
        self.orphaned = true;
    }

    /// Applies to the next pool call of the attempt; a connect already
    /// handed to the pool is reprioritised there.
    pub(crate) fn set_priority<P: TransportPool>(&mut self, priority: RequestPriority, pool: &P) {
        if self.target.priority == priority {
            return;
        }
        self.target.priority = priority;
        self.priority.set(priority);
        if self.phase == JobPhase::Connecting {
            pool.set_priority(&self.target, priority);
        }
    }
}

/// Drives `fut` until it finishes or the receiver of `closed` is dropped.
struct Cancellable<F> {
    closed: oneshot::Sender<()>,
    fut: Pin<Box<F>>,
}

impl<F: Future<Output = ()>> Future for Cancellable<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.closed.poll_closed(cx).is_ready() {
            return Poll::Ready(());
        }
        this.fut.as_mut().poll(cx)
    }
}

pub(crate) fn spawn_cancellable<F>(fut: F) -> oneshot::Receiver<()>
where
    F: Future<Output = ()> + 'static,
{
    let (tx, rx) = oneshot::channel();
    monoio::spawn(Cancellable {
        closed: tx,
        fut: Box::pin(fut),
    });
    rx
}

/// What a failed attempt turns into once it reaches the controller.
pub(crate) enum JobFailure {
    Stream(ConnectError),
    Certificate(NetError),
    ClientAuth,
}

struct JobContext<P: TransportPool> {
    controller: Weak<JobController<P>>,
    id: JobId,
    pool: Rc<P>,
    target: JobTarget,
    priority: Rc<Cell<RequestPriority>>,
    mode: JobMode,
    enable_quic_proxies_for_https_urls: bool,
}

impl<P: TransportPool> JobContext<P> {
    #[inline]
    fn with_controller(&self, f: impl FnOnce(&JobController<P>)) -> bool {
        match self.controller.upgrade() {
            Some(controller) => {
                f(&controller);
                true
            }
            None => false,
        }
    }

    #[inline]
    fn refresh_priority(&mut self) {
        self.target.priority = self.priority.get();
    }

    fn check_start(&self) -> Result<(), NetError> {
        if !is_port_allowed(self.target.destination.port) {
            return Err(NetError::UnsafePort);
        }
        if self.target.proxy.scheme() == ProxyScheme::Quic
            && self.target.destination.scheme == Scheme::Https
            && !self.enable_quic_proxies_for_https_urls
        {
            return Err(NetError::NotImplemented);
        }
        Ok(())
    }

    fn fail(&self, error: ConnectError) {
        let preconnect = matches!(self.mode, JobMode::Preconnect(_));
        self.with_controller(|c| {
            if preconnect {
                c.on_preconnects_complete(self.id, Err(error.error));
            } else {
                c.on_job_failed(self.id, JobFailure::Stream(error));
            }
        });
    }

    async fn run(mut self) {
        if let Err(e) = self.check_start() {
            self.fail(e.into());
            return;
        }

        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        let wait = controller.job_should_wait(self.id);
        drop(controller);
        if let Some(resume) = wait {
            #[cfg(feature = "logging")]
            tracing::debug!("job {} waits for the main job to be resumed", self.id);
            if resume.await.is_err() {
                return;
            }
        }

        let using_quic = self.target.using_quic();
        if using_quic
            && !self.target.proxy.is_direct()
            && self.target.proxy.scheme() != ProxyScheme::Quic
        {
            self.fail(NetError::NoSupportedProxies.into());
            return;
        }

        let mut using_existing_quic_session = false;
        if using_quic {
            let key = self.target.quic_session_key();
            if self
                .pool
                .can_use_existing_quic_session(&key, &self.target.destination)
            {
                using_existing_quic_session = true;
                self.with_controller(|c| c.on_using_existing_quic_session(self.id));
            } else {
                let delay = self.pool.main_job_delay_hint(&self.target);
                self.with_controller(|c| c.maybe_set_wait_time_for_main_job(delay));
            }
        }
        if !self.with_controller(|c| c.on_job_connecting(self.id)) {
            return;
        }

        self.refresh_priority();
        if let JobMode::Preconnect(num_streams) = self.mode {
            let result = self.pool.preconnect(&self.target, num_streams).await;
            self.with_controller(|c| c.on_preconnects_complete(self.id, result.map_err(|e| e.error)));
            return;
        }

        loop {
            self.refresh_priority();
            let result = self.pool.connect(&self.target).await;
            if !using_existing_quic_session {
                let rv = result.as_ref().map(|_| ()).map_err(|e| e.error);
                self.with_controller(|c| c.on_connection_initialized(self.id, rv));
            }

            let established = match result {
                Ok(established) => established,
                Err(e) => {
                    if e.failed_on_default_network {
                        self.with_controller(|c| c.on_failed_on_default_network(self.id));
                    }
                    if !e.connection_attempts.is_empty() {
                        self.with_controller(|c| {
                            c.add_connection_attempts_to_request(self.id, &e.connection_attempts)
                        });
                    }
                    match (e.error, e.proxy_auth_challenge.clone()) {
                        (NetError::ProxyAuthRequested, Some(challenge)) => {
                            let mut restart = None;
                            self.with_controller(|c| {
                                restart = c.on_needs_proxy_auth(self.id, challenge)
                            });
                            let Some(restart) = restart else {
                                return;
                            };
                            match restart.await {
                                Ok(authorization) => {
                                    self.target.proxy_authorization = Some(authorization);
                                    continue;
                                }
                                Err(_) => return,
                            }
                        }
                        (err, _) if err.is_certificate_error() => {
                            self.with_controller(|c| {
                                c.on_job_failed(self.id, JobFailure::Certificate(err))
                            });
                        }
                        (NetError::SslClientAuthCertNeeded, _) => {
                            self.with_controller(|c| c.on_job_failed(self.id, JobFailure::ClientAuth));
                        }
                        _ => self.fail(e),
                    }
                    return;
                }
            };

            if established.failed_on_default_network {
                self.with_controller(|c| c.on_failed_on_default_network(self.id));
            }
            if self.target.expect_http2() && established.negotiated_protocol != NextProto::Http2 {
                self.fail(NetError::AlpnNegotiationFailed.into());
                return;
            }
            self.with_controller(|c| c.on_stream_ready(self.id, established));
            return;
        }
    }
}
