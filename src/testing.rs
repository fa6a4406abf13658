//! Fakes shared by the unit tests.
use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use crate::{
    alt_svc::{AlternativeService, AlternativeServiceType, Clock, NextProto},
    factory::{JobType, ReadyStream, StreamFailure, StreamRequest, StreamRequestDelegate},
    key::{HostPortPair, RequestPriority, SchemeHostPort},
    observer::{AlternateProtocolUsage, StreamFactoryObserver},
    proxy::{ProxyInfo, ProxyScheme, ProxyServer},
    transport::{
        ConnectError, Established, JobTarget, ProxyAuthChallenge, QuicSessionKey, SslConfig,
        TransportPool,
    },
    NetError,
};

pub(crate) struct ManualClock {
    now: Cell<Instant>,
}

impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            now: Cell::new(Instant::now()),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// Sends `tracing` output of the running test to the test harness.
pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Lets every spawned task run until it blocks on something outside the
/// runtime's ready queue.
///
/// Awaiting a spawned task parks the test future on a real waker, so the
/// runtime drains its ready queue before coming back to it.
pub(crate) async fn run_until_idle() {
    for _ in 0..64 {
        monoio::spawn(async {}).await;
    }
}

#[derive(Debug)]
pub(crate) struct MockStream {
    pub(crate) job_type: JobType,
    pub(crate) destination: SchemeHostPort,
    pub(crate) proxy: ProxyServer,
}

#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Ready(NextProto),
    Fail(ConnectError),
    Hang,
}

impl Outcome {
    pub(crate) fn fail(error: NetError) -> Self {
        Outcome::Fail(error.into())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub(crate) outcome: Outcome,
    pub(crate) delay: Duration,
    pub(crate) failed_on_default_network: bool,
}

impl From<Outcome> for Script {
    fn from(outcome: Outcome) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            failed_on_default_network: false,
        }
    }
}

impl Script {
    pub(crate) fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn failed_on_default_network(mut self) -> Self {
        self.failed_on_default_network = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScriptKey {
    proxy: ProxyServer,
    destination: HostPortPair,
    quic: bool,
}

impl ScriptKey {
    fn of(target: &JobTarget) -> Self {
        Self {
            proxy: target.proxy.clone(),
            destination: target.destination.host_port_pair(),
            quic: target.using_quic(),
        }
    }
}

/// A pool answering from scripts keyed by proxy, destination and transport.
/// Unscripted targets connect at once. Scripts queue up; the last one
/// repeats.
#[derive(Default)]
pub(crate) struct MockTransportPool {
    scripts: RefCell<HashMap<ScriptKey, VecDeque<Script>>>,
    quic_sessions: RefCell<HashSet<HostPortPair>>,
    pub(crate) available_http2_session: Cell<bool>,
    pub(crate) active_socket: Cell<bool>,
    pub(crate) main_job_delay: Cell<Duration>,
    connects: RefCell<Vec<JobTarget>>,
    preconnects: RefCell<Vec<(JobType, usize)>>,
    priority_changes: RefCell<Vec<(JobType, RequestPriority)>>,
}

impl MockTransportPool {
    pub(crate) fn script(
        &self,
        proxy: ProxyServer,
        destination: HostPortPair,
        quic: bool,
        script: impl Into<Script>,
    ) {
        self.scripts
            .borrow_mut()
            .entry(ScriptKey {
                proxy,
                destination,
                quic,
            })
            .or_default()
            .push_back(script.into());
    }

    /// Scripts a direct connection.
    pub(crate) fn script_direct(&self, host: &str, port: u16, quic: bool, script: impl Into<Script>) {
        self.script(
            ProxyServer::direct(),
            HostPortPair::new(host, port),
            quic,
            script,
        );
    }

    pub(crate) fn add_quic_session(&self, server: HostPortPair) {
        self.quic_sessions.borrow_mut().insert(server);
    }

    pub(crate) fn connects(&self) -> Vec<JobType> {
        self.connects.borrow().iter().map(|t| t.job_type).collect()
    }

    pub(crate) fn connect_targets(&self) -> Vec<JobTarget> {
        self.connects.borrow().clone()
    }

    pub(crate) fn preconnects(&self) -> Vec<(JobType, usize)> {
        self.preconnects.borrow().clone()
    }

    pub(crate) fn priority_changes(&self) -> Vec<(JobType, RequestPriority)> {
        self.priority_changes.borrow().clone()
    }

    fn next_script(&self, target: &JobTarget) -> Script {
        let mut scripts = self.scripts.borrow_mut();
        let Some(queue) = scripts.get_mut(&ScriptKey::of(target)) else {
            let protocol = if target.using_quic() {
                NextProto::Quic
            } else {
                NextProto::Http11
            };
            return Outcome::Ready(protocol).into();
        };
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        }
    }

    async fn play(script: &Script) -> Result<NextProto, ConnectError> {
        if !script.delay.is_zero() {
            monoio::time::sleep(script.delay).await;
        }
        match &script.outcome {
            Outcome::Ready(protocol) => Ok(*protocol),
            Outcome::Fail(e) => {
                let mut e = e.clone();
                e.failed_on_default_network |= script.failed_on_default_network;
                Err(e)
            }
            Outcome::Hang => std::future::pending().await,
        }
    }
}

impl TransportPool for MockTransportPool {
    type Stream = MockStream;

    async fn connect(&self, target: &JobTarget) -> Result<Established<MockStream>, ConnectError> {
        self.connects.borrow_mut().push(target.clone());
        let script = self.next_script(target);
        let protocol = Self::play(&script).await?;
        let stream = MockStream {
            job_type: target.job_type,
            destination: target.destination.clone(),
            proxy: target.proxy.clone(),
        };
        let mut established = Established::new(stream, protocol);
        established.failed_on_default_network = script.failed_on_default_network;
        Ok(established)
    }

    async fn preconnect(&self, target: &JobTarget, num_streams: usize) -> Result<(), ConnectError> {
        self.preconnects
            .borrow_mut()
            .push((target.job_type, num_streams));
        let script = self.next_script(target);
        Self::play(&script).await.map(|_| ())
    }

    fn has_available_http2_session(&self, _target: &JobTarget) -> bool {
        self.available_http2_session.get()
    }

    fn can_use_existing_quic_session(
        &self,
        _key: &QuicSessionKey,
        destination: &SchemeHostPort,
    ) -> bool {
        self.quic_sessions
            .borrow()
            .contains(&destination.host_port_pair())
    }

    fn has_active_socket(&self, _target: &JobTarget) -> bool {
        self.active_socket.get()
    }

    fn main_job_delay_hint(&self, _target: &JobTarget) -> Duration {
        self.main_job_delay.get()
    }

    fn set_priority(&self, target: &JobTarget, priority: RequestPriority) {
        self.priority_changes
            .borrow_mut()
            .push((target.job_type, priority));
    }
}

/// Records every callback. Optionally drops its request from inside the
/// first terminal callback.
#[derive(Default)]
pub(crate) struct RecordingDelegate {
    pub(crate) ready: RefCell<Vec<(ReadyStream<MockStream>, ProxyInfo)>>,
    pub(crate) failed: RefCell<Vec<StreamFailure>>,
    pub(crate) certificate_errors: RefCell<Vec<(NetError, HostPortPair)>>,
    pub(crate) client_auth: RefCell<Vec<HostPortPair>>,
    pub(crate) proxy_auth: RefCell<Vec<ProxyAuthChallenge>>,
    pub(crate) quic_broken: Cell<usize>,
    pub(crate) request: RefCell<Option<StreamRequest<MockTransportPool>>>,
    pub(crate) drop_request_on_done: Cell<bool>,
}

impl RecordingDelegate {
    pub(crate) fn hold(&self, request: StreamRequest<MockTransportPool>) {
        *self.request.borrow_mut() = Some(request);
    }

    pub(crate) fn ready_count(&self) -> usize {
        self.ready.borrow().len()
    }

    pub(crate) fn failures(&self) -> Vec<NetError> {
        self.failed.borrow().iter().map(|f| f.error).collect()
    }

    fn done(&self) {
        if self.drop_request_on_done.get() {
            let request = self.request.borrow_mut().take();
            drop(request);
        }
    }
}

impl StreamRequestDelegate<MockStream> for RecordingDelegate {
    fn on_stream_ready(
        &self,
        stream: ReadyStream<MockStream>,
        _used_ssl_config: &SslConfig,
        used_proxy_info: &ProxyInfo,
    ) {
        self.ready
            .borrow_mut()
            .push((stream, used_proxy_info.clone()));
        self.done();
    }

    fn on_stream_failed(&self, failure: StreamFailure) {
        self.failed.borrow_mut().push(failure);
        self.done();
    }

    fn on_certificate_error(&self, error: NetError, _: &SslConfig, server: &HostPortPair) {
        self.certificate_errors
            .borrow_mut()
            .push((error, server.clone()));
    }

    fn on_needs_client_auth(&self, _: &SslConfig, server: &HostPortPair) {
        self.client_auth.borrow_mut().push(server.clone());
    }

    fn on_needs_proxy_auth(&self, challenge: &ProxyAuthChallenge, _: &SslConfig, _: &ProxyInfo) {
        self.proxy_auth.borrow_mut().push(challenge.clone());
    }

    fn on_quic_broken(&self) {
        self.quic_broken.set(self.quic_broken.get() + 1);
    }
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    protocol_usages: RefCell<Vec<AlternateProtocolUsage>>,
    service_types: RefCell<Vec<AlternativeServiceType>>,
    proxies_used: RefCell<Vec<(ProxyScheme, bool)>>,
    failures: RefCell<Vec<(JobType, AlternativeService, NetError)>>,
    wait_times: RefCell<Vec<Duration>>,
    preconnects_complete: Cell<usize>,
}

impl RecordingObserver {
    pub(crate) fn protocol_usages(&self) -> Vec<AlternateProtocolUsage> {
        self.protocol_usages.borrow().clone()
    }

    pub(crate) fn service_types(&self) -> Vec<AlternativeServiceType> {
        self.service_types.borrow().clone()
    }

    pub(crate) fn proxies_used(&self) -> Vec<(ProxyScheme, bool)> {
        self.proxies_used.borrow().clone()
    }

    pub(crate) fn failures(&self) -> Vec<(JobType, AlternativeService, NetError)> {
        self.failures.borrow().clone()
    }

    pub(crate) fn wait_times(&self) -> Vec<Duration> {
        self.wait_times.borrow().clone()
    }

    pub(crate) fn preconnects_complete(&self) -> usize {
        self.preconnects_complete.get()
    }
}

impl StreamFactoryObserver for RecordingObserver {
    fn on_alternate_protocol_usage(&self, usage: AlternateProtocolUsage) {
        self.protocol_usages.borrow_mut().push(usage);
    }

    fn on_alternative_service_type(&self, service_type: AlternativeServiceType) {
        self.service_types.borrow_mut().push(service_type);
    }

    fn on_proxy_used(&self, scheme: ProxyScheme, success: bool) {
        self.proxies_used.borrow_mut().push((scheme, success));
    }

    fn on_alternative_service_failure(
        &self,
        job_type: JobType,
        service: &AlternativeService,
        error: NetError,
    ) {
        self.failures
            .borrow_mut()
            .push((job_type, service.clone(), error));
    }

    fn on_main_job_wait_time(&self, wait: Duration, _has_available_spdy_session: bool) {
        self.wait_times.borrow_mut().push(wait);
    }

    fn on_preconnects_complete(&self) {
        self.preconnects_complete
            .set(self.preconnects_complete.get() + 1);
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::run_until_idle;

    #[monoio::test(enable_timer = true)]
    async fn idle_wait_drains_spawned_tasks() {
        let hops = Rc::new(Cell::new(0));
        let counter = hops.clone();
        monoio::spawn(async move {
            counter.set(1);
            let inner = counter.clone();
            monoio::spawn(async move { inner.set(2) }).await;
            counter.set(3);
        });
        run_until_idle().await;
        assert_eq!(hops.get(), 3);
    }
}
