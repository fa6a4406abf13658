use std::{rc::Rc, time::Duration};

use http::{header::ALT_SVC, HeaderMap, HeaderValue, StatusCode};

use super::*;
use crate::{
    alt_svc::{AlternativeService, AlternativeServiceInfo, NextProto, QuicVersion},
    key::{HostPortPair, RequestPriority, Scheme},
    observer::AlternateProtocolUsage,
    proxy::{ProxyScheme, ProxyServer},
    testing::{
        init_logging, run_until_idle, MockTransportPool, Outcome, RecordingDelegate,
        RecordingObserver, Script,
    },
    transport::{ConnectError, ProxyAuthChallenge},
    NetError,
};

const URL: &str = "https://www.example.org/index.html";
const HOST: &str = "www.example.org";

struct Harness {
    factory: StreamFactory<MockTransportPool>,
    observer: Rc<RecordingObserver>,
    proxies: Rc<FixedProxyResolutionService>,
}

fn harness(config: StreamFactoryConfig) -> Harness {
    harness_with_proxies(config, "DIRECT")
}

fn harness_with_proxies(config: StreamFactoryConfig, pac: &str) -> Harness {
    init_logging();
    let observer = Rc::new(RecordingObserver::default());
    let proxies = Rc::new(FixedProxyResolutionService::from_pac_result(pac).unwrap());
    let session = Session::new(config, MockTransportPool::default())
        .unwrap()
        .with_proxy_resolution_service(proxies.clone())
        .with_observer(observer.clone());
    Harness {
        factory: StreamFactory::new(session),
        observer,
        proxies,
    }
}

fn origin() -> SchemeHostPort {
    SchemeHostPort::new(Scheme::Https, HOST, 443)
}

fn info(url: &str) -> RequestInfo {
    RequestInfo::new(url.parse().unwrap())
}

fn quic_service(host: &str) -> AlternativeService {
    AlternativeService::new(NextProto::Quic, host, 443)
}

fn winner(delegate: &RecordingDelegate) -> JobType {
    match &delegate.ready.borrow()[0].0 {
        ReadyStream::Http(s) | ReadyStream::Bidirectional(s) => s.job_type,
        ReadyStream::WebSocket(ws) => ws.stream.job_type,
    }
}

async fn settle(millis: u64) {
    monoio::time::sleep(Duration::from_millis(millis)).await;
    run_until_idle().await;
}

impl Harness {
    fn pool(&self) -> &MockTransportPool {
        self.factory.session().pool()
    }

    fn properties(&self) -> &HttpServerProperties {
        self.factory.session().http_server_properties()
    }

    fn advertise_quic(&self, host: &str) {
        let properties = self.properties();
        properties.set_alternative_services(
            &origin(),
            &NetworkIsolationKey::default(),
            vec![AlternativeServiceInfo::new_quic(
                quic_service(host),
                properties.now() + Duration::from_secs(3600),
                vec![QuicVersion::RfcV1],
            )],
        );
    }

    fn is_broken(&self, service: &AlternativeService) -> bool {
        self.properties()
            .is_alternative_service_broken(service, &NetworkIsolationKey::default())
    }

    fn request(&self, url: &str) -> (Rc<RecordingDelegate>, StreamRequest<MockTransportPool>) {
        let delegate = Rc::new(RecordingDelegate::default());
        let request = self
            .factory
            .request_stream(info(url), RequestOptions::default(), delegate.clone());
        (delegate, request)
    }
}

#[monoio::test(enable_timer = true)]
async fn main_job_serves_plain_http() {
    let h = harness(StreamFactoryConfig::default());
    let (delegate, request) = h.request("http://www.example.org/");
    assert_eq!(delegate.ready_count(), 0);
    run_until_idle().await;

    assert_eq!(delegate.ready_count(), 1);
    assert_eq!(winner(&delegate), JobType::Main);
    assert!(request.completed());
    assert_eq!(request.negotiated_protocol(), NextProto::Http11);
    assert!(!request.using_spdy());
    assert_eq!(h.pool().connects(), vec![JobType::Main]);
    assert_eq!(h.observer.proxies_used(), vec![(ProxyScheme::Direct, true)]);
    assert_eq!(h.factory.num_job_controllers(), 1);

    drop(request);
    assert_eq!(h.factory.num_job_controllers(), 0);
}

#[monoio::test(enable_timer = true)]
async fn alternative_job_wins_and_cancels_main() {
    let h = harness(StreamFactoryConfig::default());
    h.advertise_quic(HOST);
    h.pool()
        .script_direct(HOST, 443, false, Outcome::Hang);
    let (delegate, request) = h.request(URL);
    run_until_idle().await;

    assert_eq!(delegate.ready_count(), 1);
    assert_eq!(winner(&delegate), JobType::Alternative);
    assert!(request.using_spdy());
    assert_eq!(request.negotiated_protocol(), NextProto::Quic);
    // the blocked main job never got to connect
    assert_eq!(h.pool().connects(), vec![JobType::Alternative]);
    assert_eq!(
        h.observer.protocol_usages(),
        vec![AlternateProtocolUsage::WonRace]
    );

    drop(request);
    assert_eq!(h.factory.num_job_controllers(), 0);
}

#[monoio::test(enable_timer = true)]
async fn failed_alternative_unblocks_main_and_is_marked_broken() {
    let h = harness(StreamFactoryConfig::default());
    h.advertise_quic(HOST);
    h.pool().script_direct(
        HOST,
        443,
        true,
        Script::from(Outcome::fail(NetError::QuicHandshakeFailed)).after(Duration::from_millis(20)),
    );
    let (delegate, request) = h.request(URL);
    run_until_idle().await;
    assert_eq!(h.pool().connects(), vec![JobType::Alternative]);
    assert_eq!(delegate.ready_count(), 0);

    settle(60).await;
    assert_eq!(delegate.ready_count(), 1);
    assert_eq!(winner(&delegate), JobType::Main);
    assert!(delegate.failures().is_empty());

    // brokenness is settled once the controller is done
    assert!(!h.is_broken(&quic_service(HOST)));
    drop(request);
    assert!(h.is_broken(&quic_service(HOST)));
    assert_eq!(
        h.observer.failures(),
        vec![(
            JobType::Alternative,
            quic_service(HOST),
            NetError::QuicHandshakeFailed
        )]
    );
}

#[monoio::test(enable_timer = true)]
async fn both_jobs_failing_marks_nothing_broken() {
    let h = harness(StreamFactoryConfig::default());
    h.advertise_quic(HOST);
    h.pool()
        .script_direct(HOST, 443, true, Outcome::fail(NetError::QuicProtocolError));
    h.pool()
        .script_direct(HOST, 443, false, Outcome::fail(NetError::ConnectionRefused));
    let (delegate, request) = h.request(URL);
    run_until_idle().await;

    assert_eq!(delegate.failures(), vec![NetError::ConnectionRefused]);
    assert_eq!(h.observer.proxies_used(), vec![(ProxyScheme::Direct, false)]);
    drop(request);
    assert!(!h.is_broken(&quic_service(HOST)));
    assert!(h.observer.failures().is_empty());
    assert_eq!(h.factory.num_job_controllers(), 0);
}

#[monoio::test(enable_timer = true)]
async fn success_off_the_default_network_marks_broken_until_network_change() {
    let h = harness(StreamFactoryConfig::default());
    h.advertise_quic(HOST);
    h.pool().script_direct(
        HOST,
        443,
        true,
        Script::from(Outcome::Ready(NextProto::Quic)).failed_on_default_network(),
    );
    let (delegate, request) = h.request(URL);
    run_until_idle().await;

    assert_eq!(winner(&delegate), JobType::Alternative);
    // the main job kept running to learn about the default network
    assert_eq!(
        h.pool().connects(),
        vec![JobType::Alternative, JobType::Main]
    );
    assert_eq!(delegate.ready_count(), 1);

    drop(request);
    assert_eq!(h.factory.num_job_controllers(), 0);
    assert!(h.is_broken(&quic_service(HOST)));
    assert!(h.observer.failures().is_empty());
    h.properties().on_default_network_changed();
    assert!(!h.is_broken(&quic_service(HOST)));
}

#[monoio::test(enable_timer = true)]
async fn main_job_waits_for_capped_delay() {
    let h = harness(StreamFactoryConfig::default().max_main_job_delay(Duration::from_millis(20)));
    h.pool().main_job_delay.set(Duration::from_millis(500));
    h.advertise_quic(HOST);
    h.pool()
        .script_direct(HOST, 443, true, Outcome::fail(NetError::QuicProtocolError));
    let (delegate, _request) = h.request(URL);
    run_until_idle().await;

    assert_eq!(h.observer.wait_times(), vec![Duration::from_millis(20)]);
    assert_eq!(h.pool().connects(), vec![JobType::Alternative]);
    assert_eq!(delegate.ready_count(), 0);

    settle(60).await;
    assert_eq!(winner(&delegate), JobType::Main);
}

#[monoio::test(enable_timer = true)]
async fn available_http2_session_skips_the_delay() {
    let h = harness(StreamFactoryConfig::default().delay_main_job_with_spdy_session(false));
    h.pool().main_job_delay.set(Duration::from_millis(500));
    h.pool().available_http2_session.set(true);
    h.advertise_quic(HOST);
    h.pool()
        .script_direct(HOST, 443, true, Outcome::fail(NetError::QuicProtocolError));
    let (delegate, _request) = h.request(URL);
    run_until_idle().await;

    assert_eq!(h.observer.wait_times(), vec![Duration::ZERO]);
    assert_eq!(winner(&delegate), JobType::Main);
}

#[monoio::test(enable_timer = true)]
async fn only_one_job_is_bound() {
    let h = harness(StreamFactoryConfig::default().dns_alpn_h3_enabled(true));
    h.advertise_quic("alt.example.org");
    let ready = || Script::from(Outcome::Ready(NextProto::Quic)).after(Duration::from_millis(20));
    h.pool().script_direct("alt.example.org", 443, true, ready());
    h.pool().script_direct(HOST, 443, true, ready());
    let (delegate, request) = h.request(URL);

    settle(60).await;
    assert_eq!(delegate.ready_count(), 1);
    assert_ne!(winner(&delegate), JobType::Main);
    assert_eq!(h.pool().connects().len(), 3);
    // the losers finished orphaned; only the bound job is left
    assert_eq!(h.factory.num_job_controllers(), 1);

    drop(request);
    assert_eq!(h.factory.num_job_controllers(), 0);
    assert_eq!(delegate.ready_count(), 1);
}

#[monoio::test(enable_timer = true)]
async fn dns_job_matching_the_alternative_is_dropped() {
    let h = harness(StreamFactoryConfig::default().dns_alpn_h3_enabled(true));
    h.advertise_quic(HOST);
    let (delegate, _request) = h.request(URL);
    run_until_idle().await;

    assert_eq!(winner(&delegate), JobType::Alternative);
    assert_eq!(h.pool().connects(), vec![JobType::Alternative]);
}

#[monoio::test(enable_timer = true)]
async fn existing_quic_session_leaves_only_the_dns_job() {
    let h = harness(StreamFactoryConfig::default().dns_alpn_h3_enabled(true));
    h.pool().add_quic_session(HostPortPair::new(HOST, 443));
    let (delegate, _request) = h.request(URL);
    run_until_idle().await;

    assert_eq!(winner(&delegate), JobType::DnsAlpnH3);
    assert_eq!(h.pool().connects(), vec![JobType::DnsAlpnH3]);
    assert_eq!(
        h.observer.protocol_usages(),
        vec![AlternateProtocolUsage::DnsAlpnH3JobWonWithoutRace]
    );
}

#[monoio::test(enable_timer = true)]
async fn broken_dns_alpn_h3_job_is_not_retried() {
    let h = harness(StreamFactoryConfig::default().dns_alpn_h3_enabled(true));
    h.pool()
        .script_direct(HOST, 443, true, Outcome::fail(NetError::QuicProtocolError));
    let (delegate, request) = h.request(URL);
    run_until_idle().await;
    assert_eq!(winner(&delegate), JobType::Main);
    drop(request);

    let dns_service = quic_service(HOST);
    assert!(h.is_broken(&dns_service));
    assert_eq!(
        h.observer.failures(),
        vec![(JobType::DnsAlpnH3, dns_service, NetError::QuicProtocolError)]
    );

    let (delegate, _request) = h.request(URL);
    run_until_idle().await;
    assert_eq!(winner(&delegate), JobType::Main);
    assert_eq!(
        h.pool().connects(),
        vec![JobType::DnsAlpnH3, JobType::Main, JobType::Main]
    );
}

#[monoio::test(enable_timer = true)]
async fn missing_h3_alpn_does_not_mark_dns_job_broken() {
    let h = harness(StreamFactoryConfig::default().dns_alpn_h3_enabled(true));
    h.pool().script_direct(
        HOST,
        443,
        true,
        Outcome::fail(NetError::DnsNoMatchingSupportedAlpn),
    );
    let (delegate, request) = h.request(URL);
    run_until_idle().await;
    assert_eq!(winner(&delegate), JobType::Main);
    drop(request);
    assert!(!h.is_broken(&quic_service(HOST)));
}

#[monoio::test(enable_timer = true)]
async fn orphaned_job_keeps_controller_alive() {
    let h = harness(StreamFactoryConfig::default().dns_alpn_h3_enabled(true));
    // a warm socket keeps the main job from waiting on the DNS job
    h.pool().active_socket.set(true);
    h.pool().script_direct(HOST, 443, true, Outcome::Hang);
    let (delegate, request) = h.request(URL);
    run_until_idle().await;

    assert_eq!(winner(&delegate), JobType::Main);
    assert_eq!(
        h.observer.protocol_usages(),
        vec![AlternateProtocolUsage::MainJobWonRace]
    );
    drop(request);
    assert_eq!(h.factory.num_job_controllers(), 1);
}

#[monoio::test(enable_timer = true)]
async fn proxy_fallback_marks_bad_proxy_once() {
    let h = harness_with_proxies(
        StreamFactoryConfig::default(),
        "PROXY bad:99; PROXY good:80; DIRECT",
    );
    let bad = ProxyServer::new(ProxyScheme::Http, HostPortPair::new("bad", 99));
    h.pool().script(
        bad,
        HostPortPair::new(HOST, 80),
        false,
        Outcome::fail(NetError::ConnectionRefused),
    );
    let (delegate, _request) = h.request("http://www.example.org/");
    run_until_idle().await;

    assert_eq!(delegate.ready_count(), 1);
    let used = delegate.ready.borrow()[0].1.proxy_server();
    assert_eq!(
        used,
        ProxyServer::new(ProxyScheme::Http, HostPortPair::new("good", 80))
    );
    let retry_info = h.proxies.proxy_retry_info();
    assert_eq!(retry_info.len(), 1);
    assert_eq!(
        retry_info.get("bad:99").map(|i| i.net_error),
        Some(NetError::ConnectionRefused)
    );
    assert_eq!(h.observer.proxies_used(), vec![(ProxyScheme::Http, true)]);
}

#[monoio::test(enable_timer = true)]
async fn quic_proxy_falls_back_to_direct() {
    let h = harness_with_proxies(StreamFactoryConfig::default(), "QUIC bad:99; DIRECT");
    let bad = ProxyServer::new(ProxyScheme::Quic, HostPortPair::new("bad", 99));
    h.pool().script(
        bad,
        HostPortPair::new(HOST, 80),
        true,
        Outcome::fail(NetError::ConnectionReset),
    );
    let (delegate, _request) = h.request("http://www.example.org/");
    run_until_idle().await;

    assert_eq!(delegate.ready_count(), 1);
    assert!(delegate.ready.borrow()[0].1.is_direct());
    let retry_info = h.proxies.proxy_retry_info();
    assert_eq!(retry_info.len(), 1);
    assert!(retry_info.contains_key("quic://bad:99"));
}

#[monoio::test(enable_timer = true)]
async fn unsupported_proxies_fail_asynchronously() {
    let h = harness_with_proxies(StreamFactoryConfig::default().quic_enabled(false), "QUIC q:99");
    let (delegate, request) = h.request(URL);
    assert!(delegate.failures().is_empty());
    run_until_idle().await;

    assert_eq!(delegate.failures(), vec![NetError::NoSupportedProxies]);
    assert!(delegate.failed.borrow()[0].used_proxy_info.is_empty());
    assert!(h.pool().connects().is_empty());
    drop(request);
    assert_eq!(h.factory.num_job_controllers(), 0);
}

#[monoio::test(enable_timer = true)]
async fn invalid_url_fails_asynchronously() {
    let h = harness(StreamFactoryConfig::default());
    let delegate = Rc::new(RecordingDelegate::default());
    let request = h.factory.request_stream(
        info("/relative").bypass_proxy(),
        RequestOptions::default(),
        delegate.clone(),
    );
    // job creation ran inline; the failure still waits for the next turn
    assert!(delegate.failures().is_empty());
    run_until_idle().await;
    assert_eq!(delegate.failures(), vec![NetError::Failed]);
    drop(request);
    assert_eq!(h.factory.num_job_controllers(), 0);
}

#[monoio::test(enable_timer = true)]
async fn proxy_auth_restarts_tunnel() {
    let h = harness_with_proxies(StreamFactoryConfig::default(), "PROXY proxy:8080");
    let proxy = ProxyServer::new(ProxyScheme::Http, HostPortPair::new("proxy", 8080));
    let challenge = ProxyAuthChallenge {
        proxy: proxy.clone(),
        status: StatusCode::PROXY_AUTHENTICATION_REQUIRED,
        headers: HeaderMap::new(),
    };
    let error = ConnectError {
        proxy_auth_challenge: Some(challenge),
        ..ConnectError::from(NetError::ProxyAuthRequested)
    };
    let destination = HostPortPair::new(HOST, 443);
    h.pool()
        .script(proxy.clone(), destination.clone(), false, Outcome::Fail(error));
    h.pool().script(
        proxy,
        destination,
        false,
        Outcome::Ready(NextProto::Http11),
    );

    let (delegate, request) = h.request(URL);
    run_until_idle().await;
    assert_eq!(delegate.proxy_auth.borrow().len(), 1);
    assert_eq!(request.load_state(), LoadState::WaitingForDelegate);
    assert_eq!(delegate.ready_count(), 0);

    let credentials = HeaderValue::from_static("Basic Zm9vOmJhcg==");
    request
        .restart_tunnel_with_proxy_auth(credentials.clone())
        .unwrap();
    // nothing is waiting for credentials anymore
    assert!(request
        .restart_tunnel_with_proxy_auth(credentials.clone())
        .is_err());
    run_until_idle().await;

    assert_eq!(delegate.ready_count(), 1);
    let targets = h.pool().connect_targets();
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[1].proxy_authorization, Some(credentials));
}

#[monoio::test(enable_timer = true)]
async fn certificate_error_waits_for_delegate() {
    let h = harness(StreamFactoryConfig::default());
    h.pool()
        .script_direct(HOST, 443, false, Outcome::fail(NetError::CertAuthorityInvalid));
    let (delegate, request) = h.request(URL);
    run_until_idle().await;

    assert_eq!(
        *delegate.certificate_errors.borrow(),
        vec![(NetError::CertAuthorityInvalid, HostPortPair::new(HOST, 443))]
    );
    assert!(delegate.failures().is_empty());
    assert_eq!(request.load_state(), LoadState::WaitingForDelegate);
    drop(request);
    assert_eq!(h.factory.num_job_controllers(), 0);
}

#[monoio::test(enable_timer = true)]
async fn client_auth_is_surfaced() {
    let h = harness(StreamFactoryConfig::default());
    h.pool().script_direct(
        HOST,
        443,
        false,
        Outcome::fail(NetError::SslClientAuthCertNeeded),
    );
    let (delegate, _request) = h.request(URL);
    run_until_idle().await;
    assert_eq!(
        *delegate.client_auth.borrow(),
        vec![HostPortPair::new(HOST, 443)]
    );
    assert!(delegate.failures().is_empty());
}

#[monoio::test(enable_timer = true)]
async fn preconnect_falls_back_from_dns_alpn_h3() {
    let h = harness(StreamFactoryConfig::default().dns_alpn_h3_enabled(true));
    h.pool().script_direct(
        HOST,
        443,
        true,
        Outcome::fail(NetError::DnsNoMatchingSupportedAlpn),
    );
    h.factory.preconnect_streams(2, info(URL));
    run_until_idle().await;

    assert_eq!(
        h.pool().preconnects(),
        vec![(JobType::PreconnectDnsAlpnH3, 2), (JobType::Preconnect, 2)]
    );
    assert_eq!(h.observer.preconnects_complete(), 1);
    assert_eq!(h.factory.num_job_controllers(), 0);
    assert!(!h.is_broken(&quic_service(HOST)));
}

#[monoio::test(enable_timer = true)]
async fn preconnect_targets_the_alternative_service() {
    let h = harness(StreamFactoryConfig::default());
    h.advertise_quic("alt.example.org");
    h.factory.preconnect_streams(1, info(URL));
    run_until_idle().await;

    assert_eq!(h.pool().preconnects(), vec![(JobType::Preconnect, 1)]);
    assert_eq!(h.observer.preconnects_complete(), 1);
    assert_eq!(h.factory.num_job_controllers(), 0);
}

#[monoio::test(enable_timer = true)]
async fn preconnect_with_unusable_proxies_completes() {
    let h = harness_with_proxies(StreamFactoryConfig::default().quic_enabled(false), "QUIC q:99");
    h.factory.preconnect_streams(1, info(URL));
    assert_eq!(h.factory.num_job_controllers(), 1);
    run_until_idle().await;

    assert!(h.pool().preconnects().is_empty());
    assert_eq!(h.factory.num_job_controllers(), 0);
}

#[monoio::test(enable_timer = true)]
async fn dropping_request_early_cancels_everything() {
    let h = harness(StreamFactoryConfig::default());
    let (delegate, request) = h.request(URL);
    drop(request);
    assert_eq!(h.factory.num_job_controllers(), 0);
    run_until_idle().await;

    assert!(h.pool().connects().is_empty());
    assert_eq!(delegate.ready_count(), 0);
    assert!(delegate.failures().is_empty());
}

#[monoio::test(enable_timer = true)]
async fn request_can_be_dropped_from_its_callback() {
    let h = harness(StreamFactoryConfig::default());
    let (delegate, request) = h.request(URL);
    delegate.hold(request);
    delegate.drop_request_on_done.set(true);
    run_until_idle().await;

    assert_eq!(delegate.ready_count(), 1);
    assert!(delegate.request.borrow().is_none());
    assert_eq!(h.factory.num_job_controllers(), 0);
}

#[monoio::test(enable_timer = true)]
async fn websocket_stream_goes_through_helper() {
    let h = harness_with_proxies(StreamFactoryConfig::default(), "PROXY proxy:8080");
    let delegate = Rc::new(RecordingDelegate::default());
    let helper = Rc::new(BasicWebSocketHandshakeStreamCreateHelper {
        requested_subprotocols: vec!["chat".into()],
    });
    let request = h.factory.request_websocket_handshake_stream(
        info("wss://www.example.org/socket"),
        RequestOptions::default(),
        delegate.clone(),
        helper,
    );
    assert_eq!(request.stream_type(), StreamType::WebSocket);
    run_until_idle().await;

    assert_eq!(h.pool().connects(), vec![JobType::Main]);
    let ready = delegate.ready.borrow();
    let ReadyStream::WebSocket(ws) = &ready[0].0 else {
        panic!("expected a websocket stream");
    };
    assert!(ws.using_proxy);
    assert_eq!(ws.requested_subprotocols.len(), 1);
    assert_eq!(ws.requested_subprotocols[0].as_str(), "chat");
    assert_eq!(ws.stream.destination, origin());
    assert!(h.pool().connect_targets()[0].is_websocket);
}

#[monoio::test(enable_timer = true)]
async fn bidirectional_stream_is_served() {
    let h = harness(StreamFactoryConfig::default());
    let delegate = Rc::new(RecordingDelegate::default());
    let _request = h.factory.request_bidirectional_stream_impl(
        info(URL),
        RequestOptions::default(),
        delegate.clone(),
    );
    run_until_idle().await;
    assert!(matches!(
        delegate.ready.borrow()[0].0,
        ReadyStream::Bidirectional(_)
    ));
}

#[test]
#[should_panic(expected = "bidirectional streams need a secure url")]
fn bidirectional_stream_requires_https() {
    let h = harness(StreamFactoryConfig::default());
    let _ = h.factory.request_bidirectional_stream_impl(
        info("http://www.example.org/"),
        RequestOptions::default(),
        Rc::new(RecordingDelegate::default()),
    );
}

#[monoio::test(enable_timer = true)]
async fn load_state_follows_progress() {
    let h = harness_with_proxies(StreamFactoryConfig::default(), "PROXY proxy:8080");
    let proxy = ProxyServer::new(ProxyScheme::Http, HostPortPair::new("proxy", 8080));
    h.pool()
        .script(proxy, HostPortPair::new(HOST, 443), false, Outcome::Hang);
    let (_delegate, tunneled) = h.request(URL);
    assert_eq!(tunneled.load_state(), LoadState::ResolvingProxyForUrl);
    run_until_idle().await;
    assert_eq!(tunneled.load_state(), LoadState::EstablishingProxyTunnel);

    let h = harness(StreamFactoryConfig::default());
    h.pool().script_direct(HOST, 443, false, Outcome::Hang);
    let (_delegate, direct) = h.request(URL);
    run_until_idle().await;
    assert_eq!(direct.load_state(), LoadState::Connecting);
}

#[monoio::test(enable_timer = true)]
async fn priority_changes_reach_connecting_jobs() {
    let h = harness(StreamFactoryConfig::default());
    h.pool().script_direct(HOST, 443, false, Outcome::Hang);
    let (_delegate, request) = h.request(URL);
    run_until_idle().await;

    request.set_priority(RequestPriority::Highest);
    // unchanged priority is not forwarded again
    request.set_priority(RequestPriority::Highest);
    assert_eq!(
        h.pool().priority_changes(),
        vec![(JobType::Main, RequestPriority::Highest)]
    );
}

#[monoio::test(enable_timer = true)]
async fn restarted_tunnel_uses_current_priority() {
    let h = harness_with_proxies(StreamFactoryConfig::default(), "PROXY proxy:8080");
    let proxy = ProxyServer::new(ProxyScheme::Http, HostPortPair::new("proxy", 8080));
    let error = ConnectError {
        proxy_auth_challenge: Some(ProxyAuthChallenge {
            proxy: proxy.clone(),
            status: StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            headers: HeaderMap::new(),
        }),
        ..ConnectError::from(NetError::ProxyAuthRequested)
    };
    let destination = HostPortPair::new(HOST, 443);
    h.pool()
        .script(proxy.clone(), destination.clone(), false, Outcome::Fail(error));
    h.pool()
        .script(proxy, destination, false, Outcome::Ready(NextProto::Http11));

    let (delegate, request) = h.request(URL);
    run_until_idle().await;
    assert_eq!(request.load_state(), LoadState::WaitingForDelegate);

    request.set_priority(RequestPriority::Lowest);
    // nothing is in flight while the job waits for credentials
    assert!(h.pool().priority_changes().is_empty());
    request
        .restart_tunnel_with_proxy_auth(HeaderValue::from_static("Basic Zm9vOmJhcg=="))
        .unwrap();
    run_until_idle().await;

    assert_eq!(delegate.ready_count(), 1);
    let priorities: Vec<_> = h
        .pool()
        .connect_targets()
        .iter()
        .map(|t| t.priority)
        .collect();
    assert_eq!(priorities, vec![RequestPriority::default(), RequestPriority::Lowest]);
}

#[monoio::test(enable_timer = true)]
async fn all_quic_alternatives_broken_is_reported() {
    let h = harness(StreamFactoryConfig::default());
    h.advertise_quic(HOST);
    h.properties()
        .mark_alternative_service_broken(&quic_service(HOST), &NetworkIsolationKey::default());
    let (delegate, _request) = h.request(URL);
    run_until_idle().await;

    assert_eq!(delegate.quic_broken.get(), 1);
    assert_eq!(winner(&delegate), JobType::Main);
}

#[monoio::test(enable_timer = true)]
async fn host_mapping_rewrites_destination() {
    let h = harness(
        StreamFactoryConfig::default().host_mapping_rules("MAP www.example.org mapped.example.org:8443"),
    );
    let (delegate, _request) = h.request(URL);
    run_until_idle().await;

    let targets = h.pool().connect_targets();
    assert_eq!(
        targets[0].destination,
        SchemeHostPort::new(Scheme::Https, "mapped.example.org", 8443)
    );
    assert_eq!(delegate.ready_count(), 1);
}

#[test]
fn alt_svc_header_is_filtered_and_stored() {
    let config = StreamFactoryConfig::default().supported_quic_versions(vec![
        QuicVersion::RfcV1,
        QuicVersion::Draft29,
        QuicVersion::Q050,
        QuicVersion::Q046,
    ]);
    let h = harness(config);
    let nik = NetworkIsolationKey::default();
    let mut headers = HeaderMap::new();
    headers.insert(
        ALT_SVC,
        HeaderValue::from_static(
            r#"h3-Q043=":443", h3=":443"; ma=3600, h2="alt.example.org:8443", h3-29="other.example.org:443""#,
        ),
    );
    h.factory
        .process_alternative_services(&nik, &headers, &origin());

    let stored = h.properties().get_alternative_service_infos(&origin(), &nik);
    let services: Vec<_> = stored
        .iter()
        .map(|i| i.alternative_service().clone())
        .collect();
    assert_eq!(
        services,
        vec![
            quic_service(HOST),
            AlternativeService::new(NextProto::Http2, "alt.example.org", 8443),
            quic_service("other.example.org"),
        ]
    );
    assert_eq!(stored[2].advertised_versions(), &[QuicVersion::Draft29]);

    // malformed values leave the entries alone
    headers.insert(ALT_SVC, HeaderValue::from_static("h3"));
    h.factory
        .process_alternative_services(&nik, &headers, &origin());
    assert_eq!(
        h.properties()
            .get_alternative_service_infos(&origin(), &nik)
            .len(),
        3
    );

    headers.insert(ALT_SVC, HeaderValue::from_static("clear"));
    h.factory
        .process_alternative_services(&nik, &headers, &origin());
    assert!(h
        .properties()
        .get_alternative_service_infos(&origin(), &nik)
        .is_empty());
}

#[test]
fn huge_alt_svc_max_age_is_stored() {
    let h = harness(StreamFactoryConfig::default());
    let nik = NetworkIsolationKey::default();
    let mut headers = HeaderMap::new();
    headers.insert(
        ALT_SVC,
        HeaderValue::from_static(r#"h3=":443"; ma=18446744073709551615"#),
    );
    h.factory
        .process_alternative_services(&nik, &headers, &origin());

    let stored = h.properties().get_alternative_service_infos(&origin(), &nik);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].alternative_service(), &quic_service(HOST));
}
