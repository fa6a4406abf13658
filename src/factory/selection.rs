use super::{RequestInfo, Session, StreamType};
use crate::{
    alt_svc::{select_quic_version, AlternativeServiceInfo, AlternativeServiceType, NextProto},
    key::{Scheme, SchemeHostPort},
    observer::AlternateProtocolUsage,
    transport::{QuicSessionKey, TransportPool},
};

/// Alternative ports at or above this are user controllable on shared hosts.
const UNRESTRICTED_PORT: u16 = 1024;

#[derive(Debug, Default)]
pub(crate) struct AltSvcSelection {
    pub(crate) info: Option<AlternativeServiceInfo>,
    /// QUIC was advertised and every QUIC entry is broken.
    pub(crate) quic_broken: bool,
}

/// Picks the alternative service a request should race against its main job
/// and reports the kind of choice to the observer.
pub(crate) fn get_alternative_service_info_for<P: TransportPool>(
    session: &Session<P>,
    request_info: &RequestInfo,
    stream_type: StreamType,
    enable_alternative_services: bool,
) -> AltSvcSelection {
    if !enable_alternative_services {
        return AltSvcSelection::default();
    }

    let selection = get_alternative_service_info_internal(session, request_info, stream_type);
    let service_type = match &selection.info {
        None => AlternativeServiceType::NoService,
        Some(info) => {
            let same_destination =
                request_info.url.host() == Some(info.alternative_service().host.as_str());
            match (info.protocol(), same_destination) {
                (NextProto::Quic, true) => AlternativeServiceType::QuicSameDestination,
                (NextProto::Quic, false) => AlternativeServiceType::QuicDifferentDestination,
                (_, true) => AlternativeServiceType::Http2SameDestination,
                (_, false) => AlternativeServiceType::Http2DifferentDestination,
            }
        }
    };
    session.observer().on_alternative_service_type(service_type);
    selection
}

fn get_alternative_service_info_internal<P: TransportPool>(
    session: &Session<P>,
    request_info: &RequestInfo,
    stream_type: StreamType,
) -> AltSvcSelection {
    let Ok(origin) = SchemeHostPort::try_from(&request_info.url) else {
        return AltSvcSelection::default();
    };
    if origin.scheme != Scheme::Https {
        return AltSvcSelection::default();
    }

    let config = session.config();
    let rules = session.host_mapping_rules();
    let properties = session.http_server_properties();
    let nik = &request_info.network_isolation_key;
    let mapped_origin = rules.rewrite_origin(&origin);
    let infos = properties.get_alternative_service_infos(&mapped_origin, nik);
    if infos.is_empty() {
        return AltSvcSelection::default();
    }

    let mut quic_advertised = false;
    let mut quic_all_broken = true;
    let mut is_any_broken = false;
    let mut first: Option<AlternativeServiceInfo> = None;

    for info in infos {
        if info.protocol() == NextProto::Quic {
            quic_advertised = true;
        }
        let is_broken = properties.is_alternative_service_broken(info.alternative_service(), nik);
        #[cfg(feature = "logging")]
        tracing::debug!(
            "alternative service {} for {} found, broken: {}",
            info.alternative_service(),
            mapped_origin,
            is_broken
        );
        if is_broken {
            if !is_any_broken {
                is_any_broken = true;
                session
                    .observer()
                    .on_alternate_protocol_usage(AlternateProtocolUsage::Broken);
            }
            continue;
        }

        // never upgrade from a restricted port to a user controllable one
        if !config.enable_user_alternate_protocol_ports
            && info.alternative_service().port >= UNRESTRICTED_PORT
            && origin.port < UNRESTRICTED_PORT
        {
            continue;
        }

        match info.protocol() {
            NextProto::Http2 => {
                if config.http2_alt_service_enabled && first.is_none() {
                    first = Some(info);
                }
                continue;
            }
            NextProto::Quic => {}
            _ => continue,
        }

        quic_all_broken = false;
        if !config.is_quic_enabled() {
            continue;
        }
        if stream_type == StreamType::BidirectionalStream
            && config.disable_bidirectional_quic_streams
        {
            continue;
        }
        if select_quic_version(info.advertised_versions(), &config.supported_quic_versions)
            .is_none()
        {
            continue;
        }

        let session_key = QuicSessionKey {
            server: mapped_origin.host_port_pair(),
            privacy_mode: request_info.privacy_mode,
            network_isolation_key: nik.clone(),
            require_dns_https_alpn: false,
        };
        let mut destination = info.host_port_pair();
        if session_key.server.host != destination.host && !config.allow_remote_alt_svc {
            continue;
        }
        rules.rewrite_host(&mut destination);
        let destination = origin.with_host_port(&destination);

        if session
            .pool()
            .can_use_existing_quic_session(&session_key, &destination)
        {
            return AltSvcSelection {
                info: Some(info),
                quic_broken: false,
            };
        }
        if !config.is_quic_allowed_for_host(&destination.host) {
            continue;
        }
        if first.is_none() {
            first = Some(info);
        }
    }

    AltSvcSelection {
        info: first,
        quic_broken: quic_advertised && quic_all_broken,
    }
}
