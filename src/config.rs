use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{alt_svc::QuicVersion, Result};

/// Upper bound of the head start given to alternative and DNS jobs.
pub const DEFAULT_MAX_MAIN_JOB_DELAY: Duration = Duration::from_secs(3);

/// Policy knobs of a stream factory session.
///
/// Every field has a default, so a JSON document only needs to name what it
/// overrides:
///
/// ```json
/// { "quic_enabled": true, "quic_host_allowlist": ["www.example.org"] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamFactoryConfig {
    pub(crate) quic_enabled: bool,
    pub(crate) http2_alt_service_enabled: bool,
    pub(crate) dns_alpn_h3_enabled: bool,
    pub(crate) delay_main_job_with_spdy_session: bool,
    pub(crate) allow_remote_alt_svc: bool,
    pub(crate) quic_host_allowlist: Vec<SmolStr>,
    pub(crate) enable_user_alternate_protocol_ports: bool,
    pub(crate) disable_bidirectional_quic_streams: bool,
    pub(crate) enable_quic_proxies_for_https_urls: bool,
    pub(crate) supported_quic_versions: Vec<QuicVersion>,
    #[serde(with = "duration_ms")]
    pub(crate) max_main_job_delay: Duration,
    pub(crate) host_mapping_rules: String,
}

impl Default for StreamFactoryConfig {
    fn default() -> Self {
        Self {
            quic_enabled: true,
            http2_alt_service_enabled: true,
            dns_alpn_h3_enabled: false,
            delay_main_job_with_spdy_session: true,
            allow_remote_alt_svc: true,
            quic_host_allowlist: Vec::new(),
            enable_user_alternate_protocol_ports: false,
            disable_bidirectional_quic_streams: false,
            enable_quic_proxies_for_https_urls: false,
            supported_quic_versions: vec![QuicVersion::RfcV1],
            max_main_job_delay: DEFAULT_MAX_MAIN_JOB_DELAY,
            host_mapping_rules: String::new(),
        }
    }
}

impl StreamFactoryConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn quic_enabled(mut self, enabled: bool) -> Self {
        self.quic_enabled = enabled;
        self
    }

    pub fn http2_alt_service_enabled(mut self, enabled: bool) -> Self {
        self.http2_alt_service_enabled = enabled;
        self
    }

    pub fn dns_alpn_h3_enabled(mut self, enabled: bool) -> Self {
        self.dns_alpn_h3_enabled = enabled;
        self
    }

    /// Keep delaying the main job even when an HTTP/2 session is available.
    pub fn delay_main_job_with_spdy_session(mut self, delay: bool) -> Self {
        self.delay_main_job_with_spdy_session = delay;
        self
    }

    pub fn allow_remote_alt_svc(mut self, allow: bool) -> Self {
        self.allow_remote_alt_svc = allow;
        self
    }

    /// Restricts QUIC alternatives to these hosts. Empty allows every host.
    pub fn quic_host_allowlist<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.quic_host_allowlist = hosts
            .into_iter()
            .map(|h| SmolStr::from(h.as_ref().to_ascii_lowercase()))
            .collect();
        self
    }

    pub fn enable_user_alternate_protocol_ports(mut self, enabled: bool) -> Self {
        self.enable_user_alternate_protocol_ports = enabled;
        self
    }

    pub fn disable_bidirectional_quic_streams(mut self, disabled: bool) -> Self {
        self.disable_bidirectional_quic_streams = disabled;
        self
    }

    pub fn enable_quic_proxies_for_https_urls(mut self, enabled: bool) -> Self {
        self.enable_quic_proxies_for_https_urls = enabled;
        self
    }

    pub fn supported_quic_versions(mut self, versions: Vec<QuicVersion>) -> Self {
        self.supported_quic_versions = versions;
        self
    }

    pub fn max_main_job_delay(mut self, delay: Duration) -> Self {
        self.max_main_job_delay = delay;
        self
    }

    pub fn host_mapping_rules(mut self, rules: impl Into<String>) -> Self {
        self.host_mapping_rules = rules.into();
        self
    }

    #[inline]
    pub fn is_quic_enabled(&self) -> bool {
        self.quic_enabled
    }

    pub(crate) fn is_quic_allowed_for_host(&self, host: &str) -> bool {
        self.quic_host_allowlist.is_empty()
            || self
                .quic_host_allowlist
                .iter()
                .any(|h| h.eq_ignore_ascii_case(host))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
