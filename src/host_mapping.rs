//! Static host rewriting applied before proxy resolution and job creation.
//!
//! Rules are written as a comma separated list:
//! `MAP *.example.com 127.0.0.1:8443, EXCLUDE admin.example.com`.

use std::str::FromStr;

use http::Uri;
use smol_str::SmolStr;

use crate::{
    key::{HostPortPair, SchemeHostPort},
    Error,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct MapRule {
    pattern: SmolStr,
    replacement_host: SmolStr,
    replacement_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMappingRules {
    map_rules: Vec<MapRule>,
    exclusions: Vec<SmolStr>,
}

impl HostMappingRules {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map_rules.is_empty()
    }

    /// Adds a single `MAP` or `EXCLUDE` rule.
    pub fn add_rule(&mut self, rule: &str) -> Result<(), Error> {
        let parts: Vec<&str> = rule.split_whitespace().collect();
        match parts.as_slice() {
            [verb, pattern] if verb.eq_ignore_ascii_case("exclude") => {
                self.exclusions.push(pattern.to_ascii_lowercase().into());
                Ok(())
            }
            [verb, pattern, replacement] if verb.eq_ignore_ascii_case("map") => {
                let (host, port) = match replacement.rsplit_once(':') {
                    Some((h, p)) if !h.contains(':') => {
                        let port = p
                            .parse()
                            .map_err(|_| Error::InvalidHostMappingRule(rule.to_string()))?;
                        (h, Some(port))
                    }
                    _ => (*replacement, None),
                };
                if host.is_empty() {
                    return Err(Error::InvalidHostMappingRule(rule.to_string()));
                }
                self.map_rules.push(MapRule {
                    pattern: pattern.to_ascii_lowercase().into(),
                    replacement_host: host.to_ascii_lowercase().into(),
                    replacement_port: port,
                });
                Ok(())
            }
            _ => Err(Error::InvalidHostMappingRule(rule.to_string())),
        }
    }

    /// Rewrites `endpoint` in place, returns whether a rule applied.
    pub fn rewrite_host(&self, endpoint: &mut HostPortPair) -> bool {
        let host = endpoint.host.to_ascii_lowercase();
        let with_port = format!("{}:{}", host, endpoint.port);
        if self
            .exclusions
            .iter()
            .any(|p| match_pattern(&host, p) || match_pattern(&with_port, p))
        {
            return false;
        }
        for rule in &self.map_rules {
            if !match_pattern(&host, &rule.pattern) && !match_pattern(&with_port, &rule.pattern) {
                continue;
            }
            endpoint.host = rule.replacement_host.clone();
            if let Some(port) = rule.replacement_port {
                endpoint.port = port;
            }
            return true;
        }
        false
    }

    /// Rewrites the authority of an origin, keeping its scheme.
    pub fn rewrite_origin(&self, origin: &SchemeHostPort) -> SchemeHostPort {
        let mut hpp = origin.host_port_pair();
        if self.rewrite_host(&mut hpp) {
            origin.with_host_port(&hpp)
        } else {
            origin.clone()
        }
    }

    /// Rewrites the authority of `url`; unchanged when no rule matches or the
    /// url has no usable authority.
    pub fn rewrite_url(&self, url: &Uri) -> Uri {
        let Ok(origin) = SchemeHostPort::try_from(url) else {
            return url.clone();
        };
        let rewritten = self.rewrite_origin(&origin);
        if rewritten == origin {
            return url.clone();
        }
        rewritten.replace_in(url).unwrap_or_else(|_| url.clone())
    }
}

impl FromStr for HostMappingRules {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rules = HostMappingRules::default();
        for rule in s.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            rules.add_rule(rule)?;
        }
        Ok(rules)
    }
}

/// Glob match supporting `*` (any run) and `?` (any single char).
fn match_pattern(input: &str, pattern: &str) -> bool {
    let input = input.as_bytes();
    let pattern = pattern.as_bytes();
    let (mut i, mut p) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while i < input.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == input[i]) {
            i += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, i));
            p += 1;
        } else if let Some((sp, si)) = star {
            p = sp + 1;
            i = si + 1;
            star = Some((sp, si + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
