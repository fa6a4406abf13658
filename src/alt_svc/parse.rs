use std::time::Duration;

use smol_str::SmolStr;

/// Max age applied when an entry carries no `ma` parameter.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(86400);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSvcEntry {
    /// Percent-decoded ALPN protocol id.
    pub protocol_id: String,
    /// Empty when the authority omitted the host, meaning the origin host.
    pub host: SmolStr,
    pub port: u16,
    pub max_age: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltSvcHeader {
    Clear,
    Entries(Vec<AltSvcEntry>),
}

/// Parses an `Alt-Svc` field value. Returns `None` if any part of it is
/// malformed, in which case the whole header must be ignored.
pub fn parse_alt_svc(value: &str) -> Option<AltSvcHeader> {
    let value = value.trim();
    if value == "clear" {
        return Some(AltSvcHeader::Clear);
    }
    let mut entries = Vec::new();
    for alt_value in split_unquoted(value, ',') {
        let alt_value = alt_value.trim();
        if alt_value.is_empty() {
            continue;
        }
        entries.push(parse_alt_value(alt_value)?);
    }
    Some(AltSvcHeader::Entries(entries))
}

fn parse_alt_value(alt_value: &str) -> Option<AltSvcEntry> {
    let mut parts = split_unquoted(alt_value, ';').into_iter();
    let alternative = parts.next()?.trim();
    let (protocol_id, authority) = alternative.split_once('=')?;
    let protocol_id = percent_decode(protocol_id.trim())?;
    if protocol_id.is_empty() {
        return None;
    }
    let authority = unquote(authority.trim())?;
    let (host, port) = authority.rsplit_once(':')?;
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    let host = host.strip_prefix('[').unwrap_or(host);
    let host = host.strip_suffix(']').unwrap_or(host);

    let mut max_age = DEFAULT_MAX_AGE;
    for param in parts {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        let (name, value) = param.split_once('=')?;
        let value = value.trim();
        let value = match value.strip_prefix('"') {
            Some(_) => unquote(value)?,
            None => value.to_string(),
        };
        if name.trim().eq_ignore_ascii_case("ma") {
            max_age = parse_max_age(&value)?;
        }
    }

    Some(AltSvcEntry {
        protocol_id,
        host: host.to_ascii_lowercase().into(),
        port,
        max_age,
    })
}

/// Seconds, saturating at 32 bits.
fn parse_max_age(value: &str) -> Option<Duration> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs = value.parse::<u32>().unwrap_or(u32::MAX);
    Some(Duration::from_secs(secs.into()))
}

/// Splits on `sep` outside of quoted strings.
fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (idx, c) in s.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                out.push(&s[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn unquote(s: &str) -> Option<String> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '"' => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
