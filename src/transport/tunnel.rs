//! HTTP `CONNECT` tunnels through a proxy.
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};

use super::{ConnectError, ProxyAuthChallenge};
use crate::{key::HostPortPair, proxy::ProxyServer, NetError};

/// How much data to read for the CONNECT handshake before it's considered invalid.
const HEADER_SECTION_MAX_LENGTH: usize = 8192;

pub(crate) fn connect_request(target: &HostPortPair, authorization: Option<&HeaderValue>) -> Vec<u8> {
    let mut req = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n"
    )
    .into_bytes();
    if let Some(auth) = authorization {
        req.extend_from_slice(b"Proxy-Authorization: ");
        req.extend_from_slice(auth.as_bytes());
        req.extend_from_slice(b"\r\n");
    }
    req.extend_from_slice(b"\r\n");
    req
}

/// Asks the proxy on the other side of `io` for a tunnel to `target`.
pub(crate) async fn establish_tunnel<IO>(
    io: &mut IO,
    target: &HostPortPair,
    proxy: &ProxyServer,
    authorization: Option<&HeaderValue>,
) -> Result<(), ConnectError>
where
    IO: AsyncReadRent + AsyncWriteRent,
{
    let (res, _) = io.write_all(connect_request(target, authorization)).await;
    res?;

    let mut head = Vec::with_capacity(1024);
    loop {
        let (res, buf) = io.read(Vec::with_capacity(1024)).await;
        let n = res?;
        if n == 0 {
            return Err(NetError::TunnelConnectionFailed.into());
        }
        head.extend_from_slice(&buf[..n]);
        if let Some(end) = find_head_end(&head) {
            // nothing may follow the head before the client speaks
            if end != head.len() {
                return Err(NetError::TunnelConnectionFailed.into());
            }
            return parse_tunnel_response(&head, proxy);
        }
        if head.len() > HEADER_SECTION_MAX_LENGTH {
            #[cfg(feature = "logging")]
            tracing::debug!("CONNECT response head from {proxy} too large");
            return Err(NetError::TunnelConnectionFailed.into());
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

pub(crate) fn parse_tunnel_response(head: &[u8], proxy: &ProxyServer) -> Result<(), ConnectError> {
    let text = std::str::from_utf8(head).map_err(|_| NetError::TunnelConnectionFailed)?;
    let mut lines = text.split("\r\n");
    let status = lines
        .next()
        .and_then(|line| {
            let mut parts = line.splitn(3, ' ');
            let version = parts.next()?;
            if !version.starts_with("HTTP/1.") {
                return None;
            }
            StatusCode::from_bytes(parts.next()?.as_bytes()).ok()
        })
        .ok_or(NetError::TunnelConnectionFailed)?;

    match status {
        StatusCode::OK => Ok(()),
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
            let mut headers = HeaderMap::new();
            for line in lines.filter(|l| !l.is_empty()) {
                let Some((name, value)) = line.split_once(':') else {
                    continue;
                };
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.trim().as_bytes()),
                    HeaderValue::from_str(value.trim()),
                ) {
                    headers.append(name, value);
                }
            }
            Err(ConnectError {
                proxy_auth_challenge: Some(ProxyAuthChallenge {
                    proxy: proxy.clone(),
                    status,
                    headers,
                }),
                ..ConnectError::from(NetError::ProxyAuthRequested)
            })
        }
        _ => {
            #[cfg(feature = "logging")]
            tracing::debug!("proxy {proxy} refused CONNECT with {status}");
            Err(NetError::TunnelConnectionFailed.into())
        }
    }
}
