//! Client IP resolution.
//!
//! The caller's address decides whether master and maintenance keys are
//! honoured and which bucket IP-zone rate limits count against, so forged
//! forwarding headers must not be able to change it.
//!
//! # Resolution Order
//!
//! ```text
//! peer (ConnectInfo) known?
//!   ├─ yes, peer in TRUSTED_PROXIES ─► X-Forwarded-For ─► X-Real-IP ─► peer
//!   ├─ yes, peer not trusted ────────► peer (headers ignored)
//!   └─ no (in-process calls) ────────► X-Forwarded-For ─► X-Real-IP ─► "unknown"
//! ```
//!
//! Proxies append to `X-Forwarded-For`, so only its right end is written by
//! infrastructure we trust. The list is walked right to left, trusted proxy
//! hops are skipped, and the first untrusted hop is the client. When every
//! hop is a trusted proxy the left-most one is used.
//!
//! The `"unknown"` fallback never parses as an address, so it is never
//! inside an IP allow list.

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::debug;

use crate::ip_policy::IpPolicy;

/// Fallback when no client address can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Resolved caller address, attached to admitted requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl ClientIp {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardedIp<'a> {
    Xff(&'a str),
    RealIp(&'a str),
    Missing,
}

fn forwarded_ip<'a, B>(req: &'a Request<B>, trusted_proxies: &IpPolicy) -> ForwardedIp<'a> {
    let hops: Vec<&str> = req
        .headers()
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect();

    let client = hops
        .iter()
        .rev()
        .copied()
        .find(|hop| !trusted_proxies.is_allowed(hop))
        .or_else(|| hops.first().copied());
    if let Some(client) = client {
        return ForwardedIp::Xff(client);
    }

    if let Some(value) = req.headers().get("x-real-ip")
        && let Ok(value) = value.to_str()
        && !value.trim().is_empty()
    {
        return ForwardedIp::RealIp(value.trim());
    }

    ForwardedIp::Missing
}

/// Address of the directly connected peer, with IPv4-mapped addresses folded.
fn peer_ip<B>(req: &Request<B>) -> Option<String> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| match addr.ip() {
            std::net::IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(|v4| v4.to_string())
                .unwrap_or_else(|| v6.to_string()),
            v4 => v4.to_string(),
        })
}

/// Determine the caller's address for admission decisions.
pub fn resolve_client_ip<B>(req: &Request<B>, trusted_proxies: &IpPolicy) -> Cow<'static, str> {
    let peer = peer_ip(req);

    let headers_trusted = match peer.as_deref() {
        Some(peer) => !trusted_proxies.is_empty() && trusted_proxies.is_allowed(peer),
        None => true,
    };

    if headers_trusted {
        match forwarded_ip(req, trusted_proxies) {
            ForwardedIp::Xff(ip) => {
                debug!(client_ip = %ip, proxy = ?peer, "Client IP from X-Forwarded-For");
                return Cow::Owned(ip.to_string());
            }
            ForwardedIp::RealIp(ip) => {
                debug!(client_ip = %ip, proxy = ?peer, "Client IP from X-Real-IP");
                return Cow::Owned(ip.to_string());
            }
            ForwardedIp::Missing => {}
        }
    }

    match peer {
        Some(peer) => Cow::Owned(peer),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn with_peer(mut req: Request<Body>, peer: &str) -> Request<Body> {
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>(peer.parse().unwrap()));
        req
    }

    fn untrusted() -> IpPolicy {
        IpPolicy::new(vec![])
    }

    #[test]
    fn test_headers_used_without_peer() {
        let req = Request::builder()
            .header("x-forwarded-for", "  192.168.1.1 , 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(resolve_client_ip(&req, &untrusted()), "10.0.0.1");

        let proxies = IpPolicy::new(vec!["10.0.0.0/8".into()]);
        assert_eq!(resolve_client_ip(&req, &proxies), "192.168.1.1");
    }

    #[test]
    fn test_xff_priority_over_real_ip() {
        let req = Request::builder()
            .header("x-forwarded-for", "10.0.0.1")
            .header("x-real-ip", "192.168.1.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(resolve_client_ip(&req, &untrusted()), "10.0.0.1");
    }

    #[test]
    fn test_real_ip_when_xff_empty() {
        let req = Request::builder()
            .header("x-forwarded-for", "  ")
            .header("x-real-ip", "192.168.1.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(resolve_client_ip(&req, &untrusted()), "192.168.1.1");
    }

    #[test]
    fn test_unknown_is_borrowed() {
        let req = Request::builder().body(Body::empty()).unwrap();
        let ip = resolve_client_ip(&req, &untrusted());
        assert_eq!(ip, UNKNOWN_IP);
        assert!(matches!(ip, Cow::Borrowed(_)));
    }

    #[test]
    fn test_untrusted_peer_ignores_headers() {
        let req = Request::builder()
            .header("x-forwarded-for", "127.0.0.1")
            .body(Body::empty())
            .unwrap();
        let req = with_peer(req, "203.0.113.7:4000");
        assert_eq!(resolve_client_ip(&req, &untrusted()), "203.0.113.7");

        let proxies = IpPolicy::new(vec!["10.0.0.0/8".into()]);
        assert_eq!(resolve_client_ip(&req, &proxies), "203.0.113.7");
    }

    #[test]
    fn test_trusted_peer_forwards_headers() {
        let proxies = IpPolicy::new(vec!["10.0.0.0/8".into()]);
        let req = Request::builder()
            .header("x-forwarded-for", "198.51.100.4, 10.0.0.2")
            .body(Body::empty())
            .unwrap();
        let req = with_peer(req, "10.0.0.2:443");
        assert_eq!(resolve_client_ip(&req, &proxies), "198.51.100.4");
    }

    #[test]
    fn test_client_supplied_hops_are_not_trusted() {
        let proxies = IpPolicy::new(vec!["10.0.0.0/8".into()]);
        let req = Request::builder()
            .header("x-forwarded-for", "127.0.0.1, 198.51.100.4")
            .body(Body::empty())
            .unwrap();
        let req = with_peer(req, "10.0.0.2:443");
        assert_eq!(resolve_client_ip(&req, &proxies), "198.51.100.4");
    }

    #[test]
    fn test_trusted_hops_are_skipped_right_to_left() {
        let proxies = IpPolicy::new(vec!["10.0.0.0/8".into()]);
        let req = Request::builder()
            .header("x-forwarded-for", "127.0.0.1, 198.51.100.4, 10.0.0.7")
            .header("x-forwarded-for", "10.0.0.3")
            .body(Body::empty())
            .unwrap();
        let req = with_peer(req, "10.0.0.2:443");
        assert_eq!(resolve_client_ip(&req, &proxies), "198.51.100.4");
    }

    #[test]
    fn test_all_trusted_hops_use_leftmost() {
        let proxies = IpPolicy::new(vec!["10.0.0.0/8".into()]);
        let req = Request::builder()
            .header("x-forwarded-for", "10.1.1.1, 10.0.0.7")
            .body(Body::empty())
            .unwrap();
        let req = with_peer(req, "10.0.0.2:443");
        assert_eq!(resolve_client_ip(&req, &proxies), "10.1.1.1");
    }

    #[test]
    fn test_trusted_peer_without_headers_falls_back_to_peer() {
        let proxies = IpPolicy::new(vec!["10.0.0.0/8".into()]);
        let req = with_peer(Request::builder().body(Body::empty()).unwrap(), "10.0.0.2:443");
        assert_eq!(resolve_client_ip(&req, &proxies), "10.0.0.2");
    }

    #[test]
    fn test_mapped_peer_is_folded() {
        let req = with_peer(
            Request::builder().body(Body::empty()).unwrap(),
            "[::ffff:192.0.2.1]:80",
        );
        assert_eq!(resolve_client_ip(&req, &untrusted()), "192.0.2.1");
    }
}
