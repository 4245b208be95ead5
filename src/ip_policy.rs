//! IP allow-list matching for tier-restricted keys.
//!
//! An [`IpPolicy`] wraps the list of addresses and CIDR ranges configured for
//! one privilege tier of one application (`masterKeyIps`,
//! `maintenanceKeyIps`). The same type backs the trusted-proxy list used by
//! client IP extraction.
//!
//! # Matching Order
//!
//! ```text
//! is_allowed(ip)
//!    │
//!    ├── resolved-address cache hit ──────────────► allow
//!    ├── allow-all flag for the address family ───► allow
//!    └── structural match against entries
//!           └── matched AND listed verbatim ──► cache ip, allow
//! ```
//!
//! # Sentinels
//!
//! `0.0.0.0/0` / `0.0.0.0` and `::/0` / `::` are never inserted as entries.
//! They set a per-family allow-all flag instead, so the common "allow
//! everything" configuration costs a single branch.
//!
//! # Concurrency
//!
//! The matcher is built lazily on first use through a [`OnceLock`], so
//! concurrent first requests build it exactly once. After that every
//! lookup is a read. Only literal single-address entries are cached; caching
//! subnet hits would let the cache grow with every distinct caller.

use std::fmt;
use std::net::IpAddr;
use std::sync::OnceLock;

use dashmap::DashSet;
use tracing::{debug, warn};

/// Address family of a configured entry or an incoming address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// Parsed CIDR network range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    /// Network address
    network: IpAddr,
    /// Prefix length (e.g., 24 for /24)
    prefix_len: u8,
}

impl CidrRange {
    /// Parse an `address/prefix` pair. Returns `None` if either half is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let (ip, prefix) = cidr.trim().split_once('/')?;
        let network: IpAddr = ip.parse().ok()?;
        let prefix_len: u8 = prefix.parse().ok()?;

        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max_prefix {
            return None;
        }

        Some(Self {
            network,
            prefix_len,
        })
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.network)
    }

    /// Check if an IP address is contained within this range.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            // Families never match each other
            _ => false,
        }
    }
}

/// One configured, non-sentinel entry.
#[derive(Debug, Clone)]
enum Entry {
    Address(IpAddr),
    Subnet(CidrRange),
}

impl Entry {
    fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            Entry::Address(addr) => addr == ip,
            Entry::Subnet(range) => range.contains(ip),
        }
    }
}

/// Structure built once per policy.
#[derive(Debug, Default)]
struct Matcher {
    allow_all_v4: bool,
    allow_all_v6: bool,
    entries: Vec<Entry>,
}

impl Matcher {
    fn build(ranges: &[String]) -> Self {
        let mut matcher = Matcher::default();

        for raw in ranges {
            let full = raw.trim();
            match full {
                "::/0" | "::" => {
                    matcher.allow_all_v6 = true;
                    continue;
                }
                "0.0.0.0/0" | "0.0.0.0" => {
                    matcher.allow_all_v4 = true;
                    continue;
                }
                _ => {}
            }

            let entry = if full.contains('/') {
                CidrRange::parse(full).map(Entry::Subnet)
            } else {
                full.parse::<IpAddr>().ok().map(Entry::Address)
            };

            match entry {
                Some(entry) => matcher.entries.push(entry),
                None => warn!(entry = %full, "Invalid IP or CIDR entry in allow list, skipping"),
            }
        }

        debug!(
            entries = matcher.entries.len(),
            allow_all_v4 = matcher.allow_all_v4,
            allow_all_v6 = matcher.allow_all_v6,
            "IP policy matcher built"
        );
        matcher
    }

    fn allows_all(&self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::V4 => self.allow_all_v4,
            AddressFamily::V6 => self.allow_all_v6,
        }
    }
}

/// Allow list for one privilege tier of one application.
///
/// Construct once per app configuration and share it. Rebuilding the app
/// configuration creates a fresh policy with empty caches.
pub struct IpPolicy {
    ranges: Vec<String>,
    matcher: OnceLock<Matcher>,
    resolved: DashSet<String>,
}

impl IpPolicy {
    pub fn new(ranges: Vec<String>) -> Self {
        Self {
            ranges,
            matcher: OnceLock::new(),
            resolved: DashSet::new(),
        }
    }

    /// Configured entries, as given.
    pub fn ranges(&self) -> &[String] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Whether `ip` is permitted by this policy.
    ///
    /// Strings that do not parse as an IP address are never allowed.
    /// IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are matched as IPv4.
    pub fn is_allowed(&self, ip: &str) -> bool {
        let matcher = self.matcher.get_or_init(|| Matcher::build(&self.ranges));

        if self.resolved.contains(ip) {
            return true;
        }

        let Some(addr) = parse_client_ip(ip) else {
            return false;
        };

        if matcher.allows_all(AddressFamily::of(&addr)) {
            return true;
        }

        let allowed = matcher.entries.iter().any(|entry| entry.matches(&addr));

        if allowed && self.ranges.iter().any(|r| r == ip) {
            self.resolved.insert(ip.to_string());
        }

        allowed
    }

    /// Number of addresses held in the fast-path cache.
    pub fn cached_addresses(&self) -> usize {
        self.resolved.len()
    }
}

impl fmt::Debug for IpPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpPolicy")
            .field("ranges", &self.ranges)
            .field("built", &self.matcher.get().is_some())
            .field("cached", &self.resolved.len())
            .finish()
    }
}

/// Parse a client address, folding IPv4-mapped IPv6 into IPv4.
fn parse_client_ip(ip: &str) -> Option<IpAddr> {
    let addr: IpAddr = ip.trim().parse().ok()?;
    Some(match addr {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    })
}

/// Whether the address is a loopback address (`127.0.0.0/8`, `::1`, or mapped).
pub fn is_loopback(ip: &str) -> bool {
    parse_client_ip(ip).is_some_and(|addr| addr.is_loopback())
}
