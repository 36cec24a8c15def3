//! Peer address records and their quality predicates.
use std::io;
use std::net;

use bitcoin::consensus::encode::{self, Decodable, Encodable};
use bitcoin::network::address::Address;

use crate::hash;
use crate::time::{LocalDuration, LocalTime};

/// How old an address may get before it is given up on.
pub const HORIZON: LocalDuration = LocalDuration::from_days(30);
/// How many failed attempts to tolerate on a never-successful address.
pub const RETRIES: u32 = 3;
/// How many successive failures to tolerate on a known address...
pub const MAX_FAILURES: u32 = 10;
/// ... in at least this long.
pub const MIN_FAIL_INTERVAL: LocalDuration = LocalDuration::from_days(7);

/// How long after an attempt the attempt counts as in progress.
const TRY_WINDOW: LocalDuration = LocalDuration::from_secs(60);
/// How far into the future an advertised timestamp may lie.
const FUTURE_DRIFT: LocalDuration = LocalDuration::from_mins(10);

/// Address source. Specifies where an address originated from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Source {
    /// An address that was shared by another peer.
    Peer(net::SocketAddr),
    /// An address that came from a DNS seed.
    Dns,
    /// An address that came from some source external to the system, eg.
    /// specified by the user or added directly to the address manager.
    Imported,
}

impl Source {
    /// The group this source belongs to, for new-bucket placement.
    /// Non-peer sources all share one fixed class.
    pub fn group(&self) -> Vec<u8> {
        match self {
            Self::Peer(addr) => hash::group(&addr.ip()),
            Self::Dns => vec![0, 1],
            Self::Imported => vec![0, 2],
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Peer(addr) => write!(f, "{}", addr),
            Self::Dns => write!(f, "DNS"),
            Self::Imported => write!(f, "Imported"),
        }
    }
}

/// A known address, and what the node has learned about it so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    /// Network address, port and advertised services.
    pub addr: Address,
    /// Timestamp advertised for this address, clamped and refreshed
    /// locally.
    pub time: LocalTime,
    /// Where knowledge about this address first came from.
    pub source: Source,
    /// Last time a connection to this address succeeded.
    pub last_success: Option<LocalTime>,
    /// Last time a connection to this address was attempted.
    pub last_try: Option<LocalTime>,
    /// Connection attempts since the last success.
    pub attempts: u32,
    /// Number of new buckets holding this record. Memory only.
    pub(crate) ref_count: u32,
    /// Whether the record sits in a tried bucket. Memory only.
    pub(crate) in_tried: bool,
    /// Position in the shuffle vector. Memory only.
    pub(crate) random_pos: Option<usize>,
}

impl AddrInfo {
    /// Create a record for a newly learned address.
    pub fn new(addr: Address, time: LocalTime, source: Source) -> Self {
        Self {
            addr,
            time,
            source,
            last_success: None,
            last_try: None,
            attempts: 0,
            ref_count: 0,
            in_tried: false,
            random_pos: None,
        }
    }

    /// The endpoint this record describes.
    pub fn endpoint(&self) -> net::SocketAddr {
        self.addr
            .socket_addr()
            .expect("address records always hold socket addresses")
    }

    /// Whether this record is in the tried population.
    pub fn is_tried(&self) -> bool {
        self.in_tried
    }

    /// Whether the statistics on this record are bad enough that it is
    /// the preferred eviction victim.
    pub fn is_terrible(&self, now: LocalTime) -> bool {
        // An in-flight attempt marks the entry for replacement.
        if self.last_try.map_or(false, |t| now - t < TRY_WINDOW) {
            return true;
        }
        // Came in a flying DeLorean.
        if self.time > now + FUTURE_DRIFT {
            return true;
        }
        // Not seen in over a month.
        if self.time == LocalTime::default() || now - self.time > HORIZON {
            return true;
        }
        // Several attempts without ever a success.
        if self.last_success.map_or(true, |t| now - t > MIN_FAIL_INTERVAL)
            && self.attempts > RETRIES
        {
            return true;
        }
        // Many successive failures over a long period.
        if self.last_success.map_or(true, |t| now - t > HORIZON)
            && self.attempts >= MAX_FAILURES
        {
            return true;
        }
        false
    }

    /// The relative chance this record is given when selecting peers
    /// to connect to. In `(0, 1]`.
    pub fn chance(&self, now: LocalTime) -> f64 {
        let mut chance = 1.0;

        // Deprioritize after each failed attempt.
        let retries = (1 + self.attempts) as f64;
        chance /= retries * retries;

        // Deprioritize stale entries, up to the horizon.
        let horizon = HORIZON.as_secs() as f64;
        let stale = ((now - self.time).as_secs() as f64).min(horizon);
        chance /= f64::powf(2.0, stale / horizon);

        chance
    }
}

impl Encodable for Source {
    fn consensus_encode<S: io::Write>(&self, mut s: S) -> Result<usize, io::Error> {
        match self {
            Self::Peer(addr) => {
                let mut len = 0u8.consensus_encode(&mut s)?;
                len += encode_socket_addr(addr, &mut s)?;
                Ok(len)
            }
            Self::Dns => 1u8.consensus_encode(&mut s),
            Self::Imported => 2u8.consensus_encode(&mut s),
        }
    }
}

impl Decodable for Source {
    fn consensus_decode<D: io::Read>(mut d: D) -> Result<Self, encode::Error> {
        match u8::consensus_decode(&mut d)? {
            0 => Ok(Self::Peer(decode_socket_addr(&mut d)?)),
            1 => Ok(Self::Dns),
            2 => Ok(Self::Imported),
            _ => Err(encode::Error::ParseFailed("unknown address source")),
        }
    }
}

impl Encodable for AddrInfo {
    fn consensus_encode<S: io::Write>(&self, mut s: S) -> Result<usize, io::Error> {
        let mut len = self.addr.consensus_encode(&mut s)?;

        len += (self.time.as_secs() as u32).consensus_encode(&mut s)?;
        len += self.source.consensus_encode(&mut s)?;
        len += self
            .last_success
            .map_or(0, |t| t.as_secs())
            .consensus_encode(&mut s)?;
        len += self.attempts.consensus_encode(&mut s)?;

        Ok(len)
    }
}

impl Decodable for AddrInfo {
    fn consensus_decode<D: io::Read>(mut d: D) -> Result<Self, encode::Error> {
        let addr = Address::consensus_decode(&mut d)?;
        let time = u32::consensus_decode(&mut d)?;
        let source = Source::consensus_decode(&mut d)?;
        let last_success = u64::consensus_decode(&mut d)?;
        let attempts = u32::consensus_decode(&mut d)?;

        if addr.socket_addr().is_err() {
            return Err(encode::Error::ParseFailed(
                "address is not representable as a socket address",
            ));
        }
        let mut info = AddrInfo::new(addr, LocalTime::from_secs(time as u64), source);
        info.last_success = match last_success {
            0 => None,
            secs => Some(LocalTime::from_secs(secs)),
        };
        info.attempts = attempts;

        Ok(info)
    }
}

/// Encode an endpoint as its 16-byte (v6-mapped) address and port.
pub(crate) fn encode_socket_addr<S: io::Write>(
    addr: &net::SocketAddr,
    mut s: S,
) -> Result<usize, io::Error> {
    let ip = match addr.ip() {
        net::IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        net::IpAddr::V6(ip) => ip,
    };
    let mut len = ip.octets().consensus_encode(&mut s)?;
    len += addr.port().consensus_encode(&mut s)?;

    Ok(len)
}

/// Decode an endpoint written by [`encode_socket_addr`].
pub(crate) fn decode_socket_addr<D: io::Read>(mut d: D) -> Result<net::SocketAddr, encode::Error> {
    let octets = <[u8; 16]>::consensus_decode(&mut d)?;
    let port = u16::consensus_decode(&mut d)?;
    let ip = net::Ipv6Addr::from(octets);

    // Unmap v4-in-v6 addresses.
    if octets[..10] == [0; 10] && octets[10..12] == [0xff, 0xff] {
        let v4 = net::Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]);
        Ok((v4, port).into())
    } else {
        Ok((ip, port).into())
    }
}

/// Check whether an IP address is globally routable.
pub fn is_routable(addr: &net::IpAddr) -> bool {
    match addr {
        net::IpAddr::V4(addr) => ipv4_is_routable(addr),
        net::IpAddr::V6(addr) => ipv6_is_routable(addr),
    }
}

/// Check whether an IP address is locally routable.
pub fn is_local(addr: &net::IpAddr) -> bool {
    match addr {
        net::IpAddr::V4(addr) => {
            addr.is_private() || addr.is_loopback() || addr.is_link_local() || addr.is_unspecified()
        }
        net::IpAddr::V6(addr) => addr.is_loopback() || addr.is_unspecified(),
    }
}

/// Check whether an IPv4 address is globally routable.
///
/// This code is adapted from the Rust standard library's
/// `net::Ipv4Addr::is_global`. It can be replaced once that function
/// is stabilized.
fn ipv4_is_routable(addr: &net::Ipv4Addr) -> bool {
    // Check if this address is 192.0.0.9 or 192.0.0.10. These addresses are the only two
    // globally routable addresses in the 192.0.0.0/24 range.
    if u32::from(*addr) == 0xc0000009 || u32::from(*addr) == 0xc000000a {
        return true;
    }
    !addr.is_private()
        && !addr.is_loopback()
        && !addr.is_link_local()
        && !addr.is_broadcast()
        && !addr.is_documentation()
        // Make sure the address is not in 0.0.0.0/8.
        && addr.octets()[0] != 0
}

/// Check whether an IPv6 address is globally routable.
///
/// For now, this only excludes loopback and unspecified addresses, as
/// IPv6 addresses are not fully supported.
fn ipv6_is_routable(addr: &net::Ipv6Addr) -> bool {
    !addr.is_loopback() && !addr.is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::network::constants::ServiceFlags;

    fn info(time: LocalTime) -> AddrInfo {
        let addr: net::SocketAddr = ([33, 44, 55, 66], 8333).into();

        AddrInfo::new(Address::new(&addr, ServiceFlags::NETWORK), time, Source::Dns)
    }

    #[test]
    fn test_terrible_fresh_record_is_not() {
        let now = LocalTime::from_secs(1_600_000_000);

        assert!(!info(now).is_terrible(now));
    }

    #[test]
    fn test_terrible_in_flight_attempt() {
        let now = LocalTime::from_secs(1_600_000_000);
        let mut info = info(now);

        info.last_try = Some(now - LocalDuration::from_secs(30));
        assert!(info.is_terrible(now));

        info.last_try = Some(now - LocalDuration::from_mins(5));
        assert!(!info.is_terrible(now));
    }

    #[test]
    fn test_terrible_future_timestamp() {
        let now = LocalTime::from_secs(1_600_000_000);
        let mut info = info(now);

        info.time = now + LocalDuration::from_mins(11);
        assert!(info.is_terrible(now));

        info.time = now + LocalDuration::from_mins(9);
        assert!(!info.is_terrible(now));
    }

    #[test]
    fn test_terrible_stale() {
        let now = LocalTime::from_secs(1_600_000_000);
        let info = info(now - LocalDuration::from_days(31));

        assert!(info.is_terrible(now));
    }

    #[test]
    fn test_terrible_failures() {
        let now = LocalTime::from_secs(1_600_000_000);
        let mut info = info(now);

        // Four failures, never a success.
        info.attempts = 4;
        assert!(info.is_terrible(now));

        // A recent success pardons the failures.
        info.last_success = Some(now - LocalDuration::from_days(1));
        assert!(!info.is_terrible(now));

        // Ten failures since a success a month ago do not.
        info.attempts = 10;
        info.last_success = Some(now - LocalDuration::from_days(31));
        assert!(info.is_terrible(now));
    }

    #[test]
    fn test_chance_penalizes_retries_and_staleness() {
        let now = LocalTime::from_secs(1_600_000_000);
        let fresh = info(now);

        let mut retried = fresh.clone();
        retried.attempts = 3;

        let stale = info(now - LocalDuration::from_days(15));

        assert!(fresh.chance(now) <= 1.0);
        assert!(retried.chance(now) < fresh.chance(now));
        assert!(stale.chance(now) < fresh.chance(now));
        assert!(fresh.chance(now) > 0.0);
    }

    #[test]
    fn test_routability() {
        assert!(is_routable(&[93, 184, 216, 34].into()));
        assert!(!is_routable(&[127, 0, 0, 1].into()));
        assert!(!is_routable(&[10, 0, 4, 4].into()));
        assert!(!is_routable(&[0, 1, 2, 3].into()));
        assert!(is_local(&[192, 168, 1, 1].into()));
        assert!(!is_local(&[93, 184, 216, 34].into()));
    }

    #[test]
    fn test_socket_addr_codec() {
        for addr in [
            net::SocketAddr::from(([1, 2, 3, 4], 8333)),
            net::SocketAddr::from((
                net::Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x42),
                18333,
            )),
        ] {
            let mut bytes = Vec::new();
            encode_socket_addr(&addr, &mut bytes).unwrap();
            let decoded = decode_socket_addr(&bytes[..]).unwrap();

            assert_eq!(addr, decoded);
        }
    }
}
