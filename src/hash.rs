//! Keyed bucket placement.
//!
//! Bucket indices are derived from a secret 32-byte key through a
//! tagged, two-level siphash construction, so that an adversary who
//! can observe (or choose) addresses still cannot predict which bucket
//! an entry lands in, nor aim enough entries at one bucket to own it.
//!
//! Addresses are coarsened to their *group* (the /16 prefix for IPv4,
//! the first 32 bits for IPv6) before hashing, which bounds how many
//! buckets any single network range can reach: entries of one group
//! spread over at most [`TRIED_BUCKETS_PER_GROUP`] tried buckets, and
//! entries learned from one source group over at most
//! [`NEW_BUCKETS_PER_SOURCE_GROUP`] new buckets.
use std::io;
use std::net;

use bitcoin::consensus::encode::{self, Decodable, Encodable};
use bitcoin_hashes::siphash24;

use rand::RngCore;

/// Total number of buckets for tried addresses.
pub const TRIED_BUCKET_COUNT: usize = 64;
/// Total number of buckets for new addresses.
pub const NEW_BUCKET_COUNT: usize = 256;
/// Over how many tried buckets entries with the same group are spread.
pub const TRIED_BUCKETS_PER_GROUP: u64 = 8;
/// Over how many new buckets entries from the same source group are spread.
pub const NEW_BUCKETS_PER_SOURCE_GROUP: u64 = 32;

/// Domain tags for the placement hashes.
const TAG_TRIED_POSITION: &[u8] = b"T1";
const TAG_TRIED_BUCKET: &[u8] = b"T2";
const TAG_NEW_POSITION: &[u8] = b"N1";
const TAG_NEW_BUCKET: &[u8] = b"N2";

/// Secret key salting all bucket placement.
///
/// Generated once with a cryptographic RNG at first start and persisted
/// alongside the table; never derivable from observed placements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    bytes: [u8; 32],
}

impl Key {
    /// Generate a fresh key from the system CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);

        Self { bytes }
    }

    /// Construct a key from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// The raw key bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// The tried bucket for the given endpoint.
    ///
    /// A pure function of the endpoint and the key: no other table
    /// state influences the result.
    pub fn tried_bucket(&self, addr: &net::SocketAddr) -> usize {
        let endpoint = endpoint_bytes(addr);
        let position =
            self.hash(TAG_TRIED_POSITION, &[&endpoint]) % TRIED_BUCKETS_PER_GROUP;
        let bucket = self.hash(
            TAG_TRIED_BUCKET,
            &[&group(&addr.ip()), &position.to_le_bytes()],
        );

        (bucket % TRIED_BUCKET_COUNT as u64) as usize
    }

    /// The new bucket for the given endpoint, learned from a source
    /// with the given group.
    pub fn new_bucket(&self, addr: &net::SocketAddr, source_group: &[u8]) -> usize {
        let position = self.hash(TAG_NEW_POSITION, &[source_group, &group(&addr.ip())])
            % NEW_BUCKETS_PER_SOURCE_GROUP;
        let bucket = self.hash(TAG_NEW_BUCKET, &[source_group, &position.to_le_bytes()]);

        (bucket % NEW_BUCKET_COUNT as u64) as usize
    }

    /// Keyed hash of the concatenated parts under the given domain tag.
    fn hash(&self, tag: &[u8], parts: &[&[u8]]) -> u64 {
        let (k1, k2) = self.sip_keys();
        let mut data = Vec::with_capacity(18 + tag.len());

        // The remaining key material is folded into the message, so
        // all 32 bytes of the key contribute to the digest.
        data.extend_from_slice(&self.bytes[16..]);
        data.extend_from_slice(tag);
        for part in parts {
            data.extend_from_slice(part);
        }
        siphash24::Hash::hash_with_keys(k1, k2, &data).as_u64()
    }

    fn sip_keys(&self) -> (u64, u64) {
        let mut k1 = [0u8; 8];
        let mut k2 = [0u8; 8];

        k1.copy_from_slice(&self.bytes[..8]);
        k2.copy_from_slice(&self.bytes[8..16]);

        (u64::from_le_bytes(k1), u64::from_le_bytes(k2))
    }
}

impl Encodable for Key {
    fn consensus_encode<S: io::Write>(&self, s: S) -> Result<usize, io::Error> {
        self.bytes.consensus_encode(s)
    }
}

impl Decodable for Key {
    fn consensus_decode<D: io::Read>(d: D) -> Result<Self, encode::Error> {
        Ok(Self::from_bytes(<[u8; 32]>::consensus_decode(d)?))
    }
}

/// The group of an address: a coarse locality class used to spread and
/// constrain bucket placement. `/16` for IPv4, the first 32 bits for
/// IPv6, each prefixed with an address-class byte.
pub fn group(ip: &net::IpAddr) -> Vec<u8> {
    match ip {
        net::IpAddr::V4(ip) => {
            let octets = ip.octets();
            vec![1, octets[0], octets[1]]
        }
        net::IpAddr::V6(ip) => {
            let octets = ip.octets();
            vec![2, octets[0], octets[1], octets[2], octets[3]]
        }
    }
}

/// The full identity of an endpoint as hash input: the 16-byte
/// (v6-mapped) address followed by the port.
fn endpoint_bytes(addr: &net::SocketAddr) -> [u8; 18] {
    let ip = match addr.ip() {
        net::IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        net::IpAddr::V6(ip) => ip,
    };
    let mut bytes = [0u8; 18];

    bytes[..16].copy_from_slice(&ip.octets());
    bytes[16..].copy_from_slice(&addr.port().to_be_bytes());

    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_key() -> Key {
        Key::from_bytes([7; 32])
    }

    #[test]
    fn test_placement_is_deterministic() {
        let key = test_key();
        let addr: net::SocketAddr = ([93, 184, 216, 34], 8333).into();

        assert_eq!(key.tried_bucket(&addr), key.tried_bucket(&addr));
        assert_eq!(
            key.new_bucket(&addr, &group(&addr.ip())),
            key.new_bucket(&addr, &group(&addr.ip()))
        );
    }

    #[test]
    fn test_key_changes_placement() {
        let addrs = (0u8..32)
            .map(|i| net::SocketAddr::from(([88, i, 3, 4], 8333)))
            .collect::<Vec<_>>();

        let a = test_key();
        let b = Key::from_bytes([8; 32]);

        assert!(
            addrs.iter().any(|e| a.tried_bucket(e) != b.tried_bucket(e)),
            "placement must depend on the secret key"
        );
    }

    #[test]
    fn test_tried_group_spread() {
        let key = test_key();
        let mut buckets = HashSet::new();

        // One /16, many endpoints.
        for a in 0..=255u8 {
            for b in 0..4u8 {
                let addr = net::SocketAddr::from(([201, 77, a, b], 8333));
                buckets.insert(key.tried_bucket(&addr));
            }
        }
        assert!(buckets.len() <= TRIED_BUCKETS_PER_GROUP as usize);
        assert!(!buckets.is_empty());
    }

    #[test]
    fn test_new_source_group_spread() {
        let key = test_key();
        let source = group(&net::IpAddr::from([99, 99, 1, 1]));
        let mut buckets = HashSet::new();

        for a in 0..=255u8 {
            for b in 0..8u8 {
                let addr = net::SocketAddr::from(([b.wrapping_mul(31), a, b, 1], 8333));
                buckets.insert(key.new_bucket(&addr, &source));
            }
        }
        assert!(buckets.len() <= NEW_BUCKETS_PER_SOURCE_GROUP as usize);
        assert!(buckets.len() > 1);
    }

    #[test]
    fn test_group() {
        let a = group(&net::IpAddr::from([124, 99, 123, 1]));
        let b = group(&net::IpAddr::from([124, 99, 12, 8]));
        let c = group(&net::IpAddr::from([124, 54, 123, 1]));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
