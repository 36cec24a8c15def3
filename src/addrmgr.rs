//!
//! The stochastic address manager.
//!
//! Known peers are partitioned into two populations: *new* addresses,
//! which the node has heard about but never confirmed, and *tried*
//! addresses, which it has successfully connected to at least once.
//! Each population lives in fixed-size buckets; which bucket a record
//! lands in is a keyed hash of the address (and, for new addresses,
//! of the source it was learned from), so a flood of fabricated
//! addresses from one network range can never take over more than a
//! small, unpredictable slice of the table.
//!
//! Design goals:
//!
//!  * keep only a bounded number of addresses around;
//!  * keep the tables in memory, dumping them asynchronously to disk;
//!  * make sure no (localized) attacker can fill the table with his
//!    own addresses.
use std::io;
use std::net;
use std::path::Path;

use bitcoin::consensus::encode::{self, Decodable, Encodable};
use bitcoin::network::address::Address;

use parking_lot::Mutex;

use crate::collections;
use crate::error::Error;
use crate::hash::{Key, NEW_BUCKET_COUNT, TRIED_BUCKET_COUNT};
use crate::peer::{self, AddrInfo, Source};
use crate::store;
use crate::time::{Clock, LocalDuration, LocalTime};

/// Maximum number of entries in a tried bucket.
pub const TRIED_BUCKET_SIZE: usize = 64;
/// Maximum number of entries in a new bucket.
pub const NEW_BUCKET_SIZE: usize = 64;
/// In how many new buckets a single address may appear.
pub const NEW_BUCKETS_PER_ADDRESS: u32 = 4;
/// Maximum number of addresses returned by a gossip sample.
pub const GETADDR_MAX: usize = 2500;
/// Maximum percentage of the table returned by a gossip sample.
pub const GETADDR_MAX_PCT: usize = 23;

/// How many entries of a full tried bucket are inspected when picking
/// one to replace. Sampled with replacement; small buckets may see the
/// same slot twice.
const TRIED_INSPECT_ON_EVICT: usize = 4;
/// Bound on the rejection-sampling rounds in [`Table::select`].
const SELECT_ROUNDS: usize = 50;
/// Advertised timestamps at or below this are treated as garbage.
const ANCIENT_TIME: u64 = 100_000_000;
/// How far into the future an advertised timestamp may point before it
/// is clamped.
const FUTURE_SLACK: LocalDuration = LocalDuration::from_mins(10);
/// What a clamped advertised timestamp is replaced with, relative to
/// the current time.
const FALLBACK_AGE: LocalDuration = LocalDuration::from_days(5);
/// Slack under which a re-advertised timestamp still refreshes the
/// record.
const REFRESH_SLACK: LocalDuration = LocalDuration::from_mins(60);
/// Minimum interval between timestamp refreshes of a connected peer.
const CONNECTED_REFRESH: LocalDuration = LocalDuration::from_mins(20);

/// The address tables: all records, their indices, and the buckets.
///
/// Invariants, checked by [`Table::consistency_check`]:
///
///  * the endpoint index is a bijection onto the live records;
///  * a record is in the tried population iff it sits in exactly one
///    tried bucket and no new bucket;
///  * otherwise it sits in exactly `ref_count` (1 to 4) new buckets;
///  * every live record appears exactly once in the shuffle vector,
///    at the position it remembers.
#[derive(Debug)]
struct Table {
    /// Secret key salting bucket placement.
    key: Key,
    /// Next record id to allocate.
    counter: u32,
    /// The records themselves, by id.
    infos: collections::HashMap<u32, AddrInfo>,
    /// Endpoint index into the records.
    by_addr: collections::HashMap<net::SocketAddr, u32>,
    /// Randomly-ordered vector of all live ids.
    random: Vec<u32>,
    /// Tried buckets.
    tried: Vec<Vec<u32>>,
    /// New buckets.
    new: Vec<collections::HashSet<u32>>,
    /// Number of records with at least one new-bucket membership.
    new_count: u32,
    /// Number of records in the tried population.
    tried_count: u32,
    /// Randomness for eviction, selection and shuffling.
    rng: fastrand::Rng,
}

impl Table {
    fn new(key: Key, rng: fastrand::Rng) -> Self {
        Self {
            key,
            counter: 0,
            infos: collections::map(&rng),
            by_addr: collections::map(&rng),
            random: Vec::new(),
            tried: vec![Vec::new(); TRIED_BUCKET_COUNT],
            new: (0..NEW_BUCKET_COUNT).map(|_| collections::set(&rng)).collect(),
            new_count: 0,
            tried_count: 0,
            rng,
        }
    }

    /// Add an address learned from the given source. Returns `true`
    /// iff a brand-new record was created.
    fn insert(
        &mut self,
        addr: Address,
        addr_time: LocalTime,
        source: &Source,
        penalty: LocalDuration,
        now: LocalTime,
    ) -> bool {
        let endpoint = match addr.socket_addr() {
            Ok(endpoint) => endpoint,
            Err(_) => return false,
        };
        if !peer::is_routable(&endpoint.ip()) || peer::is_local(&endpoint.ip()) {
            return false;
        }

        // Clamp absurd advertised timestamps, then apply the penalty
        // for addresses that didn't come in over gossip.
        let time = if addr_time.as_secs() <= ANCIENT_TIME || addr_time > now + FUTURE_SLACK {
            now - FALLBACK_AGE
        } else {
            addr_time
        } - penalty;

        if let Some(&id) = self.by_addr.get(&endpoint) {
            let info = self.infos.get_mut(&id).expect("indexed records must exist");

            if time > info.time - REFRESH_SLACK {
                info.time = time;
            }
            info.addr.services |= addr.services;

            if info.in_tried {
                return false;
            }
            if info.ref_count == NEW_BUCKETS_PER_ADDRESS {
                return false;
            }
            // Each additional bucket placement is exponentially harder
            // to obtain, capping how far a popular address can spread.
            let factor = 1u32 << info.ref_count;
            if factor > 1 && self.rng.u32(..factor) != 0 {
                return false;
            }
            self.place_new(id, &source.group(), now);

            false
        } else {
            let id = self.counter;
            self.counter += 1;

            self.infos.insert(id, AddrInfo::new(addr, time, *source));
            self.by_addr.insert(endpoint, id);
            self.place_new(id, &source.group(), now);

            log::debug!(
                "Added {} from {}: {} tried, {} new",
                endpoint,
                source,
                self.tried_count,
                self.new_count
            );
            true
        }
    }

    /// Mark an address as successfully connected to, promoting it to
    /// the tried population if it isn't there yet.
    fn good(&mut self, endpoint: &net::SocketAddr, now: LocalTime) {
        let id = match self.by_addr.get(endpoint) {
            Some(&id) => id,
            None => return,
        };
        let in_tried = {
            let info = self.infos.get_mut(&id).expect("indexed records must exist");

            info.last_success = Some(now);
            info.last_try = Some(now);
            info.time = now;
            info.attempts = 0;
            info.in_tried
        };
        if in_tried {
            return;
        }
        self.make_tried(id, now);

        log::debug!(
            "Moved {} to tried: {} tried, {} new",
            endpoint,
            self.tried_count,
            self.new_count
        );
    }

    /// Record a connection attempt.
    fn attempt(&mut self, endpoint: &net::SocketAddr, now: LocalTime) {
        if let Some(&id) = self.by_addr.get(endpoint) {
            let info = self.infos.get_mut(&id).expect("indexed records must exist");

            info.last_try = Some(now);
            info.attempts += 1;
        }
    }

    /// Note that the peer is currently connected, refreshing its
    /// advertised timestamp at most every twenty minutes.
    fn connected(&mut self, endpoint: &net::SocketAddr, now: LocalTime) {
        if let Some(&id) = self.by_addr.get(endpoint) {
            let info = self.infos.get_mut(&id).expect("indexed records must exist");

            if now - info.time > CONNECTED_REFRESH {
                info.time = now;
            }
        }
    }

    /// Choose an address to connect to. `new_bias` (0 to 100) sets how
    /// much the new population is favored over the tried one.
    fn select(&self, new_bias: u32, now: LocalTime) -> Option<Address> {
        if self.random.is_empty() {
            return None;
        }
        let bias = new_bias.min(100) as f64;
        let use_tried = if self.tried_count == 0 {
            false
        } else if self.new_count == 0 {
            true
        } else {
            let tried_weight = (100.0 - bias) * (self.tried_count as f64).sqrt();
            let new_weight = bias * (self.new_count as f64).sqrt();

            self.rng.f64() * (tried_weight + new_weight) < tried_weight
        };
        let buckets: Vec<usize> = if use_tried {
            (0..TRIED_BUCKET_COUNT)
                .filter(|&b| !self.tried[b].is_empty())
                .collect()
        } else {
            (0..NEW_BUCKET_COUNT)
                .filter(|&b| !self.new[b].is_empty())
                .collect()
        };
        debug_assert!(!buckets.is_empty());

        // Rejection-sample a uniformly drawn occupant by its quality,
        // settling for the last draw if the loop runs dry.
        let mut last = None;
        for _ in 0..SELECT_ROUNDS {
            let bucket = buckets[self.rng.usize(..buckets.len())];
            let id = if use_tried {
                let slots = &self.tried[bucket];
                slots[self.rng.usize(..slots.len())]
            } else {
                let members = &self.new[bucket];
                *members
                    .iter()
                    .nth(self.rng.usize(..members.len()))
                    .expect("member index is in range")
            };
            let info = &self.infos[&id];

            last = Some(info.addr.clone());
            if self.rng.f64() < info.chance(now) {
                break;
            }
        }
        last
    }

    /// Return a gossip sample: up to 23% of the table, capped at 2500,
    /// drawn uniformly by record and filtered of terrible entries.
    fn addresses(&mut self, now: LocalTime) -> Vec<Address> {
        let mut count = GETADDR_MAX_PCT * self.random.len() / 100;
        if count > GETADDR_MAX {
            count = GETADDR_MAX;
        }
        let mut addrs = Vec::with_capacity(count);

        // Partial Fisher-Yates shuffle over the shuffle vector.
        for n in 0..count {
            let pick = n + self.rng.usize(..self.random.len() - n);
            self.swap_random(n, pick);

            let info = &self.infos[&self.random[n]];
            if !info.is_terrible(now) {
                addrs.push(info.addr.clone());
            }
        }
        addrs
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Place a record into the new bucket derived from the given
    /// source group, evicting from the bucket if it is full. The
    /// record's first placement registers it in the new population.
    fn place_new(&mut self, id: u32, source_group: &[u8], now: LocalTime) {
        let endpoint = self.infos[&id].endpoint();
        let bucket = self.key.new_bucket(&endpoint, source_group);

        if self.new[bucket].contains(&id) {
            return;
        }
        if self.new[bucket].len() == NEW_BUCKET_SIZE {
            self.shrink_new(bucket, now);
        }
        self.new[bucket].insert(id);

        let position = self.random.len();
        let info = self.infos.get_mut(&id).expect("placed records must exist");

        info.ref_count += 1;
        if info.ref_count == 1 {
            info.random_pos = Some(position);
            self.random.push(id);
            self.new_count += 1;
        }
    }

    /// Make room in a full new bucket: evict a terrible member if one
    /// exists, otherwise a uniformly random one. A member losing its
    /// last bucket membership is destroyed.
    fn shrink_new(&mut self, bucket: usize, now: LocalTime) {
        let mut victim = None;
        for &id in self.new[bucket].iter() {
            if self.infos[&id].is_terrible(now) {
                victim = Some(id);
                break;
            }
        }
        let id = match victim {
            Some(id) => id,
            None => {
                let ix = self.rng.usize(..self.new[bucket].len());
                *self.new[bucket]
                    .iter()
                    .nth(ix)
                    .expect("member index is in range")
            }
        };
        self.remove_from_new_bucket(bucket, id);
    }

    fn remove_from_new_bucket(&mut self, bucket: usize, id: u32) {
        if !self.new[bucket].remove(&id) {
            return;
        }
        let info = self.infos.get_mut(&id).expect("bucket members must exist");
        info.ref_count -= 1;

        if info.ref_count == 0 {
            self.delete(id);
        }
    }

    /// Destroy a record that is in neither population. This is the
    /// only place where records are deleted; tried records can only be
    /// evicted back into the new tables, never deleted directly.
    fn delete(&mut self, id: u32) {
        let position = self.infos[&id]
            .random_pos
            .expect("live records have a shuffle position");

        self.swap_random(position, self.random.len() - 1);
        self.random.pop();

        let info = self.infos.remove(&id).expect("deleted records must exist");
        debug_assert!(!info.in_tried);
        debug_assert_eq!(info.ref_count, 0);

        self.by_addr.remove(&info.endpoint());
        self.new_count -= 1;
    }

    /// Swap two shuffle-vector slots, updating the records' remembered
    /// positions.
    fn swap_random(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.random.swap(a, b);

        let id_a = self.random[a];
        let id_b = self.random[b];

        self.infos
            .get_mut(&id_a)
            .expect("shuffled records must exist")
            .random_pos = Some(a);
        self.infos
            .get_mut(&id_b)
            .expect("shuffled records must exist")
            .random_pos = Some(b);
    }

    /// Move a record from the new tables to the tried tables. If the
    /// target tried bucket is full, the stalest of a few sampled
    /// occupants is evicted back into the new tables first.
    fn make_tried(&mut self, id: u32, now: LocalTime) {
        // Remove the entry from all new buckets.
        let mut removed = 0;
        for bucket in self.new.iter_mut() {
            if bucket.remove(&id) {
                removed += 1;
            }
        }
        debug_assert!(removed > 0);

        let endpoint = {
            let info = self.infos.get_mut(&id).expect("promoted records must exist");
            debug_assert_eq!(info.ref_count, removed);

            info.ref_count = 0;
            info.endpoint()
        };
        self.new_count -= 1;

        let bucket = self.key.tried_bucket(&endpoint);
        if self.tried[bucket].len() < TRIED_BUCKET_SIZE {
            self.tried[bucket].push(id);
            self.tried_count += 1;
            self.infos
                .get_mut(&id)
                .expect("promoted records must exist")
                .in_tried = true;
            return;
        }

        // The bucket is full; evict its stalest sampled occupant back
        // to the new tables and reuse the slot. The tried count is
        // unchanged, the new count grows by one.
        let position = self.select_tried(bucket);
        let victim_id = self.tried[bucket][position];
        let (victim_endpoint, victim_group) = {
            let victim = self
                .infos
                .get_mut(&victim_id)
                .expect("tried records must exist");

            victim.in_tried = false;
            victim.ref_count = 1;

            (victim.endpoint(), victim.source.group())
        };
        let new_bucket = self.key.new_bucket(&victim_endpoint, &victim_group);
        if self.new[new_bucket].len() == NEW_BUCKET_SIZE {
            self.shrink_new(new_bucket, now);
        }
        self.new[new_bucket].insert(victim_id);
        self.new_count += 1;

        self.tried[bucket][position] = id;
        self.infos
            .get_mut(&id)
            .expect("promoted records must exist")
            .in_tried = true;

        log::debug!("Evicted {} from tried back to new", victim_endpoint);
    }

    /// Pick the position in a tried bucket to replace: of a few
    /// positions sampled with replacement, the one with the oldest
    /// last success, ties broken by oldest last try.
    fn select_tried(&self, bucket: usize) -> usize {
        let slots = &self.tried[bucket];
        let mut best: Option<(usize, LocalTime, LocalTime)> = None;

        for _ in 0..TRIED_INSPECT_ON_EVICT.min(slots.len()) {
            let position = self.rng.usize(..slots.len());
            let info = &self.infos[&slots[position]];
            let success = info.last_success.unwrap_or_default();
            let tried = info.last_try.unwrap_or_default();

            let better = match best {
                None => true,
                Some((_, s, t)) => success < s || (success == s && tried < t),
            };
            if better {
                best = Some((position, success, tried));
            }
        }
        best.expect("tried bucket is never empty here").0
    }

    ////////////////////////////////////////////////////////////////////////////

    /// Verify every table invariant. Expensive; run around every
    /// public operation when the `check` feature is enabled.
    fn consistency_check(&self) -> Result<(), &'static str> {
        use std::collections::HashMap as Counter;

        let mut new_members: Counter<u32, usize> = Counter::new();
        for bucket in self.new.iter() {
            if bucket.len() > NEW_BUCKET_SIZE {
                return Err("oversized new bucket");
            }
            for id in bucket.iter() {
                if !self.infos.contains_key(id) {
                    return Err("dangling id in a new bucket");
                }
                *new_members.entry(*id).or_default() += 1;
            }
        }
        let mut tried_members: Counter<u32, usize> = Counter::new();
        for bucket in self.tried.iter() {
            if bucket.len() > TRIED_BUCKET_SIZE {
                return Err("oversized tried bucket");
            }
            for id in bucket.iter() {
                if !self.infos.contains_key(id) {
                    return Err("dangling id in a tried bucket");
                }
                *tried_members.entry(*id).or_default() += 1;
            }
        }

        if self.by_addr.len() != self.infos.len() {
            return Err("endpoint index and record store differ in size");
        }
        if self.random.len() != self.infos.len() {
            return Err("shuffle vector and record store differ in size");
        }

        let mut new_count = 0;
        let mut tried_count = 0;

        for (id, info) in self.infos.iter() {
            if self.by_addr.get(&info.endpoint()) != Some(id) {
                return Err("endpoint index does not map back to the record");
            }
            match info.random_pos {
                Some(position) if self.random.get(position) == Some(id) => {}
                _ => return Err("shuffle position does not hold the record"),
            }
            let in_new = new_members.get(id).copied().unwrap_or(0);
            let in_tried = tried_members.get(id).copied().unwrap_or(0);

            if info.in_tried {
                if info.ref_count != 0 {
                    return Err("tried record with new-bucket references");
                }
                if in_new != 0 {
                    return Err("tried record found in a new bucket");
                }
                if in_tried != 1 {
                    return Err("tried record not in exactly one tried bucket");
                }
                tried_count += 1;
            } else {
                if info.ref_count == 0 || info.ref_count > NEW_BUCKETS_PER_ADDRESS {
                    return Err("new record with out-of-range reference count");
                }
                if in_new != info.ref_count as usize {
                    return Err("reference count does not match bucket memberships");
                }
                if in_tried != 0 {
                    return Err("new record found in a tried bucket");
                }
                new_count += 1;
            }
        }
        if new_count != self.new_count as usize {
            return Err("new population miscounted");
        }
        if tried_count != self.tried_count as usize {
            return Err("tried population miscounted");
        }
        Ok(())
    }

    #[cfg(feature = "check")]
    fn check(&self) {
        if let Err(violation) = self.consistency_check() {
            panic!("address table consistency check failed: {}", violation);
        }
    }

    #[cfg(not(feature = "check"))]
    fn check(&self) {}
}

impl Encodable for Table {
    /// Serialized format:
    ///  * version byte (0)
    ///  * secret key
    ///  * new count, tried count
    ///  * number of new buckets
    ///  * all new-population records, in id order
    ///  * all tried-population records, in id order
    ///  * for each new bucket: entry count, then the entries as dense
    ///    indices into the new-record sequence
    ///
    /// The tried buckets, the endpoint index and the shuffle vector
    /// are never encoded; they are reconstructed on load. The encoded
    /// new-bucket memberships are only replayed when the bucket count
    /// still matches; otherwise they too are reconstructed.
    fn consensus_encode<S: io::Write>(&self, mut s: S) -> Result<usize, io::Error> {
        let mut len = 0u8.consensus_encode(&mut s)?;

        len += self.key.consensus_encode(&mut s)?;
        len += self.new_count.consensus_encode(&mut s)?;
        len += self.tried_count.consensus_encode(&mut s)?;
        len += (NEW_BUCKET_COUNT as u32).consensus_encode(&mut s)?;

        let mut new_ids: Vec<u32> = Vec::with_capacity(self.new_count as usize);
        let mut tried_ids: Vec<u32> = Vec::with_capacity(self.tried_count as usize);

        for (id, info) in self.infos.iter() {
            if info.ref_count > 0 {
                new_ids.push(*id);
            } else if info.in_tried {
                tried_ids.push(*id);
            }
        }
        new_ids.sort_unstable();
        tried_ids.sort_unstable();

        debug_assert_eq!(new_ids.len(), self.new_count as usize);
        debug_assert_eq!(tried_ids.len(), self.tried_count as usize);

        let dense: std::collections::HashMap<u32, u32> = new_ids
            .iter()
            .enumerate()
            .map(|(ix, id)| (*id, ix as u32))
            .collect();

        for id in new_ids.iter().chain(tried_ids.iter()) {
            len += self.infos[id].consensus_encode(&mut s)?;
        }
        for bucket in self.new.iter() {
            let mut members: Vec<u32> = bucket.iter().map(|id| dense[id]).collect();
            members.sort_unstable();

            len += (members.len() as u32).consensus_encode(&mut s)?;
            for ix in members {
                len += ix.consensus_encode(&mut s)?;
            }
        }
        Ok(len)
    }
}

impl Decodable for Table {
    fn consensus_decode<D: io::Read>(mut d: D) -> Result<Self, encode::Error> {
        let version = u8::consensus_decode(&mut d)?;
        if version != 0 {
            return Err(encode::Error::ParseFailed(
                "unsupported address table version",
            ));
        }
        let key = Key::consensus_decode(&mut d)?;
        let new_count = u32::consensus_decode(&mut d)?;
        let tried_count = u32::consensus_decode(&mut d)?;
        let buckets = u32::consensus_decode(&mut d)?;

        if new_count as usize > NEW_BUCKET_COUNT * NEW_BUCKET_SIZE {
            return Err(encode::Error::ParseFailed("new population too large"));
        }
        if tried_count as usize > TRIED_BUCKET_COUNT * TRIED_BUCKET_SIZE {
            return Err(encode::Error::ParseFailed("tried population too large"));
        }
        if buckets as usize > NEW_BUCKET_COUNT * NEW_BUCKET_SIZE {
            return Err(encode::Error::ParseFailed("bucket count out of range"));
        }

        let mut table = Table::new(key, fastrand::Rng::new());

        // New-population records get dense load-time ids.
        for id in 0..new_count {
            let mut info = AddrInfo::consensus_decode(&mut d)?;
            let endpoint = info.endpoint();

            if table.by_addr.contains_key(&endpoint) {
                return Err(encode::Error::ParseFailed("duplicate endpoint"));
            }
            info.random_pos = Some(table.random.len());
            table.random.push(id);
            table.by_addr.insert(endpoint, id);
            table.infos.insert(id, info);
        }
        table.counter = new_count;

        // Tried records re-hash into tried buckets under the current
        // key; records whose target bucket is full are lost. This is
        // the only lossy load path.
        let mut lost = 0u32;
        for _ in 0..tried_count {
            let mut info = AddrInfo::consensus_decode(&mut d)?;
            let endpoint = info.endpoint();

            if table.by_addr.contains_key(&endpoint) {
                return Err(encode::Error::ParseFailed("duplicate endpoint"));
            }
            let bucket = table.key.tried_bucket(&endpoint);
            if table.tried[bucket].len() < TRIED_BUCKET_SIZE {
                let id = table.counter;
                table.counter += 1;

                info.in_tried = true;
                info.random_pos = Some(table.random.len());
                table.random.push(id);
                table.tried[bucket].push(id);
                table.by_addr.insert(endpoint, id);
                table.infos.insert(id, info);
                table.tried_count += 1;
            } else {
                lost += 1;
            }
        }
        if lost > 0 {
            log::debug!("{} tried address(es) lost to bucket re-hashing", lost);
        }

        // New-bucket memberships are replayed verbatim when the bucket
        // count matches the current parameters, and recomputed from
        // each record's source otherwise.
        let replay = buckets as usize == NEW_BUCKET_COUNT;
        for bucket in 0..buckets as usize {
            let size = u32::consensus_decode(&mut d)?;
            if size as u64 > new_count as u64 * NEW_BUCKETS_PER_ADDRESS as u64 {
                return Err(encode::Error::ParseFailed("oversized bucket encoding"));
            }
            for _ in 0..size {
                let ix = u32::consensus_decode(&mut d)?;
                if ix >= new_count {
                    return Err(encode::Error::ParseFailed("bucket index out of range"));
                }
                if replay {
                    let info = table.infos.get_mut(&ix).expect("record was just created");
                    if info.ref_count < NEW_BUCKETS_PER_ADDRESS
                        && table.new[bucket].len() < NEW_BUCKET_SIZE
                        && table.new[bucket].insert(ix)
                    {
                        info.ref_count += 1;
                        if info.ref_count == 1 {
                            table.new_count += 1;
                        }
                    }
                }
            }
        }

        if replay {
            for id in 0..new_count {
                if table.infos[&id].ref_count == 0 {
                    return Err(encode::Error::ParseFailed(
                        "new record without a bucket placement",
                    ));
                }
            }
            debug_assert_eq!(table.new_count, new_count);
        } else {
            for id in 0..new_count {
                // Records may be evicted by earlier placements.
                if !table.infos.contains_key(&id) {
                    continue;
                }
                let (endpoint, group) = {
                    let info = &table.infos[&id];
                    (info.endpoint(), info.source.group())
                };
                let bucket = table.key.new_bucket(&endpoint, &group);
                if table.new[bucket].len() == NEW_BUCKET_SIZE {
                    let ix = table.rng.usize(..table.new[bucket].len());
                    let victim = *table.new[bucket]
                        .iter()
                        .nth(ix)
                        .expect("member index is in range");

                    table.remove_from_new_bucket(bucket, victim);
                }
                table.new[bucket].insert(id);
                table
                    .infos
                    .get_mut(&id)
                    .expect("record was just created")
                    .ref_count = 1;
                table.new_count += 1;
            }
        }
        Ok(table)
    }
}

/// Manages peer network addresses.
///
/// A thin, thread-safe shell around the address [`Table`]: every
/// public operation takes the component lock for its whole duration,
/// and (with the `check` feature) verifies the table invariants on
/// entry and exit. Persistence snapshots the table under the lock but
/// performs file I/O outside of it.
#[derive(Debug)]
pub struct AddressManager<C> {
    inner: Mutex<Table>,
    clock: C,
}

impl<C: Clock> AddressManager<C> {
    /// Create a new, empty address manager with a freshly generated
    /// placement key.
    pub fn new(rng: fastrand::Rng, clock: C) -> Self {
        Self::with_key(Key::generate(), rng, clock)
    }

    /// Create a new, empty address manager with the given placement
    /// key.
    pub fn with_key(key: Key, rng: fastrand::Rng, clock: C) -> Self {
        Self {
            inner: Mutex::new(Table::new(key, rng)),
            clock,
        }
    }

    /// Add an address learned from `source`. The penalty is deducted
    /// from the advertised timestamp for addresses that came in
    /// through a side channel rather than gossip.
    ///
    /// Returns `true` iff the address was previously unknown.
    pub fn add(
        &self,
        addr: Address,
        addr_time: LocalTime,
        source: Source,
        penalty: LocalDuration,
    ) -> bool {
        let now = self.clock.local_time();
        let mut table = self.inner.lock();

        table.check();
        let added = table.insert(addr, addr_time, &source, penalty, now);
        table.check();

        added
    }

    /// Add a batch of addresses, as they arrive in an `addr` message.
    /// Returns `true` iff any of them was previously unknown.
    pub fn add_many(
        &self,
        addrs: impl IntoIterator<Item = (LocalTime, Address)>,
        source: Source,
        penalty: LocalDuration,
    ) -> bool {
        let now = self.clock.local_time();
        let mut table = self.inner.lock();
        let mut added = 0;

        table.check();
        for (addr_time, addr) in addrs {
            if table.insert(addr, addr_time, &source, penalty, now) {
                added += 1;
            }
        }
        table.check();

        if added > 0 {
            log::debug!("Added {} address(es) from {}", added, source);
        }
        added > 0
    }

    /// Mark an address as successfully connected to.
    pub fn good(&self, addr: &net::SocketAddr) {
        let now = self.clock.local_time();
        let mut table = self.inner.lock();

        table.check();
        table.good(addr, now);
        table.check();
    }

    /// Record an attempt to connect to an address.
    pub fn attempt(&self, addr: &net::SocketAddr) {
        let now = self.clock.local_time();
        let mut table = self.inner.lock();

        table.check();
        table.attempt(addr, now);
        table.check();
    }

    /// Note that a peer is currently connected.
    pub fn connected(&self, addr: &net::SocketAddr) {
        let now = self.clock.local_time();
        let mut table = self.inner.lock();

        table.check();
        table.connected(addr, now);
        table.check();
    }

    /// Choose an address to connect to, biased towards quality but
    /// random enough to keep exploring. `new_bias` (0 to 100) sets how
    /// much the new population is favored over the tried one.
    pub fn select(&self, new_bias: u32) -> Option<Address> {
        let now = self.clock.local_time();
        let table = self.inner.lock();

        table.check();
        table.select(new_bias, now)
    }

    /// Return a random gossip sample of the table.
    pub fn addresses(&self) -> Vec<Address> {
        let now = self.clock.local_time();
        let mut table = self.inner.lock();

        table.check();
        let addrs = table.addresses(now);
        table.check();

        addrs
    }

    /// The number of addresses known, across both populations.
    pub fn len(&self) -> usize {
        self.inner.lock().random.len()
    }

    /// Whether any addresses are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the table to the given path.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let payload = {
            let table = self.inner.lock();

            table.check();
            encode::serialize(&*table)
        };
        store::write(path, &payload)
    }

    /// Load a previously persisted table.
    pub fn load<P: AsRef<Path>>(path: P, rng: fastrand::Rng, clock: C) -> Result<Self, Error> {
        let payload = store::read(path)?;
        let mut table: Table = encode::deserialize(&payload)?;

        table.rng = rng;
        table.check();

        Ok(Self {
            inner: Mutex::new(table),
            clock,
        })
    }

    /// Load a previously persisted table, falling back to an empty
    /// manager with a freshly generated key if the file is missing,
    /// corrupt or unreadable.
    pub fn restore<P: AsRef<Path>>(path: P, rng: fastrand::Rng, clock: C) -> Self {
        let path = path.as_ref();

        match Self::load(path, rng.clone(), clock.clone()) {
            Ok(manager) => manager,
            Err(err) => {
                log::warn!(
                    "Failed to load address table from {:?}: {}; starting empty",
                    path,
                    err
                );
                Self::new(rng, clock)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::RefClock;

    use bitcoin::network::constants::ServiceFlags;
    use quickcheck_macros::quickcheck;

    fn network_time() -> LocalTime {
        LocalTime::from_secs(1_600_000_000)
    }

    fn manager() -> (AddressManager<RefClock>, RefClock) {
        let clock = RefClock::from(network_time());
        let mgr = AddressManager::with_key(
            Key::from_bytes([7; 32]),
            fastrand::Rng::with_seed(42),
            clock.clone(),
        );
        (mgr, clock)
    }

    fn addr(octets: [u8; 4]) -> Address {
        Address::new(
            &net::SocketAddr::from((octets, 8333)),
            ServiceFlags::NETWORK,
        )
    }

    /// Routable addresses, distinct for every `n`, spanning many /16s.
    fn nth_addr(n: u32) -> Address {
        addr([
            60 + (n % 40) as u8,
            ((n / 40) % 250) as u8,
            (n / 10_000) as u8,
            9,
        ])
    }

    fn no_penalty() -> LocalDuration {
        LocalDuration::default()
    }

    #[test]
    fn test_add() {
        let (mgr, _clock) = manager();
        let now = network_time();

        assert!(mgr.add(addr([183, 8, 55, 2]), now, Source::Dns, no_penalty()));
        assert!(mgr.add(addr([211, 48, 99, 4]), now, Source::Dns, no_penalty()));
        assert!(
            !mgr.add(addr([183, 8, 55, 2]), now, Source::Dns, no_penalty()),
            "already known addresses are not new"
        );
        assert_eq!(mgr.len(), 2);

        // Non-routable and local addresses are rejected.
        assert!(!mgr.add(addr([127, 0, 0, 1]), now, Source::Dns, no_penalty()));
        assert!(!mgr.add(addr([10, 0, 4, 4]), now, Source::Dns, no_penalty()));
        assert!(!mgr.add(addr([0, 1, 2, 3]), now, Source::Dns, no_penalty()));
        assert_eq!(mgr.len(), 2);

        mgr.inner.lock().consistency_check().unwrap();
    }

    #[test]
    fn test_add_refreshes_known_records() {
        let (mgr, _clock) = manager();
        let now = network_time();
        let endpoint: net::SocketAddr = ([88, 44, 12, 1], 8333).into();

        mgr.add(
            Address::new(&endpoint, ServiceFlags::NETWORK),
            now - LocalDuration::from_days(2),
            Source::Dns,
            no_penalty(),
        );
        mgr.add(
            Address::new(&endpoint, ServiceFlags::WITNESS),
            now,
            Source::Dns,
            no_penalty(),
        );

        let table = mgr.inner.lock();
        let id = table.by_addr[&endpoint];
        let info = &table.infos[&id];

        assert_eq!(info.time, now, "newer advertised timestamps refresh");
        assert!(info.addr.services.has(ServiceFlags::NETWORK));
        assert!(info.addr.services.has(ServiceFlags::WITNESS), "services accumulate");
    }

    #[test]
    fn test_add_clamps_absurd_timestamps() {
        let (mgr, _clock) = manager();
        let now = network_time();
        let future: net::SocketAddr = ([88, 44, 12, 1], 8333).into();
        let ancient: net::SocketAddr = ([88, 44, 12, 2], 8333).into();

        mgr.add(
            Address::new(&future, ServiceFlags::NONE),
            now + LocalDuration::from_days(1),
            Source::Dns,
            no_penalty(),
        );
        mgr.add(
            Address::new(&ancient, ServiceFlags::NONE),
            LocalTime::from_secs(1),
            Source::Dns,
            no_penalty(),
        );

        let table = mgr.inner.lock();
        for endpoint in [&future, &ancient] {
            let info = &table.infos[&table.by_addr[endpoint]];
            assert_eq!(info.time, now - LocalDuration::from_days(5));
        }
    }

    #[test]
    fn test_ref_count_is_capped() {
        let (mgr, _clock) = manager();
        let now = network_time();
        let target = addr([77, 66, 55, 44]);

        // The same address advertised by two hundred different peers.
        for i in 0..200u8 {
            mgr.add(
                target.clone(),
                now,
                Source::Peer(([21, i, 1, 1], 8333).into()),
                no_penalty(),
            );
        }
        assert_eq!(mgr.len(), 1);

        let endpoint: net::SocketAddr = ([77, 66, 55, 44], 8333).into();
        let table = mgr.inner.lock();
        let info = &table.infos[&table.by_addr[&endpoint]];

        assert!(info.ref_count >= 1 && info.ref_count <= NEW_BUCKETS_PER_ADDRESS);
        table.consistency_check().unwrap();
    }

    #[test]
    fn test_single_source_bucket_spread() {
        let (mgr, _clock) = manager();
        let now = network_time();
        let source = Source::Peer(([99, 99, 2, 1], 8333).into());

        // Three hundred addresses, all learned from one /16.
        for i in 0..300u32 {
            let added = mgr.add(
                addr([20 + (i % 60) as u8, 1 + (i / 60) as u8, 9, 9]),
                now,
                source,
                no_penalty(),
            );
            assert!(added);
        }
        assert_eq!(mgr.len(), 300);

        let table = mgr.inner.lock();
        let populated = table.new.iter().filter(|b| !b.is_empty()).count();

        assert!(
            populated <= crate::hash::NEW_BUCKETS_PER_SOURCE_GROUP as usize,
            "one source group may populate at most 32 new buckets, got {}",
            populated
        );
        table.consistency_check().unwrap();
    }

    #[test]
    fn test_new_bucket_eviction_prefers_terrible() {
        let (mgr, _clock) = manager();
        let now = network_time();
        let source = Source::Peer(([55, 70, 1, 1], 8333).into());
        let mut next = 0u32;

        let mut batch = |next: &mut u32| {
            let addrs: Vec<_> = (0..100)
                .map(|_| {
                    let n = *next;
                    *next += 1;
                    (now, nth_addr(n))
                })
                .collect();
            mgr.add_many(addrs, source, no_penalty());
        };

        // Fill until some bucket is at capacity.
        let full = loop {
            batch(&mut next);

            let table = mgr.inner.lock();
            if let Some(b) = table.new.iter().position(|b| b.len() == NEW_BUCKET_SIZE) {
                break b;
            }
            assert!(next < 30_000, "some bucket should reach capacity");
        };

        // Mark one occupant of the full bucket as having a try in
        // flight, which makes it the preferred eviction victim.
        let (victim_id, victim_endpoint) = {
            let table = mgr.inner.lock();
            let id = *table.new[full].iter().next().expect("the bucket is full");

            (id, table.infos[&id].endpoint())
        };
        mgr.attempt(&victim_endpoint);

        // Keep inserting until the full bucket takes another entry.
        let mut evicted = false;
        for _ in 0..100 {
            batch(&mut next);

            let table = mgr.inner.lock();
            assert!(table.new[full].len() <= NEW_BUCKET_SIZE);
            if !table.new[full].contains(&victim_id) {
                evicted = true;
                break;
            }
        }
        assert!(evicted, "the terrible occupant goes first");

        let table = mgr.inner.lock();
        assert!(
            !table.infos.contains_key(&victim_id),
            "its last membership gone, the record is destroyed"
        );
        assert!(!table.by_addr.contains_key(&victim_endpoint));
        assert!(!table.random.contains(&victim_id));
        table.consistency_check().unwrap();
    }

    #[test]
    fn test_good_promotes_to_tried() {
        let (mgr, clock) = manager();
        let now = network_time();
        let mut endpoints = Vec::new();

        for i in 0..100u32 {
            let a = nth_addr(i);
            endpoints.push(a.socket_addr().unwrap());
            mgr.add(a, now, Source::Dns, no_penalty());
        }
        for endpoint in endpoints.iter().take(10) {
            clock.elapse(LocalDuration::from_secs(1));
            mgr.good(endpoint);
        }

        let table = mgr.inner.lock();
        assert_eq!(table.tried_count, 10);
        assert_eq!(table.new_count, 90);

        for endpoint in endpoints.iter().take(10) {
            let info = &table.infos[&table.by_addr[endpoint]];

            assert!(info.in_tried);
            assert_eq!(info.ref_count, 0);
            assert!(info.last_success.is_some());
        }
        table.consistency_check().unwrap();
    }

    #[test]
    fn test_good_is_idempotent() {
        let (mgr, _clock) = manager();
        let now = network_time();
        let endpoint: net::SocketAddr = ([88, 44, 12, 1], 8333).into();

        mgr.add(
            Address::new(&endpoint, ServiceFlags::NONE),
            now,
            Source::Dns,
            no_penalty(),
        );
        mgr.good(&endpoint);

        let snapshot = {
            let table = mgr.inner.lock();
            assert_eq!(table.tried_count, 1);
            assert_eq!(table.new_count, 0);

            table.infos[&table.by_addr[&endpoint]].clone()
        };

        // A second success at the same time changes nothing.
        mgr.good(&endpoint);

        let table = mgr.inner.lock();
        assert_eq!(table.tried_count, 1);
        assert_eq!(table.infos[&table.by_addr[&endpoint]], snapshot);
        table.consistency_check().unwrap();
    }

    #[test]
    fn test_good_on_unknown_is_a_noop() {
        let (mgr, _clock) = manager();

        mgr.good(&([9, 9, 9, 9], 8333).into());
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_tried_bucket_eviction_demotes_stalest() {
        let (mgr, clock) = manager();

        // Six hundred confirmed peers out of a single /16: their tried
        // buckets can hold at most 8 * 64 entries, so overflow is
        // guaranteed and the overflow is demoted, not destroyed.
        for i in 0..600u32 {
            let a = addr([120, 55, (i / 250) as u8, (i % 250) as u8]);
            let endpoint = a.socket_addr().unwrap();
            let source = Source::Peer(([30 + (i % 100) as u8, (i / 100) as u8, 1, 1], 8333).into());

            clock.elapse(LocalDuration::from_secs(1));
            mgr.add(a, clock.local_time(), source, no_penalty());
            mgr.good(&endpoint);
        }

        let table = mgr.inner.lock();
        let capacity =
            crate::hash::TRIED_BUCKETS_PER_GROUP as usize * TRIED_BUCKET_SIZE;

        assert_eq!(table.random.len(), 600, "demotion never destroys records");
        assert_eq!(table.tried_count as usize + table.new_count as usize, 600);
        assert!(table.tried_count as usize <= capacity);
        assert!(
            table.new_count as usize >= 600 - capacity,
            "everything past tried capacity is demoted"
        );
        assert!(
            table.tried.iter().any(|b| b.len() == TRIED_BUCKET_SIZE),
            "overflow implies a full bucket"
        );

        for info in table.infos.values() {
            if !info.in_tried {
                assert!(
                    info.last_success.is_some(),
                    "demoted records keep their success history"
                );
                assert_eq!(info.ref_count, 1);
            }
        }
        table.consistency_check().unwrap();
    }

    #[test]
    fn test_select_empty() {
        let (mgr, _clock) = manager();

        assert!(mgr.select(50).is_none());
    }

    #[test]
    fn test_select_population_bias() {
        let (mgr, _clock) = manager();
        let now = network_time();
        let mut tried = std::collections::HashSet::new();

        for i in 0..50u32 {
            let a = nth_addr(i);
            let endpoint = a.socket_addr().unwrap();

            mgr.add(a, now, Source::Dns, no_penalty());
            if i % 2 == 0 {
                mgr.good(&endpoint);
                tried.insert(endpoint);
            }
        }

        // Bias 0 always picks from tried, bias 100 always from new.
        for _ in 0..10 {
            let picked = mgr.select(0).unwrap().socket_addr().unwrap();
            assert!(tried.contains(&picked));

            let picked = mgr.select(100).unwrap().socket_addr().unwrap();
            assert!(!tried.contains(&picked));
        }
    }

    #[test]
    fn test_select_falls_back_to_nonempty_population() {
        let (mgr, _clock) = manager();
        let now = network_time();
        let endpoint: net::SocketAddr = ([88, 44, 12, 1], 8333).into();

        mgr.add(
            Address::new(&endpoint, ServiceFlags::NONE),
            now,
            Source::Dns,
            no_penalty(),
        );

        // Only the new population exists; a tried-favoring bias must
        // still yield something.
        assert!(mgr.select(0).is_some());

        mgr.good(&endpoint);

        // And vice versa.
        assert!(mgr.select(100).is_some());
    }

    #[test]
    fn test_addresses_sample() {
        let (mgr, clock) = manager();
        let now = network_time();

        for i in 0..100u32 {
            mgr.add(nth_addr(i), now, Source::Dns, no_penalty());
        }

        let sample = mgr.addresses();
        assert_eq!(sample.len(), 23, "23% of the table");

        let distinct: std::collections::HashSet<net::SocketAddr> = sample
            .iter()
            .map(|a| a.socket_addr().unwrap())
            .collect();
        assert_eq!(distinct.len(), 23, "no duplicates");

        // A month later every record is stale, and stale records are
        // not gossiped.
        clock.elapse(LocalDuration::from_days(31));
        assert!(mgr.addresses().is_empty());
    }

    #[test]
    fn test_add_many_reports_any_new() {
        let (mgr, _clock) = manager();
        let now = network_time();

        assert!(mgr.add_many(
            vec![(now, nth_addr(0)), (now, nth_addr(1))],
            Source::Dns,
            no_penalty()
        ));
        assert!(mgr.add_many(
            vec![(now, nth_addr(0)), (now, nth_addr(2))],
            Source::Dns,
            no_penalty()
        ));
        assert!(
            !mgr.add_many(
                vec![(now, nth_addr(1)), (now, nth_addr(2))],
                Source::Dns,
                no_penalty()
            ),
            "no new address in the batch"
        );
    }

    #[quickcheck]
    fn prop_operations_maintain_invariants(seed: u64, script: Vec<(u8, u8, u8)>) -> bool {
        let clock = RefClock::from(network_time());
        let mgr = AddressManager::with_key(
            Key::from_bytes([3; 32]),
            fastrand::Rng::with_seed(seed),
            clock.clone(),
        );
        let mut known: Vec<net::SocketAddr> = Vec::new();

        for (op, a, b) in script {
            match op % 6 {
                0 | 1 => {
                    let endpoint = net::SocketAddr::from(([32 + a % 64, b, a ^ b, 1], 8333));
                    let added = mgr.add(
                        Address::new(&endpoint, ServiceFlags::NONE),
                        clock.local_time(),
                        Source::Peer(([44, b, 1, 1], 9333).into()),
                        no_penalty(),
                    );
                    if added {
                        known.push(endpoint);
                    }
                }
                2 if !known.is_empty() => mgr.good(&known[a as usize % known.len()]),
                3 if !known.is_empty() => mgr.attempt(&known[a as usize % known.len()]),
                4 if !known.is_empty() => mgr.connected(&known[a as usize % known.len()]),
                5 => {
                    let _ = mgr.select(b as u32 % 101);
                    clock.elapse(LocalDuration::from_secs(a as u64));
                }
                _ => {}
            }
        }
        let ok = mgr.inner.lock().consistency_check().is_ok();
        ok
    }

    #[test]
    fn test_encoding_roundtrip() {
        let (mgr, clock) = manager();

        for i in 0..80u32 {
            let a = nth_addr(i);
            let endpoint = a.socket_addr().unwrap();
            let source = Source::Peer(([25 + (i % 8) as u8, 3, 2, 1], 8333).into());

            mgr.add(a, clock.local_time(), source, no_penalty());
            if i % 4 == 0 {
                clock.elapse(LocalDuration::from_secs(30));
                mgr.good(&endpoint);
            } else if i % 7 == 0 {
                mgr.attempt(&endpoint);
            }
        }

        let bytes = encode::serialize(&*mgr.inner.lock());
        let decoded: Table = encode::deserialize(&bytes).unwrap();

        decoded.consistency_check().unwrap();
        {
            let original = mgr.inner.lock();

            assert_eq!(decoded.key, original.key);
            assert_eq!(decoded.new_count, original.new_count);
            assert_eq!(decoded.tried_count, original.tried_count);
            assert_eq!(decoded.random.len(), original.random.len());

            let endpoints = |t: &Table| -> std::collections::HashSet<net::SocketAddr> {
                t.by_addr.keys().copied().collect()
            };
            assert_eq!(endpoints(&decoded), endpoints(&original));
        }
        assert_eq!(
            encode::serialize(&decoded),
            bytes,
            "re-encoding is byte-identical while parameters are unchanged"
        );
    }

    #[test]
    fn test_decoding_rejects_bad_streams() {
        let (mgr, _clock) = manager();
        let now = network_time();

        for i in 0..20u32 {
            mgr.add(nth_addr(i), now, Source::Dns, no_penalty());
        }
        let bytes = encode::serialize(&*mgr.inner.lock());

        // Unknown version byte.
        let mut bad = bytes.clone();
        bad[0] = 1;
        assert!(encode::deserialize::<Table>(&bad).is_err());

        // Truncation.
        assert!(encode::deserialize::<Table>(&bytes[..bytes.len() - 3]).is_err());

        // Trailing garbage.
        let mut bad = bytes;
        bad.push(0);
        assert!(encode::deserialize::<Table>(&bad).is_err());
    }

    #[test]
    fn test_bucket_parameter_change_recomputes_membership() {
        let key = Key::from_bytes([9; 32]);
        let now = network_time();
        let records: Vec<AddrInfo> = (0..3u32)
            .map(|i| AddrInfo::new(nth_addr(i), now, Source::Dns))
            .collect();

        // A stream written under a 64-new-bucket parameterization.
        let mut payload = Vec::new();
        0u8.consensus_encode(&mut payload).unwrap();
        key.consensus_encode(&mut payload).unwrap();
        3u32.consensus_encode(&mut payload).unwrap(); // new
        0u32.consensus_encode(&mut payload).unwrap(); // tried
        64u32.consensus_encode(&mut payload).unwrap(); // bucket count
        for info in records.iter() {
            info.consensus_encode(&mut payload).unwrap();
        }
        3u32.consensus_encode(&mut payload).unwrap();
        for ix in 0..3u32 {
            ix.consensus_encode(&mut payload).unwrap();
        }
        for _ in 1..64 {
            0u32.consensus_encode(&mut payload).unwrap();
        }

        let table: Table = encode::deserialize(&payload).unwrap();

        table.consistency_check().unwrap();
        assert_eq!(table.new_count, 3);
        assert_eq!(table.tried_count, 0);

        // Memberships were recomputed from each record's source under
        // the current parameters.
        for (id, info) in records.iter().enumerate() {
            let bucket = key.new_bucket(&info.endpoint(), &info.source.group());
            assert!(table.new[bucket].contains(&(id as u32)));
        }
    }

    #[test]
    fn test_corrupted_file_restores_empty() {
        let path = std::env::temp_dir().join(format!("addrman_{}.dat", std::process::id()));
        let (mgr, clock) = manager();
        let now = network_time();

        // A large table, batched per source.
        for batch in 0..10u32 {
            let addrs: Vec<_> = (0..1000u32)
                .map(|i| (now, nth_addr(batch * 1000 + i)))
                .collect();
            mgr.add_many(
                addrs,
                Source::Peer(([29, batch as u8, 1, 1], 8333).into()),
                no_penalty(),
            );
        }
        assert!(mgr.len() > 9000);

        mgr.save(&path).unwrap();

        let reloaded =
            AddressManager::load(&path, fastrand::Rng::with_seed(1), clock.clone()).unwrap();
        assert_eq!(reloaded.len(), mgr.len());
        reloaded.inner.lock().consistency_check().unwrap();

        // One flipped byte rejects the whole file...
        let mut data = std::fs::read(&path).unwrap();
        let mid = data.len() / 2;
        data[mid] ^= 0x04;
        std::fs::write(&path, &data).unwrap();

        assert!(
            AddressManager::<RefClock>::load(&path, fastrand::Rng::with_seed(1), clock.clone())
                .is_err()
        );

        // ...and restoring from it yields an empty manager with a
        // fresh secret key.
        let fresh = AddressManager::restore(&path, fastrand::Rng::with_seed(1), clock);
        assert!(fresh.is_empty());
        assert_ne!(fresh.inner.lock().key, mgr.inner.lock().key);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_restore_missing_file_starts_empty() {
        let path = std::env::temp_dir().join(format!("addrman_missing_{}.dat", std::process::id()));
        let clock = RefClock::from(network_time());

        let mgr = AddressManager::restore(&path, fastrand::Rng::with_seed(5), clock);
        assert!(mgr.is_empty());
    }
}
