//!
//! The peer sightings tracker.
//!
//! A rolling popularity counter kept alongside the address manager:
//! for every endpoint, how often it was seen alive in each of the last
//! 56 six-hour windows, summed into a single score. The tracker feeds
//! a second, popularity-weighted way of picking peers, and a static
//! allow-list of seed endpoints short-circuits scoring with an
//! effectively infinite value.
use std::io;
use std::net;
use std::path::Path;

use bitcoin::consensus::encode::{self, Decodable, Encodable};

use parking_lot::Mutex;

use crate::collections;
use crate::error::Error;
use crate::peer::{decode_socket_addr, encode_socket_addr};
use crate::store;
use crate::time::{Clock, LocalDuration, LocalTime};

/// Length of one sighting window.
pub const STATS_WINDOW: LocalDuration = LocalDuration::from_secs(6 * 60 * 60);
/// Number of windows kept per endpoint; two weeks' worth.
pub const STATS_WINDOWS: usize = 56;
/// Maximum number of entries persisted.
pub const STATS_MAX: usize = 60_000;
/// Interval at which the host probes peer liveness. Bounds how much a
/// single window can count.
pub const CHECK_INTERVAL: LocalDuration = LocalDuration::from_secs(321);
/// Score reported for allow-listed seed endpoints.
pub const STATIC_SCORE: i32 = i32::MAX / 2;

/// Cap on each window slot.
const WINDOW_CAP: i32 = (STATS_WINDOW.as_secs() / CHECK_INTERVAL.as_secs()) as i32;
/// Minimum tracked population before weighted selection engages.
const SELECT_MIN: usize = 3000;

/// Sighting history of a single endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
struct History {
    windows: [i32; STATS_WINDOWS],
    sum: i32,
}

impl Default for History {
    fn default() -> Self {
        Self {
            windows: [0; STATS_WINDOWS],
            sum: 0,
        }
    }
}

/// The tracker state: per-endpoint histories and the score-sorted view
/// used for weighted selection.
#[derive(Debug)]
struct StatsTable {
    /// Allow-listed seed endpoints with pseudo-infinite score.
    statics: collections::HashSet<net::SocketAddr>,
    /// Dynamic sighting counters.
    counters: collections::HashMap<net::SocketAddr, History>,
    /// Tracked endpoints, sorted by ascending score. Rebuilt on
    /// window rotation.
    sorted: Vec<net::SocketAddr>,
    /// Slot currently being written.
    write_pos: usize,
    /// Start of the current window.
    base_time: LocalTime,
    rng: fastrand::Rng,
}

impl StatsTable {
    fn new(
        rng: fastrand::Rng,
        now: LocalTime,
        statics: impl IntoIterator<Item = net::SocketAddr>,
    ) -> Self {
        let mut set = collections::set(&rng);
        set.extend(statics);

        Self {
            statics: set,
            counters: collections::map(&rng),
            sorted: Vec::new(),
            write_pos: 0,
            base_time: now,
            rng,
        }
    }

    /// Advance the write position once per elapsed window, dropping
    /// the counts being overwritten and pruning endpoints whose score
    /// reaches zero. The sorted view is rebuilt afterwards.
    fn rotate(&mut self, now: LocalTime) {
        let elapsed = ((now - self.base_time).as_secs() / STATS_WINDOW.as_secs()) as usize;
        if elapsed == 0 {
            return;
        }
        self.base_time = self.base_time + STATS_WINDOW * elapsed as u64;

        let target = (self.write_pos + elapsed) % STATS_WINDOWS;
        for _ in 0..elapsed.min(STATS_WINDOWS) {
            self.write_pos = (self.write_pos + 1) % STATS_WINDOWS;
            let pos = self.write_pos;

            self.counters.retain(|_, history| {
                history.sum -= history.windows[pos];
                history.windows[pos] = 0;
                history.sum > 0
            });
        }
        self.write_pos = target;
        self.resort();
    }

    fn resort(&mut self) {
        let mut entries: Vec<(i32, net::SocketAddr)> = self
            .counters
            .iter()
            .map(|(addr, history)| (history.sum, *addr))
            .collect();
        entries.sort_unstable();

        self.sorted = entries.into_iter().map(|(_, addr)| addr).collect();
    }

    /// Register an endpoint with a single sighting if it isn't being
    /// tracked yet.
    fn register(&mut self, addr: net::SocketAddr) {
        let pos = self.write_pos;
        let history = self.counters.entry(addr).or_default();

        if history.sum == 0 {
            history.windows[pos] = 1;
            history.sum = 1;
            self.sorted.insert(0, addr);
        }
    }

    fn add(&mut self, addr: net::SocketAddr, now: LocalTime) {
        self.rotate(now);
        self.register(addr);
    }

    /// Count `n` sightings of a connected peer in the current window,
    /// up to the per-window cap.
    fn connected(&mut self, addr: net::SocketAddr, n: i32, now: LocalTime) {
        self.rotate(now);
        self.register(addr);

        let pos = self.write_pos;
        let history = self
            .counters
            .get_mut(&addr)
            .expect("the endpoint was registered above");

        if history.windows[pos] < WINDOW_CAP {
            history.windows[pos] += n;
            history.sum += n;
        }
    }

    /// Collapse an endpoint's history to a token score. Endpoints that
    /// never rose above the minimum are left alone.
    fn reset(&mut self, addr: &net::SocketAddr, now: LocalTime) {
        self.rotate(now);

        if let Some(history) = self.counters.get_mut(addr) {
            if history.sum <= 2 {
                return;
            }
            log::debug!("Reset sighting history of {}", addr);

            history.windows = [0; STATS_WINDOWS];
            history.windows[self.write_pos] = 2;
            history.sum = 2;
        }
    }

    fn score(&mut self, addr: &net::SocketAddr, now: LocalTime) -> i32 {
        self.rotate(now);

        if self.statics.contains(addr) {
            return STATIC_SCORE;
        }
        self.counters.get(addr).map_or(0, |history| history.sum)
    }

    /// Pick an endpoint from the score-sorted view, skewed by
    /// `new_bias` towards one end of the sort. Abstains while the
    /// tracked population is too small to be meaningful.
    fn select(&mut self, new_bias: u32, now: LocalTime) -> Option<net::SocketAddr> {
        self.rotate(now);

        let count = self.sorted.len();
        if count < SELECT_MIN {
            return None;
        }
        // Two-sided piecewise-linear index distribution with its knee
        // at `100 - new_bias` percent of the sort.
        let knee = (100 - new_bias.min(100)) as f64;
        let rn = self.rng.f64();
        let index = if rn > 0.5 {
            (count - 1) as f64 * (knee + (100.0 - knee) * 2.0 * (rn - 0.5)) / 100.0
        } else {
            (count - 1) as f64 * (knee * 2.0 * rn) / 100.0
        } as usize;

        self.sorted.get(index.min(count - 1)).copied()
    }

    /// Drop the lowest-scored entries beyond the persistence cap.
    fn prune(&mut self) {
        if self.sorted.len() <= STATS_MAX {
            return;
        }
        let excess = self.sorted.len() - STATS_MAX;
        for addr in self.sorted.drain(..excess) {
            self.counters.remove(&addr);
        }
    }

    fn consistency_check(&self) -> Result<(), &'static str> {
        if self.sorted.len() != self.counters.len() {
            return Err("sorted view and counters differ in size");
        }
        for addr in self.sorted.iter() {
            if !self.counters.contains_key(addr) {
                return Err("sorted view holds an untracked endpoint");
            }
        }
        if self.write_pos >= STATS_WINDOWS {
            return Err("write position out of range");
        }
        Ok(())
    }

    #[cfg(feature = "check")]
    fn check(&self) {
        if let Err(violation) = self.consistency_check() {
            panic!("sightings tracker consistency check failed: {}", violation);
        }
    }

    #[cfg(not(feature = "check"))]
    fn check(&self) {}
}

impl Encodable for StatsTable {
    /// Serialized format: version, entry count, write position, base
    /// timestamp, then every tracked endpoint with its full window
    /// history in ascending score order. Sums and the allow-list are
    /// not encoded; sums are recomputed on load and the allow-list is
    /// injected by the host.
    fn consensus_encode<S: io::Write>(&self, mut s: S) -> Result<usize, io::Error> {
        let mut len = 1u32.consensus_encode(&mut s)?;

        len += (self.sorted.len() as u32).consensus_encode(&mut s)?;
        len += (self.write_pos as u32).consensus_encode(&mut s)?;
        len += self.base_time.as_secs().consensus_encode(&mut s)?;

        for addr in self.sorted.iter() {
            len += encode_socket_addr(addr, &mut s)?;

            let history = &self.counters[addr];
            for window in history.windows.iter() {
                len += window.consensus_encode(&mut s)?;
            }
        }
        Ok(len)
    }
}

impl Decodable for StatsTable {
    fn consensus_decode<D: io::Read>(mut d: D) -> Result<Self, encode::Error> {
        let version = u32::consensus_decode(&mut d)?;
        if version != 1 {
            return Err(encode::Error::ParseFailed(
                "unsupported sightings tracker version",
            ));
        }
        let count = u32::consensus_decode(&mut d)?;
        if count as usize > STATS_MAX {
            return Err(encode::Error::ParseFailed("sightings count out of range"));
        }
        let write_pos = u32::consensus_decode(&mut d)?;
        if write_pos as usize >= STATS_WINDOWS {
            return Err(encode::Error::ParseFailed("write position out of range"));
        }
        let base_time = u64::consensus_decode(&mut d)?;

        let mut table = StatsTable::new(
            fastrand::Rng::new(),
            LocalTime::from_secs(base_time),
            std::iter::empty(),
        );
        table.write_pos = write_pos as usize;

        for _ in 0..count {
            let addr = decode_socket_addr(&mut d)?;
            let mut history = History::default();

            for window in history.windows.iter_mut() {
                *window = i32::consensus_decode(&mut d)?;
            }
            history.sum = history
                .windows
                .iter()
                .fold(0i32, |sum, w| sum.saturating_add(*w));

            if table.counters.insert(addr, history).is_some() {
                return Err(encode::Error::ParseFailed("duplicate endpoint"));
            }
        }
        table.resort();

        Ok(table)
    }
}

/// Tracks how often peers are sighted on the network.
///
/// Like the address manager, a thread-safe shell holding the component
/// lock around every operation; persistence snapshots under the lock
/// and writes outside of it.
#[derive(Debug)]
pub struct AddrStats<C> {
    inner: Mutex<StatsTable>,
    clock: C,
}

impl<C: Clock> AddrStats<C> {
    /// Create an empty tracker with the given static seed endpoints.
    pub fn new(
        rng: fastrand::Rng,
        clock: C,
        statics: impl IntoIterator<Item = net::SocketAddr>,
    ) -> Self {
        let now = clock.local_time();

        Self {
            inner: Mutex::new(StatsTable::new(rng, now, statics)),
            clock,
        }
    }

    /// Start tracking an endpoint.
    pub fn add(&self, addr: &net::SocketAddr) {
        let now = self.clock.local_time();
        let mut table = self.inner.lock();

        table.check();
        table.add(*addr, now);
        table.check();
    }

    /// Count `n` sightings of a connected peer.
    pub fn connected(&self, addr: &net::SocketAddr, n: u32) {
        let now = self.clock.local_time();
        let mut table = self.inner.lock();

        table.check();
        table.connected(*addr, n.min(i32::MAX as u32) as i32, now);
        table.check();
    }

    /// Collapse an endpoint's accumulated score.
    pub fn reset(&self, addr: &net::SocketAddr) {
        let now = self.clock.local_time();
        let mut table = self.inner.lock();

        table.check();
        table.reset(addr, now);
        table.check();
    }

    /// The endpoint's current score: the allow-list short-circuits,
    /// unknown endpoints score zero.
    pub fn score(&self, addr: &net::SocketAddr) -> i32 {
        let now = self.clock.local_time();
        let mut table = self.inner.lock();

        table.check();
        let score = table.score(addr, now);
        table.check();

        score
    }

    /// Pick an endpoint weighted by popularity, or `None` while too
    /// few endpoints are tracked.
    pub fn select(&self, new_bias: u32) -> Option<net::SocketAddr> {
        let now = self.clock.local_time();
        let mut table = self.inner.lock();

        table.check();
        let picked = table.select(new_bias, now);
        table.check();

        picked
    }

    /// The number of endpoints tracked, not counting the allow-list.
    pub fn len(&self) -> usize {
        self.inner.lock().counters.len()
    }

    /// Whether no endpoints are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the tracker to the given path, keeping the top
    /// [`STATS_MAX`] entries.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let now = self.clock.local_time();
        let payload = {
            let mut table = self.inner.lock();

            table.check();
            table.rotate(now);
            table.prune();
            table.check();

            encode::serialize(&*table)
        };
        store::write(path, &payload)
    }

    /// Load a previously persisted tracker.
    pub fn load<P: AsRef<Path>>(
        path: P,
        rng: fastrand::Rng,
        clock: C,
        statics: impl IntoIterator<Item = net::SocketAddr>,
    ) -> Result<Self, Error> {
        let payload = store::read(path)?;
        let mut table: StatsTable = encode::deserialize(&payload)?;

        let mut set = collections::set(&rng);
        set.extend(statics);

        table.rng = rng;
        table.statics = set;
        table.check();

        Ok(Self {
            inner: Mutex::new(table),
            clock,
        })
    }

    /// Load a previously persisted tracker, falling back to an empty
    /// one if the file is missing, corrupt or unreadable.
    pub fn restore<P: AsRef<Path>>(
        path: P,
        rng: fastrand::Rng,
        clock: C,
        statics: &[net::SocketAddr],
    ) -> Self {
        let path = path.as_ref();

        match Self::load(path, rng.clone(), clock.clone(), statics.iter().copied()) {
            Ok(stats) => stats,
            Err(err) => {
                log::warn!(
                    "Failed to load sightings tracker from {:?}: {}; starting empty",
                    path,
                    err
                );
                Self::new(rng, clock, statics.iter().copied())
            }
        }
    }
}
