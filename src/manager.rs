//! The stochastic peer address manager.
//!
//! Endpoints the node hears about go into a *new* table of 1024 buckets of
//! 64 slots, keyed by a secret so an adversary cannot predict placement.
//! Both the bucket an endpoint lands in and the number of buckets a single
//! announcer can reach are functions of address *groups* (AS numbers under
//! an asmap, address prefixes otherwise), which bounds how much of the
//! table any one network neighborhood can own. Endpoints we have actually
//! connected to graduate into a smaller *tried* table of 256 buckets, and
//! eviction from it is deferred until the incumbent had a chance to prove
//! it is still alive ("test before evict").
//!
//! Selection is a biased random walk over the bucket tables; bulk sampling
//! for gossip draws from a uniformly shuffled vector of all entries. The
//! whole store can be snapshotted to and restored from a byte stream.
//!
//! The manager is a passive data structure: it does no I/O and spawns no
//! tasks. A single lock protects the store; all operations are short and
//! non-blocking, and callers may share the manager freely across threads.
use std::io;

use bitcoin::network::address::AddrV2;
use bitcoin::network::constants::ServiceFlags;

use parking_lot::Mutex;

use crate::addr::{Endpoint, PeerAddr};
use crate::asmap::AsMap;
use crate::collections::HashMap;
use crate::entry::{Entry, Id, Key};
use crate::error::Error;
use crate::time::{Clock, LocalDuration, LocalTime};

/// Total number of buckets for vetted (tried) addresses.
pub const TRIED_BUCKET_COUNT: usize = 256;
/// Total number of buckets for unvetted (new) addresses.
pub const NEW_BUCKET_COUNT: usize = 1024;
/// Number of slots in each bucket.
pub const BUCKET_SIZE: usize = 64;
/// Maximum number of new-table slots a single address can occupy.
pub const NEW_BUCKETS_PER_ADDRESS: u32 = 8;

pub(crate) const TRIED_BUCKETS_PER_GROUP: u64 = 8;
pub(crate) const NEW_BUCKETS_PER_SOURCE: u64 = 64;

const TRIED_BUCKET_COUNT_LOG2: u32 = 8;
const NEW_BUCKET_COUNT_LOG2: u32 = 10;
const BUCKET_SIZE_LOG2: u32 = 6;

/// Maximum number of promotions waiting on test-before-evict.
const MAX_COLLISIONS: usize = 10;
/// How recently an incumbent must have proven itself to win a collision.
const REPLACEMENT: LocalDuration = LocalDuration::from_hours(4);
/// How long a challenger may sit in the collision queue before the
/// incumbent is evicted untested.
const TEST_WINDOW: LocalDuration = LocalDuration::from_mins(40);

/// Address manager configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// The IP-to-ASN map used for address grouping. The empty map falls
    /// back to grouping by address prefix.
    pub asmap: AsMap,
    /// Verify every store invariant before and after each operation.
    /// Expensive; intended as a test oracle, never for production use.
    pub consistency_check: bool,
}

/// Manages peer network addresses.
///
/// All operations are thread-safe and total: recording an observation about
/// an unknown endpoint is a silent no-op.
#[derive(Debug)]
pub struct AddrManager<C = LocalTime> {
    inner: Mutex<Inner<C>>,
}

impl<C: Clock> AddrManager<C> {
    /// Create a new, empty address manager. The secret bucketing key is
    /// drawn from `rng`.
    pub fn new(config: Config, rng: fastrand::Rng, clock: C) -> Self {
        let mut inner = Inner {
            key: [0; 32],
            entries: HashMap::with_hasher(rng.clone().into()),
            by_addr: HashMap::with_hasher(rng.clone().into()),
            random: Vec::new(),
            new: vec![[None; BUCKET_SIZE]; NEW_BUCKET_COUNT],
            tried: vec![[None; BUCKET_SIZE]; TRIED_BUCKET_COUNT],
            new_count: 0,
            tried_count: 0,
            id_count: 0,
            last_good: LocalTime::from_secs(1),
            collisions: Vec::new(),
            asmap: config.asmap,
            check: config.consistency_check,
            rng,
            clock,
        };
        inner.clear(false);

        Self {
            inner: Mutex::new(inner),
        }
    }

    /// The number of unique addresses known.
    pub fn len(&self) -> usize {
        self.inner.lock().random.len()
    }

    /// Whether any addresses are known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a single address announced by `source`. Returns `true` if the
    /// address was previously unknown.
    ///
    /// The penalty is subtracted from the announced timestamp, to
    /// de-prioritize addresses relayed second-hand. It is ignored for a
    /// source announcing itself.
    pub fn add(&self, addr: PeerAddr, source: &AddrV2, penalty: LocalDuration) -> bool {
        self.with(|inner| inner.add(addr, source, penalty))
    }

    /// Add multiple addresses announced by `source`. Returns the number of
    /// previously unknown addresses inserted.
    pub fn add_many(
        &self,
        addrs: impl IntoIterator<Item = PeerAddr>,
        source: &AddrV2,
        penalty: LocalDuration,
    ) -> usize {
        self.with(|inner| {
            addrs
                .into_iter()
                .filter(|addr| inner.add(addr.clone(), source, penalty))
                .count()
        })
    }

    /// Record a successful connection to an endpoint, possibly promoting it
    /// to the tried table.
    ///
    /// With `test_before_evict` set, a promotion that would displace a
    /// tried entry is deferred into the collision queue instead, giving the
    /// incumbent a chance to prove it is still reachable; the queue is
    /// driven by [`AddrManager::resolve_collisions`].
    pub fn good(&self, endpoint: &Endpoint, test_before_evict: bool, time: LocalTime) {
        self.with(|inner| inner.good(endpoint, test_before_evict, time))
    }

    /// Record a connection attempt to an endpoint.
    ///
    /// The attempt only counts as a failure if we have connected to some
    /// peer since this endpoint's last counted attempt; this avoids
    /// inflating failure counts while we are offline ourselves.
    pub fn attempt(&self, endpoint: &Endpoint, count_failure: bool, time: LocalTime) {
        self.with(|inner| inner.attempt(endpoint, count_failure, time))
    }

    /// Record that we are currently connected to an endpoint, refreshing
    /// its gossip timestamp. Rate-limited to once per twenty minutes so the
    /// timestamp churn isn't visible to the network.
    pub fn connected(&self, endpoint: &Endpoint, time: LocalTime) {
        self.with(|inner| inner.connected(endpoint, time))
    }

    /// Overwrite an endpoint's service bits.
    pub fn set_services(&self, endpoint: &Endpoint, services: ServiceFlags) {
        self.with(|inner| inner.set_services(endpoint, services))
    }

    /// Choose an address to connect to, weighted against recently failing
    /// entries. Returns `None` when the store is empty.
    pub fn select(&self, new_only: bool) -> Option<PeerAddr> {
        self.with(|inner| inner.select(new_only))
    }

    /// Return a random sample of addresses for gossip, skipping entries of
    /// low quality. The sample size is bounded by `max_addresses` and by
    /// `max_pct` percent of the store; zero disables either bound.
    pub fn get_addr(&self, max_addresses: usize, max_pct: usize) -> Vec<PeerAddr> {
        self.with(|inner| inner.get_addr(max_addresses, max_pct))
    }

    /// Resolve pending tried-table collisions, promoting challengers whose
    /// incumbents failed to prove themselves.
    pub fn resolve_collisions(&self) {
        self.with(|inner| inner.resolve_collisions())
    }

    /// The tried entry currently blocking a random pending promotion, if
    /// any. Callers probe it for liveness and report back via
    /// [`AddrManager::good`] or [`AddrManager::attempt`].
    pub fn select_tried_collision(&self) -> Option<PeerAddr> {
        self.with(|inner| inner.select_tried_collision())
    }

    /// Reinitialize the store, discarding all addresses. In deterministic
    /// mode the bucketing key is zeroed and the rng reseeded, for
    /// reproducible tests.
    pub fn clear(&self, deterministic: bool) {
        let mut inner = self.inner.lock();
        inner.clear(deterministic);
    }

    /// Snapshot the store to a byte sink.
    pub fn serialize<W: io::Write>(&self, writer: W) -> Result<(), Error> {
        self.inner.lock().serialize(writer)
    }

    /// Restore the store from a byte source, replacing the current
    /// contents. On failure the store is left empty.
    pub fn deserialize<R: io::Read>(&self, reader: R) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        inner.deserialize(reader).map_err(|err| {
            inner.clear(false);
            err
        })
    }

    /// Verify every store invariant by a full sweep, panicking on
    /// violation. This is the oracle property tests run against.
    pub fn check_consistency(&self) {
        self.inner.lock().consistency_check()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner<C>) -> R) -> R {
        let mut inner = self.inner.lock();
        if inner.check {
            inner.consistency_check();
        }
        let result = f(&mut inner);
        if inner.check {
            inner.consistency_check();
        }
        result
    }
}

/// The store proper. All cross-references between the index structures go
/// through dense integer ids; the entry map is the sole owner.
#[derive(Debug)]
pub(crate) struct Inner<C> {
    /// Secret key to randomize bucket placement with.
    pub(crate) key: Key,
    /// All known entries, by id.
    pub(crate) entries: HashMap<Id, Entry>,
    /// Endpoint to id index.
    pub(crate) by_addr: HashMap<Endpoint, Id>,
    /// Randomly-ordered vector of all ids.
    pub(crate) random: Vec<Id>,
    /// The new table.
    pub(crate) new: Vec<[Option<Id>; BUCKET_SIZE]>,
    /// The tried table.
    pub(crate) tried: Vec<[Option<Id>; BUCKET_SIZE]>,
    /// Number of unique new entries.
    pub(crate) new_count: usize,
    /// Number of tried entries.
    pub(crate) tried_count: usize,
    /// Next id to hand out.
    pub(crate) id_count: Id,
    /// Last time any endpoint was marked good.
    pub(crate) last_good: LocalTime,
    /// Ids waiting to be promoted, pending a liveness test of the tried
    /// entry they would displace.
    pub(crate) collisions: Vec<Id>,
    /// IP-to-ASN map used for grouping. Read-only once constructed.
    pub(crate) asmap: AsMap,
    /// Whether to run the consistency check around every operation.
    pub(crate) check: bool,
    pub(crate) rng: fastrand::Rng,
    pub(crate) clock: C,
}

impl<C: Clock> Inner<C> {
    fn find(&self, endpoint: &Endpoint) -> Option<Id> {
        self.by_addr.get(endpoint).copied()
    }

    /// Allocate an entry. The caller is responsible for table placement
    /// and the `new_count` accounting.
    fn create(&mut self, addr: PeerAddr, source: AddrV2) -> Id {
        let id = self.id_count;
        self.id_count += 1;

        let mut entry = Entry::new(addr, source);
        entry.random_pos = self.random.len();

        self.by_addr.insert(entry.addr.endpoint.clone(), id);
        self.random.push(id);
        self.entries.insert(id, entry);

        id
    }

    /// Swap two elements of the random-order vector.
    fn swap_random(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        assert!(a < self.random.len() && b < self.random.len());

        let id_a = self.random[a];
        let id_b = self.random[b];

        self.entries.get_mut(&id_a).expect("ids resolve").random_pos = b;
        self.entries.get_mut(&id_b).expect("ids resolve").random_pos = a;

        self.random.swap(a, b);
    }

    /// Delete an entry. It must not be in tried and must have no
    /// new-table references left.
    pub(crate) fn delete(&mut self, id: Id) {
        let (random_pos, endpoint) = {
            let entry = self.entries.get(&id).expect("ids resolve");
            assert!(!entry.in_tried);
            assert_eq!(entry.ref_count, 0);

            (entry.random_pos, entry.addr.endpoint.clone())
        };
        let last = self.random.len() - 1;
        self.swap_random(random_pos, last);
        self.random.pop();
        self.by_addr.remove(&endpoint);
        self.entries.remove(&id);
        self.new_count -= 1;
    }

    /// Empty a new-table slot, deleting the occupant if this was its last
    /// reference. This is the only place entries are actually destroyed.
    fn clear_new(&mut self, bucket: usize, position: usize) {
        if let Some(id) = self.new[bucket][position] {
            let entry = self.entries.get_mut(&id).expect("slot ids resolve");
            assert!(entry.ref_count > 0);
            entry.ref_count -= 1;
            self.new[bucket][position] = None;

            if self.entries[&id].ref_count == 0 {
                self.delete(id);
            }
        }
    }

    /// The tried-table slot an entry belongs to.
    fn tried_slot(&self, id: Id) -> (usize, usize) {
        let entry = &self.entries[&id];
        let bucket = entry.tried_bucket(&self.key, &self.asmap);

        (bucket, entry.bucket_position(&self.key, false, bucket))
    }

    /// Move an entry from the new table to the tried table. If the target
    /// slot is taken, the incumbent is demoted back into the new table
    /// first, displacing whatever stands in its way there.
    fn make_tried(&mut self, id: Id) {
        for bucket in 0..NEW_BUCKET_COUNT {
            let position = self.entries[&id].bucket_position(&self.key, true, bucket);
            if self.new[bucket][position] == Some(id) {
                self.new[bucket][position] = None;
                self.entries.get_mut(&id).expect("ids resolve").ref_count -= 1;
            }
        }
        self.new_count -= 1;
        assert_eq!(self.entries[&id].ref_count, 0);

        let (bucket, position) = self.tried_slot(id);

        if let Some(evicted) = self.tried[bucket][position] {
            self.entries.get_mut(&evicted).expect("ids resolve").in_tried = false;
            self.tried[bucket][position] = None;
            self.tried_count -= 1;

            // Re-home the evicted entry using its own source group.
            let (new_bucket, new_position) = {
                let entry = &self.entries[&evicted];
                let b = entry.new_bucket(&self.key, &self.asmap);
                (b, entry.bucket_position(&self.key, true, b))
            };
            self.clear_new(new_bucket, new_position);
            assert!(self.new[new_bucket][new_position].is_none());

            self.entries.get_mut(&evicted).expect("ids resolve").ref_count = 1;
            self.new[new_bucket][new_position] = Some(evicted);
            self.new_count += 1;
        }
        assert!(self.tried[bucket][position].is_none());

        self.tried[bucket][position] = Some(id);
        self.tried_count += 1;
        self.entries.get_mut(&id).expect("ids resolve").in_tried = true;
    }

    pub(crate) fn add(&mut self, addr: PeerAddr, source: &AddrV2, penalty: LocalDuration) -> bool {
        if !addr.endpoint.is_routable() {
            return false;
        }
        // A source announcing itself doesn't get penalized.
        let penalty = if addr.endpoint.addr == *source {
            LocalDuration::default()
        } else {
            penalty
        };
        let now = self.clock.local_time();

        let (id, fresh) = match self.find(&addr.endpoint) {
            Some(id) => {
                let factor = {
                    let entry = self.entries.get_mut(&id).expect("ids resolve");

                    // Periodically refresh the gossip timestamp: hourly for
                    // peers that look currently online, daily otherwise.
                    let currently_online =
                        (now.timestamp() as i64 - addr.last_seen as i64) < 24 * 60 * 60;
                    let interval: i64 = if currently_online { 60 * 60 } else { 24 * 60 * 60 };
                    if addr.last_seen != 0
                        && (entry.addr.last_seen == 0
                            || (entry.addr.last_seen as i64)
                                < addr.last_seen as i64 - interval - penalty.as_secs() as i64)
                    {
                        entry.addr.last_seen =
                            addr.last_seen.saturating_sub(penalty.as_secs() as u32);
                    }
                    entry.addr.services = entry.addr.services | addr.services;

                    // Nothing more to do if no new information is present,
                    if addr.last_seen == 0
                        || (entry.addr.last_seen != 0 && addr.last_seen <= entry.addr.last_seen)
                    {
                        return false;
                    }
                    // the entry has already been vetted,
                    if entry.in_tried {
                        return false;
                    }
                    // or the maximum reference count is reached.
                    if entry.ref_count == NEW_BUCKETS_PER_ADDRESS {
                        return false;
                    }
                    // A reference count of N makes the next copy 2^N times
                    // harder to obtain.
                    1u32 << entry.ref_count
                };
                if factor > 1 && self.rng.u32(0..factor) != 0 {
                    return false;
                }
                (id, false)
            }
            None => {
                let id = self.create(addr.clone(), source.clone());
                let entry = self.entries.get_mut(&id).expect("just created");
                entry.addr.last_seen =
                    entry.addr.last_seen.saturating_sub(penalty.as_secs() as u32);
                self.new_count += 1;

                (id, true)
            }
        };

        let (bucket, position) = {
            let entry = &self.entries[&id];
            let bucket = entry.new_bucket_from(&self.key, source, &self.asmap);
            (bucket, entry.bucket_position(&self.key, true, bucket))
        };
        if self.new[bucket][position] != Some(id) {
            let mut insert = self.new[bucket][position].is_none();
            if let Some(occupant) = self.new[bucket][position] {
                let existing = &self.entries[&occupant];
                // Displace the occupant if it is of low quality, or if it
                // has plenty of other copies while the candidate has none.
                if existing.is_terrible(now)
                    || (existing.ref_count > 1 && self.entries[&id].ref_count == 0)
                {
                    insert = true;
                }
            }
            if insert {
                self.clear_new(bucket, position);
                self.entries.get_mut(&id).expect("ids resolve").ref_count += 1;
                self.new[bucket][position] = Some(id);
            } else if self.entries[&id].ref_count == 0 {
                self.delete(id);
            }
        }
        if fresh {
            log::debug!(
                "added {} from {:?}: {} tried, {} new",
                addr,
                source,
                self.tried_count,
                self.new_count
            );
        }
        fresh
    }

    pub(crate) fn good(&mut self, endpoint: &Endpoint, test_before_evict: bool, time: LocalTime) {
        self.last_good = time;

        let id = match self.find(endpoint) {
            Some(id) => id,
            None => return,
        };
        {
            let entry = self.entries.get_mut(&id).expect("ids resolve");
            entry.last_success = time;
            entry.last_try = time;
            entry.attempts = 0;
            // The gossip timestamp is deliberately left alone, so as not to
            // leak which peers we are currently connected to.

            if entry.in_tried {
                return;
            }
        }

        // Confirm the entry occupies at least one new-table slot, scanning
        // from a random bucket.
        let start = self.rng.usize(0..NEW_BUCKET_COUNT);
        let mut found = false;
        for n in 0..NEW_BUCKET_COUNT {
            let bucket = (start + n) % NEW_BUCKET_COUNT;
            let position = self.entries[&id].bucket_position(&self.key, true, bucket);
            if self.new[bucket][position] == Some(id) {
                found = true;
                break;
            }
        }
        if !found {
            return;
        }

        let (bucket, position) = self.tried_slot(id);
        if test_before_evict && self.tried[bucket][position].is_some() {
            // The promotion would displace a tried entry. Defer it until
            // the incumbent has had a chance to prove itself.
            if self.collisions.len() < MAX_COLLISIONS && !self.collisions.contains(&id) {
                log::debug!("{} collides in tried; deferring promotion", endpoint);
                self.collisions.push(id);
            }
        } else {
            log::debug!("moving {} to tried", endpoint);
            self.make_tried(id);
        }
    }

    pub(crate) fn attempt(&mut self, endpoint: &Endpoint, count_failure: bool, time: LocalTime) {
        let id = match self.find(endpoint) {
            Some(id) => id,
            None => return,
        };
        let last_good = self.last_good;
        let entry = self.entries.get_mut(&id).expect("ids resolve");

        entry.last_try = time;
        if count_failure && entry.last_counted_attempt < last_good {
            entry.last_counted_attempt = time;
            entry.attempts += 1;
        }
    }

    pub(crate) fn connected(&mut self, endpoint: &Endpoint, time: LocalTime) {
        let id = match self.find(endpoint) {
            Some(id) => id,
            None => return,
        };
        let entry = self.entries.get_mut(&id).expect("ids resolve");

        let interval = 20 * 60;
        if time.timestamp().saturating_sub(entry.addr.last_seen) > interval {
            entry.addr.last_seen = time.timestamp();
        }
    }

    pub(crate) fn set_services(&mut self, endpoint: &Endpoint, services: ServiceFlags) {
        let id = match self.find(endpoint) {
            Some(id) => id,
            None => return,
        };
        self.entries.get_mut(&id).expect("ids resolve").addr.services = services;
    }

    fn rand_bits(&self, bits: u32) -> usize {
        (self.rng.u64(..) >> (64 - bits)) as usize
    }

    pub(crate) fn select(&self, new_only: bool) -> Option<PeerAddr> {
        if self.random.is_empty() {
            return None;
        }
        if new_only && self.new_count == 0 {
            return None;
        }
        let now = self.clock.local_time();

        // An even chance between the tables when both are populated.
        let use_tried =
            !new_only && self.tried_count > 0 && (self.new_count == 0 || self.rng.bool());

        let (table, buckets, bucket_bits) = if use_tried {
            (&self.tried, TRIED_BUCKET_COUNT, TRIED_BUCKET_COUNT_LOG2)
        } else {
            (&self.new, NEW_BUCKET_COUNT, NEW_BUCKET_COUNT_LOG2)
        };

        // Walk random slots until one is occupied; then accept its entry
        // with a probability proportional to its quality, sweetening the
        // deal on every rejection so the loop terminates.
        let mut factor = 1.0;
        loop {
            let mut bucket = self.rng.usize(0..buckets);
            let mut position = self.rng.usize(0..BUCKET_SIZE);
            while table[bucket][position].is_none() {
                bucket = (bucket + self.rand_bits(bucket_bits)) % buckets;
                position = (position + self.rand_bits(BUCKET_SIZE_LOG2)) % BUCKET_SIZE;
            }
            let id = table[bucket][position].expect("the slot is occupied");
            let entry = &self.entries[&id];

            if (self.rand_bits(30) as f64) < factor * entry.chance(now) * (1u64 << 30) as f64 {
                return Some(entry.addr.clone());
            }
            factor *= 1.2;
        }
    }

    pub(crate) fn get_addr(&mut self, max_addresses: usize, max_pct: usize) -> Vec<PeerAddr> {
        let mut wanted = self.random.len();
        if max_pct != 0 {
            wanted = max_pct * wanted / 100;
        }
        if max_addresses != 0 {
            wanted = wanted.min(max_addresses);
        }
        let now = self.clock.local_time();

        // Partial Fisher-Yates shuffle, skipping entries of low quality.
        let mut addrs = Vec::with_capacity(wanted);
        for n in 0..self.random.len() {
            if addrs.len() >= wanted {
                break;
            }
            let pick = self.rng.usize(n..self.random.len());
            self.swap_random(n, pick);

            let entry = &self.entries[&self.random[n]];
            if !entry.is_terrible(now) {
                addrs.push(entry.addr.clone());
            }
        }
        addrs
    }

    pub(crate) fn resolve_collisions(&mut self) {
        let now = self.clock.local_time();

        let mut index = 0;
        while index < self.collisions.len() {
            let id = self.collisions[index];

            let mut resolved = true;
            let mut promote = None;

            match self.entries.get(&id) {
                // The challenger is gone, or no longer points anywhere
                // worth connecting to.
                None => {}
                Some(entry) if !entry.addr.endpoint.is_routable() => {}
                Some(entry) => {
                    let bucket = entry.tried_bucket(&self.key, &self.asmap);
                    let position = entry.bucket_position(&self.key, false, bucket);

                    match self.tried[bucket][position] {
                        // Not a collision anymore.
                        None => promote = Some(entry.addr.endpoint.clone()),
                        Some(incumbent_id) => {
                            let incumbent = &self.entries[&incumbent_id];

                            if now - incumbent.last_success < REPLACEMENT {
                                // The incumbent proved itself recently.
                            } else if now - incumbent.last_try < REPLACEMENT {
                                if now - incumbent.last_try > LocalDuration::from_secs(60) {
                                    // The incumbent had its chance and failed.
                                    log::debug!(
                                        "replacing {} with {} in tried",
                                        incumbent.addr,
                                        entry.addr
                                    );
                                    promote = Some(entry.addr.endpoint.clone());
                                } else {
                                    resolved = false;
                                }
                            } else if now - entry.last_success > TEST_WINDOW {
                                // We couldn't test the incumbent in a
                                // reasonable time; evict it anyway.
                                log::debug!(
                                    "unable to test; replacing {} with {} in tried anyway",
                                    incumbent.addr,
                                    entry.addr
                                );
                                promote = Some(entry.addr.endpoint.clone());
                            } else {
                                resolved = false;
                            }
                        }
                    }
                }
            }

            if resolved {
                self.collisions.remove(index);
            } else {
                index += 1;
            }
            if let Some(endpoint) = promote {
                self.good(&endpoint, false, now);
            }
        }
    }

    pub(crate) fn select_tried_collision(&mut self) -> Option<PeerAddr> {
        if self.collisions.is_empty() {
            return None;
        }
        let index = self.rng.usize(0..self.collisions.len());
        let id = self.collisions[index];

        let entry = match self.entries.get(&id) {
            Some(entry) => entry,
            None => {
                self.collisions.remove(index);
                return None;
            }
        };
        let bucket = entry.tried_bucket(&self.key, &self.asmap);
        let position = entry.bucket_position(&self.key, false, bucket);

        let incumbent = self.tried[bucket][position]?;

        Some(self.entries[&incumbent].addr.clone())
    }

    pub(crate) fn clear(&mut self, deterministic: bool) {
        if deterministic {
            self.rng = fastrand::Rng::with_seed(0);
            self.key = [0; 32];
        } else {
            for byte in self.key.iter_mut() {
                *byte = self.rng.u8(..);
            }
        }
        self.entries = HashMap::with_hasher(self.rng.clone().into());
        self.by_addr = HashMap::with_hasher(self.rng.clone().into());
        self.random = Vec::new();
        for bucket in self.new.iter_mut() {
            *bucket = [None; BUCKET_SIZE];
        }
        for bucket in self.tried.iter_mut() {
            *bucket = [None; BUCKET_SIZE];
        }
        self.new_count = 0;
        self.tried_count = 0;
        self.id_count = 0;
        // One second, so that "never connected" is strictly worse.
        self.last_good = LocalTime::from_secs(1);
        self.collisions.clear();
    }

    /// Verify every invariant of the store by a full sweep.
    pub(crate) fn consistency_check(&self) {
        use std::collections::{HashMap as Counts, HashSet as Set};

        assert_eq!(self.random.len(), self.new_count + self.tried_count);

        let mut tried_ids: Set<Id> = Set::new();
        let mut new_refs: Counts<Id, u32> = Counts::new();

        for (&id, entry) in self.entries.iter() {
            if entry.in_tried {
                assert!(entry.last_success != LocalTime::default());
                assert_eq!(entry.ref_count, 0);
                tried_ids.insert(id);
            } else {
                assert!(entry.ref_count >= 1 && entry.ref_count <= NEW_BUCKETS_PER_ADDRESS);
                new_refs.insert(id, entry.ref_count);
            }
            assert_eq!(self.by_addr.get(&entry.addr.endpoint), Some(&id));
            assert!(entry.random_pos < self.random.len());
            assert_eq!(self.random[entry.random_pos], id);
        }
        assert_eq!(tried_ids.len(), self.tried_count);
        assert_eq!(new_refs.len(), self.new_count);

        for bucket in 0..TRIED_BUCKET_COUNT {
            for position in 0..BUCKET_SIZE {
                if let Some(id) = self.tried[bucket][position] {
                    assert!(tried_ids.remove(&id));
                    let entry = &self.entries[&id];
                    assert_eq!(entry.tried_bucket(&self.key, &self.asmap), bucket);
                    assert_eq!(entry.bucket_position(&self.key, false, bucket), position);
                }
            }
        }
        for bucket in 0..NEW_BUCKET_COUNT {
            for position in 0..BUCKET_SIZE {
                if let Some(id) = self.new[bucket][position] {
                    let entry = &self.entries[&id];
                    assert!(!entry.in_tried);
                    assert_eq!(entry.bucket_position(&self.key, true, bucket), position);

                    let refs = new_refs.get_mut(&id).expect("new slots hold new ids");
                    *refs -= 1;
                    if *refs == 0 {
                        new_refs.remove(&id);
                    }
                }
            }
        }
        assert!(tried_ids.is_empty());
        assert!(new_refs.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::RefClock;

    use std::net;

    use quickcheck_macros::quickcheck;

    fn manager(seed: u64, clock: RefClock) -> AddrManager<RefClock> {
        AddrManager::new(
            Config {
                consistency_check: true,
                ..Config::default()
            },
            fastrand::Rng::with_seed(seed),
            clock,
        )
    }

    fn peer(ip: [u8; 4], port: u16, last_seen: u32) -> PeerAddr {
        PeerAddr::new(
            Endpoint::from(net::SocketAddr::from((ip, port))),
            ServiceFlags::NETWORK,
            last_seen,
        )
    }

    fn source(ip: [u8; 4]) -> AddrV2 {
        AddrV2::Ipv4(net::Ipv4Addr::from(ip))
    }

    #[test]
    fn test_add_then_promote() {
        let clock = RefClock::from(LocalTime::from_secs(1000));
        let mgr = manager(0, clock.clone());

        let e1 = peer([33, 33, 33, 33], 8333, 1000);
        assert!(mgr.add(e1.clone(), &source([33, 33, 33, 33]), LocalDuration::default()));
        assert_eq!(mgr.len(), 1);
        {
            let inner = mgr.inner.lock();
            assert_eq!(inner.new_count, 1);
            assert_eq!(inner.tried_count, 0);
        }

        clock.elapse(LocalDuration::from_secs(100));
        mgr.good(&e1.endpoint, false, clock.local_time());

        assert_eq!(mgr.len(), 1);
        {
            let inner = mgr.inner.lock();
            assert_eq!(inner.new_count, 0);
            assert_eq!(inner.tried_count, 1);
        }
        let selected = mgr.select(false).expect("the only entry is returned");
        assert_eq!(selected.endpoint, e1.endpoint);
    }

    #[test]
    fn test_select_empty() {
        let clock = RefClock::from(LocalTime::from_secs(1000));
        let mgr = manager(0, clock);

        assert!(mgr.is_empty());
        assert!(mgr.select(false).is_none());
        assert!(mgr.select(true).is_none());
        assert!(mgr.select_tried_collision().is_none());
    }

    #[test]
    fn test_select_new_only() {
        let clock = RefClock::from(LocalTime::from_secs(100_000));
        let mgr = manager(7, clock.clone());

        let e1 = peer([33, 33, 33, 33], 8333, clock.local_time().timestamp());
        mgr.add(e1.clone(), &source([99, 1, 1, 1]), LocalDuration::default());
        mgr.good(&e1.endpoint, false, clock.local_time());

        // The only entry is in tried now.
        assert!(mgr.select(true).is_none());
        assert!(mgr.select(false).is_some());
    }

    #[test]
    fn test_non_routable_rejected() {
        let clock = RefClock::from(LocalTime::from_secs(1000));
        let mgr = manager(0, clock);

        for ip in [[127, 0, 0, 1], [192, 168, 1, 1], [10, 0, 0, 1]] {
            assert!(!mgr.add(peer(ip, 8333, 1000), &source([99, 1, 1, 1]), LocalDuration::default()));
        }
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_self_announce_ignores_penalty() {
        let clock = RefClock::from(LocalTime::from_secs(100_000));
        let mgr = manager(0, clock.clone());
        let penalty = LocalDuration::from_mins(30);
        let now = clock.local_time().timestamp();

        let own = peer([33, 33, 33, 33], 8333, now);
        mgr.add(own.clone(), &source([33, 33, 33, 33]), penalty);

        let relayed = peer([44, 44, 44, 44], 8333, now);
        mgr.add(relayed.clone(), &source([99, 1, 1, 1]), penalty);

        let inner = mgr.inner.lock();
        let own_id = inner.by_addr[&own.endpoint];
        let relayed_id = inner.by_addr[&relayed.endpoint];

        assert_eq!(inner.entries[&own_id].addr.last_seen, now);
        assert_eq!(
            inner.entries[&relayed_id].addr.last_seen,
            now - penalty.as_secs() as u32
        );
    }

    #[test]
    fn test_refcount_ceiling() {
        let clock = RefClock::from(LocalTime::from_secs(1_000_000));
        let mgr = manager(3, clock.clone());
        let endpoint = Endpoint::from(net::SocketAddr::from(([33, 33, 33, 33], 8333)));

        for i in 0..100u32 {
            clock.elapse(LocalDuration::from_secs(1));
            let addr = peer([33, 33, 33, 33], 8333, clock.local_time().timestamp());
            let src = source([(i + 1) as u8, (i * 3) as u8, 1, 1]);

            mgr.add(addr, &src, LocalDuration::default());
        }
        assert_eq!(mgr.len(), 1);

        let inner = mgr.inner.lock();
        let id = inner.by_addr[&endpoint];
        assert!(inner.entries[&id].ref_count <= NEW_BUCKETS_PER_ADDRESS);
    }

    #[test]
    fn test_attempt_counting() {
        let clock = RefClock::from(LocalTime::from_secs(100_000));
        let mgr = manager(5, clock.clone());

        let e1 = peer([33, 33, 33, 33], 8333, clock.local_time().timestamp());
        mgr.add(e1.clone(), &source([99, 1, 1, 1]), LocalDuration::default());

        let id = mgr.inner.lock().by_addr[&e1.endpoint];

        mgr.attempt(&e1.endpoint, true, clock.local_time());
        assert_eq!(mgr.inner.lock().entries[&id].attempts, 1);

        // Without an intervening success anywhere, further failures are
        // not counted.
        clock.elapse(LocalDuration::from_mins(5));
        mgr.attempt(&e1.endpoint, true, clock.local_time());
        assert_eq!(mgr.inner.lock().entries[&id].attempts, 1);

        // A successful connection elsewhere re-arms the counter.
        let e2 = peer([44, 44, 44, 44], 8333, clock.local_time().timestamp());
        mgr.add(e2.clone(), &source([99, 1, 1, 1]), LocalDuration::default());
        clock.elapse(LocalDuration::from_mins(5));
        mgr.good(&e2.endpoint, false, clock.local_time());

        clock.elapse(LocalDuration::from_mins(5));
        mgr.attempt(&e1.endpoint, true, clock.local_time());
        assert_eq!(mgr.inner.lock().entries[&id].attempts, 2);

        // Attempts without `count_failure` never count.
        clock.elapse(LocalDuration::from_mins(5));
        mgr.attempt(&e1.endpoint, false, clock.local_time());
        assert_eq!(mgr.inner.lock().entries[&id].attempts, 2);
    }

    #[test]
    fn test_connected_rate_limit() {
        let clock = RefClock::from(LocalTime::from_secs(100_000));
        let mgr = manager(5, clock.clone());
        let t0 = clock.local_time().timestamp();

        let e1 = peer([33, 33, 33, 33], 8333, t0);
        mgr.add(e1.clone(), &source([99, 1, 1, 1]), LocalDuration::default());
        let id = mgr.inner.lock().by_addr[&e1.endpoint];

        clock.elapse(LocalDuration::from_mins(10));
        mgr.connected(&e1.endpoint, clock.local_time());
        assert_eq!(mgr.inner.lock().entries[&id].addr.last_seen, t0);

        clock.elapse(LocalDuration::from_mins(11));
        mgr.connected(&e1.endpoint, clock.local_time());
        assert_eq!(
            mgr.inner.lock().entries[&id].addr.last_seen,
            clock.local_time().timestamp()
        );

        // Unknown endpoints are a no-op.
        let unknown = Endpoint::from(net::SocketAddr::from(([55, 55, 55, 55], 8333)));
        mgr.connected(&unknown, clock.local_time());
    }

    #[test]
    fn test_set_services() {
        let clock = RefClock::from(LocalTime::from_secs(100_000));
        let mgr = manager(5, clock.clone());

        let e1 = peer([33, 33, 33, 33], 8333, clock.local_time().timestamp());
        mgr.add(e1.clone(), &source([99, 1, 1, 1]), LocalDuration::default());
        mgr.set_services(&e1.endpoint, ServiceFlags::COMPACT_FILTERS);

        let inner = mgr.inner.lock();
        let id = inner.by_addr[&e1.endpoint];
        assert_eq!(
            inner.entries[&id].addr.services,
            ServiceFlags::COMPACT_FILTERS
        );
    }

    #[test]
    fn test_get_addr() {
        let clock = RefClock::from(LocalTime::from_secs(1_000_000));
        let mgr = manager(11, clock.clone());
        let now = clock.local_time().timestamp();

        for i in 0..40u8 {
            let addr = peer([50 + i, i, 1, 1], 8333, now);
            assert!(mgr.add(addr, &source([99, 1, 1, 1]), LocalDuration::default()));
        }
        // An entry that was never vouched for is unfit for gossip.
        let stale = peer([200, 1, 1, 1], 8333, 0);
        mgr.add(stale.clone(), &source([99, 1, 1, 1]), LocalDuration::default());

        let fit = {
            let inner = mgr.inner.lock();
            let now = clock.local_time();
            inner
                .entries
                .values()
                .filter(|e| !e.is_terrible(now))
                .count()
        };
        assert_eq!(mgr.get_addr(23, 0).len(), 23.min(fit));
        assert_eq!(mgr.get_addr(0, 50).len(), (mgr.len() / 2).min(fit));

        let all = mgr.get_addr(0, 0);
        assert_eq!(all.len(), fit, "terrible entries are skipped");
        assert!(all.iter().all(|a| a.endpoint != stale.endpoint));
    }

    #[test]
    fn test_add_idempotent() {
        let clock = RefClock::from(LocalTime::from_secs(1_000_000));
        let mgr = manager(13, clock.clone());
        let now = clock.local_time().timestamp();

        let addr = peer([33, 33, 33, 33], 8333, now);
        let src = source([99, 1, 1, 1]);

        assert!(mgr.add(addr.clone(), &src, LocalDuration::default()));

        let mut before = Vec::new();
        mgr.serialize(&mut before).unwrap();

        assert!(!mgr.add(addr, &src, LocalDuration::default()));

        let mut after = Vec::new();
        mgr.serialize(&mut after).unwrap();

        assert_eq!(before, after);
    }

    /// Find an endpoint in 44.0.0.0/8 whose tried slot collides with the
    /// given entry's under `key`.
    fn colliding_endpoint(key: &Key, with: &PeerAddr, src: &AddrV2) -> PeerAddr {
        let asmap = AsMap::empty();
        let target = {
            let entry = Entry::new(with.clone(), src.clone());
            let bucket = entry.tried_bucket(key, &asmap);
            (bucket, entry.bucket_position(key, false, bucket))
        };
        for n in 0..(1 << 22) {
            let candidate = peer(
                [44, (n >> 14) as u8, (n >> 6) as u8, 1 + (n & 0x3f) as u8],
                8333,
                with.last_seen,
            );
            let entry = Entry::new(candidate.clone(), src.clone());
            let bucket = entry.tried_bucket(key, &asmap);
            if (bucket, entry.bucket_position(key, false, bucket)) == target
                && candidate.endpoint != with.endpoint
            {
                return candidate;
            }
        }
        panic!("no colliding endpoint found in 44.0.0.0/8");
    }

    #[test]
    fn test_test_before_evict() {
        let clock = RefClock::from(LocalTime::from_secs(1_000_000));
        let mgr = manager(17, clock.clone());
        let src = source([99, 1, 1, 1]);

        let old = peer([33, 33, 33, 33], 8333, clock.local_time().timestamp());
        assert!(mgr.add(old.clone(), &src, LocalDuration::default()));
        mgr.good(&old.endpoint, true, clock.local_time());
        assert_eq!(mgr.inner.lock().tried_count, 1);

        let challenger = colliding_endpoint(&mgr.inner.lock().key, &old, &src);
        assert!(mgr.add(challenger.clone(), &src, LocalDuration::default()));

        clock.elapse(LocalDuration::from_secs(1));
        mgr.good(&challenger.endpoint, true, clock.local_time());

        // The challenger is queued; the incumbent keeps its slot.
        {
            let inner = mgr.inner.lock();
            assert_eq!(inner.collisions.len(), 1);
            assert_eq!(inner.tried_count, 1);
            assert!(!inner.entries[&inner.by_addr[&challenger.endpoint]].in_tried);
        }
        let incumbent = mgr.select_tried_collision().expect("a collision is pending");
        assert_eq!(incumbent.endpoint, old.endpoint);

        // Resolving right away drops the challenger: the incumbent
        // connected successfully only moments ago.
        mgr.resolve_collisions();
        {
            let inner = mgr.inner.lock();
            assert!(inner.collisions.is_empty());
            assert!(inner.entries[&inner.by_addr[&old.endpoint]].in_tried);
        }

        // Challenge again, and let the incumbent's record go stale.
        clock.elapse(LocalDuration::from_secs(1));
        mgr.good(&challenger.endpoint, true, clock.local_time());
        assert_eq!(mgr.inner.lock().collisions.len(), 1);

        clock.elapse(LocalDuration::from_hours(4) + LocalDuration::from_secs(61));
        mgr.resolve_collisions();

        let inner = mgr.inner.lock();
        assert!(inner.collisions.is_empty());
        assert!(inner.entries[&inner.by_addr[&challenger.endpoint]].in_tried);

        let old_id = inner.by_addr[&old.endpoint];
        assert!(!inner.entries[&old_id].in_tried, "the incumbent is demoted");
        assert_eq!(inner.entries[&old_id].ref_count, 1);
    }

    #[test]
    fn test_clear_deterministic() {
        let clock = RefClock::from(LocalTime::from_secs(1000));
        let mgr = manager(23, clock.clone());

        mgr.add(
            peer([33, 33, 33, 33], 8333, 1000),
            &source([99, 1, 1, 1]),
            LocalDuration::default(),
        );
        assert_ne!(mgr.inner.lock().key, [0; 32]);

        mgr.clear(true);

        assert!(mgr.is_empty());
        assert_eq!(mgr.inner.lock().key, [0; 32]);
    }

    #[test]
    fn test_serialize_round_trip() {
        let clock = RefClock::from(LocalTime::from_secs(1_000_000));
        let mgr = manager(29, clock.clone());
        let now = clock.local_time().timestamp();

        for i in 0..50u8 {
            let addr = peer([60 + (i % 100), i, 7, 7], 8333, now);
            mgr.add(addr.clone(), &source([99, i, 1, 1]), LocalDuration::default());
            if i % 5 == 0 {
                mgr.good(&addr.endpoint, false, clock.local_time());
            }
        }
        let mut snapshot = Vec::new();
        mgr.serialize(&mut snapshot).unwrap();

        let restored = manager(31, clock.clone());
        restored.deserialize(&snapshot[..]).unwrap();
        restored.check_consistency();

        assert_eq!(restored.len(), mgr.len());
        {
            let a = mgr.inner.lock();
            let b = restored.inner.lock();
            assert_eq!(a.new_count, b.new_count);
            assert_eq!(a.tried_count, b.tried_count);
            assert_eq!(a.key, b.key);

            for endpoint in a.by_addr.keys() {
                assert!(b.by_addr.contains_key(endpoint));
            }
        }

        // With an identical bucket layout, the snapshot is reproduced
        // byte for byte.
        let mut again = Vec::new();
        restored.serialize(&mut again).unwrap();
        assert_eq!(snapshot, again);
    }

    #[test]
    fn test_deserialize_rejects_unknown_formats() {
        let clock = RefClock::from(LocalTime::from_secs(1_000_000));
        let mgr = manager(37, clock.clone());

        mgr.add(
            peer([33, 33, 33, 33], 8333, clock.local_time().timestamp()),
            &source([99, 1, 1, 1]),
            LocalDuration::default(),
        );

        match mgr.deserialize(&[9u8, 0x20][..]) {
            Err(Error::UnsupportedFormat(9)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(mgr.is_empty(), "a failed restore leaves the store empty");

        match mgr.deserialize(&[0u8][..]) {
            Err(Error::UnsupportedFormat(0)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_deserialize_corrupt() {
        let clock = RefClock::from(LocalTime::from_secs(1_000_000));
        let mgr = manager(41, clock.clone());

        // Wrong key length.
        assert!(mgr.deserialize(&[3u8, 0x19][..]).is_err());

        // Truncated stream.
        let donor = manager(43, clock.clone());
        for i in 0..10u8 {
            donor.add(
                peer([60 + i, i, 1, 1], 8333, clock.local_time().timestamp()),
                &source([99, 1, 1, 1]),
                LocalDuration::default(),
            );
        }
        let mut snapshot = Vec::new();
        donor.serialize(&mut snapshot).unwrap();

        assert!(mgr.deserialize(&snapshot[..snapshot.len() / 2]).is_err());
        assert!(mgr.is_empty());

        // A good snapshot still restores after failures.
        mgr.deserialize(&snapshot[..]).unwrap();
        assert_eq!(mgr.len(), donor.len());
    }

    #[test]
    fn test_deserialize_rebuckets_on_asmap_change() {
        let clock = RefClock::from(LocalTime::from_secs(1_000_000));
        let mgr = manager(47, clock.clone());
        let now = clock.local_time().timestamp();

        for i in 0..30u8 {
            let addr = peer([60 + i, i, 3, 3], 8333, now);
            mgr.add(addr.clone(), &source([99, i, 1, 1]), LocalDuration::default());
            if i % 4 == 0 {
                mgr.good(&addr.endpoint, false, clock.local_time());
            }
        }
        let mut snapshot = Vec::new();
        mgr.serialize(&mut snapshot).unwrap();

        // Restore under a different asmap: every entry is re-placed by its
        // source group; colliders are dropped.
        let asmap = AsMap::load(&[0u8, 0, 0][..]);
        assert!(!asmap.is_empty());

        let restored = AddrManager::new(
            Config {
                asmap,
                consistency_check: true,
            },
            fastrand::Rng::with_seed(49),
            clock.clone(),
        );
        restored.deserialize(&snapshot[..]).unwrap();
        restored.check_consistency();

        assert!(restored.len() <= mgr.len());
        assert!(!restored.is_empty());
    }

    #[quickcheck]
    fn prop_invariants_hold(seed: u64) -> bool {
        let clock = RefClock::from(LocalTime::from_secs(1_000_000));
        let mgr = AddrManager::new(
            Config::default(),
            fastrand::Rng::with_seed(seed),
            clock.clone(),
        );
        let rng = fastrand::Rng::with_seed(seed ^ 0x9e37_79b9);
        let mut known: Vec<Endpoint> = Vec::new();

        for _ in 0..100 {
            match rng.u8(0..8) {
                0..=2 => {
                    let addr = peer(
                        [rng.u8(1..223), rng.u8(..), rng.u8(..), rng.u8(1..255)],
                        8333,
                        clock.local_time().timestamp(),
                    );
                    let src = source([rng.u8(1..223), rng.u8(..), 1, 1]);
                    if mgr.add(addr.clone(), &src, LocalDuration::default()) {
                        known.push(addr.endpoint);
                    }
                }
                3 => {
                    if let Some(endpoint) = known.get(rng.usize(0..known.len().max(1))) {
                        mgr.good(endpoint, rng.bool(), clock.local_time());
                    }
                }
                4 => {
                    if let Some(endpoint) = known.get(rng.usize(0..known.len().max(1))) {
                        mgr.attempt(endpoint, rng.bool(), clock.local_time());
                    }
                }
                5 => {
                    mgr.select(rng.bool());
                }
                6 => {
                    mgr.resolve_collisions();
                }
                7 => {
                    mgr.get_addr(rng.usize(0..32), rng.usize(0..100));
                }
                _ => unreachable!(),
            }
            clock.elapse(LocalDuration::from_secs(rng.u64(0..600)));
        }
        mgr.check_consistency();
        true
    }

    #[quickcheck]
    fn prop_serialization_round_trips(seed: u64) -> bool {
        let clock = RefClock::from(LocalTime::from_secs(1_000_000));
        let mgr = AddrManager::new(
            Config::default(),
            fastrand::Rng::with_seed(seed),
            clock.clone(),
        );
        let rng = fastrand::Rng::with_seed(seed ^ 0x51ed_2701);

        for _ in 0..rng.usize(0..64) {
            let addr = peer(
                [rng.u8(1..223), rng.u8(..), rng.u8(..), rng.u8(1..255)],
                8333,
                clock.local_time().timestamp(),
            );
            let src = source([rng.u8(1..223), rng.u8(..), 1, 1]);
            if mgr.add(addr.clone(), &src, LocalDuration::default()) && rng.bool() {
                mgr.good(&addr.endpoint, false, clock.local_time());
            }
        }
        let mut snapshot = Vec::new();
        mgr.serialize(&mut snapshot).unwrap();

        let restored = AddrManager::new(
            Config::default(),
            fastrand::Rng::with_seed(seed ^ 1),
            clock.clone(),
        );
        restored.deserialize(&snapshot[..]).unwrap();
        restored.check_consistency();

        restored.len() == mgr.len()
    }
}
