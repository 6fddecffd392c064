//! Per-endpoint store records and their keyed bucket placement.
use std::convert::TryInto;

use bitcoin::consensus::encode::{Encodable, VarInt};
use bitcoin::network::address::AddrV2;
use bitcoin_hashes::{sha256d, Hash};

use crate::addr::{group, PeerAddr};
use crate::asmap::AsMap;
use crate::manager::{
    BUCKET_SIZE, NEW_BUCKETS_PER_SOURCE, NEW_BUCKET_COUNT, TRIED_BUCKETS_PER_GROUP,
    TRIED_BUCKET_COUNT,
};
use crate::time::{LocalDuration, LocalTime};

/// Dense integer id of a store entry. The id is the single owning handle;
/// buckets, the address index and the random-order vector all refer to
/// entries by id.
pub(crate) type Id = u32;

/// The secret key bucket placement is randomized with.
pub(crate) type Key = [u8; 32];

/// Attempts without a single success after which an entry is discardable.
const RETRIES: u32 = 3;
/// Consecutive failures after which a long-unsuccessful entry is discardable.
const MAX_FAILURES: u32 = 10;
/// How long to tolerate an entry that has never succeeded recently.
const MIN_FAIL: LocalDuration = LocalDuration::from_days(7);
/// How far back we consider a gossiped timestamp to still be meaningful.
const HORIZON: LocalDuration = LocalDuration::from_days(30);
/// Allowed clock drift of gossiped timestamps into the future.
const FUTURE_DRIFT: LocalDuration = LocalDuration::from_mins(10);
/// An attempt within this window shields an entry from being discarded.
const RECENT_TRY: LocalDuration = LocalDuration::from_secs(60);
/// An attempt within this window makes an entry very unlikely to be selected.
const RECENT_ATTEMPT: LocalDuration = LocalDuration::from_mins(10);

/// 64-bit keyed short hash over length-prefixed parts.
fn hash_parts(key: &Key, parts: &[&[u8]]) -> u64 {
    let mut buf = Vec::with_capacity(96);
    buf.extend_from_slice(key);
    for part in parts {
        VarInt(part.len() as u64)
            .consensus_encode(&mut buf)
            .expect("in-memory writes don't fail");
        buf.extend_from_slice(part);
    }
    let digest = sha256d::Hash::hash(&buf).into_inner();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// A store record: one known peer address plus everything we have locally
/// observed about it.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    /// The address as gossiped: endpoint, service bits, advisory timestamp.
    pub addr: PeerAddr,
    /// Address of the peer that first told us about this endpoint.
    pub source: AddrV2,
    /// Last successful connection by us. Zero means never.
    pub last_success: LocalTime,
    /// Last connection attempt by us, successful or not. Memory only.
    pub last_try: LocalTime,
    /// Last attempt that was counted as a failure. Memory only.
    pub last_counted_attempt: LocalTime,
    /// Connection attempts since the last success.
    pub attempts: u32,
    /// Number of new-table slots referring to this entry. Memory only.
    pub ref_count: u32,
    /// Whether the entry occupies a tried-table slot. Memory only.
    pub in_tried: bool,
    /// Position of this entry's id in the random-order vector.
    pub random_pos: usize,
}

impl Entry {
    pub fn new(addr: PeerAddr, source: AddrV2) -> Self {
        Self {
            addr,
            source,
            last_success: LocalTime::default(),
            last_try: LocalTime::default(),
            last_counted_attempt: LocalTime::default(),
            attempts: 0,
            ref_count: 0,
            in_tried: false,
            random_pos: 0,
        }
    }

    /// Whether the statistics of this entry are bad enough that it can be
    /// overwritten or dropped from gossip.
    pub fn is_terrible(&self, now: LocalTime) -> bool {
        // Never remove entries tried in the last minute.
        if self.last_try != LocalTime::default() && now - self.last_try <= RECENT_TRY {
            return false;
        }
        let last_seen = self.addr.last_seen as u64;

        // Gossiped timestamp from the future.
        if last_seen > now.as_secs() + FUTURE_DRIFT.as_secs() {
            return true;
        }
        // Not seen in recent history.
        if last_seen == 0 || now.as_secs().saturating_sub(last_seen) > HORIZON.as_secs() {
            return true;
        }
        // Tried several times and never a success.
        if self.last_success == LocalTime::default() && self.attempts >= RETRIES {
            return true;
        }
        // Many successive failures over the past week.
        if now - self.last_success > MIN_FAIL && self.attempts >= MAX_FAILURES {
            return true;
        }
        false
    }

    /// The relative chance this entry should be given when selecting peers
    /// to connect to.
    pub fn chance(&self, now: LocalTime) -> f64 {
        let mut chance = 1.0;

        // Deprioritize very recent attempts.
        if now - self.last_try < RECENT_ATTEMPT {
            chance *= 0.01;
        }
        // Deprioritize 66% after each failed attempt, but at most 1/28th
        // to avoid the search taking forever or overly penalizing outages.
        chance *= 0.66f64.powi(self.attempts.min(8) as i32);

        chance
    }

    /// The tried-table bucket this entry belongs to. A single address group
    /// can reach at most [`TRIED_BUCKETS_PER_GROUP`] tried buckets.
    pub fn tried_bucket(&self, key: &Key, asmap: &AsMap) -> usize {
        let identity = self.addr.endpoint.identity();
        let group = self.addr.endpoint.group(asmap);

        let h1 = hash_parts(key, &[&identity]);
        let h2 = hash_parts(
            key,
            &[&group, &(h1 % TRIED_BUCKETS_PER_GROUP).to_le_bytes()],
        );
        (h2 % TRIED_BUCKET_COUNT as u64) as usize
    }

    /// The new-table bucket this entry belongs to, given the source that
    /// announced it. A single source group can seed at most
    /// [`NEW_BUCKETS_PER_SOURCE`] of the new buckets.
    pub fn new_bucket_from(&self, key: &Key, source: &AddrV2, asmap: &AsMap) -> usize {
        let addr_group = self.addr.endpoint.group(asmap);
        let source_group = group(source, asmap);

        let h1 = hash_parts(key, &[&addr_group, &source_group]);
        let h2 = hash_parts(
            key,
            &[&source_group, &(h1 % NEW_BUCKETS_PER_SOURCE).to_le_bytes()],
        );
        (h2 % NEW_BUCKET_COUNT as u64) as usize
    }

    /// The new-table bucket this entry belongs to, using its own source.
    pub fn new_bucket(&self, key: &Key, asmap: &AsMap) -> usize {
        self.new_bucket_from(key, &self.source, asmap)
    }

    /// The slot within a bucket where this entry belongs.
    pub fn bucket_position(&self, key: &Key, new: bool, bucket: usize) -> usize {
        let identity = self.addr.endpoint.identity();
        let h = hash_parts(
            key,
            &[
                if new { b"N" } else { b"K" },
                &(bucket as u32).to_le_bytes(),
                &identity,
            ],
        );
        (h % BUCKET_SIZE as u64) as usize
    }
}
