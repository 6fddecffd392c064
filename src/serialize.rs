//! Snapshot and restore of the address store.
//!
//! The format is self-describing and deliberately small: entries are written
//! once each, and the new-table shape is stored as per-bucket lists of
//! indices into the entry array. The tried table, the endpoint index and
//! the random-order vector are never written; they are reconstructed on
//! restore. This keeps snapshots compact and lets the bucket parameters
//! change between versions without breaking the on-disk structure: when the
//! stored layout doesn't match (different bucket count, or a different
//! asmap fingerprint), every entry is simply re-placed from scratch.
use std::io::{Read, Write};
use std::net;

use bitcoin::consensus::encode::{Decodable, Encodable, VarInt};
use bitcoin::network::address::AddrV2;
use bitcoin::network::constants::ServiceFlags;

use crate::addr::{Endpoint, PeerAddr};
use crate::entry::{Entry, Id};
use crate::error::Error;
use crate::manager::{
    Inner, BUCKET_SIZE, NEW_BUCKETS_PER_ADDRESS, NEW_BUCKET_COUNT, TRIED_BUCKET_COUNT,
};
use crate::time::{Clock, LocalTime};

/// Format with deterministic bucket reconstruction, pre-asmap.
const FORMAT_DETERMINISTIC: u8 = 1;
/// Format carrying the asmap fingerprint.
const FORMAT_ASMAP: u8 = 2;
/// Format encoding addresses in the BIP155 style, covering non-IP networks.
const FORMAT_BIP155: u8 = 3;

/// Historical key-length byte.
const KEY_LENGTH: u8 = 0x20;

/// XORed into the serialized bucket count so that readers of the rejected
/// historical format fail instead of misinterpreting the stream.
const BUCKET_COUNT_MASK: u32 = 1 << 30;

fn write_entry<W: Write>(writer: &mut W, entry: &Entry) -> Result<(), Error> {
    entry.addr.last_seen.consensus_encode(&mut *writer)?;
    VarInt(entry.addr.services.as_u64()).consensus_encode(&mut *writer)?;
    entry.addr.endpoint.addr.consensus_encode(&mut *writer)?;
    writer.write_all(&entry.addr.endpoint.port.to_be_bytes())?;
    entry.source.consensus_encode(&mut *writer)?;
    (entry.last_success.as_secs() as i64).consensus_encode(&mut *writer)?;
    (entry.attempts as i32).consensus_encode(&mut *writer)?;

    Ok(())
}

/// Pre-BIP155 formats encode all addresses as 16 bytes, with IPv4 mapped
/// into `::ffff:0:0/96`.
fn read_legacy_address<R: Read>(reader: &mut R) -> Result<AddrV2, Error> {
    let mut octets = [0u8; 16];
    reader.read_exact(&mut octets)?;

    let ip = net::Ipv6Addr::from(octets);
    Ok(match ip.to_ipv4() {
        Some(v4) => AddrV2::Ipv4(v4),
        None => AddrV2::Ipv6(ip),
    })
}

fn read_entry<R: Read>(reader: &mut R, format: u8) -> Result<Entry, Error> {
    let last_seen = u32::consensus_decode(&mut *reader)?;
    let (services, addr) = if format >= FORMAT_BIP155 {
        let services = ServiceFlags::from(VarInt::consensus_decode(&mut *reader)?.0);
        (services, AddrV2::consensus_decode(&mut *reader)?)
    } else {
        let services = ServiceFlags::from(u64::consensus_decode(&mut *reader)?);
        (services, read_legacy_address(reader)?)
    };
    let mut port = [0u8; 2];
    reader.read_exact(&mut port)?;

    let source = if format >= FORMAT_BIP155 {
        AddrV2::consensus_decode(&mut *reader)?
    } else {
        read_legacy_address(reader)?
    };
    let last_success = i64::consensus_decode(&mut *reader)?;
    let attempts = i32::consensus_decode(&mut *reader)?;

    let endpoint = Endpoint::new(addr, u16::from_be_bytes(port));
    let mut entry = Entry::new(PeerAddr::new(endpoint, services, last_seen), source);
    entry.last_success = LocalTime::from_secs(last_success.max(0) as u64);
    entry.attempts = attempts.max(0) as u32;

    Ok(entry)
}

impl<C: Clock> Inner<C> {
    pub(crate) fn serialize<W: Write>(&self, mut writer: W) -> Result<(), Error> {
        FORMAT_BIP155.consensus_encode(&mut writer)?;
        KEY_LENGTH.consensus_encode(&mut writer)?;
        writer.write_all(&self.key)?;
        (self.new_count as u32).consensus_encode(&mut writer)?;
        (self.tried_count as u32).consensus_encode(&mut writer)?;
        ((NEW_BUCKET_COUNT as u32) ^ BUCKET_COUNT_MASK).consensus_encode(&mut writer)?;

        let mut ids: Vec<Id> = self.entries.keys().copied().collect();
        ids.sort_unstable();

        // New entries first; buckets refer to them by output position.
        let mut indices = std::collections::HashMap::new();
        for &id in ids.iter() {
            let entry = &self.entries[&id];
            if !entry.in_tried {
                assert!(indices.len() < self.new_count);
                indices.insert(id, indices.len() as u32);
                write_entry(&mut writer, entry)?;
            }
        }
        assert_eq!(indices.len(), self.new_count);

        let mut tried = 0;
        for &id in ids.iter() {
            let entry = &self.entries[&id];
            if entry.in_tried {
                assert!(tried < self.tried_count);
                write_entry(&mut writer, entry)?;
                tried += 1;
            }
        }
        assert_eq!(tried, self.tried_count);

        for bucket in self.new.iter() {
            let occupants: Vec<u32> = bucket
                .iter()
                .filter_map(|slot| slot.map(|id| indices[&id]))
                .collect();
            (occupants.len() as u32).consensus_encode(&mut writer)?;
            for index in occupants {
                index.consensus_encode(&mut writer)?;
            }
        }

        // The asmap fingerprint goes after the bucket contents, so readers
        // unaware of it stop cleanly before it.
        writer.write_all(&self.asmap.fingerprint())?;

        Ok(())
    }

    pub(crate) fn deserialize<R: Read>(&mut self, mut reader: R) -> Result<(), Error> {
        self.clear(false);

        let format = u8::consensus_decode(&mut reader)?;
        if format < FORMAT_DETERMINISTIC || format > FORMAT_BIP155 {
            return Err(Error::UnsupportedFormat(format));
        }
        let key_length = u8::consensus_decode(&mut reader)?;
        if key_length != KEY_LENGTH {
            return Err(Error::Corrupt("unexpected bucketing key length"));
        }
        let mut key = [0u8; 32];
        reader.read_exact(&mut key)?;
        self.key = key;

        let new_count = u32::consensus_decode(&mut reader)? as usize;
        let tried_count = u32::consensus_decode(&mut reader)? as usize;
        let stored_buckets = (u32::consensus_decode(&mut reader)? ^ BUCKET_COUNT_MASK) as usize;

        if new_count > NEW_BUCKET_COUNT * BUCKET_SIZE {
            return Err(Error::Corrupt("new entry count exceeds table capacity"));
        }
        if tried_count > TRIED_BUCKET_COUNT * BUCKET_SIZE {
            return Err(Error::Corrupt("tried entry count exceeds table capacity"));
        }

        for n in 0..new_count {
            let mut entry = read_entry(&mut reader, format)?;
            let id = n as Id;

            entry.random_pos = self.random.len();
            self.by_addr.insert(entry.addr.endpoint.clone(), id);
            self.random.push(id);
            self.entries.insert(id, entry);
        }
        self.id_count = new_count as Id;
        self.new_count = new_count;

        // Tried entries are always re-placed; collisions drop the loser.
        let mut lost_tried = 0;
        for _ in 0..tried_count {
            let mut entry = read_entry(&mut reader, format)?;
            let bucket = entry.tried_bucket(&self.key, &self.asmap);
            let position = entry.bucket_position(&self.key, false, bucket);

            if self.tried[bucket][position].is_none() {
                let id = self.id_count;
                self.id_count += 1;

                entry.random_pos = self.random.len();
                entry.in_tried = true;
                self.by_addr.insert(entry.addr.endpoint.clone(), id);
                self.random.push(id);
                self.tried[bucket][position] = Some(id);
                self.entries.insert(id, entry);
                self.tried_count += 1;
            } else {
                lost_tried += 1;
            }
        }

        // Which bucket each new entry was stored in.
        let mut stored_bucket: Vec<Option<usize>> = vec![None; new_count];
        for bucket in 0..stored_buckets {
            let size = u32::consensus_decode(&mut reader)? as usize;
            for _ in 0..size {
                let index = u32::consensus_decode(&mut reader)? as usize;
                if index < new_count {
                    stored_bucket[index] = Some(bucket);
                }
            }
        }

        let stored_fingerprint: [u8; 32] = if format >= FORMAT_ASMAP {
            let mut fingerprint = [0u8; 32];
            reader.read_exact(&mut fingerprint)?;
            fingerprint
        } else {
            [0; 32]
        };

        // Stored placements are only meaningful if the table shape and the
        // grouping are the same as when the snapshot was taken.
        let compatible = format >= FORMAT_ASMAP
            && stored_buckets == NEW_BUCKET_COUNT
            && stored_fingerprint == self.asmap.fingerprint();

        let mut rebucketed = false;
        for n in 0..new_count {
            let id = n as Id;
            let bucket = stored_bucket[n].unwrap_or(0);
            let (position, ref_count) = {
                let entry = &self.entries[&id];
                (
                    entry.bucket_position(&self.key, true, bucket),
                    entry.ref_count,
                )
            };
            if compatible
                && self.new[bucket][position].is_none()
                && ref_count < NEW_BUCKETS_PER_ADDRESS
            {
                self.new[bucket][position] = Some(id);
                self.entries.get_mut(&id).expect("ids resolve").ref_count += 1;
            } else {
                // Re-place by source group; colliding entries are dropped
                // by the pruning pass below.
                if !rebucketed {
                    log::info!("bucketing method changed; re-bucketing address store");
                    rebucketed = true;
                }
                let (bucket, position) = {
                    let entry = &self.entries[&id];
                    let bucket = entry.new_bucket(&self.key, &self.asmap);
                    (bucket, entry.bucket_position(&self.key, true, bucket))
                };
                if self.new[bucket][position].is_none() {
                    self.new[bucket][position] = Some(id);
                    self.entries.get_mut(&id).expect("ids resolve").ref_count += 1;
                }
            }
        }

        // Prune entries that lost all their references to collisions.
        let orphans: Vec<Id> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.in_tried && entry.ref_count == 0)
            .map(|(id, _)| *id)
            .collect();
        let lost_new = orphans.len();
        for id in orphans {
            self.delete(id);
        }
        if lost_tried + lost_new > 0 {
            log::debug!(
                "lost {} new and {} tried addresses due to collisions",
                lost_new,
                lost_tried
            );
        }
        self.consistency_check();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_legacy_entry() {
        let mut buf = Vec::new();
        1_000_000u32.consensus_encode(&mut buf).unwrap();
        ServiceFlags::NETWORK
            .as_u64()
            .consensus_encode(&mut buf)
            .unwrap();
        buf.extend_from_slice(&net::Ipv4Addr::new(33, 33, 33, 33).to_ipv6_mapped().octets());
        buf.extend_from_slice(&8333u16.to_be_bytes());
        buf.extend_from_slice(&net::Ipv4Addr::new(99, 1, 1, 1).to_ipv6_mapped().octets());
        5i64.consensus_encode(&mut buf).unwrap();
        2i32.consensus_encode(&mut buf).unwrap();

        let entry = read_entry(&mut &buf[..], FORMAT_ASMAP).unwrap();

        assert_eq!(
            entry.addr.endpoint,
            Endpoint::new(AddrV2::Ipv4(net::Ipv4Addr::new(33, 33, 33, 33)), 8333)
        );
        assert_eq!(entry.addr.services, ServiceFlags::NETWORK);
        assert_eq!(entry.addr.last_seen, 1_000_000);
        assert_eq!(entry.source, AddrV2::Ipv4(net::Ipv4Addr::new(99, 1, 1, 1)));
        assert_eq!(entry.last_success, LocalTime::from_secs(5));
        assert_eq!(entry.attempts, 2);
    }
}
