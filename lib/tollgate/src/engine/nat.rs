// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The redirect translation table.
//!
//! A fixed-capacity array of translation slots plus a flow lookup
//! index. Slot `i` corresponds 1:1 to translated local port
//! `base_port + i`, which is what lets reverse translation find its
//! slot from a destination port alone. Slots are reclaimed by expiry
//! only: nothing tracks connection teardown, a mapping simply ages
//! out and gets overwritten by the next allocation that reaches it.
//!
//! Locking: the table is split into shards. Each shard's mutex owns a
//! contiguous range of slots and the index entries pointing into that
//! range, so an index entry can never be touched without holding the
//! lock that also guards its slot. Hot paths (refresh, reverse) take
//! exactly one shard lock. Allocation takes the cursor lock, then
//! every shard lock in ascending order, re-checks the flow under the
//! full lock set, and only then claims a slot. The fixed acquisition
//! order rules out deadlock; the re-check keeps two racing workers
//! from giving one flow two slots.

use super::checksum;
use super::ip4::Ipv4Hdr;
use super::packet::FlowKey;
use super::packet::Parsed;
use super::packet::ParsedTcp;
use super::tcp::TcpHdr;
use super::time::MILLIS;
use super::time::Moment;
use crate::api::AddressBundle;
use crate::api::Ipv4Addr;
use core::num::NonZeroU32;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use thiserror::Error;

pub const REDIRECT_DEF_EXPIRE_SECS: u64 = 60;
pub const REDIRECT_DEF_TTL: Ttl = Ttl::new_seconds(REDIRECT_DEF_EXPIRE_SECS);
pub const REDIRECT_DEF_SLOTS: NonZeroU32 = NonZeroU32::new(1_000).unwrap();
pub const REDIRECT_DEF_BASE_PORT: u16 = 10_000;

/// Upper bound on the number of shards; small tables use fewer.
const SHARDS_MAX: u32 = 8;

/// The Time To Live in milliseconds.
#[derive(Clone, Copy, Debug)]
pub struct Ttl(u64);

impl Ttl {
    pub fn as_seconds(&self) -> u64 {
        self.0 / MILLIS
    }

    pub fn as_milliseconds(&self) -> u64 {
        self.0
    }

    /// Is `last_hit` expired?
    pub fn is_expired(&self, last_hit: Moment, now: Moment) -> bool {
        now.delta_as_millis(last_hit) >= self.0
    }

    /// Create a new TTL based on seconds.
    pub const fn new_seconds(seconds: u64) -> Self {
        Ttl(seconds * MILLIS)
    }

    /// Create a new TTL based on milliseconds.
    pub const fn new_millis(millis: u64) -> Self {
        Ttl(millis)
    }
}

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("translation table full")]
pub struct TableFull;

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("no live mapping for the translated port")]
pub struct NoMapping;

/// One translation entry: the original four-tuple plus its refresh
/// time. A slot that has never been hit counts as expired, so a
/// freshly built table is fully claimable.
#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    last_hit: Option<Moment>,
}

impl Slot {
    fn key(&self) -> FlowKey {
        FlowKey { src: self.src, dst: self.dst, src_port: self.src_port }
    }

    fn is_expired(&self, ttl: Ttl, now: Moment) -> bool {
        self.last_hit.map_or(true, |hit| ttl.is_expired(hit, now))
    }
}

struct Shard {
    /// Global index of the first slot this shard owns.
    base: u32,
    slots: Vec<Slot>,
    /// FlowKey to global slot index, covering only this shard's
    /// slots.
    index: BTreeMap<FlowKey, u32>,
}

impl Shard {
    fn slot(&self, idx: u32) -> &Slot {
        &self.slots[(idx - self.base) as usize]
    }

    fn slot_mut(&mut self, idx: u32) -> &mut Slot {
        &mut self.slots[(idx - self.base) as usize]
    }
}

/// The fixed-capacity forward/reverse translation table.
pub struct RedirectTable {
    capacity: u32,
    base_port: u16,
    ttl: Ttl,
    per_shard: u32,
    shards: Vec<Mutex<Shard>>,
    /// Rotating allocation cursor. Owned by the table value, never
    /// shared between instances, and advanced only past slots just
    /// claimed.
    next_free: Mutex<u32>,
}

impl RedirectTable {
    /// Create a table of `slots` entries mapping to the translated
    /// port range starting at `base_port`.
    ///
    /// # Panics
    ///
    /// Panics if the port range `base_port .. base_port + slots`
    /// overruns the 16-bit port space.
    pub fn new(slots: NonZeroU32, base_port: u16, ttl: Option<Ttl>) -> Self {
        let capacity = slots.get();
        let ports_avail = u32::from(u16::MAX) - u32::from(base_port) + 1;
        assert!(
            capacity <= ports_avail,
            "{capacity} slots overrun the port space above {base_port}",
        );

        let shard_count = capacity.min(SHARDS_MAX);
        let per_shard = capacity.div_ceil(shard_count);
        let mut shards = Vec::new();
        let mut base = 0;
        while base < capacity {
            let len = per_shard.min(capacity - base);
            shards.push(Mutex::new(Shard {
                base,
                slots: vec![Slot::default(); len as usize],
                index: BTreeMap::new(),
            }));
            base += len;
        }

        Self {
            capacity,
            base_port,
            ttl: ttl.unwrap_or(REDIRECT_DEF_TTL),
            per_shard,
            shards,
            next_free: Mutex::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    #[inline]
    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    /// Map a destination port back to a slot index, if it lies in the
    /// translated range.
    pub fn slot_of_port(&self, port: u16) -> Option<u32> {
        let idx = u32::from(port).checked_sub(u32::from(self.base_port))?;
        (idx < self.capacity).then_some(idx)
    }

    #[inline]
    fn port_of(&self, idx: u32) -> u16 {
        self.base_port + idx as u16
    }

    #[inline]
    fn shard_of(&self, idx: u32) -> usize {
        (idx / self.per_shard) as usize
    }

    fn lock_shard(&self, i: usize) -> MutexGuard<'_, Shard> {
        // A poisoned shard means a worker died mid-update and the
        // table can no longer be trusted.
        self.shards[i].lock().expect("translation shard poisoned")
    }

    /// Translate a subscriber-originated segment toward the portal.
    ///
    /// Reuses (and refreshes) the flow's slot when one is live,
    /// otherwise claims an expired slot. On success the packet has
    /// been rewritten and the assigned translated port is returned.
    /// The packet is untouched on `TableFull`.
    pub fn translate_forward(
        &self,
        pkt: &mut ParsedTcp,
        bundle: &AddressBundle,
        now: Moment,
    ) -> Result<u16, TableFull> {
        let key = pkt.flow_key();

        // Fast path: the flow already owns a slot.
        for i in 0..self.shards.len() {
            let mut guard = self.lock_shard(i);
            let Some(idx) = guard.index.get(&key).copied() else {
                continue;
            };

            if guard.slot(idx).is_expired(self.ttl, now) {
                // The slot aged out with its index entry still in
                // place. Clear the entry and allocate afresh.
                guard.index.remove(&key);
                break;
            }

            assert_eq!(
                guard.slot(idx).key(),
                key,
                "index entry points at a mismatched slot",
            );
            guard.slot_mut(idx).last_hit = Some(now);
            drop(guard);

            let port = self.port_of(idx);
            rewrite_forward(pkt, bundle, port);
            return Ok(port);
        }

        let orig_dst_port = pkt.tcp.dst_port();
        let idx = self.claim(key, orig_dst_port, now)?;
        let port = self.port_of(idx);
        rewrite_forward(pkt, bundle, port);
        Ok(port)
    }

    /// Claim an expired slot for `key`, starting the scan at the
    /// rotating cursor.
    fn claim(
        &self,
        key: FlowKey,
        orig_dst_port: u16,
        now: Moment,
    ) -> Result<u32, TableFull> {
        // Lock order: cursor, then shards in ascending slot order.
        let mut cursor =
            self.next_free.lock().expect("allocation cursor poisoned");
        let mut guards: Vec<MutexGuard<'_, Shard>> =
            (0..self.shards.len()).map(|i| self.lock_shard(i)).collect();

        // A racing worker may have installed this flow after our
        // probe missed. At most one entry can exist table-wide.
        for guard in guards.iter_mut() {
            let Some(idx) = guard.index.get(&key).copied() else {
                continue;
            };
            if guard.slot(idx).is_expired(self.ttl, now) {
                guard.index.remove(&key);
            } else {
                guard.slot_mut(idx).last_hit = Some(now);
                return Ok(idx);
            }
            break;
        }

        let start = *cursor;
        for probe in 0..self.capacity {
            let idx = (start + probe) % self.capacity;
            let guard = &mut guards[self.shard_of(idx)];
            if !guard.slot(idx).is_expired(self.ttl, now) {
                continue;
            }

            // Evict the previous occupant's index entry, but only if
            // it still points here; the same flow may have moved to a
            // newer slot already.
            let old_key = guard.slot(idx).key();
            if guard.index.get(&old_key) == Some(&idx) {
                guard.index.remove(&old_key);
            }

            let slot = guard.slot_mut(idx);
            slot.src = key.src;
            slot.dst = key.dst;
            slot.src_port = key.src_port;
            slot.dst_port = orig_dst_port;
            slot.last_hit = Some(now);
            guard.index.insert(key, idx);

            // Advance only past the claim so repeated allocations
            // spread across the table instead of rescanning from
            // zero.
            *cursor = (idx + 1) % self.capacity;
            return Ok(idx);
        }

        Err(TableFull)
    }

    /// Translate a portal reply back toward the original subscriber.
    ///
    /// The destination port encodes the slot; an expired or never
    /// used slot answers `NoMapping` and the packet is untouched.
    /// Reverse traffic refreshes expiry just like forward traffic;
    /// it never allocates or frees anything.
    pub fn translate_reverse(
        &self,
        pkt: &mut ParsedTcp,
        now: Moment,
    ) -> Result<(), NoMapping> {
        let Some(idx) = self.slot_of_port(pkt.tcp.dst_port()) else {
            return Err(NoMapping);
        };

        let orig = {
            let mut guard = self.lock_shard(self.shard_of(idx));
            let slot = guard.slot_mut(idx);
            if slot.is_expired(self.ttl, now) {
                return Err(NoMapping);
            }
            slot.last_hit = Some(now);
            *slot
        };

        rewrite_reverse(pkt, &orig);
        Ok(())
    }

    /// Resolve a flow to its translated port, live mappings only.
    pub fn lookup(&self, key: &FlowKey, now: Moment) -> Option<u16> {
        for i in 0..self.shards.len() {
            let guard = self.lock_shard(i);
            if let Some(idx) = guard.index.get(key).copied() {
                if guard.slot(idx).is_expired(self.ttl, now) {
                    return None;
                }
                return Some(self.port_of(idx));
            }
        }
        None
    }

    /// Count slots currently holding a live mapping.
    pub fn num_live(&self, now: Moment) -> u32 {
        let mut live = 0;
        for i in 0..self.shards.len() {
            let guard = self.lock_shard(i);
            live += guard
                .slots
                .iter()
                .filter(|slot| !slot.is_expired(self.ttl, now))
                .count() as u32;
        }
        live
    }
}

/// Rewrite a non-leading fragment: IP addresses and IP checksum
/// only. There is no transport header to touch and no table state
/// involved, so this cannot fail.
pub fn translate_fragment(pkt: &mut Parsed, bundle: &AddressBundle) {
    set_addrs(&mut pkt.ip, None, bundle.translator_ip, bundle.portal_ip);
}

fn rewrite_forward(pkt: &mut ParsedTcp, bundle: &AddressBundle, port: u16) {
    set_addrs(
        &mut pkt.ip,
        Some(&mut pkt.tcp),
        bundle.translator_ip,
        bundle.portal_ip,
    );
    set_ports(&mut pkt.tcp, port, bundle.portal_port);
}

fn rewrite_reverse(pkt: &mut ParsedTcp, slot: &Slot) {
    // The reply heads back to the subscriber looking like it came
    // from the host they originally dialed.
    set_addrs(&mut pkt.ip, Some(&mut pkt.tcp), slot.dst, slot.src);
    set_ports(&mut pkt.tcp, slot.dst_port, slot.src_port);
}

// The address pair is one checksum field group: both checksums see
// the same eight rewritten bytes, the TCP one via the pseudo-header.
fn set_addrs(
    ip: &mut Ipv4Hdr,
    tcp: Option<&mut TcpHdr>,
    new_src: Ipv4Addr,
    new_dst: Ipv4Addr,
) {
    let mut old = [0u8; 8];
    old[0..4].copy_from_slice(&ip.src().bytes());
    old[4..8].copy_from_slice(&ip.dst().bytes());
    let mut new = [0u8; 8];
    new[0..4].copy_from_slice(&new_src.bytes());
    new[4..8].copy_from_slice(&new_dst.bytes());

    ip.set_csum(checksum::adjust(ip.csum(), &old, &new));
    if let Some(tcp) = tcp {
        tcp.set_csum(checksum::adjust(tcp.csum(), &old, &new));
    }
    ip.set_src(new_src);
    ip.set_dst(new_dst);
}

// The port pair is the other field group; only the TCP checksum
// covers it.
fn set_ports(tcp: &mut TcpHdr, new_src_port: u16, new_dst_port: u16) {
    let mut old = [0u8; 4];
    old[0..2].copy_from_slice(&tcp.src_port().to_be_bytes());
    old[2..4].copy_from_slice(&tcp.dst_port().to_be_bytes());
    let mut new = [0u8; 4];
    new[0..2].copy_from_slice(&new_src_port.to_be_bytes());
    new[2..4].copy_from_slice(&new_dst_port.to_be_bytes());

    tcp.set_csum(checksum::adjust(tcp.csum(), &old, &new));
    tcp.set_src_port(new_src_port);
    tcp.set_dst_port(new_dst_port);
}
