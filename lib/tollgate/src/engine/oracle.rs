// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Control state the workers consult on every packet: which
//! subscriber addresses are authorized to pass untranslated, and
//! which addresses the translator and portal currently answer on.
//!
//! Both structures are read constantly and written rarely, so each
//! is shaped for the read side: the authorization set fronts its
//! tree with an octet prefilter, and the address bundle hands out
//! `Arc` snapshots that workers revalidate by epoch instead of
//! locking per packet.

use crate::api::AddressBundle;
use crate::api::Ipv4Addr;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// The set of subscriber addresses currently authorized to reach
/// past the portal.
///
/// Grants and revocations arrive from the control plane; lookups
/// happen per packet. The per-position octet counts in front of the
/// set settle the common miss cheaply: if any of the four positions
/// has a zero count for the candidate's octet, no member can match
/// and the tree is never consulted.
pub struct AuthTable {
    inner: RwLock<AuthInner>,
}

struct AuthInner {
    addrs: BTreeSet<Ipv4Addr>,
    /// How many members carry each octet value at each position.
    octets: [[u32; 256]; 4],
}

impl AuthTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(AuthInner {
                addrs: BTreeSet::new(),
                octets: [[0; 256]; 4],
            }),
        }
    }

    /// Authorize `addr`. Returns `false` if it was already
    /// authorized.
    pub fn insert(&self, addr: Ipv4Addr) -> bool {
        let mut inner =
            self.inner.write().expect("authorization table poisoned");
        if !inner.addrs.insert(addr) {
            return false;
        }
        for (pos, octet) in addr.bytes().iter().enumerate() {
            inner.octets[pos][usize::from(*octet)] += 1;
        }
        true
    }

    /// Revoke `addr`. Returns `false` if it was not authorized.
    pub fn remove(&self, addr: Ipv4Addr) -> bool {
        let mut inner =
            self.inner.write().expect("authorization table poisoned");
        if !inner.addrs.remove(&addr) {
            return false;
        }
        for (pos, octet) in addr.bytes().iter().enumerate() {
            inner.octets[pos][usize::from(*octet)] -= 1;
        }
        true
    }

    /// May traffic from `addr` pass untranslated?
    pub fn is_authorized(&self, addr: Ipv4Addr) -> bool {
        let inner =
            self.inner.read().expect("authorization table poisoned");
        for (pos, octet) in addr.bytes().iter().enumerate() {
            if inner.octets[pos][usize::from(*octet)] == 0 {
                return false;
            }
        }
        inner.addrs.contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("authorization table poisoned").addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AuthTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The current translator/portal address bundle, replaced wholesale
/// by the control plane.
///
/// The epoch counts publications. A worker keeps an `Arc` snapshot
/// and compares epochs once per loop pass, reloading on mismatch.
/// The epoch is read before the lock is taken, so a racing update
/// can only make a snapshot look older than it is; that costs one
/// extra reload and nothing else.
pub struct PortalAddrs {
    epoch: AtomicU64,
    bundle: Mutex<Arc<AddressBundle>>,
}

impl PortalAddrs {
    pub fn new(bundle: AddressBundle) -> Self {
        Self {
            epoch: AtomicU64::new(1),
            bundle: Mutex::new(Arc::new(bundle)),
        }
    }

    /// Publish a new bundle, obsoleting every held snapshot.
    pub fn set(&self, bundle: AddressBundle) {
        let mut cur = self.bundle.lock().expect("address bundle poisoned");
        *cur = Arc::new(bundle);
        self.epoch.fetch_add(1, Ordering::Release);
    }

    /// The current publication epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// The current bundle, tagged with the epoch it was read under.
    pub fn snapshot(&self) -> (u64, Arc<AddressBundle>) {
        let epoch = self.epoch.load(Ordering::Acquire);
        let bundle = self.bundle.lock().expect("address bundle poisoned");
        (epoch, Arc::clone(&bundle))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn grant_and_revoke() {
        let auth = AuthTable::new();
        assert!(auth.is_empty());
        assert!(!auth.is_authorized(addr("192.168.1.5")));

        assert!(auth.insert(addr("192.168.1.5")));
        assert!(!auth.insert(addr("192.168.1.5")));
        assert!(auth.is_authorized(addr("192.168.1.5")));
        assert_eq!(auth.len(), 1);

        assert!(auth.remove(addr("192.168.1.5")));
        assert!(!auth.remove(addr("192.168.1.5")));
        assert!(!auth.is_authorized(addr("192.168.1.5")));
    }

    #[test]
    fn revoke_keeps_octet_siblings() {
        let auth = AuthTable::new();
        auth.insert(addr("10.1.1.1"));
        auth.insert(addr("10.1.1.2"));

        // Removing one member must not strand the other behind the
        // prefilter, even though they share three octet values.
        auth.remove(addr("10.1.1.1"));
        assert!(auth.is_authorized(addr("10.1.1.2")));
        assert!(!auth.is_authorized(addr("10.1.1.1")));
    }

    #[test]
    fn prefilter_rejects_unseen_octets() {
        let auth = AuthTable::new();
        auth.insert(addr("10.1.1.1"));

        // First octet 172 appears nowhere in the set.
        assert!(!auth.is_authorized(addr("172.16.1.1")));
        // All octet values present, but in no single member.
        auth.insert(addr("10.2.2.2"));
        assert!(!auth.is_authorized(addr("10.1.2.2")));
    }

    #[test]
    fn epoch_advances_on_publish() {
        let addrs = PortalAddrs::new(AddressBundle::new(
            addr("10.0.0.1"),
            addr("10.0.0.2"),
            80,
        ));
        let (e0, b0) = addrs.snapshot();
        assert_eq!(e0, addrs.epoch());
        assert_eq!(b0.portal_port, 80);

        addrs.set(AddressBundle::new(
            addr("10.0.0.1"),
            addr("10.0.0.9"),
            8080,
        ));
        assert_eq!(addrs.epoch(), e0 + 1);

        let (e1, b1) = addrs.snapshot();
        assert_eq!(e1, e0 + 1);
        assert_eq!(b1.portal_ip, addr("10.0.0.9"));
        assert_eq!(b1.portal_port, 8080);
        // The old snapshot is unaffected, merely stale.
        assert_eq!(b0.portal_ip, addr("10.0.0.2"));
    }
}
