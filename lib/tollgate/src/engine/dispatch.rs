// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The dispatch loop: classify, translate, submit.
//!
//! A [`Gate`] ties the translation table, the authorization set, and
//! the current address bundle to a packet source and sink. Any number
//! of workers run [`Gate::run_worker`] concurrently; all verdict
//! logic lives in [`Gate::process`], which the workers share with the
//! tests. Failures on the data path are never fatal: a packet that
//! cannot be handled is dropped, counted, and logged, and the loop
//! moves on.

use super::nat;
use super::nat::NoMapping;
use super::nat::RedirectTable;
use super::nat::TableFull;
use super::oracle::AuthTable;
use super::oracle::PortalAddrs;
use super::packet::PacketError;
use super::packet::PacketView;
use super::time::Moment;
use crate::api::AddressBundle;
use crate::api::Ipv4Addr;
use crate::api::RoutingDomain;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;

/// Attempts per packet before a busy sink counts as a failure.
const SUBMIT_RETRY_MAX: usize = 3;

/// Where a worker takes its next inbound packet from.
///
/// `worker` identifies the calling thread so a source may shard
/// across per-worker queues. A source is free to block briefly;
/// `None` means "nothing right now" and the worker comes straight
/// back around, checking for shutdown first.
pub trait PacketSource: Send + Sync {
    fn next_packet(&self, worker: usize) -> Option<PacketView>;
}

/// Where a worker hands each packet it has decided to send.
pub trait PacketSink: Send + Sync {
    fn submit_packet(&self, worker: usize, pkt: &PacketView) -> SubmitResult;
}

/// A sink's verdict on one submit attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitResult {
    /// The packet is on its way.
    Sent,

    /// Transient congestion; worth another try.
    Retry,

    /// This packet can never be sent; give up now.
    Fatal,
}

/// Why a packet was dropped rather than sent.
#[derive(Debug)]
pub enum DropReason {
    Malformed(PacketError),
    TableFull,
    NoMapping,
    ReturnAddr { src: Ipv4Addr, dst: Ipv4Addr },
    ReturnFragment,
    ReturnPort { port: u16 },
    SubmitFailed,
}

impl Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed(err) => write!(f, "malformed packet: {err}"),
            Self::TableFull => write!(f, "translation table full"),
            Self::NoMapping => {
                write!(f, "no live mapping for the return port")
            }
            Self::ReturnAddr { src, dst } => {
                write!(f, "unexpected return pair {src} -> {dst}")
            }
            Self::ReturnFragment => write!(f, "fragmented return traffic"),
            Self::ReturnPort { port } => {
                write!(f, "return port {port} outside the translated range")
            }
            Self::SubmitFailed => write!(f, "submit failed"),
        }
    }
}

/// What became of one packet.
#[derive(Debug)]
pub enum ProcessResult {
    /// Translated subscriber traffic, now addressed to the portal.
    Forward,

    /// A translated portal reply, now addressed to the subscriber.
    Reverse,

    /// Authorized or portal-bound traffic, passed through untouched.
    Pass,

    /// Not sent; the reason says why.
    Drop { reason: DropReason },
}

/// Cumulative dispatch counters, shared by all workers of a gate.
#[derive(Default)]
pub struct DispatchStats {
    in_pkts_subscriber: AtomicU64,
    in_pkts_portal: AtomicU64,
    fwd_translated: AtomicU64,
    fwd_fragments: AtomicU64,
    rev_translated: AtomicU64,
    passthrough: AtomicU64,
    drop_malformed: AtomicU64,
    drop_table_full: AtomicU64,
    drop_no_mapping: AtomicU64,
    drop_return_addr: AtomicU64,
    drop_return_fragment: AtomicU64,
    drop_return_port: AtomicU64,
    drop_submit_failed: AtomicU64,
    submit_retries: AtomicU64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            in_pkts_subscriber: self.in_pkts_subscriber.load(Ordering::Relaxed),
            in_pkts_portal: self.in_pkts_portal.load(Ordering::Relaxed),
            fwd_translated: self.fwd_translated.load(Ordering::Relaxed),
            fwd_fragments: self.fwd_fragments.load(Ordering::Relaxed),
            rev_translated: self.rev_translated.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            drop_malformed: self.drop_malformed.load(Ordering::Relaxed),
            drop_table_full: self.drop_table_full.load(Ordering::Relaxed),
            drop_no_mapping: self.drop_no_mapping.load(Ordering::Relaxed),
            drop_return_addr: self.drop_return_addr.load(Ordering::Relaxed),
            drop_return_fragment: self
                .drop_return_fragment
                .load(Ordering::Relaxed),
            drop_return_port: self.drop_return_port.load(Ordering::Relaxed),
            drop_submit_failed: self
                .drop_submit_failed
                .load(Ordering::Relaxed),
            submit_retries: self.submit_retries.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`DispatchStats`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct DispatchSnapshot {
    pub in_pkts_subscriber: u64,
    pub in_pkts_portal: u64,
    pub fwd_translated: u64,
    pub fwd_fragments: u64,
    pub rev_translated: u64,
    pub passthrough: u64,
    pub drop_malformed: u64,
    pub drop_table_full: u64,
    pub drop_no_mapping: u64,
    pub drop_return_addr: u64,
    pub drop_return_fragment: u64,
    pub drop_return_port: u64,
    pub drop_submit_failed: u64,
    pub submit_retries: u64,
}

/// One translation gate: the shared state a set of workers drives
/// packets through.
pub struct Gate<S, K> {
    name: String,
    log: Logger,
    table: RedirectTable,
    auth: Arc<AuthTable>,
    addrs: Arc<PortalAddrs>,
    source: S,
    sink: K,
    stats: DispatchStats,
    shutdown: AtomicBool,
}

impl<S: PacketSource, K: PacketSink> Gate<S, K> {
    pub fn new(
        name: &str,
        log: Logger,
        table: RedirectTable,
        auth: Arc<AuthTable>,
        addrs: Arc<PortalAddrs>,
        source: S,
        sink: K,
    ) -> Self {
        let log = log.new(o!("gate" => name.to_string()));
        Self {
            name: name.to_string(),
            log,
            table,
            auth,
            addrs,
            source,
            sink,
            stats: DispatchStats::default(),
            shutdown: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn table(&self) -> &RedirectTable {
        &self.table
    }

    #[inline]
    pub fn auth(&self) -> &AuthTable {
        &self.auth
    }

    #[inline]
    pub fn addrs(&self) -> &PortalAddrs {
        &self.addrs
    }

    #[inline]
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Ask every worker to wind down after its current packet.
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn drop_pkt(&self, reason: DropReason) -> ProcessResult {
        let counter = match &reason {
            DropReason::Malformed(_) => &self.stats.drop_malformed,
            DropReason::TableFull => &self.stats.drop_table_full,
            DropReason::NoMapping => &self.stats.drop_no_mapping,
            DropReason::ReturnAddr { .. } => &self.stats.drop_return_addr,
            DropReason::ReturnFragment => &self.stats.drop_return_fragment,
            DropReason::ReturnPort { .. } => &self.stats.drop_return_port,
            DropReason::SubmitFailed => &self.stats.drop_submit_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        ProcessResult::Drop { reason }
    }

    /// Decide one packet's fate and rewrite it in place as needed.
    pub fn process(
        &self,
        pkt: &mut PacketView,
        bundle: &AddressBundle,
        now: Moment,
    ) -> ProcessResult {
        match pkt.domain() {
            RoutingDomain::Subscriber => self.process_in(pkt, bundle, now),
            RoutingDomain::Portal => self.process_out(pkt, bundle, now),
        }
    }

    /// Subscriber-side traffic: redirect unauthorized flows at the
    /// portal, pass everything else.
    fn process_in(
        &self,
        pkt: &mut PacketView,
        bundle: &AddressBundle,
        now: Moment,
    ) -> ProcessResult {
        self.stats.in_pkts_subscriber.fetch_add(1, Ordering::Relaxed);

        let mut parsed = match pkt.parse() {
            Ok(parsed) => parsed,
            Err(err) => return self.drop_pkt(DropReason::Malformed(err)),
        };

        // Traffic aimed at the portal itself, or from an authorized
        // subscriber, passes untouched whatever its protocol.
        if parsed.ip.dst() == bundle.portal_ip
            || self.auth.is_authorized(parsed.ip.src())
        {
            self.stats.passthrough.fetch_add(1, Ordering::Relaxed);
            return ProcessResult::Pass;
        }

        // A non-leading fragment has no transport header; rewrite
        // the addresses and let the portal's reassembly sort it out.
        if parsed.ip.frag_offset() != 0 {
            nat::translate_fragment(&mut parsed, bundle);
            self.stats.fwd_fragments.fetch_add(1, Ordering::Relaxed);
            return ProcessResult::Forward;
        }

        let mut full = match parsed.parse_tcp() {
            Ok(full) => full,
            Err(err) => return self.drop_pkt(DropReason::Malformed(err)),
        };

        match self.table.translate_forward(&mut full, bundle, now) {
            Ok(_) => {
                self.stats.fwd_translated.fetch_add(1, Ordering::Relaxed);
                ProcessResult::Forward
            }
            Err(TableFull) => self.drop_pkt(DropReason::TableFull),
        }
    }

    /// Portal-side traffic: only the portal's own replies to the
    /// translator go back through, and only to a live mapping.
    fn process_out(
        &self,
        pkt: &mut PacketView,
        bundle: &AddressBundle,
        now: Moment,
    ) -> ProcessResult {
        self.stats.in_pkts_portal.fetch_add(1, Ordering::Relaxed);

        let parsed = match pkt.parse() {
            Ok(parsed) => parsed,
            Err(err) => return self.drop_pkt(DropReason::Malformed(err)),
        };

        if parsed.ip.src() != bundle.portal_ip
            || parsed.ip.dst() != bundle.translator_ip
        {
            let reason = DropReason::ReturnAddr {
                src: parsed.ip.src(),
                dst: parsed.ip.dst(),
            };
            return self.drop_pkt(reason);
        }

        // The reverse map lives in the TCP destination port, which a
        // fragment either lacks or will have reassembled elsewhere.
        if parsed.ip.is_fragment() {
            return self.drop_pkt(DropReason::ReturnFragment);
        }

        let mut full = match parsed.parse_tcp() {
            Ok(full) => full,
            Err(err) => return self.drop_pkt(DropReason::Malformed(err)),
        };

        let port = full.tcp.dst_port();
        if self.table.slot_of_port(port).is_none() {
            return self.drop_pkt(DropReason::ReturnPort { port });
        }

        match self.table.translate_reverse(&mut full, now) {
            Ok(()) => {
                self.stats.rev_translated.fetch_add(1, Ordering::Relaxed);
                ProcessResult::Reverse
            }
            Err(NoMapping) => self.drop_pkt(DropReason::NoMapping),
        }
    }

    /// The worker body: pull, process, submit, until shutdown.
    pub fn run_worker(&self, worker: usize) {
        let log = self.log.new(o!("worker" => worker));
        info!(log, "worker online");

        let (mut epoch, mut bundle) = self.addrs.snapshot();

        while !self.shutdown_requested() {
            let Some(mut pkt) = self.source.next_packet(worker) else {
                continue;
            };

            // Pick up address changes between packets, never during.
            if self.addrs.epoch() != epoch {
                (epoch, bundle) = self.addrs.snapshot();
                debug!(log, "address bundle reloaded";
                    "epoch" => epoch, "addrs" => %bundle);
            }

            let now = Moment::now();
            match self.process(&mut pkt, &bundle, now) {
                ProcessResult::Forward
                | ProcessResult::Reverse
                | ProcessResult::Pass => self.submit(worker, &log, &pkt),
                ProcessResult::Drop { reason } => {
                    warn!(log, "packet dropped"; "reason" => %reason);
                }
            }
        }

        info!(log, "worker offline");
    }

    fn submit(&self, worker: usize, log: &Logger, pkt: &PacketView) {
        for _ in 0..SUBMIT_RETRY_MAX {
            match self.sink.submit_packet(worker, pkt) {
                SubmitResult::Sent => return,
                SubmitResult::Retry => {
                    self.stats.submit_retries.fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                }
                SubmitResult::Fatal => break,
            }
        }

        self.stats.drop_submit_failed.fetch_add(1, Ordering::Relaxed);
        warn!(log, "packet dropped"; "reason" => %DropReason::SubmitFailed);
    }
}

/// The dispatch threads driving one gate.
pub struct WorkerPool<S: PacketSource + 'static, K: PacketSink + 'static> {
    gate: Arc<Gate<S, K>>,
    workers: Vec<JoinHandle<()>>,
}

impl<S: PacketSource + 'static, K: PacketSink + 'static> WorkerPool<S, K> {
    /// Spawn `workers` dispatch threads over `gate`.
    pub fn spawn(gate: Arc<Gate<S, K>>, workers: usize) -> io::Result<Self> {
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let gate = Arc::clone(&gate);
            let handle = thread::Builder::new()
                .name(format!("tollgate-worker-{i}"))
                .spawn(move || gate.run_worker(i))?;
            handles.push(handle);
        }
        Ok(Self { gate, workers: handles })
    }

    pub fn gate(&self) -> &Arc<Gate<S, K>> {
        &self.gate
    }

    /// Signal shutdown and wait for every worker to finish out.
    pub fn shutdown(self) {
        self.gate.signal_shutdown();
        for handle in self.workers {
            handle.join().expect("dispatch worker panicked");
        }
    }
}
