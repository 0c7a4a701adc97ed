// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Common routines for integration tests.

// This type of pedantry is more trouble than its worth here.
#![allow(dead_code)]

use slog::Drain;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::mpsc;
use std::time::Duration;
use tollgate::api::PROTO_TCP;
use tollgate::engine::ip4::Ipv4HdrRaw;
use tollgate::engine::tcp::TCP_FLAG_ACK;
use tollgate::engine::tcp::TCP_FLAG_PSH;
use tollgate::engine::tcp::TcpHdrRaw;
use zerocopy::IntoBytes;

// Let's make our lives easier and pub use a bunch of stuff.
pub use slog::Logger;
pub use slog::o;
pub use std::num::NonZeroU32;
pub use std::sync::Arc;
pub use tollgate::api::AddressBundle;
pub use tollgate::api::Ipv4Addr;
pub use tollgate::api::RoutingDomain;
pub use tollgate::engine::checksum::Checksum;
pub use tollgate::engine::checksum::HeaderChecksum;
pub use tollgate::engine::dispatch::DropReason;
pub use tollgate::engine::dispatch::Gate;
pub use tollgate::engine::dispatch::PacketSink;
pub use tollgate::engine::dispatch::PacketSource;
pub use tollgate::engine::dispatch::ProcessResult;
pub use tollgate::engine::dispatch::SubmitResult;
pub use tollgate::engine::dispatch::WorkerPool;
pub use tollgate::engine::ip4::IPV4_FRAG_DF;
pub use tollgate::engine::ip4::IPV4_FRAG_MF;
pub use tollgate::engine::ip4::IPV4_FRAG_OFFSET_MASK;
pub use tollgate::engine::nat::NoMapping;
pub use tollgate::engine::nat::REDIRECT_DEF_BASE_PORT;
pub use tollgate::engine::nat::RedirectTable;
pub use tollgate::engine::nat::TableFull;
pub use tollgate::engine::nat::Ttl;
pub use tollgate::engine::oracle::AuthTable;
pub use tollgate::engine::oracle::PortalAddrs;
pub use tollgate::engine::packet::FlowKey;
pub use tollgate::engine::packet::PacketView;
pub use tollgate::engine::time::Moment;

pub const TRANSLATOR_IP: Ipv4Addr = Ipv4Addr::from_const([10, 0, 0, 1]);
pub const PORTAL_IP: Ipv4Addr = Ipv4Addr::from_const([10, 0, 0, 2]);
pub const PORTAL_PORT: u16 = 80;
pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::from_const([192, 168, 1, 5]);
pub const REMOTE_IP: Ipv4Addr = Ipv4Addr::from_const([93, 184, 216, 34]);

pub fn test_bundle() -> AddressBundle {
    AddressBundle::new(TRANSLATOR_IP, PORTAL_IP, PORTAL_PORT)
}

/// Build a logger which respects the `RUST_LOG` environment
/// variable.
pub fn test_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// Build a TCP packet with valid checksums.
pub fn tcp_pkt(
    domain: RoutingDomain,
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> PacketView {
    let total_len = (20 + 20 + payload.len()) as u16;
    let mut ip = Ipv4HdrRaw {
        ver_hdr_len: 0x45,
        dscp_ecn: 0,
        total_len: total_len.to_be_bytes(),
        ident: [0; 2],
        frag_and_flags: IPV4_FRAG_DF.to_be_bytes(),
        ttl: 64,
        proto: PROTO_TCP,
        csum: [0; 2],
        src: src.bytes(),
        dst: dst.bytes(),
    };
    let mut tcp = TcpHdrRaw {
        src_port: src_port.to_be_bytes(),
        dst_port: dst_port.to_be_bytes(),
        seq: 1u32.to_be_bytes(),
        ack: [0; 4],
        offset: 0x50,
        flags: TCP_FLAG_PSH | TCP_FLAG_ACK,
        win: u16::MAX.to_be_bytes(),
        csum: [0; 2],
        urg: [0; 2],
    };

    ip.csum = HeaderChecksum::from(Checksum::compute(ip.as_bytes())).bytes();

    let ulp_len = (20 + payload.len()) as u16;
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&ip.src);
    pseudo[4..8].copy_from_slice(&ip.dst);
    pseudo[9] = PROTO_TCP;
    pseudo[10..12].copy_from_slice(&ulp_len.to_be_bytes());
    let mut csum = Checksum::compute(&pseudo);
    csum.add_bytes(tcp.as_bytes());
    csum.add_bytes(payload);
    tcp.csum = HeaderChecksum::from(csum).bytes();

    let mut buf = ip.as_bytes().to_vec();
    buf.extend_from_slice(tcp.as_bytes());
    buf.extend_from_slice(payload);
    PacketView::new(domain, buf)
}

/// Build a non-leading fragment: an IPv4 header with a fragment
/// offset (in 8-byte units) followed by raw payload, no transport
/// header.
pub fn fragment_pkt(
    domain: RoutingDomain,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    offset_units: u16,
    more: bool,
    payload: &[u8],
) -> PacketView {
    let mut frag = offset_units & IPV4_FRAG_OFFSET_MASK;
    if more {
        frag |= IPV4_FRAG_MF;
    }
    let total_len = (20 + payload.len()) as u16;
    let mut ip = Ipv4HdrRaw {
        ver_hdr_len: 0x45,
        dscp_ecn: 0,
        total_len: total_len.to_be_bytes(),
        ident: 7u16.to_be_bytes(),
        frag_and_flags: frag.to_be_bytes(),
        ttl: 64,
        proto: PROTO_TCP,
        csum: [0; 2],
        src: src.bytes(),
        dst: dst.bytes(),
    };
    ip.csum = HeaderChecksum::from(Checksum::compute(ip.as_bytes())).bytes();

    let mut buf = ip.as_bytes().to_vec();
    buf.extend_from_slice(payload);
    PacketView::new(domain, buf)
}

/// Verify both checksums of a TCP packet by full re-summing; a valid
/// internet checksum always folds to 0xFFFF.
pub fn assert_csums_valid(bytes: &[u8]) {
    let ihl = usize::from(bytes[0] & 0x0F) * 4;
    assert_eq!(Checksum::compute(&bytes[..ihl]).finalize(), 0xFFFF);

    let total = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&bytes[12..16]);
    pseudo[4..8].copy_from_slice(&bytes[16..20]);
    pseudo[9] = bytes[9];
    pseudo[10..12].copy_from_slice(&((total - ihl) as u16).to_be_bytes());
    let mut csum = Checksum::compute(&pseudo);
    csum.add_bytes(&bytes[ihl..total]);
    assert_eq!(csum.finalize(), 0xFFFF);
}

/// A packet source fed from an mpsc channel; workers share the
/// receiver.
pub struct ChannelSource {
    rx: Mutex<mpsc::Receiver<PacketView>>,
}

impl ChannelSource {
    pub fn new() -> (mpsc::Sender<PacketView>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx: Mutex::new(rx) })
    }
}

impl PacketSource for ChannelSource {
    fn next_packet(&self, _worker: usize) -> Option<PacketView> {
        // The lock is held across the timed wait, so workers take
        // turns; that is fine at test scale.
        self.rx
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_millis(10))
            .ok()
    }
}

/// A packet sink that records what it accepts and can be scripted to
/// answer `Retry` or `Fatal` first.
#[derive(Clone, Default)]
pub struct RecordingSink {
    verdicts: Arc<Mutex<VecDeque<SubmitResult>>>,
    sent: Arc<Mutex<Vec<PacketView>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue verdicts for upcoming submit calls; once drained, every
    /// call answers `Sent`.
    pub fn script(&self, verdicts: impl IntoIterator<Item = SubmitResult>) {
        self.verdicts.lock().unwrap().extend(verdicts);
    }

    pub fn sent(&self) -> Vec<PacketView> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl PacketSink for RecordingSink {
    fn submit_packet(&self, _worker: usize, pkt: &PacketView) -> SubmitResult {
        let verdict = self
            .verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SubmitResult::Sent);
        if verdict == SubmitResult::Sent {
            self.sent.lock().unwrap().push(pkt.clone());
        }
        verdict
    }
}

/// A gate over a channel source and a recording sink, ready to
/// spawn.
pub fn channel_gate(
    slots: u32,
    log: Logger,
) -> (
    mpsc::Sender<PacketView>,
    RecordingSink,
    Arc<Gate<ChannelSource, RecordingSink>>,
) {
    let (tx, source) = ChannelSource::new();
    let sink = RecordingSink::new();
    let gate = Arc::new(Gate::new(
        "gate0",
        log,
        RedirectTable::new(
            NonZeroU32::new(slots).unwrap(),
            REDIRECT_DEF_BASE_PORT,
            None,
        ),
        Arc::new(AuthTable::new()),
        Arc::new(PortalAddrs::new(test_bundle())),
        source,
        sink.clone(),
    ));
    (tx, sink, gate)
}

/// Poll `cond` for up to five seconds.
pub fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}
