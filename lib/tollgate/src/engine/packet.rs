// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Packets and flow identity.

use super::ip4::Ipv4Hdr;
use super::ip4::Ipv4HdrError;
use super::tcp::TcpHdr;
use super::tcp::TcpHdrError;
use crate::api::Ipv4Addr;
use crate::api::PROTO_TCP;
use crate::api::RoutingDomain;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum PacketError {
    #[error("IPv4: {0}")]
    Ip(#[from] Ipv4HdrError),

    #[error("TCP: {0}")]
    Tcp(#[from] TcpHdrError),

    #[error("not TCP: protocol {protocol}")]
    NotTcp { protocol: u8 },

    #[error("fragment body carries no transport header")]
    FragmentBody,
}

/// The identity a translation mapping is keyed on: the original
/// source/destination addresses and the original source port.
///
/// The original destination port is deliberately absent. Every flow
/// from one subscriber port is steered to the same portal regardless
/// of where it was headed, so the destination port adds nothing to
/// the identity; it is stored in the slot purely so reverse
/// translation can restore it.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct FlowKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}->{}", self.src, self.src_port, self.dst)
    }
}

/// An owned packet handed across the source/sink seams: the raw IPv4
/// packet bytes plus the routing domain it arrived on.
#[derive(Clone, Debug)]
pub struct PacketView {
    domain: RoutingDomain,
    buf: Vec<u8>,
}

impl PacketView {
    pub fn new(domain: RoutingDomain, buf: Vec<u8>) -> Self {
        Self { domain, buf }
    }

    #[inline]
    pub fn domain(&self) -> RoutingDomain {
        self.domain
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Parse the IPv4 header, leaving the transport header for
    /// [`Parsed::parse_tcp`]. Classification only needs IP fields, so
    /// a packet with transport-level garbage can still pass through
    /// untranslated.
    pub fn parse(&mut self) -> Result<Parsed<'_>, PacketError> {
        let (ip, body) = Ipv4Hdr::parse(self.buf.as_mut_slice())?;
        Ok(Parsed { ip, body })
    }
}

/// A packet with its IPv4 header parsed.
pub struct Parsed<'a> {
    pub ip: Ipv4Hdr<'a>,
    body: &'a mut [u8],
}

impl<'a> Parsed<'a> {
    /// Parse the TCP header out of the body, consuming this view.
    ///
    /// Fails if the packet is not TCP, is a fragment body with no
    /// transport header, or is too short.
    pub fn parse_tcp(self) -> Result<ParsedTcp<'a>, PacketError> {
        if self.ip.frag_offset() != 0 {
            return Err(PacketError::FragmentBody);
        }

        let protocol = self.ip.proto();
        if protocol != PROTO_TCP {
            return Err(PacketError::NotTcp { protocol });
        }

        let tcp = TcpHdr::parse(self.body)?;
        Ok(ParsedTcp { ip: self.ip, tcp })
    }
}

/// A packet with both IPv4 and TCP headers parsed; what the
/// translation paths operate on.
pub struct ParsedTcp<'a> {
    pub ip: Ipv4Hdr<'a>,
    pub tcp: TcpHdr<'a>,
}

impl ParsedTcp<'_> {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            src: self.ip.src(),
            dst: self.ip.dst(),
            src_port: self.tcp.src_port(),
        }
    }
}
