// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! TCP headers.
//!
//! Translation only ever reads and rewrites the port pair and the
//! checksum; everything else in the segment travels untouched. In
//! particular no flag tracking happens here: mappings die by expiry,
//! not by FIN or RST.

use core::mem;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Ref;
use zerocopy::Unaligned;

pub const TCP_HDR_SZ: usize = mem::size_of::<TcpHdrRaw>();
pub const TCP_HDR_OFFSET_MASK: u8 = 0xF0;
pub const TCP_HDR_OFFSET_SHIFT: u8 = 4;

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum TcpHdrError {
    #[error("header truncated: {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },

    #[error("bad data offset: {offset} words")]
    BadOffset { offset: u8 },
}

/// A TCP header as it sits on the wire, fixed part only.
#[derive(
    Clone,
    Copy,
    Debug,
    FromBytes,
    Immutable,
    IntoBytes,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct TcpHdrRaw {
    pub src_port: [u8; 2],
    pub dst_port: [u8; 2],
    pub seq: [u8; 4],
    pub ack: [u8; 4],
    pub offset: u8,
    pub flags: u8,
    pub win: [u8; 2],
    pub csum: [u8; 2],
    pub urg: [u8; 2],
}

/// A parsed, mutable view over a TCP header in a packet buffer.
pub struct TcpHdr<'a> {
    bytes: Ref<&'a mut [u8], TcpHdrRaw>,
}

impl<'a> TcpHdr<'a> {
    /// Parse a TCP header off the front of `buf`.
    ///
    /// Only the fixed 20 bytes are required; options are left in
    /// place, unread, since translation never touches them.
    pub fn parse(buf: &'a mut [u8]) -> Result<Self, TcpHdrError> {
        let have = buf.len();
        let (bytes, _) = Ref::<_, TcpHdrRaw>::from_prefix(buf).map_err(
            |_| TcpHdrError::Truncated { have, need: TCP_HDR_SZ },
        )?;
        let hdr = Self { bytes };

        let offset = hdr.offset_words();
        if usize::from(offset) * 4 < TCP_HDR_SZ {
            return Err(TcpHdrError::BadOffset { offset });
        }

        Ok(hdr)
    }

    #[inline]
    fn offset_words(&self) -> u8 {
        (self.bytes.offset & TCP_HDR_OFFSET_MASK) >> TCP_HDR_OFFSET_SHIFT
    }

    /// Return the length of the header portion of the segment,
    /// options included, in bytes.
    #[inline]
    pub fn hdr_len(&self) -> usize {
        usize::from(self.offset_words()) * 4
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes(self.bytes.src_port)
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes(self.bytes.dst_port)
    }

    #[inline]
    pub fn set_src_port(&mut self, port: u16) {
        self.bytes.src_port = port.to_be_bytes();
    }

    #[inline]
    pub fn set_dst_port(&mut self, port: u16) {
        self.bytes.dst_port = port.to_be_bytes();
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.bytes.flags
    }

    #[inline]
    pub fn csum(&self) -> [u8; 2] {
        self.bytes.csum
    }

    #[inline]
    pub fn set_csum(&mut self, csum: [u8; 2]) {
        self.bytes.csum = csum;
    }
}
