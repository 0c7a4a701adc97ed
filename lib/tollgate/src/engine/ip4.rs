// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IPv4 headers.

use crate::api::Ipv4Addr;
use crate::api::Protocol;
use core::mem;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Ref;
use zerocopy::Unaligned;

pub const IPV4_HDR_SZ: usize = mem::size_of::<Ipv4HdrRaw>();
pub const IPV4_HDR_VER_MASK: u8 = 0xF0;
pub const IPV4_HDR_VER_SHIFT: u8 = 4;
pub const IPV4_HDR_LEN_MASK: u8 = 0x0F;
pub const IPV4_VERSION: u8 = 4;

/// Don't Fragment flag in the flags/fragment-offset word.
pub const IPV4_FRAG_DF: u16 = 0x4000;
/// More Fragments flag in the flags/fragment-offset word.
pub const IPV4_FRAG_MF: u16 = 0x2000;
/// Fragment offset bits, in units of eight bytes.
pub const IPV4_FRAG_OFFSET_MASK: u16 = 0x1FFF;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Ipv4HdrError {
    #[error("header truncated: {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },

    #[error("bad version: {vsn}")]
    BadVersion { vsn: u8 },

    #[error("bad header length: {hdr_len_bytes} bytes")]
    BadHeaderLen { hdr_len_bytes: usize },

    #[error("total length {total_len} inside header length {hdr_len_bytes}")]
    BadTotalLen { total_len: u16, hdr_len_bytes: usize },
}

/// An IPv4 header as it sits on the wire.
///
/// Fields are byte arrays in network order; the typed accessors live
/// on [`Ipv4Hdr`].
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
pub struct Ipv4HdrRaw {
    pub ver_hdr_len: u8,
    pub dscp_ecn: u8,
    pub total_len: [u8; 2],
    pub ident: [u8; 2],
    pub frag_and_flags: [u8; 2],
    pub ttl: u8,
    pub proto: u8,
    pub csum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

/// A parsed, mutable view over an IPv4 header in a packet buffer.
pub struct Ipv4Hdr<'a> {
    bytes: Ref<&'a mut [u8], Ipv4HdrRaw>,
}

impl<'a> Ipv4Hdr<'a> {
    /// Parse an IPv4 header off the front of `buf`, returning the
    /// header view and the bytes following the header (options
    /// included in the header, not the remainder).
    pub fn parse(
        buf: &'a mut [u8],
    ) -> Result<(Self, &'a mut [u8]), Ipv4HdrError> {
        let have = buf.len();
        let (bytes, rest) = Ref::<_, Ipv4HdrRaw>::from_prefix(buf).map_err(
            |_| Ipv4HdrError::Truncated { have, need: IPV4_HDR_SZ },
        )?;
        let hdr = Self { bytes };

        let vsn = hdr.version();
        if vsn != IPV4_VERSION {
            return Err(Ipv4HdrError::BadVersion { vsn });
        }

        let hdr_len_bytes = hdr.hdr_len();
        if hdr_len_bytes < IPV4_HDR_SZ {
            return Err(Ipv4HdrError::BadHeaderLen { hdr_len_bytes });
        }

        let total_len = hdr.total_len();
        if usize::from(total_len) < hdr_len_bytes {
            return Err(Ipv4HdrError::BadTotalLen { total_len, hdr_len_bytes });
        }

        // Skip past any options so the caller sees the payload.
        let opts_len = hdr_len_bytes - IPV4_HDR_SZ;
        if rest.len() < opts_len {
            return Err(Ipv4HdrError::Truncated {
                have,
                need: hdr_len_bytes,
            });
        }

        Ok((hdr, &mut rest[opts_len..]))
    }

    #[inline]
    pub fn version(&self) -> u8 {
        (self.bytes.ver_hdr_len & IPV4_HDR_VER_MASK) >> IPV4_HDR_VER_SHIFT
    }

    /// Return the header length, in bytes.
    #[inline]
    pub fn hdr_len(&self) -> usize {
        usize::from(self.bytes.ver_hdr_len & IPV4_HDR_LEN_MASK) * 4
    }

    #[inline]
    pub fn total_len(&self) -> u16 {
        u16::from_be_bytes(self.bytes.total_len)
    }

    #[inline]
    pub fn ident(&self) -> u16 {
        u16::from_be_bytes(self.bytes.ident)
    }

    #[inline]
    pub fn ttl(&self) -> u8 {
        self.bytes.ttl
    }

    #[inline]
    pub fn proto(&self) -> u8 {
        self.bytes.proto
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        Protocol::from(self.bytes.proto)
    }

    #[inline]
    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.bytes.src)
    }

    #[inline]
    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.bytes.dst)
    }

    #[inline]
    pub fn set_src(&mut self, src: Ipv4Addr) {
        self.bytes.src = src.bytes();
    }

    #[inline]
    pub fn set_dst(&mut self, dst: Ipv4Addr) {
        self.bytes.dst = dst.bytes();
    }

    #[inline]
    pub fn csum(&self) -> [u8; 2] {
        self.bytes.csum
    }

    #[inline]
    pub fn set_csum(&mut self, csum: [u8; 2]) {
        self.bytes.csum = csum;
    }

    /// Fragment offset, in units of eight bytes. Non-zero means this
    /// packet carries a later piece of a fragmented datagram and has
    /// no transport header of its own.
    #[inline]
    pub fn frag_offset(&self) -> u16 {
        u16::from_be_bytes(self.bytes.frag_and_flags) & IPV4_FRAG_OFFSET_MASK
    }

    #[inline]
    pub fn more_frags(&self) -> bool {
        (u16::from_be_bytes(self.bytes.frag_and_flags) & IPV4_FRAG_MF) != 0
    }

    /// Is this packet any piece of a fragmented datagram, leading
    /// piece included?
    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.frag_offset() != 0 || self.more_frags()
    }

    /// Length of everything after the IP header, per the total length
    /// field.
    #[inline]
    pub fn ulp_len(&self) -> u16 {
        self.total_len() - self.hdr_len() as u16
    }

    /// The pseudo-header bytes covered by the ULP checksum.
    pub fn pseudo_bytes(&self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&self.bytes.src);
        bytes[4..8].copy_from_slice(&self.bytes.dst);
        bytes[8] = 0;
        bytes[9] = self.bytes.proto;
        bytes[10..12].copy_from_slice(&self.ulp_len().to_be_bytes());
        bytes
    }
}
