// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Incremental internet checksum support.
//!
//! The [`Checksum`] type keeps a rolling one's complement sum so a
//! header rewrite only has to feed in the bytes that changed, rather
//! than re-summing the whole packet. [`HeaderChecksum`] is the
//! complemented on-wire form. [`adjust`] ties the two together as the
//! single entry point the translation paths use: one call per
//! rewritten field group.
//!
//! Byte order: the sum treats every pair of bytes as a native-endian
//! 16-bit integer, both for the data being summed and for the
//! checksum field itself. Per RFC 1071 §1.B the one's complement sum
//! commutes with byte swapping, so bytes summed in network order
//! produce a result that is stored back in network order without any
//! conversion. Never byte-swap a checksum field.
//!
//! Relevant RFCs:
//!
//! * 1071 Computing the Internet Checksum
//! * 1624 Computation of the Internet Checksum via Incremental Update
//! * 3022 Traditional IP Network Address Translator

/// A checksum as it sits in a network header: the one's complement
/// of the one's complement sum.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderChecksum {
    inner: [u8; 2],
}

impl HeaderChecksum {
    /// Return the bytes of this header checksum.
    pub fn bytes(&self) -> [u8; 2] {
        self.inner
    }

    /// Wrap a pair of header bytes. The "wrap" verbiage (rather than
    /// a `From` impl) makes it clear the bytes must already be in
    /// complemented header form.
    pub fn wrap(hc: [u8; 2]) -> Self {
        Self { inner: hc }
    }
}

impl From<Checksum> for HeaderChecksum {
    fn from(mut csum: Checksum) -> HeaderChecksum {
        // Native-endian by convention; see the module comment.
        Self { inner: (!csum.finalize()).to_ne_bytes() }
    }
}

impl From<HeaderChecksum> for Checksum {
    fn from(hc: HeaderChecksum) -> Self {
        // Undo the complement to recover the raw sum.
        Self { inner: u32::from(!u16::from_ne_bytes(hc.bytes())) }
    }
}

/// A rolling one's complement sum.
///
/// Carries accumulate in the upper half of a `u32` and are folded
/// only when the final value is needed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    inner: u32,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new sum from `bytes`.
    pub fn compute(bytes: &[u8]) -> Self {
        Self { inner: csum_add(0, bytes) }
    }

    /// Add the contents of `bytes` to the sum.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.inner = csum_add(self.inner, bytes);
    }

    /// Subtract the contents of `bytes` from the sum.
    pub fn sub_bytes(&mut self, bytes: &[u8]) {
        self.inner = csum_sub(self.inner, bytes);
    }

    /// Fold the accumulated carries and return the 16-bit sum. This
    /// is the raw sum; complementing it for the wire is the job of
    /// [`HeaderChecksum`].
    pub fn finalize(&mut self) -> u16 {
        while (self.inner >> 16) != 0 {
            self.inner = (self.inner >> 16) + (self.inner & 0xFFFF);
        }

        (self.inner & 0xFFFF) as u16
    }
}

/// Incrementally update a header checksum for one rewritten field
/// group: `old` is the group's bytes before the rewrite, `new` after.
///
/// The groups rewritten by translation are the IP address pair
/// (8 bytes, source then destination) and the port pair (4 bytes,
/// source then destination). The same group must be fed to every
/// checksum it is covered by, e.g. the address pair updates both the
/// IP header checksum and (via the pseudo-header) the TCP checksum.
pub fn adjust(csum: [u8; 2], old: &[u8], new: &[u8]) -> [u8; 2] {
    let mut sum = Checksum::from(HeaderChecksum::wrap(csum));
    sum.sub_bytes(old);
    sum.add_bytes(new);
    HeaderChecksum::from(sum).bytes()
}

fn csum_add(mut csum: u32, bytes: &[u8]) -> u32 {
    let mut chunks = bytes.chunks_exact(2);
    for pair in &mut chunks {
        csum += u32::from(u16::from_ne_bytes([pair[0], pair[1]]));
    }

    // RFC 1071: an odd trailing byte is summed as if zero-padded.
    if let [last] = chunks.remainder() {
        csum += u32::from(u16::from_ne_bytes([*last, 0]));
    }

    csum
}

fn csum_sub(mut csum: u32, bytes: &[u8]) -> u32 {
    // Subtraction in one's complement arithmetic is addition of the
    // complemented value (RFC 1624).
    let mut chunks = bytes.chunks_exact(2);
    for pair in &mut chunks {
        csum += u32::from(!u16::from_ne_bytes([pair[0], pair[1]]));
    }

    if let [last] = chunks.remainder() {
        csum += u32::from(!u16::from_ne_bytes([*last, 0]));
    }

    csum
}
