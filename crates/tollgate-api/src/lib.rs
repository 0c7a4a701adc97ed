// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! API types shared between the tollgate engine and its configuration
//! collaborators.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod ip;

pub use ip::*;

/// The logical path a packet arrived on.
///
/// Subscriber-facing traffic is candidate for forward translation;
/// return-from-portal traffic is candidate for reverse translation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RoutingDomain {
    Subscriber = 1,
    Portal = 2,
}

impl core::str::FromStr for RoutingDomain {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "subscriber" => Ok(RoutingDomain::Subscriber),
            "portal" => Ok(RoutingDomain::Portal),
            _ => Err(format!("invalid routing domain: {}", s)),
        }
    }
}

impl Display for RoutingDomain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let domstr = match self {
            RoutingDomain::Subscriber => "SUBSCRIBER",
            RoutingDomain::Portal => "PORTAL",
        };

        write!(f, "{}", domstr)
    }
}

/// The addresses substituted into a forward-translated packet: the
/// translator-owned source address and the portal service it is
/// steered to.
///
/// Mutated only by configuration collaborators; every worker reads a
/// cached snapshot of it on the hot path.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AddressBundle {
    /// Address owned by the translator; becomes the source of every
    /// forward-translated packet.
    pub translator_ip: Ipv4Addr,

    /// Address of the captive-portal service; becomes the destination
    /// of every forward-translated packet.
    pub portal_ip: Ipv4Addr,

    /// Well-known TCP port the portal service listens on.
    pub portal_port: u16,
}

impl AddressBundle {
    pub fn new(
        translator_ip: Ipv4Addr,
        portal_ip: Ipv4Addr,
        portal_port: u16,
    ) -> Self {
        Self { translator_ip, portal_ip, portal_port }
    }
}

impl Display for AddressBundle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "translator={} portal={}:{}",
            self.translator_ip, self.portal_ip, self.portal_port,
        )
    }
}
