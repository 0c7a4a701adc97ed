// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Tollgate redirects unauthorized subscriber traffic at a captive
//! portal by rewriting addresses and ports in place, keeping each
//! flow's original destination on hand so the portal's replies can
//! be routed back. The [`engine`] module holds the data path: header
//! parsing, the redirect translation table, incremental checksum
//! updates, and the worker dispatch loop.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod engine;

pub use tollgate_api as api;
