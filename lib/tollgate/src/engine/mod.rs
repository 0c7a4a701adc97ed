// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The packet engine: parsing, translation, and dispatch.

pub mod checksum;
pub mod dispatch;
pub mod ip4;
pub mod nat;
pub mod oracle;
pub mod packet;
pub mod tcp;
pub mod time;
