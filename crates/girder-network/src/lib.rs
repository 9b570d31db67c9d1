// Copyright (c) 2024 the Girder contributors.
// SPDX-License-Identifier: AGPL-3.0-or-later
//
// This file is part of Girder.
//
// Girder is free software: you can redistribute it and/or modify it under the
// terms of the GNU Affero General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Girder is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with Girder. If not, see <https://www.gnu.org/licenses/>.

//! WebSocket transports for the Girder wire protocol.
//!
//! Frames are JSON text messages, one tagged object per frame, with object
//! key order preserved end to end. [client::WsClientComms] lets a process
//! mirror blocks hosted elsewhere; [server::listen] serves a process's blocks
//! to remote clients.

/// The client side: a [girder_core::ClientComms] over WebSocket.
pub mod client;

/// JSON text framing.
pub mod codec;

/// The server side: accepting connections and bridging them onto a process.
pub mod server;

pub use client::{WsClientComms, SERVER_BLOCKS_ID};
pub use server::{listen, WsServer};
