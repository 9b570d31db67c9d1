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

//! The Girder process core: blocks, the message loop, subscriptions, and
//! remote-block mirroring.
//!
//! A [process::Process] hosts named [block::Block]s and serializes every
//! mutation and request through one queue. Transports and controllers talk to
//! it through a [process::ProcessHandle]. Subscriptions coalesce changes into
//! Update or Delta responses at notify boundaries, and a
//! [client::ClientController] can keep a local block mirroring a remote one
//! over any [comms::ClientComms].

use tracing::{debug, error, info};

/// Blocks and their attribute/method children.
pub mod block;

/// Remote-block mirroring.
pub mod client;

/// The client side of a comms link.
pub mod comms;

/// Error taxonomy for routing and mirroring.
pub mod error;

/// The process message loop.
pub mod process;

/// In-process requests and response queues.
pub mod request;

/// Subscription bookkeeping and change coalescing.
mod subscription;

pub use block::{Attribute, Block, Child, Method, MethodFn, PutFn};
pub use client::ClientController;
pub use comms::{ClientComms, RequestTracker};
pub use error::CoreError;
pub use process::{Process, ProcessHandle};
pub use request::{response_channel, Request, RequestKind, ResponseReceiver, ResponseSender};

/// Helper function to set up console logging with reasonable defaults.
pub fn init_logging() {
    let format = tracing_subscriber::fmt::format().compact();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .event_format(format)
        .init();
}

/// Helper function to wait for Ctrl+C with nice logging.
pub async fn wait_for_interrupt() {
    debug!("Waiting for interrupt signal");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupt signal received"),
        Err(err) => error!("Interrupt await error: {:?}", err),
    }
}
