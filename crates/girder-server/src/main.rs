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

use std::net::SocketAddr;

use clap::Parser;
use girder_core::{Block, ClientController, Process};
use girder_network::WsClientComms;
use indexmap::IndexMap;
use tracing::info;

mod blocks;

/// A Girder process hosting the demo blocks over WebSocket.
#[derive(Parser, Debug)]
struct Args {
    /// IP address and port to listen on.
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Name of this process.
    #[arg(short, long, default_value = "demo")]
    name: String,

    /// WebSocket url of an upstream process to act as a client to.
    #[arg(long)]
    connect: Option<String>,

    /// Remote block to mirror locally (repeatable; needs --connect).
    #[arg(long)]
    mirror: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    girder_core::init_logging();

    let (handle, _join) = Process::new(&args.name).start();
    handle.add_block(blocks::counter_block("counter"));
    handle.add_block(blocks::hello_block("hello"));

    let mut controllers = Vec::new();
    let mut upstream = None;
    if let Some(url) = &args.connect {
        for name in &args.mirror {
            let block = Block::new(name.clone(), IndexMap::new());
            handle.add_block(block.clone());
            controllers.push(ClientController::attach(&handle, block));
        }
        upstream = Some(WsClientComms::connect("upstream", url, handle.clone()).await?);
        info!("acting as client to {url}");
    }

    let server = girder_network::listen(args.bind, handle.clone()).await?;
    info!("process {:?} up on {}", args.name, server.local_addr());

    girder_core::wait_for_interrupt().await;

    drop(upstream);
    for controller in controllers {
        controller.stop();
    }
    server.stop();
    handle.stop();
    Ok(())
}
