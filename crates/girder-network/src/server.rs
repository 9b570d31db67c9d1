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

//! The WebSocket server comms.
//!
//! Each accepted connection gets its own cooperative task that parses request
//! frames, enqueues them on the process, and pumps responses back out. Wire
//! ids are per-connection, so the task maps them into a connection-scoped
//! slice of the process-wide id space and back.

use std::io;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use girder_core::{response_channel, ProcessHandle, Request};
use girder_schema::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::codec;

/// The low 32 bits of the id space belong to the client; the high bits tag
/// the connection.
const ID_MASK: u64 = 0xffff_ffff;

/// A running WebSocket server.
pub struct WsServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl WsServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting. Existing connections keep running until they close.
    pub fn stop(self) {
        self.task.abort();
    }
}

/// Binds `bind` and serves `process`'s blocks to WebSocket clients.
pub async fn listen(bind: SocketAddr, process: ProcessHandle) -> io::Result<WsServer> {
    let listener = TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    info!("serving blocks on ws://{local_addr}");
    let task = tokio::spawn(accept_loop(listener, process));
    Ok(WsServer { local_addr, task })
}

async fn accept_loop(listener: TcpListener, process: ProcessHandle) {
    let mut next_connection: u64 = 0;
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!("accepting connection from {addr:?}");
                let process = process.clone();
                let connection = next_connection;
                next_connection += 1;
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(socket).await {
                        Ok(ws) => serve_connection(connection, ws, process).await,
                        Err(err) => error!("handshake with {addr:?} failed: {err}"),
                    }
                });
            }
            Err(err) => error!("accept error: {err:?}"),
        }
    }
}

async fn serve_connection(connection: u64, ws: WebSocketStream<TcpStream>, process: ProcessHandle) {
    let (mut sink, mut stream) = ws.split();
    let (responses_tx, responses_rx) = response_channel();
    let base = connection << 32;

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let message = match codec::decode(&text) {
                            Ok(message) => message,
                            Err(err) => {
                                warn!("connection {connection} sent a malformed frame: {err}");
                                continue;
                            }
                        };
                        let id = message.id();
                        if id > ID_MASK {
                            let error = Message::Error {
                                id,
                                message: "request ids must fit in 32 bits".to_owned(),
                            };
                            let _ = sink.send(codec::encode(&error)).await;
                            continue;
                        }
                        match Request::from_message(message.with_id(base | id), responses_tx.clone()) {
                            Some(request) => process.submit(request),
                            None => warn!("connection {connection} sent a response frame"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        error!("connection {connection} receive failed: {err}");
                        break;
                    }
                }
            }
            response = responses_rx.recv_async() => {
                let Ok(response) = response else { break };
                let wire = response.id() & ID_MASK;
                if let Err(err) = sink.send(codec::encode(&response.with_id(wire))).await {
                    error!("connection {connection} send failed: {err}");
                    break;
                }
            }
        }
    }

    // Dropping the response queue is what unhooks this connection's
    // subscriptions; the process prunes them on their next send.
    debug!("connection {connection} closed");
}
