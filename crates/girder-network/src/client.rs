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

//! The WebSocket client comms.
//!
//! One cooperative IO task owns the socket. Requests cross into it over a
//! channel, get a fresh wire id from the request tracker, and go out as JSON
//! text frames; inbound frames are decoded through the registry and routed
//! back to their callers by id. The first frame out subscribes to the remote
//! process's block list so the owning process learns what it can reach.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use girder_core::{ClientComms, CoreError, ProcessHandle, Request, RequestKind, RequestTracker};
use girder_schema::{Message, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, trace, warn};

use crate::codec;

/// Wire id of the standing subscription to the server's block list. Tracked
/// ids start above it.
pub const SERVER_BLOCKS_ID: u64 = 0;

/// A [ClientComms] speaking the JSON wire format over WebSocket.
pub struct WsClientComms {
    name: String,
    requests: flume::Sender<Request>,
}

impl ClientComms for WsClientComms {
    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&self, request: Request) {
        if self.requests.send(request).is_err() {
            warn!("request submitted to closed comms link {:?}", self.name);
        }
    }
}

impl WsClientComms {
    /// Connects to a remote process and spawns the IO task.
    ///
    /// Once connected, the remote's hosted blocks are reported to `process`
    /// via its block list, which is what lets controllers find this link.
    pub async fn connect(
        name: impl Into<String>,
        url: &str,
        process: ProcessHandle,
    ) -> Result<Arc<Self>, CoreError> {
        let (ws, _) = connect_async(url)
            .await
            .map_err(|err| CoreError::Transport(format!("connecting to {url}: {err}")))?;

        let (requests_tx, requests_rx) = flume::unbounded();
        let comms = Arc::new(Self {
            name: name.into(),
            requests: requests_tx,
        });

        tokio::spawn(io_loop(comms.clone(), process, ws, requests_rx));
        Ok(comms)
    }
}

async fn io_loop(
    comms: Arc<WsClientComms>,
    process: ProcessHandle,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    requests: flume::Receiver<Request>,
) {
    let (mut sink, mut stream) = ws.split();
    let mut tracker = RequestTracker::new(SERVER_BLOCKS_ID + 1);

    // Learn what blocks the server hosts.
    let hello = Message::Subscribe {
        id: SERVER_BLOCKS_ID,
        endpoint: vec![".".to_owned(), "blocks".to_owned(), "value".to_owned()],
        delta: false,
    };
    if let Err(err) = sink.send(codec::encode(&hello)).await {
        error!("comms link {:?} failed before start: {err}", comms.name);
        return;
    }

    loop {
        tokio::select! {
            request = requests.recv_async() => {
                let Ok(request) = request else {
                    debug!("comms link {:?} dropped; closing", comms.name);
                    break;
                };
                let frame = match &request.kind {
                    RequestKind::Unsubscribe => {
                        // The remote keys the subscription by the wire id the
                        // Subscribe travelled under.
                        match tracker.untrack_subscription(request.id) {
                            Some(wire_id) => {
                                tracker.track_at(wire_id, &request);
                                Message::Unsubscribe { id: wire_id }
                            }
                            None => {
                                trace!("unsubscribe for untracked id {}", request.id);
                                let _ = request.response.send(Message::Return {
                                    id: request.id,
                                    value: Value::Null,
                                });
                                continue;
                            }
                        }
                    }
                    _ => {
                        let wire_id = tracker.track(&request);
                        request.to_message().with_id(wire_id)
                    }
                };
                if let Err(err) = sink.send(codec::encode(&frame)).await {
                    error!("comms link {:?} send failed: {err}", comms.name);
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match codec::decode(&text) {
                            Ok(message) => {
                                handle_response(&comms, &process, &mut tracker, message);
                            }
                            Err(err) => warn!("dropping malformed frame: {err}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("comms link {:?} closed by remote", comms.name);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        error!("comms link {:?} receive failed: {err}", comms.name);
                        break;
                    }
                }
            }
        }
    }

    // Anyone still waiting gets a transport error rather than silence.
    tracker.fail_all("comms link closed");
}

fn handle_response(
    comms: &Arc<WsClientComms>,
    process: &ProcessHandle,
    tracker: &mut RequestTracker,
    message: Message,
) {
    if message.id() == SERVER_BLOCKS_ID {
        if let Message::Update { value, .. } = message {
            let names = string_list(&value);
            debug!("comms link {:?} reaches blocks {names:?}", comms.name);
            let link: Arc<dyn ClientComms> = comms.clone();
            process.update_block_list(link, names);
        }
        return;
    }

    if message.is_request() {
        warn!("remote sent a request frame; dropping it");
        return;
    }

    tracker.route(message);
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}
