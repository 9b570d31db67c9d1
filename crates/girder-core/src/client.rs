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

//! Mirroring of remote blocks.
//!
//! A [ClientController] sits in front of a locally-hosted, initially-empty
//! block and keeps it structurally identical to the remote block of the same
//! name. It watches the process block's `remoteBlocks` attribute; once the
//! name shows up there, it delta-subscribes to the block through the comms
//! link that advertised it. Root deltas rebuild the child set (with method
//! invocables replaced by forwarders to the remote); everything else is
//! applied to the local block verbatim, because the remote already validated
//! it.
//!
//! All remote deltas are applied on the controller's one task, so they never
//! interleave with each other part-way through a batch.

use std::sync::Arc;

use futures::FutureExt;
use girder_schema::{registry, Change, Message, Object, Value};
use indexmap::IndexMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::block::{Attribute, Block, Child, Method, MethodFn};
use crate::comms::ClientComms;
use crate::error::CoreError;
use crate::process::ProcessHandle;
use crate::request::{response_channel, Request, ResponseReceiver, ResponseSender};

/// Subscription id for the process block's `remoteBlocks` attribute.
pub const REMOTE_BLOCKS_ID: u64 = 0;

/// Subscription id for the mirrored block itself.
pub const BLOCK_ID: u64 = 1;

/// Keeps a local block in sync with its remote counterpart.
pub struct ClientController {
    task: JoinHandle<()>,
}

impl ClientController {
    /// Attaches a controller to `block`. The block should already be hosted
    /// on `process` (it usually starts out with no children).
    pub fn attach(process: &ProcessHandle, block: Arc<Block>) -> Self {
        let (tx, rx) = response_channel();
        process.submit(Request::subscribe(
            REMOTE_BLOCKS_ID,
            vec![
                process.name().to_owned(),
                "remoteBlocks".to_owned(),
                "value".to_owned(),
            ],
            false,
            tx.clone(),
        ));

        let task = process.spawn(run(process.clone(), block, rx, tx));
        Self { task }
    }

    /// Stops mirroring. The local block keeps its last-known state.
    pub fn stop(self) {
        self.task.abort();
    }
}

async fn run(
    process: ProcessHandle,
    block: Arc<Block>,
    responses: ResponseReceiver,
    subscription: ResponseSender,
) {
    let mut comms: Option<Arc<dyn ClientComms>> = None;

    while let Ok(response) = responses.recv_async().await {
        match response {
            Message::Update { id, value } if id == REMOTE_BLOCKS_ID => {
                if comms.is_some() {
                    continue;
                }
                let reachable = value
                    .as_array()
                    .map(|names| names.iter().any(|name| name.as_str() == Some(block.name())))
                    .unwrap_or(false);
                if !reachable {
                    continue;
                }
                match process.get_client_comms(block.name()) {
                    Some(link) => {
                        debug!("mirroring {:?} through {:?}", block.name(), link.name());
                        link.submit(Request::subscribe(
                            BLOCK_ID,
                            vec![block.name().to_owned()],
                            true,
                            subscription.clone(),
                        ));
                        comms = Some(link);
                    }
                    None => warn!(
                        "no comms link advertises remote block {:?}",
                        block.name()
                    ),
                }
            }
            Message::Delta { id, changes } if id == BLOCK_ID => {
                let Some(link) = comms.as_ref() else {
                    continue;
                };
                for change in &changes {
                    if let Err(err) = apply_remote(&block, link, change) {
                        warn!("mirror update for {:?} failed: {err}", block.name());
                    }
                }
                // One notify per remote delta keeps the remote's round
                // boundaries intact for local subscribers.
                process.notify_subscribers(block.name());
            }
            Message::Error { id, message } => {
                warn!("mirror subscription {id} failed: {message}");
            }
            other => trace!("ignoring {other:?}"),
        }
    }
}

fn apply_remote(
    block: &Arc<Block>,
    comms: &Arc<dyn ClientComms>,
    change: &Change,
) -> Result<(), CoreError> {
    if !change.path.is_empty() {
        return block.apply_delta(change);
    }

    let root = change
        .value
        .as_ref()
        .ok_or_else(|| CoreError::endpoint(&change.path))?;
    regenerate(block, comms, root)
}

/// Rebuilds the block's children from a remote root snapshot. Methods get a
/// forwarder closure over the comms link in place of a local implementation.
fn regenerate(
    block: &Arc<Block>,
    comms: &Arc<dyn ClientComms>,
    root: &Value,
) -> Result<(), CoreError> {
    let data = registry::decode_block(root.clone())?;
    let mut children = IndexMap::with_capacity(data.children.len());
    for (name, child) in data.children {
        let child = match child {
            girder_schema::Child::Attribute(a) => Child::Attribute(Attribute::from_data(a)),
            girder_schema::Child::Method(m) => {
                let func = forward_to(comms.clone(), block.name().to_owned(), name.clone());
                Child::Method(Method::from_data(m, func)?)
            }
        };
        children.insert(name, child);
    }
    block.replace_children_quiet(children);
    Ok(())
}

/// Builds a method invocable that Posts to the remote block and waits for
/// its Return.
fn forward_to(comms: Arc<dyn ClientComms>, block_name: String, method_name: String) -> MethodFn {
    Arc::new(move |parameters: Object| {
        let comms = comms.clone();
        let endpoint = vec![block_name.clone(), method_name.clone()];
        async move {
            let (tx, rx) = response_channel();
            comms.submit(Request::post(0, endpoint, Value::Object(parameters), tx));
            match rx.recv_async().await {
                Ok(Message::Return { value, .. }) => strip_typeid(value),
                Ok(Message::Error { message, .. }) => Err(CoreError::Method(message)),
                Ok(other) => Err(CoreError::Transport(format!(
                    "unexpected response to forwarded post: {other:?}"
                ))),
                Err(_) => Err(CoreError::Transport("comms link closed".into())),
            }
        }
        .boxed()
    })
}

fn strip_typeid(value: Value) -> Result<Object, CoreError> {
    match value {
        Value::Object(map) => Ok(map.into_iter().filter(|(key, _)| key != "typeid").collect()),
        other => Err(CoreError::Transport(format!(
            "forwarded post returned {other} instead of a map"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use girder_schema::{MapMeta, Meta, StringMeta};
    use serde_json::json;

    use super::*;
    use crate::process::Process;
    use crate::request::RequestKind;

    /// A comms double that hands every submitted request to the test, which
    /// plays the remote process.
    struct ScriptedComms {
        requests: flume::Sender<Request>,
    }

    impl ClientComms for ScriptedComms {
        fn name(&self) -> &str {
            "scripted"
        }

        fn submit(&self, request: Request) {
            let _ = self.requests.send(request);
        }
    }

    /// A donor block shaped like the remote `hello`: one attribute, one
    /// method.
    fn remote_hello_snapshot() -> Value {
        let takes =
            MapMeta::new("").with_element("name", Meta::String(StringMeta::new("who")), true);
        let returns = MapMeta::new("").with_element(
            "greeting",
            Meta::String(StringMeta::new("the greeting")),
            false,
        );
        let mut children = IndexMap::new();
        children.insert(
            "attr".to_string(),
            Child::Attribute(
                Attribute::new(Meta::String(StringMeta::new("a field")), json!("v")).unwrap(),
            ),
        );
        children.insert(
            "greet".to_string(),
            Child::Method(Method::new(
                takes,
                returns,
                Arc::new(|_| async { Ok(Object::new()) }.boxed()),
            )),
        );
        Block::new("donor", children).to_value()
    }

    /// Brings up a process hosting a mirrored `hello` block and walks the
    /// controller through discovery and the initial remote snapshot. Returns
    /// the remote-facing request queue and a local delta subscription that
    /// has already seen the regeneration round.
    async fn mirrored_hello() -> (
        ProcessHandle,
        Arc<Block>,
        flume::Receiver<Request>,
        ResponseReceiver,
        ResponseSender,
    ) {
        let (handle, _join) = Process::new("proc").start();
        let block = Block::new("hello", IndexMap::new());
        handle.add_block(block.clone());
        let _controller = ClientController::attach(&handle, block.clone());

        let (remote_tx, remote_rx) = flume::unbounded();
        let comms: Arc<dyn ClientComms> = Arc::new(ScriptedComms {
            requests: remote_tx,
        });
        handle.update_block_list(comms, vec!["hello".to_string()]);

        // The controller reacts to remoteBlocks by delta-subscribing on the
        // comms link.
        let subscribe = remote_rx.recv_async().await.unwrap();
        assert_eq!(subscribe.id, BLOCK_ID);
        assert_eq!(subscribe.endpoint, vec!["hello".to_string()]);
        assert!(matches!(
            subscribe.kind,
            RequestKind::Subscribe { delta: true }
        ));

        // Watch the local mirror so the test can tell when deltas land.
        let (watch_tx, watch_rx) = response_channel();
        handle.submit(Request::subscribe(99, vec!["hello".into()], true, watch_tx));
        watch_rx.recv_async().await.unwrap();

        // Play the remote: the initial snapshot regenerates the block.
        let remote_sub = subscribe.response.clone();
        remote_sub
            .send(Message::Delta {
                id: subscribe.id,
                changes: vec![Change::set(Vec::new(), remote_hello_snapshot())],
            })
            .unwrap();
        watch_rx.recv_async().await.unwrap();

        (handle, block, remote_rx, watch_rx, remote_sub)
    }

    #[tokio::test]
    async fn regenerates_from_the_remote_snapshot() {
        let (_handle, block, _remote_rx, _watch_rx, _remote_sub) = mirrored_hello().await;

        let snapshot = block.to_value();
        assert_eq!(snapshot["attr"]["value"], json!("v"));
        assert_eq!(
            snapshot["greet"]["typeid"],
            json!("malcolm:core/Method:1.0")
        );
    }

    #[tokio::test]
    async fn non_root_deltas_apply_verbatim() {
        let (_handle, block, _remote_rx, watch_rx, remote_sub) = mirrored_hello().await;

        remote_sub
            .send(Message::Delta {
                id: BLOCK_ID,
                changes: vec![Change::set(
                    vec!["attr".into(), "value".into()],
                    json!("from-remote"),
                )],
            })
            .unwrap();

        // The local round mirrors the remote one.
        let local = watch_rx.recv_async().await.unwrap();
        match local {
            Message::Delta { changes, .. } => {
                assert_eq!(
                    changes,
                    vec![Change::set(
                        vec!["attr".into(), "value".into()],
                        json!("from-remote"),
                    )]
                );
            }
            other => panic!("expected Delta, got {other:?}"),
        }
        assert_eq!(block.value_of("attr"), Some(json!("from-remote")));
    }

    #[tokio::test]
    async fn posts_forward_to_the_remote_and_strip_typeid() {
        let (handle, _block, remote_rx, _watch_rx, _remote_sub) = mirrored_hello().await;

        let (tx, rx) = response_channel();
        handle.submit(Request::post(
            9,
            vec!["hello".into(), "greet".into()],
            json!({"name": "x"}),
            tx,
        ));

        // The forwarder sends the post over the comms link.
        let forwarded = remote_rx.recv_async().await.unwrap();
        assert_eq!(forwarded.endpoint, vec!["hello".to_string(), "greet".to_string()]);
        match &forwarded.kind {
            RequestKind::Post { parameters } => {
                assert_eq!(parameters, &json!({"name": "x"}));
            }
            other => panic!("expected Post, got {other:?}"),
        }

        // Play the remote's Return; the typeid does not survive the trip.
        forwarded
            .response
            .send(Message::Return {
                id: forwarded.id,
                value: json!({"typeid": "malcolm:core/Map:1.0", "greeting": "Hello x"}),
            })
            .unwrap();

        match rx.recv_async().await.unwrap() {
            Message::Return { id, value } => {
                assert_eq!(id, 9);
                assert_eq!(value, json!({"greeting": "Hello x"}));
            }
            other => panic!("expected Return, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_errors_propagate_to_the_caller() {
        let (handle, _block, remote_rx, _watch_rx, _remote_sub) = mirrored_hello().await;

        let (tx, rx) = response_channel();
        handle.submit(Request::post(
            10,
            vec!["hello".into(), "greet".into()],
            json!({"name": "x"}),
            tx,
        ));

        let forwarded = remote_rx.recv_async().await.unwrap();
        forwarded
            .response
            .send(Message::Error {
                id: forwarded.id,
                message: "remote said no".into(),
            })
            .unwrap();

        match rx.recv_async().await.unwrap() {
            Message::Error { id, message } => {
                assert_eq!(id, 10);
                assert!(message.contains("remote said no"), "{message}");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }
}
