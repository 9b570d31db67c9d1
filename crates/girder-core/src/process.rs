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

//! The process message loop.
//!
//! A process hosts blocks and owns a single queue. Requests, block changes
//! and the private bookkeeping events all land on that queue, and one
//! consumer drains it, so every piece of mutable routing state is only ever
//! touched from the loop. Producers (transports, controllers, user tasks)
//! interact with the process purely by enqueuing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use girder_schema::{Change, Message, Meta, StringArrayMeta, Value};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::block::{Attribute, Block, Child};
use crate::comms::ClientComms;
use crate::error::CoreError;
use crate::request::{Request, RequestKind, ResponseSender};
use crate::subscription::SubscriptionTable;

/// Everything that can land on a process queue.
#[derive(Debug)]
pub(crate) enum ProcessEvent {
    /// An externally-submitted request.
    Request(Request),
    /// A block joining this process.
    BlockAdd { block: Arc<Block> },
    /// A mutation that has been applied to a hosted block.
    BlockChanged { change: Change },
    /// End-of-round barrier for one block's pending changes.
    BlockNotify { block: String },
    /// A response produced off-loop, delivered in queue order.
    BlockRespond {
        response: Message,
        queue: ResponseSender,
    },
    /// Remote blocks reachable through a comms link.
    BlockList {
        comms: Arc<dyn ClientComms>,
        names: Vec<String>,
    },
    /// Sentinel that breaks the loop once everything before it has drained.
    Stop,
}

type CommsTable = Arc<Mutex<Vec<(Arc<dyn ClientComms>, Vec<String>)>>>;

/// A cheap, cloneable handle for enqueuing onto a process.
///
/// This is the boundary consumed by blocks, controllers and transports; it
/// never touches loop state directly.
#[derive(Clone)]
pub struct ProcessHandle {
    name: Arc<str>,
    events: flume::Sender<ProcessEvent>,
    comms: CommsTable,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hosts `block` on this process. The block starts emitting its changes
    /// here immediately; the loop picks it up in queue order.
    pub fn add_block(&self, block: Arc<Block>) {
        block.attach(self.clone());
        let name = block.name().to_owned();
        if self.events.send(ProcessEvent::BlockAdd { block }).is_err() {
            warn!("block {name:?} added after process stop");
        }
    }

    /// Enqueues a request for dispatch.
    ///
    /// A request submitted after the process has stopped is answered with
    /// [CoreError::Stopped] on its own response queue.
    pub fn submit(&self, request: Request) {
        if let Err(err) = self.events.send(ProcessEvent::Request(request)) {
            if let ProcessEvent::Request(request) = err.into_inner() {
                debug!("request {} submitted after process stop", request.id);
                let _ = request.response.send(Message::Error {
                    id: request.id,
                    message: CoreError::Stopped.to_string(),
                });
            }
        }
    }

    /// Records an applied change. With `notify` set the change's block gets a
    /// notify barrier right behind it, closing the round.
    pub fn on_changed(&self, change: Change, notify: bool) {
        let block = change.path.first().cloned();
        if self.events.send(ProcessEvent::BlockChanged { change }).is_err() {
            trace!("change recorded after process stop");
            return;
        }
        if notify {
            if let Some(block) = block {
                self.notify_subscribers(&block);
            }
        }
    }

    /// Closes the current coalescing round for `block`.
    pub fn notify_subscribers(&self, block: &str) {
        let sent = self.events.send(ProcessEvent::BlockNotify {
            block: block.to_owned(),
        });
        if sent.is_err() {
            trace!("notify for {block:?} after process stop");
        }
    }

    /// Delivers a response through the queue so it is serialized with every
    /// other event.
    pub fn block_respond(&self, response: Message, queue: ResponseSender) {
        if let Err(err) = self
            .events
            .send(ProcessEvent::BlockRespond { response, queue })
        {
            // The loop is gone; deliver directly rather than dropping a
            // response that has already been produced.
            if let ProcessEvent::BlockRespond { response, queue } = err.into_inner() {
                let _ = queue.send(response);
            }
        }
    }

    /// Records which remote blocks `comms` can reach.
    pub fn update_block_list(&self, comms: Arc<dyn ClientComms>, names: Vec<String>) {
        if self
            .events
            .send(ProcessEvent::BlockList { comms, names })
            .is_err()
        {
            debug!("block list updated after process stop");
        }
    }

    /// The comms link that can reach `block`, if any has advertised it.
    pub fn get_client_comms(&self, block: &str) -> Option<Arc<dyn ClientComms>> {
        self.comms
            .lock()
            .iter()
            .find(|(_, names)| names.iter().any(|name| name.as_str() == block))
            .map(|(comms, _)| comms.clone())
    }

    /// Spawns auxiliary work. Loop handlers use this for anything that could
    /// wait on the outside world, reporting back via
    /// [ProcessHandle::block_respond].
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(future)
    }

    /// Stops the process after the events already queued ahead of this call.
    /// Stopping an already-stopped process does nothing.
    pub fn stop(&self) {
        if self.events.send(ProcessEvent::Stop).is_err() {
            trace!("stop for a process that has already stopped");
        }
    }
}

/// A host for blocks: the queue, its consumer state, and the synthetic
/// process block advertising what lives here.
pub struct Process {
    name: Arc<str>,
    events: flume::Receiver<ProcessEvent>,
    handle: ProcessHandle,
    blocks: HashMap<String, Arc<Block>>,
    subscriptions: SubscriptionTable,
    comms: CommsTable,
    process_block: Arc<Block>,
}

impl Process {
    pub fn new(name: &str) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        let comms: CommsTable = Arc::new(Mutex::new(Vec::new()));
        let handle = ProcessHandle {
            name: Arc::from(name),
            events: events_tx,
            comms: comms.clone(),
        };

        let process_block = make_process_block(name);
        process_block.attach(handle.clone());
        let mut blocks = HashMap::new();
        blocks.insert(name.to_owned(), process_block.clone());

        Self {
            name: handle.name.clone(),
            events: events_rx,
            handle,
            blocks,
            subscriptions: SubscriptionTable::default(),
            comms,
            process_block,
        }
    }

    pub fn handle(&self) -> ProcessHandle {
        self.handle.clone()
    }

    /// Runs the loop until a [ProcessEvent::Stop] is drained.
    pub async fn run(&mut self) {
        debug!("process {:?} started", self.name);
        while let Ok(event) = self.events.recv_async().await {
            if matches!(event, ProcessEvent::Stop) {
                break;
            }
            let dump = format!("{event:?}");
            trace!("handling {dump}");
            if let Err(err) = self.handle_event(event) {
                // A broken event must not take the loop down with it.
                error!("error while handling {dump}: {err}");
            }
        }
        debug!("process {:?} stopped", self.name);
    }

    /// Spawns the loop onto its own task, handing back the process once it
    /// stops.
    pub fn start(mut self) -> (ProcessHandle, JoinHandle<Process>) {
        let handle = self.handle();
        let join = tokio::spawn(async move {
            self.run().await;
            self
        });
        (handle, join)
    }

    fn handle_event(&mut self, event: ProcessEvent) -> Result<(), CoreError> {
        match event {
            ProcessEvent::Request(request) => {
                self.handle_request(request);
                Ok(())
            }
            ProcessEvent::BlockAdd { block } => self.handle_block_add(block),
            ProcessEvent::BlockChanged { change } => {
                self.subscriptions.record(change);
                Ok(())
            }
            ProcessEvent::BlockNotify { block } => {
                self.subscriptions.notify(&block, &self.blocks);
                Ok(())
            }
            ProcessEvent::BlockRespond { response, queue } => {
                let _ = queue.send(response);
                Ok(())
            }
            ProcessEvent::BlockList { comms, names } => self.handle_block_list(comms, names),
            ProcessEvent::Stop => Ok(()),
        }
    }

    /// Dispatches a request, turning any failure into an Error response for
    /// the caller.
    fn handle_request(&mut self, request: Request) {
        let id = request.id;
        let response = request.response.clone();
        if let Err(err) = self.dispatch_request(request) {
            debug!("request {id} failed: {err}");
            let _ = response.send(Message::Error {
                id,
                message: err.to_string(),
            });
        }
    }

    fn dispatch_request(&mut self, request: Request) -> Result<(), CoreError> {
        if matches!(request.kind, RequestKind::Unsubscribe) {
            if !self.subscriptions.unsubscribe(request.id) {
                trace!("unsubscribe for unknown id {}", request.id);
            }
            let _ = request.response.send(Message::Return {
                id: request.id,
                value: Value::Null,
            });
            return Ok(());
        }

        let root = request
            .endpoint
            .first()
            .ok_or_else(|| CoreError::endpoint(&request.endpoint))?;
        let block = self.resolve_block(root)?.clone();
        let tail = &request.endpoint[1..];

        match request.kind {
            RequestKind::Get => {
                let value = block.handle_get(tail)?;
                let _ = request.response.send(Message::Return {
                    id: request.id,
                    value,
                });
            }
            RequestKind::Put { value } => {
                let written = block.handle_put(tail, value)?;
                let _ = request.response.send(Message::Return {
                    id: request.id,
                    value: written,
                });
            }
            RequestKind::Post { parameters } => {
                // Invocations may wait on the outside world (a forwarded
                // method blocks on the remote Return), so they run off-loop
                // and come back through BlockRespond.
                let method = block.method(tail)?;
                let handle = self.handle.clone();
                let id = request.id;
                let queue = request.response.clone();
                self.handle.spawn(async move {
                    let response = match method.invoke(&parameters).await {
                        Ok(returns) => Message::Return {
                            id,
                            value: Value::Object(returns),
                        },
                        Err(err) => Message::Error {
                            id,
                            message: err.to_string(),
                        },
                    };
                    handle.block_respond(response, queue);
                });
            }
            RequestKind::Subscribe { delta } => {
                let snapshot = block.snapshot_at(tail)?;
                // Normalized so the "." alias lands on the process block's
                // real name.
                let mut endpoint = vec![block.name().to_owned()];
                endpoint.extend_from_slice(tail);
                self.subscriptions.subscribe(
                    block.name(),
                    request.id,
                    endpoint,
                    delta,
                    request.response,
                    snapshot,
                );
            }
            RequestKind::Unsubscribe => unreachable!("handled above"),
        }
        Ok(())
    }

    fn resolve_block(&self, name: &str) -> Result<&Arc<Block>, CoreError> {
        let key = if name == "." { self.name.as_ref() } else { name };
        self.blocks
            .get(key)
            .ok_or_else(|| CoreError::Endpoint(key.to_owned()))
    }

    fn handle_block_add(&mut self, block: Arc<Block>) -> Result<(), CoreError> {
        let name = block.name().to_owned();
        if self.blocks.insert(name.clone(), block).is_some() {
            warn!("block {name:?} was already registered; replacing");
        }

        let mut names = string_list(self.process_block.value_of("blocks"));
        if !names.contains(&name) {
            names.push(name);
            self.process_block.set_value("blocks", Value::from(names))?;
        }
        Ok(())
    }

    fn handle_block_list(
        &mut self,
        comms: Arc<dyn ClientComms>,
        names: Vec<String>,
    ) -> Result<(), CoreError> {
        {
            let mut table = self.comms.lock();
            match table
                .iter_mut()
                .find(|(existing, _)| existing.name() == comms.name())
            {
                Some(entry) => entry.1 = names,
                None => table.push((comms, names)),
            }
        }

        let mut remote = Vec::new();
        for (_, names) in self.comms.lock().iter() {
            for name in names {
                if !remote.contains(name) {
                    remote.push(name.clone());
                }
            }
        }
        self.process_block
            .set_value("remoteBlocks", Value::from(remote))?;
        Ok(())
    }
}

fn make_process_block(name: &str) -> Arc<Block> {
    let empty = Value::Array(Vec::new());
    let mut children = IndexMap::new();
    children.insert(
        "blocks".to_string(),
        Child::Attribute(
            Attribute::new(
                Meta::StringArray(StringArrayMeta::new("Blocks hosted by this Process")),
                empty.clone(),
            )
            .expect("an empty list validates"),
        ),
    );
    children.insert(
        "remoteBlocks".to_string(),
        Child::Attribute(
            Attribute::new(
                Meta::StringArray(StringArrayMeta::new(
                    "Blocks reachable via ClientComms links",
                )),
                empty,
            )
            .expect("an empty list validates"),
        ),
    );
    Block::new(name, children)
}

fn string_list(value: Option<Value>) -> Vec<String> {
    value
        .and_then(|value| match value {
            Value::Array(items) => Some(
                items
                    .into_iter()
                    .filter_map(|item| item.as_str().map(str::to_owned))
                    .collect(),
            ),
            _ => None,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use girder_schema::{Dtype, MapMeta, NumberMeta, Object, StringMeta};
    use serde_json::json;

    use super::*;
    use crate::block::tests::two_attr_block;
    use crate::block::{Method, MethodFn};
    use crate::request::{response_channel, ResponseReceiver};

    fn expect_update(response: Message, id: u64) -> Value {
        match response {
            Message::Update { id: got, value } => {
                assert_eq!(got, id);
                value
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    fn expect_delta(response: Message, id: u64) -> Vec<Change> {
        match response {
            Message::Delta { id: got, changes } => {
                assert_eq!(got, id);
                changes
            }
            other => panic!("expected Delta, got {other:?}"),
        }
    }

    fn expect_return(response: Message, id: u64) -> Value {
        match response {
            Message::Return { id: got, value } => {
                assert_eq!(got, id);
                value
            }
            other => panic!("expected Return, got {other:?}"),
        }
    }

    fn assert_drained(rx: &ResponseReceiver) {
        assert!(rx.try_recv().is_err(), "expected no further responses");
    }

    fn greet_method() -> Method {
        let takes =
            MapMeta::new("").with_element("name", Meta::String(StringMeta::new("who")), true);
        let returns = MapMeta::new("").with_element(
            "greeting",
            Meta::String(StringMeta::new("the greeting")),
            false,
        );
        let func: MethodFn = Arc::new(|params: Object| {
            async move {
                let name = params["name"].as_str().unwrap_or_default().to_owned();
                let mut out = Object::new();
                out.insert("greeting".into(), json!(format!("Hello {name}")));
                Ok(out)
            }
            .boxed()
        });
        Method::new(takes, returns, func)
    }

    fn hello_block(name: &str) -> Arc<Block> {
        let mut children = IndexMap::new();
        children.insert("greet".to_string(), Child::Method(greet_method()));
        Block::new(name, children)
    }

    #[tokio::test]
    async fn get_resolves_into_the_block_tree() {
        let (handle, join) = Process::new("proc").start();
        handle.add_block(two_attr_block("b", "v", "o"));

        let (tx, rx) = response_channel();
        handle.submit(Request::get(
            1,
            vec!["b".into(), "attr".into(), "value".into()],
            tx,
        ));
        let value = expect_return(rx.recv_async().await.unwrap(), 1);
        assert_eq!(value, json!("v"));

        handle.stop();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn bad_endpoints_error_without_killing_the_loop() {
        let (handle, join) = Process::new("proc").start();
        handle.add_block(two_attr_block("b", "v", "o"));

        let (tx, rx) = response_channel();
        handle.submit(Request::get(1, vec!["nope".into()], tx.clone()));
        assert!(matches!(
            rx.recv_async().await.unwrap(),
            Message::Error { id: 1, .. }
        ));

        // The loop is still serving.
        handle.submit(Request::get(2, vec!["b".into(), "attr2".into(), "value".into()], tx));
        assert_eq!(expect_return(rx.recv_async().await.unwrap(), 2), json!("o"));

        handle.stop();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn put_runs_the_hook_and_notifies() {
        let (handle, join) = Process::new("proc").start();
        let mut children = IndexMap::new();
        children.insert(
            "counter".to_string(),
            Child::Attribute(
                Attribute::new(Meta::Number(NumberMeta::new("", Dtype::Uint32)), json!(0))
                    .unwrap(),
            ),
        );
        let block = Block::new("c", children);
        let target = Arc::downgrade(&block);
        block
            .set_put(
                "counter",
                Arc::new(move |value| match target.upgrade() {
                    Some(block) => block.set_value("counter", value),
                    None => Err(CoreError::Method("block is gone".into())),
                }),
            )
            .unwrap();
        handle.add_block(block);

        let (sub_tx, sub_rx) = response_channel();
        handle.submit(Request::subscribe(5, vec!["c".into()], false, sub_tx));
        expect_update(sub_rx.recv_async().await.unwrap(), 5);

        let (tx, rx) = response_channel();
        handle.submit(Request::put(
            6,
            vec!["c".into(), "counter".into()],
            json!(3.0),
            tx,
        ));
        assert_eq!(expect_return(rx.recv_async().await.unwrap(), 6), json!(3));

        let update = expect_update(sub_rx.recv_async().await.unwrap(), 5);
        assert_eq!(update["counter"]["value"], json!(3));

        handle.stop();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn post_invokes_off_loop_and_returns() {
        let (handle, join) = Process::new("proc").start();
        handle.add_block(hello_block("hello"));

        let (tx, rx) = response_channel();
        handle.submit(Request::post(
            2,
            vec!["hello".into(), "greet".into()],
            json!({"name": "me"}),
            tx.clone(),
        ));
        let value = expect_return(rx.recv_async().await.unwrap(), 2);
        assert_eq!(value, json!({"greeting": "Hello me"}));

        // Parameter validation failures come back as Error.
        handle.submit(Request::post(
            3,
            vec!["hello".into(), "greet".into()],
            json!({}),
            tx,
        ));
        assert!(matches!(
            rx.recv_async().await.unwrap(),
            Message::Error { id: 3, .. }
        ));

        handle.stop();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn updates_collapse_to_the_round_final_state() {
        let (handle, join) = Process::new("proc").start();
        let block = two_attr_block("b", "v", "o");
        handle.add_block(block.clone());

        let (tx, rx) = response_channel();
        handle.submit(Request::subscribe(11, vec!["b".into()], false, tx));
        let initial = expect_update(rx.recv_async().await.unwrap(), 11);
        assert_eq!(initial["attr"]["value"], json!("v"));
        assert_eq!(initial["attr2"]["value"], json!("o"));

        // Two writes, one round: the intermediate value never surfaces.
        block.set_value_with_notify("attr", json!("x"), false).unwrap();
        block.set_value("attr", json!("y")).unwrap();

        let update = expect_update(rx.recv_async().await.unwrap(), 11);
        assert_eq!(update["attr"]["value"], json!("y"));

        handle.stop();
        join.await.unwrap();
        assert_drained(&rx);
    }

    #[tokio::test]
    async fn deltas_preserve_the_round_history() {
        let (handle, join) = Process::new("proc").start();
        let block = two_attr_block("b", "v", "o");
        handle.add_block(block.clone());

        let (tx, rx) = response_channel();
        handle.submit(Request::subscribe(12, vec!["b".into()], true, tx));
        let initial = expect_delta(rx.recv_async().await.unwrap(), 12);
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].path, Vec::<String>::new());
        assert_eq!(
            initial[0].value.as_ref().unwrap()["attr"]["value"],
            json!("v")
        );

        block.set_value_with_notify("attr", json!("x"), false).unwrap();
        block.set_value("attr", json!("y")).unwrap();

        let changes = expect_delta(rx.recv_async().await.unwrap(), 12);
        assert_eq!(
            changes,
            vec![
                Change::set(vec!["attr".into(), "value".into()], json!("x")),
                Change::set(vec!["attr".into(), "value".into()], json!("y")),
            ]
        );

        handle.stop();
        join.await.unwrap();
        assert_drained(&rx);
    }

    #[tokio::test]
    async fn subscriptions_filter_by_endpoint() {
        let (handle, join) = Process::new("proc").start();
        let b1 = two_attr_block("b1", "v", "v");
        let b2 = two_attr_block("b2", "v", "v");
        handle.add_block(b1.clone());
        handle.add_block(b2.clone());

        let (tx, rx) = response_channel();
        handle.submit(Request::subscribe(
            21,
            vec!["b1".into(), "attr".into()],
            true,
            tx,
        ));
        expect_delta(rx.recv_async().await.unwrap(), 21);

        b1.set_value_with_notify("attr", json!("n"), false).unwrap();
        b1.set_value_with_notify("attr2", json!("n"), false).unwrap();
        b2.set_value_with_notify("attr", json!("m"), false).unwrap();
        handle.notify_subscribers("b1");
        handle.notify_subscribers("b2");

        let changes = expect_delta(rx.recv_async().await.unwrap(), 21);
        assert_eq!(changes, vec![Change::set(vec!["value".into()], json!("n"))]);

        handle.stop();
        join.await.unwrap();
        // Nothing from b2's round, nothing from attr2.
        assert_drained(&rx);
    }

    #[tokio::test]
    async fn initial_snapshot_then_incremental_delta() {
        let (handle, join) = Process::new("proc").start();
        let mut children = IndexMap::new();
        children.insert(
            "a".to_string(),
            Child::Attribute(
                Attribute::new(Meta::Number(NumberMeta::new("", Dtype::Int64)), json!(1))
                    .unwrap(),
            ),
        );
        let block = Block::new("b", children);
        handle.add_block(block.clone());

        let (tx, rx) = response_channel();
        handle.submit(Request::subscribe(31, vec!["b".into()], true, tx));
        let initial = expect_delta(rx.recv_async().await.unwrap(), 31);
        assert_eq!(initial[0].path, Vec::<String>::new());
        assert_eq!(initial[0].value.as_ref().unwrap()["a"]["value"], json!(1));

        block.set_value("a", json!(2)).unwrap();
        let changes = expect_delta(rx.recv_async().await.unwrap(), 31);
        assert_eq!(
            changes,
            vec![Change::set(vec!["a".into(), "value".into()], json!(2))]
        );

        handle.stop();
        join.await.unwrap();
        assert_drained(&rx);
    }

    #[tokio::test]
    async fn deletions_reach_both_kinds_of_subscriber() {
        let (handle, join) = Process::new("proc").start();
        let block = two_attr_block("b", "v", "o");
        handle.add_block(block.clone());

        let (update_tx, update_rx) = response_channel();
        let (delta_tx, delta_rx) = response_channel();
        handle.submit(Request::subscribe(41, vec!["b".into()], false, update_tx));
        handle.submit(Request::subscribe(42, vec!["b".into()], true, delta_tx));
        expect_update(update_rx.recv_async().await.unwrap(), 41);
        expect_delta(delta_rx.recv_async().await.unwrap(), 42);

        block.remove_child("attr").unwrap();

        let update = expect_update(update_rx.recv_async().await.unwrap(), 41);
        assert!(update.get("attr").is_none());
        assert!(update.get("attr2").is_some());

        let changes = expect_delta(delta_rx.recv_async().await.unwrap(), 42);
        assert_eq!(changes, vec![Change::delete(vec!["attr".into()])]);

        handle.stop();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn notifies_with_nothing_pending_are_no_ops() {
        let (handle, join) = Process::new("proc").start();
        let block = two_attr_block("b", "v", "o");
        handle.add_block(block.clone());

        let (tx, rx) = response_channel();
        handle.submit(Request::subscribe(51, vec!["b".into()], false, tx));
        expect_update(rx.recv_async().await.unwrap(), 51);

        handle.notify_subscribers("b");
        block.set_value("attr", json!("final")).unwrap();
        handle.notify_subscribers("b");
        handle.notify_subscribers("b");

        let update = expect_update(rx.recv_async().await.unwrap(), 51);
        assert_eq!(update["attr"]["value"], json!("final"));

        handle.stop();
        join.await.unwrap();
        // The extra notifies produced nothing.
        assert_drained(&rx);
    }

    #[tokio::test]
    async fn pre_subscribe_changes_only_appear_in_the_snapshot() {
        let (handle, join) = Process::new("proc").start();
        let block = two_attr_block("b", "v", "o");
        handle.add_block(block.clone());

        // Change enqueued before the subscribe, notify after it.
        block.set_value_with_notify("attr", json!("x"), false).unwrap();
        let (tx, rx) = response_channel();
        handle.submit(Request::subscribe(61, vec!["b".into()], true, tx));
        handle.notify_subscribers("b");

        let initial = expect_delta(rx.recv_async().await.unwrap(), 61);
        assert_eq!(
            initial[0].value.as_ref().unwrap()["attr"]["value"],
            json!("x")
        );

        handle.stop();
        join.await.unwrap();
        // The pre-subscribe change was not replayed as a delta.
        assert_drained(&rx);
    }

    #[tokio::test]
    async fn unsubscribe_stops_the_flow() {
        let (handle, join) = Process::new("proc").start();
        let block = two_attr_block("b", "v", "o");
        handle.add_block(block.clone());

        let (tx, rx) = response_channel();
        handle.submit(Request::subscribe(71, vec!["b".into()], false, tx.clone()));
        expect_update(rx.recv_async().await.unwrap(), 71);

        handle.submit(Request::unsubscribe(71, tx));
        assert_eq!(
            expect_return(rx.recv_async().await.unwrap(), 71),
            Value::Null
        );

        block.set_value("attr", json!("x")).unwrap();

        handle.stop();
        join.await.unwrap();
        assert_drained(&rx);
    }

    #[tokio::test]
    async fn the_process_block_tracks_hosted_blocks() {
        let (handle, join) = Process::new("proc").start();
        handle.add_block(two_attr_block("b", "v", "o"));

        let (tx, rx) = response_channel();
        // The "." alias addresses the process block.
        handle.submit(Request::get(
            1,
            vec![".".into(), "blocks".into(), "value".into()],
            tx,
        ));
        let value = expect_return(rx.recv_async().await.unwrap(), 1);
        assert_eq!(value, json!(["b"]));

        handle.stop();
        join.await.unwrap();
    }

    struct NamedComms(&'static str);

    impl ClientComms for NamedComms {
        fn name(&self) -> &str {
            self.0
        }

        fn submit(&self, _request: Request) {}
    }

    #[tokio::test]
    async fn block_lists_route_to_their_comms() {
        let (handle, join) = Process::new("proc").start();
        let comms: Arc<dyn ClientComms> = Arc::new(NamedComms("cc"));
        handle.update_block_list(comms, vec!["myblock".to_string()]);

        let (tx, rx) = response_channel();
        handle.submit(Request::get(
            1,
            vec!["proc".into(), "remoteBlocks".into(), "value".into()],
            tx,
        ));
        let value = expect_return(rx.recv_async().await.unwrap(), 1);
        assert_eq!(value, json!(["myblock"]));

        assert_eq!(
            handle.get_client_comms("myblock").map(|c| c.name().to_owned()),
            Some("cc".to_owned())
        );
        assert!(handle.get_client_comms("other").is_none());

        handle.stop();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn stop_drains_preceding_events() {
        let (handle, join) = Process::new("proc").start();
        let (tx, rx) = response_channel();
        handle.add_block(two_attr_block("b", "v", "o"));
        handle.submit(Request::get(
            1,
            vec!["b".into(), "attr".into(), "value".into()],
            tx,
        ));
        handle.stop();

        // The Get was ahead of the stop, so it was served.
        join.await.unwrap();
        expect_return(rx.recv_async().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requests_after_stop_error_instead_of_vanishing() {
        let (handle, join) = Process::new("proc").start();
        handle.add_block(two_attr_block("b", "v", "o"));
        handle.stop();
        // Dropping the stopped process closes the queue.
        join.await.unwrap();

        let (tx, rx) = response_channel();
        handle.submit(Request::get(
            1,
            vec!["b".into(), "attr".into(), "value".into()],
            tx,
        ));
        match rx.try_recv().unwrap() {
            Message::Error { id, message } => {
                assert_eq!(id, 1);
                assert_eq!(message, CoreError::Stopped.to_string());
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }
}
