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

//! The client side of a comms link.
//!
//! A [ClientComms] carries requests from this process to a remote one and
//! routes the responses back to each request's own queue. Transports implement
//! the trait; [RequestTracker] does the id bookkeeping they all share.

use std::collections::HashMap;
use std::fmt;

use girder_schema::Message;
use tracing::{debug, trace};

use crate::request::{Request, ResponseSender};

/// A transport that lets this process act as a client to a remote process.
pub trait ClientComms: Send + Sync {
    /// Name identifying this link in logs and routing tables.
    fn name(&self) -> &str;

    /// Queues a request for delivery to the remote process. Responses arrive
    /// on the request's response queue, matched by id.
    fn submit(&self, request: Request);
}

impl fmt::Debug for dyn ClientComms {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ClientComms({:?})", self.name())
    }
}

struct InFlight {
    caller_id: u64,
    response: ResponseSender,
    /// Subscriptions stay tracked after their first response.
    persistent: bool,
}

/// Maps wire ids to the callers waiting on them.
///
/// Caller-chosen ids are only unique per caller (every controller uses the
/// same two constants), so the tracker hands each request a fresh wire id and
/// translates back when responses arrive.
pub struct RequestTracker {
    next_id: u64,
    in_flight: HashMap<u64, InFlight>,
}

impl RequestTracker {
    /// Creates a tracker whose allocated wire ids start at `first_id`,
    /// leaving lower ids free for the transport's own subscriptions.
    pub fn new(first_id: u64) -> Self {
        Self {
            next_id: first_id,
            in_flight: HashMap::new(),
        }
    }

    /// Registers a request and returns the wire id to send it under.
    pub fn track(&mut self, request: &Request) -> u64 {
        let wire_id = self.next_id;
        self.next_id += 1;
        self.in_flight.insert(
            wire_id,
            InFlight {
                caller_id: request.id,
                response: request.response.clone(),
                persistent: request.is_subscribe(),
            },
        );
        wire_id
    }

    /// Registers a request under a specific wire id.
    ///
    /// An Unsubscribe has to travel under its subscription's wire id (that is
    /// how the remote keys it), so its ack cannot use a fresh id.
    pub fn track_at(&mut self, wire_id: u64, request: &Request) {
        self.in_flight.insert(
            wire_id,
            InFlight {
                caller_id: request.id,
                response: request.response.clone(),
                persistent: request.is_subscribe(),
            },
        );
    }

    /// Forgets the subscription a caller registered under `caller_id`,
    /// returning its wire id so an Unsubscribe can be sent for it.
    pub fn untrack_subscription(&mut self, caller_id: u64) -> Option<u64> {
        let wire_id = self
            .in_flight
            .iter()
            .find(|(_, entry)| entry.persistent && entry.caller_id == caller_id)
            .map(|(wire_id, _)| *wire_id)?;
        self.in_flight.remove(&wire_id);
        Some(wire_id)
    }

    /// Routes a response to its caller, translating the wire id back to the
    /// caller's id. Returns false for ids nothing is waiting on.
    pub fn route(&mut self, response: Message) -> bool {
        let wire_id = response.id();
        let Some(entry) = self.in_flight.get(&wire_id) else {
            trace!("dropping response for untracked id {wire_id}");
            return false;
        };

        let done = !entry.persistent
            && matches!(response, Message::Return { .. } | Message::Error { .. });
        let delivered = entry
            .response
            .send(response.with_id(entry.caller_id))
            .is_ok();

        if done || !delivered {
            self.in_flight.remove(&wire_id);
        }
        delivered
    }

    /// Fails every in-flight request with a transport error. Used when the
    /// connection drops.
    pub fn fail_all(&mut self, reason: &str) {
        debug!(
            "failing {} in-flight requests: {reason}",
            self.in_flight.len()
        );
        for (_, entry) in self.in_flight.drain() {
            let _ = entry.response.send(Message::Error {
                id: entry.caller_id,
                message: reason.to_owned(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::request::response_channel;

    #[test]
    fn routes_by_wire_id_and_translates_back() {
        let mut tracker = RequestTracker::new(10);
        let (tx, rx) = response_channel();
        let request = Request::get(3, vec!["b".into()], tx);

        let wire_id = tracker.track(&request);
        assert_eq!(wire_id, 10);

        assert!(tracker.route(Message::Return {
            id: wire_id,
            value: json!(1),
        }));
        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.id(), 3);

        // Transient entries are gone after their Return.
        assert!(!tracker.route(Message::Return {
            id: wire_id,
            value: json!(1),
        }));
    }

    #[test]
    fn subscriptions_outlive_their_first_response() {
        let mut tracker = RequestTracker::new(1);
        let (tx, rx) = response_channel();
        let request = Request::subscribe(0, vec!["b".into()], true, tx);
        let wire_id = tracker.track(&request);

        for _ in 0..2 {
            assert!(tracker.route(Message::Update {
                id: wire_id,
                value: json!({}),
            }));
        }
        assert_eq!(rx.try_recv().unwrap().id(), 0);
        assert_eq!(rx.try_recv().unwrap().id(), 0);

        assert_eq!(tracker.untrack_subscription(0), Some(wire_id));
        assert!(!tracker.route(Message::Update {
            id: wire_id,
            value: json!({}),
        }));
    }

    #[test]
    fn fail_all_reaches_every_caller() {
        let mut tracker = RequestTracker::new(1);
        let (tx, rx) = response_channel();
        tracker.track(&Request::get(1, vec!["a".into()], tx.clone()));
        tracker.track(&Request::get(2, vec!["b".into()], tx));

        tracker.fail_all("connection closed");
        let mut ids: Vec<u64> = (0..2)
            .map(|_| {
                let response = rx.try_recv().unwrap();
                assert!(matches!(response, Message::Error { .. }));
                response.id()
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }
}
