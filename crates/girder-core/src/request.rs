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

//! In-process requests.
//!
//! A [Request] is a wire request frame paired with the flume channel its
//! responses should land on. Response queues are plain channels so that
//! callers on any thread, async or not, can wait on them; the process loop
//! and transports only ever send.

use girder_schema::{Message, Path, Value};

/// Sending half of a response queue.
pub type ResponseSender = flume::Sender<Message>;

/// Receiving half of a response queue.
pub type ResponseReceiver = flume::Receiver<Message>;

/// Creates a response queue for a caller to wait on.
pub fn response_channel() -> (ResponseSender, ResponseReceiver) {
    flume::unbounded()
}

/// The operation a request asks for.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Get,
    Put { value: Value },
    Post { parameters: Value },
    Subscribe { delta: bool },
    Unsubscribe,
}

/// A request bound for a process queue or a comms link.
#[derive(Debug, Clone)]
pub struct Request {
    /// Caller-chosen id; every response carries it back.
    pub id: u64,

    /// Path to the target node, rooted at a block name. Empty for
    /// [RequestKind::Unsubscribe].
    pub endpoint: Path,

    pub kind: RequestKind,

    /// Where responses for this request are delivered.
    pub response: ResponseSender,
}

impl Request {
    pub fn get(id: u64, endpoint: Path, response: ResponseSender) -> Self {
        Self {
            id,
            endpoint,
            kind: RequestKind::Get,
            response,
        }
    }

    pub fn put(id: u64, endpoint: Path, value: Value, response: ResponseSender) -> Self {
        Self {
            id,
            endpoint,
            kind: RequestKind::Put { value },
            response,
        }
    }

    pub fn post(id: u64, endpoint: Path, parameters: Value, response: ResponseSender) -> Self {
        Self {
            id,
            endpoint,
            kind: RequestKind::Post { parameters },
            response,
        }
    }

    pub fn subscribe(id: u64, endpoint: Path, delta: bool, response: ResponseSender) -> Self {
        Self {
            id,
            endpoint,
            kind: RequestKind::Subscribe { delta },
            response,
        }
    }

    pub fn unsubscribe(id: u64, response: ResponseSender) -> Self {
        Self {
            id,
            endpoint: Vec::new(),
            kind: RequestKind::Unsubscribe,
            response,
        }
    }

    /// Pairs a request frame with a response queue. Response frames yield
    /// `None`.
    pub fn from_message(message: Message, response: ResponseSender) -> Option<Self> {
        let request = match message {
            Message::Get { id, endpoint } => Self::get(id, endpoint, response),
            Message::Put {
                id,
                endpoint,
                value,
            } => Self::put(id, endpoint, value, response),
            Message::Post {
                id,
                endpoint,
                parameters,
            } => Self::post(id, endpoint, parameters, response),
            Message::Subscribe {
                id,
                endpoint,
                delta,
            } => Self::subscribe(id, endpoint, delta, response),
            Message::Unsubscribe { id } => Self::unsubscribe(id, response),
            _ => return None,
        };
        Some(request)
    }

    /// The wire form of this request.
    pub fn to_message(&self) -> Message {
        match &self.kind {
            RequestKind::Get => Message::Get {
                id: self.id,
                endpoint: self.endpoint.clone(),
            },
            RequestKind::Put { value } => Message::Put {
                id: self.id,
                endpoint: self.endpoint.clone(),
                value: value.clone(),
            },
            RequestKind::Post { parameters } => Message::Post {
                id: self.id,
                endpoint: self.endpoint.clone(),
                parameters: parameters.clone(),
            },
            RequestKind::Subscribe { delta } => Message::Subscribe {
                id: self.id,
                endpoint: self.endpoint.clone(),
                delta: *delta,
            },
            RequestKind::Unsubscribe => Message::Unsubscribe { id: self.id },
        }
    }

    /// True if responses to this request should keep flowing after the first
    /// one.
    pub fn is_subscribe(&self) -> bool {
        matches!(self.kind, RequestKind::Subscribe { .. })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_round_trip() {
        let (tx, _rx) = response_channel();
        let frame = Message::Post {
            id: 4,
            endpoint: vec!["hello".into(), "greet".into()],
            parameters: json!({"name": "x"}),
        };

        let request = Request::from_message(frame.clone(), tx.clone()).unwrap();
        assert_eq!(request.to_message(), frame);

        // Responses do not convert.
        let response = Message::Return {
            id: 4,
            value: json!(null),
        };
        assert!(Request::from_message(response, tx).is_none());
    }
}
