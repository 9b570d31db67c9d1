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

use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Value;

/// An ordered list of names addressing a node inside a block tree, rooted at
/// the block name.
pub type Path = Vec<String>;

/// A single edit to a block tree.
///
/// A change with a value writes that value at the path; a change without one
/// deletes the node at the path. On the wire this is the `[path, value]` /
/// `[path]` pair carried by [Message::Delta].
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub path: Path,
    pub value: Option<Value>,
}

impl Change {
    /// A change that writes `value` at `path`.
    pub fn set(path: impl Into<Path>, value: Value) -> Self {
        Self {
            path: path.into(),
            value: Some(value),
        }
    }

    /// A change that deletes the node at `path`.
    pub fn delete(path: impl Into<Path>) -> Self {
        Self {
            path: path.into(),
            value: None,
        }
    }

    /// Whether this change lands at or below `prefix`.
    pub fn starts_with(&self, prefix: &[String]) -> bool {
        self.path.len() >= prefix.len() && self.path[..prefix.len()] == *prefix
    }

    /// The same change with the first `len` path elements removed.
    pub fn strip_prefix(&self, len: usize) -> Self {
        Self {
            path: self.path[len..].to_vec(),
            value: self.value.clone(),
        }
    }
}

impl Serialize for Change {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.value.is_some() { 2 } else { 1 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.path)?;
        if let Some(value) = &self.value {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Change {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ChangeVisitor;

        impl<'de> Visitor<'de> for ChangeVisitor {
            type Value = Change;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a [path] or [path, value] change")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Change, A::Error> {
                let path: Path = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let value: Option<Value> = seq.next_element()?;
                if seq.next_element::<de::IgnoredAny>()?.is_some() {
                    return Err(de::Error::invalid_length(3, &self));
                }
                Ok(Change { path, value })
            }
        }

        deserializer.deserialize_seq(ChangeVisitor)
    }
}

/// A wire frame.
///
/// Every frame is a single JSON object whose first key is `typeid`. Requests
/// flow towards the process hosting the target block; responses flow back to
/// the caller, matched up by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typeid")]
pub enum Message {
    /// Read the subtree at `endpoint`.
    #[serde(rename = "malcolm:core/Get:1.0")]
    Get { id: u64, endpoint: Path },

    /// Write an attribute value through its put hook.
    #[serde(rename = "malcolm:core/Put:1.0")]
    Put { id: u64, endpoint: Path, value: Value },

    /// Invoke a method with a parameter map.
    #[serde(rename = "malcolm:core/Post:1.0")]
    Post {
        id: u64,
        endpoint: Path,
        parameters: Value,
    },

    /// Register interest in changes at `endpoint`. `delta` selects change
    /// lists over full snapshots.
    #[serde(rename = "malcolm:core/Subscribe:1.0")]
    Subscribe {
        id: u64,
        endpoint: Path,
        delta: bool,
    },

    /// Cancel the subscription created with the same `id`.
    #[serde(rename = "malcolm:core/Unsubscribe:1.0")]
    Unsubscribe { id: u64 },

    /// Final value of a Get/Put/Post.
    #[serde(rename = "malcolm:core/Return:1.0")]
    Return { id: u64, value: Value },

    /// Request failure, with the failure message verbatim.
    #[serde(rename = "malcolm:core/Error:1.0")]
    Error { id: u64, message: String },

    /// Full subtree snapshot for a non-delta subscription.
    #[serde(rename = "malcolm:core/Update:1.0")]
    Update { id: u64, value: Value },

    /// Ordered change list for a delta subscription.
    #[serde(rename = "malcolm:core/Delta:1.0")]
    Delta { id: u64, changes: Vec<Change> },
}

impl Message {
    /// The request/subscription id this frame belongs to.
    pub fn id(&self) -> u64 {
        match self {
            Message::Get { id, .. }
            | Message::Put { id, .. }
            | Message::Post { id, .. }
            | Message::Subscribe { id, .. }
            | Message::Unsubscribe { id }
            | Message::Return { id, .. }
            | Message::Error { id, .. }
            | Message::Update { id, .. }
            | Message::Delta { id, .. } => *id,
        }
    }

    /// Rewrites the frame's id in place, returning the frame.
    ///
    /// Transports use this to translate between caller-scoped and
    /// connection-scoped id namespaces.
    pub fn with_id(mut self, new: u64) -> Self {
        match &mut self {
            Message::Get { id, .. }
            | Message::Put { id, .. }
            | Message::Post { id, .. }
            | Message::Subscribe { id, .. }
            | Message::Unsubscribe { id }
            | Message::Return { id, .. }
            | Message::Error { id, .. }
            | Message::Update { id, .. }
            | Message::Delta { id, .. } => *id = new,
        }
        self
    }

    /// True for the frames that initiate work (Get/Put/Post/Subscribe/
    /// Unsubscribe), false for the frames that answer it.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::Get { .. }
                | Message::Put { .. }
                | Message::Post { .. }
                | Message::Subscribe { .. }
                | Message::Unsubscribe { .. }
        )
    }
}
