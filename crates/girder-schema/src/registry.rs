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

//! The typeid dispatch table.
//!
//! Each decode function checks the frame's `typeid` against the closed set of
//! tags its family knows before handing the frame to serde, so an unknown or
//! missing tag fails with the offending tag in the error rather than a
//! generic enum mismatch.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::child::BLOCK_TYPEID;
use crate::{BlockData, Child, Message, Meta, SchemaError, Value};

const MESSAGE_TYPEIDS: &[&str] = &[
    "malcolm:core/Get:1.0",
    "malcolm:core/Put:1.0",
    "malcolm:core/Post:1.0",
    "malcolm:core/Subscribe:1.0",
    "malcolm:core/Unsubscribe:1.0",
    "malcolm:core/Return:1.0",
    "malcolm:core/Error:1.0",
    "malcolm:core/Update:1.0",
    "malcolm:core/Delta:1.0",
];

const META_TYPEIDS: &[&str] = &[
    "malcolm:core/String:1.0",
    "malcolm:core/Number:1.0",
    "malcolm:core/NumberArrayMeta:1.0",
    "malcolm:core/StringArrayMeta:1.0",
    "malcolm:core/Boolean:1.0",
    "malcolm:core/Choice:1.0",
    "malcolm:core/PointGenerator:1.0",
    "malcolm:core/MapMeta:1.0",
];

const CHILD_TYPEIDS: &[&str] = &["epics:nt/NTAttribute:1.0", "malcolm:core/Method:1.0"];

/// Reads the `typeid` tag of a wire object.
pub fn typeid(value: &Value) -> Result<&str, SchemaError> {
    value
        .get("typeid")
        .ok_or_else(|| SchemaError::deserialization("frame has no typeid"))?
        .as_str()
        .ok_or_else(|| SchemaError::deserialization("typeid is not a string"))
}

fn decode<T: DeserializeOwned>(
    family: &'static str,
    known: &[&str],
    value: Value,
) -> Result<T, SchemaError> {
    let tag = typeid(&value)?.to_owned();
    if !known.contains(&tag.as_str()) {
        return Err(SchemaError::deserialization(format!(
            "unknown {family} typeid {tag:?}"
        )));
    }
    serde_json::from_value(value)
        .map_err(|err| SchemaError::deserialization(format!("malformed {tag} frame: {err}")))
}

/// Decodes a wire frame.
pub fn decode_message(value: Value) -> Result<Message, SchemaError> {
    decode("message", MESSAGE_TYPEIDS, value)
}

/// Decodes a serialized block child.
pub fn decode_child(value: Value) -> Result<Child, SchemaError> {
    decode("child", CHILD_TYPEIDS, value)
}

/// Decodes a serialized meta.
pub fn decode_meta(value: Value) -> Result<Meta, SchemaError> {
    decode("meta", META_TYPEIDS, value)
}

/// Decodes a serialized block.
pub fn decode_block(value: Value) -> Result<BlockData, SchemaError> {
    decode("block", &[BLOCK_TYPEID], value)
}

/// Serializes a typed value to its wire object.
pub fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).expect("wire types serialize infallibly")
}
