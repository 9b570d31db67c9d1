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

//! The wire schema shared by every Girder process and transport.
//!
//! Everything that crosses a process boundary is a JSON object tagged with a
//! versioned `typeid` key. This crate defines the closed families of tagged
//! values (messages, metas, block children), the validation rules attached to
//! metas, and the registry that turns raw JSON back into typed values.
//!
//! Object key order is significant: block snapshots mirror child order, so
//! all JSON handling in this crate (and its dependents) preserves insertion
//! order.

/// Serialized block children: attributes and methods.
pub mod child;

/// Error types for deserialization and validation failures.
pub mod error;

/// Wire frames: requests, responses and the change encoding.
pub mod message;

/// Value descriptors and their validation rules.
pub mod meta;

/// The typeid dispatch table.
pub mod registry;

pub use child::{AttributeData, BlockData, Child, MethodData};
pub use error::SchemaError;
pub use message::{Change, Message, Path};
pub use meta::{
    BooleanMeta, ChoiceMeta, Dtype, MapMeta, Meta, NumberArrayMeta, NumberMeta,
    PointGeneratorMeta, StringArrayMeta, StringMeta,
};

/// A dynamically-typed value on the wire.
///
/// With the `preserve_order` feature enabled, object keys keep their
/// insertion order through any number of (de)serialization round-trips.
pub type Value = serde_json::Value;

/// An ordered JSON object.
pub type Object = serde_json::Map<String, Value>;
