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

//! Serialized block children.
//!
//! A block's wire form is an object holding one entry per child, in child
//! order, after the leading `typeid`. Children are either attributes (a meta
//! plus its current value) or methods (parameter maps for what they take and
//! return). The runtime wraps these data shapes with behavior; this module is
//! only the shapes.

use std::fmt;

use indexmap::IndexMap;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Meta, SchemaError, Value};

/// The wire tag of a serialized block.
pub const BLOCK_TYPEID: &str = "malcolm:core/Block:1.0";

/// A typed, observable field of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeData {
    pub meta: Meta,
    pub value: Value,
}

/// A typed callable exposed by a block.
///
/// `takes` and `returns` are serialized metas and must both be map metas;
/// [MethodData::takes_map] and [MethodData::returns_map] enforce that when
/// the runtime builds an invocable out of this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodData {
    pub takes: Meta,
    pub returns: Meta,
}

impl MethodData {
    pub fn takes_map(&self) -> Result<&crate::MapMeta, SchemaError> {
        match &self.takes {
            Meta::Map(m) => Ok(m),
            other => Err(SchemaError::deserialization(format!(
                "method takes must be a map meta, got {other:?}"
            ))),
        }
    }

    pub fn returns_map(&self) -> Result<&crate::MapMeta, SchemaError> {
        match &self.returns {
            Meta::Map(m) => Ok(m),
            other => Err(SchemaError::deserialization(format!(
                "method returns must be a map meta, got {other:?}"
            ))),
        }
    }
}

/// A serialized block child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typeid")]
pub enum Child {
    #[serde(rename = "epics:nt/NTAttribute:1.0")]
    Attribute(AttributeData),
    #[serde(rename = "malcolm:core/Method:1.0")]
    Method(MethodData),
}

/// A serialized block: its children, in order.
///
/// The tag is not a struct field because it shares the object with
/// user-chosen child names, so the serde impls are written by hand.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlockData {
    pub children: IndexMap<String, Child>,
}

impl Serialize for BlockData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.children.len() + 1))?;
        map.serialize_entry("typeid", BLOCK_TYPEID)?;
        for (name, child) in &self.children {
            map.serialize_entry(name, child)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for BlockData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BlockVisitor;

        impl<'de> Visitor<'de> for BlockVisitor {
            type Value = BlockData;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a typeid-tagged block object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<BlockData, A::Error> {
                let mut children = IndexMap::new();
                let mut tagged = false;
                while let Some(key) = map.next_key::<String>()? {
                    if key == "typeid" {
                        let tag: String = map.next_value()?;
                        if tag != BLOCK_TYPEID {
                            return Err(de::Error::custom(format!(
                                "expected typeid {BLOCK_TYPEID:?}, got {tag:?}"
                            )));
                        }
                        tagged = true;
                    } else {
                        children.insert(key, map.next_value()?);
                    }
                }
                if !tagged {
                    return Err(de::Error::missing_field("typeid"));
                }
                Ok(BlockData { children })
            }
        }

        deserializer.deserialize_map(BlockVisitor)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{Dtype, MapMeta, NumberMeta, StringMeta};

    fn counter_attribute() -> Child {
        Child::Attribute(AttributeData {
            meta: Meta::Number(NumberMeta::new("A counter", Dtype::Uint32)),
            value: json!(0),
        })
    }

    fn greet_method() -> Child {
        Child::Method(MethodData {
            takes: Meta::Map(MapMeta::new("").with_element(
                "name",
                Meta::String(StringMeta::new("Name of greetee")),
                true,
            )),
            returns: Meta::Map(MapMeta::new("").with_element(
                "greeting",
                Meta::String(StringMeta::new("The greeting")),
                false,
            )),
        })
    }

    #[test]
    fn attribute_round_trip() {
        let child = counter_attribute();
        let value = serde_json::to_value(&child).unwrap();
        assert_eq!(value["typeid"], json!("epics:nt/NTAttribute:1.0"));
        assert_eq!(value["value"], json!(0));
        assert_eq!(serde_json::from_value::<Child>(value).unwrap(), child);
    }

    #[test]
    fn method_round_trip() {
        let child = greet_method();
        let value = serde_json::to_value(&child).unwrap();
        assert_eq!(value["typeid"], json!("malcolm:core/Method:1.0"));
        assert_eq!(value["takes"]["typeid"], json!("malcolm:core/MapMeta:1.0"));
        assert_eq!(serde_json::from_value::<Child>(value).unwrap(), child);
    }

    #[test]
    fn method_takes_must_be_a_map() {
        let data = MethodData {
            takes: Meta::String(StringMeta::new("")),
            returns: Meta::Map(MapMeta::new("")),
        };
        assert!(data.takes_map().is_err());
        assert!(data.returns_map().is_ok());
    }

    #[test]
    fn block_preserves_child_order() {
        let mut children = IndexMap::new();
        children.insert("greet".to_string(), greet_method());
        children.insert("counter".to_string(), counter_attribute());
        let block = BlockData { children };

        let text = serde_json::to_string(&block).unwrap();
        let keys: Vec<_> = serde_json::from_str::<crate::Object>(&text)
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(keys, vec!["typeid", "greet", "counter"]);

        assert_eq!(serde_json::from_str::<BlockData>(&text).unwrap(), block);
    }

    #[test]
    fn block_requires_its_tag() {
        assert!(serde_json::from_value::<BlockData>(json!({})).is_err());
        assert!(
            serde_json::from_value::<BlockData>(json!({"typeid": "malcolm:core/Get:1.0"})).is_err()
        );
    }
}
