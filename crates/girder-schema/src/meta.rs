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

//! Metas describe the type of an attribute or parameter value and carry the
//! rules that turn a caller-supplied value into its canonical form.
//!
//! `validate` is pure, idempotent and total: it either returns the canonical
//! value or fails with [SchemaError::Validation]. Canonical values always
//! re-validate to themselves.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{Object, SchemaError, Value};

/// The numeric width a [NumberMeta] or [NumberArrayMeta] coerces to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl Dtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::Int8 => "int8",
            Dtype::Int16 => "int16",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::Uint8 => "uint8",
            Dtype::Uint16 => "uint16",
            Dtype::Uint32 => "uint32",
            Dtype::Uint64 => "uint64",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
        }
    }

    /// Inclusive integer bounds, or `None` for the float widths.
    fn int_bounds(&self) -> Option<(i128, i128)> {
        match self {
            Dtype::Int8 => Some((i8::MIN as i128, i8::MAX as i128)),
            Dtype::Int16 => Some((i16::MIN as i128, i16::MAX as i128)),
            Dtype::Int32 => Some((i32::MIN as i128, i32::MAX as i128)),
            Dtype::Int64 => Some((i64::MIN as i128, i64::MAX as i128)),
            Dtype::Uint8 => Some((0, u8::MAX as i128)),
            Dtype::Uint16 => Some((0, u16::MAX as i128)),
            Dtype::Uint32 => Some((0, u32::MAX as i128)),
            Dtype::Uint64 => Some((0, u64::MAX as i128)),
            Dtype::Float32 | Dtype::Float64 => None,
        }
    }
}

/// Describes a string value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringMeta {
    pub description: String,
}

impl StringMeta {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

/// Describes a scalar number of a fixed width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberMeta {
    pub description: String,
    pub dtype: Dtype,
}

impl NumberMeta {
    pub fn new(description: impl Into<String>, dtype: Dtype) -> Self {
        Self {
            description: description.into(),
            dtype,
        }
    }
}

/// Describes a homogeneous numeric array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberArrayMeta {
    pub description: String,
    pub dtype: Dtype,
}

impl NumberArrayMeta {
    pub fn new(description: impl Into<String>, dtype: Dtype) -> Self {
        Self {
            description: description.into(),
            dtype,
        }
    }
}

/// Describes an array of strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringArrayMeta {
    pub description: String,
}

impl StringArrayMeta {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

/// Describes a boolean value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BooleanMeta {
    pub description: String,
}

impl BooleanMeta {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

/// Describes a string restricted to a fixed set of choices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceMeta {
    pub description: String,
    pub choices: Vec<String>,
}

impl ChoiceMeta {
    pub fn new(description: impl Into<String>, choices: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            description: description.into(),
            choices: choices.into_iter().map(Into::into).collect(),
        }
    }
}

/// Describes a serialized scan-point generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointGeneratorMeta {
    pub description: String,
}

impl PointGeneratorMeta {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

/// Describes an ordered map of named, individually-typed elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapMeta {
    pub description: String,
    pub elements: IndexMap<String, Meta>,
    pub required: Vec<String>,
}

impl MapMeta {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            elements: IndexMap::new(),
            required: Vec::new(),
        }
    }

    /// Appends an element, keeping declaration order.
    pub fn with_element(mut self, name: impl Into<String>, meta: Meta, required: bool) -> Self {
        let name = name.into();
        if required {
            self.required.push(name.clone());
        }
        self.elements.insert(name, meta);
        self
    }

    /// Validates a parameter map against this meta without wrapping it in a
    /// [Meta] first.
    pub fn validate(&self, value: &Value) -> Result<Value, SchemaError> {
        validate_map(self, value)
    }
}

/// A value descriptor.
///
/// The tag strings are the versioned wire typeids; adding a variant means
/// adding a row to the registry's dispatch table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typeid")]
pub enum Meta {
    #[serde(rename = "malcolm:core/String:1.0")]
    String(StringMeta),
    #[serde(rename = "malcolm:core/Number:1.0")]
    Number(NumberMeta),
    #[serde(rename = "malcolm:core/NumberArrayMeta:1.0")]
    NumberArray(NumberArrayMeta),
    #[serde(rename = "malcolm:core/StringArrayMeta:1.0")]
    StringArray(StringArrayMeta),
    #[serde(rename = "malcolm:core/Boolean:1.0")]
    Boolean(BooleanMeta),
    #[serde(rename = "malcolm:core/Choice:1.0")]
    Choice(ChoiceMeta),
    #[serde(rename = "malcolm:core/PointGenerator:1.0")]
    PointGenerator(PointGeneratorMeta),
    #[serde(rename = "malcolm:core/MapMeta:1.0")]
    Map(MapMeta),
}

impl Meta {
    pub fn description(&self) -> &str {
        match self {
            Meta::String(m) => &m.description,
            Meta::Number(m) => &m.description,
            Meta::NumberArray(m) => &m.description,
            Meta::StringArray(m) => &m.description,
            Meta::Boolean(m) => &m.description,
            Meta::Choice(m) => &m.description,
            Meta::PointGenerator(m) => &m.description,
            Meta::Map(m) => &m.description,
        }
    }

    /// Returns the canonical form of `value`, or rejects it.
    pub fn validate(&self, value: &Value) -> Result<Value, SchemaError> {
        match self {
            Meta::String(_) => validate_string(value),
            Meta::Number(m) => validate_number(m.dtype, value),
            Meta::NumberArray(m) => validate_number_array(m.dtype, value),
            Meta::StringArray(_) => validate_string_array(value),
            Meta::Boolean(_) => validate_boolean(value),
            Meta::Choice(m) => validate_choice(m, value),
            Meta::PointGenerator(_) => validate_point_generator(value),
            Meta::Map(m) => m.validate(value),
        }
    }
}

/// Relative comparison used to decide whether a numeric coercion lost
/// information.
fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-8 + 1e-5 * b.abs()
}

fn cast_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn validate_string(value: &Value) -> Result<Value, SchemaError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    cast_to_string(value)
        .map(Value::String)
        .ok_or_else(|| SchemaError::validation("StringMeta", format_args!("cannot cast {value} to a string")))
}

fn validate_number(dtype: Dtype, value: &Value) -> Result<Value, SchemaError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Number(_) => coerce_number(dtype, value, "NumberMeta"),
        other => Err(SchemaError::validation(
            "NumberMeta",
            format_args!("expected a number, got {other}"),
        )),
    }
}

/// Coerces a JSON number to `dtype`, rejecting anything that does not
/// round-trip (out-of-range integers, fractional values in integer widths,
/// float64 magnitudes that do not survive a float32 pass).
fn coerce_number(dtype: Dtype, value: &Value, meta: &'static str) -> Result<Value, SchemaError> {
    let number = value.as_f64().unwrap_or_default();

    if let Some((lo, hi)) = dtype.int_bounds() {
        let integer: i128 = if let Some(i) = value.as_i64() {
            i as i128
        } else if let Some(u) = value.as_u64() {
            u as i128
        } else {
            if number.fract() != 0.0 || !number.is_finite() {
                return Err(SchemaError::validation(
                    meta,
                    format_args!("lost information converting {number} to {}", dtype.as_str()),
                ));
            }
            number as i128
        };

        if integer < lo || integer > hi {
            return Err(SchemaError::validation(
                meta,
                format_args!("{integer} out of range for {}", dtype.as_str()),
            ));
        }

        return Ok(if matches!(dtype, Dtype::Uint64) {
            Value::from(integer as u64)
        } else {
            Value::from(integer as i64)
        });
    }

    match dtype {
        Dtype::Float32 => {
            let narrowed = number as f32;
            let back = narrowed as f64;
            if !back.is_finite() || !approx_eq(back, number) {
                return Err(SchemaError::validation(
                    meta,
                    format_args!("lost information converting {number} to float32"),
                ));
            }
            Ok(Value::from(back))
        }
        Dtype::Float64 => Ok(Value::from(number)),
        _ => unreachable!("integer widths handled above"),
    }
}

fn validate_number_array(dtype: Dtype, value: &Value) -> Result<Value, SchemaError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if item.is_null() {
                    return Err(SchemaError::validation(
                        "NumberArrayMeta",
                        "array elements cannot be null",
                    ));
                }
                if !item.is_number() {
                    return Err(SchemaError::validation(
                        "NumberArrayMeta",
                        format_args!("expected a number element, got {item}"),
                    ));
                }
                out.push(coerce_number(dtype, item, "NumberArrayMeta")?);
            }
            Ok(Value::Array(out))
        }
        other => Err(SchemaError::validation(
            "NumberArrayMeta",
            format_args!("expected a sequence, got {other}"),
        )),
    }
}

fn validate_string_array(value: &Value) -> Result<Value, SchemaError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if item.is_null() {
                    return Err(SchemaError::validation(
                        "StringArrayMeta",
                        "array elements cannot be null",
                    ));
                }
                let cast = cast_to_string(item).ok_or_else(|| {
                    SchemaError::validation(
                        "StringArrayMeta",
                        format_args!("cannot cast element {item} to a string"),
                    )
                })?;
                out.push(Value::String(cast));
            }
            Ok(Value::Array(out))
        }
        other => Err(SchemaError::validation(
            "StringArrayMeta",
            format_args!("expected a sequence, got {other}"),
        )),
    }
}

fn validate_boolean(value: &Value) -> Result<Value, SchemaError> {
    match value {
        Value::Null => Ok(Value::Bool(false)),
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::Number(n) => Ok(Value::Bool(n.as_f64().unwrap_or_default() != 0.0)),
        Value::String(s) => Ok(Value::Bool(!s.is_empty())),
        other => Err(SchemaError::validation(
            "BooleanMeta",
            format_args!("cannot cast {other} to a boolean"),
        )),
    }
}

fn validate_choice(meta: &ChoiceMeta, value: &Value) -> Result<Value, SchemaError> {
    let cast = cast_to_string(value).ok_or_else(|| {
        SchemaError::validation("ChoiceMeta", format_args!("cannot cast {value} to a string"))
    })?;
    if meta.choices.iter().any(|choice| *choice == cast) {
        Ok(Value::String(cast))
    } else {
        Err(SchemaError::validation(
            "ChoiceMeta",
            format_args!("{cast:?} is not one of {:?}", meta.choices),
        ))
    }
}

fn validate_point_generator(value: &Value) -> Result<Value, SchemaError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Object(_) => Ok(value.clone()),
        other => Err(SchemaError::validation(
            "PointGeneratorMeta",
            format_args!("expected a serialized generator object, got {other}"),
        )),
    }
}

fn validate_map(meta: &MapMeta, value: &Value) -> Result<Value, SchemaError> {
    let input = value.as_object().ok_or_else(|| {
        SchemaError::validation("MapMeta", format_args!("expected a map, got {value}"))
    })?;

    // Parameter maps arrive off the wire carrying their own tag; it is not an
    // element.
    for key in input.keys() {
        if key != "typeid" && !meta.elements.contains_key(key) {
            return Err(SchemaError::validation(
                "MapMeta",
                format_args!("unknown key {key:?}"),
            ));
        }
    }

    let mut out = Object::new();
    for (name, element) in &meta.elements {
        match input.get(name) {
            Some(v) => {
                out.insert(name.clone(), element.validate(v)?);
            }
            None if meta.required.iter().any(|r| r == name) => {
                return Err(SchemaError::validation(
                    "MapMeta",
                    format_args!("missing required key {name:?}"),
                ));
            }
            None => {}
        }
    }
    Ok(Value::Object(out))
}
