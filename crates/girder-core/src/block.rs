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

//! Blocks and their children.
//!
//! A block is a named, ordered set of attributes and methods. All writes
//! originate on the owning process's loop thread; the per-block mutex exists
//! so that snapshot readers on other threads see a consistent tree. The lock
//! is never held across a queue operation or a user-supplied hook.

use std::fmt;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use indexmap::IndexMap;
use girder_schema::{registry, AttributeData, BlockData, Change, MapMeta, Meta, MethodData, Object, Value};
use parking_lot::Mutex;

use crate::error::CoreError;
use crate::process::ProcessHandle;

/// Hook invoked when a Put request writes an attribute. Returns the value
/// actually written.
pub type PutFn = Arc<dyn Fn(Value) -> Result<Value, CoreError> + Send + Sync>;

/// The invocable behind a method. Takes the validated parameter map and
/// produces the returns map.
pub type MethodFn = Arc<dyn Fn(Object) -> BoxFuture<'static, Result<Object, CoreError>> + Send + Sync>;

/// A typed, observable field of a block.
#[derive(Clone)]
pub struct Attribute {
    meta: Meta,
    value: Value,
    put: Option<PutFn>,
}

impl Attribute {
    /// Creates an attribute, validating the initial value against `meta`.
    pub fn new(meta: Meta, initial: Value) -> Result<Self, CoreError> {
        let value = meta.validate(&initial)?;
        Ok(Self {
            meta,
            value,
            put: None,
        })
    }

    /// Rehydrates an attribute from its serialized form.
    ///
    /// The value is taken verbatim: serialized attributes come from a process
    /// that has already validated them.
    pub fn from_data(data: AttributeData) -> Self {
        Self {
            meta: data.meta,
            value: data.value,
            put: None,
        }
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn to_data(&self) -> AttributeData {
        AttributeData {
            meta: self.meta.clone(),
            value: self.value.clone(),
        }
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Attribute")
            .field("meta", &self.meta)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

/// A typed callable exposed by a block.
#[derive(Clone)]
pub struct Method {
    takes: MapMeta,
    returns: MapMeta,
    func: MethodFn,
}

impl Method {
    pub fn new(takes: MapMeta, returns: MapMeta, func: MethodFn) -> Self {
        Self {
            takes,
            returns,
            func,
        }
    }

    /// Rehydrates a method from its serialized form with the given invocable.
    pub fn from_data(data: MethodData, func: MethodFn) -> Result<Self, CoreError> {
        Ok(Self {
            takes: data.takes_map()?.clone(),
            returns: data.returns_map()?.clone(),
            func,
        })
    }

    /// A method whose invocable has not been bound yet; invoking it fails.
    /// Bind one with [Block::bind_method].
    pub fn unbound(takes: MapMeta, returns: MapMeta) -> Self {
        Self::new(takes, returns, unbound_method())
    }

    pub fn takes(&self) -> &MapMeta {
        &self.takes
    }

    pub fn returns(&self) -> &MapMeta {
        &self.returns
    }

    pub fn to_data(&self) -> MethodData {
        MethodData {
            takes: Meta::Map(self.takes.clone()),
            returns: Meta::Map(self.returns.clone()),
        }
    }

    /// Validates `parameters` against the takes map and invokes the method.
    pub async fn invoke(&self, parameters: &Value) -> Result<Object, CoreError> {
        let canonical = self.takes.validate(parameters)?;
        let canonical = canonical
            .as_object()
            .cloned()
            .unwrap_or_default();
        (self.func)(canonical).await
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Method")
            .field("takes", &self.takes)
            .field("returns", &self.returns)
            .finish_non_exhaustive()
    }
}

/// A block child.
#[derive(Debug, Clone)]
pub enum Child {
    Attribute(Attribute),
    Method(Method),
}

impl Child {
    pub fn to_data(&self) -> girder_schema::Child {
        match self {
            Child::Attribute(a) => girder_schema::Child::Attribute(a.to_data()),
            Child::Method(m) => girder_schema::Child::Method(m.to_data()),
        }
    }
}

/// The invocable given to methods rebuilt from serialized form when nothing
/// has bound them yet.
fn unbound_method() -> MethodFn {
    Arc::new(|_| {
        future::ready(Err(CoreError::Method(
            "method has no local implementation".into(),
        )))
        .boxed()
    })
}

/// A named container of attributes and methods.
pub struct Block {
    name: String,
    children: Mutex<IndexMap<String, Child>>,
    parent: Mutex<Option<ProcessHandle>>,
}

impl Block {
    pub fn new(name: impl Into<String>, children: IndexMap<String, Child>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            children: Mutex::new(children),
            parent: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installs the process handle that changes are emitted through.
    pub(crate) fn attach(&self, parent: ProcessHandle) {
        *self.parent.lock() = Some(parent);
    }

    /// Emits a change for `path` (relative to this block), prefixed with the
    /// block name.
    fn emit(&self, path: Vec<String>, value: Option<Value>, notify: bool) {
        let parent = self.parent.lock().clone();
        if let Some(parent) = parent {
            let mut full = Vec::with_capacity(path.len() + 1);
            full.push(self.name.clone());
            full.extend(path);
            parent.on_changed(Change { path: full, value }, notify);
        }
    }

    /// Serializes this block: one entry per child, in child order, after the
    /// leading typeid.
    pub fn to_value(&self) -> Value {
        let children = self.children.lock();
        let data = BlockData {
            children: children
                .iter()
                .map(|(name, child)| (name.clone(), child.to_data()))
                .collect(),
        };
        registry::to_value(&data)
    }

    /// Serializes the subtree at `tail` (a path relative to this block).
    pub fn snapshot_at(&self, tail: &[String]) -> Result<Value, CoreError> {
        let snapshot = self.to_value();
        resolve(&snapshot, tail).cloned().ok_or_else(|| {
            let mut full = vec![self.name.clone()];
            full.extend_from_slice(tail);
            CoreError::endpoint(&full)
        })
    }

    /// The current value of an attribute child.
    pub fn value_of(&self, name: &str) -> Option<Value> {
        match self.children.lock().get(name) {
            Some(Child::Attribute(a)) => Some(a.value.clone()),
            _ => None,
        }
    }

    /// Installs the invocable behind a method child.
    pub fn bind_method(&self, name: &str, func: MethodFn) -> Result<(), CoreError> {
        match self.children.lock().get_mut(name) {
            Some(Child::Method(m)) => {
                m.func = func;
                Ok(())
            }
            _ => Err(CoreError::endpoint(&[self.name.clone(), name.to_owned()])),
        }
    }

    /// Installs a put hook on an attribute child.
    pub fn set_put(&self, name: &str, put: PutFn) -> Result<(), CoreError> {
        match self.children.lock().get_mut(name) {
            Some(Child::Attribute(a)) => {
                a.put = Some(put);
                Ok(())
            }
            _ => Err(CoreError::endpoint(&[self.name.clone(), name.to_owned()])),
        }
    }

    /// Validates and writes an attribute value, emitting the change.
    pub fn set_value(&self, name: &str, value: Value) -> Result<Value, CoreError> {
        self.set_value_with_notify(name, value, true)
    }

    /// [Block::set_value] with an explicit notify flag, for callers batching
    /// several writes into one notify round.
    pub fn set_value_with_notify(
        &self,
        name: &str,
        value: Value,
        notify: bool,
    ) -> Result<Value, CoreError> {
        let canonical = {
            let mut children = self.children.lock();
            let attribute = match children.get_mut(name) {
                Some(Child::Attribute(a)) => a,
                _ => return Err(CoreError::endpoint(&[self.name.clone(), name.to_owned()])),
            };
            let canonical = attribute.meta.validate(&value)?;
            attribute.value = canonical.clone();
            canonical
        };
        self.emit(
            vec![name.to_owned(), "value".to_owned()],
            Some(canonical.clone()),
            notify,
        );
        Ok(canonical)
    }

    /// Removes a child, emitting a deletion change.
    pub fn remove_child(&self, name: &str) -> Result<(), CoreError> {
        self.remove_child_inner(name, true)
    }

    fn remove_child_inner(&self, name: &str, notify: bool) -> Result<(), CoreError> {
        let removed = self.children.lock().shift_remove(name).is_some();
        if !removed {
            return Err(CoreError::endpoint(&[self.name.clone(), name.to_owned()]));
        }
        self.emit(vec![name.to_owned()], None, notify);
        Ok(())
    }

    /// Atomically swaps the child set, emitting a single root-replace change.
    pub fn replace_children(&self, children: IndexMap<String, Child>) {
        self.replace_children_inner(children, true)
    }

    /// [Block::replace_children] without the notify barrier, for mirrors that
    /// batch a whole remote delta into one round.
    pub(crate) fn replace_children_quiet(&self, children: IndexMap<String, Child>) {
        self.replace_children_inner(children, false)
    }

    fn replace_children_inner(&self, children: IndexMap<String, Child>, notify: bool) {
        *self.children.lock() = children;
        let snapshot = self.to_value();
        self.emit(Vec::new(), Some(snapshot), notify);
    }

    /// Reads the subtree a Get addresses.
    pub fn handle_get(&self, tail: &[String]) -> Result<Value, CoreError> {
        self.snapshot_at(tail)
    }

    /// Routes a Put through the addressed attribute's put hook, returning the
    /// written value.
    pub fn handle_put(&self, tail: &[String], value: Value) -> Result<Value, CoreError> {
        let name = match tail {
            [name] => name,
            [name, leaf] if leaf.as_str() == "value" => name,
            _ => {
                let mut full = vec![self.name.clone()];
                full.extend_from_slice(tail);
                return Err(CoreError::endpoint(&full));
            }
        };

        let put = match self.children.lock().get(name.as_str()) {
            Some(Child::Attribute(a)) => a.put.clone(),
            _ => return Err(CoreError::endpoint(&[self.name.clone(), name.clone()])),
        };

        // The hook runs without the block lock; it will usually re-enter
        // through set_value.
        let put = put.ok_or_else(|| {
            CoreError::Method(format!("attribute {name:?} does not allow puts"))
        })?;
        put(value)
    }

    /// Looks up the method a Post addresses, cloned so invocation can happen
    /// off the loop without the block lock.
    pub fn method(&self, tail: &[String]) -> Result<Method, CoreError> {
        let name = match tail {
            [name] => name,
            _ => {
                let mut full = vec![self.name.clone()];
                full.extend_from_slice(tail);
                return Err(CoreError::endpoint(&full));
            }
        };
        match self.children.lock().get(name.as_str()) {
            Some(Child::Method(m)) => Ok(m.clone()),
            _ => Err(CoreError::endpoint(&[self.name.clone(), name.clone()])),
        }
    }

    /// Applies a locally-originated edit, validating attribute writes.
    pub fn update(&self, change: &Change) -> Result<(), CoreError> {
        self.apply(change, true, true)
    }

    /// Applies a remote-originated edit verbatim; the remote process is
    /// authoritative, so no validation is re-run and no notify is queued
    /// (mirrors batch one notify per delta).
    pub fn apply_delta(&self, change: &Change) -> Result<(), CoreError> {
        self.apply(change, false, false)
    }

    fn apply(&self, change: &Change, validate: bool, notify: bool) -> Result<(), CoreError> {
        let not_found = || {
            let mut full = vec![self.name.clone()];
            full.extend_from_slice(&change.path);
            CoreError::endpoint(&full)
        };

        match (change.path.as_slice(), &change.value) {
            ([], Some(value)) => {
                let data = registry::decode_block(value.clone())?;
                let children = rehydrate_children(data)?;
                self.replace_children_inner(children, notify);
                Ok(())
            }
            ([], None) => Err(not_found()),
            ([name], None) => self.remove_child_inner(name, notify),
            ([name], Some(value)) => {
                // A whole-child write: either a serialized child, or a bare
                // value aimed at an existing attribute.
                match registry::decode_child(value.clone()) {
                    Ok(data) => {
                        let mut children = self.children.lock();
                        let child = rehydrate_child(data, children.get(name.as_str()))?;
                        children.insert(name.clone(), child);
                        drop(children);
                        self.emit(vec![name.clone()], Some(value.clone()), notify);
                        Ok(())
                    }
                    Err(_) => self.apply_value(name, value, validate, notify),
                }
            }
            ([name, leaf], Some(value)) if leaf.as_str() == "value" => {
                self.apply_value(name, value, validate, notify)
            }
            _ => Err(not_found()),
        }
    }

    fn apply_value(
        &self,
        name: &str,
        value: &Value,
        validate: bool,
        notify: bool,
    ) -> Result<(), CoreError> {
        let written = {
            let mut children = self.children.lock();
            let attribute = match children.get_mut(name) {
                Some(Child::Attribute(a)) => a,
                _ => return Err(CoreError::endpoint(&[self.name.clone(), name.to_owned()])),
            };
            let written = if validate {
                attribute.meta.validate(value)?
            } else {
                value.clone()
            };
            attribute.value = written.clone();
            written
        };
        self.emit(
            vec![name.to_owned(), "value".to_owned()],
            Some(written),
            notify,
        );
        Ok(())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let children: Vec<String> = self.children.lock().keys().cloned().collect();
        f.debug_struct("Block")
            .field("name", &self.name)
            .field("children", &children)
            .finish()
    }
}

fn rehydrate_children(data: BlockData) -> Result<IndexMap<String, Child>, CoreError> {
    let mut children = IndexMap::with_capacity(data.children.len());
    for (name, child) in data.children {
        children.insert(name, rehydrate_child(child, None)?);
    }
    Ok(children)
}

/// Turns a serialized child back into a runtime one. If the slot already held
/// a method, its invocable carries over.
fn rehydrate_child(
    data: girder_schema::Child,
    existing: Option<&Child>,
) -> Result<Child, CoreError> {
    Ok(match data {
        girder_schema::Child::Attribute(a) => Child::Attribute(Attribute::from_data(a)),
        girder_schema::Child::Method(m) => {
            let func = match existing {
                Some(Child::Method(prev)) => prev.func.clone(),
                _ => unbound_method(),
            };
            Child::Method(Method::from_data(m, func)?)
        }
    })
}

/// Walks a serialized tree along `path`.
fn resolve<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut node = value;
    for key in path {
        node = node.get(key)?;
    }
    Some(node)
}
