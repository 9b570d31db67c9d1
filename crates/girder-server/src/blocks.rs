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

//! Demo blocks served by the girder-server binary.

use std::sync::Arc;

use futures::FutureExt;
use girder_core::{Attribute, Block, Child, CoreError, Method};
use girder_schema::{Dtype, MapMeta, Meta, NumberMeta, Object, StringMeta, Value};
use indexmap::IndexMap;
use serde_json::json;

/// A block with a writeable uint32 counter and increment/reset methods.
pub fn counter_block(name: &str) -> Arc<Block> {
    let mut children = IndexMap::new();
    children.insert(
        "counter".to_string(),
        Child::Attribute(
            Attribute::new(Meta::Number(NumberMeta::new("A counter", Dtype::Uint32)), json!(0))
                .expect("zero is a valid uint32"),
        ),
    );
    children.insert(
        "increment".to_string(),
        Child::Method(Method::unbound(
            MapMeta::new("Takes nothing"),
            MapMeta::new("Returns nothing"),
        )),
    );
    children.insert(
        "reset".to_string(),
        Child::Method(Method::unbound(
            MapMeta::new("Takes nothing"),
            MapMeta::new("Returns nothing"),
        )),
    );

    let block = Block::new(name, children);

    let target = Arc::downgrade(&block);
    block
        .set_put(
            "counter",
            Arc::new(move |value| match target.upgrade() {
                Some(block) => block.set_value("counter", value),
                None => Err(CoreError::Method("counter block is gone".into())),
            }),
        )
        .expect("counter attribute exists");

    let target = Arc::downgrade(&block);
    block
        .bind_method(
            "increment",
            Arc::new(move |_params| {
                let target = target.clone();
                async move {
                    let block = target
                        .upgrade()
                        .ok_or_else(|| CoreError::Method("counter block is gone".into()))?;
                    let current = block
                        .value_of("counter")
                        .and_then(|value| value.as_u64())
                        .unwrap_or(0);
                    block.set_value("counter", Value::from(current + 1))?;
                    Ok(Object::new())
                }
                .boxed()
            }),
        )
        .expect("increment method exists");

    let target = Arc::downgrade(&block);
    block
        .bind_method(
            "reset",
            Arc::new(move |_params| {
                let target = target.clone();
                async move {
                    let block = target
                        .upgrade()
                        .ok_or_else(|| CoreError::Method("counter block is gone".into()))?;
                    block.set_value("counter", json!(0))?;
                    Ok(Object::new())
                }
                .boxed()
            }),
        )
        .expect("reset method exists");

    block
}

/// A block with a single `greet` method.
pub fn hello_block(name: &str) -> Arc<Block> {
    let takes = MapMeta::new("Takes a name").with_element(
        "name",
        Meta::String(StringMeta::new("Name of the greetee")),
        true,
    );
    let returns = MapMeta::new("Returns a greeting").with_element(
        "greeting",
        Meta::String(StringMeta::new("The greeting")),
        false,
    );

    let mut children = IndexMap::new();
    children.insert(
        "greet".to_string(),
        Child::Method(Method::new(
            takes,
            returns,
            Arc::new(|params: Object| {
                async move {
                    let name = params
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    let mut out = Object::new();
                    out.insert("greeting".into(), json!(format!("Hello {name}")));
                    Ok(out)
                }
                .boxed()
            }),
        )),
    );
    Block::new(name, children)
}

#[cfg(test)]
mod tests {
    use girder_core::{response_channel, Process, Request};
    use girder_schema::Message;

    use super::*;

    #[tokio::test]
    async fn the_counter_counts() {
        let (handle, join) = Process::new("demo").start();
        handle.add_block(counter_block("counter"));

        let (tx, rx) = response_channel();
        for id in 0..2 {
            handle.submit(Request::post(
                id,
                vec!["counter".into(), "increment".into()],
                json!({}),
                tx.clone(),
            ));
            assert!(matches!(
                rx.recv_async().await.unwrap(),
                Message::Return { .. }
            ));
        }

        handle.submit(Request::get(
            2,
            vec!["counter".into(), "counter".into(), "value".into()],
            tx.clone(),
        ));
        match rx.recv_async().await.unwrap() {
            Message::Return { value, .. } => assert_eq!(value, json!(2)),
            other => panic!("expected Return, got {other:?}"),
        }

        handle.submit(Request::post(
            3,
            vec!["counter".into(), "reset".into()],
            json!({}),
            tx.clone(),
        ));
        rx.recv_async().await.unwrap();
        handle.submit(Request::get(
            4,
            vec!["counter".into(), "counter".into(), "value".into()],
            tx,
        ));
        match rx.recv_async().await.unwrap() {
            Message::Return { value, .. } => assert_eq!(value, json!(0)),
            other => panic!("expected Return, got {other:?}"),
        }

        handle.stop();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn the_greeter_greets() {
        let (handle, join) = Process::new("demo").start();
        handle.add_block(hello_block("hello"));

        let (tx, rx) = response_channel();
        handle.submit(Request::post(
            1,
            vec!["hello".into(), "greet".into()],
            json!({"name": "me"}),
            tx,
        ));
        match rx.recv_async().await.unwrap() {
            Message::Return { value, .. } => {
                assert_eq!(value, json!({"greeting": "Hello me"}));
            }
            other => panic!("expected Return, got {other:?}"),
        }

        handle.stop();
        join.await.unwrap();
    }
}
