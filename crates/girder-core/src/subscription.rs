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

//! Subscription bookkeeping and change coalescing.
//!
//! Changes accumulate per block until that block's notify arrives; the span
//! between two notifies is one coalescing round. Per round each subscription
//! gets at most one response: delta subscribers see every relevant change in
//! arrival order, update subscribers see a single snapshot of the state after
//! the whole round.

use std::collections::HashMap;
use std::sync::Arc;

use girder_schema::{Change, Message, Path, Value};
use tracing::{trace, warn};

use crate::block::Block;
use crate::request::ResponseSender;

struct Subscription {
    id: u64,
    endpoint: Path,
    delta: bool,
    response: ResponseSender,
    /// Changes already pending when this subscription joined; they are part
    /// of its initial snapshot and must not be replayed as deltas.
    skip: usize,
}

/// All subscriptions and pending changes, keyed by block name.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    by_block: HashMap<String, Vec<Subscription>>,
    pending: HashMap<String, Vec<Change>>,
}

impl SubscriptionTable {
    /// Registers a subscription and sends its initial response from
    /// `snapshot`.
    pub fn subscribe(
        &mut self,
        block: &str,
        id: u64,
        endpoint: Path,
        delta: bool,
        response: ResponseSender,
        snapshot: Value,
    ) {
        let initial = if delta {
            Message::Delta {
                id,
                changes: vec![Change::set(Vec::new(), snapshot)],
            }
        } else {
            Message::Update {
                id,
                value: snapshot,
            }
        };
        if response.send(initial).is_err() {
            trace!("subscriber {id} on {block:?} hung up before its initial response");
            return;
        }

        let skip = self.pending.get(block).map_or(0, Vec::len);
        self.by_block.entry(block.to_owned()).or_default().push(Subscription {
            id,
            endpoint,
            delta,
            response,
            skip,
        });
    }

    /// Removes the subscription registered under `id`. Responses already in
    /// its queue are the caller's to drain.
    pub fn unsubscribe(&mut self, id: u64) -> bool {
        let mut found = false;
        for subs in self.by_block.values_mut() {
            subs.retain(|sub| {
                let matches = sub.id == id;
                found |= matches;
                !matches
            });
        }
        found
    }

    /// Appends a change to its block's pending round.
    pub fn record(&mut self, change: Change) {
        let Some(block) = change.path.first() else {
            warn!("discarding change with an empty path");
            return;
        };
        self.pending.entry(block.clone()).or_default().push(change);
    }

    /// Closes the round for `block`: drains its pending changes and
    /// materializes one response per matching subscription.
    pub fn notify(&mut self, block: &str, blocks: &HashMap<String, Arc<Block>>) {
        let changes = match self.pending.remove(block) {
            Some(changes) if !changes.is_empty() => changes,
            _ => return,
        };

        let Some(subs) = self.by_block.get_mut(block) else {
            return;
        };

        subs.retain_mut(|sub| {
            let relevant: Vec<&Change> = changes
                .iter()
                .enumerate()
                .filter(|(index, change)| *index >= sub.skip && change.starts_with(&sub.endpoint))
                .map(|(_, change)| change)
                .collect();
            sub.skip = 0;

            if relevant.is_empty() {
                return true;
            }

            let response = if sub.delta {
                Message::Delta {
                    id: sub.id,
                    changes: relevant
                        .iter()
                        .map(|change| change.strip_prefix(sub.endpoint.len()))
                        .collect(),
                }
            } else {
                // Rebuild from current state; intermediate values collapse.
                let Some(snapshot) = resolve_endpoint(blocks, &sub.endpoint) else {
                    warn!(
                        "endpoint {:?} no longer resolves; dropping subscription {}",
                        sub.endpoint, sub.id
                    );
                    return false;
                };
                Message::Update {
                    id: sub.id,
                    value: snapshot,
                }
            };

            // A closed queue means the subscriber is gone.
            sub.response.send(response).is_ok()
        });
    }
}

fn resolve_endpoint(blocks: &HashMap<String, Arc<Block>>, endpoint: &[String]) -> Option<Value> {
    let block = blocks.get(endpoint.first()?)?;
    block.snapshot_at(&endpoint[1..]).ok()
}
