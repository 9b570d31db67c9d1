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

use std::fmt::Display;

/// Errors produced while decoding or validating wire values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// The frame had a missing or unknown `typeid`, or its body did not match
    /// the shape the tag promised.
    #[error("deserialization failed: {reason}")]
    Deserialization { reason: String },

    /// A value was rejected by a meta's validation rules.
    #[error("{meta} rejected value: {reason}")]
    Validation { meta: &'static str, reason: String },
}

impl SchemaError {
    pub fn deserialization(reason: impl Into<String>) -> Self {
        Self::Deserialization {
            reason: reason.into(),
        }
    }

    pub fn validation(meta: &'static str, reason: impl Display) -> Self {
        Self::Validation {
            meta,
            reason: reason.to_string(),
        }
    }
}
