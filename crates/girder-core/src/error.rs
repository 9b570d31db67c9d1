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

use girder_schema::SchemaError;

/// Errors raised while routing requests and mirroring blocks.
///
/// Inside the process loop these become [Error][girder_schema::Message::Error]
/// responses on the offending request's queue; the loop itself logs and keeps
/// going.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A wire value failed to decode or validate.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A path did not resolve in the target block.
    #[error("endpoint {0:?} does not resolve")]
    Endpoint(String),

    /// A method or put hook invocation failed; carries the failure message
    /// verbatim.
    #[error("invocation failed: {0}")]
    Method(String),

    /// The comms layer failed; in-flight callers see this as an Error
    /// response.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The target process is no longer running. Requests submitted after
    /// stop get this as an Error response on their own queue.
    #[error("process has stopped")]
    Stopped,
}

impl CoreError {
    /// An [CoreError::Endpoint] for the given path.
    pub fn endpoint(path: &[String]) -> Self {
        Self::Endpoint(path.join("."))
    }
}
