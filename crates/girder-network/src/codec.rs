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

use girder_schema::{registry, Message, SchemaError, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Serializes a frame to a WebSocket text message.
pub fn encode(message: &Message) -> WsMessage {
    WsMessage::Text(serde_json::to_string(message).expect("wire frames serialize infallibly"))
}

/// Parses a WebSocket text payload into a frame via the registry.
pub fn decode(text: &str) -> Result<Message, SchemaError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|err| SchemaError::deserialization(format!("frame is not valid json: {err}")))?;
    registry::decode_message(value)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn frames_round_trip_with_key_order() {
        let frame = Message::Update {
            id: 3,
            value: json!({"b": 1, "a": 2}),
        };

        let encoded = encode(&frame);
        let text = encoded.to_text().unwrap();
        // Snapshot key order survives the trip.
        assert_eq!(
            text,
            r#"{"typeid":"malcolm:core/Update:1.0","id":3,"value":{"b":1,"a":2}}"#
        );
        assert_eq!(decode(text).unwrap(), frame);
    }

    #[test]
    fn junk_frames_are_rejected() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"id": 1}"#).is_err());
        assert!(decode(r#"{"typeid": "malcolm:core/Nope:1.0", "id": 1}"#).is_err());
    }
}
