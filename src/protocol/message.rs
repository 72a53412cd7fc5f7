//! Wire messages exchanged between the client and the tunnel engine
//!
//! Every record is a JSON object tagged by its `cmd` field:
//! ```text
//! {"cmd":"connect","id":1,"addr":"example.com","port":80}
//! {"cmd":"sync","id":1,"data":"<base64>"}
//! {"cmd":"status","id":1,"value":0}
//! {"cmd":"stop"}
//! ```

use super::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Client-chosen stream identifier, unique within a session
pub type StreamId = u32;

/// A single tunnel message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Message {
    /// Open stream `id` to `addr:port`
    Connect {
        id: StreamId,
        addr: String,
        port: u16,
    },
    /// Payload for (client to engine) or from (engine to client) stream `id`
    Sync {
        id: StreamId,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    /// Stream `id` connected (`value == 0`) or terminated (`value != 0`)
    Status { id: StreamId, value: i32 },
    /// Engine shutdown request
    Stop,
}

impl Message {
    /// Create a connect message
    pub fn connect(id: StreamId, addr: impl Into<String>, port: u16) -> Self {
        Message::Connect {
            id,
            addr: addr.into(),
            port,
        }
    }

    /// Create a data message
    pub fn sync(id: StreamId, data: Bytes) -> Self {
        Message::Sync { id, data }
    }

    /// Create a status message
    pub fn status(id: StreamId, value: i32) -> Self {
        Message::Status { id, value }
    }

    /// Stream this message refers to, if any
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Message::Connect { id, .. } | Message::Sync { id, .. } | Message::Status { id, .. } => {
                Some(*id)
            }
            Message::Stop => None,
        }
    }
}

/// Body of a POST to the tunnel endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Request {
    /// Create the session and run the engine for the lifetime of the request
    Start,
    /// Deliver batch `seq` and fetch the next page of outbound messages
    Sync {
        seq: u64,
        #[serde(default)]
        msgs: Vec<Message>,
    },
    /// Ask the engine to exit
    Stop,
}

/// Body of a sync response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Reply {
    Sync { seq: u64, msgs: Vec<Message> },
    Error,
}

/// Decode a request body
pub fn decode_request(body: &[u8]) -> Result<Request, ProtocolError> {
    Ok(serde_json::from_slice(body)?)
}

/// Encode a reply body
pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(reply)?)
}

/// Binary-safe text encoding for `sync` payloads
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
