//! Wire frames exchanged with the realtime broker.
//!
//! JSON frames with numeric opcodes: `{ "op": u8, "d": { ... } }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// Broker → client: a message for a subscribed destination.
pub const OP_MESSAGE: u8 = 0;
/// Client → broker: bind a subscription to a destination.
pub const OP_SUBSCRIBE: u8 = 1;
/// Client → broker: release a subscription.
pub const OP_UNSUBSCRIBE: u8 = 2;
/// Client → broker: fire-and-forget application send.
pub const OP_SEND: u8 = 3;

// ---------------------------------------------------------------------------
// Client → broker
// ---------------------------------------------------------------------------

/// A frame sent from the client to the broker.
#[derive(Debug, Serialize)]
pub struct ClientFrame {
    pub op: u8,
    pub d: Value,
}

impl ClientFrame {
    pub fn subscribe(id: u64, destination: &str) -> Self {
        Self {
            op: OP_SUBSCRIBE,
            d: serde_json::json!({ "id": id, "destination": destination }),
        }
    }

    pub fn unsubscribe(id: u64) -> Self {
        Self {
            op: OP_UNSUBSCRIBE,
            d: serde_json::json!({ "id": id }),
        }
    }

    pub fn send(destination: &str, body: Value) -> Self {
        Self {
            op: OP_SEND,
            d: serde_json::json!({ "destination": destination, "body": body }),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("frame serialization cannot fail")
    }
}

// ---------------------------------------------------------------------------
// Broker → client
// ---------------------------------------------------------------------------

/// A frame received from the broker.
#[derive(Debug, Deserialize)]
pub struct BrokerFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

/// Payload of an [`OP_MESSAGE`] frame.
#[derive(Debug, Deserialize)]
pub struct MessagePayload {
    pub destination: String,
    #[serde(default)]
    pub body: Value,
}
