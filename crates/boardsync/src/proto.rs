// Protobuf envelope for the peer protocol
//
// The board payload itself stays in the `%` text layout; protobuf only frames
// the (event, payload) pair so that arbitrary payload text survives transit.

use crate::protocol::{Message, ProtocolError};
use bytes::Bytes;
use prost::Message as _;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub event: String,
    #[prost(string, tag = "2")]
    pub payload: String,
}

/// Convert internal Message to protobuf Envelope
pub fn message_to_proto(msg: &Message) -> Envelope {
    let (event, payload) = msg.encode();
    Envelope {
        event: event.as_str().to_string(),
        payload,
    }
}

/// Convert protobuf Envelope to internal Message
pub fn proto_to_message(envelope: &Envelope) -> Result<Message, ProtocolError> {
    Message::decode(&envelope.event, &envelope.payload)
}

/// Serialize a message into a frame body
pub fn encode_message(msg: &Message) -> Bytes {
    Bytes::from(message_to_proto(msg).encode_to_vec())
}

/// Parse a frame body back into a message
pub fn decode_message(body: &[u8]) -> Result<Message, ProtocolError> {
    let envelope = Envelope::decode(body).map_err(|e| ProtocolError::Frame(e.to_string()))?;
    proto_to_message(&envelope)
}
