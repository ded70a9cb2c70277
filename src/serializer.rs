//! Message codecs.
//!
//! Every transport carries whole serialized messages; the codec in use is
//! agreed on during the handshake and identified by its WAMP subprotocol
//! string.  JSON is a text codec, CBOR and MsgPack are binary.

use serde::{Deserialize, Serialize};

use crate::messages::Message;
use crate::{Error, ErrorKind, WampResult};

pub const WAMP_JSON: &str = "wamp.2.json";
pub const WAMP_CBOR: &str = "wamp.2.cbor";
pub const WAMP_MSGPACK: &str = "wamp.2.msgpack";

/// Message serialization algorithms, with their raw socket handshake codes.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SerializerType {
    Json = 1,
    MsgPack = 2,
    Cbor = 3,
}

impl SerializerType {
    /// The WAMP subprotocol string for this serializer.
    pub fn to_str(self) -> &'static str {
        match self {
            SerializerType::Json => WAMP_JSON,
            SerializerType::MsgPack => WAMP_MSGPACK,
            SerializerType::Cbor => WAMP_CBOR,
        }
    }

    /// Looks a serializer up by its subprotocol string.
    pub fn from_subprotocol(subprotocol: &str) -> Option<SerializerType> {
        match subprotocol {
            WAMP_JSON => Some(SerializerType::Json),
            WAMP_MSGPACK => Some(SerializerType::MsgPack),
            WAMP_CBOR => Some(SerializerType::Cbor),
            _ => None,
        }
    }

    /// Looks a serializer up by its raw socket handshake code.
    pub fn from_id(id: u8) -> Option<SerializerType> {
        match id {
            x if x == SerializerType::Json as u8 => Some(SerializerType::Json),
            x if x == SerializerType::MsgPack as u8 => Some(SerializerType::MsgPack),
            x if x == SerializerType::Cbor as u8 => Some(SerializerType::Cbor),
            _ => None,
        }
    }

    /// Whether the serializer uses binary frames on a websocket transport.
    pub fn is_binary(self) -> bool {
        !matches!(self, SerializerType::Json)
    }

    pub fn serializer(self) -> Box<dyn Serializer + Send + Sync> {
        match self {
            SerializerType::Json => Box::new(JsonSerializer),
            SerializerType::MsgPack => Box::new(MsgPackSerializer),
            SerializerType::Cbor => Box::new(CborSerializer),
        }
    }
}

/// Encodes typed messages to payload bytes and back.
pub trait Serializer {
    fn serialize(&self, message: &Message) -> WampResult<Vec<u8>>;
    fn deserialize(&self, data: &[u8]) -> WampResult<Message>;
    fn serializer_type(&self) -> SerializerType;
}

pub struct JsonSerializer;
pub struct MsgPackSerializer;
pub struct CborSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, message: &Message) -> WampResult<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| Error::new(ErrorKind::JSONError(e)))
    }

    fn deserialize(&self, data: &[u8]) -> WampResult<Message> {
        serde_json::from_slice(data).map_err(|e| Error::new(ErrorKind::JSONError(e)))
    }

    fn serializer_type(&self) -> SerializerType {
        SerializerType::Json
    }
}

impl Serializer for MsgPackSerializer {
    fn serialize(&self, message: &Message) -> WampResult<Vec<u8>> {
        let mut buf: Vec<u8> = Vec::new();
        message
            .serialize(&mut rmp_serde::Serializer::new(&mut buf).with_struct_map())
            .map_err(|e| {
                Error::new(ErrorKind::ProtocolViolation(format!(
                    "msgpack encoding failed: {}",
                    e
                )))
            })?;
        Ok(buf)
    }

    fn deserialize(&self, data: &[u8]) -> WampResult<Message> {
        let mut de = rmp_serde::Deserializer::new(data);
        Message::deserialize(&mut de).map_err(|e| Error::new(ErrorKind::MsgPackError(e)))
    }

    fn serializer_type(&self) -> SerializerType {
        SerializerType::MsgPack
    }
}

impl Serializer for CborSerializer {
    fn serialize(&self, message: &Message) -> WampResult<Vec<u8>> {
        serde_cbor::to_vec(message).map_err(|e| Error::new(ErrorKind::CBORError(e)))
    }

    fn deserialize(&self, data: &[u8]) -> WampResult<Message> {
        serde_cbor::from_slice(data).map_err(|e| Error::new(ErrorKind::CBORError(e)))
    }

    fn serializer_type(&self) -> SerializerType {
        SerializerType::Cbor
    }
}
