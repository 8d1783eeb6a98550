//! Message type registry.
//!
//! Maps stable 16-bit type identifiers to concrete message types. Types must
//! be registered explicitly before they can be sent or received; nothing is
//! discovered implicitly.

use crate::codec::Codec;
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::{CommandMsg, Message, ResponseMsg};
use bytes::BytesMut;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;

type DecodeFn = fn(&Codec, &[u8]) -> Result<Box<dyn Any + Send>, ProtocolError>;

struct Entry {
    name: &'static str,
    rust_type: TypeId,
    decode: DecodeFn,
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<u16, Entry>,
    by_type: HashMap<TypeId, u16>,
}

fn decode_boxed<T: Message>(codec: &Codec, bytes: &[u8]) -> Result<Box<dyn Any + Send>, ProtocolError> {
    let value: T = codec.decode(bytes)?;
    Ok(Box::new(value))
}

/// Bidirectional lookup between type identifiers and message types.
///
/// Safe to share between the reading and writing paths of many
/// connections; registration may happen while traffic flows.
pub struct MessageRegistry {
    codec: Codec,
    tables: RwLock<Tables>,
}

impl MessageRegistry {
    /// Creates an empty registry.
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Creates a registry preloaded with the command and response messages.
    pub fn with_builtins() -> Self {
        let registry = Self::new(Codec::default());
        // Built-in names are fixed and known not to collide.
        let _ = registry.register::<CommandMsg>();
        let _ = registry.register::<ResponseMsg>();
        registry
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Registers `T` and returns its type identifier.
    ///
    /// Registering the same type twice is a no-op. A different type whose
    /// name hashes to an already taken identifier is rejected.
    pub fn register<T: Message>(&self) -> Result<u16, ProtocolError> {
        let id = <T as Message>::type_id();
        let rust_type = TypeId::of::<T>();

        let mut tables = self.tables.write();
        if let Some(existing) = tables.by_id.get(&id) {
            if existing.rust_type == rust_type {
                return Ok(id);
            }
            return Err(ProtocolError::TypeIdCollision {
                id,
                existing: existing.name,
                new: T::NAME,
            });
        }

        tables.by_id.insert(
            id,
            Entry {
                name: T::NAME,
                rust_type,
                decode: decode_boxed::<T>,
            },
        );
        tables.by_type.insert(rust_type, id);
        Ok(id)
    }

    /// Returns whether `T` has been registered.
    pub fn is_registered<T: Message>(&self) -> bool {
        self.tables.read().by_type.contains_key(&TypeId::of::<T>())
    }

    /// Returns whether any type is registered under `type_id`.
    pub fn contains(&self, type_id: u16) -> bool {
        self.tables.read().by_id.contains_key(&type_id)
    }

    /// Name of the type registered under `type_id`.
    pub fn name_of(&self, type_id: u16) -> Option<&'static str> {
        self.tables.read().by_id.get(&type_id).map(|e| e.name)
    }

    pub fn len(&self) -> usize {
        self.tables.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes `msg` into a complete wire frame.
    pub fn encode<T: Message>(&self, msg: &T) -> Result<BytesMut, ProtocolError> {
        let id = self
            .tables
            .read()
            .by_type
            .get(&TypeId::of::<T>())
            .copied()
            .ok_or(ProtocolError::UnregisteredType(T::NAME))?;

        let payload = self.codec.encode(msg)?;
        Frame::new(id, payload).encode()
    }

    /// Deserializes a frame payload into the type registered under `type_id`.
    pub fn decode(&self, type_id: u16, bytes: &[u8]) -> Result<Box<dyn Any + Send>, ProtocolError> {
        let decode = self
            .tables
            .read()
            .by_id
            .get(&type_id)
            .map(|e| e.decode)
            .ok_or(ProtocolError::UnknownMessageType(type_id))?;

        decode(&self.codec, bytes)
    }

    /// Deserializes a frame payload as a known type `T`.
    pub fn decode_as<T: Message>(&self, type_id: u16, bytes: &[u8]) -> Result<T, ProtocolError> {
        {
            let tables = self.tables.read();
            let entry = tables
                .by_id
                .get(&type_id)
                .ok_or(ProtocolError::UnknownMessageType(type_id))?;
            if entry.rust_type != TypeId::of::<T>() {
                return Err(ProtocolError::TypeMismatch {
                    id: type_id,
                    registered: entry.name,
                    requested: T::NAME,
                });
            }
        }
        self.codec.decode(bytes)
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRegistry")
            .field("codec", &self.codec)
            .field("types", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    impl Message for Chat {
        const NAME: &'static str = "Chat";
    }

    // Shares its wire name with `Chat`, so the identifiers collide.
    #[derive(Debug, Serialize, Deserialize)]
    struct Impostor {
        text: String,
    }

    impl Message for Impostor {
        const NAME: &'static str = "Chat";
    }

    #[test]
    fn test_builtins_registered() {
        let registry = MessageRegistry::with_builtins();
        assert!(registry.is_registered::<CommandMsg>());
        assert!(registry.is_registered::<ResponseMsg>());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.name_of(<CommandMsg as Message>::type_id()), Some("CommandMsg"));
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = MessageRegistry::new(Codec::Json);
        let first = registry.register::<Chat>().unwrap();
        let second = registry.register::<Chat>().unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_collision_is_rejected() {
        let registry = MessageRegistry::new(Codec::Json);
        registry.register::<Chat>().unwrap();
        let err = registry.register::<Impostor>().unwrap_err();
        assert!(matches!(err, ProtocolError::TypeIdCollision { .. }));
        assert!(!registry.is_registered::<Impostor>());
    }

    #[test]
    fn test_encode_requires_registration() {
        let registry = MessageRegistry::new(Codec::Json);
        let err = registry
            .encode(&Chat {
                text: "hi".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnregisteredType("Chat")));
    }

    #[test]
    fn test_encode_then_decode() {
        let registry = MessageRegistry::new(Codec::Json);
        let id = registry.register::<Chat>().unwrap();

        let mut wire = registry
            .encode(&Chat {
                text: "hello".to_string(),
            })
            .unwrap();
        let frame = Frame::decode(&mut wire, 1024).unwrap().unwrap();
        assert_eq!(frame.type_id, id);

        let any = registry.decode(frame.type_id, &frame.payload).unwrap();
        let chat = any.downcast::<Chat>().unwrap();
        assert_eq!(chat.text, "hello");
    }

    #[test]
    fn test_decode_unknown_type() {
        let registry = MessageRegistry::new(Codec::Json);
        assert!(matches!(
            registry.decode(0x1234, b"{}"),
            Err(ProtocolError::UnknownMessageType(0x1234))
        ));
    }

    #[test]
    fn test_decode_as_checks_type() {
        let registry = MessageRegistry::with_builtins();
        registry.register::<Chat>().unwrap();

        let err = registry
            .decode_as::<Chat>(<CommandMsg as Message>::type_id(), b"{}")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TypeMismatch { .. }));

        let chat: Chat = registry
            .decode_as(<Chat as Message>::type_id(), br#"{"text":"ok"}"#)
            .unwrap();
        assert_eq!(chat.text, "ok");
    }
}
