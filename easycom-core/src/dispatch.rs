//! Frame routing.
//!
//! Every inbound frame is routed by type identifier. Commands go to the
//! endpoint registered under their hash, responses go to the receiving
//! connection's correlator, and any other registered message type goes to
//! its typed handler.

use crate::connection::Connection;
use crate::error::CoreError;
use dashmap::DashMap;
use easycom_protocol::hash::endpoint_hash;
use easycom_protocol::{
    CommandMsg, Frame, Message, MessageRegistry, PeerId, ProtocolError, Reply, ResponseMsg,
};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

type EndpointFn = dyn Fn(PeerId, String, Responder) + Send + Sync;
type HandlerFn = dyn Fn(PeerId, Box<dyn Any + Send>) + Send + Sync;
type OutdatedFn = dyn Fn(PeerId, Reply) + Send + Sync;

struct Endpoint {
    name: String,
    handler: Arc<EndpointFn>,
}

struct TypedHandler {
    type_name: &'static str,
    handler: Arc<HandlerFn>,
}

/// Answers one command.
///
/// Consumed by [`Responder::respond`], so a command is answered at most
/// once. Dropping it without responding leaves the caller to time out.
pub struct Responder {
    conn: Weak<Connection>,
    request_id: u16,
}

impl Responder {
    pub(crate) fn new(conn: &Arc<Connection>, request_id: u16) -> Self {
        Self {
            conn: Arc::downgrade(conn),
            request_id,
        }
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Queues the response on the originating connection.
    ///
    /// Silently dropped if that connection has gone away.
    pub fn respond(self, status: u8, payload: impl Into<String>) {
        let Some(conn) = self.conn.upgrade() else {
            tracing::debug!("Dropping response id={}: connection gone", self.request_id);
            return;
        };

        let response = ResponseMsg {
            request_id: self.request_id,
            status,
            payload: payload.into(),
        };
        if let Err(e) = conn.send(&response) {
            tracing::debug!(
                "[peer {}] Dropping response id={}: {}",
                conn.peer(),
                self.request_id,
                e
            );
        }
    }

    /// Responds with status 0.
    pub fn ok(self, payload: impl Into<String>) {
        self.respond(easycom_protocol::message::STATUS_OK, payload)
    }
}

/// Routes inbound frames and owns the registration tables of one peer.
///
/// Tables are instance state; independent clients and servers in one
/// process never share registrations. Handlers run on the driver, so they
/// should hand long work off to a task and respond from there.
pub struct Dispatcher {
    registry: MessageRegistry,
    command_type: u16,
    response_type: u16,
    handlers: RwLock<HashMap<u16, TypedHandler>>,
    endpoints: RwLock<HashMap<i32, Endpoint>>,
    outbound_hashes: DashMap<String, i32>,
    on_outdated: RwLock<Option<Arc<OutdatedFn>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            registry: MessageRegistry::with_builtins(),
            command_type: <CommandMsg as Message>::type_id(),
            response_type: <ResponseMsg as Message>::type_id(),
            handlers: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
            outbound_hashes: DashMap::new(),
            on_outdated: RwLock::new(None),
        }
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    /// Registers a named endpoint.
    ///
    /// Fails if another endpoint already occupies the same hash; the first
    /// registration stays in place.
    pub fn register_endpoint<F>(&self, name: &str, handler: F) -> Result<i32, CoreError>
    where
        F: Fn(PeerId, String, Responder) + Send + Sync + 'static,
    {
        let hash = endpoint_hash(name);
        let mut endpoints = self.endpoints.write();
        if let Some(existing) = endpoints.get(&hash) {
            return Err(CoreError::EndpointCollision {
                name: name.to_string(),
                existing: existing.name.clone(),
            });
        }

        endpoints.insert(
            hash,
            Endpoint {
                name: name.to_string(),
                handler: Arc::new(handler),
            },
        );
        tracing::debug!("Registered endpoint {} (hash {})", name, hash);
        Ok(hash)
    }

    pub fn has_endpoint(&self, name: &str) -> bool {
        self.endpoints.read().contains_key(&endpoint_hash(name))
    }

    /// Registers a message type that is only ever sent.
    pub fn register_message<T: Message>(&self) -> Result<u16, CoreError> {
        Ok(self.registry.register::<T>()?)
    }

    /// Registers `T` and routes every received `T` to `handler`.
    pub fn register_message_handler<T, F>(&self, handler: F) -> Result<u16, CoreError>
    where
        T: Message,
        F: Fn(PeerId, T) + Send + Sync + 'static,
    {
        let id = self.registry.register::<T>()?;

        let mut handlers = self.handlers.write();
        if id == self.command_type || id == self.response_type || handlers.contains_key(&id) {
            return Err(CoreError::DuplicateHandler { type_name: T::NAME });
        }

        let erased = move |peer: PeerId, msg: Box<dyn Any + Send>| match msg.downcast::<T>() {
            Ok(msg) => handler(peer, *msg),
            Err(_) => tracing::warn!("[peer {}] Decoded {} has the wrong type", peer, T::NAME),
        };
        handlers.insert(
            id,
            TypedHandler {
                type_name: T::NAME,
                handler: Arc::new(erased),
            },
        );
        Ok(id)
    }

    /// Observes responses that arrive after their request was resolved.
    pub fn set_outdated_handler<F>(&self, handler: F)
    where
        F: Fn(PeerId, Reply) + Send + Sync + 'static,
    {
        *self.on_outdated.write() = Some(Arc::new(handler));
    }

    /// Hash of an outbound endpoint name, cached after the first lookup.
    pub fn endpoint_hash(&self, name: &str) -> i32 {
        if let Some(hash) = self.outbound_hashes.get(name) {
            return *hash;
        }
        let hash = endpoint_hash(name);
        self.outbound_hashes.insert(name.to_string(), hash);
        hash
    }

    /// Routes one inbound frame received on `conn`.
    ///
    /// An error means the frame could not be routed and the connection
    /// should be torn down. Unknown endpoints are not errors.
    pub fn dispatch(&self, conn: &Arc<Connection>, frame: Frame) -> Result<(), CoreError> {
        if frame.type_id == self.command_type {
            let command: CommandMsg = self.registry.decode_as(frame.type_id, &frame.payload)?;
            self.on_command(conn, command);
            return Ok(());
        }

        if frame.type_id == self.response_type {
            let response: ResponseMsg = self.registry.decode_as(frame.type_id, &frame.payload)?;
            self.on_response(conn, response);
            return Ok(());
        }

        let handler = self
            .handlers
            .read()
            .get(&frame.type_id)
            .map(|h| (h.type_name, h.handler.clone()));
        let Some((type_name, handler)) = handler else {
            return Err(ProtocolError::UnknownMessageType(frame.type_id).into());
        };

        let msg = self.registry.decode(frame.type_id, &frame.payload)?;
        tracing::debug!("[peer {}] Received {}", conn.peer(), type_name);
        handler(conn.peer(), msg);
        Ok(())
    }

    fn on_command(&self, conn: &Arc<Connection>, command: CommandMsg) {
        let handler = self
            .endpoints
            .read()
            .get(&command.endpoint_hash)
            .map(|e| e.handler.clone());

        match handler {
            Some(handler) => {
                tracing::debug!(
                    "[peer {}] Command id={} hash={}",
                    conn.peer(),
                    command.request_id,
                    command.endpoint_hash
                );
                handler(
                    conn.peer(),
                    command.payload,
                    Responder::new(conn, command.request_id),
                );
            }
            None => tracing::warn!(
                "[peer {}] Ignoring command id={} for unknown endpoint hash {}",
                conn.peer(),
                command.request_id,
                command.endpoint_hash
            ),
        }
    }

    fn on_response(&self, conn: &Arc<Connection>, response: ResponseMsg) {
        let request_id = response.request_id;
        if let Err(reply) = conn.correlator().resolve(request_id, response.into()) {
            tracing::debug!(
                "[peer {}] Outdated response for request id={}",
                conn.peer(),
                request_id
            );
            let hook = self.on_outdated.read().clone();
            if let Some(hook) = hook {
                hook(conn.peer(), reply);
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Position {
        x: i32,
        y: i32,
    }

    impl Message for Position {
        const NAME: &'static str = "Position";
    }

    fn connected(dispatcher: Arc<Dispatcher>) -> Arc<Connection> {
        let conn = Connection::new(dispatcher, PeerConfig::default());
        conn.begin_connect().unwrap();
        conn.establish(7);
        conn
    }

    fn frame_of<T: Message>(dispatcher: &Dispatcher, msg: &T) -> Frame {
        let mut wire = dispatcher.registry().encode(msg).unwrap();
        Frame::decode(&mut wire, usize::MAX).unwrap().unwrap()
    }

    #[test]
    fn test_endpoint_collision_keeps_first() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_endpoint("Aa", |_, _, r| r.ok("first")).unwrap();

        let err = dispatcher.register_endpoint("BB", |_, _, r| r.ok("second")).unwrap_err();
        match err {
            CoreError::EndpointCollision { name, existing } => {
                assert_eq!(name, "BB");
                assert_eq!(existing, "Aa");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(dispatcher.has_endpoint("Aa"));
    }

    #[test]
    fn test_command_invokes_endpoint_and_queues_response() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher
            .register_endpoint("echo", |peer, body, responder| {
                responder.respond(0, format!("{peer}:{body}"));
            })
            .unwrap();
        let conn = connected(dispatcher.clone());

        let command = CommandMsg {
            request_id: 11,
            endpoint_hash: endpoint_hash("echo"),
            payload: "hi".to_string(),
        };
        dispatcher
            .dispatch(&conn, frame_of(&dispatcher, &command))
            .unwrap();

        let queued = conn.drain_outbound();
        assert_eq!(queued.len(), 1);
        let mut wire = bytes::BytesMut::from(&queued[0][..]);
        let frame = Frame::decode(&mut wire, usize::MAX).unwrap().unwrap();
        let response: ResponseMsg = dispatcher
            .registry()
            .decode_as(frame.type_id, &frame.payload)
            .unwrap();
        assert_eq!(response.request_id, 11);
        assert_eq!(response.payload, "7:hi");
    }

    #[test]
    fn test_unknown_endpoint_is_ignored() {
        let dispatcher = Arc::new(Dispatcher::new());
        let conn = connected(dispatcher.clone());

        let command = CommandMsg {
            request_id: 1,
            endpoint_hash: endpoint_hash("missing"),
            payload: String::new(),
        };
        dispatcher
            .dispatch(&conn, frame_of(&dispatcher, &command))
            .unwrap();
        assert!(conn.drain_outbound().is_empty());
    }

    #[test]
    fn test_unhandled_type_is_an_error() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register_message::<Position>().unwrap();
        let conn = connected(dispatcher.clone());

        let frame = frame_of(&dispatcher, &Position { x: 1, y: 2 });
        let err = dispatcher.dispatch(&conn, frame).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Protocol(ProtocolError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn test_typed_handler_receives_message() {
        let dispatcher = Arc::new(Dispatcher::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher
            .register_message_handler(move |peer, pos: Position| sink.lock().push((peer, pos)))
            .unwrap();
        let conn = connected(dispatcher.clone());

        let frame = frame_of(&dispatcher, &Position { x: 3, y: 4 });
        dispatcher.dispatch(&conn, frame).unwrap();
        assert_eq!(*seen.lock(), vec![(7, Position { x: 3, y: 4 })]);
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register_message_handler(|_, _: Position| {})
            .unwrap();
        assert!(matches!(
            dispatcher.register_message_handler(|_, _: Position| {}),
            Err(CoreError::DuplicateHandler { type_name: "Position" })
        ));
        assert!(matches!(
            dispatcher.register_message_handler(|_, _: CommandMsg| {}),
            Err(CoreError::DuplicateHandler { .. })
        ));
    }

    #[test]
    fn test_outdated_response_reported() {
        let dispatcher = Arc::new(Dispatcher::new());
        let outdated = Arc::new(Mutex::new(None));
        let sink = outdated.clone();
        dispatcher.set_outdated_handler(move |peer, reply| *sink.lock() = Some((peer, reply)));
        let conn = connected(dispatcher.clone());

        let response = ResponseMsg {
            request_id: 99,
            status: 0,
            payload: "late".to_string(),
        };
        dispatcher
            .dispatch(&conn, frame_of(&dispatcher, &response))
            .unwrap();
        assert_eq!(*outdated.lock(), Some((7, Reply::ok("late"))));
    }

    #[test]
    fn test_endpoint_hash_cache() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.endpoint_hash("echo"), endpoint_hash("echo"));
        assert_eq!(dispatcher.endpoint_hash("echo"), endpoint_hash("echo"));
        assert_eq!(dispatcher.outbound_hashes.len(), 1);
    }

    #[test]
    fn test_responder_after_connection_dropped() {
        let dispatcher = Arc::new(Dispatcher::new());
        let conn = connected(dispatcher);
        let responder = Responder::new(&conn, 5);
        drop(conn);
        responder.respond(0, "nobody listens");
    }
}
