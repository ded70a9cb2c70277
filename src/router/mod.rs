//! The multi-realm WAMP router.
//!
//! A router is a realm map plus the listeners that feed it.  Every accepted
//! connection runs the handshake, attaches to its realm and then gets one
//! reader thread pumping messages into the realm until the peer leaves or
//! the transport dies.

use std::collections::HashMap;
use std::net::{TcpListener, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::auth::{AnonymousAuthenticator, ServerAuthenticator};
use crate::handshake::{accept_session, Acceptor};
use crate::messages::{ErrorDetails, Message, Reason};
use crate::serializer::SerializerType;
use crate::session::BaseSession;
use crate::transport::rawsocket::SocketStream;
use crate::transport::{RawSocketTransport, WebSocketTransport};
use crate::{Error, ErrorKind, WampResult};

mod broker;
mod dealer;
mod patterns;
mod realm;

pub use self::broker::Broker;
pub use self::dealer::Dealer;
pub use self::patterns::{PatternData, PatternError};
pub use self::realm::Realm;

const SUPPORTED_SERIALIZERS: [SerializerType; 3] = [
    SerializerType::Json,
    SerializerType::Cbor,
    SerializerType::MsgPack,
];

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Represents a WAMP router: realms, listeners and the authenticator the
/// acceptor consults.
pub struct Router {
    info: Arc<RouterInfo>,
}

struct RouterInfo {
    realms: Mutex<HashMap<String, Arc<Realm>>>,
    authenticator: Arc<dyn ServerAuthenticator>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Creates a router that admits everyone as `anonymous`.
    #[inline]
    pub fn new() -> Router {
        Router::with_authenticator(Arc::new(AnonymousAuthenticator))
    }

    pub fn with_authenticator(authenticator: Arc<dyn ServerAuthenticator>) -> Router {
        Router {
            info: Arc::new(RouterInfo {
                realms: Mutex::new(HashMap::new()),
                authenticator,
            }),
        }
    }

    /// Add realm to router
    pub fn add_realm(&self, realm: &str) {
        let mut realms = self.info.realms.lock().unwrap();
        if realms.contains_key(realm) {
            return;
        }
        realms.insert(realm.to_string(), Arc::new(Realm::new()));
        debug!("Added realm {}", realm);
    }

    /// Drops a realm, detaching everything attached to it.
    pub fn remove_realm(&self, realm: &str) {
        let removed = self.info.realms.lock().unwrap().remove(realm);
        if let Some(realm) = removed {
            realm.stop();
        }
    }

    pub fn has_realm(&self, realm: &str) -> bool {
        self.info.realms.lock().unwrap().contains_key(realm)
    }

    pub fn realm(&self, realm: &str) -> Option<Arc<Realm>> {
        self.info.realms.lock().unwrap().get(realm).cloned()
    }

    /// Attaches an established session to the realm it was handshaken for.
    pub fn attach_client(&self, base: Arc<BaseSession>) -> WampResult<Arc<Realm>> {
        let realm = self
            .realm(base.realm())
            .ok_or_else(|| Error::new(ErrorKind::HandshakeError(Reason::NoSuchRealm)))?;
        realm.attach_client(base);
        Ok(realm)
    }

    pub fn detach_client(&self, realm: &str, session_id: crate::ID) {
        if let Some(realm) = self.realm(realm) {
            realm.detach_client(session_id);
        }
    }

    /// Starts a WebSocket listener on the given address.
    pub fn listen_ws(&self, addr: &str) -> JoinHandle<()> {
        let info = Arc::clone(&self.info);
        let (listener, accepted) = WebSocketTransport::listen(addr, &SUPPORTED_SERIALIZERS);
        info!("WebSocket listener on {}", addr);
        thread::spawn(move || {
            for (transport, serializer) in accepted.iter() {
                let info = Arc::clone(&info);
                thread::spawn(move || {
                    serve_connection(info, Box::new(transport), serializer);
                });
            }
            drop(listener);
        })
    }

    /// Starts a raw socket listener on the given TCP address; returns the
    /// accept thread and the locally bound address.
    pub fn listen_tcp<A: ToSocketAddrs>(
        &self,
        addr: A,
    ) -> WampResult<(JoinHandle<()>, std::net::SocketAddr)> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        info!("Raw socket listener on {}", local_addr);
        let info = Arc::clone(&self.info);
        let handle = thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Raw socket accept failed: {}", e);
                        continue;
                    }
                };
                let info = Arc::clone(&info);
                thread::spawn(move || {
                    match RawSocketTransport::accept(
                        SocketStream::Tcp(stream),
                        &SUPPORTED_SERIALIZERS,
                    ) {
                        Ok((transport, serializer)) => {
                            serve_connection(info, Box::new(transport), serializer)
                        }
                        Err(e) => debug!("Raw socket handshake failed: {}", e),
                    }
                });
            }
        });
        Ok((handle, local_addr))
    }

    /// Starts a raw socket listener on a unix domain socket path.
    #[cfg(unix)]
    pub fn listen_unix(&self, path: &std::path::Path) -> WampResult<JoinHandle<()>> {
        let _ = std::fs::remove_file(path);
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        info!("Raw socket listener on unix://{}", path.display());
        let info = Arc::clone(&self.info);
        Ok(thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Unix socket accept failed: {}", e);
                        continue;
                    }
                };
                let info = Arc::clone(&info);
                thread::spawn(move || {
                    match RawSocketTransport::accept(
                        SocketStream::Unix(stream),
                        &SUPPORTED_SERIALIZERS,
                    ) {
                        Ok((transport, serializer)) => {
                            serve_connection(info, Box::new(transport), serializer)
                        }
                        Err(e) => debug!("Unix socket handshake failed: {}", e),
                    }
                });
            }
        }))
    }

    /// Shut down the router gracefully: announce GOODBYE everywhere, give
    /// peers a moment to answer, then detach whatever is left.
    pub fn shutdown(&self) {
        let realms: Vec<Arc<Realm>> = self.info.realms.lock().unwrap().values().cloned().collect();
        for realm in &realms {
            realm.broadcast_goodbye();
        }
        info!("Goodbye messages sent. Waiting for peers to hang up");
        thread::sleep(SHUTDOWN_GRACE);
        for realm in &realms {
            realm.stop();
        }
    }
}

/// Runs the handshake for one accepted transport, attaches the session and
/// pumps its messages until it goes away.
fn serve_connection(
    info: Arc<RouterInfo>,
    transport: Box<dyn crate::transport::Transport>,
    serializer: SerializerType,
) {
    let realms = Arc::clone(&info);
    let acceptor = Acceptor::new(
        Arc::clone(&info.authenticator),
        Box::new(move |realm| realms.realms.lock().unwrap().contains_key(realm)),
    );
    let base = match accept_session(transport, serializer, acceptor) {
        Ok(base) => Arc::new(base),
        Err(e) => {
            debug!("Handshake failed: {}", e);
            return;
        }
    };

    let realm = {
        let realms = info.realms.lock().unwrap();
        match realms.get(base.realm()) {
            Some(realm) => Arc::clone(realm),
            None => {
                // The realm disappeared between handshake and attach.
                base.close();
                return;
            }
        }
    };
    realm.attach_client(Arc::clone(&base));

    let session_id = base.id();
    loop {
        let message = match base.receive_message() {
            Ok(message) => message,
            Err(e) => {
                match e.kind {
                    ErrorKind::ConnectionLost => {
                        debug!("Session {} lost its transport", session_id)
                    }
                    ref kind => {
                        // Malformed or out-of-phase traffic: abort, no reply
                        // to the offending message.
                        warn!("Session {} violated the protocol: {}", session_id, kind.description());
                        let _ = base.send_message(&Message::Abort(
                            ErrorDetails::new_with_message(&kind.description()),
                            Reason::ProtocolViolation,
                        ));
                    }
                }
                break;
            }
        };
        if realm.is_attached(session_id) {
            if let Err(e) = realm.receive_message(session_id, message) {
                warn!("Session {} violated the protocol: {}", session_id, e);
                let _ = base.send_message(&Message::Abort(
                    ErrorDetails::new_with_message(&e.kind.description()),
                    Reason::ProtocolViolation,
                ));
                break;
            }
        } else {
            // Detached by a GOODBYE we already answered.
            break;
        }
    }

    realm.detach_client(session_id);
    base.close();
}
