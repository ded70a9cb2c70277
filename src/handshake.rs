//! Session establishment.
//!
//! The [`Acceptor`] and [`Joiner`] are sans-I/O state machines: they consume
//! typed messages and produce replies, and the drivers at the bottom of this
//! module move bytes for them.  Both end in one of two ways: a fully
//! populated [`SessionDetails`], or an ABORT reason surfaced as an error.

use std::sync::Arc;

use log::{debug, warn};
use url::Url;

use crate::auth::{AuthDecision, AuthRequest, ClientAuthenticator, ServerAuthenticator};
use crate::idgen::random_id;
use crate::messages::{
    ClientRoles, ErrorDetails, HelloDetails, Message, Reason, RouterRoles, WelcomeDetails,
};
use crate::serializer::SerializerType;
use crate::session::{BaseSession, SessionDetails, SessionPhase};
use crate::transport::{RawSocketTransport, Transport, WebSocketTransport};
use crate::{Error, ErrorKind, WampResult};

/// Server side handshake engine.
pub struct Acceptor {
    authenticator: Arc<dyn ServerAuthenticator>,
    realm_exists: Box<dyn Fn(&str) -> bool + Send>,
    phase: SessionPhase,
    pending: Option<AuthRequest>,
    details: Option<SessionDetails>,
    aborted: Option<Reason>,
}

impl Acceptor {
    pub fn new(
        authenticator: Arc<dyn ServerAuthenticator>,
        realm_exists: Box<dyn Fn(&str) -> bool + Send>,
    ) -> Acceptor {
        Acceptor {
            authenticator,
            realm_exists,
            phase: SessionPhase::Connecting,
            pending: None,
            details: None,
            aborted: None,
        }
    }

    /// Feeds one inbound message in; returns the reply and whether the
    /// handshake is over.
    pub fn receive(&mut self, message: Message) -> WampResult<(Message, bool)> {
        if !self.phase.allows(&message) {
            return Err(Error::new(ErrorKind::ProtocolViolation(format!(
                "{:?} is illegal during the handshake",
                message
            ))));
        }
        self.phase.advance(&message);
        match message {
            Message::Hello(realm, details) => {
                if !(self.realm_exists)(&realm.uri) {
                    return Ok(self.abort(Reason::NoSuchRealm));
                }
                let request = AuthRequest {
                    realm: realm.uri,
                    authid: details.authid.clone(),
                    authmethods: details.authmethods.clone(),
                    authextra: details.authextra.clone(),
                };
                match self.authenticator.on_hello(&request) {
                    AuthDecision::Accept(approval) => {
                        Ok(self.welcome(&request.realm, approval))
                    }
                    AuthDecision::Challenge { authmethod, extra } => {
                        self.pending = Some(request);
                        Ok((Message::Challenge(authmethod, extra), false))
                    }
                    AuthDecision::Reject(reason) => Ok(self.abort(reason)),
                }
            }
            Message::Authenticate(signature, extra) => {
                let request = match self.pending.take() {
                    Some(request) => request,
                    None => {
                        return Err(Error::new(ErrorKind::ProtocolViolation(
                            "AUTHENTICATE without a pending challenge".to_string(),
                        )))
                    }
                };
                match self.authenticator.verify(&request, &signature, &extra) {
                    Ok(approval) => Ok(self.welcome(&request.realm, approval)),
                    Err(e) => {
                        debug!("Authentication failed: {}", e);
                        Ok(self.abort(e.into_tuple().0))
                    }
                }
            }
            other => Err(Error::new(ErrorKind::ProtocolViolation(format!(
                "{:?} is not a handshake message",
                other
            )))),
        }
    }

    fn welcome(&mut self, realm: &str, approval: crate::auth::Approval) -> (Message, bool) {
        let session_id = random_id();
        self.details = Some(SessionDetails::new(
            session_id,
            realm,
            &approval.authid,
            &approval.authrole,
        ));
        let welcome = Message::Welcome(
            session_id,
            WelcomeDetails::new_with_auth(RouterRoles::new(), &approval.authid, &approval.authrole),
        );
        self.phase.advance(&welcome);
        (welcome, true)
    }

    fn abort(&mut self, reason: Reason) -> (Message, bool) {
        let abort = Message::Abort(ErrorDetails::new(), reason.clone());
        self.phase.advance(&abort);
        self.aborted = Some(reason);
        (abort, true)
    }

    pub fn session_details(&self) -> Option<&SessionDetails> {
        self.details.as_ref()
    }

    pub fn aborted(&self) -> Option<&Reason> {
        self.aborted.as_ref()
    }
}

/// Client side handshake engine, the acceptor's dual.
pub struct Joiner {
    realm: String,
    authenticator: Option<Arc<dyn ClientAuthenticator>>,
    phase: SessionPhase,
    details: Option<SessionDetails>,
}

impl Joiner {
    pub fn new(realm: &str, authenticator: Option<Arc<dyn ClientAuthenticator>>) -> Joiner {
        Joiner {
            realm: realm.to_string(),
            authenticator,
            phase: SessionPhase::Connecting,
            details: None,
        }
    }

    /// The opening HELLO.
    pub fn hello(&mut self) -> Message {
        let mut details = HelloDetails::new(ClientRoles::new());
        if let Some(ref authenticator) = self.authenticator {
            details.authid = authenticator.authid();
            details.authmethods = authenticator.authmethods();
            details.authextra = authenticator.authextra();
        }
        let hello = Message::Hello(crate::URI::new(&self.realm), details);
        self.phase.advance(&hello);
        hello
    }

    /// Feeds one inbound message in; `None` means the session is joined.
    pub fn receive(&mut self, message: Message) -> WampResult<Option<Message>> {
        if !self.phase.allows(&message) {
            return Err(Error::new(ErrorKind::ProtocolViolation(format!(
                "{:?} is illegal during the handshake",
                message
            ))));
        }
        self.phase.advance(&message);
        match message {
            Message::Welcome(session_id, details) => {
                self.details = Some(SessionDetails::new(
                    session_id,
                    &self.realm,
                    details.authid.as_deref().unwrap_or("anonymous"),
                    details.authrole.as_deref().unwrap_or("anonymous"),
                ));
                Ok(None)
            }
            Message::Challenge(authmethod, extra) => {
                let authenticator = self.authenticator.as_ref().ok_or_else(|| {
                    Error::new(ErrorKind::HandshakeError(Reason::AuthorizationFailed))
                })?;
                let (signature, extra) = authenticator
                    .challenge(&authmethod, &extra)
                    .map_err(|e| Error::new(ErrorKind::HandshakeError(e.into_tuple().0)))?;
                Ok(Some(Message::Authenticate(signature, extra)))
            }
            Message::Abort(details, reason) => {
                warn!(
                    "Router aborted the handshake: {} ({:?})",
                    reason,
                    details.message()
                );
                Err(Error::new(ErrorKind::HandshakeError(reason)))
            }
            other => Err(Error::new(ErrorKind::ProtocolViolation(format!(
                "{:?} is not a handshake message",
                other
            )))),
        }
    }

    pub fn session_details(&self) -> Option<&SessionDetails> {
        self.details.as_ref()
    }
}

/// Runs the server side handshake over a fresh transport and returns the
/// established session.
pub fn accept_session(
    transport: Box<dyn Transport>,
    serializer_type: SerializerType,
    mut acceptor: Acceptor,
) -> WampResult<BaseSession> {
    let serializer = serializer_type.serializer();
    loop {
        let data = transport.read()?;
        let message = serializer.deserialize(&data)?;
        let (reply, done) = match acceptor.receive(message) {
            Ok(step) => step,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };
        transport.write(&serializer.serialize(&reply)?)?;
        if done {
            return match acceptor.session_details() {
                Some(details) => Ok(BaseSession::new(transport, serializer, details.clone())),
                None => {
                    let reason = acceptor
                        .aborted()
                        .cloned()
                        .unwrap_or(Reason::AuthorizationFailed);
                    transport.close();
                    Err(Error::new(ErrorKind::HandshakeError(reason)))
                }
            };
        }
    }
}

/// Runs the client side handshake over a fresh transport and returns the
/// established session.
pub fn join_session(
    transport: Box<dyn Transport>,
    serializer_type: SerializerType,
    realm: &str,
    authenticator: Option<Arc<dyn ClientAuthenticator>>,
) -> WampResult<BaseSession> {
    let serializer = serializer_type.serializer();
    let mut joiner = Joiner::new(realm, authenticator);
    transport.write(&serializer.serialize(&joiner.hello())?)?;

    loop {
        let data = transport.read()?;
        let message = serializer.deserialize(&data)?;
        match joiner.receive(message) {
            Ok(Some(reply)) => transport.write(&serializer.serialize(&reply)?)?,
            Ok(None) => {
                let details = joiner.session_details().cloned().ok_or_else(|| {
                    Error::new(ErrorKind::InvalidState("joiner finished without details"))
                })?;
                return Ok(BaseSession::new(transport, serializer, details));
            }
            Err(e) => {
                transport.close();
                return Err(e);
            }
        }
    }
}

/// Opens a transport for any of the uri schemes the joiner understands.
pub fn connect_transport(
    url: &str,
    serializers: &[SerializerType],
) -> WampResult<(Box<dyn Transport>, SerializerType)> {
    let parsed = Url::parse(url).map_err(|e| Error::new(ErrorKind::URLError(e)))?;
    match parsed.scheme() {
        "ws" | "wss" => {
            let (transport, serializer) = WebSocketTransport::connect(&parsed, serializers)?;
            Ok((Box::new(transport), serializer))
        }
        "rs" | "tcp" | "rss" | "tcps" => {
            if parsed.scheme() == "rss" || parsed.scheme() == "tcps" {
                // TLS over sync raw sockets would need a splittable stream;
                // wss covers the encrypted case.
                return Err(Error::new(ErrorKind::UnsupportedScheme(
                    parsed.scheme().to_string(),
                )));
            }
            let host = parsed
                .host_str()
                .ok_or_else(|| Error::new(ErrorKind::InvalidState("no host in uri")))?;
            let port = parsed
                .port()
                .ok_or_else(|| Error::new(ErrorKind::InvalidState("no port in uri")))?;
            let (transport, serializer) =
                RawSocketTransport::connect((host, port), serializers)?;
            Ok((Box::new(transport), serializer))
        }
        #[cfg(unix)]
        "unix" | "unix+rs" => {
            let path = std::path::Path::new(parsed.path());
            let (transport, serializer) = RawSocketTransport::connect_unix(path, serializers)?;
            Ok((Box::new(transport), serializer))
        }
        scheme => Err(Error::new(ErrorKind::UnsupportedScheme(scheme.to_string()))),
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{Acceptor, Joiner};
    use crate::auth::{
        AnonymousAuthenticator, Approval, AuthDecision, AuthRequest, ClientAuthenticator,
        ServerAuthenticator,
    };
    use crate::messages::{CallOptions, Dict, Message, Reason};
    use crate::{CallError, CallResult, ErrorKind, URI};

    struct TicketAuthenticator;

    impl ServerAuthenticator for TicketAuthenticator {
        fn on_hello(&self, request: &AuthRequest) -> AuthDecision {
            if request.authmethods.iter().any(|m| m == "ticket") {
                AuthDecision::Challenge {
                    authmethod: "ticket".to_string(),
                    extra: Dict::new(),
                }
            } else {
                AuthDecision::Reject(Reason::NotAuthorized)
            }
        }

        fn verify(
            &self,
            request: &AuthRequest,
            signature: &str,
            _extra: &Dict,
        ) -> CallResult<Approval> {
            if signature == "open sesame" {
                Ok(Approval {
                    authid: request.authid.clone().unwrap_or_default(),
                    authrole: "user".to_string(),
                })
            } else {
                Err(CallError::new(Reason::AuthorizationFailed, None, None))
            }
        }
    }

    struct TicketClient;

    impl ClientAuthenticator for TicketClient {
        fn authid(&self) -> Option<String> {
            Some("peter".to_string())
        }

        fn authmethods(&self) -> Vec<String> {
            vec!["ticket".to_string()]
        }

        fn challenge(&self, _authmethod: &str, _extra: &Dict) -> CallResult<(String, Dict)> {
            Ok(("open sesame".to_string(), Dict::new()))
        }
    }

    fn acceptor_with(authenticator: Arc<dyn ServerAuthenticator>) -> Acceptor {
        Acceptor::new(authenticator, Box::new(|realm| realm == "test.realm"))
    }

    #[test]
    fn anonymous_accept() {
        let mut acceptor = acceptor_with(Arc::new(AnonymousAuthenticator));
        let mut joiner = Joiner::new("test.realm", None);

        let (reply, done) = acceptor.receive(joiner.hello()).unwrap();
        assert!(done);
        assert!(matches!(reply, Message::Welcome(..)));
        assert!(joiner.receive(reply).unwrap().is_none());

        let server = acceptor.session_details().unwrap();
        let client = joiner.session_details().unwrap();
        assert_eq!(server.session_id, client.session_id);
        assert_eq!(client.realm, "test.realm");
        assert_eq!(client.authrole, "anonymous");
    }

    #[test]
    fn unknown_realm_aborts() {
        let mut acceptor = acceptor_with(Arc::new(AnonymousAuthenticator));
        let mut joiner = Joiner::new("no.such.realm", None);

        let (reply, done) = acceptor.receive(joiner.hello()).unwrap();
        assert!(done);
        assert!(matches!(reply, Message::Abort(_, Reason::NoSuchRealm)));
        let err = joiner.receive(reply).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::HandshakeError(Reason::NoSuchRealm)
        ));
    }

    #[test]
    fn challenge_round_trip() {
        let mut acceptor = acceptor_with(Arc::new(TicketAuthenticator));
        let mut joiner = Joiner::new("test.realm", Some(Arc::new(TicketClient)));

        let (challenge, done) = acceptor.receive(joiner.hello()).unwrap();
        assert!(!done);
        assert!(matches!(challenge, Message::Challenge(..)));

        let authenticate = joiner.receive(challenge).unwrap().unwrap();
        let (welcome, done) = acceptor.receive(authenticate).unwrap();
        assert!(done);
        assert!(matches!(welcome, Message::Welcome(..)));
        assert!(joiner.receive(welcome).unwrap().is_none());

        let details = joiner.session_details().unwrap();
        assert_eq!(details.authid, "peter");
        assert_eq!(details.authrole, "user");
    }

    #[test]
    fn bad_ticket_aborts() {
        struct WrongTicket;
        impl ClientAuthenticator for WrongTicket {
            fn authmethods(&self) -> Vec<String> {
                vec!["ticket".to_string()]
            }
            fn challenge(&self, _authmethod: &str, _extra: &Dict) -> CallResult<(String, Dict)> {
                Ok(("let me in".to_string(), Dict::new()))
            }
        }

        let mut acceptor = acceptor_with(Arc::new(TicketAuthenticator));
        let mut joiner = Joiner::new("test.realm", Some(Arc::new(WrongTicket)));

        let (challenge, _) = acceptor.receive(joiner.hello()).unwrap();
        let authenticate = joiner.receive(challenge).unwrap().unwrap();
        let (reply, done) = acceptor.receive(authenticate).unwrap();
        assert!(done);
        assert!(matches!(reply, Message::Abort(..)));
        assert!(acceptor.session_details().is_none());
    }

    #[test]
    fn non_handshake_message_is_a_violation() {
        let mut acceptor = acceptor_with(Arc::new(AnonymousAuthenticator));
        let call = Message::Call(1, CallOptions::new(), URI::new("a.b"), None, None);
        assert!(acceptor.receive(call).is_err());
    }
}
