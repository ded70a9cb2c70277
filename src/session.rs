//! Session plumbing shared by both ends of a connection.
//!
//! [`SessionPhase`] is the sans-I/O protocol state machine: it knows which
//! message types are legal at which point of a session's life and advances
//! on the messages that move a session along.  [`BaseSession`] glues a live
//! transport, a serializer and the negotiated [`SessionDetails`] together
//! and speaks typed messages.

use std::sync::Mutex;
use std::time::Duration;

use log::trace;

use crate::messages::Message;
use crate::serializer::Serializer;
use crate::transport::Transport;
use crate::{Error, ErrorKind, WampResult, ID};

/// Where in its life a session currently is.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SessionPhase {
    /// Transport is up, no HELLO seen or sent yet.
    Connecting,
    /// HELLO is in flight; CHALLENGE/AUTHENTICATE may follow.
    Handshaking,
    /// WELCOME exchanged; the session routes messages.
    Established,
    /// GOODBYE sent, waiting for the peer's GOODBYE.
    Closing,
    Closed,
}

impl SessionPhase {
    /// Whether receiving this message type is legal in the current phase.
    ///
    /// An illegal message is a protocol violation: the session is torn down
    /// without a reply.
    pub fn allows(&self, message: &Message) -> bool {
        match *self {
            SessionPhase::Connecting => matches!(message, Message::Hello(..)),
            SessionPhase::Handshaking => matches!(
                message,
                Message::Welcome(..)
                    | Message::Challenge(..)
                    | Message::Authenticate(..)
                    | Message::Abort(..)
            ),
            SessionPhase::Established => !matches!(
                message,
                Message::Hello(..)
                    | Message::Welcome(..)
                    | Message::Challenge(..)
                    | Message::Authenticate(..)
            ),
            SessionPhase::Closing => matches!(message, Message::Goodbye(..) | Message::Abort(..)),
            SessionPhase::Closed => false,
        }
    }

    /// Advances the phase for a message we received or sent.
    pub fn advance(&mut self, message: &Message) {
        let next = match (*self, message) {
            (SessionPhase::Connecting, Message::Hello(..)) => SessionPhase::Handshaking,
            (SessionPhase::Handshaking, Message::Welcome(..)) => SessionPhase::Established,
            (SessionPhase::Handshaking, Message::Abort(..)) => SessionPhase::Closed,
            (SessionPhase::Established, Message::Goodbye(..)) => SessionPhase::Closing,
            (SessionPhase::Established, Message::Abort(..)) => SessionPhase::Closed,
            (SessionPhase::Closing, Message::Goodbye(..)) => SessionPhase::Closed,
            (SessionPhase::Closing, Message::Abort(..)) => SessionPhase::Closed,
            (current, _) => current,
        };
        if next != *self {
            trace!("Session phase {:?} -> {:?}", self, next);
            *self = next;
        }
    }
}

/// Immutable facts about a session, fixed by the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDetails {
    pub session_id: ID,
    pub realm: String,
    pub authid: String,
    pub authrole: String,
}

impl SessionDetails {
    pub fn new(session_id: ID, realm: &str, authid: &str, authrole: &str) -> SessionDetails {
        SessionDetails {
            session_id,
            realm: realm.to_string(),
            authid: authid.to_string(),
            authrole: authrole.to_string(),
        }
    }
}

/// A live transport plus the serializer and identity it was handshaken with.
pub struct BaseSession {
    transport: Box<dyn Transport>,
    serializer: Box<dyn Serializer + Send + Sync>,
    details: SessionDetails,
    phase: Mutex<SessionPhase>,
}

impl BaseSession {
    pub fn new(
        transport: Box<dyn Transport>,
        serializer: Box<dyn Serializer + Send + Sync>,
        details: SessionDetails,
    ) -> BaseSession {
        BaseSession {
            transport,
            serializer,
            details,
            phase: Mutex::new(SessionPhase::Established),
        }
    }

    pub fn id(&self) -> ID {
        self.details.session_id
    }

    pub fn realm(&self) -> &str {
        &self.details.realm
    }

    pub fn details(&self) -> &SessionDetails {
        &self.details
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock().unwrap()
    }

    pub fn send_message(&self, message: &Message) -> WampResult<()> {
        let data = self.serializer.serialize(message)?;
        self.transport.write(&data)?;
        self.phase.lock().unwrap().advance(message);
        Ok(())
    }

    pub fn receive_message(&self) -> WampResult<Message> {
        let data = self.transport.read()?;
        let message = self.serializer.deserialize(&data)?;
        let mut phase = self.phase.lock().unwrap();
        if !phase.allows(&message) {
            return Err(Error::new(ErrorKind::ProtocolViolation(format!(
                "{:?} is illegal in session phase {:?}",
                message, *phase
            ))));
        }
        phase.advance(&message);
        Ok(message)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn ping(&self, timeout: Duration) -> WampResult<f64> {
        self.transport.ping(timeout)
    }

    pub fn close(&self) {
        let mut phase = self.phase.lock().unwrap();
        *phase = SessionPhase::Closed;
        drop(phase);
        self.transport.close();
    }
}

#[cfg(test)]
mod test {
    use super::SessionPhase;
    use crate::messages::{
        CallOptions, ClientRoles, ErrorDetails, HelloDetails, Message, Reason, RouterRoles,
        WelcomeDetails, URI,
    };

    fn hello() -> Message {
        Message::Hello(
            URI::new("test.realm"),
            HelloDetails::new(ClientRoles::new_basic()),
        )
    }

    fn welcome() -> Message {
        Message::Welcome(1, WelcomeDetails::new(RouterRoles::new_basic()))
    }

    fn goodbye() -> Message {
        Message::Goodbye(ErrorDetails::new(), Reason::CloseRealm)
    }

    fn call() -> Message {
        Message::Call(1, CallOptions::new(), URI::new("a.b"), None, None)
    }

    #[test]
    fn happy_path_transitions() {
        let mut phase = SessionPhase::Connecting;
        assert!(phase.allows(&hello()));
        phase.advance(&hello());
        assert_eq!(phase, SessionPhase::Handshaking);

        assert!(phase.allows(&welcome()));
        phase.advance(&welcome());
        assert_eq!(phase, SessionPhase::Established);

        assert!(phase.allows(&call()));
        phase.advance(&goodbye());
        assert_eq!(phase, SessionPhase::Closing);

        assert!(phase.allows(&goodbye()));
        phase.advance(&goodbye());
        assert_eq!(phase, SessionPhase::Closed);
    }

    #[test]
    fn call_before_welcome_is_illegal() {
        let phase = SessionPhase::Handshaking;
        assert!(!phase.allows(&call()));
    }

    #[test]
    fn hello_twice_is_illegal() {
        let mut phase = SessionPhase::Connecting;
        phase.advance(&hello());
        assert!(!phase.allows(&hello()));

        phase.advance(&welcome());
        assert!(!phase.allows(&hello()));
    }

    #[test]
    fn abort_ends_the_handshake() {
        let mut phase = SessionPhase::Handshaking;
        let abort = Message::Abort(ErrorDetails::new(), Reason::NoSuchRealm);
        assert!(phase.allows(&abort));
        phase.advance(&abort);
        assert_eq!(phase, SessionPhase::Closed);
        assert!(!phase.allows(&call()));
    }
}
