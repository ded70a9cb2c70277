//! Authentication interfaces for the handshake.
//!
//! Only the interfaces and the challenge plumbing live in the core; concrete
//! mechanisms (ticket, challenge response, public key) are supplied by the
//! embedding application.

use crate::messages::Dict;
use crate::{CallResult, CallError, Reason};

/// What the acceptor knows about a client when HELLO arrives.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub realm: String,
    pub authid: Option<String>,
    pub authmethods: Vec<String>,
    pub authextra: Option<Dict>,
}

/// A router side decision made when HELLO arrives.
pub enum AuthDecision {
    /// Let the client in without a challenge.
    Accept(Approval),
    /// Send CHALLENGE for the given method and verify the response.
    Challenge { authmethod: String, extra: Dict },
    /// Refuse the client; the reason becomes the ABORT uri.
    Reject(Reason),
}

/// The identity granted to an authenticated session.
#[derive(Debug, Clone)]
pub struct Approval {
    pub authid: String,
    pub authrole: String,
}

/// Router side authenticator.
///
/// `on_hello` runs for every HELLO.  When it asks for a challenge,
/// `verify` runs with the AUTHENTICATE signature and either grants an
/// identity or rejects the session.
pub trait ServerAuthenticator: Send + Sync {
    fn on_hello(&self, request: &AuthRequest) -> AuthDecision;

    fn verify(&self, request: &AuthRequest, signature: &str, extra: &Dict) -> CallResult<Approval>;
}

/// Client side authenticator: supplies the HELLO credentials and answers a
/// CHALLENGE.
pub trait ClientAuthenticator: Send + Sync {
    fn authid(&self) -> Option<String> {
        None
    }

    fn authmethods(&self) -> Vec<String> {
        Vec::new()
    }

    fn authextra(&self) -> Option<Dict> {
        None
    }

    /// Produces the AUTHENTICATE signature (and extra dict) for a challenge.
    fn challenge(&self, authmethod: &str, extra: &Dict) -> CallResult<(String, Dict)>;
}

/// Lets every client in as `anonymous`.
pub struct AnonymousAuthenticator;

impl ServerAuthenticator for AnonymousAuthenticator {
    fn on_hello(&self, request: &AuthRequest) -> AuthDecision {
        AuthDecision::Accept(Approval {
            authid: request
                .authid
                .clone()
                .unwrap_or_else(|| "anonymous".to_string()),
            authrole: "anonymous".to_string(),
        })
    }

    fn verify(
        &self,
        _request: &AuthRequest,
        _signature: &str,
        _extra: &Dict,
    ) -> CallResult<Approval> {
        Err(CallError::new(Reason::AuthorizationFailed, None, None))
    }
}
