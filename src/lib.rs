//! A WAMPv2 router and client session runtime.
//!
//! The crate is split along the protocol's natural seams: typed messages
//! with their tagged-array wire form, pluggable serializers, framed
//! transports (raw socket and WebSocket), the handshake engines that
//! negotiate a session, the client side session multiplexer and the router
//! with its dealer and broker.

pub mod auth;
pub mod client;
mod error;
pub mod handshake;
mod idgen;
pub mod messages;
pub mod router;
pub mod serializer;
pub mod session;
pub mod transport;

pub use client::{
    CallToken, Callback, Client, Connection, Event, EventCallback, Invocation, ProgressCallback,
    Registration, Subscription,
};
pub use error::{Error, ErrorKind};
pub use idgen::SessionScopeIdGenerator;
pub use messages::{
    ArgDict, ArgList, CallError, CallOptions, CancelMode, Dict, InvocationPolicy, List,
    MatchingPolicy, PublishOptions, Reason, RegisterOptions, SubscribeOptions, Value, URI,
};
use messages::{ErrorType, Message};
pub use router::Router;
pub use serializer::SerializerType;
pub use session::SessionDetails;

pub type CallResult<T> = Result<T, CallError>;
pub type WampResult<T> = Result<T, Error>;
pub type ID = u64;
