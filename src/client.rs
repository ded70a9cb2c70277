//! Client side of a WAMP session.
//!
//! A [`Connection`] knows where a router lives and which realm to join; a
//! successful [`Connection::connect`] performs the transport and session
//! handshakes and hands back a [`Client`].  The client multiplexes any
//! number of outstanding requests over the single connection: every request
//! gets a session scoped request id and a oneshot waiter, and the one reader
//! thread resolves waiters and dispatches invocations and events as replies
//! arrive.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use futures::{channel::oneshot, Future};
use intmap::IntMap;
use log::{debug, error, info, trace, warn};

use crate::auth::ClientAuthenticator;
use crate::handshake::{connect_transport, join_session};
use crate::idgen::SessionScopeIdGenerator;
use crate::messages::{
    CallError, CallOptions, CancelMode, CancelOptions, Dict, ErrorDetails, ErrorType, EventDetails,
    InvocationDetails, List, Message, PublishOptions, Reason, RegisterOptions, SubscribeOptions,
    YieldOptions,
};
use crate::serializer::SerializerType;
use crate::session::BaseSession;
use crate::{CallResult, ErrorKind, MatchingPolicy, WampResult, ID, URI};

const GOODBYE_TIMEOUT: Duration = Duration::from_secs(10);

/// Represents a WAMP connection to a router.
pub struct Connection {
    realm: URI,
    url: String,
    serializers: Vec<SerializerType>,
    authenticator: Option<Arc<dyn ClientAuthenticator>>,
}

/// Represents a subscription the router acknowledged.
pub struct Subscription {
    /// Topic URI
    pub topic: URI,
    subscription_id: ID,
}

/// Represents a procedure registration the router acknowledged.
pub struct Registration {
    /// Procedure URI
    pub procedure: URI,
    registration_id: ID,
}

/// A handle onto an in-flight call, usable to cancel it.
pub struct CallToken {
    request_id: ID,
}

/// What a callee handler receives for every invocation.
pub struct Invocation {
    pub args: List,
    pub kwargs: Dict,
    pub details: InvocationDetails,
}

/// What a subscriber callback receives for every event.
pub struct Event {
    pub args: List,
    pub kwargs: Dict,
    pub details: EventDetails,
}

struct SubscriptionCallbackWrapper {
    callback: EventCallback,
}

struct RegistrationCallbackWrapper {
    callback: Callback,
}

type Complete<T> = oneshot::Sender<Result<T, CallError>>;

/// Alias for an invocation handler.
///
/// Returning `Ok((None, None))` yields an empty result; failing with a
/// [`CallError`] puts that error uri (plus args and kwargs) on the wire.
pub type Callback =
    Box<dyn FnMut(Invocation) -> CallResult<(Option<List>, Option<Dict>)> + Send>;

/// Alias for an event handler.
pub type EventCallback = Box<dyn FnMut(Event) + Send>;

/// Alias for a progressive result handler.
pub type ProgressCallback = Box<dyn FnMut(List, Dict) + Send>;

#[derive(PartialEq, Debug)]
enum ConnectionState {
    Connected,
    ShuttingDown,
    Disconnected,
}

struct CallRequest {
    complete: Complete<(List, Dict)>,
    progress: Option<ProgressCallback>,
}

struct ConnectionInfo {
    connection_state: ConnectionState,
    subscription_requests: IntMap<(Complete<Subscription>, SubscriptionCallbackWrapper, URI)>,
    unsubscription_requests: IntMap<(Complete<()>, ID)>,
    subscriptions: IntMap<SubscriptionCallbackWrapper>,
    registrations: IntMap<RegistrationCallbackWrapper>,
    call_requests: IntMap<CallRequest>,
    registration_requests: IntMap<(Complete<Registration>, RegistrationCallbackWrapper, URI)>,
    unregistration_requests: IntMap<(Complete<()>, ID)>,
    publish_requests: IntMap<Complete<ID>>,
    shutdown_complete: Option<mpsc::Sender<()>>,
    disconnect_callbacks: Vec<Box<dyn FnOnce() + Send>>,
    session_id: ID,
}

/// Represents a WAMP client.
pub struct Client {
    connection_info: Arc<Mutex<ConnectionInfo>>,
    base: Arc<BaseSession>,
    id_gen: SessionScopeIdGenerator,
}

impl Connection {
    /// Create a new connection with a uri and a realm.
    pub fn new(url: &str, realm: &str) -> Connection {
        Connection {
            realm: URI::new(realm),
            url: url.to_string(),
            serializers: vec![
                SerializerType::Json,
                SerializerType::Cbor,
                SerializerType::MsgPack,
            ],
            authenticator: None,
        }
    }

    /// Restricts or reorders the serializers offered during the handshake.
    pub fn with_serializers(mut self, serializers: Vec<SerializerType>) -> Connection {
        self.serializers = serializers;
        self
    }

    /// Supplies the credentials offered during the handshake.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn ClientAuthenticator>) -> Connection {
        self.authenticator = Some(authenticator);
        self
    }

    /// Connect to the router: transport handshake, session handshake, and
    /// the reader thread that keeps the session alive.
    pub fn connect(&self) -> WampResult<Client> {
        let (transport, serializer) = connect_transport(&self.url, &self.serializers)?;
        debug!("Connected to {} with serializer {:?}", self.url, serializer);
        let base = Arc::new(join_session(
            transport,
            serializer,
            &self.realm.uri,
            self.authenticator.clone(),
        )?);

        let info = Arc::new(Mutex::new(ConnectionInfo {
            connection_state: ConnectionState::Connected,
            subscription_requests: IntMap::new(),
            unsubscription_requests: IntMap::new(),
            subscriptions: IntMap::new(),
            registrations: IntMap::new(),
            call_requests: IntMap::new(),
            registration_requests: IntMap::new(),
            unregistration_requests: IntMap::new(),
            publish_requests: IntMap::new(),
            shutdown_complete: None,
            disconnect_callbacks: Vec::new(),
            session_id: base.id(),
        }));

        let handler = MessageHandler {
            connection_info: Arc::clone(&info),
            base: Arc::clone(&base),
        };
        thread::spawn(move || handler.run());

        info!("Joined realm {} with session id {}", self.realm.uri, base.id());
        Ok(Client {
            connection_info: info,
            base,
            id_gen: SessionScopeIdGenerator::new(),
        })
    }
}

macro_rules! cancel_future_tuple {
    ($dict:expr) => {{
        for (_, future) in $dict.drain() {
            let _ = future
                .0
                .send(Err(CallError::new(Reason::NetworkFailure, None, None)));
        }
    }};
}

macro_rules! cancel_future {
    ($dict:expr) => {{
        for (_, future) in $dict.drain() {
            let _ = future.send(Err(CallError::new(Reason::NetworkFailure, None, None)));
        }
    }};
}

/// The reader side of a client session.
struct MessageHandler {
    connection_info: Arc<Mutex<ConnectionInfo>>,
    base: Arc<BaseSession>,
}

impl MessageHandler {
    fn run(self) {
        while self.base.is_connected() {
            let message = match self.base.receive_message() {
                Ok(message) => message,
                Err(e) => {
                    match e.kind {
                        ErrorKind::ConnectionLost => debug!("Client transport went away"),
                        kind => warn!("Client protocol failure: {}", kind.description()),
                    }
                    break;
                }
            };
            if !self.handle_message(message) {
                break;
            }
        }
        self.finish();
    }

    /// Processes one message; false means the session is over.
    fn handle_message(&self, message: Message) -> bool {
        let mut info = self.connection_info.lock().unwrap();
        trace!(
            "Processing message from router (state: {:?})",
            info.connection_state
        );
        match info.connection_state {
            ConnectionState::Connected => match message {
                Message::Subscribed(request_id, subscription_id) => {
                    self.handle_subscribed(info, request_id, subscription_id)
                }
                Message::Unsubscribed(request_id) => self.handle_unsubscribed(info, request_id),
                Message::Event(subscription_id, _, details, args, kwargs) => {
                    self.handle_event(info, subscription_id, details, args, kwargs)
                }
                Message::Published(request_id, publication_id) => {
                    self.handle_published(info, request_id, publication_id)
                }
                Message::Registered(request_id, registration_id) => {
                    self.handle_registered(info, request_id, registration_id)
                }
                Message::Unregistered(request_id) => self.handle_unregistered(info, request_id),
                Message::Invocation(request_id, registration_id, details, args, kwargs) => {
                    self.handle_invocation(info, request_id, registration_id, details, args, kwargs)
                }
                Message::Interrupt(request_id, options) => {
                    // Handlers run to completion; there is nothing to tear
                    // down for an interrupt besides noting it.
                    info!(
                        "Router interrupted invocation {} (mode: {})",
                        request_id, options.mode
                    );
                    true
                }
                Message::Result(call_id, details, args, kwargs) => {
                    self.handle_result(info, call_id, details.progress, args, kwargs)
                }
                Message::Error(e_type, request_id, details, reason, args, kwargs) => {
                    self.handle_error(info, e_type, request_id, details, reason, args, kwargs)
                }
                Message::Goodbye(_, reason) => {
                    self.handle_goodbye(info, reason);
                    false
                }
                message => {
                    warn!("Received unknown message.  Ignoring. {:?}", message);
                    true
                }
            },
            ConnectionState::ShuttingDown => {
                if let Message::Goodbye(_, _) = message {
                    // The router has seen our goodbye message and has responded in kind
                    info!("Router acknowledged disconnect");
                    if let Some(promise) = info.shutdown_complete.take() {
                        let _ = promise.send(());
                    }
                    false
                } else {
                    warn!(
                        "Received message after shutting down, ignoring: {:?}",
                        message
                    );
                    true
                }
            }
            ConnectionState::Disconnected => false,
        }
    }

    fn handle_subscribed(
        &self,
        mut info: MutexGuard<'_, ConnectionInfo>,
        request_id: ID,
        subscription_id: ID,
    ) -> bool {
        match info.subscription_requests.remove(request_id) {
            Some((promise, callback, topic)) => {
                debug!("Completing subscription {}", subscription_id);
                let subscription = Subscription {
                    topic,
                    subscription_id,
                };
                info.subscriptions.insert(subscription_id, callback);
                drop(info);
                let _ = promise.send(Ok(subscription));
            }
            None => {
                warn!(
                    "Received a subscribed notification for a request we never made.  ID: {}",
                    request_id
                );
            }
        }
        true
    }

    fn handle_unsubscribed(&self, mut info: MutexGuard<'_, ConnectionInfo>, request_id: ID) -> bool {
        match info.unsubscription_requests.remove(request_id) {
            Some((promise, subscription_id)) => {
                info.subscriptions.remove(subscription_id);
                drop(info);
                let _ = promise.send(Ok(()));
            }
            None => {
                warn!(
                    "Received an unsubscribed notification for a request we never made.  ID: {}",
                    request_id
                );
            }
        }
        true
    }

    fn handle_published(
        &self,
        mut info: MutexGuard<'_, ConnectionInfo>,
        request_id: ID,
        publication_id: ID,
    ) -> bool {
        match info.publish_requests.remove(request_id) {
            Some(promise) => {
                let _ = promise.send(Ok(publication_id));
            }
            None => warn!(
                "Received published notification for a request we weren't tracking: {}",
                request_id
            ),
        }
        true
    }

    fn handle_registered(
        &self,
        mut info: MutexGuard<'_, ConnectionInfo>,
        request_id: ID,
        registration_id: ID,
    ) -> bool {
        match info.registration_requests.remove(request_id) {
            Some((promise, callback, procedure)) => {
                debug!("Completing registration {}", registration_id);
                info.registrations.insert(registration_id, callback);
                drop(info);
                let registration = Registration {
                    procedure,
                    registration_id,
                };
                let _ = promise.send(Ok(registration));
            }
            None => {
                warn!(
                    "Received a registered notification for a request we never made.  ID: {}",
                    request_id
                );
            }
        }
        true
    }

    fn handle_unregistered(&self, mut info: MutexGuard<'_, ConnectionInfo>, request_id: ID) -> bool {
        match info.unregistration_requests.remove(request_id) {
            Some((promise, registration_id)) => {
                info.registrations.remove(registration_id);
                drop(info);
                let _ = promise.send(Ok(()));
            }
            None => {
                warn!(
                    "Received an unregistered notification for a request we never made.  ID: {}",
                    request_id
                );
            }
        }
        true
    }

    fn handle_event(
        &self,
        mut info: MutexGuard<'_, ConnectionInfo>,
        subscription_id: ID,
        details: EventDetails,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> bool {
        let args = args.unwrap_or_default();
        let kwargs = kwargs.unwrap_or_default();
        match info.subscriptions.get_mut(subscription_id) {
            Some(subscription) => {
                let callback = &mut subscription.callback;
                // A misbehaving event handler must never take the session
                // down with it.
                if catch_unwind(AssertUnwindSafe(|| {
                    callback(Event {
                        args,
                        kwargs,
                        details,
                    })
                }))
                .is_err()
                {
                    error!("Event handler for subscription {} panicked", subscription_id);
                }
            }
            None => {
                warn!(
                    "Received an event for a subscription we don't have.  ID: {}",
                    subscription_id
                );
            }
        }
        true
    }

    fn handle_invocation(
        &self,
        mut info: MutexGuard<'_, ConnectionInfo>,
        request_id: ID,
        registration_id: ID,
        details: InvocationDetails,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> bool {
        let args = args.unwrap_or_default();
        let kwargs = kwargs.unwrap_or_default();
        let message = match info.registrations.get_mut(registration_id) {
            Some(registration) => {
                let callback = &mut registration.callback;
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    callback(Invocation {
                        args,
                        kwargs,
                        details,
                    })
                }));
                match outcome {
                    Ok(Ok((result_args, result_kwargs))) => Message::Yield(
                        request_id,
                        YieldOptions::new(),
                        result_args,
                        result_kwargs,
                    ),
                    Ok(Err(error)) => {
                        let (reason, args, kwargs) = error.into_tuple();
                        Message::Error(
                            ErrorType::Invocation,
                            request_id,
                            HashMap::new(),
                            reason,
                            args,
                            kwargs,
                        )
                    }
                    Err(panic) => {
                        let text = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "invocation handler panicked".to_string());
                        error!("Invocation handler for {} panicked: {}", registration_id, text);
                        Message::Error(
                            ErrorType::Invocation,
                            request_id,
                            HashMap::new(),
                            Reason::RuntimeError,
                            Some(vec![crate::Value::String(text)]),
                            None,
                        )
                    }
                }
            }
            None => {
                warn!(
                    "Received an invocation for a procedure we don't have.  ID: {}",
                    registration_id
                );
                return true;
            }
        };
        drop(info);
        if let Err(e) = self.base.send_message(&message) {
            warn!("Failed to send invocation reply: {}", e);
            return false;
        }
        true
    }

    fn handle_result(
        &self,
        mut info: MutexGuard<'_, ConnectionInfo>,
        call_id: ID,
        progress: bool,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> bool {
        let args = args.unwrap_or_default();
        let kwargs = kwargs.unwrap_or_default();
        if progress {
            match info.call_requests.get_mut(call_id) {
                Some(request) => {
                    if let Some(ref mut on_progress) = request.progress {
                        if catch_unwind(AssertUnwindSafe(|| on_progress(args, kwargs))).is_err() {
                            error!("Progress handler for call {} panicked", call_id);
                        }
                    } else {
                        trace!("Dropping progress chunk for call {}", call_id);
                    }
                }
                None => warn!(
                    "Received a progressive result for a call we didn't make.  ID: {}",
                    call_id
                ),
            }
            return true;
        }
        match info.call_requests.remove(call_id) {
            Some(request) => {
                drop(info);
                let _ = request.complete.send(Ok((args, kwargs)));
            }
            None => {
                warn!(
                    "Received a result for a call we didn't make.  ID: {}",
                    call_id
                );
            }
        }
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_error(
        &self,
        info: MutexGuard<'_, ConnectionInfo>,
        e_type: ErrorType,
        request_id: ID,
        _details: Dict,
        reason: Reason,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> bool {
        match e_type {
            ErrorType::Subscribe => {
                self.handle_subscribe_error(info, request_id, reason, args, kwargs)
            }
            ErrorType::Unsubscribe => {
                self.handle_unsubscribe_error(info, request_id, reason, args, kwargs)
            }
            ErrorType::Publish => self.handle_publish_error(info, request_id, reason, args, kwargs),
            ErrorType::Register => {
                self.handle_register_error(info, request_id, reason, args, kwargs)
            }
            ErrorType::Unregister => {
                self.handle_unregister_error(info, request_id, reason, args, kwargs)
            }
            ErrorType::Invocation => {
                warn!("Received an error for an invocation message, which we did not (and could not) send")
            }
            ErrorType::Call => self.handle_call_error(info, request_id, reason, args, kwargs),
        }
        true
    }

    fn handle_subscribe_error(
        &self,
        mut info: MutexGuard<'_, ConnectionInfo>,
        request_id: ID,
        reason: Reason,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) {
        warn!("Received an error for a subscription");
        match info.subscription_requests.remove(request_id) {
            Some((promise, _, _)) => {
                drop(info);
                let _ = promise.send(Err(CallError::new(reason, args, kwargs)));
            }
            None => {
                warn!(
                    "Received an error notification for a request we didn't make.  ID: {}",
                    request_id
                );
            }
        }
    }

    fn handle_unsubscribe_error(
        &self,
        mut info: MutexGuard<'_, ConnectionInfo>,
        request_id: ID,
        reason: Reason,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) {
        match info.unsubscription_requests.remove(request_id) {
            Some((promise, _)) => {
                drop(info);
                let _ = promise.send(Err(CallError::new(reason, args, kwargs)));
            }
            None => {
                warn!(
                    "Received an unsubscribe error for a request we didn't make.  ID: {}",
                    request_id
                );
            }
        }
    }

    fn handle_publish_error(
        &self,
        mut info: MutexGuard<'_, ConnectionInfo>,
        request_id: ID,
        reason: Reason,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) {
        match info.publish_requests.remove(request_id) {
            Some(promise) => {
                drop(info);
                let _ = promise.send(Err(CallError::new(reason, args, kwargs)));
            }
            None => warn!("Received a publish error for a publication: {}", request_id),
        }
    }

    fn handle_register_error(
        &self,
        mut info: MutexGuard<'_, ConnectionInfo>,
        request_id: ID,
        reason: Reason,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) {
        info!("Received a registration error");
        match info.registration_requests.remove(request_id) {
            Some((promise, _, _)) => {
                drop(info);
                let _ = promise.send(Err(CallError::new(reason, args, kwargs)));
            }
            None => {
                warn!(
                    "Received a register error for a request we didn't make.  ID: {}",
                    request_id
                );
            }
        }
    }

    fn handle_unregister_error(
        &self,
        mut info: MutexGuard<'_, ConnectionInfo>,
        request_id: ID,
        reason: Reason,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) {
        match info.unregistration_requests.remove(request_id) {
            Some((promise, _)) => {
                drop(info);
                let _ = promise.send(Err(CallError::new(reason, args, kwargs)));
            }
            None => {
                warn!(
                    "Received an unregister error for a request we didn't make.  ID: {}",
                    request_id
                );
            }
        }
    }

    fn handle_call_error(
        &self,
        mut info: MutexGuard<'_, ConnectionInfo>,
        request_id: ID,
        reason: Reason,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) {
        match info.call_requests.remove(request_id) {
            Some(request) => {
                drop(info);
                let _ = request.complete.send(Err(CallError::new(reason, args, kwargs)));
            }
            None => {
                warn!(
                    "Received an error for a call we didn't make.  ID: {}",
                    request_id
                );
            }
        }
    }

    fn handle_goodbye(&self, info: MutexGuard<'_, ConnectionInfo>, reason: Reason) {
        info!("Router said goodbye.  Reason: {}", reason);
        drop(info);
        let _ = self
            .base
            .send_message(&Message::Goodbye(ErrorDetails::new(), Reason::GoodbyeAndOut));
        let mut info = self.connection_info.lock().unwrap();
        info.connection_state = ConnectionState::ShuttingDown;
    }

    /// Ends the session: fails every waiter and fires the disconnect
    /// callbacks exactly once each.
    fn finish(&self) {
        let mut info = self.connection_info.lock().unwrap();
        info.connection_state = ConnectionState::Disconnected;
        cancel_future_tuple!(info.subscription_requests);
        cancel_future_tuple!(info.unsubscription_requests);
        cancel_future_tuple!(info.registration_requests);
        cancel_future_tuple!(info.unregistration_requests);
        cancel_future!(info.publish_requests);
        for (_, request) in info.call_requests.drain() {
            let _ = request
                .complete
                .send(Err(CallError::new(Reason::NetworkFailure, None, None)));
        }
        if let Some(promise) = info.shutdown_complete.take() {
            let _ = promise.send(());
        }
        let callbacks: Vec<Box<dyn FnOnce() + Send>> =
            info.disconnect_callbacks.drain(..).collect();
        drop(info);

        for callback in callbacks {
            thread::spawn(callback);
        }
        self.base.close();
    }
}

impl Client {
    fn get_next_request_id(&mut self) -> ID {
        self.id_gen.next_id()
    }

    /// The router assigned session id.
    pub fn session_id(&self) -> ID {
        self.connection_info.lock().unwrap().session_id
    }

    pub fn is_connected(&self) -> bool {
        self.base.is_connected()
    }

    /// Registers a callback to run once when the session ends.
    pub fn on_disconnect<F: FnOnce() + Send + 'static>(&self, callback: F) {
        let mut info = self.connection_info.lock().unwrap();
        if info.connection_state == ConnectionState::Disconnected {
            drop(info);
            thread::spawn(callback);
        } else {
            info.disconnect_callbacks.push(Box::new(callback));
        }
    }

    /// Measures the transport round trip to the router in milliseconds.
    pub fn ping(&self, timeout: Duration) -> WampResult<f64> {
        self.base.ping(timeout)
    }

    /// Subscribe to a topic with a matching policy.
    pub fn subscribe_with_pattern(
        &mut self,
        topic_pattern: URI,
        callback: EventCallback,
        policy: MatchingPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, CallError>> + Send>> {
        let request_id = self.get_next_request_id();

        let (complete, receiver) = oneshot::channel();
        let callback = SubscriptionCallbackWrapper { callback };
        let options = SubscribeOptions::new_with_pattern(policy);

        let mut info = self.connection_info.lock().unwrap();
        info.subscription_requests
            .insert(request_id, (complete, callback, topic_pattern.clone()));
        let send_result = self
            .base
            .send_message(&Message::Subscribe(request_id, options, topic_pattern));
        if send_result.is_err() {
            info.subscription_requests.remove(request_id);
        }
        drop(info);

        Box::pin(async {
            receiver
                .await
                .unwrap_or(Err(CallError::new(Reason::NetworkFailure, None, None)))
        })
    }

    /// Subscribe to a topic.
    pub fn subscribe(
        &mut self,
        topic: URI,
        callback: EventCallback,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, CallError>> + Send>> {
        self.subscribe_with_pattern(topic, callback, MatchingPolicy::Strict)
    }

    /// Unsubscribe from a topic.
    pub fn unsubscribe(
        &mut self,
        subscription: Subscription,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send>> {
        let request_id = self.get_next_request_id();

        let (complete, receiver) = oneshot::channel();
        let mut info = self.connection_info.lock().unwrap();
        info.unsubscription_requests
            .insert(request_id, (complete, subscription.subscription_id));
        let send_result = self.base.send_message(&Message::Unsubscribe(
            request_id,
            subscription.subscription_id,
        ));
        if send_result.is_err() {
            info.unsubscription_requests.remove(request_id);
        }
        drop(info);

        Box::pin(async {
            receiver
                .await
                .unwrap_or(Err(CallError::new(Reason::NetworkFailure, None, None)))
        })
    }

    /// Register a procedure with a matching policy and an invocation policy.
    pub fn register_with_options(
        &mut self,
        procedure_pattern: URI,
        callback: Callback,
        options: RegisterOptions,
    ) -> Pin<Box<dyn Future<Output = Result<Registration, CallError>> + Send>> {
        let request_id = self.get_next_request_id();

        let (complete, receiver) = oneshot::channel();
        let callback = RegistrationCallbackWrapper { callback };

        let mut info = self.connection_info.lock().unwrap();
        info.registration_requests
            .insert(request_id, (complete, callback, procedure_pattern.clone()));
        let send_result =
            self.base
                .send_message(&Message::Register(request_id, options, procedure_pattern));
        if send_result.is_err() {
            info.registration_requests.remove(request_id);
        }
        drop(info);

        Box::pin(async {
            receiver
                .await
                .unwrap_or(Err(CallError::new(Reason::NetworkFailure, None, None)))
        })
    }

    /// Register a procedure with a matching policy.
    pub fn register_with_pattern(
        &mut self,
        procedure_pattern: URI,
        callback: Callback,
        policy: MatchingPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<Registration, CallError>> + Send>> {
        let mut options = RegisterOptions::new();
        options.pattern_match = policy;
        self.register_with_options(procedure_pattern, callback, options)
    }

    /// Register a procedure.
    pub fn register(
        &mut self,
        procedure: URI,
        callback: Callback,
    ) -> Pin<Box<dyn Future<Output = Result<Registration, CallError>> + Send>> {
        self.register_with_options(procedure, callback, RegisterOptions::new())
    }

    /// Unregister a procedure.
    pub fn unregister(
        &mut self,
        registration: Registration,
    ) -> Pin<Box<dyn Future<Output = Result<(), CallError>> + Send>> {
        let request_id = self.get_next_request_id();

        let (complete, receiver) = oneshot::channel();
        let mut info = self.connection_info.lock().unwrap();
        info.unregistration_requests
            .insert(request_id, (complete, registration.registration_id));
        let send_result = self.base.send_message(&Message::Unregister(
            request_id,
            registration.registration_id,
        ));
        if send_result.is_err() {
            info.unregistration_requests.remove(request_id);
        }
        drop(info);

        Box::pin(async {
            receiver
                .await
                .unwrap_or(Err(CallError::new(Reason::NetworkFailure, None, None)))
        })
    }

    /// Publish to a topic without waiting for an acknowledgement.
    pub fn publish(
        &mut self,
        topic: URI,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> WampResult<()> {
        info!("Publishing to {:?} with {:?} | {:?}", topic, args, kwargs);
        let request_id = self.get_next_request_id();
        self.base.send_message(&Message::Publish(
            request_id,
            PublishOptions::default(),
            topic,
            args,
            kwargs,
        ))
    }

    /// Publish to a topic and wait for the publication id.
    pub fn publish_and_acknowledge(
        &mut self,
        topic: URI,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Pin<Box<dyn Future<Output = Result<ID, CallError>> + Send>> {
        self.publish_acknowledged(topic, args, kwargs, PublishOptions::new(true))
    }

    /// Publish with explicit options.  A future is returned only when the
    /// options ask for an acknowledgement.
    #[allow(clippy::type_complexity)]
    pub fn publish_with_options(
        &mut self,
        topic: URI,
        args: Option<List>,
        kwargs: Option<Dict>,
        options: PublishOptions,
    ) -> Option<Pin<Box<dyn Future<Output = Result<ID, CallError>> + Send>>> {
        if !options.should_acknowledge() {
            info!("Publishing to {:?} with {:?} | {:?}", topic, args, kwargs);
            let request_id = self.get_next_request_id();
            let _ = self
                .base
                .send_message(&Message::Publish(request_id, options, topic, args, kwargs));
            return None;
        }
        Some(self.publish_acknowledged(topic, args, kwargs, options))
    }

    fn publish_acknowledged(
        &mut self,
        topic: URI,
        args: Option<List>,
        kwargs: Option<Dict>,
        options: PublishOptions,
    ) -> Pin<Box<dyn Future<Output = Result<ID, CallError>> + Send>> {
        info!("Publishing to {:?} with {:?} | {:?}", topic, args, kwargs);
        let request_id = self.get_next_request_id();

        let (complete, receiver) = oneshot::channel();
        let mut info = self.connection_info.lock().unwrap();
        info.publish_requests.insert(request_id, complete);
        let send_result = self
            .base
            .send_message(&Message::Publish(request_id, options, topic, args, kwargs));
        if send_result.is_err() {
            info.publish_requests.remove(request_id);
        }
        drop(info);

        Box::pin(async {
            receiver
                .await
                .unwrap_or(Err(CallError::new(Reason::NetworkFailure, None, None)))
        })
    }

    /// Call a procedure.
    pub fn call(
        &mut self,
        procedure: URI,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Pin<Box<dyn Future<Output = Result<(List, Dict), CallError>> + Send>> {
        let (_, future) = self.call_with_options(procedure, args, kwargs, CallOptions::new(), None);
        future
    }

    /// Call a procedure with options and an optional progressive result
    /// handler.  The returned token can cancel the call while in flight.
    #[allow(clippy::type_complexity)]
    pub fn call_with_options(
        &mut self,
        procedure: URI,
        args: Option<List>,
        kwargs: Option<Dict>,
        options: CallOptions,
        progress: Option<ProgressCallback>,
    ) -> (
        CallToken,
        Pin<Box<dyn Future<Output = Result<(List, Dict), CallError>> + Send>>,
    ) {
        info!("Calling {:?} with {:?} | {:?}", procedure, args, kwargs);
        let request_id = self.get_next_request_id();
        let timeout = options.timeout;

        let (complete, receiver) = oneshot::channel();
        let mut info = self.connection_info.lock().unwrap();
        info.call_requests
            .insert(request_id, CallRequest { complete, progress });
        let send_result = self.base.send_message(&Message::Call(
            request_id, options, procedure, args, kwargs,
        ));
        if send_result.is_err() {
            info.call_requests.remove(request_id);
        }
        drop(info);

        if let Some(millis) = timeout {
            self.spawn_call_timeout(request_id, Duration::from_millis(millis));
        }

        (
            CallToken { request_id },
            Box::pin(async {
                receiver
                    .await
                    .unwrap_or(Err(CallError::new(Reason::NetworkFailure, None, None)))
            }),
        )
    }

    /// Cancels an in-flight call.
    pub fn cancel(&mut self, call: &CallToken, mode: CancelMode) -> WampResult<()> {
        let info = self.connection_info.lock().unwrap();
        if !info.call_requests.contains_key(call.request_id) {
            // Already answered.
            return Ok(());
        }
        drop(info);
        self.base
            .send_message(&Message::Cancel(call.request_id, CancelOptions::new(mode)))
    }

    /// Caller side call timeout: cancel the call and fail the waiter.
    fn spawn_call_timeout(&self, request_id: ID, timeout: Duration) {
        let connection_info = Arc::clone(&self.connection_info);
        let base = Arc::clone(&self.base);
        thread::spawn(move || {
            thread::sleep(timeout);
            let mut info = connection_info.lock().unwrap();
            if let Some(request) = info.call_requests.remove(request_id) {
                drop(info);
                debug!("Call {} timed out on the caller side", request_id);
                let _ = base.send_message(&Message::Cancel(
                    request_id,
                    CancelOptions::new(CancelMode::KillNoWait),
                ));
                let _ = request
                    .complete
                    .send(Err(CallError::new(Reason::Timeout, None, None)));
            }
        });
    }

    /// Leave the realm: GOODBYE, wait for the router's GOODBYE (ten second
    /// deadline), then close the transport.  A second leave is a no-op.
    pub fn leave(&mut self) -> WampResult<()> {
        let mut info = self.connection_info.lock().unwrap();
        if info.connection_state != ConnectionState::Connected {
            return Ok(());
        }
        info.connection_state = ConnectionState::ShuttingDown;
        let (complete, receiver) = mpsc::channel();
        info.shutdown_complete = Some(complete);
        drop(info);

        let send_result = self
            .base
            .send_message(&Message::Goodbye(ErrorDetails::new(), Reason::CloseRealm));
        if send_result.is_ok() {
            if receiver.recv_timeout(GOODBYE_TIMEOUT).is_err() {
                warn!("Router did not answer our goodbye; closing anyway");
            }
        }
        self.base.close();
        Ok(())
    }

    /// Leave and tear the connection down.
    pub fn shutdown(mut self) -> WampResult<()> {
        self.leave()
    }
}
