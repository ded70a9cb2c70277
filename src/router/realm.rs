//! A realm is one routing namespace: a dealer, a broker and the sessions
//! attached to them.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use log::{debug, info, trace, warn};

use crate::messages::{Dict, ErrorDetails, ErrorType, Message, Reason};
use crate::router::broker::Broker;
use crate::router::dealer::Dealer;
use crate::session::BaseSession;
use crate::{Error, ErrorKind, WampResult, ID};

/// An attached session's ordered outbound queue.  The writer thread spawned
/// at attach time owns the transport half and closes it once the queue
/// drains.
struct SessionHandle {
    outbox: mpsc::Sender<Message>,
}

/// Container for one realm's dealer, broker and attached sessions.
///
/// Message delivery is queue based: routing computes `(recipient, message)`
/// pairs under the dealer or broker lock, then drops each message into the
/// recipient's outbox.  A slow or dead recipient therefore never blocks the
/// sender or the other recipients, and per session ordering falls out of the
/// single writer thread per session.
pub struct Realm {
    dealer: Mutex<Dealer>,
    broker: Mutex<Broker>,
    sessions: Mutex<HashMap<ID, SessionHandle>>,
}

impl Realm {
    pub fn new() -> Realm {
        Realm {
            dealer: Mutex::new(Dealer::new()),
            broker: Mutex::new(Broker::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn attach_client(&self, base: Arc<BaseSession>) {
        let details = base.details().clone();
        let (outbox, outbox_rx) = mpsc::channel::<Message>();

        {
            let base = Arc::clone(&base);
            thread::spawn(move || {
                // Drains the queue until every sender is gone, then closes.
                for message in outbox_rx.iter() {
                    if base.send_message(&message).is_err() {
                        debug!("Writer for session {} lost its transport", base.id());
                        break;
                    }
                }
                base.close();
            });
        }

        self.dealer.lock().unwrap().add_session(details.clone());
        self.broker.lock().unwrap().add_session(details.clone());
        self.sessions
            .lock()
            .unwrap()
            .insert(details.session_id, SessionHandle { outbox });
        info!(
            "Attached session {} (authid: {}, authrole: {})",
            details.session_id, details.authid, details.authrole
        );
    }

    /// Removes the session from both engines and hands canceled errors to
    /// the callers it was serving.
    pub fn detach_client(&self, session_id: ID) {
        let cancellations = self.dealer.lock().unwrap().remove_session(session_id);
        self.broker.lock().unwrap().remove_session(session_id);
        let handle = self.sessions.lock().unwrap().remove(&session_id);
        self.deliver(cancellations);
        if let Some(handle) = handle {
            // Dropping the outbox lets the writer drain and close.
            drop(handle.outbox);
            info!("Detached session {}", session_id);
        }
    }

    pub fn is_attached(&self, session_id: ID) -> bool {
        self.sessions.lock().unwrap().contains_key(&session_id)
    }

    pub fn session_ids(&self) -> Vec<ID> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    /// Routes one inbound message to the dealer or the broker and delivers
    /// whatever they produce.
    ///
    /// Routing failures become ERROR replies to the sender; a protocol
    /// violation is returned to the caller, which tears the session down.
    pub fn receive_message(&self, sender: ID, message: Message) -> WampResult<()> {
        trace!("Realm routing {:?} from {}", message, sender);
        let result = match message {
            Message::Register(request_id, options, procedure) => self
                .dealer
                .lock()
                .unwrap()
                .handle_register(sender, request_id, options, procedure),
            Message::Unregister(request_id, registration_id) => self
                .dealer
                .lock()
                .unwrap()
                .handle_unregister(sender, request_id, registration_id),
            Message::Call(request_id, options, procedure, args, kwargs) => self
                .dealer
                .lock()
                .unwrap()
                .handle_call(sender, request_id, options, procedure, args, kwargs),
            Message::Yield(invocation_id, options, args, kwargs) => self
                .dealer
                .lock()
                .unwrap()
                .handle_yield(sender, invocation_id, options, args, kwargs),
            Message::Cancel(request_id, options) => self
                .dealer
                .lock()
                .unwrap()
                .handle_cancel(sender, request_id, options),
            Message::Error(ErrorType::Invocation, request_id, details, reason, args, kwargs) => {
                self.dealer.lock().unwrap().handle_invocation_error(
                    sender, request_id, details, reason, args, kwargs,
                )
            }
            Message::Subscribe(request_id, options, topic) => self
                .broker
                .lock()
                .unwrap()
                .handle_subscribe(sender, request_id, options, topic),
            Message::Unsubscribe(request_id, subscription_id) => self
                .broker
                .lock()
                .unwrap()
                .handle_unsubscribe(sender, request_id, subscription_id),
            Message::Publish(request_id, options, topic, args, kwargs) => self
                .broker
                .lock()
                .unwrap()
                .handle_publish(sender, request_id, options, topic, args, kwargs),
            Message::Goodbye(_, reason) => {
                info!("Session {} said goodbye: {}", sender, reason);
                self.deliver(vec![(
                    sender,
                    Message::Goodbye(ErrorDetails::new(), Reason::GoodbyeAndOut),
                )]);
                self.detach_client(sender);
                return Ok(());
            }
            other => {
                return Err(Error::new(ErrorKind::ProtocolViolation(format!(
                    "{:?} cannot be routed inside a realm",
                    other
                ))))
            }
        };

        match result {
            Ok(deliveries) => {
                self.deliver(deliveries);
                Ok(())
            }
            Err(Error {
                kind: ErrorKind::ErrorReason(error_type, request_id, reason),
            }) => {
                self.deliver(vec![(
                    sender,
                    Message::Error(error_type, request_id, Dict::new(), reason, None, None),
                )]);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn deliver(&self, deliveries: Vec<(ID, Message)>) {
        if deliveries.is_empty() {
            return;
        }
        let sessions = self.sessions.lock().unwrap();
        for (recipient, message) in deliveries {
            match sessions.get(&recipient) {
                Some(handle) => {
                    if handle.outbox.send(message).is_err() {
                        warn!("Session {} writer is gone; dropping message", recipient);
                    }
                }
                None => warn!(
                    "Dropping message for session {} which is not attached",
                    recipient
                ),
            }
        }
    }

    /// Announces shutdown to every attached session.
    pub fn broadcast_goodbye(&self) {
        let sessions = self.sessions.lock().unwrap();
        for (session_id, handle) in sessions.iter() {
            trace!("Sending shutdown goodbye to session {}", session_id);
            let _ = handle.outbox.send(Message::Goodbye(
                ErrorDetails::new(),
                Reason::SystemShutdown,
            ));
        }
    }

    /// Forcibly detaches every session.
    pub fn stop(&self) {
        for session_id in self.session_ids() {
            self.detach_client(session_id);
        }
    }
}

impl Default for Realm {
    fn default() -> Realm {
        Realm::new()
    }
}
