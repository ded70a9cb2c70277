//! The dealer routes calls between callers and callees.

use std::collections::HashMap;

use log::{debug, warn};

use crate::messages::{
    CallOptions, CancelMode, CancelOptions, Dict, ErrorType, InterruptOptions, InvocationDetails,
    List, Message, Reason, RegisterOptions, ResultDetails, YieldOptions,
};
use crate::router::patterns::RegistrationPatternNode;
use crate::session::SessionDetails;
use crate::{Error, ErrorKind, MatchingPolicy, WampResult, ID, URI};

/// One in-flight invocation, keyed by the dealer allocated invocation id.
struct InvocationRecord {
    caller: ID,
    call_id: ID,
    callee: ID,
    progressive: bool,
}

/// Router side RPC engine for one realm.
///
/// The dealer is free of I/O: every operation consumes the sender's session
/// id and a message, and produces the set of `(recipient, message)` pairs to
/// deliver.  Routing failures surface as
/// [`ErrorKind::ErrorReason`](crate::ErrorKind) and become ERROR replies to
/// the sender.
pub struct Dealer {
    registrations: RegistrationPatternNode<ID>,
    registration_ids: HashMap<ID, (String, MatchingPolicy)>,
    owned_registrations: HashMap<ID, Vec<ID>>,
    invocations: HashMap<ID, InvocationRecord>,
    next_invocation_id: ID,
    sessions: HashMap<ID, SessionDetails>,
}

impl Dealer {
    pub fn new() -> Dealer {
        Dealer {
            registrations: RegistrationPatternNode::new(),
            registration_ids: HashMap::new(),
            owned_registrations: HashMap::new(),
            invocations: HashMap::new(),
            next_invocation_id: 1,
            sessions: HashMap::new(),
        }
    }

    pub fn add_session(&mut self, details: SessionDetails) {
        self.sessions.insert(details.session_id, details);
    }

    /// Tears down everything the session owned.  Callers waiting on an
    /// invocation this session was serving get a canceled error.
    pub fn remove_session(&mut self, session_id: ID) -> Vec<(ID, Message)> {
        if let Some(owned) = self.owned_registrations.remove(&session_id) {
            for registration_id in owned {
                if let Some((uri, policy)) = self.registration_ids.get(&registration_id).cloned() {
                    match self.registrations.unregister_with(&uri, session_id, policy) {
                        Ok((_, 0)) => {
                            self.registration_ids.remove(&registration_id);
                        }
                        Ok(_) => {}
                        Err(_) => {}
                    }
                }
            }
        }

        let mut deliveries = Vec::new();
        let dead: Vec<ID> = self
            .invocations
            .iter()
            .filter(|(_, record)| record.callee == session_id || record.caller == session_id)
            .map(|(id, _)| *id)
            .collect();
        for invocation_id in dead {
            if let Some(record) = self.invocations.remove(&invocation_id) {
                if record.callee == session_id && record.caller != session_id {
                    deliveries.push((
                        record.caller,
                        Message::Error(
                            ErrorType::Call,
                            record.call_id,
                            Dict::new(),
                            Reason::Canceled,
                            None,
                            None,
                        ),
                    ));
                }
            }
        }

        self.sessions.remove(&session_id);
        deliveries
    }

    pub fn handle_register(
        &mut self,
        sender: ID,
        request_id: ID,
        options: RegisterOptions,
        procedure: URI,
    ) -> WampResult<Vec<(ID, Message)>> {
        debug!(
            "Responding to register message (id: {}, procedure: {})",
            request_id, procedure.uri
        );
        if !procedure.is_valid_with(options.pattern_match == MatchingPolicy::Wildcard) {
            return Err(Error::new(ErrorKind::ErrorReason(
                ErrorType::Register,
                request_id,
                Reason::InvalidURI,
            )));
        }
        let registration_id = match self.registrations.register_with(
            &procedure,
            sender,
            options.pattern_match,
            options.invocation_policy,
        ) {
            Ok(id) => id,
            Err(e) => {
                return Err(Error::new(ErrorKind::ErrorReason(
                    ErrorType::Register,
                    request_id,
                    e.reason(),
                )))
            }
        };
        self.registration_ids
            .insert(registration_id, (procedure.uri, options.pattern_match));
        let owned = self.owned_registrations.entry(sender).or_default();
        if !owned.contains(&registration_id) {
            owned.push(registration_id);
        }
        Ok(vec![(sender, Message::Registered(request_id, registration_id))])
    }

    pub fn handle_unregister(
        &mut self,
        sender: ID,
        request_id: ID,
        registration_id: ID,
    ) -> WampResult<Vec<(ID, Message)>> {
        let (uri, policy) = match self.registration_ids.get(&registration_id) {
            Some(entry) => entry.clone(),
            None => {
                return Err(Error::new(ErrorKind::ErrorReason(
                    ErrorType::Unregister,
                    request_id,
                    Reason::NoSuchRegistration,
                )))
            }
        };
        let remaining = match self.registrations.unregister_with(&uri, sender, policy) {
            Ok((_, remaining)) => remaining,
            Err(e) => {
                return Err(Error::new(ErrorKind::ErrorReason(
                    ErrorType::Unregister,
                    request_id,
                    e.reason(),
                )))
            }
        };
        if remaining == 0 {
            self.registration_ids.remove(&registration_id);
        }
        if let Some(owned) = self.owned_registrations.get_mut(&sender) {
            owned.retain(|id| *id != registration_id);
        }
        Ok(vec![(sender, Message::Unregistered(request_id))])
    }

    pub fn handle_call(
        &mut self,
        caller: ID,
        request_id: ID,
        options: CallOptions,
        procedure: URI,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> WampResult<Vec<(ID, Message)>> {
        debug!(
            "Responding to call message (id: {}, procedure: {})",
            request_id, procedure.uri
        );
        if !procedure.is_valid() {
            return Err(Error::new(ErrorKind::ErrorReason(
                ErrorType::Call,
                request_id,
                Reason::InvalidURI,
            )));
        }
        let (callee, registration_id, policy) =
            match self.registrations.get_registrant_for(&procedure) {
                Ok((callee, id, policy)) => (*callee, id, policy),
                Err(e) => {
                    return Err(Error::new(ErrorKind::ErrorReason(
                        ErrorType::Call,
                        request_id,
                        e.reason(),
                    )))
                }
            };

        let invocation_id = self.next_invocation_id;
        self.next_invocation_id += 1;
        self.invocations.insert(
            invocation_id,
            InvocationRecord {
                caller,
                call_id: request_id,
                callee,
                progressive: options.receive_progress,
            },
        );

        let mut details = InvocationDetails::new();
        details.procedure = if policy == MatchingPolicy::Strict {
            None
        } else {
            Some(procedure)
        };
        details.receive_progress = options.receive_progress;
        if options.disclose_me {
            if let Some(caller_details) = self.sessions.get(&caller) {
                details.caller = Some(caller_details.session_id);
                details.caller_authid = Some(caller_details.authid.clone());
                details.caller_authrole = Some(caller_details.authrole.clone());
            }
        }

        Ok(vec![(
            callee,
            Message::Invocation(invocation_id, registration_id, details, args, kwargs),
        )])
    }

    pub fn handle_yield(
        &mut self,
        sender: ID,
        invocation_id: ID,
        options: YieldOptions,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> WampResult<Vec<(ID, Message)>> {
        debug!("Responding to yield message (id: {})", invocation_id);
        let (caller, call_id, progressive) = match self.invocations.get(&invocation_id) {
            Some(record) if record.callee == sender => {
                (record.caller, record.call_id, record.progressive)
            }
            Some(_) => {
                warn!(
                    "Yield for invocation {} from a session that is not its callee",
                    invocation_id
                );
                return Ok(Vec::new());
            }
            None => {
                // The invocation may have been canceled or torn down already.
                warn!("Yield for an unknown invocation (id: {})", invocation_id);
                return Ok(Vec::new());
            }
        };

        if options.progress && progressive {
            return Ok(vec![(
                caller,
                Message::Result(call_id, ResultDetails::new_progress(), args, kwargs),
            )]);
        }

        self.invocations.remove(&invocation_id);
        Ok(vec![(
            caller,
            Message::Result(call_id, ResultDetails::new(), args, kwargs),
        )])
    }

    pub fn handle_invocation_error(
        &mut self,
        sender: ID,
        invocation_id: ID,
        details: Dict,
        reason: Reason,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> WampResult<Vec<(ID, Message)>> {
        debug!("Responding to invocation error (id: {})", invocation_id);
        match self.invocations.get(&invocation_id) {
            Some(record) if record.callee == sender => {}
            _ => {
                warn!("Error for an unknown invocation (id: {})", invocation_id);
                return Ok(Vec::new());
            }
        }
        match self.invocations.remove(&invocation_id) {
            Some(record) => Ok(vec![(
                record.caller,
                Message::Error(
                    ErrorType::Call,
                    record.call_id,
                    details,
                    reason,
                    args,
                    kwargs,
                ),
            )]),
            None => Ok(Vec::new()),
        }
    }

    /// Cancels an in-flight call.  The caller always gets its canceled error
    /// right away; the callee is only interrupted for the kill modes.
    pub fn handle_cancel(
        &mut self,
        caller: ID,
        request_id: ID,
        options: CancelOptions,
    ) -> WampResult<Vec<(ID, Message)>> {
        let invocation_id = self
            .invocations
            .iter()
            .find(|(_, record)| record.caller == caller && record.call_id == request_id)
            .map(|(id, _)| *id);
        let invocation_id = match invocation_id {
            Some(id) => id,
            None => {
                // The call most likely completed while the cancel was in
                // flight; nothing left to do.
                debug!("Cancel for an unknown call (id: {})", request_id);
                return Ok(Vec::new());
            }
        };
        let record = match self.invocations.remove(&invocation_id) {
            Some(record) => record,
            None => return Ok(Vec::new()),
        };

        let mut deliveries = vec![(
            caller,
            Message::Error(
                ErrorType::Call,
                request_id,
                Dict::new(),
                Reason::Canceled,
                None,
                None,
            ),
        )];
        if options.mode != CancelMode::Skip {
            deliveries.push((
                record.callee,
                Message::Interrupt(invocation_id, InterruptOptions::new(options.mode)),
            ));
        }
        Ok(deliveries)
    }

    #[cfg(test)]
    fn registration_count(&self) -> usize {
        self.registration_ids.len()
    }

    #[cfg(test)]
    fn invocation_count(&self) -> usize {
        self.invocations.len()
    }
}

impl Default for Dealer {
    fn default() -> Dealer {
        Dealer::new()
    }
}

#[cfg(test)]
mod test {
    use super::Dealer;
    use crate::messages::{
        CallOptions, CancelMode, CancelOptions, Dict, ErrorType, InvocationPolicy, Message, Reason,
        RegisterOptions, Value, YieldOptions,
    };
    use crate::session::SessionDetails;
    use crate::{ErrorKind, ID, URI};

    fn dealer_with_sessions(ids: &[ID]) -> Dealer {
        let mut dealer = Dealer::new();
        for id in ids {
            dealer.add_session(SessionDetails::new(*id, "test.realm", "anonymous", "anonymous"));
        }
        dealer
    }

    fn register(dealer: &mut Dealer, session: ID, procedure: &str, policy: InvocationPolicy) -> ID {
        let replies = dealer
            .handle_register(
                session,
                1,
                RegisterOptions {
                    invocation_policy: policy,
                    ..Default::default()
                },
                URI::new(procedure),
            )
            .unwrap();
        match replies[0].1 {
            Message::Registered(_, registration_id) => registration_id,
            ref other => panic!("expected Registered, got {:?}", other),
        }
    }

    #[test]
    fn echo_call_round_trip() {
        let mut dealer = dealer_with_sessions(&[10, 20]);
        let registration_id = register(&mut dealer, 10, "io.echo", InvocationPolicy::Single);

        let deliveries = dealer
            .handle_call(
                20,
                7,
                CallOptions::new(),
                URI::new("io.echo"),
                Some(vec![Value::String("hi".to_string())]),
                None,
            )
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        let (recipient, message) = &deliveries[0];
        assert_eq!(*recipient, 10);
        let invocation_id = match message {
            Message::Invocation(invocation_id, reg_id, _, Some(args), None) => {
                assert_eq!(*reg_id, registration_id);
                assert_eq!(args[0], Value::String("hi".to_string()));
                *invocation_id
            }
            other => panic!("expected Invocation, got {:?}", other),
        };

        let deliveries = dealer
            .handle_yield(
                10,
                invocation_id,
                YieldOptions::new(),
                Some(vec![Value::String("hi".to_string())]),
                None,
            )
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        match &deliveries[0] {
            (20, Message::Result(7, _, Some(_), None)) => {}
            other => panic!("expected Result for the caller, got {:?}", other),
        }
        assert_eq!(dealer.invocation_count(), 0);
    }

    #[test]
    fn call_with_no_registration_errors_out() {
        let mut dealer = dealer_with_sessions(&[20]);
        let err = dealer
            .handle_call(20, 7, CallOptions::new(), URI::new("io.missing"), None, None)
            .unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::ErrorReason(ErrorType::Call, 7, Reason::NoSuchProcedure)
        ));
        assert_eq!(dealer.invocation_count(), 0);
    }

    #[test]
    fn second_single_registration_is_refused() {
        let mut dealer = dealer_with_sessions(&[10, 11]);
        register(&mut dealer, 10, "io.solo", InvocationPolicy::Single);
        let err = dealer
            .handle_register(11, 2, RegisterOptions::new(), URI::new("io.solo"))
            .unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::ErrorReason(ErrorType::Register, 2, Reason::ProcedureAlreadyExists)
        ));
    }

    #[test]
    fn roundrobin_policy_distributes_three_two_two() {
        let mut dealer = dealer_with_sessions(&[1, 2, 3, 4]);
        for callee in [1, 2, 3] {
            register(&mut dealer, callee, "io.rr", InvocationPolicy::RoundRobin);
        }

        let mut counts = std::collections::HashMap::new();
        for call_id in 0..7u64 {
            let deliveries = dealer
                .handle_call(4, call_id + 100, CallOptions::new(), URI::new("io.rr"), None, None)
                .unwrap();
            *counts.entry(deliveries[0].0).or_insert(0) += 1;
        }
        assert_eq!(counts[&1], 3);
        assert_eq!(counts[&2], 2);
        assert_eq!(counts[&3], 2);
    }

    #[test]
    fn unregister_twice_reports_no_such_registration() {
        let mut dealer = dealer_with_sessions(&[10]);
        let registration_id = register(&mut dealer, 10, "io.once", InvocationPolicy::Single);

        let replies = dealer.handle_unregister(10, 5, registration_id).unwrap();
        assert!(matches!(replies[0].1, Message::Unregistered(5)));
        assert_eq!(dealer.registration_count(), 0);

        let err = dealer.handle_unregister(10, 6, registration_id).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::ErrorReason(ErrorType::Unregister, 6, Reason::NoSuchRegistration)
        ));
    }

    #[test]
    fn callee_disconnect_cancels_in_flight_invocations() {
        let mut dealer = dealer_with_sessions(&[10, 20]);
        register(&mut dealer, 10, "io.slow", InvocationPolicy::Single);
        dealer
            .handle_call(20, 7, CallOptions::new(), URI::new("io.slow"), None, None)
            .unwrap();
        assert_eq!(dealer.invocation_count(), 1);

        let deliveries = dealer.remove_session(10);
        assert_eq!(deliveries.len(), 1);
        match &deliveries[0] {
            (20, Message::Error(ErrorType::Call, 7, _, Reason::Canceled, None, None)) => {}
            other => panic!("expected canceled error for the caller, got {:?}", other),
        }
        assert_eq!(dealer.invocation_count(), 0);
        assert_eq!(dealer.registration_count(), 0);
    }

    #[test]
    fn cancel_kill_interrupts_the_callee() {
        let mut dealer = dealer_with_sessions(&[10, 20]);
        register(&mut dealer, 10, "io.slow", InvocationPolicy::Single);
        dealer
            .handle_call(20, 7, CallOptions::new(), URI::new("io.slow"), None, None)
            .unwrap();

        let deliveries = dealer
            .handle_cancel(20, 7, CancelOptions::new(CancelMode::Kill))
            .unwrap();
        assert_eq!(deliveries.len(), 2);
        assert!(matches!(
            deliveries[0],
            (20, Message::Error(ErrorType::Call, 7, _, Reason::Canceled, None, None))
        ));
        assert!(matches!(deliveries[1], (10, Message::Interrupt(..))));
        assert_eq!(dealer.invocation_count(), 0);

        // A yield racing in after the cancel is quietly dropped.
        let late = dealer
            .handle_yield(10, 1, YieldOptions::new(), None, None)
            .unwrap();
        assert!(late.is_empty());
    }

    #[test]
    fn cancel_skip_leaves_the_callee_alone() {
        let mut dealer = dealer_with_sessions(&[10, 20]);
        register(&mut dealer, 10, "io.slow", InvocationPolicy::Single);
        dealer
            .handle_call(20, 7, CallOptions::new(), URI::new("io.slow"), None, None)
            .unwrap();

        let deliveries = dealer
            .handle_cancel(20, 7, CancelOptions::new(CancelMode::Skip))
            .unwrap();
        assert_eq!(deliveries.len(), 1);
        assert!(matches!(deliveries[0].0, 20));
    }

    #[test]
    fn progressive_results_keep_the_invocation_alive() {
        let mut dealer = dealer_with_sessions(&[10, 20]);
        register(&mut dealer, 10, "io.progress", InvocationPolicy::Single);
        let deliveries = dealer
            .handle_call(
                20,
                7,
                CallOptions {
                    receive_progress: true,
                    ..Default::default()
                },
                URI::new("io.progress"),
                None,
                None,
            )
            .unwrap();
        let invocation_id = match deliveries[0].1 {
            Message::Invocation(id, _, ref details, _, _) => {
                assert!(details.receive_progress);
                id
            }
            ref other => panic!("expected Invocation, got {:?}", other),
        };

        for _ in 0..2 {
            let chunk = dealer
                .handle_yield(10, invocation_id, YieldOptions::new_progress(), None, None)
                .unwrap();
            match &chunk[0] {
                (20, Message::Result(7, details, _, _)) => assert!(details.progress),
                other => panic!("expected progress result, got {:?}", other),
            }
            assert_eq!(dealer.invocation_count(), 1);
        }

        let done = dealer
            .handle_yield(10, invocation_id, YieldOptions::new(), None, None)
            .unwrap();
        match &done[0] {
            (20, Message::Result(7, details, _, _)) => assert!(!details.progress),
            other => panic!("expected final result, got {:?}", other),
        }
        assert_eq!(dealer.invocation_count(), 0);
    }

    #[test]
    fn disclose_me_adds_caller_identity() {
        let mut dealer = Dealer::new();
        dealer.add_session(SessionDetails::new(10, "test.realm", "callee", "worker"));
        dealer.add_session(SessionDetails::new(20, "test.realm", "peter", "admin"));
        register(&mut dealer, 10, "io.who", InvocationPolicy::Single);

        let deliveries = dealer
            .handle_call(
                20,
                7,
                CallOptions {
                    disclose_me: true,
                    ..Default::default()
                },
                URI::new("io.who"),
                None,
                None,
            )
            .unwrap();
        match &deliveries[0].1 {
            Message::Invocation(_, _, details, _, _) => {
                assert_eq!(details.caller, Some(20));
                assert_eq!(details.caller_authid.as_deref(), Some("peter"));
                assert_eq!(details.caller_authrole.as_deref(), Some("admin"));
            }
            other => panic!("expected Invocation, got {:?}", other),
        }
    }

    #[test]
    fn invocation_error_is_forwarded_to_the_caller() {
        let mut dealer = dealer_with_sessions(&[10, 20]);
        register(&mut dealer, 10, "io.fail", InvocationPolicy::Single);
        let deliveries = dealer
            .handle_call(20, 9, CallOptions::new(), URI::new("io.fail"), None, None)
            .unwrap();
        let invocation_id = match deliveries[0].1 {
            Message::Invocation(id, ..) => id,
            ref other => panic!("expected Invocation, got {:?}", other),
        };

        let deliveries = dealer
            .handle_invocation_error(
                10,
                invocation_id,
                Dict::new(),
                Reason::RuntimeError,
                Some(vec![Value::String("boom".to_string())]),
                None,
            )
            .unwrap();
        assert!(matches!(
            deliveries[0],
            (20, Message::Error(ErrorType::Call, 9, _, Reason::RuntimeError, Some(_), None))
        ));
        assert_eq!(dealer.invocation_count(), 0);
    }
}
