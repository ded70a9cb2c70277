//! The broker fans events out from publishers to subscribers.

use std::collections::HashMap;

use log::debug;

use crate::messages::{
    Dict, ErrorType, EventDetails, List, Message, PublishOptions, Reason, SubscribeOptions,
};
use crate::router::patterns::SubscriptionPatternNode;
use crate::session::SessionDetails;
use crate::{Error, ErrorKind, MatchingPolicy, WampResult, ID, URI};

/// Router side pub/sub engine for one realm.
///
/// Like the dealer it is pure bookkeeping: operations return the
/// `(recipient, message)` pairs to deliver and never touch a socket.
pub struct Broker {
    subscriptions: SubscriptionPatternNode<ID>,
    subscription_ids: HashMap<ID, (String, MatchingPolicy)>,
    session_subscriptions: HashMap<ID, Vec<ID>>,
    publication_counter: ID,
    sessions: HashMap<ID, SessionDetails>,
}

impl Broker {
    pub fn new() -> Broker {
        Broker {
            subscriptions: SubscriptionPatternNode::new(),
            subscription_ids: HashMap::new(),
            session_subscriptions: HashMap::new(),
            publication_counter: 0,
            sessions: HashMap::new(),
        }
    }

    pub fn add_session(&mut self, details: SessionDetails) {
        self.sessions.insert(details.session_id, details);
    }

    pub fn remove_session(&mut self, session_id: ID) {
        if let Some(subscribed) = self.session_subscriptions.remove(&session_id) {
            for subscription_id in subscribed {
                if let Some((uri, policy)) = self.subscription_ids.get(&subscription_id).cloned() {
                    match self.subscriptions.unsubscribe_with(&uri, session_id, policy) {
                        Ok((_, 0)) => {
                            self.subscription_ids.remove(&subscription_id);
                        }
                        Ok(_) => {}
                        Err(_) => {}
                    }
                }
            }
        }
        self.sessions.remove(&session_id);
    }

    pub fn handle_subscribe(
        &mut self,
        sender: ID,
        request_id: ID,
        options: SubscribeOptions,
        topic: URI,
    ) -> WampResult<Vec<(ID, Message)>> {
        debug!(
            "Responding to subscribe message (id: {}, topic: {})",
            request_id, topic.uri
        );
        if !topic.is_valid_with(options.pattern_match == MatchingPolicy::Wildcard) {
            return Err(Error::new(ErrorKind::ErrorReason(
                ErrorType::Subscribe,
                request_id,
                Reason::InvalidURI,
            )));
        }
        let subscription_id = match self
            .subscriptions
            .subscribe_with(&topic, sender, options.pattern_match)
        {
            Ok(id) => id,
            Err(e) => {
                return Err(Error::new(ErrorKind::ErrorReason(
                    ErrorType::Subscribe,
                    request_id,
                    e.reason(),
                )))
            }
        };
        self.subscription_ids
            .insert(subscription_id, (topic.uri, options.pattern_match));
        let subscribed = self.session_subscriptions.entry(sender).or_default();
        if !subscribed.contains(&subscription_id) {
            subscribed.push(subscription_id);
        }
        Ok(vec![(sender, Message::Subscribed(request_id, subscription_id))])
    }

    pub fn handle_unsubscribe(
        &mut self,
        sender: ID,
        request_id: ID,
        subscription_id: ID,
    ) -> WampResult<Vec<(ID, Message)>> {
        let (uri, policy) = match self.subscription_ids.get(&subscription_id) {
            Some(entry) => entry.clone(),
            None => {
                return Err(Error::new(ErrorKind::ErrorReason(
                    ErrorType::Unsubscribe,
                    request_id,
                    Reason::NoSuchSubscription,
                )))
            }
        };
        let remaining = match self.subscriptions.unsubscribe_with(&uri, sender, policy) {
            Ok((_, remaining)) => remaining,
            Err(e) => {
                return Err(Error::new(ErrorKind::ErrorReason(
                    ErrorType::Unsubscribe,
                    request_id,
                    e.reason(),
                )))
            }
        };
        if remaining == 0 {
            self.subscription_ids.remove(&subscription_id);
        }
        if let Some(subscribed) = self.session_subscriptions.get_mut(&sender) {
            subscribed.retain(|id| *id != subscription_id);
        }
        Ok(vec![(sender, Message::Unsubscribed(request_id))])
    }

    /// Computes the recipient set for a publication and emits one EVENT per
    /// remaining recipient, all sharing one fresh publication id.
    pub fn handle_publish(
        &mut self,
        sender: ID,
        request_id: ID,
        options: PublishOptions,
        topic: URI,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> WampResult<Vec<(ID, Message)>> {
        debug!(
            "Responding to publish message (id: {}, topic: {})",
            request_id, topic.uri
        );
        if !topic.is_valid() {
            return Err(Error::new(ErrorKind::ErrorReason(
                ErrorType::Publish,
                request_id,
                Reason::InvalidURI,
            )));
        }

        self.publication_counter += 1;
        let publication_id = self.publication_counter;

        let mut deliveries = Vec::new();
        for (subscriber, subscription_id, policy) in self.subscriptions.filter(topic.clone()) {
            let subscriber = *subscriber;
            if !self.is_eligible(sender, subscriber, &options) {
                continue;
            }

            let mut details = EventDetails::new();
            details.topic = if policy == MatchingPolicy::Strict {
                None
            } else {
                Some(topic.clone())
            };
            if options.disclose_me {
                if let Some(publisher) = self.sessions.get(&sender) {
                    details.publisher = Some(publisher.session_id);
                    details.publisher_authid = Some(publisher.authid.clone());
                    details.publisher_authrole = Some(publisher.authrole.clone());
                }
            }

            deliveries.push((
                subscriber,
                Message::Event(
                    subscription_id,
                    publication_id,
                    details,
                    args.clone(),
                    kwargs.clone(),
                ),
            ));
        }

        if options.should_acknowledge() {
            deliveries.push((sender, Message::Published(request_id, publication_id)));
        }
        Ok(deliveries)
    }

    /// Applies publisher exclusion and the black/white recipient filters.
    fn is_eligible(&self, sender: ID, subscriber: ID, options: &PublishOptions) -> bool {
        if subscriber == sender && options.excludes_publisher() {
            return false;
        }
        if let Some(ref exclude) = options.exclude {
            if exclude.contains(&subscriber) {
                return false;
            }
        }
        if let Some(ref eligible) = options.eligible {
            if !eligible.contains(&subscriber) {
                return false;
            }
        }

        let needs_identity = options.exclude_authid.is_some()
            || options.eligible_authid.is_some()
            || options.exclude_authrole.is_some()
            || options.eligible_authrole.is_some();
        if !needs_identity {
            return true;
        }
        let details = match self.sessions.get(&subscriber) {
            Some(details) => details,
            None => return false,
        };
        if let Some(ref exclude) = options.exclude_authid {
            if exclude.contains(&details.authid) {
                return false;
            }
        }
        if let Some(ref eligible) = options.eligible_authid {
            if !eligible.contains(&details.authid) {
                return false;
            }
        }
        if let Some(ref exclude) = options.exclude_authrole {
            if exclude.contains(&details.authrole) {
                return false;
            }
        }
        if let Some(ref eligible) = options.eligible_authrole {
            if !eligible.contains(&details.authrole) {
                return false;
            }
        }
        true
    }

    #[cfg(test)]
    fn last_publication_id(&self) -> ID {
        self.publication_counter
    }

    #[cfg(test)]
    fn subscription_count(&self) -> usize {
        self.subscription_ids.len()
    }
}

impl Default for Broker {
    fn default() -> Broker {
        Broker::new()
    }
}
