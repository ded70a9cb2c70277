//! Pattern tries for procedure registrations and topic subscriptions.
//!
//! Each level of a trie corresponds to one dotted uri segment, so every
//! entry starting with `com` for example hangs off the same edge.  Wildcard
//! patterns mark their wild positions with empty segments and therefore live
//! under `""` edges; prefix entries are kept apart from exact ones so that a
//! node carries two stable ids, one per match mode.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::slice::Iter;

use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::idgen::random_id;
use crate::messages::Reason;
use crate::{InvocationPolicy, MatchingPolicy, ID, URI};

/// Represents data that a pattern trie will hold
pub trait PatternData {
    fn get_id(&self) -> ID;
}

impl PatternData for ID {
    fn get_id(&self) -> ID {
        *self
    }
}

/// Represents an error caused during adding or removing patterns
#[derive(Debug)]
pub struct PatternError {
    reason: Reason,
}

impl PatternError {
    #[inline]
    pub fn new(reason: Reason) -> PatternError {
        PatternError { reason }
    }

    pub fn reason(self) -> Reason {
        self.reason
    }
}

/*-------------------------
     Registrations
-------------------------*/

/// A trie of procedure registrations.
///
/// Lookup honors the match mode precedence: an exact match wins over any
/// prefix match, and prefix matches (longest first) win over wildcard
/// matches.
pub struct RegistrationPatternNode<P: PatternData> {
    edges: HashMap<String, RegistrationPatternNode<P>>,
    connections: ProcedureCollection<P>,
    prefix_connections: ProcedureCollection<P>,
    id: ID,
    prefix_id: ID,
}

struct DataWrapper<P: PatternData> {
    registrant: P,
    policy: MatchingPolicy,
}

/// The co-registered callees of one procedure pattern, with the invocation
/// policy they share.
struct ProcedureCollection<P: PatternData> {
    invocation_policy: InvocationPolicy,
    round_robin_counter: RefCell<usize>,
    procedures: Vec<DataWrapper<P>>,
}

impl<P: PatternData> ProcedureCollection<P> {
    fn empty() -> ProcedureCollection<P> {
        ProcedureCollection {
            invocation_policy: InvocationPolicy::Single,
            round_robin_counter: RefCell::new(0),
            procedures: Vec::new(),
        }
    }

    fn add_procedure(
        &mut self,
        registrant: P,
        matching_policy: MatchingPolicy,
        invocation_policy: InvocationPolicy,
    ) -> Result<(), PatternError> {
        if self.procedures.is_empty()
            || (invocation_policy == self.invocation_policy
                && invocation_policy != InvocationPolicy::Single)
        {
            self.procedures.push(DataWrapper {
                registrant,
                policy: matching_policy,
            });
            self.invocation_policy = invocation_policy;
            Ok(())
        } else {
            Err(PatternError::new(Reason::ProcedureAlreadyExists))
        }
    }

    fn contains(&self, registrant_id: ID) -> bool {
        self.procedures
            .iter()
            .any(|wrapper| wrapper.registrant.get_id() == registrant_id)
    }

    fn remove_procedure(&mut self, registrant_id: ID) -> usize {
        self.procedures
            .retain(|wrapper| wrapper.registrant.get_id() != registrant_id);
        self.procedures.len()
    }

    /// Picks the callee for the next invocation under this collection's
    /// invocation policy.
    fn get_entry(&self) -> Option<&DataWrapper<P>> {
        match self.invocation_policy {
            InvocationPolicy::Single | InvocationPolicy::First => self.procedures.first(),
            InvocationPolicy::Last => self.procedures.last(),
            InvocationPolicy::Random => self.procedures.choose(&mut thread_rng()),
            InvocationPolicy::RoundRobin => {
                let mut counter = self.round_robin_counter.borrow_mut();
                if *counter >= self.procedures.len() {
                    *counter = 0
                }
                let result = self.procedures.get(*counter);
                *counter += 1;
                result
            }
        }
    }
}

impl<P: PatternData> Debug for RegistrationPatternNode<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.fmt_with_indent(f, 0)
    }
}

impl<P: PatternData> Default for RegistrationPatternNode<P> {
    fn default() -> RegistrationPatternNode<P> {
        RegistrationPatternNode::new()
    }
}

impl<P: PatternData> RegistrationPatternNode<P> {
    fn fmt_with_indent(&self, f: &mut Formatter<'_>, indent: usize) -> fmt::Result {
        writeln!(
            f,
            "{} pre: {:?} subs: {:?}",
            self.id,
            self.prefix_connections
                .procedures
                .iter()
                .map(|sub| sub.registrant.get_id())
                .join(","),
            self.connections
                .procedures
                .iter()
                .map(|sub| sub.registrant.get_id())
                .join(",")
        )?;
        for (chunk, node) in &self.edges {
            for _ in 0..indent * 2 {
                write!(f, "  ")?;
            }
            write!(f, "{} - ", chunk)?;
            node.fmt_with_indent(f, indent + 1)?;
        }
        Ok(())
    }

    /// Constructs a new RegistrationPatternNode to be used as the root of the trie
    #[inline]
    pub fn new() -> RegistrationPatternNode<P> {
        RegistrationPatternNode {
            edges: HashMap::new(),
            connections: ProcedureCollection::empty(),
            prefix_connections: ProcedureCollection::empty(),
            id: random_id(),
            prefix_id: random_id(),
        }
    }

    /// Add a new registration to the pattern trie with the given pattern and
    /// policies.  Returns the id of the registration entity joined.
    pub fn register_with(
        &mut self,
        procedure: &URI,
        registrant: P,
        matching_policy: MatchingPolicy,
        invocation_policy: InvocationPolicy,
    ) -> Result<ID, PatternError> {
        let mut uri_bits = procedure.uri.split('.');
        let initial = match uri_bits.next() {
            Some(initial) => initial,
            None => return Err(PatternError::new(Reason::InvalidURI)),
        };
        if initial.is_empty() && matching_policy != MatchingPolicy::Wildcard {
            return Err(PatternError::new(Reason::InvalidURI));
        }
        let edge = self
            .edges
            .entry(initial.to_string())
            .or_insert_with(RegistrationPatternNode::new);
        edge.add_registration(uri_bits, registrant, matching_policy, invocation_policy)
    }

    /// Removes one registrant; returns the registration id and how many
    /// owners remain under it.
    pub fn unregister_with(
        &mut self,
        procedure: &str,
        registrant_id: ID,
        matching_policy: MatchingPolicy,
    ) -> Result<(ID, usize), PatternError> {
        let uri_bits = procedure.split('.');
        self.remove_registration(uri_bits, registrant_id, matching_policy)
    }

    /// Gets the registrant that should serve a call to the given uri.
    pub fn get_registrant_for(
        &self,
        procedure: &URI,
    ) -> Result<(&P, ID, MatchingPolicy), PatternError> {
        let uri_bits: Vec<&str> = procedure.uri.split('.').collect();
        self.find_exact(&uri_bits, 0)
            .map(|(wrapper, id)| (&wrapper.registrant, id, wrapper.policy))
            .or_else(|| {
                self.find_prefix(&uri_bits, 0)
                    .map(|(wrapper, id)| (&wrapper.registrant, id, wrapper.policy))
            })
            .or_else(|| {
                self.find_wildcard(&uri_bits, 0)
                    .map(|(wrapper, id)| (&wrapper.registrant, id, wrapper.policy))
            })
            .ok_or_else(|| PatternError::new(Reason::NoSuchProcedure))
    }

    fn add_registration<'a, I>(
        &mut self,
        mut uri_bits: I,
        registrant: P,
        matching_policy: MatchingPolicy,
        invocation_policy: InvocationPolicy,
    ) -> Result<ID, PatternError>
    where
        I: Iterator<Item = &'a str>,
    {
        match uri_bits.next() {
            Some(uri_bit) => {
                if uri_bit.is_empty() && matching_policy != MatchingPolicy::Wildcard {
                    return Err(PatternError::new(Reason::InvalidURI));
                }
                let edge = self
                    .edges
                    .entry(uri_bit.to_string())
                    .or_insert_with(RegistrationPatternNode::new);
                edge.add_registration(uri_bits, registrant, matching_policy, invocation_policy)
            }
            None => {
                if matching_policy == MatchingPolicy::Prefix {
                    self.prefix_connections.add_procedure(
                        registrant,
                        matching_policy,
                        invocation_policy,
                    )?;
                    Ok(self.prefix_id)
                } else {
                    self.connections.add_procedure(
                        registrant,
                        matching_policy,
                        invocation_policy,
                    )?;
                    Ok(self.id)
                }
            }
        }
    }

    fn remove_registration<'a, I>(
        &mut self,
        mut uri_bits: I,
        registrant_id: ID,
        matching_policy: MatchingPolicy,
    ) -> Result<(ID, usize), PatternError>
    where
        I: Iterator<Item = &'a str>,
    {
        // TODO consider deleting nodes in the tree if they are no longer in use.
        match uri_bits.next() {
            Some(uri_bit) => {
                if let Some(edge) = self.edges.get_mut(uri_bit) {
                    edge.remove_registration(uri_bits, registrant_id, matching_policy)
                } else {
                    Err(PatternError::new(Reason::NoSuchRegistration))
                }
            }
            None => {
                let collection = if matching_policy == MatchingPolicy::Prefix {
                    &mut self.prefix_connections
                } else {
                    &mut self.connections
                };
                if !collection.contains(registrant_id) {
                    return Err(PatternError::new(Reason::NoSuchRegistration));
                }
                let remaining = collection.remove_procedure(registrant_id);
                let id = if matching_policy == MatchingPolicy::Prefix {
                    self.prefix_id
                } else {
                    self.id
                };
                Ok((id, remaining))
            }
        }
    }

    fn find_exact(&self, uri_bits: &[&str], depth: usize) -> Option<(&DataWrapper<P>, ID)> {
        if depth == uri_bits.len() {
            self.connections
                .get_entry()
                .filter(|wrapper| wrapper.policy == MatchingPolicy::Strict)
                .map(|wrapper| (wrapper, self.id))
        } else {
            self.edges
                .get(uri_bits[depth])
                .and_then(|edge| edge.find_exact(uri_bits, depth + 1))
        }
    }

    /// The deepest matching prefix registration wins.
    fn find_prefix(&self, uri_bits: &[&str], depth: usize) -> Option<(&DataWrapper<P>, ID)> {
        let deeper = if depth < uri_bits.len() {
            self.edges
                .get(uri_bits[depth])
                .and_then(|edge| edge.find_prefix(uri_bits, depth + 1))
        } else {
            None
        };
        deeper.or_else(|| {
            self.prefix_connections
                .get_entry()
                .map(|wrapper| (wrapper, self.prefix_id))
        })
    }

    fn find_wildcard(&self, uri_bits: &[&str], depth: usize) -> Option<(&DataWrapper<P>, ID)> {
        if depth == uri_bits.len() {
            return self
                .connections
                .get_entry()
                .map(|wrapper| (wrapper, self.id));
        }
        if let Some(edge) = self.edges.get(uri_bits[depth]) {
            if let Some(found) = edge.find_wildcard(uri_bits, depth + 1) {
                return Some(found);
            }
        }
        if let Some(edge) = self.edges.get("") {
            if let Some(found) = edge.find_wildcard(uri_bits, depth + 1) {
                return Some(found);
            }
        }
        None
    }
}

/*-------------------------
     Subscriptions
-------------------------*/

/// A trie of topic subscriptions.
///
/// Unlike procedure lookup, event routing wants every subscription matching
/// a published topic, across all three match modes; `filter` hands back a
/// lazy iterator over them.
pub struct SubscriptionPatternNode<P: PatternData> {
    edges: HashMap<String, SubscriptionPatternNode<P>>,
    connections: Vec<SubscriptionWrapper<P>>,
    prefix_connections: Vec<SubscriptionWrapper<P>>,
    id: ID,
    prefix_id: ID,
}

struct SubscriptionWrapper<P: PatternData> {
    subscriber: P,
    policy: MatchingPolicy,
}

/// A lazy iterator that traverses the pattern trie.  See `SubscriptionPatternNode` for more.
pub struct MatchIterator<'a, P>
where
    P: PatternData,
{
    uri: Vec<String>,
    current: Box<StackFrame<'a, P>>,
}

struct StackFrame<'a, P>
where
    P: PatternData,
{
    node: &'a SubscriptionPatternNode<P>,
    state: IterState<'a, P>,
    depth: usize,
    parent: Option<Box<StackFrame<'a, P>>>,
}

#[derive(Clone)]
enum IterState<'a, P: PatternData> {
    None,
    Wildcard,
    Strict,
    Prefix(Iter<'a, SubscriptionWrapper<P>>),
    PrefixComplete,
    Subs(Iter<'a, SubscriptionWrapper<P>>),
    AllComplete,
}

impl<'a, P: PatternData> Debug for IterState<'a, P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                IterState::None => "None",
                IterState::Wildcard => "Wildcard",
                IterState::Strict => "Strict",
                IterState::Prefix(_) => "Prefix",
                IterState::PrefixComplete => "PrefixComplete",
                IterState::Subs(_) => "Subs",
                IterState::AllComplete => "AllComplete",
            }
        )
    }
}

impl<P: PatternData> Debug for SubscriptionPatternNode<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.fmt_with_indent(f, 0)
    }
}

impl<P: PatternData> Default for SubscriptionPatternNode<P> {
    fn default() -> SubscriptionPatternNode<P> {
        SubscriptionPatternNode::new()
    }
}

impl<P: PatternData> SubscriptionPatternNode<P> {
    fn fmt_with_indent(&self, f: &mut Formatter<'_>, indent: usize) -> fmt::Result {
        writeln!(
            f,
            "{} pre: {:?} subs: {:?}",
            self.id,
            self.prefix_connections
                .iter()
                .map(|sub| sub.subscriber.get_id())
                .join(","),
            self.connections
                .iter()
                .map(|sub| sub.subscriber.get_id())
                .join(","),
        )?;
        for (chunk, node) in &self.edges {
            for _ in 0..indent * 2 {
                write!(f, "  ")?;
            }
            write!(f, "{} - ", chunk)?;
            node.fmt_with_indent(f, indent + 1)?;
        }
        Ok(())
    }

    /// Constructs a new SubscriptionPatternNode to be used as the root of the trie
    #[inline]
    pub fn new() -> SubscriptionPatternNode<P> {
        SubscriptionPatternNode {
            edges: HashMap::new(),
            connections: Vec::new(),
            prefix_connections: Vec::new(),
            id: random_id(),
            prefix_id: random_id(),
        }
    }

    /// Add a new subscription to the pattern trie with the given pattern and matching policy.
    pub fn subscribe_with(
        &mut self,
        topic: &URI,
        subscriber: P,
        matching_policy: MatchingPolicy,
    ) -> Result<ID, PatternError> {
        let mut uri_bits = topic.uri.split('.');
        let initial = match uri_bits.next() {
            Some(initial) => initial,
            None => return Err(PatternError::new(Reason::InvalidURI)),
        };
        if initial.is_empty() && matching_policy != MatchingPolicy::Wildcard {
            return Err(PatternError::new(Reason::InvalidURI));
        }
        let edge = self
            .edges
            .entry(initial.to_string())
            .or_insert_with(SubscriptionPatternNode::new);
        edge.add_subscription(uri_bits, subscriber, matching_policy)
    }

    /// Removes a subscription from the pattern trie; returns the
    /// subscription id and how many subscribers remain under it.
    pub fn unsubscribe_with(
        &mut self,
        topic: &str,
        subscriber_id: ID,
        matching_policy: MatchingPolicy,
    ) -> Result<(ID, usize), PatternError> {
        let uri_bits = topic.split('.');
        self.remove_subscription(uri_bits, subscriber_id, matching_policy)
    }

    fn add_subscription<'a, I>(
        &mut self,
        mut uri_bits: I,
        subscriber: P,
        matching_policy: MatchingPolicy,
    ) -> Result<ID, PatternError>
    where
        I: Iterator<Item = &'a str>,
    {
        match uri_bits.next() {
            Some(uri_bit) => {
                if uri_bit.is_empty() && matching_policy != MatchingPolicy::Wildcard {
                    return Err(PatternError::new(Reason::InvalidURI));
                }
                let edge = self
                    .edges
                    .entry(uri_bit.to_string())
                    .or_insert_with(SubscriptionPatternNode::new);
                edge.add_subscription(uri_bits, subscriber, matching_policy)
            }
            None => {
                if matching_policy == MatchingPolicy::Prefix {
                    self.prefix_connections.push(SubscriptionWrapper {
                        subscriber,
                        policy: matching_policy,
                    });
                    Ok(self.prefix_id)
                } else {
                    self.connections.push(SubscriptionWrapper {
                        subscriber,
                        policy: matching_policy,
                    });
                    Ok(self.id)
                }
            }
        }
    }

    fn remove_subscription<'a, I>(
        &mut self,
        mut uri_bits: I,
        subscriber_id: ID,
        matching_policy: MatchingPolicy,
    ) -> Result<(ID, usize), PatternError>
    where
        I: Iterator<Item = &'a str>,
    {
        match uri_bits.next() {
            Some(uri_bit) => {
                if let Some(edge) = self.edges.get_mut(uri_bit) {
                    edge.remove_subscription(uri_bits, subscriber_id, matching_policy)
                } else {
                    Err(PatternError::new(Reason::NoSuchSubscription))
                }
            }
            None => {
                let (collection, id) = if matching_policy == MatchingPolicy::Prefix {
                    (&mut self.prefix_connections, self.prefix_id)
                } else {
                    (&mut self.connections, self.id)
                };
                if !collection
                    .iter()
                    .any(|sub| sub.subscriber.get_id() == subscriber_id)
                {
                    return Err(PatternError::new(Reason::NoSuchSubscription));
                }
                collection.retain(|sub| sub.subscriber.get_id() != subscriber_id);
                Ok((id, collection.len()))
            }
        }
    }

    /// Constructs a lazy iterator over all of the subscribers whose patterns
    /// match the given uri.
    ///
    /// The iterator yields triples of the subscriber data, the id of the
    /// subscription and the matching policy the subscription was created
    /// with.
    pub fn filter(&self, topic: URI) -> MatchIterator<'_, P> {
        MatchIterator {
            current: Box::new(StackFrame {
                node: self,
                depth: 0,
                state: IterState::None,
                parent: None,
            }),
            uri: topic.uri.split('.').map(|s| s.to_string()).collect(),
        }
    }
}

impl<'a, P: PatternData> MatchIterator<'a, P> {
    fn push(&mut self, child: &'a SubscriptionPatternNode<P>) {
        let new_node = Box::new(StackFrame {
            parent: None,
            depth: self.current.depth + 1,
            node: child,
            state: IterState::None,
        });
        let parent = mem::replace(&mut self.current, new_node);
        self.current.parent = Some(parent);
    }

    /// Moves through the subscription tree, looking for the next set of
    /// subscribers that match the given uri.
    fn traverse(&mut self) -> Option<(&'a P, ID, MatchingPolicy)> {
        // This method functions as a push down automata.  For each node, it
        // starts by iterating through the subscriptions that match a prefix
        // of the uri.  Then when that's done, it checks if the uri has been
        // fully processed, and if so, iterates through the connections that
        // require exact matching.  Otherwise, it pushes the current node on
        // the stack, consumes another chunk of the uri and moves on to any
        // children that use wildcard matching.  Once it is finished
        // traversing that part of the tree, it re-consumes the same chunk of
        // the uri and moves on to any children that match the chunk exactly.
        // After all that is exhausted, it pops the node off the stack and
        // returns to its parent.
        match self.current.state {
            IterState::None => {
                self.current.state = IterState::Prefix(self.current.node.prefix_connections.iter())
            }
            IterState::Prefix(_) => {
                self.current.state = IterState::PrefixComplete;
            }
            IterState::PrefixComplete => {
                if self.current.depth == self.uri.len() {
                    self.current.state = IterState::Subs(self.current.node.connections.iter());
                } else if let Some(child) = self.current.node.edges.get("") {
                    self.current.state = IterState::Wildcard;
                    self.push(child);
                } else if let Some(child) =
                    self.current.node.edges.get(&self.uri[self.current.depth])
                {
                    self.current.state = IterState::Strict;
                    self.push(child);
                } else {
                    self.current.state = IterState::AllComplete;
                }
            }
            IterState::Wildcard => {
                if self.current.depth == self.uri.len() {
                    self.current.state = IterState::AllComplete;
                } else if let Some(child) =
                    self.current.node.edges.get(&self.uri[self.current.depth])
                {
                    self.current.state = IterState::Strict;
                    self.push(child);
                } else {
                    self.current.state = IterState::AllComplete;
                }
            }
            IterState::Strict => {
                self.current.state = IterState::AllComplete;
            }
            IterState::Subs(_) => {
                self.current.state = IterState::AllComplete;
            }
            IterState::AllComplete => {
                if self.current.depth == 0 {
                    return None;
                } else {
                    let parent = self.current.parent.take();
                    let _ = mem::replace(&mut self.current, parent.unwrap());
                }
            }
        };
        self.next()
    }
}

impl<'a, P: PatternData> Iterator for MatchIterator<'a, P> {
    type Item = (&'a P, ID, MatchingPolicy);

    fn next(&mut self) -> Option<(&'a P, ID, MatchingPolicy)> {
        let prefix_id = self.current.node.prefix_id;
        let node_id = self.current.node.id;
        // If we are currently iterating through subscriptions, continue.
        match self.current.state {
            IterState::Prefix(ref mut prefix_iter) => {
                let next = prefix_iter.next();
                if let Some(next) = next {
                    return Some((&next.subscriber, prefix_id, next.policy));
                }
            }
            IterState::Subs(ref mut sub_iter) => {
                let next = sub_iter.next();
                if let Some(next) = next {
                    return Some((&next.subscriber, node_id, next.policy));
                }
            }
            _ => {}
        };

        // Otherwise, it is time to traverse through the tree.
        self.traverse()
    }
}

#[cfg(test)]
mod test {
    use super::{RegistrationPatternNode, SubscriptionPatternNode};
    use crate::{InvocationPolicy, MatchingPolicy, ID, URI};

    #[test]
    fn adding_registration_patterns() {
        let mut root: RegistrationPatternNode<ID> = RegistrationPatternNode::new();

        let ids = [
            root.register_with(
                &URI::new("com.example.test..topic"),
                1,
                MatchingPolicy::Wildcard,
                InvocationPolicy::Single,
            )
            .unwrap(),
            root.register_with(
                &URI::new("com.example.test.specific.topic"),
                2,
                MatchingPolicy::Strict,
                InvocationPolicy::Single,
            )
            .unwrap(),
            root.register_with(
                &URI::new("com.example"),
                3,
                MatchingPolicy::Prefix,
                InvocationPolicy::Single,
            )
            .unwrap(),
            root.register_with(
                &URI::new("com.example.test"),
                4,
                MatchingPolicy::Prefix,
                InvocationPolicy::Single,
            )
            .unwrap(),
        ];

        assert_eq!(
            root.get_registrant_for(&URI::new("com.example.test.specific.topic"))
                .unwrap()
                .1,
            ids[1]
        );
        assert_eq!(
            root.get_registrant_for(&URI::new("com.example.test.another.topic"))
                .unwrap()
                .1,
            ids[3]
        );
        assert_eq!(
            root.get_registrant_for(&URI::new("com.example.test.another"))
                .unwrap()
                .1,
            ids[3]
        );
        assert_eq!(
            root.get_registrant_for(&URI::new("com.example"))
                .unwrap()
                .1,
            ids[2]
        );
    }

    #[test]
    fn exact_wins_over_prefix_wins_over_wildcard() {
        let mut root: RegistrationPatternNode<ID> = RegistrationPatternNode::new();

        root.register_with(
            &URI::new("com.example..topic"),
            1,
            MatchingPolicy::Wildcard,
            InvocationPolicy::Single,
        )
        .unwrap();
        root.register_with(
            &URI::new("com.example"),
            2,
            MatchingPolicy::Prefix,
            InvocationPolicy::Single,
        )
        .unwrap();
        root.register_with(
            &URI::new("com.example.test.topic"),
            3,
            MatchingPolicy::Strict,
            InvocationPolicy::Single,
        )
        .unwrap();

        // All three patterns match; exact wins.
        let (registrant, _, policy) = root
            .get_registrant_for(&URI::new("com.example.test.topic"))
            .unwrap();
        assert_eq!(*registrant, 3);
        assert_eq!(policy, MatchingPolicy::Strict);

        // Prefix and wildcard match; prefix wins.
        let (registrant, _, policy) = root
            .get_registrant_for(&URI::new("com.example.other.topic"))
            .unwrap();
        assert_eq!(*registrant, 2);
        assert_eq!(policy, MatchingPolicy::Prefix);
    }

    #[test]
    fn prefix_match_respects_segment_boundaries() {
        let mut root: RegistrationPatternNode<ID> = RegistrationPatternNode::new();
        root.register_with(
            &URI::new("com.x"),
            1,
            MatchingPolicy::Prefix,
            InvocationPolicy::Single,
        )
        .unwrap();

        assert!(root.get_registrant_for(&URI::new("com.x.y")).is_ok());
        assert!(root.get_registrant_for(&URI::new("com.x")).is_ok());
        assert!(root.get_registrant_for(&URI::new("com.xy")).is_err());
    }

    #[test]
    fn single_policy_permits_exactly_one_owner() {
        let mut root: RegistrationPatternNode<ID> = RegistrationPatternNode::new();
        root.register_with(
            &URI::new("com.example.proc"),
            1,
            MatchingPolicy::Strict,
            InvocationPolicy::Single,
        )
        .unwrap();
        assert!(root
            .register_with(
                &URI::new("com.example.proc"),
                2,
                MatchingPolicy::Strict,
                InvocationPolicy::Single,
            )
            .is_err());
    }

    #[test]
    fn shared_registration_keeps_one_id() {
        let mut root: RegistrationPatternNode<ID> = RegistrationPatternNode::new();
        let first = root
            .register_with(
                &URI::new("com.example.proc"),
                1,
                MatchingPolicy::Strict,
                InvocationPolicy::RoundRobin,
            )
            .unwrap();
        let second = root
            .register_with(
                &URI::new("com.example.proc"),
                2,
                MatchingPolicy::Strict,
                InvocationPolicy::RoundRobin,
            )
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn removing_registration_patterns() {
        let mut root: RegistrationPatternNode<ID> = RegistrationPatternNode::new();

        let ids = [
            root.register_with(
                &URI::new("com.example.test..topic"),
                1,
                MatchingPolicy::Wildcard,
                InvocationPolicy::Single,
            )
            .unwrap(),
            root.register_with(
                &URI::new("com.example.test.specific.topic"),
                2,
                MatchingPolicy::Strict,
                InvocationPolicy::Single,
            )
            .unwrap(),
        ];

        let (removed, remaining) = root
            .unregister_with("com.example.test..topic", 1, MatchingPolicy::Wildcard)
            .unwrap();
        assert_eq!(removed, ids[0]);
        assert_eq!(remaining, 0);

        assert_eq!(
            root.get_registrant_for(&URI::new("com.example.test.specific.topic"))
                .unwrap()
                .1,
            ids[1]
        );
        assert!(root
            .get_registrant_for(&URI::new("com.example.test.another.topic"))
            .is_err());
    }

    #[test]
    fn unregister_requires_ownership() {
        let mut root: RegistrationPatternNode<ID> = RegistrationPatternNode::new();
        root.register_with(
            &URI::new("com.example.proc"),
            1,
            MatchingPolicy::Strict,
            InvocationPolicy::Single,
        )
        .unwrap();
        assert!(root
            .unregister_with("com.example.proc", 2, MatchingPolicy::Strict)
            .is_err());
    }

    #[test]
    fn round_robin_rotates_in_insertion_order() {
        let mut root: RegistrationPatternNode<ID> = RegistrationPatternNode::new();
        for id in [11, 22, 33] {
            root.register_with(
                &URI::new("com.example.rr"),
                id,
                MatchingPolicy::Strict,
                InvocationPolicy::RoundRobin,
            )
            .unwrap();
        }

        let mut picks = Vec::new();
        for _ in 0..7 {
            let (registrant, _, _) = root.get_registrant_for(&URI::new("com.example.rr")).unwrap();
            picks.push(*registrant);
        }
        assert_eq!(picks, vec![11, 22, 33, 11, 22, 33, 11]);
    }

    #[test]
    fn adding_subscription_patterns() {
        let mut root: SubscriptionPatternNode<ID> = SubscriptionPatternNode::new();

        let ids = [
            root.subscribe_with(&URI::new("com.example.test..topic"), 1, MatchingPolicy::Wildcard)
                .unwrap(),
            root.subscribe_with(
                &URI::new("com.example.test.specific.topic"),
                2,
                MatchingPolicy::Strict,
            )
            .unwrap(),
            root.subscribe_with(&URI::new("com.example"), 3, MatchingPolicy::Prefix)
                .unwrap(),
            root.subscribe_with(&URI::new("com.example.test"), 4, MatchingPolicy::Prefix)
                .unwrap(),
        ];

        assert_eq!(
            root.filter(URI::new("com.example.test.specific.topic"))
                .map(|(_subscriber, id, _policy)| id)
                .collect::<Vec<_>>(),
            vec![ids[2], ids[3], ids[0], ids[1]]
        );
    }

    #[test]
    fn removing_subscription_patterns() {
        let mut root: SubscriptionPatternNode<ID> = SubscriptionPatternNode::new();

        let ids = [
            root.subscribe_with(&URI::new("com.example.test..topic"), 1, MatchingPolicy::Wildcard)
                .unwrap(),
            root.subscribe_with(
                &URI::new("com.example.test.specific.topic"),
                2,
                MatchingPolicy::Strict,
            )
            .unwrap(),
            root.subscribe_with(&URI::new("com.example"), 3, MatchingPolicy::Prefix)
                .unwrap(),
            root.subscribe_with(&URI::new("com.example.test"), 4, MatchingPolicy::Prefix)
                .unwrap(),
        ];

        root.unsubscribe_with("com.example.test..topic", 1, MatchingPolicy::Wildcard)
            .unwrap();
        root.unsubscribe_with("com.example.test", 4, MatchingPolicy::Prefix)
            .unwrap();

        assert_eq!(
            root.filter(URI::new("com.example.test.specific.topic"))
                .map(|(_subscriber, id, _policy)| id)
                .collect::<Vec<_>>(),
            vec![ids[2], ids[1]]
        )
    }
}
