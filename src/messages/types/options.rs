use std::fmt;

use serde::{Deserialize, Serialize};

use super::{is_not, ClientRoles, Dict, InvocationPolicy, MatchingPolicy, RouterRoles, URI};
use crate::ID;

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct HelloDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent: Option<String>,
    roles: ClientRoles,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authmethods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authextra: Option<Dict>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct WelcomeDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent: Option<String>,
    roles: RouterRoles,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authrole: Option<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct SubscribeOptions {
    #[serde(
        default,
        rename = "match",
        skip_serializing_if = "MatchingPolicy::is_strict"
    )]
    pub pattern_match: MatchingPolicy,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default, Clone)]
pub struct PublishOptions {
    #[serde(default, skip_serializing_if = "is_not")]
    pub acknowledge: bool,

    // Unset means the broker default of true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_me: Option<bool>,

    #[serde(default, skip_serializing_if = "is_not")]
    pub disclose_me: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<ID>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligible: Option<Vec<ID>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_authid: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligible_authid: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_authrole: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligible_authrole: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct RegisterOptions {
    #[serde(
        default,
        rename = "match",
        skip_serializing_if = "MatchingPolicy::is_strict"
    )]
    pub pattern_match: MatchingPolicy,

    #[serde(
        default,
        rename = "invoke",
        skip_serializing_if = "InvocationPolicy::is_single"
    )]
    pub invocation_policy: InvocationPolicy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u64>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default, Clone)]
pub struct CallOptions {
    /// Caller side deadline in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "is_not")]
    pub disclose_me: bool,

    #[serde(default, skip_serializing_if = "is_not")]
    pub receive_progress: bool,
}

/// How a caller wants an in-flight call to be torn down.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum CancelMode {
    /// Cancel router-side bookkeeping only; the callee keeps running.
    Skip,
    /// Interrupt the callee and wait for it to confirm.
    Kill,
    /// Interrupt the callee and answer the caller immediately.
    KillNoWait,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default, Clone)]
pub struct CancelOptions {
    #[serde(default)]
    pub mode: CancelMode,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default, Clone)]
pub struct InterruptOptions {
    #[serde(default)]
    pub mode: CancelMode,
}

#[derive(PartialEq, Debug, Default, Serialize, Deserialize, Clone)]
pub struct YieldOptions {
    #[serde(default, skip_serializing_if = "is_not")]
    pub progress: bool,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default, Clone)]
pub struct EventDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<ID>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_authid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_authrole: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<URI>,
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Default, Clone)]
pub struct InvocationDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure: Option<URI>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<ID>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_authid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_authrole: Option<String>,

    #[serde(default, skip_serializing_if = "is_not")]
    pub receive_progress: bool,
}

#[derive(PartialEq, Debug, Default, Serialize, Deserialize, Clone)]
pub struct ResultDetails {
    #[serde(default, skip_serializing_if = "is_not")]
    pub progress: bool,
}

impl HelloDetails {
    pub fn new(roles: ClientRoles) -> HelloDetails {
        HelloDetails {
            roles,
            ..Default::default()
        }
    }

    pub fn new_with_agent(roles: ClientRoles, agent: &str) -> HelloDetails {
        HelloDetails {
            roles,
            agent: Some(agent.to_string()),
            ..Default::default()
        }
    }
}

impl WelcomeDetails {
    pub fn new(roles: RouterRoles) -> WelcomeDetails {
        WelcomeDetails {
            roles,
            ..Default::default()
        }
    }

    pub fn new_with_auth(roles: RouterRoles, authid: &str, authrole: &str) -> WelcomeDetails {
        WelcomeDetails {
            roles,
            authid: Some(authid.to_string()),
            authrole: Some(authrole.to_string()),
            ..Default::default()
        }
    }
}

impl ErrorDetails {
    pub fn new() -> ErrorDetails {
        ErrorDetails { message: None }
    }

    pub fn new_with_message(message: &str) -> ErrorDetails {
        ErrorDetails {
            message: Some(message.to_string()),
        }
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl SubscribeOptions {
    pub fn new() -> SubscribeOptions {
        SubscribeOptions::default()
    }

    pub fn new_with_pattern(pattern_match: MatchingPolicy) -> SubscribeOptions {
        SubscribeOptions { pattern_match }
    }
}

impl PublishOptions {
    pub fn new(acknowledge: bool) -> PublishOptions {
        PublishOptions {
            acknowledge,
            ..Default::default()
        }
    }

    pub fn should_acknowledge(&self) -> bool {
        self.acknowledge
    }

    /// Publisher exclusion defaults to on.
    pub fn excludes_publisher(&self) -> bool {
        self.exclude_me.unwrap_or(true)
    }
}

impl RegisterOptions {
    pub fn new() -> RegisterOptions {
        RegisterOptions::default()
    }

    pub fn new_with_policies(
        pattern_match: MatchingPolicy,
        invocation_policy: InvocationPolicy,
    ) -> RegisterOptions {
        RegisterOptions {
            pattern_match,
            invocation_policy,
            concurrency: None,
        }
    }
}

impl CallOptions {
    pub fn new() -> CallOptions {
        CallOptions::default()
    }
}

impl Default for CancelMode {
    fn default() -> CancelMode {
        CancelMode::KillNoWait
    }
}

impl CancelMode {
    fn get_string(&self) -> &'static str {
        match *self {
            CancelMode::Skip => "skip",
            CancelMode::Kill => "kill",
            CancelMode::KillNoWait => "killnowait",
        }
    }
}

impl fmt::Display for CancelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_string())
    }
}

struct CancelModeVisitor;

impl serde::Serialize for CancelMode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.get_string())
    }
}

impl<'de> serde::Deserialize<'de> for CancelMode {
    fn deserialize<D>(deserializer: D) -> Result<CancelMode, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(CancelModeVisitor)
    }
}

impl<'de> serde::de::Visitor<'de> for CancelModeVisitor {
    type Value = CancelMode;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("cancel mode")
    }

    #[inline]
    fn visit_str<E>(self, value: &str) -> Result<CancelMode, E>
    where
        E: serde::de::Error,
    {
        match value {
            "skip" => Ok(CancelMode::Skip),
            "kill" => Ok(CancelMode::Kill),
            "killnowait" => Ok(CancelMode::KillNoWait),
            x => Err(serde::de::Error::custom(format!(
                "Invalid cancel mode: {}",
                x
            ))),
        }
    }
}

impl CancelOptions {
    pub fn new(mode: CancelMode) -> CancelOptions {
        CancelOptions { mode }
    }
}

impl InterruptOptions {
    pub fn new(mode: CancelMode) -> InterruptOptions {
        InterruptOptions { mode }
    }
}

impl YieldOptions {
    pub fn new() -> YieldOptions {
        YieldOptions::default()
    }

    pub fn new_progress() -> YieldOptions {
        YieldOptions { progress: true }
    }
}

impl EventDetails {
    pub fn new() -> EventDetails {
        EventDetails::default()
    }

    pub fn new_with_topic(topic: URI) -> EventDetails {
        EventDetails {
            topic: Some(topic),
            ..Default::default()
        }
    }
}

impl InvocationDetails {
    pub fn new() -> InvocationDetails {
        InvocationDetails::default()
    }
}

impl ResultDetails {
    pub fn new() -> ResultDetails {
        ResultDetails::default()
    }

    pub fn new_progress() -> ResultDetails {
        ResultDetails { progress: true }
    }
}
