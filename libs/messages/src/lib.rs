//! The framed wire protocol spoken on the `/client`, `/gateway` and `/relay`
//! sockets, seen from the server side.
//!
//! Every frame is a JSON object `{topic, event, payload, ref}`. Domain events
//! are one discriminated union per direction (see [`client`], [`gateway`] and
//! [`relay`]); everything else is protocol machinery: joins, heartbeats,
//! replies and disconnects.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod client;
pub mod gateway;
pub mod relay;

use chrono::serde::ts_seconds;
use chrono::{DateTime, Utc};
use portal_model::RelayId;
use portal_policy::ViolatedProperty;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// A frame on any of the three sockets.
///
/// `T` is the inbound domain union when deserializing and the outbound domain
/// union when serializing; `R` is the matching reply union.
#[derive(Debug, PartialEq, Deserialize, Serialize)]
pub struct PhoenixMessage<T, R> {
    topic: String,
    #[serde(flatten)]
    payload: Payload<T, R>,
    #[serde(rename = "ref")]
    reference: Option<RequestId>,
}

/// The `ref` a peer attached to a frame; echoed verbatim on replies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum Payload<T, R> {
    /// A peer wants to join a topic. The payload shape is endpoint-specific
    /// and parsed by the session after the topic has been matched.
    #[serde(rename = "phx_join")]
    Join(serde_json::Value),
    #[serde(rename = "phx_leave")]
    Leave(serde_json::Value),
    #[serde(rename = "heartbeat")]
    Heartbeat(serde_json::Value),
    #[serde(rename = "phx_reply")]
    Reply(Reply<R>),
    #[serde(rename = "disconnect")]
    Disconnect { reason: DisconnectReason },
    #[serde(untagged)]
    Message(T),
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "response")]
pub enum Reply<R> {
    Ok(OkReply<R>),
    Error(ErrorReply),
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OkReply<R> {
    Message(R),
    NoMessage(Empty),
}

/// Serializes as `{}` instead of `null`.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Empty {}

/// The reason an RPC or a join was refused.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum ErrorReply {
    #[serde(rename = "unmatched topic")]
    UnmatchedTopic,
    InvalidVersion,
    TokenExpired,
    Disabled,
    NotFound,
    Offline,
    Closed,
    RetryLater,
    Forbidden {
        #[serde(default)]
        violated_properties: Vec<ViolatedProperty>,
    },
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReply::UnmatchedTopic => write!(f, "unmatched topic"),
            ErrorReply::InvalidVersion => write!(f, "invalid version"),
            ErrorReply::TokenExpired => write!(f, "token expired"),
            ErrorReply::Disabled => write!(f, "disabled"),
            ErrorReply::NotFound => write!(f, "not found"),
            ErrorReply::Offline => write!(f, "offline"),
            ErrorReply::Closed => write!(f, "closed"),
            ErrorReply::RetryLater => write!(f, "retry later"),
            ErrorReply::Forbidden { .. } => write!(f, "forbidden"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    TokenExpired,
    InvalidVersion,
    Shutdown,
}

impl<T, R> PhoenixMessage<T, R> {
    pub fn new_message(topic: impl Into<String>, payload: T, reference: Option<RequestId>) -> Self {
        Self {
            topic: topic.into(),
            payload: Payload::Message(payload),
            reference,
        }
    }

    pub fn new_ok_reply(topic: impl Into<String>, payload: R, reference: Option<RequestId>) -> Self {
        Self {
            topic: topic.into(),
            payload: Payload::Reply(Reply::Ok(OkReply::Message(payload))),
            reference,
        }
    }

    pub fn new_empty_reply(topic: impl Into<String>, reference: Option<RequestId>) -> Self {
        Self {
            topic: topic.into(),
            payload: Payload::Reply(Reply::Ok(OkReply::NoMessage(Empty {}))),
            reference,
        }
    }

    pub fn new_err_reply(
        topic: impl Into<String>,
        reason: ErrorReply,
        reference: Option<RequestId>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: Payload::Reply(Reply::Error(reason)),
            reference,
        }
    }

    pub fn new_disconnect(topic: impl Into<String>, reason: DisconnectReason) -> Self {
        Self {
            topic: topic.into(),
            payload: Payload::Disconnect { reason },
            reference: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn reference(&self) -> Option<&RequestId> {
        self.reference.as_ref()
    }

    pub fn into_parts(self) -> (String, Option<RequestId>, Payload<T, R>) {
        (self.topic, self.reference, self.payload)
    }
}

/// An upstream DNS server entry, normalized from `ip[:port]`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum DnsServer {
    IpPort(IpDnsServer),
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct IpDnsServer {
    pub address: SocketAddr,
}

pub const DNS_DEFAULT_PORT: u16 = 53;

/// Parses an `ip[:port]` upstream DNS entry, defaulting the port to 53.
pub fn parse_upstream_dns(entry: &str) -> Option<DnsServer> {
    let address = match entry.parse::<SocketAddr>() {
        Ok(address) => address,
        Err(_) => SocketAddr::new(entry.parse::<IpAddr>().ok()?, DNS_DEFAULT_PORT),
    };

    Some(DnsServer::IpPort(IpDnsServer { address }))
}

/// The tunnel interface pushed to a client at init and on config changes.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Interface {
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub upstream_dns: Vec<DnsServer>,
}

/// A single relay as rendered towards clients and gateways.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Relay {
    Stun(Stun),
    Turn(Turn),
}

impl Relay {
    pub fn id(&self) -> RelayId {
        match self {
            Relay::Stun(stun) => stun.id,
            Relay::Turn(turn) => turn.id,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Stun {
    pub id: RelayId,
    pub addr: SocketAddr,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Turn {
    pub id: RelayId,
    /// Expiry of the username / password pair, unix seconds.
    #[serde(with = "ts_seconds")]
    pub expires_at: DateTime<Utc>,
    pub addr: SocketAddr,
    pub username: String,
    pub password: String,
}

/// An incremental update to the set of usable relays.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct RelaysPresence {
    /// These relays disconnected; peers must stop using them.
    pub disconnected_ids: Vec<RelayId>,
    /// The currently online set.
    pub connected: Vec<Relay>,
}

pub use portal_model::{Filter, Filters, PortRange};
